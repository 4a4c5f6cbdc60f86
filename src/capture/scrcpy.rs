//! scrcpy capture session.
//!
//! Handshake, streaming loop and reconnection for one device. The session
//! owns three sockets on the forwarded port, opened in this order:
//!
//! 1. video: dummy byte, then the H.264 stream (framed or raw)
//! 2. trigger: connect only; its arrival makes the server start encoding
//! 3. control: dummy byte, then write-only control messages (optional)
//!
//! A single reader task owns the video and trigger sockets. The control
//! socket lives in the [`ControlChannel`] so callers can adjust the bitrate
//! while the reader is blocked on the video socket.

use super::control::{BitrateControl, ControlChannel};
use super::protocol::{
    server_command, DeviceMeta, FrameHeader, CONTROL_CONNECT_TIMEOUT, CONTROL_DUMMY_TIMEOUT,
    DEVICE_META_LEN, DUMMY_BYTE_TIMEOUT, FRAME_HEADER_LEN, META_TIMEOUT, RAW_DEVICE_NAME,
    RAW_FALLBACK_SIZE, RAW_PROBE_MAX, RAW_PROBE_MIN, TRIGGER_CONNECT_TIMEOUT,
    VIDEO_CONNECT_TIMEOUT,
};
use super::{
    read_lock, try_deliver, write_lock, CaptureOptions, CaptureState, CaptureStats,
    StatsTracker, StreamMode,
};
use crate::adb::DeviceBridge;
use crate::frame::{Frame, FrameFormat};
use crate::nal::{split_annex_b, NalFramer, NalType, NalUnit};
use crate::pool::BufferPool;
use crate::sps::parse_sps;
use anyhow::{bail, Context, Result};
use bytes::Bytes;
use rand::Rng;
use std::io;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Upper bound on the reconnection delay.
pub const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

/// Consecutive read timeouts treated as a lost connection.
pub const STALL_TIMEOUTS: u32 = 6;

/// Raw mode read size.
const RAW_READ_SIZE: usize = 256 * 1024;

/// `base * 2^(attempt-1)`, capped at [`MAX_RECONNECT_DELAY`]. `attempt` is 1-based.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    base.saturating_mul(1 << exp).min(MAX_RECONNECT_DELAY)
}

/// [`backoff_delay`] plus up to 20% random jitter, still capped.
pub fn backoff_with_jitter(base: Duration, attempt: u32) -> Duration {
    let delay = backoff_delay(base, attempt);
    let jitter = delay.mul_f64(rand::rng().random_range(0.0..=0.2));
    (delay + jitter).min(MAX_RECONNECT_DELAY)
}

// ============================================================================
// Shared session state
// ============================================================================

#[derive(Debug)]
struct SessionState {
    state: CaptureState,
    width: u32,
    height: u32,
    device_name: String,
    codec: String,
    sps: Option<Bytes>,
    pps: Option<Bytes>,
    reconnect_attempts: u32,
    tracker: StatsTracker,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            state: CaptureState::Idle,
            width: 0,
            height: 0,
            device_name: String::new(),
            codec: String::new(),
            sps: None,
            pps: None,
            reconnect_attempts: 0,
            tracker: StatsTracker::default(),
        }
    }
}

/// State shared between the session handle and its reader task.
#[derive(Debug, Default)]
struct Shared {
    session: RwLock<SessionState>,
    server: Mutex<Option<Child>>,
}

impl Shared {
    fn set_state(&self, state: CaptureState) {
        write_lock(&self.session).state = state;
    }

    fn state(&self) -> CaptureState {
        read_lock(&self.session).state
    }

    fn apply_stream_info(&self, info: &StreamInfo) {
        let mut session = write_lock(&self.session);
        session.device_name = info.name.clone();
        session.codec = info.codec.clone();
        session.width = info.width;
        session.height = info.height;
    }

    fn resolution(&self) -> (u32, u32) {
        let session = read_lock(&self.session);
        (session.width, session.height)
    }

    /// Replace cached SPS/PPS with any found in `units`. With
    /// `update_resolution`, a parseable SPS also sets the frame size.
    fn update_parameter_sets(&self, units: &[NalUnit], update_resolution: bool) {
        let mut session = write_lock(&self.session);
        for unit in units {
            match unit.nal_type {
                NalType::Sps => {
                    session.sps = Some(unit.data.clone());
                    if update_resolution {
                        match parse_sps(&unit.data) {
                            Ok(info) => {
                                session.width = info.width;
                                session.height = info.height;
                            }
                            Err(e) => tracing::debug!("Ignoring unparseable SPS: {}", e),
                        }
                    }
                }
                NalType::Pps => session.pps = Some(unit.data.clone()),
                _ => {}
            }
        }
    }

    fn set_server(&self, child: Option<Child>) {
        let previous = std::mem::replace(
            &mut *self.server.lock().unwrap_or_else(PoisonError::into_inner),
            child,
        );
        if let Some(mut old) = previous {
            let _ = old.start_kill();
        }
    }

    fn kill_server(&self) {
        self.set_server(None);
    }
}

// ============================================================================
// Handshake
// ============================================================================

/// What the video socket told us before the stream started.
#[derive(Debug, Clone)]
struct StreamInfo {
    name: String,
    codec: String,
    width: u32,
    height: u32,
    /// Raw mode: bytes read while probing, not yet framed.
    initial: Vec<u8>,
}

/// Sockets owned by the reader task.
struct Connection {
    video: TcpStream,
    trigger: Option<TcpStream>,
    initial: Vec<u8>,
}

struct Established {
    connection: Connection,
    info: StreamInfo,
    server: Option<Child>,
}

/// Forward, launch and connect (handshake steps 2-7). On failure the server
/// is killed and the forward removed before returning.
async fn establish(
    options: &CaptureOptions,
    bridge: &DeviceBridge,
    control: &ControlChannel,
) -> Result<Established> {
    let port = options.local_port;
    bridge.setup_forward(port).await?;

    let command = server_command(options.bitrate, options.max_size, options.max_fps, options.mode);
    let mut server = match bridge.launch_server(&command) {
        Ok(server) => server,
        Err(e) => {
            bridge.remove_forward(port).await;
            return Err(e);
        }
    };

    if server.is_some() {
        tokio::time::sleep(options.server_settle).await;
    }

    match connect_streams(options, control).await {
        Ok((connection, info)) => Ok(Established {
            connection,
            info,
            server,
        }),
        Err(e) => {
            if let Some(child) = server.as_mut() {
                let _ = child.start_kill();
            }
            bridge.remove_forward(port).await;
            Err(e)
        }
    }
}

async fn connect_streams(
    options: &CaptureOptions,
    control: &ControlChannel,
) -> Result<(Connection, StreamInfo)> {
    let addr = ("127.0.0.1", options.local_port);

    let mut video = tokio::time::timeout(VIDEO_CONNECT_TIMEOUT, TcpStream::connect(addr))
        .await
        .context("video socket connect timed out")?
        .context("failed to connect video socket")?;
    let _ = video.set_nodelay(true);

    let mut dummy = [0u8; 1];
    tokio::time::timeout(DUMMY_BYTE_TIMEOUT, video.read_exact(&mut dummy))
        .await
        .context("timed out waiting for dummy byte")?
        .context("failed to read dummy byte")?;
    tracing::debug!("Video socket connected, dummy byte 0x{:02x}", dummy[0]);

    let trigger = match tokio::time::timeout(TRIGGER_CONNECT_TIMEOUT, TcpStream::connect(addr)).await
    {
        Ok(Ok(stream)) => {
            tracing::debug!("Trigger socket connected");
            Some(stream)
        }
        Ok(Err(e)) => {
            tracing::warn!("Trigger socket failed ({}), server may already be encoding", e);
            None
        }
        Err(_) => {
            tracing::warn!("Trigger socket connect timed out, server may already be encoding");
            None
        }
    };

    let mut info = tokio::time::timeout(META_TIMEOUT, read_stream_info(&mut video, options.mode))
        .await
        .context("timed out reading stream header")??;
    tracing::info!(
        "Stream header: device '{}', codec {}, {}x{}",
        info.name,
        info.codec,
        info.width,
        info.height
    );

    connect_control(options.local_port, control).await;

    let initial = std::mem::take(&mut info.initial);
    Ok((
        Connection {
            video,
            trigger,
            initial,
        },
        info,
    ))
}

async fn read_stream_info(video: &mut TcpStream, mode: StreamMode) -> Result<StreamInfo> {
    match mode {
        StreamMode::Framed => {
            let mut buf = [0u8; DEVICE_META_LEN];
            video
                .read_exact(&mut buf)
                .await
                .context("failed to read device meta")?;
            let meta = DeviceMeta::parse(&buf);
            if meta.width == 0 || meta.height == 0 {
                bail!("device meta reports invalid size {}x{}", meta.width, meta.height);
            }
            Ok(StreamInfo {
                codec: meta.codec_name(),
                name: meta.name,
                width: meta.width,
                height: meta.height,
                initial: Vec::new(),
            })
        }
        StreamMode::Raw => {
            let mut buf = vec![0u8; RAW_PROBE_MAX];
            let mut filled = 0;
            while filled < RAW_PROBE_MIN {
                let n = video
                    .read(&mut buf[filled..])
                    .await
                    .context("failed to read initial stream data")?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            if filled == 0 {
                bail!("video stream closed before any data");
            }
            buf.truncate(filled);

            let units = split_annex_b(&Bytes::copy_from_slice(&buf));
            let probed = units
                .iter()
                .filter(|u| u.nal_type == NalType::Sps)
                .find_map(|u| parse_sps(&u.data).ok());
            let (width, height) = match probed {
                Some(sps) => (sps.width, sps.height),
                None => {
                    tracing::warn!(
                        "No SPS in first {} bytes, assuming {}x{}",
                        filled,
                        RAW_FALLBACK_SIZE.0,
                        RAW_FALLBACK_SIZE.1
                    );
                    RAW_FALLBACK_SIZE
                }
            };
            Ok(StreamInfo {
                name: RAW_DEVICE_NAME.to_string(),
                codec: "h264".to_string(),
                width,
                height,
                initial: buf,
            })
        }
    }
}

/// Open the control socket. Failure only disables control features.
async fn connect_control(port: u16, control: &ControlChannel) {
    let result = async {
        let mut stream =
            tokio::time::timeout(CONTROL_CONNECT_TIMEOUT, TcpStream::connect(("127.0.0.1", port)))
                .await
                .context("connect timed out")??;
        let mut dummy = [0u8; 1];
        tokio::time::timeout(CONTROL_DUMMY_TIMEOUT, stream.read_exact(&mut dummy))
            .await
            .context("dummy byte timed out")??;
        Ok::<_, anyhow::Error>(stream)
    }
    .await;

    match result {
        Ok(stream) => {
            control.attach(stream).await;
            tracing::debug!("Control socket connected");
        }
        Err(e) => {
            control.detach().await;
            tracing::warn!("Control socket unavailable, bitrate control disabled: {:#}", e);
        }
    }
}

// ============================================================================
// Reader task
// ============================================================================

enum StreamEnd {
    Cancelled,
    Lost(String),
}

enum ReconnectOutcome {
    Reconnected(Connection),
    Cancelled,
    Exhausted,
}

enum Packet {
    Complete(FrameHeader, Vec<u8>),
    Invalid(FrameHeader),
}

/// Incremental framed-mode packet parser. Partial headers and payloads
/// survive a cancelled read, so it can be polled under a timeout.
#[derive(Default)]
struct PacketReader {
    header: [u8; FRAME_HEADER_LEN],
    header_filled: usize,
    pending: Option<FrameHeader>,
    payload: Vec<u8>,
    payload_filled: usize,
}

impl PacketReader {
    async fn next(&mut self, stream: &mut TcpStream, pool: &BufferPool) -> io::Result<Packet> {
        loop {
            if let Some(header) = self.pending {
                if self.payload_filled == self.payload.len() {
                    self.pending = None;
                    self.header_filled = 0;
                    self.payload_filled = 0;
                    return Ok(Packet::Complete(header, std::mem::take(&mut self.payload)));
                }
                let n = stream.read(&mut self.payload[self.payload_filled..]).await?;
                if n == 0 {
                    return Err(closed());
                }
                self.payload_filled += n;
                continue;
            }

            let n = stream.read(&mut self.header[self.header_filled..]).await?;
            if n == 0 {
                return Err(closed());
            }
            self.header_filled += n;
            if self.header_filled < FRAME_HEADER_LEN {
                continue;
            }

            let header = FrameHeader::parse(&self.header);
            if header.validate().is_err() {
                self.header_filled = 0;
                return Ok(Packet::Invalid(header));
            }
            self.payload = pool.acquire(header.size as usize);
            self.payload_filled = 0;
            self.pending = Some(header);
        }
    }
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, "video stream closed")
}

struct Reader {
    options: CaptureOptions,
    bridge: DeviceBridge,
    pool: Arc<BufferPool>,
    shared: Arc<Shared>,
    control: BitrateControl,
    tx: mpsc::Sender<Frame>,
    cancel: CancellationToken,
}

impl Reader {
    async fn run(self, connection: Connection) {
        let mut next = Some(connection);
        while let Some(Connection {
            mut video,
            trigger,
            initial,
        }) = next.take()
        {
            let end = match self.options.mode {
                StreamMode::Framed => self.stream_framed(&mut video).await,
                StreamMode::Raw => self.stream_raw(&mut video, initial).await,
            };
            drop(video);
            drop(trigger);

            let reason = match end {
                StreamEnd::Cancelled => break,
                StreamEnd::Lost(reason) => reason,
            };
            tracing::warn!("Video stream lost on {}: {}", self.options.device_id, reason);

            if !self.options.reconnect.enabled {
                self.shutdown_after_loss().await;
                break;
            }
            match self.reconnect().await {
                ReconnectOutcome::Reconnected(connection) => next = Some(connection),
                ReconnectOutcome::Cancelled => break,
                ReconnectOutcome::Exhausted => self.shutdown_after_loss().await,
            }
        }
        tracing::debug!("Reader task for {} finished", self.options.device_id);
        // Dropping `self.tx` here closes the frame queue
    }

    async fn stream_framed(&self, video: &mut TcpStream) -> StreamEnd {
        let mut packets = PacketReader::default();
        let mut idle = 0u32;
        loop {
            let read = tokio::select! {
                _ = self.cancel.cancelled() => return StreamEnd::Cancelled,
                r = tokio::time::timeout(self.options.read_timeout, packets.next(video, &self.pool)) => r,
            };
            match read {
                Err(_) => {
                    idle += 1;
                    if idle >= STALL_TIMEOUTS {
                        return StreamEnd::Lost(format!(
                            "no data for {:?}",
                            self.options.read_timeout * STALL_TIMEOUTS
                        ));
                    }
                }
                Ok(Err(e)) => return StreamEnd::Lost(e.to_string()),
                Ok(Ok(Packet::Invalid(header))) => {
                    idle = 0;
                    write_lock(&self.shared.session).tracker.record_error();
                    tracing::warn!("Invalid packet size {}, skipping", header.size);
                }
                Ok(Ok(Packet::Complete(header, payload))) => {
                    idle = 0;
                    self.handle_packet(header, payload);
                }
            }
        }
    }

    fn handle_packet(&self, header: FrameHeader, payload: Vec<u8>) {
        if header.config {
            let units = split_annex_b(&Bytes::copy_from_slice(&payload));
            self.shared.update_parameter_sets(&units, false);
            tracing::debug!("Codec config: {} bytes, {} NAL units", payload.len(), units.len());
        }

        let (width, height) = self.shared.resolution();
        let mut frame = Frame::pooled(payload, Arc::clone(&self.pool), FrameFormat::H264);
        frame.pts = Some(header.pts);
        frame.keyframe = header.keyframe;
        frame.config = header.config;
        frame.width = width;
        frame.height = height;
        frame.duration = self.options.frame_duration();
        self.deliver(frame);
    }

    async fn stream_raw(&self, video: &mut TcpStream, initial: Vec<u8>) -> StreamEnd {
        let mut framer = NalFramer::new();
        framer.feed(&initial);
        self.emit_units(framer.extract());

        let mut buf = vec![0u8; RAW_READ_SIZE];
        let mut idle = 0u32;
        loop {
            let read = tokio::select! {
                _ = self.cancel.cancelled() => return StreamEnd::Cancelled,
                r = tokio::time::timeout(self.options.read_timeout, video.read(&mut buf)) => r,
            };
            match read {
                Err(_) => {
                    idle += 1;
                    if idle >= STALL_TIMEOUTS {
                        return StreamEnd::Lost(format!(
                            "no data for {:?}",
                            self.options.read_timeout * STALL_TIMEOUTS
                        ));
                    }
                }
                Ok(Ok(0)) => {
                    self.emit_units(framer.flush().into_iter().collect());
                    return StreamEnd::Lost("video stream closed".to_string());
                }
                Ok(Ok(n)) => {
                    idle = 0;
                    framer.feed(&buf[..n]);
                    self.emit_units(framer.extract());
                }
                Ok(Err(e)) => return StreamEnd::Lost(e.to_string()),
            }
        }
    }

    fn emit_units(&self, units: Vec<NalUnit>) {
        if units.is_empty() {
            return;
        }
        if units.iter().any(|u| u.nal_type.is_parameter_set()) {
            self.shared.update_parameter_sets(&units, true);
        }
        let (width, height) = self.shared.resolution();
        for unit in units {
            let keyframe = unit.is_keyframe();
            let config = unit.nal_type.is_parameter_set();
            let mut frame = Frame::shared(unit.data, FrameFormat::H264);
            frame.keyframe = keyframe;
            frame.config = config;
            frame.width = width;
            frame.height = height;
            frame.duration = self.options.frame_duration();
            self.deliver(frame);
        }
    }

    fn deliver(&self, frame: Frame) {
        let len = frame.len();
        write_lock(&self.shared.session).tracker.record_frame(len);
        if !try_deliver(&self.tx, frame) {
            write_lock(&self.shared.session).tracker.record_drop();
        }
    }

    async fn reconnect(&self) -> ReconnectOutcome {
        let policy = &self.options.reconnect;
        let port = self.options.local_port;
        self.shared.set_state(CaptureState::Reconnecting);
        self.control.detach().await;

        let mut attempt = 0u32;
        loop {
            if policy.max_attempts > 0 && attempt >= policy.max_attempts {
                tracing::error!(
                    "Giving up on {} after {} reconnection attempts",
                    self.options.device_id,
                    attempt
                );
                return ReconnectOutcome::Exhausted;
            }
            attempt += 1;
            write_lock(&self.shared.session).reconnect_attempts = attempt;

            let delay = backoff_with_jitter(policy.base_delay, attempt);
            tracing::info!(
                "Reconnecting to {} in {:?} (attempt {})",
                self.options.device_id,
                delay,
                attempt
            );
            tokio::select! {
                _ = self.cancel.cancelled() => return ReconnectOutcome::Cancelled,
                _ = tokio::time::sleep(delay) => {}
            }

            self.shared.kill_server();
            self.bridge.remove_forward(port).await;

            let result = tokio::select! {
                _ = self.cancel.cancelled() => return ReconnectOutcome::Cancelled,
                r = establish(&self.options, &self.bridge, &self.control) => r,
            };
            match result {
                Ok(established) => {
                    self.shared.apply_stream_info(&established.info);
                    self.shared.set_server(established.server);
                    {
                        let mut session = write_lock(&self.shared.session);
                        session.reconnect_attempts = 0;
                        session.tracker.record_reconnect();
                        session.state = CaptureState::Streaming;
                    }
                    policy.notify(true, attempt);
                    tracing::info!(
                        "Reconnected to {} on attempt {}",
                        self.options.device_id,
                        attempt
                    );
                    return ReconnectOutcome::Reconnected(established.connection);
                }
                Err(e) => {
                    tracing::warn!("Reconnection attempt {} failed: {:#}", attempt, e);
                    policy.notify(false, attempt);
                }
            }
        }
    }

    async fn shutdown_after_loss(&self) {
        self.shared.set_state(CaptureState::Stopped);
        self.control.detach().await;
        self.shared.kill_server();
        self.bridge.remove_forward(self.options.local_port).await;
    }
}

// ============================================================================
// Session handle
// ============================================================================

/// A capture session against one device.
pub struct ScrcpyCapture {
    options: CaptureOptions,
    bridge: DeviceBridge,
    shared: Arc<Shared>,
    control: BitrateControl,
    cancel: CancellationToken,
    reader: Option<JoinHandle<()>>,
    frames: Option<mpsc::Receiver<Frame>>,
    started_at: Instant,
}

impl ScrcpyCapture {
    /// Run the full handshake and start streaming.
    pub async fn start(
        options: CaptureOptions,
        bridge: DeviceBridge,
        pool: Arc<BufferPool>,
    ) -> Result<Self> {
        options.validate()?;
        tracing::info!(
            "Starting scrcpy capture on {} (port {}, {:?} mode, {} bps, max {} px @ {} fps)",
            options.device_id,
            options.local_port,
            options.mode,
            options.bitrate,
            options.max_size,
            options.max_fps
        );

        let shared = Arc::new(Shared::default());
        let control: BitrateControl = Arc::new(ControlChannel::new(options.bitrate));
        shared.set_state(CaptureState::Handshaking);

        let established = async {
            bridge
                .push_server(&options.server_path)
                .await
                .context("failed to push capture server")?;
            establish(&options, &bridge, &control).await
        }
        .await;
        let established = match established {
            Ok(e) => e,
            Err(e) => {
                shared.set_state(CaptureState::Stopped);
                return Err(e);
            }
        };

        shared.apply_stream_info(&established.info);
        shared.set_server(established.server);

        let (tx, rx) = mpsc::channel(options.queue_size.max(1));
        let cancel = CancellationToken::new();
        shared.set_state(CaptureState::Streaming);

        let reader = Reader {
            options: options.clone(),
            bridge: bridge.clone(),
            pool,
            shared: Arc::clone(&shared),
            control: Arc::clone(&control),
            tx,
            cancel: cancel.clone(),
        };
        let handle = tokio::spawn(reader.run(established.connection));

        Ok(Self {
            options,
            bridge,
            shared,
            control,
            cancel,
            reader: Some(handle),
            frames: Some(rx),
            started_at: Instant::now(),
        })
    }

    /// Stop streaming and release all device resources.
    pub async fn stop(&mut self) -> Result<()> {
        let Some(reader) = self.reader.take() else {
            bail!("capture not running");
        };
        self.cancel.cancel();
        if let Err(e) = reader.await {
            tracing::warn!("Reader task ended abnormally: {}", e);
        }

        self.control.detach().await;
        self.shared.kill_server();
        self.bridge.remove_forward(self.options.local_port).await;
        self.frames.take();
        self.shared.set_state(CaptureState::Stopped);

        let stats = self.stats();
        tracing::info!(
            "Capture on {} stopped after {:.1}s: {} frames, {} dropped, {} errors, {} reconnects",
            self.options.device_id,
            self.started_at.elapsed().as_secs_f64(),
            stats.frames_captured,
            stats.frames_dropped,
            stats.errors,
            stats.reconnects
        );
        Ok(())
    }

    /// Frame queue receiver. Only the first call returns it.
    pub fn take_frames(&mut self) -> Option<mpsc::Receiver<Frame>> {
        self.frames.take()
    }

    pub fn state(&self) -> CaptureState {
        self.shared.state()
    }

    pub fn is_running(&self) -> bool {
        matches!(
            self.state(),
            CaptureState::Streaming | CaptureState::Reconnecting
        )
    }

    pub fn is_reconnecting(&self) -> bool {
        self.state() == CaptureState::Reconnecting
    }

    pub fn stats(&self) -> CaptureStats {
        read_lock(&self.shared.session).tracker.snapshot()
    }

    pub fn resolution(&self) -> (u32, u32) {
        self.shared.resolution()
    }

    pub fn device_name(&self) -> String {
        read_lock(&self.shared.session).device_name.clone()
    }

    pub fn codec_name(&self) -> String {
        read_lock(&self.shared.session).codec.clone()
    }

    /// Most recent SPS and PPS, each including its start code.
    pub fn parameter_sets(&self) -> (Option<Bytes>, Option<Bytes>) {
        let session = read_lock(&self.shared.session);
        (session.sps.clone(), session.pps.clone())
    }

    /// SPS followed by PPS in Annex-B form, once both are known.
    pub fn codec_extra_data(&self) -> Option<Vec<u8>> {
        let (sps, pps) = self.parameter_sets();
        super::codec_extra_data(sps.as_ref(), pps.as_ref())
    }

    /// Attempt counter of the reconnection in progress (0 when streaming).
    pub fn reconnect_attempts(&self) -> u32 {
        read_lock(&self.shared.session).reconnect_attempts
    }

    pub fn current_bitrate(&self) -> u32 {
        self.control.current_bitrate()
    }

    pub fn bitrate_changes(&self) -> u64 {
        self.control.bitrate_changes()
    }

    /// Shared handle for adjusting the encoder while streaming.
    pub fn bitrate_control(&self) -> BitrateControl {
        Arc::clone(&self.control)
    }

    fn ensure_streaming(&self) -> Result<()> {
        if self.state() != CaptureState::Streaming {
            bail!("capture not running");
        }
        Ok(())
    }

    pub async fn set_bitrate(&self, bps: u32) -> Result<u32> {
        self.ensure_streaming()?;
        self.control.set_bitrate(bps).await
    }

    pub async fn set_quality(&self, quality: u8) -> Result<u32> {
        self.ensure_streaming()?;
        self.control.set_quality(quality).await
    }

    pub async fn request_keyframe(&self) -> Result<()> {
        self.ensure_streaming()?;
        self.control.request_keyframe().await
    }
}

impl Drop for ScrcpyCapture {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
