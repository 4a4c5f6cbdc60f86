//! Screen capture backends.
//!
//! Three ways of getting pixels off a device, behind one [`CaptureBackend`]
//! enum:
//!
//! - [`ScrcpyCapture`]: the scrcpy server over forwarded TCP sockets (H.264,
//!   adaptive bitrate, reconnection)
//! - [`ScreenRecordCapture`]: `screenrecord` streaming H.264 over adb stdout
//! - [`ScreencapCapture`]: periodic `screencap` PNG snapshots
//!
//! All backends deliver [`Frame`]s through a bounded queue that drops frames
//! when the consumer falls behind.

pub mod control;
pub mod protocol;
pub mod scrcpy;
pub mod screencap;
pub mod screenrecord;

pub use control::{BitrateControl, ControlChannel};
pub use scrcpy::ScrcpyCapture;
pub use screencap::ScreencapCapture;
pub use screenrecord::ScreenRecordCapture;

use crate::adb::DeviceBridge;
use crate::frame::{Frame, FrameFormat};
use crate::pool::BufferPool;
use anyhow::{bail, Result};
use bytes::Bytes;
use serde::Serialize;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

// ============================================================================
// Configuration
// ============================================================================

/// Wire mode of the scrcpy video socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamMode {
    /// Device meta and per-packet headers.
    #[default]
    Framed,
    /// Plain Annex-B, no headers.
    Raw,
}

/// Which backend to start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendKind {
    #[default]
    Scrcpy,
    ScreenRecord,
    Screencap,
}

impl FromStr for BackendKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "scrcpy" => Ok(BackendKind::Scrcpy),
            "screenrecord" => Ok(BackendKind::ScreenRecord),
            "screencap" => Ok(BackendKind::Screencap),
            other => bail!("unknown capture backend: {}", other),
        }
    }
}

/// Called after each reconnection attempt with `(succeeded, attempt)`.
pub type ReconnectObserver = Arc<dyn Fn(bool, u32) + Send + Sync>;

/// Reconnection behaviour of a streaming session.
#[derive(Clone)]
pub struct ReconnectPolicy {
    pub enabled: bool,
    /// Attempts before giving up. 0 means unlimited.
    pub max_attempts: u32,
    /// Delay before the first attempt; doubles per attempt up to 30 s.
    pub base_delay: Duration,
    pub observer: Option<ReconnectObserver>,
}

impl std::fmt::Debug for ReconnectPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconnectPolicy")
            .field("enabled", &self.enabled)
            .field("max_attempts", &self.max_attempts)
            .field("base_delay", &self.base_delay)
            .field("observer", &self.observer.is_some())
            .finish()
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 5,
            base_delay: Duration::from_secs(2),
            observer: None,
        }
    }
}

impl ReconnectPolicy {
    /// Never reconnect.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    #[must_use]
    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    #[must_use]
    pub fn observer(mut self, observer: impl Fn(bool, u32) + Send + Sync + 'static) -> Self {
        self.observer = Some(Arc::new(observer));
        self
    }

    pub(crate) fn notify(&self, success: bool, attempt: u32) {
        if let Some(observer) = &self.observer {
            observer(success, attempt);
        }
    }
}

/// Options shared by all capture backends.
#[derive(Debug, Clone)]
pub struct CaptureOptions {
    pub device_id: String,
    /// Longest side in pixels (0 keeps the native size).
    pub max_size: u32,
    /// Initial video bitrate in bps.
    pub bitrate: u32,
    pub max_fps: u32,
    /// Local TCP port forwarded to the device.
    pub local_port: u16,
    pub mode: StreamMode,
    /// Output queue capacity in frames.
    pub queue_size: usize,
    /// Local path of the scrcpy server jar.
    pub server_path: PathBuf,
    /// Time given to the server to start listening after launch.
    pub server_settle: Duration,
    /// Per-read deadline on the video socket.
    pub read_timeout: Duration,
    pub reconnect: ReconnectPolicy,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            device_id: String::new(),
            max_size: 720,
            bitrate: 4_000_000,
            max_fps: 30,
            local_port: 27183,
            mode: StreamMode::Framed,
            queue_size: 30,
            server_path: PathBuf::from("scrcpy-server"),
            server_settle: Duration::from_secs(2),
            read_timeout: Duration::from_secs(5),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl CaptureOptions {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn max_size(mut self, max_size: u32) -> Self {
        self.max_size = max_size;
        self
    }

    #[must_use]
    pub fn bitrate(mut self, bps: u32) -> Self {
        self.bitrate = bps;
        self
    }

    #[must_use]
    pub fn max_fps(mut self, fps: u32) -> Self {
        self.max_fps = fps;
        self
    }

    #[must_use]
    pub fn local_port(mut self, port: u16) -> Self {
        self.local_port = port;
        self
    }

    #[must_use]
    pub fn mode(mut self, mode: StreamMode) -> Self {
        self.mode = mode;
        self
    }

    #[must_use]
    pub fn queue_size(mut self, size: usize) -> Self {
        self.queue_size = size;
        self
    }

    #[must_use]
    pub fn server_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.server_path = path.into();
        self
    }

    #[must_use]
    pub fn server_settle(mut self, delay: Duration) -> Self {
        self.server_settle = delay;
        self
    }

    #[must_use]
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    #[must_use]
    pub fn reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    /// Nominal duration of one frame at `max_fps`.
    pub fn frame_duration(&self) -> Duration {
        Duration::from_secs(1) / self.max_fps.max(1)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.device_id.is_empty() {
            bail!("device id is required");
        }
        Ok(())
    }
}

// ============================================================================
// State and statistics
// ============================================================================

/// Lifecycle of a capture session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureState {
    Idle,
    Handshaking,
    Streaming,
    Reconnecting,
    Stopped,
}

/// Counters reported by every backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CaptureStats {
    pub frames_captured: u64,
    pub frames_dropped: u64,
    pub bytes_captured: u64,
    pub errors: u64,
    pub reconnects: u64,
    pub current_fps: f64,
    pub average_fps: f64,
    pub average_frame_size: f64,
}

/// Frames-per-second over one-second windows.
///
/// The current rate is recomputed when a window of at least one second
/// closes; the average is frames over the summed length of closed windows.
#[derive(Debug, Clone)]
pub struct FpsCounter {
    window_start: Instant,
    window_frames: u64,
    closed_frames: u64,
    closed_time: Duration,
}

impl Default for FpsCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl FpsCounter {
    pub fn new() -> Self {
        Self::starting_at(Instant::now())
    }

    pub fn starting_at(now: Instant) -> Self {
        Self {
            window_start: now,
            window_frames: 0,
            closed_frames: 0,
            closed_time: Duration::ZERO,
        }
    }

    /// Count one frame.
    pub fn tick(&mut self, stats: &mut CaptureStats) {
        self.tick_at(Instant::now(), stats);
    }

    pub fn tick_at(&mut self, now: Instant, stats: &mut CaptureStats) {
        self.window_frames += 1;
        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed >= Duration::from_secs(1) {
            stats.current_fps = self.window_frames as f64 / elapsed.as_secs_f64();
            self.closed_frames += self.window_frames;
            self.closed_time += elapsed;
            stats.average_fps = self.closed_frames as f64 / self.closed_time.as_secs_f64();
            self.window_frames = 0;
            self.window_start = now;
        }
    }
}

/// Stats plus the FPS window that feeds them.
#[derive(Debug, Clone, Default)]
pub(crate) struct StatsTracker {
    stats: CaptureStats,
    fps: FpsCounter,
}

impl StatsTracker {
    pub(crate) fn record_frame(&mut self, len: usize) {
        self.stats.frames_captured += 1;
        self.stats.bytes_captured += len as u64;
        self.fps.tick(&mut self.stats);
    }

    pub(crate) fn record_drop(&mut self) {
        self.stats.frames_dropped += 1;
    }

    pub(crate) fn record_error(&mut self) {
        self.stats.errors += 1;
    }

    pub(crate) fn record_reconnect(&mut self) {
        self.stats.reconnects += 1;
    }

    pub(crate) fn snapshot(&self) -> CaptureStats {
        let mut stats = self.stats.clone();
        if stats.frames_captured > 0 {
            stats.average_frame_size = stats.bytes_captured as f64 / stats.frames_captured as f64;
        }
        stats
    }
}

pub(crate) fn read_lock<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write_lock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// Push without waiting. Returns false when the frame was dropped because the
/// queue is full or the consumer is gone.
pub(crate) fn try_deliver(tx: &mpsc::Sender<Frame>, frame: Frame) -> bool {
    tx.try_send(frame).is_ok()
}

/// Annex-B concatenation of SPS and PPS, for decoders that want extradata.
pub fn codec_extra_data(sps: Option<&Bytes>, pps: Option<&Bytes>) -> Option<Vec<u8>> {
    let (sps, pps) = (sps?, pps?);
    let mut out = Vec::with_capacity(sps.len() + pps.len() + 8);
    for unit in [sps, pps] {
        if !unit.starts_with(&[0, 0, 1]) && !unit.starts_with(&[0, 0, 0, 1]) {
            out.extend_from_slice(&[0, 0, 0, 1]);
        }
        out.extend_from_slice(unit);
    }
    Some(out)
}

// ============================================================================
// Backend selection
// ============================================================================

/// A running capture backend.
pub enum CaptureBackend {
    Scrcpy(ScrcpyCapture),
    ScreenRecord(ScreenRecordCapture),
    Screencap(ScreencapCapture),
}

impl CaptureBackend {
    /// Start the backend selected by `kind`.
    pub async fn start(
        kind: BackendKind,
        options: CaptureOptions,
        bridge: DeviceBridge,
        pool: Arc<BufferPool>,
    ) -> Result<Self> {
        Ok(match kind {
            BackendKind::Scrcpy => {
                CaptureBackend::Scrcpy(ScrcpyCapture::start(options, bridge, pool).await?)
            }
            BackendKind::ScreenRecord => {
                CaptureBackend::ScreenRecord(ScreenRecordCapture::start(options, bridge).await?)
            }
            BackendKind::Screencap => {
                CaptureBackend::Screencap(ScreencapCapture::start(options, bridge).await?)
            }
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            CaptureBackend::Scrcpy(_) => "scrcpy",
            CaptureBackend::ScreenRecord(_) => "screenrecord",
            CaptureBackend::Screencap(_) => "screencap",
        }
    }

    pub fn frame_format(&self) -> FrameFormat {
        match self {
            CaptureBackend::Screencap(_) => FrameFormat::Png,
            _ => FrameFormat::H264,
        }
    }

    /// Frame queue receiver. Only the first call returns it.
    pub fn take_frames(&mut self) -> Option<mpsc::Receiver<Frame>> {
        match self {
            CaptureBackend::Scrcpy(c) => c.take_frames(),
            CaptureBackend::ScreenRecord(c) => c.take_frames(),
            CaptureBackend::Screencap(c) => c.take_frames(),
        }
    }

    pub fn stats(&self) -> CaptureStats {
        match self {
            CaptureBackend::Scrcpy(c) => c.stats(),
            CaptureBackend::ScreenRecord(c) => c.stats(),
            CaptureBackend::Screencap(c) => c.stats(),
        }
    }

    pub fn resolution(&self) -> (u32, u32) {
        match self {
            CaptureBackend::Scrcpy(c) => c.resolution(),
            CaptureBackend::ScreenRecord(c) => c.resolution(),
            CaptureBackend::Screencap(c) => c.resolution(),
        }
    }

    /// Cached SPS and PPS (H.264 backends only).
    pub fn parameter_sets(&self) -> (Option<Bytes>, Option<Bytes>) {
        match self {
            CaptureBackend::Scrcpy(c) => c.parameter_sets(),
            CaptureBackend::ScreenRecord(c) => c.parameter_sets(),
            CaptureBackend::Screencap(_) => (None, None),
        }
    }

    /// Bitrate control, when the backend has a control channel.
    pub fn bitrate_control(&self) -> Option<BitrateControl> {
        match self {
            CaptureBackend::Scrcpy(c) => Some(c.bitrate_control()),
            _ => None,
        }
    }

    pub async fn stop(&mut self) -> Result<()> {
        match self {
            CaptureBackend::Scrcpy(c) => c.stop().await,
            CaptureBackend::ScreenRecord(c) => c.stop().await,
            CaptureBackend::Screencap(c) => c.stop().await,
        }
    }
}
