//! `screenrecord` backend: H.264 Annex-B over `adb shell` stdout.
//!
//! No handshake and no framing. The stream is cut into NAL units and each
//! unit becomes one frame. Resolution comes from the first parseable SPS.

use super::{
    read_lock, try_deliver, write_lock, CaptureOptions, CaptureState, CaptureStats,
    StatsTracker,
};
use crate::adb::DeviceBridge;
use crate::frame::{Frame, FrameFormat};
use crate::nal::{NalFramer, NalType, NalUnit};
use crate::sps::parse_sps;
use anyhow::{bail, Context, Result};
use bytes::Bytes;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const READ_SIZE: usize = 64 * 1024;

#[derive(Debug)]
struct RecordState {
    state: CaptureState,
    width: u32,
    height: u32,
    sps: Option<Bytes>,
    pps: Option<Bytes>,
    tracker: StatsTracker,
}

impl Default for RecordState {
    fn default() -> Self {
        Self {
            state: CaptureState::Idle,
            width: 0,
            height: 0,
            sps: None,
            pps: None,
            tracker: StatsTracker::default(),
        }
    }
}

/// Cuts a byte stream into frames and pushes them to the queue.
struct Pump {
    state: Arc<RwLock<RecordState>>,
    tx: mpsc::Sender<Frame>,
    cancel: CancellationToken,
    frame_duration: Duration,
}

impl Pump {
    async fn run<R: AsyncRead + Unpin>(self, mut source: R) {
        let mut framer = NalFramer::new();
        let mut buf = vec![0u8; READ_SIZE];
        loop {
            let read = tokio::select! {
                _ = self.cancel.cancelled() => break,
                r = source.read(&mut buf) => r,
            };
            match read {
                Ok(0) => {
                    if let Some(unit) = framer.flush() {
                        self.emit(vec![unit]);
                    }
                    tracing::info!("screenrecord stream ended");
                    break;
                }
                Ok(n) => {
                    framer.feed(&buf[..n]);
                    self.emit(framer.extract());
                }
                Err(e) => {
                    write_lock(&self.state).tracker.record_error();
                    tracing::warn!("screenrecord read failed: {}", e);
                    break;
                }
            }
        }
        write_lock(&self.state).state = CaptureState::Stopped;
    }

    fn emit(&self, units: Vec<NalUnit>) {
        for unit in units {
            let (width, height) = {
                let mut state = write_lock(&self.state);
                match unit.nal_type {
                    NalType::Sps => {
                        state.sps = Some(unit.data.clone());
                        if let Ok(info) = parse_sps(&unit.data) {
                            if (state.width, state.height) != (info.width, info.height) {
                                tracing::info!("screenrecord resolution {}x{}", info.width, info.height);
                            }
                            state.width = info.width;
                            state.height = info.height;
                        }
                    }
                    NalType::Pps => state.pps = Some(unit.data.clone()),
                    _ => {}
                }
                (state.width, state.height)
            };

            let keyframe = unit.is_keyframe();
            let config = unit.nal_type.is_parameter_set();
            let mut frame = Frame::shared(unit.data, FrameFormat::H264);
            frame.keyframe = keyframe;
            frame.config = config;
            frame.width = width;
            frame.height = height;
            frame.duration = self.frame_duration;

            let len = frame.len();
            write_lock(&self.state).tracker.record_frame(len);
            if !try_deliver(&self.tx, frame) {
                write_lock(&self.state).tracker.record_drop();
            }
        }
    }
}

/// `adb shell screenrecord --output-format=h264` as a frame source.
pub struct ScreenRecordCapture {
    state: Arc<RwLock<RecordState>>,
    child: Option<Child>,
    cancel: CancellationToken,
    reader: Option<JoinHandle<()>>,
    frames: Option<mpsc::Receiver<Frame>>,
}

impl ScreenRecordCapture {
    pub async fn start(options: CaptureOptions, bridge: DeviceBridge) -> Result<Self> {
        options.validate()?;
        let adb = bridge.require_adb()?;

        let bitrate = options.bitrate.to_string();
        let mut child = adb.spawn_shell_piped(&[
            "screenrecord",
            "--output-format=h264",
            "--bit-rate",
            &bitrate,
            "-",
        ])?;
        let stdout = child
            .stdout
            .take()
            .context("screenrecord stdout not captured")?;
        tracing::info!(
            "screenrecord started on {} at {} bps",
            options.device_id,
            options.bitrate
        );

        let mut capture = Self::from_source(stdout, &options);
        capture.child = Some(child);
        Ok(capture)
    }

    /// Stream from any Annex-B byte source.
    fn from_source<R>(source: R, options: &CaptureOptions) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let state = Arc::new(RwLock::new(RecordState {
            state: CaptureState::Streaming,
            ..Default::default()
        }));
        let (tx, rx) = mpsc::channel(options.queue_size.max(1));
        let cancel = CancellationToken::new();
        let pump = Pump {
            state: Arc::clone(&state),
            tx,
            cancel: cancel.clone(),
            frame_duration: options.frame_duration(),
        };
        let reader = tokio::spawn(pump.run(source));
        Self {
            state,
            child: None,
            cancel,
            reader: Some(reader),
            frames: Some(rx),
        }
    }

    pub async fn stop(&mut self) -> Result<()> {
        let Some(reader) = self.reader.take() else {
            bail!("capture not running");
        };
        self.cancel.cancel();
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill().await {
                tracing::debug!("screenrecord kill: {}", e);
            }
        }
        if let Err(e) = reader.await {
            tracing::warn!("screenrecord reader ended abnormally: {}", e);
        }
        self.frames.take();
        write_lock(&self.state).state = CaptureState::Stopped;
        Ok(())
    }

    pub fn take_frames(&mut self) -> Option<mpsc::Receiver<Frame>> {
        self.frames.take()
    }

    pub fn state(&self) -> CaptureState {
        read_lock(&self.state).state
    }

    pub fn stats(&self) -> CaptureStats {
        read_lock(&self.state).tracker.snapshot()
    }

    /// (0, 0) until an SPS has been seen.
    pub fn resolution(&self) -> (u32, u32) {
        let state = read_lock(&self.state);
        (state.width, state.height)
    }

    pub fn parameter_sets(&self) -> (Option<Bytes>, Option<Bytes>) {
        let state = read_lock(&self.state);
        (state.sps.clone(), state.pps.clone())
    }
}

impl Drop for ScreenRecordCapture {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPS: &[u8] = &[0, 0, 0, 1, 0x67, 0x42, 0xC0, 0x28, 0xDA, 0x01, 0xE0, 0x08, 0x9F, 0x95];
    const PPS: &[u8] = &[0, 0, 0, 1, 0x68, 0xCE, 0x3C, 0x80];

    fn stream() -> Vec<u8> {
        let mut data = SPS.to_vec();
        data.extend_from_slice(PPS);
        data.extend_from_slice(&[0, 0, 0, 1, 0x65, 0x88, 0x84, 0x00]);
        data.extend_from_slice(&[0, 0, 0, 1, 0x41, 0x9A, 0x02]);
        data
    }

    #[tokio::test]
    async fn test_stream_to_frames() {
        let data = stream();
        let options = CaptureOptions::new("emulator-5554");
        let mut capture = ScreenRecordCapture::from_source(std::io::Cursor::new(data), &options);
        let mut frames = capture.take_frames().unwrap();

        let mut got = Vec::new();
        while let Some(frame) = frames.recv().await {
            got.push((frame.data()[4] & 0x1F, frame.keyframe, frame.config, frame.width));
        }
        assert_eq!(
            got,
            vec![(7, false, true, 1920), (8, false, true, 1920), (5, true, false, 1920), (1, false, false, 1920)]
        );

        assert_eq!(capture.resolution(), (1920, 1080));
        let (sps, pps) = capture.parameter_sets();
        assert_eq!(sps.as_deref(), Some(SPS));
        assert_eq!(pps.as_deref(), Some(PPS));
        assert_eq!(capture.stats().frames_captured, 4);
        assert_eq!(capture.state(), CaptureState::Stopped);

        capture.stop().await.unwrap();
        assert!(capture.stop().await.is_err());
    }

    #[tokio::test]
    async fn test_resolution_unknown_without_sps() {
        let data = vec![0, 0, 0, 1, 0x41, 0x01, 0, 0, 0, 1, 0x41, 0x02];
        let options = CaptureOptions::new("emulator-5554").queue_size(1);
        let mut capture = ScreenRecordCapture::from_source(std::io::Cursor::new(data), &options);
        let mut frames = capture.take_frames().unwrap();

        // Queue of one: wait for the source to drain, then only one frame is left
        while capture.state() != CaptureState::Stopped {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(capture.resolution(), (0, 0));
        let stats = capture.stats();
        assert_eq!(stats.frames_captured, 2);
        assert_eq!(stats.frames_dropped, 1);
        assert!(frames.recv().await.is_some());
        assert!(frames.recv().await.is_none());
        capture.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_requires_adb_bridge() {
        let result = ScreenRecordCapture::start(CaptureOptions::new("x"), DeviceBridge::Direct).await;
        assert!(result.is_err());
    }
}
