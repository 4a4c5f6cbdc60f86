//! `screencap` backend: one PNG per tick via `adb exec-out screencap -p`.

use super::{
    read_lock, try_deliver, write_lock, CaptureOptions, CaptureState, CaptureStats,
    StatsTracker,
};
use crate::adb::{AdbBridge, DeviceBridge};
use crate::frame::{Frame, FrameFormat};
use anyhow::{bail, Result};
use bytes::Bytes;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const PNG_SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];

/// Width and height from a PNG's IHDR chunk.
pub fn png_dimensions(data: &[u8]) -> Option<(u32, u32)> {
    if data.len() < 24 || data[..8] != PNG_SIGNATURE || &data[12..16] != b"IHDR" {
        return None;
    }
    let width = u32::from_be_bytes([data[16], data[17], data[18], data[19]]);
    let height = u32::from_be_bytes([data[20], data[21], data[22], data[23]]);
    Some((width, height))
}

#[derive(Debug)]
struct SnapState {
    state: CaptureState,
    width: u32,
    height: u32,
    tracker: StatsTracker,
}

struct Snapper {
    state: Arc<RwLock<SnapState>>,
    tx: mpsc::Sender<Frame>,
    frame_duration: Duration,
}

impl Snapper {
    async fn run(self, adb: AdbBridge, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.frame_duration);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            let shot = tokio::select! {
                _ = cancel.cancelled() => break,
                r = adb.exec_out(&["screencap", "-p"]) => r,
            };
            match shot {
                Ok(png) => self.handle(png),
                Err(e) => {
                    write_lock(&self.state).tracker.record_error();
                    tracing::warn!("screencap failed: {:#}", e);
                }
            }
            if self.tx.is_closed() {
                break;
            }
        }
        write_lock(&self.state).state = CaptureState::Stopped;
    }

    fn handle(&self, png: Vec<u8>) {
        let Some((width, height)) = png_dimensions(&png) else {
            write_lock(&self.state).tracker.record_error();
            tracing::warn!("screencap returned {} bytes that are not a PNG", png.len());
            return;
        };

        let mut frame = Frame::shared(Bytes::from(png), FrameFormat::Png);
        frame.keyframe = true;
        frame.width = width;
        frame.height = height;
        frame.duration = self.frame_duration;

        let len = frame.len();
        {
            let mut state = write_lock(&self.state);
            state.width = width;
            state.height = height;
            state.tracker.record_frame(len);
        }
        if !try_deliver(&self.tx, frame) {
            write_lock(&self.state).tracker.record_drop();
        }
    }
}

/// Periodic PNG snapshots at `max_fps`.
pub struct ScreencapCapture {
    state: Arc<RwLock<SnapState>>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
    frames: Option<mpsc::Receiver<Frame>>,
}

impl ScreencapCapture {
    pub async fn start(options: CaptureOptions, bridge: DeviceBridge) -> Result<Self> {
        options.validate()?;
        let adb = bridge.require_adb()?.clone();

        let state = Arc::new(RwLock::new(SnapState {
            state: CaptureState::Streaming,
            width: 0,
            height: 0,
            tracker: StatsTracker::default(),
        }));
        let (tx, rx) = mpsc::channel(options.queue_size.max(1));
        let cancel = CancellationToken::new();
        let snapper = Snapper {
            state: Arc::clone(&state),
            tx,
            frame_duration: options.frame_duration(),
        };
        tracing::info!(
            "screencap polling {} at {} fps",
            options.device_id,
            options.max_fps
        );
        let task = tokio::spawn(snapper.run(adb, cancel.clone()));

        Ok(Self {
            state,
            cancel,
            task: Some(task),
            frames: Some(rx),
        })
    }

    pub async fn stop(&mut self) -> Result<()> {
        let Some(task) = self.task.take() else {
            bail!("capture not running");
        };
        self.cancel.cancel();
        if let Err(e) = task.await {
            tracing::warn!("screencap task ended abnormally: {}", e);
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

    /// Size of the last snapshot.
    pub fn resolution(&self) -> (u32, u32) {
        let state = read_lock(&self.state);
        (state.width, state.height)
    }
}

impl Drop for ScreencapCapture {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
