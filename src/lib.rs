//! droidrec - Android screen capture and recording.
//!
//! Pulls an H.264 stream off a device with the scrcpy server (or the
//! `screenrecord`/`screencap` fallbacks) and records it to WebM.
//!
//! - [`capture`]: capture backends, the scrcpy wire protocol and bitrate control
//! - [`nal`] / [`sps`]: Annex-B framing and SPS parsing
//! - [`pool`] / [`frame`]: pooled frame buffers
//! - [`recording`]: recording coordinator on top of [`droidrec_webm`]
//! - [`adb`]: device commands
//!
//! # Example
//!
//! ```no_run
//! use droidrec::adb::DeviceBridge;
//! use droidrec::capture::{CaptureOptions, ScrcpyCapture};
//! use droidrec::pool::BufferPool;
//! use std::sync::Arc;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let options = CaptureOptions::new("emulator-5554").bitrate(2_000_000);
//! let bridge = DeviceBridge::adb("adb", "emulator-5554");
//! let mut capture = ScrcpyCapture::start(options, bridge, Arc::new(BufferPool::new())).await?;
//!
//! let mut frames = capture.take_frames().unwrap();
//! while let Some(frame) = frames.recv().await {
//!     println!("{} bytes, keyframe={}", frame.len(), frame.keyframe);
//! }
//! capture.stop().await?;
//! # Ok(())
//! # }
//! ```

pub mod adb;
pub mod capture;
pub mod frame;
pub mod nal;
pub mod pool;
pub mod recording;
pub mod sps;

pub use capture::{BackendKind, CaptureBackend, CaptureOptions, CaptureState, CaptureStats};
pub use frame::{Frame, FrameFormat};
pub use pool::BufferPool;
pub use recording::{RecorderConfig, Recording, RecordingCoordinator, StartRecordingRequest};
