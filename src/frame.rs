//! Captured frame type shared by all capture backends.

use crate::pool::BufferPool;
use bytes::Bytes;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Payload encoding of a [`Frame`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameFormat {
    /// H.264 Annex-B access unit or NAL unit.
    H264,
    /// PNG still image.
    Png,
}

impl FrameFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            FrameFormat::H264 => "h264",
            FrameFormat::Png => "png",
        }
    }
}

/// Frame payload storage.
#[derive(Debug)]
pub enum FrameData {
    /// Buffer borrowed from a [`BufferPool`], returned on release.
    Pooled { buf: Vec<u8>, pool: Arc<BufferPool> },
    /// Shared view into a larger buffer (e.g. the NAL framer's accumulator).
    Shared(Bytes),
}

/// A single captured frame.
///
/// Pooled payloads go back to their pool when the frame is released or
/// dropped, whichever happens first. `release` consumes the frame, so it can
/// only happen once.
#[derive(Debug)]
pub struct Frame {
    data: Option<FrameData>,
    pub format: FrameFormat,
    /// When the frame was received locally.
    pub captured_at: Instant,
    /// Device presentation timestamp in microseconds, when the wire carries one.
    pub pts: Option<u64>,
    pub width: u32,
    pub height: u32,
    pub keyframe: bool,
    /// Codec configuration (SPS/PPS) rather than picture data.
    pub config: bool,
    /// Nominal frame duration derived from the target frame rate.
    pub duration: Duration,
}

impl Frame {
    /// Frame backed by a pooled buffer.
    pub fn pooled(buf: Vec<u8>, pool: Arc<BufferPool>, format: FrameFormat) -> Self {
        Self::with_data(FrameData::Pooled { buf, pool }, format)
    }

    /// Frame backed by a shared `Bytes` view.
    pub fn shared(bytes: Bytes, format: FrameFormat) -> Self {
        Self::with_data(FrameData::Shared(bytes), format)
    }

    fn with_data(data: FrameData, format: FrameFormat) -> Self {
        Self {
            data: Some(data),
            format,
            captured_at: Instant::now(),
            pts: None,
            width: 0,
            height: 0,
            keyframe: false,
            config: false,
            duration: Duration::ZERO,
        }
    }

    /// Frame payload.
    pub fn data(&self) -> &[u8] {
        match &self.data {
            Some(FrameData::Pooled { buf, .. }) => buf,
            Some(FrameData::Shared(bytes)) => bytes,
            None => &[],
        }
    }

    pub fn len(&self) -> usize {
        self.data().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data().is_empty()
    }

    /// Returns true if the payload came from a pool.
    pub fn is_pooled(&self) -> bool {
        matches!(self.data, Some(FrameData::Pooled { .. }))
    }

    /// Copy the payload out as `Bytes`, leaving the frame intact.
    pub fn to_bytes(&self) -> Bytes {
        match &self.data {
            Some(FrameData::Shared(bytes)) => bytes.clone(),
            _ => Bytes::copy_from_slice(self.data()),
        }
    }

    /// Return the payload to its pool (if pooled) and consume the frame.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if let Some(FrameData::Pooled { buf, pool }) = self.data.take() {
            pool.release(buf);
        }
    }
}

impl Drop for Frame {
    fn drop(&mut self) {
        self.release_inner();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_release_returns_to_pool() {
        let pool = Arc::new(BufferPool::new());
        let mut buf = pool.acquire(1000);
        buf[..3].copy_from_slice(&[1, 2, 3]);
        let frame = Frame::pooled(buf, Arc::clone(&pool), FrameFormat::H264);
        assert!(frame.is_pooled());
        assert_eq!(&frame.data()[..3], &[1, 2, 3]);
        assert_eq!(frame.len(), 1000);

        frame.release();
        assert_eq!(pool.stats().idle, 1);
    }

    #[test]
    fn test_drop_releases_once() {
        let pool = Arc::new(BufferPool::new());
        {
            let _frame = Frame::pooled(pool.acquire(10), Arc::clone(&pool), FrameFormat::H264);
        }
        assert_eq!(pool.stats().idle, 1);

        // Explicit release followed by the implicit drop must not double-return
        let frame = Frame::pooled(pool.acquire(10), Arc::clone(&pool), FrameFormat::H264);
        assert_eq!(pool.stats().idle, 0);
        frame.release();
        assert_eq!(pool.stats().idle, 1);
    }

    #[test]
    fn test_shared_frame() {
        let bytes = Bytes::from_static(&[0, 0, 0, 1, 0x65, 0x88]);
        let frame = Frame::shared(bytes.slice(4..), FrameFormat::H264);
        assert!(!frame.is_pooled());
        assert_eq!(frame.data(), &[0x65, 0x88]);
        assert_eq!(frame.to_bytes(), Bytes::from_static(&[0x65, 0x88]));
        frame.release();
    }

    #[test]
    fn test_format_names() {
        assert_eq!(FrameFormat::H264.as_str(), "h264");
        assert_eq!(FrameFormat::Png.as_str(), "png");
    }
}
