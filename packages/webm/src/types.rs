//! Writer configuration types.

use crate::error::{Result, WebmError};
use std::path::PathBuf;

/// Video codec carried by the single WebM track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Codec {
    /// VP8 (payloads written verbatim).
    Vp8,
    /// VP9 (payloads written verbatim).
    Vp9,
    /// H.264/AVC (Annex-B payloads converted to length-prefixed form).
    H264,
}

impl Codec {
    /// Map a codec name as used in recording requests.
    ///
    /// `"VP8"` and the empty string select VP8.
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "VP8" | "" => Ok(Self::Vp8),
            "VP9" => Ok(Self::Vp9),
            "H264" => Ok(Self::H264),
            other => Err(WebmError::UnsupportedCodec(other.to_string())),
        }
    }

    /// Matroska CodecID string.
    #[must_use]
    pub fn codec_id(&self) -> &'static str {
        match self {
            Self::Vp8 => "V_VP8",
            Self::Vp9 => "V_VP9",
            Self::H264 => "V_MPEG4/ISO/AVC",
        }
    }
}

impl Default for Codec {
    fn default() -> Self {
        Self::Vp8
    }
}

/// Configuration for [`crate::WebmWriter`].
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Output file path.
    pub path: PathBuf,
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Nominal frame rate. 0 means the default of 30.
    pub fps: u32,
    /// Track codec.
    pub codec: Codec,
    /// H.264 SPS NAL unit (start code optional).
    pub sps: Option<Vec<u8>>,
    /// H.264 PPS NAL unit (start code optional).
    pub pps: Option<Vec<u8>>,
    /// MuxingApp string in the segment info.
    pub muxing_app: String,
    /// WritingApp string in the segment info.
    pub writing_app: String,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::new(),
            width: 0,
            height: 0,
            fps: 30,
            codec: Codec::default(),
            sps: None,
            pps: None,
            muxing_app: concat!("droidrec-webm ", env!("CARGO_PKG_VERSION")).to_string(),
            writing_app: "droidrec".to_string(),
        }
    }
}

impl WriterConfig {
    /// Create a config for the given output path and dimensions.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, width: u32, height: u32) -> Self {
        Self {
            path: path.into(),
            width,
            height,
            ..Default::default()
        }
    }

    /// Set the codec.
    #[must_use]
    pub fn codec(mut self, codec: Codec) -> Self {
        self.codec = codec;
        self
    }

    /// Set the nominal frame rate.
    #[must_use]
    pub fn fps(mut self, fps: u32) -> Self {
        self.fps = fps;
        self
    }

    /// Set the H.264 parameter sets used for CodecPrivate.
    #[must_use]
    pub fn parameter_sets(mut self, sps: impl Into<Vec<u8>>, pps: impl Into<Vec<u8>>) -> Self {
        self.sps = Some(sps.into());
        self.pps = Some(pps.into());
        self
    }

    /// Set the WritingApp string.
    #[must_use]
    pub fn writing_app(mut self, app: impl Into<String>) -> Self {
        self.writing_app = app.into();
        self
    }

    /// Nominal frame duration in nanoseconds, written as the track's
    /// DefaultDuration.
    pub fn frame_duration_ns(&self) -> u64 {
        1_000_000_000 / u64::from(self.fps.max(1))
    }

    pub(crate) fn validate(&mut self) -> Result<()> {
        if self.path.as_os_str().is_empty() {
            return Err(WebmError::invalid_config("file path is required"));
        }
        if self.width == 0 || self.height == 0 {
            return Err(WebmError::invalid_config(format!(
                "invalid video dimensions: {}x{}",
                self.width, self.height
            )));
        }
        if self.fps == 0 {
            self.fps = 30;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_from_name() {
        assert_eq!(Codec::from_name("").unwrap(), Codec::Vp8);
        assert_eq!(Codec::from_name("VP8").unwrap(), Codec::Vp8);
        assert_eq!(Codec::from_name("VP9").unwrap().codec_id(), "V_VP9");
        assert_eq!(Codec::from_name("H264").unwrap().codec_id(), "V_MPEG4/ISO/AVC");
        assert!(matches!(
            Codec::from_name("AV1"),
            Err(WebmError::UnsupportedCodec(name)) if name == "AV1"
        ));
    }

    #[test]
    fn test_validate_config() {
        let mut config = WriterConfig::new("", 640, 480);
        assert!(config.validate().is_err());

        let mut config = WriterConfig::new("/tmp/out.webm", 0, 480);
        assert!(config.validate().is_err());

        let mut config = WriterConfig::new("/tmp/out.webm", 640, 480).fps(0);
        config.validate().unwrap();
        assert_eq!(config.fps, 30);
        assert_eq!(config.frame_duration_ns(), 33_333_333);
    }
}
