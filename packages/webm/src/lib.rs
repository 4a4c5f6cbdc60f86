//! Streaming WebM (Matroska) muxer for a single video track.
//!
//! Files are written front to back with unknown-size Segment and Cluster
//! elements, so a recording that is cut short is still readable up to the last
//! complete block.
//!
//! # Example
//!
//! ```no_run
//! use droidrec_webm::{Codec, WebmWriter, WriterConfig};
//! use std::time::Duration;
//!
//! # fn main() -> droidrec_webm::Result<()> {
//! let config = WriterConfig::new("/tmp/out.webm", 1280, 720).codec(Codec::Vp8);
//! let mut writer = WebmWriter::create(config)?;
//! writer.write_frame(&[0x10, 0x02, 0x00], Duration::ZERO, true)?;
//! writer.close()?;
//! # Ok(())
//! # }
//! ```

pub mod avc;
pub mod ebml;
mod error;
mod types;
mod writer;

pub use error::{Result, WebmError};
pub use types::{Codec, WriterConfig};
pub use writer::{
    with_webm_extension, WebmWriter, WriterStats, MAX_CLUSTER_DURATION, MAX_CLUSTER_FRAMES,
    TIMECODE_SCALE_NS,
};
