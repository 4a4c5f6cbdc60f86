//! Streaming WebM writer.
//!
//! Segment and clusters are written with the unknown-size marker, so the file
//! is produced strictly front to back and never needs a seek to patch sizes.
//!
//! ```text
//! EBML header (docType "webm")
//! Segment (unknown size)
//!   Info     TimecodeScale = 1ms
//!   Tracks   one video TrackEntry (DefaultDuration from fps, + CodecPrivate for H.264)
//!   Cluster  (unknown size) Timecode, SimpleBlock, SimpleBlock, ...
//!   Cluster  ...
//! ```

use crate::avc::{annex_b_to_avcc, build_avc_config_record};
use crate::ebml::{self, ids};
use crate::error::{Result, WebmError};
use crate::types::{Codec, WriterConfig};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// A cluster is closed once it spans more than this much time.
pub const MAX_CLUSTER_DURATION: Duration = Duration::from_secs(5);

/// A cluster is closed once it holds this many blocks.
pub const MAX_CLUSTER_FRAMES: usize = 150;

/// Timecode scale in nanoseconds (millisecond ticks).
pub const TIMECODE_SCALE_NS: u64 = 1_000_000;

const TRACK_NUMBER: u64 = 1;
const TRACK_TYPE_VIDEO: u64 = 1;

/// Counters reported by [`WebmWriter::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriterStats {
    /// Blocks written.
    pub frames: u64,
    /// Input payload bytes (before any AVCC conversion).
    pub bytes: u64,
    /// Timestamp of the most recent frame.
    pub last_timestamp: Duration,
}

#[derive(Debug, Clone, Copy)]
struct ClusterState {
    base_ms: i64,
    frames: usize,
}

/// Single-track WebM writer.
pub struct WebmWriter {
    config: WriterConfig,
    out: Option<BufWriter<File>>,
    header_written: bool,
    cluster: Option<ClusterState>,
    stats: WriterStats,
    /// Scratch buffer reused for element assembly.
    scratch: Vec<u8>,
}

impl WebmWriter {
    /// Validate the config and create the output file.
    pub fn create(mut config: WriterConfig) -> Result<Self> {
        config.validate()?;
        let file = File::create(&config.path)?;
        Ok(Self {
            config,
            out: Some(BufWriter::new(file)),
            header_written: false,
            cluster: None,
            stats: WriterStats::default(),
            scratch: Vec::with_capacity(64 * 1024),
        })
    }

    /// Output file path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Codec of the video track.
    pub fn codec(&self) -> Codec {
        self.config.codec
    }

    /// Write statistics so far.
    pub fn stats(&self) -> WriterStats {
        self.stats
    }

    /// Returns true once `close()` has been called.
    pub fn is_closed(&self) -> bool {
        self.out.is_none()
    }

    /// Write the EBML header, segment start, segment info and track list.
    ///
    /// Only the first call writes anything.
    pub fn write_header(&mut self) -> Result<()> {
        if self.header_written {
            return Ok(());
        }
        if self.out.is_none() {
            return Err(WebmError::Closed);
        }

        let mut buf = Vec::with_capacity(512);
        self.write_ebml_header(&mut buf);
        ebml::put_unknown_size_header(&mut buf, ids::SEGMENT);
        self.write_info(&mut buf);
        self.write_tracks(&mut buf);
        self.emit(&buf)?;

        self.header_written = true;
        Ok(())
    }

    /// Append one frame.
    ///
    /// `timestamp` is relative to the start of the recording and must not go
    /// backwards. H.264 payloads are expected in Annex-B form.
    pub fn write_frame(&mut self, payload: &[u8], timestamp: Duration, keyframe: bool) -> Result<()> {
        if self.out.is_none() {
            return Err(WebmError::Closed);
        }
        if !self.header_written {
            self.write_header()?;
        }

        let ts_ms = timestamp.as_millis() as i64;
        let needs_cluster = match self.cluster {
            None => true,
            Some(cluster) => {
                let elapsed = ts_ms - cluster.base_ms;
                elapsed > MAX_CLUSTER_DURATION.as_millis() as i64
                    || cluster.frames >= MAX_CLUSTER_FRAMES
                    || (keyframe && cluster.frames > 0)
                    || elapsed < i16::MIN as i64
                    || elapsed > i16::MAX as i64
            }
        };

        let mut buf = std::mem::take(&mut self.scratch);
        buf.clear();

        if needs_cluster {
            ebml::put_unknown_size_header(&mut buf, ids::CLUSTER);
            ebml::put_uint(&mut buf, ids::TIMECODE, ts_ms.max(0) as u64);
            self.cluster = Some(ClusterState {
                base_ms: ts_ms.max(0),
                frames: 0,
            });
        }

        let base_ms = self.cluster.map_or(0, |c| c.base_ms);
        let relative = (ts_ms - base_ms) as i16;

        let converted;
        let data: &[u8] = if self.config.codec == Codec::H264 {
            converted = annex_b_to_avcc(payload);
            &converted
        } else {
            payload
        };

        // SimpleBlock: track VINT, relative timecode, flags, frame data
        ebml::put_id(&mut buf, ids::SIMPLE_BLOCK);
        ebml::put_vint(&mut buf, (4 + data.len()) as u64);
        buf.push(0x80 | TRACK_NUMBER as u8);
        buf.extend_from_slice(&relative.to_be_bytes());
        buf.push(if keyframe { 0x80 } else { 0x00 });
        buf.extend_from_slice(data);

        let result = self.emit(&buf);
        self.scratch = buf;
        result?;

        if let Some(cluster) = self.cluster.as_mut() {
            cluster.frames += 1;
        }
        self.stats.frames += 1;
        self.stats.bytes += payload.len() as u64;
        self.stats.last_timestamp = timestamp;
        Ok(())
    }

    /// Flush, sync and close the file. Later writes fail with
    /// [`WebmError::Closed`]; closing twice is a no-op.
    pub fn close(&mut self) -> Result<()> {
        let Some(mut out) = self.out.take() else {
            return Ok(());
        };
        out.flush()?;
        let file = out
            .into_inner()
            .map_err(|e| WebmError::Io(e.into_error()))?;
        file.sync_all()?;
        Ok(())
    }

    fn emit(&mut self, bytes: &[u8]) -> Result<()> {
        let out = self.out.as_mut().ok_or(WebmError::Closed)?;
        out.write_all(bytes)?;
        Ok(())
    }

    fn write_ebml_header(&self, buf: &mut Vec<u8>) {
        let mut content = Vec::with_capacity(64);
        ebml::put_uint(&mut content, ids::EBML_VERSION, 1);
        ebml::put_uint(&mut content, ids::EBML_READ_VERSION, 1);
        ebml::put_uint(&mut content, ids::EBML_MAX_ID_LENGTH, 4);
        ebml::put_uint(&mut content, ids::EBML_MAX_SIZE_LENGTH, 8);
        ebml::put_string(&mut content, ids::DOC_TYPE, "webm");
        ebml::put_uint(&mut content, ids::DOC_TYPE_VERSION, 4);
        ebml::put_uint(&mut content, ids::DOC_TYPE_READ_VERSION, 2);
        ebml::put_element(buf, ids::EBML, &content);
    }

    fn write_info(&self, buf: &mut Vec<u8>) {
        let mut content = Vec::with_capacity(64);
        ebml::put_uint(&mut content, ids::TIMECODE_SCALE, TIMECODE_SCALE_NS);
        ebml::put_string(&mut content, ids::MUXING_APP, &self.config.muxing_app);
        ebml::put_string(&mut content, ids::WRITING_APP, &self.config.writing_app);
        ebml::put_element(buf, ids::INFO, &content);
    }

    fn write_tracks(&self, buf: &mut Vec<u8>) {
        let mut video = Vec::with_capacity(16);
        ebml::put_uint(&mut video, ids::PIXEL_WIDTH, self.config.width as u64);
        ebml::put_uint(&mut video, ids::PIXEL_HEIGHT, self.config.height as u64);

        let mut entry = Vec::with_capacity(256);
        ebml::put_uint(&mut entry, ids::TRACK_NUMBER, TRACK_NUMBER);
        ebml::put_uint(&mut entry, ids::TRACK_UID, 1);
        ebml::put_uint(&mut entry, ids::FLAG_ENABLED, 1);
        ebml::put_uint(&mut entry, ids::FLAG_DEFAULT, 1);
        ebml::put_uint(&mut entry, ids::FLAG_LACING, 0);
        ebml::put_uint(&mut entry, ids::TRACK_TYPE, TRACK_TYPE_VIDEO);
        ebml::put_uint(&mut entry, ids::DEFAULT_DURATION, self.config.frame_duration_ns());
        ebml::put_string(&mut entry, ids::CODEC_ID, self.config.codec.codec_id());

        if self.config.codec == Codec::H264 {
            if let (Some(sps), Some(pps)) = (&self.config.sps, &self.config.pps) {
                if let Some(record) = build_avc_config_record(sps, pps) {
                    ebml::put_element(&mut entry, ids::CODEC_PRIVATE, &record);
                }
            }
        }

        ebml::put_element(&mut entry, ids::VIDEO, &video);

        let mut tracks = Vec::with_capacity(entry.len() + 8);
        ebml::put_element(&mut tracks, ids::TRACK_ENTRY, &entry);
        ebml::put_element(buf, ids::TRACKS, &tracks);
    }
}

impl Drop for WebmWriter {
    fn drop(&mut self) {
        if let Some(mut out) = self.out.take() {
            let _ = out.flush();
        }
    }
}

/// Path helper used by tests and callers that build output names.
pub fn with_webm_extension(path: impl Into<PathBuf>) -> PathBuf {
    let mut path = path.into();
    path.set_extension("webm");
    path
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ebml::probe;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static COUNTER: AtomicUsize = AtomicUsize::new(0);

    fn temp_path(name: &str) -> PathBuf {
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        std::env::temp_dir().join(format!(
            "droidrec-webm-{}-{}-{}.webm",
            name,
            std::process::id(),
            n
        ))
    }

    const SPS: &[u8] = &[0, 0, 0, 1, 0x67, 0x42, 0xC0, 0x1F, 0xDA, 0x02, 0x80, 0x2D, 0xC8];
    const PPS: &[u8] = &[0, 0, 0, 1, 0x68, 0xCE, 0x3C, 0x80];

    fn h264_writer(name: &str) -> WebmWriter {
        let config = WriterConfig::new(temp_path(name), 1280, 720)
            .codec(Codec::H264)
            .parameter_sets(SPS, PPS);
        WebmWriter::create(config).unwrap()
    }

    fn idr(len: usize) -> Vec<u8> {
        let mut frame = vec![0, 0, 0, 1, 0x65];
        frame.resize(4 + len, 0x5A);
        frame
    }

    fn finish(mut writer: WebmWriter) -> Vec<u8> {
        writer.close().unwrap();
        let data = std::fs::read(writer.path()).unwrap();
        let _ = std::fs::remove_file(writer.path());
        data
    }

    #[test]
    fn test_create_rejects_bad_config() {
        assert!(matches!(
            WebmWriter::create(WriterConfig::new(temp_path("bad"), 0, 720)),
            Err(WebmError::InvalidConfig(_))
        ));
        assert!(WebmWriter::create(WriterConfig::new("", 1280, 720)).is_err());
    }

    #[test]
    fn test_structure_is_parseable() {
        let mut writer = h264_writer("structure");
        writer.write_header().unwrap();
        writer.write_header().unwrap();
        for i in 0..10u64 {
            writer
                .write_frame(&idr(200), Duration::from_millis(i * 33), i == 0)
                .unwrap();
        }
        let stats = writer.stats();
        assert_eq!(stats.frames, 10);
        assert_eq!(stats.bytes, 10 * 204);
        assert_eq!(stats.last_timestamp, Duration::from_millis(297));

        let data = finish(writer);
        assert_eq!(&data[..4], &[0x1A, 0x45, 0xDF, 0xA3]);

        let info = probe(&data).unwrap();
        assert_eq!(info.doc_type, "webm");
        assert_eq!(info.timecode_scale, 1_000_000);
        assert_eq!(info.codec_id, "V_MPEG4/ISO/AVC");
        assert_eq!(info.width, 1280);
        assert_eq!(info.height, 720);
        assert_eq!(info.blocks, 10);
        assert_eq!(info.keyframes, 1);
        assert_eq!(info.clusters, 1);
        assert_eq!(info.default_duration_ns, 33_333_333);

        let private = info.codec_private.unwrap();
        assert_eq!(&private[..4], &[1, 0x42, 0xC0, 0x1F]);
    }

    #[test]
    fn test_header_written_lazily() {
        let config = WriterConfig::new(temp_path("lazy"), 320, 240).codec(Codec::Vp8);
        let mut writer = WebmWriter::create(config).unwrap();
        writer
            .write_frame(&[0x10, 0x02, 0x00], Duration::ZERO, true)
            .unwrap();
        let data = finish(writer);
        let info = probe(&data).unwrap();
        assert_eq!(info.codec_id, "V_VP8");
        assert_eq!(info.default_duration_ns, 33_333_333);
        assert!(info.codec_private.is_none());
        assert_eq!(info.blocks, 1);
    }

    #[test]
    fn test_default_duration_follows_fps() {
        let config = WriterConfig::new(temp_path("fps"), 320, 240).fps(60);
        let mut writer = WebmWriter::create(config).unwrap();
        writer.write_header().unwrap();
        assert_eq!(probe(&finish(writer)).unwrap().default_duration_ns, 16_666_666);

        let config = WriterConfig::new(temp_path("fps-zero"), 320, 240).fps(0);
        let mut writer = WebmWriter::create(config).unwrap();
        writer.write_header().unwrap();
        assert_eq!(probe(&finish(writer)).unwrap().default_duration_ns, 33_333_333);
    }

    #[test]
    fn test_cluster_rotation_on_time() {
        let mut writer = h264_writer("rotate-time");
        // One frame per second for 12 seconds, no keyframes after the first
        for s in 0..12u64 {
            writer
                .write_frame(&idr(10), Duration::from_secs(s), s == 0)
                .unwrap();
        }
        let info = probe(&finish(writer)).unwrap();
        // Base 0 holds 0..=5s, base 6 holds 6..=11s
        assert_eq!(info.clusters, 2);
        assert_eq!(info.blocks, 12);
        let expected: Vec<i64> = (0..12).map(|s| s * 1000).collect();
        assert_eq!(info.block_times_ms, expected);
    }

    #[test]
    fn test_cluster_rotation_on_frame_count() {
        let mut writer = h264_writer("rotate-count");
        for i in 0..301u64 {
            writer
                .write_frame(&idr(4), Duration::from_millis(i), i == 0)
                .unwrap();
        }
        let info = probe(&finish(writer)).unwrap();
        assert_eq!(info.clusters, 3);
        assert_eq!(info.blocks, 301);
    }

    #[test]
    fn test_cluster_rotation_on_keyframe() {
        let mut writer = h264_writer("rotate-key");
        let pattern = [true, false, false, true, false, true];
        for (i, &key) in pattern.iter().enumerate() {
            writer
                .write_frame(&idr(8), Duration::from_millis(i as u64 * 40), key)
                .unwrap();
        }
        let info = probe(&finish(writer)).unwrap();
        assert_eq!(info.clusters, 3);
        assert_eq!(info.keyframes, 3);
        assert_eq!(info.block_times_ms, vec![0, 40, 80, 120, 160, 200]);
    }

    #[test]
    fn test_write_after_close_fails() {
        let mut writer = h264_writer("closed");
        writer.write_frame(&idr(16), Duration::ZERO, true).unwrap();
        writer.close().unwrap();
        writer.close().unwrap();
        assert!(writer.is_closed());
        assert!(matches!(
            writer.write_frame(&idr(16), Duration::from_millis(33), false),
            Err(WebmError::Closed)
        ));
        let _ = std::fs::remove_file(writer.path());
    }

    #[test]
    fn test_with_webm_extension() {
        assert_eq!(
            with_webm_extension("/tmp/rec-1"),
            PathBuf::from("/tmp/rec-1.webm")
        );
    }
}
