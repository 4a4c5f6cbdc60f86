//! scrcpy wire structures.
//!
//! ```text
//! Video socket:
//!   dummy byte (0x00)
//!   framed mode:
//!     device meta  64-byte NUL-padded name | 4-byte codec tag | BE u32 width | BE u32 height
//!     packets      BE u64 (bit63 config, bit62 keyframe, low 62 bits PTS µs) | BE u32 size | payload
//!   raw mode:
//!     plain Annex-B H.264
//!
//! Control socket:
//!   dummy byte, then write-only messages: opcode [payload]
//! ```

use super::StreamMode;
use anyhow::{bail, Result};
use std::time::Duration;

/// Device name field length.
pub const DEVICE_NAME_LEN: usize = 64;
/// Full device meta length (name + codec tag + width + height).
pub const DEVICE_META_LEN: usize = DEVICE_NAME_LEN + 12;
/// Packet header length.
pub const FRAME_HEADER_LEN: usize = 12;
/// Payload size ceiling; larger sizes mean the stream is corrupt.
pub const MAX_PACKET_SIZE: u32 = 10 * 1024 * 1024;

const FLAG_CONFIG: u64 = 1 << 63;
const FLAG_KEYFRAME: u64 = 1 << 62;
const PTS_MASK: u64 = FLAG_KEYFRAME - 1;

/// Control opcode: set video bitrate (followed by BE u32 bps).
pub const OP_SET_BITRATE: u8 = 0x0D;
/// Control opcode: request an IDR frame.
pub const OP_REQUEST_KEYFRAME: u8 = 0x0E;

pub const MIN_BITRATE: u32 = 100_000;
pub const MAX_BITRATE: u32 = 20_000_000;

/// Server version the launch arguments are written for.
pub const SERVER_VERSION: &str = "3.3.3";

// Handshake timeouts
pub const VIDEO_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DUMMY_BYTE_TIMEOUT: Duration = Duration::from_secs(5);
pub const TRIGGER_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
pub const META_TIMEOUT: Duration = Duration::from_secs(10);
pub const CONTROL_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
pub const CONTROL_DUMMY_TIMEOUT: Duration = Duration::from_secs(2);
pub const CONTROL_WRITE_TIMEOUT: Duration = Duration::from_secs(2);

/// Raw mode: minimum bytes read before probing for an SPS.
pub const RAW_PROBE_MIN: usize = 100;
/// Raw mode: probe buffer size.
pub const RAW_PROBE_MAX: usize = 4096;
/// Raw mode: resolution used when the probe finds no usable SPS.
pub const RAW_FALLBACK_SIZE: (u32, u32) = (720, 1280);
/// Raw mode: reported device name.
pub const RAW_DEVICE_NAME: &str = "scrcpy-raw";

/// Device name, skipping leading NULs and stopping at the next NUL.
pub fn trim_null(field: &[u8]) -> String {
    let start = field.iter().position(|&b| b != 0).unwrap_or(field.len());
    let rest = &field[start..];
    let end = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
    String::from_utf8_lossy(&rest[..end]).into_owned()
}

/// Framed-mode stream header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceMeta {
    pub name: String,
    pub codec_tag: [u8; 4],
    pub width: u32,
    pub height: u32,
}

impl DeviceMeta {
    pub fn parse(buf: &[u8; DEVICE_META_LEN]) -> Self {
        let name = trim_null(&buf[..DEVICE_NAME_LEN]);
        let mut codec_tag = [0u8; 4];
        codec_tag.copy_from_slice(&buf[DEVICE_NAME_LEN..DEVICE_NAME_LEN + 4]);
        let width = u32::from_be_bytes([buf[68], buf[69], buf[70], buf[71]]);
        let height = u32::from_be_bytes([buf[72], buf[73], buf[74], buf[75]]);
        Self {
            name,
            codec_tag,
            width,
            height,
        }
    }

    /// Serialize, truncating the name to the field size.
    pub fn encode(&self) -> [u8; DEVICE_META_LEN] {
        let mut buf = [0u8; DEVICE_META_LEN];
        let name = self.name.as_bytes();
        let n = name.len().min(DEVICE_NAME_LEN - 1);
        buf[..n].copy_from_slice(&name[..n]);
        buf[DEVICE_NAME_LEN..DEVICE_NAME_LEN + 4].copy_from_slice(&self.codec_tag);
        buf[68..72].copy_from_slice(&self.width.to_be_bytes());
        buf[72..76].copy_from_slice(&self.height.to_be_bytes());
        buf
    }

    /// Codec tag as text, e.g. `"h264"`.
    pub fn codec_name(&self) -> String {
        trim_null(&self.codec_tag)
    }
}

/// Framed-mode packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub config: bool,
    pub keyframe: bool,
    /// Presentation timestamp in microseconds.
    pub pts: u64,
    pub size: u32,
}

impl FrameHeader {
    pub fn parse(buf: &[u8; FRAME_HEADER_LEN]) -> Self {
        let mut word = [0u8; 8];
        word.copy_from_slice(&buf[..8]);
        let word = u64::from_be_bytes(word);
        Self {
            config: word & FLAG_CONFIG != 0,
            keyframe: word & FLAG_KEYFRAME != 0,
            pts: word & PTS_MASK,
            size: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
        }
    }

    pub fn encode(&self) -> [u8; FRAME_HEADER_LEN] {
        let mut word = self.pts & PTS_MASK;
        if self.config {
            word |= FLAG_CONFIG;
        }
        if self.keyframe {
            word |= FLAG_KEYFRAME;
        }
        let mut buf = [0u8; FRAME_HEADER_LEN];
        buf[..8].copy_from_slice(&word.to_be_bytes());
        buf[8..].copy_from_slice(&self.size.to_be_bytes());
        buf
    }

    /// Size outside `1..=MAX_PACKET_SIZE`.
    pub fn validate(&self) -> Result<()> {
        if self.size == 0 || self.size > MAX_PACKET_SIZE {
            bail!("invalid packet size {}", self.size);
        }
        Ok(())
    }
}

/// Messages written to the control socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessage {
    SetBitrate(u32),
    RequestKeyframe,
}

impl ControlMessage {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            ControlMessage::SetBitrate(bps) => {
                let mut buf = Vec::with_capacity(5);
                buf.push(OP_SET_BITRATE);
                buf.extend_from_slice(&bps.to_be_bytes());
                buf
            }
            ControlMessage::RequestKeyframe => vec![OP_REQUEST_KEYFRAME],
        }
    }
}

/// Clamp a bitrate to what the server accepts.
pub fn clamp_bitrate(bps: u32) -> u32 {
    bps.clamp(MIN_BITRATE, MAX_BITRATE)
}

/// Map a 0..=100 quality level to a bitrate.
pub fn quality_to_bitrate(quality: u8) -> u32 {
    match quality.min(100) {
        0..=25 => 500_000,
        26..=50 => 1_000_000,
        51..=75 => 2_000_000,
        _ => 4_000_000,
    }
}

/// Shell command line that starts the capture server on the device.
pub fn server_command(bitrate: u32, max_size: u32, max_fps: u32, mode: StreamMode) -> String {
    let mut cmd = format!(
        "CLASSPATH={} app_process / com.genymobile.scrcpy.Server {} \
         tunnel_forward=true video=true audio=false control=false video_codec=h264 \
         video_bit_rate={} max_size={} max_fps={}",
        crate::adb::REMOTE_SERVER_PATH,
        SERVER_VERSION,
        bitrate,
        max_size,
        max_fps
    );
    if mode == StreamMode::Raw {
        cmd.push_str(
            " send_device_meta=false send_frame_meta=false send_codec_meta=false send_dummy_byte=true",
        );
    }
    cmd.push_str(" cleanup=false power_off_on_close=false");
    cmd
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trim_null() {
        assert_eq!(trim_null(b"Pixel 7\0\0\0"), "Pixel 7");
        assert_eq!(trim_null(b"\0\0emu\0junk"), "emu");
        assert_eq!(trim_null(&[0u8; 8]), "");
        assert_eq!(trim_null(b"full"), "full");
    }

    #[test]
    fn test_device_meta_layout() {
        let meta = DeviceMeta {
            name: "mockdev".to_string(),
            codec_tag: *b"h264",
            width: 720,
            height: 1280,
        };
        let buf = meta.encode();
        assert_eq!(&buf[..7], b"mockdev");
        assert_eq!(&buf[64..68], b"h264");
        assert_eq!(&buf[68..72], &[0, 0, 0x02, 0xD0]);
        assert_eq!(&buf[72..76], &[0, 0, 0x05, 0x00]);

        let parsed = DeviceMeta::parse(&buf);
        assert_eq!(parsed, meta);
        assert_eq!(parsed.codec_name(), "h264");
    }

    #[test]
    fn test_frame_header_flags() {
        let mut buf = [0u8; FRAME_HEADER_LEN];
        buf[0] = 0x40; // keyframe
        buf[7] = 0x64; // pts 100
        buf[8..].copy_from_slice(&1000u32.to_be_bytes());
        let header = FrameHeader::parse(&buf);
        assert!(header.keyframe);
        assert!(!header.config);
        assert_eq!(header.pts, 100);
        assert_eq!(header.size, 1000);
        assert_eq!(header.encode(), buf);

        buf[0] = 0x80;
        let header = FrameHeader::parse(&buf);
        assert!(header.config && !header.keyframe);
        assert_eq!(header.pts, 100);

        // PTS uses the low 62 bits only
        let header = FrameHeader {
            config: false,
            keyframe: false,
            pts: u64::MAX,
            size: 1,
        };
        assert_eq!(FrameHeader::parse(&header.encode()).pts, (1u64 << 62) - 1);
    }

    #[test]
    fn test_frame_header_validate() {
        let ok = FrameHeader {
            config: false,
            keyframe: false,
            pts: 0,
            size: 1,
        };
        assert!(ok.validate().is_ok());
        assert!(FrameHeader { size: 0, ..ok }.validate().is_err());
        assert!(FrameHeader { size: MAX_PACKET_SIZE, ..ok }.validate().is_ok());
        assert!(FrameHeader { size: MAX_PACKET_SIZE + 1, ..ok }.validate().is_err());
    }

    #[test]
    fn test_control_message_encoding() {
        assert_eq!(
            ControlMessage::SetBitrate(2_000_000).encode(),
            vec![0x0D, 0x00, 0x1E, 0x84, 0x80]
        );
        assert_eq!(ControlMessage::RequestKeyframe.encode(), vec![0x0E]);
    }

    #[test]
    fn test_bitrate_mapping() {
        assert_eq!(clamp_bitrate(1), MIN_BITRATE);
        assert_eq!(clamp_bitrate(50_000_000), MAX_BITRATE);
        assert_eq!(clamp_bitrate(3_000_000), 3_000_000);

        assert_eq!(quality_to_bitrate(0), 500_000);
        assert_eq!(quality_to_bitrate(25), 500_000);
        assert_eq!(quality_to_bitrate(26), 1_000_000);
        assert_eq!(quality_to_bitrate(75), 2_000_000);
        assert_eq!(quality_to_bitrate(76), 4_000_000);
        assert_eq!(quality_to_bitrate(255), 4_000_000);
    }

    #[test]
    fn test_server_command() {
        let framed = server_command(4_000_000, 720, 30, StreamMode::Framed);
        assert!(framed.starts_with(
            "CLASSPATH=/data/local/tmp/scrcpy-server.jar app_process / com.genymobile.scrcpy.Server 3.3.3 "
        ));
        assert!(framed.contains("video_bit_rate=4000000 max_size=720 max_fps=30"));
        assert!(!framed.contains("send_frame_meta"));
        assert!(framed.ends_with("cleanup=false power_off_on_close=false"));

        let raw = server_command(1_000_000, 1080, 60, StreamMode::Raw);
        assert!(raw.contains("send_device_meta=false send_frame_meta=false send_codec_meta=false send_dummy_byte=true"));
    }
}
