//! EBML primitives used by the WebM writer.
//!
//! Encoding side: element IDs, variable-size integers (VINT) and element
//! builders that append to a `Vec<u8>`. Decoding side: a small linear reader
//! that walks a written file and reports what it finds, used to verify output.
//!
//! ```text
//! Element:
//!   ID    1-4 bytes, length class carried by the leading bits of the ID itself
//!   Size  1-8 byte VINT (or the 8-byte unknown-size marker)
//!   Data  `Size` bytes
//! ```

use crate::error::{Result, WebmError};

/// Element IDs written by [`crate::WebmWriter`].
pub mod ids {
    // EBML header
    pub const EBML: u32 = 0x1A45_DFA3;
    pub const EBML_VERSION: u32 = 0x4286;
    pub const EBML_READ_VERSION: u32 = 0x42F7;
    pub const EBML_MAX_ID_LENGTH: u32 = 0x42F2;
    pub const EBML_MAX_SIZE_LENGTH: u32 = 0x42F3;
    pub const DOC_TYPE: u32 = 0x4282;
    pub const DOC_TYPE_VERSION: u32 = 0x4287;
    pub const DOC_TYPE_READ_VERSION: u32 = 0x4285;

    // Segment level
    pub const SEGMENT: u32 = 0x1853_8067;
    pub const INFO: u32 = 0x1549_A966;
    pub const TRACKS: u32 = 0x1654_AE6B;
    pub const CLUSTER: u32 = 0x1F43_B675;

    // Info
    pub const TIMECODE_SCALE: u32 = 0x2A_D7B1;
    pub const MUXING_APP: u32 = 0x4D80;
    pub const WRITING_APP: u32 = 0x5741;

    // Tracks
    pub const TRACK_ENTRY: u32 = 0xAE;
    pub const TRACK_NUMBER: u32 = 0xD7;
    pub const TRACK_UID: u32 = 0x73C5;
    pub const TRACK_TYPE: u32 = 0x83;
    pub const FLAG_ENABLED: u32 = 0xB9;
    pub const FLAG_DEFAULT: u32 = 0x88;
    pub const FLAG_LACING: u32 = 0x9C;
    pub const CODEC_ID: u32 = 0x86;
    pub const CODEC_PRIVATE: u32 = 0x63A2;
    pub const DEFAULT_DURATION: u32 = 0x23_E383;
    pub const VIDEO: u32 = 0xE0;
    pub const PIXEL_WIDTH: u32 = 0xB0;
    pub const PIXEL_HEIGHT: u32 = 0xBA;

    // Cluster
    pub const TIMECODE: u32 = 0xE7;
    pub const SIMPLE_BLOCK: u32 = 0xA3;
}

/// Reserved 8-byte size meaning "unknown / until the parent ends".
pub const UNKNOWN_SIZE: [u8; 8] = [0x01, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF];

/// Largest value representable by an 8-byte VINT (all-ones is reserved).
pub const MAX_VINT: u64 = (1 << 56) - 2;

// ============================================================================
// Encoding
// ============================================================================

/// Append an element ID.
///
/// The byte length follows the EBML ID classes: a leading `1` bit is a
/// 1-byte ID, `01` is 2 bytes, `001` is 3 bytes, anything else is written
/// as 4 bytes.
pub fn put_id(buf: &mut Vec<u8>, id: u32) {
    if id <= 0xFF && id & 0x80 != 0 {
        buf.push(id as u8);
    } else if id <= 0xFFFF && id & 0xC000 == 0x4000 {
        buf.extend_from_slice(&(id as u16).to_be_bytes());
    } else if id <= 0xFF_FFFF && id & 0xE0_0000 == 0x20_0000 {
        buf.extend_from_slice(&id.to_be_bytes()[1..]);
    } else {
        buf.extend_from_slice(&id.to_be_bytes());
    }
}

/// Append a size as a VINT using the shortest form.
///
/// A form of `n` bytes carries `7n` value bits; its all-ones value is
/// reserved, so each form holds values strictly below `2^(7n) - 1`.
pub fn put_vint(buf: &mut Vec<u8>, value: u64) {
    let mut len = 1usize;
    while len < 8 && value >= (1u64 << (7 * len)) - 1 {
        len += 1;
    }
    let marked = value | (1u64 << (7 * len));
    buf.extend_from_slice(&marked.to_be_bytes()[8 - len..]);
}

/// Number of bytes needed to hold `value` big-endian (at least one).
fn uint_width(value: u64) -> usize {
    let mut size = 1;
    let mut v = value >> 8;
    while v > 0 {
        size += 1;
        v >>= 8;
    }
    size
}

/// Append an unsigned integer element with a minimal-width payload.
pub fn put_uint(buf: &mut Vec<u8>, id: u32, value: u64) {
    let size = uint_width(value);
    put_id(buf, id);
    put_vint(buf, size as u64);
    buf.extend_from_slice(&value.to_be_bytes()[8 - size..]);
}

/// Append a string element.
pub fn put_string(buf: &mut Vec<u8>, id: u32, value: &str) {
    put_element(buf, id, value.as_bytes());
}

/// Append a binary or master element with known content.
pub fn put_element(buf: &mut Vec<u8>, id: u32, content: &[u8]) {
    put_id(buf, id);
    put_vint(buf, content.len() as u64);
    buf.extend_from_slice(content);
}

/// Append the header of an element whose size is left open.
pub fn put_unknown_size_header(buf: &mut Vec<u8>, id: u32) {
    put_id(buf, id);
    buf.extend_from_slice(&UNKNOWN_SIZE);
}

// ============================================================================
// Decoding
// ============================================================================

/// Read an element ID at `offset`, returning `(id, length)`.
pub fn read_id(data: &[u8], offset: usize) -> Result<(u32, usize)> {
    let first = *data
        .get(offset)
        .ok_or_else(|| WebmError::parse(format!("id past end at {}", offset)))?;
    let len = first.leading_zeros() as usize + 1;
    if len > 4 {
        return Err(WebmError::parse(format!(
            "invalid id lead byte 0x{:02x} at {}",
            first, offset
        )));
    }
    let bytes = data
        .get(offset..offset + len)
        .ok_or_else(|| WebmError::parse(format!("truncated id at {}", offset)))?;
    let id = bytes.iter().fold(0u32, |acc, &b| (acc << 8) | b as u32);
    Ok((id, len))
}

/// Read a VINT at `offset`, returning `(value, length)`.
///
/// `value` is `None` for the reserved unknown-size encoding (all value bits set).
pub fn read_vint(data: &[u8], offset: usize) -> Result<(Option<u64>, usize)> {
    let first = *data
        .get(offset)
        .ok_or_else(|| WebmError::parse(format!("vint past end at {}", offset)))?;
    if first == 0 {
        return Err(WebmError::parse(format!("invalid vint at {}", offset)));
    }
    let len = first.leading_zeros() as usize + 1;
    let bytes = data
        .get(offset..offset + len)
        .ok_or_else(|| WebmError::parse(format!("truncated vint at {}", offset)))?;
    let mask = if len == 8 { 0 } else { 0xFFu8 >> len };
    let mut value = (bytes[0] & mask) as u64;
    for &b in &bytes[1..] {
        value = (value << 8) | b as u64;
    }
    let all_ones = (1u64 << (7 * len)) - 1;
    if value == all_ones {
        Ok((None, len))
    } else {
        Ok((Some(value), len))
    }
}

/// An element header located while scanning.
#[derive(Debug, Clone)]
pub struct ElementHeader {
    pub id: u32,
    /// Offset of the first ID byte.
    pub offset: usize,
    /// Bytes taken by ID + size.
    pub header_size: usize,
    /// Content size, `None` when the unknown-size marker was used.
    pub size: Option<u64>,
    /// Nesting depth, 0 for top level.
    pub depth: usize,
}

impl ElementHeader {
    /// Content bytes of a sized element (empty for unknown-size elements).
    pub fn content<'a>(&self, data: &'a [u8]) -> &'a [u8] {
        let start = self.offset + self.header_size;
        match self.size {
            Some(size) => {
                let end = (start + size as usize).min(data.len());
                if start >= end {
                    &[]
                } else {
                    &data[start..end]
                }
            }
            None => &[],
        }
    }
}

fn is_master(id: u32) -> bool {
    matches!(
        id,
        ids::EBML | ids::SEGMENT | ids::INFO | ids::TRACKS | ids::TRACK_ENTRY | ids::VIDEO | ids::CLUSTER
    )
}

/// Walk a byte stream and return every element header in file order.
///
/// Master elements (and anything with an unknown size) are descended into
/// instead of skipped. Unknown-size elements stay open until an element of the
/// same ID appears, which is how consecutive clusters close each other.
pub fn scan_elements(data: &[u8]) -> Result<Vec<ElementHeader>> {
    let mut out = Vec::new();
    // (id, end offset or None for unknown size)
    let mut open: Vec<(u32, Option<usize>)> = Vec::new();
    let mut offset = 0;

    while offset < data.len() {
        while let Some(&(_, Some(end))) = open.last() {
            if offset >= end {
                open.pop();
            } else {
                break;
            }
        }

        let (id, id_len) = read_id(data, offset)?;
        if id == ids::CLUSTER {
            if let Some(pos) = open.iter().rposition(|&(open_id, _)| open_id == ids::CLUSTER) {
                open.truncate(pos);
            }
        }
        let (size, size_len) = read_vint(data, offset + id_len)?;
        let header_size = id_len + size_len;

        out.push(ElementHeader {
            id,
            offset,
            header_size,
            size,
            depth: open.len(),
        });

        let content_start = offset + header_size;
        match size {
            None => {
                open.push((id, None));
                offset = content_start;
            }
            Some(size) if is_master(id) => {
                open.push((id, Some(content_start + size as usize)));
                offset = content_start;
            }
            Some(size) => {
                let end = content_start + size as usize;
                if end > data.len() {
                    return Err(WebmError::parse(format!(
                        "element 0x{:x} at {} overruns data ({} > {})",
                        id,
                        offset,
                        end,
                        data.len()
                    )));
                }
                offset = end;
            }
        }
    }

    Ok(out)
}

fn read_uint(content: &[u8]) -> u64 {
    content.iter().fold(0u64, |acc, &b| (acc << 8) | b as u64)
}

/// Summary of a WebM file as seen by [`probe`].
#[derive(Debug, Clone, Default)]
pub struct ProbeInfo {
    pub doc_type: String,
    pub timecode_scale: u64,
    pub codec_id: String,
    pub codec_private: Option<Vec<u8>>,
    /// Track DefaultDuration in nanoseconds, 0 when absent.
    pub default_duration_ns: u64,
    pub width: u32,
    pub height: u32,
    pub clusters: usize,
    pub blocks: usize,
    pub keyframes: usize,
    /// Absolute block timestamps in milliseconds (cluster base + relative offset).
    pub block_times_ms: Vec<i64>,
}

/// Parse the structure of a WebM file: header fields, the video track and
/// cluster/block counts.
pub fn probe(data: &[u8]) -> Result<ProbeInfo> {
    let elements = scan_elements(data)?;
    let mut info = ProbeInfo::default();
    let mut cluster_base: Option<i64> = None;

    for el in &elements {
        let content = el.content(data);
        match el.id {
            ids::DOC_TYPE => info.doc_type = String::from_utf8_lossy(content).into_owned(),
            ids::TIMECODE_SCALE => info.timecode_scale = read_uint(content),
            ids::CODEC_ID => info.codec_id = String::from_utf8_lossy(content).into_owned(),
            ids::CODEC_PRIVATE => info.codec_private = Some(content.to_vec()),
            ids::DEFAULT_DURATION => info.default_duration_ns = read_uint(content),
            ids::PIXEL_WIDTH => info.width = read_uint(content) as u32,
            ids::PIXEL_HEIGHT => info.height = read_uint(content) as u32,
            ids::CLUSTER => {
                info.clusters += 1;
                cluster_base = None;
            }
            ids::TIMECODE => cluster_base = Some(read_uint(content) as i64),
            ids::SIMPLE_BLOCK => {
                if content.len() < 4 {
                    return Err(WebmError::parse(format!(
                        "SimpleBlock at {} too short",
                        el.offset
                    )));
                }
                let base = cluster_base.ok_or_else(|| {
                    WebmError::parse(format!("SimpleBlock at {} before cluster timecode", el.offset))
                })?;
                let relative = i16::from_be_bytes([content[1], content[2]]) as i64;
                info.blocks += 1;
                if content[3] & 0x80 != 0 {
                    info.keyframes += 1;
                }
                info.block_times_ms.push(base + relative);
            }
            _ => {}
        }
    }

    if info.doc_type.is_empty() {
        return Err(WebmError::parse("missing EBML DocType"));
    }
    Ok(info)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id_bytes(id: u32) -> Vec<u8> {
        let mut buf = Vec::new();
        put_id(&mut buf, id);
        buf
    }

    fn vint_bytes(value: u64) -> Vec<u8> {
        let mut buf = Vec::new();
        put_vint(&mut buf, value);
        buf
    }

    #[test]
    fn test_id_length_classes() {
        assert_eq!(id_bytes(ids::SIMPLE_BLOCK), vec![0xA3]);
        assert_eq!(id_bytes(ids::CODEC_PRIVATE), vec![0x63, 0xA2]);
        assert_eq!(id_bytes(ids::TIMECODE_SCALE), vec![0x2A, 0xD7, 0xB1]);
        assert_eq!(id_bytes(ids::DEFAULT_DURATION), vec![0x23, 0xE3, 0x83]);
        assert_eq!(id_bytes(ids::EBML), vec![0x1A, 0x45, 0xDF, 0xA3]);
        assert_eq!(id_bytes(ids::CLUSTER), vec![0x1F, 0x43, 0xB6, 0x75]);
    }

    #[test]
    fn test_vint_forms() {
        assert_eq!(vint_bytes(0), vec![0x80]);
        assert_eq!(vint_bytes(1), vec![0x81]);
        assert_eq!(vint_bytes(126), vec![0xFE]);
        // 127 is the 1-byte reserved value, so it needs 2 bytes
        assert_eq!(vint_bytes(127), vec![0x40, 0x7F]);
        assert_eq!(vint_bytes(0x3FFE), vec![0x7F, 0xFE]);
        assert_eq!(vint_bytes(0x3FFF), vec![0x20, 0x3F, 0xFF]);
        assert_eq!(vint_bytes(MAX_VINT).len(), 8);
        assert_eq!(vint_bytes(MAX_VINT)[0], 0x01);
    }

    #[test]
    fn test_uint_element_minimal_width() {
        let mut buf = Vec::new();
        put_uint(&mut buf, ids::TRACK_NUMBER, 1);
        assert_eq!(buf, vec![0xD7, 0x81, 0x01]);

        let mut buf = Vec::new();
        put_uint(&mut buf, ids::TIMECODE_SCALE, 1_000_000);
        assert_eq!(buf, vec![0x2A, 0xD7, 0xB1, 0x83, 0x0F, 0x42, 0x40]);

        let mut buf = Vec::new();
        put_uint(&mut buf, ids::FLAG_LACING, 0);
        assert_eq!(buf, vec![0x9C, 0x81, 0x00]);
    }

    #[test]
    fn test_read_back_id_and_vint() {
        for id in [ids::SIMPLE_BLOCK, ids::CODEC_PRIVATE, ids::TIMECODE_SCALE, ids::SEGMENT] {
            let bytes = id_bytes(id);
            assert_eq!(read_id(&bytes, 0).unwrap(), (id, bytes.len()));
        }
        for value in [0u64, 126, 127, 5000, 1 << 30] {
            let bytes = vint_bytes(value);
            assert_eq!(read_vint(&bytes, 0).unwrap(), (Some(value), bytes.len()));
        }
        assert_eq!(read_vint(&UNKNOWN_SIZE, 0).unwrap(), (None, 8));
    }

    #[test]
    fn test_scan_consecutive_unknown_size_clusters() {
        let mut buf = Vec::new();
        put_unknown_size_header(&mut buf, ids::SEGMENT);
        for base in [0u64, 1000] {
            put_unknown_size_header(&mut buf, ids::CLUSTER);
            put_uint(&mut buf, ids::TIMECODE, base);
            put_element(&mut buf, ids::SIMPLE_BLOCK, &[0x81, 0x00, 0x00, 0x80, 0xAA]);
        }

        let elements = scan_elements(&buf).unwrap();
        let clusters: Vec<_> = elements.iter().filter(|e| e.id == ids::CLUSTER).collect();
        assert_eq!(clusters.len(), 2);
        // Second cluster is a sibling of the first, not nested inside it
        assert_eq!(clusters[0].depth, clusters[1].depth);
        let blocks = elements.iter().filter(|e| e.id == ids::SIMPLE_BLOCK).count();
        assert_eq!(blocks, 2);
    }

    #[test]
    fn test_scan_rejects_overrun() {
        let buf = vec![0xA3, 0x85, 0x01, 0x02];
        assert!(scan_elements(&buf).is_err());
    }
}
