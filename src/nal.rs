//! H.264 Annex-B framing.
//!
//! The capture socket delivers an arbitrary chunking of the byte stream, so
//! [`NalFramer`] accumulates input and only hands out units once the start code
//! of the *next* unit has been seen. Units are `Bytes` views into the
//! accumulator, so extraction does not copy payload data.

use bytes::{Buf, Bytes, BytesMut};

/// Accumulator limit. Past this the buffer is discarded.
pub const MAX_FRAMER_BUFFER: usize = 8 * 1024 * 1024;

/// NAL unit type (low 5 bits of the NAL header).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NalType {
    /// Non-IDR slice (P or B frame)
    Slice,
    /// IDR slice (keyframe)
    Idr,
    /// Supplemental enhancement information
    Sei,
    /// Sequence parameter set
    Sps,
    /// Picture parameter set
    Pps,
    /// Access unit delimiter
    Aud,
    /// Anything else
    Other(u8),
}

impl From<u8> for NalType {
    fn from(header: u8) -> Self {
        match header & 0x1F {
            1 => NalType::Slice,
            5 => NalType::Idr,
            6 => NalType::Sei,
            7 => NalType::Sps,
            8 => NalType::Pps,
            9 => NalType::Aud,
            n => NalType::Other(n),
        }
    }
}

impl NalType {
    /// Numeric type value.
    pub fn as_u8(&self) -> u8 {
        match self {
            NalType::Slice => 1,
            NalType::Idr => 5,
            NalType::Sei => 6,
            NalType::Sps => 7,
            NalType::Pps => 8,
            NalType::Aud => 9,
            NalType::Other(n) => *n,
        }
    }

    pub fn is_keyframe(&self) -> bool {
        matches!(self, NalType::Idr)
    }

    /// SPS or PPS.
    pub fn is_parameter_set(&self) -> bool {
        matches!(self, NalType::Sps | NalType::Pps)
    }
}

/// One NAL unit, including its Annex-B start code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NalUnit {
    pub nal_type: NalType,
    pub data: Bytes,
}

impl NalUnit {
    /// Unit bytes after the start code (header byte first).
    pub fn payload(&self) -> &[u8] {
        strip_start_code(&self.data)
    }

    pub fn is_keyframe(&self) -> bool {
        self.nal_type.is_keyframe()
    }
}

/// Strip a leading 4-byte or 3-byte start code, if present.
pub fn strip_start_code(data: &[u8]) -> &[u8] {
    if data.starts_with(&[0, 0, 0, 1]) {
        &data[4..]
    } else if data.starts_with(&[0, 0, 1]) {
        &data[3..]
    } else {
        data
    }
}

/// NAL type of a unit given with or without its start code.
pub fn nal_type_of(unit: &[u8]) -> Option<NalType> {
    strip_start_code(unit).first().map(|&b| NalType::from(b))
}

/// All start codes in `data` as `(offset, length)`.
///
/// At each offset the 4-byte form is tried before the 3-byte form, and the
/// scan resumes after the matched code.
pub fn find_start_codes(data: &[u8]) -> Vec<(usize, usize)> {
    let mut codes = Vec::new();
    let mut i = 0;
    while i + 3 <= data.len() {
        if data[i] != 0 || data[i + 1] != 0 {
            i += 1;
            continue;
        }
        if i + 4 <= data.len() && data[i + 2] == 0 && data[i + 3] == 1 {
            codes.push((i, 4));
            i += 4;
        } else if data[i + 2] == 1 {
            codes.push((i, 3));
            i += 3;
        } else {
            i += 1;
        }
    }
    codes
}

/// Build units from `chunk` given the start codes inside it. Each unit runs
/// from its start code to the next code (or `end`).
fn units_between(chunk: &Bytes, codes: &[(usize, usize)], end: usize) -> Vec<NalUnit> {
    let mut units = Vec::with_capacity(codes.len());
    for (idx, &(pos, len)) in codes.iter().enumerate() {
        let unit_end = codes.get(idx + 1).map_or(end, |&(next, _)| next);
        // Empty unit: start code directly followed by another
        let Some(&header) = chunk.get(pos + len).filter(|_| pos + len < unit_end) else {
            continue;
        };
        units.push(NalUnit {
            nal_type: NalType::from(header),
            data: chunk.slice(pos..unit_end),
        });
    }
    units
}

/// Split a complete Annex-B buffer into units. The last unit runs to the end
/// of the buffer; bytes before the first start code are ignored.
pub fn split_annex_b(data: &Bytes) -> Vec<NalUnit> {
    let codes = find_start_codes(data);
    units_between(data, &codes, data.len())
}

/// Incremental Annex-B framer.
///
/// Start codes already found stay cached between calls, and each `extract`
/// only scans the bytes fed since the previous one (plus a 3-byte overlap for
/// a code split across feeds).
#[derive(Debug, Default)]
pub struct NalFramer {
    buffer: BytesMut,
    /// Start codes in `buffer`, relative to its start.
    codes: Vec<(usize, usize)>,
    /// Offset where the next scan resumes.
    scan_from: usize,
    dropped_bytes: u64,
}

impl NalFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Bytes discarded so far (leading garbage and overflow resets).
    pub fn dropped_bytes(&self) -> u64 {
        self.dropped_bytes
    }

    /// Append stream data.
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
        if self.buffer.len() > MAX_FRAMER_BUFFER {
            tracing::warn!(
                "NAL framer buffer exceeded {} bytes without a complete unit, resetting",
                MAX_FRAMER_BUFFER
            );
            self.dropped_bytes += self.buffer.len() as u64;
            self.reset();
        }
    }

    fn reset(&mut self) {
        self.buffer.clear();
        self.codes.clear();
        self.scan_from = 0;
    }

    /// Scan the unscanned tail of the buffer for start codes.
    fn scan(&mut self) {
        let from = self.scan_from;
        self.codes.extend(
            find_start_codes(&self.buffer[from..])
                .into_iter()
                .map(|(pos, len)| (pos + from, len)),
        );
        // The last 3 bytes may begin a 4-byte code that is not complete yet
        let code_end = self.codes.last().map_or(0, |&(pos, len)| pos + len);
        self.scan_from = code_end.max(self.buffer.len().saturating_sub(3));
    }

    /// Return every complete unit, keeping the last (possibly partial) one
    /// buffered.
    pub fn extract(&mut self) -> Vec<NalUnit> {
        self.scan();

        let Some(&(first, _)) = self.codes.first() else {
            // Keep a possible partial start code at the tail
            let keep = self.buffer.len().min(3);
            let discard = self.buffer.len() - keep;
            if discard > 0 {
                self.dropped_bytes += discard as u64;
                self.buffer.advance(discard);
            }
            self.scan_from = 0;
            return Vec::new();
        };

        if first > 0 {
            self.dropped_bytes += first as u64;
            self.buffer.advance(first);
            for code in &mut self.codes {
                code.0 -= first;
            }
            self.scan_from -= first;
        }
        if self.codes.len() < 2 {
            return Vec::new();
        }

        let (last, last_len) = self.codes[self.codes.len() - 1];
        let chunk = self.buffer.split_to(last).freeze();
        let units = units_between(&chunk, &self.codes[..self.codes.len() - 1], last);
        self.codes.clear();
        self.codes.push((0, last_len));
        self.scan_from -= last;
        units
    }

    /// Return the final buffered unit at end of stream and reset.
    pub fn flush(&mut self) -> Option<NalUnit> {
        let chunk = self.buffer.split().freeze();
        self.reset();
        split_annex_b(&chunk).pop()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream() -> Vec<u8> {
        let mut data = vec![0xAA, 0xBB]; // garbage
        data.extend_from_slice(&[0, 0, 0, 1, 0x67, 0x42, 0xC0, 0x1F]);
        data.extend_from_slice(&[0, 0, 0, 1, 0x68, 0xCE, 0x3C, 0x80]);
        data.extend_from_slice(&[0, 0, 1, 0x65, 0x88, 0x84, 0x00, 0x10]);
        data.extend_from_slice(&[0, 0, 0, 1, 0x41, 0x9A, 0x00, 0x00, 0x03, 0x01]);
        data.extend_from_slice(&[0, 0, 1, 0x41, 0x9B]);
        data
    }

    fn collect(chunks: &[&[u8]]) -> Vec<NalUnit> {
        let mut framer = NalFramer::new();
        let mut out = Vec::new();
        for chunk in chunks {
            framer.feed(chunk);
            out.extend(framer.extract());
        }
        out.extend(framer.flush());
        out
    }

    #[test]
    fn test_find_start_codes() {
        let data = [0, 0, 0, 1, 0x67, 0, 0, 1, 0x68, 0, 0, 0, 0, 1, 0x65];
        assert_eq!(find_start_codes(&data), vec![(0, 4), (5, 3), (10, 4)]);
        assert!(find_start_codes(&[0, 0]).is_empty());
    }

    #[test]
    fn test_extract_keeps_last_unit() {
        let mut framer = NalFramer::new();
        framer.feed(&stream());
        let units = framer.extract();
        let types: Vec<u8> = units.iter().map(|u| u.nal_type.as_u8()).collect();
        assert_eq!(types, vec![7, 8, 5, 1]);
        assert_eq!(&units[0].data[..], &[0, 0, 0, 1, 0x67, 0x42, 0xC0, 0x1F]);
        assert_eq!(units[2].payload(), &[0x65, 0x88, 0x84, 0x00, 0x10]);
        assert_eq!(framer.dropped_bytes(), 2);

        let last = framer.flush().unwrap();
        assert_eq!(&last.data[..], &[0, 0, 1, 0x41, 0x9B]);
        assert_eq!(framer.buffered(), 0);
        assert!(framer.flush().is_none());
    }

    #[test]
    fn test_single_start_code_yields_nothing() {
        let mut framer = NalFramer::new();
        framer.feed(&[0, 0, 0, 1, 0x65, 0x88, 0x84]);
        assert!(framer.extract().is_empty());
        assert_eq!(framer.buffered(), 7);
    }

    #[test]
    fn test_split_invariance() {
        let data = stream();
        let whole = collect(&[&data]);
        assert_eq!(whole.len(), 5);

        for cut in 0..=data.len() {
            let (a, b) = data.split_at(cut);
            assert_eq!(collect(&[a, b]), whole, "split at {}", cut);
        }

        let bytewise: Vec<&[u8]> = data.chunks(1).collect();
        assert_eq!(collect(&bytewise), whole);

        let triples: Vec<&[u8]> = data.chunks(3).collect();
        assert_eq!(collect(&triples), whole);
    }

    #[test]
    fn test_garbage_only_is_discarded() {
        let mut framer = NalFramer::new();
        framer.feed(&[1, 2, 3, 4, 5, 6, 7, 8]);
        assert!(framer.extract().is_empty());
        assert_eq!(framer.buffered(), 3);
        assert_eq!(framer.dropped_bytes(), 5);
    }

    #[test]
    fn test_buffer_cap_resets() {
        let mut framer = NalFramer::new();
        framer.feed(&[0, 0, 0, 1, 0x65]);
        framer.feed(&vec![0x11; MAX_FRAMER_BUFFER]);
        assert_eq!(framer.buffered(), 0);
        assert!(framer.extract().is_empty());
    }

    #[test]
    fn test_split_annex_b_helpers() {
        let data = Bytes::from(stream());
        let units = split_annex_b(&data);
        assert_eq!(units.len(), 5);
        assert_eq!(units[4].nal_type, NalType::Slice);
        assert!(units[2].is_keyframe());

        assert_eq!(nal_type_of(&[0, 0, 1, 0x68]), Some(NalType::Pps));
        assert_eq!(nal_type_of(&[0x67, 0x42]), Some(NalType::Sps));
        assert_eq!(nal_type_of(&[0, 0, 0, 1]), None);
        assert_eq!(NalType::from(0x6C), NalType::Other(12));
        assert!(NalType::Pps.is_parameter_set());
    }

    #[test]
    fn test_extract_scans_only_new_bytes() {
        let mut framer = NalFramer::new();
        framer.feed(&[0, 0, 0, 1, 0x65]);
        for _ in 0..10 {
            framer.feed(&[0x11; 1000]);
            assert!(framer.extract().is_empty());
            assert_eq!(framer.codes, vec![(0, 4)]);
            assert_eq!(framer.scan_from, framer.buffered() - 3);
        }

        // Next start code split across two feeds
        framer.feed(&[0, 0]);
        assert!(framer.extract().is_empty());
        framer.feed(&[0, 1, 0x41, 0x9A]);
        let units = framer.extract();
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].nal_type, NalType::Idr);
        assert_eq!(units[0].data.len(), 5 + 10_000);
        assert_eq!(framer.codes, vec![(0, 4)]);
        assert_eq!(framer.buffered(), 6);

        let last = framer.flush().unwrap();
        assert_eq!(&last.data[..], &[0, 0, 0, 1, 0x41, 0x9A]);
        assert!(framer.codes.is_empty());
        assert_eq!(framer.scan_from, 0);
    }

    #[test]
    fn test_empty_units_skipped() {
        let data = Bytes::from_static(&[0, 0, 0, 1, 0, 0, 1, 0x65, 0x01]);
        let units = split_annex_b(&data);
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].nal_type, NalType::Idr);
    }
}
