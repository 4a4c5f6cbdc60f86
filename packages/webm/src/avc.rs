//! H.264 helpers for the Matroska `V_MPEG4/ISO/AVC` track: the
//! AVCDecoderConfigurationRecord stored in CodecPrivate, and Annex-B to
//! length-prefixed (AVCC) payload conversion.

/// Strip a leading 4-byte or 3-byte Annex-B start code, if present.
pub fn strip_start_code(data: &[u8]) -> &[u8] {
    if data.starts_with(&[0, 0, 0, 1]) {
        &data[4..]
    } else if data.starts_with(&[0, 0, 1]) {
        &data[3..]
    } else {
        data
    }
}

/// Build an AVCDecoderConfigurationRecord (ISO/IEC 14496-15) from one SPS and
/// one PPS. Start codes are stripped before use.
///
/// Returns `None` when the SPS is shorter than 4 bytes or the PPS is empty.
pub fn build_avc_config_record(sps: &[u8], pps: &[u8]) -> Option<Vec<u8>> {
    let sps = strip_start_code(sps);
    let pps = strip_start_code(pps);
    if sps.len() < 4 || pps.is_empty() {
        return None;
    }

    let mut record = Vec::with_capacity(11 + sps.len() + pps.len());
    record.push(1); // configurationVersion
    record.push(sps[1]); // AVCProfileIndication
    record.push(sps[2]); // profile_compatibility
    record.push(sps[3]); // AVCLevelIndication
    record.push(0xFF); // reserved | lengthSizeMinusOne = 3
    record.push(0xE1); // reserved | numOfSequenceParameterSets = 1
    record.extend_from_slice(&(sps.len() as u16).to_be_bytes());
    record.extend_from_slice(sps);
    record.push(1); // numOfPictureParameterSets
    record.extend_from_slice(&(pps.len() as u16).to_be_bytes());
    record.extend_from_slice(pps);
    Some(record)
}

/// Positions of every start code as `(offset, length)`, scanning past each
/// match. At a given offset the 4-byte form is checked before the 3-byte one.
fn start_codes(data: &[u8]) -> Vec<(usize, usize)> {
    let mut found = Vec::new();
    let mut i = 0;
    while i + 3 <= data.len() {
        if i + 4 <= data.len() && data[i..i + 4] == [0, 0, 0, 1] {
            found.push((i, 4));
            i += 4;
        } else if data[i..i + 3] == [0, 0, 1] {
            found.push((i, 3));
            i += 3;
        } else {
            i += 1;
        }
    }
    found
}

/// Convert an Annex-B access unit to 4-byte length-prefixed NAL units.
///
/// Each region between start codes becomes one record. Trailing zero bytes of
/// a region (trailing_zero_8bits, or the first byte of a following 4-byte
/// start code seen as a 3-byte one) are not part of the NAL and are dropped.
/// Empty regions produce no record. Input without any start code is treated
/// as a single NAL.
pub fn annex_b_to_avcc(data: &[u8]) -> Vec<u8> {
    let codes = start_codes(data);
    if codes.is_empty() {
        let mut out = Vec::with_capacity(4 + data.len());
        out.extend_from_slice(&(data.len() as u32).to_be_bytes());
        out.extend_from_slice(data);
        return out;
    }

    let mut out = Vec::with_capacity(data.len() + codes.len() * 4);
    for (idx, &(pos, len)) in codes.iter().enumerate() {
        let start = pos + len;
        let mut end = codes.get(idx + 1).map_or(data.len(), |&(next, _)| next);
        while end > start && data[end - 1] == 0 {
            end -= 1;
        }
        if end > start {
            let nal = &data[start..end];
            out.extend_from_slice(&(nal.len() as u32).to_be_bytes());
            out.extend_from_slice(nal);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Walk length-prefixed records and return their payloads.
    fn records(avcc: &[u8]) -> Vec<&[u8]> {
        let mut out = Vec::new();
        let mut offset = 0;
        while offset + 4 <= avcc.len() {
            let len = u32::from_be_bytes([
                avcc[offset],
                avcc[offset + 1],
                avcc[offset + 2],
                avcc[offset + 3],
            ]) as usize;
            out.push(&avcc[offset + 4..offset + 4 + len]);
            offset += 4 + len;
        }
        assert_eq!(offset, avcc.len());
        out
    }

    #[test]
    fn test_strip_start_code() {
        assert_eq!(strip_start_code(&[0, 0, 0, 1, 0x67]), &[0x67]);
        assert_eq!(strip_start_code(&[0, 0, 1, 0x68]), &[0x68]);
        assert_eq!(strip_start_code(&[0x65, 0x88]), &[0x65, 0x88]);
    }

    #[test]
    fn test_avc_config_record() {
        let sps = [0, 0, 0, 1, 0x67, 0x64, 0x00, 0x28, 0xAC, 0xDA];
        let pps = [0, 0, 1, 0x68, 0xEE, 0x3C, 0x80];
        let record = build_avc_config_record(&sps, &pps).unwrap();

        assert_eq!(&record[..6], &[1, 0x64, 0x00, 0x28, 0xFF, 0xE1]);
        assert_eq!(&record[6..8], &6u16.to_be_bytes());
        assert_eq!(&record[8..14], &sps[4..]);
        assert_eq!(record[14], 1);
        assert_eq!(&record[15..17], &4u16.to_be_bytes());
        assert_eq!(&record[17..], &pps[3..]);
    }

    #[test]
    fn test_avc_config_record_rejects_short_input() {
        assert!(build_avc_config_record(&[0, 0, 0, 1, 0x67, 0x42], &[0x68]).is_none());
        assert!(build_avc_config_record(&[0x67, 0x42, 0x00, 0x1F], &[0, 0, 0, 1]).is_none());
    }

    #[test]
    fn test_avcc_record_count_and_payload_total() {
        let nals: [&[u8]; 4] = [
            &[0x67, 0x42, 0xC0, 0x1F, 0xDA],
            &[0x68, 0xCE, 0x3C, 0x80],
            &[0x06, 0x05, 0x11],
            &[0x65, 0x88, 0x84, 0x00, 0x21, 0x7F],
        ];
        let mut annex_b = Vec::new();
        for (i, nal) in nals.iter().enumerate() {
            if i % 2 == 0 {
                annex_b.extend_from_slice(&[0, 0, 0, 1]);
            } else {
                annex_b.extend_from_slice(&[0, 0, 1]);
            }
            annex_b.extend_from_slice(nal);
        }

        let avcc = annex_b_to_avcc(&annex_b);
        let out = records(&avcc);
        assert_eq!(out.len(), nals.len());
        let total: usize = out.iter().map(|r| r.len()).sum();
        assert_eq!(total, nals.iter().map(|n| n.len()).sum::<usize>());
        for (got, want) in out.iter().zip(nals.iter()) {
            assert_eq!(got, want);
        }
    }

    #[test]
    fn test_avcc_trims_trailing_zero_padding() {
        // Slice followed by trailing_zero_8bits before the next start code
        let data = [0, 0, 0, 1, 0x41, 0x9A, 0x10, 0, 0, 0, 0, 0, 1, 0x41, 0x9B];
        let avcc = annex_b_to_avcc(&data);
        let out = records(&avcc);
        assert_eq!(out, vec![&[0x41, 0x9A, 0x10][..], &[0x41, 0x9B][..]]);
    }

    #[test]
    fn test_avcc_without_start_code() {
        let data = [0x65, 0x88, 0x80];
        let avcc = annex_b_to_avcc(&data);
        assert_eq!(avcc, vec![0, 0, 0, 3, 0x65, 0x88, 0x80]);
    }
}
