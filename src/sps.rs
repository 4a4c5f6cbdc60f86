//! H.264 sequence parameter set parsing.
//!
//! Only the fields needed to recover the coded picture size are interpreted;
//! everything else is read and discarded. VUI parameters that follow the
//! cropping window are never touched.

use crate::nal::strip_start_code;
use anyhow::{anyhow, bail, Result};

/// Profiles that carry the chroma/bit-depth/scaling-matrix extension.
const HIGH_PROFILES: [u8; 13] = [100, 110, 122, 244, 44, 83, 86, 118, 128, 138, 139, 134, 135];

/// Fields recovered from an SPS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpsInfo {
    pub profile_idc: u8,
    /// constraint_set0..5 flags plus reserved bits, as the raw byte.
    pub constraint_flags: u8,
    pub level_idc: u8,
    /// 0 = monochrome, 1 = 4:2:0, 2 = 4:2:2, 3 = 4:4:4.
    pub chroma_format_idc: u32,
    pub width: u32,
    pub height: u32,
}

/// Remove emulation prevention bytes (`00 00 03` becomes `00 00`).
pub fn unescape_rbsp(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut zeros = 0;
    for &b in data {
        if zeros >= 2 && b == 0x03 {
            zeros = 0;
            continue;
        }
        out.push(b);
        zeros = if b == 0 { zeros + 1 } else { 0 };
    }
    out
}

/// MSB-first bit cursor with Exp-Golomb decoding.
struct BitReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BitReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn bit(&mut self) -> Result<u32> {
        let byte = self
            .data
            .get(self.pos / 8)
            .ok_or_else(|| anyhow!("SPS truncated at bit {}", self.pos))?;
        let bit = (byte >> (7 - (self.pos % 8))) & 1;
        self.pos += 1;
        Ok(bit as u32)
    }

    fn flag(&mut self) -> Result<bool> {
        Ok(self.bit()? == 1)
    }

    fn bits(&mut self, n: u32) -> Result<u32> {
        let mut value = 0u32;
        for _ in 0..n {
            value = (value << 1) | self.bit()?;
        }
        Ok(value)
    }

    fn ue(&mut self) -> Result<u32> {
        let mut zeros = 0u32;
        while self.bit()? == 0 {
            zeros += 1;
            if zeros > 31 {
                bail!("invalid Exp-Golomb code at bit {}", self.pos);
            }
        }
        if zeros == 0 {
            return Ok(0);
        }
        let suffix = self.bits(zeros)? as u64;
        Ok(((1u64 << zeros) - 1 + suffix) as u32)
    }

    fn se(&mut self) -> Result<i32> {
        let k = self.ue()? as i64;
        let value = if k & 1 == 1 { (k + 1) / 2 } else { -(k / 2) };
        Ok(value as i32)
    }
}

/// Skip one scaling_list() of `size` entries.
fn skip_scaling_list(r: &mut BitReader, size: usize) -> Result<()> {
    let mut last = 8i32;
    let mut next = 8i32;
    for _ in 0..size {
        if next != 0 {
            let delta = r.se()?;
            next = (last + delta + 256).rem_euclid(256);
        }
        if next != 0 {
            last = next;
        }
    }
    Ok(())
}

/// Parse an SPS NAL unit (start code optional) and compute the cropped
/// picture size.
pub fn parse_sps(nal: &[u8]) -> Result<SpsInfo> {
    let nal = strip_start_code(nal);
    let header = *nal.first().ok_or_else(|| anyhow!("empty SPS"))?;
    if header & 0x1F != 7 {
        bail!("not an SPS (NAL type {})", header & 0x1F);
    }

    let rbsp = unescape_rbsp(&nal[1..]);
    let mut r = BitReader::new(&rbsp);

    let profile_idc = r.bits(8)? as u8;
    let constraint_flags = r.bits(8)? as u8;
    let level_idc = r.bits(8)? as u8;
    let _seq_parameter_set_id = r.ue()?;

    let mut chroma_format_idc = 1;
    if HIGH_PROFILES.contains(&profile_idc) {
        chroma_format_idc = r.ue()?;
        if chroma_format_idc == 3 {
            let _separate_colour_plane = r.flag()?;
        }
        let _bit_depth_luma_minus8 = r.ue()?;
        let _bit_depth_chroma_minus8 = r.ue()?;
        let _qpprime_y_zero_transform_bypass = r.flag()?;
        if r.flag()? {
            let lists = if chroma_format_idc == 3 { 12 } else { 8 };
            for i in 0..lists {
                if r.flag()? {
                    skip_scaling_list(&mut r, if i < 6 { 16 } else { 64 })?;
                }
            }
        }
    }

    let _log2_max_frame_num_minus4 = r.ue()?;
    match r.ue()? {
        0 => {
            let _log2_max_pic_order_cnt_lsb_minus4 = r.ue()?;
        }
        1 => {
            let _delta_pic_order_always_zero = r.flag()?;
            let _offset_for_non_ref_pic = r.se()?;
            let _offset_for_top_to_bottom_field = r.se()?;
            let cycle = r.ue()?;
            for _ in 0..cycle {
                let _offset_for_ref_frame = r.se()?;
            }
        }
        _ => {}
    }

    let _max_num_ref_frames = r.ue()?;
    let _gaps_in_frame_num_allowed = r.flag()?;
    let width_in_mbs_minus1 = r.ue()? as i64;
    let height_in_map_units_minus1 = r.ue()? as i64;
    let frame_mbs_only = r.bit()? as i64;
    if frame_mbs_only == 0 {
        let _mb_adaptive_frame_field = r.flag()?;
    }
    let _direct_8x8_inference = r.flag()?;

    let (mut crop_left, mut crop_right, mut crop_top, mut crop_bottom) = (0i64, 0i64, 0i64, 0i64);
    if r.flag()? {
        crop_left = r.ue()? as i64;
        crop_right = r.ue()? as i64;
        crop_top = r.ue()? as i64;
        crop_bottom = r.ue()? as i64;
    }

    let (crop_unit_x, crop_unit_y) = match chroma_format_idc {
        0 => (1, 2 - frame_mbs_only),
        1 => (2, 2 * (2 - frame_mbs_only)),
        2 => (2, 2 - frame_mbs_only),
        _ => (1, 2 - frame_mbs_only),
    };

    let width = (width_in_mbs_minus1 + 1) * 16 - (crop_left + crop_right) * crop_unit_x;
    let height = (height_in_map_units_minus1 + 1) * 16 * (2 - frame_mbs_only)
        - (crop_top + crop_bottom) * crop_unit_y;

    if width <= 0 || height <= 0 || width > u32::MAX as i64 || height > u32::MAX as i64 {
        bail!("SPS yields invalid picture size {}x{}", width, height);
    }

    Ok(SpsInfo {
        profile_idc,
        constraint_flags,
        level_idc,
        chroma_format_idc,
        width: width as u32,
        height: height as u32,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_start_code(sps: &[u8]) -> Vec<u8> {
        let mut v = vec![0, 0, 0, 1];
        v.extend_from_slice(sps);
        v
    }

    #[test]
    fn test_baseline_720p() {
        let sps = with_start_code(&[0x67, 0x42, 0xC0, 0x1F, 0xDA, 0x01, 0x40, 0x16, 0xE4]);
        let info = parse_sps(&sps).unwrap();
        assert_eq!(info.profile_idc, 66);
        assert_eq!(info.constraint_flags, 0xC0);
        assert_eq!(info.level_idc, 31);
        assert_eq!(info.chroma_format_idc, 1);
        assert_eq!((info.width, info.height), (1280, 720));
    }

    #[test]
    fn test_baseline_1080p_cropped() {
        // 1920x1088 coded, 8 rows cropped at the bottom
        let sps = [0x67, 0x42, 0xC0, 0x28, 0xDA, 0x01, 0xE0, 0x08, 0x9F, 0x95];
        let info = parse_sps(&with_start_code(&sps)).unwrap();
        assert_eq!((info.width, info.height), (1920, 1080));
        // Start code is optional
        assert_eq!(parse_sps(&sps).unwrap(), info);
    }

    #[test]
    fn test_high_profile() {
        let sps = [0x67, 0x64, 0x00, 0x28, 0xAC, 0xDA, 0x01, 0xE0, 0x08, 0x9F, 0x95];
        let info = parse_sps(&with_start_code(&sps)).unwrap();
        assert_eq!(info.profile_idc, 100);
        assert_eq!(info.chroma_format_idc, 1);
        assert_eq!((info.width, info.height), (1920, 1080));
    }

    #[test]
    fn test_interlaced() {
        // Main profile, field coding: 45x18 map units of 32 lines
        let sps = [0x67, 0x4D, 0x40, 0x1E, 0xED, 0x01, 0x68, 0x49, 0xFD];
        let info = parse_sps(&with_start_code(&sps)).unwrap();
        assert_eq!((info.width, info.height), (720, 576));
    }

    #[test]
    fn test_interlaced_poc_type1_cropped() {
        let sps = [
            0x67, 0x4D, 0x40, 0x1E, 0xD1, 0x91, 0xA3, 0xA0, 0x1E, 0x01, 0x13, 0xF6, 0x80,
        ];
        let info = parse_sps(&with_start_code(&sps)).unwrap();
        assert_eq!((info.width, info.height), (1920, 1080));
    }

    #[test]
    fn test_scaling_matrix() {
        let sps = [
            0x67, 0x64, 0x00, 0x29, 0xAD, 0x8A, 0x0D, 0xA8, 0x86, 0x0E, 0x88, 0x45, 0xB4, 0x03,
            0xC0, 0x11, 0x3F, 0x2A,
        ];
        let info = parse_sps(&with_start_code(&sps)).unwrap();
        assert_eq!(info.level_idc, 41);
        assert_eq!((info.width, info.height), (1920, 1080));
    }

    #[test]
    fn test_chroma_444_crop_units() {
        let sps = [0x67, 0xF4, 0x00, 0x32, 0x91, 0x96, 0x80, 0xA0, 0x3D, 0xD2, 0xD0];
        let info = parse_sps(&with_start_code(&sps)).unwrap();
        assert_eq!(info.chroma_format_idc, 3);
        assert_eq!((info.width, info.height), (638, 480));
    }

    #[test]
    fn test_emulation_prevention() {
        let sps = [
            0x67, 0x42, 0xC0, 0x1F, 0xDA, 0x00, 0x04, 0x00, 0x00, 0x03, 0x02, 0x00, 0x19,
        ];
        let info = parse_sps(&sps).unwrap();
        assert_eq!((info.width, info.height), (65536, 65536));

        assert_eq!(unescape_rbsp(&[0, 0, 3, 1, 0, 0, 3]), vec![0, 0, 1, 0, 0]);
        assert_eq!(unescape_rbsp(&[0, 3, 0, 0, 0, 3]), vec![0, 3, 0, 0, 0]);
    }

    #[test]
    fn test_rejects_non_sps() {
        let err = parse_sps(&[0, 0, 0, 1, 0x68, 0xCE, 0x3C, 0x80]).unwrap_err();
        assert!(err.to_string().contains("not an SPS"));
        assert!(parse_sps(&[0, 0, 0, 1]).is_err());
    }

    #[test]
    fn test_truncated() {
        assert!(parse_sps(&[0x67, 0x42, 0xC0, 0x1F, 0xDA]).is_err());
        assert!(parse_sps(&[0x67, 0x42]).is_err());
    }

    #[test]
    fn test_long_golomb_prefix() {
        let sps = [0x67, 0x42, 0xC0, 0x1F, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01];
        let err = parse_sps(&sps).unwrap_err();
        assert!(err.to_string().contains("Exp-Golomb"));
    }

    #[test]
    fn test_zero_size_after_crop() {
        let sps = [0x67, 0x42, 0xC0, 0x1F, 0xDA, 0x7C, 0xA5, 0xD0];
        let err = parse_sps(&sps).unwrap_err();
        assert!(err.to_string().contains("invalid picture size"));
    }
}
