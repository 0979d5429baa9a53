//! Per-channel conversions between UC8, H16 and F32.
//!
//! UC8 maps linearly onto [0, 1]. H16 values are raw IEEE half-float bits; the
//! `half` crate uses the CPU's F16C/NEON conversion when available.
//!
//! UC8 encoding rounds to nearest, so a byte survives UC8 -> H16 -> UC8 and
//! UC8 -> F32 -> UC8 unchanged.

use half::f16;

use common::types::ChanMode;

pub fn f32_to_uc8(f: f32) -> u8 {
    if f.is_nan() || f <= 0.0 {
        0
    } else if f >= 1.0 {
        255
    } else {
        (f * 255.0 + 0.5) as u8
    }
}

pub fn uc8_to_f32(uc: u8) -> f32 {
    uc as f32 / 255.0
}

pub fn f32_to_h16(f: f32) -> u16 {
    f16::from_f32(f).to_bits()
}

pub fn h16_to_f32(h: u16) -> f32 {
    f16::from_bits(h).to_f32()
}

pub fn h16_to_uc8(h: u16) -> u8 {
    f32_to_uc8(h16_to_f32(h))
}

pub fn uc8_to_h16(uc: u8) -> u16 {
    f32_to_h16(uc8_to_f32(uc))
}

pub fn h16_zero() -> u16 {
    f32_to_h16(0.0)
}

/// `f32 -> h16 -> f32 -> h16` is stable bit-for-bit.
pub fn h16_round_trip_stable(f: f32) -> bool {
    let h0 = f32_to_h16(f);
    let f0 = h16_to_f32(h0);
    let h1 = f32_to_h16(f0);
    let f1 = h16_to_f32(h1);
    h0 == h1 && f0.to_bits() == f1.to_bits()
}

// === Raw channel access on native-endian byte slices ===

/// Decode channel `index` of `mode` from `bytes` into f32.
pub fn load_f32(mode: ChanMode, bytes: &[u8], index: usize) -> f32 {
    match mode {
        ChanMode::Uc8 => uc8_to_f32(bytes[index]),
        ChanMode::H16 => h16_to_f32(load_u16(bytes, index)),
        ChanMode::F32 => {
            let o = index * 4;
            f32::from_ne_bytes([bytes[o], bytes[o + 1], bytes[o + 2], bytes[o + 3]])
        }
    }
}

/// Encode `f` as channel `index` of `mode` into `bytes`.
pub fn store_f32(mode: ChanMode, bytes: &mut [u8], index: usize, f: f32) {
    match mode {
        ChanMode::Uc8 => bytes[index] = f32_to_uc8(f),
        ChanMode::H16 => store_u16(bytes, index, f32_to_h16(f)),
        ChanMode::F32 => bytes[index * 4..index * 4 + 4].copy_from_slice(&f.to_ne_bytes()),
    }
}

pub fn load_u16(bytes: &[u8], index: usize) -> u16 {
    u16::from_ne_bytes([bytes[index * 2], bytes[index * 2 + 1]])
}

pub fn store_u16(bytes: &mut [u8], index: usize, v: u16) {
    bytes[index * 2..index * 2 + 2].copy_from_slice(&v.to_ne_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uc8_f32() {
        assert_eq!(f32_to_uc8(-1.0), 0);
        assert_eq!(f32_to_uc8(0.0), 0);
        assert_eq!(f32_to_uc8(1.0), 255);
        assert_eq!(f32_to_uc8(12.0), 255);
        assert_eq!(f32_to_uc8(f32::NAN), 0);
        assert_eq!(f32_to_uc8(0.5), 128);
        assert_eq!(uc8_to_f32(0), 0.0);
        assert_eq!(uc8_to_f32(255), 1.0);
    }

    #[test]
    fn test_uc8_round_trips_are_lossless() {
        for uc in 0..=255u8 {
            assert_eq!(f32_to_uc8(uc8_to_f32(uc)), uc, "uc8->f32->uc8 {uc}");
            assert_eq!(h16_to_uc8(uc8_to_h16(uc)), uc, "uc8->h16->uc8 {uc}");
        }
    }

    #[test]
    fn test_h16_known_values() {
        assert_eq!(f32_to_h16(0.0), 0x0000);
        assert_eq!(f32_to_h16(1.0), 0x3c00);
        assert_eq!(f32_to_h16(-2.0), 0xc000);
        assert_eq!(f32_to_h16(0.5), 0x3800);
        assert_eq!(h16_to_f32(0x3c00), 1.0);
        assert_eq!(h16_zero(), 0);
    }

    #[test]
    fn test_h16_round_trip_stability() {
        let values = [
            -1234.567f32,
            -123.456,
            -12.345,
            -1.234,
            0.0,
            1.0,
            0.1234,
            0.5,
            0.9876,
            1.234,
            12.345,
            123.456,
            1234.567,
        ];
        for f in values {
            assert!(h16_round_trip_stable(f), "h16 round trip unstable for {f}");
        }
    }

    #[test]
    fn test_h16_f32_h16_exact() {
        // every finite half value survives h16 -> f32 -> h16
        for h in 0..=u16::MAX {
            let f = h16_to_f32(h);
            if f.is_finite() {
                assert_eq!(f32_to_h16(f), h, "h16 {h:#06x}");
            }
        }
    }

    #[test]
    fn test_load_store() {
        let mut bytes = vec![0u8; 16];
        for mode in ChanMode::ALL {
            store_f32(mode, &mut bytes, 1, 0.5);
            let back = load_f32(mode, &bytes, 1);
            match mode {
                ChanMode::Uc8 => assert_eq!(back, uc8_to_f32(128)),
                _ => assert_eq!(back, 0.5),
            }
        }
        store_u16(&mut bytes, 3, 0xabcd);
        assert_eq!(load_u16(&bytes, 3), 0xabcd);
    }
}
