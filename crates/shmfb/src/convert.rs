//! Pixel layout conversion between two topologies of the same dimensions.
//!
//! One pass over the destination rows. The source row is picked so that a scan
//! direction change is folded into the same pass.

use common::types::{ChanMode, Topology};

use crate::error::{Result, ShmError};
use crate::pixel::{self, load_u16, store_u16};

/// Converts the first `count` channels of one pixel.
type ChannelConv = fn(src: &[u8], dst: &mut [u8], count: usize);

fn uc8_to_h16(src: &[u8], dst: &mut [u8], count: usize) {
    for i in 0..count {
        store_u16(dst, i, pixel::uc8_to_h16(src[i]));
    }
}

fn uc8_to_f32(src: &[u8], dst: &mut [u8], count: usize) {
    for i in 0..count {
        pixel::store_f32(ChanMode::F32, dst, i, pixel::uc8_to_f32(src[i]));
    }
}

fn h16_to_uc8(src: &[u8], dst: &mut [u8], count: usize) {
    for i in 0..count {
        dst[i] = pixel::h16_to_uc8(load_u16(src, i));
    }
}

fn h16_to_f32(src: &[u8], dst: &mut [u8], count: usize) {
    for i in 0..count {
        pixel::store_f32(ChanMode::F32, dst, i, pixel::h16_to_f32(load_u16(src, i)));
    }
}

fn f32_to_uc8(src: &[u8], dst: &mut [u8], count: usize) {
    for i in 0..count {
        dst[i] = pixel::f32_to_uc8(pixel::load_f32(ChanMode::F32, src, i));
    }
}

fn f32_to_h16(src: &[u8], dst: &mut [u8], count: usize) {
    for i in 0..count {
        store_u16(dst, i, pixel::f32_to_h16(pixel::load_f32(ChanMode::F32, src, i)));
    }
}

fn pairwise(src: ChanMode, dst: ChanMode) -> Option<ChannelConv> {
    use ChanMode::*;
    let conv: ChannelConv = match (src, dst) {
        (Uc8, H16) => uc8_to_h16,
        (Uc8, F32) => uc8_to_f32,
        (H16, Uc8) => h16_to_uc8,
        (H16, F32) => h16_to_f32,
        (F32, Uc8) => f32_to_uc8,
        (F32, H16) => f32_to_h16,
        _ => return None,
    };
    Some(conv)
}

/// Source row feeding destination row `out_y`.
pub fn source_row(src: &Topology, dst: &Topology, out_y: u32) -> u32 {
    if src.top_to_bottom == dst.top_to_bottom {
        out_y
    } else {
        src.height - 1 - out_y
    }
}

/// Convert `src` (laid out as `src_topo`) into `scratch` laid out as `dst_topo`.
/// `scratch` is resized to the destination payload size.
pub fn convert_into(src_topo: &Topology, src: &[u8], dst_topo: &Topology, scratch: &mut Vec<u8>) -> Result<()> {
    assert!(
        src_topo.width == dst_topo.width && src_topo.height == dst_topo.height,
        "conversion cannot resize: {src_topo} -> {dst_topo}"
    );
    let src_size = src_topo.data_size();
    if src.len() < src_size {
        return Err(ShmError::PayloadSize {
            topology: *src_topo,
            expected: src_size,
            actual: src.len(),
        });
    }

    scratch.clear();
    scratch.resize(dst_topo.data_size(), 0);

    let src_line = src_topo.scanline_size();
    let dst_line = dst_topo.scanline_size();
    let src_px = src_topo.pixel_size();
    let dst_px = dst_topo.pixel_size();
    let count = src_topo.channels.min(dst_topo.channels) as usize;
    let copy_bytes = count * dst_topo.mode.byte_size();
    let conv = pairwise(src_topo.mode, dst_topo.mode);
    let same_layout = src_topo.mode == dst_topo.mode && src_topo.channels == dst_topo.channels;

    for out_y in 0..dst_topo.height {
        let in_y = source_row(src_topo, dst_topo, out_y) as usize;
        let in_row = &src[in_y * src_line..(in_y + 1) * src_line];
        let out_row = &mut scratch[out_y as usize * dst_line..(out_y as usize + 1) * dst_line];

        if same_layout {
            out_row.copy_from_slice(in_row);
            continue;
        }

        for (in_px, out_px) in in_row.chunks_exact(src_px.max(1)).zip(out_row.chunks_exact_mut(dst_px.max(1))) {
            match conv {
                Some(conv) => conv(in_px, out_px, count),
                None => out_px[..copy_bytes].copy_from_slice(&in_px[..copy_bytes]),
            }
            out_px[copy_bytes..].fill(0);
        }
    }
    Ok(())
}
