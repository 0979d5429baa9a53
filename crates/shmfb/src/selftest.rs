//! End-to-end check of the conversion path: random source frame in, published
//! frame read back in F32, compared against an independently computed target.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use common::types::{ChanMode, Topology};

use crate::frame::FrameBuffer;
use crate::output::Publisher;
use crate::pixel;

/// A random source frame and what every source channel must read back as.
pub struct SelfTestFrame {
    pub src: Topology,
    pub data: Vec<u8>,
    /// One f32 per source channel, in source memory order.
    pub expected: Vec<f32>,
}

/// Random source data for `src`, plus the values expected after publishing as `dst_mode`.
pub fn generate(src: Topology, dst_mode: ChanMode, seed: u64) -> SelfTestFrame {
    let mut rng = StdRng::seed_from_u64(seed);
    let values = src.pixel_count() * src.channels as usize;
    let mut data = vec![0u8; src.data_size()];
    let mut expected = Vec::with_capacity(values);

    for i in 0..values {
        match src.mode {
            ChanMode::Uc8 => data[i] = rng.gen(),
            ChanMode::H16 => pixel::store_u16(&mut data, i, pixel::f32_to_h16(rng.gen_range(-0.5..1.5))),
            ChanMode::F32 => pixel::store_f32(ChanMode::F32, &mut data, i, rng.gen_range(-0.5..1.5)),
        }
        let f = pixel::load_f32(src.mode, &data, i);
        expected.push(if src.mode == dst_mode {
            f
        } else {
            through(dst_mode, f)
        });
    }

    SelfTestFrame { src, data, expected }
}

/// Encode `f` in `mode` and decode it again.
fn through(mode: ChanMode, f: f32) -> f32 {
    let mut buf = [0u8; 4];
    pixel::store_f32(mode, &mut buf, 0, f);
    pixel::load_f32(mode, &buf, 0)
}

#[derive(Debug, Clone, PartialEq)]
pub struct Mismatch {
    pub x: u32,
    pub y: u32,
    pub channel: usize,
    pub expected: f32,
    pub actual: f32,
}

#[derive(Debug, Default)]
pub struct VerifyReport {
    pub checked: usize,
    pub mismatches: usize,
    /// The first mismatches, up to the configured limit.
    pub reported: Vec<Mismatch>,
}

impl VerifyReport {
    pub fn is_ok(&self) -> bool {
        self.mismatches == 0
    }
}

/// Compare every logical pixel of `fb` with the generated target. Channels the
/// source does not carry must read back as zero.
pub fn verify(fb: &FrameBuffer, frame: &SelfTestFrame, max_report: usize) -> VerifyReport {
    let src = &frame.src;
    let src_chan = src.channels as usize;
    let count = src_chan.min(fb.channels() as usize);
    let mut out = vec![0.0f32; fb.channels() as usize];
    let mut report = VerifyReport::default();

    for y in 0..src.height {
        let row = if src.top_to_bottom { src.height - 1 - y } else { y };
        for x in 0..src.width {
            fb.get_pixel_f32(x, y, &mut out);
            let base = (row as usize * src.width as usize + x as usize) * src_chan;
            for (c, &actual) in out.iter().enumerate() {
                let expected = if c < count { frame.expected[base + c] } else { 0.0 };
                report.checked += 1;
                if actual != expected {
                    report.mismatches += 1;
                    if report.reported.len() < max_report {
                        report.reported.push(Mismatch {
                            x,
                            y,
                            channel: c,
                            expected,
                            actual,
                        });
                    }
                }
            }
        }
    }
    report
}

impl Publisher {
    /// Publish a random frame laid out as `src` through the conversion path and
    /// verify what landed in shared memory. Results go to the message sink.
    pub fn test_general_update(
        &mut self,
        src: Topology,
        channels: u32,
        mode: ChanMode,
        top_to_bottom: bool,
        seed: u64,
    ) -> bool {
        let frame = generate(src, mode, seed);
        let dst = src.with_layout(channels, mode, top_to_bottom);
        if !self.publish_converted(src, &frame.data, channels, mode, top_to_bottom) {
            self.message(&format!("testGeneralUpdate {src} -> {dst}: publish failed"));
            return false;
        }
        let Some(fb) = self.current_fb() else {
            return false;
        };

        let report = verify(&fb, &frame, self.verify_max_errors);
        for m in &report.reported {
            self.message(&format!(
                "  mismatch x:{} y:{} c:{} expected:{} actual:{}",
                m.x, m.y, m.channel, m.expected, m.actual
            ));
        }
        let suppressed = report.mismatches - report.reported.len();
        if suppressed > 0 {
            self.message(&format!("  ... {suppressed} more mismatches suppressed"));
        }
        self.message(&format!(
            "testGeneralUpdate {src} -> {dst}: {} ({} checked, {} mismatches)",
            if report.is_ok() { "OK" } else { "NG" },
            report.checked,
            report.mismatches
        ));
        report.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listing::testing::FixedLister;
    use crate::sink::testing::Recorder;
    use crate::view::ShmView;

    #[test]
    fn test_generate_is_deterministic() {
        let src = Topology::new(8, 4, 3, ChanMode::H16, false);
        let a = generate(src, ChanMode::Uc8, 7);
        let b = generate(src, ChanMode::Uc8, 7);
        assert_eq!(a.data, b.data);
        assert_eq!(a.expected, b.expected);
        assert_eq!(a.expected.len(), 8 * 4 * 3);
        assert_ne!(generate(src, ChanMode::Uc8, 8).data, a.data);
    }

    #[test]
    fn test_general_update_all_combinations() {
        for in_mode in ChanMode::ALL {
            for out_mode in ChanMode::ALL {
                for (in_chan, out_chan) in [(1, 3), (3, 3), (4, 3), (3, 4)] {
                    for (in_ttb, out_ttb) in [(false, false), (false, true), (true, false), (true, true)] {
                        let sink = Recorder::default();
                        let mut p = Publisher::new(Box::new(FixedLister::default())).with_sink(Box::new(sink.clone()));
                        p.set_active(true);
                        let src = Topology::new(13, 7, in_chan, in_mode, in_ttb);
                        let ok = p.test_general_update(src, out_chan, out_mode, out_ttb, 42);
                        assert!(ok, "{src} -> {out_chan} {out_mode} {out_ttb}: {:?}", sink.lines());
                        assert!(sink.contains(": OK ("));
                        p.remove_segments().unwrap();
                    }
                }
            }
        }
    }

    #[test]
    fn test_verify_reports_first_mismatches() {
        let src = Topology::new(4, 4, 2, ChanMode::F32, true);
        let frame = generate(src, ChanMode::F32, 1);
        let view = ShmView::local(FrameBuffer::calc_data_size(&src));
        let fb = FrameBuffer::new(src, view, true).unwrap();
        fb.write_pixel_data(&frame.data);
        assert!(verify(&fb, &frame, 4).is_ok());

        for y in 0..4 {
            fb.set_pixel_f32(1, y, &[9.0, 9.0]);
        }
        let report = verify(&fb, &frame, 3);
        assert_eq!(report.checked, 32);
        assert_eq!(report.mismatches, 8);
        assert_eq!(report.reported.len(), 3);
        assert_eq!(report.reported[0].x, 1);
        assert_eq!(report.reported[0].actual, 9.0);
    }

    #[test]
    fn test_verify_checks_padding_channels() {
        let src = Topology::new(3, 2, 1, ChanMode::Uc8, false);
        let frame = generate(src, ChanMode::H16, 5);
        let dst = src.with_layout(3, ChanMode::H16, true);
        let view = ShmView::local(FrameBuffer::calc_data_size(&dst));
        let fb = FrameBuffer::new(dst, view, true).unwrap();
        for y in 0..2 {
            for x in 0..3 {
                let i = (y * 3 + x) as usize;
                fb.set_pixel_f32(x, y, &[frame.expected[i], 0.0, 0.0]);
            }
        }
        let report = verify(&fb, &frame, 4);
        assert!(report.is_ok(), "{:?}", report.reported);
        assert_eq!(report.checked, 18);

        fb.set_pixel_f32(2, 1, &[frame.expected[5], 0.0, 0.5]);
        let report = verify(&fb, &frame, 4);
        assert_eq!(report.mismatches, 1);
        assert_eq!(report.reported[0].channel, 2);
        assert_eq!(report.reported[0].expected, 0.0);
    }
}
