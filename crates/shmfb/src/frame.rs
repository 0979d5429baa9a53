//! Frame buffer layout in shared memory.
//!
//! Layout (byte offsets are a persistent contract with every running consumer;
//! new fields may only be appended after the pixel data):
//!
//! ```text
//!      0  headMessage    [u8; 64]  "ShmFb <w>x<h> chan:<n> <mode> <time>\0"
//!     64  totalSize      u64       whole segment size
//!     72  width          u32
//!     76  height         u32
//!     80  channels       u32
//!     84  chanMode       u8        0:UC8 1:H16 2:F32
//!     85  topToBottom    u8        bool
//!     86  (gap to 8-byte boundary)
//!     88  pixelDataSize  u32
//!     92  (gap to 4096-byte boundary)
//!   4096  pixelData      [u8; pixelDataSize]
//! ```

use std::io::{self, Write};
use std::sync::Arc;

use tracing::{debug, info};

use common::types::{ChanMode, Topology};

use crate::error::{Result, ShmError};
use crate::pixel;
use crate::segment::{shm_max_bytes, Segment};
use crate::view::{align8, align_page, HeaderKey, ShmView, HEADER_SIZE};

const OFFSET_HEAD_MESSAGE: usize = 0;
const SIZE_HEAD_MESSAGE: usize = HEADER_SIZE;
const OFFSET_TOTAL_SIZE: usize = OFFSET_HEAD_MESSAGE + SIZE_HEAD_MESSAGE;
const OFFSET_WIDTH: usize = OFFSET_TOTAL_SIZE + 8;
const OFFSET_HEIGHT: usize = OFFSET_WIDTH + 4;
const OFFSET_CHANNELS: usize = OFFSET_HEIGHT + 4;
const OFFSET_CHAN_MODE: usize = OFFSET_CHANNELS + 4;
const OFFSET_TOP_TO_BOTTOM: usize = OFFSET_CHAN_MODE + 1;
const OFFSET_GAP_START1: usize = OFFSET_TOP_TO_BOTTOM + 1;
const OFFSET_PIXEL_DATA_SIZE: usize = align8(OFFSET_GAP_START1);
const OFFSET_GAP_START2: usize = OFFSET_PIXEL_DATA_SIZE + 4;
const OFFSET_PIXEL_DATA: usize = align_page(OFFSET_GAP_START2);

const _: () = {
    assert!(OFFSET_TOTAL_SIZE == 64);
    assert!(OFFSET_CHAN_MODE == 84);
    assert!(OFFSET_PIXEL_DATA_SIZE == 88);
    assert!(OFFSET_PIXEL_DATA == 4096);
};

/// Timestamp embedded in segment headers.
pub(crate) fn header_time() -> String {
    chrono::Local::now().format("%Y/%m/%d %H:%M:%S").to_string()
}

pub struct FrameBuffer {
    view: ShmView,
    topology: Topology,
    pixel_size: usize,
    scanline_size: usize,
}

impl FrameBuffer {
    /// Superimpose the layout on `view`. The view must be exactly
    /// `calc_data_size(topology)` bytes. With `initialize` the metadata is written
    /// (creator only); without it the existing bytes are interpreted as-is.
    pub fn new(topology: Topology, view: ShmView, initialize: bool) -> Result<Self> {
        let expected = Self::calc_data_size(&topology);
        if view.len() != expected {
            return Err(ShmError::LayoutMismatch {
                layout: "ShmFb",
                expected,
                actual: view.len(),
            });
        }

        let fb = Self {
            view,
            topology,
            pixel_size: topology.pixel_size(),
            scanline_size: topology.scanline_size(),
        };

        if initialize {
            let msg = format!(
                "{}{}x{} chan:{} {} {}",
                HeaderKey::Fb.signature(),
                topology.width,
                topology.height,
                topology.channels,
                topology.mode,
                header_time()
            );
            let v = &fb.view;
            v.write_message(OFFSET_HEAD_MESSAGE, SIZE_HEAD_MESSAGE, &msg);
            v.write_u64(OFFSET_TOTAL_SIZE, expected as u64);
            v.write_u32(OFFSET_WIDTH, topology.width);
            v.write_u32(OFFSET_HEIGHT, topology.height);
            v.write_u32(OFFSET_CHANNELS, topology.channels);
            v.write_u8(OFFSET_CHAN_MODE, topology.mode as u8);
            v.write_bool(OFFSET_TOP_TO_BOTTOM, topology.top_to_bottom);
            v.write_u32(OFFSET_PIXEL_DATA_SIZE, Self::calc_pixel_data_size(&topology) as u32);
        }
        Ok(fb)
    }

    // --- Sizing ---

    /// Pixel payload size. Saturates instead of wrapping on absurd topologies.
    pub fn calc_pixel_data_size(topology: &Topology) -> usize {
        (topology.width as usize)
            .saturating_mul(topology.height as usize)
            .saturating_mul(topology.channels as usize)
            .saturating_mul(topology.mode.byte_size())
    }

    /// Exact segment size required by `topology`, both alignment gaps included.
    pub fn calc_data_size(topology: &Topology) -> usize {
        OFFSET_PIXEL_DATA.saturating_add(Self::calc_pixel_data_size(topology))
    }

    /// Size of a segment holding an empty (0x0) frame buffer.
    pub const fn calc_min_data_size() -> usize {
        OFFSET_PIXEL_DATA
    }

    pub const fn pixel_data_offset() -> usize {
        OFFSET_PIXEL_DATA
    }

    /// Segment size for `topology`, or `TopologyTooLarge` when the host could not
    /// allocate it or `pixelDataSize` would not fit its u32 field.
    pub fn check_topology(topology: &Topology) -> Result<usize> {
        let required = Self::calc_data_size(topology);
        let pixel_bytes = Self::calc_pixel_data_size(topology);
        let max = shm_max_bytes().unwrap_or(usize::MAX);
        if required > max || pixel_bytes > u32::MAX as usize {
            return Err(ShmError::TopologyTooLarge {
                topology: *topology,
                required,
                max: max.min(OFFSET_PIXEL_DATA + u32::MAX as usize),
            });
        }
        Ok(required)
    }

    /// Initialised frame buffer in process-local memory, sized like its segment would be.
    pub fn local(topology: Topology) -> Result<Self> {
        let size = Self::check_topology(&topology)?;
        Self::new(topology, ShmView::local(size), true)
    }

    // --- Reads before a FrameBuffer exists ---

    pub fn retrieve_head_message(view: &ShmView) -> String {
        view.read_message(OFFSET_HEAD_MESSAGE, SIZE_HEAD_MESSAGE)
    }

    pub fn retrieve_total_size(view: &ShmView) -> u64 {
        view.read_u64(OFFSET_TOTAL_SIZE)
    }

    pub fn retrieve_pixel_data_size(view: &ShmView) -> u32 {
        view.read_u32(OFFSET_PIXEL_DATA_SIZE)
    }

    pub fn retrieve_chan_mode_raw(view: &ShmView) -> u8 {
        view.read_u8(OFFSET_CHAN_MODE)
    }

    /// Stored topology, `None` when the chanMode byte is not a known mode.
    pub fn retrieve_topology(view: &ShmView) -> Option<Topology> {
        let mode = ChanMode::from_u8(Self::retrieve_chan_mode_raw(view))?;
        Some(Topology::new(
            view.read_u32(OFFSET_WIDTH),
            view.read_u32(OFFSET_HEIGHT),
            view.read_u32(OFFSET_CHANNELS),
            mode,
            view.read_bool(OFFSET_TOP_TO_BOTTOM),
        ))
    }

    // --- Accessors ---

    pub fn topology(&self) -> Topology {
        self.topology
    }

    pub fn width(&self) -> u32 {
        self.topology.width
    }

    pub fn height(&self) -> u32 {
        self.topology.height
    }

    pub fn channels(&self) -> u32 {
        self.topology.channels
    }

    pub fn chan_mode(&self) -> ChanMode {
        self.topology.mode
    }

    pub fn top_to_bottom(&self) -> bool {
        self.topology.top_to_bottom
    }

    pub fn head_message(&self) -> String {
        Self::retrieve_head_message(&self.view)
    }

    pub fn total_size(&self) -> u64 {
        Self::retrieve_total_size(&self.view)
    }

    pub fn pixel_data_size(&self) -> usize {
        Self::retrieve_pixel_data_size(&self.view) as usize
    }

    pub fn scanline_size(&self) -> usize {
        self.scanline_size
    }

    pub fn view(&self) -> &ShmView {
        &self.view
    }

    // --- Payload ---

    /// Physical row holding logical row `y`.
    fn physical_row(&self, y: u32) -> usize {
        if self.topology.top_to_bottom {
            (self.topology.height - 1 - y) as usize
        } else {
            y as usize
        }
    }

    /// Byte offset of logical scanline `y`, `None` past the last row. Logical rows
    /// count from the bottom of the image; a top-to-bottom buffer stores the top row first.
    pub fn scanline_offset(&self, y: u32) -> Option<usize> {
        (y < self.topology.height).then(|| self.row_offset(y))
    }

    fn row_offset(&self, y: u32) -> usize {
        OFFSET_PIXEL_DATA + self.physical_row(y) * self.scanline_size
    }

    /// Copy a whole payload into the segment. `data` must be exactly `pixel_data_size` bytes.
    pub fn write_pixel_data(&self, data: &[u8]) {
        assert_eq!(data.len(), Self::calc_pixel_data_size(&self.topology));
        self.view.write_bytes(OFFSET_PIXEL_DATA, data);
    }

    pub fn pixel_data(&self) -> Vec<u8> {
        self.view
            .to_vec(OFFSET_PIXEL_DATA, Self::calc_pixel_data_size(&self.topology))
    }

    fn in_bounds(&self, x: u32, y: u32) -> bool {
        x < self.topology.width && y < self.topology.height
    }

    fn channel_offset(&self, x: u32, y: u32, c: usize) -> usize {
        self.row_offset(y) + x as usize * self.pixel_size + c * self.topology.mode.byte_size()
    }

    /// Stored channel `c` of in-bounds pixel (x, y), decoded to f32.
    fn load_f32(&self, x: u32, y: u32, c: usize) -> f32 {
        let o = self.channel_offset(x, y, c);
        match self.topology.mode {
            ChanMode::Uc8 => pixel::uc8_to_f32(self.view.read_u8(o)),
            ChanMode::H16 => pixel::h16_to_f32(self.view.read_u16(o)),
            ChanMode::F32 => self.view.read_f32(o),
        }
    }

    /// Number of stored channels copied into an output of `requested` channels.
    fn copy_count(&self, requested: usize) -> usize {
        requested.min(self.topology.channels as usize)
    }

    /// Pixel (x, y) as UC8 into `out`. Channels beyond the stored count, and every
    /// channel of an out-of-range pixel, are zero.
    pub fn get_pixel_uc8(&self, x: u32, y: u32, out: &mut [u8]) {
        if !self.in_bounds(x, y) {
            out.fill(0);
            return;
        }
        let n = self.copy_count(out.len());
        for (c, v) in out.iter_mut().enumerate().take(n) {
            let o = self.channel_offset(x, y, c);
            *v = match self.topology.mode {
                ChanMode::Uc8 => self.view.read_u8(o),
                ChanMode::H16 => pixel::h16_to_uc8(self.view.read_u16(o)),
                ChanMode::F32 => pixel::f32_to_uc8(self.view.read_f32(o)),
            };
        }
        out[n..].fill(0);
    }

    /// Pixel (x, y) as raw half-float bits into `out`; same zero rules as `get_pixel_uc8`.
    pub fn get_pixel_h16(&self, x: u32, y: u32, out: &mut [u16]) {
        let zero = pixel::h16_zero();
        if !self.in_bounds(x, y) {
            out.fill(zero);
            return;
        }
        let n = self.copy_count(out.len());
        for (c, v) in out.iter_mut().enumerate().take(n) {
            let o = self.channel_offset(x, y, c);
            *v = match self.topology.mode {
                ChanMode::Uc8 => pixel::uc8_to_h16(self.view.read_u8(o)),
                ChanMode::H16 => self.view.read_u16(o),
                ChanMode::F32 => pixel::f32_to_h16(self.view.read_f32(o)),
            };
        }
        out[n..].fill(zero);
    }

    /// Pixel (x, y) as f32 into `out`; same zero rules as `get_pixel_uc8`.
    pub fn get_pixel_f32(&self, x: u32, y: u32, out: &mut [f32]) {
        if !self.in_bounds(x, y) {
            out.fill(0.0);
            return;
        }
        let n = self.copy_count(out.len());
        for (c, v) in out.iter_mut().enumerate().take(n) {
            *v = self.load_f32(x, y, c);
        }
        out[n..].fill(0.0);
    }

    /// All stored channels of pixel (x, y) as f32.
    pub fn pixel_f32(&self, x: u32, y: u32) -> Vec<f32> {
        let mut out = vec![0.0; self.topology.channels as usize];
        self.get_pixel_f32(x, y, &mut out);
        out
    }

    /// Encode up to `channels` values of `px` into pixel (x, y). Out-of-range writes are ignored.
    pub fn set_pixel_f32(&self, x: u32, y: u32, px: &[f32]) {
        if !self.in_bounds(x, y) {
            return;
        }
        for (c, &f) in px.iter().enumerate().take(self.topology.channels as usize) {
            let o = self.channel_offset(x, y, c);
            match self.topology.mode {
                ChanMode::Uc8 => self.view.write_u8(o, pixel::f32_to_uc8(f)),
                ChanMode::H16 => self.view.write_u16(o, pixel::f32_to_h16(f)),
                ChanMode::F32 => self.view.write_f32(o, f),
            }
        }
    }

    // --- Test pattern ---

    /// RGBA of the deterministic test pattern at normalised position (rx, ry).
    pub fn test_color(pattern_id: u32, rx: f32, ry: f32) -> [f32; 4] {
        if rx >= 1.0 || ry >= 1.0 {
            return [0.0, 0.0, 0.0, 1.0];
        }
        match pattern_id {
            1 => {
                if rx * rx + ry * ry < 0.5 * 0.5 {
                    [1.0, 0.0, 0.0, 1.0]
                } else {
                    [1.0, 1.0, 1.0, 0.5]
                }
            }
            _ => {
                if (0.0..=0.5).contains(&rx) && (0.0..=0.5).contains(&ry) {
                    [0.5, 0.5, 0.5, 1.0]
                } else {
                    [1.0, 1.0, 1.0, 0.5]
                }
            }
        }
    }

    /// Visit every pixel in memory order with its normalised coordinates and byte offset.
    fn for_each_pixel(&self, mut f: impl FnMut(f32, f32, usize)) {
        let Topology { width, height, .. } = self.topology;
        for y in 0..height {
            let ry = y as f32 / height as f32;
            for x in 0..width {
                let rx = x as f32 / width as f32;
                let offset = OFFSET_PIXEL_DATA + (y as usize * width as usize + x as usize) * self.pixel_size;
                f(rx, ry, offset);
            }
        }
    }

    fn encoded_channel_matches(&self, offset: usize, c: usize, f: f32) -> bool {
        let o = offset + c * self.topology.mode.byte_size();
        match self.topology.mode {
            ChanMode::Uc8 => self.view.read_u8(o) == pixel::f32_to_uc8(f),
            ChanMode::H16 => self.view.read_u16(o) == pixel::f32_to_h16(f),
            ChanMode::F32 => self.view.read_f32(o) == f,
        }
    }

    fn encode_channel(&self, offset: usize, c: usize, f: f32) {
        let o = offset + c * self.topology.mode.byte_size();
        match self.topology.mode {
            ChanMode::Uc8 => self.view.write_u8(o, pixel::f32_to_uc8(f)),
            ChanMode::H16 => self.view.write_u16(o, pixel::f32_to_h16(f)),
            ChanMode::F32 => self.view.write_f32(o, f),
        }
    }

    pub fn fill_test_pattern(&self, pattern_id: u32) {
        let chan_max = self.copy_count(4);
        self.for_each_pixel(|rx, ry, offset| {
            let col = Self::test_color(pattern_id, rx, ry);
            for (c, &f) in col.iter().enumerate().take(chan_max) {
                self.encode_channel(offset, c, f);
            }
        });
    }

    pub fn verify_test_pattern(&self, pattern_id: u32) -> bool {
        let chan_max = self.copy_count(4);
        let mut ok = true;
        self.for_each_pixel(|rx, ry, offset| {
            let col = Self::test_color(pattern_id, rx, ry);
            for (c, &f) in col.iter().enumerate().take(chan_max) {
                if !self.encoded_channel_matches(offset, c, f) {
                    ok = false;
                }
            }
        });
        ok
    }

    /// Plain PPM (P3) snapshot, top row first. Missing channels read as zero.
    pub fn write_ppm<W: Write>(&self, mut out: W) -> io::Result<()> {
        let Topology { width, height, .. } = self.topology;
        writeln!(out, "P3\n{width} {height}\n255")?;
        let mut px = [0u8; 3];
        for y in (0..height).rev() {
            let mut line = String::with_capacity(width as usize * 12);
            for x in 0..width {
                self.get_pixel_uc8(x, y, &mut px);
                line.push_str(&format!("{} {} {} ", px[0], px[1], px[2]));
            }
            writeln!(out, "{}", line.trim_end())?;
        }
        out.flush()
    }

    // --- Diagnostics ---

    pub fn show_offsets() -> String {
        format!(
            "ShmFb offset {{\n  headMessage:{OFFSET_HEAD_MESSAGE}\n  totalSize:{OFFSET_TOTAL_SIZE}\n  width:{OFFSET_WIDTH}\n  height:{OFFSET_HEIGHT}\n  channels:{OFFSET_CHANNELS}\n  chanMode:{OFFSET_CHAN_MODE}\n  topToBottom:{OFFSET_TOP_TO_BOTTOM}\n  gapStart1:{OFFSET_GAP_START1}\n  pixelDataSize:{OFFSET_PIXEL_DATA_SIZE}\n  gapStart2:{OFFSET_GAP_START2}\n  pixelData:{OFFSET_PIXEL_DATA}\n}}"
        )
    }

    pub fn show(&self) -> String {
        format!(
            "ShmFb {{\n  headMessage:{}\n  totalSize:{}\n  width:{}\n  height:{}\n  channels:{}\n  chanMode:{}\n  topToBottom:{}\n  pixelDataSize:{}\n  pixelSize:{}\n  scanlineSize:{}\n}}",
            self.head_message(),
            self.total_size(),
            self.width(),
            self.height(),
            self.channels(),
            self.chan_mode(),
            self.top_to_bottom(),
            self.pixel_data_size(),
            self.pixel_size,
            self.scanline_size
        )
    }
}

// === Handle ===

/// A frame buffer together with the segment that backs it.
pub struct FrameBufferHandle {
    segment: Segment,
    fb: Arc<FrameBuffer>,
}

impl FrameBufferHandle {
    /// Allocate a new segment sized for `topology` and initialise the layout in it.
    pub fn create(topology: Topology) -> Result<Self> {
        let required = FrameBuffer::check_topology(&topology)?;
        let mut segment = Segment::create(required)?;
        let fb = match segment
            .attached_view()
            .and_then(|view| FrameBuffer::new(topology, view, true))
        {
            Ok(fb) => fb,
            Err(e) => {
                let _ = segment.remove();
                return Err(e);
            }
        };

        info!(shm_id = segment.id(), %topology, size = required, "created frame buffer segment");
        Ok(Self {
            segment,
            fb: Arc::new(fb),
        })
    }

    /// Attach to an existing frame buffer segment and validate its stored sizes.
    pub fn attach(shm_id: i32) -> Result<Self> {
        let segment = Segment::attach(shm_id, FrameBuffer::calc_min_data_size())?;
        let view = segment.attached_view()?;

        let stored_total = FrameBuffer::retrieve_total_size(&view) as usize;
        if stored_total != segment.size() {
            return Err(ShmError::SizeMismatch {
                shm_id,
                what: "stored totalSize vs segment size",
                expected: segment.size(),
                actual: stored_total,
            });
        }

        let topology = FrameBuffer::retrieve_topology(&view).ok_or(ShmError::InvalidChanMode {
            shm_id,
            value: FrameBuffer::retrieve_chan_mode_raw(&view),
        })?;

        let stored_pixels = FrameBuffer::retrieve_pixel_data_size(&view) as usize;
        let expected_pixels = FrameBuffer::calc_pixel_data_size(&topology);
        if stored_pixels != expected_pixels {
            return Err(ShmError::SizeMismatch {
                shm_id,
                what: "stored pixelDataSize vs topology",
                expected: expected_pixels,
                actual: stored_pixels,
            });
        }

        let fb = FrameBuffer::new(topology, view, false)?;
        debug!(shm_id, %topology, "attached frame buffer segment");
        Ok(Self {
            segment,
            fb: Arc::new(fb),
        })
    }

    pub fn id(&self) -> i32 {
        self.segment.id()
    }

    pub fn topology(&self) -> Topology {
        self.fb.topology()
    }

    pub fn fb(&self) -> Arc<FrameBuffer> {
        Arc::clone(&self.fb)
    }

    pub fn segment(&self) -> &Segment {
        &self.segment
    }

    pub fn detach(&mut self) -> Result<()> {
        self.segment.detach()
    }

    pub fn remove(&mut self) -> Result<()> {
        self.segment.remove()
    }

    pub fn show(&self) -> String {
        format!(
            "FrameBufferHandle {{\n{}\n  topology:{}\n{}\n}}",
            indent(&self.segment.show()),
            self.topology(),
            indent(&self.fb.show())
        )
    }
}

pub(crate) fn indent(text: &str) -> String {
    text.lines()
        .map(|l| format!("  {l}"))
        .collect::<Vec<_>>()
        .join("\n")
}
