//! Offset-addressed access to a raw memory region.
//!
//! Every layout in this crate (frame buffer, control block) is a set of fixed byte
//! offsets superimposed on a region. `ShmView` is the only place that touches the
//! raw pointer: each access asserts that `[offset, offset + len)` lies inside the
//! region before reading or writing.
//!
//! Values are stored in native byte order, unaligned, exactly as a C struct written
//! field-by-field with `memcpy` would store them.

use std::alloc::{self, Layout};
use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

/// Size of the signature/description header at the start of every managed segment.
pub const HEADER_SIZE: usize = 64;

/// Layout payloads start on this boundary. Part of the binary format, not the host page size.
pub const PAGE_ALIGNMENT: usize = 4096;

/// Round `offset` up to the next multiple of `alignment` (a power of two).
pub const fn align_up(offset: usize, alignment: usize) -> usize {
    (offset + alignment - 1) & !(alignment - 1)
}

pub const fn align8(offset: usize) -> usize {
    align_up(offset, 8)
}

pub const fn align_page(offset: usize) -> usize {
    align_up(offset, PAGE_ALIGNMENT)
}

// === Header keys ===

/// Signature written at offset 0 of each managed segment type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeaderKey {
    Fb,
    FbCtrl,
}

impl HeaderKey {
    pub const ALL: [HeaderKey; 2] = [HeaderKey::Fb, HeaderKey::FbCtrl];

    /// Longest signature, used for column alignment in listings.
    pub const MAX_LEN: usize = HeaderKey::FbCtrl.signature().len();

    pub const fn signature(self) -> &'static str {
        match self {
            HeaderKey::Fb => "ShmFb ",
            HeaderKey::FbCtrl => "ShmFbCtrl ",
        }
    }

    /// Exact-prefix match against the raw header bytes of a segment.
    pub fn matches(self, header: &[u8]) -> bool {
        header.starts_with(self.signature().as_bytes())
    }

    pub fn classify(header: &[u8]) -> Option<HeaderKey> {
        HeaderKey::ALL.into_iter().find(|key| key.matches(header))
    }
}

const _: () = {
    assert!(HeaderKey::Fb.signature().len() <= HeaderKey::MAX_LEN);
    assert!(HeaderKey::MAX_LEN < HEADER_SIZE);
};

impl fmt::Display for HeaderKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.signature().trim_end())
    }
}

// === Regions ===

/// A contiguous block of memory a `ShmView` can be laid over.
///
/// # Safety
/// `base()` must stay valid for reads and writes of `len()` bytes for as long as
/// the region is alive.
pub unsafe trait Region: Send + Sync {
    fn base(&self) -> *mut u8;
    fn len(&self) -> usize;

    fn writable(&self) -> bool {
        true
    }
}

/// Heap-backed, zero-initialised, page-aligned region. Stands in for a shared
/// segment when a layout is built in process-local memory.
pub struct LocalRegion {
    ptr: NonNull<u8>,
    len: usize,
}

impl LocalRegion {
    pub fn new(len: usize) -> Self {
        if len == 0 {
            return Self {
                ptr: NonNull::dangling(),
                len,
            };
        }
        let layout = Self::layout(len);
        // Safety: layout has a non-zero size.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).unwrap_or_else(|| alloc::handle_alloc_error(layout));
        Self { ptr, len }
    }

    fn layout(len: usize) -> Layout {
        Layout::from_size_align(len, PAGE_ALIGNMENT).unwrap_or_else(|_| panic!("region too large: {len}"))
    }
}

impl Drop for LocalRegion {
    fn drop(&mut self) {
        if self.len > 0 {
            // Safety: allocated in `new` with the same layout.
            unsafe { alloc::dealloc(self.ptr.as_ptr(), Self::layout(self.len)) };
        }
    }
}

// Safety: the allocation is owned exclusively by this value; concurrent access goes
// through `ShmView`, which never hands out references into the region.
unsafe impl Send for LocalRegion {}
unsafe impl Sync for LocalRegion {}

unsafe impl Region for LocalRegion {
    fn base(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    fn len(&self) -> usize {
        self.len
    }
}

// === View ===

/// Bounds-checked, offset-addressed view over a region. Cloning is cheap and keeps
/// the region alive.
#[derive(Clone)]
pub struct ShmView {
    region: Arc<dyn Region>,
    base: *mut u8,
    len: usize,
    writable: bool,
}

// Safety: the region is Send + Sync and the view only performs unaligned copies
// through the raw pointer. Writes can race with readers in other processes; that
// is inherent to the transport and never produces Rust references to the bytes.
unsafe impl Send for ShmView {}
unsafe impl Sync for ShmView {}

macro_rules! scalar_access {
    ($read:ident, $write:ident, $ty:ty) => {
        pub fn $read(&self, offset: usize) -> $ty {
            let p = self.ptr(offset, std::mem::size_of::<$ty>());
            // Safety: bounds checked above.
            unsafe { p.cast::<$ty>().read_unaligned() }
        }

        pub fn $write(&self, offset: usize, v: $ty) {
            let p = self.ptr_mut(offset, std::mem::size_of::<$ty>());
            // Safety: bounds checked above.
            unsafe { p.cast::<$ty>().write_unaligned(v) }
        }
    };
}

impl ShmView {
    pub fn new(region: Arc<dyn Region>) -> Self {
        let base = region.base();
        let len = region.len();
        let writable = region.writable();
        Self {
            region,
            base,
            len,
            writable,
        }
    }

    /// View over a fresh zeroed heap region of `len` bytes.
    pub fn local(len: usize) -> Self {
        Self::new(Arc::new(LocalRegion::new(len)))
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn base_addr(&self) -> usize {
        self.base as usize
    }

    pub fn region(&self) -> &Arc<dyn Region> {
        &self.region
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    fn ptr(&self, offset: usize, len: usize) -> *mut u8 {
        let in_bounds = offset.checked_add(len).is_some_and(|end| end <= self.len);
        assert!(
            in_bounds,
            "shm access out of bounds: offset:{offset} len:{len} size:{}",
            self.len
        );
        // Safety: offset <= self.len, within the region's allocation.
        unsafe { self.base.add(offset) }
    }

    fn ptr_mut(&self, offset: usize, len: usize) -> *mut u8 {
        assert!(self.writable, "write to read-only shm view at offset:{offset}");
        self.ptr(offset, len)
    }

    scalar_access!(read_u8, write_u8, u8);
    scalar_access!(read_u16, write_u16, u16);
    scalar_access!(read_u32, write_u32, u32);
    scalar_access!(read_u64, write_u64, u64);
    scalar_access!(read_f32, write_f32, f32);

    pub fn read_bool(&self, offset: usize) -> bool {
        self.read_u8(offset) != 0
    }

    pub fn write_bool(&self, offset: usize, b: bool) {
        self.write_u8(offset, b as u8);
    }

    pub fn read_bytes(&self, offset: usize, out: &mut [u8]) {
        let p = self.ptr(offset, out.len());
        // Safety: bounds checked; `out` is a distinct Rust allocation.
        unsafe { std::ptr::copy_nonoverlapping(p, out.as_mut_ptr(), out.len()) }
    }

    pub fn write_bytes(&self, offset: usize, src: &[u8]) {
        let p = self.ptr_mut(offset, src.len());
        // Safety: bounds checked; `src` is a distinct Rust allocation.
        unsafe { std::ptr::copy_nonoverlapping(src.as_ptr(), p, src.len()) }
    }

    pub fn fill(&self, offset: usize, len: usize, byte: u8) {
        let p = self.ptr_mut(offset, len);
        // Safety: bounds checked.
        unsafe { std::ptr::write_bytes(p, byte, len) }
    }

    pub fn to_vec(&self, offset: usize, len: usize) -> Vec<u8> {
        let mut out = vec![0u8; len];
        self.read_bytes(offset, &mut out);
        out
    }

    /// Read a NUL-terminated string of at most `max_len` bytes.
    pub fn read_message(&self, offset: usize, max_len: usize) -> String {
        let raw = self.to_vec(offset, max_len);
        let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        String::from_utf8_lossy(&raw[..end]).into_owned()
    }

    /// Copy at most `max_len - 1` bytes of `msg` and NUL-terminate.
    pub fn write_message(&self, offset: usize, max_len: usize, msg: &str) {
        if max_len == 0 {
            return;
        }
        let bytes = msg.as_bytes();
        let copy = bytes.len().min(max_len - 1);
        self.write_bytes(offset, &bytes[..copy]);
        self.write_u8(offset + copy, 0);
    }

    pub fn show(&self) -> String {
        format!(
            "ShmView {{\n  base:0x{:x}\n  len:{}\n}}",
            self.base_addr(),
            self.len
        )
    }
}

impl fmt::Debug for ShmView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShmView")
            .field("base", &format_args!("0x{:x}", self.base_addr()))
            .field("len", &self.len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alignment() {
        assert_eq!(align8(0), 0);
        assert_eq!(align8(1), 8);
        assert_eq!(align8(8), 8);
        assert_eq!(align8(86), 88);
        assert_eq!(align_page(0), 0);
        assert_eq!(align_page(92), 4096);
        assert_eq!(align_page(4096), 4096);
        assert_eq!(align_page(4097), 8192);
    }

    #[test]
    fn test_scalar_read_write() {
        let view = ShmView::local(128);
        view.write_u8(0, 0xab);
        view.write_bool(1, true);
        view.write_u32(3, 0xdead_beef); // unaligned on purpose
        view.write_u64(64, u64::MAX - 1);
        view.write_f32(100, 0.25);
        view.write_u16(120, 0x3c00);

        assert_eq!(view.read_u8(0), 0xab);
        assert!(view.read_bool(1));
        assert!(!view.read_bool(2));
        assert_eq!(view.read_u32(3), 0xdead_beef);
        assert_eq!(view.read_u64(64), u64::MAX - 1);
        assert_eq!(view.read_f32(100), 0.25);
        assert_eq!(view.read_u16(120), 0x3c00);
    }

    #[test]
    fn test_message_truncation() {
        let view = ShmView::local(HEADER_SIZE);
        view.write_message(0, 8, "ShmFbCtrl 2024");
        assert_eq!(view.read_message(0, 8), "ShmFbCt");
        assert_eq!(view.read_u8(7), 0);

        view.write_message(0, HEADER_SIZE, "");
        assert_eq!(view.read_message(0, HEADER_SIZE), "");
    }

    #[test]
    fn test_message_without_terminator() {
        let view = ShmView::local(16);
        view.fill(0, 16, b'x');
        assert_eq!(view.read_message(0, 4), "xxxx");
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn test_out_of_bounds_panics() {
        let view = ShmView::local(8);
        view.write_u64(1, 0);
    }

    #[test]
    fn test_header_key() {
        assert!(HeaderKey::Fb.matches(b"ShmFb 640x480 chan:3 UC8"));
        assert!(!HeaderKey::Fb.matches(b"ShmFbCtrl 2024"));
        assert!(HeaderKey::FbCtrl.matches(b"ShmFbCtrl 2024"));
        assert_eq!(HeaderKey::classify(b"ShmFbCtrl "), Some(HeaderKey::FbCtrl));
        assert_eq!(HeaderKey::classify(b"ShmF"), None);
        assert_eq!(HeaderKey::MAX_LEN, 10);
        assert_eq!(HeaderKey::Fb.to_string(), "ShmFb");
    }

    #[test]
    fn test_local_region_is_page_aligned_and_zeroed() {
        let view = ShmView::local(PAGE_ALIGNMENT * 2);
        assert_eq!(view.base_addr() % PAGE_ALIGNMENT, 0);
        assert!(view.to_vec(0, view.len()).iter().all(|&b| b == 0));
        assert!(ShmView::local(0).is_empty());
    }
}
