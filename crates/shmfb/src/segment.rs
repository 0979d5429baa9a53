//! SysV shared memory segment lifecycle: create, attach, detach, remove.
//!
//! A `Segment` owns one process-local attachment of an OS segment. Views handed out
//! by `Segment::view` keep the attachment mapped, so `detach` only unmaps once the
//! last view is gone.

use std::io;
use std::mem::ManuallyDrop;
use std::ptr::{self, NonNull};
use std::sync::{Arc, OnceLock};

use tracing::{debug, warn};

use crate::error::{Result, ShmError};
use crate::view::{HeaderKey, Region, ShmView, HEADER_SIZE};

/// Owner read/write, everyone else read-only. The sweep relies on this mode to
/// recognise candidate segments.
pub const SHM_PERMS: u32 = 0o644;

// === Host limits ===

/// Largest segment the host allows (`shmmax`), queried once per process.
/// `None` when the platform value could not be read.
pub fn shm_max_bytes() -> Option<usize> {
    static SHM_MAX: OnceLock<Option<usize>> = OnceLock::new();
    *SHM_MAX.get_or_init(|| {
        let max = query_shm_max();
        if max.is_none() {
            warn!("could not query host shared memory max size");
        }
        max
    })
}

#[cfg(target_os = "macos")]
fn query_shm_max() -> Option<usize> {
    let mut value: i64 = 0;
    let mut len = std::mem::size_of::<i64>();
    let name = b"kern.sysv.shmmax\0";
    // Safety: name is NUL-terminated; value/len describe a valid i64 output buffer.
    let rc = unsafe {
        libc::sysctlbyname(
            name.as_ptr().cast(),
            (&mut value as *mut i64).cast(),
            &mut len,
            ptr::null_mut(),
            0,
        )
    };
    if rc == -1 || value <= 0 {
        return None;
    }
    usize::try_from(value).ok()
}

#[cfg(not(target_os = "macos"))]
fn query_shm_max() -> Option<usize> {
    let text = std::fs::read_to_string("/proc/sys/kernel/shmmax").ok()?;
    let value: u64 = text.trim().parse().ok()?;
    Some(usize::try_from(value).unwrap_or(usize::MAX))
}

// === Attachment ===

/// One `shmat` mapping. Unmapped on drop.
pub struct Attachment {
    shm_id: i32,
    addr: NonNull<u8>,
    size: usize,
    writable: bool,
}

// Safety: the mapping is process-wide; access goes through `ShmView`.
unsafe impl Send for Attachment {}
unsafe impl Sync for Attachment {}

unsafe impl Region for Attachment {
    fn base(&self) -> *mut u8 {
        self.addr.as_ptr()
    }

    fn len(&self) -> usize {
        self.size
    }

    fn writable(&self) -> bool {
        self.writable
    }
}

impl Attachment {
    fn map(shm_id: i32) -> Result<(NonNull<u8>, bool)> {
        // Safety: plain syscall; failure is reported as (void*)-1.
        let addr = unsafe { libc::shmat(shm_id, ptr::null(), 0) };
        if addr as isize != -1 {
            return Ok((cast_addr(addr), true));
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EACCES) {
            return Err(ShmError::AttachFailed {
                op: "shmat",
                shm_id,
                source: err,
            });
        }

        // Another user's segment: 0644 only grants us a read-only mapping.
        // Safety: as above.
        let addr = unsafe { libc::shmat(shm_id, ptr::null(), libc::SHM_RDONLY) };
        if addr as isize == -1 {
            return Err(ShmError::AttachFailed {
                op: "shmat(SHM_RDONLY)",
                shm_id,
                source: io::Error::last_os_error(),
            });
        }
        Ok((cast_addr(addr), false))
    }

    /// Explicit unmap that reports failure instead of logging it.
    fn detach(self) -> Result<()> {
        let this = ManuallyDrop::new(self);
        shmdt(this.shm_id, this.addr)
    }
}

impl Drop for Attachment {
    fn drop(&mut self) {
        if let Err(e) = shmdt(self.shm_id, self.addr) {
            warn!("{e}");
        }
    }
}

fn cast_addr(addr: *mut libc::c_void) -> NonNull<u8> {
    // shmat never returns null on success.
    NonNull::new(addr.cast::<u8>()).unwrap_or(NonNull::dangling())
}

fn shmdt(shm_id: i32, addr: NonNull<u8>) -> Result<()> {
    // Safety: addr came from a successful shmat and is unmapped exactly once.
    if unsafe { libc::shmdt(addr.as_ptr().cast()) } == -1 {
        return Err(ShmError::DetachFailed {
            shm_id,
            source: io::Error::last_os_error(),
        });
    }
    debug!(shm_id, "shmdt");
    Ok(())
}

/// (size, nattch) from IPC_STAT.
fn stat(shm_id: i32) -> Result<(usize, u64)> {
    // Safety: shmid_ds is plain old data; the kernel fills it in.
    let mut ds: libc::shmid_ds = unsafe { std::mem::zeroed() };
    if unsafe { libc::shmctl(shm_id, libc::IPC_STAT, &mut ds) } == -1 {
        return Err(ShmError::AttachFailed {
            op: "shmctl(IPC_STAT)",
            shm_id,
            source: io::Error::last_os_error(),
        });
    }
    Ok((ds.shm_segsz as usize, ds.shm_nattch as u64))
}

fn rmid(shm_id: i32) -> Result<()> {
    // Safety: IPC_RMID ignores the buffer argument.
    if unsafe { libc::shmctl(shm_id, libc::IPC_RMID, ptr::null_mut()) } == -1 {
        return Err(ShmError::RemoveFailed {
            shm_id,
            source: io::Error::last_os_error(),
        });
    }
    Ok(())
}

// === Segment ===

pub struct Segment {
    shm_id: i32,
    size: usize,
    /// Attach count reported by the OS right after our own attach.
    n_attach: u64,
    attachment: Option<Arc<Attachment>>,
}

impl Segment {
    /// Allocate a new private segment of `size` bytes and attach to it.
    pub fn create(size: usize) -> Result<Self> {
        if let Some(max) = shm_max_bytes() {
            if size > max {
                return Err(ShmError::AllocationTooLarge {
                    requested: size,
                    max,
                });
            }
        }

        let flags = libc::IPC_CREAT | SHM_PERMS as libc::c_int;
        // Safety: plain syscall.
        let shm_id = unsafe { libc::shmget(libc::IPC_PRIVATE, size, flags) };
        if shm_id < 0 {
            return Err(ShmError::AllocationFailed {
                size,
                source: io::Error::last_os_error(),
            });
        }
        debug!(shm_id, size, "shmget");

        match Self::attach(shm_id, 0) {
            Ok(segment) => Ok(segment),
            Err(e) => {
                // Nobody knows this id yet; do not leak it.
                if let Err(rm) = rmid(shm_id) {
                    warn!("{rm}");
                }
                Err(e)
            }
        }
    }

    /// Attach to an existing segment. Fails when the OS-reported size is below `min_size`.
    pub fn attach(shm_id: i32, min_size: usize) -> Result<Self> {
        let (addr, writable) = Attachment::map(shm_id)?;

        let (size, n_attach) = match stat(shm_id) {
            Ok(v) => v,
            Err(e) => {
                let _ = shmdt(shm_id, addr);
                return Err(e);
            }
        };

        let attachment = Attachment {
            shm_id,
            addr,
            size,
            writable,
        };

        if size < min_size {
            drop(attachment);
            return Err(ShmError::SizeMismatch {
                shm_id,
                what: "segment smaller than layout minimum",
                expected: min_size,
                actual: size,
            });
        }

        debug!(shm_id, size, n_attach, writable, "shmat");
        Ok(Self {
            shm_id,
            size,
            n_attach,
            attachment: Some(Arc::new(attachment)),
        })
    }

    pub fn id(&self) -> i32 {
        self.shm_id
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn n_attach(&self) -> u64 {
        self.n_attach
    }

    pub fn is_attached(&self) -> bool {
        self.attachment.is_some()
    }

    pub fn is_writable(&self) -> bool {
        self.attachment.as_ref().is_some_and(|a| a.writable)
    }

    /// View over the whole segment, `None` once detached.
    pub fn view(&self) -> Option<ShmView> {
        self.attachment
            .as_ref()
            .map(|a| ShmView::new(Arc::clone(a) as Arc<dyn Region>))
    }

    /// Like `view`, but a detached segment is an error.
    pub fn attached_view(&self) -> Result<ShmView> {
        self.view().ok_or_else(|| ShmError::AttachFailed {
            op: "view",
            shm_id: self.shm_id,
            source: io::Error::from(io::ErrorKind::NotConnected),
        })
    }

    /// Unmap from this process. No-op when already detached.
    pub fn detach(&mut self) -> Result<()> {
        let Some(attachment) = self.attachment.take() else {
            return Ok(());
        };
        match Arc::try_unwrap(attachment) {
            Ok(attachment) => attachment.detach(),
            Err(_shared) => {
                debug!(shm_id = self.shm_id, "detach deferred until last view is dropped");
                Ok(())
            }
        }
    }

    /// Detach, then ask the OS to destroy the segment. The OS defers destruction
    /// until every other process has detached.
    pub fn remove(&mut self) -> Result<()> {
        if self.shm_id < 0 {
            return Ok(());
        }
        self.detach()?;
        rmid(self.shm_id)?;
        debug!(shm_id = self.shm_id, "shmctl(IPC_RMID)");
        self.shm_id = -1;
        self.size = 0;
        self.n_attach = 0;
        Ok(())
    }

    /// First `size` bytes of the segment (clamped to the segment size).
    pub fn header(&self, size: usize) -> Vec<u8> {
        match self.view() {
            Some(view) => view.to_vec(0, size.min(self.size)),
            None => Vec::new(),
        }
    }

    /// Which managed layout, if any, this segment carries.
    pub fn header_key(&self) -> Option<HeaderKey> {
        HeaderKey::classify(&self.header(HEADER_SIZE))
    }

    pub fn is_available(&self, key: HeaderKey) -> bool {
        key.matches(&self.header(HEADER_SIZE))
    }

    /// Attach to `shm_id`, copy out up to `size` bytes, detach. Segments smaller
    /// than `size` yield all of their bytes.
    pub fn peek(shm_id: i32, size: usize) -> Result<Vec<u8>> {
        let mut segment = Self::attach(shm_id, 0)?;
        let bytes = segment.header(size);
        segment.detach()?;
        Ok(bytes)
    }

    pub fn hex_dump(shm_id: i32, size: usize) -> Result<String> {
        let bytes = Self::peek(shm_id, size)?;
        Ok(hex_dump(&format!("shmHexDump (shmId:{shm_id})"), &bytes))
    }

    pub fn show(&self) -> String {
        let addr = self.view().map(|v| v.base_addr()).unwrap_or(0);
        format!(
            "Segment {{\n  headerSize:{HEADER_SIZE}\n  shmId:{}\n  size:{}\n  nAttach:{}\n  addr:0x{addr:x}\n}}",
            self.shm_id, self.size, self.n_attach
        )
    }
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("shm_id", &self.shm_id)
            .field("size", &self.size)
            .field("n_attach", &self.n_attach)
            .field("attached", &self.is_attached())
            .finish()
    }
}

/// Classic 16-bytes-per-row hex dump with an ASCII column.
pub fn hex_dump(title: &str, bytes: &[u8]) -> String {
    let mut out = format!("{title} size:{} {{\n", bytes.len());
    for (row, chunk) in bytes.chunks(16).enumerate() {
        out.push_str(&format!("  {:08x}: ", row * 16));
        for i in 0..16 {
            match chunk.get(i) {
                Some(b) => out.push_str(&format!("{b:02x} ")),
                None => out.push_str("   "),
            }
        }
        out.push_str(" |");
        out.extend(chunk.iter().map(|&b| {
            if b.is_ascii_graphic() || b == b' ' {
                b as char
            } else {
                '.'
            }
        }));
        out.push_str("|\n");
    }
    out.push('}');
    out
}
