//! Named POSIX shared-memory segments.

use std::ffi::CString;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::ptr::NonNull;

use uuid::Uuid;

use crate::error::{RPolarsErr, RResult, Rctx};

use super::ShmDescriptor;

/// A mapped shared-memory segment.
///
/// The owner of a segment unlinks its name on drop; other mappings stay
/// valid until they are dropped too.
pub struct SharedSegment {
    name: String,
    ptr: NonNull<u8>,
    /// Bytes of payload.
    len: usize,
    /// Bytes mapped (never zero).
    map_len: usize,
    owner: bool,
}

// SAFETY: the mapping is process-wide and the segment is never written after
// `create` returns, so moving it across threads is sound.
unsafe impl Send for SharedSegment {}

impl SharedSegment {
    /// Create a segment holding a copy of `bytes`. The caller owns it.
    pub fn create(bytes: &[u8]) -> RResult<Self> {
        // macOS caps names at 31 bytes.
        let name = format!("/rpl-{}", &Uuid::new_v4().simple().to_string()[..20]);
        let c_name = c_name(&name)?;

        // SAFETY: c_name is a valid NUL-terminated string.
        let raw = unsafe {
            libc::shm_open(
                c_name.as_ptr(),
                libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
                0o600 as libc::c_uint,
            )
        };
        if raw < 0 {
            return Err(os_error(format!("creating shared segment {name}")));
        }
        // SAFETY: shm_open returned a fresh descriptor we now own.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let map_len = bytes.len().max(1);
        let mapped = (|| {
            // SAFETY: fd is a valid shm descriptor.
            if unsafe { libc::ftruncate(fd.as_raw_fd(), map_len as libc::off_t) } != 0 {
                return Err(os_error(format!("sizing shared segment {name}")));
            }
            map(&fd, map_len, libc::PROT_READ | libc::PROT_WRITE, &name)
        })();
        let ptr = match mapped {
            Ok(ptr) => ptr,
            Err(e) => {
                // SAFETY: c_name is valid; the segment is ours to remove.
                unsafe { libc::shm_unlink(c_name.as_ptr()) };
                return Err(e);
            }
        };

        // SAFETY: the mapping is at least `bytes.len()` long and writable.
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.as_ptr(), bytes.len()) };

        Ok(Self {
            name,
            ptr,
            len: bytes.len(),
            map_len,
            owner: true,
        })
    }

    /// Map an existing segment read-only. The caller does not own it.
    pub fn open(desc: &ShmDescriptor) -> RResult<Self> {
        let c_name = c_name(&desc.name)?;
        // SAFETY: c_name is a valid NUL-terminated string.
        let raw = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDONLY, 0 as libc::c_uint) };
        if raw < 0 {
            return Err(os_error(format!("opening shared segment {}", desc.name)));
        }
        // SAFETY: shm_open returned a fresh descriptor we now own.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let len = usize::try_from(desc.len).map_err(RPolarsErr::lift)?;
        let map_len = len.max(1);
        let ptr = map(&fd, map_len, libc::PROT_READ, &desc.name)?;

        Ok(Self {
            name: desc.name.clone(),
            ptr,
            len,
            map_len,
            owner: false,
        })
    }

    /// Take ownership: the name is unlinked when this value drops.
    pub fn claim(mut self) -> Self {
        self.owner = true;
        self
    }

    /// Give up ownership and unmap, leaving the segment for whoever receives
    /// the returned descriptor.
    pub fn hand_off(mut self) -> ShmDescriptor {
        self.owner = false;
        self.descriptor()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn descriptor(&self) -> ShmDescriptor {
        ShmDescriptor {
            name: self.name.clone(),
            len: self.len as u64,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: the mapping lives as long as self and holds `len` bytes.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for SharedSegment {
    fn drop(&mut self) {
        // SAFETY: ptr/map_len describe a mapping created by `map`.
        unsafe { libc::munmap(self.ptr.as_ptr().cast(), self.map_len) };
        if !self.owner {
            return;
        }
        if let Ok(c_name) = CString::new(self.name.as_str()) {
            // SAFETY: c_name is a valid NUL-terminated string.
            if unsafe { libc::shm_unlink(c_name.as_ptr()) } != 0 {
                tracing::warn!(
                    "Failed to unlink shared segment {}: {}",
                    self.name,
                    std::io::Error::last_os_error()
                );
            }
        }
    }
}

fn c_name(name: &str) -> RResult<CString> {
    CString::new(name).map_err(RPolarsErr::lift)
}

fn os_error(what: String) -> RPolarsErr {
    RPolarsErr::lift(std::io::Error::last_os_error()).push(Rctx::When(what))
}

fn map(fd: &OwnedFd, len: usize, prot: libc::c_int, name: &str) -> RResult<NonNull<u8>> {
    // SAFETY: fd is valid and the segment is at least `len` bytes long.
    let addr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            prot,
            libc::MAP_SHARED,
            fd.as_raw_fd(),
            0,
        )
    };
    if addr == libc::MAP_FAILED {
        return Err(os_error(format!("mapping shared segment {name}")));
    }
    NonNull::new(addr.cast::<u8>())
        .ok_or_else(|| RPolarsErr::transport(format!("mmap returned null for {name}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_open_claim() {
        let payload = b"columnar bytes".to_vec();
        let owner = SharedSegment::create(&payload).unwrap();
        let desc = owner.descriptor();
        assert_eq!(desc.len, payload.len() as u64);

        let reader = SharedSegment::open(&desc).unwrap();
        assert_eq!(reader.as_bytes(), payload.as_slice());
        drop(reader);

        // Still there: the reader did not own it. Claiming moves the unlink
        // to the reader.
        let claimed = SharedSegment::open(&desc).unwrap().claim();
        drop(claimed);
        assert!(SharedSegment::open(&desc).is_err());
        drop(owner);
    }

    #[test]
    fn test_empty_segment() {
        let owner = SharedSegment::create(&[]).unwrap();
        let reader = SharedSegment::open(&owner.descriptor()).unwrap();
        assert!(reader.as_bytes().is_empty());
    }

    #[test]
    fn test_hand_off_leaves_segment_for_receiver() {
        let desc = SharedSegment::create(b"reply").unwrap().hand_off();
        let received = SharedSegment::open(&desc).unwrap().claim();
        assert_eq!(received.as_bytes(), b"reply");
        drop(received);
        assert!(SharedSegment::open(&desc).is_err());
    }
}
