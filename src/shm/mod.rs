//! Sealed shared-memory regions — the data-plane substrate.
//!
//! Bulk samples (IQ, PCM) never travel in broker frames; they move through
//! memory-mapped ring buffers whose backing descriptor is handed to peers
//! via SCM_RIGHTS. This module owns region creation and the integrity
//! contract that makes a mapping received from another process safe to use:
//!
//! - the region is an anonymous `memfd` (preferred) or a POSIX shared
//!   object unlinked immediately after creation — nothing on the
//!   filesystem, nothing to race on;
//! - `F_SEAL_SEAL | F_SEAL_SHRINK | F_SEAL_GROW` are applied after sizing
//!   where the kernel supports them, so neither party can truncate the
//!   mapping out from under the other;
//! - descriptors are close-on-exec.
//!
//! [`blob`] layers the v0 simple publish/attach buffer on top;
//! [`ring`] layers the streaming rings with absolute producer/consumer
//! counters.

// Rust guideline compliant 2026-02

pub mod blob;
pub mod ring;

use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use anyhow::{bail, Context, Result};

/// Set FD_CLOEXEC on `fd`.
fn set_cloexec(fd: RawFd) -> io::Result<()> {
    // SAFETY: fcntl F_GETFD/F_SETFD on a live descriptor.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFD);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if flags & libc::FD_CLOEXEC != 0 {
            return Ok(());
        }
        if libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn memfd_create(tag: &str) -> io::Result<OwnedFd> {
    let name = std::ffi::CString::new(tag.as_bytes()).unwrap_or_else(|_| {
        std::ffi::CString::new("phshm").expect("static name has no NUL")
    });
    // SAFETY: name is a valid NUL-terminated string for the call.
    let fd = unsafe { libc::memfd_create(name.as_ptr(), libc::MFD_CLOEXEC) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: fd is a fresh descriptor we own.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

#[cfg(not(target_os = "linux"))]
fn memfd_create(_tag: &str) -> io::Result<OwnedFd> {
    Err(io::Error::from_raw_os_error(libc::ENOSYS))
}

/// POSIX fallback: `shm_open` with a random-ish name, unlinked immediately
/// after creation so the object is anonymous once mapped.
fn posix_shm_create() -> io::Result<OwnedFd> {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let name = std::ffi::CString::new(format!("/phshm.{}.{}", std::process::id(), nanos))
        .expect("generated name has no NUL");
    // SAFETY: name is a valid NUL-terminated string for the call.
    let fd = unsafe {
        libc::shm_open(
            name.as_ptr(),
            libc::O_RDWR | libc::O_CREAT | libc::O_EXCL,
            0o600 as libc::mode_t,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // Unlink right away: the name only existed to create the object.
    // SAFETY: name remains valid; the fd keeps the object alive.
    unsafe { libc::shm_unlink(name.as_ptr()) };
    // SAFETY: fd is a fresh descriptor we own.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Create an anonymous shared-memory region of exactly `map_bytes` bytes.
///
/// Prefers `memfd_create`; falls back to the named-and-unlinked POSIX path
/// when the kernel lacks it. The descriptor is close-on-exec. Seals are NOT
/// applied here — callers initialize the header first, then call
/// [`apply_seals`].
pub fn create_region_fd(tag: &str, map_bytes: usize) -> Result<OwnedFd> {
    if map_bytes == 0 {
        bail!("shared region size must be non-zero");
    }

    let fd = match memfd_create(tag) {
        Ok(fd) => fd,
        Err(e) if e.raw_os_error() == Some(libc::ENOSYS) => {
            log::debug!("[shm] memfd_create unavailable, using POSIX shm fallback");
            posix_shm_create().context("create POSIX shared object")?
        }
        Err(e) => return Err(e).context("memfd_create"),
    };

    set_cloexec(fd.as_raw_fd()).context("set close-on-exec on shared region")?;

    // SAFETY: ftruncate on a live descriptor we own.
    let rc = unsafe { libc::ftruncate(fd.as_raw_fd(), map_bytes as libc::off_t) };
    if rc != 0 {
        return Err(io::Error::last_os_error()).context("size shared region");
    }

    Ok(fd)
}

/// Apply grow/shrink/reseal seals to a memfd-backed region.
///
/// No-op on platforms without file sealing. Sealing can legitimately fail
/// on the POSIX fallback path (only memfds support seals); callers treat
/// that as best-effort.
pub fn apply_seals(fd: RawFd) -> Result<()> {
    #[cfg(target_os = "linux")]
    {
        let seals = libc::F_SEAL_SEAL | libc::F_SEAL_SHRINK | libc::F_SEAL_GROW;
        // SAFETY: fcntl F_ADD_SEALS on a live descriptor.
        let rc = unsafe { libc::fcntl(fd, libc::F_ADD_SEALS, seals) };
        if rc != 0 {
            return Err(io::Error::last_os_error()).context("apply seals");
        }
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = fd;
    }
    Ok(())
}

/// Size of the object behind `fd` (fstat).
pub fn region_size(fd: RawFd) -> Result<u64> {
    // SAFETY: st is fully initialized by a successful fstat.
    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    // SAFETY: fd is live and st is a valid out-pointer.
    let rc = unsafe { libc::fstat(fd, &mut st) };
    if rc != 0 {
        return Err(io::Error::last_os_error()).context("fstat shared region");
    }
    Ok(st.st_size as u64)
}

/// Map `map_bytes` of `fd` read/write, `MAP_SHARED`.
pub(crate) fn map_shared_rw(fd: RawFd, map_bytes: usize) -> Result<memmap2::MmapMut> {
    // SAFETY: the descriptor refers to a shared-memory object of at least
    // `map_bytes` bytes (created or fstat-validated by the caller); the
    // mapping is MAP_SHARED and lives no longer than the MmapMut.
    let map = unsafe {
        memmap2::MmapOptions::new()
            .len(map_bytes)
            .map_mut(fd)
            .context("mmap shared region")?
    };
    Ok(map)
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_region_has_requested_size() {
        let fd = create_region_fd("test", 4096).expect("create");
        assert_eq!(region_size(fd.as_raw_fd()).expect("fstat"), 4096);
    }

    #[test]
    fn test_zero_size_rejected() {
        assert!(create_region_fd("test", 0).is_err());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_seals_prevent_resize() {
        let fd = create_region_fd("test", 4096).expect("create");
        apply_seals(fd.as_raw_fd()).expect("seal");
        // Growing or shrinking a sealed memfd must fail with EPERM.
        // SAFETY: ftruncate on our own live descriptor.
        let rc = unsafe { libc::ftruncate(fd.as_raw_fd(), 8192) };
        assert_eq!(rc, -1, "resize of a sealed region must fail");
    }

    #[test]
    fn test_mapping_is_shared_across_fd_dups() {
        let fd = create_region_fd("test", 4096).expect("create");
        // SAFETY: duplicating our own live descriptor.
        let dup = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_DUPFD_CLOEXEC, 0) };
        assert!(dup >= 0);
        // SAFETY: dup is a fresh descriptor we own.
        let dup = unsafe { OwnedFd::from_raw_fd(dup) };

        let mut a = map_shared_rw(fd.as_raw_fd(), 4096).expect("map a");
        let b = map_shared_rw(dup.as_raw_fd(), 4096).expect("map b");
        a[0] = 0xAB;
        a[4095] = 0xCD;
        assert_eq!(b[0], 0xAB, "writes must be visible through the second mapping");
        assert_eq!(b[4095], 0xCD);
    }
}
