//! v0 simple shared-memory blob (`PHSH`).
//!
//! The minimal publish/attach data model: one header, one payload buffer,
//! whole-payload publishes. A producer copies up to `capacity` bytes in,
//! release-stores `used`, and bumps `seq`; a consumer that samples `seq`
//! twice and sees no change observed no new data.
//!
//! Wire layout: `[BlobHeader][payload bytes...]`, proto tag
//! `phasehound.shm.v0`.

// Rust guideline compliant 2026-02

use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use anyhow::{bail, Result};

use super::{apply_seals, create_region_fd, map_shared_rw, region_size};

/// `'PHSH'` (big-endian byte reading of the tag).
pub const BLOB_MAGIC: u32 = 0x5048_5348;
/// Blob layout major version. A different major is unmappable.
pub const BLOB_VMAJOR: u16 = 0;
/// Blob layout minor version. Consumers tolerate a newer minor within the
/// same major.
pub const BLOB_VMINOR: u16 = 1;

/// Header at offset 0 of every blob region.
#[repr(C)]
pub struct BlobHeader {
    magic: u32,
    ver_major: u16,
    ver_minor: u16,
    /// Bumped (acq/rel) once per publish.
    seq: AtomicU64,
    /// Valid payload bytes, release-stored after the payload copy.
    used: AtomicU32,
    capacity: u32,
    // payload follows
}

/// Payload starts immediately after the header.
const PAYLOAD_OFFSET: usize = std::mem::size_of::<BlobHeader>();

const _: () = assert!(std::mem::size_of::<BlobHeader>() == 24);

/// A mapped v0 blob — producer side when built with [`ShmBlob::create`],
/// consumer side when built with [`ShmBlob::attach`]. Either way the handle
/// owns its descriptor and mapping; drop unmaps and closes.
pub struct ShmBlob {
    fd: OwnedFd,
    map: memmap2::MmapMut,
}

impl std::fmt::Debug for ShmBlob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShmBlob")
            .field("fd", &self.fd.as_raw_fd())
            .field("capacity", &self.capacity())
            .field("used", &self.used())
            .field("seq", &self.seq())
            .finish()
    }
}

impl ShmBlob {
    /// Create a sealed blob with room for `payload_bytes` of payload.
    ///
    /// The header is initialized before sealing. Seal failure on the POSIX
    /// fallback path is logged and tolerated; on memfds it is an error.
    pub fn create(tag: &str, payload_bytes: usize) -> Result<Self> {
        if payload_bytes == 0 || payload_bytes > u32::MAX as usize {
            bail!("blob payload size out of range: {payload_bytes}");
        }
        let map_bytes = PAYLOAD_OFFSET + payload_bytes;
        let fd = create_region_fd(tag, map_bytes)?;
        let mut map = map_shared_rw(fd.as_raw_fd(), map_bytes)?;

        // Header init happens before the fd ever leaves this process, so
        // plain writes are fine here.
        // SAFETY: the mapping is at least PAYLOAD_OFFSET bytes and
        // page-aligned, satisfying BlobHeader's layout and alignment.
        unsafe {
            let hdr = map.as_mut_ptr() as *mut BlobHeader;
            (*hdr).magic = BLOB_MAGIC;
            (*hdr).ver_major = BLOB_VMAJOR;
            (*hdr).ver_minor = BLOB_VMINOR;
            (*hdr).seq = AtomicU64::new(0);
            (*hdr).used = AtomicU32::new(0);
            (*hdr).capacity = payload_bytes as u32;
        }

        if let Err(e) = apply_seals(fd.as_raw_fd()) {
            log::warn!("[shm] blob '{tag}': sealing unavailable: {e:#}");
        }

        Ok(Self { fd, map })
    }

    /// Attach to a blob received as an ancillary descriptor.
    ///
    /// Takes ownership of `fd`. Validates the fstat size against the header,
    /// the magic, and the major version; a newer minor within the same major
    /// is accepted.
    pub fn attach(fd: OwnedFd) -> Result<Self> {
        let size = region_size(fd.as_raw_fd())?;
        if (size as usize) < PAYLOAD_OFFSET {
            bail!("blob region truncated: {size} bytes < header");
        }
        let map = map_shared_rw(fd.as_raw_fd(), size as usize)?;

        let blob = Self { fd, map };
        let hdr = blob.hdr();
        if hdr.magic != BLOB_MAGIC {
            bail!("bad blob magic: {:#010x}", hdr.magic);
        }
        if hdr.ver_major != BLOB_VMAJOR {
            bail!(
                "incompatible blob version {}.{} (core speaks {BLOB_VMAJOR}.{BLOB_VMINOR})",
                hdr.ver_major,
                hdr.ver_minor
            );
        }
        let cap = hdr.capacity as usize;
        if PAYLOAD_OFFSET + cap > size as usize {
            bail!("blob capacity {cap} exceeds mapped region of {size} bytes");
        }
        Ok(blob)
    }

    fn hdr(&self) -> &BlobHeader {
        // SAFETY: construction validated size/alignment; the header fields
        // mutated after sharing are atomics.
        unsafe { &*(self.map.as_ptr() as *const BlobHeader) }
    }

    /// Copy `src` into the payload and publish it: release-store `used`,
    /// then bump `seq` acq/rel. Returns the new sequence number.
    ///
    /// Single-producer: only the creating side may publish.
    pub fn publish(&mut self, src: &[u8]) -> Result<u64> {
        let cap = self.capacity();
        if src.len() > cap {
            bail!("publish of {} bytes exceeds blob capacity {cap}", src.len());
        }
        let payload = &mut self.map[PAYLOAD_OFFSET..PAYLOAD_OFFSET + src.len()];
        payload.copy_from_slice(src);

        let hdr = self.hdr();
        hdr.used.store(src.len() as u32, Ordering::Release);
        Ok(hdr.seq.fetch_add(1, Ordering::AcqRel) + 1)
    }

    /// Snapshot the current payload (the `used` bytes as of this call).
    ///
    /// The acquire load of `used` pairs with the producer's release store,
    /// so the returned bytes are at least as new as the observed length.
    pub fn read(&self) -> &[u8] {
        let used = self.hdr().used.load(Ordering::Acquire) as usize;
        let used = used.min(self.capacity());
        &self.map[PAYLOAD_OFFSET..PAYLOAD_OFFSET + used]
    }

    /// Current publish sequence number (acquire).
    pub fn seq(&self) -> u64 {
        self.hdr().seq.load(Ordering::Acquire)
    }

    /// Valid payload bytes as of the last publish.
    pub fn used(&self) -> usize {
        self.hdr().used.load(Ordering::Acquire) as usize
    }

    /// Payload capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.hdr().capacity as usize
    }

    /// Raw descriptor value for SCM_RIGHTS attachment.
    pub fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Total mapped bytes (header + payload).
    pub fn map_len(&self) -> usize {
        self.map.len()
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
