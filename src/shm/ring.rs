//! Streaming shared-memory rings (`PHIQ` / `PHAU`).
//!
//! A streaming ring moves a continuous sample stream (IQ from a capture
//! driver, PCM audio from a demodulator) between two processes with no
//! syscall per sample. The payload is a circular buffer of `capacity`
//! bytes addressed by **absolute** 64-bit counters:
//!
//! ```text
//! ┌──────────────────────── StreamHeader (64 bytes) ────────────────────────┐
//! │ magic │ version │ capacity │ fmt │ bps │ chans │ sr f64 │ cf f64 │      │
//! │                              seq │ wpos │ rpos   (AtomicU64)            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! │ payload: capacity bytes, ring-addressed as pos % capacity               │
//! ```
//!
//! Invariants:
//! - `wpos` and `rpos` are monotonically non-decreasing;
//!   `0 <= wpos - rpos <= capacity` at every instant.
//! - `wpos` is written only by the single producer; `rpos` by the single
//!   consumer — except under [`OverflowPolicy::OverwriteOldest`], where the
//!   producer may advance `rpos` before writing to reclaim space.
//! - The release store of `wpos` is the happens-before edge: a consumer
//!   that acquire-loads `wpos` sees every payload byte written before it.
//!
//! The overflow policy is chosen explicitly at ring creation, not implied
//! by the data kind.

// Rust guideline compliant 2026-02

use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{bail, Result};

use super::{apply_seals, create_region_fd, map_shared_rw, region_size};

/// `'PHIQ'` — IQ sample ring.
pub const IQ_MAGIC: u32 = 0x5048_4951;
/// `'PHAU'` — PCM audio ring.
pub const AUDIO_MAGIC: u32 = 0x5048_4155;
/// Streaming ring layout version. Compared exactly on attach.
pub const RING_VERSION: u32 = 1;

/// Payload offset: one cache line past the header.
pub const PAYLOAD_OFFSET: usize = 64;

/// What the ring carries; selects the header magic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingKind {
    /// Complex baseband samples from a capture driver.
    Iq,
    /// PCM audio frames.
    Audio,
}

impl RingKind {
    fn magic(self) -> u32 {
        match self {
            RingKind::Iq => IQ_MAGIC,
            RingKind::Audio => AUDIO_MAGIC,
        }
    }

    fn from_magic(magic: u32) -> Option<Self> {
        match magic {
            IQ_MAGIC => Some(RingKind::Iq),
            AUDIO_MAGIC => Some(RingKind::Audio),
            _ => None,
        }
    }
}

/// Sample encoding carried in the header's format tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SampleFormat {
    /// Complex float32 (I and Q interleaved), 8 bytes per sample.
    Cf32 = 0,
    /// Complex int16, 4 bytes per sample.
    Cs16 = 1,
    /// Real float32, 4 bytes per sample.
    F32 = 2,
    /// Uninterpreted bytes.
    Opaque = 3,
}

impl SampleFormat {
    /// Bytes per sample for this encoding (per channel).
    pub fn bytes_per_sample(self) -> u32 {
        match self {
            SampleFormat::Cf32 => 8,
            SampleFormat::Cs16 => 4,
            SampleFormat::F32 => 4,
            SampleFormat::Opaque => 1,
        }
    }

    fn from_tag(tag: u32) -> Option<Self> {
        match tag {
            0 => Some(SampleFormat::Cf32),
            1 => Some(SampleFormat::Cs16),
            2 => Some(SampleFormat::F32),
            3 => Some(SampleFormat::Opaque),
            _ => None,
        }
    }

    /// Wire encoding name used in `shm_map` frames.
    pub fn encoding_name(self) -> &'static str {
        match self {
            SampleFormat::Cf32 => "cf32",
            SampleFormat::Cs16 => "cs16",
            SampleFormat::F32 => "f32",
            SampleFormat::Opaque => "opaque",
        }
    }
}

/// Producer behavior when a push does not fit into free space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Advance `rpos` before writing, discarding the oldest bytes. The
    /// producer never stalls; a lagging consumer loses history (IQ path).
    OverwriteOldest,
    /// Refuse the push and leave the ring untouched, reporting
    /// [`PushOutcome::Dropped`] (audio path).
    DropNewest,
}

/// Result of a producer push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Bytes were written; `seq` advanced to this value.
    Stored(u64),
    /// The push was refused under [`OverflowPolicy::DropNewest`].
    Dropped,
}

/// Stream parameters fixed at ring creation.
#[derive(Debug, Clone, Copy)]
pub struct RingConfig {
    /// IQ or audio (selects the magic).
    pub kind: RingKind,
    /// Sample encoding.
    pub format: SampleFormat,
    /// Channel count (1 for IQ, 1+ for audio).
    pub channels: u32,
    /// Sample rate in Hz.
    pub sample_rate: f64,
    /// Center frequency in Hz; meaningful for IQ, zero for audio.
    pub center_freq: f64,
    /// Payload capacity in bytes.
    pub capacity: u32,
    /// Producer overflow behavior.
    pub policy: OverflowPolicy,
}

/// Mapped ring header. All fields little-endian native; the three counters
/// are the only fields mutated after the descriptor leaves the creator.
#[repr(C)]
struct StreamHeader {
    magic: u32,
    version: u32,
    capacity: u32,
    format: u32,
    bytes_per_samp: u32,
    channels: u32,
    sample_rate: f64,
    center_freq: f64,
    seq: AtomicU64,
    wpos: AtomicU64,
    rpos: AtomicU64,
}

const _: () = assert!(std::mem::size_of::<StreamHeader>() == PAYLOAD_OFFSET);

/// A mapped streaming ring.
///
/// Single-producer / single-consumer: the creating side pushes, exactly one
/// attached side pops. The handle owns its descriptor and mapping; drop
/// unmaps and closes (the region itself lives until the last fd closes).
pub struct StreamRing {
    fd: OwnedFd,
    map: memmap2::MmapMut,
    policy: OverflowPolicy,
}

impl std::fmt::Debug for StreamRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamRing")
            .field("fd", &self.fd.as_raw_fd())
            .field("kind", &self.kind())
            .field("capacity", &self.capacity())
            .field("wpos", &self.wpos())
            .field("rpos", &self.rpos())
            .field("policy", &self.policy)
            .finish()
    }
}

impl StreamRing {
    /// Create a sealed ring per `cfg`.
    pub fn create(tag: &str, cfg: &RingConfig) -> Result<Self> {
        if cfg.capacity == 0 {
            bail!("ring capacity must be non-zero");
        }
        if cfg.channels == 0 {
            bail!("ring channel count must be non-zero");
        }
        let map_bytes = PAYLOAD_OFFSET + cfg.capacity as usize;
        let fd = create_region_fd(tag, map_bytes)?;
        let mut map = map_shared_rw(fd.as_raw_fd(), map_bytes)?;

        // Header init precedes any sharing of the fd; plain writes suffice.
        // SAFETY: the mapping is page-aligned and at least PAYLOAD_OFFSET
        // bytes, satisfying StreamHeader's layout.
        unsafe {
            let hdr = map.as_mut_ptr() as *mut StreamHeader;
            (*hdr).magic = cfg.kind.magic();
            (*hdr).version = RING_VERSION;
            (*hdr).capacity = cfg.capacity;
            (*hdr).format = cfg.format as u32;
            (*hdr).bytes_per_samp = cfg.format.bytes_per_sample();
            (*hdr).channels = cfg.channels;
            (*hdr).sample_rate = cfg.sample_rate;
            (*hdr).center_freq = cfg.center_freq;
            (*hdr).seq = AtomicU64::new(0);
            (*hdr).wpos = AtomicU64::new(0);
            (*hdr).rpos = AtomicU64::new(0);
        }

        if let Err(e) = apply_seals(fd.as_raw_fd()) {
            log::warn!("[shm] ring '{tag}': sealing unavailable: {e:#}");
        }

        Ok(Self {
            fd,
            map,
            policy: cfg.policy,
        })
    }

    /// Attach to a ring received as an ancillary descriptor.
    ///
    /// Takes ownership of `fd`. Validates fstat size, magic, version, and
    /// that the declared capacity fits the mapping. The attached side is
    /// the consumer; its `policy` is irrelevant and set to
    /// [`OverflowPolicy::OverwriteOldest`].
    pub fn attach(fd: OwnedFd) -> Result<Self> {
        let size = region_size(fd.as_raw_fd())?;
        if (size as usize) < PAYLOAD_OFFSET {
            bail!("ring region truncated: {size} bytes < header");
        }
        let map = map_shared_rw(fd.as_raw_fd(), size as usize)?;

        let ring = Self {
            fd,
            map,
            policy: OverflowPolicy::OverwriteOldest,
        };
        let hdr = ring.hdr();
        if RingKind::from_magic(hdr.magic).is_none() {
            bail!("bad ring magic: {:#010x}", hdr.magic);
        }
        if hdr.version != RING_VERSION {
            bail!(
                "incompatible ring version {} (core speaks {RING_VERSION})",
                hdr.version
            );
        }
        if SampleFormat::from_tag(hdr.format).is_none() {
            bail!("unknown ring sample format tag {}", hdr.format);
        }
        let cap = hdr.capacity as usize;
        if cap == 0 || PAYLOAD_OFFSET + cap > size as usize {
            bail!("ring capacity {cap} inconsistent with mapped region of {size} bytes");
        }
        Ok(ring)
    }

    fn hdr(&self) -> &StreamHeader {
        // SAFETY: construction validated size/alignment; all post-sharing
        // mutation goes through the atomic counters.
        unsafe { &*(self.map.as_ptr() as *const StreamHeader) }
    }

    // ── Producer ──────────────────────────────────────────────────────────

    /// Push `src` into the ring.
    ///
    /// With [`OverflowPolicy::OverwriteOldest`], a push that exceeds free
    /// space advances `rpos` first (oldest bytes discarded); a push larger
    /// than the whole capacity is an error since it could never be
    /// represented. With [`OverflowPolicy::DropNewest`], a push that does
    /// not fit free space returns [`PushOutcome::Dropped`] and changes
    /// nothing.
    ///
    /// Only the creating (producer) side may call this.
    pub fn push(&mut self, src: &[u8]) -> Result<PushOutcome> {
        // Raw payload base taken before the header borrow; the two regions
        // never overlap (payload starts at PAYLOAD_OFFSET).
        // SAFETY: PAYLOAD_OFFSET is within the mapping by construction.
        let payload = unsafe { self.map.as_mut_ptr().add(PAYLOAD_OFFSET) };
        let hdr = self.hdr();
        let cap = hdr.capacity as u64;
        let n = src.len() as u64;
        if n == 0 {
            return Ok(PushOutcome::Stored(hdr.seq.load(Ordering::Acquire)));
        }
        if n > cap {
            bail!("push of {n} bytes exceeds ring capacity {cap}");
        }

        // wpos is producer-owned; relaxed load is sufficient. rpos may be
        // advanced by the consumer concurrently.
        let w = hdr.wpos.load(Ordering::Relaxed);
        let r = hdr.rpos.load(Ordering::Acquire);

        if (w - r) + n > cap {
            match self.policy {
                OverflowPolicy::OverwriteOldest => {
                    // Reclaim exactly the shortfall: after this store the
                    // bytes in flight plus the new push equal the capacity.
                    hdr.rpos.store(w + n - cap, Ordering::Release);
                }
                OverflowPolicy::DropNewest => return Ok(PushOutcome::Dropped),
            }
        }

        let mod_w = (w % cap) as usize;
        let first = (src.len()).min(cap as usize - mod_w);
        // SAFETY: mod_w + first <= capacity and the remainder lands at the
        // payload start; both spans stay inside the mapped payload. The
        // producer is the only writer of these byte ranges (bytes at or
        // past rpos-after-reclaim are not read by the consumer).
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), payload.add(mod_w), first);
            if first < src.len() {
                std::ptr::copy_nonoverlapping(
                    src.as_ptr().add(first),
                    payload,
                    src.len() - first,
                );
            }
        }

        // The release store publishes the payload bytes to the consumer.
        hdr.wpos.store(w + n, Ordering::Release);
        Ok(PushOutcome::Stored(hdr.seq.fetch_add(1, Ordering::AcqRel) + 1))
    }

    /// Refresh the stream metadata (e.g. after a retune). Producer only.
    pub fn set_stream_meta(&mut self, sample_rate: f64, center_freq: f64) {
        // SAFETY: plain f64 fields; metadata readers tolerate tearing-free
        // word-sized updates on the platforms this targets, matching the
        // producer-refresh behavior of the header contract.
        unsafe {
            let hdr = self.map.as_mut_ptr() as *mut StreamHeader;
            (*hdr).sample_rate = sample_rate;
            (*hdr).center_freq = center_freq;
        }
    }

    // ── Consumer ──────────────────────────────────────────────────────────

    /// Pop up to `dst.len()` bytes. Returns the number of bytes read.
    ///
    /// Never reads past the snapshotted `wpos`; advances `rpos` by exactly
    /// the returned count. Only the single consumer may call this.
    pub fn pop(&mut self, dst: &mut [u8]) -> usize {
        // SAFETY: PAYLOAD_OFFSET is within the mapping by construction.
        let payload = unsafe { self.map.as_mut_ptr().add(PAYLOAD_OFFSET) };
        let hdr = self.hdr();
        let cap = hdr.capacity as u64;

        // Acquire pairs with the producer's release store of wpos.
        let w = hdr.wpos.load(Ordering::Acquire);
        let r = hdr.rpos.load(Ordering::Relaxed);
        let avail = w - r;
        let n = (dst.len() as u64).min(avail) as usize;
        if n == 0 {
            return 0;
        }

        let mod_r = (r % cap) as usize;
        let first = n.min(cap as usize - mod_r);
        // SAFETY: both spans stay inside the mapped payload; the producer
        // does not write bytes in [rpos, wpos) while the consumer holds
        // them (single-producer/single-consumer contract).
        unsafe {
            std::ptr::copy_nonoverlapping(payload.add(mod_r), dst.as_mut_ptr(), first);
            if first < n {
                std::ptr::copy_nonoverlapping(
                    payload,
                    dst.as_mut_ptr().add(first),
                    n - first,
                );
            }
        }

        hdr.rpos.store(r + n as u64, Ordering::Release);
        n
    }

    /// Bytes currently in the ring (`wpos - rpos`).
    pub fn available(&self) -> u64 {
        let hdr = self.hdr();
        hdr.wpos.load(Ordering::Acquire) - hdr.rpos.load(Ordering::Acquire)
    }

    // ── Accessors ─────────────────────────────────────────────────────────

    /// Ring kind decoded from the magic.
    pub fn kind(&self) -> RingKind {
        RingKind::from_magic(self.hdr().magic).unwrap_or(RingKind::Iq)
    }

    /// Sample encoding.
    pub fn format(&self) -> SampleFormat {
        SampleFormat::from_tag(self.hdr().format).unwrap_or(SampleFormat::Opaque)
    }

    /// Channel count.
    pub fn channels(&self) -> u32 {
        self.hdr().channels
    }

    /// Sample rate in Hz.
    pub fn sample_rate(&self) -> f64 {
        self.hdr().sample_rate
    }

    /// Center frequency in Hz (zero for audio rings).
    pub fn center_freq(&self) -> f64 {
        self.hdr().center_freq
    }

    /// Payload capacity in bytes.
    pub fn capacity(&self) -> u32 {
        self.hdr().capacity
    }

    /// Publish sequence counter.
    pub fn seq(&self) -> u64 {
        self.hdr().seq.load(Ordering::Acquire)
    }

    /// Absolute producer counter.
    pub fn wpos(&self) -> u64 {
        self.hdr().wpos.load(Ordering::Acquire)
    }

    /// Absolute consumer counter.
    pub fn rpos(&self) -> u64 {
        self.hdr().rpos.load(Ordering::Acquire)
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
