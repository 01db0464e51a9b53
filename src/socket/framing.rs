//! Wire framing for the broker's Unix domain socket.
//!
//! Every message is one frame:
//!
//! ```text
//! [u32 BE length] [payload: length bytes of UTF-8 JSON]
//! ```
//!
//! A frame may carry ancillary file descriptors (SCM_RIGHTS). The length
//! prefix is always written as a separate send; the descriptors ride on the
//! payload `sendmsg` so receivers get them in the same receive as the bytes
//! they describe.
//!
//! # FD ownership
//!
//! [`recv_frame`] returns received descriptors as [`OwnedFd`] — dropping a
//! [`Frame`] closes every descriptor the caller did not take out of it.
//! Sending never consumes the caller's descriptors: the kernel duplicates
//! them into the receiver's queue and both sides own independent copies.

// Rust guideline compliant 2026-02

use std::io;
use std::os::unix::io::{FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::constants::MAX_FRAME_FDS;

/// One received frame: payload bytes plus any ancillary descriptors.
#[derive(Debug)]
pub struct Frame {
    /// Frame payload (JSON text by convention, not validated here).
    pub payload: Vec<u8>,
    /// Descriptors received alongside the payload. Owned: dropping the frame
    /// closes every descriptor the caller did not take out of it.
    pub fds: Vec<OwnedFd>,
}

/// Result of one receive attempt.
#[derive(Debug)]
pub enum RecvOutcome {
    /// A complete frame arrived.
    Frame(Frame),
    /// The timeout elapsed before the first length byte. No bytes were
    /// consumed; the connection is intact.
    NoFrame,
    /// The peer closed the connection cleanly before the first length byte.
    Disconnected,
}

// ─── Poll helper ────────────────────────────────────────────────────────────

/// Wait until `fd` is readable or `timeout` elapses.
///
/// `None` waits indefinitely. Returns `Ok(false)` on timeout. EINTR retries
/// with the remaining budget.
fn poll_readable(fd: RawFd, timeout: Option<Duration>) -> io::Result<bool> {
    let deadline = timeout.map(|t| std::time::Instant::now() + t);
    loop {
        let wait_ms: i32 = match deadline {
            None => -1,
            Some(d) => {
                let left = d.saturating_duration_since(std::time::Instant::now());
                left.as_millis().min(i32::MAX as u128) as i32
            }
        };
        let mut pfd = libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        };
        // SAFETY: pfd is a valid pollfd array of length 1 for this call.
        let rc = unsafe { libc::poll(&mut pfd, 1, wait_ms) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        return Ok(rc > 0);
    }
}

// ─── Send ───────────────────────────────────────────────────────────────────

/// Write all of `buf` to `fd`, retrying on EINTR and short writes.
///
/// EAGAIN is an error: broker sends are best-effort, and a subscriber whose
/// socket buffer is full is treated as broken rather than blocking the loop.
fn write_all(fd: RawFd, buf: &[u8]) -> io::Result<()> {
    let mut off = 0usize;
    while off < buf.len() {
        // SAFETY: the pointer/length pair stays within `buf` for the call.
        let n = unsafe {
            libc::write(
                fd,
                buf[off..].as_ptr() as *const libc::c_void,
                buf.len() - off,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::WriteZero, "zero-length write"));
        }
        off += n as usize;
    }
    Ok(())
}

/// Send one frame with no ancillary descriptors.
pub fn send_frame(fd: RawFd, payload: &[u8]) -> Result<()> {
    let be = (payload.len() as u32).to_be_bytes();
    write_all(fd, &be).context("send frame length")?;
    write_all(fd, payload).context("send frame payload")?;
    Ok(())
}

/// Send one frame with `fds` attached as SCM_RIGHTS ancillary data.
///
/// The length prefix goes out as a separate write so framing stays
/// deterministic; the descriptors are attached to the payload `sendmsg` in a
/// single kernel call. At most [`MAX_FRAME_FDS`] descriptors are sent.
///
/// The kernel duplicates each descriptor into the receiving process; the
/// caller's copies remain valid and owned by the caller.
pub fn send_frame_with_fds(fd: RawFd, payload: &[u8], fds: &[RawFd]) -> Result<()> {
    if fds.is_empty() {
        return send_frame(fd, payload);
    }
    let nfds = fds.len().min(MAX_FRAME_FDS);

    let be = (payload.len() as u32).to_be_bytes();
    write_all(fd, &be).context("send frame length")?;

    let fd_bytes = nfds * std::mem::size_of::<libc::c_int>();
    // SAFETY: CMSG_SPACE is a pure size computation.
    let cmsg_space = unsafe { libc::CMSG_SPACE(fd_bytes as u32) } as usize;
    let mut cmsg_buf = vec![0u8; cmsg_space];

    let mut iov = libc::iovec {
        iov_base: payload.as_ptr() as *mut libc::c_void,
        iov_len: payload.len(),
    };
    // SAFETY: zeroed msghdr is a valid "no name, no control" starting state.
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = cmsg_space as _;

    // SAFETY: msg_control points at cmsg_space valid bytes; CMSG_FIRSTHDR
    // therefore returns a writable header inside cmsg_buf.
    unsafe {
        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        (*cmsg).cmsg_len = libc::CMSG_LEN(fd_bytes as u32) as _;
        let data = libc::CMSG_DATA(cmsg) as *mut libc::c_int;
        for (i, &raw) in fds.iter().take(nfds).enumerate() {
            std::ptr::write_unaligned(data.add(i), raw);
        }
    }

    loop {
        // SAFETY: msg references live iov and cmsg buffers for the call.
        let n = unsafe { libc::sendmsg(fd, &msg, 0) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err).context("sendmsg frame payload with fds");
        }
        if (n as usize) < payload.len() {
            // The descriptors rode on the first segment; push the rest plain.
            return write_all(fd, &payload[n as usize..])
                .context("send frame payload remainder");
        }
        return Ok(());
    }
}

// ─── Receive ────────────────────────────────────────────────────────────────

/// Read exactly `buf.len()` bytes, polling with `timeout` between chunks.
///
/// EOF or a stalled peer mid-buffer is an error — a partial frame is
/// unrecoverable.
fn read_exact_timeout(fd: RawFd, buf: &mut [u8], timeout: Option<Duration>) -> Result<()> {
    let mut off = 0usize;
    while off < buf.len() {
        // SAFETY: the pointer/length pair stays within `buf` for the call.
        let n = unsafe {
            libc::read(
                fd,
                buf[off..].as_mut_ptr() as *mut libc::c_void,
                buf.len() - off,
            )
        };
        if n > 0 {
            off += n as usize;
            continue;
        }
        if n == 0 {
            bail!("peer closed mid-frame ({off}/{} bytes)", buf.len());
        }
        let err = io::Error::last_os_error();
        match err.kind() {
            io::ErrorKind::Interrupted => continue,
            io::ErrorKind::WouldBlock => {
                if !poll_readable(fd, timeout).context("poll mid-frame")? {
                    bail!("timeout mid-frame ({off}/{} bytes)", buf.len());
                }
            }
            _ => return Err(err).context("read frame bytes"),
        }
    }
    Ok(())
}

/// Receive one frame, capturing up to [`MAX_FRAME_FDS`] ancillary
/// descriptors.
///
/// * Returns [`RecvOutcome::NoFrame`] if `timeout` elapses before the first
///   length byte — no side effects, the connection stays usable.
/// * Returns [`RecvOutcome::Disconnected`] on clean EOF at a frame boundary.
/// * A length prefix `>= max_payload` is refused with an error; the caller
///   must treat the connection as broken (framing can no longer be trusted).
/// * EOF or timeout mid-frame is an error.
pub fn recv_frame(
    fd: RawFd,
    max_payload: usize,
    timeout: Option<Duration>,
) -> Result<RecvOutcome> {
    // 1) Length prefix. The poll distinguishes "nothing yet" from errors.
    if !poll_readable(fd, timeout).context("poll for frame")? {
        return Ok(RecvOutcome::NoFrame);
    }
    let mut len_buf = [0u8; 4];
    // First read: EOF here is a clean disconnect, not a broken frame.
    let first = loop {
        // SAFETY: len_buf is a valid 4-byte buffer.
        let n = unsafe { libc::read(fd, len_buf.as_mut_ptr() as *mut libc::c_void, 4) };
        if n >= 0 {
            break n as usize;
        }
        let err = io::Error::last_os_error();
        match err.kind() {
            io::ErrorKind::Interrupted => continue,
            // Spurious readiness; treat like a timeout at the boundary.
            io::ErrorKind::WouldBlock => return Ok(RecvOutcome::NoFrame),
            _ => return Err(err).context("read frame length"),
        }
    };
    if first == 0 {
        return Ok(RecvOutcome::Disconnected);
    }
    if first < 4 {
        read_exact_timeout(fd, &mut len_buf[first..], timeout)
            .context("read frame length remainder")?;
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len >= max_payload {
        bail!("frame too large: {len} bytes (cap {max_payload})");
    }

    // 2) Payload via one recvmsg with ancillary capacity; descriptors are
    //    associated with the first payload segment.
    let mut payload = vec![0u8; len];
    let mut fds: Vec<OwnedFd> = Vec::new();

    // SAFETY: CMSG_SPACE is a pure size computation.
    let cmsg_space =
        unsafe { libc::CMSG_SPACE((MAX_FRAME_FDS * std::mem::size_of::<libc::c_int>()) as u32) }
            as usize;
    let mut cmsg_buf = vec![0u8; cmsg_space];

    let mut got = 0usize;
    if len > 0 {
        loop {
            let mut iov = libc::iovec {
                iov_base: payload.as_mut_ptr() as *mut libc::c_void,
                iov_len: payload.len(),
            };
            // SAFETY: zeroed msghdr is a valid starting state.
            let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
            msg.msg_iov = &mut iov;
            msg.msg_iovlen = 1;
            msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
            msg.msg_controllen = cmsg_space as _;

            // SAFETY: msg references live iov and cmsg buffers for the call.
            let n = unsafe { libc::recvmsg(fd, &mut msg, 0) };
            if n > 0 {
                got = n as usize;
                collect_fds(&msg, &mut fds);
                break;
            }
            if n == 0 {
                bail!("peer closed mid-frame (0/{len} payload bytes)");
            }
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::Interrupted => continue,
                io::ErrorKind::WouldBlock => {
                    if !poll_readable(fd, timeout).context("poll for payload")? {
                        bail!("timeout waiting for frame payload");
                    }
                }
                _ => return Err(err).context("recvmsg frame payload"),
            }
        }
    }
    if got < len {
        read_exact_timeout(fd, &mut payload[got..], timeout)
            .context("read frame payload remainder")?;
    }

    Ok(RecvOutcome::Frame(Frame { payload, fds }))
}

/// Extract SCM_RIGHTS descriptors from `msg` into `out` as owned fds.
fn collect_fds(msg: &libc::msghdr, out: &mut Vec<OwnedFd>) {
    // SAFETY: msg came back from a successful recvmsg; the CMSG_* macros walk
    // only the control buffer the kernel filled, and each SCM_RIGHTS payload
    // carries cmsg_len/sizeof(int) valid, process-owned descriptors.
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let data = libc::CMSG_DATA(cmsg);
                let count = ((*cmsg).cmsg_len as usize - libc::CMSG_LEN(0) as usize)
                    / std::mem::size_of::<libc::c_int>();
                for i in 0..count {
                    let raw: libc::c_int = std::ptr::read_unaligned(
                        data.add(i * std::mem::size_of::<libc::c_int>()) as *const libc::c_int,
                    );
                    if out.len() < MAX_FRAME_FDS {
                        out.push(OwnedFd::from_raw_fd(raw));
                    } else {
                        // Over-limit descriptors must not leak.
                        libc::close(raw);
                    }
                }
            }
            cmsg = libc::CMSG_NXTHDR(msg, cmsg);
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
