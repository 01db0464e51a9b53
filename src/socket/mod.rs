//! Unix domain socket endpoints for the broker and its modules.
//!
//! The broker listens on a well-known per-uid path; every module connects
//! to the same path and speaks length-prefixed JSON frames over it.
//!
//! ```text
//! Broker Process                         Module (in-process .so thread)
//! ┌──────────────────┐                  ┌──────────────────┐
//! │ UnixListener     │◄────────────────►│ UnixStream       │
//! │ poll-driven loop │  frames, some    │ CtrlContext      │
//! │ feed fan-out     │  carrying fds    │ control loop     │
//! └──────────────────┘                  └──────────────────┘
//! ```
//!
//! See [`framing`] for the wire format.

pub mod framing;

use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};

/// Maximum path length for a Unix domain socket (macOS kernel limit; Linux
/// allows 108 — use the conservative bound).
const MAX_SOCK_PATH: usize = 104;

/// Default broker socket path: `/tmp/phasehound-{uid}/core.sock`.
///
/// Scoped per uid so unprivileged users on a shared host cannot collide or
/// connect to each other's brokers (the directory is created 0700).
pub fn default_socket_path() -> PathBuf {
    // SAFETY: getuid cannot fail.
    let uid = unsafe { libc::getuid() };
    PathBuf::from(format!("/tmp/phasehound-{uid}/core.sock"))
}

/// Validate a socket path against the `sun_path` length limit.
pub fn validate_socket_path(path: &Path) -> Result<()> {
    let len = path.as_os_str().len();
    if len >= MAX_SOCK_PATH {
        anyhow::bail!(
            "socket path too long ({len} bytes, max {}): {}",
            MAX_SOCK_PATH - 1,
            path.display()
        );
    }
    Ok(())
}

/// Create the broker listening socket at `path`.
///
/// Removes any stale socket file, creates the parent directory (0700),
/// binds, and restricts the socket file to 0600. The listener is created
/// with the platform's standard 128-deep backlog.
///
/// # Errors
///
/// Returns an error if the path is too long or the bind fails — the broker
/// treats this as fatal (exit non-zero).
pub fn listen(path: &Path) -> Result<UnixListener> {
    validate_socket_path(path)?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create socket dir: {}", parent.display()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700));
        }
    }

    // Remove a stale socket file from a previous run.
    let _ = std::fs::remove_file(path);

    let listener = UnixListener::bind(path)
        .with_context(|| format!("bind broker socket: {}", path.display()))?;

    // Owner-only permissions (0600).
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600));
    }

    Ok(listener)
}

/// Connect to the broker socket at `path`.
pub fn connect(path: &Path) -> Result<UnixStream> {
    UnixStream::connect(path)
        .with_context(|| format!("connect to broker socket: {}", path.display()))
}

/// Connect with bounded retries.
///
/// Modules start before the broker has necessarily bound its socket; retry
/// at `delay` intervals up to `attempts` times before giving up. The last
/// attempt's error is the one reported.
pub fn connect_retry(path: &Path, attempts: u32, delay: Duration) -> Result<UnixStream> {
    let attempts = attempts.max(1);
    for _ in 0..attempts - 1 {
        if let Ok(stream) = UnixStream::connect(path) {
            return Ok(stream);
        }
        std::thread::sleep(delay);
    }
    UnixStream::connect(path).with_context(|| {
        format!(
            "connect to broker after {attempts} attempts: {}",
            path.display()
        )
    })
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_path_is_per_uid_under_tmp() {
        let path = default_socket_path();
        let s = path.to_string_lossy();
        assert!(s.starts_with("/tmp/phasehound-"), "got: {s}");
        assert!(s.ends_with("core.sock"), "got: {s}");
        validate_socket_path(&path).expect("default path must be valid");
    }

    #[test]
    fn test_overlong_path_rejected() {
        let long = PathBuf::from(format!("/tmp/{}.sock", "x".repeat(200)));
        assert!(validate_socket_path(&long).is_err());
    }

    #[test]
    fn test_listen_creates_and_rebinding_replaces_stale_socket() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("core.sock");

        let first = listen(&path).expect("first bind");
        drop(first);
        // The socket file is still on disk; a second bind must replace it.
        assert!(path.exists(), "socket file should persist after listener drop");
        let _second = listen(&path).expect("rebind over stale socket");
        assert!(path.exists());
    }

    #[test]
    fn test_connect_retry_reaches_late_listener() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("late.sock");

        let bind_path = path.clone();
        let binder = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(150));
            listen(&bind_path).expect("late bind")
        });

        let stream = connect_retry(&path, 20, Duration::from_millis(50));
        assert!(stream.is_ok(), "retry must outlast the bind delay");
        let _listener = binder.join().expect("binder thread");
    }

    #[test]
    fn test_connect_retry_gives_up() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("absent.sock");
        let err = connect_retry(&path, 2, Duration::from_millis(10));
        assert!(err.is_err());
    }
}
