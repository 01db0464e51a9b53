//! Application-wide constants for the PhaseHound core.
//!
//! This module centralizes the magic numbers of the wire protocol, the
//! plugin ABI, and the broker event loop so that the contract every module
//! depends on lives in one place.
//!
//! # Categories
//!
//! - **Wire protocol**: frame size caps and ancillary-descriptor limits
//! - **Plugin ABI**: the major/minor version gate
//! - **Broker**: poll cadence, listen backlog, addon scan roots

use std::time::Duration;

// ============================================================================
// Identity
// ============================================================================

/// Crate version, logged in the broker startup banner.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// ============================================================================
// Wire protocol
// ============================================================================

/// Maximum control-frame payload size in bytes.
///
/// A received length prefix at or above this cap is a protocol violation
/// (buffer-overflow defense); the broker refuses the frame and closes the
/// connection. Bulk data never travels in frames — it goes through
/// shared-memory rings — so 64 KiB is generous for control JSON.
pub const MAX_FRAME: usize = 64 * 1024;

/// Maximum number of ancillary file descriptors per frame.
///
/// Matches the fixed capacity of the receive-side SCM_RIGHTS buffer.
pub const MAX_FRAME_FDS: usize = 16;

/// Maximum feed-name length in bytes (ASCII, dot-separated by convention).
pub const MAX_FEED_NAME: usize = 63;

// ============================================================================
// Plugin ABI
// ============================================================================

/// Plugin ABI major version. A module built against a different major is
/// refused outright.
pub const PLUGIN_ABI_MAJOR: u16 = 1;

/// Plugin ABI minor version. A module may require a minor less than or
/// equal to this; a newer minor means the module expects core features we
/// do not have.
pub const PLUGIN_ABI_MINOR: u16 = 0;

// ============================================================================
// Broker
// ============================================================================

/// Readiness-wait timeout for the broker event loop.
///
/// Bounds how long shutdown can lag behind a SIGINT: the run flag is
/// rechecked at least this often.
pub const POLL_TIMEOUT: Duration = Duration::from_millis(200);

/// Per-frame receive timeout once a connection polls readable.
///
/// The length prefix is already in the socket buffer when this applies, so
/// a short window is enough; a peer that stalls mid-frame is broken.
pub const FRAME_TIMEOUT: Duration = Duration::from_millis(10);

/// The broker's own control feed. `command` frames addressed here are
/// interpreted by the broker; everything else is opaque to it.
pub const CLI_CONTROL_FEED: &str = "cli-control";

/// Directories scanned for loadable addon shared objects, in order.
///
/// Each root is walked one level deep; ordering within a root is
/// filesystem order and not guaranteed stable.
pub const ADDON_SCAN_ROOTS: &[&str] = &["./src/addons", "./addons", "./"];

// ============================================================================
// Module conventions
// ============================================================================

/// Default connect-retry attempts for modules reaching the broker.
pub const CONNECT_ATTEMPTS: u32 = 50;

/// Delay between module connect retries.
pub const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Receive timeout used by module control threads so their run flag is
/// rechecked promptly on stop.
pub const CTRL_RECV_TIMEOUT: Duration = Duration::from_millis(250);
