//! Plugin ABI v1.0 — the stable binary contract between the core and
//! dynamically loaded modules.
//!
//! Every addon shared object exports exactly four symbols:
//!
//! ```text
//! plugin_name()                 -> *const c_char
//! plugin_init(ctx, out_caps)    -> bool
//! plugin_start()                -> bool
//! plugin_stop()
//! ```
//!
//! The core fills a [`PluginCtx`] (ABI version, context size, broker socket
//! path, canonical name) and the module fills a [`PluginCaps`] (its own
//! size, identity, produced/consumed feeds, feature bits). Both sides gate
//! on the version and size fields before trusting anything else:
//!
//! - the module verifies `abi_major == PLUGIN_ABI_MAJOR`,
//!   `abi_minor <= PLUGIN_ABI_MINOR`, and `ctx_size >= sizeof(ctx)` as the
//!   first action of `plugin_init` ([`PluginCtx::abi_compatible`]);
//! - the core verifies `caps_size >= sizeof(caps)` after `init` returns
//!   ([`caps_compatible`]) — a smaller value means the module was built
//!   against an older, incompatible core.

// Rust guideline compliant 2026-02

pub mod loader;

use std::os::raw::c_char;

pub use crate::constants::{PLUGIN_ABI_MAJOR, PLUGIN_ABI_MINOR};

// ─── Feature bits ───────────────────────────────────────────────────────────

/// No declared features.
pub const FEAT_NONE: u32 = 0;
/// Produces or consumes I/Q sample streams (e.g. CF32).
pub const FEAT_IQ: u32 = 1 << 0;
/// Produces or consumes PCM audio.
pub const FEAT_PCM: u32 = 1 << 1;
/// Optional viewer/UI capability.
pub const FEAT_UI: u32 = 1 << 2;

// ─── Contract structs ───────────────────────────────────────────────────────

/// Context handed by the core to `plugin_init`.
///
/// The pointers remain valid for the whole lifetime of the loaded module
/// (the loader keeps the backing strings alive until unload), so modules
/// may stash them.
#[repr(C)]
#[derive(Debug)]
pub struct PluginCtx {
    /// Must equal [`PLUGIN_ABI_MAJOR`].
    pub abi_major: u16,
    /// Must be `<=` [`PLUGIN_ABI_MINOR`].
    pub abi_minor: u16,
    /// `size_of::<PluginCtx>()` as seen by the core.
    pub ctx_size: u32,
    /// NUL-terminated broker socket path.
    pub sock_path: *const c_char,
    /// NUL-terminated canonical addon name.
    pub name: *const c_char,
    /// Reserved feature bitset for future use.
    pub core_features: u32,
}

impl PluginCtx {
    /// The module-side ABI gate: call first in `plugin_init` and abort
    /// loading (return `false`) when this fails.
    pub fn abi_compatible(&self) -> bool {
        self.abi_major == PLUGIN_ABI_MAJOR
            && self.abi_minor <= PLUGIN_ABI_MINOR
            && self.ctx_size as usize >= std::mem::size_of::<PluginCtx>()
    }
}

/// Capabilities filled by the module in `plugin_init`.
#[repr(C)]
#[derive(Debug)]
pub struct PluginCaps {
    /// `size_of::<PluginCaps>()` as seen by the module.
    pub caps_size: u32,
    /// Human/log name (may be null; the loader falls back to
    /// `plugin_name()`).
    pub name: *const c_char,
    /// Version string (may be null).
    pub version: *const c_char,
    /// NULL-terminated list of consumed feed names (may be null).
    pub consumes: *const *const c_char,
    /// NULL-terminated list of produced feed names (may be null).
    pub produces: *const *const c_char,
    /// `FEAT_*` bitset.
    pub feat_bits: u32,
}

impl PluginCaps {
    /// All-zero caps, handed to `plugin_init` to fill.
    pub fn zeroed() -> Self {
        Self {
            caps_size: 0,
            name: std::ptr::null(),
            version: std::ptr::null(),
            consumes: std::ptr::null(),
            produces: std::ptr::null(),
            feat_bits: FEAT_NONE,
        }
    }
}

/// The core-side caps gate: a module whose `caps_size` is smaller than the
/// core's struct was built against an incompatible older core.
pub fn caps_compatible(caps: &PluginCaps) -> bool {
    caps.caps_size as usize >= std::mem::size_of::<PluginCaps>()
}

// ─── Entry point signatures ─────────────────────────────────────────────────

/// `plugin_name` — canonical short name, static storage.
pub type PluginNameFn = unsafe extern "C" fn() -> *const c_char;
/// `plugin_init` — ABI gate + caps fill; `false` aborts loading.
pub type PluginInitFn = unsafe extern "C" fn(*const PluginCtx, *mut PluginCaps) -> bool;
/// `plugin_start` — spawn the module's threads; `false` aborts loading.
pub type PluginStartFn = unsafe extern "C" fn() -> bool;
/// `plugin_stop` — signal and join the module's threads before returning.
pub type PluginStopFn = unsafe extern "C" fn();

// ─── Tests ──────────────────────────────────────────────────────────────────
