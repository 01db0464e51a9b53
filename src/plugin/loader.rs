//! Addon discovery, loading, and the process-wide plugin registry.
//!
//! Lifecycle of a module: `discovered → initialized → running → stopped →
//! unloaded`. The registry enforces the only admitted sequence: `init` and
//! `start` happen inside [`PluginRegistry::load`]; `stop` always runs
//! before the dynamic handle is dropped; the handle is dropped exactly
//! once. A module joins its own threads inside `plugin_stop`, so dropping
//! the handle after `stop` returns cannot unmap running code.
//!
//! The registry is mutated only from the broker thread (load/unload arrive
//! as `cli-control` commands), so no lock is needed.

// Rust guideline compliant 2026-02

use std::ffi::{CStr, CString};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use libloading::Library;

use super::{
    caps_compatible, PluginCaps, PluginCtx, PluginInitFn, PluginNameFn, PluginStartFn,
    PluginStopFn, PLUGIN_ABI_MAJOR, PLUGIN_ABI_MINOR,
};

// ─── Discovery ──────────────────────────────────────────────────────────────

/// True when `path` names a readable regular file ending in `.so`.
pub fn is_loadable_addon(path: &Path) -> bool {
    if path.extension().and_then(|e| e.to_str()) != Some("so") {
        return false;
    }
    let Ok(meta) = std::fs::metadata(path) else {
        return false;
    };
    if !meta.is_file() {
        return false;
    }
    let Ok(c_path) = CString::new(path.as_os_str().as_encoded_bytes()) else {
        return false;
    };
    // SAFETY: c_path is a valid NUL-terminated string for the call.
    unsafe { libc::access(c_path.as_ptr(), libc::R_OK) == 0 }
}

/// Collect loadable addon paths under `roots`, each walked one level deep.
///
/// Dotfiles are skipped. Ordering is filesystem order within each root and
/// is not guaranteed stable.
pub fn scan_addon_paths<P: AsRef<Path>>(roots: &[P]) -> Vec<PathBuf> {
    let mut found = Vec::new();
    for root in roots {
        let Ok(entries) = std::fs::read_dir(root.as_ref()) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with('.'))
            {
                continue;
            }
            if path.is_dir() {
                let Ok(inner) = std::fs::read_dir(&path) else {
                    continue;
                };
                for sub in inner.flatten() {
                    let sub_path = sub.path();
                    if sub_path
                        .file_name()
                        .and_then(|n| n.to_str())
                        .is_some_and(|n| n.starts_with('.'))
                    {
                        continue;
                    }
                    if is_loadable_addon(&sub_path) {
                        found.push(sub_path);
                    }
                }
            } else if is_loadable_addon(&path) {
                found.push(path);
            }
        }
    }
    found
}

// ─── Loaded module record ───────────────────────────────────────────────────

/// A running module: resolved entry points plus the live dynamic handle.
pub struct LoadedPlugin {
    name: String,
    path: PathBuf,
    /// Raw `plugin_stop` pointer; valid while `_lib` stays loaded.
    stop: PluginStopFn,
    /// The dynamic handle. Dropped (dlclose) only after `stop` returned.
    _lib: Library,
    /// Backing storage for the ctx pointers handed to `plugin_init`; the
    /// module may hold them for its whole lifetime.
    _sock_path: CString,
    _name: CString,
}

impl std::fmt::Debug for LoadedPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedPlugin")
            .field("name", &self.name)
            .field("path", &self.path)
            .finish()
    }
}

impl LoadedPlugin {
    /// Canonical short name, unique across the registry.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Path the module was loaded from.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Outcome of a load request.
#[derive(Debug, PartialEq, Eq)]
pub enum LoadOutcome {
    /// Module initialized, started, and registered under this name.
    Loaded(String),
    /// A module with this name is already registered; the new handle was
    /// discarded without init.
    Skipped(String),
}

// ─── Registry ───────────────────────────────────────────────────────────────

/// Process-wide table of running modules. Broker-thread only.
#[derive(Debug, Default)]
pub struct PluginRegistry {
    plugins: Vec<LoadedPlugin>,
}

impl PluginRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registered `(name, path)` pairs in load order.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &Path)> {
        self.plugins.iter().map(|p| (p.name(), p.path()))
    }

    /// Number of running modules.
    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    /// True when no module is loaded.
    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    fn find(&self, name: &str) -> Option<usize> {
        self.plugins.iter().position(|p| p.name == name)
    }

    /// Load, initialize, and start the module at `so_path`.
    ///
    /// `sock_path` is handed to the module through [`PluginCtx`] so it can
    /// reach the broker. The full sequence: resolve all four symbols (any
    /// missing refuses the load), `init` with the ABI context, validate
    /// caps, `start`; a `start` failure runs `stop` before the handle is
    /// dropped. A duplicate name is a no-op skip.
    pub fn load(&mut self, so_path: &Path, sock_path: &Path) -> Result<LoadOutcome> {
        if !is_loadable_addon(so_path) {
            bail!(
                "load: provide a readable .so file path (got {})",
                so_path.display()
            );
        }

        // SAFETY: loading foreign code is inherently trusted — the addon
        // directories are under the operator's control (same trust boundary
        // as the broker socket itself).
        let lib = unsafe { Library::new(so_path) }
            .with_context(|| format!("dlopen {}", so_path.display()))?;

        // Resolve the whole ABI up front; a partial export is a bad plugin.
        // SAFETY: symbol types match the exported ABI signatures.
        let (f_name, f_init, f_start, f_stop) = unsafe {
            let f_name = *lib
                .get::<PluginNameFn>(b"plugin_name\0")
                .context("resolve plugin_name")?;
            let f_init = *lib
                .get::<PluginInitFn>(b"plugin_init\0")
                .context("resolve plugin_init")?;
            let f_start = *lib
                .get::<PluginStartFn>(b"plugin_start\0")
                .context("resolve plugin_start")?;
            let f_stop = *lib
                .get::<PluginStopFn>(b"plugin_stop\0")
                .context("resolve plugin_stop")?;
            (f_name, f_init, f_start, f_stop)
        };

        // SAFETY: plugin_name returns a NUL-terminated string in static
        // storage per the ABI.
        let name_ptr = unsafe { f_name() };
        if name_ptr.is_null() {
            bail!("plugin_name returned null in {}", so_path.display());
        }
        // SAFETY: checked non-null; ABI guarantees NUL termination.
        let name = unsafe { CStr::from_ptr(name_ptr) }
            .to_string_lossy()
            .into_owned();

        if self.find(&name).is_some() {
            log::info!("[loader] skip {name} (already loaded)");
            return Ok(LoadOutcome::Skipped(name));
        }

        let sock_c = CString::new(sock_path.as_os_str().as_encoded_bytes())
            .context("socket path contains NUL")?;
        let name_c = CString::new(name.clone()).context("plugin name contains NUL")?;

        let ctx = PluginCtx {
            abi_major: PLUGIN_ABI_MAJOR,
            abi_minor: PLUGIN_ABI_MINOR,
            ctx_size: std::mem::size_of::<PluginCtx>() as u32,
            sock_path: sock_c.as_ptr(),
            name: name_c.as_ptr(),
            core_features: 0,
        };

        let mut caps = PluginCaps::zeroed();
        // SAFETY: ctx and caps are valid for the call; the CString backing
        // buffers outlive the module (stored in LoadedPlugin below).
        if !unsafe { f_init(&ctx, &mut caps) } {
            bail!("plugin {name}: plugin_init failed (ABI gate or internal error)");
        }

        if !caps_compatible(&caps) {
            bail!(
                "plugin {name}: incompatible caps (size={} < core={}); refusing (core ABI {}.{})",
                caps.caps_size,
                std::mem::size_of::<PluginCaps>(),
                PLUGIN_ABI_MAJOR,
                PLUGIN_ABI_MINOR
            );
        }

        let caps_name = cstr_or(caps.name, &name);
        let caps_version = cstr_or(caps.version, "(unknown)");
        log::info!("[loader] caps {caps_name} v{caps_version}");

        // SAFETY: start per the ABI; on failure stop is called so the
        // module joins anything init may have spawned.
        if !unsafe { f_start() } {
            // SAFETY: stop is safe to call after a failed start per the ABI.
            unsafe { f_stop() };
            bail!("plugin {name}: plugin_start failed");
        }

        log::info!("[loader] loaded plugin {name} ({})", so_path.display());
        self.plugins.push(LoadedPlugin {
            name: name.clone(),
            path: so_path.to_path_buf(),
            stop: f_stop,
            _lib: lib,
            _sock_path: sock_c,
            _name: name_c,
        });
        Ok(LoadOutcome::Loaded(name))
    }

    /// Stop and unload the module registered under `name`.
    ///
    /// `plugin_stop` joins the module's threads before returning; only then
    /// is the dynamic handle dropped. Unknown names are an error (so a
    /// second `unload` of the same name reports "not found").
    pub fn unload(&mut self, name: &str) -> Result<()> {
        let Some(idx) = self.find(name) else {
            bail!("unload: {name} not found");
        };
        let plugin = self.plugins.remove(idx);
        // SAFETY: the handle is still loaded; stop joins module threads.
        unsafe { (plugin.stop)() };
        log::info!(
            "[loader] unloaded plugin {} (from {})",
            plugin.name,
            plugin.path.display()
        );
        // Dropping `plugin` closes the dynamic handle — after stop returned.
        Ok(())
    }

    /// Stop every module in reverse load order and drop the handles.
    ///
    /// Used at broker shutdown.
    pub fn stop_all(&mut self) {
        while let Some(plugin) = self.plugins.pop() {
            log::info!("[loader] stopping plugin {}", plugin.name);
            // SAFETY: as in unload: stop before the handle drops.
            unsafe { (plugin.stop)() };
        }
    }
}

/// Borrowed C string with a fallback for null pointers.
fn cstr_or<'a>(ptr: *const std::os::raw::c_char, fallback: &'a str) -> std::borrow::Cow<'a, str> {
    if ptr.is_null() {
        return std::borrow::Cow::Borrowed(fallback);
    }
    // SAFETY: checked non-null; the ABI guarantees NUL termination.
    unsafe { CStr::from_ptr(ptr) }.to_string_lossy()
}

// ─── Tests ──────────────────────────────────────────────────────────────────
