//! `dummy` — the reference diagnostic addon.
//!
//! Exercises every core contract from the module side: the plugin ABI, the
//! control-plane convention (`dummy.config.in` / `dummy.config.out`),
//! pub/sub probing on `dummy.foo`, role-keyed subscription slots, and the
//! shared-memory publication idiom (`shm-demo` creates a sealed 1 MiB
//! blob, fills the `i & 0xFF` pattern, and relays the descriptor through
//! the broker).
//!
//! Command verbs on `dummy.config.in`:
//!
//! ```text
//! help | ping | foo [text] | subscribe <usage> <feed> | unsubscribe <usage> | shm-demo
//! ```

// Rust guideline compliant 2026-02

use std::os::raw::c_char;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde_json::json;

use phasehound::constants::{CONNECT_ATTEMPTS, CONNECT_RETRY_DELAY, CTRL_RECV_TIMEOUT};
use phasehound::ctrl::{subs, CtrlContext};
use phasehound::plugin::{PluginCaps, PluginCtx, FEAT_NONE};
use phasehound::shm::blob::ShmBlob;
use phasehound::RecvOutcome;

/// The data feed this addon produces alongside its control feeds.
const FOO_FEED: &str = "dummy.foo";

/// Maximum concurrent role-keyed subscriptions.
const MAX_SUBS: usize = 4;

// ─── Addon state ────────────────────────────────────────────────────────────

/// Worker run flag: `plugin_stop` clears it and joins.
static RUN: AtomicBool = AtomicBool::new(false);
/// Control-thread handle, joined in `plugin_stop`.
static THREAD: Mutex<Option<std::thread::JoinHandle<()>>> = Mutex::new(None);
/// Broker socket path stashed from the init context.
static SOCK_PATH: Mutex<Option<PathBuf>> = Mutex::new(None);

/// NULL-terminated feed-name array handed out through [`PluginCaps`].
struct FeedList<const N: usize>([*const c_char; N]);
// SAFETY: the pointers reference static C string literals; sharing them
// across threads is sound.
unsafe impl<const N: usize> Sync for FeedList<N> {}

static CONSUMES: FeedList<2> = FeedList([c"dummy.config.in".as_ptr(), std::ptr::null()]);
static PRODUCES: FeedList<3> = FeedList([
    c"dummy.config.out".as_ptr(),
    c"dummy.foo".as_ptr(),
    std::ptr::null(),
]);

// ─── Plugin ABI exports ─────────────────────────────────────────────────────

/// Canonical addon name (static storage).
#[no_mangle]
pub extern "C" fn plugin_name() -> *const c_char {
    c"dummy".as_ptr()
}

/// ABI gate + caps fill. Returning `false` aborts the load.
///
/// # Safety
///
/// `ctx` and `out_caps` must be valid per the plugin ABI (the core passes
/// pointers to live, properly sized structs).
#[no_mangle]
pub unsafe extern "C" fn plugin_init(ctx: *const PluginCtx, out_caps: *mut PluginCaps) -> bool {
    // SAFETY: the core passes a valid ctx pointer per the ABI.
    let Some(ctx) = (unsafe { ctx.as_ref() }) else {
        return false;
    };
    // ABI gate is the first action; a mismatched core never gets further.
    if !ctx.abi_compatible() {
        return false;
    }
    if ctx.sock_path.is_null() {
        return false;
    }
    // SAFETY: checked non-null; the core keeps the string alive until unload.
    let sock = unsafe { std::ffi::CStr::from_ptr(ctx.sock_path) };
    let sock = PathBuf::from(sock.to_string_lossy().into_owned());
    *SOCK_PATH.lock().unwrap_or_else(PoisonError::into_inner) = Some(sock);

    // SAFETY: the core passes a valid caps pointer per the ABI.
    if let Some(caps) = unsafe { out_caps.as_mut() } {
        caps.caps_size = std::mem::size_of::<PluginCaps>() as u32;
        caps.name = plugin_name();
        caps.version = c"0.4.1".as_ptr();
        caps.consumes = CONSUMES.0.as_ptr();
        caps.produces = PRODUCES.0.as_ptr();
        caps.feat_bits = FEAT_NONE;
    }
    true
}

/// Spawn the control thread.
#[no_mangle]
pub extern "C" fn plugin_start() -> bool {
    let _ = env_logger::try_init();
    let Some(sock) = SOCK_PATH
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
    else {
        return false;
    };
    RUN.store(true, Ordering::SeqCst);
    match std::thread::Builder::new()
        .name("dummy-ctrl".to_owned())
        .spawn(move || worker(sock))
    {
        Ok(handle) => {
            *THREAD.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
            true
        }
        Err(e) => {
            log::error!("[dummy] spawn control thread: {e}");
            RUN.store(false, Ordering::SeqCst);
            false
        }
    }
}

/// Signal the control thread and join it before returning.
#[no_mangle]
pub extern "C" fn plugin_stop() {
    RUN.store(false, Ordering::SeqCst);
    if let Some(handle) = THREAD
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take()
    {
        let _ = handle.join();
    }
}

// ─── Control thread ─────────────────────────────────────────────────────────

/// Role-keyed subscription slot.
#[derive(Debug, Clone, Default)]
struct SubSlot {
    usage: String,
    feed: String,
}

fn worker(sock: PathBuf) {
    let ctx = match CtrlContext::connect("dummy", &sock, CONNECT_ATTEMPTS, CONNECT_RETRY_DELAY) {
        Ok(ctx) => ctx,
        Err(e) => {
            log::error!("[dummy] broker unreachable: {e:#}");
            return;
        }
    };
    if let Err(e) = ctx.create_feed(FOO_FEED) {
        log::warn!("[dummy] create {FOO_FEED}: {e:#}");
    }

    let mut slots: Vec<SubSlot> = vec![SubSlot::default(); MAX_SUBS];

    while RUN.load(Ordering::SeqCst) {
        match ctx.recv(CTRL_RECV_TIMEOUT) {
            Ok(RecvOutcome::Frame(frame)) => {
                let consumed = ctx.dispatch(&frame.payload, |c, line| {
                    if let Err(e) = handle_command(c, line, &mut slots) {
                        log::warn!("[dummy] command '{line}': {e:#}");
                    }
                });
                if !consumed {
                    // Data frames from subscribed feeds land here; the
                    // diagnostic addon just notes them.
                    log::debug!("[dummy] non-command frame ({} bytes)", frame.payload.len());
                }
            }
            Ok(RecvOutcome::NoFrame) => {} // timeout: recheck the run flag
            Ok(RecvOutcome::Disconnected) => {
                log::info!("[dummy] broker closed the connection");
                break;
            }
            Err(e) => {
                log::warn!("[dummy] recv: {e:#}");
                break;
            }
        }
    }
}

fn handle_command(ctx: &CtrlContext, line: &str, slots: &mut [SubSlot]) -> Result<()> {
    let line = line.trim_start();

    if line.starts_with("help") {
        return ctx.reply(json!({
            "ok": true,
            "help": "help|ping|foo [text]|subscribe <usage> <feed>|unsubscribe <usage>|shm-demo",
        }));
    }

    if line.starts_with("ping") {
        return ctx.reply_ok("pong");
    }

    if subs::handle_subscribe_cmd(ctx, line, |usage, feed| bind_slot(ctx, slots, usage, feed))? {
        return Ok(());
    }
    if subs::handle_unsubscribe_cmd(ctx, line, |usage| unbind_slot(ctx, slots, usage))? {
        return Ok(());
    }

    if let Some(arg) = line.strip_prefix("foo") {
        let arg = arg.trim();
        let arg = if arg.is_empty() { "bar" } else { arg };
        ctx.publish_txt(FOO_FEED, arg)?;
        return ctx.reply_ok(&format!("foo => published \"{arg}\" to {FOO_FEED}"));
    }

    if line.starts_with("shm-demo") {
        return shm_demo(ctx);
    }

    ctx.reply_err("unknown")
}

/// Bind `usage` to `feed`: rebind replaces (unsubscribing the old feed),
/// otherwise the first free slot is taken.
fn bind_slot(ctx: &CtrlContext, slots: &mut [SubSlot], usage: &str, feed: &str) -> Result<()> {
    let rebind = slots.iter().position(|s| s.usage == usage);
    let slot = rebind.or_else(|| slots.iter().position(|s| s.usage.is_empty()));
    let Some(idx) = slot else {
        bail!("too many subscriptions");
    };
    if !slots[idx].feed.is_empty() {
        ctx.unsubscribe(&slots[idx].feed)?;
    }
    slots[idx].usage = usage.to_owned();
    slots[idx].feed = feed.to_owned();
    ctx.subscribe(feed)?;
    Ok(())
}

fn unbind_slot(ctx: &CtrlContext, slots: &mut [SubSlot], usage: &str) -> Result<()> {
    let Some(slot) = slots.iter_mut().find(|s| s.usage == usage) else {
        bail!("unknown usage");
    };
    if !slot.feed.is_empty() {
        ctx.unsubscribe(&slot.feed)?;
    }
    slot.usage.clear();
    slot.feed.clear();
    Ok(())
}

/// The shared-memory demo: sealed 1 MiB blob, `i & 0xFF` fill, descriptor
/// relayed on `dummy.foo`, then a few `shm_ready` sequence notifications.
fn shm_demo(ctx: &CtrlContext) -> Result<()> {
    const CAP: usize = 1 << 20;

    let mut blob = ShmBlob::create("dummy", CAP).context("create demo blob")?;
    let pattern: Vec<u8> = (0..CAP).map(|i| (i & 0xFF) as u8).collect();
    blob.publish(&pattern).context("fill demo blob")?;

    ctx.publish_blob_map(FOO_FEED, &blob, "rw", "dummy 1MiB buffer")?;

    for _ in 0..3 {
        if !RUN.load(Ordering::SeqCst) {
            break;
        }
        std::thread::sleep(Duration::from_millis(200));
        let seq = blob.publish(&pattern).context("republish demo blob")?;
        ctx.publish_frame(&json!({
            "type": "publish",
            "feed": FOO_FEED,
            "subtype": "shm_ready",
            "seq": seq,
            "bytes": blob.used(),
        }))?;
    }

    ctx.reply_ok("shm demo sent")
    // blob drops here: consumers keep their own descriptors and mappings.
}

// ─── Tests ──────────────────────────────────────────────────────────────────
