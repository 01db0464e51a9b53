//! `cli-control` command dispatch — the only place the broker interprets a
//! payload.
//!
//! Commands arrive as `{"type":"command","feed":"cli-control","data":"<line>"}`
//! and replies go back to the requesting connection as `info` frames.
//! Everything else on the wire is opaque to the broker and merely fanned
//! out.

use std::os::unix::io::RawFd;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::json;

use crate::constants::ADDON_SCAN_ROOTS;
use crate::plugin::loader::{scan_addon_paths, LoadOutcome, PluginRegistry};
use crate::socket::framing::send_frame;

use super::feeds::FeedTable;

/// Send an `info` frame to the requesting connection, best-effort.
fn info(fd: RawFd, msg: &serde_json::Value) {
    if let Ok(bytes) = serde_json::to_vec(msg) {
        if let Err(e) = send_frame(fd, &bytes) {
            log::debug!("[broker] drop info reply to fd={fd}: {e:#}");
        }
    }
}

/// Dispatch one `cli-control` command line from the connection `fd`.
pub(crate) fn handle_control_command(
    fd: RawFd,
    cmd: &str,
    feeds: &FeedTable,
    registry: &mut PluginRegistry,
    sock_path: &Path,
    shutdown: &AtomicBool,
) {
    match cmd {
        "help" => {
            info(
                fd,
                &json!({
                    "type": "info",
                    "msg": "commands: help, feeds, load <path>, unload <name>, plugins, available-addons, exit",
                }),
            );
        }

        "feeds" | "list feeds" => {
            if let Err(e) = feeds.list(fd) {
                log::debug!("[broker] feeds listing to fd={fd} failed: {e:#}");
            }
        }

        "plugins" | "list addons" => {
            for (name, path) in registry.entries() {
                info(
                    fd,
                    &json!({"type": "info", "plugin": name, "path": path.to_string_lossy()}),
                );
            }
        }

        "available-addons" => {
            let paths: Vec<String> = scan_addon_paths(ADDON_SCAN_ROOTS)
                .into_iter()
                .map(|p| p.to_string_lossy().into_owned())
                .collect();
            info(fd, &json!({"type": "available-addons", "paths": paths}));
        }

        "exit" => {
            shutdown.store(true, Ordering::SeqCst);
        }

        _ if cmd.starts_with("load ") => {
            let arg = cmd["load ".len()..].trim();
            match registry.load(Path::new(arg), sock_path) {
                Ok(LoadOutcome::Loaded(_)) => {
                    info(fd, &json!({"type": "info", "msg": format!("loaded {arg}")}));
                }
                Ok(LoadOutcome::Skipped(name)) => {
                    info(
                        fd,
                        &json!({"type": "info", "msg": format!("skip {name} (already loaded)")}),
                    );
                }
                Err(e) => {
                    log::error!("[broker] load {arg}: {e:#}");
                    info(fd, &json!({"type": "info", "msg": format!("load failed: {e}")}));
                }
            }
        }

        _ if cmd.starts_with("unload ") => {
            let name = cmd["unload ".len()..].trim();
            match registry.unload(name) {
                Ok(()) => {
                    info(fd, &json!({"type": "info", "msg": format!("unloaded {name}")}));
                }
                Err(e) => {
                    log::warn!("[broker] {e:#}");
                    info(fd, &json!({"type": "info", "msg": format!("{e}")}));
                }
            }
        }

        other => {
            log::warn!("[broker] unknown command: {other}");
            info(
                fd,
                &json!({"type": "info", "msg": format!("unknown command: {other}")}),
            );
        }
    }
}
