//! The PhaseHound message broker — accept, demux, dispatch.
//!
//! # Architecture
//!
//! ```text
//! module A ──publish {feed,data}──► broker ──fan-out──► subscribers of feed
//! module B ──subscribe feed──────►   │
//! cli      ──command cli-control──►  │ load/unload/introspect (plugins)
//!
//! bulk data: producer ──publish shm_map + SCM_RIGHTS fd──► broker ──► consumers
//!            (the broker relays the descriptor and closes its own copy)
//! ```
//!
//! A single thread owns the listener and every client connection and
//! multiplexes them with `poll` (200 ms timeout so the run flag stays
//! responsive). One frame is processed per ready connection per loop
//! iteration; fan-out happens under the feed-table lock, so subscribers
//! observe publications in broker processing order.
//!
//! # Descriptor discipline
//!
//! Every ancillary descriptor received with a frame is owned by the broker
//! exactly once: forwarding duplicates it into each subscriber's socket
//! queue (kernel-side), after which the broker's copy is closed — and a
//! descriptor that is not forwarded is closed immediately. Either way,
//! nothing leaks and nothing double-closes.
//!
//! # Failure model
//!
//! Errors never propagate across the event loop: a malformed or oversized
//! frame costs that connection only, and every other client continues
//! undisturbed. Only listener creation is fatal.

// Rust guideline compliant 2026-02

pub mod commands;
pub mod feeds;

#[cfg(test)]
mod integration_tests;

use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::Value;

use crate::constants::{
    ADDON_SCAN_ROOTS, CLI_CONTROL_FEED, FRAME_TIMEOUT, MAX_FRAME, POLL_TIMEOUT, VERSION,
};
use crate::ctrl::{json_str, json_type};
use crate::plugin::loader::{scan_addon_paths, PluginRegistry};
use crate::socket::framing::{recv_frame, send_frame, Frame, RecvOutcome};

use feeds::{valid_feed_name, FeedTable};

/// Broker configuration, fixed for the life of the process.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Listening socket path.
    pub socket_path: PathBuf,
    /// Scan the addon roots and load every readable `.so` before entering
    /// the event loop.
    pub autoload: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            socket_path: crate::socket::default_socket_path(),
            autoload: true,
        }
    }
}

/// Run the broker until `shutdown` is raised (SIGINT, `exit` command).
///
/// Fatal only when the listener cannot be created; everything after that
/// is per-connection. On the way out: plugins are stopped in reverse load
/// order, the listener is closed, and the socket path is unlinked.
pub fn run(cfg: &BrokerConfig, shutdown: &Arc<AtomicBool>) -> Result<()> {
    let listener = crate::socket::listen(&cfg.socket_path)?;
    listener
        .set_nonblocking(true)
        .context("set listener non-blocking")?;

    log::info!(
        "[broker] PhaseHound-core {VERSION} listening on {}",
        cfg.socket_path.display()
    );

    let feeds = FeedTable::new();
    feeds.ensure(CLI_CONTROL_FEED);

    let mut registry = PluginRegistry::new();
    if cfg.autoload {
        autoload_addons(&mut registry, cfg);
    }

    let mut clients: Vec<UnixStream> = Vec::new();

    while !shutdown.load(Ordering::SeqCst) {
        // Rebuilt each iteration: the client set is small and mutates on
        // accept/disconnect.
        let mut pollfds: Vec<libc::pollfd> = Vec::with_capacity(1 + clients.len());
        pollfds.push(libc::pollfd {
            fd: listener.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        });
        for client in &clients {
            pollfds.push(libc::pollfd {
                fd: client.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            });
        }

        // SAFETY: pollfds is a valid array for the duration of the call.
        let rc = unsafe {
            libc::poll(
                pollfds.as_mut_ptr(),
                pollfds.len() as libc::nfds_t,
                POLL_TIMEOUT.as_millis() as i32,
            )
        };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            log::error!("[broker] poll: {err}");
            break;
        }
        if rc == 0 {
            continue;
        }

        // Listener readable → accept everything pending.
        if pollfds[0].revents & libc::POLLIN != 0 {
            loop {
                match listener.accept() {
                    Ok((stream, _)) => {
                        if let Err(e) = stream.set_nonblocking(true) {
                            log::warn!("[broker] set_nonblocking on new client: {e}");
                            continue;
                        }
                        log::info!("[broker] client connected fd={}", stream.as_raw_fd());
                        clients.push(stream);
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(e) => {
                        log::warn!("[broker] accept: {e}");
                        break;
                    }
                }
            }
        }

        // One frame per ready client. Broken connections collect for
        // removal after the sweep so pollfd indices stay aligned.
        let mut broken: Vec<usize> = Vec::new();
        for (i, client) in clients.iter().enumerate() {
            let revents = pollfds[1 + i].revents;
            if revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR | libc::POLLNVAL) == 0 {
                continue;
            }
            let fd = client.as_raw_fd();
            match recv_frame(fd, MAX_FRAME, Some(FRAME_TIMEOUT)) {
                Ok(RecvOutcome::Frame(frame)) => {
                    handle_message(fd, &frame, &feeds, &mut registry, cfg, shutdown);
                    // `frame` drops here: every received descriptor the
                    // broker did not forward — and its own copies of those
                    // it did — is closed now.
                }
                Ok(RecvOutcome::NoFrame) => {} // spurious wakeup
                Ok(RecvOutcome::Disconnected) => {
                    log::info!("[broker] client fd={fd} disconnected");
                    broken.push(i);
                }
                Err(e) => {
                    log::warn!("[broker] client fd={fd} broken: {e:#}");
                    broken.push(i);
                }
            }
        }
        for &i in broken.iter().rev() {
            let stream = clients.remove(i);
            feeds.unsubscribe_all(stream.as_raw_fd());
            // Drop closes the socket.
        }
    }

    log::info!("[broker] core shutting down...");
    registry.stop_all();
    drop(listener);
    let _ = std::fs::remove_file(&cfg.socket_path);
    Ok(())
}

/// Scan the fixed addon roots and load everything readable.
fn autoload_addons(registry: &mut PluginRegistry, cfg: &BrokerConfig) {
    for path in scan_addon_paths(ADDON_SCAN_ROOTS) {
        if let Err(e) = registry.load(&path, &cfg.socket_path) {
            log::warn!("[broker] autoload {}: {e:#}", path.display());
        }
    }
}

/// Dispatch one received frame by its `type` discriminator.
///
/// Unknown types are logged and ignored (forward compatibility); a missing
/// type field is logged and dropped. Neither costs the connection.
fn handle_message(
    fd: RawFd,
    frame: &Frame,
    feeds: &FeedTable,
    registry: &mut PluginRegistry,
    cfg: &BrokerConfig,
    shutdown: &Arc<AtomicBool>,
) {
    let Ok(value) = serde_json::from_slice::<Value>(&frame.payload) else {
        log::warn!("[broker] bad message from fd={fd}: not JSON");
        return;
    };
    let Some(kind) = json_type(&value) else {
        log::warn!("[broker] bad message from fd={fd}: no type field");
        return;
    };

    match kind {
        "create_feed" => {
            if let Some(name) = checked_feed(&value, fd) {
                feeds.ensure(name);
            }
        }

        "subscribe" => {
            if let Some(name) = checked_feed(&value, fd) {
                feeds.subscribe(name, fd);
            }
        }

        "unsubscribe" => {
            if let Some(name) = checked_feed(&value, fd) {
                feeds.unsubscribe(name, fd);
            }
        }

        "publish" => {
            if let Some(name) = checked_feed(&value, fd) {
                broadcast_frame(feeds, name, frame);
            }
        }

        "command" => {
            let Some(name) = checked_feed(&value, fd) else {
                return;
            };
            if name == CLI_CONTROL_FEED {
                let Some(cmd) = json_str(&value, "data") else {
                    return;
                };
                commands::handle_control_command(
                    fd,
                    cmd,
                    feeds,
                    registry,
                    &cfg.socket_path,
                    shutdown,
                );
            } else {
                // To the broker a command is a publish with intent; fan it
                // out to whoever owns the feed.
                broadcast_frame(feeds, name, frame);
            }
        }

        "ping" => {
            if let Err(e) = send_frame(fd, br#"{"type":"pong"}"#) {
                log::debug!("[broker] pong to fd={fd} failed: {e:#}");
            }
        }

        other => {
            log::debug!("[broker] ignoring frame type '{other}' from fd={fd}");
        }
    }
}

/// Extract and validate the `feed` field of a message.
fn checked_feed<'a>(value: &'a Value, fd: RawFd) -> Option<&'a str> {
    let Some(name) = json_str(value, "feed") else {
        log::warn!("[broker] message from fd={fd} has no feed field");
        return None;
    };
    if !valid_feed_name(name) {
        log::warn!("[broker] message from fd={fd} has invalid feed name");
        return None;
    }
    Some(name)
}

/// Forward the entire original frame — bytes and descriptors — to every
/// subscriber of `name`.
fn broadcast_frame(feeds: &FeedTable, name: &str, frame: &Frame) {
    let raw_fds: Vec<RawFd> = frame.fds.iter().map(AsRawFd::as_raw_fd).collect();
    feeds.broadcast(name, &frame.payload, &raw_fds);
}
