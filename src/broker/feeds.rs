//! The feed table: named pub/sub channels and their subscriber sets.
//!
//! One mutex guards the whole table. Contention is low (control traffic
//! plus occasional fan-out), fan-out to a handful of subscribers is fast,
//! and a single lock trivially preserves the remove-from-all-feeds
//! invariant on disconnect. Feeds are created lazily on first reference
//! and never destroyed while the broker runs.

// Rust guideline compliant 2026-02

use std::os::unix::io::RawFd;
use std::sync::Mutex;

use anyhow::Result;
use serde_json::json;

use crate::constants::MAX_FEED_NAME;
use crate::socket::framing::{send_frame, send_frame_with_fds};

/// True for names the broker accepts: non-empty printable ASCII up to
/// [`MAX_FEED_NAME`] bytes.
pub fn valid_feed_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_FEED_NAME
        && name.bytes().all(|b| (0x21..=0x7E).contains(&b))
}

struct Feed {
    name: String,
    /// Subscriber connections, deduplicated by fd identity.
    subs: Vec<RawFd>,
}

/// Process-wide feed table. All operations are thread-safe.
#[derive(Default)]
pub struct FeedTable {
    inner: Mutex<Vec<Feed>>,
}

impl std::fmt::Debug for FeedTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let feeds = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        f.debug_struct("FeedTable").field("feeds", &feeds.len()).finish()
    }
}

impl FeedTable {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Feed>> {
        // A poisoned table lock means a panic mid-mutation on a Vec of
        // plain values; the data is still structurally sound.
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Index of `name`, creating the feed if missing.
    pub fn ensure(&self, name: &str) -> usize {
        let mut feeds = self.lock();
        if let Some(idx) = feeds.iter().position(|f| f.name == name) {
            return idx;
        }
        feeds.push(Feed {
            name: name.to_owned(),
            subs: Vec::new(),
        });
        log::info!("[feeds] feed created: {name}");
        feeds.len() - 1
    }

    /// Index of `name`, or `None` if it does not exist.
    pub fn find(&self, name: &str) -> Option<usize> {
        self.lock().iter().position(|f| f.name == name)
    }

    /// Number of feeds.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// True when no feed exists.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Subscribe `fd` to `name`, creating the feed if needed. No-op when
    /// already subscribed.
    pub fn subscribe(&self, name: &str, fd: RawFd) {
        let mut feeds = self.lock();
        let idx = match feeds.iter().position(|f| f.name == name) {
            Some(idx) => idx,
            None => {
                feeds.push(Feed {
                    name: name.to_owned(),
                    subs: Vec::new(),
                });
                log::info!("[feeds] feed created: {name}");
                feeds.len() - 1
            }
        };
        if !feeds[idx].subs.contains(&fd) {
            feeds[idx].subs.push(fd);
            log::info!("[feeds] fd={fd} subscribed to {name}");
        }
    }

    /// Remove `fd` from `name`'s subscriber set. No-op when the feed is
    /// unknown or `fd` is not subscribed.
    pub fn unsubscribe(&self, name: &str, fd: RawFd) {
        let mut feeds = self.lock();
        if let Some(feed) = feeds.iter_mut().find(|f| f.name == name) {
            if let Some(pos) = feed.subs.iter().position(|&s| s == fd) {
                feed.subs.remove(pos);
                log::info!("[feeds] fd={fd} unsubscribed from {name}");
            }
        }
    }

    /// Remove `fd` from every feed's subscriber set (disconnect cleanup).
    ///
    /// One lock acquisition covers all feeds, so no publish can interleave
    /// with a half-done removal.
    pub fn unsubscribe_all(&self, fd: RawFd) {
        let mut feeds = self.lock();
        for feed in feeds.iter_mut() {
            feed.subs.retain(|&s| s != fd);
        }
    }

    /// Subscriber count of `name` (0 for unknown feeds).
    pub fn subscriber_count(&self, name: &str) -> usize {
        self.lock()
            .iter()
            .find(|f| f.name == name)
            .map_or(0, |f| f.subs.len())
    }

    /// Emit one `info` frame per feed to `fd` with its subscriber count.
    pub fn list(&self, fd: RawFd) -> Result<()> {
        let feeds = self.lock();
        for feed in feeds.iter() {
            let msg = json!({"type": "info", "feed": feed.name, "subs": feed.subs.len()});
            send_frame(fd, &serde_json::to_vec(&msg)?)?;
        }
        Ok(())
    }

    /// Fan out `frame_bytes` (with any ancillary `fds`) to every subscriber
    /// of `name`.
    ///
    /// Per-subscriber send errors are swallowed: a subscriber that cannot
    /// be written is considered broken and is cleaned up when its read half
    /// fails in the event loop. The table lock is held across the fan-out
    /// so subscribers observe publications in broker processing order.
    pub fn broadcast(&self, name: &str, frame_bytes: &[u8], fds: &[RawFd]) {
        let feeds = self.lock();
        let Some(feed) = feeds.iter().find(|f| f.name == name) else {
            return;
        };
        for &sub in &feed.subs {
            let sent = if fds.is_empty() {
                send_frame(sub, frame_bytes)
            } else {
                send_frame_with_fds(sub, frame_bytes, fds)
            };
            if let Err(e) = sent {
                log::debug!("[feeds] drop send to fd={sub} on {name}: {e:#}");
            }
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
