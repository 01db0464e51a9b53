//! Control-plane convention — how every module talks to the broker.
//!
//! A module owns a pair of control feeds derived from its canonical name:
//! `<name>.config.in` (commands to the module) and `<name>.config.out`
//! (replies from the module). On startup it connects to the broker with
//! bounded retries, advertises both feeds, and subscribes to its input:
//!
//! ```text
//! module ──create_feed <name>.config.in ──► broker
//!        ──create_feed <name>.config.out──►
//!        ──subscribe   <name>.config.in ──►
//!
//! cli    ──command {feed:"<name>.config.in", data:"status"}──► broker ──► module
//! module ──publish {feed:"<name>.config.out", data:{"ok":true,...}}──► subscribers
//! ```
//!
//! Reply shapes: `{"ok":true,"msg":...}` success, `{"ok":false,"err":...}`
//! error, `{"ok":true, ...domain fields...}` structured responses.
//!
//! The [`CtrlContext::dispatch`] helper hands a received frame to the
//! module's command callback iff `type ∈ {command, publish}` and the feed
//! is the module's own `config.in`; every other frame is left for the
//! module (e.g. bulk-data announcements carrying ring descriptors).

// Rust guideline compliant 2026-02

pub mod subs;

use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::{json, Value};

use crate::constants::MAX_FRAME;
use crate::shm::blob::ShmBlob;
use crate::shm::ring::{RingKind, StreamRing};
use crate::socket::framing::{self, RecvOutcome};
use crate::socket::connect_retry;

// ─── JSON field helpers ─────────────────────────────────────────────────────

/// String field of a JSON object, if present.
pub fn json_str<'a>(v: &'a Value, key: &str) -> Option<&'a str> {
    v.get(key).and_then(Value::as_str)
}

/// The `type` discriminator of a wire message.
pub fn json_type(v: &Value) -> Option<&str> {
    json_str(v, "type")
}

// ─── Control context ────────────────────────────────────────────────────────

/// Per-module control-plane state: the broker connection plus the module's
/// feed names.
#[derive(Debug)]
pub struct CtrlContext {
    stream: UnixStream,
    name: String,
    feed_in: String,
    feed_out: String,
}

impl CtrlContext {
    /// Wrap an existing broker connection for module `name`.
    ///
    /// Does not advertise; call [`CtrlContext::advertise`] once after this.
    pub fn new(stream: UnixStream, name: &str) -> Self {
        Self {
            stream,
            name: name.to_owned(),
            feed_in: format!("{name}.config.in"),
            feed_out: format!("{name}.config.out"),
        }
    }

    /// Connect to the broker with bounded retries, then advertise.
    ///
    /// The standard module startup: connect, create both config feeds,
    /// subscribe to `config.in`.
    pub fn connect(
        name: &str,
        sock_path: &Path,
        attempts: u32,
        delay: Duration,
    ) -> Result<Self> {
        let stream = connect_retry(sock_path, attempts, delay)
            .with_context(|| format!("module {name}: connect to broker"))?;
        let ctx = Self::new(stream, name);
        ctx.advertise()?;
        Ok(ctx)
    }

    /// Create both config feeds and subscribe to `config.in`.
    pub fn advertise(&self) -> Result<()> {
        self.create_feed(&self.feed_in)?;
        self.create_feed(&self.feed_out)?;
        self.subscribe(&self.feed_in)?;
        Ok(())
    }

    /// Module canonical name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// `<name>.config.in`.
    pub fn feed_in(&self) -> &str {
        &self.feed_in
    }

    /// `<name>.config.out`.
    pub fn feed_out(&self) -> &str {
        &self.feed_out
    }

    /// Raw socket descriptor (for poll integration).
    pub fn raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    // ── Emitters ──────────────────────────────────────────────────────────

    fn send(&self, msg: &Value) -> Result<()> {
        let bytes = serde_json::to_vec(msg).context("encode control message")?;
        framing::send_frame(self.stream.as_raw_fd(), &bytes)
    }

    /// Idempotent feed creation.
    pub fn create_feed(&self, feed: &str) -> Result<()> {
        self.send(&json!({"type": "create_feed", "feed": feed}))
    }

    /// Subscribe this connection to `feed`.
    pub fn subscribe(&self, feed: &str) -> Result<()> {
        self.send(&json!({"type": "subscribe", "feed": feed}))
    }

    /// Unsubscribe this connection from `feed`.
    pub fn unsubscribe(&self, feed: &str) -> Result<()> {
        self.send(&json!({"type": "unsubscribe", "feed": feed}))
    }

    /// Publish a JSON payload on `feed`.
    pub fn publish(&self, feed: &str, data: Value) -> Result<()> {
        self.send(&json!({"type": "publish", "feed": feed, "data": data}))
    }

    /// Publish a text payload on `feed` as `{"txt": ...}`.
    pub fn publish_txt(&self, feed: &str, txt: &str) -> Result<()> {
        self.publish(feed, json!({ "txt": txt }))
    }

    /// Send a command line to the module owning `feed`.
    pub fn command(&self, feed: &str, cmdline: &str) -> Result<()> {
        self.send(&json!({"type": "command", "feed": feed, "data": cmdline}))
    }

    /// Send a complete wire object as one frame.
    ///
    /// For messages whose fields live at the top level of the frame (e.g.
    /// `shm_ready` notifications); the caller supplies `type` and `feed`.
    pub fn publish_frame(&self, msg: &Value) -> Result<()> {
        self.send(msg)
    }

    // ── Replies (to config.out) ───────────────────────────────────────────

    /// Publish a structured reply object on `config.out`.
    pub fn reply(&self, obj: Value) -> Result<()> {
        self.send(&json!({"type": "publish", "feed": self.feed_out, "data": obj}))
    }

    /// `{"ok":true,"msg":...}`.
    pub fn reply_ok(&self, msg: &str) -> Result<()> {
        self.reply(json!({"ok": true, "msg": msg}))
    }

    /// `{"ok":false,"err":...}`.
    pub fn reply_err(&self, msg: &str) -> Result<()> {
        self.reply(json!({"ok": false, "err": msg}))
    }

    // ── Receive & dispatch ────────────────────────────────────────────────

    /// Receive one frame with a timeout (see
    /// [`framing::recv_frame`] for the outcome contract).
    pub fn recv(&self, timeout: Duration) -> Result<RecvOutcome> {
        framing::recv_frame(self.stream.as_raw_fd(), MAX_FRAME, Some(timeout))
    }

    /// Dispatch one received payload.
    ///
    /// Invokes `on_cmd` with the command line iff the frame is a
    /// `command`/`publish` addressed to this module's `config.in`. Returns
    /// `true` when consumed; any other frame (unparseable JSON included) is
    /// left for the caller.
    pub fn dispatch(&self, payload: &[u8], on_cmd: impl FnOnce(&Self, &str)) -> bool {
        let Ok(value) = serde_json::from_slice::<Value>(payload) else {
            return false;
        };
        let Some(kind) = json_type(&value) else {
            return false;
        };
        if kind != "command" && kind != "publish" {
            return false;
        }
        if json_str(&value, "feed") != Some(self.feed_in.as_str()) {
            return false;
        }
        let data = json_str(&value, "data").unwrap_or_default();
        on_cmd(self, data);
        true
    }

    // ── Ring publication idiom ────────────────────────────────────────────

    /// Announce a streaming ring on `feed`: a `publish` frame with subtype
    /// `shm_map`, the stream metadata, and the ring descriptor attached as
    /// ancillary data.
    pub fn publish_ring_map(
        &self,
        feed: &str,
        ring: &StreamRing,
        mode: &str,
        desc: &str,
    ) -> Result<()> {
        let (proto, kind) = match ring.kind() {
            RingKind::Iq => ("phasehound.iq-ring.v0", "iq"),
            RingKind::Audio => ("phasehound.audio-ring.v0", "audio"),
        };
        let msg = json!({
            "type": "publish",
            "feed": feed,
            "subtype": "shm_map",
            "proto": proto,
            "version": "0.1",
            "size": ring.capacity(),
            "mode": mode,
            "kind": kind,
            "encoding": ring.format().encoding_name(),
            "sample_rate": ring.sample_rate(),
            "channels": ring.channels(),
            "center_freq": ring.center_freq(),
            "desc": desc,
        });
        let bytes = serde_json::to_vec(&msg).context("encode shm_map frame")?;
        framing::send_frame_with_fds(self.stream.as_raw_fd(), &bytes, &[ring.raw_fd()])
    }

    /// Announce a v0 blob on `feed` (same idiom, blob proto tag).
    pub fn publish_blob_map(
        &self,
        feed: &str,
        blob: &ShmBlob,
        mode: &str,
        desc: &str,
    ) -> Result<()> {
        let msg = json!({
            "type": "publish",
            "feed": feed,
            "subtype": "shm_map",
            "proto": "phasehound.shm.v0",
            "version": "0.1",
            "size": blob.capacity(),
            "mode": mode,
            "desc": desc,
        });
        let bytes = serde_json::to_vec(&msg).context("encode shm_map frame")?;
        framing::send_frame_with_fds(self.stream.as_raw_fd(), &bytes, &[blob.raw_fd()])
    }
}

/// Parsed `shm_map` announcement (the JSON side; the descriptor arrives as
/// ancillary data on the same frame).
#[derive(Debug, Clone, PartialEq)]
pub struct ShmMapInfo {
    /// Protocol tag, e.g. `phasehound.iq-ring.v0`.
    pub proto: String,
    /// Payload capacity in bytes as declared by the producer.
    pub size: u64,
    /// `r` or `rw`.
    pub mode: String,
    /// `iq` / `audio` for rings; absent for blobs.
    pub kind: Option<String>,
    /// Sample encoding name (`cf32`, `f32`, ...), rings only.
    pub encoding: Option<String>,
    /// Stream sample rate in Hz, rings only.
    pub sample_rate: Option<f64>,
    /// Channel count, rings only.
    pub channels: Option<u64>,
    /// Center frequency in Hz, IQ rings only.
    pub center_freq: Option<f64>,
}

impl ShmMapInfo {
    /// Parse a received frame payload as an `shm_map` announcement.
    ///
    /// Returns `None` for anything that is not a `publish` with subtype
    /// `shm_map` (callers fall through to their other frame handling).
    pub fn parse(value: &Value) -> Option<Self> {
        if json_type(value) != Some("publish") {
            return None;
        }
        if json_str(value, "subtype") != Some("shm_map") {
            return None;
        }
        Some(Self {
            proto: json_str(value, "proto")?.to_owned(),
            size: value.get("size").and_then(Value::as_u64)?,
            mode: json_str(value, "mode").unwrap_or("r").to_owned(),
            kind: json_str(value, "kind").map(str::to_owned),
            encoding: json_str(value, "encoding").map(str::to_owned),
            sample_rate: value.get("sample_rate").and_then(Value::as_f64),
            channels: value.get("channels").and_then(Value::as_u64),
            center_freq: value.get("center_freq").and_then(Value::as_f64),
        })
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::framing::recv_frame;

    fn ctx_pair(name: &str) -> (CtrlContext, UnixStream) {
        let (ours, theirs) = UnixStream::pair().expect("socketpair");
        (CtrlContext::new(ours, name), theirs)
    }

    fn recv_json(peer: &UnixStream) -> Value {
        match recv_frame(peer.as_raw_fd(), MAX_FRAME, Some(Duration::from_secs(1)))
            .expect("recv")
        {
            RecvOutcome::Frame(f) => serde_json::from_slice(&f.payload).expect("json"),
            other => panic!("expected frame, got {other:?}"),
        }
    }

    #[test]
    fn test_feed_names_derive_from_module_name() {
        let (ctx, _peer) = ctx_pair("wfmd");
        assert_eq!(ctx.name(), "wfmd");
        assert_eq!(ctx.feed_in(), "wfmd.config.in");
        assert_eq!(ctx.feed_out(), "wfmd.config.out");
    }

    #[test]
    fn test_advertise_emits_create_create_subscribe() {
        let (ctx, peer) = ctx_pair("dummy");
        ctx.advertise().expect("advertise");

        let m1 = recv_json(&peer);
        assert_eq!(json_type(&m1), Some("create_feed"));
        assert_eq!(json_str(&m1, "feed"), Some("dummy.config.in"));

        let m2 = recv_json(&peer);
        assert_eq!(json_type(&m2), Some("create_feed"));
        assert_eq!(json_str(&m2, "feed"), Some("dummy.config.out"));

        let m3 = recv_json(&peer);
        assert_eq!(json_type(&m3), Some("subscribe"));
        assert_eq!(json_str(&m3, "feed"), Some("dummy.config.in"));
    }

    #[test]
    fn test_reply_shapes() {
        let (ctx, peer) = ctx_pair("dummy");
        ctx.reply_ok("done").expect("ok");
        ctx.reply_err("nope").expect("err");

        let ok = recv_json(&peer);
        assert_eq!(json_type(&ok), Some("publish"));
        assert_eq!(json_str(&ok, "feed"), Some("dummy.config.out"));
        assert_eq!(ok["data"]["ok"], Value::Bool(true));
        assert_eq!(ok["data"]["msg"], "done");

        let err = recv_json(&peer);
        assert_eq!(err["data"]["ok"], Value::Bool(false));
        assert_eq!(err["data"]["err"], "nope");
    }

    #[test]
    fn test_command_shape() {
        let (ctx, peer) = ctx_pair("cli");
        ctx.command("wfmd.config.in", "status").expect("command");
        let msg = recv_json(&peer);
        assert_eq!(json_type(&msg), Some("command"));
        assert_eq!(json_str(&msg, "feed"), Some("wfmd.config.in"));
        assert_eq!(json_str(&msg, "data"), Some("status"));
    }

    #[test]
    fn test_publish_txt_wraps_payload() {
        let (ctx, peer) = ctx_pair("dummy");
        ctx.publish_txt("dummy.foo", "hello \"quoted\"").expect("publish");
        let msg = recv_json(&peer);
        assert_eq!(json_str(&msg, "feed"), Some("dummy.foo"));
        assert_eq!(msg["data"]["txt"], "hello \"quoted\"");
    }

    #[test]
    fn test_dispatch_accepts_command_and_publish_on_own_feed() {
        let (ctx, _peer) = ctx_pair("dummy");
        for kind in ["command", "publish"] {
            let frame = json!({"type": kind, "feed": "dummy.config.in", "data": "status"});
            let mut seen = None;
            let consumed = ctx.dispatch(
                &serde_json::to_vec(&frame).expect("encode"),
                |_, line| seen = Some(line.to_owned()),
            );
            assert!(consumed, "{kind} frame on own feed must be consumed");
            assert_eq!(seen.as_deref(), Some("status"));
        }
    }

    #[test]
    fn test_dispatch_leaves_foreign_frames() {
        let (ctx, _peer) = ctx_pair("dummy");
        let cases = [
            json!({"type": "command", "feed": "other.config.in", "data": "x"}),
            json!({"type": "info", "feed": "dummy.config.in"}),
            json!({"no_type": true}),
        ];
        for frame in cases {
            let consumed = ctx.dispatch(
                &serde_json::to_vec(&frame).expect("encode"),
                |_, _| panic!("callback must not run"),
            );
            assert!(!consumed, "frame must be left for the module: {frame}");
        }
        // Non-JSON payloads are left alone too.
        assert!(!ctx.dispatch(b"not json", |_, _| panic!("no")));
    }

    #[test]
    fn test_dispatch_missing_data_yields_empty_line() {
        let (ctx, _peer) = ctx_pair("dummy");
        let frame = json!({"type": "command", "feed": "dummy.config.in"});
        let mut seen = None;
        ctx.dispatch(&serde_json::to_vec(&frame).expect("encode"), |_, line| {
            seen = Some(line.to_owned());
        });
        assert_eq!(seen.as_deref(), Some(""));
    }

    #[test]
    fn test_ring_map_round_trip() {
        use crate::shm::ring::{OverflowPolicy, RingConfig, SampleFormat};

        let (ctx, peer) = ctx_pair("soapy");
        let ring = StreamRing::create(
            "iq",
            &RingConfig {
                kind: RingKind::Iq,
                format: SampleFormat::Cf32,
                channels: 1,
                sample_rate: 2_400_000.0,
                center_freq: 100_000_000.0,
                capacity: 1 << 16,
                policy: OverflowPolicy::OverwriteOldest,
            },
        )
        .expect("ring");
        ctx.publish_ring_map("soapy.IQ-info", &ring, "r", "test ring")
            .expect("publish map");

        let frame = match recv_frame(peer.as_raw_fd(), MAX_FRAME, Some(Duration::from_secs(1)))
            .expect("recv")
        {
            RecvOutcome::Frame(f) => f,
            other => panic!("expected frame, got {other:?}"),
        };
        assert_eq!(frame.fds.len(), 1, "ring descriptor must ride along");

        let value: Value = serde_json::from_slice(&frame.payload).expect("json");
        let info = ShmMapInfo::parse(&value).expect("shm_map parses");
        assert_eq!(info.proto, "phasehound.iq-ring.v0");
        assert_eq!(info.size, 1 << 16);
        assert_eq!(info.mode, "r");
        assert_eq!(info.kind.as_deref(), Some("iq"));
        assert_eq!(info.encoding.as_deref(), Some("cf32"));
        assert_eq!(info.channels, Some(1));

        // The received descriptor maps back to the same ring.
        let fd = frame.fds.into_iter().next().expect("fd");
        let attached = StreamRing::attach(fd).expect("attach");
        assert_eq!(attached.capacity(), 1 << 16);
        assert_eq!(attached.kind(), RingKind::Iq);
    }

    #[test]
    fn test_shm_map_parse_rejects_other_frames() {
        assert!(ShmMapInfo::parse(&json!({"type":"publish","feed":"x"})).is_none());
        assert!(ShmMapInfo::parse(&json!({"type":"command","subtype":"shm_map"})).is_none());
    }
}
