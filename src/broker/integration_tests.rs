//! End-to-end broker tests.
//!
//! Unlike the unit tests in `feeds.rs` and `framing.rs` — which exercise
//! components against socketpairs — this module runs the **real**
//! [`crate::broker::run`] entry point in a background thread and drives it
//! through actual client connections on a scratch socket path:
//!
//! ```text
//! client A ──subscribe foo──► broker loop ◄──publish foo── client B
//!        ◄──────────── fan-out (bytes + descriptors) ──────────┘
//! ```
//!
//! Every test ends by sending `command cli-control "exit"` so the broker
//! unwinds its shutdown path (plugin stop, listener close, socket unlink)
//! rather than being killed.

use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use crate::broker::{run, BrokerConfig};
use crate::constants::MAX_FRAME;
use crate::shm::blob::ShmBlob;
use crate::socket::framing::{recv_frame, send_frame, Frame, RecvOutcome};

/// Poll for the broker socket file to appear, up to `timeout`.
///
/// The broker thread needs a moment to bind after `run()` is entered;
/// polling at 20 ms intervals avoids a fixed sleep that would make timing
/// fragile on loaded machines.
fn wait_for_socket(path: &Path, timeout: Duration) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    loop {
        if path.exists() {
            return true;
        }
        if std::time::Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
}

/// A running broker on a scratch socket plus the handles to stop it.
struct TestBroker {
    socket_path: PathBuf,
    shutdown_flag: Arc<AtomicBool>,
    thread: Option<std::thread::JoinHandle<()>>,
    _dir: tempfile::TempDir,
}

impl TestBroker {
    /// Spawn `run()` in a background thread on a tempdir socket.
    fn start() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let socket_path = dir.path().join("core.sock");
        let shutdown_flag = Arc::new(AtomicBool::new(false));

        let cfg = BrokerConfig {
            socket_path: socket_path.clone(),
            autoload: false, // tests control loading explicitly
        };
        let flag = Arc::clone(&shutdown_flag);
        let thread = std::thread::spawn(move || {
            run(&cfg, &flag).expect("broker run must not error");
        });

        assert!(
            wait_for_socket(&socket_path, Duration::from_secs(2)),
            "broker socket did not appear within 2 s — broker thread likely panicked"
        );

        Self {
            socket_path,
            shutdown_flag,
            thread: Some(thread),
            _dir: dir,
        }
    }

    fn client(&self) -> TestClient {
        TestClient {
            stream: UnixStream::connect(&self.socket_path).expect("connect to test broker"),
        }
    }

    /// Stop via the `exit` verb and join, asserting the socket is unlinked.
    fn shutdown(mut self) {
        let client = self.client();
        client.send(&json!({"type": "command", "feed": "cli-control", "data": "exit"}));
        let thread = self.thread.take().expect("broker thread present");
        thread.join().expect("broker thread must exit cleanly");
        assert!(
            !self.socket_path.exists(),
            "socket file must be unlinked on clean shutdown"
        );
    }
}

impl Drop for TestBroker {
    fn drop(&mut self) {
        // Safety net for panicking tests: raise the flag so the broker
        // thread exits within one poll timeout.
        self.shutdown_flag
            .store(true, std::sync::atomic::Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// One connected client with frame-level helpers.
struct TestClient {
    stream: UnixStream,
}

impl TestClient {
    fn send(&self, msg: &Value) {
        let bytes = serde_json::to_vec(msg).expect("encode");
        send_frame(self.stream.as_raw_fd(), &bytes).expect("send frame");
    }

    fn recv(&self, timeout: Duration) -> Option<Frame> {
        match recv_frame(self.stream.as_raw_fd(), MAX_FRAME, Some(timeout)).expect("recv frame") {
            RecvOutcome::Frame(f) => Some(f),
            RecvOutcome::NoFrame => None,
            RecvOutcome::Disconnected => panic!("broker closed the connection unexpectedly"),
        }
    }

    fn recv_json(&self, timeout: Duration) -> Option<Value> {
        self.recv(timeout)
            .map(|f| serde_json::from_slice(&f.payload).expect("frame payload is JSON"))
    }

    /// Receive until `pred` matches or the deadline passes.
    fn recv_until(&self, timeout: Duration, pred: impl Fn(&Value) -> bool) -> Option<Value> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            let left = deadline.saturating_duration_since(std::time::Instant::now());
            if left.is_zero() {
                return None;
            }
            match self.recv_json(left) {
                Some(v) if pred(&v) => return Some(v),
                Some(_) => continue,
                None => return None,
            }
        }
    }
}

// ─── Pub/sub ────────────────────────────────────────────────────────────────

/// A subscribes, B publishes: A gets exactly the published frame, B gets
/// nothing.
#[test]
fn test_pubsub_fanout_reaches_subscriber_only() {
    let broker = TestBroker::start();

    // ── 1. A creates and subscribes ──────────────────────────────────────
    let a = broker.client();
    a.send(&json!({"type": "create_feed", "feed": "dummy.foo"}));
    a.send(&json!({"type": "subscribe", "feed": "dummy.foo"}));

    // Round-trip a ping so the subscribe is definitely processed before B
    // publishes (the broker handles one frame per client per iteration).
    a.send(&json!({"type": "ping"}));
    let pong = a.recv_json(Duration::from_secs(2)).expect("pong");
    assert_eq!(pong["type"], "pong");

    // ── 2. B publishes ───────────────────────────────────────────────────
    let b = broker.client();
    b.send(&json!({"type": "publish", "feed": "dummy.foo", "data": {"x": 1}}));

    // ── 3. A receives the frame verbatim ─────────────────────────────────
    let got = a.recv_json(Duration::from_secs(2)).expect("A must receive the publish");
    assert_eq!(got["type"], "publish");
    assert_eq!(got["feed"], "dummy.foo");
    assert_eq!(got["data"]["x"], 1);

    // ── 4. B (non-subscriber) receives nothing ───────────────────────────
    assert!(
        b.recv(Duration::from_millis(200)).is_none(),
        "publisher is not a subscriber and must not see its own frame"
    );

    broker.shutdown();
}

/// Subscribers see publications in the order the broker processed them.
#[test]
fn test_publish_order_preserved() {
    let broker = TestBroker::start();

    let sub = broker.client();
    sub.send(&json!({"type": "subscribe", "feed": "seq.feed"}));
    sub.send(&json!({"type": "ping"}));
    assert_eq!(sub.recv_json(Duration::from_secs(2)).expect("pong")["type"], "pong");

    let publisher = broker.client();
    for i in 0..5 {
        publisher.send(&json!({"type": "publish", "feed": "seq.feed", "data": {"n": i}}));
    }

    for i in 0..5 {
        let got = sub.recv_json(Duration::from_secs(2)).expect("ordered frame");
        assert_eq!(got["data"]["n"], i, "publication order must be preserved");
    }

    broker.shutdown();
}

/// The broker-side `unsubscribe` verb works symmetrically to `subscribe`.
#[test]
fn test_unsubscribe_stops_delivery() {
    let broker = TestBroker::start();

    let a = broker.client();
    a.send(&json!({"type": "subscribe", "feed": "toggle.feed"}));
    a.send(&json!({"type": "unsubscribe", "feed": "toggle.feed"}));
    a.send(&json!({"type": "ping"}));
    assert_eq!(a.recv_json(Duration::from_secs(2)).expect("pong")["type"], "pong");

    let b = broker.client();
    b.send(&json!({"type": "publish", "feed": "toggle.feed", "data": {"x": 1}}));

    assert!(
        a.recv(Duration::from_millis(200)).is_none(),
        "after unsubscribe no frames may be delivered"
    );

    broker.shutdown();
}

/// `command` frames to a module feed fan out exactly like `publish`.
#[test]
fn test_command_to_module_feed_fans_out() {
    let broker = TestBroker::start();

    let module = broker.client();
    module.send(&json!({"type": "subscribe", "feed": "dummy.config.in"}));
    module.send(&json!({"type": "ping"}));
    assert_eq!(module.recv_json(Duration::from_secs(2)).expect("pong")["type"], "pong");

    let cli = broker.client();
    cli.send(&json!({"type": "command", "feed": "dummy.config.in", "data": "status"}));

    let got = module
        .recv_json(Duration::from_secs(2))
        .expect("module must receive the command frame");
    assert_eq!(got["type"], "command");
    assert_eq!(got["feed"], "dummy.config.in");
    assert_eq!(got["data"], "status");

    broker.shutdown();
}

// ─── Disconnect cleanup ─────────────────────────────────────────────────────

/// After a subscriber drops, publishes proceed without stale handles and
/// the feed listing reports zero subscribers.
#[test]
fn test_disconnect_removes_subscriber_everywhere() {
    let broker = TestBroker::start();

    // ── 1. Subscribe on two feeds, then disconnect ───────────────────────
    let doomed = broker.client();
    doomed.send(&json!({"type": "subscribe", "feed": "feed.one"}));
    doomed.send(&json!({"type": "subscribe", "feed": "feed.two"}));
    doomed.send(&json!({"type": "ping"}));
    assert_eq!(doomed.recv_json(Duration::from_secs(2)).expect("pong")["type"], "pong");
    drop(doomed);

    // ── 2. Give the loop a poll cycle to reap the EOF ────────────────────
    std::thread::sleep(Duration::from_millis(300));

    // ── 3. Publishing must not disturb the broker or other clients ───────
    let b = broker.client();
    b.send(&json!({"type": "publish", "feed": "feed.one", "data": {"x": 1}}));
    b.send(&json!({"type": "ping"}));
    assert_eq!(
        b.recv_json(Duration::from_secs(2)).expect("broker alive")["type"],
        "pong"
    );

    // ── 4. The listing shows no stale subscriber ─────────────────────────
    b.send(&json!({"type": "command", "feed": "cli-control", "data": "feeds"}));
    let mut counts = std::collections::HashMap::new();
    while let Some(v) = b.recv_json(Duration::from_millis(400)) {
        if v["type"] == "info" {
            if let (Some(feed), Some(subs)) = (v["feed"].as_str(), v["subs"].as_u64()) {
                counts.insert(feed.to_owned(), subs);
            }
        }
    }
    assert_eq!(counts.get("feed.one"), Some(&0), "stale handle must be gone");
    assert_eq!(counts.get("feed.two"), Some(&0));

    broker.shutdown();
}

// ─── FD relay ───────────────────────────────────────────────────────────────

/// A sealed 1 MiB region filled with `i & 0xFF` travels to a subscriber as
/// an ancillary descriptor; the subscriber maps it and reads the pattern
/// back.
#[test]
fn test_fd_relay_shared_memory_pattern() {
    let broker = TestBroker::start();

    // ── 1. Consumer subscribes ───────────────────────────────────────────
    let consumer = broker.client();
    consumer.send(&json!({"type": "subscribe", "feed": "dummy.foo"}));
    consumer.send(&json!({"type": "ping"}));
    assert_eq!(
        consumer.recv_json(Duration::from_secs(2)).expect("pong")["type"],
        "pong"
    );

    // ── 2. Producer builds the 1 MiB pattern blob ────────────────────────
    let cap = 1 << 20;
    let pattern: Vec<u8> = (0..cap).map(|i| (i & 0xFF) as u8).collect();
    let mut blob = ShmBlob::create("dummy", cap).expect("create blob");
    blob.publish(&pattern).expect("publish pattern");

    // ── 3. Producer publishes the descriptor map frame ───────────────────
    let producer = broker.client();
    let msg = json!({
        "type": "publish",
        "feed": "dummy.foo",
        "subtype": "shm_map",
        "proto": "phasehound.shm.v0",
        "version": "0.1",
        "size": cap,
        "mode": "r",
    });
    crate::socket::framing::send_frame_with_fds(
        producer.stream.as_raw_fd(),
        &serde_json::to_vec(&msg).expect("encode"),
        &[blob.raw_fd()],
    )
    .expect("send shm_map");

    // ── 4. Consumer gets exactly one descriptor with the full region ─────
    let frame = consumer.recv(Duration::from_secs(2)).expect("shm_map frame");
    let value: Value = serde_json::from_slice(&frame.payload).expect("json");
    assert_eq!(value["subtype"], "shm_map");
    assert_eq!(frame.fds.len(), 1, "exactly one ancillary descriptor");

    let fd = frame.fds.into_iter().next().expect("fd");
    let size = crate::shm::region_size(fd.as_raw_fd()).expect("fstat");
    assert!(
        size >= cap as u64,
        "region must hold header + 1 MiB, fstat says {size}"
    );

    // ── 5. Map and verify the pattern byte for byte ──────────────────────
    let attached = ShmBlob::attach(fd).expect("attach relayed blob");
    let data = attached.read();
    assert_eq!(data.len(), cap);
    assert!(
        data.iter().enumerate().all(|(i, &b)| b == (i & 0xFF) as u8),
        "byte at offset i must equal i & 0xFF"
    );

    broker.shutdown();
}

// ─── Malformed frame isolation ──────────────────────────────────────────────

/// A length prefix past the cap costs that connection only; other clients
/// keep exchanging traffic.
#[test]
fn test_malformed_frame_closes_only_offender() {
    use std::io::Write;

    let broker = TestBroker::start();

    let healthy = broker.client();
    healthy.send(&json!({"type": "subscribe", "feed": "alive.feed"}));
    healthy.send(&json!({"type": "ping"}));
    assert_eq!(
        healthy.recv_json(Duration::from_secs(2)).expect("pong")["type"],
        "pong"
    );

    // ── 1. Offender announces an impossible frame ────────────────────────
    let mut offender = broker.client();
    let bogus = ((MAX_FRAME + 1) as u32).to_be_bytes();
    offender.stream.write_all(&bogus).expect("write bogus length");

    // ── 2. The broker closes the offender… ───────────────────────────────
    offender
        .stream
        .set_read_timeout(Some(Duration::from_secs(2)))
        .expect("timeout");
    let mut buf = [0u8; 16];
    let eof = std::io::Read::read(&mut offender.stream, &mut buf);
    assert!(
        matches!(eof, Ok(0)),
        "offending connection must be closed, got {eof:?}"
    );

    // ── 3. …and everyone else continues undisturbed ──────────────────────
    let b = broker.client();
    b.send(&json!({"type": "publish", "feed": "alive.feed", "data": {"ok": true}}));
    let got = healthy
        .recv_json(Duration::from_secs(2))
        .expect("traffic must continue after the offender is dropped");
    assert_eq!(got["data"]["ok"], Value::Bool(true));

    broker.shutdown();
}

// ─── Broker commands ────────────────────────────────────────────────────────

#[test]
fn test_help_and_unknown_command_replies() {
    let broker = TestBroker::start();
    let cli = broker.client();

    cli.send(&json!({"type": "command", "feed": "cli-control", "data": "help"}));
    let help = cli.recv_json(Duration::from_secs(2)).expect("help reply");
    assert_eq!(help["type"], "info");
    assert!(
        help["msg"].as_str().expect("msg").contains("load <path>"),
        "help must list the verbs: {help}"
    );

    cli.send(&json!({"type": "command", "feed": "cli-control", "data": "frobnicate"}));
    let unknown = cli.recv_json(Duration::from_secs(2)).expect("unknown reply");
    assert!(
        unknown["msg"].as_str().expect("msg").contains("unknown command"),
        "got: {unknown}"
    );

    broker.shutdown();
}

#[test]
fn test_plugin_verbs_on_empty_registry() {
    let broker = TestBroker::start();
    let cli = broker.client();

    // No plugins loaded: `plugins` emits nothing.
    cli.send(&json!({"type": "command", "feed": "cli-control", "data": "plugins"}));
    assert!(
        cli.recv(Duration::from_millis(300)).is_none(),
        "empty registry lists nothing"
    );

    // `load` of a non-.so path is refused with a reply.
    cli.send(&json!({"type": "command", "feed": "cli-control", "data": "load /etc/hostname"}));
    let refused = cli
        .recv_until(Duration::from_secs(2), |v| {
            v["msg"].as_str().is_some_and(|m| m.contains("load failed"))
        })
        .expect("load refusal reply");
    assert_eq!(refused["type"], "info");

    // `unload` of an unknown name reports not found — twice in a row.
    for _ in 0..2 {
        cli.send(&json!({"type": "command", "feed": "cli-control", "data": "unload dummy"}));
        let reply = cli
            .recv_until(Duration::from_secs(2), |v| {
                v["msg"].as_str().is_some_and(|m| m.contains("not found"))
            })
            .expect("unload reply");
        assert_eq!(reply["type"], "info");
    }

    broker.shutdown();
}

#[test]
fn test_available_addons_reply_shape() {
    let broker = TestBroker::start();
    let cli = broker.client();

    cli.send(&json!({"type": "command", "feed": "cli-control", "data": "available-addons"}));
    let reply = cli.recv_json(Duration::from_secs(2)).expect("reply");
    assert_eq!(reply["type"], "available-addons");
    assert!(reply["paths"].is_array(), "paths must be a JSON array: {reply}");

    broker.shutdown();
}

// ─── Shutdown ───────────────────────────────────────────────────────────────

/// The `exit` verb unwinds the loop and the socket file disappears
/// (TestBroker::shutdown asserts the unlink).
#[test]
fn test_exit_command_unlinks_socket() {
    let broker = TestBroker::start();
    let path = broker.socket_path.clone();
    assert!(path.exists());
    broker.shutdown();
    assert!(!path.exists());
}

/// Raising the shutdown flag externally (the SIGINT path — the signal
/// handler just stores `true`) stops the loop within the poll timeout.
#[test]
fn test_shutdown_flag_stops_loop_like_sigint() {
    let broker = TestBroker::start();
    let path = broker.socket_path.clone();

    broker
        .shutdown_flag
        .store(true, std::sync::atomic::Ordering::SeqCst);
    // One poll timeout (200 ms) plus slack.
    std::thread::sleep(Duration::from_millis(600));
    assert!(!path.exists(), "socket must be unlinked after the flag is raised");
}
