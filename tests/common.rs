//! Shared helpers for fabrpc integration tests.
//!
//! Each test endpoint gets its own Nexus on a unique loopback port, so
//! client and server can run in one process and be driven alternately
//! from the test thread.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use fabrpc::{
    LoopbackTransport, Nexus, Rpc, Session, SessionState, SmErrType, SmEventType,
};

/// Ports handed out to test Nexuses, one at a time.
static NEXT_PORT: AtomicU16 = AtomicU16::new(43100);

/// A fresh loopback management URI.
pub fn alloc_uri() -> String {
    format!("127.0.0.1:{}", NEXT_PORT.fetch_add(1, Ordering::Relaxed))
}

/// Install the test log subscriber (idempotent).
pub fn init_logging() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Application context recording every session management event.
#[derive(Default)]
pub struct EventLog {
    pub events: Vec<(SmEventType, SmErrType, SessionState)>,
}

/// Session management handler used by all test endpoints.
pub fn record_event(session: &mut Session, event: SmEventType, err: SmErrType, log: &mut EventLog) {
    log.events.push((event, err, session.state));
}

/// The Rpc type the tests drive.
pub type TestRpc = Rpc<LoopbackTransport, EventLog>;

/// One endpoint: a Nexus plus one Rpc registered on it.
pub struct TestEndpoint {
    pub uri: String,
    pub nexus: Arc<Nexus>,
    pub rpc: TestRpc,
}

/// Endpoint on a fresh port with an unbounded loopback transport.
pub fn endpoint(app_tid: u8) -> TestEndpoint {
    endpoint_with(app_tid, LoopbackTransport::new(), 0.0)
}

/// Endpoint on a fresh port with the given transport and sender-side drop
/// probability.
pub fn endpoint_with(app_tid: u8, transport: LoopbackTransport, drop_prob: f64) -> TestEndpoint {
    endpoint_at(&alloc_uri(), app_tid, transport, drop_prob)
}

/// Endpoint on a caller-chosen URI.
pub fn endpoint_at(
    uri: &str,
    app_tid: u8,
    transport: LoopbackTransport,
    drop_prob: f64,
) -> TestEndpoint {
    let nexus = Arc::new(Nexus::with_drop_prob(uri, drop_prob).expect("failed to start nexus"));
    let rpc = Rpc::new(
        Arc::clone(&nexus),
        EventLog::default(),
        app_tid,
        record_event,
        transport,
        &[0],
    )
    .expect("failed to create rpc");
    TestEndpoint {
        uri: uri.to_string(),
        nexus,
        rpc,
    }
}

/// Drive both event loops until `done` holds or `timeout_ms` of wall time
/// elapses. Returns whether `done` was reached.
pub fn drive_until(
    a: &mut TestRpc,
    b: &mut TestRpc,
    timeout_ms: u64,
    mut done: impl FnMut(&TestRpc, &TestRpc) -> bool,
) -> bool {
    let start = Instant::now();
    while start.elapsed() < Duration::from_millis(timeout_ms) {
        a.run_event_loop_once();
        b.run_event_loop_once();
        if done(a, b) {
            return true;
        }
        std::thread::sleep(Duration::from_micros(200));
    }
    false
}
