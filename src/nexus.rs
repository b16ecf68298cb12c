//! Per-process rendezvous point for session management.
//!
//! The Nexus owns the management UDP socket. A background thread reads
//! fixed-size session management packets and routes each one to the Rpc
//! named by its destination app TID, through that Rpc's [`SmHook`]. Rpcs
//! drain their hook cooperatively from their event loop; the Nexus never
//! runs application code.

use std::collections::HashMap;
use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::UdpConfig;
use crate::error::{Error, Result};
use crate::sm::{SmPkt, SM_PKT_SIZE};
use crate::timing::measure_freq_ghz;
use crate::udp::resolve_uri;

/// Handoff structure between the Nexus receiver thread (producer) and one
/// Rpc (consumer).
///
/// The packet list is guarded by a mutex whose critical sections are
/// short: append one packet, or swap the whole list out. The counter is
/// readable without the mutex so the event loop can skip the lock when
/// nothing is pending.
pub struct SmHook {
    app_tid: u8,
    ev_counter: AtomicUsize,
    pkt_list: Mutex<Vec<SmPkt>>,
}

impl SmHook {
    /// A hook for the Rpc with the given app TID.
    pub fn new(app_tid: u8) -> Self {
        Self {
            app_tid,
            ev_counter: AtomicUsize::new(0),
            pkt_list: Mutex::new(Vec::new()),
        }
    }

    /// The app TID this hook belongs to.
    #[inline]
    pub fn app_tid(&self) -> u8 {
        self.app_tid
    }

    /// Number of packets waiting to be drained. Lock-free fast check.
    #[inline]
    pub fn pending(&self) -> usize {
        self.ev_counter.load(Ordering::Acquire)
    }

    /// Producer side: append one packet.
    pub fn push(&self, pkt: SmPkt) {
        let mut list = self.pkt_list.lock().unwrap();
        list.push(pkt);
        self.ev_counter.fetch_add(1, Ordering::Release);
    }

    /// Consumer side: move all pending packets into `out`, reusing its
    /// allocation. `out` is cleared first.
    pub fn drain_into(&self, out: &mut Vec<SmPkt>) {
        out.clear();
        let mut list = self.pkt_list.lock().unwrap();
        std::mem::swap(&mut *list, out);
        self.ev_counter.fetch_sub(out.len(), Ordering::Release);
    }
}

type HookMap = Mutex<HashMap<u8, Arc<SmHook>>>;

/// Per-process rendezvous point.
///
/// Create one Nexus per process, then one [`Rpc`](crate::rpc::Rpc) per
/// thread against it. The Nexus also measures the cycle-counter frequency
/// once, which Rpcs use to convert management timestamps to wall time.
pub struct Nexus {
    local_uri: String,
    freq_ghz: f64,
    udp_config: UdpConfig,
    hooks: Arc<HookMap>,
    stop: Arc<AtomicBool>,
    recv_thread: Option<JoinHandle<()>>,
}

impl Nexus {
    /// Start a Nexus listening on `local_uri` (`host:port`).
    pub fn new(local_uri: &str) -> Result<Self> {
        Self::with_drop_prob(local_uri, 0.0)
    }

    /// Start a Nexus with sender-side datagram drop injection enabled for
    /// all Rpcs created against it.
    pub fn with_drop_prob(local_uri: &str, drop_prob: f64) -> Result<Self> {
        let local_uri = local_uri.trim().to_string();
        let addr = resolve_uri(&local_uri)?;
        let udp_config = UdpConfig::new(addr.port()).with_drop_prob(drop_prob);

        let socket = UdpSocket::bind(addr)?;
        socket.set_read_timeout(Some(Duration::from_millis(50)))?;

        let hooks: Arc<HookMap> = Arc::new(Mutex::new(HashMap::new()));
        let stop = Arc::new(AtomicBool::new(false));

        let thread_hooks = Arc::clone(&hooks);
        let thread_stop = Arc::clone(&stop);
        let recv_thread = std::thread::Builder::new()
            .name("fabrpc-nexus".to_string())
            .spawn(move || sm_receiver_loop(socket, thread_hooks, thread_stop))?;

        debug!(uri = %local_uri, "nexus listening");

        Ok(Self {
            local_uri,
            freq_ghz: measure_freq_ghz(),
            udp_config,
            hooks,
            stop,
            recv_thread: Some(recv_thread),
        })
    }

    /// The management URI this Nexus listens on.
    #[inline]
    pub fn local_uri(&self) -> &str {
        &self.local_uri
    }

    /// Measured cycle-counter frequency, for cycle→time conversion.
    #[inline]
    pub fn freq_ghz(&self) -> f64 {
        self.freq_ghz
    }

    /// Control-channel configuration.
    #[inline]
    pub fn udp_config(&self) -> &UdpConfig {
        &self.udp_config
    }

    /// Attach an Rpc's hook under its app TID. Fails if the TID is
    /// already bound.
    pub fn register_hook(&self, hook: Arc<SmHook>) -> Result<()> {
        let mut hooks = self.hooks.lock().unwrap();
        let tid = hook.app_tid();
        if hooks.contains_key(&tid) {
            return Err(Error::HookAlreadyRegistered(tid));
        }
        debug!(app_tid = tid, "hook registered");
        hooks.insert(tid, hook);
        Ok(())
    }

    /// Detach the hook for an app TID. Packets for that TID are dropped
    /// from now on.
    pub fn deregister_hook(&self, app_tid: u8) {
        let mut hooks = self.hooks.lock().unwrap();
        if hooks.remove(&app_tid).is_some() {
            debug!(app_tid, "hook deregistered");
        }
    }
}

impl Drop for Nexus {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.recv_thread.take() {
            let _ = handle.join();
        }
    }
}

/// Background receiver: read datagrams, decode, route to hooks.
fn sm_receiver_loop(socket: UdpSocket, hooks: Arc<HookMap>, stop: Arc<AtomicBool>) {
    let mut buf = [0u8; SM_PKT_SIZE + 64];

    while !stop.load(Ordering::Acquire) {
        let n = match socket.recv_from(&mut buf) {
            Ok((n, _)) => n,
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(e) => {
                warn!(error = %e, "management socket receive failed");
                continue;
            }
        };

        let pkt = match SmPkt::from_bytes(&buf[..n]) {
            Ok(pkt) => pkt,
            Err(e) => {
                warn!(error = %e, bytes = n, "discarding malformed management packet");
                continue;
            }
        };

        let dest_tid = pkt.dest_app_tid();
        let hooks = hooks.lock().unwrap();
        match hooks.get(&dest_tid) {
            Some(hook) => hook.push(pkt),
            None => {
                warn!(
                    app_tid = dest_tid,
                    pkt_type = ?pkt.pkt_type,
                    "discarding management packet for unregistered app TID"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sm::{SessionMetadata, SmErrType, SmPktType};
    use crate::transport::TransportType;

    fn test_pkt(dest_tid: u8) -> SmPkt {
        let mut client = SessionMetadata::new_invalid();
        client.transport_type = TransportType::Loopback;
        client.set_hostname("127.0.0.1:1").unwrap();
        client.app_tid = 0;
        client.session_num = 0;

        let mut server = SessionMetadata::new_invalid();
        server.transport_type = TransportType::Loopback;
        server.set_hostname("127.0.0.1:2").unwrap();
        server.app_tid = dest_tid;

        SmPkt::new(SmPktType::ConnectReq, SmErrType::NoError, client, server)
    }

    fn wait_for_pending(hook: &SmHook, n: usize) -> bool {
        for _ in 0..200 {
            if hook.pending() >= n {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_register_hook_rejects_duplicate_tid() {
        let nexus = Nexus::new("127.0.0.1:42101").unwrap();
        nexus.register_hook(Arc::new(SmHook::new(3))).unwrap();
        assert!(matches!(
            nexus.register_hook(Arc::new(SmHook::new(3))),
            Err(Error::HookAlreadyRegistered(3))
        ));
        nexus.deregister_hook(3);
        nexus.register_hook(Arc::new(SmHook::new(3))).unwrap();
    }

    #[test]
    fn test_routes_packet_to_hook() {
        let nexus = Nexus::new("127.0.0.1:42102").unwrap();
        let hook = Arc::new(SmHook::new(7));
        nexus.register_hook(Arc::clone(&hook)).unwrap();

        let socket = UdpSocket::bind(("127.0.0.1", 0)).unwrap();
        socket
            .send_to(&test_pkt(7).to_bytes(), "127.0.0.1:42102")
            .unwrap();

        assert!(wait_for_pending(&hook, 1));
        let mut out = Vec::new();
        hook.drain_into(&mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].server.app_tid, 7);
        assert_eq!(hook.pending(), 0);
    }

    #[test]
    fn test_drops_malformed_and_unknown_tid() {
        let nexus = Nexus::new("127.0.0.1:42103").unwrap();
        let hook = Arc::new(SmHook::new(1));
        nexus.register_hook(Arc::clone(&hook)).unwrap();

        let socket = UdpSocket::bind(("127.0.0.1", 0)).unwrap();
        // Truncated datagram.
        socket.send_to(&[0u8; 17], "127.0.0.1:42103").unwrap();
        // Valid packet for a TID nobody registered.
        socket
            .send_to(&test_pkt(9).to_bytes(), "127.0.0.1:42103")
            .unwrap();
        // Valid packet for the registered TID; must still get through.
        socket
            .send_to(&test_pkt(1).to_bytes(), "127.0.0.1:42103")
            .unwrap();

        assert!(wait_for_pending(&hook, 1));
        let mut out = Vec::new();
        hook.drain_into(&mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].server.app_tid, 1);
    }

    #[test]
    fn test_hook_drain_reuses_buffer() {
        let hook = SmHook::new(0);
        hook.push(test_pkt(0));
        hook.push(test_pkt(0));
        assert_eq!(hook.pending(), 2);

        let mut out = Vec::with_capacity(8);
        hook.drain_into(&mut out);
        assert_eq!(out.len(), 2);
        assert_eq!(hook.pending(), 0);

        // Second drain finds nothing.
        hook.drain_into(&mut out);
        assert!(out.is_empty());
    }
}
