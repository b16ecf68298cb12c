//! Per-thread RPC endpoint.
//!
//! An [`Rpc`] owns its sessions outright: the session vector, the retry
//! queue, and the management state machine all belong to the thread that
//! created the Rpc, and nothing here blocks. The only cross-thread touch
//! point is the [`SmHook`] shared with the Nexus receiver, drained
//! cooperatively by [`Rpc::run_event_loop_once`].
//!
//! Session establishment is asynchronous: `create_session` returns a
//! handle immediately and the application learns the outcome through its
//! session management handler, invoked inline from the event loop.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, warn};

use crate::config::{MAX_FAB_DEV_PORTS, SESSION_MGMT_RETRANS_MS, SESSION_MGMT_TIMEOUT_MS};
use crate::error::{Error, Result};
use crate::nexus::{Nexus, SmHook};
use crate::retry::RetryQueue;
use crate::session::{Role, Session, SessionHandle, SessionState, SessionVec, SmEventType};
use crate::sm::{SmErrType, SmPkt, SmPktType, START_SEQ_MASK};
use crate::timing::{rdtsc, to_ms};
use crate::transport::{Transport, TransportError};
use crate::udp::SmSender;

/// Session management handler: an injected capability, called inline on
/// the Rpc's thread with the session, the event, the error kind, and the
/// application context.
pub type SmHandler<C> = fn(&mut Session, SmEventType, SmErrType, &mut C);

/// Per-thread RPC endpoint.
///
/// Owns a vector of sessions, drives their management state machines, and
/// delivers session events to the application. One Rpc per thread; the
/// Rpc must not be moved across threads while sessions are live.
pub struct Rpc<T: Transport, C> {
    nexus: Arc<Nexus>,
    context: C,
    app_tid: u8,
    sm_handler: SmHandler<C>,
    fab_ports: Vec<u8>,
    transport: T,
    sessions: SessionVec,
    retry_queue: RetryQueue,
    hook: Arc<SmHook>,
    sender: SmSender,
    slow_rand: StdRng,
    drain_buf: Vec<SmPkt>,
}

impl<T: Transport, C> Rpc<T, C> {
    /// Create an Rpc and register it at the Nexus under `app_tid`.
    ///
    /// `fab_ports` lists the fabric port indices this Rpc manages;
    /// `create_session` and inbound connect requests are validated
    /// against it.
    pub fn new(
        nexus: Arc<Nexus>,
        context: C,
        app_tid: u8,
        sm_handler: SmHandler<C>,
        transport: T,
        fab_ports: &[u8],
    ) -> Result<Self> {
        debug_assert!(!fab_ports.is_empty() && fab_ports.len() <= MAX_FAB_DEV_PORTS);

        let sender = SmSender::new(nexus.udp_config().drop_prob)?;
        let hook = Arc::new(SmHook::new(app_tid));
        nexus.register_hook(Arc::clone(&hook))?;

        Ok(Self {
            nexus,
            context,
            app_tid,
            sm_handler,
            fab_ports: fab_ports.to_vec(),
            transport,
            sessions: SessionVec::new(),
            retry_queue: RetryQueue::new(),
            hook,
            sender,
            slow_rand: StdRng::from_entropy(),
            drain_buf: Vec::new(),
        })
    }

    /// The app TID of this Rpc.
    #[inline]
    pub fn app_tid(&self) -> u8 {
        self.app_tid
    }

    /// Shared access to the application context.
    #[inline]
    pub fn context(&self) -> &C {
        &self.context
    }

    /// Exclusive access to the application context.
    #[inline]
    pub fn context_mut(&mut self) -> &mut C {
        &mut self.context
    }

    /// Shared access to the data-path transport.
    #[inline]
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Look up a session by handle. `None` once the session is buried.
    #[inline]
    pub fn session(&self, handle: SessionHandle) -> Option<&Session> {
        self.sessions.get(handle.session_num())
    }

    /// True if the session exists and is connected.
    #[inline]
    pub fn is_connected(&self, handle: SessionHandle) -> bool {
        self.sessions
            .get(handle.session_num())
            .is_some_and(|s| s.state == SessionState::Connected)
    }

    /// Number of live sessions (client and server role).
    pub fn active_sessions(&self) -> usize {
        self.sessions.active_count()
    }

    /// Number of sessions ever created by this Rpc.
    pub fn total_sessions(&self) -> usize {
        self.sessions.total_created()
    }

    /// Number of sessions with an in-flight management request.
    pub fn mgmt_retry_pending(&self) -> usize {
        self.retry_queue.len()
    }

    // =========================================================================
    // Session management API
    // =========================================================================

    /// Create a client session and initiate connection establishment.
    ///
    /// Returns the session handle immediately; the outcome arrives later
    /// through the session management handler (`Connected` or
    /// `ConnectFailed`). Synchronous errors fire no callback.
    pub fn create_session(
        &mut self,
        local_port_index: u8,
        remote_uri: &str,
        remote_app_tid: u8,
        remote_port_index: u8,
    ) -> Result<SessionHandle> {
        if !self.fab_ports.contains(&local_port_index) {
            return Err(Error::UnmanagedPort(local_port_index));
        }
        if self.sessions.is_full() {
            return Err(Error::SessionLimitExceeded);
        }

        let session_num = self.sessions.next_session_num();
        let mut session = Box::new(Session::new(Role::Client, SessionState::ConnectInProgress));

        session.client.transport_type = self.transport.kind();
        session.client.set_hostname(self.nexus.local_uri())?;
        session.client.app_tid = self.app_tid;
        session.client.phy_port = local_port_index;
        session.client.session_num = session_num;
        session.client.start_seq = self.generate_start_seq();
        session.client.routing_info = self.transport.routing_info(local_port_index);

        // The server descriptor holds only the remote coordinates; the
        // peer fills in its session number, start sequence, and routing
        // block on reply.
        session.server.transport_type = self.transport.kind();
        session.server.set_hostname(remote_uri)?;
        session.server.app_tid = remote_app_tid;
        session.server.phy_port = remote_port_index;

        session.sm_start_tsc = rdtsc();
        session.mgmt_req_tsc = rdtsc();

        Self::send_connect_req_one(&mut self.sender, &session)?;

        let num = self.sessions.push(session);
        self.retry_queue.add(num);
        debug!(session_num = num, remote = remote_uri, "connect initiated");
        Ok(SessionHandle(num))
    }

    /// Disconnect and destroy a client session.
    ///
    /// Returns true if a disconnect request was sent (the `Disconnected`
    /// callback arrives later), or if the session was in the error state
    /// (the callback runs before this returns). Returns false while
    /// connection establishment or teardown is already in flight, and for
    /// server-role or unknown handles.
    pub fn destroy_session(&mut self, handle: SessionHandle) -> bool {
        let num = handle.session_num();
        let Some(session) = self.sessions.get_mut(num) else {
            return false;
        };
        if !session.is_client() {
            return false;
        }

        match session.state {
            SessionState::Connected => {
                session.state = SessionState::DisconnectInProgress;
                session.sm_start_tsc = rdtsc();
                session.mgmt_req_tsc = rdtsc();
                if let Err(e) = Self::send_disconnect_req_one(&mut self.sender, session) {
                    // The retry sweep resends; losing this send is no
                    // different from a lost datagram.
                    warn!(session_num = num, error = %e, "disconnect request send failed");
                }
                self.retry_queue.add(num);
                debug!(session_num = num, "disconnect initiated");
                true
            }
            SessionState::Error => {
                session.state = SessionState::Disconnected;
                (self.sm_handler)(
                    session,
                    SmEventType::Disconnected,
                    SmErrType::NoError,
                    &mut self.context,
                );
                self.sessions.bury(num);
                debug!(session_num = num, "errored session buried");
                true
            }
            SessionState::ConnectInProgress
            | SessionState::DisconnectInProgress
            | SessionState::Disconnected => false,
        }
    }

    // =========================================================================
    // Datapath passthrough
    // =========================================================================

    /// Data-path send of a request message on a connected session.
    pub fn send_request(&mut self, handle: SessionHandle, buffer: &[u8]) -> Result<()> {
        self.send_on_session(handle, buffer)
    }

    /// Data-path send of a response message on a connected session.
    pub fn send_response(&mut self, handle: SessionHandle, buffer: &[u8]) -> Result<()> {
        self.send_on_session(handle, buffer)
    }

    fn send_on_session(&mut self, handle: SessionHandle, buffer: &[u8]) -> Result<()> {
        let num = handle.session_num();
        let session = self.sessions.get(num).ok_or(Error::SessionNotFound(num))?;
        if session.state != SessionState::Connected {
            return Err(Error::SessionNotConnected(num));
        }
        self.transport.send_message(session, buffer)?;
        Ok(())
    }

    // =========================================================================
    // Event loop
    // =========================================================================

    /// Run one iteration of the event loop: drain the Nexus hook and
    /// dispatch management packets, sweep the retry queue, poll the
    /// data-path transport.
    pub fn run_event_loop_once(&mut self) {
        if self.hook.pending() > 0 {
            let mut pkts = std::mem::take(&mut self.drain_buf);
            self.hook.drain_into(&mut pkts);
            for pkt in pkts.drain(..) {
                self.handle_sm_pkt(&pkt);
            }
            self.drain_buf = pkts;
        }

        self.mgmt_retry();
        self.transport.poll_completions();
    }

    /// Run the event loop forever.
    pub fn run_event_loop(&mut self) -> ! {
        loop {
            self.run_event_loop_once();
        }
    }

    /// Run the event loop for `timeout_ms` milliseconds of cycle-counter
    /// time.
    pub fn run_event_loop_timeout(&mut self, timeout_ms: u64) {
        let start_tsc = rdtsc();
        let freq_ghz = self.nexus.freq_ghz();
        loop {
            self.run_event_loop_once();
            if to_ms(rdtsc().wrapping_sub(start_tsc), freq_ghz) > timeout_ms as f64 {
                return;
            }
        }
    }

    // =========================================================================
    // Management packet handlers
    // =========================================================================

    fn handle_sm_pkt(&mut self, pkt: &SmPkt) {
        match pkt.pkt_type {
            SmPktType::ConnectReq => self.handle_session_connect_req(pkt),
            SmPktType::ConnectResp => self.handle_session_connect_resp(pkt),
            SmPktType::DisconnectReq => self.handle_session_disconnect_req(pkt),
            SmPktType::DisconnectResp => self.handle_session_disconnect_resp(pkt),
        }
    }

    /// Server side of connection establishment.
    fn handle_session_connect_req(&mut self, pkt: &SmPkt) {
        debug!(client = %pkt.client.name(), "connect request");

        if pkt.client.transport_type != self.transport.kind() {
            self.send_sm_resp(pkt, SmErrType::InvalidTransport);
            return;
        }
        // The Nexus routes by app TID; revalidate the full local address.
        if pkt.server.app_tid != self.app_tid || !self.fab_ports.contains(&pkt.server.phy_port) {
            self.send_sm_resp(pkt, SmErrType::InvalidRemoteRpcId);
            return;
        }

        // A duplicate connect request means our response was lost, not
        // the session: resend what the existing session recorded.
        if let Some(existing) = self.sessions.find_server_session(&pkt.client) {
            let resp = SmPkt::new(
                SmPktType::ConnectResp,
                SmErrType::NoError,
                existing.client,
                existing.server,
            );
            debug!(
                session_num = existing.server.session_num,
                "duplicate connect request, resending response"
            );
            if let Err(e) = self.sender.send(&resp, resp.dest_hostname()) {
                warn!(error = %e, "failed to resend connect response");
            }
            return;
        }

        if self.sessions.is_full() {
            self.send_sm_resp(pkt, SmErrType::RingExhausted);
            return;
        }
        if self.transport.resolve_routing(&pkt.client.routing_info).is_err() {
            self.send_sm_resp(pkt, SmErrType::RoutingResolutionFailure);
            return;
        }
        if let Err(e) = self.transport.admit_session() {
            self.send_sm_resp(pkt, sm_err_from_transport(e));
            return;
        }

        // Server-side sessions are born connected and stay that way until
        // a valid disconnect request buries them.
        let session_num = self.sessions.next_session_num();
        let mut session = Box::new(Session::new(Role::Server, SessionState::Connected));
        session.client = pkt.client;
        session.server = pkt.server;
        session.server.session_num = session_num;
        session.server.start_seq = self.generate_start_seq();
        session.server.routing_info = self.transport.routing_info(pkt.server.phy_port);

        let resp = SmPkt::new(
            SmPktType::ConnectResp,
            SmErrType::NoError,
            session.client,
            session.server,
        );
        self.sessions.push(session);

        debug!(session_num, client = %pkt.client.name(), "session admitted");
        if let Err(e) = self.sender.send(&resp, resp.dest_hostname()) {
            warn!(error = %e, "failed to send connect response");
        }
    }

    /// Client side of connection establishment.
    fn handle_session_connect_resp(&mut self, pkt: &SmPkt) {
        let num = pkt.client.session_num;
        let Some(session) = self.sessions.get_mut(num) else {
            debug!(session_num = num, "dropping connect response for buried session");
            return;
        };
        // A response after a retry already won, or a stale packet from an
        // earlier process: the state machine only moves forward.
        if !session.is_client()
            || session.state != SessionState::ConnectInProgress
            || session.client != pkt.client
        {
            debug!(session_num = num, "dropping duplicate connect response");
            return;
        }

        self.retry_queue.remove(num);

        if pkt.err_type == SmErrType::NoError {
            session.server = pkt.server;
            session.state = SessionState::Connected;
            self.transport.send_resolve_session_msg(session);
            debug!(session_num = num, server = %session.server.name(), "session connected");
            (self.sm_handler)(
                session,
                SmEventType::Connected,
                SmErrType::NoError,
                &mut self.context,
            );
        } else {
            session.state = SessionState::Error;
            warn!(session_num = num, err = %pkt.err_type, "connect failed");
            (self.sm_handler)(
                session,
                SmEventType::ConnectFailed,
                pkt.err_type,
                &mut self.context,
            );
        }
    }

    /// Server side of teardown.
    fn handle_session_disconnect_req(&mut self, pkt: &SmPkt) {
        let num = pkt.server.session_num;
        let valid = self
            .sessions
            .get(num)
            .is_some_and(|s| s.is_server() && s.client == pkt.client);

        if !valid {
            // Duplicate of an already-honored disconnect, or a request
            // for a session this Rpc never had.
            self.send_sm_resp(pkt, SmErrType::SrvDisconnected);
            return;
        }

        self.sessions.bury(num);
        self.transport.evict_session();
        debug!(session_num = num, client = %pkt.client.name(), "session destroyed by disconnect request");
        self.send_sm_resp(pkt, SmErrType::NoError);
    }

    /// Client side of teardown.
    fn handle_session_disconnect_resp(&mut self, pkt: &SmPkt) {
        let num = pkt.client.session_num;
        let Some(session) = self.sessions.get_mut(num) else {
            debug!(session_num = num, "dropping disconnect response for buried session");
            return;
        };
        if !session.is_client() || session.state != SessionState::DisconnectInProgress {
            debug!(session_num = num, "dropping stale disconnect response");
            return;
        }

        self.retry_queue.remove(num);

        // Even `SrvDisconnected` means the session is gone at the peer,
        // which is what teardown wanted.
        session.state = SessionState::Disconnected;
        debug!(session_num = num, "session disconnected");
        (self.sm_handler)(
            session,
            SmEventType::Disconnected,
            SmErrType::NoError,
            &mut self.context,
        );
        self.sessions.bury(num);
    }

    /// Flip a request into its response, stamp the error kind, and send it
    /// back to the client endpoint.
    fn send_sm_resp(&mut self, req: &SmPkt, err_type: SmErrType) {
        debug_assert!(req.pkt_type.is_req());
        let resp = SmPkt::new(req.pkt_type.req_to_resp(), err_type, req.client, req.server);
        if err_type != SmErrType::NoError && err_type != SmErrType::SrvDisconnected {
            warn!(err = %err_type, client = %req.client.name(), "rejecting management request");
        }
        if let Err(e) = self.sender.send(&resp, resp.dest_hostname()) {
            warn!(error = %e, "failed to send management response");
        }
    }

    // =========================================================================
    // Retry engine
    // =========================================================================

    /// Resend in-flight management requests whose retransmission interval
    /// has elapsed, and fail connects that exceeded the absolute deadline.
    fn mgmt_retry(&mut self) {
        if self.retry_queue.is_empty() {
            return;
        }
        let cur_tsc = rdtsc();
        let freq_ghz = self.nexus.freq_ghz();

        for num in self.retry_queue.snapshot() {
            let Some(session) = self.sessions.get_mut(num) else {
                debug_assert!(false, "retry queue entry for buried session");
                self.retry_queue.remove(num);
                continue;
            };

            match session.state {
                SessionState::ConnectInProgress => {
                    let waited_ms = to_ms(cur_tsc.wrapping_sub(session.sm_start_tsc), freq_ghz);
                    if waited_ms > SESSION_MGMT_TIMEOUT_MS as f64 {
                        self.retry_queue.remove(num);
                        session.state = SessionState::Error;
                        warn!(session_num = num, waited_ms, "connect timed out");
                        (self.sm_handler)(
                            session,
                            SmEventType::ConnectFailed,
                            SmErrType::ConnectTimeout,
                            &mut self.context,
                        );
                        continue;
                    }

                    if to_ms(cur_tsc.wrapping_sub(session.mgmt_req_tsc), freq_ghz)
                        > SESSION_MGMT_RETRANS_MS as f64
                    {
                        debug!(session_num = num, "retrying connect request");
                        if let Err(e) = Self::send_connect_req_one(&mut self.sender, session) {
                            warn!(session_num = num, error = %e, "connect retransmit failed");
                        }
                        session.mgmt_req_tsc = rdtsc();
                    }
                }
                SessionState::DisconnectInProgress => {
                    if to_ms(cur_tsc.wrapping_sub(session.mgmt_req_tsc), freq_ghz)
                        > SESSION_MGMT_RETRANS_MS as f64
                    {
                        debug!(session_num = num, "retrying disconnect request");
                        if let Err(e) = Self::send_disconnect_req_one(&mut self.sender, session) {
                            warn!(session_num = num, error = %e, "disconnect retransmit failed");
                        }
                        session.mgmt_req_tsc = rdtsc();
                    }
                }
                state => {
                    debug_assert!(false, "retry queue session in state {}", state);
                }
            }
        }
    }

    fn send_connect_req_one(sender: &mut SmSender, session: &Session) -> Result<()> {
        debug_assert!(session.is_client() && session.state == SessionState::ConnectInProgress);
        let pkt = SmPkt::new(
            SmPktType::ConnectReq,
            SmErrType::NoError,
            session.client,
            session.server,
        );
        sender.send(&pkt, pkt.dest_hostname())
    }

    fn send_disconnect_req_one(sender: &mut SmSender, session: &Session) -> Result<()> {
        debug_assert!(session.is_client() && session.state == SessionState::DisconnectInProgress);
        let pkt = SmPkt::new(
            SmPktType::DisconnectReq,
            SmErrType::NoError,
            session.client,
            session.server,
        );
        sender.send(&pkt, pkt.dest_hostname())
    }

    /// Draw a fresh 48-bit start sequence number from the slow random
    /// source. Both sides exchange theirs in the connect handshake.
    fn generate_start_seq(&mut self) -> u64 {
        self.slow_rand.gen::<u64>() & START_SEQ_MASK
    }
}

impl<T: Transport, C> Drop for Rpc<T, C> {
    fn drop(&mut self) {
        self.nexus.deregister_hook(self.app_tid);
    }
}

/// Map a transport admission error onto the wire error kind.
fn sm_err_from_transport(e: TransportError) -> SmErrType {
    match e {
        TransportError::RingExhausted => SmErrType::RingExhausted,
        TransportError::OutOfMemory => SmErrType::OutOfMemory,
        TransportError::RoutingResolution => SmErrType::RoutingResolutionFailure,
    }
}
