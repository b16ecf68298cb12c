//! Data-path transport capability.
//!
//! The session management core does not construct fabric packets or poll
//! hardware queues itself. It reaches the data path through the
//! [`Transport`] trait: routing-info export for the connect handshake,
//! per-session resource admission, and the send/poll surface the event loop
//! drives. Production deployments implement this over RDMA verbs;
//! [`LoopbackTransport`] is an in-process implementation for tests and
//! local development.

use std::cell::Cell;
use std::collections::VecDeque;
use std::fmt;

use crate::session::Session;

/// Opaque routing block size carried in each endpoint descriptor.
pub const MAX_ROUTING_INFO_SIZE: usize = 48;

/// Fabric kind carried in endpoint descriptors. Both ends of a session must
/// agree on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TransportType {
    /// Sentinel for freshly initialized metadata.
    Invalid = 0,
    /// InfiniBand UD verbs.
    InfiniBand = 1,
    /// RoCE UD verbs.
    RoCe = 2,
    /// In-process loopback, used by tests.
    Loopback = 3,
}

impl TransportType {
    /// Convert from the wire representation.
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(TransportType::Invalid),
            1 => Some(TransportType::InfiniBand),
            2 => Some(TransportType::RoCe),
            3 => Some(TransportType::Loopback),
            _ => None,
        }
    }
}

/// Opaque per-endpoint routing block, filled by the transport and exchanged
/// verbatim in the connect handshake.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct RoutingInfo {
    bytes: [u8; MAX_ROUTING_INFO_SIZE],
}

impl RoutingInfo {
    /// A zeroed routing block, the state of a descriptor before the peer
    /// transport fills it in.
    pub fn zeroed() -> Self {
        Self {
            bytes: [0; MAX_ROUTING_INFO_SIZE],
        }
    }

    /// Build a routing block from raw bytes.
    pub fn from_bytes(bytes: [u8; MAX_ROUTING_INFO_SIZE]) -> Self {
        Self { bytes }
    }

    /// Raw bytes of the block.
    #[inline]
    pub fn as_bytes(&self) -> &[u8; MAX_ROUTING_INFO_SIZE] {
        &self.bytes
    }
}

impl Default for RoutingInfo {
    fn default() -> Self {
        Self::zeroed()
    }
}

impl fmt::Debug for RoutingInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // First eight bytes are enough to tell blocks apart in logs.
        write!(f, "RoutingInfo({:02x?}..)", &self.bytes[..8])
    }
}

/// Errors reported by a data-path transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    /// No ring buffers left to admit a new session.
    RingExhausted,
    /// Transport allocation failed.
    OutOfMemory,
    /// The peer's routing block could not be resolved.
    RoutingResolution,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::RingExhausted => write!(f, "ring buffers exhausted"),
            TransportError::OutOfMemory => write!(f, "out of memory"),
            TransportError::RoutingResolution => write!(f, "routing resolution failure"),
        }
    }
}

impl std::error::Error for TransportError {}

/// Capability set the session management core consumes.
///
/// One transport instance is owned by one Rpc and is never shared across
/// threads.
pub trait Transport {
    /// Fabric kind stamped into endpoint descriptors.
    fn kind(&self) -> TransportType;

    /// Export the routing block for a local fabric port.
    fn routing_info(&self, phy_port: u8) -> RoutingInfo;

    /// Resolve a peer's routing block before the session carries data.
    fn resolve_routing(&mut self, info: &RoutingInfo) -> Result<(), TransportError>;

    /// Reserve per-session fabric resources (receive ring entries etc.)
    /// for one more session.
    fn admit_session(&mut self) -> Result<(), TransportError>;

    /// Release the resources of one admitted session.
    fn evict_session(&mut self);

    /// Advisory pre-resolution message for a newly connected session. May
    /// be a no-op.
    fn send_resolve_session_msg(&mut self, session: &Session);

    /// Data-path send.
    fn send_message(&mut self, session: &Session, buffer: &[u8]) -> Result<(), TransportError>;

    /// Data-path receive; returns the number of completions drained.
    fn poll_completions(&mut self) -> usize;
}

/// In-process transport that loops sent messages back to its own
/// completion queue. Admission capacity is configurable so tests can
/// exercise the ring-exhausted path.
pub struct LoopbackTransport {
    max_sessions: usize,
    admitted: usize,
    inbox: VecDeque<Vec<u8>>,
    next_route: Cell<u32>,
}

impl LoopbackTransport {
    /// A loopback transport with effectively unbounded admission.
    pub fn new() -> Self {
        Self::with_session_limit(usize::MAX)
    }

    /// A loopback transport that admits at most `max_sessions` sessions.
    pub fn with_session_limit(max_sessions: usize) -> Self {
        Self {
            max_sessions,
            admitted: 0,
            inbox: VecDeque::new(),
            next_route: Cell::new(1),
        }
    }

    /// Number of currently admitted sessions.
    pub fn admitted(&self) -> usize {
        self.admitted
    }
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for LoopbackTransport {
    fn kind(&self) -> TransportType {
        TransportType::Loopback
    }

    fn routing_info(&self, phy_port: u8) -> RoutingInfo {
        let route = self.next_route.get();
        self.next_route.set(route.wrapping_add(1));

        let mut bytes = [0u8; MAX_ROUTING_INFO_SIZE];
        bytes[0] = phy_port;
        bytes[1..5].copy_from_slice(&route.to_le_bytes());
        RoutingInfo::from_bytes(bytes)
    }

    fn resolve_routing(&mut self, info: &RoutingInfo) -> Result<(), TransportError> {
        // A zeroed block was never filled by a transport.
        if info.as_bytes().iter().all(|&b| b == 0) {
            return Err(TransportError::RoutingResolution);
        }
        Ok(())
    }

    fn admit_session(&mut self) -> Result<(), TransportError> {
        if self.admitted >= self.max_sessions {
            return Err(TransportError::RingExhausted);
        }
        self.admitted += 1;
        Ok(())
    }

    fn evict_session(&mut self) {
        debug_assert!(self.admitted > 0);
        self.admitted = self.admitted.saturating_sub(1);
    }

    fn send_resolve_session_msg(&mut self, _session: &Session) {}

    fn send_message(&mut self, _session: &Session, buffer: &[u8]) -> Result<(), TransportError> {
        self.inbox.push_back(buffer.to_vec());
        Ok(())
    }

    fn poll_completions(&mut self) -> usize {
        let drained = self.inbox.len();
        self.inbox.clear();
        drained
    }
}
