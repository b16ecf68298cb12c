//! # fabrpc - session-managed RPC substrate for datacenter fabrics
//!
//! This crate implements the session lifecycle core of a per-thread RPC
//! system in the style of eRPC (NSDI 2019): a per-process [`Nexus`]
//! rendezvous with a UDP control plane, per-thread [`Rpc`] endpoints that
//! own all of their session state, and an idempotent connect/disconnect
//! protocol that synthesizes reliability over a lossy datagram channel by
//! uniform retry.
//!
//! The data path (fabric packet construction, completion polling) is an
//! external collaborator reached through the [`Transport`] capability
//! trait; [`LoopbackTransport`] stands in for it in tests.
//!
//! ## Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use fabrpc::{LoopbackTransport, Nexus, Rpc, Session, SmErrType, SmEventType};
//!
//! fn sm_handler(session: &mut Session, event: SmEventType, err: SmErrType, _ctx: &mut ()) {
//!     println!("session {}: {:?} ({})", session.local_session_num(), event, err);
//! }
//!
//! let nexus = Arc::new(Nexus::new("client-host:31850")?);
//! let mut rpc = Rpc::new(
//!     Arc::clone(&nexus),
//!     (),
//!     0,
//!     sm_handler,
//!     LoopbackTransport::new(),
//!     &[0],
//! )?;
//!
//! let session = rpc.create_session(0, "server-host:31850", 0, 0)?;
//! while !rpc.is_connected(session) {
//!     rpc.run_event_loop_once();
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`config`]: control-channel configuration and management constants
//! - [`sm`]: session management wire protocol (`SmPkt`, `SessionMetadata`)
//! - [`session`]: session entity, state machine, append-only session vector
//! - [`transport`]: data-path capability trait and the loopback stand-in
//! - [`udp`]: best-effort datagram client with drop injection
//! - [`nexus`]: per-process rendezvous and packet demultiplexer
//! - [`retry`]: timed resend of in-flight management requests
//! - [`rpc`]: per-thread endpoint, event loop, application callbacks
//! - [`timing`]: cycle-counter timekeeping
//!
//! All session state is owned by exactly one thread. The only
//! cross-thread structure is the [`SmHook`] handoff between the Nexus
//! receiver and one Rpc, and the event loop drains it cooperatively.

pub mod config;
pub mod error;
pub mod nexus;
pub mod retry;
pub mod rpc;
pub mod session;
pub mod sm;
pub mod timing;
pub mod transport;
pub mod udp;

// Re-export main types
pub use config::{
    UdpConfig, DEFAULT_MGMT_UDP_PORT, MAX_FAB_DEV_PORTS, MAX_SESSIONS_PER_THREAD,
    SESSION_MGMT_RETRANS_MS, SESSION_MGMT_TIMEOUT_MS,
};
pub use error::{Error, Result};
pub use nexus::{Nexus, SmHook};
pub use retry::RetryQueue;
pub use rpc::{Rpc, SmHandler};
pub use session::{Role, Session, SessionHandle, SessionState, SessionVec, SmEventType};
pub use sm::{
    SessionMetadata, SmErrType, SmPkt, SmPktType, INVALID_APP_TID, INVALID_PHY_PORT,
    INVALID_SESSION_NUM, INVALID_START_SEQ, MAX_HOSTNAME_LEN, SM_PKT_SIZE, START_SEQ_MASK,
};
pub use transport::{
    LoopbackTransport, RoutingInfo, Transport, TransportError, TransportType,
    MAX_ROUTING_INFO_SIZE,
};
