//! Session management wire protocol.
//!
//! Connect and disconnect handshakes travel as fixed-size UDP datagrams.
//! Each packet carries two complete endpoint descriptors
//! ([`SessionMetadata`]): the sender fills only the descriptor it owns
//! before transmit, and the peer fills its own descriptor on reply. The
//! byte layout is explicit little-endian, so heterogeneous hosts agree on
//! it.
//!
//! Packet layout:
//!
//! ```text
//! Offset  Size  Field
//! 0       4     pkt_type (u32 LE)
//! 4       4     err_type (u32 LE, responses only; zero on requests)
//! 8       192   client descriptor
//! 200     192   server descriptor
//! ```
//!
//! Descriptor layout:
//!
//! ```text
//! Offset  Size  Field
//! 0       1     transport kind
//! 1       1     app_tid
//! 2       1     phy_port
//! 3       1     reserved
//! 4       4     session_num (u32 LE)
//! 8       8     start_seq (u64 LE, 48 significant bits)
//! 16      128   hostname (management URI, NUL-padded)
//! 144     48    routing info
//! ```

use std::fmt;

use crate::error::{Error, Result};
use crate::transport::{RoutingInfo, TransportType, MAX_ROUTING_INFO_SIZE};

/// Maximum hostname (management URI) length, including room for NUL
/// padding.
pub const MAX_HOSTNAME_LEN: usize = 128;

/// Serialized size of one endpoint descriptor.
pub const SM_METADATA_SIZE: usize = 16 + MAX_HOSTNAME_LEN + MAX_ROUTING_INFO_SIZE;

/// Serialized size of a session management packet.
pub const SM_PKT_SIZE: usize = 8 + 2 * SM_METADATA_SIZE;

// Single-datagram assumption for the control channel.
const _: () = assert!(SM_PKT_SIZE < 1400, "management packet too large for UDP");

/// Invalid app TID sentinel.
pub const INVALID_APP_TID: u8 = u8::MAX;
/// Invalid fabric port sentinel.
pub const INVALID_PHY_PORT: u8 = u8::MAX;
/// Invalid session number sentinel.
pub const INVALID_SESSION_NUM: u32 = u32::MAX;
/// Invalid start sequence sentinel.
pub const INVALID_START_SEQ: u64 = u64::MAX;

/// Mask selecting the 48 significant bits of a start sequence number.
pub const START_SEQ_MASK: u64 = (1u64 << 48) - 1;

/// Session management packet kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SmPktType {
    /// Client requests a new session.
    ConnectReq = 1,
    /// Server answers a connect request.
    ConnectResp = 2,
    /// Client requests session teardown.
    DisconnectReq = 3,
    /// Server answers a disconnect request.
    DisconnectResp = 4,
}

impl SmPktType {
    /// Convert from the wire representation.
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            1 => Some(SmPktType::ConnectReq),
            2 => Some(SmPktType::ConnectResp),
            3 => Some(SmPktType::DisconnectReq),
            4 => Some(SmPktType::DisconnectResp),
            _ => None,
        }
    }

    /// True for the two request kinds.
    #[inline]
    pub fn is_req(self) -> bool {
        matches!(self, SmPktType::ConnectReq | SmPktType::DisconnectReq)
    }

    /// The response kind matching a request kind.
    #[inline]
    pub fn req_to_resp(self) -> Self {
        match self {
            SmPktType::ConnectReq => SmPktType::ConnectResp,
            SmPktType::DisconnectReq => SmPktType::DisconnectResp,
            resp => resp,
        }
    }
}

/// Session management error kind, carried in responses.
///
/// [`SmErrType::ConnectTimeout`] is generated locally when the connect
/// deadline expires and is never sent on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SmErrType {
    /// Success.
    NoError = 0,
    /// The named session no longer exists at the peer.
    SrvDisconnected = 1,
    /// Peer has no transport resources for a new session.
    RingExhausted = 2,
    /// Peer allocation failed.
    OutOfMemory = 3,
    /// Peer could not resolve the client's routing block.
    RoutingResolutionFailure = 4,
    /// The addressed app TID or fabric port is not served by the peer.
    InvalidRemoteRpcId = 5,
    /// Transport kinds are incompatible.
    InvalidTransport = 6,
    /// Connection establishment exceeded its absolute deadline.
    ConnectTimeout = 7,
}

impl SmErrType {
    /// Convert from the wire representation.
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(SmErrType::NoError),
            1 => Some(SmErrType::SrvDisconnected),
            2 => Some(SmErrType::RingExhausted),
            3 => Some(SmErrType::OutOfMemory),
            4 => Some(SmErrType::RoutingResolutionFailure),
            5 => Some(SmErrType::InvalidRemoteRpcId),
            6 => Some(SmErrType::InvalidTransport),
            7 => Some(SmErrType::ConnectTimeout),
            _ => None,
        }
    }
}

impl fmt::Display for SmErrType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SmErrType::NoError => "no error",
            SmErrType::SrvDisconnected => "server disconnected",
            SmErrType::RingExhausted => "ring buffers exhausted",
            SmErrType::OutOfMemory => "out of memory",
            SmErrType::RoutingResolutionFailure => "routing resolution failure",
            SmErrType::InvalidRemoteRpcId => "invalid remote Rpc ID",
            SmErrType::InvalidTransport => "invalid transport",
            SmErrType::ConnectTimeout => "connect timeout",
        };
        write!(f, "{}", s)
    }
}

/// One side of a session: the flat endpoint descriptor exchanged in the
/// connect handshake.
///
/// Freshly created metadata carries invalid sentinels in every numeric
/// field to aid debugging. Two descriptors compare equal iff hostname,
/// app TID, and session number match; the remaining fields are not part of
/// identity.
#[derive(Clone, Copy)]
pub struct SessionMetadata {
    /// Fabric kind of the owning endpoint.
    pub transport_type: TransportType,
    /// Management URI (`host:port`) of the owning Nexus, NUL-padded.
    pub hostname: [u8; MAX_HOSTNAME_LEN],
    /// TID of the Rpc that owns this endpoint.
    pub app_tid: u8,
    /// Fabric port used by this endpoint.
    pub phy_port: u8,
    /// Session number, unique within the owning Rpc.
    pub session_num: u32,
    /// Initial data-path sequence number (48 significant bits).
    pub start_seq: u64,
    /// Opaque routing block supplied by the transport.
    pub routing_info: RoutingInfo,
}

impl SessionMetadata {
    /// Fresh metadata with invalid sentinels in every field.
    pub fn new_invalid() -> Self {
        Self {
            transport_type: TransportType::Invalid,
            hostname: [0; MAX_HOSTNAME_LEN],
            app_tid: INVALID_APP_TID,
            phy_port: INVALID_PHY_PORT,
            session_num: INVALID_SESSION_NUM,
            start_seq: INVALID_START_SEQ,
            routing_info: RoutingInfo::zeroed(),
        }
    }

    /// Store a hostname, normalizing surrounding whitespace.
    ///
    /// Fails if the normalized name does not leave room for NUL padding.
    pub fn set_hostname(&mut self, hostname: &str) -> Result<()> {
        let trimmed = hostname.trim();
        if trimmed.len() >= MAX_HOSTNAME_LEN {
            return Err(Error::HostnameTooLong(trimmed.len()));
        }
        self.hostname = [0; MAX_HOSTNAME_LEN];
        self.hostname[..trimmed.len()].copy_from_slice(trimmed.as_bytes());
        Ok(())
    }

    /// The stored hostname, up to the first NUL.
    pub fn hostname_str(&self) -> &str {
        let end = self
            .hostname
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(MAX_HOSTNAME_LEN);
        std::str::from_utf8(&self.hostname[..end]).unwrap_or("")
    }

    /// Short name for this endpoint: hostname, Rpc TID, session number.
    pub fn name(&self) -> String {
        let session_num = if self.session_num == INVALID_SESSION_NUM {
            "XX".to_string()
        } else {
            self.session_num.to_string()
        };
        format!(
            "[H: {}, R: {}, S: {}]",
            self.hostname_str(),
            self.app_tid,
            session_num
        )
    }

    /// Short name for the Rpc hosting this endpoint.
    pub fn rpc_name(&self) -> String {
        format!("[H: {}, R: {}]", self.hostname_str(), self.app_tid)
    }

    fn write_to(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= SM_METADATA_SIZE);
        buf[0] = self.transport_type as u8;
        buf[1] = self.app_tid;
        buf[2] = self.phy_port;
        buf[3] = 0;
        buf[4..8].copy_from_slice(&self.session_num.to_le_bytes());
        buf[8..16].copy_from_slice(&self.start_seq.to_le_bytes());
        buf[16..16 + MAX_HOSTNAME_LEN].copy_from_slice(&self.hostname);
        buf[16 + MAX_HOSTNAME_LEN..SM_METADATA_SIZE]
            .copy_from_slice(self.routing_info.as_bytes());
    }

    fn read_from(buf: &[u8]) -> Result<Self> {
        debug_assert!(buf.len() >= SM_METADATA_SIZE);
        let transport_type =
            TransportType::from_u8(buf[0]).ok_or(Error::InvalidTransportType(buf[0]))?;

        let mut hostname = [0u8; MAX_HOSTNAME_LEN];
        hostname.copy_from_slice(&buf[16..16 + MAX_HOSTNAME_LEN]);

        let mut routing = [0u8; MAX_ROUTING_INFO_SIZE];
        routing.copy_from_slice(&buf[16 + MAX_HOSTNAME_LEN..SM_METADATA_SIZE]);

        Ok(Self {
            transport_type,
            hostname,
            app_tid: buf[1],
            phy_port: buf[2],
            session_num: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
            start_seq: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
            routing_info: RoutingInfo::from_bytes(routing),
        })
    }
}

impl Default for SessionMetadata {
    fn default() -> Self {
        Self::new_invalid()
    }
}

impl PartialEq for SessionMetadata {
    /// Location identity only: hostname, app TID, session number.
    fn eq(&self, other: &Self) -> bool {
        self.hostname_str() == other.hostname_str()
            && self.app_tid == other.app_tid
            && self.session_num == other.session_num
    }
}

impl fmt::Debug for SessionMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionMetadata{}", self.name())
    }
}

/// Session management packet: a request or response with both endpoint
/// descriptors.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SmPkt {
    /// Packet kind.
    pub pkt_type: SmPktType,
    /// Error kind; meaningful only for responses, zero on requests.
    pub err_type: SmErrType,
    /// Client-side endpoint descriptor.
    pub client: SessionMetadata,
    /// Server-side endpoint descriptor.
    pub server: SessionMetadata,
}

impl SmPkt {
    /// Build a packet from its parts.
    pub fn new(
        pkt_type: SmPktType,
        err_type: SmErrType,
        client: SessionMetadata,
        server: SessionMetadata,
    ) -> Self {
        Self {
            pkt_type,
            err_type,
            client,
            server,
        }
    }

    /// Serialize to the fixed wire size.
    pub fn to_bytes(&self) -> [u8; SM_PKT_SIZE] {
        let mut buf = [0u8; SM_PKT_SIZE];
        buf[0..4].copy_from_slice(&(self.pkt_type as u32).to_le_bytes());
        buf[4..8].copy_from_slice(&(self.err_type as u32).to_le_bytes());
        self.client.write_to(&mut buf[8..8 + SM_METADATA_SIZE]);
        self.server
            .write_to(&mut buf[8 + SM_METADATA_SIZE..SM_PKT_SIZE]);
        buf
    }

    /// Deserialize a datagram. Rejects wrong sizes and invalid enum values
    /// so malformed input never reaches the handlers.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != SM_PKT_SIZE {
            return Err(Error::BadPacketSize {
                expected: SM_PKT_SIZE,
                got: bytes.len(),
            });
        }

        let raw_pkt = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        let pkt_type = SmPktType::from_u32(raw_pkt).ok_or(Error::InvalidPktType(raw_pkt))?;

        let raw_err = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
        let err_type = SmErrType::from_u32(raw_err).ok_or(Error::InvalidErrType(raw_err))?;

        let client = SessionMetadata::read_from(&bytes[8..8 + SM_METADATA_SIZE])?;
        let server = SessionMetadata::read_from(&bytes[8 + SM_METADATA_SIZE..SM_PKT_SIZE])?;

        Ok(Self {
            pkt_type,
            err_type,
            client,
            server,
        })
    }

    /// The app TID of the local Rpc this packet is addressed to: requests
    /// go to the server endpoint, responses to the client endpoint.
    #[inline]
    pub fn dest_app_tid(&self) -> u8 {
        if self.pkt_type.is_req() {
            self.server.app_tid
        } else {
            self.client.app_tid
        }
    }

    /// The management URI this packet should be sent to.
    #[inline]
    pub fn dest_hostname(&self) -> &str {
        if self.pkt_type.is_req() {
            self.server.hostname_str()
        } else {
            self.client.hostname_str()
        }
    }
}
