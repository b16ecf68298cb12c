//! Best-effort datagram client for the control channel.
//!
//! Session management packets are sent as single UDP datagrams to the
//! peer's management URI. Delivery is not reliable and is not made so
//! here; the retry engine resends until a response arrives. An optional
//! drop probability simulates a lossy fabric for fault-injection tests.

use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use crate::error::{Error, Result};
use crate::sm::SmPkt;

/// Resolve a `host:port` management URI to a socket address.
pub fn resolve_uri(uri: &str) -> Result<SocketAddr> {
    uri.to_socket_addrs()
        .map_err(|_| Error::InvalidUri(uri.to_string()))?
        .next()
        .ok_or_else(|| Error::InvalidUri(uri.to_string()))
}

/// Sender for session management datagrams.
///
/// Owns an ephemeral UDP socket; one instance per Rpc. The send is
/// synchronous and expected to be non-blocking in practice.
pub struct SmSender {
    socket: UdpSocket,
    drop_prob: f64,
    rng: SmallRng,
    sent: u64,
    dropped: u64,
}

impl SmSender {
    /// Bind an ephemeral socket. `drop_prob` is the probability of
    /// silently discarding an outgoing datagram.
    pub fn new(drop_prob: f64) -> Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", 0))?;
        Ok(Self {
            socket,
            drop_prob,
            rng: SmallRng::from_entropy(),
            sent: 0,
            dropped: 0,
        })
    }

    /// Send a packet to a management URI, subject to drop injection.
    pub fn send(&mut self, pkt: &SmPkt, dest_uri: &str) -> Result<()> {
        if self.drop_prob > 0.0 && self.rng.gen::<f64>() < self.drop_prob {
            self.dropped += 1;
            debug!(
                pkt_type = ?pkt.pkt_type,
                dest = dest_uri,
                "drop injection discarded management packet"
            );
            return Ok(());
        }

        let addr = resolve_uri(dest_uri)?;
        self.socket.send_to(&pkt.to_bytes(), addr)?;
        self.sent += 1;
        Ok(())
    }

    /// Datagrams actually handed to the socket.
    #[inline]
    pub fn sent(&self) -> u64 {
        self.sent
    }

    /// Datagrams discarded by drop injection.
    #[inline]
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}
