//! Configuration types and session-management constants.

/// Maximum number of sessions (client and server combined) one Rpc can
/// create over its lifetime. The session vector is append-only, so this
/// also bounds its length.
pub const MAX_SESSIONS_PER_THREAD: usize = 1024;

const _: () = assert!(
    MAX_SESSIONS_PER_THREAD < u32::MAX as usize,
    "session numbers must fit in 32 bits"
);

/// Maximum number of fabric ports one Rpc can manage.
pub const MAX_FAB_DEV_PORTS: usize = 8;

/// Retransmission interval for in-flight session management requests, in
/// milliseconds. Retries are uniform; there is no backoff.
pub const SESSION_MGMT_RETRANS_MS: u64 = 5;

/// Absolute deadline for connection establishment, in milliseconds. A
/// connect still in progress past this bound fails with a timeout.
pub const SESSION_MGMT_TIMEOUT_MS: u64 = 50;

/// Default management UDP port.
pub const DEFAULT_MGMT_UDP_PORT: u16 = 31850;

/// Control-channel configuration shared by the Nexus and its Rpcs.
#[derive(Debug, Clone)]
pub struct UdpConfig {
    /// UDP port the Nexus listens on for session management packets.
    pub mgmt_udp_port: u16,
    /// Probability of dropping an outgoing management datagram, for fault
    /// injection. 0.0 disables injection.
    pub drop_prob: f64,
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            mgmt_udp_port: DEFAULT_MGMT_UDP_PORT,
            drop_prob: 0.0,
        }
    }
}

impl UdpConfig {
    /// Create a config for the given management port.
    pub fn new(mgmt_udp_port: u16) -> Self {
        Self {
            mgmt_udp_port,
            drop_prob: 0.0,
        }
    }

    /// Set the datagram drop probability.
    pub fn with_drop_prob(mut self, drop_prob: f64) -> Self {
        debug_assert!((0.0..1.0).contains(&drop_prob));
        self.drop_prob = drop_prob;
        self
    }
}
