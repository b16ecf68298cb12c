//! Session entity and the per-Rpc session vector.
//!
//! A session pairs two endpoint descriptors and is owned for life by the
//! Rpc that created it. The session vector is append-only: burying a
//! session leaves a tombstone so session numbers are never reused and
//! handlers can keep indexing by number.

use std::fmt;

use crate::config::MAX_SESSIONS_PER_THREAD;
use crate::sm::SessionMetadata;

/// Session state. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Connect request sent, response pending.
    ConnectInProgress,
    /// Established. The only state server-side sessions live in.
    Connected,
    /// Disconnect request sent, response pending.
    DisconnectInProgress,
    /// Transient state the session passes through for the disconnected
    /// callback.
    Disconnected,
    /// Terminal connect failure. Client-side only.
    Error,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::ConnectInProgress => "connect in progress",
            SessionState::Connected => "connected",
            SessionState::DisconnectInProgress => "disconnect in progress",
            SessionState::Disconnected => "disconnected",
            SessionState::Error => "error",
        };
        write!(f, "{}", s)
    }
}

/// Which side of the session this Rpc plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The endpoint that initiated the connect.
    Client,
    /// The endpoint that admitted the connect.
    Server,
}

/// Events delivered to the application's session management handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmEventType {
    /// The session reached `Connected`.
    Connected,
    /// Connection establishment failed; inspect the error kind.
    ConnectFailed,
    /// The session was torn down.
    Disconnected,
    /// Teardown failed.
    DisconnectFailed,
}

/// Handle naming a session within its owning Rpc. The wrapped value is the
/// local session number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionHandle(pub u32);

impl SessionHandle {
    /// The local session number.
    #[inline]
    pub fn session_num(&self) -> u32 {
        self.0
    }
}

/// A one-to-one session between two Rpc endpoints.
pub struct Session {
    /// The role of the local endpoint.
    pub role: Role,
    /// Management state.
    pub state: SessionState,
    /// Client-side endpoint descriptor.
    pub client: SessionMetadata,
    /// Server-side endpoint descriptor.
    pub server: SessionMetadata,
    /// Cycle timestamp of the last management request, used by the retry
    /// sweep.
    pub mgmt_req_tsc: u64,
    /// Cycle timestamp at which the current management exchange started,
    /// used for the absolute connect deadline.
    pub sm_start_tsc: u64,
    /// True if congestion control is enabled for this session.
    pub is_cc: bool,
}

impl Session {
    /// Create a session in the given role and initial state, with invalid
    /// metadata on both sides.
    pub fn new(role: Role, state: SessionState) -> Self {
        Self {
            role,
            state,
            client: SessionMetadata::new_invalid(),
            server: SessionMetadata::new_invalid(),
            mgmt_req_tsc: 0,
            sm_start_tsc: 0,
            is_cc: false,
        }
    }

    /// True if the local endpoint plays the client role.
    #[inline]
    pub fn is_client(&self) -> bool {
        self.role == Role::Client
    }

    /// True if the local endpoint plays the server role.
    #[inline]
    pub fn is_server(&self) -> bool {
        self.role == Role::Server
    }

    /// The descriptor owned by the local endpoint.
    #[inline]
    pub fn local_metadata(&self) -> &SessionMetadata {
        match self.role {
            Role::Client => &self.client,
            Role::Server => &self.server,
        }
    }

    /// The descriptor owned by the peer endpoint.
    #[inline]
    pub fn peer_metadata(&self) -> &SessionMetadata {
        match self.role {
            Role::Client => &self.server,
            Role::Server => &self.client,
        }
    }

    /// The session number the local endpoint knows this session by.
    #[inline]
    pub fn local_session_num(&self) -> u32 {
        self.local_metadata().session_num
    }

    /// Enable congestion control for this session.
    pub fn enable_congestion_control(&mut self) {
        self.is_cc = true;
    }

    /// Disable congestion control for this session.
    pub fn disable_congestion_control(&mut self) {
        self.is_cc = false;
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Session{{{:?}, {}, client: {}, server: {}}}",
            self.role,
            self.state,
            self.client.name(),
            self.server.name()
        )
    }
}

/// Append-only session vector indexed by local session number.
///
/// Buried sessions become `None` tombstones; indices are never reused.
/// Growth is bounded by [`MAX_SESSIONS_PER_THREAD`], at one pointer per
/// tombstone.
pub struct SessionVec {
    slots: Vec<Option<Box<Session>>>,
}

impl SessionVec {
    /// An empty session vector.
    pub fn new() -> Self {
        Self { slots: Vec::new() }
    }

    /// The session number the next [`SessionVec::push`] will assign.
    #[inline]
    pub fn next_session_num(&self) -> u32 {
        self.slots.len() as u32
    }

    /// True once the lifetime session bound is reached.
    #[inline]
    pub fn is_full(&self) -> bool {
        self.slots.len() >= MAX_SESSIONS_PER_THREAD
    }

    /// Append a session, returning its session number.
    ///
    /// The caller checks [`SessionVec::is_full`] first; pushing past the
    /// bound is a logic error.
    pub fn push(&mut self, session: Box<Session>) -> u32 {
        debug_assert!(!self.is_full());
        debug_assert_eq!(
            session.local_session_num(),
            self.next_session_num(),
            "session number must equal its slot index"
        );
        let num = self.slots.len() as u32;
        self.slots.push(Some(session));
        num
    }

    /// Shared access by session number.
    #[inline]
    pub fn get(&self, session_num: u32) -> Option<&Session> {
        self.slots
            .get(session_num as usize)
            .and_then(|s| s.as_deref())
    }

    /// Exclusive access by session number.
    #[inline]
    pub fn get_mut(&mut self, session_num: u32) -> Option<&mut Session> {
        self.slots
            .get_mut(session_num as usize)
            .and_then(|s| s.as_deref_mut())
    }

    /// Tombstone a slot, returning the buried session. The index remains
    /// allocated forever.
    pub fn bury(&mut self, session_num: u32) -> Option<Box<Session>> {
        self.slots.get_mut(session_num as usize).and_then(|s| s.take())
    }

    /// Find the server-side session admitted for the given client
    /// descriptor, if any. Used to answer duplicate connect requests.
    pub fn find_server_session(&self, client: &SessionMetadata) -> Option<&Session> {
        self.iter()
            .find(|s| s.is_server() && &s.client == client)
    }

    /// Number of live (non-tombstoned) sessions.
    pub fn active_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Number of sessions ever created, tombstones included.
    #[inline]
    pub fn total_created(&self) -> usize {
        self.slots.len()
    }

    /// Iterate over live sessions.
    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.slots.iter().filter_map(|s| s.as_deref())
    }
}

impl Default for SessionVec {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_session(session_num: u32) -> Box<Session> {
        let mut s = Box::new(Session::new(Role::Client, SessionState::ConnectInProgress));
        s.client.session_num = session_num;
        s
    }

    #[test]
    fn test_session_numbers_strictly_increase() {
        let mut vec = SessionVec::new();
        let a = vec.push(client_session(vec.next_session_num()));
        let b = vec.push(client_session(vec.next_session_num()));
        assert_eq!((a, b), (0, 1));

        // Burying never frees the index for reuse.
        vec.bury(a);
        let c = vec.push(client_session(vec.next_session_num()));
        assert_eq!(c, 2);
        assert!(vec.get(a).is_none());
        assert_eq!(vec.active_count(), 2);
        assert_eq!(vec.total_created(), 3);
    }

    #[test]
    fn test_bury_is_idempotent() {
        let mut vec = SessionVec::new();
        let num = vec.push(client_session(0));
        assert!(vec.bury(num).is_some());
        assert!(vec.bury(num).is_none());
        assert!(vec.bury(999).is_none());
    }

    #[test]
    fn test_local_and_peer_metadata() {
        let mut s = Session::new(Role::Server, SessionState::Connected);
        s.server.session_num = 4;
        s.client.session_num = 9;
        assert_eq!(s.local_session_num(), 4);
        assert_eq!(s.peer_metadata().session_num, 9);
        assert!(s.is_server());
    }

    #[test]
    fn test_find_server_session() {
        let mut vec = SessionVec::new();
        let mut server = Box::new(Session::new(Role::Server, SessionState::Connected));
        server.server.session_num = vec.next_session_num();
        server.client.set_hostname("client:31850").unwrap();
        server.client.app_tid = 2;
        server.client.session_num = 17;
        vec.push(server);

        let mut probe = SessionMetadata::new_invalid();
        probe.set_hostname("client:31850").unwrap();
        probe.app_tid = 2;
        probe.session_num = 17;
        assert!(vec.find_server_session(&probe).is_some());

        probe.session_num = 18;
        assert!(vec.find_server_session(&probe).is_none());
    }

    #[test]
    fn test_congestion_control_flag() {
        let mut s = Session::new(Role::Client, SessionState::Connected);
        assert!(!s.is_cc);
        s.enable_congestion_control();
        assert!(s.is_cc);
        s.disable_congestion_control();
        assert!(!s.is_cc);
    }
}
