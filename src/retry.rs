//! Retry queue for in-flight session management requests.
//!
//! The queue holds the session numbers of client sessions whose connect or
//! disconnect request is awaiting a response. It is small and unordered; a
//! session appears at most once, and only while its state is one of the
//! `*InProgress` states. Timestamps live on the sessions themselves, so
//! the queue is a plain membership set.

/// Per-Rpc queue of sessions with an in-flight management request.
#[derive(Debug, Default)]
pub struct RetryQueue {
    session_nums: Vec<u32>,
}

impl RetryQueue {
    /// An empty queue.
    pub fn new() -> Self {
        Self {
            session_nums: Vec::new(),
        }
    }

    /// True if the session has an in-flight management request.
    #[inline]
    pub fn contains(&self, session_num: u32) -> bool {
        self.session_nums.contains(&session_num)
    }

    /// Add a session. The caller guarantees the session is client-role and
    /// not already queued.
    pub fn add(&mut self, session_num: u32) {
        debug_assert!(!self.contains(session_num));
        self.session_nums.push(session_num);
    }

    /// Remove a session. Returns whether it was present.
    pub fn remove(&mut self, session_num: u32) -> bool {
        match self.session_nums.iter().position(|&n| n == session_num) {
            Some(idx) => {
                self.session_nums.swap_remove(idx);
                true
            }
            None => false,
        }
    }

    /// Number of queued sessions.
    #[inline]
    pub fn len(&self) -> usize {
        self.session_nums.len()
    }

    /// True if nothing is in flight.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.session_nums.is_empty()
    }

    /// Snapshot of the queued session numbers. The sweep iterates over a
    /// copy because handlers may remove entries mid-pass.
    pub fn snapshot(&self) -> Vec<u32> {
        self.session_nums.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_remove() {
        let mut q = RetryQueue::new();
        assert!(q.is_empty());

        q.add(3);
        q.add(7);
        assert_eq!(q.len(), 2);
        assert!(q.contains(3));
        assert!(q.contains(7));

        assert!(q.remove(3));
        assert!(!q.contains(3));
        assert!(!q.remove(3));
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_snapshot_is_detached() {
        let mut q = RetryQueue::new();
        q.add(1);
        q.add(2);
        let snap = q.snapshot();
        q.remove(1);
        assert_eq!(snap.len(), 2);
        assert_eq!(q.len(), 1);
    }
}
