//! Doubly-linked list of live sessions with a configurable cap and
//! oldest-first eviction, mirroring the registry shape implied by
//! `hev-socks5-tunnel.c`'s session bookkeeping (`session_list`,
//! `session_list_insert`/`session_list_remove`-style use).
//!
//! Eviction here only *marks* the oldest session for termination: the
//! registry has no way to actually stop a `TcpSession`/`UdpSession` body
//! short of the session noticing on its own. No cancellation mechanism
//! beyond that mark is implemented.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

pub fn next_session_id() -> u64 {
    NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed)
}

/// Shared per-session "please stop" flag. The session body is expected to
/// check this between I/O operations; nothing in the registry forces it.
#[derive(Clone)]
pub struct TerminationFlag(Arc<AtomicBool>);

impl TerminationFlag {
    pub fn new() -> Self {
        TerminationFlag(Arc::new(AtomicBool::new(false)))
    }

    pub fn mark(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_marked(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

impl Default for TerminationFlag {
    fn default() -> Self {
        Self::new()
    }
}

struct Entry {
    session_id: u64,
    termination: TerminationFlag,
}

struct State {
    entries: VecDeque<Entry>,
}

/// Registry of live sessions, capped at `max_sessions` (`0` disables the
/// cap). Insertion is always at the tail; eviction always targets the head.
pub struct SessionRegistry {
    max_sessions: usize,
    state: Mutex<State>,
}

impl SessionRegistry {
    pub fn new(max_sessions: usize) -> Self {
        SessionRegistry {
            max_sessions,
            state: Mutex::new(State {
                entries: VecDeque::new(),
            }),
        }
    }

    /// Register a session, returning the `TerminationFlag` it should poll.
    /// If the registry is over capacity after this insert, the oldest
    /// session (not this one, unless it is the only entry) is marked.
    pub fn insert(&self, session_id: u64) -> TerminationFlag {
        let mut state = self.state.lock().unwrap();
        let termination = TerminationFlag::new();
        state.entries.push_back(Entry {
            session_id,
            termination: termination.clone(),
        });

        if self.max_sessions > 0 && state.entries.len() > self.max_sessions {
            if let Some(victim) = state.entries.front() {
                tracing::warn!(
                    session_id = victim.session_id,
                    max_sessions = self.max_sessions,
                    "session registry over capacity, marking oldest session"
                );
                victim.termination.mark();
            }
        }

        termination
    }

    pub fn remove(&self, session_id: u64) {
        let mut state = self.state.lock().unwrap();
        if let Some(pos) = state.entries.iter().position(|e| e.session_id == session_id) {
            state.entries.remove(pos);
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drain every entry, used on orchestrator shutdown.
    pub fn clear(&self) {
        self.state.lock().unwrap().entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_remove_track_length() {
        let registry = SessionRegistry::new(0);
        registry.insert(1);
        registry.insert(2);
        assert_eq!(registry.len(), 2);
        registry.remove(1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn capacity_overflow_marks_oldest_for_termination_only() {
        let registry = SessionRegistry::new(2);
        let first = registry.insert(1);
        registry.insert(2);
        registry.insert(3);

        assert!(first.is_marked());
        // The registry does not itself remove the victim.
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn zero_cap_disables_eviction() {
        let registry = SessionRegistry::new(0);
        let flags: Vec<_> = (0..50).map(|i| registry.insert(i)).collect();
        assert!(flags.iter().all(|f| !f.is_marked()));
    }
}
