//! Per-sender replay protection.
//!
//! A bounded window of recently seen nonces per sender, process-local only.
//! A restart clears it, which the threat model accepts: message ids stay
//! idempotent at the store layer regardless.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use murmure_shared::constants::REPLAY_WINDOW_PER_SENDER;

struct NonceWindow {
    seen: HashSet<String>,
    order: VecDeque<String>,
    cap: usize,
}

impl NonceWindow {
    fn new(cap: usize) -> Self {
        Self {
            seen: HashSet::new(),
            order: VecDeque::new(),
            cap,
        }
    }

    fn check_and_insert(&mut self, nonce: &str) -> bool {
        if self.seen.contains(nonce) {
            return false;
        }
        if self.order.len() >= self.cap {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        self.seen.insert(nonce.to_string());
        self.order.push_back(nonce.to_string());
        true
    }
}

/// Outer map is shared; each sender gets its own lock so a chatty peer never
/// serializes the rest.
pub struct ReplayGuard {
    senders: Mutex<HashMap<String, Arc<Mutex<NonceWindow>>>>,
    cap: usize,
}

impl Default for ReplayGuard {
    fn default() -> Self {
        Self::with_capacity(REPLAY_WINDOW_PER_SENDER)
    }
}

impl ReplayGuard {
    pub fn with_capacity(cap: usize) -> Self {
        Self {
            senders: Mutex::new(HashMap::new()),
            cap,
        }
    }

    /// Atomically record the nonce. `false` means it was already seen.
    pub fn check_and_insert(&self, sender_fp: &str, nonce: &str) -> bool {
        let window = {
            let mut senders = self.senders.lock().expect("replay map lock");
            senders
                .entry(sender_fp.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(NonceWindow::new(self.cap))))
                .clone()
        };

        let mut window = window.lock().expect("replay window lock");
        window.check_and_insert(nonce)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_nonce_rejected() {
        let guard = ReplayGuard::default();
        assert!(guard.check_and_insert("A", "n1"));
        assert!(!guard.check_and_insert("A", "n1"));
        assert!(guard.check_and_insert("A", "n2"));
    }

    #[test]
    fn windows_are_per_sender() {
        let guard = ReplayGuard::default();
        assert!(guard.check_and_insert("A", "n1"));
        assert!(guard.check_and_insert("B", "n1"));
    }

    #[test]
    fn window_is_bounded() {
        let guard = ReplayGuard::with_capacity(3);
        for i in 0..4 {
            assert!(guard.check_and_insert("A", &format!("n{i}")));
        }
        // n0 was evicted by n3 and is acceptable again
        assert!(guard.check_and_insert("A", "n0"));
        // n3 is still in the window
        assert!(!guard.check_and_insert("A", "n3"));
    }
}
