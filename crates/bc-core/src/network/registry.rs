//! Connection Accounting
//!
//! Tracks every connection from the moment it is admitted until it closes.
//! Handshaking connections count towards `total` only; established ones also
//! sit in an unordered list with O(1) insertion and swap-with-last removal.

use std::collections::{HashMap, HashSet};

/// Manager-local identifier of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Point-in-time connection counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counts {
    /// Admitted connections, handshaking or established
    pub total: usize,
    /// Connections that completed their handshake
    pub connected: usize,
}

impl Counts {
    /// Connections still handshaking
    pub fn connecting(&self) -> usize {
        self.total - self.connected
    }
}

/// Registry of in-flight and established connections
#[derive(Debug, Default)]
pub struct Registry {
    next_id: u64,
    pending: HashSet<ConnectionId>,
    established: Vec<ConnectionId>,
    positions: HashMap<ConnectionId, usize>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a new connection in the handshaking state
    pub fn open(&mut self) -> ConnectionId {
        let id = ConnectionId(self.next_id);
        self.next_id += 1;
        self.pending.insert(id);
        id
    }

    /// Whether `id` is admitted and still handshaking
    pub fn is_pending(&self, id: ConnectionId) -> bool {
        self.pending.contains(&id)
    }

    pub fn is_established(&self, id: ConnectionId) -> bool {
        self.positions.contains_key(&id)
    }

    /// Move a handshaking connection to the established list.
    ///
    /// Returns false if the connection already closed or was established before.
    pub fn establish(&mut self, id: ConnectionId) -> bool {
        if !self.pending.remove(&id) {
            return false;
        }
        self.positions.insert(id, self.established.len());
        self.established.push(id);
        true
    }

    /// Record the close of a connection.
    ///
    /// Only the first close of an id has an effect; later calls return false.
    pub fn close(&mut self, id: ConnectionId) -> bool {
        if self.pending.remove(&id) {
            return true;
        }

        let Some(index) = self.positions.remove(&id) else {
            return false;
        };
        self.established.swap_remove(index);
        if let Some(moved) = self.established.get(index) {
            self.positions.insert(*moved, index);
        }
        true
    }

    /// Established connections, in no particular order
    pub fn established(&self) -> &[ConnectionId] {
        &self.established
    }

    pub fn counts(&self) -> Counts {
        Counts {
            total: self.pending.len() + self.established.len(),
            connected: self.established.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_open_counts_as_connecting() {
        let mut registry = Registry::new();
        registry.open();
        registry.open();

        let counts = registry.counts();
        assert_eq!(counts.total, 2);
        assert_eq!(counts.connected, 0);
        assert_eq!(counts.connecting(), 2);
    }

    #[test]
    fn test_establish_then_close() {
        let mut registry = Registry::new();
        let id = registry.open();

        assert!(registry.establish(id));
        assert!(registry.is_established(id));
        assert_eq!(registry.counts().connected, 1);

        assert!(registry.close(id));
        assert_eq!(registry.counts(), Counts::default());
    }

    #[test]
    fn test_close_is_counted_once() {
        let mut registry = Registry::new();
        let a = registry.open();
        let b = registry.open();
        registry.establish(a);

        assert!(registry.close(a));
        assert!(!registry.close(a));
        assert!(registry.close(b));
        assert!(!registry.close(b));
        assert_eq!(registry.counts().total, 0);
    }

    #[test]
    fn test_establish_after_close_is_refused() {
        let mut registry = Registry::new();
        let id = registry.open();
        registry.close(id);

        assert!(!registry.establish(id));
        assert_eq!(registry.counts(), Counts::default());
    }

    #[test]
    fn test_swap_remove_keeps_positions() {
        let mut registry = Registry::new();
        let ids: Vec<_> = (0..4).map(|_| registry.open()).collect();
        for id in &ids {
            registry.establish(*id);
        }

        // Removing the first moves the last into its slot
        registry.close(ids[0]);
        registry.close(ids[3]);

        let mut left = registry.established().to_vec();
        left.sort();
        assert_eq!(left, vec![ids[1], ids[2]]);
        assert!(registry.close(ids[2]));
        assert_eq!(registry.established(), &[ids[1]]);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Open,
        Establish(usize),
        Close(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            Just(Op::Open),
            (0usize..32).prop_map(Op::Establish),
            (0usize..32).prop_map(Op::Close),
        ]
    }

    proptest! {
        #[test]
        fn test_counters_hold_under_interleavings(ops in proptest::collection::vec(op(), 0..200)) {
            let mut registry = Registry::new();
            let mut ids = Vec::new();
            let mut live = HashSet::new();
            let mut established = HashSet::new();

            for op in ops {
                match op {
                    Op::Open => {
                        let id = registry.open();
                        ids.push(id);
                        live.insert(id);
                    }
                    Op::Establish(i) if !ids.is_empty() => {
                        let id = ids[i % ids.len()];
                        let expected = live.contains(&id) && !established.contains(&id);
                        prop_assert_eq!(registry.establish(id), expected);
                        if expected {
                            established.insert(id);
                        }
                    }
                    Op::Close(i) if !ids.is_empty() => {
                        let id = ids[i % ids.len()];
                        prop_assert_eq!(registry.close(id), live.remove(&id));
                        established.remove(&id);
                    }
                    _ => {}
                }

                let counts = registry.counts();
                prop_assert_eq!(counts.total, live.len());
                prop_assert_eq!(counts.connected, established.len());
                prop_assert_eq!(counts.connected, registry.established().len());
                prop_assert_eq!(counts.connecting(), counts.total - counts.connected);
            }
        }
    }
}
