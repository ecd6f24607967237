//! Per-kind serialization.

use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::entity::EntityKind;

/// One lock per entity kind, created up front.
///
/// Matching and merging for a kind happen under its lock, so two runs never
/// interleave clusters of the same kind. Different kinds proceed in parallel
/// and only meet at the store's writer lock.
#[derive(Debug)]
pub struct KindLocks {
    locks: [Mutex<()>; EntityKind::ALL.len()],
}

impl Default for KindLocks {
    fn default() -> Self {
        Self::new()
    }
}

impl KindLocks {
    /// One unlocked mutex per kind.
    #[must_use]
    pub fn new() -> Self {
        Self {
            locks: std::array::from_fn(|_| Mutex::new(())),
        }
    }

    /// Blocks until `kind` is free.
    ///
    /// A lock poisoned by a panicking holder is taken over; it guards no data.
    pub fn lock(&self, kind: EntityKind) -> MutexGuard<'_, ()> {
        self.locks[kind as usize]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_same_kind_is_serialized() {
        let locks = Arc::new(KindLocks::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let (locks, inside, max_seen) = (locks.clone(), inside.clone(), max_seen.clone());
                thread::spawn(move || {
                    let _guard = locks.lock(EntityKind::System);
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(5));
                    inside.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_every_kind_has_its_own_slot() {
        for (i, kind) in EntityKind::ALL.iter().enumerate() {
            assert_eq!(*kind as usize, i);
        }
    }

    #[test]
    fn test_different_kinds_do_not_block() {
        let locks = KindLocks::new();
        let _system = locks.lock(EntityKind::System);
        let _pain = locks.lock(EntityKind::PainPoint);
    }
}
