//! The sequence allocator: three watermarks shared across every running
//! [`crate::vm::Vm`], plus the condition-variable "dock" evals block on
//! while waiting their turn to commit or retire (spec §4.C, §9 "Coroutine-
//! shaped control flow").

use tokio::sync::{Mutex, Notify};

/// The durable, monotonically assigned primary key of the event log.
pub type SequenceNumber = u64;

#[derive(Debug, Clone, Copy, Default)]
struct Watermarks {
    uncommitted: SequenceNumber,
    committed: SequenceNumber,
    retired: SequenceNumber,
}

/// The three-watermark sequence dock (spec §4.C, §5 "Shared resources").
///
/// `retired ≤ committed ≤ uncommitted` is maintained at all times (spec
/// invariant 2); `max(assigned)` is tracked separately by
/// [`crate::registry::EvalRegistry`] since an Eval that faults between
/// allocate and commit never advances these watermarks itself.
pub struct SequenceDock {
    watermarks: Mutex<Watermarks>,
    notify: Notify,
}

impl SequenceDock {
    /// Construct a dock whose watermarks start at `baseline` — the largest
    /// durable index found in the log at startup (spec §6 "Persisted state
    /// layout").
    pub fn new(baseline: SequenceNumber) -> Self {
        Self {
            watermarks: Mutex::new(Watermarks {
                uncommitted: baseline,
                committed: baseline,
                retired: baseline,
            }),
            notify: Notify::new(),
        }
    }

    /// Allocate the next sequence for a non-ephemeral eval (spec §4.C
    /// allocation protocol, step 1–3): `s = max(registry_max + 1, committed
    /// + 1)`, then `uncommitted := s`.
    pub async fn allocate(&self, registry_max: SequenceNumber) -> SequenceNumber {
        let mut w = self.watermarks.lock().await;
        let s = (registry_max + 1).max(w.committed + 1);
        w.uncommitted = s;
        s
    }

    /// Block until `seq` is the immediate successor of `committed` — i.e.
    /// every eval with a smaller sequence has already committed (spec §4.C
    /// commit protocol, strict FIFO tie-break).
    pub async fn wait_for_commit_turn(&self, seq: SequenceNumber) {
        self.wait_until(seq, |w| w.committed).await;
    }

    /// Advance `committed` to `seq` and wake every waiter (called after
    /// `txn.commit()` succeeds, or — if the wait was interrupted before
    /// commit — to release the barrier without ever having written
    /// anything, so later sequences are never blocked by one that faulted).
    pub async fn advance_committed(&self, seq: SequenceNumber) {
        let mut w = self.watermarks.lock().await;
        if seq > w.committed {
            w.committed = seq;
        }
        drop(w);
        self.notify.notify_waiters();
    }

    /// Block until `seq` is the immediate successor of `retired`.
    pub async fn wait_for_retire_turn(&self, seq: SequenceNumber) {
        self.wait_until(seq, |w| w.retired).await;
    }

    /// Advance `retired` to `seq` and wake every waiter.
    pub async fn advance_retired(&self, seq: SequenceNumber) {
        let mut w = self.watermarks.lock().await;
        if seq > w.retired {
            w.retired = seq;
        }
        drop(w);
        self.notify.notify_waiters();
    }

    /// The current `(uncommitted, committed, retired)` triple, mostly for
    /// diagnostics and tests.
    pub async fn watermarks(&self) -> (SequenceNumber, SequenceNumber, SequenceNumber) {
        let w = self.watermarks.lock().await;
        (w.uncommitted, w.committed, w.retired)
    }

    async fn wait_until(&self, seq: SequenceNumber, field: impl Fn(&Watermarks) -> SequenceNumber) {
        loop {
            let notified = self.notify.notified();
            {
                let w = self.watermarks.lock().await;
                if field(&w) + 1 >= seq {
                    return;
                }
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn allocate_advances_uncommitted_and_respects_committed_floor() {
        let dock = SequenceDock::new(0);
        assert_eq!(dock.allocate(0).await, 1);
        dock.advance_committed(1).await;
        assert_eq!(dock.allocate(0).await, 2);
    }

    #[tokio::test]
    async fn allocate_resumes_from_baseline() {
        let dock = SequenceDock::new(41);
        assert_eq!(dock.allocate(0).await, 42);
    }

    #[tokio::test]
    async fn commit_turn_waits_for_predecessor() {
        let dock = Arc::new(SequenceDock::new(0));
        let d2 = dock.clone();
        let second = tokio::spawn(async move {
            d2.wait_for_commit_turn(2).await;
            d2.advance_committed(2).await;
        });

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert_eq!(dock.watermarks().await.1, 0);

        dock.wait_for_commit_turn(1).await;
        dock.advance_committed(1).await;
        second.await.unwrap();
        assert_eq!(dock.watermarks().await.1, 2);
    }

    #[tokio::test]
    async fn retire_turn_enforces_strict_fifo() {
        let dock = Arc::new(SequenceDock::new(0));
        let order = Arc::new(tokio::sync::Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for seq in (1..=3).rev() {
            let dock = dock.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                dock.wait_for_retire_turn(seq).await;
                order.lock().await.push(seq);
                dock.advance_retired(seq).await;
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(*order.lock().await, vec![1, 2, 3]);
    }
}
