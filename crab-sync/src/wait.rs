//! One-shot suspend/resume primitive.
//!
//! A [`WaitSlot`] is held by the blocked caller, its [`Resolver`] by whoever
//! will produce the outcome. `Resolver::resolve` consumes the resolver, so a
//! slot can be resolved at most once.

use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::{InvariantViolation, SyncError, SyncResult};

/// Outcome delivered through a slot. Connect and subscription readiness
/// resolve with `Value::Null`.
pub type Outcome = SyncResult<Value>;

/// Receiving half: the caller suspends on it exactly once
#[derive(Debug)]
pub struct WaitSlot {
    rx: oneshot::Receiver<Outcome>,
}

/// Resolving half
#[derive(Debug)]
pub struct Resolver {
    tx: oneshot::Sender<Outcome>,
}

impl WaitSlot {
    pub fn new() -> (WaitSlot, Resolver) {
        let (tx, rx) = oneshot::channel();
        (WaitSlot { rx }, Resolver { tx })
    }

    /// Block the current thread until the slot resolves.
    ///
    /// Must not be called from inside an async runtime.
    pub fn wait(self) -> Outcome {
        match self.rx.blocking_recv() {
            Ok(outcome) => outcome,
            Err(_) => Err(InvariantViolation::SlotDropped.into()),
        }
    }
}

impl Resolver {
    /// Deliver the outcome. Fails with `SlotAbandoned` if the waiter is gone.
    pub fn resolve(self, outcome: Outcome) -> SyncResult<()> {
        self.tx
            .send(outcome)
            .map_err(|_| SyncError::Invariant(InvariantViolation::SlotAbandoned))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_resolve_from_other_thread() {
        let (slot, resolver) = WaitSlot::new();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            resolver.resolve(Ok(serde_json::json!(42))).unwrap();
        });

        assert_eq!(slot.wait().unwrap(), serde_json::json!(42));
        handle.join().unwrap();
    }

    #[test]
    fn test_failure_outcome() {
        let (slot, resolver) = WaitSlot::new();
        resolver.resolve(Err(SyncError::ConnectionLost)).unwrap();
        assert_eq!(slot.wait(), Err(SyncError::ConnectionLost));
    }

    #[test]
    fn test_dropped_resolver_wakes_waiter() {
        let (slot, resolver) = WaitSlot::new();
        drop(resolver);
        assert_eq!(
            slot.wait().unwrap_err().invariant(),
            Some(InvariantViolation::SlotDropped)
        );
    }

    #[test]
    fn test_abandoned_slot() {
        let (slot, resolver) = WaitSlot::new();
        drop(slot);
        assert_eq!(
            resolver.resolve(Ok(Value::Null)),
            Err(SyncError::Invariant(InvariantViolation::SlotAbandoned))
        );
    }
}
