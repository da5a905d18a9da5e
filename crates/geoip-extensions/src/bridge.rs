//! Host side of the promise bridge.
//!
//! A capability call registers a pending operation and returns its id to
//! the prelude, which parks a promise under that id. The real work runs on
//! the Tokio runtime; its outcome travels back over the worker channel as a
//! [`Settlement`] and is applied on the interpreter thread.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::future::Future;
use std::sync::mpsc;

use serde_json::Value;
use tokio::runtime::Handle;
use tracing::debug;

use crate::sandbox::WorkerMessage;

/// Resolved value (already JSON) or rejection message.
pub(crate) type OpOutcome = Result<Option<Value>, String>;

/// Identifies a host-side pending operation. Exposed to scripts as a number.
pub(crate) type OpId = u64;

/// Owner of an operation: the call that started it, or `0` for bootstrap.
pub(crate) type CallId = u64;

#[derive(Debug)]
pub(crate) struct Settlement {
    pub op_id: OpId,
    pub outcome: Result<Option<String>, String>,
}

/// Single-use completion handle for one pending operation.
///
/// Dropping an unsettled handle rejects the operation, so a panicking
/// background task cannot leave a promise pending forever.
pub(crate) struct Settler {
    op_id: OpId,
    sender: Option<mpsc::Sender<WorkerMessage>>,
}

impl Settler {
    pub(crate) fn settle(mut self, outcome: OpOutcome) {
        self.deliver(outcome);
    }

    fn deliver(&mut self, outcome: OpOutcome) {
        let Some(sender) = self.sender.take() else {
            return;
        };
        let outcome = match outcome {
            Ok(None) => Ok(None),
            Ok(Some(value)) => serde_json::to_string(&value)
                .map(Some)
                .map_err(|error| format!("failed to encode operation result: {error}")),
            Err(message) => Err(message),
        };
        // The worker may already be gone during shutdown.
        let _ = sender.send(WorkerMessage::Settled(Settlement {
            op_id: self.op_id,
            outcome,
        }));
    }
}

impl Drop for Settler {
    fn drop(&mut self) {
        if self.sender.is_some() {
            self.deliver(Err("host operation was cancelled".to_string()));
        }
    }
}

/// Per-interpreter registry of pending operations. Lives on the worker
/// thread only.
pub(crate) struct AsyncBridge {
    sender: mpsc::Sender<WorkerMessage>,
    runtime: Handle,
    next_op_id: Cell<OpId>,
    current_call: Cell<CallId>,
    outstanding: RefCell<HashMap<OpId, CallId>>,
}

impl AsyncBridge {
    pub(crate) fn new(sender: mpsc::Sender<WorkerMessage>, runtime: Handle) -> Self {
        Self {
            sender,
            runtime,
            next_op_id: Cell::new(1),
            current_call: Cell::new(0),
            outstanding: RefCell::new(HashMap::new()),
        }
    }

    /// Attributes operations started from now on to `call_id`; returns the
    /// previous owner so nested entries can restore it.
    pub(crate) fn enter_call(&self, call_id: CallId) -> CallId {
        self.current_call.replace(call_id)
    }

    pub(crate) fn outstanding_for(&self, call_id: CallId) -> usize {
        self.outstanding
            .borrow()
            .values()
            .filter(|owner| **owner == call_id)
            .count()
    }

    fn register(&self) -> Settler {
        let op_id = self.next_op_id.get();
        self.next_op_id.set(op_id + 1);
        self.outstanding
            .borrow_mut()
            .insert(op_id, self.current_call.get());
        Settler {
            op_id,
            sender: Some(self.sender.clone()),
        }
    }

    /// Runs `operation` on the Tokio runtime and settles with its outcome.
    pub(crate) fn spawn<F>(&self, operation: F) -> OpId
    where
        F: Future<Output = OpOutcome> + Send + 'static,
    {
        let settler = self.register();
        let op_id = settler.op_id;
        self.runtime.spawn(async move {
            settler.settle(operation.await);
        });
        op_id
    }

    /// Runs blocking work (SQLite) on the runtime's blocking pool.
    pub(crate) fn spawn_blocking<F>(&self, operation: F) -> OpId
    where
        F: FnOnce() -> OpOutcome + Send + 'static,
    {
        let settler = self.register();
        let op_id = settler.op_id;
        self.runtime.spawn_blocking(move || {
            settler.settle(operation());
        });
        op_id
    }

    /// Rejects immediately; still delivered through the channel so the
    /// script observes it asynchronously like every other settlement.
    pub(crate) fn reject(&self, message: impl Into<String>) -> OpId {
        let settler = self.register();
        let op_id = settler.op_id;
        settler.settle(Err(message.into()));
        op_id
    }

    /// Claims a settlement. Returns the owning call, or `None` when the
    /// operation is unknown or was already settled.
    pub(crate) fn claim(&self, op_id: OpId) -> Option<CallId> {
        let owner = self.outstanding.borrow_mut().remove(&op_id);
        if owner.is_none() {
            debug!(op_id, "ignoring settlement for unknown operation");
        }
        owner
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::time::Duration;

    use serde_json::json;

    use super::AsyncBridge;
    use crate::sandbox::WorkerMessage;

    fn recv_settlement(receiver: &mpsc::Receiver<WorkerMessage>) -> super::Settlement {
        match receiver
            .recv_timeout(Duration::from_secs(5))
            .expect("settlement delivered")
        {
            WorkerMessage::Settled(settlement) => settlement,
            _ => panic!("expected a settlement message"),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unit_async_bridge_settles_each_operation_once() {
        let (sender, receiver) = mpsc::channel();
        let bridge = AsyncBridge::new(sender, tokio::runtime::Handle::current());

        bridge.enter_call(7);
        let op_id = bridge.spawn(async { Ok(Some(json!({"ok": true}))) });
        assert_eq!(bridge.outstanding_for(7), 1);

        let settlement = tokio::task::spawn_blocking(move || recv_settlement(&receiver))
            .await
            .expect("join receiver");
        assert_eq!(settlement.op_id, op_id);
        assert_eq!(settlement.outcome, Ok(Some("{\"ok\":true}".to_string())));

        assert_eq!(bridge.claim(op_id), Some(7));
        assert_eq!(bridge.claim(op_id), None);
        assert_eq!(bridge.outstanding_for(7), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn regression_async_bridge_rejects_when_background_task_panics() {
        let (sender, receiver) = mpsc::channel();
        let bridge = AsyncBridge::new(sender, tokio::runtime::Handle::current());

        let op_id = bridge.spawn_blocking(|| panic!("boom"));
        let settlement = tokio::task::spawn_blocking(move || recv_settlement(&receiver))
            .await
            .expect("join receiver");
        assert_eq!(settlement.op_id, op_id);
        assert_eq!(
            settlement.outcome,
            Err("host operation was cancelled".to_string())
        );
    }
}
