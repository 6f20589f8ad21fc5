//! Ring event delegation.
//!
//! User-visible ring events are funneled through a single-consumer channel
//! so delegate callbacks never race with ring internals and never run
//! concurrently with each other. A panicking delegate is caught and logged;
//! it must not destabilize the ring.

use crate::types::Vnode;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

/// Capacity of the delegate event queue.
pub(crate) const DELEGATE_QUEUE_DEPTH: usize = 32;

/// Callbacks invoked on ring membership events.
///
/// All callbacks run on one dedicated task, in event order.
pub trait RingDelegate: Send + Sync + 'static {
    /// A local vnode adopted a new predecessor.
    fn new_predecessor(&self, local: &Vnode, new_pred: &Vnode, prev_pred: Option<&Vnode>);

    /// A local vnode is leaving the ring.
    fn leaving(&self, local: &Vnode, pred: Option<&Vnode>, succ: Option<&Vnode>);

    /// A remote predecessor announced it is leaving.
    fn predecessor_leaving(&self, local: &Vnode, remote: &Vnode);

    /// A remote successor announced it is leaving.
    fn successor_leaving(&self, local: &Vnode, remote: &Vnode);

    /// The ring is shutting down; the last event delivered.
    fn shutdown(&self);
}

/// An event queued for the delegate task.
#[derive(Debug, Clone)]
pub(crate) enum DelegateEvent {
    NewPredecessor {
        local: Vnode,
        new_pred: Vnode,
        prev_pred: Option<Vnode>,
    },
    Leaving {
        local: Vnode,
        pred: Option<Vnode>,
        succ: Option<Vnode>,
    },
    PredecessorLeaving {
        local: Vnode,
        remote: Vnode,
    },
    SuccessorLeaving {
        local: Vnode,
        remote: Vnode,
    },
    Shutdown,
}

/// Spawn the single consumer that serializes delegate callbacks.
///
/// The task drains the queue until the channel closes; the ring enqueues
/// [`DelegateEvent::Shutdown`] and drops its sender to stop it.
pub(crate) fn spawn_dispatcher(
    delegate: Arc<dyn RingDelegate>,
    mut rx: mpsc::Receiver<DelegateEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            safe_invoke(&*delegate, event);
        }
        debug!("delegate dispatcher stopped");
    })
}

fn safe_invoke(delegate: &dyn RingDelegate, event: DelegateEvent) {
    let result = catch_unwind(AssertUnwindSafe(|| match &event {
        DelegateEvent::NewPredecessor {
            local,
            new_pred,
            prev_pred,
        } => delegate.new_predecessor(local, new_pred, prev_pred.as_ref()),
        DelegateEvent::Leaving { local, pred, succ } => {
            delegate.leaving(local, pred.as_ref(), succ.as_ref())
        }
        DelegateEvent::PredecessorLeaving { local, remote } => {
            delegate.predecessor_leaving(local, remote)
        }
        DelegateEvent::SuccessorLeaving { local, remote } => {
            delegate.successor_leaving(local, remote)
        }
        DelegateEvent::Shutdown => delegate.shutdown(),
    }));

    if result.is_err() {
        error!(?event, "caught a panic invoking a delegate callback");
    }
}
