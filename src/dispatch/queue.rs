use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::model::ExecutionFlow;

/// Producer side of the dispatch queue.
///
/// Cloned into every component that submits work: the RPC service, each cron
/// trigger, and the dispatch worker itself for re-queues. Flows are appended
/// at the tail; there are no priorities.
#[derive(Debug, Clone)]
pub struct DispatchQueue {
    tx: mpsc::UnboundedSender<ExecutionFlow>,
    depth: Arc<AtomicUsize>,
}

/// Consumer side, owned by the single dispatch worker.
#[derive(Debug)]
pub struct DispatchReceiver {
    rx: mpsc::UnboundedReceiver<ExecutionFlow>,
    depth: Arc<AtomicUsize>,
}

impl DispatchQueue {
    pub fn new() -> (Self, DispatchReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let depth = Arc::new(AtomicUsize::new(0));
        (
            Self {
                tx,
                depth: depth.clone(),
            },
            DispatchReceiver { rx, depth },
        )
    }

    /// Append a flow. Returns false once the consumer is gone; the flow is
    /// still persisted and is picked up by startup recovery.
    pub fn push(&self, flow: ExecutionFlow) -> bool {
        let exec_id = flow.id;
        self.depth.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(flow).is_err() {
            self.depth.fetch_sub(1, Ordering::SeqCst);
            tracing::warn!(exec_id, "Dispatch queue closed, flow not enqueued");
            return false;
        }
        tracing::debug!(exec_id, "Flow enqueued for dispatch");
        true
    }

    /// Number of flows waiting to be dequeued.
    pub fn len(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DispatchReceiver {
    /// Wait for the next flow. `None` once every producer is dropped.
    pub async fn recv(&mut self) -> Option<ExecutionFlow> {
        let flow = self.rx.recv().await;
        if flow.is_some() {
            self.depth.fetch_sub(1, Ordering::SeqCst);
        }
        flow
    }

    /// Non-blocking dequeue.
    pub fn try_recv(&mut self) -> Option<ExecutionFlow> {
        let flow = self.rx.try_recv().ok();
        if flow.is_some() {
            self.depth.fetch_sub(1, Ordering::SeqCst);
        }
        flow
    }

    /// Drain everything currently queued.
    pub fn drain(&mut self) -> Vec<ExecutionFlow> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }

    pub fn len(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
