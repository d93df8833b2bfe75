//! In-flight request table.
//!
//! Each request owns a [`PendingRequest`] guard; dropping the guard removes
//! its entry, so a timed-out or abandoned request never leaks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::oneshot;

use jobforge_protocol::{Reply, RequestId};

use crate::error::SupervisorError;

type Waiter = oneshot::Sender<Result<Reply, SupervisorError>>;

#[derive(Debug, Default)]
pub struct PendingRequests {
    next_id: AtomicU64,
    waiters: Mutex<HashMap<RequestId, Waiter>>,
}

impl PendingRequests {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn waiters(&self) -> MutexGuard<'_, HashMap<RequestId, Waiter>> {
        self.waiters.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Allocate a fresh id and a guard that awaits its reply.
    pub fn register(self: &Arc<Self>) -> PendingRequest {
        let id = RequestId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let (tx, rx) = oneshot::channel();
        self.waiters().insert(id, tx);
        PendingRequest {
            id,
            rx,
            owner: Arc::clone(self),
        }
    }

    /// Deliver a reply. Returns `false` when nobody is waiting for `id`
    /// (late reply after a timeout, or an unknown id).
    pub fn resolve(&self, id: RequestId, reply: Reply) -> bool {
        match self.waiters().remove(&id) {
            Some(waiter) => waiter.send(Ok(reply)).is_ok(),
            None => false,
        }
    }

    /// Fail every in-flight request with `error`. Returns how many were waiting.
    pub fn reject_all(&self, error: SupervisorError) -> usize {
        let drained: Vec<Waiter> = self.waiters().drain().map(|(_, w)| w).collect();
        let count = drained.len();
        for waiter in drained {
            let _ = waiter.send(Err(error.clone()));
        }
        count
    }

    pub fn len(&self) -> usize {
        self.waiters().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One request awaiting its reply.
#[derive(Debug)]
pub struct PendingRequest {
    id: RequestId,
    rx: oneshot::Receiver<Result<Reply, SupervisorError>>,
    owner: Arc<PendingRequests>,
}

impl PendingRequest {
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Wait up to `timeout` for the reply.
    pub async fn wait(mut self, timeout: Duration) -> Result<Reply, SupervisorError> {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(SupervisorError::WorkerCrash(
                "request dropped without a reply".to_string(),
            )),
            Err(_) => Err(SupervisorError::Timeout { after: timeout }),
        }
    }
}

impl Drop for PendingRequest {
    fn drop(&mut self) {
        self.owner.waiters().remove(&self.id);
    }
}
