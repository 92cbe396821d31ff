// src/messaging/readiness.rs

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Mutex;

use futures::future::BoxFuture;
use tokio::sync::oneshot;

use super::lock;
use crate::errors::{HutchError, Result};

type Deferred<T> = Box<dyn FnOnce(T) -> BoxFuture<'static, ()> + Send>;

enum Gate<T> {
    Waiting(VecDeque<Deferred<T>>),
    Flushing(VecDeque<Deferred<T>>),
    Open(T),
    Closed,
}

/// Holds operations until a resource is ready, then runs them once, in
/// submission order.
///
/// Work submitted while the backlog is being flushed joins the back of the
/// backlog, so nothing overtakes an earlier submission.
pub(crate) struct ReadyGate<T> {
    owner: String,
    gate: Mutex<Gate<T>>,
}

impl<T: Clone + Send + 'static> ReadyGate<T> {
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            gate: Mutex::new(Gate::Waiting(VecDeque::new())),
        }
    }

    /// Runs `op` with the ready value, now if the gate is open, otherwise
    /// once it opens.
    pub async fn run<F, Fut, R>(&self, op: F) -> Result<R>
    where
        F: FnOnce(T) -> Fut + Send + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let deferred: Deferred<T> = Box::new(move |value| {
            Box::pin(async move {
                let _ = tx.send(op(value).await);
            })
        });

        let ready = {
            let mut gate = lock(&self.gate);
            match &mut *gate {
                Gate::Open(value) => Some((value.clone(), deferred)),
                Gate::Closed => return Err(self.closed()),
                Gate::Waiting(backlog) | Gate::Flushing(backlog) => {
                    backlog.push_back(deferred);
                    None
                }
            }
        };
        if let Some((value, deferred)) = ready {
            deferred(value).await;
        }

        rx.await.map_err(|_| self.closed())?
    }

    /// Resolves with the ready value once the gate opens.
    pub async fn wait(&self) -> Result<T> {
        self.run(|value| async move { Ok(value) }).await
    }

    /// Flushes the backlog in order and leaves the gate open.
    pub async fn open(&self, value: T) {
        loop {
            let batch = {
                let mut gate = lock(&self.gate);
                match &mut *gate {
                    Gate::Waiting(backlog) | Gate::Flushing(backlog) => {
                        if backlog.is_empty() {
                            *gate = Gate::Open(value.clone());
                            return;
                        }
                        let batch = std::mem::take(backlog);
                        *gate = Gate::Flushing(VecDeque::new());
                        batch
                    }
                    Gate::Open(_) | Gate::Closed => return,
                }
            };

            for deferred in batch {
                deferred(value.clone()).await;
            }
        }
    }

    /// Fails everything still waiting and refuses new work.
    pub fn close(&self) {
        *lock(&self.gate) = Gate::Closed;
    }

    pub fn backlog(&self) -> usize {
        match &*lock(&self.gate) {
            Gate::Waiting(backlog) | Gate::Flushing(backlog) => backlog.len(),
            Gate::Open(_) | Gate::Closed => 0,
        }
    }

    fn closed(&self) -> HutchError {
        HutchError::Closed(self.owner.clone())
    }
}
