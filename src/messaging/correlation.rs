// src/messaging/correlation.rs

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::task::{Context, Poll};

use tokio::sync::oneshot;
use uuid::Uuid;

use super::{lock, Payload};
use crate::errors::{HutchError, Result};

/// Requests waiting for a reply, keyed by correlation id.
#[derive(Debug, Default)]
pub(crate) struct ReplyTable {
    pending: Mutex<HashMap<String, oneshot::Sender<Payload>>>,
}

impl ReplyTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves a fresh correlation id.
    pub fn register(&self) -> (String, ReplyFuture) {
        let correlation_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(correlation_id.clone(), tx);
        (correlation_id.clone(), ReplyFuture { correlation_id, rx })
    }

    /// Hands a reply to its requester. Returns false for unknown ids, which
    /// includes replies that already arrived once.
    pub fn resolve(&self, correlation_id: &str, payload: Payload) -> bool {
        let waiter = lock(&self.pending).remove(correlation_id);
        match waiter {
            Some(tx) => tx.send(payload).is_ok(),
            None => false,
        }
    }

    pub fn forget(&self, correlation_id: &str) {
        lock(&self.pending).remove(correlation_id);
    }

    /// Forgets `correlation_id` when the returned guard drops, unless
    /// [`Registration::keep`] was called first.
    pub fn hold<'a>(&'a self, correlation_id: &'a str) -> Registration<'a> {
        Registration {
            table: self,
            correlation_id,
            kept: false,
        }
    }

    pub fn is_pending(&self, correlation_id: &str) -> bool {
        lock(&self.pending).contains_key(correlation_id)
    }

    pub fn len(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Drops every waiter; their futures resolve to `ReplyDropped`.
    pub fn clear(&self) {
        lock(&self.pending).clear();
    }
}

/// A request that has been registered but not yet handed to the broker.
pub(crate) struct Registration<'a> {
    table: &'a ReplyTable,
    correlation_id: &'a str,
    kept: bool,
}

impl Registration<'_> {
    pub fn keep(mut self) {
        self.kept = true;
    }
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        if !self.kept {
            self.table.forget(self.correlation_id);
        }
    }
}

/// Resolves with the reply to a request.
///
/// There is no built-in deadline. Wrap it in `tokio::time::timeout` when one
/// is needed; dropping the future leaves the table entry until the exchange
/// closes.
#[derive(Debug)]
pub struct ReplyFuture {
    correlation_id: String,
    rx: oneshot::Receiver<Payload>,
}

impl ReplyFuture {
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }
}

impl Future for ReplyFuture {
    type Output = Result<Payload>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|reply| reply.map_err(|_| HutchError::ReplyDropped))
    }
}
