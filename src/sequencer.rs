//! Serialized execution queue for outbound protocol work.
//!
//! Any number of callers may enqueue units of work; a single worker task runs
//! them strictly one at a time in enqueue order. This is the only ordering
//! guarantee in the client: "fetch session token, then send connect" and
//! "send subscribe" issued from arbitrary tasks reach the wire in the order
//! they were enqueued.
//!
//! ```text
//!   caller A ──enqueue──┐
//!   caller B ──enqueue──┼──► mpsc (FIFO) ──► worker: unit.await; next unit.await; ...
//!   caller C ──enqueue──┘
//! ```
//!
//! A unit that never completes blocks every unit behind it. Callers must not
//! enqueue unbounded blocking work.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio::sync::{mpsc, oneshot};

use crate::error::{LiveQueryError, Result};

/// One unit of sequenced work.
type Unit = BoxFuture<'static, ()>;

/// Multi-producer, single-consumer serialized work queue.
///
/// Cloning yields another producer for the same worker. The worker exits once
/// every clone has been dropped and the queue is drained.
#[derive(Clone)]
pub struct OperationSequencer {
    tx: mpsc::UnboundedSender<Unit>,
}

impl fmt::Debug for OperationSequencer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationSequencer")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

impl OperationSequencer {
    /// Spawn the worker task. Must be called from within a tokio runtime.
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_worker(rx));
        Self { tx }
    }

    /// Append `work` to the queue.
    ///
    /// The returned [`Completion`] resolves with the unit's output once it has
    /// run, or with an error if the unit panicked or the worker is gone.
    pub fn enqueue<F, T>(&self, work: F) -> Completion<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel();
        let unit: Unit = Box::pin(async move {
            let output = work.await;
            let _ = done_tx.send(output);
        });
        if self.tx.send(unit).is_err() {
            log::warn!("[Sequencer] Worker stopped, dropping unit");
        }
        Completion { rx: done_rx }
    }

    /// Run `producer` now, and `continuation` on its value as one queued unit.
    ///
    /// The producer starts immediately and may finish before units queued
    /// ahead of this one; the continuation still runs in enqueue order. A
    /// failed producer skips the continuation and resolves to its error.
    pub fn enqueue_on_success<P, T, C, Fut, R>(&self, producer: P, continuation: C) -> Completion<Result<R>>
    where
        P: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
        C: FnOnce(T) -> Fut + Send + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
        R: Send + 'static,
    {
        let produced = tokio::spawn(producer);
        self.enqueue(async move {
            match produced.await {
                Ok(Ok(value)) => continuation(value).await,
                Ok(Err(e)) => Err(e),
                Err(join_error) => Err(LiveQueryError::IllegalState(format!(
                    "producer task failed: {join_error}"
                ))),
            }
        })
    }

    /// Run `work` as one queued unit, handing any error to `on_error`.
    pub fn enqueue_on_error<F, H>(&self, work: F, on_error: H) -> Completion<()>
    where
        F: Future<Output = Result<()>> + Send + 'static,
        H: FnOnce(LiveQueryError) + Send + 'static,
    {
        self.enqueue(async move {
            if let Err(e) = work.await {
                on_error(e);
            }
        })
    }
}

/// Resolves when an enqueued unit has finished.
pub struct Completion<T> {
    rx: oneshot::Receiver<T>,
}

impl<T> fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion").finish_non_exhaustive()
    }
}

impl<T> Future for Completion<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|received| {
            received.map_err(|e| {
                LiveQueryError::IllegalState(format!("sequenced unit did not complete: {e}"))
            })
        })
    }
}

async fn run_worker(mut rx: mpsc::UnboundedReceiver<Unit>) {
    while let Some(unit) = rx.recv().await {
        if let Err(panic) = AssertUnwindSafe(unit).catch_unwind().await {
            log::error!("[Sequencer] Unit panicked: {}", panic_message(panic.as_ref()));
        }
    }
    log::debug!("[Sequencer] Worker stopped");
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
