//! Asynchronous event dispatch.
//!
//! The bus never runs handlers on the emitting task. Events go through an
//! unbounded queue drained by one dispatcher task, so a slow or failing
//! handler can delay other handlers but never token delivery.

use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{Event, EventContext, EventKind};

/// Error returned by a handler. Logged and dropped.
#[derive(Error, Debug)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Receives lifecycle events.
///
/// Handlers run on the dispatcher task. Errors and panics are caught per
/// handler, so one failing handler never prevents its siblings from
/// seeing the event.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &Event) -> Result<(), HandlerError>;
}

impl<F> EventHandler for F
where
    F: Fn(&Event) + Send + Sync,
{
    fn handle(&self, event: &Event) -> Result<(), HandlerError> {
        self(event);
        Ok(())
    }
}

/// High-throughput mode: dispatch in batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchConfig {
    /// Flush once this many events are queued
    pub max_batch: usize,

    /// Flush at most this long after the first queued event
    pub flush_delay: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch: 32,
            flush_delay: Duration::from_millis(10),
        }
    }
}

/// Bus configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BusConfig {
    /// `None` dispatches every event as soon as the worker sees it
    pub batch: Option<BatchConfig>,
}

/// Fans events out to registered handlers.
pub struct EventBus {
    session_id: Arc<str>,
    context: EventContext,
    handlers: Arc<[Arc<dyn EventHandler>]>,
    queue: Option<mpsc::UnboundedSender<Event>>,
    worker: Option<JoinHandle<()>>,
    origin: Instant,
    last_ts: Mutex<u64>,
    built: AtomicU64,
    failures: Arc<AtomicU64>,
}

impl EventBus {
    /// Create a bus.
    ///
    /// With no handlers no worker is spawned and `emit` is a no-op.
    /// Otherwise this must be called from within a tokio runtime.
    pub fn new(
        session_id: impl Into<Arc<str>>,
        context: EventContext,
        handlers: Vec<Arc<dyn EventHandler>>,
        config: BusConfig,
    ) -> Self {
        let handlers: Arc<[Arc<dyn EventHandler>]> = handlers.into();
        let failures = Arc::new(AtomicU64::new(0));

        let (queue, worker) = if handlers.is_empty() {
            (None, None)
        } else {
            let (tx, rx) = mpsc::unbounded_channel();
            let worker = tokio::spawn(dispatch_loop(
                rx,
                Arc::clone(&handlers),
                config.batch,
                Arc::clone(&failures),
            ));
            (Some(tx), Some(worker))
        };

        Self {
            session_id: session_id.into(),
            context,
            handlers,
            queue,
            worker,
            origin: Instant::now(),
            last_ts: Mutex::new(0),
            built: AtomicU64::new(0),
            failures,
        }
    }

    /// Whether any handler is registered.
    pub fn is_active(&self) -> bool {
        !self.handlers.is_empty()
    }

    /// Queue an event for asynchronous dispatch.
    ///
    /// `payload` is only invoked when at least one handler is registered.
    pub fn emit<F>(&self, payload: F)
    where
        F: FnOnce() -> EventKind,
    {
        let Some(queue) = &self.queue else {
            return;
        };
        let event = self.build(payload());
        if queue.send(event).is_err() {
            tracing::debug!(session_id = %self.session_id, "Event dropped after dispatcher stopped");
        }
    }

    /// Dispatch an event inline, bypassing the queue.
    ///
    /// Same error-swallowing contract as `emit`.
    pub fn emit_sync<F>(&self, payload: F)
    where
        F: FnOnce() -> EventKind,
    {
        if self.handlers.is_empty() {
            return;
        }
        let event = self.build(payload());
        dispatch(&self.handlers, &event, &self.failures);
    }

    /// Number of event objects constructed so far.
    pub fn events_built(&self) -> u64 {
        self.built.load(Ordering::Relaxed)
    }

    /// Number of handler invocations that failed or panicked.
    pub fn handler_failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Close the queue and wait until every queued event has been handled.
    pub async fn shutdown(mut self) {
        drop(self.queue.take());
        if let Some(worker) = self.worker.take() {
            if let Err(e) = worker.await {
                tracing::warn!(session_id = %self.session_id, error = %e, "Event dispatcher stopped abnormally");
            }
        }
    }

    fn build(&self, kind: EventKind) -> Event {
        self.built.fetch_add(1, Ordering::Relaxed);
        Event {
            ts: self.next_ts(),
            session_id: Arc::clone(&self.session_id),
            context: Arc::clone(&self.context),
            kind,
        }
    }

    /// Monotonic microsecond clock, bumped to stay strictly increasing.
    fn next_ts(&self) -> u64 {
        let now = self.origin.elapsed().as_micros() as u64;
        let mut last = self.last_ts.lock();
        *last = now.max(*last + 1);
        *last
    }
}

fn dispatch(handlers: &[Arc<dyn EventHandler>], event: &Event, failures: &AtomicU64) {
    for handler in handlers {
        match catch_unwind(AssertUnwindSafe(|| handler.handle(event))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(event = event.event_type(), error = %e, "Event handler failed");
            }
            Err(_) => {
                failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(event = event.event_type(), "Event handler panicked");
            }
        }
    }
}

async fn dispatch_loop(
    mut rx: mpsc::UnboundedReceiver<Event>,
    handlers: Arc<[Arc<dyn EventHandler>]>,
    batch: Option<BatchConfig>,
    failures: Arc<AtomicU64>,
) {
    let Some(batch) = batch else {
        while let Some(event) = rx.recv().await {
            dispatch(&handlers, &event, &failures);
        }
        return;
    };

    let max_batch = batch.max_batch.max(1);
    let mut pending = Vec::with_capacity(max_batch);
    loop {
        let Some(first) = rx.recv().await else {
            return;
        };
        pending.push(first);

        let deadline = tokio::time::Instant::now() + batch.flush_delay;
        let mut closed = false;
        while pending.len() < max_batch {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(event)) => pending.push(event),
                Ok(None) => {
                    closed = true;
                    break;
                }
                Err(_) => break,
            }
        }

        tracing::debug!(events = pending.len(), "Flushing event batch");
        for event in pending.drain(..) {
            dispatch(&handlers, &event, &failures);
        }
        if closed {
            return;
        }
    }
}
