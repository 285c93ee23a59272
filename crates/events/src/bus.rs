//! In-process event bus with bounded dead-letter capture.
//!
//! ## Delivery
//!
//! `publish` runs every subscribed handler **sequentially, in registration order**,
//! and returns only after the last one finished. A handler never observes a sibling's
//! partial work for the same event.
//!
//! ## Failures
//!
//! The event is already persisted when it reaches the bus, so a failing handler
//! cannot undo anything. Errors and panics are logged and recorded as
//! [`DeadLetter`]s; delivery continues with the next handler and the publisher
//! never sees the failure. The dead-letter list is capped (oldest entries are
//! dropped once full). Nothing is retried automatically:
//! [`EventBus::redeliver_dead_letters`] is an operator action.

use std::any::Any;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::event::StoredEvent;
use crate::handler::EventHandler;

pub const DEFAULT_DEAD_LETTER_CAPACITY: usize = 1_000;

/// An event a handler failed to process.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub event: StoredEvent,
    /// Name of the handler that failed.
    pub handler: String,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RedeliveryReport {
    pub redelivered: usize,
    pub still_failing: usize,
}

pub struct EventBus {
    handlers: RwLock<Vec<Arc<dyn EventHandler>>>,
    dead_letters: Mutex<VecDeque<DeadLetter>>,
    dead_letter_capacity: usize,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_dead_letter_capacity(DEFAULT_DEAD_LETTER_CAPACITY)
    }

    /// A capacity of zero is raised to one so the most recent failure is always kept.
    pub fn with_dead_letter_capacity(capacity: usize) -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
            dead_letters: Mutex::new(VecDeque::new()),
            dead_letter_capacity: capacity.max(1),
        }
    }

    pub fn subscribe(&self, handler: Arc<dyn EventHandler>) {
        let mut handlers = self.handlers.write();
        info!(handler = handler.name(), position = handlers.len(), "event handler subscribed");
        handlers.push(handler);
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.read().len()
    }

    pub async fn publish(&self, event: &StoredEvent) {
        // Snapshot so a handler may subscribe others without deadlocking.
        let handlers: Vec<Arc<dyn EventHandler>> = self.handlers.read().clone();

        debug!(
            event_id = %event.event_id,
            event_type = %event.event_type,
            aggregate_id = %event.aggregate_id,
            handlers = handlers.len(),
            "publishing event"
        );

        for handler in handlers {
            if let Err(err) = deliver(handler.as_ref(), event).await {
                self.record_failure(event, handler.name(), err);
            }
        }
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.dead_letters.lock().iter().cloned().collect()
    }

    pub fn dead_letter_count(&self) -> usize {
        self.dead_letters.lock().len()
    }

    /// Drop every dead letter, returning how many were removed.
    pub fn clear_dead_letters(&self) -> usize {
        let mut dead = self.dead_letters.lock();
        let n = dead.len();
        dead.clear();
        n
    }

    /// Deliver each dead letter again to the handler that failed it.
    ///
    /// Entries that fail again (or whose handler is no longer subscribed) are
    /// queued again.
    pub async fn redeliver_dead_letters(&self) -> RedeliveryReport {
        let pending: Vec<DeadLetter> = self.dead_letters.lock().drain(..).collect();
        let handlers: Vec<Arc<dyn EventHandler>> = self.handlers.read().clone();
        let mut report = RedeliveryReport::default();

        for letter in pending {
            let Some(handler) = handlers.iter().find(|h| h.name() == letter.handler) else {
                warn!(handler = %letter.handler, event_id = %letter.event.event_id, "dead letter handler is not subscribed");
                report.still_failing += 1;
                self.push_dead_letter(letter);
                continue;
            };

            match deliver(handler.as_ref(), &letter.event).await {
                Ok(()) => report.redelivered += 1,
                Err(err) => {
                    report.still_failing += 1;
                    self.record_failure(&letter.event, handler.name(), err);
                }
            }
        }

        info!(
            redelivered = report.redelivered,
            still_failing = report.still_failing,
            "dead letter redelivery finished"
        );
        report
    }

    fn record_failure(&self, event: &StoredEvent, handler: &str, error: String) {
        error!(
            handler,
            event_id = %event.event_id,
            event_type = %event.event_type,
            aggregate_id = %event.aggregate_id,
            error = %error,
            "event handler failed; event moved to dead letters"
        );

        self.push_dead_letter(DeadLetter {
            event: event.clone(),
            handler: handler.to_string(),
            error,
            failed_at: Utc::now(),
        });
    }

    fn push_dead_letter(&self, letter: DeadLetter) {
        let mut dead = self.dead_letters.lock();
        while dead.len() >= self.dead_letter_capacity {
            dead.pop_front();
        }
        dead.push_back(letter);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EventBus")
            .field("handlers", &self.handler_count())
            .field("dead_letters", &self.dead_letter_count())
            .field("dead_letter_capacity", &self.dead_letter_capacity)
            .finish()
    }
}

async fn deliver(handler: &dyn EventHandler, event: &StoredEvent) -> Result<(), String> {
    match AssertUnwindSafe(handler.handle(event)).catch_unwind().await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(format!("{err:#}")),
        Err(panic) => Err(format!("handler panicked: {}", panic_message(panic.as_ref()))),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}
