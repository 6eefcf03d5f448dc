//! Notification channel
//!
//! Publishing is fire-and-forget over a tokio broadcast channel: a slow or
//! absent observer lags or misses events but never stalls the capture path.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::models::CaptureEvent;

const EVENT_QUEUE_DEPTH: usize = 256;

/// Receives capture events on a task of its own
pub trait CaptureObserver: Send + Sync {
    fn on_event(&self, event: &CaptureEvent);
}

/// Handle returned by [`Notifier::register`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

#[derive(Clone)]
pub struct Notifier {
    tx: broadcast::Sender<CaptureEvent>,
    observers: Arc<Mutex<HashMap<ObserverId, JoinHandle<()>>>>,
    next_id: Arc<AtomicU64>,
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_QUEUE_DEPTH);
        Self {
            tx,
            observers: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Publish an event; never blocks, and having no subscriber is not an error
    pub fn publish(&self, event: CaptureEvent) {
        let _ = self.tx.send(event);
    }

    /// Raw receiver for events published from now on; drop it to unsubscribe
    pub fn subscribe(&self) -> broadcast::Receiver<CaptureEvent> {
        self.tx.subscribe()
    }

    /// Deliver events to `observer` from a dedicated task
    ///
    /// Must be called from within a tokio runtime.
    pub fn register(&self, observer: Arc<dyn CaptureObserver>) -> ObserverId {
        let id = ObserverId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut rx = self.tx.subscribe();
        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => observer.on_event(&event),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::debug!("Observer lagged, skipped {} events", missed);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        self.observers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, task);
        id
    }

    /// Stop delivering to a registered observer; returns false for unknown ids
    pub fn unregister(&self, id: ObserverId) -> bool {
        let task = self
            .observers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
        match task {
            Some(task) => {
                task.abort();
                true
            }
            None => false,
        }
    }

    pub fn observer_count(&self) -> usize {
        self.observers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}
