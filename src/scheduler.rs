//! Named one-shot timers.
//!
//! All timeout and debounce behavior in the engine runs through a
//! [`TimerTable`]: pairing timeouts, SMS reassembly windows. Timers are
//! keyed by string id (`pair.<device-id>`, `sms.<composite-id>`), never by
//! captured objects, so rescheduling and cancellation are plain map
//! operations and a stale firing can be recognized and dropped by its
//! consumer.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Table of pending named timers. Cloning shares the underlying table.
#[derive(Clone)]
pub struct TimerTable {
    timers: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
    tx: mpsc::UnboundedSender<String>,
}

impl TimerTable {
    /// Create a table and the channel on which fired timer keys arrive.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                timers: Arc::new(Mutex::new(HashMap::new())),
                tx,
            },
            rx,
        )
    }

    /// Schedule `key` to fire after `delay`. A live timer under the same
    /// key is cancelled and replaced, so repeated scheduling acts as a
    /// debounce.
    pub fn schedule(&self, key: impl Into<String>, delay: Duration) {
        let key = key.into();
        let timers = Arc::clone(&self.timers);
        let tx = self.tx.clone();
        let task_key = key.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Ok(mut map) = timers.lock() {
                map.remove(&task_key);
            }
            // Receiver gone means the engine is shutting down.
            let _ = tx.send(task_key);
        });
        if let Ok(mut map) = self.timers.lock() {
            if let Some(previous) = map.insert(key.clone(), handle) {
                debug!("Replacing pending timer '{}'", key);
                previous.abort();
            }
        }
    }

    /// Cancel a pending timer. Returns whether one was pending; cancelling
    /// an unknown or already-fired key is a no-op.
    pub fn cancel(&self, key: &str) -> bool {
        match self.timers.lock() {
            Ok(mut map) => match map.remove(key) {
                Some(handle) => {
                    handle.abort();
                    true
                }
                None => false,
            },
            Err(_) => false,
        }
    }

    pub fn is_scheduled(&self, key: &str) -> bool {
        self.timers
            .lock()
            .map(|map| map.contains_key(key))
            .unwrap_or(false)
    }

    /// Cancel every timer whose key starts with `prefix`. Used when a
    /// device goes away and all of its timers must die with it.
    pub fn cancel_prefix(&self, prefix: &str) {
        if let Ok(mut map) = self.timers.lock() {
            map.retain(|key, handle| {
                if key.starts_with(prefix) {
                    handle.abort();
                    false
                } else {
                    true
                }
            });
        }
    }
}
