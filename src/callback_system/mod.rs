//! Synchronous callback registry
//!
//! Callbacks are invoked inline by [`CallbackRegistry::trigger`], in
//! registration order, before `trigger` returns. This is what lets the
//! credential store guarantee that every dependent has seen a new value by
//! the time a write completes.


use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, error};
use uuid::Uuid;

/// Type for callback IDs
pub type CallbackId = Uuid;

/// Trait for types that can be used in callbacks
pub trait CallbackData: Clone + Send + Sync + 'static + fmt::Debug {}

impl<T> CallbackData for T where T: Clone + Send + Sync + 'static + fmt::Debug {}

type Callback<T> = Arc<dyn Fn(T) -> anyhow::Result<()> + Send + Sync>;

struct Entry<T> {
    seq: u64,
    callback: Callback<T>,
}

/// Registry of callbacks keyed by id
pub struct CallbackRegistry<T: CallbackData> {
    callbacks: Arc<DashMap<CallbackId, Entry<T>>>,
    next_seq: Arc<AtomicU64>,
    /// Optional group identifier used in logs
    group: Option<String>,
}

impl<T: CallbackData> CallbackRegistry<T> {
    /// Create a new callback registry
    pub fn new() -> Self {
        Self {
            callbacks: Arc::new(DashMap::new()),
            next_seq: Arc::new(AtomicU64::new(0)),
            group: None,
        }
    }

    /// Create a new callback registry with a group identifier
    pub fn with_group(group: &str) -> Self {
        Self {
            group: Some(group.to_string()),
            ..Self::new()
        }
    }

    fn group(&self) -> &str {
        self.group.as_deref().unwrap_or("default")
    }

    /// Register a callback function
    pub fn register<F>(&self, callback: F) -> CallbackId
    where
        F: Fn(T) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = Uuid::new_v4();
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        self.callbacks.insert(
            id,
            Entry {
                seq,
                callback: Arc::new(callback),
            },
        );

        debug!(callback_id = %id, group = %self.group(), "Registered callback");
        id
    }

    /// Unregister a callback by ID
    pub fn unregister(&self, id: CallbackId) -> bool {
        let removed = self.callbacks.remove(&id).is_some();
        if removed {
            debug!(callback_id = %id, group = %self.group(), "Unregistered callback");
        } else {
            debug!(
                callback_id = %id,
                group = %self.group(),
                "Attempted to unregister non-existent callback"
            );
        }
        removed
    }

    /// Invoke every registered callback with `data`.
    ///
    /// Returns the number of callbacks that completed without error. A
    /// failing callback is logged and does not stop the others.
    pub fn trigger(&self, data: T) -> usize {
        // Snapshot first so callbacks may register or unregister without
        // contending with the map's shard locks.
        let mut entries: Vec<(u64, CallbackId, Callback<T>)> = self
            .callbacks
            .iter()
            .map(|entry| (entry.seq, *entry.key(), Arc::clone(&entry.callback)))
            .collect();
        entries.sort_by_key(|(seq, _, _)| *seq);

        let mut delivered = 0;
        for (_, id, callback) in entries {
            match callback(data.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => error!(
                    callback_id = %id,
                    group = %self.group(),
                    error = %e,
                    "Callback execution failed"
                ),
            }
        }

        debug!(group = %self.group(), delivered, "Triggered callbacks");
        delivered
    }

    /// Get the number of registered callbacks
    pub fn count(&self) -> usize {
        self.callbacks.len()
    }

    /// Clear all registered callbacks
    pub fn clear(&self) {
        let count = self.callbacks.len();
        self.callbacks.clear();
        debug!(group = %self.group(), count, "Cleared all callbacks");
    }
}

impl<T: CallbackData> Default for CallbackRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: CallbackData> Clone for CallbackRegistry<T> {
    fn clone(&self) -> Self {
        Self {
            callbacks: Arc::clone(&self.callbacks),
            next_seq: Arc::clone(&self.next_seq),
            group: self.group.clone(),
        }
    }
}
