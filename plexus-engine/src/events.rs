//! Event subscription tables
//!
//! Two tables are kept in lockstep:
//!
//! ```text
//! listeners: (emitter, event)          -> [listener, ...]   (insertion order)
//! callbacks: listener -> (emitter, event) -> callback
//! ```
//!
//! Every listener named in `listeners` must own a callback in `callbacks` and
//! vice versa. A mismatch means the tables are corrupted and is reported as
//! [`EngineError::InternalConsistency`].

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use plexus_api::Value;

use crate::error::EngineError;

/// Callback invoked with the broadcast payload
pub type EventCallback = Arc<dyn Fn(&[Value]) + Send + Sync>;

type EventKey = (String, String);

fn key(emitter: &str, event: &str) -> EventKey {
    (emitter.to_string(), event.to_string())
}

/// Listener and callback bookkeeping for broadcasts
#[derive(Default)]
pub struct EventRegistry {
    listeners: HashMap<EventKey, Vec<String>>,
    callbacks: HashMap<String, HashMap<EventKey, EventCallback>>,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the (empty) callback table of `listener`
    pub fn allocate(&mut self, listener: &str) {
        self.callbacks.entry(listener.to_string()).or_default();
    }

    /// Drop the callback table of `listener` and unsubscribe it everywhere
    ///
    /// Subscriptions other listeners hold on events emitted by `listener`
    /// are left untouched.
    pub fn release(&mut self, listener: &str) {
        self.callbacks.remove(listener);
        self.listeners.retain(|_, names| {
            names.retain(|name| name != listener);
            !names.is_empty()
        });
    }

    /// Subscribe `listener` to `event` emitted by `emitter`
    ///
    /// The first callback registered for a (listener, emitter, event) triple
    /// wins; later registrations are ignored and `false` is returned.
    pub fn add_listener(
        &mut self,
        listener: &str,
        emitter: &str,
        event: &str,
        callback: EventCallback,
    ) -> bool {
        let table = self.callbacks.entry(listener.to_string()).or_default();
        let inserted = match table.entry(key(emitter, event)) {
            std::collections::hash_map::Entry::Occupied(_) => false,
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(callback);
                true
            }
        };

        let names = self.listeners.entry(key(emitter, event)).or_default();
        if !names.iter().any(|name| name == listener) {
            names.push(listener.to_string());
        }
        inserted
    }

    /// Unsubscribe `listener`; returns whether a subscription existed
    pub fn remove_listener(&mut self, listener: &str, emitter: &str, event: &str) -> bool {
        let event_key = key(emitter, event);
        let mut removed = false;

        if let Some(names) = self.listeners.get_mut(&event_key) {
            let before = names.len();
            names.retain(|name| name != listener);
            removed = names.len() != before;
            if names.is_empty() {
                self.listeners.remove(&event_key);
            }
        }
        if let Some(table) = self.callbacks.get_mut(listener) {
            removed |= table.remove(&event_key).is_some();
        }
        removed
    }

    /// Listener names subscribed to `emitter/event`, in subscription order
    pub fn listeners(&self, emitter: &str, event: &str) -> Vec<String> {
        self.listeners
            .get(&key(emitter, event))
            .cloned()
            .unwrap_or_default()
    }

    /// Whether `listener` holds a callback table
    pub fn is_allocated(&self, listener: &str) -> bool {
        self.callbacks.contains_key(listener)
    }

    /// Resolve the callbacks a broadcast of `emitter/event` must run
    ///
    /// The returned list is a snapshot: callbacks may subscribe or
    /// unsubscribe while it is being walked.
    pub fn dispatch_list(
        &self,
        emitter: &str,
        event: &str,
    ) -> Result<Vec<(String, EventCallback)>, EngineError> {
        let event_key = key(emitter, event);
        let Some(names) = self.listeners.get(&event_key) else {
            return Ok(Vec::new());
        };

        names
            .iter()
            .map(|name| {
                self.callbacks
                    .get(name)
                    .and_then(|table| table.get(&event_key))
                    .map(|callback| (name.clone(), Arc::clone(callback)))
                    .ok_or_else(|| EngineError::InternalConsistency {
                        listener: name.clone(),
                        emitter: emitter.to_string(),
                        event: event.to_string(),
                    })
            })
            .collect()
    }

    /// Record `listener` under `emitter/event` without a callback
    #[cfg(test)]
    pub(crate) fn subscribe_without_callback(&mut self, listener: &str, emitter: &str, event: &str) {
        self.listeners
            .entry(key(emitter, event))
            .or_default()
            .push(listener.to_string());
    }

    /// Check both directions of the listener/callback invariant
    pub fn verify(&self) -> Result<(), EngineError> {
        for (emitter, event) in self.listeners.keys() {
            self.dispatch_list(emitter, event)?;
        }
        for (listener, table) in &self.callbacks {
            for (emitter, event) in table.keys() {
                let subscribed = self
                    .listeners
                    .get(&key(emitter, event))
                    .is_some_and(|names| names.iter().any(|name| name == listener));
                if !subscribed {
                    return Err(EngineError::InternalConsistency {
                        listener: listener.clone(),
                        emitter: emitter.clone(),
                        event: event.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}

impl fmt::Debug for EventRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventRegistry")
            .field("events", &self.listeners.len())
            .field("listeners", &self.callbacks.len())
            .finish()
    }
}
