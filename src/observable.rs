//! Observable values
//!
//! Reactive value holder built on `tokio::sync::watch` for multi-subscriber
//! notifications. Every field of the detector status surface (state, message,
//! remaining exposure time, last protocol strings, ...) is one `Observable`, so
//! external observers can poll the current value or await changes without ever
//! touching the acquisition worker.
//!
//! # Example
//!
//! ```rust
//! use marccd_daq::observable::Observable;
//!
//! let message = Observable::new("status_message", String::new()).with_description("Operator message");
//! let rx = message.subscribe();
//! message.set("Starting exposure".to_string());
//! assert_eq!(*rx.borrow(), "Starting exposure");
//! ```

use std::fmt::Debug;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// A thread-safe value with change notifications.
pub struct Observable<T>
where
    T: Clone + Send + Sync + 'static,
{
    sender: watch::Sender<T>,
    metadata: ObservableMetadata,
}

impl<T: Clone + Send + Sync + 'static> Debug for Observable<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observable")
            .field("metadata", &self.metadata)
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl<T: Clone + Send + Sync + 'static> Clone for Observable<T> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(), // same watch channel
            metadata: self.metadata.clone(),
        }
    }
}

/// Metadata for an observable value
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservableMetadata {
    /// Name, unique within the status surface
    pub name: String,
    /// Human-readable description
    pub description: Option<String>,
    /// Physical units (e.g. "s")
    pub units: Option<String>,
}

impl<T> Observable<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create a new observable with an initial value.
    pub fn new(name: impl Into<String>, initial_value: T) -> Self {
        let (sender, _) = watch::channel(initial_value);
        Self {
            sender,
            metadata: ObservableMetadata {
                name: name.into(),
                description: None,
                units: None,
            },
        }
    }

    /// Add a description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.metadata.description = Some(description.into());
        self
    }

    /// Add units.
    pub fn with_units(mut self, units: impl Into<String>) -> Self {
        self.metadata.units = Some(units.into());
        self
    }

    /// Current value (clone).
    pub fn get(&self) -> T {
        self.sender.borrow().clone()
    }

    /// Name of the value.
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// Metadata.
    pub fn metadata(&self) -> &ObservableMetadata {
        &self.metadata
    }

    /// Replace the value and notify all subscribers.
    pub fn set(&self, value: T) {
        self.sender.send_replace(value);
    }

    /// Subscribe to value changes.
    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.sender.subscribe()
    }

    /// Number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Modify the value in place under the channel lock.
    ///
    /// `modify` returns whether it changed anything; subscribers are only notified
    /// if it did. Useful as an atomic test-and-set.
    pub fn update<F>(&self, modify: F) -> bool
    where
        F: FnOnce(&mut T) -> bool,
    {
        self.sender.send_if_modified(modify)
    }
}

impl<T> Observable<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    /// Replace the value, notifying subscribers only when it differs.
    pub fn set_if_changed(&self, value: T) -> bool {
        self.sender.send_if_modified(|current| {
            if *current == value {
                false
            } else {
                *current = value;
                true
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observable_basic() {
        let obs = Observable::new("image_counter", 0u64);
        assert_eq!(obs.get(), 0);
        assert_eq!(obs.name(), "image_counter");

        obs.set(3);
        assert_eq!(obs.get(), 3);
    }

    #[test]
    fn test_observable_with_metadata() {
        let obs = Observable::new("time_remaining", 0.0)
            .with_description("Remaining exposure time")
            .with_units("s");

        assert_eq!(obs.metadata().units.as_deref(), Some("s"));
        assert!(obs.metadata().description.is_some());
    }

    #[tokio::test]
    async fn test_observable_subscription() {
        let obs = Observable::new("value", 0);
        let mut rx = obs.subscribe();
        assert_eq!(*rx.borrow(), 0);

        obs.set(42);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), 42);
    }

    #[tokio::test]
    async fn test_set_if_changed_skips_equal_values() {
        let obs = Observable::new("state", "idle".to_string());
        let rx = obs.subscribe();

        assert!(!obs.set_if_changed("idle".to_string()));
        assert!(!rx.has_changed().unwrap());

        assert!(obs.set_if_changed("acquire".to_string()));
        assert!(rx.has_changed().unwrap());
    }

    #[test]
    fn test_clones_share_channel() {
        let obs = Observable::new("shared", 1);
        let copy = obs.clone();
        copy.set(5);
        assert_eq!(obs.get(), 5);
    }

    #[test]
    fn test_update_as_test_and_set() {
        let busy = Observable::new("acquiring", false);
        let claim = |v: &mut bool| {
            if *v {
                false
            } else {
                *v = true;
                true
            }
        };
        assert!(busy.update(claim));
        assert!(!busy.update(claim));
        assert!(busy.get());
    }
}
