//! Observable Settings
//!
//! Hardware settings (exposure time, binning, resolution, beam scale, ...) are
//! exposed as independently settable values backed by `tokio::sync::watch`, so
//! a GUI or logger can follow every change while the alignment code writes
//! them synchronously.
//!
//! # Example
//!
//! ```rust,ignore
//! let exposure = Observable::new("exposure_time", 0.1)
//!     .with_units("s")
//!     .with_range(1e-6, 10.0);
//!
//! let mut rx = exposure.subscribe();
//! exposure.set(0.6)?;
//! rx.changed().await?;
//! assert_eq!(*rx.borrow(), 0.6);
//! ```

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::sync::Arc;
use tokio::sync::watch;

type Validator<T> = Arc<dyn Fn(&T) -> Result<()> + Send + Sync>;

/// A thread-safe, observable value with change notifications.
pub struct Observable<T>
where
    T: Clone + Send + Sync + 'static,
{
    sender: watch::Sender<T>,
    metadata: ObservableMetadata,
    validator: Option<Validator<T>>,
}

impl<T: Clone + Send + Sync + 'static> std::fmt::Debug for Observable<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observable")
            .field("metadata", &self.metadata)
            .field("has_validator", &self.validator.is_some())
            .finish()
    }
}

impl<T: Clone + Send + Sync + 'static> Clone for Observable<T> {
    fn clone(&self) -> Self {
        // Clones share the same watch channel.
        Self {
            sender: self.sender.clone(),
            metadata: self.metadata.clone(),
            validator: self.validator.clone(),
        }
    }
}

/// Metadata for an observable setting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservableMetadata {
    /// Setting name (unique within a device)
    pub name: String,
    /// Human-readable description
    pub description: Option<String>,
    /// Physical units (e.g. "s", "m", "px")
    pub units: Option<String>,
    /// Whether writes are rejected
    pub read_only: bool,
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
                read_only: false,
            },
            validator: None,
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

    /// Mark as read-only for external writers.
    pub fn read_only(mut self) -> Self {
        self.metadata.read_only = true;
        self
    }

    /// Add a custom validator.
    pub fn with_validator<F>(mut self, validator: F) -> Self
    where
        F: Fn(&T) -> Result<()> + Send + Sync + 'static,
    {
        self.validator = Some(Arc::new(validator));
        self
    }

    /// Current value (clone).
    pub fn get(&self) -> T {
        self.sender.borrow().clone()
    }

    /// Setting name.
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// Setting metadata.
    pub fn metadata(&self) -> &ObservableMetadata {
        &self.metadata
    }

    /// Validate and store a new value, notifying all subscribers.
    pub fn set(&self, value: T) -> Result<()> {
        if self.metadata.read_only {
            return Err(anyhow!("Setting '{}' is read-only", self.metadata.name));
        }

        if let Some(validator) = &self.validator {
            validator(&value)
                .map_err(|e| anyhow!("Setting '{}': {}", self.metadata.name, e))?;
        }

        self.sender.send_replace(value);
        Ok(())
    }

    /// Store a value bypassing read-only and validation (owner side).
    pub fn set_unchecked(&self, value: T) {
        self.sender.send_replace(value);
    }

    /// Apply `f` to the current value in place and notify subscribers.
    pub fn modify(&self, f: impl FnOnce(&mut T)) {
        self.sender.send_modify(f);
    }

    /// Subscribe to value changes.
    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.sender.subscribe()
    }

    /// Number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl<T> Observable<T>
where
    T: Clone + Send + Sync + PartialOrd + Debug + 'static,
{
    /// Add inclusive min/max validation.
    pub fn with_range(mut self, min: T, max: T) -> Self {
        self.validator = Some(Arc::new(move |value: &T| {
            if value < &min || value > &max {
                Err(anyhow!(
                    "value {:?} out of range [{:?}, {:?}]",
                    value,
                    min,
                    max
                ))
            } else {
                Ok(())
            }
        }));
        self
    }
}

/// Validator for `(x, y)` settings where each component has its own bounds.
pub fn pair_range<T>(min: (T, T), max: (T, T)) -> impl Fn(&(T, T)) -> Result<()> + Send + Sync
where
    T: PartialOrd + Debug + Send + Sync + Copy + 'static,
{
    move |value: &(T, T)| {
        let x_ok = value.0 >= min.0 && value.0 <= max.0;
        let y_ok = value.1 >= min.1 && value.1 <= max.1;
        if x_ok && y_ok {
            Ok(())
        } else {
            Err(anyhow!(
                "value {:?} out of range [{:?}, {:?}]",
                value,
                min,
                max
            ))
        }
    }
}
