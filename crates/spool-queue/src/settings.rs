//! Per-queue settings resolved over process-wide defaults.
//!
//! Every recognized option is an [`OverlaySetting`]: reads resolve to the
//! per-queue override when one is set, else to the live process-wide default.
//! Both sides can change at any time and the next operation sees the new
//! value.

use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Process-wide default values shared by every queue.
#[derive(Debug, Clone)]
pub struct QueueDefaults {
    /// Admission bound on the logical item count.
    pub max_items: usize,
    /// Admission bound on the logical byte count.
    pub max_size: u64,
    /// Per-item payload cap in bytes.
    pub max_item_size: u64,
    /// Clamp on every item's effective lifetime, milliseconds. `0` disables.
    pub max_age_ms: u64,
    /// Target journal size; basis for rotation decisions.
    pub max_journal_size: u64,
    /// In-memory working-set bound driving read-behind.
    pub max_memory_size: u64,
    /// Rotation multiplier over `max_journal_size`.
    pub max_journal_overflow: u64,
    /// Hard journal bound that forces rotation regardless of queue size.
    pub max_journal_size_absolute: u64,
    /// Drop head items to admit new ones instead of rejecting.
    pub discard_old_when_full: bool,
    /// Whether mutations are journaled at all.
    pub keep_journal: bool,
    /// Force every journal append to disk.
    pub sync_journal: bool,
    /// Name of the queue that receives expired items, if any.
    pub move_expired_to: Option<String>,
}

impl Default for QueueDefaults {
    fn default() -> Self {
        Self {
            max_items: usize::MAX,
            max_size: u64::MAX,
            max_item_size: u64::MAX,
            max_age_ms: 0,
            max_journal_size: 16 << 20,
            max_memory_size: 128 << 20,
            max_journal_overflow: 10,
            max_journal_size_absolute: u64::MAX,
            discard_old_when_full: false,
            keep_journal: true,
            sync_journal: false,
            move_expired_to: None,
        }
    }
}

/// A value with a process-wide default and an optional per-queue override.
///
/// Reads resolve override-then-default on every access, so a change on
/// either side is visible to the next operation that consults the setting.
pub struct OverlaySetting<T> {
    defaults: Arc<RwLock<QueueDefaults>>,
    pick: fn(&QueueDefaults) -> T,
    local: RwLock<Option<T>>,
}

impl<T: Clone> OverlaySetting<T> {
    fn new(defaults: Arc<RwLock<QueueDefaults>>, pick: fn(&QueueDefaults) -> T) -> Self {
        Self {
            defaults,
            pick,
            local: RwLock::new(None),
        }
    }

    /// Resolves the effective value.
    pub fn get(&self) -> T {
        if let Some(value) = self.local.read().as_ref() {
            return value.clone();
        }
        (self.pick)(&self.defaults.read())
    }

    /// Installs an override, or clears it with `None`.
    pub fn set(&self, value: Option<T>) {
        *self.local.write() = value;
    }

    /// True when a per-queue override is in effect.
    pub fn is_overridden(&self) -> bool {
        self.local.read().is_some()
    }
}

impl<T: Clone + std::fmt::Debug> std::fmt::Debug for OverlaySetting<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OverlaySetting")
            .field("effective", &self.get())
            .field("overridden", &self.is_overridden())
            .finish()
    }
}

/// A partial reconfiguration payload: only present fields are applied.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueOptions {
    /// See [`QueueDefaults::max_items`].
    pub max_items: Option<usize>,
    /// See [`QueueDefaults::max_size`].
    pub max_size: Option<u64>,
    /// See [`QueueDefaults::max_item_size`].
    pub max_item_size: Option<u64>,
    /// See [`QueueDefaults::max_age_ms`].
    pub max_age_ms: Option<u64>,
    /// See [`QueueDefaults::max_journal_size`].
    pub max_journal_size: Option<u64>,
    /// See [`QueueDefaults::max_memory_size`].
    pub max_memory_size: Option<u64>,
    /// See [`QueueDefaults::max_journal_overflow`].
    pub max_journal_overflow: Option<u64>,
    /// See [`QueueDefaults::max_journal_size_absolute`].
    pub max_journal_size_absolute: Option<u64>,
    /// See [`QueueDefaults::discard_old_when_full`].
    pub discard_old_when_full: Option<bool>,
    /// See [`QueueDefaults::keep_journal`].
    pub journal: Option<bool>,
    /// See [`QueueDefaults::sync_journal`].
    pub sync_journal: Option<bool>,
    /// Destination queue for expired items. An empty string clears the
    /// per-queue override.
    pub move_expired_to: Option<String>,
}

/// The full set of live settings for one queue.
#[derive(Debug)]
pub struct QueueSettings {
    /// Admission bound on the logical item count.
    pub max_items: OverlaySetting<usize>,
    /// Admission bound on the logical byte count.
    pub max_size: OverlaySetting<u64>,
    /// Per-item payload cap in bytes.
    pub max_item_size: OverlaySetting<u64>,
    /// Clamp on every item's effective lifetime, milliseconds.
    pub max_age_ms: OverlaySetting<u64>,
    /// Target journal size; basis for rotation decisions.
    pub max_journal_size: OverlaySetting<u64>,
    /// In-memory working-set bound driving read-behind.
    pub max_memory_size: OverlaySetting<u64>,
    /// Rotation multiplier over `max_journal_size`.
    pub max_journal_overflow: OverlaySetting<u64>,
    /// Hard journal bound that forces rotation regardless of queue size.
    pub max_journal_size_absolute: OverlaySetting<u64>,
    /// Drop head items to admit new ones instead of rejecting.
    pub discard_old_when_full: OverlaySetting<bool>,
    /// Whether mutations are journaled at all.
    pub keep_journal: OverlaySetting<bool>,
    /// Force every journal append to disk.
    pub sync_journal: OverlaySetting<bool>,
    /// Name of the queue that receives expired items.
    pub move_expired_to: OverlaySetting<Option<String>>,
}

impl QueueSettings {
    /// Creates a settings view over the shared process defaults.
    #[must_use]
    pub fn new(defaults: Arc<RwLock<QueueDefaults>>) -> Self {
        Self {
            max_items: OverlaySetting::new(Arc::clone(&defaults), |d| d.max_items),
            max_size: OverlaySetting::new(Arc::clone(&defaults), |d| d.max_size),
            max_item_size: OverlaySetting::new(Arc::clone(&defaults), |d| d.max_item_size),
            max_age_ms: OverlaySetting::new(Arc::clone(&defaults), |d| d.max_age_ms),
            max_journal_size: OverlaySetting::new(Arc::clone(&defaults), |d| d.max_journal_size),
            max_memory_size: OverlaySetting::new(Arc::clone(&defaults), |d| d.max_memory_size),
            max_journal_overflow: OverlaySetting::new(Arc::clone(&defaults), |d| {
                d.max_journal_overflow
            }),
            max_journal_size_absolute: OverlaySetting::new(Arc::clone(&defaults), |d| {
                d.max_journal_size_absolute
            }),
            discard_old_when_full: OverlaySetting::new(Arc::clone(&defaults), |d| {
                d.discard_old_when_full
            }),
            keep_journal: OverlaySetting::new(Arc::clone(&defaults), |d| d.keep_journal),
            sync_journal: OverlaySetting::new(Arc::clone(&defaults), |d| d.sync_journal),
            move_expired_to: OverlaySetting::new(defaults, |d| d.move_expired_to.clone()),
        }
    }

    /// Applies every field present in `options` as a per-queue override.
    pub fn configure(&self, options: &QueueOptions) {
        if let Some(v) = options.max_items {
            self.max_items.set(Some(v));
        }
        if let Some(v) = options.max_size {
            self.max_size.set(Some(v));
        }
        if let Some(v) = options.max_item_size {
            self.max_item_size.set(Some(v));
        }
        if let Some(v) = options.max_age_ms {
            self.max_age_ms.set(Some(v));
        }
        if let Some(v) = options.max_journal_size {
            self.max_journal_size.set(Some(v));
        }
        if let Some(v) = options.max_memory_size {
            self.max_memory_size.set(Some(v));
        }
        if let Some(v) = options.max_journal_overflow {
            self.max_journal_overflow.set(Some(v));
        }
        if let Some(v) = options.max_journal_size_absolute {
            self.max_journal_size_absolute.set(Some(v));
        }
        if let Some(v) = options.discard_old_when_full {
            self.discard_old_when_full.set(Some(v));
        }
        if let Some(v) = options.journal {
            self.keep_journal.set(Some(v));
        }
        if let Some(v) = options.sync_journal {
            self.sync_journal.set(Some(v));
        }
        if let Some(target) = options.move_expired_to.as_ref() {
            if target.is_empty() {
                self.move_expired_to.set(None);
            } else {
                self.move_expired_to.set(Some(Some(target.clone())));
            }
        }
    }
}
