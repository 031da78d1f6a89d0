//! In-process backend.
//!
//! Each key owns its own mutex, so unrelated identifiers never serialize
//! behind one another. Expiry is lazy on access; `purge_expired` sweeps.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::{ApplyFn, Backend, BackendKind};
use crate::clock::{Clock, SystemClock};
use crate::error::{QuotaError, Result};

#[derive(Debug, Clone)]
enum Value {
    Counter(u64),
    Record(String),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: f64,
}

#[derive(Debug, Default)]
struct Slot {
    /// Set by purge once the slot has been unlinked from the map.
    retired: bool,
    entry: Option<Entry>,
}

impl Slot {
    fn live(&self, now: f64) -> Option<&Entry> {
        self.entry.as_ref().filter(|e| e.expires_at > now)
    }
}

pub struct MemoryBackend {
    slots: DashMap<String, Arc<Mutex<Slot>>>,
    clock: Arc<dyn Clock>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            slots: DashMap::new(),
            clock,
        }
    }

    /// Number of slots currently held, expired or not.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn slot(&self, key: &str) -> Arc<Mutex<Slot>> {
        if let Some(slot) = self.slots.get(key) {
            return slot.clone();
        }
        self.slots.entry(key.to_string()).or_default().clone()
    }

    /// Runs `f` under the key's lock. A slot retired by a concurrent purge is
    /// re-fetched so the write never lands in an unlinked slot.
    fn with_slot<T>(&self, key: &str, mut f: impl FnMut(&mut Slot, f64) -> Result<T>) -> Result<T> {
        loop {
            let slot = self.slot(key);
            let mut guard = slot.lock();
            if guard.retired {
                continue;
            }
            let now = self.clock.now();
            return f(&mut guard, now);
        }
    }

    fn peek<T>(&self, key: &str, f: impl FnOnce(&Entry) -> Option<T>) -> Option<T> {
        let slot = self.slots.get(key)?.clone();
        let guard = slot.lock();
        guard.live(self.clock.now()).and_then(f)
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn record_of(entry: &Entry) -> Result<&str> {
    match &entry.value {
        Value::Record(text) => Ok(text),
        Value::Counter(_) => Err(QuotaError::backend("expected a record, found a counter")),
    }
}

impl Backend for MemoryBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Memory
    }

    fn increment_and_get(&self, key: &str, ttl: Duration) -> Result<u64> {
        self.with_slot(key, |slot, now| {
            let count = match slot.live(now).map(|e| &e.value) {
                Some(Value::Counter(count)) => count + 1,
                Some(Value::Record(_)) => {
                    return Err(QuotaError::backend("expected a counter, found a record"))
                }
                None => 1,
            };
            let expires_at = match slot.live(now) {
                Some(existing) => existing.expires_at,
                None => now + ttl.as_secs_f64(),
            };
            slot.entry = Some(Entry {
                value: Value::Counter(count),
                expires_at,
            });
            Ok(count)
        })
    }

    fn read_counter(&self, key: &str) -> Result<Option<u64>> {
        Ok(self.peek(key, |entry| match entry.value {
            Value::Counter(count) => Some(count),
            Value::Record(_) => None,
        }))
    }

    fn read_structured(&self, key: &str) -> Result<Option<String>> {
        let slot = match self.slots.get(key) {
            Some(slot) => slot.clone(),
            None => return Ok(None),
        };
        let guard = slot.lock();
        match guard.live(self.clock.now()) {
            Some(entry) => record_of(entry).map(|text| Some(text.to_string())),
            None => Ok(None),
        }
    }

    fn write_structured(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.with_slot(key, |slot, now| {
            slot.entry = Some(Entry {
                value: Value::Record(value.to_string()),
                expires_at: now + ttl.as_secs_f64(),
            });
            Ok(())
        })
    }

    fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
        ttl: Duration,
    ) -> Result<bool> {
        self.with_slot(key, |slot, now| {
            let current = match slot.live(now) {
                Some(entry) => Some(record_of(entry)?),
                None => None,
            };
            if current != expected {
                return Ok(false);
            }
            slot.entry = Some(Entry {
                value: Value::Record(new.to_string()),
                expires_at: now + ttl.as_secs_f64(),
            });
            Ok(true)
        })
    }

    fn read_modify_write(&self, key: &str, ttl: Duration, apply: &mut ApplyFn<'_>) -> Result<()> {
        self.with_slot(key, |slot, now| {
            let next = match slot.live(now) {
                Some(entry) => apply(Some(record_of(entry)?))?,
                None => apply(None)?,
            };
            slot.entry = Some(Entry {
                value: Value::Record(next),
                expires_at: now + ttl.as_secs_f64(),
            });
            Ok(())
        })
    }

    fn delete(&self, key: &str) -> Result<bool> {
        if !self.slots.contains_key(key) {
            return Ok(false);
        }
        self.with_slot(key, |slot, now| {
            let existed = slot.live(now).is_some();
            slot.entry = None;
            Ok(existed)
        })
    }

    fn purge_expired(&self) -> Result<u64> {
        let now = self.clock.now();
        let mut removed = 0u64;
        // Slots locked by an in-flight decision are skipped; the next sweep gets them.
        self.slots.retain(|_, slot| match slot.try_lock() {
            Some(mut guard) if guard.live(now).is_none() => {
                guard.retired = true;
                if guard.entry.is_some() {
                    removed += 1;
                }
                false
            }
            _ => true,
        });
        debug!(removed = removed, "Purged expired in-memory entries");
        Ok(removed)
    }
}
