//! Keyed join buffer.
//!
//! Collects labeled values and decides when a tuple snapshot is complete
//! enough to emit. Two modes:
//!
//! - **Latest value** (default): one slot per key. A tuple is emitted once
//!   every expected key has a value; afterwards either on every change
//!   (stale values retained) or, with `reset`, only after every key was
//!   refreshed.
//! - **Back pressure**: a bounded FIFO per key. Tuples are emitted while every
//!   key has a queued value, consuming the oldest of each. A full queue is a
//!   hard error, never a drop.

use crate::error::{Result, StreamError};
use crate::types::Tuple;
use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::debug;

/// Join buffer configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JoinConfig {
    /// Emit a (possibly partial) tuple for every value, no synchronization.
    pub merge_only: bool,

    /// Require a fresh value from every key before each emission.
    pub reset: bool,

    /// Only ever emit complete tuples. When false, an un-emitted partial
    /// tuple is flushed once keys disappear and the rest is complete (or no
    /// keys are left).
    /// Default: true
    pub all: bool,

    /// Per-key queue capacity (None = latest value only). Implies `reset`.
    /// Ignored when `merge_only` is set.
    pub back_pressure: Option<usize>,
}

impl Default for JoinConfig {
    fn default() -> Self {
        Self {
            merge_only: false,
            reset: false,
            all: true,
            back_pressure: None,
        }
    }
}

impl JoinConfig {
    pub fn validate(&self) -> Result<()> {
        if self.back_pressure == Some(0) {
            return Err(StreamError::InvalidConfig(
                "back_pressure must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    fn capacity(&self) -> Option<usize> {
        if self.merge_only {
            None
        } else {
            self.back_pressure
        }
    }
}

/// Accumulates values per key and emits [`Tuple`] snapshots.
#[derive(Debug)]
pub struct KeyedJoin<T> {
    config: JoinConfig,
    keys: IndexSet<String>,
    pending: IndexMap<String, T>,
    queues: IndexMap<String, VecDeque<T>>,
    /// `pending` changed since the last emission.
    dirty: bool,
}

impl<T: Clone> KeyedJoin<T> {
    pub fn new(config: JoinConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            keys: IndexSet::new(),
            pending: IndexMap::new(),
            queues: IndexMap::new(),
            dirty: false,
        })
    }

    pub fn config(&self) -> &JoinConfig {
        &self.config
    }

    /// Register an expected key. Returns false if it was already expected.
    pub fn add_key(&mut self, key: impl Into<String>) -> bool {
        self.keys.insert(key.into())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.keys.contains(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.keys.iter().map(String::as_str)
    }

    pub fn key_count(&self) -> usize {
        self.keys.len()
    }

    /// Number of values held for `key` and not yet emitted.
    pub fn buffered(&self, key: &str) -> usize {
        match self.config.capacity() {
            Some(_) => self.queues.get(key).map_or(0, VecDeque::len),
            None => usize::from(self.dirty && self.pending.contains_key(key)),
        }
    }

    /// Record `value` under `key`, returning the tuples that became ready.
    ///
    /// Values for keys that aren't expected are dropped.
    pub fn push(&mut self, key: &str, value: T) -> Result<Vec<Tuple<T>>> {
        if !self.keys.contains(key) {
            debug!(key, "dropping value for unregistered key");
            return Ok(Vec::new());
        }

        match self.config.capacity() {
            None => {
                self.pending.insert(key.to_string(), value);
                if self.config.merge_only || self.is_complete() {
                    Ok(vec![self.emit_pending()])
                } else {
                    self.dirty = true;
                    Ok(Vec::new())
                }
            }
            Some(capacity) => {
                let queue = self.queues.entry(key.to_string()).or_default();
                if queue.len() >= capacity {
                    return Err(StreamError::Overflow {
                        key: key.to_string(),
                        capacity,
                    });
                }
                queue.push_back(value);
                Ok(self.drain_queues())
            }
        }
    }

    pub fn remove_key(&mut self, key: &str) -> Vec<Tuple<T>> {
        self.remove_keys([key])
    }

    /// Stop expecting `keys`, dropping their values. Returns the tuples
    /// flushed as a consequence (only ever non-empty when `all` is false).
    pub fn remove_keys<'a>(&mut self, keys: impl IntoIterator<Item = &'a str>) -> Vec<Tuple<T>> {
        let mut orphaned = Tuple::new();
        let mut removed = false;
        for key in keys {
            if !self.keys.shift_remove(key) {
                continue;
            }
            removed = true;
            if let Some(v) = self.pending.shift_remove(key) {
                orphaned.insert(key.to_string(), v);
            }
            if let Some(v) = self.queues.shift_remove(key).and_then(|mut q| q.pop_front()) {
                orphaned.insert(key.to_string(), v);
            }
        }
        if !removed {
            return Vec::new();
        }

        let unemitted = match self.config.capacity() {
            Some(_) => !orphaned.is_empty(),
            None => self.dirty,
        };
        if self.pending.is_empty() {
            self.dirty = false;
        }
        if self.config.all {
            return Vec::new();
        }

        if self.keys.is_empty() {
            self.dirty = false;
            if unemitted && !orphaned.is_empty() {
                return vec![orphaned];
            }
            return Vec::new();
        }

        match self.config.capacity() {
            Some(_) => self.drain_queues(),
            None if self.dirty && self.is_complete() => vec![self.emit_pending()],
            None => Vec::new(),
        }
    }

    /// Forget all keys and buffered values.
    pub fn clear(&mut self) {
        self.keys.clear();
        self.pending.clear();
        self.queues.clear();
        self.dirty = false;
    }

    fn is_complete(&self) -> bool {
        !self.keys.is_empty() && self.keys.iter().all(|k| self.pending.contains_key(k))
    }

    fn emit_pending(&mut self) -> Tuple<T> {
        let snapshot: Tuple<T> = self
            .pending
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if self.config.reset {
            self.pending.clear();
        }
        self.dirty = false;
        snapshot
    }

    fn drain_queues(&mut self) -> Vec<Tuple<T>> {
        let mut out = Vec::new();
        while !self.keys.is_empty()
            && self
                .keys
                .iter()
                .all(|k| self.queues.get(k).map_or(false, |q| !q.is_empty()))
        {
            let mut tuple = Tuple::new();
            for key in &self.keys {
                if let Some(v) = self.queues.get_mut(key).and_then(VecDeque::pop_front) {
                    tuple.insert(key.clone(), v);
                }
            }
            out.push(tuple);
        }
        out
    }
}
