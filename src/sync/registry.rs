//! Label bookkeeping for synchronized inputs.

use crate::subscription::{Source, Subscription};
use crate::types::Item;
use indexmap::IndexMap;
use std::collections::HashMap;

/// One registered input.
pub(crate) struct SourceRecord<T> {
    /// Label used as the tuple key (possibly an alias).
    pub label: String,
    /// The source's own id at registration time.
    pub source_id: String,
    pub source: Source<T>,
    pub relay: Subscription<Item<T>, Item<T>>,
}

/// Records keyed by label, plus a reverse index from source id to label.
///
/// Both maps are only ever changed together, so at any time a label maps
/// to exactly one record and a source id to exactly one label.
pub(crate) struct SourceRegistry<T> {
    by_label: IndexMap<String, SourceRecord<T>>,
    label_of: HashMap<String, String>,
}

impl<T> SourceRegistry<T> {
    pub fn new() -> Self {
        Self {
            by_label: IndexMap::new(),
            label_of: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.by_label.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_label.is_empty()
    }

    pub fn get(&self, label: &str) -> Option<&SourceRecord<T>> {
        self.by_label.get(label)
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.by_label.keys().map(String::as_str)
    }

    pub fn records(&self) -> impl Iterator<Item = &SourceRecord<T>> {
        self.by_label.values()
    }

    /// Label under which this exact source is registered.
    pub fn label_of_source(&self, source: &Source<T>) -> Option<String> {
        let label = self.label_of.get(source.id())?;
        let record = self.by_label.get(label)?;
        record.source.same_as(source).then(|| label.clone())
    }

    /// Insert `record`, evicting whatever held its label or its source id.
    pub fn insert(&mut self, record: SourceRecord<T>) -> Vec<SourceRecord<T>> {
        let mut evicted = Vec::new();
        if let Some(old) = self.remove(&record.label) {
            evicted.push(old);
        }
        if let Some(label) = self.label_of.get(&record.source_id).cloned() {
            if let Some(old) = self.remove(&label) {
                evicted.push(old);
            }
        }
        self.label_of
            .insert(record.source_id.clone(), record.label.clone());
        self.by_label.insert(record.label.clone(), record);
        evicted
    }

    pub fn remove(&mut self, label: &str) -> Option<SourceRecord<T>> {
        let record = self.by_label.shift_remove(label)?;
        self.label_of.remove(&record.source_id);
        Some(record)
    }

    pub fn drain(&mut self) -> Vec<SourceRecord<T>> {
        self.label_of.clear();
        self.by_label.drain(..).map(|(_, record)| record).collect()
    }

    /// Both indices agree with each other.
    pub fn is_consistent(&self) -> bool {
        self.label_of.len() == self.by_label.len()
            && self.by_label.iter().all(|(label, record)| {
                record.label == *label
                    && self.label_of.get(&record.source_id) == Some(label)
            })
    }
}
