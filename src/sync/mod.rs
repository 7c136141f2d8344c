//! Synchronized join of labeled inputs.
//!
//! A [`StreamSync`] records every received value under its input's label
//! and emits [`Tuple`] snapshots of the current per-label values, as decided
//! by its [`KeyedJoin`] buffer:
//! - Inputs are labeled by their id unless an alias is given
//! - Labels are registered before the input is wired, so the first tuple
//!   always waits for every known input
//! - Finished inputs are removed automatically
//!
//! # Example
//!
//! ```ignore
//! let a = Subscription::<Item<i32>>::named("a");
//! let b = Subscription::<Item<i32>>::named("b");
//! let sync =
//!     StreamSync::with_sources(SyncOpts::default(), [a.clone().into(), b.clone().into()])?;
//! let _out = sync.subscribe(Subscriber::new(|t| println!("{t:?}")));
//! a.next(Item::Value(1));
//! b.next(Item::Value(2)); // {"a": 1, "b": 2}
//! ```

mod join;
mod registry;

pub use join::{JoinConfig, KeyedJoin};

use crate::error::{Result, StreamError};
use crate::subscription::{
    Sink, Source, SourceKey, Subscribable, SubscribableExt, Subscriber, Subscription,
    SubscriptionOpts,
};
use crate::types::{CloseMode, Item, State, Tuple};
use crate::xform::Transform;
use indexmap::IndexMap;
use registry::{SourceRecord, SourceRegistry};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use tracing::{debug, info, warn};

/// Configuration for a [`StreamSync`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncOpts {
    /// Explicit node id (None = `streamsync-<uid>`).
    pub id: Option<String>,

    /// When the join finishes as inputs finish.
    /// Default: `Last`
    pub close: CloseMode,

    /// When the join tears itself down as its own subscribers leave.
    /// Default: `Last`
    pub close_out: CloseMode,

    /// Buffering policy.
    #[serde(flatten)]
    pub join: JoinConfig,
}

impl SyncOpts {
    pub fn id(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..Default::default()
        }
    }

    pub fn close(mut self, mode: CloseMode) -> Self {
        self.close = mode;
        self
    }

    pub fn close_out(mut self, mode: CloseMode) -> Self {
        self.close_out = mode;
        self
    }

    pub fn reset(mut self, reset: bool) -> Self {
        self.join.reset = reset;
        self
    }

    pub fn merge_only(mut self, merge_only: bool) -> Self {
        self.join.merge_only = merge_only;
        self
    }

    pub fn all(mut self, all: bool) -> Self {
        self.join.all = all;
        self
    }

    pub fn back_pressure(mut self, capacity: usize) -> Self {
        self.join.back_pressure = Some(capacity);
        self
    }

    /// Parse options from JSON, e.g. `{"reset": true, "close": "first"}`.
    pub fn from_json(json: &str) -> Result<Self> {
        let opts: SyncOpts = serde_json::from_str(json)?;
        opts.join.validate()?;
        Ok(opts)
    }
}

struct SyncShared<T> {
    core: Subscription<Tuple<T>, Tuple<T>>,
    close: CloseMode,
    join: RefCell<KeyedJoin<T>>,
    registry: RefCell<SourceRegistry<T>>,
}

impl<T: Clone + 'static> SyncShared<T> {
    fn ensure_state(&self) -> Result<()> {
        if self.core.state().is_terminal() || self.core.is_unsubscribed() {
            return Err(StreamError::IllegalState {
                id: self.core.id().to_string(),
                state: self.core.state(),
            });
        }
        Ok(())
    }

    fn add(self: &Rc<Self>, source: Source<T>, label: Option<String>) -> Result<()> {
        self.ensure_state()?;
        let label = label.unwrap_or_else(|| source.id().to_string());
        let key = source.key();

        // The key must be known before the first value can arrive.
        self.join.borrow_mut().add_key(label.clone());

        let relay = source.subscribe_with(
            self.relay_subscriber(label.clone(), key),
            Transform::identity(),
            SubscriptionOpts::id(format!("in-{label}")),
        );
        debug!(id = %self.core.id(), source = %source.id(), label = %label, "add source");

        let record = SourceRecord {
            label: label.clone(),
            source_id: source.id().to_string(),
            source,
            relay: relay.clone(),
        };
        let evicted = self.registry.borrow_mut().insert(record);

        let mut flushed = Vec::new();
        for old in &evicted {
            if old.label != label {
                flushed.extend(self.join.borrow_mut().remove_key(&old.label));
            }
        }
        for old in evicted {
            debug!(
                id = %self.core.id(),
                source = %old.source_id,
                label = %old.label,
                "replace source"
            );
            old.relay.unsubscribe();
        }
        self.emit(flushed);

        if relay.state() == State::Done {
            self.mark_done(&label, key);
        }
        Ok(())
    }

    /// Strong references: an input holding the relay keeps the join alive.
    fn relay_subscriber(self: &Rc<Self>, label: String, key: SourceKey) -> Subscriber<Item<T>> {
        let on_next = Rc::clone(self);
        let on_done = Rc::clone(self);
        let on_error = Rc::clone(self);
        let done_label = label.clone();
        Subscriber::new(move |item: Item<T>| match item {
            Item::Value(v) => on_next.receive(&label, v),
            Item::Source(src) => {
                if let Err(e) = on_next.add(src, None) {
                    warn!(id = %on_next.core.id(), error = %e, "cannot add dynamic source");
                }
            }
        })
        .on_done(move || on_done.mark_done(&done_label, key))
        .on_error(move |e| on_error.core.error(e.clone()))
        .owned_by(self.core.id())
    }

    fn receive(&self, label: &str, value: T) {
        let res = self.join.borrow_mut().push(label, value);
        match res {
            Ok(tuples) => self.emit(tuples),
            Err(e) => {
                warn!(id = %self.core.id(), error = %e, "join failed");
                self.core.error(e);
            }
        }
    }

    fn emit(&self, tuples: Vec<Tuple<T>>) {
        for tuple in tuples {
            self.core.next(tuple);
        }
    }

    /// Remove `labels` from every index at once, then release their relays.
    /// Returns false if any label wasn't registered.
    fn remove_labels(&self, labels: &[String]) -> bool {
        let mut ok = true;
        let mut records = Vec::new();
        {
            let mut registry = self.registry.borrow_mut();
            for label in labels {
                match registry.remove(label) {
                    Some(record) => records.push(record),
                    None => ok = false,
                }
            }
        }
        if records.is_empty() {
            return ok;
        }

        let flushed = self
            .join
            .borrow_mut()
            .remove_keys(records.iter().map(|r| r.label.as_str()));
        for record in records {
            info!(id = %self.core.id(), "removing src: {} ({})", record.source_id, record.label);
            record.relay.unsubscribe();
        }
        self.emit(flushed);
        ok
    }

    fn mark_done(&self, label: &str, key: SourceKey) {
        let tracked = self
            .registry
            .borrow()
            .get(label)
            .map_or(false, |r| r.source.key() == key);
        if !tracked || !self.remove_labels(&[label.to_string()]) {
            return;
        }
        let close = match self.close {
            CloseMode::First => true,
            CloseMode::Last => self.registry.borrow().is_empty(),
            CloseMode::Never => false,
        };
        if close {
            self.core.done();
            self.release_all();
        }
    }

    /// Forget join keys that were registered ahead of wiring but never got
    /// a record.
    fn drop_unwired(&self, labels: &[String]) {
        let stale: Vec<&str> = {
            let registry = self.registry.borrow();
            labels
                .iter()
                .map(String::as_str)
                .filter(|label| registry.get(label).is_none())
                .collect()
        };
        if !stale.is_empty() {
            debug!(id = %self.core.id(), keys = ?stale, "dropping unwired keys");
            self.join.borrow_mut().remove_keys(stale);
        }
    }

    fn release_all(&self) {
        let drained = self.registry.borrow_mut().drain();
        self.join.borrow_mut().clear();
        for record in drained {
            record.relay.unsubscribe();
        }
    }
}

/// N labeled inputs to one output of [`Tuple`] snapshots.
///
/// Cloning the handle shares the join. Registered inputs keep the join alive
/// until it finishes or is unsubscribed.
pub struct StreamSync<T> {
    shared: Rc<SyncShared<T>>,
}

impl<T: Clone + 'static> StreamSync<T> {
    pub fn new(opts: SyncOpts) -> Result<Self> {
        Self::with_transform(opts, Transform::identity())
    }

    /// Create a join whose tuples run through `xform` before reaching
    /// subscribers.
    pub fn with_transform(opts: SyncOpts, xform: Transform<Tuple<T>, Tuple<T>>) -> Result<Self> {
        let join = KeyedJoin::new(opts.join)?;
        let core = Subscription::from_parts(
            SubscriptionOpts {
                id: opts.id,
                close_out: opts.close_out,
            },
            "streamsync",
            None,
            xform,
        );
        let shared = Rc::new(SyncShared {
            core,
            close: opts.close,
            join: RefCell::new(join),
            registry: RefCell::new(SourceRegistry::new()),
        });

        let weak = Rc::downgrade(&shared);
        shared.core.set_teardown(move || {
            if let Some(shared) = weak.upgrade() {
                shared.release_all();
            }
        });

        Ok(Self { shared })
    }

    /// Create a join over `sources`, each labeled by its id.
    pub fn with_sources(
        opts: SyncOpts,
        sources: impl IntoIterator<Item = Source<T>>,
    ) -> Result<Self> {
        let sync = Self::new(opts)?;
        sync.add_all(sources)?;
        Ok(sync)
    }

    /// Create a join over `(label, source)` pairs.
    pub fn with_labeled_sources<L: Into<String>>(
        opts: SyncOpts,
        sources: impl IntoIterator<Item = (L, Source<T>)>,
    ) -> Result<Self> {
        let sync = Self::new(opts)?;
        sync.add_all_labeled(sources)?;
        Ok(sync)
    }

    /// Add `source`, labeled by its own id.
    pub fn add(&self, source: Source<T>) -> Result<()> {
        self.shared.add(source, None)
    }

    /// Add `source` under an alias label.
    pub fn add_as(&self, source: Source<T>, label: impl Into<String>) -> Result<()> {
        self.shared.add(source, Some(label.into()))
    }

    pub fn add_all(&self, sources: impl IntoIterator<Item = Source<T>>) -> Result<()> {
        let sources: Vec<(String, Source<T>)> = sources
            .into_iter()
            .map(|s| (s.id().to_string(), s))
            .collect();
        self.add_all_labeled(sources)
    }

    /// Add every pair, registering all labels before wiring the first input.
    pub fn add_all_labeled<L: Into<String>>(
        &self,
        sources: impl IntoIterator<Item = (L, Source<T>)>,
    ) -> Result<()> {
        self.shared.ensure_state()?;
        let sources: Vec<(String, Source<T>)> = sources
            .into_iter()
            .map(|(label, s)| (label.into(), s))
            .collect();
        let labels: Vec<String> = sources.iter().map(|(label, _)| label.clone()).collect();
        {
            let mut join = self.shared.join.borrow_mut();
            for label in &labels {
                join.add_key(label.clone());
            }
        }
        for (label, source) in sources {
            if let Err(e) = self.shared.add(source, Some(label)) {
                self.shared.drop_unwired(&labels);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Remove `source`. Returns false if it wasn't registered.
    pub fn remove(&self, source: &Source<T>) -> bool {
        let label = self.shared.registry.borrow().label_of_source(source);
        match label {
            Some(label) => self.shared.remove_labels(&[label]),
            None => false,
        }
    }

    /// Remove the input registered under `label`.
    pub fn remove_by_id(&self, label: &str) -> bool {
        self.shared.remove_labels(&[label.to_string()])
    }

    /// Remove several inputs at once. Returns true only if all were registered.
    pub fn remove_all<'a>(&self, sources: impl IntoIterator<Item = &'a Source<T>>) -> bool {
        let mut ok = true;
        let mut labels = Vec::new();
        {
            let registry = self.shared.registry.borrow();
            for source in sources {
                match registry.label_of_source(source) {
                    Some(label) => labels.push(label),
                    None => ok = false,
                }
            }
        }
        self.shared.remove_labels(&labels) && ok
    }

    pub fn remove_all_ids<'a>(&self, labels: impl IntoIterator<Item = &'a str>) -> bool {
        let labels: Vec<String> = labels.into_iter().map(str::to_string).collect();
        self.shared.remove_labels(&labels)
    }

    /// The input registered under `label`.
    pub fn source_for_id(&self, label: &str) -> Option<Source<T>> {
        self.shared
            .registry
            .borrow()
            .get(label)
            .map(|r| r.source.clone())
    }

    /// All inputs by label, in registration order.
    pub fn sources(&self) -> IndexMap<String, Source<T>> {
        self.shared
            .registry
            .borrow()
            .records()
            .map(|r| (r.label.clone(), r.source.clone()))
            .collect()
    }

    pub fn labels(&self) -> Vec<String> {
        self.shared
            .registry
            .borrow()
            .labels()
            .map(str::to_string)
            .collect()
    }

    pub fn source_count(&self) -> usize {
        self.shared.registry.borrow().len()
    }

    /// Registry, reverse index and join key set all describe the same inputs,
    /// each observed by exactly one live relay.
    pub fn is_consistent(&self) -> bool {
        let registry = self.shared.registry.borrow();
        let join = self.shared.join.borrow();
        registry.is_consistent()
            && registry.len() == join.key_count()
            && registry
                .records()
                .all(|r| join.contains_key(&r.label) && !r.relay.is_unsubscribed())
    }

    pub fn config(&self) -> JoinConfig {
        self.shared.join.borrow().config().clone()
    }

    pub fn id(&self) -> &str {
        self.shared.core.id()
    }

    pub fn state(&self) -> State {
        self.shared.core.state()
    }

    pub fn last_error(&self) -> Option<StreamError> {
        self.shared.core.last_error()
    }

    /// Unsubscribe every relay, forget all inputs and labels and finish.
    pub fn unsubscribe(&self) -> bool {
        self.shared.core.unsubscribe()
    }
}

impl<T: Clone + 'static> Subscribable<Tuple<T>> for StreamSync<T> {
    fn id(&self) -> &str {
        self.shared.core.id()
    }

    fn uid(&self) -> u64 {
        self.shared.core.uid()
    }

    fn state(&self) -> State {
        self.shared.core.state()
    }

    fn attach(&self, sink: Rc<dyn Sink<Tuple<T>>>) {
        Subscribable::attach(&self.shared.core, sink);
    }

    fn detach(&self, uid: u64) -> bool {
        Subscribable::detach(&self.shared.core, uid)
    }

    fn unsubscribe(&self) -> bool {
        self.shared.core.unsubscribe()
    }
}

impl<T> Clone for StreamSync<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Rc::clone(&self.shared),
        }
    }
}

impl<T> fmt::Debug for StreamSync<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamSync")
            .field("core", &self.shared.core)
            .field("close", &self.shared.close)
            .field("sources", &self.shared.registry.borrow().len())
            .finish()
    }
}
