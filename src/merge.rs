//! Merging any number of inputs into one output.
//!
//! A [`StreamMerge`] forwards every value received from any of its current
//! inputs, unmodified and in arrival order. Inputs can be added and removed
//! while the merge is live; an input emitting [`Item::Source`] adds that
//! stream as a further input instead of forwarding it.
//!
//! # Example
//!
//! ```ignore
//! let a = Subscription::<Item<i32>>::named("a");
//! let b = Subscription::<Item<i32>>::named("b");
//! let merge =
//!     StreamMerge::with_sources(MergeOpts::default(), [a.clone().into(), b.clone().into()])?;
//! let _out = merge.subscribe(Subscriber::new(|x| println!("{x}")));
//! a.next(Item::Value(1));
//! b.next(Item::Value(2));
//! ```

use crate::error::{Result, StreamError};
use crate::subscription::{
    Sink, Source, SourceKey, Subscribable, SubscribableExt, Subscriber, Subscription,
    SubscriptionOpts,
};
use crate::types::{CloseMode, Item, State};
use crate::xform::Transform;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use tracing::{debug, warn};

/// Configuration for a [`StreamMerge`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeOpts {
    /// Explicit node id (None = `streammerge-<uid>`).
    pub id: Option<String>,

    /// When the merge finishes as inputs finish.
    /// Default: `Last`
    pub close: CloseMode,

    /// When the merge tears itself down as its own subscribers leave.
    /// Default: `Last`
    pub close_out: CloseMode,
}

impl MergeOpts {
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
}

/// A tracked input and the relay observing it.
struct Tracked<T> {
    source: Source<T>,
    relay: Subscription<Item<T>, Item<T>>,
}

struct MergeShared<T> {
    core: Subscription<T, T>,
    close: CloseMode,
    sources: RefCell<IndexMap<SourceKey, Tracked<T>>>,
}

impl<T: Clone + 'static> MergeShared<T> {
    fn ensure_state(&self) -> Result<()> {
        if self.core.state().is_terminal() || self.core.is_unsubscribed() {
            return Err(StreamError::IllegalState {
                id: self.core.id().to_string(),
                state: self.core.state(),
            });
        }
        Ok(())
    }

    fn add(self: &Rc<Self>, source: Source<T>) -> Result<()> {
        self.ensure_state()?;
        let key = source.key();
        let relay = source.subscribe_with(
            self.relay_subscriber(key),
            Transform::identity(),
            SubscriptionOpts::id(format!("in-{}", source.id())),
        );
        debug!(id = %self.core.id(), source = %source.id(), "add source");

        let previous = self
            .sources
            .borrow_mut()
            .insert(key, Tracked { source, relay: relay.clone() });
        if let Some(prev) = previous {
            prev.relay.unsubscribe();
        }

        // Subscribing to a finished input completes the relay immediately,
        // before it was tracked.
        if relay.state() == State::Done {
            self.mark_done(key);
        }
        Ok(())
    }

    /// The relay's callbacks keep the merge alive for as long as the input
    /// holds the relay; removing the relay breaks that cycle.
    fn relay_subscriber(self: &Rc<Self>, key: SourceKey) -> Subscriber<Item<T>> {
        let on_next = Rc::clone(self);
        let on_done = Rc::clone(self);
        let on_error = Rc::clone(self);
        Subscriber::new(move |item: Item<T>| match item {
            Item::Value(v) => on_next.core.next(v),
            Item::Source(src) => {
                if let Err(e) = on_next.add(src) {
                    warn!(id = %on_next.core.id(), error = %e, "cannot add dynamic source");
                }
            }
        })
        .on_done(move || on_done.mark_done(key))
        .on_error(move |e| on_error.core.error(e.clone()))
        .owned_by(self.core.id())
    }

    fn remove_key(&self, key: SourceKey) -> bool {
        let tracked = self.sources.borrow_mut().shift_remove(&key);
        match tracked {
            Some(tracked) => {
                debug!(id = %self.core.id(), source = %tracked.source.id(), "remove source");
                tracked.relay.unsubscribe();
                true
            }
            None => false,
        }
    }

    fn key_for_id(&self, id: &str) -> Option<SourceKey> {
        self.sources
            .borrow()
            .iter()
            .find(|(_, t)| t.source.id() == id)
            .map(|(key, _)| *key)
    }

    fn mark_done(&self, key: SourceKey) {
        if !self.remove_key(key) {
            return;
        }
        let close = match self.close {
            CloseMode::First => true,
            CloseMode::Last => self.sources.borrow().is_empty(),
            CloseMode::Never => false,
        };
        if close {
            self.core.done();
            self.release_all();
        }
    }

    fn release_all(&self) {
        let drained = std::mem::take(&mut *self.sources.borrow_mut());
        for (_, tracked) in drained {
            tracked.relay.unsubscribe();
        }
    }
}

/// N inputs to one output, pass-through, with dynamic membership.
///
/// Cloning the handle shares the merge. Tracked inputs keep the merge alive
/// until it finishes or is unsubscribed, so a handle may be dropped once the
/// merge is wired into a larger graph.
pub struct StreamMerge<T> {
    shared: Rc<MergeShared<T>>,
}

impl<T: Clone + 'static> StreamMerge<T> {
    pub fn new(opts: MergeOpts) -> Self {
        Self::with_transform(opts, Transform::identity())
    }

    /// Create a merge whose merged values run through `xform` before
    /// reaching subscribers. The transform's flush runs when the merge
    /// finishes.
    pub fn with_transform(opts: MergeOpts, xform: Transform<T, T>) -> Self {
        let core = Subscription::from_parts(
            SubscriptionOpts {
                id: opts.id,
                close_out: opts.close_out,
            },
            "streammerge",
            None,
            xform,
        );
        let shared = Rc::new(MergeShared {
            core,
            close: opts.close,
            sources: RefCell::new(IndexMap::new()),
        });

        let weak = Rc::downgrade(&shared);
        shared.core.set_teardown(move || {
            if let Some(shared) = weak.upgrade() {
                shared.release_all();
            }
        });

        Self { shared }
    }

    /// Create a merge and add `sources` in order.
    pub fn with_sources(
        opts: MergeOpts,
        sources: impl IntoIterator<Item = Source<T>>,
    ) -> Result<Self> {
        let merge = Self::new(opts);
        merge.add_all(sources)?;
        Ok(merge)
    }

    /// Start tracking `source`. Re-adding a tracked source replaces its relay.
    pub fn add(&self, source: Source<T>) -> Result<()> {
        self.shared.add(source)
    }

    pub fn add_all(&self, sources: impl IntoIterator<Item = Source<T>>) -> Result<()> {
        for source in sources {
            self.shared.add(source)?;
        }
        Ok(())
    }

    /// Stop tracking `source`. Returns false if it wasn't tracked.
    pub fn remove(&self, source: &Source<T>) -> bool {
        self.shared.remove_key(source.key())
    }

    /// Stop tracking the first input with the given id.
    pub fn remove_by_id(&self, id: &str) -> bool {
        match self.shared.key_for_id(id) {
            Some(key) => self.shared.remove_key(key),
            None => false,
        }
    }

    /// Returns true only if every source was tracked.
    pub fn remove_all<'a>(&self, sources: impl IntoIterator<Item = &'a Source<T>>) -> bool {
        sources
            .into_iter()
            .fold(true, |ok, source| self.remove(source) && ok)
    }

    pub fn remove_all_ids<'a>(&self, ids: impl IntoIterator<Item = &'a str>) -> bool {
        ids.into_iter()
            .fold(true, |ok, id| self.remove_by_id(id) && ok)
    }

    pub fn contains(&self, source: &Source<T>) -> bool {
        self.shared.sources.borrow().contains_key(&source.key())
    }

    pub fn source_count(&self) -> usize {
        self.shared.sources.borrow().len()
    }

    /// Tracked inputs in insertion order.
    pub fn sources(&self) -> Vec<Source<T>> {
        self.shared
            .sources
            .borrow()
            .values()
            .map(|t| t.source.clone())
            .collect()
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

    /// Unsubscribe every relay, forget all inputs and finish.
    pub fn unsubscribe(&self) -> bool {
        self.shared.core.unsubscribe()
    }
}

impl<T: Clone + 'static> Subscribable<T> for StreamMerge<T> {
    fn id(&self) -> &str {
        self.shared.core.id()
    }

    fn uid(&self) -> u64 {
        self.shared.core.uid()
    }

    fn state(&self) -> State {
        self.shared.core.state()
    }

    fn attach(&self, sink: Rc<dyn Sink<T>>) {
        Subscribable::attach(&self.shared.core, sink);
    }

    fn detach(&self, uid: u64) -> bool {
        Subscribable::detach(&self.shared.core, uid)
    }

    fn unsubscribe(&self) -> bool {
        self.shared.core.unsubscribe()
    }
}

impl<T> Clone for StreamMerge<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Rc::clone(&self.shared),
        }
    }
}

impl<T> fmt::Debug for StreamMerge<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamMerge")
            .field("core", &self.shared.core)
            .field("close", &self.shared.close)
            .field("sources", &self.shared.sources.borrow().len())
            .finish()
    }
}
