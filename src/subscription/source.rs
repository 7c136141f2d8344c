//! Input handles for combinators.

use crate::types::{Item, State};
use std::fmt;
use std::rc::Rc;

use super::node::Sink;
use super::{Subscribable, Subscription};

/// Identity of a [`Source`]: the uid of the node behind it.
pub(crate) type SourceKey = u64;

/// Cloneable handle to a stream of [`Item`]s, used as a combinator input.
///
/// Two handles are the same source iff they wrap the same node, however
/// many times that node was wrapped.
pub struct Source<T>(Rc<dyn Subscribable<Item<T>>>);

impl<T> Source<T> {
    pub fn new(stream: impl Subscribable<Item<T>> + 'static) -> Self {
        Source(Rc::new(stream))
    }

    pub fn id(&self) -> &str {
        self.0.id()
    }

    pub fn state(&self) -> State {
        self.0.state()
    }

    pub fn same_as(&self, other: &Source<T>) -> bool {
        self.key() == other.key()
    }

    pub(crate) fn key(&self) -> SourceKey {
        self.0.uid()
    }
}

impl<T> Clone for Source<T> {
    fn clone(&self) -> Self {
        Source(Rc::clone(&self.0))
    }
}

impl<T> fmt::Debug for Source<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Source")
            .field("id", &self.id())
            .field("state", &self.state())
            .finish()
    }
}

impl<T> Subscribable<Item<T>> for Source<T> {
    fn id(&self) -> &str {
        self.0.id()
    }

    fn uid(&self) -> u64 {
        self.0.uid()
    }

    fn state(&self) -> State {
        self.0.state()
    }

    fn attach(&self, sink: Rc<dyn Sink<Item<T>>>) {
        self.0.attach(sink);
    }

    fn detach(&self, uid: u64) -> bool {
        self.0.detach(uid)
    }

    fn unsubscribe(&self) -> bool {
        self.0.unsubscribe()
    }
}

impl<A: 'static, T: Clone + 'static> From<Subscription<A, Item<T>>> for Source<T> {
    fn from(sub: Subscription<A, Item<T>>) -> Self {
        Source::new(sub)
    }
}
