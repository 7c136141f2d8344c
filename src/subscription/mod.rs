//! Subscriptions: synchronous push-based propagation nodes.
//!
//! Every stream in the crate is a graph of [`Subscription`] nodes:
//! - A node owns its downstream edges (strongly) in registration order
//! - A node points at its upstream weakly, only to detach itself
//! - Values run through the node's [`Transform`] before fan-out
//!
//! Propagation is depth-first: `next()` returns once the value reached every
//! consumer, nested combinators included. Structural changes made from inside
//! a callback take effect for the following value; detached edges stop
//! receiving at once.
//!
//! # Example
//!
//! ```ignore
//! let src = Subscription::<i32>::new();
//! let doubled = src.transform(Transform::map(|x: i32| x * 2));
//! let _sub = doubled.subscribe(Subscriber::new(|x| println!("{x}")));
//! src.next(21); // prints 42
//! ```
//!
//! [`Transform`]: crate::xform::Transform

mod node;
mod source;
mod types;

pub use node::{Sink, Subscription, Upstream};
pub use source::Source;
pub(crate) use source::SourceKey;
pub use types::{Subscriber, SubscriptionOpts};

use crate::types::{Item, State};
use crate::xform::Transform;
use std::rc::Rc;

/// Anything that can be observed by attaching downstream consumers.
///
/// This trait is object safe; the generic conveniences live in
/// [`SubscribableExt`].
pub trait Subscribable<T> {
    /// Stable string id.
    fn id(&self) -> &str;

    /// Process-unique numeric id.
    fn uid(&self) -> u64;

    fn state(&self) -> State;

    /// Attach a downstream sink.
    fn attach(&self, sink: Rc<dyn Sink<T>>);

    /// Detach the downstream sink with the given uid.
    fn detach(&self, uid: u64) -> bool;

    /// Tear this node down. Returns false if it already was.
    fn unsubscribe(&self) -> bool;
}

/// Subscription helpers available on every [`Subscribable`].
pub trait SubscribableExt<T: Clone + 'static>: Subscribable<T> {
    /// Attach `subscriber`, returning the node representing the new edge.
    fn subscribe(&self, subscriber: Subscriber<T>) -> Subscription<T, T> {
        self.subscribe_with(subscriber, Transform::identity(), SubscriptionOpts::default())
    }

    /// Attach `subscriber` behind a transform.
    fn subscribe_with<C: Clone + 'static>(
        &self,
        subscriber: Subscriber<C>,
        xform: Transform<T, C>,
        opts: SubscriptionOpts,
    ) -> Subscription<T, C> {
        let child = Subscription::from_parts(opts, "sub", Some(subscriber), xform);
        self.attach(child.as_sink());
        child
    }

    /// Attach a transforming child without callbacks of its own.
    fn transform<C: Clone + 'static>(&self, xform: Transform<T, C>) -> Subscription<T, C> {
        let child = Subscription::from_parts(SubscriptionOpts::default(), "xform", None, xform);
        self.attach(child.as_sink());
        child
    }

    /// Wrap this stream's plain values as [`Item::Value`] so it can feed a
    /// combinator.
    fn lift(&self) -> Source<T> {
        Source::new(self.transform(Transform::map(Item::Value)))
    }
}

impl<T: Clone + 'static, S: Subscribable<T> + ?Sized> SubscribableExt<T> for S {}
