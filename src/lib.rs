//! # Tributary
//!
//! Single-threaded push streams with dynamically rewired combinators.
//!
//! ## Core Concepts
//!
//! - **Subscriptions**: Nodes that push values through a transform to their
//!   subscribers and children, finishing or failing exactly once
//! - **Sources**: Streams of [`Item`]s, which carry either a value or another
//!   source to flatten into a combinator
//! - **StreamMerge**: Forwards every value of a changing set of inputs
//! - **StreamSync**: Joins labeled inputs into [`Tuple`] snapshots, buffered
//!   by a [`KeyedJoin`]
//!
//! ## Example
//!
//! ```ignore
//! use tributary::{Item, Subscriber, Subscription, StreamSync, SyncOpts, SubscribableExt};
//!
//! let a = Subscription::<Item<i32>>::named("a");
//! let b = Subscription::<Item<i32>>::named("b");
//!
//! let sync = StreamSync::with_sources(
//!     SyncOpts::default().reset(true),
//!     [a.clone().into(), b.clone().into()],
//! )?;
//! let _out = sync.subscribe(Subscriber::new(|tuple| println!("{tuple:?}")));
//!
//! a.next(Item::Value(1));
//! b.next(Item::Value(2)); // {"a": 1, "b": 2}
//! ```

pub mod error;
pub mod idgen;
pub mod merge;
pub mod subscription;
pub mod sync;
pub mod types;
pub mod xform;

// Re-exports
pub use error::{Result, StreamError};
pub use merge::{MergeOpts, StreamMerge};
pub use subscription::{
    Sink, Source, Subscribable, SubscribableExt, Subscriber, Subscription, SubscriptionOpts,
    Upstream,
};
pub use sync::{JoinConfig, KeyedJoin, StreamSync, SyncOpts};
pub use types::*;
pub use xform::Transform;
