//! Core types shared by every node.

use crate::subscription::Source;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Lifecycle state of a node.
///
/// States are ordered; a node only ever moves to a greater state and never
/// leaves `Done` or `Error`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
    /// Constructed, nothing subscribed or received yet.
    Idle,
    /// Has seen a subscriber or a value.
    Active,
    /// Finished or unsubscribed.
    Done,
    /// Failed.
    Error,
}

impl State {
    pub fn is_terminal(self) -> bool {
        self >= State::Done
    }
}

impl Default for State {
    fn default() -> Self {
        State::Idle
    }
}

/// When a node closes in response to its peers finishing.
///
/// For combinators this describes the inputs (when to call `done()`), for
/// plain subscriptions the outputs (when to tear down after losing
/// subscribers).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseMode {
    /// Close as soon as the first peer finishes.
    First,
    /// Close once every peer has finished.
    Last,
    /// Never close automatically.
    Never,
}

impl Default for CloseMode {
    fn default() -> Self {
        CloseMode::Last
    }
}

/// Payload pushed into a combinator input.
///
/// Producers decide whether they emit a plain value or a new stream that the
/// receiving combinator should start tracking.
pub enum Item<T> {
    Value(T),
    Source(Source<T>),
}

impl<T> From<T> for Item<T> {
    fn from(value: T) -> Self {
        Item::Value(value)
    }
}

impl<T: Clone> Clone for Item<T> {
    fn clone(&self) -> Self {
        match self {
            Item::Value(v) => Item::Value(v.clone()),
            Item::Source(s) => Item::Source(s.clone()),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Item<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Item::Value(v) => f.debug_tuple("Value").field(v).finish(),
            Item::Source(s) => write!(f, "Source({})", s.id()),
        }
    }
}

/// Point-in-time mapping from input label to its most recent value.
pub type Tuple<T> = BTreeMap<String, T>;
