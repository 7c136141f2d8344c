//! Subscriber records and subscription options.

use crate::error::StreamError;
use crate::types::CloseMode;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Options for a new subscription node.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriptionOpts {
    /// Explicit node id (None = `<prefix>-<uid>`).
    pub id: Option<String>,

    /// When to tear down after losing downstream subscribers.
    /// Default: `Last` (once the last subscriber detaches).
    pub close_out: CloseMode,
}

impl SubscriptionOpts {
    pub fn id(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..Default::default()
        }
    }

    pub fn close_out(mut self, mode: CloseMode) -> Self {
        self.close_out = mode;
        self
    }
}

/// Callback triple receiving a node's output.
///
/// The optional owner tag names the node on whose behalf the subscriber
/// was created, so a node can tell owner-driven teardown from teardown
/// requested by anybody else.
pub struct Subscriber<T> {
    next: Option<Box<dyn Fn(T)>>,
    done: Option<Box<dyn Fn()>>,
    error: Option<Box<dyn Fn(&StreamError)>>,
    owner: Option<String>,
}

impl<T> Subscriber<T> {
    /// Subscriber receiving values only.
    pub fn new(next: impl Fn(T) + 'static) -> Self {
        Self {
            next: Some(Box::new(next)),
            done: None,
            error: None,
            owner: None,
        }
    }

    /// Subscriber without any callbacks.
    pub fn empty() -> Self {
        Self {
            next: None,
            done: None,
            error: None,
            owner: None,
        }
    }

    pub fn on_done(mut self, done: impl Fn() + 'static) -> Self {
        self.done = Some(Box::new(done));
        self
    }

    pub fn on_error(mut self, error: impl Fn(&StreamError) + 'static) -> Self {
        self.error = Some(Box::new(error));
        self
    }

    pub fn owned_by(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn owner(&self) -> Option<&str> {
        self.owner.as_deref()
    }

    pub(crate) fn deliver_next(&self, value: T) {
        if let Some(next) = &self.next {
            next(value);
        }
    }

    pub(crate) fn deliver_done(&self) {
        if let Some(done) = &self.done {
            done();
        }
    }

    /// Returns false if the subscriber has no error handler.
    pub(crate) fn deliver_error(&self, err: &StreamError) -> bool {
        match &self.error {
            Some(error) => {
                error(err);
                true
            }
            None => false,
        }
    }
}

impl<T> fmt::Debug for Subscriber<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber")
            .field("next", &self.next.is_some())
            .field("done", &self.done.is_some())
            .field("error", &self.error.is_some())
            .field("owner", &self.owner)
            .finish()
    }
}
