//! Subscription nodes: the propagation unit every stream is built from.

use crate::error::StreamError;
use crate::idgen;
use crate::types::{CloseMode, State};
use crate::xform::Transform;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};
use tracing::{debug, trace, warn};

use super::types::{Subscriber, SubscriptionOpts};
use super::Subscribable;

/// Receiving end of an edge. Implemented by every node.
pub trait Sink<T> {
    fn uid(&self) -> u64;

    fn id(&self) -> &str;

    fn next(&self, value: T);

    fn done(&self);

    fn error(&self, err: StreamError);

    /// Called by the upstream when the edge is attached.
    fn set_upstream(&self, upstream: Weak<dyn Upstream>);

    /// Called by the upstream when it drops the edge on its own account
    /// (as opposed to the sink asking to be detached).
    fn upstream_released(&self);
}

/// Sending end of an edge, as seen (weakly) by the sink.
pub trait Upstream {
    /// Remove the edge to the sink with the given uid.
    fn detach(&self, uid: u64) -> bool;
}

/// One downstream edge. `attached` flips to false the moment the edge is
/// removed, so in-flight dispatch loops skip it.
struct Edge<B> {
    attached: Cell<bool>,
    sink: Rc<dyn Sink<B>>,
}

type TeardownHook = Box<dyn FnOnce()>;

pub(crate) struct Node<A, B> {
    uid: u64,
    id: String,
    state: Cell<State>,
    /// Set once `unsubscribe` ran; separate from `state` because a node may
    /// finish (`Done`) and still be attached upstream.
    released: Cell<bool>,
    close_out: CloseMode,
    upstream: RefCell<Option<Weak<dyn Upstream>>>,
    wrapped: RefCell<Option<Rc<Subscriber<B>>>>,
    edges: RefCell<Vec<Rc<Edge<B>>>>,
    xform: RefCell<Transform<A, B>>,
    teardown: RefCell<Option<TeardownHook>>,
    last_error: RefCell<Option<StreamError>>,
    this: Weak<Node<A, B>>,
}

impl<A: 'static, B: Clone + 'static> Node<A, B> {
    fn new(
        opts: SubscriptionOpts,
        prefix: &str,
        wrapped: Option<Subscriber<B>>,
        xform: Transform<A, B>,
    ) -> Rc<Self> {
        let uid = idgen::next_uid();
        let id = idgen::id_or_default(opts.id, prefix, uid);
        Rc::new_cyclic(|this| Node {
            uid,
            id,
            state: Cell::new(State::Idle),
            released: Cell::new(false),
            close_out: opts.close_out,
            upstream: RefCell::new(None),
            wrapped: RefCell::new(wrapped.map(Rc::new)),
            edges: RefCell::new(Vec::new()),
            xform: RefCell::new(xform),
            teardown: RefCell::new(None),
            last_error: RefCell::new(None),
            this: this.clone(),
        })
    }

    fn is_terminal(&self) -> bool {
        self.state.get().is_terminal()
    }

    fn activate(&self) {
        if self.state.get() == State::Idle {
            debug!(id = %self.id, "activate");
            self.state.set(State::Active);
        }
    }

    fn push(&self, value: A) {
        if self.is_terminal() {
            trace!(id = %self.id, state = ?self.state.get(), "ignoring value");
            return;
        }
        self.activate();

        let mut out = Vec::new();
        let res = match self.xform.try_borrow_mut() {
            Ok(mut xform) => xform.apply(value, &mut out),
            Err(_) => Err(StreamError::IllegalState {
                id: self.id.clone(),
                state: self.state.get(),
            }),
        };
        if let Err(e) = res {
            self.fail(e);
            return;
        }

        for b in out {
            if self.is_terminal() {
                break;
            }
            self.dispatch(b);
        }
    }

    /// Forward one output to the wrapped subscriber, then to every edge
    /// attached when the dispatch started.
    fn dispatch(&self, value: B) {
        let wrapped = self.wrapped.borrow().clone();
        let edges: Vec<Rc<Edge<B>>> = self.edges.borrow().clone();
        trace!(id = %self.id, edges = edges.len(), "dispatch");

        if let Some(sub) = wrapped {
            sub.deliver_next(value.clone());
        }
        for edge in edges {
            if edge.attached.get() {
                edge.sink.next(value.clone());
            }
        }
    }

    fn finish(&self) {
        if self.is_terminal() {
            return;
        }

        let mut out = Vec::new();
        let res = match self.xform.try_borrow_mut() {
            Ok(mut xform) => xform.complete(&mut out),
            Err(_) => Err(StreamError::IllegalState {
                id: self.id.clone(),
                state: self.state.get(),
            }),
        };
        if let Err(e) = res {
            self.fail(e);
            return;
        }
        for b in out {
            if self.is_terminal() {
                return;
            }
            self.dispatch(b);
        }
        if self.is_terminal() {
            return;
        }

        debug!(id = %self.id, "done");
        self.state.set(State::Done);

        let wrapped = self.wrapped.borrow().clone();
        let edges: Vec<Rc<Edge<B>>> = self.edges.borrow().clone();
        if let Some(sub) = wrapped {
            sub.deliver_done();
        }
        for edge in edges {
            if edge.attached.get() {
                edge.sink.done();
            }
        }
    }

    fn fail(&self, err: StreamError) {
        if self.is_terminal() {
            return;
        }
        debug!(id = %self.id, error = %err, "error");
        self.state.set(State::Error);
        *self.last_error.borrow_mut() = Some(err.clone());

        let wrapped = self.wrapped.borrow().clone();
        let edges: Vec<Rc<Edge<B>>> = self.edges.borrow().clone();

        let mut handled = wrapped.map_or(false, |sub| sub.deliver_error(&err));
        for edge in edges {
            if edge.attached.get() {
                edge.sink.error(err.clone());
                handled = true;
            }
        }
        if !handled {
            warn!(id = %self.id, error = %err, "unhandled error");
        }
    }

    fn attach(&self, sink: Rc<dyn Sink<B>>) {
        match self.state.get() {
            State::Done => {
                sink.done();
                return;
            }
            State::Error => {
                let err = self.last_error.borrow().clone();
                if let Some(err) = err {
                    sink.error(err);
                }
                return;
            }
            _ => {}
        }
        self.activate();

        let upstream: Weak<dyn Upstream> = self.this.clone();
        sink.set_upstream(upstream);
        debug!(id = %self.id, child = %sink.id(), "subscribe");
        self.edges.borrow_mut().push(Rc::new(Edge {
            attached: Cell::new(true),
            sink,
        }));
    }

    fn detach_child(&self, uid: u64) -> bool {
        let removed = {
            let mut edges = self.edges.borrow_mut();
            edges
                .iter()
                .position(|e| e.sink.uid() == uid)
                .map(|idx| edges.remove(idx))
        };
        let Some(edge) = removed else {
            return false;
        };
        edge.attached.set(false);

        let remaining = self.edges.borrow().len();
        debug!(id = %self.id, child = %edge.sink.id(), remaining, "unsubscribe child");
        if self.close_out == CloseMode::First
            || (remaining == 0 && self.close_out != CloseMode::Never)
        {
            self.unsubscribe();
        }
        true
    }

    fn unsubscribe(&self) -> bool {
        if self.released.replace(true) {
            return false;
        }
        debug!(id = %self.id, "unsubscribe");

        let hook = self.teardown.borrow_mut().take();
        if let Some(hook) = hook {
            hook();
        }

        if !self.is_terminal() {
            self.state.set(State::Done);
        }

        let edges = std::mem::take(&mut *self.edges.borrow_mut());
        for edge in &edges {
            edge.attached.set(false);
        }
        for edge in &edges {
            edge.sink.upstream_released();
        }
        self.wrapped.borrow_mut().take();

        let upstream = self.upstream.borrow_mut().take();
        if let Some(up) = upstream.and_then(|w| w.upgrade()) {
            up.detach(self.uid);
        }
        true
    }

    fn owner(&self) -> Option<String> {
        self.wrapped
            .borrow()
            .as_ref()
            .and_then(|sub| sub.owner().map(str::to_string))
    }
}

impl<A: 'static, B: Clone + 'static> Sink<A> for Node<A, B> {
    fn uid(&self) -> u64 {
        self.uid
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn next(&self, value: A) {
        self.push(value);
    }

    fn done(&self) {
        self.finish();
    }

    fn error(&self, err: StreamError) {
        self.fail(err);
    }

    fn set_upstream(&self, upstream: Weak<dyn Upstream>) {
        *self.upstream.borrow_mut() = Some(upstream);
    }

    fn upstream_released(&self) {
        self.upstream.borrow_mut().take();
        // An owned relay losing its input reports completion to the owner;
        // owner-initiated removal never gets here because the relay detaches
        // itself first.
        if let Some(owner) = self.owner() {
            debug!(id = %self.id, owner = %owner, "input released upstream");
            self.finish();
        }
    }
}

impl<A: 'static, B: Clone + 'static> Upstream for Node<A, B> {
    fn detach(&self, uid: u64) -> bool {
        self.detach_child(uid)
    }
}

/// Handle to a subscription node.
///
/// Receives `A` from its upstream (or from [`Subscription::next`] when used
/// as a producer), runs its transform and pushes `B` downstream. Cloning
/// the handle shares the node.
pub struct Subscription<A, B = A> {
    node: Rc<Node<A, B>>,
}

impl<T: Clone + 'static> Subscription<T, T> {
    /// Create a producer node with an auto-generated id.
    pub fn new() -> Self {
        Self::with_opts(SubscriptionOpts::default())
    }

    /// Create a producer node with an explicit id.
    pub fn named(id: impl Into<String>) -> Self {
        Self::with_opts(SubscriptionOpts::id(id))
    }

    pub fn with_opts(opts: SubscriptionOpts) -> Self {
        Self::from_parts(opts, "stream", None, Transform::identity())
    }
}

impl<T: Clone + 'static> Default for Subscription<T, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: 'static, B: Clone + 'static> Subscription<A, B> {
    /// Create a free-standing node applying `xform` to every value.
    pub fn with_transform(xform: Transform<A, B>, opts: SubscriptionOpts) -> Self {
        Self::from_parts(opts, "xform", None, xform)
    }

    pub(crate) fn from_parts(
        opts: SubscriptionOpts,
        prefix: &str,
        wrapped: Option<Subscriber<B>>,
        xform: Transform<A, B>,
    ) -> Self {
        Self {
            node: Node::new(opts, prefix, wrapped, xform),
        }
    }

    /// Push a value into this node.
    pub fn next(&self, value: A) {
        self.node.push(value);
    }

    /// Finish this node, flushing its transform and notifying downstream once.
    pub fn done(&self) {
        self.node.finish();
    }

    /// Fail this node, notifying downstream once.
    pub fn error(&self, err: StreamError) {
        self.node.fail(err);
    }

    /// Detach from upstream and drop all downstream edges.
    ///
    /// Returns false if the node was already unsubscribed.
    pub fn unsubscribe(&self) -> bool {
        self.node.unsubscribe()
    }

    /// Detach a single downstream child.
    pub fn unsubscribe_child<C: Clone + 'static>(&self, child: &Subscription<B, C>) -> bool {
        self.node.detach_child(child.uid())
    }

    pub fn id(&self) -> &str {
        &self.node.id
    }

    pub fn uid(&self) -> u64 {
        self.node.uid
    }

    pub fn state(&self) -> State {
        self.node.state.get()
    }

    pub fn last_error(&self) -> Option<StreamError> {
        self.node.last_error.borrow().clone()
    }

    /// Number of attached downstream edges (not counting the wrapped subscriber).
    pub fn subscriber_count(&self) -> usize {
        self.node.edges.borrow().len()
    }

    pub fn owner(&self) -> Option<String> {
        self.node.owner()
    }

    pub fn is_unsubscribed(&self) -> bool {
        self.node.released.get()
    }

    /// Install a hook run exactly once, at the start of `unsubscribe`.
    pub(crate) fn set_teardown(&self, hook: impl FnOnce() + 'static) {
        *self.node.teardown.borrow_mut() = Some(Box::new(hook));
    }

    pub(crate) fn as_sink(&self) -> Rc<dyn Sink<A>> {
        self.node.clone()
    }
}

impl<A: 'static, B: Clone + 'static> Subscribable<B> for Subscription<A, B> {
    fn id(&self) -> &str {
        &self.node.id
    }

    fn uid(&self) -> u64 {
        self.node.uid
    }

    fn state(&self) -> State {
        self.node.state.get()
    }

    fn attach(&self, sink: Rc<dyn Sink<B>>) {
        self.node.attach(sink);
    }

    fn detach(&self, uid: u64) -> bool {
        self.node.detach_child(uid)
    }

    fn unsubscribe(&self) -> bool {
        self.node.unsubscribe()
    }
}

impl<A, B> Clone for Subscription<A, B> {
    fn clone(&self) -> Self {
        Self {
            node: Rc::clone(&self.node),
        }
    }
}

impl<A, B> fmt::Debug for Subscription<A, B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.node.id)
            .field("uid", &self.node.uid)
            .field("state", &self.node.state.get())
            .field("edges", &self.node.edges.borrow().len())
            .finish()
    }
}
