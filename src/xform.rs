//! Per-subscription value transforms.
//!
//! A [`Transform`] maps one input value to zero or more outputs. It may keep
//! internal state between calls and may emit trailing outputs once, when the
//! owning node finishes (the completion flush). Steps are plain `FnMut`
//! closures run synchronously inside `next()`.

use crate::error::{Result, StreamError};

type Step<A, B> = Box<dyn FnMut(A, &mut Vec<B>) -> Result<()>>;
type Flush<B> = Box<dyn FnMut(&mut Vec<B>) -> Result<()>>;

/// A value transformation pipeline attached to a subscription.
pub struct Transform<A, B> {
    step: Step<A, B>,
    flush: Option<Flush<B>>,
}

impl<A: 'static> Transform<A, A> {
    /// Pass every value through unchanged.
    pub fn identity() -> Self {
        Self::from_step(|a, out| {
            out.push(a);
            Ok(())
        })
    }

    pub fn filter(pred: impl Fn(&A) -> bool + 'static) -> Self {
        Self::from_step(move |a, out| {
            if pred(&a) {
                out.push(a);
            }
            Ok(())
        })
    }
}

impl<A: 'static, B: 'static> Transform<A, B> {
    /// Build a transform from a raw step function.
    pub fn from_step(step: impl FnMut(A, &mut Vec<B>) -> Result<()> + 'static) -> Self {
        Self {
            step: Box::new(step),
            flush: None,
        }
    }

    /// Attach a completion function, run once when the owning node finishes.
    pub fn with_flush(mut self, flush: impl FnMut(&mut Vec<B>) -> Result<()> + 'static) -> Self {
        self.flush = Some(Box::new(flush));
        self
    }

    pub fn map(f: impl Fn(A) -> B + 'static) -> Self {
        Self::from_step(move |a, out| {
            out.push(f(a));
            Ok(())
        })
    }

    pub fn filter_map(f: impl Fn(A) -> Option<B> + 'static) -> Self {
        Self::from_step(move |a, out| {
            out.extend(f(a));
            Ok(())
        })
    }

    pub fn flat_map<I>(f: impl Fn(A) -> I + 'static) -> Self
    where
        I: IntoIterator<Item = B>,
    {
        Self::from_step(move |a, out| {
            out.extend(f(a));
            Ok(())
        })
    }

    /// Fallible map. An `Err` puts the owning node into the error state.
    pub fn try_map<E: std::fmt::Display>(
        f: impl Fn(A) -> std::result::Result<B, E> + 'static,
    ) -> Self {
        Self::from_step(move |a, out| {
            let b = f(a).map_err(|e| StreamError::Transform(e.to_string()))?;
            out.push(b);
            Ok(())
        })
    }

    /// Apply one input value, appending outputs to `out`.
    pub fn apply(&mut self, value: A, out: &mut Vec<B>) -> Result<()> {
        (self.step)(value, out)
    }

    /// Run the completion function (if any), appending outputs to `out`.
    pub fn complete(&mut self, out: &mut Vec<B>) -> Result<()> {
        match self.flush.as_mut() {
            Some(flush) => flush(out),
            None => Ok(()),
        }
    }

    /// Compose with `next`: outputs of `self` are fed into `next`.
    pub fn then<C: 'static>(self, next: Transform<B, C>) -> Transform<A, C> {
        let Transform {
            step: mut first,
            flush: mut first_flush,
        } = self;
        let shared = std::rc::Rc::new(std::cell::RefCell::new(next));
        let in_step = std::rc::Rc::clone(&shared);

        let mut scratch = Vec::new();
        let step = move |a: A, out: &mut Vec<C>| -> Result<()> {
            scratch.clear();
            first(a, &mut scratch)?;
            let mut second = in_step.borrow_mut();
            for b in scratch.drain(..) {
                second.apply(b, out)?;
            }
            Ok(())
        };

        let flush = move |out: &mut Vec<C>| -> Result<()> {
            let mut tail = Vec::new();
            if let Some(f) = first_flush.as_mut() {
                f(&mut tail)?;
            }
            let mut second = shared.borrow_mut();
            for b in tail {
                second.apply(b, out)?;
            }
            second.complete(out)
        };

        Transform::from_step(step).with_flush(flush)
    }
}

impl<A: 'static> Transform<A, Vec<A>> {
    /// Group values into chunks of `size`. With `keep_partial` a trailing
    /// incomplete chunk is emitted when the owning node finishes.
    pub fn partition(size: usize, keep_partial: bool) -> Self {
        let size = size.max(1);
        let buf = std::rc::Rc::new(std::cell::RefCell::new(Vec::with_capacity(size)));
        let tail = std::rc::Rc::clone(&buf);
        Self::from_step(move |a, out| {
            let mut chunk = buf.borrow_mut();
            chunk.push(a);
            if chunk.len() == size {
                out.push(std::mem::take(&mut *chunk));
            }
            Ok(())
        })
        .with_flush(move |out| {
            let rest = std::mem::take(&mut *tail.borrow_mut());
            if keep_partial && !rest.is_empty() {
                out.push(rest);
            }
            Ok(())
        })
    }
}
