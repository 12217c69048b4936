// Copyright (c) 2016 Daniel Grunwald
//
// Permission is hereby granted, free of charge, to any person obtaining a copy of this
// software and associated documentation files (the "Software"), to deal in the Software
// without restriction, including without limitation the rights to use, copy, modify, merge,
// publish, distribute, sublicense, and/or sell copies of the Software, and to permit persons
// to whom the Software is furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in all copies or
// substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR IMPLIED,
// INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY, FITNESS FOR A PARTICULAR
// PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE AUTHORS OR COPYRIGHT HOLDERS BE LIABLE
// FOR ANY CLAIM, DAMAGES OR OTHER LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR
// OTHERWISE, ARISING FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
// DEALINGS IN THE SOFTWARE.

//! `Promise<T, E>` / `Resolver<T, E>`: a write-once, cancellable value with a
//! graph of chained observers.
//!
//! A promise's box (see [`crate::promise_box`]) is shared between every
//! `Promise` handle and the single `Resolver` through one `Arc<Inner<T, E>>`.
//! Two independent reference counts ride on top of that `Arc`:
//!
//! - the `Arc`'s own strong count, which just keeps the allocation alive
//!   (children hold a plain `Arc<Inner<T, E>>` clone to reach their parent);
//! - `promise_handle_count`, tracking how many *user-facing* `Promise<T, E>`
//!   values exist. Dropping the last one seals the box's observer count and,
//!   if no child is currently attached, requests cancellation (see
//!   `Promise::drop` below and SPEC_FULL.md §4's seal point).
//!
//! Dropping the `Resolver` while the box is still pending is a harder edge:
//! nothing can ever produce a non-cancelled result for it again, so it forces
//! the box straight to `Cancelled` rather than going through the advisory
//! `request_cancel` path.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use crate::context::ExecutionContext;
use crate::error::TimeoutError;
use crate::promise_box::{BoxState, CancelNode, Outcome, PromiseBox, SharedOutcome};
use crate::token::{Cancellable, InvalidationToken};

/// Options controlling how an operator's child attaches to its parent.
#[derive(Clone, Copy, Debug, Default)]
pub struct Options {
    /// Requesting cancellation of the child also immediately requests
    /// cancellation of the parent, instead of only doing so once every
    /// sibling observer has finished.
    pub link_cancel: bool,
    /// When a handler returns [`MapResult::Nested`], observe the nested
    /// promise on the same context as the handler itself rather than
    /// [`ExecutionContext::Immediate`].
    pub enforce_context: bool,
}

/// What a transforming handler (`map`, `recover`, `always`) produces.
pub enum MapResult<V, E> {
    Value(V),
    Error(E),
    Cancelled,
    /// Adopt another promise's eventual outcome instead of settling now.
    Nested(Promise<V, E>),
}

/// Wraps a void-returning operator handler (`then`, `catch`, `inspect`,
/// `tap`, `whenCancelled`) so it is skipped if `token` was invalidated
/// between registration and invocation. Only these operators are
/// token-gated: `map`/`recover`/`always` must produce a value for the child
/// regardless, so skipping their handler has no sound fallback.
fn gate_side_effect<T, E, F>(token: Option<InvalidationToken>, handler: F) -> impl FnOnce(&Outcome<T, E>) + Send + 'static
where
    F: FnOnce(&Outcome<T, E>) + Send + 'static,
{
    let snapshot = token.as_ref().map(|t| t.snapshot());
    move |outcome: &Outcome<T, E>| {
        let gated_out = matches!((&token, snapshot), (Some(t), Some(s)) if !t.is_current(s));
        if !gated_out {
            handler(outcome);
        }
    }
}

struct DelayedBody<T, E> {
    context: ExecutionContext,
    body: Box<dyn FnOnce(Resolver<T, E>) + Send>,
}

struct Inner<T, E> {
    box_: PromiseBox<T, E>,
    promise_handle_count: AtomicUsize,
    ignore_cancel: AtomicBool,
    link_cancel_target: Option<Arc<dyn Cancellable>>,
    delayed: Mutex<Option<DelayedBody<T, E>>>,
}

impl<T, E> Cancellable for Inner<T, E>
where
    T: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    fn request_cancel(&self) {
        self.box_.request_cancel();
    }
}

/// A readable, settled snapshot of a promise's outcome, returned by
/// [`Promise::try_get_result`].
pub struct PromiseResult<T, E>(SharedOutcome<T, E>);

impl<T, E> PromiseResult<T, E> {
    pub fn value(&self) -> Option<&T> {
        self.0.value()
    }

    pub fn error(&self) -> Option<&E> {
        self.0.error()
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.is_cancelled()
    }
}

/// A weak, type-erased handle that can only request cancellation, handed out
/// by [`Promise::cancellable`] so a caller doesn't need `T`/`E` in scope (or a
/// way to keep the promise itself alive) just to be able to cancel it.
pub struct CancelHandle {
    inner: Weak<dyn Cancellable>,
}

impl CancelHandle {
    /// A no-op if the promise has already been dropped.
    pub fn request_cancel(&self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.request_cancel();
        }
    }
}

/// A cancellable, composable value produced asynchronously onto some
/// [`ExecutionContext`].
pub struct Promise<T, E> {
    inner: Arc<Inner<T, E>>,
}

/// The write side of a promise, held by whatever body or operator will
/// eventually settle it.
pub struct Resolver<T, E> {
    inner: Arc<Inner<T, E>>,
}

#[derive(Clone, Copy)]
enum Propagation {
    /// Doesn't count toward the parent's observer count at all: cancelling
    /// this child, or it finishing, never affects the parent (`tap`,
    /// `whenCancelled`, `makeChild`, `ignoringCancel`).
    NonPropagating,
    /// Counted; once sealed and zero, requests the parent's cancellation
    /// (`then`, `map`, `catch`, `recover`, `inspect`, `always`).
    Sealed,
    /// Counted, but propagates the instant the count reaches zero regardless
    /// of whether the parent has been sealed (`propagatingCancellation`).
    Eager,
}

impl<T, E> Promise<T, E>
where
    T: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    fn from_inner(inner: Arc<Inner<T, E>>) -> Self {
        inner.promise_handle_count.fetch_add(1, Ordering::Relaxed);
        Promise { inner }
    }

    /// A pending promise plus the bare `Arc<Inner<T, E>>` behind it, with no
    /// `Resolver` wrapper created. Used internally where more than one
    /// independent writer needs to be able to settle the same box (`delay`,
    /// `timeout`'s parent/timer race): a `Resolver` would force the box to
    /// `Cancelled` on drop, which is wrong when "abandoning" one of several
    /// racing writers is a normal outcome, not a giveup.
    fn new_pending_inner(link_cancel_target: Option<Arc<dyn Cancellable>>) -> (Promise<T, E>, Arc<Inner<T, E>>) {
        let inner = Arc::new(Inner {
            box_: PromiseBox::new(BoxState::Empty),
            promise_handle_count: AtomicUsize::new(0),
            ignore_cancel: AtomicBool::new(false),
            link_cancel_target,
            delayed: Mutex::new(None),
        });
        let promise = Promise::from_inner(inner.clone());
        (promise, inner)
    }

    fn make_pair_linked(link_cancel_target: Option<Arc<dyn Cancellable>>) -> (Promise<T, E>, Resolver<T, E>) {
        let (promise, inner) = Self::new_pending_inner(link_cancel_target);
        let resolver = Resolver { inner };
        (promise, resolver)
    }

    fn make_pair() -> (Promise<T, E>, Resolver<T, E>) {
        Self::make_pair_linked(None)
    }

    fn from_terminal(outcome: Outcome<T, E>) -> Self {
        let inner = Arc::new(Inner {
            box_: PromiseBox::new_terminal(outcome),
            promise_handle_count: AtomicUsize::new(0),
            ignore_cancel: AtomicBool::new(false),
            link_cancel_target: None,
            delayed: Mutex::new(None),
        });
        Promise::from_inner(inner)
    }

    /// A paired promise and resolver, for producers that don't fit the
    /// closure-body shape of [`Promise::new`].
    pub fn make_promise_with_resolver() -> (Promise<T, E>, Resolver<T, E>) {
        Self::make_pair()
    }

    /// Runs `body` on `context` right away (a `NowOr` context behaves like
    /// [`ExecutionContext::Immediate`] here, since there is nothing yet to be
    /// "already resolved" relative to).
    pub fn new(context: ExecutionContext, body: impl FnOnce(Resolver<T, E>) + Send + 'static) -> Self {
        let (promise, resolver) = Self::make_pair();
        context.execute(Box::new(move || body(resolver)));
        promise
    }

    /// Like [`Promise::new`], but `body` only runs the first time the
    /// promise is observed (by an operator, `try_get_result`, or a clone
    /// being attached to) rather than immediately at construction.
    pub fn delayed(context: ExecutionContext, body: impl FnOnce(Resolver<T, E>) + Send + 'static) -> Self {
        let inner = Arc::new(Inner {
            box_: PromiseBox::new(BoxState::Delayed),
            promise_handle_count: AtomicUsize::new(0),
            ignore_cancel: AtomicBool::new(false),
            link_cancel_target: None,
            delayed: Mutex::new(Some(DelayedBody {
                context,
                body: Box::new(body),
            })),
        });
        Promise::from_inner(inner)
    }

    pub fn new_fulfilled(value: T) -> Self {
        Self::from_terminal(Outcome::Value(value))
    }

    pub fn new_rejected(error: E) -> Self {
        Self::from_terminal(Outcome::Error(error))
    }

    pub fn new_cancelled() -> Self {
        Self::from_terminal(Outcome::Cancelled)
    }

    fn ensure_started(&self) {
        if self.inner.box_.unfenced_state() == BoxState::Delayed
            && self.inner.box_.transition_state(BoxState::Empty)
        {
            let body = self.inner.delayed.lock().take();
            if let Some(DelayedBody { context, body }) = body {
                let resolver = Resolver {
                    inner: self.inner.clone(),
                };
                context.execute_delayed(Box::new(move || body(resolver)));
            }
        }
    }

    /// Registers `callback` for the eventual outcome, starting a `delayed`
    /// promise's body if it hasn't run yet.
    fn observe(&self, context: ExecutionContext, callback: impl FnOnce(SharedOutcome<T, E>) + Send + 'static) {
        self.ensure_started();
        self.inner.box_.observe(context, Box::new(callback));
    }

    /// The settled outcome, or `None` if the promise hasn't resolved yet.
    /// Never starts a `delayed` promise's body (there is nothing to read).
    pub fn try_get_result(&self) -> Option<PromiseResult<T, E>> {
        self.inner.box_.try_clone_result().map(PromiseResult)
    }

    /// Advisory: requests cancellation. A no-op if this promise was produced
    /// by [`Promise::ignoring_cancel`], already settled, or already has a
    /// cancellation request pending.
    pub fn request_cancel(&self) {
        if self.inner.ignore_cancel.load(Ordering::Relaxed) {
            return;
        }
        if let Some(link) = &self.inner.link_cancel_target {
            link.request_cancel();
        }
        self.inner.box_.request_cancel();
    }

    /// A type-erased handle that can only request cancellation, decoupled
    /// from this promise's `T`/`E` and held weakly by the caller.
    pub fn cancellable(&self) -> CancelHandle {
        let erased: Arc<dyn Cancellable> = self.inner.clone();
        CancelHandle {
            inner: Arc::downgrade(&erased),
        }
    }

    /// Requests cancellation the next time `token` is invalidated.
    pub fn request_cancel_on_invalidate(&self, token: &InvalidationToken) {
        let erased: Arc<dyn Cancellable> = self.inner.clone();
        token.request_cancel_on_invalidate(&erased);
    }

    fn attach_mirror<F>(
        &self,
        context: ExecutionContext,
        propagation: Propagation,
        options: Options,
        side_effect: F,
    ) -> Promise<T, E>
    where
        F: FnOnce(&Outcome<T, E>) + Send + 'static,
    {
        let link_cancel_target = if options.link_cancel {
            let erased: Arc<dyn Cancellable> = self.inner.clone();
            Some(erased)
        } else {
            None
        };
        let (child, child_resolver) = Promise::<T, E>::make_pair_linked(link_cancel_target);
        if !matches!(propagation, Propagation::NonPropagating) {
            self.inner.box_.increment_observer_count();
            let parent = self.inner.clone();
            let eager = matches!(propagation, Propagation::Eager);
            child.inner.box_.observe(
                ExecutionContext::Immediate,
                Box::new(move |_outcome: SharedOutcome<T, E>| {
                    let fire = if eager {
                        parent.box_.decrement_observer_count_eager()
                    } else {
                        parent.box_.decrement_observer_count()
                    };
                    if fire {
                        parent.box_.request_cancel();
                    }
                }),
            );
        }
        self.observe(context, move |outcome: SharedOutcome<T, E>| {
            side_effect(&outcome);
            child_resolver.inner.box_.resolve_shared(outcome);
        });
        child
    }

    fn attach_transform<V, E2, F>(&self, context: ExecutionContext, options: Options, transform: F) -> Promise<V, E2>
    where
        V: Clone + Send + Sync + 'static,
        E2: Clone + Send + Sync + 'static,
        F: FnOnce(&Outcome<T, E>) -> MapResult<V, E2> + Send + 'static,
    {
        let link_cancel_target = if options.link_cancel {
            let erased: Arc<dyn Cancellable> = self.inner.clone();
            Some(erased)
        } else {
            None
        };
        let (child, child_resolver) = Promise::<V, E2>::make_pair_linked(link_cancel_target);
        self.inner.box_.increment_observer_count();
        let parent = self.inner.clone();
        child.inner.box_.observe(
            ExecutionContext::Immediate,
            Box::new(move |_outcome: SharedOutcome<V, E2>| {
                if parent.box_.decrement_observer_count() {
                    parent.box_.request_cancel();
                }
            }),
        );
        let enforce_context = options.enforce_context;
        let adopt_context = context.clone();
        self.observe(context, move |outcome: SharedOutcome<T, E>| {
            let result = transform(&outcome);
            adopt_map_result(child_resolver, result, adopt_context, enforce_context);
        });
        child
    }

    /// Runs `handler` on a fulfilled value, passing the outcome through
    /// unchanged either way. Skipped if `token` was invalidated before
    /// dispatch.
    pub fn then<F>(&self, context: ExecutionContext, token: Option<InvalidationToken>, options: Options, handler: F) -> Promise<T, E>
    where
        F: FnOnce(&T) + Send + 'static,
    {
        let gated = gate_side_effect(token, move |outcome: &Outcome<T, E>| {
            if let Some(v) = outcome.value() {
                handler(v);
            }
        });
        self.attach_mirror(context, Propagation::Sealed, options, gated)
    }

    /// Runs `handler` on a rejected error, passing the outcome through
    /// unchanged either way. Skipped if `token` was invalidated before
    /// dispatch.
    pub fn catch<F>(&self, context: ExecutionContext, token: Option<InvalidationToken>, options: Options, handler: F) -> Promise<T, E>
    where
        F: FnOnce(&E) + Send + 'static,
    {
        let gated = gate_side_effect(token, move |outcome: &Outcome<T, E>| {
            if let Some(e) = outcome.error() {
                handler(e);
            }
        });
        self.attach_mirror(context, Propagation::Sealed, options, gated)
    }

    /// Runs `handler` on every outcome, passing it through unchanged.
    /// Skipped if `token` was invalidated before dispatch.
    pub fn inspect<F>(&self, context: ExecutionContext, token: Option<InvalidationToken>, options: Options, handler: F) -> Promise<T, E>
    where
        F: FnOnce(&Outcome<T, E>) + Send + 'static,
    {
        let gated = gate_side_effect(token, handler);
        self.attach_mirror(context, Propagation::Sealed, options, gated)
    }

    /// Transforms a fulfilled value, leaving rejection/cancellation as-is
    /// (cloned across, since the shared outcome may have other observers).
    pub fn map<V, F>(&self, context: ExecutionContext, options: Options, handler: F) -> Promise<V, E>
    where
        V: Clone + Send + Sync + 'static,
        E: Clone,
        F: FnOnce(&T) -> MapResult<V, E> + Send + 'static,
    {
        self.attach_transform(context, options, move |outcome| match outcome {
            Outcome::Value(v) => handler(v),
            Outcome::Error(e) => MapResult::Error(e.clone()),
            Outcome::Cancelled => MapResult::Cancelled,
        })
    }

    /// Transforms a rejected error into a fresh outcome, leaving a fulfilled
    /// value or cancellation as-is.
    pub fn recover<F>(&self, context: ExecutionContext, options: Options, handler: F) -> Promise<T, E>
    where
        T: Clone,
        E: Clone,
        F: FnOnce(&E) -> MapResult<T, E> + Send + 'static,
    {
        self.attach_transform(context, options, move |outcome| match outcome {
            Outcome::Value(v) => MapResult::Value(v.clone()),
            Outcome::Error(e) => handler(e),
            Outcome::Cancelled => MapResult::Cancelled,
        })
    }

    /// Transforms every outcome, value or error or cancellation alike, into
    /// a fresh one of possibly different types.
    pub fn always<V, E2, F>(&self, context: ExecutionContext, options: Options, handler: F) -> Promise<V, E2>
    where
        V: Clone + Send + Sync + 'static,
        E2: Clone + Send + Sync + 'static,
        F: FnOnce(&Outcome<T, E>) -> MapResult<V, E2> + Send + 'static,
    {
        self.attach_transform(context, options, handler)
    }

    /// Runs `handler` regardless of outcome, without counting toward the
    /// parent's observer set: a lone `tap` can never be the thing holding a
    /// chain open, and other observers see the result unaffected. Skipped
    /// if `token` was invalidated before dispatch.
    pub fn tap<F>(&self, context: ExecutionContext, token: Option<InvalidationToken>, handler: F) -> Promise<T, E>
    where
        F: FnOnce(&Outcome<T, E>) + Send + 'static,
    {
        let gated = gate_side_effect(token, handler);
        self.attach_mirror(context, Propagation::NonPropagating, Options::default(), gated)
    }

    /// Runs `handler` only when the outcome is cancellation, without
    /// counting toward the parent's observer set (same non-propagating
    /// footing as [`Promise::tap`], so the two compose without either
    /// silently keeping the chain alive against the other). Skipped if
    /// `token` was invalidated before dispatch.
    pub fn when_cancelled<F>(&self, context: ExecutionContext, token: Option<InvalidationToken>, handler: F) -> Promise<T, E>
    where
        F: FnOnce() + Send + 'static,
    {
        let gated = gate_side_effect(token, move |outcome: &Outcome<T, E>| {
            if outcome.is_cancelled() {
                handler();
            }
        });
        self.attach_mirror(context, Propagation::NonPropagating, Options::default(), gated)
    }

    /// A mirroring child whose own `request_cancel` is inert: cancelling it
    /// never reaches this promise, and it never counts toward this
    /// promise's propagating-observer set.
    pub fn ignoring_cancel(&self) -> Promise<T, E> {
        let child = self.attach_mirror(ExecutionContext::Immediate, Propagation::NonPropagating, Options::default(), |_| {});
        child.inner.ignore_cancel.store(true, Ordering::Relaxed);
        child
    }

    /// A plain mirroring child that hides this promise's identity: it
    /// doesn't count toward the observer set, and its own `request_cancel`
    /// is a normal (but purely local) advisory request.
    pub fn make_child(&self) -> Promise<T, E> {
        self.attach_mirror(ExecutionContext::Immediate, Propagation::NonPropagating, Options::default(), |_| {})
    }

    /// A mirroring child that propagates cancellation upward the instant it
    /// finishes, without waiting for this promise's own Promise handles to
    /// be sealed first.
    pub fn propagating_cancellation(&self, context: ExecutionContext) -> Promise<T, E> {
        self.attach_mirror(context, Propagation::Eager, Options::default(), |_| {})
    }

    /// A child that adopts this promise's outcome `delay` after it settles.
    /// Cancelling the child before the timer fires short-circuits it to
    /// `Cancelled` directly (there is no handler registered to veto it) and
    /// the late adoption attempt is silently dropped, since the child is
    /// already terminal by then.
    pub fn delay(&self, delay: Duration, context: ExecutionContext) -> Promise<T, E> {
        let (child, child_inner) = Self::new_pending_inner(None);
        self.inner.box_.increment_observer_count();
        let parent = self.inner.clone();
        child.inner.box_.observe(
            ExecutionContext::Immediate,
            Box::new(move |_outcome: SharedOutcome<T, E>| {
                if parent.box_.decrement_observer_count() {
                    parent.box_.request_cancel();
                }
            }),
        );
        self.observe(ExecutionContext::Immediate, move |outcome: SharedOutcome<T, E>| {
            context.execute(Box::new(move || {
                thread::sleep(delay);
                child_inner.box_.resolve_shared(outcome);
            }));
        });
        child
    }

    /// A child that adopts this promise's value or wraps its error in
    /// [`TimeoutError::Original`], or rejects with [`TimeoutError::TimedOut`]
    /// (and requests this promise's cancellation) if `duration` elapses
    /// first. Whichever of the parent's settlement or the timer runs first
    /// wins; the other's attempt to resolve the child is a harmless no-op.
    pub fn timeout(&self, duration: Duration, context: ExecutionContext) -> Promise<T, TimeoutError<E>>
    where
        T: Clone,
        E: Clone,
    {
        let (child, child_inner) = Promise::<T, TimeoutError<E>>::new_pending_inner(None);
        self.inner.box_.increment_observer_count();
        let parent_for_decrement = self.inner.clone();
        child.inner.box_.observe(
            ExecutionContext::Immediate,
            Box::new(move |_outcome: SharedOutcome<T, TimeoutError<E>>| {
                if parent_for_decrement.box_.decrement_observer_count() {
                    parent_for_decrement.box_.request_cancel();
                }
            }),
        );

        let child_for_parent = child_inner.clone();
        self.observe(context.clone(), move |outcome: SharedOutcome<T, E>| {
            let mapped = match &*outcome {
                Outcome::Value(v) => Outcome::Value(v.clone()),
                Outcome::Error(e) => Outcome::Error(TimeoutError::Original(e.clone())),
                Outcome::Cancelled => Outcome::Cancelled,
            };
            child_for_parent.box_.resolve(mapped);
        });

        let parent_for_timeout = self.inner.clone();
        context.execute(Box::new(move || {
            thread::sleep(duration);
            if child_inner.box_.resolve(Outcome::Error(TimeoutError::TimedOut)) {
                parent_for_timeout.box_.request_cancel();
            }
        }));

        child
    }
}

fn adopt_map_result<V, E2>(resolver: Resolver<V, E2>, result: MapResult<V, E2>, context: ExecutionContext, enforce_context: bool)
where
    V: Clone + Send + Sync + 'static,
    E2: Clone + Send + Sync + 'static,
{
    match result {
        MapResult::Value(v) => {
            resolver.fulfill(v);
        }
        MapResult::Error(e) => {
            resolver.reject(e);
        }
        MapResult::Cancelled => {
            resolver.cancel();
        }
        MapResult::Nested(nested) => {
            let observe_ctx = if enforce_context { context } else { ExecutionContext::Immediate };
            nested.observe(observe_ctx, move |outcome: SharedOutcome<V, E2>| match &*outcome {
                Outcome::Value(v) => {
                    resolver.fulfill(v.clone());
                }
                Outcome::Error(e) => {
                    resolver.reject(e.clone());
                }
                Outcome::Cancelled => {
                    resolver.cancel();
                }
            });
        }
    }
}

impl<T, E> Clone for Promise<T, E> {
    fn clone(&self) -> Self {
        self.inner.promise_handle_count.fetch_add(1, Ordering::Relaxed);
        Promise {
            inner: self.inner.clone(),
        }
    }
}

impl<T, E> Drop for Promise<T, E> {
    /// When the last `Promise` handle goes away, seal this promise's
    /// observer count; if no child is currently attached (the count was
    /// already zero), that's the seal-point trigger and we advisorily
    /// request our own cancellation. A promise with live children is left
    /// alone here — cancellation only reaches it once every child finishes
    /// and decrements the count to zero (SPEC_FULL.md §4, seal point).
    fn drop(&mut self) {
        if self.inner.promise_handle_count.fetch_sub(1, Ordering::AcqRel) == 1 && self.inner.box_.seal_observer_count() {
            self.inner.box_.request_cancel();
        }
    }
}

impl<T, E> Resolver<T, E>
where
    T: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    pub fn fulfill(&self, value: T) -> bool {
        self.inner.box_.resolve(Outcome::Value(value))
    }

    pub fn reject(&self, error: E) -> bool {
        self.inner.box_.resolve(Outcome::Error(error))
    }

    pub fn cancel(&self) -> bool {
        self.inner.box_.resolve(Outcome::Cancelled)
    }

    /// Registers a cancel-request handler, or runs it right away if
    /// cancellation has already been requested (or the box already settled).
    pub fn on_cancel_requested(&self, context: ExecutionContext, handler: impl FnOnce() + Send + 'static) {
        self.inner.box_.on_cancel_requested(CancelNode {
            context,
            callback: Box::new(handler),
        });
    }
}

impl<T, E> Drop for Resolver<T, E> {
    /// An abandoned resolver can never produce anything but a cancellation:
    /// forces the box straight to `Cancelled`, bypassing the advisory
    /// `request_cancel` / cancel-handler negotiation entirely.
    fn drop(&mut self) {
        if !self.inner.box_.state().is_terminal() {
            self.inner.box_.resolve(Outcome::Cancelled);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn fulfilled_promise_reads_back_value() {
        let p: Promise<i32, String> = Promise::new_fulfilled(42);
        let result = p.try_get_result().unwrap();
        assert_eq!(*result.value().unwrap(), 42);
        assert!(result.error().is_none());
        assert!(!result.is_cancelled());
    }

    #[test]
    fn then_runs_on_value_and_mirrors_it() {
        let (tx, rx) = mpsc::channel();
        let p: Promise<i32, String> = Promise::new_fulfilled(7);
        let child = p.then(ExecutionContext::Immediate, None, Options::default(), move |v| {
            tx.send(*v).unwrap();
        });
        assert_eq!(rx.recv().unwrap(), 7);
        assert_eq!(*child.try_get_result().unwrap().value().unwrap(), 7);
    }

    #[test]
    fn catch_does_not_run_on_fulfilled_value() {
        let called = Arc::new(AtomicBool::new(false));
        let called2 = called.clone();
        let p: Promise<i32, String> = Promise::new_fulfilled(1);
        let _ = p.catch(ExecutionContext::Immediate, None, Options::default(), move |_e| {
            called2.store(true, Ordering::SeqCst);
        });
        assert!(!called.load(Ordering::SeqCst));
    }

    #[test]
    fn map_transforms_value_and_passes_error_through() {
        let p: Promise<i32, String> = Promise::new_fulfilled(3);
        let mapped = p.map(ExecutionContext::Immediate, Options::default(), |v| MapResult::Value(v * 2));
        assert_eq!(*mapped.try_get_result().unwrap().value().unwrap(), 6);

        let rejected: Promise<i32, String> = Promise::new_rejected("boom".to_string());
        let mapped = rejected.map(ExecutionContext::Immediate, Options::default(), |v| MapResult::Value(v * 2));
        let result = mapped.try_get_result().unwrap();
        assert_eq!(result.error().unwrap(), "boom");
    }

    #[test]
    fn recover_turns_rejection_into_value() {
        let p: Promise<i32, String> = Promise::new_rejected("boom".to_string());
        let recovered = p.recover(ExecutionContext::Immediate, Options::default(), |_e| MapResult::Value(0));
        assert_eq!(*recovered.try_get_result().unwrap().value().unwrap(), 0);
    }

    #[test]
    fn delayed_body_does_not_run_until_observed() {
        let started = Arc::new(AtomicBool::new(false));
        let started2 = started.clone();
        let p: Promise<i32, String> = Promise::delayed(ExecutionContext::Immediate, move |r| {
            started2.store(true, Ordering::SeqCst);
            r.fulfill(1);
        });
        assert!(!started.load(Ordering::SeqCst));
        assert!(p.try_get_result().is_none());
        let child = p.then(ExecutionContext::Immediate, None, Options::default(), |_| {});
        assert!(started.load(Ordering::SeqCst));
        assert_eq!(*child.try_get_result().unwrap().value().unwrap(), 1);
    }

    #[test]
    fn dropping_resolver_without_resolving_cancels() {
        let (p, r) = Promise::<i32, String>::make_promise_with_resolver();
        drop(r);
        assert!(p.try_get_result().unwrap().is_cancelled());
    }

    #[test]
    fn dropping_all_children_propagates_cancel_to_parent() {
        let cancel_requested = Arc::new(AtomicBool::new(false));
        let flag = cancel_requested.clone();
        let (parent, resolver) = Promise::<i32, String>::make_promise_with_resolver();
        resolver.on_cancel_requested(ExecutionContext::Immediate, move || {
            flag.store(true, Ordering::SeqCst);
        });
        let c1 = parent.then(ExecutionContext::Immediate, None, Options::default(), |_| {});
        let c2 = parent.then(ExecutionContext::Immediate, None, Options::default(), |_| {});
        drop(parent);
        assert!(!cancel_requested.load(Ordering::SeqCst));
        c1.request_cancel();
        assert!(!cancel_requested.load(Ordering::SeqCst));
        c2.request_cancel();
        assert!(cancel_requested.load(Ordering::SeqCst));
    }

    #[test]
    fn ignoring_cancel_is_inert_to_outer_request_cancel() {
        // Keep the resolver alive so `p` stays pending: otherwise an
        // abandoned-resolver cancel would settle `guarded` for an unrelated
        // reason before `request_cancel` is even exercised.
        let (p, _resolver) = Promise::<i32, String>::make_promise_with_resolver();
        let guarded = p.ignoring_cancel();
        guarded.request_cancel();
        assert!(guarded.try_get_result().is_none());
    }

    #[test]
    fn tap_does_not_block_parent_cancellation() {
        let cancel_requested = Arc::new(AtomicBool::new(false));
        let flag = cancel_requested.clone();
        let (parent, resolver) = Promise::<i32, String>::make_promise_with_resolver();
        resolver.on_cancel_requested(ExecutionContext::Immediate, move || {
            flag.store(true, Ordering::SeqCst);
        });
        let _tapped = parent.tap(ExecutionContext::Immediate, None, |_| {});
        drop(parent);
        assert!(cancel_requested.load(Ordering::SeqCst));
    }

    #[test]
    fn link_cancel_forwards_child_cancel_to_parent() {
        let cancel_requested = Arc::new(AtomicBool::new(false));
        let flag = cancel_requested.clone();
        let (parent, resolver) = Promise::<i32, String>::make_promise_with_resolver();
        resolver.on_cancel_requested(ExecutionContext::Immediate, move || {
            flag.store(true, Ordering::SeqCst);
        });
        let child = parent.then(
            ExecutionContext::Immediate,
            None,
            Options {
                link_cancel: true,
                ..Options::default()
            },
            |_| {},
        );
        child.request_cancel();
        assert!(cancel_requested.load(Ordering::SeqCst));
    }

    #[test]
    fn request_cancel_on_invalidate_cancels_on_invalidation() {
        let (p, _resolver) = Promise::<i32, String>::make_promise_with_resolver();
        let token = InvalidationToken::new();
        p.request_cancel_on_invalidate(&token);
        token.invalidate();
        assert!(p.try_get_result().unwrap().is_cancelled());
    }

    #[test]
    fn cancellable_requests_cancellation_through_a_weak_handle() {
        let (p, _resolver) = Promise::<i32, String>::make_promise_with_resolver();
        let handle = p.cancellable();
        handle.request_cancel();
        assert!(p.try_get_result().unwrap().is_cancelled());
    }

    #[test]
    fn cancellable_handle_is_inert_once_the_promise_is_gone() {
        let (p, resolver) = Promise::<i32, String>::make_promise_with_resolver();
        let handle = p.cancellable();
        drop(p);
        drop(resolver);
        // Doesn't panic or upgrade a dead weak reference.
        handle.request_cancel();
    }

    #[test]
    fn delay_adopts_parent_value_after_the_timer() {
        let p: Promise<i32, String> = Promise::new_fulfilled(5);
        let delayed = p.delay(Duration::from_millis(1), ExecutionContext::Immediate);
        // ExecutionContext::Immediate runs the sleep+adopt inline.
        assert_eq!(*delayed.try_get_result().unwrap().value().unwrap(), 5);
    }

    #[test]
    fn delay_child_cancel_short_circuits_without_waiting() {
        let (p, _resolver) = Promise::<i32, String>::make_promise_with_resolver();
        let delayed = p.delay(Duration::from_secs(600), ExecutionContext::Immediate);
        delayed.request_cancel();
        assert!(delayed.try_get_result().unwrap().is_cancelled());
    }

    #[test]
    fn timeout_passes_through_a_value_that_settles_in_time() {
        // `p` is already terminal, so the parent-observer closure settles the
        // child before the unconditionally-scheduled timer closure even
        // starts its sleep; a short duration keeps that sleep brief since
        // `Immediate` runs it synchronously on this thread either way.
        let p: Promise<i32, String> = Promise::new_fulfilled(9);
        let timed = p.timeout(Duration::from_millis(5), ExecutionContext::Immediate);
        assert_eq!(*timed.try_get_result().unwrap().value().unwrap(), 9);
    }

    #[test]
    fn timeout_wraps_an_original_error() {
        let p: Promise<i32, String> = Promise::new_rejected("boom".to_string());
        let timed = p.timeout(Duration::from_millis(5), ExecutionContext::Immediate);
        match timed.try_get_result().unwrap().error().unwrap() {
            TimeoutError::Original(e) => assert_eq!(e, "boom"),
            TimeoutError::TimedOut => panic!("expected the original error to win the race"),
        }
    }

    #[test]
    fn timeout_rejects_and_cancels_parent_when_deadline_elapses_first() {
        let cancel_requested = Arc::new(AtomicBool::new(false));
        let flag = cancel_requested.clone();
        let (p, resolver) = Promise::<i32, String>::make_promise_with_resolver();
        resolver.on_cancel_requested(ExecutionContext::Immediate, move || {
            flag.store(true, Ordering::SeqCst);
        });
        let timed = p.timeout(Duration::from_millis(1), ExecutionContext::Immediate);
        // ExecutionContext::Immediate runs the timer thread's sleep inline
        // before `timeout` returns, since the parent never settles on its own.
        match timed.try_get_result().unwrap().error().unwrap() {
            TimeoutError::TimedOut => {}
            TimeoutError::Original(_) => panic!("parent never settled; timeout must win"),
        }
        assert!(cancel_requested.load(Ordering::SeqCst));
        drop(resolver);
    }

    #[test]
    fn invalidated_token_gates_then_handler() {
        let called = Arc::new(AtomicBool::new(false));
        let called2 = called.clone();
        let (p, resolver) = Promise::<i32, String>::make_promise_with_resolver();
        let token = InvalidationToken::new();
        let _child = p.then(ExecutionContext::Immediate, Some(token.clone()), Options::default(), move |_v| {
            called2.store(true, Ordering::SeqCst);
        });
        token.invalidate();
        resolver.fulfill(1);
        assert!(!called.load(Ordering::SeqCst));
    }
}
