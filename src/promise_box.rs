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

//! The atomic state machine behind a [`crate::promise::Promise`].
//!
//! Lock-free: state transitions are a CAS loop over a single atomic byte,
//! the callback and cancel-request lists are the [`crate::list::Stack`]
//! lock-free LIFOs, and the observer count lives in one atomic `u64`. No
//! mutex is ever held across a user callback.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use tracing::trace;

use crate::context::ExecutionContext;
use crate::list::Stack;

/// One of the three terminal outcomes a promise can settle into, or the
/// not-yet-terminal placeholder used while draining.
pub enum Outcome<T, E> {
    Value(T),
    Error(E),
    Cancelled,
}

impl<T, E> Outcome<T, E> {
    pub fn value(&self) -> Option<&T> {
        match self {
            Outcome::Value(v) => Some(v),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&E> {
        match self {
            Outcome::Error(e) => Some(e),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Outcome::Cancelled)
    }
}

pub(crate) type SharedOutcome<T, E> = Arc<Outcome<T, E>>;

#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum BoxState {
    Delayed = 0,
    Empty = 1,
    Resolving = 2,
    Resolved = 3,
    Cancelling = 4,
    Cancelled = 5,
}

impl BoxState {
    fn from_u8(v: u8) -> BoxState {
        match v {
            0 => BoxState::Delayed,
            1 => BoxState::Empty,
            2 => BoxState::Resolving,
            3 => BoxState::Resolved,
            4 => BoxState::Cancelling,
            5 => BoxState::Cancelled,
            _ => unreachable!("invalid promise box state byte"),
        }
    }

    fn is_valid_transition(from: BoxState, to: BoxState) -> bool {
        use BoxState::*;
        matches!(
            (from, to),
            (Delayed, Empty)
                | (Empty, Resolving)
                | (Empty, Cancelling)
                | (Empty, Cancelled)
                | (Resolving, Resolved)
                | (Cancelling, Resolving)
                | (Cancelling, Cancelled)
        )
    }

    pub(crate) fn is_terminal(self) -> bool {
        matches!(self, BoxState::Resolved | BoxState::Cancelled)
    }
}

pub(crate) struct CallbackNode<T, E> {
    pub(crate) context: ExecutionContext,
    /// Takes ownership of a clone of the shared `Arc`, not the `Outcome`
    /// itself, so a callback that only mirrors the result onward (`then`,
    /// `catch`, `inspect`, ...) can forward the exact same allocation to a
    /// child box without requiring `T: Clone` / `E: Clone`.
    pub(crate) callback: Box<dyn FnOnce(SharedOutcome<T, E>) + Send>,
}

pub(crate) struct CancelNode {
    pub(crate) context: ExecutionContext,
    pub(crate) callback: Box<dyn FnOnce() + Send>,
}

const SEAL_BIT: u64 = 1 << 63;
const COUNT_MASK: u64 = !SEAL_BIT;

pub(crate) struct PromiseBox<T, E> {
    state: AtomicU8,
    result: std::cell::UnsafeCell<Option<SharedOutcome<T, E>>>,
    callback_list: Stack<CallbackNode<T, E>>,
    cancel_list: Stack<CancelNode>,
    observer_flags: AtomicU64,
}

// SAFETY: the only non-Sync field is the UnsafeCell<Option<Arc<Outcome<T,E>>>>,
// which is written exactly once under the Resolving/Cancelling->Cancelled
// transition (no concurrent readers by construction, invariant 1 in
// SPEC_FULL.md §3) and read only once `state` has reached a terminal value,
// observed with Acquire ordering after the writer's Release store.
unsafe impl<T: Send + Sync, E: Send + Sync> Sync for PromiseBox<T, E> {}

impl<T, E> PromiseBox<T, E> {
    pub(crate) fn new(initial: BoxState) -> Self {
        debug_assert!(matches!(initial, BoxState::Delayed | BoxState::Empty));
        PromiseBox {
            state: AtomicU8::new(initial as u8),
            result: std::cell::UnsafeCell::new(None),
            callback_list: Stack::new(),
            cancel_list: Stack::new(),
            observer_flags: AtomicU64::new(0),
        }
    }

    /// Builds a box that is already terminal, as used by `newFulfilled`,
    /// `newRejected` and `newCancelled`: no allocation racing is possible
    /// since nothing could have attached before construction completes.
    pub(crate) fn new_terminal(outcome: Outcome<T, E>) -> Self {
        let state = if outcome.is_cancelled() {
            BoxState::Cancelled
        } else {
            BoxState::Resolved
        };
        let this = PromiseBox {
            state: AtomicU8::new(state as u8),
            result: std::cell::UnsafeCell::new(Some(Arc::new(outcome))),
            callback_list: Stack::new(),
            cancel_list: Stack::new(),
            observer_flags: AtomicU64::new(0),
        };
        let _ = this.callback_list.seal_and_take();
        let _ = this.cancel_list.seal_and_take();
        this
    }

    pub(crate) fn state(&self) -> BoxState {
        BoxState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn unfenced_state(&self) -> BoxState {
        BoxState::from_u8(self.state.load(Ordering::Relaxed))
    }

    /// CAS the state from its currently-valid predecessor to `to`. Returns
    /// `false` if `to` is not reachable from the observed current state.
    pub(crate) fn transition_state(&self, to: BoxState) -> bool {
        loop {
            let cur = self.state.load(Ordering::Acquire);
            let cur_state = BoxState::from_u8(cur);
            if !BoxState::is_valid_transition(cur_state, to) {
                return false;
            }
            match self
                .state
                .compare_exchange_weak(cur, to as u8, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    trace!(from = ?cur_state, to = ?to, "promise box state transition");
                    return true;
                }
                Err(_) => continue,
            }
        }
    }

    pub(crate) fn push_callback(
        &self,
        node: CallbackNode<T, E>,
    ) -> Result<(), CallbackNode<T, E>> {
        self.callback_list.push(node)
    }

    /// Registers a result callback, or runs it immediately (per `context`'s
    /// attach policy) if the box has already settled and the callback list
    /// is sealed.
    pub(crate) fn observe(
        &self,
        context: ExecutionContext,
        callback: Box<dyn FnOnce(SharedOutcome<T, E>) + Send>,
    ) {
        let node = CallbackNode { context, callback };
        if let Err(node) = self.push_callback(node) {
            let outcome = self
                .try_clone_result()
                .expect("callback list only rejects pushes once a terminal result is sealed in");
            node.context
                .execute_attach(true, Box::new(move || (node.callback)(outcome)));
        }
    }

    pub(crate) fn push_cancel(&self, node: CancelNode) -> Result<(), CancelNode> {
        self.cancel_list.push(node)
    }

    pub(crate) fn try_clone_result(&self) -> Option<SharedOutcome<T, E>> {
        if !self.state().is_terminal() {
            return None;
        }
        // SAFETY: state load above used Acquire ordering and observed a
        // terminal value, which happens-after the Release store that wrote
        // `result` in `resolve`.
        unsafe { (*self.result.get()).clone() }
    }

    fn write_result(&self, outcome: SharedOutcome<T, E>) {
        // SAFETY: called only while transitioning into Resolving/Cancelled,
        // which forbids concurrent readers per invariant 1 in SPEC_FULL.md §3.
        unsafe {
            *self.result.get() = Some(outcome);
        }
    }

    /// Resolves the box with a final outcome. Returns `false` if the box was
    /// already terminal (the resolution is dropped, per invariant: a
    /// resolved outcome is immutable).
    pub(crate) fn resolve(&self, outcome: Outcome<T, E>) -> bool {
        self.resolve_shared(Arc::new(outcome))
    }

    /// Like [`Self::resolve`], but adopts an already-shared outcome directly
    /// instead of wrapping a fresh one. Used by mirroring operators (`then`,
    /// `catch`, `inspect`, ...) to forward a parent's result to a child box
    /// by bumping the `Arc` refcount rather than cloning `T`/`E`.
    pub(crate) fn resolve_shared(&self, outcome: SharedOutcome<T, E>) -> bool {
        let is_cancel = outcome.is_cancelled();
        loop {
            match self.state() {
                BoxState::Delayed => {
                    self.transition_state(BoxState::Empty);
                    continue;
                }
                BoxState::Empty | BoxState::Cancelling => {
                    let target = if is_cancel {
                        BoxState::Cancelled
                    } else {
                        BoxState::Resolving
                    };
                    if self.transition_state(target) {
                        break;
                    }
                }
                BoxState::Resolving | BoxState::Resolved | BoxState::Cancelled => return false,
            }
        }
        self.write_result(outcome);
        if !is_cancel {
            let ok = self.transition_state(BoxState::Resolved);
            debug_assert!(ok, "Resolving -> Resolved must succeed for the resolving thread");
        }
        self.drain_terminal();
        true
    }

    fn drain_terminal(&self) {
        let outcome = {
            // SAFETY: state is now terminal (Resolved/Cancelled), written by
            // this same thread just above with no concurrent writer possible.
            unsafe { (*self.result.get()).clone() }
        }
        .expect("result must be written before draining");
        let callbacks = self.callback_list.seal_and_take();
        for node in callbacks {
            let outcome = outcome.clone();
            node.context
                .execute_attach(false, Box::new(move || (node.callback)(outcome)));
        }
        let _ = self.cancel_list.seal_and_take();
    }

    /// Advisory cancellation request. Does nothing if the box is already
    /// resolving, resolved, cancelling or cancelled.
    pub(crate) fn request_cancel(&self) {
        loop {
            match self.state() {
                BoxState::Delayed => {
                    self.transition_state(BoxState::Empty);
                    continue;
                }
                BoxState::Empty => {
                    if self.transition_state(BoxState::Cancelling) {
                        self.run_cancel_handlers();
                        return;
                    }
                    continue;
                }
                BoxState::Cancelling
                | BoxState::Resolving
                | BoxState::Resolved
                | BoxState::Cancelled => return,
            }
        }
    }

    fn run_cancel_handlers(&self) {
        let handlers = self.cancel_list.drain();
        if handlers.is_empty() {
            // Handler-less fast path: nothing will ever veto the cancel.
            self.resolve(Outcome::Cancelled);
            return;
        }
        for node in handlers {
            node.context.execute(Box::new(move || (node.callback)()));
        }
    }

    /// Registers a cancel-request handler, or runs it immediately if the
    /// cancel has already been requested (or the box is already terminal).
    pub(crate) fn on_cancel_requested(&self, node: CancelNode) {
        match self.state() {
            BoxState::Cancelling | BoxState::Resolved | BoxState::Cancelled => {
                node.context.execute(Box::new(move || (node.callback)()));
                return;
            }
            _ => {}
        }
        if let Err(node) = self.push_cancel(node) {
            node.context.execute(Box::new(move || (node.callback)()));
        }
    }

    pub(crate) fn increment_observer_count(&self) {
        self.observer_flags.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns `true` iff this decrement brought the count to zero while the
    /// seal bit was already set, i.e. propagation to the parent should fire.
    pub(crate) fn decrement_observer_count(&self) -> bool {
        let prev = self.observer_flags.fetch_sub(1, Ordering::AcqRel);
        let prev_count = prev & COUNT_MASK;
        let sealed = prev & SEAL_BIT != 0;
        debug_assert!(prev_count > 0, "observer count underflow");
        prev_count == 1 && sealed
    }

    /// Seals the observer count (no further direct observers may attach).
    /// Returns `true` if the count was already zero, meaning propagation
    /// should fire now.
    pub(crate) fn seal_observer_count(&self) -> bool {
        let prev = self.observer_flags.fetch_or(SEAL_BIT, Ordering::AcqRel);
        (prev & COUNT_MASK) == 0
    }

    /// Like `decrement_observer_count`, but ignores the seal bit: used by
    /// `propagatingCancellation`, which propagates eagerly once the count
    /// hits zero regardless of whether the wrapper promise has been sealed.
    pub(crate) fn decrement_observer_count_eager(&self) -> bool {
        let prev = self.observer_flags.fetch_sub(1, Ordering::AcqRel);
        let prev_count = prev & COUNT_MASK;
        debug_assert!(prev_count > 0, "observer count underflow");
        prev_count == 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_transitions() {
        assert!(BoxState::is_valid_transition(BoxState::Delayed, BoxState::Empty));
        assert!(BoxState::is_valid_transition(BoxState::Empty, BoxState::Resolving));
        assert!(BoxState::is_valid_transition(BoxState::Empty, BoxState::Cancelling));
        assert!(BoxState::is_valid_transition(BoxState::Empty, BoxState::Cancelled));
        assert!(BoxState::is_valid_transition(BoxState::Resolving, BoxState::Resolved));
        assert!(BoxState::is_valid_transition(BoxState::Cancelling, BoxState::Resolving));
        assert!(BoxState::is_valid_transition(BoxState::Cancelling, BoxState::Cancelled));
    }

    #[test]
    fn invalid_transitions_rejected() {
        assert!(!BoxState::is_valid_transition(BoxState::Delayed, BoxState::Resolved));
        assert!(!BoxState::is_valid_transition(BoxState::Resolved, BoxState::Empty));
        assert!(!BoxState::is_valid_transition(BoxState::Cancelled, BoxState::Resolving));
        assert!(!BoxState::is_valid_transition(BoxState::Empty, BoxState::Empty));
    }

    #[test]
    fn resolve_terminal_only_once() {
        let b: PromiseBox<i32, String> = PromiseBox::new(BoxState::Empty);
        assert!(b.resolve(Outcome::Value(1)));
        assert!(!b.resolve(Outcome::Value(2)));
        let r = b.try_clone_result().unwrap();
        assert_eq!(*r.value().unwrap(), 1);
    }

    #[test]
    fn observer_count_seals_and_propagates() {
        let b: PromiseBox<i32, String> = PromiseBox::new(BoxState::Empty);
        b.increment_observer_count();
        b.increment_observer_count();
        assert!(!b.decrement_observer_count()); // count 1, not sealed yet
        assert!(!b.seal_observer_count()); // seals, but count is 1 != 0
        assert!(b.decrement_observer_count()); // now zero and sealed
    }

    #[test]
    fn seal_then_zero_immediately_fires() {
        let b: PromiseBox<i32, String> = PromiseBox::new(BoxState::Empty);
        assert!(b.seal_observer_count()); // already zero observers
    }
}
