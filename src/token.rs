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

//! Invalidation tokens: a generation counter plus a list of subscribed
//! promises that get a cancel request forwarded to them when the token is
//! invalidated.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use tracing::trace;

use crate::list::Stack;

/// Anything that can receive an advisory cancellation request. Implemented
/// by `Promise`'s underlying box so a token can hold a type-erased, weak
/// reference to it without knowing `T`/`E`.
pub trait Cancellable: Send + Sync {
    fn request_cancel(&self);
}

struct TokenState {
    generation: AtomicU64,
    subscriptions: Stack<Weak<dyn Cancellable>>,
}

/// A user-held invalidator that gates token-aware callbacks and can cancel
/// every promise subscribed to it.
///
/// `Clone`, like `tokio_util`'s `CancellationToken`: every clone shares the
/// same underlying generation counter and subscription list, so a token can
/// be captured by value into an operator's callback closure without the
/// caller needing to keep a separate reference alive.
///
/// Reusable: each `invalidate()` call bumps the generation and drains the
/// current subscription list, but further promises may still subscribe
/// afterwards (e.g. promises created after a prior invalidation).
#[derive(Clone)]
pub struct InvalidationToken {
    state: Arc<TokenState>,
}

impl Default for InvalidationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl InvalidationToken {
    pub fn new() -> Self {
        InvalidationToken {
            state: Arc::new(TokenState {
                generation: AtomicU64::new(0),
                subscriptions: Stack::new(),
            }),
        }
    }

    /// The current generation, read with acquire ordering.
    pub fn snapshot(&self) -> u64 {
        self.state.generation.load(Ordering::Acquire)
    }

    /// Returns whether `snapshot` (as previously captured by
    /// [`InvalidationToken::snapshot`]) is still current, i.e. no
    /// invalidation has happened since. Used by token-gated operators to
    /// decide whether to run a registered closure.
    pub(crate) fn is_current(&self, snapshot: u64) -> bool {
        self.snapshot() == snapshot
    }

    /// Subscribes a promise's box for cancellation the next time this token
    /// is invalidated. Held weakly: an unreachable promise is simply skipped.
    pub(crate) fn subscribe(&self, target: Weak<dyn Cancellable>) {
        let _ = self.state.subscriptions.push(target);
    }

    fn drain_and_cancel(&self) {
        for weak in self.state.subscriptions.drain() {
            if let Some(target) = weak.upgrade() {
                target.request_cancel();
            }
        }
    }

    /// Increments the generation and requests cancellation on every
    /// currently-subscribed promise.
    pub fn invalidate(&self) {
        self.state.generation.fetch_add(1, Ordering::AcqRel);
        trace!(generation = self.snapshot(), "invalidation token invalidated");
        self.drain_and_cancel();
    }

    /// Requests cancellation on every currently-subscribed promise without
    /// bumping the generation (so token-gated callbacks registered earlier
    /// still run if their promise resolves normally instead of cancelling).
    pub fn cancel_without_invalidating(&self) {
        self.drain_and_cancel();
    }

    /// Convenience for `promise.request_cancel_on_invalidate(self)`, taking
    /// any type implementing `Cancellable` plus a way to get a weak handle
    /// to it. `Promise::request_cancel_on_invalidate` is the ergonomic entry
    /// point most callers want; this exists for symmetry with the
    /// `Token.requestCancelOnInvalidate(promise)` surface in SPEC_FULL.md §6.
    pub fn request_cancel_on_invalidate(&self, promise: &Arc<dyn Cancellable>) {
        self.subscribe(Arc::downgrade(promise));
    }
}
