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

//! Combinators over collections of promises: `when_fulfilled` (join) and
//! `race` (select). `delay`/`timeout` live as methods on [`crate::promise::Promise`]
//! itself (see `promise.rs`), since they need the private `Inner` plumbing to
//! let a timer thread and the parent's own settlement race to resolve the
//! same child without either side forcing a cancel on drop.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::context::ExecutionContext;
use crate::promise::{Options, Promise};
use crate::promise_box::Outcome;

/// Joins `promises`, fulfilling with every value in input order once all of
/// them have fulfilled. The first rejection or cancellation among them
/// settles the join immediately, discarding any later-arriving outcomes; if
/// `cancel_on_failure` is set, every other still-pending sibling is sent a
/// cancellation request at that point.
pub fn when_fulfilled<T, E>(promises: Vec<Promise<T, E>>, cancel_on_failure: bool) -> Promise<Vec<T>, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    let (result, resolver) = Promise::<Vec<T>, E>::make_promise_with_resolver();
    if promises.is_empty() {
        resolver.fulfill(Vec::new());
        return result;
    }

    let resolver = Arc::new(Mutex::new(Some(resolver)));
    let values: Arc<Mutex<Vec<Option<T>>>> = Arc::new(Mutex::new(promises.iter().map(|_| None).collect()));
    let siblings: Arc<Vec<Promise<T, E>>> = Arc::new(promises);

    for (idx, p) in siblings.iter().enumerate() {
        let resolver = resolver.clone();
        let values = values.clone();
        let siblings = siblings.clone();
        let _ = p.inspect(
            ExecutionContext::Immediate,
            None,
            Options::default(),
            move |outcome: &Outcome<T, E>| match outcome {
                Outcome::Value(v) => {
                    let mut vals = values.lock();
                    vals[idx] = Some(v.clone());
                    if vals.iter().all(Option::is_some) {
                        let collected: Vec<T> = vals.iter().cloned().map(|o| o.expect("just checked all Some")).collect();
                        drop(vals);
                        if let Some(r) = resolver.lock().take() {
                            r.fulfill(collected);
                        }
                    }
                }
                Outcome::Error(e) => {
                    if let Some(r) = resolver.lock().take() {
                        r.reject(e.clone());
                    }
                    if cancel_on_failure {
                        for sib in siblings.iter() {
                            sib.request_cancel();
                        }
                    }
                }
                Outcome::Cancelled => {
                    if let Some(r) = resolver.lock().take() {
                        r.cancel();
                    }
                    if cancel_on_failure {
                        for sib in siblings.iter() {
                            sib.request_cancel();
                        }
                    }
                }
            },
        );
    }
    result
}

/// Settles with the first non-cancelled outcome among `promises`. A
/// cancelled input is skipped outright rather than settling the race; if
/// every input ends up cancelled, the race itself settles as cancelled. If
/// `cancel_remaining` is set, the winner's siblings are sent a cancellation
/// request once the race is decided.
pub fn race<T, E>(promises: Vec<Promise<T, E>>, cancel_remaining: bool) -> Promise<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    let (result, resolver) = Promise::<T, E>::make_promise_with_resolver();
    if promises.is_empty() {
        resolver.cancel();
        return result;
    }

    let resolver = Arc::new(Mutex::new(Some(resolver)));
    let remaining = Arc::new(AtomicUsize::new(promises.len()));
    let siblings: Arc<Vec<Promise<T, E>>> = Arc::new(promises);

    for p in siblings.iter() {
        let resolver = resolver.clone();
        let remaining = remaining.clone();
        let siblings = siblings.clone();
        let _ = p.inspect(
            ExecutionContext::Immediate,
            None,
            Options::default(),
            move |outcome: &Outcome<T, E>| match outcome {
                Outcome::Cancelled => {
                    if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                        if let Some(r) = resolver.lock().take() {
                            r.cancel();
                        }
                    }
                }
                Outcome::Value(v) => {
                    if let Some(r) = resolver.lock().take() {
                        r.fulfill(v.clone());
                    }
                    if cancel_remaining {
                        for sib in siblings.iter() {
                            sib.request_cancel();
                        }
                    }
                }
                Outcome::Error(e) => {
                    if let Some(r) = resolver.lock().take() {
                        r.reject(e.clone());
                    }
                    if cancel_remaining {
                        for sib in siblings.iter() {
                            sib.request_cancel();
                        }
                    }
                }
            },
        );
    }
    result
}
