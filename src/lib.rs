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

//! A cancellable, composable promise/future library: a write-once value
//! (`Promise<T, E>`) produced by a paired `Resolver<T, E>`, observed through
//! a fixed taxonomy of operators (`then`, `catch`, `map`, `recover`, `always`,
//! `tap`, `whenCancelled`, ...) that chain into a graph, plus advisory,
//! cooperative cancellation that flows both down (on drop) and up (on
//! request) through that graph.
//!
//! The atomic state machine and lock-free callback/cancel lists live in
//! [`promise_box`]; [`promise`] builds the public `Promise`/`Resolver` API
//! and its operator taxonomy on top of that; [`context`] supplies the
//! dispatch policies (`ExecutionContext`) a callback can run on; [`token`]
//! is the reusable invalidation mechanism that gates callbacks and can mass-
//! cancel every promise subscribed to it; [`util`] adds the collection
//! combinators (`when_fulfilled`, `race`) built from the public operator API.

mod context;
mod error;
mod list;
mod promise;
mod promise_box;
mod token;
mod util;

pub use context::{
    is_executing_now, mark_main_thread, configure_pools, ExecutionContext, OperationQueue, PoolConfig, Qos, Queue,
};
pub use error::{PromiseLibError, TimeoutError};
pub use promise::{CancelHandle, MapResult, Options, Promise, PromiseResult, Resolver};
pub use promise_box::Outcome;
pub use token::InvalidationToken;
pub use util::{race, when_fulfilled};
