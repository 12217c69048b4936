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

//! Error types owned by the library itself.
//!
//! The promise's error channel `E` is fully generic and opaque to the core;
//! these are the only failure kinds the core can produce on its own.

use std::fmt;

use thiserror::Error;

/// Failures produced by the core rather than by user code.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PromiseLibError {
    /// Both the value and the error passed to the callback-adapter helper
    /// were nil. See `TimeoutError` / the callback-adapter open question in
    /// SPEC_FULL.md for the precedence rule this implies elsewhere.
    #[error("both value and error were nil in the callback adapter")]
    ApiMismatch,
    /// Emitted by [`crate::promise::Promise::timeout`] when the deadline
    /// elapses first.
    #[error("the operation timed out")]
    TimedOut,
}

/// The error type produced by [`crate::promise::Promise::timeout`].
///
/// Wraps the original promise's error channel so callers can distinguish a
/// timeout from the underlying operation's own failure.
#[derive(Debug, Clone)]
pub enum TimeoutError<E> {
    /// The original promise settled with this error before the deadline.
    Original(E),
    /// The deadline elapsed before the original promise settled.
    TimedOut,
}

impl<E: fmt::Display> fmt::Display for TimeoutError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeoutError::Original(e) => write!(f, "{e}"),
            TimeoutError::TimedOut => write!(f, "{}", PromiseLibError::TimedOut),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for TimeoutError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TimeoutError::Original(e) => Some(e),
            TimeoutError::TimedOut => None,
        }
    }
}
