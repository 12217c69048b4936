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

//! A lock-free, intrusive, singly-linked LIFO stack shared by the callback
//! list and the cancel-request list of a [`crate::promise_box::PromiseBox`],
//! and (in its unsealed form) by [`crate::token::InvalidationToken`]'s
//! subscription list.
//!
//! Pushes race each other via `compare_exchange_weak` retry loops, same as
//! the registration linked list in the teacher crate's `CancellationToken`,
//! except there is no mutex here: the head pointer is the only shared state.
//! A dedicated sentinel address (distinct from any real node, and from null)
//! marks the list as sealed; once sealed, further pushes fail and the caller
//! must run the node inline instead.

use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

use crossbeam_utils::Backoff;

struct Node<T> {
    value: T,
    next: *mut Node<T>,
}

/// Returns the process-wide sentinel pointer used to mark a sealed list.
///
/// The address is never dereferenced as a `Node<T>`; it only needs to be a
/// stable, non-null value that can never equal a real allocation's address.
fn sealed_sentinel<T>() -> *mut Node<T> {
    static SENTINEL_BYTE: u8 = 0;
    (&SENTINEL_BYTE as *const u8).cast_mut().cast()
}

pub(crate) struct Stack<T> {
    head: AtomicPtr<Node<T>>,
}

impl<T> Stack<T> {
    pub(crate) fn new() -> Self {
        Stack {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Pushes `value` onto the list. Returns `Err(value)` if the list is
    /// already sealed, in which case the caller must act as though the node
    /// were never enqueued (typically: run it inline instead).
    pub(crate) fn push(&self, value: T) -> Result<(), T> {
        let sentinel = sealed_sentinel::<T>();
        let mut node = Box::new(Node {
            value,
            next: ptr::null_mut(),
        });
        let backoff = Backoff::new();
        loop {
            let head = self.head.load(Ordering::Acquire);
            if head == sentinel {
                return Err(node.value);
            }
            node.next = head;
            let node_ptr = Box::into_raw(node);
            match self
                .head
                .compare_exchange_weak(head, node_ptr, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Ok(()),
                Err(_) => {
                    // SAFETY: we just created node_ptr from Box::into_raw and the CAS
                    // that would have published it failed, so we still own it.
                    node = unsafe { Box::from_raw(node_ptr) };
                    backoff.spin();
                }
            }
        }
    }

    /// Atomically swaps the head with the sealed sentinel and returns the
    /// prior chain, in registration (FIFO) order. May only meaningfully be
    /// called once per list; subsequent calls observe an already-sealed list
    /// and return an empty vector.
    pub(crate) fn seal_and_take(&self) -> Vec<T> {
        let sentinel = sealed_sentinel::<T>();
        let old = self.head.swap(sentinel, Ordering::AcqRel);
        Self::drain_chain(old, sentinel)
    }

    /// Atomically swaps the head with `null` and returns the prior chain, in
    /// registration (FIFO) order, without sealing the list: further pushes
    /// remain possible. Used by [`crate::token::InvalidationToken`], which is
    /// reusable across multiple invalidations.
    pub(crate) fn drain(&self) -> Vec<T> {
        let old = self.head.swap(ptr::null_mut(), Ordering::AcqRel);
        Self::drain_chain(old, sealed_sentinel::<T>())
    }

    fn drain_chain(head: *mut Node<T>, sentinel: *mut Node<T>) -> Vec<T> {
        let mut values = Vec::new();
        let mut cur = head;
        while !cur.is_null() && cur != sentinel {
            // SAFETY: every non-null, non-sentinel pointer in the chain was
            // produced by `Box::into_raw` in `push` and is only ever visited
            // once because we just unlinked the whole chain via `swap`.
            let node = unsafe { Box::from_raw(cur) };
            cur = node.next;
            values.push(node.value);
        }
        // LIFO push order reversed back into registration order.
        values.reverse();
        values
    }
}

impl<T> Drop for Stack<T> {
    fn drop(&mut self) {
        let sentinel = sealed_sentinel::<T>();
        let head = *self.head.get_mut();
        if head != sentinel {
            let _ = Self::drain_chain(head, sentinel);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_and_seal_restores_registration_order() {
        let stack = Stack::new();
        stack.push(1).unwrap();
        stack.push(2).unwrap();
        stack.push(3).unwrap();
        assert_eq!(stack.seal_and_take(), vec![1, 2, 3]);
    }

    #[test]
    fn push_after_seal_fails() {
        let stack = Stack::new();
        stack.push(1).unwrap();
        assert_eq!(stack.seal_and_take(), vec![1]);
        assert_eq!(stack.push(2), Err(2));
    }

    #[test]
    fn drain_does_not_seal() {
        let stack = Stack::new();
        stack.push(1).unwrap();
        assert_eq!(stack.drain(), vec![1]);
        stack.push(2).unwrap();
        assert_eq!(stack.drain(), vec![2]);
    }

    #[test]
    fn empty_seal_is_empty() {
        let stack: Stack<i32> = Stack::new();
        assert_eq!(stack.seal_and_take(), Vec::<i32>::new());
    }
}
