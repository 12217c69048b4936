//! Cross-module properties from the testable-properties list: uniqueness,
//! registration order, terminal-state stability, the seal-then-resolve race,
//! propagation, `tap`/`whenCancelled` non-interference, `Main` ordering, and
//! `nowOr` synchrony.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

use cancelable_promise::{is_executing_now, mark_main_thread, ExecutionContext, Options, Promise, Queue};
use pretty_assertions::assert_eq;

#[test]
fn uniqueness_every_attached_callback_sees_the_same_outcome_exactly_once() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let p: Promise<i32, String> = Promise::new_fulfilled(99);
    let mut children = Vec::new();
    for _ in 0..5 {
        let seen = seen.clone();
        let child = p.inspect(ExecutionContext::immediate(), None, Options::default(), move |outcome| {
            seen.lock().unwrap().push(outcome.value().copied());
        });
        children.push(child);
    }
    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 5);
    assert!(seen.iter().all(|v| *v == Some(99)));
}

#[test]
fn order_callbacks_on_one_context_fire_in_registration_order() {
    let queue = Queue::serial("property-order-test");
    let (tx, rx) = mpsc::channel();
    let p: Promise<i32, String> = Promise::new_fulfilled(0);
    let mut children = Vec::new();
    for i in 0..10 {
        let tx = tx.clone();
        let child = p.then(ExecutionContext::queue(queue.clone()), None, Options::default(), move |_v| {
            tx.send(i).unwrap();
        });
        children.push(child);
    }
    let got: Vec<i32> = (0..10).map(|_| rx.recv_timeout(Duration::from_secs(1)).unwrap()).collect();
    assert_eq!(got, (0..10).collect::<Vec<_>>());
}

#[test]
fn terminal_state_is_stable_once_settled() {
    let (p, resolver) = Promise::<i32, String>::make_promise_with_resolver();
    assert!(resolver.fulfill(1));
    assert!(!resolver.fulfill(2));
    assert!(!resolver.reject("x".to_string()));
    assert!(!resolver.cancel());
    let result = p.try_get_result().unwrap();
    assert_eq!(*result.value().unwrap(), 1);
}

#[test]
fn seal_then_resolve_race_fires_exactly_once_per_attacher() {
    let (p, resolver) = Promise::<i32, String>::make_promise_with_resolver();
    let fire_count = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::new();
    for _ in 0..20 {
        let p = p.clone();
        let fire_count = fire_count.clone();
        handles.push(thread::spawn(move || {
            let _ = p.inspect(ExecutionContext::immediate(), None, Options::default(), move |_| {
                fire_count.fetch_add(1, Ordering::SeqCst);
            });
        }));
    }
    handles.push(thread::spawn(move || {
        resolver.fulfill(1);
    }));
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(fire_count.load(Ordering::SeqCst), 20);
}

#[test]
fn propagation_fires_once_every_propagating_child_has_cancelled() {
    let cancel_requested = Arc::new(AtomicUsize::new(0));
    let flag = cancel_requested.clone();
    let (parent, resolver) = Promise::<i32, String>::make_promise_with_resolver();
    resolver.on_cancel_requested(ExecutionContext::immediate(), move || {
        flag.fetch_add(1, Ordering::SeqCst);
    });
    let c1 = parent.then(ExecutionContext::immediate(), None, Options::default(), |_| {});
    let c2 = parent.catch(ExecutionContext::immediate(), None, Options::default(), |_| {});
    let c3 = parent.inspect(ExecutionContext::immediate(), None, Options::default(), |_| {});
    drop(parent);
    c1.request_cancel();
    c2.request_cancel();
    assert_eq!(cancel_requested.load(Ordering::SeqCst), 0);
    c3.request_cancel();
    assert_eq!(cancel_requested.load(Ordering::SeqCst), 1);
    drop(resolver);
}

#[test]
fn tap_and_when_cancelled_never_affect_propagation_for_other_children() {
    let cancel_requested = Arc::new(AtomicBool::new(false));
    let flag = cancel_requested.clone();
    let (parent, resolver) = Promise::<i32, String>::make_promise_with_resolver();
    resolver.on_cancel_requested(ExecutionContext::immediate(), move || {
        flag.store(true, Ordering::SeqCst);
    });
    let c1 = parent.then(ExecutionContext::immediate(), None, Options::default(), |_| {});
    let _tap = parent.tap(ExecutionContext::immediate(), None, |_| {});
    let _when_cancelled = parent.when_cancelled(ExecutionContext::immediate(), None, || {});
    drop(parent);
    assert!(!cancel_requested.load(Ordering::SeqCst));
    c1.request_cancel();
    assert!(cancel_requested.load(Ordering::SeqCst));
}

#[test]
fn main_context_dispatches_a_chain_in_registration_order() {
    mark_main_thread();
    let (tx, rx) = mpsc::channel();
    let p: Promise<i32, String> = Promise::new_fulfilled(0);
    let mut children = Vec::new();
    for i in 0..5 {
        let tx = tx.clone();
        let child = p.then(ExecutionContext::main(), None, Options::default(), move |_v| {
            tx.send(i).unwrap();
        });
        children.push(child);
    }
    let got: Vec<i32> = (0..5).map(|_| rx.recv_timeout(Duration::from_secs(1)).unwrap()).collect();
    assert_eq!(got, vec![0, 1, 2, 3, 4]);
}

#[test]
fn now_or_runs_synchronously_on_an_already_resolved_promise() {
    let p = Promise::<i32, String>::new_fulfilled(7);
    let ran_sync = Arc::new(AtomicBool::new(false));
    let seen_executing_now = Arc::new(AtomicBool::new(false));
    let ran2 = ran_sync.clone();
    let seen2 = seen_executing_now.clone();
    let ctx = ExecutionContext::now_or_context(ExecutionContext::background());
    let _child = p.inspect(ctx, None, Options::default(), move |_outcome| {
        seen2.store(is_executing_now(), Ordering::SeqCst);
        ran2.store(true, Ordering::SeqCst);
    });
    assert!(ran_sync.load(Ordering::SeqCst));
    assert!(seen_executing_now.load(Ordering::SeqCst));
}
