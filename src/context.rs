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

//! Execution contexts: the dispatch policies a promise body or callback can
//! be scheduled onto.
//!
//! The thread-pool / dispatch primitive that actually runs work is, per
//! SPEC_FULL.md §1/§5, an external collaborator the core only needs an
//! interface to. The pools and queues below are the minimal concrete
//! stand-ins that make the crate runnable and testable; their scheduling
//! quality is not the subject of this crate.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;

use crossbeam_channel::{unbounded, Sender};

pub(crate) type Job = Box<dyn FnOnce() + Send>;

/// Dispatch queue-of-concurrency class, mirroring GCD's QoS classes.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub enum Qos {
    Background,
    Utility,
    Default,
    UserInitiated,
    UserInteractive,
}

/// Thread-count knobs for the built-in QoS worker pools.
///
/// GCD's global concurrent queues are system-managed and need no equivalent
/// configuration; a standalone Rust implementation has no such scheduler to
/// borrow, so this knob is this crate's substitute. Call
/// [`configure_pools`] once, before the first context is used, to override
/// the defaults.
#[derive(Clone, Copy, Debug)]
pub struct PoolConfig {
    pub background_threads: usize,
    pub utility_threads: usize,
    pub default_threads: usize,
    pub user_initiated_threads: usize,
    pub user_interactive_threads: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            background_threads: 1,
            utility_threads: 2,
            default_threads: 4,
            user_initiated_threads: 4,
            user_interactive_threads: 2,
        }
    }
}

struct FixedPool {
    sender: Sender<Job>,
}

impl FixedPool {
    fn new(name: &'static str, threads: usize) -> Self {
        let (sender, receiver) = unbounded::<Job>();
        for i in 0..threads.max(1) {
            let receiver = receiver.clone();
            thread::Builder::new()
                .name(format!("{name}-{i}"))
                .spawn(move || {
                    for job in receiver.iter() {
                        job();
                    }
                })
                .expect("spawn promise pool worker thread");
        }
        FixedPool { sender }
    }

    fn submit(&self, job: Job) {
        let _ = self.sender.send(job);
    }
}

struct QosPools {
    background: FixedPool,
    utility: FixedPool,
    default_qos: FixedPool,
    user_initiated: FixedPool,
    user_interactive: FixedPool,
}

impl QosPools {
    fn new(config: PoolConfig) -> Self {
        QosPools {
            background: FixedPool::new("promise-bg", config.background_threads),
            utility: FixedPool::new("promise-utility", config.utility_threads),
            default_qos: FixedPool::new("promise-default", config.default_threads),
            user_initiated: FixedPool::new("promise-user-initiated", config.user_initiated_threads),
            user_interactive: FixedPool::new("promise-user-interactive", config.user_interactive_threads),
        }
    }

    fn pool(&self, qos: Qos) -> &FixedPool {
        match qos {
            Qos::Background => &self.background,
            Qos::Utility => &self.utility,
            Qos::Default => &self.default_qos,
            Qos::UserInitiated => &self.user_initiated,
            Qos::UserInteractive => &self.user_interactive,
        }
    }
}

static POOLS: OnceLock<QosPools> = OnceLock::new();

/// Configures the QoS worker pools. Has an effect only the first time it is
/// called, before any context has dispatched to a QoS pool; returns the
/// config back on failure, same shape as `OnceLock::set`.
pub fn configure_pools(config: PoolConfig) -> Result<(), PoolConfig> {
    POOLS.set(QosPools::new(config)).map_err(|_| config)
}

fn pools() -> &'static QosPools {
    POOLS.get_or_init(|| QosPools::new(PoolConfig::default()))
}

thread_local! {
    static MAIN_QUEUE: RefCell<VecDeque<Job>> = RefCell::new(VecDeque::new());
    static MAIN_RUNNING: Cell<bool> = const { Cell::new(false) };
    static IS_MAIN_THREAD: Cell<bool> = const { Cell::new(false) };
    static SYNC_DEPTH: Cell<u32> = const { Cell::new(0) };
}

/// Marks the calling thread as "the main thread" for the purposes of
/// [`ExecutionContext::Automatic`] and the dedicated `Main` run loop's
/// same-thread coalescing check. Call once from whatever thread an embedding
/// application considers its UI / main thread.
pub fn mark_main_thread() {
    IS_MAIN_THREAD.with(|f| f.set(true));
}

/// Returns whether a [`ExecutionContext::NowOr`] callback is currently
/// executing synchronously on the calling thread (or is nested inside one).
pub fn is_executing_now() -> bool {
    SYNC_DEPTH.with(|d| d.get() > 0)
}

struct SyncGuard;

impl SyncGuard {
    fn enter() -> Self {
        SYNC_DEPTH.with(|d| d.set(d.get() + 1));
        SyncGuard
    }
}

impl Drop for SyncGuard {
    fn drop(&mut self) {
        SYNC_DEPTH.with(|d| d.set(d.get() - 1));
    }
}

struct MainLoop {
    sender: Sender<Job>,
}

static MAIN_LOOP: OnceLock<MainLoop> = OnceLock::new();

fn main_loop() -> &'static MainLoop {
    MAIN_LOOP.get_or_init(|| {
        let (sender, receiver) = unbounded::<Job>();
        thread::Builder::new()
            .name("promise-main".into())
            .spawn(move || {
                IS_MAIN_THREAD.with(|f| f.set(true));
                for job in receiver.iter() {
                    run_on_main(job);
                }
            })
            .expect("spawn promise main loop thread");
        MainLoop { sender }
    })
}

/// Runs `job` as one run-loop pass: any further `Main` dispatches performed
/// by `job` (or by callbacks it transitively invokes inline) are coalesced
/// into the same pass instead of being deferred to a later one.
fn run_on_main(job: Job) {
    MAIN_RUNNING.with(|r| r.set(true));
    job();
    loop {
        let next = MAIN_QUEUE.with(|q| q.borrow_mut().pop_front());
        match next {
            Some(job) => job(),
            None => break,
        }
    }
    MAIN_RUNNING.with(|r| r.set(false));
}

fn dispatch_main(job: Job) {
    let already_in_pass = IS_MAIN_THREAD.with(|f| f.get()) && MAIN_RUNNING.with(|r| r.get());
    if already_in_pass {
        MAIN_QUEUE.with(|q| q.borrow_mut().push_back(job));
    } else {
        let _ = main_loop().sender.send(job);
    }
}

enum QueueKind {
    Serial,
    Parallel,
}

struct QueueInner {
    label: String,
    kind: QueueKind,
    sender: Sender<Job>,
}

/// An explicit, user-provided dispatch queue (serial or parallel).
#[derive(Clone)]
pub struct Queue {
    inner: Arc<QueueInner>,
}

impl Queue {
    /// A serial queue: jobs run one at a time, in submission order, on a
    /// single dedicated worker thread.
    pub fn serial(label: impl Into<String>) -> Self {
        let label = label.into();
        let (sender, receiver) = unbounded::<Job>();
        let thread_name = label.clone();
        thread::Builder::new()
            .name(thread_name)
            .spawn(move || {
                for job in receiver.iter() {
                    job();
                }
            })
            .expect("spawn serial queue worker thread");
        Queue {
            inner: Arc::new(QueueInner {
                label,
                kind: QueueKind::Serial,
                sender,
            }),
        }
    }

    /// A parallel queue: jobs may run concurrently across `workers` threads.
    pub fn parallel(label: impl Into<String>, workers: usize) -> Self {
        let label = label.into();
        let (sender, receiver) = unbounded::<Job>();
        for i in 0..workers.max(1) {
            let receiver = receiver.clone();
            thread::Builder::new()
                .name(format!("{label}-{i}"))
                .spawn(move || {
                    for job in receiver.iter() {
                        job();
                    }
                })
                .expect("spawn parallel queue worker thread");
        }
        Queue {
            inner: Arc::new(QueueInner {
                label,
                kind: QueueKind::Parallel,
                sender,
            }),
        }
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn is_serial(&self) -> bool {
        matches!(self.inner.kind, QueueKind::Serial)
    }

    pub(crate) fn submit(&self, job: Job) {
        let _ = self.inner.sender.send(job);
    }
}

impl fmt::Debug for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("label", &self.inner.label)
            .field("serial", &self.is_serial())
            .finish()
    }
}

impl PartialEq for Queue {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// A dispatch queue that wraps each submitted thunk as a schedulable
/// "operation", mirroring `NSOperationQueue`. The concurrency-limiting
/// behavior of a real operation queue is out of scope (see SPEC_FULL.md §1);
/// this wraps a parallel [`Queue`] and tracks in-flight operations for
/// introspection only.
#[derive(Clone)]
pub struct OperationQueue {
    queue: Queue,
    in_flight: Arc<AtomicUsize>,
}

impl OperationQueue {
    pub fn new(label: impl Into<String>, workers: usize) -> Self {
        OperationQueue {
            queue: Queue::parallel(label, workers),
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn operation_count(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    pub(crate) fn submit(&self, job: Job) {
        let in_flight = self.in_flight.clone();
        in_flight.fetch_add(1, Ordering::Relaxed);
        self.queue.submit(Box::new(move || {
            job();
            in_flight.fetch_sub(1, Ordering::Relaxed);
        }));
    }
}

impl fmt::Debug for OperationQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationQueue")
            .field("queue", &self.queue)
            .field("operation_count", &self.operation_count())
            .finish()
    }
}

impl PartialEq for OperationQueue {
    fn eq(&self, other: &Self) -> bool {
        self.queue == other.queue
    }
}

/// The context in which a promise body or callback is evaluated.
#[derive(Clone)]
pub enum ExecutionContext {
    /// Execute synchronously on the calling thread. Rarely what you want.
    Immediate,
    /// Execute on the crate's dedicated main run loop. Chained `Main`
    /// callbacks with no intervening nested-promise wait all execute within
    /// the same run-loop pass.
    Main,
    /// Execute on a global pool tagged with a QoS class.
    Qos(Qos),
    /// Execute on an explicit, user-provided queue.
    Queue(Queue),
    /// Execute as an operation on an explicit operation queue.
    OperationQueue(OperationQueue),
    /// Behave as `Immediate` iff the promise is already resolved at
    /// attachment time, otherwise behave as `inner`.
    NowOr(Box<ExecutionContext>),
    /// Resolves to `Main` when invoked from the main thread, else
    /// `Qos(Default)`.
    Automatic,
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionContext::Immediate => f.write_str("Immediate"),
            ExecutionContext::Main => f.write_str("Main"),
            ExecutionContext::Qos(q) => write!(f, "Qos({q:?})"),
            ExecutionContext::Queue(q) => write!(f, "Queue({})", q.label()),
            ExecutionContext::OperationQueue(q) => write!(f, "OperationQueue({})", q.queue.label()),
            ExecutionContext::NowOr(inner) => write!(f, "NowOr({inner:?})"),
            ExecutionContext::Automatic => f.write_str("Automatic"),
        }
    }
}

impl ExecutionContext {
    pub fn immediate() -> Self {
        ExecutionContext::Immediate
    }
    pub fn main() -> Self {
        ExecutionContext::Main
    }
    pub fn background() -> Self {
        ExecutionContext::Qos(Qos::Background)
    }
    pub fn utility() -> Self {
        ExecutionContext::Qos(Qos::Utility)
    }
    pub fn default_qos() -> Self {
        ExecutionContext::Qos(Qos::Default)
    }
    pub fn user_initiated() -> Self {
        ExecutionContext::Qos(Qos::UserInitiated)
    }
    pub fn user_interactive() -> Self {
        ExecutionContext::Qos(Qos::UserInteractive)
    }
    pub fn queue(queue: Queue) -> Self {
        ExecutionContext::Queue(queue)
    }
    pub fn operation_queue(queue: OperationQueue) -> Self {
        ExecutionContext::OperationQueue(queue)
    }
    pub fn now_or_context(inner: ExecutionContext) -> Self {
        ExecutionContext::NowOr(Box::new(inner))
    }
    pub fn automatic() -> Self {
        ExecutionContext::Automatic
    }
    pub fn context_for_qos(qos: Qos) -> Self {
        ExecutionContext::Qos(qos)
    }

    fn resolve_automatic(&self) -> ExecutionContext {
        match self {
            ExecutionContext::Automatic => {
                if IS_MAIN_THREAD.with(|f| f.get()) {
                    ExecutionContext::Main
                } else {
                    ExecutionContext::Qos(Qos::Default)
                }
            }
            other => other.clone(),
        }
    }

    /// Runs `job` per this context's policy. Used for cancel-request
    /// handlers and for scheduling a plain (non-delayed) promise's body, for
    /// which a `NowOr` context behaves like `Immediate`.
    pub(crate) fn execute(&self, job: Job) {
        match self {
            ExecutionContext::Immediate => job(),
            ExecutionContext::Main => dispatch_main(job),
            ExecutionContext::Qos(qos) => pools().pool(*qos).submit(job),
            ExecutionContext::Queue(queue) => queue.submit(job),
            ExecutionContext::OperationQueue(oq) => oq.submit(job),
            ExecutionContext::NowOr(_) => job(),
            ExecutionContext::Automatic => self.resolve_automatic().execute(job),
        }
    }

    /// Runs `job` per this context's policy, for a `Delayed` promise's body:
    /// a `NowOr` context behaves like its wrapped `inner` context, since
    /// there is nothing to be "already resolved" relative to yet.
    pub(crate) fn execute_delayed(&self, job: Job) {
        match self {
            ExecutionContext::NowOr(inner) => inner.execute_delayed(job),
            ExecutionContext::Automatic => self.resolve_automatic().execute_delayed(job),
            other => other.execute(job),
        }
    }

    /// Runs `job` per this context's policy for an observer being attached
    /// to a promise that either is (`already_resolved = true`) or is not yet
    /// (`false`) resolved at the moment of attachment. Only `NowOr` cares
    /// about the flag.
    pub(crate) fn execute_attach(&self, already_resolved: bool, job: Job) {
        match self {
            ExecutionContext::NowOr(inner) => {
                if already_resolved {
                    let _guard = SyncGuard::enter();
                    job();
                } else {
                    inner.execute_attach(false, job);
                }
            }
            ExecutionContext::Automatic => self
                .resolve_automatic()
                .execute_attach(already_resolved, job),
            other => other.execute(job),
        }
    }

    /// Returns the explicit queue / operation queue this context ultimately
    /// dispatches to, if any, looking through `NowOr`/`Automatic`. Used so
    /// cancellation handlers can coalesce onto the same destination as the
    /// callback they are guarding.
    pub fn destination_queue(&self) -> (Option<Queue>, Option<OperationQueue>) {
        match self {
            ExecutionContext::Queue(q) => (Some(q.clone()), None),
            ExecutionContext::OperationQueue(oq) => (None, Some(oq.clone())),
            ExecutionContext::NowOr(inner) => inner.destination_queue(),
            ExecutionContext::Automatic => self.resolve_automatic().destination_queue(),
            _ => (None, None),
        }
    }
}
