// Cooperative task runtime.
//
// A pool of OS worker threads, each owning a pair of lock-free queues: one
// for tasks waiting to start, one for tasks that yielded and are waiting to
// be resumed. Tasks run as stackful fibers; `yield_now` switches back to the
// worker's main context, which then picks any ready task. A yielded task is
// resumed on the worker that started it.
//
// The runtime is process-wide state behind `start_thread_pool` /
// `stop_thread_pool`, with the per-thread pieces (worker id, main context,
// current task) in thread-locals.

mod queue;
pub mod task;

pub use task::{SyncCounter, Task};

use std::cell::{Cell, RefCell};
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use context::stack::ProtectedFixedSizeStack;
use context::{Context, Transfer};
use log::{debug, error, warn};
use once_cell::sync::Lazy;
use parking_lot::{Condvar, Mutex, RwLock};

use self::queue::TaskQueues;
use self::task::TaskContext;

/// Worker id reported outside the pool.
pub const INVALID_THREAD_ID: u32 = u32::MAX;

/// Stack size of one fiber. Guarded by a protection page.
const FIBER_STACK_SIZE: usize = 512 * 1024;

/// How long an idle worker parks before rechecking its queues. The timeout
/// bounds the cost of a lost wakeup.
const IDLE_WAIT: Duration = Duration::from_millis(1);

struct WorkerSignal {
    lock: Mutex<()>,
    ready: Condvar,
}

struct Runtime {
    num_threads: usize,
    to_start: TaskQueues,
    running: TaskQueues,
    is_running: Vec<AtomicBool>,
    signals: Vec<WorkerSignal>,
}

impl Runtime {
    fn new(num_threads: usize) -> Self {
        Self {
            num_threads,
            to_start: TaskQueues::new(num_threads),
            running: TaskQueues::new(num_threads),
            is_running: (0..num_threads).map(|_| AtomicBool::new(true)).collect(),
            signals: (0..num_threads)
                .map(|_| WorkerSignal {
                    lock: Mutex::new(()),
                    ready: Condvar::new(),
                })
                .collect(),
        }
    }
}

struct RuntimeHandle {
    runtime: Arc<Runtime>,
    workers: Vec<JoinHandle<()>>,
}

static RUNTIME: Lazy<RwLock<Option<RuntimeHandle>>> = Lazy::new(|| RwLock::new(None));

thread_local! {
    static CURRENT_THREAD_ID: Cell<u32> = const { Cell::new(INVALID_THREAD_ID) };
    static MAIN_CONTEXT: RefCell<Option<Context>> = const { RefCell::new(None) };
    static CURRENT_TASK: Cell<*mut TaskContext> = const { Cell::new(ptr::null_mut()) };
}

/// Starts the process-wide thread pool with `num_threads` workers, numbered
/// `0..num_threads`. Panics if the pool is already running.
pub fn start_thread_pool(num_threads: usize) {
    let mut slot = RUNTIME.write();
    assert!(slot.is_none(), "task runtime is already running");

    let runtime = Arc::new(Runtime::new(num_threads));
    let workers = (0..num_threads)
        .map(|id| {
            let runtime = Arc::clone(&runtime);
            thread::Builder::new()
                .name(format!("burrow-worker-{id}"))
                .spawn(move || worker_loop(runtime, id as u32))
                .expect("failed to spawn worker thread")
        })
        .collect();

    *slot = Some(RuntimeHandle { runtime, workers });
    debug!("task runtime started with {num_threads} workers");
}

/// Stops the thread pool cooperatively: workers finish their current task,
/// queued unstarted tasks are dropped. Callers are expected to have reached
/// quiescence through their counters first.
pub fn stop_thread_pool() {
    let handle = RUNTIME
        .write()
        .take()
        .expect("task runtime is not running");

    for flag in &handle.runtime.is_running {
        flag.store(false, Ordering::Release);
    }
    for signal in &handle.runtime.signals {
        let _guard = signal.lock.lock();
        signal.ready.notify_all();
    }
    for worker in handle.workers {
        let _ = worker.join();
    }

    let dropped = handle.runtime.to_start.drain() + handle.runtime.running.drain();
    if dropped > 0 {
        warn!("task runtime stopped with {dropped} undone tasks");
    }
    debug!("task runtime stopped");
}

/// Submits `task` to worker `queue_id`. The counter, when given, is
/// incremented now and decremented when the task finishes.
pub fn execute_task_async(queue_id: u32, task: Task, counter: Option<&Arc<SyncCounter>>) {
    let guard = RUNTIME.read();
    let handle = guard.as_ref().expect("task runtime is not running");
    let runtime = &handle.runtime;
    assert!(
        (queue_id as usize) < runtime.num_threads,
        "queue {queue_id} does not exist"
    );

    if let Some(counter) = counter {
        counter.fetch_increment();
    }
    let context = Box::new(TaskContext::new(
        task,
        counter.map(Arc::clone),
        CURRENT_TASK.get(),
    ));
    runtime.to_start.push(queue_id, context);

    let signal = &runtime.signals[queue_id as usize];
    let _guard = signal.lock.lock();
    signal.ready.notify_one();
}

/// Submits `task` to worker `queue_id` and blocks on `counter` until it (and
/// everything else the counter tracks) completed.
pub fn execute_task_sync(queue_id: u32, task: Task, counter: &Arc<SyncCounter>) {
    execute_task_async(queue_id, task, Some(counter));
    counter.join();
}

/// Id of the current worker, or `INVALID_THREAD_ID` outside the pool.
pub fn current_thread_id() -> u32 {
    CURRENT_THREAD_ID.get()
}

/// Number of workers, 0 while the pool is not running.
pub fn num_threads() -> usize {
    RUNTIME
        .read()
        .as_ref()
        .map(|handle| handle.runtime.num_threads)
        .unwrap_or(0)
}

/// Suspends the current fiber and returns control to the worker's main
/// loop. May only be called from inside a task.
pub fn yield_now() {
    assert!(
        current_thread_id() != INVALID_THREAD_ID,
        "yield_now called outside the thread pool"
    );
    let main = MAIN_CONTEXT
        .with(|ctx| ctx.borrow_mut().take())
        .expect("yield_now called outside a fiber");
    // SAFETY: `main` is the worker's live main context, stored by the fiber
    // entry on this very thread.
    let transfer = unsafe { main.resume(0) };
    MAIN_CONTEXT.with(|ctx| *ctx.borrow_mut() = Some(transfer.context));
}

fn worker_loop(runtime: Arc<Runtime>, id: u32) {
    CURRENT_THREAD_ID.set(id);
    debug!("worker {id} up");

    while runtime.is_running[id as usize].load(Ordering::Acquire) {
        if let Some(context) = runtime.to_start.pop(id) {
            start_task(&runtime, id, context);
        } else if let Some(context) = runtime.running.pop(id) {
            resume_task(&runtime, id, context);
        } else {
            let signal = &runtime.signals[id as usize];
            let mut guard = signal.lock.lock();
            let _ = signal.ready.wait_for(&mut guard, IDLE_WAIT);
        }
    }

    debug!("worker {id} down");
}

/// Entry point of every fiber. Stashes the worker's main context, runs the
/// task, marks it finished and switches back for good.
extern "C" fn fiber_entry(transfer: Transfer) -> ! {
    let task_ptr = transfer.data as *mut TaskContext;
    MAIN_CONTEXT.with(|ctx| *ctx.borrow_mut() = Some(transfer.context));

    // SAFETY: the worker driving this fiber owns the boxed TaskContext and
    // keeps it alive until the fiber reports back.
    let task_context = unsafe { &mut *task_ptr };
    if let Some(task) = task_context.task.take() {
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || (task.f)()));
        if result.is_err() {
            error!("task panicked on worker {}", current_thread_id());
        }
    }
    task_context.finished = true;

    let main = MAIN_CONTEXT
        .with(|ctx| ctx.borrow_mut().take())
        .expect("worker main context missing");
    // SAFETY: switching back to the worker's main context; this fiber is
    // never resumed again.
    unsafe { main.resume(0) };
    unreachable!("finished fiber resumed");
}

fn start_task(runtime: &Runtime, worker: u32, mut context: Box<TaskContext>) {
    let stack =
        ProtectedFixedSizeStack::new(FIBER_STACK_SIZE).expect("failed to allocate a fiber stack");
    context.stack = Some(stack);
    // SAFETY: the stack lives in the TaskContext and outlives the fiber.
    let fiber = unsafe { Context::new(context.stack.as_ref().unwrap(), fiber_entry) };

    CURRENT_TASK.set(&mut *context);
    // SAFETY: the fiber reads the TaskContext pointer exactly once, before
    // the first switch back.
    let transfer = unsafe { fiber.resume(&mut *context as *mut TaskContext as usize) };
    CURRENT_TASK.set(ptr::null_mut());

    if !context.finished {
        context.context = Some(transfer.context);
    }
    finalize_task(runtime, worker, context);
}

fn resume_task(runtime: &Runtime, worker: u32, mut context: Box<TaskContext>) {
    let fiber = context.context.take().expect("yielded task without a continuation");

    CURRENT_TASK.set(&mut *context);
    // SAFETY: `fiber` is the continuation saved at the task's last yield on
    // this same worker.
    let transfer = unsafe { fiber.resume(0) };
    CURRENT_TASK.set(ptr::null_mut());

    if !context.finished {
        context.context = Some(transfer.context);
    }
    finalize_task(runtime, worker, context);
}

/// A finished task decrements its counter and is freed; a yielded one goes
/// back on its worker's running queue.
fn finalize_task(runtime: &Runtime, worker: u32, context: Box<TaskContext>) {
    if context.finished {
        if let Some(counter) = &context.counter {
            counter.fetch_decrement();
        }
    } else {
        runtime.running.push(worker, context);
    }
}
