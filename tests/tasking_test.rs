use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use burrow_db::tasking::{self, SyncCounter, Task};
use parking_lot::Mutex;

/// The task runtime is process-wide; tests take this lock so parallel test
/// threads do not fight over it.
static RUNTIME_TESTS: Mutex<()> = Mutex::new(());

// One async task per worker, each recording the id of the thread it ran
// on. Submissions name their worker, so task i must land on worker i.
#[test]
fn tasks_run_on_their_named_worker() {
    let _guard = RUNTIME_TESTS.lock();
    let num_threads = 4;
    tasking::start_thread_pool(num_threads);

    let results: Arc<Vec<AtomicU32>> =
        Arc::new((0..num_threads).map(|_| AtomicU32::new(u32::MAX)).collect());
    let counter = Arc::new(SyncCounter::new());

    for i in 0..num_threads {
        let results = Arc::clone(&results);
        tasking::execute_task_async(
            i as u32,
            Task::new(move || {
                results[i].store(tasking::current_thread_id(), Ordering::Release);
            }),
            Some(&counter),
        );
    }
    counter.join();
    tasking::stop_thread_pool();

    for (i, result) in results.iter().enumerate() {
        assert_eq!(result.load(Ordering::Acquire), i as u32);
    }
}

// Recursive fork/join merge sort: every task spawns two children onto its
// own worker and joins them through a counter, which yields the fiber
// until the children finish.

struct SortRange {
    begin: usize,
    end: usize,
    /// Raw pointers let disjoint subtasks sort disjoint ranges of the same
    /// arrays in place; the arrays outlive the pool because the caller
    /// joins before returning.
    input: *mut i32,
    work: *mut i32,
}

unsafe impl Send for SortRange {}

fn merge(input: &mut [i32], work: &mut [i32], begin: usize, end: usize) {
    let split = begin + (end - begin) / 2;
    let (mut i, mut j) = (begin, split);
    for slot in work.iter_mut().take(end).skip(begin) {
        if i < split && (j >= end || input[i] <= input[j]) {
            *slot = input[i];
            i += 1;
        } else {
            *slot = input[j];
            j += 1;
        }
    }
    input[begin..end].copy_from_slice(&work[begin..end]);
}

fn merge_sort(range: SortRange) {
    if range.end - range.begin > 2 {
        let split = range.begin + (range.end - range.begin) / 2;
        let left = SortRange { begin: range.begin, end: split, ..range };
        let right = SortRange { begin: split, ..range };
        let counter = Arc::new(SyncCounter::new());
        let worker = tasking::current_thread_id();
        tasking::execute_task_async(worker, Task::new(move || merge_sort(left)), Some(&counter));
        tasking::execute_task_async(worker, Task::new(move || merge_sort(right)), Some(&counter));
        counter.join();
        // SAFETY: the children are done, so this task is the only one
        // touching `begin..end` now.
        let input = unsafe { std::slice::from_raw_parts_mut(range.input, range.end) };
        let work = unsafe { std::slice::from_raw_parts_mut(range.work, range.end) };
        merge(input, work, range.begin, range.end);
    } else {
        // SAFETY: leaf ranges of sibling tasks are disjoint.
        let input = unsafe { std::slice::from_raw_parts_mut(range.input, range.end) };
        let work = unsafe { std::slice::from_raw_parts_mut(range.work, range.end) };
        if input[range.begin] > input[range.end - 1] {
            input.swap(range.begin, range.end - 1);
        }
        work[range.begin] = input[range.begin];
        work[range.end - 1] = input[range.end - 1];
    }
}

#[test]
fn fibers_fork_join_merge_sort() {
    let _guard = RUNTIME_TESTS.lock();
    tasking::start_thread_pool(2);

    let len = 4096;
    let mut input: Vec<i32> = (0..len as i32).map(|i| (i * 373) % 10007).collect();
    let mut work = vec![0i32; len];

    let counter = Arc::new(SyncCounter::new());
    let left = SortRange {
        begin: 0,
        end: len / 2,
        input: input.as_mut_ptr(),
        work: work.as_mut_ptr(),
    };
    let right = SortRange {
        begin: len / 2,
        end: len,
        input: input.as_mut_ptr(),
        work: work.as_mut_ptr(),
    };
    tasking::execute_task_async(0, Task::new(move || merge_sort(left)), Some(&counter));
    tasking::execute_task_async(1, Task::new(move || merge_sort(right)), Some(&counter));
    counter.join();
    merge(&mut input, &mut work, 0, len);

    tasking::stop_thread_pool();

    for window in input.windows(2) {
        assert!(window[0] <= window[1]);
    }
}

// Two tasks on one worker interleave through yield_now: neither can run
// to completion while the other still holds the smaller count.
#[test]
fn yield_interleaves_tasks_on_one_worker() {
    let _guard = RUNTIME_TESTS.lock();
    tasking::start_thread_pool(1);

    let steps = Arc::new(AtomicUsize::new(0));
    let counter = Arc::new(SyncCounter::new());
    for parity in 0..2usize {
        let steps = Arc::clone(&steps);
        tasking::execute_task_async(
            0,
            Task::new(move || {
                for i in 0..50 {
                    // Wait until it is this task's turn again.
                    while steps.load(Ordering::Acquire) % 2 != parity {
                        tasking::yield_now();
                    }
                    assert_eq!(steps.fetch_add(1, Ordering::AcqRel), i * 2 + parity);
                }
            }),
            Some(&counter),
        );
    }
    counter.join();
    tasking::stop_thread_pool();
    assert_eq!(steps.load(Ordering::Acquire), 100);
}

#[test]
fn execute_task_sync_blocks_until_done() {
    let _guard = RUNTIME_TESTS.lock();
    tasking::start_thread_pool(2);

    let done = Arc::new(AtomicUsize::new(0));
    let counter = Arc::new(SyncCounter::new());
    {
        let done = Arc::clone(&done);
        tasking::execute_task_sync(
            1,
            Task::new(move || {
                std::thread::sleep(std::time::Duration::from_millis(5));
                done.fetch_add(1, Ordering::AcqRel);
            }),
            &counter,
        );
    }
    assert_eq!(done.load(Ordering::Acquire), 1);
    assert_eq!(counter.value(), 0);

    tasking::stop_thread_pool();
}

// Tasks submitted from inside a task (fiber) land on the named worker and
// the counters still line up.
#[test]
fn nested_submission_from_a_fiber() {
    let _guard = RUNTIME_TESTS.lock();
    tasking::start_thread_pool(2);

    let total = Arc::new(AtomicUsize::new(0));
    let outer_counter = Arc::new(SyncCounter::new());
    {
        let total = Arc::clone(&total);
        tasking::execute_task_async(
            0,
            Task::new(move || {
                let inner_counter = Arc::new(SyncCounter::new());
                for worker in 0..2 {
                    let total = Arc::clone(&total);
                    tasking::execute_task_async(
                        worker,
                        Task::new(move || {
                            total.fetch_add(1, Ordering::AcqRel);
                        }),
                        Some(&inner_counter),
                    );
                }
                inner_counter.join();
                total.fetch_add(10, Ordering::AcqRel);
            }),
            Some(&outer_counter),
        );
    }
    outer_counter.join();
    tasking::stop_thread_pool();
    assert_eq!(total.load(Ordering::Acquire), 12);
}
