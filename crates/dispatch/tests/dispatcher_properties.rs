//! Behavioural properties of the dispatcher and the serializing lock,
//! exercised through the public API only.

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Barrier};
use std::thread;
use std::time::Duration;

use docpump_dispatch::{
    CancellationToken, DispatchError, Dispatcher, DispatcherState, JobError, JobOptions, Priority,
    SerializingLock,
};

const TIMEOUT: Duration = Duration::from_secs(10);

fn started(threads: usize) -> Dispatcher {
    let dispatcher = Dispatcher::new(threads);
    dispatcher.start().expect("dispatcher starts");
    dispatcher
}

#[test]
fn single_thread_runs_jobs_in_submission_order() {
    let dispatcher = started(1);
    let counter = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..500)
        .map(|index| {
            let counter = counter.clone();
            dispatcher.queue_with_result(move || counter.fetch_add(1, Ordering::SeqCst) == index)
        })
        .collect();

    for handle in handles {
        assert!(handle.wait().unwrap());
    }
    assert!(dispatcher.stop(TIMEOUT).unwrap());
}

#[test]
fn multiple_threads_run_jobs_concurrently() {
    let dispatcher = started(2);
    let counter = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..1000)
        .map(|index| {
            let counter = counter.clone();
            dispatcher.queue_with_result(move || {
                let seen = counter.load(Ordering::SeqCst);
                thread::sleep(Duration::from_micros(50));
                counter.store(seen + 1, Ordering::SeqCst);
                seen == index
            })
        })
        .collect();

    let in_order = handles
        .into_iter()
        .map(|handle| handle.wait().unwrap())
        .filter(|in_order| *in_order)
        .count();

    assert!(in_order < 1000, "two workers never overlapped");
    assert!(dispatcher.stop(TIMEOUT).unwrap());
}

#[test]
fn pre_cancelled_job_never_runs() {
    let dispatcher = started(1);
    let invoked = Arc::new(AtomicBool::new(false));

    let handle = {
        let invoked = invoked.clone();
        dispatcher.queue_for_completion_with(
            JobOptions::new().with_token(CancellationToken::cancelled()),
            move || invoked.store(true, Ordering::SeqCst),
        )
    };

    assert!(matches!(handle.wait(), Err(JobError::Canceled)));
    dispatcher.sync_exec(|| ()).unwrap();
    assert!(!invoked.load(Ordering::SeqCst));
    assert!(dispatcher.stop(TIMEOUT).unwrap());
}

#[test]
fn panicking_job_fails_and_pump_survives() {
    #[derive(Debug, PartialEq)]
    struct RenderFault {
        page: u32,
    }

    let dispatcher = started(1);

    let failed = dispatcher.queue_with_result(|| -> u32 {
        std::panic::panic_any(RenderFault { page: 9 })
    });
    let err = failed.wait().unwrap_err();
    let JobError::Panicked(panic) = err else {
        panic!("expected a panic outcome, got {err:?}");
    };
    let payload = panic.into_payload();
    assert_eq!(payload.downcast_ref::<RenderFault>(), Some(&RenderFault { page: 9 }));

    let next = dispatcher.queue_with_result(|| "still pumping");
    assert_eq!(next.wait().unwrap(), "still pumping");
    assert!(dispatcher.stop(TIMEOUT).unwrap());
}

thread_local! {
    static WORKER_MARK: RefCell<Option<Arc<()>>> = const { RefCell::new(None) };
}

#[test]
fn stop_terminates_every_worker() {
    let dispatcher = started(5);
    assert_eq!(dispatcher.live_workers(), 5);
    assert_eq!(dispatcher.thread_count(), 5);

    // Park a mark in each worker's thread-local; it drops only when that thread exits
    let mark = Arc::new(());
    let barrier = Arc::new(Barrier::new(5));
    let handles: Vec<_> = (0..5)
        .map(|_| {
            let mark = mark.clone();
            let barrier = barrier.clone();
            dispatcher.queue_for_completion(move || {
                WORKER_MARK.with(|slot| *slot.borrow_mut() = Some(mark));
                barrier.wait();
            })
        })
        .collect();
    for handle in handles {
        handle.wait().unwrap();
    }
    assert_eq!(Arc::strong_count(&mark), 6);

    assert!(dispatcher.stop(TIMEOUT).unwrap());

    assert_eq!(dispatcher.state(), DispatcherState::Stopped);
    assert_eq!(Arc::strong_count(&mark), 1);
}

#[test]
fn stop_reports_unconfirmed_shutdown() {
    let dispatcher = started(1);
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let (started_tx, started_rx) = mpsc::channel::<()>();

    let busy = dispatcher.queue_for_completion(move || {
        started_tx.send(()).unwrap();
        release_rx.recv().unwrap();
    });
    started_rx.recv().unwrap();

    assert!(!dispatcher.stop(Duration::from_millis(20)).unwrap());
    assert_eq!(dispatcher.state(), DispatcherState::Stopped);

    release_tx.send(()).unwrap();
    busy.wait().unwrap();
}

#[test]
fn completion_resolves_once_under_cancellation_race() {
    let dispatcher = Arc::new(started(2));
    let runs = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..200)
        .map(|_| {
            let runs = runs.clone();
            dispatcher.queue_with_result(move || {
                runs.fetch_add(1, Ordering::SeqCst);
            })
        })
        .collect();

    let canceller = {
        let dispatcher = dispatcher.clone();
        thread::spawn(move || dispatcher.cancel_pending())
    };
    let canceled_in_queue = canceller.join().unwrap();

    let mut completed = 0;
    let mut canceled = 0;
    for handle in handles {
        match handle.wait() {
            Ok(()) => completed += 1,
            Err(JobError::Canceled) => canceled += 1,
            Err(other) => panic!("unexpected outcome {other:?}"),
        }
    }

    assert_eq!(completed + canceled, 200);
    assert_eq!(canceled, canceled_in_queue);
    assert_eq!(completed, runs.load(Ordering::SeqCst));
    assert!(dispatcher.stop(TIMEOUT).unwrap());
}

#[test]
fn serializing_lock_admits_one_caller_at_a_time() {
    let lock = Arc::new(SerializingLock::new(1));
    let inside = Arc::new(AtomicUsize::new(0));
    let exceeded = Arc::new(AtomicBool::new(false));

    let callers: Vec<_> = (0..2)
        .map(|_| {
            let lock = lock.clone();
            let inside = inside.clone();
            let exceeded = exceeded.clone();
            thread::spawn(move || {
                for _ in 0..200 {
                    lock.exec(|| {
                        if inside.fetch_add(1, Ordering::SeqCst) + 1 > 1 {
                            exceeded.store(true, Ordering::SeqCst);
                        }
                        thread::yield_now();
                        inside.fetch_sub(1, Ordering::SeqCst);
                    })
                    .unwrap();
                }
            })
        })
        .collect();

    for caller in callers {
        caller.join().unwrap();
    }
    assert!(!exceeded.load(Ordering::SeqCst));
}

#[test]
fn priorities_are_strict_once_queued() {
    let dispatcher = started(1);
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let (started_tx, started_rx) = mpsc::channel::<()>();
    let gate = dispatcher.queue_for_completion(move || {
        started_tx.send(()).unwrap();
        release_rx.recv().unwrap();
    });
    started_rx.recv().unwrap();

    let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let mut handles = Vec::new();
    for round in 0..3 {
        for priority in [Priority::Low, Priority::Normal, Priority::High] {
            let order = order.clone();
            handles.push(dispatcher.queue_for_completion_with(
                JobOptions::new().with_priority(priority),
                move || order.lock().push((priority, round)),
            ));
        }
    }

    release_tx.send(()).unwrap();
    gate.wait().unwrap();
    for handle in handles {
        handle.wait().unwrap();
    }

    let expected: Vec<_> = [Priority::High, Priority::Normal, Priority::Low]
        .into_iter()
        .flat_map(|priority| (0..3).map(move |round| (priority, round)))
        .collect();
    assert_eq!(*order.lock(), expected);
    assert!(dispatcher.stop(TIMEOUT).unwrap());
}

#[test]
fn lifecycle_misuse_fails_fast() {
    let dispatcher = Dispatcher::new(1);
    assert!(matches!(
        dispatcher.stop(TIMEOUT),
        Err(DispatchError::NotRunning)
    ));

    dispatcher.start().unwrap();
    assert!(matches!(
        dispatcher.start(),
        Err(DispatchError::AlreadyRunning)
    ));
    assert!(dispatcher.stop(TIMEOUT).unwrap());

    // Stopped dispatchers can be started again
    dispatcher.start().unwrap();
    assert_eq!(dispatcher.sync_exec(|| 2 + 2).unwrap(), 4);
    assert!(dispatcher.stop(TIMEOUT).unwrap());
}

#[test]
fn sync_exec_preserves_panic_identity() {
    let dispatcher = started(1);

    let caught = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        dispatcher.sync_exec::<(), _>(|| panic!("document is encrypted"))
    }));

    let payload = caught.unwrap_err();
    assert_eq!(
        payload.downcast_ref::<&str>(),
        Some(&"document is encrypted")
    );
    assert!(dispatcher.stop(TIMEOUT).unwrap());
}

#[test]
fn nested_sync_exec_on_single_worker_does_not_deadlock() {
    let dispatcher = Arc::new(started(1));
    let inner = dispatcher.clone();

    let outer = dispatcher.sync_exec(move || inner.sync_exec(|| 5).unwrap() * 2);

    assert_eq!(outer.unwrap(), 10);
    assert!(dispatcher.stop(TIMEOUT).unwrap());
}

#[test]
fn handles_can_be_awaited() {
    let dispatcher = started(2);

    let handles: Vec<_> = (0..4)
        .map(|page| dispatcher.queue_with_result(move || page * 100))
        .collect();
    let results = futures::executor::block_on(futures::future::join_all(handles));

    let values: Vec<_> = results.into_iter().map(Result::unwrap).collect();
    assert_eq!(values, vec![0, 100, 200, 300]);
    assert!(dispatcher.stop(TIMEOUT).unwrap());
}
