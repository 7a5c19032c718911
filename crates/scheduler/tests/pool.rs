use std::collections::HashSet;
use std::sync::mpsc;
use std::sync::{Arc, Barrier};
use std::task::{Poll, Waker};
use std::time::Duration;

use roiflow_scheduler::{Scheduler, SchedulerConfig, Task};

#[test]
fn concurrent_tasks_spread_over_idle_workers() {
    const N: usize = 4;
    let scheduler = Scheduler::with_workers(N).unwrap();
    // Let every worker park first.
    std::thread::sleep(Duration::from_millis(20));

    // Each task blocks until all N are running at once, which is only
    // possible if they landed on N distinct workers.
    let barrier = Arc::new(Barrier::new(N));
    let (tx, rx) = mpsc::channel();
    for i in 0..N {
        let barrier = Arc::clone(&barrier);
        let tx = tx.clone();
        let sched = scheduler.clone();
        scheduler
            .wake(&Task::one_shot(format!("fair-{i}"), move || {
                let worker = sched.current_worker();
                barrier.wait();
                tx.send(worker).unwrap();
            }))
            .unwrap();
    }

    let workers: HashSet<Option<usize>> = (0..N)
        .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
        .collect();
    scheduler.stop();

    assert_eq!(workers.len(), N);
    assert!(workers.iter().all(Option::is_some));
}

#[test]
fn worker_threads_use_configured_names() {
    let config = SchedulerConfig {
        worker_threads: 2,
        thread_name_prefix: "tile-pool".into(),
    };
    let scheduler = Scheduler::start(&config).unwrap();
    let (tx, rx) = mpsc::channel();
    scheduler
        .wake(&Task::one_shot("name", move || {
            let name = std::thread::current().name().map(str::to_string);
            tx.send(name).unwrap();
        }))
        .unwrap();
    let name = rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
    scheduler.stop();

    assert!(name.starts_with("tile-pool-"), "got {name}");
    assert_eq!(scheduler.metrics().workers, 2);
}

#[test]
fn stop_from_inside_a_task_does_not_deadlock() {
    let scheduler = Scheduler::with_workers(2).unwrap();
    let (tx, rx) = mpsc::channel();
    let sched = scheduler.clone();
    scheduler
        .wake(&Task::one_shot("stopper", move || {
            sched.stop();
            tx.send(()).unwrap();
        }))
        .unwrap();
    rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(scheduler.is_stopping());
}

#[test]
fn future_task_keeps_one_waker_across_polls() {
    let scheduler = Scheduler::with_workers(1).unwrap();
    let (tx, rx) = mpsc::channel();
    let mut first: Option<Waker> = None;
    let future = futures::future::poll_fn(move |cx| {
        if let Some(previous) = &first {
            let _ = tx.send(previous.will_wake(cx.waker()));
            return Poll::Ready(());
        }
        first = Some(cx.waker().clone());
        cx.waker().wake_by_ref();
        Poll::Pending
    });
    let task = scheduler.spawn(Task::from_future("repoll", future)).unwrap();
    assert_eq!(rx.recv_timeout(Duration::from_secs(5)), Ok(true));
    for _ in 0..100 {
        if task.is_done() {
            break;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    assert!(task.is_done());
    scheduler.stop();
}
