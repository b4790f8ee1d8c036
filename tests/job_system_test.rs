#![cfg(not(loom))]

use anyhow::Context;
use forkjoin::{Color, JobHandle, JobSystem, JobSystemConfig, JobSystemError};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    condition()
}

fn system(max_jobs: u32, max_barriers: u32, threads: usize) -> JobSystem {
    JobSystem::new(
        JobSystemConfig::new(max_jobs, max_barriers)
            .with_num_threads(Some(threads))
            .with_max_threads(threads.max(16)),
    )
    .unwrap()
}

#[test]
fn test_run_jobs() {
    const MAX_JOBS: u32 = 128;
    let system = system(MAX_JOBS, 10, 10);
    let value = Arc::new(AtomicU32::new(0));

    let barrier = system.create_barrier().unwrap();
    for _ in 0..MAX_JOBS {
        let value = value.clone();
        let job = system
            .create_job("JobTest", Color::RED, move || {
                value.fetch_add(1, Ordering::Relaxed);
            }, 0)
            .unwrap();
        barrier.add_job(&job);
    }
    system.wait_for_jobs(&barrier);
    system.destroy_barrier(barrier).unwrap();

    assert_eq!(value.load(Ordering::Relaxed), MAX_JOBS);
}

#[test]
fn test_run_chain() {
    const CHAIN: usize = 128;
    let system = system(CHAIN as u32, 10, 10);
    let order = Arc::new(Mutex::new(Vec::with_capacity(CHAIN)));

    // Job i releases job i - 1, so they run from last to first.
    let mut handles: Vec<JobHandle> = Vec::with_capacity(CHAIN);
    for i in 0..CHAIN {
        let order = order.clone();
        let previous = handles.last().cloned();
        let dependencies = if i == CHAIN - 1 { 0 } else { 1 };
        let job = system
            .create_job("Chain", Color::BLUE, move || {
                order.lock().unwrap().push(i);
                if let Some(previous) = previous {
                    previous.remove_dependency();
                }
            }, dependencies)
            .unwrap();
        handles.push(job);
    }

    let barrier = system.create_barrier().unwrap();
    barrier.add_jobs(&handles);
    system.wait_for_jobs(&barrier);
    system.destroy_barrier(barrier).unwrap();

    let expected: Vec<usize> = (0..CHAIN).rev().collect();
    assert_eq!(*order.lock().unwrap(), expected);
    assert!(handles.iter().all(JobHandle::is_done));
}

#[test]
fn test_increment_then_double() {
    let system = system(16, 2, 4);
    for _ in 0..100 {
        let value = Arc::new(AtomicU32::new(1));
        let double = {
            let value = value.clone();
            system
                .create_job("B", Color::PURPLE, move || {
                    let current = value.load(Ordering::Acquire);
                    value.store(current * 2, Ordering::Release);
                }, 1)
                .unwrap()
        };
        let increment = {
            let value = value.clone();
            let double = double.clone();
            system
                .create_job("A", Color::ORANGE, move || {
                    value.fetch_add(1, Ordering::AcqRel);
                    double.remove_dependency();
                }, 0)
                .unwrap()
        };

        let barrier = system.create_barrier().unwrap();
        barrier.add_jobs(&[increment, double]);
        system.wait_for_jobs(&barrier);
        system.destroy_barrier(barrier).unwrap();
        assert_eq!(value.load(Ordering::Acquire), 4);
    }
}

#[test]
fn test_each_job_runs_exactly_once_for_any_thread_count() {
    const JOBS: usize = 500;
    for threads in [0, 1, 2, 3, 8] {
        let system = system(JOBS as u32, 1, threads);
        let runs: Arc<Vec<AtomicU32>> = Arc::new((0..JOBS).map(|_| AtomicU32::new(0)).collect());

        let barrier = system.create_barrier().unwrap();
        let handles: Vec<_> = (0..JOBS)
            .map(|i| {
                let runs = runs.clone();
                system
                    .create_job("count", Color::GREY, move || {
                        runs[i].fetch_add(1, Ordering::Relaxed);
                    }, 0)
                    .unwrap()
            })
            .collect();
        barrier.add_jobs(&handles);
        system.wait_for_jobs(&barrier);
        system.destroy_barrier(barrier).unwrap();

        for (i, count) in runs.iter().enumerate() {
            assert_eq!(count.load(Ordering::Relaxed), 1, "job {i} with {threads} threads");
        }
        assert_eq!(system.max_concurrency(), threads + 1);
    }
}

#[test]
fn test_pool_exhaustion_and_slot_reuse() {
    let system = system(4, 1, 0);
    let ran = Arc::new(AtomicBool::new(false));

    let mut handles: Vec<_> = (0..4)
        .map(|_| {
            let ran = ran.clone();
            system
                .create_job("held", Color::RED, move || ran.store(true, Ordering::SeqCst), 0)
                .unwrap()
        })
        .collect();
    assert_eq!(system.available_jobs(), 0);

    let err = system.create_job("extra", Color::RED, || {}, 0).unwrap_err();
    assert!(matches!(err, JobSystemError::JobPoolExhausted { capacity: 4 }));

    // Without workers nothing ran, so dropping the handle frees the slot.
    let freed = handles.pop().unwrap().index();
    assert_eq!(system.available_jobs(), 1);
    let reused = system.create_job("reused", Color::GREEN, || {}, 0).unwrap();
    assert_eq!(reused.index(), freed);
    assert!(!ran.load(Ordering::SeqCst));
}

#[test]
fn test_unrun_job_releases_captures_when_dropped() {
    let system = system(2, 1, 0);
    let captured = Arc::new(());
    let job = {
        let captured = captured.clone();
        system.create_job("never", Color::GREY, move || drop(captured), 0).unwrap()
    };
    assert_eq!(Arc::strong_count(&captured), 2);
    drop(job);
    assert_eq!(Arc::strong_count(&captured), 1);
}

#[test]
fn test_destroy_non_empty_barrier_is_rejected() {
    let system = system(8, 1, 0);
    let value = Arc::new(AtomicU32::new(0));
    let job = {
        let value = value.clone();
        system
            .create_job("pending", Color::YELLOW, move || {
                value.fetch_add(1, Ordering::SeqCst);
            }, 1)
            .unwrap()
    };

    let barrier = system.create_barrier().unwrap();
    barrier.add_job(&job);
    assert_eq!(barrier.len(), 1);

    let barrier = system.destroy_barrier(barrier).unwrap_err().into_inner();
    job.remove_dependency();
    system.wait_for_jobs(&barrier);
    assert!(barrier.is_empty());
    system.destroy_barrier(barrier).unwrap();
    assert_eq!(value.load(Ordering::SeqCst), 1);
}

#[test]
fn test_barrier_pool_exhaustion() {
    let system = system(8, 2, 1);
    let first = system.create_barrier().unwrap();
    let second = system.create_barrier().unwrap();
    assert_ne!(first.index(), second.index());

    assert!(matches!(
        system.create_barrier(),
        Err(JobSystemError::BarrierPoolExhausted { capacity: 2 })
    ));

    system.destroy_barrier(first).unwrap();
    let third = system.create_barrier().unwrap();
    system.destroy_barrier(second).unwrap();
    system.destroy_barrier(third).unwrap();
}

#[test]
fn test_zero_threads_run_on_waiting_thread() {
    let system = system(64, 1, 0);
    assert_eq!(system.max_concurrency(), 1);
    let me = thread::current().id();
    let elsewhere = Arc::new(AtomicUsize::new(0));

    let barrier = system.create_barrier().unwrap();
    for _ in 0..32 {
        let elsewhere = elsewhere.clone();
        let job = system
            .create_job("local", Color::CYAN, move || {
                if thread::current().id() != me {
                    elsewhere.fetch_add(1, Ordering::SeqCst);
                }
            }, 0)
            .unwrap();
        barrier.add_job(&job);
    }
    system.wait_for_jobs(&barrier);
    system.destroy_barrier(barrier).unwrap();
    assert_eq!(elsewhere.load(Ordering::SeqCst), 0);
}

#[test]
fn test_workers_run_jobs_without_barrier() {
    let system = system(8, 1, 2);
    let job = system.create_job("free", Color::WHITE, || {}, 0).unwrap();
    assert!(eventually(|| job.is_done()));
    assert_eq!(job.name(), "free");
    assert_eq!(job.color(), Color::WHITE);
}

#[test]
fn test_add_dependency_delays_execution() {
    let system = system(8, 1, 2);
    let ran = Arc::new(AtomicBool::new(false));
    let job = {
        let ran = ran.clone();
        system
            .create_job("gated", Color::GREEN, move || ran.store(true, Ordering::SeqCst), 1)
            .unwrap()
    };
    job.add_dependency(2);
    job.remove_dependencies(2);
    thread::sleep(Duration::from_millis(20));
    assert!(!ran.load(Ordering::SeqCst));
    assert!(!job.can_be_executed());

    job.remove_dependency();
    assert!(eventually(|| ran.load(Ordering::SeqCst)));
}

#[test]
fn test_remove_dependency_batch() {
    let system = system(16, 1, 3);
    let count = Arc::new(AtomicU32::new(0));
    let handles: Vec<_> = (0..6)
        .map(|_| {
            let count = count.clone();
            system
                .create_job("batched", Color::BLUE, move || {
                    count.fetch_add(1, Ordering::SeqCst);
                }, 2)
                .unwrap()
        })
        .collect();

    let barrier = system.create_barrier().unwrap();
    barrier.add_jobs(&handles);
    JobHandle::remove_dependency_batch(&handles, 1);
    assert_eq!(count.load(Ordering::SeqCst), 0);
    JobHandle::remove_dependency_batch(&handles, 1);
    system.wait_for_jobs(&barrier);
    system.destroy_barrier(barrier).unwrap();
    assert_eq!(count.load(Ordering::SeqCst), 6);
}

#[test]
fn test_set_num_threads() {
    let mut system = JobSystem::new(
        JobSystemConfig::new(64, 1)
            .with_num_threads(Some(2))
            .with_max_threads(4),
    )
    .unwrap();
    assert_eq!(system.num_threads(), 2);

    for threads in [0, 4, 1] {
        system.set_num_threads(Some(threads)).unwrap();
        assert_eq!(system.max_concurrency(), threads + 1);

        let value = Arc::new(AtomicU32::new(0));
        let barrier = system.create_barrier().unwrap();
        for _ in 0..40 {
            let value = value.clone();
            let job = system
                .create_job("resized", Color::GREY, move || {
                    value.fetch_add(1, Ordering::SeqCst);
                }, 0)
                .unwrap();
            barrier.add_job(&job);
        }
        system.wait_for_jobs(&barrier);
        system.destroy_barrier(barrier).unwrap();
        assert_eq!(value.load(Ordering::SeqCst), 40);
    }

    let err = system.set_num_threads(Some(5)).unwrap_err();
    assert!(matches!(err, JobSystemError::TooManyThreads { requested: 5, max: 4 }));
    assert_eq!(system.num_threads(), 1);
}

#[test]
fn test_queued_jobs_run_when_threads_stop() {
    let mut system = system(64, 1, 1);
    let value = Arc::new(AtomicU32::new(0));
    let handles: Vec<_> = (0..20)
        .map(|_| {
            let value = value.clone();
            system
                .create_job("leftover", Color::GREY, move || {
                    value.fetch_add(1, Ordering::SeqCst);
                }, 0)
                .unwrap()
        })
        .collect();
    system.set_num_threads(Some(0)).unwrap();
    assert_eq!(value.load(Ordering::SeqCst), 20);
    assert!(handles.iter().all(JobHandle::is_done));
}

#[test]
fn test_panicking_job_still_completes_barrier() {
    let system = system(8, 1, 2);
    let after = Arc::new(AtomicBool::new(false));

    let failing = system.create_job("boom", Color::RED, || panic!("job failure"), 0).unwrap();
    let dependent = {
        let after = after.clone();
        system
            .create_job("after", Color::GREEN, move || after.store(true, Ordering::SeqCst), 0)
            .unwrap()
    };

    let barrier = system.create_barrier().unwrap();
    barrier.add_jobs(&[failing.clone(), dependent]);
    system.wait_for_jobs(&barrier);
    system.destroy_barrier(barrier).unwrap();

    assert!(failing.is_done());
    assert!(after.load(Ordering::SeqCst));
    assert_eq!(system.panicked_jobs(), 1);
}

#[test]
fn test_slots_return_to_pool() {
    const MAX_JOBS: u32 = 32;
    let system = system(MAX_JOBS, 1, 2);
    for _ in 0..10 {
        let barrier = system.create_barrier().unwrap();
        for _ in 0..MAX_JOBS {
            let job = system.create_job("recycled", Color::GREY, || {}, 0).unwrap();
            barrier.add_job(&job);
        }
        system.wait_for_jobs(&barrier);
        system.destroy_barrier(barrier).unwrap();
        // Workers drop their queue reference right after notifying the barrier.
        assert!(eventually(|| system.available_jobs() == MAX_JOBS as usize));
    }
}

#[test]
fn test_fan_out_from_worker_through_tiny_queue() {
    const CHILDREN: usize = 200;
    let system = JobSystem::new(
        JobSystemConfig::new(CHILDREN as u32 + 1, 1)
            .with_num_threads(Some(1))
            .with_queue_length(2),
    )
    .unwrap();
    let count = Arc::new(AtomicUsize::new(0));

    let children: Vec<_> = (0..CHILDREN)
        .map(|_| {
            let count = count.clone();
            system
                .create_job("child", Color::GREEN, move || {
                    count.fetch_add(1, Ordering::SeqCst);
                }, 1)
                .unwrap()
        })
        .collect();

    let barrier = system.create_barrier().unwrap();
    barrier.add_jobs(&children);

    let root = {
        let children = children.clone();
        system
            .create_job("root", Color::RED, move || {
                for child in &children {
                    child.remove_dependency();
                }
            }, 0)
            .unwrap()
    };
    barrier.add_job(&root);
    system.wait_for_jobs(&barrier);
    system.destroy_barrier(barrier).unwrap();

    assert_eq!(count.load(Ordering::SeqCst), CHILDREN);
}

#[test]
fn test_concurrent_submitters_through_small_queue() {
    const SUBMITTERS: usize = 4;
    const ROUNDS: usize = 200;
    const JOBS_PER_ROUND: usize = 20;
    let system = JobSystem::new(
        JobSystemConfig::new(256, SUBMITTERS as u32)
            .with_num_threads(Some(3))
            .with_max_threads(3)
            .with_queue_length(16),
    )
    .unwrap();
    let total = AtomicUsize::new(0);

    thread::scope(|scope| {
        for _ in 0..SUBMITTERS {
            scope.spawn(|| {
                for _ in 0..ROUNDS {
                    let ran = Arc::new(AtomicUsize::new(0));
                    let barrier = system.create_barrier().unwrap();
                    let handles: Vec<_> = (0..JOBS_PER_ROUND)
                        .map(|_| {
                            let ran = ran.clone();
                            system
                                .create_job("round", Color::CYAN, move || {
                                    ran.fetch_add(1, Ordering::Relaxed);
                                }, 0)
                                .unwrap()
                        })
                        .collect();
                    barrier.add_jobs(&handles);
                    system.wait_for_jobs(&barrier);
                    system.destroy_barrier(barrier).unwrap();
                    assert_eq!(ran.load(Ordering::Relaxed), JOBS_PER_ROUND);
                    total.fetch_add(JOBS_PER_ROUND, Ordering::Relaxed);
                }
            });
        }
    });

    assert_eq!(total.load(Ordering::Relaxed), SUBMITTERS * ROUNDS * JOBS_PER_ROUND);
}

#[test]
fn test_nested_fan_out_through_tiny_queue() {
    const FAN: usize = 20;
    let system = JobSystem::new(
        JobSystemConfig::new((1 + FAN + FAN * FAN) as u32, 1)
            .with_num_threads(Some(4))
            .with_max_threads(4)
            .with_queue_length(2),
    )
    .unwrap();
    let leaves_run = Arc::new(AtomicUsize::new(0));
    let barrier = system.create_barrier().unwrap();

    let mut mids = Vec::with_capacity(FAN);
    for _ in 0..FAN {
        let leaves: Vec<_> = (0..FAN)
            .map(|_| {
                let leaves_run = leaves_run.clone();
                system
                    .create_job("leaf", Color::GREEN, move || {
                        leaves_run.fetch_add(1, Ordering::SeqCst);
                    }, 1)
                    .unwrap()
            })
            .collect();
        barrier.add_jobs(&leaves);
        let mid = system
            .create_job("mid", Color::YELLOW, move || {
                for leaf in &leaves {
                    leaf.remove_dependency();
                }
            }, 1)
            .unwrap();
        mids.push(mid);
    }
    barrier.add_jobs(&mids);

    let root = {
        let mids = mids.clone();
        system
            .create_job("root", Color::RED, move || {
                for mid in &mids {
                    mid.remove_dependency();
                }
            }, 0)
            .unwrap()
    };
    barrier.add_job(&root);
    system.wait_for_jobs(&barrier);
    system.destroy_barrier(barrier).unwrap();

    assert_eq!(leaves_run.load(Ordering::SeqCst), FAN * FAN);
    assert!(mids.iter().all(JobHandle::is_done));
}

#[test]
#[should_panic(expected = "barrier is full")]
fn test_barrier_overflow_panics() {
    let system = JobSystem::new(
        JobSystemConfig::new(8, 1)
            .with_num_threads(Some(0))
            .with_barrier_capacity(4),
    )
    .unwrap();
    let pending: Vec<_> = (0..5)
        .map(|_| system.create_job("pending", Color::GREY, || {}, 1).unwrap())
        .collect();
    let barrier = system.create_barrier().unwrap();
    barrier.add_jobs(&pending);
}

#[test]
fn test_system_from_json_config() -> anyhow::Result<()> {
    let config = JobSystemConfig::from_json_str(
        r#"{ "max_jobs": 32, "max_barriers": 2, "num_threads": 2, "max_threads": 2, "queue_length": 16 }"#,
    )
    .context("parsing config")?;
    let system = JobSystem::new(config)?;
    assert_eq!(system.num_threads(), 2);
    assert_eq!(system.config().queue_length, 16);

    let barrier = system.create_barrier()?;
    let job = system.create_job("json", Color::GREEN, || {}, 0)?;
    barrier.add_job(&job);
    system.wait_for_jobs(&barrier);
    system
        .destroy_barrier(barrier)
        .map_err(|err| anyhow::anyhow!("{err}"))?;
    assert!(job.is_done());
    Ok(())
}

#[test]
fn test_invalid_config_rejected() {
    let err = JobSystem::new(JobSystemConfig::new(16, 1).with_queue_length(3)).unwrap_err();
    assert!(matches!(err, JobSystemError::InvalidConfig(_)));
}

#[test]
#[should_panic(expected = "different job system")]
fn test_barrier_from_other_system_rejected() {
    let first = system(4, 1, 0);
    let second = system(4, 1, 0);
    let barrier = first.create_barrier().unwrap();
    second.wait_for_jobs(&barrier);
}
