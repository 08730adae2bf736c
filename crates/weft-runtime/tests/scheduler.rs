//! End-to-end scheduler scenarios.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use weft_runtime::{
    Priority, Scheduler, SchedulerConfig, SchedulerError, TaskError, TaskToken, ValueStoreError,
};

fn scheduler() -> Scheduler {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    Scheduler::with_config(SchedulerConfig::new().with_workers(4))
}

#[test]
fn linear_chain_pipes_values() {
    let s = scheduler();

    let t0 = s.add_task(|_: &mut TaskToken| 7i64);
    let t0_id = t0.id();
    let t1 = s.add_task(move |t: &mut TaskToken| t.arg::<i64>(t0_id).unwrap().take() + 1);
    let t1_id = t1.id();
    let t2 = s.add_task(move |t: &mut TaskToken| t.arg::<i64>(t1_id).unwrap().take() * 2);

    t1.depends_on(&[t0]).unwrap();
    t2.depends_on(&[t1]).unwrap();

    s.run().unwrap();
    assert_eq!(s.get_result::<i64>(t2).unwrap(), 16);

    let metrics = s.metrics().snapshot();
    assert_eq!(metrics.tasks_executed, 3);
    assert_eq!(metrics.tasks_failed, 0);
    assert_eq!(metrics.values_published, 3);
}

#[test]
fn fan_in_reduce_by_type() {
    let s = scheduler();

    let t0 = s.add_task(|_: &mut TaskToken| (0..50).sum::<i64>());
    let t1 = s.add_task(|_: &mut TaskToken| (50..=100).sum::<i64>());
    let t2 = s.add_task(|t: &mut TaskToken| {
        let (a, b) = t.args::<(i64, i64)>();
        a.unwrap().take() + b.unwrap().take()
    });

    t2.depends_on(&[t0, t1]).unwrap();

    s.run().unwrap();
    assert_eq!(s.get_result::<i64>(t2).unwrap(), 5050);
}

#[test]
fn cycle_is_rejected_and_graph_still_runs() {
    let s = scheduler();

    let order = Arc::new(Mutex::new(Vec::new()));
    let mk = |tag: &'static str| {
        let order = order.clone();
        move |_: &mut TaskToken| order.lock().unwrap().push(tag)
    };
    let t0 = s.add_task(mk("t0"));
    let t1 = s.add_task(mk("t1"));
    let t2 = s.add_task(mk("t2"));

    t1.depends_on(&[t0]).unwrap();
    t2.depends_on(&[t1]).unwrap();
    // Closing the loop must fail and leave the original graph intact.
    assert_eq!(t0.depends_on(&[t2]), Err(SchedulerError::CycleFound));
    // Self-dependency is a cycle too.
    assert_eq!(t0.depends_on(&[t0]), Err(SchedulerError::CycleFound));

    s.run().unwrap();
    assert_eq!(*order.lock().unwrap(), vec!["t0", "t1", "t2"]);
}

#[test]
fn empty_graph_has_no_root() {
    let s = scheduler();
    assert_eq!(s.run(), Err(SchedulerError::NoRootTask));
}

#[test]
fn self_reschedule_runs_six_times() {
    let s = scheduler();
    let counter = Arc::new(AtomicU32::new(0));

    let counter2 = counter.clone();
    let _t = s.add_task(move |t: &mut TaskToken| {
        let n = counter2.fetch_add(1, Ordering::AcqRel) + 1;
        if n <= 5 {
            t.schedule();
        }
    });

    s.run().unwrap();
    assert_eq!(counter.load(Ordering::Acquire), 6);
}

#[test]
fn diamond_multi_consumer_borrows() {
    let s = scheduler();

    let src = s.add_task(|_: &mut TaskToken| vec![1i64, 2, 3]);
    let src_id = src.id();

    let left = s.add_task(move |t: &mut TaskToken| {
        let cell = t.arg::<Vec<i64>>(src_id).unwrap();
        // Two consumers: the producer's output is lent, not moved.
        assert!(cell.is_borrowed());
        cell.get().iter().sum::<i64>()
    });
    let right = s.add_task(move |t: &mut TaskToken| {
        let cell = t.arg::<Vec<i64>>(src_id).unwrap();
        assert!(cell.is_borrowed());
        cell.get().iter().product::<i64>()
    });
    let sink = s.add_task(move |t: &mut TaskToken| {
        let (a, b) = t.args::<(i64, i64)>();
        a.unwrap().take() + b.unwrap().take()
    });

    left.depends_on(&[src]).unwrap();
    right.depends_on(&[src]).unwrap();
    sink.depends_on(&[left, right]).unwrap();

    s.run().unwrap();
    assert_eq!(s.get_result::<i64>(sink).unwrap(), 6 + 6);
    // Nobody consumed the source value; it is still collectable.
    assert_eq!(s.get_result::<Vec<i64>>(src).unwrap(), vec![1, 2, 3]);
}

#[test]
fn single_consumer_moves_value() {
    let s = scheduler();

    let t0 = s.add_task(|_: &mut TaskToken| String::from("moved"));
    let t0_id = t0.id();
    let t1 = s.add_task(move |t: &mut TaskToken| {
        let cell = t.arg::<String>(t0_id).unwrap();
        assert!(cell.is_owned());
        cell.take().len() as i64
    });
    t1.depends_on(&[t0]).unwrap();

    s.run().unwrap();
    // The move emptied the producer's slot.
    assert_eq!(
        s.get_result::<String>(t0).unwrap_err(),
        ValueStoreError::NotFound
    );
    assert_eq!(s.get_result::<i64>(t1).unwrap(), 5);
}

#[test]
fn wrong_type_and_wrong_id_surface_task_errors() {
    let s = scheduler();

    let t0 = s.add_task(|_: &mut TaskToken| 1u32);
    let t0_id = t0.id();
    let seen = Arc::new(Mutex::new(None));
    let seen2 = seen.clone();
    let t1 = s.add_task(move |t: &mut TaskToken| {
        let type_err = t.arg::<String>(t0_id).unwrap_err();
        let id_err = t.arg::<u32>(weft_runtime::TaskId::from_raw(999)).unwrap_err();
        let (missing,) = t.args::<(f64,)>();
        *seen2.lock().unwrap() = Some((type_err, id_err, missing.unwrap_err()));
    });
    t1.depends_on(&[t0]).unwrap();

    s.run().unwrap();
    assert_eq!(
        seen.lock().unwrap().unwrap(),
        (
            TaskError::TypeMismatch,
            TaskError::InvalidTaskId,
            TaskError::ArityMismatch
        )
    );
}

#[test]
fn unhandled_panic_is_rethrown_from_run() {
    let s = scheduler();
    let _t = s.add_task(|_: &mut TaskToken| panic!("task exploded"));

    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| s.run()));
    let payload = outcome.unwrap_err();
    assert_eq!(*payload.downcast_ref::<&str>().unwrap(), "task exploded");

    // The failure was consumed; the scheduler is reusable.
    s.reset(true);
    let t = s.add_task(|_: &mut TaskToken| 5i64);
    s.run().unwrap();
    assert_eq!(s.get_result::<i64>(t).unwrap(), 5);
}

#[test]
fn handler_continue_keeps_graph_draining() {
    let s = scheduler();
    let downstream_saw = Arc::new(Mutex::new(None));

    let t0 = s.add_task_with_handler(
        |_: &mut TaskToken| -> i64 { panic!("producer failed") },
        |payload| {
            assert_eq!(
                *payload.downcast_ref::<&str>().unwrap(),
                "producer failed"
            );
            true
        },
        Priority::Normal,
    );
    let t0_id = t0.id();
    let saw = downstream_saw.clone();
    let t1 = s.add_task(move |t: &mut TaskToken| {
        // The edge completed, but the failed producer left no output.
        *saw.lock().unwrap() = Some(t.arg::<i64>(t0_id).unwrap_err());
    });
    t1.depends_on(&[t0]).unwrap();

    s.run().unwrap();
    assert_eq!(downstream_saw.lock().unwrap().unwrap(), TaskError::NotFound);
}

#[test]
fn handler_stop_suppresses_downstream() {
    let s = scheduler();
    let ran_downstream = Arc::new(AtomicU32::new(0));

    let t0 = s.add_task_with_handler(
        |_: &mut TaskToken| -> i64 { panic!("no recovery") },
        |_| false,
        Priority::Normal,
    );
    let ran = ran_downstream.clone();
    let t1 = s.add_task(move |_: &mut TaskToken| {
        ran.fetch_add(1, Ordering::AcqRel);
    });
    t1.depends_on(&[t0]).unwrap();

    s.run().unwrap();
    assert_eq!(ran_downstream.load(Ordering::Acquire), 0);
}

#[test]
fn stopped_task_releases_slot_and_blocks_successors() {
    let s = scheduler();
    let ran_downstream = Arc::new(AtomicU32::new(0));

    let t0 = s.add_task(|t: &mut TaskToken| {
        t.output(1i64);
        t.stop();
    });
    let ran = ran_downstream.clone();
    let t1 = s.add_task(move |_: &mut TaskToken| {
        ran.fetch_add(1, Ordering::AcqRel);
    });
    t1.depends_on(&[t0]).unwrap();

    s.run().unwrap();
    assert_eq!(ran_downstream.load(Ordering::Acquire), 0);
    // stop() also discarded the staged output.
    assert_eq!(
        s.get_result::<i64>(t0).unwrap_err(),
        ValueStoreError::NotFound
    );
}

#[test]
fn get_last_result_returns_final_task_output() {
    let s = scheduler();

    let t0 = s.add_task(|_: &mut TaskToken| 10i64);
    let t0_id = t0.id();
    let t1 = s.add_task(move |t: &mut TaskToken| t.arg::<i64>(t0_id).unwrap().take() * 3);
    t1.depends_on(&[t0]).unwrap();

    s.run().unwrap();
    assert_eq!(s.get_last_result::<i64>().unwrap(), 30);
}

#[test]
fn all_of_collects_every_input_of_type() {
    let s = scheduler();

    let a = s.add_task(|_: &mut TaskToken| 1i64);
    let b = s.add_task(|_: &mut TaskToken| 2i64);
    let c = s.add_task(|_: &mut TaskToken| String::from("not an int"));
    let sink = s.add_task(move |t: &mut TaskToken| {
        t.all_of::<i64>().into_iter().map(|c| c.take()).sum::<i64>()
    });
    sink.depends_on(&[a, b, c]).unwrap();

    s.run().unwrap();
    assert_eq!(s.get_result::<i64>(sink).unwrap(), 3);
}

#[test]
fn side_work_runs_during_run() {
    let s = scheduler();
    let side = Arc::new(AtomicU32::new(0));

    let side2 = side.clone();
    s.queue_work(
        move || {
            side2.fetch_add(1, Ordering::AcqRel);
        },
        Priority::High,
    );

    let _t = s.add_task(|_: &mut TaskToken| ());
    s.run().unwrap();
    assert_eq!(side.load(Ordering::Acquire), 1);
}

#[test]
fn awaitable_side_work_delivers_value() {
    let s = scheduler();

    let awaiter = s.awaitable_queue_work(|| 21u64 * 2, Priority::Normal);
    let _t = s.add_task(|_: &mut TaskToken| ());
    s.run().unwrap();

    assert_eq!(awaiter.wait().unwrap(), 42);
}

#[test]
fn awaitable_side_work_from_inside_task() {
    let s = scheduler();

    let t = s.add_task(|t: &mut TaskToken| {
        let awaiter = t.awaitable_queue_work(|| 6i64 * 7, Priority::Critical);
        awaiter.wait().unwrap()
    });
    s.run().unwrap();
    assert_eq!(s.get_result::<i64>(t).unwrap(), 42);
}

#[test]
fn side_work_panic_surfaces_through_awaiter() {
    let s = scheduler();

    let awaiter = s.awaitable_queue_work(|| -> u8 { panic!("side boom") }, Priority::Normal);
    let _t = s.add_task(|_: &mut TaskToken| ());
    s.run().unwrap();

    let err = awaiter.wait().unwrap_err();
    assert_eq!(*err.downcast_ref::<&str>().unwrap(), "side boom");
}

#[test]
fn workers_report_pool_ids() {
    let s = scheduler();
    let ids = Arc::new(Mutex::new(Vec::new()));

    for _ in 0..8 {
        let ids = ids.clone();
        let _ = s.add_task(move |_: &mut TaskToken| {
            ids.lock()
                .unwrap()
                .push(weft_runtime::this_thread::pool_id());
        });
    }
    s.run().unwrap();

    let ids = ids.lock().unwrap();
    assert_eq!(ids.len(), 8);
    assert!(ids.iter().all(|id| matches!(id, Some(n) if *n < 4)));
}

#[test]
fn reset_allows_reuse() {
    let s = scheduler();

    let t = s.add_task(|_: &mut TaskToken| 1i64);
    s.run().unwrap();
    assert_eq!(s.get_result::<i64>(t).unwrap(), 1);

    s.reset(true);
    assert_eq!(s.run(), Err(SchedulerError::NoRootTask));

    let t = s.add_task(|_: &mut TaskToken| 2i64);
    s.run().unwrap();
    assert_eq!(s.get_result::<i64>(t).unwrap(), 2);

    s.reset(false);
    let t = s.add_task(|_: &mut TaskToken| 3i64);
    s.run().unwrap();
    assert_eq!(s.get_result::<i64>(t).unwrap(), 3);
}

#[test]
fn wide_fan_out_and_reduce() {
    let s = scheduler();
    const WIDTH: usize = 100;

    let sources: Vec<_> = (0..WIDTH)
        .map(|i| s.add_task(move |_: &mut TaskToken| i as i64))
        .collect();
    let sink = s.add_task(move |t: &mut TaskToken| {
        t.all_of::<i64>().into_iter().map(|c| c.take()).sum::<i64>()
    });
    sink.depends_on(&sources).unwrap();

    s.run().unwrap();
    let expected = (0..WIDTH as i64).sum::<i64>();
    assert_eq!(s.get_result::<i64>(sink).unwrap(), expected);
}

#[test]
fn deep_chain_completes_in_order() {
    let s = scheduler();
    const DEPTH: usize = 200;

    let mut prev = s.add_task(|_: &mut TaskToken| 0i64);
    for _ in 0..DEPTH {
        let prev_id = prev.id();
        let next = s.add_task(move |t: &mut TaskToken| t.arg::<i64>(prev_id).unwrap().take() + 1);
        next.depends_on(&[prev]).unwrap();
        prev = next;
    }

    s.run().unwrap();
    assert_eq!(s.get_result::<i64>(prev).unwrap(), DEPTH as i64);
}

#[test]
fn many_independent_tasks_saturate_pool() {
    let s = scheduler();
    let done = Arc::new(AtomicUsize::new(0));

    for _ in 0..500 {
        let done = done.clone();
        let _ = s.add_task(move |_: &mut TaskToken| {
            done.fetch_add(1, Ordering::AcqRel);
        });
    }
    s.run().unwrap();
    assert_eq!(done.load(Ordering::Acquire), 500);
}

#[test]
fn duplicate_edges_are_ignored() {
    let s = scheduler();

    let t0 = s.add_task(|_: &mut TaskToken| 4i64);
    let t0_id = t0.id();
    let t1 = s.add_task(move |t: &mut TaskToken| t.arg::<i64>(t0_id).unwrap().take());

    t1.depends_on(&[t0]).unwrap();
    t1.depends_on(&[t0]).unwrap();

    s.run().unwrap();
    assert_eq!(s.get_result::<i64>(t1).unwrap(), 4);
}

#[test]
fn random_layered_dag_respects_dependencies() {
    use rand::seq::SliceRandom;
    use rand::{Rng, SeedableRng};

    // Random layered DAGs: every edge goes from layer k to layer k+1, and
    // each task records its start stamp so edges can be checked afterwards.
    let mut rng = rand::rngs::StdRng::seed_from_u64(42);

    for _ in 0..5 {
        let s = scheduler();
        let stamps = Arc::new(Mutex::new(std::collections::HashMap::new()));
        let clock = Arc::new(AtomicUsize::new(0));
        let mut edges = Vec::new();

        let mut layers: Vec<Vec<_>> = Vec::new();
        for layer in 0..4 {
            let width = rng.gen_range(2..6);
            let mut current = Vec::new();
            for _ in 0..width {
                let stamps = stamps.clone();
                let clock = clock.clone();
                let tracker = s.add_task(move |t: &mut TaskToken| {
                    let at = clock.fetch_add(1, Ordering::AcqRel);
                    stamps.lock().unwrap().insert(t.owner_id(), at);
                });
                current.push(tracker);
            }
            if layer > 0 {
                let prev: &Vec<_> = &layers[layer - 1];
                for tracker in &current {
                    let picks = rng.gen_range(1..=prev.len());
                    let mut parents = prev.clone();
                    parents.shuffle(&mut rng);
                    parents.truncate(picks);
                    tracker.depends_on(&parents).unwrap();
                    for parent in &parents {
                        edges.push((parent.id(), tracker.id()));
                    }
                }
            }
            layers.push(current);
        }
        let total: usize = layers.iter().map(|l| l.len()).sum();

        s.run().unwrap();

        // Every recorded edge must have run producer-first.
        let stamps = stamps.lock().unwrap();
        assert_eq!(stamps.len(), total);
        for (producer, consumer) in edges {
            assert!(
                stamps[&producer] < stamps[&consumer],
                "edge {producer:?} -> {consumer:?} ran out of order"
            );
        }
    }
}

#[test]
fn priority_is_visible_to_the_task() {
    let s = scheduler();
    let seen = Arc::new(Mutex::new(None));

    let seen2 = seen.clone();
    let _t = s.add_task_with_priority(
        move |t: &mut TaskToken| {
            *seen2.lock().unwrap() = Some(t.priority());
        },
        Priority::High,
    );
    s.run().unwrap();
    assert_eq!(seen.lock().unwrap().unwrap(), Priority::High);
}
