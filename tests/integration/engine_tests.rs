use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use concurrent_map_engine::engine::{
    BlockSizeManager, BlockSizeTuning, IterateAlgorithm, ThreadEngineBarrier,
};
use concurrent_map_engine::{
    blocking_filtered, blocking_mapped, blocking_mapped_sequence, mapped, EngineError,
    EngineMetrics, FutureInterface, IterateKernel, MapAlgorithm, RayonTaskPool, ResultStore,
    TaskPool, ThreadEngine,
};
use proptest::prelude::*;
use proptest::test_runner::TestRunner;

fn pool(threads: usize) -> Arc<dyn TaskPool> {
    RayonTaskPool::new(threads).expect("pool").into_shared()
}

#[derive(Debug, thiserror::Error)]
#[error("bad item {0}")]
struct BadItem(u32);

/// Запоминает обработанные индексы
#[derive(Default)]
struct IndexRecorder {
    seen: Mutex<Vec<usize>>,
}

impl IterateAlgorithm<u32> for IndexRecorder {
    type Output = u32;

    fn run_iteration(&self, item: &u32, index: usize) -> anyhow::Result<Option<u32>> {
        self.seen.lock().expect("lock").push(index);
        Ok(Some(*item))
    }
}

/// Однопроходный источник, считающий продвижения курсора
struct CountingSource {
    next_value: u32,
    end: u32,
    advances: Arc<AtomicUsize>,
}

impl Iterator for CountingSource {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        if self.next_value == self.end {
            return None;
        }
        self.advances.fetch_add(1, Ordering::SeqCst);
        let value = self.next_value;
        self.next_value += 1;
        Some(value)
    }
}

#[test]
fn claimed_batches_cover_range_exactly_once() {
    let mut config = ProptestConfig::with_cases(24);
    config.failure_persistence = None;
    let mut runner = TestRunner::new(config);
    runner
        .run(&(0usize..3000, 1usize..6), |(count, threads)| {
            let items: Vec<u32> = (0..count as u32).collect();
            let kernel = IterateKernel::indexed(items, IndexRecorder::default());
            let engine = Arc::new(ThreadEngine::new(kernel, pool(threads)));
            engine.start_blocking().expect("run");

            let mut seen = engine.kernel().algorithm().seen.lock().expect("lock").clone();
            seen.sort_unstable();
            prop_assert_eq!(seen, (0..count).collect::<Vec<_>>());
            prop_assert_eq!(engine.kernel().completed(), count);
            Ok(())
        })
        .expect("proptest execution");
}

#[test]
fn sequential_strategy_advances_once_per_item() {
    let advances = Arc::new(AtomicUsize::new(0));
    let source = CountingSource {
        next_value: 0,
        end: 500,
        advances: Arc::clone(&advances),
    };
    let future = Arc::new(FutureInterface::new());
    let kernel = IterateKernel::sequential(source, IndexRecorder::default());
    let engine = Arc::new(ThreadEngine::new(kernel, pool(4)).with_future(Arc::clone(&future)));

    engine.start_blocking().expect("run");

    let seen = engine.kernel().algorithm().seen.lock().expect("lock").clone();
    let distinct: HashSet<_> = seen.iter().copied().collect();
    assert_eq!(advances.load(Ordering::SeqCst), 500);
    assert_eq!(seen.len(), 500);
    assert_eq!(distinct.len(), 500);
    assert_eq!(future.results(), (0..500).collect::<Vec<u32>>());
}

#[test]
fn small_inputs_start_with_maxed_block_size() {
    let manager = BlockSizeManager::new(8, 4, BlockSizeTuning::default());
    assert_eq!(manager.max_block_size(), 1);
    assert!(manager.block_size_maxed());

    let mut manager = BlockSizeManager::new(10_000, 2, BlockSizeTuning::default());
    let mut previous = manager.block_size();
    for _ in 0..200 {
        manager.time_before_user();
        manager.time_after_user();
        let current = manager.block_size();
        assert!(current >= previous);
        assert!(current <= manager.max_block_size());
        previous = current;
    }
}

#[test]
fn barrier_wait_returns_after_last_release() {
    let barrier = Arc::new(ThreadEngineBarrier::new());
    let released = Arc::new(AtomicUsize::new(0));

    for _ in 0..6 {
        barrier.acquire();
    }
    assert_eq!(barrier.current_count(), 6);

    let workers: Vec<_> = (0..6)
        .map(|i| {
            let barrier = Arc::clone(&barrier);
            let released = Arc::clone(&released);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(2 * i));
                released.fetch_add(1, Ordering::SeqCst);
                barrier.release();
            })
        })
        .collect();

    barrier.wait();
    assert_eq!(released.load(Ordering::SeqCst), 6);
    assert_eq!(barrier.current_count(), 0);

    for worker in workers {
        worker.join().expect("worker panicked");
    }
}

fn shuffled_batches() -> impl Strategy<Value = Vec<(usize, usize)>> {
    proptest::collection::vec(1usize..8, 1..40).prop_flat_map(|sizes| {
        let mut begin = 0;
        let batches: Vec<(usize, usize)> = sizes
            .into_iter()
            .map(|size| {
                let batch = (begin, size);
                begin += size;
                batch
            })
            .collect();
        Just(batches).prop_shuffle()
    })
}

#[test]
fn result_store_counts_contiguous_prefix() {
    let mut config = ProptestConfig::with_cases(64);
    config.failure_persistence = None;
    let mut runner = TestRunner::new(config);
    runner
        .run(&shuffled_batches(), |batches| {
            let total: usize = batches.iter().map(|(_, size)| size).sum();
            let mut store = ResultStore::new();
            for &(begin, size) in &batches {
                if size == 1 {
                    store.add_result(Some(begin), begin);
                } else {
                    store.add_results(Some(begin), (begin..begin + size).collect(), size);
                }
            }

            prop_assert_eq!(store.count(), total);
            prop_assert_eq!(store.insert_index(), total);
            for index in 0..total {
                prop_assert!(store.contains(index));
                prop_assert_eq!(store.get(index), Some(&index));
            }
            prop_assert_eq!(store.to_vec(), (0..total).collect::<Vec<_>>());
            Ok(())
        })
        .expect("proptest execution");
}

#[test]
fn filter_mode_keeps_logical_index_accounting() {
    let mut store = ResultStore::new();
    store.set_filter_mode(true);

    store.add_results(Some(0), vec!["a", "b", "c"], 5);
    store.add_results(Some(5), vec!["x", "y", "z"], 3);

    assert_eq!(store.count(), 6);
    assert_eq!(store.insert_index(), 8);
    assert_eq!(store.to_vec(), vec!["a", "b", "c", "x", "y", "z"]);
}

#[test]
fn map_ten_integers_with_four_workers() -> Result<()> {
    let doubled = blocking_mapped(pool(4), (0..10u32).collect::<Vec<_>>(), |x| Ok(x * 2))?;
    assert_eq!(doubled, vec![0, 2, 4, 6, 8, 10, 12, 14, 16, 18]);

    let odd = blocking_filtered(pool(4), (0..10u32).collect::<Vec<_>>(), |x| Ok(x % 2 == 1))?;
    assert_eq!(odd, vec![1, 3, 5, 7, 9]);

    let squares = blocking_mapped_sequence(pool(4), 0..10u32, |x| Ok(x * x))?;
    assert_eq!(squares, vec![0, 1, 4, 9, 16, 25, 36, 49, 64, 81]);
    Ok(())
}

#[test]
fn cancel_mid_run_stops_new_claims() {
    let processed = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&processed);
    let future = mapped(pool(2), (0..10u32).collect::<Vec<_>>(), move |x| {
        thread::sleep(Duration::from_millis(5));
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(x * 2)
    });

    let deadline = Instant::now() + Duration::from_secs(10);
    while processed.load(Ordering::SeqCst) < 3 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(1));
    }
    future.cancel();

    assert!(future.wait_for_finished().is_ok());
    assert!(future.is_canceled());
    assert!(processed.load(Ordering::SeqCst) < 10);
}

#[test]
fn cancel_in_single_threaded_run_is_deterministic() {
    let future = Arc::new(FutureInterface::new());
    let handle = Arc::clone(&future);
    let kernel = IterateKernel::indexed(
        (0..10u32).collect::<Vec<_>>(),
        MapAlgorithm::new(move |x: &u32| {
            if *x == 3 {
                handle.cancel();
            }
            Ok(x * 2)
        }),
    );
    let engine = ThreadEngine::new(kernel, pool(1)).with_future(Arc::clone(&future));

    engine.start_single_threaded().expect("cancel is not an error");
    assert_eq!(engine.kernel().completed(), 4);
    assert_eq!(future.results(), vec![0, 2, 4]);
}

#[test]
fn paused_run_resumes_and_completes() -> Result<()> {
    let future = Arc::new(FutureInterface::new());
    future.set_paused(true);
    let kernel = IterateKernel::indexed(
        (0..100u32).collect::<Vec<_>>(),
        MapAlgorithm::new(|x: &u32| Ok(x + 1)),
    );
    let handle = Arc::new(ThreadEngine::new(kernel, pool(3)).with_future(Arc::clone(&future)))
        .start_asynchronously();

    thread::sleep(Duration::from_millis(20));
    assert!(!handle.is_finished());
    assert_eq!(handle.progress_value(), 0);

    handle.resume();
    assert_eq!(handle.results()?, (1..=100).collect::<Vec<_>>());
    assert_eq!(handle.progress_value(), 100);
    Ok(())
}

fn spin_for(duration: Duration) {
    let start = Instant::now();
    while start.elapsed() < duration {
        std::hint::spin_loop();
    }
}

fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    condition()
}

#[test]
fn pause_mid_run_throttles_workers_and_resumes() -> Result<()> {
    let metrics = Arc::new(EngineMetrics::new()?);

    for _round in 0..20 {
        let processed = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&processed);
        let kernel = IterateKernel::indexed(
            (0..400u32).collect::<Vec<_>>(),
            MapAlgorithm::new(move |x: &u32| {
                spin_for(Duration::from_micros(50));
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(x * 3)
            }),
        );
        let engine = ThreadEngine::new(kernel, pool(4)).with_metrics(Arc::clone(&metrics));
        let handle = Arc::new(engine).start_asynchronously();

        assert!(wait_until(Duration::from_secs(5), || {
            processed.load(Ordering::SeqCst) >= 40
        }));
        handle.pause();

        // Начатые батчи дорабатываются, новые элементы не обрабатываются
        thread::sleep(Duration::from_millis(50));
        let frozen = processed.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(50));
        if frozen < 400 {
            assert_eq!(processed.load(Ordering::SeqCst), frozen);
            assert!(!handle.is_finished());
        }

        handle.resume();
        assert_eq!(handle.results()?, (0..400).map(|x| x * 3).collect::<Vec<_>>());
        assert_eq!(processed.load(Ordering::SeqCst), 400);
        assert_eq!(handle.progress_value(), 400);
    }

    // Хотя бы один не последний поток вышел на паузе
    assert!(metrics.threads_throttled() > 0);
    assert!(metrics.threads_started() > 0);
    Ok(())
}

#[test]
fn user_error_is_rethrown_with_its_type() {
    let task_pool = Arc::new(RayonTaskPool::new(4).expect("pool"));
    let shared: Arc<dyn TaskPool> = task_pool.clone();
    let future = Arc::new(FutureInterface::new());
    let kernel = IterateKernel::indexed(
        (0..10u32).collect::<Vec<_>>(),
        MapAlgorithm::new(|x: &u32| {
            if *x == 3 {
                return Err(BadItem(*x).into());
            }
            Ok(*x)
        }),
    );
    let engine = Arc::new(ThreadEngine::new(kernel, shared).with_future(Arc::clone(&future)));

    let error = engine.start_blocking().expect_err("run must fail");
    assert_eq!(error.downcast_ref::<BadItem>().map(|e| e.0), Some(3));
    assert!(matches!(error, EngineError::Algorithm(_)));
    assert_eq!(engine.active_thread_count(), 0);

    // Ошибка доставлена в future ровно одна, тем же значением
    let reported = future.exception().expect("exception reported");
    assert_eq!(reported.downcast_ref::<BadItem>().map(|e| e.0), Some(3));
    assert!(future.is_finished());

    let deadline = Instant::now() + Duration::from_secs(5);
    while task_pool.active_thread_count() > 0 && Instant::now() < deadline {
        thread::yield_now();
    }
    assert_eq!(task_pool.active_thread_count(), 0);
}
