/*!
# Ядро итерации по диапазону

[`IterateKernel`] раздает элементы диапазона рабочим потокам одной из двух
стратегий, выбранных по типу диапазона на этапе компиляции:

- [`IndexedRange`] (стратегия "for") - источник с произвольным доступом.
  Потоки атомарно захватывают непересекающиеся блоки `[begin, end)` через
  `fetch_add`; размер блока подбирает [`BlockSizeManager`] каждого потока.
- [`SequentialRange`] (стратегия "while") - однопроходный итератор. Курсор
  продвигает только владелец однослотового шлюза (CAS 0 -> 1), обработка
  захваченного элемента идет уже без шлюза.

Результаты отправляются в future через `ResultReporter`: короткие батчи
поэлементно, длинные одним вектором.
*/

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use super::block_size::{BlockSizeManager, BlockSizeTuning};
use super::thread_engine::{EngineKernel, ThreadContext, ThreadFunctionResult};

/// Батчи длиннее этого порога отправляются одним вектором
pub const DEFAULT_VECTOR_THRESHOLD: usize = 4;

/// Источник с произвольным доступом
pub trait IndexedSource: Send + Sync + 'static {
    type Item: Send + Sync + 'static;

    fn as_slice(&self) -> &[Self::Item];
}

impl<T: Send + Sync + 'static> IndexedSource for Vec<T> {
    type Item = T;

    fn as_slice(&self) -> &[T] {
        &self[..]
    }
}

impl<T: Send + Sync + 'static> IndexedSource for Arc<[T]> {
    type Item = T;

    fn as_slice(&self) -> &[T] {
        &self[..]
    }
}

impl<T: Send + Sync + 'static> IndexedSource for Box<[T]> {
    type Item = T;

    fn as_slice(&self) -> &[T] {
        &self[..]
    }
}

/// Пользовательский алгоритм над элементами типа `T`
///
/// Батч дает ровно один слот на элемент. `None` вне режима фильтрации
/// оставляет разрыв на своем индексе, соседние результаты не сдвигаются.
pub trait IterateAlgorithm<T>: Send + Sync + 'static {
    type Output: Send + 'static;

    /// Обработка одного элемента с логическим индексом `index`
    fn run_iteration(&self, item: &T, index: usize) -> anyhow::Result<Option<Self::Output>>;

    /// Обработка непрерывного батча, начинающегося с индекса `begin`.
    /// В `results` добавляется по одному слоту на каждый элемент `items`.
    fn run_iterations(
        &self,
        items: &[T],
        begin: usize,
        results: &mut Vec<Option<Self::Output>>,
    ) -> anyhow::Result<()> {
        for (offset, item) in items.iter().enumerate() {
            results.push(self.run_iteration(item, begin + offset)?);
        }
        Ok(())
    }

    /// Алгоритм отбрасывает часть элементов
    fn is_filter(&self) -> bool {
        false
    }
}

/// Общее состояние итерации
#[derive(Debug)]
pub struct IterationState {
    current_index: AtomicUsize,
    completed: AtomicUsize,
    iteration_count: usize,
    tuning: BlockSizeTuning,
    vector_threshold: usize,
}

impl IterationState {
    fn new(iteration_count: usize) -> Self {
        Self {
            current_index: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
            iteration_count,
            tuning: BlockSizeTuning::default(),
            vector_threshold: DEFAULT_VECTOR_THRESHOLD,
        }
    }

    fn record_completed<T>(&self, ctx: &ThreadContext<'_, T>, count: usize) {
        let completed = self.completed.fetch_add(count, Ordering::AcqRel) + count;
        if ctx.is_progress_reporting_enabled() {
            ctx.set_progress_value(completed);
        }
        if let Some(metrics) = ctx.metrics() {
            metrics.record_batch(count);
        }
    }
}

/// Стратегия обхода диапазона
pub trait IterationRange: Send + Sync + 'static {
    type Item;

    /// Стратегия "for" (произвольный доступ)
    const FOR_ITERATION: bool;

    /// Количество элементов, 0 для диапазона неизвестной длины
    fn iteration_count(&self) -> usize;

    fn thread_function<A>(
        &self,
        state: &IterationState,
        algorithm: &A,
        ctx: &ThreadContext<'_, A::Output>,
    ) -> anyhow::Result<ThreadFunctionResult>
    where
        A: IterateAlgorithm<Self::Item>;

    fn should_start_thread<T>(&self, state: &IterationState, ctx: &ThreadContext<'_, T>) -> bool;
}

/// Диапазон с произвольным доступом
#[derive(Debug)]
pub struct IndexedRange<S> {
    source: S,
}

impl<S: IndexedSource> IndexedRange<S> {
    pub fn new(source: S) -> Self {
        Self { source }
    }

    pub fn source(&self) -> &S {
        &self.source
    }
}

impl<S: IndexedSource> IterationRange for IndexedRange<S> {
    type Item = S::Item;

    const FOR_ITERATION: bool = true;

    fn iteration_count(&self) -> usize {
        self.source.as_slice().len()
    }

    fn thread_function<A>(
        &self,
        state: &IterationState,
        algorithm: &A,
        ctx: &ThreadContext<'_, A::Output>,
    ) -> anyhow::Result<ThreadFunctionResult>
    where
        A: IterateAlgorithm<Self::Item>,
    {
        let items = self.source.as_slice();
        let iteration_count = state.iteration_count;
        let mut block_size_manager =
            BlockSizeManager::new(iteration_count, ctx.max_thread_count(), state.tuning);
        let mut reporter = ResultReporter::new(state.vector_threshold, algorithm.is_filter());

        loop {
            if ctx.is_canceled() {
                break;
            }

            let current_block_size = block_size_manager.block_size();

            if state.current_index.load(Ordering::Relaxed) >= iteration_count {
                break;
            }

            let begin_index = state
                .current_index
                .fetch_add(current_block_size, Ordering::Release);
            let end_index = (begin_index + current_block_size).min(iteration_count);

            if begin_index >= end_index {
                break;
            }

            ctx.wait_for_resume();

            if self.should_start_thread(state, ctx) {
                ctx.start_thread();
            }

            // Последний блок может быть короче номинального
            let final_block_size = end_index - begin_index;
            reporter.reserve_space(final_block_size);

            block_size_manager.time_before_user();
            algorithm.run_iterations(
                &items[begin_index..end_index],
                begin_index,
                reporter.results_mut(),
            )?;
            block_size_manager.time_after_user();

            reporter.report_results(ctx, begin_index);
            state.record_completed(ctx, final_block_size);

            if ctx.should_throttle_thread() {
                return Ok(ThreadFunctionResult::ThrottleThread);
            }
        }

        Ok(ThreadFunctionResult::ThreadFinished)
    }

    fn should_start_thread<T>(&self, state: &IterationState, ctx: &ThreadContext<'_, T>) -> bool {
        state.current_index.load(Ordering::Relaxed) < state.iteration_count
            && !ctx.should_throttle_thread()
    }
}

/// Однопроходный диапазон
#[derive(Debug)]
pub struct SequentialRange<I> {
    cursor: Mutex<I>,
    iterator_threads: AtomicUsize,
    iteration_count: usize,
}

impl<I: Iterator> SequentialRange<I> {
    pub fn new(iter: impl IntoIterator<IntoIter = I>) -> Self {
        let cursor = iter.into_iter();
        let iteration_count = match cursor.size_hint() {
            (lower, Some(upper)) if lower == upper => lower,
            _ => 0,
        };
        Self {
            cursor: Mutex::new(cursor),
            iterator_threads: AtomicUsize::new(0),
            iteration_count,
        }
    }

    fn try_acquire_gate(&self) -> bool {
        self.iterator_threads
            .compare_exchange(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    fn release_gate(&self) {
        let _ = self
            .iterator_threads
            .compare_exchange(1, 0, Ordering::Release, Ordering::Relaxed);
    }
}

impl<I> IterationRange for SequentialRange<I>
where
    I: Iterator + Send + 'static,
{
    type Item = I::Item;

    const FOR_ITERATION: bool = false;

    fn iteration_count(&self) -> usize {
        self.iteration_count
    }

    fn thread_function<A>(
        &self,
        state: &IterationState,
        algorithm: &A,
        ctx: &ThreadContext<'_, A::Output>,
    ) -> anyhow::Result<ThreadFunctionResult>
    where
        A: IterateAlgorithm<Self::Item>,
    {
        // Курсор уже продвигает другой поток
        if !self.try_acquire_gate() {
            return Ok(ThreadFunctionResult::ThreadFinished);
        }

        let mut reporter = ResultReporter::new(state.vector_threshold, algorithm.is_filter());

        loop {
            if ctx.is_canceled() {
                self.release_gate();
                break;
            }

            let next = self
                .cursor
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .next();
            // Исчерпанный диапазон оставляет шлюз занятым
            let Some(item) = next else {
                break;
            };
            let index = state.current_index.fetch_add(1, Ordering::Relaxed);
            self.release_gate();

            ctx.wait_for_resume();

            if self.should_start_thread(state, ctx) {
                ctx.start_thread();
            }

            reporter.reserve_space(1);
            let output = algorithm.run_iteration(&item, index)?;
            reporter.results_mut().push(output);
            reporter.report_results(ctx, index);
            state.record_completed(ctx, 1);

            if ctx.should_throttle_thread() {
                return Ok(ThreadFunctionResult::ThrottleThread);
            }

            if !self.try_acquire_gate() {
                return Ok(ThreadFunctionResult::ThreadFinished);
            }
        }

        Ok(ThreadFunctionResult::ThreadFinished)
    }

    fn should_start_thread<T>(&self, _state: &IterationState, _ctx: &ThreadContext<'_, T>) -> bool {
        self.iterator_threads.load(Ordering::Relaxed) == 0
    }
}

/// Буфер результатов одного рабочего потока: по слоту на элемент батча
struct ResultReporter<T> {
    results: Vec<Option<T>>,
    current_result_count: usize,
    vector_threshold: usize,
    filter_mode: bool,
}

impl<T> ResultReporter<T> {
    fn new(vector_threshold: usize, filter_mode: bool) -> Self {
        Self {
            results: Vec::new(),
            current_result_count: 0,
            vector_threshold,
            filter_mode,
        }
    }

    fn reserve_space(&mut self, result_count: usize) {
        self.current_result_count = result_count;
        self.results.clear();
        self.results.reserve(result_count);
    }

    fn results_mut(&mut self) -> &mut Vec<Option<T>> {
        &mut self.results
    }

    fn report_results(&mut self, ctx: &ThreadContext<'_, T>, begin: usize) {
        // В режиме фильтрации батч всегда уходит целиком вместе с числом
        // покрытых слотов, даже если все элементы отброшены
        if self.filter_mode {
            let kept: Vec<T> = self.results.drain(..).flatten().collect();
            ctx.report_results(begin, kept, self.current_result_count);
            return;
        }

        // Каждая непрерывная серия результатов уходит со своего индекса
        let threshold = self.vector_threshold;
        let mut run_begin = begin;
        let mut run = Vec::new();
        for (offset, slot) in self.results.drain(..).enumerate() {
            match slot {
                Some(result) => run.push(result),
                None => {
                    Self::report_run(ctx, threshold, run_begin, &mut run);
                    run_begin = begin + offset + 1;
                }
            }
        }
        Self::report_run(ctx, threshold, run_begin, &mut run);
    }

    fn report_run(
        ctx: &ThreadContext<'_, T>,
        vector_threshold: usize,
        begin: usize,
        run: &mut Vec<T>,
    ) {
        if run.is_empty() {
            return;
        }

        if run.len() > vector_threshold {
            let results = std::mem::take(run);
            let count = results.len();
            ctx.report_results(begin, results, count);
        } else {
            for (offset, result) in run.drain(..).enumerate() {
                ctx.report_result(begin + offset, result);
            }
        }
    }
}

/// Ядро итерации: диапазон `R` и алгоритм `A`
#[derive(Debug)]
pub struct IterateKernel<R, A> {
    range: R,
    algorithm: A,
    state: IterationState,
}

impl<R, A> IterateKernel<R, A>
where
    R: IterationRange,
    A: IterateAlgorithm<R::Item>,
{
    pub fn new(range: R, algorithm: A) -> Self {
        let state = IterationState::new(range.iteration_count());
        Self {
            range,
            algorithm,
            state,
        }
    }

    pub fn with_tuning(mut self, tuning: BlockSizeTuning) -> Self {
        self.state.tuning = tuning;
        self
    }

    pub fn with_vector_threshold(mut self, vector_threshold: usize) -> Self {
        self.state.vector_threshold = vector_threshold;
        self
    }

    pub fn is_for_iteration(&self) -> bool {
        R::FOR_ITERATION
    }

    pub fn iteration_count(&self) -> usize {
        self.state.iteration_count
    }

    /// Количество обработанных элементов
    pub fn completed(&self) -> usize {
        self.state.completed.load(Ordering::Acquire)
    }

    pub fn algorithm(&self) -> &A {
        &self.algorithm
    }

    pub fn range(&self) -> &R {
        &self.range
    }
}

impl<S, A> IterateKernel<IndexedRange<S>, A>
where
    S: IndexedSource,
    A: IterateAlgorithm<S::Item>,
{
    pub fn indexed(source: S, algorithm: A) -> Self {
        Self::new(IndexedRange::new(source), algorithm)
    }
}

impl<I, A> IterateKernel<SequentialRange<I>, A>
where
    I: Iterator + Send + 'static,
    A: IterateAlgorithm<I::Item>,
{
    pub fn sequential(iter: impl IntoIterator<IntoIter = I>, algorithm: A) -> Self {
        Self::new(SequentialRange::new(iter), algorithm)
    }
}

impl<R, A> EngineKernel for IterateKernel<R, A>
where
    R: IterationRange,
    A: IterateAlgorithm<R::Item>,
{
    type Item = A::Output;

    fn start(&self, ctx: &ThreadContext<'_, A::Output>) {
        if ctx.is_progress_reporting_enabled() && self.state.iteration_count > 0 {
            ctx.set_progress_range(0, self.state.iteration_count);
        }
        if self.algorithm.is_filter() {
            ctx.set_filter_mode(true);
        }
    }

    fn thread_function(
        &self,
        ctx: &ThreadContext<'_, A::Output>,
    ) -> anyhow::Result<ThreadFunctionResult> {
        self.range.thread_function(&self.state, &self.algorithm, ctx)
    }

    fn should_start_thread(&self, ctx: &ThreadContext<'_, A::Output>) -> bool {
        self.range.should_start_thread(&self.state, ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::pool::{RayonTaskPool, TaskPool};
    use crate::engine::thread_engine::ThreadEngine;
    use crate::future::FutureInterface;
    use std::collections::HashSet;

    /// Запоминает все обработанные индексы
    #[derive(Debug, Default)]
    struct RecordIndices {
        seen: Mutex<Vec<usize>>,
    }

    impl IterateAlgorithm<u64> for RecordIndices {
        type Output = u64;

        fn run_iteration(&self, item: &u64, index: usize) -> anyhow::Result<Option<u64>> {
            self.seen
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(index);
            Ok(Some(item * 10))
        }
    }

    /// Оставляет только четные
    #[derive(Debug)]
    struct KeepEven;

    impl IterateAlgorithm<u64> for KeepEven {
        type Output = u64;

        fn run_iteration(&self, item: &u64, _index: usize) -> anyhow::Result<Option<u64>> {
            Ok((item % 2 == 0).then_some(*item))
        }

        fn is_filter(&self) -> bool {
            true
        }
    }

    /// Не дает результата для одного элемента
    #[derive(Debug)]
    struct SkipOne(u64);

    impl IterateAlgorithm<u64> for SkipOne {
        type Output = u64;

        fn run_iteration(&self, item: &u64, _index: usize) -> anyhow::Result<Option<u64>> {
            Ok((*item != self.0).then_some(*item))
        }
    }

    fn pool(threads: usize) -> Arc<dyn TaskPool> {
        RayonTaskPool::new(threads).expect("pool").into_shared()
    }

    #[test]
    fn test_indexed_kernel_claims_every_index_once() {
        let items: Vec<u64> = (0..1000).collect();
        let future = Arc::new(FutureInterface::new());
        let kernel = IterateKernel::indexed(items, RecordIndices::default());
        assert!(kernel.is_for_iteration());
        assert_eq!(kernel.iteration_count(), 1000);

        let engine = Arc::new(ThreadEngine::new(kernel, pool(4)).with_future(Arc::clone(&future)));
        engine.start_blocking().expect("run");

        let mut seen = engine
            .kernel()
            .algorithm()
            .seen
            .lock()
            .expect("lock")
            .clone();
        seen.sort_unstable();
        assert_eq!(seen, (0..1000).collect::<Vec<_>>());
        assert_eq!(engine.kernel().completed(), 1000);
        assert_eq!(future.progress_value(), 1000);
        assert_eq!(future.progress_maximum(), 1000);
        assert_eq!(
            future.results(),
            (0..1000).map(|i| i * 10).collect::<Vec<u64>>()
        );
    }

    #[test]
    fn test_empty_range_finishes_immediately() {
        let future = Arc::new(FutureInterface::new());
        let kernel = IterateKernel::indexed(Vec::<u64>::new(), RecordIndices::default());
        let engine = Arc::new(ThreadEngine::new(kernel, pool(2)).with_future(Arc::clone(&future)));

        engine.start_blocking().expect("run");
        assert!(future.is_finished());
        assert!(future.results().is_empty());
        assert_eq!(engine.kernel().completed(), 0);
    }

    #[test]
    fn test_sequential_kernel_single_advancer() {
        let future = Arc::new(FutureInterface::new());
        // filter() скрывает длину диапазона
        let source = (0..300u64).filter(|_| true);
        let kernel = IterateKernel::sequential(source, RecordIndices::default());
        assert!(!kernel.is_for_iteration());
        assert_eq!(kernel.iteration_count(), 0);

        let engine = Arc::new(ThreadEngine::new(kernel, pool(4)).with_future(Arc::clone(&future)));
        engine.start_blocking().expect("run");

        let seen = engine
            .kernel()
            .algorithm()
            .seen
            .lock()
            .expect("lock")
            .clone();
        let distinct: HashSet<_> = seen.iter().copied().collect();
        assert_eq!(seen.len(), 300);
        assert_eq!(distinct.len(), 300);
        assert_eq!(
            future.results(),
            (0..300).map(|i| i * 10).collect::<Vec<u64>>()
        );
    }

    #[test]
    fn test_sequential_range_knows_exact_length() {
        let kernel = IterateKernel::sequential(vec![1u64, 2, 3], KeepEven);
        assert_eq!(kernel.iteration_count(), 3);
    }

    #[test]
    fn test_filter_kernel_keeps_order() {
        let items: Vec<u64> = (0..500).collect();
        let future = Arc::new(FutureInterface::new());
        let kernel = IterateKernel::indexed(items, KeepEven);
        let engine = Arc::new(ThreadEngine::new(kernel, pool(3)).with_future(Arc::clone(&future)));

        engine.start_blocking().expect("run");
        assert!(future.filter_mode());
        assert_eq!(
            future.results(),
            (0..500).filter(|i| i % 2 == 0).collect::<Vec<u64>>()
        );
        assert_eq!(future.result_count(), 250);
    }

    #[test]
    fn test_reporter_threshold() {
        let future = Arc::new(FutureInterface::new());
        let kernel = IterateKernel::indexed((0..64u64).collect::<Vec<_>>(), RecordIndices::default())
            .with_vector_threshold(0);
        let engine = ThreadEngine::new(kernel, pool(1)).with_future(Arc::clone(&future));

        engine.start_single_threaded().expect("run");
        assert_eq!(future.result_count(), 64);
    }

    #[test]
    fn test_missing_result_keeps_positions_in_batches() {
        // Окно медианы из одного замера: блок растет после первых батчей
        let tuning = BlockSizeTuning {
            median_window: 1,
            ..BlockSizeTuning::default()
        };
        for threshold in [0, DEFAULT_VECTOR_THRESHOLD, usize::MAX] {
            let future = Arc::new(FutureInterface::new());
            let kernel = IterateKernel::indexed((0..64u64).collect::<Vec<_>>(), SkipOne(10))
                .with_tuning(tuning)
                .with_vector_threshold(threshold);
            let engine = ThreadEngine::new(kernel, pool(1)).with_future(Arc::clone(&future));

            engine.start_single_threaded().expect("run");
            assert_eq!(future.result_count(), 10);
            assert_eq!(future.wait_for_result(9), Some(9));
            assert_eq!(future.wait_for_result(10), None);
            assert_eq!(future.wait_for_result(11), Some(11));
            assert_eq!(future.wait_for_result(63), Some(63));
            assert_eq!(
                future.results(),
                (0..64).filter(|i| *i != 10).collect::<Vec<u64>>()
            );
            assert_eq!(engine.kernel().completed(), 64);
        }
    }

    #[test]
    fn test_missing_result_in_sequential_range_leaves_gap() {
        let future = Arc::new(FutureInterface::new());
        let kernel = IterateKernel::sequential(0..8u64, SkipOne(2));
        let engine = ThreadEngine::new(kernel, pool(1)).with_future(Arc::clone(&future));

        engine.start_single_threaded().expect("run");
        assert_eq!(future.result_count(), 2);
        assert_eq!(future.wait_for_result(2), None);
        assert_eq!(future.wait_for_result(3), Some(3));
    }
}
