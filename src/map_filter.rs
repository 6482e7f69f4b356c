/*!
# Map / filter поверх движка

Готовые алгоритмы [`MapAlgorithm`] и [`FilterAlgorithm`] и функции запуска:
асинхронные (`mapped`, `filtered`, `mapped_sequence`) возвращают
[`TaskFuture`], блокирующие возвращают результаты в порядке индексов.
*/

use std::marker::PhantomData;
use std::sync::Arc;

use crate::engine::iterate_kernel::{IndexedSource, IterateAlgorithm, IterateKernel};
use crate::engine::pool::TaskPool;
use crate::engine::thread_engine::{EngineKernel, ThreadEngine};
use crate::error::Result;
use crate::future::{FutureInterface, TaskFuture};

/// Преобразование каждого элемента
pub struct MapAlgorithm<T, U, F> {
    map: F,
    _marker: PhantomData<fn(&T) -> U>,
}

impl<T, U, F> MapAlgorithm<T, U, F>
where
    F: Fn(&T) -> anyhow::Result<U>,
{
    pub fn new(map: F) -> Self {
        Self {
            map,
            _marker: PhantomData,
        }
    }
}

impl<T, U, F> IterateAlgorithm<T> for MapAlgorithm<T, U, F>
where
    T: 'static,
    U: Send + 'static,
    F: Fn(&T) -> anyhow::Result<U> + Send + Sync + 'static,
{
    type Output = U;

    fn run_iteration(&self, item: &T, _index: usize) -> anyhow::Result<Option<U>> {
        (self.map)(item).map(Some)
    }
}

/// Отбор элементов по предикату
pub struct FilterAlgorithm<T, F> {
    keep: F,
    _marker: PhantomData<fn(&T)>,
}

impl<T, F> FilterAlgorithm<T, F>
where
    F: Fn(&T) -> anyhow::Result<bool>,
{
    pub fn new(keep: F) -> Self {
        Self {
            keep,
            _marker: PhantomData,
        }
    }
}

impl<T, F> IterateAlgorithm<T> for FilterAlgorithm<T, F>
where
    T: Clone + Send + 'static,
    F: Fn(&T) -> anyhow::Result<bool> + Send + Sync + 'static,
{
    type Output = T;

    fn run_iteration(&self, item: &T, _index: usize) -> anyhow::Result<Option<T>> {
        Ok((self.keep)(item)?.then(|| item.clone()))
    }

    fn is_filter(&self) -> bool {
        true
    }
}

fn run_blocking<K: EngineKernel>(pool: Arc<dyn TaskPool>, kernel: K) -> Result<Vec<K::Item>> {
    let future = Arc::new(FutureInterface::new());
    let engine = Arc::new(ThreadEngine::new(kernel, pool).with_future(Arc::clone(&future)));
    engine.start_blocking()?;
    Ok(future.take_results())
}

/// Асинхронное преобразование источника с произвольным доступом
pub fn mapped<S, U, F>(pool: Arc<dyn TaskPool>, source: S, map: F) -> TaskFuture<U>
where
    S: IndexedSource,
    U: Send + 'static,
    F: Fn(&S::Item) -> anyhow::Result<U> + Send + Sync + 'static,
{
    let kernel = IterateKernel::indexed(source, MapAlgorithm::new(map));
    Arc::new(ThreadEngine::new(kernel, pool)).start_asynchronously()
}

/// Преобразование с ожиданием результата
pub fn blocking_mapped<S, U, F>(pool: Arc<dyn TaskPool>, source: S, map: F) -> Result<Vec<U>>
where
    S: IndexedSource,
    U: Send + 'static,
    F: Fn(&S::Item) -> anyhow::Result<U> + Send + Sync + 'static,
{
    run_blocking(pool, IterateKernel::indexed(source, MapAlgorithm::new(map)))
}

pub fn filtered<S, F>(pool: Arc<dyn TaskPool>, source: S, keep: F) -> TaskFuture<S::Item>
where
    S: IndexedSource,
    S::Item: Clone + Send + 'static,
    F: Fn(&S::Item) -> anyhow::Result<bool> + Send + Sync + 'static,
{
    let kernel = IterateKernel::indexed(source, FilterAlgorithm::new(keep));
    Arc::new(ThreadEngine::new(kernel, pool)).start_asynchronously()
}

pub fn blocking_filtered<S, F>(pool: Arc<dyn TaskPool>, source: S, keep: F) -> Result<Vec<S::Item>>
where
    S: IndexedSource,
    S::Item: Clone + Send + 'static,
    F: Fn(&S::Item) -> anyhow::Result<bool> + Send + Sync + 'static,
{
    run_blocking(pool, IterateKernel::indexed(source, FilterAlgorithm::new(keep)))
}

/// Асинхронное преобразование однопроходной последовательности
pub fn mapped_sequence<I, U, F>(pool: Arc<dyn TaskPool>, sequence: I, map: F) -> TaskFuture<U>
where
    I: IntoIterator,
    I::IntoIter: Send + 'static,
    I::Item: 'static,
    U: Send + 'static,
    F: Fn(&I::Item) -> anyhow::Result<U> + Send + Sync + 'static,
{
    let kernel = IterateKernel::sequential(sequence, MapAlgorithm::new(map));
    Arc::new(ThreadEngine::new(kernel, pool)).start_asynchronously()
}

pub fn blocking_mapped_sequence<I, U, F>(
    pool: Arc<dyn TaskPool>,
    sequence: I,
    map: F,
) -> Result<Vec<U>>
where
    I: IntoIterator,
    I::IntoIter: Send + 'static,
    I::Item: 'static,
    U: Send + 'static,
    F: Fn(&I::Item) -> anyhow::Result<U> + Send + Sync + 'static,
{
    run_blocking(pool, IterateKernel::sequential(sequence, MapAlgorithm::new(map)))
}
