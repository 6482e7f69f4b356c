/*!
# Движок рабочих потоков

[`ThreadEngine`] выполняет пользовательское ядро ([`EngineKernel`]) в одном из
трех режимов:

- **однопоточный** - `thread_function` вызывается в текущем потоке до
  `ThreadFinished`, пул не используется;
- **блокирующий** - управляющий поток запускает рабочие задачи в пуле, сам
  участвует в работе как рабочий и ждет ухода остальных на барьере;
- **асинхронный** - движок передается пулу как самозапускающаяся задача,
  вызывающий получает [`TaskFuture`]; последний рабочий поток завершает запуск.

Движок в асинхронном режиме живет в `Arc`: каждая задача пула держит свою
ссылку, и движок освобождается вместе с последней из них.
*/

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use tracing::{debug, trace, warn};
use uuid::Uuid;

use super::barrier::ThreadEngineBarrier;
use super::pool::TaskPool;
use crate::error::{EngineError, Result};
use crate::future::{FutureInterface, TaskFuture};
use crate::metrics::EngineMetrics;

/// Итог одного вызова `thread_function`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadFunctionResult {
    /// Ядро просит отпустить этот поток (пауза или иная обратная связь)
    ThrottleThread,

    /// Работы для этого потока больше нет
    ThreadFinished,
}

/// Пользовательская часть движка
pub trait EngineKernel: Send + Sync + 'static {
    /// Тип результатов, отправляемых в future
    type Item: Send + 'static;

    /// Вызывается один раз перед запуском рабочих потоков
    fn start(&self, _ctx: &ThreadContext<'_, Self::Item>) {}

    /// Вызывается один раз после ухода всех рабочих потоков
    fn finish(&self) {}

    fn thread_function(
        &self,
        ctx: &ThreadContext<'_, Self::Item>,
    ) -> anyhow::Result<ThreadFunctionResult>;

    /// Нужен ли еще один рабочий поток
    fn should_start_thread(&self, _ctx: &ThreadContext<'_, Self::Item>) -> bool {
        false
    }
}

/// Хранилище первой ошибки запуска
#[derive(Debug, Default)]
struct ExceptionStore {
    has_exception: AtomicBool,
    exception: Mutex<Option<EngineError>>,
}

impl ExceptionStore {
    /// Сохраняет ошибку, если она первая. Возвращает `true`, если сохранена.
    fn set_exception(&self, error: EngineError) -> bool {
        let mut slot = self.exception.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return false;
        }
        *slot = Some(error);
        self.has_exception.store(true, Ordering::Release);
        true
    }

    fn has_exception(&self) -> bool {
        self.has_exception.load(Ordering::Acquire)
    }

    fn exception(&self) -> Option<EngineError> {
        self.exception
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Состояние запуска, общее для всех рабочих потоков
pub struct EngineBase<T> {
    future: OnceLock<Arc<FutureInterface<T>>>,
    pool: Arc<dyn TaskPool>,
    barrier: ThreadEngineBarrier,
    exception_store: ExceptionStore,
    metrics: Option<Arc<EngineMetrics>>,
    run_id: Uuid,
    spawning_allowed: AtomicBool,
    asynchronous: AtomicBool,
}

impl<T> EngineBase<T> {
    fn new(pool: Arc<dyn TaskPool>) -> Self {
        Self {
            future: OnceLock::new(),
            pool,
            barrier: ThreadEngineBarrier::new(),
            exception_store: ExceptionStore::default(),
            metrics: None,
            run_id: Uuid::new_v4(),
            spawning_allowed: AtomicBool::new(true),
            asynchronous: AtomicBool::new(false),
        }
    }

    fn future(&self) -> Option<&Arc<FutureInterface<T>>> {
        self.future.get()
    }

    /// Отмена через future или сохраненная ошибка
    fn is_canceled(&self) -> bool {
        self.exception_store.has_exception()
            || self.future().is_some_and(|future| future.is_canceled())
    }

    fn should_throttle_thread(&self) -> bool {
        self.future().is_some_and(|future| future.is_paused())
    }
}

impl<T> std::fmt::Debug for EngineBase<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineBase")
            .field("run_id", &self.run_id)
            .field("has_future", &self.future().is_some())
            .field("active_threads", &self.barrier.current_count())
            .field("has_exception", &self.exception_store.has_exception())
            .finish()
    }
}

/// То, что видит ядро изнутри рабочего потока
pub struct ThreadContext<'a, T> {
    base: &'a EngineBase<T>,
    spawn: &'a dyn Fn() -> bool,
}

impl<T> ThreadContext<'_, T> {
    pub fn is_canceled(&self) -> bool {
        self.base.is_canceled()
    }

    /// Блокирует, пока запуск на паузе
    pub fn wait_for_resume(&self) {
        if let Some(future) = self.base.future() {
            future.wait_for_resume();
        }
    }

    /// Попытка запустить еще один рабочий поток. `false`, если пул занят,
    /// запуск отменен или порождение потоков запрещено.
    pub fn start_thread(&self) -> bool {
        (self.spawn)()
    }

    pub fn should_throttle_thread(&self) -> bool {
        self.base.should_throttle_thread()
    }

    pub fn is_progress_reporting_enabled(&self) -> bool {
        self.base.future().is_some()
    }

    pub fn set_progress_range(&self, minimum: usize, maximum: usize) {
        if let Some(future) = self.base.future() {
            future.set_progress_range(minimum, maximum);
        }
    }

    pub fn set_progress_value(&self, value: usize) {
        if let Some(future) = self.base.future() {
            future.set_progress_value(value);
        }
    }

    pub fn report_result(&self, index: usize, result: T) {
        if let Some(future) = self.base.future() {
            future.report_result(Some(index), result);
        }
    }

    pub fn report_results(&self, index: usize, results: Vec<T>, total_count: usize) {
        if let Some(future) = self.base.future() {
            future.report_results(Some(index), results, total_count);
        }
    }

    pub fn set_filter_mode(&self, enable: bool) {
        if let Some(future) = self.base.future() {
            future.set_filter_mode(enable);
        }
    }

    pub fn max_thread_count(&self) -> usize {
        self.base.pool.max_thread_count()
    }

    pub fn metrics(&self) -> Option<&EngineMetrics> {
        self.base.metrics.as_deref()
    }

    pub fn run_id(&self) -> Uuid {
        self.base.run_id
    }
}

fn no_spawn() -> bool {
    false
}

/// Движок, выполняющий ядро `K`
pub struct ThreadEngine<K: EngineKernel> {
    base: EngineBase<K::Item>,
    kernel: K,
}

impl<K: EngineKernel> ThreadEngine<K> {
    pub fn new(kernel: K, pool: Arc<dyn TaskPool>) -> Self {
        Self {
            base: EngineBase::new(pool),
            kernel,
        }
    }

    /// Подключение future для результатов, прогресса, паузы и отмены
    pub fn with_future(mut self, future: Arc<FutureInterface<K::Item>>) -> Self {
        self.base.future = OnceLock::from(future);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<EngineMetrics>) -> Self {
        self.base.metrics = Some(metrics);
        self
    }

    pub fn kernel(&self) -> &K {
        &self.kernel
    }

    pub fn run_id(&self) -> Uuid {
        self.base.run_id
    }

    pub fn future(&self) -> Option<TaskFuture<K::Item>> {
        self.base.future().cloned().map(TaskFuture::new)
    }

    pub fn is_canceled(&self) -> bool {
        self.base.is_canceled()
    }

    /// Количество потоков, удерживающих барьер
    pub fn active_thread_count(&self) -> usize {
        self.base.barrier.current_count().unsigned_abs()
    }

    fn context<'a>(&'a self, spawn: &'a dyn Fn() -> bool) -> ThreadContext<'a, K::Item> {
        ThreadContext {
            base: &self.base,
            spawn,
        }
    }

    fn start(&self) {
        if let Some(metrics) = &self.base.metrics {
            metrics.record_run_started();
        }
        self.kernel.start(&self.context(&no_spawn));
    }

    /// Запуск в текущем потоке без пула
    pub fn start_single_threaded(&self) -> Result<()> {
        debug!(run_id = %self.base.run_id, "starting single-threaded run");
        self.base.spawning_allowed.store(false, Ordering::Release);
        if let Some(future) = self.base.future() {
            future.report_started();
        }
        self.start();

        let ctx = self.context(&no_spawn);
        loop {
            match self.guarded_thread_function(&ctx) {
                Ok(ThreadFunctionResult::ThreadFinished) => break,
                Ok(ThreadFunctionResult::ThrottleThread) => {}
                Err(error) => {
                    self.handle_exception(error);
                    break;
                }
            }
        }

        self.finish_blocking()
    }

    /// Запуск с ожиданием: управляющий поток работает наравне с рабочими
    pub fn start_blocking(self: &Arc<Self>) -> Result<()> {
        debug!(
            run_id = %self.base.run_id,
            max_threads = self.base.pool.max_thread_count(),
            "starting blocking run"
        );
        if let Some(future) = self.base.future() {
            future.report_started();
        }
        self.start();
        self.base.barrier.acquire();
        self.start_threads();

        let spawn = || self.start_thread_internal();
        let ctx = self.context(&spawn);
        let mut throttled = false;
        loop {
            match self.guarded_thread_function(&ctx) {
                Ok(ThreadFunctionResult::ThrottleThread) => {
                    if self.thread_throttle_exit() {
                        throttled = true;
                        break;
                    }
                }
                Ok(ThreadFunctionResult::ThreadFinished) => break,
                Err(error) => {
                    self.handle_exception(error);
                    break;
                }
            }
        }

        if !throttled {
            self.base.barrier.release();
        }
        self.base.barrier.wait();
        self.finish_blocking()
    }

    /// Асинхронный запуск. Если future не подключен, создается новый.
    pub fn start_asynchronously(self: Arc<Self>) -> TaskFuture<K::Item> {
        debug!(run_id = %self.base.run_id, "starting asynchronous run");
        let future = Arc::clone(
            self.base
                .future
                .get_or_init(|| Arc::new(FutureInterface::new())),
        );
        self.base.asynchronous.store(true, Ordering::Release);
        future.report_started();
        self.start();
        self.base.barrier.acquire();

        let pool = Arc::clone(&self.base.pool);
        pool.start(Box::new(move || self.run()));
        TaskFuture::new(future)
    }

    /// Тело задачи пула
    fn run(self: Arc<Self>) {
        if self.base.is_canceled() {
            self.thread_exit();
            return;
        }

        self.start_threads();

        let spawn = || self.start_thread_internal();
        let ctx = self.context(&spawn);
        loop {
            match self.guarded_thread_function(&ctx) {
                Ok(ThreadFunctionResult::ThrottleThread) => {
                    // Последний поток продолжает работу даже под давлением
                    if self.thread_throttle_exit() {
                        return;
                    }
                }
                Ok(ThreadFunctionResult::ThreadFinished) => break,
                Err(error) => {
                    self.handle_exception(error);
                    break;
                }
            }
        }

        self.thread_exit();
    }

    fn start_threads(self: &Arc<Self>) {
        let spawn = || self.start_thread_internal();
        let ctx = self.context(&spawn);
        while self.kernel.should_start_thread(&ctx) && self.start_thread_internal() {}
    }

    fn start_thread_internal(self: &Arc<Self>) -> bool {
        if !self.base.spawning_allowed.load(Ordering::Acquire) || self.base.is_canceled() {
            return false;
        }

        self.base.barrier.acquire();
        let engine = Arc::clone(self);
        if self.base.pool.try_start(Box::new(move || engine.run())) {
            if let Some(metrics) = &self.base.metrics {
                metrics.record_thread_started();
            }
            true
        } else {
            self.base.barrier.release();
            trace!(run_id = %self.base.run_id, "pool is saturated, not spawning");
            false
        }
    }

    fn thread_exit(&self) {
        let last_thread = self.base.barrier.release() == 0;
        if last_thread && self.base.asynchronous.load(Ordering::Acquire) {
            self.asynchronous_finish();
        }
    }

    fn thread_throttle_exit(&self) -> bool {
        let exited = self.base.barrier.release_unless_last();
        if exited {
            if let Some(metrics) = &self.base.metrics {
                metrics.record_thread_throttled();
            }
        }
        exited
    }

    fn guarded_thread_function(
        &self,
        ctx: &ThreadContext<'_, K::Item>,
    ) -> Result<ThreadFunctionResult> {
        match catch_unwind(AssertUnwindSafe(|| self.kernel.thread_function(ctx))) {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(error)) => Err(EngineError::from(error)),
            Err(payload) => Err(EngineError::from_panic(payload)),
        }
    }

    fn handle_exception(&self, error: EngineError) {
        warn!(run_id = %self.base.run_id, error = %error, "user algorithm failed, canceling run");
        self.base.exception_store.set_exception(error);
    }

    fn finish_blocking(&self) -> Result<()> {
        self.kernel.finish();
        let exception = self.base.exception_store.exception();
        if let Some(future) = self.base.future() {
            if let Some(error) = &exception {
                future.report_exception(error.clone());
            }
            future.report_finished();
        }

        match exception {
            Some(error) => {
                if let Some(metrics) = &self.base.metrics {
                    metrics.record_run_failed();
                }
                debug!(run_id = %self.base.run_id, "run failed");
                Err(error)
            }
            None => {
                debug!(run_id = %self.base.run_id, "run finished");
                Ok(())
            }
        }
    }

    fn asynchronous_finish(&self) {
        self.kernel.finish();
        if let Some(future) = self.base.future() {
            if let Some(error) = self.base.exception_store.exception() {
                if let Some(metrics) = &self.base.metrics {
                    metrics.record_run_failed();
                }
                future.report_exception(error);
            }
            future.report_finished();
        }
        debug!(run_id = %self.base.run_id, "asynchronous run finished");
    }
}

impl<K: EngineKernel + std::fmt::Debug> std::fmt::Debug for ThreadEngine<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadEngine")
            .field("base", &self.base)
            .field("kernel", &self.kernel)
            .finish()
    }
}
