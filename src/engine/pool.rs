/*!
# Пул потоков

Движок получает пул явно, через трейт [`TaskPool`]: глобального пула по
умолчанию нет. [`RayonTaskPool`] реализует его поверх `rayon::ThreadPool`
со счетчиком активных задач, что дает неблокирующий `try_start`.
*/

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::config::PoolConfig;
use crate::error::{EngineError, Result};

/// Задача пула
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Возможности пула, которые потребляет движок
pub trait TaskPool: Send + Sync {
    /// Неблокирующий запуск: `false`, если все потоки пула заняты
    fn try_start(&self, task: Task) -> bool;

    /// Запуск с постановкой в очередь, если свободных потоков нет
    fn start(&self, task: Task);

    /// Максимальное количество одновременно работающих задач
    fn max_thread_count(&self) -> usize;
}

/// Пул на основе rayon
pub struct RayonTaskPool {
    pool: rayon::ThreadPool,
    max_thread_count: usize,
    active: Arc<AtomicUsize>,
}

/// Уменьшает счетчик активных задач при выходе из задачи, в том числе при панике
struct ActiveGuard(Arc<AtomicUsize>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl RayonTaskPool {
    /// Создание пула на `max_threads` потоков
    pub fn new(max_threads: usize) -> Result<Self> {
        Self::with_thread_name(max_threads, "engine-worker")
    }

    pub fn from_config(config: &PoolConfig) -> Result<Self> {
        Self::with_thread_name(config.max_threads, &config.thread_name_prefix)
    }

    fn with_thread_name(max_threads: usize, prefix: &str) -> Result<Self> {
        if max_threads == 0 {
            return Err(EngineError::Pool(
                "pool needs at least one thread".to_string(),
            ));
        }

        let prefix = prefix.to_string();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(max_threads)
            .thread_name(move |i| format!("{}-{}", prefix, i))
            .build()
            .map_err(|e| EngineError::Pool(format!("failed to create thread pool: {}", e)))?;

        debug!(max_threads, "thread pool created");

        Ok(Self {
            pool,
            max_thread_count: max_threads,
            active: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Количество задач, запущенных и еще не завершившихся
    pub fn active_thread_count(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Упаковка в trait object для передачи движку
    pub fn into_shared(self) -> Arc<dyn TaskPool> {
        Arc::new(self)
    }

    fn spawn_counted(&self, task: Task) {
        let guard = ActiveGuard(Arc::clone(&self.active));
        self.pool.spawn(move || {
            let _guard = guard;
            task();
        });
    }
}

impl TaskPool for RayonTaskPool {
    fn try_start(&self, task: Task) -> bool {
        let mut active = self.active.load(Ordering::Acquire);
        loop {
            if active >= self.max_thread_count {
                return false;
            }
            match self.active.compare_exchange_weak(
                active,
                active + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => active = actual,
            }
        }
        self.spawn_counted(task);
        true
    }

    fn start(&self, task: Task) {
        self.active.fetch_add(1, Ordering::AcqRel);
        self.spawn_counted(task);
    }

    fn max_thread_count(&self) -> usize {
        self.max_thread_count
    }
}

impl std::fmt::Debug for RayonTaskPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RayonTaskPool")
            .field("max_thread_count", &self.max_thread_count)
            .field("active", &self.active_thread_count())
            .finish()
    }
}
