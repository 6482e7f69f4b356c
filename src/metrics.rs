/*!
# Метрики движка

Сбор и экспорт метрик в формате Prometheus:
- Запуски и неудачные запуски
- Запущенные и отпущенные (throttled) рабочие потоки
- Захваченные батчи и выполненные итерации
- Распределение размеров блоков

*/

use anyhow::Result;
use prometheus::{Counter, Encoder, Histogram, HistogramOpts, Opts, Registry, TextEncoder};

/// Сборщик метрик движка
#[derive(Debug, Clone)]
pub struct EngineMetrics {
    /// Prometheus registry
    registry: Registry,

    /// Счетчики запусков
    runs_total: Counter,
    runs_failed: Counter,

    /// Рабочие потоки
    threads_started: Counter,
    threads_throttled: Counter,

    /// Работа
    batches_claimed: Counter,
    iterations_completed: Counter,

    /// Размеры блоков
    block_size: Histogram,
}

impl EngineMetrics {
    /// Создание нового сборщика метрик
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let runs_total = Counter::with_opts(Opts::new(
            "engine_runs_total",
            "Total number of engine runs",
        ))?;

        let runs_failed = Counter::with_opts(Opts::new(
            "engine_runs_failed_total",
            "Total number of engine runs that ended with an error",
        ))?;

        let threads_started = Counter::with_opts(Opts::new(
            "engine_threads_started_total",
            "Total number of worker threads admitted by the pool",
        ))?;

        let threads_throttled = Counter::with_opts(Opts::new(
            "engine_threads_throttled_total",
            "Total number of worker threads that exited on throttle",
        ))?;

        let batches_claimed = Counter::with_opts(Opts::new(
            "engine_batches_claimed_total",
            "Total number of claimed index batches",
        ))?;

        let iterations_completed = Counter::with_opts(Opts::new(
            "engine_iterations_completed_total",
            "Total number of processed iterations",
        ))?;

        let block_size = Histogram::with_opts(
            HistogramOpts::new("engine_block_size", "Size of claimed index batches")
                .buckets(vec![1.0, 2.0, 4.0, 8.0, 16.0, 64.0, 256.0, 1024.0, 4096.0]),
        )?;

        registry.register(Box::new(runs_total.clone()))?;
        registry.register(Box::new(runs_failed.clone()))?;
        registry.register(Box::new(threads_started.clone()))?;
        registry.register(Box::new(threads_throttled.clone()))?;
        registry.register(Box::new(batches_claimed.clone()))?;
        registry.register(Box::new(iterations_completed.clone()))?;
        registry.register(Box::new(block_size.clone()))?;

        Ok(Self {
            registry,
            runs_total,
            runs_failed,
            threads_started,
            threads_throttled,
            batches_claimed,
            iterations_completed,
            block_size,
        })
    }

    pub fn record_run_started(&self) {
        self.runs_total.inc();
    }

    pub fn record_run_failed(&self) {
        self.runs_failed.inc();
    }

    pub fn record_thread_started(&self) {
        self.threads_started.inc();
    }

    pub fn record_thread_throttled(&self) {
        self.threads_throttled.inc();
    }

    /// Запись захваченного батча
    pub fn record_batch(&self, size: usize) {
        self.batches_claimed.inc();
        self.iterations_completed.inc_by(size as f64);
        self.block_size.observe(size as f64);
    }

    pub fn runs_total(&self) -> u64 {
        self.runs_total.get() as u64
    }

    pub fn runs_failed(&self) -> u64 {
        self.runs_failed.get() as u64
    }

    pub fn threads_started(&self) -> u64 {
        self.threads_started.get() as u64
    }

    pub fn threads_throttled(&self) -> u64 {
        self.threads_throttled.get() as u64
    }

    pub fn batches_claimed(&self) -> u64 {
        self.batches_claimed.get() as u64
    }

    pub fn iterations_completed(&self) -> u64 {
        self.iterations_completed.get() as u64
    }

    /// Экспорт метрик в формате Prometheus
    pub fn export_metrics(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}
