/*!
# Concurrent Map Engine

Демонстрационный запуск движка параллельного map/filter на синтетической
нагрузке.

## Режимы

- **blocking** - управляющий поток ждет и работает вместе с пулом
- **async** - запуск через future, ожидание из tokio
- **single-threaded** - все итерации в текущем потоке
- **filter** - отбор элементов с сохранением порядка
- **sequential** - однопроходный итератор, стратегия одного курсора
- **cancel** - асинхронный запуск с отменой на середине

По завершении печатается JSON отчет и, если метрики включены, метрики в
формате Prometheus.

*/

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::{DateTime, Utc};
use clap::Parser;
use serde::Serialize;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

use concurrent_map_engine::engine::{IterateAlgorithm, IterationRange};
use concurrent_map_engine::{
    EngineConfig, EngineKernel, EngineMetrics, FilterAlgorithm, FutureInterface, IterateKernel,
    MapAlgorithm, RayonTaskPool, TaskPool, ThreadEngine,
};

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[cfg(feature = "jemalloc")]
#[global_allocator]
static GLOBAL: jemallocator::Jemalloc = jemallocator::Jemalloc;

/// Аргументы командной строки
#[derive(Parser, Debug)]
#[command(name = "concurrent-map-engine")]
#[command(about = "Adaptive block-size parallel map/filter engine")]
#[command(version)]
struct Args {
    /// Путь к файлу конфигурации
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Уровень логирования
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Режим работы
    #[arg(short, long, default_value = "blocking")]
    mode: RunMode,

    /// Количество элементов
    #[arg(short, long, default_value_t = 10_000)]
    items: u64,

    /// Количество потоков пула (перекрывает конфигурацию)
    #[arg(short, long)]
    threads: Option<usize>,

    /// Имитация пользовательской работы на элемент, микросекунды
    #[arg(short, long, default_value_t = 0)]
    work_us: u64,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum, Serialize)]
#[serde(rename_all = "kebab-case")]
enum RunMode {
    /// Блокирующий запуск
    Blocking,
    /// Асинхронный запуск
    Async,
    /// Однопоточный запуск
    SingleThreaded,
    /// Фильтрация
    Filter,
    /// Однопроходная последовательность
    Sequential,
    /// Отмена на середине
    Cancel,
}

/// Отчет о запуске
#[derive(Debug, Serialize)]
struct RunReport {
    run_id: String,
    mode: RunMode,
    items: u64,
    threads: usize,
    results: usize,
    checksum: u64,
    progress: usize,
    canceled: bool,
    elapsed_ms: f64,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
}

/// Итог выполнения одного движка
struct RunOutcome {
    run_id: String,
    results: Vec<u64>,
    progress: usize,
    canceled: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = if Path::new(&args.config).exists() {
        EngineConfig::load(&args.config)?
    } else {
        EngineConfig::default()
    };
    if let Some(threads) = args.threads {
        config.pool.max_threads = threads;
    }
    config.validate()?;

    // Инициализация логирования
    init_logging(&args.log_level, &config.logging.directory)?;

    info!(
        "🦀 Запуск Concurrent Map Engine v{}",
        env!("CARGO_PKG_VERSION")
    );
    if !Path::new(&args.config).exists() {
        warn!("⚠️ Файл {} не найден, используется конфигурация по умолчанию", args.config);
    }

    info!("🎯 Режим работы: {:?}", args.mode);
    match run(&args, &config).await {
        Ok(()) => {
            info!("✅ Программа завершена успешно");
            Ok(())
        }
        Err(e) => {
            error!("❌ Ошибка запуска: {}", e);
            Err(e)
        }
    }
}

/// Инициализация системы логирования
fn init_logging(level: &str, directory: &str) -> Result<()> {
    let level = level
        .parse::<tracing::Level>()
        .map_err(|e| anyhow::anyhow!("Неверный уровень логирования: {}", e))?;

    // Создаём директорию для логов если её нет
    std::fs::create_dir_all(directory)
        .map_err(|e| anyhow::anyhow!("Не удалось создать директорию {}: {}", directory, e))?;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level.to_string()));

    let file_appender = tracing_appender::rolling::never(directory, "concurrent_map.log");
    let error_appender = tracing_appender::rolling::never(directory, "concurrent_map_error.log");

    // Слой для консоли
    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stdout)
        .with_target(false)
        .with_ansi(false);

    // Слой для файла
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(file_appender)
        .with_target(true)
        .with_ansi(false);

    // Слой для ошибок
    let error_layer = tracing_subscriber::fmt::layer()
        .with_writer(error_appender)
        .with_target(true)
        .with_ansi(false)
        .with_filter(tracing_subscriber::filter::LevelFilter::ERROR);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .with(file_layer)
        .with(error_layer)
        .init();

    Ok(())
}

/// Синтетическая пользовательская работа
fn simulate_work(work_us: u64) {
    if work_us > 0 {
        std::thread::sleep(Duration::from_micros(work_us));
    }
}

async fn run(args: &Args, config: &EngineConfig) -> Result<()> {
    let pool = RayonTaskPool::from_config(&config.pool)?.into_shared();
    let metrics = if config.metrics.enabled {
        Some(Arc::new(EngineMetrics::new()?))
    } else {
        None
    };

    info!(
        "🔧 Пул на {} потоков, {} элементов, {} мкс на элемент",
        pool.max_thread_count(),
        args.items,
        args.work_us
    );

    let work_us = args.work_us;
    let items: Vec<u64> = (0..args.items).collect();
    let double = MapAlgorithm::new(move |x: &u64| {
        simulate_work(work_us);
        Ok(x * 2)
    });

    let started_at = Utc::now();
    let timer = Instant::now();

    let outcome = match args.mode {
        RunMode::Blocking | RunMode::SingleThreaded | RunMode::Async | RunMode::Cancel => {
            let kernel = configure(IterateKernel::indexed(items, double), config);
            execute(kernel, args.mode, &pool, metrics.as_ref()).await?
        }
        RunMode::Filter => {
            let keep = FilterAlgorithm::new(move |x: &u64| {
                simulate_work(work_us);
                Ok(x % 3 == 0)
            });
            let kernel = configure(IterateKernel::indexed(items, keep), config);
            execute(kernel, RunMode::Blocking, &pool, metrics.as_ref()).await?
        }
        RunMode::Sequential => {
            let kernel = configure(IterateKernel::sequential(items, double), config);
            execute(kernel, RunMode::Blocking, &pool, metrics.as_ref()).await?
        }
    };

    let elapsed = timer.elapsed();
    let report = RunReport {
        run_id: outcome.run_id,
        mode: args.mode,
        items: args.items,
        threads: pool.max_thread_count(),
        results: outcome.results.len(),
        checksum: outcome.results.iter().fold(0u64, |acc, x| acc.wrapping_add(*x)),
        progress: outcome.progress,
        canceled: outcome.canceled,
        elapsed_ms: elapsed.as_secs_f64() * 1000.0,
        started_at,
        finished_at: Utc::now(),
    };

    info!(
        "📊 Готово: {} результатов за {:.2} мс",
        report.results, report.elapsed_ms
    );
    println!("{}", serde_json::to_string_pretty(&report)?);

    if let Some(metrics) = &metrics {
        println!("{}", metrics.export_metrics()?);
    }

    Ok(())
}

fn configure<R, A>(kernel: IterateKernel<R, A>, config: &EngineConfig) -> IterateKernel<R, A>
where
    R: IterationRange,
    A: IterateAlgorithm<R::Item>,
{
    kernel
        .with_tuning(config.block_size.tuning())
        .with_vector_threshold(config.reporting.vector_threshold)
}

async fn execute<K>(
    kernel: K,
    mode: RunMode,
    pool: &Arc<dyn TaskPool>,
    metrics: Option<&Arc<EngineMetrics>>,
) -> Result<RunOutcome>
where
    K: EngineKernel<Item = u64>,
{
    let future = Arc::new(FutureInterface::new());
    let mut engine = ThreadEngine::new(kernel, Arc::clone(pool)).with_future(Arc::clone(&future));
    if let Some(metrics) = metrics {
        engine = engine.with_metrics(Arc::clone(metrics));
    }
    let engine = Arc::new(engine);
    let run_id = engine.run_id().to_string();

    match mode {
        RunMode::SingleThreaded => engine.start_single_threaded()?,
        RunMode::Async => {
            let handle = Arc::clone(&engine).start_asynchronously();
            handle.finished().await?;
        }
        RunMode::Cancel => {
            let handle = Arc::clone(&engine).start_asynchronously();
            let target = handle.progress_maximum() / 4;
            while !handle.is_finished() && handle.progress_value() < target {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            info!("🛑 Отмена на прогрессе {}", handle.progress_value());
            handle.cancel();
            handle.finished().await?;
        }
        _ => engine.start_blocking()?,
    }

    Ok(RunOutcome {
        run_id,
        progress: future.progress_value(),
        canceled: future.is_canceled(),
        results: future.take_results(),
    })
}
