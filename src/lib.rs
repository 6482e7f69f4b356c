/*!
# Concurrent Map Engine

Библиотека параллельного map/filter с адаптивным размером блока и сбором
результатов, приходящих не по порядку, в упорядоченную последовательность.

## Модули

- `engine` - барьер, менеджер размера блока, пул, движок потоков и ядро итерации
- `result_store` - разреженное упорядоченное хранилище результатов
- `future` - future/promise запуска: результаты, прогресс, пауза, отмена
- `map_filter` - готовые map/filter алгоритмы и функции запуска
- `config` - конфигурация движка
- `metrics` - сбор метрик
- `error` - ошибки движка

## Пример

```no_run
use concurrent_map_engine::{blocking_mapped, RayonTaskPool};

let pool = RayonTaskPool::new(4)?.into_shared();
let doubled = blocking_mapped(pool, (0..10).collect::<Vec<u32>>(), |x| Ok(x * 2))?;
assert_eq!(doubled, vec![0, 2, 4, 6, 8, 10, 12, 14, 16, 18]);
# Ok::<(), concurrent_map_engine::EngineError>(())
```
*/

pub mod config;
pub mod engine;
pub mod error;
pub mod future;
pub mod map_filter;
pub mod metrics;
pub mod result_store;

// Re-export основных типов
pub use config::EngineConfig;
pub use engine::{
    EngineKernel, IterateAlgorithm, IterateKernel, RayonTaskPool, TaskPool, ThreadEngine,
    ThreadFunctionResult,
};
pub use error::{EngineError, Result};
pub use future::{FutureInterface, TaskFuture};
pub use map_filter::{
    blocking_filtered, blocking_mapped, blocking_mapped_sequence, filtered, mapped,
    mapped_sequence, FilterAlgorithm, MapAlgorithm,
};
pub use metrics::EngineMetrics;
pub use result_store::ResultStore;

// Версия API
pub const API_VERSION: &str = env!("CARGO_PKG_VERSION");
