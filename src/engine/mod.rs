/*!
# Исполнительное ядро

Примитивы и движок параллельной итерации:

- `barrier` - счетчик активных рабочих потоков с пробуждением управляющего
- `block_size` - адаптивный размер блока по медианам времени
- `pool` - возможности пула потоков, нужные движку
- `thread_engine` - три режима запуска пользовательского ядра
- `iterate_kernel` - стратегии обхода диапазона и отчет о результатах

```text
 TaskFuture <── FutureInterface <── ResultReporter
                      ^                   ^
                      |                   |
 ThreadEngine ── IterateKernel ── {IndexedRange | SequentialRange}
      |                                   |
 ThreadEngineBarrier              BlockSizeManager (на поток)
      |
   TaskPool
```
*/

pub mod barrier;
pub mod block_size;
pub mod iterate_kernel;
pub mod pool;
pub mod thread_engine;

pub use barrier::ThreadEngineBarrier;
pub use block_size::{BlockSizeManager, BlockSizeTuning};
pub use iterate_kernel::{
    IndexedRange, IndexedSource, IterateAlgorithm, IterateKernel, IterationRange, SequentialRange,
};
pub use pool::{RayonTaskPool, TaskPool};
pub use thread_engine::{EngineKernel, ThreadContext, ThreadEngine, ThreadFunctionResult};
