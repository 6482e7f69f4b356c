/*!
# Барьер активных потоков движка

Знаковый счетчик активных рабочих потоков плюс семафор для пробуждения
управляющего потока:

- `count > 0` - N активных потоков, никто не ждет
- `count < 0` - управляющий поток ждет, модуль равен числу активных потоков
- `count == 0` - активных потоков нет

Все операции над счетчиком выполняются CAS-циклом без блокировок.
*/

use std::sync::atomic::{AtomicIsize, Ordering};
use std::sync::{Condvar, Mutex, PoisonError};

/// Счетный семафор на Mutex + Condvar
#[derive(Debug, Default)]
pub struct Semaphore {
    permits: Mutex<usize>,
    available: Condvar,
}

impl Semaphore {
    pub fn new(permits: usize) -> Self {
        Self {
            permits: Mutex::new(permits),
            available: Condvar::new(),
        }
    }

    /// Захват одного разрешения с ожиданием
    pub fn acquire(&self) {
        let mut permits = self.permits.lock().unwrap_or_else(PoisonError::into_inner);
        while *permits == 0 {
            permits = self
                .available
                .wait(permits)
                .unwrap_or_else(PoisonError::into_inner);
        }
        *permits -= 1;
    }

    /// Возврат одного разрешения
    pub fn release(&self) {
        let mut permits = self.permits.lock().unwrap_or_else(PoisonError::into_inner);
        *permits += 1;
        self.available.notify_one();
    }

    pub fn available(&self) -> usize {
        *self.permits.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Барьер, отслеживающий количество активных рабочих потоков
#[derive(Debug, Default)]
pub struct ThreadEngineBarrier {
    count: AtomicIsize,
    semaphore: Semaphore,
}

impl ThreadEngineBarrier {
    pub fn new() -> Self {
        Self {
            count: AtomicIsize::new(0),
            semaphore: Semaphore::new(0),
        }
    }

    /// Регистрация еще одного активного потока с сохранением знака счетчика
    pub fn acquire(&self) {
        let mut local = self.count.load(Ordering::Acquire);
        loop {
            let next = if local < 0 { local - 1 } else { local + 1 };
            match self
                .count
                .compare_exchange_weak(local, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return,
                Err(actual) => local = actual,
            }
        }
    }

    /// Снятие одного активного потока.
    ///
    /// Возвращает оставшееся количество активных потоков. Последний поток при
    /// ожидающем управляющем потоке обнуляет счетчик и будит его.
    pub fn release(&self) -> usize {
        let mut local = self.count.load(Ordering::Acquire);
        loop {
            if local == -1 {
                match self
                    .count
                    .compare_exchange_weak(-1, 0, Ordering::AcqRel, Ordering::Acquire)
                {
                    Ok(_) => {
                        self.semaphore.release();
                        return 0;
                    }
                    Err(actual) => local = actual,
                }
            } else if local < 0 {
                match self.count.compare_exchange_weak(
                    local,
                    local + 1,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => return (local + 1).unsigned_abs(),
                    Err(actual) => local = actual,
                }
            } else {
                debug_assert!(local > 0, "barrier released more often than acquired");
                match self.count.compare_exchange_weak(
                    local,
                    local - 1,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => return (local - 1).unsigned_abs(),
                    Err(actual) => local = actual,
                }
            }
        }
    }

    /// Ожидание ухода всех активных потоков. Вызывается не более чем одним
    /// потоком одновременно.
    pub fn wait(&self) {
        let mut local = self.count.load(Ordering::Acquire);
        loop {
            if local == 0 {
                return;
            }
            debug_assert!(local > 0, "multiple waiters are not allowed");
            match self
                .count
                .compare_exchange_weak(local, -local, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    self.semaphore.acquire();
                    return;
                }
                Err(actual) => local = actual,
            }
        }
    }

    /// Текущее значение счетчика (со знаком)
    pub fn current_count(&self) -> isize {
        self.count.load(Ordering::Acquire)
    }

    /// Снятие потока, если он не последний. `false` - поток последний и
    /// должен продолжать работу.
    pub fn release_unless_last(&self) -> bool {
        let mut local = self.count.load(Ordering::Acquire);
        loop {
            if local.unsigned_abs() == 1 {
                return false;
            }
            let next = if local < 0 { local + 1 } else { local - 1 };
            match self
                .count
                .compare_exchange_weak(local, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return true,
                Err(actual) => local = actual,
            }
        }
    }
}
