/*!
# Future/promise для запусков движка

[`FutureInterface`] - сторона, в которую движок сообщает о старте, результатах,
прогрессе, ошибке и завершении. [`TaskFuture`] - клонируемый дескриптор
вызывающей стороны: отмена, пауза, ожидание и чтение результатов.

Флаги состояния хранятся в одном атомарном слове, чтобы горячий путь
(`is_canceled` на каждый батч) не брал блокировку. Хранилище результатов,
прогресс и ошибка живут под мьютексом интерфейса: это и есть внешняя
синхронизация, которой требует [`ResultStore`].
*/

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;

use crate::error::{EngineError, Result};
use crate::result_store::ResultStore;

const STARTED: u32 = 1 << 0;
const FINISHED: u32 = 1 << 1;
const CANCELED: u32 = 1 << 2;
const PAUSED: u32 = 1 << 3;

#[derive(Debug)]
struct FutureData<T> {
    store: ResultStore<T>,
    progress_minimum: usize,
    progress_maximum: usize,
    progress_value: usize,
    exception: Option<EngineError>,
}

/// Сторона движка: прием результатов и управление состоянием
#[derive(Debug)]
pub struct FutureInterface<T> {
    state: AtomicU32,
    data: Mutex<FutureData<T>>,
    pause_condition: Condvar,
    results_ready: Condvar,
    finished_tx: watch::Sender<bool>,
}

impl<T> Default for FutureInterface<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> FutureInterface<T> {
    pub fn new() -> Self {
        let (finished_tx, _) = watch::channel(false);
        Self {
            state: AtomicU32::new(0),
            data: Mutex::new(FutureData {
                store: ResultStore::new(),
                progress_minimum: 0,
                progress_maximum: 0,
                progress_value: 0,
                exception: None,
            }),
            pause_condition: Condvar::new(),
            results_ready: Condvar::new(),
            finished_tx,
        }
    }

    fn lock(&self) -> MutexGuard<'_, FutureData<T>> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn has_state(&self, flags: u32) -> bool {
        self.state.load(Ordering::Acquire) & flags != 0
    }

    pub fn is_started(&self) -> bool {
        self.has_state(STARTED)
    }

    pub fn is_finished(&self) -> bool {
        self.has_state(FINISHED)
    }

    pub fn is_canceled(&self) -> bool {
        self.has_state(CANCELED)
    }

    pub fn is_paused(&self) -> bool {
        self.has_state(PAUSED)
    }

    pub fn report_started(&self) {
        let _data = self.lock();
        self.state.fetch_or(STARTED, Ordering::AcqRel);
    }

    /// Результат с логическим индексом (`None` - в конец)
    pub fn report_result(&self, index: Option<usize>, result: T) {
        let mut data = self.lock();
        if self.has_state(CANCELED | FINISHED) {
            return;
        }
        data.store.add_result(index, result);
        self.results_ready.notify_all();
    }

    /// Батч результатов; `total_count` - сколько логических слотов он покрывает
    pub fn report_results(&self, index: Option<usize>, results: Vec<T>, total_count: usize) {
        let mut data = self.lock();
        if self.has_state(CANCELED | FINISHED) {
            return;
        }
        data.store.add_results(index, results, total_count);
        self.results_ready.notify_all();
    }

    /// Сохранение ошибки запуска; запуск считается отмененным
    pub fn report_exception(&self, error: EngineError) {
        let mut data = self.lock();
        if self.has_state(CANCELED | FINISHED) {
            return;
        }
        data.exception = Some(error);
        self.switch_to_canceled();
        self.results_ready.notify_all();
    }

    pub fn report_finished(&self) {
        {
            let _data = self.lock();
            if self.has_state(FINISHED) {
                return;
            }
            self.state.fetch_or(FINISHED, Ordering::AcqRel);
            self.results_ready.notify_all();
        }
        self.finished_tx.send_replace(true);
    }

    pub fn cancel(&self) {
        let _data = self.lock();
        if self.has_state(CANCELED) {
            return;
        }
        self.switch_to_canceled();
        self.results_ready.notify_all();
    }

    fn switch_to_canceled(&self) {
        self.state.fetch_and(!PAUSED, Ordering::AcqRel);
        self.state.fetch_or(CANCELED, Ordering::AcqRel);
        self.pause_condition.notify_all();
    }

    pub fn set_paused(&self, paused: bool) {
        let _data = self.lock();
        if paused {
            self.state.fetch_or(PAUSED, Ordering::AcqRel);
        } else {
            self.state.fetch_and(!PAUSED, Ordering::AcqRel);
            self.pause_condition.notify_all();
        }
    }

    pub fn toggle_paused(&self) {
        self.set_paused(!self.is_paused());
    }

    /// Точка кооперативной приостановки: блокирует, пока запуск на паузе и не
    /// отменен
    pub fn wait_for_resume(&self) {
        if !self.is_paused() || self.is_canceled() {
            return;
        }

        let mut data = self.lock();
        while self.is_paused() && !self.is_canceled() {
            data = self
                .pause_condition
                .wait(data)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    pub fn set_progress_range(&self, minimum: usize, maximum: usize) {
        let mut data = self.lock();
        data.progress_minimum = minimum;
        data.progress_maximum = maximum.max(minimum);
        data.progress_value = minimum;
    }

    /// Прогресс только растет и не меняется после отмены или завершения
    pub fn set_progress_value(&self, value: usize) {
        let mut data = self.lock();
        if self.has_state(CANCELED | FINISHED) || value <= data.progress_value {
            return;
        }
        data.progress_value = value;
    }

    pub fn progress_value(&self) -> usize {
        self.lock().progress_value
    }

    pub fn progress_minimum(&self) -> usize {
        self.lock().progress_minimum
    }

    pub fn progress_maximum(&self) -> usize {
        self.lock().progress_maximum
    }

    pub fn set_filter_mode(&self, enable: bool) {
        self.lock().store.set_filter_mode(enable);
    }

    pub fn filter_mode(&self) -> bool {
        self.lock().store.filter_mode()
    }

    /// Длина готового непрерывного префикса результатов
    pub fn result_count(&self) -> usize {
        self.lock().store.count()
    }

    /// Ошибка запуска, если была
    pub fn exception(&self) -> Option<EngineError> {
        self.lock().exception.clone()
    }

    /// Ожидание завершения запуска
    pub fn wait_for_finished(&self) -> Result<()> {
        let mut data = self.lock();
        while !self.is_finished() {
            data = self
                .results_ready
                .wait(data)
                .unwrap_or_else(PoisonError::into_inner);
        }
        match &data.exception {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    /// Асинхронное ожидание завершения
    pub async fn finished(&self) -> Result<()> {
        let mut rx = self.finished_tx.subscribe();
        // Канал живет вместе с интерфейсом, закрыться он не может
        let _ = rx.wait_for(|finished| *finished).await;
        match self.exception() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Извлечение всех результатов в порядке индексов
    pub fn take_results(&self) -> Vec<T> {
        self.lock().store.take_results()
    }
}

impl<T: Clone> FutureInterface<T> {
    /// Ожидание результата с индексом `index`. `None`, если запуск завершился
    /// или отменен без этого результата.
    pub fn wait_for_result(&self, index: usize) -> Option<T> {
        let mut data = self.lock();
        loop {
            if let Some(value) = data.store.get(index) {
                return Some(value.clone());
            }
            if self.has_state(FINISHED | CANCELED) {
                return None;
            }
            data = self
                .results_ready
                .wait(data)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Копия текущих результатов в порядке индексов
    pub fn results(&self) -> Vec<T> {
        self.lock().store.to_vec()
    }
}

/// Дескриптор запуска для вызывающей стороны
#[derive(Debug)]
pub struct TaskFuture<T> {
    interface: Arc<FutureInterface<T>>,
}

impl<T> Clone for TaskFuture<T> {
    fn clone(&self) -> Self {
        Self {
            interface: Arc::clone(&self.interface),
        }
    }
}

impl<T> TaskFuture<T> {
    pub fn new(interface: Arc<FutureInterface<T>>) -> Self {
        Self { interface }
    }

    pub fn interface(&self) -> &Arc<FutureInterface<T>> {
        &self.interface
    }

    pub fn cancel(&self) {
        self.interface.cancel();
    }

    pub fn pause(&self) {
        self.interface.set_paused(true);
    }

    pub fn resume(&self) {
        self.interface.set_paused(false);
    }

    pub fn toggle_paused(&self) {
        self.interface.toggle_paused();
    }

    pub fn is_started(&self) -> bool {
        self.interface.is_started()
    }

    pub fn is_finished(&self) -> bool {
        self.interface.is_finished()
    }

    pub fn is_canceled(&self) -> bool {
        self.interface.is_canceled()
    }

    pub fn is_paused(&self) -> bool {
        self.interface.is_paused()
    }

    pub fn progress_value(&self) -> usize {
        self.interface.progress_value()
    }

    pub fn progress_minimum(&self) -> usize {
        self.interface.progress_minimum()
    }

    pub fn progress_maximum(&self) -> usize {
        self.interface.progress_maximum()
    }

    pub fn result_count(&self) -> usize {
        self.interface.result_count()
    }

    pub fn wait_for_finished(&self) -> Result<()> {
        self.interface.wait_for_finished()
    }

    pub async fn finished(&self) -> Result<()> {
        self.interface.finished().await
    }

    /// Ожидание завершения и извлечение результатов
    pub fn take_results(&self) -> Result<Vec<T>> {
        self.wait_for_finished()?;
        Ok(self.interface.take_results())
    }
}

impl<T: Clone> TaskFuture<T> {
    pub fn wait_for_result(&self, index: usize) -> Option<T> {
        self.interface.wait_for_result(index)
    }

    /// Ожидание завершения и копия результатов
    pub fn results(&self) -> Result<Vec<T>> {
        self.wait_for_finished()?;
        Ok(self.interface.results())
    }
}
