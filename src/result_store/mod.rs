/*!
# Хранилище результатов

Разреженное упорядоченное отображение `начальный индекс -> результат или
непрерывный батч результатов`. Рабочие потоки завершают батчи в произвольном
порядке, а читатель видит результаты в порядке индексов.

## Инварианты

- `count()` равен длине максимального непрерывного префикса `[0, count)`;
  результаты за разрывом хранятся, доступны через `result_at`, но не считаются
- `insert_index` - следующий индекс для добавления без явного индекса
- в режиме фильтрации отброшенные элементы не занимают места, но учитываются
  в `filtered_count()`, поэтому индексная арифметика остается непрерывной

Хранилище не синхронизировано: запись должна быть сериализована снаружи
(см. [`crate::future::FutureInterface`]).
*/

mod iterator;

pub use iterator::ResultIter;

use std::collections::BTreeMap;

/// Элемент хранилища
#[derive(Debug, Clone, PartialEq)]
pub enum ResultItem<T> {
    /// Одиночный результат
    Single(T),

    /// Непрерывный батч результатов
    Batch(Vec<T>),

    /// Отфильтрованные слоты без данных (только в очереди ожидания)
    Filtered(usize),
}

impl<T> ResultItem<T> {
    /// Количество логических слотов, которые занимает элемент
    pub fn count(&self) -> usize {
        match self {
            Self::Single(_) => 1,
            Self::Batch(values) => values.len(),
            Self::Filtered(count) => *count,
        }
    }

    pub fn is_vector(&self) -> bool {
        !matches!(self, Self::Single(_))
    }

    /// Элемент несет данные
    pub fn is_valid(&self) -> bool {
        !matches!(self, Self::Filtered(_))
    }

    pub(crate) fn get(&self, offset: usize) -> Option<&T> {
        match self {
            Self::Single(value) if offset == 0 => Some(value),
            Self::Batch(values) => values.get(offset),
            _ => None,
        }
    }
}

/// Упорядоченное хранилище результатов
#[derive(Debug, Clone)]
pub struct ResultStore<T> {
    results: BTreeMap<usize, ResultItem<T>>,
    pending_results: BTreeMap<usize, ResultItem<T>>,
    insert_index: usize,
    result_count: usize,
    filtered_results: usize,
    filter_mode: bool,
}

impl<T> Default for ResultStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ResultStore<T> {
    pub fn new() -> Self {
        Self {
            results: BTreeMap::new(),
            pending_results: BTreeMap::new(),
            insert_index: 0,
            result_count: 0,
            filtered_results: 0,
            filter_mode: false,
        }
    }

    pub fn set_filter_mode(&mut self, enable: bool) {
        self.filter_mode = enable;
    }

    pub fn filter_mode(&self) -> bool {
        self.filter_mode
    }

    /// Добавление одного результата. `None` - добавить в конец.
    ///
    /// Возвращает логический индекс вставки.
    pub fn add_result(&mut self, index: Option<usize>, result: T) -> usize {
        self.insert_result_item(index, ResultItem::Single(result))
    }

    /// Добавление батча. `total_count` - сколько логических слотов покрывает
    /// батч; в режиме фильтрации разница с `results.len()` считается отброшенной.
    pub fn add_results(&mut self, index: Option<usize>, results: Vec<T>, total_count: usize) -> usize {
        let vector_size = results.len();
        if !self.filter_mode || vector_size == total_count {
            if vector_size == 0 {
                return index.unwrap_or(self.insert_index);
            }
            return self.insert_result_item(index, ResultItem::Batch(results));
        }

        let begin = index.unwrap_or(self.insert_index);
        if vector_size > 0 {
            self.insert_result_item(Some(begin), ResultItem::Batch(results));
        }
        let filtered_away = ResultItem::Filtered(total_count.saturating_sub(vector_size));
        self.insert_result_item(Some(begin + vector_size), filtered_away)
    }

    /// Итератор на элемент с индексом `index` или конечный итератор, если
    /// индекс попадает в разрыв
    pub fn result_at(&self, index: usize) -> ResultIter<'_, T> {
        let Some((&key, item)) = self.results.range(..=index).next_back() else {
            return self.end();
        };

        let vector_index = index - key;
        if vector_index >= item.count() || (!item.is_vector() && vector_index != 0) {
            return self.end();
        }
        ResultIter::new(&self.results, Some(key), vector_index)
    }

    pub fn contains(&self, index: usize) -> bool {
        !self.result_at(index).is_end()
    }

    /// Значение по индексу
    pub fn get(&self, index: usize) -> Option<&T> {
        self.result_at(index).value()
    }

    /// Длина непрерывного префикса результатов
    pub fn count(&self) -> usize {
        self.result_count
    }

    pub fn begin(&self) -> ResultIter<'_, T> {
        ResultIter::new(&self.results, self.results.keys().next().copied(), 0)
    }

    pub fn end(&self) -> ResultIter<'_, T> {
        ResultIter::new(&self.results, None, 0)
    }

    pub fn iter(&self) -> ResultIter<'_, T> {
        self.begin()
    }

    pub fn has_next_result(&self) -> bool {
        !self.results.is_empty()
    }

    pub fn insert_index(&self) -> usize {
        self.insert_index
    }

    /// Количество отброшенных логических слотов
    pub fn filtered_count(&self) -> usize {
        self.filtered_results
    }

    /// Количество элементов в очереди ожидания
    pub fn pending_count(&self) -> usize {
        self.pending_results.len()
    }

    pub fn clear(&mut self) {
        self.results.clear();
        self.pending_results.clear();
        self.insert_index = 0;
        self.result_count = 0;
        self.filtered_results = 0;
    }

    /// Извлечение всех сохраненных результатов в порядке индексов
    pub fn take_results(&mut self) -> Vec<T> {
        let results = std::mem::take(&mut self.results);
        self.clear();
        let mut flat = Vec::new();
        for item in results.into_values() {
            match item {
                ResultItem::Single(value) => flat.push(value),
                ResultItem::Batch(values) => flat.extend(values),
                ResultItem::Filtered(_) => {}
            }
        }
        flat
    }

    fn insert_result_item(&mut self, index: Option<usize>, item: ResultItem<T>) -> usize {
        let store_index = match index {
            Some(index) if self.filter_mode && index > self.insert_index => {
                self.pending_results.insert(index, item);
                index
            }
            _ => {
                let store_index = self.update_insert_index(index, item.count());
                self.insert_result_item_if_valid(store_index, item);
                store_index
            }
        };
        self.sync_pending_results();
        store_index
    }

    fn update_insert_index(&mut self, index: Option<usize>, count: usize) -> usize {
        match index {
            None => {
                let index = self.insert_index;
                self.insert_index += count;
                index
            }
            Some(index) => {
                self.insert_index = self.insert_index.max(index + count);
                index
            }
        }
    }

    fn insert_result_item_if_valid(&mut self, store_index: usize, item: ResultItem<T>) {
        if item.is_valid() {
            // В режиме фильтрации отброшенные слоты не занимают места
            let key = store_index.saturating_sub(self.filtered_results);
            self.results.insert(key, item);
            self.sync_result_count();
        } else {
            self.filtered_results += item.count();
        }
    }

    /// Перенос из очереди ожидания всего, что стало непрерывным
    fn sync_pending_results(&mut self) {
        while let Some(entry) = self.pending_results.first_entry() {
            if *entry.key() != self.result_count + self.filtered_results {
                break;
            }
            let (index, item) = entry.remove_entry();
            let store_index = self.update_insert_index(Some(index), item.count());
            self.insert_result_item_if_valid(store_index, item);
        }
    }

    fn sync_result_count(&mut self) {
        loop {
            let it = self.result_at(self.result_count);
            if it.is_end() {
                break;
            }
            let step = it.batch_size() - it.vector_index();
            self.result_count += step;
        }
    }
}

impl<T: Clone> ResultStore<T> {
    /// Копия результатов в порядке индексов
    pub fn to_vec(&self) -> Vec<T> {
        self.iter().cloned().collect()
    }
}
