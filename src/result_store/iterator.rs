/*!
# Итератор хранилища результатов

Обход [`ResultStore`](super::ResultStore) в порядке индексов. Позиция
задается ключом записи в карте и смещением внутри батча этой записи.
*/

use std::collections::BTreeMap;
use std::ops::Bound;

use super::ResultItem;

/// Позиция в хранилище результатов. `key == None` - конечная позиция.
pub struct ResultIter<'a, T> {
    results: &'a BTreeMap<usize, ResultItem<T>>,
    key: Option<usize>,
    vector_index: usize,
}

impl<'a, T> ResultIter<'a, T> {
    pub(super) fn new(
        results: &'a BTreeMap<usize, ResultItem<T>>,
        key: Option<usize>,
        vector_index: usize,
    ) -> Self {
        Self {
            results,
            key,
            vector_index,
        }
    }

    fn item(&self) -> Option<&'a ResultItem<T>> {
        self.key.and_then(|key| self.results.get(&key))
    }

    pub fn is_end(&self) -> bool {
        self.key.is_none()
    }

    /// Смещение внутри текущего батча
    pub fn vector_index(&self) -> usize {
        self.vector_index
    }

    /// Число результатов в текущей записи, 0 в конце
    pub fn batch_size(&self) -> usize {
        self.item().map_or(0, ResultItem::count)
    }

    pub fn is_vector(&self) -> bool {
        self.item().is_some_and(ResultItem::is_vector)
    }

    pub fn can_increment_vector_index(&self) -> bool {
        self.vector_index + 1 < self.batch_size()
    }

    pub fn value(&self) -> Option<&'a T> {
        self.item().and_then(|item| item.get(self.vector_index))
    }

    /// Начальный индекс текущей записи
    pub fn entry_index(&self) -> Option<usize> {
        self.key
    }

    /// Переход к следующему результату, по возможности внутри батча
    pub fn advance(&mut self) {
        if self.can_increment_vector_index() {
            self.vector_index += 1;
        } else {
            self.batched_advance();
        }
    }

    /// Пропуск остатка текущего батча
    pub fn batched_advance(&mut self) {
        self.vector_index = 0;
        self.key = self.key.and_then(|key| {
            self.results
                .range((Bound::Excluded(key), Bound::Unbounded))
                .next()
                .map(|(&next, _)| next)
        });
    }
}

impl<T> Clone for ResultIter<'_, T> {
    fn clone(&self) -> Self {
        Self {
            results: self.results,
            key: self.key,
            vector_index: self.vector_index,
        }
    }
}

impl<T> PartialEq for ResultIter<'_, T> {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.vector_index == other.vector_index
    }
}

impl<T> std::fmt::Debug for ResultIter<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultIter")
            .field("key", &self.key)
            .field("vector_index", &self.vector_index)
            .finish()
    }
}

impl<'a, T> Iterator for ResultIter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<Self::Item> {
        let value = self.value()?;
        self.advance();
        Some(value)
    }
}
