/*!
# Адаптивный размер блока

Каждый рабочий поток измеряет время, проведенное в управляющем коде движка
("control") и в пользовательском коде ("user"). Пока накладные расходы не
пренебрежимо малы относительно пользовательской работы, размер блока
удваивается вплоть до `max_block_size`.

Экземпляр живет в стеке рабочего потока и не разделяется между потоками.
*/

use std::time::Instant;

use tracing::trace;

/// Целевое отношение user / control по умолчанию
pub const DEFAULT_TARGET_RATIO: u64 = 100;

/// Размер окна медианы по умолчанию
pub const DEFAULT_MEDIAN_WINDOW: usize = 7;

/// Параметры адаптации размера блока
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSizeTuning {
    pub target_ratio: u64,
    pub median_window: usize,
}

impl Default for BlockSizeTuning {
    fn default() -> Self {
        Self {
            target_ratio: DEFAULT_TARGET_RATIO,
            median_window: DEFAULT_MEDIAN_WINDOW,
        }
    }
}

/// Скользящая медиана по окну фиксированного размера
#[derive(Debug, Clone)]
pub struct Median {
    values: Vec<u64>,
    current_index: usize,
    current_median: u64,
    valid: bool,
    dirty: bool,
}

impl Median {
    pub fn new(window: usize) -> Self {
        Self {
            values: vec![0; window.max(1)],
            current_index: 0,
            current_median: 0,
            valid: false,
            dirty: true,
        }
    }

    pub fn reset(&mut self) {
        self.values.fill(0);
        self.current_index = 0;
        self.valid = false;
        self.dirty = true;
    }

    pub fn add_value(&mut self, value: u64) {
        self.current_index = (self.current_index + 1) % self.values.len();
        if !self.valid && self.current_index == 0 {
            self.valid = true;
        }

        // Кеш медианы сбрасывается только если новое значение и вытесняемое
        // лежат по разные стороны от текущей медианы
        let replaced = self.values[self.current_index];
        let median = self.current_median;
        if (replaced > median && median > value) || (median > replaced && value > median) {
            self.dirty = true;
        }

        self.values[self.current_index] = value;
    }

    /// Окно заполнено хотя бы один раз
    pub fn is_median_valid(&self) -> bool {
        self.valid
    }

    pub fn median(&mut self) -> u64 {
        if self.dirty {
            self.dirty = false;
            let mut sorted = self.values.clone();
            sorted.sort_unstable();
            self.current_median = sorted[sorted.len() / 2];
        }
        self.current_median
    }
}

/// Менеджер размера блока одного рабочего потока
#[derive(Debug)]
pub struct BlockSizeManager {
    max_block_size: usize,
    target_ratio: u64,
    before_user: Instant,
    after_user: Instant,
    control_part_elapsed: Median,
    user_part_elapsed: Median,
    block_size: usize,
}

impl BlockSizeManager {
    /// `iteration_count == 0` означает неограниченный диапазон
    pub fn new(iteration_count: usize, max_concurrency: usize, tuning: BlockSizeTuning) -> Self {
        let max_block_size = (iteration_count / (max_concurrency.max(1) * 2)).max(1);
        let now = Instant::now();
        Self {
            max_block_size,
            target_ratio: tuning.target_ratio,
            before_user: now,
            after_user: now,
            control_part_elapsed: Median::new(tuning.median_window),
            user_part_elapsed: Median::new(tuning.median_window),
            block_size: 1,
        }
    }

    /// Отметка времени перед вызовом пользовательского кода
    pub fn time_before_user(&mut self) {
        if self.block_size_maxed() {
            return;
        }

        self.before_user = Instant::now();
        let control = self.before_user.duration_since(self.after_user);
        self.control_part_elapsed.add_value(control.as_nanos() as u64);
    }

    /// Отметка времени после пользовательского кода и возможная корректировка
    /// размера блока
    pub fn time_after_user(&mut self) {
        if self.block_size_maxed() {
            return;
        }

        self.after_user = Instant::now();
        let user = self.after_user.duration_since(self.before_user);
        self.user_part_elapsed.add_value(user.as_nanos() as u64);

        if !self.control_part_elapsed.is_median_valid() {
            return;
        }

        let control_median = self.control_part_elapsed.median();
        let user_median = self.user_part_elapsed.median();
        if control_median.saturating_mul(self.target_ratio) < user_median {
            return;
        }

        self.block_size = (self.block_size * 2).min(self.max_block_size);
        trace!(
            control_median,
            user_median,
            block_size = self.block_size,
            "adjusting block size"
        );

        // Новые измерения уже при новом размере блока
        self.control_part_elapsed.reset();
        self.user_part_elapsed.reset();
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn max_block_size(&self) -> usize {
        self.max_block_size
    }

    pub fn block_size_maxed(&self) -> bool {
        self.block_size >= self.max_block_size
    }
}
