/*!
# Конфигурация движка

Настройки пула потоков, адаптации размера блока, отчетности результатов,
метрик и логирования.
*/

use serde::{Deserialize, Serialize};
use std::path::Path;
use anyhow::Result;

use crate::engine::block_size::{BlockSizeTuning, DEFAULT_MEDIAN_WINDOW, DEFAULT_TARGET_RATIO};
use crate::engine::iterate_kernel::DEFAULT_VECTOR_THRESHOLD;

/// Основная конфигурация движка
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Конфигурация пула потоков
    pub pool: PoolConfig,

    /// Адаптация размера блока
    #[serde(default)]
    pub block_size: BlockSizeConfig,

    /// Отчетность результатов
    #[serde(default)]
    pub reporting: ReportingConfig,

    /// Конфигурация метрик
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Конфигурация логирования
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Конфигурация пула потоков
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Максимальное количество рабочих потоков
    pub max_threads: usize,

    /// Префикс имени потоков
    #[serde(default = "default_thread_name_prefix")]
    pub thread_name_prefix: String,
}

/// Параметры адаптации размера блока
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockSizeConfig {
    /// Во сколько раз пользовательское время должно превышать управляющее,
    /// чтобы размер блока перестал расти
    pub target_ratio: u64,

    /// Размер окна скользящей медианы
    pub median_window: usize,
}

/// Параметры отчетности результатов
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportingConfig {
    /// Батчи длиннее порога отправляются одним вектором
    pub vector_threshold: usize,
}

/// Конфигурация метрик
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Включить сбор метрик
    pub enabled: bool,
}

/// Конфигурация логирования
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Уровень логирования
    pub level: String,

    /// Директория для файлов логов
    pub directory: String,
}

fn default_thread_name_prefix() -> String {
    "engine-worker".to_string()
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_threads: num_cpus::get(),
            thread_name_prefix: default_thread_name_prefix(),
        }
    }
}

impl Default for BlockSizeConfig {
    fn default() -> Self {
        Self {
            target_ratio: DEFAULT_TARGET_RATIO,
            median_window: DEFAULT_MEDIAN_WINDOW,
        }
    }
}

impl Default for ReportingConfig {
    fn default() -> Self {
        Self {
            vector_threshold: DEFAULT_VECTOR_THRESHOLD,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            directory: "logs".to_string(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            block_size: BlockSizeConfig::default(),
            reporting: ReportingConfig::default(),
            metrics: MetricsConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl BlockSizeConfig {
    pub fn tuning(&self) -> BlockSizeTuning {
        BlockSizeTuning {
            target_ratio: self.target_ratio,
            median_window: self.median_window,
        }
    }
}

impl EngineConfig {
    /// Загрузка конфигурации из файла
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Разбор конфигурации из TOML строки
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: EngineConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Валидация конфигурации
    pub fn validate(&self) -> Result<()> {
        if self.pool.max_threads == 0 {
            return Err(anyhow::anyhow!(
                "Количество потоков пула должно быть больше 0"
            ));
        }

        if self.block_size.median_window == 0 {
            return Err(anyhow::anyhow!(
                "Окно медианы должно быть больше 0"
            ));
        }

        if self.block_size.target_ratio == 0 {
            return Err(anyhow::anyhow!(
                "Целевое отношение должно быть больше 0"
            ));
        }

        Ok(())
    }
}
