/*!
# Ошибки движка

Единый тип ошибок для запусков движка. Ошибка пользовательского алгоритма
сохраняется в одном экземпляре (побеждает первая) и доставляется управляющему
потоку или в future без потери исходного типа.
*/

use std::any::Any;
use std::fmt::{Debug, Display};
use std::sync::Arc;

use thiserror::Error;

/// Основная ошибка движка
#[derive(Error, Debug, Clone)]
pub enum EngineError {
    /// Пользовательский алгоритм вернул ошибку
    #[error("user algorithm failed: {0}")]
    Algorithm(Arc<anyhow::Error>),

    /// Пользовательский алгоритм запаниковал в рабочем потоке
    #[error("user algorithm panicked: {0}")]
    Panicked(String),

    /// Не удалось создать пул потоков
    #[error("thread pool error: {0}")]
    Pool(String),

    /// Некорректная конфигурация
    #[error("configuration error: {message}")]
    Config { message: String },
}

/// Type alias for Results using EngineError
pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    /// Ошибка конфигурации
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Восстановление исходной ошибки пользовательского алгоритма по типу
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: Display + Debug + Send + Sync + 'static,
    {
        match self {
            Self::Algorithm(source) => source.downcast_ref::<E>(),
            _ => None,
        }
    }

    /// Преобразование payload паники в ошибку
    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(text) = payload.downcast_ref::<&str>() {
            (*text).to_string()
        } else if let Some(text) = payload.downcast_ref::<String>() {
            text.clone()
        } else {
            "non-string panic payload".to_string()
        };
        Self::Panicked(message)
    }
}

impl From<anyhow::Error> for EngineError {
    fn from(err: anyhow::Error) -> Self {
        Self::Algorithm(Arc::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Broken(usize);

    impl Display for Broken {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "broken item {}", self.0)
        }
    }

    impl std::error::Error for Broken {}

    #[test]
    fn test_downcast_keeps_source_type() {
        let err = EngineError::from(anyhow::Error::new(Broken(3)));
        assert_eq!(err.downcast_ref::<Broken>().map(|b| b.0), Some(3));
        assert!(err.to_string().contains("broken item 3"));

        let cloned = err.clone();
        assert!(cloned.downcast_ref::<Broken>().is_some());
    }

    #[test]
    fn test_panic_payload_message() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        match EngineError::from_panic(payload) {
            EngineError::Panicked(message) => assert_eq!(message, "boom"),
            other => panic!("unexpected error: {other:?}"),
        }

        let payload: Box<dyn Any + Send> = Box::new(String::from("owned boom"));
        assert!(matches!(
            EngineError::from_panic(payload),
            EngineError::Panicked(ref m) if m == "owned boom"
        ));
    }
}
