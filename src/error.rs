use std::{io, path::PathBuf};

use thiserror::Error;

/// Ошибки компонентов провижининга
///
/// Каждая категория соответствует своему коду выхода, чтобы вызывающие
/// скрипты могли различать причины.
#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error("Недопустимое имя сервиса: {0:?}")]
    InvalidName(String),

    #[error("Недопустимый ключ секрета: {0:?}")]
    InvalidSecretKey(String),

    #[error("Пустое значение секрета недопустимо")]
    EmptySecret,

    #[error("Секрет не найден: {0}")]
    SecretNotFound(String),

    #[error("Недопустимый порт {value:?}: {reason}")]
    InvalidPort { value: String, reason: String },

    #[error("Версия {version} отсутствует в списке для {software}")]
    InvalidVersion { software: String, version: String },

    #[error("Неизвестное ПО: {0}")]
    UnknownSoftware(String),

    #[error("Недопустимое имя пользователя: {0:?}")]
    InvalidPrincipal(String),

    #[error("Небезопасный путь {path:?}: {reason}")]
    UnsafePath { path: PathBuf, reason: String },

    #[error("Белый список сервисов пуст, выдавать нечего")]
    EmptyWhitelist,

    #[error("В автоматическом режиме изменение sudoers требует флага --allow-sudoers")]
    SudoersConsentRequired,

    #[error("Операция отменена оператором")]
    Cancelled,

    #[error("Интерактивный ввод недоступен: {0}")]
    PromptUnavailable(String),

    #[error("Требуются права root: {0}")]
    NotRoot(String),

    #[error("Некорректный синтаксис правила sudoers: {0}")]
    GrantInvalid(String),

    #[error("Не удалось установить обертку {path:?}: {reason}")]
    WrapperInstall { path: PathBuf, reason: String },

    #[error("Не удалось создать бекап {path:?}: {reason}")]
    BackupFailed { path: PathBuf, reason: String },

    #[error("Бекап не найден: {0:?}")]
    SnapshotNotFound(PathBuf),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("{0}")]
    Other(String),
}

impl ProvisionError {
    /// Код выхода процесса для категории ошибки
    pub fn exit_code(&self) -> i32 {
        match self {
            ProvisionError::InvalidName(_)
            | ProvisionError::InvalidSecretKey(_)
            | ProvisionError::EmptySecret
            | ProvisionError::InvalidPort { .. }
            | ProvisionError::InvalidVersion { .. }
            | ProvisionError::UnknownSoftware(_)
            | ProvisionError::InvalidPrincipal(_)
            | ProvisionError::UnsafePath { .. }
            | ProvisionError::EmptyWhitelist => 2,
            ProvisionError::SecretNotFound(_) | ProvisionError::SnapshotNotFound(_) => 3,
            ProvisionError::SudoersConsentRequired
            | ProvisionError::Cancelled
            | ProvisionError::PromptUnavailable(_)
            | ProvisionError::NotRoot(_) => 4,
            ProvisionError::GrantInvalid(_) => 5,
            ProvisionError::WrapperInstall { .. } => 6,
            ProvisionError::BackupFailed { .. } => 7,
            ProvisionError::Io { .. } | ProvisionError::Other(_) => 1,
        }
    }

    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        ProvisionError::Io {
            context: context.into(),
            source,
        }
    }
}

/// Добавляет контекст к ошибкам ввода-вывода
pub trait IoContext<T> {
    fn io_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>;
}

impl<T> IoContext<T> for std::result::Result<T, io::Error> {
    fn io_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|e| ProvisionError::io(f(), e))
    }
}

pub type Result<T> = std::result::Result<T, ProvisionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_distinguish_categories() {
        assert_eq!(ProvisionError::InvalidName("a b".into()).exit_code(), 2);
        assert_eq!(ProvisionError::SecretNotFound("db".into()).exit_code(), 3);
        assert_eq!(ProvisionError::SudoersConsentRequired.exit_code(), 4);
        assert_eq!(ProvisionError::GrantInvalid("x".into()).exit_code(), 5);
        assert_eq!(
            ProvisionError::BackupFailed {
                path: PathBuf::from("/etc/nginx"),
                reason: "disk full".into()
            }
            .exit_code(),
            7
        );
    }

    #[test]
    fn io_context_wraps_error() {
        let res: std::result::Result<(), io::Error> =
            Err(io::Error::new(io::ErrorKind::Other, "boom"));
        let err = res.io_context(|| "чтение файла").unwrap_err();
        assert_eq!(err.exit_code(), 1);
        assert!(err.to_string().contains("чтение файла"));
    }
}
