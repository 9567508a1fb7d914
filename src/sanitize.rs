//! Проверка значений, вставляемых в генерируемые файлы
//!
//! Все имена, попадающие в скрипт обертки, правило sudoers или пути на диске,
//! проверяются один раз при создании типа. Дальше код работает только с
//! уже проверенными значениями.

use std::{
    fmt,
    path::{Component, Path, PathBuf},
    str::FromStr,
};

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{ProvisionError, Result};

static SERVICE_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9._@-]+$").expect("valid service name regex"));

static PRINCIPAL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z_][a-z0-9_-]{0,31}$").expect("valid principal regex"));

static SECRET_KEY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-][A-Za-z0-9._-]{0,127}$").expect("valid key regex"));

/// Символы, которые нельзя допускать в пути команды sudoers
const SUDOERS_SPECIAL: &[char] = &[
    ' ', '\t', '\n', ',', ':', '=', '\\', '*', '?', '[', ']', '!', '"', '\'', '#', '%', '(', ')',
];

/// Имя systemd юнита из белого списка
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ServiceName(String);

impl ServiceName {
    pub fn parse(raw: &str) -> Result<Self> {
        if !SERVICE_NAME_RE.is_match(raw) || raw.starts_with('-') {
            return Err(ProvisionError::InvalidName(raw.to_string()));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for ServiceName {
    type Err = ProvisionError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for ServiceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Системный пользователь, получающий право перезапуска
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal(String);

impl Principal {
    pub fn parse(raw: &str) -> Result<Self> {
        if !PRINCIPAL_RE.is_match(raw) {
            return Err(ProvisionError::InvalidPrincipal(raw.to_string()));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Имя слота в хранилище секретов, безопасное как имя файла
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct SecretKey(String);

impl SecretKey {
    pub fn parse(raw: &str) -> Result<Self> {
        if !SECRET_KEY_RE.is_match(raw) {
            return Err(ProvisionError::InvalidSecretKey(raw.to_string()));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Абсолютный канонический путь без спецсимволов sudoers и оболочки
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandPath(PathBuf);

impl CommandPath {
    pub fn parse(path: &Path) -> Result<Self> {
        let unsafe_path = |reason: &str| ProvisionError::UnsafePath {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        };

        if !path.is_absolute() {
            return Err(unsafe_path("путь должен быть абсолютным"));
        }

        let text = path
            .to_str()
            .ok_or_else(|| unsafe_path("путь должен быть в UTF-8"))?;

        if text.contains(SUDOERS_SPECIAL) {
            return Err(unsafe_path("путь содержит спецсимволы"));
        }

        if text.contains("//") || text.contains("/./") || text.ends_with('/') {
            return Err(unsafe_path("путь не канонический"));
        }

        if path
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::CurDir))
        {
            return Err(unsafe_path("путь содержит '.' или '..'"));
        }

        Ok(Self(path.to_path_buf()))
    }

    pub fn as_path(&self) -> &Path {
        &self.0
    }
}

impl fmt::Display for CommandPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

/// Экранирует значение для строки POSIX shell в одинарных кавычках
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_names_follow_restrictive_pattern() {
        for ok in ["nginx", "redis-server", "app@1.service", "my_app.v2"] {
            assert!(ServiceName::parse(ok).is_ok(), "{}", ok);
        }
        for bad in ["", "nginx evil", "a;b", "../x", "nginx*", "-nginx", "svc$"] {
            assert!(
                matches!(ServiceName::parse(bad), Err(ProvisionError::InvalidName(_))),
                "{}",
                bad
            );
        }
    }

    #[test]
    fn principal_rejects_shell_metacharacters() {
        assert!(Principal::parse("github-runner").is_ok());
        assert!(Principal::parse("root ALL").is_err());
        assert!(Principal::parse("Runner").is_err());
        assert!(Principal::parse("").is_err());
    }

    #[test]
    fn secret_key_must_be_filename_token() {
        assert!(SecretKey::parse("db_password").is_ok());
        assert!(SecretKey::parse("jwt.secret").is_ok());
        assert!(SecretKey::parse(".hidden").is_err());
        assert!(SecretKey::parse("a/b").is_err());
        assert!(SecretKey::parse("..").is_err());
    }

    #[test]
    fn command_path_must_be_absolute_and_canonical() {
        assert!(CommandPath::parse(Path::new("/usr/local/bin/vps-restart-service")).is_ok());
        assert!(CommandPath::parse(Path::new("bin/restart")).is_err());
        assert!(CommandPath::parse(Path::new("/usr/local/../bin/x")).is_err());
        assert!(CommandPath::parse(Path::new("/usr/local/bin/x *")).is_err());
        assert!(CommandPath::parse(Path::new("/usr//bin/x")).is_err());
    }

    #[test]
    fn shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("plain"), "'plain'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }
}
