use std::{
    collections::BTreeMap,
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use log::{debug, info};
use rand::{rngs::OsRng, Rng, RngCore};
use secrecy::{ExposeSecret, SecretVec};

use crate::{
    context::{Context, Effect, ExecMode, PlannedAction},
    error::{IoContext, ProvisionError, Result},
    sanitize::SecretKey,
    utils,
};

const SECRET_FILE_MODE: u32 = 0o600;
const SECRET_DIR_MODE: u32 = 0o700;
const MIN_PASSWORD_LENGTH: usize = 8;

/// Способ получения нового значения секрета
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretGenerator {
    /// Пароль из прописных, строчных букв и цифр
    Password { length: usize },
    /// Случайные байты в URL-safe base64
    Token { bytes: usize },
}

impl SecretGenerator {
    pub fn generate(self) -> Result<SecretVec<u8>> {
        match self {
            SecretGenerator::Password { length } => {
                generate_password(length).map(|p| SecretVec::new(p.into_bytes()))
            }
            SecretGenerator::Token { bytes } => {
                if bytes == 0 {
                    return Err(ProvisionError::EmptySecret);
                }
                let mut raw = vec![0u8; bytes];
                OsRng.fill_bytes(&mut raw);
                Ok(SecretVec::new(URL_SAFE_NO_PAD.encode(&raw).into_bytes()))
            }
        }
    }
}

/// Новое значение для rotate
pub enum RotateWith {
    Value(SecretVec<u8>),
    Generate(SecretGenerator),
}

/// Генерирует надежный пароль с буквами обоих регистров и цифрами
pub fn generate_password(length: usize) -> Result<String> {
    if length < MIN_PASSWORD_LENGTH {
        return Err(ProvisionError::Other(format!(
            "Длина пароля должна быть не менее {} символов",
            MIN_PASSWORD_LENGTH
        )));
    }

    let mut rng = OsRng;
    loop {
        let password: String = (0..length)
            .map(|_| match rng.gen_range(0..3) {
                0 => rng.gen_range(b'A'..=b'Z') as char,
                1 => rng.gen_range(b'a'..=b'z') as char,
                _ => rng.gen_range(b'0'..=b'9') as char,
            })
            .collect();

        let has_uppercase = password.chars().any(|c| c.is_ascii_uppercase());
        let has_lowercase = password.chars().any(|c| c.is_ascii_lowercase());
        let has_digit = password.chars().any(|c| c.is_ascii_digit());

        if has_uppercase && has_lowercase && has_digit {
            return Ok(password);
        }
    }
}

/// Хранилище секретов: один файл с правами 0600 на ключ
///
/// Истории значений нет: rotate перезаписывает слот, старое значение
/// восстановить нельзя.
pub struct SecretStore {
    dir: PathBuf,
    mode: ExecMode,
}

impl SecretStore {
    pub fn new(dir: impl Into<PathBuf>, mode: ExecMode) -> Self {
        Self {
            dir: dir.into(),
            mode,
        }
    }

    pub fn from_context(ctx: &Context) -> Self {
        Self::new(ctx.config.credentials_dir(), ctx.mode)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn slot(&self, key: &SecretKey) -> PathBuf {
        self.dir.join(key.as_str())
    }

    /// Записывает значение в слот, перезаписывая прежнее
    pub fn put(&self, key: &str, value: &SecretVec<u8>) -> Result<Effect<()>> {
        let key = SecretKey::parse(key)?;
        let bytes = value.expose_secret();
        if bytes.iter().all(|b| b.is_ascii_whitespace()) {
            return Err(ProvisionError::EmptySecret);
        }

        let path = self.slot(&key);
        if self.mode.is_dry_run() {
            return Ok(Effect::Planned(vec![PlannedAction::new("write", path.display())
                .with_detail(format!("mode 0600, {} bytes", bytes.len()))]));
        }

        utils::ensure_dir(&self.dir, SECRET_DIR_MODE)?;
        utils::write_atomic(&path, bytes, SECRET_FILE_MODE)?;

        info!("Секрет {} сохранен ({} байт)", key, bytes.len());
        Ok(Effect::Applied(()))
    }

    /// Читает значение. Показ оператору - ответственность вызывающего кода
    pub fn get(&self, key: &str) -> Result<SecretVec<u8>> {
        let key = SecretKey::parse(key)?;
        let path = self.slot(&key);
        match fs::read(&path) {
            Ok(bytes) => Ok(SecretVec::new(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(ProvisionError::SecretNotFound(key.to_string()))
            }
            Err(e) => Err(ProvisionError::io(
                format!("Не удалось прочитать секрет {}", key),
                e,
            )),
        }
    }

    pub fn exists(&self, key: &str) -> Result<bool> {
        let key = SecretKey::parse(key)?;
        Ok(self.slot(&key).is_file())
    }

    /// Заменяет значение существующего секрета
    pub fn rotate(&self, key: &str, with: RotateWith) -> Result<Effect<()>> {
        let parsed = SecretKey::parse(key)?;
        if !self.slot(&parsed).is_file() {
            return Err(ProvisionError::SecretNotFound(parsed.to_string()));
        }

        let value = match with {
            RotateWith::Value(value) => value,
            RotateWith::Generate(generator) => generator.generate()?,
        };

        let effect = self.put(key, &value)?;
        if !effect.is_planned() {
            info!("Секрет {} заменен, прежнее значение удалено", parsed);
        }
        Ok(effect)
    }

    /// Ключи и длины значений; сами значения не возвращаются
    pub fn list(&self) -> Result<BTreeMap<String, u64>> {
        let mut result = BTreeMap::new();

        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(result),
            Err(e) => {
                return Err(ProvisionError::io(
                    format!("Не удалось прочитать {}", self.dir.display()),
                    e,
                ))
            }
        };

        for entry in entries.filter_map(|e| e.ok()) {
            let name = entry.file_name().to_string_lossy().to_string();
            if SecretKey::parse(&name).is_err() {
                debug!("Пропущен посторонний файл {}", name);
                continue;
            }
            let meta = entry
                .metadata()
                .io_context(|| format!("Не удалось получить метаданные {}", name))?;
            if meta.is_file() {
                result.insert(name, meta.len());
            }
        }

        Ok(result)
    }

    /// Удаляет слот; отсутствие ключа ошибкой не считается
    pub fn delete(&self, key: &str) -> Result<Effect<bool>> {
        let key = SecretKey::parse(key)?;
        let path = self.slot(&key);

        if self.mode.is_dry_run() {
            return Ok(Effect::Planned(vec![PlannedAction::new("delete", path.display())]));
        }

        let removed = utils::remove_if_exists(&path)?;
        if removed {
            info!("Секрет {} удален", key);
        }
        Ok(Effect::Applied(removed))
    }

    /// Удаляет все секреты
    pub fn wipe_all(&self) -> Result<Effect<usize>> {
        let keys: Vec<String> = self.list()?.into_keys().collect();

        if self.mode.is_dry_run() {
            return Ok(Effect::Planned(
                keys.iter()
                    .map(|k| PlannedAction::new("delete", self.dir.join(k).display()))
                    .collect(),
            ));
        }

        let mut removed = 0;
        for key in &keys {
            if utils::remove_if_exists(&self.dir.join(key))? {
                removed += 1;
            }
        }

        info!("Удалено секретов: {}", removed);
        Ok(Effect::Applied(removed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn secret(value: &str) -> SecretVec<u8> {
        SecretVec::new(value.as_bytes().to_vec())
    }

    fn store(dir: &TempDir) -> SecretStore {
        SecretStore::new(dir.path().join("credentials"), ExecMode::Apply)
    }

    #[test]
    fn put_then_get_round_trips() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.put("db_password", &secret("s3cr3t")).unwrap();
        assert_eq!(store.get("db_password").unwrap().expose_secret(), b"s3cr3t");
    }

    #[test]
    fn slot_is_owner_only() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.put("jwt", &secret("token")).unwrap();

        let mode = fs::metadata(store.dir().join("jwt"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o077, 0);
    }

    #[test]
    fn rotate_leaves_no_trace_of_old_value() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.put("db_password", &secret("first-value")).unwrap();
        store
            .rotate("db_password", RotateWith::Value(secret("second-value")))
            .unwrap();

        assert_eq!(
            store.get("db_password").unwrap().expose_secret(),
            b"second-value"
        );
        for entry in fs::read_dir(store.dir()).unwrap() {
            let content = fs::read(entry.unwrap().path()).unwrap();
            assert_ne!(content, b"first-value");
        }
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn rotate_missing_key_is_not_found() {
        let dir = TempDir::new().unwrap();
        let err = store(&dir)
            .rotate("absent", RotateWith::Generate(SecretGenerator::Token { bytes: 16 }))
            .unwrap_err();
        assert!(matches!(err, ProvisionError::SecretNotFound(_)));
    }

    #[test]
    fn get_missing_key_is_not_found() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            store(&dir).get("absent"),
            Err(ProvisionError::SecretNotFound(_))
        ));
    }

    #[test]
    fn empty_values_are_rejected() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        assert!(matches!(
            store.put("k", &secret("")),
            Err(ProvisionError::EmptySecret)
        ));
        assert!(matches!(
            store.put("k", &secret("  \n")),
            Err(ProvisionError::EmptySecret)
        ));
    }

    #[test]
    fn unsafe_keys_are_rejected() {
        let dir = TempDir::new().unwrap();
        let err = store(&dir).put("../escape", &secret("x")).unwrap_err();
        assert!(matches!(err, ProvisionError::InvalidSecretKey(_)));
    }

    #[test]
    fn list_reports_lengths_only() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.put("a", &secret("1234")).unwrap();
        store.put("b", &secret("123456")).unwrap();

        let listed = store.list().unwrap();
        assert_eq!(listed.get("a"), Some(&4));
        assert_eq!(listed.get("b"), Some(&6));
    }

    #[test]
    fn delete_and_wipe_are_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.put("a", &secret("1")).unwrap();
        store.put("b", &secret("2")).unwrap();

        assert_eq!(store.delete("a").unwrap(), Effect::Applied(true));
        assert_eq!(store.delete("a").unwrap(), Effect::Applied(false));
        assert_eq!(store.wipe_all().unwrap(), Effect::Applied(1));
        assert_eq!(store.wipe_all().unwrap(), Effect::Applied(0));
    }

    #[test]
    fn dry_run_writes_nothing_and_reports_same_plan() {
        let dir = TempDir::new().unwrap();
        let store = SecretStore::new(dir.path().join("credentials"), ExecMode::DryRun);

        let first = store.put("db", &secret("value")).unwrap();
        let second = store.put("db", &secret("value")).unwrap();
        assert!(first.is_planned());
        assert_eq!(first, second);
        assert!(!dir.path().join("credentials").exists());

        assert!(store.delete("db").unwrap().is_planned());
        assert!(store.wipe_all().unwrap().is_planned());
    }

    #[test]
    fn generated_password_has_all_classes() {
        let password = generate_password(16).unwrap();
        assert_eq!(password.len(), 16);
        assert!(password.chars().any(|c| c.is_ascii_uppercase()));
        assert!(password.chars().any(|c| c.is_ascii_lowercase()));
        assert!(password.chars().any(|c| c.is_ascii_digit()));
        assert!(generate_password(4).is_err());
    }

    #[test]
    fn generated_token_is_url_safe() {
        let token = SecretGenerator::Token { bytes: 32 }.generate().unwrap();
        let text = std::str::from_utf8(token.expose_secret()).unwrap();
        assert_eq!(text.len(), 43);
        assert!(text
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }
}
