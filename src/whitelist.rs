use std::{
    collections::BTreeSet,
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use log::{info, warn};

use crate::{
    context::{Context, Effect, ExecMode, PlannedAction},
    error::{ProvisionError, Result},
    sanitize::ServiceName,
    utils::{self, StateLock},
};

const WHITELIST_FILE_MODE: u32 = 0o644;

/// Белый список systemd юнитов, разрешенных для перезапуска
///
/// Файл на диске - единственный источник истины: каждый вызов читает его
/// заново, кеша в памяти нет. Обертка перезапуска читает тот же файл.
pub struct ServiceWhitelist {
    path: PathBuf,
    lock_path: PathBuf,
    mode: ExecMode,
}

impl ServiceWhitelist {
    pub fn new(path: impl Into<PathBuf>, lock_path: impl Into<PathBuf>, mode: ExecMode) -> Self {
        Self {
            path: path.into(),
            lock_path: lock_path.into(),
            mode,
        }
    }

    pub fn from_context(ctx: &Context) -> Self {
        Self::new(
            ctx.config.whitelist_file(),
            ctx.config.lock_file(),
            ctx.mode,
        )
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<BTreeSet<ServiceName>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(BTreeSet::new()),
            Err(e) => {
                return Err(ProvisionError::io(
                    format!("Не удалось прочитать белый список {}", self.path.display()),
                    e,
                ))
            }
        };

        // Строки сравниваются так же, как в обертке (`grep -Fx`): целиком,
        // без обрезки пробелов и `\r`
        let mut names = BTreeSet::new();
        for line in content.split('\n') {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match ServiceName::parse(line) {
                Ok(name) => {
                    names.insert(name);
                }
                Err(_) => warn!(
                    "Некорректная строка в белом списке {} пропущена: {:?}",
                    self.path.display(),
                    line
                ),
            }
        }

        Ok(names)
    }

    fn write(&self, names: &BTreeSet<ServiceName>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            utils::ensure_dir(parent, 0o755)?;
        }

        let mut content = String::new();
        for name in names {
            content.push_str(name.as_str());
            content.push('\n');
        }

        utils::write_atomic(&self.path, content.as_bytes(), WHITELIST_FILE_MODE)
    }

    /// Добавляет сервис; возвращает true, если его не было в списке
    pub fn add(&self, service_name: &str) -> Result<Effect<bool>> {
        let name = ServiceName::parse(service_name)?;

        if self.mode.is_dry_run() {
            return Ok(Effect::Planned(vec![PlannedAction::new(
                "whitelist-add",
                &name,
            )
            .with_detail(self.path.display().to_string())]));
        }

        let _lock = StateLock::acquire(&self.lock_path)?;
        let mut names = self.read()?;
        let added = names.insert(name.clone());
        if added {
            self.write(&names)?;
            info!("Сервис {} добавлен в белый список", name);
        } else {
            info!("Сервис {} уже в белом списке", name);
        }

        Ok(Effect::Applied(added))
    }

    /// Удаляет сервис; возвращает true, если он был в списке
    pub fn remove(&self, service_name: &str) -> Result<Effect<bool>> {
        let name = ServiceName::parse(service_name)?;

        if self.mode.is_dry_run() {
            return Ok(Effect::Planned(vec![PlannedAction::new(
                "whitelist-remove",
                &name,
            )
            .with_detail(self.path.display().to_string())]));
        }

        let _lock = StateLock::acquire(&self.lock_path)?;
        let mut names = self.read()?;
        let removed = names.remove(&name);
        if removed {
            self.write(&names)?;
            info!("Сервис {} удален из белого списка", name);
        }

        Ok(Effect::Applied(removed))
    }

    /// Точное совпадение имени; некорректное имя никогда не входит в список
    pub fn contains(&self, service_name: &str) -> Result<bool> {
        let Ok(name) = ServiceName::parse(service_name) else {
            return Ok(false);
        };
        Ok(self.read()?.contains(&name))
    }

    pub fn list(&self) -> Result<BTreeSet<ServiceName>> {
        self.read()
    }

    /// Удаляет файл белого списка целиком
    pub fn clear(&self) -> Result<Effect<bool>> {
        if self.mode.is_dry_run() {
            return Ok(Effect::Planned(vec![PlannedAction::new(
                "delete",
                self.path.display(),
            )]));
        }

        let _lock = StateLock::acquire(&self.lock_path)?;
        utils::remove_if_exists(&self.path).map(Effect::Applied)
    }
}
