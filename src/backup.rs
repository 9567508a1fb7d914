use std::{
    fs::{self, File},
    io::ErrorKind,
    path::{Path, PathBuf},
};

use chrono::{Duration, Local, NaiveDateTime, Timelike};
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::{
    config::RETENTION_FILE,
    context::{Context, Effect, ExecMode, PlannedAction},
    error::{IoContext, ProvisionError, Result},
    utils,
};

const ARCHIVE_EXT: &str = "tar.gz";
const TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S";
/// Длина метки: секунды (14 цифр) + миллисекунды (3 цифры)
const TIMESTAMP_LEN: usize = 17;

/// Политика хранения бекапов
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionPolicy {
    KeepLast(usize),
    KeepDays(u32),
}

impl std::fmt::Display for RetentionPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetentionPolicy::KeepLast(n) => write!(f, "хранить последние {}", n),
            RetentionPolicy::KeepDays(d) => write!(f, "хранить {} дн.", d),
        }
    }
}

/// Разбор политики из строки: `last:5`, `days:30` или просто число снимков
impl std::str::FromStr for RetentionPolicy {
    type Err = ProvisionError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || {
            ProvisionError::Other(format!(
                "Некорректная политика хранения {:?}: ожидается last:N или days:N",
                s
            ))
        };
        let trimmed = s.trim();
        let (kind, value) = trimmed.split_once(':').unwrap_or(("last", trimmed));
        match kind {
            "last" => value
                .parse()
                .map(RetentionPolicy::KeepLast)
                .map_err(|_| invalid()),
            "days" => value
                .parse()
                .map(RetentionPolicy::KeepDays)
                .map_err(|_| invalid()),
            _ => Err(invalid()),
        }
    }
}

/// Снимок, найденный в директории бекапов
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupSnapshot {
    pub source_family: String,
    pub created_at: NaiveDateTime,
    pub archive_path: PathBuf,
    pub retained: bool,
}

/// Результат snapshot(): создан архив или источник отсутствует
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotRef {
    Skipped(PathBuf),
    Created(PathBuf),
}

/// Бекапы конфигурации перед изменением и их ротация
pub struct BackupManager {
    root: PathBuf,
    state_dir: PathBuf,
    default_policy: RetentionPolicy,
    mode: ExecMode,
}

impl BackupManager {
    pub fn new(
        root: impl Into<PathBuf>,
        state_dir: impl Into<PathBuf>,
        default_policy: RetentionPolicy,
        mode: ExecMode,
    ) -> Self {
        Self {
            root: root.into(),
            state_dir: state_dir.into(),
            default_policy,
            mode,
        }
    }

    pub fn from_context(ctx: &Context) -> Self {
        Self::new(
            ctx.config.backup_dir(),
            ctx.config.state_dir(),
            ctx.config.retention,
            ctx.mode,
        )
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn retention_file(&self) -> PathBuf {
        self.state_dir.join(RETENTION_FILE)
    }

    /// Текущая политика: сохраненная или значение из конфигурации
    pub fn retention(&self) -> Result<RetentionPolicy> {
        let path = self.retention_file();
        match fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content).map_err(|e| {
                ProvisionError::Other(format!(
                    "Некорректная политика хранения в {}: {}",
                    path.display(),
                    e
                ))
            }),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(self.default_policy),
            Err(e) => Err(ProvisionError::io(
                format!("Не удалось прочитать {}", path.display()),
                e,
            )),
        }
    }

    /// Сохраняет политику для последующих очисток
    pub fn set_retention(&self, policy: RetentionPolicy) -> Result<Effect<()>> {
        let path = self.retention_file();
        if self.mode.is_dry_run() {
            return Ok(Effect::Planned(vec![PlannedAction::new("write", path.display())
                .with_detail(format!("{:?}", policy))]));
        }

        let json = serde_json::to_string(&policy)
            .map_err(|e| ProvisionError::Other(e.to_string()))?;
        utils::ensure_dir(&self.state_dir, 0o700)?;
        utils::write_atomic(&path, json.as_bytes(), 0o600)?;

        info!("Политика хранения бекапов: {}", policy);
        Ok(Effect::Applied(()))
    }

    /// Создает сжатый архив источника и сразу применяет ротацию
    ///
    /// Отсутствующий источник - не ошибка, возвращается `Skipped`.
    /// Ошибка создания архива возвращается вызывающему: изменение без
    /// бекапа продолжать нельзя.
    pub fn snapshot(&self, source_path: &Path) -> Result<Effect<SnapshotRef>> {
        if fs::symlink_metadata(source_path).is_err() {
            debug!("Путь {:?} не существует, бекап не требуется", source_path);
            return Ok(Effect::Applied(SnapshotRef::Skipped(
                source_path.to_path_buf(),
            )));
        }

        let family = family_of(source_path)?;

        if self.mode.is_dry_run() {
            let target = self
                .root
                .join(format!("{}.<timestamp>.{}", family, ARCHIVE_EXT));
            return Ok(Effect::Planned(vec![
                PlannedAction::new("archive", source_path.display())
                    .with_detail(target.display().to_string()),
                PlannedAction::new("prune", &family).with_detail(format!("{:?}", self.retention()?)),
            ]));
        }

        let archive_path = self.create_archive(source_path, &family)?;
        self.prune_family(&family, &[archive_path.as_path()])?;
        Ok(Effect::Applied(SnapshotRef::Created(archive_path)))
    }

    /// Архив без ротации; источник должен существовать
    fn create_archive(&self, source_path: &Path, family: &str) -> Result<PathBuf> {
        let backup_failed = |reason: String| ProvisionError::BackupFailed {
            path: source_path.to_path_buf(),
            reason,
        };

        utils::ensure_dir(&self.root, 0o700).map_err(|e| backup_failed(e.to_string()))?;
        let archive_path = self.next_archive_path(family);

        write_archive(source_path, family, &archive_path, &self.root)
            .map_err(|e| backup_failed(e.to_string()))?;
        utils::set_mode_best_effort(&archive_path, 0o600);

        info!("Создан бекап {:?} -> {:?}", source_path, archive_path);
        Ok(archive_path)
    }

    /// Следующее свободное имя архива; метка строго растет даже в пределах миллисекунды
    fn next_archive_path(&self, family: &str) -> PathBuf {
        let mut at = Local::now().naive_local();
        if let Some(latest) = self
            .scan(family)
            .ok()
            .and_then(|s| s.first().map(|s| s.created_at))
        {
            if at <= latest {
                at = latest + Duration::milliseconds(1);
            }
        }

        loop {
            let path = self
                .root
                .join(format!("{}.{}.{}", family, format_timestamp(at), ARCHIVE_EXT));
            if !path.exists() {
                return path;
            }
            at += Duration::milliseconds(1);
        }
    }

    /// Все снимки семейства, новые первыми
    fn scan(&self, family: &str) -> Result<Vec<BackupSnapshot>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(ProvisionError::io(
                    format!(
                        "Не удалось прочитать директорию бекапов: {}",
                        self.root.display()
                    ),
                    e,
                ))
            }
        };

        let mut snapshots: Vec<BackupSnapshot> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_file())
            .filter_map(|path| {
                let name = path.file_name()?.to_str()?.to_string();
                let (name_family, created_at) = parse_archive_name(&name)?;
                (name_family == family).then(|| BackupSnapshot {
                    source_family: name_family,
                    created_at,
                    archive_path: path,
                    retained: true,
                })
            })
            .collect();

        snapshots.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(snapshots)
    }

    /// Снимки семейства, новые первыми, с отметкой политики хранения
    pub fn list_snapshots(&self, family: &str) -> Result<Vec<BackupSnapshot>> {
        let policy = self.retention()?;
        let now = Local::now().naive_local();
        let mut snapshots = self.scan(family)?;
        for (index, snapshot) in snapshots.iter_mut().enumerate() {
            snapshot.retained = is_retained(policy, index, snapshot.created_at, now);
        }
        Ok(snapshots)
    }

    /// Удаляет снимки за пределами политики хранения
    pub fn prune(&self, family: &str) -> Result<Effect<Vec<PathBuf>>> {
        if self.mode.is_dry_run() {
            let doomed: Vec<PlannedAction> = self
                .list_snapshots(family)?
                .into_iter()
                .filter(|s| !s.retained)
                .map(|s| PlannedAction::new("delete", s.archive_path.display()))
                .collect();
            return Ok(Effect::Planned(doomed));
        }

        self.prune_family(family, &[]).map(Effect::Applied)
    }

    fn prune_family(&self, family: &str, keep: &[&Path]) -> Result<Vec<PathBuf>> {
        let mut deleted = Vec::new();

        for snapshot in self.list_snapshots(family)? {
            let kept = keep
                .iter()
                .any(|k| k.file_name() == snapshot.archive_path.file_name());
            if snapshot.retained || kept {
                continue;
            }
            match fs::remove_file(&snapshot.archive_path) {
                Ok(()) => {
                    debug!("Удален старый бекап: {:?}", snapshot.archive_path);
                    deleted.push(snapshot.archive_path);
                }
                Err(e) => warn!(
                    "Не удалось удалить старый бекап {:?}: {}",
                    snapshot.archive_path, e
                ),
            }
        }

        if !deleted.is_empty() {
            info!("Очистка бекапов {}: удалено {}", family, deleted.len());
        }
        Ok(deleted)
    }

    /// Восстанавливает архив в директорию; текущее состояние предварительно сохраняется
    ///
    /// Существующая цель заменяется целиком, а не дополняется. Ротация
    /// выполняется только после распаковки, восстанавливаемый архив и
    /// свежий снимок при этом не удаляются.
    pub fn restore(&self, archive_path: &Path, into_dir: &Path) -> Result<Effect<PathBuf>> {
        let name = archive_path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| ProvisionError::SnapshotNotFound(archive_path.to_path_buf()))?;
        let (family, _) = parse_archive_name(name)
            .ok_or_else(|| ProvisionError::SnapshotNotFound(archive_path.to_path_buf()))?;
        if !archive_path.is_file() {
            return Err(ProvisionError::SnapshotNotFound(archive_path.to_path_buf()));
        }

        let target = into_dir.join(&family);
        if self.mode.is_dry_run() {
            return Ok(Effect::Planned(vec![
                PlannedAction::new("archive", target.display()),
                PlannedAction::new("extract", archive_path.display())
                    .with_detail(into_dir.display().to_string()),
            ]));
        }

        let file = File::open(archive_path)
            .io_context(|| format!("Не удалось открыть архив {}", archive_path.display()))?;

        let current = match fs::symlink_metadata(&target) {
            Ok(meta) => Some((self.create_archive(&target, &family)?, meta)),
            Err(_) => None,
        };
        if let Some((saved, meta)) = &current {
            debug!("Текущее состояние {:?} сохранено в {:?}", target, saved);
            if meta.is_dir() {
                fs::remove_dir_all(&target)
                    .io_context(|| format!("Не удалось очистить {}", target.display()))?;
            } else {
                fs::remove_file(&target)
                    .io_context(|| format!("Не удалось удалить {}", target.display()))?;
            }
        }

        utils::ensure_dir(into_dir, 0o755)?;
        let mut archive = tar::Archive::new(GzDecoder::new(file));
        archive.set_preserve_permissions(true);
        archive
            .unpack(into_dir)
            .io_context(|| format!("Не удалось распаковать {}", archive_path.display()))?;

        info!("Восстановлено {:?} -> {:?}", archive_path, target);

        let mut keep = vec![archive_path];
        if let Some((saved, _)) = &current {
            keep.push(saved.as_path());
        }
        self.prune_family(&family, &keep)?;
        Ok(Effect::Applied(target))
    }
}

/// Имя семейства снимков - базовое имя источника
pub fn family_of(source_path: &Path) -> Result<String> {
    source_path
        .file_name()
        .and_then(|name| name.to_str())
        .map(str::to_string)
        .ok_or_else(|| ProvisionError::UnsafePath {
            path: source_path.to_path_buf(),
            reason: "не удалось получить имя файла из пути".to_string(),
        })
}

fn format_timestamp(at: NaiveDateTime) -> String {
    format!(
        "{}{:03}",
        at.format(TIMESTAMP_FORMAT),
        (at.nanosecond() / 1_000_000) % 1000
    )
}

fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    if raw.len() != TIMESTAMP_LEN || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let (seconds, millis) = raw.split_at(14);
    let base = NaiveDateTime::parse_from_str(seconds, TIMESTAMP_FORMAT).ok()?;
    let millis: i64 = millis.parse().ok()?;
    Some(base + Duration::milliseconds(millis))
}

/// `<family>.<timestamp>.tar.gz` -> (family, timestamp)
fn parse_archive_name(name: &str) -> Option<(String, NaiveDateTime)> {
    let stem = name.strip_suffix(&format!(".{}", ARCHIVE_EXT))?;
    let (family, timestamp) = stem.rsplit_once('.')?;
    if family.is_empty() {
        return None;
    }
    Some((family.to_string(), parse_timestamp(timestamp)?))
}

/// Самый новый снимок сохраняется всегда, даже при KeepLast(0)
fn is_retained(
    policy: RetentionPolicy,
    index: usize,
    created_at: NaiveDateTime,
    now: NaiveDateTime,
) -> bool {
    if index == 0 {
        return true;
    }
    match policy {
        RetentionPolicy::KeepLast(n) => index < n.max(1),
        RetentionPolicy::KeepDays(days) => now - created_at <= Duration::days(i64::from(days)),
    }
}

fn write_archive(source: &Path, family: &str, archive_path: &Path, dir: &Path) -> Result<()> {
    let tmp = tempfile::Builder::new()
        .prefix(".backup-")
        .tempfile_in(dir)
        .io_context(|| format!("Не удалось создать временный архив в {}", dir.display()))?;

    let file = tmp
        .reopen()
        .io_context(|| "Не удалось открыть временный архив")?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);

    let meta = fs::symlink_metadata(source)
        .io_context(|| format!("Не удалось прочитать {}", source.display()))?;
    if meta.is_dir() {
        builder
            .append_dir_all(family, source)
            .io_context(|| format!("Не удалось заархивировать {}", source.display()))?;
    } else {
        builder
            .append_path_with_name(source, family)
            .io_context(|| format!("Не удалось заархивировать {}", source.display()))?;
    }

    let encoder = builder
        .into_inner()
        .io_context(|| "Не удалось завершить tar архив")?;
    let file = encoder
        .finish()
        .io_context(|| "Не удалось завершить сжатие архива")?;
    file.sync_all()
        .io_context(|| "Не удалось сбросить архив на диск")?;

    tmp.persist(archive_path).map_err(|e| {
        ProvisionError::io(
            format!("Не удалось сохранить архив {}", archive_path.display()),
            e.error,
        )
    })?;

    Ok(())
}
