use std::{
    fs::{self, File, OpenOptions},
    io::Write,
    os::unix::fs::PermissionsExt,
    path::Path,
    sync::Mutex,
};

use log::{debug, warn};
use nix::fcntl::{Flock, FlockArg};
use once_cell::sync::Lazy;
use tokio::process::Command;

use crate::error::{IoContext, ProvisionError, Result};

static CURRENT_STAGE: Lazy<Mutex<String>> = Lazy::new(|| Mutex::new("запуск".to_string()));

/// Запоминает текущий этап выполнения для обработчика прерывания
pub fn enter_stage(stage: &str) {
    if let Ok(mut current) = CURRENT_STAGE.lock() {
        *current = stage.to_string();
    }
    debug!("Этап: {}", stage);
}

pub fn current_stage() -> String {
    CURRENT_STAGE
        .lock()
        .map(|s| s.clone())
        .unwrap_or_else(|_| "неизвестно".to_string())
}

/// Проверяет, запущен ли процесс от имени root
pub fn is_root() -> bool {
    nix::unistd::geteuid().is_root()
}

/// Результат выполнения внешней команды
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// Выполняет внешнюю команду без оболочки и собирает вывод
pub async fn run_command(program: &Path, args: &[&str]) -> Result<CommandOutput> {
    debug!("Выполнение команды: {} {}", program.display(), args.join(" "));

    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .io_context(|| format!("Не удалось выполнить команду {}", program.display()))?;

    Ok(CommandOutput {
        success: output.status.success(),
        code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    })
}

/// Создает директорию и выставляет права (права - по возможности)
pub fn ensure_dir(dir: &Path, mode: u32) -> Result<()> {
    fs::create_dir_all(dir)
        .io_context(|| format!("Не удалось создать директорию {}", dir.display()))?;
    set_mode_best_effort(dir, mode);
    Ok(())
}

/// Выставляет права доступа; ошибка только логируется
pub fn set_mode_best_effort(path: &Path, mode: u32) {
    if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(mode)) {
        warn!(
            "Не удалось установить права {:o} на {}: {}",
            mode,
            path.display(),
            e
        );
    }
}

/// Атомарно записывает файл: временный файл в той же директории и rename
///
/// Временный файл начинается с точки, поэтому sudo игнорирует его в
/// `/etc/sudoers.d`, пока запись не завершена.
pub fn write_atomic(path: &Path, contents: &[u8], mode: u32) -> Result<()> {
    let dir = path.parent().ok_or_else(|| ProvisionError::UnsafePath {
        path: path.to_path_buf(),
        reason: "у пути нет родительской директории".to_string(),
    })?;

    let mut tmp = tempfile::Builder::new()
        .prefix(".provision-")
        .tempfile_in(dir)
        .io_context(|| format!("Не удалось создать временный файл в {}", dir.display()))?;

    tmp.write_all(contents)
        .io_context(|| format!("Не удалось записать временный файл для {}", path.display()))?;
    tmp.as_file()
        .sync_all()
        .io_context(|| format!("Не удалось сбросить данные для {}", path.display()))?;
    set_mode_best_effort(tmp.path(), mode);

    tmp.persist(path)
        .map_err(|e| ProvisionError::io(format!("Не удалось заменить {}", path.display()), e.error))?;

    Ok(())
}

/// Удаляет файл; отсутствие файла ошибкой не считается
pub fn remove_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(ProvisionError::io(
            format!("Не удалось удалить {}", path.display()),
            e,
        )),
    }
}

/// Эксклюзивная рекомендательная блокировка на время read-modify-write
pub struct StateLock {
    _guard: Flock<File>,
}

impl StateLock {
    pub fn acquire(lock_path: &Path) -> Result<Self> {
        if let Some(parent) = lock_path.parent() {
            ensure_dir(parent, 0o700)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(lock_path)
            .io_context(|| format!("Не удалось открыть файл блокировки {}", lock_path.display()))?;

        let guard = Flock::lock(file, FlockArg::LockExclusive).map_err(|(_, errno)| {
            ProvisionError::io(
                format!("Не удалось захватить блокировку {}", lock_path.display()),
                std::io::Error::from(errno),
            )
        })?;

        debug!("Блокировка {} захвачена", lock_path.display());
        Ok(Self { _guard: guard })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn write_atomic_replaces_content_with_mode() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("file");
        write_atomic(&path, b"one", 0o600).unwrap();
        write_atomic(&path, b"two", 0o600).unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"two");
        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn remove_if_exists_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("gone");
        fs::write(&path, "x").unwrap();
        assert!(remove_if_exists(&path).unwrap());
        assert!(!remove_if_exists(&path).unwrap());
    }

    #[test]
    fn lock_can_be_reacquired_after_drop() {
        let dir = TempDir::new().unwrap();
        let lock = dir.path().join("state/provision.lock");
        {
            let _first = StateLock::acquire(&lock).unwrap();
        }
        let _second = StateLock::acquire(&lock).unwrap();
    }

    #[tokio::test]
    async fn run_command_reports_status() {
        let ok = run_command(Path::new("/bin/sh"), &["-c", "echo hi"]).await.unwrap();
        assert!(ok.success);
        assert_eq!(ok.stdout.trim(), "hi");

        let failed = run_command(Path::new("/bin/sh"), &["-c", "exit 3"]).await.unwrap();
        assert!(!failed.success);
        assert_eq!(failed.code, Some(3));
    }

    #[test]
    fn stage_is_tracked() {
        enter_stage("тестовый этап");
        assert_eq!(current_stage(), "тестовый этап");
    }
}
