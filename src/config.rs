use std::{
    fs::{self, File},
    io::{Read, Write},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use log::info;
use serde::{Deserialize, Serialize};

use crate::backup::RetentionPolicy;

// Константы путей внутри корня артефактов
pub const CREDENTIALS_DIR: &str = "credentials";
pub const WHITELIST_DIR: &str = "whitelist";
pub const WHITELIST_FILE: &str = "allowed_services";
pub const BACKUP_DIR: &str = "backups";
pub const STATE_DIR: &str = "state";
pub const RETENTION_FILE: &str = "retention.json";
pub const AUDIT_FILE: &str = "audit.log";
pub const LOCK_FILE: &str = "provision.lock";

pub const DEFAULT_CONFIG_PATH: &str = "/etc/vps-provision/config.json";
pub const DEFAULT_ARTIFACT_ROOT: &str = "/var/lib/vps-provision";

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct ProvisionConfig {
    pub log_level: String,
    pub artifact_root: PathBuf,
    pub wrapper_path: PathBuf,
    pub grant_path: PathBuf,
    pub principal: String,
    pub systemctl_path: PathBuf,
    pub visudo_path: PathBuf,
    pub retention: RetentionPolicy,
    pub http_timeout_secs: u64,
    pub secret_length: usize,
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            artifact_root: PathBuf::from(DEFAULT_ARTIFACT_ROOT),
            wrapper_path: PathBuf::from("/usr/local/bin/vps-restart-service"),
            grant_path: PathBuf::from("/etc/sudoers.d/vps-provision-restart"),
            principal: "github-runner".to_string(),
            systemctl_path: PathBuf::from("/usr/bin/systemctl"),
            visudo_path: PathBuf::from("/usr/sbin/visudo"),
            retention: RetentionPolicy::KeepLast(5),
            http_timeout_secs: 10,
            secret_length: 32,
        }
    }
}

impl ProvisionConfig {
    /// Загружает конфигурацию; при отсутствии файла возвращает значения по умолчанию
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            info!(
                "Конфигурационный файл {:?} не найден, используются значения по умолчанию",
                path
            );
            return Ok(Self::default());
        }

        let mut file = File::open(path)
            .with_context(|| format!("Не удалось открыть файл конфигурации: {:?}", path))?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .with_context(|| format!("Не удалось прочитать файл конфигурации: {:?}", path))?;

        serde_json::from_str(&contents).with_context(|| {
            format!(
                "Не удалось десериализовать конфигурацию из файла: {:?}",
                path
            )
        })
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .with_context(|| "Не удалось сериализовать конфигурацию в JSON")?;

        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Не удалось создать директорию: {:?}", parent))?;
        }

        let mut file = File::create(path)
            .with_context(|| format!("Не удалось создать файл конфигурации: {:?}", path))?;
        file.write_all(json.as_bytes())
            .with_context(|| format!("Не удалось записать в файл конфигурации: {:?}", path))?;

        info!("Конфигурация сохранена в {:?}", path);
        Ok(())
    }

    /// Полный путь к поддиректории корня артефактов
    pub fn full_path(&self, subdir: &str) -> PathBuf {
        self.artifact_root.join(subdir)
    }

    pub fn credentials_dir(&self) -> PathBuf {
        self.full_path(CREDENTIALS_DIR)
    }

    pub fn whitelist_file(&self) -> PathBuf {
        self.full_path(WHITELIST_DIR).join(WHITELIST_FILE)
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.full_path(BACKUP_DIR)
    }

    pub fn state_dir(&self) -> PathBuf {
        self.full_path(STATE_DIR)
    }

    pub fn lock_file(&self) -> PathBuf {
        self.state_dir().join(LOCK_FILE)
    }

    pub fn audit_file(&self) -> PathBuf {
        self.state_dir().join(AUDIT_FILE)
    }
}
