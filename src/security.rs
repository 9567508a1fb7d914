use std::{
    fs::OpenOptions,
    io::Write,
    os::unix::fs::OpenOptionsExt,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Local};
use log::debug;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    context::{Context, ExecMode},
    error::{IoContext, ProvisionError, Result},
    utils,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditStatus {
    Success,
    Error,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AuditLog {
    pub id: String,
    pub timestamp: DateTime<Local>,
    pub action: String,
    pub operator: String,
    pub target: String,
    pub status: AuditStatus,
    pub details: Option<String>,
}

impl AuditLog {
    pub fn new(action: &str, target: &str, status: AuditStatus, details: Option<&str>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Local::now(),
            action: action.to_string(),
            operator: current_operator(),
            target: target.to_string(),
            status,
            details: details.map(|s| s.to_string()),
        }
    }
}

/// Оператор, запустивший утилиту (через sudo - исходный пользователь)
fn current_operator() -> String {
    std::env::var("SUDO_USER")
        .or_else(|_| std::env::var("USER"))
        .unwrap_or_else(|_| "unknown".to_string())
}

/// Журнал аудита привилегированных действий и операций с секретами
///
/// В режиме dry-run ничего не пишет.
pub struct Auditor {
    path: PathBuf,
    mode: ExecMode,
}

impl Auditor {
    pub fn new(path: impl Into<PathBuf>, mode: ExecMode) -> Self {
        Self {
            path: path.into(),
            mode,
        }
    }

    pub fn from_context(ctx: &Context) -> Self {
        Self::new(ctx.config.audit_file(), ctx.mode)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Записывает событие в журнал аудита (одна JSON строка)
    pub fn record(&self, audit_log: AuditLog) -> Result<()> {
        if self.mode.is_dry_run() {
            return Ok(());
        }

        if let Some(parent) = self.path.parent() {
            utils::ensure_dir(parent, 0o700)?;
        }

        let log_json = serde_json::to_string(&audit_log)
            .map_err(|e| ProvisionError::Other(e.to_string()))?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .mode(0o600)
            .open(&self.path)
            .io_context(|| format!("Не удалось открыть журнал аудита {}", self.path.display()))?;

        writeln!(file, "{}", log_json).io_context(|| "Не удалось записать событие аудита")?;

        debug!("Записан аудит: {} {} - {:?}", audit_log.action, audit_log.target, audit_log.status);
        Ok(())
    }

    pub fn success(&self, action: &str, target: &str) -> Result<()> {
        self.record(AuditLog::new(action, target, AuditStatus::Success, None))
    }

    pub fn failure(&self, action: &str, target: &str, details: &str) -> Result<()> {
        self.record(AuditLog::new(
            action,
            target,
            AuditStatus::Error,
            Some(details),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn events_are_appended_as_json_lines() {
        let dir = TempDir::new().unwrap();
        let auditor = Auditor::new(dir.path().join("state/audit.log"), ExecMode::Apply);
        auditor.success("secret_put", "db_password").unwrap();
        auditor
            .failure("grant_install", "/etc/sudoers.d/x", "visudo rejected")
            .unwrap();

        let content = fs::read_to_string(auditor.path()).unwrap();
        let entries: Vec<AuditLog> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].action, "secret_put");
        assert_eq!(entries[1].status, AuditStatus::Error);
        assert_ne!(entries[0].id, entries[1].id);
    }

    #[test]
    fn dry_run_records_nothing() {
        let dir = TempDir::new().unwrap();
        let auditor = Auditor::new(dir.path().join("state/audit.log"), ExecMode::DryRun);
        auditor.success("secret_put", "db").unwrap();
        assert!(!dir.path().join("state").exists());
    }
}
