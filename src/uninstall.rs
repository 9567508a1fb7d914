use std::{fs, io::ErrorKind};

use anyhow::{Context as _, Result};
use log::{info, warn};

use crate::{
    authorizer::RestartAuthorizer,
    backup::BackupManager,
    context::{Context, Effect, PlannedAction},
    error::ProvisionError,
    prompt::Prompter,
    secrets::SecretStore,
    security::Auditor,
    whitelist::ServiceWhitelist,
};

/// Что было сделано при очистке
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CleanupReport {
    pub authorization_removed: bool,
    pub whitelist_cleared: bool,
    pub secrets_wiped: usize,
    pub backups_purged: bool,
    pub planned: Vec<PlannedAction>,
}

/// Отказ оператора пропускает шаг, остальные ошибки прерывают очистку
fn declined<T>(result: crate::error::Result<T>, step: &str) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(ProvisionError::Cancelled) => {
            info!("Шаг \"{}\" пропущен", step);
            Ok(None)
        }
        Err(e) => Err(e).with_context(|| format!("Ошибка на шаге \"{}\"", step)),
    }
}

/// Удаляет права на перезапуск (правило sudoers и обертку)
pub fn remove_authorization(
    ctx: &Context,
    prompter: &dyn Prompter,
    report: &mut CleanupReport,
) -> Result<()> {
    info!("Удаление прав на перезапуск сервисов...");

    let installed = ctx.config.grant_path.exists() || ctx.config.wrapper_path.exists();
    let authorizer = RestartAuthorizer::from_context(ctx, prompter);
    match declined(authorizer.remove(), "права на перезапуск")? {
        Some(Effect::Applied(_)) => report.authorization_removed = installed,
        Some(Effect::Planned(actions)) => report.planned.extend(actions),
        None => {}
    }
    Ok(())
}

/// Очищает белый список, предварительно сохранив его в бекап
pub fn clear_whitelist(
    ctx: &Context,
    prompter: &dyn Prompter,
    report: &mut CleanupReport,
) -> Result<()> {
    info!("Очистка белого списка сервисов...");

    let whitelist = ServiceWhitelist::from_context(ctx);
    let names = whitelist.list()?;
    if names.is_empty() {
        info!("Белый список пуст, пропускаем очистку");
        return Ok(());
    }

    if !ctx.mode.is_dry_run()
        && !prompter.confirm(&format!(
            "Очистить белый список ({} сервисов)?",
            names.len()
        ))?
    {
        info!("Шаг \"белый список\" пропущен");
        return Ok(());
    }

    let backups = BackupManager::from_context(ctx);
    match backups
        .snapshot(whitelist.path())
        .context("Не удалось сохранить белый список перед очисткой")?
    {
        Effect::Planned(actions) => report.planned.extend(actions),
        Effect::Applied(snapshot) => info!("Бекап белого списка: {:?}", snapshot),
    }

    match whitelist.clear()? {
        Effect::Applied(cleared) => report.whitelist_cleared = cleared,
        Effect::Planned(actions) => report.planned.extend(actions),
    }
    Ok(())
}

/// Удаляет все сохраненные секреты
pub fn wipe_secrets(
    ctx: &Context,
    prompter: &dyn Prompter,
    report: &mut CleanupReport,
) -> Result<()> {
    info!("Удаление секретов...");

    let store = SecretStore::from_context(ctx);
    let keys = store.list()?;
    if keys.is_empty() {
        info!("Секретов нет, пропускаем удаление");
        return Ok(());
    }

    if !ctx.mode.is_dry_run()
        && !prompter.confirm(&format!(
            "Удалить все секреты ({})? Восстановить их будет невозможно",
            keys.len()
        ))?
    {
        info!("Шаг \"секреты\" пропущен");
        return Ok(());
    }

    match store.wipe_all()? {
        Effect::Applied(count) => {
            report.secrets_wiped = count;
            Auditor::from_context(ctx).success("secret_wipe", &format!("{} ключей", count))?;
        }
        Effect::Planned(actions) => report.planned.extend(actions),
    }
    Ok(())
}

/// Удаляет директорию бекапов целиком
pub fn purge_backups(
    ctx: &Context,
    prompter: &dyn Prompter,
    report: &mut CleanupReport,
) -> Result<()> {
    info!("Удаление бекапов...");

    let backups = BackupManager::from_context(ctx);
    let root = backups.root();

    if !root.exists() {
        info!("Директория {} не найдена, пропускаем удаление", root.display());
        return Ok(());
    }

    if ctx.mode.is_dry_run() {
        report
            .planned
            .push(PlannedAction::new("delete", root.display()).with_detail("recursive"));
        return Ok(());
    }

    if !prompter.confirm(&format!("Удалить все бекапы в {}?", root.display()))? {
        info!("Шаг \"бекапы\" пропущен");
        return Ok(());
    }

    match fs::remove_dir_all(root) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => {
            return Err(e).with_context(|| format!("Не удалось удалить директорию {}", root.display()))
        }
    }

    report.backups_purged = true;
    Auditor::from_context(ctx).success("backup_purge", &root.display().to_string())?;
    info!("Бекапы удалены");
    Ok(())
}

/// Полная очистка артефактов; бекапы остаются, если не запрошено иное
pub fn run_cleanup(
    ctx: &Context,
    prompter: &dyn Prompter,
    purge_backups_too: bool,
) -> Result<CleanupReport> {
    let mut report = CleanupReport::default();

    remove_authorization(ctx, prompter, &mut report)?;
    clear_whitelist(ctx, prompter, &mut report)?;
    wipe_secrets(ctx, prompter, &mut report)?;

    if purge_backups_too {
        purge_backups(ctx, prompter, &mut report)?;
    } else if ctx.config.backup_dir().exists() {
        warn!(
            "Бекапы сохранены в {} (для удаления используйте --purge-backups)",
            ctx.config.backup_dir().display()
        );
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::ProvisionConfig,
        context::ExecMode,
        prompt::scripted::{Answer, ScriptedPrompter},
    };
    use secrecy::SecretVec;
    use tempfile::TempDir;

    fn context(dir: &TempDir, mode: ExecMode) -> Context {
        let mut config = ProvisionConfig::default();
        config.artifact_root = dir.path().join("artifacts");
        config.wrapper_path = dir.path().join("bin/vps-restart-service");
        config.grant_path = dir.path().join("sudoers.d/vps-provision-restart");
        let mut ctx = Context::new(config);
        ctx.mode = mode;
        ctx
    }

    fn seed(ctx: &Context) {
        let store = SecretStore::from_context(ctx);
        store
            .put("db_password", &SecretVec::new(b"s3cretValue".to_vec()))
            .unwrap();
        store
            .put("jwt", &SecretVec::new(b"another".to_vec()))
            .unwrap();
        ServiceWhitelist::from_context(ctx).add("nginx").unwrap();
    }

    #[test]
    fn each_step_has_its_own_confirmation() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir, ExecMode::Apply);
        seed(&ctx);

        // обертки нет - шаг прав пропускается без вопроса
        let prompter = ScriptedPrompter::new(vec![Answer::Confirm(false), Answer::Confirm(true)]);
        let report = run_cleanup(&ctx, &prompter, false).unwrap();

        assert!(!report.whitelist_cleared);
        assert_eq!(report.secrets_wiped, 2);
        assert!(ServiceWhitelist::from_context(&ctx).contains("nginx").unwrap());
        assert!(SecretStore::from_context(&ctx).list().unwrap().is_empty());
        assert_eq!(prompter.remaining(), 0);
    }

    #[test]
    fn whitelist_is_backed_up_before_clearing() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir, ExecMode::Apply);
        seed(&ctx);

        let prompter = ScriptedPrompter::new(vec![Answer::Confirm(true), Answer::Confirm(false)]);
        let report = run_cleanup(&ctx, &prompter, false).unwrap();

        assert!(report.whitelist_cleared);
        let snapshots = BackupManager::from_context(&ctx)
            .list_snapshots("allowed_services")
            .unwrap();
        assert_eq!(snapshots.len(), 1);
        assert!(ServiceWhitelist::from_context(&ctx).list().unwrap().is_empty());
    }

    #[test]
    fn dry_run_cleanup_only_plans() {
        let dir = TempDir::new().unwrap();
        seed(&context(&dir, ExecMode::Apply));
        let ctx = context(&dir, ExecMode::DryRun);
        std::fs::create_dir_all(ctx.config.backup_dir()).unwrap();

        let prompter = ScriptedPrompter::new(vec![]);
        let report = run_cleanup(&ctx, &prompter, true).unwrap();

        assert!(!report.planned.is_empty());
        assert!(!report.backups_purged);
        assert_eq!(SecretStore::from_context(&ctx).list().unwrap().len(), 2);
        assert!(ServiceWhitelist::from_context(&ctx).contains("nginx").unwrap());
        assert!(ctx.config.backup_dir().exists());
    }

    #[test]
    fn purge_removes_backup_root() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir, ExecMode::Apply);
        std::fs::create_dir_all(ctx.config.backup_dir()).unwrap();

        let prompter = ScriptedPrompter::new(vec![Answer::Confirm(true)]);
        let report = run_cleanup(&ctx, &prompter, true).unwrap();
        assert!(report.backups_purged);
        assert!(!ctx.config.backup_dir().exists());
    }
}
