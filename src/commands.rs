//! Сценарии, общие для командной строки и интерактивного меню
//!
//! Компоненты возвращают `error::Result` и сами соблюдают dry-run. Здесь
//! собираются запросы к оператору, проверка прав root, аудит и вывод.

use std::{
    io::{self, BufRead},
    path::Path,
    time::Duration,
};

use anyhow::{Context as _, Result};
use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};
use secrecy::{ExposeSecret, SecretVec};

use crate::{
    authorizer::{AuthorizationState, RestartAuthorizer},
    backup::{BackupManager, RetentionPolicy, SnapshotRef},
    context::{Context, Effect},
    error::ProvisionError,
    logger,
    ports::{self, PortAllocator, SocketProbe},
    prompt::Prompter,
    restart::{self, RestartOutcome},
    secrets::{RotateWith, SecretGenerator, SecretStore},
    security::Auditor,
    services::Systemctl,
    uninstall,
    utils,
    versions::{self, Software, VersionResolver},
    whitelist::ServiceWhitelist,
};

/// Откуда берется значение секрета
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretSource {
    Prompt,
    Stdin,
    Generate(SecretGenerator),
}

fn require_root(ctx: &Context, action: &str) -> Result<()> {
    if !ctx.mode.is_dry_run() && !utils::is_root() {
        return Err(ProvisionError::NotRoot(action.to_string()).into());
    }
    Ok(())
}

/// Подтверждение разрушительного действия; в dry-run не спрашивается
fn confirm_destructive(ctx: &Context, prompter: &dyn Prompter, message: &str) -> Result<()> {
    if ctx.mode.is_dry_run() || prompter.confirm(message)? {
        Ok(())
    } else {
        Err(ProvisionError::Cancelled.into())
    }
}

fn report_effect<T>(effect: &Effect<T>, message: &str) {
    match effect {
        Effect::Applied(_) => logger::success(message),
        Effect::Planned(_) => effect.report(),
    }
}

/// Запрашивает значение у оператора, пустое значение не принимается
pub fn read_operator_secret(prompter: &dyn Prompter, key: &str) -> Result<SecretVec<u8>> {
    loop {
        let value = prompter.password(&format!("Значение секрета {}", key))?;
        if value.trim().is_empty() {
            warn!("{}", ProvisionError::EmptySecret);
            continue;
        }
        return Ok(SecretVec::new(value.into_bytes()));
    }
}

fn read_stdin_secret() -> Result<SecretVec<u8>> {
    let mut line = String::new();
    io::stdin()
        .lock()
        .read_line(&mut line)
        .context("Не удалось прочитать значение из stdin")?;
    let value = line.trim_end_matches(['\r', '\n']).to_string();
    if value.trim().is_empty() {
        return Err(ProvisionError::EmptySecret.into());
    }
    Ok(SecretVec::new(value.into_bytes()))
}

fn obtain_secret(
    prompter: &dyn Prompter,
    key: &str,
    source: SecretSource,
) -> Result<SecretVec<u8>> {
    match source {
        SecretSource::Prompt => read_operator_secret(prompter, key),
        SecretSource::Stdin => read_stdin_secret(),
        SecretSource::Generate(generator) => Ok(generator.generate()?),
    }
}

pub fn secret_put(
    ctx: &Context,
    prompter: &dyn Prompter,
    key: &str,
    source: SecretSource,
) -> Result<()> {
    let store = SecretStore::from_context(ctx);
    if store.exists(key)? {
        confirm_destructive(
            ctx,
            prompter,
            &format!("Секрет {} уже существует. Перезаписать?", key),
        )?;
    }

    let value = obtain_secret(prompter, key, source)?;
    let effect = store.put(key, &value)?;
    if !effect.is_planned() {
        Auditor::from_context(ctx).success("secret_put", key)?;
    }
    report_effect(&effect, &format!("Секрет {} сохранен", key));
    Ok(())
}

/// Показывает значение только после явного подтверждения
pub fn secret_get(ctx: &Context, prompter: &dyn Prompter, key: &str) -> Result<()> {
    let store = SecretStore::from_context(ctx);
    let value = store.get(key)?;

    if !prompter.confirm(&format!(
        "Показать значение секрета {} в открытом виде?",
        key
    ))? {
        return Err(ProvisionError::Cancelled.into());
    }

    let text = String::from_utf8_lossy(value.expose_secret()).to_string();
    logger::secret_reveal(key, &text);
    Auditor::from_context(ctx).success("secret_reveal", key)?;
    Ok(())
}

pub fn secret_rotate(
    ctx: &Context,
    prompter: &dyn Prompter,
    key: &str,
    source: SecretSource,
) -> Result<()> {
    let store = SecretStore::from_context(ctx);
    if !store.exists(key)? {
        return Err(ProvisionError::SecretNotFound(key.to_string()).into());
    }

    confirm_destructive(
        ctx,
        prompter,
        &format!(
            "Заменить секрет {}? Прежнее значение будет потеряно безвозвратно",
            key
        ),
    )?;

    let with = match source {
        SecretSource::Generate(generator) => RotateWith::Generate(generator),
        other => RotateWith::Value(obtain_secret(prompter, key, other)?),
    };

    let effect = store.rotate(key, with)?;
    if !effect.is_planned() {
        Auditor::from_context(ctx).success("secret_rotate", key)?;
    }
    report_effect(&effect, &format!("Секрет {} заменен", key));
    Ok(())
}

pub fn secret_list(ctx: &Context) -> Result<()> {
    let store = SecretStore::from_context(ctx);
    let secrets = store.list()?;
    if secrets.is_empty() {
        info!("Секретов нет ({})", store.dir().display());
        return Ok(());
    }
    for (key, len) in secrets {
        println!("{:<32} {} байт", key, len);
    }
    Ok(())
}

pub fn secret_delete(ctx: &Context, prompter: &dyn Prompter, key: &str) -> Result<()> {
    let store = SecretStore::from_context(ctx);
    confirm_destructive(ctx, prompter, &format!("Удалить секрет {}?", key))?;

    let effect = store.delete(key)?;
    if let Effect::Applied(true) = effect {
        Auditor::from_context(ctx).success("secret_delete", key)?;
    }
    report_effect(&effect, &format!("Секрет {} удален", key));
    Ok(())
}

pub fn secret_wipe(ctx: &Context, prompter: &dyn Prompter) -> Result<()> {
    let mut report = uninstall::CleanupReport::default();
    uninstall::wipe_secrets(ctx, prompter, &mut report)?;
    for action in &report.planned {
        logger::dry_run(&action.to_string());
    }
    Ok(())
}

pub fn whitelist_add(ctx: &Context, service: &str) -> Result<()> {
    let whitelist = ServiceWhitelist::from_context(ctx);
    let effect = whitelist.add(service)?;
    if let Effect::Applied(true) = &effect {
        Auditor::from_context(ctx).success("whitelist_add", service)?;
        info!(
            "Чтобы выдать право на перезапуск {}, выполните authorize install",
            service
        );
    }
    report_effect(&effect, &format!("Сервис {} в белом списке", service));
    Ok(())
}

pub fn whitelist_remove(ctx: &Context, service: &str) -> Result<()> {
    let whitelist = ServiceWhitelist::from_context(ctx);
    let effect = whitelist.remove(service)?;
    if let Effect::Applied(true) = &effect {
        Auditor::from_context(ctx).success("whitelist_remove", service)?;
    }
    report_effect(&effect, &format!("Сервис {} удален из белого списка", service));
    Ok(())
}

pub fn whitelist_list(ctx: &Context) -> Result<()> {
    let names = ServiceWhitelist::from_context(ctx).list()?;
    if names.is_empty() {
        info!("Белый список пуст");
    }
    for name in names {
        println!("{}", name);
    }
    Ok(())
}

/// true, если сервис в белом списке
pub fn whitelist_check(ctx: &Context, service: &str) -> Result<bool> {
    let allowed = ServiceWhitelist::from_context(ctx).contains(service)?;
    println!(
        "{}: {}",
        service,
        if allowed { "разрешен" } else { "не разрешен" }
    );
    Ok(allowed)
}

pub async fn authorize_install(
    ctx: &Context,
    prompter: &dyn Prompter,
    principal: Option<&str>,
) -> Result<()> {
    require_root(ctx, "установка правила sudoers")?;
    let principal = principal.unwrap_or(&ctx.config.principal);
    let effect = RestartAuthorizer::from_context(ctx, prompter)
        .install(principal)
        .await?;

    report_effect(
        &effect,
        &format!("Пользователь {} может перезапускать сервисы из белого списка", principal),
    );
    Ok(())
}

pub fn authorize_remove(ctx: &Context, prompter: &dyn Prompter) -> Result<()> {
    require_root(ctx, "удаление правила sudoers")?;
    let effect = RestartAuthorizer::from_context(ctx, prompter).remove()?;
    report_effect(&effect, "Права на перезапуск удалены");
    Ok(())
}

pub async fn authorize_status(
    ctx: &Context,
    prompter: &dyn Prompter,
    principal: Option<&str>,
) -> Result<()> {
    let principal = principal.unwrap_or(&ctx.config.principal);
    let state = RestartAuthorizer::from_context(ctx, prompter)
        .status(principal)
        .await?;

    println!("Состояние: {}", state);
    if !state.is_active() && state != AuthorizationState::NotInstalled {
        warn!("Установка неполная, повторите authorize install");
    }
    println!("Пользователь: {}", principal);
    println!("Обертка: {}", ctx.config.wrapper_path.display());
    println!("Правило: {}", ctx.config.grant_path.display());
    println!("Журнал аудита: {}", Auditor::from_context(ctx).path().display());
    let names = ServiceWhitelist::from_context(ctx).list()?;
    println!(
        "Белый список: {}",
        names
            .iter()
            .map(|n| n.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );
    Ok(())
}

/// Перезапуск через ту же проверку, что и в обертке; возвращает код выхода
pub async fn restart_service(ctx: &Context, service: &str) -> Result<i32> {
    let whitelist = ServiceWhitelist::from_context(ctx);
    let systemd = Systemctl::new(ctx.config.systemctl_path.clone());

    if ctx.mode.is_dry_run() {
        return Ok(match restart::admit(&whitelist, service) {
            Ok(name) => {
                logger::dry_run(&format!("restart {}", name));
                restart::EXIT_OK
            }
            Err(outcome) => {
                logger::dry_run(&format!("restart {}: не разрешен", service));
                outcome.exit_code()
            }
        });
    }

    let outcome = restart::invoke(&whitelist, &systemd, service).await;
    match &outcome {
        RestartOutcome::Restarted => logger::success(&format!("Сервис {} перезапущен", service)),
        RestartOutcome::Usage(reason) => warn!("{}", reason),
        RestartOutcome::NotAllowed => warn!("Сервис {} не в белом списке", service),
        RestartOutcome::UnitNotFound => warn!("Юнит {} не найден", service),
        RestartOutcome::Failed(reason) => warn!("Перезапуск {} не удался: {}", service, reason),
    }
    Ok(outcome.exit_code())
}

pub fn backup_snapshot(ctx: &Context, path: &Path) -> Result<()> {
    let effect = BackupManager::from_context(ctx).snapshot(path)?;
    match &effect {
        Effect::Applied(SnapshotRef::Created(archive)) => {
            logger::success(&format!("Бекап создан: {}", archive.display()))
        }
        Effect::Applied(SnapshotRef::Skipped(source)) => {
            info!("{} не существует, бекап пропущен", source.display())
        }
        Effect::Planned(_) => effect.report(),
    }
    Ok(())
}

pub fn backup_list(ctx: &Context, family: &str) -> Result<()> {
    let snapshots = BackupManager::from_context(ctx).list_snapshots(family)?;
    if snapshots.is_empty() {
        info!("Бекапов {} нет", family);
    }
    for snapshot in snapshots {
        println!(
            "{}  {}{}",
            snapshot.created_at.format("%Y-%m-%d %H:%M:%S%.3f"),
            snapshot.archive_path.display(),
            if snapshot.retained { "" } else { "  (будет удален)" }
        );
    }
    Ok(())
}

pub fn backup_prune(ctx: &Context, prompter: &dyn Prompter, family: &str) -> Result<()> {
    let manager = BackupManager::from_context(ctx);
    let doomed = manager
        .list_snapshots(family)?
        .into_iter()
        .filter(|s| !s.retained)
        .count();
    if doomed == 0 {
        info!("Для {} нечего удалять", family);
        return Ok(());
    }

    confirm_destructive(
        ctx,
        prompter,
        &format!("Удалить {} старых бекапов {}?", doomed, family),
    )?;
    let effect = manager.prune(family)?;
    effect.report();
    if let Some(deleted) = effect.applied() {
        logger::success(&format!("Удалено старых бекапов {}: {}", family, deleted.len()));
    }
    Ok(())
}

pub fn backup_restore(
    ctx: &Context,
    prompter: &dyn Prompter,
    archive: &Path,
    into_dir: &Path,
) -> Result<()> {
    confirm_destructive(
        ctx,
        prompter,
        &format!(
            "Восстановить {} в {}? Текущее состояние будет сохранено в бекап",
            archive.display(),
            into_dir.display()
        ),
    )?;

    let effect = BackupManager::from_context(ctx).restore(archive, into_dir)?;
    if let Effect::Applied(target) = &effect {
        Auditor::from_context(ctx).success("backup_restore", &target.display().to_string())?;
    }
    report_effect(&effect, &format!("Восстановлено из {}", archive.display()));
    Ok(())
}

pub fn backup_retention(ctx: &Context, policy: Option<RetentionPolicy>) -> Result<()> {
    let manager = BackupManager::from_context(ctx);
    match policy {
        None => println!("Политика хранения: {}", manager.retention()?),
        Some(policy) => {
            let effect = manager.set_retention(policy)?;
            report_effect(&effect, &format!("Политика хранения: {}", policy));
        }
    }
    Ok(())
}

pub async fn show_versions(
    ctx: &Context,
    prompter: &dyn Prompter,
    software: Software,
    choose: bool,
) -> Result<Option<String>> {
    let timeout = Duration::from_secs(ctx.config.http_timeout_secs);

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.cyan} {msg}")
            .context("Некорректный шаблон индикатора")?,
    );
    spinner.set_message(format!("Получение версий {}...", software));
    spinner.enable_steady_tick(Duration::from_millis(100));

    let catalog = VersionResolver::standard(timeout).resolve(software).await;
    spinner.finish_and_clear();

    if catalog.is_stale() {
        warn!(
            "Список версий {} взят из встроенной таблицы и может быть устаревшим",
            software
        );
    }
    println!(
        "{} ({}): {}",
        software,
        catalog.source,
        catalog.versions.join(", ")
    );

    if !choose {
        return Ok(None);
    }
    let chosen = versions::choose_version(&catalog, prompter)?;
    logger::success(&format!("Выбрана версия {} {}", software, chosen));
    Ok(Some(chosen))
}

pub async fn port_check(
    ctx: &Context,
    prompter: &dyn Prompter,
    raw_port: &str,
    purpose: Option<&str>,
) -> Result<u16> {
    let port = ports::parse_port(raw_port)?;
    let allocator = PortAllocator::new(
        Box::new(SocketProbe::default()),
        prompter,
        ctx.interaction,
    );

    match purpose {
        None => {
            let free = allocator.is_available(port).await?;
            println!(
                "Порт {}: {}",
                port,
                if free { "свободен" } else { "занят" }
            );
            Ok(port)
        }
        Some(purpose) => {
            let decision = allocator.resolve_conflict(port, purpose).await?;
            if decision.forced {
                warn!("Порт {} для {} занят, выбран принудительно", decision.port, purpose);
            }
            println!("{}", decision.port);
            Ok(decision.port)
        }
    }
}

/// Текущая конфигурация с учетом флагов командной строки
pub fn config_show(ctx: &Context) -> Result<()> {
    let json = serde_json::to_string_pretty(&ctx.config)
        .context("Не удалось сериализовать конфигурацию")?;
    println!("{}", json);
    Ok(())
}

/// Записывает действующую конфигурацию в файл
pub fn config_init(ctx: &Context, prompter: &dyn Prompter, path: &Path) -> Result<()> {
    if ctx.mode.is_dry_run() {
        logger::dry_run(&format!("write {}", path.display()));
        return Ok(());
    }
    if path.exists() {
        confirm_destructive(
            ctx,
            prompter,
            &format!("Файл {} уже существует. Перезаписать?", path.display()),
        )?;
    }

    ctx.config.save(path)?;
    logger::success(&format!("Конфигурация записана в {}", path.display()));
    Ok(())
}

pub fn cleanup(ctx: &Context, prompter: &dyn Prompter, purge_backups: bool) -> Result<()> {
    if !ctx.mode.is_dry_run()
        && (ctx.config.grant_path.exists() || ctx.config.wrapper_path.exists())
    {
        require_root(ctx, "удаление правила sudoers")?;
    }

    let report = uninstall::run_cleanup(ctx, prompter, purge_backups)?;
    for action in &report.planned {
        logger::dry_run(&action.to_string());
    }
    if !ctx.mode.is_dry_run() {
        logger::success(&format!(
            "Очистка завершена: права {}, белый список {}, секретов удалено {}, бекапы {}",
            if report.authorization_removed { "удалены" } else { "без изменений" },
            if report.whitelist_cleared { "очищен" } else { "без изменений" },
            report.secrets_wiped,
            if report.backups_purged { "удалены" } else { "сохранены" }
        ));
    }
    Ok(())
}
