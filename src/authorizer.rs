//! Граница привилегий для перезапуска сервисов
//!
//! Устанавливает обертку, которая перезапускает только юниты из белого
//! списка, и правило sudoers, разрешающее пользователю CI вызывать именно
//! эту обертку. Правило содержит по строке на каждый разрешенный сервис, а
//! обертка при каждом вызове повторно проверяет белый список, поэтому
//! устаревшее правило после сокращения списка ничего не разрешает.

use std::{
    fmt, fs,
    io::{ErrorKind, Write},
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use log::{info, warn};
use regex::Regex;

use crate::{
    context::{Context, Effect, ExecMode, Interaction, PlannedAction, SudoersConsent},
    error::{IoContext, ProvisionError, Result},
    prompt::Prompter,
    restart::{EXIT_NOT_ALLOWED, EXIT_OK, EXIT_RESTART_FAILED, EXIT_UNIT_NOT_FOUND, EXIT_USAGE},
    sanitize::{shell_quote, CommandPath, Principal, ServiceName},
    security::Auditor,
    utils::{self, StateLock},
    whitelist::ServiceWhitelist,
};

const WRAPPER_MODE: u32 = 0o755;
const GRANT_MODE: u32 = 0o440;

/// Состояние установки, восстановленное с диска
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthorizationState {
    NotInstalled,
    WrapperWritten,
    GrantWritten,
    Active,
}

impl AuthorizationState {
    pub fn is_active(self) -> bool {
        self == AuthorizationState::Active
    }
}

impl fmt::Display for AuthorizationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthorizationState::NotInstalled => f.write_str("не установлено"),
            AuthorizationState::WrapperWritten => f.write_str("обертка без правила sudoers"),
            AuthorizationState::GrantWritten => f.write_str("правило sudoers не актуально"),
            AuthorizationState::Active => f.write_str("активно"),
        }
    }
}

/// Проверка синтаксиса правила перед активацией
#[async_trait]
pub trait GrantValidator: Send + Sync {
    async fn validate(&self, grant_file: &Path) -> Result<()>;
}

/// `visudo -cf <file>`
pub struct Visudo {
    binary: PathBuf,
}

impl Visudo {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

#[async_trait]
impl GrantValidator for Visudo {
    async fn validate(&self, grant_file: &Path) -> Result<()> {
        let file = grant_file.to_string_lossy().to_string();
        let output = utils::run_command(&self.binary, &["-cf", file.as_str()]).await?;
        if output.success {
            Ok(())
        } else {
            let reason = format!("{}{}", output.stdout.trim(), output.stderr.trim());
            Err(ProvisionError::GrantInvalid(reason))
        }
    }
}

/// Пути, участвующие в установке
#[derive(Debug, Clone)]
pub struct AuthorizerPaths {
    pub wrapper: PathBuf,
    pub grant: PathBuf,
    pub systemctl: PathBuf,
    pub lock: PathBuf,
    /// Директория, начиная с которой проверяются владельцы и права пути обертки
    pub trusted_root: PathBuf,
}

impl AuthorizerPaths {
    pub fn from_context(ctx: &Context) -> Self {
        Self {
            wrapper: ctx.config.wrapper_path.clone(),
            grant: ctx.config.grant_path.clone(),
            systemctl: ctx.config.systemctl_path.clone(),
            lock: ctx.config.lock_file(),
            trusted_root: PathBuf::from("/"),
        }
    }
}

/// Скрипт обертки; коды выхода совпадают с `restart::RestartOutcome`
pub fn render_wrapper(whitelist_path: &Path, systemctl: &CommandPath) -> String {
    format!(
        r#"#!/bin/sh
# Перезапуск systemd юнитов из белого списка.
# Файл создан vps_provision и будет перезаписан при следующей установке.
set -u
PATH=/usr/sbin:/usr/bin:/sbin:/bin
export PATH

WHITELIST={whitelist}
SYSTEMCTL={systemctl}

if [ "$#" -ne 1 ]; then
    echo "Использование: $0 <service>" >&2
    exit {usage}
fi

SERVICE=$1
case "$SERVICE" in
    ""|-*|*[!A-Za-z0-9._@-]*)
        echo "Недопустимое имя сервиса: $SERVICE" >&2
        exit {usage}
        ;;
esac

if [ ! -r "$WHITELIST" ] || ! grep -Fxq -- "$SERVICE" "$WHITELIST"; then
    echo "Перезапуск $SERVICE не разрешен" >&2
    exit {not_allowed}
fi

LOAD_STATE=$("$SYSTEMCTL" show -p LoadState --value -- "$SERVICE" 2>/dev/null)
if [ -z "$LOAD_STATE" ] || [ "$LOAD_STATE" = "not-found" ]; then
    echo "Юнит $SERVICE не найден" >&2
    exit {not_found}
fi

"$SYSTEMCTL" restart -- "$SERVICE"

if "$SYSTEMCTL" is-active --quiet -- "$SERVICE"; then
    echo "Сервис $SERVICE перезапущен"
    exit {ok}
fi

echo "Сервис $SERVICE не активен после перезапуска" >&2
exit {failed}
"#,
        whitelist = shell_quote(&whitelist_path.to_string_lossy()),
        systemctl = shell_quote(&systemctl.to_string()),
        usage = EXIT_USAGE,
        not_allowed = EXIT_NOT_ALLOWED,
        not_found = EXIT_UNIT_NOT_FOUND,
        ok = EXIT_OK,
        failed = EXIT_RESTART_FAILED,
    )
}

/// Правило sudoers: по строке на каждый разрешенный сервис, без шаблонов
pub fn render_grant<'s>(
    principal: &Principal,
    wrapper: &CommandPath,
    services: impl IntoIterator<Item = &'s ServiceName>,
) -> String {
    let mut grant = String::from(
        "# Создано vps_provision: перезапуск сервисов из белого списка.\n\
         # Не редактируйте вручную, файл перезаписывается при установке.\n",
    );
    for service in services {
        grant.push_str(&format!(
            "{} ALL=(root) NOPASSWD: {} {}\n",
            principal, wrapper, service
        ));
    }
    grant
}

/// Каждая строка правила называет ровно обертку и одно имя сервиса
pub fn check_grant_structure(grant: &str, principal: &Principal, wrapper: &CommandPath) -> Result<()> {
    let pattern = format!(
        r"^{} ALL=\(root\) NOPASSWD: {} [A-Za-z0-9._@][A-Za-z0-9._@-]*$",
        regex::escape(principal.as_str()),
        regex::escape(&wrapper.to_string())
    );
    let rule = Regex::new(&pattern).map_err(|e| ProvisionError::Other(e.to_string()))?;

    let mut rules = 0;
    for line in grant.lines() {
        let line = line.trim_end();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if !rule.is_match(line) {
            return Err(ProvisionError::GrantInvalid(format!(
                "недопустимая строка правила: {:?}",
                line
            )));
        }
        rules += 1;
    }

    if rules == 0 {
        return Err(ProvisionError::GrantInvalid("правило не содержит команд".to_string()));
    }
    Ok(())
}

/// Обертку нельзя подменить, если ни она, ни ее существующие родители
/// не являются симлинками, не доступны на запись группе или всем и
/// принадлежат root или текущему пользователю.
pub fn check_trusted_location(path: &Path, trusted_root: &Path) -> Result<()> {
    let owner = nix::unistd::geteuid().as_raw();

    for candidate in path.ancestors().filter(|p| p.starts_with(trusted_root)) {
        let meta = match fs::symlink_metadata(candidate) {
            Ok(meta) => meta,
            Err(e) if e.kind() == ErrorKind::NotFound => continue,
            Err(e) => {
                return Err(ProvisionError::io(
                    format!("Не удалось проверить {}", candidate.display()),
                    e,
                ))
            }
        };

        let reason = if meta.file_type().is_symlink() {
            Some("символическая ссылка")
        } else if meta.mode() & 0o022 != 0 {
            Some("доступен на запись группе или всем")
        } else if meta.uid() != 0 && meta.uid() != owner {
            Some("принадлежит другому пользователю")
        } else {
            None
        };

        if let Some(reason) = reason {
            return Err(ProvisionError::UnsafePath {
                path: candidate.to_path_buf(),
                reason: reason.to_string(),
            });
        }
    }

    Ok(())
}

pub struct RestartAuthorizer<'a> {
    paths: AuthorizerPaths,
    whitelist: ServiceWhitelist,
    validator: Box<dyn GrantValidator>,
    auditor: Auditor,
    prompter: &'a dyn Prompter,
    mode: ExecMode,
    interaction: Interaction,
    consent: SudoersConsent,
}

impl<'a> RestartAuthorizer<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        paths: AuthorizerPaths,
        whitelist: ServiceWhitelist,
        validator: Box<dyn GrantValidator>,
        auditor: Auditor,
        prompter: &'a dyn Prompter,
        mode: ExecMode,
        interaction: Interaction,
        consent: SudoersConsent,
    ) -> Self {
        Self {
            paths,
            whitelist,
            validator,
            auditor,
            prompter,
            mode,
            interaction,
            consent,
        }
    }

    pub fn from_context(ctx: &Context, prompter: &'a dyn Prompter) -> Self {
        Self::new(
            AuthorizerPaths::from_context(ctx),
            ServiceWhitelist::from_context(ctx),
            Box::new(Visudo::new(ctx.config.visudo_path.clone())),
            Auditor::from_context(ctx),
            prompter,
            ctx.mode,
            ctx.interaction,
            ctx.sudoers_consent,
        )
    }

    /// Устанавливает или обновляет обертку и правило sudoers
    pub async fn install(&self, principal: &str) -> Result<Effect<AuthorizationState>> {
        if self.interaction == Interaction::Headless && self.consent != SudoersConsent::Granted {
            return Err(ProvisionError::SudoersConsentRequired);
        }

        let principal = Principal::parse(principal)?;
        let wrapper_path = CommandPath::parse(&self.paths.wrapper)?;
        let systemctl = CommandPath::parse(&self.paths.systemctl)?;
        check_trusted_location(wrapper_path.as_path(), &self.paths.trusted_root)?;

        let _lock = if self.mode.is_dry_run() {
            None
        } else {
            Some(StateLock::acquire(&self.paths.lock)?)
        };

        let services = self.whitelist.list()?;
        if services.is_empty() {
            return Err(ProvisionError::EmptyWhitelist);
        }

        let wrapper = render_wrapper(self.whitelist.path(), &systemctl);
        let grant = render_grant(&principal, &wrapper_path, &services);
        check_grant_structure(&grant, &principal, &wrapper_path)?;

        let service_list = services
            .iter()
            .map(ServiceName::as_str)
            .collect::<Vec<_>>()
            .join(", ");

        if self.mode.is_dry_run() {
            return Ok(Effect::Planned(vec![
                PlannedAction::new("write", &wrapper_path)
                    .with_detail(format!("mode {:o}, {} bytes", WRAPPER_MODE, wrapper.len())),
                PlannedAction::new("write", self.paths.grant.display()).with_detail(format!(
                    "mode {:o}, {} ALL=(root) NOPASSWD: {} <{}>",
                    GRANT_MODE, principal, wrapper_path, service_list
                )),
                PlannedAction::new("validate", self.paths.grant.display())
                    .with_detail("visudo -cf"),
            ]));
        }

        if self.interaction == Interaction::Interactive {
            let confirmed = self.prompter.confirm(&format!(
                "Разрешить пользователю {} перезапуск сервисов [{}] через sudo?",
                principal, service_list
            ))?;
            if !confirmed {
                return Err(ProvisionError::Cancelled);
            }
        }

        if let Err(e) = self.write_wrapper(wrapper_path.as_path(), &wrapper) {
            self.rollback();
            self.audit_failure("authorize_install", principal.as_str(), &e);
            return Err(e);
        }
        info!("Обертка перезапуска записана: {}", wrapper_path);

        if let Err(e) = self.write_grant(&grant).await {
            self.rollback();
            self.audit_failure("authorize_install", principal.as_str(), &e);
            return Err(e);
        }

        info!(
            "Пользователю {} разрешен перезапуск: {}",
            principal, service_list
        );
        self.auditor
            .success("authorize_install", &format!("{} [{}]", principal, service_list))?;

        Ok(Effect::Applied(AuthorizationState::Active))
    }

    /// Удаляет правило sudoers, затем обертку; повторный вызов безопасен
    pub fn remove(&self) -> Result<Effect<AuthorizationState>> {
        if self.mode.is_dry_run() {
            let mut actions = Vec::new();
            if self.paths.grant.exists() {
                actions.push(PlannedAction::new("delete", self.paths.grant.display()));
            }
            if self.paths.wrapper.exists() {
                actions.push(PlannedAction::new("delete", self.paths.wrapper.display()));
            }
            return Ok(Effect::Planned(actions));
        }

        if !self.paths.grant.exists() && !self.paths.wrapper.exists() {
            info!("Права на перезапуск не установлены, удалять нечего");
            return Ok(Effect::Applied(AuthorizationState::NotInstalled));
        }

        if !self
            .prompter
            .confirm("Удалить правило sudoers и обертку перезапуска?")?
        {
            return Err(ProvisionError::Cancelled);
        }

        let _lock = StateLock::acquire(&self.paths.lock)?;
        let grant_removed = utils::remove_if_exists(&self.paths.grant)?;
        let wrapper_removed = utils::remove_if_exists(&self.paths.wrapper)?;

        info!(
            "Права на перезапуск удалены (правило: {}, обертка: {})",
            grant_removed, wrapper_removed
        );
        self.auditor
            .success("authorize_remove", &self.paths.grant.display().to_string())?;

        Ok(Effect::Applied(AuthorizationState::NotInstalled))
    }

    /// Active - только если оба файла совпадают с тем, что дала бы установка сейчас
    pub async fn status(&self, principal: &str) -> Result<AuthorizationState> {
        let wrapper_exists = self.paths.wrapper.exists();
        let grant_exists = self.paths.grant.exists();

        match (wrapper_exists, grant_exists) {
            (false, false) => return Ok(AuthorizationState::NotInstalled),
            (true, false) => return Ok(AuthorizationState::WrapperWritten),
            (false, true) => return Ok(AuthorizationState::GrantWritten),
            (true, true) => {}
        }

        if let Err(e) = check_trusted_location(&self.paths.wrapper, &self.paths.trusted_root) {
            warn!("Обертку {} можно подменить: {}", self.paths.wrapper.display(), e);
            return Ok(AuthorizationState::WrapperWritten);
        }

        let principal = Principal::parse(principal)?;
        let wrapper_path = CommandPath::parse(&self.paths.wrapper)?;
        let systemctl = CommandPath::parse(&self.paths.systemctl)?;
        let services = self.whitelist.list()?;

        let expected_wrapper = render_wrapper(self.whitelist.path(), &systemctl);
        let expected_grant = render_grant(&principal, &wrapper_path, &services);

        let actual_wrapper = fs::read_to_string(&self.paths.wrapper)
            .io_context(|| format!("Не удалось прочитать {}", self.paths.wrapper.display()))?;
        let actual_grant = fs::read_to_string(&self.paths.grant)
            .io_context(|| format!("Не удалось прочитать {}", self.paths.grant.display()))?;

        if actual_wrapper != expected_wrapper {
            warn!("Обертка {} отличается от ожидаемой", self.paths.wrapper.display());
            return Ok(AuthorizationState::WrapperWritten);
        }
        if services.is_empty() || actual_grant != expected_grant {
            warn!(
                "Правило {} не соответствует текущему белому списку",
                self.paths.grant.display()
            );
            return Ok(AuthorizationState::GrantWritten);
        }
        if let Err(e) = self.validator.validate(&self.paths.grant).await {
            warn!("Правило {} не прошло проверку: {}", self.paths.grant.display(), e);
            return Ok(AuthorizationState::GrantWritten);
        }

        Ok(AuthorizationState::Active)
    }

    fn write_wrapper(&self, target: &Path, script: &str) -> Result<()> {
        let wrapper_error = |reason: String| ProvisionError::WrapperInstall {
            path: target.to_path_buf(),
            reason,
        };

        ensure_parent(target, 0o755).map_err(|e| wrapper_error(e.to_string()))?;
        utils::write_atomic(target, script.as_bytes(), WRAPPER_MODE)
            .map_err(|e| wrapper_error(e.to_string()))
    }

    /// Правило сначала пишется во временный файл с точкой в начале имени
    /// (sudo такие файлы в sudoers.d пропускает), проверяется и только потом
    /// переименовывается на место.
    async fn write_grant(&self, grant: &str) -> Result<()> {
        let dir = self
            .paths
            .grant
            .parent()
            .ok_or_else(|| ProvisionError::UnsafePath {
                path: self.paths.grant.clone(),
                reason: "у пути нет родительской директории".to_string(),
            })?;
        ensure_parent(&self.paths.grant, 0o750)?;

        let mut staged = tempfile::Builder::new()
            .prefix(".provision-")
            .tempfile_in(dir)
            .io_context(|| format!("Не удалось создать временный файл в {}", dir.display()))?;
        staged
            .write_all(grant.as_bytes())
            .io_context(|| "Не удалось записать правило sudoers")?;
        staged
            .as_file()
            .sync_all()
            .io_context(|| "Не удалось сбросить правило sudoers на диск")?;
        utils::set_mode_best_effort(staged.path(), GRANT_MODE);

        self.validator.validate(staged.path()).await?;

        staged.persist(&self.paths.grant).map_err(|e| {
            ProvisionError::io(
                format!("Не удалось установить {}", self.paths.grant.display()),
                e.error,
            )
        })?;

        self.validator.validate(&self.paths.grant).await
    }

    fn rollback(&self) {
        for path in [&self.paths.grant, &self.paths.wrapper] {
            match utils::remove_if_exists(path) {
                Ok(true) => warn!("Откат: удален {}", path.display()),
                Ok(false) => {}
                Err(e) => warn!("Откат: не удалось удалить {}: {}", path.display(), e),
            }
        }
    }

    fn audit_failure(&self, action: &str, target: &str, error: &ProvisionError) {
        if let Err(e) = self.auditor.failure(action, target, &error.to_string()) {
            warn!("Не удалось записать аудит: {}", e);
        }
    }
}

fn ensure_parent(path: &Path, mode: u32) -> Result<()> {
    match path.parent() {
        Some(parent) if !parent.exists() => utils::ensure_dir(parent, mode),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        context::Confirmation,
        prompt::{
            scripted::{Answer, ScriptedPrompter},
            HeadlessPrompter,
        },
        security::{AuditLog, AuditStatus},
    };
    use std::{os::unix::fs::PermissionsExt, process::Command};
    use tempfile::TempDir;

    struct AcceptAll;

    #[async_trait]
    impl GrantValidator for AcceptAll {
        async fn validate(&self, _grant_file: &Path) -> Result<()> {
            Ok(())
        }
    }

    struct RejectAll;

    #[async_trait]
    impl GrantValidator for RejectAll {
        async fn validate(&self, _grant_file: &Path) -> Result<()> {
            Err(ProvisionError::GrantInvalid("syntax error near line 3".to_string()))
        }
    }

    struct Fixture {
        dir: TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                dir: TempDir::new().unwrap(),
            }
        }

        fn path(&self, rel: &str) -> PathBuf {
            self.dir.path().join(rel)
        }

        fn paths(&self) -> AuthorizerPaths {
            AuthorizerPaths {
                wrapper: self.path("bin/vps-restart-service"),
                grant: self.path("sudoers.d/vps-provision-restart"),
                systemctl: PathBuf::from("/bin/echo"),
                lock: self.path("state/provision.lock"),
                trusted_root: self.dir.path().to_path_buf(),
            }
        }

        fn whitelist(&self, mode: ExecMode) -> ServiceWhitelist {
            ServiceWhitelist::new(
                self.path("whitelist/allowed_services"),
                self.path("state/provision.lock"),
                mode,
            )
        }

        fn authorizer<'p>(
            &self,
            validator: Box<dyn GrantValidator>,
            prompter: &'p dyn Prompter,
            mode: ExecMode,
            interaction: Interaction,
            consent: SudoersConsent,
        ) -> RestartAuthorizer<'p> {
            RestartAuthorizer::new(
                self.paths(),
                self.whitelist(mode),
                validator,
                Auditor::new(self.path("state/audit.log"), mode),
                prompter,
                mode,
                interaction,
                consent,
            )
        }

        fn audit(&self) -> Vec<AuditLog> {
            fs::read_to_string(self.path("state/audit.log"))
                .unwrap_or_default()
                .lines()
                .map(|l| serde_json::from_str(l).unwrap())
                .collect()
        }
    }

    fn mode_of(path: &Path) -> u32 {
        fs::metadata(path).unwrap().permissions().mode() & 0o777
    }

    #[tokio::test]
    async fn headless_install_requires_explicit_consent() {
        let fx = Fixture::new();
        fx.whitelist(ExecMode::Apply).add("nginx").unwrap();
        let prompter = HeadlessPrompter::new(Confirmation::AssumeYes);
        let auth = fx.authorizer(
            Box::new(AcceptAll),
            &prompter,
            ExecMode::Apply,
            Interaction::Headless,
            SudoersConsent::NotGranted,
        );

        let err = auth.install("github-runner").await.unwrap_err();
        assert!(matches!(err, ProvisionError::SudoersConsentRequired));
        assert_eq!(err.exit_code(), 4);
        assert!(!fx.paths().wrapper.exists());
        assert!(!fx.paths().grant.exists());
    }

    #[tokio::test]
    async fn install_writes_scoped_grant_and_wrapper() {
        let fx = Fixture::new();
        let list = fx.whitelist(ExecMode::Apply);
        list.add("nginx").unwrap();
        list.add("app@1.service").unwrap();
        let prompter = ScriptedPrompter::new(vec![Answer::Confirm(true)]);
        let auth = fx.authorizer(
            Box::new(AcceptAll),
            &prompter,
            ExecMode::Apply,
            Interaction::Interactive,
            SudoersConsent::NotGranted,
        );

        let state = auth.install("github-runner").await.unwrap();
        assert_eq!(state, Effect::Applied(AuthorizationState::Active));

        let paths = fx.paths();
        let grant = fs::read_to_string(&paths.grant).unwrap();
        let wrapper = paths.wrapper.display().to_string();
        let rules: Vec<&str> = grant.lines().filter(|l| !l.starts_with('#')).collect();
        assert_eq!(
            rules,
            vec![
                format!("github-runner ALL=(root) NOPASSWD: {} app@1.service", wrapper),
                format!("github-runner ALL=(root) NOPASSWD: {} nginx", wrapper),
            ]
        );
        assert!(!grant.contains('*'));
        assert_eq!(mode_of(&paths.grant), 0o440);
        assert_eq!(mode_of(&paths.wrapper), 0o755);
        assert_eq!(
            fs::read_dir(paths.grant.parent().unwrap()).unwrap().count(),
            1,
            "временный файл не должен оставаться в sudoers.d"
        );

        assert_eq!(auth.status("github-runner").await.unwrap(), AuthorizationState::Active);
        assert_eq!(fx.audit().last().unwrap().status, AuditStatus::Success);
    }

    #[tokio::test]
    async fn invalid_grant_rolls_back_wrapper() {
        let fx = Fixture::new();
        fx.whitelist(ExecMode::Apply).add("nginx").unwrap();
        let prompter = ScriptedPrompter::new(vec![Answer::Confirm(true)]);
        let auth = fx.authorizer(
            Box::new(RejectAll),
            &prompter,
            ExecMode::Apply,
            Interaction::Interactive,
            SudoersConsent::NotGranted,
        );

        let err = auth.install("github-runner").await.unwrap_err();
        assert!(matches!(err, ProvisionError::GrantInvalid(_)));
        assert_eq!(err.exit_code(), 5);

        let paths = fx.paths();
        assert!(!paths.wrapper.exists());
        assert!(!paths.grant.exists());
        assert_eq!(fs::read_dir(paths.grant.parent().unwrap()).unwrap().count(), 0);
        assert_eq!(auth.status("github-runner").await.unwrap(), AuthorizationState::NotInstalled);
        assert_eq!(fx.audit().last().unwrap().status, AuditStatus::Error);
    }

    #[tokio::test]
    async fn operator_can_decline() {
        let fx = Fixture::new();
        fx.whitelist(ExecMode::Apply).add("nginx").unwrap();
        let prompter = ScriptedPrompter::new(vec![Answer::Confirm(false)]);
        let auth = fx.authorizer(
            Box::new(AcceptAll),
            &prompter,
            ExecMode::Apply,
            Interaction::Interactive,
            SudoersConsent::NotGranted,
        );

        assert!(matches!(
            auth.install("github-runner").await,
            Err(ProvisionError::Cancelled)
        ));
        assert!(!fx.paths().wrapper.exists());
    }

    #[tokio::test]
    async fn rejects_empty_whitelist_and_bad_input() {
        let fx = Fixture::new();
        let prompter = HeadlessPrompter::new(Confirmation::AssumeYes);
        let auth = fx.authorizer(
            Box::new(AcceptAll),
            &prompter,
            ExecMode::Apply,
            Interaction::Headless,
            SudoersConsent::Granted,
        );

        assert!(matches!(
            auth.install("github-runner").await,
            Err(ProvisionError::EmptyWhitelist)
        ));
        assert!(matches!(
            auth.install("root ALL=(ALL) ALL").await,
            Err(ProvisionError::InvalidPrincipal(_))
        ));

        let mut paths = fx.paths();
        paths.wrapper = PathBuf::from("/usr/local/bin/../../tmp/x");
        let auth = RestartAuthorizer::new(
            paths,
            fx.whitelist(ExecMode::Apply),
            Box::new(AcceptAll),
            Auditor::new(fx.path("state/audit.log"), ExecMode::Apply),
            &prompter,
            ExecMode::Apply,
            Interaction::Headless,
            SudoersConsent::Granted,
        );
        assert!(matches!(
            auth.install("github-runner").await,
            Err(ProvisionError::UnsafePath { .. })
        ));
    }

    #[tokio::test]
    async fn world_writable_wrapper_dir_is_refused() {
        let fx = Fixture::new();
        fx.whitelist(ExecMode::Apply).add("nginx").unwrap();
        let bin = fx.path("bin");
        fs::create_dir_all(&bin).unwrap();
        fs::set_permissions(&bin, fs::Permissions::from_mode(0o777)).unwrap();
        let prompter = HeadlessPrompter::new(Confirmation::AssumeYes);
        let auth = fx.authorizer(
            Box::new(AcceptAll),
            &prompter,
            ExecMode::Apply,
            Interaction::Headless,
            SudoersConsent::Granted,
        );

        let err = auth.install("github-runner").await.unwrap_err();
        assert!(matches!(err, ProvisionError::UnsafePath { ref path, .. } if *path == bin));
        assert!(!fx.paths().wrapper.exists());
        assert!(!fx.paths().grant.exists());
    }

    #[tokio::test]
    async fn symlinked_wrapper_dir_is_refused() {
        let fx = Fixture::new();
        fx.whitelist(ExecMode::Apply).add("nginx").unwrap();
        fs::create_dir_all(fx.path("real-bin")).unwrap();
        std::os::unix::fs::symlink(fx.path("real-bin"), fx.path("bin")).unwrap();
        let prompter = HeadlessPrompter::new(Confirmation::AssumeYes);
        let auth = fx.authorizer(
            Box::new(AcceptAll),
            &prompter,
            ExecMode::Apply,
            Interaction::Headless,
            SudoersConsent::Granted,
        );

        assert!(matches!(
            auth.install("github-runner").await,
            Err(ProvisionError::UnsafePath { .. })
        ));
        assert!(!fx.path("real-bin/vps-restart-service").exists());
    }

    #[tokio::test]
    async fn status_is_not_active_once_wrapper_dir_is_opened_up() {
        let fx = Fixture::new();
        fx.whitelist(ExecMode::Apply).add("nginx").unwrap();
        let prompter = HeadlessPrompter::new(Confirmation::AssumeYes);
        let auth = fx.authorizer(
            Box::new(AcceptAll),
            &prompter,
            ExecMode::Apply,
            Interaction::Headless,
            SudoersConsent::Granted,
        );
        auth.install("github-runner").await.unwrap();
        assert_eq!(auth.status("github-runner").await.unwrap(), AuthorizationState::Active);

        fs::set_permissions(fx.path("bin"), fs::Permissions::from_mode(0o777)).unwrap();
        assert_eq!(
            auth.status("github-runner").await.unwrap(),
            AuthorizationState::WrapperWritten
        );
    }

    #[tokio::test]
    async fn dry_run_touches_nothing_and_is_stable() {
        let fx = Fixture::new();
        fx.whitelist(ExecMode::Apply).add("nginx").unwrap();
        let prompter = ScriptedPrompter::new(vec![]);
        let auth = fx.authorizer(
            Box::new(RejectAll),
            &prompter,
            ExecMode::DryRun,
            Interaction::Interactive,
            SudoersConsent::NotGranted,
        );

        let first = auth.install("github-runner").await.unwrap();
        let second = auth.install("github-runner").await.unwrap();
        assert!(first.is_planned());
        assert_eq!(first, second);
        assert!(!fx.paths().wrapper.exists());
        assert!(!fx.paths().grant.exists());
        assert!(!fx.path("state/audit.log").exists());
    }

    #[tokio::test]
    async fn shrinking_whitelist_makes_grant_stale() {
        let fx = Fixture::new();
        let list = fx.whitelist(ExecMode::Apply);
        list.add("nginx").unwrap();
        list.add("worker").unwrap();
        let prompter = HeadlessPrompter::new(Confirmation::AssumeYes);
        let auth = fx.authorizer(
            Box::new(AcceptAll),
            &prompter,
            ExecMode::Apply,
            Interaction::Headless,
            SudoersConsent::Granted,
        );
        auth.install("github-runner").await.unwrap();

        list.remove("worker").unwrap();
        assert_eq!(
            auth.status("github-runner").await.unwrap(),
            AuthorizationState::GrantWritten
        );

        auth.install("github-runner").await.unwrap();
        assert_eq!(auth.status("github-runner").await.unwrap(), AuthorizationState::Active);
        let grant = fs::read_to_string(fx.paths().grant).unwrap();
        assert!(!grant.contains("worker"));
    }

    #[tokio::test]
    async fn remove_is_idempotent_and_partial_state_is_inactive() {
        let fx = Fixture::new();
        fx.whitelist(ExecMode::Apply).add("nginx").unwrap();
        let prompter = HeadlessPrompter::new(Confirmation::AssumeYes);
        let auth = fx.authorizer(
            Box::new(AcceptAll),
            &prompter,
            ExecMode::Apply,
            Interaction::Headless,
            SudoersConsent::Granted,
        );
        auth.install("github-runner").await.unwrap();

        fs::remove_file(fx.paths().grant).unwrap();
        assert_eq!(
            auth.status("github-runner").await.unwrap(),
            AuthorizationState::WrapperWritten
        );

        assert_eq!(
            auth.remove().unwrap(),
            Effect::Applied(AuthorizationState::NotInstalled)
        );
        assert_eq!(
            auth.remove().unwrap(),
            Effect::Applied(AuthorizationState::NotInstalled)
        );
        assert!(!fx.paths().wrapper.exists());
    }

    #[test]
    fn structure_check_rejects_wildcards_and_foreign_commands() {
        let principal = Principal::parse("github-runner").unwrap();
        let wrapper = CommandPath::parse(Path::new("/usr/local/bin/vps-restart-service")).unwrap();

        let ok = render_grant(&principal, &wrapper, &[ServiceName::parse("nginx").unwrap()]);
        assert!(check_grant_structure(&ok, &principal, &wrapper).is_ok());

        for bad in [
            "github-runner ALL=(root) NOPASSWD: /usr/local/bin/vps-restart-service *\n",
            "github-runner ALL=(root) NOPASSWD: /bin/systemctl restart nginx\n",
            "github-runner ALL=(ALL) NOPASSWD: ALL\n",
            "github-runner ALL=(root) NOPASSWD: /usr/local/bin/vps-restart-service nginx, /bin/sh\n",
            "# только комментарий\n",
        ] {
            assert!(
                check_grant_structure(bad, &principal, &wrapper).is_err(),
                "{}",
                bad
            );
        }
    }

    fn run_wrapper(script: &Path, args: &[&str]) -> i32 {
        Command::new("/bin/sh")
            .arg(script)
            .args(args)
            .output()
            .unwrap()
            .status
            .code()
            .unwrap()
    }

    #[test]
    fn rendered_wrapper_enforces_whitelist() {
        let fx = Fixture::new();
        let list = fx.whitelist(ExecMode::Apply);
        list.add("nginx").unwrap();

        // /bin/echo: юнит "существует" и "активен"; /bin/false: юнита нет
        let echo = CommandPath::parse(Path::new("/bin/echo")).unwrap();
        let script = fx.path("wrapper-echo.sh");
        fs::write(&script, render_wrapper(list.path(), &echo)).unwrap();

        assert_eq!(run_wrapper(&script, &["nginx"]), EXIT_OK);
        assert_eq!(run_wrapper(&script, &["redis-server"]), EXIT_NOT_ALLOWED);
        assert_eq!(run_wrapper(&script, &["nginx-evil"]), EXIT_NOT_ALLOWED);
        assert_eq!(run_wrapper(&script, &["nginx;reboot"]), EXIT_USAGE);
        assert_eq!(run_wrapper(&script, &[]), EXIT_USAGE);
        assert_eq!(run_wrapper(&script, &["nginx", "extra"]), EXIT_USAGE);

        let missing = CommandPath::parse(Path::new("/bin/false")).unwrap();
        let script = fx.path("wrapper-false.sh");
        fs::write(&script, render_wrapper(list.path(), &missing)).unwrap();
        assert_eq!(run_wrapper(&script, &["nginx"]), EXIT_UNIT_NOT_FOUND);

        list.remove("nginx").unwrap();
        let script = fx.path("wrapper-echo.sh");
        assert_eq!(run_wrapper(&script, &["nginx"]), EXIT_NOT_ALLOWED);
    }

    #[test]
    fn wrapper_and_whitelist_agree_on_hand_edited_lines() {
        let fx = Fixture::new();
        let list = fx.whitelist(ExecMode::Apply);
        fs::create_dir_all(list.path().parent().unwrap()).unwrap();
        fs::write(list.path(), "  api.service  \nworker\r\n# nginx\nnginx\n").unwrap();

        let echo = CommandPath::parse(Path::new("/bin/echo")).unwrap();
        let script = fx.path("wrapper-echo.sh");
        fs::write(&script, render_wrapper(list.path(), &echo)).unwrap();

        for service in ["api.service", "worker", "nginx"] {
            let allowed = list.contains(service).unwrap();
            let code = run_wrapper(&script, &[service]);
            assert_eq!(allowed, code == EXIT_OK, "{}: wrapper exit {}", service, code);
        }
        assert!(list.contains("nginx").unwrap());
        assert!(!list.contains("api.service").unwrap());
    }
}
