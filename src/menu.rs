use std::path::PathBuf;

use anyhow::Result;
use log::{error, info};

use crate::{
    backup::RetentionPolicy,
    commands::{self, SecretSource},
    context::Context,
    error::ProvisionError,
    prompt::Prompter,
    secrets::SecretGenerator,
    utils,
    versions::Software,
};

/// Пункты главного меню
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MenuAction {
    SecretPut,
    SecretGenerate,
    SecretGet,
    SecretRotate,
    SecretList,
    SecretDelete,
    WhitelistAdd,
    WhitelistRemove,
    WhitelistList,
    AuthorizeInstall,
    AuthorizeStatus,
    AuthorizeRemove,
    RestartService,
    BackupSnapshot,
    BackupList,
    BackupRestore,
    BackupRetention,
    Versions,
    PortCheck,
    Cleanup,
    Exit,
}

impl MenuAction {
    pub const ALL: [MenuAction; 21] = [
        MenuAction::SecretPut,
        MenuAction::SecretGenerate,
        MenuAction::SecretGet,
        MenuAction::SecretRotate,
        MenuAction::SecretList,
        MenuAction::SecretDelete,
        MenuAction::WhitelistAdd,
        MenuAction::WhitelistRemove,
        MenuAction::WhitelistList,
        MenuAction::AuthorizeInstall,
        MenuAction::AuthorizeStatus,
        MenuAction::AuthorizeRemove,
        MenuAction::RestartService,
        MenuAction::BackupSnapshot,
        MenuAction::BackupList,
        MenuAction::BackupRestore,
        MenuAction::BackupRetention,
        MenuAction::Versions,
        MenuAction::PortCheck,
        MenuAction::Cleanup,
        MenuAction::Exit,
    ];

    pub fn label(self) -> &'static str {
        match self {
            MenuAction::SecretPut => "Секреты: ввести значение",
            MenuAction::SecretGenerate => "Секреты: сгенерировать пароль",
            MenuAction::SecretGet => "Секреты: показать значение",
            MenuAction::SecretRotate => "Секреты: заменить значение",
            MenuAction::SecretList => "Секреты: список",
            MenuAction::SecretDelete => "Секреты: удалить",
            MenuAction::WhitelistAdd => "Белый список: добавить сервис",
            MenuAction::WhitelistRemove => "Белый список: удалить сервис",
            MenuAction::WhitelistList => "Белый список: показать",
            MenuAction::AuthorizeInstall => "Права на перезапуск: установить",
            MenuAction::AuthorizeStatus => "Права на перезапуск: состояние",
            MenuAction::AuthorizeRemove => "Права на перезапуск: удалить",
            MenuAction::RestartService => "Перезапустить сервис",
            MenuAction::BackupSnapshot => "Бекапы: создать",
            MenuAction::BackupList => "Бекапы: список",
            MenuAction::BackupRestore => "Бекапы: восстановить",
            MenuAction::BackupRetention => "Бекапы: политика хранения",
            MenuAction::Versions => "Доступные версии ПО",
            MenuAction::PortCheck => "Проверить порт",
            MenuAction::Cleanup => "Удалить все артефакты",
            MenuAction::Exit => "Выход",
        }
    }
}

/// Главный цикл меню: каждый обработчик возвращает управление сюда
pub async fn run(ctx: &Context, prompter: &dyn Prompter) -> Result<()> {
    let labels: Vec<&str> = MenuAction::ALL.iter().map(|a| a.label()).collect();

    loop {
        utils::enter_stage("главное меню");
        let index = prompter.select("Выберите действие", &labels)?;
        let action = MenuAction::ALL[index];
        if action == MenuAction::Exit {
            info!("Выход из меню");
            return Ok(());
        }

        utils::enter_stage(action.label());
        if let Err(e) = dispatch(ctx, prompter, action).await {
            match e.downcast_ref::<ProvisionError>() {
                Some(ProvisionError::Cancelled) => info!("Действие отменено"),
                _ => error!("{:#}", e),
            }
        }
    }
}

fn ask(prompter: &dyn Prompter, message: &str) -> Result<String> {
    let answer = prompter.input(message)?;
    let answer = answer.trim().to_string();
    if answer.is_empty() {
        return Err(ProvisionError::Cancelled.into());
    }
    Ok(answer)
}

async fn dispatch(ctx: &Context, prompter: &dyn Prompter, action: MenuAction) -> Result<()> {
    let password = SecretSource::Generate(SecretGenerator::Password {
        length: ctx.config.secret_length,
    });

    match action {
        MenuAction::SecretPut => {
            let key = ask(prompter, "Имя секрета")?;
            commands::secret_put(ctx, prompter, &key, SecretSource::Prompt)
        }
        MenuAction::SecretGenerate => {
            let key = ask(prompter, "Имя секрета")?;
            commands::secret_put(ctx, prompter, &key, password)
        }
        MenuAction::SecretGet => {
            let key = ask(prompter, "Имя секрета")?;
            commands::secret_get(ctx, prompter, &key)
        }
        MenuAction::SecretRotate => {
            let key = ask(prompter, "Имя секрета")?;
            let source = match prompter.select(
                "Новое значение",
                &["Сгенерировать", "Ввести вручную"],
            )? {
                0 => password,
                _ => SecretSource::Prompt,
            };
            commands::secret_rotate(ctx, prompter, &key, source)
        }
        MenuAction::SecretList => commands::secret_list(ctx),
        MenuAction::SecretDelete => {
            let key = ask(prompter, "Имя секрета")?;
            commands::secret_delete(ctx, prompter, &key)
        }
        MenuAction::WhitelistAdd => {
            let service = ask(prompter, "Имя systemd юнита")?;
            commands::whitelist_add(ctx, &service)
        }
        MenuAction::WhitelistRemove => {
            let service = ask(prompter, "Имя systemd юнита")?;
            commands::whitelist_remove(ctx, &service)
        }
        MenuAction::WhitelistList => commands::whitelist_list(ctx),
        MenuAction::AuthorizeInstall => {
            let principal = prompter.input(&format!(
                "Пользователь CI (пусто - {})",
                ctx.config.principal
            ))?;
            let principal = principal.trim();
            let principal = (!principal.is_empty()).then_some(principal);
            commands::authorize_install(ctx, prompter, principal).await
        }
        MenuAction::AuthorizeStatus => commands::authorize_status(ctx, prompter, None).await,
        MenuAction::AuthorizeRemove => commands::authorize_remove(ctx, prompter),
        MenuAction::RestartService => {
            let service = ask(prompter, "Имя systemd юнита")?;
            commands::restart_service(ctx, &service).await.map(|_| ())
        }
        MenuAction::BackupSnapshot => {
            let path = ask(prompter, "Путь к файлу или директории")?;
            commands::backup_snapshot(ctx, &PathBuf::from(path))
        }
        MenuAction::BackupList => {
            let family = ask(prompter, "Имя источника (базовое имя файла)")?;
            commands::backup_list(ctx, &family)
        }
        MenuAction::BackupRestore => {
            let archive = ask(prompter, "Путь к архиву")?;
            let into = ask(prompter, "Директория для восстановления")?;
            commands::backup_restore(ctx, prompter, &PathBuf::from(archive), &PathBuf::from(into))
        }
        MenuAction::BackupRetention => {
            commands::backup_retention(ctx, None)?;
            let raw = prompter.input("Новая политика (last:N или days:N, пусто - без изменений)")?;
            if raw.trim().is_empty() {
                return Ok(());
            }
            let policy: RetentionPolicy = raw.parse()?;
            commands::backup_retention(ctx, Some(policy))
        }
        MenuAction::Versions => {
            let labels: Vec<&str> = Software::ALL.iter().map(|s| s.id()).collect();
            let software = Software::ALL[prompter.select("ПО", &labels)?];
            commands::show_versions(ctx, prompter, software, true)
                .await
                .map(|_| ())
        }
        MenuAction::PortCheck => {
            let port = ask(prompter, "Порт")?;
            let purpose = ask(prompter, "Назначение порта")?;
            commands::port_check(ctx, prompter, &port, Some(&purpose))
                .await
                .map(|_| ())
        }
        MenuAction::Cleanup => {
            let purge = prompter.confirm("Удалить также все бекапы?")?;
            commands::cleanup(ctx, prompter, purge)
        }
        MenuAction::Exit => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::ProvisionConfig,
        prompt::scripted::{Answer, ScriptedPrompter},
        whitelist::ServiceWhitelist,
    };
    use tempfile::TempDir;

    fn index_of(action: MenuAction) -> usize {
        MenuAction::ALL.iter().position(|a| *a == action).unwrap()
    }

    #[tokio::test]
    async fn loop_returns_after_each_action() {
        let dir = TempDir::new().unwrap();
        let mut config = ProvisionConfig::default();
        config.artifact_root = dir.path().to_path_buf();
        let ctx = Context::new(config);

        let prompter = ScriptedPrompter::new(vec![
            Answer::Choice(index_of(MenuAction::WhitelistAdd)),
            Answer::Text("nginx".into()),
            Answer::Choice(index_of(MenuAction::WhitelistAdd)),
            Answer::Text("bad name".into()),
            Answer::Choice(index_of(MenuAction::SecretGet)),
            Answer::Text(String::new()),
            Answer::Choice(index_of(MenuAction::Exit)),
        ]);

        run(&ctx, &prompter).await.unwrap();
        assert_eq!(prompter.remaining(), 0);
        assert!(ServiceWhitelist::from_context(&ctx).contains("nginx").unwrap());
    }

    #[test]
    fn exit_is_last_and_labels_are_unique() {
        assert_eq!(*MenuAction::ALL.last().unwrap(), MenuAction::Exit);
        let mut labels: Vec<&str> = MenuAction::ALL.iter().map(|a| a.label()).collect();
        labels.sort();
        labels.dedup();
        assert_eq!(labels.len(), MenuAction::ALL.len());
    }
}
