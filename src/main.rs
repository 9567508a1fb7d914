use std::{path::PathBuf, process::ExitCode};

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use log::{debug, error, info, warn};

mod authorizer;
mod backup;
mod commands;
mod config;
mod context;
mod error;
mod logger;
mod menu;
mod ports;
mod prompt;
mod restart;
mod sanitize;
mod secrets;
mod security;
mod services;
mod uninstall;
mod utils;
mod versions;
mod whitelist;

use backup::RetentionPolicy;
use commands::SecretSource;
use config::{ProvisionConfig, DEFAULT_CONFIG_PATH};
use context::{Confirmation, Context, ExecMode, Interaction, SudoersConsent};
use error::ProvisionError;
use secrets::SecretGenerator;
use versions::Software;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Корень артефактов (секреты, белый список, бекапы, состояние)
    #[arg(long, global = true, env = "VPS_PROVISION_ROOT")]
    root: Option<PathBuf>,

    /// Путь к файлу конфигурации
    #[arg(long, global = true, env = "VPS_PROVISION_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Только показать действия, ничего не изменяя
    #[arg(long, global = true)]
    dry_run: bool,

    /// Автоматический режим без интерактивных запросов
    #[arg(short, long, global = true, visible_alias = "headless")]
    auto: bool,

    /// Разрешить изменение sudoers в автоматическом режиме
    #[arg(long, global = true)]
    allow_sudoers: bool,

    /// Отвечать "да" на подтверждения в автоматическом режиме
    #[arg(short = 'y', long, global = true)]
    yes: bool,

    /// Отладочный вывод
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Интерактивное меню
    Menu,
    /// Хранилище секретов
    Secret {
        #[command(subcommand)]
        action: SecretCommand,
    },
    /// Белый список сервисов для перезапуска
    Whitelist {
        #[command(subcommand)]
        action: WhitelistCommand,
    },
    /// Обертка перезапуска и правило sudoers
    Authorize {
        #[command(subcommand)]
        action: AuthorizeCommand,
    },
    /// Перезапуск сервиса из белого списка
    Restart { service: String },
    /// Бекапы конфигурации
    Backup {
        #[command(subcommand)]
        action: BackupCommand,
    },
    /// Доступные версии ПО
    Versions {
        software: String,
        /// Запросить выбор версии
        #[arg(long)]
        choose: bool,
    },
    /// Проверка портов
    Port {
        #[command(subcommand)]
        action: PortCommand,
    },
    /// Конфигурация
    Config {
        #[command(subcommand)]
        action: ConfigCommand,
    },
    /// Удаление артефактов провижининга
    Cleanup {
        /// Удалить также все бекапы
        #[arg(long)]
        purge_backups: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum GenerateKind {
    Password,
    Token,
}

#[derive(Subcommand)]
enum SecretCommand {
    /// Сохранить секрет
    Put {
        key: String,
        /// Сгенерировать значение вместо ввода
        #[arg(long, value_enum, num_args = 0..=1, default_missing_value = "password")]
        generate: Option<GenerateKind>,
        /// Прочитать значение из stdin
        #[arg(long, conflicts_with = "generate")]
        stdin: bool,
    },
    /// Показать значение (после подтверждения)
    Get { key: String },
    /// Заменить значение существующего секрета
    Rotate {
        key: String,
        #[arg(long, value_enum, num_args = 0..=1, default_missing_value = "password")]
        generate: Option<GenerateKind>,
        #[arg(long, conflicts_with = "generate")]
        stdin: bool,
    },
    /// Ключи и длины значений
    List,
    /// Удалить секрет
    Delete { key: String },
    /// Удалить все секреты
    Wipe,
}

#[derive(Subcommand)]
enum WhitelistCommand {
    Add { service: String },
    Remove { service: String },
    List,
    /// Код выхода 0, если сервис в списке, иначе 3
    Check { service: String },
}

#[derive(Subcommand)]
enum AuthorizeCommand {
    Install {
        #[arg(long)]
        principal: Option<String>,
    },
    Remove,
    Status {
        #[arg(long)]
        principal: Option<String>,
    },
}

#[derive(Subcommand)]
enum BackupCommand {
    Snapshot { path: PathBuf },
    List { family: String },
    Prune { family: String },
    Restore {
        archive: PathBuf,
        #[arg(long)]
        into: PathBuf,
    },
    /// Показать или задать политику хранения (last:N, days:N)
    Retention { policy: Option<RetentionPolicy> },
}

#[derive(Subcommand)]
enum PortCommand {
    Check {
        port: String,
        /// Назначение порта; при конфликте предлагает варианты
        #[arg(long)]
        purpose: Option<String>,
    },
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Показать действующую конфигурацию
    Show,
    /// Записать действующую конфигурацию в файл --config
    Init,
}

fn secret_source(generate: Option<GenerateKind>, stdin: bool, length: usize) -> SecretSource {
    match (generate, stdin) {
        (Some(GenerateKind::Password), _) => {
            SecretSource::Generate(SecretGenerator::Password { length })
        }
        (Some(GenerateKind::Token), _) => SecretSource::Generate(SecretGenerator::Token {
            bytes: length,
        }),
        (None, true) => SecretSource::Stdin,
        (None, false) => SecretSource::Prompt,
    }
}

fn build_context(cli: &Cli, mut config: ProvisionConfig) -> Context {
    if let Some(root) = &cli.root {
        config.artifact_root = root.clone();
    }

    let mut ctx = Context::new(config);
    ctx.mode = if cli.dry_run {
        ExecMode::DryRun
    } else {
        ExecMode::Apply
    };
    ctx.interaction = if cli.auto {
        Interaction::Headless
    } else {
        Interaction::Interactive
    };
    ctx.sudoers_consent = if cli.allow_sudoers {
        SudoersConsent::Granted
    } else {
        SudoersConsent::NotGranted
    };
    ctx.confirmation = if cli.yes {
        Confirmation::AssumeYes
    } else {
        Confirmation::Ask
    };
    ctx
}

fn install_interrupt_handler() {
    let result = ctrlc::set_handler(|| {
        eprintln!(
            "\nВыполнение прервано на этапе: {}",
            utils::current_stage()
        );
        std::process::exit(130);
    });
    if let Err(e) = result {
        warn!("Не удалось установить обработчик Ctrl+C: {}", e);
    }
}

/// Код выхода по первой ошибке компонента в цепочке
fn exit_code_of(err: &anyhow::Error) -> u8 {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<ProvisionError>())
        .map(|e| e.exit_code() as u8)
        .unwrap_or(1)
}

async fn run(cli: Cli, ctx: Context) -> Result<u8> {
    let prompter = ctx.prompter();
    let prompter = prompter.as_ref();
    let length = ctx.config.secret_length;
    let config_path = cli.config;

    let command = cli.command.unwrap_or(Commands::Menu);
    match command {
        Commands::Menu => {
            utils::enter_stage("меню");
            menu::run(&ctx, prompter).await?;
        }
        Commands::Secret { action } => {
            utils::enter_stage("секреты");
            match action {
                SecretCommand::Put {
                    key,
                    generate,
                    stdin,
                } => commands::secret_put(&ctx, prompter, &key, secret_source(generate, stdin, length))?,
                SecretCommand::Get { key } => commands::secret_get(&ctx, prompter, &key)?,
                SecretCommand::Rotate {
                    key,
                    generate,
                    stdin,
                } => commands::secret_rotate(
                    &ctx,
                    prompter,
                    &key,
                    secret_source(generate, stdin, length),
                )?,
                SecretCommand::List => commands::secret_list(&ctx)?,
                SecretCommand::Delete { key } => commands::secret_delete(&ctx, prompter, &key)?,
                SecretCommand::Wipe => commands::secret_wipe(&ctx, prompter)?,
            }
        }
        Commands::Whitelist { action } => {
            utils::enter_stage("белый список");
            match action {
                WhitelistCommand::Add { service } => commands::whitelist_add(&ctx, &service)?,
                WhitelistCommand::Remove { service } => {
                    commands::whitelist_remove(&ctx, &service)?
                }
                WhitelistCommand::List => commands::whitelist_list(&ctx)?,
                WhitelistCommand::Check { service } => {
                    if !commands::whitelist_check(&ctx, &service)? {
                        return Ok(3);
                    }
                }
            }
        }
        Commands::Authorize { action } => {
            utils::enter_stage("права на перезапуск");
            match action {
                AuthorizeCommand::Install { principal } => {
                    commands::authorize_install(&ctx, prompter, principal.as_deref()).await?
                }
                AuthorizeCommand::Remove => commands::authorize_remove(&ctx, prompter)?,
                AuthorizeCommand::Status { principal } => {
                    commands::authorize_status(&ctx, prompter, principal.as_deref()).await?
                }
            }
        }
        Commands::Restart { service } => {
            utils::enter_stage("перезапуск сервиса");
            let code = commands::restart_service(&ctx, &service).await?;
            return Ok(code as u8);
        }
        Commands::Backup { action } => {
            utils::enter_stage("бекапы");
            match action {
                BackupCommand::Snapshot { path } => commands::backup_snapshot(&ctx, &path)?,
                BackupCommand::List { family } => commands::backup_list(&ctx, &family)?,
                BackupCommand::Prune { family } => commands::backup_prune(&ctx, prompter, &family)?,
                BackupCommand::Restore { archive, into } => {
                    commands::backup_restore(&ctx, prompter, &archive, &into)?
                }
                BackupCommand::Retention { policy } => commands::backup_retention(&ctx, policy)?,
            }
        }
        Commands::Versions { software, choose } => {
            utils::enter_stage("получение версий");
            let software: Software = software.parse()?;
            commands::show_versions(&ctx, prompter, software, choose).await?;
        }
        Commands::Port { action } => {
            utils::enter_stage("проверка порта");
            match action {
                PortCommand::Check { port, purpose } => {
                    commands::port_check(&ctx, prompter, &port, purpose.as_deref()).await?;
                }
            }
        }
        Commands::Config { action } => match action {
            ConfigCommand::Show => commands::config_show(&ctx)?,
            ConfigCommand::Init => commands::config_init(&ctx, prompter, &config_path)?,
        },
        Commands::Cleanup { purge_backups } => {
            utils::enter_stage("очистка");
            commands::cleanup(&ctx, prompter, purge_backups)?;
        }
    }

    Ok(0)
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let config = ProvisionConfig::load(&cli.config);
    let level = config
        .as_ref()
        .map(|c| c.log_level.clone())
        .unwrap_or_else(|_| "info".to_string());
    if let Err(e) = logger::init(cli.verbose, &level) {
        eprintln!("Не удалось инициализировать логирование: {}", e);
    }

    let config = match config {
        Ok(config) => config,
        Err(e) => {
            error!("{:#}", e);
            return ExitCode::from(1);
        }
    };

    install_interrupt_handler();

    let ctx = build_context(&cli, config);
    info!("Запуск vps_provision");
    debug!(
        "Корень артефактов: {}, режим: {:?}, {:?}",
        ctx.config.artifact_root.display(),
        ctx.mode,
        ctx.interaction
    );

    match run(cli, ctx).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            match e.downcast_ref::<ProvisionError>() {
                Some(ProvisionError::Cancelled) => info!("{}", e),
                _ => error!("{:#}", e),
            }
            ExitCode::from(exit_code_of(&e))
        }
    }
}
