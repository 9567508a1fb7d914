use anyhow::Result;
use colored::*;
use env_logger::{Builder, Env};
use log::LevelFilter;

/// Инициализирует логирование
///
/// # Arguments
/// * `verbose` - Включить отладочный уровень независимо от RUST_LOG
/// * `default_level` - Уровень из конфигурации, если RUST_LOG не задан
///
/// # Examples
/// ```rust
/// logger::init(false, "info")?;
/// ```
pub fn init(verbose: bool, default_level: &str) -> Result<()> {
    let env = Env::default()
        .filter_or("RUST_LOG", default_level)
        .write_style_or("RUST_LOG_STYLE", "always");

    let mut builder = Builder::from_env(env);
    builder.format_timestamp_secs().format_module_path(true);

    if verbose {
        builder.filter(None, LevelFilter::Debug);
    }

    builder.try_init()?;

    Ok(())
}

/// Выводит значение секрета после явного подтверждения оператора
///
/// Значение никогда не проходит через `log`, только в stdout.
pub fn secret_reveal(key: &str, value: &str) {
    println!(
        "{} {} = {}",
        "[SECRET]".magenta().bold(),
        key,
        value.cyan().bold()
    );
}

/// Логирует успешное выполнение команды
///
/// # Examples
/// ```rust
/// logger::success("Обертка установлена");
/// ```
pub fn success(message: &str) {
    println!("{} {}", "[SUCCESS]".green().bold(), message);
}

/// Выводит действие, которое было бы выполнено без --dry-run
pub fn dry_run(message: &str) {
    println!("{} {}", "[DRY-RUN]".yellow().bold(), message);
}
