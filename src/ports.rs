use std::{collections::BTreeSet, path::PathBuf};

use async_trait::async_trait;
use log::{debug, info, warn};

use crate::{
    context::Interaction,
    error::{ProvisionError, Result},
    prompt::Prompter,
    utils,
};

/// Проверяет, что строка - номер порта из диапазона 1..=65535
pub fn parse_port(raw: &str) -> Result<u16> {
    let trimmed = raw.trim();
    let value: u32 = trimmed.parse().map_err(|_| ProvisionError::InvalidPort {
        value: raw.to_string(),
        reason: "ожидается целое число".to_string(),
    })?;

    if value == 0 || value > u16::MAX as u32 {
        return Err(ProvisionError::InvalidPort {
            value: raw.to_string(),
            reason: "допустимый диапазон 1-65535".to_string(),
        });
    }
    Ok(value as u16)
}

/// Источник сведений о слушающих сокетах
#[async_trait]
pub trait PortProbe: Send + Sync {
    async fn is_listening(&self, port: u16) -> Result<bool>;
}

/// Проверка через `ss`, при его отсутствии - попыткой bind
pub struct SocketProbe {
    ss_path: PathBuf,
}

impl SocketProbe {
    pub fn new(ss_path: impl Into<PathBuf>) -> Self {
        Self {
            ss_path: ss_path.into(),
        }
    }

    async fn bind_check(port: u16) -> bool {
        match tokio::net::TcpListener::bind(("0.0.0.0", port)).await {
            Ok(_) => false,
            Err(e) => {
                debug!("bind на порт {} не удался: {}", port, e);
                true
            }
        }
    }
}

impl Default for SocketProbe {
    fn default() -> Self {
        Self::new("/usr/bin/ss")
    }
}

#[async_trait]
impl PortProbe for SocketProbe {
    async fn is_listening(&self, port: u16) -> Result<bool> {
        match utils::run_command(&self.ss_path, &["-Htln"]).await {
            Ok(output) if output.success => Ok(parse_ss_output(&output.stdout).contains(&port)),
            Ok(output) => {
                debug!("ss завершился с ошибкой: {}", output.stderr.trim());
                Ok(Self::bind_check(port).await)
            }
            Err(e) => {
                debug!("ss недоступен, проверка через bind: {}", e);
                Ok(Self::bind_check(port).await)
            }
        }
    }
}

/// Порты из вывода `ss -Htln`: "LISTEN 0 4096 127.0.0.1:5432 0.0.0.0:*"
pub fn parse_ss_output(stdout: &str) -> BTreeSet<u16> {
    stdout
        .lines()
        .filter_map(|line| line.split_whitespace().nth(3))
        .filter_map(|local| local.rsplit_once(':'))
        .filter_map(|(_, port)| port.parse::<u16>().ok())
        .collect()
}

/// Итог разрешения конфликта
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortDecision {
    pub port: u16,
    /// порт занят, оператор явно выбрал использовать его
    pub forced: bool,
}

pub struct PortAllocator<'a> {
    probe: Box<dyn PortProbe>,
    prompter: &'a dyn Prompter,
    interaction: Interaction,
}

impl<'a> PortAllocator<'a> {
    pub fn new(
        probe: Box<dyn PortProbe>,
        prompter: &'a dyn Prompter,
        interaction: Interaction,
    ) -> Self {
        Self {
            probe,
            prompter,
            interaction,
        }
    }

    pub async fn is_available(&self, port: u16) -> Result<bool> {
        if port == 0 {
            return Err(ProvisionError::InvalidPort {
                value: port.to_string(),
                reason: "допустимый диапазон 1-65535".to_string(),
            });
        }
        Ok(!self.probe.is_listening(port).await?)
    }

    /// Возвращает свободный порт или порт, занятый по явному решению оператора
    pub async fn resolve_conflict(&self, port: u16, purpose: &str) -> Result<PortDecision> {
        if self.is_available(port).await? {
            return Ok(PortDecision {
                port,
                forced: false,
            });
        }

        warn!("Порт {} ({}) уже занят", port, purpose);

        match self.interaction {
            Interaction::Headless => self.next_free_port(port, purpose).await,
            Interaction::Interactive => self.ask_operator(port, purpose).await,
        }
    }

    async fn next_free_port(&self, port: u16, purpose: &str) -> Result<PortDecision> {
        let mut candidate = port;
        while candidate < u16::MAX {
            candidate += 1;
            if self.is_available(candidate).await? {
                info!(
                    "Автоматический режим: для {} выбран свободный порт {}",
                    purpose, candidate
                );
                return Ok(PortDecision {
                    port: candidate,
                    forced: false,
                });
            }
        }
        Err(ProvisionError::InvalidPort {
            value: port.to_string(),
            reason: "нет свободных портов выше занятого".to_string(),
        })
    }

    async fn ask_operator(&self, port: u16, purpose: &str) -> Result<PortDecision> {
        let options = [
            "Выбрать другой порт",
            "Использовать занятый порт",
            "Отменить",
        ];

        loop {
            let choice = self
                .prompter
                .select(&format!("Порт {} для {} занят", port, purpose), &options)?;

            match choice {
                0 => {
                    let raw = self.prompter.input(&format!("Новый порт для {}", purpose))?;
                    let alternate = match parse_port(&raw) {
                        Ok(p) => p,
                        Err(e) => {
                            warn!("{}", e);
                            continue;
                        }
                    };
                    if self.is_available(alternate).await? {
                        info!("Для {} выбран порт {}", purpose, alternate);
                        return Ok(PortDecision {
                            port: alternate,
                            forced: false,
                        });
                    }
                    warn!("Порт {} тоже занят", alternate);
                }
                1 => {
                    let confirmed = self.prompter.confirm(&format!(
                        "Порт {} занят. Использовать его для {} несмотря на конфликт?",
                        port, purpose
                    ))?;
                    if confirmed {
                        warn!(
                            "Порт {} используется для {} несмотря на конфликт",
                            port, purpose
                        );
                        return Ok(PortDecision { port, forced: true });
                    }
                }
                _ => return Err(ProvisionError::Cancelled),
            }
        }
    }
}
