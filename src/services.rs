use std::path::PathBuf;

use async_trait::async_trait;
use log::{debug, warn};

use crate::{error::Result, sanitize::ServiceName, utils};

/// Состояние юнита после перезапуска
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitState {
    Active,
    Failed(String),
}

/// Менеджер служб, с которым работает ядро
#[async_trait]
pub trait ServiceManager: Send + Sync {
    async fn unit_exists(&self, name: &ServiceName) -> Result<bool>;
    async fn is_active(&self, name: &ServiceName) -> Result<bool>;
    async fn restart(&self, name: &ServiceName) -> Result<UnitState>;
}

/// systemd через systemctl
pub struct Systemctl {
    binary: PathBuf,
}

impl Systemctl {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

#[async_trait]
impl ServiceManager for Systemctl {
    async fn unit_exists(&self, name: &ServiceName) -> Result<bool> {
        let output = utils::run_command(
            &self.binary,
            &["show", "-p", "LoadState", "--value", "--", name.as_str()],
        )
        .await?;

        let state = output.stdout.trim();
        debug!("LoadState {} = {:?}", name, state);
        Ok(output.success && !state.is_empty() && state != "not-found")
    }

    async fn is_active(&self, name: &ServiceName) -> Result<bool> {
        let output =
            utils::run_command(&self.binary, &["is-active", "--quiet", "--", name.as_str()])
                .await?;
        Ok(output.success)
    }

    async fn restart(&self, name: &ServiceName) -> Result<UnitState> {
        let output =
            utils::run_command(&self.binary, &["restart", "--", name.as_str()]).await?;
        if !output.success {
            warn!(
                "systemctl restart {} завершился с кодом {:?}: {}",
                name,
                output.code,
                output.stderr.trim()
            );
        }

        if self.is_active(name).await? {
            Ok(UnitState::Active)
        } else {
            let reason = if output.stderr.trim().is_empty() {
                "юнит не активен после перезапуска".to_string()
            } else {
                output.stderr.trim().to_string()
            };
            Ok(UnitState::Failed(reason))
        }
    }
}

#[cfg(test)]
pub mod fake {
    use std::{
        collections::{BTreeMap, BTreeSet},
        sync::Mutex,
    };

    use super::*;

    /// Поддельный systemd для тестов
    #[derive(Default)]
    pub struct FakeSystemd {
        /// юнит -> активен ли после перезапуска
        pub units: BTreeMap<String, bool>,
        pub calls: Mutex<Vec<String>>,
    }

    impl FakeSystemd {
        pub fn with_unit(mut self, name: &str, healthy: bool) -> Self {
            self.units.insert(name.to_string(), healthy);
            self
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        pub fn restarted(&self) -> BTreeSet<String> {
            self.calls()
                .into_iter()
                .filter_map(|c| c.strip_prefix("restart ").map(str::to_string))
                .collect()
        }

        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }
    }

    #[async_trait]
    impl ServiceManager for FakeSystemd {
        async fn unit_exists(&self, name: &ServiceName) -> Result<bool> {
            self.record(format!("exists {}", name));
            Ok(self.units.contains_key(name.as_str()))
        }

        async fn is_active(&self, name: &ServiceName) -> Result<bool> {
            self.record(format!("is-active {}", name));
            Ok(self.units.get(name.as_str()).copied().unwrap_or(false))
        }

        async fn restart(&self, name: &ServiceName) -> Result<UnitState> {
            self.record(format!("restart {}", name));
            match self.units.get(name.as_str()) {
                Some(true) => Ok(UnitState::Active),
                _ => Ok(UnitState::Failed("inactive".to_string())),
            }
        }
    }
}
