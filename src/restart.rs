use log::{info, warn};

use crate::{
    sanitize::ServiceName,
    services::{ServiceManager, UnitState},
    whitelist::ServiceWhitelist,
};

// Коды выхода обертки; скрипт обертки использует те же значения
pub const EXIT_OK: i32 = 0;
pub const EXIT_USAGE: i32 = 2;
pub const EXIT_NOT_ALLOWED: i32 = 3;
pub const EXIT_UNIT_NOT_FOUND: i32 = 4;
pub const EXIT_RESTART_FAILED: i32 = 5;

/// Итог запроса на перезапуск
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestartOutcome {
    Restarted,
    Usage(String),
    NotAllowed,
    UnitNotFound,
    Failed(String),
}

impl RestartOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            RestartOutcome::Restarted => EXIT_OK,
            RestartOutcome::Usage(_) => EXIT_USAGE,
            RestartOutcome::NotAllowed => EXIT_NOT_ALLOWED,
            RestartOutcome::UnitNotFound => EXIT_UNIT_NOT_FOUND,
            RestartOutcome::Failed(_) => EXIT_RESTART_FAILED,
        }
    }
}

/// Проверка имени и белого списка без обращения к systemd
pub fn admit(whitelist: &ServiceWhitelist, raw_name: &str) -> Result<ServiceName, RestartOutcome> {
    let name = ServiceName::parse(raw_name).map_err(|e| RestartOutcome::Usage(e.to_string()))?;

    match whitelist.contains(name.as_str()) {
        Ok(true) => Ok(name),
        Ok(false) => {
            warn!("Перезапуск {} запрещен: сервиса нет в белом списке", name);
            Err(RestartOutcome::NotAllowed)
        }
        Err(e) => {
            warn!("Белый список недоступен, перезапуск {} запрещен: {}", name, e);
            Err(RestartOutcome::NotAllowed)
        }
    }
}

/// Проверяет белый список и перезапускает сервис
///
/// systemd не вызывается, пока имя не прошло проверку белого списка.
/// Белый список читается с диска при каждом вызове.
pub async fn invoke(
    whitelist: &ServiceWhitelist,
    services: &dyn ServiceManager,
    raw_name: &str,
) -> RestartOutcome {
    let name = match admit(whitelist, raw_name) {
        Ok(name) => name,
        Err(outcome) => return outcome,
    };

    match services.unit_exists(&name).await {
        Ok(true) => {}
        Ok(false) => {
            warn!("Юнит {} не найден", name);
            return RestartOutcome::UnitNotFound;
        }
        Err(e) => return RestartOutcome::Failed(e.to_string()),
    }

    match services.restart(&name).await {
        Ok(UnitState::Active) => {
            info!("Сервис {} перезапущен и активен", name);
            RestartOutcome::Restarted
        }
        Ok(UnitState::Failed(reason)) => RestartOutcome::Failed(reason),
        Err(e) => RestartOutcome::Failed(e.to_string()),
    }
}
