use std::fmt;

use crate::{
    config::ProvisionConfig,
    logger,
    prompt::{HeadlessPrompter, Prompter, TerminalPrompter},
};

/// Режим выполнения изменяющих операций
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecMode {
    Apply,
    DryRun,
}

impl ExecMode {
    pub fn is_dry_run(self) -> bool {
        matches!(self, ExecMode::DryRun)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interaction {
    Interactive,
    Headless,
}

/// Явное согласие оператора на изменение sudoers в автоматическом режиме
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SudoersConsent {
    Granted,
    NotGranted,
}

/// Поведение подтверждений в автоматическом режиме
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    Ask,
    AssumeYes,
}

/// Неизменяемый контекст запуска, передаваемый в конструкторы компонентов
#[derive(Debug, Clone)]
pub struct Context {
    pub config: ProvisionConfig,
    pub mode: ExecMode,
    pub interaction: Interaction,
    pub sudoers_consent: SudoersConsent,
    pub confirmation: Confirmation,
}

impl Context {
    pub fn new(config: ProvisionConfig) -> Self {
        Self {
            config,
            mode: ExecMode::Apply,
            interaction: Interaction::Interactive,
            sudoers_consent: SudoersConsent::NotGranted,
            confirmation: Confirmation::Ask,
        }
    }

    pub fn prompter(&self) -> Box<dyn Prompter> {
        match self.interaction {
            Interaction::Interactive => Box::new(TerminalPrompter),
            Interaction::Headless => Box::new(HeadlessPrompter::new(self.confirmation)),
        }
    }
}

/// Действие, которое было бы выполнено без --dry-run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedAction {
    pub action: String,
    pub target: String,
    pub detail: Option<String>,
}

impl PlannedAction {
    pub fn new(action: &str, target: impl fmt::Display) -> Self {
        Self {
            action: action.to_string(),
            target: target.to_string(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

impl fmt::Display for PlannedAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.detail {
            Some(detail) => write!(f, "{} {} ({})", self.action, self.target, detail),
            None => write!(f, "{} {}", self.action, self.target),
        }
    }
}

/// Результат изменяющей операции: выполнено или только запланировано
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect<T> {
    Applied(T),
    Planned(Vec<PlannedAction>),
}

impl<T> Effect<T> {
    pub fn is_planned(&self) -> bool {
        matches!(self, Effect::Planned(_))
    }

    pub fn applied(self) -> Option<T> {
        match self {
            Effect::Applied(value) => Some(value),
            Effect::Planned(_) => None,
        }
    }

    /// Печатает запланированные действия, если это dry-run
    pub fn report(&self) {
        if let Effect::Planned(actions) = self {
            for action in actions {
                logger::dry_run(&action.to_string());
            }
        }
    }
}
