use dialoguer::{Confirm, Input, Password, Select};

use crate::{
    context::Confirmation,
    error::{IoContext, ProvisionError, Result},
};

/// Источник ответов оператора
///
/// Подтверждения по умолчанию всегда отрицательные: разрушительные и
/// привилегированные действия выполняются только после явного "да".
pub trait Prompter {
    fn confirm(&self, message: &str) -> Result<bool>;
    fn input(&self, message: &str) -> Result<String>;
    /// Ввод скрытого значения с повторным подтверждением
    fn password(&self, message: &str) -> Result<String>;
    fn select(&self, message: &str, items: &[&str]) -> Result<usize>;
}

/// Интерактивные запросы через терминал
pub struct TerminalPrompter;

impl Prompter for TerminalPrompter {
    fn confirm(&self, message: &str) -> Result<bool> {
        Confirm::new()
            .with_prompt(message)
            .default(false)
            .interact()
            .io_context(|| "Ошибка ввода подтверждения")
    }

    fn input(&self, message: &str) -> Result<String> {
        Input::<String>::new()
            .with_prompt(message)
            .allow_empty(true)
            .interact_text()
            .io_context(|| "Ошибка ввода")
    }

    fn password(&self, message: &str) -> Result<String> {
        Password::new()
            .with_prompt(message)
            .with_confirmation("Подтвердите значение", "Значения не совпадают, попробуйте еще раз")
            .allow_empty_password(true)
            .interact()
            .io_context(|| "Ошибка ввода скрытого значения")
    }

    fn select(&self, message: &str, items: &[&str]) -> Result<usize> {
        Select::new()
            .with_prompt(message)
            .items(items)
            .default(0)
            .interact()
            .io_context(|| "Ошибка выбора пункта")
    }
}

/// Автоматический режим: запросы подавлены, используются значения по умолчанию
pub struct HeadlessPrompter {
    confirmation: Confirmation,
}

impl HeadlessPrompter {
    pub fn new(confirmation: Confirmation) -> Self {
        Self { confirmation }
    }
}

impl Prompter for HeadlessPrompter {
    fn confirm(&self, message: &str) -> Result<bool> {
        let answer = self.confirmation == Confirmation::AssumeYes;
        log::info!(
            "Автоматический режим: {} -> {}",
            message,
            if answer { "да" } else { "нет" }
        );
        Ok(answer)
    }

    fn input(&self, message: &str) -> Result<String> {
        Err(ProvisionError::PromptUnavailable(message.to_string()))
    }

    fn password(&self, message: &str) -> Result<String> {
        Err(ProvisionError::PromptUnavailable(message.to_string()))
    }

    fn select(&self, message: &str, _items: &[&str]) -> Result<usize> {
        Err(ProvisionError::PromptUnavailable(message.to_string()))
    }
}

#[cfg(test)]
pub mod scripted {
    use std::{cell::RefCell, collections::VecDeque};

    use super::*;

    #[derive(Debug, Clone)]
    pub enum Answer {
        Confirm(bool),
        Text(String),
        Choice(usize),
    }

    /// Заранее записанные ответы для тестов
    pub struct ScriptedPrompter {
        answers: RefCell<VecDeque<Answer>>,
        pub asked: RefCell<Vec<String>>,
    }

    impl ScriptedPrompter {
        pub fn new(answers: Vec<Answer>) -> Self {
            Self {
                answers: RefCell::new(answers.into()),
                asked: RefCell::new(Vec::new()),
            }
        }

        fn next(&self, message: &str) -> Result<Answer> {
            self.asked.borrow_mut().push(message.to_string());
            self.answers
                .borrow_mut()
                .pop_front()
                .ok_or_else(|| ProvisionError::PromptUnavailable(message.to_string()))
        }

        pub fn remaining(&self) -> usize {
            self.answers.borrow().len()
        }
    }

    impl Prompter for ScriptedPrompter {
        fn confirm(&self, message: &str) -> Result<bool> {
            match self.next(message)? {
                Answer::Confirm(value) => Ok(value),
                other => panic!("ожидался ответ confirm, получен {:?}", other),
            }
        }

        fn input(&self, message: &str) -> Result<String> {
            match self.next(message)? {
                Answer::Text(value) => Ok(value),
                other => panic!("ожидался текст, получен {:?}", other),
            }
        }

        fn password(&self, message: &str) -> Result<String> {
            self.input(message)
        }

        fn select(&self, message: &str, items: &[&str]) -> Result<usize> {
            match self.next(message)? {
                Answer::Choice(index) if index < items.len() => Ok(index),
                other => panic!("ожидался выбор из {} пунктов, получен {:?}", items.len(), other),
            }
        }
    }
}
