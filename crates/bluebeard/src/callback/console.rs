use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use super::group::CallbackGroup;
use super::handle::{CallbackHandle, CallbackKind, RegistrationFlag};

type CommandFn = Rc<RefCell<dyn FnMut(&[&str]) -> String>>;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConsoleError {
    #[error("empty command line")]
    Empty,
    #[error("unknown command: {0}")]
    UnknownCommand(String),
    #[error("command already registered: {0}")]
    Duplicate(String),
    #[error("command {0} is already running")]
    Busy(String),
}

struct Command {
    flag: RegistrationFlag,
    handler: CommandFn,
}

#[derive(Default)]
struct Commands {
    next_id: u64,
    entries: BTreeMap<String, Command>,
}

/// Operator commands, registered by name and executed from a text line.
#[derive(Clone, Default)]
pub struct Console {
    inner: Rc<RefCell<Commands>>,
}

impl Console {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_command<F>(
        &self,
        name: &str,
        group: &mut CallbackGroup,
        handler: F,
    ) -> Result<(), ConsoleError>
    where
        F: FnMut(&[&str]) -> String + 'static,
    {
        let flag = RegistrationFlag::new();
        let id = {
            let mut commands = self.inner.borrow_mut();
            if commands
                .entries
                .get(name)
                .is_some_and(|c| !c.flag.is_released())
            {
                return Err(ConsoleError::Duplicate(name.to_string()));
            }

            commands.next_id += 1;
            let id = commands.next_id;
            commands.entries.insert(
                name.to_string(),
                Command {
                    flag: flag.clone(),
                    handler: Rc::new(RefCell::new(handler)),
                },
            );
            id
        };

        group.adopt(CallbackHandle::new(CallbackKind::ConsoleCommand, id, name, flag));
        Ok(())
    }

    pub fn execute(&self, line: &str) -> Result<String, ConsoleError> {
        let mut words = line.split_whitespace();
        let name = words.next().ok_or(ConsoleError::Empty)?;
        let args: Vec<&str> = words.collect();

        let handler = {
            let mut commands = self.inner.borrow_mut();
            let live = commands
                .entries
                .get(name)
                .map(|c| (!c.flag.is_released(), Rc::clone(&c.handler)));
            match live {
                Some((true, handler)) => handler,
                Some((false, _)) => {
                    commands.entries.remove(name);
                    return Err(ConsoleError::UnknownCommand(name.to_string()));
                }
                None => return Err(ConsoleError::UnknownCommand(name.to_string())),
            }
        };

        let mut handler = handler
            .try_borrow_mut()
            .map_err(|_| ConsoleError::Busy(name.to_string()))?;
        Ok((*handler)(&args))
    }

    pub fn command_names(&self) -> Vec<String> {
        self.inner
            .borrow()
            .entries
            .iter()
            .filter(|(_, c)| !c.flag.is_released())
            .map(|(name, _)| name.clone())
            .collect()
    }
}
