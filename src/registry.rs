use crate::command::Command;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Root commands of a dialogue, keyed and ordered by name.
pub type Commands = BTreeMap<String, Arc<Command>>;

/// Name → command mapping owned by one dialogue and guarded by its lock.
#[derive(Default)]
pub(crate) struct Registry {
    commands: Commands,
}

impl Registry {
    /// Insert or replace `command` under its own name.
    pub(crate) fn insert(&mut self, command: Arc<Command>) {
        self.commands.insert(command.name().to_string(), command);
    }

    pub(crate) fn get(&self, name: &str) -> Option<Arc<Command>> {
        self.commands.get(name).cloned()
    }

    pub(crate) fn contains(&self, name: &str) -> bool {
        self.commands.contains_key(name)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub(crate) fn snapshot(&self) -> Commands {
        self.commands.clone()
    }
}
