//! Slash-command registry
//!
//! Maps command names to handlers. Lookup misses and handler failures are
//! answered with an ephemeral acknowledgement instead of an error, so the
//! gateway never leaves an interaction unanswered.

use std::collections::BTreeMap;

use crate::Result;

/// Reply sent for an unknown command
pub const NOT_FOUND_REPLY: &str = "command not found";

/// Reply sent when a handler fails
pub const FAILURE_REPLY: &str = "something went wrong";

/// Response to a command invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Message content
    pub content: String,
    /// Visible only to the invoking user
    pub ephemeral: bool,
}

impl Reply {
    /// Public reply
    #[must_use]
    pub fn public(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ephemeral: false,
        }
    }

    /// Reply only the invoking user sees
    #[must_use]
    pub fn ephemeral(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ephemeral: true,
        }
    }
}

type Handler = Box<dyn Fn() -> Result<Reply> + Send + Sync>;

struct Command {
    description: String,
    handler: Handler,
}

/// Registered commands by name
#[derive(Default)]
pub struct CommandRegistry {
    commands: BTreeMap<String, Command>,
}

impl CommandRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in commands
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("ping", "pong!", || Ok(Reply::public("pong!")));
        registry
    }

    /// Add or replace a command
    pub fn register<F>(&mut self, name: &str, description: &str, handler: F)
    where
        F: Fn() -> Result<Reply> + Send + Sync + 'static,
    {
        tracing::debug!(name, "command registered");
        self.commands.insert(
            name.to_string(),
            Command {
                description: description.to_string(),
                handler: Box::new(handler),
            },
        );
    }

    /// Run the command called `name`
    #[must_use]
    pub fn dispatch(&self, name: &str) -> Reply {
        let Some(command) = self.commands.get(name) else {
            tracing::warn!(name, "unknown command");
            return Reply::ephemeral(NOT_FOUND_REPLY);
        };

        match (command.handler)() {
            Ok(reply) => reply,
            Err(e) => {
                tracing::error!(name, error = %e, "command failed");
                Reply::ephemeral(FAILURE_REPLY)
            }
        }
    }

    /// Names and descriptions, for registering with the gateway
    pub fn definitions(&self) -> impl Iterator<Item = (&str, &str)> {
        self.commands
            .iter()
            .map(|(name, command)| (name.as_str(), command.description.as_str()))
    }

    /// Number of registered commands
    #[must_use]
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Whether no commands are registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}
