//! Command encoding.
//!
//! Every argument is wrapped in double quotes with `"` and `\` escaped.
//! Quoting unconditionally is always valid, so there is no "bare word" mode.

use std::fmt;

use crate::error::{MpdError, Result};

/// Commands whose arguments must never reach a log line.
const SECRET_COMMANDS: &[&str] = &["password"];

/// Quote and escape a single argument.
pub fn quote(arg: &str) -> String {
    let mut quoted = String::with_capacity(arg.len() + 2);
    quoted.push('"');
    for c in arg.chars() {
        if c == '"' || c == '\\' {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted
}

/// One protocol command: a name followed by ordered arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    name: String,
    args: Vec<String>,
}

impl Command {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
        }
    }

    /// Append one argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments in order.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn arguments(&self) -> &[String] {
        &self.args
    }

    /// Wire form without the trailing newline.
    ///
    /// Fails if the name is not a single token or an argument contains a
    /// line break: the protocol has no escape for either.
    pub fn encode(&self) -> Result<String> {
        if self.name.is_empty() || self.name.contains(char::is_whitespace) {
            return Err(MpdError::InvalidArgument(format!(
                "invalid command name {:?}",
                self.name
            )));
        }

        let mut line = self.name.clone();
        for arg in &self.args {
            if arg.contains(['\n', '\r']) {
                return Err(MpdError::InvalidArgument(format!(
                    "argument to {} contains a line break",
                    self.name
                )));
            }
            line.push(' ');
            line.push_str(&quote(arg));
        }
        Ok(line)
    }

    fn is_secret(&self) -> bool {
        SECRET_COMMANDS.contains(&self.name.as_str())
    }
}

/// Log-safe rendering: arguments of secret commands are masked.
impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        for arg in &self.args {
            if self.is_secret() {
                write!(f, " \"***\"")?;
            } else {
                write!(f, " {}", quote(arg))?;
            }
        }
        Ok(())
    }
}

/// A batch of commands sent in one round trip.
///
/// Plain lists (`command_list_begin`) answer with the concatenated output of
/// all sub-commands; lists with OK markers (`command_list_ok_begin`) put a
/// `list_OK` line after each successful sub-command. Either way the server
/// stops at the first failing sub-command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandList {
    commands: Vec<Command>,
    ok_markers: bool,
}

impl CommandList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ok_markers() -> Self {
        Self {
            commands: Vec::new(),
            ok_markers: true,
        }
    }

    pub fn push(&mut self, command: Command) {
        self.commands.push(command);
    }

    /// Builder-style [`push`](Self::push).
    pub fn command(mut self, command: Command) -> Self {
        self.commands.push(command);
        self
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn uses_ok_markers(&self) -> bool {
        self.ok_markers
    }

    /// All lines of the batch, framing included, joined by `\n` without a
    /// trailing newline.
    pub fn encode(&self) -> Result<String> {
        if self.commands.is_empty() {
            return Err(MpdError::InvalidArgument("empty command list".to_string()));
        }

        let mut lines = Vec::with_capacity(self.commands.len() + 2);
        lines.push(if self.ok_markers {
            "command_list_ok_begin".to_string()
        } else {
            "command_list_begin".to_string()
        });
        for command in &self.commands {
            lines.push(command.encode()?);
        }
        lines.push("command_list_end".to_string());
        Ok(lines.join("\n"))
    }
}

impl fmt::Display for CommandList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self.commands.iter().map(ToString::to_string).collect();
        write!(f, "[{}]", names.join("; "))
    }
}
