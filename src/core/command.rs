//! Named command registry with bounded JSON replies.
//!
//! Modules register handlers under dotted names (`system.ping`,
//! `time.scheduler.set`, …) during init. Callers execute a command with
//! an optional parsed request document and args object; the handler
//! writes its JSON reply directly into the caller-provided buffer.
//! Unknown commands produce the fixed error object.

use std::sync::{Arc, Mutex};

use serde_json::Value as Json;

use crate::error::{ErrorCode, write_error_json};

/// Maximum number of registered commands.
pub const MAX_COMMANDS: usize = 24;

/// Maximum command name length.
pub const MAX_COMMAND_NAME: usize = 32;

/// Reply buffer capacity.
pub const REPLY_LEN: usize = 512;

/// Bounded reply buffer handed to handlers.
pub type CmdReply = heapless::String<REPLY_LEN>;

/// Command invocation context.
#[derive(Debug, Clone, Copy)]
pub struct CommandRequest<'a> {
    /// Full dotted command name.
    pub cmd: &'a str,
    /// Parsed request document, when the transport had one.
    pub json: Option<&'a Json>,
    /// The request's `args` object, when present.
    pub args: Option<&'a Json>,
}

impl CommandRequest<'_> {
    /// The args object if present, else the request root. Handlers that
    /// take parameters read from here.
    pub fn params(&self) -> Option<&Json> {
        self.args.or(self.json)
    }
}

/// Command handler object. Returns `true` on success; the reply buffer
/// must contain a JSON object either way.
pub trait CommandHandler: Send + Sync {
    fn execute(&self, req: &CommandRequest<'_>, reply: &mut CmdReply) -> bool;
}

impl<F> CommandHandler for F
where
    F: Fn(&CommandRequest<'_>, &mut CmdReply) -> bool + Send + Sync,
{
    fn execute(&self, req: &CommandRequest<'_>, reply: &mut CmdReply) -> bool {
        self(req, reply)
    }
}

struct Entry {
    name: heapless::String<MAX_COMMAND_NAME>,
    handler: Arc<dyn CommandHandler>,
}

/// Registry of command handlers.
pub struct CommandDispatcher {
    entries: Mutex<heapless::Vec<Entry, MAX_COMMANDS>>,
}

impl CommandDispatcher {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(heapless::Vec::new()),
        }
    }

    /// Register a handler. Duplicate names and overflow are rejected.
    pub fn register(&self, name: &str, handler: Arc<dyn CommandHandler>) -> bool {
        if name.is_empty() || name.len() > MAX_COMMAND_NAME {
            return false;
        }
        let mut entries = self.entries.lock().expect("command table poisoned");
        if entries.iter().any(|e| e.name.as_str() == name) {
            return false;
        }
        let mut key: heapless::String<MAX_COMMAND_NAME> = heapless::String::new();
        let _ = key.push_str(name);
        entries.push(Entry { name: key, handler }).is_ok()
    }

    /// Number of registered commands.
    pub fn count(&self) -> usize {
        self.entries.lock().expect("command table poisoned").len()
    }

    /// Execute a command into the reply buffer. Returns the handler's
    /// success flag; unknown commands write the fixed error object and
    /// return `false`.
    pub fn execute(
        &self,
        cmd: &str,
        json: Option<&Json>,
        args: Option<&Json>,
        reply: &mut CmdReply,
    ) -> bool {
        let handler = {
            let entries = self.entries.lock().expect("command table poisoned");
            entries
                .iter()
                .find(|e| e.name.as_str() == cmd)
                .map(|e| e.handler.clone())
        };
        match handler {
            Some(handler) => {
                reply.clear();
                let req = CommandRequest { cmd, json, args };
                handler.execute(&req, reply)
            }
            None => {
                write_error_json(reply, ErrorCode::UnknownCmd, cmd);
                false
            }
        }
    }
}

impl Default for CommandDispatcher {
    fn default() -> Self {
        Self::new()
    }
}
