//! Command dispatcher ownership module.
//!
//! Passive module owning the [`CommandDispatcher`] and publishing it as
//! the `cmd` service.

use std::sync::Arc;

use anyhow::Result;
use log::info;

use crate::core::command::CommandDispatcher;
use crate::core::config::ConfigStore;
use crate::core::module::Module;
use crate::core::services::{Service, ServiceRegistry};

pub struct CommandModule {
    dispatcher: Arc<CommandDispatcher>,
}

impl CommandModule {
    pub fn new() -> Self {
        Self {
            dispatcher: Arc::new(CommandDispatcher::new()),
        }
    }

    pub fn dispatcher(&self) -> Arc<CommandDispatcher> {
        self.dispatcher.clone()
    }
}

impl Default for CommandModule {
    fn default() -> Self {
        Self::new()
    }
}

impl Module for CommandModule {
    fn id(&self) -> &'static str {
        "cmd"
    }

    fn dependencies(&self) -> &'static [&'static str] {
        &["loghub"]
    }

    fn init(&mut self, _cfg: &Arc<ConfigStore>, services: &mut ServiceRegistry) -> Result<()> {
        services.add("cmd", Service::Command(self.dispatcher.clone()));
        info!("Command service registered");
        Ok(())
    }

    fn run_once(&mut self) {}

    fn has_task(&self) -> bool {
        false
    }
}
