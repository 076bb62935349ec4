//! System command module.
//!
//! Passive module registering `system.ping`, `system.reboot`, and
//! `system.factory_reset`. Reboot paths reply first so the transport
//! can flush the acknowledgement, then restart; on the host they only
//! log, which keeps the handlers exercisable in tests.

use std::sync::Arc;

use anyhow::Result;
use log::{info, warn};

use crate::core::command::{CmdReply, CommandRequest};
use crate::core::config::ConfigStore;
use crate::core::module::Module;
use crate::core::services::ServiceRegistry;

pub struct SystemModule;

impl SystemModule {
    pub fn new() -> Self {
        Self
    }
}

impl Default for SystemModule {
    fn default() -> Self {
        Self::new()
    }
}

fn restart() {
    #[cfg(target_os = "espidf")]
    {
        std::thread::sleep(std::time::Duration::from_millis(200));
        unsafe { esp_idf_svc::sys::esp_restart() };
    }
    #[cfg(not(target_os = "espidf"))]
    warn!("restart requested (ignored on host)");
}

impl Module for SystemModule {
    fn id(&self) -> &'static str {
        "system"
    }

    fn dependencies(&self) -> &'static [&'static str] {
        &["loghub", "cmd", "config"]
    }

    fn init(&mut self, cfg: &Arc<ConfigStore>, services: &mut ServiceRegistry) -> Result<()> {
        let Some(cmd) = services.command("cmd") else {
            anyhow::bail!("system: command service unavailable");
        };

        cmd.register(
            "system.ping",
            Arc::new(|_req: &CommandRequest<'_>, reply: &mut CmdReply| {
                let _ = reply.push_str("{\"ok\":true,\"pong\":true}");
                true
            }),
        );

        cmd.register(
            "system.reboot",
            Arc::new(|_req: &CommandRequest<'_>, reply: &mut CmdReply| {
                let _ = reply.push_str("{\"ok\":true,\"msg\":\"rebooting\"}");
                restart();
                true
            }),
        );

        let store = cfg.clone();
        cmd.register(
            "system.factory_reset",
            Arc::new(move |_req: &CommandRequest<'_>, reply: &mut CmdReply| {
                let cleared = store.erase_persistent();
                if cleared {
                    let _ = reply.push_str("{\"ok\":true,\"msg\":\"nvs_cleared\"}");
                } else {
                    let _ = reply.push_str("{\"ok\":false}");
                }
                restart();
                cleared
            }),
        );

        info!("Commands registered: system.ping system.reboot system.factory_reset");
        Ok(())
    }

    fn run_once(&mut self) {}

    fn has_task(&self) -> bool {
        false
    }
}
