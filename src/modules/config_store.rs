//! Config store ownership module.
//!
//! Passive module publishing the already-constructed [`ConfigStore`]
//! as the `config` service, plus the `config.get`/`config.set` command
//! surface over the JSON patch format.

use std::sync::Arc;

use anyhow::Result;
use log::info;
use serde_json::Value as Json;

use crate::core::command::{CmdReply, CommandRequest};
use crate::core::config::ConfigStore;
use crate::core::module::Module;
use crate::core::services::{Service, ServiceRegistry};
use crate::error::{ErrorCode, write_error_json};

pub struct ConfigStoreModule {
    cfg: Arc<ConfigStore>,
}

impl ConfigStoreModule {
    pub fn new(cfg: Arc<ConfigStore>) -> Self {
        Self { cfg }
    }
}

impl Module for ConfigStoreModule {
    fn id(&self) -> &'static str {
        "config"
    }

    fn dependencies(&self) -> &'static [&'static str] {
        &["loghub", "cmd"]
    }

    fn init(&mut self, _cfg: &Arc<ConfigStore>, services: &mut ServiceRegistry) -> Result<()> {
        services.add("config", Service::Config(self.cfg.clone()));

        if let Some(cmd) = services.command("cmd") {
            let store = self.cfg.clone();
            cmd.register(
                "config.set",
                Arc::new(move |req: &CommandRequest<'_>, reply: &mut CmdReply| {
                    let Some(patch) = req.params() else {
                        write_error_json(reply, ErrorCode::MissingArgs, "config.set");
                        return false;
                    };
                    if !store.apply_json(patch) {
                        write_error_json(reply, ErrorCode::BadCfgJson, "config.set");
                        return false;
                    }
                    let _ = reply.push_str("{\"ok\":true}");
                    true
                }),
            );

            let store = self.cfg.clone();
            cmd.register(
                "config.get",
                Arc::new(move |req: &CommandRequest<'_>, reply: &mut CmdReply| {
                    use core::fmt::Write as _;
                    let module = req
                        .params()
                        .and_then(|p| p.get("module"))
                        .and_then(Json::as_str);
                    let Some(module) = module else {
                        write_error_json(reply, ErrorCode::MissingArgs, "config.get");
                        return false;
                    };
                    let mut body: heapless::String<400> = heapless::String::new();
                    let (any, truncated) = store.to_json_module(module, &mut body);
                    if truncated {
                        write_error_json(reply, ErrorCode::CfgTruncated, "config.get");
                        return false;
                    }
                    if !any {
                        write_error_json(reply, ErrorCode::UnknownTopic, "config.get");
                        return false;
                    }
                    let _ = write!(reply, "{{\"ok\":true,\"config\":{}}}", body.as_str());
                    true
                }),
            );
        }

        info!("ConfigStore service registered");
        Ok(())
    }

    fn run_once(&mut self) {}

    fn has_task(&self) -> bool {
        false
    }
}
