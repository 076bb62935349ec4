//! Event bus ownership module.
//!
//! Owns the process-wide [`EventBus`], publishes it as the `eventbus`
//! service, broadcasts `SystemStarted`, and drains the queue from its
//! task.

use std::sync::Arc;

use anyhow::Result;
use log::info;

use crate::core::bus::EventBus;
use crate::core::config::ConfigStore;
use crate::core::events::EventId;
use crate::core::module::Module;
use crate::core::services::{Service, ServiceRegistry};

/// Events drained per loop iteration.
const DISPATCH_BATCH: u16 = 8;

pub struct EventBusModule {
    bus: Arc<EventBus>,
}

impl EventBusModule {
    pub fn new() -> Self {
        Self {
            bus: Arc::new(EventBus::new()),
        }
    }

    pub fn bus(&self) -> Arc<EventBus> {
        self.bus.clone()
    }
}

impl Default for EventBusModule {
    fn default() -> Self {
        Self::new()
    }
}

impl Module for EventBusModule {
    fn id(&self) -> &'static str {
        "eventbus"
    }

    fn dependencies(&self) -> &'static [&'static str] {
        &["loghub"]
    }

    fn init(&mut self, _cfg: &Arc<ConfigStore>, services: &mut ServiceRegistry) -> Result<()> {
        services.add("eventbus", Service::EventBus(self.bus.clone()));
        info!("EventBus service registered");
        let _ = self.bus.post(EventId::SystemStarted, &[]);
        Ok(())
    }

    fn run_once(&mut self) {
        self.bus.dispatch(DISPATCH_BATCH);
    }
}
