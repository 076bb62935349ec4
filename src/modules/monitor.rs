//! System monitor module.
//!
//! Periodic health summary (uptime, event/log pressure) and the config
//! store's NVS write-pressure log tick.

use std::sync::Arc;

use anyhow::Result;
use log::info;

use crate::adapters::clock::Clock;
use crate::core::bus::EventBus;
use crate::core::config::ConfigStore;
use crate::core::logging::LogHub;
use crate::core::module::{Module, TaskSpec};
use crate::core::services::ServiceRegistry;

/// Health summary interval.
const SUMMARY_PERIOD_MS: u64 = 30_000;

/// NVS pressure log interval.
const NVS_PRESSURE_PERIOD_MS: u64 = 60_000;

pub struct SystemMonitorModule {
    clock: Arc<dyn Clock>,
    cfg: Option<Arc<ConfigStore>>,
    bus: Option<Arc<EventBus>>,
    hub: Option<Arc<LogHub>>,
    last_summary_ms: u64,
}

impl SystemMonitorModule {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            cfg: None,
            bus: None,
            hub: None,
            last_summary_ms: 0,
        }
    }
}

impl Module for SystemMonitorModule {
    fn id(&self) -> &'static str {
        "sysmon"
    }

    fn dependencies(&self) -> &'static [&'static str] {
        &["loghub", "config", "eventbus"]
    }

    fn init(&mut self, cfg: &Arc<ConfigStore>, services: &mut ServiceRegistry) -> Result<()> {
        self.cfg = Some(cfg.clone());
        self.bus = services.event_bus("eventbus");
        self.hub = services.log_hub("loghub");
        Ok(())
    }

    fn run_once(&mut self) {
        let now_ms = self.clock.monotonic_ms();

        if let Some(cfg) = &self.cfg {
            cfg.log_pressure(now_ms, NVS_PRESSURE_PERIOD_MS);
        }

        if now_ms.saturating_sub(self.last_summary_ms) < SUMMARY_PERIOD_MS {
            return;
        }
        self.last_summary_ms = now_ms;

        let dropped_events = self.bus.as_ref().map_or(0, |b| b.dropped());
        let dropped_logs = self.hub.as_ref().map_or(0, |h| h.dropped());
        info!(
            "up={}s events_dropped={} logs_dropped={}",
            now_ms / 1000,
            dropped_events,
            dropped_logs
        );
    }

    fn task_spec(&self) -> TaskSpec {
        TaskSpec {
            stack_size: 3072,
            priority: 1,
            core: Some(0),
        }
    }
}
