//! Log pipeline modules: hub ownership, serial sink, dispatcher task.
//!
//! `LogHubModule` owns the hub and the sink registry and bridges the
//! `log` facade into the hub queue. `LogSerialSinkModule` registers the
//! console sink. `LogDispatcherModule` runs the task that drains the
//! queue and fans entries out to every sink.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use crate::core::config::ConfigStore;
use crate::core::logging::{self, LogEntry, LogHub, LogSink, SinkRegistry};
use crate::core::module::Module;
use crate::core::services::{Service, ServiceRegistry};

/// How long the dispatcher blocks on an empty queue per iteration.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(250);

// ── Hub ───────────────────────────────────────────────────────

/// Passive module owning the log hub and the sink registry.
pub struct LogHubModule {
    hub: Arc<LogHub>,
    sinks: Arc<SinkRegistry>,
}

impl LogHubModule {
    pub fn new() -> Self {
        Self {
            hub: Arc::new(LogHub::new()),
            sinks: Arc::new(SinkRegistry::new()),
        }
    }
}

impl Default for LogHubModule {
    fn default() -> Self {
        Self::new()
    }
}

impl Module for LogHubModule {
    fn id(&self) -> &'static str {
        "loghub"
    }

    fn init(&mut self, _cfg: &Arc<ConfigStore>, services: &mut ServiceRegistry) -> Result<()> {
        services.add("loghub", Service::LogHub(self.hub.clone()));
        services.add("logsinks", Service::LogSinks(self.sinks.clone()));
        logging::install(self.hub.clone());
        Ok(())
    }

    fn run_once(&mut self) {}

    fn has_task(&self) -> bool {
        false
    }
}

// ── Serial sink ───────────────────────────────────────────────

/// Writes entries to the serial console (UART on-target, stdout on the
/// host).
pub struct SerialSink;

impl LogSink for SerialSink {
    fn write(&self, entry: &LogEntry) {
        println!(
            "{:>8}.{:03} [{}] {:<10} {}{}",
            entry.ts_ms / 1000,
            entry.ts_ms % 1000,
            entry.level.as_str(),
            entry.tag.as_str(),
            entry.msg.as_str(),
            if entry.truncated { "…" } else { "" }
        );
    }
}

/// Passive module registering the serial sink.
pub struct LogSerialSinkModule;

impl LogSerialSinkModule {
    pub fn new() -> Self {
        Self
    }
}

impl Default for LogSerialSinkModule {
    fn default() -> Self {
        Self::new()
    }
}

impl Module for LogSerialSinkModule {
    fn id(&self) -> &'static str {
        "logserial"
    }

    fn dependencies(&self) -> &'static [&'static str] {
        &["loghub"]
    }

    fn init(&mut self, _cfg: &Arc<ConfigStore>, services: &mut ServiceRegistry) -> Result<()> {
        if let Some(sinks) = services.log_sinks("logsinks") {
            sinks.add(Arc::new(SerialSink));
        }
        Ok(())
    }

    fn run_once(&mut self) {}

    fn has_task(&self) -> bool {
        false
    }
}

// ── Dispatcher ────────────────────────────────────────────────

/// Active module draining the hub queue into the registered sinks.
pub struct LogDispatcherModule {
    hub: Option<Arc<LogHub>>,
    sinks: Option<Arc<SinkRegistry>>,
}

impl LogDispatcherModule {
    pub fn new() -> Self {
        Self {
            hub: None,
            sinks: None,
        }
    }
}

impl Default for LogDispatcherModule {
    fn default() -> Self {
        Self::new()
    }
}

impl Module for LogDispatcherModule {
    fn id(&self) -> &'static str {
        "logdispatch"
    }

    fn dependencies(&self) -> &'static [&'static str] {
        &["loghub"]
    }

    fn init(&mut self, _cfg: &Arc<ConfigStore>, services: &mut ServiceRegistry) -> Result<()> {
        self.hub = services.log_hub("loghub");
        self.sinks = services.log_sinks("logsinks");
        Ok(())
    }

    fn run_once(&mut self) {
        let (Some(hub), Some(sinks)) = (&self.hub, &self.sinks) else {
            return;
        };
        // Drain whatever is queued, then block briefly for more.
        while logging::dispatch_once(hub, sinks, Duration::ZERO) {}
        let _ = logging::dispatch_once(hub, sinks, DRAIN_TIMEOUT);
    }
}
