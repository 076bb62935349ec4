//! Module contract and dependency-ordered lifecycle manager.
//!
//! Boot registers every module in a fixed array, then the manager:
//!
//! 1. topologically sorts the set over declared dependency ids,
//! 2. calls `init` on each module in order (modules register config
//!    variables, look up dependencies, publish services),
//! 3. loads persistent config once the whole table is registered,
//! 4. per module in order: calls `on_config_loaded`, then spawns one
//!    cooperative task for active modules,
//! 5. wires cross-cutting services (event bus into the config store).
//!
//! A missing dependency or a cycle is terminal for the boot: the sort
//! reports it and no task is spawned. The sort succeeds only when every
//! registered module has been placed.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{Result, bail};
use log::{debug, error};

use super::config::ConfigStore;
use super::services::ServiceRegistry;

/// Maximum number of modules supported at runtime.
pub const MAX_MODULES: usize = 15;

/// Cooperative yield between loop iterations.
const TASK_YIELD_MS: u64 = 10;

/// Task sizing hints for active modules.
#[derive(Debug, Clone, Copy)]
pub struct TaskSpec {
    /// Requested stack size in bytes (floored to the platform minimum).
    pub stack_size: usize,
    pub priority: u8,
    /// CPU core affinity hint; applied on-target only.
    pub core: Option<u8>,
}

impl Default for TaskSpec {
    fn default() -> Self {
        Self {
            stack_size: 3072,
            priority: 1,
            core: Some(1),
        }
    }
}

/// Contract every runtime module implements.
///
/// Active modules get one cooperative task each; passive modules do all
/// their work in `init` and through service callbacks.
pub trait Module: Send {
    /// Stable module identifier, used for dependency wiring.
    fn id(&self) -> &'static str;

    /// Task name for the module's cooperative task.
    fn task_name(&self) -> &'static str {
        self.id()
    }

    /// Ids of the modules this one depends on.
    fn dependencies(&self) -> &'static [&'static str] {
        &[]
    }

    /// Register config variables and services, look up dependencies.
    fn init(&mut self, cfg: &Arc<ConfigStore>, services: &mut ServiceRegistry) -> Result<()>;

    /// Called once all persistent config values are loaded.
    fn on_config_loaded(&mut self, _cfg: &Arc<ConfigStore>, _services: &ServiceRegistry) {}

    /// One iteration of the module loop. The task wrapper yields
    /// between iterations.
    fn run_once(&mut self);

    fn task_spec(&self) -> TaskSpec {
        TaskSpec::default()
    }

    /// Whether this module owns a task.
    fn has_task(&self) -> bool {
        true
    }
}

/// Everything left running after boot: task handles for active modules
/// and ownership of the passive ones.
pub struct RunningModules {
    pub tasks: Vec<(&'static str, JoinHandle<()>)>,
    pub passive: Vec<Box<dyn Module>>,
}

/// Registers modules, resolves dependencies, and starts tasks.
pub struct ModuleManager {
    modules: Vec<Box<dyn Module>>,
    initialized: bool,
    config_notified: bool,
}

impl ModuleManager {
    pub fn new() -> Self {
        Self {
            modules: Vec::with_capacity(MAX_MODULES),
            initialized: false,
            config_notified: false,
        }
    }

    /// Add a module in registration order. Rejected beyond the fixed
    /// capacity.
    pub fn add(&mut self, module: Box<dyn Module>) -> bool {
        if self.modules.len() >= MAX_MODULES {
            return false;
        }
        self.modules.push(module);
        true
    }

    pub fn count(&self) -> usize {
        self.modules.len()
    }

    /// Ids in init order. Empty before [`init_all`](Self::init_all).
    pub fn init_order(&self) -> Vec<&'static str> {
        if self.initialized {
            self.modules.iter().map(|m| m.id()).collect()
        } else {
            Vec::new()
        }
    }

    /// Multi-pass topological sort over dependency ids. Every pass
    /// places each module whose dependencies are all already placed; a
    /// pass without progress, or remaining modules after the passes,
    /// means a cycle or an unresolved id.
    fn build_init_order(&self) -> Result<Vec<usize>> {
        let n = self.modules.len();
        let mut placed = vec![false; n];
        let mut order: Vec<usize> = Vec::with_capacity(n);

        // Validate references up front so the report names the culprit.
        for m in &self.modules {
            for dep in m.dependencies() {
                if !self.modules.iter().any(|other| other.id() == *dep) {
                    error!("missing dependency: module={} requires={}", m.id(), dep);
                    bail!("missing dependency: module '{}' requires '{}'", m.id(), dep);
                }
            }
        }

        while order.len() < n {
            let mut progress = false;
            for i in 0..n {
                if placed[i] {
                    continue;
                }
                let deps_ok = self.modules[i].dependencies().iter().all(|dep| {
                    self.modules
                        .iter()
                        .position(|m| m.id() == *dep)
                        .is_some_and(|j| placed[j])
                });
                if deps_ok {
                    order.push(i);
                    placed[i] = true;
                    progress = true;
                }
            }
            if !progress {
                let remaining: Vec<&str> = self
                    .modules
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| !placed[*i])
                    .map(|(_, m)| m.id())
                    .collect();
                error!("cyclic or unresolved deps: {:?}", remaining);
                bail!("cyclic or unresolved dependencies: {:?}", remaining);
            }
        }

        debug!("build_init_order: success (ordered={})", order.len());
        Ok(order)
    }

    /// Initialize all modules in dependency order, then load persistent
    /// config. Terminal on sort or init failure.
    pub fn init_all(
        &mut self,
        cfg: &Arc<ConfigStore>,
        services: &mut ServiceRegistry,
    ) -> Result<()> {
        debug!("init_all: modules={}", self.modules.len());
        let order = self.build_init_order()?;

        // Reorder into init order once; start() walks the same sequence.
        let mut slots: Vec<Option<Box<dyn Module>>> =
            self.modules.drain(..).map(Some).collect();
        self.modules = order
            .iter()
            .map(|&i| slots[i].take().expect("order indices unique"))
            .collect();

        for m in &mut self.modules {
            debug!("init: {}", m.id());
            m.init(cfg, services)?;
        }

        // Load after every module registered its variables.
        cfg.load_persistent();
        self.initialized = true;
        Ok(())
    }

    /// Run every module's `on_config_loaded` hook, in init order.
    /// Called automatically by [`start`](Self::start) when still
    /// pending; exposed so harnesses can finish boot without spawning
    /// tasks.
    pub fn notify_config_loaded(
        &mut self,
        cfg: &Arc<ConfigStore>,
        services: &ServiceRegistry,
    ) -> Result<()> {
        if !self.initialized {
            bail!("notify_config_loaded called before init_all");
        }
        if self.config_notified {
            return Ok(());
        }
        for m in &mut self.modules {
            m.on_config_loaded(cfg, services);
        }
        self.config_notified = true;
        Ok(())
    }

    /// Run the post-load hooks (if still pending) and spawn one
    /// cooperative task per active module, in init order. Finishes by
    /// wiring cross-cutting services.
    pub fn start(
        mut self,
        cfg: &Arc<ConfigStore>,
        services: &ServiceRegistry,
    ) -> Result<RunningModules> {
        self.notify_config_loaded(cfg, services)?;

        let mut tasks = Vec::new();
        let mut passive = Vec::new();

        for m in self.modules.drain(..) {
            if !m.has_task() {
                passive.push(m);
                continue;
            }
            let id = m.id();
            debug!("start task: {}", id);
            let handle = spawn_module_task(m)?;
            tasks.push((id, handle));
        }

        Self::wire_core_services(services);
        debug!("start: done");
        Ok(RunningModules { tasks, passive })
    }

    /// Inject cross-cutting services once everything is registered.
    fn wire_core_services(services: &ServiceRegistry) {
        if let (Some(bus), Some(cfg)) = (services.event_bus("eventbus"), services.config("config"))
        {
            cfg.set_event_bus(bus);
            debug!("wire_core_services: eventbus -> config");
        }
    }
}

impl Default for ModuleManager {
    fn default() -> Self {
        Self::new()
    }
}

fn spawn_module_task(mut module: Box<dyn Module>) -> Result<JoinHandle<()>> {
    let spec = module.task_spec();

    #[cfg(target_os = "espidf")]
    let min_stack = 4096;
    #[cfg(not(target_os = "espidf"))]
    let min_stack = 64 * 1024;

    #[cfg(target_os = "espidf")]
    apply_task_pinning(&spec);

    let handle = std::thread::Builder::new()
        .name(module.task_name().to_string())
        .stack_size(spec.stack_size.max(min_stack))
        .spawn(move || {
            loop {
                module.run_once();
                std::thread::sleep(Duration::from_millis(TASK_YIELD_MS));
            }
        })?;
    Ok(handle)
}

/// Apply priority and core affinity to the next spawned thread.
#[cfg(target_os = "espidf")]
fn apply_task_pinning(spec: &TaskSpec) {
    use esp_idf_svc::hal::cpu::Core;
    use esp_idf_svc::hal::task::thread::ThreadSpawnConfiguration;

    let config = ThreadSpawnConfiguration {
        priority: spec.priority,
        pin_to_core: spec.core.map(|c| if c == 0 { Core::Core0 } else { Core::Core1 }),
        ..Default::default()
    };
    if let Err(e) = config.set() {
        log::warn!("task pinning failed: {}", e);
    }
}
