//! Shared host test rig: the full module set wired against simulated
//! adapters, brought through `init_all` exactly like the firmware boot.

use std::sync::Arc;

use poolflow::adapters::clock::SimClock;
use poolflow::adapters::nvs::MemBackend;
use poolflow::adapters::sntp::SimSyncBackend;
use poolflow::core::config::ConfigStore;
use poolflow::core::module::ModuleManager;
use poolflow::core::services::ServiceRegistry;
use poolflow::modules::alarms::AlarmModule;
use poolflow::modules::command::CommandModule;
use poolflow::modules::config_store::ConfigStoreModule;
use poolflow::modules::data_store::DataStoreModule;
use poolflow::modules::event_bus::EventBusModule;
use poolflow::modules::io::{IoModule, SimIoBus};
use poolflow::modules::logging::{LogDispatcherModule, LogHubModule, LogSerialSinkModule};
use poolflow::modules::monitor::SystemMonitorModule;
use poolflow::modules::pool::PoolDeviceModule;
use poolflow::modules::sensors::SensorsModule;
use poolflow::modules::system::SystemModule;
use poolflow::modules::time::TimeModule;
use poolflow::modules::wifi::{SimWifiDriver, WifiModule};

pub struct Rig {
    pub manager: ModuleManager,
    pub services: ServiceRegistry,
    pub cfg: Arc<ConfigStore>,
    pub clock: Arc<SimClock>,
    pub sim_io: Arc<SimIoBus>,
    /// Direct handle on the alarm engine so tests can step evaluation
    /// at scripted times instead of racing the module task.
    pub alarm_core: Arc<poolflow::modules::alarms::AlarmCore>,
}

/// Construct and init the full module set on host adapters. The sync
/// backend succeeds immediately with the given epoch.
pub fn boot_rig(sync_epoch: u64) -> Rig {
    let cfg = Arc::new(ConfigStore::new(Box::new(MemBackend::new())));
    let clock = Arc::new(SimClock::new());
    clock.advance_ms(1);
    let sim_io = Arc::new(SimIoBus::new());

    let mut services = ServiceRegistry::new();
    let mut manager = ModuleManager::new();

    assert!(manager.add(Box::new(LogHubModule::new())));
    assert!(manager.add(Box::new(LogDispatcherModule::new())));
    assert!(manager.add(Box::new(LogSerialSinkModule::new())));
    assert!(manager.add(Box::new(EventBusModule::new())));

    assert!(manager.add(Box::new(ConfigStoreModule::new(cfg.clone()))));
    assert!(manager.add(Box::new(DataStoreModule::new())));
    assert!(manager.add(Box::new(CommandModule::new())));

    assert!(manager.add(Box::new(WifiModule::new(
        clock.clone(),
        Box::new(SimWifiDriver::new(1)),
    ))));
    assert!(manager.add(Box::new(TimeModule::new(
        clock.clone(),
        Box::new(SimSyncBackend::always(sync_epoch)),
    ))));
    assert!(manager.add(Box::new(SystemModule::new())));
    let alarm_module = AlarmModule::new(clock.clone());
    let alarm_core = alarm_module.core();
    assert!(manager.add(Box::new(alarm_module)));
    assert!(manager.add(Box::new(IoModule::new(clock.clone(), sim_io.clone()))));
    assert!(manager.add(Box::new(PoolDeviceModule::new())));
    assert!(manager.add(Box::new(SensorsModule::new(clock.clone()))));
    assert!(manager.add(Box::new(SystemMonitorModule::new(clock.clone()))));

    manager
        .init_all(&cfg, &mut services)
        .expect("host boot init");
    manager
        .notify_config_loaded(&cfg, &services)
        .expect("post-load hooks");

    Rig {
        manager,
        services,
        cfg,
        clock,
        sim_io,
        alarm_core,
    }
}

/// Run a command through the rig's dispatcher with an args object.
pub fn run_cmd(rig: &Rig, cmd: &str, args: Option<serde_json::Value>) -> (bool, String) {
    let dispatcher = rig.services.command("cmd").expect("cmd service");
    let mut reply = poolflow::core::command::CmdReply::new();
    let ok = dispatcher.execute(cmd, None, args.as_ref(), &mut reply);
    (ok, reply.as_str().to_string())
}
