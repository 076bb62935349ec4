//! Time sync state machine tests driven through module wiring: network
//! readiness from the data store, warmup, retry ladder, and the synced
//! steady state.

use std::sync::Arc;

use poolflow::adapters::clock::SimClock;
use poolflow::adapters::nvs::MemBackend;
use poolflow::adapters::sntp::SimSyncBackend;
use poolflow::core::config::ConfigStore;
use poolflow::core::module::Module;
use poolflow::core::services::{ServiceRegistry, TimeSyncState};
use poolflow::modules::command::CommandModule;
use poolflow::modules::data_store::DataStoreModule;
use poolflow::modules::event_bus::EventBusModule;
use poolflow::modules::logging::LogHubModule;
use poolflow::modules::time::TimeModule;

struct TimeRig {
    module: TimeModule,
    services: ServiceRegistry,
    cfg: Arc<ConfigStore>,
    clock: Arc<SimClock>,
}

fn time_rig(script: Vec<Option<u64>>) -> TimeRig {
    let cfg = Arc::new(ConfigStore::new(Box::new(MemBackend::new())));
    let clock = Arc::new(SimClock::new());
    clock.advance_ms(1);

    let mut services = ServiceRegistry::new();
    let mut loghub = LogHubModule::new();
    let mut eventbus = EventBusModule::new();
    let mut datastore = DataStoreModule::new();
    let mut cmd = CommandModule::new();
    loghub.init(&cfg, &mut services).unwrap();
    eventbus.init(&cfg, &mut services).unwrap();
    datastore.init(&cfg, &mut services).unwrap();
    cmd.init(&cfg, &mut services).unwrap();

    let mut module = TimeModule::new(clock.clone(), Box::new(SimSyncBackend::new(script)));
    module.init(&cfg, &mut services).unwrap();
    cfg.load_persistent();
    module.on_config_loaded(&cfg, &services);

    TimeRig {
        module,
        services,
        cfg,
        clock,
    }
}

/// Flip WiFi readiness in the data store and deliver the change event.
fn set_network(rig: &TimeRig, ready: bool) {
    let data = rig.services.data("datastore").unwrap();
    data.set_wifi_ready(ready);
    let bus = rig.services.event_bus("eventbus").unwrap();
    bus.dispatch(16);
}

fn state(rig: &TimeRig) -> TimeSyncState {
    rig.services.time("time").unwrap().state()
}

#[test]
fn waits_for_network_then_warms_up_then_syncs() {
    let mut rig = time_rig(vec![Some(1_700_000_000)]);
    assert_eq!(state(&rig), TimeSyncState::WaitingNetwork);

    rig.module.run_once();
    assert_eq!(state(&rig), TimeSyncState::WaitingNetwork);

    set_network(&rig, true);
    rig.module.run_once();
    // Warmup not elapsed yet.
    assert_eq!(state(&rig), TimeSyncState::WaitingNetwork);

    rig.clock.advance_ms(2_000);
    rig.module.run_once(); // -> Syncing
    assert_eq!(state(&rig), TimeSyncState::Syncing);
    rig.module.run_once(); // attempt succeeds -> Synced
    assert_eq!(state(&rig), TimeSyncState::Synced);

    let time = rig.services.time("time").unwrap();
    assert!(time.is_synced());
    assert!(time.epoch() >= 1_700_000_000);
    // Data store mirrors readiness.
    assert!(rig.services.data("datastore").unwrap().read().time.time_ready);
}

#[test]
fn failed_sync_backs_off_then_recovers() {
    let mut rig = time_rig(vec![None, None, Some(1_700_000_000)]);
    set_network(&rig, true);
    rig.clock.advance_ms(2_000);
    rig.module.run_once(); // -> Syncing
    rig.module.run_once(); // attempt 1 fails -> ErrorWait
    assert_eq!(state(&rig), TimeSyncState::ErrorWait);

    // Before the retry delay nothing changes.
    rig.clock.advance_ms(500);
    rig.module.run_once();
    assert_eq!(state(&rig), TimeSyncState::ErrorWait);

    // Past the (jittered) first rung of the ladder.
    rig.clock.advance_ms(3_000);
    rig.module.run_once(); // -> Syncing
    assert_eq!(state(&rig), TimeSyncState::Syncing);
    rig.module.run_once(); // attempt 2 fails
    assert_eq!(state(&rig), TimeSyncState::ErrorWait);

    // Second rung is at most 5.75 s with jitter.
    rig.clock.advance_ms(6_000);
    rig.module.run_once();
    rig.module.run_once(); // attempt 3 succeeds
    assert_eq!(state(&rig), TimeSyncState::Synced);
}

#[test]
fn losing_network_interrupts_error_wait() {
    let mut rig = time_rig(vec![None]);
    set_network(&rig, true);
    rig.clock.advance_ms(2_000);
    rig.module.run_once();
    rig.module.run_once();
    assert_eq!(state(&rig), TimeSyncState::ErrorWait);

    set_network(&rig, false);
    rig.module.run_once();
    assert_eq!(state(&rig), TimeSyncState::WaitingNetwork);
}

#[test]
fn disabled_by_config() {
    let mut rig = time_rig(vec![Some(1_700_000_000)]);
    assert!(rig.cfg.set_bool("time", "enabled", false));
    // The cached flag refreshes through ConfigChanged; without the bus
    // wired to the store the module picks it up on the next reload.
    rig.cfg.set_event_bus(rig.services.event_bus("eventbus").unwrap());
    assert!(rig.cfg.set_bool("time", "enabled", true));
    assert!(rig.cfg.set_bool("time", "enabled", false));
    rig.services.event_bus("eventbus").unwrap().dispatch(16);

    rig.module.run_once();
    assert_eq!(state(&rig), TimeSyncState::Disabled);
}

#[test]
fn resync_command_restarts_cycle() {
    let mut rig = time_rig(vec![Some(1_700_000_000)]);
    set_network(&rig, true);
    rig.clock.advance_ms(2_000);
    rig.module.run_once();
    rig.module.run_once();
    assert_eq!(state(&rig), TimeSyncState::Synced);

    let dispatcher = rig.services.command("cmd").unwrap();
    let mut reply = poolflow::core::command::CmdReply::new();
    assert!(dispatcher.execute("time.resync", None, None, &mut reply));
    assert_eq!(reply.as_str(), "{\"ok\":true}");
    assert_eq!(state(&rig), TimeSyncState::WaitingNetwork);
}
