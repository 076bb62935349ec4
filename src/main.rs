//! PoolFlow firmware — entry point and module wiring.
//!
//! Boot order: NVS + migrations, core stores, module registration in
//! dependency-friendly order, `init_all` (topological sort + init +
//! persistent load), then task spawn. After that every module talks
//! only through the event bus, the data store, the service registry,
//! and the command dispatcher.

#![deny(unused_must_use)]

use std::sync::Arc;

use anyhow::{Context, Result};
use log::info;

use poolflow::adapters::clock::{Clock, SystemClock};
use poolflow::adapters::nvs::NvsBackend;
use poolflow::adapters::sntp::EspSntpBackend;
use poolflow::core::config::{ConfigBackend, ConfigStore, MigrationStep, VERSION_KEY};
use poolflow::core::module::ModuleManager;
use poolflow::core::services::ServiceRegistry;
use poolflow::modules::alarms::AlarmModule;
use poolflow::modules::command::CommandModule;
use poolflow::modules::config_store::ConfigStoreModule;
use poolflow::modules::data_store::DataStoreModule;
use poolflow::modules::event_bus::EventBusModule;
use poolflow::modules::io::{GpioBus, IoModule};
use poolflow::modules::logging::{LogDispatcherModule, LogHubModule, LogSerialSinkModule};
use poolflow::modules::monitor::SystemMonitorModule;
use poolflow::modules::pool::PoolDeviceModule;
use poolflow::modules::sensors::SensorsModule;
use poolflow::modules::system::SystemModule;
use poolflow::modules::time::TimeModule;
use poolflow::modules::wifi::{EspWifiDriver, WifiModule};

/// Current configuration schema version.
const CURRENT_CFG_VERSION: u32 = 1;

fn mig_0_to_1(_backend: &dyn ConfigBackend) -> bool {
    // v0 devices carried no schema key; nothing to rewrite.
    true
}

const MIGRATION_STEPS: &[MigrationStep] = &[MigrationStep {
    from: 0,
    to: 1,
    apply: mig_0_to_1,
}];

fn main() -> Result<()> {
    esp_idf_svc::sys::link_patches();

    println!(
        "\x1b[34m\
         ┌─────────────────────────────┐\n\
         │  PoolFlow v{:<16} │\n\
         └─────────────────────────────┘\x1b[0m\n\
         build: {}",
        env!("CARGO_PKG_VERSION"),
        option_env!("BUILD_TIMESTAMP").unwrap_or("unknown")
    );

    // ── Persistence + migrations ──────────────────────────────
    let backend = NvsBackend::new().context("NVS init")?;
    let cfg = Arc::new(ConfigStore::new(Box::new(backend)));
    if !cfg.run_migrations(CURRENT_CFG_VERSION, MIGRATION_STEPS, VERSION_KEY, true) {
        log::warn!("config migrations incomplete, continuing with defaults");
    }

    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());

    // ── Peripherals ───────────────────────────────────────────
    let peripherals = esp_idf_svc::hal::peripherals::Peripherals::take().context("peripherals")?;
    let sys_loop = esp_idf_svc::eventloop::EspSystemEventLoop::take().context("event loop")?;

    let wifi = esp_idf_svc::wifi::EspWifi::new(peripherals.modem, sys_loop.clone(), None)
        .context("wifi driver")?;
    let wifi = esp_idf_svc::wifi::BlockingWifi::wrap(wifi, sys_loop).context("wifi wrap")?;

    use esp_idf_svc::hal::gpio::{InputPin, OutputPin, PinDriver};
    let pins = peripherals.pins;
    let outputs = vec![
        (8u8, PinDriver::output(pins.gpio16.downgrade_output())?),
        (9u8, PinDriver::output(pins.gpio17.downgrade_output())?),
        (10u8, PinDriver::output(pins.gpio18.downgrade_output())?),
        (11u8, PinDriver::output(pins.gpio19.downgrade_output())?),
    ];
    // GPIO 34/35 are input-only on the ESP32.
    let inputs = vec![
        (12u8, PinDriver::input(pins.gpio34.downgrade_input())?),
        (13u8, PinDriver::input(pins.gpio35.downgrade_input())?),
    ];
    let io_bus = Arc::new(GpioBus::new(outputs, inputs));

    // ── Module registration (order matters only for readability;
    //    the manager sorts by declared dependencies) ────────────
    let mut services = ServiceRegistry::new();
    let mut manager = ModuleManager::new();

    manager.add(Box::new(LogHubModule::new()));
    manager.add(Box::new(LogDispatcherModule::new()));
    manager.add(Box::new(LogSerialSinkModule::new()));
    manager.add(Box::new(EventBusModule::new()));

    manager.add(Box::new(ConfigStoreModule::new(cfg.clone())));
    manager.add(Box::new(DataStoreModule::new()));
    manager.add(Box::new(CommandModule::new()));

    manager.add(Box::new(WifiModule::new(
        clock.clone(),
        Box::new(EspWifiDriver::new(wifi)),
    )));
    manager.add(Box::new(TimeModule::new(
        clock.clone(),
        Box::new(EspSntpBackend::new()),
    )));
    manager.add(Box::new(SystemModule::new()));
    manager.add(Box::new(AlarmModule::new(clock.clone())));
    manager.add(Box::new(IoModule::new(clock.clone(), io_bus)));
    manager.add(Box::new(PoolDeviceModule::new()));
    manager.add(Box::new(SensorsModule::new(clock.clone())));
    manager.add(Box::new(SystemMonitorModule::new(clock.clone())));

    // ── Lifecycle ─────────────────────────────────────────────
    manager
        .init_all(&cfg, &mut services)
        .context("module init")?;
    let running = manager.start(&cfg, &services).context("module start")?;
    info!(
        "boot complete: {} tasks, {} passive modules",
        running.tasks.len(),
        running.passive.len()
    );

    // Module tasks own the system from here on.
    loop {
        std::thread::sleep(std::time::Duration::from_secs(60));
    }
}
