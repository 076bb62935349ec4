//! WiFi connectivity module.
//!
//! Owns the station-mode link through a [`WifiDriver`] and publishes
//! connectivity into the data store (`WifiReady`, `WifiIp`), which is
//! what gates the time module's sync state machine. Credentials are
//! plain config variables; changing them forces a reconnect.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use log::{info, warn};

use crate::adapters::clock::Clock;
use crate::core::bus::EventView;
use crate::core::config::{ConfigStore, ConfigValue, VarDef};
use crate::core::data::DataStore;
use crate::core::events::{ConfigChangedPayload, EventId};
use crate::core::module::{Module, TaskSpec};
use crate::core::services::ServiceRegistry;

/// Reconnect attempt spacing.
const RETRY_PERIOD_MS: u64 = 5_000;

/// Station-mode link driver.
pub trait WifiDriver: Send {
    /// One blocking connect attempt.
    fn connect(&mut self, ssid: &str, pass: &str, hostname: &str) -> bool;
    fn disconnect(&mut self);
    fn is_connected(&self) -> bool;
    fn ip(&self) -> [u8; 4];
}

/// Host simulation: connects after a configurable number of attempts.
pub struct SimWifiDriver {
    attempts_until_up: u32,
    attempts: u32,
    connected: bool,
}

impl SimWifiDriver {
    pub fn new(attempts_until_up: u32) -> Self {
        Self {
            attempts_until_up,
            attempts: 0,
            connected: false,
        }
    }
}

impl WifiDriver for SimWifiDriver {
    fn connect(&mut self, ssid: &str, _pass: &str, _hostname: &str) -> bool {
        self.attempts += 1;
        if ssid.is_empty() {
            return false;
        }
        if self.attempts >= self.attempts_until_up {
            self.connected = true;
        }
        self.connected
    }

    fn disconnect(&mut self) {
        self.connected = false;
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn ip(&self) -> [u8; 4] {
        if self.connected { [192, 168, 1, 50] } else { [0, 0, 0, 0] }
    }
}

/// Station driver over ESP-IDF.
#[cfg(target_os = "espidf")]
pub struct EspWifiDriver {
    wifi: esp_idf_svc::wifi::BlockingWifi<esp_idf_svc::wifi::EspWifi<'static>>,
}

#[cfg(target_os = "espidf")]
impl EspWifiDriver {
    pub fn new(
        wifi: esp_idf_svc::wifi::BlockingWifi<esp_idf_svc::wifi::EspWifi<'static>>,
    ) -> Self {
        Self { wifi }
    }
}

#[cfg(target_os = "espidf")]
impl WifiDriver for EspWifiDriver {
    fn connect(&mut self, ssid: &str, pass: &str, _hostname: &str) -> bool {
        use esp_idf_svc::wifi::{AuthMethod, ClientConfiguration, Configuration};

        let config = Configuration::Client(ClientConfiguration {
            ssid: ssid.try_into().unwrap_or_default(),
            password: pass.try_into().unwrap_or_default(),
            auth_method: if pass.is_empty() {
                AuthMethod::None
            } else {
                AuthMethod::WPA2Personal
            },
            ..Default::default()
        });
        if self.wifi.set_configuration(&config).is_err() {
            return false;
        }
        if !self.wifi.is_started().unwrap_or(false) && self.wifi.start().is_err() {
            return false;
        }
        if self.wifi.connect().is_err() {
            return false;
        }
        self.wifi.wait_netif_up().is_ok()
    }

    fn disconnect(&mut self) {
        let _ = self.wifi.disconnect();
    }

    fn is_connected(&self) -> bool {
        self.wifi.is_connected().unwrap_or(false)
    }

    fn ip(&self) -> [u8; 4] {
        self.wifi
            .wifi()
            .sta_netif()
            .get_ip_info()
            .map(|info| info.ip.octets())
            .unwrap_or([0, 0, 0, 0])
    }
}

/// Active module driving the link state.
pub struct WifiModule {
    clock: Arc<dyn Clock>,
    driver: Box<dyn WifiDriver>,
    data: Option<Arc<DataStore>>,
    cfg: Option<Arc<ConfigStore>>,
    creds_dirty: Arc<AtomicBool>,
    enabled: bool,
    ssid: String,
    pass: String,
    hostname: String,
    last_attempt_ms: u64,
    was_connected: bool,
}

impl WifiModule {
    pub fn new(clock: Arc<dyn Clock>, driver: Box<dyn WifiDriver>) -> Self {
        Self {
            clock,
            driver,
            data: None,
            cfg: None,
            creds_dirty: Arc::new(AtomicBool::new(false)),
            enabled: true,
            ssid: String::new(),
            pass: String::new(),
            hostname: "poolflow".to_string(),
            last_attempt_ms: 0,
            was_connected: false,
        }
    }

    fn refresh_credentials(&mut self) {
        let Some(cfg) = &self.cfg else { return };
        self.enabled = cfg.get_bool("wifi", "enabled").unwrap_or(true);
        self.ssid = cfg.get_text("wifi", "ssid").unwrap_or_default();
        self.pass = cfg.get_text("wifi", "pass").unwrap_or_default();
        self.hostname = cfg
            .get_text("wifi", "hostname")
            .unwrap_or_else(|| "poolflow".to_string());
    }

    fn publish_link(&mut self, up: bool) {
        if let Some(data) = &self.data {
            data.set_wifi_ready(up);
            data.set_wifi_ip(if up { self.driver.ip() } else { [0, 0, 0, 0] });
        }
        if up != self.was_connected {
            if up {
                let ip = self.driver.ip();
                info!("wifi up, ip={}.{}.{}.{}", ip[0], ip[1], ip[2], ip[3]);
            } else {
                warn!("wifi down");
            }
        }
        self.was_connected = up;
    }
}

impl Module for WifiModule {
    fn id(&self) -> &'static str {
        "wifi"
    }

    fn dependencies(&self) -> &'static [&'static str] {
        &["loghub", "datastore", "eventbus"]
    }

    fn init(&mut self, cfg: &Arc<ConfigStore>, services: &mut ServiceRegistry) -> Result<()> {
        let defs = [
            VarDef {
                module: "wifi",
                name: "ssid",
                key: "wifi_ssid",
                persistent: true,
                value: ConfigValue::text("", 31),
            },
            VarDef {
                module: "wifi",
                name: "pass",
                key: "wifi_pass",
                persistent: true,
                value: ConfigValue::text("", 63),
            },
            VarDef {
                module: "wifi",
                name: "hostname",
                key: "wifi_host",
                persistent: true,
                value: ConfigValue::text("poolflow", 31),
            },
            VarDef {
                module: "wifi",
                name: "enabled",
                key: "wifi_en",
                persistent: true,
                value: ConfigValue::Bool(true),
            },
        ];
        for def in defs {
            if let Err(e) = cfg.register(def) {
                warn!("wifi config registration failed: {:?}", e);
            }
        }

        self.data = services.data("datastore");
        self.cfg = Some(cfg.clone());

        if let Some(bus) = services.event_bus("eventbus") {
            let dirty = self.creds_dirty.clone();
            bus.subscribe(
                EventId::ConfigChanged,
                Arc::new(move |e: &EventView<'_>| {
                    if let Some(p) = ConfigChangedPayload::decode(e.payload) {
                        if matches!(p.key_str(), "wifi_ssid" | "wifi_pass" | "wifi_en") {
                            dirty.store(true, Ordering::Relaxed);
                        }
                    }
                }),
            );
        }
        Ok(())
    }

    fn on_config_loaded(&mut self, _cfg: &Arc<ConfigStore>, _services: &ServiceRegistry) {
        self.refresh_credentials();
    }

    fn run_once(&mut self) {
        if self.creds_dirty.swap(false, Ordering::Relaxed) {
            info!("wifi credentials changed, reconnecting");
            self.refresh_credentials();
            self.driver.disconnect();
            self.publish_link(false);
        }

        if !self.enabled {
            if self.driver.is_connected() {
                self.driver.disconnect();
            }
            self.publish_link(false);
            return;
        }

        if self.driver.is_connected() {
            self.publish_link(true);
            return;
        }
        self.publish_link(false);

        if self.ssid.is_empty() {
            return; // unprovisioned
        }
        let now = self.clock.monotonic_ms();
        if now.saturating_sub(self.last_attempt_ms) < RETRY_PERIOD_MS && self.last_attempt_ms != 0 {
            return;
        }
        self.last_attempt_ms = now;

        let (ssid, pass, hostname) = (self.ssid.clone(), self.pass.clone(), self.hostname.clone());
        if self.driver.connect(&ssid, &pass, &hostname) {
            self.publish_link(true);
        }
    }

    fn task_spec(&self) -> TaskSpec {
        TaskSpec {
            stack_size: 6144,
            priority: 2,
            core: Some(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::clock::SimClock;
    use crate::adapters::nvs::MemBackend;

    fn module_with(driver: SimWifiDriver) -> (WifiModule, Arc<DataStore>, Arc<SimClock>) {
        let clock = Arc::new(SimClock::new());
        clock.advance_ms(1);
        let mut module = WifiModule::new(clock.clone(), Box::new(driver));
        let data = Arc::new(DataStore::new());
        module.data = Some(data.clone());
        let cfg = Arc::new(ConfigStore::new(Box::new(MemBackend::new())));
        cfg.register(VarDef {
            module: "wifi",
            name: "ssid",
            key: "wifi_ssid",
            persistent: false,
            value: ConfigValue::text("home", 31),
        })
        .unwrap();
        cfg.register(VarDef {
            module: "wifi",
            name: "enabled",
            key: "wifi_en",
            persistent: false,
            value: ConfigValue::Bool(true),
        })
        .unwrap();
        module.cfg = Some(cfg);
        module.refresh_credentials();
        (module, data, clock)
    }

    #[test]
    fn link_up_publishes_ready_and_ip() {
        let (mut module, data, _clock) = module_with(SimWifiDriver::new(1));
        module.run_once();
        let rt = data.read();
        assert!(rt.wifi.ready);
        assert_eq!(rt.wifi.ip, [192, 168, 1, 50]);
    }

    #[test]
    fn retries_are_spaced() {
        let (mut module, data, clock) = module_with(SimWifiDriver::new(3));
        module.run_once(); // attempt 1 fails
        assert!(!data.read().wifi.ready);

        // Within the retry window nothing happens.
        clock.advance_ms(1_000);
        module.run_once();
        clock.advance_ms(RETRY_PERIOD_MS);
        module.run_once(); // attempt 2
        assert!(!data.read().wifi.ready);

        clock.advance_ms(RETRY_PERIOD_MS);
        module.run_once(); // attempt 3 connects
        assert!(data.read().wifi.ready);
    }

    #[test]
    fn disabled_module_keeps_link_down() {
        let (mut module, data, _clock) = module_with(SimWifiDriver::new(1));
        module.enabled = false;
        module.run_once();
        assert!(!data.read().wifi.ready);
    }

    #[test]
    fn empty_ssid_never_connects() {
        let (mut module, data, _clock) = module_with(SimWifiDriver::new(1));
        module.ssid.clear();
        module.run_once();
        assert!(!data.read().wifi.ready);
    }
}
