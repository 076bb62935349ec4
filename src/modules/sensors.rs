//! Sensor acquisition module.
//!
//! Periodically samples the analog endpoints (water/air temperature,
//! pH, ORP), publishes the readings into the data store, and posts a
//! `SensorsUpdated` event carrying the acquisition timestamp.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use anyhow::Result;
use log::warn;

use crate::adapters::clock::Clock;
use crate::core::bus::EventBus;
use crate::core::config::{ConfigStore, ConfigValue, VarDef};
use crate::core::data::{DataStore, SensorsRuntime};
use crate::core::events::{EventId, SensorsUpdatedPayload};
use crate::core::module::{Module, TaskSpec};
use crate::core::services::{IoService, ServiceRegistry};

/// Default acquisition period.
const DEFAULT_POLL_MS: i32 = 2_000;

/// Analog endpoint assignments (see the board IO map).
const EP_WATER_TEMP: u8 = 0;
const EP_AIR_TEMP: u8 = 1;
const EP_PH: u8 = 2;
const EP_ORP: u8 = 3;

pub struct SensorsModule {
    clock: Arc<dyn Clock>,
    io: Option<Arc<dyn IoService>>,
    data: Option<Arc<DataStore>>,
    bus: Option<Arc<EventBus>>,
    poll_ms: AtomicI32,
    last_poll_ms: u64,
}

impl SensorsModule {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            io: None,
            data: None,
            bus: None,
            poll_ms: AtomicI32::new(DEFAULT_POLL_MS),
            last_poll_ms: 0,
        }
    }

    fn acquire(&self) {
        let Some(io) = &self.io else { return };
        let now_ms = self.clock.monotonic_ms();

        // Missing channels read as NaN so consumers can tell "no probe"
        // from a real zero.
        let read = |ep: u8| io.read_analog(ep).unwrap_or(f32::NAN);
        let sample = SensorsRuntime {
            water_temp_c: read(EP_WATER_TEMP),
            air_temp_c: read(EP_AIR_TEMP),
            ph: read(EP_PH),
            orp_mv: read(EP_ORP),
            last_update_ms: now_ms as u32,
        };

        if let Some(data) = &self.data {
            data.set_sensors(sample);
        }
        if let Some(bus) = &self.bus {
            let mut buf = [0u8; 4];
            let n = SensorsUpdatedPayload {
                ts_ms: now_ms as u32,
            }
            .encode(&mut buf);
            let _ = bus.post(EventId::SensorsUpdated, &buf[..n]);
        }
    }
}

impl Module for SensorsModule {
    fn id(&self) -> &'static str {
        "sensors"
    }

    fn dependencies(&self) -> &'static [&'static str] {
        &["loghub", "io", "datastore", "eventbus"]
    }

    fn init(&mut self, cfg: &Arc<ConfigStore>, services: &mut ServiceRegistry) -> Result<()> {
        if let Err(e) = cfg.register(VarDef {
            module: "sensors",
            name: "poll_ms",
            key: "sn_poll",
            persistent: true,
            value: ConfigValue::I32(DEFAULT_POLL_MS),
        }) {
            warn!("sensors config registration failed: {:?}", e);
        }

        self.io = services.io("io");
        self.data = services.data("datastore");
        self.bus = services.event_bus("eventbus");
        Ok(())
    }

    fn on_config_loaded(&mut self, cfg: &Arc<ConfigStore>, _services: &ServiceRegistry) {
        if let Some(v) = cfg.get_i32("sensors", "poll_ms") {
            self.poll_ms.store(v.clamp(100, 600_000), Ordering::Relaxed);
        }
    }

    fn run_once(&mut self) {
        let now = self.clock.monotonic_ms();
        let period = self.poll_ms.load(Ordering::Relaxed) as u64;
        if now.saturating_sub(self.last_poll_ms) < period {
            return;
        }
        self.last_poll_ms = now;
        self.acquire();
    }

    fn task_spec(&self) -> TaskSpec {
        TaskSpec {
            stack_size: 4096,
            priority: 1,
            core: Some(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::clock::SimClock;
    use crate::core::bus::EventView;
    use crate::modules::io::{IoCore, SimIoBus};
    use std::sync::Mutex as StdMutex;

    #[test]
    fn acquisition_publishes_store_and_event() {
        let clock = Arc::new(SimClock::new());
        clock.advance_ms(5_000);

        let sim = Arc::new(SimIoBus::new());
        sim.set_analog(0, 27.5);
        sim.set_analog(1, 19.0);
        sim.set_analog(2, 7.2);
        sim.set_analog(3, 650.0);
        let io_core = Arc::new(IoCore::new(sim));
        io_core.poll_inputs();

        let data = Arc::new(DataStore::new());
        let bus = Arc::new(EventBus::new());
        let seen: Arc<StdMutex<Vec<u32>>> = Arc::new(StdMutex::new(Vec::new()));
        let seen2 = seen.clone();
        bus.subscribe(
            EventId::SensorsUpdated,
            Arc::new(move |e: &EventView<'_>| {
                seen2
                    .lock()
                    .unwrap()
                    .push(SensorsUpdatedPayload::decode(e.payload).unwrap().ts_ms);
            }),
        );

        let mut module = SensorsModule::new(clock.clone());
        module.io = Some(io_core);
        module.data = Some(data.clone());
        module.bus = Some(bus.clone());

        module.acquire();
        bus.dispatch(8);

        let rt = data.read();
        assert_eq!(rt.sensors.water_temp_c, 27.5);
        assert_eq!(rt.sensors.ph, 7.2);
        assert_eq!(*seen.lock().unwrap(), vec![5_000]);
    }

    #[test]
    fn missing_probe_reads_nan() {
        let clock = Arc::new(SimClock::new());
        let io_core = Arc::new(IoCore::new(Arc::new(SimIoBus::new())));
        let data = Arc::new(DataStore::new());

        let mut module = SensorsModule::new(clock);
        module.io = Some(io_core);
        module.data = Some(data.clone());
        module.acquire();

        assert!(data.read().sensors.water_temp_c.is_nan());
    }
}
