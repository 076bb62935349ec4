//! Runtime data store: typed model, dirty mask, change notifications.
//!
//! The store owns the [`RuntimeData`] root by value. Reads copy the
//! whole root (every field is trivially copyable); mutation goes only
//! through the typed helpers, which compare the incoming value against
//! the current slot, write on difference, set the coarse dirty bit, and
//! publish `DataChanged{key}` followed by `DataSnapshotAvailable{mask}`
//! on the injected event bus. Without a bus the store is a pure value
//! holder.
//!
//! NaN never compares equal to the stored value, so a NaN write always
//! counts as a change and always emits.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use super::bus::EventBus;
use super::events::{
    DataChangedPayload, DataKey, DataSnapshotPayload, EventId, dirty,
};

// ── Key space ─────────────────────────────────────────────────

/// Central registry and reserved ranges for data keys.
pub mod keys {
    use super::DataKey;

    /// WiFi connectivity ready state.
    pub const WIFI_READY: DataKey = 1;
    /// WiFi IPv4 address.
    pub const WIFI_IP: DataKey = 2;
    /// Wall-clock synchronized state.
    pub const TIME_READY: DataKey = 3;
    /// MQTT broker connected state.
    pub const MQTT_READY: DataKey = 4;
    /// MQTT dropped RX messages counter.
    pub const MQTT_RX_DROP: DataKey = 5;

    /// Home Assistant autoconfig publish state.
    pub const HA_PUBLISHED: DataKey = 10;

    /// Latest sensor acquisition timestamp.
    pub const SENSORS_UPDATED: DataKey = 20;

    /// Actuator relay mask.
    pub const RELAY_MASK: DataKey = 30;

    /// Reserved base for IO endpoint keys.
    pub const IO_BASE: DataKey = 40;
    /// Reserved IO key count: endpoints `[0..24)`.
    pub const IO_RESERVED_COUNT: u8 = 24;
    /// End-exclusive bound for the IO key range.
    pub const IO_END_EXCLUSIVE: DataKey = IO_BASE + IO_RESERVED_COUNT as DataKey;

    /// Reserved base for pool device keys.
    pub const POOL_DEVICE_BASE: DataKey = 80;
    /// Reserved pool-device key count: slots `[0..8)`.
    pub const POOL_DEVICE_RESERVED_COUNT: u8 = 8;
    /// End-exclusive bound for the pool-device key range.
    pub const POOL_DEVICE_END_EXCLUSIVE: DataKey =
        POOL_DEVICE_BASE + POOL_DEVICE_RESERVED_COUNT as DataKey;

    /// Upper bound for currently reserved keys.
    pub const RESERVED_MAX: DataKey = 127;

    /// Key for IO endpoint `idx`.
    pub const fn io(idx: u8) -> DataKey {
        IO_BASE + idx as DataKey
    }

    /// Key for pool device slot `idx`.
    pub const fn pool_device(idx: u8) -> DataKey {
        POOL_DEVICE_BASE + idx as DataKey
    }

    const _: () = assert!(WIFI_READY < TIME_READY, "key ordering invariant broken");
    const _: () = assert!(MQTT_RX_DROP < HA_PUBLISHED, "key ranges overlap");
    const _: () = assert!(RELAY_MASK < IO_BASE, "fixed keys overlap IO range");
    const _: () = assert!(IO_END_EXCLUSIVE <= POOL_DEVICE_BASE, "IO and pool ranges overlap");
    const _: () = assert!(POOL_DEVICE_END_EXCLUSIVE <= RESERVED_MAX, "pool range exceeds reserved max");
}

// ── Model ─────────────────────────────────────────────────────

pub const IO_ENDPOINT_COUNT: usize = keys::IO_RESERVED_COUNT as usize;
pub const POOL_DEVICE_COUNT: usize = keys::POOL_DEVICE_RESERVED_COUNT as usize;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct WifiRuntime {
    pub ready: bool,
    pub ip: [u8; 4],
    pub rssi_dbm: i8,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TimeRuntime {
    pub time_ready: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MqttRuntime {
    pub connected: bool,
    pub rx_dropped: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct HaRuntime {
    pub published: bool,
}

/// One IO endpoint's latest value. `digital` for inputs/outputs,
/// `analog` for measured channels.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct IoEndpointRuntime {
    pub valid: bool,
    pub digital: bool,
    pub analog: f32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PoolDeviceRuntime {
    pub running: bool,
    pub mode: u8,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ActuatorsRuntime {
    pub relay_mask: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SensorsRuntime {
    pub water_temp_c: f32,
    pub air_temp_c: f32,
    pub ph: f32,
    pub orp_mv: f32,
    pub last_update_ms: u32,
}

/// Root runtime data model. One sub-record per domain.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RuntimeData {
    pub wifi: WifiRuntime,
    pub time: TimeRuntime,
    pub mqtt: MqttRuntime,
    pub ha: HaRuntime,
    pub io: [IoEndpointRuntime; IO_ENDPOINT_COUNT],
    pub pool: [PoolDeviceRuntime; POOL_DEVICE_COUNT],
    pub actuators: ActuatorsRuntime,
    pub sensors: SensorsRuntime,
}

// ── Store ─────────────────────────────────────────────────────

/// Stores runtime data and publishes changes on the event bus.
pub struct DataStore {
    rt: Mutex<RuntimeData>,
    dirty: AtomicU32,
    bus: OnceLock<Arc<EventBus>>,
}

/// Float change guard: NaN is different from everything, including NaN.
fn float_changed(cur: f32, new: f32) -> bool {
    !(new == cur)
}

impl DataStore {
    pub fn new() -> Self {
        Self {
            rt: Mutex::new(RuntimeData::default()),
            dirty: AtomicU32::new(dirty::NONE),
            bus: OnceLock::new(),
        }
    }

    /// Inject the event bus for change notifications.
    pub fn set_event_bus(&self, bus: Arc<EventBus>) {
        let _ = self.bus.set(bus);
    }

    /// Copy of the full runtime model.
    pub fn read(&self) -> RuntimeData {
        *self.rt.lock().expect("data root poisoned")
    }

    /// Current dirty flags.
    pub fn dirty_flags(&self) -> u32 {
        self.dirty.load(Ordering::Relaxed)
    }

    /// Atomically read and clear the dirty flags.
    pub fn consume_dirty(&self) -> u32 {
        self.dirty.swap(dirty::NONE, Ordering::AcqRel)
    }

    /// Mark a change: accumulate the dirty mask, then publish the
    /// change key and the snapshot summary.
    pub fn notify_changed(&self, key: DataKey, dirty_mask: u32) {
        self.dirty.fetch_or(dirty_mask, Ordering::AcqRel);
        self.publish_changed(key);
        self.publish_snapshot();
    }

    fn publish_changed(&self, key: DataKey) {
        let Some(bus) = self.bus.get() else { return };
        let mut buf = [0u8; 2];
        let n = DataChangedPayload { key }.encode(&mut buf);
        let _ = bus.post(EventId::DataChanged, &buf[..n]);
    }

    fn publish_snapshot(&self) {
        let Some(bus) = self.bus.get() else { return };
        let mut buf = [0u8; 4];
        let n = DataSnapshotPayload {
            dirty_flags: self.dirty.load(Ordering::Relaxed),
        }
        .encode(&mut buf);
        let _ = bus.post(EventId::DataSnapshotAvailable, &buf[..n]);
    }

    // ── Typed setters ─────────────────────────────────────────

    pub fn set_wifi_ready(&self, ready: bool) {
        let changed = {
            let mut rt = self.rt.lock().expect("data root poisoned");
            if rt.wifi.ready == ready {
                false
            } else {
                rt.wifi.ready = ready;
                true
            }
        };
        if changed {
            self.notify_changed(keys::WIFI_READY, dirty::NETWORK);
        }
    }

    pub fn set_wifi_ip(&self, ip: [u8; 4]) {
        let changed = {
            let mut rt = self.rt.lock().expect("data root poisoned");
            if rt.wifi.ip == ip {
                false
            } else {
                rt.wifi.ip = ip;
                true
            }
        };
        if changed {
            self.notify_changed(keys::WIFI_IP, dirty::NETWORK);
        }
    }

    pub fn set_time_ready(&self, ready: bool) {
        let changed = {
            let mut rt = self.rt.lock().expect("data root poisoned");
            if rt.time.time_ready == ready {
                false
            } else {
                rt.time.time_ready = ready;
                true
            }
        };
        if changed {
            self.notify_changed(keys::TIME_READY, dirty::TIME);
        }
    }

    pub fn set_mqtt_connected(&self, connected: bool) {
        let changed = {
            let mut rt = self.rt.lock().expect("data root poisoned");
            if rt.mqtt.connected == connected {
                false
            } else {
                rt.mqtt.connected = connected;
                true
            }
        };
        if changed {
            self.notify_changed(keys::MQTT_READY, dirty::MQTT);
        }
    }

    pub fn set_io_endpoint(&self, idx: u8, digital: bool, analog: f32) {
        if idx as usize >= IO_ENDPOINT_COUNT {
            return;
        }
        let changed = {
            let mut rt = self.rt.lock().expect("data root poisoned");
            let ep = &mut rt.io[idx as usize];
            let differs =
                !ep.valid || ep.digital != digital || float_changed(ep.analog, analog);
            if differs {
                *ep = IoEndpointRuntime {
                    valid: true,
                    digital,
                    analog,
                };
            }
            differs
        };
        if changed {
            self.notify_changed(keys::io(idx), dirty::IO);
        }
    }

    pub fn set_pool_device(&self, idx: u8, running: bool, mode: u8) {
        if idx as usize >= POOL_DEVICE_COUNT {
            return;
        }
        let changed = {
            let mut rt = self.rt.lock().expect("data root poisoned");
            let dev = &mut rt.pool[idx as usize];
            if dev.running == running && dev.mode == mode {
                false
            } else {
                *dev = PoolDeviceRuntime { running, mode };
                true
            }
        };
        if changed {
            self.notify_changed(keys::pool_device(idx), dirty::POOL);
        }
    }

    pub fn set_relay_mask(&self, mask: u32) {
        let changed = {
            let mut rt = self.rt.lock().expect("data root poisoned");
            if rt.actuators.relay_mask == mask {
                false
            } else {
                rt.actuators.relay_mask = mask;
                true
            }
        };
        if changed {
            self.notify_changed(keys::RELAY_MASK, dirty::IO);
        }
    }

    pub fn set_sensors(&self, sensors: SensorsRuntime) {
        let changed = {
            let mut rt = self.rt.lock().expect("data root poisoned");
            let cur = &rt.sensors;
            let differs = float_changed(cur.water_temp_c, sensors.water_temp_c)
                || float_changed(cur.air_temp_c, sensors.air_temp_c)
                || float_changed(cur.ph, sensors.ph)
                || float_changed(cur.orp_mv, sensors.orp_mv)
                || cur.last_update_ms != sensors.last_update_ms;
            if differs {
                rt.sensors = sensors;
            }
            differs
        };
        if changed {
            self.notify_changed(keys::SENSORS_UPDATED, dirty::SENSORS);
        }
    }
}

impl Default for DataStore {
    fn default() -> Self {
        Self::new()
    }
}
