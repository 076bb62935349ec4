//! Pool device module.
//!
//! Owns the pool device slots (pump, heater, lights, aux) on top of the
//! IO endpoint service and enforces the interlock rules: a device with
//! an upstream dependency refuses to start, and is stopped, unless the
//! upstream device runs. Devices in `Auto` follow scheduler edges whose
//! event id matches their configured schedule event.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use anyhow::Result;
use log::{info, warn};
use serde_json::Value as Json;

use crate::core::bus::{EventBus, EventView};
use crate::core::command::{CmdReply, CommandRequest};
use crate::core::config::{ConfigStore, ConfigValue, VarDef};
use crate::core::data::{DataStore, POOL_DEVICE_COUNT};
use crate::core::events::{
    EventId, PoolModeChangedPayload, SchedulerEdge, SchedulerEventPayload,
};
use crate::core::module::{Module, TaskSpec};
use crate::core::services::{
    AlarmCondState, AlarmRegistration, AlarmService, AlarmSeverity, IoService, Service,
    ServiceRegistry,
};
use crate::error::{ErrorCode, write_error_json, write_error_json_slot};

/// Alarm id for the heater-without-flow condition.
const ALARM_HEATER_NO_FLOW: u16 = 0x0301;

/// Per-device operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DeviceMode {
    Off = 0,
    On = 1,
    /// Follows scheduler edges for the device's schedule event.
    Auto = 2,
}

impl DeviceMode {
    fn from_str(s: &str) -> Option<Self> {
        match s {
            "off" => Some(Self::Off),
            "on" => Some(Self::On),
            "auto" => Some(Self::Auto),
            _ => None,
        }
    }

    const fn as_str(self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::On => "on",
            Self::Auto => "auto",
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct PoolDevice {
    used: bool,
    name: &'static str,
    /// IO endpoint driving this device's relay.
    endpoint: u8,
    /// Device slot that must run before this one may.
    interlock: Option<u8>,
    /// Scheduler event id this device follows in `Auto`.
    sched_event_id: u16,
    mode: DeviceMode,
    running: bool,
}

impl Default for PoolDevice {
    fn default() -> Self {
        Self {
            used: false,
            name: "",
            endpoint: 0,
            interlock: None,
            sched_event_id: 0,
            mode: DeviceMode::Off,
            running: false,
        }
    }
}

/// Device slot map: slot, name, relay endpoint, interlock slot,
/// default schedule event id.
const DEVICE_MAP: &[(u8, &str, u8, Option<u8>, u16)] = &[
    (0, "filtration", 8, None, 2001),
    (1, "heater", 9, Some(0), 2002),
    (2, "lights", 10, None, 2003),
    (3, "aux", 11, None, 0),
];

/// Shared device table.
pub struct PoolCore {
    devices: Mutex<[PoolDevice; POOL_DEVICE_COUNT]>,
    mode: AtomicU8,
    io: OnceLock<Arc<dyn IoService>>,
    data: OnceLock<Arc<DataStore>>,
    bus: OnceLock<Arc<EventBus>>,
}

impl PoolCore {
    fn new() -> Self {
        let mut devices: [PoolDevice; POOL_DEVICE_COUNT] = Default::default();
        for &(slot, name, endpoint, interlock, sched_event_id) in DEVICE_MAP {
            devices[slot as usize] = PoolDevice {
                used: true,
                name,
                endpoint,
                interlock,
                sched_event_id,
                ..PoolDevice::default()
            };
        }
        Self {
            devices: Mutex::new(devices),
            mode: AtomicU8::new(0),
            io: OnceLock::new(),
            data: OnceLock::new(),
            bus: OnceLock::new(),
        }
    }

    fn publish_device(&self, slot: u8, running: bool, mode: DeviceMode) {
        if let Some(data) = self.data.get() {
            data.set_pool_device(slot, running, mode as u8);
        }
    }

    /// Try to start or stop a device. Checks the interlock on start and
    /// drives the relay endpoint. Returns the error code on refusal.
    fn drive(&self, slot: u8, on: bool) -> Result<(), ErrorCode> {
        let (endpoint, interlock, name) = {
            let devices = self.devices.lock().expect("device table poisoned");
            let Some(d) = devices.get(slot as usize).filter(|d| d.used) else {
                return Err(ErrorCode::UnknownSlot);
            };
            if d.running == on {
                return Ok(());
            }
            (d.endpoint, d.interlock, d.name)
        };

        if on {
            if let Some(upstream) = interlock {
                let upstream_running = {
                    let devices = self.devices.lock().expect("device table poisoned");
                    devices
                        .get(upstream as usize)
                        .is_some_and(|d| d.used && d.running)
                };
                if !upstream_running {
                    warn!("interlock blocks {}: upstream slot {} idle", name, upstream);
                    return Err(ErrorCode::InterlockBlocked);
                }
            }
        }

        let Some(io) = self.io.get() else {
            return Err(ErrorCode::NotReady);
        };
        if !io.write_digital(endpoint, on) {
            return Err(ErrorCode::IoError);
        }

        let mode = {
            let mut devices = self.devices.lock().expect("device table poisoned");
            let d = &mut devices[slot as usize];
            d.running = on;
            d.mode
        };
        info!("pool device {} -> {}", name, if on { "on" } else { "off" });
        self.publish_device(slot, on, mode);
        Ok(())
    }

    fn set_device_mode(&self, slot: u8, mode: DeviceMode) -> Result<(), ErrorCode> {
        {
            let mut devices = self.devices.lock().expect("device table poisoned");
            let Some(d) = devices.get_mut(slot as usize).filter(|d| d.used) else {
                return Err(ErrorCode::UnknownSlot);
            };
            d.mode = mode;
        }
        match mode {
            DeviceMode::On => self.drive(slot, true),
            DeviceMode::Off => self.drive(slot, false),
            DeviceMode::Auto => {
                let (running, mode_now) = {
                    let devices = self.devices.lock().expect("device table poisoned");
                    let d = &devices[slot as usize];
                    (d.running, d.mode)
                };
                self.publish_device(slot, running, mode_now);
                Ok(())
            }
        }
    }

    /// Stop every device whose interlock dependency stopped running.
    fn enforce_interlocks(&self) {
        let victims: Vec<u8> = {
            let devices = self.devices.lock().expect("device table poisoned");
            devices
                .iter()
                .enumerate()
                .filter(|(_, d)| {
                    d.used
                        && d.running
                        && d.interlock.is_some_and(|up| {
                            !devices
                                .get(up as usize)
                                .is_some_and(|u| u.used && u.running)
                        })
                })
                .map(|(i, _)| i as u8)
                .collect()
        };
        for slot in victims {
            warn!("interlock trip: stopping slot {}", slot);
            let _ = self.drive(slot, false);
        }
    }

    fn on_scheduler_event(&self, payload: &[u8]) {
        let Some(p) = SchedulerEventPayload::decode(payload) else {
            return;
        };
        let slots: Vec<u8> = {
            let devices = self.devices.lock().expect("device table poisoned");
            devices
                .iter()
                .enumerate()
                .filter(|(_, d)| {
                    d.used
                        && d.mode == DeviceMode::Auto
                        && d.sched_event_id != 0
                        && d.sched_event_id == p.event_id
                })
                .map(|(i, _)| i as u8)
                .collect()
        };
        for slot in slots {
            let on = match p.edge {
                SchedulerEdge::Start | SchedulerEdge::Trigger => true,
                SchedulerEdge::Stop => false,
            };
            if let Err(e) = self.drive(slot, on) {
                warn!("schedule drive failed slot={}: {}", slot, e.as_str());
            }
        }
    }

    fn set_pool_mode(&self, mode: u8) {
        if self.mode.swap(mode, Ordering::Relaxed) == mode {
            return;
        }
        if let Some(bus) = self.bus.get() {
            let mut buf = [0u8; 1];
            let n = PoolModeChangedPayload { mode }.encode(&mut buf);
            let _ = bus.post(EventId::PoolModeChanged, &buf[..n]);
        }
    }

    fn device_snapshot(&self, slot: u8) -> Option<PoolDevice> {
        let devices = self.devices.lock().expect("device table poisoned");
        devices.get(slot as usize).filter(|d| d.used).copied()
    }
}

/// Active module wiring commands, scheduler edges, and the interlock
/// alarm.
pub struct PoolDeviceModule {
    core: Arc<PoolCore>,
}

impl PoolDeviceModule {
    pub fn new() -> Self {
        Self {
            core: Arc::new(PoolCore::new()),
        }
    }

    pub fn core(&self) -> Arc<PoolCore> {
        self.core.clone()
    }
}

impl Default for PoolDeviceModule {
    fn default() -> Self {
        Self::new()
    }
}

impl Module for PoolDeviceModule {
    fn id(&self) -> &'static str {
        "pool"
    }

    fn dependencies(&self) -> &'static [&'static str] {
        &["loghub", "io", "eventbus", "cmd", "alarms"]
    }

    fn init(&mut self, cfg: &Arc<ConfigStore>, services: &mut ServiceRegistry) -> Result<()> {
        if let Err(e) = cfg.register(VarDef {
            module: "pool",
            name: "filtration_event",
            key: "pl_filt_ev",
            persistent: true,
            value: ConfigValue::I32(2001),
        }) {
            warn!("pool config registration failed: {:?}", e);
        }

        if let Some(io) = services.io("io") {
            let _ = self.core.io.set(io);
        }
        if let Some(data) = services.data("datastore") {
            let _ = self.core.data.set(data);
        }
        if let Some(bus) = services.event_bus("eventbus") {
            let core = self.core.clone();
            bus.subscribe(
                EventId::SchedulerEventTriggered,
                Arc::new(move |e: &EventView<'_>| core.on_scheduler_event(e.payload)),
            );
            let _ = self.core.bus.set(bus);
        }

        if let Some(alarms) = services.alarms("alarms") {
            let core = self.core.clone();
            let mut code = heapless::String::new();
            let _ = code.push_str("HTR_FLOW");
            let mut title = heapless::String::new();
            let _ = title.push_str("heater running without pump");
            let mut origin = heapless::String::new();
            let _ = origin.push_str("pool");
            alarms.register_alarm(
                &AlarmRegistration {
                    id: ALARM_HEATER_NO_FLOW,
                    severity: AlarmSeverity::Alarm,
                    latched: true,
                    on_delay_ms: 5_000,
                    off_delay_ms: 0,
                    code,
                    title,
                    origin,
                },
                Arc::new(move |_now_ms: u64| {
                    let heater = core.device_snapshot(1);
                    let pump = core.device_snapshot(0);
                    match (heater, pump) {
                        (Some(h), Some(p)) => {
                            if h.running && !p.running {
                                AlarmCondState::True
                            } else {
                                AlarmCondState::False
                            }
                        }
                        _ => AlarmCondState::Unknown,
                    }
                }),
            );
        }

        if let Some(cmd) = services.command("cmd") {
            let core = self.core.clone();
            cmd.register(
                "pool.device",
                Arc::new(move |req: &CommandRequest<'_>, reply: &mut CmdReply| {
                    use core::fmt::Write as _;
                    let Some(params) = req.params() else {
                        write_error_json(reply, ErrorCode::MissingArgs, "pool.device");
                        return false;
                    };
                    let Some(slot) = params.get("slot").and_then(Json::as_u64) else {
                        write_error_json(reply, ErrorCode::MissingSlot, "pool.device");
                        return false;
                    };
                    if slot >= POOL_DEVICE_COUNT as u64 {
                        write_error_json(reply, ErrorCode::BadSlot, "pool.device");
                        return false;
                    }
                    let Some(mode) = params
                        .get("mode")
                        .and_then(Json::as_str)
                        .and_then(DeviceMode::from_str)
                    else {
                        write_error_json(reply, ErrorCode::InvalidMode, "pool.device");
                        return false;
                    };
                    match core.set_device_mode(slot as u8, mode) {
                        Ok(()) => {
                            let _ = write!(
                                reply,
                                "{{\"ok\":true,\"slot\":{},\"mode\":\"{}\"}}",
                                slot,
                                mode.as_str()
                            );
                            true
                        }
                        Err(code) => {
                            write_error_json_slot(reply, code, "pool.device", slot as u8);
                            false
                        }
                    }
                }),
            );

            let core = self.core.clone();
            cmd.register(
                "pool.list",
                Arc::new(move |_req: &CommandRequest<'_>, reply: &mut CmdReply| {
                    use core::fmt::Write as _;
                    let devices = core.devices.lock().expect("device table poisoned");
                    let mut ok = reply.push_str("{\"ok\":true,\"devices\":[").is_ok();
                    let mut first = true;
                    for (i, d) in devices.iter().enumerate().filter(|(_, d)| d.used) {
                        if !first {
                            ok &= reply.push(',').is_ok();
                        }
                        first = false;
                        ok &= write!(
                            reply,
                            "{{\"slot\":{},\"name\":\"{}\",\"mode\":\"{}\",\"running\":{}}}",
                            i,
                            d.name,
                            d.mode.as_str(),
                            d.running
                        )
                        .is_ok();
                    }
                    ok &= reply.push_str("]}").is_ok();
                    ok
                }),
            );

            let core = self.core.clone();
            cmd.register(
                "pool.set_mode",
                Arc::new(move |req: &CommandRequest<'_>, reply: &mut CmdReply| {
                    use core::fmt::Write as _;
                    let Some(mode) = req
                        .params()
                        .and_then(|p| p.get("mode"))
                        .and_then(Json::as_u64)
                        .filter(|m| *m <= u8::MAX as u64)
                    else {
                        write_error_json(reply, ErrorCode::MissingValue, "pool.set_mode");
                        return false;
                    };
                    core.set_pool_mode(mode as u8);
                    let _ = write!(reply, "{{\"ok\":true,\"mode\":{}}}", mode);
                    true
                }),
            );
        }

        info!("pool devices registered ({} slots)", DEVICE_MAP.len());
        Ok(())
    }

    fn on_config_loaded(&mut self, cfg: &Arc<ConfigStore>, _services: &ServiceRegistry) {
        if let Some(ev) = cfg.get_i32("pool", "filtration_event") {
            if (0..=i32::from(u16::MAX)).contains(&ev) {
                let mut devices = self.core.devices.lock().expect("device table poisoned");
                devices[0].sched_event_id = ev as u16;
            }
        }
    }

    fn run_once(&mut self) {
        self.core.enforce_interlocks();
    }

    fn task_spec(&self) -> TaskSpec {
        TaskSpec {
            stack_size: 4096,
            priority: 1,
            core: Some(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::io::{IoCore, SimIoBus};

    fn fixture() -> (Arc<PoolCore>, Arc<EventBus>) {
        let core = Arc::new(PoolCore::new());
        let io: Arc<dyn IoService> = Arc::new(IoCore::new(Arc::new(SimIoBus::new())));
        let _ = core.io.set(io);
        let bus = Arc::new(EventBus::new());
        let _ = core.bus.set(bus.clone());
        (core, bus)
    }

    #[test]
    fn heater_blocked_without_pump() {
        let (core, _bus) = fixture();
        assert_eq!(
            core.set_device_mode(1, DeviceMode::On),
            Err(ErrorCode::InterlockBlocked)
        );
        assert!(!core.device_snapshot(1).unwrap().running);
    }

    #[test]
    fn heater_allowed_with_pump_running() {
        let (core, _bus) = fixture();
        assert!(core.set_device_mode(0, DeviceMode::On).is_ok());
        assert!(core.set_device_mode(1, DeviceMode::On).is_ok());
        assert!(core.device_snapshot(1).unwrap().running);
    }

    #[test]
    fn interlock_trip_stops_heater_when_pump_stops() {
        let (core, _bus) = fixture();
        assert!(core.set_device_mode(0, DeviceMode::On).is_ok());
        assert!(core.set_device_mode(1, DeviceMode::On).is_ok());

        assert!(core.set_device_mode(0, DeviceMode::Off).is_ok());
        core.enforce_interlocks();
        assert!(!core.device_snapshot(1).unwrap().running);
    }

    #[test]
    fn auto_device_follows_scheduler_edges() {
        let (core, _bus) = fixture();
        assert!(core.set_device_mode(0, DeviceMode::Auto).is_ok());

        let start = SchedulerEventPayload {
            slot: 5,
            edge: SchedulerEdge::Start,
            replayed: 0,
            event_id: 2001,
            active_mask: 0b10_0000,
            epoch_seconds: 1_700_000_000,
        };
        let mut buf = [0u8; SchedulerEventPayload::ENCODED_LEN];
        let n = start.encode(&mut buf);
        core.on_scheduler_event(&buf[..n]);
        assert!(core.device_snapshot(0).unwrap().running);

        let stop = SchedulerEventPayload {
            edge: SchedulerEdge::Stop,
            epoch_seconds: 1_700_003_600,
            ..start
        };
        let n = stop.encode(&mut buf);
        core.on_scheduler_event(&buf[..n]);
        assert!(!core.device_snapshot(0).unwrap().running);
    }

    #[test]
    fn manual_devices_ignore_scheduler() {
        let (core, _bus) = fixture();
        // Slot 0 stays in Off mode.
        let start = SchedulerEventPayload {
            slot: 5,
            edge: SchedulerEdge::Start,
            replayed: 0,
            event_id: 2001,
            active_mask: 0,
            epoch_seconds: 1_700_000_000,
        };
        let mut buf = [0u8; SchedulerEventPayload::ENCODED_LEN];
        let n = start.encode(&mut buf);
        core.on_scheduler_event(&buf[..n]);
        assert!(!core.device_snapshot(0).unwrap().running);
    }

    #[test]
    fn pool_mode_change_posts_once() {
        let (core, bus) = fixture();
        core.set_pool_mode(2);
        core.set_pool_mode(2);
        assert_eq!(bus.pending(), 1);
    }
}
