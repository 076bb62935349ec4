//! IO endpoint module.
//!
//! Owns the bounded endpoint table (24 slots) over a mutex-protected
//! bus adapter. Inputs and analog channels are polled on a configurable
//! period and mirrored into the data store's IO key range; digital
//! output writes go through the [`IoService`] and emit `RelayChanged`
//! on every effective edge.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use anyhow::Result;
use log::{info, warn};
use serde_json::Value as Json;

use crate::adapters::clock::Clock;
use crate::core::bus::EventBus;
use crate::core::command::{CmdReply, CommandRequest};
use crate::core::config::{ConfigStore, ConfigValue, VarDef};
use crate::core::data::{DataStore, IO_ENDPOINT_COUNT};
use crate::core::events::{EventId, RelayChangedPayload};
use crate::core::module::{Module, TaskSpec};
use crate::core::services::{IoService, Service, ServiceRegistry};
use crate::error::{ErrorCode, write_error_json};

/// Default input/analog poll period.
const DEFAULT_POLL_MS: i32 = 500;

// ── Bus adapter seam ──────────────────────────────────────────

/// Hardware access behind the endpoint table. Implementations guard
/// the underlying bus (GPIO, I²C expander, ADC) with their own mutex;
/// callers must not hold it across yields.
pub trait IoBus: Send + Sync {
    fn read_digital(&self, channel: u8) -> Option<bool>;
    fn write_digital(&self, channel: u8, on: bool) -> bool;
    fn read_analog(&self, channel: u8) -> Option<f32>;
}

/// Digital-only bus over `embedded-hal` pins. Analog channels are not
/// available on this bus; boards with ADC inputs layer a second bus.
pub struct GpioBus<O, I>
where
    O: embedded_hal::digital::OutputPin + Send,
    I: embedded_hal::digital::InputPin + Send,
{
    outputs: Mutex<Vec<(u8, O)>>,
    inputs: Mutex<Vec<(u8, I)>>,
}

impl<O, I> GpioBus<O, I>
where
    O: embedded_hal::digital::OutputPin + Send,
    I: embedded_hal::digital::InputPin + Send,
{
    pub fn new(outputs: Vec<(u8, O)>, inputs: Vec<(u8, I)>) -> Self {
        Self {
            outputs: Mutex::new(outputs),
            inputs: Mutex::new(inputs),
        }
    }
}

impl<O, I> IoBus for GpioBus<O, I>
where
    O: embedded_hal::digital::OutputPin + Send,
    I: embedded_hal::digital::InputPin + Send,
{
    fn read_digital(&self, channel: u8) -> Option<bool> {
        let mut inputs = self.inputs.lock().expect("gpio bus poisoned");
        let (_, pin) = inputs.iter_mut().find(|(ch, _)| *ch == channel)?;
        pin.is_high().ok()
    }

    fn write_digital(&self, channel: u8, on: bool) -> bool {
        let mut outputs = self.outputs.lock().expect("gpio bus poisoned");
        let Some((_, pin)) = outputs.iter_mut().find(|(ch, _)| *ch == channel) else {
            return false;
        };
        let res = if on { pin.set_high() } else { pin.set_low() };
        res.is_ok()
    }

    fn read_analog(&self, _channel: u8) -> Option<f32> {
        None
    }
}

/// In-memory bus for host runs and tests: analog and digital channel
/// values are scripted, output writes are recorded.
pub struct SimIoBus {
    digital: Mutex<std::collections::HashMap<u8, bool>>,
    analog: Mutex<std::collections::HashMap<u8, f32>>,
}

impl SimIoBus {
    pub fn new() -> Self {
        Self {
            digital: Mutex::new(std::collections::HashMap::new()),
            analog: Mutex::new(std::collections::HashMap::new()),
        }
    }

    pub fn set_digital(&self, channel: u8, on: bool) {
        self.digital.lock().expect("sim bus poisoned").insert(channel, on);
    }

    pub fn set_analog(&self, channel: u8, value: f32) {
        self.analog.lock().expect("sim bus poisoned").insert(channel, value);
    }
}

impl Default for SimIoBus {
    fn default() -> Self {
        Self::new()
    }
}

impl IoBus for SimIoBus {
    fn read_digital(&self, channel: u8) -> Option<bool> {
        self.digital.lock().expect("sim bus poisoned").get(&channel).copied()
    }

    fn write_digital(&self, channel: u8, on: bool) -> bool {
        self.digital.lock().expect("sim bus poisoned").insert(channel, on);
        true
    }

    fn read_analog(&self, channel: u8) -> Option<f32> {
        self.analog.lock().expect("sim bus poisoned").get(&channel).copied()
    }
}

// ── Endpoint table ────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    DigitalIn,
    DigitalOut,
    AnalogIn,
}

#[derive(Debug, Clone, Copy)]
struct Endpoint {
    used: bool,
    kind: EndpointKind,
    label: &'static str,
    /// Bus channel behind this endpoint.
    channel: u8,
    digital: bool,
    analog: f32,
    valid: bool,
}

impl Default for Endpoint {
    fn default() -> Self {
        Self {
            used: false,
            kind: EndpointKind::DigitalIn,
            label: "",
            channel: 0,
            digital: false,
            analog: 0.0,
            valid: false,
        }
    }
}

/// Board IO map: endpoint index, kind, label, bus channel.
///
/// Analog sensor channels sit in the low endpoints, relays start at 8,
/// digital inputs at 12; the map mirrors the controller board layout.
pub const BOARD_IO_MAP: &[(u8, EndpointKind, &str, u8)] = &[
    (0, EndpointKind::AnalogIn, "water_temp", 0),
    (1, EndpointKind::AnalogIn, "air_temp", 1),
    (2, EndpointKind::AnalogIn, "ph", 2),
    (3, EndpointKind::AnalogIn, "orp", 3),
    (8, EndpointKind::DigitalOut, "relay_pump", 8),
    (9, EndpointKind::DigitalOut, "relay_heater", 9),
    (10, EndpointKind::DigitalOut, "relay_lights", 10),
    (11, EndpointKind::DigitalOut, "relay_aux", 11),
    (12, EndpointKind::DigitalIn, "flow_switch", 12),
    (13, EndpointKind::DigitalIn, "cover_switch", 13),
];

/// Shared endpoint table behind the `io` service.
pub struct IoCore {
    bus_adapter: Arc<dyn IoBus>,
    endpoints: Mutex<[Endpoint; IO_ENDPOINT_COUNT]>,
    data: OnceLock<Arc<DataStore>>,
    bus: OnceLock<Arc<EventBus>>,
}

impl IoCore {
    pub fn new(bus_adapter: Arc<dyn IoBus>) -> Self {
        let mut endpoints: [Endpoint; IO_ENDPOINT_COUNT] = Default::default();
        for &(idx, kind, label, channel) in BOARD_IO_MAP {
            endpoints[idx as usize] = Endpoint {
                used: true,
                kind,
                label,
                channel,
                ..Endpoint::default()
            };
        }
        Self {
            bus_adapter,
            endpoints: Mutex::new(endpoints),
            data: OnceLock::new(),
            bus: OnceLock::new(),
        }
    }

    fn emit_relay_changed(&self, endpoint: u8, on: bool) {
        let Some(bus) = self.bus.get() else { return };
        let mut buf = [0u8; 2];
        let n = RelayChangedPayload {
            relay_id: endpoint,
            state: u8::from(on),
        }
        .encode(&mut buf);
        let _ = bus.post(EventId::RelayChanged, &buf[..n]);
    }

    fn mirror_to_data_store(&self, endpoint: u8, digital: bool, analog: f32) {
        if let Some(data) = self.data.get() {
            data.set_io_endpoint(endpoint, digital, analog);
        }
    }

    fn relay_mask(endpoints: &[Endpoint; IO_ENDPOINT_COUNT]) -> u32 {
        endpoints
            .iter()
            .enumerate()
            .filter(|(_, e)| e.used && e.kind == EndpointKind::DigitalOut && e.digital)
            .fold(0u32, |mask, (i, _)| mask | (1 << i))
    }

    /// Poll every input and analog endpoint once.
    pub fn poll_inputs(&self) {
        for idx in 0..IO_ENDPOINT_COUNT as u8 {
            let (kind, channel) = {
                let endpoints = self.endpoints.lock().expect("endpoint table poisoned");
                let e = &endpoints[idx as usize];
                if !e.used || e.kind == EndpointKind::DigitalOut {
                    continue;
                }
                (e.kind, e.channel)
            };

            match kind {
                EndpointKind::DigitalIn => {
                    if let Some(v) = self.bus_adapter.read_digital(channel) {
                        let changed = {
                            let mut endpoints =
                                self.endpoints.lock().expect("endpoint table poisoned");
                            let e = &mut endpoints[idx as usize];
                            let changed = !e.valid || e.digital != v;
                            e.digital = v;
                            e.valid = true;
                            changed
                        };
                        if changed {
                            self.mirror_to_data_store(idx, v, 0.0);
                        }
                    }
                }
                EndpointKind::AnalogIn => {
                    if let Some(v) = self.bus_adapter.read_analog(channel) {
                        let changed = {
                            let mut endpoints =
                                self.endpoints.lock().expect("endpoint table poisoned");
                            let e = &mut endpoints[idx as usize];
                            let changed = !e.valid || e.analog != v;
                            e.analog = v;
                            e.valid = true;
                            changed
                        };
                        if changed {
                            self.mirror_to_data_store(idx, false, v);
                        }
                    }
                }
                EndpointKind::DigitalOut => {}
            }
        }
    }
}

impl IoService for IoCore {
    fn read_digital(&self, endpoint: u8) -> Option<bool> {
        let endpoints = self.endpoints.lock().expect("endpoint table poisoned");
        let e = endpoints.get(endpoint as usize)?;
        (e.used && e.valid && e.kind != EndpointKind::AnalogIn).then_some(e.digital)
    }

    fn read_analog(&self, endpoint: u8) -> Option<f32> {
        let endpoints = self.endpoints.lock().expect("endpoint table poisoned");
        let e = endpoints.get(endpoint as usize)?;
        (e.used && e.valid && e.kind == EndpointKind::AnalogIn).then_some(e.analog)
    }

    fn write_digital(&self, endpoint: u8, on: bool) -> bool {
        let channel = {
            let endpoints = self.endpoints.lock().expect("endpoint table poisoned");
            let Some(e) = endpoints.get(endpoint as usize) else {
                return false;
            };
            if !e.used || e.kind != EndpointKind::DigitalOut {
                return false;
            }
            if e.valid && e.digital == on {
                return true; // already in the requested state
            }
            e.channel
        };

        if !self.bus_adapter.write_digital(channel, on) {
            warn!("relay write failed endpoint={} channel={}", endpoint, channel);
            return false;
        }

        let mask = {
            let mut endpoints = self.endpoints.lock().expect("endpoint table poisoned");
            let e = &mut endpoints[endpoint as usize];
            e.digital = on;
            e.valid = true;
            Self::relay_mask(&endpoints)
        };

        info!("relay endpoint={} -> {}", endpoint, if on { "on" } else { "off" });
        self.mirror_to_data_store(endpoint, on, 0.0);
        if let Some(data) = self.data.get() {
            data.set_relay_mask(mask);
        }
        self.emit_relay_changed(endpoint, on);
        true
    }
}

// ── Module ────────────────────────────────────────────────────

/// Active module polling inputs and exposing the endpoint service.
pub struct IoModule {
    core: Arc<IoCore>,
    clock: Arc<dyn Clock>,
    poll_ms: AtomicI32,
    last_poll_ms: u64,
}

impl IoModule {
    pub fn new(clock: Arc<dyn Clock>, bus_adapter: Arc<dyn IoBus>) -> Self {
        Self {
            core: Arc::new(IoCore::new(bus_adapter)),
            clock,
            poll_ms: AtomicI32::new(DEFAULT_POLL_MS),
            last_poll_ms: 0,
        }
    }

    pub fn core(&self) -> Arc<IoCore> {
        self.core.clone()
    }
}

impl Module for IoModule {
    fn id(&self) -> &'static str {
        "io"
    }

    fn dependencies(&self) -> &'static [&'static str] {
        &["loghub", "datastore", "eventbus", "cmd"]
    }

    fn init(&mut self, cfg: &Arc<ConfigStore>, services: &mut ServiceRegistry) -> Result<()> {
        if let Err(e) = cfg.register(VarDef {
            module: "io",
            name: "poll_ms",
            key: "io_poll",
            persistent: true,
            value: ConfigValue::I32(DEFAULT_POLL_MS),
        }) {
            warn!("io config registration failed: {:?}", e);
        }

        if let Some(data) = services.data("datastore") {
            let _ = self.core.data.set(data);
        }
        if let Some(bus) = services.event_bus("eventbus") {
            let _ = self.core.bus.set(bus);
        }

        if let Some(cmd) = services.command("cmd") {
            let core = self.core.clone();
            cmd.register(
                "io.read",
                Arc::new(move |req: &CommandRequest<'_>, reply: &mut CmdReply| {
                    use core::fmt::Write as _;
                    let Some(endpoint) = req
                        .params()
                        .and_then(|p| p.get("endpoint"))
                        .and_then(Json::as_u64)
                    else {
                        write_error_json(reply, ErrorCode::MissingArgs, "io.read");
                        return false;
                    };
                    if endpoint >= IO_ENDPOINT_COUNT as u64 {
                        write_error_json(reply, ErrorCode::BadSlot, "io.read");
                        return false;
                    }
                    let idx = endpoint as u8;
                    if let Some(v) = core.read_analog(idx) {
                        let _ = write!(
                            reply,
                            "{{\"ok\":true,\"endpoint\":{},\"analog\":{:.3}}}",
                            idx, v
                        );
                        return true;
                    }
                    if let Some(v) = core.read_digital(idx) {
                        let _ = write!(
                            reply,
                            "{{\"ok\":true,\"endpoint\":{},\"digital\":{}}}",
                            idx, v
                        );
                        return true;
                    }
                    write_error_json(reply, ErrorCode::NotReady, "io.read");
                    false
                }),
            );

            let core = self.core.clone();
            cmd.register(
                "io.write",
                Arc::new(move |req: &CommandRequest<'_>, reply: &mut CmdReply| {
                    use core::fmt::Write as _;
                    let Some(params) = req.params() else {
                        write_error_json(reply, ErrorCode::MissingArgs, "io.write");
                        return false;
                    };
                    let (Some(endpoint), Some(on)) = (
                        params.get("endpoint").and_then(Json::as_u64),
                        params.get("on").and_then(Json::as_bool),
                    ) else {
                        write_error_json(reply, ErrorCode::MissingValue, "io.write");
                        return false;
                    };
                    if endpoint >= IO_ENDPOINT_COUNT as u64 {
                        write_error_json(reply, ErrorCode::BadSlot, "io.write");
                        return false;
                    }
                    if !core.write_digital(endpoint as u8, on) {
                        write_error_json(reply, ErrorCode::IoError, "io.write");
                        return false;
                    }
                    let _ = write!(reply, "{{\"ok\":true,\"endpoint\":{},\"on\":{}}}", endpoint, on);
                    true
                }),
            );
        }

        let svc: Arc<dyn IoService> = self.core.clone();
        services.add("io", Service::Io(svc));
        info!("io service registered ({} mapped endpoints)", BOARD_IO_MAP.len());
        Ok(())
    }

    fn on_config_loaded(&mut self, cfg: &Arc<ConfigStore>, _services: &ServiceRegistry) {
        if let Some(v) = cfg.get_i32("io", "poll_ms") {
            self.poll_ms.store(v.clamp(50, 60_000), Ordering::Relaxed);
        }
    }

    fn run_once(&mut self) {
        let now = self.clock.monotonic_ms();
        let period = self.poll_ms.load(Ordering::Relaxed) as u64;
        if now.saturating_sub(self.last_poll_ms) < period {
            return;
        }
        self.last_poll_ms = now;
        self.core.poll_inputs();
    }

    fn task_spec(&self) -> TaskSpec {
        TaskSpec {
            stack_size: 4096,
            priority: 2,
            core: Some(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::bus::EventView;
    use std::sync::Mutex as StdMutex;

    fn fixture() -> (Arc<IoCore>, Arc<SimIoBus>, Arc<EventBus>) {
        let sim = Arc::new(SimIoBus::new());
        let core = Arc::new(IoCore::new(sim.clone()));
        let bus = Arc::new(EventBus::new());
        let _ = core.bus.set(bus.clone());
        (core, sim, bus)
    }

    #[test]
    fn write_digital_emits_relay_changed_on_edge() {
        let (core, _sim, bus) = fixture();
        let relays: Arc<StdMutex<Vec<RelayChangedPayload>>> = Arc::new(StdMutex::new(Vec::new()));
        let relays2 = relays.clone();
        bus.subscribe(
            EventId::RelayChanged,
            Arc::new(move |e: &EventView<'_>| {
                relays2
                    .lock()
                    .unwrap()
                    .push(RelayChangedPayload::decode(e.payload).unwrap());
            }),
        );

        assert!(core.write_digital(8, true));
        assert!(core.write_digital(8, true)); // no edge
        assert!(core.write_digital(8, false));
        bus.dispatch(8);

        let seen = relays.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].relay_id, 8);
        assert_eq!(seen[0].state, 1);
        assert_eq!(seen[1].state, 0);
    }

    #[test]
    fn write_rejected_for_inputs_and_unmapped() {
        let (core, _sim, _bus) = fixture();
        assert!(!core.write_digital(0, true)); // analog endpoint
        assert!(!core.write_digital(12, true)); // digital input
        assert!(!core.write_digital(20, true)); // unmapped
    }

    #[test]
    fn poll_reads_inputs_and_analogs() {
        let (core, sim, _bus) = fixture();
        sim.set_digital(12, true);
        sim.set_analog(0, 27.5);
        core.poll_inputs();

        assert_eq!(core.read_digital(12), Some(true));
        assert_eq!(core.read_analog(0), Some(27.5));
        // Unpolled channel stays invalid.
        assert_eq!(core.read_analog(2), None);
    }

    #[test]
    fn reads_respect_endpoint_kind() {
        let (core, sim, _bus) = fixture();
        sim.set_analog(0, 1.0);
        core.poll_inputs();
        assert!(core.read_digital(0).is_none());
        assert!(core.write_digital(8, true));
        assert_eq!(core.read_digital(8), Some(true));
        assert!(core.read_analog(8).is_none());
    }
}
