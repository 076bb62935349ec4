//! Central alarm registry and evaluation engine.
//!
//! Other modules register alarm descriptors with a condition evaluator
//! object; the alarm task polls every evaluator on a configurable
//! cadence (clamped 25–5000 ms) and applies on/off delays, latch and
//! ack semantics. Exactly one `AlarmRaised` is emitted per activation
//! and one `AlarmCleared` per deactivation. Condition flips emit
//! `AlarmConditionChanged`; an `Unknown` condition freezes the
//! transition timers but keeps the stable state.
//!
//! Posts and evaluations run on different tasks, so all slot access
//! happens under short critical sections that never include I/O.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use anyhow::Result;
use log::{debug, info, warn};
use serde_json::Value as Json;

use crate::adapters::clock::Clock;
use crate::core::bus::{EventBus, EventView};
use crate::core::command::{CmdReply, CommandRequest};
use crate::core::config::{ConfigStore, ConfigValue, VarDef};
use crate::core::events::{AlarmPayload, ConfigChangedPayload, EventId};
use crate::core::module::{Module, TaskSpec};
use crate::core::services::{
    AlarmCondState, AlarmCondition, AlarmRegistration, AlarmService, AlarmSeverity, Service,
    ServiceRegistry,
};
use crate::error::{ErrorCode, write_error_json};

/// Fixed number of alarm slots.
pub const MAX_ALARMS: usize = 24;

/// Default evaluation cadence.
const DEFAULT_EVAL_PERIOD_MS: i32 = 250;

fn clamp_eval_period(ms: i32) -> u64 {
    ms.clamp(25, 5000) as u64
}

#[derive(Clone)]
struct AlarmSlot {
    used: bool,
    def: AlarmRegistration,
    cond: Option<Arc<dyn AlarmCondition>>,

    active: bool,
    acked: bool,
    last_cond: AlarmCondState,
    on_since_ms: u64,
    off_since_ms: u64,
    active_since_ms: u64,
}

impl Default for AlarmSlot {
    fn default() -> Self {
        Self {
            used: false,
            def: AlarmRegistration {
                id: 0,
                severity: AlarmSeverity::Info,
                latched: false,
                on_delay_ms: 0,
                off_delay_ms: 0,
                code: heapless::String::new(),
                title: heapless::String::new(),
                origin: heapless::String::new(),
            },
            cond: None,
            active: false,
            acked: false,
            last_cond: AlarmCondState::Unknown,
            on_since_ms: 0,
            off_since_ms: 0,
            active_since_ms: 0,
        }
    }
}

/// Shared engine behind the `alarms` service.
pub struct AlarmCore {
    clock: Arc<dyn Clock>,
    slots: Mutex<[AlarmSlot; MAX_ALARMS]>,
    bus: OnceLock<Arc<EventBus>>,
    enabled: AtomicBool,
    eval_period_ms: AtomicI32,
}

fn delay_reached(since_ms: u64, delay_ms: u32, now_ms: u64) -> bool {
    if delay_ms == 0 {
        return true;
    }
    if since_ms == 0 {
        return false;
    }
    now_ms.saturating_sub(since_ms) >= u64::from(delay_ms)
}

impl AlarmCore {
    fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            slots: Mutex::new(core::array::from_fn(|_| AlarmSlot::default())),
            bus: OnceLock::new(),
            enabled: AtomicBool::new(true),
            eval_period_ms: AtomicI32::new(DEFAULT_EVAL_PERIOD_MS),
        }
    }

    fn emit(&self, event: EventId, alarm_id: u16) {
        let Some(bus) = self.bus.get() else { return };
        let mut buf = [0u8; 2];
        let n = AlarmPayload { alarm_id }.encode(&mut buf);
        let _ = bus.post(event, &buf[..n]);
    }

    fn find_slot(slots: &[AlarmSlot; MAX_ALARMS], id: u16) -> Option<usize> {
        slots.iter().position(|s| s.used && s.def.id == id)
    }

    /// Evaluate every used slot once at `now_ms`. Exposed for the task
    /// loop and for deterministic tests.
    pub fn evaluate_once(&self, now_ms: u64) {
        for i in 0..MAX_ALARMS {
            // Snapshot the evaluator outside the lock; the evaluator
            // itself may take its own locks.
            let (id, cond) = {
                let slots = self.slots.lock().expect("alarm slots poisoned");
                let s = &slots[i];
                if !s.used {
                    continue;
                }
                match &s.cond {
                    Some(c) => (s.def.id, c.clone()),
                    None => continue,
                }
            };

            let cond_now = cond.evaluate(now_ms);

            let mut post_raised = false;
            let mut post_cleared = false;
            let mut post_cond_changed = false;
            let mut code: heapless::String<12> = heapless::String::new();

            {
                let mut slots = self.slots.lock().expect("alarm slots poisoned");
                let s = &mut slots[i];
                if !s.used || s.def.id != id {
                    continue; // replaced between snapshots
                }
                let _ = code.push_str(s.def.code.as_str());

                if s.last_cond != cond_now
                    && matches!(cond_now, AlarmCondState::True | AlarmCondState::False)
                {
                    post_cond_changed = true;
                }
                s.last_cond = cond_now;

                match cond_now {
                    AlarmCondState::True => {
                        s.off_since_ms = 0;
                        if s.active {
                            s.on_since_ms = 0;
                        } else {
                            if s.on_since_ms == 0 {
                                s.on_since_ms = now_ms;
                            }
                            if delay_reached(s.on_since_ms, s.def.on_delay_ms, now_ms) {
                                s.active = true;
                                s.acked = false;
                                s.active_since_ms = now_ms;
                                s.on_since_ms = 0;
                                post_raised = true;
                            }
                        }
                    }
                    AlarmCondState::False => {
                        s.on_since_ms = 0;
                        if s.active {
                            let can_clear = !s.def.latched || s.acked;
                            if can_clear {
                                if s.off_since_ms == 0 {
                                    s.off_since_ms = now_ms;
                                }
                                if delay_reached(s.off_since_ms, s.def.off_delay_ms, now_ms) {
                                    s.active = false;
                                    s.acked = false;
                                    s.off_since_ms = 0;
                                    post_cleared = true;
                                }
                            } else {
                                s.off_since_ms = 0;
                            }
                        } else {
                            s.off_since_ms = 0;
                        }
                    }
                    AlarmCondState::Unknown => {
                        // Sensor gone: freeze timers, keep stable state.
                        s.on_since_ms = 0;
                        s.off_since_ms = 0;
                    }
                }
            }

            if post_cond_changed {
                debug!("alarm cond={} id={} code={}", cond_now.as_str(), id, code.as_str());
                self.emit(EventId::AlarmConditionChanged, id);
            }
            if post_raised {
                warn!("alarm raised id={} code={}", id, code.as_str());
                self.emit(EventId::AlarmRaised, id);
            }
            if post_cleared {
                info!("alarm cleared id={} code={}", id, code.as_str());
                self.emit(EventId::AlarmCleared, id);
            }
        }
    }

    fn on_config_changed(&self, payload: &[u8], cfg: &ConfigStore) {
        let Some(p) = ConfigChangedPayload::decode(payload) else {
            return;
        };
        match p.key_str() {
            "al_en" => {
                if let Some(v) = cfg.get_bool("alarms", "enabled") {
                    self.enabled.store(v, Ordering::Relaxed);
                }
            }
            "al_period" => {
                if let Some(v) = cfg.get_i32("alarms", "eval_period_ms") {
                    self.eval_period_ms.store(v, Ordering::Relaxed);
                }
            }
            _ => {}
        }
    }

    fn list_json(&self, reply: &mut CmdReply) -> bool {
        use core::fmt::Write as _;
        let slots = self.slots.lock().expect("alarm slots poisoned").clone();
        let active = slots.iter().filter(|s| s.used && s.active).count();

        let mut ok = write!(reply, "{{\"ok\":true,\"active\":{},\"alarms\":[", active).is_ok();
        let mut first = true;
        for s in slots.iter().filter(|s| s.used) {
            if !first {
                ok &= reply.push(',').is_ok();
            }
            first = false;
            ok &= write!(
                reply,
                "{{\"id\":{},\"code\":\"{}\",\"severity\":{},\"active\":{},\"acked\":{},\
                 \"latched\":{},\"cond\":\"{}\"}}",
                s.def.id,
                s.def.code.as_str(),
                s.def.severity as u8,
                s.active,
                s.acked,
                s.def.latched,
                s.last_cond.as_str()
            )
            .is_ok();
        }
        ok &= reply.push_str("]}").is_ok();
        if !ok {
            write_error_json(reply, ErrorCode::CfgTruncated, "alarms.list");
            return false;
        }
        true
    }
}

impl AlarmService for AlarmCore {
    fn register_alarm(&self, def: &AlarmRegistration, cond: Arc<dyn AlarmCondition>) -> bool {
        if def.id == 0 || def.code.is_empty() || def.title.is_empty() {
            return false;
        }
        let mut slots = self.slots.lock().expect("alarm slots poisoned");
        if Self::find_slot(&slots, def.id).is_some() {
            warn!("alarm registration rejected, duplicate id={}", def.id);
            return false;
        }
        let Some(free) = slots.iter().position(|s| !s.used) else {
            warn!("alarm registration rejected, table full id={}", def.id);
            return false;
        };
        slots[free] = AlarmSlot {
            used: true,
            def: def.clone(),
            cond: Some(cond),
            ..AlarmSlot::default()
        };
        info!("alarm registered id={} code={}", def.id, def.code.as_str());
        true
    }

    fn ack(&self, id: u16) -> bool {
        let now_ms = self.clock.monotonic_ms();
        let mut post_ack = false;
        let mut post_clear = false;

        {
            let mut slots = self.slots.lock().expect("alarm slots poisoned");
            if let Some(i) = Self::find_slot(&slots, id) {
                let s = &mut slots[i];
                if s.active && s.def.latched && !s.acked {
                    s.acked = true;
                    post_ack = true;

                    // Condition already cleared and no off-delay: clear now.
                    if s.last_cond == AlarmCondState::False && s.def.off_delay_ms == 0 {
                        s.active = false;
                        s.acked = false;
                        s.off_since_ms = 0;
                        s.active_since_ms = now_ms;
                        post_clear = true;
                    }
                }
            }
        }

        if post_ack {
            info!("alarm acked id={}", id);
            self.emit(EventId::AlarmAcked, id);
        }
        if post_clear {
            info!("alarm cleared id={} (ack path)", id);
            self.emit(EventId::AlarmCleared, id);
        }
        post_ack || post_clear
    }

    fn ack_all(&self) -> u8 {
        let pending: Vec<u16> = {
            let slots = self.slots.lock().expect("alarm slots poisoned");
            slots
                .iter()
                .filter(|s| s.used && s.active && s.def.latched && !s.acked)
                .map(|s| s.def.id)
                .collect()
        };
        let mut acked = 0u8;
        for id in pending {
            if self.ack(id) {
                acked += 1;
            }
        }
        acked
    }

    fn is_active(&self, id: u16) -> bool {
        let slots = self.slots.lock().expect("alarm slots poisoned");
        Self::find_slot(&slots, id).is_some_and(|i| slots[i].active)
    }

    fn is_acked(&self, id: u16) -> bool {
        let slots = self.slots.lock().expect("alarm slots poisoned");
        Self::find_slot(&slots, id).is_some_and(|i| slots[i].acked)
    }

    fn active_count(&self) -> u8 {
        let slots = self.slots.lock().expect("alarm slots poisoned");
        slots.iter().filter(|s| s.used && s.active).count() as u8
    }

    fn highest_severity(&self) -> AlarmSeverity {
        let slots = self.slots.lock().expect("alarm slots poisoned");
        slots
            .iter()
            .filter(|s| s.used && s.active)
            .map(|s| s.def.severity)
            .max()
            .unwrap_or(AlarmSeverity::Info)
    }
}

/// Active module running the evaluation loop and the `alarms.*`
/// command surface.
pub struct AlarmModule {
    core: Arc<AlarmCore>,
    last_eval_ms: u64,
}

impl AlarmModule {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            core: Arc::new(AlarmCore::new(clock)),
            last_eval_ms: 0,
        }
    }

    pub fn core(&self) -> Arc<AlarmCore> {
        self.core.clone()
    }
}

impl Module for AlarmModule {
    fn id(&self) -> &'static str {
        "alarms"
    }

    fn dependencies(&self) -> &'static [&'static str] {
        &["loghub", "eventbus", "cmd"]
    }

    fn init(&mut self, cfg: &Arc<ConfigStore>, services: &mut ServiceRegistry) -> Result<()> {
        for def in [
            VarDef {
                module: "alarms",
                name: "enabled",
                key: "al_en",
                persistent: true,
                value: ConfigValue::Bool(true),
            },
            VarDef {
                module: "alarms",
                name: "eval_period_ms",
                key: "al_period",
                persistent: true,
                value: ConfigValue::I32(DEFAULT_EVAL_PERIOD_MS),
            },
        ] {
            if let Err(e) = cfg.register(def) {
                warn!("alarm config registration failed: {:?}", e);
            }
        }

        if let Some(bus) = services.event_bus("eventbus") {
            let core = self.core.clone();
            let cfg2 = cfg.clone();
            bus.subscribe(
                EventId::ConfigChanged,
                Arc::new(move |e: &EventView<'_>| core.on_config_changed(e.payload, &cfg2)),
            );
            let _ = self.core.bus.set(bus);
        }

        if let Some(cmd) = services.command("cmd") {
            let core = self.core.clone();
            cmd.register(
                "alarms.list",
                Arc::new(move |_req: &CommandRequest<'_>, reply: &mut CmdReply| {
                    core.list_json(reply)
                }),
            );

            let core = self.core.clone();
            cmd.register(
                "alarms.ack",
                Arc::new(move |req: &CommandRequest<'_>, reply: &mut CmdReply| {
                    use core::fmt::Write as _;
                    let Some(id) = req
                        .params()
                        .and_then(|p| p.get("id"))
                        .and_then(Json::as_u64)
                        .filter(|v| *v <= u64::from(u16::MAX))
                    else {
                        write_error_json(reply, ErrorCode::MissingArgs, "alarms.ack");
                        return false;
                    };
                    if !core.ack(id as u16) {
                        write_error_json(reply, ErrorCode::Failed, "alarms.ack");
                        return false;
                    }
                    let _ = write!(reply, "{{\"ok\":true,\"id\":{}}}", id);
                    true
                }),
            );

            let core = self.core.clone();
            cmd.register(
                "alarms.ack_all",
                Arc::new(move |_req: &CommandRequest<'_>, reply: &mut CmdReply| {
                    use core::fmt::Write as _;
                    let acked = core.ack_all();
                    let _ = write!(reply, "{{\"ok\":true,\"acked\":{}}}", acked);
                    true
                }),
            );
        }

        let svc: Arc<dyn AlarmService> = self.core.clone();
        services.add("alarms", Service::Alarms(svc));
        info!("alarm service registered");
        Ok(())
    }

    fn on_config_loaded(&mut self, cfg: &Arc<ConfigStore>, _services: &ServiceRegistry) {
        if let Some(v) = cfg.get_bool("alarms", "enabled") {
            self.core.enabled.store(v, Ordering::Relaxed);
        }
        if let Some(v) = cfg.get_i32("alarms", "eval_period_ms") {
            self.core.eval_period_ms.store(v, Ordering::Relaxed);
        }
    }

    fn run_once(&mut self) {
        if !self.core.enabled.load(Ordering::Relaxed) {
            return;
        }
        let now = self.core.clock.monotonic_ms();
        let period = clamp_eval_period(self.core.eval_period_ms.load(Ordering::Relaxed));
        if now.saturating_sub(self.last_eval_ms) < period {
            return;
        }
        self.last_eval_ms = now;
        self.core.evaluate_once(now);
    }

    fn task_spec(&self) -> TaskSpec {
        TaskSpec {
            stack_size: 4096,
            priority: 1,
            core: Some(1),
        }
    }
}
