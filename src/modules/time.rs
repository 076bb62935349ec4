//! Time synchronization and scheduling module.
//!
//! Two halves share one core object:
//!
//! - a sync state machine (`Disabled → WaitingNetwork → Syncing →
//!   Synced / ErrorWait`) driven by network readiness from the data
//!   store and a pluggable [`SyncBackend`], with a clamped, jittered
//!   retry ladder and a six-hour refresh;
//! - a 16-slot scheduler evaluated every 250 ms while synced. Slots
//!   0–2 are reserved for the system cadence events (day, week, month
//!   start). Each evaluation derives the local minute, weekday bit and
//!   minute-of-day, computes per-slot trigger/window state, and emits
//!   Start/Stop/Trigger edges on the event bus. Windowed recurring
//!   slots wrap across midnight by testing the previous weekday for the
//!   post-midnight portion.
//!
//! The whole table persists as one newline-delimited record under the
//! `tm_sched` key:
//! `slot,event_id,flags,weekday_mask,sh,sm,eh,em,start_epoch,end_epoch,label;`

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, AtomicU16, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use anyhow::Result;
use chrono::{DateTime, Datelike, Timelike, Utc};
use log::{debug, info, warn};
use serde_json::Value as Json;

use crate::adapters::clock::Clock;
use crate::adapters::sntp::SyncBackend;
use crate::core::bus::{EventBus, EventView};
use crate::core::command::{CmdReply, CommandRequest};
use crate::core::config::{ConfigStore, ConfigValue, VarDef};
use crate::core::data::{DataStore, keys};
use crate::core::events::{
    ConfigChangedPayload, DataChangedPayload, EventId, SchedulerEdge, SchedulerEventPayload,
};
use crate::core::module::{Module, TaskSpec};
use crate::core::services::{
    SCHED_EVENT_DAY_START, SCHED_EVENT_MONTH_START, SCHED_EVENT_WEEK_START, SCHED_LABEL_MAX,
    SCHED_MAX_SLOTS, SCHED_SLOT_DAY_START, SCHED_SLOT_MONTH_START, SCHED_SLOT_WEEK_START,
    SCHED_SYS_RESERVED, SchedulerMode, SchedulerService, SchedulerSlot, Service, ServiceRegistry,
    TimeService, TimeSyncState, WEEKDAY_ALL, WEEKDAY_MON, WEEKDAY_SUN,
};
use crate::error::{ErrorCode, write_error_json};

/// Oldest plausible valid wall clock (2021-01-01).
const SCHED_MIN_VALID_EPOCH: u64 = 1_609_459_200;

/// Scheduler evaluation cadence while synced.
const SCHED_TICK_MS: u64 = 250;

/// Network warmup before the first sync attempt.
const NET_WARMUP_MS: u64 = 2_000;

/// Periodic refresh while synced.
const RESYNC_PERIOD_MS: u64 = 6 * 3600 * 1000;

/// Retry ladder bounds.
const RETRY_MIN_MS: u32 = 2_000;
const RETRY_MAX_MS: u32 = 300_000;

/// Persisted blob capacity.
const SCHED_BLOB_MAX: usize = 1535;

const INVALID_MINUTE_KEY: u32 = u32::MAX;

// ── Core ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
struct SlotRuntime {
    used: bool,
    def: SchedulerSlot,
    active: bool,
    last_trigger_minute_key: u32,
}

struct SchedTable {
    slots: [SlotRuntime; SCHED_MAX_SLOTS],
    /// Set after the first evaluation following a sync; edges emitted
    /// before that carry `replayed=1`.
    initialized: bool,
}

impl SchedTable {
    fn new() -> Self {
        let mut slots: [SlotRuntime; SCHED_MAX_SLOTS] = Default::default();
        for (i, s) in slots.iter_mut().enumerate() {
            s.def.slot = i as u8;
            s.last_trigger_minute_key = INVALID_MINUTE_KEY;
        }
        Self {
            slots,
            initialized: false,
        }
    }
}

struct PendingEdge {
    slot: u8,
    edge: SchedulerEdge,
    replayed: u8,
    event_id: u16,
    epoch: u64,
}

/// Shared state behind the `time` and `time.scheduler` services.
pub struct TimeCore {
    clock: Arc<dyn Clock>,

    state: AtomicU8,
    state_ts_ms: AtomicU64,

    net_ready: AtomicBool,
    net_ready_ts_ms: AtomicU64,

    retry_delay_ms: AtomicU32,
    rng_state: AtomicU32,

    // Cached config (refreshed from the store on ConfigChanged).
    enabled: AtomicBool,
    week_start_monday: AtomicBool,
    tz_offset_min: AtomicI32,
    servers: Mutex<(String, String)>,

    sched: Mutex<SchedTable>,
    sched_needs_reload: AtomicBool,
    active_mask: AtomicU16,
    last_sched_tick_ms: AtomicU64,

    bus: OnceLock<Arc<EventBus>>,
    data: OnceLock<Arc<DataStore>>,
    cfg: OnceLock<Arc<ConfigStore>>,
}

impl TimeCore {
    fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            state: AtomicU8::new(TimeSyncState::WaitingNetwork as u8),
            state_ts_ms: AtomicU64::new(0),
            net_ready: AtomicBool::new(false),
            net_ready_ts_ms: AtomicU64::new(0),
            retry_delay_ms: AtomicU32::new(RETRY_MIN_MS),
            rng_state: AtomicU32::new(0x2545_F491),
            enabled: AtomicBool::new(true),
            week_start_monday: AtomicBool::new(true),
            tz_offset_min: AtomicI32::new(0),
            servers: Mutex::new(("pool.ntp.org".to_string(), "time.nist.gov".to_string())),
            sched: Mutex::new(SchedTable::new()),
            sched_needs_reload: AtomicBool::new(true),
            active_mask: AtomicU16::new(0),
            last_sched_tick_ms: AtomicU64::new(0),
            bus: OnceLock::new(),
            data: OnceLock::new(),
            cfg: OnceLock::new(),
        }
    }

    fn now_ms(&self) -> u64 {
        self.clock.monotonic_ms()
    }

    fn state_value(&self) -> TimeSyncState {
        match self.state.load(Ordering::Relaxed) {
            0 => TimeSyncState::Disabled,
            1 => TimeSyncState::WaitingNetwork,
            2 => TimeSyncState::Syncing,
            3 => TimeSyncState::Synced,
            _ => TimeSyncState::ErrorWait,
        }
    }

    fn set_state(&self, next: TimeSyncState) {
        let prev = self.state_value();
        self.state.store(next as u8, Ordering::Relaxed);
        self.state_ts_ms.store(self.now_ms(), Ordering::Relaxed);

        if let Some(data) = self.data.get() {
            data.set_time_ready(next == TimeSyncState::Synced);
        }

        if prev != TimeSyncState::Synced && next == TimeSyncState::Synced {
            // Re-evaluate and replay active windows with the fresh clock.
            let mut table = self.sched.lock().expect("sched table poisoned");
            table.initialized = false;
        } else if prev == TimeSyncState::Synced && next != TimeSyncState::Synced {
            // Active states are meaningless until the next sync.
            let mut table = self.sched.lock().expect("sched table poisoned");
            for s in table.slots.iter_mut() {
                s.active = false;
                s.last_trigger_minute_key = INVALID_MINUTE_KEY;
            }
            table.initialized = false;
            self.active_mask.store(0, Ordering::Relaxed);
        }
    }

    fn refresh_config(&self) {
        let Some(cfg) = self.cfg.get() else { return };
        if let Some(v) = cfg.get_bool("time", "enabled") {
            self.enabled.store(v, Ordering::Relaxed);
        }
        if let Some(v) = cfg.get_bool("time", "week_start_mon") {
            self.week_start_monday.store(v, Ordering::Relaxed);
        }
        if let Some(v) = cfg.get_i32("time", "tz_offset_min") {
            self.tz_offset_min.store(v, Ordering::Relaxed);
        }
        let s1 = cfg.get_text("time", "server1");
        let s2 = cfg.get_text("time", "server2");
        if let (Some(s1), Some(s2)) = (s1, s2) {
            *self.servers.lock().expect("servers poisoned") = (s1, s2);
        }
    }

    /// Force a fresh sync cycle from the beginning of the ladder.
    pub fn force_resync(&self) {
        if !self.enabled.load(Ordering::Relaxed) {
            return;
        }
        self.retry_delay_ms.store(RETRY_MIN_MS, Ordering::Relaxed);
        self.net_ready_ts_ms.store(self.now_ms(), Ordering::Relaxed);
        self.set_state(TimeSyncState::WaitingNetwork);
    }

    fn on_data_changed(&self, payload: &[u8]) {
        let Some(p) = DataChangedPayload::decode(payload) else {
            return;
        };
        if p.key != keys::WIFI_READY {
            return;
        }
        let Some(data) = self.data.get() else { return };
        let ready = data.read().wifi.ready;
        if ready == self.net_ready.load(Ordering::Relaxed) {
            return;
        }
        self.net_ready.store(ready, Ordering::Relaxed);
        self.net_ready_ts_ms.store(self.now_ms(), Ordering::Relaxed);
        if ready {
            info!("network ready -> warmup");
            if self.state_value() != TimeSyncState::Synced {
                self.set_state(TimeSyncState::WaitingNetwork);
            }
        } else {
            info!("network lost -> wait");
            self.set_state(TimeSyncState::WaitingNetwork);
        }
    }

    fn on_config_changed(&self, payload: &[u8]) {
        let Some(p) = ConfigChangedPayload::decode(payload) else {
            return;
        };
        match p.key_str() {
            "tm_sched" | "tm_wkmon" => {
                self.sched_needs_reload.store(true, Ordering::Relaxed);
                self.refresh_config();
            }
            "tm_en" | "tm_tzofs" | "tm_srv1" | "tm_srv2" => self.refresh_config(),
            _ => {}
        }
    }

    /// Bounded pseudo-random jitter of ±15% around `base`.
    fn jittered(&self, base: u32) -> u32 {
        let mut x = self.rng_state.load(Ordering::Relaxed) ^ (self.now_ms() as u32 | 1);
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.rng_state.store(x, Ordering::Relaxed);
        let span = base / 100 * 15;
        if span == 0 {
            return base;
        }
        let offset = x % (span * 2 + 1);
        base - span + offset
    }

    fn escalate_retry(&self) -> u32 {
        let cur = self.retry_delay_ms.load(Ordering::Relaxed);
        let next = if cur < 5_000 {
            5_000
        } else if cur < 10_000 {
            10_000
        } else if cur < 30_000 {
            30_000
        } else if cur < 60_000 {
            60_000
        } else {
            RETRY_MAX_MS
        };
        let next = next.clamp(RETRY_MIN_MS, RETRY_MAX_MS);
        self.retry_delay_ms.store(next, Ordering::Relaxed);
        next
    }

    // ── Civil time helpers ────────────────────────────────────

    fn local_now(&self, epoch: u64) -> Option<DateTime<Utc>> {
        let ofs = i64::from(self.tz_offset_min.load(Ordering::Relaxed)) * 60;
        DateTime::<Utc>::from_timestamp(epoch as i64 + ofs, 0)
    }

    fn weekday_enabled(mask: u8, week_bit: u8) -> bool {
        let mask = if mask == 0 { WEEKDAY_ALL } else { mask };
        mask & (1 << week_bit) != 0
    }

    fn recurring_trigger_now(def: &SchedulerSlot, week_bit: u8, day_minute: u32) -> bool {
        if def.mode != SchedulerMode::RecurringClock {
            return false;
        }
        if !Self::weekday_enabled(def.weekday_mask, week_bit) {
            return false;
        }
        day_minute == u32::from(def.start_hour) * 60 + u32::from(def.start_minute)
    }

    fn recurring_active_now(
        def: &SchedulerSlot,
        week_bit: u8,
        prev_week_bit: u8,
        day_minute: u32,
    ) -> bool {
        if def.mode != SchedulerMode::RecurringClock || !def.has_end {
            return false;
        }
        let start = u32::from(def.start_hour) * 60 + u32::from(def.start_minute);
        let end = u32::from(def.end_hour) * 60 + u32::from(def.end_minute);
        if start == end {
            return false;
        }
        if start < end {
            return Self::weekday_enabled(def.weekday_mask, week_bit)
                && day_minute >= start
                && day_minute < end;
        }
        // Window wraps midnight: the weekday mask gates the start side.
        if day_minute >= start {
            Self::weekday_enabled(def.weekday_mask, week_bit)
        } else {
            Self::weekday_enabled(def.weekday_mask, prev_week_bit)
        }
    }

    // ── Scheduler evaluation ──────────────────────────────────

    fn tick_scheduler(&self) {
        let Some(bus) = self.bus.get() else { return };
        if self.state_value() != TimeSyncState::Synced {
            return;
        }
        let now = self.clock.wall_epoch();
        if now < SCHED_MIN_VALID_EPOCH {
            return;
        }
        let Some(local) = self.local_now(now) else { return };

        let minute_key = (now / 60) as u32;
        let week_bit = local.weekday().num_days_from_monday() as u8;
        let prev_week_bit = if week_bit == 0 { 6 } else { week_bit - 1 };
        let day_minute = local.hour() * 60 + local.minute();
        let day_of_month = local.day();

        let mut pending: heapless::Vec<PendingEdge, { SCHED_MAX_SLOTS * 2 }> = heapless::Vec::new();
        let new_mask;
        {
            let mut table = self.sched.lock().expect("sched table poisoned");
            let initialized = table.initialized;
            let mut mask = 0u16;

            for i in 0..SCHED_MAX_SLOTS {
                let s = &mut table.slots[i];
                if !s.used {
                    continue;
                }

                if !s.def.enabled {
                    if s.active {
                        s.active = false;
                        let _ = pending.push(PendingEdge {
                            slot: i as u8,
                            edge: SchedulerEdge::Stop,
                            replayed: 0,
                            event_id: s.def.event_id,
                            epoch: now,
                        });
                    }
                    continue;
                }

                if s.def.mode == SchedulerMode::OneShotEpoch {
                    if !s.def.has_end {
                        if now >= s.def.start_epoch_sec {
                            if s.last_trigger_minute_key != minute_key {
                                let _ = pending.push(PendingEdge {
                                    slot: i as u8,
                                    edge: SchedulerEdge::Trigger,
                                    replayed: u8::from(!initialized),
                                    event_id: s.def.event_id,
                                    epoch: now,
                                });
                                s.last_trigger_minute_key = minute_key;
                            }
                            // Retired inside the same critical section;
                            // readers never see a half-cleared slot.
                            s.used = false;
                            s.active = false;
                        }
                        continue;
                    }

                    let active_now =
                        now >= s.def.start_epoch_sec && now < s.def.end_epoch_sec;
                    if !initialized {
                        s.active = active_now;
                        if active_now && s.def.replay_start_on_boot {
                            let _ = pending.push(PendingEdge {
                                slot: i as u8,
                                edge: SchedulerEdge::Start,
                                replayed: 1,
                                event_id: s.def.event_id,
                                epoch: now,
                            });
                        }
                    } else if !s.active && active_now {
                        s.active = true;
                        let _ = pending.push(PendingEdge {
                            slot: i as u8,
                            edge: SchedulerEdge::Start,
                            replayed: 0,
                            event_id: s.def.event_id,
                            epoch: now,
                        });
                    } else if s.active && !active_now {
                        s.active = false;
                        let _ = pending.push(PendingEdge {
                            slot: i as u8,
                            edge: SchedulerEdge::Stop,
                            replayed: 0,
                            event_id: s.def.event_id,
                            epoch: now,
                        });
                    }

                    if !s.active && now >= s.def.end_epoch_sec {
                        s.used = false;
                    } else if s.active {
                        mask |= 1 << i;
                    }
                    continue;
                }

                // Recurring clock mode.
                if !s.def.has_end {
                    if Self::recurring_trigger_now(&s.def, week_bit, day_minute) {
                        // The month-start system slot only fires on day 1.
                        let month_gate = i as u8 == SCHED_SLOT_MONTH_START
                            && s.def.event_id == SCHED_EVENT_MONTH_START;
                        if month_gate && day_of_month != 1 {
                            continue;
                        }
                        if s.last_trigger_minute_key != minute_key {
                            let _ = pending.push(PendingEdge {
                                slot: i as u8,
                                edge: SchedulerEdge::Trigger,
                                replayed: u8::from(!initialized),
                                event_id: s.def.event_id,
                                epoch: now,
                            });
                            s.last_trigger_minute_key = minute_key;
                        }
                    }
                    s.active = false;
                    continue;
                }

                let active_now =
                    Self::recurring_active_now(&s.def, week_bit, prev_week_bit, day_minute);
                if !initialized {
                    s.active = active_now;
                    if active_now && s.def.replay_start_on_boot {
                        let _ = pending.push(PendingEdge {
                            slot: i as u8,
                            edge: SchedulerEdge::Start,
                            replayed: 1,
                            event_id: s.def.event_id,
                            epoch: now,
                        });
                    }
                } else if !s.active && active_now {
                    s.active = true;
                    let _ = pending.push(PendingEdge {
                        slot: i as u8,
                        edge: SchedulerEdge::Start,
                        replayed: 0,
                        event_id: s.def.event_id,
                        epoch: now,
                    });
                } else if s.active && !active_now {
                    s.active = false;
                    let _ = pending.push(PendingEdge {
                        slot: i as u8,
                        edge: SchedulerEdge::Stop,
                        replayed: 0,
                        event_id: s.def.event_id,
                        epoch: now,
                    });
                }

                if s.active {
                    mask |= 1 << i;
                }
            }

            table.initialized = true;
            new_mask = mask;
        }
        self.active_mask.store(new_mask, Ordering::Relaxed);

        for p in pending.iter() {
            let payload = SchedulerEventPayload {
                slot: p.slot,
                edge: p.edge,
                replayed: p.replayed,
                event_id: p.event_id,
                active_mask: new_mask,
                epoch_seconds: p.epoch,
            };
            info!(
                "scheduler {} slot={} event_id={} replayed={} mask=0x{:04X} epoch={}",
                p.edge.as_str(),
                p.slot,
                p.event_id,
                p.replayed,
                new_mask,
                p.epoch
            );
            let mut buf = [0u8; SchedulerEventPayload::ENCODED_LEN];
            let n = payload.encode(&mut buf);
            let _ = bus.post(EventId::SchedulerEventTriggered, &buf[..n]);
        }
    }

    // ── Slot table management ─────────────────────────────────

    fn is_system_slot(slot: u8) -> bool {
        slot < SCHED_SYS_RESERVED
    }

    fn sanitize_label(label: &str) -> heapless::String<SCHED_LABEL_MAX> {
        let mut out = heapless::String::new();
        for c in label.chars().take(SCHED_LABEL_MAX - 1) {
            let ok = c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.';
            let _ = out.push(if ok { c } else { '_' });
        }
        out
    }

    fn validate_and_normalize(def: &SchedulerSlot) -> Option<SchedulerSlot> {
        let mut d = def.clone();
        d.label = Self::sanitize_label(d.label.as_str());
        match d.mode {
            SchedulerMode::RecurringClock => {
                if d.start_hour > 23 || d.start_minute > 59 {
                    return None;
                }
                if d.has_end && (d.end_hour > 23 || d.end_minute > 59) {
                    return None;
                }
                d.weekday_mask &= WEEKDAY_ALL;
                if d.weekday_mask == 0 {
                    d.weekday_mask = WEEKDAY_ALL;
                }
                d.start_epoch_sec = 0;
                d.end_epoch_sec = 0;
            }
            SchedulerMode::OneShotEpoch => {
                if d.start_epoch_sec < SCHED_MIN_VALID_EPOCH {
                    return None;
                }
                if d.has_end && d.end_epoch_sec <= d.start_epoch_sec {
                    return None;
                }
                d.weekday_mask = WEEKDAY_ALL;
                d.start_hour = 0;
                d.start_minute = 0;
                d.end_hour = 0;
                d.end_minute = 0;
            }
        }
        Some(d)
    }

    fn apply_system_slots(table: &mut SchedTable, week_start_monday: bool) {
        let mut set = |slot: u8, event_id: u16, weekday_mask: u8, label: &str| {
            let s = &mut table.slots[slot as usize];
            s.used = true;
            s.active = false;
            s.last_trigger_minute_key = INVALID_MINUTE_KEY;
            s.def = SchedulerSlot {
                slot,
                event_id,
                enabled: true,
                mode: SchedulerMode::RecurringClock,
                has_end: false,
                replay_start_on_boot: false,
                weekday_mask,
                start_hour: 0,
                start_minute: 0,
                end_hour: 0,
                end_minute: 0,
                start_epoch_sec: 0,
                end_epoch_sec: 0,
                label: Self::sanitize_label(label),
            };
        };
        set(SCHED_SLOT_DAY_START, SCHED_EVENT_DAY_START, WEEKDAY_ALL, "sys_day_start");
        set(
            SCHED_SLOT_WEEK_START,
            SCHED_EVENT_WEEK_START,
            if week_start_monday { WEEKDAY_MON } else { WEEKDAY_SUN },
            "sys_week_start",
        );
        set(
            SCHED_SLOT_MONTH_START,
            SCHED_EVENT_MONTH_START,
            WEEKDAY_ALL,
            "sys_month_start",
        );
    }

    fn load_schedule_from_blob(&self) {
        let blob = self
            .cfg
            .get()
            .and_then(|cfg| cfg.get_text("time", "sched_blob"))
            .unwrap_or_default();

        let mut table = self.sched.lock().expect("sched table poisoned");
        *table = SchedTable::new();

        for record in blob.split(';') {
            let record = record.trim();
            if record.is_empty() {
                continue;
            }
            let mut fields = record.splitn(11, ',');
            let next_u64 = |fields: &mut core::str::SplitN<'_, char>| -> Option<u64> {
                fields.next()?.trim().parse::<u64>().ok()
            };
            let Some(slot) = next_u64(&mut fields) else { continue };
            let Some(event_id) = next_u64(&mut fields) else { continue };
            let Some(flags) = next_u64(&mut fields) else { continue };
            let Some(weekday_mask) = next_u64(&mut fields) else { continue };
            let Some(sh) = next_u64(&mut fields) else { continue };
            let Some(sm) = next_u64(&mut fields) else { continue };
            let Some(eh) = next_u64(&mut fields) else { continue };
            let Some(em) = next_u64(&mut fields) else { continue };
            let Some(start_epoch) = next_u64(&mut fields) else { continue };
            let Some(end_epoch) = next_u64(&mut fields) else { continue };
            let label = fields.next().unwrap_or("");

            if slot >= SCHED_MAX_SLOTS as u64 {
                continue;
            }

            let def = SchedulerSlot {
                slot: slot as u8,
                event_id: event_id as u16,
                enabled: flags & 0x01 != 0,
                has_end: flags & 0x04 != 0,
                mode: if flags & 0x08 != 0 {
                    SchedulerMode::OneShotEpoch
                } else {
                    SchedulerMode::RecurringClock
                },
                replay_start_on_boot: flags & 0x10 != 0,
                weekday_mask: (weekday_mask as u8) & WEEKDAY_ALL,
                start_hour: sh as u8,
                start_minute: sm as u8,
                end_hour: eh as u8,
                end_minute: em as u8,
                start_epoch_sec: start_epoch,
                end_epoch_sec: end_epoch,
                label: Self::sanitize_label(label),
            };

            let Some(def) = Self::validate_and_normalize(&def) else {
                continue;
            };
            let s = &mut table.slots[def.slot as usize];
            s.used = true;
            s.def = def;
            s.active = false;
            s.last_trigger_minute_key = INVALID_MINUTE_KEY;
        }

        // System slots always win over whatever the blob carried.
        Self::apply_system_slots(&mut table, self.week_start_monday.load(Ordering::Relaxed));
        table.initialized = false;
        drop(table);

        self.active_mask.store(0, Ordering::Relaxed);
        self.sched_needs_reload.store(false, Ordering::Relaxed);
        info!("scheduler table loaded");
    }

    fn serialize_schedule(&self) -> String {
        use core::fmt::Write as _;
        let table = self.sched.lock().expect("sched table poisoned");
        let mut out = String::new();
        for s in table.slots.iter().filter(|s| s.used) {
            let flags = u32::from(s.def.enabled)
                | (u32::from(s.def.has_end) << 2)
                | (u32::from(s.def.mode == SchedulerMode::OneShotEpoch) << 3)
                | (u32::from(s.def.replay_start_on_boot) << 4);
            let _ = write!(
                out,
                "{},{},{},{},{},{},{},{},{},{},{};",
                s.def.slot,
                s.def.event_id,
                flags,
                s.def.weekday_mask,
                s.def.start_hour,
                s.def.start_minute,
                s.def.end_hour,
                s.def.end_minute,
                s.def.start_epoch_sec,
                s.def.end_epoch_sec,
                s.def.label.as_str()
            );
        }
        out
    }

    fn persist_schedule(&self) -> bool {
        let Some(cfg) = self.cfg.get() else { return false };
        let blob = self.serialize_schedule();
        if blob.len() > SCHED_BLOB_MAX {
            warn!("scheduler blob too large ({} bytes)", blob.len());
            return false;
        }
        cfg.set_text("time", "sched_blob", &blob)
    }
}

// ── Service impls ─────────────────────────────────────────────

impl TimeService for TimeCore {
    fn state(&self) -> TimeSyncState {
        self.state_value()
    }

    fn is_synced(&self) -> bool {
        self.state_value() == TimeSyncState::Synced
    }

    fn epoch(&self) -> u64 {
        self.clock.wall_epoch()
    }

    fn format_local_time(&self, out: &mut heapless::String<32>) -> bool {
        use core::fmt::Write as _;
        let epoch = self.clock.wall_epoch();
        if epoch == 0 {
            return false;
        }
        let Some(local) = self.local_now(epoch) else {
            return false;
        };
        out.clear();
        write!(out, "{}", local.format("%Y-%m-%d %H:%M:%S")).is_ok()
    }
}

impl SchedulerService for TimeCore {
    fn set_slot(&self, def: &SchedulerSlot) -> bool {
        if def.slot as usize >= SCHED_MAX_SLOTS || Self::is_system_slot(def.slot) {
            return false;
        }
        let Some(normalized) = Self::validate_and_normalize(def) else {
            return false;
        };
        {
            let mut table = self.sched.lock().expect("sched table poisoned");
            let s = &mut table.slots[normalized.slot as usize];
            s.used = true;
            s.def = normalized.clone();
            s.active = false;
            s.last_trigger_minute_key = INVALID_MINUTE_KEY;
            table.initialized = false;
        }
        self.active_mask
            .fetch_and(!(1 << normalized.slot), Ordering::Relaxed);
        self.persist_schedule()
    }

    fn get_slot(&self, slot: u8) -> Option<SchedulerSlot> {
        if slot as usize >= SCHED_MAX_SLOTS {
            return None;
        }
        let table = self.sched.lock().expect("sched table poisoned");
        let s = &table.slots[slot as usize];
        s.used.then(|| s.def.clone())
    }

    fn clear_slot(&self, slot: u8) -> bool {
        if slot as usize >= SCHED_MAX_SLOTS || Self::is_system_slot(slot) {
            return false;
        }
        {
            let mut table = self.sched.lock().expect("sched table poisoned");
            table.slots[slot as usize] = SlotRuntime {
                def: SchedulerSlot {
                    slot,
                    ..SchedulerSlot::default()
                },
                last_trigger_minute_key: INVALID_MINUTE_KEY,
                ..SlotRuntime::default()
            };
        }
        self.active_mask.fetch_and(!(1 << slot), Ordering::Relaxed);
        self.persist_schedule()
    }

    fn clear_all(&self) -> bool {
        {
            let mut table = self.sched.lock().expect("sched table poisoned");
            *table = SchedTable::new();
            Self::apply_system_slots(&mut table, self.week_start_monday.load(Ordering::Relaxed));
        }
        self.active_mask.store(0, Ordering::Relaxed);
        self.persist_schedule()
    }

    fn used_count(&self) -> u8 {
        let table = self.sched.lock().expect("sched table poisoned");
        table.slots.iter().filter(|s| s.used).count() as u8
    }

    fn active_mask(&self) -> u16 {
        self.active_mask.load(Ordering::Relaxed)
    }

    fn is_active(&self, slot: u8) -> bool {
        slot < 16 && self.active_mask() & (1 << slot) != 0
    }
}

// ── Command helpers ───────────────────────────────────────────

fn param_u64(params: &Json, name: &str) -> Option<u64> {
    params.get(name).and_then(Json::as_u64)
}

/// Optional bool parameter; accepts booleans and integers. The error
/// marks a present-but-unparsable value.
fn param_bool(params: &Json, name: &str) -> Result<Option<bool>, ErrorCode> {
    match params.get(name) {
        None => Ok(None),
        Some(Json::Bool(b)) => Ok(Some(*b)),
        Some(Json::Number(n)) => match n.as_i64() {
            Some(v) => Ok(Some(v != 0)),
            None => Err(ErrorCode::InvalidBool),
        },
        Some(_) => Err(ErrorCode::InvalidBool),
    }
}

fn reply_slot_info(reply: &mut CmdReply, def: &SchedulerSlot) -> bool {
    use core::fmt::Write as _;
    let mode = match def.mode {
        SchedulerMode::OneShotEpoch => "one_shot_epoch",
        SchedulerMode::RecurringClock => "recurring_clock",
    };
    write!(
        reply,
        "{{\"ok\":true,\"slot\":{},\"event_id\":{},\"label\":\"{}\",\"enabled\":{},\
         \"mode\":\"{}\",\"has_end\":{},\"replay_start_on_boot\":{},\"weekday_mask\":{},\
         \"start\":{{\"hour\":{},\"minute\":{},\"epoch\":{}}},\
         \"end\":{{\"hour\":{},\"minute\":{},\"epoch\":{}}}}}",
        def.slot,
        def.event_id,
        def.label.as_str(),
        def.enabled,
        mode,
        def.has_end,
        def.replay_start_on_boot,
        def.weekday_mask,
        def.start_hour,
        def.start_minute,
        def.start_epoch_sec,
        def.end_hour,
        def.end_minute,
        def.end_epoch_sec
    )
    .is_ok()
}

// ── Module ────────────────────────────────────────────────────

/// Active module that synchronizes time and drives scheduler events.
pub struct TimeModule {
    core: Arc<TimeCore>,
    backend: Box<dyn SyncBackend>,
}

impl TimeModule {
    pub fn new(clock: Arc<dyn Clock>, backend: Box<dyn SyncBackend>) -> Self {
        Self {
            core: Arc::new(TimeCore::new(clock)),
            backend,
        }
    }

    pub fn core(&self) -> Arc<TimeCore> {
        self.core.clone()
    }

    fn register_config(cfg: &Arc<ConfigStore>) {
        let defs = [
            VarDef {
                module: "time",
                name: "server1",
                key: "tm_srv1",
                persistent: true,
                value: ConfigValue::text("pool.ntp.org", 39),
            },
            VarDef {
                module: "time",
                name: "server2",
                key: "tm_srv2",
                persistent: true,
                value: ConfigValue::text("time.nist.gov", 39),
            },
            VarDef {
                module: "time",
                name: "tz_offset_min",
                key: "tm_tzofs",
                persistent: true,
                value: ConfigValue::I32(0),
            },
            VarDef {
                module: "time",
                name: "enabled",
                key: "tm_en",
                persistent: true,
                value: ConfigValue::Bool(true),
            },
            VarDef {
                module: "time",
                name: "week_start_mon",
                key: "tm_wkmon",
                persistent: true,
                value: ConfigValue::Bool(true),
            },
            VarDef {
                module: "time",
                name: "sched_blob",
                key: "tm_sched",
                persistent: true,
                value: ConfigValue::text("", SCHED_BLOB_MAX),
            },
        ];
        for def in defs {
            if let Err(e) = cfg.register(def) {
                warn!("time config registration failed: {:?}", e);
            }
        }
    }

    fn register_commands(core: &Arc<TimeCore>, services: &ServiceRegistry) {
        let Some(cmd) = services.command("cmd") else {
            return;
        };

        let c = core.clone();
        cmd.register(
            "time.resync",
            Arc::new(move |_req: &CommandRequest<'_>, reply: &mut CmdReply| {
                c.force_resync();
                let _ = reply.push_str("{\"ok\":true}");
                true
            }),
        );

        let c = core.clone();
        cmd.register(
            "time.scheduler.info",
            Arc::new(move |_req: &CommandRequest<'_>, reply: &mut CmdReply| {
                use core::fmt::Write as _;
                let mut now: heapless::String<32> = heapless::String::new();
                if !c.format_local_time(&mut now) {
                    let _ = now.push_str("n/a");
                }
                let mask = SchedulerService::active_mask(c.as_ref());
                let _ = write!(
                    reply,
                    "{{\"ok\":true,\"state\":{},\"synced\":{},\"used\":{},\"active_mask\":{},\
                     \"active_mask_hex\":\"0x{:04X}\",\"week_start\":\"{}\",\"now\":\"{}\"}}",
                    c.state_value() as u8,
                    c.is_synced(),
                    c.used_count(),
                    mask,
                    mask,
                    if c.week_start_monday.load(Ordering::Relaxed) {
                        "monday"
                    } else {
                        "sunday"
                    },
                    now.as_str()
                );
                true
            }),
        );

        let c = core.clone();
        cmd.register(
            "time.scheduler.get",
            Arc::new(move |req: &CommandRequest<'_>, reply: &mut CmdReply| {
                let Some(params) = req.params() else {
                    write_error_json(reply, ErrorCode::MissingArgs, "sched.get");
                    return false;
                };
                let Some(slot) = param_u64(params, "slot") else {
                    write_error_json(reply, ErrorCode::MissingSlot, "sched.get");
                    return false;
                };
                if slot >= SCHED_MAX_SLOTS as u64 {
                    write_error_json(reply, ErrorCode::InvalidSlot, "sched.get");
                    return false;
                }
                match c.get_slot(slot as u8) {
                    Some(def) => reply_slot_info(reply, &def),
                    None => {
                        write_error_json(reply, ErrorCode::UnusedSlot, "sched.get");
                        false
                    }
                }
            }),
        );

        let c = core.clone();
        cmd.register(
            "time.scheduler.set",
            Arc::new(move |req: &CommandRequest<'_>, reply: &mut CmdReply| {
                handle_sched_set(&c, req, reply)
            }),
        );

        let c = core.clone();
        cmd.register(
            "time.scheduler.clear",
            Arc::new(move |req: &CommandRequest<'_>, reply: &mut CmdReply| {
                use core::fmt::Write as _;
                let Some(params) = req.params() else {
                    write_error_json(reply, ErrorCode::MissingArgs, "sched.clear");
                    return false;
                };
                let Some(slot) = param_u64(params, "slot") else {
                    write_error_json(reply, ErrorCode::MissingSlot, "sched.clear");
                    return false;
                };
                if slot >= SCHED_MAX_SLOTS as u64 {
                    write_error_json(reply, ErrorCode::InvalidSlot, "sched.clear");
                    return false;
                }
                if TimeCore::is_system_slot(slot as u8) {
                    write_error_json(reply, ErrorCode::ReservedSlot, "sched.clear");
                    return false;
                }
                if !c.clear_slot(slot as u8) {
                    write_error_json(reply, ErrorCode::ClearFailed, "sched.clear");
                    return false;
                }
                let _ = write!(reply, "{{\"ok\":true,\"slot\":{}}}", slot);
                true
            }),
        );

        let c = core.clone();
        cmd.register(
            "time.scheduler.clear_all",
            Arc::new(move |_req: &CommandRequest<'_>, reply: &mut CmdReply| {
                if !c.clear_all() {
                    write_error_json(reply, ErrorCode::ClearAllFailed, "sched.clear_all");
                    return false;
                }
                let _ = reply.push_str("{\"ok\":true}");
                true
            }),
        );
    }
}

fn handle_sched_set(core: &Arc<TimeCore>, req: &CommandRequest<'_>, reply: &mut CmdReply) -> bool {
    use core::fmt::Write as _;

    let Some(params) = req.params() else {
        write_error_json(reply, ErrorCode::MissingArgs, "sched.set");
        return false;
    };
    let Some(slot) = param_u64(params, "slot") else {
        write_error_json(reply, ErrorCode::MissingSlot, "sched.set");
        return false;
    };
    if slot >= SCHED_MAX_SLOTS as u64 {
        write_error_json(reply, ErrorCode::InvalidSlot, "sched.set");
        return false;
    }
    if TimeCore::is_system_slot(slot as u8) {
        write_error_json(reply, ErrorCode::ReservedSlot, "sched.set");
        return false;
    }

    // Start from the existing slot or a fresh default.
    let mut def = core.get_slot(slot as u8).unwrap_or_else(|| SchedulerSlot {
        slot: slot as u8,
        enabled: true,
        replay_start_on_boot: true,
        ..SchedulerSlot::default()
    });
    def.slot = slot as u8;

    match params.get("event_id") {
        Some(v) => match v.as_u64().filter(|id| *id > 0 && *id <= u64::from(u16::MAX)) {
            Some(id) => def.event_id = id as u16,
            None => {
                write_error_json(reply, ErrorCode::InvalidEventId, "sched.set");
                return false;
            }
        },
        None if def.event_id == 0 => {
            write_error_json(reply, ErrorCode::MissingEventId, "sched.set");
            return false;
        }
        None => {}
    }

    if let Some(mode) = params.get("mode") {
        def.mode = match mode {
            Json::String(s) => match s.as_str() {
                "one_shot_epoch" | "oneshot_epoch" | "oneshot" | "epoch" => {
                    SchedulerMode::OneShotEpoch
                }
                "recurring_clock" | "recurring" | "clock" => SchedulerMode::RecurringClock,
                _ => {
                    write_error_json(reply, ErrorCode::InvalidMode, "sched.set");
                    return false;
                }
            },
            Json::Number(n) => match n.as_u64() {
                Some(0) => SchedulerMode::RecurringClock,
                Some(_) => SchedulerMode::OneShotEpoch,
                None => {
                    write_error_json(reply, ErrorCode::InvalidMode, "sched.set");
                    return false;
                }
            },
            _ => {
                write_error_json(reply, ErrorCode::InvalidMode, "sched.set");
                return false;
            }
        };
    }

    match (
        param_bool(params, "enabled"),
        param_bool(params, "has_end"),
        param_bool(params, "replay_start_on_boot"),
    ) {
        (Ok(enabled), Ok(has_end), Ok(replay)) => {
            if let Some(v) = enabled {
                def.enabled = v;
            }
            if let Some(v) = has_end {
                def.has_end = v;
            }
            if let Some(v) = replay {
                def.replay_start_on_boot = v;
            }
        }
        _ => {
            write_error_json(reply, ErrorCode::InvalidBool, "sched.set");
            return false;
        }
    }

    let u8_fields: [(&str, &mut u8, u64, ErrorCode); 5] = [
        ("weekday_mask", &mut def.weekday_mask, 0x7F, ErrorCode::InvalidWeekdayMask),
        ("start_hour", &mut def.start_hour, 23, ErrorCode::InvalidStartHour),
        ("start_minute", &mut def.start_minute, 59, ErrorCode::InvalidStartMinute),
        ("end_hour", &mut def.end_hour, 23, ErrorCode::InvalidEndHour),
        ("end_minute", &mut def.end_minute, 59, ErrorCode::InvalidEndMinute),
    ];
    for (name, target, max, code) in u8_fields {
        match params.get(name) {
            None => {}
            Some(v) => match v.as_u64().filter(|x| *x <= max) {
                Some(x) => *target = x as u8,
                None => {
                    write_error_json(reply, code, "sched.set");
                    return false;
                }
            },
        }
    }

    if let Some(v) = params.get("start_epoch_sec") {
        match v.as_u64() {
            Some(x) => def.start_epoch_sec = x,
            None => {
                write_error_json(reply, ErrorCode::InvalidStartEpoch, "sched.set");
                return false;
            }
        }
    }
    if let Some(v) = params.get("end_epoch_sec") {
        match v.as_u64() {
            Some(x) => def.end_epoch_sec = x,
            None => {
                write_error_json(reply, ErrorCode::InvalidEndEpoch, "sched.set");
                return false;
            }
        }
    }

    if let Some(v) = params.get("label") {
        match v.as_str() {
            Some(s) => def.label = TimeCore::sanitize_label(s),
            None => {
                write_error_json(reply, ErrorCode::InvalidLabel, "sched.set");
                return false;
            }
        }
    }

    if !core.set_slot(&def) {
        write_error_json(reply, ErrorCode::SetFailed, "sched.set");
        return false;
    }
    let _ = write!(
        reply,
        "{{\"ok\":true,\"slot\":{},\"event_id\":{}}}",
        def.slot, def.event_id
    );
    true
}

impl Module for TimeModule {
    fn id(&self) -> &'static str {
        "time"
    }

    fn dependencies(&self) -> &'static [&'static str] {
        &["loghub", "datastore", "cmd", "eventbus"]
    }

    fn init(&mut self, cfg: &Arc<ConfigStore>, services: &mut ServiceRegistry) -> Result<()> {
        let _ = self.core.cfg.set(cfg.clone());
        Self::register_config(cfg);

        if let Some(data) = services.data("datastore") {
            let _ = self.core.data.set(data);
        }
        if let Some(bus) = services.event_bus("eventbus") {
            let c = self.core.clone();
            bus.subscribe(
                EventId::DataChanged,
                Arc::new(move |e: &EventView<'_>| c.on_data_changed(e.payload)),
            );
            let c = self.core.clone();
            bus.subscribe(
                EventId::ConfigChanged,
                Arc::new(move |e: &EventView<'_>| c.on_config_changed(e.payload)),
            );
            let _ = self.core.bus.set(bus);
        }

        Self::register_commands(&self.core, services);

        let time_svc: Arc<dyn TimeService> = self.core.clone();
        services.add("time", Service::Time(time_svc));
        let sched_svc: Arc<dyn SchedulerService> = self.core.clone();
        services.add("time.scheduler", Service::Scheduler(sched_svc));
        info!("time services registered (time, time.scheduler)");
        Ok(())
    }

    fn on_config_loaded(&mut self, _cfg: &Arc<ConfigStore>, _services: &ServiceRegistry) {
        self.core.refresh_config();
        self.core.load_schedule_from_blob();
        let enabled = self.core.enabled.load(Ordering::Relaxed);
        self.core.set_state(if enabled {
            TimeSyncState::WaitingNetwork
        } else {
            TimeSyncState::Disabled
        });
    }

    fn run_once(&mut self) {
        let core = &self.core;
        if core.sched_needs_reload.load(Ordering::Relaxed) {
            core.load_schedule_from_blob();
        }

        let now = core.now_ms();
        if !core.enabled.load(Ordering::Relaxed) {
            if core.state_value() != TimeSyncState::Disabled {
                core.set_state(TimeSyncState::Disabled);
            }
            return;
        }

        match core.state_value() {
            TimeSyncState::Disabled => core.set_state(TimeSyncState::WaitingNetwork),

            TimeSyncState::WaitingNetwork => {
                if core.net_ready.load(Ordering::Relaxed)
                    && now.saturating_sub(core.net_ready_ts_ms.load(Ordering::Relaxed))
                        >= NET_WARMUP_MS
                {
                    info!("network warmup done -> syncing");
                    core.set_state(TimeSyncState::Syncing);
                }
            }

            TimeSyncState::Syncing => {
                let (s1, s2) = core.servers.lock().expect("servers poisoned").clone();
                debug!("sync attempt: {} / {}", s1, s2);
                match self.backend.sync(&s1, &s2) {
                    Some(epoch) => {
                        core.clock.set_wall_epoch(epoch);
                        core.retry_delay_ms.store(RETRY_MIN_MS, Ordering::Relaxed);
                        let mut when: heapless::String<32> = heapless::String::new();
                        let _ = core.format_local_time(&mut when);
                        info!("time synced: {}", when.as_str());
                        core.set_state(TimeSyncState::Synced);
                    }
                    None => {
                        let delay = core.retry_delay_ms.load(Ordering::Relaxed);
                        warn!("sync failed -> retry in {} ms", delay);
                        core.set_state(TimeSyncState::ErrorWait);
                    }
                }
            }

            TimeSyncState::ErrorWait => {
                if !core.net_ready.load(Ordering::Relaxed) {
                    core.set_state(TimeSyncState::WaitingNetwork);
                } else {
                    let wait = core.jittered(core.retry_delay_ms.load(Ordering::Relaxed));
                    if now.saturating_sub(core.state_ts_ms.load(Ordering::Relaxed))
                        >= u64::from(wait)
                    {
                        core.escalate_retry();
                        core.set_state(TimeSyncState::Syncing);
                    }
                }
            }

            TimeSyncState::Synced => {
                if core.net_ready.load(Ordering::Relaxed)
                    && now.saturating_sub(core.state_ts_ms.load(Ordering::Relaxed))
                        > RESYNC_PERIOD_MS
                {
                    core.set_state(TimeSyncState::Syncing);
                }
            }
        }

        // Scheduler cadence.
        if now.saturating_sub(core.last_sched_tick_ms.load(Ordering::Relaxed)) >= SCHED_TICK_MS {
            core.last_sched_tick_ms.store(now, Ordering::Relaxed);
            core.tick_scheduler();
        }
    }

    fn task_spec(&self) -> TaskSpec {
        TaskSpec {
            stack_size: 6144,
            priority: 2,
            core: Some(1),
        }
    }
}
