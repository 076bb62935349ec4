//! Service contracts and the capability registry.
//!
//! Modules publish the services they own during init and look up their
//! dependencies by id. The registry stores a tagged handle per entry —
//! one variant per service the system offers — so a lookup returns a
//! typed handle or nothing; there is no unchecked cast anywhere on the
//! consumer side.
//!
//! Registrations are append-only and live until reboot. The registry
//! owns only cloned `Arc` handles, never the service objects' lifecycle.

use std::sync::Arc;

use super::bus::EventBus;
use super::command::CommandDispatcher;
use super::config::ConfigStore;
use super::data::DataStore;
use super::logging::{LogHub, SinkRegistry};

/// Maximum number of registered services.
pub const MAX_SERVICES: usize = 16;

/// Maximum service id length.
pub const MAX_SERVICE_ID: usize = 32;

// ── Time / scheduler contracts ────────────────────────────────

/// Time synchronization state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TimeSyncState {
    Disabled = 0,
    WaitingNetwork = 1,
    Syncing = 2,
    Synced = 3,
    ErrorWait = 4,
}

/// Read-side clock/sync service exposed by the time module.
pub trait TimeService: Send + Sync {
    fn state(&self) -> TimeSyncState;
    fn is_synced(&self) -> bool;
    /// Current epoch seconds (UTC).
    fn epoch(&self) -> u64;
    /// Format local time as `YYYY-MM-DD HH:MM:SS`. `false` when the
    /// clock is not valid yet.
    fn format_local_time(&self, out: &mut heapless::String<32>) -> bool;
}

/// Number of scheduler slots.
pub const SCHED_MAX_SLOTS: usize = 16;

/// Slots `[0..SCHED_SYS_RESERVED)` carry system cadence events.
pub const SCHED_SYS_RESERVED: u8 = 3;

pub const SCHED_SLOT_DAY_START: u8 = 0;
pub const SCHED_SLOT_WEEK_START: u8 = 1;
pub const SCHED_SLOT_MONTH_START: u8 = 2;

/// Event ids carried by the reserved system slots.
pub const SCHED_EVENT_DAY_START: u16 = 0xF000;
pub const SCHED_EVENT_WEEK_START: u16 = 0xF001;
pub const SCHED_EVENT_MONTH_START: u16 = 0xF002;

/// Weekday bits, Monday = bit 0 .. Sunday = bit 6.
pub const WEEKDAY_MON: u8 = 0x01;
pub const WEEKDAY_SUN: u8 = 0x40;
pub const WEEKDAY_ALL: u8 = 0x7F;

/// Maximum scheduler label length (including terminator semantics of
/// the persisted record: 23 characters plus the implicit end).
pub const SCHED_LABEL_MAX: usize = 24;

/// Scheduler slot mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum SchedulerMode {
    /// Fires on local wall-clock time, optionally inside a window.
    #[default]
    RecurringClock = 0,
    /// Fires once at an absolute epoch, optionally inside a window.
    OneShotEpoch = 1,
}

/// Definition of one scheduler slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerSlot {
    pub slot: u8,
    pub event_id: u16,
    pub enabled: bool,
    pub mode: SchedulerMode,
    pub has_end: bool,
    pub replay_start_on_boot: bool,
    /// Weekday mask for the start side (Mon = bit 0).
    pub weekday_mask: u8,
    pub start_hour: u8,
    pub start_minute: u8,
    pub end_hour: u8,
    pub end_minute: u8,
    pub start_epoch_sec: u64,
    pub end_epoch_sec: u64,
    pub label: heapless::String<SCHED_LABEL_MAX>,
}

impl Default for SchedulerSlot {
    fn default() -> Self {
        Self {
            slot: 0,
            event_id: 0,
            enabled: false,
            mode: SchedulerMode::RecurringClock,
            has_end: false,
            replay_start_on_boot: false,
            weekday_mask: WEEKDAY_ALL,
            start_hour: 0,
            start_minute: 0,
            end_hour: 0,
            end_minute: 0,
            start_epoch_sec: 0,
            end_epoch_sec: 0,
            label: heapless::String::new(),
        }
    }
}

/// Scheduler table access exposed by the time module.
pub trait SchedulerService: Send + Sync {
    /// Install or replace a slot. System slots are rejected.
    fn set_slot(&self, def: &SchedulerSlot) -> bool;
    fn get_slot(&self, slot: u8) -> Option<SchedulerSlot>;
    fn clear_slot(&self, slot: u8) -> bool;
    fn clear_all(&self) -> bool;
    fn used_count(&self) -> u8;
    fn active_mask(&self) -> u16;
    fn is_active(&self, slot: u8) -> bool;
}

// ── Alarm contracts ───────────────────────────────────────────

/// Alarm severity, ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum AlarmSeverity {
    Info = 0,
    Warning = 1,
    Alarm = 2,
}

/// Tri-state condition result from an alarm evaluator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlarmCondState {
    Unknown,
    False,
    True,
}

impl AlarmCondState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::True => "true",
            Self::False => "false",
            Self::Unknown => "unknown",
        }
    }
}

/// Condition evaluator object for a registered alarm.
pub trait AlarmCondition: Send + Sync {
    fn evaluate(&self, now_ms: u64) -> AlarmCondState;
}

impl<F> AlarmCondition for F
where
    F: Fn(u64) -> AlarmCondState + Send + Sync,
{
    fn evaluate(&self, now_ms: u64) -> AlarmCondState {
        self(now_ms)
    }
}

/// Static registration data for one alarm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlarmRegistration {
    pub id: u16,
    pub severity: AlarmSeverity,
    /// Latched alarms stay active after the condition clears until acked.
    pub latched: bool,
    pub on_delay_ms: u32,
    pub off_delay_ms: u32,
    /// Short mnemonic code, e.g. `PMP_DRY`.
    pub code: heapless::String<12>,
    pub title: heapless::String<32>,
    /// Originating module id.
    pub origin: heapless::String<10>,
}

/// Alarm engine access for other modules.
pub trait AlarmService: Send + Sync {
    fn register_alarm(&self, def: &AlarmRegistration, cond: Arc<dyn AlarmCondition>) -> bool;
    fn ack(&self, id: u16) -> bool;
    fn ack_all(&self) -> u8;
    fn is_active(&self, id: u16) -> bool;
    fn is_acked(&self, id: u16) -> bool;
    fn active_count(&self) -> u8;
    fn highest_severity(&self) -> AlarmSeverity;
}

// ── IO contract ───────────────────────────────────────────────

/// Endpoint access exposed by the IO module for domain modules.
pub trait IoService: Send + Sync {
    fn read_digital(&self, endpoint: u8) -> Option<bool>;
    fn read_analog(&self, endpoint: u8) -> Option<f32>;
    /// Drive a digital output endpoint. `false` when the endpoint does
    /// not exist, is not an output, or the bus write failed.
    fn write_digital(&self, endpoint: u8, on: bool) -> bool;
}

// ── Registry ──────────────────────────────────────────────────

/// Tagged service handle. One variant per service the system offers.
#[derive(Clone)]
pub enum Service {
    EventBus(Arc<EventBus>),
    Config(Arc<ConfigStore>),
    Data(Arc<DataStore>),
    Command(Arc<CommandDispatcher>),
    LogHub(Arc<LogHub>),
    LogSinks(Arc<SinkRegistry>),
    Time(Arc<dyn TimeService>),
    Scheduler(Arc<dyn SchedulerService>),
    Alarms(Arc<dyn AlarmService>),
    Io(Arc<dyn IoService>),
}

struct Entry {
    id: heapless::String<MAX_SERVICE_ID>,
    service: Service,
}

/// Registry of named services.
pub struct ServiceRegistry {
    entries: heapless::Vec<Entry, MAX_SERVICES>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self {
            entries: heapless::Vec::new(),
        }
    }

    /// Register a service under a string id. Duplicate ids and overflow
    /// are rejected.
    pub fn add(&mut self, id: &str, service: Service) -> bool {
        if id.is_empty() || id.len() > MAX_SERVICE_ID {
            return false;
        }
        if self.entries.iter().any(|e| e.id.as_str() == id) {
            return false;
        }
        let mut key: heapless::String<MAX_SERVICE_ID> = heapless::String::new();
        let _ = key.push_str(id);
        self.entries
            .push(Entry { id: key, service })
            .is_ok()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn get(&self, id: &str) -> Option<&Service> {
        self.entries
            .iter()
            .find(|e| e.id.as_str() == id)
            .map(|e| &e.service)
    }

    pub fn event_bus(&self, id: &str) -> Option<Arc<EventBus>> {
        match self.get(id)? {
            Service::EventBus(b) => Some(b.clone()),
            _ => None,
        }
    }

    pub fn config(&self, id: &str) -> Option<Arc<ConfigStore>> {
        match self.get(id)? {
            Service::Config(c) => Some(c.clone()),
            _ => None,
        }
    }

    pub fn data(&self, id: &str) -> Option<Arc<DataStore>> {
        match self.get(id)? {
            Service::Data(d) => Some(d.clone()),
            _ => None,
        }
    }

    pub fn command(&self, id: &str) -> Option<Arc<CommandDispatcher>> {
        match self.get(id)? {
            Service::Command(c) => Some(c.clone()),
            _ => None,
        }
    }

    pub fn log_hub(&self, id: &str) -> Option<Arc<LogHub>> {
        match self.get(id)? {
            Service::LogHub(h) => Some(h.clone()),
            _ => None,
        }
    }

    pub fn log_sinks(&self, id: &str) -> Option<Arc<SinkRegistry>> {
        match self.get(id)? {
            Service::LogSinks(s) => Some(s.clone()),
            _ => None,
        }
    }

    pub fn time(&self, id: &str) -> Option<Arc<dyn TimeService>> {
        match self.get(id)? {
            Service::Time(t) => Some(t.clone()),
            _ => None,
        }
    }

    pub fn scheduler(&self, id: &str) -> Option<Arc<dyn SchedulerService>> {
        match self.get(id)? {
            Service::Scheduler(s) => Some(s.clone()),
            _ => None,
        }
    }

    pub fn alarms(&self, id: &str) -> Option<Arc<dyn AlarmService>> {
        match self.get(id)? {
            Service::Alarms(a) => Some(a.clone()),
            _ => None,
        }
    }

    pub fn io(&self, id: &str) -> Option<Arc<dyn IoService>> {
        match self.get(id)? {
            Service::Io(i) => Some(i.clone()),
            _ => None,
        }
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_and_typed_get() {
        let mut reg = ServiceRegistry::new();
        let bus = Arc::new(EventBus::new());
        assert!(reg.add("eventbus", Service::EventBus(bus)));
        assert!(reg.event_bus("eventbus").is_some());
        assert!(reg.event_bus("nope").is_none());
    }

    #[test]
    fn duplicate_id_rejected() {
        let mut reg = ServiceRegistry::new();
        let hub = Arc::new(LogHub::new());
        assert!(reg.add("loghub", Service::LogHub(hub.clone())));
        assert!(!reg.add("loghub", Service::LogHub(hub)));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn wrong_variant_returns_none() {
        let mut reg = ServiceRegistry::new();
        let hub = Arc::new(LogHub::new());
        assert!(reg.add("loghub", Service::LogHub(hub)));
        assert!(reg.event_bus("loghub").is_none());
        assert!(reg.log_hub("loghub").is_some());
    }

    #[test]
    fn capacity_bounded() {
        let mut reg = ServiceRegistry::new();
        for i in 0..MAX_SERVICES {
            let hub = Arc::new(LogHub::new());
            let id = format!("svc{}", i);
            assert!(reg.add(&id, Service::LogHub(hub)));
        }
        let hub = Arc::new(LogHub::new());
        assert!(!reg.add("one_too_many", Service::LogHub(hub)));
    }

    #[test]
    fn empty_or_oversized_id_rejected() {
        let mut reg = ServiceRegistry::new();
        let hub = Arc::new(LogHub::new());
        assert!(!reg.add("", Service::LogHub(hub.clone())));
        let long = "x".repeat(MAX_SERVICE_ID + 1);
        assert!(!reg.add(&long, Service::LogHub(hub)));
    }
}
