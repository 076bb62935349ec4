//! Alarm engine flow tests through the service and command surface:
//! debounced raise, latch across condition clear, ack, delayed clear.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use poolflow::adapters::clock::Clock;
use poolflow::core::bus::EventView;
use poolflow::core::events::{AlarmPayload, EventId};
use poolflow::core::services::{AlarmCondState, AlarmCondition, AlarmRegistration, AlarmSeverity};

use crate::rig::{Rig, boot_rig, run_cmd};

const TEST_ALARM_ID: u16 = 0x0420;

struct Lever(AtomicU8);

impl Lever {
    fn set(&self, s: AlarmCondState) {
        let raw = match s {
            AlarmCondState::Unknown => 0,
            AlarmCondState::False => 1,
            AlarmCondState::True => 2,
        };
        self.0.store(raw, Ordering::Relaxed);
    }
}

impl AlarmCondition for Lever {
    fn evaluate(&self, _now_ms: u64) -> AlarmCondState {
        match self.0.load(Ordering::Relaxed) {
            2 => AlarmCondState::True,
            1 => AlarmCondState::False,
            _ => AlarmCondState::Unknown,
        }
    }
}

fn register_latched(rig: &Rig) -> Arc<Lever> {
    let alarms = rig.services.alarms("alarms").unwrap();
    let lever = Arc::new(Lever(AtomicU8::new(1)));
    let mut code = heapless::String::new();
    code.push_str("WTR_HI").unwrap();
    let mut title = heapless::String::new();
    title.push_str("water level high").unwrap();
    let mut origin = heapless::String::new();
    origin.push_str("test").unwrap();
    assert!(alarms.register_alarm(
        &AlarmRegistration {
            id: TEST_ALARM_ID,
            severity: AlarmSeverity::Warning,
            latched: true,
            on_delay_ms: 1000,
            off_delay_ms: 1000,
            code,
            title,
            origin,
        },
        lever.clone(),
    ));
    lever
}

fn watch_alarm_events(rig: &Rig) -> Arc<Mutex<Vec<(EventId, u16)>>> {
    let bus = rig.services.event_bus("eventbus").unwrap();
    let log: Arc<Mutex<Vec<(EventId, u16)>>> = Arc::new(Mutex::new(Vec::new()));
    for id in [EventId::AlarmRaised, EventId::AlarmCleared, EventId::AlarmAcked] {
        let log2 = log.clone();
        bus.subscribe(
            id,
            Arc::new(move |e: &EventView<'_>| {
                let p = AlarmPayload::decode(e.payload).unwrap();
                log2.lock().unwrap().push((e.id, p.alarm_id));
            }),
        );
    }
    log
}

#[test]
fn latched_alarm_lifecycle_over_commands() {
    let rig = boot_rig(1_700_000_000);
    let lever = register_latched(&rig);
    let events = watch_alarm_events(&rig);
    let alarms = rig.services.alarms("alarms").unwrap();
    let bus = rig.services.event_bus("eventbus").unwrap();

    // t=0: condition goes true; raise debounced by on_delay.
    lever.set(AlarmCondState::True);
    rig.clock.advance_ms(0);
    step_engine(&rig);
    bus.dispatch(32);
    assert!(!alarms.is_active(TEST_ALARM_ID));

    // t=1000: raised.
    rig.clock.advance_ms(1_000);
    step_engine(&rig);
    bus.dispatch(32);
    assert!(alarms.is_active(TEST_ALARM_ID));
    assert_eq!(count(&events, EventId::AlarmRaised), 1);

    // t=2000: condition clears; latched + unacked keeps it active.
    rig.clock.advance_ms(1_000);
    lever.set(AlarmCondState::False);
    step_engine(&rig);
    bus.dispatch(32);
    rig.clock.advance_ms(1_000);
    step_engine(&rig);
    bus.dispatch(32);
    assert!(alarms.is_active(TEST_ALARM_ID));
    assert_eq!(count(&events, EventId::AlarmCleared), 0);

    // t=3000: ack over the command surface.
    let (ok, reply) = run_cmd(
        &rig,
        "alarms.ack",
        Some(serde_json::json!({"id": TEST_ALARM_ID})),
    );
    assert!(ok, "reply: {}", reply);
    bus.dispatch(32);
    assert_eq!(count(&events, EventId::AlarmAcked), 1);
    // off_delay != 0, so still active right after the ack.
    assert!(alarms.is_active(TEST_ALARM_ID));

    // Clear after the off-delay hysteresis.
    step_engine(&rig); // starts the off timer
    rig.clock.advance_ms(1_000);
    step_engine(&rig);
    bus.dispatch(32);
    assert!(!alarms.is_active(TEST_ALARM_ID));
    assert_eq!(count(&events, EventId::AlarmCleared), 1);
    // Exactly one raise per activation.
    assert_eq!(count(&events, EventId::AlarmRaised), 1);
}

#[test]
fn ack_all_command_reports_count() {
    let rig = boot_rig(1_700_000_000);
    let lever = register_latched(&rig);
    lever.set(AlarmCondState::True);
    step_engine(&rig); // arms the on-delay timer
    rig.clock.advance_ms(1_000);
    step_engine(&rig); // raises

    let (ok, reply) = run_cmd(&rig, "alarms.ack_all", None);
    assert!(ok);
    assert_eq!(reply, "{\"ok\":true,\"acked\":1}");
}

#[test]
fn ack_of_inactive_alarm_fails() {
    let rig = boot_rig(1_700_000_000);
    let _lever = register_latched(&rig);
    let (ok, reply) = run_cmd(
        &rig,
        "alarms.ack",
        Some(serde_json::json!({"id": TEST_ALARM_ID})),
    );
    assert!(!ok);
    assert!(reply.contains("\"Failed\""));
}

fn count(events: &Arc<Mutex<Vec<(EventId, u16)>>>, id: EventId) -> usize {
    events.lock().unwrap().iter().filter(|(e, _)| *e == id).count()
}

/// Run one evaluation pass at the rig clock's current time.
fn step_engine(rig: &Rig) {
    rig.alarm_core.evaluate_once(rig.clock.monotonic_ms());
}
