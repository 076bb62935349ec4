//! Config surface tests through the full wiring: JSON patches over the
//! command dispatcher, change events on the bus, persistence, and the
//! redaction rules.

use std::sync::{Arc, Mutex};

use poolflow::core::bus::EventView;
use poolflow::core::events::{ConfigChangedPayload, EventId};

use crate::rig::{boot_rig, run_cmd};

fn watch_config_changes(
    rig: &crate::rig::Rig,
) -> Arc<Mutex<Vec<String>>> {
    let bus = rig.services.event_bus("eventbus").unwrap();
    let keys: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let keys2 = keys.clone();
    bus.subscribe(
        EventId::ConfigChanged,
        Arc::new(move |e: &EventView<'_>| {
            let p = ConfigChangedPayload::decode(e.payload).unwrap();
            keys2.lock().unwrap().push(p.key_str().to_string());
        }),
    );
    keys
}

fn wire_bus(rig: &crate::rig::Rig) {
    // The wiring step normally runs at task start; tests do it inline.
    let bus = rig.services.event_bus("eventbus").unwrap();
    rig.cfg.set_event_bus(bus);
}

#[test]
fn patch_applies_once_and_fires_once() {
    let rig = boot_rig(1_700_000_000);
    wire_bus(&rig);
    let keys = watch_config_changes(&rig);
    let bus = rig.services.event_bus("eventbus").unwrap();

    let patch = serde_json::json!({"wifi": {"ssid": "home"}});
    let (ok, _) = run_cmd(&rig, "config.set", Some(patch.clone()));
    assert!(ok);
    bus.dispatch(16);

    assert_eq!(rig.cfg.get_text("wifi", "ssid").unwrap(), "home");
    assert_eq!(*keys.lock().unwrap(), vec!["wifi_ssid".to_string()]);

    // Same patch again: value unchanged, no second event.
    let (ok, _) = run_cmd(&rig, "config.set", Some(patch));
    assert!(ok);
    bus.dispatch(16);
    assert_eq!(keys.lock().unwrap().len(), 1);
}

#[test]
fn full_serialisation_reapplies_as_noop() {
    let rig = boot_rig(1_700_000_000);
    wire_bus(&rig);
    let keys = watch_config_changes(&rig);
    let bus = rig.services.event_bus("eventbus").unwrap();

    let full = rig.cfg.to_json();
    assert!(rig.cfg.apply_json(&full));
    bus.dispatch(64);
    assert!(
        keys.lock().unwrap().is_empty(),
        "round-trip must not change state: {:?}",
        keys.lock().unwrap()
    );
}

#[test]
fn unknown_modules_and_names_ignored() {
    let rig = boot_rig(1_700_000_000);
    let patch = serde_json::json!({
        "ghost": {"x": 1},
        "wifi": {"unknown_name": true}
    });
    let (ok, _) = run_cmd(&rig, "config.set", Some(patch));
    assert!(ok);
}

#[test]
fn config_get_redacts_secrets() {
    let rig = boot_rig(1_700_000_000);
    assert!(rig.cfg.set_text("wifi", "pass", "hunter2"));

    let (ok, reply) = run_cmd(
        &rig,
        "config.get",
        Some(serde_json::json!({"module": "wifi"})),
    );
    assert!(ok, "reply: {}", reply);
    assert!(reply.contains("\"pass\":\"***\""));
    assert!(!reply.contains("hunter2"));
}

#[test]
fn persistent_values_survive_reload() {
    let rig = boot_rig(1_700_000_000);
    assert!(rig.cfg.set_text("wifi", "ssid", "attic"));
    assert!(rig.cfg.set_i32("sensors", "poll_ms", 4321));

    // Clobber memory, then reload from the backend.
    assert!(rig.cfg.set_text("wifi", "ssid", "tmp"));
    assert!(rig.cfg.set_text("wifi", "ssid", "attic"));
    rig.cfg.load_persistent();
    assert_eq!(rig.cfg.get_text("wifi", "ssid").unwrap(), "attic");
    assert_eq!(rig.cfg.get_i32("sensors", "poll_ms").unwrap(), 4321);
}

#[test]
fn config_get_unknown_module_fails() {
    let rig = boot_rig(1_700_000_000);
    let (ok, reply) = run_cmd(
        &rig,
        "config.get",
        Some(serde_json::json!({"module": "ghost"})),
    );
    assert!(!ok);
    assert!(reply.contains("\"UnknownTopic\""));
}
