//! Boot wiring tests: dependency-ordered init across the real module
//! set, service availability, and the basic command surface.

use crate::rig::{boot_rig, run_cmd};

#[test]
fn init_order_places_dependencies_first() {
    let rig = boot_rig(1_700_000_000);
    let order = rig.manager.init_order();
    let pos = |id: &str| order.iter().position(|m| *m == id).unwrap();

    assert_eq!(pos("loghub"), 0, "only root module must come first");
    assert!(pos("eventbus") < pos("datastore"));
    assert!(pos("cmd") < pos("config"));
    assert!(pos("datastore") < pos("time"));
    assert!(pos("io") < pos("pool"));
    assert!(pos("alarms") < pos("pool"));
    assert!(pos("io") < pos("sensors"));
}

#[test]
fn all_services_published() {
    let rig = boot_rig(1_700_000_000);
    assert!(rig.services.log_hub("loghub").is_some());
    assert!(rig.services.log_sinks("logsinks").is_some());
    assert!(rig.services.event_bus("eventbus").is_some());
    assert!(rig.services.config("config").is_some());
    assert!(rig.services.data("datastore").is_some());
    assert!(rig.services.command("cmd").is_some());
    assert!(rig.services.time("time").is_some());
    assert!(rig.services.scheduler("time.scheduler").is_some());
    assert!(rig.services.alarms("alarms").is_some());
    assert!(rig.services.io("io").is_some());
}

#[test]
fn system_ping_answers() {
    let rig = boot_rig(1_700_000_000);
    let (ok, reply) = run_cmd(&rig, "system.ping", None);
    assert!(ok);
    assert_eq!(reply, "{\"ok\":true,\"pong\":true}");
}

#[test]
fn unknown_command_reports_error_object() {
    let rig = boot_rig(1_700_000_000);
    let (ok, reply) = run_cmd(&rig, "no.such.command", None);
    assert!(!ok);
    assert!(reply.contains("\"UnknownCmd\""));
    assert!(reply.contains("\"where\":\"no.such.command\""));
}

#[test]
fn scheduler_info_reports_reserved_slots() {
    let rig = boot_rig(1_700_000_000);
    let (ok, reply) = run_cmd(&rig, "time.scheduler.info", None);
    assert!(ok, "reply: {}", reply);
    // The three system slots are installed after config load.
    assert!(reply.contains("\"used\":3"), "reply: {}", reply);
}

#[test]
fn alarms_list_contains_pool_interlock_alarm() {
    let rig = boot_rig(1_700_000_000);
    let (ok, reply) = run_cmd(&rig, "alarms.list", None);
    assert!(ok);
    assert!(reply.contains("\"HTR_FLOW\""), "reply: {}", reply);
}

#[test]
fn pool_list_names_devices() {
    let rig = boot_rig(1_700_000_000);
    let (ok, reply) = run_cmd(&rig, "pool.list", None);
    assert!(ok);
    assert!(reply.contains("\"filtration\""));
    assert!(reply.contains("\"heater\""));
}

#[test]
fn reserved_scheduler_slot_rejected_over_commands() {
    let rig = boot_rig(1_700_000_000);
    let (ok, reply) = run_cmd(
        &rig,
        "time.scheduler.set",
        Some(serde_json::json!({"slot": 1, "event_id": 2001})),
    );
    assert!(!ok);
    assert!(reply.contains("\"ReservedSlot\""));

    let (ok, reply) = run_cmd(
        &rig,
        "time.scheduler.clear",
        Some(serde_json::json!({"slot": 0})),
    );
    assert!(!ok);
    assert!(reply.contains("\"ReservedSlot\""));
}

#[test]
fn scheduler_set_persists_blob_under_single_key() {
    let rig = boot_rig(1_700_000_000);
    let (ok, reply) = run_cmd(
        &rig,
        "time.scheduler.set",
        Some(serde_json::json!({
            "slot": 5,
            "event_id": 2001,
            "start_hour": 9,
            "start_minute": 30,
            "label": "morning"
        })),
    );
    assert!(ok, "reply: {}", reply);

    let blob = rig.cfg.get_text("time", "sched_blob").unwrap();
    assert!(blob.contains("morning"), "blob: {}", blob);
    let record = blob
        .split(';')
        .find(|r| r.starts_with("5,"))
        .expect("slot 5 record");
    let fields: Vec<&str> = record.split(',').collect();
    assert_eq!(fields[0], "5");
    assert_eq!(fields[1], "2001");
    assert_eq!(fields[4], "9");
    assert_eq!(fields[5], "30");
}

#[test]
fn interlock_blocked_reply_carries_slot() {
    let rig = boot_rig(1_700_000_000);
    // Heater (slot 1) without the pump running.
    let (ok, reply) = run_cmd(
        &rig,
        "pool.device",
        Some(serde_json::json!({"slot": 1, "mode": "on"})),
    );
    assert!(!ok);
    assert!(reply.contains("\"InterlockBlocked\""));
    assert!(reply.contains("\"slot\":1"));
    assert!(reply.contains("\"retryable\":false"));
}
