//! Schema migration tests across a simulated reboot: the backend
//! survives, a fresh config store runs the ladder again.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use poolflow::adapters::nvs::MemBackend;
use poolflow::core::config::{ConfigBackend, ConfigStore, MigrationStep, VERSION_KEY};

/// Backend handle that survives a "reboot" (a fresh [`ConfigStore`]).
struct SharedBackend(Arc<MemBackend>);

impl ConfigBackend for SharedBackend {
    fn get_i32(&self, key: &str, default: i32) -> i32 {
        self.0.get_i32(key, default)
    }
    fn put_i32(&self, key: &str, value: i32) -> usize {
        self.0.put_i32(key, value)
    }
    fn get_u8(&self, key: &str, default: u8) -> u8 {
        self.0.get_u8(key, default)
    }
    fn put_u8(&self, key: &str, value: u8) -> usize {
        self.0.put_u8(key, value)
    }
    fn get_bool(&self, key: &str, default: bool) -> bool {
        self.0.get_bool(key, default)
    }
    fn put_bool(&self, key: &str, value: bool) -> usize {
        self.0.put_bool(key, value)
    }
    fn get_f32(&self, key: &str, default: f32) -> f32 {
        self.0.get_f32(key, default)
    }
    fn put_f32(&self, key: &str, value: f32) -> usize {
        self.0.put_f32(key, value)
    }
    fn get_f64(&self, key: &str, default: f64) -> f64 {
        self.0.get_f64(key, default)
    }
    fn put_f64(&self, key: &str, value: f64) -> usize {
        self.0.put_f64(key, value)
    }
    fn get_u32(&self, key: &str, default: u32) -> u32 {
        self.0.get_u32(key, default)
    }
    fn put_u32(&self, key: &str, value: u32) -> usize {
        self.0.put_u32(key, value)
    }
    fn get_str(&self, key: &str) -> Option<String> {
        self.0.get_str(key)
    }
    fn put_str(&self, key: &str, value: &str) -> usize {
        self.0.put_str(key, value)
    }
    fn clear(&self) -> bool {
        self.0.clear()
    }
}

static STEP_RUNS: AtomicU32 = AtomicU32::new(0);

fn counted_step(backend: &dyn ConfigBackend) -> bool {
    STEP_RUNS.fetch_add(1, Ordering::Relaxed);
    backend.put_str("migrated", "yes");
    true
}

#[test]
fn step_runs_once_and_survives_reboot() {
    STEP_RUNS.store(0, Ordering::Relaxed);
    let flash = Arc::new(MemBackend::new());
    let steps = [MigrationStep {
        from: 0,
        to: 1,
        apply: counted_step,
    }];

    // First boot: stored version 0, one step to run.
    let cfg = ConfigStore::new(Box::new(SharedBackend(flash.clone())));
    assert!(cfg.run_migrations(1, &steps, VERSION_KEY, true));
    assert_eq!(STEP_RUNS.load(Ordering::Relaxed), 1);
    assert_eq!(flash.get_u32(VERSION_KEY, 0), 1);
    assert_eq!(flash.get_str("migrated").unwrap(), "yes");

    // Reboot: fresh store over the same flash; step must not re-run.
    let cfg = ConfigStore::new(Box::new(SharedBackend(flash.clone())));
    assert!(cfg.run_migrations(1, &steps, VERSION_KEY, true));
    assert_eq!(STEP_RUNS.load(Ordering::Relaxed), 1);
    assert_eq!(flash.get_u32(VERSION_KEY, 0), 1);
}

#[test]
fn multi_step_ladder_applies_in_order() {
    let flash = Arc::new(MemBackend::new());
    fn step_a(backend: &dyn ConfigBackend) -> bool {
        backend.put_str("trail", "a");
        true
    }
    fn step_b(backend: &dyn ConfigBackend) -> bool {
        let prev = backend.get_str("trail").unwrap_or_default();
        backend.put_str("trail", &format!("{}b", prev));
        true
    }
    let steps = [
        MigrationStep { from: 0, to: 1, apply: step_a },
        MigrationStep { from: 1, to: 2, apply: step_b },
    ];

    let cfg = ConfigStore::new(Box::new(SharedBackend(flash.clone())));
    assert!(cfg.run_migrations(2, &steps, VERSION_KEY, true));
    assert_eq!(flash.get_str("trail").unwrap(), "ab");
    assert_eq!(flash.get_u32(VERSION_KEY, 0), 2);
}

#[test]
fn missing_step_wipes_when_clear_on_fail() {
    let flash = Arc::new(MemBackend::new());
    flash.put_str("precious", "data");
    // Ladder has no step from version 0.
    let steps = [MigrationStep {
        from: 3,
        to: 4,
        apply: |_| true,
    }];

    let cfg = ConfigStore::new(Box::new(SharedBackend(flash.clone())));
    assert!(!cfg.run_migrations(4, &steps, VERSION_KEY, true));
    assert!(flash.get_str("precious").is_none());
    assert_eq!(flash.get_u32(VERSION_KEY, 9), 0);
}
