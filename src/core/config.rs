//! Persistent configuration store with JSON import/export.
//!
//! Modules register typed variable descriptors during init; the store
//! owns the value slots and is their single source of truth at runtime.
//! Persistent variables round-trip through a key-value backend
//! ([`ConfigBackend`]) with 15-character keys. JSON patches arrive as
//! nested objects grouped by module tag; unknown modules and names are
//! ignored.
//!
//! When a value actually changes the store notifies the variable's
//! change listeners on the caller's thread, persists if required, and
//! posts a `ConfigChanged` event carrying the key. No event fires for
//! a write that leaves the value unchanged.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use log::{debug, info, warn};
use serde_json::Value as Json;

use super::bus::EventBus;
use super::events::{ConfigChangedPayload, EventId};

/// Maximum number of registered variables.
pub const MAX_CONFIG_VARS: usize = 500;

/// Maximum backend key length (excluding any terminator).
pub const MAX_KEY_LEN: usize = 15;

/// Maximum change listeners per variable.
pub const MAX_HANDLERS: usize = 4;

/// Default backend key holding the schema version.
pub const VERSION_KEY: &str = "cfg_ver";

/// Names whose values are masked on the module JSON surface.
const REDACTED_NAMES: [&str; 3] = ["pass", "token", "secret"];

// ── Backend ───────────────────────────────────────────────────

/// Key-value persistence backend with per-type accessors.
///
/// `get_*` return the stored value or the supplied default; `put_*`
/// return the number of bytes written (0 on failure), which the store
/// feeds into its write-pressure counters.
pub trait ConfigBackend: Send + Sync {
    fn get_i32(&self, key: &str, default: i32) -> i32;
    fn put_i32(&self, key: &str, value: i32) -> usize;

    fn get_u8(&self, key: &str, default: u8) -> u8;
    fn put_u8(&self, key: &str, value: u8) -> usize;

    fn get_bool(&self, key: &str, default: bool) -> bool;
    fn put_bool(&self, key: &str, value: bool) -> usize;

    fn get_f32(&self, key: &str, default: f32) -> f32;
    fn put_f32(&self, key: &str, value: f32) -> usize;

    fn get_f64(&self, key: &str, default: f64) -> f64;
    fn put_f64(&self, key: &str, value: f64) -> usize;

    fn get_u32(&self, key: &str, default: u32) -> u32;
    fn put_u32(&self, key: &str, value: u32) -> usize;

    fn get_str(&self, key: &str) -> Option<String>;
    fn put_str(&self, key: &str, value: &str) -> usize;

    /// Wipe the whole namespace.
    fn clear(&self) -> bool;
}

// ── Values and descriptors ────────────────────────────────────

/// Tagged configuration value. One case per supported storage type, so
/// the descriptor table stays homogeneous.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigValue {
    I32(i32),
    U8(u8),
    Bool(bool),
    F32(f32),
    F64(f64),
    Text { value: String, max_len: usize },
}

/// Cut `s` to at most `max` characters, respecting char boundaries.
fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}

impl ConfigValue {
    /// Text value with a fixed capacity (characters of payload).
    pub fn text(default: &str, max_len: usize) -> Self {
        Self::Text {
            value: truncate_chars(default, max_len),
            max_len,
        }
    }

    fn same_kind(&self, other: &Self) -> bool {
        core::mem::discriminant(self) == core::mem::discriminant(other)
    }
}

/// Change listener object. Invoked on the mutating caller's thread with
/// the new value.
pub trait ConfigListener: Send + Sync {
    fn on_change(&self, value: &ConfigValue);
}

impl<F> ConfigListener for F
where
    F: Fn(&ConfigValue) + Send + Sync,
{
    fn on_change(&self, value: &ConfigValue) {
        self(value);
    }
}

/// Registration-time descriptor for one variable.
#[derive(Debug, Clone)]
pub struct VarDef {
    /// Module tag used as the JSON grouping key.
    pub module: &'static str,
    /// Field name inside the module object.
    pub name: &'static str,
    /// Backend key. Must be unique process-wide; required when
    /// `persistent` is set.
    pub key: &'static str,
    pub persistent: bool,
    /// Initial in-memory value, also the load default.
    pub value: ConfigValue,
}

struct Var {
    module: &'static str,
    name: &'static str,
    key: &'static str,
    persistent: bool,
    value: ConfigValue,
    listeners: heapless::Vec<Arc<dyn ConfigListener>, MAX_HANDLERS>,
}

/// Why a registration was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterError {
    TableFull,
    KeyTooLong,
    MissingKey,
    DuplicateKey,
    DuplicateName,
}

/// One schema migration step.
#[derive(Clone, Copy)]
pub struct MigrationStep {
    pub from: u32,
    pub to: u32,
    pub apply: fn(&dyn ConfigBackend) -> bool,
}

/// Pending side effects collected under the table lock and executed
/// after it is released, so listeners can safely call back in.
struct ChangeNotice {
    key: &'static str,
    value: ConfigValue,
    persist: bool,
    listeners: heapless::Vec<Arc<dyn ConfigListener>, MAX_HANDLERS>,
}

// ── Store ─────────────────────────────────────────────────────

/// Holds config variables, persistence, and JSON import/export.
pub struct ConfigStore {
    backend: Box<dyn ConfigBackend>,
    vars: Mutex<Vec<Var>>,
    bus: OnceLock<Arc<EventBus>>,
    write_total: AtomicU32,
    write_window: AtomicU32,
    last_summary_ms: AtomicU64,
}

impl ConfigStore {
    pub fn new(backend: Box<dyn ConfigBackend>) -> Self {
        Self {
            backend,
            vars: Mutex::new(Vec::new()),
            bus: OnceLock::new(),
            write_total: AtomicU32::new(0),
            write_window: AtomicU32::new(0),
            last_summary_ms: AtomicU64::new(0),
        }
    }

    /// Inject the event bus for change notifications. Done once during
    /// the wiring step; before that the store is silent.
    pub fn set_event_bus(&self, bus: Arc<EventBus>) {
        let _ = self.bus.set(bus);
    }

    // ── Registration ──────────────────────────────────────────

    /// Register a variable descriptor.
    pub fn register(&self, def: VarDef) -> Result<(), RegisterError> {
        if def.key.len() > MAX_KEY_LEN {
            warn!("config key too long: {}", def.key);
            return Err(RegisterError::KeyTooLong);
        }
        if def.persistent && def.key.is_empty() {
            return Err(RegisterError::MissingKey);
        }
        let mut vars = self.vars.lock().expect("config table poisoned");
        if vars.len() >= MAX_CONFIG_VARS {
            return Err(RegisterError::TableFull);
        }
        if !def.key.is_empty() && vars.iter().any(|v| v.key == def.key) {
            return Err(RegisterError::DuplicateKey);
        }
        if vars.iter().any(|v| v.module == def.module && v.name == def.name) {
            return Err(RegisterError::DuplicateName);
        }
        vars.push(Var {
            module: def.module,
            name: def.name,
            key: def.key,
            persistent: def.persistent,
            value: def.value,
            listeners: heapless::Vec::new(),
        });
        Ok(())
    }

    /// Attach a change listener to a registered variable.
    pub fn add_listener(
        &self,
        module: &str,
        name: &str,
        listener: Arc<dyn ConfigListener>,
    ) -> bool {
        let mut vars = self.vars.lock().expect("config table poisoned");
        match vars.iter_mut().find(|v| v.module == module && v.name == name) {
            Some(var) => var.listeners.push(listener).is_ok(),
            None => false,
        }
    }

    pub fn var_count(&self) -> usize {
        self.vars.lock().expect("config table poisoned").len()
    }

    // ── Reads ─────────────────────────────────────────────────

    pub fn get(&self, module: &str, name: &str) -> Option<ConfigValue> {
        let vars = self.vars.lock().expect("config table poisoned");
        vars.iter()
            .find(|v| v.module == module && v.name == name)
            .map(|v| v.value.clone())
    }

    pub fn get_i32(&self, module: &str, name: &str) -> Option<i32> {
        match self.get(module, name)? {
            ConfigValue::I32(v) => Some(v),
            _ => None,
        }
    }

    pub fn get_u8(&self, module: &str, name: &str) -> Option<u8> {
        match self.get(module, name)? {
            ConfigValue::U8(v) => Some(v),
            _ => None,
        }
    }

    pub fn get_bool(&self, module: &str, name: &str) -> Option<bool> {
        match self.get(module, name)? {
            ConfigValue::Bool(v) => Some(v),
            _ => None,
        }
    }

    pub fn get_f32(&self, module: &str, name: &str) -> Option<f32> {
        match self.get(module, name)? {
            ConfigValue::F32(v) => Some(v),
            _ => None,
        }
    }

    pub fn get_f64(&self, module: &str, name: &str) -> Option<f64> {
        match self.get(module, name)? {
            ConfigValue::F64(v) => Some(v),
            _ => None,
        }
    }

    pub fn get_text(&self, module: &str, name: &str) -> Option<String> {
        match self.get(module, name)? {
            ConfigValue::Text { value, .. } => Some(value),
            _ => None,
        }
    }

    // ── Writes ────────────────────────────────────────────────

    /// Set a variable to a new value of the same kind. Returns `false`
    /// when the variable is missing or the kinds differ; a write that
    /// leaves the value unchanged succeeds silently.
    pub fn set(&self, module: &str, name: &str, new: &ConfigValue) -> bool {
        let notice = {
            let mut vars = self.vars.lock().expect("config table poisoned");
            let Some(var) = vars.iter_mut().find(|v| v.module == module && v.name == name) else {
                return false;
            };
            if !var.value.same_kind(new) {
                return false;
            }
            let changed = match (&mut var.value, new) {
                (ConfigValue::Text { value, max_len }, ConfigValue::Text { value: s, .. }) => {
                    let incoming = truncate_chars(s, *max_len);
                    if *value == incoming {
                        false
                    } else {
                        *value = incoming;
                        true
                    }
                }
                (cur, incoming) => {
                    if *cur == *incoming {
                        false
                    } else {
                        *cur = incoming.clone();
                        true
                    }
                }
            };
            changed.then(|| ChangeNotice {
                key: var.key,
                value: var.value.clone(),
                persist: var.persistent && !var.key.is_empty(),
                listeners: var.listeners.clone(),
            })
        };

        if let Some(notice) = notice {
            self.apply_notice(&notice);
        }
        true
    }

    pub fn set_i32(&self, module: &str, name: &str, v: i32) -> bool {
        self.set(module, name, &ConfigValue::I32(v))
    }

    pub fn set_u8(&self, module: &str, name: &str, v: u8) -> bool {
        self.set(module, name, &ConfigValue::U8(v))
    }

    pub fn set_bool(&self, module: &str, name: &str, v: bool) -> bool {
        self.set(module, name, &ConfigValue::Bool(v))
    }

    pub fn set_f32(&self, module: &str, name: &str, v: f32) -> bool {
        self.set(module, name, &ConfigValue::F32(v))
    }

    pub fn set_f64(&self, module: &str, name: &str, v: f64) -> bool {
        self.set(module, name, &ConfigValue::F64(v))
    }

    pub fn set_text(&self, module: &str, name: &str, v: &str) -> bool {
        self.set(
            module,
            name,
            &ConfigValue::Text {
                value: v.to_string(),
                max_len: usize::MAX,
            },
        )
    }

    fn apply_notice(&self, notice: &ChangeNotice) {
        debug!("config changed: {}", notice.key);
        if notice.persist {
            self.persist_value(notice.key, &notice.value);
        }
        for l in notice.listeners.iter() {
            l.on_change(&notice.value);
        }
        if !notice.key.is_empty() {
            if let Some(bus) = self.bus.get() {
                let payload = ConfigChangedPayload::new(notice.key);
                let mut buf = [0u8; 16];
                let n = payload.encode(&mut buf);
                let _ = bus.post(EventId::ConfigChanged, &buf[..n]);
            }
        }
    }

    fn persist_value(&self, key: &str, value: &ConfigValue) {
        let wrote = match value {
            ConfigValue::I32(v) => self.backend.put_i32(key, *v),
            ConfigValue::U8(v) => self.backend.put_u8(key, *v),
            ConfigValue::Bool(v) => self.backend.put_bool(key, *v),
            ConfigValue::F32(v) => self.backend.put_f32(key, *v),
            ConfigValue::F64(v) => self.backend.put_f64(key, *v),
            ConfigValue::Text { value, .. } => self.backend.put_str(key, value),
        };
        self.record_write(wrote);
    }

    // ── Persistence ───────────────────────────────────────────

    /// Read every persistent variable from the backend, using the
    /// current in-memory value as default. No events fire.
    pub fn load_persistent(&self) {
        let mut vars = self.vars.lock().expect("config table poisoned");
        debug!("load_persistent: vars={}", vars.len());
        for var in vars.iter_mut().filter(|v| v.persistent && !v.key.is_empty()) {
            match &mut var.value {
                ConfigValue::I32(v) => *v = self.backend.get_i32(var.key, *v),
                ConfigValue::U8(v) => *v = self.backend.get_u8(var.key, *v),
                ConfigValue::Bool(v) => *v = self.backend.get_bool(var.key, *v),
                ConfigValue::F32(v) => *v = self.backend.get_f32(var.key, *v),
                ConfigValue::F64(v) => *v = self.backend.get_f64(var.key, *v),
                ConfigValue::Text { value, max_len } => {
                    if let Some(stored) = self.backend.get_str(var.key) {
                        *value = truncate_chars(&stored, *max_len);
                    }
                }
            }
        }
    }

    /// Write every persistent variable into the backend.
    pub fn save_persistent(&self) {
        let snapshot: Vec<(&'static str, ConfigValue)> = {
            let vars = self.vars.lock().expect("config table poisoned");
            debug!("save_persistent: vars={}", vars.len());
            vars.iter()
                .filter(|v| v.persistent && !v.key.is_empty())
                .map(|v| (v.key, v.value.clone()))
                .collect()
        };
        for (key, value) in &snapshot {
            self.persist_value(key, value);
        }
    }

    /// Wipe the backend namespace (factory reset path).
    pub fn erase_persistent(&self) -> bool {
        self.backend.clear()
    }

    // ── JSON surface ──────────────────────────────────────────

    /// Apply a nested patch `{module: {name: value}}`. Missing and
    /// unknown entries are ignored; values of the wrong JSON kind are
    /// skipped. Returns `false` only when the root is not an object.
    pub fn apply_json(&self, root: &Json) -> bool {
        let Some(root_obj) = root.as_object() else {
            return false;
        };
        debug!("apply_json: start");

        let notices = {
            let mut vars = self.vars.lock().expect("config table poisoned");
            let mut notices: Vec<ChangeNotice> = Vec::new();
            for var in vars.iter_mut() {
                let Some(val) = root_obj
                    .get(var.module)
                    .and_then(Json::as_object)
                    .and_then(|m| m.get(var.name))
                else {
                    continue;
                };
                fn store_if_differs<T: PartialEq + Copy>(cur: &mut T, parsed: Option<T>) -> bool {
                    match parsed {
                        Some(v) if *cur != v => {
                            *cur = v;
                            true
                        }
                        _ => false,
                    }
                }

                let changed = match &mut var.value {
                    ConfigValue::I32(cur) => store_if_differs(cur, val.as_i64().map(|v| v as i32)),
                    ConfigValue::U8(cur) => store_if_differs(cur, val.as_u64().map(|v| v as u8)),
                    ConfigValue::Bool(cur) => {
                        let parsed = match val {
                            Json::Bool(b) => Some(*b),
                            Json::Number(n) => n.as_i64().map(|v| v != 0),
                            _ => None,
                        };
                        store_if_differs(cur, parsed)
                    }
                    ConfigValue::F32(cur) => store_if_differs(cur, val.as_f64().map(|v| v as f32)),
                    ConfigValue::F64(cur) => store_if_differs(cur, val.as_f64()),
                    ConfigValue::Text { value, max_len } => match val.as_str() {
                        Some(s) => {
                            let incoming = truncate_chars(s, *max_len);
                            if *value == incoming {
                                false
                            } else {
                                *value = incoming;
                                true
                            }
                        }
                        None => false,
                    },
                };
                if changed {
                    debug!("apply_json: changed {}.{}", var.module, var.name);
                    notices.push(ChangeNotice {
                        key: var.key,
                        value: var.value.clone(),
                        persist: var.persistent && !var.key.is_empty(),
                        listeners: var.listeners.clone(),
                    });
                }
            }
            notices
        };

        for notice in &notices {
            self.apply_notice(notice);
        }
        debug!("apply_json: done");
        true
    }

    /// Serialize the whole table, nested by module tag. Applying the
    /// result back is a no-op on in-memory state.
    pub fn to_json(&self) -> Json {
        let vars = self.vars.lock().expect("config table poisoned");
        let mut root = serde_json::Map::new();
        for var in vars.iter() {
            let module = root
                .entry(var.module.to_string())
                .or_insert_with(|| Json::Object(serde_json::Map::new()));
            if let Some(obj) = module.as_object_mut() {
                obj.insert(var.name.to_string(), value_to_json(&var.value));
            }
        }
        Json::Object(root)
    }

    /// Serialize one module as a flat object into a bounded buffer.
    /// Values of redacted names are masked. Returns `(any, truncated)`.
    pub fn to_json_module<const N: usize>(
        &self,
        module: &str,
        out: &mut heapless::String<N>,
    ) -> (bool, bool) {
        use core::fmt::Write as _;

        fn emit<const N: usize>(out: &mut heapless::String<N>, s: &str, truncated: &mut bool) {
            if out.push_str(s).is_err() {
                *truncated = true;
            }
        }

        out.clear();
        let vars = self.vars.lock().expect("config table poisoned");
        let mut any = false;
        let mut truncated = false;

        emit(out, "{", &mut truncated);
        for var in vars.iter().filter(|v| v.module == module) {
            if truncated {
                break;
            }
            if any {
                emit(out, ",", &mut truncated);
            }
            let mut field: String = String::new();
            let _ = write!(field, "\"{}\":", var.name);
            match &var.value {
                ConfigValue::I32(v) => {
                    let _ = write!(field, "{}", v);
                }
                ConfigValue::U8(v) => {
                    let _ = write!(field, "{}", v);
                }
                ConfigValue::Bool(v) => {
                    let _ = write!(field, "{}", v);
                }
                ConfigValue::F32(v) => {
                    let _ = write!(field, "{:.3}", v);
                }
                ConfigValue::F64(v) => {
                    let _ = write!(field, "{:.6}", v);
                }
                ConfigValue::Text { value, .. } => {
                    if REDACTED_NAMES.contains(&var.name) {
                        let _ = write!(field, "\"***\"");
                    } else {
                        let quoted = serde_json::to_string(value).unwrap_or_default();
                        let _ = write!(field, "{}", quoted);
                    }
                }
            }
            emit(out, &field, &mut truncated);
            any = true;
        }
        if !truncated {
            emit(out, "}", &mut truncated);
        }
        (any, truncated)
    }

    /// Unique module tags present in the table, bounded by `max`.
    pub fn list_modules(&self, max: usize) -> Vec<&'static str> {
        let vars = self.vars.lock().expect("config table poisoned");
        let mut out: Vec<&'static str> = Vec::new();
        for var in vars.iter() {
            if out.len() >= max {
                break;
            }
            if !out.contains(&var.module) {
                out.push(var.module);
            }
        }
        out
    }

    // ── Migrations ────────────────────────────────────────────

    /// Bring the stored schema up to `current_version` by applying the
    /// ordered steps. The new version is persisted after each
    /// successful step. On a failed or missing step, `clear_on_fail`
    /// wipes the backend and resets the version to 0.
    pub fn run_migrations(
        &self,
        current_version: u32,
        steps: &[MigrationStep],
        version_key: &str,
        clear_on_fail: bool,
    ) -> bool {
        if steps.is_empty() {
            return false;
        }
        let key = if version_key.is_empty() { VERSION_KEY } else { version_key };

        let mut stored = self.backend.get_u32(key, 0);
        debug!("migrations: stored={} current={}", stored, current_version);

        if stored == current_version {
            return true;
        }
        if stored > current_version {
            // Firmware downgrade; refuse to touch the data.
            return false;
        }

        while stored < current_version {
            let Some(step) = steps.iter().find(|s| s.from == stored) else {
                if clear_on_fail {
                    let _ = self.backend.clear();
                    self.record_write(self.backend.put_u32(key, 0));
                }
                return false;
            };
            if !(step.apply)(self.backend.as_ref()) {
                warn!("migration failed: {} -> {}", step.from, step.to);
                if clear_on_fail {
                    let _ = self.backend.clear();
                    self.record_write(self.backend.put_u32(key, 0));
                }
                return false;
            }
            stored = step.to;
            self.record_write(self.backend.put_u32(key, stored));
            debug!("migration applied: now={}", stored);
        }

        self.record_write(self.backend.put_u32(key, current_version));
        debug!("migrations: completed at {}", current_version);
        true
    }

    // ── Write pressure ────────────────────────────────────────

    fn record_write(&self, bytes_written: usize) {
        if bytes_written == 0 {
            return;
        }
        self.write_total.fetch_add(1, Ordering::Relaxed);
        self.write_window.fetch_add(1, Ordering::Relaxed);
    }

    /// Emit a backend-write summary once per `period_ms`.
    pub fn log_pressure(&self, now_ms: u64, period_ms: u64) {
        if period_ms == 0 {
            return;
        }
        let last = self.last_summary_ms.load(Ordering::Relaxed);
        if last == 0 {
            self.last_summary_ms.store(now_ms.max(1), Ordering::Relaxed);
            return;
        }
        if now_ms.wrapping_sub(last) < period_ms {
            return;
        }
        self.last_summary_ms.store(now_ms, Ordering::Relaxed);
        let window = self.write_window.swap(0, Ordering::Relaxed);
        let total = self.write_total.load(Ordering::Relaxed);
        info!(
            "NVS writes: last_{}s={} total={}",
            period_ms / 1000,
            window,
            total
        );
    }

    /// Total backend writes since boot.
    pub fn write_total(&self) -> u32 {
        self.write_total.load(Ordering::Relaxed)
    }
}

fn value_to_json(value: &ConfigValue) -> Json {
    match value {
        ConfigValue::I32(v) => Json::from(*v),
        ConfigValue::U8(v) => Json::from(*v),
        ConfigValue::Bool(v) => Json::from(*v),
        ConfigValue::F32(v) => serde_json::Number::from_f64(f64::from(*v))
            .map(Json::Number)
            .unwrap_or(Json::Null),
        ConfigValue::F64(v) => serde_json::Number::from_f64(*v)
            .map(Json::Number)
            .unwrap_or(Json::Null),
        ConfigValue::Text { value, .. } => Json::String(value.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::nvs::MemBackend;
    use crate::core::events::ConfigChangedPayload;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;

    fn store() -> ConfigStore {
        ConfigStore::new(Box::new(MemBackend::new()))
    }

    fn wifi_ssid_def() -> VarDef {
        VarDef {
            module: "wifi",
            name: "ssid",
            key: "wifi_ssid",
            persistent: true,
            value: ConfigValue::text("default", 31),
        }
    }

    #[test]
    fn register_and_read_back() {
        let cfg = store();
        cfg.register(wifi_ssid_def()).unwrap();
        assert_eq!(cfg.get_text("wifi", "ssid").unwrap(), "default");
    }

    #[test]
    fn duplicate_key_rejected() {
        let cfg = store();
        cfg.register(wifi_ssid_def()).unwrap();
        let dup = VarDef {
            module: "other",
            name: "ssid2",
            key: "wifi_ssid",
            persistent: true,
            value: ConfigValue::text("x", 15),
        };
        assert_eq!(cfg.register(dup), Err(RegisterError::DuplicateKey));
    }

    #[test]
    fn key_length_enforced() {
        let cfg = store();
        let def = VarDef {
            module: "m",
            name: "n",
            key: "a_key_longer_than_fifteen",
            persistent: true,
            value: ConfigValue::I32(0),
        };
        assert_eq!(cfg.register(def), Err(RegisterError::KeyTooLong));
    }

    #[test]
    fn persistent_requires_key() {
        let cfg = store();
        let def = VarDef {
            module: "m",
            name: "n",
            key: "",
            persistent: true,
            value: ConfigValue::Bool(false),
        };
        assert_eq!(cfg.register(def), Err(RegisterError::MissingKey));
    }

    #[test]
    fn persistence_round_trip() {
        let cfg = store();
        cfg.register(VarDef {
            module: "pool",
            name: "target_temp",
            key: "pl_temp",
            persistent: true,
            value: ConfigValue::F32(26.0),
        })
        .unwrap();

        assert!(cfg.set_f32("pool", "target_temp", 28.5));
        // Overwrite in memory, then reload from the backend.
        {
            let mut vars = cfg.vars.lock().unwrap();
            vars[0].value = ConfigValue::F32(0.0);
        }
        cfg.load_persistent();
        assert_eq!(cfg.get_f32("pool", "target_temp").unwrap(), 28.5);
    }

    #[test]
    fn set_unchanged_posts_no_event() {
        let cfg = store();
        cfg.register(wifi_ssid_def()).unwrap();
        let bus = Arc::new(EventBus::new());
        cfg.set_event_bus(bus.clone());

        assert!(cfg.set_text("wifi", "ssid", "default"));
        assert_eq!(bus.pending(), 0);

        assert!(cfg.set_text("wifi", "ssid", "home"));
        assert_eq!(bus.pending(), 1);
    }

    #[test]
    fn apply_json_patch_fires_once() {
        let cfg = store();
        cfg.register(wifi_ssid_def()).unwrap();
        let bus = Arc::new(EventBus::new());
        cfg.set_event_bus(bus.clone());

        let keys: Arc<StdMutex<Vec<String>>> = Arc::new(StdMutex::new(Vec::new()));
        let keys2 = keys.clone();
        assert!(bus.subscribe(
            EventId::ConfigChanged,
            Arc::new(move |e: &crate::core::bus::EventView<'_>| {
                let p = ConfigChangedPayload::decode(e.payload).unwrap();
                keys2.lock().unwrap().push(p.key_str().to_string());
            }),
        ));

        assert!(cfg.apply_json(&json!({"wifi": {"ssid": "home"}})));
        bus.dispatch(8);
        assert_eq!(cfg.get_text("wifi", "ssid").unwrap(), "home");
        assert_eq!(*keys.lock().unwrap(), vec!["wifi_ssid".to_string()]);

        // Re-apply: no change, no event.
        assert!(cfg.apply_json(&json!({"wifi": {"ssid": "home"}})));
        bus.dispatch(8);
        assert_eq!(keys.lock().unwrap().len(), 1);
    }

    #[test]
    fn apply_json_ignores_unknown_entries() {
        let cfg = store();
        cfg.register(wifi_ssid_def()).unwrap();
        assert!(cfg.apply_json(&json!({"nope": {"x": 1}, "wifi": {"unknown": 2}})));
        assert_eq!(cfg.get_text("wifi", "ssid").unwrap(), "default");
    }

    #[test]
    fn full_serialise_then_apply_is_noop() {
        let cfg = store();
        cfg.register(wifi_ssid_def()).unwrap();
        cfg.register(VarDef {
            module: "alarms",
            name: "eval_period_ms",
            key: "al_period",
            persistent: true,
            value: ConfigValue::I32(250),
        })
        .unwrap();
        cfg.register(VarDef {
            module: "pool",
            name: "target_temp",
            key: "pl_temp",
            persistent: true,
            value: ConfigValue::F32(27.5),
        })
        .unwrap();
        let bus = Arc::new(EventBus::new());
        cfg.set_event_bus(bus.clone());

        let full = cfg.to_json();
        assert!(cfg.apply_json(&full));
        assert_eq!(bus.pending(), 0, "round-trip must not emit ConfigChanged");
    }

    #[test]
    fn text_respects_max_len() {
        let cfg = store();
        cfg.register(VarDef {
            module: "wifi",
            name: "hostname",
            key: "wifi_host",
            persistent: false,
            value: ConfigValue::text("pool", 8),
        })
        .unwrap();
        assert!(cfg.set_text("wifi", "hostname", "a_much_longer_hostname"));
        assert_eq!(cfg.get_text("wifi", "hostname").unwrap(), "a_much_l");
    }

    #[test]
    fn module_json_redacts_secrets() {
        let cfg = store();
        cfg.register(VarDef {
            module: "wifi",
            name: "pass",
            key: "wifi_pass",
            persistent: true,
            value: ConfigValue::text("hunter2", 31),
        })
        .unwrap();
        cfg.register(wifi_ssid_def()).unwrap();

        let mut out: heapless::String<256> = heapless::String::new();
        let (any, truncated) = cfg.to_json_module("wifi", &mut out);
        assert!(any);
        assert!(!truncated);
        assert!(out.as_str().contains("\"pass\":\"***\""));
        assert!(out.as_str().contains("\"ssid\":\"default\""));
        assert!(!out.as_str().contains("hunter2"));
    }

    #[test]
    fn module_json_reports_truncation() {
        let cfg = store();
        cfg.register(wifi_ssid_def()).unwrap();
        let mut out: heapless::String<8> = heapless::String::new();
        let (_, truncated) = cfg.to_json_module("wifi", &mut out);
        assert!(truncated);
    }

    #[test]
    fn listener_fires_on_change_only() {
        let cfg = store();
        cfg.register(wifi_ssid_def()).unwrap();
        let hits: Arc<StdMutex<u32>> = Arc::new(StdMutex::new(0));
        let hits2 = hits.clone();
        assert!(cfg.add_listener(
            "wifi",
            "ssid",
            Arc::new(move |_: &ConfigValue| {
                *hits2.lock().unwrap() += 1;
            }),
        ));
        assert!(cfg.set_text("wifi", "ssid", "home"));
        assert!(cfg.set_text("wifi", "ssid", "home"));
        assert_eq!(*hits.lock().unwrap(), 1);
    }

    #[test]
    fn migration_runs_once() {
        fn step_0_1(backend: &dyn ConfigBackend) -> bool {
            backend.put_u32("mig_marker", 1);
            true
        }
        let cfg = store();
        let steps = [MigrationStep {
            from: 0,
            to: 1,
            apply: step_0_1,
        }];

        assert!(cfg.run_migrations(1, &steps, VERSION_KEY, true));
        // Second run: already at version 1, step must not re-execute.
        assert!(cfg.run_migrations(1, &steps, VERSION_KEY, true));
        assert_eq!(cfg.backend.get_u32(VERSION_KEY, 0), 1);
    }

    #[test]
    fn failed_migration_clears_backend() {
        fn failing(_: &dyn ConfigBackend) -> bool {
            false
        }
        let cfg = store();
        cfg.backend.put_str("wifi_ssid", "home");
        let steps = [MigrationStep {
            from: 0,
            to: 1,
            apply: failing,
        }];
        assert!(!cfg.run_migrations(1, &steps, VERSION_KEY, true));
        assert_eq!(cfg.backend.get_u32(VERSION_KEY, 9), 0);
        assert!(cfg.backend.get_str("wifi_ssid").is_none());
    }

    #[test]
    fn downgrade_refused() {
        let cfg = store();
        cfg.backend.put_u32(VERSION_KEY, 5);
        let steps = [MigrationStep {
            from: 0,
            to: 1,
            apply: |_| true,
        }];
        assert!(!cfg.run_migrations(1, &steps, VERSION_KEY, true));
    }

    #[test]
    fn pressure_counter_tracks_writes() {
        let cfg = store();
        cfg.register(wifi_ssid_def()).unwrap();
        assert_eq!(cfg.write_total(), 0);
        assert!(cfg.set_text("wifi", "ssid", "home"));
        assert_eq!(cfg.write_total(), 1);
        // First call arms the window; second after the period logs.
        cfg.log_pressure(1_000, 60_000);
        cfg.log_pressure(62_000, 60_000);
        assert_eq!(cfg.write_total(), 1);
    }
}
