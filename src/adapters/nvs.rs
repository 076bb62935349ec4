//! NVS persistence adapter.
//!
//! Implements [`ConfigBackend`] for the config store.
//!
//! - **`target_os = "espidf"`** — wraps the ESP-IDF NVS API. Numeric
//!   types use their natural width; `f32`/`f64` go through blobs;
//!   strings are stored as NVS strings. Commits are atomic per write.
//! - **host** — an in-memory map with the same byte encodings, used by
//!   the test suite and simulation runs.

use std::sync::Mutex;

use crate::core::config::ConfigBackend;

#[cfg(not(target_os = "espidf"))]
use std::collections::HashMap;

#[cfg(target_os = "espidf")]
use esp_idf_svc::nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault};
#[cfg(target_os = "espidf")]
use log::{info, warn};

/// NVS namespace for all config keys.
#[cfg(target_os = "espidf")]
const NAMESPACE: &str = "poolflow";

// ── Host simulation backend ───────────────────────────────────

/// In-memory key-value backend mirroring NVS semantics.
#[cfg(not(target_os = "espidf"))]
pub struct MemBackend {
    store: Mutex<HashMap<String, Vec<u8>>>,
}

#[cfg(not(target_os = "espidf"))]
impl MemBackend {
    pub fn new() -> Self {
        Self {
            store: Mutex::new(HashMap::new()),
        }
    }

    fn get_bytes(&self, key: &str) -> Option<Vec<u8>> {
        self.store.lock().expect("backend poisoned").get(key).cloned()
    }

    fn put_bytes(&self, key: &str, bytes: &[u8]) -> usize {
        self.store
            .lock()
            .expect("backend poisoned")
            .insert(key.to_string(), bytes.to_vec());
        bytes.len()
    }
}

#[cfg(not(target_os = "espidf"))]
impl Default for MemBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(not(target_os = "espidf"))]
impl ConfigBackend for MemBackend {
    fn get_i32(&self, key: &str, default: i32) -> i32 {
        match self.get_bytes(key) {
            Some(b) if b.len() == 4 => i32::from_le_bytes([b[0], b[1], b[2], b[3]]),
            _ => default,
        }
    }

    fn put_i32(&self, key: &str, value: i32) -> usize {
        self.put_bytes(key, &value.to_le_bytes())
    }

    fn get_u8(&self, key: &str, default: u8) -> u8 {
        match self.get_bytes(key) {
            Some(b) if b.len() == 1 => b[0],
            _ => default,
        }
    }

    fn put_u8(&self, key: &str, value: u8) -> usize {
        self.put_bytes(key, &[value])
    }

    fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.get_bytes(key) {
            Some(b) if b.len() == 1 => b[0] != 0,
            _ => default,
        }
    }

    fn put_bool(&self, key: &str, value: bool) -> usize {
        self.put_bytes(key, &[u8::from(value)])
    }

    fn get_f32(&self, key: &str, default: f32) -> f32 {
        match self.get_bytes(key) {
            Some(b) if b.len() == 4 => f32::from_le_bytes([b[0], b[1], b[2], b[3]]),
            _ => default,
        }
    }

    fn put_f32(&self, key: &str, value: f32) -> usize {
        self.put_bytes(key, &value.to_le_bytes())
    }

    fn get_f64(&self, key: &str, default: f64) -> f64 {
        match self.get_bytes(key) {
            Some(b) if b.len() == 8 => f64::from_le_bytes([
                b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
            ]),
            _ => default,
        }
    }

    fn put_f64(&self, key: &str, value: f64) -> usize {
        self.put_bytes(key, &value.to_le_bytes())
    }

    fn get_u32(&self, key: &str, default: u32) -> u32 {
        match self.get_bytes(key) {
            Some(b) if b.len() == 4 => u32::from_le_bytes([b[0], b[1], b[2], b[3]]),
            _ => default,
        }
    }

    fn put_u32(&self, key: &str, value: u32) -> usize {
        self.put_bytes(key, &value.to_le_bytes())
    }

    fn get_str(&self, key: &str) -> Option<String> {
        let bytes = self.get_bytes(key)?;
        String::from_utf8(bytes).ok()
    }

    fn put_str(&self, key: &str, value: &str) -> usize {
        self.put_bytes(key, value.as_bytes()).max(1)
    }

    fn clear(&self) -> bool {
        self.store.lock().expect("backend poisoned").clear();
        true
    }
}

// ── ESP-IDF backend ───────────────────────────────────────────

/// NVS flash backend over the default partition.
#[cfg(target_os = "espidf")]
pub struct NvsBackend {
    nvs: Mutex<EspNvs<NvsDefault>>,
}

#[cfg(target_os = "espidf")]
impl NvsBackend {
    /// Open the default NVS partition. First boot creates the
    /// namespace.
    pub fn new() -> anyhow::Result<Self> {
        let partition = EspDefaultNvsPartition::take()?;
        let nvs = EspNvs::new(partition, NAMESPACE, true)?;
        info!("NvsBackend: namespace '{}' open", NAMESPACE);
        Ok(Self {
            nvs: Mutex::new(nvs),
        })
    }

    fn get_blob8(&self, key: &str) -> Option<[u8; 8]> {
        let nvs = self.nvs.lock().expect("nvs poisoned");
        let mut buf = [0u8; 8];
        match nvs.get_blob(key, &mut buf) {
            Ok(Some(b)) if b.len() == 8 => Some(buf),
            _ => None,
        }
    }
}

#[cfg(target_os = "espidf")]
impl ConfigBackend for NvsBackend {
    fn get_i32(&self, key: &str, default: i32) -> i32 {
        let nvs = self.nvs.lock().expect("nvs poisoned");
        nvs.get_i32(key).ok().flatten().unwrap_or(default)
    }

    fn put_i32(&self, key: &str, value: i32) -> usize {
        let mut nvs = self.nvs.lock().expect("nvs poisoned");
        match nvs.set_i32(key, value) {
            Ok(()) => 4,
            Err(e) => {
                warn!("NVS write failed key={}: {}", key, e);
                0
            }
        }
    }

    fn get_u8(&self, key: &str, default: u8) -> u8 {
        let nvs = self.nvs.lock().expect("nvs poisoned");
        nvs.get_u8(key).ok().flatten().unwrap_or(default)
    }

    fn put_u8(&self, key: &str, value: u8) -> usize {
        let mut nvs = self.nvs.lock().expect("nvs poisoned");
        match nvs.set_u8(key, value) {
            Ok(()) => 1,
            Err(e) => {
                warn!("NVS write failed key={}: {}", key, e);
                0
            }
        }
    }

    fn get_bool(&self, key: &str, default: bool) -> bool {
        self.get_u8(key, u8::from(default)) != 0
    }

    fn put_bool(&self, key: &str, value: bool) -> usize {
        self.put_u8(key, u8::from(value))
    }

    fn get_f32(&self, key: &str, default: f32) -> f32 {
        let nvs = self.nvs.lock().expect("nvs poisoned");
        let mut buf = [0u8; 4];
        match nvs.get_blob(key, &mut buf) {
            Ok(Some(b)) if b.len() == 4 => f32::from_le_bytes(buf),
            _ => default,
        }
    }

    fn put_f32(&self, key: &str, value: f32) -> usize {
        let mut nvs = self.nvs.lock().expect("nvs poisoned");
        match nvs.set_blob(key, &value.to_le_bytes()) {
            Ok(()) => 4,
            Err(e) => {
                warn!("NVS write failed key={}: {}", key, e);
                0
            }
        }
    }

    fn get_f64(&self, key: &str, default: f64) -> f64 {
        match self.get_blob8(key) {
            Some(b) => f64::from_le_bytes(b),
            None => default,
        }
    }

    fn put_f64(&self, key: &str, value: f64) -> usize {
        let mut nvs = self.nvs.lock().expect("nvs poisoned");
        match nvs.set_blob(key, &value.to_le_bytes()) {
            Ok(()) => 8,
            Err(e) => {
                warn!("NVS write failed key={}: {}", key, e);
                0
            }
        }
    }

    fn get_u32(&self, key: &str, default: u32) -> u32 {
        let nvs = self.nvs.lock().expect("nvs poisoned");
        nvs.get_u32(key).ok().flatten().unwrap_or(default)
    }

    fn put_u32(&self, key: &str, value: u32) -> usize {
        let mut nvs = self.nvs.lock().expect("nvs poisoned");
        match nvs.set_u32(key, value) {
            Ok(()) => 4,
            Err(e) => {
                warn!("NVS write failed key={}: {}", key, e);
                0
            }
        }
    }

    fn get_str(&self, key: &str) -> Option<String> {
        let nvs = self.nvs.lock().expect("nvs poisoned");
        let mut buf = [0u8; 256];
        match nvs.get_str(key, &mut buf) {
            Ok(Some(s)) => Some(s.to_string()),
            _ => None,
        }
    }

    fn put_str(&self, key: &str, value: &str) -> usize {
        let mut nvs = self.nvs.lock().expect("nvs poisoned");
        match nvs.set_str(key, value) {
            Ok(()) => value.len().max(1),
            Err(e) => {
                warn!("NVS write failed key={}: {}", key, e);
                0
            }
        }
    }

    fn clear(&self) -> bool {
        // The safe wrapper has no bulk erase; go through the IDF C API.
        // Callers restart right after, so the open handle going stale
        // is acceptable.
        let _nvs = self.nvs.lock().expect("nvs poisoned");
        unsafe { esp_idf_svc::sys::nvs_flash_erase() == esp_idf_svc::sys::ESP_OK }
    }
}
