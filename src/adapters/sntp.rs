//! Network time-sync backend.
//!
//! The time module drives a [`SyncBackend`] whenever its state machine
//! enters `Syncing`. The ESP implementation blocks on SNTP completion
//! (bounded wait); the host implementation is scripted so tests can
//! exercise success, failure, and the retry ladder.

/// One blocking sync attempt against the configured servers.
/// Returns the freshly obtained epoch seconds, or `None` on failure.
pub trait SyncBackend: Send {
    fn sync(&mut self, server1: &str, server2: &str) -> Option<u64>;
}

/// SNTP backend over ESP-IDF.
#[cfg(target_os = "espidf")]
pub struct EspSntpBackend {
    timeout_ms: u32,
}

#[cfg(target_os = "espidf")]
impl EspSntpBackend {
    pub fn new() -> Self {
        Self { timeout_ms: 4000 }
    }
}

#[cfg(target_os = "espidf")]
impl Default for EspSntpBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(target_os = "espidf")]
impl SyncBackend for EspSntpBackend {
    fn sync(&mut self, server1: &str, server2: &str) -> Option<u64> {
        use esp_idf_svc::sntp::{EspSntp, SntpConf, SyncStatus};

        let mut conf = SntpConf::default();
        conf.servers = [server1, server2, "", ""];
        let sntp = EspSntp::new(&conf).ok()?;

        let mut waited = 0u32;
        while sntp.get_sync_status() != SyncStatus::Completed {
            if waited >= self.timeout_ms {
                return None;
            }
            std::thread::sleep(std::time::Duration::from_millis(100));
            waited += 100;
        }

        let mut tv = esp_idf_svc::sys::timeval { tv_sec: 0, tv_usec: 0 };
        if unsafe { esp_idf_svc::sys::gettimeofday(&mut tv, core::ptr::null_mut()) } != 0 {
            return None;
        }
        Some(tv.tv_sec as u64)
    }
}

/// Scripted backend for host runs and tests: pops one canned result
/// per attempt, repeating the last one when the script runs out.
pub struct SimSyncBackend {
    script: Vec<Option<u64>>,
    pos: usize,
    pub attempts: u32,
}

impl SimSyncBackend {
    pub fn new(script: Vec<Option<u64>>) -> Self {
        Self {
            script,
            pos: 0,
            attempts: 0,
        }
    }

    /// Backend that always succeeds with the given epoch.
    pub fn always(epoch: u64) -> Self {
        Self::new(vec![Some(epoch)])
    }

    /// Backend that always fails.
    pub fn failing() -> Self {
        Self::new(vec![None])
    }
}

impl SyncBackend for SimSyncBackend {
    fn sync(&mut self, _server1: &str, _server2: &str) -> Option<u64> {
        self.attempts += 1;
        let result = self
            .script
            .get(self.pos)
            .copied()
            .or_else(|| self.script.last().copied())
            .flatten();
        if self.pos + 1 < self.script.len() {
            self.pos += 1;
        }
        result
    }
}
