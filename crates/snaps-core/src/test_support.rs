use std::sync::{Mutex, MutexGuard};

use once_cell::sync::Lazy;

static ENV_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

/// Every `SNAPS_*` variable `Config::apply_env_overrides` reads.
pub const CONFIG_ENV_KEYS: &[&str] = &[
    "SNAPS_MAX_REQUEST_TIME_MS",
    "SNAPS_MAX_IDLE_TIME_MS",
    "SNAPS_IDLE_CHECK_INTERVAL_MS",
    "SNAPS_MAX_QUEUE_SIZE",
    "SNAPS_TERMINATION_TIMEOUT_MS",
];

/// Exclusive access to the config overrides, starting with all of them unset. Previous values
/// come back on drop.
pub struct ConfigEnv {
    _lock: MutexGuard<'static, ()>,
    saved: Vec<(&'static str, Option<String>)>,
}

impl ConfigEnv {
    pub fn clean() -> Self {
        let lock = ENV_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let saved = CONFIG_ENV_KEYS
            .iter()
            .map(|&key| (key, std::env::var(key).ok()))
            .collect();
        for key in CONFIG_ENV_KEYS {
            std::env::remove_var(key);
        }
        Self { _lock: lock, saved }
    }

    pub fn set(&mut self, key: &'static str, value: &str) -> &mut Self {
        assert!(CONFIG_ENV_KEYS.contains(&key), "{key} is not a config override");
        std::env::set_var(key, value);
        self
    }
}

impl Drop for ConfigEnv {
    fn drop(&mut self) {
        for (key, value) in self.saved.drain(..) {
            match value {
                Some(value) => std::env::set_var(key, value),
                None => std::env::remove_var(key),
            }
        }
    }
}
