use std::sync::{Mutex, OnceLock};

/// Serializes tests that set variables consumed by `${VAR}` expansion in config files.
static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

/// Holds the env lock for the guard's lifetime. A panicking holder does not poison it.
pub fn env_lock() -> std::sync::MutexGuard<'static, ()> {
    ENV_LOCK
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}
