//! Shared test utilities used across multiple test modules.

use std::ffi::OsString;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

static ENV_LOCK: Mutex<()> = Mutex::new(());

/// Points `VOICEMODE_HOME` at a fresh temp directory and holds a
/// process-wide lock so env-mutating tests never interleave. The previous
/// value is restored on drop.
pub struct HomeGuard {
    _lock: MutexGuard<'static, ()>,
    previous: Option<OsString>,
    dir: tempfile::TempDir,
}

impl HomeGuard {
    pub fn new() -> Self {
        let lock = ENV_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
        let dir = tempfile::tempdir().expect("create temp home");
        let previous = std::env::var_os("VOICEMODE_HOME");
        // SAFETY: ENV_LOCK serializes all VOICEMODE_HOME mutations in tests.
        unsafe { std::env::set_var("VOICEMODE_HOME", dir.path()) };
        Self {
            _lock: lock,
            previous,
            dir,
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}

impl Drop for HomeGuard {
    fn drop(&mut self) {
        match self.previous.take() {
            // SAFETY: still holding ENV_LOCK.
            Some(val) => unsafe { std::env::set_var("VOICEMODE_HOME", val) },
            None => unsafe { std::env::remove_var("VOICEMODE_HOME") },
        }
    }
}
