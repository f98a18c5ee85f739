use std::sync::{Arc, Mutex};

use rustc_hash::FxHashMap;
use tokio::sync::RwLock;

use crate::Mode;

/// Per-instance bookkeeping shared by the reconciler, the readiness poller and admission checks.
#[derive(Debug, Default)]
pub struct InstanceState {
    mode: Mutex<Mode>,
    /// Held for writing while the instance or its status is being changed.
    pub lock: RwLock<()>,
}

impl InstanceState {
    pub fn mode(&self) -> Mode { self.mode.lock().map(|m| *m).unwrap_or_default() }

    pub fn set_mode(&self, mode: Mode) {
        if let Ok(mut m) = self.mode.lock() {
            *m = mode;
        }
    }
}

/// Instance states keyed by event key.
#[derive(Debug, Default)]
pub struct InstanceStates {
    states: Mutex<FxHashMap<String, Arc<InstanceState>>>,
}

impl InstanceStates {
    pub fn new() -> Self { Self::default() }

    /// State for `key`, created on first use.
    pub fn entry(&self, key: &str) -> Arc<InstanceState> {
        match self.states.lock() {
            Ok(mut states) => states.entry(key.to_string()).or_default().clone(),
            Err(_) => Arc::default(),
        }
    }

    pub fn get(&self, key: &str) -> Option<Arc<InstanceState>> { self.states.lock().ok()?.get(key).cloned() }

    pub fn remove(&self, key: &str) {
        if let Ok(mut states) = self.states.lock() {
            states.remove(key);
        }
    }

    pub fn len(&self) -> usize { self.states.lock().map(|s| s.len()).unwrap_or(0) }

    pub fn is_empty(&self) -> bool { self.len() == 0 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn entries_are_shared_until_removed() {
        let states = InstanceStates::new();
        let a = states.entry("ns/Backend.examples.com:a");
        a.set_mode(Mode::Static);
        assert_eq!(states.get("ns/Backend.examples.com:a").map(|s| s.mode()), Some(Mode::Static));

        let guard = a.lock.write().await;
        assert!(states.entry("ns/Backend.examples.com:a").lock.try_read().is_err());
        drop(guard);

        states.remove("ns/Backend.examples.com:a");
        assert!(states.get("ns/Backend.examples.com:a").is_none());
        assert_eq!(states.entry("ns/Backend.examples.com:a").mode(), Mode::Standard);
    }
}
