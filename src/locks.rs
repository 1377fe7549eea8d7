//! Per-unit async locks.
//!
//! Upload, re-index and delete of one unit run one at a time; different
//! units never wait on each other.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Default)]
pub struct UnitLocks {
    units: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl UnitLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `unit`.
    pub async fn lock(&self, unit: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut units = self.units.lock().await;
            // Entries nobody holds or waits on can go.
            units.retain(|key, l| key == unit || Arc::strong_count(l) > 1);
            units.entry(unit.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }
}
