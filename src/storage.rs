// Persistence port for durable client-side state.
// Snapshots are stored as JSON strings under fixed keys; the interface is
// infallible on the write side, mirroring browser local-storage semantics.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Storage key for the booking store snapshot.
pub const BOOKING_STORAGE_KEY: &str = "booking-store";
/// Storage key for the session token/user.
pub const AUTH_STORAGE_KEY: &str = "auth-store";

pub trait StateStorage: Send + Sync {
    fn save(&self, key: &str, value: &str);
    fn load(&self, key: &str) -> Option<String>;
    fn remove(&self, key: &str);
}

/// In-memory storage, used in tests and as a default for hosts without a
/// durable backend.
#[derive(Default)]
pub struct MemoryStorage {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

impl StateStorage for MemoryStorage {
    fn save(&self, key: &str, value: &str) {
        self.entries
            .lock()
            .insert(key.to_string(), value.to_string());
    }

    fn load(&self, key: &str) -> Option<String> {
        self.entries.lock().get(key).cloned()
    }

    fn remove(&self, key: &str) {
        self.entries.lock().remove(key);
    }
}
