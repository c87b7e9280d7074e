use std::collections::HashMap;
use std::sync::Mutex;

/// Last-known value per `(deviceId, registerId)`, backing report-by-exception
/// and the periodic full refresh.
pub struct ValueCache {
    inner: Mutex<HashMap<(String, String), u16>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CachedValue {
    pub device_id: String,
    pub register_id: String,
    pub value: u16,
}

impl ValueCache {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Store a value and report whether it differs from the previous one.
    /// A register never seen before counts as changed.
    pub fn update(&self, device_id: &str, register_id: &str, value: u16) -> bool {
        let mut cache = self.inner.lock().unwrap();
        let key = (device_id.to_string(), register_id.to_string());
        match cache.insert(key, value) {
            Some(previous) => previous != value,
            None => true,
        }
    }

    /// Full snapshot for a full-refresh frame, in stable key order.
    pub fn snapshot(&self) -> Vec<CachedValue> {
        let cache = self.inner.lock().unwrap();
        let mut entries: Vec<CachedValue> = cache
            .iter()
            .map(|((device_id, register_id), value)| CachedValue {
                device_id: device_id.clone(),
                register_id: register_id.clone(),
                value: *value,
            })
            .collect();
        entries.sort_by(|a, b| {
            (a.device_id.as_str(), a.register_id.as_str())
                .cmp(&(b.device_id.as_str(), b.register_id.as_str()))
        });
        entries
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.inner.lock().unwrap().clear();
    }
}

impl Default for ValueCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_observation_counts_as_changed() {
        let cache = ValueCache::new();
        assert!(cache.update("dev-1", "r1", 10));
        assert!(!cache.update("dev-1", "r1", 10));
        assert!(cache.update("dev-1", "r1", 11));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_snapshot_is_sorted_and_complete() {
        let cache = ValueCache::new();
        cache.update("dev-2", "r1", 30);
        cache.update("dev-1", "r2", 20);
        cache.update("dev-1", "r1", 10);

        let snapshot = cache.snapshot();
        assert_eq!(snapshot.len(), 3);
        assert_eq!(snapshot[0].device_id, "dev-1");
        assert_eq!(snapshot[0].register_id, "r1");
        assert_eq!(snapshot[2].device_id, "dev-2");
    }
}
