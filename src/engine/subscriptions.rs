//! Bookkeeping for live queries: which storage locations each outstanding
//! query tree is subscribed to, and under which adapter handles.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::storage::SubscriptionHandle;

/// Placeholder recorded while an adapter subscribe call is in flight, so a
/// concurrent composition of the same location does not subscribe twice.
const PENDING: SubscriptionHandle = SubscriptionHandle(u64::MAX);

/// Single source of truth for what is currently subscribed per live query.
///
/// Keyed by query-tree id, then by storage location. Mutated only under the
/// mutex and never across an await point.
#[derive(Default)]
pub struct SubscriptionRegistry {
    entries: Mutex<HashMap<String, HashMap<String, SubscriptionHandle>>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically claims a location for a query. Returns false if the
    /// location is already subscribed (or being subscribed) for this query,
    /// making re-subscription idempotent.
    pub fn reserve(&self, query_id: &str, location: &str) -> bool {
        let mut entries = self.entries.lock().expect("subscription registry poisoned");
        let locations = entries.entry(query_id.to_string()).or_default();
        if locations.contains_key(location) {
            return false;
        }
        locations.insert(location.to_string(), PENDING);
        true
    }

    /// Records the adapter handle for a previously reserved location.
    pub fn fulfill(&self, query_id: &str, location: &str, handle: SubscriptionHandle) {
        let mut entries = self.entries.lock().expect("subscription registry poisoned");
        if let Some(locations) = entries.get_mut(query_id) {
            locations.insert(location.to_string(), handle);
        }
    }

    /// Drops a reservation whose subscribe call failed.
    pub fn release(&self, query_id: &str, location: &str) {
        let mut entries = self.entries.lock().expect("subscription registry poisoned");
        if let Some(locations) = entries.get_mut(query_id) {
            locations.remove(location);
        }
    }

    /// Removes and returns every (location, handle) pair recorded for a
    /// query. Returns `None` for a query id never registered.
    pub fn drain(&self, query_id: &str) -> Option<Vec<(String, SubscriptionHandle)>> {
        let mut entries = self.entries.lock().expect("subscription registry poisoned");
        entries.remove(query_id).map(|locations| {
            locations
                .into_iter()
                .filter(|(_, handle)| *handle != PENDING)
                .collect()
        })
    }

    #[cfg(test)]
    pub fn location_count(&self, query_id: &str) -> usize {
        let entries = self.entries.lock().expect("subscription registry poisoned");
        entries.get(query_id).map(HashMap::len).unwrap_or(0)
    }
}
