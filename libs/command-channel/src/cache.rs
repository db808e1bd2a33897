//! Persisted handshake state, so a restarted process can resume signing
//! without a session-info round trip.

use chrono::{DateTime, Utc};
use fleetlink_model::{Domain, VehicleId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One domain's exported session info for one vehicle.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub created_at: DateTime<Utc>,
    pub domain: i32,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

impl CacheEntry {
    pub fn new(domain: Domain, data: Vec<u8>, created_at: DateTime<Utc>) -> Self {
        Self {
            created_at,
            domain: domain as i32,
            data,
        }
    }
}

/// Bounded per-vehicle store of session-info blobs.
///
/// When full, the vehicle whose freshest entry is oldest gets evicted.
/// Entries are only meaningful to the private key that produced them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionCache {
    #[serde(rename = "MaxEntries")]
    max_entries: usize,
    vehicles: HashMap<String, Vec<CacheEntry>>,
}

impl SessionCache {
    /// `max_entries` bounds the number of vehicles; zero means unbounded.
    pub fn new(max_entries: usize) -> Self {
        Self {
            max_entries,
            vehicles: HashMap::new(),
        }
    }

    /// Replaces all of `vehicle`'s entries.
    pub fn update(&mut self, vehicle: &VehicleId, entries: Vec<CacheEntry>) {
        self.vehicles.insert(vehicle.as_str().to_owned(), entries);
        self.evict();
    }

    /// Upserts one domain's entry, leaving the vehicle's other domains
    /// untouched.
    pub fn update_domain(&mut self, vehicle: &VehicleId, entry: CacheEntry) {
        let entries = self
            .vehicles
            .entry(vehicle.as_str().to_owned())
            .or_default();

        match entries.iter_mut().find(|e| e.domain == entry.domain) {
            Some(existing) => *existing = entry,
            None => entries.push(entry),
        }

        self.evict();
    }

    pub fn get(&self, vehicle: &VehicleId) -> Option<&[CacheEntry]> {
        self.vehicles.get(vehicle.as_str()).map(Vec::as_slice)
    }

    pub fn get_domain(&self, vehicle: &VehicleId, domain: Domain) -> Option<&CacheEntry> {
        self.vehicles
            .get(vehicle.as_str())?
            .iter()
            .find(|entry| entry.domain == domain as i32)
    }

    pub fn remove(&mut self, vehicle: &VehicleId) {
        self.vehicles.remove(vehicle.as_str());
    }

    pub fn len(&self) -> usize {
        self.vehicles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vehicles.is_empty()
    }

    pub fn export(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn import(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    fn evict(&mut self) {
        if self.max_entries == 0 {
            return;
        }

        while self.vehicles.len() > self.max_entries {
            let Some(victim) = self
                .vehicles
                .iter()
                .min_by_key(|(_, entries)| entries.iter().map(|e| e.created_at).max())
                .map(|(vin, _)| vin.clone())
            else {
                return;
            };

            tracing::debug!(vehicle = %victim, "Evicting oldest cached session");
            self.vehicles.remove(&victim);
        }
    }
}

mod base64_bytes {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize as _, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;

        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;
    use proptest::prelude::*;

    fn vin(i: usize) -> VehicleId {
        VehicleId::new(format!("5YJ30000000{i:04}"))
    }

    fn entry(at: DateTime<Utc>) -> CacheEntry {
        CacheEntry::new(Domain::VehicleSecurity, vec![1, 2, 3], at)
    }

    #[test]
    fn bounded_cache_evicts_the_stalest_vehicle() {
        let t0 = Utc::now();
        let mut cache = SessionCache::new(2);

        cache.update(&vin(1), vec![entry(t0)]);
        cache.update(&vin(2), vec![entry(t0 + TimeDelta::seconds(10))]);
        cache.update(&vin(3), vec![entry(t0 + TimeDelta::seconds(5))]);

        assert_eq!(cache.len(), 2);
        assert!(cache.get(&vin(1)).is_none());
        assert!(cache.get(&vin(2)).is_some());
        assert!(cache.get(&vin(3)).is_some());
    }

    #[test]
    fn freshest_entry_counts_for_eviction() {
        let t0 = Utc::now();
        let mut cache = SessionCache::new(2);

        // Vehicle 1 has an old entry and a fresh one; the fresh one is
        // what keeps it alive.
        cache.update(
            &vin(1),
            vec![
                entry(t0 - TimeDelta::days(30)),
                entry(t0 + TimeDelta::seconds(60)),
            ],
        );
        cache.update(&vin(2), vec![entry(t0)]);
        cache.update(&vin(3), vec![entry(t0 + TimeDelta::seconds(30))]);

        assert!(cache.get(&vin(1)).is_some());
        assert!(cache.get(&vin(2)).is_none());
    }

    #[test]
    fn update_domain_keeps_other_domains() {
        let t0 = Utc::now();
        let mut cache = SessionCache::new(0);

        cache.update_domain(
            &vin(1),
            CacheEntry::new(Domain::VehicleSecurity, vec![1], t0),
        );
        cache.update_domain(&vin(1), CacheEntry::new(Domain::Infotainment, vec![2], t0));
        cache.update_domain(
            &vin(1),
            CacheEntry::new(Domain::VehicleSecurity, vec![3], t0),
        );

        assert_eq!(cache.get(&vin(1)).unwrap().len(), 2);
        assert_eq!(
            cache
                .get_domain(&vin(1), Domain::VehicleSecurity)
                .unwrap()
                .data,
            vec![3]
        );
    }

    #[test]
    fn json_schema_is_stable() {
        let at = "2024-06-01T10:20:30Z".parse::<DateTime<Utc>>().unwrap();
        let mut cache = SessionCache::new(5);
        cache.update(
            &vin(1),
            vec![CacheEntry::new(Domain::VehicleSecurity, vec![0xAB, 0xCD], at)],
        );

        let json: serde_json::Value = serde_json::from_str(&cache.export().unwrap()).unwrap();

        assert_eq!(json["MaxEntries"], 5);
        let entry = &json["vehicles"][vin(1).as_str()][0];
        assert_eq!(entry["domain"], Domain::VehicleSecurity as i32);
        assert_eq!(entry["data"], "q80=");
        assert!(
            entry["created_at"]
                .as_str()
                .unwrap()
                .starts_with("2024-06-01T10:20:30")
        );

        let restored = SessionCache::import(&cache.export().unwrap()).unwrap();
        assert_eq!(restored, cache);
    }

    proptest! {
        #[test]
        fn cardinality_and_survivors_follow_recency(
            updates in proptest::collection::vec(0usize..12, 1..64),
            max_entries in 1usize..6,
        ) {
            let t0 = Utc::now();
            let mut cache = SessionCache::new(max_entries);
            let mut latest: HashMap<usize, i64> = HashMap::new();

            // Entries are stamped with the time of their update, as the
            // dispatcher stamps them.
            for (tick, vehicle) in updates.into_iter().enumerate() {
                let at = t0 + TimeDelta::seconds(tick as i64);
                cache.update(&vin(vehicle), vec![entry(at)]);
                latest.insert(vehicle, tick as i64);
            }

            prop_assert_eq!(cache.len(), latest.len().min(max_entries));

            // The survivors are exactly the most recently updated vehicles.
            let mut by_recency: Vec<_> = latest.iter().collect();
            by_recency.sort_by_key(|(_, tick)| std::cmp::Reverse(**tick));

            for (vehicle, _) in by_recency.into_iter().take(cache.len()) {
                prop_assert!(cache.get(&vin(*vehicle)).is_some(), "vehicle {} missing", vehicle);
            }
        }
    }
}
