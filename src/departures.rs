//! In-memory registry of active departures reported by drivers.
//!
//! One record per route; a new report for the same route overwrites the
//! previous one.  Routes match the way route lookup does, so `"lijn 6"` and
//! `"Lijn 6"` share a record.  Nothing is persisted.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

use crate::error::AnnounceError;
use crate::station::canonical_name;

/// The latest departure report for a route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DepartureRecord {
    pub route_name: String,
    pub driver: String,
    pub depart_time: String,
    pub reported_at: DateTime<Utc>,
}

/// Canonical route key → latest departure record.
pub struct DepartureRegistry {
    records: DashMap<String, DepartureRecord>,
}

impl DepartureRegistry {
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
        }
    }

    /// Insert or replace the record for `route_name`.
    pub fn upsert(
        &self,
        route_name: &str,
        driver: &str,
        depart_time: &str,
    ) -> Result<DepartureRecord, AnnounceError> {
        let route_name = route_name.trim();
        let driver = driver.trim();
        let depart_time = depart_time.trim();

        if route_name.is_empty() || driver.is_empty() || depart_time.is_empty() {
            return Err(AnnounceError::InvalidRequest(
                "Missing routeName, driver or departTime".to_string(),
            ));
        }

        let record = DepartureRecord {
            route_name: route_name.to_string(),
            driver: driver.to_string(),
            depart_time: depart_time.to_string(),
            reported_at: Utc::now(),
        };
        let key = match canonical_name(route_name) {
            key if key.is_empty() => route_name.to_string(),
            key => key,
        };
        self.records.insert(key, record.clone());
        Ok(record)
    }

    /// Snapshot of all records, sorted by route name.
    pub fn list(&self) -> Vec<DepartureRecord> {
        let mut out: Vec<DepartureRecord> =
            self.records.iter().map(|r| r.value().clone()).collect();
        out.sort_by(|a, b| a.route_name.cmp(&b.route_name));
        out
    }

    /// Drop every record.
    pub fn reset(&self) {
        self.records.clear();
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl Default for DepartureRegistry {
    fn default() -> Self {
        Self::new()
    }
}
