//! Incident Store. An in-memory, FIFO-bounded ledger of confirmed spikes
//! and their (possibly still-pending) RCA reports: an `AtomicU64` id
//! counter guarding a `RwLock`-protected map. Explicitly in-memory only —
//! a restart loses history, which is acceptable for a live diagnostic
//! tool rather than an audit trail.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::types::{RcaReport, SpikeIncident, Suspect};

pub struct IncidentStore {
    next_id: AtomicU64,
    incidents: RwLock<BTreeMap<u64, SpikeIncident>>,
    retention: usize,
}

impl IncidentStore {
    pub fn new(retention: usize) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            incidents: RwLock::new(BTreeMap::new()),
            retention,
        }
    }

    /// Reserve the next strictly increasing incident id; ids never repeat
    /// or go backwards within a process lifetime.
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Insert a newly confirmed incident, evicting the oldest entry if the
    /// store is at capacity (FIFO eviction at `incident_retention`).
    pub async fn insert(
        &self,
        id: u64,
        detected_at: DateTime<Utc>,
        cpu_at_confirm: f64,
        ram_at_confirm: f64,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
        etw_events: Vec<crate::types::Event>,
        ranked_suspects: Vec<Suspect>,
    ) {
        let incident = SpikeIncident {
            id,
            detected_at,
            cpu_at_confirm,
            ram_at_confirm,
            window_start,
            window_end,
            etw_events,
            ranked_suspects,
            rca: None,
        };
        let mut incidents = self.incidents.write().await;
        incidents.insert(id, incident);
        while incidents.len() > self.retention {
            if let Some(&oldest) = incidents.keys().next() {
                incidents.remove(&oldest);
            } else {
                break;
            }
        }
    }

    /// Attach (or replace) the RCA report for an incident still resident in
    /// the store. A no-op if the incident has already been evicted.
    pub async fn update_rca(&self, id: u64, rca: RcaReport) {
        let mut incidents = self.incidents.write().await;
        if let Some(incident) = incidents.get_mut(&id) {
            incident.rca = Some(rca);
        }
    }

    pub async fn get(&self, id: u64) -> Option<SpikeIncident> {
        self.incidents.read().await.get(&id).cloned()
    }

    /// Most recent incidents first, optionally bounded to those detected at
    /// or after `since`.
    pub async fn list(&self, limit: usize, since: Option<DateTime<Utc>>) -> Vec<SpikeIncident> {
        let incidents = self.incidents.read().await;
        incidents
            .values()
            .rev()
            .filter(|i| since.is_none_or(|cutoff| i.detected_at >= cutoff))
            .take(limit)
            .cloned()
            .collect()
    }

    pub async fn latest_rca(&self) -> Option<(u64, RcaReport)> {
        let incidents = self.incidents.read().await;
        incidents
            .values()
            .rev()
            .find_map(|i| i.rca.clone().map(|rca| (i.id, rca)))
    }

    pub async fn len(&self) -> usize {
        self.incidents.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn insert_n(store: &IncidentStore, n: u64) {
        for _ in 0..n {
            let id = store.next_id();
            store
                .insert(
                    id,
                    Utc::now(),
                    90.0,
                    50.0,
                    Utc::now(),
                    Utc::now(),
                    Vec::new(),
                    Vec::new(),
                )
                .await;
        }
    }

    #[tokio::test]
    async fn ids_are_strictly_increasing() {
        let store = IncidentStore::new(200);
        let a = store.next_id();
        let b = store.next_id();
        assert!(b > a);
    }

    #[tokio::test]
    async fn fifo_eviction_at_retention_bound() {
        let store = IncidentStore::new(3);
        insert_n(&store, 5).await;
        assert_eq!(store.len().await, 3);
        let remaining = store.list(10, None).await;
        let ids: Vec<u64> = remaining.iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![5, 4, 3]);
    }

    #[tokio::test]
    async fn list_respects_limit_and_newest_first() {
        let store = IncidentStore::new(200);
        insert_n(&store, 4).await;
        let page = store.list(2, None).await;
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].id, 4);
        assert_eq!(page[1].id, 3);
    }

    #[tokio::test]
    async fn update_rca_attaches_report_and_latest_rca_finds_it() {
        let store = IncidentStore::new(200);
        let id = store.next_id();
        store
            .insert(id, Utc::now(), 90.0, 50.0, Utc::now(), Utc::now(), Vec::new(), Vec::new())
            .await;
        assert!(store.get(id).await.unwrap().rca.is_none());

        let rca = RcaReport {
            cause_summary: "cpu hog".to_string(),
            confidence: 0.8,
            culprit_process: None,
            resource_impact: crate::types::ResourceImpact {
                cpu_spike_percent: 90.0,
                ram_spike_percent: 50.0,
            },
            ranked_suspects: Vec::new(),
            timeline: Vec::new(),
            recs: Vec::new(),
            generated_at: Utc::now(),
        };
        store.update_rca(id, rca).await;
        assert!(store.get(id).await.unwrap().rca.is_some());
        let (latest_id, _) = store.latest_rca().await.unwrap();
        assert_eq!(latest_id, id);
    }

    #[tokio::test]
    async fn update_rca_on_evicted_incident_is_a_no_op() {
        let store = IncidentStore::new(1);
        let first = store.next_id();
        store
            .insert(first, Utc::now(), 90.0, 50.0, Utc::now(), Utc::now(), Vec::new(), Vec::new())
            .await;
        insert_n(&store, 1).await;
        assert!(store.get(first).await.is_none());

        let rca = RcaReport {
            cause_summary: "stale".to_string(),
            confidence: 0.1,
            culprit_process: None,
            resource_impact: crate::types::ResourceImpact {
                cpu_spike_percent: 0.0,
                ram_spike_percent: 0.0,
            },
            ranked_suspects: Vec::new(),
            timeline: Vec::new(),
            recs: Vec::new(),
            generated_at: Utc::now(),
        };
        store.update_rca(first, rca).await;
        assert!(store.get(first).await.is_none());
    }
}
