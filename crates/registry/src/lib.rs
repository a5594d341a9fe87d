//! Agent registry: fleet liveness over the durable store.
//!
//! The store is the source of truth; the registry keeps a read-through
//! cache of the last known liveness tier per host so that tier *changes*
//! (and only changes) are published to the `agents` topic. The cache is
//! rebuilt from the store on startup and demoted by a background sweeper.
//! The registry also serves as the task queue's dispatch gate: only
//! `healthy` hosts receive new work.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use phoenix_bus::{DomainEvent, EventBus, Topic};
use phoenix_core::{AgentRecord, Liveness, Result};
use phoenix_queue::DispatchGate;
use phoenix_store::Store;

/// Fleet-view entry: the stored record plus its derived liveness.
#[derive(Debug, Clone, Serialize)]
pub struct AgentView {
    #[serde(flatten)]
    pub record: AgentRecord,
    pub liveness: Liveness,
}

pub struct AgentRegistry {
    store: Arc<dyn Store>,
    bus: EventBus,
    heartbeat_interval: Duration,
    /// host id -> last tier we announced.
    tiers: RwLock<HashMap<String, Liveness>>,
}

impl AgentRegistry {
    pub fn new(store: Arc<dyn Store>, bus: EventBus, heartbeat_interval: Duration) -> Self {
        Self {
            store,
            bus,
            heartbeat_interval,
            tiers: RwLock::new(HashMap::new()),
        }
    }

    /// Rebuild the tier cache from the store (stateless warm start).
    pub async fn warm(&self) -> Result<()> {
        let now = Utc::now();
        let agents = self.store.list_agents().await?;
        let mut tiers = self.lock_tiers();
        for agent in &agents {
            tiers.insert(
                agent.host_id.clone(),
                agent.liveness(now, self.heartbeat_interval),
            );
        }
        info!(agents = agents.len(), "agent registry warmed");
        Ok(())
    }

    /// Ingest a heartbeat: last-writer-wins upsert plus a tier-change event
    /// when the host moved between liveness tiers (including first sight).
    pub async fn heartbeat(&self, record: AgentRecord) -> Result<AgentView> {
        let stored = self.store.upsert_agent(&record).await?;
        let liveness = stored.liveness(Utc::now(), self.heartbeat_interval);
        self.announce_if_changed(&stored.host_id, liveness);
        Ok(AgentView {
            record: stored,
            liveness,
        })
    }

    /// Register a host seen only through polling. First contact creates the
    /// record; later polls are no-ops (heartbeats carry the health signal).
    pub async fn touch_poll(&self, host_id: &str) -> Result<()> {
        if self.store.get_agent(host_id).await?.is_none() {
            debug!(host_id, "registering agent on first poll");
            let record = AgentRecord::first_seen_now(host_id);
            self.store.upsert_agent(&record).await?;
            self.announce_if_changed(host_id, Liveness::Healthy);
        }
        Ok(())
    }

    /// Read-only view of one host.
    pub async fn snapshot(&self, host_id: &str) -> Result<Option<AgentView>> {
        let now = Utc::now();
        Ok(self.store.get_agent(host_id).await?.map(|record| {
            let liveness = record.liveness(now, self.heartbeat_interval);
            AgentView { record, liveness }
        }))
    }

    /// Fleet view, liveness derived at read time.
    pub async fn list(&self) -> Result<Vec<AgentView>> {
        let now = Utc::now();
        Ok(self
            .store
            .list_agents()
            .await?
            .into_iter()
            .map(|record| {
                let liveness = record.liveness(now, self.heartbeat_interval);
                AgentView { record, liveness }
            })
            .collect())
    }

    /// Tier histogram for the status endpoint, served from the cache.
    pub fn tier_counts(&self) -> HashMap<Liveness, usize> {
        let tiers = self.lock_tiers();
        let mut counts = HashMap::new();
        for tier in tiers.values() {
            *counts.entry(*tier).or_insert(0) += 1;
        }
        counts
    }

    /// One sweep pass: demote cached hosts whose heartbeats went stale.
    pub async fn sweep(&self) -> Result<()> {
        let now = Utc::now();
        let agents = self.store.list_agents().await?;
        for agent in agents {
            let liveness = agent.liveness(now, self.heartbeat_interval);
            self.announce_if_changed(&agent.host_id, liveness);
        }
        Ok(())
    }

    fn announce_if_changed(&self, host_id: &str, liveness: Liveness) {
        let changed = {
            let mut tiers = self.lock_tiers();
            match tiers.insert(host_id.to_string(), liveness) {
                Some(previous) => previous != liveness,
                None => true,
            }
        };
        if changed {
            info!(host_id, liveness = %liveness, "agent liveness changed");
            self.bus.publish(
                Topic::Agents,
                DomainEvent::AgentStatus {
                    host_id: host_id.to_string(),
                    liveness,
                },
            );
        }
    }

    fn lock_tiers(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Liveness>> {
        match self.tiers.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Only `healthy` hosts get new work; a host that still polls but whose
/// heartbeats went stale keeps its queued tasks deferred in `pending`
/// until heartbeats resume. Existing claims run out their lease.
///
/// An unknown host is allowed through: the poll path registers it (as
/// `healthy`) before its first claim.
impl DispatchGate for AgentRegistry {
    fn may_dispatch(&self, host_id: &str) -> bool {
        match self.lock_tiers().get(host_id) {
            Some(tier) => *tier == Liveness::Healthy,
            None => true,
        }
    }
}

/// Background sweeper: every half heartbeat interval, demote records whose
/// timestamps crossed a tier boundary.
pub async fn run_sweeper(registry: Arc<AgentRegistry>) {
    let interval = (registry.heartbeat_interval / 2).max(Duration::from_millis(200));
    info!(interval_ms = interval.as_millis() as u64, "agent sweeper started");
    loop {
        tokio::time::sleep(interval).await;
        if let Err(e) = registry.sweep().await {
            warn!(error = %e, "agent sweep failed");
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;
    use phoenix_store::MemStore;

    const INTERVAL: Duration = Duration::from_secs(15);

    fn registry() -> (Arc<AgentRegistry>, EventBus) {
        let bus = EventBus::new();
        let store: Arc<dyn Store> = Arc::new(MemStore::new());
        (
            Arc::new(AgentRegistry::new(store, bus.clone(), INTERVAL)),
            bus,
        )
    }

    #[tokio::test]
    async fn test_first_heartbeat_announces_healthy() {
        let (registry, bus) = registry();
        let mut sub = bus.subscribe(Topic::Agents);

        let view = registry
            .heartbeat(AgentRecord::first_seen_now("h1"))
            .await
            .unwrap();
        assert_eq!(view.liveness, Liveness::Healthy);

        match sub.try_recv().unwrap() {
            DomainEvent::AgentStatus { host_id, liveness } => {
                assert_eq!(host_id, "h1");
                assert_eq!(liveness, Liveness::Healthy);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_repeat_heartbeat_is_silent() {
        let (registry, bus) = registry();
        registry
            .heartbeat(AgentRecord::first_seen_now("h1"))
            .await
            .unwrap();
        let mut sub = bus.subscribe(Topic::Agents);

        registry
            .heartbeat(AgentRecord::first_seen_now("h1"))
            .await
            .unwrap();
        assert!(sub.try_recv().is_none(), "no event without a tier change");
    }

    #[tokio::test]
    async fn test_sweep_demotes_stale_hosts() {
        let (registry, bus) = registry();
        let mut record = AgentRecord::first_seen_now("h1");
        registry.heartbeat(record.clone()).await.unwrap();
        let mut sub = bus.subscribe(Topic::Agents);

        // Age the heartbeat past the degraded boundary.
        record.last_heartbeat = Utc::now() - TimeDelta::seconds(60);
        registry.store.upsert_agent(&record).await.unwrap();

        registry.sweep().await.unwrap();
        match sub.try_recv().unwrap() {
            DomainEvent::AgentStatus { liveness, .. } => {
                assert_eq!(liveness, Liveness::Degraded)
            }
            other => panic!("unexpected event {other:?}"),
        }

        // Past the offline boundary.
        record.last_heartbeat = Utc::now() - TimeDelta::seconds(300);
        registry.store.upsert_agent(&record).await.unwrap();
        registry.sweep().await.unwrap();
        match sub.try_recv().unwrap() {
            DomainEvent::AgentStatus { liveness, .. } => {
                assert_eq!(liveness, Liveness::Offline)
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_touch_poll_registers_once() {
        let (registry, _bus) = registry();
        registry.touch_poll("h9").await.unwrap();
        let view = registry.snapshot("h9").await.unwrap().unwrap();
        assert_eq!(view.record.host_id, "h9");

        let first_seen = view.record.first_seen;
        registry.touch_poll("h9").await.unwrap();
        let again = registry.snapshot("h9").await.unwrap().unwrap();
        assert_eq!(again.record.first_seen, first_seen);
    }

    #[tokio::test]
    async fn test_dispatch_gate_follows_liveness() {
        let (registry, _bus) = registry();

        // Unknown hosts pass (the poll path registers them first).
        assert!(registry.may_dispatch("h1"));

        let mut record = AgentRecord::first_seen_now("h1");
        registry.heartbeat(record.clone()).await.unwrap();
        assert!(registry.may_dispatch("h1"));

        // Stale heartbeats close the gate even though the host still polls.
        record.last_heartbeat = Utc::now() - TimeDelta::seconds(60);
        registry.store.upsert_agent(&record).await.unwrap();
        registry.sweep().await.unwrap();
        assert!(!registry.may_dispatch("h1"));

        // A fresh heartbeat reopens it.
        record.last_heartbeat = Utc::now();
        registry.heartbeat(record).await.unwrap();
        assert!(registry.may_dispatch("h1"));
    }

    #[tokio::test]
    async fn test_warm_rebuilds_tiers() {
        let bus = EventBus::new();
        let store: Arc<dyn Store> = Arc::new(MemStore::new());
        let mut stale = AgentRecord::first_seen_now("h1");
        stale.last_heartbeat = Utc::now() - TimeDelta::seconds(600);
        store.upsert_agent(&stale).await.unwrap();
        store
            .upsert_agent(&AgentRecord::first_seen_now("h2"))
            .await
            .unwrap();

        let registry = AgentRegistry::new(store, bus, INTERVAL);
        registry.warm().await.unwrap();

        let counts = registry.tier_counts();
        assert_eq!(counts.get(&Liveness::Offline), Some(&1));
        assert_eq!(counts.get(&Liveness::Healthy), Some(&1));
    }
}
