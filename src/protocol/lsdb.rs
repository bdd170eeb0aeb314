use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;
use crate::{NetworkId, RouterId};
use super::messages::{AdvertisedLink, LinkStateUpdate};

#[derive(Debug, Clone)]
pub struct LsdbEntry {
    pub update: LinkStateUpdate,
    pub installed_at: Instant,
    /// Neighbor the update arrived from; `None` for self-originated entries.
    pub learned_from: Option<RouterId>,
}

impl LsdbEntry {
    pub fn age(&self, now: Instant) -> Duration {
        Duration::from_secs(self.update.age as u64) + now.saturating_duration_since(self.installed_at)
    }
}

/// Read-only view of one database entry.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LsdbSummary {
    pub origin: RouterId,
    pub sequence: u64,
    pub age_secs: u64,
    pub learned_from: Option<RouterId>,
    pub links: Vec<AdvertisedLink>,
    pub networks: Vec<NetworkId>,
}

/// Most recent accepted update per origin.
#[derive(Debug, Clone, Default)]
pub struct LinkStateDatabase {
    entries: BTreeMap<RouterId, LsdbEntry>,
}

impl LinkStateDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `update` if its sequence is strictly newer than what is held
    /// for its origin. Returns whether it was accepted.
    pub fn install(&mut self, update: LinkStateUpdate, learned_from: Option<RouterId>, now: Instant) -> bool {
        if let Some(existing) = self.entries.get(&update.origin) {
            if update.sequence <= existing.update.sequence {
                return false;
            }
        }
        self.entries.insert(
            update.origin.clone(),
            LsdbEntry {
                update,
                installed_at: now,
                learned_from,
            },
        );
        true
    }

    pub fn get(&self, origin: &str) -> Option<&LsdbEntry> {
        self.entries.get(origin)
    }

    pub fn sequence_of(&self, origin: &str) -> Option<u64> {
        self.entries.get(origin).map(|e| e.update.sequence)
    }

    pub fn remove(&mut self, origin: &str) -> Option<LsdbEntry> {
        self.entries.remove(origin)
    }

    /// Drops entries of other origins that reached `max_age`.
    pub fn purge_expired(&mut self, local_id: &str, now: Instant, max_age: Duration) -> Vec<RouterId> {
        let expired: Vec<RouterId> = self
            .entries
            .iter()
            .filter(|(origin, entry)| origin.as_str() != local_id && entry.age(now) >= max_age)
            .map(|(origin, _)| origin.clone())
            .collect();
        for origin in &expired {
            self.entries.remove(origin);
        }
        expired
    }

    pub fn updates(&self) -> impl Iterator<Item = &LinkStateUpdate> {
        self.entries.values().map(|e| &e.update)
    }

    /// Copies of every entry with their age brought up to date, for a full
    /// database exchange.
    pub fn aged_updates(&self, now: Instant) -> Vec<LinkStateUpdate> {
        self.entries
            .values()
            .map(|entry| LinkStateUpdate {
                age: entry.age(now).as_secs().min(u32::MAX as u64) as u32,
                ..entry.update.clone()
            })
            .collect()
    }

    pub fn summary(&self, now: Instant) -> Vec<LsdbSummary> {
        self.entries
            .values()
            .map(|entry| LsdbSummary {
                origin: entry.update.origin.clone(),
                sequence: entry.update.sequence,
                age_secs: entry.age(now).as_secs(),
                learned_from: entry.learned_from.clone(),
                links: entry.update.links.clone(),
                networks: entry.update.networks.clone(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(origin: &str, sequence: u64) -> LinkStateUpdate {
        LinkStateUpdate {
            origin: origin.into(),
            sequence,
            links: vec![],
            networks: vec![],
            age: 0,
        }
    }

    #[test]
    fn only_strictly_newer_sequences_are_accepted() {
        let mut db = LinkStateDatabase::new();
        let now = Instant::now();

        assert!(db.install(update("r2", 4), Some("r2".into()), now));
        assert!(!db.install(update("r2", 4), Some("r3".into()), now));
        assert!(!db.install(update("r2", 3), Some("r3".into()), now));
        assert_eq!(db.get("r2").unwrap().learned_from.as_deref(), Some("r2"));

        assert!(db.install(update("r2", 5), Some("r3".into()), now));
        assert_eq!(db.sequence_of("r2"), Some(5));
        assert_eq!(db.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_foreign_entries_are_purged() {
        let mut db = LinkStateDatabase::new();
        db.install(update("r1", 1), None, Instant::now());
        db.install(update("r2", 1), Some("r2".into()), Instant::now());
        db.install(LinkStateUpdate { age: 8, ..update("r3", 1) }, Some("r2".into()), Instant::now());

        tokio::time::advance(Duration::from_secs(3)).await;
        let purged = db.purge_expired("r1", Instant::now(), Duration::from_secs(10));
        assert_eq!(purged, vec!["r3".to_string()]);

        tokio::time::advance(Duration::from_secs(10)).await;
        let purged = db.purge_expired("r1", Instant::now(), Duration::from_secs(10));
        assert_eq!(purged, vec!["r2".to_string()]);
        assert!(db.get("r1").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn exchange_copies_carry_current_age() {
        let mut db = LinkStateDatabase::new();
        db.install(LinkStateUpdate { age: 2, ..update("r2", 1) }, Some("r2".into()), Instant::now());
        tokio::time::advance(Duration::from_secs(5)).await;

        let copies = db.aged_updates(Instant::now());
        assert_eq!(copies[0].age, 7);
        assert_eq!(db.summary(Instant::now())[0].age_secs, 7);
    }
}
