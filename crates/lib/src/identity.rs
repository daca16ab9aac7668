//! Participant id <-> external id mapping.
//!
//! Participant ids are what the scheduler endpoint knows a user by (e.g. "49804"); external ids
//! key the delivery-log store. The map is built once from config and never mutated; users
//! registered during a run live in an [`IdentityRegistry`] overlay and are gone when it drops.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Immutable bidirectional table: participant id <-> external id.
#[derive(Debug, Clone, Default)]
pub struct IdentityMap {
    to_external: HashMap<String, String>,
    to_participant: HashMap<String, String>,
}

impl IdentityMap {
    /// Build from (participant, external) pairs. A later pair for the same participant wins.
    pub fn new<I, P, E>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (P, E)>,
        P: Into<String>,
        E: Into<String>,
    {
        let mut map = Self::default();
        for (participant, external) in pairs {
            map.insert(participant.into(), external.into());
        }
        map
    }

    fn insert(&mut self, participant: String, external: String) {
        if let Some(old) = self.to_external.insert(participant.clone(), external.clone()) {
            self.to_participant.remove(&old);
        }
        self.to_participant.insert(external, participant);
    }

    /// External id for a participant, if mapped.
    pub fn external_id(&self, participant: &str) -> Option<&str> {
        self.to_external.get(participant).map(String::as_str)
    }

    /// Participant id for an external id, if mapped.
    pub fn participant_id(&self, external: &str) -> Option<&str> {
        self.to_participant.get(external).map(String::as_str)
    }

}

/// Run-scoped registry: the shared read-only map plus users registered during this run.
#[derive(Debug, Clone)]
pub struct IdentityRegistry {
    base: Arc<IdentityMap>,
    added: IdentityMap,
}

impl IdentityRegistry {
    pub fn new(base: Arc<IdentityMap>) -> Self {
        Self {
            base,
            added: IdentityMap::default(),
        }
    }

    /// Register a mapping for this run only. Shadows the base map for that participant.
    pub fn register(&mut self, participant: impl Into<String>, external: impl Into<String>) {
        let participant = participant.into();
        let external = external.into();
        log::info!("registered participant {} -> {} (this run only)", participant, external);
        self.added.insert(participant, external);
    }

    /// Resolve a participant id to its external id. A miss logs a warning and returns None;
    /// callers skip observation rather than fail.
    pub fn resolve(&self, participant: &str) -> Option<String> {
        let found = self
            .added
            .external_id(participant)
            .or_else(|| self.base.external_id(participant));
        if found.is_none() {
            log::warn!("no external id mapped for participant {}; skipping observation", participant);
        }
        found.map(str::to_string)
    }

    /// Every known (participant, external) pair, sorted by participant id. Run registrations
    /// shadow the base map.
    pub fn entries(&self) -> Vec<(&str, &str)> {
        let mut merged: BTreeMap<&str, &str> = BTreeMap::new();
        for map in [self.base.as_ref(), &self.added] {
            for (p, e) in &map.to_external {
                merged.insert(p.as_str(), e.as_str());
            }
        }
        merged.into_iter().collect()
    }

    /// Reverse lookup: participant id for an external id.
    pub fn participant_for(&self, external: &str) -> Option<String> {
        self.added
            .participant_id(external)
            .or_else(|| self.base.participant_id(external))
            .map(str::to_string)
    }
}

/// Fresh opaque user id for enrollment tests: `TEST_` plus 16 hex chars.
pub fn generate_test_user_id() -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    format!("TEST_{}", &hex[..16])
}
