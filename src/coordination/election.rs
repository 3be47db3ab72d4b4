//! Leader election as store conventions.
//!
//! Candidates write candidacy entries during a collection window. Any
//! participant can then compute the winner with [`compute_leader`] — a pure
//! function, so every participant reading the same candidacy set names the
//! same leader. The computed winner writes the authoritative leadership
//! entry with a bounded term; when the term's TTL lapses, re-election is
//! required.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::memory::{AgentId, EntryId, EntryKind, MemoryEntry, QueryFilter, SharedMemoryStore};

/// Namespace holding election entries.
pub const ELECTION_NAMESPACE: &str = "coordination";

/// A candidacy for leadership.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidacy {
    /// The candidate.
    pub agent: AgentId,
    /// Candidate's priority score; highest wins.
    pub priority: i64,
    /// When the candidacy was announced.
    pub nominated_at: DateTime<Utc>,
}

/// The authoritative leadership record for one term.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Leadership {
    /// The elected leader.
    pub leader: AgentId,
    /// Priority the leader won with.
    pub priority: i64,
    /// When the term started.
    pub term_started_at: DateTime<Utc>,
    /// When the term ends and re-election is required.
    pub term_ends_at: DateTime<Utc>,
}

/// Election configuration.
#[derive(Debug, Clone)]
pub struct ElectionConfig {
    /// Election scope; distinct scopes elect independently.
    pub scope: String,
    /// How long candidacies are collected before concluding.
    pub window: Duration,
    /// Leadership term length (TTL on the leadership entry).
    pub term: Duration,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            scope: "swarm".to_string(),
            window: Duration::from_millis(500),
            term: Duration::from_secs(30),
        }
    }
}

/// Pick the leader from a candidacy set. Pure and deterministic: highest
/// priority, tie broken by earliest nomination, then lexically smallest
/// agent id. Recomputing over an unchanged set always yields the same
/// winner.
pub fn compute_leader(candidates: &[Candidacy]) -> Option<&Candidacy> {
    candidates.iter().min_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then_with(|| a.nominated_at.cmp(&b.nominated_at))
            .then_with(|| a.agent.cmp(&b.agent))
    })
}

/// Runs elections over the store.
pub struct Election {
    config: ElectionConfig,
}

impl Election {
    /// Create an election with default configuration.
    pub fn new() -> Self {
        Self {
            config: ElectionConfig::default(),
        }
    }

    /// Create an election with custom configuration.
    pub fn with_config(config: ElectionConfig) -> Self {
        Self { config }
    }

    /// The collection window length.
    pub fn window(&self) -> Duration {
        self.config.window
    }

    fn candidacy_id(&self, agent: &AgentId) -> EntryId {
        EntryId::named(format!("candidacy-{}-{}", self.config.scope, agent))
    }

    fn leadership_id(&self) -> EntryId {
        EntryId::named(format!("leadership-{}", self.config.scope))
    }

    /// Announce a candidacy. Candidacies outlive the window but not the
    /// term, so a crashed candidate cannot win forever.
    pub async fn nominate(&self, store: &SharedMemoryStore, agent: &AgentId, priority: i64) -> Result<Candidacy> {
        let candidacy = Candidacy {
            agent: agent.clone(),
            priority,
            nominated_at: Utc::now(),
        };
        let entry = MemoryEntry::new(EntryKind::Candidacy, serde_json::to_value(&candidacy)?)
            .with_id(self.candidacy_id(agent))
            .in_namespace(ELECTION_NAMESPACE)
            .owned_by(agent.clone())
            .with_tags(vec!["election".to_string(), self.config.scope.clone()])
            .with_ttl(self.config.term);
        store.store(entry).await?;
        Ok(candidacy)
    }

    /// Read the current candidacy set, in nomination order.
    pub async fn candidates(&self, store: &SharedMemoryStore) -> Result<Vec<Candidacy>> {
        let filter = QueryFilter::new()
            .namespace(ELECTION_NAMESPACE)
            .kind(EntryKind::Candidacy)
            .tag(self.config.scope.clone());
        let mut candidates = Vec::new();
        for entry in store.query(&filter).await? {
            match serde_json::from_value::<Candidacy>(entry.content.clone()) {
                Ok(candidacy) => candidates.push(candidacy),
                Err(e) => log::warn!("skipping malformed candidacy entry {}: {}", entry.id, e),
            }
        }
        Ok(candidates)
    }

    /// Conclude the election from the perspective of `agent`.
    ///
    /// Computes the winner from the current candidacy set; if `agent` is the
    /// winner, it writes the authoritative leadership entry. Everyone gets
    /// the computed leadership back either way (None if no candidates).
    pub async fn conclude(&self, store: &SharedMemoryStore, agent: &AgentId) -> Result<Option<Leadership>> {
        let candidates = self.candidates(store).await?;
        let Some(winner) = compute_leader(&candidates) else {
            return Ok(None);
        };

        let now = Utc::now();
        let leadership = Leadership {
            leader: winner.agent.clone(),
            priority: winner.priority,
            term_started_at: now,
            term_ends_at: now + chrono::Duration::milliseconds(self.config.term.as_millis() as i64),
        };

        if winner.agent == *agent {
            let entry = MemoryEntry::new(EntryKind::Leadership, serde_json::to_value(&leadership)?)
                .with_id(self.leadership_id())
                .in_namespace(ELECTION_NAMESPACE)
                .owned_by(agent.clone())
                .with_tags(vec!["election".to_string(), self.config.scope.clone()])
                .with_ttl(self.config.term);
            store.store(entry).await?;
            log::info!("agent {} elected leader of {} until {}", agent, self.config.scope, leadership.term_ends_at);
        }

        Ok(Some(leadership))
    }

    /// The current leader, if a term is in force.
    pub async fn current_leader(&self, store: &SharedMemoryStore) -> Result<Option<Leadership>> {
        let entry = store.retrieve(&self.leadership_id()).await?;
        Ok(match entry {
            Some(e) => serde_json::from_value(e.content).ok(),
            None => None,
        })
    }

    /// Whether re-election is needed (no live leadership entry).
    pub async fn needs_election(&self, store: &SharedMemoryStore) -> Result<bool> {
        Ok(self.current_leader(store).await?.is_none())
    }

    /// Withdraw a candidacy.
    pub async fn withdraw(&self, store: &SharedMemoryStore, agent: &AgentId) -> Result<bool> {
        store.delete(&self.candidacy_id(agent)).await
    }
}

impl Default for Election {
    fn default() -> Self {
        Self::new()
    }
}
