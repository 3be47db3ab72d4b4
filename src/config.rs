//! Configuration for stigmergy.
//!
//! Pure policy parameters: nothing here changes coordination semantics,
//! only limits, windows, and timeouts.

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::coordination::scheduler::SchedulerConfig;
use crate::coordination::ElectionConfig;
use crate::memory::ConflictPolicy;
use crate::resources::AllocatorConfig;

/// How idle agents pick up work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum LoadBalancingStrategy {
    /// Idle agents pull from the shared pool.
    WorkStealing,
    /// Items are offered to agents in turn.
    RoundRobin,
    /// Items go to the least-loaded compatible agent.
    CapabilityBased,
}

/// Stigmergy configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Maximum tasks assigned or running at once.
    pub max_concurrent_agents: usize,
    /// How long a task may wait on a denied resource (ms).
    pub resource_timeout_ms: u64,
    /// How long peers wait on each other's messages (ms).
    pub message_timeout_ms: u64,
    /// Run cycle and stuck detection each tick.
    pub deadlock_detection: bool,
    /// Ticks with an unchanged unmet-dependency set before a task is stuck.
    pub stuck_tick_threshold: u32,
    /// Retry attempts for lock acquisition.
    pub retry_attempts: u32,
    /// Backoff between retries (ms).
    pub retry_delay_ms: u64,
    /// How idle agents pick up work.
    pub load_balancing: LoadBalancingStrategy,
    /// Conflict policy for same-id store writes.
    pub conflict_policy: ConflictPolicy,
    /// Default TTL for lock entries (ms).
    pub default_lock_ttl_ms: u64,
    /// Heartbeat cadence for task claims (ms).
    pub heartbeat_interval_ms: u64,
    /// Candidacy collection window before concluding an election (ms).
    pub election_window_ms: u64,
    /// Leadership term length (ms).
    pub leadership_term_ms: u64,
    /// Store maintenance sweep interval (ms).
    pub maintenance_interval_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_concurrent_agents: 5,
            resource_timeout_ms: 60_000,
            message_timeout_ms: 30_000,
            deadlock_detection: true,
            stuck_tick_threshold: 10,
            retry_attempts: 3,
            retry_delay_ms: 500,
            load_balancing: LoadBalancingStrategy::WorkStealing,
            conflict_policy: ConflictPolicy::LastWriteWins,
            default_lock_ttl_ms: 30_000,
            heartbeat_interval_ms: 5_000,
            election_window_ms: 500,
            leadership_term_ms: 30_000,
            maintenance_interval_ms: 10_000,
        }
    }
}

impl Config {
    /// Load configuration with fallback chain.
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Try primary location: ~/.config/stigmergy/stigmergy.yml
        if let Some(config_dir) = dirs::config_dir() {
            let primary_config = config_dir.join("stigmergy").join("stigmergy.yml");
            if primary_config.exists() {
                match Self::load_from_file(&primary_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        log::warn!("Failed to load config from {}: {}", primary_config.display(), e);
                    }
                }
            }
        }

        // Try fallback location: ./stigmergy.yml
        let fallback_config = PathBuf::from("stigmergy.yml");
        if fallback_config.exists() {
            match Self::load_from_file(&fallback_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    log::warn!("Failed to load config from {}: {}", fallback_config.display(), e);
                }
            }
        }

        // No config file found, use defaults
        log::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        log::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    /// Scheduler view of the policy parameters.
    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            max_concurrent_agents: self.max_concurrent_agents,
            resource_timeout: Duration::from_millis(self.resource_timeout_ms),
            deadlock_detection: self.deadlock_detection,
            stuck_tick_threshold: self.stuck_tick_threshold,
        }
    }

    /// Allocator view of the policy parameters.
    pub fn allocator_config(&self) -> AllocatorConfig {
        AllocatorConfig {
            max_concurrent: None,
            allocation_ttl: Some(Duration::from_millis(self.resource_timeout_ms * 5)),
        }
    }

    /// Election view of the policy parameters.
    pub fn election_config(&self) -> ElectionConfig {
        ElectionConfig {
            scope: "swarm".to_string(),
            window: Duration::from_millis(self.election_window_ms),
            term: Duration::from_millis(self.leadership_term_ms),
        }
    }

    /// Default lock TTL as a duration.
    pub fn lock_ttl(&self) -> Duration {
        Duration::from_millis(self.default_lock_ttl_ms)
    }

    /// Lock retry backoff as a duration.
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Heartbeat cadence as a duration.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}
