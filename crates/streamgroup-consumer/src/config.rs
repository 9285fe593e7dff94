//! Consumer configuration.
//!
//! Sources, lowest precedence first: built-in defaults, a TOML file, `STREAMGROUP_*` environment
//! variables.
//!
//! ```toml
//! consumer_id = "billing-worker-1"
//! block_duration_ms = 1000
//! membership_ttl_ms = 10000
//! heartbeat_interval_ms = 3000
//! ```

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use snafu::ResultExt;
use streamgroup_core::ChannelSet;
use streamgroup_coordination::CoordinatorConfig;

use crate::error::ConsumerError;
use crate::error::ParseConfigSnafu;
use crate::error::ReadConfigFileSnafu;

fn default_block_duration_ms() -> u64 {
    1_000
}

fn default_missing_key_backoff_ms() -> u64 {
    500
}

fn default_handler_failure_backoff_ms() -> u64 {
    1_000
}

fn default_membership_ttl_ms() -> u64 {
    10_000
}

fn default_heartbeat_interval_ms() -> u64 {
    3_000
}

fn default_leadership_lease_ttl_ms() -> u64 {
    10_000
}

fn default_coordinator_poll_interval_ms() -> u64 {
    1_000
}

/// Settings shared by every subscription of one [`crate::MessageConsumer`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// Identity of this process in every group it joins. Random when unset.
    #[serde(default)]
    pub consumer_id: Option<String>,

    /// Upper bound of one blocking read.
    #[serde(default = "default_block_duration_ms")]
    pub block_duration_ms: u64,

    /// Sleep before re-reading a partition stream that does not exist yet.
    #[serde(default = "default_missing_key_backoff_ms")]
    pub missing_key_backoff_ms: u64,

    /// Sleep before re-delivering a message whose decorated handler failed.
    #[serde(default = "default_handler_failure_backoff_ms")]
    pub handler_failure_backoff_ms: u64,

    #[serde(default = "default_membership_ttl_ms")]
    pub membership_ttl_ms: u64,

    /// Must be shorter than `membership_ttl_ms`.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    #[serde(default = "default_leadership_lease_ttl_ms")]
    pub leadership_lease_ttl_ms: u64,

    /// Cadence of election, rebalance, and assignment polling.
    #[serde(default = "default_coordinator_poll_interval_ms")]
    pub coordinator_poll_interval_ms: u64,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            consumer_id: None,
            block_duration_ms: default_block_duration_ms(),
            missing_key_backoff_ms: default_missing_key_backoff_ms(),
            handler_failure_backoff_ms: default_handler_failure_backoff_ms(),
            membership_ttl_ms: default_membership_ttl_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            leadership_lease_ttl_ms: default_leadership_lease_ttl_ms(),
            coordinator_poll_interval_ms: default_coordinator_poll_interval_ms(),
        }
    }
}

impl ConsumerConfig {
    /// Load configuration from a TOML file. Missing fields take their defaults.
    pub fn from_toml_file(path: &Path) -> Result<Self, ConsumerError> {
        let content = std::fs::read_to_string(path).context(ReadConfigFileSnafu { path })?;
        toml::from_str(&content).context(ParseConfigSnafu {
            origin: path.display().to_string(),
        })
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConsumerError> {
        toml::from_str(content).context(ParseConfigSnafu { origin: "<string>" })
    }

    /// Override fields from `STREAMGROUP_<FIELD_NAME>` environment variables.
    ///
    /// Unset or unparseable variables leave the field unchanged.
    pub fn apply_env(self) -> Self {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    fn apply_env_from<F>(mut self, lookup: F) -> Self
    where F: Fn(&str) -> Option<String> {
        let number = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());

        if let Some(id) = lookup("STREAMGROUP_CONSUMER_ID").filter(|v| !v.is_empty()) {
            self.consumer_id = Some(id);
        }
        if let Some(v) = number("STREAMGROUP_BLOCK_DURATION_MS") {
            self.block_duration_ms = v;
        }
        if let Some(v) = number("STREAMGROUP_MISSING_KEY_BACKOFF_MS") {
            self.missing_key_backoff_ms = v;
        }
        if let Some(v) = number("STREAMGROUP_HANDLER_FAILURE_BACKOFF_MS") {
            self.handler_failure_backoff_ms = v;
        }
        if let Some(v) = number("STREAMGROUP_MEMBERSHIP_TTL_MS") {
            self.membership_ttl_ms = v;
        }
        if let Some(v) = number("STREAMGROUP_HEARTBEAT_INTERVAL_MS") {
            self.heartbeat_interval_ms = v;
        }
        if let Some(v) = number("STREAMGROUP_LEADERSHIP_LEASE_TTL_MS") {
            self.leadership_lease_ttl_ms = v;
        }
        if let Some(v) = number("STREAMGROUP_COORDINATOR_POLL_INTERVAL_MS") {
            self.coordinator_poll_interval_ms = v;
        }
        self
    }

    pub fn validate(&self) -> Result<(), ConsumerError> {
        let durations = [
            ("block_duration_ms", self.block_duration_ms),
            ("missing_key_backoff_ms", self.missing_key_backoff_ms),
            ("handler_failure_backoff_ms", self.handler_failure_backoff_ms),
            ("membership_ttl_ms", self.membership_ttl_ms),
            ("heartbeat_interval_ms", self.heartbeat_interval_ms),
            ("leadership_lease_ttl_ms", self.leadership_lease_ttl_ms),
            ("coordinator_poll_interval_ms", self.coordinator_poll_interval_ms),
        ];
        if let Some((name, _)) = durations.iter().find(|(_, v)| *v == 0) {
            return Err(ConsumerError::InvalidConfig {
                message: format!("{name} must be non-zero"),
            });
        }

        if self.consumer_id.as_deref().is_some_and(str::is_empty) {
            return Err(ConsumerError::InvalidConfig {
                message: "consumer_id must not be empty".into(),
            });
        }

        // The id is the last segment of its membership key.
        if let Some(id) = self.consumer_id.as_deref().filter(|id| id.contains('/')) {
            return Err(ConsumerError::InvalidConfig {
                message: format!("consumer_id '{id}' must not contain '/'"),
            });
        }

        if self.heartbeat_interval_ms >= self.membership_ttl_ms {
            return Err(ConsumerError::InvalidConfig {
                message: format!(
                    "heartbeat_interval_ms ({}) must be less than membership_ttl_ms ({})",
                    self.heartbeat_interval_ms, self.membership_ttl_ms
                ),
            });
        }

        if self.coordinator_poll_interval_ms.saturating_mul(2) > self.leadership_lease_ttl_ms {
            return Err(ConsumerError::InvalidConfig {
                message: format!(
                    "leadership_lease_ttl_ms ({}) must cover at least two coordinator polls ({} ms each)",
                    self.leadership_lease_ttl_ms, self.coordinator_poll_interval_ms
                ),
            });
        }

        Ok(())
    }

    pub fn block_duration(&self) -> Duration {
        Duration::from_millis(self.block_duration_ms)
    }

    pub fn missing_key_backoff(&self) -> Duration {
        Duration::from_millis(self.missing_key_backoff_ms)
    }

    pub fn handler_failure_backoff(&self) -> Duration {
        Duration::from_millis(self.handler_failure_backoff_ms)
    }

    /// Coordination settings for one group joined by `consumer_id`.
    pub fn coordinator_config(&self, subscriber_id: &str, channels: ChannelSet, consumer_id: &str) -> CoordinatorConfig {
        CoordinatorConfig {
            subscriber_id: subscriber_id.to_string(),
            channels,
            consumer_id: consumer_id.to_string(),
            lease_ttl: Duration::from_millis(self.leadership_lease_ttl_ms),
            poll_interval: Duration::from_millis(self.coordinator_poll_interval_ms),
            membership_ttl: Duration::from_millis(self.membership_ttl_ms),
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms),
        }
    }
}

/// Produces the id of each new subscription.
#[derive(Clone)]
pub struct SubscriptionIdGenerator(Arc<dyn Fn() -> String + Send + Sync>);

impl SubscriptionIdGenerator {
    pub fn new<F>(f: F) -> Self
    where F: Fn() -> String + Send + Sync + 'static {
        Self(Arc::new(f))
    }

    pub fn generate(&self) -> String {
        (self.0)()
    }
}

impl Default for SubscriptionIdGenerator {
    /// A random UUID v4 per call.
    fn default() -> Self {
        Self::new(|| uuid::Uuid::new_v4().to_string())
    }
}

impl fmt::Debug for SubscriptionIdGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SubscriptionIdGenerator")
    }
}
