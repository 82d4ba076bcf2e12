//! Worker and routing configuration types.
//!
//! Configuration is deserialized once at startup and immutable afterwards.
//! Route entries are validated and compiled into the read-only
//! [`RouteTable`](crate::router::RouteTable) before any traffic flows.

use std::{fmt, time::Duration};

use serde::Deserialize;

/// Settings for one proxy worker partition.
#[derive(Debug, Clone, Deserialize)]
pub struct ProxySettings {
    /// Endpoint identifier stamped into forwarded and locally generated
    /// messages.
    pub own_endpoint: String,
    /// Domain this proxy answers for.
    #[serde(default)]
    pub own_domain: String,
    /// Route-header parameter carrying the match domain, if any.
    #[serde(default)]
    pub domain_match_param: Option<String>,
    /// Age after which an incomplete transaction is force-reset.
    #[serde(default = "default_transaction_timeout_ms")]
    pub transaction_timeout_ms: u64,
    /// Interval between registry sweeps.
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    /// Capacity of each pending-event channel.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_transaction_timeout_ms() -> u64 { 32_000 }

fn default_sweep_interval_ms() -> u64 { 2_000 }

fn default_event_capacity() -> usize { 128 }

impl ProxySettings {
    /// Minimal settings for the given endpoint; everything else defaulted.
    #[must_use]
    pub fn new(own_endpoint: impl Into<String>) -> Self {
        Self {
            own_endpoint: own_endpoint.into(),
            own_domain: String::new(),
            domain_match_param: None,
            transaction_timeout_ms: default_transaction_timeout_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
            event_capacity: default_event_capacity(),
        }
    }

    /// Transaction timeout as a [`Duration`].
    #[must_use]
    pub fn transaction_timeout(&self) -> Duration {
        Duration::from_millis(self.transaction_timeout_ms)
    }

    /// Sweep interval as a [`Duration`].
    #[must_use]
    pub fn sweep_interval(&self) -> Duration { Duration::from_millis(self.sweep_interval_ms) }

    /// Validate field constraints.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for an empty endpoint or zero intervals.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.own_endpoint.is_empty() {
            return Err(ConfigError::MissingEndpoint);
        }
        if self.transaction_timeout_ms == 0 || self.sweep_interval_ms == 0 {
            return Err(ConfigError::ZeroInterval);
        }
        Ok(())
    }
}

/// One configured route.
#[derive(Debug, Clone, Deserialize)]
pub struct RouteEntryConfig {
    /// Domain to match; `"*"` matches any domain.
    pub domain: String,
    /// Target cluster name.
    pub cluster: String,
    /// Parameter name used to derive the affinity key, enabling
    /// customized affinity for this route.
    #[serde(default)]
    pub affinity_param: Option<String>,
}

/// Ordered route configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RouteConfig {
    #[serde(default)]
    pub routes: Vec<RouteEntryConfig>,
}

impl RouteConfig {
    /// Validate the entries.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for an entry with an empty domain or
    /// cluster name.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for entry in &self.routes {
            if entry.domain.is_empty() || entry.cluster.is_empty() {
                return Err(ConfigError::IncompleteRoute {
                    domain: entry.domain.clone(),
                    cluster: entry.cluster.clone(),
                });
            }
        }
        Ok(())
    }
}

/// Configuration validation failure.
#[derive(Debug)]
pub enum ConfigError {
    /// `own_endpoint` was empty.
    MissingEndpoint,
    /// A timeout or interval was zero.
    ZeroInterval,
    /// A route entry is missing its domain or cluster.
    IncompleteRoute { domain: String, cluster: String },
    /// A required collaborator was not installed on the builder.
    MissingCollaborator(&'static str),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingEndpoint => f.write_str("own_endpoint must not be empty"),
            Self::ZeroInterval => f.write_str("timeouts and intervals must be non-zero"),
            Self::IncompleteRoute { domain, cluster } => write!(
                f,
                "route entry needs both domain (`{domain}`) and cluster (`{cluster}`)"
            ),
            Self::MissingCollaborator(name) => write!(f, "{name} must be installed before build"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_applied() {
        let settings = ProxySettings::new("10.0.0.2:5060");
        assert!(settings.validate().is_ok());
        assert_eq!(settings.transaction_timeout(), Duration::from_secs(32));
        assert_eq!(settings.sweep_interval(), Duration::from_secs(2));
    }

    #[test]
    fn empty_endpoint_is_rejected() {
        let settings = ProxySettings::new("");
        assert!(matches!(
            settings.validate(),
            Err(ConfigError::MissingEndpoint)
        ));
    }

    #[test]
    fn incomplete_route_is_rejected() {
        let config = RouteConfig {
            routes: vec![RouteEntryConfig {
                domain: "a.example.com".into(),
                cluster: String::new(),
                affinity_param: None,
            }],
        };
        assert!(config.validate().is_err());
    }
}
