//! Pool configuration.
//!
//! Defaults can be overridden from the environment:
//! - `PALANTIR_CAPACITY`: number of resources (default 1)
//! - `PALANTIR_FAIR`: `true`/`false`, FIFO admission without barging (default true)
//! - `PALANTIR_LEASE_MS`: default lease duration in milliseconds, 0 for none
//! - `PALANTIR_EXPIRY`: `notify` or `revoke`
//! - `PALANTIR_TABLE`: `locked` or `optimistic`

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::PoolError;
use crate::lease::MAX_LEASE;
use crate::table::TableStrategy;

/// What happens when a lease outlives its duration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExpiryPolicy {
    /// Interrupt the holder and report the expiry; the holder still owns the
    /// resource until it releases it.
    #[default]
    Notify,
    /// Interrupt the holder and reclaim the resource immediately. The holder's
    /// later release is a no-op.
    Revoke,
}

impl ExpiryPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Notify => "notify",
            Self::Revoke => "revoke",
        }
    }
}

impl FromStr for ExpiryPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "notify" => Ok(Self::Notify),
            "revoke" => Ok(Self::Revoke),
            other => Err(format!(
                "unknown expiry policy '{other}', expected 'notify' or 'revoke'"
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub capacity: usize,
    pub fair: bool,
    #[serde(rename = "default_lease_ms", with = "lease_millis")]
    pub default_lease: Option<Duration>,
    pub expiry_policy: ExpiryPolicy,
    pub table: TableStrategy,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: 1,
            fair: true,
            default_lease: None,
            expiry_policy: ExpiryPolicy::Notify,
            table: TableStrategy::Locked,
        }
    }
}

impl PoolConfig {
    pub fn new(capacity: usize) -> Self {
        Self::default().with_capacity(capacity)
    }

    /// Defaults overridden by `PALANTIR_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(capacity) = parse_override(&lookup, "PALANTIR_CAPACITY") {
            config.capacity = capacity;
        }
        if let Some(fair) = parse_override(&lookup, "PALANTIR_FAIR") {
            config.fair = fair;
        }
        if let Some(ms) = parse_override::<u64>(&lookup, "PALANTIR_LEASE_MS") {
            config.default_lease = (ms > 0).then(|| Duration::from_millis(ms));
        }
        if let Some(policy) = parse_override(&lookup, "PALANTIR_EXPIRY") {
            config.expiry_policy = policy;
        }
        if let Some(table) = parse_override(&lookup, "PALANTIR_TABLE") {
            config.table = table;
        }

        config
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_fairness(mut self, fair: bool) -> Self {
        self.fair = fair;
        self
    }

    pub fn with_default_lease(mut self, lease: Duration) -> Self {
        self.default_lease = Some(lease);
        self
    }

    pub fn with_expiry_policy(mut self, policy: ExpiryPolicy) -> Self {
        self.expiry_policy = policy;
        self
    }

    pub fn with_table(mut self, table: TableStrategy) -> Self {
        self.table = table;
        self
    }

    pub fn validate(&self) -> Result<(), PoolError> {
        if self.capacity == 0 {
            return Err(PoolError::InvalidConfig(
                "capacity must be at least 1".to_string(),
            ));
        }
        if let Some(lease) = self.default_lease
            && lease > MAX_LEASE
        {
            return Err(PoolError::InvalidConfig(format!(
                "default lease {lease:?} exceeds the maximum of {MAX_LEASE:?}"
            )));
        }
        if u32::try_from(self.capacity).is_err() {
            return Err(PoolError::InvalidConfig(format!(
                "capacity {} exceeds the maximum of {}",
                self.capacity,
                u32::MAX
            )));
        }
        Ok(())
    }
}

fn parse_override<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Ignoring unparseable configuration override");
            None
        }
    }
}

mod lease_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn default_is_single_fair_locked() {
        let config = PoolConfig::default();
        assert_eq!(config.capacity, 1);
        assert!(config.fair);
        assert!(config.default_lease.is_none());
        assert_eq!(config.expiry_policy, ExpiryPolicy::Notify);
        assert_eq!(config.table, TableStrategy::Locked);
    }

    #[test]
    fn validate_rejects_zero_capacity() {
        let err = PoolConfig::new(0).validate().unwrap_err();
        assert!(matches!(err, PoolError::InvalidConfig(_)));
        assert!(PoolConfig::new(4).validate().is_ok());
    }

    #[test]
    fn validate_rejects_unschedulable_default_lease() {
        let config = PoolConfig::new(1).with_default_lease(MAX_LEASE + Duration::from_secs(1));
        assert!(matches!(config.validate(), Err(PoolError::InvalidConfig(_))));

        let config = PoolConfig::new(1).with_default_lease(MAX_LEASE);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn env_overrides_apply() {
        let config = PoolConfig::from_lookup(lookup_from(&[
            ("PALANTIR_CAPACITY", "7"),
            ("PALANTIR_FAIR", "false"),
            ("PALANTIR_LEASE_MS", "250"),
            ("PALANTIR_EXPIRY", "REVOKE"),
            ("PALANTIR_TABLE", "optimistic"),
        ]));

        assert_eq!(config.capacity, 7);
        assert!(!config.fair);
        assert_eq!(config.default_lease, Some(Duration::from_millis(250)));
        assert_eq!(config.expiry_policy, ExpiryPolicy::Revoke);
        assert_eq!(config.table, TableStrategy::Optimistic);
    }

    #[test]
    fn bad_env_values_fall_back_to_defaults() {
        let config = PoolConfig::from_lookup(lookup_from(&[
            ("PALANTIR_CAPACITY", "many"),
            ("PALANTIR_EXPIRY", "explode"),
            ("PALANTIR_LEASE_MS", "0"),
        ]));

        assert_eq!(config, PoolConfig::default());
    }

    #[test]
    fn deserializes_partial_json() {
        let config: PoolConfig =
            serde_json::from_str(r#"{"capacity": 3, "default_lease_ms": 50}"#).unwrap();
        assert_eq!(config.capacity, 3);
        assert!(config.fair);
        assert_eq!(config.default_lease, Some(Duration::from_millis(50)));
    }

    #[test]
    fn serializes_default() {
        insta::assert_json_snapshot!(PoolConfig::default(), @r#"
        {
          "capacity": 1,
          "fair": true,
          "default_lease_ms": null,
          "expiry_policy": "notify",
          "table": "locked"
        }
        "#);
    }
}
