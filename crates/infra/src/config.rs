//! Pipeline configuration from `ORDERFLOW_*` environment variables.
//!
//! Every setting has a default, so an empty environment yields a working local
//! setup. [`PipelineConfig::from_lookup`] takes the variable source as a
//! function so tests never touch the process environment.

use std::collections::HashSet;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use orderflow_observability::LogFormat;

use crate::consumer::LoopConfig;
use crate::retry::RetryPolicy;

const PREFIX: &str = "ORDERFLOW_";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {var}: {reason}")]
    Invalid {
        var: String,
        value: String,
        reason: String,
    },

    #[error("topic name for {0} must not be empty")]
    EmptyTopic(&'static str),

    #[error("topic {0:?} is configured for more than one role")]
    DuplicateTopic(String),
}

/// Producer acknowledgement level requested from the broker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Acks {
    /// Fire and forget.
    None,
    /// Leader acknowledgement only.
    Leader,
    /// All in-sync replicas.
    #[default]
    All,
}

impl FromStr for Acks {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "0" => Ok(Acks::None),
            "1" => Ok(Acks::Leader),
            "all" | "-1" => Ok(Acks::All),
            _ => Err("expected 0, 1 or all".to_string()),
        }
    }
}

impl fmt::Display for Acks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Acks::None => f.write_str("0"),
            Acks::Leader => f.write_str("1"),
            Acks::All => f.write_str("all"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TopicConfig {
    pub orders: String,
    pub retry: String,
    pub dead_letter: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConsumerSettings {
    pub group_id: String,
    pub client_id: String,
    pub max_poll_records: usize,
    pub poll_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProducerSettings {
    pub acks: Acks,
    pub idempotent: bool,
    pub client_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GeneratorConfig {
    pub messages_per_second: f64,
}

impl GeneratorConfig {
    /// Pause between two generated orders. Saturates at `Duration::MAX` for
    /// rates too small to represent.
    pub fn interval(&self) -> Duration {
        self.try_interval().unwrap_or(Duration::MAX)
    }

    fn try_interval(&self) -> Option<Duration> {
        Duration::try_from_secs_f64(1.0 / self.messages_per_second).ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsServerConfig {
    pub addr: SocketAddr,
}

/// Complete configuration for the producer and consumer processes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineConfig {
    /// Broker endpoint, e.g. `redis://127.0.0.1:6379`.
    pub bootstrap: String,
    pub topics: TopicConfig,
    pub retry: RetryConfig,
    pub consumer: ConsumerSettings,
    pub producer: ProducerSettings,
    pub generator: GeneratorConfig,
    /// Fraction of decoded orders failed on purpose, in `[0, 1]`.
    pub simulated_failure_rate: f64,
    pub stats: StatsServerConfig,
    pub log_format: LogFormat,
}

/// Reads `ORDERFLOW_<name>` through the lookup function.
struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn raw(&self, name: &str) -> (String, Option<String>) {
        let var = format!("{PREFIX}{name}");
        let value = (self.lookup)(&var).filter(|v| !v.trim().is_empty());
        (var, value)
    }

    fn string(&self, name: &str, default: &str) -> String {
        self.raw(name)
            .1
            .map(|v| v.trim().to_string())
            .unwrap_or_else(|| default.to_string())
    }

    fn parse<T>(&self, name: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        match self.raw(name) {
            (_, None) => Ok(default),
            (var, Some(value)) => value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
                var,
                value,
                reason: e.to_string(),
            }),
        }
    }

    fn millis(&self, name: &str, default: u64) -> Result<Duration, ConfigError> {
        self.parse(name, default).map(Duration::from_millis)
    }

    fn flag(&self, name: &str, default: bool) -> Result<bool, ConfigError> {
        match self.raw(name) {
            (_, None) => Ok(default),
            (var, Some(value)) => match value.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => Ok(true),
                "false" | "0" | "no" => Ok(false),
                _ => Err(ConfigError::Invalid {
                    var,
                    value,
                    reason: "expected true/false, 1/0 or yes/no".to_string(),
                }),
            },
        }
    }

    fn invalid(&self, name: &str, value: impl fmt::Display, reason: &str) -> ConfigError {
        ConfigError::Invalid {
            var: format!("{PREFIX}{name}"),
            value: value.to_string(),
            reason: reason.to_string(),
        }
    }
}

impl PipelineConfig {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Load from an arbitrary variable source. Blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };

        let topics = TopicConfig {
            orders: env.string("TOPIC_ORDERS", "orders"),
            retry: env.string("TOPIC_RETRY", "orders-retry"),
            dead_letter: env.string("TOPIC_DLQ", "orders-dlq"),
        };
        topics.validate()?;

        let consumer = ConsumerSettings {
            group_id: env.string("CONSUMER_GROUP_ID", "order-consumer-group"),
            client_id: env.string("CONSUMER_CLIENT_ID", "order-consumer"),
            max_poll_records: env.parse("CONSUMER_MAX_POLL_RECORDS", 50)?,
            poll_timeout: env.millis("CONSUMER_POLL_TIMEOUT_MS", 1000)?,
        };
        if consumer.max_poll_records == 0 {
            return Err(env.invalid("CONSUMER_MAX_POLL_RECORDS", 0, "must be at least 1"));
        }

        let generator = GeneratorConfig {
            messages_per_second: env.parse("PRODUCER_MESSAGES_PER_SECOND", 1.0)?,
        };
        let rate = generator.messages_per_second;
        if !rate.is_finite() || rate <= 0.0 {
            return Err(env.invalid("PRODUCER_MESSAGES_PER_SECOND", rate, "must be positive"));
        }
        if generator.try_interval().is_none() {
            return Err(env.invalid(
                "PRODUCER_MESSAGES_PER_SECOND",
                rate,
                "interval between messages is too long",
            ));
        }

        let simulated_failure_rate: f64 = env.parse("SIMULATED_FAILURE_RATE", 0.0)?;
        if !(0.0..=1.0).contains(&simulated_failure_rate) {
            return Err(env.invalid(
                "SIMULATED_FAILURE_RATE",
                simulated_failure_rate,
                "must be between 0 and 1",
            ));
        }

        Ok(Self {
            bootstrap: env.string("BOOTSTRAP", "redis://127.0.0.1:6379"),
            topics,
            retry: RetryConfig {
                max_attempts: env.parse("RETRY_MAX_ATTEMPTS", 3)?,
                initial_backoff: env.millis("RETRY_INITIAL_BACKOFF_MS", 500)?,
            },
            consumer,
            producer: ProducerSettings {
                acks: env.parse("PRODUCER_ACKS", Acks::All)?,
                idempotent: env.flag("PRODUCER_IDEMPOTENT", true)?,
                client_id: env.string("PRODUCER_CLIENT_ID", "order-producer"),
            },
            generator,
            simulated_failure_rate,
            stats: StatsServerConfig {
                addr: env.parse("STATS_ADDR", SocketAddr::from(([0, 0, 0, 0], 4000)))?,
            },
            log_format: env.parse("LOG_FORMAT", LogFormat::Json)?,
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry.max_attempts, self.retry.initial_backoff)
    }

    pub fn loop_config(&self) -> LoopConfig {
        LoopConfig {
            primary_topic: self.topics.orders.clone(),
            retry_topic: self.topics.retry.clone(),
            poll_timeout: self.consumer.poll_timeout,
        }
    }
}

impl TopicConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        let roles = [
            ("orders", &self.orders),
            ("retry", &self.retry),
            ("dead-letter", &self.dead_letter),
        ];

        let mut seen = HashSet::new();
        for (role, name) in roles {
            if name.is_empty() {
                return Err(ConfigError::EmptyTopic(role));
            }
            if !seen.insert(name.as_str()) {
                return Err(ConfigError::DuplicateTopic(name.clone()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn load(vars: &[(&str, &str)]) -> Result<PipelineConfig, ConfigError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        PipelineConfig::from_lookup(|var| map.get(var).cloned())
    }

    #[test]
    fn defaults_match_local_setup() {
        let cfg = load(&[]).unwrap();

        assert_eq!(cfg.bootstrap, "redis://127.0.0.1:6379");
        assert_eq!(cfg.topics.orders, "orders");
        assert_eq!(cfg.topics.retry, "orders-retry");
        assert_eq!(cfg.topics.dead_letter, "orders-dlq");
        assert_eq!(cfg.retry.max_attempts, 3);
        assert_eq!(cfg.retry.initial_backoff, Duration::from_millis(500));
        assert_eq!(cfg.consumer.group_id, "order-consumer-group");
        assert_eq!(cfg.consumer.max_poll_records, 50);
        assert_eq!(cfg.consumer.poll_timeout, Duration::from_secs(1));
        assert_eq!(cfg.producer.acks, Acks::All);
        assert!(cfg.producer.idempotent);
        assert_eq!(cfg.generator.interval(), Duration::from_secs(1));
        assert_eq!(cfg.simulated_failure_rate, 0.0);
        assert_eq!(cfg.stats.addr.port(), 4000);
        assert_eq!(cfg.log_format, LogFormat::Json);
    }

    #[test]
    fn overrides_are_applied() {
        let cfg = load(&[
            ("ORDERFLOW_TOPIC_ORDERS", "o"),
            ("ORDERFLOW_TOPIC_RETRY", "r"),
            ("ORDERFLOW_TOPIC_DLQ", "d"),
            ("ORDERFLOW_RETRY_MAX_ATTEMPTS", "5"),
            ("ORDERFLOW_RETRY_INITIAL_BACKOFF_MS", "10"),
            ("ORDERFLOW_CONSUMER_MAX_POLL_RECORDS", "7"),
            ("ORDERFLOW_PRODUCER_ACKS", "1"),
            ("ORDERFLOW_PRODUCER_IDEMPOTENT", "no"),
            ("ORDERFLOW_PRODUCER_MESSAGES_PER_SECOND", "4"),
            ("ORDERFLOW_SIMULATED_FAILURE_RATE", "0.25"),
            ("ORDERFLOW_STATS_ADDR", "127.0.0.1:9000"),
            ("ORDERFLOW_LOG_FORMAT", "pretty"),
        ])
        .unwrap();

        assert_eq!(cfg.retry_policy(), RetryPolicy::new(5, Duration::from_millis(10)));
        assert_eq!(cfg.loop_config().primary_topic, "o");
        assert_eq!(cfg.loop_config().retry_topic, "r");
        assert_eq!(cfg.consumer.max_poll_records, 7);
        assert_eq!(cfg.producer.acks, Acks::Leader);
        assert!(!cfg.producer.idempotent);
        assert_eq!(cfg.generator.interval(), Duration::from_millis(250));
        assert_eq!(cfg.simulated_failure_rate, 0.25);
        assert_eq!(cfg.stats.addr, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(cfg.log_format, LogFormat::Pretty);
    }

    #[test]
    fn zero_attempts_is_allowed() {
        let cfg = load(&[("ORDERFLOW_RETRY_MAX_ATTEMPTS", "0")]).unwrap();
        assert_eq!(cfg.retry.max_attempts, 0);
    }

    #[test]
    fn blank_values_fall_back_to_defaults() {
        let cfg = load(&[("ORDERFLOW_TOPIC_ORDERS", "  ")]).unwrap();
        assert_eq!(cfg.topics.orders, "orders");
    }

    #[test]
    fn malformed_numbers_name_the_variable() {
        let err = load(&[("ORDERFLOW_RETRY_MAX_ATTEMPTS", "three")]).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid { ref var, ref value, .. }
                if var == "ORDERFLOW_RETRY_MAX_ATTEMPTS" && value == "three"
        ));
    }

    #[test]
    fn rejects_out_of_range_values() {
        assert!(load(&[("ORDERFLOW_CONSUMER_MAX_POLL_RECORDS", "0")]).is_err());
        assert!(load(&[("ORDERFLOW_SIMULATED_FAILURE_RATE", "1.5")]).is_err());
        assert!(load(&[("ORDERFLOW_PRODUCER_MESSAGES_PER_SECOND", "0")]).is_err());
        assert!(load(&[("ORDERFLOW_PRODUCER_ACKS", "2")]).is_err());
        assert!(load(&[("ORDERFLOW_PRODUCER_IDEMPOTENT", "maybe")]).is_err());
        assert!(load(&[("ORDERFLOW_LOG_FORMAT", "xml")]).is_err());
        assert!(load(&[("ORDERFLOW_STATS_ADDR", "nowhere")]).is_err());
    }

    #[test]
    fn rejects_rates_whose_interval_overflows() {
        for rate in ["1e-320", "1e-300"] {
            let err = load(&[("ORDERFLOW_PRODUCER_MESSAGES_PER_SECOND", rate)]).unwrap_err();
            assert!(matches!(
                err,
                ConfigError::Invalid { ref var, .. }
                    if var == "ORDERFLOW_PRODUCER_MESSAGES_PER_SECOND"
            ));
        }

        let slow = load(&[("ORDERFLOW_PRODUCER_MESSAGES_PER_SECOND", "0.5")]).unwrap();
        assert_eq!(slow.generator.interval(), Duration::from_secs(2));
    }

    #[test]
    fn interval_saturates_instead_of_panicking() {
        let generator = GeneratorConfig {
            messages_per_second: 1e-320,
        };
        assert_eq!(generator.interval(), Duration::MAX);
    }

    #[test]
    fn topics_must_be_distinct() {
        let err = load(&[("ORDERFLOW_TOPIC_DLQ", "orders")]).unwrap_err();
        assert_eq!(err, ConfigError::DuplicateTopic("orders".to_string()));
    }
}
