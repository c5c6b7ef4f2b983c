use std::{str::FromStr, time::Duration};

use outpost_helpers::{env::EnvVars, redis::ConnectionConfig};
use tracing::warn;

use crate::{errors::ConfigError, retry::backoff::Backoff};

const DEFAULT_RETRY_MAX_LIMIT: u32 = 10;
const DEFAULT_RETRY_BACKOFF_INTERVAL_SECONDS: u64 = 30;
const DEFAULT_RETRY_BACKOFF_BASE: f64 = 2.0;
const DEFAULT_DELIVERY_TIMEOUT_SECONDS: u64 = 5;
const DEFAULT_IDEMPOTENCY_KEY_TTL_SECONDS: u64 = 86_400;
const DEFAULT_MAX_CONCURRENCY: usize = 10;
const DEFAULT_RETRY_VISIBILITY_TIMEOUT_SECONDS: u64 = 30;
const DEFAULT_SCHEDULER_POLL_BACKOFF_MS: u64 = 1_000;
const DEFAULT_LOG_BATCH_SIZE: usize = 100;
const DEFAULT_LOG_BATCH_THRESHOLD_SECONDS: u64 = 5;
const DEFAULT_ALERT_CONSECUTIVE_FAILURE_COUNT: u64 = 20;
const DEFAULT_HEALTH_PORT: u16 = 4000;
const DEFAULT_SHUTDOWN_TIMEOUT_SECONDS: u64 = 30;

/// The message queue backend the pipeline's logical queues run on.
#[derive(Debug, Clone, PartialEq)]
pub enum MqBackendConfig {
    /// In-process queues, for local development and tests.
    InMemory,
    Sqs {
        publish_queue_url: String,
        delivery_queue_url: String,
        log_queue_url: String,
    },
    RabbitMq {
        url: String,
    },
}

/// Configuration for failure alerting.
#[derive(Debug, Clone)]
pub struct AlertConfig {
    pub consecutive_failure_count: u64,
    pub auto_disable_destination: bool,
    pub callback_url: Option<String>,
    pub callback_bearer_token: Option<String>,
}

/// Core runtime configuration sourced from the process environment.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// The key-namespace prefix separating deployments that share a
    /// Redis instance.
    pub deployment_id: Option<String>,
    /// The topic allow-list for published events. Empty disables topic
    /// validation.
    pub topics: Vec<String>,
    pub retry_max_limit: u32,
    pub retry_backoff: Backoff,
    pub delivery_timeout: Duration,
    pub delivery_idempotency_key_ttl: Duration,
    pub publish_idempotency_key_ttl: Duration,
    pub delivery_max_concurrency: usize,
    pub publish_max_concurrency: usize,
    /// How long a popped retry message stays invisible. Must exceed the
    /// scheduler poll backoff, which bounds the monitor's pop-to-publish
    /// latency, or a message could become visible while it is still
    /// being re-emitted.
    pub retry_visibility_timeout: Duration,
    pub scheduler_poll_backoff: Duration,
    pub log_batch_size: usize,
    pub log_batch_threshold: Duration,
    pub alert: AlertConfig,
    /// Absent in the fully in-memory local mode.
    pub redis: Option<ConnectionConfig>,
    pub mq_backend: MqBackendConfig,
    pub health_port: u16,
    pub log_retention_ttl: Option<Duration>,
    pub shutdown_timeout: Option<Duration>,
}

impl RuntimeConfig {
    /// Creates a new instance of runtime configuration, sourcing config
    /// from the current process environment variables.
    pub fn from_env(env: &impl EnvVars) -> Result<Self, ConfigError> {
        let deployment_id = optional_var(env, "OUTPOST_DEPLOYMENT_ID");
        let topics = optional_var(env, "OUTPOST_TOPICS")
            .map(|topics| {
                topics
                    .split(',')
                    .map(|topic| topic.trim().to_string())
                    .filter(|topic| !topic.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        let retry_max_limit =
            parse_var(env, "OUTPOST_RETRY_MAX_LIMIT", DEFAULT_RETRY_MAX_LIMIT)?;
        let retry_backoff = backoff_from_env(env)?;
        let delivery_timeout = Duration::from_secs(parse_var(
            env,
            "OUTPOST_DELIVERY_TIMEOUT_SECONDS",
            DEFAULT_DELIVERY_TIMEOUT_SECONDS,
        )?);
        let delivery_idempotency_key_ttl = Duration::from_secs(parse_var(
            env,
            "OUTPOST_DELIVERY_IDEMPOTENCY_KEY_TTL_SECONDS",
            DEFAULT_IDEMPOTENCY_KEY_TTL_SECONDS,
        )?);
        let publish_idempotency_key_ttl = Duration::from_secs(parse_var(
            env,
            "OUTPOST_PUBLISH_IDEMPOTENCY_KEY_TTL_SECONDS",
            DEFAULT_IDEMPOTENCY_KEY_TTL_SECONDS,
        )?);
        let delivery_max_concurrency = parse_var(
            env,
            "OUTPOST_DELIVERY_MAX_CONCURRENCY",
            DEFAULT_MAX_CONCURRENCY,
        )?;
        let publish_max_concurrency = parse_var(
            env,
            "OUTPOST_PUBLISH_MAX_CONCURRENCY",
            DEFAULT_MAX_CONCURRENCY,
        )?;
        let retry_visibility_timeout = Duration::from_secs(parse_var(
            env,
            "OUTPOST_RETRY_VISIBILITY_TIMEOUT_SECONDS",
            DEFAULT_RETRY_VISIBILITY_TIMEOUT_SECONDS,
        )?);
        let scheduler_poll_backoff = Duration::from_millis(parse_var(
            env,
            "OUTPOST_SCHEDULER_POLL_BACKOFF_MS",
            DEFAULT_SCHEDULER_POLL_BACKOFF_MS,
        )?);
        let log_batch_size =
            parse_var(env, "OUTPOST_LOG_BATCH_SIZE", DEFAULT_LOG_BATCH_SIZE)?;
        let log_batch_threshold = Duration::from_secs(parse_var(
            env,
            "OUTPOST_LOG_BATCH_THRESHOLD_SECONDS",
            DEFAULT_LOG_BATCH_THRESHOLD_SECONDS,
        )?);

        let alert = AlertConfig {
            consecutive_failure_count: parse_var(
                env,
                "OUTPOST_ALERT_CONSECUTIVE_FAILURE_COUNT",
                DEFAULT_ALERT_CONSECUTIVE_FAILURE_COUNT,
            )?,
            auto_disable_destination: parse_var(
                env,
                "OUTPOST_ALERT_AUTO_DISABLE_DESTINATION",
                true,
            )?,
            callback_url: optional_var(env, "OUTPOST_ALERT_CALLBACK_URL"),
            callback_bearer_token: optional_var(env, "OUTPOST_ALERT_CALLBACK_BEARER_TOKEN"),
        };

        let redis = optional_var(env, "OUTPOST_REDIS_NODES").map(|nodes| {
            Ok::<ConnectionConfig, ConfigError>(ConnectionConfig {
                nodes: nodes
                    .split(',')
                    .map(|node| node.trim().to_string())
                    .filter(|node| !node.is_empty())
                    .collect(),
                password: optional_var(env, "OUTPOST_REDIS_PASSWORD"),
                cluster_mode: parse_var(env, "OUTPOST_REDIS_CLUSTER_MODE", false)?,
            })
        });
        let redis = redis.transpose()?;

        let mq_backend = mq_backend_from_env(env)?;
        let health_port = parse_var(env, "OUTPOST_HEALTH_PORT", DEFAULT_HEALTH_PORT)?;
        let log_retention_ttl =
            parse_optional::<u64>(env, "OUTPOST_LOG_RETENTION_TTL_SECONDS")?
                .map(Duration::from_secs);
        let shutdown_timeout = Duration::from_secs(parse_var(
            env,
            "OUTPOST_SHUTDOWN_TIMEOUT_SECONDS",
            DEFAULT_SHUTDOWN_TIMEOUT_SECONDS,
        )?);

        let config = RuntimeConfig {
            deployment_id,
            topics,
            retry_max_limit,
            retry_backoff,
            delivery_timeout,
            delivery_idempotency_key_ttl,
            publish_idempotency_key_ttl,
            delivery_max_concurrency,
            publish_max_concurrency,
            retry_visibility_timeout,
            scheduler_poll_backoff,
            log_batch_size,
            log_batch_threshold,
            alert,
            redis,
            mq_backend,
            health_port,
            log_retention_ttl,
            shutdown_timeout: Some(shutdown_timeout),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry_visibility_timeout <= self.scheduler_poll_backoff {
            return Err(ConfigError::VisibilityTimeoutTooShort {
                reason: format!(
                    "{visibility:?} must exceed the scheduler poll backoff {poll:?}",
                    visibility = self.retry_visibility_timeout,
                    poll = self.scheduler_poll_backoff,
                ),
            });
        }

        let retry_horizon = self.retry_horizon();
        if self.delivery_idempotency_key_ttl < retry_horizon {
            warn!(
                ttl_seconds = self.delivery_idempotency_key_ttl.as_secs(),
                horizon_seconds = retry_horizon.as_secs(),
                "delivery idempotency TTL is shorter than the retry horizon, duplicate adapter calls become possible"
            );
        }
        Ok(())
    }

    /// The worst-case time from the first attempt to the last retry,
    /// the window the delivery idempotency TTL should cover.
    fn retry_horizon(&self) -> Duration {
        (0..self.retry_max_limit).fold(Duration::ZERO, |total, attempt| {
            total.saturating_add(self.retry_backoff.duration(attempt))
        })
    }
}

fn backoff_from_env(env: &impl EnvVars) -> Result<Backoff, ConfigError> {
    let kind = optional_var(env, "OUTPOST_RETRY_BACKOFF_KIND")
        .unwrap_or_else(|| "exponential".to_string());
    let interval = Duration::from_secs(parse_var(
        env,
        "OUTPOST_RETRY_BACKOFF_INTERVAL_SECONDS",
        DEFAULT_RETRY_BACKOFF_INTERVAL_SECONDS,
    )?);

    match kind.as_str() {
        "constant" => Ok(Backoff::Constant { interval }),
        "exponential" => Ok(Backoff::Exponential {
            interval,
            base: parse_var(
                env,
                "OUTPOST_RETRY_BACKOFF_BASE",
                DEFAULT_RETRY_BACKOFF_BASE,
            )?,
        }),
        "scheduled" => {
            let schedule = optional_var(env, "OUTPOST_RETRY_BACKOFF_SCHEDULE_SECONDS")
                .unwrap_or_default()
                .split(',')
                .map(str::trim)
                .filter(|entry| !entry.is_empty())
                .map(|entry| {
                    entry.parse::<u64>().map(Duration::from_secs).map_err(|_| {
                        ConfigError::Invalid {
                            name: "OUTPOST_RETRY_BACKOFF_SCHEDULE_SECONDS".to_string(),
                            reason: format!("{entry} is not a valid number of seconds"),
                        }
                    })
                })
                .collect::<Result<Vec<Duration>, ConfigError>>()?;
            Ok(Backoff::Scheduled { schedule })
        }
        kind => Err(ConfigError::Invalid {
            name: "OUTPOST_RETRY_BACKOFF_KIND".to_string(),
            reason: format!("{kind} is not one of constant, exponential, scheduled"),
        }),
    }
}

fn mq_backend_from_env(env: &impl EnvVars) -> Result<MqBackendConfig, ConfigError> {
    let backend =
        optional_var(env, "OUTPOST_MQS_BACKEND").unwrap_or_else(|| "memory".to_string());
    match backend.as_str() {
        "memory" => Ok(MqBackendConfig::InMemory),
        "sqs" => Ok(MqBackendConfig::Sqs {
            publish_queue_url: required_var(env, "OUTPOST_SQS_PUBLISH_QUEUE_URL")?,
            delivery_queue_url: required_var(env, "OUTPOST_SQS_DELIVERY_QUEUE_URL")?,
            log_queue_url: required_var(env, "OUTPOST_SQS_LOG_QUEUE_URL")?,
        }),
        "rabbitmq" => Ok(MqBackendConfig::RabbitMq {
            url: required_var(env, "OUTPOST_RABBITMQ_URL")?,
        }),
        backend => Err(ConfigError::Invalid {
            name: "OUTPOST_MQS_BACKEND".to_string(),
            reason: format!("{backend} is not one of memory, sqs, rabbitmq"),
        }),
    }
}

fn optional_var(env: &impl EnvVars, key: &str) -> Option<String> {
    env.var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn required_var(env: &impl EnvVars, key: &str) -> Result<String, ConfigError> {
    optional_var(env, key).ok_or_else(|| ConfigError::Missing(key.to_string()))
}

fn parse_var<T: FromStr>(env: &impl EnvVars, key: &str, default: T) -> Result<T, ConfigError> {
    match optional_var(env, key) {
        None => Ok(default),
        Some(value) => value.parse().map_err(|_| ConfigError::Invalid {
            name: key.to_string(),
            reason: format!("could not parse {value}"),
        }),
    }
}

fn parse_optional<T: FromStr>(env: &impl EnvVars, key: &str) -> Result<Option<T>, ConfigError> {
    match optional_var(env, key) {
        None => Ok(None),
        Some(value) => value.parse().map(Some).map_err(|_| ConfigError::Invalid {
            name: key.to_string(),
            reason: format!("could not parse {value}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use outpost_helpers::env::StaticEnvVars;
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_defaults_apply_without_environment() {
        let config = RuntimeConfig::from_env(&StaticEnvVars::default()).unwrap();

        assert_eq!(config.deployment_id, None);
        assert_eq!(config.topics, Vec::<String>::new());
        assert_eq!(config.retry_max_limit, 10);
        assert_eq!(
            config.retry_backoff,
            Backoff::Exponential {
                interval: Duration::from_secs(30),
                base: 2.0,
            }
        );
        assert_eq!(config.delivery_max_concurrency, 10);
        assert_eq!(config.mq_backend, MqBackendConfig::InMemory);
        assert!(config.redis.is_none());
        assert_eq!(config.log_batch_size, 100);
    }

    #[test]
    fn test_parses_scheduled_backoff_and_topics() {
        let env = StaticEnvVars::new(&[
            ("OUTPOST_TOPICS", "orders.created, invoices.paid"),
            ("OUTPOST_RETRY_BACKOFF_KIND", "scheduled"),
            ("OUTPOST_RETRY_BACKOFF_SCHEDULE_SECONDS", "1,10,60"),
        ]);
        let config = RuntimeConfig::from_env(&env).unwrap();

        assert_eq!(config.topics, vec!["orders.created", "invoices.paid"]);
        assert_eq!(
            config.retry_backoff,
            Backoff::Scheduled {
                schedule: vec![
                    Duration::from_secs(1),
                    Duration::from_secs(10),
                    Duration::from_secs(60),
                ],
            }
        );
    }

    #[test]
    fn test_rejects_visibility_timeout_below_poll_backoff() {
        let env = StaticEnvVars::new(&[
            ("OUTPOST_RETRY_VISIBILITY_TIMEOUT_SECONDS", "1"),
            ("OUTPOST_SCHEDULER_POLL_BACKOFF_MS", "2000"),
        ]);
        let result = RuntimeConfig::from_env(&env);
        assert!(matches!(
            result,
            Err(ConfigError::VisibilityTimeoutTooShort { .. })
        ));
    }

    #[test]
    fn test_sqs_backend_requires_queue_urls() {
        let env = StaticEnvVars::new(&[("OUTPOST_MQS_BACKEND", "sqs")]);
        let result = RuntimeConfig::from_env(&env);
        assert!(matches!(result, Err(ConfigError::Missing(_))));

        let env = StaticEnvVars::new(&[
            ("OUTPOST_MQS_BACKEND", "sqs"),
            ("OUTPOST_SQS_PUBLISH_QUEUE_URL", "https://sqs/publish"),
            ("OUTPOST_SQS_DELIVERY_QUEUE_URL", "https://sqs/delivery"),
            ("OUTPOST_SQS_LOG_QUEUE_URL", "https://sqs/log"),
        ]);
        let config = RuntimeConfig::from_env(&env).unwrap();
        assert_eq!(
            config.mq_backend,
            MqBackendConfig::Sqs {
                publish_queue_url: "https://sqs/publish".to_string(),
                delivery_queue_url: "https://sqs/delivery".to_string(),
                log_queue_url: "https://sqs/log".to_string(),
            }
        );
    }

    #[test]
    fn test_redis_nodes_enable_the_redis_config() {
        let env = StaticEnvVars::new(&[
            ("OUTPOST_REDIS_NODES", "redis://one:6379,redis://two:6379"),
            ("OUTPOST_REDIS_CLUSTER_MODE", "true"),
        ]);
        let config = RuntimeConfig::from_env(&env).unwrap();
        let redis = config.redis.unwrap();
        assert_eq!(redis.nodes.len(), 2);
        assert!(redis.cluster_mode);
    }

    #[test]
    fn test_rejects_unknown_backoff_kind() {
        let env = StaticEnvVars::new(&[("OUTPOST_RETRY_BACKOFF_KIND", "fibonacci")]);
        assert!(matches!(
            RuntimeConfig::from_env(&env),
            Err(ConfigError::Invalid { .. })
        ));
    }
}
