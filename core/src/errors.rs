use std::{error::Error, fmt};

use tokio::task::JoinError;

use crate::{
    idempotency::GuardStoreError, migrations::MigrationError, models::Delivery,
    supervisor::SupervisorError,
};

/// Provides a custom error type to be used for failures
/// in reading or updating entities.
#[derive(Debug)]
pub enum EntityStoreError {
    /// The destination existed but has been deleted, deliveries that
    /// reference it are dropped rather than retried.
    DestinationDeleted,
    Internal(Box<dyn Error + Send + Sync + 'static>),
}

impl fmt::Display for EntityStoreError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            EntityStoreError::DestinationDeleted => {
                write!(f, "entity store error: destination has been deleted")
            }
            EntityStoreError::Internal(source) => {
                write!(f, "entity store error: {source}")
            }
        }
    }
}

impl Error for EntityStoreError {}

/// Provides a custom error type to be used for failures
/// in reading from or writing to the log store.
#[derive(Debug)]
pub enum LogStoreError {
    Internal(Box<dyn Error + Send + Sync + 'static>),
}

impl fmt::Display for LogStoreError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LogStoreError::Internal(source) => write!(f, "log store error: {source}"),
        }
    }
}

impl Error for LogStoreError {}

/// The error surface of a destination adapter invocation.
#[derive(Debug)]
pub enum DestinationPublishError {
    /// The adapter contacted the destination and produced a structured
    /// failed attempt. These failures are logged and eligible for retry.
    Attempt { delivery: Delivery, reason: String },
    /// The adapter failed in an unstructured way. When a delivery record
    /// was still produced it is logged, otherwise the broker redelivers
    /// the task.
    Failed {
        delivery: Option<Delivery>,
        source: Box<dyn Error + Send + Sync + 'static>,
    },
}

impl fmt::Display for DestinationPublishError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DestinationPublishError::Attempt { reason, .. } => {
                write!(f, "destination publish attempt failed: {reason}")
            }
            DestinationPublishError::Failed { source, .. } => {
                write!(f, "destination publish failed: {source}")
            }
        }
    }
}

impl Error for DestinationPublishError {}

/// The classification of a failure that occurred before the destination
/// adapter was contacted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreDeliveryKind {
    /// The delivery task could not be parsed.
    Parse,
    /// The event referenced by a retry task is not in the log store.
    EventNotFound,
    DestinationDeleted,
    DestinationNotFound,
    DestinationDisabled,
    /// A transient system failure, e.g. the entity store or log store
    /// being unreachable.
    System,
}

/// A failure raised before the destination adapter was contacted.
/// No audit record is emitted for these, permanent conditions are
/// acked away and transient ones are nacked for broker redelivery.
#[derive(Debug)]
pub struct PreDeliveryError {
    pub kind: PreDeliveryKind,
    pub reason: String,
}

impl PreDeliveryError {
    pub fn new(kind: PreDeliveryKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
        }
    }

    /// Permanent conditions are acknowledged, there is nothing a
    /// redelivery could change.
    pub fn should_ack(&self) -> bool {
        matches!(
            self.kind,
            PreDeliveryKind::EventNotFound
                | PreDeliveryKind::DestinationDeleted
                | PreDeliveryKind::DestinationDisabled
        )
    }
}

impl fmt::Display for PreDeliveryError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "pre-delivery error ({kind:?}): {reason}",
            kind = self.kind,
            reason = self.reason
        )
    }
}

impl Error for PreDeliveryError {}

/// Whether an attempt failure was a structured publish attempt
/// (retry owns its lifecycle) or an opaque adapter failure
/// (the broker redelivers).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptErrorKind {
    PublishAttempt,
    Other,
}

/// A failure reported by the destination adapter together with the
/// structured delivery record describing the failed attempt.
#[derive(Debug)]
pub struct AttemptError {
    pub delivery: Delivery,
    pub kind: AttemptErrorKind,
    pub reason: String,
}

impl AttemptError {
    pub fn is_publish_attempt(&self) -> bool {
        self.kind == AttemptErrorKind::PublishAttempt
    }
}

impl fmt::Display for AttemptError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "attempt error: {reason}", reason = self.reason)
    }
}

impl Error for AttemptError {}

/// A failure emitting the audit record after the delivery outcome was
/// already decided. The broker redelivers, the guard's processing
/// marker serializes concurrent duplicates of the attempt.
#[derive(Debug)]
pub struct PostDeliveryError {
    pub reason: String,
}

impl PostDeliveryError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl fmt::Display for PostDeliveryError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "post-delivery error: {reason}", reason = self.reason)
    }
}

impl Error for PostDeliveryError {}

/// The failure classes that travel the delivery pipeline,
/// discriminating the stage at which a delivery attempt failed.
#[derive(Debug)]
pub enum DeliveryError {
    PreDelivery(PreDeliveryError),
    Attempt(AttemptError),
    PostDelivery(PostDeliveryError),
}

impl DeliveryError {
    /// The broker disposition for this failure. Acked failures are
    /// terminal, nacked ones are redelivered after the broker's
    /// visibility timeout.
    pub fn should_ack(&self) -> bool {
        match self {
            DeliveryError::PreDelivery(err) => err.should_ack(),
            DeliveryError::Attempt(err) => err.is_publish_attempt(),
            DeliveryError::PostDelivery(_) => false,
        }
    }
}

impl fmt::Display for DeliveryError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DeliveryError::PreDelivery(err) => write!(f, "{err}"),
            DeliveryError::Attempt(err) => write!(f, "{err}"),
            DeliveryError::PostDelivery(err) => write!(f, "{err}"),
        }
    }
}

impl Error for DeliveryError {}

impl From<PreDeliveryError> for DeliveryError {
    fn from(error: PreDeliveryError) -> Self {
        DeliveryError::PreDelivery(error)
    }
}

impl From<AttemptError> for DeliveryError {
    fn from(error: AttemptError) -> Self {
        DeliveryError::Attempt(error)
    }
}

impl From<PostDeliveryError> for DeliveryError {
    fn from(error: PostDeliveryError) -> Self {
        DeliveryError::PostDelivery(error)
    }
}

/// Provides a custom error type to be used for failures
/// in handling a published event.
#[derive(Debug)]
pub enum PublishError {
    /// The platform is configured with a topic allow-list and the event
    /// did not specify a topic.
    TopicRequired,
    /// The event's topic is not in the configured topic allow-list.
    InvalidTopic(String),
    EntityStore(EntityStoreError),
    /// Another process is concurrently publishing the same event.
    Conflict,
    Guard(GuardStoreError),
    /// One or more destinations could not be enqueued, the guarded
    /// section was aborted so the publish may be retried.
    FanOut(String),
}

impl fmt::Display for PublishError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PublishError::TopicRequired => write!(f, "publish error: topic required"),
            PublishError::InvalidTopic(topic) => {
                write!(f, "publish error: invalid topic {topic}")
            }
            PublishError::EntityStore(err) => write!(f, "publish error: {err}"),
            PublishError::Conflict => {
                write!(f, "publish error: event is being processed concurrently")
            }
            PublishError::Guard(err) => write!(f, "publish error: {err}"),
            PublishError::FanOut(reason) => {
                write!(f, "publish error: failed to enqueue delivery tasks: {reason}")
            }
        }
    }
}

impl Error for PublishError {}

impl From<EntityStoreError> for PublishError {
    fn from(error: EntityStoreError) -> Self {
        PublishError::EntityStore(error)
    }
}

/// Provides a custom error type to be used for failures
/// in gathering runtime configuration from the environment.
#[derive(Debug)]
pub enum ConfigError {
    Missing(String),
    Invalid { name: String, reason: String },
    /// The retry visibility timeout must exceed the scheduler poll
    /// backoff, otherwise a popped retry can become visible again while
    /// it is still being re-emitted.
    VisibilityTimeoutTooShort { reason: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigError::Missing(name) => {
                write!(f, "config error: missing environment variable {name}")
            }
            ConfigError::Invalid { name, reason } => {
                write!(f, "config error: invalid value for {name}: {reason}")
            }
            ConfigError::VisibilityTimeoutTooShort { reason } => {
                write!(f, "config error: retry visibility timeout too short: {reason}")
            }
        }
    }
}

impl Error for ConfigError {}

/// Provides a custom error type to be used for failures
/// in starting the application.
#[derive(Debug)]
pub enum ApplicationStartError {
    Config(ConfigError),
    Redis(redis::RedisError),
    Migration(MigrationError),
    Environment(String),
    Supervisor(SupervisorError),
    // An error occurred while blocking on one of the long-running
    // tasks to complete.
    TaskWaitError(JoinError),
}

impl fmt::Display for ApplicationStartError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ApplicationStartError::Config(config_error) => {
                write!(f, "application start error: {config_error}")
            }
            ApplicationStartError::Redis(redis_error) => {
                write!(f, "application start error: {redis_error}")
            }
            ApplicationStartError::Migration(migration_error) => {
                write!(f, "application start error: {migration_error}")
            }
            ApplicationStartError::Environment(env_error) => {
                write!(f, "application start error: {env_error}")
            }
            ApplicationStartError::Supervisor(supervisor_error) => {
                write!(f, "application start error: {supervisor_error}")
            }
            ApplicationStartError::TaskWaitError(join_error) => {
                write!(f, "application start error: {join_error}")
            }
        }
    }
}

impl Error for ApplicationStartError {}

impl From<ConfigError> for ApplicationStartError {
    fn from(error: ConfigError) -> Self {
        ApplicationStartError::Config(error)
    }
}

impl From<redis::RedisError> for ApplicationStartError {
    fn from(error: redis::RedisError) -> Self {
        ApplicationStartError::Redis(error)
    }
}

impl From<MigrationError> for ApplicationStartError {
    fn from(error: MigrationError) -> Self {
        ApplicationStartError::Migration(error)
    }
}

impl From<SupervisorError> for ApplicationStartError {
    fn from(error: SupervisorError) -> Self {
        ApplicationStartError::Supervisor(error)
    }
}

impl From<JoinError> for ApplicationStartError {
    fn from(error: JoinError) -> Self {
        ApplicationStartError::TaskWaitError(error)
    }
}
