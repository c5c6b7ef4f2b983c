/// The logical queue the publish handler consumes from.
pub const PUBLISH_QUEUE: &str = "publishmq";

/// The logical queue the delivery handler consumes from.
pub const DELIVERY_QUEUE: &str = "deliverymq";

/// The logical queue the log batcher consumes from.
pub const LOG_QUEUE: &str = "logmq";

/// The name of the retry delay queue in the RSMQ namespace.
pub const RETRY_QUEUE: &str = "retry";

/// The key holding the current schema version of the Redis-backed
/// entity store.
pub const SCHEMA_VERSION_KEY: &str = "outpost:schema:version";

/// The cross-process lock taken while schema migrations run.
pub const MIGRATION_LOCK_KEY: &str = "outpost:migration:lock";

/// Migrations are bounded by a one hour lock TTL, a crashed migrator
/// frees the lock for the next process after this window.
pub const MIGRATION_LOCK_TTL_MS: u64 = 3_600_000;

/// The key recording the state of a single named migration.
pub fn migration_state_key(name: &str) -> String {
    format!("outpost:migration:{name}:state")
}

/// The key recording the log retention TTL that has been applied
/// to the log store for a deployment.
pub fn log_retention_ttl_key(deployment_id: Option<&str>) -> String {
    match deployment_id {
        Some(deployment_id) => format!("{deployment_id}:outpost:log_retention_ttl"),
        None => "outpost:log_retention_ttl".to_string(),
    }
}

/// Applies the optional deployment namespace prefix to a key.
pub fn deployment_key(deployment_id: Option<&str>, key: &str) -> String {
    match deployment_id {
        Some(deployment_id) => format!("deployment:{deployment_id}:{key}"),
        None => key.to_string(),
    }
}

/// The key holding a tenant record.
/// The hash-tag braces around the tenant ID are required for
/// cluster-slot colocation of all keys belonging to a tenant.
pub fn tenant_key(deployment_id: Option<&str>, tenant_id: &str) -> String {
    deployment_key(deployment_id, &format!("tenant:{{{tenant_id}}}:tenant"))
}

/// The key holding the set of destination IDs registered by a tenant.
pub fn tenant_destinations_key(deployment_id: Option<&str>, tenant_id: &str) -> String {
    deployment_key(
        deployment_id,
        &format!("tenant:{{{tenant_id}}}:destinations"),
    )
}

/// The key holding a single destination record owned by a tenant.
pub fn tenant_destination_key(
    deployment_id: Option<&str>,
    tenant_id: &str,
    destination_id: &str,
) -> String {
    deployment_key(
        deployment_id,
        &format!("tenant:{{{tenant_id}}}:destination:{destination_id}"),
    )
}

/// The key holding the consecutive-failure counter for a destination,
/// colocated with the rest of the tenant's keys.
pub fn alert_failure_key(
    deployment_id: Option<&str>,
    tenant_id: &str,
    destination_id: &str,
) -> String {
    deployment_key(
        deployment_id,
        &format!("alert:{{{tenant_id}}}:failures:{destination_id}"),
    )
}

/// The idempotence guard key for publishing an event.
pub fn publish_idempotency_key(event_id: &str) -> String {
    format!("idempotency:publishmq:{event_id}")
}

/// The idempotence guard key for a single delivery attempt.
pub fn delivery_idempotency_key(task_key: &str) -> String {
    format!("idempotency:deliverymq:{task_key}")
}
