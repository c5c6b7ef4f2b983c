use std::{
    collections::HashMap,
    error::Error,
    fmt::{self, Debug},
    future::Future,
    pin::Pin,
    time::Duration,
};

use async_trait::async_trait;
use outpost_helpers::redis::ConnectionWrapper;
use tokio::{sync::Mutex, time::Instant};
use tracing::warn;

/// The marker stored while the guarded function is running.
const PROCESSING: &str = "processing";
/// The marker stored once the guarded function has completed.
const PROCESSED: &str = "processed";

/// A pinned future to be executed at most once per key.
pub type GuardedFuture<'a, E> = Pin<Box<dyn Future<Output = Result<(), E>> + Send + 'a>>;

/// Whether a guarded call actually ran the function or found it
/// already completed by a previous call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecOutcome {
    Executed,
    AlreadyProcessed,
}

/// Provides a custom error type to be used for failures
/// in the key store backing the idempotence guard.
#[derive(Debug)]
pub struct GuardStoreError {
    message: String,
}

impl GuardStoreError {
    pub fn new(message: String) -> Self {
        Self { message }
    }
}

impl fmt::Display for GuardStoreError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "guard store error: {}", self.message)
    }
}

impl Error for GuardStoreError {}

impl From<redis::RedisError> for GuardStoreError {
    fn from(error: redis::RedisError) -> Self {
        GuardStoreError::new(error.to_string())
    }
}

/// Provides a custom error type to be used for failures
/// in executing a function under the idempotence guard.
#[derive(Debug)]
pub enum IdempotencyError<E> {
    /// Another process holds the guard past its timeout window.
    Conflict,
    Store(GuardStoreError),
    /// The guarded function itself failed, the key has been cleared so
    /// the next caller may try again.
    Execution(E),
}

impl<E: fmt::Display> fmt::Display for IdempotencyError<E> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            IdempotencyError::Conflict => {
                write!(f, "idempotency error: key is being processed concurrently")
            }
            IdempotencyError::Store(err) => write!(f, "idempotency error: {err}"),
            IdempotencyError::Execution(err) => write!(f, "idempotency error: {err}"),
        }
    }
}

impl<E: fmt::Display + Debug> Error for IdempotencyError<E> {}

/// The key-value operations the guard needs, a seam over Redis so the
/// guard protocol can be exercised against an in-memory store.
#[async_trait]
pub trait GuardStore: Send + Sync {
    /// Sets the key only if it does not exist, returning whether it was
    /// set. Maps to `SET NX PX` on Redis.
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl_ms: u64,
    ) -> Result<bool, GuardStoreError>;

    async fn get(&self, key: &str) -> Result<Option<String>, GuardStoreError>;

    async fn set(&self, key: &str, value: &str, ttl_ms: u64) -> Result<(), GuardStoreError>;

    async fn delete(&self, key: &str) -> Result<(), GuardStoreError>;
}

/// Executes a function at most once per key across the cluster.
#[async_trait]
pub trait IdempotentExecutor<E: Send + 'static>: Send + Sync {
    async fn exec<'a>(
        &self,
        key: &str,
        fut: GuardedFuture<'a, E>,
    ) -> Result<ExecOutcome, IdempotencyError<E>>;
}

/// Configuration for the idempotence guard.
#[derive(Debug, Clone)]
pub struct IdempotenceConfig {
    /// The TTL of the `processing` marker. A crashed holder frees the
    /// key for the next caller after this window.
    pub timeout: Duration,
    /// The TTL of the `processed` marker. This must absorb the full
    /// retry lifetime of the caller, including the broker's redelivery
    /// horizon, to keep duplicate executions out.
    pub successful_ttl: Duration,
}

/// The distributed at-most-once critical section.
///
/// The guard takes the key with a `SET NX PX processing`, stamps it
/// `processed` on success, and clears it on failure so the next caller
/// may try. Contending callers wait one guard timeout before deciding
/// between "already done" and a conflict.
pub struct Idempotence<S: GuardStore> {
    store: S,
    config: IdempotenceConfig,
}

impl<S: GuardStore> Idempotence<S> {
    pub fn new(store: S, config: IdempotenceConfig) -> Self {
        Self { store, config }
    }

    async fn resolve_contention<E: Send>(
        &self,
        key: &str,
    ) -> Result<ExecOutcome, IdempotencyError<E>> {
        let current = self
            .store
            .get(key)
            .await
            .map_err(IdempotencyError::Store)?;
        if current.as_deref() == Some(PROCESSED) {
            return Ok(ExecOutcome::AlreadyProcessed);
        }

        // The holder is still processing, give it one guard timeout
        // plus a second of slack to finish before reporting a conflict.
        tokio::time::sleep(self.config.timeout + Duration::from_secs(1)).await;
        let current = self
            .store
            .get(key)
            .await
            .map_err(IdempotencyError::Store)?;
        if current.as_deref() == Some(PROCESSED) {
            return Ok(ExecOutcome::AlreadyProcessed);
        }
        Err(IdempotencyError::Conflict)
    }
}

#[async_trait]
impl<S: GuardStore, E: Send + 'static> IdempotentExecutor<E> for Idempotence<S> {
    async fn exec<'a>(
        &self,
        key: &str,
        fut: GuardedFuture<'a, E>,
    ) -> Result<ExecOutcome, IdempotencyError<E>> {
        let acquired = self
            .store
            .set_if_absent(key, PROCESSING, self.config.timeout.as_millis() as u64)
            .await
            .map_err(IdempotencyError::Store)?;
        if !acquired {
            return self.resolve_contention(key).await;
        }

        match fut.await {
            Ok(()) => {
                self.store
                    .set(
                        key,
                        PROCESSED,
                        self.config.successful_ttl.as_millis() as u64,
                    )
                    .await
                    .map_err(IdempotencyError::Store)?;
                Ok(ExecOutcome::Executed)
            }
            Err(err) => {
                if let Err(store_err) = self.store.delete(key).await {
                    warn!("failed to clear idempotency key {key}: {store_err}");
                }
                Err(IdempotencyError::Execution(err))
            }
        }
    }
}

/// The Redis-backed guard store used in production.
pub struct RedisGuardStore {
    connection: ConnectionWrapper,
}

impl RedisGuardStore {
    pub fn new(connection: ConnectionWrapper) -> Self {
        Self { connection }
    }
}

#[async_trait]
impl GuardStore for RedisGuardStore {
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl_ms: u64,
    ) -> Result<bool, GuardStoreError> {
        let mut connection = self.connection.clone();
        Ok(connection.pset_ex_nx(key, value, ttl_ms).await?)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, GuardStoreError> {
        let mut connection = self.connection.clone();
        Ok(connection.get(key).await?)
    }

    async fn set(&self, key: &str, value: &str, ttl_ms: u64) -> Result<(), GuardStoreError> {
        let mut connection = self.connection.clone();
        connection.pset_ex(key, value, ttl_ms).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), GuardStoreError> {
        let mut connection = self.connection.clone();
        connection.del(key).await?;
        Ok(())
    }
}

/// An in-memory guard store with TTL semantics, used for local
/// development and tests.
pub struct InMemoryGuardStore {
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl InMemoryGuardStore {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryGuardStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GuardStore for InMemoryGuardStore {
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl_ms: u64,
    ) -> Result<bool, GuardStoreError> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        let live = entries
            .get(key)
            .map(|(_, expires_at)| *expires_at > now)
            .unwrap_or(false);
        if live {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            (value.to_string(), now + Duration::from_millis(ttl_ms)),
        );
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, GuardStoreError> {
        let entries = self.entries.lock().await;
        let now = Instant::now();
        Ok(entries
            .get(key)
            .filter(|(_, expires_at)| *expires_at > now)
            .map(|(value, _)| value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl_ms: u64) -> Result<(), GuardStoreError> {
        let mut entries = self.entries.lock().await;
        entries.insert(
            key.to_string(),
            (
                value.to_string(),
                Instant::now() + Duration::from_millis(ttl_ms),
            ),
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), GuardStoreError> {
        let mut entries = self.entries.lock().await;
        entries.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use pretty_assertions::assert_eq;

    use super::*;

    fn guard(timeout_ms: u64) -> Arc<Idempotence<InMemoryGuardStore>> {
        Arc::new(Idempotence::new(
            InMemoryGuardStore::new(),
            IdempotenceConfig {
                timeout: Duration::from_millis(timeout_ms),
                successful_ttl: Duration::from_secs(3600),
            },
        ))
    }

    fn counting_future(
        executions: Arc<AtomicUsize>,
        work: Duration,
    ) -> GuardedFuture<'static, String> {
        Box::pin(async move {
            executions.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(work).await;
            Ok(())
        })
    }

    #[test_log::test(tokio::test)]
    async fn test_concurrent_exec_runs_exactly_once() {
        let guard = guard(100);
        let executions = Arc::new(AtomicUsize::new(0));

        let first = {
            let guard = guard.clone();
            let executions = executions.clone();
            tokio::spawn(async move {
                guard
                    .exec(
                        "key-1",
                        counting_future(executions, Duration::from_millis(30)),
                    )
                    .await
            })
        };
        // Let the first caller take the guard before contending.
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = {
            let guard = guard.clone();
            let executions = executions.clone();
            tokio::spawn(async move {
                guard
                    .exec(
                        "key-1",
                        counting_future(executions, Duration::from_millis(30)),
                    )
                    .await
            })
        };

        let first_outcome = first.await.unwrap().unwrap();
        let second_outcome = second.await.unwrap().unwrap();

        assert_eq!(executions.load(Ordering::SeqCst), 1);
        assert_eq!(first_outcome, ExecOutcome::Executed);
        assert_eq!(second_outcome, ExecOutcome::AlreadyProcessed);
    }

    #[test_log::test(tokio::test)]
    async fn test_contender_conflicts_when_holder_overruns_timeout() {
        let guard = guard(50);
        let executions = Arc::new(AtomicUsize::new(0));

        let slow = {
            let guard = guard.clone();
            let executions = executions.clone();
            tokio::spawn(async move {
                guard
                    .exec(
                        "key-1",
                        counting_future(executions, Duration::from_millis(1500)),
                    )
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;

        let contender = guard
            .exec("key-1", Box::pin(async { Ok::<(), String>(()) }))
            .await;
        assert!(matches!(contender, Err(IdempotencyError::Conflict)));

        slow.await.unwrap().unwrap();
        assert_eq!(executions.load(Ordering::SeqCst), 1);
    }

    #[test_log::test(tokio::test)]
    async fn test_repeated_exec_short_circuits_after_success() {
        let guard = guard(100);
        let executions = Arc::new(AtomicUsize::new(0));

        let outcome = guard
            .exec(
                "key-1",
                counting_future(executions.clone(), Duration::ZERO),
            )
            .await
            .unwrap();
        assert_eq!(outcome, ExecOutcome::Executed);

        let outcome = guard
            .exec(
                "key-1",
                counting_future(executions.clone(), Duration::ZERO),
            )
            .await
            .unwrap();
        assert_eq!(outcome, ExecOutcome::AlreadyProcessed);
        assert_eq!(executions.load(Ordering::SeqCst), 1);
    }

    #[test_log::test(tokio::test)]
    async fn test_failure_clears_the_key_for_the_next_caller() {
        let guard = guard(100);

        let failed: Result<ExecOutcome, IdempotencyError<String>> = guard
            .exec(
                "key-1",
                Box::pin(async { Err("adapter exploded".to_string()) }),
            )
            .await;
        assert!(matches!(failed, Err(IdempotencyError::Execution(_))));

        let executions = Arc::new(AtomicUsize::new(0));
        let outcome = guard
            .exec(
                "key-1",
                counting_future(executions.clone(), Duration::ZERO),
            )
            .await
            .unwrap();
        assert_eq!(outcome, ExecOutcome::Executed);
        assert_eq!(executions.load(Ordering::SeqCst), 1);
    }
}
