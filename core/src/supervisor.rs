use std::{
    collections::HashMap,
    error::Error,
    fmt,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use futures::{stream::FuturesUnordered, StreamExt};
use outpost_helpers::time::{Clock, DefaultClock};
use serde::Serialize;
use tokio::{sync::broadcast, task::JoinError};
use tracing::{error, info};

/// Provides a custom error type to be used for failures
/// within long-lived workers.
#[derive(Debug)]
pub enum WorkerError {
    /// The worker stopped because it was asked to, this is a healthy
    /// exit.
    Cancelled,
    Failed(String),
}

impl WorkerError {
    pub fn failed(reason: impl Into<String>) -> Self {
        WorkerError::Failed(reason.into())
    }
}

impl fmt::Display for WorkerError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            WorkerError::Cancelled => write!(f, "worker cancelled"),
            WorkerError::Failed(reason) => write!(f, "worker failed: {reason}"),
        }
    }
}

impl Error for WorkerError {}

/// The contract for long-lived background processes: consumers, the
/// retry monitor, the health server.
///
/// `run` should return promptly once the shutdown signal fires. A
/// return of `Ok` or `Cancelled` marks the worker healthy, any other
/// error marks it failed without terminating its siblings.
#[async_trait]
pub trait Worker: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self, shutdown: broadcast::Sender<()>) -> Result<(), WorkerError>;
}

/// The externally visible status of one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Running,
    Healthy,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerHealth {
    pub status: WorkerStatus,
    /// The UNIX timestamp of the last status transition.
    pub last_check: u64,
}

/// A point-in-time view of worker health. Error details are
/// deliberately not exposed, an orchestrator consumes the overall
/// status and restarts the whole process when it reports failed.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub overall: WorkerStatus,
    pub workers: HashMap<String, WorkerHealth>,
}

impl HealthSnapshot {
    pub fn is_failed(&self) -> bool {
        self.overall == WorkerStatus::Failed
    }
}

/// Tracks per-worker status behind a process-local mutex.
#[derive(Clone)]
pub struct HealthTracker {
    workers: Arc<Mutex<HashMap<String, WorkerHealth>>>,
    clock: Arc<dyn Clock + Send + Sync>,
}

impl HealthTracker {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(DefaultClock::new()))
    }

    pub fn with_clock(clock: Arc<dyn Clock + Send + Sync>) -> Self {
        Self {
            workers: Arc::new(Mutex::new(HashMap::new())),
            clock,
        }
    }

    pub fn register(&self, name: &str) {
        self.mark(name, WorkerStatus::Running);
    }

    pub fn mark(&self, name: &str, status: WorkerStatus) {
        let mut workers = self
            .workers
            .lock()
            .expect("health tracker mutex poisoned");
        workers.insert(
            name.to_string(),
            WorkerHealth {
                status,
                last_check: self.clock.now(),
            },
        );
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        let workers = self
            .workers
            .lock()
            .expect("health tracker mutex poisoned");
        let overall = if workers
            .values()
            .any(|health| health.status == WorkerStatus::Failed)
        {
            WorkerStatus::Failed
        } else {
            WorkerStatus::Healthy
        };
        HealthSnapshot {
            overall,
            workers: workers.clone(),
        }
    }
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Provides a custom error type to be used for failures
/// in supervising workers.
#[derive(Debug)]
pub enum SupervisorError {
    /// Workers did not drain within the configured shutdown timeout.
    ShutdownTimeout,
}

impl fmt::Display for SupervisorError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SupervisorError::ShutdownTimeout => {
                write!(f, "supervisor error: workers did not stop within the shutdown timeout")
            }
        }
    }
}

impl Error for SupervisorError {}

/// Runs registered workers in their own tasks, tracks their health,
/// and coordinates graceful shutdown.
///
/// A failed worker is recorded and left to the orchestrator to act on,
/// its siblings keep running. The supervisor exits when the shutdown
/// signal fires (bounded by the optional shutdown timeout) or when
/// every worker has exited on its own.
pub struct Supervisor {
    workers: Vec<Arc<dyn Worker>>,
    health: HealthTracker,
    shutdown_timeout: Option<Duration>,
}

impl Supervisor {
    pub fn new(health: HealthTracker, shutdown_timeout: Option<Duration>) -> Self {
        Self {
            workers: Vec::new(),
            health,
            shutdown_timeout,
        }
    }

    pub fn register(&mut self, worker: Arc<dyn Worker>) {
        self.workers.push(worker);
    }

    pub async fn run(&self, shutdown: broadcast::Sender<()>) -> Result<(), SupervisorError> {
        let mut completions: FuturesUnordered<_> = self
            .workers
            .iter()
            .map(|worker| {
                let name = worker.name().to_string();
                self.health.register(&name);
                let worker = worker.clone();
                let shutdown = shutdown.clone();
                async move {
                    let result =
                        tokio::spawn(async move { worker.run(shutdown).await }).await;
                    (name, result)
                }
            })
            .collect();

        let mut shutdown_rx = shutdown.subscribe();
        let mut shutting_down = false;
        while !shutting_down {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("received shutdown signal, draining workers");
                    shutting_down = true;
                }
                completed = completions.next() => match completed {
                    Some((name, result)) => self.record(&name, result),
                    None => {
                        info!("all workers have exited");
                        return Ok(());
                    }
                }
            }
        }

        let drain = async {
            while let Some((name, result)) = completions.next().await {
                self.record(&name, result);
            }
        };
        match self.shutdown_timeout {
            Some(timeout) => tokio::time::timeout(timeout, drain)
                .await
                .map_err(|_| SupervisorError::ShutdownTimeout),
            None => {
                drain.await;
                Ok(())
            }
        }
    }

    fn record(&self, name: &str, result: Result<Result<(), WorkerError>, JoinError>) {
        match result {
            Ok(Ok(())) | Ok(Err(WorkerError::Cancelled)) => {
                info!("worker {name} finished");
                self.health.mark(name, WorkerStatus::Healthy);
            }
            Ok(Err(WorkerError::Failed(reason))) => {
                error!("worker {name} failed: {reason}");
                self.health.mark(name, WorkerStatus::Failed);
            }
            Err(join_error) => {
                error!("worker {name} panicked: {join_error}");
                self.health.mark(name, WorkerStatus::Failed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    struct OneShotWorker {
        name: String,
        result: Mutex<Option<Result<(), WorkerError>>>,
    }

    impl OneShotWorker {
        fn new(name: &str, result: Result<(), WorkerError>) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                result: Mutex::new(Some(result)),
            })
        }
    }

    #[async_trait]
    impl Worker for OneShotWorker {
        fn name(&self) -> &str {
            &self.name
        }

        async fn run(&self, _shutdown: broadcast::Sender<()>) -> Result<(), WorkerError> {
            self.result
                .lock()
                .expect("result mutex poisoned")
                .take()
                .unwrap_or(Ok(()))
        }
    }

    struct LoopingWorker {
        name: String,
    }

    #[async_trait]
    impl Worker for LoopingWorker {
        fn name(&self) -> &str {
            &self.name
        }

        async fn run(&self, shutdown: broadcast::Sender<()>) -> Result<(), WorkerError> {
            let mut shutdown_rx = shutdown.subscribe();
            let _ = shutdown_rx.recv().await;
            Ok(())
        }
    }

    struct StuckWorker {
        name: String,
    }

    #[async_trait]
    impl Worker for StuckWorker {
        fn name(&self) -> &str {
            &self.name
        }

        async fn run(&self, _shutdown: broadcast::Sender<()>) -> Result<(), WorkerError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }
    }

    #[test_log::test(tokio::test)]
    async fn test_exits_when_all_workers_complete() {
        let health = HealthTracker::new();
        let mut supervisor = Supervisor::new(health.clone(), None);
        supervisor.register(OneShotWorker::new("worker-a", Ok(())));
        supervisor.register(OneShotWorker::new(
            "worker-b",
            Err(WorkerError::Cancelled),
        ));

        let (shutdown, _) = broadcast::channel(1);
        supervisor.run(shutdown).await.unwrap();

        let snapshot = health.snapshot();
        assert_eq!(snapshot.overall, WorkerStatus::Healthy);
        assert_eq!(snapshot.workers["worker-a"].status, WorkerStatus::Healthy);
        assert_eq!(snapshot.workers["worker-b"].status, WorkerStatus::Healthy);
    }

    #[test_log::test(tokio::test)]
    async fn test_failed_worker_does_not_terminate_siblings() {
        let health = HealthTracker::new();
        let mut supervisor = Supervisor::new(health.clone(), None);
        supervisor.register(OneShotWorker::new(
            "worker-bad",
            Err(WorkerError::failed("redis unreachable")),
        ));
        supervisor.register(Arc::new(LoopingWorker {
            name: "worker-loop".to_string(),
        }));

        let (shutdown, _) = broadcast::channel(1);
        let run_handle = {
            let shutdown = shutdown.clone();
            let supervisor = Arc::new(supervisor);
            let supervisor_for_run = supervisor.clone();
            tokio::spawn(async move { supervisor_for_run.run(shutdown).await })
        };

        // The failing worker is recorded while the looping worker stays
        // up and the supervisor keeps running.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let snapshot = health.snapshot();
        assert_eq!(snapshot.overall, WorkerStatus::Failed);
        assert_eq!(snapshot.workers["worker-bad"].status, WorkerStatus::Failed);
        assert_eq!(
            snapshot.workers["worker-loop"].status,
            WorkerStatus::Running
        );
        assert!(!run_handle.is_finished());

        shutdown.send(()).unwrap();
        run_handle.await.unwrap().unwrap();
        let snapshot = health.snapshot();
        assert_eq!(
            snapshot.workers["worker-loop"].status,
            WorkerStatus::Healthy
        );
        // The failure sticks after shutdown.
        assert_eq!(snapshot.overall, WorkerStatus::Failed);
    }

    #[test_log::test(tokio::test)]
    async fn test_shutdown_timeout_bounds_stuck_workers() {
        let health = HealthTracker::new();
        let mut supervisor =
            Supervisor::new(health.clone(), Some(Duration::from_millis(50)));
        supervisor.register(Arc::new(StuckWorker {
            name: "worker-stuck".to_string(),
        }));

        let (shutdown, _) = broadcast::channel(1);
        let run_handle = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                let supervisor = supervisor;
                supervisor.run(shutdown).await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.send(()).unwrap();
        let result = run_handle.await.unwrap();
        assert!(matches!(result, Err(SupervisorError::ShutdownTimeout)));
    }
}
