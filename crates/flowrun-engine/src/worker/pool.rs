//! Bounded pool for background workflow executions
//!
//! `execute_async` submissions land here: each execution runs as a tokio
//! task gated by a semaphore, so one replica drives many instances
//! concurrently without unbounded fan-out. Mutual exclusion per instance
//! is the lease's job, not the pool's — the pool only bounds local
//! concurrency and offers a graceful drain on shutdown.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Pool configuration
#[derive(Debug, Clone)]
pub struct ExecutionPoolConfig {
    /// Maximum concurrently running executions
    pub max_concurrency: usize,

    /// How long a graceful shutdown waits for in-flight executions
    pub shutdown_timeout: Duration,
}

impl Default for ExecutionPoolConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 8,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl ExecutionPoolConfig {
    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Semaphore-bounded background execution pool
pub struct ExecutionPool {
    semaphore: Arc<Semaphore>,
    handles: Mutex<Vec<(Uuid, JoinHandle<()>)>>,
    config: ExecutionPoolConfig,
}

impl ExecutionPool {
    pub fn new(config: ExecutionPoolConfig) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(config.max_concurrency)),
            handles: Mutex::new(Vec::new()),
            config,
        }
    }

    /// Submit an execution. Returns immediately; the future runs once a
    /// concurrency permit is free.
    pub fn spawn(&self, execution_id: Uuid, fut: impl std::future::Future<Output = ()> + Send + 'static) {
        let semaphore = self.semaphore.clone();
        let handle = tokio::spawn(async move {
            let _permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    // Pool is shutting down; the execution stays PENDING
                    // for another replica (or restart) to pick up.
                    warn!(%execution_id, "pool closed before execution started");
                    return;
                }
            };
            debug!(%execution_id, "background execution starting");
            fut.await;
            debug!(%execution_id, "background execution finished");
        });

        let mut handles = self.handles.lock();
        handles.retain(|(_, h)| !h.is_finished());
        handles.push((execution_id, handle));
    }

    /// Executions submitted and not yet finished
    pub fn in_flight(&self) -> usize {
        let mut handles = self.handles.lock();
        handles.retain(|(_, h)| !h.is_finished());
        handles.len()
    }

    /// Stop accepting work and wait for in-flight executions, up to the
    /// configured timeout. Returns the ids that were still running when
    /// the timeout hit.
    pub async fn shutdown_graceful(&self) -> Vec<Uuid> {
        self.semaphore.close();
        let handles: Vec<(Uuid, JoinHandle<()>)> = std::mem::take(&mut *self.handles.lock());
        info!(count = handles.len(), "draining execution pool");

        let mut stragglers = Vec::new();
        for (execution_id, handle) in handles {
            match tokio::time::timeout(self.config.shutdown_timeout, handle).await {
                Ok(_) => {}
                Err(_) => {
                    warn!(%execution_id, "execution still running at shutdown deadline");
                    stragglers.push(execution_id);
                }
            }
        }
        stragglers
    }
}

impl Default for ExecutionPool {
    fn default() -> Self {
        Self::new(ExecutionPoolConfig::default())
    }
}
