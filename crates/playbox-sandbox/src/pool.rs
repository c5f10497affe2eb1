//! Pre-warmed container pool.
//!
//! A fixed number of worker loops each start a container, wait for its
//! start marker, and block handing it to the ready queue. The blocking
//! send is the backpressure: the next container is not started until a
//! request consumes one. Request latency is therefore dominated by the
//! user program, not container startup.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::process::Command;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::container::{Container, WantedSet};
use crate::{docker, START_TIMEOUT};

/// Period between polls of the container runtime's actual state.
const RECONCILE_PERIOD: Duration = Duration::from_secs(10);

/// Pause after a failed container start before trying again.
const START_RETRY_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("timed out waiting for a ready container")]
    AcquireTimeout,
    #[error("container pool is shut down")]
    Closed,
    #[error("container {0} did not become ready in time")]
    StartTimeout(String),
    #[error("container {0} exited before becoming ready")]
    ExitedEarly(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of worker loops, and the concurrent-request cap.
    pub workers: usize,
    /// Image each worker runs.
    pub image: String,
    /// Budget for a container to emit its start marker.
    pub start_timeout: Duration,
    /// Pause between start attempts after a failure.
    pub retry_delay: Duration,
    /// Builds the command that launches one worker container.
    pub launch: fn(name: &str, image: &str) -> Command,
}

impl PoolConfig {
    pub fn new(workers: usize, image: String) -> Self {
        Self {
            workers,
            image,
            start_timeout: START_TIMEOUT,
            retry_delay: START_RETRY_DELAY,
            launch: docker::run_command,
        }
    }
}

/// Point-in-time pool counters, fed by the reconciliation poll.
#[derive(Debug, Clone, Copy)]
pub struct PoolStats {
    pub workers: usize,
    /// Running containers matching the pool's naming convention.
    pub total_containers: usize,
    /// Running containers not present in the wanted set: leaks.
    pub unwanted_containers: usize,
}

pub struct ContainerPool {
    ready: Mutex<mpsc::Receiver<Container>>,
    admission: Arc<Semaphore>,
    wanted: WantedSet,
    config: PoolConfig,
    shutdown: CancellationToken,
    total_seen: AtomicUsize,
    unwanted_seen: AtomicUsize,
}

impl ContainerPool {
    /// Starts the worker loops and the reconciliation poll.
    pub fn start(config: PoolConfig) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(1);
        let pool = Arc::new(Self {
            ready: Mutex::new(rx),
            admission: Arc::new(Semaphore::new(config.workers)),
            wanted: WantedSet::new(),
            config,
            shutdown: CancellationToken::new(),
            total_seen: AtomicUsize::new(0),
            unwanted_seen: AtomicUsize::new(0),
        });
        for worker in 0..pool.config.workers {
            tokio::spawn(worker_loop(pool.clone(), tx.clone(), worker));
        }
        tokio::spawn(reconcile_loop(pool.clone()));
        pool
    }

    /// Blocks until a ready container is available or `deadline` elapses.
    /// The caller owns the returned container to completion.
    pub async fn acquire(&self, deadline: Duration) -> Result<Container, PoolError> {
        let recv = async {
            let mut ready = self.ready.lock().await;
            ready.recv().await
        };
        match tokio::time::timeout(deadline, recv).await {
            Ok(Some(container)) => {
                debug!(container = container.name(), "container acquired");
                Ok(container)
            }
            Ok(None) => Err(PoolError::Closed),
            Err(_) => Err(PoolError::AcquireTimeout),
        }
    }

    /// Semaphore bounding in-flight requests to the worker count. Acquired
    /// by the dispatcher before it reads a request body.
    pub fn admission(&self) -> Arc<Semaphore> {
        self.admission.clone()
    }

    pub fn wanted(&self) -> &WantedSet {
        &self.wanted
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            workers: self.config.workers,
            total_containers: self.total_seen.load(Ordering::Relaxed),
            unwanted_containers: self.unwanted_seen.load(Ordering::Relaxed),
        }
    }

    /// Stops the worker loops and the reconciliation poll. Containers are
    /// removed on exit by the runtime, so no teardown pass is needed.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    async fn start_container(&self) -> Result<Container, PoolError> {
        let name = docker::random_name();
        let cmd = (self.config.launch)(&name, &self.config.image);
        let (container, ready) = Container::spawn(name.clone(), cmd, self.wanted.clone())?;
        match tokio::time::timeout(self.config.start_timeout, ready).await {
            Ok(Ok(())) => {
                debug!(container = %name, "container ready");
                Ok(container)
            }
            // Dropping the container stops the child and clears the name.
            Ok(Err(_)) => Err(PoolError::ExitedEarly(name)),
            Err(_) => Err(PoolError::StartTimeout(name)),
        }
    }
}

async fn worker_loop(pool: Arc<ContainerPool>, tx: mpsc::Sender<Container>, worker: usize) {
    loop {
        let started = tokio::select! {
            _ = pool.shutdown.cancelled() => return,
            res = pool.start_container() => res,
        };
        match started {
            Ok(container) => {
                tokio::select! {
                    _ = pool.shutdown.cancelled() => return,
                    sent = tx.send(container) => {
                        if sent.is_err() {
                            return;
                        }
                    }
                }
            }
            Err(e) => {
                warn!(worker, error = %e, "failed to start container");
                tokio::select! {
                    _ = pool.shutdown.cancelled() => return,
                    _ = tokio::time::sleep(pool.config.retry_delay) => {}
                }
            }
        }
    }
}

/// Every [`RECONCILE_PERIOD`], compares the runtime's running containers
/// with the wanted set and records how many are tracked vs leaked.
async fn reconcile_loop(pool: Arc<ContainerPool>) {
    let mut tick = tokio::time::interval(RECONCILE_PERIOD);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = pool.shutdown.cancelled() => return,
            _ = tick.tick() => {}
        }
        match docker::list_containers().await {
            Ok(containers) => {
                let total = containers.len();
                let unwanted = containers
                    .iter()
                    .filter(|c| !pool.wanted.contains(&c.names))
                    .count();
                pool.total_seen.store(total, Ordering::Relaxed);
                pool.unwanted_seen.store(unwanted, Ordering::Relaxed);
                if unwanted > 0 {
                    warn!(total, unwanted, "leaked containers are running");
                } else {
                    debug!(total, "container poll");
                }
            }
            Err(e) => warn!(error = %e, "container poll failed"),
        }
    }
}
