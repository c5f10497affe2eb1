//! Readiness endpoints.

use std::future::Future;
use std::time::Duration;

use axum::extract::State;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::api::error::ApiError;
use crate::state::AppState;

/// How long a probe result stays valid before the next request recomputes
/// it. Upstream load balancers poll more often than we want to burn
/// containers.
const CACHE_TTL: Duration = Duration::from_secs(5);

/// Budget for the end-to-end probe itself.
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// A health result that is recomputed at most once per [`CACHE_TTL`].
#[derive(Default)]
pub struct CachedHealth {
    last: Mutex<Option<(Instant, Result<(), String>)>>,
}

impl CachedHealth {
    /// Returns the cached result if it is fresh, otherwise runs `probe`
    /// and caches its outcome. Concurrent callers serialize on the probe
    /// so a slow check never runs more than once at a time.
    pub async fn get<F, Fut>(&self, probe: F) -> Result<(), String>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), String>>,
    {
        let mut last = self.last.lock().await;
        if let Some((at, result)) = &*last {
            if at.elapsed() < CACHE_TTL {
                return result.clone();
            }
        }
        let result = probe().await;
        if let Err(e) = &result {
            if !matches!(&*last, Some((_, Err(_)))) {
                warn!(error = %e, "health transitioned to unhealthy");
            }
        }
        *last = Some((Instant::now(), result.clone()));
        result
    }
}

/// GET /healthz (and /health): acquires and closes a container, end to
/// end, so readiness means a request really can be served.
pub async fn healthz(State(state): State<AppState>) -> Result<&'static str, ApiError> {
    let pool = state.pool.clone();
    let result = state
        .health
        .get(|| async move {
            pool.acquire(PROBE_TIMEOUT)
                .await
                .map(drop)
                .map_err(|e| e.to_string())
        })
        .await;
    let stats = state.pool.stats();
    debug!(
        workers = stats.workers,
        total = stats.total_containers,
        unwanted = stats.unwanted_containers,
        healthy = result.is_ok(),
        "pool state"
    );
    result.map_err(ApiError::Unhealthy)?;
    Ok("OK\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn probe_result_is_cached() {
        let health = CachedHealth::default();
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let calls = calls.clone();
            let res = health
                .get(move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .await;
            assert!(res.is_ok());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(CACHE_TTL + Duration::from_millis(1)).await;
        let c = calls.clone();
        health
            .get(move || async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn unhealthy_result_is_cached_too() {
        let health = CachedHealth::default();
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let calls = calls.clone();
            let res = health
                .get(move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err("no container".to_string())
                })
                .await;
            assert_eq!(res, Err("no container".to_string()));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
