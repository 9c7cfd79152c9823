use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use fundsync_core::util::user_fingerprint;
use tokio::sync::Mutex;

use crate::config::AppConfig;
use crate::error::AppError;

/// Fixed-window request limiter keyed by endpoint class and user
#[derive(Clone)]
pub struct EndpointRateLimiter {
    state: Arc<Mutex<RateState>>,
    window: Duration,
    push_limit: u32,
    pull_limit: u32,
    metrics: Arc<RateLimitMetrics>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtectedEndpoint {
    /// Writes: pushing batches, resolving conflicts, clearing
    SyncPush,
    /// Full-sync pulls
    SyncPull,
}

#[derive(Default)]
struct RateLimitMetrics {
    push_allowed: AtomicU64,
    push_limited: AtomicU64,
    pull_allowed: AtomicU64,
    pull_limited: AtomicU64,
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct RateLimitMetricsSnapshot {
    pub push_allowed: u64,
    pub push_limited: u64,
    pub pull_allowed: u64,
    pub pull_limited: u64,
}

#[derive(Debug, Clone, Copy)]
struct RateWindow {
    started_at: Instant,
    count: u32,
}

/// Open windows, swept of expired ones at most once per window length
#[derive(Debug)]
struct RateState {
    windows: HashMap<(ProtectedEndpoint, String), RateWindow>,
    last_pruned: Instant,
}

impl RateState {
    fn prune(&mut self, now: Instant, window: Duration) {
        if now.duration_since(self.last_pruned) < window {
            return;
        }
        self.windows
            .retain(|_, entry| now.duration_since(entry.started_at) < window);
        self.last_pruned = now;
    }
}

impl EndpointRateLimiter {
    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(
            config.rate_limit_window,
            config.sync_push_rate_limit_per_window,
            config.sync_pull_rate_limit_per_window,
        )
    }

    fn new(window: Duration, push_limit: u32, pull_limit: u32) -> Self {
        Self {
            state: Arc::new(Mutex::new(RateState {
                windows: HashMap::new(),
                last_pruned: Instant::now(),
            })),
            window,
            push_limit,
            pull_limit,
            metrics: Arc::new(RateLimitMetrics::default()),
        }
    }

    pub async fn check(&self, endpoint: ProtectedEndpoint, user_id: &str) -> Result<(), AppError> {
        let limit = match endpoint {
            ProtectedEndpoint::SyncPush => self.push_limit,
            ProtectedEndpoint::SyncPull => self.pull_limit,
        };

        let now = Instant::now();
        let mut guard = self.state.lock().await;
        guard.prune(now, self.window);
        let entry = guard
            .windows
            .entry((endpoint, user_id.to_string()))
            .or_insert(RateWindow {
            started_at: now,
            count: 0,
        });

        if now.duration_since(entry.started_at) >= self.window {
            entry.started_at = now;
            entry.count = 0;
        }

        if entry.count >= limit {
            let retry_after_secs = self
                .window
                .saturating_sub(now.duration_since(entry.started_at))
                .as_secs();
            self.counter(endpoint, false).fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                endpoint = endpoint.label(),
                user = user_fingerprint(user_id),
                retry_after_secs,
                "Rate limit exceeded"
            );
            return Err(AppError::too_many_requests(
                "Rate limit exceeded for sync endpoint",
                retry_after_secs,
            ));
        }

        entry.count += 1;
        self.counter(endpoint, true).fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn metrics_snapshot(&self) -> RateLimitMetricsSnapshot {
        RateLimitMetricsSnapshot {
            push_allowed: self.metrics.push_allowed.load(Ordering::Relaxed),
            push_limited: self.metrics.push_limited.load(Ordering::Relaxed),
            pull_allowed: self.metrics.pull_allowed.load(Ordering::Relaxed),
            pull_limited: self.metrics.pull_limited.load(Ordering::Relaxed),
        }
    }

    fn counter(&self, endpoint: ProtectedEndpoint, allowed: bool) -> &AtomicU64 {
        match (endpoint, allowed) {
            (ProtectedEndpoint::SyncPush, true) => &self.metrics.push_allowed,
            (ProtectedEndpoint::SyncPush, false) => &self.metrics.push_limited,
            (ProtectedEndpoint::SyncPull, true) => &self.metrics.pull_allowed,
            (ProtectedEndpoint::SyncPull, false) => &self.metrics.pull_limited,
        }
    }
}

impl ProtectedEndpoint {
    pub const fn label(self) -> &'static str {
        match self {
            Self::SyncPush => "sync_push",
            Self::SyncPull => "sync_pull",
        }
    }
}
