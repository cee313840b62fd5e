//! Channel rate/retry guard — every outbound transport call goes through
//! here. Tracks per-workspace rate-limit windows, retries transient failures
//! with exponential backoff, and keeps coarse workspace health.
//!
//! Raw transport errors never escape this boundary unclassified.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;

use taskping_core::config::RetryConfig;
use taskping_core::error::{Result, TaskPingError};
use taskping_core::traits::{ChannelClient, Store};
use taskping_core::types::WorkspaceHealth;

/// Per-workspace guard state. Owned by the guard instance, never global.
#[derive(Debug, Default, Clone)]
struct WorkspaceState {
    /// Platform-imposed rate-limit window; calls short-circuit until then.
    limited_until: Option<DateTime<Utc>>,
    consecutive_failures: u32,
}

/// Wraps a `ChannelClient` with rate-limit tracking and retry policy.
pub struct ChannelGuard {
    client: Arc<dyn ChannelClient>,
    store: Arc<dyn Store>,
    retry: RetryConfig,
    workspaces: Mutex<HashMap<String, WorkspaceState>>,
}

impl ChannelGuard {
    pub fn new(client: Arc<dyn ChannelClient>, store: Arc<dyn Store>, retry: RetryConfig) -> Self {
        Self {
            client,
            store,
            retry,
            workspaces: Mutex::new(HashMap::new()),
        }
    }

    /// The wrapped transport, for building operations to pass to `execute`.
    pub fn client(&self) -> Arc<dyn ChannelClient> {
        self.client.clone()
    }

    /// Remaining rate-limit wait for a workspace, if its window is open.
    pub async fn active_limit_ms(&self, workspace_id: &str) -> Option<u64> {
        let map = self.workspaces.lock().await;
        let until = map.get(workspace_id)?.limited_until?;
        let remaining = until - Utc::now();
        if remaining > Duration::zero() {
            Some(remaining.num_milliseconds().max(1) as u64)
        } else {
            None
        }
    }

    /// Execute a transport operation under the guard's policy.
    ///
    /// - Short-circuits with `RateLimited` while the workspace window is open,
    ///   without touching the transport.
    /// - Rate-limit responses record the window and retry after waiting.
    /// - Transient errors retry with exponential backoff up to `max_retries`.
    /// - Auth revocation deactivates the workspace; never retried.
    /// - Not-found errors are terminal immediately.
    pub async fn execute<T, F, Fut>(&self, workspace_id: &str, op: F) -> Result<T>
    where
        T: Send,
        F: Fn() -> Fut + Send + Sync,
        Fut: Future<Output = Result<T>> + Send,
    {
        if let Some(wait_ms) = self.active_limit_ms(workspace_id).await {
            tracing::debug!(
                workspace = workspace_id,
                wait_ms,
                "rate-limit window open, short-circuiting"
            );
            return Err(TaskPingError::RateLimited {
                retry_after_ms: wait_ms,
            });
        }

        let mut attempt: u32 = 0;
        loop {
            match op().await {
                Ok(value) => {
                    self.record_success(workspace_id).await;
                    return Ok(value);
                }
                Err(TaskPingError::RateLimited { retry_after_ms }) => {
                    self.record_rate_limit(workspace_id, retry_after_ms).await;
                    if attempt >= self.retry.max_retries {
                        tracing::warn!(
                            workspace = workspace_id,
                            attempt,
                            "rate limited beyond retry budget"
                        );
                        self.record_terminal_failure(workspace_id).await;
                        return Err(TaskPingError::RateLimited { retry_after_ms });
                    }
                    attempt += 1;
                    tokio::time::sleep(std::time::Duration::from_millis(retry_after_ms)).await;
                }
                Err(TaskPingError::Transient(reason)) => {
                    if attempt >= self.retry.max_retries {
                        tracing::warn!(
                            workspace = workspace_id,
                            attempt,
                            reason,
                            "transient failure beyond retry budget"
                        );
                        self.record_terminal_failure(workspace_id).await;
                        return Err(TaskPingError::Transient(reason));
                    }
                    let delay = self.retry.backoff_ms(attempt);
                    attempt += 1;
                    tracing::debug!(
                        workspace = workspace_id,
                        attempt,
                        delay_ms = delay,
                        reason,
                        "transient failure, backing off"
                    );
                    tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
                }
                Err(TaskPingError::AuthRevoked(_)) => {
                    tracing::error!(workspace = workspace_id, "auth revoked, disabling workspace");
                    self.deactivate_workspace(workspace_id).await;
                    return Err(TaskPingError::AuthRevoked(workspace_id.to_string()));
                }
                Err(err) => {
                    // Channel/recipient not found and validation errors are
                    // fatal to the single record, never retried.
                    self.record_terminal_failure(workspace_id).await;
                    return Err(err);
                }
            }
        }
    }

    /// Current in-memory health view for a workspace.
    pub async fn consecutive_failures(&self, workspace_id: &str) -> u32 {
        let map = self.workspaces.lock().await;
        map.get(workspace_id)
            .map(|s| s.consecutive_failures)
            .unwrap_or(0)
    }

    async fn record_success(&self, workspace_id: &str) {
        let had_failures = {
            let mut map = self.workspaces.lock().await;
            let state = map.entry(workspace_id.to_string()).or_default();
            let had = state.consecutive_failures > 0 || state.limited_until.is_some();
            state.consecutive_failures = 0;
            state.limited_until = None;
            had
        };
        if had_failures {
            self.persist_health(workspace_id, WorkspaceHealth::Healthy, 0, false)
                .await;
        }
    }

    async fn record_rate_limit(&self, workspace_id: &str, retry_after_ms: u64) {
        {
            let mut map = self.workspaces.lock().await;
            let state = map.entry(workspace_id.to_string()).or_default();
            state.limited_until =
                Some(Utc::now() + Duration::milliseconds(retry_after_ms as i64));
        }
        tracing::info!(
            workspace = workspace_id,
            retry_after_ms,
            "workspace rate limited"
        );
        let failures = self.consecutive_failures(workspace_id).await;
        self.persist_health(workspace_id, WorkspaceHealth::RateLimited, failures, false)
            .await;
    }

    async fn record_terminal_failure(&self, workspace_id: &str) {
        let failures = {
            let mut map = self.workspaces.lock().await;
            let state = map.entry(workspace_id.to_string()).or_default();
            state.consecutive_failures = state.consecutive_failures.saturating_add(1);
            state.consecutive_failures
        };
        if failures >= self.retry.unhealthy_threshold {
            tracing::warn!(
                workspace = workspace_id,
                failures,
                "workspace flipped unhealthy"
            );
            self.persist_health(workspace_id, WorkspaceHealth::Unhealthy, failures, false)
                .await;
        }
    }

    async fn deactivate_workspace(&self, workspace_id: &str) {
        let failures = {
            let mut map = self.workspaces.lock().await;
            let state = map.entry(workspace_id.to_string()).or_default();
            state.consecutive_failures = state.consecutive_failures.saturating_add(1);
            state.consecutive_failures
        };
        self.persist_health(workspace_id, WorkspaceHealth::Unhealthy, failures, true)
            .await;
    }

    /// Health bookkeeping is best-effort: a store hiccup here must not fail
    /// the delivery path.
    async fn persist_health(
        &self,
        workspace_id: &str,
        health: WorkspaceHealth,
        failures: u32,
        disable_delivery: bool,
    ) {
        let loaded = match self.store.load_workspace(workspace_id).await {
            Ok(ws) => ws,
            Err(e) => {
                tracing::warn!(workspace = workspace_id, error = %e, "health load failed");
                return;
            }
        };
        let mut ws =
            loaded.unwrap_or_else(|| taskping_core::types::WorkspaceConfig::new(workspace_id));
        ws.health = health;
        ws.consecutive_failures = failures;
        if disable_delivery {
            ws.delivery_disabled = true;
        }
        ws.updated_at = Utc::now();
        if let Err(e) = self.store.save_workspace(&ws).await {
            tracing::warn!(workspace = workspace_id, error = %e, "health save failed");
        }
    }
}
