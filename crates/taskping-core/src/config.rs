//! Engine configuration — TOML-loadable, every field defaulted.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TaskPingError};
use crate::types::NotificationType;

/// Root engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub queues: QueueConfig,
    #[serde(default)]
    pub batching: BatchConfig,
    /// Notification types that bypass batching and quiet-hours deferral.
    #[serde(default = "default_always_immediate")]
    pub always_immediate: Vec<NotificationType>,
}

fn default_always_immediate() -> Vec<NotificationType> {
    vec![NotificationType::TaskAssigned, NotificationType::Mention]
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            queues: QueueConfig::default(),
            batching: BatchConfig::default(),
            always_immediate: default_always_immediate(),
        }
    }
}

impl EngineConfig {
    /// Load from a TOML file.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| TaskPingError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| TaskPingError::Config(format!("Failed to parse config: {e}")))?;
        Ok(config)
    }

    /// Whether this type always delivers immediately regardless of batching
    /// and quiet-hours preferences.
    pub fn is_always_immediate(&self, ty: NotificationType) -> bool {
        self.always_immediate.contains(&ty)
    }
}

/// Transport retry/backoff settings (the guard's policy).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Consecutive terminal failures before a workspace flips unhealthy.
    #[serde(default = "default_unhealthy_threshold")]
    pub unhealthy_threshold: u32,
}

fn default_max_retries() -> u32 {
    3
}
fn default_initial_delay_ms() -> u64 {
    1000
}
fn default_backoff_multiplier() -> u64 {
    2
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_unhealthy_threshold() -> u32 {
    3
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_delay_ms: default_max_delay_ms(),
            unhealthy_threshold: default_unhealthy_threshold(),
        }
    }
}

impl RetryConfig {
    /// Backoff before retry attempt `attempt` (0-based):
    /// min(initial · multiplier^attempt, cap).
    pub fn backoff_ms(&self, attempt: u32) -> u64 {
        let factor = self.backoff_multiplier.saturating_pow(attempt.min(16));
        self.initial_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms)
    }
}

/// Work-queue drain tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Jobs pulled and processed concurrently per drain batch.
    #[serde(default = "default_drain_concurrency")]
    pub drain_concurrency: usize,
    /// Coalescing delay for normal-priority notification drains.
    #[serde(default = "default_notification_debounce_ms")]
    pub notification_debounce_ms: u64,
    /// Coalescing delay for surface-refresh drains.
    #[serde(default = "default_surface_debounce_ms")]
    pub surface_debounce_ms: u64,
    /// Longer delay before batch flushes so more items accumulate.
    #[serde(default = "default_batch_debounce_ms")]
    pub batch_debounce_ms: u64,
}

fn default_drain_concurrency() -> usize {
    8
}
fn default_notification_debounce_ms() -> u64 {
    250
}
fn default_surface_debounce_ms() -> u64 {
    250
}
fn default_batch_debounce_ms() -> u64 {
    1000
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            drain_concurrency: default_drain_concurrency(),
            notification_debounce_ms: default_notification_debounce_ms(),
            surface_debounce_ms: default_surface_debounce_ms(),
            batch_debounce_ms: default_batch_debounce_ms(),
        }
    }
}

/// Batch accumulation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Fallback flush interval when neither the recipient nor the workspace
    /// sets one.
    #[serde(default = "default_batch_interval_minutes")]
    pub default_interval_minutes: u64,
    /// Max records pulled per retry sweep.
    #[serde(default = "default_retry_sweep_limit")]
    pub retry_sweep_limit: usize,
}

fn default_batch_interval_minutes() -> u64 {
    5
}
fn default_retry_sweep_limit() -> usize {
    100
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            default_interval_minutes: default_batch_interval_minutes(),
            retry_sweep_limit: default_retry_sweep_limit(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.retry.max_retries, 3);
        assert_eq!(cfg.retry.initial_delay_ms, 1000);
        assert_eq!(cfg.retry.max_delay_ms, 30_000);
        assert_eq!(cfg.batching.default_interval_minutes, 5);
        assert!(cfg.is_always_immediate(NotificationType::TaskAssigned));
        assert!(cfg.is_always_immediate(NotificationType::Mention));
        assert!(!cfg.is_always_immediate(NotificationType::CommentAdded));
    }

    #[test]
    fn test_guard_backoff_schedule() {
        let cfg = RetryConfig::default();
        assert_eq!(cfg.backoff_ms(0), 1000);
        assert_eq!(cfg.backoff_ms(1), 2000);
        assert_eq!(cfg.backoff_ms(2), 4000);
        assert_eq!(cfg.backoff_ms(5), 30_000); // capped
    }

    #[test]
    fn test_parse_partial_toml() {
        let cfg: EngineConfig = toml::from_str(
            r#"
            [retry]
            max_retries = 5

            [queues]
            drain_concurrency = 4
            "#,
        )
        .unwrap();
        assert_eq!(cfg.retry.max_retries, 5);
        assert_eq!(cfg.retry.initial_delay_ms, 1000); // defaulted
        assert_eq!(cfg.queues.drain_concurrency, 4);
        assert_eq!(cfg.queues.batch_debounce_ms, 1000);
    }
}
