//! Collaborator seams — persistence, transport, and rendering are consumed
//! behind trait objects so the engine can be constructed with fakes in tests
//! and real adapters in production.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::error::Result;
use crate::types::{
    AnalyticsEvent, DigestPeriod, DigestWork, NotificationRecord, RecipientProfile,
    WorkspaceConfig,
};

/// Opaque rendered message body. The engine hands it to the transport
/// unchanged.
pub type Payload = serde_json::Value;

/// Receipt for a successful transport send.
#[derive(Debug, Clone)]
pub struct SendReceipt {
    /// Platform message id (e.g. a message timestamp).
    pub external_id: String,
    pub latency_ms: u64,
}

/// Persistence of domain records. The engine never talks to a database
/// directly.
#[async_trait]
pub trait Store: Send + Sync {
    async fn load_notification(&self, id: &str) -> Result<Option<NotificationRecord>>;
    async fn save_notification(&self, record: &NotificationRecord) -> Result<()>;

    async fn load_recipient(&self, id: &str) -> Result<Option<RecipientProfile>>;
    async fn save_recipient(&self, profile: &RecipientProfile) -> Result<()>;

    async fn load_workspace(&self, id: &str) -> Result<Option<WorkspaceConfig>>;
    async fn save_workspace(&self, config: &WorkspaceConfig) -> Result<()>;

    /// Records eligible for a retry attempt: status pending or rate_limited,
    /// 0 < retry_count < max_retries, next_retry_at <= now; ordered by
    /// next_retry_at ascending.
    async fn find_pending_retries(&self, limit: usize) -> Result<Vec<NotificationRecord>>;

    /// Recipients whose non-empty batch buffer has gone unflushed for at
    /// least `max_age`.
    async fn find_recipients_with_pending_batches(
        &self,
        max_age: Duration,
    ) -> Result<Vec<RecipientProfile>>;

    /// Recipients whose digest preference matches this period on this tick.
    async fn find_recipients_for_digest(
        &self,
        period: DigestPeriod,
        tick: DateTime<Utc>,
    ) -> Result<Vec<RecipientProfile>>;

    /// Outstanding/overdue/due-soon/completed work for one recipient's digest.
    async fn load_digest_work(
        &self,
        recipient_id: &str,
        period: DigestPeriod,
        now: DateTime<Utc>,
    ) -> Result<DigestWork>;

    /// Best-effort telemetry. Callers swallow errors from this.
    async fn record_analytics(&self, event: &AnalyticsEvent) -> Result<()>;
}

/// Outbound chat-platform transport. Implementations classify their errors
/// into the `TaskPingError` taxonomy before returning.
#[async_trait]
pub trait ChannelClient: Send + Sync {
    /// Post a message to a channel (optionally inside a thread).
    async fn send(
        &self,
        channel_id: &str,
        thread_id: Option<&str>,
        payload: &Payload,
    ) -> Result<SendReceipt>;

    /// Edit an already-posted message in place.
    async fn update_message(
        &self,
        channel_id: &str,
        external_id: &str,
        payload: &Payload,
    ) -> Result<()>;

    /// Open (or fetch) the direct-message channel for a recipient.
    async fn open_direct_channel(&self, recipient_id: &str) -> Result<String>;

    /// Republish a recipient's persistent home surface.
    async fn publish_surface(&self, recipient_id: &str, surface: &Payload) -> Result<()>;
}

/// Builds the visual payload for a notification. Opaque to the engine.
pub trait PayloadRenderer: Send + Sync {
    fn render(&self, ty: crate::types::NotificationType, context: &serde_json::Value) -> Payload;

    /// Payload for the persistent per-recipient home surface.
    fn render_surface(&self, context: &serde_json::Value) -> Payload;
}
