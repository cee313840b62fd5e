//! Core data model — notification records, recipient profiles, workspaces.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Datelike, Duration, NaiveTime, Timelike, Utc, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

/// Retention window after successful delivery.
pub const DELIVERED_RETENTION_DAYS: i64 = 30;
/// Retention window after terminal failure or suppression.
pub const FAILED_RETENTION_DAYS: i64 = 7;
/// Pending-batch buffer cap per recipient (oldest evicted beyond this).
pub const BATCH_BUFFER_CAP: usize = 50;
/// Task→thread map cap per recipient (least-recently-used evicted).
pub const TASK_THREAD_CAP: usize = 1000;

/// Domain event kinds the engine can deliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationType {
    TaskAssigned,
    TaskUnassigned,
    TaskUpdated,
    TaskCompleted,
    TaskReopened,
    TaskDeleted,
    TaskMoved,
    TaskArchived,
    TaskDueSoon,
    TaskOverdue,
    TaskPriorityChanged,
    TaskStatusChanged,
    DeadlineChanged,
    RecurringTaskCreated,
    ChecklistItemCompleted,
    ChecklistCompleted,
    AttachmentAdded,
    TimeLogged,
    CommentAdded,
    CommentReply,
    CommentReaction,
    CommentResolved,
    Mention,
    WatcherAdded,
    BoardCreated,
    BoardArchived,
    BoardMemberAdded,
    BoardMemberRemoved,
    ColumnCreated,
    ColumnUpdated,
    SprintStarted,
    SprintCompleted,
    ApprovalRequested,
    ApprovalGranted,
    ApprovalRejected,
    WorkspaceAnnouncement,
    BatchSummary,
    Digest,
}

/// Notification priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

impl Priority {
    /// Queue weight — lower drains first (critical=1 … low=4).
    pub fn queue_weight(&self) -> u8 {
        match self {
            Priority::Critical => 1,
            Priority::High => 2,
            Priority::Medium => 3,
            Priority::Low => 4,
        }
    }

    /// Ordering rank for preference filtering (low=1 … critical=4).
    pub fn rank(&self) -> u8 {
        match self {
            Priority::Low => 1,
            Priority::Medium => 2,
            Priority::High => 3,
            Priority::Critical => 4,
        }
    }
}

/// Minimum-priority threshold on a recipient profile.
/// `All` never filters anything out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PriorityFloor {
    #[default]
    All,
    Low,
    Medium,
    High,
    Critical,
}

impl PriorityFloor {
    fn rank(&self) -> u8 {
        match self {
            PriorityFloor::All => 0,
            PriorityFloor::Low => 1,
            PriorityFloor::Medium => 2,
            PriorityFloor::High => 3,
            PriorityFloor::Critical => 4,
        }
    }

    /// Whether a notification at `priority` clears this floor.
    pub fn allows(&self, priority: Priority) -> bool {
        priority.rank() >= self.rank()
    }
}

/// Delivery lifecycle status of a notification record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Queued,
    Sent,
    Delivered,
    Failed,
    Batched,
    Suppressed,
    RateLimited,
}

/// Why a notification was suppressed instead of delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuppressReason {
    QuietHours,
    UserPreference,
    RateLimit,
    Duplicate,
    LowPriority,
    WorkspaceDisabled,
}

/// One interaction with a delivered message (button click, reaction, …).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InteractionEntry {
    pub action_id: String,
    pub actor: String,
    pub timestamp: DateTime<Utc>,
    pub outcome: String,
}

/// Retry backoff for a record after `n` failures: min(1000·2ⁿ, 60_000) ms.
pub fn retry_backoff(retry_count: u32) -> Duration {
    let shift = retry_count.min(16);
    let ms = 1000u64.saturating_mul(1u64 << shift).min(60_000);
    Duration::milliseconds(ms as i64)
}

/// One instance of "deliver this message to this recipient".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub id: String,
    pub workspace_id: String,
    /// Platform-specific recipient id.
    pub recipient_id: String,
    /// Originating application user, when known.
    pub app_user_id: Option<String>,
    pub notification_type: NotificationType,
    pub priority: Priority,
    /// Originating domain entity (task id, comment id, …).
    pub entity_id: Option<String>,
    /// Target channel; lazily resolved to the recipient's DM channel.
    pub channel_id: Option<String>,
    pub thread_id: Option<String>,
    pub threaded_reply: bool,
    /// Rendered message body — opaque to the engine.
    pub payload: serde_json::Value,
    pub status: DeliveryStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_failure_reason: Option<String>,
    pub suppressed_reason: Option<SuppressReason>,
    #[serde(default)]
    pub interactions: Vec<InteractionEntry>,
    pub external_message_id: Option<String>,
    pub delivery_latency_ms: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
    /// Passive retention expiry — no active sweep, records past this are
    /// eligible for garbage collection.
    pub expires_at: Option<DateTime<Utc>>,
}

impl NotificationRecord {
    /// Create a fresh record in `pending`.
    pub fn new(
        workspace_id: &str,
        recipient_id: &str,
        notification_type: NotificationType,
        priority: Priority,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            workspace_id: workspace_id.to_string(),
            recipient_id: recipient_id.to_string(),
            app_user_id: None,
            notification_type,
            priority,
            entity_id: None,
            channel_id: None,
            thread_id: None,
            threaded_reply: false,
            payload,
            status: DeliveryStatus::Pending,
            retry_count: 0,
            max_retries: 3,
            next_retry_at: None,
            last_failure_reason: None,
            suppressed_reason: None,
            interactions: Vec::new(),
            external_message_id: None,
            delivery_latency_ms: None,
            created_at: Utc::now(),
            delivered_at: None,
            expires_at: None,
        }
    }

    /// Accepted into a work queue.
    pub fn mark_queued(&mut self) {
        self.status = DeliveryStatus::Queued;
    }

    /// Handed to the transport; awaiting confirmation.
    pub fn mark_sent(&mut self) {
        self.status = DeliveryStatus::Sent;
    }

    /// Transport confirmed delivery. Retention extends to 30 days from now.
    pub fn mark_delivered(&mut self, external_message_id: &str, latency_ms: u64) {
        self.status = DeliveryStatus::Delivered;
        self.external_message_id = Some(external_message_id.to_string());
        self.delivery_latency_ms = Some(latency_ms);
        let now = Utc::now();
        self.delivered_at = Some(now);
        self.next_retry_at = None;
        self.expires_at = Some(now + Duration::days(DELIVERED_RETENTION_DAYS));
    }

    /// A delivery attempt failed. Below `max_retries` the record goes back
    /// to `pending` with an exponential-backoff `next_retry_at`; at the cap
    /// it stays terminally `failed`. Retention shortens to 7 days either way.
    pub fn mark_failed(&mut self, reason: &str) {
        self.bump_failure(reason);
        if self.retry_count < self.max_retries {
            self.status = DeliveryStatus::Pending;
            self.next_retry_at = Some(Utc::now() + retry_backoff(self.retry_count));
        } else {
            self.status = DeliveryStatus::Failed;
            self.next_retry_at = None;
        }
    }

    /// Rate-limit flavored failure: same retry bookkeeping as `mark_failed`,
    /// but the record parks in `rate_limited` until the workspace window
    /// passes (the retry sweep picks it back up).
    pub fn mark_rate_limited(&mut self, reason: &str, retry_after_ms: u64) {
        self.bump_failure(reason);
        if self.retry_count < self.max_retries {
            self.status = DeliveryStatus::RateLimited;
            let wait = retry_backoff(self.retry_count)
                .max(Duration::milliseconds(retry_after_ms as i64));
            self.next_retry_at = Some(Utc::now() + wait);
        } else {
            self.status = DeliveryStatus::Failed;
            self.next_retry_at = None;
        }
    }

    /// Fatal to this record without touching the retry budget — used for
    /// channel/recipient-not-found, where retrying can never help.
    pub fn fail_terminal(&mut self, reason: &str) {
        self.status = DeliveryStatus::Failed;
        self.last_failure_reason = Some(reason.to_string());
        self.next_retry_at = None;
        self.expires_at = Some(Utc::now() + Duration::days(FAILED_RETENTION_DAYS));
    }

    fn bump_failure(&mut self, reason: &str) {
        self.retry_count = self.retry_count.saturating_add(1);
        self.last_failure_reason = Some(reason.to_string());
        self.expires_at = Some(Utc::now() + Duration::days(FAILED_RETENTION_DAYS));
    }

    /// Terminal suppression — no retry, no delivery.
    pub fn suppress(&mut self, reason: SuppressReason) {
        self.status = DeliveryStatus::Suppressed;
        self.suppressed_reason = Some(reason);
        self.next_retry_at = None;
        self.expires_at = Some(Utc::now() + Duration::days(FAILED_RETENTION_DAYS));
    }

    /// Buffered into the recipient's pending batch.
    pub fn mark_batched(&mut self) {
        self.status = DeliveryStatus::Batched;
    }

    /// Append an interaction to the record's log.
    pub fn record_interaction(&mut self, action_id: &str, actor: &str, outcome: &str) {
        self.interactions.push(InteractionEntry {
            action_id: action_id.to_string(),
            actor: actor.to_string(),
            timestamp: Utc::now(),
            outcome: outcome.to_string(),
        });
    }

    /// Whether this record can still be picked up by the retry sweep.
    pub fn retry_eligible(&self, now: DateTime<Utc>) -> bool {
        matches!(
            self.status,
            DeliveryStatus::Pending | DeliveryStatus::RateLimited
        ) && self.retry_count > 0
            && self.retry_count < self.max_retries
            && self.next_retry_at.is_some_and(|at| at <= now)
    }
}

/// Quiet-hours window in the recipient's local timezone.
/// Overnight windows (start > end) wrap past midnight; bounds are [start, end).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuietHours {
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub timezone: Tz,
}

impl QuietHours {
    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        let local = now.with_timezone(&self.timezone).time();
        if self.start <= self.end {
            local >= self.start && local < self.end
        } else {
            local >= self.start || local < self.end
        }
    }
}

/// How often a recipient wants digest summaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DigestFrequency {
    #[default]
    Never,
    Hourly,
    Daily,
    Weekly,
}

/// Digest aggregation window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DigestPeriod {
    Hourly,
    Daily,
    Weekly,
}

/// Weekly digests fire on this weekday.
pub const WEEKLY_DIGEST_ANCHOR: Weekday = Weekday::Mon;

impl DigestPeriod {
    /// Completed-work lookback matching the period length.
    pub fn lookback(&self) -> Duration {
        match self {
            DigestPeriod::Hourly => Duration::hours(1),
            DigestPeriod::Daily => Duration::days(1),
            DigestPeriod::Weekly => Duration::weeks(1),
        }
    }

    /// Forward window for "due soon" items.
    pub fn forward_window(&self) -> Duration {
        self.lookback()
    }

    /// Whether a recipient with these preferences is due on this tick.
    /// Hour-of-day is evaluated in the recipient's quiet-hours timezone when
    /// one is set, UTC otherwise.
    pub fn tick_matches(&self, prefs: &NotificationPrefs, now: DateTime<Utc>) -> bool {
        let local_hour = |now: DateTime<Utc>| match &prefs.quiet_hours {
            Some(qh) => now.with_timezone(&qh.timezone).hour(),
            None => now.hour(),
        };
        let local_weekday = |now: DateTime<Utc>| match &prefs.quiet_hours {
            Some(qh) => now.with_timezone(&qh.timezone).weekday(),
            None => now.weekday(),
        };
        match self {
            DigestPeriod::Hourly => prefs.digest_frequency == DigestFrequency::Hourly,
            DigestPeriod::Daily => {
                prefs.digest_frequency == DigestFrequency::Daily
                    && local_hour(now) == prefs.digest_hour
            }
            DigestPeriod::Weekly => {
                prefs.digest_frequency == DigestFrequency::Weekly
                    && local_hour(now) == prefs.digest_hour
                    && local_weekday(now) == WEEKLY_DIGEST_ANCHOR
            }
        }
    }
}

/// Per-recipient delivery preferences.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationPrefs {
    /// Global kill switch for this recipient.
    pub enabled: bool,
    /// Per-type toggles; absent means enabled.
    #[serde(default)]
    pub type_toggles: HashMap<NotificationType, bool>,
    pub min_priority: PriorityFloor,
    pub quiet_hours: Option<QuietHours>,
    pub digest_frequency: DigestFrequency,
    /// Local hour-of-day (0-23) for daily/weekly digests.
    pub digest_hour: u32,
    pub batching_enabled: bool,
    /// Overrides the workspace batch interval when set.
    pub batch_interval_minutes: Option<u64>,
}

impl Default for NotificationPrefs {
    fn default() -> Self {
        Self {
            enabled: true,
            type_toggles: HashMap::new(),
            min_priority: PriorityFloor::All,
            quiet_hours: None,
            digest_frequency: DigestFrequency::Never,
            digest_hour: 9,
            batching_enabled: false,
            batch_interval_minutes: None,
        }
    }
}

impl NotificationPrefs {
    /// Whether notifications of this type are enabled.
    /// Only an explicit `false` toggle disables a type.
    pub fn type_enabled(&self, ty: NotificationType) -> bool {
        self.type_toggles.get(&ty).copied().unwrap_or(true)
    }
}

/// Compact summary buffered for a batched notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchEntry {
    pub notification_type: NotificationType,
    pub title: String,
    pub message: String,
    pub entity_id: Option<String>,
    pub priority: Priority,
    pub created_at: DateTime<Utc>,
}

/// Where a task's conversation lives on the chat platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskThread {
    pub channel_id: String,
    pub thread_id: Option<String>,
    pub last_activity: DateTime<Utc>,
}

/// Bounded task→thread map with least-recently-used eviction.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TaskThreadMap {
    entries: HashMap<String, TaskThread>,
    /// Access order, least-recent first.
    order: VecDeque<String>,
}

impl TaskThreadMap {
    /// Insert or refresh a task's thread mapping, evicting the
    /// least-recently-used entry beyond the cap.
    pub fn touch(&mut self, task_id: &str, thread: TaskThread) {
        if self.entries.insert(task_id.to_string(), thread).is_some() {
            self.order.retain(|k| k != task_id);
        }
        self.order.push_back(task_id.to_string());
        while self.entries.len() > TASK_THREAD_CAP {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            } else {
                break;
            }
        }
    }

    /// Look up a task's thread and mark it recently used.
    pub fn get(&mut self, task_id: &str) -> Option<&TaskThread> {
        if self.entries.contains_key(task_id) {
            self.order.retain(|k| k != task_id);
            self.order.push_back(task_id.to_string());
        }
        self.entries.get(task_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A recipient's link between the application identity and the chat platform.
///
/// Exactly one active profile exists per (app user, workspace) pair; a
/// profile may be deactivated without deletion, preserving history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecipientProfile {
    /// Platform user id — the primary key for delivery.
    pub id: String,
    pub workspace_id: String,
    pub app_user_id: Option<String>,
    /// Lazily populated on first DM delivery.
    pub dm_channel_id: Option<String>,
    pub active: bool,
    pub prefs: NotificationPrefs,
    /// Pending batch buffer, oldest-first, capped at 50.
    #[serde(default)]
    pub pending_batch: VecDeque<BatchEntry>,
    pub last_batch_flushed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub task_threads: TaskThreadMap,
    #[serde(default)]
    pub notifications_delivered: u64,
    #[serde(default)]
    pub interactions_seen: u64,
    pub created_at: DateTime<Utc>,
}

impl RecipientProfile {
    pub fn new(id: &str, workspace_id: &str) -> Self {
        Self {
            id: id.to_string(),
            workspace_id: workspace_id.to_string(),
            app_user_id: None,
            dm_channel_id: None,
            active: true,
            prefs: NotificationPrefs::default(),
            pending_batch: VecDeque::new(),
            last_batch_flushed_at: None,
            task_threads: TaskThreadMap::default(),
            notifications_delivered: 0,
            interactions_seen: 0,
            created_at: Utc::now(),
        }
    }

    /// Unlink without deleting — history stays queryable.
    pub fn deactivate(&mut self) {
        self.active = false;
    }
}

/// Coarse workspace health derived from consecutive transport failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceHealth {
    #[default]
    Healthy,
    RateLimited,
    Unhealthy,
}

/// Per-chat-workspace settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    pub id: String,
    pub notifications_enabled: bool,
    pub threading_enabled: bool,
    pub batch_interval_minutes: u64,
    pub health: WorkspaceHealth,
    pub consecutive_failures: u32,
    /// Set on auth revocation; no delivery until re-authorized.
    pub delivery_disabled: bool,
    pub updated_at: DateTime<Utc>,
}

impl WorkspaceConfig {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            notifications_enabled: true,
            threading_enabled: true,
            batch_interval_minutes: 5,
            health: WorkspaceHealth::Healthy,
            consecutive_failures: 0,
            delivery_disabled: false,
            updated_at: Utc::now(),
        }
    }
}

/// One outstanding/recent work item pulled for a digest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: String,
    pub title: String,
    pub priority: Priority,
    pub due_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// A recipient's work snapshot for one digest period.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DigestWork {
    pub outstanding: Vec<WorkItem>,
    pub overdue: Vec<WorkItem>,
    pub due_soon: Vec<WorkItem>,
    pub completed: Vec<WorkItem>,
}

impl DigestWork {
    pub fn is_empty(&self) -> bool {
        self.outstanding.is_empty()
            && self.overdue.is_empty()
            && self.due_soon.is_empty()
            && self.completed.is_empty()
    }
}

/// A domain event submitted for delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationEvent {
    pub workspace_id: String,
    pub recipient_id: String,
    pub app_user_id: Option<String>,
    pub notification_type: NotificationType,
    pub priority: Priority,
    pub title: String,
    pub message: String,
    pub entity_id: Option<String>,
    /// Explicit channel target; defaults to the recipient's DM channel.
    pub channel_id: Option<String>,
    pub thread_id: Option<String>,
    /// Extra template context handed to the renderer untouched.
    #[serde(default)]
    pub context: serde_json::Value,
    /// Bypass quiet hours and batching.
    #[serde(default)]
    pub force_immediate: bool,
}

impl NotificationEvent {
    pub fn new(
        workspace_id: &str,
        recipient_id: &str,
        notification_type: NotificationType,
        priority: Priority,
        title: &str,
        message: &str,
    ) -> Self {
        Self {
            workspace_id: workspace_id.to_string(),
            recipient_id: recipient_id.to_string(),
            app_user_id: None,
            notification_type,
            priority,
            title: title.to_string(),
            message: message.to_string(),
            entity_id: None,
            channel_id: None,
            thread_id: None,
            context: serde_json::Value::Null,
            force_immediate: false,
        }
    }

    /// Reject malformed input before it reaches a queue.
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.workspace_id.is_empty() {
            return Err(crate::error::TaskPingError::Validation(
                "workspace_id is required".into(),
            ));
        }
        if self.recipient_id.is_empty() {
            return Err(crate::error::TaskPingError::Validation(
                "recipient_id is required".into(),
            ));
        }
        if self.title.is_empty() {
            return Err(crate::error::TaskPingError::Validation(
                "title is required".into(),
            ));
        }
        Ok(())
    }
}

/// Best-effort delivery telemetry. Failures recording these never block
/// the delivery path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyticsEvent {
    pub kind: String,
    pub workspace_id: String,
    pub recipient_id: Option<String>,
    pub notification_id: Option<String>,
    pub at: DateTime<Utc>,
}
