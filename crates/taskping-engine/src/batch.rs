//! Batch accumulator — per-recipient pending-notification buffer with
//! size/age flush triggers. Also serves quiet-hours deferral: deferred
//! notifications land here and flush when the window ends.

use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;

use taskping_core::config::BatchConfig;
use taskping_core::types::{
    BATCH_BUFFER_CAP, BatchEntry, NotificationType, RecipientProfile, WorkspaceConfig,
};

/// Accumulates compact notification summaries per recipient and decides
/// when a buffer is ripe for flushing.
pub struct BatchAccumulator {
    config: BatchConfig,
    /// Advisory duplicate-suppression guard: recipients with a flush job
    /// currently enqueued or running. Best-effort, keyed by recipient id.
    in_flight: Mutex<HashSet<String>>,
}

impl BatchAccumulator {
    pub fn new(config: BatchConfig) -> Self {
        Self {
            config,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Append a summary to the recipient's buffer. Beyond the cap the oldest
    /// entry is evicted first.
    pub fn add(&self, recipient: &mut RecipientProfile, entry: BatchEntry) {
        recipient.pending_batch.push_back(entry);
        while recipient.pending_batch.len() > BATCH_BUFFER_CAP {
            recipient.pending_batch.pop_front();
        }
    }

    /// Effective flush interval: recipient override → workspace setting →
    /// engine default.
    pub fn flush_interval(
        &self,
        recipient: &RecipientProfile,
        workspace: Option<&WorkspaceConfig>,
    ) -> Duration {
        let minutes = recipient
            .prefs
            .batch_interval_minutes
            .or(workspace.map(|w| w.batch_interval_minutes))
            .unwrap_or(self.config.default_interval_minutes);
        Duration::minutes(minutes as i64)
    }

    /// Whether this recipient's buffer should flush now: non-empty and the
    /// configured interval has elapsed since the last flush.
    pub fn due_for_flush(
        &self,
        recipient: &RecipientProfile,
        workspace: Option<&WorkspaceConfig>,
        now: DateTime<Utc>,
    ) -> bool {
        if recipient.pending_batch.is_empty() {
            return false;
        }
        let last = recipient
            .last_batch_flushed_at
            .unwrap_or(recipient.created_at);
        now - last >= self.flush_interval(recipient, workspace)
    }

    /// Drain the buffer (oldest-first) and stamp the flush time.
    pub fn take(&self, recipient: &mut RecipientProfile, now: DateTime<Utc>) -> Vec<BatchEntry> {
        recipient.last_batch_flushed_at = Some(now);
        recipient.pending_batch.drain(..).collect()
    }

    /// Claim the flush slot for a recipient. Returns false when a flush job
    /// is already in flight — the caller must not enqueue a second one.
    pub async fn try_begin_flush(&self, recipient_id: &str) -> bool {
        self.in_flight.lock().await.insert(recipient_id.to_string())
    }

    /// Release the flush slot.
    pub async fn end_flush(&self, recipient_id: &str) {
        self.in_flight.lock().await.remove(recipient_id);
    }
}

/// Group entries by type for the composite message, preserving oldest-first
/// order within each group and across group headers.
pub fn group_by_type(entries: &[BatchEntry]) -> Vec<(NotificationType, Vec<&BatchEntry>)> {
    let mut groups: Vec<(NotificationType, Vec<&BatchEntry>)> = Vec::new();
    for entry in entries {
        match groups.iter_mut().find(|(ty, _)| *ty == entry.notification_type) {
            Some((_, items)) => items.push(entry),
            None => groups.push((entry.notification_type, vec![entry])),
        }
    }
    groups
}

/// Render context for one composite batch message.
pub fn composite_context(entries: &[BatchEntry]) -> serde_json::Value {
    let groups: Vec<serde_json::Value> = group_by_type(entries)
        .into_iter()
        .map(|(ty, items)| {
            serde_json::json!({
                "type": ty,
                "count": items.len(),
                "items": items
                    .iter()
                    .map(|e| {
                        serde_json::json!({
                            "title": e.title,
                            "message": e.message,
                            "entity_id": e.entity_id,
                            "priority": e.priority,
                            "at": e.created_at,
                        })
                    })
                    .collect::<Vec<_>>(),
            })
        })
        .collect();
    serde_json::json!({
        "total": entries.len(),
        "groups": groups,
    })
}
