//! In-memory `Store` — the default backing store (queue-loss-on-restart
//! parity with the in-process queues) and the fixture store for tests.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use taskping_core::error::{Result, TaskPingError};
use taskping_core::traits::Store;
use taskping_core::types::{
    AnalyticsEvent, DigestPeriod, DigestWork, NotificationRecord, RecipientProfile,
    WorkspaceConfig,
};

/// Process-memory store. Locks are never held across await points.
#[derive(Default)]
pub struct MemoryStore {
    notifications: Mutex<HashMap<String, NotificationRecord>>,
    recipients: Mutex<HashMap<String, RecipientProfile>>,
    workspaces: Mutex<HashMap<String, WorkspaceConfig>>,
    digest_work: Mutex<HashMap<String, DigestWork>>,
    analytics: Mutex<Vec<AnalyticsEvent>>,
    /// Test hook: make `record_analytics` fail to exercise the best-effort
    /// swallow path.
    fail_analytics: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a recipient profile.
    pub fn put_recipient(&self, profile: RecipientProfile) {
        self.recipients
            .lock()
            .unwrap()
            .insert(profile.id.clone(), profile);
    }

    /// Seed a workspace config.
    pub fn put_workspace(&self, config: WorkspaceConfig) {
        self.workspaces
            .lock()
            .unwrap()
            .insert(config.id.clone(), config);
    }

    /// Seed the digest work snapshot returned for a recipient.
    pub fn put_digest_work(&self, recipient_id: &str, work: DigestWork) {
        self.digest_work
            .lock()
            .unwrap()
            .insert(recipient_id.to_string(), work);
    }

    pub fn set_fail_analytics(&self, fail: bool) {
        self.fail_analytics.store(fail, Ordering::SeqCst);
    }

    pub fn analytics_count(&self) -> usize {
        self.analytics.lock().unwrap().len()
    }

    /// All stored notification records (test assertions).
    pub fn notifications_snapshot(&self) -> Vec<NotificationRecord> {
        self.notifications.lock().unwrap().values().cloned().collect()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn load_notification(&self, id: &str) -> Result<Option<NotificationRecord>> {
        Ok(self.notifications.lock().unwrap().get(id).cloned())
    }

    async fn save_notification(&self, record: &NotificationRecord) -> Result<()> {
        self.notifications
            .lock()
            .unwrap()
            .insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn load_recipient(&self, id: &str) -> Result<Option<RecipientProfile>> {
        Ok(self.recipients.lock().unwrap().get(id).cloned())
    }

    async fn save_recipient(&self, profile: &RecipientProfile) -> Result<()> {
        self.recipients
            .lock()
            .unwrap()
            .insert(profile.id.clone(), profile.clone());
        Ok(())
    }

    async fn load_workspace(&self, id: &str) -> Result<Option<WorkspaceConfig>> {
        Ok(self.workspaces.lock().unwrap().get(id).cloned())
    }

    async fn save_workspace(&self, config: &WorkspaceConfig) -> Result<()> {
        self.workspaces
            .lock()
            .unwrap()
            .insert(config.id.clone(), config.clone());
        Ok(())
    }

    async fn find_pending_retries(&self, limit: usize) -> Result<Vec<NotificationRecord>> {
        let now = Utc::now();
        let mut due: Vec<NotificationRecord> = self
            .notifications
            .lock()
            .unwrap()
            .values()
            .filter(|r| r.retry_eligible(now))
            .cloned()
            .collect();
        due.sort_by_key(|r| r.next_retry_at);
        due.truncate(limit);
        Ok(due)
    }

    async fn find_recipients_with_pending_batches(
        &self,
        max_age: Duration,
    ) -> Result<Vec<RecipientProfile>> {
        let now = Utc::now();
        Ok(self
            .recipients
            .lock()
            .unwrap()
            .values()
            .filter(|r| {
                if r.pending_batch.is_empty() {
                    return false;
                }
                let last = r.last_batch_flushed_at.unwrap_or(r.created_at);
                now - last >= max_age
            })
            .cloned()
            .collect())
    }

    async fn find_recipients_for_digest(
        &self,
        period: DigestPeriod,
        tick: DateTime<Utc>,
    ) -> Result<Vec<RecipientProfile>> {
        Ok(self
            .recipients
            .lock()
            .unwrap()
            .values()
            .filter(|r| r.active && r.prefs.enabled && period.tick_matches(&r.prefs, tick))
            .cloned()
            .collect())
    }

    async fn load_digest_work(
        &self,
        recipient_id: &str,
        _period: DigestPeriod,
        _now: DateTime<Utc>,
    ) -> Result<DigestWork> {
        Ok(self
            .digest_work
            .lock()
            .unwrap()
            .get(recipient_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn record_analytics(&self, event: &AnalyticsEvent) -> Result<()> {
        if self.fail_analytics.load(Ordering::SeqCst) {
            return Err(TaskPingError::Store("analytics sink unavailable".into()));
        }
        self.analytics.lock().unwrap().push(event.clone());
        Ok(())
    }
}
