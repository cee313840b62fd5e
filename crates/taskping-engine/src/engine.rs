//! The notification engine — the single entry point tying eligibility,
//! batching, queues, the channel guard, and the store together.
//!
//! Construction is explicit dependency injection: callers hand in the store,
//! transport, and renderer; nothing here reaches for globals.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{Duration, Utc};

use taskping_core::config::EngineConfig;
use taskping_core::error::{Result, TaskPingError};
use taskping_core::traits::{ChannelClient, PayloadRenderer, SendReceipt, Store};
use taskping_core::types::{
    AnalyticsEvent, BatchEntry, DigestPeriod, DeliveryStatus, NotificationEvent,
    NotificationRecord, NotificationType, Priority, RecipientProfile, SuppressReason, TaskThread,
    WorkspaceConfig,
};

use crate::batch::{BatchAccumulator, composite_context};
use crate::digest::DigestAggregator;
use crate::eligibility::{Decision, evaluate};
use crate::guard::ChannelGuard;
use crate::queue::{JobCategory, JobPayload, QueueJob, QueueStats, WorkQueues};

/// Outcome of a multi-recipient submit.
#[derive(Debug, Default)]
pub struct SubmitReport {
    /// Recipient ids processed without error.
    pub successful: Vec<String>,
    /// Recipient id and the error it hit.
    pub failed: Vec<(String, String)>,
}

pub struct NotificationEngine {
    store: Arc<dyn Store>,
    renderer: Arc<dyn PayloadRenderer>,
    guard: ChannelGuard,
    config: EngineConfig,
    queues: WorkQueues,
    batcher: BatchAccumulator,
    /// Records with a delivery attempt currently running. Advisory guard
    /// against the same record racing itself across drain loops.
    in_flight: Mutex<HashSet<String>>,
    shutting_down: AtomicBool,
}

impl NotificationEngine {
    pub fn new(
        store: Arc<dyn Store>,
        client: Arc<dyn ChannelClient>,
        renderer: Arc<dyn PayloadRenderer>,
        config: EngineConfig,
    ) -> Arc<Self> {
        Self::with_queues(store, client, renderer, config, WorkQueues::in_memory())
    }

    /// Construct with injected queues (e.g. a durable backend).
    pub fn with_queues(
        store: Arc<dyn Store>,
        client: Arc<dyn ChannelClient>,
        renderer: Arc<dyn PayloadRenderer>,
        config: EngineConfig,
        queues: WorkQueues,
    ) -> Arc<Self> {
        let guard = ChannelGuard::new(client, store.clone(), config.retry.clone());
        let batcher = BatchAccumulator::new(config.batching.clone());
        Arc::new(Self {
            store,
            renderer,
            guard,
            config,
            queues,
            batcher,
            in_flight: Mutex::new(HashSet::new()),
            shutting_down: AtomicBool::new(false),
        })
    }

    /// Submit one domain event for delivery.
    ///
    /// Returns the notification record id when one was created and accepted
    /// (queued or batched), `None` when the event was denied or the recipient
    /// has no delivery profile. Suppressed records stay queryable either way.
    pub async fn submit(self: &Arc<Self>, event: NotificationEvent) -> Result<Option<String>> {
        event.validate()?;

        let Some(mut recipient) = self.store.load_recipient(&event.recipient_id).await? else {
            tracing::debug!(
                recipient = %event.recipient_id,
                "no delivery profile, dropping event"
            );
            return Ok(None);
        };
        let workspace = self
            .store
            .load_workspace(&event.workspace_id)
            .await?
            .unwrap_or_else(|| WorkspaceConfig::new(&event.workspace_id));

        let decision = evaluate(
            &recipient,
            &workspace,
            event.notification_type,
            event.priority,
            event.force_immediate,
            &self.config,
            Utc::now(),
        );

        match decision {
            Decision::Deny(reason) => {
                let mut record = self.record_from(&event);
                record.suppress(reason);
                self.store.save_notification(&record).await?;
                tracing::debug!(
                    notification = %record.id,
                    recipient = %event.recipient_id,
                    reason = ?reason,
                    "notification suppressed"
                );
                Ok(None)
            }
            Decision::DeferQuietHours => {
                tracing::debug!(
                    recipient = %event.recipient_id,
                    "inside quiet hours, deferring to batch"
                );
                self.buffer_for_batch(event, recipient, &workspace).await
            }
            Decision::AllowBatch => self.buffer_for_batch(event, recipient, &workspace).await,
            Decision::AllowImmediate => {
                let mut record = self.record_from(&event);
                record.payload = self
                    .renderer
                    .render(event.notification_type, &event_context(&event));
                self.resolve_target(&mut record, &event, &mut recipient, &workspace);
                record.mark_queued();
                self.store.save_notification(&record).await?;
                self.queues
                    .enqueue_notification(&record.id, record.priority)
                    .await;

                let delay = if record.priority == Priority::Critical || event.force_immediate {
                    0
                } else {
                    self.config.queues.notification_debounce_ms
                };
                self.schedule_drain(JobCategory::Notification, delay);
                Ok(Some(record.id))
            }
        }
    }

    /// Fan one event out to many recipients. Per-recipient failures never
    /// abort the rest.
    pub async fn submit_to_many(
        self: &Arc<Self>,
        recipient_ids: &[String],
        event: &NotificationEvent,
    ) -> SubmitReport {
        let mut report = SubmitReport::default();
        for recipient_id in recipient_ids {
            let mut each = event.clone();
            each.recipient_id = recipient_id.clone();
            match self.submit(each).await {
                Ok(_) => report.successful.push(recipient_id.clone()),
                Err(e) => report.failed.push((recipient_id.clone(), e.to_string())),
            }
        }
        report
    }

    /// Request a rebuild of the recipient's home surface. Coalesced: only the
    /// newest pending request per recipient survives.
    pub async fn request_surface_refresh(self: &Arc<Self>, recipient_id: &str) {
        self.queues.enqueue_surface_refresh(recipient_id).await;
        self.schedule_drain(JobCategory::SurfaceRefresh, self.config.queues.surface_debounce_ms);
    }

    /// Waiting/completed/failed counters for every queue.
    pub async fn queue_stats(&self) -> Vec<(JobCategory, QueueStats)> {
        self.queues.stats().await
    }

    /// Scheduler tick: enqueue a flush for every recipient whose batch buffer
    /// is ripe. Returns how many flushes were enqueued.
    pub async fn run_scheduled_batch_sweep(self: &Arc<Self>) -> Result<usize> {
        // Coarse prefilter; per-recipient/workspace intervals refine below.
        let due = self
            .store
            .find_recipients_with_pending_batches(Duration::minutes(1))
            .await?;
        let now = Utc::now();
        let mut enqueued = 0;
        for recipient in &due {
            let workspace = self.store.load_workspace(&recipient.workspace_id).await?;
            if !self.batcher.due_for_flush(recipient, workspace.as_ref(), now) {
                continue;
            }
            if self.batcher.try_begin_flush(&recipient.id).await {
                self.queues.enqueue_batch_flush(&recipient.id).await;
                enqueued += 1;
            }
        }
        if enqueued > 0 {
            self.schedule_drain(JobCategory::Batch, self.config.queues.batch_debounce_ms);
        }
        Ok(enqueued)
    }

    /// Flush one recipient's batch buffer immediately, e.g. when their quiet
    /// hours end.
    pub async fn flush_recipient_now(self: &Arc<Self>, recipient_id: &str) {
        if self.batcher.try_begin_flush(recipient_id).await {
            self.queues.enqueue_batch_flush(recipient_id).await;
            self.schedule_drain(JobCategory::Batch, 0);
        }
    }

    /// Scheduler tick for one digest period: enqueue a digest for every
    /// recipient whose preference matches this tick.
    pub async fn run_scheduled_digest(self: &Arc<Self>, period: DigestPeriod) -> Result<usize> {
        let tick = Utc::now();
        let recipients = self.store.find_recipients_for_digest(period, tick).await?;
        for recipient in &recipients {
            self.queues.enqueue_digest(&recipient.id, period).await;
        }
        if !recipients.is_empty() {
            self.schedule_drain(JobCategory::Digest, 0);
        }
        Ok(recipients.len())
    }

    /// Scheduler tick: re-queue records whose retry backoff has elapsed.
    pub async fn run_retry_sweep(self: &Arc<Self>) -> Result<usize> {
        let due = self
            .store
            .find_pending_retries(self.config.batching.retry_sweep_limit)
            .await?;
        let mut any_critical = false;
        for mut record in due.iter().cloned() {
            any_critical |= record.priority == Priority::Critical;
            record.mark_queued();
            self.store.save_notification(&record).await?;
            self.queues
                .enqueue_notification(&record.id, record.priority)
                .await;
        }
        if !due.is_empty() {
            let delay = if any_critical {
                0
            } else {
                self.config.queues.notification_debounce_ms
            };
            self.schedule_drain(JobCategory::Notification, delay);
            tracing::info!(count = due.len(), "retry sweep re-queued records");
        }
        Ok(due.len())
    }

    /// Record a user interaction (button click, reaction) against a delivered
    /// notification.
    pub async fn record_interaction(
        self: &Arc<Self>,
        notification_id: &str,
        action_id: &str,
        actor: &str,
        outcome: &str,
    ) -> Result<()> {
        let Some(mut record) = self.store.load_notification(notification_id).await? else {
            return Err(TaskPingError::Validation(format!(
                "unknown notification {notification_id}"
            )));
        };
        record.record_interaction(action_id, actor, outcome);
        self.store.save_notification(&record).await?;

        if let Some(mut recipient) = self.store.load_recipient(&record.recipient_id).await? {
            recipient.interactions_seen += 1;
            self.store.save_recipient(&recipient).await?;
        }
        self.emit_analytics("interaction", &record).await;
        Ok(())
    }

    /// Drain every queue to empty and stop accepting follow-up work.
    /// Queues are not refilled during the drain.
    pub async fn shutdown(self: &Arc<Self>) {
        self.shutting_down.store(true, Ordering::SeqCst);
        for category in JobCategory::ALL {
            self.drain_category(category).await;
        }
        tracing::info!("notification engine drained");
    }

    // ---- internal ----

    fn record_from(&self, event: &NotificationEvent) -> NotificationRecord {
        let mut record = NotificationRecord::new(
            &event.workspace_id,
            &event.recipient_id,
            event.notification_type,
            event.priority,
            serde_json::Value::Null,
        );
        record.app_user_id = event.app_user_id.clone();
        record.entity_id = event.entity_id.clone();
        record
    }

    /// Pick the record's target channel: explicit event target, then the
    /// entity's known thread, otherwise left for lazy DM resolution.
    fn resolve_target(
        &self,
        record: &mut NotificationRecord,
        event: &NotificationEvent,
        recipient: &mut RecipientProfile,
        workspace: &WorkspaceConfig,
    ) {
        if let Some(channel) = &event.channel_id {
            record.channel_id = Some(channel.clone());
            record.thread_id = event.thread_id.clone();
            return;
        }
        if !workspace.threading_enabled {
            return;
        }
        if let Some(entity) = &event.entity_id {
            if let Some(thread) = recipient.task_threads.get(entity) {
                record.channel_id = Some(thread.channel_id.clone());
                record.thread_id = thread.thread_id.clone();
                record.threaded_reply = true;
            }
        }
    }

    async fn buffer_for_batch(
        self: &Arc<Self>,
        event: NotificationEvent,
        mut recipient: RecipientProfile,
        workspace: &WorkspaceConfig,
    ) -> Result<Option<String>> {
        let mut record = self.record_from(&event);
        record.payload = event_context(&event);
        record.mark_batched();

        self.batcher.add(
            &mut recipient,
            BatchEntry {
                notification_type: event.notification_type,
                title: event.title.clone(),
                message: event.message.clone(),
                entity_id: event.entity_id.clone(),
                priority: event.priority,
                created_at: Utc::now(),
            },
        );
        self.store.save_recipient(&recipient).await?;
        self.store.save_notification(&record).await?;

        if self
            .batcher
            .due_for_flush(&recipient, Some(workspace), Utc::now())
            && self.batcher.try_begin_flush(&recipient.id).await
        {
            self.queues.enqueue_batch_flush(&recipient.id).await;
            self.schedule_drain(JobCategory::Batch, self.config.queues.batch_debounce_ms);
        }
        Ok(Some(record.id))
    }

    fn schedule_drain(self: &Arc<Self>, category: JobCategory, delay_ms: u64) {
        if self.shutting_down.load(Ordering::SeqCst) {
            return;
        }
        let engine = self.clone();
        tokio::spawn(async move {
            if delay_ms > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
            }
            engine.drain_category(category).await;
        });
    }

    async fn drain_category(self: &Arc<Self>, category: JobCategory) {
        let engine = self.clone();
        let concurrency = self.config.queues.drain_concurrency;
        self.queues
            .queue(category)
            .drain(concurrency, move |job| {
                let engine = engine.clone();
                async move { engine.process_job(job).await }
            })
            .await;
    }

    async fn process_job(self: &Arc<Self>, job: QueueJob) -> Result<()> {
        match job.payload {
            JobPayload::Notification { record_id } => self.deliver_record(&record_id).await,
            JobPayload::BatchFlush { recipient_id } => self.flush_batch(&recipient_id).await,
            JobPayload::Digest {
                recipient_id,
                period,
            } => self.send_digest(&recipient_id, period).await,
            JobPayload::SurfaceRefresh { recipient_id } => {
                self.publish_surface(&recipient_id).await
            }
            JobPayload::Analytics { event } => {
                // Best effort; a failed sink never fails the queue job.
                if let Err(e) = self.store.record_analytics(&event).await {
                    tracing::debug!(error = %e, kind = %event.kind, "analytics event dropped");
                }
                Ok(())
            }
        }
    }

    async fn deliver_record(self: &Arc<Self>, record_id: &str) -> Result<()> {
        if !self.in_flight.lock().unwrap().insert(record_id.to_string()) {
            tracing::debug!(notification = record_id, "delivery already in flight");
            return Ok(());
        }
        let result = self.deliver_record_inner(record_id).await;
        self.in_flight.lock().unwrap().remove(record_id);
        result
    }

    async fn deliver_record_inner(self: &Arc<Self>, record_id: &str) -> Result<()> {
        let Some(mut record) = self.store.load_notification(record_id).await? else {
            tracing::warn!(notification = record_id, "queued record vanished");
            return Ok(());
        };
        if !matches!(
            record.status,
            DeliveryStatus::Queued | DeliveryStatus::Pending | DeliveryStatus::RateLimited
        ) {
            tracing::debug!(
                notification = record_id,
                status = ?record.status,
                "record not deliverable, skipping"
            );
            return Ok(());
        }

        match self.attempt_send(&mut record).await {
            Ok(receipt) => {
                record.mark_delivered(&receipt.external_id, receipt.latency_ms);
                self.store.save_notification(&record).await?;
                tracing::info!(
                    notification = %record.id,
                    recipient = %record.recipient_id,
                    latency_ms = receipt.latency_ms,
                    "notification delivered"
                );
                self.after_delivery(&record, &receipt).await;
                Ok(())
            }
            Err(err) => {
                match &err {
                    TaskPingError::RateLimited { retry_after_ms } => {
                        record.mark_rate_limited("platform rate limit", *retry_after_ms);
                    }
                    TaskPingError::AuthRevoked(_) => {
                        // Workspace already disabled by the guard.
                        record.suppress(SuppressReason::WorkspaceDisabled);
                    }
                    TaskPingError::ChannelNotFound(_) | TaskPingError::RecipientNotFound(_) => {
                        record.fail_terminal(&err.to_string());
                    }
                    _ => record.mark_failed(&err.to_string()),
                }
                self.store.save_notification(&record).await?;
                Err(err)
            }
        }
    }

    /// Resolve the target channel (opening a DM lazily) and hand the payload
    /// to the transport under the guard's policy.
    async fn attempt_send(
        self: &Arc<Self>,
        record: &mut NotificationRecord,
    ) -> Result<SendReceipt> {
        let channel_id = match &record.channel_id {
            Some(c) => c.clone(),
            None => {
                let Some(mut recipient) = self.store.load_recipient(&record.recipient_id).await?
                else {
                    return Err(TaskPingError::RecipientNotFound(
                        record.recipient_id.clone(),
                    ));
                };
                let channel = self
                    .ensure_dm_channel(&mut recipient, &record.workspace_id)
                    .await?;
                record.channel_id = Some(channel.clone());
                channel
            }
        };

        record.mark_sent();
        let client = self.guard.client();
        let thread_id = record.thread_id.clone();
        let payload = record.payload.clone();
        let channel = channel_id.clone();
        self.guard
            .execute(&record.workspace_id, || {
                let client = client.clone();
                let channel = channel.clone();
                let thread_id = thread_id.clone();
                let payload = payload.clone();
                async move { client.send(&channel, thread_id.as_deref(), &payload).await }
            })
            .await
    }

    async fn ensure_dm_channel(
        self: &Arc<Self>,
        recipient: &mut RecipientProfile,
        workspace_id: &str,
    ) -> Result<String> {
        if let Some(channel) = &recipient.dm_channel_id {
            return Ok(channel.clone());
        }
        let client = self.guard.client();
        let recipient_id = recipient.id.clone();
        let channel = self
            .guard
            .execute(workspace_id, || {
                let client = client.clone();
                let recipient_id = recipient_id.clone();
                async move { client.open_direct_channel(&recipient_id).await }
            })
            .await?;
        recipient.dm_channel_id = Some(channel.clone());
        self.store.save_recipient(recipient).await?;
        Ok(channel)
    }

    /// Post-delivery bookkeeping: recipient counters, the task→thread map,
    /// a surface refresh, and telemetry. Never fails the delivery.
    async fn after_delivery(self: &Arc<Self>, record: &NotificationRecord, receipt: &SendReceipt) {
        match self.store.load_recipient(&record.recipient_id).await {
            Ok(Some(mut recipient)) => {
                recipient.notifications_delivered += 1;
                if let (Some(entity), Some(channel)) = (&record.entity_id, &record.channel_id) {
                    // The root message of a fresh conversation anchors the
                    // entity's thread; replies keep the existing anchor.
                    let thread_id = record
                        .thread_id
                        .clone()
                        .or_else(|| Some(receipt.external_id.clone()));
                    recipient.task_threads.touch(
                        entity,
                        TaskThread {
                            channel_id: channel.clone(),
                            thread_id,
                            last_activity: Utc::now(),
                        },
                    );
                }
                if let Err(e) = self.store.save_recipient(&recipient).await {
                    tracing::warn!(recipient = %recipient.id, error = %e, "recipient update failed");
                }
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(recipient = %record.recipient_id, error = %e, "recipient load failed");
            }
        }

        if self.shutting_down.load(Ordering::SeqCst) {
            return;
        }
        self.queues
            .enqueue_surface_refresh(&record.recipient_id)
            .await;
        self.schedule_drain(JobCategory::SurfaceRefresh, self.config.queues.surface_debounce_ms);
        self.emit_analytics("notification_delivered", record).await;
    }

    async fn emit_analytics(self: &Arc<Self>, kind: &str, record: &NotificationRecord) {
        if self.shutting_down.load(Ordering::SeqCst) {
            return;
        }
        self.queues
            .enqueue_analytics(AnalyticsEvent {
                kind: kind.to_string(),
                workspace_id: record.workspace_id.clone(),
                recipient_id: Some(record.recipient_id.clone()),
                notification_id: Some(record.id.clone()),
                at: Utc::now(),
            })
            .await;
        self.schedule_drain(JobCategory::Analytics, self.config.queues.surface_debounce_ms);
    }

    async fn flush_batch(self: &Arc<Self>, recipient_id: &str) -> Result<()> {
        let result = self.flush_batch_inner(recipient_id).await;
        self.batcher.end_flush(recipient_id).await;
        result
    }

    async fn flush_batch_inner(self: &Arc<Self>, recipient_id: &str) -> Result<()> {
        let Some(mut recipient) = self.store.load_recipient(recipient_id).await? else {
            tracing::warn!(recipient = recipient_id, "batch flush for unknown recipient");
            return Ok(());
        };
        if recipient.pending_batch.is_empty() {
            return Ok(());
        }

        // Resolve the channel before draining: `ensure_dm_channel` persists
        // the profile, and a drained-but-unsent buffer must never be saved.
        let workspace_id = recipient.workspace_id.clone();
        let channel = self.ensure_dm_channel(&mut recipient, &workspace_id).await?;

        let now = Utc::now();
        let entries = self.batcher.take(&mut recipient, now);
        let count = entries.len();
        let context = composite_context(&entries);
        let payload = self.renderer.render(NotificationType::BatchSummary, &context);

        let client = self.guard.client();
        let receipt = self
            .guard
            .execute(&workspace_id, || {
                let client = client.clone();
                let channel = channel.clone();
                let payload = payload.clone();
                async move { client.send(&channel, None, &payload).await }
            })
            .await?;
        // The buffer clears in the store only after the composite landed;
        // failures above leave it intact for the next sweep.
        recipient.notifications_delivered += 1;
        self.store.save_recipient(&recipient).await?;

        let mut record = NotificationRecord::new(
            &recipient.workspace_id,
            recipient_id,
            NotificationType::BatchSummary,
            Priority::Medium,
            context,
        );
        record.channel_id = Some(channel);
        record.mark_delivered(&receipt.external_id, receipt.latency_ms);
        self.store.save_notification(&record).await?;
        tracing::info!(recipient = recipient_id, count, "batch flushed");

        if !self.shutting_down.load(Ordering::SeqCst) {
            self.queues.enqueue_surface_refresh(recipient_id).await;
            self.schedule_drain(JobCategory::SurfaceRefresh, self.config.queues.surface_debounce_ms);
        }
        Ok(())
    }

    async fn send_digest(self: &Arc<Self>, recipient_id: &str, period: DigestPeriod) -> Result<()> {
        let Some(mut recipient) = self.store.load_recipient(recipient_id).await? else {
            return Ok(());
        };
        let now = Utc::now();
        let work = self.store.load_digest_work(recipient_id, period, now).await?;
        let Some(context) = DigestAggregator::build(&recipient, period, &work, now) else {
            tracing::debug!(recipient = recipient_id, ?period, "empty digest skipped");
            return Ok(());
        };
        let payload = self.renderer.render(NotificationType::Digest, &context);

        let workspace_id = recipient.workspace_id.clone();
        let channel = self.ensure_dm_channel(&mut recipient, &workspace_id).await?;
        let client = self.guard.client();
        let receipt = self
            .guard
            .execute(&workspace_id, || {
                let client = client.clone();
                let channel = channel.clone();
                let payload = payload.clone();
                async move { client.send(&channel, None, &payload).await }
            })
            .await?;

        let mut record = NotificationRecord::new(
            &recipient.workspace_id,
            recipient_id,
            NotificationType::Digest,
            Priority::Low,
            context,
        );
        record.channel_id = Some(channel);
        record.mark_delivered(&receipt.external_id, receipt.latency_ms);
        self.store.save_notification(&record).await?;
        tracing::info!(recipient = recipient_id, ?period, "digest delivered");
        Ok(())
    }

    async fn publish_surface(self: &Arc<Self>, recipient_id: &str) -> Result<()> {
        let Some(recipient) = self.store.load_recipient(recipient_id).await? else {
            return Ok(());
        };
        let context = serde_json::json!({
            "recipient_id": recipient.id,
            "pending_batch": recipient.pending_batch.len(),
            "notifications_delivered": recipient.notifications_delivered,
            "generated_at": Utc::now(),
        });
        let surface = self.renderer.render_surface(&context);

        let client = self.guard.client();
        let target = recipient.id.clone();
        self.guard
            .execute(&recipient.workspace_id, || {
                let client = client.clone();
                let target = target.clone();
                let surface = surface.clone();
                async move { client.publish_surface(&target, &surface).await }
            })
            .await?;
        tracing::debug!(recipient = recipient_id, "surface republished");
        Ok(())
    }
}

/// Render context carrying the event's textual fields plus its free-form
/// template context.
fn event_context(event: &NotificationEvent) -> serde_json::Value {
    serde_json::json!({
        "title": event.title,
        "message": event.message,
        "entity_id": event.entity_id,
        "context": event.context,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::testkit::{PassthroughRenderer, ScriptedChannel};
    use chrono::Timelike;
    use std::sync::atomic::Ordering as AtomicOrdering;
    use taskping_core::config::RetryConfig;
    use taskping_core::types::{DigestFrequency, DigestWork, QuietHours, WorkItem};

    fn test_config() -> EngineConfig {
        let mut config = EngineConfig::default();
        // No in-guard retries so each drain is exactly one transport attempt.
        config.retry = RetryConfig {
            max_retries: 0,
            initial_delay_ms: 1,
            backoff_multiplier: 2,
            max_delay_ms: 2,
            unhealthy_threshold: 3,
        };
        config.queues.notification_debounce_ms = 20;
        config.queues.surface_debounce_ms = 5;
        config.queues.batch_debounce_ms = 5;
        config
    }

    fn build(
        config: EngineConfig,
    ) -> (
        Arc<NotificationEngine>,
        Arc<MemoryStore>,
        Arc<ScriptedChannel>,
    ) {
        crate::testkit::init_tracing();
        let store = Arc::new(MemoryStore::new());
        let channel = Arc::new(ScriptedChannel::new());
        let engine = NotificationEngine::new(
            store.clone(),
            channel.clone(),
            Arc::new(PassthroughRenderer),
            config,
        );
        (engine, store, channel)
    }

    fn event(ty: NotificationType, priority: Priority, title: &str) -> NotificationEvent {
        let mut ev = NotificationEvent::new("ws1", "U1", ty, priority, title, "body");
        ev.entity_id = Some("task-7".into());
        ev
    }

    async fn settle() {
        tokio::time::sleep(std::time::Duration::from_millis(120)).await;
    }

    #[tokio::test]
    async fn test_submit_delivers_end_to_end() {
        let (engine, store, channel) = build(test_config());
        store.put_recipient(RecipientProfile::new("U1", "ws1"));

        let id = engine
            .submit(event(NotificationType::TaskAssigned, Priority::High, "t1"))
            .await
            .unwrap()
            .expect("record id");
        settle().await;

        let record = store.load_notification(&id).await.unwrap().unwrap();
        assert_eq!(record.status, DeliveryStatus::Delivered);
        assert!(record.external_message_id.is_some());
        assert!(record.delivered_at.is_some());

        // DM channel opened lazily and persisted.
        assert_eq!(channel.open_calls.load(AtomicOrdering::SeqCst), 1);
        let recipient = store.load_recipient("U1").await.unwrap().unwrap();
        assert_eq!(recipient.dm_channel_id.as_deref(), Some("D-U1"));
        assert_eq!(recipient.notifications_delivered, 1);

        // Thread anchored on the entity, surface refreshed, telemetry sunk.
        assert_eq!(recipient.task_threads.len(), 1);
        assert_eq!(channel.publish_calls.load(AtomicOrdering::SeqCst), 1);
        assert!(store.analytics_count() >= 1);
    }

    #[tokio::test]
    async fn test_critical_drains_before_earlier_medium() {
        let mut config = test_config();
        config.queues.notification_debounce_ms = 60;
        let (engine, store, channel) = build(config);
        store.put_recipient(RecipientProfile::new("U1", "ws1"));

        engine
            .submit(event(NotificationType::TaskUpdated, Priority::Medium, "med"))
            .await
            .unwrap();
        engine
            .submit(event(
                NotificationType::TaskOverdue,
                Priority::Critical,
                "crit",
            ))
            .await
            .unwrap();
        settle().await;

        let sent = channel.sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        // The critical submit drained immediately and pulled the ordered
        // queue front-first.
        assert_eq!(sent[0].1["context"]["title"], "crit");
        assert_eq!(sent[1].1["context"]["title"], "med");
    }

    #[tokio::test]
    async fn test_quiet_hours_defers_into_batch() {
        let (engine, store, channel) = build(test_config());
        let mut recipient = RecipientProfile::new("U1", "ws1");
        let now = Utc::now().time();
        recipient.prefs.quiet_hours = Some(QuietHours {
            start: now - Duration::hours(1),
            end: now + Duration::hours(1),
            timezone: chrono_tz::UTC,
        });
        store.put_recipient(recipient);

        let id = engine
            .submit(event(NotificationType::CommentAdded, Priority::Medium, "c1"))
            .await
            .unwrap()
            .expect("record id");
        settle().await;

        assert_eq!(channel.send_calls.load(AtomicOrdering::SeqCst), 0);
        let record = store.load_notification(&id).await.unwrap().unwrap();
        assert_eq!(record.status, DeliveryStatus::Batched);
        let recipient = store.load_recipient("U1").await.unwrap().unwrap();
        assert_eq!(recipient.pending_batch.len(), 1);
    }

    #[tokio::test]
    async fn test_explicit_flush_sends_composite() {
        let (engine, store, channel) = build(test_config());
        let mut recipient = RecipientProfile::new("U1", "ws1");
        recipient.prefs.batching_enabled = true;
        recipient.last_batch_flushed_at = Some(Utc::now());
        store.put_recipient(recipient);

        engine
            .submit(event(NotificationType::CommentAdded, Priority::Medium, "c1"))
            .await
            .unwrap();
        engine
            .submit(event(NotificationType::TaskUpdated, Priority::Low, "t1"))
            .await
            .unwrap();
        assert_eq!(channel.send_calls.load(AtomicOrdering::SeqCst), 0);

        engine.flush_recipient_now("U1").await;
        settle().await;

        let sent = channel.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1["context"]["total"], 2);
        drop(sent);

        let recipient = store.load_recipient("U1").await.unwrap().unwrap();
        assert!(recipient.pending_batch.is_empty());
        assert!(recipient.last_batch_flushed_at.is_some());

        let summary = store
            .notifications_snapshot()
            .into_iter()
            .find(|r| r.notification_type == NotificationType::BatchSummary)
            .expect("summary record");
        assert_eq!(summary.status, DeliveryStatus::Delivered);
    }

    #[tokio::test]
    async fn test_denied_event_is_recorded_suppressed() {
        let (engine, store, channel) = build(test_config());
        let mut recipient = RecipientProfile::new("U1", "ws1");
        recipient
            .prefs
            .type_toggles
            .insert(NotificationType::CommentAdded, false);
        store.put_recipient(recipient);

        let id = engine
            .submit(event(NotificationType::CommentAdded, Priority::High, "c1"))
            .await
            .unwrap();
        assert!(id.is_none());
        settle().await;

        assert_eq!(channel.send_calls.load(AtomicOrdering::SeqCst), 0);
        let suppressed = store
            .notifications_snapshot()
            .into_iter()
            .find(|r| r.status == DeliveryStatus::Suppressed)
            .expect("suppressed record");
        assert_eq!(
            suppressed.suppressed_reason,
            Some(SuppressReason::UserPreference)
        );
    }

    #[tokio::test]
    async fn test_unknown_recipient_drops_event() {
        let (engine, store, channel) = build(test_config());
        let id = engine
            .submit(event(NotificationType::TaskAssigned, Priority::High, "t1"))
            .await
            .unwrap();
        assert!(id.is_none());
        assert_eq!(channel.send_calls.load(AtomicOrdering::SeqCst), 0);
        assert!(store.notifications_snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_three_transient_failures_go_terminal() {
        let (engine, store, channel) = build(test_config());
        store.put_recipient(RecipientProfile::new("U1", "ws1"));
        for _ in 0..3 {
            channel.push_send(Err(TaskPingError::Transient("503".into())));
        }

        let id = engine
            .submit(event(NotificationType::TaskAssigned, Priority::High, "t1"))
            .await
            .unwrap()
            .unwrap();
        settle().await;

        let record = store.load_notification(&id).await.unwrap().unwrap();
        assert_eq!(record.status, DeliveryStatus::Pending);
        assert_eq!(record.retry_count, 1);
        assert!(record.next_retry_at.unwrap() > Utc::now());

        // Two more sweeps, forcing the backoff window open each time.
        for expected in [2u32, 3u32] {
            let mut r = store.load_notification(&id).await.unwrap().unwrap();
            r.next_retry_at = Some(Utc::now() - Duration::seconds(1));
            store.save_notification(&r).await.unwrap();

            assert_eq!(engine.run_retry_sweep().await.unwrap(), 1);
            settle().await;

            let r = store.load_notification(&id).await.unwrap().unwrap();
            assert_eq!(r.retry_count, expected);
        }

        let record = store.load_notification(&id).await.unwrap().unwrap();
        assert_eq!(record.status, DeliveryStatus::Failed);
        assert!(record.next_retry_at.is_none());
        assert_eq!(channel.send_calls.load(AtomicOrdering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_rate_limit_parks_record_and_short_circuits() {
        let (engine, store, channel) = build(test_config());
        store.put_recipient(RecipientProfile::new("U1", "ws1"));
        channel.push_send(Err(TaskPingError::RateLimited {
            retry_after_ms: 50_000,
        }));

        let first = engine
            .submit(event(NotificationType::Mention, Priority::High, "m1"))
            .await
            .unwrap()
            .unwrap();
        settle().await;

        let record = store.load_notification(&first).await.unwrap().unwrap();
        assert_eq!(record.status, DeliveryStatus::RateLimited);
        let wait = record.next_retry_at.unwrap() - Utc::now();
        assert!(wait.num_milliseconds() > 40_000);
        assert_eq!(channel.send_calls.load(AtomicOrdering::SeqCst), 1);

        // The workspace window is open: the next delivery never reaches the
        // transport and parks the same way.
        let second = engine
            .submit(event(NotificationType::Mention, Priority::High, "m2"))
            .await
            .unwrap()
            .unwrap();
        settle().await;
        let record = store.load_notification(&second).await.unwrap().unwrap();
        assert_eq!(record.status, DeliveryStatus::RateLimited);
        assert_eq!(channel.send_calls.load(AtomicOrdering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_surface_refresh_coalesces() {
        let mut config = test_config();
        config.queues.surface_debounce_ms = 40;
        let (engine, store, channel) = build(config);
        store.put_recipient(RecipientProfile::new("U1", "ws1"));

        engine.request_surface_refresh("U1").await;
        engine.request_surface_refresh("U1").await;
        engine.request_surface_refresh("U1").await;
        settle().await;

        assert_eq!(channel.publish_calls.load(AtomicOrdering::SeqCst), 1);
        assert_eq!(channel.published.lock().unwrap()[0], "U1");
    }

    #[tokio::test]
    async fn test_digest_tick_delivers_nonempty_only() {
        let (engine, store, channel) = build(test_config());

        let mut with_work = RecipientProfile::new("U1", "ws1");
        with_work.prefs.digest_frequency = DigestFrequency::Daily;
        with_work.prefs.digest_hour = Utc::now().hour();
        store.put_recipient(with_work);
        store.put_digest_work(
            "U1",
            DigestWork {
                outstanding: vec![WorkItem {
                    id: "t1".into(),
                    title: "Task".into(),
                    priority: Priority::Medium,
                    due_at: None,
                    completed_at: None,
                }],
                ..Default::default()
            },
        );

        let mut idle = RecipientProfile::new("U2", "ws1");
        idle.prefs.digest_frequency = DigestFrequency::Daily;
        idle.prefs.digest_hour = Utc::now().hour();
        store.put_recipient(idle);

        let enqueued = engine.run_scheduled_digest(DigestPeriod::Daily).await.unwrap();
        assert_eq!(enqueued, 2);
        settle().await;

        // U2's digest was empty and skipped.
        assert_eq!(channel.send_calls.load(AtomicOrdering::SeqCst), 1);
        let digest = store
            .notifications_snapshot()
            .into_iter()
            .find(|r| r.notification_type == NotificationType::Digest)
            .expect("digest record");
        assert_eq!(digest.recipient_id, "U1");
        assert_eq!(digest.status, DeliveryStatus::Delivered);
    }

    #[tokio::test]
    async fn test_batch_sweep_respects_intervals() {
        let (engine, store, channel) = build(test_config());

        let mut ripe = RecipientProfile::new("U1", "ws1");
        ripe.prefs.batching_enabled = true;
        ripe.prefs.batch_interval_minutes = Some(1);
        ripe.pending_batch.push_back(BatchEntry {
            notification_type: NotificationType::CommentAdded,
            title: "c1".into(),
            message: "m".into(),
            entity_id: None,
            priority: Priority::Low,
            created_at: Utc::now(),
        });
        ripe.last_batch_flushed_at = Some(Utc::now() - Duration::minutes(2));
        store.put_recipient(ripe);

        let mut fresh = RecipientProfile::new("U2", "ws1");
        fresh.prefs.batching_enabled = true;
        fresh.pending_batch.push_back(BatchEntry {
            notification_type: NotificationType::CommentAdded,
            title: "c2".into(),
            message: "m".into(),
            entity_id: None,
            priority: Priority::Low,
            created_at: Utc::now(),
        });
        fresh.last_batch_flushed_at = Some(Utc::now() - Duration::minutes(2));
        // Workspace default of 5 minutes applies to U2; only U1's override
        // makes it ripe.
        store.put_workspace(WorkspaceConfig::new("ws1"));
        store.put_recipient(fresh);

        let enqueued = engine.run_scheduled_batch_sweep().await.unwrap();
        assert_eq!(enqueued, 1);
        settle().await;

        assert_eq!(channel.send_calls.load(AtomicOrdering::SeqCst), 1);
        let u1 = store.load_recipient("U1").await.unwrap().unwrap();
        assert!(u1.pending_batch.is_empty());
        let u2 = store.load_recipient("U2").await.unwrap().unwrap();
        assert_eq!(u2.pending_batch.len(), 1);
    }

    #[tokio::test]
    async fn test_interaction_recorded_and_counted() {
        let (engine, store, _channel) = build(test_config());
        store.put_recipient(RecipientProfile::new("U1", "ws1"));

        let id = engine
            .submit(event(NotificationType::TaskAssigned, Priority::High, "t1"))
            .await
            .unwrap()
            .unwrap();
        settle().await;

        engine
            .record_interaction(&id, "complete_task", "U1", "completed")
            .await
            .unwrap();

        let record = store.load_notification(&id).await.unwrap().unwrap();
        assert_eq!(record.interactions.len(), 1);
        assert_eq!(record.interactions[0].action_id, "complete_task");
        let recipient = store.load_recipient("U1").await.unwrap().unwrap();
        assert_eq!(recipient.interactions_seen, 1);

        let unknown = engine
            .record_interaction("nope", "a", "U1", "ok")
            .await;
        assert!(matches!(unknown, Err(TaskPingError::Validation(_))));
    }

    #[tokio::test]
    async fn test_analytics_failures_never_block_delivery() {
        let (engine, store, _channel) = build(test_config());
        store.put_recipient(RecipientProfile::new("U1", "ws1"));
        store.set_fail_analytics(true);

        let id = engine
            .submit(event(NotificationType::TaskAssigned, Priority::High, "t1"))
            .await
            .unwrap()
            .unwrap();
        settle().await;

        let record = store.load_notification(&id).await.unwrap().unwrap();
        assert_eq!(record.status, DeliveryStatus::Delivered);
        assert_eq!(store.analytics_count(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_drains_without_refilling() {
        let mut config = test_config();
        // Large debounce: jobs sit in the queue until shutdown drains them.
        config.queues.notification_debounce_ms = 10_000;
        let (engine, store, channel) = build(config);
        store.put_recipient(RecipientProfile::new("U1", "ws1"));

        engine
            .submit(event(NotificationType::TaskUpdated, Priority::Medium, "t1"))
            .await
            .unwrap();
        engine
            .submit(event(NotificationType::CommentAdded, Priority::Medium, "c1"))
            .await
            .unwrap();
        assert_eq!(channel.send_calls.load(AtomicOrdering::SeqCst), 0);

        engine.shutdown().await;

        assert_eq!(channel.send_calls.load(AtomicOrdering::SeqCst), 2);
        assert_eq!(engine.queues.total_waiting().await, 0);
        // Follow-up surface/analytics work was suppressed during the drain.
        assert_eq!(channel.publish_calls.load(AtomicOrdering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_submit_to_many_reports_per_recipient() {
        let (engine, store, _channel) = build(test_config());
        store.put_recipient(RecipientProfile::new("U1", "ws1"));
        store.put_recipient(RecipientProfile::new("U2", "ws1"));

        let ev = event(NotificationType::WorkspaceAnnouncement, Priority::Medium, "hi");
        let ids: Vec<String> = vec!["U1".into(), "U2".into(), "".into()];
        let report = engine.submit_to_many(&ids, &ev).await;
        settle().await;

        assert_eq!(report.successful, vec!["U1".to_string(), "U2".to_string()]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "");
    }
}
