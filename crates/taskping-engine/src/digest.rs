//! Digest aggregator — periodic, time-windowed summaries of a recipient's
//! outstanding and recently-completed work. Driven by scheduler ticks, never
//! by domain events.

use chrono::{DateTime, Utc};

use taskping_core::types::{DigestPeriod, DigestWork, RecipientProfile};

/// Builds the composite render context for one recipient's digest.
///
/// Emits at most one digest per recipient per tick; the caller contract is
/// single invocation per period (the engine does not dedupe within a tick).
pub struct DigestAggregator;

impl DigestAggregator {
    /// Build the digest context, or `None` when there is nothing to report
    /// (an empty digest is never sent).
    pub fn build(
        recipient: &RecipientProfile,
        period: DigestPeriod,
        work: &DigestWork,
        now: DateTime<Utc>,
    ) -> Option<serde_json::Value> {
        if work.is_empty() {
            return None;
        }

        let overdue: Vec<serde_json::Value> = work
            .overdue
            .iter()
            .map(|item| {
                // Elapsed-overdue duration, computed here so the renderer
                // stays presentation-only.
                let overdue_hours = item
                    .due_at
                    .map(|due| (now - due).num_hours().max(0))
                    .unwrap_or(0);
                serde_json::json!({
                    "id": item.id,
                    "title": item.title,
                    "priority": item.priority,
                    "due_at": item.due_at,
                    "overdue_hours": overdue_hours,
                })
            })
            .collect();

        let plain = |items: &[taskping_core::types::WorkItem]| -> Vec<serde_json::Value> {
            items
                .iter()
                .map(|item| {
                    serde_json::json!({
                        "id": item.id,
                        "title": item.title,
                        "priority": item.priority,
                        "due_at": item.due_at,
                        "completed_at": item.completed_at,
                    })
                })
                .collect()
        };

        Some(serde_json::json!({
            "recipient_id": recipient.id,
            "period": period,
            "generated_at": now,
            "lookback_hours": period.lookback().num_hours(),
            "outstanding": plain(&work.outstanding),
            "overdue": overdue,
            "due_soon": plain(&work.due_soon),
            "completed": plain(&work.completed),
            "counts": {
                "outstanding": work.outstanding.len(),
                "overdue": work.overdue.len(),
                "due_soon": work.due_soon.len(),
                "completed": work.completed.len(),
            },
        }))
    }
}
