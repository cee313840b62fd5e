//! Recipient eligibility filter — pure decision logic, no side effects.
//!
//! Given a recipient profile, workspace settings, and a notification's
//! type/priority, decides whether it delivers now, joins a batch, defers
//! past quiet hours, or is denied outright.

use chrono::{DateTime, Utc};
use taskping_core::config::EngineConfig;
use taskping_core::types::{
    NotificationType, Priority, RecipientProfile, SuppressReason, WorkspaceConfig,
};

/// Outcome of the eligibility check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Deliver on the next drain.
    AllowImmediate,
    /// Buffer into the recipient's pending batch.
    AllowBatch,
    /// Inside the recipient's quiet hours — hold until the window ends.
    DeferQuietHours,
    /// Do not deliver; record is suppressed with this reason.
    Deny(SuppressReason),
}

/// Evaluate a notification against a recipient's preferences.
///
/// Deny checks run first (cheapest rejection wins), then quiet hours, then
/// batching. Critical priority and `force_immediate` bypass both quiet hours
/// and batching; so do the configured always-immediate types.
pub fn evaluate(
    recipient: &RecipientProfile,
    workspace: &WorkspaceConfig,
    ty: NotificationType,
    priority: Priority,
    force_immediate: bool,
    config: &EngineConfig,
    now: DateTime<Utc>,
) -> Decision {
    if !workspace.notifications_enabled || workspace.delivery_disabled {
        return Decision::Deny(SuppressReason::WorkspaceDisabled);
    }
    if !recipient.prefs.enabled || !recipient.active {
        return Decision::Deny(SuppressReason::UserPreference);
    }
    if !recipient.prefs.type_enabled(ty) {
        return Decision::Deny(SuppressReason::UserPreference);
    }
    if !recipient.prefs.min_priority.allows(priority) {
        return Decision::Deny(SuppressReason::LowPriority);
    }

    let critical = priority == Priority::Critical;
    let always_immediate = config.is_always_immediate(ty);

    if !critical && !force_immediate {
        if let Some(quiet) = &recipient.prefs.quiet_hours {
            if quiet.contains(now) {
                return Decision::DeferQuietHours;
            }
        }
    }

    if recipient.prefs.batching_enabled && !critical && !always_immediate {
        return Decision::AllowBatch;
    }

    Decision::AllowImmediate
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveTime;
    use taskping_core::types::{PriorityFloor, QuietHours};

    fn recipient() -> RecipientProfile {
        RecipientProfile::new("U1", "ws1")
    }

    fn workspace() -> WorkspaceConfig {
        WorkspaceConfig::new("ws1")
    }

    fn eval(r: &RecipientProfile, w: &WorkspaceConfig, ty: NotificationType, p: Priority) -> Decision {
        evaluate(r, w, ty, p, false, &EngineConfig::default(), Utc::now())
    }

    #[test]
    fn test_deny_when_globally_disabled() {
        let mut r = recipient();
        r.prefs.enabled = false;
        for p in [Priority::Low, Priority::Critical] {
            assert_eq!(
                eval(&r, &workspace(), NotificationType::TaskAssigned, p),
                Decision::Deny(SuppressReason::UserPreference)
            );
        }
    }

    #[test]
    fn test_deny_when_workspace_disabled() {
        let mut w = workspace();
        w.notifications_enabled = false;
        assert_eq!(
            eval(&recipient(), &w, NotificationType::Mention, Priority::Critical),
            Decision::Deny(SuppressReason::WorkspaceDisabled)
        );
    }

    #[test]
    fn test_deny_inactive_recipient() {
        let mut r = recipient();
        r.deactivate();
        assert_eq!(
            eval(&r, &workspace(), NotificationType::TaskAssigned, Priority::High),
            Decision::Deny(SuppressReason::UserPreference)
        );
    }

    #[test]
    fn test_deny_type_toggle() {
        let mut r = recipient();
        r.prefs
            .type_toggles
            .insert(NotificationType::CommentAdded, false);
        assert_eq!(
            eval(&r, &workspace(), NotificationType::CommentAdded, Priority::High),
            Decision::Deny(SuppressReason::UserPreference)
        );
        // Other types unaffected.
        assert_eq!(
            eval(&r, &workspace(), NotificationType::CommentReply, Priority::High),
            Decision::AllowImmediate
        );
    }

    #[test]
    fn test_deny_below_priority_floor() {
        let mut r = recipient();
        r.prefs.min_priority = PriorityFloor::High;
        assert_eq!(
            eval(&r, &workspace(), NotificationType::TaskUpdated, Priority::Medium),
            Decision::Deny(SuppressReason::LowPriority)
        );
        assert_eq!(
            eval(&r, &workspace(), NotificationType::TaskUpdated, Priority::High),
            Decision::AllowImmediate
        );
    }

    fn overnight_quiet(r: &mut RecipientProfile) {
        r.prefs.quiet_hours = Some(QuietHours {
            start: NaiveTime::from_hms_opt(22, 0, 0).unwrap(),
            end: NaiveTime::from_hms_opt(8, 0, 0).unwrap(),
            timezone: chrono_tz::UTC,
        });
    }

    #[test]
    fn test_quiet_hours_defers_medium() {
        let mut r = recipient();
        overnight_quiet(&mut r);
        let late = Utc::now()
            .date_naive()
            .and_hms_opt(23, 30, 0)
            .unwrap()
            .and_utc();
        let d = evaluate(
            &r,
            &workspace(),
            NotificationType::CommentAdded,
            Priority::Medium,
            false,
            &EngineConfig::default(),
            late,
        );
        assert_eq!(d, Decision::DeferQuietHours);
    }

    #[test]
    fn test_quiet_hours_never_holds_critical_or_forced() {
        let mut r = recipient();
        overnight_quiet(&mut r);
        let late = Utc::now()
            .date_naive()
            .and_hms_opt(23, 30, 0)
            .unwrap()
            .and_utc();
        let cfg = EngineConfig::default();
        assert_eq!(
            evaluate(&r, &workspace(), NotificationType::TaskOverdue, Priority::Critical, false, &cfg, late),
            Decision::AllowImmediate
        );
        assert_eq!(
            evaluate(&r, &workspace(), NotificationType::TaskUpdated, Priority::Low, true, &cfg, late),
            Decision::AllowImmediate
        );
    }

    #[test]
    fn test_batching_routes_to_batch() {
        let mut r = recipient();
        r.prefs.batching_enabled = true;
        assert_eq!(
            eval(&r, &workspace(), NotificationType::TaskUpdated, Priority::Medium),
            Decision::AllowBatch
        );
    }

    #[test]
    fn test_always_immediate_types_skip_batching() {
        let mut r = recipient();
        r.prefs.batching_enabled = true;
        assert_eq!(
            eval(&r, &workspace(), NotificationType::TaskAssigned, Priority::Medium),
            Decision::AllowImmediate
        );
        assert_eq!(
            eval(&r, &workspace(), NotificationType::Mention, Priority::Low),
            Decision::AllowImmediate
        );
        // Critical never batches either.
        assert_eq!(
            eval(&r, &workspace(), NotificationType::TaskUpdated, Priority::Critical),
            Decision::AllowImmediate
        );
    }
}
