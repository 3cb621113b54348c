//! crates/booking_core/src/policy.rs
//!
//! Time-based rules for changing an existing session.

use chrono::{DateTime, Duration, Utc};

use crate::domain::{Session, SessionStatus};

/// What should happen with a reschedule request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RescheduleDecision {
    /// Move the session straight away.
    Direct,
    /// Record the request and wait for an admin.
    NeedsApproval,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PolicyViolation {
    #[error("Only booked sessions can be changed")]
    NotBooked,
    #[error("The session has already started")]
    AlreadyStarted,
    #[error("The new slot must be at least {0} minutes in the future")]
    TargetTooSoon(i64),
    #[error("The new slot is the same as the current one")]
    SameSlot,
    #[error("The session has not started yet")]
    NotStarted,
}

#[derive(Debug, Clone)]
pub struct ReschedulePolicy {
    /// Changes closer than this to the current start need approval.
    pub cutoff: Duration,
    /// Minimum distance between now and the new start.
    pub min_lead: Duration,
    /// When set, a session already moved this many times needs approval.
    pub approval_after: Option<i32>,
}

impl Default for ReschedulePolicy {
    fn default() -> Self {
        Self {
            cutoff: Duration::hours(24),
            min_lead: Duration::hours(1),
            approval_after: None,
        }
    }
}

impl ReschedulePolicy {
    pub fn decide(
        &self,
        session: &Session,
        now: DateTime<Utc>,
        current_start: DateTime<Utc>,
        target_start: DateTime<Utc>,
    ) -> Result<RescheduleDecision, PolicyViolation> {
        if session.status != SessionStatus::Booked {
            return Err(PolicyViolation::NotBooked);
        }
        if current_start <= now {
            return Err(PolicyViolation::AlreadyStarted);
        }
        if target_start == current_start {
            return Err(PolicyViolation::SameSlot);
        }
        if target_start - now < self.min_lead {
            return Err(PolicyViolation::TargetTooSoon(self.min_lead.num_minutes()));
        }
        if current_start - now < self.cutoff {
            return Ok(RescheduleDecision::NeedsApproval);
        }
        if let Some(limit) = self.approval_after {
            if session.reschedule_count >= limit {
                return Ok(RescheduleDecision::NeedsApproval);
            }
        }
        Ok(RescheduleDecision::Direct)
    }
}

/// Cancellation is allowed for booked sessions that have not started.
pub fn check_cancel(
    session: &Session,
    now: DateTime<Utc>,
    start: DateTime<Utc>,
) -> Result<(), PolicyViolation> {
    if session.status != SessionStatus::Booked {
        return Err(PolicyViolation::NotBooked);
    }
    if start <= now {
        return Err(PolicyViolation::AlreadyStarted);
    }
    Ok(())
}

/// A session can be marked completed once it has started.
pub fn check_complete(
    session: &Session,
    now: DateTime<Utc>,
    start: DateTime<Utc>,
) -> Result<(), PolicyViolation> {
    if session.status != SessionStatus::Booked {
        return Err(PolicyViolation::NotBooked);
    }
    if start > now {
        return Err(PolicyViolation::NotStarted);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use rstest::rstest;
    use uuid::Uuid;

    fn session(status: SessionStatus, reschedule_count: i32) -> Session {
        Session {
            id: Uuid::new_v4(),
            psychologist_id: Uuid::new_v4(),
            client_id: Uuid::new_v4(),
            date: NaiveDate::from_ymd_opt(2026, 4, 1).unwrap(),
            time: "10:00".to_string(),
            status,
            package_id: None,
            client_package_id: None,
            payment_id: None,
            price: 100_000,
            meet_link: None,
            calendar_event_id: None,
            calendar_event_link: None,
            reschedule_count,
            requested_date: None,
            requested_time: None,
            created_at: Utc::now(),
        }
    }

    #[rstest]
    #[case(Duration::hours(23), RescheduleDecision::NeedsApproval)]
    #[case(Duration::minutes(90), RescheduleDecision::NeedsApproval)]
    #[case(Duration::hours(25), RescheduleDecision::Direct)]
    #[case(Duration::days(7), RescheduleDecision::Direct)]
    fn cutoff_decides_between_direct_and_approval(
        #[case] until_current: Duration,
        #[case] expected: RescheduleDecision,
    ) {
        let now = Utc::now();
        let decision = ReschedulePolicy::default()
            .decide(
                &session(SessionStatus::Booked, 0),
                now,
                now + until_current,
                now + Duration::days(3),
            )
            .unwrap();
        assert_eq!(decision, expected);
    }

    #[test]
    fn target_must_leave_minimum_lead() {
        let now = Utc::now();
        let result = ReschedulePolicy::default().decide(
            &session(SessionStatus::Booked, 0),
            now,
            now + Duration::days(2),
            now + Duration::minutes(30),
        );
        assert_eq!(result, Err(PolicyViolation::TargetTooSoon(60)));
    }

    #[test]
    fn approval_after_limit_is_opt_in() {
        let now = Utc::now();
        let policy = ReschedulePolicy {
            approval_after: Some(1),
            ..ReschedulePolicy::default()
        };
        let moved_once = session(SessionStatus::Booked, 1);
        let decision = policy
            .decide(&moved_once, now, now + Duration::days(2), now + Duration::days(3))
            .unwrap();
        assert_eq!(decision, RescheduleDecision::NeedsApproval);

        let decision = ReschedulePolicy::default()
            .decide(&moved_once, now, now + Duration::days(2), now + Duration::days(3))
            .unwrap();
        assert_eq!(decision, RescheduleDecision::Direct);
    }

    #[test]
    fn cancel_requires_booked_future_session() {
        let now = Utc::now();
        assert!(check_cancel(&session(SessionStatus::Booked, 0), now, now + Duration::hours(1)).is_ok());
        assert_eq!(
            check_cancel(&session(SessionStatus::Booked, 0), now, now - Duration::minutes(1)),
            Err(PolicyViolation::AlreadyStarted)
        );
        assert_eq!(
            check_cancel(&session(SessionStatus::Completed, 0), now, now + Duration::hours(1)),
            Err(PolicyViolation::NotBooked)
        );
    }

    #[test]
    fn complete_requires_started_session() {
        let now = Utc::now();
        assert!(check_complete(&session(SessionStatus::Booked, 0), now, now - Duration::minutes(5)).is_ok());
        assert_eq!(
            check_complete(&session(SessionStatus::Booked, 0), now, now + Duration::hours(2)),
            Err(PolicyViolation::NotStarted)
        );
    }
}
