//! Changes to booked sessions: reschedule (direct or via approval), cancel, complete.

use booking_core::domain::{Session, SessionStatus};
use booking_core::policy::{self, RescheduleDecision};
use booking_core::ports::{NoticeKind, PortError, SideEffect};
use chrono::NaiveDate;
use tracing::info;
use uuid::Uuid;

use super::{AuthContext, BookingService};
use crate::error::BookingError;

#[derive(Debug, Clone)]
pub enum RescheduleOutcome {
    /// The session now sits on the new slot.
    Moved(Session),
    /// Too close to the session; the request waits for an admin.
    Requested(Session),
}

fn slot_taken(e: PortError) -> BookingError {
    match e {
        PortError::Conflict(_) => {
            BookingError::conflict("The new slot was just booked, please pick another")
        }
        other => other.into(),
    }
}

impl BookingService {
    /// The caller's sessions, newest first.
    pub async fn list_sessions(&self, actor: &AuthContext) -> Result<Vec<Session>, BookingError> {
        let client_id = actor.require_client()?;
        Ok(self.db.list_sessions_for_client(client_id).await?)
    }

    pub async fn reschedule(
        &self,
        actor: &AuthContext,
        session_id: Uuid,
        date: NaiveDate,
        time: &str,
    ) -> Result<RescheduleOutcome, BookingError> {
        let session = self.session_for(actor, session_id).await?;
        let now = self.now();
        let current_start = self.slot_start(session.date, &session.time)?;
        let target_start = self.slot_start(date, time)?;

        let decision = self
            .settings
            .policy
            .decide(&session, now, current_start, target_start)?;
        if !self.is_slot_available(session.psychologist_id, date, time).await? {
            return Err(BookingError::conflict(
                "The new slot is not available, please pick another",
            ));
        }
        self.ensure_not_held_by_other(session.client_id, session.psychologist_id, date, time)
            .await?;

        match decision {
            RescheduleDecision::Direct => {
                let moved = self
                    .db
                    .move_session(session_id, date, time)
                    .await
                    .map_err(slot_taken)?;
                info!(
                    session_id = %session_id,
                    "Rescheduled from {} {} to {} {}", session.date, session.time, date, time
                );
                self.after_move(&moved).await;
                Ok(RescheduleOutcome::Moved(moved))
            }
            RescheduleDecision::NeedsApproval => {
                let requested = self.db.request_reschedule(session_id, date, time).await?;
                info!(
                    session_id = %session_id,
                    "Reschedule to {} {} needs approval", date, time
                );
                self.enqueue(SideEffect::SessionNotice {
                    session_id,
                    kind: NoticeKind::RescheduleRequested,
                })
                .await;
                Ok(RescheduleOutcome::Requested(requested))
            }
        }
    }

    /// Applies a pending reschedule request.
    pub async fn approve_reschedule(
        &self,
        actor: &AuthContext,
        session_id: Uuid,
    ) -> Result<Session, BookingError> {
        actor.require_admin()?;
        let session = self.session_for(actor, session_id).await?;
        let (Some(date), Some(time)) = (session.requested_date, session.requested_time.clone())
        else {
            return Err(BookingError::Validation(
                "This session has no pending reschedule request".to_string(),
            ));
        };
        if session.status != SessionStatus::RescheduleRequested {
            return Err(BookingError::Validation(
                "This session has no pending reschedule request".to_string(),
            ));
        }
        if self.slot_start(date, &time)? <= self.now() {
            return Err(BookingError::Validation(
                "The requested slot is already in the past".to_string(),
            ));
        }
        if !self.is_slot_available(session.psychologist_id, date, &time).await? {
            return Err(BookingError::conflict(
                "The requested slot is no longer available",
            ));
        }
        self.ensure_not_held_by_other(session.client_id, session.psychologist_id, date, &time)
            .await?;

        let moved = self
            .db
            .move_session(session_id, date, &time)
            .await
            .map_err(slot_taken)?;
        info!(session_id = %session_id, "Approved reschedule to {} {}", date, time);
        self.after_move(&moved).await;
        Ok(moved)
    }

    /// Drops a pending request; the session keeps its original slot.
    pub async fn reject_reschedule(
        &self,
        actor: &AuthContext,
        session_id: Uuid,
    ) -> Result<Session, BookingError> {
        actor.require_admin()?;
        let session = self.session_for(actor, session_id).await?;
        if session.status != SessionStatus::RescheduleRequested {
            return Err(BookingError::Validation(
                "This session has no pending reschedule request".to_string(),
            ));
        }
        let restored = self
            .db
            .set_session_status(session_id, SessionStatus::Booked)
            .await?;
        self.enqueue(SideEffect::SessionNotice {
            session_id,
            kind: NoticeKind::RescheduleRejected,
        })
        .await;
        Ok(restored)
    }

    /// Cancels a future booked session and gives its slot back.
    pub async fn cancel(&self, actor: &AuthContext, session_id: Uuid) -> Result<Session, BookingError> {
        let session = self.session_for(actor, session_id).await?;
        let start = self.slot_start(session.date, &session.time)?;
        policy::check_cancel(&session, self.now(), start)?;

        let cancelled = self.db.cancel_session(session_id).await?;
        info!(session_id = %session_id, "Cancelled; {} {} released", cancelled.date, cancelled.time);
        self.enqueue(SideEffect::SessionNotice {
            session_id,
            kind: NoticeKind::Cancelled,
        })
        .await;
        Ok(cancelled)
    }

    /// Marks a started session as held.
    pub async fn complete(&self, actor: &AuthContext, session_id: Uuid) -> Result<Session, BookingError> {
        let session = self.session_for(actor, session_id).await?;
        actor.require_manages(session.psychologist_id)?;
        let start = self.slot_start(session.date, &session.time)?;
        policy::check_complete(&session, self.now(), start)?;
        Ok(self
            .db
            .set_session_status(session_id, SessionStatus::Completed)
            .await?)
    }

    /// A moved session needs a fresh invite; the old event cannot be edited.
    async fn after_move(&self, session: &Session) {
        self.enqueue(SideEffect::CalendarInvite {
            session_id: session.id,
        })
        .await;
        self.enqueue(SideEffect::SessionNotice {
            session_id: session.id,
            kind: NoticeKind::Rescheduled,
        })
        .await;
    }
}
