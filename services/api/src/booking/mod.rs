//! services/api/src/booking/mod.rs
//!
//! The booking application service. It orchestrates the core ports to implement
//! availability, reservation, payment reconciliation, session changes, credits and
//! packages. Side effects are handed to the outbox only after the primary write
//! has been committed.

mod availability;
mod credits;
mod reconcile;
mod reservation;
mod sessions;

pub use reconcile::{BookingStatusView, PaymentOutcome, SessionSummary};
pub use reservation::{Quote, ReserveRequest};
pub use sessions::RescheduleOutcome;

use booking_core::domain::{Role, Session};
use booking_core::policy::ReschedulePolicy;
use booking_core::ports::{
    CalendarService, Clock, DatabaseService, Outbox, PaymentGateway, PortError, SideEffect,
};
use booking_core::slots::{self, BusyFilter};
use chrono::{DateTime, Duration, FixedOffset, NaiveDate, Utc};
use std::sync::Arc;
use tracing::error;
use uuid::Uuid;

use crate::config::Config;
use crate::error::BookingError;

pub const CURRENCY: &str = "INR";

//=========================================================================================
// Authenticated Context
//=========================================================================================

/// Who is calling, resolved once by the auth middleware.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub user_id: Uuid,
    pub email: String,
    pub role: Role,
    pub client_id: Option<Uuid>,
    pub psychologist_id: Option<Uuid>,
}

impl AuthContext {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    /// The caller's client record, required for booking operations.
    pub fn require_client(&self) -> Result<Uuid, BookingError> {
        self.client_id.ok_or_else(|| {
            BookingError::Forbidden("This action needs a client profile".to_string())
        })
    }

    pub fn require_admin(&self) -> Result<(), BookingError> {
        if self.is_admin() {
            Ok(())
        } else {
            Err(BookingError::Forbidden("Admin access required".to_string()))
        }
    }

    /// Admins, or the psychologist themself.
    pub fn require_manages(&self, psychologist_id: Uuid) -> Result<(), BookingError> {
        if self.is_admin() || self.psychologist_id == Some(psychologist_id) {
            Ok(())
        } else {
            Err(BookingError::Forbidden(
                "Only the psychologist or an admin can change this calendar".to_string(),
            ))
        }
    }
}

//=========================================================================================
// Settings
//=========================================================================================

/// The booking rules taken from configuration.
#[derive(Debug, Clone)]
pub struct BookingSettings {
    pub offset: FixedOffset,
    pub session_length: Duration,
    pub slot_hold: Duration,
    pub reconcile_grace: Duration,
    pub platform_event_prefix: String,
    pub busy_filter: BusyFilter,
    pub policy: ReschedulePolicy,
}

impl BookingSettings {
    pub fn from_config(config: &Config) -> Self {
        let session_length = Duration::minutes(config.session_minutes);
        Self {
            offset: config.slot_offset,
            session_length,
            slot_hold: Duration::minutes(config.slot_hold_minutes),
            reconcile_grace: Duration::seconds(config.reconcile_grace_secs),
            platform_event_prefix: config.platform_event_prefix.clone(),
            busy_filter: BusyFilter {
                platform_prefix: config.platform_event_prefix.clone(),
                holiday_keywords: config.holiday_keywords.clone(),
                offset: config.slot_offset,
                slot_length: session_length,
            },
            policy: ReschedulePolicy {
                cutoff: Duration::hours(config.reschedule_cutoff_hours),
                approval_after: config.reschedule_approval_after,
                ..ReschedulePolicy::default()
            },
        }
    }
}

//=========================================================================================
// The Service
//=========================================================================================

#[derive(Clone)]
pub struct BookingService {
    db: Arc<dyn DatabaseService>,
    gateway: Arc<dyn PaymentGateway>,
    calendar: Arc<dyn CalendarService>,
    outbox: Arc<dyn Outbox>,
    clock: Arc<dyn Clock>,
    settings: BookingSettings,
}

impl BookingService {
    pub fn new(
        db: Arc<dyn DatabaseService>,
        gateway: Arc<dyn PaymentGateway>,
        calendar: Arc<dyn CalendarService>,
        outbox: Arc<dyn Outbox>,
        clock: Arc<dyn Clock>,
        settings: BookingSettings,
    ) -> Self {
        Self {
            db,
            gateway,
            calendar,
            outbox,
            clock,
            settings,
        }
    }

    pub fn settings(&self) -> &BookingSettings {
        &self.settings
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Start of a slot in UTC, or a validation error for malformed input.
    fn slot_start(&self, date: NaiveDate, time: &str) -> Result<DateTime<Utc>, BookingError> {
        slots::slot_start_utc(date, time, self.settings.offset)
            .ok_or_else(|| BookingError::Validation(format!("Invalid slot {} {}", date, time)))
    }

    /// Queues a side effect. Failures are logged; the primary write already happened.
    async fn enqueue(&self, effect: SideEffect) {
        if let Err(e) = self.outbox.enqueue(effect.clone()).await {
            error!("Failed to enqueue side effect {:?}: {:?}", effect, e);
        }
    }

    /// Rejects a slot another client is paying for right now.
    async fn ensure_not_held_by_other(
        &self,
        client_id: Uuid,
        psychologist_id: Uuid,
        date: NaiveDate,
        time: &str,
    ) -> Result<(), BookingError> {
        let held_by_other = self
            .db
            .find_live_locks(psychologist_id, date, time, self.now())
            .await?
            .iter()
            .any(|l| l.client_id != client_id);
        if held_by_other {
            return Err(BookingError::conflict(
                "Someone is paying for this slot right now, please pick another",
            ));
        }
        Ok(())
    }

    /// Loads a session the caller is allowed to act on.
    async fn session_for(&self, actor: &AuthContext, session_id: Uuid) -> Result<Session, BookingError> {
        let session = self.db.get_session(session_id).await.map_err(|e| match e {
            PortError::NotFound(_) => BookingError::NotFound(format!("Session {} not found", session_id)),
            other => other.into(),
        })?;
        let owns = actor.client_id == Some(session.client_id)
            || actor.psychologist_id == Some(session.psychologist_id);
        if !owns && !actor.is_admin() {
            return Err(BookingError::Forbidden(
                "This session belongs to someone else".to_string(),
            ));
        }
        Ok(session)
    }
}

/// Parses the `YYYY-MM-DD` / `HH:MM` pair sent by clients.
pub fn parse_slot(date: &str, time: &str) -> Result<(NaiveDate, String), BookingError> {
    let date = slots::parse_date(date)
        .ok_or_else(|| BookingError::Validation(format!("Invalid date '{}', expected YYYY-MM-DD", date)))?;
    let time = slots::normalize_time(time)
        .ok_or_else(|| BookingError::Validation(format!("Invalid time '{}', expected HH:MM", time)))?;
    Ok((date, time))
}
