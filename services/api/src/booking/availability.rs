//! Slot listing and the admin-side availability mutations.

use booking_core::domain::{Availability, Psychologist};
use booking_core::slots::{self, BusyInterval};
use chrono::{Duration, NaiveDate};
use tracing::{info, warn};
use uuid::Uuid;

use super::{AuthContext, BookingService};
use crate::error::BookingError;

impl BookingService {
    /// The slot is in the day's list and no active session holds it.
    pub async fn is_slot_available(
        &self,
        psychologist_id: Uuid,
        date: NaiveDate,
        time: &str,
    ) -> Result<bool, BookingError> {
        let listed = self
            .db
            .get_availability(psychologist_id, date)
            .await?
            .is_some_and(|a| a.slots.iter().any(|s| s == time));
        if !listed {
            return Ok(false);
        }
        // The list and the session table are written separately; check both.
        let taken = self
            .db
            .find_active_session(psychologist_id, date, time)
            .await?
            .is_some();
        Ok(!taken)
    }

    /// Open slots for a day, minus anything the external calendar marks busy.
    pub async fn available_slots(
        &self,
        psychologist_id: Uuid,
        date: NaiveDate,
    ) -> Result<Availability, BookingError> {
        let psychologist = self.db.get_psychologist(psychologist_id).await?;
        let open = self
            .db
            .get_availability(psychologist_id, date)
            .await?
            .map(|a| a.slots)
            .unwrap_or_default();

        let slots = match self.busy_for_day(&psychologist, date).await {
            Ok(Some(busy)) => self.settings.busy_filter.free_slots(date, &open, &busy),
            Ok(None) => open,
            Err(e) => {
                warn!(
                    psychologist_id = %psychologist_id,
                    "Calendar lookup failed, returning unfiltered slots: {}", e
                );
                open
            }
        };

        Ok(Availability {
            psychologist_id,
            date,
            slots,
        })
    }

    /// Replaces a day's list. Slots held by an active session are left out.
    pub async fn set_availability(
        &self,
        actor: &AuthContext,
        psychologist_id: Uuid,
        date: NaiveDate,
        raw_slots: &[String],
    ) -> Result<Availability, BookingError> {
        actor.require_manages(psychologist_id)?;
        self.db.get_psychologist(psychologist_id).await?;
        let normalized = slots::normalize_slots(raw_slots)
            .map_err(|bad| BookingError::Validation(format!("Invalid slot time '{}'", bad)))?;

        let mut free = Vec::with_capacity(normalized.len());
        for slot in normalized {
            match self.db.find_active_session(psychologist_id, date, &slot).await? {
                Some(session) => info!(
                    session_id = %session.id,
                    "Dropping {} {} from availability, already booked", date, slot
                ),
                None => free.push(slot),
            }
        }

        Ok(self.db.set_availability(psychologist_id, date, free).await?)
    }

    /// Persists the external-calendar subtraction for one day.
    pub async fn sync_calendar(
        &self,
        actor: &AuthContext,
        psychologist_id: Uuid,
        date: NaiveDate,
    ) -> Result<Availability, BookingError> {
        actor.require_manages(psychologist_id)?;
        let psychologist = self.db.get_psychologist(psychologist_id).await?;
        let busy = self
            .busy_for_day(&psychologist, date)
            .await
            .map_err(|e| BookingError::Upstream(format!("Calendar sync failed: {}", e)))?
            .ok_or_else(|| {
                BookingError::Validation("No external calendar is linked".to_string())
            })?;

        let current = self
            .db
            .get_availability(psychologist_id, date)
            .await?
            .map(|a| a.slots)
            .unwrap_or_default();
        let free = self.settings.busy_filter.free_slots(date, &current, &busy);
        info!(
            psychologist_id = %psychologist_id,
            "Calendar sync for {} removed {} slot(s)", date, current.len() - free.len()
        );
        Ok(self.db.set_availability(psychologist_id, date, free).await?)
    }

    /// Busy periods over the local day, or `None` when no calendar is linked.
    async fn busy_for_day(
        &self,
        psychologist: &Psychologist,
        date: NaiveDate,
    ) -> Result<Option<Vec<BusyInterval>>, booking_core::ports::PortError> {
        let Some(credentials) = psychologist.calendar_credentials.as_deref() else {
            return Ok(None);
        };
        let Some(from) = slots::slot_start_utc(date, "00:00", self.settings.offset) else {
            return Ok(None);
        };
        let to = from + Duration::days(1);
        self.calendar.list_busy(credentials, from, to).await.map(Some)
    }
}
