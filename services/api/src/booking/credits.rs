//! Booking without a new payment: applying a credit, or drawing from a package.

use booking_core::domain::{ClientPackageStatus, NewSession, PackageUse, Payment, Session};
use booking_core::ports::{NoticeKind, SideEffect};
use chrono::NaiveDate;
use tracing::info;
use uuid::Uuid;

use super::{AuthContext, BookingService};
use crate::error::BookingError;

impl BookingService {
    /// The caller's captured payments that are not attached to a session.
    pub async fn list_credits(&self, actor: &AuthContext) -> Result<Vec<Payment>, BookingError> {
        let client_id = actor.require_client()?;
        Ok(self.db.list_open_credits(client_id).await?)
    }

    /// Books a slot with a credit left over from a lost race.
    pub async fn apply_credit(
        &self,
        actor: &AuthContext,
        transaction_id: &str,
        psychologist_id: Uuid,
        date: NaiveDate,
        time: &str,
    ) -> Result<Session, BookingError> {
        let client_id = actor.require_client()?;
        let credit = self.payment_by_transaction(transaction_id).await?;
        if credit.client_id != client_id {
            return Err(BookingError::Forbidden(
                "This credit belongs to someone else".to_string(),
            ));
        }
        if !credit.is_open_credit() {
            return Err(BookingError::conflict("This credit has already been used"));
        }
        if credit.psychologist_id != psychologist_id {
            return Err(BookingError::Validation(
                "This credit can only be used with the psychologist it was paid for".to_string(),
            ));
        }
        self.check_bookable(client_id, psychologist_id, date, time).await?;

        let session = self
            .db
            .apply_credit(
                credit.id,
                NewSession {
                    psychologist_id,
                    client_id,
                    date,
                    time: time.to_string(),
                    price: credit.amount,
                    package: PackageUse::None,
                },
            )
            .await?;
        info!(
            transaction_id,
            session_id = %session.id,
            "Credit applied to {} {}", date, time
        );
        self.after_booking(&session).await;
        Ok(session)
    }

    /// Books the next session of a purchased bundle.
    pub async fn book_from_package(
        &self,
        actor: &AuthContext,
        client_package_id: Uuid,
        date: NaiveDate,
        time: &str,
    ) -> Result<Session, BookingError> {
        let client_id = actor.require_client()?;
        let bundle = self.db.get_client_package(client_package_id).await?;
        if bundle.client_id != client_id {
            return Err(BookingError::Forbidden(
                "This package belongs to someone else".to_string(),
            ));
        }
        if bundle.status == ClientPackageStatus::Exhausted || bundle.remaining() == 0 {
            return Err(BookingError::Validation(
                "There are no sessions left in this package".to_string(),
            ));
        }
        self.check_bookable(client_id, bundle.psychologist_id, date, time)
            .await?;

        let session = self
            .db
            .book_from_package(
                client_package_id,
                NewSession {
                    psychologist_id: bundle.psychologist_id,
                    client_id,
                    date,
                    time: time.to_string(),
                    price: 0,
                    package: PackageUse::None,
                },
            )
            .await?;
        info!(
            session_id = %session.id,
            "Package {} session {} of {} booked",
            client_package_id,
            bundle.sessions_used + 1,
            bundle.total_sessions
        );
        self.after_booking(&session).await;
        Ok(session)
    }

    /// Future, open, and not held by another client's checkout.
    async fn check_bookable(
        &self,
        client_id: Uuid,
        psychologist_id: Uuid,
        date: NaiveDate,
        time: &str,
    ) -> Result<(), BookingError> {
        let now = self.now();
        if self.slot_start(date, time)? <= now {
            return Err(BookingError::Validation(
                "This slot is in the past, please pick another".to_string(),
            ));
        }
        if !self.is_slot_available(psychologist_id, date, time).await? {
            return Err(BookingError::conflict(
                "This slot was just booked, please pick another",
            ));
        }
        self.ensure_not_held_by_other(client_id, psychologist_id, date, time)
            .await
    }

    async fn after_booking(&self, session: &Session) {
        self.enqueue(SideEffect::CalendarInvite {
            session_id: session.id,
        })
        .await;
        self.enqueue(SideEffect::SessionNotice {
            session_id: session.id,
            kind: NoticeKind::BookingConfirmed,
        })
        .await;
    }
}
