//! crates/booking_core/src/status.rs
//!
//! Maps internal slot-lock and payment states onto the small vocabulary that
//! polling clients understand.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::domain::{Payment, PaymentStatus, SlotLock, SlotLockStatus};

/// Status reported to a client polling a booking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientStatus {
    SlotHeld,
    PaymentPending,
    PaymentSuccess,
    Completed,
    Failed,
    Expired,
}

pub const CREDIT_MESSAGE: &str =
    "This slot was just booked by someone else. Your payment is saved as a credit you can use for another slot.";

impl ClientStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientStatus::SlotHeld => "SLOT_HELD",
            ClientStatus::PaymentPending => "PAYMENT_PENDING",
            ClientStatus::PaymentSuccess => "PAYMENT_SUCCESS",
            ClientStatus::Completed => "COMPLETED",
            ClientStatus::Failed => "FAILED",
            ClientStatus::Expired => "EXPIRED",
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            ClientStatus::SlotHeld => "Your slot is reserved. Complete the payment to confirm it.",
            ClientStatus::PaymentPending => "We are waiting for the payment confirmation.",
            ClientStatus::PaymentSuccess => "Payment received. Confirming your session.",
            ClientStatus::Completed => "Your session is booked.",
            ClientStatus::Failed => "The payment did not go through. The slot has been released.",
            ClientStatus::Expired => "The reservation expired before payment. Please pick a slot again.",
        }
    }

    /// Whether the client should keep polling.
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            ClientStatus::Completed | ClientStatus::Failed | ClientStatus::Expired
        )
    }
}

/// Status of a booking tracked by a slot lock.
pub fn from_lock(lock: &SlotLock, now: DateTime<Utc>) -> ClientStatus {
    match lock.status {
        SlotLockStatus::SlotHeld if lock.expires_at <= now => ClientStatus::Expired,
        SlotLockStatus::SlotHeld => ClientStatus::SlotHeld,
        SlotLockStatus::PaymentPending => ClientStatus::PaymentPending,
        SlotLockStatus::PaymentSuccess => ClientStatus::PaymentSuccess,
        SlotLockStatus::SessionCreated => ClientStatus::Completed,
        SlotLockStatus::Failed => ClientStatus::Failed,
        SlotLockStatus::Expired => ClientStatus::Expired,
    }
}

/// Status of a legacy booking that only has a payment row.
pub fn from_payment(payment: &Payment) -> ClientStatus {
    match payment.status {
        PaymentStatus::Pending => ClientStatus::PaymentPending,
        PaymentStatus::Success if payment.session_id.is_some() => ClientStatus::Completed,
        PaymentStatus::Success if payment.is_credit => ClientStatus::Failed,
        PaymentStatus::Success => ClientStatus::PaymentSuccess,
        PaymentStatus::Failed => ClientStatus::Failed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, NaiveDate};
    use uuid::Uuid;

    fn lock(status: SlotLockStatus, expires_in: Duration, now: DateTime<Utc>) -> SlotLock {
        SlotLock {
            id: Uuid::new_v4(),
            order_id: "ord_1".to_string(),
            psychologist_id: Uuid::new_v4(),
            client_id: Uuid::new_v4(),
            package_id: None,
            date: NaiveDate::from_ymd_opt(2026, 1, 5).unwrap(),
            time: "10:00".to_string(),
            amount: 150_000,
            status,
            session_id: None,
            expires_at: now + expires_in,
            created_at: now,
        }
    }

    #[test]
    fn overdue_hold_reads_as_expired() {
        let now = Utc::now();
        let held = lock(SlotLockStatus::SlotHeld, Duration::minutes(-1), now);
        assert_eq!(from_lock(&held, now), ClientStatus::Expired);
        let held = lock(SlotLockStatus::SlotHeld, Duration::minutes(5), now);
        assert_eq!(from_lock(&held, now), ClientStatus::SlotHeld);
    }

    #[test]
    fn session_created_reads_as_completed() {
        let now = Utc::now();
        let done = lock(SlotLockStatus::SessionCreated, Duration::zero(), now);
        assert_eq!(from_lock(&done, now), ClientStatus::Completed);
        assert!(ClientStatus::Completed.is_final());
        assert!(!ClientStatus::PaymentPending.is_final());
    }
}
