//! crates/booking_core/src/domain.rs
//!
//! Defines the pure, core data structures for the booking platform.
//! These structs are independent of any database or serialization format,
//! apart from the string forms of the status enums which are shared with storage.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

//=========================================================================================
// Identities
//=========================================================================================

/// Role attached to a platform user account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Client,
    Psychologist,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Client => "client",
            Role::Psychologist => "psychologist",
            Role::Admin => "admin",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "client" => Some(Role::Client),
            "psychologist" => Some(Role::Psychologist),
            "admin" => Some(Role::Admin),
            _ => None,
        }
    }
}

/// A platform user account.
#[derive(Debug, Clone)]
pub struct User {
    pub user_id: Uuid,
    pub email: String,
    pub role: Role,
}

// Only used internally for login/signup - contains sensitive data
#[derive(Debug, Clone)]
pub struct UserCredentials {
    pub user_id: Uuid,
    pub email: String,
    pub hashed_password: String,
    pub role: Role,
}

// Represents a browser login session (auth cookie)
#[derive(Debug, Clone)]
pub struct AuthSession {
    pub id: String,
    pub user_id: Uuid,
    pub expires_at: DateTime<Utc>,
}

/// A therapy provider.
#[derive(Debug, Clone)]
pub struct Psychologist {
    pub id: Uuid,
    pub user_id: Option<Uuid>,
    pub name: String,
    pub email: String,
    /// Opaque token blob for the linked external calendar.
    pub calendar_credentials: Option<String>,
    /// Price of a single session in minor currency units. `None` means not configured.
    pub individual_price: Option<i64>,
}

/// A customer, optionally linked to a platform user account.
#[derive(Debug, Clone)]
pub struct Client {
    pub id: Uuid,
    pub user_id: Option<Uuid>,
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewClient {
    pub user_id: Option<Uuid>,
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
}

//=========================================================================================
// Availability
//=========================================================================================

/// The open slots of one psychologist on one date, ordered by time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Availability {
    pub psychologist_id: Uuid,
    pub date: NaiveDate,
    pub slots: Vec<String>,
}

//=========================================================================================
// Sessions
//=========================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Booked,
    RescheduleRequested,
    Completed,
    Cancelled,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Booked => "booked",
            SessionStatus::RescheduleRequested => "reschedule_requested",
            SessionStatus::Completed => "completed",
            SessionStatus::Cancelled => "cancelled",
        }
    }

    /// Accepts both spellings of the cancelled state found in stored rows.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "booked" => Some(SessionStatus::Booked),
            "reschedule_requested" => Some(SessionStatus::RescheduleRequested),
            "completed" => Some(SessionStatus::Completed),
            "cancelled" | "canceled" => Some(SessionStatus::Cancelled),
            _ => None,
        }
    }

    /// Statuses that keep the slot occupied.
    pub fn holds_slot(&self) -> bool {
        matches!(
            self,
            SessionStatus::Booked | SessionStatus::RescheduleRequested
        )
    }
}

/// One booked appointment.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: Uuid,
    pub psychologist_id: Uuid,
    pub client_id: Uuid,
    pub date: NaiveDate,
    pub time: String,
    pub status: SessionStatus,
    pub package_id: Option<Uuid>,
    pub client_package_id: Option<Uuid>,
    pub payment_id: Option<Uuid>,
    pub price: i64,
    pub meet_link: Option<String>,
    pub calendar_event_id: Option<String>,
    pub calendar_event_link: Option<String>,
    pub reschedule_count: i32,
    pub requested_date: Option<NaiveDate>,
    pub requested_time: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// How a new session relates to a package bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PackageUse {
    None,
    /// First session of a freshly purchased bundle; opens a `ClientPackage`.
    Open { package_id: Uuid, total_sessions: i32 },
}

#[derive(Debug, Clone)]
pub struct NewSession {
    pub psychologist_id: Uuid,
    pub client_id: Uuid,
    pub date: NaiveDate,
    pub time: String,
    pub price: i64,
    pub package: PackageUse,
}

//=========================================================================================
// Payments & Slot Locks
//=========================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Success,
    Failed,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Success => "success",
            PaymentStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(PaymentStatus::Pending),
            "success" => Some(PaymentStatus::Success),
            "failed" => Some(PaymentStatus::Failed),
            _ => None,
        }
    }
}

/// One payment attempt against the gateway.
#[derive(Debug, Clone)]
pub struct Payment {
    pub id: Uuid,
    pub transaction_id: String,
    pub gateway_payment_id: Option<String>,
    pub psychologist_id: Uuid,
    pub client_id: Uuid,
    pub package_id: Option<Uuid>,
    pub date: NaiveDate,
    pub time: String,
    pub amount: i64,
    pub status: PaymentStatus,
    pub session_id: Option<Uuid>,
    pub is_credit: bool,
    pub credit_consumed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Payment {
    /// A captured payment that is not attached to any session yet.
    pub fn is_open_credit(&self) -> bool {
        self.status == PaymentStatus::Success
            && self.is_credit
            && self.session_id.is_none()
            && self.credit_consumed_at.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct NewPayment {
    pub transaction_id: String,
    pub psychologist_id: Uuid,
    pub client_id: Uuid,
    pub package_id: Option<Uuid>,
    pub date: NaiveDate,
    pub time: String,
    pub amount: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SlotLockStatus {
    SlotHeld,
    PaymentPending,
    PaymentSuccess,
    SessionCreated,
    Failed,
    Expired,
}

impl SlotLockStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SlotLockStatus::SlotHeld => "SLOT_HELD",
            SlotLockStatus::PaymentPending => "PAYMENT_PENDING",
            SlotLockStatus::PaymentSuccess => "PAYMENT_SUCCESS",
            SlotLockStatus::SessionCreated => "SESSION_CREATED",
            SlotLockStatus::Failed => "FAILED",
            SlotLockStatus::Expired => "EXPIRED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "SLOT_HELD" => Some(SlotLockStatus::SlotHeld),
            "PAYMENT_PENDING" => Some(SlotLockStatus::PaymentPending),
            "PAYMENT_SUCCESS" => Some(SlotLockStatus::PaymentSuccess),
            "SESSION_CREATED" => Some(SlotLockStatus::SessionCreated),
            "FAILED" => Some(SlotLockStatus::Failed),
            "EXPIRED" => Some(SlotLockStatus::Expired),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SlotLockStatus::SessionCreated | SlotLockStatus::Failed | SlotLockStatus::Expired
        )
    }

    /// Whether the lock may move from `self` to `next`.
    pub fn can_transition_to(&self, next: SlotLockStatus) -> bool {
        use SlotLockStatus::*;
        matches!(
            (self, next),
            (SlotHeld, PaymentPending)
                | (SlotHeld, Expired)
                | (PaymentPending, PaymentSuccess)
                | (PaymentPending, Failed)
                | (PaymentSuccess, SessionCreated)
                | (PaymentSuccess, Failed)
        )
    }
}

/// A short-lived reservation keyed by the gateway order id.
#[derive(Debug, Clone)]
pub struct SlotLock {
    pub id: Uuid,
    pub order_id: String,
    pub psychologist_id: Uuid,
    pub client_id: Uuid,
    pub package_id: Option<Uuid>,
    pub date: NaiveDate,
    pub time: String,
    pub amount: i64,
    pub status: SlotLockStatus,
    pub session_id: Option<Uuid>,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl SlotLock {
    /// A lock that still keeps other clients away from the slot. An abandoned
    /// checkout stops blocking at `expires_at`; a late capture then becomes a credit.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            SlotLockStatus::SlotHeld | SlotLockStatus::PaymentPending => self.expires_at > now,
            SlotLockStatus::PaymentSuccess => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewSlotLock {
    pub order_id: String,
    pub psychologist_id: Uuid,
    pub client_id: Uuid,
    pub package_id: Option<Uuid>,
    pub date: NaiveDate,
    pub time: String,
    pub amount: i64,
    pub expires_at: DateTime<Utc>,
}

//=========================================================================================
// Packages
//=========================================================================================

/// A bundle offered by a psychologist.
#[derive(Debug, Clone)]
pub struct Package {
    pub id: Uuid,
    pub psychologist_id: Uuid,
    pub name: String,
    pub session_count: i32,
    pub price: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientPackageStatus {
    Active,
    Exhausted,
}

impl ClientPackageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientPackageStatus::Active => "active",
            ClientPackageStatus::Exhausted => "exhausted",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(ClientPackageStatus::Active),
            "exhausted" => Some(ClientPackageStatus::Exhausted),
            _ => None,
        }
    }

    pub fn for_usage(used: i32, total: i32) -> Self {
        if used >= total {
            ClientPackageStatus::Exhausted
        } else {
            ClientPackageStatus::Active
        }
    }
}

/// A client's purchased bundle.
#[derive(Debug, Clone)]
pub struct ClientPackage {
    pub id: Uuid,
    pub client_id: Uuid,
    pub package_id: Uuid,
    pub psychologist_id: Uuid,
    pub total_sessions: i32,
    pub sessions_used: i32,
    pub status: ClientPackageStatus,
}

impl ClientPackage {
    pub fn remaining(&self) -> i32 {
        (self.total_sessions - self.sessions_used).max(0)
    }
}

//=========================================================================================
// Calendar
//=========================================================================================

/// The result of creating a calendar invite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalendarEvent {
    pub event_id: Option<String>,
    pub meet_link: String,
    pub event_link: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_state_machine_only_allows_documented_edges() {
        use SlotLockStatus::*;
        assert!(SlotHeld.can_transition_to(PaymentPending));
        assert!(PaymentPending.can_transition_to(PaymentSuccess));
        assert!(PaymentSuccess.can_transition_to(SessionCreated));
        assert!(!SlotHeld.can_transition_to(SessionCreated));
        assert!(!SessionCreated.can_transition_to(Failed));
        assert!(!Expired.can_transition_to(PaymentPending));
        for terminal in [SessionCreated, Failed, Expired] {
            assert!(terminal.is_terminal());
        }
    }

    #[test]
    fn both_cancel_spellings_parse() {
        assert_eq!(SessionStatus::parse("canceled"), Some(SessionStatus::Cancelled));
        assert_eq!(SessionStatus::parse("cancelled"), Some(SessionStatus::Cancelled));
        assert!(!SessionStatus::Cancelled.holds_slot());
        assert!(SessionStatus::RescheduleRequested.holds_slot());
    }

    #[test]
    fn package_status_follows_usage() {
        assert_eq!(ClientPackageStatus::for_usage(3, 4), ClientPackageStatus::Active);
        assert_eq!(ClientPackageStatus::for_usage(4, 4), ClientPackageStatus::Exhausted);
    }
}
