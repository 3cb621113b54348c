//! crates/booking_core/src/ports.rs
//!
//! Defines the service contracts (traits) for the booking core.
//! These traits form the boundary of the hexagonal architecture, allowing the core
//! to be independent of the database, the payment gateway, the calendar provider
//! and the message senders.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::{
    Availability, CalendarEvent, Client, ClientPackage, NewClient, NewPayment, NewSession,
    NewSlotLock, Package, Payment, Psychologist, Role, Session, SessionStatus, SlotLock,
    SlotLockStatus, User, UserCredentials,
};
use crate::slots::BusyInterval;

//=========================================================================================
// Generic Port Error and Result Types
//=========================================================================================

/// A generic error type for all port operations.
/// This abstracts away the specific errors from external services (e.g., database, network).
#[derive(Debug, thiserror::Error)]
pub enum PortError {
    #[error("Item not found: {0}")]
    NotFound(String),
    /// A uniqueness rule was violated, e.g. an active session already holds the slot.
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("An unexpected error occurred: {0}")]
    Unexpected(String),
    #[error("Unauthorized")]
    Unauthorized,
}

/// A convenience type alias for `Result<T, PortError>`.
pub type PortResult<T> = Result<T, PortError>;

/// Result of trying to settle a captured payment into a session.
#[derive(Debug, Clone)]
pub enum SettleOutcome {
    /// The session was inserted and the payment marked `success`.
    Created(Session),
    /// The payment was already `success`; nothing was written.
    AlreadySettled(Payment),
}

//=========================================================================================
// Storage Port
//=========================================================================================

#[async_trait]
pub trait DatabaseService: Send + Sync {
    // --- Auth Methods ---
    async fn create_user_with_email(
        &self,
        email: &str,
        hashed_password: &str,
        role: Role,
    ) -> PortResult<User>;

    async fn get_user_by_email(&self, email: &str) -> PortResult<UserCredentials>;

    async fn create_auth_session(
        &self,
        session_id: &str,
        user_id: Uuid,
        expires_at: DateTime<Utc>,
    ) -> PortResult<()>;

    async fn validate_auth_session(&self, session_id: &str) -> PortResult<User>;

    async fn delete_auth_session(&self, session_id: &str) -> PortResult<()>;

    // --- Directory ---
    async fn get_psychologist(&self, psychologist_id: Uuid) -> PortResult<Psychologist>;

    async fn find_psychologist_by_user(&self, user_id: Uuid) -> PortResult<Option<Psychologist>>;

    async fn get_package(&self, package_id: Uuid) -> PortResult<Package>;

    async fn create_client(&self, client: NewClient) -> PortResult<Client>;

    async fn get_client(&self, client_id: Uuid) -> PortResult<Client>;

    async fn find_client_by_user(&self, user_id: Uuid) -> PortResult<Option<Client>>;

    async fn find_client_by_email(&self, email: &str) -> PortResult<Option<Client>>;

    /// `phone` is compared on digits only.
    async fn find_client_by_phone(&self, phone: &str) -> PortResult<Option<Client>>;

    /// Links an unclaimed client record to a platform account.
    async fn link_client_user(&self, client_id: Uuid, user_id: Uuid) -> PortResult<Client>;

    // --- Availability ---
    async fn get_availability(
        &self,
        psychologist_id: Uuid,
        date: NaiveDate,
    ) -> PortResult<Option<Availability>>;

    async fn set_availability(
        &self,
        psychologist_id: Uuid,
        date: NaiveDate,
        slots: Vec<String>,
    ) -> PortResult<Availability>;

    /// Removes a slot from the day's list. Absent slots are a no-op.
    async fn consume_slot(&self, psychologist_id: Uuid, date: NaiveDate, time: &str)
        -> PortResult<()>;

    /// Re-adds a slot to the day's list without duplicating it.
    async fn release_slot(&self, psychologist_id: Uuid, date: NaiveDate, time: &str)
        -> PortResult<()>;

    // --- Sessions ---
    async fn get_session(&self, session_id: Uuid) -> PortResult<Session>;

    /// The session currently holding the slot, if any.
    async fn find_active_session(
        &self,
        psychologist_id: Uuid,
        date: NaiveDate,
        time: &str,
    ) -> PortResult<Option<Session>>;

    async fn find_client_session(
        &self,
        psychologist_id: Uuid,
        client_id: Uuid,
        date: NaiveDate,
        time: &str,
        status: SessionStatus,
    ) -> PortResult<Option<Session>>;

    async fn list_sessions_for_client(&self, client_id: Uuid) -> PortResult<Vec<Session>>;

    async fn set_session_status(&self, session_id: Uuid, status: SessionStatus)
        -> PortResult<Session>;

    async fn request_reschedule(
        &self,
        session_id: Uuid,
        date: NaiveDate,
        time: &str,
    ) -> PortResult<Session>;

    /// Atomically releases the old slot, consumes the new one and moves the session.
    /// Fails with `Conflict` when another active session holds the target.
    async fn move_session(&self, session_id: Uuid, date: NaiveDate, time: &str)
        -> PortResult<Session>;

    /// Marks the session cancelled and releases its slot.
    async fn cancel_session(&self, session_id: Uuid) -> PortResult<Session>;

    async fn set_session_calendar(&self, session_id: Uuid, event: &CalendarEvent)
        -> PortResult<()>;

    // --- Payments ---
    async fn create_payment(&self, payment: NewPayment) -> PortResult<Payment>;

    async fn get_payment_by_transaction(&self, transaction_id: &str) -> PortResult<Payment>;

    async fn get_payment(&self, payment_id: Uuid) -> PortResult<Payment>;

    async fn list_open_credits(&self, client_id: Uuid) -> PortResult<Vec<Payment>>;

    /// Inserts the session, consumes the slot, marks the payment `success` and the
    /// matching slot lock `SESSION_CREATED` in one unit. A payment that is already
    /// `success` is returned untouched.
    async fn settle_payment(
        &self,
        payment_id: Uuid,
        gateway_payment_id: Option<&str>,
        session: NewSession,
    ) -> PortResult<SettleOutcome>;

    /// Marks a payment `success` as an unconsumed credit. Returns the payment's
    /// current state when it was already `success`.
    async fn record_credit(
        &self,
        payment_id: Uuid,
        gateway_payment_id: Option<&str>,
    ) -> PortResult<Payment>;

    /// Marks a pending payment `failed`. Returns the current state when it was not pending.
    async fn fail_payment(&self, payment_id: Uuid) -> PortResult<Payment>;

    /// Creates a session from an open credit and marks the credit consumed.
    async fn apply_credit(&self, payment_id: Uuid, session: NewSession) -> PortResult<Session>;

    // --- Slot Locks ---
    async fn create_slot_lock(&self, lock: NewSlotLock) -> PortResult<SlotLock>;

    async fn get_slot_lock(&self, order_id: &str) -> PortResult<Option<SlotLock>>;

    /// Live locks on a slot: held or awaiting payment and unexpired, or captured.
    async fn find_live_locks(
        &self,
        psychologist_id: Uuid,
        date: NaiveDate,
        time: &str,
        now: DateTime<Utc>,
    ) -> PortResult<Vec<SlotLock>>;

    async fn set_slot_lock_status(&self, order_id: &str, status: SlotLockStatus)
        -> PortResult<SlotLock>;

    /// Moves every overdue `SLOT_HELD` lock to `EXPIRED`.
    async fn expire_slot_locks(&self, now: DateTime<Utc>) -> PortResult<u64>;

    // --- Packages ---
    async fn get_client_package(&self, client_package_id: Uuid) -> PortResult<ClientPackage>;

    /// Creates a session from a bundle and counts it as used.
    async fn book_from_package(
        &self,
        client_package_id: Uuid,
        session: NewSession,
    ) -> PortResult<Session>;
}

//=========================================================================================
// Payment Gateway Port
//=========================================================================================

/// Everything the gateway needs to render its checkout page.
#[derive(Debug, Clone)]
pub struct CheckoutRequest {
    pub transaction_id: String,
    pub amount: i64,
    pub product_info: String,
    pub first_name: String,
    pub email: String,
    pub phone: String,
    pub udf: [String; 5],
}

/// A signed form the browser posts to the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckoutForm {
    pub action: String,
    pub params: Vec<(String, String)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayPaymentState {
    Captured,
    Failed,
    Pending,
    Unknown,
}

/// What the gateway currently knows about an order.
#[derive(Debug, Clone)]
pub struct GatewayPayment {
    pub transaction_id: String,
    pub gateway_payment_id: Option<String>,
    pub state: GatewayPaymentState,
    pub amount: Option<i64>,
}

/// The fields the gateway posts back after checkout, as received.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayCallback {
    pub transaction_id: String,
    pub gateway_payment_id: Option<String>,
    pub status: String,
    /// Decimal major units exactly as posted, e.g. `"500.00"`.
    pub amount: String,
    pub product_info: String,
    pub first_name: String,
    pub email: String,
    pub udf: [String; 5],
    pub additional_charges: Option<String>,
    pub hash: String,
}

impl GatewayCallback {
    pub fn is_success(&self) -> bool {
        self.status.eq_ignore_ascii_case("success")
    }
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Builds the signed checkout form for an order.
    fn create_order(&self, request: &CheckoutRequest) -> PortResult<CheckoutForm>;

    /// Checks the callback signature against the merchant secret.
    fn verify_callback(&self, callback: &GatewayCallback) -> bool;

    /// Asks the gateway for the state of an order.
    async fn fetch_payment(&self, transaction_id: &str) -> PortResult<GatewayPayment>;
}

//=========================================================================================
// Calendar Port
//=========================================================================================

#[derive(Debug, Clone)]
pub struct CalendarEventRequest {
    pub summary: String,
    pub description: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub attendees: Vec<String>,
}

#[async_trait]
pub trait CalendarService: Send + Sync {
    /// Creates an invite with a video link. `credentials` is the psychologist's token blob.
    async fn create_event(
        &self,
        credentials: Option<&str>,
        event: &CalendarEventRequest,
    ) -> PortResult<CalendarEvent>;

    /// Lists the busy periods overlapping `[from, to)`.
    async fn list_busy(
        &self,
        credentials: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> PortResult<Vec<BusyInterval>>;
}

//=========================================================================================
// Notification Port
//=========================================================================================

#[derive(Debug, Clone)]
pub struct Recipient {
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
}

#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub recipient: Recipient,
    pub template: String,
    pub subject: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    Skipped { reason: String },
}

#[async_trait]
pub trait NotificationSender: Send + Sync {
    /// Short channel name for logs (`email`, `whatsapp`).
    fn channel(&self) -> &'static str;

    async fn send(&self, message: &OutboundMessage) -> PortResult<Delivery>;
}

//=========================================================================================
// Side-Effect Outbox Port
//=========================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeKind {
    BookingConfirmed,
    Rescheduled,
    RescheduleRequested,
    RescheduleRejected,
    Cancelled,
}

/// Work that happens after the response has been sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SideEffect {
    CalendarInvite { session_id: Uuid },
    SessionNotice { session_id: Uuid, kind: NoticeKind },
    CreditNotice { payment_id: Uuid },
}

#[async_trait]
pub trait Outbox: Send + Sync {
    async fn enqueue(&self, effect: SideEffect) -> PortResult<()>;
}

//=========================================================================================
// Clock Port
//=========================================================================================

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
