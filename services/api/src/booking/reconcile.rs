//! Payment reconciliation: exactly-once session creation on capture, the credit
//! fallback when the slot was lost, failure handling and status resolution.

use booking_core::domain::{
    NewSession, PackageUse, Payment, PaymentStatus, Session, SessionStatus, SlotLock,
    SlotLockStatus,
};
use booking_core::ports::{
    GatewayCallback, GatewayPaymentState, NoticeKind, PortError, SettleOutcome, SideEffect,
};
use booking_core::status::{self, ClientStatus, CREDIT_MESSAGE};
use chrono::NaiveDate;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{AuthContext, BookingService};
use crate::adapters::payu::parse_amount;
use crate::error::BookingError;

/// What a capture notification resulted in.
#[derive(Debug, Clone)]
pub enum PaymentOutcome {
    /// A new session was created.
    Booked(Session),
    /// The payment had already been handled; nothing changed.
    AlreadyProcessed(Payment),
    /// The slot was gone; the payment is kept as a credit.
    Credited(Payment),
    /// The payment was marked failed and the hold released.
    Failed(Payment),
    /// The gateway has no final answer yet.
    Pending(Payment),
}

impl PaymentOutcome {
    pub fn payment_status(&self) -> &'static str {
        match self {
            PaymentOutcome::Booked(_) => "booked",
            PaymentOutcome::AlreadyProcessed(_) => "already_processed",
            PaymentOutcome::Credited(_) => "credited",
            PaymentOutcome::Failed(_) => "failed",
            PaymentOutcome::Pending(_) => "pending",
        }
    }
}

/// Session details shown to a polling client.
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub session_id: Option<Uuid>,
    pub psychologist_id: Uuid,
    pub date: NaiveDate,
    pub time: String,
    pub meet_link: Option<String>,
    /// `false` when the row could not be found and the details come from the order.
    pub resolved: bool,
}

impl From<&Session> for SessionSummary {
    fn from(session: &Session) -> Self {
        Self {
            session_id: Some(session.id),
            psychologist_id: session.psychologist_id,
            date: session.date,
            time: session.time.clone(),
            meet_link: session.meet_link.clone(),
            resolved: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BookingStatusView {
    pub order_id: String,
    pub status: ClientStatus,
    pub message: String,
    pub session: Option<SessionSummary>,
    /// The payment is an unused credit.
    pub credit: bool,
    /// Resolved from the payment row alone; the order predates slot locks.
    pub legacy: bool,
}

impl BookingService {
    //=====================================================================================
    // Gateway callbacks
    //=====================================================================================

    /// Verifies a gateway callback and applies it.
    pub async fn handle_callback(
        &self,
        callback: &GatewayCallback,
    ) -> Result<PaymentOutcome, BookingError> {
        if !self.gateway.verify_callback(callback) {
            warn!(
                transaction_id = %callback.transaction_id,
                "Rejected payment callback with an invalid hash"
            );
            return Err(BookingError::InvalidSignature);
        }
        if callback.is_success() {
            let amount = parse_amount(&callback.amount).ok_or_else(|| {
                BookingError::Validation(format!("Invalid amount '{}'", callback.amount))
            })?;
            self.confirm_payment(
                &callback.transaction_id,
                callback.gateway_payment_id.as_deref(),
                Some(amount),
            )
            .await
        } else {
            info!(
                transaction_id = %callback.transaction_id,
                "Gateway reported status '{}'", callback.status
            );
            self.fail_payment(&callback.transaction_id).await
        }
    }

    /// Creates the session for a captured payment exactly once.
    pub async fn confirm_payment(
        &self,
        transaction_id: &str,
        gateway_payment_id: Option<&str>,
        amount: Option<i64>,
    ) -> Result<PaymentOutcome, BookingError> {
        // 1. Find the payment.
        let payment = self.payment_by_transaction(transaction_id).await?;
        if let Some(reported) = amount {
            if reported != payment.amount {
                warn!(
                    transaction_id,
                    "Gateway amount {} does not match stored amount {}", reported, payment.amount
                );
                return Err(BookingError::Validation(
                    "The paid amount does not match the order".to_string(),
                ));
            }
        }

        // 2. Duplicate deliveries stop here.
        if payment.status == PaymentStatus::Success {
            info!(transaction_id, "Payment already processed");
            return Ok(PaymentOutcome::AlreadyProcessed(payment));
        }
        self.advance_lock(transaction_id, SlotLockStatus::PaymentSuccess)
            .await;

        // 3. Lost the slot: keep the money as a credit.
        if !self
            .is_slot_available(payment.psychologist_id, payment.date, &payment.time)
            .await?
        {
            return self.issue_credit(&payment, gateway_payment_id).await;
        }

        // 4. Insert the session; the storage uniqueness rule has the final word.
        let package = match payment.package_id {
            Some(package_id) => PackageUse::Open {
                package_id,
                total_sessions: self.db.get_package(package_id).await?.session_count,
            },
            None => PackageUse::None,
        };
        let new_session = NewSession {
            psychologist_id: payment.psychologist_id,
            client_id: payment.client_id,
            date: payment.date,
            time: payment.time.clone(),
            price: payment.amount,
            package,
        };
        match self
            .db
            .settle_payment(payment.id, gateway_payment_id, new_session)
            .await
        {
            Ok(SettleOutcome::Created(session)) => {
                info!(
                    transaction_id,
                    session_id = %session.id,
                    "Session booked for {} {}", session.date, session.time
                );
                self.enqueue(SideEffect::CalendarInvite {
                    session_id: session.id,
                })
                .await;
                self.enqueue(SideEffect::SessionNotice {
                    session_id: session.id,
                    kind: NoticeKind::BookingConfirmed,
                })
                .await;
                Ok(PaymentOutcome::Booked(session))
            }
            Ok(SettleOutcome::AlreadySettled(current)) => {
                Ok(PaymentOutcome::AlreadyProcessed(current))
            }
            Err(PortError::Conflict(reason)) => {
                warn!(transaction_id, "Slot taken while settling: {}", reason);
                self.issue_credit(&payment, gateway_payment_id).await
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Marks a payment failed and frees its hold. Settled payments are left alone.
    pub async fn fail_payment(&self, transaction_id: &str) -> Result<PaymentOutcome, BookingError> {
        let payment = self.payment_by_transaction(transaction_id).await?;
        let current = self.db.fail_payment(payment.id).await?;
        if current.status != PaymentStatus::Failed {
            return Ok(PaymentOutcome::AlreadyProcessed(current));
        }
        self.advance_lock(transaction_id, SlotLockStatus::Failed).await;
        Ok(PaymentOutcome::Failed(current))
    }

    async fn issue_credit(
        &self,
        payment: &Payment,
        gateway_payment_id: Option<&str>,
    ) -> Result<PaymentOutcome, BookingError> {
        let credited = self.db.record_credit(payment.id, gateway_payment_id).await?;
        if !credited.is_credit || credited.session_id.is_some() {
            // A concurrent delivery of the same payment won the slot.
            return Ok(PaymentOutcome::AlreadyProcessed(credited));
        }
        warn!(
            transaction_id = %credited.transaction_id,
            "Slot {} {} was taken; payment kept as credit", credited.date, credited.time
        );
        self.advance_lock(&credited.transaction_id, SlotLockStatus::Failed)
            .await;
        self.enqueue(SideEffect::CreditNotice {
            payment_id: credited.id,
        })
        .await;
        Ok(PaymentOutcome::Credited(credited))
    }

    /// Moves the order's lock forward when the state machine allows it.
    async fn advance_lock(&self, order_id: &str, next: SlotLockStatus) {
        let lock = match self.db.get_slot_lock(order_id).await {
            Ok(Some(lock)) => lock,
            Ok(None) => return,
            Err(e) => {
                warn!(order_id, "Could not load slot lock: {:?}", e);
                return;
            }
        };
        if !lock.status.can_transition_to(next) {
            debug!(order_id, "Lock stays {} (not moving to {})", lock.status.as_str(), next.as_str());
            return;
        }
        if let Err(e) = self.db.set_slot_lock_status(order_id, next).await {
            warn!(order_id, "Could not move slot lock to {}: {:?}", next.as_str(), e);
        }
    }

    pub(super) async fn payment_by_transaction(&self, transaction_id: &str) -> Result<Payment, BookingError> {
        self.db
            .get_payment_by_transaction(transaction_id)
            .await
            .map_err(|e| match e {
                PortError::NotFound(_) => BookingError::PaymentNotFound(transaction_id.to_string()),
                other => other.into(),
            })
    }

    /// Client-triggered reconciliation of one of the caller's own orders.
    pub async fn verify_payment(
        &self,
        actor: &AuthContext,
        order_id: &str,
    ) -> Result<PaymentOutcome, BookingError> {
        let client_id = actor.require_client()?;
        let payment = self.payment_by_transaction(order_id).await?;
        if payment.client_id != client_id {
            return Err(BookingError::Forbidden(
                "This payment belongs to someone else".to_string(),
            ));
        }
        match payment.status {
            PaymentStatus::Success if payment.is_open_credit() => {
                return Ok(PaymentOutcome::Credited(payment))
            }
            PaymentStatus::Success => return Ok(PaymentOutcome::AlreadyProcessed(payment)),
            PaymentStatus::Failed | PaymentStatus::Pending => {}
        }

        let remote = self.gateway.fetch_payment(order_id).await.map_err(|e| {
            warn!(transaction_id = order_id, "Gateway status check failed: {:?}", e);
            BookingError::Upstream("Could not reach the payment gateway, please retry".to_string())
        })?;
        match remote.state {
            GatewayPaymentState::Captured => {
                self.confirm_payment(order_id, remote.gateway_payment_id.as_deref(), remote.amount)
                    .await
            }
            GatewayPaymentState::Failed => self.fail_payment(order_id).await,
            GatewayPaymentState::Pending | GatewayPaymentState::Unknown => {
                Ok(PaymentOutcome::Pending(payment))
            }
        }
    }

    //=====================================================================================
    // Status polling
    //=====================================================================================

    /// Resolves the client-facing status of an order, reconciling with the gateway
    /// when the webhook is late.
    pub async fn booking_status(&self, order_id: &str) -> Result<BookingStatusView, BookingError> {
        let mut payment = self.find_payment(order_id).await?;
        let overdue = payment.as_ref().is_some_and(|p| {
            p.status == PaymentStatus::Pending
                && self.now() - p.created_at >= self.settings.reconcile_grace
        });
        if overdue {
            self.reconcile_with_gateway(order_id).await;
            payment = self.find_payment(order_id).await?;
        }

        let lock = self.db.get_slot_lock(order_id).await?;
        match (lock, payment) {
            (Some(lock), payment) => Ok(self.status_from_lock(lock, payment).await),
            (None, Some(payment)) => Ok(self.status_from_payment(payment).await),
            (None, None) => Err(BookingError::PaymentNotFound(order_id.to_string())),
        }
    }

    async fn find_payment(&self, order_id: &str) -> Result<Option<Payment>, BookingError> {
        match self.db.get_payment_by_transaction(order_id).await {
            Ok(payment) => Ok(Some(payment)),
            Err(PortError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Asks the gateway directly. Every failure here is logged and ignored.
    async fn reconcile_with_gateway(&self, transaction_id: &str) {
        let remote = match self.gateway.fetch_payment(transaction_id).await {
            Ok(remote) => remote,
            Err(e) => {
                warn!(transaction_id, "Gateway status check failed: {:?}", e);
                return;
            }
        };
        let result = match remote.state {
            GatewayPaymentState::Captured => {
                self.confirm_payment(
                    transaction_id,
                    remote.gateway_payment_id.as_deref(),
                    remote.amount,
                )
                .await
            }
            GatewayPaymentState::Failed => self.fail_payment(transaction_id).await,
            GatewayPaymentState::Pending | GatewayPaymentState::Unknown => {
                debug!(transaction_id, "Gateway has no final state yet");
                return;
            }
        };
        if let Err(e) = result {
            warn!(transaction_id, "Reconciliation failed: {:?}", e);
        }
    }

    async fn status_from_lock(&self, lock: SlotLock, payment: Option<Payment>) -> BookingStatusView {
        let status = status::from_lock(&lock, self.now());
        let credit = payment.as_ref().is_some_and(Payment::is_open_credit);
        let session = if status == ClientStatus::Completed {
            Some(self.resolve_session(&lock, payment.as_ref()).await)
        } else {
            None
        };
        BookingStatusView {
            order_id: lock.order_id,
            status,
            message: message_for(status, credit),
            session,
            credit,
            legacy: false,
        }
    }

    async fn status_from_payment(&self, payment: Payment) -> BookingStatusView {
        let status = status::from_payment(&payment);
        let credit = payment.is_open_credit();
        let mut session = None;
        if let Some(session_id) = payment.session_id {
            session = match self.db.get_session(session_id).await {
                Ok(found) => Some(SessionSummary::from(&found)),
                Err(e) => {
                    warn!(session_id = %session_id, "Session lookup failed: {:?}", e);
                    Some(SessionSummary {
                        session_id: Some(session_id),
                        psychologist_id: payment.psychologist_id,
                        date: payment.date,
                        time: payment.time.clone(),
                        meet_link: None,
                        resolved: false,
                    })
                }
            };
        }
        BookingStatusView {
            order_id: payment.transaction_id,
            status,
            message: message_for(status, credit),
            session,
            credit,
            legacy: true,
        }
    }

    /// By stored id first, then by slot and client, then from the lock itself.
    async fn resolve_session(&self, lock: &SlotLock, payment: Option<&Payment>) -> SessionSummary {
        let ids = [lock.session_id, payment.and_then(|p| p.session_id)];
        for session_id in ids.into_iter().flatten() {
            match self.db.get_session(session_id).await {
                Ok(session) => return SessionSummary::from(&session),
                Err(e) => warn!(session_id = %session_id, "Stored session not found: {:?}", e),
            }
        }

        match self
            .db
            .find_client_session(
                lock.psychologist_id,
                lock.client_id,
                lock.date,
                &lock.time,
                SessionStatus::Booked,
            )
            .await
        {
            Ok(Some(session)) => return SessionSummary::from(&session),
            Ok(None) => warn!(order_id = %lock.order_id, "No session matches the order's slot"),
            Err(e) => warn!(order_id = %lock.order_id, "Session fallback lookup failed: {:?}", e),
        }

        SessionSummary {
            session_id: None,
            psychologist_id: lock.psychologist_id,
            date: lock.date,
            time: lock.time.clone(),
            meet_link: None,
            resolved: false,
        }
    }
}

fn message_for(status: ClientStatus, credit: bool) -> String {
    if credit {
        CREDIT_MESSAGE.to_string()
    } else {
        status.message().to_string()
    }
}
