//! Slot reservation (price quote + slot lock) and payment-order creation.

use booking_core::domain::{NewPayment, NewSlotLock, SlotLock, SlotLockStatus};
use booking_core::ports::{CheckoutForm, CheckoutRequest, PortError};
use chrono::{DateTime, NaiveDate, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use super::{AuthContext, BookingService, CURRENCY};
use crate::error::BookingError;

#[derive(Debug, Clone)]
pub struct ReserveRequest {
    pub psychologist_id: Uuid,
    pub date: NaiveDate,
    pub time: String,
    pub package_id: Option<Uuid>,
}

/// A priced hold on a slot. `quote_id` doubles as the gateway transaction id.
#[derive(Debug, Clone)]
pub struct Quote {
    pub quote_id: String,
    pub price: i64,
    pub currency: &'static str,
    pub expires_at: DateTime<Utc>,
}

impl Quote {
    fn from_lock(lock: &SlotLock) -> Self {
        Self {
            quote_id: lock.order_id.clone(),
            price: lock.amount,
            currency: CURRENCY,
            expires_at: lock.expires_at,
        }
    }
}

/// Gateway transaction ids are limited to 25 characters.
fn new_order_id() -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("BK{}", &hex[..20])
}

impl BookingService {
    /// Validates and prices a slot, then holds it for `SLOT_HOLD_MINUTES`.
    pub async fn reserve_slot(
        &self,
        actor: &AuthContext,
        request: ReserveRequest,
    ) -> Result<Quote, BookingError> {
        let client_id = actor.require_client()?;
        let now = self.now();

        // 1. The slot must exist and lie in the future.
        if self.slot_start(request.date, &request.time)? <= now {
            return Err(BookingError::Validation(
                "This slot is in the past, please pick another".to_string(),
            ));
        }

        // 2. Price it: the package price, else the configured individual price.
        let psychologist = self.db.get_psychologist(request.psychologist_id).await?;
        let price = match request.package_id {
            Some(package_id) => {
                let package = self.db.get_package(package_id).await?;
                if package.psychologist_id != psychologist.id {
                    return Err(BookingError::Validation(
                        "This package belongs to a different psychologist".to_string(),
                    ));
                }
                package.price
            }
            None => psychologist
                .individual_price
                .ok_or(BookingError::PriceNotConfigured(psychologist.id))?,
        };
        if price <= 0 {
            return Err(BookingError::PriceNotConfigured(psychologist.id));
        }

        // 3. The slot must still be open.
        if !self
            .is_slot_available(request.psychologist_id, request.date, &request.time)
            .await?
        {
            return Err(BookingError::conflict(
                "This slot was just booked, please pick another",
            ));
        }

        // 4. Another client's live hold blocks; our own hold is handed back.
        let live = self
            .db
            .find_live_locks(request.psychologist_id, request.date, &request.time, now)
            .await?;
        if live.iter().any(|l| l.client_id != client_id) {
            return Err(BookingError::conflict(
                "Someone is paying for this slot right now, please pick another",
            ));
        }
        if let Some(own) = live.iter().find(|l| {
            l.status == SlotLockStatus::SlotHeld && l.package_id == request.package_id
        }) {
            return Ok(Quote::from_lock(own));
        }

        // 5. Hold the slot.
        let lock = self
            .db
            .create_slot_lock(NewSlotLock {
                order_id: new_order_id(),
                psychologist_id: request.psychologist_id,
                client_id,
                package_id: request.package_id,
                date: request.date,
                time: request.time.clone(),
                amount: price,
                expires_at: now + self.settings.slot_hold,
            })
            .await?;
        info!(
            order_id = %lock.order_id,
            "Held {} {} for client {}", lock.date, lock.time, client_id
        );
        Ok(Quote::from_lock(&lock))
    }

    /// Creates the pending payment for a held slot and signs the gateway form.
    pub async fn create_payment_order(
        &self,
        actor: &AuthContext,
        quote_id: &str,
    ) -> Result<CheckoutForm, BookingError> {
        let client_id = actor.require_client()?;
        let lock = self
            .db
            .get_slot_lock(quote_id)
            .await?
            .ok_or_else(|| BookingError::NotFound(format!("Quote {} not found", quote_id)))?;
        if lock.client_id != client_id {
            return Err(BookingError::Forbidden(
                "This reservation belongs to someone else".to_string(),
            ));
        }

        // A second click on "pay" re-signs the existing order.
        let resumable = lock.status == SlotLockStatus::PaymentPending && lock.is_live(self.now());
        if !resumable {
            if lock.status != SlotLockStatus::SlotHeld || !lock.is_live(self.now()) {
                return Err(BookingError::conflict(
                    "This reservation has expired, please pick the slot again",
                ));
            }
            if !self.is_slot_available(lock.psychologist_id, lock.date, &lock.time).await? {
                return Err(BookingError::conflict(
                    "This slot was just booked, please pick another",
                ));
            }
        }

        let client = self.db.get_client(client_id).await?;
        let psychologist = self.db.get_psychologist(lock.psychologist_id).await?;

        let payment = match self
            .db
            .create_payment(NewPayment {
                transaction_id: lock.order_id.clone(),
                psychologist_id: lock.psychologist_id,
                client_id,
                package_id: lock.package_id,
                date: lock.date,
                time: lock.time.clone(),
                amount: lock.amount,
            })
            .await
        {
            Ok(payment) => payment,
            Err(PortError::Conflict(_)) => self.db.get_payment_by_transaction(&lock.order_id).await?,
            Err(e) => return Err(e.into()),
        };

        if lock.status.can_transition_to(SlotLockStatus::PaymentPending) {
            self.db
                .set_slot_lock_status(&lock.order_id, SlotLockStatus::PaymentPending)
                .await?;
        }

        let request = CheckoutRequest {
            transaction_id: payment.transaction_id.clone(),
            amount: payment.amount,
            product_info: format!(
                "{} with {}",
                self.settings.platform_event_prefix, psychologist.name
            ),
            first_name: client
                .name
                .split_whitespace()
                .next()
                .unwrap_or("Client")
                .to_string(),
            email: client.email.clone().unwrap_or_else(|| actor.email.clone()),
            phone: client.phone.clone().unwrap_or_default(),
            udf: [
                lock.psychologist_id.to_string(),
                client_id.to_string(),
                lock.date.to_string(),
                lock.time.clone(),
                lock.package_id.map(|p| p.to_string()).unwrap_or_default(),
            ],
        };
        let form = self.gateway.create_order(&request).map_err(|e| {
            warn!(order_id = %lock.order_id, "Gateway order failed: {:?}", e);
            BookingError::Upstream("Could not start the payment, please try again".to_string())
        })?;
        Ok(form)
    }

    /// Moves overdue `SLOT_HELD` locks to `EXPIRED`. Run by the sweeper.
    pub async fn expire_locks(&self) -> Result<u64, BookingError> {
        let expired = self.db.expire_slot_locks(self.now()).await?;
        if expired > 0 {
            info!("Expired {} slot hold(s)", expired);
        }
        Ok(expired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_ids_fit_the_gateway_limit() {
        let id = new_order_id();
        assert_eq!(id.len(), 22);
        assert!(id.starts_with("BK"));
        assert_ne!(id, new_order_id());
    }
}
