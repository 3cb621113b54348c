//! services/api/src/adapters/memory.rs
//!
//! An in-memory implementation of the `DatabaseService` port.
//!
//! All state sits behind one mutex so every trait method is atomic, mirroring the
//! transactional guarantees of the Postgres adapter, including the "one active
//! session per slot" rule.

use async_trait::async_trait;
use booking_core::domain::{
    Availability, CalendarEvent, Client, ClientPackage, ClientPackageStatus, NewClient,
    NewPayment, NewSession, NewSlotLock, Package, PackageUse, Payment, PaymentStatus,
    Psychologist, Role, Session, SessionStatus, SlotLock, SlotLockStatus, User, UserCredentials,
};
use booking_core::ports::{DatabaseService, PortError, PortResult, SettleOutcome};
use booking_core::slots;
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
struct State {
    users: HashMap<Uuid, UserCredentials>,
    auth_sessions: HashMap<String, (Uuid, DateTime<Utc>)>,
    psychologists: HashMap<Uuid, Psychologist>,
    clients: Vec<Client>,
    packages: HashMap<Uuid, Package>,
    availability: HashMap<(Uuid, NaiveDate), Vec<String>>,
    sessions: Vec<Session>,
    payments: Vec<Payment>,
    locks: Vec<SlotLock>,
    client_packages: HashMap<Uuid, ClientPackage>,
}

impl State {
    fn slot_taken(&self, psychologist_id: Uuid, date: NaiveDate, time: &str, except: Option<Uuid>) -> bool {
        self.sessions.iter().any(|s| {
            Some(s.id) != except
                && s.psychologist_id == psychologist_id
                && s.date == date
                && s.time == time
                && s.status.holds_slot()
        })
    }

    fn consume(&mut self, psychologist_id: Uuid, date: NaiveDate, time: &str) {
        if let Some(list) = self.availability.get_mut(&(psychologist_id, date)) {
            slots::consume(list, time);
        }
    }

    fn release(&mut self, psychologist_id: Uuid, date: NaiveDate, time: &str) {
        let list = self.availability.entry((psychologist_id, date)).or_default();
        slots::release(list, time);
    }

    fn insert_session(
        &mut self,
        session: &NewSession,
        payment_id: Option<Uuid>,
        client_package_id: Option<Uuid>,
        package_id: Option<Uuid>,
    ) -> PortResult<Session> {
        if self.slot_taken(session.psychologist_id, session.date, &session.time, None) {
            return Err(PortError::Conflict(format!(
                "Slot {} {} is already booked",
                session.date, session.time
            )));
        }
        let created = Session {
            id: Uuid::new_v4(),
            psychologist_id: session.psychologist_id,
            client_id: session.client_id,
            date: session.date,
            time: session.time.clone(),
            status: SessionStatus::Booked,
            package_id,
            client_package_id,
            payment_id,
            price: session.price,
            meet_link: None,
            calendar_event_id: None,
            calendar_event_link: None,
            reschedule_count: 0,
            requested_date: None,
            requested_time: None,
            created_at: Utc::now(),
        };
        self.sessions.push(created.clone());
        self.consume(session.psychologist_id, session.date, &session.time);
        Ok(created)
    }

    fn session_mut(&mut self, session_id: Uuid) -> PortResult<&mut Session> {
        self.sessions
            .iter_mut()
            .find(|s| s.id == session_id)
            .ok_or_else(|| PortError::NotFound(format!("Session {} not found", session_id)))
    }

    fn payment_mut(&mut self, payment_id: Uuid) -> PortResult<&mut Payment> {
        self.payments
            .iter_mut()
            .find(|p| p.id == payment_id)
            .ok_or_else(|| PortError::NotFound(format!("Payment {} not found", payment_id)))
    }
}

/// Process-local storage used by tests and local demos.
#[derive(Default)]
pub struct InMemoryDatabase {
    state: Mutex<State>,
}

impl InMemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_psychologist(&self, psychologist: Psychologist) {
        self.state
            .lock()
            .await
            .psychologists
            .insert(psychologist.id, psychologist);
    }

    pub async fn insert_package(&self, package: Package) {
        self.state.lock().await.packages.insert(package.id, package);
    }

    /// Every session, in insertion order.
    pub async fn sessions(&self) -> Vec<Session> {
        self.state.lock().await.sessions.clone()
    }
}

#[async_trait]
impl DatabaseService for InMemoryDatabase {
    async fn create_user_with_email(
        &self,
        email: &str,
        hashed_password: &str,
        role: Role,
    ) -> PortResult<User> {
        let mut state = self.state.lock().await;
        if state.users.values().any(|u| u.email.eq_ignore_ascii_case(email)) {
            return Err(PortError::Conflict(format!("Email {} is already registered", email)));
        }
        let user_id = Uuid::new_v4();
        state.users.insert(
            user_id,
            UserCredentials {
                user_id,
                email: email.to_string(),
                hashed_password: hashed_password.to_string(),
                role,
            },
        );
        Ok(User {
            user_id,
            email: email.to_string(),
            role,
        })
    }

    async fn get_user_by_email(&self, email: &str) -> PortResult<UserCredentials> {
        let state = self.state.lock().await;
        state
            .users
            .values()
            .find(|u| u.email.eq_ignore_ascii_case(email))
            .cloned()
            .ok_or_else(|| PortError::NotFound(format!("User {} not found", email)))
    }

    async fn create_auth_session(
        &self,
        session_id: &str,
        user_id: Uuid,
        expires_at: DateTime<Utc>,
    ) -> PortResult<()> {
        self.state
            .lock()
            .await
            .auth_sessions
            .insert(session_id.to_string(), (user_id, expires_at));
        Ok(())
    }

    async fn validate_auth_session(&self, session_id: &str) -> PortResult<User> {
        let state = self.state.lock().await;
        let (user_id, expires_at) = state
            .auth_sessions
            .get(session_id)
            .copied()
            .ok_or(PortError::Unauthorized)?;
        if expires_at <= Utc::now() {
            return Err(PortError::Unauthorized);
        }
        let creds = state.users.get(&user_id).ok_or(PortError::Unauthorized)?;
        Ok(User {
            user_id,
            email: creds.email.clone(),
            role: creds.role,
        })
    }

    async fn delete_auth_session(&self, session_id: &str) -> PortResult<()> {
        self.state.lock().await.auth_sessions.remove(session_id);
        Ok(())
    }

    async fn get_psychologist(&self, psychologist_id: Uuid) -> PortResult<Psychologist> {
        self.state
            .lock()
            .await
            .psychologists
            .get(&psychologist_id)
            .cloned()
            .ok_or_else(|| PortError::NotFound(format!("Psychologist {} not found", psychologist_id)))
    }

    async fn find_psychologist_by_user(&self, user_id: Uuid) -> PortResult<Option<Psychologist>> {
        let state = self.state.lock().await;
        Ok(state
            .psychologists
            .values()
            .find(|p| p.user_id == Some(user_id))
            .cloned())
    }

    async fn get_package(&self, package_id: Uuid) -> PortResult<Package> {
        self.state
            .lock()
            .await
            .packages
            .get(&package_id)
            .cloned()
            .ok_or_else(|| PortError::NotFound(format!("Package {} not found", package_id)))
    }

    async fn create_client(&self, client: NewClient) -> PortResult<Client> {
        let created = Client {
            id: Uuid::new_v4(),
            user_id: client.user_id,
            name: client.name,
            email: client.email,
            phone: client.phone,
        };
        self.state.lock().await.clients.push(created.clone());
        Ok(created)
    }

    async fn get_client(&self, client_id: Uuid) -> PortResult<Client> {
        let state = self.state.lock().await;
        state
            .clients
            .iter()
            .find(|c| c.id == client_id)
            .cloned()
            .ok_or_else(|| PortError::NotFound(format!("Client {} not found", client_id)))
    }

    async fn find_client_by_user(&self, user_id: Uuid) -> PortResult<Option<Client>> {
        let state = self.state.lock().await;
        Ok(state.clients.iter().find(|c| c.user_id == Some(user_id)).cloned())
    }

    async fn find_client_by_email(&self, email: &str) -> PortResult<Option<Client>> {
        let state = self.state.lock().await;
        Ok(state
            .clients
            .iter()
            .find(|c| c.email.as_deref().is_some_and(|e| e.eq_ignore_ascii_case(email)))
            .cloned())
    }

    async fn find_client_by_phone(&self, phone: &str) -> PortResult<Option<Client>> {
        let state = self.state.lock().await;
        Ok(state
            .clients
            .iter()
            .find(|c| {
                c.phone.as_deref().is_some_and(|p| {
                    p.chars().filter(char::is_ascii_digit).collect::<String>() == phone
                })
            })
            .cloned())
    }

    async fn link_client_user(&self, client_id: Uuid, user_id: Uuid) -> PortResult<Client> {
        let mut state = self.state.lock().await;
        let client = state
            .clients
            .iter_mut()
            .find(|c| c.id == client_id)
            .ok_or_else(|| PortError::NotFound(format!("Client {} not found", client_id)))?;
        match client.user_id {
            Some(existing) if existing != user_id => Err(PortError::Conflict(format!(
                "Client {} is linked to another account",
                client_id
            ))),
            _ => {
                client.user_id = Some(user_id);
                Ok(client.clone())
            }
        }
    }

    async fn get_availability(
        &self,
        psychologist_id: Uuid,
        date: NaiveDate,
    ) -> PortResult<Option<Availability>> {
        let state = self.state.lock().await;
        Ok(state
            .availability
            .get(&(psychologist_id, date))
            .map(|slots| Availability {
                psychologist_id,
                date,
                slots: slots.clone(),
            }))
    }

    async fn set_availability(
        &self,
        psychologist_id: Uuid,
        date: NaiveDate,
        slots: Vec<String>,
    ) -> PortResult<Availability> {
        self.state
            .lock()
            .await
            .availability
            .insert((psychologist_id, date), slots.clone());
        Ok(Availability {
            psychologist_id,
            date,
            slots,
        })
    }

    async fn consume_slot(
        &self,
        psychologist_id: Uuid,
        date: NaiveDate,
        time: &str,
    ) -> PortResult<()> {
        self.state.lock().await.consume(psychologist_id, date, time);
        Ok(())
    }

    async fn release_slot(
        &self,
        psychologist_id: Uuid,
        date: NaiveDate,
        time: &str,
    ) -> PortResult<()> {
        self.state.lock().await.release(psychologist_id, date, time);
        Ok(())
    }

    async fn get_session(&self, session_id: Uuid) -> PortResult<Session> {
        let mut state = self.state.lock().await;
        state.session_mut(session_id).map(|s| s.clone())
    }

    async fn find_active_session(
        &self,
        psychologist_id: Uuid,
        date: NaiveDate,
        time: &str,
    ) -> PortResult<Option<Session>> {
        let state = self.state.lock().await;
        Ok(state
            .sessions
            .iter()
            .find(|s| {
                s.psychologist_id == psychologist_id
                    && s.date == date
                    && s.time == time
                    && s.status.holds_slot()
            })
            .cloned())
    }

    async fn find_client_session(
        &self,
        psychologist_id: Uuid,
        client_id: Uuid,
        date: NaiveDate,
        time: &str,
        status: SessionStatus,
    ) -> PortResult<Option<Session>> {
        let state = self.state.lock().await;
        Ok(state
            .sessions
            .iter()
            .rev()
            .find(|s| {
                s.psychologist_id == psychologist_id
                    && s.client_id == client_id
                    && s.date == date
                    && s.time == time
                    && s.status == status
            })
            .cloned())
    }

    async fn list_sessions_for_client(&self, client_id: Uuid) -> PortResult<Vec<Session>> {
        let state = self.state.lock().await;
        let mut sessions: Vec<Session> = state
            .sessions
            .iter()
            .filter(|s| s.client_id == client_id)
            .cloned()
            .collect();
        sessions.sort_by(|a, b| (b.date, &b.time).cmp(&(a.date, &a.time)));
        Ok(sessions)
    }

    async fn set_session_status(
        &self,
        session_id: Uuid,
        status: SessionStatus,
    ) -> PortResult<Session> {
        let mut state = self.state.lock().await;
        let session = state.session_mut(session_id)?;
        session.status = status;
        session.requested_date = None;
        session.requested_time = None;
        Ok(session.clone())
    }

    async fn request_reschedule(
        &self,
        session_id: Uuid,
        date: NaiveDate,
        time: &str,
    ) -> PortResult<Session> {
        let mut state = self.state.lock().await;
        let session = state.session_mut(session_id)?;
        session.status = SessionStatus::RescheduleRequested;
        session.requested_date = Some(date);
        session.requested_time = Some(time.to_string());
        Ok(session.clone())
    }

    async fn move_session(
        &self,
        session_id: Uuid,
        date: NaiveDate,
        time: &str,
    ) -> PortResult<Session> {
        let mut state = self.state.lock().await;
        let current = state.session_mut(session_id)?.clone();
        if state.slot_taken(current.psychologist_id, date, time, Some(session_id)) {
            return Err(PortError::Conflict(format!("Slot {} {} is already booked", date, time)));
        }
        state.release(current.psychologist_id, current.date, &current.time);
        state.consume(current.psychologist_id, date, time);

        let session = state.session_mut(session_id)?;
        session.date = date;
        session.time = time.to_string();
        session.status = SessionStatus::Booked;
        session.reschedule_count += 1;
        session.requested_date = None;
        session.requested_time = None;
        session.meet_link = None;
        session.calendar_event_id = None;
        session.calendar_event_link = None;
        Ok(session.clone())
    }

    async fn cancel_session(&self, session_id: Uuid) -> PortResult<Session> {
        let mut state = self.state.lock().await;
        let session = state.session_mut(session_id)?;
        session.status = SessionStatus::Cancelled;
        session.requested_date = None;
        session.requested_time = None;
        let session = session.clone();
        state.release(session.psychologist_id, session.date, &session.time);
        Ok(session)
    }

    async fn set_session_calendar(
        &self,
        session_id: Uuid,
        event: &CalendarEvent,
    ) -> PortResult<()> {
        let mut state = self.state.lock().await;
        let session = state.session_mut(session_id)?;
        session.meet_link = Some(event.meet_link.clone());
        session.calendar_event_id = event.event_id.clone();
        session.calendar_event_link = event.event_link.clone();
        Ok(())
    }

    async fn create_payment(&self, payment: NewPayment) -> PortResult<Payment> {
        let mut state = self.state.lock().await;
        if state
            .payments
            .iter()
            .any(|p| p.transaction_id == payment.transaction_id)
        {
            return Err(PortError::Conflict(format!(
                "Transaction {} already exists",
                payment.transaction_id
            )));
        }
        let created = Payment {
            id: Uuid::new_v4(),
            transaction_id: payment.transaction_id,
            gateway_payment_id: None,
            psychologist_id: payment.psychologist_id,
            client_id: payment.client_id,
            package_id: payment.package_id,
            date: payment.date,
            time: payment.time,
            amount: payment.amount,
            status: PaymentStatus::Pending,
            session_id: None,
            is_credit: false,
            credit_consumed_at: None,
            created_at: Utc::now(),
        };
        state.payments.push(created.clone());
        Ok(created)
    }

    async fn get_payment_by_transaction(&self, transaction_id: &str) -> PortResult<Payment> {
        let state = self.state.lock().await;
        state
            .payments
            .iter()
            .find(|p| p.transaction_id == transaction_id)
            .cloned()
            .ok_or_else(|| PortError::NotFound(format!("Payment {} not found", transaction_id)))
    }

    async fn get_payment(&self, payment_id: Uuid) -> PortResult<Payment> {
        let mut state = self.state.lock().await;
        state.payment_mut(payment_id).map(|p| p.clone())
    }

    async fn list_open_credits(&self, client_id: Uuid) -> PortResult<Vec<Payment>> {
        let state = self.state.lock().await;
        Ok(state
            .payments
            .iter()
            .filter(|p| p.client_id == client_id && p.is_open_credit())
            .cloned()
            .collect())
    }

    async fn settle_payment(
        &self,
        payment_id: Uuid,
        gateway_payment_id: Option<&str>,
        session: NewSession,
    ) -> PortResult<SettleOutcome> {
        let mut state = self.state.lock().await;
        let payment = state.payment_mut(payment_id)?.clone();
        if payment.status == PaymentStatus::Success {
            return Ok(SettleOutcome::AlreadySettled(payment));
        }

        let (package_id, client_package_id) = match &session.package {
            PackageUse::None => (None, None),
            PackageUse::Open { package_id, .. } => (Some(*package_id), Some(Uuid::new_v4())),
        };
        let created = state.insert_session(&session, Some(payment_id), client_package_id, package_id)?;

        if let (
            PackageUse::Open {
                package_id,
                total_sessions,
            },
            Some(id),
        ) = (&session.package, client_package_id)
        {
            state.client_packages.insert(
                id,
                ClientPackage {
                    id,
                    client_id: session.client_id,
                    package_id: *package_id,
                    psychologist_id: session.psychologist_id,
                    total_sessions: *total_sessions,
                    sessions_used: 1,
                    status: ClientPackageStatus::for_usage(1, *total_sessions),
                },
            );
        }

        let payment = state.payment_mut(payment_id)?;
        payment.status = PaymentStatus::Success;
        payment.session_id = Some(created.id);
        if let Some(gateway_id) = gateway_payment_id {
            payment.gateway_payment_id = Some(gateway_id.to_string());
        }
        let transaction_id = payment.transaction_id.clone();
        if let Some(lock) = state.locks.iter_mut().find(|l| l.order_id == transaction_id) {
            lock.status = SlotLockStatus::SessionCreated;
            lock.session_id = Some(created.id);
        }
        Ok(SettleOutcome::Created(created))
    }

    async fn record_credit(
        &self,
        payment_id: Uuid,
        gateway_payment_id: Option<&str>,
    ) -> PortResult<Payment> {
        let mut state = self.state.lock().await;
        let payment = state.payment_mut(payment_id)?;
        if payment.status != PaymentStatus::Success {
            payment.status = PaymentStatus::Success;
            payment.is_credit = true;
            if let Some(gateway_id) = gateway_payment_id {
                payment.gateway_payment_id = Some(gateway_id.to_string());
            }
        }
        Ok(payment.clone())
    }

    async fn fail_payment(&self, payment_id: Uuid) -> PortResult<Payment> {
        let mut state = self.state.lock().await;
        let payment = state.payment_mut(payment_id)?;
        if payment.status == PaymentStatus::Pending {
            payment.status = PaymentStatus::Failed;
        }
        Ok(payment.clone())
    }

    async fn apply_credit(&self, payment_id: Uuid, session: NewSession) -> PortResult<Session> {
        let mut state = self.state.lock().await;
        let payment = state.payment_mut(payment_id)?.clone();
        if !payment.is_open_credit() {
            return Err(PortError::Conflict(format!(
                "Credit {} has already been used",
                payment.transaction_id
            )));
        }
        let created = state.insert_session(&session, Some(payment_id), None, None)?;
        let payment = state.payment_mut(payment_id)?;
        payment.session_id = Some(created.id);
        payment.credit_consumed_at = Some(Utc::now());
        Ok(created)
    }

    async fn create_slot_lock(&self, lock: NewSlotLock) -> PortResult<SlotLock> {
        let mut state = self.state.lock().await;
        if state.locks.iter().any(|l| l.order_id == lock.order_id) {
            return Err(PortError::Conflict(format!("Order {} already exists", lock.order_id)));
        }
        let created = SlotLock {
            id: Uuid::new_v4(),
            order_id: lock.order_id,
            psychologist_id: lock.psychologist_id,
            client_id: lock.client_id,
            package_id: lock.package_id,
            date: lock.date,
            time: lock.time,
            amount: lock.amount,
            status: SlotLockStatus::SlotHeld,
            session_id: None,
            expires_at: lock.expires_at,
            created_at: Utc::now(),
        };
        state.locks.push(created.clone());
        Ok(created)
    }

    async fn get_slot_lock(&self, order_id: &str) -> PortResult<Option<SlotLock>> {
        let state = self.state.lock().await;
        Ok(state.locks.iter().find(|l| l.order_id == order_id).cloned())
    }

    async fn find_live_locks(
        &self,
        psychologist_id: Uuid,
        date: NaiveDate,
        time: &str,
        now: DateTime<Utc>,
    ) -> PortResult<Vec<SlotLock>> {
        let state = self.state.lock().await;
        Ok(state
            .locks
            .iter()
            .filter(|l| {
                l.psychologist_id == psychologist_id
                    && l.date == date
                    && l.time == time
                    && l.is_live(now)
            })
            .cloned()
            .collect())
    }

    async fn set_slot_lock_status(
        &self,
        order_id: &str,
        status: SlotLockStatus,
    ) -> PortResult<SlotLock> {
        let mut state = self.state.lock().await;
        let lock = state
            .locks
            .iter_mut()
            .find(|l| l.order_id == order_id)
            .ok_or_else(|| PortError::NotFound(format!("Slot lock {} not found", order_id)))?;
        lock.status = status;
        Ok(lock.clone())
    }

    async fn expire_slot_locks(&self, now: DateTime<Utc>) -> PortResult<u64> {
        let mut state = self.state.lock().await;
        let mut expired = 0;
        for lock in state.locks.iter_mut() {
            if lock.status == SlotLockStatus::SlotHeld && lock.expires_at <= now {
                lock.status = SlotLockStatus::Expired;
                expired += 1;
            }
        }
        Ok(expired)
    }

    async fn get_client_package(&self, client_package_id: Uuid) -> PortResult<ClientPackage> {
        self.state
            .lock()
            .await
            .client_packages
            .get(&client_package_id)
            .cloned()
            .ok_or_else(|| PortError::NotFound(format!("Client package {} not found", client_package_id)))
    }

    async fn book_from_package(
        &self,
        client_package_id: Uuid,
        session: NewSession,
    ) -> PortResult<Session> {
        let mut state = self.state.lock().await;
        let bundle = state
            .client_packages
            .get(&client_package_id)
            .cloned()
            .ok_or_else(|| PortError::NotFound(format!("Client package {} not found", client_package_id)))?;
        if bundle.remaining() == 0 {
            return Err(PortError::Conflict(format!(
                "Package {} has no sessions left",
                client_package_id
            )));
        }
        let created = state.insert_session(&session, None, Some(bundle.id), Some(bundle.package_id))?;
        if let Some(bundle) = state.client_packages.get_mut(&client_package_id) {
            bundle.sessions_used += 1;
            bundle.status = ClientPackageStatus::for_usage(bundle.sessions_used, bundle.total_sessions);
        }
        Ok(created)
    }
}
