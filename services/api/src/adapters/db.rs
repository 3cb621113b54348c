//! services/api/src/adapters/db.rs
//!
//! This module contains the database adapter, which is the concrete implementation
//! of the `DatabaseService` port from the `core` crate. It handles all interactions
//! with the PostgreSQL database using `sqlx`.
//!
//! Multi-row booking mutations run in a single transaction. The partial unique index
//! on active sessions is the final arbiter of slot ownership; its violation surfaces
//! as `PortError::Conflict`.

use async_trait::async_trait;
use booking_core::domain::{
    Availability, CalendarEvent, Client, ClientPackage, ClientPackageStatus, NewClient,
    NewPayment, NewSession, NewSlotLock, Package, PackageUse, Payment, PaymentStatus,
    Psychologist, Role, Session, SessionStatus, SlotLock, SlotLockStatus, User, UserCredentials,
};
use booking_core::ports::{DatabaseService, PortError, PortResult, SettleOutcome};
use booking_core::slots;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use uuid::Uuid;

//=========================================================================================
// The Main Adapter Struct
//=========================================================================================

/// A database adapter that implements the `DatabaseService` port.
#[derive(Clone)]
pub struct DbAdapter {
    pool: PgPool,
}

impl DbAdapter {
    /// Creates a new `DbAdapter`.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// A helper function to run database migrations at startup.
    pub async fn run_migrations(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

//=========================================================================================
// Error Mapping
//=========================================================================================

const UNIQUE_VIOLATION: &str = "23505";

fn db_err(e: sqlx::Error) -> PortError {
    match &e {
        sqlx::Error::Database(db) if db.code().as_deref() == Some(UNIQUE_VIOLATION) => {
            PortError::Conflict(db.message().to_string())
        }
        _ => PortError::Unexpected(e.to_string()),
    }
}

fn not_found(what: String) -> impl FnOnce(sqlx::Error) -> PortError {
    move |e| match e {
        sqlx::Error::RowNotFound => PortError::NotFound(what),
        other => db_err(other),
    }
}

fn corrupt(column: &str, value: &str) -> PortError {
    PortError::Unexpected(format!("Unrecognised {} value '{}'", column, value))
}

//=========================================================================================
// "Impure" Database Record Structs
//=========================================================================================

#[derive(FromRow)]
struct UserRecord {
    user_id: Uuid,
    email: String,
    hashed_password: String,
    role: String,
}
impl UserRecord {
    fn role(&self) -> PortResult<Role> {
        Role::parse(&self.role).ok_or_else(|| corrupt("role", &self.role))
    }

    fn to_domain(self) -> PortResult<User> {
        Ok(User {
            role: self.role()?,
            user_id: self.user_id,
            email: self.email,
        })
    }

    fn to_credentials(self) -> PortResult<UserCredentials> {
        Ok(UserCredentials {
            role: self.role()?,
            user_id: self.user_id,
            email: self.email,
            hashed_password: self.hashed_password,
        })
    }
}

#[derive(FromRow)]
struct PsychologistRecord {
    id: Uuid,
    user_id: Option<Uuid>,
    name: String,
    email: String,
    calendar_credentials: Option<String>,
    individual_price: Option<i64>,
}
impl PsychologistRecord {
    fn to_domain(self) -> Psychologist {
        Psychologist {
            id: self.id,
            user_id: self.user_id,
            name: self.name,
            email: self.email,
            calendar_credentials: self.calendar_credentials,
            individual_price: self.individual_price,
        }
    }
}

#[derive(FromRow)]
struct ClientRecord {
    id: Uuid,
    user_id: Option<Uuid>,
    name: String,
    email: Option<String>,
    phone: Option<String>,
}
impl ClientRecord {
    fn to_domain(self) -> Client {
        Client {
            id: self.id,
            user_id: self.user_id,
            name: self.name,
            email: self.email,
            phone: self.phone,
        }
    }
}

#[derive(FromRow)]
struct PackageRecord {
    id: Uuid,
    psychologist_id: Uuid,
    name: String,
    session_count: i32,
    price: i64,
}
impl PackageRecord {
    fn to_domain(self) -> Package {
        Package {
            id: self.id,
            psychologist_id: self.psychologist_id,
            name: self.name,
            session_count: self.session_count,
            price: self.price,
        }
    }
}

#[derive(FromRow)]
struct AvailabilityRecord {
    psychologist_id: Uuid,
    date: NaiveDate,
    slots: Vec<String>,
}
impl AvailabilityRecord {
    fn to_domain(self) -> Availability {
        Availability {
            psychologist_id: self.psychologist_id,
            date: self.date,
            slots: self.slots,
        }
    }
}

const SESSION_COLUMNS: &str = "id, psychologist_id, client_id, session_date, session_time, status, \
     package_id, client_package_id, payment_id, price, meet_link, calendar_event_id, \
     calendar_event_link, reschedule_count, requested_date, requested_time, created_at";

#[derive(FromRow)]
struct SessionRecord {
    id: Uuid,
    psychologist_id: Uuid,
    client_id: Uuid,
    session_date: NaiveDate,
    session_time: String,
    status: String,
    package_id: Option<Uuid>,
    client_package_id: Option<Uuid>,
    payment_id: Option<Uuid>,
    price: i64,
    meet_link: Option<String>,
    calendar_event_id: Option<String>,
    calendar_event_link: Option<String>,
    reschedule_count: i32,
    requested_date: Option<NaiveDate>,
    requested_time: Option<String>,
    created_at: DateTime<Utc>,
}
impl SessionRecord {
    fn to_domain(self) -> PortResult<Session> {
        let status =
            SessionStatus::parse(&self.status).ok_or_else(|| corrupt("session status", &self.status))?;
        Ok(Session {
            id: self.id,
            psychologist_id: self.psychologist_id,
            client_id: self.client_id,
            date: self.session_date,
            time: self.session_time,
            status,
            package_id: self.package_id,
            client_package_id: self.client_package_id,
            payment_id: self.payment_id,
            price: self.price,
            meet_link: self.meet_link,
            calendar_event_id: self.calendar_event_id,
            calendar_event_link: self.calendar_event_link,
            reschedule_count: self.reschedule_count,
            requested_date: self.requested_date,
            requested_time: self.requested_time,
            created_at: self.created_at,
        })
    }
}

const PAYMENT_COLUMNS: &str = "id, transaction_id, gateway_payment_id, psychologist_id, client_id, \
     package_id, session_date, session_time, amount, status, session_id, is_credit, \
     credit_consumed_at, created_at";

#[derive(FromRow)]
struct PaymentRecord {
    id: Uuid,
    transaction_id: String,
    gateway_payment_id: Option<String>,
    psychologist_id: Uuid,
    client_id: Uuid,
    package_id: Option<Uuid>,
    session_date: NaiveDate,
    session_time: String,
    amount: i64,
    status: String,
    session_id: Option<Uuid>,
    is_credit: bool,
    credit_consumed_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}
impl PaymentRecord {
    fn to_domain(self) -> PortResult<Payment> {
        let status =
            PaymentStatus::parse(&self.status).ok_or_else(|| corrupt("payment status", &self.status))?;
        Ok(Payment {
            id: self.id,
            transaction_id: self.transaction_id,
            gateway_payment_id: self.gateway_payment_id,
            psychologist_id: self.psychologist_id,
            client_id: self.client_id,
            package_id: self.package_id,
            date: self.session_date,
            time: self.session_time,
            amount: self.amount,
            status,
            session_id: self.session_id,
            is_credit: self.is_credit,
            credit_consumed_at: self.credit_consumed_at,
            created_at: self.created_at,
        })
    }
}

const LOCK_COLUMNS: &str = "id, order_id, psychologist_id, client_id, package_id, session_date, \
     session_time, amount, status, session_id, expires_at, created_at";

#[derive(FromRow)]
struct SlotLockRecord {
    id: Uuid,
    order_id: String,
    psychologist_id: Uuid,
    client_id: Uuid,
    package_id: Option<Uuid>,
    session_date: NaiveDate,
    session_time: String,
    amount: i64,
    status: String,
    session_id: Option<Uuid>,
    expires_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
}
impl SlotLockRecord {
    fn to_domain(self) -> PortResult<SlotLock> {
        let status =
            SlotLockStatus::parse(&self.status).ok_or_else(|| corrupt("slot lock status", &self.status))?;
        Ok(SlotLock {
            id: self.id,
            order_id: self.order_id,
            psychologist_id: self.psychologist_id,
            client_id: self.client_id,
            package_id: self.package_id,
            date: self.session_date,
            time: self.session_time,
            amount: self.amount,
            status,
            session_id: self.session_id,
            expires_at: self.expires_at,
            created_at: self.created_at,
        })
    }
}

const CLIENT_PACKAGE_COLUMNS: &str =
    "id, client_id, package_id, psychologist_id, total_sessions, sessions_used, status";

#[derive(FromRow)]
struct ClientPackageRecord {
    id: Uuid,
    client_id: Uuid,
    package_id: Uuid,
    psychologist_id: Uuid,
    total_sessions: i32,
    sessions_used: i32,
    status: String,
}
impl ClientPackageRecord {
    fn to_domain(self) -> PortResult<ClientPackage> {
        let status = ClientPackageStatus::parse(&self.status)
            .ok_or_else(|| corrupt("client package status", &self.status))?;
        Ok(ClientPackage {
            id: self.id,
            client_id: self.client_id,
            package_id: self.package_id,
            psychologist_id: self.psychologist_id,
            total_sessions: self.total_sessions,
            sessions_used: self.sessions_used,
            status,
        })
    }
}

//=========================================================================================
// Transaction Helpers
//=========================================================================================

async fn lock_slots(
    tx: &mut Transaction<'_, Postgres>,
    psychologist_id: Uuid,
    date: NaiveDate,
) -> PortResult<Option<Vec<String>>> {
    let row: Option<(Vec<String>,)> = sqlx::query_as(
        "SELECT slots FROM availability WHERE psychologist_id = $1 AND date = $2 FOR UPDATE",
    )
    .bind(psychologist_id)
    .bind(date)
    .fetch_optional(&mut **tx)
    .await
    .map_err(db_err)?;
    Ok(row.map(|(s,)| s))
}

async fn write_slots(
    tx: &mut Transaction<'_, Postgres>,
    psychologist_id: Uuid,
    date: NaiveDate,
    slots: &[String],
) -> PortResult<()> {
    sqlx::query(
        "INSERT INTO availability (psychologist_id, date, slots) VALUES ($1, $2, $3) \
         ON CONFLICT (psychologist_id, date) DO UPDATE SET slots = EXCLUDED.slots, updated_at = NOW()",
    )
    .bind(psychologist_id)
    .bind(date)
    .bind(slots)
    .execute(&mut **tx)
    .await
    .map_err(db_err)?;
    Ok(())
}

async fn consume_in(
    tx: &mut Transaction<'_, Postgres>,
    psychologist_id: Uuid,
    date: NaiveDate,
    time: &str,
) -> PortResult<()> {
    if let Some(mut list) = lock_slots(tx, psychologist_id, date).await? {
        if slots::consume(&mut list, time) {
            write_slots(tx, psychologist_id, date, &list).await?;
        }
    }
    Ok(())
}

async fn release_in(
    tx: &mut Transaction<'_, Postgres>,
    psychologist_id: Uuid,
    date: NaiveDate,
    time: &str,
) -> PortResult<()> {
    let mut list = lock_slots(tx, psychologist_id, date).await?.unwrap_or_default();
    if slots::release(&mut list, time) {
        write_slots(tx, psychologist_id, date, &list).await?;
    }
    Ok(())
}

async fn insert_session(
    tx: &mut Transaction<'_, Postgres>,
    session: &NewSession,
    payment_id: Option<Uuid>,
    client_package_id: Option<Uuid>,
    package_id: Option<Uuid>,
) -> PortResult<Session> {
    let sql = format!(
        "INSERT INTO sessions (id, psychologist_id, client_id, session_date, session_time, status, \
         package_id, client_package_id, payment_id, price) \
         VALUES ($1, $2, $3, $4, $5, 'booked', $6, $7, $8, $9) RETURNING {}",
        SESSION_COLUMNS
    );
    let record: SessionRecord = sqlx::query_as(&sql)
        .bind(Uuid::new_v4())
        .bind(session.psychologist_id)
        .bind(session.client_id)
        .bind(session.date)
        .bind(&session.time)
        .bind(package_id)
        .bind(client_package_id)
        .bind(payment_id)
        .bind(session.price)
        .fetch_one(&mut **tx)
        .await
        .map_err(db_err)?;
    record.to_domain()
}

async fn lock_payment(tx: &mut Transaction<'_, Postgres>, payment_id: Uuid) -> PortResult<Payment> {
    let sql = format!("SELECT {} FROM payments WHERE id = $1 FOR UPDATE", PAYMENT_COLUMNS);
    let record: PaymentRecord = sqlx::query_as(&sql)
        .bind(payment_id)
        .fetch_one(&mut **tx)
        .await
        .map_err(not_found(format!("Payment {} not found", payment_id)))?;
    record.to_domain()
}

//=========================================================================================
// `DatabaseService` Trait Implementation
//=========================================================================================

#[async_trait]
impl DatabaseService for DbAdapter {
    async fn create_user_with_email(
        &self,
        email: &str,
        hashed_password: &str,
        role: Role,
    ) -> PortResult<User> {
        let record: UserRecord = sqlx::query_as(
            "INSERT INTO users (user_id, email, hashed_password, role) VALUES ($1, $2, $3, $4) \
             RETURNING user_id, email, hashed_password, role",
        )
        .bind(Uuid::new_v4())
        .bind(email)
        .bind(hashed_password)
        .bind(role.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        record.to_domain()
    }

    async fn get_user_by_email(&self, email: &str) -> PortResult<UserCredentials> {
        let record: UserRecord = sqlx::query_as(
            "SELECT user_id, email, hashed_password, role FROM users WHERE lower(email) = lower($1)",
        )
        .bind(email)
        .fetch_one(&self.pool)
        .await
        .map_err(not_found(format!("User {} not found", email)))?;
        record.to_credentials()
    }

    async fn create_auth_session(
        &self,
        session_id: &str,
        user_id: Uuid,
        expires_at: DateTime<Utc>,
    ) -> PortResult<()> {
        sqlx::query("INSERT INTO auth_sessions (id, user_id, expires_at) VALUES ($1, $2, $3)")
            .bind(session_id)
            .bind(user_id)
            .bind(expires_at)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn validate_auth_session(&self, session_id: &str) -> PortResult<User> {
        let record: Option<UserRecord> = sqlx::query_as(
            "SELECT u.user_id, u.email, u.hashed_password, u.role FROM auth_sessions s \
             JOIN users u ON u.user_id = s.user_id WHERE s.id = $1 AND s.expires_at > NOW()",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        record.ok_or(PortError::Unauthorized)?.to_domain()
    }

    async fn delete_auth_session(&self, session_id: &str) -> PortResult<()> {
        sqlx::query("DELETE FROM auth_sessions WHERE id = $1")
            .bind(session_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn get_psychologist(&self, psychologist_id: Uuid) -> PortResult<Psychologist> {
        let record: PsychologistRecord = sqlx::query_as(
            "SELECT id, user_id, name, email, calendar_credentials, individual_price \
             FROM psychologists WHERE id = $1",
        )
        .bind(psychologist_id)
        .fetch_one(&self.pool)
        .await
        .map_err(not_found(format!("Psychologist {} not found", psychologist_id)))?;
        Ok(record.to_domain())
    }

    async fn find_psychologist_by_user(&self, user_id: Uuid) -> PortResult<Option<Psychologist>> {
        let record: Option<PsychologistRecord> = sqlx::query_as(
            "SELECT id, user_id, name, email, calendar_credentials, individual_price \
             FROM psychologists WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(record.map(PsychologistRecord::to_domain))
    }

    async fn get_package(&self, package_id: Uuid) -> PortResult<Package> {
        let record: PackageRecord = sqlx::query_as(
            "SELECT id, psychologist_id, name, session_count, price FROM packages WHERE id = $1",
        )
        .bind(package_id)
        .fetch_one(&self.pool)
        .await
        .map_err(not_found(format!("Package {} not found", package_id)))?;
        Ok(record.to_domain())
    }

    async fn create_client(&self, client: NewClient) -> PortResult<Client> {
        let record: ClientRecord = sqlx::query_as(
            "INSERT INTO clients (id, user_id, name, email, phone) VALUES ($1, $2, $3, $4, $5) \
             RETURNING id, user_id, name, email, phone",
        )
        .bind(Uuid::new_v4())
        .bind(client.user_id)
        .bind(&client.name)
        .bind(&client.email)
        .bind(&client.phone)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(record.to_domain())
    }

    async fn get_client(&self, client_id: Uuid) -> PortResult<Client> {
        let record: ClientRecord =
            sqlx::query_as("SELECT id, user_id, name, email, phone FROM clients WHERE id = $1")
                .bind(client_id)
                .fetch_one(&self.pool)
                .await
                .map_err(not_found(format!("Client {} not found", client_id)))?;
        Ok(record.to_domain())
    }

    async fn find_client_by_user(&self, user_id: Uuid) -> PortResult<Option<Client>> {
        let record: Option<ClientRecord> = sqlx::query_as(
            "SELECT id, user_id, name, email, phone FROM clients WHERE user_id = $1 \
             ORDER BY created_at LIMIT 1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(record.map(ClientRecord::to_domain))
    }

    async fn find_client_by_email(&self, email: &str) -> PortResult<Option<Client>> {
        let record: Option<ClientRecord> = sqlx::query_as(
            "SELECT id, user_id, name, email, phone FROM clients WHERE lower(email) = lower($1) \
             ORDER BY created_at LIMIT 1",
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(record.map(ClientRecord::to_domain))
    }

    async fn find_client_by_phone(&self, phone: &str) -> PortResult<Option<Client>> {
        let record: Option<ClientRecord> = sqlx::query_as(
            "SELECT id, user_id, name, email, phone FROM clients \
             WHERE regexp_replace(coalesce(phone, ''), '\\D', '', 'g') = $1 \
             ORDER BY created_at LIMIT 1",
        )
        .bind(phone)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(record.map(ClientRecord::to_domain))
    }

    async fn link_client_user(&self, client_id: Uuid, user_id: Uuid) -> PortResult<Client> {
        let record: ClientRecord = sqlx::query_as(
            "UPDATE clients SET user_id = $2 \
             WHERE id = $1 AND (user_id IS NULL OR user_id = $2) \
             RETURNING id, user_id, name, email, phone",
        )
        .bind(client_id)
        .bind(user_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::RowNotFound => {
                PortError::Conflict(format!("Client {} is linked to another account", client_id))
            }
            other => db_err(other),
        })?;
        Ok(record.to_domain())
    }

    async fn get_availability(
        &self,
        psychologist_id: Uuid,
        date: NaiveDate,
    ) -> PortResult<Option<Availability>> {
        let record: Option<AvailabilityRecord> = sqlx::query_as(
            "SELECT psychologist_id, date, slots FROM availability \
             WHERE psychologist_id = $1 AND date = $2",
        )
        .bind(psychologist_id)
        .bind(date)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(record.map(AvailabilityRecord::to_domain))
    }

    async fn set_availability(
        &self,
        psychologist_id: Uuid,
        date: NaiveDate,
        slots: Vec<String>,
    ) -> PortResult<Availability> {
        let record: AvailabilityRecord = sqlx::query_as(
            "INSERT INTO availability (psychologist_id, date, slots) VALUES ($1, $2, $3) \
             ON CONFLICT (psychologist_id, date) DO UPDATE SET slots = EXCLUDED.slots, updated_at = NOW() \
             RETURNING psychologist_id, date, slots",
        )
        .bind(psychologist_id)
        .bind(date)
        .bind(&slots)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(record.to_domain())
    }

    async fn consume_slot(
        &self,
        psychologist_id: Uuid,
        date: NaiveDate,
        time: &str,
    ) -> PortResult<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        consume_in(&mut tx, psychologist_id, date, time).await?;
        tx.commit().await.map_err(db_err)
    }

    async fn release_slot(
        &self,
        psychologist_id: Uuid,
        date: NaiveDate,
        time: &str,
    ) -> PortResult<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        release_in(&mut tx, psychologist_id, date, time).await?;
        tx.commit().await.map_err(db_err)
    }

    async fn get_session(&self, session_id: Uuid) -> PortResult<Session> {
        let sql = format!("SELECT {} FROM sessions WHERE id = $1", SESSION_COLUMNS);
        let record: SessionRecord = sqlx::query_as(&sql)
            .bind(session_id)
            .fetch_one(&self.pool)
            .await
            .map_err(not_found(format!("Session {} not found", session_id)))?;
        record.to_domain()
    }

    async fn find_active_session(
        &self,
        psychologist_id: Uuid,
        date: NaiveDate,
        time: &str,
    ) -> PortResult<Option<Session>> {
        let sql = format!(
            "SELECT {} FROM sessions WHERE psychologist_id = $1 AND session_date = $2 \
             AND session_time = $3 AND status IN ('booked', 'reschedule_requested') LIMIT 1",
            SESSION_COLUMNS
        );
        let record: Option<SessionRecord> = sqlx::query_as(&sql)
            .bind(psychologist_id)
            .bind(date)
            .bind(time)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        record.map(SessionRecord::to_domain).transpose()
    }

    async fn find_client_session(
        &self,
        psychologist_id: Uuid,
        client_id: Uuid,
        date: NaiveDate,
        time: &str,
        status: SessionStatus,
    ) -> PortResult<Option<Session>> {
        let sql = format!(
            "SELECT {} FROM sessions WHERE psychologist_id = $1 AND client_id = $2 \
             AND session_date = $3 AND session_time = $4 AND status = $5 \
             ORDER BY created_at DESC LIMIT 1",
            SESSION_COLUMNS
        );
        let record: Option<SessionRecord> = sqlx::query_as(&sql)
            .bind(psychologist_id)
            .bind(client_id)
            .bind(date)
            .bind(time)
            .bind(status.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        record.map(SessionRecord::to_domain).transpose()
    }

    async fn list_sessions_for_client(&self, client_id: Uuid) -> PortResult<Vec<Session>> {
        let sql = format!(
            "SELECT {} FROM sessions WHERE client_id = $1 \
             ORDER BY session_date DESC, session_time DESC",
            SESSION_COLUMNS
        );
        let records: Vec<SessionRecord> = sqlx::query_as(&sql)
            .bind(client_id)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        records.into_iter().map(|r| r.to_domain()).collect()
    }

    async fn set_session_status(
        &self,
        session_id: Uuid,
        status: SessionStatus,
    ) -> PortResult<Session> {
        let sql = format!(
            "UPDATE sessions SET status = $2, requested_date = NULL, requested_time = NULL, \
             updated_at = NOW() WHERE id = $1 RETURNING {}",
            SESSION_COLUMNS
        );
        let record: SessionRecord = sqlx::query_as(&sql)
            .bind(session_id)
            .bind(status.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(not_found(format!("Session {} not found", session_id)))?;
        record.to_domain()
    }

    async fn request_reschedule(
        &self,
        session_id: Uuid,
        date: NaiveDate,
        time: &str,
    ) -> PortResult<Session> {
        let sql = format!(
            "UPDATE sessions SET status = 'reschedule_requested', requested_date = $2, \
             requested_time = $3, updated_at = NOW() WHERE id = $1 RETURNING {}",
            SESSION_COLUMNS
        );
        let record: SessionRecord = sqlx::query_as(&sql)
            .bind(session_id)
            .bind(date)
            .bind(time)
            .fetch_one(&self.pool)
            .await
            .map_err(not_found(format!("Session {} not found", session_id)))?;
        record.to_domain()
    }

    async fn move_session(
        &self,
        session_id: Uuid,
        date: NaiveDate,
        time: &str,
    ) -> PortResult<Session> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let sql = format!("SELECT {} FROM sessions WHERE id = $1 FOR UPDATE", SESSION_COLUMNS);
        let current: SessionRecord = sqlx::query_as(&sql)
            .bind(session_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(not_found(format!("Session {} not found", session_id)))?;
        let current = current.to_domain()?;

        let sql = format!(
            "UPDATE sessions SET session_date = $2, session_time = $3, status = 'booked', \
             reschedule_count = reschedule_count + 1, requested_date = NULL, requested_time = NULL, \
             meet_link = NULL, calendar_event_id = NULL, calendar_event_link = NULL, \
             updated_at = NOW() WHERE id = $1 RETURNING {}",
            SESSION_COLUMNS
        );
        let moved: SessionRecord = sqlx::query_as(&sql)
            .bind(session_id)
            .bind(date)
            .bind(time)
            .fetch_one(&mut *tx)
            .await
            .map_err(db_err)?;

        release_in(&mut tx, current.psychologist_id, current.date, &current.time).await?;
        consume_in(&mut tx, current.psychologist_id, date, time).await?;
        tx.commit().await.map_err(db_err)?;
        moved.to_domain()
    }

    async fn cancel_session(&self, session_id: Uuid) -> PortResult<Session> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let sql = format!(
            "UPDATE sessions SET status = 'cancelled', requested_date = NULL, requested_time = NULL, \
             updated_at = NOW() WHERE id = $1 RETURNING {}",
            SESSION_COLUMNS
        );
        let record: SessionRecord = sqlx::query_as(&sql)
            .bind(session_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(not_found(format!("Session {} not found", session_id)))?;
        let session = record.to_domain()?;
        release_in(&mut tx, session.psychologist_id, session.date, &session.time).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(session)
    }

    async fn set_session_calendar(
        &self,
        session_id: Uuid,
        event: &CalendarEvent,
    ) -> PortResult<()> {
        sqlx::query(
            "UPDATE sessions SET meet_link = $2, calendar_event_id = $3, calendar_event_link = $4, \
             updated_at = NOW() WHERE id = $1",
        )
        .bind(session_id)
        .bind(&event.meet_link)
        .bind(&event.event_id)
        .bind(&event.event_link)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn create_payment(&self, payment: NewPayment) -> PortResult<Payment> {
        let sql = format!(
            "INSERT INTO payments (id, transaction_id, psychologist_id, client_id, package_id, \
             session_date, session_time, amount, status) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 'pending') RETURNING {}",
            PAYMENT_COLUMNS
        );
        let record: PaymentRecord = sqlx::query_as(&sql)
            .bind(Uuid::new_v4())
            .bind(&payment.transaction_id)
            .bind(payment.psychologist_id)
            .bind(payment.client_id)
            .bind(payment.package_id)
            .bind(payment.date)
            .bind(&payment.time)
            .bind(payment.amount)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
        record.to_domain()
    }

    async fn get_payment_by_transaction(&self, transaction_id: &str) -> PortResult<Payment> {
        let sql = format!("SELECT {} FROM payments WHERE transaction_id = $1", PAYMENT_COLUMNS);
        let record: PaymentRecord = sqlx::query_as(&sql)
            .bind(transaction_id)
            .fetch_one(&self.pool)
            .await
            .map_err(not_found(format!("Payment {} not found", transaction_id)))?;
        record.to_domain()
    }

    async fn get_payment(&self, payment_id: Uuid) -> PortResult<Payment> {
        let sql = format!("SELECT {} FROM payments WHERE id = $1", PAYMENT_COLUMNS);
        let record: PaymentRecord = sqlx::query_as(&sql)
            .bind(payment_id)
            .fetch_one(&self.pool)
            .await
            .map_err(not_found(format!("Payment {} not found", payment_id)))?;
        record.to_domain()
    }

    async fn list_open_credits(&self, client_id: Uuid) -> PortResult<Vec<Payment>> {
        let sql = format!(
            "SELECT {} FROM payments WHERE client_id = $1 AND status = 'success' AND is_credit \
             AND session_id IS NULL AND credit_consumed_at IS NULL ORDER BY created_at",
            PAYMENT_COLUMNS
        );
        let records: Vec<PaymentRecord> = sqlx::query_as(&sql)
            .bind(client_id)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        records.into_iter().map(|r| r.to_domain()).collect()
    }

    async fn settle_payment(
        &self,
        payment_id: Uuid,
        gateway_payment_id: Option<&str>,
        session: NewSession,
    ) -> PortResult<SettleOutcome> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        // 1. Re-check the payment under a row lock. A capture reported after a
        // failure callback is still settled.
        let payment = lock_payment(&mut tx, payment_id).await?;
        if payment.status == PaymentStatus::Success {
            return Ok(SettleOutcome::AlreadySettled(payment));
        }

        // 2. Open the bundle when this is the first session of a package purchase.
        let (package_id, client_package_id) = match &session.package {
            PackageUse::None => (None, None),
            PackageUse::Open {
                package_id,
                total_sessions,
            } => {
                let id = Uuid::new_v4();
                sqlx::query(
                    "INSERT INTO client_packages (id, client_id, package_id, psychologist_id, \
                     total_sessions, sessions_used, status) VALUES ($1, $2, $3, $4, $5, 1, $6)",
                )
                .bind(id)
                .bind(session.client_id)
                .bind(package_id)
                .bind(session.psychologist_id)
                .bind(total_sessions)
                .bind(ClientPackageStatus::for_usage(1, *total_sessions).as_str())
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
                (Some(*package_id), Some(id))
            }
        };

        // 3. Insert the session; the unique index rejects a taken slot.
        let created =
            insert_session(&mut tx, &session, Some(payment_id), client_package_id, package_id).await?;

        // 4. Consume the slot and settle the payment and lock.
        consume_in(&mut tx, session.psychologist_id, session.date, &session.time).await?;
        sqlx::query(
            "UPDATE payments SET status = 'success', session_id = $2, \
             gateway_payment_id = COALESCE($3, gateway_payment_id), updated_at = NOW() WHERE id = $1",
        )
        .bind(payment_id)
        .bind(created.id)
        .bind(gateway_payment_id)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        sqlx::query(
            "UPDATE slot_locks SET status = 'SESSION_CREATED', session_id = $2, updated_at = NOW() \
             WHERE order_id = $1",
        )
        .bind(&payment.transaction_id)
        .bind(created.id)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(SettleOutcome::Created(created))
    }

    async fn record_credit(
        &self,
        payment_id: Uuid,
        gateway_payment_id: Option<&str>,
    ) -> PortResult<Payment> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let payment = lock_payment(&mut tx, payment_id).await?;
        if payment.status == PaymentStatus::Success {
            return Ok(payment);
        }
        let sql = format!(
            "UPDATE payments SET status = 'success', is_credit = TRUE, \
             gateway_payment_id = COALESCE($2, gateway_payment_id), updated_at = NOW() \
             WHERE id = $1 RETURNING {}",
            PAYMENT_COLUMNS
        );
        let record: PaymentRecord = sqlx::query_as(&sql)
            .bind(payment_id)
            .bind(gateway_payment_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        record.to_domain()
    }

    async fn fail_payment(&self, payment_id: Uuid) -> PortResult<Payment> {
        let sql = format!(
            "UPDATE payments SET status = 'failed', updated_at = NOW() \
             WHERE id = $1 AND status = 'pending' RETURNING {}",
            PAYMENT_COLUMNS
        );
        let record: Option<PaymentRecord> = sqlx::query_as(&sql)
            .bind(payment_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        match record {
            Some(record) => record.to_domain(),
            None => self.get_payment(payment_id).await,
        }
    }

    async fn apply_credit(&self, payment_id: Uuid, session: NewSession) -> PortResult<Session> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let payment = lock_payment(&mut tx, payment_id).await?;
        if !payment.is_open_credit() {
            return Err(PortError::Conflict(format!(
                "Credit {} has already been used",
                payment.transaction_id
            )));
        }
        let created = insert_session(&mut tx, &session, Some(payment_id), None, None).await?;
        consume_in(&mut tx, session.psychologist_id, session.date, &session.time).await?;
        sqlx::query(
            "UPDATE payments SET session_id = $2, credit_consumed_at = NOW(), updated_at = NOW() \
             WHERE id = $1",
        )
        .bind(payment_id)
        .bind(created.id)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        Ok(created)
    }

    async fn create_slot_lock(&self, lock: NewSlotLock) -> PortResult<SlotLock> {
        let sql = format!(
            "INSERT INTO slot_locks (id, order_id, psychologist_id, client_id, package_id, \
             session_date, session_time, amount, status, expires_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 'SLOT_HELD', $9) RETURNING {}",
            LOCK_COLUMNS
        );
        let record: SlotLockRecord = sqlx::query_as(&sql)
            .bind(Uuid::new_v4())
            .bind(&lock.order_id)
            .bind(lock.psychologist_id)
            .bind(lock.client_id)
            .bind(lock.package_id)
            .bind(lock.date)
            .bind(&lock.time)
            .bind(lock.amount)
            .bind(lock.expires_at)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
        record.to_domain()
    }

    async fn get_slot_lock(&self, order_id: &str) -> PortResult<Option<SlotLock>> {
        let sql = format!("SELECT {} FROM slot_locks WHERE order_id = $1", LOCK_COLUMNS);
        let record: Option<SlotLockRecord> = sqlx::query_as(&sql)
            .bind(order_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        record.map(SlotLockRecord::to_domain).transpose()
    }

    async fn find_live_locks(
        &self,
        psychologist_id: Uuid,
        date: NaiveDate,
        time: &str,
        now: DateTime<Utc>,
    ) -> PortResult<Vec<SlotLock>> {
        let sql = format!(
            "SELECT {} FROM slot_locks WHERE psychologist_id = $1 AND session_date = $2 \
             AND session_time = $3 AND ((status IN ('SLOT_HELD', 'PAYMENT_PENDING') AND expires_at > $4) \
             OR status = 'PAYMENT_SUCCESS') ORDER BY created_at",
            LOCK_COLUMNS
        );
        let records: Vec<SlotLockRecord> = sqlx::query_as(&sql)
            .bind(psychologist_id)
            .bind(date)
            .bind(time)
            .bind(now)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        records.into_iter().map(|r| r.to_domain()).collect()
    }

    async fn set_slot_lock_status(
        &self,
        order_id: &str,
        status: SlotLockStatus,
    ) -> PortResult<SlotLock> {
        let sql = format!(
            "UPDATE slot_locks SET status = $2, updated_at = NOW() WHERE order_id = $1 RETURNING {}",
            LOCK_COLUMNS
        );
        let record: SlotLockRecord = sqlx::query_as(&sql)
            .bind(order_id)
            .bind(status.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(not_found(format!("Slot lock {} not found", order_id)))?;
        record.to_domain()
    }

    async fn expire_slot_locks(&self, now: DateTime<Utc>) -> PortResult<u64> {
        let result = sqlx::query(
            "UPDATE slot_locks SET status = 'EXPIRED', updated_at = NOW() \
             WHERE status = 'SLOT_HELD' AND expires_at <= $1",
        )
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected())
    }

    async fn get_client_package(&self, client_package_id: Uuid) -> PortResult<ClientPackage> {
        let sql = format!(
            "SELECT {} FROM client_packages WHERE id = $1",
            CLIENT_PACKAGE_COLUMNS
        );
        let record: ClientPackageRecord = sqlx::query_as(&sql)
            .bind(client_package_id)
            .fetch_one(&self.pool)
            .await
            .map_err(not_found(format!("Client package {} not found", client_package_id)))?;
        record.to_domain()
    }

    async fn book_from_package(
        &self,
        client_package_id: Uuid,
        session: NewSession,
    ) -> PortResult<Session> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let sql = format!(
            "SELECT {} FROM client_packages WHERE id = $1 FOR UPDATE",
            CLIENT_PACKAGE_COLUMNS
        );
        let record: ClientPackageRecord = sqlx::query_as(&sql)
            .bind(client_package_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(not_found(format!("Client package {} not found", client_package_id)))?;
        let bundle = record.to_domain()?;
        if bundle.remaining() == 0 {
            return Err(PortError::Conflict(format!(
                "Package {} has no sessions left",
                client_package_id
            )));
        }

        let created = insert_session(
            &mut tx,
            &session,
            None,
            Some(bundle.id),
            Some(bundle.package_id),
        )
        .await?;
        consume_in(&mut tx, session.psychologist_id, session.date, &session.time).await?;

        let used = bundle.sessions_used + 1;
        sqlx::query("UPDATE client_packages SET sessions_used = $2, status = $3 WHERE id = $1")
            .bind(bundle.id)
            .bind(used)
            .bind(ClientPackageStatus::for_usage(used, bundle.total_sessions).as_str())
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(created)
    }
}
