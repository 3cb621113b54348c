//! Shared fixtures for the integration tests: in-memory storage, a gateway that
//! signs like the real one but answers status checks from a table, a calendar
//! that never leaves the process, and a clock the tests can move.
#![allow(dead_code)]

use api_lib::{
    adapters::{payu, InMemoryDatabase, PayuGateway},
    booking::{AuthContext, BookingService, BookingSettings, PaymentOutcome, ReserveRequest},
    config::Config,
    outbox::MemoryOutbox,
};
use async_trait::async_trait;
use booking_core::domain::{
    CalendarEvent, NewClient, Package, Psychologist, Role, Session,
};
use booking_core::ports::{
    CalendarEventRequest, CalendarService, CheckoutForm, CheckoutRequest, Clock,
    DatabaseService, Delivery, GatewayCallback, GatewayPayment, GatewayPaymentState,
    NotificationSender, OutboundMessage, PaymentGateway, PortError, PortResult,
};
use booking_core::slots::BusyInterval;
use chrono::{DateTime, Duration, NaiveDate, Timelike, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

pub const KEY: &str = "testkey";
pub const SALT: &str = "testsalt";
pub const PRICE: i64 = 150_000;
pub const MEET_LINK: &str = "https://meet.test/abc-defg-hij";

pub fn test_config() -> Config {
    let vars: HashMap<&str, &str> = HashMap::from([
        ("DATABASE_URL", "postgres://unused"),
        ("PAYU_KEY", KEY),
        ("PAYU_SALT", SALT),
        ("FRONTEND_URL", "https://app.test"),
        ("ADMIN_EMAIL", "admin@clinic.test"),
    ]);
    Config::from_lookup(|name| vars.get(name).map(|v| v.to_string()))
        .expect("test configuration is valid")
}

//=========================================================================================
// Clock
//=========================================================================================

pub struct TestClock(Mutex<DateTime<Utc>>);

impl TestClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self(Mutex::new(now))
    }

    pub fn advance(&self, by: Duration) {
        *self.0.lock().unwrap() += by;
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.0.lock().unwrap() = now;
    }
}

impl Clock for TestClock {
    fn now(&self) -> DateTime<Utc> {
        *self.0.lock().unwrap()
    }
}

//=========================================================================================
// Gateway
//=========================================================================================

/// Signs forms and checks hashes with the real PayU code; status checks are scripted.
pub struct FakeGateway {
    inner: PayuGateway,
    remote: Mutex<HashMap<String, GatewayPayment>>,
}

impl FakeGateway {
    pub fn new(config: &Config) -> Self {
        let inner = PayuGateway::new(
            config.gateway.clone(),
            &config.public_base_url,
            std::time::Duration::from_secs(1),
        )
        .expect("http client builds");
        Self {
            inner,
            remote: Mutex::new(HashMap::new()),
        }
    }

    /// What the next status check for `transaction_id` reports.
    pub fn script(&self, transaction_id: &str, state: GatewayPaymentState, amount: Option<i64>) {
        self.remote.lock().unwrap().insert(
            transaction_id.to_string(),
            GatewayPayment {
                transaction_id: transaction_id.to_string(),
                gateway_payment_id: Some(format!("mih-{}", transaction_id)),
                state,
                amount,
            },
        );
    }
}

#[async_trait]
impl PaymentGateway for FakeGateway {
    fn create_order(&self, request: &CheckoutRequest) -> PortResult<CheckoutForm> {
        self.inner.create_order(request)
    }

    fn verify_callback(&self, callback: &GatewayCallback) -> bool {
        self.inner.verify_callback(callback)
    }

    async fn fetch_payment(&self, transaction_id: &str) -> PortResult<GatewayPayment> {
        Ok(self
            .remote
            .lock()
            .unwrap()
            .get(transaction_id)
            .cloned()
            .unwrap_or(GatewayPayment {
                transaction_id: transaction_id.to_string(),
                gateway_payment_id: None,
                state: GatewayPaymentState::Pending,
                amount: None,
            }))
    }
}

/// A callback as the gateway would post it, signed with the test salt.
pub fn signed_callback(form: &CheckoutForm, status: &str) -> GatewayCallback {
    let field = |name: &str| {
        form.params
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.clone())
            .unwrap_or_default()
    };
    let mut callback = GatewayCallback {
        transaction_id: field("txnid"),
        gateway_payment_id: Some(format!("mih-{}", field("txnid"))),
        status: status.to_string(),
        amount: field("amount"),
        product_info: field("productinfo"),
        first_name: field("firstname"),
        email: field("email"),
        udf: [
            field("udf1"),
            field("udf2"),
            field("udf3"),
            field("udf4"),
            field("udf5"),
        ],
        additional_charges: None,
        hash: String::new(),
    };
    callback.hash = payu::response_hash(KEY, SALT, &callback);
    callback
}

//=========================================================================================
// Calendar and Senders
//=========================================================================================

#[derive(Default)]
pub struct FakeCalendar {
    pub created: Mutex<Vec<CalendarEventRequest>>,
    pub busy: Mutex<Vec<BusyInterval>>,
    /// When set, busy lookups fail as if the provider were down.
    pub unreachable: AtomicBool,
}

#[async_trait]
impl CalendarService for FakeCalendar {
    async fn create_event(
        &self,
        _credentials: Option<&str>,
        event: &CalendarEventRequest,
    ) -> PortResult<CalendarEvent> {
        let mut created = self.created.lock().unwrap();
        created.push(event.clone());
        Ok(CalendarEvent {
            event_id: Some(format!("evt-{}", created.len())),
            meet_link: MEET_LINK.to_string(),
            event_link: None,
        })
    }

    async fn list_busy(
        &self,
        _credentials: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> PortResult<Vec<BusyInterval>> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(PortError::Unexpected("calendar API unreachable".to_string()));
        }
        Ok(self
            .busy
            .lock()
            .unwrap()
            .iter()
            .filter(|b| b.start < to && b.end > from)
            .cloned()
            .collect())
    }
}

/// Records every message; fails the first `failures` sends.
pub struct RecordingSender {
    pub sent: Mutex<Vec<OutboundMessage>>,
    failures: AtomicU32,
}

impl RecordingSender {
    pub fn failing(failures: u32) -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            failures: AtomicU32::new(failures),
        }
    }
}

#[async_trait]
impl NotificationSender for RecordingSender {
    fn channel(&self) -> &'static str {
        "recording"
    }

    async fn send(&self, message: &OutboundMessage) -> PortResult<Delivery> {
        let left = self.failures.load(Ordering::SeqCst);
        if left > 0 {
            self.failures.store(left - 1, Ordering::SeqCst);
            return Err(PortError::Unexpected("provider unavailable".to_string()));
        }
        self.sent.lock().unwrap().push(message.clone());
        Ok(Delivery::Sent)
    }
}

//=========================================================================================
// Harness
//=========================================================================================

pub struct Harness {
    pub db: Arc<InMemoryDatabase>,
    pub gateway: Arc<FakeGateway>,
    pub calendar: Arc<FakeCalendar>,
    pub outbox: Arc<MemoryOutbox>,
    pub clock: Arc<TestClock>,
    pub booking: BookingService,
    pub settings: BookingSettings,
    pub psychologist: Psychologist,
    /// A working day three days out, in the slot offset.
    pub date: NaiveDate,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_config(test_config()).await
    }

    pub async fn with_config(config: Config) -> Self {
        let settings = BookingSettings::from_config(&config);
        // Stored rows are stamped with the wall clock, so start from it.
        let now = Utc::now().with_nanosecond(0).unwrap_or_else(Utc::now);
        let clock = Arc::new(TestClock::new(now));
        let date = now.with_timezone(&settings.offset).date_naive() + Duration::days(3);

        let db = Arc::new(InMemoryDatabase::new());
        let psychologist = Psychologist {
            id: Uuid::new_v4(),
            user_id: None,
            name: "Dr. Meera Rao".to_string(),
            email: "meera@clinic.test".to_string(),
            calendar_credentials: None,
            individual_price: Some(PRICE),
        };
        db.insert_psychologist(psychologist.clone()).await;

        let gateway = Arc::new(FakeGateway::new(&config));
        let calendar = Arc::new(FakeCalendar::default());
        let outbox = Arc::new(MemoryOutbox::new());
        let booking = BookingService::new(
            db.clone(),
            gateway.clone(),
            calendar.clone(),
            outbox.clone(),
            clock.clone(),
            settings.clone(),
        );

        Self {
            db,
            gateway,
            calendar,
            outbox,
            clock,
            booking,
            settings,
            psychologist,
            date,
        }
    }

    /// A client record and the context its requests would carry.
    pub async fn client(&self, name: &str) -> AuthContext {
        let email = format!("{}@mail.test", name.to_lowercase());
        let client = self
            .db
            .create_client(NewClient {
                user_id: None,
                name: name.to_string(),
                email: Some(email.clone()),
                phone: Some("9876543210".to_string()),
            })
            .await
            .expect("client created");
        AuthContext {
            user_id: Uuid::new_v4(),
            email,
            role: Role::Client,
            client_id: Some(client.id),
            psychologist_id: None,
        }
    }

    pub fn admin(&self) -> AuthContext {
        AuthContext {
            user_id: Uuid::new_v4(),
            email: "admin@clinic.test".to_string(),
            role: Role::Admin,
            client_id: None,
            psychologist_id: None,
        }
    }

    pub async fn package(&self, session_count: i32, price: i64) -> Package {
        let package = Package {
            id: Uuid::new_v4(),
            psychologist_id: self.psychologist.id,
            name: format!("{} sessions", session_count),
            session_count,
            price,
        };
        self.db.insert_package(package.clone()).await;
        package
    }

    pub async fn open_slots(&self, date: NaiveDate, times: &[&str]) {
        self.db
            .set_availability(
                self.psychologist.id,
                date,
                times.iter().map(|t| t.to_string()).collect(),
            )
            .await
            .expect("availability stored");
    }

    pub async fn slots(&self, date: NaiveDate) -> Vec<String> {
        self.db
            .get_availability(self.psychologist.id, date)
            .await
            .expect("availability readable")
            .map(|a| a.slots)
            .unwrap_or_default()
    }

    /// Reserves and opens a checkout; returns the signed form.
    pub async fn checkout(
        &self,
        actor: &AuthContext,
        date: NaiveDate,
        time: &str,
        package_id: Option<Uuid>,
    ) -> CheckoutForm {
        let quote = self
            .booking
            .reserve_slot(
                actor,
                ReserveRequest {
                    psychologist_id: self.psychologist.id,
                    date,
                    time: time.to_string(),
                    package_id,
                },
            )
            .await
            .expect("slot reserved");
        self.booking
            .create_payment_order(actor, &quote.quote_id)
            .await
            .expect("order created")
    }

    /// The full happy path: reserve, pay, receive the success callback.
    pub async fn book(&self, actor: &AuthContext, date: NaiveDate, time: &str) -> Session {
        let form = self.checkout(actor, date, time, None).await;
        match self
            .booking
            .handle_callback(&signed_callback(&form, "success"))
            .await
            .expect("callback applied")
        {
            PaymentOutcome::Booked(session) => session,
            other => panic!("expected a booking, got {:?}", other),
        }
    }
}

pub fn txnid(form: &CheckoutForm) -> String {
    form.params
        .iter()
        .find(|(k, _)| k == "txnid")
        .map(|(_, v)| v.clone())
        .expect("form carries txnid")
}
