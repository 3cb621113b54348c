//! services/api/src/web/rest.rs
//!
//! Contains the Axum handlers for the REST API endpoints and the master
//! definition for the OpenAPI specification.

use crate::booking::{
    parse_slot, AuthContext, BookingStatusView, PaymentOutcome, Quote, RescheduleOutcome,
    ReserveRequest, SessionSummary,
};
use crate::error::BookingError;
use crate::web::{auth, state::AppState};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Redirect, Response},
    Extension, Form,
};
use booking_core::domain::{Availability, Payment, Session};
use booking_core::ports::{CheckoutForm, GatewayCallback};
use booking_core::slots;
use booking_core::status::CREDIT_MESSAGE;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};
use utoipa::{IntoParams, OpenApi, ToSchema};
use uuid::Uuid;

//=========================================================================================
// OpenAPI Master Definition
//=========================================================================================

#[derive(OpenApi)]
#[openapi(
    paths(
        auth::signup_handler,
        auth::login_handler,
        auth::logout_handler,
        get_availability_handler,
        set_availability_handler,
        sync_calendar_handler,
        reserve_slot_handler,
        create_payment_order_handler,
        verify_payment_handler,
        payment_webhook_handler,
        payment_success_handler,
        payment_failure_handler,
        booking_status_handler,
        list_sessions_handler,
        reschedule_handler,
        approve_reschedule_handler,
        reject_reschedule_handler,
        cancel_session_handler,
        complete_session_handler,
        list_credits_handler,
        apply_credit_handler,
        book_from_package_handler,
    ),
    components(
        schemas(
            auth::SignupRequest, auth::LoginRequest, auth::AuthResponse,
            AvailabilityResponse, SetAvailabilityRequest, SyncCalendarRequest,
            ReserveSlotRequest, QuoteResponse, PaymentOrderRequest, CheckoutFormResponse,
            VerifyPaymentRequest, PaymentOutcomeResponse, CallbackForm,
            BookingStatusResponse, SessionSummaryResponse, SessionResponse,
            RescheduleRequest, RescheduleResponse, CreditResponse, ApplyCreditRequest,
            BookFromPackageRequest, ErrorResponse
        )
    ),
    tags(
        (name = "Booking API", description = "Availability, reservations, payments and sessions for the therapy marketplace.")
    )
)]
pub struct ApiDoc;

//=========================================================================================
// API Response and Payload Structs
//=========================================================================================

/// The JSON body of every error response. Documentation only; `BookingError` renders it.
#[allow(dead_code)]
#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    code: String,
    message: String,
    credit_transaction_id: Option<String>,
}

#[derive(Deserialize, IntoParams)]
#[serde(rename_all = "camelCase")]
#[into_params(parameter_in = Query)]
pub struct AvailabilityQuery {
    psychologist_id: Uuid,
    /// `YYYY-MM-DD`
    date: String,
}

#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AvailabilityResponse {
    psychologist_id: Uuid,
    date: String,
    slots: Vec<String>,
}

impl From<Availability> for AvailabilityResponse {
    fn from(a: Availability) -> Self {
        Self {
            psychologist_id: a.psychologist_id,
            date: a.date.to_string(),
            slots: a.slots,
        }
    }
}

#[derive(Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SetAvailabilityRequest {
    psychologist_id: Uuid,
    date: String,
    slots: Vec<String>,
}

#[derive(Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SyncCalendarRequest {
    psychologist_id: Uuid,
    date: String,
}

#[derive(Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReserveSlotRequest {
    psychologist_id: Uuid,
    date: String,
    time: String,
    package_id: Option<Uuid>,
}

#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct QuoteResponse {
    quote_id: String,
    /// Minor currency units.
    price: i64,
    currency: String,
    expires_at: DateTime<Utc>,
}

impl From<Quote> for QuoteResponse {
    fn from(q: Quote) -> Self {
        Self {
            quote_id: q.quote_id,
            price: q.price,
            currency: q.currency.to_string(),
            expires_at: q.expires_at,
        }
    }
}

#[derive(Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PaymentOrderRequest {
    quote_id: String,
}

/// A form the browser posts to `action`.
#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutFormResponse {
    action: String,
    params: BTreeMap<String, String>,
}

impl From<CheckoutForm> for CheckoutFormResponse {
    fn from(form: CheckoutForm) -> Self {
        Self {
            action: form.action,
            params: form.params.into_iter().collect(),
        }
    }
}

#[derive(Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct VerifyPaymentRequest {
    order_id: String,
}

#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PaymentOutcomeResponse {
    order_id: String,
    /// `booked`, `already_processed`, `credited`, `failed` or `pending`.
    outcome: String,
    session_id: Option<Uuid>,
}

impl PaymentOutcomeResponse {
    fn new(order_id: &str, outcome: &PaymentOutcome) -> Self {
        let session_id = match outcome {
            PaymentOutcome::Booked(session) => Some(session.id),
            PaymentOutcome::AlreadyProcessed(payment) => payment.session_id,
            _ => None,
        };
        Self {
            order_id: order_id.to_string(),
            outcome: outcome.payment_status().to_string(),
            session_id,
        }
    }
}

/// The fields the payment gateway posts back, under the gateway's own names.
#[derive(Debug, Default, Deserialize, ToSchema)]
#[serde(default)]
pub struct CallbackForm {
    txnid: String,
    mihpayid: Option<String>,
    status: String,
    amount: String,
    productinfo: String,
    firstname: String,
    email: String,
    udf1: String,
    udf2: String,
    udf3: String,
    udf4: String,
    udf5: String,
    #[serde(rename = "additionalCharges")]
    additional_charges: Option<String>,
    hash: String,
}

impl From<CallbackForm> for GatewayCallback {
    fn from(form: CallbackForm) -> Self {
        GatewayCallback {
            transaction_id: form.txnid,
            gateway_payment_id: form.mihpayid.filter(|id| !id.is_empty()),
            status: form.status,
            amount: form.amount,
            product_info: form.productinfo,
            first_name: form.firstname,
            email: form.email,
            udf: [form.udf1, form.udf2, form.udf3, form.udf4, form.udf5],
            additional_charges: form.additional_charges.filter(|c| !c.is_empty()),
            hash: form.hash,
        }
    }
}

#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummaryResponse {
    session_id: Option<Uuid>,
    psychologist_id: Uuid,
    date: String,
    time: String,
    meet_link: Option<String>,
    /// `false` when the details come from the order because the session row was not found.
    resolved: bool,
}

impl From<SessionSummary> for SessionSummaryResponse {
    fn from(s: SessionSummary) -> Self {
        Self {
            session_id: s.session_id,
            psychologist_id: s.psychologist_id,
            date: s.date.to_string(),
            time: s.time,
            meet_link: s.meet_link,
            resolved: s.resolved,
        }
    }
}

#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct BookingStatusResponse {
    order_id: String,
    /// `SLOT_HELD`, `PAYMENT_PENDING`, `PAYMENT_SUCCESS`, `COMPLETED`, `FAILED` or `EXPIRED`.
    status: String,
    message: String,
    /// The client can stop polling.
    is_final: bool,
    session: Option<SessionSummaryResponse>,
    credit: bool,
    legacy: bool,
}

impl From<BookingStatusView> for BookingStatusResponse {
    fn from(v: BookingStatusView) -> Self {
        Self {
            order_id: v.order_id,
            status: v.status.as_str().to_string(),
            message: v.message,
            is_final: v.status.is_final() || v.credit,
            session: v.session.map(Into::into),
            credit: v.credit,
            legacy: v.legacy,
        }
    }
}

#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SessionResponse {
    id: Uuid,
    psychologist_id: Uuid,
    client_id: Uuid,
    date: String,
    time: String,
    status: String,
    price: i64,
    meet_link: Option<String>,
    calendar_event_link: Option<String>,
    reschedule_count: i32,
    requested_date: Option<String>,
    requested_time: Option<String>,
    client_package_id: Option<Uuid>,
}

impl From<Session> for SessionResponse {
    fn from(s: Session) -> Self {
        Self {
            id: s.id,
            psychologist_id: s.psychologist_id,
            client_id: s.client_id,
            date: s.date.to_string(),
            time: s.time,
            status: s.status.as_str().to_string(),
            price: s.price,
            meet_link: s.meet_link,
            calendar_event_link: s.calendar_event_link,
            reschedule_count: s.reschedule_count,
            requested_date: s.requested_date.map(|d| d.to_string()),
            requested_time: s.requested_time,
            client_package_id: s.client_package_id,
        }
    }
}

#[derive(Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RescheduleRequest {
    date: String,
    time: String,
}

#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RescheduleResponse {
    /// `moved` or `requested`.
    outcome: String,
    session: SessionResponse,
}

#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreditResponse {
    transaction_id: String,
    psychologist_id: Uuid,
    amount: i64,
    original_date: String,
    original_time: String,
    created_at: DateTime<Utc>,
}

impl From<Payment> for CreditResponse {
    fn from(p: Payment) -> Self {
        Self {
            transaction_id: p.transaction_id,
            psychologist_id: p.psychologist_id,
            amount: p.amount,
            original_date: p.date.to_string(),
            original_time: p.time,
            created_at: p.created_at,
        }
    }
}

#[derive(Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ApplyCreditRequest {
    transaction_id: String,
    psychologist_id: Uuid,
    date: String,
    time: String,
}

#[derive(Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct BookFromPackageRequest {
    date: String,
    time: String,
}

fn parse_date(raw: &str) -> Result<NaiveDate, BookingError> {
    slots::parse_date(raw)
        .ok_or_else(|| BookingError::Validation(format!("Invalid date '{}', expected YYYY-MM-DD", raw)))
}

//=========================================================================================
// Availability Handlers
//=========================================================================================

/// Open slots for one psychologist on one date.
#[utoipa::path(
    get,
    path = "/availability",
    params(AvailabilityQuery),
    responses(
        (status = 200, description = "Open slots, minus external calendar conflicts", body = AvailabilityResponse),
        (status = 400, description = "Invalid date", body = ErrorResponse),
        (status = 404, description = "Unknown psychologist", body = ErrorResponse)
    )
)]
pub async fn get_availability_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AvailabilityQuery>,
) -> Result<Json<AvailabilityResponse>, BookingError> {
    let date = parse_date(&query.date)?;
    let availability = state
        .booking
        .available_slots(query.psychologist_id, date)
        .await?;
    Ok(Json(availability.into()))
}

/// Replace a day's slot list.
#[utoipa::path(
    put,
    path = "/availability",
    request_body = SetAvailabilityRequest,
    responses(
        (status = 200, description = "Stored slot list", body = AvailabilityResponse),
        (status = 400, description = "Invalid slot", body = ErrorResponse),
        (status = 403, description = "Not the psychologist or an admin", body = ErrorResponse)
    )
)]
pub async fn set_availability_handler(
    State(state): State<Arc<AppState>>,
    Extension(actor): Extension<AuthContext>,
    Json(req): Json<SetAvailabilityRequest>,
) -> Result<Json<AvailabilityResponse>, BookingError> {
    let date = parse_date(&req.date)?;
    let availability = state
        .booking
        .set_availability(&actor, req.psychologist_id, date, &req.slots)
        .await?;
    Ok(Json(availability.into()))
}

/// Remove slots the psychologist's external calendar marks busy.
#[utoipa::path(
    post,
    path = "/availability/sync",
    request_body = SyncCalendarRequest,
    responses(
        (status = 200, description = "Slot list after the sync", body = AvailabilityResponse),
        (status = 400, description = "No calendar linked", body = ErrorResponse),
        (status = 500, description = "Calendar unreachable", body = ErrorResponse)
    )
)]
pub async fn sync_calendar_handler(
    State(state): State<Arc<AppState>>,
    Extension(actor): Extension<AuthContext>,
    Json(req): Json<SyncCalendarRequest>,
) -> Result<Json<AvailabilityResponse>, BookingError> {
    let date = parse_date(&req.date)?;
    let availability = state
        .booking
        .sync_calendar(&actor, req.psychologist_id, date)
        .await?;
    Ok(Json(availability.into()))
}

//=========================================================================================
// Reservation & Payment Handlers
//=========================================================================================

/// Price a slot and hold it while the client pays.
#[utoipa::path(
    post,
    path = "/reserve-slot",
    request_body = ReserveSlotRequest,
    responses(
        (status = 201, description = "Slot held", body = QuoteResponse),
        (status = 400, description = "Invalid slot or price not configured", body = ErrorResponse),
        (status = 409, description = "Slot taken or held by someone else", body = ErrorResponse)
    )
)]
pub async fn reserve_slot_handler(
    State(state): State<Arc<AppState>>,
    Extension(actor): Extension<AuthContext>,
    Json(req): Json<ReserveSlotRequest>,
) -> Result<impl IntoResponse, BookingError> {
    let (date, time) = parse_slot(&req.date, &req.time)?;
    let quote = state
        .booking
        .reserve_slot(
            &actor,
            ReserveRequest {
                psychologist_id: req.psychologist_id,
                date,
                time,
                package_id: req.package_id,
            },
        )
        .await?;
    Ok((StatusCode::CREATED, Json(QuoteResponse::from(quote))))
}

/// Create the payment for a held slot and return the signed gateway form.
#[utoipa::path(
    post,
    path = "/payment/order",
    request_body = PaymentOrderRequest,
    responses(
        (status = 200, description = "Signed checkout form", body = CheckoutFormResponse),
        (status = 404, description = "Unknown quote", body = ErrorResponse),
        (status = 409, description = "Hold expired or slot taken", body = ErrorResponse)
    )
)]
pub async fn create_payment_order_handler(
    State(state): State<Arc<AppState>>,
    Extension(actor): Extension<AuthContext>,
    Json(req): Json<PaymentOrderRequest>,
) -> Result<Json<CheckoutFormResponse>, BookingError> {
    let form = state
        .booking
        .create_payment_order(&actor, &req.quote_id)
        .await?;
    Ok(Json(form.into()))
}

/// Ask the gateway about one of the caller's orders and apply the answer.
#[utoipa::path(
    post,
    path = "/payment/verify",
    request_body = VerifyPaymentRequest,
    responses(
        (status = 200, description = "Current outcome", body = PaymentOutcomeResponse),
        (status = 404, description = "Unknown order", body = ErrorResponse),
        (status = 409, description = "Slot lost; the payment is kept as a credit", body = ErrorResponse)
    )
)]
pub async fn verify_payment_handler(
    State(state): State<Arc<AppState>>,
    Extension(actor): Extension<AuthContext>,
    Json(req): Json<VerifyPaymentRequest>,
) -> Result<Json<PaymentOutcomeResponse>, BookingError> {
    let outcome = state.booking.verify_payment(&actor, &req.order_id).await?;
    if let PaymentOutcome::Credited(payment) = &outcome {
        return Err(BookingError::Conflict {
            message: CREDIT_MESSAGE.to_string(),
            credit_transaction_id: Some(payment.transaction_id.clone()),
        });
    }
    Ok(Json(PaymentOutcomeResponse::new(&req.order_id, &outcome)))
}

/// Server-to-server notification from the payment gateway.
///
/// Answers 200 once the callback is applied, including when the payment became a
/// credit. A bad hash is rejected with 401.
#[utoipa::path(
    post,
    path = "/payment/webhook",
    request_body(content = CallbackForm, content_type = "application/x-www-form-urlencoded"),
    responses(
        (status = 200, description = "Callback applied", body = PaymentOutcomeResponse),
        (status = 401, description = "Invalid signature", body = ErrorResponse),
        (status = 404, description = "Unknown transaction", body = ErrorResponse)
    )
)]
pub async fn payment_webhook_handler(
    State(state): State<Arc<AppState>>,
    Form(form): Form<CallbackForm>,
) -> Result<Json<PaymentOutcomeResponse>, BookingError> {
    let callback = GatewayCallback::from(form);
    let outcome = state.booking.handle_callback(&callback).await?;
    info!(
        transaction_id = %callback.transaction_id,
        "Webhook applied: {}", outcome.payment_status()
    );
    Ok(Json(PaymentOutcomeResponse::new(
        &callback.transaction_id,
        &outcome,
    )))
}

/// Browser return leg after a successful checkout.
#[utoipa::path(
    post,
    path = "/payment/success",
    request_body(content = CallbackForm, content_type = "application/x-www-form-urlencoded"),
    responses(
        (status = 303, description = "Redirect to the booking status page"),
        (status = 401, description = "Invalid signature", body = ErrorResponse)
    )
)]
pub async fn payment_success_handler(
    State(state): State<Arc<AppState>>,
    Form(form): Form<CallbackForm>,
) -> Result<Response, BookingError> {
    return_leg(&state, form).await
}

/// Browser return leg after a failed or cancelled checkout.
#[utoipa::path(
    post,
    path = "/payment/failure",
    request_body(content = CallbackForm, content_type = "application/x-www-form-urlencoded"),
    responses(
        (status = 303, description = "Redirect to the booking status page"),
        (status = 401, description = "Invalid signature", body = ErrorResponse)
    )
)]
pub async fn payment_failure_handler(
    State(state): State<Arc<AppState>>,
    Form(form): Form<CallbackForm>,
) -> Result<Response, BookingError> {
    return_leg(&state, form).await
}

/// Applies the posted callback, then sends the browser to the status page,
/// which reports whatever state the order ended up in.
async fn return_leg(state: &AppState, form: CallbackForm) -> Result<Response, BookingError> {
    let callback = GatewayCallback::from(form);
    match state.booking.handle_callback(&callback).await {
        Ok(outcome) => info!(
            transaction_id = %callback.transaction_id,
            "Return leg applied: {}", outcome.payment_status()
        ),
        Err(BookingError::InvalidSignature) => return Err(BookingError::InvalidSignature),
        Err(e) => warn!(
            transaction_id = %callback.transaction_id,
            "Return leg could not be applied: {}", e
        ),
    }
    let target = format!(
        "{}/booking-status/{}",
        state.config.frontend_url.trim_end_matches('/'),
        callback.transaction_id
    );
    Ok(Redirect::to(&target).into_response())
}

/// Poll the state of an order. Reconciles with the gateway when the webhook is late.
#[utoipa::path(
    get,
    path = "/booking-status/{order_id}",
    params(("order_id" = String, Path, description = "The quote / gateway transaction id")),
    responses(
        (status = 200, description = "Current booking state", body = BookingStatusResponse),
        (status = 404, description = "Unknown order", body = ErrorResponse)
    )
)]
pub async fn booking_status_handler(
    State(state): State<Arc<AppState>>,
    Path(order_id): Path<String>,
) -> Result<Json<BookingStatusResponse>, BookingError> {
    let view = state.booking.booking_status(&order_id).await?;
    Ok(Json(view.into()))
}

//=========================================================================================
// Session Handlers
//=========================================================================================

/// The caller's sessions, newest first.
#[utoipa::path(
    get,
    path = "/sessions",
    responses(
        (status = 200, description = "Sessions", body = [SessionResponse]),
        (status = 401, description = "Not logged in", body = ErrorResponse)
    )
)]
pub async fn list_sessions_handler(
    State(state): State<Arc<AppState>>,
    Extension(actor): Extension<AuthContext>,
) -> Result<Json<Vec<SessionResponse>>, BookingError> {
    let sessions = state.booking.list_sessions(&actor).await?;
    Ok(Json(sessions.into_iter().map(Into::into).collect()))
}

/// Move a session, or ask for approval when it is too close.
#[utoipa::path(
    post,
    path = "/sessions/{id}/reschedule",
    params(("id" = Uuid, Path, description = "Session id")),
    request_body = RescheduleRequest,
    responses(
        (status = 200, description = "Moved or requested", body = RescheduleResponse),
        (status = 400, description = "Not reschedulable", body = ErrorResponse),
        (status = 409, description = "Target slot taken", body = ErrorResponse)
    )
)]
pub async fn reschedule_handler(
    State(state): State<Arc<AppState>>,
    Extension(actor): Extension<AuthContext>,
    Path(id): Path<Uuid>,
    Json(req): Json<RescheduleRequest>,
) -> Result<Json<RescheduleResponse>, BookingError> {
    let (date, time) = parse_slot(&req.date, &req.time)?;
    let response = match state.booking.reschedule(&actor, id, date, &time).await? {
        RescheduleOutcome::Moved(session) => RescheduleResponse {
            outcome: "moved".to_string(),
            session: session.into(),
        },
        RescheduleOutcome::Requested(session) => RescheduleResponse {
            outcome: "requested".to_string(),
            session: session.into(),
        },
    };
    Ok(Json(response))
}

/// Apply a pending reschedule request (admin).
#[utoipa::path(
    post,
    path = "/sessions/{id}/reschedule/approve",
    params(("id" = Uuid, Path, description = "Session id")),
    responses(
        (status = 200, description = "Session moved", body = SessionResponse),
        (status = 403, description = "Admin only", body = ErrorResponse),
        (status = 409, description = "Requested slot taken", body = ErrorResponse)
    )
)]
pub async fn approve_reschedule_handler(
    State(state): State<Arc<AppState>>,
    Extension(actor): Extension<AuthContext>,
    Path(id): Path<Uuid>,
) -> Result<Json<SessionResponse>, BookingError> {
    let session = state.booking.approve_reschedule(&actor, id).await?;
    Ok(Json(session.into()))
}

/// Decline a pending reschedule request (admin).
#[utoipa::path(
    post,
    path = "/sessions/{id}/reschedule/reject",
    params(("id" = Uuid, Path, description = "Session id")),
    responses(
        (status = 200, description = "Session back to booked", body = SessionResponse),
        (status = 403, description = "Admin only", body = ErrorResponse)
    )
)]
pub async fn reject_reschedule_handler(
    State(state): State<Arc<AppState>>,
    Extension(actor): Extension<AuthContext>,
    Path(id): Path<Uuid>,
) -> Result<Json<SessionResponse>, BookingError> {
    let session = state.booking.reject_reschedule(&actor, id).await?;
    Ok(Json(session.into()))
}

/// Cancel a future booked session.
#[utoipa::path(
    post,
    path = "/sessions/{id}/cancel",
    params(("id" = Uuid, Path, description = "Session id")),
    responses(
        (status = 200, description = "Session cancelled", body = SessionResponse),
        (status = 400, description = "Not cancellable", body = ErrorResponse)
    )
)]
pub async fn cancel_session_handler(
    State(state): State<Arc<AppState>>,
    Extension(actor): Extension<AuthContext>,
    Path(id): Path<Uuid>,
) -> Result<Json<SessionResponse>, BookingError> {
    let session = state.booking.cancel(&actor, id).await?;
    Ok(Json(session.into()))
}

/// Mark a started session as completed (its psychologist or an admin).
#[utoipa::path(
    post,
    path = "/sessions/{id}/complete",
    params(("id" = Uuid, Path, description = "Session id")),
    responses(
        (status = 200, description = "Session completed", body = SessionResponse),
        (status = 400, description = "Not started yet", body = ErrorResponse)
    )
)]
pub async fn complete_session_handler(
    State(state): State<Arc<AppState>>,
    Extension(actor): Extension<AuthContext>,
    Path(id): Path<Uuid>,
) -> Result<Json<SessionResponse>, BookingError> {
    let session = state.booking.complete(&actor, id).await?;
    Ok(Json(session.into()))
}

//=========================================================================================
// Credit & Package Handlers
//=========================================================================================

/// The caller's unused credits.
#[utoipa::path(
    get,
    path = "/credits",
    responses((status = 200, description = "Open credits", body = [CreditResponse]))
)]
pub async fn list_credits_handler(
    State(state): State<Arc<AppState>>,
    Extension(actor): Extension<AuthContext>,
) -> Result<Json<Vec<CreditResponse>>, BookingError> {
    let credits = state.booking.list_credits(&actor).await?;
    Ok(Json(credits.into_iter().map(Into::into).collect()))
}

/// Book a slot with an existing credit.
#[utoipa::path(
    post,
    path = "/credits/apply",
    request_body = ApplyCreditRequest,
    responses(
        (status = 201, description = "Session booked", body = SessionResponse),
        (status = 400, description = "Wrong psychologist or invalid slot", body = ErrorResponse),
        (status = 409, description = "Credit used or slot taken", body = ErrorResponse)
    )
)]
pub async fn apply_credit_handler(
    State(state): State<Arc<AppState>>,
    Extension(actor): Extension<AuthContext>,
    Json(req): Json<ApplyCreditRequest>,
) -> Result<impl IntoResponse, BookingError> {
    let (date, time) = parse_slot(&req.date, &req.time)?;
    let session = state
        .booking
        .apply_credit(&actor, &req.transaction_id, req.psychologist_id, date, &time)
        .await?;
    Ok((StatusCode::CREATED, Json(SessionResponse::from(session))))
}

/// Book the next session of a purchased package.
#[utoipa::path(
    post,
    path = "/packages/{client_package_id}/book",
    params(("client_package_id" = Uuid, Path, description = "The client's package")),
    request_body = BookFromPackageRequest,
    responses(
        (status = 201, description = "Session booked", body = SessionResponse),
        (status = 400, description = "No sessions left", body = ErrorResponse),
        (status = 409, description = "Slot taken", body = ErrorResponse)
    )
)]
pub async fn book_from_package_handler(
    State(state): State<Arc<AppState>>,
    Extension(actor): Extension<AuthContext>,
    Path(client_package_id): Path<Uuid>,
    Json(req): Json<BookFromPackageRequest>,
) -> Result<impl IntoResponse, BookingError> {
    let (date, time) = parse_slot(&req.date, &req.time)?;
    let session = state
        .booking
        .book_from_package(&actor, client_package_id, date, &time)
        .await?;
    Ok((StatusCode::CREATED, Json(SessionResponse::from(session))))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn callback_form_maps_gateway_field_names() {
        let form: CallbackForm = serde_json::from_value(serde_json::json!({
            "txnid": "BK0001",
            "mihpayid": "",
            "status": "success",
            "amount": "500.00",
            "udf3": "2026-03-02",
            "additionalCharges": "12.00",
            "hash": "abc"
        }))
        .unwrap();
        let callback = GatewayCallback::from(form);
        assert_eq!(callback.transaction_id, "BK0001");
        assert_eq!(callback.gateway_payment_id, None);
        assert_eq!(callback.udf[2], "2026-03-02");
        assert_eq!(callback.udf[0], "");
        assert_eq!(callback.additional_charges.as_deref(), Some("12.00"));
        assert!(callback.is_success());
    }

    #[test]
    fn checkout_params_become_an_object() {
        let form = CheckoutForm {
            action: "https://test.payu.in/_payment".to_string(),
            params: vec![
                ("txnid".to_string(), "BK0001".to_string()),
                ("amount".to_string(), "500.00".to_string()),
            ],
        };
        let body = serde_json::to_value(CheckoutFormResponse::from(form)).unwrap();
        assert_eq!(body["params"]["txnid"], "BK0001");
        assert_eq!(body["action"], "https://test.payu.in/_payment");
    }
}
