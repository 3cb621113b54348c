//! services/api/src/outbox.rs
//!
//! Side effects that run after a booking write has committed: calendar invites and
//! client/admin notices. The request path only enqueues; a background dispatcher
//! performs the slow third-party calls with bounded retries.

use async_trait::async_trait;
use booking_core::domain::{Client, Psychologist, Session};
use booking_core::ports::{
    CalendarEventRequest, CalendarService, DatabaseService, Delivery, NoticeKind,
    NotificationSender, OutboundMessage, Outbox, PortError, PortResult, Recipient, SideEffect,
};
use booking_core::slots;
use chrono::{Duration as ChronoDuration, FixedOffset};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{
    mpsc::{self, error::TrySendError},
    Mutex,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::adapters::payu::format_amount;
use crate::booking::BookingSettings;

//=========================================================================================
// Outbox Implementations
//=========================================================================================

/// Hands jobs to the dispatcher task over a bounded channel.
#[derive(Clone)]
pub struct ChannelOutbox {
    sender: mpsc::Sender<SideEffect>,
}

impl ChannelOutbox {
    /// Creates the outbox and the receiving end for `Dispatcher::run`.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<SideEffect>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl Outbox for ChannelOutbox {
    /// Never waits for room: a full queue drops the job instead of stalling the request.
    async fn enqueue(&self, effect: SideEffect) -> PortResult<()> {
        self.sender.try_send(effect).map_err(|e| match e {
            TrySendError::Full(effect) => {
                warn!("Side-effect queue is full, dropping {:?}", effect);
                PortError::Unexpected("Side-effect queue is full".to_string())
            }
            TrySendError::Closed(effect) => {
                PortError::Unexpected(format!("Side-effect dispatcher stopped: {:?}", effect))
            }
        })
    }
}

/// Keeps every job in memory. Used by tests to assert on what was queued.
#[derive(Default)]
pub struct MemoryOutbox {
    jobs: Mutex<Vec<SideEffect>>,
}

impl MemoryOutbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn jobs(&self) -> Vec<SideEffect> {
        self.jobs.lock().await.clone()
    }

    /// Drains the queue.
    pub async fn take(&self) -> Vec<SideEffect> {
        std::mem::take(&mut *self.jobs.lock().await)
    }
}

#[async_trait]
impl Outbox for MemoryOutbox {
    async fn enqueue(&self, effect: SideEffect) -> PortResult<()> {
        self.jobs.lock().await.push(effect);
        Ok(())
    }
}

//=========================================================================================
// Retry
//=========================================================================================

/// Exponential backoff: `initial_delay * multiplier ^ attempt` between attempts.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Number of attempts, including the first one.
    pub attempts: u32,
    pub initial_delay: Duration,
    pub multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            initial_delay: Duration::from_millis(500),
            multiplier: 2,
        }
    }
}

/// Runs `operation` until it succeeds or the policy runs out of attempts.
/// The last error is returned.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, label: &str, operation: F) -> PortResult<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = PortResult<T>>,
{
    let attempts = policy.attempts.max(1);
    let mut delay = policy.initial_delay;
    let mut attempt = 1;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt >= attempts => return Err(e),
            Err(e) => {
                warn!(
                    "{} failed (attempt {}/{}), retrying in {:?}: {}",
                    label, attempt, attempts, delay, e
                );
                tokio::time::sleep(delay).await;
                delay *= policy.multiplier;
                attempt += 1;
            }
        }
    }
}

//=========================================================================================
// Dispatcher
//=========================================================================================

/// What the dispatcher needs to know about invites and notices.
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub offset: FixedOffset,
    pub session_length: ChronoDuration,
    pub event_prefix: String,
    pub admin_email: Option<String>,
}

impl DispatchSettings {
    pub fn new(booking: &BookingSettings, admin_email: Option<String>) -> Self {
        Self {
            offset: booking.offset,
            session_length: booking.session_length,
            event_prefix: booking.platform_event_prefix.clone(),
            admin_email,
        }
    }
}

pub struct Dispatcher {
    db: Arc<dyn DatabaseService>,
    calendar: Arc<dyn CalendarService>,
    senders: Vec<Arc<dyn NotificationSender>>,
    settings: DispatchSettings,
    retry: RetryPolicy,
}

impl Dispatcher {
    pub fn new(
        db: Arc<dyn DatabaseService>,
        calendar: Arc<dyn CalendarService>,
        senders: Vec<Arc<dyn NotificationSender>>,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            db,
            calendar,
            senders,
            settings,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Consumes jobs until the channel closes or the token is cancelled.
    /// Each job runs on its own task so a backoff never delays the queue.
    pub async fn run(self: Arc<Self>, mut jobs: mpsc::Receiver<SideEffect>, token: CancellationToken) {
        info!("Side-effect dispatcher started.");
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("Side-effect dispatcher cancelled.");
                    break;
                }
                job = jobs.recv() => match job {
                    Some(effect) => {
                        let this = Arc::clone(&self);
                        tokio::spawn(async move {
                            // Failures are logged inside `dispatch`.
                            let _ = this.dispatch(effect).await;
                        });
                    }
                    None => {
                        info!("Side-effect channel closed, dispatcher stopping.");
                        break;
                    }
                },
            }
        }
    }

    /// Runs one job to completion, retrying transient failures.
    pub async fn dispatch(&self, effect: SideEffect) -> PortResult<()> {
        let result = match &effect {
            SideEffect::CalendarInvite { session_id } => {
                with_retry(&self.retry, "Calendar invite", || self.send_invite(*session_id)).await
            }
            SideEffect::SessionNotice { session_id, kind } => {
                self.send_session_notice(*session_id, *kind).await
            }
            SideEffect::CreditNotice { payment_id } => self.send_credit_notice(*payment_id).await,
        };
        if let Err(e) = &result {
            error!("Side effect {:?} failed for good: {}", effect, e);
        }
        result
    }

    async fn send_invite(&self, session_id: uuid::Uuid) -> PortResult<()> {
        let session = self.db.get_session(session_id).await?;
        if !session.status.holds_slot() {
            debug!(session_id = %session_id, "Session no longer active, skipping invite");
            return Ok(());
        }
        let psychologist = self.db.get_psychologist(session.psychologist_id).await?;
        let client = self.db.get_client(session.client_id).await?;

        let start = slots::slot_start_utc(session.date, &session.time, self.settings.offset)
            .ok_or_else(|| {
                PortError::Unexpected(format!("Session {} has an invalid slot", session_id))
            })?;
        let mut attendees = vec![psychologist.email.clone()];
        attendees.extend(client.email.clone());
        let request = CalendarEventRequest {
            summary: format!("{} with {}", self.settings.event_prefix, client.name),
            description: format!(
                "Session between {} and {}.",
                psychologist.name, client.name
            ),
            start,
            end: start + self.settings.session_length,
            attendees,
        };

        let event = self
            .calendar
            .create_event(psychologist.calendar_credentials.as_deref(), &request)
            .await?;
        self.db.set_session_calendar(session_id, &event).await?;
        info!(session_id = %session_id, "Calendar invite stored");
        Ok(())
    }

    async fn send_session_notice(&self, session_id: uuid::Uuid, kind: NoticeKind) -> PortResult<()> {
        let (session, psychologist, client) =
            with_retry(&self.retry, "Notice lookup", || self.load_session(session_id)).await?;

        let recipient = if kind == NoticeKind::RescheduleRequested {
            let Some(admin) = self.settings.admin_email.clone() else {
                warn!(session_id = %session_id, "ADMIN_EMAIL is not set, reschedule request not announced");
                return Ok(());
            };
            Recipient {
                name: "Admin".to_string(),
                email: Some(admin),
                phone: None,
            }
        } else {
            recipient_for(&client)
        };
        let message = render_session_notice(kind, &session, &psychologist, &client, recipient);
        self.deliver(&message).await
    }

    async fn send_credit_notice(&self, payment_id: uuid::Uuid) -> PortResult<()> {
        let (payment, client, psychologist) = with_retry(&self.retry, "Notice lookup", || async {
            let payment = self.db.get_payment(payment_id).await?;
            let client = self.db.get_client(payment.client_id).await?;
            let psychologist = self.db.get_psychologist(payment.psychologist_id).await?;
            Ok((payment, client, psychologist))
        })
        .await?;

        let message = OutboundMessage {
            recipient: recipient_for(&client),
            template: "credit_issued".to_string(),
            subject: "Your payment is saved as a credit".to_string(),
            body: format!(
                "Hi {}, the slot on {} at {} with {} was taken before your payment completed. \
                 Your payment of INR {} is kept as a credit (reference {}). \
                 Use it to book another slot with {}.",
                client.name,
                payment.date.format("%A, %d %B %Y"),
                payment.time,
                psychologist.name,
                format_amount(payment.amount),
                payment.transaction_id,
                psychologist.name
            ),
        };
        self.deliver(&message).await
    }

    async fn load_session(&self, session_id: uuid::Uuid) -> PortResult<(Session, Psychologist, Client)> {
        let session = self.db.get_session(session_id).await?;
        let psychologist = self.db.get_psychologist(session.psychologist_id).await?;
        let client = self.db.get_client(session.client_id).await?;
        Ok((session, psychologist, client))
    }

    /// Sends on every channel at once. Each channel retries on its own so a
    /// WhatsApp outage never repeats an email that already went out.
    async fn deliver(&self, message: &OutboundMessage) -> PortResult<()> {
        let sends = self.senders.iter().map(|sender| async move {
            let label = format!("{} '{}'", sender.channel(), message.template);
            let outcome = with_retry(&self.retry, &label, || sender.send(message)).await;
            (sender.channel(), outcome)
        });
        let results = futures::future::join_all(sends).await;

        let mut failed = Vec::new();
        for (channel, outcome) in results {
            match outcome {
                Ok(Delivery::Sent) => info!(channel, template = %message.template, "Notice sent"),
                Ok(Delivery::Skipped { reason }) => {
                    debug!(channel, template = %message.template, "Notice skipped: {}", reason)
                }
                Err(e) => failed.push(format!("{}: {}", channel, e)),
            }
        }
        if failed.is_empty() {
            Ok(())
        } else {
            Err(PortError::Unexpected(failed.join("; ")))
        }
    }
}

fn recipient_for(client: &Client) -> Recipient {
    Recipient {
        name: client.name.clone(),
        email: client.email.clone(),
        phone: client.phone.clone(),
    }
}

/// Subject and body for a session notice.
pub fn render_session_notice(
    kind: NoticeKind,
    session: &Session,
    psychologist: &Psychologist,
    client: &Client,
    recipient: Recipient,
) -> OutboundMessage {
    let when = format!("{} at {}", session.date.format("%A, %d %B %Y"), session.time);
    let (template, subject, body) = match kind {
        NoticeKind::BookingConfirmed => {
            let link = session
                .meet_link
                .as_deref()
                .map(|l| format!(" Join here: {}", l))
                .unwrap_or_else(|| " The joining link will follow in your calendar invite.".to_string());
            (
                "booking_confirmed",
                "Your session is booked".to_string(),
                format!(
                    "Hi {}, your session with {} on {} is confirmed.{}",
                    client.name, psychologist.name, when, link
                ),
            )
        }
        NoticeKind::Rescheduled => (
            "session_rescheduled",
            "Your session has moved".to_string(),
            format!(
                "Hi {}, your session with {} is now on {}. A new calendar invite is on its way.",
                client.name, psychologist.name, when
            ),
        ),
        NoticeKind::RescheduleRequested => {
            let requested = match (session.requested_date, session.requested_time.as_deref()) {
                (Some(date), Some(time)) => format!("{} at {}", date.format("%A, %d %B %Y"), time),
                _ => "an unspecified slot".to_string(),
            };
            (
                "reschedule_requested",
                format!("Reschedule approval needed for {}", client.name),
                format!(
                    "{} asked to move their session with {} from {} to {}. Session id: {}.",
                    client.name, psychologist.name, when, requested, session.id
                ),
            )
        }
        NoticeKind::RescheduleRejected => (
            "reschedule_rejected",
            "Your reschedule request was declined".to_string(),
            format!(
                "Hi {}, your request to move the session with {} was declined. \
                 The session stays on {}.",
                client.name, psychologist.name, when
            ),
        ),
        NoticeKind::Cancelled => (
            "session_cancelled",
            "Your session was cancelled".to_string(),
            format!(
                "Hi {}, your session with {} on {} has been cancelled.",
                client.name, psychologist.name, when
            ),
        ),
    };
    OutboundMessage {
        recipient,
        template: template.to_string(),
        subject,
        body,
    }
}
