//! The side-effect dispatcher against recorded fakes: invites land on the
//! session, notices reach the right people, and each channel retries alone.

mod common;

use api_lib::outbox::{ChannelOutbox, DispatchSettings, Dispatcher, RetryPolicy};
use booking_core::ports::{DatabaseService, NoticeKind, NotificationSender, Outbox, SideEffect};
use chrono::Duration;
use common::{Harness, RecordingSender, MEET_LINK};
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tokio_util::sync::CancellationToken;

fn fast() -> RetryPolicy {
    RetryPolicy {
        attempts: 3,
        initial_delay: StdDuration::from_millis(1),
        multiplier: 2,
    }
}

fn dispatcher(h: &Harness, senders: Vec<Arc<dyn NotificationSender>>, admin: Option<&str>) -> Dispatcher {
    Dispatcher::new(
        h.db.clone(),
        h.calendar.clone(),
        senders,
        DispatchSettings::new(&h.settings, admin.map(str::to_string)),
    )
    .with_retry_policy(fast())
}

#[tokio::test]
async fn booking_jobs_store_the_invite_and_send_the_link() {
    let h = Harness::new().await;
    h.open_slots(h.date, &["10:00"]).await;
    let asha = h.client("Asha").await;
    let session = h.book(&asha, h.date, "10:00").await;

    let sender = Arc::new(RecordingSender::failing(1));
    let dispatcher = dispatcher(&h, vec![sender.clone() as Arc<dyn NotificationSender>], None);
    for job in h.outbox.take().await {
        dispatcher.dispatch(job).await.unwrap();
    }

    let stored = h.db.get_session(session.id).await.unwrap();
    assert_eq!(stored.meet_link.as_deref(), Some(MEET_LINK));
    assert_eq!(stored.calendar_event_id.as_deref(), Some("evt-1"));

    let created = h.calendar.created.lock().unwrap().clone();
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].summary, "Therapy Session with Asha");
    assert_eq!(
        created[0].attendees,
        vec!["meera@clinic.test".to_string(), "asha@mail.test".to_string()]
    );
    assert_eq!(created[0].end - created[0].start, Duration::minutes(60));

    // The first send failed and was retried.
    let sent = sender.sent.lock().unwrap().clone();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].template, "booking_confirmed");
    assert!(sent[0].body.contains(MEET_LINK));
    assert_eq!(sent[0].recipient.email.as_deref(), Some("asha@mail.test"));
}

#[tokio::test]
async fn one_broken_channel_does_not_repeat_the_others() {
    let h = Harness::new().await;
    h.open_slots(h.date, &["10:00"]).await;
    let asha = h.client("Asha").await;
    let session = h.book(&asha, h.date, "10:00").await;

    let healthy = Arc::new(RecordingSender::failing(0));
    let broken = Arc::new(RecordingSender::failing(10));
    let senders: Vec<Arc<dyn NotificationSender>> = vec![healthy.clone(), broken.clone()];
    let dispatcher = dispatcher(&h, senders, None);

    let result = dispatcher
        .dispatch(SideEffect::SessionNotice {
            session_id: session.id,
            kind: NoticeKind::BookingConfirmed,
        })
        .await;

    assert!(result.is_err());
    assert_eq!(healthy.sent.lock().unwrap().len(), 1);
    assert!(broken.sent.lock().unwrap().is_empty());
}

#[tokio::test]
async fn reschedule_requests_go_to_the_admin_when_one_is_configured() {
    let h = Harness::new().await;
    h.open_slots(h.date, &["10:00"]).await;
    let asha = h.client("Asha").await;
    let session = h.book(&asha, h.date, "10:00").await;
    let job = SideEffect::SessionNotice {
        session_id: session.id,
        kind: NoticeKind::RescheduleRequested,
    };

    let sender = Arc::new(RecordingSender::failing(0));
    dispatcher(&h, vec![sender.clone() as Arc<dyn NotificationSender>], None)
        .dispatch(job.clone())
        .await
        .unwrap();
    assert!(sender.sent.lock().unwrap().is_empty());

    dispatcher(&h, vec![sender.clone() as Arc<dyn NotificationSender>], Some("admin@clinic.test"))
        .dispatch(job)
        .await
        .unwrap();
    let sent = sender.sent.lock().unwrap().clone();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].template, "reschedule_requested");
    assert_eq!(sent[0].recipient.email.as_deref(), Some("admin@clinic.test"));
}

#[tokio::test]
async fn invites_are_skipped_for_sessions_that_no_longer_hold_a_slot() {
    let h = Harness::new().await;
    h.open_slots(h.date, &["10:00"]).await;
    let asha = h.client("Asha").await;
    let session = h.book(&asha, h.date, "10:00").await;
    h.booking.cancel(&asha, session.id).await.unwrap();

    dispatcher(&h, Vec::new(), None)
        .dispatch(SideEffect::CalendarInvite { session_id: session.id })
        .await
        .unwrap();
    assert!(h.calendar.created.lock().unwrap().is_empty());
}

#[tokio::test]
async fn running_dispatcher_drains_the_channel_until_cancelled() {
    let h = Harness::new().await;
    h.open_slots(h.date, &["10:00"]).await;
    let asha = h.client("Asha").await;
    let session = h.book(&asha, h.date, "10:00").await;

    let (outbox, jobs) = ChannelOutbox::channel(8);
    let token = CancellationToken::new();
    let task = tokio::spawn(Arc::new(dispatcher(&h, Vec::new(), None)).run(jobs, token.clone()));

    outbox
        .enqueue(SideEffect::CalendarInvite { session_id: session.id })
        .await
        .unwrap();
    let mut linked = false;
    for _ in 0..100 {
        if h.db.get_session(session.id).await.unwrap().meet_link.is_some() {
            linked = true;
            break;
        }
        tokio::time::sleep(StdDuration::from_millis(10)).await;
    }
    assert!(linked);

    token.cancel();
    task.await.unwrap();
}
