//! Reschedule, cancel and complete, plus the availability mutations that
//! interact with booked sessions.

mod common;

use api_lib::booking::{AuthContext, RescheduleOutcome, ReserveRequest};
use api_lib::error::BookingError;
use booking_core::domain::{Psychologist, Role, SessionStatus};
use booking_core::ports::{DatabaseService, NoticeKind, SideEffect};
use booking_core::slots::{slot_start_utc, BusyInterval};
use chrono::Duration;
use std::sync::atomic::Ordering;
use common::Harness;
use rstest::rstest;
use uuid::Uuid;

fn sorted(mut slots: Vec<String>) -> Vec<String> {
    slots.sort();
    slots
}

fn psychologist_actor(psychologist_id: Uuid) -> AuthContext {
    AuthContext {
        user_id: Uuid::new_v4(),
        email: "meera@clinic.test".to_string(),
        role: Role::Psychologist,
        client_id: None,
        psychologist_id: Some(psychologist_id),
    }
}

//=========================================================================================
// Reschedule
//=========================================================================================

#[rstest]
#[case::well_ahead(48, true)]
#[case::inside_cutoff(12, false)]
#[tokio::test]
async fn reschedule_is_direct_only_outside_the_cutoff(
    #[case] hours_before: i64,
    #[case] direct: bool,
) {
    let h = Harness::new().await;
    h.open_slots(h.date, &["10:00", "16:00"]).await;
    let asha = h.client("Asha").await;
    let session = h.book(&asha, h.date, "10:00").await;
    h.outbox.take().await;

    let start = slot_start_utc(h.date, "10:00", h.settings.offset).unwrap();
    h.clock.set(start - Duration::hours(hours_before));

    let outcome = h
        .booking
        .reschedule(&asha, session.id, h.date, "16:00")
        .await
        .unwrap();

    match (outcome, direct) {
        (RescheduleOutcome::Moved(moved), true) => {
            assert_eq!(moved.time, "16:00");
            assert_eq!(moved.reschedule_count, 1);
            assert_eq!(h.slots(h.date).await, vec!["10:00".to_string()]);
            assert_eq!(
                h.outbox.take().await,
                vec![
                    SideEffect::CalendarInvite { session_id: session.id },
                    SideEffect::SessionNotice {
                        session_id: session.id,
                        kind: NoticeKind::Rescheduled
                    },
                ]
            );
        }
        (RescheduleOutcome::Requested(requested), false) => {
            assert_eq!(requested.status, SessionStatus::RescheduleRequested);
            assert_eq!(requested.time, "10:00");
            assert_eq!(requested.requested_time.as_deref(), Some("16:00"));
            assert_eq!(h.slots(h.date).await, vec!["16:00".to_string()]);
            assert_eq!(
                h.outbox.take().await,
                vec![SideEffect::SessionNotice {
                    session_id: session.id,
                    kind: NoticeKind::RescheduleRequested
                }]
            );
        }
        (other, _) => panic!("unexpected outcome {:?}", other),
    }
}

#[tokio::test]
async fn approved_request_moves_the_session() {
    let h = Harness::new().await;
    h.open_slots(h.date, &["10:00", "16:00"]).await;
    let asha = h.client("Asha").await;
    let session = h.book(&asha, h.date, "10:00").await;
    let start = slot_start_utc(h.date, "10:00", h.settings.offset).unwrap();
    h.clock.set(start - Duration::hours(6));

    h.booking
        .reschedule(&asha, session.id, h.date, "16:00")
        .await
        .unwrap();

    assert!(matches!(
        h.booking.approve_reschedule(&asha, session.id).await,
        Err(BookingError::Forbidden(_))
    ));
    let moved = h
        .booking
        .approve_reschedule(&h.admin(), session.id)
        .await
        .unwrap();
    assert_eq!(moved.status, SessionStatus::Booked);
    assert_eq!(moved.time, "16:00");
    assert_eq!(moved.requested_time, None);
    assert_eq!(h.slots(h.date).await, vec!["10:00".to_string()]);
}

#[tokio::test]
async fn rejected_request_keeps_the_original_slot() {
    let h = Harness::new().await;
    h.open_slots(h.date, &["10:00", "16:00"]).await;
    let asha = h.client("Asha").await;
    let session = h.book(&asha, h.date, "10:00").await;
    let start = slot_start_utc(h.date, "10:00", h.settings.offset).unwrap();
    h.clock.set(start - Duration::hours(6));
    h.booking
        .reschedule(&asha, session.id, h.date, "16:00")
        .await
        .unwrap();
    h.outbox.take().await;

    let restored = h
        .booking
        .reject_reschedule(&h.admin(), session.id)
        .await
        .unwrap();
    assert_eq!(restored.status, SessionStatus::Booked);
    assert_eq!(restored.time, "10:00");
    assert_eq!(h.slots(h.date).await, vec!["16:00".to_string()]);
    assert_eq!(
        h.outbox.take().await,
        vec![SideEffect::SessionNotice {
            session_id: session.id,
            kind: NoticeKind::RescheduleRejected
        }]
    );

    assert!(matches!(
        h.booking.reject_reschedule(&h.admin(), session.id).await,
        Err(BookingError::Validation(_))
    ));
}

#[tokio::test]
async fn reschedule_needs_an_open_future_target() {
    let h = Harness::new().await;
    h.open_slots(h.date, &["10:00", "11:00"]).await;
    let asha = h.client("Asha").await;
    let bilal = h.client("Bilal").await;
    let session = h.book(&asha, h.date, "10:00").await;
    h.book(&bilal, h.date, "11:00").await;

    assert!(matches!(
        h.booking.reschedule(&asha, session.id, h.date, "11:00").await,
        Err(BookingError::Conflict { .. })
    ));
    assert!(matches!(
        h.booking.reschedule(&asha, session.id, h.date, "10:00").await,
        Err(BookingError::Validation(_))
    ));
    assert!(matches!(
        h.booking
            .reschedule(&asha, session.id, h.date - Duration::days(4), "10:00")
            .await,
        Err(BookingError::Validation(_))
    ));
    assert!(matches!(
        h.booking.reschedule(&bilal, session.id, h.date, "12:00").await,
        Err(BookingError::Forbidden(_))
    ));
}

#[tokio::test]
async fn reschedule_cannot_take_a_slot_someone_is_paying_for() {
    let h = Harness::new().await;
    h.open_slots(h.date, &["10:00", "11:00"]).await;
    let asha = h.client("Asha").await;
    let bilal = h.client("Bilal").await;
    let session = h.book(&asha, h.date, "10:00").await;
    h.booking
        .reserve_slot(
            &bilal,
            ReserveRequest {
                psychologist_id: h.psychologist.id,
                date: h.date,
                time: "11:00".to_string(),
                package_id: None,
            },
        )
        .await
        .unwrap();

    assert!(matches!(
        h.booking.reschedule(&asha, session.id, h.date, "11:00").await,
        Err(BookingError::Conflict { .. })
    ));
    assert_eq!(h.db.get_session(session.id).await.unwrap().time, "10:00");

    // Once the hold lapses the slot is fair game again.
    h.clock.advance(Duration::minutes(16));
    let moved = h
        .booking
        .reschedule(&asha, session.id, h.date, "11:00")
        .await
        .unwrap();
    assert!(matches!(moved, RescheduleOutcome::Moved(_)));
}

#[tokio::test]
async fn approval_rechecks_holds_on_the_requested_slot() {
    let mut config = common::test_config();
    config.reschedule_approval_after = Some(0);
    let h = Harness::with_config(config).await;
    h.open_slots(h.date, &["10:00", "11:00"]).await;
    let asha = h.client("Asha").await;
    let bilal = h.client("Bilal").await;
    let session = h.book(&asha, h.date, "10:00").await;

    let requested = h
        .booking
        .reschedule(&asha, session.id, h.date, "11:00")
        .await
        .unwrap();
    assert!(matches!(requested, RescheduleOutcome::Requested(_)));

    h.booking
        .reserve_slot(
            &bilal,
            ReserveRequest {
                psychologist_id: h.psychologist.id,
                date: h.date,
                time: "11:00".to_string(),
                package_id: None,
            },
        )
        .await
        .unwrap();
    assert!(matches!(
        h.booking.approve_reschedule(&h.admin(), session.id).await,
        Err(BookingError::Conflict { .. })
    ));

    h.clock.advance(Duration::minutes(16));
    let moved = h
        .booking
        .approve_reschedule(&h.admin(), session.id)
        .await
        .unwrap();
    assert_eq!(moved.time, "11:00");
}

#[tokio::test]
async fn repeat_reschedules_need_approval_when_configured() {
    let mut config = common::test_config();
    config.reschedule_approval_after = Some(1);
    let h = Harness::with_config(config).await;
    h.open_slots(h.date, &["10:00", "11:00", "12:00"]).await;
    let asha = h.client("Asha").await;
    let session = h.book(&asha, h.date, "10:00").await;

    let first = h
        .booking
        .reschedule(&asha, session.id, h.date, "11:00")
        .await
        .unwrap();
    assert!(matches!(first, RescheduleOutcome::Moved(_)));

    let second = h
        .booking
        .reschedule(&asha, session.id, h.date, "12:00")
        .await
        .unwrap();
    assert!(matches!(second, RescheduleOutcome::Requested(_)));
}

//=========================================================================================
// Cancel and complete
//=========================================================================================

#[tokio::test]
async fn cancelling_returns_the_slot_to_the_pool() {
    let h = Harness::new().await;
    h.open_slots(h.date, &["10:00", "11:00"]).await;
    let before = sorted(h.slots(h.date).await);
    let asha = h.client("Asha").await;
    let bilal = h.client("Bilal").await;
    let session = h.book(&asha, h.date, "10:00").await;
    h.outbox.take().await;

    assert!(matches!(
        h.booking.cancel(&bilal, session.id).await,
        Err(BookingError::Forbidden(_))
    ));
    let cancelled = h.booking.cancel(&asha, session.id).await.unwrap();
    assert_eq!(cancelled.status, SessionStatus::Cancelled);
    assert_eq!(sorted(h.slots(h.date).await), before);
    assert_eq!(
        h.outbox.take().await,
        vec![SideEffect::SessionNotice {
            session_id: session.id,
            kind: NoticeKind::Cancelled
        }]
    );

    // The freed slot can be sold again.
    h.book(&bilal, h.date, "10:00").await;
    assert!(matches!(
        h.booking.cancel(&asha, session.id).await,
        Err(BookingError::Validation(_))
    ));
}

#[tokio::test]
async fn started_sessions_can_be_completed_but_not_cancelled() {
    let h = Harness::new().await;
    h.open_slots(h.date, &["10:00"]).await;
    let asha = h.client("Asha").await;
    let meera = psychologist_actor(h.psychologist.id);
    let session = h.book(&asha, h.date, "10:00").await;

    assert!(matches!(
        h.booking.complete(&meera, session.id).await,
        Err(BookingError::Validation(_))
    ));

    let start = slot_start_utc(h.date, "10:00", h.settings.offset).unwrap();
    h.clock.set(start + Duration::minutes(5));
    assert!(matches!(
        h.booking.cancel(&asha, session.id).await,
        Err(BookingError::Validation(_))
    ));
    assert!(matches!(
        h.booking.complete(&asha, session.id).await,
        Err(BookingError::Forbidden(_))
    ));
    let done = h.booking.complete(&meera, session.id).await.unwrap();
    assert_eq!(done.status, SessionStatus::Completed);
}

#[tokio::test]
async fn sessions_are_listed_for_their_client_only() {
    let h = Harness::new().await;
    h.open_slots(h.date, &["10:00", "11:00"]).await;
    let asha = h.client("Asha").await;
    let bilal = h.client("Bilal").await;
    h.book(&asha, h.date, "10:00").await;
    h.book(&asha, h.date, "11:00").await;

    let listed = h.booking.list_sessions(&asha).await.unwrap();
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].time, "11:00");
    assert!(h.booking.list_sessions(&bilal).await.unwrap().is_empty());
    assert!(matches!(
        h.booking.list_sessions(&h.admin()).await,
        Err(BookingError::Forbidden(_))
    ));
}

//=========================================================================================
// Availability
//=========================================================================================

#[tokio::test]
async fn setting_availability_skips_booked_slots_and_checks_access() {
    let h = Harness::new().await;
    h.open_slots(h.date, &["10:00"]).await;
    let asha = h.client("Asha").await;
    h.book(&asha, h.date, "10:00").await;
    let meera = psychologist_actor(h.psychologist.id);

    let stored = h
        .booking
        .set_availability(
            &meera,
            h.psychologist.id,
            h.date,
            &["9:00".to_string(), "10:00".to_string(), "14:30".to_string()],
        )
        .await
        .unwrap();
    assert_eq!(stored.slots, vec!["09:00".to_string(), "14:30".to_string()]);

    assert!(matches!(
        h.booking
            .set_availability(&meera, h.psychologist.id, h.date, &["25:00".to_string()])
            .await,
        Err(BookingError::Validation(_))
    ));
    assert!(matches!(
        h.booking
            .set_availability(&asha, h.psychologist.id, h.date, &["09:00".to_string()])
            .await,
        Err(BookingError::Forbidden(_))
    ));
}

#[tokio::test]
async fn external_calendar_blocks_only_foreign_events() {
    let h = Harness::new().await;
    let linked = Psychologist {
        id: Uuid::new_v4(),
        user_id: None,
        name: "Dr. Kavya Nair".to_string(),
        email: "kavya@clinic.test".to_string(),
        calendar_credentials: Some("{\"refresh_token\":\"t\"}".to_string()),
        individual_price: Some(common::PRICE),
    };
    h.db.insert_psychologist(linked.clone()).await;
    h.db.set_availability(
        linked.id,
        h.date,
        vec!["10:00".to_string(), "11:00".to_string(), "12:00".to_string()],
    )
    .await
    .unwrap();

    let at = |time: &str| slot_start_utc(h.date, time, h.settings.offset).unwrap();
    *h.calendar.busy.lock().unwrap() = vec![
        BusyInterval {
            summary: "Dentist".to_string(),
            start: at("10:15"),
            end: at("10:45"),
        },
        BusyInterval {
            summary: "Therapy Session with Asha".to_string(),
            start: at("11:00"),
            end: at("12:00"),
        },
    ];

    let open = h.booking.available_slots(linked.id, h.date).await.unwrap();
    assert_eq!(open.slots, vec!["11:00".to_string(), "12:00".to_string()]);

    let synced = h
        .booking
        .sync_calendar(&h.admin(), linked.id, h.date)
        .await
        .unwrap();
    assert_eq!(synced.slots, vec!["11:00".to_string(), "12:00".to_string()]);

    assert!(matches!(
        h.booking
            .sync_calendar(&h.admin(), h.psychologist.id, h.date)
            .await,
        Err(BookingError::Validation(_))
    ));
}

#[tokio::test]
async fn calendar_outage_returns_the_unfiltered_day() {
    let h = Harness::new().await;
    let linked = Psychologist {
        id: Uuid::new_v4(),
        user_id: None,
        name: "Dr. Kavya Nair".to_string(),
        email: "kavya@clinic.test".to_string(),
        calendar_credentials: Some("{\"refresh_token\":\"t\"}".to_string()),
        individual_price: Some(common::PRICE),
    };
    h.db.insert_psychologist(linked.clone()).await;
    h.db.set_availability(linked.id, h.date, vec!["10:00".to_string(), "11:00".to_string()])
        .await
        .unwrap();
    let at = |time: &str| slot_start_utc(h.date, time, h.settings.offset).unwrap();
    *h.calendar.busy.lock().unwrap() = vec![BusyInterval {
        summary: "Dentist".to_string(),
        start: at("10:00"),
        end: at("11:00"),
    }];
    h.calendar.unreachable.store(true, Ordering::SeqCst);

    let open = h.booking.available_slots(linked.id, h.date).await.unwrap();
    assert_eq!(open.slots, vec!["10:00".to_string(), "11:00".to_string()]);
}
