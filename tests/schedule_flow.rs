//! End-to-end scheduling scenarios over a scripted transport.

mod common;

use chrono::{Duration, Utc};
use common::{wait_for, Harness, SendScript};

use chatpace::chat::OutgoingPayload;
use chatpace::error::ServiceError;
use chatpace::service::{EditRequest, ScheduleRequest};
use chatpace::store::IntentStatus;

fn phone_request(content: &str) -> ScheduleRequest {
    ScheduleRequest {
        phone: Some("9876543210".into()),
        content: content.into(),
        ..ScheduleRequest::default()
    }
}

#[tokio::test]
async fn immediate_send_under_the_cap() {
    let h = Harness::start(30).await;
    let (_sub, mut rx) = h.bus.subscribe();

    let outcome = h.service.schedule(&phone_request("Hi")).unwrap();
    assert_eq!(outcome.intent.status, IntentStatus::Pending);

    let id = outcome.intent.id.clone();
    let store = h.store.clone();
    wait_for(
        move || {
            store
                .find_intent(&id)
                .unwrap()
                .is_some_and(|i| i.status == IntentStatus::Sent)
        },
        5_000,
    )
    .await;

    let sent = h.store.find_intent(&outcome.intent.id).unwrap().unwrap();
    assert!(sent.provider_message_id.is_some());
    assert_eq!(sent.attempts, 1);

    // The provider saw exactly one send, addressed with the country code.
    let sends = h.transport.sends();
    assert_eq!(sends.len(), 1);
    assert_eq!(sends[0].0, "919876543210@s.whatsapp.net");
    assert_eq!(
        sends[0].1,
        OutgoingPayload::Text { text: "Hi".into() }
    );

    // A message:sent event went out on the bus.
    let mut saw_sent = false;
    while let Ok(raw) = rx.try_recv() {
        let event: serde_json::Value = serde_json::from_str(&raw).unwrap();
        if event["type"] == "message:sent" && event["data"]["messageId"] == sent.id.as_str() {
            saw_sent = true;
        }
    }
    assert!(saw_sent);

    // Rate limit now reflects the send.
    let status = h.service.list(&Default::default()).unwrap();
    assert_eq!(status.len(), 1);

    h.stop().await;
}

#[tokio::test]
async fn future_schedule_edit_then_cancel_never_sends() {
    let h = Harness::start(30).await;

    let outcome = h
        .service
        .schedule(&ScheduleRequest {
            scheduled_at: Some(Utc::now() + Duration::hours(1)),
            ..phone_request("later")
        })
        .unwrap();
    assert_eq!(outcome.intent.status, IntentStatus::Pending);

    // Move it out another hour.
    let edited = h
        .service
        .edit(
            &outcome.intent.id,
            &EditRequest {
                scheduled_at: Some(Utc::now() + Duration::hours(2)),
                ..EditRequest::default()
            },
        )
        .unwrap();
    assert!(edited.scheduled_at > Utc::now() + Duration::minutes(110));

    // Cancel: intent terminal, job gone, nothing ever hits the wire.
    let cancelled = h.service.cancel(&outcome.intent.id).unwrap().unwrap();
    assert_eq!(cancelled.status, IntentStatus::Cancelled);

    // Give the runtime a moment to prove it has nothing to do.
    tokio::time::sleep(std::time::Duration::from_millis(700)).await;
    assert!(h.transport.sends().is_empty());

    h.stop().await;
}

#[tokio::test]
async fn cap_reached_rejects_immediate_without_persisting() {
    let h = Harness::start(2).await;

    // Fill the day.
    for text in ["one", "two"] {
        h.service.schedule(&phone_request(text)).unwrap();
    }
    let store = h.store.clone();
    wait_for(
        move || {
            store
                .count_terminal_success_in(
                    Utc::now() - Duration::hours(1),
                    Utc::now() + Duration::hours(1),
                )
                .unwrap()
                == 2
        },
        15_000,
    )
    .await;

    let err = h.service.schedule(&phone_request("three")).unwrap_err();
    match err {
        ServiceError::DailyCapReached(status) => {
            assert_eq!(status.sent_today, 2);
            assert_eq!(status.remaining, 0);
        }
        other => panic!("expected DailyCapReached, got {other:?}"),
    }

    // No third intent row, no third job.
    let intents = h.service.list(&Default::default()).unwrap();
    assert_eq!(intents.len(), 2);

    h.stop().await;
}

#[tokio::test]
async fn transient_failures_exhaust_then_retry_recovers() {
    let h = Harness::start(30).await;
    h.transport.script_sends([
        SendScript::Transient("connection reset"),
        SendScript::Transient("connection reset"),
        SendScript::Transient("connection reset"),
    ]);
    let (_sub, mut rx) = h.bus.subscribe();

    let outcome = h.service.schedule(&phone_request("flaky")).unwrap();
    let intent_id = outcome.intent.id.clone();

    // The job's attempts column ticks up on every transient requeue; use it
    // to walk the retry ladder without waiting out the real 5s/10s delays.
    let job_attempts = {
        let store = h.store.clone();
        let job_id = format!("intent-{intent_id}");
        move || -> Option<u32> {
            store
                .with_conn(|conn| {
                    use rusqlite::OptionalExtension;
                    Ok(conn
                        .query_row(
                            "SELECT attempts FROM jobs WHERE job_id = ?1",
                            [job_id.as_str()],
                            |row| row.get(0),
                        )
                        .optional()?)
                })
                .unwrap()
        }
    };

    // First attempt fires on its own (delay 0) and lands in the 5s backoff.
    let probe = job_attempts.clone();
    wait_for(move || probe() == Some(1), 10_000).await;

    // Skip the 5s wait; second attempt lands in the 10s backoff.
    h.fast_forward_jobs();
    let probe = job_attempts.clone();
    wait_for(move || probe() == Some(2), 10_000).await;

    // Third attempt exhausts the job.
    h.fast_forward_jobs();

    let store = h.store.clone();
    let id = intent_id.clone();
    wait_for(
        move || {
            store
                .find_intent(&id)
                .unwrap()
                .is_some_and(|i| i.status == IntentStatus::Failed)
        },
        10_000,
    )
    .await;

    let failed = h.store.find_intent(&intent_id).unwrap().unwrap();
    assert_eq!(failed.failure_reason.as_deref(), Some("connection reset"));

    let mut saw_failed = false;
    while let Ok(raw) = rx.try_recv() {
        let event: serde_json::Value = serde_json::from_str(&raw).unwrap();
        if event["type"] == "message:failed" {
            saw_failed = true;
        }
    }
    assert!(saw_failed);

    // Explicit retry resets to pending and the (now unscripted) send lands.
    let retried = h.service.retry(&intent_id).unwrap();
    assert_eq!(retried.status, IntentStatus::Pending);
    assert_eq!(retried.attempts, 0);

    let store = h.store.clone();
    let id = intent_id.clone();
    wait_for(
        move || {
            store
                .find_intent(&id)
                .unwrap()
                .is_some_and(|i| i.status == IntentStatus::Sent)
        },
        10_000,
    )
    .await;

    h.stop().await;
}

#[tokio::test]
async fn document_media_sends_with_derived_file_name() {
    let h = Harness::start(30).await;

    let outcome = h
        .service
        .schedule(&ScheduleRequest {
            media_url: Some("https://cdn.example/docs/invoice-7.pdf".into()),
            media_type: Some("document".into()),
            ..phone_request("invoice attached")
        })
        .unwrap();

    let store = h.store.clone();
    let id = outcome.intent.id.clone();
    wait_for(
        move || {
            store
                .find_intent(&id)
                .unwrap()
                .is_some_and(|i| i.status == IntentStatus::Sent)
        },
        5_000,
    )
    .await;

    let sends = h.transport.sends();
    assert_eq!(
        sends[0].1,
        OutgoingPayload::Document {
            url: "https://cdn.example/docs/invoice-7.pdf".into(),
            caption: "invoice attached".into(),
            file_name: "invoice-7.pdf".into(),
        }
    );

    h.stop().await;
}

#[tokio::test]
async fn sent_intents_get_delivered_on_ack() {
    let h = Harness::start(30).await;

    let outcome = h.service.schedule(&phone_request("track me")).unwrap();
    let store = h.store.clone();
    let id = outcome.intent.id.clone();
    wait_for(
        move || {
            store
                .find_intent(&id)
                .unwrap()
                .is_some_and(|i| i.status == IntentStatus::Sent)
        },
        5_000,
    )
    .await;

    let provider_id = h
        .store
        .find_intent(&outcome.intent.id)
        .unwrap()
        .unwrap()
        .provider_message_id
        .unwrap();
    h.transport
        .inject(chatpace::chat::ConnectionEvent::DeliveryAck {
            provider_message_id: provider_id,
            status: chatpace::chat::AckStatus::Delivered,
        })
        .await;

    let store = h.store.clone();
    let id = outcome.intent.id.clone();
    wait_for(
        move || {
            store
                .find_intent(&id)
                .unwrap()
                .is_some_and(|i| i.status == IntentStatus::Delivered)
        },
        5_000,
    )
    .await;

    let delivered = h.store.find_intent(&outcome.intent.id).unwrap().unwrap();
    assert!(delivered.sent_at.is_some());
    assert!(delivered.delivered_at.is_some());

    h.stop().await;
}
