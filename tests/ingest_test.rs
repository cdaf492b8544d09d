//! Change-event ingestion: table/op combinations map onto the right
//! job submissions.

use std::sync::Arc;

use drcal_jobs::ingest::{ChangeEvent, ChangeOp, EventIngestor};
use drcal_jobs::queue::QueueClient;
use drcal_jobs::store::memory::MemoryQueueStore;
use serde_json::json;

fn ingestor() -> (Arc<MemoryQueueStore>, EventIngestor) {
    let store = Arc::new(MemoryQueueStore::new());
    let queue = QueueClient::new(store.clone());
    (store, EventIngestor::new(queue))
}

#[tokio::test]
async fn appointment_insert_enqueues_processing() {
    let (_store, ingestor) = ingestor();

    let jobs = ingestor
        .ingest(ChangeEvent {
            table: "appointments".to_string(),
            op: ChangeOp::Insert,
            record: Some(json!({"id": "A1", "patient_email": "pat@example.com"})),
            old_record: None,
        })
        .await
        .unwrap();

    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].kind, "process-appointment");
    assert_eq!(jobs[0].priority, 1);
    assert_eq!(jobs[0].payload["id"], "A1");
}

#[tokio::test]
async fn waitlist_insert_enqueues_notification() {
    let (_store, ingestor) = ingestor();

    let jobs = ingestor
        .ingest(ChangeEvent {
            table: "waitlist".to_string(),
            op: ChangeOp::Insert,
            record: Some(json!({"id": "W1", "patient_email": "pat@example.com"})),
            old_record: None,
        })
        .await
        .unwrap();

    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].kind, "send-notification");
    assert_eq!(jobs[0].priority, 2);
    assert_eq!(jobs[0].payload["type"], "waitlist_added");
    assert_eq!(jobs[0].payload["recipient"], "pat@example.com");
}

#[tokio::test]
async fn status_change_enqueues_notification_with_both_statuses() {
    let (_store, ingestor) = ingestor();

    let jobs = ingestor
        .ingest(ChangeEvent {
            table: "appointments".to_string(),
            op: ChangeOp::Update,
            record: Some(json!({
                "id": "A1", "status": "confirmed", "patient_email": "pat@example.com"
            })),
            old_record: Some(json!({"id": "A1", "status": "pending"})),
        })
        .await
        .unwrap();

    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].payload["type"], "appointment_status_changed");
    assert_eq!(jobs[0].payload["old_status"], "pending");
    assert_eq!(jobs[0].payload["new_status"], "confirmed");
}

#[tokio::test]
async fn update_without_status_change_is_skipped() {
    let (_store, ingestor) = ingestor();

    let jobs = ingestor
        .ingest(ChangeEvent {
            table: "appointments".to_string(),
            op: ChangeOp::Update,
            record: Some(json!({"id": "A1", "status": "pending", "doctor_id": "D2"})),
            old_record: Some(json!({"id": "A1", "status": "pending", "doctor_id": "D1"})),
        })
        .await
        .unwrap();

    assert!(jobs.is_empty());
}

#[tokio::test]
async fn appointment_delete_enqueues_cancellation_from_old_record() {
    let (_store, ingestor) = ingestor();

    let jobs = ingestor
        .ingest(ChangeEvent {
            table: "appointments".to_string(),
            op: ChangeOp::Delete,
            record: None,
            old_record: Some(json!({"id": "A1", "patient_email": "pat@example.com"})),
        })
        .await
        .unwrap();

    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].payload["type"], "appointment_cancelled");
    assert_eq!(jobs[0].payload["recipient"], "pat@example.com");
    assert_eq!(jobs[0].payload["appointment"]["id"], "A1");
}

#[tokio::test]
async fn auth_user_insert_enqueues_welcome_notification() {
    let (_store, ingestor) = ingestor();

    let jobs = ingestor
        .ingest(ChangeEvent {
            table: "auth.users".to_string(),
            op: ChangeOp::Insert,
            record: Some(json!({"id": "U1", "email": "new@example.com"})),
            old_record: None,
        })
        .await
        .unwrap();

    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].payload["type"], "user_created");
    assert_eq!(jobs[0].payload["recipient"], "new@example.com");
}

#[tokio::test]
async fn unknown_table_is_skipped() {
    let (store, ingestor) = ingestor();

    let jobs = ingestor
        .ingest(ChangeEvent {
            table: "professionals".to_string(),
            op: ChangeOp::Insert,
            record: Some(json!({"id": "P1"})),
            old_record: None,
        })
        .await
        .unwrap();

    assert!(jobs.is_empty());
    use drcal_jobs::store::QueueStore;
    assert_eq!(store.stats().await.unwrap().waiting, 0);
}

#[tokio::test]
async fn change_event_parses_webhook_json() {
    let event: ChangeEvent = serde_json::from_str(
        r#"{
            "table": "appointments",
            "type": "INSERT",
            "record": {"id": "A1"}
        }"#,
    )
    .unwrap();

    assert_eq!(event.table, "appointments");
    assert_eq!(event.op, ChangeOp::Insert);
    assert!(event.record.is_some());
    assert!(event.old_record.is_none());
}
