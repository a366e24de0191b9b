//! Integration tests driving whole generation runs through the runner.

mod common;

use bytes::Bytes;
use client_lib::error::ClientError;
use client_lib::runner::StreamOutcome;
use common::{frame, ragged, Call, Harness, Script, RECORD, THREE_PAGES};
use page_forge_core::ports::{PortError, ReferenceMode};
use page_forge_core::{
    CacheKey, ImageStatus, Reconciler, Stage, StreamError, TaskId, TaskStatus,
};
use serde_json::json;
use std::io::Write;

fn generate_call(pages: usize) -> Call {
    Call::Generate {
        record_id: RECORD.to_string(),
        pages,
    }
}

#[tokio::test]
async fn generate_applies_a_ragged_stream_in_order() {
    let wire = [
        frame("progress", json!({"status": "batch_start", "message": "开始生成"})),
        frame("progress", json!({"index": 0, "status": "generating", "current": 0, "total": 3})),
        frame("complete", json!({"index": 0, "status": "done", "image_url": "/api/images/rec-1/0.png"})),
        frame("complete", json!({"index": 1, "status": "done", "image_url": "/api/images/rec-1/1.png"})),
        frame("error", json!({"index": 2, "status": "error", "message": "内容违规", "retryable": false})),
        frame(
            "finish",
            json!({"success": false, "record_id": RECORD, "total": 3, "completed": 2, "failed": 1, "failed_indices": [2]}),
        ),
    ]
    .concat();

    let harness = Harness::new(vec![Script::Stream(ragged(&wire))]);
    let mut session = harness.session(THREE_PAGES);

    let outcome = harness.generator.generate(&mut session, None).await.unwrap();

    assert_eq!(outcome, StreamOutcome::Finished);
    assert_eq!(harness.transport.calls(), vec![generate_call(3)]);

    let progress = session.progress();
    assert_eq!((progress.completed, progress.total), (2, 3));
    assert_eq!(progress.status, TaskStatus::Done);
    assert_eq!(session.state().stage, Stage::Result);
    assert_eq!(session.state().task_id, Some(TaskId::new(RECORD)));

    let failed = session.image_at(2).unwrap();
    assert_eq!(failed.status, ImageStatus::Error);
    assert_eq!(failed.error_detail.as_deref(), Some("内容违规"));
    assert!(!failed.retryable);
    assert_eq!(session.image_at(1).unwrap().locator, "/api/images/rec-1/1.png");

    assert_eq!(harness.store.keys(), vec!["generator-state-rec-1".to_string()]);
    let restored = harness.restore();
    assert_eq!(restored.progress().completed, 2);
    assert_eq!(restored.image_at(0).unwrap().locator, "/api/images/rec-1/0.png");
}

#[tokio::test]
async fn transport_failure_keeps_progress_and_continue_finishes_the_run() {
    let mut first = ragged(&[
        frame("progress", json!({"index": 0, "status": "generating"})),
        frame("complete", json!({"index": 0, "image_url": "/0.png"})),
    ]
    .concat());
    first.push(Err(PortError::Unexpected("connection reset".to_string())));
    first.push(Ok(Bytes::from_static(b"event: complete\ndata: {\"index\": 1}\n\n")));

    let resumed = [
        frame("continue_start", json!({"task_id": RECORD, "pending_count": 2, "total": 3, "completed": 1})),
        frame("complete", json!({"index": 1, "image_url": "/1.png"})),
        frame("complete", json!({"index": 2, "image_url": "/2.png"})),
        frame("finish", json!({"task_id": RECORD, "success": true, "completed": 3})),
    ]
    .concat();

    let harness = Harness::new(vec![Script::Stream(first), Script::Stream(ragged(&resumed))]);
    let mut session = harness.session(THREE_PAGES);

    let err = harness.generator.generate(&mut session, None).await.unwrap_err();
    assert!(matches!(err, ClientError::Stream(StreamError::Transport(_))));
    assert_eq!(session.progress().status, TaskStatus::Error);
    assert_eq!(session.progress().completed, 1);
    assert_eq!(session.image_at(0).unwrap().status, ImageStatus::Done);
    assert_eq!(session.image_at(1).unwrap().status, ImageStatus::Generating);

    let outcome = harness.generator.continue_generation(&mut session).await.unwrap();
    assert_eq!(outcome, StreamOutcome::Finished);
    assert_eq!(session.progress().completed, 3);
    assert_eq!(session.progress().status, TaskStatus::Done);
    assert!(session.pending_pages().is_empty());
    assert_eq!(
        harness.transport.calls(),
        vec![generate_call(3), Call::Continue(RECORD.to_string())]
    );
}

#[tokio::test]
async fn stopped_stream_pauses_the_session_and_survives_a_restart() {
    let wire = [
        frame("complete", json!({"index": 0, "image_url": "/0.png"})),
        frame("stopped", json!({"record_id": RECORD, "message": "已停止", "completed": 1, "pending": 2})),
        frame("complete", json!({"index": 1, "image_url": "/late.png"})),
    ]
    .concat();

    let harness = Harness::new(vec![Script::Stream(ragged(&wire))]);
    let mut session = harness.session(THREE_PAGES);

    harness
        .generator
        .stop(&session.state().record_id.clone().unwrap())
        .await
        .unwrap();
    let outcome = harness.generator.generate(&mut session, None).await.unwrap();

    assert_eq!(outcome, StreamOutcome::Stopped);
    assert_eq!(session.progress().status, TaskStatus::Paused);
    assert_eq!(session.image_at(1).unwrap().status, ImageStatus::Generating);
    assert_eq!(session.image_at(1).unwrap().locator, "");

    let restored = harness.restore();
    assert_eq!(restored.progress().status, TaskStatus::Paused);
    assert_eq!(restored.pending_pages().len(), 2);
    assert_eq!(
        harness.transport.calls(),
        vec![Call::Stop(RECORD.to_string()), generate_call(3)]
    );
}

#[tokio::test]
async fn retry_resubmits_only_failed_pages() {
    let generated = [
        frame("complete", json!({"index": 0, "image_url": "/0.png"})),
        frame("error", json!({"index": 1, "message": "timeout"})),
        frame("complete", json!({"index": 2, "image_url": "/2.png"})),
        frame("finish", json!({"record_id": RECORD, "success": false, "failed_indices": [1]})),
    ]
    .concat();
    let retried = [
        frame("retry_start", json!({"total": 1, "message": "重试中"})),
        frame("complete", json!({"index": 1, "image_url": "/1.png"})),
        frame("retry_finish", json!({"success": true, "total": 1, "completed": 1, "failed": 0})),
    ]
    .concat();

    let harness = Harness::new(vec![
        Script::Stream(ragged(&generated)),
        Script::Stream(ragged(&retried)),
    ]);
    let mut session = harness.session(THREE_PAGES);

    harness.generator.generate(&mut session, None).await.unwrap();
    assert!(session.has_failures());

    let outcome = harness.generator.retry_failed(&mut session).await.unwrap();
    assert_eq!(outcome, StreamOutcome::RetryFinished);
    assert!(!session.has_failures());
    assert_eq!(session.image_at(1).unwrap().locator, "/1.png");
    assert_eq!(session.progress().completed, 3);
    assert_eq!(
        harness.transport.calls()[1],
        Call::Retry {
            record_id: RECORD.to_string(),
            positions: vec![1]
        }
    );

    // Nothing left to retry: no request is made.
    let outcome = harness.generator.retry_failed(&mut session).await.unwrap();
    assert_eq!(outcome, StreamOutcome::RetryFinished);
    assert_eq!(harness.transport.calls().len(), 2);
}

fn one_failure_wire() -> String {
    [
        frame("complete", json!({"index": 0, "image_url": "/0.png"})),
        frame("error", json!({"index": 1, "message": "timeout"})),
        frame("complete", json!({"index": 2, "image_url": "/2.png"})),
        frame("finish", json!({"record_id": RECORD, "success": false, "failed_indices": [1]})),
    ]
    .concat()
}

#[tokio::test]
async fn refused_retry_leaves_failed_images_retryable() {
    let retried = [
        frame("complete", json!({"index": 1, "image_url": "/1.png"})),
        frame("retry_finish", json!({"success": true, "completed": 1, "failed": 0})),
    ]
    .concat();
    let harness = Harness::new(vec![
        Script::Stream(ragged(&one_failure_wire())),
        Script::Refuse(503),
        Script::Stream(ragged(&retried)),
    ]);
    let mut session = harness.session(THREE_PAGES);
    harness.generator.generate(&mut session, None).await.unwrap();

    let err = harness.generator.retry_failed(&mut session).await.unwrap_err();
    assert!(matches!(err, ClientError::Port(PortError::Status(503))));

    let failed = session.image_at(1).unwrap();
    assert_eq!(failed.status, ImageStatus::Error);
    assert_eq!(failed.error_detail.as_deref(), Some("timeout"));
    assert!(session.has_failures());
    assert_eq!(harness.restore().image_at(1).unwrap().status, ImageStatus::Error);

    let outcome = harness.generator.retry_failed(&mut session).await.unwrap();
    assert_eq!(outcome, StreamOutcome::RetryFinished);
    assert_eq!(harness.transport.calls().len(), 3);
    assert_eq!(session.image_at(1).unwrap().locator, "/1.png");
}

#[tokio::test]
async fn retry_stream_closing_early_marks_its_pages_failed_again() {
    let retried = [
        frame("retry_start", json!({"total": 1})),
        frame("progress", json!({"index": 1, "status": "retrying"})),
    ]
    .concat();
    let harness = Harness::new(vec![
        Script::Stream(ragged(&one_failure_wire())),
        Script::Stream(ragged(&retried)),
    ]);
    let mut session = harness.session(THREE_PAGES);
    harness.generator.generate(&mut session, None).await.unwrap();

    let outcome = harness.generator.retry_failed(&mut session).await.unwrap();
    assert_eq!(outcome, StreamOutcome::Closed);
    assert_eq!(session.image_at(1).unwrap().status, ImageStatus::Error);
    assert_eq!(session.failed_pages().len(), 1);
}

#[tokio::test]
async fn regenerate_replaces_one_image() {
    let harness = Harness::new(vec![
        Script::Stream(ragged(&one_failure_wire())),
        Script::Image("/api/images/rec-1/1.png".to_string()),
    ]);
    let mut session = harness.session(THREE_PAGES);
    harness.generator.generate(&mut session, None).await.unwrap();

    let image = harness
        .generator
        .regenerate(&mut session, 1, ReferenceMode::Cover)
        .await
        .unwrap();

    assert!(image.locator.starts_with("/api/images/rec-1/1.png?t="));
    assert_eq!(image.status, ImageStatus::Done);
    assert!(!session.has_failures());
    assert_eq!(session.progress().completed, 3);
    assert_eq!(
        harness.transport.calls()[1],
        Call::Regenerate {
            record_id: RECORD.to_string(),
            position: 1
        }
    );
    assert_eq!(harness.restore().image_at(1).unwrap().locator, image.locator);
}

#[tokio::test]
async fn failed_regenerate_keeps_the_previous_image() {
    let harness = Harness::new(vec![
        Script::Stream(ragged(&one_failure_wire())),
        Script::Refuse(500),
    ]);
    let mut session = harness.session(THREE_PAGES);
    harness.generator.generate(&mut session, None).await.unwrap();

    let err = harness
        .generator
        .regenerate(&mut session, 0, ReferenceMode::Cover)
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Port(PortError::Status(500))));

    let kept = session.image_at(0).unwrap();
    assert_eq!(kept.status, ImageStatus::Done);
    assert_eq!(kept.locator, "/0.png");
    assert_eq!(session.progress().completed, 2);

    let out_of_range = harness
        .generator
        .regenerate(&mut session, 9, ReferenceMode::Cover)
        .await
        .unwrap_err();
    assert!(matches!(out_of_range, ClientError::Reconcile(_)));
    assert_eq!(harness.transport.calls().len(), 2);
}

#[tokio::test]
async fn stream_closing_without_a_terminal_event_can_be_continued() {
    let wire = frame("complete", json!({"index": 0, "image_url": "/0.png"}));
    let harness = Harness::new(vec![Script::Stream(ragged(&wire))]);
    let mut session = harness.session(THREE_PAGES);

    let outcome = harness.generator.generate(&mut session, None).await.unwrap();
    assert_eq!(outcome, StreamOutcome::Closed);
    assert_eq!(session.progress().status, TaskStatus::Error);
    assert!(session.resume());
}

#[tokio::test]
async fn refused_request_fails_the_run() {
    let harness = Harness::new(vec![Script::Refuse(503)]);
    let mut session = harness.session(THREE_PAGES);

    let err = harness.generator.generate(&mut session, None).await.unwrap_err();
    assert!(matches!(err, ClientError::Port(PortError::Status(503))));
    assert_eq!(session.progress().status, TaskStatus::Error);
}

#[tokio::test]
async fn unbound_session_is_rejected_before_any_request() {
    let harness = Harness::new(Vec::new());
    let mut session = harness.generator.open_session(CacheKey::Draft);
    session.append(page_forge_core::PageKind::Content, "lonely page");

    let err = harness.generator.generate(&mut session, None).await.unwrap_err();
    assert!(matches!(err, ClientError::Internal(_)));
    assert!(harness.transport.calls().is_empty());
}

#[tokio::test]
async fn replay_decodes_a_captured_stream_file() {
    let mut capture = tempfile::NamedTempFile::new().unwrap();
    write!(
        capture,
        "{}{}{}",
        frame("complete", json!({"index": 2, "image_url": "/2.png"})),
        frame("complete", json!({"index": 0, "image_url": "/0.png"})),
        frame("finish", json!({"record_id": RECORD}))
    )
    .unwrap();
    capture.flush().unwrap();

    let harness = Harness::new(Vec::new());
    let mut session = harness.session(THREE_PAGES);

    let outcome = harness
        .generator
        .replay(capture.path(), &mut session)
        .await
        .unwrap();
    assert_eq!(outcome, StreamOutcome::Finished);
    assert_eq!(session.progress().completed, 2);
    let pending: Vec<usize> = session.pending_pages().iter().map(|p| p.position).collect();
    assert_eq!(pending, vec![1]);
}

#[tokio::test]
async fn open_session_prefers_the_cached_state() {
    let harness = Harness::new(Vec::new());
    let session = harness.session(THREE_PAGES);
    drop(session);

    let reopened = harness
        .generator
        .open_session(CacheKey::Record(page_forge_core::RecordId::new(RECORD)));
    assert_eq!(reopened.pages().len(), 3);
    assert_eq!(reopened.state().topic, "weekend trip");
    assert!(Reconciler::restore(harness.generator.state().cache.clone(), CacheKey::Draft).is_none());
}
