mod common;

use std::time::Duration;

use reelflow::config::settings::instance_name;
use reelflow::infrastructure::queue::MessageHandler;
use reelflow::modules::uploads::events::{AssetProcessedEvent, DeadLetter, UploadedEvent};
use reelflow::modules::uploads::model::{AssetStatus, Upload, UploadStatus};
use reelflow::modules::webhooks::dto::{NotificationRecord, StorageNotification};
use reelflow::workers::transcoder::{AttemptOutcome, Stage};

use common::{Harness, MAX_ATTEMPTS, Settlement, Settlements, message};

fn uploaded_event(upload: &Upload) -> UploadedEvent {
    UploadedEvent {
        upload_id: upload.id,
        s3_key: upload.s3_key.clone(),
    }
}

fn payload(upload: &Upload) -> Vec<u8> {
    serde_json::to_vec(&uploaded_event(upload)).unwrap()
}

/// Upload created, raw object stored and the notification ingested.
async fn ingested(h: &Harness) -> Upload {
    let upload = h.uploaded_object("clip.mp4").await;
    let notification = StorageNotification {
        records: vec![NotificationRecord::object_created("media", &upload.s3_key)],
    };
    let report = h.ingestion().ingest(&notification).await;
    assert_eq!(report.published.len(), 1);
    upload
}

#[tokio::test]
async fn uploaded_event_produces_ready_asset() {
    let h = Harness::new();
    let upload = ingested(&h).await;
    let worker = h.worker("w1");

    let settlements = Settlements::default();
    worker
        .handle(message(&h.subjects.uploaded(), &payload(&upload), 1, &settlements))
        .await;

    assert_eq!(settlements.all(), vec![Settlement::Ack]);
    assert_eq!(
        h.registry.history(&upload.s3_key),
        vec![UploadStatus::Uploaded, UploadStatus::Processing, UploadStatus::Ready]
    );

    let assets = h.registry.assets();
    assert_eq!(assets.len(), 1);
    let asset = &assets[0];
    assert_eq!(asset.upload_id, upload.id);
    assert_eq!(asset.hls_root, format!("hls/{}/master.m3u8", asset.id));
    assert_eq!(asset.status, AssetStatus::Ready);

    let stored = h.store.keys_under(&format!("hls/{}/", asset.id));
    assert!(stored.contains(&asset.hls_root));
    assert_eq!(stored.len(), 1 + 3 * 2);
    assert_eq!(
        h.store.content_type(&asset.hls_root).as_deref(),
        Some("application/vnd.apple.mpegurl")
    );
    assert_eq!(
        h.store
            .content_type(&format!("hls/{}/v0_segment000.ts", asset.id))
            .as_deref(),
        Some("video/mp2t")
    );

    let finished = h.registry.upload(&upload.s3_key).unwrap();
    assert_eq!(finished.claimed_by, None);

    let processed: Vec<AssetProcessedEvent> = h.bus.published(&h.subjects.asset_processed());
    assert_eq!(
        processed,
        vec![AssetProcessedEvent {
            asset_id: asset.id,
            upload_id: upload.id,
            status: AssetStatus::Ready,
        }]
    );
}

#[tokio::test]
async fn encoder_failure_leaves_processing_and_requests_redelivery() {
    let h = Harness::new();
    let upload = ingested(&h).await;
    let worker = h.worker("w1");
    h.encoder.set_failing(true);

    let settlements = Settlements::default();
    worker
        .handle(message(&h.subjects.uploaded(), &payload(&upload), 1, &settlements))
        .await;

    assert_eq!(settlements.all(), vec![Settlement::Nak]);
    assert_eq!(h.registry.status_of(&upload.s3_key), Some(UploadStatus::Processing));
    assert!(h.registry.assets().is_empty());
    assert_eq!(h.registry.upload(&upload.s3_key).unwrap().claimed_by, None);

    // Redelivery runs the same sequence again.
    worker
        .handle(message(&h.subjects.uploaded(), &payload(&upload), 2, &settlements))
        .await;
    assert_eq!(h.encoder.calls(), 2);
    assert_eq!(settlements.last(), Some(Settlement::Nak));

    // Another member of the group picks it up once the encoder recovers.
    h.encoder.set_failing(false);
    h.worker("w2")
        .handle(message(&h.subjects.uploaded(), &payload(&upload), 3, &settlements))
        .await;
    assert_eq!(settlements.last(), Some(Settlement::Ack));
    assert_eq!(h.registry.status_of(&upload.s3_key), Some(UploadStatus::Ready));
    assert_eq!(h.registry.assets().len(), 1);
}

#[tokio::test]
async fn attempt_error_names_failing_stage() {
    let h = Harness::new();
    let upload = ingested(&h).await;
    h.encoder.set_failing(true);

    let err = h.worker("w1").process(&uploaded_event(&upload)).await.unwrap_err();

    assert_eq!(err.stage, Stage::Encoded);
    assert_eq!(err.key, upload.s3_key);
    assert!(!err.is_permanent());
}

#[tokio::test]
async fn missing_raw_object_fails_at_download() {
    let h = Harness::new();
    let (upload, _) = h.uploads.create("clip.mp4", "clip.mp4").await.unwrap();
    h.uploads.mark_uploaded(&upload.s3_key).await.unwrap();

    let err = h.worker("w1").process(&uploaded_event(&upload)).await.unwrap_err();

    assert_eq!(err.stage, Stage::Downloaded);
    assert_eq!(h.encoder.calls(), 0);
}

#[tokio::test]
async fn redelivery_after_ready_is_acknowledged_without_work() {
    let h = Harness::new();
    let upload = ingested(&h).await;
    let worker = h.worker("w1");
    let settlements = Settlements::default();

    worker
        .handle(message(&h.subjects.uploaded(), &payload(&upload), 1, &settlements))
        .await;
    worker
        .handle(message(&h.subjects.uploaded(), &payload(&upload), 2, &settlements))
        .await;

    assert_eq!(settlements.all(), vec![Settlement::Ack, Settlement::Ack]);
    assert_eq!(h.encoder.calls(), 1);
    assert_eq!(h.registry.assets().len(), 1);
    assert_eq!(h.bus.count(&h.subjects.asset_processed()), 1);
}

#[tokio::test]
async fn live_foreign_lease_blocks_second_worker() {
    let h = Harness::new();
    let upload = ingested(&h).await;
    h.registry.force(
        &upload.s3_key,
        UploadStatus::Processing,
        Some("w1"),
        Some(time::Duration::minutes(30)),
    );

    let outcome = h.worker("w2").process(&uploaded_event(&upload)).await.unwrap();

    assert!(matches!(
        outcome,
        AttemptOutcome::ClaimedElsewhere { holder: Some(ref holder), until: Some(_) } if holder == "w1"
    ));
    assert_eq!(h.encoder.calls(), 0);
    assert!(h.registry.assets().is_empty());
}

#[tokio::test]
async fn delivery_blocked_by_crashed_holder_goes_back_to_broker() {
    let h = Harness::new();
    let upload = ingested(&h).await;
    // w1 claimed the upload and died without releasing it.
    h.uploads
        .mark_processing(&upload.s3_key, "w1", Duration::from_secs(3600))
        .await
        .unwrap();
    let settlements = Settlements::default();

    h.worker("w2")
        .handle(message(&h.subjects.uploaded(), &payload(&upload), 2, &settlements))
        .await;

    assert_eq!(settlements.all(), vec![Settlement::Nak]);
    assert_eq!(h.registry.status_of(&upload.s3_key), Some(UploadStatus::Processing));
    assert_eq!(h.encoder.calls(), 0);

    // Once the dead holder's lease runs out the redelivery starts over.
    h.registry.force(
        &upload.s3_key,
        UploadStatus::Processing,
        Some("w1"),
        Some(time::Duration::seconds(-1)),
    );
    h.worker("w2")
        .handle(message(&h.subjects.uploaded(), &payload(&upload), 3, &settlements))
        .await;

    assert_eq!(settlements.last(), Some(Settlement::Ack));
    assert_eq!(h.registry.status_of(&upload.s3_key), Some(UploadStatus::Ready));
    assert_eq!(h.encoder.calls(), 1);
    assert_eq!(h.registry.assets().len(), 1);
}

#[tokio::test]
async fn replicas_sharing_a_configured_name_do_not_share_a_lease() {
    let h = Harness::new();
    let upload = ingested(&h).await;
    let first = instance_name(Some("transcoder"));
    let second = instance_name(Some("transcoder"));
    h.uploads
        .mark_processing(&upload.s3_key, &first, Duration::from_secs(3600))
        .await
        .unwrap();

    let outcome = h.worker(&second).process(&uploaded_event(&upload)).await.unwrap();

    assert!(matches!(outcome, AttemptOutcome::ClaimedElsewhere { .. }));
    assert_eq!(h.encoder.calls(), 0);
    assert_eq!(
        h.registry.upload(&upload.s3_key).unwrap().claimed_by.as_deref(),
        Some(first.as_str())
    );
}

#[tokio::test]
async fn expired_lease_can_be_taken_over() {
    let h = Harness::new();
    let upload = ingested(&h).await;
    h.registry.force(
        &upload.s3_key,
        UploadStatus::Processing,
        Some("w1"),
        Some(time::Duration::minutes(-1)),
    );

    let outcome = h.worker("w2").process(&uploaded_event(&upload)).await.unwrap();

    assert!(matches!(outcome, AttemptOutcome::Completed { upload_id, .. } if upload_id == upload.id));
    assert_eq!(h.registry.status_of(&upload.s3_key), Some(UploadStatus::Ready));
}

#[tokio::test]
async fn recorded_asset_is_reused_instead_of_reencoding() {
    let h = Harness::new();
    let upload = ingested(&h).await;
    h.worker("w1").process(&uploaded_event(&upload)).await.unwrap();
    let first = h.registry.assets()[0].clone();

    // Simulates a crash between recording the asset and marking ready.
    h.registry.force(&upload.s3_key, UploadStatus::Processing, None, None);
    let outcome = h.worker("w2").process(&uploaded_event(&upload)).await.unwrap();

    assert_eq!(
        outcome,
        AttemptOutcome::Completed {
            asset_id: first.id,
            upload_id: upload.id
        }
    );
    assert_eq!(h.encoder.calls(), 1);
    assert_eq!(h.registry.assets().len(), 1);
}

#[tokio::test]
async fn exhausted_attempts_dead_letter_and_fail() {
    let h = Harness::new();
    let upload = ingested(&h).await;
    let worker = h.worker("w1");
    let settlements = Settlements::default();

    worker
        .handle(message(
            &h.subjects.uploaded(),
            &payload(&upload),
            MAX_ATTEMPTS + 1,
            &settlements,
        ))
        .await;

    assert_eq!(settlements.all(), vec![Settlement::Ack]);
    assert_eq!(h.registry.status_of(&upload.s3_key), Some(UploadStatus::Failed));
    assert_eq!(h.encoder.calls(), 0);

    let letters: Vec<DeadLetter> = h.bus.published(&h.subjects.dead_letter());
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].subject, h.subjects.uploaded());
    assert_eq!(letters[0].delivery_attempt, MAX_ATTEMPTS + 1);
    assert!(letters[0].payload.contains(&upload.s3_key));
}

#[tokio::test]
async fn exhausted_attempts_leave_live_foreign_lease_alone() {
    let h = Harness::new();
    let upload = ingested(&h).await;
    h.registry.force(
        &upload.s3_key,
        UploadStatus::Processing,
        Some("w1"),
        Some(time::Duration::minutes(2)),
    );
    let settlements = Settlements::default();

    h.worker("w2")
        .handle(message(
            &h.subjects.uploaded(),
            &payload(&upload),
            MAX_ATTEMPTS + 1,
            &settlements,
        ))
        .await;

    assert_eq!(settlements.all(), vec![Settlement::Ack]);
    assert_eq!(h.registry.status_of(&upload.s3_key), Some(UploadStatus::Processing));
    let letters: Vec<DeadLetter> = h.bus.published(&h.subjects.dead_letter());
    assert_eq!(letters.len(), 1);
    assert!(letters[0].reason.contains("leased by w1"));
}

#[tokio::test]
async fn malformed_key_is_dead_lettered_immediately() {
    let h = Harness::new();
    let bogus = UploadedEvent {
        upload_id: uuid::Uuid::new_v4(),
        s3_key: "original/nested/not-an-id.mp4".to_string(),
    };
    let settlements = Settlements::default();

    h.worker("w1")
        .handle(message(
            &h.subjects.uploaded(),
            &serde_json::to_vec(&bogus).unwrap(),
            1,
            &settlements,
        ))
        .await;

    assert_eq!(settlements.all(), vec![Settlement::Ack]);
    assert_eq!(h.bus.count(&h.subjects.dead_letter()), 1);
    assert_eq!(h.encoder.calls(), 0);
}

#[tokio::test]
async fn undecodable_payload_stays_queued_when_dead_letter_fails() {
    let h = Harness::new();
    h.bus.set_failing(true);
    let settlements = Settlements::default();

    h.worker("w1")
        .handle(message(&h.subjects.uploaded(), b"{", 1, &settlements))
        .await;

    assert_eq!(settlements.all(), vec![Settlement::Nak]);
}
