//! Integration tests that exercise the Backup Engine, Restore Engine, and
//! Supervisor together against a mock Docker daemon — the same mock seam
//! each module's own unit tests use, just wired end to end.

use std::sync::Arc;

use serde_json::json;

use crate::docker::MockDockerTransport;
use crate::engine::backup::SelfReference;
use crate::engine::restore::{RestoreEngine, RestoreOutcome, RestoreRequest};
use crate::engine::BackupEngine;
use crate::supervisor::progress::{ProgressRegistry, ProgressStatus};
use crate::supervisor::{Supervisor, SubmitOutcome};

fn web_container_doc() -> serde_json::Value {
    json!({
        "Id": "abc123",
        "Name": "/web",
        "State": {"Running": true},
        "Config": {"Image": "nginx:1.25", "Env": ["FOO=bar"]},
        "HostConfig": {"Binds": ["webdata:/usr/share/nginx/html"]},
        "Mounts": [{"Name": "webdata", "Destination": "/usr/share/nginx/html", "Type": "volume", "Driver": "local"}]
    })
}

/// A backup sealed by [`BackupEngine`] must be directly consumable by
/// [`RestoreEngine`] without any intermediate translation — the archive is
/// the only contract between the two (spec.md §4.5 "reconstructs the run
/// spec fresh from the archived `container_config.json`, never from a
/// stored command string").
#[tokio::test]
async fn backup_then_restore_round_trips_through_the_archive() {
    let mut backup_mock = MockDockerTransport::new();
    backup_mock
        .expect_inspect_container()
        .returning(|_| Ok(crate::docker::inspect::InspectDocument::new(web_container_doc())));
    backup_mock.expect_export_image_stream().returning(|_, path| {
        std::fs::write(path, vec![0u8; 512]).unwrap();
        Ok(())
    });
    backup_mock.expect_backup_volume_data().returning(|_, path| {
        std::fs::write(path, b"fake volume tarball").unwrap();
        Ok(())
    });

    let backups_dir = tempfile::tempdir().unwrap();
    let backup_engine = BackupEngine::new(
        Arc::new(backup_mock),
        backups_dir.path().to_path_buf(),
        "test-host".into(),
        SelfReference::default(),
        std::time::Duration::from_secs(30),
        Arc::new(crate::audit::NoopAuditSink),
    );

    let progress = ProgressRegistry::new();
    let progress_id = progress.create("abc123", false);
    let archive_path = backup_engine
        .run("abc123", false, &progress_id, &progress)
        .await
        .expect("backup should succeed");

    let mut restore_mock = MockDockerTransport::new();
    restore_mock.expect_volume_exists().returning(|_| Ok(false));
    restore_mock.expect_create_volume().returning(|_| Ok(()));
    restore_mock.expect_restore_volume_data().returning(|_, _| Ok(()));
    restore_mock.expect_list_containers().returning(|_| Ok(vec![]));
    restore_mock.expect_network_exists().returning(|_| Ok(true));
    restore_mock
        .expect_load_image()
        .returning(|_| Err(crate::error::CoreError::Other("no real daemon in this test".into())));
    restore_mock
        .expect_create_container()
        .withf(|name, image, _| name == "web" && image == "nginx:1.25")
        .returning(|_, _, _| Ok("def456789012".into()));

    let restore_engine = RestoreEngine::new(Arc::new(restore_mock), std::time::Duration::from_secs(30));
    let outcome = restore_engine
        .restore(RestoreRequest {
            archive_path,
            new_name: None,
            overwrite_volumes: None,
            port_overrides: Default::default(),
        })
        .await
        .expect("restore should succeed");

    match outcome {
        RestoreOutcome::Restored { container_id, .. } => assert_eq!(container_id, "def456789012"),
        other => panic!("expected Restored, got {other:?}"),
    }
}

/// Two backups submitted back to back while the slot is held must both be
/// accepted — the second queues rather than being rejected — and run in
/// the order they were submitted (spec.md §4.7 "FIFO").
#[tokio::test]
async fn queued_backups_run_in_submission_order() {
    let mut mock = MockDockerTransport::new();
    mock.expect_inspect_container().returning(|id| {
        let mut doc = web_container_doc();
        doc["Id"] = json!(id);
        doc["Name"] = json!(format!("/{id}"));
        Ok(crate::docker::inspect::InspectDocument::new(doc))
    });
    mock.expect_export_image_stream().returning(|_, path| {
        std::fs::write(path, vec![0u8; 32]).unwrap();
        Ok(())
    });
    mock.expect_backup_volume_data().returning(|_, path| {
        std::fs::write(path, b"x").unwrap();
        Ok(())
    });

    let backups_dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(BackupEngine::new(
        Arc::new(mock),
        backups_dir.path().to_path_buf(),
        "test-host".into(),
        SelfReference::default(),
        std::time::Duration::from_secs(30),
        Arc::new(crate::audit::NoopAuditSink),
    ));
    let progress = Arc::new(ProgressRegistry::new());
    let supervisor = Supervisor::new(engine, progress.clone());

    let first = match supervisor.start("first", true, false) {
        SubmitOutcome::Accepted { progress_id, .. } => progress_id,
        SubmitOutcome::Busy { .. } => panic!("slot should have been free"),
    };
    let second = match supervisor.start("second", true, false) {
        SubmitOutcome::Accepted { progress_id, queued } => {
            assert!(queued, "second submission should have queued behind the first");
            progress_id
        }
        SubmitOutcome::Busy { .. } => panic!("queue_if_busy=true should never report busy"),
    };

    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(10);
    loop {
        let first_done = progress
            .get(&first)
            .map(|r| r.status == ProgressStatus::Complete)
            .unwrap_or(false);
        let second_done = progress
            .get(&second)
            .map(|r| r.status == ProgressStatus::Complete)
            .unwrap_or(false);
        if first_done && second_done {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "queue did not drain in time");
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }

    let status = supervisor.status();
    assert_eq!(status.queue_depth, 0);
    supervisor.shutdown();
}
