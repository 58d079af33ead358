//! Startup recovery
//!
//! Runs once after the store is loaded. Records without a terminal timestamp
//! are relaunched with a freshly built plan; a live job whose stop was
//! requested but never completed is finished instead of resumed.

use crate::controller::{Controller, Lifecycle};
use crate::jobs::Record;
use crate::store::LoadedRecords;
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::{info, warn};

/// IDs grouped by what recovery did with them.
#[derive(Debug, Default)]
pub struct RecoveryReport {
    pub resumed: Vec<String>,
    pub finalized: Vec<String>,
    pub failed: Vec<String>,
}

fn sorted<R: Record>(records: HashMap<String, R>) -> Vec<R> {
    let mut records: Vec<R> = records.into_values().collect();
    records.sort_by(|a, b| a.id().cmp(b.id()));
    records
}

pub(crate) async fn recover(controller: &Controller, loaded: LoadedRecords) -> RecoveryReport {
    let mut report = RecoveryReport::default();
    let LoadedRecords { jobs, uploads } = loaded;

    for job in sorted(jobs) {
        if job.is_terminal() {
            if let Err(e) = controller.publisher().unlink_live(&job.id) {
                warn!(job_id = %job.id, error = %e, "failed to remove live mirror");
            }
            continue;
        }

        if job.stop_requested_at.is_some() {
            info!(job_id = %job.id, "finishing interrupted stop");
            report.finalized.push(job.id.clone());
            controller.finish(job, false).await;
            continue;
        }

        resume(controller, job, &mut report).await;
    }

    for upload in sorted(uploads) {
        if upload.is_terminal() {
            continue;
        }
        resume(controller, upload, &mut report).await;
    }

    report
}

async fn resume<R: Lifecycle>(controller: &Controller, record: R, report: &mut RecoveryReport) {
    let id = record.id().to_string();
    let output_dir = if record.output_path().trim().is_empty() {
        controller.store().record_dir(R::KIND, &id)
    } else {
        PathBuf::from(record.output_path())
    };

    // Launch failures are logged by the controller; the record stays as it was.
    match controller.launch(record, &output_dir).await {
        Ok(_) => {
            info!(job_id = %id, kind = %R::KIND, "job resumed");
            report.resumed.push(id);
        }
        Err(_) => report.failed.push(id),
    }
}

#[cfg(test)]
mod tests {
    use crate::controller::test_support::*;
    use crate::controller::{Controller, ControllerError};
    use crate::encode::build_transcode_plan;
    use crate::encode::supervisor::testing::FakeLauncher;
    use crate::jobs::{to_slash, Job, JobKind, Rendition, UploadJob};
    use crate::store::{MetadataStore, StoreError, METADATA_FILE};
    use chrono::Utc;
    use std::fs;
    use std::path::Path;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn seed_store(root: &Path) -> MetadataStore {
        MetadataStore::open(root.join("work")).unwrap()
    }

    fn persisted_job(store: &MetadataStore, id: &str, renditions: Vec<Rendition>) -> Job {
        let dir = store.record_dir(JobKind::Live, id);
        Job {
            id: id.to_string(),
            channel_id: "c1".to_string(),
            session_id: "s1".to_string(),
            origin_url: "rtmp://origin/c1".to_string(),
            renditions,
            output_path: to_slash(&dir),
            playback_url: to_slash(&dir.join("index.m3u8")),
            created_at: Utc::now(),
            stopped_at: None,
            stop_requested_at: None,
        }
    }

    #[tokio::test]
    async fn test_active_job_is_restarted_with_same_layout() {
        let temp_dir = TempDir::new().unwrap();
        let store = seed_store(temp_dir.path());
        let job = persisted_job(&store, "live-7", ladder(&[("720p", 2800), ("480p", 1500)]));
        store.save(&job).unwrap();

        let launcher = Arc::new(FakeLauncher::default());
        let controller = Controller::start(&test_config(temp_dir.path(), None), launcher.clone())
            .await
            .unwrap();

        assert_eq!(launcher.launched_ids(), vec!["live-7".to_string()]);
        assert!(controller.registry().contains("live-7").await);
        assert!(controller.registry().process("live-7").await.is_some());

        let expected = build_transcode_plan(
            &job.origin_url,
            Path::new(&job.output_path),
            &job.renditions,
        )
        .unwrap();
        let plan = launcher.plan_for("live-7").unwrap();
        assert_eq!(plan.output_dir_string(), job.output_path);
        assert_eq!(plan.args, expected.args);

        let stored = controller.store().load().unwrap().jobs.remove("live-7").unwrap();
        assert_eq!(stored.output_path, job.output_path);
        assert_eq!(stored.playback_url, expected.master);
        assert_eq!(stored.renditions, expected.renditions);
        assert!(stored.renditions[0].manifest_url.ends_with("/live-7/720p/index.m3u8"));
    }

    #[tokio::test]
    async fn test_terminal_records_are_not_restarted() {
        let temp_dir = TempDir::new().unwrap();
        let store = seed_store(temp_dir.path());

        let mut job = persisted_job(&store, "live-1", Vec::new());
        job.stopped_at = Some(Utc::now());
        store.save(&job).unwrap();

        let upload = UploadJob {
            id: "upload-1".to_string(),
            channel_id: "c1".to_string(),
            upload_id: "u1".to_string(),
            source_url: "/incoming/a.mp4".to_string(),
            filename: String::new(),
            renditions: Vec::new(),
            output_path: String::new(),
            playback_url: String::new(),
            created_at: Utc::now(),
            completed_at: Some(Utc::now()),
        };
        store.save(&upload).unwrap();

        let launcher = Arc::new(FakeLauncher::default());
        let controller = Controller::start(&test_config(temp_dir.path(), None), launcher.clone())
            .await
            .unwrap();

        assert!(launcher.launched_ids().is_empty());
        assert!(controller.registry().active_ids().await.is_empty());
    }

    #[tokio::test]
    async fn test_interrupted_stop_is_finalized_not_resumed() {
        let temp_dir = TempDir::new().unwrap();
        let store = seed_store(temp_dir.path());
        let mut job = persisted_job(&store, "live-3", Vec::new());
        job.stop_requested_at = Some(Utc::now());
        store.save(&job).unwrap();

        let launcher = Arc::new(FakeLauncher::default());
        let controller = Controller::start(&test_config(temp_dir.path(), None), launcher.clone())
            .await
            .unwrap();

        assert!(launcher.launched_ids().is_empty());
        assert!(!controller.registry().contains("live-3").await);
        let stored = controller.store().load().unwrap().jobs.remove("live-3").unwrap();
        assert!(stored.stopped_at.is_some());
    }

    #[tokio::test]
    async fn test_upload_and_legacy_job_are_resumed() {
        let temp_dir = TempDir::new().unwrap();
        let store = seed_store(temp_dir.path());

        let upload = UploadJob {
            id: "upload-2".to_string(),
            channel_id: "c1".to_string(),
            upload_id: "u2".to_string(),
            source_url: "/incoming/b.mp4".to_string(),
            filename: "b.mp4".to_string(),
            renditions: Vec::new(),
            output_path: String::new(),
            playback_url: String::new(),
            created_at: Utc::now(),
            completed_at: None,
        };
        store.save(&upload).unwrap();

        let legacy_dir = store.record_dir(JobKind::Live, "live-old");
        fs::create_dir_all(&legacy_dir).unwrap();
        fs::write(
            legacy_dir.join(METADATA_FILE),
            r#"{"ChannelID":"c1","SessionID":"s1","OriginURL":"rtmp://o/c1","CreatedAt":"2024-03-01T10:00:00Z"}"#,
        )
        .unwrap();

        let launcher = Arc::new(FakeLauncher::default());
        let controller = Controller::start(&test_config(temp_dir.path(), None), launcher.clone())
            .await
            .unwrap();

        assert_eq!(
            launcher.launched_ids(),
            vec!["live-old".to_string(), "upload-2".to_string()]
        );
        assert_eq!(
            controller.registry().active_ids().await,
            vec!["live-old".to_string(), "upload-2".to_string()]
        );

        let loaded = controller.store().load().unwrap();
        assert_eq!(loaded.jobs["live-old"].output_path, to_slash(&legacy_dir));
        assert_eq!(
            loaded.uploads["upload-2"].output_path,
            to_slash(&store.record_dir(JobKind::Upload, "upload-2"))
        );
    }

    #[tokio::test]
    async fn test_failed_restart_is_left_unregistered() {
        let temp_dir = TempDir::new().unwrap();
        let store = seed_store(temp_dir.path());
        let job = persisted_job(&store, "live-5", Vec::new());
        store.save(&job).unwrap();

        let controller = Controller::start(
            &test_config(temp_dir.path(), None),
            Arc::new(FakeLauncher::failing()),
        )
        .await
        .expect("recovery failures must not abort startup");

        assert!(!controller.registry().contains("live-5").await);
        let stored = controller.store().load().unwrap().jobs.remove("live-5").unwrap();
        assert!(stored.stopped_at.is_none());
    }

    #[tokio::test]
    async fn test_corrupt_metadata_aborts_startup() {
        let temp_dir = TempDir::new().unwrap();
        let store = seed_store(temp_dir.path());
        let dir = store.record_dir(JobKind::Live, "live-bad");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(METADATA_FILE), "not json").unwrap();

        let result = Controller::start(
            &test_config(temp_dir.path(), None),
            Arc::new(FakeLauncher::default()),
        )
        .await;
        assert!(matches!(
            result,
            Err(ControllerError::Store(StoreError::Corrupt { .. }))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_terminal_job_mirror_is_removed() {
        let temp_dir = TempDir::new().unwrap();
        let store = seed_store(temp_dir.path());
        let mut job = persisted_job(&store, "live-9", Vec::new());
        job.stopped_at = Some(Utc::now());
        store.save(&job).unwrap();

        let link = temp_dir.path().join("public").join("live").join("live-9");
        fs::create_dir_all(link.parent().unwrap()).unwrap();
        std::os::unix::fs::symlink(&job.output_path, &link).unwrap();

        Controller::start(
            &test_config(temp_dir.path(), Some(PUBLIC_BASE)),
            Arc::new(FakeLauncher::default()),
        )
        .await
        .unwrap();

        assert!(fs::symlink_metadata(&link).is_err());
    }
}
