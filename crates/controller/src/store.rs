//! Durable job metadata
//!
//! Each record lives at `<root>/<live|uploads>/<id>/metadata.json`. Writes go
//! through a temporary file in the same directory followed by a rename, so a
//! reader sees either the previous record or the new one.

use crate::jobs::{default_output_dir, Job, JobKind, Record, UploadJob};
use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// File name of a persisted record inside its job directory.
pub const METADATA_FILE: &str = "metadata.json";

/// Error type for metadata persistence
#[derive(Debug, Error)]
pub enum StoreError {
    /// Filesystem access failed
    #[error("IO error at {}: {source}", .path.display())]
    Io { path: PathBuf, source: io::Error },

    /// A persisted record could not be parsed
    #[error("corrupt metadata at {}: {source}", .path.display())]
    Corrupt {
        path: PathBuf,
        source: serde_json::Error,
    },

    /// A record could not be serialized
    #[error("failed to encode metadata: {0}")]
    Encode(#[source] serde_json::Error),

    /// The blocking write task panicked or was cancelled
    #[error("metadata write task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

fn io_at(path: &Path) -> impl FnOnce(io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Everything found on disk at startup, keyed by job ID.
#[derive(Debug, Default)]
pub struct LoadedRecords {
    pub jobs: HashMap<String, Job>,
    pub uploads: HashMap<String, UploadJob>,
}

/// Filesystem-backed record store rooted at the output root.
#[derive(Debug, Clone)]
pub struct MetadataStore {
    root: PathBuf,
}

impl MetadataStore {
    /// Open the store, creating `live/` and `uploads/` under `root`
    ///
    /// A relative root is resolved against the current directory.
    pub fn open(root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let root = root.as_ref();
        let root = if root.is_absolute() {
            root.to_path_buf()
        } else {
            std::env::current_dir().map_err(io_at(root))?.join(root)
        };

        for kind in [JobKind::Live, JobKind::Upload] {
            let dir = root.join(kind.dir_name());
            fs::create_dir_all(&dir).map_err(io_at(&dir))?;
        }

        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Default directory for a record, which is also where its metadata lives.
    pub fn record_dir(&self, kind: JobKind, id: &str) -> PathBuf {
        default_output_dir(&self.root, kind, id)
    }

    pub fn metadata_path(&self, kind: JobKind, id: &str) -> PathBuf {
        self.record_dir(kind, id).join(METADATA_FILE)
    }

    /// Load every persisted live job and upload
    ///
    /// Directories without a metadata file are skipped. A file that fails to
    /// parse aborts the load. Records written before location fields existed
    /// get them backfilled from their directory.
    pub fn load(&self) -> Result<LoadedRecords, StoreError> {
        Ok(LoadedRecords {
            jobs: self.load_kind::<Job>()?,
            uploads: self.load_kind::<UploadJob>()?,
        })
    }

    fn load_kind<R: Record>(&self) -> Result<HashMap<String, R>, StoreError> {
        let kind_dir = self.root.join(R::KIND.dir_name());
        let mut records = HashMap::new();

        let entries = match fs::read_dir(&kind_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(records),
            Err(e) => return Err(io_at(&kind_dir)(e)),
        };

        for entry in entries {
            let entry = entry.map_err(io_at(&kind_dir))?;
            let dir = entry.path();
            if !dir.is_dir() {
                continue;
            }

            let path = dir.join(METADATA_FILE);
            let content = match fs::read_to_string(&path) {
                Ok(content) => content,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    debug!(path = %dir.display(), "no metadata, skipping");
                    continue;
                }
                Err(e) => return Err(io_at(&path)(e)),
            };

            let mut record: R = serde_json::from_str(&content)
                .map_err(|source| StoreError::Corrupt { path: path.clone(), source })?;

            if record.id().trim().is_empty() {
                record.set_id(entry.file_name().to_string_lossy().into_owned());
            }
            record.backfill_locations(&dir);

            records.insert(record.id().to_string(), record);
        }

        Ok(records)
    }

    /// Persist a record atomically
    pub fn save<R: Record>(&self, record: &R) -> Result<(), StoreError> {
        let dir = self.record_dir(R::KIND, record.id());
        fs::create_dir_all(&dir).map_err(io_at(&dir))?;
        write_json_atomic(&dir.join(METADATA_FILE), record)
    }

    /// Persist a record on the blocking pool and hand it back
    pub async fn persist<R: Record>(&self, record: R) -> Result<R, StoreError> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.save(&record).map(|()| record)).await?
    }

    pub fn save_job(&self, job: &Job) -> Result<(), StoreError> {
        self.save(job)
    }

    pub fn save_upload(&self, upload: &UploadJob) -> Result<(), StoreError> {
        self.save(upload)
    }
}

/// Write `value` as indented JSON to `path` via a sibling temp file and rename.
///
/// On any failure the temp file is removed and `path` is left untouched.
pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), StoreError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));

    let mut tmp = tempfile::Builder::new()
        .prefix("meta-")
        .suffix(".tmp")
        .tempfile_in(dir)
        .map_err(io_at(dir))?;

    {
        let mut writer = BufWriter::new(tmp.as_file_mut());
        serde_json::to_writer_pretty(&mut writer, value).map_err(StoreError::Encode)?;
        writer.flush().map_err(io_at(path))?;
    }
    tmp.as_file().sync_all().map_err(io_at(path))?;

    tmp.persist(path).map_err(|e| StoreError::Io {
        path: path.to_path_buf(),
        source: e.error,
    })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::Rendition;
    use chrono::Utc;
    use serde::ser::{Error as _, SerializeMap};
    use serde::Serializer;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn make_job(id: &str) -> Job {
        Job {
            id: id.to_string(),
            channel_id: "c1".to_string(),
            session_id: "s1".to_string(),
            origin_url: "rtmp://origin/c1".to_string(),
            renditions: vec![Rendition::new("720p", Some(2800))],
            output_path: format!("/srv/work/live/{}", id),
            playback_url: format!("/srv/work/live/{}/index.m3u8", id),
            created_at: Utc::now(),
            stopped_at: None,
            stop_requested_at: None,
        }
    }

    fn make_upload(id: &str) -> UploadJob {
        UploadJob {
            id: id.to_string(),
            channel_id: "c1".to_string(),
            upload_id: "u1".to_string(),
            source_url: "/srv/incoming/talk.mp4".to_string(),
            filename: "talk.mp4".to_string(),
            renditions: Vec::new(),
            output_path: String::new(),
            playback_url: String::new(),
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Starts writing a JSON object, then fails partway through.
    struct FailsMidway;

    impl Serialize for FailsMidway {
        fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
            let mut map = serializer.serialize_map(None)?;
            map.serialize_entry("ID", "live-1")?;
            Err(S::Error::custom("simulated write failure"))
        }
    }

    #[test]
    fn test_open_creates_layout() {
        let temp_dir = TempDir::new().unwrap();
        let store = MetadataStore::open(temp_dir.path().join("work")).unwrap();

        assert!(store.root().join("live").is_dir());
        assert!(store.root().join("uploads").is_dir());
    }

    #[test]
    fn test_save_and_load_records() {
        let temp_dir = TempDir::new().unwrap();
        let store = MetadataStore::open(temp_dir.path()).unwrap();

        let job = make_job("live-1");
        let upload = make_upload("upload-1");
        store.save_job(&job).expect("Should save job");
        store.save_upload(&upload).expect("Should save upload");

        assert!(store.metadata_path(JobKind::Live, "live-1").exists());

        let loaded = store.load().expect("Should load records");
        assert_eq!(loaded.jobs.len(), 1);
        assert_eq!(loaded.jobs["live-1"], job);
        assert_eq!(loaded.uploads.len(), 1);
        assert_eq!(loaded.uploads["upload-1"].source_url, upload.source_url);
    }

    #[test]
    fn test_save_overwrites_previous_record() {
        let temp_dir = TempDir::new().unwrap();
        let store = MetadataStore::open(temp_dir.path()).unwrap();

        let mut job = make_job("live-1");
        store.save(&job).unwrap();
        job.stopped_at = Some(Utc::now());
        store.save(&job).unwrap();

        let loaded = store.load().unwrap();
        assert!(loaded.jobs["live-1"].stopped_at.is_some());
    }

    #[tokio::test]
    async fn test_persist_writes_off_the_runtime() {
        let temp_dir = TempDir::new().unwrap();
        let store = MetadataStore::open(temp_dir.path()).unwrap();

        let job = store.persist(make_job("live-7")).await.unwrap();
        assert_eq!(job.id, "live-7");
        assert_eq!(store.load().unwrap().jobs["live-7"], job);

        // A directory where the metadata file belongs cannot be replaced.
        fs::create_dir_all(store.metadata_path(JobKind::Live, "live-8")).unwrap();
        let result = store.persist(make_job("live-8")).await;
        assert!(matches!(result, Err(StoreError::Io { .. })));
    }

    #[test]
    fn test_load_skips_directories_without_metadata() {
        let temp_dir = TempDir::new().unwrap();
        let store = MetadataStore::open(temp_dir.path()).unwrap();

        fs::create_dir_all(store.record_dir(JobKind::Live, "live-empty")).unwrap();
        fs::write(store.root().join("live").join("stray.txt"), "x").unwrap();
        store.save(&make_job("live-2")).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.jobs.len(), 1);
        assert!(loaded.jobs.contains_key("live-2"));
    }

    #[test]
    fn test_load_fails_on_corrupt_metadata() {
        let temp_dir = TempDir::new().unwrap();
        let store = MetadataStore::open(temp_dir.path()).unwrap();

        let dir = store.record_dir(JobKind::Upload, "upload-bad");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(METADATA_FILE), "{\"ID\": \"upload-bad\",").unwrap();

        let result = store.load();
        assert!(matches!(result, Err(StoreError::Corrupt { .. })));
    }

    #[test]
    fn test_load_backfills_legacy_records() {
        let temp_dir = TempDir::new().unwrap();
        let store = MetadataStore::open(temp_dir.path()).unwrap();

        let dir = store.record_dir(JobKind::Live, "live-9");
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join(METADATA_FILE),
            r#"{"ChannelID":"c1","SessionID":"s1","OriginURL":"rtmp://o/c1","CreatedAt":"2024-03-01T10:00:00Z","StoppedAt":null}"#,
        )
        .unwrap();

        let loaded = store.load().unwrap();
        let job = &loaded.jobs["live-9"];
        assert_eq!(job.id, "live-9");
        assert_eq!(job.output_path, dir.to_string_lossy());
        assert!(job.playback_url.ends_with("/live-9/index.m3u8"));
    }

    #[test]
    fn test_failed_write_leaves_target_unchanged() {
        let temp_dir = TempDir::new().unwrap();
        let store = MetadataStore::open(temp_dir.path()).unwrap();

        let job = make_job("live-1");
        store.save(&job).unwrap();
        let path = store.metadata_path(JobKind::Live, "live-1");
        let before = fs::read_to_string(&path).unwrap();

        let result = write_json_atomic(&path, &FailsMidway);
        assert!(matches!(result, Err(StoreError::Encode(_))));

        assert_eq!(fs::read_to_string(&path).unwrap(), before);
        let leftovers: Vec<_> = fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|name| name != METADATA_FILE)
            .collect();
        assert!(leftovers.is_empty(), "temp files left behind: {:?}", leftovers);

        assert_eq!(store.load().unwrap().jobs["live-1"], job);
    }

    #[test]
    fn test_concurrent_save_and_load_never_see_partial_file() {
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(MetadataStore::open(temp_dir.path()).unwrap());
        store.save(&make_job("live-1")).unwrap();

        let writer = {
            let store = Arc::clone(&store);
            std::thread::spawn(move || {
                for i in 0..200 {
                    let mut job = make_job("live-1");
                    job.renditions = (0..i % 7)
                        .map(|n| Rendition::new(format!("r{}", n), Some(n * 100)))
                        .collect();
                    store.save(&job).unwrap();
                }
            })
        };

        for _ in 0..200 {
            let loaded = store.load().expect("load must never observe a partial record");
            assert!(loaded.jobs.contains_key("live-1"));
        }

        writer.join().unwrap();
    }
}
