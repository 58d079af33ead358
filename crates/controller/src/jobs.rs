//! Job records for live channels and uploaded files.
//!
//! Both record types are persisted as JSON and tracked in the registry while
//! their encoder runs. The [`Record`] trait lets the store, registry and
//! controller treat them uniformly.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Which family a job belongs to. Selects the on-disk subtree and ID prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// A live channel packaged from an origin stream.
    Live,
    /// An uploaded file packaged once.
    Upload,
}

impl JobKind {
    /// Directory name under the output root (and the public mirror).
    pub fn dir_name(self) -> &'static str {
        match self {
            JobKind::Live => "live",
            JobKind::Upload => "uploads",
        }
    }

    fn id_prefix(self) -> &'static str {
        match self {
            JobKind::Live => "live",
            JobKind::Upload => "upload",
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobKind::Live => write!(f, "live"),
            JobKind::Upload => write!(f, "upload"),
        }
    }
}

/// Allocates a fresh job ID such as `live-3f2b...`.
pub fn new_job_id(kind: JobKind) -> String {
    format!("{}-{}", kind.id_prefix(), Uuid::new_v4().simple())
}

/// One named output stream of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rendition {
    pub name: String,
    /// Playlist location, filled in by the plan builder.
    #[serde(rename = "manifestUrl", default)]
    pub manifest_url: String,
    /// Advertised bitrate in kbps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bitrate: Option<u32>,
}

impl Rendition {
    pub fn new(name: impl Into<String>, bitrate: Option<u32>) -> Self {
        Self {
            name: name.into(),
            manifest_url: String::new(),
            bitrate,
        }
    }
}

/// A live channel packaging job.
///
/// Field names on disk follow the layout earlier controller releases wrote,
/// so existing `metadata.json` files keep loading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    #[serde(rename = "ID", default)]
    pub id: String,
    #[serde(rename = "ChannelID")]
    pub channel_id: String,
    #[serde(rename = "SessionID")]
    pub session_id: String,
    #[serde(rename = "OriginURL")]
    pub origin_url: String,
    #[serde(rename = "Renditions", default)]
    pub renditions: Vec<Rendition>,
    #[serde(rename = "OutputPath", default)]
    pub output_path: String,
    #[serde(rename = "Playback", default)]
    pub playback_url: String,
    #[serde(rename = "CreatedAt")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "StoppedAt", default)]
    pub stopped_at: Option<DateTime<Utc>>,
    /// Set when an operator asked for the job to stop, before the encoder is cancelled.
    #[serde(
        rename = "StopRequestedAt",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub stop_requested_at: Option<DateTime<Utc>>,
}

/// An uploaded-file packaging job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadJob {
    #[serde(rename = "ID", default)]
    pub id: String,
    #[serde(rename = "ChannelID")]
    pub channel_id: String,
    #[serde(rename = "UploadID")]
    pub upload_id: String,
    #[serde(rename = "SourceURL")]
    pub source_url: String,
    #[serde(rename = "Filename", default)]
    pub filename: String,
    #[serde(rename = "Renditions", default)]
    pub renditions: Vec<Rendition>,
    #[serde(rename = "OutputPath", default)]
    pub output_path: String,
    #[serde(rename = "Playback", default)]
    pub playback_url: String,
    #[serde(rename = "CreatedAt")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "CompletedAt", default)]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Behaviour shared by persisted job records.
pub trait Record: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
    const KIND: JobKind;

    fn id(&self) -> &str;
    fn set_id(&mut self, id: String);
    /// The encoder input: origin URL or source URL.
    fn input(&self) -> &str;
    fn renditions(&self) -> &[Rendition];
    fn output_path(&self) -> &str;
    fn playback_url(&self) -> &str;
    fn terminal_at(&self) -> Option<DateTime<Utc>>;
    fn set_terminal_at(&mut self, at: DateTime<Utc>);

    /// Replaces the derived location fields after a plan was (re)built.
    fn set_locations(
        &mut self,
        output_path: String,
        playback_url: String,
        renditions: Vec<Rendition>,
    );

    fn is_terminal(&self) -> bool {
        self.terminal_at().is_some()
    }

    /// Stamps the terminal timestamp unless one is already present.
    /// Returns whether the stamp was applied.
    fn finish(&mut self, at: DateTime<Utc>) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.set_terminal_at(at);
        true
    }

    /// Fills in the output path and playback URL for records written before
    /// those fields existed, using the directory the record was found in.
    fn backfill_locations(&mut self, dir: &Path) {
        let output_path = if self.output_path().trim().is_empty() {
            dir.to_string_lossy().into_owned()
        } else {
            self.output_path().to_string()
        };
        let playback_url = if self.playback_url().trim().is_empty() {
            master_playlist_path(Path::new(&output_path))
        } else {
            self.playback_url().to_string()
        };
        let renditions = self.renditions().to_vec();
        self.set_locations(output_path, playback_url, renditions);
    }
}

/// `<dir>/index.m3u8` with forward slashes.
pub fn master_playlist_path(dir: &Path) -> String {
    to_slash(&dir.join("index.m3u8"))
}

pub(crate) fn to_slash(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

impl Record for Job {
    const KIND: JobKind = JobKind::Live;

    fn id(&self) -> &str {
        &self.id
    }

    fn set_id(&mut self, id: String) {
        self.id = id;
    }

    fn input(&self) -> &str {
        &self.origin_url
    }

    fn renditions(&self) -> &[Rendition] {
        &self.renditions
    }

    fn output_path(&self) -> &str {
        &self.output_path
    }

    fn playback_url(&self) -> &str {
        &self.playback_url
    }

    fn terminal_at(&self) -> Option<DateTime<Utc>> {
        self.stopped_at
    }

    fn set_terminal_at(&mut self, at: DateTime<Utc>) {
        self.stopped_at = Some(at);
    }

    fn set_locations(
        &mut self,
        output_path: String,
        playback_url: String,
        renditions: Vec<Rendition>,
    ) {
        self.output_path = output_path;
        self.playback_url = playback_url;
        self.renditions = renditions;
    }
}

impl Record for UploadJob {
    const KIND: JobKind = JobKind::Upload;

    fn id(&self) -> &str {
        &self.id
    }

    fn set_id(&mut self, id: String) {
        self.id = id;
    }

    fn input(&self) -> &str {
        &self.source_url
    }

    fn renditions(&self) -> &[Rendition] {
        &self.renditions
    }

    fn output_path(&self) -> &str {
        &self.output_path
    }

    fn playback_url(&self) -> &str {
        &self.playback_url
    }

    fn terminal_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    fn set_terminal_at(&mut self, at: DateTime<Utc>) {
        self.completed_at = Some(at);
    }

    fn set_locations(
        &mut self,
        output_path: String,
        playback_url: String,
        renditions: Vec<Rendition>,
    ) {
        self.output_path = output_path;
        self.playback_url = playback_url;
        self.renditions = renditions;
    }
}

/// Default output directory for a record: `<root>/<live|uploads>/<id>`.
pub fn default_output_dir(root: &Path, kind: JobKind, id: &str) -> PathBuf {
    root.join(kind.dir_name()).join(id)
}
