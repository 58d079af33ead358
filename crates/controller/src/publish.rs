//! Public mirror publisher
//!
//! Exposes rendered output under a publicly served directory and rewrites
//! playlist locations to URLs under the configured public base. Uploads are
//! copied once their encoder succeeds; live jobs are symlinked while running.
//! With no public base configured every operation is a no-op.

use crate::encode::hls::PLAYLIST_NAME;
use crate::jobs::{to_slash, JobKind, Rendition, UploadJob};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;
use walkdir::WalkDir;

/// Error type for mirror operations
#[derive(Debug, Error)]
pub enum PublishError {
    /// The record has no output directory to publish
    #[error("output path missing")]
    MissingOutput,

    /// The rendered tree contains a symbolic link
    #[error("symlinks not supported: {}", .0.display())]
    Symlink(PathBuf),

    /// Walking the rendered tree failed
    #[error("failed to walk output tree: {0}")]
    Walk(#[from] walkdir::Error),

    /// Filesystem access failed
    #[error("IO error at {}: {source}", .path.display())]
    Io { path: PathBuf, source: io::Error },
}

fn io_at(path: &Path) -> impl FnOnce(io::Error) -> PublishError + '_ {
    move |source| PublishError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Joins URL path parts onto `base` with single slashes.
///
/// A trailing `/` on the base is dropped; empty parts are skipped.
pub fn join_url(base: &str, parts: &[&str]) -> String {
    let trimmed = base.trim_end_matches('/');
    let addition = parts
        .iter()
        .flat_map(|part| part.split('/'))
        .filter(|segment| !segment.is_empty() && *segment != ".")
        .collect::<Vec<_>>()
        .join("/");

    if addition.is_empty() {
        trimmed.to_string()
    } else if trimmed.is_empty() {
        format!("/{}", addition)
    } else {
        format!("{}/{}", trimmed, addition)
    }
}

/// Location of `target` relative to `base_dir`, with forward slashes.
///
/// Targets outside `base_dir` (or equal to it) fall back to their file name.
pub fn relative_location(base_dir: &Path, target: &str) -> String {
    let target = Path::new(target.trim());
    match target.strip_prefix(base_dir) {
        Ok(rel) if !rel.as_os_str().is_empty() => to_slash(rel),
        _ => target
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default(),
    }
}

/// Mirrors output trees into the public directory.
#[derive(Debug, Clone)]
pub struct MirrorPublisher {
    public_root: PathBuf,
    public_base: Option<String>,
}

impl MirrorPublisher {
    pub fn new(public_root: impl Into<PathBuf>, public_base: Option<String>) -> Self {
        let public_base = public_base
            .map(|base| base.trim().trim_end_matches('/').to_string())
            .filter(|base| !base.is_empty());
        Self {
            public_root: public_root.into(),
            public_base,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.public_base.is_some()
    }

    /// Create `live/` and `uploads/` under the public root
    pub fn prepare(&self) -> Result<(), PublishError> {
        for kind in [JobKind::Live, JobKind::Upload] {
            let dir = self.public_root.join(kind.dir_name());
            fs::create_dir_all(&dir).map_err(io_at(&dir))?;
        }
        Ok(())
    }

    /// `<base>/<live|uploads>/<id>/<rel>`, or `None` when no base is configured.
    pub fn public_url(&self, kind: JobKind, id: &str, rel: &str) -> Option<String> {
        self.public_base
            .as_deref()
            .map(|base| join_url(base, &[kind.dir_name(), id, rel]))
    }

    /// Renditions as callers should see them: public URLs when a base is
    /// configured, local playlist paths otherwise.
    pub fn public_renditions(
        &self,
        kind: JobKind,
        id: &str,
        output_dir: &Path,
        renditions: &[Rendition],
    ) -> Vec<Rendition> {
        renditions
            .iter()
            .map(|rendition| {
                let rel = relative_location(output_dir, &rendition.manifest_url);
                let manifest_url = self
                    .public_url(kind, id, &rel)
                    .unwrap_or_else(|| rendition.manifest_url.clone());
                Rendition {
                    manifest_url,
                    ..rendition.clone()
                }
            })
            .collect()
    }

    /// Master playlist location as callers should see it.
    pub fn public_playback(
        &self,
        kind: JobKind,
        id: &str,
        output_dir: &Path,
        master: &str,
    ) -> String {
        let mut rel = relative_location(output_dir, master);
        if rel.is_empty() {
            rel = PLAYLIST_NAME.to_string();
        }
        self.public_url(kind, id, &rel)
            .unwrap_or_else(|| master.to_string())
    }

    /// Copy a finished upload into the mirror and rewrite its URLs
    ///
    /// Returns `Ok(false)` without touching anything when publishing is
    /// disabled or the upload's playback URL already points at the public base.
    /// The destination is cleared first; a symlink anywhere in the rendered
    /// tree is an error.
    pub fn publish_upload(&self, upload: &mut UploadJob) -> Result<bool, PublishError> {
        let Some(base) = self.public_base.as_deref() else {
            return Ok(false);
        };
        if upload.playback_url.trim().starts_with(base) {
            return Ok(false);
        }

        let src = upload.output_path.trim();
        if src.is_empty() {
            return Err(PublishError::MissingOutput);
        }
        let src = PathBuf::from(src);
        let dest = self.public_root.join(JobKind::Upload.dir_name()).join(&upload.id);

        remove_path(&dest)?;
        copy_tree(&src, &dest)?;

        let id = upload.id.clone();
        upload.playback_url =
            self.public_playback(JobKind::Upload, &id, &src, &upload.playback_url);
        upload.renditions =
            self.public_renditions(JobKind::Upload, &id, &src, &upload.renditions);

        debug!(job_id = %id, dest = %dest.display(), "upload published");
        Ok(true)
    }

    /// Expose a live job's output directory as `<publicRoot>/live/<id>`
    ///
    /// An existing link to the same directory is kept; anything else at the
    /// destination is replaced.
    pub fn link_live(&self, id: &str, output_path: &str) -> Result<(), PublishError> {
        if !self.is_enabled() {
            return Ok(());
        }
        let src = output_path.trim();
        if src.is_empty() {
            return Err(PublishError::MissingOutput);
        }
        let src = absolute(Path::new(src))?;
        let dest = self.public_root.join(JobKind::Live.dir_name()).join(id);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(io_at(parent))?;
        }

        match fs::symlink_metadata(&dest) {
            Ok(meta) => {
                if meta.file_type().is_symlink()
                    && fs::read_link(&dest).ok().as_deref() == Some(src.as_path())
                {
                    return Ok(());
                }
                remove_path(&dest)?;
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(io_at(&dest)(e)),
        }

        create_symlink(&src, &dest)
    }

    /// Remove a live job's mirror entry, if any
    pub fn unlink_live(&self, id: &str) -> Result<(), PublishError> {
        if !self.is_enabled() || id.trim().is_empty() {
            return Ok(());
        }
        remove_path(&self.public_root.join(JobKind::Live.dir_name()).join(id))
    }
}

fn absolute(path: &Path) -> Result<PathBuf, PublishError> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir().map_err(io_at(path))?.join(path))
    }
}

/// Remove a file, symlink or directory tree. Missing paths are fine.
fn remove_path(path: &Path) -> Result<(), PublishError> {
    let result = match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) => Err(e),
    };
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(io_at(path)(e)),
    }
}

fn copy_tree(src: &Path, dst: &Path) -> Result<(), PublishError> {
    for entry in WalkDir::new(src).follow_links(false) {
        let entry = entry?;
        let rel = entry.path().strip_prefix(src).unwrap_or(entry.path());
        let target = dst.join(rel);
        let file_type = entry.file_type();

        if file_type.is_symlink() {
            return Err(PublishError::Symlink(entry.path().to_path_buf()));
        }
        if file_type.is_dir() {
            fs::create_dir_all(&target).map_err(io_at(&target))?;
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(io_at(parent))?;
        }
        fs::copy(entry.path(), &target).map_err(io_at(entry.path()))?;
    }
    Ok(())
}

#[cfg(unix)]
fn create_symlink(src: &Path, dest: &Path) -> Result<(), PublishError> {
    std::os::unix::fs::symlink(src, dest).map_err(io_at(dest))
}

#[cfg(not(unix))]
fn create_symlink(src: &Path, dest: &Path) -> Result<(), PublishError> {
    debug!(
        src = %src.display(),
        dest = %dest.display(),
        "live mirror links unsupported on this platform"
    );
    Ok(())
}
