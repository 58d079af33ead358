//! HLS packaging plan builder
//!
//! Turns an input source, an output directory and a rendition ladder into the
//! encoder argument vector. Codecs are always copied; the ladder only decides
//! how the input is fanned out into named variant playlists.

use crate::jobs::{master_playlist_path, to_slash, Rendition};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Target segment duration in seconds.
pub const HLS_TIME_SECS: u32 = 4;

/// Segments kept in the rolling live window.
pub const HLS_LIST_SIZE: u32 = 6;

/// Muxer flags: expire old segments and stamp wall-clock time.
pub const HLS_FLAGS: &str = "delete_segments+program_date_time";

/// Playlist file name used for both master and variant playlists.
pub const PLAYLIST_NAME: &str = "index.m3u8";

const SEGMENT_PATTERN: &str = "segment_%06d.ts";

/// Name given to the synthetic rendition used when the ladder is empty.
pub const DEFAULT_RENDITION_NAME: &str = "default";

/// Error type for plan construction
#[derive(Debug, Error)]
pub enum PlanError {
    /// The input URL or path was blank
    #[error("input source is required")]
    MissingInput,

    /// The output directory was blank
    #[error("output directory is required")]
    MissingOutputDir,

    /// Resolving or creating output directories failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Everything needed to launch one packaging run. Derived, never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscodePlan {
    /// Encoder arguments, program name excluded
    pub args: Vec<String>,
    /// Ladder with final names and manifest locations
    pub renditions: Vec<Rendition>,
    /// Absolute output directory
    pub output_dir: PathBuf,
    /// Absolute master playlist path
    pub master: String,
}

impl TranscodePlan {
    /// The output directory as a forward-slash string, as stored on records.
    pub fn output_dir_string(&self) -> String {
        to_slash(&self.output_dir)
    }

    /// The `-var_stream_map` value, if the plan packages more than one rendition.
    pub fn variant_stream_map(&self) -> Option<&str> {
        self.args
            .windows(2)
            .find(|pair| pair[0] == "-var_stream_map")
            .map(|pair| pair[1].as_str())
    }
}

/// Reduces a rendition name to `[A-Za-z0-9_-]`, mapping spaces to `-`.
///
/// Blank input, or input with no retainable characters, yields `"variant"`.
pub fn sanitize_name(name: &str) -> String {
    let sanitized: String = name
        .trim()
        .chars()
        .filter_map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' => Some(c),
            ' ' => Some('-'),
            _ => None,
        })
        .collect();

    if sanitized.is_empty() {
        "variant".to_string()
    } else {
        sanitized
    }
}

/// Assigns each ladder entry a unique directory-safe name.
///
/// Entries with a blank name become `variant-<index>`; collisions get a
/// numeric suffix (`name`, `name-1`, `name-2`, ...).
pub fn resolve_variant_names(ladder: &[Rendition]) -> Vec<String> {
    let mut next_suffix: HashMap<String, usize> = HashMap::new();
    let mut assigned: HashSet<String> = HashSet::new();
    let mut names = Vec::with_capacity(ladder.len());

    for (idx, rendition) in ladder.iter().enumerate() {
        let base = if rendition.name.trim().is_empty() {
            format!("variant-{}", idx)
        } else {
            sanitize_name(&rendition.name)
        };

        let mut suffix = next_suffix.get(&base).copied().unwrap_or(0);
        let mut candidate = suffixed(&base, suffix);
        while assigned.contains(&candidate) {
            suffix += 1;
            candidate = suffixed(&base, suffix);
        }

        next_suffix.insert(base, suffix + 1);
        assigned.insert(candidate.clone());
        names.push(candidate);
    }

    names
}

fn suffixed(base: &str, suffix: usize) -> String {
    if suffix == 0 {
        base.to_string()
    } else {
        format!("{}-{}", base, suffix)
    }
}

fn push_args<const N: usize>(args: &mut Vec<String>, items: [&str; N]) {
    args.extend(items.iter().map(|item| item.to_string()));
}

fn absolute_dir(dir: &Path) -> Result<PathBuf, PlanError> {
    if dir.is_absolute() {
        Ok(dir.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(dir))
    }
}

/// Build the packaging plan for one job
///
/// Creates the output directory (and one subdirectory per rendition when
/// more than one is requested). Directory creation is the only side effect,
/// and it is idempotent, so rebuilding a plan for a recovered job is safe.
///
/// # Arguments
/// * `input` - Origin URL or source path handed to the encoder
/// * `output_dir` - Directory receiving playlists and segments
/// * `ladder` - Requested renditions, in order; an empty ladder packages one `default` rendition
pub fn build_transcode_plan(
    input: &str,
    output_dir: &Path,
    ladder: &[Rendition],
) -> Result<TranscodePlan, PlanError> {
    if input.trim().is_empty() {
        return Err(PlanError::MissingInput);
    }
    if output_dir.as_os_str().is_empty() || output_dir.to_string_lossy().trim().is_empty() {
        return Err(PlanError::MissingOutputDir);
    }

    let abs_dir = absolute_dir(output_dir)?;
    fs::create_dir_all(&abs_dir)?;

    let mut renditions: Vec<Rendition> = if ladder.is_empty() {
        vec![Rendition::new(DEFAULT_RENDITION_NAME, None)]
    } else {
        ladder.to_vec()
    };

    let master = master_playlist_path(&abs_dir);
    let names = resolve_variant_names(&renditions);

    let mut args: Vec<String> = Vec::new();
    push_args(&mut args, ["-hide_banner", "-loglevel", "warning", "-y", "-i", input]);

    for _ in &renditions {
        push_args(&mut args, ["-map", "0:v:0?", "-map", "0:a:0?"]);
    }

    // Passthrough: the ladder never changes codec parameters.
    push_args(&mut args, ["-c", "copy"]);

    push_args(
        &mut args,
        [
            "-f",
            "hls",
            "-hls_time",
            &HLS_TIME_SECS.to_string(),
            "-hls_list_size",
            &HLS_LIST_SIZE.to_string(),
            "-hls_flags",
            HLS_FLAGS,
        ],
    );

    if renditions.len() == 1 {
        renditions[0].name = names[0].clone();
        renditions[0].manifest_url = master.clone();

        push_args(
            &mut args,
            [
                "-hls_segment_filename",
                &to_slash(&abs_dir.join(SEGMENT_PATTERN)),
                &master,
            ],
        );
    } else {
        let mut stream_map = Vec::with_capacity(renditions.len());

        for (idx, (rendition, name)) in renditions.iter_mut().zip(&names).enumerate() {
            let variant_dir = abs_dir.join(name);
            fs::create_dir_all(&variant_dir)?;

            rendition.name = name.clone();
            rendition.manifest_url = to_slash(&variant_dir.join(PLAYLIST_NAME));

            let mut entry = format!("v:{},a:{} name:{}", idx, idx, name);
            if let Some(bitrate) = rendition.bitrate.filter(|b| *b > 0) {
                entry.push_str(&format!(" bandwidth:{}", u64::from(bitrate) * 1000));
            }
            stream_map.push(entry);
        }

        push_args(
            &mut args,
            [
                "-master_pl_name",
                PLAYLIST_NAME,
                "-hls_segment_filename",
                &to_slash(&abs_dir.join("%v").join(SEGMENT_PATTERN)),
                "-var_stream_map",
                &stream_map.join(" "),
                &to_slash(&abs_dir.join("%v").join(PLAYLIST_NAME)),
            ],
        );
    }

    Ok(TranscodePlan {
        args,
        renditions,
        output_dir: abs_dir,
        master,
    })
}
