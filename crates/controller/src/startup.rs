//! Startup checks for the transcode controller
//!
//! Preflight checks run before the controller loads any metadata:
//! - the configured encoder program answers `-version`
//! - the output root exists or can be created

use crate::config::Config;
use std::path::Path;
use std::process::Command;
use thiserror::Error;
use tracing::info;

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("encoder not available: {0}")]
    EncoderUnavailable(String),

    #[error("output root {path} is not usable: {source}")]
    OutputRoot {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Extract the version token from `ffmpeg -version` style output
///
/// Handles `ffmpeg version 6.1.1 ...` and git builds such as
/// `ffmpeg version n7.0-12-gabcdef ...`. The leading `n` is kept out of the
/// result.
pub fn parse_encoder_version(version_output: &str) -> Option<String> {
    let line = version_output
        .lines()
        .find(|line| line.to_lowercase().contains(" version "))?;
    let lower = line.to_lowercase();
    let token = lower.split(" version ").nth(1)?.split_whitespace().next()?;
    let token = token.strip_prefix('n').unwrap_or(token);
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

/// Check that `<program> -version` runs and exits successfully
///
/// Returns the reported version when it can be parsed.
pub fn check_encoder_available(program: &str) -> Result<Option<String>, StartupError> {
    let output = Command::new(program)
        .arg("-version")
        .output()
        .map_err(|e| {
            StartupError::EncoderUnavailable(format!(
                "{} -version failed; is it installed and in PATH? Error: {}",
                program, e
            ))
        })?;

    if !output.status.success() {
        return Err(StartupError::EncoderUnavailable(format!(
            "{} -version exited with {}",
            program, output.status
        )));
    }

    Ok(parse_encoder_version(&String::from_utf8_lossy(&output.stdout)))
}

/// Create the output root if it does not exist yet
pub fn check_output_root(root: &Path) -> Result<(), StartupError> {
    std::fs::create_dir_all(root).map_err(|source| StartupError::OutputRoot {
        path: root.display().to_string(),
        source,
    })
}

/// Run all startup checks in order
pub fn run_startup_checks(cfg: &Config) -> Result<(), StartupError> {
    let version = check_encoder_available(&cfg.encoder.program)?;
    info!(
        program = %cfg.encoder.program,
        version = version.as_deref().unwrap_or("unknown"),
        "encoder available"
    );
    check_output_root(&cfg.storage.output_root)?;
    Ok(())
}
