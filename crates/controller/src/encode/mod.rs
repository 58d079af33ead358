//! Encoding modules: packaging plans and the encoder process supervisor

pub mod hls;
pub mod supervisor;

pub use hls::{build_transcode_plan, resolve_variant_names, sanitize_name, PlanError, TranscodePlan};
pub use supervisor::{
    build_encoder_command, tag_line, EncodeError, EncoderRun, ExitAck, ExitNotice, FfmpegLauncher,
    Launcher, ProcessHandle, Supervisor, SupervisorError,
};
