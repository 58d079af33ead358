//! HLS transcode job controller
//!
//! Turns live channels and uploaded files into HLS renditions by supervising
//! an external encoder per job. Job metadata is persisted so active jobs are
//! resumed after a restart, and an HTTP API creates and stops jobs.

pub mod api;
pub mod controller;
pub mod encode;
pub mod jobs;
pub mod publish;
pub mod reconcile;
pub mod registry;
pub mod startup;
pub mod store;

pub use transcode_controller_config as config;
pub use transcode_controller_config::Config;
pub use api::{
    bearer_token_matches, create_api_router, parse_job_request, parse_upload_request,
    run_api_server, shutdown_signal, ApiError, ServerError,
};
pub use controller::{
    Controller, ControllerError, CreatedJob, CreatedUpload, NewJob, NewUpload, StopOutcome,
};
pub use encode::{
    build_transcode_plan, EncodeError, FfmpegLauncher, Launcher, PlanError, ProcessHandle,
    Supervisor, SupervisorError, TranscodePlan,
};
pub use jobs::{Job, JobKind, Record, Rendition, UploadJob};
pub use publish::{MirrorPublisher, PublishError};
pub use reconcile::RecoveryReport;
pub use registry::{Registry, RegistryError};
pub use startup::{check_encoder_available, run_startup_checks, StartupError};
pub use store::{LoadedRecords, MetadataStore, StoreError};
