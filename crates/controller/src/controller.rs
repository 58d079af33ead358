//! Job controller
//!
//! Owns the registry, store, supervisor and publisher, and drives every job
//! through `absent -> starting -> running -> terminal`. Encoder exits arrive
//! on the supervisor's queue and are finished here.

use crate::config::Config;
use crate::encode::{
    build_transcode_plan, ExitNotice, Launcher, PlanError, Supervisor, SupervisorError,
};
use crate::jobs::{new_job_id, Job, JobKind, Rendition, UploadJob};
use crate::publish::{MirrorPublisher, PublishError};
use crate::reconcile::recover;
use crate::registry::{ExitClaim, Promotion, Registry, RegistryError, Slot, StopRequest};
use crate::store::{MetadataStore, StoreError};
use chrono::Utc;
use std::path::Path;
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Error type for controller operations
#[derive(Debug, Error)]
pub enum ControllerError {
    /// The packaging plan could not be built
    #[error("failed to build transcode plan: {0}")]
    Plan(#[from] PlanError),

    /// The job ID is already active
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// The encoder could not be started
    #[error("failed to start encoder: {0}")]
    Start(#[from] SupervisorError),

    /// Metadata could not be read or written
    #[error("metadata store error: {0}")]
    Store(#[from] StoreError),

    /// The public mirror could not be prepared
    #[error("public mirror error: {0}")]
    Publish(#[from] PublishError),
}

/// A validated request to package a live channel.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub channel_id: String,
    pub session_id: String,
    pub origin_url: String,
    pub renditions: Vec<Rendition>,
}

/// A validated request to package an uploaded file.
#[derive(Debug, Clone)]
pub struct NewUpload {
    pub channel_id: String,
    pub upload_id: String,
    pub source_url: String,
    pub filename: String,
    pub renditions: Vec<Rendition>,
}

/// A started live job as callers see it.
#[derive(Debug, Clone)]
pub struct CreatedJob {
    pub job_id: String,
    pub renditions: Vec<Rendition>,
}

/// A started upload as callers see it.
#[derive(Debug, Clone)]
pub struct CreatedUpload {
    pub job_id: String,
    pub playback_url: String,
    pub renditions: Vec<Rendition>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped,
    NotFound,
}

/// Kind-specific steps around a record's lifetime.
pub(crate) trait Lifecycle: Slot {
    /// After the record was first persisted, before it becomes `Running`.
    fn on_persisted(&self, _publisher: &MirrorPublisher) {}

    /// After the terminal stamp, before the final persist.
    fn on_finish(&mut self, publisher: &MirrorPublisher, succeeded: bool);
}

impl Lifecycle for Job {
    fn on_persisted(&self, publisher: &MirrorPublisher) {
        if let Err(e) = publisher.link_live(&self.id, &self.output_path) {
            warn!(job_id = %self.id, error = %e, "failed to publish live mirror");
        }
    }

    fn on_finish(&mut self, publisher: &MirrorPublisher, _succeeded: bool) {
        if let Err(e) = publisher.unlink_live(&self.id) {
            warn!(job_id = %self.id, error = %e, "failed to remove live mirror");
        }
    }
}

impl Lifecycle for UploadJob {
    fn on_finish(&mut self, publisher: &MirrorPublisher, succeeded: bool) {
        if !succeeded {
            return;
        }
        match publisher.publish_upload(self) {
            Ok(true) => info!(job_id = %self.id, playback = %self.playback_url, "upload published"),
            Ok(false) => debug!(job_id = %self.id, "upload publish skipped"),
            Err(e) => warn!(job_id = %self.id, error = %e, "failed to publish upload"),
        }
    }
}

pub struct Controller {
    registry: Registry,
    store: MetadataStore,
    supervisor: Supervisor,
    publisher: MirrorPublisher,
    stop_timeout: Duration,
}

impl Controller {
    /// Start the controller
    ///
    /// Opens and loads the metadata store, prepares the public mirror, starts
    /// the exit reaper and resumes every job that was still active when the
    /// previous instance went away.
    ///
    /// # Errors
    /// Fails if the store cannot be opened, any persisted record is corrupt,
    /// or the mirror directories cannot be created. Per-job recovery failures
    /// are only logged.
    pub async fn start(
        config: &Config,
        launcher: Arc<dyn Launcher>,
    ) -> Result<Arc<Self>, ControllerError> {
        let store = MetadataStore::open(&config.storage.output_root)?;
        let loaded = store.load()?;
        info!(
            root = %store.root().display(),
            jobs = loaded.jobs.len(),
            uploads = loaded.uploads.len(),
            "metadata loaded"
        );

        let publisher = MirrorPublisher::new(config.public_dir(), config.public_base());
        publisher.prepare()?;

        let (supervisor, exits) = Supervisor::new(launcher);
        let controller = Arc::new(Self {
            registry: Registry::new(),
            store,
            supervisor,
            publisher,
            stop_timeout: Duration::from_secs(config.encoder.stop_timeout_secs),
        });
        tokio::spawn(reap_exits(Arc::downgrade(&controller), exits));

        let report = recover(&controller, loaded).await;
        info!(
            resumed = report.resumed.len(),
            finalized = report.finalized.len(),
            failed = report.failed.len(),
            "recovery finished"
        );

        Ok(controller)
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn store(&self) -> &MetadataStore {
        &self.store
    }

    pub fn publisher(&self) -> &MirrorPublisher {
        &self.publisher
    }

    /// Start packaging a live channel
    pub async fn create_job(&self, request: NewJob) -> Result<CreatedJob, ControllerError> {
        let id = new_job_id(JobKind::Live);
        let job = Job {
            id: id.clone(),
            channel_id: request.channel_id,
            session_id: request.session_id,
            origin_url: request.origin_url,
            renditions: request.renditions,
            output_path: String::new(),
            playback_url: String::new(),
            created_at: Utc::now(),
            stopped_at: None,
            stop_requested_at: None,
        };

        let output_dir = self.store.record_dir(JobKind::Live, &id);
        let job = self.launch(job, &output_dir).await?;
        info!(job_id = %id, renditions = job.renditions.len(), "live job created");

        let renditions = self.publisher.public_renditions(
            JobKind::Live,
            &id,
            Path::new(&job.output_path),
            &job.renditions,
        );
        Ok(CreatedJob {
            job_id: id,
            renditions,
        })
    }

    /// Start packaging an uploaded file
    pub async fn create_upload(
        &self,
        request: NewUpload,
    ) -> Result<CreatedUpload, ControllerError> {
        let id = new_job_id(JobKind::Upload);
        let upload = UploadJob {
            id: id.clone(),
            channel_id: request.channel_id,
            upload_id: request.upload_id,
            source_url: request.source_url,
            filename: request.filename,
            renditions: request.renditions,
            output_path: String::new(),
            playback_url: String::new(),
            created_at: Utc::now(),
            completed_at: None,
        };

        let output_dir = self.store.record_dir(JobKind::Upload, &id);
        let upload = self.launch(upload, &output_dir).await?;
        info!(job_id = %id, renditions = upload.renditions.len(), "upload job created");

        let output_dir = Path::new(&upload.output_path);
        Ok(CreatedUpload {
            playback_url: self.publisher.public_playback(
                JobKind::Upload,
                &id,
                output_dir,
                &upload.playback_url,
            ),
            renditions: self.publisher.public_renditions(
                JobKind::Upload,
                &id,
                output_dir,
                &upload.renditions,
            ),
            job_id: id,
        })
    }

    /// Stop a live job
    ///
    /// The stop intent is persisted before the encoder is cancelled. Waits up
    /// to the configured timeout for the exit path to finish the job; after a
    /// timeout the job is finished here instead.
    pub async fn stop_job(&self, id: &str) -> StopOutcome {
        match self.registry.request_stop(id, Utc::now()).await {
            StopRequest::NotFound => return StopOutcome::NotFound,
            StopRequest::Running(job) => self.persist_stop_intent(job).await,
            StopRequest::Starting => debug!(job_id = %id, "stop requested while job is starting"),
        }

        self.halt::<Job>(id).await;
        info!(job_id = %id, "live job stopped");
        StopOutcome::Stopped
    }

    /// Plan, register, start and persist a record
    ///
    /// Any failure after registration unwinds: the entry is removed and a
    /// started encoder is cancelled and awaited before the error is returned.
    pub(crate) async fn launch<R: Lifecycle>(
        &self,
        mut record: R,
        output_dir: &Path,
    ) -> Result<R, ControllerError> {
        let id = record.id().to_string();
        let result = self.try_launch(&mut record, output_dir).await;
        if let Err(e) = &result {
            error!(job_id = %id, kind = %R::KIND, error = %e, "failed to launch encoder");
        }
        result.map(|()| record)
    }

    async fn try_launch<R: Lifecycle>(
        &self,
        record: &mut R,
        output_dir: &Path,
    ) -> Result<(), ControllerError> {
        let plan = build_transcode_plan(record.input(), output_dir, record.renditions())?;
        record.set_locations(
            plan.output_dir_string(),
            plan.master.clone(),
            plan.renditions.clone(),
        );
        let id = record.id().to_string();

        self.registry.register(record.clone()).await?;

        let handle = match self.supervisor.start(&id, R::KIND, &plan) {
            Ok(handle) => handle,
            Err(e) => {
                self.registry.remove::<R>(&id).await;
                return Err(e.into());
            }
        };
        self.registry.attach_process(&id, handle.clone()).await;

        // Carries a stop intent stamped while starting.
        if let Some(current) = self.registry.snapshot::<R>(&id).await {
            *record = current;
        }
        if let Err(e) = self.store.persist(record.clone()).await {
            self.registry.remove::<R>(&id).await;
            handle.cancel();
            handle.wait().await;
            return Err(e.into());
        }

        record.on_persisted(&self.publisher);

        match self.registry.promote::<R>(&id).await {
            Promotion::Running => {}
            Promotion::ExitedEarly { record, succeeded } => {
                debug!(job_id = %id, succeeded, "encoder exited before the job was running");
                self.finish(record, succeeded).await;
            }
            Promotion::StopRequested { record } => {
                self.persist_stop_intent(record).await;
                self.halt::<R>(&id).await;
            }
            Promotion::Missing => debug!(job_id = %id, "job removed while starting"),
        }
        Ok(())
    }

    /// Cancel an encoder, wait for its exit, and finish the record if the exit
    /// path has not.
    async fn halt<R: Lifecycle>(&self, id: &str) {
        if let Some(handle) = self.registry.process(id).await {
            handle.cancel();
            if tokio::time::timeout(self.stop_timeout, handle.wait())
                .await
                .is_err()
            {
                warn!(
                    job_id = %id,
                    timeout_secs = self.stop_timeout.as_secs(),
                    "timed out waiting for encoder to stop"
                );
            }
        }

        if let Some(record) = self.registry.remove_running::<R>(id).await {
            self.finish(record, false).await;
        }
    }

    /// Persist a stop intent opened in the registry, then release it
    ///
    /// The exit path defers while the write is in flight, so a terminal
    /// record is never overwritten by the intent. An exit that landed in the
    /// meantime is finished here.
    pub(crate) async fn persist_stop_intent<R: Lifecycle>(&self, record: R) {
        let id = record.id().to_string();
        if let Err(e) = self.store.persist(record).await {
            warn!(job_id = %id, error = %e, "failed to persist stop request");
        }
        if let Some((record, succeeded)) = self.registry.release_stop::<R>(&id).await {
            debug!(job_id = %id, "encoder exited while the stop request was persisted");
            self.finish(record, succeeded).await;
        }
    }

    /// Stamp, run kind-specific completion, and persist
    ///
    /// Completion steps and the write run on the blocking pool; publishing an
    /// upload copies its whole output tree.
    pub(crate) async fn finish<R: Lifecycle>(&self, mut record: R, succeeded: bool) {
        let id = record.id().to_string();
        record.finish(Utc::now());

        let publisher = self.publisher.clone();
        let completed = tokio::task::spawn_blocking(move || {
            record.on_finish(&publisher, succeeded);
            record
        })
        .await;
        let record = match completed {
            Ok(record) => record,
            Err(e) => {
                error!(job_id = %id, error = %e, "job completion task failed");
                return;
            }
        };

        if let Err(e) = self.store.persist(record).await {
            error!(job_id = %id, error = %e, "failed to persist finished job");
        }
    }

    async fn handle_exit(&self, notice: ExitNotice) {
        let ExitNotice {
            job_id,
            kind,
            outcome,
            ack,
        } = notice;
        let succeeded = outcome.is_ok();

        match kind {
            JobKind::Live => self.claim_and_finish::<Job>(&job_id, succeeded).await,
            JobKind::Upload => self.claim_and_finish::<UploadJob>(&job_id, succeeded).await,
        }
        ack.complete();
    }

    async fn claim_and_finish<R: Lifecycle>(&self, id: &str, succeeded: bool) {
        match self.registry.claim_exit::<R>(id, succeeded).await {
            ExitClaim::Finished(record) => {
                self.finish(record, succeeded).await;
                info!(job_id = %id, kind = %R::KIND, succeeded, "job finished");
            }
            ExitClaim::Deferred => debug!(job_id = %id, "exit recorded for a starting job"),
            ExitClaim::Untracked => debug!(job_id = %id, "exit for an inactive job"),
        }
    }
}

/// Finishes exited encoders until the queue closes
async fn reap_exits(controller: Weak<Controller>, mut exits: mpsc::UnboundedReceiver<ExitNotice>) {
    while let Some(notice) = exits.recv().await {
        match controller.upgrade() {
            Some(controller) => {
                tokio::spawn(async move {
                    controller.handle_exit(notice).await;
                });
            }
            None => notice.ack.complete(),
        }
    }
}
