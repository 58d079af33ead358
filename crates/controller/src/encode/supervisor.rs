//! Encoder process supervisor
//!
//! Spawns the external encoder for a plan, forwards its output into the log,
//! and reports its exit exactly once on the exit queue. Callers control a
//! running encoder only through a [`ProcessHandle`].

use crate::encode::hls::TranscodePlan;
use crate::jobs::JobKind;
use std::future::Future;
use std::pin::Pin;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Error type for starting an encoder
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// The encoder executable could not be spawned
    #[error("failed to spawn encoder: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Why an encoder run ended without success
#[derive(Debug, Error)]
pub enum EncodeError {
    /// Encoder exited with non-zero status
    #[error("encoder failed with exit code: {0}")]
    Failed(i32),

    /// Encoder was terminated by a signal it was not sent by us
    #[error("encoder process was terminated by signal")]
    Terminated,

    /// Encoder was stopped through its handle
    #[error("encoder was cancelled")]
    Cancelled,

    /// IO error while waiting on the encoder
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A running encoder, resolved when the process has exited.
pub type EncoderRun = Pin<Box<dyn Future<Output = Result<(), EncodeError>> + Send + 'static>>;

/// Starts encoder processes.
///
/// The returned future owns the process. It must stop the process when
/// `cancel` fires and resolve once the process is gone.
pub trait Launcher: Send + Sync + 'static {
    fn launch(
        &self,
        job_id: &str,
        plan: &TranscodePlan,
        cancel: CancellationToken,
    ) -> Result<EncoderRun, SupervisorError>;
}

/// Launches the real encoder executable (ffmpeg by default).
#[derive(Debug, Clone)]
pub struct FfmpegLauncher {
    program: String,
}

impl FfmpegLauncher {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

/// Build the encoder command for a plan
///
/// Output streams are piped so they can be tagged and logged; the process is
/// killed if its owning future is dropped.
pub fn build_encoder_command(program: &str, plan: &TranscodePlan) -> Command {
    let mut cmd = Command::new(program);
    cmd.args(&plan.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    cmd
}

impl Launcher for FfmpegLauncher {
    fn launch(
        &self,
        job_id: &str,
        plan: &TranscodePlan,
        cancel: CancellationToken,
    ) -> Result<EncoderRun, SupervisorError> {
        let mut child = build_encoder_command(&self.program, plan)
            .spawn()
            .map_err(SupervisorError::Spawn)?;

        let mut forwarders = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            forwarders.push(tokio::spawn(forward_lines(job_id.to_string(), "stdout", stdout)));
        }
        if let Some(stderr) = child.stderr.take() {
            forwarders.push(tokio::spawn(forward_lines(job_id.to_string(), "stderr", stderr)));
        }

        Ok(Box::pin(async move {
            let outcome = tokio::select! {
                status = child.wait() => status.map_err(EncodeError::from).and_then(classify_exit),
                _ = cancel.cancelled() => {
                    // Already-exited children make start_kill fail; wait() still reaps.
                    let _ = child.start_kill();
                    match child.wait().await {
                        Ok(_) => Err(EncodeError::Cancelled),
                        Err(e) => Err(EncodeError::Io(e)),
                    }
                }
            };

            for forwarder in forwarders {
                let _ = forwarder.await;
            }

            outcome
        }))
    }
}

fn classify_exit(status: ExitStatus) -> Result<(), EncodeError> {
    if status.success() {
        Ok(())
    } else {
        match status.code() {
            Some(code) => Err(EncodeError::Failed(code)),
            None => Err(EncodeError::Terminated),
        }
    }
}

/// Formats one line of encoder output as `[job][stream] line`.
///
/// Surrounding whitespace is trimmed; blank lines yield `None`.
pub fn tag_line(job_id: &str, stream: &str, line: &str) -> Option<String> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(format!("[{}][{}] {}", job_id, stream, trimmed))
    }
}

async fn forward_lines<R>(job_id: String, stream: &'static str, reader: R)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                if let Some(tagged) = tag_line(&job_id, stream, &String::from_utf8_lossy(&buf)) {
                    info!(target: "encoder", "{}", tagged);
                }
            }
            Err(e) => {
                debug!(job_id = %job_id, stream, error = %e, "encoder output closed");
                break;
            }
        }
    }
}

/// Completion acknowledgement the exit consumer sends once bookkeeping is done.
#[derive(Debug)]
pub struct ExitAck(oneshot::Sender<()>);

impl ExitAck {
    pub fn complete(self) {
        let _ = self.0.send(());
    }
}

/// Sent once per encoder run when its process has exited.
#[derive(Debug)]
pub struct ExitNotice {
    pub job_id: String,
    pub kind: JobKind,
    pub outcome: Result<(), EncodeError>,
    pub ack: ExitAck,
}

/// Control over one running encoder.
///
/// Cloning shares the same process; only the supervisor task touches the
/// process itself.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    cancel: CancellationToken,
    done: watch::Receiver<bool>,
}

impl ProcessHandle {
    /// Asks the encoder to stop. Idempotent, and a no-op once it has exited.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Resolves after the exit notice for this run has been handled.
    pub async fn wait(&self) {
        let mut done = self.done.clone();
        // A dropped sender means the supervisor task is gone, which is also an exit.
        let _ = done.wait_for(|exited| *exited).await;
    }

    pub fn has_exited(&self) -> bool {
        *self.done.borrow()
    }
}

/// Starts encoders and routes their exits onto one queue.
pub struct Supervisor {
    launcher: Arc<dyn Launcher>,
    exits: mpsc::UnboundedSender<ExitNotice>,
}

impl Supervisor {
    /// Create a supervisor and the receiving end of its exit queue
    pub fn new(launcher: Arc<dyn Launcher>) -> (Self, mpsc::UnboundedReceiver<ExitNotice>) {
        let (exits, rx) = mpsc::unbounded_channel();
        (Self { launcher, exits }, rx)
    }

    /// Start an encoder for `job_id`
    ///
    /// On exit, for any reason, one [`ExitNotice`] is queued. The handle's
    /// `wait` resolves only after that notice has been acknowledged, or
    /// dropped unhandled.
    ///
    /// # Errors
    /// Returns an error if the launcher could not spawn the process; nothing
    /// is queued in that case.
    pub fn start(
        &self,
        job_id: &str,
        kind: JobKind,
        plan: &TranscodePlan,
    ) -> Result<ProcessHandle, SupervisorError> {
        let cancel = CancellationToken::new();
        let run = self.launcher.launch(job_id, plan, cancel.clone())?;
        let (done_tx, done_rx) = watch::channel(false);

        let exits = self.exits.clone();
        let task_job_id = job_id.to_string();
        tokio::spawn(async move {
            let outcome = run.await;
            match &outcome {
                Ok(()) => info!(job_id = %task_job_id, %kind, "encoder completed"),
                Err(EncodeError::Cancelled) => {
                    info!(job_id = %task_job_id, %kind, "encoder cancelled")
                }
                Err(e) => {
                    warn!(job_id = %task_job_id, %kind, error = %e, "encoder exited with error")
                }
            }

            let (ack_tx, ack_rx) = oneshot::channel();
            let notice = ExitNotice {
                job_id: task_job_id,
                kind,
                outcome,
                ack: ExitAck(ack_tx),
            };
            if exits.send(notice).is_ok() {
                let _ = ack_rx.await;
            }

            let _ = done_tx.send(true);
        });

        info!(job_id, %kind, "encoder started");
        Ok(ProcessHandle {
            cancel,
            done: done_rx,
        })
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Launchers that stand in for the encoder in tests.

    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Called with the job ID and plan while the launch is in progress.
    pub(crate) type LaunchHook = Box<dyn Fn(&str, &TranscodePlan) + Send + Sync>;

    /// Runs until cancelled, or until `exit_after` elapses if set.
    #[derive(Default)]
    pub(crate) struct FakeLauncher {
        pub fail_spawn: AtomicBool,
        pub exit_after: Option<Duration>,
        pub exit_code: Option<i32>,
        /// Never exits, not even when cancelled.
        pub ignore_cancel: bool,
        pub on_launch: Option<LaunchHook>,
        pub launches: Mutex<Vec<(String, TranscodePlan)>>,
        pub cancelled: Arc<AtomicUsize>,
    }

    impl FakeLauncher {
        pub fn failing() -> Self {
            let launcher = Self::default();
            launcher.fail_spawn.store(true, Ordering::SeqCst);
            launcher
        }

        pub fn exiting_after(delay: Duration, exit_code: Option<i32>) -> Self {
            Self {
                exit_after: Some(delay),
                exit_code,
                ..Self::default()
            }
        }

        pub fn ignoring_cancel() -> Self {
            Self {
                ignore_cancel: true,
                ..Self::default()
            }
        }

        pub fn with_launch_hook(
            mut self,
            hook: impl Fn(&str, &TranscodePlan) + Send + Sync + 'static,
        ) -> Self {
            self.on_launch = Some(Box::new(hook));
            self
        }

        /// Runs that ended because they were cancelled.
        pub fn cancelled_runs(&self) -> usize {
            self.cancelled.load(Ordering::SeqCst)
        }

        pub fn launched_ids(&self) -> Vec<String> {
            self.launches
                .lock()
                .unwrap()
                .iter()
                .map(|(id, _)| id.clone())
                .collect()
        }

        pub fn plan_for(&self, job_id: &str) -> Option<TranscodePlan> {
            self.launches
                .lock()
                .unwrap()
                .iter()
                .rev()
                .find(|(id, _)| id == job_id)
                .map(|(_, plan)| plan.clone())
        }
    }

    impl Launcher for FakeLauncher {
        fn launch(
            &self,
            job_id: &str,
            plan: &TranscodePlan,
            cancel: CancellationToken,
        ) -> Result<EncoderRun, SupervisorError> {
            if self.fail_spawn.load(Ordering::SeqCst) {
                return Err(SupervisorError::Spawn(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "encoder not found",
                )));
            }
            self.launches
                .lock()
                .unwrap()
                .push((job_id.to_string(), plan.clone()));
            if let Some(hook) = &self.on_launch {
                hook(job_id, plan);
            }

            if self.ignore_cancel {
                return Ok(Box::pin(std::future::pending::<Result<(), EncodeError>>()));
            }

            let exit_after = self.exit_after;
            let exit_code = self.exit_code;
            let cancelled = Arc::clone(&self.cancelled);
            Ok(Box::pin(async move {
                let outcome = match exit_after {
                    Some(delay) => tokio::select! {
                        _ = tokio::time::sleep(delay) => match exit_code {
                            Some(code) => Err(EncodeError::Failed(code)),
                            None => Ok(()),
                        },
                        _ = cancel.cancelled() => Err(EncodeError::Cancelled),
                    },
                    None => {
                        cancel.cancelled().await;
                        Err(EncodeError::Cancelled)
                    }
                };
                if matches!(outcome, Err(EncodeError::Cancelled)) {
                    cancelled.fetch_add(1, Ordering::SeqCst);
                }
                outcome
            }))
        }
    }
}
