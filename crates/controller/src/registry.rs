//! Active job registry
//!
//! Live jobs, uploads and their process handles, behind one reader/writer
//! lock. Every operation holds the lock only for its own map updates; callers
//! do disk and process I/O outside.

use crate::encode::ProcessHandle;
use crate::jobs::{Job, Record, UploadJob};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::RwLock;

/// Lifecycle phase of a registered entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Registered, encoder possibly started, record not yet persisted.
    Starting,
    /// Persisted and owned by the exit path.
    Running,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("job {0} is already registered")]
    AlreadyRegistered(String),
}

#[derive(Debug)]
pub(crate) struct Entry<R> {
    record: R,
    phase: Phase,
    /// Exit observed while the entry could not be finished yet; `true` when
    /// the encoder succeeded.
    early_exit: Option<bool>,
    /// Stop requested while still `Starting`.
    stop_requested: bool,
    /// Stop-intent writes in flight. Exits are deferred until they land.
    stop_writes: usize,
}

#[derive(Debug, Default)]
pub(crate) struct State {
    jobs: HashMap<String, Entry<Job>>,
    uploads: HashMap<String, Entry<UploadJob>>,
    processes: HashMap<String, ProcessHandle>,
}

/// Selects the map a record type lives in.
pub(crate) trait Slot: Record {
    fn slots(state: &State) -> &HashMap<String, Entry<Self>>;
    fn slots_mut(state: &mut State) -> &mut HashMap<String, Entry<Self>>;
}

impl Slot for Job {
    fn slots(state: &State) -> &HashMap<String, Entry<Self>> {
        &state.jobs
    }

    fn slots_mut(state: &mut State) -> &mut HashMap<String, Entry<Self>> {
        &mut state.jobs
    }
}

impl Slot for UploadJob {
    fn slots(state: &State) -> &HashMap<String, Entry<Self>> {
        &state.uploads
    }

    fn slots_mut(state: &mut State) -> &mut HashMap<String, Entry<Self>> {
        &mut state.uploads
    }
}

/// Result of moving an entry from `Starting` to `Running`.
#[derive(Debug)]
pub(crate) enum Promotion<R> {
    Running,
    /// The encoder exited before the entry was promoted. The entry has been
    /// removed and the caller finishes the record.
    ExitedEarly { record: R, succeeded: bool },
    /// A stop arrived while starting. The entry is now `Running` with a
    /// stop-intent write open; the caller persists `record`, releases the
    /// write and stops the job.
    StopRequested { record: R },
    /// The entry was removed by someone else.
    Missing,
}

/// Result of asking a live job to stop.
#[derive(Debug)]
pub(crate) enum StopRequest {
    NotFound,
    /// Running job with its stop intent stamped and a stop-intent write
    /// open. The caller persists it and then calls `release_stop`.
    Running(Job),
    /// Job is still starting; the intent is stamped on the registered copy
    /// and its creator will stop it once persisted.
    Starting,
}

/// What the exit path should do with an exited encoder's entry.
#[derive(Debug)]
pub(crate) enum ExitClaim<R> {
    /// Entry was running and has been removed; finish and persist it.
    Finished(R),
    /// Entry is still starting, or a stop intent is being written; the exit
    /// was recorded for whoever finishes that step.
    Deferred,
    /// Nothing registered under this ID (unwound or already stopped).
    Untracked,
}

#[derive(Debug, Default)]
pub struct Registry {
    state: RwLock<State>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new entry in the `Starting` phase
    pub(crate) async fn register<R: Slot>(&self, record: R) -> Result<(), RegistryError> {
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        let id = record.id().to_string();

        if state.processes.contains_key(&id)
            || state.jobs.contains_key(&id)
            || state.uploads.contains_key(&id)
        {
            return Err(RegistryError::AlreadyRegistered(id));
        }

        R::slots_mut(state).insert(
            id,
            Entry {
                record,
                phase: Phase::Starting,
                early_exit: None,
                stop_requested: false,
                stop_writes: 0,
            },
        );
        Ok(())
    }

    pub(crate) async fn attach_process(&self, id: &str, handle: ProcessHandle) {
        self.state
            .write()
            .await
            .processes
            .insert(id.to_string(), handle);
    }

    /// Mark a persisted entry as `Running`
    pub(crate) async fn promote<R: Slot>(&self, id: &str) -> Promotion<R> {
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        let slots = R::slots_mut(state);

        let early_exit = match slots.get_mut(id) {
            None => return Promotion::Missing,
            Some(entry) => match entry.early_exit {
                None => {
                    entry.phase = Phase::Running;
                    if !entry.stop_requested {
                        return Promotion::Running;
                    }
                    entry.stop_requested = false;
                    entry.stop_writes += 1;
                    return Promotion::StopRequested {
                        record: entry.record.clone(),
                    };
                }
                Some(succeeded) => succeeded,
            },
        };

        let entry = slots.remove(id);
        state.processes.remove(id);
        match entry {
            Some(entry) => Promotion::ExitedEarly {
                record: entry.record,
                succeeded: early_exit,
            },
            None => Promotion::Missing,
        }
    }

    /// Claim the entry of an encoder that has exited
    pub(crate) async fn claim_exit<R: Slot>(&self, id: &str, succeeded: bool) -> ExitClaim<R> {
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        let slots = R::slots_mut(state);

        match slots.get(id).map(|entry| (entry.phase, entry.stop_writes)) {
            None => ExitClaim::Untracked,
            Some((Phase::Starting, _)) | Some((Phase::Running, 1..)) => {
                if let Some(entry) = slots.get_mut(id) {
                    entry.early_exit = Some(succeeded);
                }
                ExitClaim::Deferred
            }
            Some((Phase::Running, 0)) => {
                let entry = slots.remove(id);
                state.processes.remove(id);
                match entry {
                    Some(entry) => ExitClaim::Finished(entry.record),
                    None => ExitClaim::Untracked,
                }
            }
        }
    }

    /// Record that an operator asked a live job to stop
    ///
    /// `stop_requested_at` is stamped once on the registered copy. A running
    /// job is returned for persisting with a stop-intent write open; a
    /// starting job is flagged for its creator.
    pub(crate) async fn request_stop(&self, id: &str, at: DateTime<Utc>) -> StopRequest {
        let mut guard = self.state.write().await;
        let Some(entry) = guard.jobs.get_mut(id) else {
            return StopRequest::NotFound;
        };
        entry.record.stop_requested_at.get_or_insert(at);

        match entry.phase {
            Phase::Starting => {
                entry.stop_requested = true;
                StopRequest::Starting
            }
            Phase::Running => {
                entry.stop_writes += 1;
                StopRequest::Running(entry.record.clone())
            }
        }
    }

    /// Close a stop-intent write opened by `request_stop` or `promote`
    ///
    /// Returns the record when the encoder exited while the last write was in
    /// flight; the entry is removed and the caller finishes it.
    pub(crate) async fn release_stop<R: Slot>(&self, id: &str) -> Option<(R, bool)> {
        let mut guard = self.state.write().await;
        let state = &mut *guard;

        let succeeded = {
            let entry = R::slots_mut(state).get_mut(id)?;
            entry.stop_writes = entry.stop_writes.saturating_sub(1);
            if entry.stop_writes > 0 || entry.phase != Phase::Running {
                return None;
            }
            entry.early_exit?
        };

        let entry = R::slots_mut(state).remove(id)?;
        state.processes.remove(id);
        Some((entry.record, succeeded))
    }

    /// Current registered copy of a record
    pub(crate) async fn snapshot<R: Slot>(&self, id: &str) -> Option<R> {
        let guard = self.state.read().await;
        R::slots(&guard).get(id).map(|entry| entry.record.clone())
    }

    /// Remove an entry in any phase, with its process handle
    pub(crate) async fn remove<R: Slot>(&self, id: &str) -> Option<R> {
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        state.processes.remove(id);
        R::slots_mut(state).remove(id).map(|entry| entry.record)
    }

    /// Remove an entry only if it is `Running` with no stop-intent write open
    pub(crate) async fn remove_running<R: Slot>(&self, id: &str) -> Option<R> {
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        let slots = R::slots_mut(state);

        match slots.get(id) {
            Some(entry) if entry.phase == Phase::Running && entry.stop_writes == 0 => {}
            _ => return None,
        }
        let record = slots.remove(id).map(|entry| entry.record);
        state.processes.remove(id);
        record
    }

    #[cfg(test)]
    pub(crate) async fn phase<R: Slot>(&self, id: &str) -> Option<Phase> {
        let guard = self.state.read().await;
        R::slots(&guard).get(id).map(|entry| entry.phase)
    }

    pub async fn job(&self, id: &str) -> Option<Job> {
        self.state.read().await.jobs.get(id).map(|e| e.record.clone())
    }

    pub async fn process(&self, id: &str) -> Option<ProcessHandle> {
        self.state.read().await.processes.get(id).cloned()
    }

    /// Whether a live job or upload is registered under `id`.
    pub async fn contains(&self, id: &str) -> bool {
        let state = self.state.read().await;
        state.jobs.contains_key(id) || state.uploads.contains_key(id)
    }

    /// IDs of every registered live job and upload, sorted.
    pub async fn active_ids(&self) -> Vec<String> {
        let state = self.state.read().await;
        let mut ids: Vec<String> = state
            .jobs
            .keys()
            .chain(state.uploads.keys())
            .cloned()
            .collect();
        ids.sort();
        ids
    }
}
