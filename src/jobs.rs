#![forbid(unsafe_code)]

//! Job records and the in-memory store that holds them.
//!
//! Each job lives behind its own mutex. The task that owns a job holds a
//! [`JobWriter`] and is the only code path that mutates the record; pollers
//! take cloned snapshots under a short lock and never wait on the owner's
//! work, only on the few instructions a state change takes.

use std::{
    collections::HashMap,
    fmt,
    path::PathBuf,
    str::FromStr,
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    error::{JobError, JobFailure, JobResult},
    metadata::{FormatKind, VideoMetadata},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = JobError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(raw.trim())
            .map(Self)
            .map_err(|_| JobError::NotFound)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Requested,
    Extracting,
    AwaitingSelection,
    Starting,
    Downloading,
    Processing,
    ReadyForDelivery,
    Completed,
    Failed,
}

impl JobState {
    /// Position along the happy path; `Failed` sits outside it.
    fn step(self) -> Option<u8> {
        match self {
            Self::Requested => Some(0),
            Self::Extracting => Some(1),
            Self::AwaitingSelection => Some(2),
            Self::Starting => Some(3),
            Self::Downloading => Some(4),
            Self::Processing => Some(5),
            Self::ReadyForDelivery => Some(6),
            Self::Completed => Some(7),
            Self::Failed => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Forward-only: exactly one step along the happy path, or into `Failed`
    /// from any non-terminal state.
    pub fn can_transition_to(self, next: JobState) -> bool {
        if self.is_terminal() {
            return false;
        }
        match (self.step(), next.step()) {
            (_, None) => true,
            (Some(current), Some(target)) => target == current + 1,
            (None, Some(_)) => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Requested => "requested",
            Self::Extracting => "extracting",
            Self::AwaitingSelection => "awaiting_selection",
            Self::Starting => "starting",
            Self::Downloading => "downloading",
            Self::Processing => "processing",
            Self::ReadyForDelivery => "ready_for_delivery",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Latest progress sample reported by the extractor.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Progress {
    pub percent: f64,
    pub downloaded_bytes: Option<u64>,
    pub total_bytes: Option<u64>,
    /// Bytes per second.
    pub speed: Option<f64>,
    /// Seconds remaining.
    pub eta: Option<u64>,
    pub status_text: String,
}

#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub url: String,
    pub format_id: Option<String>,
    pub format_kind: FormatKind,
    pub state: JobState,
    pub progress: Progress,
    pub metadata: Option<Arc<VideoMetadata>>,
    pub work_dir: PathBuf,
    pub output_path: Option<PathBuf>,
    pub filename: Option<String>,
    pub error: Option<JobFailure>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// A job created from a download request: the format is already known.
    pub fn for_download(
        url: String,
        format_id: String,
        format_kind: FormatKind,
        downloads_root: &std::path::Path,
    ) -> Self {
        let mut job = Self::blank(url, downloads_root, JobState::Starting);
        job.format_id = Some(format_id);
        job.format_kind = format_kind;
        job.progress.status_text = "Starting...".into();
        job
    }

    /// A job created from a bare URL that still needs metadata and a
    /// format choice.
    pub fn for_session(url: String, downloads_root: &std::path::Path) -> Self {
        Self::blank(url, downloads_root, JobState::Requested)
    }

    fn blank(url: String, downloads_root: &std::path::Path, state: JobState) -> Self {
        let id = JobId::new();
        let now = Utc::now();
        Self {
            id,
            url,
            format_id: None,
            format_kind: FormatKind::Video,
            state,
            progress: Progress::default(),
            metadata: None,
            work_dir: downloads_root.join(id.to_string()),
            output_path: None,
            filename: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn is_expired(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        let idle_state = self.state.is_terminal()
            || matches!(
                self.state,
                JobState::ReadyForDelivery | JobState::AwaitingSelection
            );
        let Ok(ttl) = chrono::Duration::from_std(ttl) else {
            return false;
        };
        idle_state && self.updated_at + ttl <= now
    }
}

/// Registry of every live job.
#[derive(Default)]
pub struct JobStore {
    jobs: RwLock<HashMap<JobId, Arc<Mutex<Job>>>>,
}

impl JobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `job` and hands back the only writer for it.
    pub fn insert(&self, job: Job) -> JobWriter {
        let id = job.id;
        let slot = Arc::new(Mutex::new(job));
        self.jobs.write().insert(id, slot.clone());
        JobWriter { id, slot }
    }

    /// Clones the current record.
    pub fn snapshot(&self, id: &JobId) -> Option<Job> {
        let slot = self.jobs.read().get(id).cloned()?;
        let job = slot.lock().clone();
        Some(job)
    }

    pub(crate) fn writer(&self, id: &JobId) -> Option<JobWriter> {
        let slot = self.jobs.read().get(id).cloned()?;
        Some(JobWriter { id: *id, slot })
    }

    pub fn remove(&self, id: &JobId) -> Option<Job> {
        let slot = self.jobs.write().remove(id)?;
        let job = slot.lock().clone();
        Some(job)
    }

    /// Jobs that have sat idle for longer than `ttl`.
    pub fn expired(&self, now: DateTime<Utc>, ttl: Duration) -> Vec<JobId> {
        self.jobs
            .read()
            .iter()
            .filter(|(_, slot)| slot.lock().is_expired(now, ttl))
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.jobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.read().is_empty()
    }
}

/// Mutation handle for a single job.
#[derive(Clone)]
pub struct JobWriter {
    id: JobId,
    slot: Arc<Mutex<Job>>,
}

impl JobWriter {
    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn state(&self) -> JobState {
        self.slot.lock().state
    }

    pub fn read<R>(&self, f: impl FnOnce(&Job) -> R) -> R {
        f(&self.slot.lock())
    }

    /// Moves the job one step forward along the happy path.
    pub fn advance(&self, next: JobState) -> JobResult<()> {
        let mut job = self.slot.lock();
        if next == JobState::Failed || !job.state.can_transition_to(next) {
            return Err(transition_error(job.state, next));
        }
        job.state = next;
        job.updated_at = Utc::now();
        if next == JobState::Processing {
            job.progress.percent = job.progress.percent.max(99.0);
            job.progress.speed = None;
            job.progress.eta = None;
            job.progress.status_text = "Processing...".into();
        }
        Ok(())
    }

    /// Applies a progress sample. Ignored unless the job is downloading.
    pub fn update_progress(&self, sample: Progress) -> bool {
        let mut job = self.slot.lock();
        if job.state != JobState::Downloading {
            return false;
        }
        job.progress = sample;
        job.updated_at = Utc::now();
        true
    }

    /// Records the format chosen for a session job. Allowed once, while the
    /// job waits for a selection.
    pub fn select_format(&self, format_id: String, kind: FormatKind) -> JobResult<()> {
        let mut job = self.slot.lock();
        if job.state != JobState::AwaitingSelection || job.format_id.is_some() {
            return Err(JobError::NotReady(format!(
                "job is {}, not awaiting a format selection",
                job.state
            )));
        }
        job.format_id = Some(format_id);
        job.format_kind = kind;
        job.state = JobState::Starting;
        job.progress.status_text = "Starting...".into();
        job.updated_at = Utc::now();
        Ok(())
    }

    pub fn attach_metadata(&self, metadata: Arc<VideoMetadata>) {
        let mut job = self.slot.lock();
        if job.metadata.is_none() {
            job.metadata = Some(metadata);
        }
    }

    /// Processing -> ReadyForDelivery with the artifact location.
    pub fn artifact_ready(&self, path: PathBuf, filename: String) -> JobResult<()> {
        let mut job = self.slot.lock();
        if job.state != JobState::Processing {
            return Err(transition_error(job.state, JobState::ReadyForDelivery));
        }
        job.output_path = Some(path);
        job.filename = Some(filename);
        job.state = JobState::ReadyForDelivery;
        job.progress.percent = 100.0;
        job.progress.status_text = "Completed".into();
        job.updated_at = Utc::now();
        Ok(())
    }

    /// ReadyForDelivery -> Completed, returning the artifact. When
    /// `allow_redelivery` is set a completed job hands the artifact out again.
    pub fn claim(&self, allow_redelivery: bool) -> JobResult<(PathBuf, String)> {
        let mut job = self.slot.lock();
        match job.state {
            JobState::ReadyForDelivery => {
                job.state = JobState::Completed;
                job.updated_at = Utc::now();
            }
            JobState::Completed if allow_redelivery => {}
            JobState::Completed => return Err(JobError::AlreadyDelivered),
            JobState::Failed => {
                let reason = job
                    .error
                    .as_ref()
                    .map(|failure| failure.message.clone())
                    .unwrap_or_else(|| "job failed".into());
                return Err(JobError::NotReady(format!("job failed: {reason}")));
            }
            other => {
                return Err(JobError::NotReady(format!("job is {other}")));
            }
        }
        match (&job.output_path, &job.filename) {
            (Some(path), Some(name)) => Ok((path.clone(), name.clone())),
            _ => Err(JobError::Internal("artifact location missing".into())),
        }
    }

    /// Moves the job to `Failed` unless it already reached a terminal state.
    /// Returns whether the failure was recorded.
    pub fn fail(&self, err: &JobError) -> bool {
        let mut job = self.slot.lock();
        if job.state.is_terminal() {
            return false;
        }
        job.state = JobState::Failed;
        job.error = Some(JobFailure::from(err));
        job.output_path = None;
        job.filename = None;
        job.progress.speed = None;
        job.progress.eta = None;
        job.progress.status_text = "Error".into();
        job.updated_at = Utc::now();
        true
    }
}

fn transition_error(from: JobState, to: JobState) -> JobError {
    JobError::NotReady(format!("cannot move job from {from} to {to}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::path::Path;

    const ORDER: [JobState; 8] = [
        JobState::Requested,
        JobState::Extracting,
        JobState::AwaitingSelection,
        JobState::Starting,
        JobState::Downloading,
        JobState::Processing,
        JobState::ReadyForDelivery,
        JobState::Completed,
    ];

    fn download_job() -> Job {
        Job::for_download(
            "https://example.test/v".into(),
            "18".into(),
            FormatKind::Video,
            Path::new("/tmp/simplyt"),
        )
    }

    #[test]
    fn only_single_forward_steps_are_allowed() {
        for (i, from) in ORDER.iter().enumerate() {
            for (j, to) in ORDER.iter().enumerate() {
                let allowed = from.can_transition_to(*to);
                assert_eq!(allowed, j == i + 1, "{from} -> {to}");
            }
        }
    }

    #[test]
    fn failed_reachable_from_every_non_terminal_state() {
        for state in ORDER {
            assert_eq!(
                state.can_transition_to(JobState::Failed),
                state != JobState::Completed
            );
        }
        assert!(!JobState::Failed.can_transition_to(JobState::Failed));
        assert!(!JobState::Failed.can_transition_to(JobState::Starting));
    }

    #[test]
    fn job_ids_are_unique_and_round_trip_through_display() {
        let a = JobId::new();
        let b = JobId::new();
        assert_ne!(a, b);
        assert_eq!(a.to_string().parse::<JobId>().unwrap(), a);
        assert_eq!("nope".parse::<JobId>().unwrap_err(), JobError::NotFound);
    }

    #[test]
    fn work_dir_is_per_job() {
        let a = download_job();
        let b = download_job();
        assert_ne!(a.work_dir, b.work_dir);
        assert!(a.work_dir.ends_with(a.id.to_string()));
    }

    #[test]
    fn happy_path_sets_artifact_and_claim_is_once() {
        let store = JobStore::new();
        let writer = store.insert(download_job());
        writer.advance(JobState::Downloading).unwrap();
        writer.advance(JobState::Processing).unwrap();
        writer
            .artifact_ready(PathBuf::from("/tmp/a.mp4"), "a.mp4".into())
            .unwrap();

        let (path, name) = writer.claim(false).unwrap();
        assert_eq!(path, PathBuf::from("/tmp/a.mp4"));
        assert_eq!(name, "a.mp4");
        assert_eq!(writer.claim(false).unwrap_err(), JobError::AlreadyDelivered);

        let job = store.snapshot(&writer.id()).unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert!(job.output_path.is_some() && job.error.is_none());
    }

    #[test]
    fn redelivery_returns_artifact_again_when_enabled() {
        let store = JobStore::new();
        let writer = store.insert(download_job());
        writer.advance(JobState::Downloading).unwrap();
        writer.advance(JobState::Processing).unwrap();
        writer
            .artifact_ready(PathBuf::from("/tmp/a.mp4"), "a.mp4".into())
            .unwrap();
        writer.claim(true).unwrap();
        assert!(writer.claim(true).is_ok());
    }

    #[test]
    fn skipping_steps_is_rejected() {
        let store = JobStore::new();
        let writer = store.insert(download_job());
        assert!(writer.advance(JobState::Processing).is_err());
        assert!(
            writer
                .artifact_ready(PathBuf::from("/tmp/a"), "a".into())
                .is_err()
        );
        assert_eq!(writer.state(), JobState::Starting);
    }

    #[test]
    fn failure_is_terminal_and_exclusive_with_artifact() {
        let store = JobStore::new();
        let writer = store.insert(download_job());
        writer.advance(JobState::Downloading).unwrap();
        assert!(writer.fail(&JobError::Timeout { secs: 1 }));
        assert!(!writer.fail(&JobError::Cancelled));
        assert!(writer.advance(JobState::Processing).is_err());

        let job = store.snapshot(&writer.id()).unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.error.as_ref().unwrap().kind, ErrorKind::Timeout);
        assert!(job.output_path.is_none());
        assert_eq!(writer.claim(false).unwrap_err().kind(), ErrorKind::NotReady);
    }

    #[test]
    fn progress_only_applies_while_downloading() {
        let store = JobStore::new();
        let writer = store.insert(download_job());
        let sample = Progress {
            percent: 42.0,
            ..Progress::default()
        };
        assert!(!writer.update_progress(sample.clone()));
        writer.advance(JobState::Downloading).unwrap();
        assert!(writer.update_progress(sample));
        writer.advance(JobState::Processing).unwrap();
        assert!(!writer.update_progress(Progress::default()));
        let job = store.snapshot(&writer.id()).unwrap();
        assert_eq!(job.progress.percent, 99.0);
    }

    #[test]
    fn session_selection_happens_once() {
        let store = JobStore::new();
        let writer = store.insert(Job::for_session(
            "https://example.test/v".into(),
            Path::new("/tmp"),
        ));
        assert!(writer.select_format("18".into(), FormatKind::Video).is_err());
        writer.advance(JobState::Extracting).unwrap();
        writer.advance(JobState::AwaitingSelection).unwrap();
        writer.select_format("18".into(), FormatKind::Video).unwrap();
        assert_eq!(writer.state(), JobState::Starting);
        assert!(writer.select_format("22".into(), FormatKind::Video).is_err());
    }

    #[test]
    fn expiry_only_covers_idle_jobs() {
        let store = JobStore::new();
        let running = store.insert(download_job());
        running.advance(JobState::Downloading).unwrap();
        let failed = store.insert(download_job());
        failed.fail(&JobError::Cancelled);

        let later = Utc::now() + chrono::Duration::seconds(120);
        let expired = store.expired(later, Duration::from_secs(60));
        assert_eq!(expired, vec![failed.id()]);
        assert!(store.expired(Utc::now(), Duration::from_secs(60)).is_empty());

        assert!(store.remove(&failed.id()).is_some());
        assert_eq!(store.len(), 1);
        assert!(store.snapshot(&failed.id()).is_none());
    }
}
