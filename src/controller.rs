#![forbid(unsafe_code)]

//! The job controller drives every job from request to delivery.
//!
//! Metadata lookups run inline and return to the caller. Downloads get a
//! dedicated working directory under the downloads root and one tokio task
//! that owns the job's [`JobWriter`] until the job settles. Clients watch
//! progress by polling [`JobController::get_status`].

use std::{
    collections::HashMap,
    io,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, SystemTime},
};

use chrono::Utc;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use walkdir::WalkDir;

use crate::{
    config::RuntimeSettings,
    error::{ErrorKind, JobError, JobResult},
    jobs::{Job, JobId, JobState, JobStore, JobWriter},
    metadata::{FormatKind, VideoMetadata, parse_info_json},
    progress::{ExtractorLine, JobSnapshot, ProgressReporter, classify_line, friendly_failure},
    runner::{Outcome, ProcessRunner, RunEvent, RunnerSession},
    security::{validate_format_id, validate_url},
};

const OUTPUT_TEMPLATE: &str = "%(title)s.%(ext)s";
const MAX_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

// Leftovers of an interrupted or still-running download.
const TEMP_SUFFIXES: &[&str] = &[".part", ".ytdl", ".tmp", ".temp", ".json", ".aria2"];

#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub downloads_root: PathBuf,
    pub metadata_timeout: Duration,
    pub download_timeout: Duration,
    pub retention: Duration,
    pub allow_redelivery: bool,
}

impl From<&RuntimeSettings> for ControllerSettings {
    fn from(settings: &RuntimeSettings) -> Self {
        Self {
            downloads_root: settings.downloads_root.clone(),
            metadata_timeout: settings.metadata_timeout,
            download_timeout: settings.download_timeout,
            retention: settings.retention,
            allow_redelivery: settings.allow_redelivery,
        }
    }
}

/// A claimed artifact, ready to be streamed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub job_id: JobId,
    pub path: PathBuf,
    pub filename: String,
    /// Directory to delete once the bytes have been sent. `None` when the
    /// artifact may be claimed again.
    pub cleanup_dir: Option<PathBuf>,
}

#[derive(Clone)]
pub struct JobController {
    inner: Arc<ControllerInner>,
}

struct ControllerInner {
    store: Arc<JobStore>,
    reporter: ProgressReporter,
    runner: ProcessRunner,
    settings: ControllerSettings,
    active: Mutex<HashMap<JobId, ActiveRun>>,
    sessions: Mutex<HashMap<JobId, RunnerSession>>,
}

/// Handle on the task that owns a job while it is being downloaded.
/// Registered before the job enters `Starting`.
#[derive(Clone, Default)]
struct ActiveRun {
    /// Asks the owning task to stop the extractor and fail the job.
    stop: CancellationToken,
    /// Fired by the owning task once it has let go of the job.
    finished: CancellationToken,
}

impl JobController {
    pub fn new(runner: ProcessRunner, settings: ControllerSettings) -> Self {
        let store = Arc::new(JobStore::new());
        Self {
            inner: Arc::new(ControllerInner {
                reporter: ProgressReporter::new(store.clone()),
                store,
                runner,
                settings,
                active: Mutex::new(HashMap::new()),
                sessions: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn settings(&self) -> &ControllerSettings {
        &self.inner.settings
    }

    pub fn job_count(&self) -> usize {
        self.inner.store.len()
    }

    /// Looks up metadata for `url` without creating a job.
    pub async fn request_metadata(&self, url: &str) -> JobResult<VideoMetadata> {
        let url = validate_url(url)?;
        let mut session = self.inner.runner.session();
        let result = fetch_metadata(&mut session, &url, self.inner.settings.metadata_timeout).await;
        match &result {
            Ok(metadata) => info!(
                url = %url,
                title = %metadata.title,
                formats = metadata.formats.len(),
                "metadata extracted"
            ),
            Err(err) => warn!(url = %url, kind = err.kind().as_str(), error = %err, "metadata request failed"),
        }
        result
    }

    /// Creates a job in `Starting` and hands it to a background task.
    /// Returns as soon as the task is spawned.
    pub fn start_download(
        &self,
        url: &str,
        format_id: &str,
        kind: FormatKind,
    ) -> JobResult<JobId> {
        let url = validate_url(url)?;
        let format_id = validate_format_id(format_id)?;
        let job = Job::for_download(url, format_id, kind, &self.inner.settings.downloads_root);
        let run = self.register(job.id);
        let writer = self.inner.store.insert(job);
        let id = writer.id();
        info!(job_id = %id, kind = kind.as_str(), "download requested");
        self.launch(writer, self.inner.runner.session(), run);
        Ok(id)
    }

    /// Creates a job from a bare URL and runs metadata extraction for it.
    /// The job waits in `AwaitingSelection` until [`Self::select_format`].
    pub async fn open_session(&self, url: &str) -> JobResult<(JobId, Arc<VideoMetadata>)> {
        let url = validate_url(url)?;
        let writer = self
            .inner
            .store
            .insert(Job::for_session(url.clone(), &self.inner.settings.downloads_root));
        let id = writer.id();
        writer.advance(JobState::Extracting)?;
        debug!(job_id = %id, "extracting metadata for session");

        let mut session = self.inner.runner.session();
        match fetch_metadata(&mut session, &url, self.inner.settings.metadata_timeout).await {
            Ok(metadata) => {
                let metadata = Arc::new(metadata);
                writer.attach_metadata(metadata.clone());
                writer.advance(JobState::AwaitingSelection)?;
                self.inner.sessions.lock().insert(id, session);
                info!(job_id = %id, title = %metadata.title, "session awaiting format selection");
                Ok((id, metadata))
            }
            Err(err) => {
                writer.fail(&err);
                warn!(job_id = %id, kind = err.kind().as_str(), error = %err, "session extraction failed");
                Err(err)
            }
        }
    }

    /// Starts the download for a session once the client picked a format
    /// from the ones it was offered.
    pub fn select_format(&self, id: &JobId, format_id: &str) -> JobResult<JobId> {
        let format_id = validate_format_id(format_id)?;
        let writer = self.inner.store.writer(id).ok_or(JobError::NotFound)?;
        let state = writer.state();
        if state != JobState::AwaitingSelection {
            return Err(JobError::NotReady(format!(
                "job is {state}, not awaiting a format selection"
            )));
        }
        let kind = writer
            .read(|job| {
                job.metadata
                    .as_ref()
                    .and_then(|metadata| metadata.format(&format_id))
                    .map(|format| format.kind)
            })
            .ok_or_else(|| {
                JobError::validation(format!("format {format_id} was not offered for this video"))
            })?;
        let run = self.register(*id);
        if let Err(err) = writer.select_format(format_id, kind) {
            self.release(id, &run);
            return Err(err);
        }

        let session = self
            .inner
            .sessions
            .lock()
            .remove(id)
            .unwrap_or_else(|| self.inner.runner.session());
        info!(job_id = %id, kind = kind.as_str(), "format selected");
        self.launch(writer, session, run);
        Ok(*id)
    }

    pub fn get_status(&self, id: &JobId) -> JobResult<JobSnapshot> {
        self.inner.reporter.status(id)
    }

    /// Hands out the artifact of a finished job and marks it delivered.
    pub async fn claim_artifact(&self, id: &JobId) -> JobResult<Delivery> {
        let writer = self.inner.store.writer(id).ok_or(JobError::NotFound)?;
        let allow_redelivery = self.inner.settings.allow_redelivery;
        let (state, output_path) = writer.read(|job| (job.state, job.output_path.clone()));
        let deliverable = state == JobState::ReadyForDelivery
            || (state == JobState::Completed && allow_redelivery);
        if deliverable
            && let Some(path) = output_path
            && tokio::fs::metadata(&path).await.is_err()
        {
            warn!(job_id = %id, path = %path.display(), "artifact vanished before delivery");
            return Err(JobError::NotFound);
        }

        let (path, filename) = writer.claim(allow_redelivery)?;
        info!(job_id = %id, filename = %filename, "artifact claimed");
        Ok(Delivery {
            job_id: *id,
            path,
            filename,
            cleanup_dir: (!allow_redelivery).then(|| writer.read(|job| job.work_dir.clone())),
        })
    }

    /// Stops a job. While a download task owns the job, that task kills the
    /// extractor and records the failure; this waits for it to let go.
    pub async fn cancel(&self, id: &JobId) -> JobResult<()> {
        let writer = self.inner.store.writer(id).ok_or(JobError::NotFound)?;
        let already_settled = || JobError::NotReady(format!("job already {}", writer.state()));
        if writer.state().is_terminal() {
            return Err(already_settled());
        }
        self.inner.sessions.lock().remove(id);

        let running = self.inner.active.lock().get(id).cloned();
        if let Some(run) = running {
            run.stop.cancel();
            run.finished.cancelled().await;
            let cancelled = writer.read(|job| {
                job.error
                    .as_ref()
                    .is_some_and(|failure| failure.kind == ErrorKind::Cancelled)
            });
            if cancelled {
                info!(job_id = %id, "job cancelled");
                return Ok(());
            }
        }

        // No task owned the job when checked.
        if !writer.fail(&JobError::Cancelled) {
            return Err(already_settled());
        }
        // A selection may have launched a task since the check above.
        if let Some(run) = self.inner.active.lock().get(id) {
            run.stop.cancel();
        }
        remove_work_dir(&writer.read(|job| job.work_dir.clone())).await;
        info!(job_id = %id, "job cancelled");
        Ok(())
    }

    /// Drops idle jobs older than the retention window along with their
    /// working directories. Returns how many were removed.
    pub async fn sweep_expired(&self) -> usize {
        let expired = self
            .inner
            .store
            .expired(Utc::now(), self.inner.settings.retention);
        let mut removed = 0;
        for id in expired {
            let Some(job) = self.inner.store.remove(&id) else {
                continue;
            };
            self.inner.sessions.lock().remove(&id);
            remove_work_dir(&job.work_dir).await;
            debug!(job_id = %id, state = %job.state, "expired job removed");
            removed += 1;
        }
        if removed > 0 {
            info!(removed, "retention sweep finished");
        }
        removed
    }

    /// Runs [`Self::sweep_expired`] periodically until `shutdown` fires.
    pub async fn run_retention_sweeper(&self, shutdown: CancellationToken) {
        let period = self.inner.settings.retention.min(MAX_SWEEP_INTERVAL);
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep_expired().await;
                }
                _ = shutdown.cancelled() => break,
            }
        }
        debug!("retention sweeper stopped");
    }

    fn register(&self, id: JobId) -> ActiveRun {
        let run = ActiveRun::default();
        self.inner.active.lock().insert(id, run.clone());
        run
    }

    fn release(&self, id: &JobId, run: &ActiveRun) {
        self.inner.active.lock().remove(id);
        run.finished.cancel();
    }

    fn launch(&self, writer: JobWriter, session: RunnerSession, run: ActiveRun) {
        let controller = self.clone();
        tokio::spawn(async move {
            let id = writer.id();
            run_download(&controller.inner, &writer, session, &run.stop).await;
            if writer.state() == JobState::Failed {
                remove_work_dir(&writer.read(|job| job.work_dir.clone())).await;
            }
            controller.release(&id, &run);
        });
    }
}

async fn fetch_metadata(
    session: &mut RunnerSession,
    url: &str,
    timeout: Duration,
) -> JobResult<VideoMetadata> {
    let args = metadata_args(url);
    match session.run(&args, None, timeout).await {
        Outcome::Success { stdout } => parse_info_json(&stdout),
        Outcome::ToolUnavailable => Err(JobError::ToolUnavailable),
        Outcome::ProcessError { exit_code, stderr } => Err(JobError::ExtractionFailed(
            summarize_stderr(&stderr, exit_code),
        )),
        Outcome::TimedOut => Err(JobError::Timeout {
            secs: timeout.as_secs(),
        }),
        Outcome::Cancelled => Err(JobError::Cancelled),
    }
}

fn metadata_args(url: &str) -> Vec<String> {
    ["-J", "--no-warnings", "--no-playlist", "--", url]
        .into_iter()
        .map(String::from)
        .collect()
}

fn download_args(url: &str, format_id: &str, kind: FormatKind) -> Vec<String> {
    let mut args: Vec<String> = [
        "--newline",
        "--no-playlist",
        "--no-warnings",
        "-f",
        format_id,
        "-o",
        OUTPUT_TEMPLATE,
    ]
    .into_iter()
    .map(String::from)
    .collect();
    match kind {
        FormatKind::Audio => args.extend(
            ["-x", "--audio-format", "mp3", "--audio-quality", "192K"].map(String::from),
        ),
        FormatKind::Video => {
            args.extend(["--merge-output-format", "mp4"].map(String::from));
        }
    }
    args.push("--".into());
    args.push(url.into());
    args
}

async fn run_download(
    inner: &ControllerInner,
    writer: &JobWriter,
    mut session: RunnerSession,
    cancel: &CancellationToken,
) {
    let id = writer.id();
    let (url, format_id, kind, work_dir) = writer.read(|job| {
        (
            job.url.clone(),
            job.format_id.clone(),
            job.format_kind,
            job.work_dir.clone(),
        )
    });
    let Some(format_id) = format_id else {
        writer.fail(&JobError::Internal("job has no format selected".into()));
        return;
    };
    if cancel.is_cancelled() || writer.state().is_terminal() {
        writer.fail(&JobError::Cancelled);
        return;
    }

    if let Err(err) = tokio::fs::create_dir_all(&work_dir).await {
        warn!(job_id = %id, path = %work_dir.display(), error = %err, "cannot create job directory");
        writer.fail(&JobError::Internal(format!(
            "cannot create working directory: {err}"
        )));
        return;
    }

    let args = download_args(&url, &format_id, kind);
    let timeout = inner.settings.download_timeout;
    let mut extractor_error: Option<String> = None;
    debug!(job_id = %id, format_id = %format_id, "spawning extractor");

    let outcome = session
        .run_streaming(&args, Some(&work_dir), timeout, cancel, |event| {
            let line = match event {
                RunEvent::Spawned => {
                    if writer.state() == JobState::Starting {
                        step(writer, JobState::Downloading);
                    }
                    return;
                }
                RunEvent::Line(_, line) => line,
            };
            match classify_line(line) {
                ExtractorLine::Progress(sample) => {
                    writer.update_progress(sample);
                }
                ExtractorLine::PostProcessing(step_line) => {
                    trace!(job_id = %id, line = step_line, "post-processing");
                    if writer.state() == JobState::Downloading {
                        step(writer, JobState::Processing);
                    }
                }
                ExtractorLine::Error(message) => {
                    warn!(job_id = %id, message, "extractor reported an error");
                    extractor_error.get_or_insert_with(|| message.to_string());
                }
                ExtractorLine::Other => trace!(job_id = %id, line, "extractor output"),
            }
        })
        .await;

    if let Some(candidate) = session.resolved() {
        debug!(job_id = %id, candidate = %candidate.label(), "extractor finished");
    }

    let failure = match outcome {
        Outcome::Success { .. } => extractor_error
            .map(|message| JobError::DownloadFailed(friendly_failure(&message))),
        Outcome::ToolUnavailable => Some(JobError::ToolUnavailable),
        Outcome::ProcessError { exit_code, stderr } => {
            let reason = extractor_error.unwrap_or_else(|| summarize_stderr(&stderr, exit_code));
            Some(JobError::DownloadFailed(friendly_failure(&reason)))
        }
        Outcome::TimedOut => Some(JobError::Timeout {
            secs: timeout.as_secs(),
        }),
        Outcome::Cancelled => Some(JobError::Cancelled),
    };
    if let Some(err) = failure {
        if writer.fail(&err) {
            warn!(job_id = %id, kind = err.kind().as_str(), error = %err, "download failed");
        }
        return;
    }

    if writer.state() == JobState::Starting {
        step(writer, JobState::Downloading);
    }
    if writer.state() == JobState::Downloading {
        step(writer, JobState::Processing);
    }
    if writer.state() != JobState::Processing {
        return;
    }

    let scan_dir = work_dir.clone();
    let located = tokio::task::spawn_blocking(move || find_artifact(&scan_dir)).await;
    let artifact = match located {
        Ok(Ok(artifact)) => artifact,
        Ok(Err(err)) => {
            writer.fail(&JobError::Internal(format!(
                "cannot scan working directory: {err}"
            )));
            return;
        }
        Err(err) => {
            writer.fail(&JobError::Internal(format!("artifact scan panicked: {err}")));
            return;
        }
    };

    let Some(path) = artifact else {
        let err = JobError::DownloadFailed(
            "The download finished but no file was produced. Please try another format.".into(),
        );
        warn!(job_id = %id, path = %work_dir.display(), "no artifact found");
        writer.fail(&err);
        return;
    };
    let filename = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| id.to_string());

    match writer.artifact_ready(path, filename.clone()) {
        Ok(()) => info!(job_id = %id, filename = %filename, "artifact ready"),
        Err(err) => debug!(job_id = %id, error = %err, "job settled before artifact was recorded"),
    }
}

fn step(writer: &JobWriter, next: JobState) {
    if let Err(err) = writer.advance(next) {
        debug!(job_id = %writer.id(), error = %err, "state change skipped");
    }
}

/// Picks the most recently modified finished file in `dir`.
pub fn find_artifact(dir: &Path) -> io::Result<Option<PathBuf>> {
    let mut newest: Option<(SystemTime, PathBuf)> = None;
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
        let entry = entry.map_err(io::Error::other)?;
        if !entry.file_type().is_file() || is_temp_file(&entry.file_name().to_string_lossy()) {
            continue;
        }
        let metadata = entry.metadata().map_err(io::Error::other)?;
        if metadata.len() == 0 {
            continue;
        }
        let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        let newer = newest.as_ref().is_none_or(|(best, best_path)| {
            modified > *best || (modified == *best && entry.path() > best_path.as_path())
        });
        if newer {
            newest = Some((modified, entry.into_path()));
        }
    }
    Ok(newest.map(|(_, path)| path))
}

fn is_temp_file(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower.starts_with('.')
        || lower.contains(".part-frag")
        || TEMP_SUFFIXES.iter().any(|suffix| lower.ends_with(suffix))
}

fn summarize_stderr(stderr: &str, exit_code: Option<i32>) -> String {
    let mut last = None;
    for line in stderr.lines().map(str::trim).filter(|line| !line.is_empty()) {
        if let Some(message) = line.strip_prefix("ERROR:") {
            return message.trim().to_string();
        }
        last = Some(line);
    }
    match (last, exit_code) {
        (Some(line), _) => line.to_string(),
        (None, Some(code)) => format!("extractor exited with status {code}"),
        (None, None) => "extractor was terminated by a signal".to_string(),
    }
}

async fn remove_work_dir(dir: &Path) {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => debug!(path = %dir.display(), "job directory removed"),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => warn!(path = %dir.display(), error = %err, "failed to remove job directory"),
    }
}
