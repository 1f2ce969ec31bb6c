#![forbid(unsafe_code)]

//! Read side of the job store plus the extractor output parsing that feeds
//! it.

use std::sync::{Arc, LazyLock};

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;

use crate::{
    error::{JobError, JobFailure, JobResult},
    jobs::{Job, JobId, JobState, JobStore, Progress},
    metadata::FormatKind,
};

// [download]  12.5% of ~ 310.04MiB at  374.36KiB/s ETA 11:59 (frag 56/454)
static PROGRESS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^\[download\]\s+(\d+(?:\.\d+)?)%\s+of\s+~?\s*(\d+(?:\.\d+)?\s*[KMGTP]?i?B)(?:\s+at\s+(\d+(?:\.\d+)?\s*[KMGTP]?i?B)/s)?(?:\s+ETA\s+(\d+(?::\d+)*))?",
    )
    .expect("valid regex")
});

static SIZE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d+(?:\.\d+)?)\s*([KMGTP]?)(i?)B$").expect("valid regex")
});

const POST_PROCESSOR_TAGS: &[&str] = &[
    "[ExtractAudio]",
    "[Merger]",
    "[VideoConvertor]",
    "[VideoRemuxer]",
    "[ffmpeg]",
    "[Fixup",
    "[EmbedThumbnail]",
    "[Metadata]",
];

/// Client-facing view of a job.
#[derive(Debug, Clone, Serialize)]
pub struct JobSnapshot {
    pub job_id: JobId,
    pub state: JobState,
    pub percent: f64,
    pub speed: Option<f64>,
    pub speed_text: String,
    pub eta: Option<u64>,
    pub eta_text: String,
    pub downloaded_bytes: Option<u64>,
    pub total_bytes: Option<u64>,
    pub file_size: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format_id: Option<String>,
    pub format_kind: FormatKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobFailure>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Job> for JobSnapshot {
    fn from(job: &Job) -> Self {
        let progress = &job.progress;
        let (speed_text, eta_text) = match job.state {
            JobState::Downloading => (format_speed(progress.speed), format_eta(progress.eta)),
            JobState::ReadyForDelivery | JobState::Completed => {
                ("Completed".to_string(), "Done".to_string())
            }
            JobState::Failed => ("Error".to_string(), "Failed".to_string()),
            _ => ("Starting...".to_string(), "Calculating...".to_string()),
        };
        let file_size = match progress.total_bytes {
            Some(total) => format_bytes(total as f64),
            None => "-- MB".to_string(),
        };
        Self {
            job_id: job.id,
            state: job.state,
            percent: progress.percent,
            speed: progress.speed,
            speed_text,
            eta: progress.eta,
            eta_text,
            downloaded_bytes: progress.downloaded_bytes,
            total_bytes: progress.total_bytes,
            file_size,
            status: progress.status_text.clone(),
            format_id: job.format_id.clone(),
            format_kind: job.format_kind,
            filename: job.filename.clone(),
            error: job.error.clone(),
            created_at: job.created_at,
            updated_at: job.updated_at,
        }
    }
}

#[derive(Clone)]
pub struct ProgressReporter {
    store: Arc<JobStore>,
}

impl ProgressReporter {
    pub fn new(store: Arc<JobStore>) -> Self {
        Self { store }
    }

    pub fn status(&self, id: &JobId) -> JobResult<JobSnapshot> {
        self.store
            .snapshot(id)
            .map(|job| JobSnapshot::from(&job))
            .ok_or(JobError::NotFound)
    }
}

/// What a single line of extractor output means for the job.
#[derive(Debug, Clone, PartialEq)]
pub enum ExtractorLine<'a> {
    Progress(Progress),
    PostProcessing(&'a str),
    Error(&'a str),
    Other,
}

pub fn classify_line(line: &str) -> ExtractorLine<'_> {
    let line = line.trim();
    if let Some(message) = line.strip_prefix("ERROR:") {
        return ExtractorLine::Error(message.trim());
    }
    if let Some(progress) = parse_progress_line(line) {
        return ExtractorLine::Progress(progress);
    }
    if POST_PROCESSOR_TAGS.iter().any(|tag| line.starts_with(tag)) {
        return ExtractorLine::PostProcessing(line);
    }
    ExtractorLine::Other
}

pub fn parse_progress_line(line: &str) -> Option<Progress> {
    let caps = PROGRESS_RE.captures(line.trim())?;
    let percent: f64 = caps.get(1)?.as_str().parse().ok()?;
    let percent = percent.clamp(0.0, 100.0);
    let total = caps.get(2).and_then(|m| parse_size(m.as_str()));
    let speed = caps.get(3).and_then(|m| parse_size(m.as_str()));
    let eta = caps.get(4).and_then(|m| parse_clock(m.as_str()));
    let total_bytes = total.map(|total| total.round() as u64);
    let downloaded_bytes = total.map(|total| (total * percent / 100.0).round() as u64);

    Some(Progress {
        percent,
        downloaded_bytes,
        total_bytes,
        speed,
        eta,
        status_text: format!("Downloading... {percent:.1}%"),
    })
}

/// `"10.00MiB"` -> bytes.
fn parse_size(raw: &str) -> Option<f64> {
    let caps = SIZE_RE.captures(raw.trim())?;
    let value: f64 = caps.get(1)?.as_str().parse().ok()?;
    let base: f64 = if caps.get(3).is_some_and(|m| !m.as_str().is_empty()) {
        1024.0
    } else {
        1000.0
    };
    let power = match caps.get(2).map(|m| m.as_str()) {
        Some("K") => 1,
        Some("M") => 2,
        Some("G") => 3,
        Some("T") => 4,
        Some("P") => 5,
        _ => 0,
    };
    Some(value * base.powi(power))
}

/// `"01:02:03"` / `"02:05"` / `"45"` -> seconds.
fn parse_clock(raw: &str) -> Option<u64> {
    raw.split(':').try_fold(0u64, |acc, part| {
        part.parse::<u64>().ok().map(|value| acc * 60 + value)
    })
}

pub fn format_bytes(bytes: f64) -> String {
    if !bytes.is_finite() || bytes <= 0.0 {
        return "0 B".to_string();
    }
    let mut value = bytes;
    for unit in ["B", "KB", "MB", "GB"] {
        if value < 1024.0 {
            return format!("{value:.1} {unit}");
        }
        value /= 1024.0;
    }
    format!("{value:.1} TB")
}

pub fn format_speed(speed: Option<f64>) -> String {
    match speed {
        Some(speed) if speed > 0.0 => format!("{}/s", format_bytes(speed)),
        _ => "0 B/s".to_string(),
    }
}

pub fn format_eta(eta: Option<u64>) -> String {
    match eta.unwrap_or(0) {
        0 => "0s".to_string(),
        secs if secs < 60 => format!("{secs}s"),
        secs if secs < 3600 => format!("{}m {}s", secs / 60, secs % 60),
        secs => format!("{}h {}m", secs / 3600, (secs % 3600) / 60),
    }
}

/// Rewrites raw extractor errors into something a user can act on.
pub fn friendly_failure(raw: &str) -> String {
    let lower = raw.to_lowercase();
    if lower.contains("403") || lower.contains("forbidden") {
        "The video host is refusing this download. Regional restrictions or rate limiting \
         can cause this; try a different video or wait a few minutes before trying again."
            .to_string()
    } else if lower.contains("empty") {
        "The file couldn't be downloaded completely. The host may have cut the transfer \
         short; please try again in a few minutes."
            .to_string()
    } else if lower.contains("unavailable") {
        "This video is not available for download. It might be private, deleted or \
         restricted in your region."
            .to_string()
    } else if lower.contains("network") || lower.contains("connection") {
        "Network connection error. Please check your internet connection and try again."
            .to_string()
    } else {
        format!("Download failed: {}", raw.trim())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::path::Path;

    #[test]
    fn parses_standard_progress_line() {
        let progress =
            parse_progress_line("[download]  45.3% of ~10.00MiB at 1.50MiB/s ETA 00:05").unwrap();
        assert_eq!(progress.percent, 45.3);
        assert_eq!(progress.total_bytes, Some(10 * 1024 * 1024));
        assert_eq!(progress.speed, Some(1.5 * 1024.0 * 1024.0));
        assert_eq!(progress.eta, Some(5));
        assert_eq!(progress.downloaded_bytes, Some(4_750_049));
    }

    #[test]
    fn parses_fragmented_and_sparse_progress_lines() {
        let progress = parse_progress_line(
            "[download]   6.2% of ~ 343.72MiB at  420.30KiB/s ETA 12:32 (frag 29/454)",
        )
        .unwrap();
        assert_eq!(progress.eta, Some(12 * 60 + 32));

        let progress = parse_progress_line("[download] 100% of 3.00KiB").unwrap();
        assert_eq!(progress.percent, 100.0);
        assert_eq!(progress.total_bytes, Some(3072));
        assert_eq!(progress.speed, None);
        assert_eq!(progress.eta, None);

        let progress =
            parse_progress_line("[download]  10.0% of 1.00GiB at Unknown B/s ETA Unknown")
                .unwrap();
        assert_eq!(progress.speed, None);
        assert_eq!(progress.eta, None);
    }

    #[test]
    fn classifies_extractor_lines() {
        assert_eq!(
            classify_line("ERROR: [youtube] abc: Video unavailable"),
            ExtractorLine::Error("[youtube] abc: Video unavailable")
        );
        assert!(matches!(
            classify_line("[ExtractAudio] Destination: song.mp3"),
            ExtractorLine::PostProcessing(_)
        ));
        assert!(matches!(
            classify_line("[Merger] Merging formats into \"a.mp4\""),
            ExtractorLine::PostProcessing(_)
        ));
        assert!(matches!(
            classify_line("[download]  1.0% of 2.00MiB at 1.00KiB/s ETA 01:00:00"),
            ExtractorLine::Progress(Progress { eta: Some(3600), .. })
        ));
        assert_eq!(
            classify_line("[youtube] abc: Downloading webpage"),
            ExtractorLine::Other
        );
    }

    #[test]
    fn human_readable_formatting() {
        assert_eq!(format_bytes(0.0), "0 B");
        assert_eq!(format_bytes(512.0), "512.0 B");
        assert_eq!(format_bytes(1536.0), "1.5 KB");
        assert_eq!(format_bytes(1.5 * 1024.0 * 1024.0), "1.5 MB");
        assert_eq!(format_speed(None), "0 B/s");
        assert_eq!(format_speed(Some(2048.0)), "2.0 KB/s");
        assert_eq!(format_eta(None), "0s");
        assert_eq!(format_eta(Some(45)), "45s");
        assert_eq!(format_eta(Some(125)), "2m 5s");
        assert_eq!(format_eta(Some(3780)), "1h 3m");
    }

    #[test]
    fn friendly_messages_cover_known_failures() {
        assert!(friendly_failure("HTTP Error 403: Forbidden").contains("refusing"));
        assert!(friendly_failure("The downloaded file is empty").contains("completely"));
        assert!(friendly_failure("Video unavailable").contains("not available"));
        assert!(friendly_failure("Connection reset by peer").contains("Network"));
        assert_eq!(friendly_failure(" boom "), "Download failed: boom");
    }

    #[test]
    fn reporter_projects_store_state() {
        let store = Arc::new(JobStore::new());
        let reporter = ProgressReporter::new(store.clone());
        let writer = store.insert(Job::for_download(
            "https://example.test/v".into(),
            "18".into(),
            FormatKind::Video,
            Path::new("/tmp"),
        ));

        let snapshot = reporter.status(&writer.id()).unwrap();
        assert_eq!(snapshot.state, JobState::Starting);
        assert_eq!(snapshot.file_size, "-- MB");
        assert_eq!(snapshot.format_id.as_deref(), Some("18"));

        writer.advance(JobState::Downloading).unwrap();
        writer.update_progress(
            parse_progress_line("[download]  50.0% of 2.00MiB at 1.00MiB/s ETA 00:01").unwrap(),
        );
        let snapshot = reporter.status(&writer.id()).unwrap();
        assert_eq!(snapshot.percent, 50.0);
        assert_eq!(snapshot.speed_text, "1.0 MB/s");
        assert_eq!(snapshot.eta_text, "1s");
        assert_eq!(snapshot.file_size, "2.0 MB");

        writer.fail(&JobError::Cancelled);
        let snapshot = reporter.status(&writer.id()).unwrap();
        assert_eq!(snapshot.error.unwrap().kind, ErrorKind::Cancelled);
        assert_eq!(snapshot.eta_text, "Failed");

        assert_eq!(
            reporter.status(&JobId::new()).unwrap_err(),
            JobError::NotFound
        );
    }
}
