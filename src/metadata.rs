#![forbid(unsafe_code)]

//! Video metadata as returned to clients, and the conversion from the
//! extractor's `--dump-single-json` document.
//!
//! The catalogue is shaped for a picker UI: one entry per video height
//! (best first), then audio-only streams by bitrate, with generic selectors
//! as a fallback when the extractor lists nothing usable.

use std::collections::HashSet;

use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

use crate::error::{JobError, JobResult};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FormatKind {
    #[default]
    Video,
    Audio,
}

impl FormatKind {
    /// Parses the client's `format_kind`; absent means video.
    pub fn parse(value: Option<&str>) -> JobResult<Self> {
        match value.map(|value| value.trim().to_ascii_lowercase()) {
            None => Ok(Self::Video),
            Some(value) if value.is_empty() || value == "video" || value == "mp4" => {
                Ok(Self::Video)
            }
            Some(value) if value == "audio" || value == "mp3" => Ok(Self::Audio),
            Some(other) => Err(JobError::validation(format!(
                "unknown format kind: {other}"
            ))),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Video => "video",
            Self::Audio => "audio",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormatDescriptor {
    pub format_id: String,
    pub label: String,
    pub kind: FormatKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ext: Option<String>,
}

/// Duration in whole seconds, or `"unknown"` when the extractor omits it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaDuration {
    Seconds(u64),
    Unknown,
}

impl Serialize for MediaDuration {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Seconds(secs) => serializer.serialize_u64(*secs),
            Self::Unknown => serializer.serialize_str("unknown"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VideoMetadata {
    pub title: String,
    pub duration: MediaDuration,
    pub thumbnail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uploader: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub view_count: Option<u64>,
    pub formats: Vec<FormatDescriptor>,
}

impl VideoMetadata {
    pub fn format(&self, format_id: &str) -> Option<&FormatDescriptor> {
        self.formats
            .iter()
            .find(|format| format.format_id == format_id)
    }
}

#[derive(Deserialize)]
struct RawInfo {
    title: Option<String>,
    duration: Option<f64>,
    thumbnail: Option<String>,
    uploader: Option<String>,
    view_count: Option<u64>,
    #[serde(default)]
    formats: Vec<Value>,
}

#[derive(Deserialize)]
struct RawFormat {
    format_id: Option<String>,
    height: Option<f64>,
    vcodec: Option<String>,
    acodec: Option<String>,
    ext: Option<String>,
    filesize: Option<f64>,
    filesize_approx: Option<f64>,
    abr: Option<f64>,
}

impl RawFormat {
    fn size_bytes(&self) -> Option<f64> {
        self.filesize
            .or(self.filesize_approx)
            .filter(|size| *size > 0.0)
    }
}

fn has_codec(codec: &Option<String>) -> bool {
    codec
        .as_deref()
        .is_some_and(|codec| !codec.is_empty() && codec != "none")
}

/// Parses the extractor's JSON document. Empty or non-JSON output is an
/// extraction failure; nothing partial is returned.
pub fn parse_info_json(stdout: &str) -> JobResult<VideoMetadata> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Err(JobError::ExtractionFailed(
            "the extractor returned no metadata".into(),
        ));
    }
    let info: RawInfo = serde_json::from_str(trimmed)
        .map_err(|_| JobError::ExtractionFailed("unparsable output".into()))?;

    let duration = info
        .duration
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(|secs| MediaDuration::Seconds(secs.round() as u64))
        .unwrap_or(MediaDuration::Unknown);

    Ok(VideoMetadata {
        title: info
            .title
            .filter(|title| !title.trim().is_empty())
            .unwrap_or_else(|| "Unknown Title".to_string()),
        duration,
        thumbnail: info.thumbnail.unwrap_or_default(),
        uploader: info.uploader,
        view_count: info.view_count,
        formats: build_catalogue(&info.formats),
    })
}

fn build_catalogue(raw_formats: &[Value]) -> Vec<FormatDescriptor> {
    let mut video: Vec<(u32, FormatDescriptor)> = Vec::new();
    let mut audio: Vec<(f64, FormatDescriptor)> = Vec::new();

    for value in raw_formats {
        if !value.is_object() {
            continue;
        }
        let Ok(format) = serde_json::from_value::<RawFormat>(value.clone()) else {
            continue;
        };
        let Some(format_id) = format
            .format_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
        else {
            continue;
        };
        let ext = format.ext.clone().filter(|ext| !ext.is_empty());

        match format.height.filter(|height| *height > 0.0) {
            Some(height) if has_codec(&format.vcodec) => {
                let height = height.round() as u32;
                let mut label = format!("{height}p");
                if let Some(ext) = &ext {
                    label.push_str(&format!(" ({})", ext.to_uppercase()));
                }
                if let Some(size) = format.size_bytes() {
                    label.push_str(&format!(" - {:.1}MB", size / BYTES_PER_MB));
                }
                video.push((
                    height,
                    FormatDescriptor {
                        format_id: format_id.to_string(),
                        label,
                        kind: FormatKind::Video,
                        ext,
                    },
                ));
            }
            _ if !has_codec(&format.vcodec) && has_codec(&format.acodec) => {
                let mut label = "Audio Only".to_string();
                if let Some(ext) = &ext {
                    label.push_str(&format!(" ({})", ext.to_uppercase()));
                }
                if let Some(abr) = format.abr.filter(|abr| *abr > 0.0) {
                    label.push_str(&format!(" - {abr:.0}kbps"));
                }
                if let Some(size) = format.size_bytes() {
                    label.push_str(&format!(" - {:.1}MB", size / BYTES_PER_MB));
                }
                audio.push((
                    format.abr.unwrap_or(0.0),
                    FormatDescriptor {
                        format_id: format_id.to_string(),
                        label,
                        kind: FormatKind::Audio,
                        ext,
                    },
                ));
            }
            _ => {}
        }
    }

    video.sort_by(|a, b| b.0.cmp(&a.0));
    audio.sort_by(|a, b| b.0.total_cmp(&a.0));

    let mut seen_heights = HashSet::new();
    let mut formats: Vec<FormatDescriptor> = video
        .into_iter()
        .filter(|(height, _)| seen_heights.insert(*height))
        .map(|(_, format)| format)
        .collect();
    if formats.is_empty() {
        formats.push(fallback("best", "Best Available", FormatKind::Video, "mp4"));
        formats.push(fallback("worst", "Lowest Quality", FormatKind::Video, "mp4"));
    }

    let mut audio: Vec<FormatDescriptor> = audio.into_iter().map(|(_, format)| format).collect();
    if audio.is_empty() {
        audio.push(fallback("bestaudio", "Best Audio (M4A)", FormatKind::Audio, "m4a"));
    }
    formats.extend(audio);

    let mut seen_ids = HashSet::new();
    formats.retain(|format| seen_ids.insert(format.format_id.clone()));
    formats
}

fn fallback(id: &str, label: &str, kind: FormatKind, ext: &str) -> FormatDescriptor {
    FormatDescriptor {
        format_id: id.to_string(),
        label: label.to_string(),
        kind,
        ext: Some(ext.to_string()),
    }
}
