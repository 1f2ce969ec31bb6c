#![forbid(unsafe_code)]

use anyhow::{Context, Result, anyhow, bail};
use serde::Deserialize;
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::runner::Candidate;

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_SIMPLYT_PORT: u16 = 8080;
pub const DEFAULT_SIMPLYT_HOST: &str = "127.0.0.1";
pub const DEFAULT_DOWNLOADS_ROOT: &str = "downloads";
pub const DEFAULT_METADATA_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(30 * 60);
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub downloads_root: PathBuf,
    pub host: String,
    pub port: u16,
    pub metadata_timeout: Duration,
    pub download_timeout: Duration,
    pub retention: Duration,
    pub allow_redelivery: bool,
    pub tools_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Default)]
pub struct RuntimeOverrides {
    pub downloads_root: Option<PathBuf>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub tools_file: Option<PathBuf>,
    pub allow_redelivery: Option<bool>,
    pub env_path: Option<PathBuf>,
}

pub fn resolve_runtime_settings(overrides: RuntimeOverrides) -> Result<RuntimeSettings> {
    let env_path = overrides
        .env_path
        .as_deref()
        .unwrap_or_else(|| Path::new(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(env_path)?;
    build_runtime_settings(&file_vars, env_var_string, overrides)
}

fn build_runtime_settings(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: RuntimeOverrides,
) -> Result<RuntimeSettings> {
    let lookup = |key: &str| lookup_value(key, file_vars, &env_lookup);

    let downloads_root = overrides
        .downloads_root
        .or_else(|| lookup("SIMPLYT_DOWNLOADS_ROOT").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DOWNLOADS_ROOT));
    let port = overrides
        .port
        .or_else(|| lookup("SIMPLYT_PORT").and_then(|value| value.parse::<u16>().ok()))
        .unwrap_or(DEFAULT_SIMPLYT_PORT);
    let host = overrides
        .host
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .or_else(|| lookup("SIMPLYT_HOST"))
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_SIMPLYT_HOST.to_string());
    let metadata_timeout = parse_duration_var(
        lookup("SIMPLYT_METADATA_TIMEOUT_SECS"),
        "SIMPLYT_METADATA_TIMEOUT_SECS",
    )?
    .unwrap_or(DEFAULT_METADATA_TIMEOUT);
    let download_timeout = parse_duration_var(
        lookup("SIMPLYT_DOWNLOAD_TIMEOUT_SECS"),
        "SIMPLYT_DOWNLOAD_TIMEOUT_SECS",
    )?
    .unwrap_or(DEFAULT_DOWNLOAD_TIMEOUT);
    let retention = parse_duration_var(lookup("SIMPLYT_RETENTION_SECS"), "SIMPLYT_RETENTION_SECS")?
        .unwrap_or(DEFAULT_RETENTION);
    let allow_redelivery = match overrides.allow_redelivery {
        Some(value) => value,
        None => match lookup("SIMPLYT_ALLOW_REDELIVERY") {
            Some(raw) => parse_bool(&raw)
                .ok_or_else(|| anyhow!("SIMPLYT_ALLOW_REDELIVERY must be true or false"))?,
            None => false,
        },
    };
    let tools_file = overrides
        .tools_file
        .or_else(|| lookup("SIMPLYT_TOOLS_FILE").map(PathBuf::from));

    Ok(RuntimeSettings {
        downloads_root,
        host,
        port,
        metadata_timeout,
        download_timeout,
        retention,
        allow_redelivery,
        tools_file,
    })
}

fn parse_duration_var(value: Option<String>, key: &str) -> Result<Option<Duration>> {
    let Some(raw) = value else {
        return Ok(None);
    };
    let secs = raw
        .parse::<u64>()
        .with_context(|| format!("{key} must be a whole number of seconds"))?;
    if secs == 0 {
        bail!("{key} must be greater than zero");
    }
    Ok(Some(Duration::from_secs(secs)))
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key).or_else(|| file_vars.get(key).cloned())
}

pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let line = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let Some((key, value_raw)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value_raw.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|value| value.strip_suffix('"'))
            .or_else(|| {
                value
                    .strip_prefix('\'')
                    .and_then(|value| value.strip_suffix('\''))
            })
            .unwrap_or(value);
        vars.insert(key.to_string(), value.to_string());
    }
    Ok(vars)
}

/// Ranked list of ways to launch the extractor. Order matters: the first
/// entry that actually runs wins.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolTable {
    pub candidates: Vec<Candidate>,
}

impl Default for ToolTable {
    fn default() -> Self {
        Self {
            candidates: vec![
                Candidate::program("yt-dlp"),
                Candidate::program("/usr/local/bin/yt-dlp"),
                Candidate::module("python3", "yt_dlp"),
                Candidate::module("/usr/local/bin/python3", "yt_dlp"),
            ],
        }
    }
}

impl ToolTable {
    /// Loads the table from `path` when given, otherwise returns the built-in
    /// order.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading tool table {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("parsing tool table {}", path.display()))
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let table: ToolTable = toml::from_str(raw)?;
        if table.candidates.is_empty() {
            bail!("tool table must list at least one candidate");
        }
        if let Some(blank) = table
            .candidates
            .iter()
            .find(|candidate| candidate.program.trim().is_empty())
        {
            bail!("tool table contains a candidate without a program: {blank:?}");
        }
        Ok(table)
    }
}
