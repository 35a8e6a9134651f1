//! YAML configuration loading and validation
//!
//! The config file is read once at startup into an immutable [`Config`] that
//! gets passed explicitly to everything else. Validation happens here so that
//! a bad episode regex fails loudly at load time instead of silently matching
//! nothing per feed item.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, FixedOffset};
use regex::Regex;
use reqwest::Url;
use serde::Deserialize;
use thiserror::Error;

const DEFAULT_GRACE_MINUTES: i64 = 120;
const DEFAULT_DOWNLOAD_TIMEOUT_MINUTES: u64 = 60;

/// A series entry that failed validation. The series is skipped for this run;
/// other series are unaffected.
#[derive(Debug, Error)]
#[error("invalid series config at `{path}`: {message}")]
pub struct SeriesConfigError {
    pub path: String,
    pub message: String,
}

impl SeriesConfigError {
    fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// How to resolve multiple feed items that pass every check for the same
/// (season, episode) within one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicatePolicy {
    /// Keep the first matching item in feed order (newest first on Nyaa).
    #[default]
    First,
    /// Keep the last matching item in feed order.
    Last,
}

/// qBittorrent WebUI connection settings.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL without the `/api/v2` suffix, no trailing slash.
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub category: Option<String>,
    /// Wall-clock bound on a single torrent download before giving up for
    /// this run.
    pub download_timeout_minutes: u64,
}

/// Validated per-series rule. Immutable for the run.
#[derive(Debug, Clone)]
pub struct SeriesRule {
    pub id: String,
    /// Display name used for library file naming. Defaults to the id.
    pub name: String,
    pub feed_url: String,
    /// Must contain a named `episode` group; `season` group is optional.
    pub pattern: Regex,
    pub target_dir: PathBuf,
    /// Fallback season when the pattern has no `season` capture.
    pub season: u16,
    /// Keywords that must all appear in the title (case-insensitive).
    pub matches: Vec<String>,
    /// Keywords that must not appear in the title (case-insensitive).
    pub ignore_matches: Vec<String>,
    /// Nominal air instant. `None` disables all time gating for the series.
    pub airtime: Option<DateTime<FixedOffset>>,
    pub grace_minutes: i64,
    /// Episodes below this number are never considered.
    pub start_from: u16,
    pub duplicate_policy: DuplicatePolicy,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub client: ClientConfig,
    /// History database path; falls back to `SERIARR_DB`, then `seriarr.db`.
    pub database: Option<PathBuf>,
    pub series: Vec<SeriesRule>,
}

/// Result of loading a config file: the usable config plus the series entries
/// that were rejected during validation.
#[derive(Debug)]
pub struct LoadedConfig {
    pub config: Config,
    pub rejected: Vec<SeriesConfigError>,
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    client: RawClient,
    #[serde(default)]
    database: Option<PathBuf>,
    #[serde(default)]
    series: Vec<RawSeries>,
}

#[derive(Debug, Deserialize)]
struct RawClient {
    url: String,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    download_timeout_minutes: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawSeries {
    id: String,
    #[serde(default)]
    name: Option<String>,
    rss: String,
    episode_regex: String,
    target_dir: PathBuf,
    #[serde(default)]
    season: Option<u16>,
    #[serde(default)]
    matches: Vec<String>,
    #[serde(default)]
    ignore_matches: Vec<String>,
    #[serde(default)]
    airtime: Option<DateTime<FixedOffset>>,
    #[serde(default)]
    grace_period: Option<i64>,
    #[serde(default)]
    start_from: u16,
    #[serde(default)]
    duplicate_policy: DuplicatePolicy,
}

/// Reads and validates the config file.
///
/// Unreadable file, bad YAML or an invalid client block are fatal. Invalid
/// series entries are collected into [`LoadedConfig::rejected`] instead,
/// so one bad rule cannot take down the rest of the run.
pub fn load(path: &Path) -> Result<LoadedConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let raw: RawConfig = serde_yaml::from_str(&text)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;

    let client = validate_client(raw.client)?;

    let mut series = Vec::with_capacity(raw.series.len());
    let mut rejected = Vec::new();
    let mut seen_ids = HashSet::new();
    for (idx, entry) in raw.series.into_iter().enumerate() {
        match validate_series(idx, entry) {
            Ok(rule) => {
                if !seen_ids.insert(rule.id.clone()) {
                    rejected.push(SeriesConfigError::new(
                        format!("series.{idx}.id"),
                        format!("duplicate series id `{}`", rule.id),
                    ));
                    continue;
                }
                series.push(rule);
            }
            Err(err) => rejected.push(err),
        }
    }

    for err in &rejected {
        tracing::error!("{err}");
    }

    Ok(LoadedConfig {
        config: Config {
            client,
            database: raw.database,
            series,
        },
        rejected,
    })
}

fn validate_client(raw: RawClient) -> Result<ClientConfig> {
    let url = Url::parse(&raw.url)
        .with_context(|| format!("client.url `{}` is not a valid URL", raw.url))?;
    if !matches!(url.scheme(), "http" | "https") {
        anyhow::bail!("client.url `{}` must use http or https", raw.url);
    }
    if url.host_str().is_none() {
        anyhow::bail!("client.url `{}` is missing a host", raw.url);
    }

    Ok(ClientConfig {
        url: raw.url.trim_end_matches('/').to_string(),
        username: raw.username,
        password: raw.password,
        category: raw.category,
        download_timeout_minutes: raw
            .download_timeout_minutes
            .unwrap_or(DEFAULT_DOWNLOAD_TIMEOUT_MINUTES),
    })
}

fn validate_series(idx: usize, raw: RawSeries) -> std::result::Result<SeriesRule, SeriesConfigError> {
    let key = |field: &str| format!("series.{idx}.{field}");

    let id = sanitize_id(&raw.id);
    if id.is_empty() {
        return Err(SeriesConfigError::new(key("id"), "id must not be empty"));
    }
    if id != raw.id {
        tracing::warn!("series id `{}` contains unsafe characters, using `{id}`", raw.id);
    }

    let feed_url = Url::parse(&raw.rss)
        .map_err(|e| SeriesConfigError::new(key("rss"), format!("invalid URL: {e}")))?;
    if !matches!(feed_url.scheme(), "http" | "https") {
        return Err(SeriesConfigError::new(key("rss"), "feed URL must use http or https"));
    }

    // Config files commonly carry the /pattern/ form over from other tools.
    let mut pattern_src = raw.episode_regex.as_str();
    if pattern_src.len() >= 2 && pattern_src.starts_with('/') && pattern_src.ends_with('/') {
        pattern_src = &pattern_src[1..pattern_src.len() - 1];
    }
    let pattern = Regex::new(pattern_src)
        .map_err(|e| SeriesConfigError::new(key("episode_regex"), format!("invalid regex: {e}")))?;
    if !pattern.capture_names().flatten().any(|name| name == "episode") {
        return Err(SeriesConfigError::new(
            key("episode_regex"),
            "regex must contain a named `episode` capture group",
        ));
    }

    if raw.target_dir.as_os_str().is_empty() {
        return Err(SeriesConfigError::new(key("target_dir"), "target_dir must not be empty"));
    }
    if !raw.target_dir.exists() {
        tracing::warn!(
            "target directory {} for series `{id}` does not exist yet",
            raw.target_dir.display()
        );
    }

    let grace_minutes = raw.grace_period.unwrap_or(DEFAULT_GRACE_MINUTES);
    if grace_minutes < 0 {
        return Err(SeriesConfigError::new(
            key("grace_period"),
            "grace period must not be negative",
        ));
    }

    Ok(SeriesRule {
        name: raw.name.unwrap_or_else(|| id.clone()),
        id,
        feed_url: raw.rss,
        pattern,
        target_dir: raw.target_dir,
        season: raw.season.unwrap_or(1),
        matches: raw.matches,
        ignore_matches: raw.ignore_matches,
        airtime: raw.airtime,
        grace_minutes,
        start_from: raw.start_from,
        duplicate_policy: raw.duplicate_policy,
    })
}

/// Series ids end up in log lines and database keys, so anything outside
/// `[A-Za-z0-9_-]` is replaced with an underscore.
fn sanitize_id(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(yaml: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(yaml.as_bytes()).unwrap();
        file
    }

    const VALID: &str = r#"
client:
  url: http://localhost:8080
  username: admin
  password: hunter2
  category: seriarr
series:
  - id: frieren
    name: Frieren
    rss: https://nyaa.si/?page=rss&q=frieren
    episode_regex: "S(?P<season>\\d+)E(?P<episode>\\d+)"
    target_dir: /data/Anime/Frieren
    matches: ["1080p"]
    ignore_matches: ["720p"]
    airtime: 2023-04-06T22:30:00+09:00
    grace_period: 120
    start_from: 2
"#;

    #[test]
    fn loads_valid_config() {
        let file = write_config(VALID);
        let loaded = load(file.path()).unwrap();
        assert!(loaded.rejected.is_empty());

        let config = loaded.config;
        assert_eq!(config.client.url, "http://localhost:8080");
        assert_eq!(config.client.category.as_deref(), Some("seriarr"));
        assert_eq!(config.client.download_timeout_minutes, 60);

        let rule = &config.series[0];
        assert_eq!(rule.id, "frieren");
        assert_eq!(rule.name, "Frieren");
        assert_eq!(rule.season, 1);
        assert_eq!(rule.start_from, 2);
        assert_eq!(rule.grace_minutes, 120);
        assert_eq!(rule.duplicate_policy, DuplicatePolicy::First);
        assert!(rule.pattern.is_match("Frieren S01E05 1080p"));

        let airtime = rule.airtime.unwrap();
        assert_eq!(airtime.offset().local_minus_utc(), 9 * 3600);
    }

    #[test]
    fn regex_without_episode_group_rejects_only_that_series() {
        let yaml = r#"
client:
  url: http://localhost:8080
series:
  - id: broken
    rss: https://nyaa.si/?page=rss&q=broken
    episode_regex: "S\\d+E\\d+"
    target_dir: /data/broken
  - id: fine
    rss: https://nyaa.si/?page=rss&q=fine
    episode_regex: "- (?P<episode>\\d+)"
    target_dir: /data/fine
"#;
        let file = write_config(yaml);
        let loaded = load(file.path()).unwrap();
        assert_eq!(loaded.rejected.len(), 1);
        assert!(loaded.rejected[0].path.contains("series.0.episode_regex"));
        assert_eq!(loaded.config.series.len(), 1);
        assert_eq!(loaded.config.series[0].id, "fine");
    }

    #[test]
    fn invalid_regex_is_a_series_error() {
        let yaml = r#"
client:
  url: http://localhost:8080
series:
  - id: broken
    rss: https://nyaa.si/?page=rss&q=broken
    episode_regex: "(?P<episode>["
    target_dir: /data/broken
"#;
        let file = write_config(yaml);
        let loaded = load(file.path()).unwrap();
        assert_eq!(loaded.rejected.len(), 1);
        assert!(loaded.config.series.is_empty());
    }

    #[test]
    fn slash_delimited_regex_is_unwrapped() {
        let yaml = r#"
client:
  url: http://localhost:8080
series:
  - id: show
    rss: https://nyaa.si/?page=rss&q=show
    episode_regex: "/- (?P<episode>\\d+)/"
    target_dir: /data/show
"#;
        let file = write_config(yaml);
        let loaded = load(file.path()).unwrap();
        assert!(loaded.rejected.is_empty());
        assert!(loaded.config.series[0].pattern.is_match("Show - 03 (1080p)"));
    }

    #[test]
    fn invalid_client_url_is_fatal() {
        let yaml = r#"
client:
  url: "not a url"
series: []
"#;
        let file = write_config(yaml);
        assert!(load(file.path()).is_err());
    }

    #[test]
    fn invalid_yaml_is_fatal() {
        let file = write_config("client: [unclosed");
        assert!(load(file.path()).is_err());
    }

    #[test]
    fn duplicate_ids_reject_the_second_entry() {
        let yaml = r#"
client:
  url: http://localhost:8080
series:
  - id: show
    rss: https://nyaa.si/?page=rss&q=a
    episode_regex: "- (?P<episode>\\d+)"
    target_dir: /data/a
  - id: show
    rss: https://nyaa.si/?page=rss&q=b
    episode_regex: "- (?P<episode>\\d+)"
    target_dir: /data/b
"#;
        let file = write_config(yaml);
        let loaded = load(file.path()).unwrap();
        assert_eq!(loaded.config.series.len(), 1);
        assert_eq!(loaded.rejected.len(), 1);
    }

    #[test]
    fn unsafe_id_is_sanitized() {
        assert_eq!(sanitize_id("My Show! (2024)"), "My_Show___2024_");
        assert_eq!(sanitize_id("ok_id-1"), "ok_id-1");
    }
}
