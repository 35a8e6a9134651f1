//! qBittorrent WebUI v2 API client
//!
//! Covers the handful of endpoints the run needs: login, add-by-URL, info
//! lookup by hash, file listing and removal. [`QbtClient::add_and_wait`]
//! drives a whole download: submit, poll until the client reports completion,
//! then hand back the finished file's path.

use std::path::PathBuf;
use std::time::Duration;

use reqwest::RequestBuilder;
use reqwest::header::COOKIE;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::time::{Instant, sleep};

use crate::config::ClientConfig;
use crate::feed::http_client;

const POLL_INTERVAL: Duration = Duration::from_secs(5);
/// Consecutive polls a torrent may be absent from the client before it is
/// treated as gone (deleted out from under us, or rejected after add).
const MISSING_POLL_LIMIT: u32 = 5;

#[derive(Debug, Error)]
pub enum QbtError {
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },
    #[error("invalid torrent: {0}")]
    InvalidTorrent(String),
    #[error("torrent `{name}` contains {count} files, expected exactly one")]
    TooManyFiles { name: String, count: usize },
    #[error("torrent disappeared from the client: {0}")]
    Vanished(String),
    #[error("torrent errored in the client: {0}")]
    Errored(String),
    #[error("torrent `{name}` did not complete within {minutes} minutes")]
    Timeout { name: String, minutes: u64 },
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

pub type Result<T> = std::result::Result<T, QbtError>;

/// One torrent as reported by `/torrents/info`.
#[derive(Debug, Clone, Deserialize)]
pub struct TorrentInfo {
    pub hash: String,
    pub name: String,
    pub state: String,
    pub save_path: String,
}

impl TorrentInfo {
    /// Seeding, stalled-up and similar states all mean the payload is on disk.
    pub fn is_complete(&self) -> bool {
        matches!(
            self.state.as_str(),
            "uploading"
                | "stalledUP"
                | "queuedUP"
                | "forcedUP"
                | "checkingUP"
                | "pausedUP"
                | "stoppedUP"
        )
    }

    pub fn is_errored(&self) -> bool {
        matches!(self.state.as_str(), "error" | "missingFiles")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TorrentFile {
    pub name: String,
}

pub struct QbtClient {
    config: ClientConfig,
    sid: RwLock<Option<String>>,
}

impl QbtClient {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            sid: RwLock::new(None),
        }
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}/api/v2{path}", self.config.url)
    }

    async fn with_sid(&self, request: RequestBuilder) -> RequestBuilder {
        match self.sid.read().await.as_deref() {
            Some(sid) => request.header(COOKIE, format!("SID={sid}")),
            None => request,
        }
    }

    /// Logs in to the WebUI and stores the session cookie.
    ///
    /// Skipped when no username is configured; qBittorrent can be set up to
    /// bypass authentication for local clients.
    pub async fn login(&self) -> Result<()> {
        let Some(username) = self.config.username.as_deref() else {
            tracing::debug!("no client credentials configured, skipping login");
            return Ok(());
        };
        let password = self.config.password.as_deref().unwrap_or_default();

        let response = http_client()
            .post(self.api_url("/auth/login"))
            .form(&[("username", username), ("password", password)])
            .send()
            .await?;
        let status = response.status();

        if let Some(cookie) = response.headers().get(reqwest::header::SET_COOKIE) {
            if let Some(sid) = cookie
                .to_str()
                .ok()
                .and_then(|c| c.split(';').next())
                .and_then(|c| c.strip_prefix("SID="))
            {
                *self.sid.write().await = Some(sid.to_string());
            }
        }

        let body = response.text().await.unwrap_or_default();
        if status.is_success() && body == "Ok." {
            tracing::debug!("logged in to qBittorrent");
            Ok(())
        } else if body == "Fails." {
            Err(QbtError::Auth("invalid username or password".into()))
        } else {
            Err(QbtError::Auth(format!("login failed: {} - {body}", status.as_u16())))
        }
    }

    /// Submits a torrent or magnet URL.
    /// POST /api/v2/torrents/add
    pub async fn add_torrent(&self, url: &str) -> Result<()> {
        let mut form = vec![("urls".to_string(), url.to_string())];
        if let Some(category) = &self.config.category {
            form.push(("category".to_string(), category.clone()));
        }

        let request = http_client().post(self.api_url("/torrents/add")).form(&form);
        let response = self.with_sid(request).await.send().await?;

        let status = response.status();
        if status.as_u16() == 415 {
            return Err(QbtError::InvalidTorrent(format!("client rejected URL {url}")));
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(QbtError::Api {
                status: status.as_u16(),
                message,
            });
        }
        Ok(())
    }

    /// Looks up a single torrent by info hash.
    /// GET /api/v2/torrents/info
    pub async fn torrent_info(&self, hash: &str) -> Result<Option<TorrentInfo>> {
        let request = http_client()
            .get(self.api_url("/torrents/info"))
            .query(&[("hashes", hash)]);
        let response = self.with_sid(request).await.send().await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(QbtError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let torrents = response.json::<Vec<TorrentInfo>>().await?;
        Ok(torrents
            .into_iter()
            .find(|t| t.hash.eq_ignore_ascii_case(hash)))
    }

    /// GET /api/v2/torrents/files
    pub async fn torrent_files(&self, hash: &str) -> Result<Vec<TorrentFile>> {
        let request = http_client()
            .get(self.api_url("/torrents/files"))
            .query(&[("hash", hash)]);
        let response = self.with_sid(request).await.send().await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(QbtError::Api {
                status: status.as_u16(),
                message,
            });
        }
        Ok(response.json::<Vec<TorrentFile>>().await?)
    }

    /// Removes the torrent entry from the client.
    /// POST /api/v2/torrents/delete
    pub async fn delete_torrent(&self, hash: &str, delete_files: bool) -> Result<()> {
        let request = http_client().post(self.api_url("/torrents/delete")).form(&[
            ("hashes", hash.to_string()),
            ("deleteFiles", delete_files.to_string()),
        ]);
        let response = self.with_sid(request).await.send().await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(QbtError::Api {
                status: status.as_u16(),
                message,
            });
        }
        Ok(())
    }

    /// Submits a download and polls until the client reports it complete,
    /// returning the path of the finished file.
    ///
    /// The torrent must resolve to exactly one file. On success the torrent
    /// entry is removed (data kept) so the client list stays clean. On
    /// timeout the entry is left in place; the next run will pick the episode
    /// up again since it was never recorded as processed.
    pub async fn add_and_wait(&self, name: &str, link: &str, info_hash: &str) -> Result<PathBuf> {
        if info_hash.is_empty() {
            return Err(QbtError::InvalidTorrent(format!(
                "feed item `{name}` carries no info hash"
            )));
        }

        tracing::info!("adding torrent to client: {name}");
        self.add_torrent(link).await?;

        let minutes = self.config.download_timeout_minutes;
        let deadline = Instant::now() + Duration::from_secs(minutes * 60);
        let mut missing_polls = 0u32;

        loop {
            sleep(POLL_INTERVAL).await;
            if Instant::now() >= deadline {
                return Err(QbtError::Timeout {
                    name: name.to_string(),
                    minutes,
                });
            }

            let Some(info) = self.torrent_info(info_hash).await? else {
                missing_polls += 1;
                if missing_polls > MISSING_POLL_LIMIT {
                    return Err(QbtError::Vanished(name.to_string()));
                }
                continue;
            };
            missing_polls = 0;

            if info.is_errored() {
                return Err(QbtError::Errored(name.to_string()));
            }
            if !info.is_complete() {
                continue;
            }
            tracing::debug!("client reports `{}` complete", info.name);

            let files = self.torrent_files(info_hash).await?;
            if files.len() != 1 {
                // Leave the data alone but drop the entry; a season batch or
                // multi-file release is not something this tool can place.
                self.delete_torrent(info_hash, false).await?;
                return Err(QbtError::TooManyFiles {
                    name: name.to_string(),
                    count: files.len(),
                });
            }
            let path = PathBuf::from(&info.save_path).join(&files[0].name);
            self.delete_torrent(info_hash, false).await?;
            tracing::info!("torrent finished: {name}");
            return Ok(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(state: &str) -> TorrentInfo {
        TorrentInfo {
            hash: "a1b2".to_string(),
            name: "Show S01E05".to_string(),
            state: state.to_string(),
            save_path: "/downloads".to_string(),
        }
    }

    #[test]
    fn seeding_states_count_as_complete() {
        for state in ["uploading", "stalledUP", "queuedUP", "forcedUP", "pausedUP"] {
            assert!(info(state).is_complete(), "{state} should be complete");
        }
    }

    #[test]
    fn downloading_states_are_not_complete() {
        for state in ["downloading", "stalledDL", "metaDL", "queuedDL", "checkingDL"] {
            assert!(!info(state).is_complete(), "{state} should not be complete");
        }
    }

    #[test]
    fn error_states_are_detected() {
        assert!(info("error").is_errored());
        assert!(info("missingFiles").is_errored());
        assert!(!info("downloading").is_errored());
    }

    #[test]
    fn torrent_info_deserializes_from_api_json() {
        let json = r#"[{
            "hash": "0f1e2d3c4b5a0f1e2d3c4b5a0f1e2d3c4b5a0f1e",
            "name": "[Kaleido-subs] Spice and Wolf S01E07 (1080p DSNP).mkv",
            "state": "stalledUP",
            "save_path": "/downloads/seriarr",
            "progress": 1.0,
            "category": "seriarr"
        }]"#;
        let torrents: Vec<TorrentInfo> = serde_json::from_str(json).unwrap();
        assert_eq!(torrents.len(), 1);
        assert!(torrents[0].is_complete());
        assert_eq!(torrents[0].save_path, "/downloads/seriarr");
    }

    #[test]
    fn api_url_joins_base_and_path() {
        let client = QbtClient::new(ClientConfig {
            url: "http://localhost:8080".to_string(),
            username: None,
            password: None,
            category: None,
            download_timeout_minutes: 60,
        });
        assert_eq!(
            client.api_url("/torrents/add"),
            "http://localhost:8080/api/v2/torrents/add"
        );
    }
}
