//! Processed-record store
//!
//! The only state that survives between runs: which (season, episode) pairs
//! have already been downloaded per series. Read at the start of a series'
//! processing, appended to after each successful placement. The UNIQUE
//! constraint backs the in-memory duplicate check, so even a racing second
//! invocation cannot record the same episode twice.

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params};

use crate::evaluator::ProcessedSet;

/// Creates the schema if it does not exist yet.
pub fn init_database(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS download_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            series_id TEXT NOT NULL,
            season INTEGER NOT NULL,
            episode INTEGER NOT NULL,
            info_hash TEXT,
            torrent_url TEXT,
            downloaded_at TEXT DEFAULT (datetime('now')),
            UNIQUE(series_id, season, episode)
        )",
        [],
    )
    .context("failed to create download_history table")?;
    Ok(())
}

/// Loads the set of episodes already downloaded for a series.
pub fn processed_set(conn: &Connection, series_id: &str) -> Result<ProcessedSet> {
    let mut stmt = conn
        .prepare("SELECT season, episode FROM download_history WHERE series_id = ?1")
        .context("failed to prepare processed_set query")?;

    let set = stmt
        .query_map([series_id], |row| {
            Ok((row.get::<_, i64>(0)? as u16, row.get::<_, i64>(1)? as u16))
        })
        .context("failed to execute processed_set query")?
        .collect::<std::result::Result<ProcessedSet, _>>()
        .context("failed to collect processed episodes")?;

    Ok(set)
}

/// Records a successfully placed episode.
pub fn record_download(
    conn: &Connection,
    series_id: &str,
    season: u16,
    episode: u16,
    info_hash: &str,
    torrent_url: &str,
) -> Result<()> {
    conn.execute(
        "INSERT INTO download_history (series_id, season, episode, info_hash, torrent_url)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![series_id, season as i64, episode as i64, info_hash, torrent_url],
    )
    .context("failed to record download")?;
    Ok(())
}

/// True when the episode is already recorded. Used by tests and available for
/// ad-hoc checks; the evaluator works from the full [`processed_set`].
pub fn is_downloaded(conn: &Connection, series_id: &str, season: u16, episode: u16) -> Result<bool> {
    let exists: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM download_history
             WHERE series_id = ?1 AND season = ?2 AND episode = ?3 LIMIT 1",
            params![series_id, season as i64, episode as i64],
            |row| row.get(0),
        )
        .optional()
        .context("failed to check download_history")?;
    Ok(exists.is_some())
}
