//! Per-run orchestration
//!
//! Drives one invocation to completion: filter series down to the ones that
//! are due, then per series fetch the feed, evaluate candidates, hand
//! accepted ones to the torrent client and place the finished files. Series
//! are processed in small concurrent chunks so a run with many series stays
//! quick without hammering the feed host. Per-series failures are logged and
//! counted; they never abort the rest of the run.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::task::JoinSet;

use crate::config::{Config, SeriesRule};
use crate::db::{self, history};
use crate::evaluator::{self, Accepted};
use crate::feed::rss;
use crate::library;
use crate::qbt::QbtClient;
use crate::schedule;

/// Series fetched concurrently per chunk. Kept small so a run with many
/// series does not burst-request the tracker and get rate limited.
const SERIES_CHUNK_SIZE: usize = 3;

#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Poll every series regardless of its weekly airtime window.
    pub skip_time_check: bool,
    /// Ignore the per-series starting-episode floor.
    pub skip_start_check: bool,
    /// Evaluate and log, but do not touch the client or the filesystem.
    pub dry_run: bool,
}

#[derive(Debug, Default)]
pub struct RunReport {
    pub downloaded: u32,
    pub failures: u32,
}

/// Runs one full pass over the configured series.
pub async fn run(config: &Config, options: RunOptions) -> Result<RunReport> {
    let client = Arc::new(QbtClient::new(config.client.clone()));
    if !options.dry_run {
        client
            .login()
            .await
            .context("failed to log in to the torrent client")?;
    }

    let now = Utc::now();
    let due: Vec<SeriesRule> = config
        .series
        .iter()
        .filter(|rule| {
            if options.skip_time_check || schedule::is_due(rule, now) {
                true
            } else {
                tracing::info!(series = %rule.id, "outside airtime window, skipping");
                false
            }
        })
        .cloned()
        .collect();

    if due.is_empty() {
        tracing::info!("no series due this run");
        return Ok(RunReport::default());
    }

    let mut report = RunReport::default();
    let chunk_count = due.len().div_ceil(SERIES_CHUNK_SIZE);
    for (idx, chunk) in due.chunks(SERIES_CHUNK_SIZE).enumerate() {
        tracing::info!(
            "processing chunk {}/{chunk_count} ({} series)",
            idx + 1,
            chunk.len()
        );

        let mut tasks = JoinSet::new();
        for rule in chunk {
            let rule = rule.clone();
            let client = Arc::clone(&client);
            tasks.spawn(async move {
                let id = rule.id.clone();
                (id, process_series(rule, client, options).await)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let (id, result) = joined.context("series task panicked")?;
            match result {
                Ok(outcome) => {
                    report.downloaded += outcome.downloaded;
                    report.failures += outcome.failed;
                }
                Err(err) => {
                    tracing::error!(series = %id, "series failed: {err:#}");
                    report.failures += 1;
                }
            }
        }
    }

    tracing::info!(
        "run complete: {} downloaded, {} failed",
        report.downloaded,
        report.failures
    );
    Ok(report)
}

#[derive(Debug, Default)]
struct SeriesOutcome {
    downloaded: u32,
    failed: u32,
}

/// Processes one series: feed -> evaluator -> download -> placement.
///
/// Returns an error only for failures that invalidate the whole series this
/// run (feed fetch/parse, history read). Individual episode failures are
/// counted in the outcome so the remaining episodes still get their chance.
async fn process_series(
    mut rule: SeriesRule,
    client: Arc<QbtClient>,
    options: RunOptions,
) -> Result<SeriesOutcome> {
    tracing::info!(series = %rule.id, "processing");
    if options.skip_start_check {
        rule.start_from = 0;
    }

    let items = rss::fetch_feed(&rule.feed_url)
        .await
        .with_context(|| format!("feed fetch failed for series `{}`", rule.id))?;

    let series_id = rule.id.clone();
    let processed = db::with_db(move |conn| history::processed_set(conn, &series_id)).await?;

    let accepted = evaluator::select_candidates(&items, &rule, Utc::now(), &processed);
    if accepted.is_empty() {
        tracing::info!(series = %rule.id, "no new episodes");
        return Ok(SeriesOutcome::default());
    }
    tracing::info!(series = %rule.id, "found {} new episode(s)", accepted.len());

    let mut outcome = SeriesOutcome::default();
    for candidate in accepted {
        if options.dry_run {
            tracing::info!(
                series = %rule.id,
                "dry run: would download S{:02}E{:02} from {}",
                candidate.season,
                candidate.episode,
                candidate.link
            );
            continue;
        }

        match download_and_place(&rule, &client, &candidate).await {
            Ok(()) => {
                tracing::info!(
                    series = %rule.id,
                    "downloaded S{:02}E{:02}",
                    candidate.season,
                    candidate.episode
                );
                outcome.downloaded += 1;
            }
            Err(err) => {
                // Not recorded as processed, so the episode is retried on
                // the next run.
                tracing::error!(series = %rule.id, title = %candidate.title, "episode failed: {err:#}");
                outcome.failed += 1;
            }
        }
    }
    Ok(outcome)
}

/// Downloads one accepted candidate, places it, then records it as processed.
/// Recording happens strictly after placement so a failed move is retried on
/// the next run.
async fn download_and_place(rule: &SeriesRule, client: &QbtClient, candidate: &Accepted) -> Result<()> {
    // Some feeds link to a web page rather than the .torrent itself; fall
    // back to a magnet built from the info hash in that case.
    let link = if candidate.link.starts_with("magnet:")
        || candidate.link.ends_with(".torrent")
        || candidate.info_hash.is_empty()
    {
        candidate.link.clone()
    } else {
        rss::magnet_link(&candidate.info_hash, &candidate.title)
    };
    let source = client
        .add_and_wait(&candidate.title, &link, &candidate.info_hash)
        .await?;
    library::place(rule, candidate.season, candidate.episode, &source).await?;

    let series_id = rule.id.clone();
    let (season, episode) = (candidate.season, candidate.episode);
    let info_hash = candidate.info_hash.clone();
    let link = candidate.link.clone();
    db::with_db(move |conn| {
        history::record_download(conn, &series_id, season, episode, &info_hash, &link)
    })
    .await?;
    Ok(())
}
