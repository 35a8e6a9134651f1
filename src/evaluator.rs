//! Candidate evaluation: decides which feed items become downloads
//!
//! This is the decision core of the tool. Everything here is pure computation
//! over the inputs — feed item, series rule, current time and the set of
//! episodes already downloaded — so the whole policy is testable without any
//! network or database.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration, FixedOffset, Utc};

use crate::config::{DuplicatePolicy, SeriesRule};
use crate::feed::rss::FeedItem;

/// Episodes already downloaded for a series, keyed by (season, episode).
pub type ProcessedSet = HashSet<(u16, u16)>;

/// A feed item that passed every check.
#[derive(Debug, Clone, PartialEq)]
pub struct Accepted {
    pub season: u16,
    pub episode: u16,
    pub title: String,
    pub link: String,
    pub info_hash: String,
}

/// Why a feed item was not accepted. None of these are errors; they are the
/// normal outcome for most items in a feed.
#[derive(Debug, Clone, PartialEq)]
pub enum Rejection {
    /// The episode pattern did not match the title.
    NoMatch,
    /// Extracted episode number is below the rule's starting episode.
    BelowStart { episode: u16 },
    /// Episode already downloaded in a previous run.
    AlreadyDownloaded { season: u16, episode: u16 },
    /// An excluded keyword is present in the title.
    Excluded { keyword: String },
    /// A required keyword is missing from the title.
    MissingRequired { keyword: String },
    /// The episode is not expected to be available yet.
    NotYetAvailable { available_at: DateTime<FixedOffset> },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Evaluation {
    Accepted(Accepted),
    Rejected(Rejection),
}

/// Evaluates a single feed item against a series rule.
///
/// Check order: pattern match, episode floor, de-duplication, excluded
/// keywords, required keywords, availability gate. Exclusion wins over any
/// required-keyword match. The availability instant is `airtime + grace`;
/// items are rejected before it so that mislabeled or fake early uploads are
/// not grabbed ahead of the real release.
pub fn evaluate(
    item: &FeedItem,
    rule: &SeriesRule,
    now: DateTime<Utc>,
    processed: &ProcessedSet,
) -> Evaluation {
    let Some(captures) = rule.pattern.captures(&item.title) else {
        return Evaluation::Rejected(Rejection::NoMatch);
    };
    let Some(episode) = captures
        .name("episode")
        .and_then(|m| m.as_str().parse::<u16>().ok())
    else {
        return Evaluation::Rejected(Rejection::NoMatch);
    };
    let season = captures
        .name("season")
        .and_then(|m| m.as_str().parse::<u16>().ok())
        .unwrap_or(rule.season);

    if episode < rule.start_from {
        return Evaluation::Rejected(Rejection::BelowStart { episode });
    }
    if processed.contains(&(season, episode)) {
        return Evaluation::Rejected(Rejection::AlreadyDownloaded { season, episode });
    }

    let title_folded = item.title.to_lowercase();
    for keyword in &rule.ignore_matches {
        if title_folded.contains(&keyword.to_lowercase()) {
            return Evaluation::Rejected(Rejection::Excluded {
                keyword: keyword.clone(),
            });
        }
    }
    for keyword in &rule.matches {
        if !title_folded.contains(&keyword.to_lowercase()) {
            return Evaluation::Rejected(Rejection::MissingRequired {
                keyword: keyword.clone(),
            });
        }
    }

    if let Some(airtime) = rule.airtime {
        let available_at = airtime + Duration::minutes(rule.grace_minutes);
        if now < available_at {
            return Evaluation::Rejected(Rejection::NotYetAvailable { available_at });
        }
    }

    Evaluation::Accepted(Accepted {
        season,
        episode,
        title: item.title.clone(),
        link: item.link.clone(),
        info_hash: item.info_hash.clone(),
    })
}

/// Evaluates a whole feed and picks at most one candidate per
/// (season, episode).
///
/// Items are visited in feed order (newest first on typical RSS feeds). With
/// [`DuplicatePolicy::First`] the first item to pass wins; with
/// [`DuplicatePolicy::Last`] a later passing item replaces the earlier one.
/// Either way the result is deterministic for a given feed.
pub fn select_candidates(
    items: &[FeedItem],
    rule: &SeriesRule,
    now: DateTime<Utc>,
    processed: &ProcessedSet,
) -> Vec<Accepted> {
    let mut chosen: Vec<Accepted> = Vec::new();
    let mut by_episode: HashMap<(u16, u16), usize> = HashMap::new();

    for item in items {
        let accepted = match evaluate(item, rule, now, processed) {
            Evaluation::Accepted(accepted) => accepted,
            Evaluation::Rejected(reason) => {
                tracing::debug!(series = %rule.id, title = %item.title, ?reason, "rejected");
                continue;
            }
        };

        match by_episode.entry((accepted.season, accepted.episode)) {
            Entry::Vacant(slot) => {
                slot.insert(chosen.len());
                chosen.push(accepted);
            }
            Entry::Occupied(slot) => match rule.duplicate_policy {
                DuplicatePolicy::First => {
                    tracing::debug!(
                        series = %rule.id,
                        title = %accepted.title,
                        "duplicate release for S{:02}E{:02}, keeping earlier item",
                        accepted.season,
                        accepted.episode
                    );
                }
                DuplicatePolicy::Last => {
                    chosen[*slot.get()] = accepted;
                }
            },
        }
    }

    chosen
}
