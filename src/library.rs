//! Library placement
//!
//! Moves a finished download into the media-server layout:
//! `<target_dir>/Season <NN>/<Series> S<NN>E<NN>.<ext>`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::config::SeriesRule;

/// Builds the destination path for an episode. Season and episode numbers are
/// zero-padded to at least two digits; long-running shows can exceed that
/// (`E1060` stays `E1060`). The extension is carried over from the download.
pub fn destination_path(rule: &SeriesRule, season: u16, episode: u16, extension: Option<&str>) -> PathBuf {
    let mut file_name = format!("{} S{season:02}E{episode:02}", rule.name);
    if let Some(ext) = extension {
        file_name.push('.');
        file_name.push_str(ext);
    }
    rule.target_dir
        .join(format!("Season {season:02}"))
        .join(file_name)
}

/// Moves the downloaded file into the library, creating the season directory
/// as needed. Falls back to copy + remove when the rename crosses
/// filesystems, which is the usual situation with a download volume separate
/// from the library volume.
pub async fn place(rule: &SeriesRule, season: u16, episode: u16, source: &Path) -> Result<PathBuf> {
    let extension = source.extension().and_then(|e| e.to_str());
    let target = destination_path(rule, season, episode, extension);

    let parent = target
        .parent()
        .context("destination path has no parent directory")?;
    tokio::fs::create_dir_all(parent)
        .await
        .with_context(|| format!("failed to create {}", parent.display()))?;

    tracing::info!("moving {} to {}", source.display(), target.display());
    if let Err(rename_err) = tokio::fs::rename(source, &target).await {
        tracing::debug!("rename failed ({rename_err}), copying instead");
        tokio::fs::copy(source, &target)
            .await
            .with_context(|| format!("failed to copy {} to {}", source.display(), target.display()))?;
        tokio::fs::remove_file(source)
            .await
            .with_context(|| format!("failed to remove {} after copy", source.display()))?;
    }
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DuplicatePolicy;
    use regex::Regex;

    fn rule(target_dir: &Path) -> SeriesRule {
        SeriesRule {
            id: "spice-and-wolf".to_string(),
            name: "Spice and Wolf".to_string(),
            feed_url: "https://nyaa.si/?page=rss&q=spice".to_string(),
            pattern: Regex::new(r"E(?P<episode>\d+)").unwrap(),
            target_dir: target_dir.to_path_buf(),
            season: 1,
            matches: vec![],
            ignore_matches: vec![],
            airtime: None,
            grace_minutes: 120,
            start_from: 0,
            duplicate_policy: DuplicatePolicy::First,
        }
    }

    #[test]
    fn destination_uses_media_server_layout() {
        let r = rule(Path::new("/data/Anime/Spice and Wolf"));
        let path = destination_path(&r, 1, 7, Some("mkv"));
        assert_eq!(
            path,
            Path::new("/data/Anime/Spice and Wolf/Season 01/Spice and Wolf S01E07.mkv")
        );
    }

    #[test]
    fn destination_without_extension() {
        let r = rule(Path::new("/data/Show"));
        let path = destination_path(&r, 2, 3, None);
        assert_eq!(path, Path::new("/data/Show/Season 02/Spice and Wolf S02E03"));
    }

    #[test]
    fn long_episode_numbers_are_not_truncated() {
        let r = rule(Path::new("/data/Show"));
        let path = destination_path(&r, 1, 1060, Some("mkv"));
        assert!(path.ends_with("Season 01/Spice and Wolf S01E1060.mkv"));
    }

    #[tokio::test]
    async fn place_moves_file_and_creates_season_dir() {
        let dir = tempfile::tempdir().unwrap();
        let library = dir.path().join("library");
        let source = dir.path().join("download.mkv");
        tokio::fs::write(&source, b"payload").await.unwrap();

        let r = rule(&library);
        let target = place(&r, 1, 7, &source).await.unwrap();

        assert_eq!(
            target,
            library.join("Season 01").join("Spice and Wolf S01E07.mkv")
        );
        assert!(!source.exists());
        let moved = tokio::fs::read(&target).await.unwrap();
        assert_eq!(moved, b"payload");
    }

    #[tokio::test]
    async fn place_fails_when_source_is_missing() {
        let dir = tempfile::tempdir().unwrap();
        let r = rule(dir.path());
        let missing = dir.path().join("nope.mkv");
        assert!(place(&r, 1, 1, &missing).await.is_err());
    }
}
