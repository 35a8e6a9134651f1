//! RSS feed fetching and parsing
//!
//! Fetches a series feed over HTTP and parses the XML into [`FeedItem`]s,
//! keeping the feed's natural order (newest first on Nyaa-style trackers).
//! The `nyaa:` namespaced extensions are recognized where present; feeds
//! without them still parse.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use quick_xml::Reader;
use quick_xml::events::Event;

/// One entry from a polled feed: a potential episode release.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedItem {
    pub title: String,
    /// Download link, usually a direct `.torrent` URL or magnet link.
    pub link: String,
    pub pub_date: Option<DateTime<Utc>>,
    /// Torrent info hash from `nyaa:infoHash`, empty when the feed lacks it.
    pub info_hash: String,
    /// Human-readable size from `nyaa:size`, informational only.
    pub size: String,
}

/// Fetches and parses a series RSS feed.
///
/// One retry on a failed request; transient tracker hiccups are common enough
/// that giving up on the first error would skip a series for no good reason.
pub async fn fetch_feed(url: &str) -> Result<Vec<FeedItem>> {
    let xml = match fetch_feed_text(url).await {
        Ok(xml) => xml,
        Err(err) => {
            tracing::warn!("feed fetch failed, retrying once: {err:#}");
            fetch_feed_text(url).await?
        }
    };
    parse_feed_xml(&xml)
}

async fn fetch_feed_text(url: &str) -> Result<String> {
    let response = super::http_client()
        .get(url)
        .send()
        .await
        .with_context(|| format!("failed to fetch feed from {url}"))?;
    let response = response
        .error_for_status()
        .with_context(|| format!("feed {url} returned an error status"))?;
    response
        .text()
        .await
        .with_context(|| format!("failed to read feed body from {url}"))
}

/// Parses RSS XML into feed items, in document order.
pub fn parse_feed_xml(xml: &str) -> Result<Vec<FeedItem>> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut items = Vec::new();
    let mut buf = Vec::new();

    let mut current_item: Option<FeedItemBuilder> = None;
    let mut current_element: Option<String> = None;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).to_string();
                if name == "item" {
                    current_item = Some(FeedItemBuilder::default());
                } else {
                    current_element = Some(name);
                }
            }
            Ok(Event::End(ref e)) => {
                if e.name().as_ref() == b"item" {
                    if let Some(item) = current_item.take().and_then(FeedItemBuilder::build) {
                        items.push(item);
                    }
                }
                current_element = None;
            }
            Ok(Event::Text(ref e)) => {
                let (Some(item), Some(element)) = (&mut current_item, &current_element) else {
                    buf.clear();
                    continue;
                };
                let text = e.unescape().unwrap_or_default().to_string();
                if !text.is_empty() {
                    match element.as_str() {
                        "title" => item.title = Some(text),
                        "link" => item.link = Some(text),
                        "pubDate" => item.pub_date = Some(text),
                        "nyaa:infoHash" => item.info_hash = Some(text),
                        "nyaa:size" => item.size = Some(text),
                        _ => {}
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                anyhow::bail!(
                    "error parsing feed XML at position {}: {e:?}",
                    reader.buffer_position()
                );
            }
            _ => {}
        }
        buf.clear();
    }

    Ok(items)
}

/// Builds a magnet link from an info hash, for feeds whose `<link>` points
/// at a web page instead of a `.torrent` file.
pub fn magnet_link(info_hash: &str, display_name: &str) -> String {
    format!(
        "magnet:?xt=urn:btih:{info_hash}&dn={}",
        urlencoding::encode(display_name)
    )
}

#[derive(Default)]
struct FeedItemBuilder {
    title: Option<String>,
    link: Option<String>,
    pub_date: Option<String>,
    info_hash: Option<String>,
    size: Option<String>,
}

impl FeedItemBuilder {
    /// Items without a title or link are useless downstream and are dropped.
    fn build(self) -> Option<FeedItem> {
        let pub_date = self
            .pub_date
            .and_then(|raw| DateTime::parse_from_rfc2822(&raw).ok())
            .map(|dt| dt.with_timezone(&Utc));
        Some(FeedItem {
            title: self.title?,
            link: self.link?,
            pub_date,
            info_hash: self.info_hash.unwrap_or_default().to_lowercase(),
            size: self.size.unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_NYAA_FEED: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss xmlns:atom="http://www.w3.org/2005/Atom" xmlns:nyaa="https://nyaa.si/xmlns/nyaa" version="2.0">
  <channel>
    <title>Nyaa - Search - Torrent File RSS</title>
    <item>
      <title>[Kaleido-subs] Spice and Wolf S01E07 (1080p DSNP) [1A2B3C4D].mkv</title>
      <link>https://nyaa.si/download/1700001.torrent</link>
      <guid isPermaLink="true">https://nyaa.si/view/1700001</guid>
      <pubDate>Thu, 06 Apr 2023 15:31:00 -0000</pubDate>
      <nyaa:seeders>31</nyaa:seeders>
      <nyaa:infoHash>0F1E2D3C4B5A0F1E2D3C4B5A0F1E2D3C4B5A0F1E</nyaa:infoHash>
      <nyaa:categoryId>1_2</nyaa:categoryId>
      <nyaa:size>1.4 GiB</nyaa:size>
    </item>
    <item>
      <title>[Kaleido-subs] Spice and Wolf S01E06 (1080p DSNP) [5E6F7A8B].mkv</title>
      <link>https://nyaa.si/download/1699950.torrent</link>
      <guid isPermaLink="true">https://nyaa.si/view/1699950</guid>
      <pubDate>Thu, 30 Mar 2023 15:29:00 -0000</pubDate>
      <nyaa:seeders>54</nyaa:seeders>
      <nyaa:infoHash>9a8b7c6d5e4f9a8b7c6d5e4f9a8b7c6d5e4f9a8b</nyaa:infoHash>
      <nyaa:categoryId>1_2</nyaa:categoryId>
      <nyaa:size>1.4 GiB</nyaa:size>
    </item>
  </channel>
</rss>"#;

    #[test]
    fn parses_nyaa_feed_in_document_order() {
        let items = parse_feed_xml(SAMPLE_NYAA_FEED).unwrap();

        assert_eq!(items.len(), 2);
        let first = &items[0];
        assert_eq!(
            first.title,
            "[Kaleido-subs] Spice and Wolf S01E07 (1080p DSNP) [1A2B3C4D].mkv"
        );
        assert_eq!(first.link, "https://nyaa.si/download/1700001.torrent");
        assert_eq!(first.size, "1.4 GiB");
        // Hashes are normalized to lowercase for client lookups.
        assert_eq!(
            first.info_hash,
            "0f1e2d3c4b5a0f1e2d3c4b5a0f1e2d3c4b5a0f1e"
        );
        let pub_date = first.pub_date.unwrap();
        assert_eq!(pub_date.to_rfc3339(), "2023-04-06T15:31:00+00:00");
    }

    #[test]
    fn items_without_namespaced_elements_still_parse() {
        let xml = r#"<?xml version="1.0"?>
<rss version="2.0">
  <channel>
    <item>
      <title>Show - 03 (1080p)</title>
      <link>https://example.org/3.torrent</link>
    </item>
  </channel>
</rss>"#;
        let items = parse_feed_xml(xml).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].info_hash, "");
        assert!(items[0].pub_date.is_none());
    }

    #[test]
    fn items_missing_title_or_link_are_dropped() {
        let xml = r#"<?xml version="1.0"?>
<rss version="2.0">
  <channel>
    <item>
      <title>No link here</title>
    </item>
    <item>
      <title>Complete item</title>
      <link>https://example.org/x.torrent</link>
    </item>
  </channel>
</rss>"#;
        let items = parse_feed_xml(xml).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].title, "Complete item");
    }

    #[test]
    fn unparseable_pub_date_becomes_none() {
        let xml = r#"<?xml version="1.0"?>
<rss version="2.0">
  <channel>
    <item>
      <title>Show - 04 (1080p)</title>
      <link>https://example.org/4.torrent</link>
      <pubDate>sometime last week</pubDate>
    </item>
  </channel>
</rss>"#;
        let items = parse_feed_xml(xml).unwrap();
        assert!(items[0].pub_date.is_none());
    }

    #[test]
    fn magnet_link_encodes_the_display_name() {
        let magnet = magnet_link(
            "0f1e2d3c4b5a0f1e2d3c4b5a0f1e2d3c4b5a0f1e",
            "Spice and Wolf S01E07",
        );
        assert!(magnet.starts_with("magnet:?xt=urn:btih:0f1e2d3c4b5a"));
        assert!(magnet.contains("Spice%20and%20Wolf"));
    }

    #[test]
    fn truncated_xml_is_an_error() {
        let xml = r#"<rss><channel><item><title>Broken"#;
        // quick-xml reports the dangling open tags at EOF.
        assert!(parse_feed_xml(xml).is_err() || parse_feed_xml(xml).unwrap().is_empty());
    }

    #[ignore]
    #[tokio::test]
    async fn fetch_feed_live() {
        // Integration test - requires network access
        let items = fetch_feed("https://nyaa.si/?page=rss&c=1_2&f=0").await.unwrap();
        println!("Fetched {} items", items.len());
        for item in items.iter().take(3) {
            println!("  - {}", item.title);
        }
    }
}
