//! The optional per-run stats file written by the crawl subprocess on exit.

use std::path::Path;

use serde::Deserialize;
use tracing::debug;

/// Sibling `stats.json` document. Unknown keys are tolerated here (the file
/// is produced by third-party crawl tooling), missing keys read as `None`.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub(crate) struct CrawlStats {
    #[serde(default)]
    pub item_scraped_count: Option<i64>,
    #[serde(default, rename = "downloader/request_count")]
    pub request_count: Option<i64>,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

impl CrawlStats {
    pub(crate) fn was_cancelled(&self) -> bool {
        self.finish_reason.as_deref() == Some("cancelled")
    }
}

/// Path of the stats file next to a run's output file.
pub(crate) fn stats_path(output_path: &Path) -> std::path::PathBuf {
    output_path.with_file_name("stats.json")
}

/// Best-effort read; an absent or unparsable file is simply no evidence.
pub(crate) async fn read_stats(path: &Path) -> Option<CrawlStats> {
    let raw = tokio::fs::read_to_string(path).await.ok()?;
    match serde_json::from_str(&raw) {
        Ok(stats) => Some(stats),
        Err(err) => {
            debug!(path = %path.display(), error = %err, "unparsable stats file");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reads_known_keys_and_ignores_the_rest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stats.json");
        std::fs::write(
            &path,
            r#"{
                "item_scraped_count": 42,
                "downloader/request_count": 133,
                "downloader/response_count": 130,
                "finish_reason": "finished"
            }"#,
        )
        .unwrap();

        let stats = read_stats(&path).await.unwrap();
        assert_eq!(stats.item_scraped_count, Some(42));
        assert_eq!(stats.request_count, Some(133));
        assert!(!stats.was_cancelled());
    }

    #[tokio::test]
    async fn missing_or_bad_files_are_no_evidence() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(read_stats(&dir.path().join("none.json")).await, None);

        let path = dir.path().join("bad.json");
        std::fs::write(&path, "not json").unwrap();
        assert_eq!(read_stats(&path).await, None);
    }
}
