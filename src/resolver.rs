use serde::Deserialize;
use serenity::async_trait;
use songbird::input::Input;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::ResolveError;
use crate::models::{OpenedStream, SearchResult};

/// Turns free text into playable tracks.
#[async_trait]
pub trait TrackResolver: Send + Sync + 'static {
    type Stream: Send + 'static;

    /// Returns up to `limit` candidates; an empty list means no match.
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchResult>, ResolveError>;

    async fn open_stream(&self, url: &str) -> Result<OpenedStream<Self::Stream>, ResolveError>;
}

/// One line of `yt-dlp -j --flat-playlist` output. Search entries carry the
/// watch page in `url`, a direct link resolves to the full video info where
/// `url` is the media file and `webpage_url` the page.
#[derive(Deserialize)]
struct YtDlpEntry {
    title: Option<String>,
    url: Option<String>,
    webpage_url: Option<String>,
}

/// Resolver backed by the `yt-dlp` executable and songbird's ytdl input.
#[derive(Clone, Debug, Default)]
pub struct YtDlpResolver;

impl YtDlpResolver {
    fn search_target(query: &str, limit: usize) -> String {
        if query.starts_with("http://") || query.starts_with("https://") {
            query.to_string()
        } else {
            format!("ytsearch{limit}:{query}")
        }
    }
}

#[async_trait]
impl TrackResolver for YtDlpResolver {
    type Stream = Input;

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchResult>, ResolveError> {
        let target = Self::search_target(query, limit);

        info!("Searching for {target}");

        let output = Command::new("yt-dlp")
            .arg("-j")
            .arg("--flat-playlist")
            .arg("--no-warnings")
            .arg(&target)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|why| ResolveError::Search(format!("yt-dlp failed to start: {why}")))?;

        let stdout = String::from_utf8_lossy(&output.stdout);

        if !output.status.success() && stdout.trim().is_empty() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!("yt-dlp exited with {}: {}", output.status, stderr.trim());

            return Err(ResolveError::Search(stderr.trim().to_string()));
        }

        Ok(parse_search_output(&stdout, limit))
    }

    async fn open_stream(&self, url: &str) -> Result<OpenedStream<Input>, ResolveError> {
        let input = songbird::ytdl(url)
            .await
            .map_err(|why| ResolveError::Stream(why.to_string()))?;

        let format = format!("{:?}/{:?}", input.container, input.kind);

        debug!("Opened stream for {url} as {format}");

        Ok(OpenedStream { stream: input, format })
    }
}

/// Parses newline separated yt-dlp JSON records, skipping lines that are not
/// usable entries.
pub fn parse_search_output(output: &str, limit: usize) -> Vec<SearchResult> {
    let lines: Vec<&str> = output.lines().filter(|line| !line.trim().is_empty()).collect();

    let results: Vec<SearchResult> = lines
        .iter()
        .filter_map(|line| {
            let entry: YtDlpEntry = serde_json::from_str(line).ok()?;
            let url = entry.webpage_url.or(entry.url)?;
            let title = entry.title.unwrap_or_else(|| url.clone());

            Some(SearchResult { title, url })
        })
        .take(limit)
        .collect();

    if results.len() < lines.len().min(limit) {
        debug!("Some search entries were skipped due to errors during parsing");
    }

    results
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_becomes_a_youtube_search() {
        assert_eq!(YtDlpResolver::search_target("never gonna give you up", 1), "ytsearch1:never gonna give you up");
        assert_eq!(
            YtDlpResolver::search_target("https://www.youtube.com/watch?v=dQw4w9WgXcQ", 1),
            "https://www.youtube.com/watch?v=dQw4w9WgXcQ"
        );
    }

    #[test]
    fn parses_flat_search_entries() {
        let output = r#"{"_type": "url", "id": "dQw4w9WgXcQ", "url": "https://www.youtube.com/watch?v=dQw4w9WgXcQ", "title": "Never Gonna Give You Up"}
{"_type": "url", "id": "yPYZpwSpKmA", "url": "https://www.youtube.com/watch?v=yPYZpwSpKmA", "title": "Together Forever"}
"#;

        let results = parse_search_output(output, 5);

        assert_eq!(
            results,
            vec![
                SearchResult {
                    title: "Never Gonna Give You Up".to_string(),
                    url: "https://www.youtube.com/watch?v=dQw4w9WgXcQ".to_string(),
                },
                SearchResult {
                    title: "Together Forever".to_string(),
                    url: "https://www.youtube.com/watch?v=yPYZpwSpKmA".to_string(),
                },
            ]
        );
    }

    #[test]
    fn prefers_the_page_url_over_the_media_url() {
        let output = r#"{"title": "Song", "url": "https://rr1.googlevideo.com/videoplayback?x=1", "webpage_url": "https://www.youtube.com/watch?v=abc"}"#;

        let results = parse_search_output(output, 1);

        assert_eq!(results[0].url, "https://www.youtube.com/watch?v=abc");
    }

    #[test]
    fn skips_garbage_and_respects_the_limit() {
        let output = "not json\n{\"title\": \"no url\"}\n{\"title\": \"a\", \"url\": \"u1\"}\n{\"title\": \"b\", \"url\": \"u2\"}";

        let results = parse_search_output(output, 1);

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].title, "a");
        assert!(parse_search_output("", 1).is_empty());
    }
}
