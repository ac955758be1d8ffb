use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

use super::error::{DownloadError, DownloadResult};
use crate::config::{DownloadSection, ToolsSection};
use crate::media::{classify, AssetKind};
use crate::process::{
    terminate_by_name, tool_name, CommandExecutor, CommandOutput, ProcessError,
    SystemCommandExecutor,
};

pub const UNKNOWN_SERIES: &str = "Unknown Series";

/// Fields of the extractor's JSON metadata that the pipeline reads.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RemoteVideo {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub series: Option<String>,
    #[serde(default)]
    pub episode_number: Option<u32>,
    #[serde(default)]
    pub episode: Option<String>,
    #[serde(default)]
    pub formats: Vec<RemoteFormat>,
    #[serde(default)]
    pub subtitles: HashMap<String, Value>,
    #[serde(default)]
    pub automatic_captions: HashMap<String, Value>,
}

impl RemoteVideo {
    pub fn title(&self) -> &str {
        self.title.as_deref().unwrap_or("Unknown title")
    }

    pub fn series_name(&self) -> &str {
        self.series
            .as_deref()
            .map(str::trim)
            .filter(|series| !series.is_empty())
            .unwrap_or(UNKNOWN_SERIES)
    }

    /// Episode number, 1 when the site does not report one.
    pub fn episode(&self) -> u32 {
        self.episode_number.filter(|n| *n > 0).unwrap_or(1)
    }

    pub fn subtitle_languages(&self) -> Vec<&str> {
        let source = if self.subtitles.is_empty() {
            &self.automatic_captions
        } else {
            &self.subtitles
        };
        let mut languages: Vec<&str> = source.keys().map(String::as_str).collect();
        languages.sort_unstable();
        languages
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RemoteFormat {
    pub format_id: String,
    #[serde(default)]
    pub format_note: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub ext: Option<String>,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub vcodec: Option<String>,
    #[serde(default)]
    pub acodec: Option<String>,
    #[serde(default)]
    pub filesize: Option<u64>,
    #[serde(default)]
    pub filesize_approx: Option<u64>,
}

impl RemoteFormat {
    pub fn has_video(&self) -> bool {
        self.vcodec.as_deref().is_some_and(|codec| codec != "none")
    }

    /// Unknown audio codecs count as present; many sites omit the field on
    /// muxed HLS variants.
    pub fn has_audio(&self) -> bool {
        self.acodec.as_deref() != Some("none")
    }

    pub fn size(&self) -> u64 {
        self.filesize.or(self.filesize_approx).unwrap_or(0)
    }

    /// Text the dub heuristic looks at.
    pub fn descriptor(&self) -> String {
        [
            Some(self.format_id.as_str()),
            self.format_note.as_deref(),
            self.language.as_deref(),
        ]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>()
        .join(" ")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedUrl {
    Single(String),
    /// Playlist entries in order; `None` for entries without a usable URL.
    Playlist(Vec<Option<String>>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    pub format: String,
    pub folder: PathBuf,
    /// File stem every output of this download starts with.
    pub stem: String,
}

impl DownloadRequest {
    pub fn output_template(&self) -> PathBuf {
        self.folder.join(format!("{}.%(ext)s", self.stem))
    }
}

/// Metadata extraction and download of remote media.
#[async_trait]
pub trait MediaExtractor: Send + Sync {
    async fn resolve(&self, url: &str) -> DownloadResult<ResolvedUrl>;

    async fn extract(&self, url: &str) -> DownloadResult<RemoteVideo>;

    /// Downloads video and subtitles; returns the path of the video file.
    async fn download(&self, url: &str, request: &DownloadRequest) -> DownloadResult<PathBuf>;
}

#[derive(Debug, Deserialize)]
struct FlatListing {
    #[serde(rename = "_type", default)]
    kind: Option<String>,
    #[serde(default)]
    entries: Option<Vec<Option<FlatEntry>>>,
    #[serde(default)]
    webpage_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FlatEntry {
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    webpage_url: Option<String>,
}

/// `yt-dlp` driven through [`CommandExecutor`].
pub struct YtDlpExtractor {
    executor: Arc<dyn CommandExecutor>,
    program: String,
    extract_timeout: Duration,
    download_timeout: Duration,
    subtitle_langs: Vec<String>,
    subtitle_format: String,
    concurrent_fragments: u32,
    fragment_retries: u32,
    user_agent: String,
}

impl YtDlpExtractor {
    pub fn new(tools: &ToolsSection, config: &DownloadSection) -> Self {
        Self {
            executor: Arc::new(SystemCommandExecutor),
            program: tools.ytdlp.clone(),
            extract_timeout: Duration::from_secs(config.extract_timeout_seconds),
            download_timeout: Duration::from_secs(config.download_timeout_seconds),
            subtitle_langs: config.subtitle_langs.clone(),
            subtitle_format: config.subtitle_format.clone(),
            concurrent_fragments: config.concurrent_fragments,
            fragment_retries: config.fragment_retries,
            user_agent: config.user_agent.clone(),
        }
    }

    pub fn with_executor(mut self, executor: Arc<dyn CommandExecutor>) -> Self {
        self.executor = executor;
        self
    }

    fn common_args(&self) -> Vec<String> {
        vec![
            "--no-warnings".to_string(),
            "--no-check-certificates".to_string(),
            "--user-agent".to_string(),
            self.user_agent.clone(),
        ]
    }

    pub(crate) fn download_args(&self, url: &str, request: &DownloadRequest) -> Vec<String> {
        let mut args = self.common_args();
        args.extend([
            "--no-playlist".to_string(),
            "-f".to_string(),
            request.format.clone(),
            "-o".to_string(),
            request.output_template().to_string_lossy().to_string(),
            "--write-subs".to_string(),
            "--write-auto-subs".to_string(),
            "--sub-langs".to_string(),
            self.subtitle_langs.join(","),
            "--convert-subs".to_string(),
            self.subtitle_format.clone(),
            "--remux-video".to_string(),
            "mp4".to_string(),
            "--concurrent-fragments".to_string(),
            self.concurrent_fragments.to_string(),
            "--fragment-retries".to_string(),
            self.fragment_retries.to_string(),
            "--print".to_string(),
            "after_move:filepath".to_string(),
            "--no-simulate".to_string(),
            url.to_string(),
        ]);
        args
    }

    async fn run(&self, stage: &'static str, args: &[String], timeout: Duration) -> DownloadResult<CommandOutput> {
        match self.executor.run(&self.program, args, timeout).await {
            Ok(output) if output.success() => Ok(output),
            Ok(output) => Err(DownloadError::Failed {
                stage,
                status: output.status.code(),
                stderr: last_line(&output.stderr_lossy()),
            }),
            Err(ProcessError::NotFound { .. }) => Err(DownloadError::ToolMissing {
                tool: self.program.clone(),
            }),
            Err(ProcessError::Timeout { .. }) => {
                terminate_by_name(self.executor.as_ref(), &tool_name(&self.program)).await;
                Err(DownloadError::Timeout { stage, timeout })
            }
            Err(err) => Err(err.into()),
        }
    }
}

#[async_trait]
impl MediaExtractor for YtDlpExtractor {
    async fn resolve(&self, url: &str) -> DownloadResult<ResolvedUrl> {
        let mut args = self.common_args();
        args.extend([
            "--flat-playlist".to_string(),
            "--dump-single-json".to_string(),
            url.to_string(),
        ]);
        let output = self.run("playlist resolution", &args, self.extract_timeout).await?;
        let listing: FlatListing = serde_json::from_slice(&output.stdout)?;
        Ok(resolve_listing(url, listing))
    }

    async fn extract(&self, url: &str) -> DownloadResult<RemoteVideo> {
        let mut args = self.common_args();
        args.extend([
            "--dump-single-json".to_string(),
            "--no-playlist".to_string(),
            url.to_string(),
        ]);
        let output = self
            .run("metadata extraction", &args, self.extract_timeout)
            .await
            .map_err(|err| match err {
                DownloadError::Failed { stderr, .. } => DownloadError::Extraction(stderr),
                other => other,
            })?;
        let video: RemoteVideo = serde_json::from_slice(&output.stdout)?;
        debug!(title = video.title(), formats = video.formats.len(), "extracted metadata");
        Ok(video)
    }

    async fn download(&self, url: &str, request: &DownloadRequest) -> DownloadResult<PathBuf> {
        let args = self.download_args(url, request);
        info!(url, format = %request.format, "downloading");
        let output = self.run("download", &args, self.download_timeout).await?;
        let reported = output
            .stdout_lossy()
            .lines()
            .rev()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(PathBuf::from)
            .filter(|path| path.is_file());
        match reported {
            Some(path) => Ok(path),
            None => find_video_with_stem(&request.folder, &request.stem)?.ok_or_else(|| {
                DownloadError::NoOutput {
                    stem: request.stem.clone(),
                }
            }),
        }
    }
}

fn resolve_listing(url: &str, listing: FlatListing) -> ResolvedUrl {
    let is_playlist = listing.kind.as_deref() == Some("playlist") || listing.entries.is_some();
    if !is_playlist {
        return ResolvedUrl::Single(listing.webpage_url.unwrap_or_else(|| url.to_string()));
    }
    let entries = listing
        .entries
        .unwrap_or_default()
        .into_iter()
        .map(|entry| entry.and_then(|entry| entry.url.or(entry.webpage_url)))
        .collect();
    ResolvedUrl::Playlist(entries)
}

/// First video file in `folder` whose name starts with `stem.`.
pub(crate) fn find_video_with_stem(folder: &Path, stem: &str) -> DownloadResult<Option<PathBuf>> {
    let prefix = format!("{stem}.");
    let entries = std::fs::read_dir(folder).map_err(|source| DownloadError::Io {
        source,
        path: folder.to_path_buf(),
    })?;
    let mut found: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .map(|name| name.to_string_lossy().to_string())
                .is_some_and(|name| name.starts_with(&prefix) && classify(&name) == AssetKind::Video)
        })
        .collect();
    found.sort();
    Ok(found.into_iter().next())
}

fn last_line(text: &str) -> String {
    text.lines().last().unwrap_or_default().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::testing::{exit, ScriptedExecutor};
    use tempfile::tempdir;

    fn extractor(executor: Arc<ScriptedExecutor>) -> YtDlpExtractor {
        let config = crate::config::load_pipeline_config(
            Path::new(env!("CARGO_MANIFEST_DIR")).join("../configs/anipipe.toml"),
        )
        .unwrap();
        YtDlpExtractor::new(&config.tools, &config.download).with_executor(executor)
    }

    #[test]
    fn remote_video_defaults() {
        let video: RemoteVideo = serde_json::from_str(r#"{"title":"Pilot"}"#).unwrap();
        assert_eq!(video.series_name(), UNKNOWN_SERIES);
        assert_eq!(video.episode(), 1);
        assert!(video.formats.is_empty());
    }

    #[test]
    fn automatic_captions_are_used_when_no_subtitles() {
        let video: RemoteVideo = serde_json::from_str(
            r#"{"subtitles":{},"automatic_captions":{"en":[],"ja":[]}}"#,
        )
        .unwrap();
        assert_eq!(video.subtitle_languages(), vec!["en", "ja"]);
    }

    #[test]
    fn flat_playlist_entries_keep_gaps() {
        let listing: FlatListing = serde_json::from_str(
            r#"{"_type":"playlist","entries":[{"url":"https://a/1"},null,{"webpage_url":"https://a/3"},{}]}"#,
        )
        .unwrap();
        assert_eq!(
            resolve_listing("https://a", listing),
            ResolvedUrl::Playlist(vec![
                Some("https://a/1".into()),
                None,
                Some("https://a/3".into()),
                None
            ])
        );

        let listing: FlatListing = serde_json::from_str(r#"{"_type":"video","id":"x"}"#).unwrap();
        assert_eq!(
            resolve_listing("https://a/x", listing),
            ResolvedUrl::Single("https://a/x".into())
        );
    }

    #[tokio::test]
    async fn extraction_failure_carries_stderr() {
        let executor = Arc::new(ScriptedExecutor::new(|_, _| {
            Ok(CommandOutput {
                stderr: b"WARNING: x\nERROR: Unsupported URL".to_vec(),
                ..exit(1, "")?
            })
        }));
        let err = extractor(executor).extract("https://bad").await.unwrap_err();
        match err {
            DownloadError::Extraction(message) => assert_eq!(message, "ERROR: Unsupported URL"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn download_uses_printed_path() {
        let dir = tempdir().unwrap();
        let video = dir.path().join("Show - 01 - raw.mp4");
        std::fs::write(&video, b"v").unwrap();
        let printed = format!("{}\n", video.display());
        let executor = Arc::new(ScriptedExecutor::new(move |_, _| exit(0, &printed)));
        let request = DownloadRequest {
            format: "hls-480".into(),
            folder: dir.path().to_path_buf(),
            stem: "Show - 01 - raw".into(),
        };

        let path = extractor(Arc::clone(&executor))
            .download("https://site/ep1", &request)
            .await
            .unwrap();

        assert_eq!(path, video);
        let calls = executor.calls.lock().unwrap();
        let args = &calls[0].1;
        assert!(args.windows(2).any(|w| w == ["-f", "hls-480"]));
        assert!(args.windows(2).any(|w| w == ["--sub-langs", "en"]));
        assert_eq!(args.last().unwrap(), "https://site/ep1");
    }

    #[tokio::test]
    async fn download_falls_back_to_stem_scan() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("Show - 02 - raw.en.srt"), b"s").unwrap();
        std::fs::write(dir.path().join("Show - 02 - raw.mkv"), b"v").unwrap();
        let executor = Arc::new(ScriptedExecutor::new(|_, _| exit(0, "")));
        let request = DownloadRequest {
            format: "best".into(),
            folder: dir.path().to_path_buf(),
            stem: "Show - 02 - raw".into(),
        };

        let path = extractor(executor)
            .download("https://site/ep2", &request)
            .await
            .unwrap();
        assert_eq!(path, dir.path().join("Show - 02 - raw.mkv"));
    }

    #[tokio::test]
    async fn missing_ytdlp_is_not_retryable() {
        let executor = Arc::new(ScriptedExecutor::new(|program, _| {
            Err(ProcessError::NotFound {
                program: program.to_string(),
            })
        }));
        let err = extractor(executor).resolve("https://x").await.unwrap_err();
        assert!(matches!(err, DownloadError::ToolMissing { .. }));
        assert!(!err.is_retryable());
    }
}
