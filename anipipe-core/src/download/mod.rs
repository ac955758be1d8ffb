mod error;
mod extractor;
mod selector;

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::config::PipelineConfig;
use crate::error::ConfigError;
use crate::media::{canonical_episode_name, extension_of};
use crate::process::{
    probe, terminate_by_name, tool_name, CommandExecutor, ProcessError, SystemCommandExecutor,
};
use crate::retry::RetryPolicy;

pub use error::{DownloadError, DownloadResult};
pub use extractor::{
    DownloadRequest, MediaExtractor, RemoteFormat, RemoteVideo, ResolvedUrl, YtDlpExtractor,
    UNKNOWN_SERIES,
};
pub use selector::{
    assess_dub, is_dub_format, select_format, DubVerdict, FormatChoice, DUB_KEYWORDS,
    SUB_KEYWORDS,
};

/// Subtitle suffixes picked up next to a downloaded video, in priority order.
pub const SUBTITLE_SUFFIXES: &[&str] = &[".en.srt", ".srt", ".vtt", ".ass"];

const FAILURE_LOG: &str = "download_failures.log";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadOptions {
    /// Re-encode to the streaming-friendly 480p profile when ffmpeg exists.
    pub convert: bool,
    /// Skip content that looks subbed instead of warning and continuing.
    pub require_dub: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DownloadReport {
    pub url: String,
    pub entries: usize,
    pub files: Vec<PathBuf>,
    pub failed: Vec<String>,
}

pub struct DownloadOrchestrator {
    extractor: Arc<dyn MediaExtractor>,
    executor: Arc<dyn CommandExecutor>,
    ffmpeg: String,
    work_dir: PathBuf,
    log_path: PathBuf,
    retry: RetryPolicy,
    ladder: Vec<u32>,
    entry_delay: Duration,
    transcode_timeout: Duration,
}

impl DownloadOrchestrator {
    pub fn new(config: &PipelineConfig) -> Result<Self, ConfigError> {
        let retry = RetryPolicy::try_from(&config.download)?;
        Ok(Self {
            extractor: Arc::new(YtDlpExtractor::new(&config.tools, &config.download)),
            executor: Arc::new(SystemCommandExecutor),
            ffmpeg: config.tools.ffmpeg.clone(),
            work_dir: config.work_dir(),
            log_path: config.logs_dir().join(FAILURE_LOG),
            retry,
            ladder: config.download.resolution_ladder.clone(),
            entry_delay: Duration::from_secs(config.download.entry_delay_seconds),
            transcode_timeout: Duration::from_secs(config.download.transcode_timeout_seconds),
        })
    }

    pub fn with_extractor(mut self, extractor: Arc<dyn MediaExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    /// Executor for ffmpeg calls (probe, transcode).
    pub fn with_executor(mut self, executor: Arc<dyn CommandExecutor>) -> Self {
        self.executor = executor;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.retry.max_attempts()
    }

    /// Downloads a single episode or every entry of a playlist. Only a failure
    /// to resolve the URL itself is an error; failed entries are reported.
    pub async fn download_url(
        &self,
        url: &str,
        options: DownloadOptions,
    ) -> DownloadResult<DownloadReport> {
        let resolved = self
            .retry
            .run_if("playlist resolution", DownloadError::is_retryable, |_| {
                self.extractor.resolve(url)
            })
            .await?
            .result;
        let mut report = DownloadReport {
            url: url.to_string(),
            ..DownloadReport::default()
        };

        let entries = match resolved {
            ResolvedUrl::Single(single) => vec![Some(single)],
            ResolvedUrl::Playlist(entries) => {
                info!(url, entries = entries.len(), "found playlist");
                entries
            }
        };
        report.entries = entries.len();

        let total = entries.len();
        for (index, entry) in entries.into_iter().enumerate() {
            let position = index + 1;
            let Some(entry_url) = entry else {
                warn!(position, "playlist entry has no url, skipping");
                report.failed.push(format!("entry {position}"));
                continue;
            };
            match self
                .download_with_retry(&entry_url, options, self.retry.max_attempts())
                .await
            {
                Some(files) => report.files.extend(files),
                None => report.failed.push(entry_url),
            }
            if position < total && !self.entry_delay.is_zero() {
                sleep(self.entry_delay).await;
            }
        }
        Ok(report)
    }

    /// Every attempt cleans up its own partial output before the next one.
    /// Exhausted URLs are logged and appended to the failure log.
    pub async fn download_with_retry(
        &self,
        url: &str,
        options: DownloadOptions,
        max_attempts: u32,
    ) -> Option<Vec<PathBuf>> {
        let policy = self.retry.clone().with_max_attempts(max_attempts);
        let result = policy
            .run_if("download", DownloadError::is_retryable, |attempt| {
                self.attempt(url, options, attempt)
            })
            .await;
        match result {
            Ok(outcome) => {
                info!(url, attempts = outcome.attempts, files = outcome.result.len(), "download complete");
                Some(outcome.result)
            }
            Err(err) => {
                error!(url, error = %err, "download failed");
                self.log_failure(url, &err);
                None
            }
        }
    }

    async fn attempt(
        &self,
        url: &str,
        options: DownloadOptions,
        attempt: u32,
    ) -> DownloadResult<Vec<PathBuf>> {
        let video = self.extractor.extract(url).await?;
        let verdict = assess_dub(&video);
        if !verdict.is_dub() {
            if options.require_dub {
                return Err(DownloadError::NotDub {
                    title: video.title().to_string(),
                });
            }
            warn!(title = video.title(), "content may not be an English dub, continuing");
        }

        let series = sanitize_component(video.series_name());
        let episode = video.episode();
        let folder = self.work_dir.join(&series);
        fs::create_dir_all(&folder).map_err(|source| DownloadError::Io {
            source,
            path: folder.clone(),
        })?;
        let choice = select_format(&video.formats, &self.ladder);
        let languages = video.subtitle_languages();
        if languages.is_empty() {
            warn!(title = video.title(), "no subtitles offered");
        }
        info!(
            attempt,
            series = %series,
            episode,
            format = %choice.spec,
            height = ?choice.height,
            dub = ?verdict,
            "downloading episode"
        );

        let request = DownloadRequest {
            format: choice.spec,
            folder: folder.clone(),
            stem: raw_stem(&series, episode),
        };
        match self.fetch_and_finalize(url, &request, episode, options).await {
            Ok(files) => Ok(files),
            Err(err) => {
                remove_partials(&folder, &request.stem);
                Err(err)
            }
        }
    }

    async fn fetch_and_finalize(
        &self,
        url: &str,
        request: &DownloadRequest,
        episode: u32,
        options: DownloadOptions,
    ) -> DownloadResult<Vec<PathBuf>> {
        let downloaded = self.extractor.download(url, request).await?;
        let video = if options.convert {
            self.maybe_transcode(&downloaded, request).await
        } else {
            downloaded
        };
        finalize(&video, &request.folder, &request.stem, episode)
    }

    /// Returns the path to keep: the transcoded file on success, otherwise
    /// the original download.
    async fn maybe_transcode(&self, source: &Path, request: &DownloadRequest) -> PathBuf {
        if !probe(self.executor.as_ref(), &self.ffmpeg, "-version").await {
            warn!("ffmpeg not available, keeping original encoding");
            return source.to_path_buf();
        }
        let output = request.folder.join(format!("{}.480p.mp4", request.stem));
        match self.transcode(source, &output).await {
            Ok(()) => {
                if let Err(err) = fs::remove_file(source) {
                    warn!(path = %source.display(), error = %err, "could not remove original");
                }
                info!(output = %output.display(), "transcoded to 480p");
                output
            }
            Err(err) => {
                warn!(error = %err, "transcode failed, keeping original");
                let _ = fs::remove_file(&output);
                source.to_path_buf()
            }
        }
    }

    async fn transcode(&self, source: &Path, output: &Path) -> DownloadResult<()> {
        let args = transcode_args(source, output);
        match self
            .executor
            .run(&self.ffmpeg, &args, self.transcode_timeout)
            .await
        {
            Ok(result) if result.success() => match fs::metadata(output) {
                Ok(meta) if meta.len() > 0 => Ok(()),
                _ => Err(DownloadError::NoOutput {
                    stem: output.to_string_lossy().to_string(),
                }),
            },
            Ok(result) => Err(DownloadError::Failed {
                stage: "transcode",
                status: result.status.code(),
                stderr: result.stderr_lossy().lines().last().unwrap_or_default().to_string(),
            }),
            Err(ProcessError::Timeout { .. }) => {
                terminate_by_name(self.executor.as_ref(), &tool_name(&self.ffmpeg)).await;
                Err(DownloadError::Timeout {
                    stage: "transcode",
                    timeout: self.transcode_timeout,
                })
            }
            Err(err) => Err(err.into()),
        }
    }

    fn log_failure(&self, url: &str, error: &DownloadError) {
        if let Some(parent) = self.log_path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        if let Ok(mut file) = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
        {
            let _ = writeln!(file, "{} [download] {} {}", Utc::now().to_rfc3339(), url, error);
        }
    }
}

/// H.264/AAC at 854x480 with the moov atom up front.
pub fn transcode_args(source: &Path, output: &Path) -> Vec<String> {
    let mut args = vec!["-i".to_string(), source.to_string_lossy().to_string()];
    args.extend(
        [
            "-c:v",
            "libx264",
            "-c:a",
            "aac",
            "-b:a",
            "128k",
            "-movflags",
            "+faststart",
            "-preset",
            "fast",
            "-crf",
            "23",
            "-vf",
            "scale=854:480",
            "-y",
        ]
        .into_iter()
        .map(String::from),
    );
    args.push(output.to_string_lossy().to_string());
    args
}

/// Strips characters that are not allowed in a directory name on common
/// filesystems.
pub fn sanitize_component(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => ' ',
            c if c.is_control() => ' ',
            c => c,
        })
        .collect();
    let collapsed = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");
    let trimmed = collapsed.trim_matches('.').trim();
    if trimmed.is_empty() {
        UNKNOWN_SERIES.to_string()
    } else {
        trimmed.to_string()
    }
}

fn raw_stem(series: &str, episode: u32) -> String {
    format!("{series} - {episode:02} - download")
}

/// Moves the video and any subtitle sidecars to `Episode NN.<ext>`.
fn finalize(video: &Path, folder: &Path, stem: &str, episode: u32) -> DownloadResult<Vec<PathBuf>> {
    let mut files = Vec::new();
    let extension = video
        .file_name()
        .and_then(|name| extension_of(&name.to_string_lossy()))
        .unwrap_or_else(|| "mp4".to_string());
    let target = folder.join(canonical_episode_name(episode, &extension));
    if target != video && target.exists() {
        return Err(DownloadError::EpisodeExists { path: target });
    }
    move_file(video, &target)?;
    files.push(target);

    for suffix in SUBTITLE_SUFFIXES {
        let sidecar = folder.join(format!("{stem}{suffix}"));
        if !sidecar.is_file() {
            continue;
        }
        let extension = suffix.rsplit('.').next().unwrap_or("srt");
        let target = folder.join(canonical_episode_name(episode, extension));
        if target.exists() {
            warn!(path = %sidecar.display(), "subtitle already present for episode, discarding");
            let _ = fs::remove_file(&sidecar);
            continue;
        }
        move_file(&sidecar, &target)?;
        files.push(target);
    }
    Ok(files)
}

fn move_file(from: &Path, to: &Path) -> DownloadResult<()> {
    if from == to {
        return Ok(());
    }
    fs::rename(from, to).map_err(|source| DownloadError::Io {
        source,
        path: to.to_path_buf(),
    })
}

fn remove_partials(folder: &Path, stem: &str) {
    let Ok(entries) = fs::read_dir(folder) else {
        return;
    };
    for entry in entries.filter_map(Result::ok) {
        if entry.file_name().to_string_lossy().starts_with(stem) {
            let path = entry.path();
            match fs::remove_file(&path) {
                Ok(()) => info!(path = %path.display(), "removed partial download"),
                Err(err) => warn!(path = %path.display(), error = %err, "could not remove partial"),
            }
        }
    }
}
