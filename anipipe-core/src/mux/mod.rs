mod error;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tempfile::TempPath;
use tracing::{error, info, warn};

use crate::config::{MuxSection, ToolsSection};
use crate::media::{
    canonical_episode_name, extension_of, match_pairs, scan_assets, MatchedPair, UnmatchedAsset,
};
use crate::process::{
    terminate_by_name, tool_name, CommandExecutor, ProcessError, SystemCommandExecutor,
};

pub use error::{MuxError, MuxResult};

#[derive(Debug, Clone, Serialize)]
pub struct FailedPair {
    pub video: PathBuf,
    pub subtitle: PathBuf,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CombineReport {
    pub folder: PathBuf,
    pub combined: Vec<PathBuf>,
    pub failed: Vec<FailedPair>,
    pub unmatched: Vec<UnmatchedAsset>,
}

impl CombineReport {
    fn new(folder: &Path) -> Self {
        Self {
            folder: folder.to_path_buf(),
            combined: Vec::new(),
            failed: Vec::new(),
            unmatched: Vec::new(),
        }
    }
}

#[derive(Clone)]
pub struct MuxInvoker {
    executor: Arc<dyn CommandExecutor>,
    ffmpeg: String,
    timeout: Duration,
    convert_timeout: Duration,
    subtitle_language: String,
}

impl MuxInvoker {
    pub fn new(tools: &ToolsSection, mux: &MuxSection) -> Self {
        Self {
            executor: Arc::new(SystemCommandExecutor),
            ffmpeg: tools.ffmpeg.clone(),
            timeout: Duration::from_secs(mux.timeout_seconds),
            convert_timeout: Duration::from_secs(mux.convert_timeout_seconds),
            subtitle_language: mux.subtitle_language.clone(),
        }
    }

    pub fn with_executor(mut self, executor: Arc<dyn CommandExecutor>) -> Self {
        self.executor = executor;
        self
    }

    /// Embeds `subtitle` into `video`, writing `output`. Never raises: every
    /// failure is logged and reported as `false`.
    pub async fn mux(&self, video: &Path, subtitle: &Path, output: &Path) -> bool {
        match self.try_mux(video, subtitle, output).await {
            Ok(()) => {
                info!(output = %output.display(), "embedded subtitles");
                true
            }
            Err(err) => {
                warn!(video = %video.display(), error = %err, "mux failed");
                false
            }
        }
    }

    pub async fn try_mux(&self, video: &Path, subtitle: &Path, output: &Path) -> MuxResult<()> {
        let work_dir = output
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let converted = if is_webvtt(subtitle) {
            Some(self.convert_to_srt(subtitle, work_dir).await?)
        } else {
            None
        };
        let subtitle_input: &Path = converted.as_deref().unwrap_or(subtitle);
        let args = self.mux_args(video, subtitle_input, output);
        let result = self.run_ffmpeg("mux", &args, self.timeout).await;
        drop(converted);
        result?;
        verify_output(output)
    }

    /// Muxes a matched pair in place. The originals are removed only after the
    /// combined file has been verified and moved to its canonical name.
    pub async fn combine_pair(&self, pair: &MatchedPair) -> MuxResult<PathBuf> {
        let folder = pair
            .video
            .path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let extension = pair.video.extension().unwrap_or_else(|| "mp4".to_string());
        let final_path = folder.join(canonical_episode_name(pair.ordinal, &extension));
        // Only the pair's own video may be replaced by the combined file.
        let replaces_video = final_path == pair.video.path;
        if !replaces_video && final_path.exists() {
            warn!(path = %final_path.display(), "canonical name taken, leaving pair untouched");
            return Err(MuxError::Occupied { path: final_path });
        }
        let temp = temp_path_in(&folder, ".anipipe-mux-", &format!(".{extension}"))?;

        self.try_mux(&pair.video.path, &pair.subtitle.path, &temp)
            .await?;

        let persisted = if replaces_video {
            temp.persist(&final_path)
        } else {
            temp.persist_noclobber(&final_path)
        };
        persisted.map_err(|err| MuxError::Io {
            source: err.error,
            path: final_path.clone(),
        })?;
        for original in [&pair.video.path, &pair.subtitle.path] {
            if original != &final_path {
                fs::remove_file(original).map_err(|source| MuxError::Io {
                    source,
                    path: original.clone(),
                })?;
            }
        }
        info!(episode = pair.ordinal, path = %final_path.display(), "combined episode");
        Ok(final_path)
    }

    pub async fn combine_folder(&self, folder: &Path) -> MuxResult<CombineReport> {
        let assets = scan_assets(folder).map_err(|source| MuxError::Io {
            source,
            path: folder.to_path_buf(),
        })?;
        let outcome = match_pairs(&assets.videos, &assets.subtitles);
        let mut report = CombineReport::new(folder);
        report.unmatched = outcome.unmatched;
        info!(
            folder = %folder.display(),
            pairs = outcome.pairs.len(),
            unmatched = report.unmatched.len(),
            "combining episodes"
        );

        for pair in &outcome.pairs {
            match self.combine_pair(pair).await {
                Ok(path) => report.combined.push(path),
                Err(err) => {
                    let tool_missing = matches!(err, MuxError::ToolMissing { .. });
                    report.failed.push(FailedPair {
                        video: pair.video.path.clone(),
                        subtitle: pair.subtitle.path.clone(),
                        error: err.to_string(),
                    });
                    if tool_missing {
                        error!(error = %err, "skipping remaining episodes");
                        break;
                    }
                }
            }
        }
        Ok(report)
    }

    async fn convert_to_srt(&self, subtitle: &Path, dir: &Path) -> MuxResult<TempPath> {
        let temp = temp_path_in(dir, ".anipipe-sub-", ".srt")?;
        let args = vec![
            "-y".to_string(),
            "-i".to_string(),
            subtitle.to_string_lossy().to_string(),
            temp.to_string_lossy().to_string(),
        ];
        self.run_ffmpeg("subtitle conversion", &args, self.convert_timeout)
            .await?;
        Ok(temp)
    }

    async fn run_ffmpeg(
        &self,
        stage: &'static str,
        args: &[String],
        timeout: Duration,
    ) -> MuxResult<()> {
        match self.executor.run(&self.ffmpeg, args, timeout).await {
            Ok(output) if output.success() => Ok(()),
            Ok(output) => Err(MuxError::Failed {
                stage,
                status: output.status.code(),
                stderr: tail(&output.stderr_lossy(), 6),
            }),
            Err(ProcessError::NotFound { .. }) => Err(MuxError::ToolMissing {
                tool: self.ffmpeg.clone(),
            }),
            Err(ProcessError::Timeout { .. }) => {
                terminate_by_name(self.executor.as_ref(), &tool_name(&self.ffmpeg)).await;
                Err(MuxError::Timeout { stage, timeout })
            }
            Err(err) => Err(err.into()),
        }
    }

    fn mux_args(&self, video: &Path, subtitle: &Path, output: &Path) -> Vec<String> {
        let codec = subtitle_codec_for(output);
        vec![
            "-i".to_string(),
            video.to_string_lossy().to_string(),
            "-i".to_string(),
            subtitle.to_string_lossy().to_string(),
            "-map".to_string(),
            "0".to_string(),
            "-map".to_string(),
            "1".to_string(),
            "-c:v".to_string(),
            "copy".to_string(),
            "-c:a".to_string(),
            "copy".to_string(),
            "-c:s".to_string(),
            codec.to_string(),
            "-metadata:s:s:0".to_string(),
            format!("language={}", self.subtitle_language),
            "-y".to_string(),
            output.to_string_lossy().to_string(),
        ]
    }
}

fn temp_path_in(dir: &Path, prefix: &str, suffix: &str) -> MuxResult<TempPath> {
    tempfile::Builder::new()
        .prefix(prefix)
        .suffix(suffix)
        .tempfile_in(dir)
        .map(|file| file.into_temp_path())
        .map_err(|source| MuxError::Io {
            source,
            path: dir.to_path_buf(),
        })
}

fn verify_output(output: &Path) -> MuxResult<()> {
    match fs::metadata(output) {
        Ok(meta) if meta.is_file() && meta.len() > 0 => Ok(()),
        _ => Err(MuxError::EmptyOutput {
            path: output.to_path_buf(),
        }),
    }
}

fn is_webvtt(subtitle: &Path) -> bool {
    subtitle
        .file_name()
        .and_then(|name| extension_of(&name.to_string_lossy()))
        .is_some_and(|ext| ext == "vtt")
}

fn subtitle_codec_for(output: &Path) -> &'static str {
    let extension = output
        .file_name()
        .and_then(|name| extension_of(&name.to_string_lossy()))
        .unwrap_or_default();
    match extension.as_str() {
        "mkv" => "srt",
        "webm" => "webvtt",
        _ => "mov_text",
    }
}

fn tail(text: &str, lines: usize) -> String {
    let collected: Vec<&str> = text.lines().collect();
    let start = collected.len().saturating_sub(lines);
    collected[start..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::MediaAsset;
    use crate::process::testing::{exit, ScriptedExecutor};
    use crate::process::ProcessError;
    use tempfile::tempdir;

    fn invoker(executor: Arc<ScriptedExecutor>) -> MuxInvoker {
        MuxInvoker::new(
            &ToolsSection {
                ffmpeg: "ffmpeg".into(),
                ytdlp: "yt-dlp".into(),
            },
            &MuxSection {
                timeout_seconds: 300,
                convert_timeout_seconds: 60,
                subtitle_language: "eng".into(),
            },
        )
        .with_executor(executor)
    }

    /// Writes something into the last argument, like ffmpeg writing its output.
    fn writing_ffmpeg() -> ScriptedExecutor {
        ScriptedExecutor::new(|_, args| {
            if let Some(output) = args.last() {
                fs::write(output, b"muxed").unwrap();
            }
            exit(0, "")
        })
    }

    fn pair(dir: &Path, video: &str, subtitle: &str, ordinal: u32) -> MatchedPair {
        let video_path = dir.join(video);
        let subtitle_path = dir.join(subtitle);
        fs::write(&video_path, b"video").unwrap();
        fs::write(&subtitle_path, b"1\n00:00:01,000 --> 00:00:02,000\nhi\n").unwrap();
        MatchedPair {
            ordinal,
            video: MediaAsset::from_path(video_path).unwrap(),
            subtitle: MediaAsset::from_path(subtitle_path).unwrap(),
        }
    }

    fn listing(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn successful_mux_replaces_originals_with_canonical_file() {
        let dir = tempdir().unwrap();
        let pair = pair(dir.path(), "ep.mp4", "ep.srt", 1);
        let executor = Arc::new(writing_ffmpeg());
        let invoker = invoker(Arc::clone(&executor));

        let combined = invoker.combine_pair(&pair).await.unwrap();

        assert_eq!(combined, dir.path().join("Episode 01.mp4"));
        assert!(!dir.path().join("ep.mp4").exists());
        assert!(!dir.path().join("ep.srt").exists());
        assert_eq!(listing(dir.path()), vec!["Episode 01.mp4"]);
        assert!(fs::metadata(&combined).unwrap().len() > 0);

        let calls = executor.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        let args = &calls[0].1;
        assert!(args.windows(2).any(|w| w == ["-c:s", "mov_text"]));
        assert!(args.windows(2).any(|w| w == ["-metadata:s:s:0", "language=eng"]));
    }

    #[tokio::test]
    async fn failed_mux_leaves_originals_untouched() {
        let dir = tempdir().unwrap();
        let pair = pair(dir.path(), "ep.mp4", "ep.srt", 1);
        let executor = Arc::new(ScriptedExecutor::new(|_, _| exit(1, "")));
        let invoker = invoker(executor);

        let err = invoker.combine_pair(&pair).await.unwrap_err();
        assert!(matches!(err, MuxError::Failed { .. }));
        assert_eq!(listing(dir.path()), vec!["ep.mp4", "ep.srt"]);
    }

    #[tokio::test]
    async fn zero_length_output_counts_as_failure() {
        let dir = tempdir().unwrap();
        let pair = pair(dir.path(), "ep.mkv", "ep.srt", 4);
        let executor = Arc::new(ScriptedExecutor::new(|_, _| exit(0, "")));
        let invoker = invoker(executor);

        assert!(!invoker
            .mux(&pair.video.path, &pair.subtitle.path, &dir.path().join("out.mkv"))
            .await);
        let err = invoker.combine_pair(&pair).await.unwrap_err();
        assert!(matches!(err, MuxError::EmptyOutput { .. }));
        assert_eq!(listing(dir.path()), vec!["ep.mkv", "ep.srt"]);
    }

    #[tokio::test]
    async fn missing_ffmpeg_is_reported_without_touching_files() {
        let dir = tempdir().unwrap();
        let pair = pair(dir.path(), "ep.mp4", "ep.srt", 2);
        let executor = Arc::new(ScriptedExecutor::new(|program, _| {
            Err(ProcessError::NotFound {
                program: program.to_string(),
            })
        }));
        let invoker = invoker(executor);

        let err = invoker.combine_pair(&pair).await.unwrap_err();
        assert!(matches!(err, MuxError::ToolMissing { .. }));
        assert_eq!(listing(dir.path()), vec!["ep.mp4", "ep.srt"]);
    }

    #[tokio::test]
    async fn timeout_kills_lingering_ffmpeg() {
        let dir = tempdir().unwrap();
        let pair = pair(dir.path(), "ep.mp4", "ep.srt", 3);
        let executor = Arc::new(ScriptedExecutor::new(|_, _| exit(0, "")));
        executor.push(|program, _| {
            Err(ProcessError::Timeout {
                program: program.to_string(),
                timeout: Duration::from_secs(300),
            })
        });
        let invoker = invoker(Arc::clone(&executor));

        let err = invoker.combine_pair(&pair).await.unwrap_err();
        assert!(matches!(err, MuxError::Timeout { stage: "mux", .. }));
        let calls = executor.calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert!(calls[1].0 == "pkill" || calls[1].0 == "taskkill");
        drop(calls);
        assert_eq!(listing(dir.path()), vec!["ep.mp4", "ep.srt"]);
    }

    #[tokio::test]
    async fn webvtt_is_converted_first_and_temp_file_removed() {
        let dir = tempdir().unwrap();
        let pair = pair(dir.path(), "Episode 05.mp4", "Episode 05.vtt", 5);
        let executor = Arc::new(writing_ffmpeg());
        let invoker = invoker(Arc::clone(&executor));

        invoker.combine_pair(&pair).await.unwrap();

        let calls = executor.calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert!(calls[0].1.last().unwrap().ends_with(".srt"));
        assert_eq!(listing(dir.path()), vec!["Episode 05.mp4"]);
    }

    #[tokio::test]
    async fn combine_folder_processes_matched_pairs_only() {
        let dir = tempdir().unwrap();
        for (name, body) in [
            ("Show - 01 - Start.mp4", "v"),
            ("Show - 01 - Start.en.srt", "s"),
            ("Show - 02 - Next.mp4", "v"),
            ("poster.jpg", "p"),
        ] {
            fs::write(dir.path().join(name), body).unwrap();
        }
        let invoker = invoker(Arc::new(writing_ffmpeg()));

        let report = invoker.combine_folder(dir.path()).await.unwrap();

        assert_eq!(report.combined, vec![dir.path().join("Episode 01.mp4")]);
        assert_eq!(report.unmatched.len(), 1);
        assert!(report.failed.is_empty());
        assert_eq!(
            listing(dir.path()),
            vec!["Episode 01.mp4", "Show - 02 - Next.mp4", "poster.jpg"]
        );
    }

    #[tokio::test]
    async fn existing_canonical_file_is_never_overwritten() {
        let dir = tempdir().unwrap();
        let pair = pair(dir.path(), "A - 01.mkv", "A - 01.srt", 1);
        fs::write(dir.path().join("Episode 01.mkv"), b"other episode").unwrap();
        let executor = Arc::new(writing_ffmpeg());
        let invoker = invoker(Arc::clone(&executor));

        let err = invoker.combine_pair(&pair).await.unwrap_err();

        assert!(matches!(err, MuxError::Occupied { .. }));
        assert!(executor.calls.lock().unwrap().is_empty());
        assert_eq!(
            listing(dir.path()),
            vec!["A - 01.mkv", "A - 01.srt", "Episode 01.mkv"]
        );
        assert_eq!(
            fs::read(dir.path().join("Episode 01.mkv")).unwrap(),
            b"other episode"
        );
    }

    #[tokio::test]
    async fn duplicate_ordinal_in_folder_keeps_both_videos() {
        let dir = tempdir().unwrap();
        for (name, body) in [
            ("A - 01.mkv", "video"),
            ("A - 01.srt", "sub"),
            ("Episode 01.mkv", "other episode"),
        ] {
            fs::write(dir.path().join(name), body).unwrap();
        }
        let invoker = invoker(Arc::new(writing_ffmpeg()));

        let report = invoker.combine_folder(dir.path()).await.unwrap();

        assert!(report.combined.is_empty());
        assert_eq!(report.failed.len(), 1);
        assert_eq!(
            fs::read(dir.path().join("Episode 01.mkv")).unwrap(),
            b"other episode"
        );
        assert!(dir.path().join("A - 01.mkv").exists());
    }
}
