use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::channel::{ChannelClient, ChannelError, ChannelRef};
use crate::config::PublishSection;
use crate::error::ConfigError;
use crate::media::{classify, extract_episode_ordinal, AssetKind};
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadOutcome {
    Success,
    RetryableFailure,
    FatalFailure,
}

/// Final state of one file after its retry loop.
#[derive(Debug, Clone, Serialize)]
pub struct FileUpload {
    pub path: PathBuf,
    pub attempts: u32,
    pub outcome: UploadOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct UploadReport {
    pub total: usize,
    pub files: Vec<FileUpload>,
}

impl UploadReport {
    pub fn uploaded_count(&self) -> usize {
        self.files
            .iter()
            .filter(|file| file.outcome == UploadOutcome::Success)
            .count()
    }

    pub fn skipped(&self) -> impl Iterator<Item = &FileUpload> {
        self.files
            .iter()
            .filter(|file| file.outcome != UploadOutcome::Success)
    }
}

pub struct AssetUploader<'a> {
    client: &'a dyn ChannelClient,
    retry: RetryPolicy,
    pacing: (Duration, Duration),
}

impl<'a> AssetUploader<'a> {
    pub fn new(client: &'a dyn ChannelClient, retry: RetryPolicy, pacing: (Duration, Duration)) -> Self {
        let (min, max) = pacing;
        Self {
            client,
            retry,
            pacing: (min.min(max), max.max(min)),
        }
    }

    pub fn from_config(
        client: &'a dyn ChannelClient,
        config: &PublishSection,
    ) -> Result<Self, ConfigError> {
        let retry = RetryPolicy::try_from(config)?;
        let [min, max] = config.pacing_seconds;
        Ok(Self::new(
            client,
            retry,
            (Duration::from_secs(min), Duration::from_secs(max)),
        ))
    }

    /// One attempt; failure is logged and ignored.
    pub async fn upload_cover(&self, channel: &ChannelRef, image: &Path) -> bool {
        match self.client.set_photo(channel, image).await {
            Ok(()) => {
                info!(channel = channel.id, image = %image.display(), "cover set");
                true
            }
            Err(err) => {
                warn!(channel = channel.id, error = %err, "cover upload failed");
                false
            }
        }
    }

    pub async fn upload_all(&self, channel: &ChannelRef, folder: &Path) -> UploadReport {
        let files = match list_video_files(folder) {
            Ok(files) => files,
            Err(err) => {
                warn!(folder = %folder.display(), error = %err, "cannot list videos");
                return UploadReport::default();
            }
        };
        let mut report = UploadReport {
            total: files.len(),
            files: Vec::with_capacity(files.len()),
        };
        info!(channel = channel.id, files = files.len(), "uploading episodes");

        for (index, path) in files.iter().enumerate() {
            let upload = self.upload_one(channel, path).await;
            let succeeded = upload.outcome == UploadOutcome::Success;
            report.files.push(upload);
            if succeeded && index + 1 < files.len() {
                let pause = self.pacing_delay();
                debug!(wait = ?pause, "pacing before next upload");
                sleep(pause).await;
            }
        }

        info!(
            channel = channel.id,
            uploaded = report.uploaded_count(),
            total = report.total,
            "upload finished"
        );
        report
    }

    async fn upload_one(&self, channel: &ChannelRef, path: &Path) -> FileUpload {
        let caption = caption_for(path);
        let mut last_attempt = 0;
        let label = format!("upload {caption}");
        let result = self
            .retry
            .run_if(&label, ChannelError::is_retryable, |attempt| {
                last_attempt = attempt;
                self.client.send_video(channel, path, &caption)
            })
            .await;

        match result {
            Ok(outcome) => {
                info!(file = %path.display(), attempts = outcome.attempts, "uploaded");
                FileUpload {
                    path: path.to_path_buf(),
                    attempts: outcome.attempts,
                    outcome: UploadOutcome::Success,
                    error: None,
                }
            }
            Err(err) => {
                let outcome = if err.is_retryable() {
                    UploadOutcome::RetryableFailure
                } else {
                    UploadOutcome::FatalFailure
                };
                warn!(file = %path.display(), attempts = last_attempt, error = %err, "skipping file");
                FileUpload {
                    path: path.to_path_buf(),
                    attempts: last_attempt,
                    outcome,
                    error: Some(err.to_string()),
                }
            }
        }
    }

    fn pacing_delay(&self) -> Duration {
        let (min, max) = self.pacing;
        if min == max {
            return min;
        }
        let millis = rand::thread_rng().gen_range(min.as_millis()..=max.as_millis());
        Duration::from_millis(u64::try_from(millis).unwrap_or(u64::MAX))
    }
}

fn caption_for(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .unwrap_or_default()
}

/// Regular video files of `folder`, ordered by episode ordinal with
/// unnumbered files last, ties broken by name.
pub fn list_video_files(folder: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(folder)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if classify(&name) == AssetKind::Video {
            files.push((extract_episode_ordinal(&name), name, entry.path()));
        }
    }
    files.sort_by(|a, b| {
        let key = |ordinal: Option<u32>| ordinal.unwrap_or(u32::MAX);
        key(a.0).cmp(&key(b.0)).then_with(|| a.1.cmp(&b.1))
    });
    Ok(files.into_iter().map(|(_, _, path)| path).collect())
}
