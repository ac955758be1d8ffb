use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::channel::{ChannelClient, ChannelError, ChannelProvisioner, ChannelVisibility};
use crate::folders::{relocate, FolderError, FolderState, SeriesFolder};
use crate::metadata::{existing_poster, PosterClient};
use crate::upload::{AssetUploader, UploadReport};

#[derive(Debug, Serialize)]
pub struct PublishReport {
    pub series: String,
    pub channel_id: Option<i64>,
    pub visibility: Option<ChannelVisibility>,
    pub link: Option<String>,
    pub poster: Option<PathBuf>,
    pub cover_set: bool,
    pub uploads: UploadReport,
    /// Where the folder ended up; `None` when it stayed in the work root.
    pub relocated_to: Option<PathBuf>,
}

impl PublishReport {
    fn new(series: &str) -> Self {
        Self {
            series: series.to_string(),
            channel_id: None,
            visibility: None,
            link: None,
            poster: None,
            cover_set: false,
            uploads: UploadReport::default(),
            relocated_to: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Folder(#[from] FolderError),
}

/// Publishes one series folder: poster, channel, cover, episodes, then the
/// move to the done root.
pub struct Publisher<'a> {
    client: &'a dyn ChannelClient,
    uploader: AssetUploader<'a>,
    posters: Option<&'a PosterClient>,
    done_root: PathBuf,
    handle_attempts: u32,
}

impl<'a> Publisher<'a> {
    pub fn new(
        client: &'a dyn ChannelClient,
        uploader: AssetUploader<'a>,
        done_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            client,
            uploader,
            posters: None,
            done_root: done_root.into(),
            handle_attempts: crate::channel::DEFAULT_HANDLE_ATTEMPTS,
        }
    }

    pub fn with_posters(mut self, posters: &'a PosterClient) -> Self {
        self.posters = Some(posters);
        self
    }

    pub fn with_handle_attempts(mut self, attempts: u32) -> Self {
        self.handle_attempts = attempts;
        self
    }

    pub fn done_root(&self) -> &Path {
        &self.done_root
    }

    /// Channel creation failure is returned as an error and leaves the folder
    /// in place. A folder with zero successful uploads is not relocated.
    pub async fn publish_folder(
        &self,
        folder: &mut SeriesFolder,
    ) -> Result<PublishReport, PublishError> {
        folder.state = FolderState::Processing;
        let mut report = PublishReport::new(&folder.name);
        info!(series = %folder.name, "publishing");

        report.poster = match self.posters {
            Some(posters) => posters.fetch_poster(&folder.name, &folder.path).await,
            None => existing_poster(&folder.path),
        };

        let channel = match ChannelProvisioner::new(self.client)
            .with_handle_attempts(self.handle_attempts)
            .provision(&folder.name)
            .await
        {
            Ok(channel) => channel,
            Err(err) => {
                folder.state = FolderState::Pending;
                return Err(err.into());
            }
        };
        report.channel_id = Some(channel.reference.id);
        report.link = channel.link();
        report.visibility = Some(channel.visibility.clone());

        if let Some(poster) = &report.poster {
            report.cover_set = self.uploader.upload_cover(&channel.reference, poster).await;
        }

        report.uploads = self.uploader.upload_all(&channel.reference, &folder.path).await;

        if report.uploads.uploaded_count() == 0 {
            warn!(series = %folder.name, "nothing uploaded, leaving folder in place");
            folder.state = FolderState::Pending;
            return Ok(report);
        }
        match relocate(folder, &self.done_root) {
            Ok(destination) => report.relocated_to = Some(destination),
            Err(err) => {
                folder.state = FolderState::Pending;
                return Err(err.into());
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::testing::{Call, FakeClient};
    use crate::retry::RetryPolicy;
    use std::fs;
    use std::time::Duration;
    use tempfile::tempdir;

    fn publisher<'a>(client: &'a FakeClient, done: &Path) -> Publisher<'a> {
        let uploader = AssetUploader::new(
            client,
            RetryPolicy::linear(3, Duration::from_secs(30)),
            (Duration::ZERO, Duration::ZERO),
        );
        Publisher::new(client, uploader, done)
    }

    #[tokio::test(start_paused = true)]
    async fn published_folder_moves_to_done() {
        let root = tempdir().unwrap();
        let series = root.path().join("new").join("Frieren");
        fs::create_dir_all(&series).unwrap();
        fs::write(series.join("Episode 01.mp4"), b"v").unwrap();
        fs::write(series.join("poster.jpg"), b"p").unwrap();
        let client = FakeClient::default();
        let done = root.path().join("done");
        let mut folder = SeriesFolder::new(series.clone());

        let report = publisher(&client, &done)
            .publish_folder(&mut folder)
            .await
            .unwrap();

        assert_eq!(report.uploads.uploaded_count(), 1);
        assert_eq!(report.relocated_to, Some(done.join("Frieren")));
        assert_eq!(folder.state, FolderState::Done);
        assert!(!series.exists());
        assert!(report.link.unwrap().starts_with("https://t.me/frieren_"));
        assert!(report.cover_set);
        let calls = client.calls();
        assert!(matches!(calls[0], Call::Create(_)));
        assert!(calls.contains(&Call::Photo(series.join("poster.jpg"))));
    }

    #[tokio::test(start_paused = true)]
    async fn folder_without_uploads_stays_put() {
        let root = tempdir().unwrap();
        let series = root.path().join("new").join("Empty");
        fs::create_dir_all(&series).unwrap();
        let client = FakeClient::default();
        let mut folder = SeriesFolder::new(series.clone());

        let report = publisher(&client, &root.path().join("done"))
            .publish_folder(&mut folder)
            .await
            .unwrap();

        assert!(report.relocated_to.is_none());
        assert_eq!(folder.state, FolderState::Pending);
        assert!(series.exists());
    }

    #[tokio::test(start_paused = true)]
    async fn channel_failure_keeps_folder_pending() {
        let root = tempdir().unwrap();
        let series = root.path().join("new").join("Frieren");
        fs::create_dir_all(&series).unwrap();
        fs::write(series.join("Episode 01.mp4"), b"v").unwrap();
        let client = FakeClient {
            fail_creation: true,
            ..FakeClient::default()
        };
        let mut folder = SeriesFolder::new(series.clone());

        let err = publisher(&client, &root.path().join("done"))
            .publish_folder(&mut folder)
            .await
            .unwrap_err();

        assert!(matches!(err, PublishError::Channel(ChannelError::Creation(_))));
        assert_eq!(folder.state, FolderState::Pending);
        assert!(series.join("Episode 01.mp4").exists());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_cover_does_not_block_episodes() {
        let root = tempdir().unwrap();
        let series = root.path().join("new").join("Frieren");
        fs::create_dir_all(&series).unwrap();
        fs::write(series.join("Episode 01.mp4"), b"v").unwrap();
        fs::write(series.join("Episode 02.mp4"), b"v").unwrap();
        fs::write(series.join("poster.png"), b"p").unwrap();
        let client = FakeClient::default();
        client
            .photo_results
            .lock()
            .unwrap()
            .push_back(Err(ChannelError::Platform {
                status: 400,
                message: "PHOTO_INVALID_DIMENSIONS".into(),
            }));
        let done = root.path().join("done");
        let mut folder = SeriesFolder::new(series.clone());

        let report = publisher(&client, &done)
            .publish_folder(&mut folder)
            .await
            .unwrap();

        assert!(!report.cover_set);
        assert_eq!(report.poster, Some(series.join("poster.png")));
        assert_eq!(report.uploads.uploaded_count(), 2);
        assert_eq!(report.relocated_to, Some(done.join("Frieren")));
        let photos = client
            .calls()
            .into_iter()
            .filter(|call| matches!(call, Call::Photo(_)))
            .count();
        assert_eq!(photos, 1);
    }
}
