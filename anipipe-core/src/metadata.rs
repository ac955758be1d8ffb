use std::path::{Path, PathBuf};
use std::time::Duration;

use futures::{Stream, StreamExt};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::MetadataSection;

const COVER_QUERY: &str = "query ($search: String) { Media(search: $search, type: ANIME) { coverImage { large extraLarge } } }";

const POSTER_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "webp"];

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("metadata service returned no cover for {0}")]
    NoCover(String),
    #[error("io error at {path}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
}

pub type MetadataResult<T> = Result<T, MetadataError>;

#[derive(Debug, Deserialize)]
struct CoverResponse {
    data: Option<CoverData>,
}

#[derive(Debug, Deserialize)]
struct CoverData {
    #[serde(rename = "Media")]
    media: Option<CoverMedia>,
}

#[derive(Debug, Deserialize)]
struct CoverMedia {
    #[serde(rename = "coverImage")]
    cover_image: Option<CoverImage>,
}

#[derive(Debug, Deserialize)]
struct CoverImage {
    large: Option<String>,
    #[serde(rename = "extraLarge")]
    extra_large: Option<String>,
}

impl CoverResponse {
    fn best_url(self) -> Option<String> {
        let image = self.data?.media?.cover_image?;
        image.extra_large.or(image.large)
    }
}

/// Looks up series cover art and stores it as `poster.<ext>` in the series
/// folder.
#[derive(Debug, Clone)]
pub struct PosterClient {
    client: Client,
    endpoint: String,
    enabled: bool,
}

impl PosterClient {
    pub fn new(config: &MetadataSection) -> MetadataResult<Self> {
        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()?;
        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            enabled: config.enabled,
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub async fn search_cover(&self, series: &str) -> MetadataResult<String> {
        let body = json!({
            "query": COVER_QUERY,
            "variables": { "search": series },
        });
        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        let parsed: CoverResponse = response.json().await?;
        parsed
            .best_url()
            .ok_or_else(|| MetadataError::NoCover(series.to_string()))
    }

    pub async fn download_poster(&self, url: &str, folder: &Path) -> MetadataResult<PathBuf> {
        let name = format!("poster.{}", poster_extension(url));
        let response = self.client.get(url).send().await?.error_for_status()?;
        save_stream(response.bytes_stream(), folder, &name).await
    }

    /// Best effort: returns the poster already in the folder, or fetches one.
    /// Every failure is logged and yields `None`.
    pub async fn fetch_poster(&self, series: &str, folder: &Path) -> Option<PathBuf> {
        if let Some(existing) = existing_poster(folder) {
            debug!(path = %existing.display(), "poster already present");
            return Some(existing);
        }
        if !self.enabled {
            return None;
        }
        let url = match self.search_cover(series).await {
            Ok(url) => url,
            Err(err) => {
                warn!(series, error = %err, "cover lookup failed");
                return None;
            }
        };
        match self.download_poster(&url, folder).await {
            Ok(path) => {
                info!(series, path = %path.display(), "poster saved");
                Some(path)
            }
            Err(err) => {
                warn!(series, url, error = %err, "poster download failed");
                None
            }
        }
    }
}

/// Streams into a temporary file next to the destination and renames it only
/// once every chunk is written, so an interrupted transfer leaves no poster.
async fn save_stream<S, B, E>(mut stream: S, folder: &Path, name: &str) -> MetadataResult<PathBuf>
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    MetadataError: From<E>,
{
    let path = folder.join(name);
    let io_err = |source| MetadataError::Io {
        source,
        path: path.clone(),
    };
    let (file, temp) = tempfile::Builder::new()
        .prefix(".poster-")
        .tempfile_in(folder)
        .map_err(io_err)?
        .into_parts();
    let mut file = fs::File::from_std(file);
    while let Some(chunk) = stream.next().await {
        let data = chunk?;
        file.write_all(data.as_ref()).await.map_err(io_err)?;
    }
    file.flush().await.map_err(io_err)?;
    drop(file);
    temp.persist(&path).map_err(|err| io_err(err.error))?;
    Ok(path)
}

/// Extension from the URL path when it is a known image type, else `jpg`.
pub fn poster_extension(url: &str) -> String {
    Url::parse(url)
        .ok()
        .and_then(|parsed| {
            let last = parsed.path_segments()?.last()?.to_string();
            let (_, ext) = last.rsplit_once('.')?;
            Some(ext.to_ascii_lowercase())
        })
        .filter(|ext| POSTER_EXTENSIONS.contains(&ext.as_str()))
        .unwrap_or_else(|| "jpg".to_string())
}

pub fn existing_poster(folder: &Path) -> Option<PathBuf> {
    POSTER_EXTENSIONS
        .iter()
        .map(|ext| folder.join(format!("poster.{ext}")))
        .find(|path| path.is_file())
}
