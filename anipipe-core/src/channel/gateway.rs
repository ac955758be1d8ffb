use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;
use url::Url;

use super::{ChannelClient, ChannelError, ChannelRef, ChannelResult};
use crate::config::PublishSection;

const HANDLE_COLLISION_MARKER: &str = "USERNAME_OCCUPIED";

/// JSON-over-HTTP bridge to a user account on the messaging platform. The
/// bridge holds the platform session; this client only forwards requests.
///
/// Endpoints, relative to `gateway_url`:
///
/// | request                         | body                                   |
/// |---------------------------------|----------------------------------------|
/// | `POST channels`                 | `{title, about, broadcast}` -> `{id}`  |
/// | `POST channels/{id}/username`   | `{username}`                           |
/// | `POST channels/{id}/photo`      | `{path}`                               |
/// | `POST channels/{id}/messages`   | `{path, caption, supports_streaming}`  |
///
/// Files are passed by local path; the bridge runs on the same host.
#[derive(Debug, Clone)]
pub struct GatewayClient {
    client: Client,
    base: Url,
    token: Option<String>,
    request_timeout: Duration,
    upload_timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct CreatedChannel {
    id: i64,
}

impl GatewayClient {
    pub fn new(base: &str, token: Option<String>) -> ChannelResult<Self> {
        let mut base = Url::parse(base)
            .map_err(|err| ChannelError::Network(format!("invalid gateway url {base}: {err}")))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let client = Client::builder()
            .user_agent(concat!("anipipe/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            base,
            token,
            request_timeout: Duration::from_secs(30),
            upload_timeout: Duration::from_secs(1800),
        })
    }

    /// Reads the bearer token from the environment variable named in the
    /// config. An unset variable means an unauthenticated bridge.
    pub fn from_config(config: &PublishSection) -> ChannelResult<Self> {
        let token = std::env::var(&config.token_env).ok().filter(|t| !t.is_empty());
        let mut client = Self::new(&config.gateway_url, token)?;
        client.request_timeout = Duration::from_secs(config.request_timeout_seconds);
        client.upload_timeout = Duration::from_secs(config.upload_timeout_seconds);
        Ok(client)
    }

    fn endpoint(&self, path: &str) -> ChannelResult<Url> {
        self.base
            .join(path)
            .map_err(|err| ChannelError::Network(format!("invalid endpoint {path}: {err}")))
    }

    fn post(&self, path: &str, body: &Value, timeout: Duration) -> ChannelResult<RequestBuilder> {
        let mut request = self
            .client
            .post(self.endpoint(path)?)
            .timeout(timeout)
            .json(body);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        Ok(request)
    }

    async fn send(&self, request: RequestBuilder, handle: Option<&str>) -> ChannelResult<String> {
        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;
        if status.is_success() {
            Ok(body)
        } else {
            Err(classify_failure(status, &body, handle))
        }
    }
}

/// Maps a failed bridge response onto the channel error taxonomy.
pub fn classify_failure(status: StatusCode, body: &str, handle: Option<&str>) -> ChannelError {
    if let Some(handle) = handle {
        if status == StatusCode::CONFLICT || body.contains(HANDLE_COLLISION_MARKER) {
            return ChannelError::HandleOccupied {
                handle: handle.to_string(),
            };
        }
    }
    let message = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|value| value.get("error").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| body.trim().to_string());
    ChannelError::Platform {
        status: status.as_u16(),
        message,
    }
}

#[async_trait]
impl ChannelClient for GatewayClient {
    async fn create_channel(&self, title: &str, about: &str) -> ChannelResult<ChannelRef> {
        let body = json!({ "title": title, "about": about, "broadcast": true });
        let request = self.post("channels", &body, self.request_timeout)?;
        let response = self
            .send(request, None)
            .await
            .map_err(|err| ChannelError::Creation(err.to_string()))?;
        let created: CreatedChannel = serde_json::from_str(&response)?;
        Ok(ChannelRef {
            id: created.id,
            title: title.to_string(),
        })
    }

    async fn assign_handle(&self, channel: &ChannelRef, handle: &str) -> ChannelResult<()> {
        let body = json!({ "username": handle });
        let request = self.post(
            &format!("channels/{}/username", channel.id),
            &body,
            self.request_timeout,
        )?;
        self.send(request, Some(handle)).await.map(|_| ())
    }

    async fn set_photo(&self, channel: &ChannelRef, image: &Path) -> ChannelResult<()> {
        let body = json!({ "path": image.to_string_lossy() });
        let request = self.post(
            &format!("channels/{}/photo", channel.id),
            &body,
            self.request_timeout,
        )?;
        self.send(request, None).await.map(|_| ())
    }

    async fn send_video(
        &self,
        channel: &ChannelRef,
        video: &Path,
        caption: &str,
    ) -> ChannelResult<()> {
        if !video.is_file() {
            return Err(ChannelError::Io {
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
                path: video.to_path_buf(),
            });
        }
        debug!(channel = channel.id, video = %video.display(), "sending video");
        let body = json!({
            "path": video.to_string_lossy(),
            "caption": caption,
            "supports_streaming": true,
        });
        let request = self.post(
            &format!("channels/{}/messages", channel.id),
            &body,
            self.upload_timeout,
        )?;
        self.send(request, None).await.map(|_| ())
    }
}
