mod error;
mod gateway;
mod handle;

use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub use error::{ChannelError, ChannelResult};
pub use gateway::{classify_failure, GatewayClient};
pub use handle::{
    generate_handle, generate_handle_with, slugify, ChannelHandle, MAX_BASE_LEN, MIN_BASE_LEN,
};

pub const DEFAULT_HANDLE_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelRef {
    pub id: i64,
    pub title: String,
}

/// Operations the pipeline needs from the messaging platform.
#[async_trait]
pub trait ChannelClient: Send + Sync {
    async fn create_channel(&self, title: &str, about: &str) -> ChannelResult<ChannelRef>;

    /// Fails with [`ChannelError::HandleOccupied`] when the handle is taken.
    async fn assign_handle(&self, channel: &ChannelRef, handle: &str) -> ChannelResult<()>;

    async fn set_photo(&self, channel: &ChannelRef, image: &Path) -> ChannelResult<()>;

    async fn send_video(&self, channel: &ChannelRef, video: &Path, caption: &str)
        -> ChannelResult<()>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "visibility", content = "handle")]
pub enum ChannelVisibility {
    Private,
    Public(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct ProvisionedChannel {
    pub reference: ChannelRef,
    pub visibility: ChannelVisibility,
}

impl ProvisionedChannel {
    pub fn handle(&self) -> Option<&str> {
        match &self.visibility {
            ChannelVisibility::Public(handle) => Some(handle),
            ChannelVisibility::Private => None,
        }
    }

    pub fn link(&self) -> Option<String> {
        self.handle().map(|handle| format!("https://t.me/{handle}"))
    }
}

pub fn about_text(display_name: &str) -> String {
    format!("This is {display_name} anime channel")
}

/// Creates a broadcast channel and tries to make it public.
pub struct ChannelProvisioner<'a> {
    client: &'a dyn ChannelClient,
    handle_attempts: u32,
}

impl<'a> ChannelProvisioner<'a> {
    pub fn new(client: &'a dyn ChannelClient) -> Self {
        Self {
            client,
            handle_attempts: DEFAULT_HANDLE_ATTEMPTS,
        }
    }

    pub fn with_handle_attempts(mut self, attempts: u32) -> Self {
        self.handle_attempts = attempts.max(1);
        self
    }

    pub async fn provision(&self, display_name: &str) -> ChannelResult<ProvisionedChannel> {
        let title = display_name.trim();
        if title.is_empty() {
            return Err(ChannelError::EmptyName);
        }
        let reference = self
            .client
            .create_channel(title, &about_text(title))
            .await
            .map_err(|err| match err {
                ChannelError::Creation(_) => err,
                other => ChannelError::Creation(other.to_string()),
            })?;
        info!(channel = reference.id, title, "channel created");

        let visibility = self.assign_public_handle(&reference, title).await;
        Ok(ProvisionedChannel {
            reference,
            visibility,
        })
    }

    async fn assign_public_handle(&self, channel: &ChannelRef, title: &str) -> ChannelVisibility {
        let mut handle = generate_handle(title);
        for attempt in 1..=self.handle_attempts {
            let rendered = handle.to_string();
            match self.client.assign_handle(channel, &rendered).await {
                Ok(()) => {
                    info!(channel = channel.id, handle = %rendered, "channel is public");
                    return ChannelVisibility::Public(rendered);
                }
                Err(ChannelError::HandleOccupied { .. }) => {
                    warn!(attempt, handle = %rendered, "handle taken, regenerating");
                    handle = handle.regenerate(&mut rand::thread_rng());
                }
                Err(err) => {
                    warn!(channel = channel.id, error = %err, "could not set handle, channel stays private");
                    return ChannelVisibility::Private;
                }
            }
        }
        warn!(
            channel = channel.id,
            attempts = self.handle_attempts,
            "no free handle found, channel stays private"
        );
        ChannelVisibility::Private
    }
}
