pub mod channel;
pub mod config;
pub mod download;
pub mod error;
pub mod folders;
pub mod media;
pub mod metadata;
pub mod mux;
pub mod pipeline;
pub mod process;
pub mod publish;
pub mod retry;
pub mod upload;

pub use channel::{
    generate_handle, ChannelClient, ChannelError, ChannelHandle, ChannelProvisioner, ChannelRef,
    ChannelResult, ChannelVisibility, GatewayClient, ProvisionedChannel,
};
pub use config::{load_pipeline_config, PipelineConfig};
pub use download::{
    DownloadError, DownloadOptions, DownloadOrchestrator, DownloadReport, DownloadResult,
    MediaExtractor, YtDlpExtractor,
};
pub use error::{ConfigError, Result};
pub use folders::{relocate, scan_series_folders, FolderError, FolderState, SeriesFolder};
pub use media::{
    canonical_episode_name, classify, extract_episode_ordinal, match_pairs, AssetKind,
    MatchOutcome, MatchedPair, MediaAsset,
};
pub use metadata::{MetadataError, PosterClient};
pub use mux::{CombineReport, MuxError, MuxInvoker, MuxResult};
pub use pipeline::{
    EntryStage, Pipeline, PipelineError, PipelineReport, PipelineResult, Stage, StageReport,
};
pub use process::{CommandExecutor, CommandOutput, ProcessError, SystemCommandExecutor};
pub use publish::{PublishError, PublishReport, Publisher};
pub use retry::{Backoff, RetryPolicy};
pub use upload::{AssetUploader, UploadOutcome, UploadReport};
