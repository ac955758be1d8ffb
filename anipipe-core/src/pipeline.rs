//! Stage composition: download, combine and publish run in order, each
//! picking up the filesystem state its predecessor left behind.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::channel::{ChannelClient, ChannelError, GatewayClient};
use crate::config::{PipelineConfig, PublishSection};
use crate::download::{DownloadError, DownloadOptions, DownloadOrchestrator, DownloadReport};
use crate::error::ConfigError;
use crate::folders::{scan_series_folders, FolderError};
use crate::metadata::{MetadataError, PosterClient};
use crate::mux::{CombineReport, MuxError, MuxInvoker};
use crate::process::{CommandExecutor, ProcessError, SystemCommandExecutor};
use crate::publish::{PublishReport, Publisher};
use crate::upload::AssetUploader;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Folder(#[from] FolderError),
    #[error(transparent)]
    Download(#[from] DownloadError),
    #[error(transparent)]
    Mux(#[from] MuxError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Metadata(#[from] MetadataError),
    #[error(transparent)]
    Process(#[from] ProcessError),
}

pub type PipelineResult<T> = Result<T, PipelineError>;

#[derive(Debug, Serialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum StageReport {
    Download(DownloadReport),
    Combine { folders: Vec<CombineReport> },
    Publish { folders: Vec<PublishOutcome> },
    Hook(HookReport),
}

#[derive(Debug, Serialize)]
pub struct PublishOutcome {
    pub series: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<PublishReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct HookReport {
    pub command: String,
    pub ran: bool,
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self) -> PipelineResult<StageReport>;
}

pub struct DownloadStage {
    orchestrator: DownloadOrchestrator,
    url: String,
    options: DownloadOptions,
}

impl DownloadStage {
    pub fn new(orchestrator: DownloadOrchestrator, url: impl Into<String>, options: DownloadOptions) -> Self {
        Self {
            orchestrator,
            url: url.into(),
            options,
        }
    }
}

#[async_trait]
impl Stage for DownloadStage {
    fn name(&self) -> &'static str {
        "download"
    }

    async fn run(&self) -> PipelineResult<StageReport> {
        let report = self.orchestrator.download_url(&self.url, self.options).await?;
        Ok(StageReport::Download(report))
    }
}

pub struct CombineStage {
    invoker: MuxInvoker,
    work_dir: PathBuf,
}

impl CombineStage {
    pub fn new(invoker: MuxInvoker, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            invoker,
            work_dir: work_dir.into(),
        }
    }
}

#[async_trait]
impl Stage for CombineStage {
    fn name(&self) -> &'static str {
        "combine"
    }

    async fn run(&self) -> PipelineResult<StageReport> {
        let mut folders = Vec::new();
        for folder in scan_series_folders(&self.work_dir)? {
            match self.invoker.combine_folder(&folder.path).await {
                Ok(report) => folders.push(report),
                Err(err) => warn!(series = %folder.name, error = %err, "combine failed"),
            }
        }
        Ok(StageReport::Combine { folders })
    }
}

pub struct PublishStage {
    client: Arc<dyn ChannelClient>,
    posters: Option<PosterClient>,
    config: PublishSection,
    work_dir: PathBuf,
    done_dir: PathBuf,
}

impl PublishStage {
    pub fn new(
        client: Arc<dyn ChannelClient>,
        config: PublishSection,
        work_dir: impl Into<PathBuf>,
        done_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            client,
            posters: None,
            config,
            work_dir: work_dir.into(),
            done_dir: done_dir.into(),
        }
    }

    pub fn with_posters(mut self, posters: PosterClient) -> Self {
        self.posters = Some(posters);
        self
    }
}

#[async_trait]
impl Stage for PublishStage {
    fn name(&self) -> &'static str {
        "publish"
    }

    async fn run(&self) -> PipelineResult<StageReport> {
        let uploader = AssetUploader::from_config(self.client.as_ref(), &self.config)?;
        let mut publisher = Publisher::new(self.client.as_ref(), uploader, &self.done_dir)
            .with_handle_attempts(self.config.handle_attempts);
        if let Some(posters) = &self.posters {
            publisher = publisher.with_posters(posters);
        }
        let folder_delay = Duration::from_secs(self.config.folder_delay_seconds);

        let folders = scan_series_folders(&self.work_dir)?;
        let total = folders.len();
        let mut outcomes = Vec::with_capacity(total);
        for (index, mut folder) in folders.into_iter().enumerate() {
            let outcome = match publisher.publish_folder(&mut folder).await {
                Ok(report) => PublishOutcome {
                    series: folder.name.clone(),
                    report: Some(report),
                    error: None,
                },
                Err(err) => {
                    error!(series = %folder.name, error = %err, "publish failed");
                    PublishOutcome {
                        series: folder.name.clone(),
                        report: None,
                        error: Some(err.to_string()),
                    }
                }
            };
            outcomes.push(outcome);
            if index + 1 < total && !folder_delay.is_zero() {
                sleep(folder_delay).await;
            }
        }
        Ok(StageReport::Publish { folders: outcomes })
    }
}

/// Runs an external program after the last stage and re-logs its output. A
/// missing program is reported, not raised.
pub struct HookStage {
    command: String,
    timeout: Duration,
    executor: Arc<dyn CommandExecutor>,
}

impl HookStage {
    pub fn new(command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            timeout,
            executor: Arc::new(SystemCommandExecutor),
        }
    }

    pub fn with_executor(mut self, executor: Arc<dyn CommandExecutor>) -> Self {
        self.executor = executor;
        self
    }
}

#[async_trait]
impl Stage for HookStage {
    fn name(&self) -> &'static str {
        "hook"
    }

    async fn run(&self) -> PipelineResult<StageReport> {
        let mut parts = self.command.split_whitespace();
        let program = parts.next().unwrap_or_default().to_string();
        let args: Vec<String> = parts.map(str::to_string).collect();
        let mut report = HookReport {
            command: self.command.clone(),
            ran: false,
            status: None,
            stdout: String::new(),
            stderr: String::new(),
        };
        if program.is_empty() {
            warn!("post hook is empty, skipping");
            return Ok(StageReport::Hook(report));
        }

        match self.executor.run(&program, &args, self.timeout).await {
            Ok(output) => {
                report.ran = true;
                report.status = output.status.code();
                report.stdout = output.stdout_lossy();
                report.stderr = output.stderr_lossy();
                for line in report.stdout.lines() {
                    info!(hook = %program, "{line}");
                }
                for line in report.stderr.lines() {
                    warn!(hook = %program, "{line}");
                }
                Ok(StageReport::Hook(report))
            }
            Err(ProcessError::NotFound { .. }) => {
                warn!(hook = %program, "post hook not found");
                Ok(StageReport::Hook(report))
            }
            Err(err) => Err(err.into()),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct StageOutcome {
    pub name: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<StageReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Default, Serialize)]
pub struct PipelineReport {
    pub stages: Vec<StageOutcome>,
}

impl PipelineReport {
    pub fn succeeded(&self) -> bool {
        self.stages.iter().all(|stage| stage.error.is_none())
    }
}

/// Where a run enters the stage sequence.
#[derive(Debug, Clone)]
pub enum EntryStage {
    Download { url: String, options: DownloadOptions },
    Combine,
    Publish,
}

#[derive(Default)]
pub struct Pipeline {
    stages: Vec<Box<dyn Stage>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stage(mut self, stage: impl Stage + 'static) -> Self {
        self.stages.push(Box::new(stage));
        self
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|stage| stage.name()).collect()
    }

    /// The production stage list: from `entry` to publish when `chain` is
    /// set, only `entry` otherwise, then the post hook if configured.
    pub fn standard(config: &PipelineConfig, entry: EntryStage, chain: bool) -> PipelineResult<Self> {
        let mut pipeline = Pipeline::new();
        let (download, combine, publish) = match (&entry, chain) {
            (EntryStage::Download { .. }, true) => (true, true, true),
            (EntryStage::Download { .. }, false) => (true, false, false),
            (EntryStage::Combine, true) => (false, true, true),
            (EntryStage::Combine, false) => (false, true, false),
            (EntryStage::Publish, _) => (false, false, true),
        };

        if let (true, EntryStage::Download { url, options }) = (download, &entry) {
            let orchestrator = DownloadOrchestrator::new(config)?;
            pipeline = pipeline.with_stage(DownloadStage::new(orchestrator, url.clone(), *options));
        }
        if combine {
            let invoker = MuxInvoker::new(&config.tools, &config.mux);
            pipeline = pipeline.with_stage(CombineStage::new(invoker, config.work_dir()));
        }
        if publish {
            let client: Arc<dyn ChannelClient> = Arc::new(GatewayClient::from_config(&config.publish)?);
            let mut stage = PublishStage::new(
                client,
                config.publish.clone(),
                config.work_dir(),
                config.done_dir(),
            );
            if config.metadata.enabled {
                stage = stage.with_posters(PosterClient::new(&config.metadata)?);
            }
            pipeline = pipeline.with_stage(stage);
        }
        if let Some(hook) = &config.pipeline.post_hook {
            pipeline = pipeline.with_stage(HookStage::new(
                hook.clone(),
                Duration::from_secs(config.pipeline.post_hook_timeout_seconds),
            ));
        }
        Ok(pipeline)
    }

    /// Runs every stage in order. A failing stage is recorded and the next
    /// one still runs against whatever is on disk.
    pub async fn run(&self) -> PipelineReport {
        let mut report = PipelineReport::default();
        for stage in &self.stages {
            info!(stage = stage.name(), "stage started");
            let outcome = match stage.run().await {
                Ok(stage_report) => {
                    info!(stage = stage.name(), "stage finished");
                    StageOutcome {
                        name: stage.name(),
                        report: Some(stage_report),
                        error: None,
                    }
                }
                Err(err) => {
                    error!(stage = stage.name(), error = %err, "stage failed");
                    StageOutcome {
                        name: stage.name(),
                        report: None,
                        error: Some(err.to_string()),
                    }
                }
            };
            report.stages.push(outcome);
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::load_pipeline_config;
    use crate::process::testing::{exit, ScriptedExecutor};
    use std::path::Path;
    use std::sync::Mutex;

    struct Recording {
        name: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
        fail: bool,
    }

    #[async_trait]
    impl Stage for Recording {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn run(&self) -> PipelineResult<StageReport> {
            self.log.lock().unwrap().push(self.name);
            if self.fail {
                return Err(FolderError::Missing(PathBuf::from(self.name)).into());
            }
            Ok(StageReport::Combine { folders: vec![] })
        }
    }

    fn config() -> PipelineConfig {
        load_pipeline_config(Path::new(env!("CARGO_MANIFEST_DIR")).join("../configs/anipipe.toml"))
            .unwrap()
    }

    #[tokio::test]
    async fn failing_stage_does_not_stop_the_rest() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let stage = |name, fail| Recording {
            name,
            log: Arc::clone(&log),
            fail,
        };
        let pipeline = Pipeline::new()
            .with_stage(stage("download", true))
            .with_stage(stage("combine", false))
            .with_stage(stage("publish", false));

        let report = pipeline.run().await;

        assert_eq!(*log.lock().unwrap(), vec!["download", "combine", "publish"]);
        assert!(!report.succeeded());
        assert!(report.stages[0].error.is_some());
        assert!(report.stages[1].error.is_none());
    }

    #[test]
    fn chaining_decides_the_stage_list() {
        let config = config();
        let download = EntryStage::Download {
            url: "https://site/x".into(),
            options: DownloadOptions {
                convert: true,
                require_dub: false,
            },
        };
        assert_eq!(
            Pipeline::standard(&config, download.clone(), true).unwrap().stage_names(),
            vec!["download", "combine", "publish"]
        );
        assert_eq!(
            Pipeline::standard(&config, download, false).unwrap().stage_names(),
            vec!["download"]
        );
        assert_eq!(
            Pipeline::standard(&config, EntryStage::Combine, true).unwrap().stage_names(),
            vec!["combine", "publish"]
        );
        assert_eq!(
            Pipeline::standard(&config, EntryStage::Publish, true).unwrap().stage_names(),
            vec!["publish"]
        );
    }

    #[test]
    fn configured_hook_runs_last() {
        let mut config = config();
        config.pipeline.post_hook = Some("notify-send done".into());
        assert_eq!(
            Pipeline::standard(&config, EntryStage::Combine, false).unwrap().stage_names(),
            vec!["combine", "hook"]
        );
    }

    #[tokio::test]
    async fn missing_hook_is_reported_not_raised() {
        let executor = Arc::new(ScriptedExecutor::new(|program, _| {
            Err(ProcessError::NotFound {
                program: program.to_string(),
            })
        }));
        let stage = HookStage::new("archive-sync --all", Duration::from_secs(5)).with_executor(executor);

        match stage.run().await.unwrap() {
            StageReport::Hook(report) => assert!(!report.ran),
            other => panic!("unexpected report: {other:?}"),
        }
    }

    #[tokio::test]
    async fn hook_output_is_captured() {
        let executor = Arc::new(ScriptedExecutor::new(|_, _| exit(0, "synced 3 folders")));
        let stage = HookStage::new("archive-sync --all", Duration::from_secs(5))
            .with_executor(Arc::clone(&executor) as Arc<dyn CommandExecutor>);

        match stage.run().await.unwrap() {
            StageReport::Hook(report) => {
                assert!(report.ran);
                assert_eq!(report.status, Some(0));
                assert_eq!(report.stdout, "synced 3 folders");
            }
            other => panic!("unexpected report: {other:?}"),
        }
        let calls = executor.calls.lock().unwrap();
        assert_eq!(calls[0].0, "archive-sync");
        assert_eq!(calls[0].1, vec!["--all"]);
    }
}
