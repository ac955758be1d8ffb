use std::fs;
use std::io;
use std::path::PathBuf;

use anipipe_core::download::DownloadOptions;
use anipipe_core::pipeline::{PublishOutcome, StageOutcome};
use anipipe_core::{
    load_pipeline_config, CombineReport, DownloadReport, EntryStage, Pipeline, PipelineConfig,
    PipelineReport, StageReport,
};
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use serde::Serialize;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] anipipe_core::ConfigError),
    #[error("pipeline error: {0}")]
    Pipeline(#[from] anipipe_core::PipelineError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("work directory {0} does not exist")]
    MissingWorkDir(PathBuf),
    #[error("one or more stages failed")]
    StageFailure,
    #[error("{0} does not run the pipeline")]
    NoPipeline(&'static str),
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Download, subtitle and publish anime series", long_about = None)]
pub struct Cli {
    /// Path to anipipe.toml
    #[arg(long, global = true, default_value = "configs/anipipe.toml")]
    pub config: PathBuf,
    /// Overrides paths.work_dir
    #[arg(long, global = true)]
    pub work_dir: Option<PathBuf>,
    /// Overrides paths.done_dir
    #[arg(long, global = true)]
    pub done_dir: Option<PathBuf>,
    /// Run only the requested stage
    #[arg(long, global = true, default_value_t = false)]
    pub no_chain: bool,
    /// Output format
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Download an episode or playlist, then combine and publish
    Download {
        url: String,
        /// Re-encode to 480p H.264 (true/false/yes/no/1/0/y/n)
        #[arg(action = clap::ArgAction::Set, value_parser = parse_convert_flag, default_value = "true")]
        convert: bool,
        /// Skip content that does not look like an English dub
        #[arg(long, default_value_t = false)]
        require_dub: bool,
    },
    /// Embed subtitles in every series folder, then publish
    Combine,
    /// Create channels, upload episodes and move folders to done
    Publish,
    /// Full chain for one URL
    Run { url: String },
    /// Print shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

/// Anything other than an explicit no means yes.
pub fn parse_convert_flag(value: &str) -> std::result::Result<bool, String> {
    Ok(!matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "false" | "0" | "no" | "n"
    ))
}

pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .try_init();
}

pub async fn run(cli: Cli) -> Result<()> {
    if let Commands::Completions { shell } = &cli.command {
        clap_complete::generate(*shell, &mut Cli::command(), "anipipectl", &mut io::stdout());
        return Ok(());
    }

    let context = AppContext::new(&cli)?;
    let entry = context.entry_stage(&cli.command)?;
    let pipeline = Pipeline::standard(&context.config, entry, !cli.no_chain)?;
    tracing::info!(stages = ?pipeline.stage_names(), "pipeline assembled");
    let report = RunReport(pipeline.run().await);
    render(&report, cli.format)?;
    if !report.0.succeeded() {
        return Err(AppError::StageFailure);
    }
    Ok(())
}

fn render<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => {
            println!("{}", value.display());
            Ok(())
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{}", json);
            Ok(())
        }
    }
}

trait DisplayFallback {
    fn display(&self) -> String;
}

#[derive(Debug)]
struct AppContext {
    config: PipelineConfig,
}

impl AppContext {
    fn new(cli: &Cli) -> Result<Self> {
        let mut config = load_pipeline_config(&cli.config)?;
        if let Some(work_dir) = &cli.work_dir {
            config.paths.work_dir = work_dir.to_string_lossy().to_string();
        }
        if let Some(done_dir) = &cli.done_dir {
            config.paths.done_dir = done_dir.to_string_lossy().to_string();
        }
        Ok(Self { config })
    }

    /// Download creates the work directory; the later stages need it.
    fn entry_stage(&self, command: &Commands) -> Result<EntryStage> {
        let work_dir = self.config.work_dir();
        let entry = match command {
            Commands::Download {
                url,
                convert,
                require_dub,
            } => EntryStage::Download {
                url: url.clone(),
                options: DownloadOptions {
                    convert: *convert && self.config.download.convert,
                    require_dub: *require_dub || self.config.download.require_dub,
                },
            },
            Commands::Run { url } => EntryStage::Download {
                url: url.clone(),
                options: DownloadOptions {
                    convert: self.config.download.convert,
                    require_dub: self.config.download.require_dub,
                },
            },
            Commands::Combine => EntryStage::Combine,
            Commands::Publish => EntryStage::Publish,
            Commands::Completions { .. } => return Err(AppError::NoPipeline("completions")),
        };
        match entry {
            EntryStage::Download { .. } => {
                fs::create_dir_all(&work_dir)?;
            }
            _ if !work_dir.is_dir() => return Err(AppError::MissingWorkDir(work_dir)),
            _ => {}
        }
        Ok(entry)
    }
}

#[derive(Debug, Serialize)]
#[serde(transparent)]
struct RunReport(PipelineReport);

impl DisplayFallback for RunReport {
    fn display(&self) -> String {
        let mut lines = Vec::new();
        for stage in &self.0.stages {
            lines.extend(stage.display().lines().map(str::to_string));
        }
        if lines.is_empty() {
            return "Nothing to do".to_string();
        }
        lines.join("\n")
    }
}

impl DisplayFallback for StageOutcome {
    fn display(&self) -> String {
        match (&self.report, &self.error) {
            (_, Some(error)) => format!("[{}] FAILED: {error}", self.name),
            (Some(report), None) => report.display(),
            (None, None) => format!("[{}] ok", self.name),
        }
    }
}

impl DisplayFallback for StageReport {
    fn display(&self) -> String {
        match self {
            StageReport::Download(report) => report.display(),
            StageReport::Combine { folders } => {
                if folders.is_empty() {
                    return "[combine] no series folders".to_string();
                }
                folders
                    .iter()
                    .map(DisplayFallback::display)
                    .collect::<Vec<_>>()
                    .join("\n")
            }
            StageReport::Publish { folders } => {
                if folders.is_empty() {
                    return "[publish] no series folders".to_string();
                }
                folders
                    .iter()
                    .map(DisplayFallback::display)
                    .collect::<Vec<_>>()
                    .join("\n")
            }
            StageReport::Hook(hook) if !hook.ran => {
                format!("[hook] {} was not run", hook.command)
            }
            StageReport::Hook(hook) => format!(
                "[hook] {} exited with {}",
                hook.command,
                hook.status
                    .map(|code| code.to_string())
                    .unwrap_or_else(|| "signal".to_string())
            ),
        }
    }
}

impl DisplayFallback for DownloadReport {
    fn display(&self) -> String {
        let mut lines = vec![format!(
            "[download] {}: {} file(s) from {} entr{}",
            self.url,
            self.files.len(),
            self.entries,
            if self.entries == 1 { "y" } else { "ies" }
        )];
        for file in &self.files {
            lines.push(format!("  + {}", file.display()));
        }
        for failed in &self.failed {
            lines.push(format!("  ! {failed}"));
        }
        lines.join("\n")
    }
}

impl DisplayFallback for CombineReport {
    fn display(&self) -> String {
        let name = self
            .folder
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();
        let mut lines = vec![format!(
            "[combine] {name}: {} combined, {} failed, {} unmatched",
            self.combined.len(),
            self.failed.len(),
            self.unmatched.len()
        )];
        for failed in &self.failed {
            lines.push(format!("  ! {}: {}", failed.video.display(), failed.error));
        }
        lines.join("\n")
    }
}

impl DisplayFallback for PublishOutcome {
    fn display(&self) -> String {
        let Some(report) = &self.report else {
            return format!(
                "[publish] {}: FAILED: {}",
                self.series,
                self.error.as_deref().unwrap_or("unknown error")
            );
        };
        let link = report.link.as_deref().unwrap_or("private");
        let mut lines = vec![format!(
            "[publish] {}: {}/{} uploaded ({link})",
            self.series,
            report.uploads.uploaded_count(),
            report.uploads.total
        )];
        for skipped in report.uploads.skipped() {
            lines.push(format!("  ! {}", skipped.path.display()));
        }
        match &report.relocated_to {
            Some(path) => lines.push(format!("  -> {}", path.display())),
            None => lines.push("  folder left in place".to_string()),
        }
        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn cli(args: &[&str]) -> Cli {
        let mut argv = vec!["anipipectl", "--config", "../configs/anipipe.toml"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).unwrap()
    }

    #[test]
    fn convert_flag_accepts_common_spellings() {
        for no in ["false", "0", "no", "n", "NO", " False "] {
            assert_eq!(parse_convert_flag(no), Ok(false), "{no}");
        }
        for yes in ["true", "1", "yes", "y", "whatever"] {
            assert_eq!(parse_convert_flag(yes), Ok(true), "{yes}");
        }
    }

    #[test]
    fn download_defaults_to_converting() {
        match cli(&["download", "https://site/show"]).command {
            Commands::Download { convert, .. } => assert!(convert),
            other => panic!("unexpected command: {other:?}"),
        }
        match cli(&["download", "https://site/show", "no"]).command {
            Commands::Download { convert, .. } => assert!(!convert),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn global_flags_follow_the_subcommand() {
        let parsed = cli(&["combine", "--no-chain", "--format", "json"]);
        assert!(parsed.no_chain);
        assert!(matches!(parsed.format, OutputFormat::Json));
    }

    #[test]
    fn overrides_replace_configured_paths() {
        let temp = TempDir::new().unwrap();
        let work = temp.path().join("new");
        let parsed = cli(&["--work-dir", work.to_str().unwrap(), "combine"]);
        let context = AppContext::new(&parsed).unwrap();
        assert_eq!(context.config.work_dir(), work);
    }

    #[test]
    fn combine_requires_an_existing_work_dir() {
        let temp = TempDir::new().unwrap();
        let work = temp.path().join("absent");
        let parsed = cli(&["--work-dir", work.to_str().unwrap(), "combine"]);
        let context = AppContext::new(&parsed).unwrap();
        let err = context.entry_stage(&parsed.command).unwrap_err();
        assert!(matches!(err, AppError::MissingWorkDir(_)));
    }

    #[test]
    fn command_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn explicit_convert_value_is_positional() {
        match cli(&["download", "https://site/show", "false", "--require-dub"]).command {
            Commands::Download {
                url,
                convert,
                require_dub,
            } => {
                assert_eq!(url, "https://site/show");
                assert!(!convert);
                assert!(require_dub);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn completions_have_no_entry_stage() {
        let parsed = cli(&["completions", "bash"]);
        let context = AppContext::new(&parsed).unwrap();
        let err = context.entry_stage(&parsed.command).unwrap_err();
        assert!(matches!(err, AppError::NoPipeline("completions")));
    }

    #[test]
    fn download_creates_the_work_dir() {
        let temp = TempDir::new().unwrap();
        let work = temp.path().join("new");
        let parsed = cli(&["--work-dir", work.to_str().unwrap(), "download", "https://x", "0"]);
        let context = AppContext::new(&parsed).unwrap();
        match context.entry_stage(&parsed.command).unwrap() {
            EntryStage::Download { options, .. } => assert!(!options.convert),
            other => panic!("unexpected entry: {other:?}"),
        }
        assert!(work.is_dir());
    }

    #[tokio::test]
    async fn combining_an_empty_work_dir_succeeds() {
        let temp = TempDir::new().unwrap();
        let work = temp.path().join("new");
        fs::create_dir_all(&work).unwrap();
        let parsed = cli(&["--work-dir", work.to_str().unwrap(), "combine", "--no-chain"]);
        run(parsed).await.unwrap();
    }

    #[test]
    fn run_report_renders_as_json() {
        let report = RunReport(PipelineReport::default());
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["stages"], serde_json::json!([]));
        assert_eq!(report.display(), "Nothing to do");
    }
}
