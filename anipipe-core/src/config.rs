use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::{ConfigError, Result};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PipelineConfig {
    pub paths: PathsSection,
    pub tools: ToolsSection,
    pub download: DownloadSection,
    pub mux: MuxSection,
    pub publish: PublishSection,
    pub metadata: MetadataSection,
    #[serde(default)]
    pub pipeline: PipelineSection,
}

impl PipelineConfig {
    pub fn work_dir(&self) -> PathBuf {
        PathBuf::from(&self.paths.work_dir)
    }

    pub fn done_dir(&self) -> PathBuf {
        PathBuf::from(&self.paths.done_dir)
    }

    pub fn logs_dir(&self) -> PathBuf {
        PathBuf::from(&self.paths.logs_dir)
    }

    /// Rejects values that would make a retry loop or pacing range meaningless.
    pub fn validate(&self) -> Result<()> {
        if self.download.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                field: "download.max_attempts",
                reason: "must be greater than zero".into(),
            });
        }
        if self.download.resolution_ladder.is_empty() {
            return Err(ConfigError::Invalid {
                field: "download.resolution_ladder",
                reason: "must list at least one height".into(),
            });
        }
        if self.publish.upload_attempts == 0 {
            return Err(ConfigError::Invalid {
                field: "publish.upload_attempts",
                reason: "must be greater than zero".into(),
            });
        }
        let [min, max] = self.publish.pacing_seconds;
        if min > max {
            return Err(ConfigError::Invalid {
                field: "publish.pacing_seconds",
                reason: format!("lower bound {min} exceeds upper bound {max}"),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathsSection {
    pub work_dir: String,
    pub done_dir: String,
    pub logs_dir: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToolsSection {
    pub ffmpeg: String,
    pub ytdlp: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DownloadSection {
    pub max_attempts: u32,
    pub backoff_cap_seconds: u64,
    pub resolution_ladder: Vec<u32>,
    pub convert: bool,
    pub require_dub: bool,
    pub subtitle_langs: Vec<String>,
    pub subtitle_format: String,
    pub extract_timeout_seconds: u64,
    pub download_timeout_seconds: u64,
    pub transcode_timeout_seconds: u64,
    pub entry_delay_seconds: u64,
    pub concurrent_fragments: u32,
    pub fragment_retries: u32,
    pub user_agent: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MuxSection {
    pub timeout_seconds: u64,
    pub convert_timeout_seconds: u64,
    pub subtitle_language: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PublishSection {
    pub gateway_url: String,
    pub token_env: String,
    pub request_timeout_seconds: u64,
    pub upload_timeout_seconds: u64,
    pub upload_attempts: u32,
    pub upload_backoff_step_seconds: u64,
    pub pacing_seconds: [u64; 2],
    pub folder_delay_seconds: u64,
    pub handle_attempts: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetadataSection {
    pub enabled: bool,
    pub endpoint: String,
    pub timeout_seconds: u64,
    pub user_agent: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PipelineSection {
    pub post_hook: Option<String>,
    #[serde(default = "default_hook_timeout")]
    pub post_hook_timeout_seconds: u64,
}

fn default_hook_timeout() -> u64 {
    600
}

pub fn load_pipeline_config<P: AsRef<Path>>(path: P) -> Result<PipelineConfig> {
    let config: PipelineConfig = load_toml(path)?;
    config.validate()?;
    Ok(config)
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("../configs/anipipe.toml")
    }

    #[test]
    fn load_fixture_config() {
        let config = load_pipeline_config(fixture()).expect("config should parse");
        assert_eq!(config.tools.ffmpeg, "ffmpeg");
        assert_eq!(config.download.resolution_ladder, vec![360, 480, 720, 1080]);
        assert_eq!(config.download.backoff_cap_seconds, 60);
        assert_eq!(config.publish.upload_attempts, 3);
        assert_eq!(config.publish.pacing_seconds, [10, 30]);
        assert_eq!(config.mux.timeout_seconds, 300);
        assert!(config.pipeline.post_hook.is_none());
    }

    #[test]
    fn inverted_pacing_range_is_rejected() {
        let mut config = load_pipeline_config(fixture()).unwrap();
        config.publish.pacing_seconds = [30, 10];
        let err = config.validate().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "publish.pacing_seconds",
                ..
            }
        ));
    }

    #[test]
    fn missing_file_reports_path() {
        let err = load_pipeline_config("/nonexistent/anipipe.toml").unwrap_err();
        match err {
            ConfigError::Io { path, .. } => {
                assert_eq!(path, PathBuf::from("/nonexistent/anipipe.toml"))
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
