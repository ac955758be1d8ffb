use std::fmt;
use std::io;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("{program} is not installed or not on PATH")]
    NotFound { program: String },
    #[error("failed to run {program}: {source}")]
    Spawn { program: String, source: io::Error },
    #[error("{program} timed out after {timeout:?}")]
    Timeout { program: String, timeout: Duration },
}

pub type ProcessResult<T> = Result<T, ProcessError>;

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).trim().to_string()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_string()
    }
}

/// Runs an external program to completion or until `timeout` elapses.
///
/// Implementations must not leave the child running once the call returns.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        timeout: Duration,
    ) -> ProcessResult<CommandOutput>;
}

pub struct SystemCommandExecutor;

#[async_trait]
impl CommandExecutor for SystemCommandExecutor {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        timeout: Duration,
    ) -> ProcessResult<CommandOutput> {
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| spawn_error(program, source))?;

        // Dropping the future on timeout drops the child, which kills it.
        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => Ok(CommandOutput {
                status: output.status,
                stdout: output.stdout,
                stderr: output.stderr,
            }),
            Ok(Err(source)) => Err(ProcessError::Spawn {
                program: program.to_string(),
                source,
            }),
            Err(_) => Err(ProcessError::Timeout {
                program: program.to_string(),
                timeout,
            }),
        }
    }
}

impl fmt::Debug for SystemCommandExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SystemCommandExecutor")
    }
}

fn spawn_error(program: &str, source: io::Error) -> ProcessError {
    if source.kind() == io::ErrorKind::NotFound {
        ProcessError::NotFound {
            program: program.to_string(),
        }
    } else {
        ProcessError::Spawn {
            program: program.to_string(),
            source,
        }
    }
}

/// Capability probe: true when `program <flag>` runs and exits zero.
pub async fn probe(executor: &dyn CommandExecutor, program: &str, flag: &str) -> bool {
    match executor
        .run(program, &[flag.to_string()], Duration::from_secs(15))
        .await
    {
        Ok(output) => output.success(),
        Err(err) => {
            debug!(program, error = %err, "capability probe failed");
            false
        }
    }
}

/// Executable name without directory or `.exe`, for kill-by-name.
pub fn tool_name(program: &str) -> String {
    std::path::Path::new(program)
        .file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .unwrap_or_else(|| program.to_string())
}

/// Best-effort kill of any lingering process with the given executable name.
pub async fn terminate_by_name(executor: &dyn CommandExecutor, name: &str) {
    let (program, args) = if cfg!(windows) {
        (
            "taskkill",
            vec!["/F".to_string(), "/IM".to_string(), format!("{name}.exe")],
        )
    } else {
        ("pkill", vec!["-x".to_string(), name.to_string()])
    };
    match executor.run(program, &args, Duration::from_secs(10)).await {
        Ok(output) => debug!(name, status = ?output.status, "terminate by name finished"),
        Err(err) => debug!(name, error = %err, "terminate by name failed"),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use super::*;

    #[cfg(unix)]
    use std::os::unix::process::ExitStatusExt;
    #[cfg(windows)]
    use std::os::windows::process::ExitStatusExt;

    pub(crate) type RecordedCalls = Arc<Mutex<Vec<(String, Vec<String>)>>>;
    type Responder = Box<dyn Fn(&str, &[String]) -> ProcessResult<CommandOutput> + Send + Sync>;

    /// Records every call and answers from a queue, falling back to `default`.
    pub(crate) struct ScriptedExecutor {
        pub(crate) calls: RecordedCalls,
        queue: Mutex<VecDeque<Responder>>,
        default: Responder,
    }

    impl ScriptedExecutor {
        pub(crate) fn new<F>(default: F) -> Self
        where
            F: Fn(&str, &[String]) -> ProcessResult<CommandOutput> + Send + Sync + 'static,
        {
            Self {
                calls: Arc::new(Mutex::new(Vec::new())),
                queue: Mutex::new(VecDeque::new()),
                default: Box::new(default),
            }
        }

        pub(crate) fn push<F>(&self, responder: F)
        where
            F: Fn(&str, &[String]) -> ProcessResult<CommandOutput> + Send + Sync + 'static,
        {
            self.queue.lock().unwrap().push_back(Box::new(responder));
        }
    }

    #[async_trait]
    impl CommandExecutor for ScriptedExecutor {
        async fn run(
            &self,
            program: &str,
            args: &[String],
            _timeout: Duration,
        ) -> ProcessResult<CommandOutput> {
            self.calls
                .lock()
                .unwrap()
                .push((program.to_string(), args.to_vec()));
            let next = self.queue.lock().unwrap().pop_front();
            match next {
                Some(responder) => responder(program, args),
                None => (self.default)(program, args),
            }
        }
    }

    pub(crate) fn exit(code: i32, stdout: &str) -> ProcessResult<CommandOutput> {
        #[cfg(unix)]
        let status = ExitStatus::from_raw(code << 8);
        #[cfg(windows)]
        let status = ExitStatus::from_raw(code as u32);
        Ok(CommandOutput {
            status,
            stdout: stdout.as_bytes().to_vec(),
            stderr: Vec::new(),
        })
    }
}
