/// Export driver: the operator's UI-automation script that opens a source
/// video in the overlay application, saves the project, and clicks export.
///
/// The driver only has to start the export. Completion is judged by the
/// render monitor from the output file alone.
use crate::config::DriverConfig;
use crate::videos::VideoJob;
use std::io::{Read, Seek, SeekFrom};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

/// Starts the application's export for one video.
pub trait ExportDriver {
    async fn start_export(&self, job: &VideoJob) -> Result<(), DriverError>;
}

/// Errors from running the driver.
#[derive(Debug)]
pub enum DriverError {
    /// `[driver] command` is empty.
    NotConfigured,
    /// The driver process could not be started.
    Spawn {
        command: String,
        source: std::io::Error,
    },
    /// Capturing the driver's output or waiting for it failed.
    Io {
        command: String,
        source: std::io::Error,
    },
    /// The driver did not exit within `[driver] timeout_ms`.
    TimedOut { command: String, timeout: Duration },
    /// The driver exited unsuccessfully.
    Failed {
        command: String,
        exit_code: Option<i32>,
        stderr: String,
    },
}

impl std::fmt::Display for DriverError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DriverError::NotConfigured => write!(f, "no export driver configured ([driver] command)"),
            DriverError::Spawn { command, source } => {
                write!(f, "failed to spawn export driver '{command}': {source}")
            }
            DriverError::Io { command, source } => {
                write!(f, "I/O error running export driver '{command}': {source}")
            }
            DriverError::TimedOut { command, timeout } => write!(
                f,
                "export driver '{command}' did not exit within {}ms",
                timeout.as_millis()
            ),
            DriverError::Failed {
                command,
                exit_code,
                stderr,
            } => {
                match exit_code {
                    Some(code) => write!(f, "export driver '{command}' exited with code {code}")?,
                    None => write!(f, "export driver '{command}' was killed by a signal")?,
                }
                if !stderr.is_empty() {
                    write!(f, ": {stderr}")?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for DriverError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DriverError::Spawn { source, .. } | DriverError::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Runs the configured driver command and waits for it to exit. Processes
/// the driver leaves running in the background are not waited for.
#[derive(Debug, Clone)]
pub struct CommandDriver {
    command: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandDriver {
    pub fn new(config: &DriverConfig) -> Self {
        Self {
            command: config.command.clone(),
            args: config.args.clone(),
            timeout: config.timeout(),
        }
    }
}

/// Read back everything written to a capture file. Unreadable output is
/// treated as empty.
fn read_capture(file: &mut std::fs::File) -> String {
    let mut buf = Vec::new();
    if file.seek(SeekFrom::Start(0)).is_ok() {
        let _ = file.read_to_end(&mut buf);
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// Replace `{input}`, `{output}` and `{project}` in each argument.
fn build_args(args: &[String], job: &VideoJob) -> Vec<String> {
    let input = job.source.to_string_lossy();
    let output = job.output.to_string_lossy();
    let project = job.project.to_string_lossy();
    args.iter()
        .map(|arg| {
            arg.replace("{input}", &input)
                .replace("{output}", &output)
                .replace("{project}", &project)
        })
        .collect()
}

impl ExportDriver for CommandDriver {
    async fn start_export(&self, job: &VideoJob) -> Result<(), DriverError> {
        if self.command.trim().is_empty() {
            return Err(DriverError::NotConfigured);
        }

        tracing::info!(
            command = %self.command,
            input = %job.source.display(),
            output = %job.output.display(),
            "starting export driver"
        );

        // Output goes to anonymous files, not pipes. The driver usually
        // launches the application in the background, and that process
        // inherits the handles; with pipes we would wait for it to exit too.
        let capture_err = |e| DriverError::Io {
            command: self.command.clone(),
            source: e,
        };
        let mut stdout_file = tempfile::tempfile().map_err(capture_err)?;
        let mut stderr_file = tempfile::tempfile().map_err(capture_err)?;

        let mut child = Command::new(&self.command)
            .args(build_args(&self.args, job))
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout_file.try_clone().map_err(capture_err)?))
            .stderr(Stdio::from(stderr_file.try_clone().map_err(capture_err)?))
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| DriverError::Spawn {
                command: self.command.clone(),
                source: e,
            })?;

        let status = match tokio::time::timeout(self.timeout, child.wait()).await {
            Ok(status) => status.map_err(capture_err)?,
            Err(_) => {
                tracing::warn!(
                    command = %self.command,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "export driver did not exit in time, killing it"
                );
                let _ = child.kill().await;
                return Err(DriverError::TimedOut {
                    command: self.command.clone(),
                    timeout: self.timeout,
                });
            }
        };

        let stdout = read_capture(&mut stdout_file);
        for line in stdout.lines().filter(|l| !l.trim().is_empty()) {
            tracing::debug!(line, "driver");
        }

        if !status.success() {
            return Err(DriverError::Failed {
                command: self.command.clone(),
                exit_code: status.code(),
                stderr: read_capture(&mut stderr_file).trim().to_string(),
            });
        }

        tracing::info!("export started");
        Ok(())
    }
}
