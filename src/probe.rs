/// Duration probing: run an external media inspector against a file and
/// parse the single seconds value it prints.
use crate::config::ProbeConfig;
use std::path::Path;
use tokio::process::Command;

/// Something that can report the playable duration of a media file.
///
/// Every ordinary failure (missing file, tool error, junk output) is
/// `None`, so callers only distinguish "has duration" from "does not".
pub trait DurationProbe {
    async fn probe(&self, path: &Path) -> Option<f64>;
}

/// Probes with an external command, `ffprobe` by default.
#[derive(Debug, Clone)]
pub struct CommandProbe {
    command: String,
    args: Vec<String>,
}

impl CommandProbe {
    pub fn new(config: &ProbeConfig) -> Self {
        Self {
            command: config.command.clone(),
            args: config.args.clone(),
        }
    }
}

/// Build the command arguments, replacing `{path}` placeholders with the probed path.
fn build_args(args: &[String], path: &Path) -> Vec<String> {
    let path = path.to_string_lossy();
    args.iter().map(|arg| arg.replace("{path}", &path)).collect()
}

/// Parse probe output as seconds. Only finite values above zero count.
pub fn parse_duration(stdout: &str) -> Option<f64> {
    let secs = stdout.trim().parse::<f64>().ok()?;
    if secs.is_finite() && secs > 0.0 {
        Some(secs)
    } else {
        None
    }
}

impl DurationProbe for CommandProbe {
    async fn probe(&self, path: &Path) -> Option<f64> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "probe skipped, file missing");
            return None;
        }

        let output = match Command::new(&self.command)
            .args(build_args(&self.args, path))
            .kill_on_drop(true)
            .output()
            .await
        {
            Ok(o) => o,
            Err(e) => {
                tracing::warn!(
                    command = %self.command,
                    error = %e,
                    "failed to run duration probe"
                );
                return None;
            }
        };

        if !output.status.success() {
            tracing::warn!(
                command = %self.command,
                exit_code = ?output.status.code(),
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                path = %path.display(),
                "duration probe failed"
            );
            return None;
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let duration = parse_duration(&stdout);
        if duration.is_none() {
            tracing::warn!(
                output = %stdout.trim(),
                path = %path.display(),
                "duration probe returned no usable duration"
            );
        }
        duration
    }
}

/// Format seconds as `m:ss`.
pub fn format_duration(secs: f64) -> String {
    let whole = secs.max(0.0) as u64;
    format!("{}:{:02}", whole / 60, whole % 60)
}
