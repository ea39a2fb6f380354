/// Process reaper: force-terminates every process of the overlay application.
///
/// Termination is best effort and idempotent. After every attempt the reaper
/// waits a settle period so the OS can release file handles before anyone
/// re-checks the render output.
use std::time::Duration;

/// What a termination attempt found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// This many processes were signalled.
    Killed(usize),
    /// No matching process was running.
    NotRunning,
}

/// Narrow capability: forcefully terminate processes by executable name.
pub trait ProcessTerminator {
    async fn terminate(&self, process_name: &str) -> Result<Termination, ReapError>;
}

/// Errors from a termination attempt.
#[derive(Debug)]
pub enum ReapError {
    /// The lookup or kill command could not be started.
    Spawn {
        command: String,
        source: std::io::Error,
    },
    /// The kill command ran but reported failure.
    Failed { command: String, detail: String },
    /// Signalling a specific process failed.
    #[cfg(unix)]
    Signal { pid: i32, source: nix::Error },
}

impl std::fmt::Display for ReapError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReapError::Spawn { command, source } => {
                write!(f, "failed to run {command}: {source}")
            }
            ReapError::Failed { command, detail } => write!(f, "{command} failed: {detail}"),
            #[cfg(unix)]
            ReapError::Signal { pid, source } => {
                write!(f, "failed to kill process {pid}: {source}")
            }
        }
    }
}

impl std::error::Error for ReapError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ReapError::Spawn { source, .. } => Some(source),
            ReapError::Failed { .. } => None,
            #[cfg(unix)]
            ReapError::Signal { source, .. } => Some(source),
        }
    }
}

/// Finds processes with `pgrep -f` and sends each one SIGKILL.
#[cfg(unix)]
#[derive(Debug, Default, Clone, Copy)]
pub struct SignalTerminator;

#[cfg(unix)]
impl ProcessTerminator for SignalTerminator {
    async fn terminate(&self, process_name: &str) -> Result<Termination, ReapError> {
        use nix::errno::Errno;
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let output = tokio::process::Command::new("pgrep")
            .arg("-f")
            .arg(pgrep_pattern(process_name))
            .output()
            .await
            .map_err(|e| ReapError::Spawn {
                command: "pgrep".to_string(),
                source: e,
            })?;

        // pgrep exits 1 when nothing matched
        match output.status.code() {
            Some(0) => {}
            Some(1) => return Ok(Termination::NotRunning),
            _ => {
                return Err(ReapError::Failed {
                    command: "pgrep".to_string(),
                    detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
                })
            }
        }

        let pids = parse_pids(&String::from_utf8_lossy(&output.stdout), std::process::id());
        let mut killed = 0;
        for pid in pids {
            match kill(Pid::from_raw(pid), Signal::SIGKILL) {
                Ok(()) => {
                    tracing::debug!(pid, "sent SIGKILL");
                    killed += 1;
                }
                // Exited between pgrep and kill
                Err(Errno::ESRCH) => {}
                Err(e) => return Err(ReapError::Signal { pid, source: e }),
            }
        }

        if killed == 0 {
            Ok(Termination::NotRunning)
        } else {
            Ok(Termination::Killed(killed))
        }
    }
}

/// Extended regex matching `name` as the executable of a full command line:
/// preceded by the start or a path separator, followed by a space or the end.
/// A bare name would also match e.g. an editor or `tail` holding a file
/// whose name contains it.
#[cfg(unix)]
fn pgrep_pattern(name: &str) -> String {
    let mut escaped = String::with_capacity(name.len() * 2);
    for c in name.chars() {
        if r"\.[]()*+?{}|^$".contains(c) {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    format!(r"(^|[/\\]){escaped}( |$)")
}

/// Parse `pgrep` output into pids, skipping our own process.
#[cfg(unix)]
fn parse_pids(stdout: &str, own_pid: u32) -> Vec<i32> {
    stdout
        .lines()
        .filter_map(|line| line.trim().parse::<i32>().ok())
        .filter(|pid| u32::try_from(*pid).map_or(true, |p| p != own_pid))
        .collect()
}

/// Shells out to `taskkill /IM <name> /F`.
#[cfg(windows)]
#[derive(Debug, Default, Clone, Copy)]
pub struct TaskkillTerminator;

#[cfg(windows)]
impl ProcessTerminator for TaskkillTerminator {
    async fn terminate(&self, process_name: &str) -> Result<Termination, ReapError> {
        let output = tokio::process::Command::new("taskkill")
            .args(["/IM", process_name, "/F"])
            .output()
            .await
            .map_err(|e| ReapError::Spawn {
                command: "taskkill".to_string(),
                source: e,
            })?;

        if output.status.success() {
            return Ok(Termination::Killed(1));
        }
        let text = format!(
            "{}{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
        if text.contains("not found") {
            Ok(Termination::NotRunning)
        } else {
            Err(ReapError::Failed {
                command: "taskkill".to_string(),
                detail: text.trim().to_string(),
            })
        }
    }
}

/// The platform's default terminator.
#[cfg(unix)]
pub fn platform_terminator() -> SignalTerminator {
    SignalTerminator
}

#[cfg(windows)]
pub fn platform_terminator() -> TaskkillTerminator {
    TaskkillTerminator
}

/// Kills the configured application and waits for it to let go of its files.
pub struct Reaper<T> {
    terminator: T,
    process_name: String,
    settle: Duration,
}

impl<T: ProcessTerminator> Reaper<T> {
    pub fn new(terminator: T, process_name: impl Into<String>, settle: Duration) -> Self {
        Self {
            terminator,
            process_name: process_name.into(),
            settle,
        }
    }

    pub fn process_name(&self) -> &str {
        &self.process_name
    }

    /// Terminate the application. Never fails; always waits the settle period.
    pub async fn reap(&self) -> Termination {
        tracing::info!(process = %self.process_name, "killing application processes");

        let result = match self.terminator.terminate(&self.process_name).await {
            Ok(Termination::NotRunning) => {
                tracing::info!("no processes found (already closed)");
                Termination::NotRunning
            }
            Ok(Termination::Killed(count)) => {
                tracing::info!(count, "processes terminated");
                Termination::Killed(count)
            }
            Err(e) => {
                tracing::warn!(error = %e, "process termination reported a problem");
                Termination::NotRunning
            }
        };

        tokio::time::sleep(self.settle).await;
        result
    }
}
