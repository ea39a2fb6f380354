/// One attempt at one video: clear the cache, start the export, watch the
/// render, recover or verify, then close the application and clear the cache
/// again.
///
/// The attempt never touches the ledger. The batch loop marks a video only
/// when the attempt comes back [`AttemptResult::Processed`].
use crate::config::RenderwatchConfig;
use crate::driver::{DriverError, ExportDriver};
use crate::monitor::{
    format_size, FsObserver, MonitorError, RenderMonitor, RenderOutcome, SizeObserver,
};
use crate::probe::{format_duration, DurationProbe};
use crate::reaper::{ProcessTerminator, Reaper};
use crate::signals::ShutdownSignal;
use crate::videos::VideoJob;
use std::path::{Path, PathBuf};

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Why a settled render was not accepted. All of these leave the video
/// unprocessed and are retry eligible.
#[derive(Debug, Clone, PartialEq)]
pub enum Rejection {
    /// Render settled but its duration could not be probed.
    RenderUnverified,
    /// Output duration is not within tolerance of the source.
    DurationMismatch { source_secs: f64, output_secs: f64 },
    /// Source or output duration is unknown, so they cannot be compared.
    DurationUnknown,
    /// Output is not smaller than `max_file_size_gb`.
    TooLarge { size: u64, limit_gb: f64 },
    /// Output vanished between settling and verification.
    OutputMissing,
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Rejection::RenderUnverified => write!(f, "render completed but duration check failed"),
            Rejection::DurationMismatch {
                source_secs,
                output_secs,
            } => write!(
                f,
                "duration mismatch: source {} vs output {} ({:.1}s apart)",
                format_duration(*source_secs),
                format_duration(*output_secs),
                (source_secs - output_secs).abs()
            ),
            Rejection::DurationUnknown => {
                write!(f, "could not compare durations, one of them is unknown")
            }
            Rejection::TooLarge { size, limit_gb } => write!(
                f,
                "output is {} which is not under the {limit_gb} GB limit",
                format_size(*size)
            ),
            Rejection::OutputMissing => write!(f, "output file not found after render"),
        }
    }
}

/// Hard failures of an attempt.
#[derive(Debug)]
pub enum AttemptError {
    /// Source video could not be read.
    Source {
        path: PathBuf,
        source: std::io::Error,
    },
    /// A leftover output could not be moved out of the way.
    StaleOutput {
        path: PathBuf,
        source: std::io::Error,
    },
    Driver(DriverError),
    Watch(MonitorError),
}

impl AttemptError {
    /// Whether running the same video again in this batch can help.
    pub fn retry_eligible(&self) -> bool {
        match self {
            AttemptError::Source { .. }
            | AttemptError::StaleOutput { .. }
            | AttemptError::Driver(_) => false,
            AttemptError::Watch(e) => !matches!(
                e,
                MonitorError::Disappeared { .. } | MonitorError::Interrupted
            ),
        }
    }
}

impl std::fmt::Display for AttemptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttemptError::Source { path, source } => {
                write!(f, "cannot read source video {}: {source}", path.display())
            }
            AttemptError::StaleOutput { path, source } => {
                write!(f, "cannot move leftover output {} aside: {source}", path.display())
            }
            AttemptError::Driver(e) => write!(f, "{e}"),
            AttemptError::Watch(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for AttemptError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AttemptError::Source { source, .. } | AttemptError::StaleOutput { source, .. } => {
                Some(source)
            }
            AttemptError::Driver(e) => Some(e),
            AttemptError::Watch(e) => Some(e),
        }
    }
}

/// Result of one attempt.
#[derive(Debug)]
pub enum AttemptResult {
    /// Render succeeded and passed every check; safe to mark processed.
    Processed {
        duration_secs: Option<f64>,
        size: u64,
    },
    Rejected(Rejection),
    Failed(AttemptError),
    Interrupted,
}

impl std::fmt::Display for AttemptResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttemptResult::Processed { size, .. } => write!(f, "processed ({})", format_size(*size)),
            AttemptResult::Rejected(r) => write!(f, "{r}"),
            AttemptResult::Failed(e) => write!(f, "{e}"),
            AttemptResult::Interrupted => write!(f, "interrupted"),
        }
    }
}

/// What recovery found after a stuck or never-started export.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Partial output left in place for manual review.
    KeptPartial { size: u64 },
    /// Zero-byte output deleted.
    RemovedEmpty,
    /// No output was ever created.
    NoOutput,
}

/// Move an output left by an earlier attempt to `job.partial`, replacing any
/// older partial. Returns whether anything was moved. The monitor must only
/// ever see bytes written by the export it is watching.
pub fn set_aside_stale_output(job: &VideoJob) -> std::io::Result<bool> {
    let size = match std::fs::metadata(&job.output) {
        Ok(meta) => meta.len(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };
    match std::fs::remove_file(&job.partial) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    std::fs::rename(&job.output, &job.partial)?;
    tracing::warn!(
        output = %job.output.display(),
        partial = %job.partial.display(),
        size = %format_size(size),
        "leftover output from an earlier attempt moved aside"
    );
    Ok(true)
}

/// Inspect and tidy the output of a failed export.
pub fn inspect_failed_output(output: &Path) -> RecoveryAction {
    match std::fs::metadata(output) {
        Ok(meta) if meta.len() > 0 => {
            tracing::warn!(
                output = %output.display(),
                size = %format_size(meta.len()),
                "partial render kept for manual review, not marking processed"
            );
            RecoveryAction::KeptPartial { size: meta.len() }
        }
        Ok(_) => {
            match std::fs::remove_file(output) {
                Ok(()) => tracing::warn!(output = %output.display(), "render failed completely, empty file removed"),
                Err(e) => tracing::warn!(
                    output = %output.display(),
                    error = %e,
                    "render failed completely, could not remove empty file"
                ),
            }
            RecoveryAction::RemovedEmpty
        }
        Err(_) => {
            tracing::warn!(output = %output.display(), "no output file created, export never started");
            RecoveryAction::NoOutput
        }
    }
}

/// Delete every file directly inside `dir`. Returns the number removed.
/// A missing directory is not an error.
pub fn clear_cache(dir: &Path) -> usize {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(cache = %dir.display(), "cache folder does not exist");
            return 0;
        }
        Err(e) => {
            tracing::warn!(cache = %dir.display(), error = %e, "failed to read cache folder");
            return 0;
        }
    };

    let mut deleted = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        match std::fs::remove_file(&path) {
            Ok(()) => deleted += 1,
            Err(e) => {
                tracing::warn!(file = %path.display(), error = %e, "could not delete cache file")
            }
        }
    }
    tracing::info!(cache = %dir.display(), deleted, "cache cleared");
    deleted
}

/// Output checks applied after a render settles.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VerifySettings {
    pub max_file_size_gb: f64,
    pub match_source_duration: bool,
    pub duration_tolerance_secs: f64,
}

impl From<&RenderwatchConfig> for VerifySettings {
    fn from(cfg: &RenderwatchConfig) -> Self {
        Self {
            max_file_size_gb: cfg.batch.max_file_size_gb,
            match_source_duration: cfg.batch.match_source_duration,
            duration_tolerance_secs: cfg.batch.duration_tolerance_secs,
        }
    }
}

/// Runs attempts. Owns the collaborators so the batch loop can reuse them
/// across videos.
pub struct Workflow<D, P, T, O = FsObserver> {
    verify: VerifySettings,
    cache_dir: Option<PathBuf>,
    driver: D,
    monitor: RenderMonitor<P, O>,
    reaper: Reaper<T>,
}

impl<D, P, T, O> Workflow<D, P, T, O>
where
    D: ExportDriver,
    P: DurationProbe,
    T: ProcessTerminator,
    O: SizeObserver,
{
    pub fn new(
        verify: VerifySettings,
        cache_dir: Option<PathBuf>,
        driver: D,
        monitor: RenderMonitor<P, O>,
        reaper: Reaper<T>,
    ) -> Self {
        Self {
            verify,
            cache_dir,
            driver,
            monitor,
            reaper,
        }
    }

    /// Close the application and clear its cache.
    pub async fn cleanup(&self) {
        self.reaper.reap().await;
        self.clear_cache();
    }

    fn clear_cache(&self) {
        if let Some(dir) = &self.cache_dir {
            clear_cache(dir);
        }
    }

    /// Run one attempt at `job`.
    pub async fn run(&self, job: &VideoJob, shutdown: &ShutdownSignal) -> AttemptResult {
        if shutdown.is_triggered() {
            return AttemptResult::Interrupted;
        }

        self.clear_cache();

        let source_size = match std::fs::metadata(&job.source) {
            Ok(meta) => meta.len(),
            Err(e) => {
                return AttemptResult::Failed(AttemptError::Source {
                    path: job.source.clone(),
                    source: e,
                })
            }
        };
        let source_duration = if self.verify.match_source_duration {
            self.monitor.prober().probe(&job.source).await
        } else {
            None
        };
        tracing::info!(
            source = %job.source.display(),
            size = %format_size(source_size),
            duration = %source_duration.map(format_duration).unwrap_or_else(|| "unknown".to_string()),
            "source video"
        );

        if let Err(e) = set_aside_stale_output(job) {
            tracing::error!(video = %job.source_name, output = %job.output.display(), error = %e, "cannot clear leftover output");
            return AttemptResult::Failed(AttemptError::StaleOutput {
                path: job.output.clone(),
                source: e,
            });
        }

        let started = tokio::select! {
            biased;
            _ = shutdown.cancelled() => None,
            result = self.driver.start_export(job) => Some(result),
        };
        match started {
            None => {
                self.cleanup().await;
                return AttemptResult::Interrupted;
            }
            Some(Err(e)) => {
                tracing::error!(video = %job.source_name, error = %e, "export driver failed");
                self.cleanup().await;
                return AttemptResult::Failed(AttemptError::Driver(e));
            }
            Some(Ok(())) => {}
        }

        let outcome = match self.monitor.watch(&job.output, shutdown).await {
            Ok(outcome) => outcome,
            Err(MonitorError::Interrupted) => {
                self.cleanup().await;
                return AttemptResult::Interrupted;
            }
            Err(e) => {
                if e.needs_recovery() {
                    tracing::warn!(video = %job.source_name, error = %e, "recovery mode, force-closing application");
                    self.reaper.reap().await;
                    inspect_failed_output(&job.output);
                    self.clear_cache();
                } else {
                    self.cleanup().await;
                }
                return AttemptResult::Failed(AttemptError::Watch(e));
            }
        };

        let verdict = self.verify_output(job, &outcome, source_size, source_duration).await;
        self.cleanup().await;

        match verdict {
            Ok((duration_secs, size)) => {
                tracing::info!(video = %job.source_name, output = %job.output.display(), "video completed");
                AttemptResult::Processed {
                    duration_secs,
                    size,
                }
            }
            Err(rejection) => {
                tracing::warn!(
                    video = %job.source_name,
                    reason = %rejection,
                    "incomplete processing, will retry in next run"
                );
                AttemptResult::Rejected(rejection)
            }
        }
    }

    async fn verify_output(
        &self,
        job: &VideoJob,
        outcome: &RenderOutcome,
        source_size: u64,
        source_duration: Option<f64>,
    ) -> Result<(Option<f64>, u64), Rejection> {
        let size = match std::fs::metadata(&job.output) {
            Ok(meta) => meta.len(),
            Err(_) => return Err(Rejection::OutputMissing),
        };
        if source_size > 0 && size > 0 {
            let compression = (source_size as f64 - size as f64) / source_size as f64 * 100.0;
            tracing::info!(
                output_size = %format_size(size),
                compression = %format!("{:.1}%", compression.max(0.0)),
                "processed video"
            );
        }

        if !outcome.success() {
            return Err(Rejection::RenderUnverified);
        }

        let mut output_duration = outcome.duration();
        if self.verify.match_source_duration {
            if output_duration.is_none() {
                output_duration = self.monitor.prober().probe(&job.output).await;
            }
            let (Some(source_secs), Some(output_secs)) = (source_duration, output_duration) else {
                return Err(Rejection::DurationUnknown);
            };
            let difference = (source_secs - output_secs).abs();
            if difference >= self.verify.duration_tolerance_secs {
                return Err(Rejection::DurationMismatch {
                    source_secs,
                    output_secs,
                });
            }
            tracing::info!(difference = %format!("{difference:.1}s"), "durations match");
        }

        let size_gb = size as f64 / GIB;
        if size_gb >= self.verify.max_file_size_gb {
            return Err(Rejection::TooLarge {
                size,
                limit_gb: self.verify.max_file_size_gb,
            });
        }

        Ok((output_duration, size))
    }
}
