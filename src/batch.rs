/// Batch loop: process every unprocessed video in the input directory, one at
/// a time, retrying failed attempts per [`RetryPolicy`].
///
/// The directory is rescanned before each video so files dropped in while the
/// batch runs are picked up. Videos that failed in this run are not tried
/// again until the next run.
use crate::config::BatchConfig;
use crate::driver::ExportDriver;
use crate::ledger::ProcessedLedger;
use crate::monitor::{format_elapsed, SizeObserver};
use crate::probe::DurationProbe;
use crate::reaper::ProcessTerminator;
use crate::retry::{RetryDecision, RetryPolicy};
use crate::signals::ShutdownSignal;
use crate::status::StatusFile;
use crate::videos::{find_videos, VideoJob};
use crate::workflow::Workflow;
use fs2::FileExt;
use std::collections::HashSet;
use std::fs::File;
use std::path::PathBuf;
use std::time::Instant;

/// Counts reported at the end of a batch.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BatchSummary {
    pub processed: Vec<String>,
    pub failed: Vec<String>,
    pub already_processed: usize,
    pub interrupted: bool,
}

impl BatchSummary {
    pub fn success(&self) -> bool {
        self.failed.is_empty() && !self.interrupted
    }
}

/// Errors that stop a batch before or between videos.
#[derive(Debug)]
pub enum BatchError {
    InputMissing(PathBuf),
    CreateOutput {
        path: PathBuf,
        source: std::io::Error,
    },
    Lock {
        path: PathBuf,
        source: std::io::Error,
    },
    /// Another batch holds the lock on the output directory.
    AlreadyRunning(PathBuf),
    Scan(glob::PatternError),
}

impl std::fmt::Display for BatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BatchError::InputMissing(path) => {
                write!(f, "input folder does not exist: {}", path.display())
            }
            BatchError::CreateOutput { path, source } => {
                write!(f, "failed to create output folder {}: {source}", path.display())
            }
            BatchError::Lock { path, source } => {
                write!(f, "failed to open lock file {}: {source}", path.display())
            }
            BatchError::AlreadyRunning(path) => write!(
                f,
                "another batch is already running (lock held on {})",
                path.display()
            ),
            BatchError::Scan(e) => write!(f, "invalid input pattern: {e}"),
        }
    }
}

impl std::error::Error for BatchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BatchError::CreateOutput { source, .. } | BatchError::Lock { source, .. } => {
                Some(source)
            }
            BatchError::Scan(e) => Some(e),
            _ => None,
        }
    }
}

impl From<glob::PatternError> for BatchError {
    fn from(e: glob::PatternError) -> Self {
        BatchError::Scan(e)
    }
}

/// Exclusive advisory lock on the output directory, released on drop.
#[derive(Debug)]
pub struct BatchLock {
    _file: File,
}

impl BatchLock {
    pub fn acquire(path: PathBuf) -> Result<Self, BatchError> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|e| BatchError::Lock {
                path: path.clone(),
                source: e,
            })?;
        if file.try_lock_exclusive().is_err() {
            return Err(BatchError::AlreadyRunning(path));
        }
        Ok(Self { _file: file })
    }
}

/// Check the input folder exists and create the output folder.
pub fn prepare_dirs(cfg: &BatchConfig) -> Result<(), BatchError> {
    if !cfg.input_dir.is_dir() {
        return Err(BatchError::InputMissing(cfg.input_dir.clone()));
    }
    std::fs::create_dir_all(&cfg.output_dir).map_err(|e| BatchError::CreateOutput {
        path: cfg.output_dir.clone(),
        source: e,
    })
}

/// Videos in the input folder not yet in the ledger.
pub fn pending_videos(cfg: &BatchConfig, ledger: &ProcessedLedger) -> Result<Vec<VideoJob>, BatchError> {
    Ok(find_videos(&cfg.input_dir, &cfg.extension)?
        .iter()
        .map(|p| VideoJob::new(p, &cfg.output_dir, &cfg.extension))
        .filter(|job| !ledger.contains(&job.source_name))
        .collect())
}

/// Run the batch to completion, interruption, or a fatal error.
pub async fn run<D, P, T, O>(
    cfg: &BatchConfig,
    workflow: &Workflow<D, P, T, O>,
    shutdown: &ShutdownSignal,
) -> Result<BatchSummary, BatchError>
where
    D: ExportDriver,
    P: DurationProbe,
    T: ProcessTerminator,
    O: SizeObserver,
{
    prepare_dirs(cfg)?;
    let _lock = BatchLock::acquire(cfg.lock_path())?;

    let mut ledger = ProcessedLedger::load(cfg.ledger_path());
    let all = find_videos(&cfg.input_dir, &cfg.extension)?;
    let mut summary = BatchSummary {
        already_processed: all
            .iter()
            .filter_map(|p| p.file_name())
            .filter(|n| ledger.contains(&n.to_string_lossy()))
            .count(),
        ..Default::default()
    };
    tracing::info!(
        input = %cfg.input_dir.display(),
        output = %cfg.output_dir.display(),
        ledger = %ledger.path().display(),
        found = all.len(),
        already_processed = summary.already_processed,
        "starting batch"
    );

    let started = Instant::now();
    let mut attempted: HashSet<String> = HashSet::new();
    let mut policy = RetryPolicy::new(cfg.max_retries);

    'videos: loop {
        if shutdown.is_triggered() {
            summary.interrupted = true;
            break;
        }

        let Some(job) = pending_videos(cfg, &ledger)?
            .into_iter()
            .find(|job| !attempted.contains(&job.source_name))
        else {
            break;
        };
        attempted.insert(job.source_name.clone());
        policy.reset();

        tracing::info!(
            video = %job.source_name,
            output = %job.output.display(),
            number = attempted.len(),
            "processing video"
        );

        loop {
            let result = workflow.run(&job, shutdown).await;
            match policy.evaluate(&result) {
                RetryDecision::Proceed => {
                    // The render is good but unrecorded; the next run redoes it
                    if let Err(e) = ledger.mark(&job.source_name) {
                        tracing::error!(
                            video = %job.source_name,
                            ledger = %ledger.path().display(),
                            error = %e,
                            "could not record processed video, counting it as failed"
                        );
                        summary.failed.push(job.source_name.clone());
                    } else {
                        tracing::info!(video = %job.source_name, "marked as processed");
                        summary.processed.push(job.source_name.clone());
                    }
                    break;
                }
                RetryDecision::Retry { attempt } => {
                    tracing::info!(video = %job.source_name, attempt, "retrying video");
                    if !pause(cfg, shutdown).await {
                        summary.interrupted = true;
                        break 'videos;
                    }
                }
                RetryDecision::Skip => {
                    tracing::warn!(
                        video = %job.source_name,
                        reason = %result,
                        "video failed, left for next run"
                    );
                    summary.failed.push(job.source_name.clone());
                    break;
                }
                RetryDecision::Stop => {
                    summary.interrupted = true;
                    break 'videos;
                }
            }
        }

        if !pause(cfg, shutdown).await {
            summary.interrupted = true;
            break;
        }
    }

    if summary.interrupted {
        tracing::warn!("batch interrupted, remaining videos left for next run");
    } else {
        StatusFile::new(cfg.status_path()).remove();
    }
    tracing::info!(
        processed = summary.processed.len(),
        failed = summary.failed.len(),
        already_processed = summary.already_processed,
        elapsed = %format_elapsed(started.elapsed()),
        "batch finished"
    );
    Ok(summary)
}

/// Sleep between files. Returns false if shutdown was requested meanwhile.
async fn pause(cfg: &BatchConfig, shutdown: &ShutdownSignal) -> bool {
    tokio::select! {
        biased;
        _ = shutdown.cancelled() => false,
        _ = tokio::time::sleep(cfg.between_files()) => true,
    }
}
