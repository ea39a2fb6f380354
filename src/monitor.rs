/// Render-completion monitor.
///
/// Watches the file an external renderer is writing, polling its size once per
/// check interval. Growth means rendering; an unchanged size for the stability
/// window means done; an unchanged size for too many checks before that means
/// the renderer hung. A settled file is given a post-render grace period and
/// then optionally verified with a duration probe.
///
/// [`RenderWatch`] is the pure per-tick state machine; [`RenderMonitor`] drives
/// it on a tokio interval and owns the side effects (stat, sleep, probe,
/// status file, cancellation).
use crate::config::MonitorConfig;
use crate::probe::DurationProbe;
use crate::signals::ShutdownSignal;
use crate::status::{StatusData, StatusFile};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};

/// A watch whose target has not shown up by now fails with `NeverAppeared`.
/// Independent of the configured overall timeout.
pub const NEVER_APPEARED_AFTER: Duration = Duration::from_secs(600);

/// Watch phases, also written to the status file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchPhase {
    AwaitingAppearance,
    Growing,
    Stabilizing,
    PostRenderWait,
    Verifying,
    Resolved,
}

/// Monitor timings, resolved from [`MonitorConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchSettings {
    pub timeout: Duration,
    pub check_interval: Duration,
    pub stability_duration: Duration,
    pub post_render_wait: Duration,
    pub max_stuck_checks: u32,
    pub verify_duration: bool,
}

impl From<&MonitorConfig> for WatchSettings {
    fn from(cfg: &MonitorConfig) -> Self {
        Self {
            timeout: cfg.timeout(),
            check_interval: cfg.check_interval(),
            stability_duration: cfg.stability_duration(),
            post_render_wait: cfg.post_render_wait(),
            max_stuck_checks: cfg.max_stuck_checks,
            verify_duration: cfg.verify_duration,
        }
    }
}

impl Default for WatchSettings {
    fn default() -> Self {
        Self::from(&MonitorConfig::default())
    }
}

/// How a watch that did not error ended.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RenderOutcome {
    /// Size settled and the probe found a playable duration.
    Verified { duration_secs: f64, final_size: u64 },
    /// Size settled but the probe found nothing usable. A soft failure.
    Unverified { final_size: u64 },
    /// Size settled and duration verification is switched off.
    Settled { final_size: u64 },
}

impl RenderOutcome {
    pub fn success(&self) -> bool {
        !matches!(self, RenderOutcome::Unverified { .. })
    }

    pub fn duration(&self) -> Option<f64> {
        match self {
            RenderOutcome::Verified { duration_secs, .. } => Some(*duration_secs),
            _ => None,
        }
    }

    pub fn final_size(&self) -> u64 {
        match self {
            RenderOutcome::Verified { final_size, .. }
            | RenderOutcome::Unverified { final_size }
            | RenderOutcome::Settled { final_size } => *final_size,
        }
    }
}

/// Classification of a failed watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    TimedOut,
    Disappeared,
    NeverAppeared,
    Stuck,
    Interrupted,
    Io,
}

/// Hard failures of a watch.
#[derive(Debug)]
pub enum MonitorError {
    /// Total elapsed time exceeded the configured timeout.
    TimedOut {
        timeout: Duration,
        last_size: Option<u64>,
    },
    /// The output existed and then vanished.
    Disappeared { path: PathBuf },
    /// The output never showed up within [`NEVER_APPEARED_AFTER`].
    NeverAppeared { path: PathBuf, waited: Duration },
    /// Size unchanged for `checks` consecutive ticks before the stability
    /// window closed.
    Stuck {
        size: u64,
        checks: u32,
        unchanged_for: Duration,
    },
    /// Shutdown was requested while watching.
    Interrupted,
    /// Stat failed for a reason other than "not found".
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl MonitorError {
    pub fn kind(&self) -> FailureKind {
        match self {
            MonitorError::TimedOut { .. } => FailureKind::TimedOut,
            MonitorError::Disappeared { .. } => FailureKind::Disappeared,
            MonitorError::NeverAppeared { .. } => FailureKind::NeverAppeared,
            MonitorError::Stuck { .. } => FailureKind::Stuck,
            MonitorError::Interrupted => FailureKind::Interrupted,
            MonitorError::Io { .. } => FailureKind::Io,
        }
    }

    /// Failures after which the caller should kill the application and
    /// inspect whatever output exists.
    pub fn needs_recovery(&self) -> bool {
        matches!(
            self.kind(),
            FailureKind::Stuck | FailureKind::NeverAppeared
        )
    }
}

impl std::fmt::Display for MonitorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MonitorError::TimedOut { timeout, .. } => write!(
                f,
                "render timeout: file did not stabilize within {} minutes",
                timeout.as_secs() / 60
            ),
            MonitorError::Disappeared { path } => write!(
                f,
                "output file disappeared during rendering: {}",
                path.display()
            ),
            MonitorError::NeverAppeared { path, waited } => write!(
                f,
                "export stuck: output file never appeared after {}: {}",
                format_elapsed(*waited),
                path.display()
            ),
            MonitorError::Stuck {
                checks,
                unchanged_for,
                ..
            } => write!(
                f,
                "render stuck: no file size change for {} ({checks} consecutive checks)",
                format_elapsed(*unchanged_for)
            ),
            MonitorError::Interrupted => write!(f, "render watch interrupted by user"),
            MonitorError::Io { path, source } => {
                write!(f, "failed to stat {}: {source}", path.display())
            }
        }
    }
}

impl std::error::Error for MonitorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MonitorError::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// What one tick observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// Target not there yet.
    Waiting,
    /// Size changed. `previous` is `None` on the first observation.
    Grew { size: u64, previous: Option<u64> },
    /// Size unchanged; `remaining` is what is left of the stability window.
    Holding { size: u64, remaining: Duration },
    /// Size unchanged for the whole stability window.
    Settled { size: u64 },
}

/// Per-watch state. Mutated only by [`RenderWatch::tick`] and the
/// post-settle phase changes.
#[derive(Debug, Clone)]
pub struct RenderWatch {
    target: PathBuf,
    settings: WatchSettings,
    started_at: DateTime<Utc>,
    last_observed_size: Option<u64>,
    stable_for: Duration,
    consecutive_no_change: u32,
    appeared: bool,
    checks: u32,
    phase: WatchPhase,
}

impl RenderWatch {
    pub fn new(target: impl Into<PathBuf>, settings: WatchSettings) -> Self {
        Self {
            target: target.into(),
            settings,
            started_at: Utc::now(),
            last_observed_size: None,
            stable_for: Duration::ZERO,
            consecutive_no_change: 0,
            appeared: false,
            checks: 0,
            phase: WatchPhase::AwaitingAppearance,
        }
    }

    /// Advance by one poll. `elapsed` is time since the watch started,
    /// `observed` the current size or `None` if the file is absent.
    pub fn tick(&mut self, elapsed: Duration, observed: Option<u64>) -> Result<Tick, MonitorError> {
        self.checks += 1;

        if elapsed > self.settings.timeout {
            return Err(MonitorError::TimedOut {
                timeout: self.settings.timeout,
                last_size: self.last_observed_size,
            });
        }

        let Some(size) = observed else {
            if self.appeared {
                return Err(MonitorError::Disappeared {
                    path: self.target.clone(),
                });
            }
            if elapsed > NEVER_APPEARED_AFTER {
                return Err(MonitorError::NeverAppeared {
                    path: self.target.clone(),
                    waited: elapsed,
                });
            }
            return Ok(Tick::Waiting);
        };

        self.appeared = true;

        if self.last_observed_size != Some(size) {
            let previous = self.last_observed_size.replace(size);
            self.consecutive_no_change = 0;
            self.stable_for = Duration::ZERO;
            self.phase = WatchPhase::Growing;
            return Ok(Tick::Grew { size, previous });
        }

        self.consecutive_no_change += 1;
        self.stable_for += self.settings.check_interval;

        // Stuck is judged before stability, and only while the window is open
        if self.consecutive_no_change >= self.settings.max_stuck_checks
            && self.stable_for < self.settings.stability_duration
        {
            return Err(MonitorError::Stuck {
                size,
                checks: self.consecutive_no_change,
                unchanged_for: self.stable_for,
            });
        }

        if self.stable_for >= self.settings.stability_duration {
            self.phase = WatchPhase::PostRenderWait;
            return Ok(Tick::Settled { size });
        }

        self.phase = WatchPhase::Stabilizing;
        Ok(Tick::Holding {
            size,
            remaining: self.settings.stability_duration - self.stable_for,
        })
    }

    pub fn phase(&self) -> WatchPhase {
        self.phase
    }

    #[cfg(test)]
    pub fn last_observed_size(&self) -> Option<u64> {
        self.last_observed_size
    }

    #[cfg(test)]
    pub fn stable_for(&self) -> Duration {
        self.stable_for
    }

    pub fn consecutive_no_change(&self) -> u32 {
        self.consecutive_no_change
    }

    #[cfg(test)]
    pub fn appeared(&self) -> bool {
        self.appeared
    }

    pub fn checks(&self) -> u32 {
        self.checks
    }

    fn set_phase(&mut self, phase: WatchPhase) {
        self.phase = phase;
    }

    fn status(&self) -> StatusData {
        StatusData {
            pid: std::process::id(),
            phase: self.phase,
            target: self.target.display().to_string(),
            size_bytes: self.last_observed_size,
            checks: self.checks,
            consecutive_no_change: self.consecutive_no_change,
            stable_for_secs: self.stable_for.as_secs(),
            watch_start: self.started_at,
            last_update: Utc::now(),
        }
    }
}

/// Source of file sizes. `Ok(None)` means the file does not exist.
pub trait SizeObserver {
    fn observe(&self, path: &Path) -> std::io::Result<Option<u64>>;
}

/// Reads sizes from the filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsObserver;

impl SizeObserver for FsObserver {
    fn observe(&self, path: &Path) -> std::io::Result<Option<u64>> {
        match std::fs::metadata(path) {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Drives [`RenderWatch`] on a fixed cadence.
pub struct RenderMonitor<P, O = FsObserver> {
    settings: WatchSettings,
    prober: P,
    observer: O,
    status: Option<StatusFile>,
}

impl<P: DurationProbe> RenderMonitor<P, FsObserver> {
    pub fn new(settings: WatchSettings, prober: P) -> Self {
        Self {
            settings,
            prober,
            observer: FsObserver,
            status: None,
        }
    }
}

impl<P: DurationProbe, O: SizeObserver> RenderMonitor<P, O> {
    #[cfg(test)]
    pub fn with_observer<O2: SizeObserver>(self, observer: O2) -> RenderMonitor<P, O2> {
        RenderMonitor {
            settings: self.settings,
            prober: self.prober,
            observer,
            status: self.status,
        }
    }

    /// Write the watch phase to `status` on every change.
    pub fn with_status(mut self, status: StatusFile) -> Self {
        self.status = Some(status);
        self
    }

    pub fn prober(&self) -> &P {
        &self.prober
    }

    /// Watch `target` until it resolves, fails, or `shutdown` fires.
    pub async fn watch(
        &self,
        target: &Path,
        shutdown: &ShutdownSignal,
    ) -> Result<RenderOutcome, MonitorError> {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                tracing::warn!(output = %target.display(), "render watch interrupted");
                Err(MonitorError::Interrupted)
            }
            result = self.run(target) => result,
        }
    }

    async fn run(&self, target: &Path) -> Result<RenderOutcome, MonitorError> {
        let s = &self.settings;
        tracing::info!(
            output = %target.display(),
            max_wait = %format_elapsed(s.timeout),
            check_interval = %format_elapsed(s.check_interval),
            stability = %format_elapsed(s.stability_duration),
            post_render_wait = %format_elapsed(s.post_render_wait),
            max_stuck_checks = s.max_stuck_checks,
            "monitoring render completion"
        );

        let mut watch = RenderWatch::new(target, self.settings);
        self.publish(&watch);

        let start = Instant::now();
        let mut ticker = tokio::time::interval_at(start + s.check_interval, s.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let final_size = loop {
            ticker.tick().await;
            let elapsed = start.elapsed();
            let observed = self
                .observer
                .observe(target)
                .map_err(|e| MonitorError::Io {
                    path: target.to_path_buf(),
                    source: e,
                })?;

            let before = watch.phase();
            let tick = match watch.tick(elapsed, observed) {
                Ok(tick) => tick,
                Err(e) => {
                    tracing::error!(
                        check = watch.checks(),
                        elapsed = %format_elapsed(elapsed),
                        error = %e,
                        "render watch failed"
                    );
                    return Err(e);
                }
            };
            self.report(&watch, tick, elapsed);
            if watch.phase() != before {
                self.publish(&watch);
            }
            if let Tick::Settled { size } = tick {
                break size;
            }
        };

        tracing::info!(
            wait = %format_elapsed(s.post_render_wait),
            "waiting for metadata finalization"
        );
        tokio::time::sleep(s.post_render_wait).await;

        if !s.verify_duration {
            watch.set_phase(WatchPhase::Resolved);
            self.publish(&watch);
            tracing::info!(output = %target.display(), "render complete (duration check disabled)");
            return Ok(RenderOutcome::Settled { final_size });
        }

        watch.set_phase(WatchPhase::Verifying);
        self.publish(&watch);
        let duration = self.prober.probe(target).await;
        watch.set_phase(WatchPhase::Resolved);
        self.publish(&watch);

        match duration {
            Some(duration_secs) => {
                tracing::info!(
                    output = %target.display(),
                    duration = %crate::probe::format_duration(duration_secs),
                    "render verified"
                );
                Ok(RenderOutcome::Verified {
                    duration_secs,
                    final_size,
                })
            }
            None => {
                tracing::warn!(
                    output = %target.display(),
                    "render settled but has no valid duration"
                );
                Ok(RenderOutcome::Unverified { final_size })
            }
        }
    }

    fn report(&self, watch: &RenderWatch, tick: Tick, elapsed: Duration) {
        let check = watch.checks();
        match tick {
            Tick::Waiting => tracing::info!(
                check,
                elapsed = %format_elapsed(elapsed),
                "waiting for output file to appear"
            ),
            Tick::Grew {
                size,
                previous: None,
            } => tracing::info!(
                check,
                size = %format_size(size),
                elapsed = %format_elapsed(elapsed),
                "output file detected, monitoring size"
            ),
            Tick::Grew {
                size,
                previous: Some(prev),
            } => {
                let delta = format!("{:+.2} MB", (size as f64 - prev as f64) / MIB);
                tracing::info!(
                    check,
                    size = %format_size(size),
                    delta = %delta,
                    elapsed = %format_elapsed(elapsed),
                    "still rendering"
                );
            }
            Tick::Holding { size, remaining } => tracing::info!(
                check,
                size = %format_size(size),
                stable_checks = watch.consecutive_no_change(),
                stuck_threshold = self.settings.max_stuck_checks,
                remaining = %format_elapsed(remaining),
                "no size change, confirming stability"
            ),
            Tick::Settled { size } => tracing::info!(
                check,
                final_size = %format_size(size),
                render_time = %format_elapsed(elapsed),
                "file size stable"
            ),
        }
    }

    fn publish(&self, watch: &RenderWatch) {
        tracing::debug!(phase = ?watch.phase(), "watch phase");
        if let Some(status) = &self.status {
            status.update(&watch.status());
        }
    }
}

const MIB: f64 = 1024.0 * 1024.0;
const GIB: f64 = MIB * 1024.0;

/// Human-readable size: MB below 1 GiB, GB with the MB figure above.
pub fn format_size(bytes: u64) -> String {
    let b = bytes as f64;
    if b > GIB {
        format!("{:.3} GB ({:.2} MB)", b / GIB, b / MIB)
    } else {
        format!("{:.2} MB", b / MIB)
    }
}

/// `Xm Ys`, or `Xh Ym` past an hour.
pub fn format_elapsed(d: Duration) -> String {
    let secs = d.as_secs();
    if secs >= 3600 {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    } else {
        format!("{}m {}s", secs / 60, secs % 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    const MIN: Duration = Duration::from_secs(60);

    fn settings() -> WatchSettings {
        WatchSettings::default()
    }

    /// Replays `(at, size)` steps: the file has the size of the latest step
    /// whose time has passed.
    struct ScriptedObserver {
        start: Instant,
        steps: Vec<(Duration, Option<u64>)>,
    }

    impl ScriptedObserver {
        fn new(steps: Vec<(Duration, Option<u64>)>) -> Self {
            Self {
                start: Instant::now(),
                steps,
            }
        }
    }

    impl SizeObserver for ScriptedObserver {
        fn observe(&self, _path: &Path) -> std::io::Result<Option<u64>> {
            let elapsed = self.start.elapsed();
            Ok(self
                .steps
                .iter()
                .rev()
                .find(|(at, _)| *at <= elapsed)
                .and_then(|(_, size)| *size))
        }
    }

    struct FixedProbe {
        result: Option<f64>,
        start: Instant,
        called_at: Cell<Option<Duration>>,
    }

    impl FixedProbe {
        fn new(result: Option<f64>) -> Self {
            Self {
                result,
                start: Instant::now(),
                called_at: Cell::new(None),
            }
        }
    }

    impl DurationProbe for FixedProbe {
        async fn probe(&self, _path: &Path) -> Option<f64> {
            self.called_at.set(Some(self.start.elapsed()));
            self.result
        }
    }

    fn monitor(
        settings: WatchSettings,
        probe: Option<f64>,
        steps: Vec<(Duration, Option<u64>)>,
    ) -> RenderMonitor<FixedProbe, ScriptedObserver> {
        RenderMonitor::new(settings, FixedProbe::new(probe))
            .with_observer(ScriptedObserver::new(steps))
    }

    fn never_shutdown() -> (crate::signals::ShutdownTrigger, ShutdownSignal) {
        ShutdownSignal::channel()
    }

    // --- RenderWatch state machine ---

    #[test]
    fn test_first_observation_counts_as_change() {
        let mut w = RenderWatch::new("/out/a.mp4", settings());
        let tick = w.tick(MIN, Some(0)).unwrap();
        assert_eq!(
            tick,
            Tick::Grew {
                size: 0,
                previous: None
            }
        );
        assert!(w.appeared());
        assert_eq!(w.phase(), WatchPhase::Growing);
        assert_eq!(w.last_observed_size(), Some(0));
    }

    #[test]
    fn test_size_change_resets_both_counters() {
        let s = WatchSettings {
            stability_duration: 30 * MIN,
            max_stuck_checks: 100,
            ..settings()
        };
        let sequences: Vec<Vec<u64>> = vec![
            vec![10, 10, 10, 20],
            vec![5, 5, 6, 6, 6, 6, 7],
            vec![1, 2, 2, 2, 2, 2, 2, 2, 1],
        ];
        for sizes in sequences {
            let mut w = RenderWatch::new("/out/a.mp4", s);
            let mut last = None;
            for (i, size) in sizes.iter().enumerate() {
                let elapsed = MIN * (i as u32 + 1);
                w.tick(elapsed, Some(*size)).unwrap();
                if last != Some(*size) {
                    assert_eq!(w.consecutive_no_change(), 0, "sizes {sizes:?} at {i}");
                    assert_eq!(w.stable_for(), Duration::ZERO, "sizes {sizes:?} at {i}");
                } else {
                    assert!(w.consecutive_no_change() > 0);
                    assert_eq!(
                        w.stable_for(),
                        s.check_interval * w.consecutive_no_change()
                    );
                }
                last = Some(*size);
            }
        }
    }

    #[test]
    fn test_settles_once_stable_for_reaches_window() {
        let s = WatchSettings {
            stability_duration: 3 * MIN,
            ..settings()
        };
        let mut w = RenderWatch::new("/out/a.mp4", s);
        w.tick(MIN, Some(100)).unwrap();
        assert_eq!(
            w.tick(2 * MIN, Some(100)).unwrap(),
            Tick::Holding {
                size: 100,
                remaining: 2 * MIN
            }
        );
        assert_eq!(w.phase(), WatchPhase::Stabilizing);
        assert!(matches!(
            w.tick(3 * MIN, Some(100)).unwrap(),
            Tick::Holding { .. }
        ));
        assert_eq!(
            w.tick(4 * MIN, Some(100)).unwrap(),
            Tick::Settled { size: 100 }
        );
        assert_eq!(w.phase(), WatchPhase::PostRenderWait);
    }

    #[test]
    fn test_default_settings_settle_on_first_unchanged_tick() {
        // max_stuck_checks * interval exceeds the stability window, so the
        // stability rule always wins.
        let mut w = RenderWatch::new("/out/a.mp4", settings());
        w.tick(MIN, Some(2_000_000)).unwrap();
        assert_eq!(
            w.tick(2 * MIN, Some(2_000_000)).unwrap(),
            Tick::Settled { size: 2_000_000 }
        );
    }

    #[test]
    fn test_stuck_fires_before_long_stability_window() {
        let s = WatchSettings {
            stability_duration: 15 * MIN,
            max_stuck_checks: 10,
            ..settings()
        };
        let mut w = RenderWatch::new("/out/a.mp4", s);
        w.tick(MIN, Some(2_000_000)).unwrap();
        for i in 1..10 {
            let tick = w.tick(MIN * (i + 1), Some(2_000_000)).unwrap();
            assert!(matches!(tick, Tick::Holding { .. }), "tick {i}");
        }
        let err = w.tick(11 * MIN, Some(2_000_000)).unwrap_err();
        match err {
            MonitorError::Stuck {
                size,
                checks,
                unchanged_for,
            } => {
                assert_eq!(size, 2_000_000);
                assert_eq!(checks, 10);
                assert_eq!(unchanged_for, 10 * MIN);
            }
            other => panic!("expected Stuck, got {other:?}"),
        }
    }

    #[test]
    fn test_stuck_counter_restarts_after_growth() {
        let s = WatchSettings {
            stability_duration: 15 * MIN,
            max_stuck_checks: 3,
            ..settings()
        };
        let mut w = RenderWatch::new("/out/a.mp4", s);
        w.tick(MIN, Some(1)).unwrap();
        w.tick(2 * MIN, Some(1)).unwrap();
        w.tick(3 * MIN, Some(1)).unwrap();
        w.tick(4 * MIN, Some(2)).unwrap();
        w.tick(5 * MIN, Some(2)).unwrap();
        assert!(w.tick(6 * MIN, Some(2)).is_ok());
        assert!(matches!(
            w.tick(7 * MIN, Some(2)),
            Err(MonitorError::Stuck { checks: 3, .. })
        ));
    }

    #[test]
    fn test_disappearance_is_fatal() {
        let mut w = RenderWatch::new("/out/a.mp4", settings());
        w.tick(MIN, Some(500)).unwrap();
        let err = w.tick(2 * MIN, None).unwrap_err();
        assert_eq!(err.kind(), FailureKind::Disappeared);
        assert!(err.to_string().contains("disappeared"));
    }

    #[test]
    fn test_waiting_until_never_appeared_threshold() {
        let mut w = RenderWatch::new("/out/a.mp4", settings());
        assert_eq!(w.tick(MIN, None).unwrap(), Tick::Waiting);
        assert_eq!(w.phase(), WatchPhase::AwaitingAppearance);
        // Exactly at the threshold is still waiting
        assert_eq!(w.tick(NEVER_APPEARED_AFTER, None).unwrap(), Tick::Waiting);
        let err = w
            .tick(NEVER_APPEARED_AFTER + Duration::from_secs(5), None)
            .unwrap_err();
        assert_eq!(err.kind(), FailureKind::NeverAppeared);
        assert!(err.needs_recovery());
        assert!(!w.appeared());
    }

    #[test]
    fn test_timeout_checked_before_everything() {
        let s = WatchSettings {
            timeout: 2 * MIN,
            ..settings()
        };
        let mut w = RenderWatch::new("/out/a.mp4", s);
        w.tick(MIN, Some(10)).unwrap();
        w.tick(2 * MIN, Some(20)).unwrap();
        let err = w.tick(3 * MIN, Some(30)).unwrap_err();
        assert!(matches!(
            err,
            MonitorError::TimedOut {
                last_size: Some(20),
                ..
            }
        ));
        assert!(err.to_string().contains("timeout"));
        assert!(!err.needs_recovery());
    }

    #[test]
    fn test_error_kinds_and_messages() {
        let stuck = MonitorError::Stuck {
            size: 1,
            checks: 10,
            unchanged_for: 10 * MIN,
        };
        assert_eq!(stuck.kind(), FailureKind::Stuck);
        assert!(stuck.needs_recovery());
        assert!(stuck.to_string().contains("stuck"));
        assert!(stuck.to_string().contains("10m 0s"));

        let never = MonitorError::NeverAppeared {
            path: PathBuf::from("/out/a.mp4"),
            waited: 10 * MIN,
        };
        assert!(never.to_string().contains("never appeared"));
        assert_eq!(MonitorError::Interrupted.kind(), FailureKind::Interrupted);
        assert!(!MonitorError::Interrupted.needs_recovery());
    }

    #[test]
    fn test_outcome_accessors() {
        let v = RenderOutcome::Verified {
            duration_secs: 42.0,
            final_size: 5,
        };
        assert!(v.success());
        assert_eq!(v.duration(), Some(42.0));
        let u = RenderOutcome::Unverified { final_size: 5 };
        assert!(!u.success());
        assert_eq!(u.duration(), None);
        let s = RenderOutcome::Settled { final_size: 7 };
        assert!(s.success());
        assert_eq!(s.final_size(), 7);
    }

    #[test]
    fn test_format_helpers() {
        assert_eq!(format_size(5_000_000), "4.77 MB");
        assert_eq!(format_size(2 * 1024 * 1024 * 1024), "2.000 GB (2048.00 MB)");
        assert_eq!(format_elapsed(Duration::from_secs(125)), "2m 5s");
        assert_eq!(format_elapsed(Duration::from_secs(7200)), "2h 0m");
    }

    #[test]
    fn test_fs_observer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("render.mp4");
        assert_eq!(FsObserver.observe(&path).unwrap(), None);
        std::fs::write(&path, b"12345").unwrap();
        assert_eq!(FsObserver.observe(&path).unwrap(), Some(5));
    }

    // --- RenderMonitor on a paused clock ---

    #[tokio::test(start_paused = true)]
    async fn test_end_to_end_verified_render() {
        let m = monitor(
            settings(),
            Some(42.0),
            vec![
                (Duration::ZERO, None),
                (Duration::from_secs(65), Some(1_000_000)),
                (Duration::from_secs(125), Some(5_000_000)),
            ],
        );
        let (_trigger, shutdown) = never_shutdown();

        let outcome = m.watch(Path::new("/out/a.mp4"), &shutdown).await.unwrap();
        assert_eq!(
            outcome,
            RenderOutcome::Verified {
                duration_secs: 42.0,
                final_size: 5_000_000
            }
        );
        // Absent at 60s, 1MB at 120s, 5MB at 180s, unchanged at 240s,
        // then the 180s post-render wait.
        assert_eq!(
            m.prober().called_at.get(),
            Some(Duration::from_secs(240 + 180))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_to_end_never_appeared() {
        let s = WatchSettings {
            check_interval: Duration::from_secs(5),
            ..settings()
        };
        let m = monitor(s, Some(42.0), vec![(Duration::ZERO, None)]);
        let (_trigger, shutdown) = never_shutdown();

        let start = Instant::now();
        let err = m
            .watch(Path::new("/out/a.mp4"), &shutdown)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), FailureKind::NeverAppeared);
        assert_eq!(start.elapsed(), Duration::from_millis(605_000));
        assert_eq!(m.prober().called_at.get(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_to_end_stuck() {
        let s = WatchSettings {
            stability_duration: 15 * MIN,
            max_stuck_checks: 10,
            ..settings()
        };
        let m = monitor(s, Some(42.0), vec![(Duration::ZERO, Some(2_000_000))]);
        let (_trigger, shutdown) = never_shutdown();

        let start = Instant::now();
        let err = m
            .watch(Path::new("/out/a.mp4"), &shutdown)
            .await
            .unwrap_err();
        assert!(matches!(err, MonitorError::Stuck { checks: 10, .. }));
        // First tick observes, the next ten are unchanged
        assert_eq!(start.elapsed(), 11 * MIN);
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_to_end_disappeared() {
        let m = monitor(
            settings(),
            Some(42.0),
            vec![
                (Duration::ZERO, Some(10)),
                (Duration::from_secs(90), None),
            ],
        );
        let (_trigger, shutdown) = never_shutdown();
        let err = m
            .watch(Path::new("/out/a.mp4"), &shutdown)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), FailureKind::Disappeared);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_probe_is_soft_failure() {
        let m = monitor(settings(), None, vec![(Duration::ZERO, Some(700))]);
        let (_trigger, shutdown) = never_shutdown();
        let outcome = m.watch(Path::new("/out/a.mp4"), &shutdown).await.unwrap();
        assert_eq!(outcome, RenderOutcome::Unverified { final_size: 700 });
        assert!(!outcome.success());
    }

    #[tokio::test(start_paused = true)]
    async fn test_verification_disabled_skips_probe() {
        let s = WatchSettings {
            verify_duration: false,
            ..settings()
        };
        let m = monitor(s, Some(42.0), vec![(Duration::ZERO, Some(700))]);
        let (_trigger, shutdown) = never_shutdown();
        let outcome = m.watch(Path::new("/out/a.mp4"), &shutdown).await.unwrap();
        assert_eq!(outcome, RenderOutcome::Settled { final_size: 700 });
        assert_eq!(m.prober().called_at.get(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_during_growth() {
        let s = WatchSettings {
            timeout: Duration::from_secs(150),
            ..settings()
        };
        // Grows by one byte every 30 seconds forever
        let steps = (0..100u64)
            .map(|i| (Duration::from_secs(30 * i), Some(i)))
            .collect();
        let m = monitor(s, Some(42.0), steps);
        let (_trigger, shutdown) = never_shutdown();
        let err = m
            .watch(Path::new("/out/a.mp4"), &shutdown)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), FailureKind::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_interrupts_watch() {
        let m = monitor(settings(), Some(42.0), vec![(Duration::ZERO, None)]);
        let (trigger, shutdown) = ShutdownSignal::channel();

        let interrupt = async {
            tokio::time::sleep(Duration::from_secs(150)).await;
            trigger.trigger();
        };
        let (result, ()) = tokio::join!(m.watch(Path::new("/out/a.mp4"), &shutdown), interrupt);
        let err = result.unwrap_err();
        assert_eq!(err.kind(), FailureKind::Interrupted);
        assert!(err.to_string().contains("interrupted"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_during_post_render_wait() {
        let m = monitor(settings(), Some(42.0), vec![(Duration::ZERO, Some(9))]);
        let (trigger, shutdown) = ShutdownSignal::channel();

        // Settles at 120s; post-render wait runs until 300s
        let interrupt = async {
            tokio::time::sleep(Duration::from_secs(200)).await;
            trigger.trigger();
        };
        let (result, ()) = tokio::join!(m.watch(Path::new("/out/a.mp4"), &shutdown), interrupt);
        assert!(matches!(result, Err(MonitorError::Interrupted)));
        assert_eq!(m.prober().called_at.get(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_file_tracks_phases() {
        let dir = tempfile::tempdir().unwrap();
        let status_path = dir.path().join("renderwatch.status");
        let m = monitor(settings(), Some(12.5), vec![(Duration::ZERO, Some(64))])
            .with_status(StatusFile::new(status_path.clone()));
        let (_trigger, shutdown) = never_shutdown();

        m.watch(Path::new("/out/a.mp4"), &shutdown).await.unwrap();

        let parsed: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&status_path).unwrap()).unwrap();
        assert_eq!(parsed["phase"], "resolved");
        assert_eq!(parsed["target"], "/out/a.mp4");
        assert_eq!(parsed["size_bytes"], 64);
    }

    #[tokio::test(start_paused = true)]
    async fn test_real_file_growth() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("render.mp4");
        let s = WatchSettings {
            check_interval: Duration::from_secs(10),
            stability_duration: Duration::from_secs(20),
            post_render_wait: Duration::from_secs(5),
            verify_duration: false,
            ..settings()
        };
        let m = RenderMonitor::new(s, FixedProbe::new(None));
        let (_trigger, shutdown) = never_shutdown();

        let writer = async {
            tokio::time::sleep(Duration::from_secs(15)).await;
            std::fs::write(&path, vec![0u8; 100]).unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
            std::fs::write(&path, vec![0u8; 300]).unwrap();
        };
        let (result, ()) = tokio::join!(m.watch(&path, &shutdown), writer);
        assert_eq!(result.unwrap(), RenderOutcome::Settled { final_size: 300 });
    }
}
