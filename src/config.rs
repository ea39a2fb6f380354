use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration loaded from renderwatch.toml.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct RenderwatchConfig {
    pub monitor: MonitorConfig,
    pub probe: ProbeConfig,
    pub app: AppConfig,
    pub driver: DriverConfig,
    pub batch: BatchConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub timeout_ms: u64,
    pub check_interval_ms: u64,
    pub stability_duration_ms: u64,
    pub post_render_wait_ms: u64,
    pub max_stuck_checks: u32,
    /// Probe the finished render for a playable duration before reporting success.
    pub verify_duration: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    pub command: String,
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Executable name of the overlay application, used by the reaper.
    pub process_name: String,
    /// Cache folder emptied before and after every video.
    pub cache_dir: Option<PathBuf>,
    pub reap_settle_ms: u64,
}

/// External UI-automation script that loads a video into the application
/// and starts its export.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    pub command: String,
    pub args: Vec<String>,
    /// The driver is killed and the attempt fails if it has not exited by then.
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    pub extension: String,
    pub ledger_file: String,
    pub max_file_size_gb: f64,
    pub match_source_duration: bool,
    pub duration_tolerance_secs: f64,
    pub max_retries: u32,
    pub between_files_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct LoggingConfig {
    pub file: Option<PathBuf>,
}

// --- Default implementations ---

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 7_200_000,
            check_interval_ms: 60_000,
            stability_duration_ms: 60_000,
            post_render_wait_ms: 180_000,
            max_stuck_checks: 10,
            verify_duration: true,
        }
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            command: "ffprobe".to_string(),
            args: vec![
                "-v".to_string(),
                "error".to_string(),
                "-show_entries".to_string(),
                "format=duration".to_string(),
                "-of".to_string(),
                "default=noprint_wrappers=1:nokey=1".to_string(),
                "{path}".to_string(),
            ],
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            process_name: "TelemetryOverlay.exe".to_string(),
            cache_dir: None,
            reap_settle_ms: 2000,
        }
    }
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            command: String::new(),
            args: Vec::new(),
            timeout_ms: 600_000,
        }
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            input_dir: PathBuf::from("."),
            output_dir: PathBuf::from("output"),
            extension: "mp4".to_string(),
            ledger_file: ".processed_videos.json".to_string(),
            max_file_size_gb: 2.0,
            match_source_duration: true,
            duration_tolerance_secs: 2.0,
            max_retries: 2,
            between_files_ms: 2000,
        }
    }
}

impl MonitorConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    pub fn stability_duration(&self) -> Duration {
        Duration::from_millis(self.stability_duration_ms)
    }

    pub fn post_render_wait(&self) -> Duration {
        Duration::from_millis(self.post_render_wait_ms)
    }

    /// Whether `max_stuck_checks` no-change ticks can happen before the
    /// stability window closes. When false, a settled file always takes the
    /// success path and `Stuck` is never reported.
    pub fn stuck_detection_reachable(&self) -> bool {
        u64::from(self.max_stuck_checks).saturating_mul(self.check_interval_ms)
            < self.stability_duration_ms
    }
}

impl DriverConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl AppConfig {
    pub fn reap_settle(&self) -> Duration {
        Duration::from_millis(self.reap_settle_ms)
    }
}

impl BatchConfig {
    pub fn ledger_path(&self) -> PathBuf {
        self.input_dir.join(&self.ledger_file)
    }

    pub fn status_path(&self) -> PathBuf {
        self.output_dir.join("renderwatch.status")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.output_dir.join(".renderwatch.lock")
    }

    pub fn between_files(&self) -> Duration {
        Duration::from_millis(self.between_files_ms)
    }
}

impl RenderwatchConfig {
    /// Load configuration from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "config file not found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };
        Self::parse(&contents).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })
    }

    /// Parse configuration from TOML text.
    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|e| ConfigError::Parse {
            path: PathBuf::new(),
            source: e,
        })
    }

    /// Reject settings the monitor cannot run with; return warnings for
    /// settings that are legal but probably unintended.
    pub fn validate(&self) -> Result<Vec<String>, ConfigError> {
        if self.monitor.check_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "monitor.check_interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.monitor.max_stuck_checks == 0 {
            return Err(ConfigError::Invalid(
                "monitor.max_stuck_checks must be greater than 0".to_string(),
            ));
        }
        if self.app.process_name.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "app.process_name must not be empty".to_string(),
            ));
        }
        if self.probe.command.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "probe.command must not be empty".to_string(),
            ));
        }
        if self.driver.timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "driver.timeout_ms must be greater than 0".to_string(),
            ));
        }
        let size_limit = self.batch.max_file_size_gb;
        if size_limit.is_nan() || size_limit <= 0.0 {
            return Err(ConfigError::Invalid(format!(
                "batch.max_file_size_gb must be greater than 0, got {size_limit}"
            )));
        }
        let tolerance = self.batch.duration_tolerance_secs;
        if !tolerance.is_finite() || tolerance <= 0.0 {
            return Err(ConfigError::Invalid(format!(
                "batch.duration_tolerance_secs must be a positive number of seconds, got {tolerance}"
            )));
        }
        if same_dir(&self.batch.input_dir, &self.batch.output_dir) {
            return Err(ConfigError::Invalid(format!(
                "batch.input_dir and batch.output_dir must differ ({}), rendered outputs would be picked up as sources",
                self.batch.input_dir.display()
            )));
        }

        let mut warnings = Vec::new();
        if !self.monitor.stuck_detection_reachable() {
            warnings.push(format!(
                "stuck detection can never fire: {} checks x {}ms >= stability window of {}ms",
                self.monitor.max_stuck_checks,
                self.monitor.check_interval_ms,
                self.monitor.stability_duration_ms
            ));
        }
        if self.monitor.timeout_ms <= crate::monitor::NEVER_APPEARED_AFTER.as_millis() as u64 {
            warnings.push(format!(
                "monitor.timeout_ms ({}) expires before the 10 minute appearance limit",
                self.monitor.timeout_ms
            ));
        }
        if self.driver.command.trim().is_empty() {
            warnings.push("driver.command is empty; `run` cannot start exports".to_string());
        }
        Ok(warnings)
    }
}

/// Whether two folder paths name the same folder, textually or after
/// resolving symlinks and `..` when both exist.
fn same_dir(a: &Path, b: &Path) -> bool {
    if a == b {
        return true;
    }
    match (std::fs::canonicalize(a), std::fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// Errors from loading or validating configuration.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {source}", path.display())
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {source}", path.display())
            }
            ConfigError::Invalid(msg) => write!(f, "invalid config: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::Invalid(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_monitor_defaults() {
        let cfg = MonitorConfig::default();
        assert_eq!(cfg.timeout(), Duration::from_millis(7_200_000));
        assert_eq!(cfg.check_interval(), Duration::from_secs(60));
        assert_eq!(cfg.stability_duration(), Duration::from_secs(60));
        assert_eq!(cfg.post_render_wait(), Duration::from_secs(180));
        assert_eq!(cfg.max_stuck_checks, 10);
        assert!(cfg.verify_duration);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let cfg = RenderwatchConfig::parse(
            r#"
[monitor]
check_interval_ms = 5000

[app]
process_name = "Overlay"
"#,
        )
        .unwrap();
        assert_eq!(cfg.monitor.check_interval_ms, 5000);
        assert_eq!(cfg.monitor.timeout_ms, 7_200_000);
        assert_eq!(cfg.app.process_name, "Overlay");
        assert_eq!(cfg.app.reap_settle_ms, 2000);
        assert_eq!(cfg.probe.command, "ffprobe");
        assert_eq!(cfg.batch.ledger_file, ".processed_videos.json");
    }

    #[test]
    fn test_empty_toml_is_default() {
        let cfg = RenderwatchConfig::parse("").unwrap();
        assert_eq!(cfg.batch.max_retries, 2);
        assert_eq!(cfg.batch.extension, "mp4");
        assert!(cfg.logging.file.is_none());
    }

    #[test]
    fn test_load_missing_file_returns_defaults() {
        let dir = tempdir().unwrap();
        let cfg = RenderwatchConfig::load(&dir.path().join("nope.toml")).unwrap();
        assert_eq!(cfg.monitor.max_stuck_checks, 10);
    }

    #[test]
    fn test_load_malformed_file_is_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("renderwatch.toml");
        std::fs::write(&path, "[monitor\ntimeout_ms = ").unwrap();
        let err = RenderwatchConfig::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("renderwatch.toml"));
    }

    #[test]
    fn test_validate_rejects_zero_interval() {
        let mut cfg = RenderwatchConfig::default();
        cfg.monitor.check_interval_ms = 0;
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_rejects_empty_process_name() {
        let mut cfg = RenderwatchConfig::default();
        cfg.app.process_name = "  ".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_size_limit() {
        for limit in [0.0, -1.0, f64::NAN] {
            let mut cfg = RenderwatchConfig::default();
            cfg.batch.max_file_size_gb = limit;
            let err = cfg.validate().unwrap_err();
            assert!(err.to_string().contains("max_file_size_gb"), "{limit}");
        }
    }

    #[test]
    fn test_validate_rejects_bad_duration_tolerance() {
        for tolerance in [0.0, -2.0, f64::NAN, f64::INFINITY] {
            let mut cfg = RenderwatchConfig::default();
            cfg.batch.duration_tolerance_secs = tolerance;
            let err = cfg.validate().unwrap_err();
            assert!(err.to_string().contains("duration_tolerance_secs"), "{tolerance}");
        }
    }

    #[test]
    fn test_validate_rejects_same_input_and_output() {
        let mut cfg = RenderwatchConfig::default();
        cfg.batch.input_dir = PathBuf::from("/videos");
        cfg.batch.output_dir = PathBuf::from("/videos");
        assert!(cfg.validate().is_err());

        // Different spellings of one existing folder
        let dir = tempdir().unwrap();
        std::fs::create_dir(dir.path().join("in")).unwrap();
        cfg.batch.input_dir = dir.path().join("in");
        cfg.batch.output_dir = dir.path().join("in").join("..").join("in");
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("must differ"));

        cfg.batch.output_dir = dir.path().join("out");
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_driver_timeout() {
        let mut cfg = RenderwatchConfig::default();
        cfg.driver.timeout_ms = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_warns_when_stuck_unreachable() {
        let cfg = RenderwatchConfig::default();
        let warnings = cfg.validate().unwrap();
        assert!(warnings.iter().any(|w| w.contains("stuck detection can never fire")));
    }

    #[test]
    fn test_stuck_reachable_with_long_stability_window() {
        let cfg = MonitorConfig {
            stability_duration_ms: 15 * 60_000,
            ..Default::default()
        };
        assert!(cfg.stuck_detection_reachable());
        assert!(!MonitorConfig::default().stuck_detection_reachable());
    }

    #[test]
    fn test_batch_paths() {
        let cfg = BatchConfig {
            input_dir: PathBuf::from("/videos/in"),
            output_dir: PathBuf::from("/videos/out"),
            ..Default::default()
        };
        assert_eq!(
            cfg.ledger_path(),
            PathBuf::from("/videos/in/.processed_videos.json")
        );
        assert_eq!(cfg.status_path(), PathBuf::from("/videos/out/renderwatch.status"));
        assert_eq!(cfg.lock_path(), PathBuf::from("/videos/out/.renderwatch.lock"));
    }
}
