/// Source discovery and output naming.
use glob::MatchOptions;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

/// Runs of underscores, collapsed to one in output names.
static UNDERSCORE_RUNS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"_{2,}").unwrap());

/// One source video and the files the application will produce for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoJob {
    /// Absolute or input-relative path of the source video.
    pub source: PathBuf,
    /// Source file name, the key stored in the processed ledger.
    pub source_name: String,
    /// Cleaned base name shared by the project and the rendered video.
    pub stem: String,
    /// Rendered `.mp4` the monitor watches.
    pub output: PathBuf,
    /// `.toproj` project file saved alongside.
    pub project: PathBuf,
    /// Where a leftover output from an earlier attempt is moved before a new
    /// export starts.
    pub partial: PathBuf,
}

impl VideoJob {
    pub fn new(source: &Path, output_dir: &Path, extension: &str) -> Self {
        let source_name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let stem = clean_stem(&source_name, extension);
        Self {
            source: source.to_path_buf(),
            output: output_dir.join(format!("{stem}.mp4")),
            project: output_dir.join(format!("{stem}.toproj")),
            partial: output_dir.join(format!("{stem}.partial.mp4")),
            source_name,
            stem,
        }
    }
}

/// Strip the (case-insensitive) extension and collapse underscore runs.
pub fn clean_stem(file_name: &str, extension: &str) -> String {
    let suffix_len = extension.len() + 1;
    let base = if file_name.len() > suffix_len
        && file_name.is_char_boundary(file_name.len() - suffix_len)
        && file_name[file_name.len() - suffix_len..]
            .eq_ignore_ascii_case(&format!(".{extension}"))
    {
        &file_name[..file_name.len() - suffix_len]
    } else {
        file_name
    };
    UNDERSCORE_RUNS.replace_all(base, "_").into_owned()
}

/// List source videos in `input_dir` with the given extension, any case,
/// sorted by path.
pub fn find_videos(input_dir: &Path, extension: &str) -> Result<Vec<PathBuf>, glob::PatternError> {
    let pattern = format!(
        "{}/*.{}",
        glob::Pattern::escape(&input_dir.to_string_lossy()),
        glob::Pattern::escape(extension)
    );
    let options = MatchOptions {
        case_sensitive: false,
        ..Default::default()
    };

    let mut videos: Vec<PathBuf> = glob::glob_with(&pattern, options)?
        .filter_map(|entry| match entry {
            Ok(path) => Some(path),
            Err(e) => {
                tracing::warn!(error = %e, "skipping unreadable directory entry");
                None
            }
        })
        .filter(|path| path.is_file())
        .collect();
    videos.sort();
    Ok(videos)
}
