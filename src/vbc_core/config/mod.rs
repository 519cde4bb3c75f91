use std::path::PathBuf;

use serde::{Deserialize, Serialize};

mod io;
pub use io::load_config;

pub const MAX_INPUT_DIRS: usize = 50;
pub const MAX_INPUT_DIR_LEN: usize = 150;

/// Hard ceiling of the worker pool; `ThreadControl` deltas clamp into
/// `1..=MAX_WORKER_THREADS`.
pub const MAX_WORKER_THREADS: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config file not found: {}", .0.display())]
    NotFound(PathBuf),
    #[error("failed to read config {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("invalid rotation angle {angle} for pattern {pattern:?}; must be 0, 90, 180 or 270")]
    InvalidRotationAngle { pattern: String, angle: u32 },
    #[error("invalid autorotate pattern {pattern:?}: {source}")]
    InvalidRotationPattern {
        pattern: String,
        source: regex::Error,
    },
    #[error("too many input directories ({0}); max {MAX_INPUT_DIRS}")]
    TooManyInputDirs(usize),
    #[error("input directory path too long (>{MAX_INPUT_DIR_LEN} chars): {0}")]
    InputDirTooLong(String),
    #[error("output_dirs count must match input_dirs count")]
    OutputDirsCountMismatch,
    #[error("output directory mapping missing for {}", .0.display())]
    MissingOutputMapping(PathBuf),
    #[error("suffix_output_dirs is not set")]
    SuffixMissing,
    #[error("queue_sort 'ext' requires a non-empty extensions list")]
    ExtSortRequiresExtensions,
    #[error("cq {0} out of range (0-63)")]
    CqOutOfRange(u8),
}

/// One dynamic-quality rule: files whose camera tags contain `pattern` get
/// `cq` instead of the default. Rules are matched in declaration order, so
/// the configuration keeps them as a sequence rather than a map.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CqRule {
    pub pattern: String,
    pub cq: u8,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum QueueSortMode {
    #[default]
    #[serde(rename = "name")]
    Name,
    #[serde(rename = "size", alias = "size-asc")]
    SizeAsc,
    #[serde(rename = "size-desc")]
    SizeDesc,
    #[serde(rename = "ext")]
    Ext,
    #[serde(rename = "dir")]
    Dir,
    #[serde(rename = "rand")]
    Rand,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct GeneralConfig {
    /// Initial effective parallelism; adjustable at runtime within
    /// `1..=MAX_WORKER_THREADS`.
    pub threads: usize,
    /// Default constant-quality value (0-63, lower is better).
    pub cq: u8,
    /// Submit-on-demand keeps at most `prefetch_factor * threads` jobs
    /// outstanding in the pool.
    pub prefetch_factor: usize,
    pub gpu: bool,
    /// Retry a hardware-capability failure once on the CPU path.
    pub cpu_fallback: bool,
    pub copy_metadata: bool,
    pub use_exif: bool,
    /// When non-empty, only files whose camera model contains one of these
    /// substrings are encoded.
    pub filter_cameras: Vec<String>,
    pub dynamic_cq: Vec<CqRule>,
    pub extensions: Vec<String>,
    pub min_size_bytes: u64,
    /// Delete pre-existing `.err` markers during discovery instead of
    /// honoring them.
    pub clean_errors: bool,
    pub skip_av1: bool,
    /// Passed to SVT-AV1 as `lp=N` and to ffmpeg as `-threads N`.
    pub ffmpeg_cpu_threads: Option<u32>,
    pub manual_rotation: Option<u32>,
    /// An encode must shave off at least this fraction of the input size or
    /// the original is kept.
    pub min_compression_ratio: f64,
    pub queue_sort: QueueSortMode,
    pub queue_seed: Option<u64>,
    pub debug: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            threads: 1,
            cq: 45,
            prefetch_factor: 1,
            gpu: true,
            cpu_fallback: false,
            copy_metadata: true,
            use_exif: true,
            filter_cameras: Vec::new(),
            dynamic_cq: Vec::new(),
            extensions: default_extensions(),
            min_size_bytes: 1_048_576,
            clean_errors: false,
            skip_av1: false,
            ffmpeg_cpu_threads: None,
            manual_rotation: None,
            min_compression_ratio: 0.1,
            queue_sort: QueueSortMode::Name,
            queue_seed: None,
            debug: false,
        }
    }
}

fn default_extensions() -> Vec<String> {
    [".mp4", ".mov", ".avi", ".flv", ".webm"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Filename pattern to rotation angle, applied in declaration order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RotateRule {
    pub pattern: String,
    pub angle: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AutoRotateConfig {
    pub patterns: Vec<RotateRule>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub general: GeneralConfig,
    pub input_dirs: Vec<String>,
    /// When non-empty, must be parallel to `input_dirs`; otherwise output
    /// roots are derived as `<input>` + `suffix_output_dirs`.
    pub output_dirs: Vec<String>,
    pub suffix_output_dirs: String,
    /// Sibling directory suffix for relocated orphan markers.
    pub suffix_errors_dirs: String,
    pub autorotate: AutoRotateConfig,
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.general.cq > 63 {
            return Err(ConfigError::CqOutOfRange(self.general.cq));
        }
        for rule in &self.autorotate.patterns {
            if !matches!(rule.angle, 0 | 90 | 180 | 270) {
                return Err(ConfigError::InvalidRotationAngle {
                    pattern: rule.pattern.clone(),
                    angle: rule.angle,
                });
            }
            regex::Regex::new(&rule.pattern).map_err(|source| {
                ConfigError::InvalidRotationPattern {
                    pattern: rule.pattern.clone(),
                    source,
                }
            })?;
        }
        if !self.output_dirs.is_empty() && self.output_dirs.len() != self.input_dirs.len() {
            return Err(ConfigError::OutputDirsCountMismatch);
        }
        validate_input_dir_entries(&self.input_dirs)?;
        Ok(())
    }

    /// Effective output-directory suffix; empty means "not configured".
    pub fn output_suffix(&self) -> &str {
        if self.suffix_output_dirs.is_empty() {
            "_out"
        } else {
            &self.suffix_output_dirs
        }
    }

    pub fn errors_suffix(&self) -> &str {
        if self.suffix_errors_dirs.is_empty() {
            "_errors"
        } else {
            &self.suffix_errors_dirs
        }
    }
}

fn strip_wrapping_quotes(value: &str) -> &str {
    let trimmed = value.trim();
    let bytes = trimmed.as_bytes();
    if bytes.len() >= 2
        && bytes[0] == bytes[bytes.len() - 1]
        && (bytes[0] == b'"' || bytes[0] == b'\'')
    {
        &trimmed[1..trimmed.len() - 1]
    } else {
        trimmed
    }
}

/// Cleans operator-supplied directory entries: strips wrapping quotes, drops
/// empties and deduplicates while preserving order.
pub fn normalize_input_dir_entries(entries: &[String]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut normalized = Vec::new();
    for entry in entries {
        let cleaned = strip_wrapping_quotes(entry);
        if cleaned.is_empty() {
            continue;
        }
        if seen.insert(cleaned.to_string()) {
            normalized.push(cleaned.to_string());
        }
    }
    normalized
}

pub fn validate_input_dir_entries(entries: &[String]) -> Result<(), ConfigError> {
    if entries.len() > MAX_INPUT_DIRS {
        return Err(ConfigError::TooManyInputDirs(entries.len()));
    }
    if let Some(long) = entries.iter().find(|entry| entry.len() > MAX_INPUT_DIR_LEN) {
        return Err(ConfigError::InputDirTooLong(long.clone()));
    }
    Ok(())
}
