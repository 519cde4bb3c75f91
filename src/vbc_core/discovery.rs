use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::vbc_core::config::{AppConfig, ConfigError, GeneralConfig};
use crate::vbc_core::domain::VideoFile;
use crate::vbc_core::ffmpeg::HW_CAP_MESSAGE;
use crate::vbc_core::scanner::FileScanner;

/// Aggregate discovery counters published with `DiscoveryFinished`.
///
/// `files_found` uses the "processable" interpretation: per root,
/// total candidates minus `ignored_small` and `ignored_err`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryReport {
    pub files_found: u64,
    pub files_to_process: u64,
    pub already_compressed: u64,
    pub ignored_small: u64,
    pub ignored_err: u64,
    pub ignored_av1: u64,
    pub source_folders_count: usize,
}

/// The per-run mapping from input roots to mirrored output roots.
///
/// Also the single authority for sidecar paths: every output resolves to
/// `<output_root>/<relative>.mp4`, with `.tmp` and `.err` peers next to it.
#[derive(Debug, Clone)]
pub struct OutputLayout {
    roots: Vec<(PathBuf, PathBuf)>,
}

impl OutputLayout {
    pub fn resolve(
        config: &AppConfig,
        input_dirs: &[PathBuf],
        override_map: Option<&HashMap<PathBuf, PathBuf>>,
    ) -> Result<Self, ConfigError> {
        let mut roots = Vec::with_capacity(input_dirs.len());
        for (index, input_dir) in input_dirs.iter().enumerate() {
            let output_dir = if let Some(map) = override_map {
                map.get(input_dir)
                    .cloned()
                    .ok_or_else(|| ConfigError::MissingOutputMapping(input_dir.clone()))?
            } else if !config.output_dirs.is_empty() {
                config
                    .output_dirs
                    .get(index)
                    .map(PathBuf::from)
                    .ok_or(ConfigError::OutputDirsCountMismatch)?
            } else {
                suffixed_sibling(input_dir, config.output_suffix())?
            };
            roots.push((input_dir.clone(), output_dir));
        }
        Ok(Self { roots })
    }

    pub fn roots(&self) -> &[(PathBuf, PathBuf)] {
        &self.roots
    }

    pub fn input_roots(&self) -> Vec<PathBuf> {
        self.roots.iter().map(|(input, _)| input.clone()).collect()
    }

    pub fn find_input_root(&self, path: &Path) -> Option<&Path> {
        self.roots
            .iter()
            .find(|(input, _)| path.starts_with(input))
            .map(|(input, _)| input.as_path())
    }

    /// Mirrors `source` into its output tree, forcing a lowercase `.mp4`
    /// extension. None when the source is under no configured root.
    pub fn output_path_for(&self, source: &Path) -> Option<PathBuf> {
        let (input, output) = self
            .roots
            .iter()
            .find(|(input, _)| source.starts_with(input))?;
        let relative = source
            .strip_prefix(input)
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| source.file_name().map(PathBuf::from).unwrap_or_default());
        Some(output.join(relative).with_extension("mp4"))
    }
}

fn suffixed_sibling(input_dir: &Path, suffix: &str) -> Result<PathBuf, ConfigError> {
    if suffix.is_empty() {
        return Err(ConfigError::SuffixMissing);
    }
    let name = input_dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| ConfigError::MissingOutputMapping(input_dir.to_path_buf()))?;
    Ok(input_dir.with_file_name(format!("{name}{suffix}")))
}

pub fn err_path_for(output_path: &Path) -> PathBuf {
    output_path.with_extension("err")
}

pub fn tmp_path_for(output_path: &Path) -> PathBuf {
    output_path.with_extension("tmp")
}

pub struct DiscoveryScan {
    pub files: Vec<VideoFile>,
    pub report: DiscoveryReport,
}

/// Walks every input root and classifies each candidate into the pending
/// set or a skip class.
///
/// The AV1 and camera-filter checks need probed metadata and are deferred to
/// the executor; discovery stays a pure filesystem pass.
pub fn discover(
    scanner: &FileScanner,
    layout: &OutputLayout,
    general: &GeneralConfig,
) -> DiscoveryScan {
    let mut report = DiscoveryReport {
        source_folders_count: layout.roots().len(),
        ..DiscoveryReport::default()
    };
    let mut accepted = Vec::new();

    for (input_dir, output_dir) in layout.roots() {
        debug!(input = %input_dir.display(), "discovery scanning root");

        // First walk counts every extension match (including undersized
        // files) for the report; the second enumerates the filtered set.
        let counts = scanner.count_candidates(input_dir);
        let candidates = scanner.scan(input_dir);

        let mut folder_already_compressed = 0u64;
        let mut folder_ignored_err = 0u64;

        for candidate in candidates {
            let relative = candidate
                .path
                .strip_prefix(input_dir)
                .map(Path::to_path_buf)
                .unwrap_or_else(|_| {
                    candidate.path.file_name().map(PathBuf::from).unwrap_or_default()
                });
            let output_path = output_dir.join(&relative).with_extension("mp4");
            let err_path = err_path_for(&output_path);

            // Error markers take precedence over the timestamp check.
            if err_path.exists() {
                if general.clean_errors {
                    if let Err(err) = fs::remove_file(&err_path) {
                        warn!(marker = %err_path.display(), %err, "failed to clean error marker");
                    }
                } else {
                    match classify_error_marker(&err_path, general.cpu_fallback) {
                        MarkerDisposition::RetryHwCap => {
                            if let Err(err) = fs::remove_file(&err_path) {
                                warn!(marker = %err_path.display(), %err,
                                    "failed to clear hw-cap marker for retry");
                            }
                        }
                        MarkerDisposition::Honor => {
                            folder_ignored_err += 1;
                        }
                        MarkerDisposition::HonorHwCap => {}
                    }
                }
                if err_path.exists() {
                    continue;
                }
            }

            if is_already_compressed(&candidate.path, &output_path) {
                folder_already_compressed += 1;
                continue;
            }

            accepted.push(candidate);
        }

        report.files_found += counts
            .total
            .saturating_sub(counts.ignored_small)
            .saturating_sub(folder_ignored_err);
        report.already_compressed += folder_already_compressed;
        report.ignored_small += counts.ignored_small;
        report.ignored_err += folder_ignored_err;
    }

    report.files_to_process = accepted.len() as u64;
    info!(
        found = report.files_found,
        to_process = report.files_to_process,
        already_compressed = report.already_compressed,
        ignored_small = report.ignored_small,
        ignored_err = report.ignored_err,
        "discovery finished"
    );

    DiscoveryScan {
        files: accepted,
        report,
    }
}

enum MarkerDisposition {
    /// A hw-cap marker with CPU fallback enabled: delete and re-attempt.
    RetryHwCap,
    /// A hw-cap marker without fallback: skip, but not counted as an error.
    HonorHwCap,
    /// Any other marker: skip and count as `ignored_err`.
    Honor,
}

fn classify_error_marker(err_path: &Path, cpu_fallback: bool) -> MarkerDisposition {
    let first_line = fs::read_to_string(err_path)
        .map(|content| content.lines().next().unwrap_or_default().to_string())
        .unwrap_or_default();
    if first_line.contains(HW_CAP_MESSAGE) {
        if cpu_fallback {
            MarkerDisposition::RetryHwCap
        } else {
            MarkerDisposition::HonorHwCap
        }
    } else {
        MarkerDisposition::Honor
    }
}

fn is_already_compressed(source: &Path, output: &Path) -> bool {
    let Ok(output_meta) = fs::metadata(output) else {
        return false;
    };
    let Ok(source_meta) = fs::metadata(source) else {
        return false;
    };
    match (output_meta.modified(), source_meta.modified()) {
        (Ok(out_mtime), Ok(src_mtime)) => out_mtime >= src_mtime,
        _ => false,
    }
}
