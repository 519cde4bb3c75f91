use std::fs;
use std::path::{Path, PathBuf};

use tracing::warn;

/// Removes stale sidecars from an output tree before a run.
///
/// `.tmp` markers are always stale (a crashed or killed encode left them
/// behind); `.err` markers are only cleared when `clean_errors` is set. A
/// marker whose source file no longer exists is moved under `errors_dir`
/// instead of deleted, so evidence of the failure survives the cleanup.
pub fn cleanup_output_markers(
    input_dir: &Path,
    output_dir: &Path,
    errors_dir: &Path,
    clean_errors: bool,
) {
    if !output_dir.exists() {
        return;
    }

    let mut markers = Vec::new();
    collect_markers(output_dir, clean_errors, &mut markers);
    if markers.is_empty() {
        return;
    }

    for marker in markers {
        let relative = marker
            .strip_prefix(output_dir)
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| marker.file_name().map(PathBuf::from).unwrap_or_default());

        if find_source_for_marker(input_dir, &relative).is_some() {
            let _ = fs::remove_file(&marker);
            continue;
        }

        let dest = errors_dir.join(&relative);
        if let Some(parent) = dest.parent()
            && fs::create_dir_all(parent).is_err()
        {
            continue;
        }
        if fs::rename(&marker, &dest).is_err() {
            // Cross-device moves fall back to copy + delete.
            if fs::copy(&marker, &dest).is_ok() {
                let _ = fs::remove_file(&marker);
            } else {
                continue;
            }
        }
        warn!(
            marker = %marker.display(),
            dest = %dest.display(),
            "moved stale marker without source file"
        );
    }
}

fn collect_markers(dir: &Path, clean_errors: bool, markers: &mut Vec<PathBuf>) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_markers(&path, clean_errors, markers);
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.ends_with(".tmp") || (clean_errors && name.ends_with(".err")) {
            markers.push(path);
        }
    }
}

/// Locates the source file a marker belongs to. The marker carries the
/// output name (`clip.mp4.tmp` relative to the output root maps back to
/// `clip.<original ext>`), so matching is by stem, tolerating the original
/// extension and its casing.
fn find_source_for_marker(input_dir: &Path, rel_marker: &Path) -> Option<PathBuf> {
    let output_rel = rel_marker.with_extension("");
    let direct = input_dir.join(&output_rel);
    if direct.exists() {
        return Some(direct);
    }

    let parent = direct.parent()?;
    if !parent.exists() {
        return None;
    }

    let base_name = output_rel.file_name()?.to_string_lossy().into_owned();
    let base_core = Path::new(&base_name)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| base_name.clone());

    let entries = fs::read_dir(parent).ok()?;
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(stem) = path.file_stem().map(|s| s.to_string_lossy().into_owned()) else {
            continue;
        };
        if stem.eq_ignore_ascii_case(&base_name) || stem.eq_ignore_ascii_case(&base_core) {
            return Some(path);
        }
    }
    None
}
