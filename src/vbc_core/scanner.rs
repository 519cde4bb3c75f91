use std::fs;
use std::path::Path;

use tracing::debug;

use crate::vbc_core::domain::VideoFile;

/// Candidate totals gathered by the counting pre-walk; discovery folds these
/// into its per-run report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CandidateCounts {
    /// Files matching a configured extension, regardless of size.
    pub total: u64,
    /// Matching files below the minimum size.
    pub ignored_small: u64,
}

/// Deterministic recursive walk filtered by extension and minimum byte size.
///
/// Output-suffixed directories (default `*_out`) are pruned so a mirrored
/// output tree that happens to live under an input root is never enumerated.
pub struct FileScanner {
    extensions: Vec<String>,
    min_size_bytes: u64,
    output_suffix: String,
}

impl FileScanner {
    pub fn new(
        extensions: &[String],
        min_size_bytes: u64,
        output_suffix: impl Into<String>,
    ) -> Self {
        let extensions = extensions
            .iter()
            .map(|ext| {
                let ext = ext.to_ascii_lowercase();
                if ext.starts_with('.') { ext } else { format!(".{ext}") }
            })
            .collect();
        Self {
            extensions,
            min_size_bytes,
            output_suffix: output_suffix.into(),
        }
    }

    pub fn extensions(&self) -> &[String] {
        &self.extensions
    }

    pub fn min_size_bytes(&self) -> u64 {
        self.min_size_bytes
    }

    fn matches_extension(&self, path: &Path) -> bool {
        let Some(ext) = path.extension() else {
            return false;
        };
        let dotted = format!(".{}", ext.to_string_lossy().to_ascii_lowercase());
        self.extensions.contains(&dotted)
    }

    fn is_output_dir(&self, path: &Path) -> bool {
        path.file_name()
            .map(|name| name.to_string_lossy().ends_with(&self.output_suffix))
            .unwrap_or(false)
    }

    /// Enumerates size-filtered candidates under `root` in deterministic
    /// order (directories and files lexicographically sorted per level).
    /// Files that cannot be stat-ed are skipped silently.
    pub fn scan(&self, root: &Path) -> Vec<VideoFile> {
        let mut found = Vec::new();
        self.walk(root, &mut |path| {
            match fs::metadata(path) {
                Ok(meta) => {
                    if meta.len() >= self.min_size_bytes {
                        found.push(VideoFile::new(path, meta.len()));
                    }
                }
                Err(err) => {
                    debug!(path = %path.display(), %err, "skipping unreadable file");
                }
            }
        });
        found
    }

    /// Counts all extension-matching candidates under `root`, including the
    /// ones below the size filter. Used by discovery for its report totals.
    pub fn count_candidates(&self, root: &Path) -> CandidateCounts {
        let mut counts = CandidateCounts::default();
        self.walk(root, &mut |path| {
            counts.total += 1;
            if let Ok(meta) = fs::metadata(path)
                && meta.len() < self.min_size_bytes
            {
                counts.ignored_small += 1;
            }
        });
        counts
    }

    fn walk(&self, dir: &Path, visit: &mut impl FnMut(&Path)) {
        if self.is_output_dir(dir) {
            return;
        }
        let Ok(entries) = fs::read_dir(dir) else {
            debug!(dir = %dir.display(), "skipping unreadable directory");
            return;
        };

        let mut dirs = Vec::new();
        let mut files = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                dirs.push(path);
            } else {
                files.push(path);
            }
        }
        dirs.sort();
        files.sort();

        for path in files {
            if self.matches_extension(&path) {
                visit(&path);
            }
        }
        for sub in dirs {
            self.walk(&sub, visit);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    fn touch(path: &Path, bytes: usize) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, vec![0u8; bytes]).unwrap();
    }

    fn scanner() -> FileScanner {
        FileScanner::new(&[".mp4".into(), "mov".into()], 100, "_out")
    }

    #[test]
    fn scan_filters_by_extension_and_size() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("keep.mp4"), 200);
        touch(&dir.path().join("KEEP2.MOV"), 150);
        touch(&dir.path().join("small.mp4"), 10);
        touch(&dir.path().join("notes.txt"), 500);

        let files = scanner().scan(dir.path());
        let names: Vec<String> = files.iter().map(VideoFile::file_name).collect();
        assert_eq!(names, vec!["KEEP2.MOV", "keep.mp4"]);
    }

    #[test]
    fn scan_prunes_output_suffixed_directories() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("clips/a.mp4"), 200);
        touch(&dir.path().join("clips_out/a.mp4"), 200);
        touch(&dir.path().join("clips_out/nested/b.mp4"), 200);

        let files = scanner().scan(dir.path());
        assert_eq!(files.len(), 1);
        assert!(files[0].path.ends_with("clips/a.mp4"));
    }

    #[test]
    fn scan_order_is_deterministic_across_invocations() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["z.mp4", "a.mp4", "m.mp4"] {
            touch(&dir.path().join(name), 200);
        }
        touch(&dir.path().join("sub/b.mp4"), 200);

        let scanner = scanner();
        let first: Vec<_> = scanner.scan(dir.path()).iter().map(|f| f.path.clone()).collect();
        let second: Vec<_> = scanner.scan(dir.path()).iter().map(|f| f.path.clone()).collect();
        assert_eq!(first, second);
        // Files at each level come sorted, before subdirectory contents.
        assert!(first[0].ends_with("a.mp4"));
        assert!(first[2].ends_with("z.mp4"));
        assert!(first[3].ends_with("sub/b.mp4"));
    }

    #[test]
    fn count_candidates_includes_undersized_files() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("big.mp4"), 200);
        touch(&dir.path().join("small.mp4"), 10);
        touch(&dir.path().join("other.bin"), 10);

        let counts = scanner().count_candidates(dir.path());
        assert_eq!(counts.total, 2);
        assert_eq!(counts.ignored_small, 1);
    }
}
