use std::path::PathBuf;

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

use crate::vbc_core::config::{ConfigError, GeneralConfig, QueueSortMode};
use crate::vbc_core::domain::VideoFile;

/// Orders the accepted set deterministically.
///
/// Every mode is a pure function of its inputs; `rand` with a fixed seed
/// produces the same permutation on every invocation.
pub fn sort_files(
    mut files: Vec<VideoFile>,
    input_dirs: &[PathBuf],
    general: &GeneralConfig,
    extensions: &[String],
) -> Result<Vec<VideoFile>, ConfigError> {
    match general.queue_sort {
        QueueSortMode::Name => {
            files.sort_by(|a, b| name_key(a).cmp(&name_key(b)));
            Ok(files)
        }
        QueueSortMode::SizeAsc => {
            files.sort_by(|a, b| (a.size_bytes, name_key(a)).cmp(&(b.size_bytes, name_key(b))));
            Ok(files)
        }
        QueueSortMode::SizeDesc => {
            files.sort_by(|a, b| {
                b.size_bytes
                    .cmp(&a.size_bytes)
                    .then_with(|| name_key(a).cmp(&name_key(b)))
            });
            Ok(files)
        }
        QueueSortMode::Ext => {
            if extensions.is_empty() {
                return Err(ConfigError::ExtSortRequiresExtensions);
            }
            files.sort_by(|a, b| {
                (extension_rank(a, extensions), name_key(a))
                    .cmp(&(extension_rank(b, extensions), name_key(b)))
            });
            Ok(files)
        }
        QueueSortMode::Dir => Ok(sort_by_input_dir(files, input_dirs)),
        QueueSortMode::Rand => {
            files.sort_by(|a, b| name_key(a).cmp(&name_key(b)));
            let mut rng = match general.queue_seed {
                Some(seed) => StdRng::seed_from_u64(seed),
                None => StdRng::from_os_rng(),
            };
            files.shuffle(&mut rng);
            Ok(files)
        }
    }
}

fn name_key(file: &VideoFile) -> (String, String) {
    (file.file_name(), file.path.to_string_lossy().into_owned())
}

fn extension_rank(file: &VideoFile, extensions: &[String]) -> usize {
    let ext = file
        .path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy().to_ascii_lowercase()))
        .unwrap_or_default();
    extensions
        .iter()
        .position(|candidate| candidate.to_ascii_lowercase() == ext)
        .unwrap_or(extensions.len())
}

/// Groups files by input root in the order the roots were given; within a
/// root they sort by relative path. Files under no root trail in name order.
fn sort_by_input_dir(files: Vec<VideoFile>, input_dirs: &[PathBuf]) -> Vec<VideoFile> {
    let mut per_dir: Vec<Vec<(PathBuf, VideoFile)>> = vec![Vec::new(); input_dirs.len()];
    let mut leftovers = Vec::new();

    for file in files {
        let mut matched = false;
        for (index, input_dir) in input_dirs.iter().enumerate() {
            if let Ok(relative) = file.path.strip_prefix(input_dir) {
                per_dir[index].push((relative.to_path_buf(), file.clone()));
                matched = true;
                break;
            }
        }
        if !matched {
            leftovers.push(file);
        }
    }

    let mut ordered = Vec::new();
    for mut entries in per_dir {
        entries.sort_by(|(rel_a, a), (rel_b, b)| {
            (rel_a.as_path(), name_key(a)).cmp(&(rel_b.as_path(), name_key(b)))
        });
        ordered.extend(entries.into_iter().map(|(_, file)| file));
    }

    leftovers.sort_by(|a, b| name_key(a).cmp(&name_key(b)));
    ordered.extend(leftovers);
    ordered
}
