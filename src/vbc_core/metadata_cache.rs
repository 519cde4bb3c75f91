use std::collections::{HashMap, HashSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::{debug, error, warn};

use crate::sync_ext::MutexExt;
use crate::vbc_core::config::GeneralConfig;
use crate::vbc_core::discovery::{OutputLayout, err_path_for};
use crate::vbc_core::domain::{CompressionJob, JobStatus, VideoFile, VideoMetadata};
use crate::vbc_core::events::{EventBus, PipelineEvent};
use crate::vbc_core::exiftool::ExifToolAdapter;
use crate::vbc_core::ffprobe::{FfprobeAdapter, StreamInfo};

/// Written to the `.err` sidecar when ffprobe cannot read a source.
pub const CORRUPT_SOURCE_MESSAGE: &str = "File is corrupted (ffprobe failed to read). Skipped.";

/// How many probe attempts a path gets before it is marked permanently
/// failed for the rest of the run.
const FAILURE_LIMIT: u32 = 1;

#[derive(Default)]
struct CacheState {
    entries: HashMap<PathBuf, VideoMetadata>,
    failure_counts: HashMap<PathBuf, u32>,
    failed: HashSet<PathBuf>,
    reported: HashSet<PathBuf>,
}

/// Thread-safe memo of probe + EXIF results keyed by source path.
///
/// A path whose probe keeps failing is marked permanently failed: the
/// corrupt-source marker is written once, a single `JobFailed` is published
/// (the scheduler uses it to prune pending work), and later lookups return
/// None without touching the tool again.
pub struct MetadataService {
    state: Mutex<CacheState>,
    ffprobe: FfprobeAdapter,
    exiftool: ExifToolAdapter,
    bus: Arc<EventBus>,
    layout: Arc<OutputLayout>,
    general: GeneralConfig,
}

impl MetadataService {
    pub fn new(
        ffprobe: FfprobeAdapter,
        exiftool: ExifToolAdapter,
        bus: Arc<EventBus>,
        layout: Arc<OutputLayout>,
        general: GeneralConfig,
    ) -> Self {
        Self {
            state: Mutex::new(CacheState::default()),
            ffprobe,
            exiftool,
            bus,
            layout,
            general,
        }
    }

    pub fn get_or_probe(&self, file: &VideoFile) -> Option<VideoMetadata> {
        self.get_or_probe_with(file, None)
    }

    /// Cached lookup, probing on a miss. `base` lets the executor reuse a
    /// probe it already paid for.
    pub fn get_or_probe_with(
        &self,
        file: &VideoFile,
        base: Option<&StreamInfo>,
    ) -> Option<VideoMetadata> {
        let attempt = {
            let state = self.state.lock_unpoisoned();
            if let Some(cached) = state.entries.get(&file.path) {
                return Some(cached.clone());
            }
            let failures = state.failure_counts.get(&file.path).copied().unwrap_or(0);
            if base.is_none() && failures >= FAILURE_LIMIT {
                return None;
            }
            failures + 1
        };

        if self.general.debug {
            debug!(
                file = %file.file_name(),
                attempt,
                limit = FAILURE_LIMIT,
                "metadata cache miss"
            );
        }

        let probed = match base {
            Some(info) => Ok(info.clone()),
            None => self.ffprobe.stream_info(&file.path),
        };

        match probed {
            Ok(info) => {
                let metadata = self.build_metadata(file, &info);
                let mut state = self.state.lock_unpoisoned();
                state.entries.insert(file.path.clone(), metadata.clone());
                state.failure_counts.remove(&file.path);
                Some(metadata)
            }
            Err(err) => {
                let failures = {
                    let mut state = self.state.lock_unpoisoned();
                    let count = state.failure_counts.entry(file.path.clone()).or_insert(0);
                    *count += 1;
                    *count
                };
                if failures >= FAILURE_LIMIT {
                    warn!(
                        file = %file.file_name(),
                        attempt = failures,
                        limit = FAILURE_LIMIT,
                        %err,
                        "metadata extraction failed; suppressing retries"
                    );
                    if base.is_none() {
                        self.register_failure(file, &err);
                    }
                } else {
                    warn!(
                        file = %file.file_name(),
                        attempt = failures,
                        limit = FAILURE_LIMIT,
                        %err,
                        "metadata extraction failed"
                    );
                }
                None
            }
        }
    }

    pub fn is_failed(&self, path: &Path) -> bool {
        self.state.lock_unpoisoned().failed.contains(path)
    }

    /// Drops permanently-failed paths from the pending queue, preserving the
    /// order of the survivors. Returns how many entries were removed.
    pub fn prune_failed(&self, pending: &mut VecDeque<VideoFile>) -> usize {
        let state = self.state.lock_unpoisoned();
        if state.failed.is_empty() {
            return 0;
        }
        let before = pending.len();
        pending.retain(|file| !state.failed.contains(&file.path));
        before - pending.len()
    }

    fn build_metadata(&self, file: &VideoFile, info: &StreamInfo) -> VideoMetadata {
        let mut metadata =
            VideoMetadata::from_dimensions(info.width, info.height, info.codec.clone(), info.fps);
        metadata.audio_codec = info.audio_codec.clone();
        metadata.color_space = info.color_space.clone();
        metadata.duration = (info.duration > 0.0).then_some(info.duration);

        if self.general.use_exif {
            match self
                .exiftool
                .extract_exif_info(&file.path, &self.general.dynamic_cq)
            {
                Ok(summary) => {
                    if self.general.debug
                        && let (Some(pattern), Some(cq)) =
                            (&summary.matched_pattern, summary.custom_cq)
                    {
                        debug!(
                            file = %file.file_name(),
                            pattern = %pattern,
                            raw = summary.camera_raw.as_deref().unwrap_or("None"),
                            cq,
                            "dynamic CQ match"
                        );
                    }
                    metadata.camera_model = summary.camera_model;
                    metadata.camera_raw = summary.camera_raw;
                    metadata.custom_cq = summary.custom_cq;
                    metadata.bitrate_kbps = summary.bitrate_kbps;
                    metadata.vbc_encoded = summary.vbc_encoded;
                }
                Err(err) => {
                    debug!(file = %file.file_name(), %err, "exiftool analysis failed");
                }
            }
        }

        metadata
    }

    /// One-shot: marks the path failed, writes the corrupt-source marker and
    /// publishes the `JobFailed` the scheduler prunes on.
    fn register_failure(&self, file: &VideoFile, err: &anyhow::Error) {
        {
            let mut state = self.state.lock_unpoisoned();
            if !state.failed.insert(file.path.clone()) {
                return;
            }
        }

        let output_path = self.write_error_marker(&file.path);
        match &output_path {
            Some(_) => {
                error!(file = %file.file_name(), %err, "corrupted file detected (ffprobe failed)");
            }
            None => {
                warn!(file = %file.file_name(), %err, "failed to write corrupt-source marker");
            }
        }

        let report = {
            let mut state = self.state.lock_unpoisoned();
            state.reported.insert(file.path.clone())
        };
        if report {
            let mut job = CompressionJob::new(file.clone());
            job.status = JobStatus::Failed;
            job.output_path = output_path;
            job.error_message = Some(CORRUPT_SOURCE_MESSAGE.to_string());
            self.bus.publish(&PipelineEvent::JobFailed {
                job,
                error_message: CORRUPT_SOURCE_MESSAGE.to_string(),
            });
        }
    }

    fn write_error_marker(&self, source: &Path) -> Option<PathBuf> {
        let output_path = self.layout.output_path_for(source)?;
        let err_path = err_path_for(&output_path);
        if let Some(parent) = err_path.parent()
            && fs::create_dir_all(parent).is_err()
        {
            return None;
        }
        fs::write(&err_path, CORRUPT_SOURCE_MESSAGE).ok()?;
        Some(output_path)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::vbc_core::config::AppConfig;
    use crate::vbc_core::events::EventKind;

    fn service_over(dir: &Path) -> (Arc<EventBus>, MetadataService, PathBuf) {
        let input = dir.join("in");
        fs::create_dir_all(&input).unwrap();
        let config = AppConfig::default();
        let layout = Arc::new(
            OutputLayout::resolve(&config, std::slice::from_ref(&input), None).unwrap(),
        );
        let bus = Arc::new(EventBus::new());
        // Tool paths that cannot exist, so every probe attempt fails.
        let service = MetadataService::new(
            FfprobeAdapter::new(dir.join("no-such-ffprobe")),
            ExifToolAdapter::new(dir.join("no-such-exiftool")),
            bus.clone(),
            layout,
            GeneralConfig::default(),
        );
        (bus, service, input)
    }

    #[test]
    fn probe_failure_marks_path_and_publishes_once() {
        let dir = tempfile::tempdir().unwrap();
        let (bus, service, input) = service_over(dir.path());

        let failures = Arc::new(AtomicUsize::new(0));
        let counter = failures.clone();
        bus.subscribe(EventKind::JobFailed, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let source = input.join("broken.mp4");
        fs::write(&source, b"junk").unwrap();
        let file = VideoFile::new(&source, 4);

        assert!(service.get_or_probe(&file).is_none());
        assert!(service.is_failed(&source));
        assert_eq!(failures.load(Ordering::SeqCst), 1);

        // The marker lands next to the mirrored output path.
        let marker = input
            .parent()
            .unwrap()
            .join("in_out")
            .join("broken.err");
        assert_eq!(fs::read_to_string(marker).unwrap(), CORRUPT_SOURCE_MESSAGE);

        // Subsequent lookups are suppressed without another event.
        assert!(service.get_or_probe(&file).is_none());
        assert_eq!(failures.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn base_stream_info_bypasses_probe_and_caches() {
        let dir = tempfile::tempdir().unwrap();
        let (_bus, service, input) = service_over(dir.path());

        let source = input.join("good.mp4");
        fs::write(&source, b"data").unwrap();
        let file = VideoFile::new(&source, 4);

        let info = StreamInfo {
            width: 1280,
            height: 720,
            codec: "h264".into(),
            audio_codec: Some("aac".into()),
            fps: 25.0,
            duration: 8.0,
            color_space: None,
        };
        // use_exif is on but exiftool is missing; enrichment failure must
        // not sink the probe result.
        let metadata = service.get_or_probe_with(&file, Some(&info)).unwrap();
        assert_eq!(metadata.codec, "h264");
        assert_eq!(metadata.duration, Some(8.0));
        assert_eq!(metadata.megapixels, Some(1));

        // Second lookup comes from the cache even without base info.
        let cached = service.get_or_probe(&file).unwrap();
        assert_eq!(cached, metadata);
    }

    #[test]
    fn prune_failed_removes_only_failed_paths() {
        let dir = tempfile::tempdir().unwrap();
        let (_bus, service, input) = service_over(dir.path());

        let bad = input.join("bad.mp4");
        fs::write(&bad, b"junk").unwrap();
        let bad_file = VideoFile::new(&bad, 4);
        assert!(service.get_or_probe(&bad_file).is_none());

        let mut pending: VecDeque<VideoFile> = VecDeque::from(vec![
            VideoFile::new(input.join("ok.mp4"), 10),
            bad_file.clone(),
            VideoFile::new(input.join("ok2.mp4"), 10),
        ]);
        assert_eq!(service.prune_failed(&mut pending), 1);
        assert_eq!(pending.len(), 2);
        assert!(pending.iter().all(|f| f.path != bad));
    }
}
