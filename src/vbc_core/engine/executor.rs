use std::fs;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::{Local, SecondsFormat};
use filetime::FileTime;
use tracing::{debug, error, info, warn};

use super::Shared;
use crate::vbc_core::config::GeneralConfig;
use crate::vbc_core::discovery::err_path_for;
use crate::vbc_core::domain::{CompressionJob, JobStatus, VideoFile};
use crate::vbc_core::events::PipelineEvent;
use crate::vbc_core::exiftool::ProvenanceTags;
use crate::vbc_core::metadata_cache::CORRUPT_SOURCE_MESSAGE;

/// Deletes a remediation temp file when the job is done with it, no matter
/// which exit path ran.
struct TempGuard(Option<PathBuf>);

impl Drop for TempGuard {
    fn drop(&mut self) {
        if let Some(path) = self.0.take()
            && path.exists()
            && let Err(err) = fs::remove_file(&path)
        {
            warn!(temp = %path.display(), %err, "failed to clean up temp file");
        }
    }
}

/// Runs one file through the full state machine, gated on the scheduler's
/// admission condition. Panics and unexpected errors become FAILED jobs
/// with an `.err` sidecar; they never take the worker down.
pub(super) fn process_file(shared: &Arc<Shared>, video_file: VideoFile) {
    let filename = video_file.file_name();
    if !shared.control.admit_worker() {
        debug!(file = %filename, "skipping job: shutdown requested");
        return;
    }

    let outcome = catch_unwind(AssertUnwindSafe(|| run_job(shared, &video_file)));
    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            report_exception(shared, &video_file, format!("Exception: {err:#}"));
        }
        Err(payload) => {
            report_exception(
                shared,
                &video_file,
                format!("Exception: {}", panic_payload_to_string(&*payload)),
            );
        }
    }

    shared.control.release_worker();
}

fn run_job(shared: &Arc<Shared>, video_file: &VideoFile) -> Result<()> {
    let general = &shared.config.general;
    let filename = video_file.file_name();
    let started = Instant::now();

    if general.debug {
        info!(file = %filename, "PROCESS_START");
    }

    // Admission against sidecar state.
    let Some(output_path) = shared.layout.output_path_for(&video_file.path) else {
        error!(file = %filename, "cannot determine input folder; skipping");
        return Ok(());
    };
    fs::create_dir_all(output_path.parent().unwrap_or(Path::new(".")))
        .with_context(|| format!("failed to create output directory for {filename}"))?;
    let err_path = err_path_for(&output_path);

    if err_path.exists() {
        if general.clean_errors {
            let _ = fs::remove_file(&err_path);
        } else {
            let mut job = CompressionJob::new(video_file.clone());
            job.status = JobStatus::Skipped;
            job.error_message = Some("Existing error marker found".into());
            publish_failed(shared, job);
            return Ok(());
        }
    }

    // Probe; a failure here is the corrupt-source terminal path.
    let stream_info = match shared.ffprobe.stream_info(&video_file.path) {
        Ok(info) => info,
        Err(err) => {
            error!(file = %filename, %err, "corrupted file detected (ffprobe failed)");
            if let Err(write_err) = fs::write(&err_path, CORRUPT_SOURCE_MESSAGE) {
                warn!(marker = %err_path.display(), %write_err, "failed to write error marker");
            }
            let mut job = CompressionJob::with_output(video_file.clone(), output_path);
            job.status = JobStatus::Failed;
            job.error_message = Some(CORRUPT_SOURCE_MESSAGE.into());
            publish_failed(shared, job);
            return Ok(());
        }
    };

    // "reserved" color spaces break the AV1 encoders; remux through the
    // matching bitstream filter first and encode from the remuxed copy.
    let (encode_input, temp_fixed) =
        if stream_info.color_space.as_deref() == Some("reserved") {
            shared
                .ffmpeg
                .fix_color_space(&video_file.path, &output_path, &stream_info.codec)
        } else {
            (video_file.path.clone(), None)
        };
    let _temp_guard = TempGuard(temp_fixed);

    // Classification needs metadata; reuse the probe we already paid for.
    let mut video_file = video_file.clone();
    video_file.metadata = shared
        .metadata
        .get_or_probe_with(&video_file, Some(&stream_info));

    if general.skip_av1
        && let Some(meta) = &video_file.metadata
        && meta.codec.to_ascii_lowercase().contains("av1")
    {
        let mut job = CompressionJob::new(video_file.clone());
        job.status = JobStatus::Skipped;
        job.error_message = Some("Already encoded in AV1".into());
        publish_failed(shared, job);
        return Ok(());
    }

    if !general.filter_cameras.is_empty() {
        let cam_model = video_file
            .metadata
            .as_ref()
            .and_then(|meta| meta.camera_model.clone().or_else(|| meta.camera_raw.clone()))
            .unwrap_or_default();
        let matched = general
            .filter_cameras
            .iter()
            .any(|filter| cam_model.to_lowercase().contains(&filter.to_lowercase()));
        if !matched {
            let mut job = CompressionJob::new(video_file.clone());
            job.status = JobStatus::Skipped;
            job.error_message = Some(format!("Camera model \"{cam_model}\" not in filter"));
            publish_failed(shared, job);
            return Ok(());
        }
    }

    let target_cq = determine_cq(&video_file, general);
    let rotation = determine_rotation(&video_file, shared);

    let mut job_config = general.clone();
    job_config.cq = target_cq;

    let mut job = CompressionJob::with_output(video_file.clone(), output_path.clone());
    job.rotation_angle = rotation.unwrap_or(0);

    shared
        .bus
        .publish(&PipelineEvent::JobStarted { job: job.clone() });
    job.status = JobStatus::Processing;

    shared.ffmpeg.compress(
        &mut job,
        &job_config,
        rotation,
        &shared.control.shutdown_signal,
        (encode_input != video_file.path).then_some(encode_input.as_path()),
    );

    if job.status == JobStatus::HwCapLimit && general.cpu_fallback && job_config.gpu {
        info!(file = %filename, "hardware capability exceeded; retrying on CPU");
        job_config.gpu = false;
        job.status = JobStatus::Processing;
        job.error_message = None;
        shared.ffmpeg.compress(
            &mut job,
            &job_config,
            rotation,
            &shared.control.shutdown_signal,
            (encode_input != video_file.path).then_some(encode_input.as_path()),
        );
    }

    match job.status {
        JobStatus::Completed => {
            if output_path.exists() {
                finalize_completed(shared, &video_file, &mut job, &job_config, &err_path)?;
            }
            job.duration_seconds = Some(started.elapsed().as_secs_f64());
            shared
                .bus
                .publish(&PipelineEvent::JobCompleted { job: job.clone() });
            if general.debug {
                info!(file = %filename, elapsed_s = started.elapsed().as_secs_f64(),
                    "PROCESS_END status=completed");
            }
        }
        JobStatus::Interrupted => {
            // No .err marker: a plain re-run should retry the file.
            publish_failed(shared, job);
            if general.debug {
                info!(file = %filename, "PROCESS_END status=interrupted");
            }
        }
        JobStatus::HwCapLimit | JobStatus::Failed => {
            // The terminal event was already published by the encode
            // adapter; only the sidecar is written here.
            let message = job.error_message.as_deref().unwrap_or("Unknown error");
            fs::write(&err_path, message)
                .with_context(|| format!("failed to write error marker for {filename}"))?;
            if general.debug {
                info!(file = %filename, status = ?job.status, "PROCESS_END");
            }
        }
        JobStatus::Processing | JobStatus::Pending | JobStatus::Skipped => {
            job.status = JobStatus::Failed;
            job.error_message = Some("Compression finished but status not updated".into());
            let message = job.error_message.clone().unwrap_or_default();
            let _ = fs::write(&err_path, &message);
            publish_failed(shared, job);
        }
    }

    Ok(())
}

/// Metadata copy, ratio check and output-size accounting for a successful
/// encode.
fn finalize_completed(
    shared: &Arc<Shared>,
    video_file: &VideoFile,
    job: &mut CompressionJob,
    job_config: &GeneralConfig,
    err_path: &Path,
) -> Result<()> {
    let output_path = job
        .output_path
        .clone()
        .context("completed job without output path")?;

    let encoder_label = if job_config.gpu {
        "NVENC AV1 (GPU)"
    } else {
        "SVT-AV1 (CPU)"
    };
    let provenance = ProvenanceTags {
        original_name: video_file.file_name(),
        original_size: video_file.size_bytes,
        cq: job_config.cq,
        encoder_label: encoder_label.to_string(),
        finished_at: Local::now().to_rfc3339_opts(SecondsFormat::Secs, false),
    };

    if shared.config.general.copy_metadata {
        shared.exiftool.copy_deep_metadata(
            &video_file.path,
            &output_path,
            err_path,
            &provenance,
            shared.config.general.debug,
        );
    } else {
        shared.exiftool.write_provenance_tags(&output_path, &provenance);
    }

    // Ratio check: an encode that saves less than the configured fraction is
    // discarded and the source byte-copied over the output. The copy keeps
    // the source mtime so the next run classifies it already-compressed.
    let out_size = fs::metadata(&output_path)
        .with_context(|| format!("failed to stat output {}", output_path.display()))?
        .len();
    let in_size = video_file.size_bytes.max(1);
    let ratio = out_size as f64 / in_size as f64;
    if ratio > 1.0 - shared.config.general.min_compression_ratio {
        fs::copy(&video_file.path, &output_path).with_context(|| {
            format!("failed to restore original over {}", output_path.display())
        })?;
        if let Ok(source_meta) = fs::metadata(&video_file.path) {
            let mtime = FileTime::from_last_modification_time(&source_meta);
            if let Err(err) = filetime::set_file_mtime(&output_path, mtime) {
                warn!(output = %output_path.display(), %err, "failed to preserve source mtime");
            }
        }
        job.error_message = Some(format!("Ratio {ratio:.2} above threshold, kept original"));
    }

    job.output_size_bytes = fs::metadata(&output_path).map(|meta| meta.len()).ok();
    Ok(())
}

/// Per-file CQ: explicit override, then the first dynamic rule whose pattern
/// occurs in the camera model, then the configured default.
fn determine_cq(file: &VideoFile, general: &GeneralConfig) -> u8 {
    let Some(metadata) = &file.metadata else {
        return general.cq;
    };
    if let Some(custom) = metadata.custom_cq {
        return custom;
    }
    let Some(model) = &metadata.camera_model else {
        return general.cq;
    };
    for rule in &general.dynamic_cq {
        if model.contains(&rule.pattern) {
            return rule.cq;
        }
    }
    general.cq
}

/// Manual override first, then the first autorotate pattern matching the
/// filename.
fn determine_rotation(file: &VideoFile, shared: &Arc<Shared>) -> Option<u32> {
    if let Some(manual) = shared.config.general.manual_rotation {
        return Some(manual);
    }
    let filename = file.file_name();
    for rule in &shared.config.autorotate.patterns {
        // Patterns were validated at config load.
        let Ok(pattern) = regex::Regex::new(&rule.pattern) else {
            continue;
        };
        if pattern.is_match(&filename) {
            return Some(rule.angle);
        }
    }
    None
}

fn publish_failed(shared: &Arc<Shared>, job: CompressionJob) {
    let message = job.error_message.clone().unwrap_or_default();
    shared.bus.publish(&PipelineEvent::JobFailed {
        job,
        error_message: message,
    });
}

/// Unexpected error or panic inside a worker: record it on disk and in the
/// event stream, matching the ordinary failure contract.
fn report_exception(shared: &Arc<Shared>, video_file: &VideoFile, message: String) {
    error!(file = %video_file.file_name(), %message, "job processing failed");
    let output_path = shared.layout.output_path_for(&video_file.path);
    if let Some(output_path) = &output_path {
        let err_path = err_path_for(output_path);
        if err_path
            .parent()
            .map(|parent| fs::create_dir_all(parent).is_ok())
            .unwrap_or(false)
            && let Err(err) = fs::write(&err_path, &message)
        {
            warn!(marker = %err_path.display(), %err, "failed to write error marker");
        }
    }
    let mut job = CompressionJob::new(video_file.clone());
    job.status = JobStatus::Failed;
    job.output_path = output_path;
    job.error_message = Some(message);
    publish_failed(shared, job);
}

fn panic_payload_to_string(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        return (*s).to_string();
    }
    if let Some(s) = payload.downcast_ref::<String>() {
        return s.clone();
    }
    "unknown panic payload".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vbc_core::config::CqRule;
    use crate::vbc_core::domain::VideoMetadata;

    fn file_with_camera(model: Option<&str>, custom_cq: Option<u8>) -> VideoFile {
        let mut file = VideoFile::new("/in/clip.mp4", 1_000);
        let mut meta = VideoMetadata::from_dimensions(1920, 1080, "hevc", 30.0);
        meta.camera_model = model.map(str::to_string);
        meta.custom_cq = custom_cq;
        file.metadata = Some(meta);
        file
    }

    fn general_with_rules() -> GeneralConfig {
        GeneralConfig {
            cq: 45,
            dynamic_cq: vec![
                CqRule {
                    pattern: "FX3".into(),
                    cq: 40,
                },
                CqRule {
                    pattern: "Sony".into(),
                    cq: 42,
                },
            ],
            ..GeneralConfig::default()
        }
    }

    #[test]
    fn custom_cq_override_wins() {
        let general = general_with_rules();
        let file = file_with_camera(Some("Sony FX3"), Some(33));
        assert_eq!(determine_cq(&file, &general), 33);
    }

    #[test]
    fn dynamic_rules_match_in_declaration_order() {
        let general = general_with_rules();
        // Both patterns occur in the model; the first declared rule wins.
        let file = file_with_camera(Some("Sony FX3"), None);
        assert_eq!(determine_cq(&file, &general), 40);
    }

    #[test]
    fn default_cq_applies_without_metadata_or_match() {
        let general = general_with_rules();
        assert_eq!(determine_cq(&VideoFile::new("/in/x.mp4", 1), &general), 45);
        let file = file_with_camera(Some("GoPro"), None);
        assert_eq!(determine_cq(&file, &general), 45);
        let file = file_with_camera(None, None);
        assert_eq!(determine_cq(&file, &general), 45);
    }

    #[test]
    fn panic_payloads_render_as_text() {
        assert_eq!(panic_payload_to_string(&"boom"), "boom");
        assert_eq!(panic_payload_to_string(&"boom".to_string()), "boom");
        assert_eq!(panic_payload_to_string(&42u32), "unknown panic payload");
    }
}
