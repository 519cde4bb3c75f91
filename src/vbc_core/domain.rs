use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Terminal and in-flight states of a compression job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Skipped,
    Failed,
    HwCapLimit,
    Interrupted,
}

/// Probed and EXIF-derived attributes of a source video.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VideoMetadata {
    pub width: u32,
    pub height: u32,
    /// Normalized codec name (`hvc1` and `hev1` both report as `hevc`).
    pub codec: String,
    pub audio_codec: Option<String>,
    pub fps: f64,
    /// Rounded `width * height / 1e6`; None when dimensions are unknown.
    pub megapixels: Option<u32>,
    pub color_space: Option<String>,
    pub duration: Option<f64>,
    /// Normalized camera model used for filtering and dynamic-CQ matching.
    pub camera_model: Option<String>,
    /// Camera tag value before normalization, kept for diagnostics.
    pub camera_raw: Option<String>,
    /// Per-file CQ override resolved from the dynamic-CQ rules.
    pub custom_cq: Option<u8>,
    pub bitrate_kbps: Option<f64>,
    /// True when the file already carries a VBC provenance tag.
    pub vbc_encoded: bool,
}

impl VideoMetadata {
    pub fn from_dimensions(width: u32, height: u32, codec: impl Into<String>, fps: f64) -> Self {
        let megapixels = if width > 0 && height > 0 {
            Some(((width as f64 * height as f64) / 1_000_000.0).round() as u32)
        } else {
            None
        };
        Self {
            width,
            height,
            codec: codec.into(),
            audio_codec: None,
            fps,
            megapixels,
            color_space: None,
            duration: None,
            camera_model: None,
            camera_raw: None,
            custom_cq: None,
            bitrate_kbps: None,
            vbc_encoded: false,
        }
    }
}

/// An enumerated candidate file. Created by the scanner; `metadata` is the
/// only field populated later (once, by the metadata service).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VideoFile {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub metadata: Option<VideoMetadata>,
}

impl VideoFile {
    pub fn new(path: impl Into<PathBuf>, size_bytes: u64) -> Self {
        Self {
            path: path.into(),
            size_bytes,
            metadata: None,
        }
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// A single unit of work: one source file being re-encoded to one output.
///
/// Created by the executor when processing begins and mutated only by it (the
/// dashboard works on published clones).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompressionJob {
    pub source_file: VideoFile,
    pub status: JobStatus,
    pub output_path: Option<PathBuf>,
    pub output_size_bytes: Option<u64>,
    pub error_message: Option<String>,
    pub duration_seconds: Option<f64>,
    /// 0 means no rotation; otherwise 90, 180 or 270 degrees clockwise.
    pub rotation_angle: u32,
    pub progress_percent: f64,
}

impl CompressionJob {
    pub fn new(source_file: VideoFile) -> Self {
        Self {
            source_file,
            status: JobStatus::Pending,
            output_path: None,
            output_size_bytes: None,
            error_message: None,
            duration_seconds: None,
            rotation_angle: 0,
            progress_percent: 0.0,
        }
    }

    pub fn with_output(source_file: VideoFile, output_path: PathBuf) -> Self {
        let mut job = Self::new(source_file);
        job.output_path = Some(output_path);
        job
    }

    pub fn file_name(&self) -> String {
        self.source_file.file_name()
    }
}

/// Maps container/track codec identifiers to the names the classifier and
/// skip logic reason about.
pub fn normalize_codec(raw: &str) -> String {
    match raw.to_ascii_lowercase().as_str() {
        "avc1" => "h264".to_string(),
        "hvc1" | "hev1" => "hevc".to_string(),
        "av01" => "av1".to_string(),
        "vp09" => "vp9".to_string(),
        "vp08" => "vp8".to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn codec_normalization_covers_track_identifiers() {
        assert_eq!(normalize_codec("hvc1"), "hevc");
        assert_eq!(normalize_codec("HEV1"), "hevc");
        assert_eq!(normalize_codec("avc1"), "h264");
        assert_eq!(normalize_codec("av01"), "av1");
        assert_eq!(normalize_codec("vp09"), "vp9");
        assert_eq!(normalize_codec("mpeg4"), "mpeg4");
    }

    #[test]
    fn job_status_serializes_in_screaming_case() {
        let value = serde_json::to_value(JobStatus::HwCapLimit).unwrap();
        assert_eq!(value, Value::String("HW_CAP_LIMIT".to_string()));
        let value = serde_json::to_value(JobStatus::Interrupted).unwrap();
        assert_eq!(value, Value::String("INTERRUPTED".to_string()));
    }

    #[test]
    fn video_metadata_computes_megapixels_from_dimensions() {
        let meta = VideoMetadata::from_dimensions(3840, 2160, "hevc", 29.97);
        assert_eq!(meta.megapixels, Some(8));

        let unknown = VideoMetadata::from_dimensions(0, 0, "unknown", 0.0);
        assert_eq!(unknown.megapixels, None);
    }

    #[test]
    fn compression_job_uses_camel_case_field_names() {
        let job = CompressionJob::with_output(
            VideoFile::new("/videos/input.mov", 1_000),
            PathBuf::from("/videos_out/input.mp4"),
        );
        let value = serde_json::to_value(&job).unwrap();
        assert!(value.get("sourceFile").is_some());
        assert!(value.get("outputPath").is_some());
        assert!(value.get("rotationAngle").is_some());
        assert_eq!(
            value.get("progressPercent").and_then(Value::as_f64),
            Some(0.0)
        );
    }
}
