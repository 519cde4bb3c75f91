use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::vbc_core::config::CqRule;

/// Per-attempt timeout for the deep metadata copy when running in debug
/// mode; outside debug mode the copy is a single blocking call.
const COPY_TIMEOUT: Duration = Duration::from_secs(30);
const COPY_MAX_ATTEMPTS: u32 = 2;

/// Camera tag aliases in priority order. The first group that yields a value
/// wins; groups are ordered model → make → vendor id → platform.
const CAMERA_TAG_GROUPS: &[&[&str]] = &[
    &[
        "EXIF:Model",
        "QuickTime:Model",
        "Model",
        "CameraModelName",
        "XMP:CameraModelName",
        "DeviceModelName",
        "QuickTime:DeviceModelName",
        "H264:Model",
        "M2TS:Model",
    ],
    &["EXIF:Make", "QuickTime:Make", "Make", "XMP:Make", "H264:Make", "M2TS:Make"],
    &["QuickTime:HandlerVendorID", "HandlerVendorID", "HandlerVendorId"],
    &["Platform"],
];

/// Camera-derived attributes the classifier and CQ selection consume.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExifSummary {
    pub camera_model: Option<String>,
    pub camera_raw: Option<String>,
    pub custom_cq: Option<u8>,
    pub bitrate_kbps: Option<f64>,
    pub matched_pattern: Option<String>,
    /// True when the file already carries VBC provenance tags.
    pub vbc_encoded: bool,
}

/// Provenance written onto every completed output.
#[derive(Debug, Clone)]
pub struct ProvenanceTags {
    pub original_name: String,
    pub original_size: u64,
    pub cq: u8,
    pub encoder_label: String,
    pub finished_at: String,
}

impl ProvenanceTags {
    fn as_args(&self) -> Vec<String> {
        vec![
            format!("-XMP:VBCOriginalName={}", self.original_name),
            format!("-XMP:VBCOriginalSize={}", self.original_size),
            format!("-XMP:VBCQuality={}", self.cq),
            format!("-XMP:VBCEncoder={}", self.encoder_label),
            format!("-XMP:VBCFinishedAt={}", self.finished_at),
        ]
    }
}

/// Wrapper around exiftool for tag extraction and metadata copy.
#[derive(Debug, Clone)]
pub struct ExifToolAdapter {
    tool: PathBuf,
}

impl ExifToolAdapter {
    pub fn new(tool: PathBuf) -> Self {
        Self { tool }
    }

    /// Dumps all tags of `source` as a group-prefixed JSON object.
    pub fn extract_tags(&self, source: &Path) -> Result<Map<String, Value>> {
        let output = Command::new(&self.tool)
            .arg("-j")
            .arg("-G")
            .arg(source.as_os_str())
            .output()
            .with_context(|| format!("failed to run exiftool on {}", source.display()))?;

        if !output.status.success() {
            bail!(
                "exiftool failed for {}: {}",
                source.display(),
                String::from_utf8_lossy(&output.stderr)
            );
        }

        let parsed: Vec<Map<String, Value>> = serde_json::from_slice(&output.stdout)
            .with_context(|| format!("exiftool produced invalid JSON for {}", source.display()))?;
        parsed
            .into_iter()
            .next()
            .with_context(|| format!("exiftool returned no tags for {}", source.display()))
    }

    pub fn extract_exif_info(&self, source: &Path, dynamic_cq: &[CqRule]) -> Result<ExifSummary> {
        let tags = self.extract_tags(source)?;
        Ok(summarize_tags(&tags, dynamic_cq))
    }

    /// Deep tag copy from `source` onto `output` plus provenance tags.
    ///
    /// Never fails the surrounding job: generic errors are logged and
    /// swallowed; only a debug-mode timeout leaves a warning in the `.err`
    /// sidecar.
    pub fn copy_deep_metadata(
        &self,
        source: &Path,
        output: &Path,
        err_path: &Path,
        provenance: &ProvenanceTags,
        debug: bool,
    ) {
        let filename = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let args = self.deep_copy_args(source, output, provenance);

        if !debug {
            let result = Command::new(&self.tool)
                .args(&args)
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status();
            match result {
                Ok(status) if status.success() => {}
                Ok(status) => {
                    warn!(file = %filename, ?status, "metadata copy exited non-zero");
                }
                Err(err) => warn!(file = %filename, %err, "failed to copy deep metadata"),
            }
            return;
        }

        let mut timed_out = false;
        for attempt in 1..=COPY_MAX_ATTEMPTS {
            info!(file = %filename, attempt, max = COPY_MAX_ATTEMPTS, "EXIF_COPY_START");
            let started = Instant::now();
            let mut cmd = Command::new(&self.tool);
            cmd.args(&args).stdout(Stdio::null()).stderr(Stdio::null());
            match run_with_timeout(&mut cmd, COPY_TIMEOUT) {
                Ok(Some(status)) => {
                    timed_out = false;
                    if status.success() {
                        info!(
                            file = %filename,
                            attempt,
                            elapsed_s = started.elapsed().as_secs_f64(),
                            "EXIF_COPY_DONE"
                        );
                    } else {
                        warn!(file = %filename, ?status, "EXIF_COPY_ERROR");
                    }
                    break;
                }
                Ok(None) => {
                    timed_out = true;
                    warn!(
                        file = %filename,
                        attempt,
                        timeout_s = COPY_TIMEOUT.as_secs(),
                        "EXIF_COPY_TIMEOUT"
                    );
                }
                Err(err) => {
                    timed_out = false;
                    warn!(file = %filename, %err, "EXIF_COPY_ERROR");
                    break;
                }
            }
        }

        if timed_out {
            let message = format!(
                "ExifTool metadata copy timed out after {}s ({} attempts).",
                COPY_TIMEOUT.as_secs(),
                COPY_MAX_ATTEMPTS
            );
            if let Err(err) = std::fs::write(err_path, &message) {
                warn!(marker = %err_path.display(), %err, "failed to record metadata-copy timeout");
            }
        }
    }

    /// Writes provenance tags only (metadata copy disabled).
    pub fn write_provenance_tags(&self, output: &Path, provenance: &ProvenanceTags) {
        let mut args = vec!["-overwrite_original".to_string()];
        args.extend(provenance.as_args());
        args.push(output.to_string_lossy().into_owned());

        let result = Command::new(&self.tool)
            .args(&args)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        match result {
            Ok(status) if status.success() => {}
            Ok(status) => warn!(output = %output.display(), ?status, "provenance tag write failed"),
            Err(err) => warn!(output = %output.display(), %err, "provenance tag write failed"),
        }
    }

    fn deep_copy_args(
        &self,
        source: &Path,
        output: &Path,
        provenance: &ProvenanceTags,
    ) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "-m".into(),
            "-tagsFromFile".into(),
            source.to_string_lossy().into_owned(),
            "-XMP:all".into(),
            "-QuickTime:all".into(),
            "-Keys:all".into(),
            "-UserData:all".into(),
            "-EXIF:all".into(),
            "-GPS:all".into(),
            "-XMP-exif:GPSLatitude<GPSLatitude".into(),
            "-XMP-exif:GPSLongitude<GPSLongitude".into(),
            "-XMP-exif:GPSAltitude<GPSAltitude".into(),
            "-XMP-exif:GPSPosition<GPSPosition".into(),
            "-QuickTime:GPSCoordinates<GPSPosition".into(),
            "-Keys:GPSCoordinates<GPSPosition".into(),
        ];
        args.extend(provenance.as_args());
        args.push("-unsafe".into());
        args.push("-overwrite_original".into());
        args.push(output.to_string_lossy().into_owned());
        args
    }
}

/// Polls the child until it exits or the deadline passes; a timed-out child
/// is killed. Returns None on timeout.
fn run_with_timeout(
    cmd: &mut Command,
    timeout: Duration,
) -> Result<Option<std::process::ExitStatus>> {
    let mut child = cmd.spawn().context("failed to spawn exiftool")?;
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait().context("failed to poll exiftool")? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            return Ok(None);
        }
        std::thread::sleep(Duration::from_millis(100));
    }
}

/// Pure summary of an exiftool tag dump: camera normalization, dynamic-CQ
/// matching and provenance detection.
pub fn summarize_tags(tags: &Map<String, Value>, dynamic_cq: &[CqRule]) -> ExifSummary {
    let camera_raw = extract_camera_raw(tags);

    let mut camera_model = None;
    let mut custom_cq = None;
    let mut matched_pattern = None;

    // Prefer a match against the extracted camera tag; fall back to a scan
    // over every tag value. Rule order decides ambiguous matches.
    if let Some(raw) = &camera_raw {
        for rule in dynamic_cq {
            if raw.contains(&rule.pattern) {
                camera_model = Some(raw.clone());
                custom_cq = Some(rule.cq);
                matched_pattern = Some(rule.pattern.clone());
                break;
            }
        }
    }
    if custom_cq.is_none() {
        let full_text = tag_values_text(tags);
        for rule in dynamic_cq {
            if full_text.contains(&rule.pattern) {
                camera_model = Some(rule.pattern.clone());
                custom_cq = Some(rule.cq);
                matched_pattern = Some(rule.pattern.clone());
                break;
            }
        }
    }
    if camera_model.is_none() {
        camera_model = camera_raw.clone();
    }

    let vbc_encoded = tags.keys().any(|key| {
        let lower = key.to_ascii_lowercase();
        lower.contains("vbcencoder") || lower.contains("vbc encoder")
    });

    let bitrate_kbps = tags
        .get("QuickTime:AvgBitrate")
        .or_else(|| tags.get("AvgBitrate"))
        .and_then(value_to_f64)
        .map(|bps| bps / 1000.0);

    ExifSummary {
        camera_model,
        camera_raw,
        custom_cq,
        bitrate_kbps,
        matched_pattern,
        vbc_encoded,
    }
}

/// First matching alias wins; MTS manufacturer ids map to vendor names.
fn extract_camera_raw(tags: &Map<String, Value>) -> Option<String> {
    for group in CAMERA_TAG_GROUPS {
        for tag in *group {
            let Some(value) = tags.get(*tag) else {
                continue;
            };
            let text = value_to_text(value);
            let trimmed = text.trim();
            if trimmed.is_empty() {
                continue;
            }
            return Some(match trimmed {
                "257" => "Canon".to_string(),
                "258" => "Sony".to_string(),
                "259" => "Panasonic".to_string(),
                "260" => "JVC".to_string(),
                other => other.to_string(),
            });
        }
    }
    None
}

fn tag_values_text(tags: &Map<String, Value>) -> String {
    let mut text = String::new();
    for value in tags.values() {
        text.push_str(&value_to_text(value));
        text.push(' ');
    }
    text
}

fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn value_to_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
