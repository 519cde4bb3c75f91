use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result, anyhow, bail};
use serde_json::Value;

use crate::vbc_core::domain::normalize_codec;

/// The probe fields the pipeline consumes, normalized from ffprobe's JSON.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamInfo {
    pub width: u32,
    pub height: u32,
    pub codec: String,
    pub audio_codec: Option<String>,
    pub fps: f64,
    pub duration: f64,
    pub color_space: Option<String>,
}

/// Wrapper around ffprobe's JSON stream/format dump.
#[derive(Debug, Clone)]
pub struct FfprobeAdapter {
    tool: PathBuf,
}

impl FfprobeAdapter {
    pub fn new(tool: PathBuf) -> Self {
        Self { tool }
    }

    pub fn stream_info(&self, source: &Path) -> Result<StreamInfo> {
        let output = Command::new(&self.tool)
            .arg("-v")
            .arg("quiet")
            .arg("-print_format")
            .arg("json")
            .arg("-show_streams")
            .arg("-show_format")
            .arg(source.as_os_str())
            .output()
            .with_context(|| format!("failed to run ffprobe on {}", source.display()))?;

        if !output.status.success() {
            bail!(
                "ffprobe failed for {}: {}",
                source.display(),
                String::from_utf8_lossy(&output.stderr)
            );
        }

        let data: Value = serde_json::from_slice(&output.stdout)
            .with_context(|| format!("ffprobe produced invalid JSON for {}", source.display()))?;
        parse_stream_info(&data)
            .with_context(|| format!("no usable video stream in {}", source.display()))
    }
}

/// Pure parse of an ffprobe JSON dump, split out so it can be exercised
/// without spawning the tool.
pub fn parse_stream_info(data: &Value) -> Result<StreamInfo> {
    let streams = data
        .get("streams")
        .and_then(Value::as_array)
        .ok_or_else(|| anyhow!("missing streams array"))?;

    let video = streams
        .iter()
        .find(|s| s.get("codec_type").and_then(Value::as_str) == Some("video"))
        .ok_or_else(|| anyhow!("no video stream found"))?;
    let audio_codec = streams
        .iter()
        .find(|s| s.get("codec_type").and_then(Value::as_str) == Some("audio"))
        .and_then(|s| s.get("codec_name").and_then(Value::as_str))
        .map(str::to_string);

    let format = data.get("format").cloned().unwrap_or(Value::Null);

    Ok(StreamInfo {
        width: video.get("width").and_then(Value::as_u64).unwrap_or(0) as u32,
        height: video.get("height").and_then(Value::as_u64).unwrap_or(0) as u32,
        codec: normalize_codec(
            video
                .get("codec_name")
                .and_then(Value::as_str)
                .unwrap_or("unknown"),
        ),
        audio_codec,
        fps: parse_fps(video.get("avg_frame_rate")),
        duration: resolve_duration(&format, video),
        color_space: video
            .get("color_space")
            .and_then(Value::as_str)
            .map(str::to_string),
    })
}

/// Prefers `avg_frame_rate`; `r_frame_rate` is often just the timebase.
/// Values above 240 fps are treated as bogus container metadata.
fn parse_fps(raw: Option<&Value>) -> f64 {
    let text = match raw {
        Some(Value::String(s)) => s.as_str(),
        _ => return 0.0,
    };
    let candidate = if let Some((num, den)) = text.split_once('/') {
        match (num.trim().parse::<f64>(), den.trim().parse::<f64>()) {
            (Ok(num), Ok(den)) if den != 0.0 => num / den,
            _ => return 0.0,
        }
    } else {
        match text.trim().parse::<f64>() {
            Ok(value) => value,
            Err(_) => return 0.0,
        }
    };
    if candidate > 240.0 { 0.0 } else { candidate.round() }
}

/// Duration fallback chain: `format.duration` → format `DURATION` tag →
/// `stream.duration` → stream `DURATION` tag → `duration_ts * time_base` →
/// `size * 8 / bit_rate`.
fn resolve_duration(format: &Value, video: &Value) -> f64 {
    let duration = value_as_f64(format.get("duration"));
    if duration > 0.0 {
        return duration;
    }

    let duration = duration_from_tags(format.get("tags"));
    if duration > 0.0 {
        return duration;
    }

    let duration = value_as_f64(video.get("duration"));
    if duration > 0.0 {
        return duration;
    }

    let duration = duration_from_tags(video.get("tags"));
    if duration > 0.0 {
        return duration;
    }

    let duration = duration_from_time_base(video.get("duration_ts"), video.get("time_base"));
    if duration > 0.0 {
        return duration;
    }

    let bit_rate = value_as_f64(format.get("bit_rate")).max(value_as_f64(video.get("bit_rate")));
    let size = value_as_f64(format.get("size"));
    if bit_rate > 0.0 && size > 0.0 {
        return size * 8.0 / bit_rate;
    }
    0.0
}

fn duration_from_tags(tags: Option<&Value>) -> f64 {
    let Some(tags) = tags.and_then(Value::as_object) else {
        return 0.0;
    };
    let raw = tags
        .get("DURATION")
        .or_else(|| tags.get("duration"))
        .and_then(Value::as_str)
        .unwrap_or_default();
    parse_duration_tag(raw)
}

/// Accepts plain seconds, `MM:SS` and `HH:MM:SS[.fff]` tag formats.
fn parse_duration_tag(raw: &str) -> f64 {
    let text = raw.trim();
    if text.is_empty() {
        return 0.0;
    }
    if let Ok(seconds) = text.parse::<f64>() {
        return seconds;
    }
    let parts: Vec<&str> = text.split(':').collect();
    let parsed: Option<Vec<f64>> = parts.iter().map(|p| p.trim().parse::<f64>().ok()).collect();
    match parsed.as_deref() {
        Some([minutes, seconds]) => minutes * 60.0 + seconds,
        Some([hours, minutes, seconds]) => hours * 3600.0 + minutes * 60.0 + seconds,
        _ => 0.0,
    }
}

fn duration_from_time_base(duration_ts: Option<&Value>, time_base: Option<&Value>) -> f64 {
    let ticks = value_as_f64(duration_ts);
    let Some(base) = time_base.and_then(Value::as_str) else {
        return 0.0;
    };
    let Some((num, den)) = base.split_once('/') else {
        return 0.0;
    };
    let (Ok(num), Ok(den)) = (num.trim().parse::<f64>(), den.trim().parse::<f64>()) else {
        return 0.0;
    };
    if den == 0.0 || ticks <= 0.0 {
        return 0.0;
    }
    ticks * num / den
}

/// ffprobe numbers often arrive as strings; accept both.
fn value_as_f64(value: Option<&Value>) -> f64 {
    match value {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0.0),
        _ => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn probe_dump(video: Value, format: Value) -> Value {
        json!({ "streams": [video], "format": format })
    }

    fn base_video() -> Value {
        json!({
            "codec_type": "video",
            "codec_name": "hevc",
            "width": 1920,
            "height": 1080,
            "avg_frame_rate": "30000/1001",
        })
    }

    #[test]
    fn parses_basic_video_stream() {
        let data = probe_dump(base_video(), json!({ "duration": "12.5" }));
        let info = parse_stream_info(&data).unwrap();
        assert_eq!(info.width, 1920);
        assert_eq!(info.height, 1080);
        assert_eq!(info.codec, "hevc");
        assert_eq!(info.fps, 30.0);
        assert_eq!(info.duration, 12.5);
    }

    #[test]
    fn rejects_dump_without_video_stream() {
        let data = json!({ "streams": [{ "codec_type": "audio", "codec_name": "aac" }] });
        assert!(parse_stream_info(&data).is_err());
    }

    #[test]
    fn normalizes_track_codec_identifiers() {
        let mut video = base_video();
        video["codec_name"] = json!("hvc1");
        let info = parse_stream_info(&probe_dump(video, json!({}))).unwrap();
        assert_eq!(info.codec, "hevc");
    }

    #[test]
    fn picks_up_audio_codec_and_color_space() {
        let mut video = base_video();
        video["color_space"] = json!("reserved");
        let data = json!({
            "streams": [video, { "codec_type": "audio", "codec_name": "aac" }],
            "format": {},
        });
        let info = parse_stream_info(&data).unwrap();
        assert_eq!(info.audio_codec.as_deref(), Some("aac"));
        assert_eq!(info.color_space.as_deref(), Some("reserved"));
    }

    #[test]
    fn implausible_frame_rates_collapse_to_zero() {
        let mut video = base_video();
        video["avg_frame_rate"] = json!("90000/1");
        let info = parse_stream_info(&probe_dump(video, json!({}))).unwrap();
        assert_eq!(info.fps, 0.0);
    }

    #[test]
    fn duration_falls_back_to_format_tag() {
        let data = probe_dump(
            base_video(),
            json!({ "tags": { "DURATION": "01:02:03.5" } }),
        );
        let info = parse_stream_info(&data).unwrap();
        assert_eq!(info.duration, 3723.5);
    }

    #[test]
    fn duration_falls_back_to_stream_fields() {
        let mut video = base_video();
        video["duration"] = json!("42.0");
        let info = parse_stream_info(&probe_dump(video, json!({}))).unwrap();
        assert_eq!(info.duration, 42.0);

        let mut video = base_video();
        video["tags"] = json!({ "duration": "02:30" });
        let info = parse_stream_info(&probe_dump(video, json!({}))).unwrap();
        assert_eq!(info.duration, 150.0);
    }

    #[test]
    fn duration_falls_back_to_time_base_then_bitrate() {
        let mut video = base_video();
        video["duration_ts"] = json!(90000);
        video["time_base"] = json!("1/9000");
        let info = parse_stream_info(&probe_dump(video, json!({}))).unwrap();
        assert_eq!(info.duration, 10.0);

        let data = probe_dump(
            base_video(),
            json!({ "size": "1000000", "bit_rate": "800000" }),
        );
        let info = parse_stream_info(&data).unwrap();
        assert_eq!(info.duration, 10.0);
    }

    #[test]
    fn unresolvable_duration_reports_zero() {
        let info = parse_stream_info(&probe_dump(base_video(), json!({}))).unwrap();
        assert_eq!(info.duration, 0.0);
    }
}
