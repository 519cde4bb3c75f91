use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::vbc_core::config::AppConfig;
use crate::vbc_core::engine::Orchestrator;
use crate::vbc_core::events::{EventBus, PipelineEvent};
use crate::vbc_core::tools::ToolPaths;

/// Captures every published event for post-run assertions.
pub(super) fn capture_events(bus: &EventBus) -> Arc<Mutex<Vec<PipelineEvent>>> {
    let captured = Arc::new(Mutex::new(Vec::new()));
    let sink = captured.clone();
    bus.subscribe_all(move |event| {
        sink.lock().unwrap().push(event.clone());
    });
    captured
}

pub(super) fn build_orchestrator(
    config: AppConfig,
    tools: ToolPaths,
    input_dirs: Vec<PathBuf>,
) -> (Arc<EventBus>, Arc<Mutex<Vec<PipelineEvent>>>, Orchestrator) {
    let bus = Arc::new(EventBus::new());
    let events = capture_events(&bus);
    let orchestrator =
        Orchestrator::new(config, bus.clone(), tools, input_dirs, None).expect("orchestrator");
    (bus, events, orchestrator)
}

#[cfg(unix)]
pub(super) fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Mock ffprobe emitting a fixed-duration h264 stream dump for any input.
#[cfg(unix)]
pub(super) fn write_mock_ffprobe(dir: &Path, duration_secs: u32) -> PathBuf {
    write_script(
        dir,
        "ffprobe",
        &format!(
            r#"cat <<'EOF'
{{"streams": [{{"codec_type": "video", "codec_name": "h264", "width": 1920,
  "height": 1080, "avg_frame_rate": "30/1"}}],
 "format": {{"duration": "{duration_secs}"}}}}
EOF"#
        ),
    )
}

/// Mock exiftool answering tag dumps with a fixed camera model and accepting
/// any write invocation.
#[cfg(unix)]
pub(super) fn write_mock_exiftool(dir: &Path) -> PathBuf {
    write_script(
        dir,
        "exiftool",
        r#"case "$1" in
  -j) echo '[{"EXIF:Model": "MockCam"}]' ;;
  *) : ;;
esac"#,
    )
}

/// Mock ffmpeg: logs each invocation, emits one progress line, then writes
/// `output_bytes` zeros to its final argument (the `.tmp` path). When the
/// argument list selects the GPU encoder and a `hw_cap` sentinel file exists
/// beside the script, it reports the capability error and exits 187 instead.
#[cfg(unix)]
pub(super) fn write_mock_ffmpeg(dir: &Path, output_bytes: u32) -> PathBuf {
    let log = dir.join("ffmpeg.log");
    let sentinel = dir.join("hw_cap");
    write_script(
        dir,
        "ffmpeg",
        &format!(
            r#"echo "$@" >> "{log}"
gpu=0
for arg in "$@"; do
  [ "$arg" = "av1_nvenc" ] && gpu=1
  last="$arg"
done
if [ "$gpu" = "1" ] && [ -e "{sentinel}" ]; then
  echo "Hardware is lacking required capabilities" >&2
  exit 187
fi
echo "frame=  100 fps= 30 time=00:00:05.00 bitrate= 900.0kbits/s speed=1.0x" >&2
head -c {output_bytes} /dev/zero > "$last"
exit 0"#,
            log = log.display(),
            sentinel = sentinel.display(),
        ),
    )
}

#[cfg(unix)]
pub(super) fn ffmpeg_invocations(dir: &Path) -> Vec<String> {
    fs::read_to_string(dir.join("ffmpeg.log"))
        .map(|content| content.lines().map(str::to_string).collect())
        .unwrap_or_default()
}

pub(super) fn write_source(path: &Path, bytes: usize) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, vec![7u8; bytes]).unwrap();
}
