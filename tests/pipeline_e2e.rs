//! End-to-end runs against mock tool binaries.
//!
//! The mock ffmpeg/ffprobe/exiftool scripts stand in for the real tools, so
//! these tests exercise the full pipeline surface: discovery, scheduling,
//! the executor state machine, sidecar discipline and the dashboard
//! projection.
#![cfg(unix)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use vbc::vbc_core::config::{AppConfig, GeneralConfig};
use vbc::vbc_core::dashboard::DEFAULT_RECENT_JOBS;
use vbc::vbc_core::{Dashboard, EventBus, Orchestrator, PipelineEvent, ToolPaths};

fn write_script(dir: &Path, name: &str, body: &str) {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
}

fn write_mock_tools(dir: &Path, encode_bytes: u32, encode_delay_secs: u32) {
    write_script(
        dir,
        "ffprobe",
        r#"cat <<'EOF'
{"streams": [{"codec_type": "video", "codec_name": "h264", "width": 1920,
  "height": 1080, "avg_frame_rate": "30/1"}],
 "format": {"duration": "10"}}
EOF"#,
    );
    write_script(
        dir,
        "exiftool",
        r#"case "$1" in
  -j) echo '[{"EXIF:Model": "MockCam"}]' ;;
  *) : ;;
esac"#,
    );
    write_script(
        dir,
        "ffmpeg",
        &format!(
            r#"for arg in "$@"; do last="$arg"; done
echo "frame= 10 time=00:00:05.00 speed=1x" >&2
sleep {encode_delay_secs}
head -c {encode_bytes} /dev/zero > "$last"
exit 0"#
        ),
    );
}

struct Env {
    _dir: tempfile::TempDir,
    tools: PathBuf,
    input: PathBuf,
    output: PathBuf,
}

fn env(encode_bytes: u32, encode_delay_secs: u32) -> Env {
    let dir = tempfile::tempdir().unwrap();
    let tools = dir.path().join("tools");
    fs::create_dir_all(&tools).unwrap();
    write_mock_tools(&tools, encode_bytes, encode_delay_secs);
    let input = dir.path().join("clips");
    fs::create_dir_all(&input).unwrap();
    Env {
        tools,
        output: dir.path().join("clips_out"),
        input,
        _dir: dir,
    }
}

fn config() -> AppConfig {
    AppConfig {
        general: GeneralConfig {
            gpu: false,
            threads: 2,
            min_size_bytes: 10,
            ..GeneralConfig::default()
        },
        ..AppConfig::default()
    }
}

fn write_source(path: &Path, bytes: usize) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, vec![3u8; bytes]).unwrap();
}

#[test]
fn full_run_updates_outputs_and_dashboard() {
    let env = env(100, 0);
    write_source(&env.input.join("a.mp4"), 1_000);
    write_source(&env.input.join("b.mov"), 2_000);
    write_source(&env.input.join("tiny.mp4"), 1);

    let bus = Arc::new(EventBus::new());
    let dashboard = Dashboard::new(2, DEFAULT_RECENT_JOBS);
    dashboard.attach(&bus);

    let orchestrator = Orchestrator::new(
        config(),
        bus.clone(),
        ToolPaths::in_dir(&env.tools),
        vec![env.input.clone()],
        None,
    )
    .unwrap();
    orchestrator.run().unwrap();

    assert!(env.output.join("a.mp4").exists());
    assert!(env.output.join("b.mp4").exists());

    let state = dashboard.snapshot();
    assert_eq!(state.completed_count, 2);
    assert_eq!(state.failed_count, 0);
    assert_eq!(state.ignored_small_count, 1);
    assert_eq!(state.total_input_bytes, 3_000);
    assert_eq!(state.total_output_bytes, 200);
    assert!(state.finished);
    assert!(state.active_jobs.is_empty());
    assert_eq!(state.recent_jobs.len(), 2);
    assert_eq!(dashboard.space_saved_bytes(), 2_800);
}

#[test]
fn graceful_shutdown_before_run_processes_nothing() {
    let env = env(100, 0);
    write_source(&env.input.join("a.mp4"), 1_000);

    let bus = Arc::new(EventBus::new());
    let dashboard = Dashboard::new(2, DEFAULT_RECENT_JOBS);
    dashboard.attach(&bus);

    let orchestrator = Orchestrator::new(
        config(),
        bus.clone(),
        ToolPaths::in_dir(&env.tools),
        vec![env.input.clone()],
        None,
    )
    .unwrap();

    bus.publish(&PipelineEvent::RequestShutdown);
    orchestrator.run().unwrap();

    assert!(!env.output.join("a.mp4").exists());
    let state = dashboard.snapshot();
    assert_eq!(state.completed_count, 0);
    assert!(state.shutdown_requested);
    // A clean finish is only announced for non-shutdown exits.
    assert!(!state.finished);
}

#[test]
fn interrupt_terminates_encodes_and_leaves_no_partial_output() {
    let env = env(100, 30);
    write_source(&env.input.join("slow.mp4"), 1_000);

    let bus = Arc::new(EventBus::new());
    let dashboard = Dashboard::new(2, DEFAULT_RECENT_JOBS);
    dashboard.attach(&bus);

    let orchestrator = Orchestrator::new(
        config(),
        bus.clone(),
        ToolPaths::in_dir(&env.tools),
        vec![env.input.clone()],
        None,
    )
    .unwrap();

    let interrupt_bus = bus.clone();
    let trigger = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(500));
        interrupt_bus.publish(&PipelineEvent::InterruptRequested);
    });

    let started = Instant::now();
    orchestrator.run().unwrap();
    trigger.join().unwrap();

    // The 30s mock encode must not run to completion.
    assert!(started.elapsed() < Duration::from_secs(20));
    assert!(!env.output.join("slow.mp4").exists());
    assert!(!env.output.join("slow.tmp").exists());
    // Interrupts intentionally leave no .err marker so a re-run retries.
    assert!(!env.output.join("slow.err").exists());

    let state = dashboard.snapshot();
    assert!(state.interrupt_requested);
    assert_eq!(state.interrupted_count, 1);
    assert_eq!(state.completed_count, 0);
}

#[test]
fn rerun_skips_outputs_from_a_previous_run() {
    let env = env(100, 0);
    write_source(&env.input.join("a.mp4"), 1_000);

    let run = |bus: Arc<EventBus>| {
        let orchestrator = Orchestrator::new(
            config(),
            bus,
            ToolPaths::in_dir(&env.tools),
            vec![env.input.clone()],
            None,
        )
        .unwrap();
        orchestrator.run().unwrap();
    };

    run(Arc::new(EventBus::new()));
    assert!(env.output.join("a.mp4").exists());

    let bus = Arc::new(EventBus::new());
    let dashboard = Dashboard::new(2, DEFAULT_RECENT_JOBS);
    dashboard.attach(&bus);
    run(bus);

    let state = dashboard.snapshot();
    assert_eq!(state.completed_count, 0);
    assert_eq!(state.already_compressed_count, 1);
}
