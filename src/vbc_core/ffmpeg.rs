use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, bounded};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::vbc_core::config::GeneralConfig;
use crate::vbc_core::discovery::tmp_path_for;
use crate::vbc_core::domain::{CompressionJob, JobStatus};
use crate::vbc_core::events::{EventBus, PipelineEvent};

/// Emitted by NVENC when the device cannot handle the requested encode; also
/// signalled by exit code 187.
pub const HW_CAP_MESSAGE: &str = "Hardware is lacking required capabilities";

pub const INTERRUPT_MESSAGE: &str = "Interrupted by user (Ctrl+C)";

const HW_CAP_EXIT_CODE: i32 = 187;
const PUMP_POLL: Duration = Duration::from_millis(100);
const TERMINATE_GRACE: Duration = Duration::from_secs(3);
const COLOR_FIX_TIMEOUT: Duration = Duration::from_secs(300);

static TIME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"time=(\d+):(\d+):(\d+\.\d+)").expect("valid time regex"));

/// Parses the elapsed seconds out of an ffmpeg `time=HH:MM:SS.ff` stats line.
pub fn parse_progress_seconds(line: &str) -> Option<f64> {
    let caps = TIME_RE.captures(line)?;
    let hours: f64 = caps[1].parse().ok()?;
    let minutes: f64 = caps[2].parse().ok()?;
    let seconds: f64 = caps[3].parse().ok()?;
    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}

pub fn is_hw_cap_line(line: &str) -> bool {
    line.contains(HW_CAP_MESSAGE)
}

pub fn is_color_error_line(line: &str) -> bool {
    line.contains("is not a valid value for color_primaries")
        || line.contains("is not a valid value for color_trc")
}

/// Wrapper around ffmpeg for AV1 compression.
///
/// Owns the whole child-process lifecycle: command construction, the stderr
/// pump, progress events, the hardware-capability and color-space error
/// branches, and `.tmp` discipline (renamed on success, deleted on any
/// failure or interrupt).
pub struct FfmpegAdapter {
    tool: PathBuf,
    bus: Arc<EventBus>,
}

impl FfmpegAdapter {
    pub fn new(tool: PathBuf, bus: Arc<EventBus>) -> Self {
        Self { tool, bus }
    }

    /// Constructs the encoder argument list (program name excluded).
    pub fn build_command(
        &self,
        config: &GeneralConfig,
        rotate: Option<u32>,
        input_path: &Path,
        tmp_path: &Path,
    ) -> Vec<String> {
        let mut args: Vec<String> = vec!["-y".into()];
        if config.gpu {
            args.extend(["-vsync".into(), "0".into()]);
        }
        args.extend([
            "-fflags".into(),
            "+genpts+igndts".into(),
            "-avoid_negative_ts".into(),
            "make_zero".into(),
            "-i".into(),
            input_path.to_string_lossy().into_owned(),
        ]);

        if config.gpu {
            args.extend([
                "-c:v".into(),
                "av1_nvenc".into(),
                "-cq".into(),
                config.cq.to_string(),
                "-preset".into(),
                "p7".into(),
                "-tune".into(),
                "hq".into(),
                "-b:v".into(),
                "0".into(),
            ]);
        } else {
            let mut svt_params = String::from("tune=0:enable-overlays=1");
            if let Some(threads) = config.ffmpeg_cpu_threads {
                svt_params.push_str(&format!(":lp={threads}"));
            }
            args.extend([
                "-c:v".into(),
                "libsvtav1".into(),
                "-preset".into(),
                "6".into(),
                "-crf".into(),
                config.cq.to_string(),
                "-svtav1-params".into(),
                svt_params,
            ]);
            if let Some(threads) = config.ffmpeg_cpu_threads {
                args.extend(["-threads".into(), threads.to_string()]);
            }
        }

        args.extend(["-c:a".into(), "copy".into()]);
        if config.copy_metadata {
            args.extend([
                "-map_metadata".into(),
                "0".into(),
                "-movflags".into(),
                "use_metadata_tags".into(),
            ]);
        } else {
            args.extend(["-map_metadata".into(), "-1".into()]);
        }

        match rotate {
            Some(90) => args.extend(["-vf".into(), "transpose=1".into()]),
            Some(180) => args.extend(["-vf".into(), "transpose=2,transpose=2".into()]),
            Some(270) => args.extend(["-vf".into(), "transpose=2".into()]),
            _ => {}
        }

        // The .tmp extension carries no container hint, so force mp4.
        args.extend([
            "-f".into(),
            "mp4".into(),
            tmp_path.to_string_lossy().into_owned(),
        ]);
        args
    }

    /// Runs one compression attempt, leaving the outcome in `job.status`.
    pub fn compress(
        &self,
        job: &mut CompressionJob,
        config: &GeneralConfig,
        rotate: Option<u32>,
        shutdown: &Arc<AtomicBool>,
        input_override: Option<&Path>,
    ) {
        self.compress_inner(job, config, rotate, shutdown, input_override, true);
    }

    fn compress_inner(
        &self,
        job: &mut CompressionJob,
        config: &GeneralConfig,
        rotate: Option<u32>,
        shutdown: &Arc<AtomicBool>,
        input_override: Option<&Path>,
        allow_color_fix: bool,
    ) {
        let filename = job.file_name();
        let Some(output_path) = job.output_path.clone() else {
            job.status = JobStatus::Failed;
            job.error_message = Some("job has no output path".into());
            self.publish_failed(job);
            return;
        };
        let tmp_path = tmp_path_for(&output_path);
        let input_path = input_override
            .map(Path::to_path_buf)
            .unwrap_or_else(|| job.source_file.path.clone());

        if config.debug {
            info!(file = %filename, gpu = config.gpu, cq = config.cq, "FFMPEG_START");
        }

        let args = self.build_command(config, rotate, &input_path, &tmp_path);
        debug!(file = %filename, ?args, "ffmpeg command");

        let started = Instant::now();
        let mut child = match Command::new(&self.tool)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
        {
            Ok(child) => child,
            Err(err) => {
                job.status = JobStatus::Failed;
                job.error_message = Some(format!("failed to spawn ffmpeg: {err}"));
                let _ = fs::remove_file(&tmp_path);
                self.publish_failed(job);
                return;
            }
        };

        let total_duration = job
            .source_file
            .metadata
            .as_ref()
            .and_then(|meta| meta.duration)
            .unwrap_or(0.0);

        let mut pump = StderrPump::spawn(&mut child);
        let mut hw_cap_error = false;
        let mut color_error = false;

        let status = loop {
            if shutdown.load(Ordering::Relaxed) {
                info!(file = %filename, "FFMPEG_INTERRUPTED");
                terminate_then_kill(&mut child);
                pump.join();
                let _ = fs::remove_file(&tmp_path);
                job.status = JobStatus::Interrupted;
                job.error_message = Some(INTERRUPT_MESSAGE.into());
                return;
            }

            if let Some(line) = pump.recv_timeout(PUMP_POLL) {
                self.observe_line(job, &line, total_duration, &mut hw_cap_error, &mut color_error);
            }

            match child.try_wait() {
                Ok(Some(status)) => {
                    pump.drain(|line| {
                        self.observe_line(
                            job,
                            &line,
                            total_duration,
                            &mut hw_cap_error,
                            &mut color_error,
                        );
                    });
                    break Some(status);
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(file = %filename, %err, "failed to poll ffmpeg");
                    let _ = child.kill();
                    let _ = child.wait();
                    break None;
                }
            }
        };
        pump.join();

        let exit_code = status.as_ref().and_then(|s| s.code());
        let succeeded = status.as_ref().map(|s| s.success()).unwrap_or(false);

        if hw_cap_error || exit_code == Some(HW_CAP_EXIT_CODE) {
            job.status = JobStatus::HwCapLimit;
            job.error_message = Some(HW_CAP_MESSAGE.into());
            let _ = fs::remove_file(&tmp_path);
            self.bus
                .publish(&PipelineEvent::HardwareCapabilityExceeded { job: job.clone() });
            if config.debug {
                info!(file = %filename, elapsed_s = started.elapsed().as_secs_f64(),
                    "FFMPEG_END status=hw_cap_limit");
            }
        } else if color_error && allow_color_fix {
            info!(file = %filename, "applying color space fix remux");
            self.apply_color_fix(job, config, rotate, shutdown);
        } else if !succeeded {
            job.status = JobStatus::Failed;
            job.error_message = Some(match exit_code {
                Some(code) => format!("ffmpeg exited with code {code}"),
                None => "ffmpeg terminated by signal".to_string(),
            });
            let _ = fs::remove_file(&tmp_path);
            self.publish_failed(job);
            if config.debug {
                info!(file = %filename, ?exit_code, elapsed_s = started.elapsed().as_secs_f64(),
                    "FFMPEG_END status=failed");
            }
        } else {
            if tmp_path.exists()
                && let Err(err) = fs::rename(&tmp_path, &output_path)
            {
                job.status = JobStatus::Failed;
                job.error_message = Some(format!("failed to finalize output: {err}"));
                let _ = fs::remove_file(&tmp_path);
                self.publish_failed(job);
                return;
            }
            job.status = JobStatus::Completed;
            if config.debug {
                info!(file = %filename, elapsed_s = started.elapsed().as_secs_f64(),
                    "FFMPEG_END status=completed");
            }
        }
    }

    fn observe_line(
        &self,
        job: &mut CompressionJob,
        line: &str,
        total_duration: f64,
        hw_cap_error: &mut bool,
        color_error: &mut bool,
    ) {
        if is_hw_cap_line(line) {
            *hw_cap_error = true;
        }
        if is_color_error_line(line) {
            *color_error = true;
        }
        if let Some(elapsed) = parse_progress_seconds(line)
            && total_duration > 0.0
        {
            let percent = (elapsed / total_duration * 100.0).min(100.0);
            job.progress_percent = percent;
            self.bus.publish(&PipelineEvent::JobProgressUpdated {
                job: job.clone(),
                progress_percent: percent,
            });
        }
    }

    fn publish_failed(&self, job: &CompressionJob) {
        self.bus.publish(&PipelineEvent::JobFailed {
            job: job.clone(),
            error_message: job.error_message.clone().unwrap_or_default(),
        });
    }

    /// Pre-encode remediation for sources probed with a "reserved" color
    /// space: stream-copy remux through the matching bitstream filter.
    ///
    /// Returns the encoder input to use plus the temp file to delete after
    /// the encode; falls back to the original input when the remux is not
    /// possible or fails.
    pub fn fix_color_space(
        &self,
        source: &Path,
        output_path: &Path,
        codec: &str,
    ) -> (PathBuf, Option<PathBuf>) {
        let bsf = match codec {
            "hevc" => "hevc_metadata=colour_primaries=1:transfer_characteristics=1:matrix_coefficients=1",
            "h264" => "h264_metadata=colour_primaries=1:transfer_characteristics=1:matrix_coefficients=1",
            other => {
                warn!(codec = other, "cannot fix color space for codec; keeping original input");
                return (source.to_path_buf(), None);
            }
        };

        let temp_fixed = colorfix_path_for(output_path);
        if let Some(parent) = temp_fixed.parent()
            && let Err(err) = fs::create_dir_all(parent)
        {
            warn!(%err, "failed to create color-fix directory; keeping original input");
            return (source.to_path_buf(), None);
        }

        let mut cmd = Command::new(&self.tool);
        cmd.arg("-i")
            .arg(source.as_os_str())
            .arg("-c")
            .arg("copy")
            .arg("-bsf:v")
            .arg(bsf)
            .arg(temp_fixed.as_os_str())
            .arg("-y")
            .arg("-hide_banner")
            .arg("-loglevel")
            .arg("error")
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        match run_with_timeout(&mut cmd, COLOR_FIX_TIMEOUT) {
            Ok(Some(status)) if status.success() && temp_fixed.exists() => {
                info!(source = %source.display(), "fixed reserved color space via remux");
                (temp_fixed.clone(), Some(temp_fixed))
            }
            Ok(Some(_)) | Ok(None) | Err(_) => {
                let _ = fs::remove_file(&temp_fixed);
                warn!(source = %source.display(),
                    "color space remux failed; proceeding with original file");
                (source.to_path_buf(), None)
            }
        }
    }

    /// Reactive remediation after the encoder rejected the stream's color
    /// metadata mid-run: remux (hevc filter first, h264 as fallback), then
    /// re-encode once against the remuxed input. Never re-entered from the
    /// retried encode.
    fn apply_color_fix(
        &self,
        job: &mut CompressionJob,
        config: &GeneralConfig,
        rotate: Option<u32>,
        shutdown: &Arc<AtomicBool>,
    ) {
        let Some(output_path) = job.output_path.clone() else {
            return;
        };
        let color_fix_path = colorfix_path_for(&output_path);

        let mut remuxed = false;
        for bsf in [
            "hevc_metadata=color_primaries=1:color_trc=1:colorspace=1",
            "h264_metadata=color_primaries=1:color_trc=1:colorspace=1",
        ] {
            let mut cmd = Command::new(&self.tool);
            cmd.arg("-y")
                .arg("-i")
                .arg(job.source_file.path.as_os_str())
                .arg("-c")
                .arg("copy")
                .arg("-bsf:v")
                .arg(bsf)
                .arg(color_fix_path.as_os_str())
                .stdout(Stdio::null())
                .stderr(Stdio::null());
            if matches!(run_with_timeout(&mut cmd, COLOR_FIX_TIMEOUT), Ok(Some(status)) if status.success())
            {
                remuxed = true;
                break;
            }
            let _ = fs::remove_file(&color_fix_path);
        }

        if remuxed {
            self.compress_inner(job, config, rotate, shutdown, Some(&color_fix_path), false);
            let _ = fs::remove_file(&color_fix_path);
        } else {
            job.status = JobStatus::Failed;
            job.error_message = Some("Color fix remux failed".into());
            self.publish_failed(job);
        }
    }
}

pub fn colorfix_path_for(output_path: &Path) -> PathBuf {
    let stem = output_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    output_path.with_file_name(format!("{stem}_colorfix.mp4"))
}

/// Reader thread draining the child's stderr line-by-line into a bounded
/// channel; the encode loop polls with a short timeout so shutdown
/// responsiveness stays within the poll interval.
struct StderrPump {
    rx: Option<Receiver<String>>,
    join: Option<std::thread::JoinHandle<()>>,
}

impl StderrPump {
    fn spawn(child: &mut Child) -> Self {
        let Some(stderr) = child.stderr.take() else {
            return Self {
                rx: None,
                join: None,
            };
        };

        let (tx, rx) = bounded::<String>(256);
        let join = std::thread::spawn(move || {
            use std::io::BufRead as _;
            let reader = std::io::BufReader::new(stderr);
            for line in reader.lines() {
                match line {
                    Ok(line) => {
                        if tx.send(line).is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        });

        Self {
            rx: Some(rx),
            join: Some(join),
        }
    }

    fn recv_timeout(&mut self, timeout: Duration) -> Option<String> {
        let Some(rx) = self.rx.as_ref() else {
            std::thread::sleep(timeout);
            return None;
        };
        match rx.recv_timeout(timeout) {
            Ok(line) => Some(line),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => {
                self.rx = None;
                None
            }
        }
    }

    /// Collects the lines the reader flushed between the last poll and child
    /// exit.
    fn drain(&mut self, mut on_line: impl FnMut(String)) {
        let Some(rx) = self.rx.as_ref() else {
            return;
        };
        while let Ok(line) = rx.try_recv() {
            on_line(line);
        }
    }

    fn join(&mut self) {
        self.rx = None;
        if let Some(handle) = self.join.take() {
            let _ = handle.join();
        }
    }
}

/// SIGTERM, a bounded grace period, then SIGKILL.
fn terminate_then_kill(child: &mut Child) {
    #[cfg(unix)]
    {
        unsafe {
            libc::kill(child.id() as libc::pid_t, libc::SIGTERM);
        }
        let deadline = Instant::now() + TERMINATE_GRACE;
        while Instant::now() < deadline {
            if matches!(child.try_wait(), Ok(Some(_))) {
                return;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
    }
    let _ = child.kill();
    let _ = child.wait();
}

/// Polls the child until exit or deadline; a timed-out child is killed and
/// None is returned.
fn run_with_timeout(
    cmd: &mut Command,
    timeout: Duration,
) -> std::io::Result<Option<std::process::ExitStatus>> {
    let mut child = cmd.spawn()?;
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
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
