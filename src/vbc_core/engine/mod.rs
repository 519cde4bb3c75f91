use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Weak};

use anyhow::Result;
use tracing::info;

use crate::vbc_core::config::{AppConfig, ConfigError};
use crate::vbc_core::discovery::OutputLayout;
use crate::vbc_core::events::{EventBus, EventKind, PipelineEvent};
use crate::vbc_core::exiftool::ExifToolAdapter;
use crate::vbc_core::ffmpeg::FfmpegAdapter;
use crate::vbc_core::ffprobe::FfprobeAdapter;
use crate::vbc_core::metadata_cache::MetadataService;
use crate::vbc_core::scanner::FileScanner;
use crate::vbc_core::tools::ToolPaths;

mod executor;
mod scheduler;
mod state;

#[cfg(test)]
mod tests;

use state::Control;

/// Everything a worker needs, shared across the pool.
pub(crate) struct Shared {
    pub config: AppConfig,
    pub bus: Arc<EventBus>,
    pub layout: Arc<OutputLayout>,
    pub scanner: FileScanner,
    pub metadata: MetadataService,
    pub ffprobe: FfprobeAdapter,
    pub ffmpeg: FfmpegAdapter,
    pub exiftool: ExifToolAdapter,
    pub control: Control,
}

/// The pipeline orchestrator: discovery, queueing, the dynamic-capacity
/// worker pool and the operator control surface.
///
/// Control events (`RequestShutdown`, `ThreadControl`, `RefreshRequested`,
/// `InterruptRequested`) are consumed from the same event bus the pipeline
/// publishes on, so any frontend (keyboard listener, signal handler, web
/// view) can steer a running instance.
pub struct Orchestrator {
    shared: Arc<Shared>,
}

impl Orchestrator {
    pub fn new(
        config: AppConfig,
        bus: Arc<EventBus>,
        tools: ToolPaths,
        input_dirs: Vec<PathBuf>,
        output_dir_map: Option<HashMap<PathBuf, PathBuf>>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let layout = Arc::new(OutputLayout::resolve(
            &config,
            &input_dirs,
            output_dir_map.as_ref(),
        )?);
        let scanner = FileScanner::new(
            &config.general.extensions,
            config.general.min_size_bytes,
            config.output_suffix(),
        );
        let metadata = MetadataService::new(
            FfprobeAdapter::new(tools.ffprobe.clone()),
            ExifToolAdapter::new(tools.exiftool.clone()),
            bus.clone(),
            layout.clone(),
            config.general.clone(),
        );

        let shared = Arc::new(Shared {
            control: Control::new(config.general.threads),
            ffprobe: FfprobeAdapter::new(tools.ffprobe),
            ffmpeg: FfmpegAdapter::new(tools.ffmpeg, bus.clone()),
            exiftool: ExifToolAdapter::new(tools.exiftool),
            scanner,
            metadata,
            layout,
            bus,
            config,
        });
        subscribe_control_events(&shared);
        Ok(Self { shared })
    }

    /// Runs the pipeline to completion (or until shutdown/interrupt).
    pub fn run(&self) -> Result<()> {
        scheduler::run(&self.shared)
    }

    /// Pre-run housekeeping: clears stale `.tmp` sidecars (and `.err`
    /// markers when `clean_errors` is set) across every output root.
    /// Markers whose source no longer exists move into the per-root errors
    /// directory.
    pub fn cleanup_stale_markers(&self) {
        for (input, output) in self.shared.layout.roots() {
            let errors_dir = errors_dir_for(input, self.shared.config.errors_suffix());
            crate::vbc_core::housekeeping::cleanup_output_markers(
                input,
                output,
                &errors_dir,
                self.shared.config.general.clean_errors,
            );
        }
    }

    #[cfg(test)]
    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }
}

fn errors_dir_for(input_dir: &std::path::Path, suffix: &str) -> PathBuf {
    let name = input_dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    input_dir.with_file_name(format!("{name}{suffix}"))
}

/// Wires the operator control surface into the scheduler state. Handlers
/// hold a weak reference so the bus never keeps a dropped orchestrator
/// alive.
fn subscribe_control_events(shared: &Arc<Shared>) {
    let weak: Weak<Shared> = Arc::downgrade(shared);
    let bus = shared.bus.clone();

    let handle = weak.clone();
    bus.subscribe(EventKind::RequestShutdown, move |_| {
        let Some(shared) = handle.upgrade() else {
            return;
        };
        let message = if shared.control.toggle_shutdown() {
            "SHUTDOWN requested (press S to cancel)"
        } else {
            "SHUTDOWN cancelled"
        };
        shared.bus.publish(&PipelineEvent::ActionMessage {
            message: message.to_string(),
        });
    });

    let handle = weak.clone();
    bus.subscribe(EventKind::ThreadControl, move |event| {
        let PipelineEvent::ThreadControl { delta } = event else {
            return;
        };
        let Some(shared) = handle.upgrade() else {
            return;
        };
        let Some(adjusted) = shared.control.adjust_threads(*delta) else {
            return;
        };
        let message = if adjusted.new != adjusted.old {
            format!("Threads: {} → {}", adjusted.old, adjusted.new)
        } else if adjusted.requested > adjusted.new as i64 {
            format!("Threads: {} (max)", adjusted.new)
        } else {
            format!("Threads: {} (min)", adjusted.new)
        };
        shared
            .bus
            .publish(&PipelineEvent::ActionMessage { message });
    });

    let handle = weak.clone();
    bus.subscribe(EventKind::RefreshRequested, move |_| {
        if let Some(shared) = handle.upgrade() {
            shared.control.request_refresh();
        }
    });

    let handle = weak;
    bus.subscribe(EventKind::InterruptRequested, move |_| {
        let Some(shared) = handle.upgrade() else {
            return;
        };
        info!("interrupt requested; stopping orchestrator");
        shared.control.interrupt();
        shared.bus.publish(&PipelineEvent::ActionMessage {
            message: "Ctrl+C - interrupting active compressions...".to_string(),
        });
    });
}
