use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use vbc::vbc_core::config::normalize_input_dir_entries;
use vbc::vbc_core::dashboard::DEFAULT_RECENT_JOBS;
use vbc::vbc_core::{
    Dashboard, EventBus, EventKind, Orchestrator, PipelineEvent, ToolPaths, load_config,
};

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let Some(config_path) = args.next() else {
        eprintln!("usage: vbc <config.json> [input_dir ...]");
        return ExitCode::FAILURE;
    };

    let config = match load_config(std::path::Path::new(&config_path)) {
        Ok(config) => config,
        Err(err) => {
            error!(%err, "failed to load configuration");
            return ExitCode::FAILURE;
        }
    };

    // Positional roots override the configured list.
    let cli_dirs: Vec<String> = args.collect();
    let entries = if cli_dirs.is_empty() {
        config.input_dirs.clone()
    } else {
        cli_dirs
    };
    let input_dirs: Vec<PathBuf> = normalize_input_dir_entries(&entries)
        .into_iter()
        .map(PathBuf::from)
        .collect();
    if input_dirs.is_empty() {
        error!("no input directories configured");
        return ExitCode::FAILURE;
    }

    let bus = Arc::new(EventBus::new());
    let dashboard = Dashboard::new(config.general.threads, DEFAULT_RECENT_JOBS);
    dashboard.attach(&bus);
    subscribe_terminal_log(&bus);

    // SIGINT becomes an interrupt event; active encoders are terminated and
    // pending work is discarded.
    let interrupt_bus = bus.clone();
    if let Err(err) = ctrlc::set_handler(move || {
        interrupt_bus.publish(&PipelineEvent::InterruptRequested);
    }) {
        error!(%err, "failed to install interrupt handler");
    }

    let orchestrator = match Orchestrator::new(
        config,
        bus.clone(),
        ToolPaths::default(),
        input_dirs,
        None,
    ) {
        Ok(orchestrator) => orchestrator,
        Err(err) => {
            error!(%err, "failed to initialize pipeline");
            return ExitCode::FAILURE;
        }
    };

    orchestrator.cleanup_stale_markers();
    if let Err(err) = orchestrator.run() {
        error!(%err, "pipeline run failed");
        return ExitCode::FAILURE;
    }

    let state = dashboard.snapshot();
    info!(
        completed = state.completed_count,
        failed = state.failed_count,
        skipped = state.skipped_count,
        hw_cap = state.hw_cap_count,
        kept_original = state.min_ratio_skip_count,
        interrupted = state.interrupted_count,
        saved_bytes = dashboard.space_saved_bytes(),
        "run summary"
    );
    ExitCode::SUCCESS
}

/// Minimal headless frontend: terminal events become log lines.
fn subscribe_terminal_log(bus: &Arc<EventBus>) {
    bus.subscribe(EventKind::JobCompleted, |event| {
        if let PipelineEvent::JobCompleted { job } = event {
            match job.error_message.as_deref() {
                Some(note) => info!(file = %job.file_name(), note, "completed"),
                None => info!(
                    file = %job.file_name(),
                    output_bytes = job.output_size_bytes.unwrap_or(0),
                    "completed"
                ),
            }
        }
    });
    bus.subscribe(EventKind::JobFailed, |event| {
        if let PipelineEvent::JobFailed { job, error_message } = event {
            info!(file = %job.file_name(), status = ?job.status, %error_message, "not encoded");
        }
    });
}
