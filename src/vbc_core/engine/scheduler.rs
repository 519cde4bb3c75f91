use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use tracing::{info, warn};

use super::{Shared, executor};
use crate::vbc_core::config::MAX_WORKER_THREADS;
use crate::vbc_core::discovery;
use crate::vbc_core::domain::VideoFile;
use crate::vbc_core::events::PipelineEvent;
use crate::vbc_core::queue_sort::sort_files;

/// Upper bound on the completion wait per scheduler tick; shutdown and
/// refresh requests are observed between ticks.
const TICK: Duration = Duration::from_secs(1);

/// How long interrupted workers get to terminate their encoders before the
/// scheduler stops waiting for them.
const INTERRUPT_GRACE: Duration = Duration::from_secs(10);

/// Queue depth for which metadata is preloaded so the dashboard can show
/// codec and camera columns for upcoming files.
const METADATA_PRELOAD: usize = 25;

/// Discovery, queue build and the submit-on-demand main loop.
pub(super) fn run(shared: &Arc<Shared>) -> Result<()> {
    let general = &shared.config.general;
    let input_roots = shared.layout.input_roots();

    info!(folders = input_roots.len(), "discovery started");
    for root in &input_roots {
        shared.bus.publish(&PipelineEvent::DiscoveryStarted {
            directory: root.clone(),
        });
    }

    let scan = discovery::discover(&shared.scanner, &shared.layout, general);
    let files = sort_files(
        scan.files,
        &input_roots,
        general,
        shared.scanner.extensions(),
    )?;
    let mut report = scan.report;
    report.files_to_process = files.len() as u64;
    shared
        .bus
        .publish(&PipelineEvent::DiscoveryFinished { report });

    if files.is_empty() {
        info!("no files to process");
        shared.bus.publish(&PipelineEvent::ProcessingFinished);
        return Ok(());
    }

    let mut pending: VecDeque<VideoFile> = files.into();
    preload_metadata(shared, &mut pending);
    shared.metadata.prune_failed(&mut pending);
    publish_queue(shared, &pending);

    // Fixed-size pool; the effective ceiling is enforced by the executor's
    // admission wait, so thread-control events never touch the pool.
    let (job_tx, job_rx) = unbounded::<VideoFile>();
    let (done_tx, done_rx) = unbounded::<PathBuf>();
    let handles = spawn_workers(shared, job_rx, done_tx);

    let mut in_flight: HashSet<PathBuf> = HashSet::new();
    submit_batch(shared, &mut pending, &mut in_flight, &job_tx);

    let interrupted = loop {
        if in_flight.is_empty() {
            break false;
        }

        match done_rx.recv_timeout(TICK) {
            Ok(path) => {
                in_flight.remove(&path);
                while let Ok(path) = done_rx.try_recv() {
                    in_flight.remove(&path);
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                warn!("worker pool disconnected unexpectedly");
                in_flight.clear();
                break false;
            }
        }

        if shared.control.interrupted() {
            break true;
        }

        if shared.control.take_refresh() {
            refresh(shared, &mut pending, &in_flight);
        }

        submit_batch(shared, &mut pending, &mut in_flight, &job_tx);

        if shared.control.shutdown_requested() && in_flight.is_empty() {
            info!("shutdown requested, exiting processing loop");
            break false;
        }
    };

    if interrupted {
        // Pending work is discarded; in-flight encoders observe the signal
        // and vacate within the grace window, after which the pool is
        // abandoned rather than joined.
        pending.clear();
        info!("waiting for active encoders to terminate");
        let deadline = Instant::now() + INTERRUPT_GRACE;
        while !in_flight.is_empty() && Instant::now() < deadline {
            match done_rx.recv_timeout(Duration::from_millis(200)) {
                Ok(path) => {
                    in_flight.remove(&path);
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        drop(job_tx);
        info!("shutdown complete");
        return Ok(());
    }

    drop(job_tx);
    for handle in handles {
        let _ = handle.join();
    }

    // One more dashboard refresh cycle before declaring the run over.
    std::thread::sleep(Duration::from_millis(1500));
    if !shared.control.shutdown_requested() {
        shared.bus.publish(&PipelineEvent::ProcessingFinished);
    }
    info!("all files processed");
    Ok(())
}

fn spawn_workers(
    shared: &Arc<Shared>,
    job_rx: Receiver<VideoFile>,
    done_tx: Sender<PathBuf>,
) -> Vec<std::thread::JoinHandle<()>> {
    let mut handles = Vec::with_capacity(MAX_WORKER_THREADS);
    for index in 0..MAX_WORKER_THREADS {
        let shared = shared.clone();
        let rx = job_rx.clone();
        let done = done_tx.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("vbc-worker-{index}"))
            .spawn(move || {
                for file in rx.iter() {
                    let path = file.path.clone();
                    executor::process_file(&shared, file);
                    if done.send(path).is_err() {
                        break;
                    }
                }
            });
        match spawned {
            Ok(handle) => handles.push(handle),
            Err(err) => {
                warn!(%err, "failed to spawn worker thread");
                break;
            }
        }
    }
    handles
}

/// Tops the pool up to `prefetch_factor * current_max_threads` outstanding
/// jobs, then refreshes the queue preview for the dashboard.
fn submit_batch(
    shared: &Arc<Shared>,
    pending: &mut VecDeque<VideoFile>,
    in_flight: &mut HashSet<PathBuf>,
    job_tx: &Sender<VideoFile>,
) {
    let max_inflight =
        shared.config.general.prefetch_factor.max(1) * shared.control.current_max_threads();

    while in_flight.len() < max_inflight
        && !pending.is_empty()
        && !shared.control.shutdown_requested()
    {
        let Some(file) = pending.pop_front() else {
            break;
        };
        if shared.metadata.is_failed(&file.path) {
            continue;
        }
        let path = file.path.clone();
        if job_tx.send(file).is_err() {
            break;
        }
        in_flight.insert(path);
    }

    preload_metadata(shared, pending);
    shared.metadata.prune_failed(pending);
    publish_queue(shared, pending);
}

fn preload_metadata(shared: &Arc<Shared>, pending: &mut VecDeque<VideoFile>) {
    for file in pending.iter_mut().take(METADATA_PRELOAD) {
        if file.metadata.is_none() {
            file.metadata = shared.metadata.get_or_probe(file);
        }
    }
}

fn publish_queue(shared: &Arc<Shared>, pending: &VecDeque<VideoFile>) {
    shared.bus.publish(&PipelineEvent::QueueUpdated {
        pending_files: pending.iter().cloned().collect(),
    });
}

/// Re-runs discovery over the same roots and rebuilds the pending queue.
/// In-flight jobs are never cancelled; files that vanished are dropped and
/// newly discovered ones appended.
fn refresh(
    shared: &Arc<Shared>,
    pending: &mut VecDeque<VideoFile>,
    in_flight: &HashSet<PathBuf>,
) {
    let general = &shared.config.general;
    let input_roots = shared.layout.input_roots();

    let scan = discovery::discover(&shared.scanner, &shared.layout, general);
    let new_files = match sort_files(
        scan.files,
        &input_roots,
        general,
        shared.scanner.extensions(),
    ) {
        Ok(files) => files,
        Err(err) => {
            warn!(%err, "refresh discovery failed");
            return;
        }
    };

    let new_paths: HashSet<PathBuf> = new_files.iter().map(|f| f.path.clone()).collect();
    let before = pending.len();
    pending.retain(|file| new_paths.contains(&file.path));
    let mut removed = before - pending.len();
    removed += shared.metadata.prune_failed(pending);

    let mut known: HashSet<PathBuf> = in_flight.clone();
    known.extend(pending.iter().map(|f| f.path.clone()));

    let mut added = 0usize;
    for file in new_files {
        if !known.contains(&file.path) {
            known.insert(file.path.clone());
            pending.push_back(file);
            added += 1;
        }
    }

    shared
        .bus
        .publish(&PipelineEvent::RefreshFinished { added, removed });
    shared.bus.publish(&PipelineEvent::DiscoveryFinished {
        report: scan.report,
    });

    let message = match (added, removed) {
        (0, 0) => "Refreshed: no changes".to_string(),
        (added, 0) => format!("Refreshed: +{added} new files"),
        (0, removed) => format!("Refreshed: -{removed} removed"),
        (added, removed) => format!("Refreshed: +{added} new, -{removed} removed"),
    };
    info!(%message, "refresh finished");
    shared
        .bus
        .publish(&PipelineEvent::ActionMessage { message });
}
