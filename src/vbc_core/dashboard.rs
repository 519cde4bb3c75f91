use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Local};

use crate::sync_ext::MutexExt;
use crate::vbc_core::config::MAX_WORKER_THREADS;
use crate::vbc_core::domain::{CompressionJob, JobStatus, VideoFile};
use crate::vbc_core::events::{EventBus, PipelineEvent};

const LAST_ACTION_TTL_SECS: i64 = 60;
pub const DEFAULT_RECENT_JOBS: usize = 5;

/// Everything the renderer reads, mutated only by the projection under the
/// dashboard lock. `snapshot()` hands out a copy so readers never hold the
/// lock across drawing.
#[derive(Debug, Clone)]
pub struct DashboardState {
    pub completed_count: u64,
    pub failed_count: u64,
    pub skipped_count: u64,
    pub hw_cap_count: u64,
    pub cam_skipped_count: u64,
    /// Completed jobs whose encode was reverted because the ratio was too
    /// low to be worth keeping.
    pub min_ratio_skip_count: u64,
    pub interrupted_count: u64,

    pub total_files_found: u64,
    pub files_to_process: u64,
    pub already_compressed_count: u64,
    pub ignored_small_count: u64,
    pub ignored_err_count: u64,
    pub ignored_av1_count: u64,
    pub source_folders_count: usize,

    pub total_input_bytes: u64,
    pub total_output_bytes: u64,

    pub active_jobs: Vec<CompressionJob>,
    pub recent_jobs: VecDeque<CompressionJob>,
    pub pending_files: Vec<VideoFile>,
    /// Keyed by source file name; drives the renderer's per-job ETA.
    pub job_start_times: HashMap<String, DateTime<Local>>,

    pub current_threads: usize,
    pub discovery_finished: bool,
    pub shutdown_requested: bool,
    pub interrupt_requested: bool,
    pub finished: bool,
    pub processing_start_time: Option<DateTime<Local>>,

    pub last_action: String,
    pub last_action_time: Option<DateTime<Local>>,
}

impl DashboardState {
    fn new(initial_threads: usize) -> Self {
        Self {
            completed_count: 0,
            failed_count: 0,
            skipped_count: 0,
            hw_cap_count: 0,
            cam_skipped_count: 0,
            min_ratio_skip_count: 0,
            interrupted_count: 0,
            total_files_found: 0,
            files_to_process: 0,
            already_compressed_count: 0,
            ignored_small_count: 0,
            ignored_err_count: 0,
            ignored_av1_count: 0,
            source_folders_count: 1,
            total_input_bytes: 0,
            total_output_bytes: 0,
            active_jobs: Vec::new(),
            recent_jobs: VecDeque::new(),
            pending_files: Vec::new(),
            job_start_times: HashMap::new(),
            current_threads: initial_threads,
            discovery_finished: false,
            shutdown_requested: false,
            interrupt_requested: false,
            finished: false,
            processing_start_time: None,
            last_action: String::new(),
            last_action_time: None,
        }
    }
}

/// Subscribes to every pipeline event and projects it into `DashboardState`.
///
/// Handlers are short lock-bounded mutations with no blocking I/O; output
/// sizes arrive on the events themselves.
pub struct Dashboard {
    state: Mutex<DashboardState>,
    recent_max: usize,
}

impl Dashboard {
    pub fn new(initial_threads: usize, recent_max: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(DashboardState::new(initial_threads)),
            recent_max,
        })
    }

    pub fn attach(self: &Arc<Self>, bus: &EventBus) {
        let projection = self.clone();
        bus.subscribe_all(move |event| projection.handle(event));
    }

    pub fn snapshot(&self) -> DashboardState {
        self.state.lock_unpoisoned().clone()
    }

    pub fn space_saved_bytes(&self) -> u64 {
        let state = self.state.lock_unpoisoned();
        state
            .total_input_bytes
            .saturating_sub(state.total_output_bytes)
    }

    pub fn compression_ratio(&self) -> f64 {
        let state = self.state.lock_unpoisoned();
        if state.total_input_bytes == 0 {
            return 0.0;
        }
        state.total_output_bytes as f64 / state.total_input_bytes as f64
    }

    /// Last operator feedback message; clears itself after 60 seconds.
    pub fn last_action(&self) -> String {
        let mut state = self.state.lock_unpoisoned();
        if let Some(when) = state.last_action_time {
            let elapsed = Local::now().signed_duration_since(when);
            if elapsed.num_seconds() > LAST_ACTION_TTL_SECS {
                state.last_action.clear();
                state.last_action_time = None;
            }
        }
        state.last_action.clone()
    }

    fn handle(&self, event: &PipelineEvent) {
        let mut state = self.state.lock_unpoisoned();
        match event {
            PipelineEvent::DiscoveryStarted { .. } => {
                state.discovery_finished = false;
            }
            PipelineEvent::DiscoveryFinished { report } => {
                state.total_files_found = report.files_found;
                state.files_to_process = report.files_to_process;
                state.already_compressed_count = report.already_compressed;
                state.ignored_small_count = report.ignored_small;
                state.ignored_err_count = report.ignored_err;
                state.ignored_av1_count = report.ignored_av1;
                state.source_folders_count = report.source_folders_count;
                state.discovery_finished = true;
            }
            PipelineEvent::QueueUpdated { pending_files } => {
                state.pending_files = pending_files.clone();
            }
            PipelineEvent::JobStarted { job } => {
                if state.processing_start_time.is_none() {
                    state.processing_start_time = Some(Local::now());
                }
                let name = job.file_name();
                if !state.active_jobs.iter().any(|j| j.file_name() == name) {
                    state.active_jobs.push(job.clone());
                }
                state.job_start_times.insert(name, Local::now());
            }
            PipelineEvent::JobProgressUpdated {
                job,
                progress_percent,
            } => {
                let name = job.file_name();
                if let Some(active) = state
                    .active_jobs
                    .iter_mut()
                    .find(|j| j.file_name() == name)
                {
                    active.progress_percent = *progress_percent;
                }
            }
            PipelineEvent::JobCompleted { job } => {
                let mut job = job.clone();
                Self::stamp_duration(&mut state, &mut job);
                if job
                    .error_message
                    .as_deref()
                    .is_some_and(|msg| msg.contains("kept original"))
                {
                    state.min_ratio_skip_count += 1;
                }
                state.completed_count += 1;
                state.total_input_bytes += job.source_file.size_bytes;
                state.total_output_bytes += job.output_size_bytes.unwrap_or(0);
                Self::push_recent(&mut state, self.recent_max, job.clone());
                Self::remove_active(&mut state, &job);
            }
            PipelineEvent::JobFailed { job, error_message } => {
                let mut job = job.clone();
                Self::stamp_duration(&mut state, &mut job);
                if error_message.contains("Already encoded in AV1") {
                    // Counted, not shown in recent history.
                    state.ignored_av1_count += 1;
                    Self::remove_active(&mut state, &job);
                } else if error_message.contains("Camera model") {
                    state.cam_skipped_count += 1;
                    Self::remove_active(&mut state, &job);
                } else if job.status == JobStatus::Interrupted {
                    state.interrupted_count += 1;
                    Self::push_recent(&mut state, self.recent_max, job.clone());
                    Self::remove_active(&mut state, &job);
                } else if job.status == JobStatus::Skipped {
                    state.skipped_count += 1;
                    Self::push_recent(&mut state, self.recent_max, job.clone());
                    Self::remove_active(&mut state, &job);
                } else {
                    state.failed_count += 1;
                    Self::push_recent(&mut state, self.recent_max, job.clone());
                    Self::remove_active(&mut state, &job);
                }
            }
            PipelineEvent::HardwareCapabilityExceeded { job } => {
                state.hw_cap_count += 1;
                Self::remove_active(&mut state, job);
            }
            PipelineEvent::ActionMessage { message } => {
                state.last_action = message.clone();
                state.last_action_time = Some(Local::now());
            }
            PipelineEvent::ProcessingFinished => {
                state.finished = true;
            }
            PipelineEvent::RequestShutdown => {
                state.shutdown_requested = !state.shutdown_requested;
            }
            PipelineEvent::InterruptRequested => {
                state.interrupt_requested = true;
            }
            PipelineEvent::ThreadControl { delta } => {
                if !state.shutdown_requested {
                    let requested = state.current_threads as i64 + *delta as i64;
                    state.current_threads =
                        requested.clamp(1, MAX_WORKER_THREADS as i64) as usize;
                }
            }
            PipelineEvent::RefreshRequested | PipelineEvent::RefreshFinished { .. } => {}
        }
    }

    fn stamp_duration(state: &mut DashboardState, job: &mut CompressionJob) {
        let name = job.file_name();
        if let Some(started) = state.job_start_times.get(&name) {
            let elapsed = Local::now().signed_duration_since(*started);
            job.duration_seconds = Some(elapsed.num_milliseconds() as f64 / 1000.0);
        }
    }

    fn push_recent(state: &mut DashboardState, max: usize, job: CompressionJob) {
        state.recent_jobs.push_front(job);
        while state.recent_jobs.len() > max {
            state.recent_jobs.pop_back();
        }
    }

    fn remove_active(state: &mut DashboardState, job: &CompressionJob) {
        let name = job.file_name();
        state.active_jobs.retain(|j| j.file_name() != name);
        state.job_start_times.remove(&name);
    }
}
