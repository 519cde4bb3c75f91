use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::sync_ext::MutexExt;
use crate::vbc_core::discovery::DiscoveryReport;
use crate::vbc_core::domain::{CompressionJob, VideoFile};

/// Everything the pipeline tells the outside world, stamped by the publisher.
///
/// For any given job the order is: `JobStarted`, zero or more
/// `JobProgressUpdated`, then exactly one terminal event (`JobCompleted`,
/// `JobFailed` or `HardwareCapabilityExceeded`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum PipelineEvent {
    DiscoveryStarted {
        directory: PathBuf,
    },
    DiscoveryFinished {
        report: DiscoveryReport,
    },
    QueueUpdated {
        pending_files: Vec<VideoFile>,
    },
    JobStarted {
        job: CompressionJob,
    },
    JobProgressUpdated {
        job: CompressionJob,
        progress_percent: f64,
    },
    JobCompleted {
        job: CompressionJob,
    },
    JobFailed {
        job: CompressionJob,
        error_message: String,
    },
    HardwareCapabilityExceeded {
        job: CompressionJob,
    },
    /// Transient operator feedback, shown by the dashboard for 60 seconds.
    ActionMessage {
        message: String,
    },
    RefreshRequested,
    RefreshFinished {
        added: usize,
        removed: usize,
    },
    ProcessingFinished,
    /// Operator toggled graceful shutdown (a second request cancels it).
    RequestShutdown,
    /// Operator interrupt: active encoders are terminated, pending work dropped.
    InterruptRequested,
    /// Operator raised or lowered the effective parallelism ceiling.
    ThreadControl {
        delta: i32,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    DiscoveryStarted,
    DiscoveryFinished,
    QueueUpdated,
    JobStarted,
    JobProgressUpdated,
    JobCompleted,
    JobFailed,
    HardwareCapabilityExceeded,
    ActionMessage,
    RefreshRequested,
    RefreshFinished,
    ProcessingFinished,
    RequestShutdown,
    InterruptRequested,
    ThreadControl,
}

impl EventKind {
    pub const ALL: [EventKind; 15] = [
        EventKind::DiscoveryStarted,
        EventKind::DiscoveryFinished,
        EventKind::QueueUpdated,
        EventKind::JobStarted,
        EventKind::JobProgressUpdated,
        EventKind::JobCompleted,
        EventKind::JobFailed,
        EventKind::HardwareCapabilityExceeded,
        EventKind::ActionMessage,
        EventKind::RefreshRequested,
        EventKind::RefreshFinished,
        EventKind::ProcessingFinished,
        EventKind::RequestShutdown,
        EventKind::InterruptRequested,
        EventKind::ThreadControl,
    ];
}

impl PipelineEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            PipelineEvent::DiscoveryStarted { .. } => EventKind::DiscoveryStarted,
            PipelineEvent::DiscoveryFinished { .. } => EventKind::DiscoveryFinished,
            PipelineEvent::QueueUpdated { .. } => EventKind::QueueUpdated,
            PipelineEvent::JobStarted { .. } => EventKind::JobStarted,
            PipelineEvent::JobProgressUpdated { .. } => EventKind::JobProgressUpdated,
            PipelineEvent::JobCompleted { .. } => EventKind::JobCompleted,
            PipelineEvent::JobFailed { .. } => EventKind::JobFailed,
            PipelineEvent::HardwareCapabilityExceeded { .. } => {
                EventKind::HardwareCapabilityExceeded
            }
            PipelineEvent::ActionMessage { .. } => EventKind::ActionMessage,
            PipelineEvent::RefreshRequested => EventKind::RefreshRequested,
            PipelineEvent::RefreshFinished { .. } => EventKind::RefreshFinished,
            PipelineEvent::ProcessingFinished => EventKind::ProcessingFinished,
            PipelineEvent::RequestShutdown => EventKind::RequestShutdown,
            PipelineEvent::InterruptRequested => EventKind::InterruptRequested,
            PipelineEvent::ThreadControl { .. } => EventKind::ThreadControl,
        }
    }
}

pub type Subscriber = Arc<dyn Fn(&PipelineEvent) + Send + Sync + 'static>;

/// Synchronous kind-indexed pub/sub.
///
/// `publish` runs every subscriber inline on the calling thread in
/// registration order; there is no queueing. The dashboard's correctness
/// depends on the happens-before between a terminal event publish and the
/// worker's cleanup, so dispatch is deliberately not deferred.
#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<HashMap<EventKind, Vec<Subscriber>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, kind: EventKind, callback: F)
    where
        F: Fn(&PipelineEvent) + Send + Sync + 'static,
    {
        let mut subscribers = self.subscribers.lock_unpoisoned();
        subscribers.entry(kind).or_default().push(Arc::new(callback));
    }

    /// Subscribes one callback to every event kind (used by the dashboard
    /// projection and by file loggers).
    pub fn subscribe_all<F>(&self, callback: F)
    where
        F: Fn(&PipelineEvent) + Send + Sync + 'static,
    {
        let shared: Subscriber = Arc::new(callback);
        let mut subscribers = self.subscribers.lock_unpoisoned();
        for kind in EventKind::ALL {
            subscribers.entry(kind).or_default().push(shared.clone());
        }
    }

    pub fn publish(&self, event: &PipelineEvent) {
        // Snapshot outside the dispatch so subscribers may publish follow-up
        // events (control handlers emit ActionMessages) without deadlocking.
        let targets: Vec<Subscriber> = {
            let subscribers = self.subscribers.lock_unpoisoned();
            subscribers
                .get(&event.kind())
                .map(|list| list.to_vec())
                .unwrap_or_default()
        };

        for subscriber in targets {
            if catch_unwind(AssertUnwindSafe(|| subscriber(event))).is_err() {
                warn!(kind = ?event.kind(), "event subscriber panicked; continuing dispatch");
            }
        }
    }
}
