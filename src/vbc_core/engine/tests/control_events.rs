use std::path::PathBuf;

use super::common::build_orchestrator;
use crate::vbc_core::config::{AppConfig, MAX_WORKER_THREADS};
use crate::vbc_core::events::PipelineEvent;
use crate::vbc_core::tools::ToolPaths;

fn action_messages(events: &[PipelineEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|event| match event {
            PipelineEvent::ActionMessage { message } => Some(message.clone()),
            _ => None,
        })
        .collect()
}

fn orchestrator_with_threads(threads: usize) -> (
    std::sync::Arc<crate::vbc_core::events::EventBus>,
    std::sync::Arc<std::sync::Mutex<Vec<PipelineEvent>>>,
    crate::vbc_core::engine::Orchestrator,
) {
    let dir = std::env::temp_dir().join(format!(
        "vbc-control-{}-{threads}",
        std::process::id()
    ));
    let _ = std::fs::create_dir_all(&dir);
    let config = AppConfig {
        general: crate::vbc_core::config::GeneralConfig {
            threads,
            ..Default::default()
        },
        ..AppConfig::default()
    };
    build_orchestrator(config, ToolPaths::default(), vec![PathBuf::from(dir)])
}

#[test]
fn shutdown_request_toggles_with_feedback() {
    let (bus, events, orchestrator) = orchestrator_with_threads(2);

    bus.publish(&PipelineEvent::RequestShutdown);
    assert!(orchestrator.shared().control.shutdown_requested());

    bus.publish(&PipelineEvent::RequestShutdown);
    assert!(!orchestrator.shared().control.shutdown_requested());

    let messages = action_messages(&events.lock().unwrap());
    assert_eq!(
        messages,
        vec![
            "SHUTDOWN requested (press S to cancel)",
            "SHUTDOWN cancelled",
        ]
    );
}

#[test]
fn thread_control_adjusts_ceiling_and_reports() {
    let (bus, events, orchestrator) = orchestrator_with_threads(2);

    bus.publish(&PipelineEvent::ThreadControl { delta: 3 });
    assert_eq!(orchestrator.shared().control.current_max_threads(), 5);

    bus.publish(&PipelineEvent::ThreadControl { delta: 100 });
    assert_eq!(
        orchestrator.shared().control.current_max_threads(),
        MAX_WORKER_THREADS
    );

    bus.publish(&PipelineEvent::ThreadControl { delta: 1 });
    bus.publish(&PipelineEvent::ThreadControl { delta: -100 });

    let messages = action_messages(&events.lock().unwrap());
    assert_eq!(messages[0], "Threads: 2 → 5");
    assert_eq!(messages[1], format!("Threads: 5 → {MAX_WORKER_THREADS}"));
    assert_eq!(messages[2], format!("Threads: {MAX_WORKER_THREADS} (max)"));
    assert_eq!(messages[3], format!("Threads: {MAX_WORKER_THREADS} → 1"));
}

#[test]
fn thread_control_is_ignored_while_shutdown_pending() {
    let (bus, _events, orchestrator) = orchestrator_with_threads(2);

    bus.publish(&PipelineEvent::RequestShutdown);
    bus.publish(&PipelineEvent::ThreadControl { delta: 4 });
    assert_eq!(orchestrator.shared().control.current_max_threads(), 2);
}

#[test]
fn interrupt_sets_shutdown_signal_and_announces() {
    let (bus, events, orchestrator) = orchestrator_with_threads(2);

    bus.publish(&PipelineEvent::InterruptRequested);
    assert!(orchestrator.shared().control.interrupted());
    assert!(orchestrator.shared().control.shutdown_requested());
    assert!(
        action_messages(&events.lock().unwrap())
            .iter()
            .any(|m| m.contains("interrupting active compressions"))
    );
}

#[test]
fn refresh_request_raises_the_scheduler_flag() {
    let (bus, _events, orchestrator) = orchestrator_with_threads(2);

    bus.publish(&PipelineEvent::RefreshRequested);
    assert!(orchestrator.shared().control.take_refresh());
    assert!(!orchestrator.shared().control.take_refresh());
}
