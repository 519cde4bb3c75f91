pub mod config;
pub mod dashboard;
pub mod discovery;
pub mod domain;
pub mod engine;
pub mod events;
pub mod exiftool;
pub mod ffmpeg;
pub mod ffprobe;
pub mod housekeeping;
pub mod metadata_cache;
pub mod queue_sort;
pub mod scanner;
pub mod tools;

pub use config::{AppConfig, GeneralConfig, load_config};
pub use dashboard::Dashboard;
pub use domain::{CompressionJob, JobStatus, VideoFile, VideoMetadata};
pub use engine::Orchestrator;
pub use events::{EventBus, EventKind, PipelineEvent};
pub use tools::ToolPaths;
