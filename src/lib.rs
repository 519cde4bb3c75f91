//! Batch AV1 re-encoder pipeline core.
//!
//! Walks one or more source trees, mirrors every eligible video into an
//! output tree as an AV1 re-encode, and records per-file outcomes as sidecar
//! marker files. External tools (ffmpeg, ffprobe, exiftool) do the actual
//! encoding and probing; this crate owns discovery, classification, the
//! dynamic-capacity scheduler, the per-job state machine and the event bus
//! feeding the dashboard projection.

mod sync_ext;
pub mod vbc_core;
