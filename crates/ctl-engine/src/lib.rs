//! The crawl execution control plane: scheduler, dispatcher, worker
//! supervisor, output tailing and ingestion, reconciliation, and progress
//! broadcasting, wired together as named tasks on one runtime.

mod api;
mod broadcast;
mod dispatch;
mod engine;
mod ingest;
mod proc;
mod queue;
mod reconcile;
mod scheduler;
mod stats;
mod supervisor;
mod tailer;
mod worker;

pub use api::{
    ActiveRunSnapshot, EngineError, EngineHandle, RunEvent, StatusSnapshot, StopReason,
    start_control_plane,
};
pub use queue::{DispatchQueue, InMemoryQueue};
