//! Domain substrate for the crawl control plane: entities, settings, cron
//! matching, record fingerprints, and the SQLite-backed run/record stores.

pub mod cron;
pub mod error;
pub mod fingerprint;
pub mod model;
pub mod settings;
pub mod store;

pub use error::StoreError;
pub use model::{DispatchRequest, Project, Run, RunOrigin, RunState, Schedule, Spider};
pub use settings::{ControlConfig, RunSettings};
pub use store::{RecordStore, RunStore, Store};
