//! Frame pipeline: stage contract, per-stage runner and chain wiring.
//!
//! Each stage runs on its own tokio task with a data inbox and a priority
//! system inbox, so per-producer order is preserved while `Cancel` and
//! `Error` frames overtake queued data.

pub mod error;
pub mod orchestrator;
pub(crate) mod runner;
pub mod stage;

pub use error::StageError;
pub use orchestrator::{Pipeline, TASK_ENDPOINT};
pub use stage::{Routed, Stage, StageContext};
