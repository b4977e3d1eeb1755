//! Worker execution: the per-worker decision loop and its workspace tools.

pub mod capabilities;
pub mod runner;

pub use capabilities::WorkspaceTools;
pub use runner::{WorkerOutput, run_worker};
