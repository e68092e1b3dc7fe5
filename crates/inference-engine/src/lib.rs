//! Worker supervision for Model Depot
//!
//! This crate provides the runner supervisor: it spawns a worker process per
//! generation, waits for it to become healthy, loads an artifact into it and
//! relays the streamed completion back to the caller.

pub mod port;
pub mod state;
pub mod stream;
pub mod supervisor;
pub mod worker;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Re-export commonly used types
pub use state::RunnerState;
pub use stream::GenerationStream;
pub use supervisor::{RunnerHandle, RunnerSupervisor};
pub use worker::{CommandLauncher, LaunchSpec, WorkerLauncher, WorkerProcess};
