//! Execution Engine
//!
//! Runs capture-and-compare for many subjects with a fixed pool of tokio
//! workers pulling from one shared queue.
//!
//! ```text
//! subjects → VecDeque ← worker 1..=concurrency
//!                          ↓ snapshot index: get_or_create_id
//!                          ↓ Capturer::capture(targets)
//!                          ↓ results index: set_entry / remove_entry
//!                          ↓ failure count ≥ max_failures → stop flag
//! pool drained → flush both indexes → RunSummary
//! ```
//!
//! Stopping is cooperative: a set stop flag (failure limit or
//! [`CancelHandle`]) only prevents workers from taking another subject.

mod runner;
mod types;

pub use runner::Engine;
pub use types::{
    CancelHandle, EngineError, EngineEvent, EngineResult, ExitCode, RunOptions, RunSummary, SubjectResult,
};
