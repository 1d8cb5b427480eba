//! Drover - unattended agent-loop sessions with a crash-safe shared registry.
//!
//! Drover runs named "agent loop" sessions: a background process repeatedly
//! invokes an external coding-agent CLI against a task file until the agent
//! signals completion, an iteration fails, or the iteration budget runs out.
//! Independent CLI invocations (start, stop, resume, status) and a small
//! HTTP status endpoint all observe and mutate one lock-guarded, atomically
//! written session registry on disk.
//!
//! # Architecture
//!
//! - [`store`] - cross-process session registry (locking, merge updates,
//!   atomic persistence, stale reconciliation)
//! - [`lifecycle`] - start / resume / stop / status operations
//! - [`runner`] - the iteration loop driving one session to a terminal
//!   status
//! - [`completion`] - promise-tag completion detection
//! - [`backend`] - agent CLI adapters
//! - [`prd`] - task-file counting and block extraction
//! - [`process`] - pid liveness probing
//! - [`server`] - HTTP status surface
//! - [`testing`] - scripted fakes for the backend/prd/inspector seams

pub mod backend;
pub mod completion;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod prd;
pub mod process;
pub mod prompt;
pub mod runner;
pub mod server;
pub mod store;
pub mod testing;

// Re-export commonly used types
pub use error::{DroverError, Result};

pub use config::StoreConfig;
pub use lifecycle::{SessionView, StartSettings};
pub use process::{ProcessInspector, SignalProbe};
pub use runner::{IterationReport, LoopRunner, LoopSettings};
pub use store::{CleanupMode, SessionRecord, SessionStatus, SessionUpdate, StateStore};
