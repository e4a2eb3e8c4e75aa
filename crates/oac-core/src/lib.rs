//! Execution engine for budget-constrained, multi-agent code contribution
//! runs: discovery findings go in, a bounded-concurrency engine drives
//! agent subprocesses through isolated git worktrees, and a typed event
//! bus reports progress and final outcomes.
//!
//! See each module's doc comment for the component it implements.

pub mod budget;
pub mod circuit;
pub mod duplicate;
pub mod engine;
pub mod error;
pub mod events;
pub mod harness;
pub mod model;
pub mod registry;
pub mod worker;
pub mod worktree;

pub use budget::plan as plan_budget;
pub use circuit::CircuitBreaker;
pub use engine::{Engine, EngineConfig, LifecycleEvent};
pub use error::{normalize, ErrorKind, NormalizeContext, OacError, Severity};
pub use events::{EventBus, Topic};
pub use model::{Job, JobStatus, RunResult, WorkItem};
pub use registry::AgentRegistry;
