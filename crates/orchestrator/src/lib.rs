//! Orchestration for Aviary.
//!
//! Invoked when routing is not confident: decomposes the request into a
//! task DAG, executes layers concurrently through the expert registry with
//! bounded handoff on missing capabilities, serialises all events through
//! one dispatcher, and aggregates multi-task results.

pub mod aggregate;
pub mod decompose;
pub mod dispatch;
pub mod orchestrator;
pub mod plan;
pub mod scheduler;

pub use aggregate::{concatenate_results, Aggregator, RESULT_SEPARATOR};
pub use decompose::Decomposer;
pub use dispatch::EventDispatcher;
pub use orchestrator::{AggregationUsage, ExecutionResult, Orchestrator};
pub use plan::{substitute_results, Task, TaskPlan, TaskStatus};
pub use scheduler::{HandoffHandler, Scheduler, TaskError};
