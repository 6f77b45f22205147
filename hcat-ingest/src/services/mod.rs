//! Pipeline services
//!
//! Session Manager sequences Mapping Engine → Validator → Preview Builder →
//! Job Runner (Commit Executor). Task queues dispatch commit jobs to workers.

pub mod commit_executor;
pub mod job_runner;
pub mod mapping_engine;
pub mod preview_builder;
pub mod session_manager;
pub mod task_queue;
pub mod validator;

pub use commit_executor::{CommitExecutor, RollbackFailure, RollbackReport};
pub use job_runner::{CancellationTokens, ClaimOutcome, JobRunner, StartOutcome};
pub use mapping_engine::MappingEngine;
pub use preview_builder::{PreviewNode, PreviewTree};
pub use session_manager::SessionManager;
pub use task_queue::{InlineQueue, TaskQueue, WorkerQueue};
pub use validator::Validator;
