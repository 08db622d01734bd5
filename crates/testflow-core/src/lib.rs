//! Testflow Core Domain Types
//!
//! This crate contains pure domain types with no dependencies on:
//! - Network/HTTP
//! - Subprocess execution
//! - Runtime specifics
//!
//! All types here represent the core business domain of Testflow: the
//! build payload handed to an agent run, the test configuration it
//! resolves, the diff it selects tests from, and the task status it
//! reports back.

pub mod config;
pub mod diff;
pub mod error;
pub mod payload;
pub mod result;
pub mod status;
pub mod task;

// Re-export commonly used types
pub use config::{CacheSpec, CommandBlock, Merge, MergeV2, SplitMode, Submodule, TasConfig, TasConfigV2};
pub use diff::{ChangeKind, Diff};
pub use error::AgentError;
pub use payload::{BuildPayload, EventType, GitProvider, Oauth, TokenType};
pub use result::{DiscoveryResult, ExecutionResponse, ExecutionResults, SuiteResult, TestResult};
pub use status::{classify, RunOutcome, Status, GENERIC_ERROR_REMARK};
pub use task::{TaskRun, TaskType};
