// src/trace/mod.rs
//! Trace and context engine
//!
//! - **Tracer**: [`Trace`], run scopes, sampling and lazy startup
//! - **Context**: [`TraceContext`], event emission for one run
//! - **Scope**: per-thread and per-task stacks of open contexts
//! - **Sampler**: run sampling decisions
//! - **Global**: the process-wide [`Trace`]
//!
//! # Flow
//!
//! ```text
//! run() ──► sample ──► TraceContext ──► push on stack ──► run_start
//!               │            │
//!               │            └── emissions ──► EventQueue ──► worker ──► Exporter
//!               └── not sampled ──► empty scope
//! scope exit ──► error if panicking ──► run_end ──► pop
//! ```

pub mod context;
pub mod global;
pub mod sampler;
pub mod scope;
pub mod tracer;

// Re-export commonly used types
pub use context::{ParentGuard, RunLabels, TraceContext};
pub use global::{get_trace, set_trace};
pub use sampler::{default_should_sample, HashSampler, Sampler};
pub use scope::{propagate, ContextStack};
pub use tracer::{RunOptions, RunScope, Trace};
