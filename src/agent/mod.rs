//! The agent: prompts, action parsing and the step loop.
//!
//! An [`AgentLoop`] owns one [`ModelClient`](crate::llm::ModelClient) and one
//! [`Environment`](crate::execution::Environment) for the lifetime of a task
//! and moves through these states:
//!
//! ```text
//! INIT ──► RUNNING ──► SUBMITTED | LIMITS_EXCEEDED | CANCELLED | FATAL_ERROR
//!            │
//!            └─ AWAITING_MODEL → PARSING → EXECUTING → OBSERVING ─┐
//!                     ▲                                           │
//!                     └───────────────────────────────────────────┘
//! ```

pub mod agent_loop;
pub mod parser;
pub mod templates;

pub use agent_loop::{
    has_finished, AgentConfig, AgentError, AgentLoop, AgentRun, Cancellation, ExitStatus,
    StepObserver, DEFAULT_SENTINELS,
};
pub use parser::{ActionParser, FencedBlockParser, FormatError};
pub use templates::{
    ObservationView, PromptRenderer, PromptTemplates, RenderVars, TemplateError, TruncationConfig,
};
