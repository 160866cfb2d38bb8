pub mod context;
pub mod coordinator;
pub mod error;
pub mod executor;
pub mod queue;
pub mod registry;
pub mod tools;
pub mod truncate;
pub mod turn;
pub mod vcs;

#[cfg(test)]
mod testing;

pub use context::summarizer::{LlmSummarizer, Summarizer};
pub use context::{ContextConfig, ContextWindowManager};
pub use coordinator::{
    queue_indicator, CancelOptions, CancelReport, Coordinator, SessionInfo, ShutdownOptions,
    ShutdownReport, SubmitReceipt, SubmitStatus,
};
pub use error::EngineError;
pub use executor::{ExecutorConfig, ToolExecutor};
pub use queue::MessageQueue;
pub use registry::ToolRegistry;
pub use tools::create_default_registry;
pub use turn::{SessionState, TurnConfig, TurnEngine, TurnReport, TurnState};
