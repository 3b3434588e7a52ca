pub mod catalog;
pub mod health;
pub mod passthrough;
pub mod workflow;

#[cfg(test)]
mod passthrough_tests;

pub use catalog::{ToolCatalog, ToolDefinition};
pub use health::{HealthProbe, HealthSnapshot};
pub use passthrough::{PassThroughService, PassThroughSettings, ToolCall, ToolGateway};
pub use workflow::sequencer::SequencerOrchestrator;
pub use workflow::umg::UmgOrchestrator;
