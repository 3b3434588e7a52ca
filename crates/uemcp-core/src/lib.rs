pub mod error;
pub mod invoke;
pub mod messages;
pub mod metrics;
pub mod retry;

pub use error::{BridgeError, Result};
pub use invoke::{ToolCallResult, ToolCallSpec, ToolInvoker};
pub use messages::{UeResponse, parse_json_message, parse_mcp_response};
pub use metrics::RuntimeMetrics;
