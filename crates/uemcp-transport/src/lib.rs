pub mod broker;
pub mod events;
pub mod facade;
pub mod transport;


pub use broker::{RequestBroker, ToolRequest};
pub use events::{EventRouter, EventSubscription, NormalizedEvent, NotificationKind};
pub use facade::McpFacade;
pub use transport::{TransportOptions, UeWsTransport};
