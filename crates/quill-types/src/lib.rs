mod agent;
mod event;
mod mcp;
mod message;
mod permission;
mod tool;

pub use agent::*;
pub use event::*;
pub use mcp::*;
pub use message::*;
pub use permission::*;
pub use tool::*;
