pub mod config;
pub mod error;
pub mod event_bus;
pub mod logger;
pub mod orchestrator;
pub mod permissions;
pub mod runtime;
pub mod session_title;
pub mod storage;

pub use config::*;
pub use error::*;
pub use event_bus::*;
pub use logger::*;
pub use orchestrator::*;
pub use permissions::*;
pub use runtime::*;
pub use session_title::*;
pub use storage::*;
