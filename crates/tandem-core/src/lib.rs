pub mod config;
pub mod error;
pub mod event;

pub use config::{AppConfig, ServerConfig, TransportConfig, TransportKind};
pub use error::{Result, TandemError};
pub use event::{EventBus, SessionEvent};
