//! tailgate: WebSocket front end for the tailgate-core engine
//!
//! Viewers connect over `/ws`, subscribe to `<source>:<format>` channels and
//! receive each new chunk of the source's log as it is written.

pub mod config;
pub mod server;
pub mod shutdown;
pub mod ws;

pub use config::{Config, ConfigError};
pub use server::{create_router, run_server, AppState};
