//! tailgate-core: subscription and backend lifecycle engine
//!
//! Tails log sources on demand, reference-counts subscriber interest per source,
//! and fans each chunk of new data out to every connection subscribed to one of
//! the source's channels.

pub mod backend;
pub mod channel;
pub mod connection;
pub mod error;
pub mod fanout;
pub mod format;
pub mod layout;
pub mod metrics;
pub mod registry;
pub mod session;

pub use backend::{Backend, BackendFactory, BackendHandle, BackendKind, BackendSettings, SourceTarget};
pub use channel::{ChannelKey, SourceId};
pub use connection::{ConnectionId, EmitResult, Outbound, Outbox};
pub use error::{BackendError, ChannelError, RegistryError};
pub use fanout::ChannelFanout;
pub use format::{FormatRegistry, Payload};
pub use layout::SourceLayout;
pub use registry::SourceRegistry;
pub use session::{Hub, HubSettings, Session, SubscribeOutcome};
