// Relay networking: one WebSocket session per relay, fanned in to listeners.

pub mod backoff;
pub mod connection;
pub mod error;
#[cfg(any(test, feature = "testing"))]
pub mod memory;
pub mod pool;
pub mod transport;

pub use backoff::Backoff;
pub use connection::{RelayHealth, RelayStatus};
pub use error::NetError;
pub use pool::{FrameSubscription, HealthChange, InboundFrame, PoolConfig, RelayPool};
pub use transport::{normalize_relay_url, Connector, WebSocketConnector};
