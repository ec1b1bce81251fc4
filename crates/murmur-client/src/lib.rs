//! Reliable message delivery for the murmur client.
//!
//! [`Client`] is the entry point: it owns the relay pool, the local store and
//! the [`DeliveryEngine`] that moves messages between them.

pub mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod monitor;
pub mod ordering;
pub mod scheduler;
pub mod tracer;

use tracing_subscriber::{fmt, EnvFilter};

pub use client::Client;
pub use config::ClientConfig;
pub use engine::{
    DeliveryEngine, EngineBuilder, EngineConfig, MessageView, QueueStatus, RelaySummary,
    SendReceipt, SendRequest, StatusUpdate, Target,
};
pub use error::{ErrorKind, MessageError, RecoveryAction};
pub use monitor::{Availability, NetworkMonitor, NetworkState};
pub use tracer::{FlowRecord, FlowStage, FlowTracer};

/// Install the global `tracing` subscriber. `RUST_LOG` overrides the default
/// filter. Calling it twice is harmless.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("murmur_client=debug,murmur_net=debug,murmur_store=info,warn")
    });

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .try_init();
}
