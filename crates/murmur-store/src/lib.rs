//! # murmur-store
//!
//! Durable local state for the delivery engine, backed by SQLite in WAL mode.
//!
//! Two layers live side by side: the local-intent log (`messages`, `outbox`)
//! and the confirmation overlay (`relay_results`). They are joined by local
//! message id when the client builds a conversation view. Every status
//! transition is a single statement or transaction, so a transition has
//! happened once the call returns.

pub mod database;
pub mod groups;
pub mod messages;
pub mod migrations;
pub mod models;
pub mod outbox;
pub mod reactions;
pub mod relay_results;
pub mod sync_state;

mod error;

pub use database::Database;
pub use error::{Result, StoreError};
pub use models::*;
