//! wardsync-core - Synchronization core for wardsync
//!
//! This crate contains the logical clock, dependency graph, sync lookup index,
//! session manager, echo/race reconciler and device admission queue shared by
//! the central server and the facility client.

pub mod admission;
pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod facility;
pub mod graph;
pub mod lookup;
pub mod models;
pub mod protocol;
pub mod reconcile;
pub mod records;
pub mod schema;
pub mod service;
pub mod session;
pub mod util;

pub use config::SyncSettings;
pub use error::{Error, Result};
pub use models::{SyncTick, SyncableRecord};
pub use schema::SyncSchema;
pub use service::SyncStore;
pub use session::SessionManager;
