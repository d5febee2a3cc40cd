//! Core library for gasline.
//!
//! Keeps an in-memory catalog of gas agencies and their products consistent
//! with server-pushed change events. REST snapshots seed the catalog, push
//! events patch it incrementally, and lifecycle triggers (screen focus, app
//! foreground, pull-to-refresh, agency switch) force a full resync.
//!
//! The entry point is [`sync::spawn`], which starts the synchronizer task and
//! returns a [`sync::SyncHandle`] for the UI layer.

pub mod api;
pub mod cache;
pub mod config;
pub mod models;
pub mod sync;
pub mod transport;

pub use api::{ApiClient, ApiError};
pub use cache::{EntityCache, EntityCollection};
pub use config::Config;
pub use models::{Agency, ChangeEvent, EntityKind, EntityStatus, Product};
pub use sync::{spawn, SyncDeps, SyncHandle};
