//! # causerie-store
//!
//! Durable local storage for the Causerie sync engine, backed by SQLite.
//!
//! The store is the single source of truth for the UI: messages,
//! conversations, and the outbound send queue live in three tables, and every
//! write is atomic from the caller's perspective.  The crate exposes a
//! synchronous `Database` handle that wraps a `rusqlite::Connection` and
//! provides typed CRUD helpers for every domain model.

pub mod conversations;
pub mod database;
pub mod messages;
pub mod migrations;
pub mod models;
pub mod outbox;

mod error;

pub use database::Database;
pub use error::StoreError;
pub use models::*;
