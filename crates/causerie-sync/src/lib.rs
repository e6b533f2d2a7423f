//! # causerie-sync
//!
//! Client-side message synchronization engine.
//!
//! The engine guarantees that a composed message eventually reaches the
//! remote store exactly once, survives process crashes and network loss, and
//! converges with concurrently-arriving remote updates into a single
//! consistent local view.  The local store is the single source of truth;
//! every component coordinates purely through the state persisted there.

pub mod config;
pub mod engine;
pub mod events;
pub mod logging;
pub mod outbound;
pub mod receipts;
pub mod reconcile;
pub mod recovery;
pub mod retry;
pub mod transport;

mod error;

pub use config::SyncConfig;
pub use engine::SyncEngine;
pub use error::SyncError;
pub use events::{ChangeEvent, ChangeNotifier};
pub use outbound::OutboundProcessor;
pub use receipts::ReceiptAggregator;
pub use reconcile::Reconciler;
pub use recovery::{CrashRecovery, RecoveryReport};
pub use retry::RetryPolicy;
pub use transport::{MockTransport, OutgoingMessage, RemoteAck, RemoteTransport};
