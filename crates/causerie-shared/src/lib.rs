// Types shared between the local store and the sync engine.

pub mod constants;
pub mod error;
pub mod protocol;
pub mod types;

pub use error::TransportError;
pub use protocol::{ConversationSnapshot, MessageSnapshot, RemoteEvent};
pub use types::{ConversationId, MessageId, MessagePayload, MessageStatus, UserId};
