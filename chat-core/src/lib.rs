//! Shared types, error taxonomy, configuration, and external-collaborator
//! interfaces for the messaging core.
//!
//! This crate has no knowledge of storage, transport, or networking; it is
//! the vocabulary the other crates build on, in the same role `ethers-core`
//! plays for `ethers-providers`.

pub mod config;
pub mod error;
pub mod ids;
pub mod membership;
pub mod message;
pub mod notify;
pub mod outbox;

pub use error::ChatError;
pub use ids::{ChannelId, MsgId, SeqId, TenantId, UserId};
pub use message::{Attachment, Envelope, Message, MessageType};
pub use notify::{PushNotifier, PushTask};
pub use outbox::{OutboxRow, OutboxStatus};
