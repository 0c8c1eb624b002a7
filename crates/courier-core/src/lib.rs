//! # courier-core
//!
//! Foundation types shared by the Courier broker crates.
//!
//! - **Branded IDs**: [`ChannelId`] and [`OwnerId`] newtypes for type safety
//! - **Tokens**: [`OriginToken`] and [`CorrelationToken`] for request/response pairing
//! - **Envelope**: the JSON wire shape exchanged with peers, plus shape classification
//! - **Sender metadata**: [`SenderInfo`] describing who opened a channel
//! - **Errors**: [`CoreError`] via `thiserror`
//! - **Logging**: `tracing` subscriber setup and in-memory capture for tests

#![deny(unsafe_code)]

pub mod envelope;
pub mod errors;
pub mod ids;
pub mod logging;
pub mod sender;

pub use envelope::{Envelope, ForwardRequest, Inbound, LocalRequest, RelayResponse, ReplyRoute};
pub use errors::{CoreError, Result};
pub use ids::{ChannelId, CorrelationToken, OriginToken, OwnerId};
pub use sender::SenderInfo;
