//! # courier-broker
//!
//! In-process message relay and request/response broker.
//!
//! Peers connect over independent channels. Each inbound envelope is either
//! a local request for a labelled handler, a forward to the root channel of
//! another owner, or a response to such a forward. The broker correlates
//! relays with broker-issued tokens, enforces the relay timeout and can
//! broadcast a payload to every live channel.
//!
//! All broker state lives in one [`Broker`] driven by a single task
//! ([`BrokerService::spawn`]); hosts talk to it through [`BrokerHandle`].

#![deny(unsafe_code)]

pub mod broadcast;
pub mod broker;
pub mod channel;
pub mod completion;
pub mod handlers;
pub mod metrics;
pub mod registry;
pub mod relay;
pub mod service;

pub use broker::{Broker, BrokerStats};
pub use channel::Channel;
pub use completion::{Completion, SlotRef, WrapperPool};
pub use handlers::{Handler, HandlerOutcome, HandlerTable};
pub use registry::ChannelRegistry;
pub use relay::{CorrelationTable, ForwardOutcome, RelayRouter};
pub use service::{BrokerHandle, BrokerService, Command, PeerEndpoint};
