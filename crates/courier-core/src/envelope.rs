//! Wire envelope exchanged between the broker and its peers.
//!
//! The JSON field names are fixed by the peers and kept verbatim:
//!
//! | field | meaning |
//! |---|---|
//! | `channelName` | label used for local dispatch (and echoed on replies) |
//! | `msg` | opaque payload, `null` when empty |
//! | `toTabId` / `toChannel` | peer-to-peer forward: destination owner and label |
//! | `auxProcessId` | origin token; present when the sender wants a reply |
//! | `mainProcessId` | correlation token issued by the broker for a relay |
//! | `broadcast` | set on envelopes produced by a broadcast |
//!
//! Inbound envelopes are classified by shape with [`Envelope::classify`].

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::errors::{CoreError, Result};
use crate::ids::{CorrelationToken, OriginToken, OwnerId};

/// A message travelling over a channel, in either direction.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Label used to pick a local handler.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_name: Option<String>,
    /// Opaque payload. Always serialized, as `null` when empty.
    #[serde(rename = "msg", default)]
    pub payload: Value,
    /// Destination owner of a peer-to-peer forward. An explicit `null`
    /// still marks a forward, to an owner that never matches.
    #[serde(
        rename = "toTabId",
        default,
        deserialize_with = "present_owner",
        skip_serializing_if = "Option::is_none"
    )]
    pub target_owner_id: Option<OwnerId>,
    /// Destination label of a peer-to-peer forward.
    #[serde(rename = "toChannel", default, skip_serializing_if = "Option::is_none")]
    pub target_channel: Option<String>,
    /// Token the sender wants echoed on the reply.
    #[serde(rename = "auxProcessId", default, skip_serializing_if = "Option::is_none")]
    pub origin_token: Option<OriginToken>,
    /// Broker-issued token linking a relayed request to its reply.
    #[serde(rename = "mainProcessId", default, skip_serializing_if = "Option::is_none")]
    pub correlation_token: Option<CorrelationToken>,
    /// Marks broadcast-wrapped payloads.
    #[serde(default, skip_serializing_if = "is_false")]
    pub broadcast: bool,
}

fn present_owner<'de, D>(deserializer: D) -> std::result::Result<Option<OwnerId>, D::Error>
where
    D: Deserializer<'de>,
{
    let owner = Option::<OwnerId>::deserialize(deserializer)?;
    Ok(Some(owner.unwrap_or_else(OwnerId::behind_the_scene)))
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn is_false(b: &bool) -> bool {
    !*b
}

impl Envelope {
    /// Parse an envelope from JSON text.
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(CoreError::InvalidEnvelope)
    }

    /// Serialize to JSON text.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(CoreError::Serialize)
    }

    /// Local request addressed to the handler registered for `channel_name`.
    #[must_use]
    pub fn request(channel_name: impl Into<String>, payload: Value) -> Self {
        Self {
            channel_name: Some(channel_name.into()),
            payload,
            ..Self::default()
        }
    }

    /// Peer-to-peer forward to the root channel of `owner`.
    #[must_use]
    pub fn forward_request(
        owner: impl Into<OwnerId>,
        target_channel: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            target_owner_id: Some(owner.into()),
            target_channel: Some(target_channel.into()),
            payload,
            ..Self::default()
        }
    }

    /// Reply from a peer to a relayed request.
    #[must_use]
    pub fn relay_response(token: CorrelationToken, payload: Value) -> Self {
        Self {
            correlation_token: Some(token),
            payload,
            ..Self::default()
        }
    }

    /// Envelope the broker delivers to a destination for a relayed request.
    #[must_use]
    pub fn relayed(
        token: Option<CorrelationToken>,
        channel_name: Option<String>,
        payload: Value,
    ) -> Self {
        Self {
            correlation_token: token,
            channel_name,
            payload,
            ..Self::default()
        }
    }

    /// Envelope the broker delivers to every channel on broadcast.
    #[must_use]
    pub fn broadcast(payload: Value) -> Self {
        Self {
            payload,
            broadcast: true,
            ..Self::default()
        }
    }

    /// Ask for a reply by attaching an origin token.
    #[must_use]
    pub fn with_origin_token(mut self, token: impl Into<OriginToken>) -> Self {
        self.origin_token = Some(token.into());
        self
    }

    /// Classify an inbound envelope by shape.
    ///
    /// `toTabId` wins over `mainProcessId`; anything with neither is a local
    /// request.
    #[must_use]
    pub fn classify(self) -> Inbound {
        if let Some(target_owner_id) = self.target_owner_id {
            return Inbound::Forward(ForwardRequest {
                target_owner_id,
                target_channel: self.target_channel,
                route: ReplyRoute {
                    origin_token: self.origin_token,
                    channel_name: self.channel_name,
                },
                payload: self.payload,
            });
        }
        if let Some(correlation_token) = self.correlation_token {
            return Inbound::Response(RelayResponse {
                correlation_token,
                payload: self.payload,
            });
        }
        Inbound::Local(LocalRequest {
            route: ReplyRoute {
                origin_token: self.origin_token,
                channel_name: self.channel_name,
            },
            payload: self.payload,
        })
    }
}

/// An inbound envelope after shape classification.
#[derive(Clone, Debug, PartialEq)]
pub enum Inbound {
    /// Peer-to-peer forward (`toTabId` present).
    Forward(ForwardRequest),
    /// Peer-to-peer response (`mainProcessId` present).
    Response(RelayResponse),
    /// Request for a local handler.
    Local(LocalRequest),
}

/// The parts of a request needed to shape its reply.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReplyRoute {
    /// Token to echo back; `None` means nobody waits for a reply.
    pub origin_token: Option<OriginToken>,
    /// Label to echo back.
    pub channel_name: Option<String>,
}

impl ReplyRoute {
    /// Whether the sender is waiting for a reply.
    pub fn expects_reply(&self) -> bool {
        self.origin_token.is_some()
    }

    /// Build the reply envelope carrying `payload` (`null` when `None`).
    #[must_use]
    pub fn reply(&self, payload: Option<Value>) -> Envelope {
        Envelope {
            origin_token: self.origin_token,
            channel_name: self.channel_name.clone(),
            payload: payload.unwrap_or(Value::Null),
            ..Envelope::default()
        }
    }
}

/// A request for a local handler.
#[derive(Clone, Debug, PartialEq)]
pub struct LocalRequest {
    /// Reply addressing.
    pub route: ReplyRoute,
    /// Request payload.
    pub payload: Value,
}

/// A request one peer wants delivered to another peer's root channel.
#[derive(Clone, Debug, PartialEq)]
pub struct ForwardRequest {
    /// Owner whose root channel receives the forward.
    pub target_owner_id: OwnerId,
    /// Label the destination dispatches on.
    pub target_channel: Option<String>,
    /// Reply addressing back to the origin.
    pub route: ReplyRoute,
    /// Forwarded payload.
    pub payload: Value,
}

/// A peer's answer to a relayed request.
#[derive(Clone, Debug, PartialEq)]
pub struct RelayResponse {
    /// Token the broker issued when forwarding.
    pub correlation_token: CorrelationToken,
    /// Answer payload.
    pub payload: Value,
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
