//! Peer-to-peer relays and the correlation table.
//!
//! A peer never talks to another peer directly. It asks the broker to
//! forward a payload to the root channel of some owner; if it wants an
//! answer, the broker parks a reply wrapper under a fresh correlation token
//! and waits for the destination to send a response carrying that token,
//! or for the relay timer to fire, whichever comes first.

use std::collections::HashMap;
use std::time::Duration;

use courier_core::{ChannelId, CorrelationToken, Envelope, ForwardRequest, RelayResponse};
use tokio::sync::mpsc::WeakUnboundedSender;
use tracing::{debug, warn};

use crate::completion::{Finished, SlotRef, WrapperPool};
use crate::registry::ChannelRegistry;
use crate::service::Command;

/// A relay waiting for its response.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PendingRelay {
    /// Wrapper that carries the reply back to the origin.
    pub slot: SlotRef,
}

/// Outstanding relays keyed by broker-issued token.
#[derive(Debug, Default)]
pub struct CorrelationTable {
    pending: HashMap<CorrelationToken, PendingRelay>,
    next_token: u64,
}

impl CorrelationTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue a token that has never been issued by this table.
    pub fn issue(&mut self) -> CorrelationToken {
        self.next_token += 1;
        CorrelationToken::new(self.next_token)
    }

    /// Record a pending relay.
    pub fn insert(&mut self, token: CorrelationToken, relay: PendingRelay) {
        let _ = self.pending.insert(token, relay);
    }

    /// Remove and return the relay for `token`.
    pub fn take(&mut self, token: CorrelationToken) -> Option<PendingRelay> {
        self.pending.remove(&token)
    }

    /// Whether `token` is pending.
    pub fn contains(&self, token: CorrelationToken) -> bool {
        self.pending.contains_key(&token)
    }

    /// Number of pending relays.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Keep only relays for which `keep` returns `true`; return the rest.
    pub fn retain<F>(&mut self, mut keep: F) -> Vec<(CorrelationToken, PendingRelay)>
    where
        F: FnMut(CorrelationToken, &PendingRelay) -> bool,
    {
        let mut evicted = Vec::new();
        self.pending.retain(|token, relay| {
            if keep(*token, relay) {
                true
            } else {
                evicted.push((*token, *relay));
                false
            }
        });
        evicted
    }
}

/// What happened to a forward request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ForwardOutcome {
    /// Delivered to the destination. The token is set when a reply is awaited.
    Relayed(Option<CorrelationToken>),
    /// No root channel for the owner; a waiting origin got an empty reply.
    NoDestination,
    /// The destination's queue refused it; treated like no destination.
    Undeliverable,
    /// No destination label; dropped, a waiting origin got an empty reply.
    Malformed,
}

/// Routes forwards to root channels and matches responses to origins.
#[derive(Debug)]
pub struct RelayRouter {
    table: CorrelationTable,
    timeout: Duration,
}

impl RelayRouter {
    /// Create a router whose relays time out after `timeout`.
    pub fn new(timeout: Duration) -> Self {
        Self {
            table: CorrelationTable::new(),
            timeout,
        }
    }

    /// Outstanding relays.
    pub fn table(&self) -> &CorrelationTable {
        &self.table
    }

    /// Forward `request` from `origin` to the root channel of its target owner.
    pub fn forward(
        &mut self,
        request: ForwardRequest,
        origin: &ChannelId,
        registry: &ChannelRegistry,
        pool: &mut WrapperPool,
        events: &WeakUnboundedSender<Command>,
    ) -> ForwardOutcome {
        let ForwardRequest {
            target_owner_id,
            target_channel,
            route,
            payload,
        } = request;

        let slot = route
            .expects_reply()
            .then(|| pool.acquire(origin.clone(), route, Some(self.timeout), events));

        let Some(target_channel) = target_channel else {
            warn!(channel_id = %origin, owner_id = %target_owner_id, "forward without destination label, dropping");
            finish_empty(pool, slot, registry);
            return ForwardOutcome::Malformed;
        };

        let Some(destination) = registry.find_root_for_owner(&target_owner_id) else {
            debug!(channel_id = %origin, owner_id = %target_owner_id, "no root channel for owner");
            finish_empty(pool, slot, registry);
            return ForwardOutcome::NoDestination;
        };

        let token = slot.map(|_| self.table.issue());
        if !destination.send(Envelope::relayed(token, Some(target_channel), payload)) {
            warn!(
                channel_id = %destination.id(),
                owner_id = %target_owner_id,
                "failed to deliver forward"
            );
            finish_empty(pool, slot, registry);
            return ForwardOutcome::Undeliverable;
        }

        if let (Some(slot), Some(token)) = (slot, token) {
            let _ = pool.bind_relay(slot, token);
            self.table.insert(token, PendingRelay { slot });
            debug!(
                channel_id = %origin,
                destination = %destination.id(),
                token = token.get(),
                "relay pending"
            );
        }
        ForwardOutcome::Relayed(token)
    }

    /// Complete the relay `response` answers. Returns whether one was pending.
    pub fn complete_response(
        &mut self,
        response: RelayResponse,
        registry: &ChannelRegistry,
        pool: &mut WrapperPool,
    ) -> bool {
        let token = response.correlation_token;
        let Some(relay) = self.table.take(token) else {
            debug!(token = token.get(), "response for unknown or expired relay, ignoring");
            return false;
        };
        let _ = pool.finish(relay.slot, Some(response.payload), registry);
        true
    }

    /// Drop the pending entry a retired wrapper was waiting on.
    pub fn retire(&mut self, token: CorrelationToken) -> bool {
        self.table.take(token).is_some()
    }

    /// Retire every relay whose origin is `origin`, without replying.
    pub fn evict_origin(&mut self, origin: &ChannelId, pool: &mut WrapperPool) -> usize {
        let evicted = self.table.retain(|_, relay| {
            pool.binding(relay.slot)
                .is_some_and(|binding| &binding.channel_id != origin)
        });
        for (token, relay) in &evicted {
            let _ = pool.release(relay.slot);
            debug!(channel_id = %origin, token = token.get(), "relay evicted with its origin");
        }
        evicted.len()
    }
}

fn finish_empty(pool: &mut WrapperPool, slot: Option<SlotRef>, registry: &ChannelRegistry) {
    if let Some(slot) = slot {
        let finished = pool.finish(slot, None, registry);
        debug_assert!(matches!(finished, Finished::Done { relay_token: None, .. }));
    }
}
