//! Live channels indexed by identity.

use std::collections::{BTreeMap, HashMap};

use courier_core::{ChannelId, OwnerId};
use metrics::gauge;
use tracing::{debug, warn};

use crate::channel::Channel;
use crate::metrics::CHANNELS_ACTIVE;

/// Every channel the broker can currently reach.
///
/// Iteration (and therefore [`find`](Self::find)) follows registration order.
#[derive(Debug, Default)]
pub struct ChannelRegistry {
    channels: BTreeMap<u64, Channel>,
    index: HashMap<ChannelId, u64>,
    next_seq: u64,
}

impl ChannelRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a channel keyed by its identity.
    ///
    /// An identity already in use keeps its existing channel; the newcomer is
    /// dropped and `false` is returned.
    pub fn register(&mut self, channel: Channel) -> bool {
        if self.index.contains_key(channel.id()) {
            warn!(channel_id = %channel.id(), "channel id already registered, rejecting newcomer");
            return false;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        let _ = self.index.insert(channel.id().clone(), seq);
        debug!(channel_id = %channel.id(), owner_id = ?channel.sender().owner_id, "channel registered");
        let _ = self.channels.insert(seq, channel);
        self.record_gauge();
        true
    }

    /// Remove a channel. Unknown ids are a no-op.
    pub fn unregister(&mut self, id: &ChannelId) -> Option<Channel> {
        let seq = self.index.remove(id)?;
        let channel = self.channels.remove(&seq);
        debug!(channel_id = %id, "channel unregistered");
        self.record_gauge();
        channel
    }

    /// Look up a channel.
    pub fn get(&self, id: &ChannelId) -> Option<&Channel> {
        self.index.get(id).and_then(|seq| self.channels.get(seq))
    }

    /// Whether `id` is registered.
    pub fn contains(&self, id: &ChannelId) -> bool {
        self.index.contains_key(id)
    }

    /// Number of registered channels.
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    /// Whether no channel is registered.
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Registered identities in registration order.
    pub fn ids(&self) -> Vec<ChannelId> {
        self.channels.values().map(|c| c.id().clone()).collect()
    }

    /// Registered channels in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &Channel> {
        self.channels.values()
    }

    /// First channel matching `predicate`.
    pub fn find<P>(&self, mut predicate: P) -> Option<&Channel>
    where
        P: FnMut(&Channel) -> bool,
    {
        self.channels.values().find(|c| predicate(c))
    }

    /// The top-level channel of `owner`, if one is connected.
    ///
    /// Channels whose peer already dropped its end are skipped.
    pub fn find_root_for_owner(&self, owner: &OwnerId) -> Option<&Channel> {
        self.find(|c| c.sender().is_root_of(owner) && !c.is_closed())
    }

    #[allow(clippy::cast_precision_loss)]
    fn record_gauge(&self) {
        gauge!(CHANNELS_ACTIVE).set(self.channels.len() as f64);
    }
}
