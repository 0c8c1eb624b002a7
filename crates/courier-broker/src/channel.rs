//! A live bidirectional channel as seen by the broker.

use std::sync::atomic::{AtomicU64, Ordering};

use courier_core::{ChannelId, Envelope, SenderInfo};
use metrics::counter;
use tokio::sync::mpsc;

use crate::metrics::SEND_FAILURES_TOTAL;

/// One connected peer context.
///
/// The broker only ever writes to a channel; inbound traffic arrives as
/// commands tagged with the channel id.
pub struct Channel {
    id: ChannelId,
    sender: SenderInfo,
    tx: mpsc::Sender<Envelope>,
    dropped_messages: AtomicU64,
}

impl Channel {
    /// Wrap an existing outbound queue.
    pub fn new(id: ChannelId, sender: SenderInfo, tx: mpsc::Sender<Envelope>) -> Self {
        Self {
            id,
            sender,
            tx,
            dropped_messages: AtomicU64::new(0),
        }
    }

    /// Create a channel with a fresh bounded queue and return its receiving end.
    pub fn open(
        id: ChannelId,
        sender: SenderInfo,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<Envelope>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(id, sender, tx), rx)
    }

    /// Channel identity.
    pub fn id(&self) -> &ChannelId {
        &self.id
    }

    /// Who opened the channel.
    pub fn sender(&self) -> &SenderInfo {
        &self.sender
    }

    /// Queue an envelope for the peer.
    ///
    /// Returns `false` if the queue is full or the peer went away, and
    /// counts the drop.
    pub fn send(&self, envelope: Envelope) -> bool {
        if self.tx.try_send(envelope).is_ok() {
            true
        } else {
            let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
            counter!(SEND_FAILURES_TOTAL).increment(1);
            false
        }
    }

    /// Total envelopes dropped for this channel.
    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    /// Whether the peer dropped its receiving end.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("sender", &self.sender)
            .field("dropped_messages", &self.drop_count())
            .finish_non_exhaustive()
    }
}
