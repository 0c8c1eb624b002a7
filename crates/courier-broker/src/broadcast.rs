//! Fan-out of a payload to every live channel.

use metrics::counter;
use serde_json::Value;
use tracing::{debug, warn};

use courier_core::Envelope;

use crate::metrics::BROADCASTS_TOTAL;
use crate::registry::ChannelRegistry;

/// Send `{broadcast: true, msg}` to every channel registered right now.
///
/// A failing channel does not stop delivery to the rest. Returns the number
/// of channels that accepted the envelope.
pub fn broadcast(registry: &ChannelRegistry, payload: Value) -> usize {
    counter!(BROADCASTS_TOTAL).increment(1);
    let envelope = Envelope::broadcast(payload);
    let recipients = registry.len();

    let mut delivered = 0;
    for channel in registry.iter() {
        if channel.send(envelope.clone()) {
            delivered += 1;
        } else {
            warn!(channel_id = %channel.id(), "failed to send broadcast to channel");
        }
    }
    debug!(recipients, delivered, "broadcast");
    delivered
}
