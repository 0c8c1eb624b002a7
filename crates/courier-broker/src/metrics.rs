//! Metric names recorded by the broker.
//!
//! Recording goes through the `metrics` facade; the host decides whether to
//! install an exporter. Without one every call is a no-op.

/// Inbound envelopes processed (counter, labels: kind).
pub const MESSAGES_TOTAL: &str = "courier_messages_total";
/// Local requests no handler claimed (counter).
pub const UNHANDLED_TOTAL: &str = "courier_unhandled_total";
/// Relays completed by their timer instead of a response (counter).
pub const RELAY_TIMEOUTS_TOTAL: &str = "courier_relay_timeouts_total";
/// Envelopes a channel's queue refused (counter).
pub const SEND_FAILURES_TOTAL: &str = "courier_send_failures_total";
/// Registered channels (gauge).
pub const CHANNELS_ACTIVE: &str = "courier_channels_active";
/// Broadcasts issued (counter).
pub const BROADCASTS_TOTAL: &str = "courier_broadcasts_total";

/// `kind` label for local requests.
pub const KIND_LOCAL: &str = "local";
/// `kind` label for peer-to-peer forwards.
pub const KIND_FORWARD: &str = "forward";
/// `kind` label for peer-to-peer responses.
pub const KIND_RESPONSE: &str = "response";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metric_constants_are_snake_case() {
        let names = [
            MESSAGES_TOTAL,
            UNHANDLED_TOTAL,
            RELAY_TIMEOUTS_TOTAL,
            SEND_FAILURES_TOTAL,
            CHANNELS_ACTIVE,
            BROADCASTS_TOTAL,
            KIND_LOCAL,
            KIND_FORWARD,
            KIND_RESPONSE,
        ];
        for name in names {
            assert!(
                name.chars().all(|c| c.is_ascii_lowercase() || c == '_'),
                "metric name '{name}' must be snake_case"
            );
        }
    }

    #[test]
    fn metric_names_are_prefixed() {
        for name in [
            MESSAGES_TOTAL,
            UNHANDLED_TOTAL,
            RELAY_TIMEOUTS_TOTAL,
            SEND_FAILURES_TOTAL,
            CHANNELS_ACTIVE,
            BROADCASTS_TOTAL,
        ] {
            assert!(name.starts_with("courier_"), "{name}");
        }
    }
}
