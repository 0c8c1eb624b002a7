//! The broker state machine.
//!
//! [`Broker`] owns every table and reacts to one [`Command`] at a time. It is
//! normally driven by [`BrokerService`](crate::service::BrokerService), but
//! can be embedded in any loop that feeds it commands, as long as that loop
//! runs inside a tokio runtime: relay timers are spawned as tokio tasks.

use courier_core::{ChannelId, Envelope, Inbound, LocalRequest, SenderInfo};
use courier_settings::BrokerSettings;
use metrics::counter;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc::WeakUnboundedSender;
use tracing::{debug, error, instrument, warn};

use crate::broadcast;
use crate::channel::Channel;
use crate::completion::{Completion, Finished, SlotRef, WrapperPool};
use crate::handlers::{Handler, HandlerOutcome, HandlerTable};
use crate::metrics::{
    KIND_FORWARD, KIND_LOCAL, KIND_RESPONSE, MESSAGES_TOTAL, RELAY_TIMEOUTS_TOTAL,
    UNHANDLED_TOTAL,
};
use crate::registry::ChannelRegistry;
use crate::relay::{ForwardOutcome, RelayRouter};
use crate::service::Command;

/// Snapshot of broker state.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerStats {
    /// Registered channels.
    pub channels: usize,
    /// Labelled handlers.
    pub listeners: usize,
    /// Whether the default handler has been set up.
    pub setup_done: bool,
    /// Relays waiting for a response.
    pub pending_relays: usize,
    /// Reply wrappers currently bound.
    pub wrappers_in_use: usize,
    /// Reply wrappers ever allocated.
    pub wrapper_capacity: usize,
    /// Reply wrappers ready for reuse.
    pub wrappers_free: usize,
}

/// Channel registry, handlers, reply wrappers and relays of one broker.
pub struct Broker {
    settings: BrokerSettings,
    registry: ChannelRegistry,
    handlers: HandlerTable,
    pool: WrapperPool,
    relays: RelayRouter,
    events: WeakUnboundedSender<Command>,
}

impl Broker {
    /// Create a broker that posts its own follow-up events (completions,
    /// timer expiries) to `events`.
    pub fn new(settings: BrokerSettings, events: WeakUnboundedSender<Command>) -> Self {
        let relays = RelayRouter::new(settings.relay_timeout());
        Self {
            settings,
            registry: ChannelRegistry::new(),
            handlers: HandlerTable::new(),
            pool: WrapperPool::new(),
            relays,
            events,
        }
    }

    /// Settings this broker runs with.
    pub fn settings(&self) -> &BrokerSettings {
        &self.settings
    }

    /// Live channels.
    pub fn registry(&self) -> &ChannelRegistry {
        &self.registry
    }

    /// Apply one command.
    pub fn handle(&mut self, command: Command) {
        match command {
            Command::Setup(handler) => {
                let _ = self.setup(handler);
            }
            Command::Listen { label, handler } => self.listen(label, handler),
            Command::Connect(channel) => {
                let _ = self.on_connect(channel);
            }
            Command::Disconnect(id) => {
                let _ = self.on_disconnect(&id);
            }
            Command::Closed(id) => {
                let _ = self.on_closed(&id);
            }
            Command::Message {
                channel_id,
                envelope,
            } => self.on_message(&channel_id, envelope),
            Command::Text { channel_id, text } => self.on_text(&channel_id, &text),
            Command::Broadcast(payload) => {
                let _ = self.broadcast(payload);
            }
            Command::Stats(reply) => {
                let _ = reply.send(self.stats());
            }
            Command::Complete { slot, payload } => self.on_complete(slot, payload),
            Command::Expire(slot) => self.on_expire(slot),
            Command::Abandon(slot) => self.on_abandon(slot),
        }
    }

    /// Install the default handler. Only the first call has any effect.
    pub fn setup(&mut self, handler: Option<Box<dyn Handler>>) -> bool {
        self.handlers.setup(handler)
    }

    /// Register the handler for `label`; the last registration wins.
    pub fn listen(&mut self, label: String, handler: Box<dyn Handler>) {
        let _ = self.handlers.listen(label, handler);
    }

    /// Register a new channel. A duplicate identity is rejected.
    pub fn on_connect(&mut self, channel: Channel) -> bool {
        self.registry.register(channel)
    }

    /// Unregister a channel.
    ///
    /// Relays it started stay pending unless eager eviction is enabled, in
    /// which case they are retired without a reply.
    pub fn on_disconnect(&mut self, id: &ChannelId) -> bool {
        if self.registry.unregister(id).is_none() {
            return false;
        }
        if self.settings.evict_on_origin_disconnect {
            let evicted = self.relays.evict_origin(id, &mut self.pool);
            if evicted > 0 {
                debug!(channel_id = %id, evicted, "pending relays evicted");
            }
        }
        true
    }

    /// Unregister `id` if its peer dropped its end of the queue.
    ///
    /// A live channel that merely shares the id (a rejected duplicate went
    /// away) is left alone.
    pub fn on_closed(&mut self, id: &ChannelId) -> bool {
        if !self.registry.get(id).is_some_and(Channel::is_closed) {
            return false;
        }
        self.on_disconnect(id)
    }

    /// Parse and dispatch JSON text received on `channel_id`.
    pub fn on_text(&mut self, channel_id: &ChannelId, text: &str) {
        match Envelope::from_json(text) {
            Ok(envelope) => self.on_message(channel_id, envelope),
            Err(e) => {
                warn!(channel_id = %channel_id, error = %e, code = e.code(), "dropping malformed message");
            }
        }
    }

    /// Dispatch an envelope received on `channel_id`.
    #[instrument(skip_all, fields(channel_id = %channel_id))]
    pub fn on_message(&mut self, channel_id: &ChannelId, envelope: Envelope) {
        let Some(channel) = self.registry.get(channel_id) else {
            debug!("message from unknown channel, dropping");
            return;
        };
        let sender = channel.sender().clone();

        match envelope.classify() {
            Inbound::Forward(request) => {
                counter!(MESSAGES_TOTAL, "kind" => KIND_FORWARD).increment(1);
                let outcome = self.relays.forward(
                    request,
                    channel_id,
                    &self.registry,
                    &mut self.pool,
                    &self.events,
                );
                if let ForwardOutcome::Relayed(token) = outcome {
                    debug!(token = token.map(|t| t.get()), "forwarded");
                }
            }
            Inbound::Response(response) => {
                counter!(MESSAGES_TOTAL, "kind" => KIND_RESPONSE).increment(1);
                let _ = self
                    .relays
                    .complete_response(response, &self.registry, &mut self.pool);
            }
            Inbound::Local(request) => {
                counter!(MESSAGES_TOTAL, "kind" => KIND_LOCAL).increment(1);
                self.dispatch_local(channel_id, &sender, request);
            }
        }
    }

    fn dispatch_local(&mut self, channel_id: &ChannelId, sender: &SenderInfo, request: LocalRequest) {
        let LocalRequest { route, payload } = request;
        let label = route.channel_name.clone();

        let reply = if route.expects_reply() {
            let slot = self
                .pool
                .acquire(channel_id.clone(), route, None, &self.events);
            self.pool.completion(slot, &self.events)
        } else {
            Completion::noop()
        };

        match self
            .handlers
            .dispatch(label.as_deref(), &payload, sender, &reply)
        {
            HandlerOutcome::Reply(value) => self.finish_now(&reply, Some(value)),
            HandlerOutcome::Deferred => {}
            HandlerOutcome::Unhandled => {
                counter!(UNHANDLED_TOTAL).increment(1);
                error!(label = label.as_deref().unwrap_or(""), "unhandled request");
                self.finish_now(&reply, None);
            }
        }
    }

    fn finish_now(&mut self, reply: &Completion, payload: Option<Value>) {
        if !reply.claim() {
            return;
        }
        if let Some(slot) = reply.slot() {
            self.finish(slot, payload);
        }
    }

    fn finish(&mut self, slot: SlotRef, payload: Option<Value>) -> bool {
        match self.pool.finish(slot, payload, &self.registry) {
            Finished::Stale => false,
            Finished::Done { relay_token, .. } => {
                if let Some(token) = relay_token {
                    let _ = self.relays.retire(token);
                }
                true
            }
        }
    }

    /// A handler completed its request.
    pub fn on_complete(&mut self, slot: SlotRef, payload: Option<Value>) {
        let _ = self.finish(slot, payload);
    }

    /// A relay timer fired. The origin gets an empty reply unless the
    /// response won the race.
    pub fn on_expire(&mut self, slot: SlotRef) {
        if !self.pool.is_live(slot) {
            return;
        }
        counter!(RELAY_TIMEOUTS_TOTAL).increment(1);
        debug!(slot = slot.index(), "relay timed out");
        let _ = self.finish(slot, None);
    }

    /// Every handle for a request was dropped unanswered.
    pub fn on_abandon(&mut self, slot: SlotRef) {
        if let Some(binding) = self.pool.release(slot) {
            debug!(channel_id = %binding.channel_id, "request dropped without reply");
            if let Some(token) = binding.relay_token {
                let _ = self.relays.retire(token);
            }
        }
    }

    /// Send `payload` to every live channel. Returns successful deliveries.
    pub fn broadcast(&mut self, payload: Value) -> usize {
        broadcast::broadcast(&self.registry, payload)
    }

    /// Current counters.
    pub fn stats(&self) -> BrokerStats {
        BrokerStats {
            channels: self.registry.len(),
            listeners: self.handlers.len(),
            setup_done: self.handlers.is_setup(),
            pending_relays: self.relays.table().len(),
            wrappers_in_use: self.pool.in_use(),
            wrapper_capacity: self.pool.capacity(),
            wrappers_free: self.pool.free(),
        }
    }
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("settings", &self.settings)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::logging::capture_logs;
    use courier_core::{CorrelationToken, OriginToken};
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tracing::Level;

    struct Harness {
        broker: Broker,
        _events: mpsc::UnboundedSender<Command>,
        event_rx: mpsc::UnboundedReceiver<Command>,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_settings(BrokerSettings::default())
        }

        fn with_settings(settings: BrokerSettings) -> Self {
            let (events, event_rx) = mpsc::unbounded_channel();
            Self {
                broker: Broker::new(settings, events.downgrade()),
                _events: events,
                event_rx,
            }
        }

        fn connect(&mut self, id: &str, sender: SenderInfo) -> mpsc::Receiver<Envelope> {
            let (channel, rx) = Channel::open(id.into(), sender, 16);
            assert!(self.broker.on_connect(channel));
            rx
        }

        fn send(&mut self, id: &str, envelope: Envelope) {
            self.broker.on_message(&id.into(), envelope);
        }

        /// Apply queued follow-up events.
        fn pump(&mut self) {
            while let Ok(cmd) = self.event_rx.try_recv() {
                self.broker.handle(cmd);
            }
        }
    }

    fn reply_with(value: Value) -> Box<dyn Handler> {
        Box::new(move |_: &Value, _: &SenderInfo, _: &Completion| {
            HandlerOutcome::Reply(value.clone())
        })
    }

    #[tokio::test]
    async fn local_request_gets_reply() {
        let mut h = Harness::new();
        h.broker.listen("echo".into(), Box::new(|p: &Value, _: &SenderInfo, _: &Completion| {
            HandlerOutcome::Reply(p.clone())
        }));
        let mut rx = h.connect("c", SenderInfo::root("1"));

        h.send("c", Envelope::request("echo", json!({"n": 1})).with_origin_token(5_u64));

        let reply = rx.try_recv().unwrap();
        assert_eq!(reply.origin_token, Some(OriginToken::new(5)));
        assert_eq!(reply.channel_name.as_deref(), Some("echo"));
        assert_eq!(reply.payload, json!({"n": 1}));
        assert_eq!(h.broker.stats().wrappers_in_use, 0);
    }

    #[test]
    fn local_requests_need_no_runtime() {
        let mut h = Harness::new();
        h.broker.listen("echo".into(), reply_with(json!("ok")));
        let mut rx = h.connect("c", SenderInfo::default());

        h.send("c", Envelope::request("echo", json!(null)).with_origin_token(1_u64));
        assert_eq!(rx.try_recv().unwrap().payload, json!("ok"));
    }

    #[tokio::test]
    async fn no_origin_token_means_no_reply() {
        let mut h = Harness::new();
        h.broker.listen("echo".into(), reply_with(json!(1)));
        let mut rx = h.connect("c", SenderInfo::default());

        h.send("c", Envelope::request("echo", json!(null)));
        h.pump();
        assert!(rx.try_recv().is_err());
        assert_eq!(h.broker.stats().wrapper_capacity, 0);
    }

    #[tokio::test]
    async fn ping_falls_through_to_default() {
        let mut h = Harness::new();
        h.broker.listen(
            "ping".into(),
            Box::new(|_: &Value, _: &SenderInfo, _: &Completion| HandlerOutcome::Unhandled),
        );
        assert!(h.broker.setup(Some(reply_with(json!("pong")))));
        let mut rx = h.connect("c", SenderInfo::default());

        h.send("c", Envelope::request("ping", json!(null)).with_origin_token(1_u64));
        assert_eq!(rx.try_recv().unwrap().payload, json!("pong"));
    }

    #[tokio::test]
    async fn unhandled_replies_empty_and_logs() {
        let (logs, _guard) = capture_logs();
        let mut h = Harness::new();
        h.broker.listen(
            "ping".into(),
            Box::new(|_: &Value, _: &SenderInfo, _: &Completion| HandlerOutcome::Unhandled),
        );
        let mut rx = h.connect("c", SenderInfo::default());

        h.send("c", Envelope::request("ping", json!(null)).with_origin_token(1_u64));

        let reply = rx.try_recv().unwrap();
        assert_eq!(reply.payload, json!(null));
        assert!(logs.has_event(Level::ERROR, "unhandled request"));
    }

    #[tokio::test]
    async fn deferred_reply_arrives_after_pump() {
        let mut h = Harness::new();
        let parked: std::sync::Arc<std::sync::Mutex<Option<Completion>>> = Default::default();
        let slot = std::sync::Arc::clone(&parked);
        h.broker.listen(
            "later".into(),
            Box::new(move |_: &Value, _: &SenderInfo, reply: &Completion| {
                *slot.lock().unwrap() = Some(reply.clone());
                HandlerOutcome::Deferred
            }),
        );
        let mut rx = h.connect("c", SenderInfo::default());

        h.send("c", Envelope::request("later", json!(null)).with_origin_token(3_u64));
        assert!(rx.try_recv().is_err());
        assert_eq!(h.broker.stats().wrappers_in_use, 1);

        let handle = parked.lock().unwrap().take().unwrap();
        assert!(handle.complete(Some(json!("done"))));
        assert!(!handle.complete(Some(json!("again"))));
        drop(handle);
        h.pump();

        assert_eq!(rx.try_recv().unwrap().payload, json!("done"));
        assert!(rx.try_recv().is_err());
        assert_eq!(h.broker.stats().wrappers_in_use, 0);
    }

    #[tokio::test]
    async fn reply_after_handler_completed_is_not_duplicated() {
        let mut h = Harness::new();
        h.broker.listen(
            "both".into(),
            Box::new(|_: &Value, _: &SenderInfo, reply: &Completion| {
                let _ = reply.complete(Some(json!("via handle")));
                HandlerOutcome::Reply(json!("via outcome"))
            }),
        );
        let mut rx = h.connect("c", SenderInfo::default());

        h.send("c", Envelope::request("both", json!(null)).with_origin_token(1_u64));
        h.pump();

        assert_eq!(rx.try_recv().unwrap().payload, json!("via handle"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn dropped_deferred_handle_recycles_wrapper() {
        let mut h = Harness::new();
        h.broker.listen(
            "forget".into(),
            Box::new(|_: &Value, _: &SenderInfo, _: &Completion| HandlerOutcome::Deferred),
        );
        let mut rx = h.connect("c", SenderInfo::default());

        h.send("c", Envelope::request("forget", json!(null)).with_origin_token(1_u64));
        h.pump();

        assert!(rx.try_recv().is_err());
        assert_eq!(h.broker.stats().wrappers_in_use, 0);
        assert_eq!(h.broker.stats().wrappers_free, 1);
    }

    #[tokio::test]
    async fn message_from_unknown_channel_is_dropped() {
        let mut h = Harness::new();
        h.broker.listen("echo".into(), reply_with(json!(1)));
        h.send("ghost", Envelope::request("echo", json!(null)).with_origin_token(1_u64));
        assert_eq!(h.broker.stats().wrapper_capacity, 0);
    }

    #[tokio::test]
    async fn malformed_text_is_logged_and_dropped() {
        let (logs, _guard) = capture_logs();
        let mut h = Harness::new();
        let _rx = h.connect("c", SenderInfo::default());

        h.broker.on_text(&"c".into(), "{not json");
        assert!(logs.has_event(Level::WARN, "dropping malformed message"));
        assert_eq!(h.broker.stats().channels, 1);
    }

    #[tokio::test]
    async fn text_is_parsed_and_dispatched() {
        let mut h = Harness::new();
        h.broker.listen("echo".into(), reply_with(json!("ok")));
        let mut rx = h.connect("c", SenderInfo::default());

        h.broker
            .on_text(&"c".into(), r#"{"channelName":"echo","msg":1,"auxProcessId":9}"#);
        let reply = rx.try_recv().unwrap();
        assert_eq!(reply.origin_token, Some(OriginToken::new(9)));
        assert_eq!(reply.payload, json!("ok"));
    }

    #[tokio::test]
    async fn duplicate_connect_rejected() {
        let mut h = Harness::new();
        let _rx = h.connect("c", SenderInfo::default());
        let (dup, mut dup_rx) = Channel::open("c".into(), SenderInfo::root("2"), 4);
        assert!(!h.broker.on_connect(dup));
        assert!(dup_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn reply_to_disconnected_origin_is_silent() {
        let mut h = Harness::new();
        let parked: std::sync::Arc<std::sync::Mutex<Option<Completion>>> = Default::default();
        let slot = std::sync::Arc::clone(&parked);
        h.broker.listen(
            "later".into(),
            Box::new(move |_: &Value, _: &SenderInfo, reply: &Completion| {
                *slot.lock().unwrap() = Some(reply.clone());
                HandlerOutcome::Deferred
            }),
        );
        let _rx = h.connect("c", SenderInfo::default());
        h.send("c", Envelope::request("later", json!(null)).with_origin_token(1_u64));
        assert!(h.broker.on_disconnect(&"c".into()));

        let handle = parked.lock().unwrap().take().unwrap();
        assert!(handle.complete(Some(json!(1))));
        h.pump();
        assert_eq!(h.broker.stats().wrappers_in_use, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn relay_timeout_completes_empty_and_late_response_is_ignored() {
        let mut h = Harness::new();
        let mut root = h.connect("A", SenderInfo::root("5"));
        let mut origin = h.connect("B", SenderInfo::frame("5", 2));

        h.send(
            "B",
            Envelope::forward_request("5", "x", json!({"q": 1})).with_origin_token(1_u64),
        );
        let token = root.try_recv().unwrap().correlation_token.unwrap();

        let cmd = h.event_rx.recv().await.unwrap();
        h.broker.handle(cmd);
        let reply = origin.try_recv().unwrap();
        assert_eq!(reply.payload, json!(null));
        assert_eq!(h.broker.stats().pending_relays, 0);

        h.send("A", Envelope::relay_response(token, json!({"a": 2})));
        assert!(origin.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn response_cancels_timer() {
        let mut h = Harness::new();
        let mut root = h.connect("A", SenderInfo::root("5"));
        let mut origin = h.connect("B", SenderInfo::default());

        h.send(
            "B",
            Envelope::forward_request("5", "x", json!(1)).with_origin_token(1_u64),
        );
        let token = root.try_recv().unwrap().correlation_token.unwrap();
        h.send("A", Envelope::relay_response(token, json!("answer")));
        assert_eq!(origin.try_recv().unwrap().payload, json!("answer"));

        tokio::time::sleep(Duration::from_secs(5)).await;
        h.pump();
        assert!(origin.try_recv().is_err());
    }

    #[tokio::test]
    async fn response_with_unknown_token_is_ignored() {
        let mut h = Harness::new();
        let mut a = h.connect("A", SenderInfo::root("5"));
        h.send("A", Envelope::relay_response(CorrelationToken::new(999), json!(1)));
        assert!(a.try_recv().is_err());
    }

    #[tokio::test]
    async fn lazy_cleanup_keeps_pending_relays_until_answered() {
        let mut h = Harness::new();
        let mut root = h.connect("A", SenderInfo::root("5"));
        let mut origin = h.connect("B", SenderInfo::default());
        h.send(
            "B",
            Envelope::forward_request("5", "x", json!(1)).with_origin_token(1_u64),
        );
        let token = root.try_recv().unwrap().correlation_token.unwrap();
        assert!(h.broker.on_disconnect(&"B".into()));
        assert_eq!(h.broker.stats().pending_relays, 1);

        h.send("A", Envelope::relay_response(token, json!("answer")));
        h.pump();
        assert!(origin.try_recv().is_err());
        let stats = h.broker.stats();
        assert_eq!(stats.pending_relays, 0);
        assert_eq!(stats.wrappers_in_use, 0);

        h.send("A", Envelope::relay_response(token, json!("again")));
        h.pump();
        assert!(origin.try_recv().is_err());
        assert!(root.try_recv().is_err());
        assert_eq!(h.broker.stats().wrappers_free, 1);
    }

    #[tokio::test]
    async fn eager_cleanup_evicts_pending_relays() {
        let mut h = Harness::with_settings(BrokerSettings {
            evict_on_origin_disconnect: true,
            ..BrokerSettings::default()
        });
        let _root = h.connect("A", SenderInfo::root("5"));
        let _origin = h.connect("B", SenderInfo::default());
        h.send(
            "B",
            Envelope::forward_request("5", "x", json!(1)).with_origin_token(1_u64),
        );
        assert!(h.broker.on_disconnect(&"B".into()));
        let stats = h.broker.stats();
        assert_eq!(stats.pending_relays, 0);
        assert_eq!(stats.wrappers_in_use, 0);
    }

    #[tokio::test]
    async fn broadcast_counts_deliveries() {
        let mut h = Harness::new();
        let mut a = h.connect("a", SenderInfo::default());
        let mut b = h.connect("b", SenderInfo::default());
        assert_eq!(h.broker.broadcast(json!("hi")), 2);
        assert!(a.try_recv().unwrap().broadcast);
        assert!(b.try_recv().unwrap().broadcast);
    }

    #[tokio::test]
    async fn stats_via_command() {
        let mut h = Harness::new();
        let _rx = h.connect("a", SenderInfo::default());
        let (tx, rx) = tokio::sync::oneshot::channel();
        h.broker.handle(Command::Stats(tx));
        let stats = rx.await.unwrap();
        assert_eq!(stats.channels, 1);
        assert!(!stats.setup_done);
    }
}
