//! The broker event loop and the handle used to talk to it.
//!
//! One task owns the [`Broker`] and applies [`Command`]s in arrival order,
//! so no broker table is ever touched concurrently. Everything else (hosts,
//! handlers that defer, relay timers) only posts commands.

use courier_core::{ChannelId, Envelope, SenderInfo};
use courier_settings::BrokerSettings;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::broker::{Broker, BrokerStats};
use crate::channel::Channel;
use crate::completion::SlotRef;
use crate::handlers::Handler;

/// Work item for the broker loop.
pub enum Command {
    /// Install the default handler (first call wins).
    Setup(Option<Box<dyn Handler>>),
    /// Register a labelled handler.
    Listen {
        /// Dispatch label.
        label: String,
        /// Handler to run.
        handler: Box<dyn Handler>,
    },
    /// A channel connected.
    Connect(Channel),
    /// A channel went away.
    Disconnect(ChannelId),
    /// A peer dropped its end of a channel. Ignored unless the registered
    /// channel with that id is actually closed.
    Closed(ChannelId),
    /// An envelope arrived on a channel.
    Message {
        /// Channel it arrived on.
        channel_id: ChannelId,
        /// The envelope.
        envelope: Envelope,
    },
    /// Raw JSON text arrived on a channel.
    Text {
        /// Channel it arrived on.
        channel_id: ChannelId,
        /// Unparsed text.
        text: String,
    },
    /// Send a payload to every channel.
    Broadcast(Value),
    /// Report counters.
    Stats(oneshot::Sender<BrokerStats>),
    /// A handler answered a request.
    Complete {
        /// Wrapper binding being completed.
        slot: SlotRef,
        /// Reply payload.
        payload: Option<Value>,
    },
    /// A relay timer fired.
    Expire(SlotRef),
    /// Every handle for a request was dropped unanswered.
    Abandon(SlotRef),
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Self::Setup(_) => "setup",
            Self::Listen { .. } => "listen",
            Self::Connect(_) => "connect",
            Self::Disconnect(_) => "disconnect",
            Self::Closed(_) => "closed",
            Self::Message { .. } => "message",
            Self::Text { .. } => "text",
            Self::Broadcast(_) => "broadcast",
            Self::Stats(_) => "stats",
            Self::Complete { .. } => "complete",
            Self::Expire(_) => "expire",
            Self::Abandon(_) => "abandon",
        }
    }
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Listen { label, .. } => f.debug_struct("Listen").field("label", label).finish(),
            Self::Connect(channel) => f.debug_tuple("Connect").field(channel).finish(),
            Self::Disconnect(id) => f.debug_tuple("Disconnect").field(id).finish(),
            Self::Closed(id) => f.debug_tuple("Closed").field(id).finish(),
            Self::Message {
                channel_id,
                envelope,
            } => f
                .debug_struct("Message")
                .field("channel_id", channel_id)
                .field("envelope", envelope)
                .finish(),
            Self::Text { channel_id, text } => f
                .debug_struct("Text")
                .field("channel_id", channel_id)
                .field("text", text)
                .finish(),
            Self::Broadcast(payload) => f.debug_tuple("Broadcast").field(payload).finish(),
            Self::Complete { slot, payload } => f
                .debug_struct("Complete")
                .field("slot", slot)
                .field("payload", payload)
                .finish(),
            Self::Expire(slot) => f.debug_tuple("Expire").field(slot).finish(),
            Self::Abandon(slot) => f.debug_tuple("Abandon").field(slot).finish(),
            Self::Setup(_) | Self::Stats(_) => f.write_str(self.name()),
        }
    }
}

/// Spawns broker loops.
pub struct BrokerService;

impl BrokerService {
    /// Start a broker on the current tokio runtime.
    ///
    /// The loop runs until [`BrokerHandle::shutdown`] is called or every
    /// handle has been dropped.
    pub fn spawn(settings: BrokerSettings) -> (BrokerHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let handle = BrokerHandle {
            tx: tx.clone(),
            shutdown: shutdown.clone(),
            channel_capacity: settings.channel_capacity,
        };
        let broker = Broker::new(settings, tx.downgrade());
        drop(tx);

        let task = tokio::spawn(run(broker, rx, shutdown));
        (handle, task)
    }
}

async fn run(mut broker: Broker, mut rx: mpsc::UnboundedReceiver<Command>, shutdown: CancellationToken) {
    info!(
        relay_timeout_ms = broker.settings().relay_timeout_ms,
        channel_capacity = broker.settings().channel_capacity,
        "broker started"
    );
    loop {
        tokio::select! {
            biased;
            () = shutdown.cancelled() => {
                info!("broker shutting down");
                break;
            }
            command = rx.recv() => match command {
                Some(command) => broker.handle(command),
                None => {
                    info!("all broker handles dropped, stopping");
                    break;
                }
            },
        }
    }
}

/// Cloneable handle to a running broker.
#[derive(Clone, Debug)]
pub struct BrokerHandle {
    tx: mpsc::UnboundedSender<Command>,
    shutdown: CancellationToken,
    channel_capacity: usize,
}

impl BrokerHandle {
    fn post(&self, command: Command) -> bool {
        let name = command.name();
        if self.tx.send(command).is_err() {
            debug!(command = name, "broker stopped, command dropped");
            return false;
        }
        true
    }

    /// Install the default handler. Only the first call has any effect.
    pub fn setup(&self, handler: Option<Box<dyn Handler>>) -> bool {
        self.post(Command::Setup(handler))
    }

    /// Register `handler` for `label`; the last registration wins.
    pub fn listen(&self, label: impl Into<String>, handler: impl Handler + 'static) -> bool {
        self.post(Command::Listen {
            label: label.into(),
            handler: Box::new(handler),
        })
    }

    /// Open a channel for a peer and return the peer's end.
    pub fn connect(&self, id: impl Into<ChannelId>, sender: SenderInfo) -> PeerEndpoint {
        let (channel, rx) = Channel::open(id.into(), sender, self.channel_capacity);
        let id = channel.id().clone();
        let _ = self.attach(channel);
        PeerEndpoint {
            id,
            rx,
            broker: self.clone(),
            detached: false,
        }
    }

    /// [`connect`](Self::connect) with a freshly generated channel id.
    pub fn connect_new(&self, sender: SenderInfo) -> PeerEndpoint {
        self.connect(ChannelId::generate(), sender)
    }

    /// Register a channel whose queue the host built itself.
    pub fn attach(&self, channel: Channel) -> bool {
        self.post(Command::Connect(channel))
    }

    /// Unregister a channel.
    pub fn disconnect(&self, id: impl Into<ChannelId>) -> bool {
        self.post(Command::Disconnect(id.into()))
    }

    /// Deliver an envelope as if it arrived on channel `id`.
    pub fn post_message(&self, id: impl Into<ChannelId>, envelope: Envelope) -> bool {
        self.post(Command::Message {
            channel_id: id.into(),
            envelope,
        })
    }

    /// Deliver raw JSON text as if it arrived on channel `id`.
    pub fn post_text(&self, id: impl Into<ChannelId>, text: impl Into<String>) -> bool {
        self.post(Command::Text {
            channel_id: id.into(),
            text: text.into(),
        })
    }

    /// Send `payload` to every channel live when the loop gets to it.
    pub fn broadcast(&self, payload: Value) -> bool {
        self.post(Command::Broadcast(payload))
    }

    /// Current counters, or `None` once the broker has stopped.
    pub async fn stats(&self) -> Option<BrokerStats> {
        let (tx, rx) = oneshot::channel();
        if !self.post(Command::Stats(tx)) {
            return None;
        }
        rx.await.ok()
    }

    /// Stop the loop. Later commands are dropped.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Whether shutdown has been requested.
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

/// The peer's side of a channel.
///
/// Dropping the endpoint closes the channel and unregisters it.
#[derive(Debug)]
pub struct PeerEndpoint {
    id: ChannelId,
    rx: mpsc::Receiver<Envelope>,
    broker: BrokerHandle,
    detached: bool,
}

impl PeerEndpoint {
    /// Channel identity.
    pub fn id(&self) -> &ChannelId {
        &self.id
    }

    /// Next envelope from the broker, or `None` once the channel is gone.
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.rx.recv().await
    }

    /// Next envelope if one is already queued.
    pub fn try_recv(&mut self) -> Option<Envelope> {
        self.rx.try_recv().ok()
    }

    /// Send an envelope to the broker on this channel.
    pub fn send(&self, envelope: Envelope) -> bool {
        self.broker.post_message(self.id.clone(), envelope)
    }

    /// Send raw JSON text to the broker on this channel.
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.broker.post_text(self.id.clone(), text)
    }

    /// Unregister this channel.
    pub fn disconnect(mut self) -> bool {
        self.detached = true;
        self.broker.disconnect(self.id.clone())
    }
}

impl Drop for PeerEndpoint {
    fn drop(&mut self) {
        if self.detached {
            return;
        }
        self.rx.close();
        let _ = self.broker.post(Command::Closed(self.id.clone()));
    }
}
