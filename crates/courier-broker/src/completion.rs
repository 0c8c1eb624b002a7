//! Pooled reply wrappers and the one-shot completion handle.
//!
//! A request that wants a reply gets a slot in the [`WrapperPool`]. The slot
//! remembers where the reply goes (origin channel and [`ReplyRoute`]), the
//! relay timer if one is armed, and the correlation token if the request is
//! being relayed. Slots are recycled; each reuse bumps the slot's
//! generation so events aimed at an earlier binding are recognized as stale.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use courier_core::{ChannelId, CorrelationToken, ReplyRoute};
use serde_json::Value;
use tokio::sync::mpsc::WeakUnboundedSender;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::registry::ChannelRegistry;
use crate::service::Command;

/// Address of one binding of a pool slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SlotRef {
    index: usize,
    generation: u64,
}

impl SlotRef {
    /// Position in the pool.
    pub fn index(self) -> usize {
        self.index
    }

    /// Binding generation.
    pub fn generation(self) -> u64 {
        self.generation
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Completion handle
// ─────────────────────────────────────────────────────────────────────────────

/// One-shot handle a handler uses to answer a request.
///
/// Clones share a single guard: the first [`complete`](Self::complete) on any
/// clone wins, every later call returns `false`. If the last clone is dropped
/// without completing, the wrapper is recycled and no reply is sent.
#[derive(Clone)]
pub struct Completion {
    inner: Arc<CompletionInner>,
}

struct CompletionInner {
    done: Arc<AtomicBool>,
    target: Option<(SlotRef, WeakUnboundedSender<Command>)>,
}

impl Completion {
    /// Handle for a request nobody waits on. Completing it does nothing.
    pub fn noop() -> Self {
        Self {
            inner: Arc::new(CompletionInner {
                done: Arc::new(AtomicBool::new(false)),
                target: None,
            }),
        }
    }

    fn bound(slot: SlotRef, done: Arc<AtomicBool>, events: WeakUnboundedSender<Command>) -> Self {
        Self {
            inner: Arc::new(CompletionInner {
                done,
                target: Some((slot, events)),
            }),
        }
    }

    /// Send the reply (`null` payload when `None`).
    ///
    /// Returns `false` if this request was already completed, timed out, or
    /// the broker has stopped accepting events.
    pub fn complete(&self, payload: Option<Value>) -> bool {
        if !self.claim() {
            return false;
        }
        let Some((slot, events)) = &self.inner.target else {
            return true;
        };
        match events.upgrade() {
            Some(tx) => {
                if tx.send(Command::Complete { slot: *slot, payload }).is_err() {
                    debug!("broker stopped, completion dropped");
                    return false;
                }
                true
            }
            None => {
                debug!("broker stopped, completion dropped");
                false
            }
        }
    }

    /// Whether the request has been answered (or can no longer be).
    pub fn is_completed(&self) -> bool {
        self.inner.done.load(Ordering::Acquire)
    }

    /// Whether a reply would actually go anywhere.
    pub fn expects_reply(&self) -> bool {
        self.inner.target.is_some()
    }

    /// Take the one-shot right to complete without posting an event.
    pub(crate) fn claim(&self) -> bool {
        !self.inner.done.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn slot(&self) -> Option<SlotRef> {
        self.inner.target.as_ref().map(|(slot, _)| *slot)
    }
}

impl Drop for CompletionInner {
    fn drop(&mut self) {
        if self.done.load(Ordering::Acquire) {
            return;
        }
        if let Some((slot, events)) = &self.target {
            if let Some(tx) = events.upgrade() {
                let _ = tx.send(Command::Abandon(*slot));
            }
        }
    }
}

impl std::fmt::Debug for Completion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completion")
            .field("slot", &self.slot())
            .field("completed", &self.is_completed())
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Pool
// ─────────────────────────────────────────────────────────────────────────────

/// Reply addressing held by a bound slot.
#[derive(Debug)]
pub struct Binding {
    /// Channel the reply goes to.
    pub channel_id: ChannelId,
    /// Token and label to echo.
    pub route: ReplyRoute,
    /// Correlation token while the request is being relayed.
    pub relay_token: Option<CorrelationToken>,
    done: Arc<AtomicBool>,
    timer: Option<JoinHandle<()>>,
}

#[derive(Debug, Default)]
struct Slot {
    generation: u64,
    binding: Option<Binding>,
}

/// What [`WrapperPool::finish`] did with a slot.
#[derive(Debug, PartialEq, Eq)]
pub enum Finished {
    /// The slot had moved on; nothing was sent.
    Stale,
    /// The binding was retired. `delivered` tells whether the origin got the reply.
    Done {
        /// Relay token the binding carried, for the caller to retire.
        relay_token: Option<CorrelationToken>,
        /// Whether the reply reached the origin channel.
        delivered: bool,
    },
}

/// Slab of reusable reply wrappers.
#[derive(Debug, Default)]
pub struct WrapperPool {
    slots: Vec<Slot>,
    free: Vec<usize>,
    in_use: usize,
}

impl WrapperPool {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a slot to `channel_id`/`route`, reusing a free one if possible.
    ///
    /// With a `timeout`, a timer task is armed that posts
    /// [`Command::Expire`] for this binding once it elapses.
    ///
    /// # Panics
    ///
    /// Arming a timer spawns a task, so a call with a `timeout` must be made
    /// from within a tokio runtime.
    pub fn acquire(
        &mut self,
        channel_id: ChannelId,
        route: ReplyRoute,
        timeout: Option<Duration>,
        events: &WeakUnboundedSender<Command>,
    ) -> SlotRef {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot::default());
                self.slots.len() - 1
            }
        };
        let slot = &mut self.slots[index];
        let slot_ref = SlotRef {
            index,
            generation: slot.generation,
        };

        let timer = timeout.map(|after| {
            let events = events.clone();
            tokio::spawn(async move {
                tokio::time::sleep(after).await;
                if let Some(tx) = events.upgrade() {
                    let _ = tx.send(Command::Expire(slot_ref));
                }
            })
        });

        slot.binding = Some(Binding {
            channel_id,
            route,
            relay_token: None,
            done: Arc::new(AtomicBool::new(false)),
            timer,
        });
        self.in_use += 1;
        slot_ref
    }

    /// Completion handle for a bound slot, or a no-op handle if it is stale.
    pub fn completion(&self, slot: SlotRef, events: &WeakUnboundedSender<Command>) -> Completion {
        match self.binding(slot) {
            Some(binding) => Completion::bound(slot, Arc::clone(&binding.done), events.clone()),
            None => Completion::noop(),
        }
    }

    /// Record the correlation token a relayed binding waits on.
    pub fn bind_relay(&mut self, slot: SlotRef, token: CorrelationToken) -> bool {
        match self.binding_mut(slot) {
            Some(binding) => {
                binding.relay_token = Some(token);
                true
            }
            None => false,
        }
    }

    /// Whether `slot` still names a live binding.
    pub fn is_live(&self, slot: SlotRef) -> bool {
        self.binding(slot).is_some()
    }

    /// Borrow a live binding.
    pub fn binding(&self, slot: SlotRef) -> Option<&Binding> {
        self.slots
            .get(slot.index)
            .filter(|s| s.generation == slot.generation)
            .and_then(|s| s.binding.as_ref())
    }

    fn binding_mut(&mut self, slot: SlotRef) -> Option<&mut Binding> {
        self.slots
            .get_mut(slot.index)
            .filter(|s| s.generation == slot.generation)
            .and_then(|s| s.binding.as_mut())
    }

    /// Retire a binding without replying.
    ///
    /// Cancels the timer, marks every outstanding handle completed, bumps
    /// the generation and returns the slot to the free list. Stale
    /// references return `None`.
    pub fn release(&mut self, slot: SlotRef) -> Option<Binding> {
        let entry = self
            .slots
            .get_mut(slot.index)
            .filter(|s| s.generation == slot.generation)?;
        let mut binding = entry.binding.take()?;
        entry.generation = entry.generation.wrapping_add(1);
        binding.done.store(true, Ordering::Release);
        if let Some(timer) = binding.timer.take() {
            timer.abort();
        }
        self.free.push(slot.index);
        self.in_use -= 1;
        Some(binding)
    }

    /// Retire a binding and deliver `{auxProcessId, channelName, msg}` to its
    /// origin if the origin is still registered.
    pub fn finish(
        &mut self,
        slot: SlotRef,
        payload: Option<Value>,
        registry: &ChannelRegistry,
    ) -> Finished {
        let Some(binding) = self.release(slot) else {
            debug!(slot = slot.index, generation = slot.generation, "stale completion ignored");
            return Finished::Stale;
        };

        let delivered = match registry.get(&binding.channel_id) {
            Some(channel) => {
                let sent = channel.send(binding.route.reply(payload));
                if !sent {
                    warn!(channel_id = %binding.channel_id, "failed to deliver reply");
                }
                sent
            }
            None => {
                debug!(channel_id = %binding.channel_id, "origin gone, reply dropped");
                false
            }
        };

        Finished::Done {
            relay_token: binding.relay_token,
            delivered,
        }
    }

    /// Bound slots.
    pub fn in_use(&self) -> usize {
        self.in_use
    }

    /// Slots ever allocated.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Slots ready for reuse.
    pub fn free(&self) -> usize {
        self.free.len()
    }
}

impl Drop for WrapperPool {
    fn drop(&mut self) {
        for slot in &mut self.slots {
            if let Some(timer) = slot.binding.as_mut().and_then(|b| b.timer.take()) {
                timer.abort();
            }
        }
    }
}
