//! Handler table and local request dispatch.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};

use courier_core::SenderInfo;
use serde_json::Value;
use tracing::{debug, error};

use crate::completion::Completion;

/// What a handler did with a request.
#[derive(Clone, Debug, PartialEq)]
pub enum HandlerOutcome {
    /// Claimed; reply now with this payload.
    Reply(Value),
    /// Claimed; the handler answers through the [`Completion`] (now or later).
    Deferred,
    /// Not handled here; fall through to the next handler.
    Unhandled,
}

/// Implemented by every request handler.
///
/// Handlers run on the broker task and must not block. Long work should
/// clone the [`Completion`], return [`HandlerOutcome::Deferred`] and finish
/// on another task. A handler that panics is treated as having returned
/// [`HandlerOutcome::Unhandled`].
pub trait Handler: Send + Sync {
    /// Handle one request.
    fn handle(&self, payload: &Value, sender: &SenderInfo, reply: &Completion) -> HandlerOutcome;
}

impl<F> Handler for F
where
    F: Fn(&Value, &SenderInfo, &Completion) -> HandlerOutcome + Send + Sync,
{
    fn handle(&self, payload: &Value, sender: &SenderInfo, reply: &Completion) -> HandlerOutcome {
        self(payload, sender, reply)
    }
}

/// Labelled handlers plus the default handler.
#[derive(Default)]
pub struct HandlerTable {
    listeners: HashMap<String, Box<dyn Handler>>,
    default: Option<Box<dyn Handler>>,
    setup_done: bool,
}

impl HandlerTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `label`. Returns `true` if it replaced one.
    pub fn listen(&mut self, label: impl Into<String>, handler: Box<dyn Handler>) -> bool {
        let label = label.into();
        let replaced = self.listeners.insert(label.clone(), handler).is_some();
        debug!(label, replaced, "listener registered");
        replaced
    }

    /// Install the default handler. Only the first call has any effect.
    ///
    /// `None` still counts as setup; the default then answers
    /// [`HandlerOutcome::Unhandled`].
    pub fn setup(&mut self, handler: Option<Box<dyn Handler>>) -> bool {
        if self.setup_done {
            debug!("setup already done, ignoring");
            return false;
        }
        self.setup_done = true;
        self.default = handler;
        true
    }

    /// Whether `setup` has run.
    pub fn is_setup(&self) -> bool {
        self.setup_done
    }

    /// Registered labels (sorted).
    pub fn labels(&self) -> Vec<String> {
        let mut labels: Vec<String> = self.listeners.keys().cloned().collect();
        labels.sort();
        labels
    }

    /// Number of labelled handlers.
    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    /// Whether no labelled handler is registered.
    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    /// Run the handler for `label`, then the default handler if it declined.
    ///
    /// A request without a label goes straight to the default handler.
    pub fn dispatch(
        &self,
        label: Option<&str>,
        payload: &Value,
        sender: &SenderInfo,
        reply: &Completion,
    ) -> HandlerOutcome {
        let specific = match label.and_then(|l| self.listeners.get(l).map(|h| (l, h))) {
            Some((l, h)) => invoke(l, h.as_ref(), payload, sender, reply),
            None => HandlerOutcome::Unhandled,
        };
        if specific != HandlerOutcome::Unhandled {
            return specific;
        }
        self.default.as_ref().map_or(HandlerOutcome::Unhandled, |h| {
            invoke("<default>", h.as_ref(), payload, sender, reply)
        })
    }
}

fn invoke(
    label: &str,
    handler: &dyn Handler,
    payload: &Value,
    sender: &SenderInfo,
    reply: &Completion,
) -> HandlerOutcome {
    panic::catch_unwind(AssertUnwindSafe(|| handler.handle(payload, sender, reply))).unwrap_or_else(
        |cause| {
            let message = cause
                .downcast_ref::<&str>()
                .map(ToString::to_string)
                .or_else(|| cause.downcast_ref::<String>().cloned())
                .unwrap_or_default();
            error!(label, panic = %message, "handler panicked");
            HandlerOutcome::Unhandled
        },
    )
}

impl std::fmt::Debug for HandlerTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerTable")
            .field("labels", &self.labels())
            .field("has_default", &self.default.is_some())
            .field("setup_done", &self.setup_done)
            .finish()
    }
}
