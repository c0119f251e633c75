//! Request/reply correlation

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use envoy_wire::{Message, MessageId, Topic};
use tokio::sync::oneshot;
use tokio::time::{Instant, timeout_at};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{MessengerError, MessengerResult};
use crate::event::{Event, ReplySender};

/// A caller waiting on one message id
#[derive(Debug)]
pub(crate) struct PendingReply {
    topic: Topic,
    tx: ReplySender,
}

impl PendingReply {
    /// Reply received, or publish written
    pub(crate) fn complete(self, body: Option<Bytes>) {
        let _ = self.tx.send(Ok(body));
    }

    /// The remote handler panicked
    pub(crate) fn panicked(self) {
        let _ = self.tx.send(Err(MessengerError::HandlerFault { topic: self.topic }));
    }

    /// The link carrying the message failed
    pub(crate) fn fail(self, reason: &str) {
        let _ = self.tx.send(Err(MessengerError::Delivery(reason.to_string())));
    }

    /// The message can never be delivered
    pub(crate) fn reject(self, error: MessengerError) {
        let _ = self.tx.send(Err(error));
    }
}

/// Reply waiters for the messages routed over one peer link
#[derive(Debug, Default)]
pub(crate) struct PendingReplies {
    waiters: HashMap<MessageId, PendingReply>,
}

impl PendingReplies {
    /// Register a waiter. Fails the waiter if `id` already has one.
    pub(crate) fn insert(&mut self, id: MessageId, topic: Topic, tx: ReplySender) -> bool {
        if self.waiters.contains_key(&id) {
            let _ = tx.send(Err(MessengerError::DuplicateMessageId(id)));
            return false;
        }
        self.waiters.insert(id, PendingReply { topic, tx });
        true
    }

    /// Remove the waiter for `id`, so it is resolved at most once
    pub(crate) fn take(&mut self, id: &MessageId) -> Option<PendingReply> {
        self.waiters.remove(id)
    }

    /// Fail every waiter with a delivery error; returns the failed ids.
    pub(crate) fn fail_all(&mut self, reason: &str) -> Vec<MessageId> {
        self.waiters
            .drain()
            .map(|(id, waiter)| {
                waiter.fail(reason);
                id
            })
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.waiters.len()
    }
}

/// Submit `message` to the router until it resolves or `timeout` passes.
///
/// Delivery failures re-submit under the same id; every other outcome is
/// final. The deadline covers all attempts. Once `closed` fires the call
/// fails with [`MessengerError::Closed`].
pub(crate) async fn round_trip(
    mailbox: &flume::Sender<Event>,
    closed: &CancellationToken,
    message: Message,
    timeout: Duration,
) -> MessengerResult<Option<Bytes>> {
    let deadline = Instant::now() + timeout;
    let message_id = message.id();

    loop {
        let (tx, rx) = oneshot::channel();
        mailbox
            .send(Event::SendMessage {
                message: message.clone(),
                reply: tx,
            })
            .map_err(|_| MessengerError::Closed)?;

        let outcome = tokio::select! {
            _ = closed.cancelled() => return Err(MessengerError::Closed),
            outcome = timeout_at(deadline, rx) => outcome,
        };

        match outcome {
            Ok(Ok(Err(e))) if e.is_transient() => {
                debug!("Re-submitting {} after: {}", message_id, e);
            }
            Ok(Ok(result)) => return result,
            Ok(Err(_)) => return Err(MessengerError::Closed),
            Err(_) => {
                let _ = mailbox.send(Event::Expire { message_id });
                return Err(MessengerError::Timeout(timeout));
            }
        }
    }
}
