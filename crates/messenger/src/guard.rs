//! Handler invocation with panic isolation

use std::any::Any;
use std::backtrace::Backtrace;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use bytes::Bytes;
use envoy_wire::{Message, MessageType, Topic};
use tracing::{debug, error, warn};

/// Application callback for one subscribed topic.
///
/// Called with the topic and the message body. The returned bytes become the
/// reply body for requests and are discarded for publishes. Handlers run on
/// the blocking thread pool, so they may block.
pub trait Handler: Send + Sync + 'static {
    /// Process one message
    fn handle(&self, topic: &Topic, body: Bytes) -> Bytes;
}

impl<F> Handler for F
where
    F: Fn(&Topic, Bytes) -> Bytes + Send + Sync + 'static,
{
    fn handle(&self, topic: &Topic, body: Bytes) -> Bytes {
        self(topic, body)
    }
}

/// How a handler invocation ended
#[derive(Debug)]
pub(crate) enum HandlerOutcome {
    Completed(Bytes),
    Panicked,
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else {
        "unknown panic".to_string()
    }
}

/// Run `handler` and turn a panic into [`HandlerOutcome::Panicked`].
pub(crate) async fn invoke(handler: Arc<dyn Handler>, topic: Topic, body: Bytes) -> HandlerOutcome {
    let task_topic = topic.clone();
    let result = tokio::task::spawn_blocking(move || {
        panic::catch_unwind(AssertUnwindSafe(|| handler.handle(&task_topic, body)))
    })
    .await;

    match result {
        Ok(Ok(reply)) => HandlerOutcome::Completed(reply),
        Ok(Err(payload)) => {
            error!(
                "Handler for topic '{}' panicked: {}\n{}",
                topic,
                panic_message(payload.as_ref()),
                Backtrace::force_capture()
            );
            HandlerOutcome::Panicked
        }
        Err(e) => {
            error!("Handler task for topic '{}' failed: {}", topic, e);
            HandlerOutcome::Panicked
        }
    }
}

/// Deliver an inbound publish or request to its handler in a detached task.
///
/// A request's reply, or a reply-panic on failure, is queued on `writer`,
/// the originating peer's outbound queue.
pub(crate) fn dispatch(
    handler: Arc<dyn Handler>,
    message: Message,
    writer: flume::Sender<Message>,
) {
    tokio::spawn(async move {
        let message_id = message.id();
        let message_type = message.message_type();
        let Some(topic) = message.topic().cloned() else {
            warn!("Dropping {} without topic", message);
            return;
        };
        let body = message.into_body().unwrap_or_default();

        let outcome = invoke(handler, topic, body).await;
        if message_type != MessageType::Request {
            return;
        }

        let reply = match outcome {
            HandlerOutcome::Completed(body) => Message::reply(message_id, body),
            HandlerOutcome::Panicked => Message::reply_panic(message_id),
        };
        if writer.send(reply).is_err() {
            debug!("Link closed before reply to {} could be sent", message_id);
        }
    });
}
