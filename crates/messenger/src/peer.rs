//! One live link to a remote host

use std::collections::HashSet;

use envoy_wire::{HostId, Message, MessageId, Topic, WireError, read_frame, write_frame};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, trace, warn};

use crate::correlation::{PendingReplies, PendingReply};
use crate::event::{ConnectionId, Direction, Event, ReplySender};

/// A connected remote host as seen by the router.
///
/// Owns the reader and writer tasks for the link. Dropping the peer (or
/// calling [`Peer::close`]) stops the reader and lets the writer flush what
/// is already queued before the socket closes.
#[derive(Debug)]
pub(crate) struct Peer {
    peer_id: HostId,
    connection_id: ConnectionId,
    direction: Direction,
    topics: HashSet<Topic>,
    pending: PendingReplies,
    writer: flume::Sender<Message>,
    cancel: CancellationToken,
}

/// Everything a peer needs to start its link tasks
pub(crate) struct PeerLink {
    pub peer_id: HostId,
    pub connection_id: ConnectionId,
    pub direction: Direction,
    pub topics: HashSet<Topic>,
    pub stream: TcpStream,
    pub max_frame_size: usize,
}

impl Peer {
    /// Start the reader and writer tasks for an established link
    pub(crate) fn spawn(
        link: PeerLink,
        events: flume::Sender<Event>,
        tracker: &TaskTracker,
        cancel: CancellationToken,
    ) -> Self {
        let PeerLink {
            peer_id,
            connection_id,
            direction,
            topics,
            stream,
            max_frame_size,
        } = link;

        let (read_half, write_half) = stream.into_split();
        let (writer, queue) = flume::unbounded();

        tracker.spawn(read_loop(
            peer_id,
            connection_id,
            read_half,
            max_frame_size,
            events.clone(),
            cancel.clone(),
        ));
        tracker.spawn(write_loop(
            peer_id,
            connection_id,
            write_half,
            max_frame_size,
            queue,
            events,
            cancel.clone(),
        ));

        Self {
            peer_id,
            connection_id,
            direction,
            topics,
            pending: PendingReplies::default(),
            writer,
            cancel,
        }
    }

    pub(crate) const fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub(crate) const fn direction(&self) -> Direction {
        self.direction
    }

    pub(crate) fn subscribes_to(&self, topic: &Topic) -> bool {
        self.topics.contains(topic)
    }

    pub(crate) fn add_topic(&mut self, topic: Topic) {
        self.topics.insert(topic);
    }

    pub(crate) fn remove_topic(&mut self, topic: &Topic) {
        self.topics.remove(topic);
    }

    /// Queue a message for the writer. Returns false once the writer is gone.
    pub(crate) fn send(&self, message: Message) -> bool {
        self.writer.send(message).is_ok()
    }

    /// Handle for queueing replies from handler tasks
    pub(crate) fn writer(&self) -> flume::Sender<Message> {
        self.writer.clone()
    }

    pub(crate) fn expect_reply(&mut self, id: MessageId, topic: Topic, tx: ReplySender) -> bool {
        self.pending.insert(id, topic, tx)
    }

    pub(crate) fn take_reply(&mut self, id: &MessageId) -> Option<PendingReply> {
        self.pending.take(id)
    }

    /// Close the link and fail its outstanding replies with a delivery
    /// error. Returns the ids that were failed.
    pub(crate) fn close(mut self, reason: &str) -> Vec<MessageId> {
        debug!(
            "Closing {} link {} to {} with {} pending replies: {}",
            self.direction,
            self.connection_id,
            self.peer_id,
            self.pending.len(),
            reason
        );
        self.cancel.cancel();
        self.pending.fail_all(reason)
    }
}

impl Drop for Peer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn read_loop(
    peer_id: HostId,
    connection_id: ConnectionId,
    mut reader: OwnedReadHalf,
    max_frame_size: usize,
    events: flume::Sender<Event>,
    cancel: CancellationToken,
) {
    loop {
        let result = tokio::select! {
            _ = cancel.cancelled() => break,
            result = read_frame::<_, Message>(&mut reader, max_frame_size) => result,
        };

        match result {
            Ok(message) => {
                trace!("Received {} from {}", message, peer_id);
                let event = Event::Received {
                    peer_id,
                    connection_id,
                    message,
                };
                if events.send(event).is_err() {
                    break;
                }
            }
            Err(e) => {
                let reason = match e {
                    WireError::ConnectionClosed => "connection closed by peer".to_string(),
                    e => e.to_string(),
                };
                let _ = events.send(Event::Disconnected {
                    peer_id,
                    connection_id,
                    reason,
                });
                break;
            }
        }
    }
}

async fn write_loop(
    peer_id: HostId,
    connection_id: ConnectionId,
    mut writer: OwnedWriteHalf,
    max_frame_size: usize,
    queue: flume::Receiver<Message>,
    events: flume::Sender<Event>,
    cancel: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            biased;
            message = queue.recv_async() => match message {
                Ok(message) => message,
                Err(_) => break,
            },
            _ = cancel.cancelled() => match queue.try_recv() {
                Ok(message) => message,
                Err(_) => break,
            },
        };

        let result = write_frame(&mut writer, &message, max_frame_size).await;
        // An oversized frame is refused before any byte is written, so the
        // link stays usable.
        let failed = matches!(&result, Err(e) if !matches!(e, WireError::FrameTooLarge { .. }));
        let message_type = message.message_type();

        if message_type.is_deliverable() {
            let _ = events.send(Event::WriteResult {
                peer_id,
                connection_id,
                message_id: message.id(),
                message_type,
                result,
            });
        } else if let Err(e) = result {
            if failed {
                let _ = events.send(Event::Disconnected {
                    peer_id,
                    connection_id,
                    reason: e.to_string(),
                });
            } else {
                warn!("Dropping {} to {}: {}", message, peer_id, e);
            }
        }

        if failed {
            break;
        }
    }

    let _ = writer.shutdown().await;
    trace!("Writer for {} {} stopped", peer_id, connection_id);
}
