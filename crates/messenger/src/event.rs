//! Events processed by the routing actor

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use envoy_wire::{HostId, JoinMessage, Message, MessageId, MessageType, Topic, WireResult};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};

use crate::error::MessengerResult;
use crate::guard::Handler;

/// Waiter for the outcome of one submitted request or publish
pub(crate) type ReplySender = oneshot::Sender<MessengerResult<Option<Bytes>>>;

/// Identifies one link to a peer; successive links to the same host get
/// distinct ids so late events from a superseded link can be ignored.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct ConnectionId(pub(crate) u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Which side opened a link
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Direction {
    /// We dialed the remote host
    Outbound,
    /// The remote host dialed us
    Inbound,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Outbound => f.write_str("outbound"),
            Self::Inbound => f.write_str("inbound"),
        }
    }
}

/// Completion token for `join`.
///
/// The joining caller waits until every clone has been dropped. Clones ride
/// along with dial attempts and with the gossip dials a connection triggers.
#[derive(Clone, Debug)]
pub(crate) struct JoinToken(#[allow(dead_code)] mpsc::Sender<()>);

/// Waiting side of a set of [`JoinToken`]s
pub(crate) struct JoinBarrier(mpsc::Receiver<()>);

impl JoinBarrier {
    /// Resolves once all tokens are gone
    pub(crate) async fn wait(mut self) {
        while self.0.recv().await.is_some() {}
    }
}

/// Create a token and the barrier that waits on it
pub(crate) fn join_barrier() -> (JoinToken, JoinBarrier) {
    let (tx, rx) = mpsc::channel(1);
    (JoinToken(tx), JoinBarrier(rx))
}

/// A link that completed the join handshake
pub(crate) struct Link {
    /// Identity the remote announced in its join message
    pub peer_id: HostId,
    pub stream: TcpStream,
    pub join: JoinMessage,
    /// Topics our side announced during the handshake
    pub advertised: BTreeSet<Topic>,
    pub direction: Direction,
    pub tokens: Vec<JoinToken>,
}

/// Everything the routing actor reacts to
pub(crate) enum Event {
    /// Dial the given hosts
    Join {
        addresses: Vec<HostId>,
        token: JoinToken,
    },
    /// A handshake completed, from either the dialer or the listener
    Connected(Link),
    Subscribe {
        topic: Topic,
        handler: Arc<dyn Handler>,
        reply: oneshot::Sender<MessengerResult<()>>,
    },
    Unsubscribe {
        topic: Topic,
        reply: oneshot::Sender<()>,
    },
    /// Route an outbound request or publish
    SendMessage {
        message: Message,
        reply: ReplySender,
    },
    /// The caller gave up waiting for this id
    Expire { message_id: MessageId },
    /// A peer's reader decoded a frame
    Received {
        peer_id: HostId,
        connection_id: ConnectionId,
        message: Message,
    },
    /// A peer's writer finished writing a request or publish
    WriteResult {
        peer_id: HostId,
        connection_id: ConnectionId,
        message_id: MessageId,
        message_type: MessageType,
        result: WireResult<()>,
    },
    /// A link failed or was closed by the remote
    Disconnected {
        peer_id: HostId,
        connection_id: ConnectionId,
        reason: String,
    },
    /// Snapshot of the peer table
    Peers { reply: oneshot::Sender<Vec<HostId>> },
    Leave { done: oneshot::Sender<()> },
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Join { addresses, .. } => write!(f, "Join({addresses:?})"),
            Self::Connected(link) => {
                write!(f, "Connected({} {})", link.direction, link.peer_id)
            }
            Self::Subscribe { topic, .. } => write!(f, "Subscribe({topic})"),
            Self::Unsubscribe { topic, .. } => write!(f, "Unsubscribe({topic})"),
            Self::SendMessage { message, .. } => write!(f, "SendMessage({message})"),
            Self::Expire { message_id } => write!(f, "Expire({message_id})"),
            Self::Received {
                peer_id, message, ..
            } => write!(f, "Received({peer_id} {message})"),
            Self::WriteResult {
                peer_id,
                message_id,
                result,
                ..
            } => write!(f, "WriteResult({peer_id} {message_id} {result:?})"),
            Self::Disconnected {
                peer_id, reason, ..
            } => write!(f, "Disconnected({peer_id}: {reason})"),
            Self::Peers { .. } => f.write_str("Peers"),
            Self::Leave { .. } => f.write_str("Leave"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_barrier_waits_for_every_token() {
        let (token, barrier) = join_barrier();
        let gossip = token.clone();
        drop(token);

        let waiter = tokio::spawn(barrier.wait());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(gossip);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
