//! Routing actor owning the peer table, subscriptions and reply correlation.
//!
//! Every state change in a messenger happens here, one event at a time, so
//! none of the state below needs a lock. Handlers for events never await;
//! slow work (dialing, handshakes, handler invocation, socket I/O) runs in
//! other tasks that report back through the mailbox.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use envoy_wire::{
    HostId, JoinMessage, Message, MessageId, MessageType, Topic, WireError, WireResult,
};
use rand::seq::SliceRandom;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::MessengerConfig;
use crate::correlation::PendingReply;
use crate::dialer::Dialer;
use crate::error::{MessengerError, MessengerResult};
use crate::event::{ConnectionId, Direction, Event, JoinToken, Link, ReplySender};
use crate::guard::{self, Handler};
use crate::peer::{Peer, PeerLink};

/// Direction of the link that survives when two hosts hold two links to
/// each other: the one dialed by the larger host id.
pub(crate) fn preferred_direction(local: HostId, remote: HostId) -> Direction {
    if local > remote {
        Direction::Outbound
    } else {
        Direction::Inbound
    }
}

/// Whether a newly connected link replaces the existing one to the same host.
///
/// Links in the same direction mean the remote reconnected, so the newer one
/// wins. Otherwise both ends keep the link dialed by the larger host id.
pub(crate) fn keeps_new_link(
    local: HostId,
    remote: HostId,
    existing: Direction,
    incoming: Direction,
) -> bool {
    existing == incoming || incoming == preferred_direction(local, remote)
}

pub(crate) struct Router {
    host_id: HostId,
    config: Arc<MessengerConfig>,
    subscriptions: HashMap<Topic, Arc<dyn Handler>>,
    peers: HashMap<HostId, Peer>,
    /// Which peer owns the pending reply for each in-flight message id
    in_flight: HashMap<MessageId, HostId>,
    next_connection_id: u64,
    dialer: Dialer,
    join_payload: watch::Sender<JoinMessage>,
    events: flume::Sender<Event>,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl Router {
    pub(crate) fn new(
        host_id: HostId,
        config: Arc<MessengerConfig>,
        dialer: Dialer,
        join_payload: watch::Sender<JoinMessage>,
        events: flume::Sender<Event>,
        tracker: TaskTracker,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            host_id,
            config,
            subscriptions: HashMap::new(),
            peers: HashMap::new(),
            in_flight: HashMap::new(),
            next_connection_id: 0,
            dialer,
            join_payload,
            events,
            tracker,
            cancel,
        }
    }

    /// Process events until the messenger leaves or is dropped
    pub(crate) async fn run(mut self, mailbox: flume::Receiver<Event>) {
        loop {
            let event = tokio::select! {
                biased;
                event = mailbox.recv_async() => match event {
                    Ok(event) => event,
                    Err(_) => break,
                },
                _ = self.cancel.cancelled() => {
                    self.leave();
                    break;
                }
            };

            if !self.handle(event) {
                break;
            }
        }
        info!("Router for {} stopped", self.host_id);
    }

    /// Apply one event. Returns false once the messenger has left.
    fn handle(&mut self, event: Event) -> bool {
        match event {
            Event::Join { addresses, token } => self.handle_join(addresses, token),
            Event::Connected(link) => self.handle_connected(link),
            Event::Subscribe {
                topic,
                handler,
                reply,
            } => {
                let _ = reply.send(self.handle_subscribe(topic, handler));
            }
            Event::Unsubscribe { topic, reply } => {
                self.handle_unsubscribe(topic);
                let _ = reply.send(());
            }
            Event::SendMessage { message, reply } => self.handle_send(message, reply),
            Event::Expire { message_id } => self.handle_expire(message_id),
            Event::Received {
                peer_id,
                connection_id,
                message,
            } => self.handle_received(peer_id, connection_id, message),
            Event::WriteResult {
                peer_id,
                connection_id,
                message_id,
                message_type,
                result,
            } => {
                self.handle_write_result(peer_id, connection_id, message_id, message_type, result)
            }
            Event::Disconnected {
                peer_id,
                connection_id,
                reason,
            } => self.remove_peer(peer_id, connection_id, &reason),
            Event::Peers { reply } => {
                let _ = reply.send(self.peers.keys().copied().collect());
            }
            Event::Leave { done } => {
                self.leave();
                let _ = done.send(());
                return false;
            }
        }
        true
    }

    fn handle_join(&mut self, addresses: Vec<HostId>, token: JoinToken) {
        for address in addresses {
            if address == self.host_id {
                debug!("Ignoring join to own address {}", address);
                continue;
            }
            if self.peers.contains_key(&address) {
                debug!("Already connected to {}", address);
                continue;
            }
            self.dialer.dial(address, vec![token.clone()]);
        }
    }

    fn handle_connected(&mut self, link: Link) {
        let Link {
            peer_id,
            stream,
            join,
            advertised,
            direction,
            tokens,
        } = link;

        if peer_id == self.host_id {
            debug!("Dropping link to self");
            return;
        }

        if let Some(existing) = self.peers.get(&peer_id).map(Peer::direction) {
            if !keeps_new_link(self.host_id, peer_id, existing, direction) {
                debug!(
                    "Discarding {} link to {}, keeping {} link",
                    direction, peer_id, existing
                );
                drop(stream);
                self.gossip(&join.peers, &tokens);
                return;
            }
            if let Some(old) = self.peers.remove(&peer_id) {
                info!(
                    "Replacing {} link to {} with {} link",
                    existing, peer_id, direction
                );
                self.close_peer(old, "superseded by another link");
            }
        }

        self.next_connection_id += 1;
        let connection_id = ConnectionId(self.next_connection_id);
        let topics: HashSet<Topic> = join.topics.iter().cloned().collect();
        info!(
            "Connected to {} ({} link {}, {} topics)",
            peer_id,
            direction,
            connection_id,
            topics.len()
        );

        let peer = Peer::spawn(
            PeerLink {
                peer_id,
                connection_id,
                direction,
                topics,
                stream,
                max_frame_size: self.config.max_frame_size,
            },
            self.events.clone(),
            &self.tracker,
            self.cancel.child_token(),
        );
        self.reconcile_topics(&peer, &advertised);
        self.peers.insert(peer_id, peer);
        self.publish_join_payload();

        self.gossip(&join.peers, &tokens);
    }

    /// Tell a new peer about subscription changes made after our join
    /// payload for its handshake was taken.
    fn reconcile_topics(&self, peer: &Peer, advertised: &BTreeSet<Topic>) {
        for topic in self.subscriptions.keys() {
            if !advertised.contains(topic) {
                peer.send(Message::subscribe(topic.clone()));
            }
        }
        for topic in advertised {
            if !self.subscriptions.contains_key(topic) {
                peer.send(Message::unsubscribe(topic.clone()));
            }
        }
    }

    /// Dial every host a peer knows that we are not yet connected to
    fn gossip<'a>(&self, known: impl IntoIterator<Item = &'a HostId>, tokens: &[JoinToken]) {
        for address in known {
            if *address == self.host_id || self.peers.contains_key(address) {
                continue;
            }
            debug!("Learned of {} through gossip", address);
            self.dialer.dial(*address, tokens.to_vec());
        }
    }

    fn handle_subscribe(&mut self, topic: Topic, handler: Arc<dyn Handler>) -> MessengerResult<()> {
        if self.subscriptions.contains_key(&topic) {
            return Err(MessengerError::AlreadySubscribed { topic });
        }
        info!("Subscribed to {}", topic);
        self.subscriptions.insert(topic.clone(), handler);
        self.broadcast(&Message::subscribe(topic));
        self.publish_join_payload();
        Ok(())
    }

    fn handle_unsubscribe(&mut self, topic: Topic) {
        if self.subscriptions.remove(&topic).is_none() {
            debug!("Not subscribed to {}", topic);
            return;
        }
        info!("Unsubscribed from {}", topic);
        self.broadcast(&Message::unsubscribe(topic));
        self.publish_join_payload();
    }

    fn broadcast(&self, message: &Message) {
        for peer in self.peers.values() {
            peer.send(message.clone());
        }
    }

    fn handle_send(&mut self, message: Message, reply: ReplySender) {
        let message_id = message.id();
        let Some(topic) = message.topic().cloned() else {
            let _ = reply.send(Err(MessengerError::Wire(WireError::Encode(format!(
                "{message} has no topic"
            )))));
            return;
        };
        if self.in_flight.contains_key(&message_id) {
            let _ = reply.send(Err(MessengerError::DuplicateMessageId(message_id)));
            return;
        }

        let candidates: Vec<HostId> = self
            .peers
            .iter()
            .filter(|(_, peer)| peer.subscribes_to(&topic))
            .map(|(peer_id, _)| *peer_id)
            .collect();
        let Some(peer_id) = candidates.choose(&mut rand::thread_rng()).copied() else {
            let _ = reply.send(Err(MessengerError::NoSubscribers { topic }));
            return;
        };
        let Some(peer) = self.peers.get_mut(&peer_id) else {
            return;
        };

        debug!("Routing {} to {}", message, peer_id);
        if !peer.expect_reply(message_id, topic, reply) {
            return;
        }
        self.in_flight.insert(message_id, peer_id);

        let connection_id = peer.connection_id();
        if !peer.send(message) {
            self.remove_peer(peer_id, connection_id, "writer stopped");
        }
    }

    fn handle_expire(&mut self, message_id: MessageId) {
        if let Some(peer_id) = self.in_flight.remove(&message_id) {
            debug!("Caller stopped waiting for {}", message_id);
            if let Some(peer) = self.peers.get_mut(&peer_id) {
                peer.take_reply(&message_id);
            }
        }
    }

    fn is_current(&self, peer_id: HostId, connection_id: ConnectionId) -> bool {
        self.peers
            .get(&peer_id)
            .is_some_and(|peer| peer.connection_id() == connection_id)
    }

    fn handle_received(&mut self, peer_id: HostId, connection_id: ConnectionId, message: Message) {
        if !self.is_current(peer_id, connection_id) {
            debug!("Ignoring {} from stale link {} to {}", message, connection_id, peer_id);
            return;
        }

        match message.message_type() {
            MessageType::Publish | MessageType::Request => self.deliver(peer_id, message),
            MessageType::Reply => {
                let message_id = message.id();
                if let Some(waiter) = self.take_reply(peer_id, &message_id) {
                    waiter.complete(message.into_body());
                } else {
                    debug!("Dropping reply for unknown message {}", message_id);
                }
            }
            MessageType::ReplyPanic => {
                let message_id = message.id();
                if let Some(waiter) = self.take_reply(peer_id, &message_id) {
                    warn!("Handler on {} panicked for {}", peer_id, message_id);
                    waiter.panicked();
                }
            }
            MessageType::Subscribe | MessageType::Unsubscribe => {
                let Some(topic) = message.topic().cloned() else {
                    warn!("Dropping {} from {} without topic", message, peer_id);
                    return;
                };
                if let Some(peer) = self.peers.get_mut(&peer_id) {
                    if message.message_type() == MessageType::Subscribe {
                        debug!("{} subscribed to {}", peer_id, topic);
                        peer.add_topic(topic);
                    } else {
                        debug!("{} unsubscribed from {}", peer_id, topic);
                        peer.remove_topic(&topic);
                    }
                }
            }
            MessageType::Leaving => {
                info!("{} is leaving", peer_id);
                self.remove_peer(peer_id, connection_id, "peer left");
            }
            MessageType::Join => {
                warn!("Unexpected join message from {} on an established link", peer_id);
            }
        }
    }

    /// Hand an inbound publish or request to the local handler
    fn deliver(&self, peer_id: HostId, message: Message) {
        let Some(topic) = message.topic() else {
            warn!("Dropping {} from {} without topic", message, peer_id);
            return;
        };
        let Some(handler) = self.subscriptions.get(topic) else {
            warn!(
                "Received {} for topic {} we are not subscribed to. Ignored.",
                message.message_type(),
                topic
            );
            return;
        };
        let Some(peer) = self.peers.get(&peer_id) else {
            return;
        };
        guard::dispatch(handler.clone(), message, peer.writer());
    }

    fn take_reply(&mut self, peer_id: HostId, message_id: &MessageId) -> Option<PendingReply> {
        if self.in_flight.get(message_id) != Some(&peer_id) {
            return None;
        }
        self.in_flight.remove(message_id);
        self.peers.get_mut(&peer_id)?.take_reply(message_id)
    }

    fn handle_write_result(
        &mut self,
        peer_id: HostId,
        connection_id: ConnectionId,
        message_id: MessageId,
        message_type: MessageType,
        result: WireResult<()>,
    ) {
        if !self.is_current(peer_id, connection_id) {
            return;
        }
        match result {
            Err(e @ WireError::FrameTooLarge { .. }) => {
                warn!("Not sending {} to {}: {}", message_id, peer_id, e);
                if let Some(waiter) = self.take_reply(peer_id, &message_id) {
                    waiter.reject(MessengerError::Wire(e));
                }
            }
            Err(e) => {
                let reason = e.to_string();
                warn!("Failed to write {} to {}: {}", message_id, peer_id, reason);
                self.remove_peer(peer_id, connection_id, &reason);
            }
            Ok(()) if message_type == MessageType::Publish => {
                if let Some(waiter) = self.take_reply(peer_id, &message_id) {
                    waiter.complete(None);
                }
            }
            Ok(()) => {}
        }
    }

    /// Drop the peer if `connection_id` is still its current link
    fn remove_peer(&mut self, peer_id: HostId, connection_id: ConnectionId, reason: &str) {
        if !self.is_current(peer_id, connection_id) {
            debug!(
                "Ignoring disconnect of stale link {} to {}: {}",
                connection_id, peer_id, reason
            );
            return;
        }
        if let Some(peer) = self.peers.remove(&peer_id) {
            warn!("Lost connection to {}: {}", peer_id, reason);
            self.close_peer(peer, reason);
            self.publish_join_payload();
        }
    }

    fn close_peer(&mut self, peer: Peer, reason: &str) {
        for message_id in peer.close(reason) {
            self.in_flight.remove(&message_id);
        }
    }

    fn leave(&mut self) {
        info!("{} leaving the mesh", self.host_id);
        let peers: Vec<Peer> = self.peers.drain().map(|(_, peer)| peer).collect();
        for peer in peers {
            peer.send(Message::leaving());
            self.close_peer(peer, "local host is leaving");
        }
        self.in_flight.clear();
        self.cancel.cancel();
    }

    fn publish_join_payload(&self) {
        let mut payload = JoinMessage::new(self.host_id);
        payload.topics = self.subscriptions.keys().cloned().collect();
        payload.peers = self.peers.keys().copied().collect();
        self.join_payload.send_replace(payload);
    }
}
