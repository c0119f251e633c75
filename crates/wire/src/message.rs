//! Message records exchanged between hosts

use std::collections::BTreeSet;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use bytes::Bytes;
use rand::RngCore;
use rand::rngs::OsRng;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Size of a message id in bytes
pub const MESSAGE_ID_SIZE: usize = 16;

/// Resolved network address identifying one host in the mesh.
///
/// Ordering compares the IP address first and the port second; it is the
/// total order used to break ties between duplicate links.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HostId(SocketAddr);

impl HostId {
    /// Create a host id from an already resolved address
    pub const fn new(addr: SocketAddr) -> Self {
        Self(addr)
    }

    /// Socket address to dial this host on
    pub const fn addr(&self) -> SocketAddr {
        self.0
    }
}

impl From<SocketAddr> for HostId {
    fn from(addr: SocketAddr) -> Self {
        Self(addr)
    }
}

impl FromStr for HostId {
    type Err = std::net::AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(Self)
    }
}

impl fmt::Display for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Routing key for publish and request messages
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Topic(String);

impl Topic {
    /// Create a topic
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Topic name
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Topic {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl From<String> for Topic {
    fn from(name: String) -> Self {
        Self(name)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 128-bit random identifier correlating a request or publish with its reply.
///
/// Ids are drawn from the operating system CSPRNG, never from a counter, so
/// hosts generate them independently without coordination.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MessageId([u8; MESSAGE_ID_SIZE]);

impl MessageId {
    /// Draw a fresh id
    pub fn random() -> Self {
        let mut bytes = [0u8; MESSAGE_ID_SIZE];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Raw id bytes
    pub const fn as_bytes(&self) -> &[u8; MESSAGE_ID_SIZE] {
        &self.0
    }
}

impl From<[u8; MESSAGE_ID_SIZE]> for MessageId {
    fn from(bytes: [u8; MESSAGE_ID_SIZE]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({self})")
    }
}

impl Serialize for MessageId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de> Deserialize<'de> for MessageId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct IdVisitor;

        impl<'de> Visitor<'de> for IdVisitor {
            type Value = MessageId;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{MESSAGE_ID_SIZE} bytes")
            }

            fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Self::Value, E> {
                let bytes: [u8; MESSAGE_ID_SIZE] = v
                    .try_into()
                    .map_err(|_| E::invalid_length(v.len(), &self))?;
                Ok(MessageId(bytes))
            }

            fn visit_seq<A: de::SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
                let mut bytes = [0u8; MESSAGE_ID_SIZE];
                for (i, byte) in bytes.iter_mut().enumerate() {
                    *byte = seq
                        .next_element()?
                        .ok_or_else(|| de::Error::invalid_length(i, &self))?;
                }
                Ok(MessageId(bytes))
            }
        }

        deserializer.deserialize_bytes(IdVisitor)
    }
}

/// Closed vocabulary of message kinds
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MessageType {
    /// Fire-and-forget delivery to one subscriber
    Publish,
    /// Round trip expecting a reply
    Request,
    /// Successful handler result
    Reply,
    /// Handler failed abruptly while serving a request
    ReplyPanic,
    /// Connection handshake
    Join,
    /// Sender is leaving the mesh
    Leaving,
    /// Sender subscribed to a topic
    Subscribe,
    /// Sender unsubscribed from a topic
    Unsubscribe,
}

impl MessageType {
    /// Whether the receiver should route this message to a topic handler
    pub const fn is_deliverable(self) -> bool {
        matches!(self, Self::Publish | Self::Request)
    }

    /// Whether this message answers an earlier request
    pub const fn is_reply(self) -> bool {
        matches!(self, Self::Reply | Self::ReplyPanic)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Publish => "publish",
            Self::Request => "request",
            Self::Reply => "reply",
            Self::ReplyPanic => "replyPanic",
            Self::Join => "join",
            Self::Leaving => "leaving",
            Self::Subscribe => "subscribe",
            Self::Unsubscribe => "unsubscribe",
        };
        f.write_str(name)
    }
}

/// Unit of wire transfer. Immutable once constructed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "id")]
    id: MessageId,
    #[serde(rename = "mt")]
    message_type: MessageType,
    #[serde(rename = "t", default, skip_serializing_if = "Option::is_none")]
    topic: Option<Topic>,
    #[serde(rename = "b", default, skip_serializing_if = "Option::is_none")]
    body: Option<Bytes>,
}

impl Message {
    fn new(
        id: MessageId,
        message_type: MessageType,
        topic: Option<Topic>,
        body: Option<Bytes>,
    ) -> Self {
        Self {
            id,
            message_type,
            topic,
            body,
        }
    }

    /// New publish carrying a fresh id
    pub fn publish(topic: Topic, body: Bytes) -> Self {
        Self::new(
            MessageId::random(),
            MessageType::Publish,
            Some(topic),
            Some(body),
        )
    }

    /// New request carrying a fresh id
    pub fn request(topic: Topic, body: Bytes) -> Self {
        Self::new(
            MessageId::random(),
            MessageType::Request,
            Some(topic),
            Some(body),
        )
    }

    /// Successful reply correlated with `id`
    pub fn reply(id: MessageId, body: Bytes) -> Self {
        Self::new(id, MessageType::Reply, None, Some(body))
    }

    /// Handler-fault reply correlated with `id`
    pub fn reply_panic(id: MessageId) -> Self {
        Self::new(id, MessageType::ReplyPanic, None, None)
    }

    /// Subscription announcement
    pub fn subscribe(topic: Topic) -> Self {
        Self::new(MessageId::random(), MessageType::Subscribe, Some(topic), None)
    }

    /// Unsubscription announcement
    pub fn unsubscribe(topic: Topic) -> Self {
        Self::new(
            MessageId::random(),
            MessageType::Unsubscribe,
            Some(topic),
            None,
        )
    }

    /// Departure notice
    pub fn leaving() -> Self {
        Self::new(MessageId::random(), MessageType::Leaving, None, None)
    }

    /// Correlation id
    pub const fn id(&self) -> MessageId {
        self.id
    }

    /// Message kind
    pub const fn message_type(&self) -> MessageType {
        self.message_type
    }

    /// Topic, absent for pure control messages
    pub const fn topic(&self) -> Option<&Topic> {
        self.topic.as_ref()
    }

    /// Body, absent for pure control messages
    pub const fn body(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    /// Take the body out of the message
    pub fn into_body(self) -> Option<Bytes> {
        self.body
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let topic = self.topic.as_ref().map_or("", Topic::as_str);
        match &self.body {
            Some(body) => write!(
                f,
                "[message[{}/{}]: topic: {}; body.len: {}]",
                self.id,
                self.message_type,
                topic,
                body.len()
            ),
            None => write!(
                f,
                "[message[{}/{}]: topic: {}; body: <none>]",
                self.id, self.message_type, topic
            ),
        }
    }
}

/// Handshake payload sent by both ends of a new connection.
///
/// Carries the sender's subscriptions and its entire known peer set, which
/// seeds gossip on the receiving side.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinMessage {
    /// Sender identity
    #[serde(rename = "h")]
    pub host_id: HostId,
    /// Topics the sender handles
    #[serde(rename = "t", default, skip_serializing_if = "BTreeSet::is_empty")]
    pub topics: BTreeSet<Topic>,
    /// Hosts the sender is connected to
    #[serde(rename = "p", default, skip_serializing_if = "BTreeSet::is_empty")]
    pub peers: BTreeSet<HostId>,
}

impl JoinMessage {
    /// Handshake with no topics and no peers
    pub const fn new(host_id: HostId) -> Self {
        Self {
            host_id,
            topics: BTreeSet::new(),
            peers: BTreeSet::new(),
        }
    }
}
