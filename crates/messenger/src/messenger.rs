//! Public messenger handle

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use envoy_wire::{HostId, JoinMessage, Message, MessageId, Topic};
use tokio::sync::{oneshot, watch};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::address;
use crate::config::MessengerConfig;
use crate::correlation::round_trip;
use crate::dialer::Dialer;
use crate::error::{MessengerError, MessengerResult};
use crate::event::{Event, join_barrier};
use crate::guard::Handler;
use crate::listener;
use crate::router::Router;

/// Reply to a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Id shared by the request and its reply
    pub id: MessageId,
    /// Bytes returned by the remote handler
    pub body: Bytes,
}

/// One member of the mesh.
///
/// Created listening; call [`Messenger::join`] to connect to other hosts.
/// Dropping the messenger leaves the mesh in the background; call
/// [`Messenger::leave`] to wait for that to finish.
pub struct Messenger {
    host_id: HostId,
    config: Arc<MessengerConfig>,
    mailbox: flume::Sender<Event>,
    task_tracker: TaskTracker,
    cancellation_token: CancellationToken,
}

impl Messenger {
    /// Listen on `local` with default configuration
    pub async fn new(local: &str) -> MessengerResult<Self> {
        Self::with_config(local, MessengerConfig::default()).await
    }

    /// Listen on `local` (`host:port`, port 0 picks a free port)
    pub async fn with_config(local: &str, config: MessengerConfig) -> MessengerResult<Self> {
        let (tcp_listener, host_id) = listener::bind(local).await?;

        let config = Arc::new(config);
        let task_tracker = TaskTracker::new();
        let cancellation_token = CancellationToken::new();
        let (mailbox, events) = flume::unbounded();
        let (join_payload, join_payload_rx) = watch::channel(JoinMessage::new(host_id));

        let dialer = Dialer::spawn(
            host_id,
            config.clone(),
            join_payload_rx.clone(),
            mailbox.clone(),
            &task_tracker,
            cancellation_token.clone(),
        );
        listener::spawn(
            tcp_listener,
            host_id,
            config.clone(),
            join_payload_rx,
            mailbox.clone(),
            &task_tracker,
            cancellation_token.clone(),
        );
        let router = Router::new(
            host_id,
            config.clone(),
            dialer,
            join_payload,
            mailbox.clone(),
            task_tracker.clone(),
            cancellation_token.clone(),
        );
        task_tracker.spawn(router.run(events));

        info!("Messenger {} started", host_id);
        Ok(Self {
            host_id,
            config,
            mailbox,
            task_tracker,
            cancellation_token,
        })
    }

    /// This host's id, the address it listens on
    pub const fn host_id(&self) -> HostId {
        self.host_id
    }

    /// Connect to `remotes` and to every host they know about.
    ///
    /// Returns once those connections are up, or after the configured join
    /// timeout, whichever comes first. Unreachable hosts keep being redialed
    /// in the background. Addresses that do not resolve are logged and
    /// skipped.
    pub async fn join(&self, remotes: &[&str]) -> MessengerResult<()> {
        let mut addresses = Vec::with_capacity(remotes.len());
        for remote in remotes {
            match address::resolve_host(remote).await {
                Ok(host) => addresses.push(host),
                Err(e) => error!("{}. Ignoring.", e),
            }
        }

        let (token, barrier) = join_barrier();
        self.send(Event::Join { addresses, token })?;

        if timeout(self.config.join_timeout, barrier.wait()).await.is_err() {
            warn!(
                "Join did not complete within {:?}, still dialing in background",
                self.config.join_timeout
            );
        }
        Ok(())
    }

    /// Notify peers, close every link and stop background tasks.
    ///
    /// Outstanding requests made through this messenger fail with
    /// [`MessengerError::Closed`]. Calling it again is a no-op.
    pub async fn leave(&self) -> MessengerResult<()> {
        let (done, done_rx) = oneshot::channel();
        if self.mailbox.send(Event::Leave { done }).is_err() {
            debug!("Messenger {} already left", self.host_id);
            return Ok(());
        }
        let _ = done_rx.await;

        self.task_tracker.close();
        match timeout(Duration::from_secs(5), self.task_tracker.wait()).await {
            Ok(()) => debug!("Messenger tasks shut down cleanly"),
            Err(_) => error!("Messenger tasks did not shut down within timeout"),
        }

        info!("Messenger {} left", self.host_id);
        Ok(())
    }

    /// Register the handler for `topic` and announce it to all peers
    pub async fn subscribe<H>(&self, topic: impl Into<Topic>, handler: H) -> MessengerResult<()>
    where
        H: Handler,
    {
        let (reply, rx) = oneshot::channel();
        self.send(Event::Subscribe {
            topic: topic.into(),
            handler: Arc::new(handler),
            reply,
        })?;
        rx.await.map_err(|_| MessengerError::Closed)?
    }

    /// Remove the handler for `topic` and announce it to all peers
    pub async fn unsubscribe(&self, topic: impl Into<Topic>) -> MessengerResult<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Event::Unsubscribe {
            topic: topic.into(),
            reply,
        })?;
        rx.await.map_err(|_| MessengerError::Closed)
    }

    /// Deliver `body` to one subscriber of `topic`.
    ///
    /// Resolves once the message is written to a peer's link; it does not
    /// wait for the remote handler.
    pub async fn publish(
        &self,
        topic: impl Into<Topic>,
        body: impl Into<Bytes>,
    ) -> MessengerResult<MessageId> {
        let message = Message::publish(topic.into(), body.into());
        let id = message.id();
        round_trip(
            &self.mailbox,
            &self.cancellation_token,
            message,
            self.config.request_timeout,
        )
        .await?;
        Ok(id)
    }

    /// Send `body` to one subscriber of `topic` and wait for its reply.
    ///
    /// If the chosen peer's link fails before the reply arrives the request
    /// is re-sent, possibly to another subscriber, until the request
    /// timeout expires.
    pub async fn request(
        &self,
        topic: impl Into<Topic>,
        body: impl Into<Bytes>,
    ) -> MessengerResult<Reply> {
        let message = Message::request(topic.into(), body.into());
        let id = message.id();
        let body = round_trip(
            &self.mailbox,
            &self.cancellation_token,
            message,
            self.config.request_timeout,
        )
        .await?;
        Ok(Reply {
            id,
            body: body.unwrap_or_default(),
        })
    }

    /// Deliver to every subscriber of a topic. Not provided.
    pub async fn broadcast(
        &self,
        _topic: impl Into<Topic>,
        _body: impl Into<Bytes>,
    ) -> MessengerResult<()> {
        Err(MessengerError::NotImplemented("broadcast"))
    }

    /// Request every subscriber of a topic and collect the replies. Not
    /// provided.
    pub async fn survey(
        &self,
        _topic: impl Into<Topic>,
        _body: impl Into<Bytes>,
    ) -> MessengerResult<Vec<Reply>> {
        Err(MessengerError::NotImplemented("survey"))
    }

    /// Hosts this messenger currently holds a link to
    pub async fn peers(&self) -> MessengerResult<Vec<HostId>> {
        let (reply, rx) = oneshot::channel();
        self.send(Event::Peers { reply })?;
        let mut peers = rx.await.map_err(|_| MessengerError::Closed)?;
        peers.sort();
        Ok(peers)
    }

    fn send(&self, event: Event) -> MessengerResult<()> {
        self.mailbox
            .send(event)
            .map_err(|_| MessengerError::Closed)
    }
}

impl Drop for Messenger {
    fn drop(&mut self) {
        self.cancellation_token.cancel();
    }
}
