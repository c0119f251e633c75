//! Outbound connection establishment with retry

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use envoy_wire::{HostId, JoinMessage, Topic, read_frame, write_frame};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::MessengerConfig;
use crate::error::MessengerResult;
use crate::event::{Direction, Event, JoinToken, Link};

enum DialCommand {
    Dial {
        address: HostId,
        tokens: Vec<JoinToken>,
    },
    Completed {
        address: HostId,
        stream: TcpStream,
        join: JoinMessage,
        advertised: BTreeSet<Topic>,
    },
    /// The address turned out to be our own listener
    Abandoned { address: HostId },
}

/// Handle to the dialer task.
///
/// At most one attempt runs per address; asking to dial an address that is
/// already being dialed only attaches the caller's join tokens to it.
#[derive(Clone)]
pub(crate) struct Dialer {
    mailbox: flume::Sender<DialCommand>,
}

struct DialerTask {
    host_id: HostId,
    config: Arc<MessengerConfig>,
    join_payload: watch::Receiver<JoinMessage>,
    router: flume::Sender<Event>,
    mailbox: flume::Sender<DialCommand>,
    in_flight: HashMap<HostId, Vec<JoinToken>>,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl Dialer {
    pub(crate) fn spawn(
        host_id: HostId,
        config: Arc<MessengerConfig>,
        join_payload: watch::Receiver<JoinMessage>,
        router: flume::Sender<Event>,
        tracker: &TaskTracker,
        cancel: CancellationToken,
    ) -> Self {
        let (mailbox, commands) = flume::unbounded();
        let task = DialerTask {
            host_id,
            config,
            join_payload,
            router,
            mailbox: mailbox.clone(),
            in_flight: HashMap::new(),
            tracker: tracker.clone(),
            cancel,
        };
        tracker.spawn(task.run(commands));
        Self { mailbox }
    }

    /// Dial `address` until a join handshake succeeds
    pub(crate) fn dial(&self, address: HostId, tokens: Vec<JoinToken>) {
        if self
            .mailbox
            .send(DialCommand::Dial { address, tokens })
            .is_err()
        {
            debug!("Dialer stopped, not dialing {}", address);
        }
    }
}

impl DialerTask {
    async fn run(mut self, commands: flume::Receiver<DialCommand>) {
        loop {
            let command = tokio::select! {
                _ = self.cancel.cancelled() => break,
                command = commands.recv_async() => match command {
                    Ok(command) => command,
                    Err(_) => break,
                },
            };

            match command {
                DialCommand::Dial { address, tokens } => self.start(address, tokens),
                DialCommand::Completed {
                    address,
                    stream,
                    join,
                    advertised,
                } => self.complete(address, stream, join, advertised),
                DialCommand::Abandoned { address } => {
                    self.in_flight.remove(&address);
                }
            }
        }
        debug!("Dialer for {} stopped", self.host_id);
    }

    fn start(&mut self, address: HostId, tokens: Vec<JoinToken>) {
        if address == self.host_id {
            debug!("Not dialing own address {}", address);
            return;
        }
        if let Some(waiting) = self.in_flight.get_mut(&address) {
            debug!("Already dialing {}", address);
            waiting.extend(tokens);
            return;
        }

        self.in_flight.insert(address, tokens);
        self.tracker.spawn(dial_until_connected(
            address,
            self.config.clone(),
            self.join_payload.clone(),
            self.mailbox.clone(),
            self.cancel.clone(),
        ));
    }

    fn complete(
        &mut self,
        address: HostId,
        stream: TcpStream,
        join: JoinMessage,
        advertised: BTreeSet<Topic>,
    ) {
        let tokens = self.in_flight.remove(&address).unwrap_or_default();
        if join.host_id != address {
            debug!("Dialed {} answered as {}", address, join.host_id);
        }
        let link = Link {
            peer_id: join.host_id,
            stream,
            join,
            advertised,
            direction: Direction::Outbound,
            tokens,
        };
        if self.router.send(Event::Connected(link)).is_err() {
            debug!("Router stopped, dropping link to {}", address);
        }
    }
}

async fn dial_until_connected(
    address: HostId,
    config: Arc<MessengerConfig>,
    join_payload: watch::Receiver<JoinMessage>,
    mailbox: flume::Sender<DialCommand>,
    cancel: CancellationToken,
) {
    loop {
        let payload = join_payload.borrow().clone();
        let attempt = tokio::select! {
            _ = cancel.cancelled() => return,
            attempt = timeout(
                config.handshake_timeout,
                handshake(address, &payload, config.max_frame_size),
            ) => attempt,
        };

        match attempt {
            Ok(Ok((_, join))) if join.host_id == payload.host_id => {
                info!("{} is our own listener, not dialing it", address);
                let _ = mailbox.send(DialCommand::Abandoned { address });
                return;
            }
            Ok(Ok((stream, join))) => {
                info!("Connected to {}", address);
                let _ = mailbox.send(DialCommand::Completed {
                    address,
                    stream,
                    join,
                    advertised: payload.topics,
                });
                return;
            }
            Ok(Err(e)) => warn!(
                "Failed to connect to {}: {}. Retrying in {:?}",
                address, e, config.redial_interval
            ),
            Err(_) => warn!(
                "Handshake with {} timed out. Retrying in {:?}",
                address, config.redial_interval
            ),
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = sleep(config.redial_interval) => {}
        }
    }
}

/// Connect, send our join message and read the remote's join reply
async fn handshake(
    address: HostId,
    payload: &JoinMessage,
    max_frame_size: usize,
) -> MessengerResult<(TcpStream, JoinMessage)> {
    let mut stream = TcpStream::connect(address.addr()).await?;
    stream.set_nodelay(true)?;

    write_frame(&mut stream, payload, max_frame_size).await?;
    let reply: JoinMessage = read_frame(&mut stream, max_frame_size).await?;

    Ok((stream, reply))
}
