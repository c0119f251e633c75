//! Inbound connection acceptance

use std::sync::Arc;

use envoy_wire::{HostId, JoinMessage, WireError, read_frame, write_frame};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::address;
use crate::config::MessengerConfig;
use crate::error::MessengerResult;
use crate::event::{Direction, Event, Link};

/// Bind the listening socket for `local` and derive the host id from the
/// bound address, so port 0 yields the port actually assigned.
pub(crate) async fn bind(local: &str) -> MessengerResult<(TcpListener, HostId)> {
    let addr = address::resolve(local).await?;
    let listener = TcpListener::bind(addr).await?;
    let host_id = address::host_id(listener.local_addr()?);
    info!("Listening on {} as {}", addr, host_id);
    Ok((listener, host_id))
}

/// Accept links until `cancel` fires
pub(crate) fn spawn(
    listener: TcpListener,
    host_id: HostId,
    config: Arc<MessengerConfig>,
    join_payload: watch::Receiver<JoinMessage>,
    router: flume::Sender<Event>,
    tracker: &TaskTracker,
    cancel: CancellationToken,
) {
    let accept_tracker = tracker.clone();
    tracker.spawn(async move {
        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, remote)) => {
                    debug!("Accepted connection from {}", remote);
                    accept_tracker.spawn(accept_link(
                        stream,
                        host_id,
                        config.clone(),
                        join_payload.clone(),
                        router.clone(),
                        cancel.clone(),
                    ));
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }
        debug!("Listener for {} stopped", host_id);
    });
}

async fn accept_link(
    mut stream: TcpStream,
    host_id: HostId,
    config: Arc<MessengerConfig>,
    join_payload: watch::Receiver<JoinMessage>,
    router: flume::Sender<Event>,
    cancel: CancellationToken,
) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("Failed to set TCP_NODELAY: {}", e);
    }

    let exchange = async {
        let join: JoinMessage = read_frame(&mut stream, config.max_frame_size).await?;
        let payload = join_payload.borrow().clone();
        write_frame(&mut stream, &payload, config.max_frame_size).await?;
        Ok::<_, WireError>((join, payload.topics))
    };

    let (join, advertised) = tokio::select! {
        _ = cancel.cancelled() => return,
        result = timeout(config.handshake_timeout, exchange) => match result {
            Ok(Ok(exchanged)) => exchanged,
            Ok(Err(e)) => {
                warn!("Join handshake failed: {}", e);
                return;
            }
            Err(_) => {
                warn!("Join handshake timed out");
                return;
            }
        },
    };

    if join.host_id == host_id {
        debug!("Dropping link from our own dialer");
        return;
    }

    let link = Link {
        peer_id: join.host_id,
        stream,
        join,
        advertised,
        direction: Direction::Inbound,
        tokens: Vec::new(),
    };
    if router.send(Event::Connected(link)).is_err() {
        debug!("Router stopped, dropping inbound link");
    }
}
