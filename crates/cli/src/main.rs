//! CLI binary to run a messaging mesh host.
#![warn(missing_docs)]
#![warn(clippy::all)]

use std::time::Duration;

use bytes::Bytes;
use clap::{Args, Parser, Subcommand};
use envoy_messenger::{Messenger, MessengerConfig, MessengerError, Topic};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// CLI-specific error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Messenger error
    #[error(transparent)]
    Messenger(#[from] MessengerError),

    /// Signal handler installation failed
    #[error("signal handler error: {0}")]
    Signal(std::io::Error),
}

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a host that echoes requests on the given topics until interrupted
    Serve {
        #[command(flatten)]
        host: HostArgs,

        /// Topic to answer with an echo handler (repeatable)
        #[arg(long = "echo", env = "ENVOY_ECHO", value_delimiter = ',')]
        echo: Vec<String>,
    },

    /// Join the mesh, send requests and print the replies
    Request {
        #[command(flatten)]
        host: HostArgs,

        /// Topic to send to
        #[arg(long, env = "ENVOY_TOPIC")]
        topic: String,

        /// Request body
        #[arg(long, default_value = "")]
        body: String,

        /// Number of requests to send
        #[arg(long, default_value_t = 1)]
        count: usize,
    },

    /// Join the mesh and publish one message
    Publish {
        #[command(flatten)]
        host: HostArgs,

        /// Topic to publish to
        #[arg(long, env = "ENVOY_TOPIC")]
        topic: String,

        /// Message body
        #[arg(long, default_value = "")]
        body: String,
    },
}

#[derive(Debug, Args)]
struct HostArgs {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:0", env = "ENVOY_LISTEN")]
    listen: String,

    /// Address of a host to join (repeatable)
    #[arg(long = "join", env = "ENVOY_JOIN", value_delimiter = ',')]
    join: Vec<String>,

    /// Seconds between redial attempts to an unreachable host
    #[arg(long, default_value_t = 10, env = "ENVOY_REDIAL_INTERVAL_SECS")]
    redial_interval_secs: u64,

    /// Seconds before a request or publish gives up
    #[arg(long, default_value_t = 30, env = "ENVOY_REQUEST_TIMEOUT_SECS")]
    request_timeout_secs: u64,

    /// Seconds to wait for the initial join to converge
    #[arg(long, default_value_t = 30, env = "ENVOY_JOIN_TIMEOUT_SECS")]
    join_timeout_secs: u64,

    /// Seconds allowed for connecting and exchanging join messages
    #[arg(long, default_value_t = 10, env = "ENVOY_HANDSHAKE_TIMEOUT_SECS")]
    handshake_timeout_secs: u64,

    /// Largest frame accepted from a peer, in bytes
    #[arg(long, default_value_t = 10 * 1024 * 1024, env = "ENVOY_MAX_FRAME_SIZE")]
    max_frame_size: usize,
}

impl HostArgs {
    fn config(&self) -> MessengerConfig {
        MessengerConfig {
            redial_interval: Duration::from_secs(self.redial_interval_secs),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            join_timeout: Duration::from_secs(self.join_timeout_secs),
            handshake_timeout: Duration::from_secs(self.handshake_timeout_secs),
            max_frame_size: self.max_frame_size,
        }
    }

    /// Start a messenger and join the configured hosts
    async fn start(&self) -> Result<Messenger, Error> {
        let messenger = Messenger::with_config(&self.listen, self.config()).await?;
        let remotes: Vec<&str> = self.join.iter().map(String::as_str).collect();
        messenger.join(&remotes).await?;
        info!(
            "Host {} joined with {} peers",
            messenger.host_id(),
            messenger.peers().await?.len()
        );
        Ok(messenger)
    }
}

fn echo_handler(topic: &Topic, body: Bytes) -> Bytes {
    info!("Echoing {} bytes on {}", body.len(), topic);
    body
}

/// Wait for SIGTERM or SIGINT
async fn shutdown_signal() -> Result<(), Error> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigterm = signal(SignalKind::terminate()).map_err(Error::Signal)?;
        let mut sigint = signal(SignalKind::interrupt()).map_err(Error::Signal)?;

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.map_err(Error::Signal)?;
        info!("Received interrupt signal");
    }
    Ok(())
}

async fn serve(host: HostArgs, echo: Vec<String>) -> Result<(), Error> {
    let messenger = host.start().await?;
    for topic in echo {
        messenger.subscribe(topic, echo_handler).await?;
    }

    let shutdown_token = CancellationToken::new();
    let signal_shutdown_token = shutdown_token.clone();
    tokio::spawn(async move {
        if let Err(e) = shutdown_signal().await {
            warn!("{}", e);
        }
        info!("Shutting down");
        signal_shutdown_token.cancel();
    });

    shutdown_token.cancelled().await;
    messenger.leave().await?;
    Ok(())
}

async fn request(host: HostArgs, topic: String, body: String, count: usize) -> Result<(), Error> {
    let messenger = host.start().await?;
    let body = Bytes::from(body);

    let mut result = Ok(());
    for _ in 0..count {
        match messenger.request(topic.as_str(), body.clone()).await {
            Ok(reply) => println!("{} {}", reply.id, String::from_utf8_lossy(&reply.body)),
            Err(e) => {
                result = Err(e.into());
                break;
            }
        }
    }

    messenger.leave().await?;
    result
}

async fn publish(host: HostArgs, topic: String, body: String) -> Result<(), Error> {
    let messenger = host.start().await?;
    let result = messenger.publish(topic, body).await;
    messenger.leave().await?;

    println!("{}", result?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match Cli::parse().command {
        Command::Serve { host, echo } => serve(host, echo).await,
        Command::Request {
            host,
            topic,
            body,
            count,
        } => request(host, topic, body, count).await,
        Command::Publish { host, topic, body } => publish(host, topic, body).await,
    }
}
