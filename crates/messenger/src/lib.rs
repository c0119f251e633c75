//! Peer-to-peer messaging mesh
//!
//! Every host listens on one address and keeps a single TCP link to each
//! other host it knows about. Joining one host is enough: hosts exchange
//! their peer lists on connect and dial whatever they learn.
//!
//! Hosts subscribe handlers to topics. Publishes and requests for a topic go
//! to one randomly chosen subscriber, and requests wait for its reply. A
//! handler that panics is reported to the requester without affecting the
//! rest of the host.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod address;
pub mod config;
mod correlation;
mod dialer;
pub mod error;
mod event;
pub mod guard;
mod listener;
pub mod messenger;
mod peer;
mod router;

pub use config::MessengerConfig;
pub use envoy_wire::{HostId, MessageId, Topic, WireError};
pub use error::{MessengerError, MessengerResult};
pub use guard::Handler;
pub use messenger::{Messenger, Reply};
