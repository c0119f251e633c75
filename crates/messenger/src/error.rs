//! Error types for the messenger

use std::time::Duration;

use envoy_wire::{MessageId, Topic, WireError};
use thiserror::Error;

/// Messenger operation errors
#[derive(Debug, Error)]
pub enum MessengerError {
    /// No connected peer advertises the topic
    #[error("No subscribers found for topic '{topic}'")]
    NoSubscribers {
        /// Topic nobody serves
        topic: Topic,
    },

    /// Nothing resolved the call before its deadline
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// The chosen peer failed before the message was delivered
    #[error("Delivery failed: {0}")]
    Delivery(String),

    /// The remote handler failed abruptly
    #[error("Handler for topic '{topic}' panicked")]
    HandlerFault {
        /// Topic whose handler failed
        topic: Topic,
    },

    /// An address could not be resolved
    #[error("Cannot resolve address '{address}': {reason}")]
    Resolve {
        /// Address as given by the caller
        address: String,
        /// Resolver failure
        reason: String,
    },

    /// Topic already has a local handler
    #[error("Handler already registered for topic '{topic}'")]
    AlreadySubscribed {
        /// Topic already handled locally
        topic: Topic,
    },

    /// A reply waiter for this id is still outstanding
    #[error("Message {0} already has a pending reply")]
    DuplicateMessageId(MessageId),

    /// Declared in the API but not provided
    #[error("{0} is not implemented")]
    NotImplemented(&'static str),

    /// The messenger has left the mesh
    #[error("Messenger is closed")]
    Closed,

    /// Socket error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Framing or codec error
    #[error("Wire error: {0}")]
    Wire(#[from] WireError),
}

impl MessengerError {
    /// Whether a request loop should re-submit after this error
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Delivery(_))
    }
}

/// Result type alias
pub type MessengerResult<T> = Result<T, MessengerError>;
