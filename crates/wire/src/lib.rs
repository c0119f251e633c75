//! Wire schema for the envoy messaging mesh.
//!
//! This crate fixes the on-the-wire record exchanged between hosts and the
//! stream codec used to move it over a byte stream:
//! - Message and handshake records (`Message`, `JoinMessage`)
//! - Identifiers (`HostId`, `Topic`, `MessageId`)
//! - CBOR encoding and length-prefixed framing
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod error;
pub mod message;

pub use codec::{DEFAULT_MAX_FRAME_SIZE, decode, encode, read_frame, write_frame};
pub use error::{WireError, WireResult};
pub use message::{HostId, JoinMessage, Message, MessageId, MessageType, Topic};
