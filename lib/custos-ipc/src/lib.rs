//! Inter-process messaging between supervisors and external worker processes.
//!
//! Messages are [`Message`] envelopes carrying a kind, a correlation identifier, and a JSON payload. On the wire, each
//! envelope is serialized as JSON and prefixed with its length as a 4-byte big-endian integer (see [`MessageCodec`]).
//!
//! A [`Connection`] multiplexes any number of concurrent calls over a single bidirectional byte stream, matching
//! responses to calls solely by correlation identifier. Connections can be established over the standard I/O of a
//! child process, a Unix domain socket, or a TCP socket (see [`transport`]).
//!
//! The [`worker`] module provides the other end: running a generic server inside an external worker process.
#![deny(warnings)]
#![deny(missing_docs)]

use std::{io, time::Duration};

use snafu::Snafu;

mod codec;
pub use self::codec::{MessageCodec, DEFAULT_MAX_FRAME_LEN};
use self::codec::FrameDecoder;

mod connection;
pub use self::connection::{Connection, Incoming};

mod message;
pub use self::message::{control, Message, MessageKind};

pub mod transport;

pub mod worker;

/// IPC errors.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)), visibility(pub(crate)))]
pub enum IpcError {
    /// An I/O error occurred on the underlying stream.
    #[snafu(display("I/O error: {}", source))]
    Io {
        /// The underlying I/O error.
        source: io::Error,
    },

    /// A frame exceeded the maximum frame length.
    #[snafu(display("Frame length {} exceeds maximum of {} bytes.", frame_len, max_frame_len))]
    FrameTooLarge {
        /// Length of the offending frame.
        frame_len: usize,

        /// Maximum allowed frame length.
        max_frame_len: usize,
    },

    /// A frame could not be decoded as a message envelope.
    #[snafu(display("Malformed frame: {}", source))]
    MalformedFrame {
        /// The underlying decoding error.
        source: serde_json::Error,
    },

    /// A message could not be encoded.
    #[snafu(display("Failed to encode message: {}", source))]
    Encode {
        /// The underlying encoding error.
        source: serde_json::Error,
    },

    /// The connection is closed.
    #[snafu(display("Connection closed."))]
    ConnectionClosed,

    /// No response was received within the timeout.
    #[snafu(display("No response received within {:?}.", timeout))]
    Timeout {
        /// The timeout that elapsed.
        timeout: Duration,
    },

    /// The peer answered a call with an error.
    #[snafu(display("Peer returned an error: {}", message))]
    Remote {
        /// The error message sent by the peer.
        message: String,
    },

    /// Failed to establish a connection.
    #[snafu(display("Failed to connect to '{}': {}", address, source))]
    Connect {
        /// The address that could not be reached.
        address: String,

        /// The underlying I/O error.
        source: io::Error,
    },

    /// An environment variable describing the transport is invalid.
    #[snafu(display("Invalid value '{}' for environment variable '{}'.", value, var))]
    InvalidEnvironment {
        /// The environment variable.
        var: &'static str,

        /// The invalid value.
        value: String,
    },
}

impl From<io::Error> for IpcError {
    fn from(source: io::Error) -> Self {
        Self::Io { source }
    }
}
