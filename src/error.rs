//! Error types shared by the protocol, connection and server layers.

use std::io;

/// Errors surfaced by connections, protocols and the server.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The connection has already been closed.
    #[error("use of closed network connection")]
    ConnectionClosed,

    /// The outbound queue is at capacity.
    #[error("the async send buffer is full")]
    BufferFull,

    /// The outbound queue stayed full for the whole timeout.
    #[error("async write packet timeout")]
    WriteTimeout,

    /// A frame declared (or would need) more bytes than allowed.
    #[error("packet too large ({size} > {max})")]
    PacketTooLarge {
        /// Declared frame length.
        size: u64,
        /// Maximum accepted frame length.
        max: u64,
    },

    /// A frame too short to carry its type byte.
    #[error("malformed frame: declared length {length}")]
    MalformedFrame {
        /// Declared frame length.
        length: u32,
    },

    /// `serve` was called without both an agent and a protocol bound.
    #[error("agent and protocol must both be set")]
    MissingAgentOrProtocol,

    /// The read loop owns the socket, or the connection is already serving.
    #[error("connection is already serving")]
    AlreadyServing,

    /// An agent callback panicked while setting up the connection.
    #[error("agent panicked in {callback}")]
    AgentPanicked {
        /// Name of the callback.
        callback: &'static str,
    },

    /// The stream ended cleanly before any byte of a new frame.
    #[error("end of stream")]
    Eof,

    /// An address did not resolve to any IPv4 endpoint.
    #[error("could not resolve {addr} to an IPv4 address")]
    AddrResolve {
        /// The address as given.
        addr: String,
    },

    /// Underlying socket error.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// Returns true for a clean end of stream.
    pub fn is_eof(&self) -> bool {
        matches!(self, Error::Eof)
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        assert_eq!(
            Error::ConnectionClosed.to_string(),
            "use of closed network connection"
        );
        assert_eq!(
            Error::PacketTooLarge { size: 2048, max: 1024 }.to_string(),
            "packet too large (2048 > 1024)"
        );
    }

    #[test]
    fn test_eof_is_distinct_from_io() {
        assert!(Error::Eof.is_eof());
        let io = Error::from(io::Error::from(io::ErrorKind::UnexpectedEof));
        assert!(!io.is_eof());
    }
}
