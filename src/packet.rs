//! Application messages carried over a connection.

use bytes::Bytes;

/// One complete application message: a type tag plus an opaque body.
///
/// Packets are immutable. Cloning is cheap since the body is reference
/// counted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    kind: u8,
    body: Bytes,
}

impl Packet {
    /// Create a packet with the given type tag and body.
    pub fn new(kind: u8, body: impl Into<Bytes>) -> Self {
        Self {
            kind,
            body: body.into(),
        }
    }

    /// Application-defined type tag.
    pub fn kind(&self) -> u8 {
        self.kind
    }

    /// Payload bytes.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Consume the packet, returning its body.
    pub fn into_body(self) -> Bytes {
        self.body
    }

    /// Number of bytes in the body.
    pub fn len(&self) -> usize {
        self.body.len()
    }

    /// True when the body is empty.
    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_accessors() {
        let packet = Packet::new(7, &b"hello"[..]);
        assert_eq!(packet.kind(), 7);
        assert_eq!(packet.body().as_ref(), b"hello");
        assert_eq!(packet.len(), 5);
        assert!(!packet.is_empty());
        assert_eq!(packet.into_body(), Bytes::from_static(b"hello"));
    }

    #[test]
    fn test_empty_body() {
        let packet = Packet::new(0, Vec::new());
        assert!(packet.is_empty());
    }
}
