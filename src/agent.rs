//! The event contract between a connection and application code.

use crate::connection::Connection;
use crate::error::Error;
use crate::packet::Packet;
use std::sync::Arc;
use tracing::warn;

/// Receives lifecycle and message events for connections.
///
/// Callbacks run on the connection's own tasks: `on_message` on the
/// dispatch task, `on_error` on the supervisor. They must not block
/// indefinitely. An agent may call back into the connection, e.g. with
/// [`Connection::write_packet`].
pub trait Agent: Send + Sync + 'static {
    /// The connection started serving.
    fn on_connected(&self, _conn: &Arc<Connection>) {}

    /// One inbound packet, delivered in arrival order.
    fn on_message(&self, conn: &Arc<Connection>, packet: Packet);

    /// The connection closed. Called exactly once per connection.
    fn on_disconnected(&self, _conn: &Arc<Connection>) {}

    /// A read or write loop failed.
    fn on_error(&self, err: &Error) {
        warn!(error = %err, "Connection error");
    }
}
