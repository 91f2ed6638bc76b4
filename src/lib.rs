//! tcp-conn-core: a TCP connection core.
//!
//! Accepts or opens TCP connections, frames messages over them with a
//! pluggable [`Protocol`], and hands complete [`Packet`]s to an
//! application [`Agent`].
//!
//! Features:
//! - Length-prefixed framing with a configurable maximum frame size
//! - Per-connection read, dispatch and write tasks over bounded queues
//! - Fail-fast and timed sends with backpressure
//! - Exactly-once close with a single disconnect notification
//! - Accept loop with exponential backoff and a self-cleaning registry
//!
//! ```no_run
//! use std::sync::Arc;
//! use tcp_conn_core::{Agent, Connection, LengthPrefixed, Packet, Server};
//!
//! struct Echo;
//!
//! impl Agent for Echo {
//!     fn on_message(&self, conn: &Arc<Connection>, packet: Packet) {
//!         let _ = conn.write_packet(packet);
//!     }
//! }
//!
//! # async fn run() -> tcp_conn_core::Result<()> {
//! let server = Server::new("127.0.0.1:9001", Arc::new(Echo), Arc::new(LengthPrefixed::new()));
//! server.listen_and_serve().await?;
//! server.wait().await
//! # }
//! ```

pub mod agent;
pub mod connection;
pub mod error;
pub mod packet;
pub mod protocol;
pub mod registry;
pub mod server;

pub use agent::Agent;
pub use connection::{ConnState, Connection};
pub use error::{Error, Result};
pub use packet::Packet;
pub use protocol::{LengthPrefixed, Protocol};
pub use registry::Registry;
pub use server::Server;
