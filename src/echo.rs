//! Echo agent and greeting client used by the demo binary.
//!
//! ```text
//! Client sends:  [len][type=1]"hello world0"
//! Server echoes: [len][type=1]"hello world0"
//! ```

use std::sync::Arc;
use std::time::Duration;
use tcp_conn_core::{Agent, Connection, Error, Packet};
use tracing::{info, warn};

/// Type tag of greeting packets.
pub const GREETING_KIND: u8 = 1;

/// Logs every event; on the server side also echoes each packet back.
pub struct EchoAgent {
    echo: bool,
}

impl EchoAgent {
    pub fn server() -> Self {
        Self { echo: true }
    }

    pub fn client() -> Self {
        Self { echo: false }
    }
}

impl Agent for EchoAgent {
    fn on_connected(&self, conn: &Arc<Connection>) {
        info!(peer = %conn.peer_addr(), "New connection");
    }

    fn on_message(&self, conn: &Arc<Connection>, packet: Packet) {
        info!(
            peer = %conn.peer_addr(),
            kind = packet.kind(),
            body = %String::from_utf8_lossy(packet.body()),
            "Received"
        );

        if self.echo {
            if let Err(e) = conn.write_packet(packet) {
                warn!(peer = %conn.peer_addr(), error = %e, "Echo dropped");
            }
        }
    }

    fn on_disconnected(&self, conn: &Arc<Connection>) {
        info!(peer = %conn.peer_ip(), "Disconnected");
    }

    fn on_error(&self, err: &Error) {
        warn!(error = %err, "Connection error");
    }
}

/// Send a numbered greeting every `interval` until the connection closes.
pub async fn greet(conn: Arc<Connection>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    let mut seq: u64 = 0;

    while !conn.is_closed() {
        ticker.tick().await;

        let msg = format!("hello world{seq}");
        info!(msg = %msg, "Client send");
        match conn.write_packet(Packet::new(GREETING_KIND, msg.into_bytes())) {
            Ok(()) => seq += 1,
            Err(Error::ConnectionClosed) => break,
            Err(e) => warn!(error = %e, "Greeting dropped"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tcp_conn_core::{LengthPrefixed, Protocol};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::mpsc;

    struct Forward(mpsc::UnboundedSender<Packet>);

    impl Agent for Forward {
        fn on_message(&self, _conn: &Arc<Connection>, packet: Packet) {
            let _ = self.0.send(packet);
        }
    }

    #[tokio::test]
    async fn test_greetings_are_echoed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());

        let protocol: Arc<dyn Protocol> = Arc::new(LengthPrefixed::new());
        let server_side = Connection::new(
            accepted.unwrap().0,
            Some(Arc::new(EchoAgent::server())),
            Some(Arc::clone(&protocol)),
        )
        .unwrap();
        server_side.serve().unwrap();

        let (tx, mut echoed) = mpsc::unbounded_channel();
        let client_side =
            Connection::new(client.unwrap(), Some(Arc::new(Forward(tx))), Some(protocol)).unwrap();
        client_side.serve().unwrap();
        let greeter = tokio::spawn(greet(Arc::clone(&client_side), Duration::from_millis(5)));

        for seq in 0..3 {
            let packet = tokio::time::timeout(Duration::from_secs(5), echoed.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(packet.kind(), GREETING_KIND);
            assert_eq!(packet.body().as_ref(), format!("hello world{seq}").as_bytes());
        }

        client_side.close();
        greeter.await.unwrap();
    }
}
