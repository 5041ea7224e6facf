//! A frame-level client that bypasses `herd-client`, for tests that need
//! to misbehave: wrong first frames, unknown kinds, unanswered pings,
//! hand-rolled bytes.

use herd_protocol::{
    ClientHello, CodecError, Message, PROTOCOL_VERSION, read_frame, write_frame,
};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

pub struct RawClient {
    stream: TcpStream,
}

impl RawClient {
    pub async fn connect(addr: SocketAddr) -> RawClient {
        let stream = timeout(RECV_TIMEOUT, TcpStream::connect(addr))
            .await
            .expect("timeout connecting")
            .expect("connect failed");
        RawClient { stream }
    }

    /// Send a well-formed hello, as the first step of tests that go on to
    /// misbehave later.
    pub async fn send_hello(&mut self, hostname: &str) {
        let hello = Message::ClientHello(ClientHello {
            hostname: hostname.to_owned(),
            info: "raw-client".to_owned(),
            version: env!("CARGO_PKG_VERSION").to_owned(),
            protocol_version: PROTOCOL_VERSION,
        });
        self.send(&hello).await;
    }

    pub async fn send(&mut self, message: &Message) {
        write_frame(&mut self.stream, message)
            .await
            .expect("frame write failed");
    }

    /// Write arbitrary bytes, framing and all.
    pub async fn send_bytes(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.expect("byte write failed");
    }

    pub async fn recv(&mut self) -> Result<Message, CodecError> {
        timeout(RECV_TIMEOUT, read_frame(&mut self.stream))
            .await
            .expect("timeout waiting for a frame")
    }

    /// Expect the hub's hello reply.
    pub async fn expect_server_hello(&mut self) {
        match self.recv().await {
            Ok(Message::ServerHello(_)) => {}
            other => panic!("expected server_hello, got {other:?}"),
        }
    }

    /// Read until the hub closes the socket, skipping data frames.
    /// Panics if the close does not arrive within the receive timeout.
    pub async fn expect_closed(&mut self) {
        let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            match timeout(remaining, read_frame(&mut self.stream)).await {
                Ok(Err(_)) => return,
                Ok(Ok(_)) => {}
                Err(_) => panic!("hub did not close the connection"),
            }
        }
    }
}
