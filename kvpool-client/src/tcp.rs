//! # TCP Transport
//!
//! Purpose: RESP2 over a tokio `TcpStream`, the default `Connector` used by
//! `Store::connect`.
//!
//! ## Design Principles
//! 1. **One Frame In Flight**: Each session sends a command and reads exactly
//!    one reply before the next command; the pool guarantees exclusivity.
//! 2. **Buffer Reuse**: The write buffer and the `BytesMut` read buffer live
//!    on the session.
//! 3. **Handshake On Connect**: AUTH and the default SELECT happen inside
//!    `connect`, so a returned session is ready for commands.

use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use kvpool_common::{BackendParams, Reply, TransportError};

use crate::resp::{encode_command, parse_reply};
use crate::transport::{Connector, Transport};

/// Opens RESP2 sessions over TCP.
///
/// Connect timeouts are applied by the factory around each attempt.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, params: &BackendParams) -> Result<Box<dyn Transport>, TransportError> {
        let stream = TcpStream::connect(params.addr()).await?;
        // Disable Nagle to keep request latency low for small payloads.
        stream.set_nodelay(true)?;

        let mut session = TcpTransport::new(stream);
        if let Some(password) = &params.password {
            let reply = match &params.username {
                Some(user) => {
                    session
                        .send_command("AUTH", &[user.as_bytes(), password.as_bytes()])
                        .await?
                }
                None => session.send_command("AUTH", &[password.as_bytes()]).await?,
            };
            expect_ok(reply)?;
        }
        if params.database != 0 {
            session.select_database(params.database).await?;
        }
        Ok(Box::new(session))
    }
}

/// A single RESP2 session.
pub struct TcpTransport {
    stream: TcpStream,
    read_buf: BytesMut,
    write_buf: Vec<u8>,
}

impl TcpTransport {
    fn new(stream: TcpStream) -> Self {
        TcpTransport {
            stream,
            read_buf: BytesMut::with_capacity(8 * 1024),
            write_buf: Vec::with_capacity(256),
        }
    }

    async fn read_reply(&mut self) -> Result<Reply, TransportError> {
        loop {
            if let Some((reply, used)) = parse_reply(&self.read_buf)? {
                self.read_buf.advance(used);
                return Ok(reply);
            }
            let bytes = self.stream.read_buf(&mut self.read_buf).await?;
            if bytes == 0 {
                return Err(TransportError::Closed);
            }
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send_command(&mut self, name: &str, args: &[&[u8]]) -> Result<Reply, TransportError> {
        self.write_buf.clear();
        encode_command(name, args, &mut self.write_buf);
        self.stream.write_all(&self.write_buf).await?;
        self.stream.flush().await?;
        self.read_reply().await
    }

    async fn select_database(&mut self, index: u32) -> Result<(), TransportError> {
        let index = index.to_string();
        let reply = self.send_command("SELECT", &[index.as_bytes()]).await?;
        expect_ok(reply)
    }

    async fn close(&mut self, flush: bool) -> Result<(), TransportError> {
        if flush {
            // QUIT is acknowledged only after earlier replies are written.
            let reply = self.send_command("QUIT", &[]).await;
            let shutdown = self.stream.shutdown().await;
            reply.and_then(expect_ok)?;
            shutdown?;
            return Ok(());
        }
        self.stream.shutdown().await?;
        Ok(())
    }
}

fn expect_ok(reply: Reply) -> Result<(), TransportError> {
    match reply {
        Reply::Simple(_) => Ok(()),
        Reply::Error(message) => Err(TransportError::Rejected(String::from_utf8_lossy(&message).into_owned())),
        other => Err(TransportError::Protocol(format!("expected status reply, got {}", other.kind()))),
    }
}
