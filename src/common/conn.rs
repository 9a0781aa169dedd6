//! Peer connections
//!
//! One request line out, one response line back, over a plain TCP stream.
//! Used for every conversation in the cluster: client->node,
//! coordinator->node control pushes, node->node replication and hand-off,
//! and node->coordinator registration.

use crate::common::proto::{Request, Response};
use crate::common::ring::NodeAddr;
use crate::common::{Error, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

pub struct PeerConnection {
    addr: NodeAddr,
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl PeerConnection {
    /// Connect to a peer's listening port.
    pub async fn open(addr: &NodeAddr) -> Result<Self> {
        let stream = TcpStream::connect((addr.host.as_str(), addr.port))
            .await
            .map_err(|e| Error::PeerUnreachable(format!("{}: {}", addr, e)))?;
        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            addr: addr.clone(),
            reader: BufReader::new(read_half),
            writer: write_half,
        })
    }

    pub fn addr(&self) -> &NodeAddr {
        &self.addr
    }

    /// Send one request and wait for the single response line.
    pub async fn request(&mut self, req: &Request) -> Result<Response> {
        let line = format!("{}\r\n", req);
        self.writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| Error::PeerUnreachable(format!("{}: {}", self.addr, e)))?;

        let mut response = String::new();
        let n = self
            .reader
            .read_line(&mut response)
            .await
            .map_err(|e| Error::PeerUnreachable(format!("{}: {}", self.addr, e)))?;
        if n == 0 {
            return Err(Error::PeerUnreachable(format!(
                "{}: connection closed",
                self.addr
            )));
        }
        Response::parse(&response)
    }

    /// Liveness probe: a `ping` answered by `ack`.
    pub async fn ping(&mut self) -> Result<()> {
        match self.request(&Request::Ping).await? {
            Response::Ack => Ok(()),
            other => Err(Error::Protocol(format!(
                "unexpected ping reply: {}",
                other
            ))),
        }
    }
}
