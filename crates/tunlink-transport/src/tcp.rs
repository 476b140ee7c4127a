//! Plain TCP connector, frames written directly on the stream

use crate::{framed_connection, ChannelKind, Connector, FramedConnection, TransportResult};
use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::debug;

/// Connects to a broker speaking length-prefixed frames over raw TCP
#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: String,
}

impl TcpConnector {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, kind: ChannelKind) -> TransportResult<FramedConnection> {
        debug!("Connecting to {} over TCP ({:?})", self.addr, kind);
        let stream = TcpStream::connect(&self.addr).await?;
        stream.set_nodelay(true)?;

        let id = match stream.local_addr() {
            Ok(addr) => format!("tcp-{}", addr),
            Err(_) => format!("tcp-{}", self.addr),
        };
        Ok(framed_connection(stream, id))
    }

    fn describe(&self) -> String {
        format!("tcp://{}", self.addr)
    }
}
