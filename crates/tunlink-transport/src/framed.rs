//! Adapter from any byte stream to a framed connection

use crate::{FrameSink, FrameSource, FramedConnection, TransportResult};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;
use tunlink_proto::FrameCodec;

/// Wrap a byte stream in the length-prefixed frame codec and split it
pub fn framed_connection<T>(io: T, id: impl Into<String>) -> FramedConnection
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (sink, source) = Framed::new(io, FrameCodec::new()).split();

    FramedConnection {
        id: id.into(),
        sink: Box::new(CodecSink { inner: sink }),
        source: Box::new(CodecSource { inner: source }),
    }
}

struct CodecSink<T> {
    inner: SplitSink<Framed<T, FrameCodec>, Bytes>,
}

#[async_trait]
impl<T> FrameSink for CodecSink<T>
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    async fn send(&mut self, frame: Bytes) -> TransportResult<()> {
        self.inner.send(frame).await?;
        Ok(())
    }

    async fn close(&mut self) -> TransportResult<()> {
        self.inner.close().await?;
        Ok(())
    }
}

struct CodecSource<T> {
    inner: SplitStream<Framed<T, FrameCodec>>,
}

#[async_trait]
impl<T> FrameSource for CodecSource<T>
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    async fn recv(&mut self) -> TransportResult<Option<Bytes>> {
        match self.inner.next().await {
            Some(Ok(frame)) => Ok(Some(frame)),
            Some(Err(e)) => Err(e.into()),
            None => Ok(None),
        }
    }
}
