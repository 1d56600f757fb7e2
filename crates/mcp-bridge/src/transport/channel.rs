use std::{
    pin::Pin,
    task::{Context, Poll},
};

use async_trait::async_trait;
use futures::{Sink, Stream, StreamExt, channel::mpsc};
use tokio_util::sync::DropGuard;

use super::{Transport, TransportStream};
use crate::{
    error::{Error, Result},
    schema::JSONRPCMessage,
};

/// Where a [`ChannelStream`] delivers outbound envelopes.
pub trait Outbound: Send + Sync {
    fn deliver(&self, message: JSONRPCMessage) -> Result<()>;
}

impl Outbound for mpsc::UnboundedSender<JSONRPCMessage> {
    fn deliver(&self, message: JSONRPCMessage) -> Result<()> {
        self.unbounded_send(message)
            .map_err(|_| Error::ConnectionClosed)
    }
}

impl Outbound for mpsc::UnboundedSender<Result<JSONRPCMessage>> {
    fn deliver(&self, message: JSONRPCMessage) -> Result<()> {
        self.unbounded_send(Ok(message))
            .map_err(|_| Error::ConnectionClosed)
    }
}

/// A transport backed by in-memory channels. Used for the in-process client
/// facade, for HTTP sessions on the server side, and as the message pump of
/// the HTTP client transports.
pub struct ChannelTransport {
    outbound: Box<dyn Outbound>,
    inbound: mpsc::UnboundedReceiver<Result<JSONRPCMessage>>,
    guard: Option<DropGuard>,
}

impl ChannelTransport {
    pub fn new(
        outbound: impl Outbound + 'static,
        inbound: mpsc::UnboundedReceiver<Result<JSONRPCMessage>>,
    ) -> Self {
        Self {
            outbound: Box::new(outbound),
            inbound,
            guard: None,
        }
    }

    /// Keep `guard` alive for as long as the framed stream lives. Background
    /// tasks feeding the channels watch the guarded token.
    pub fn with_guard(mut self, guard: DropGuard) -> Self {
        self.guard = Some(guard);
        self
    }

    /// Two transports wired back to back.
    pub fn pair() -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::unbounded();
        let (b_tx, b_rx) = mpsc::unbounded();
        (Self::new(b_tx, a_rx), Self::new(a_tx, b_rx))
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn connect(&mut self) -> Result<()> {
        Ok(())
    }

    fn framed(self: Box<Self>) -> Result<Box<dyn TransportStream>> {
        Ok(Box::new(ChannelStream {
            outbound: self.outbound,
            inbound: self.inbound,
            _guard: self.guard,
        }))
    }
}

pub struct ChannelStream {
    outbound: Box<dyn Outbound>,
    inbound: mpsc::UnboundedReceiver<Result<JSONRPCMessage>>,
    _guard: Option<DropGuard>,
}

impl Stream for ChannelStream {
    type Item = Result<JSONRPCMessage>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inbound.poll_next_unpin(cx)
    }
}

impl Sink<JSONRPCMessage> for ChannelStream {
    type Error = Error;

    fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn start_send(self: Pin<&mut Self>, item: JSONRPCMessage) -> Result<()> {
        self.outbound.deliver(item)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<()>> {
        Poll::Ready(Ok(()))
    }
}

impl TransportStream for ChannelStream {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::JSONRPCNotification;
    use futures::SinkExt;

    #[tokio::test]
    async fn test_pair_is_crossed() {
        let (a, b) = ChannelTransport::pair();
        let mut a = Box::new(a).framed().unwrap();
        let mut b = Box::new(b).framed().unwrap();

        a.send(JSONRPCMessage::Notification(JSONRPCNotification::new("one", None)))
            .await
            .unwrap();
        let got = b.next().await.unwrap().unwrap();
        assert_eq!(got.method(), Some("one"));

        drop(a);
        assert!(b.next().await.is_none());
    }
}
