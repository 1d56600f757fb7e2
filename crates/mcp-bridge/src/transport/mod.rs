//! Bidirectional JSON-RPC message pipes.
//!
//! Every transport yields a [`TransportStream`]: a `Stream` of inbound
//! envelopes paired with a `Sink` for outbound ones. The connection runtime in
//! [`crate::peer`] drives the stream and never needs to know which wire it is
//! talking to.

use async_trait::async_trait;
use futures::{Sink, Stream};

use crate::{
    error::{Error, Result},
    schema::JSONRPCMessage,
};

mod channel;
mod detect;
mod http;
mod sse;
mod stdio;
mod streamable;

pub use channel::{ChannelStream, ChannelTransport, Outbound};
pub use detect::{TransportKind, connect_http, detect};
pub use http::{HttpSender, MCP_PROTOCOL_VERSION_HEADER, MCP_SESSION_ID_HEADER};
pub use sse::SseTransport;
pub use stdio::{GenericDuplex, StdioTransport, StreamTransport};
pub use streamable::StreamableHttpTransport;

/// Transport trait for different connection types
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connect to the transport
    async fn connect(&mut self) -> Result<()>;

    /// Get a framed stream for reading/writing JSON-RPC messages
    fn framed(self: Box<Self>) -> Result<Box<dyn TransportStream>>;
}

/// Trait for a bidirectional stream of JSON-RPC messages.
///
/// An `Err(Error::Parse(_))` item reports a single undecodable message and
/// leaves the stream usable. Any other error item is terminal.
pub trait TransportStream:
    Stream<Item = Result<JSONRPCMessage>> + Sink<JSONRPCMessage, Error = Error> + Send + Unpin
{
}
