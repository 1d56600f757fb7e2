use std::{
    pin::Pin,
    task::{Context, Poll},
};

use bytes::{BufMut, BytesMut};
use futures::{Sink, Stream};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Decoder, Encoder, Framed};
use tracing::{debug, warn};

use crate::{
    error::{Error, Result},
    schema::JSONRPCMessage,
};

/// JSON-RPC codec for encoding/decoding messages over a stream.
/// Uses newline-delimited JSON format.
///
/// A line that is not a valid envelope decodes to an inner `Err(Error::Parse)`
/// rather than failing the decoder, so a single bad line never tears down the
/// framed stream.
pub struct JsonRpcCodec;

impl JsonRpcCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Default for JsonRpcCodec {
    fn default() -> Self {
        Self::new()
    }
}

/// Decode one envelope from a complete buffer.
pub fn decode_message(bytes: &[u8]) -> Result<JSONRPCMessage> {
    serde_json::from_slice(bytes).map_err(|e| {
        let text = String::from_utf8_lossy(bytes);
        warn!("Failed to parse JSON-RPC message: {}", e);
        Error::Parse(format!("{e} (content: {text})"))
    })
}

/// Encode one envelope without a trailing delimiter.
pub fn encode_message(message: &JSONRPCMessage) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(message)?)
}

impl Decoder for JsonRpcCodec {
    type Error = Error;
    type Item = Result<JSONRPCMessage>;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        loop {
            let Some(n) = src.iter().position(|b| *b == b'\n') else {
                return Ok(None);
            };
            let line = src.split_to(n + 1);
            let body = line[..line.len() - 1].trim_ascii();
            if body.is_empty() {
                continue;
            }
            debug!("Decoding JSON-RPC message: {:?}", std::str::from_utf8(body));
            return Ok(Some(decode_message(body)));
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if let Some(item) = self.decode(src)? {
            return Ok(Some(item));
        }
        // A final line without a newline is still a message.
        let body = src.split().freeze();
        let body = body.trim_ascii();
        if body.is_empty() {
            return Ok(None);
        }
        Ok(Some(decode_message(body)))
    }
}

impl Encoder<JSONRPCMessage> for JsonRpcCodec {
    type Error = Error;

    fn encode(&mut self, item: JSONRPCMessage, dst: &mut BytesMut) -> Result<()> {
        let json = encode_message(&item)?;
        dst.reserve(json.len() + 1);
        dst.put_slice(&json);
        dst.put_u8(b'\n');
        debug!("Encoded JSON-RPC message: {:?}", std::str::from_utf8(&json));
        Ok(())
    }
}

/// A framed byte stream that yields envelopes, with per-line parse failures
/// surfaced as stream items.
pub struct CodecStream<T> {
    inner: Framed<T, JsonRpcCodec>,
}

impl<T> CodecStream<T>
where
    T: AsyncRead + AsyncWrite,
{
    pub fn new(io: T) -> Self {
        Self {
            inner: Framed::new(io, JsonRpcCodec::new()),
        }
    }
}

impl<T> Stream for CodecStream<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    type Item = Result<JSONRPCMessage>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(item))) => Poll::Ready(Some(item)),
            Poll::Ready(Some(Err(e))) => Poll::Ready(Some(Err(e))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T> Sink<JSONRPCMessage> for CodecStream<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    type Error = Error;

    fn poll_ready(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<()>> {
        Pin::new(&mut self.inner).poll_ready(cx)
    }

    fn start_send(mut self: Pin<&mut Self>, item: JSONRPCMessage) -> Result<()> {
        Pin::new(&mut self.inner).start_send(item)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<()>> {
        Pin::new(&mut self.inner).poll_close(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{JSONRPCRequest, RequestId};

    #[test]
    fn test_encode_decode_request() {
        let mut codec = JsonRpcCodec::new();
        let mut buf = BytesMut::new();

        let request =
            JSONRPCRequest::new(RequestId::String("test-1".to_string()), "initialize", None);
        codec
            .encode(JSONRPCMessage::Request(request), &mut buf)
            .unwrap();

        let decoded = codec.decode(&mut buf).unwrap().unwrap().unwrap();
        match decoded {
            JSONRPCMessage::Request(req) => {
                assert_eq!(req.id, RequestId::String("test-1".to_string()));
                assert_eq!(req.method, "initialize");
            }
            _ => panic!("Expected request message"),
        }
    }

    #[test]
    fn test_bad_line_does_not_poison_stream() {
        let mut codec = JsonRpcCodec::new();
        let mut buf = BytesMut::from(
            &b"{not json}\n\n{\"jsonrpc\":\"2.0\",\"id\":3,\"method\":\"ping\"}\n"[..],
        );

        let first = codec.decode(&mut buf).unwrap().unwrap();
        assert!(matches!(first, Err(Error::Parse(_))));

        let second = codec.decode(&mut buf).unwrap().unwrap().unwrap();
        assert_eq!(second.method(), Some("ping"));
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_partial_line_waits() {
        let mut codec = JsonRpcCodec::new();
        let mut buf = BytesMut::from(&b"{\"jsonrpc\":\"2.0\",\"method\":\"x\""[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"}\n");
        let msg = codec.decode(&mut buf).unwrap().unwrap().unwrap();
        assert!(matches!(msg, JSONRPCMessage::Notification(_)));
    }
}
