//! Channel stream carrying framed `ChannelMessage`s

use crate::error::{ChannelError, ChannelResult};
use bytes::BytesMut;
use quinn::{RecvStream, SendStream};
use smite_proto::{ChannelCodec, ChannelMessage};
use tracing::trace;

/// One bidirectional QUIC stream
#[derive(Debug)]
pub struct ChannelStream {
    send: SendStream,
    recv: RecvStream,
    stream_id: u64,
    send_finished: bool,
    recv_finished: bool,
    // Buffer for accumulating received data for message decoding
    recv_buffer: BytesMut,
}

impl ChannelStream {
    pub fn new(send: SendStream, recv: RecvStream) -> Self {
        let stream_id = send.id().index();
        Self {
            send,
            recv,
            stream_id,
            send_finished: false,
            recv_finished: false,
            recv_buffer: BytesMut::with_capacity(8192),
        }
    }

    pub async fn send_message(&mut self, message: &ChannelMessage) -> ChannelResult<()> {
        if self.send_finished {
            return Err(ChannelError::StreamClosed);
        }

        let encoded = ChannelCodec::encode(message)
            .map_err(|e| ChannelError::ProtocolError(e.to_string()))?;

        self.send
            .write_all(&encoded)
            .await
            .map_err(|e| ChannelError::ConnectionError(e.to_string()))?;

        trace!(stream_id = self.stream_id, kind = message.kind(), "Sent message");
        Ok(())
    }

    /// Receive the next message; `None` once the peer finished the stream
    pub async fn recv_message(&mut self) -> ChannelResult<Option<ChannelMessage>> {
        loop {
            if let Some(message) = ChannelCodec::decode(&mut self.recv_buffer)
                .map_err(|e| ChannelError::ProtocolError(e.to_string()))?
            {
                trace!(stream_id = self.stream_id, kind = message.kind(), "Received message");
                return Ok(Some(message));
            }

            if self.recv_finished {
                return Ok(None);
            }

            // Need more data - read from stream
            match self.recv.read_chunk(8192, true).await {
                Ok(Some(chunk)) => {
                    self.recv_buffer.extend_from_slice(&chunk.bytes);
                }
                Ok(None) => {
                    self.recv_finished = true;
                    if !self.recv_buffer.is_empty() {
                        return Err(ChannelError::ProtocolError(
                            "Incomplete message in buffer".to_string(),
                        ));
                    }
                    return Ok(None);
                }
                Err(quinn::ReadError::ConnectionLost(e)) => {
                    self.recv_finished = true;
                    return Err(crate::error::from_connection_error(e));
                }
                Err(e) => {
                    self.recv_finished = true;
                    return Err(ChannelError::ConnectionError(e.to_string()));
                }
            }
        }
    }

    /// Receive a message that must be present
    pub async fn expect_message(&mut self) -> ChannelResult<ChannelMessage> {
        self.recv_message()
            .await?
            .ok_or(ChannelError::StreamClosed)
    }

    /// Send one request and wait for its single reply
    pub async fn request(&mut self, message: &ChannelMessage) -> ChannelResult<ChannelMessage> {
        self.send_message(message).await?;
        self.finish()?;
        self.expect_message().await
    }

    /// Gracefully close the sending half
    pub fn finish(&mut self) -> ChannelResult<()> {
        if self.send_finished {
            return Ok(());
        }

        self.send
            .finish()
            .map_err(|e| ChannelError::ConnectionError(e.to_string()))?;
        self.send_finished = true;
        Ok(())
    }

    pub fn stream_id(&self) -> u64 {
        self.stream_id
    }
}
