//! Authenticated channel connection

use crate::error::{from_connection_error, ChannelError, ChannelResult};
use crate::stream::ChannelStream;
use quinn::rustls::pki_types::CertificateDer;
use quinn::Connection;
use smite_cert::inspect_certificate_der;
use std::net::SocketAddr;
use std::time::Instant;
use tracing::{debug, trace};

/// QUIC connection whose peer presented a CA-signed certificate
#[derive(Debug, Clone)]
pub struct ChannelConnection {
    inner: Connection,
    connection_id: String,
    created_at: Instant,
}

impl ChannelConnection {
    pub fn new(connection: Connection) -> Self {
        let connection_id = format!("quic-{}", connection.stable_id());

        Self {
            inner: connection,
            connection_id,
            created_at: Instant::now(),
        }
    }

    /// Open a new bidirectional stream
    pub async fn open_stream(&self) -> ChannelResult<ChannelStream> {
        let (send, recv) = self.inner.open_bi().await.map_err(from_connection_error)?;

        trace!(connection_id = %self.connection_id, stream_id = send.id().index(), "Opened stream");
        Ok(ChannelStream::new(send, recv))
    }

    /// Accept the next peer-opened stream; `None` once the connection is gone
    pub async fn accept_stream(&self) -> ChannelResult<Option<ChannelStream>> {
        match self.inner.accept_bi().await {
            Ok((send, recv)) => {
                trace!(connection_id = %self.connection_id, stream_id = send.id().index(), "Accepted stream");
                Ok(Some(ChannelStream::new(send, recv)))
            }
            Err(quinn::ConnectionError::ApplicationClosed(_))
            | Err(quinn::ConnectionError::ConnectionClosed(_))
            | Err(quinn::ConnectionError::LocallyClosed)
            | Err(quinn::ConnectionError::TimedOut)
            | Err(quinn::ConnectionError::Reset) => {
                debug!(connection_id = %self.connection_id, "Connection closed");
                Ok(None)
            }
            Err(e) => Err(from_connection_error(e)),
        }
    }

    pub fn close(&self, error_code: u32, reason: &str) {
        self.inner
            .close(quinn::VarInt::from_u32(error_code), reason.as_bytes());

        debug!(
            connection_id = %self.connection_id,
            code = error_code,
            reason,
            "Channel connection closed"
        );
    }

    /// Wait until the connection is closed for any reason
    pub async fn closed(&self) -> ChannelError {
        from_connection_error(self.inner.closed().await)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.close_reason().is_some()
    }

    pub fn remote_address(&self) -> SocketAddr {
        self.inner.remote_address()
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn uptime_secs(&self) -> u64 {
        self.created_at.elapsed().as_secs()
    }

    /// Common name of the certificate the peer authenticated with
    pub fn peer_common_name(&self) -> ChannelResult<String> {
        let identity = self
            .inner
            .peer_identity()
            .ok_or_else(|| ChannelError::CertificateRejected("peer sent no certificate".to_string()))?;
        let chain = identity
            .downcast::<Vec<CertificateDer<'static>>>()
            .map_err(|_| ChannelError::TlsError("unexpected peer identity type".to_string()))?;
        let leaf = chain
            .first()
            .ok_or_else(|| ChannelError::CertificateRejected("empty peer certificate chain".to_string()))?;

        let info = inspect_certificate_der(leaf)?;
        Ok(info.subject_cn)
    }
}
