//! QUIC client used by the orchestrator side to issue CSI requests.

use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use quinn::crypto::rustls::QuicClientConfig;
use tracing::{debug, instrument};

use super::MAX_MESSAGE_BYTES;
use crate::error::CsiError;
use crate::message::CsiMessage;
use crate::types::PluginInfo;

/// Upper bound on one request/response exchange unless overridden.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Sends [`CsiMessage`] requests to a plugin over a single QUIC connection.
///
/// Every exchange is bounded by the client's request timeout, so a plugin
/// stuck on a backend or a hung mount surfaces as a transport error.
pub struct CsiClient {
    connection: quinn::Connection,
    timeout: Duration,
}

impl CsiClient {
    /// Establish a new QUIC connection to the CSI server at `addr`.
    ///
    /// * `addr` — socket address of the remote CSI server
    /// * `server_name` — TLS SNI name that must match a SAN in the server's
    ///   certificate
    /// * `tls_config` — client TLS configuration trusting the server's CA
    pub async fn connect(
        addr: SocketAddr,
        server_name: &str,
        tls_config: rustls::ClientConfig,
    ) -> Result<Self, CsiError> {
        let quic_client_config = QuicClientConfig::try_from(tls_config)
            .map_err(|e| CsiError::TransportError(format!("invalid TLS config: {e}")))?;
        let client_config = quinn::ClientConfig::new(Arc::new(quic_client_config));

        let bind = SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0));
        let mut endpoint = quinn::Endpoint::client(bind).map_err(CsiError::transport)?;
        endpoint.set_default_client_config(client_config);

        let connection = endpoint
            .connect(addr, server_name)
            .map_err(CsiError::transport)?
            .await
            .map_err(CsiError::transport)?;

        debug!(%addr, %server_name, "CSI QUIC connection established");
        Ok(Self {
            connection,
            timeout: DEFAULT_REQUEST_TIMEOUT,
        })
    }

    /// Bound each exchange by `timeout` instead of [`DEFAULT_REQUEST_TIMEOUT`].
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Send a request and wait for the corresponding response.
    ///
    /// Each call opens a new bi-directional QUIC stream, writes the
    /// JSON-serialized request, finishes the send side, then reads the
    /// full response.
    #[instrument(skip(self), fields(msg = %msg))]
    pub async fn request(&self, msg: &CsiMessage) -> Result<CsiMessage, CsiError> {
        within(self.timeout, msg, self.exchange(msg)).await
    }

    async fn exchange(&self, msg: &CsiMessage) -> Result<CsiMessage, CsiError> {
        let (mut send, mut recv) = self
            .connection
            .open_bi()
            .await
            .map_err(CsiError::transport)?;

        let payload = serde_json::to_vec(msg).map_err(CsiError::internal)?;
        send.write_all(&payload)
            .await
            .map_err(CsiError::transport)?;
        send.finish().map_err(CsiError::transport)?;

        let buf = recv
            .read_to_end(MAX_MESSAGE_BYTES)
            .await
            .map_err(CsiError::transport)?;

        let response: CsiMessage = serde_json::from_slice(&buf).map_err(CsiError::transport)?;
        debug!(%response, "CSI response received");
        Ok(response)
    }

    /// Like [`request`](Self::request), but a [`CsiMessage::Error`] reply is
    /// returned as `Err`.
    pub async fn call(&self, msg: &CsiMessage) -> Result<CsiMessage, CsiError> {
        match self.request(msg).await? {
            CsiMessage::Error(e) => Err(e),
            response => Ok(response),
        }
    }

    /// Ask the plugin for its identity and readiness.
    pub async fn probe(&self) -> Result<(PluginInfo, bool), CsiError> {
        let info = match self.call(&CsiMessage::GetPluginInfo).await? {
            CsiMessage::PluginInfoResponse(info) => info,
            other => return Err(unexpected("GetPluginInfo", &other)),
        };
        let ready = match self.call(&CsiMessage::Probe).await? {
            CsiMessage::ProbeResult(ready) => ready,
            other => return Err(unexpected("Probe", &other)),
        };
        Ok((info, ready))
    }

    /// Close the underlying QUIC connection gracefully.
    pub fn close(&self) {
        self.connection
            .close(quinn::VarInt::from_u32(0), b"client shutdown");
    }
}

async fn within<T>(
    timeout: Duration,
    msg: &CsiMessage,
    exchange: impl Future<Output = Result<T, CsiError>>,
) -> Result<T, CsiError> {
    tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| CsiError::TransportError(format!("{msg}: no response within {timeout:?}")))?
}

fn unexpected(rpc: &str, response: &CsiMessage) -> CsiError {
    CsiError::TransportError(format!("unexpected response to {rpc}: {response}"))
}
