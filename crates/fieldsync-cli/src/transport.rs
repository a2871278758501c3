use fieldsync_core::transport::{BatchResult, OutboundOperation};
use fieldsync_core::{HttpTransport, Transport, TransportError};

/// HTTP when a remote is configured; local-only commands work without one
pub enum CliTransport {
    Http(HttpTransport),
    Unconfigured,
}

impl Transport for CliTransport {
    async fn send(&self, batch: &[OutboundOperation]) -> Result<BatchResult, TransportError> {
        match self {
            Self::Http(transport) => transport.send(batch).await,
            Self::Unconfigured => Err(TransportError::Unreachable(
                "no remote configured".to_string(),
            )),
        }
    }
}
