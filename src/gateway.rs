//! The narrow seam to the radio network. Everything below this trait —
//! network server, MAC layer, frame encoding — is somebody else's problem;
//! the dispatcher only needs a verdict per attempt.

use async_trait::async_trait;
use tracing::info;
use ulid::Ulid;

/// Verdict for one send attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Delivered,
    /// Worth retrying: gateway timeout, device NACK, transient network error.
    Retryable(String),
    /// Never retry: invalid device EUI, payload rejected by the network.
    Permanent(String),
}

#[async_trait]
pub trait GatewaySend: Send + Sync {
    async fn send(&self, device: Ulid, gateway: Ulid, payload: &[u8], fport: u8) -> SendOutcome;
}

/// Dry-run sender: logs each downlink and reports it delivered. Used when no
/// network-server client is wired in, and as the default for local runs.
pub struct LogSender;

#[async_trait]
impl GatewaySend for LogSender {
    async fn send(&self, device: Ulid, gateway: Ulid, payload: &[u8], fport: u8) -> SendOutcome {
        info!(%device, %gateway, fport, "dry-run downlink: {payload:02x?}");
        SendOutcome::Delivered
    }
}
