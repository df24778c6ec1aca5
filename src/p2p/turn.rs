//! TURN relay client (RFC 5766), allocation stub.
//!
//! Relay fallback is not implemented; allocation requests are refused and
//! sessions always report a "p2p" connection type. The interface exists so
//! the session wiring does not change when relay support lands.

use anyhow::{bail, Result};

#[derive(Debug, Clone)]
pub struct TurnConfig {
    pub server: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Default)]
pub struct TurnAllocation {
    pub relayed_ip: String,
    pub relayed_port: u16,
}

pub struct TurnClient {
    config: TurnConfig,
}

impl TurnClient {
    pub fn new(config: TurnConfig) -> Self {
        tracing::info!(
            "TURN client created for {}:{} (relay not implemented)",
            config.server,
            config.port
        );
        TurnClient { config }
    }

    pub fn server(&self) -> &str {
        &self.config.server
    }

    /// Relay allocation is unimplemented and always refused.
    pub async fn allocate(&self) -> Result<TurnAllocation> {
        bail!(
            "TURN relay allocation to {} refused: relay is not implemented",
            self.config.server
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_allocation_refused() {
        let client = TurnClient::new(TurnConfig {
            server: "turn.example.net".into(),
            port: 3478,
            username: "u".into(),
            password: "p".into(),
        });
        assert!(client.allocate().await.is_err());
    }
}
