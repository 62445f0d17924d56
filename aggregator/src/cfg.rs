use std::time::Duration;

use anyhow::{Result, anyhow};
use libp2p::{Multiaddr, PeerId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// The port to listen for P2P messages on. Optional - If not provided a random port will be used.
    #[serde(default)]
    pub p2p_port: u16,
    /// The address of another node to dial when this node starts. To join the network, a node must know about at least
    /// one other existing node in the network.
    #[serde(default)]
    pub bootstrap_address: Option<(PeerId, Multiaddr)>,
    /// The port to listen for JSON-RPC aggregation requests on. Defaults to 4000.
    #[serde(default = "api_port_default")]
    pub api_port: u16,
    /// The URL of the validator-information service's JSON-RPC endpoint.
    pub info_api_url: String,
    /// The maximum time to wait for a response from the validator-information service.
    /// Defaults to 5 seconds.
    #[serde(default = "info_request_timeout_default")]
    pub info_request_timeout: Duration,
    /// The maximum time one signature collection round may run before it is abandoned.
    /// Defaults to 2 seconds.
    #[serde(default = "request_timeout_default")]
    pub request_timeout: Duration,
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.info_api_url.is_empty() {
            return Err(anyhow!("info_api_url must be set"));
        }
        if self.request_timeout.is_zero() {
            return Err(anyhow!("request_timeout must be non-zero"));
        }
        Ok(())
    }
}

pub fn api_port_default() -> u16 {
    4000
}

pub fn info_request_timeout_default() -> Duration {
    Duration::from_secs(5)
}

pub fn request_timeout_default() -> Duration {
    Duration::from_secs(2)
}
