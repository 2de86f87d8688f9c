use std::net::SocketAddr;
use std::path::Path;

use alloy::primitives::Address;
use serde::{Deserialize, Serialize};
use url::Url;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Listener for external users and the local operator
    #[serde(default = "default::user_listen_addr")]
    pub user_listen_addr: SocketAddr,
    /// Listener for other network participants
    #[serde(default = "default::system_listen_addr")]
    pub system_listen_addr: SocketAddr,
    /// Listener serving the generated TLS certificate on /cert
    #[serde(default = "default::cert_listen_addr")]
    pub cert_listen_addr: SocketAddr,
    /// Prometheus metrics listener
    #[serde(default = "default::metrics_addr")]
    pub metrics_addr: SocketAddr,

    /// Local builder orderflow endpoint
    #[serde(default = "default::builder_endpoint")]
    pub builder_endpoint: Url,
    /// Node RPC supporting eth_blockNumber
    #[serde(default = "default::rpc_endpoint")]
    pub rpc_endpoint: Url,
    /// Builder config hub endpoint (directly or through the cvm-proxy)
    #[serde(default = "default::builder_confighub_endpoint")]
    pub builder_confighub_endpoint: Url,
    /// Orderflow archive endpoint (block-processor)
    #[serde(default = "default::orderflow_archive_endpoint")]
    pub orderflow_archive_endpoint: Url,

    /// Orderflow from Flashbots is signed with this address
    #[serde(default = "default::flashbots_orderflow_signer_address")]
    pub flashbots_orderflow_signer_address: Address,

    #[serde(default = "default::max_request_body_size_bytes")]
    pub max_request_body_size_bytes: usize,
    /// Unique requests per second admitted on the user listener, 0 disables
    #[serde(default)]
    pub max_user_rps: u32,
    #[serde(default = "default::connections_per_peer")]
    pub connections_per_peer: usize,
    #[serde(default = "default::archive_worker_count")]
    pub archive_worker_count: usize,

    #[serde(default = "default::cert_valid_days")]
    pub cert_valid_days: i64,
    #[serde(default = "default::cert_hosts")]
    pub cert_hosts: Vec<String>,
}

impl Config {
    pub fn load(config_path: Option<&Path>) -> eyre::Result<Self> {
        let mut settings = config::Config::builder();

        if let Some(path) = config_path {
            settings = settings.add_source(config::File::from(path).required(true));
        }

        let settings = settings
            .add_source(config::Environment::default().try_parsing(true))
            .build()?;

        let config = serde_path_to_error::deserialize(settings)?;

        Ok(config)
    }
}

mod default {
    use std::net::SocketAddr;
    use std::str::FromStr;

    use alloy::primitives::Address;
    use url::Url;

    pub fn user_listen_addr() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 443))
    }

    pub fn system_listen_addr() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 5544))
    }

    pub fn cert_listen_addr() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 14727))
    }

    pub fn metrics_addr() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 8090))
    }

    pub fn builder_endpoint() -> Url {
        Url::parse("http://127.0.0.1:8645").expect("default endpoint is valid")
    }

    pub fn rpc_endpoint() -> Url {
        Url::parse("http://127.0.0.1:8545").expect("default endpoint is valid")
    }

    pub fn builder_confighub_endpoint() -> Url {
        Url::parse("http://127.0.0.1:14892").expect("default endpoint is valid")
    }

    pub fn orderflow_archive_endpoint() -> Url {
        Url::parse("http://127.0.0.1:14893").expect("default endpoint is valid")
    }

    pub fn flashbots_orderflow_signer_address() -> Address {
        Address::from_str("0x5015Fa72E34f75A9eC64f44a4Fcf0837919D1bB7")
            .expect("default signer address is valid")
    }

    pub const fn max_request_body_size_bytes() -> usize {
        30 * 1024 * 1024
    }

    pub const fn connections_per_peer() -> usize {
        10
    }

    pub const fn archive_worker_count() -> usize {
        5
    }

    pub const fn cert_valid_days() -> i64 {
        365
    }

    pub fn cert_hosts() -> Vec<String> {
        vec!["127.0.0.1".to_string(), "localhost".to_string()]
    }
}
