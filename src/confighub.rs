use std::time::Duration;

use alloy::primitives::Address;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use url::Url;

const REGISTER_PATH: &str = "api/l1-builder/v1/register_credentials/orderflow_proxy";
const BUILDERS_PATH: &str = "api/l1-builder/v1/builders";

const REGISTER_MAX_RETRIES: usize = 10;
const REGISTER_RETRY_DELAY: Duration = Duration::from_secs(10);
const REGISTER_CALL_TIMEOUT: Duration = Duration::from_secs(10);
const BUILDERS_CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Default port peers serve their system-facing orderflow API on.
pub const DEFAULT_SYSTEM_PORT: u16 = 5544;

#[derive(Debug, thiserror::Error)]
pub enum ConfigHubError {
    #[error("invalid endpoint url: {0}")]
    Url(#[from] url::ParseError),
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("http status {0}")]
    Status(reqwest::StatusCode),
    #[error("registration cancelled")]
    Cancelled,
}

/// Credentials the proxy publishes so peers can authenticate it end-to-end.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfighubOrderflowProxyCredentials {
    pub tls_cert: String,
    pub ecdsa_pubkey_address: Address,
}

/// One roster entry as returned by the config hub.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfighubBuilder {
    pub name: String,
    pub ip_address: String,
    pub orderflow_proxy: ConfighubOrderflowProxyCredentials,
}

impl ConfighubBuilder {
    /// URL of the peer's system-facing listener. The hub records either a
    /// full URL or a bare address; bare addresses get the well-known scheme
    /// and port.
    pub fn orderflow_url(&self) -> Result<Url, url::ParseError> {
        if self.ip_address.contains("://") {
            return Url::parse(&self.ip_address);
        }
        if self.ip_address.contains(':') {
            return Url::parse(&format!("https://{}", self.ip_address));
        }
        Url::parse(&format!(
            "https://{}:{}",
            self.ip_address, DEFAULT_SYSTEM_PORT
        ))
    }
}

/// Client for the builder config hub: registers this proxy's credentials and
/// fetches the current peer roster.
pub struct BuilderConfigHub {
    register_url: Url,
    builders_url: Url,
    client: reqwest::Client,
    registered: Mutex<Option<ConfighubOrderflowProxyCredentials>>,
}

impl BuilderConfigHub {
    pub fn new(endpoint: Url) -> Result<Self, ConfigHubError> {
        Ok(Self {
            register_url: endpoint.join(REGISTER_PATH)?,
            builders_url: endpoint.join(BUILDERS_PATH)?,
            client: reqwest::Client::new(),
            registered: Mutex::new(None),
        })
    }

    /// Registers credentials, retrying a bounded number of times. Returns
    /// the last error once retries are exhausted. Cancellation is observed
    /// before and during every attempt.
    pub async fn register_credentials(
        &self,
        cancel: &CancellationToken,
        credentials: ConfighubOrderflowProxyCredentials,
    ) -> Result<(), ConfigHubError> {
        let mut retry = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(ConfigHubError::Cancelled);
            }

            let attempt = tokio::select! {
                _ = cancel.cancelled() => return Err(ConfigHubError::Cancelled),
                result = self.try_register(&credentials) => result,
            };
            match attempt {
                Ok(()) => {
                    info!("Credentials registered on config hub");
                    *self.registered.lock() = Some(credentials);
                    return Ok(());
                }
                Err(err) => {
                    retry += 1;
                    if retry >= REGISTER_MAX_RETRIES {
                        return Err(err);
                    }
                    error!(?err, retry, "Failed to register credentials");
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(ConfigHubError::Cancelled),
                _ = tokio::time::sleep(REGISTER_RETRY_DELAY) => {}
            }
        }
    }

    async fn try_register(
        &self,
        credentials: &ConfighubOrderflowProxyCredentials,
    ) -> Result<(), ConfigHubError> {
        let response = self
            .client
            .post(self.register_url.clone())
            .timeout(REGISTER_CALL_TIMEOUT)
            .json(credentials)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ConfigHubError::Status(status));
        }
        Ok(())
    }

    /// Fetches the current roster. With `include_self` unset, the entry
    /// matching our registered signing address is dropped.
    pub async fn builders(
        &self,
        include_self: bool,
    ) -> Result<Vec<ConfighubBuilder>, ConfigHubError> {
        let response = self
            .client
            .get(self.builders_url.clone())
            .timeout(BUILDERS_CALL_TIMEOUT)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ConfigHubError::Status(status));
        }
        let mut builders: Vec<ConfighubBuilder> = response.json().await?;

        if !include_self {
            let own_address = self
                .registered
                .lock()
                .as_ref()
                .map(|credentials| credentials.ecdsa_pubkey_address);
            if let Some(own_address) = own_address {
                builders
                    .retain(|builder| builder.orderflow_proxy.ecdsa_pubkey_address != own_address);
            }
        }
        Ok(builders)
    }
}
