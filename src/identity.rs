use std::sync::Arc;

use alloy::primitives::Address;
use alloy::signers::local::PrivateKeySigner;
use time::{Duration, OffsetDateTime};

pub const DEFAULT_CERT_VALID_DAYS: i64 = 365;

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("certificate generation failed: {0}")]
    Certificate(#[from] rcgen::Error),
}

/// Ephemeral identity of the proxy: a random orderflow signing key and a
/// matching self-signed TLS certificate. Created once at startup, never
/// rotated, gone when the process exits.
pub struct Identity {
    signer: Arc<PrivateKeySigner>,
    cert_pem: String,
    key_pem: String,
}

impl Identity {
    pub fn generate(cert_valid_days: i64, cert_hosts: &[String]) -> Result<Self, IdentityError> {
        let signer = PrivateKeySigner::random();

        let key_pair = rcgen::KeyPair::generate()?;
        let mut params = rcgen::CertificateParams::new(cert_hosts.to_vec())?;
        params.not_before = OffsetDateTime::now_utc();
        params.not_after = params.not_before + Duration::days(cert_valid_days);
        let cert = params.self_signed(&key_pair)?;

        Ok(Self {
            signer: Arc::new(signer),
            cert_pem: cert.pem(),
            key_pem: key_pair.serialize_pem(),
        })
    }

    /// Address under which all outgoing orderflow is signed.
    pub fn address(&self) -> Address {
        self.signer.address()
    }

    pub fn signer(&self) -> Arc<PrivateKeySigner> {
        self.signer.clone()
    }

    /// PEM served verbatim on the cert listener and registered on the hub.
    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    pub fn key_pem(&self) -> &str {
        &self.key_pem
    }
}
