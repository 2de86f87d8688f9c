use std::str::FromStr;

use alloy::primitives::{Address, Signature};
use alloy::signers::local::PrivateKeySigner;
use alloy::signers::SignerSync;

/// Header carrying `<address>:<signature>` over the request body.
pub const SIGNATURE_HEADER: &str = "X-Flashbots-Signature";

#[derive(Debug, thiserror::Error)]
pub enum SignatureError {
    #[error("header must be formatted as <address>:<signature>")]
    MalformedHeader,
    #[error("invalid address: {0}")]
    InvalidAddress(alloy::primitives::hex::FromHexError),
    #[error("invalid signature: {0}")]
    InvalidSignature(alloy::primitives::SignatureError),
    #[error("signature recovery failed: {0}")]
    Recovery(alloy::primitives::SignatureError),
    #[error("recovered address {recovered} does not match declared address {declared}")]
    AddressMismatch { declared: Address, recovered: Address },
    #[error("signing failed: {0}")]
    Signing(#[from] alloy::signers::Error),
}

/// Verifies a signature header against the raw body bytes.
///
/// The signature is ECDSA over the EIP-191 prefixed hash of the body; the
/// recovered address must equal the address declared in the header.
pub fn verify(header: &str, body: &[u8]) -> Result<Address, SignatureError> {
    let (address, signature) = header
        .split_once(':')
        .ok_or(SignatureError::MalformedHeader)?;
    let declared = Address::from_str(address.trim()).map_err(SignatureError::InvalidAddress)?;
    let signature =
        Signature::from_str(signature.trim()).map_err(SignatureError::InvalidSignature)?;

    let recovered = signature
        .recover_address_from_msg(body)
        .map_err(SignatureError::Recovery)?;
    if recovered != declared {
        return Err(SignatureError::AddressMismatch {
            declared,
            recovered,
        });
    }
    Ok(recovered)
}

/// Produces a signature header value for `body` signed by `signer`.
pub fn sign(signer: &PrivateKeySigner, body: &[u8]) -> Result<String, SignatureError> {
    let signature = signer.sign_message_sync(body)?;
    Ok(format!(
        "{}:0x{}",
        signer.address(),
        hex::encode(signature.as_bytes())
    ))
}
