use std::sync::Arc;
use std::time::Instant;

use alloy::primitives::{keccak256, Address};
use serde::Deserialize;
use serde_json::value::RawValue;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OrderflowMethod {
    EthSendBundle,
    MevSendBundle,
    EthSendRawTransaction,
    EthCancelBundle,
    EthCancelPrivateTransaction,
}

impl OrderflowMethod {
    pub fn from_method_name(name: &str) -> Option<Self> {
        match name {
            "eth_sendBundle" => Some(Self::EthSendBundle),
            "mev_sendBundle" => Some(Self::MevSendBundle),
            "eth_sendRawTransaction" => Some(Self::EthSendRawTransaction),
            "eth_cancelBundle" => Some(Self::EthCancelBundle),
            "eth_cancelPrivateTransaction" => Some(Self::EthCancelPrivateTransaction),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EthSendBundle => "eth_sendBundle",
            Self::MevSendBundle => "mev_sendBundle",
            Self::EthSendRawTransaction => "eth_sendRawTransaction",
            Self::EthCancelBundle => "eth_cancelBundle",
            Self::EthCancelPrivateTransaction => "eth_cancelPrivateTransaction",
        }
    }

    /// Cancellations require an authenticated submitter even on the user
    /// listener.
    pub fn requires_signer(&self) -> bool {
        matches!(
            self,
            Self::EthCancelBundle | Self::EthCancelPrivateTransaction
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    User,
    SystemPeer,
    Flashbots,
}

/// Canonical in-memory form of an accepted request. Params are kept as the
/// raw JSON fragment so forwarding is byte-identical.
///
/// A request carries two identities: `unique_key` identifies this exact
/// submission (derived from the params bytes, so a changed nonce is a new
/// submission) and drives deduplication; `uuid` identifies the logical
/// submission being replaced and drives replacement-nonce tracking.
#[derive(Debug, Clone)]
pub struct ParsedRequest {
    pub method: OrderflowMethod,
    pub params: Arc<RawValue>,
    pub signer: Address,
    pub origin: Origin,
    pub received_at: Instant,
    pub unique_key: Uuid,
    pub uuid: Uuid,
    pub replacement_nonce: Option<u64>,
    pub block_number_hint: Option<u64>,
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("params are required for {0}")]
    MissingParams(&'static str),
    #[error("invalid params: {0}")]
    Json(#[from] serde_json::Error),
    #[error("bundle must carry txs or a replacement uuid")]
    EmptyBundle,
    #[error("invalid block number: {0}")]
    InvalidBlockNumber(String),
    #[error("raw transaction must be 0x-prefixed hex")]
    InvalidRawTransaction,
    #[error("{0} requires a signed request")]
    SignerRequired(&'static str),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EthSendBundleArgs {
    #[serde(default)]
    txs: Vec<String>,
    #[serde(default)]
    block_number: Option<String>,
    #[serde(default)]
    replacement_uuid: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MevSendBundleArgs {
    #[serde(default)]
    inclusion: Option<MevBundleInclusion>,
    #[serde(default)]
    replacement_uuid: Option<Uuid>,
    #[serde(default)]
    replacement_nonce: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MevBundleInclusion {
    #[serde(default)]
    block: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EthCancelBundleArgs {
    replacement_uuid: Uuid,
    #[serde(default)]
    replacement_nonce: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EthCancelPrivateTransactionArgs {
    tx_hash: String,
    #[serde(default)]
    replacement_nonce: Option<u64>,
}

/// Decodes the method-specific params of a request into a `ParsedRequest`.
///
/// Requests without an explicit replacement uuid get a deterministic one
/// derived from the raw params bytes, so every proxy in the network derives
/// the same identity for the same submission.
pub fn parse_request(
    method: OrderflowMethod,
    params: Option<Box<RawValue>>,
    signer: Address,
    origin: Origin,
) -> Result<ParsedRequest, DecodeError> {
    let params: Arc<RawValue> = params
        .ok_or(DecodeError::MissingParams(method.as_str()))?
        .into();

    if method.requires_signer() && origin == Origin::User && signer == Address::ZERO {
        return Err(DecodeError::SignerRequired(method.as_str()));
    }

    let mut uuid = None;
    let mut replacement_nonce = None;
    let mut block_number_hint = None;

    match method {
        OrderflowMethod::EthSendBundle => {
            let (args,): (EthSendBundleArgs,) = serde_json::from_str(params.get())?;
            if args.txs.is_empty() && args.replacement_uuid.is_none() {
                return Err(DecodeError::EmptyBundle);
            }
            if let Some(block) = &args.block_number {
                block_number_hint = Some(parse_hex_u64(block)?);
            }
            uuid = args.replacement_uuid;
        }
        OrderflowMethod::MevSendBundle => {
            let (args,): (MevSendBundleArgs,) = serde_json::from_str(params.get())?;
            if let Some(block) = args.inclusion.as_ref().and_then(|i| i.block.as_ref()) {
                block_number_hint = Some(parse_hex_u64(block)?);
            }
            uuid = args.replacement_uuid;
            replacement_nonce = args.replacement_nonce;
        }
        OrderflowMethod::EthSendRawTransaction => {
            let (tx,): (String,) = serde_json::from_str(params.get())?;
            if !tx.starts_with("0x") || tx.len() <= 2 {
                return Err(DecodeError::InvalidRawTransaction);
            }
        }
        OrderflowMethod::EthCancelBundle => {
            let (args,): (EthCancelBundleArgs,) = serde_json::from_str(params.get())?;
            uuid = Some(args.replacement_uuid);
            replacement_nonce = args.replacement_nonce;
        }
        OrderflowMethod::EthCancelPrivateTransaction => {
            let (args,): (EthCancelPrivateTransactionArgs,) = serde_json::from_str(params.get())?;
            if !args.tx_hash.starts_with("0x") {
                return Err(DecodeError::InvalidRawTransaction);
            }
            replacement_nonce = args.replacement_nonce;
        }
    }

    let unique_key = derive_unique_key(&params);
    let uuid = uuid.unwrap_or(unique_key);

    Ok(ParsedRequest {
        method,
        params,
        signer,
        origin,
        received_at: Instant::now(),
        unique_key,
        uuid,
        replacement_nonce,
        block_number_hint,
    })
}

/// Stable identity of this exact submission. Derived from the raw params
/// bytes, so every proxy in the network computes the same key.
fn derive_unique_key(params: &RawValue) -> Uuid {
    let digest = keccak256(params.get().as_bytes());
    Uuid::from_slice(&digest[..16]).expect("keccak digest is longer than a uuid")
}

fn parse_hex_u64(value: &str) -> Result<u64, DecodeError> {
    let digits = value
        .strip_prefix("0x")
        .ok_or_else(|| DecodeError::InvalidBlockNumber(value.to_string()))?;
    u64::from_str_radix(digits, 16)
        .map_err(|_| DecodeError::InvalidBlockNumber(value.to_string()))
}
