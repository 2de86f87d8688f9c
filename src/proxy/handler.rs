use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::Address;
use axum::body::to_bytes;
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use metrics::counter;
use serde_json::Value;
use tracing::{debug, warn};

use crate::jsonrpc::{JsonRpcError, JsonRpcRequest, JsonRpcResponse};
use crate::proxy::request::{parse_request, DecodeError, Origin, OrderflowMethod, ParsedRequest};
use crate::proxy::OrderflowProxy;
use crate::signature::{self, SIGNATURE_HEADER};

const LOCAL_FALLBACK_TIMEOUT: Duration = Duration::from_secs(2);

/// Admission control for the user listener: a token bucket over *unique*
/// requests per second, where uniqueness is `(signer, uuid)`. Re-submissions
/// of an admitted request pass through and are handled by the dedup filter.
pub struct UserRateLimiter {
    bucket: governor::DefaultDirectRateLimiter,
    admitted: crate::cache::TtlCache<(Address, uuid::Uuid), ()>,
}

impl UserRateLimiter {
    const ADMITTED_CAPACITY: usize = 4096;
    // Must cover the whole dedup window: an admitted request that is
    // re-submitted while still deduplicated must bypass the bucket.
    const ADMITTED_TTL: Duration = crate::cache::DEDUP_CACHE_TTL;

    /// A zero rate disables limiting.
    pub fn new(max_user_rps: u32) -> Option<Self> {
        let rps = std::num::NonZeroU32::new(max_user_rps)?;
        Some(Self {
            bucket: governor::RateLimiter::direct(governor::Quota::per_second(rps)),
            admitted: crate::cache::TtlCache::new(Self::ADMITTED_CAPACITY, Self::ADMITTED_TTL),
        })
    }

    pub fn admit(&self, signer: Address, uuid: uuid::Uuid) -> bool {
        let key = (signer, uuid);
        if self.admitted.get(&key).is_some() {
            return true;
        }
        if self.bucket.check().is_ok() {
            self.admitted.insert(key, ());
            true
        } else {
            false
        }
    }
}

/// Which listener a request arrived on. The user endpoint admits unsigned
/// requests; the system endpoint requires a known peer signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    User,
    System,
}

pub async fn serve_user_request(
    State(proxy): State<Arc<OrderflowProxy>>,
    request: Request,
) -> Response {
    serve_request(proxy, Endpoint::User, request).await
}

pub async fn serve_system_request(
    State(proxy): State<Arc<OrderflowProxy>>,
    request: Request,
) -> Response {
    serve_request(proxy, Endpoint::System, request).await
}

/// Full request pipeline: transport checks, body cap, JSON decode, signature
/// verification, origin classification, rate limit, dedup filters, enqueue.
///
/// Everything past the transport checks answers HTTP 200 with a JSON-RPC
/// envelope; duplicates and stale replacements are reported as success.
async fn serve_request(proxy: Arc<OrderflowProxy>, endpoint: Endpoint, request: Request) -> Response {
    if request.method() != Method::POST {
        return (StatusCode::METHOD_NOT_ALLOWED, "Only POST method is allowed").into_response();
    }
    if !is_json_content_type(request.headers()) {
        return (
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            "Content-Type must be application/json",
        )
            .into_response();
    }

    let signature_header = request
        .headers()
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned);

    let body = match to_bytes(request.into_body(), proxy.max_request_body_size_bytes).await {
        Ok(body) => body,
        Err(_) => {
            return rpc_error(
                None,
                JsonRpcError::body_too_large(proxy.max_request_body_size_bytes),
            );
        }
    };

    let rpc_request: JsonRpcRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(err) => return rpc_error(None, JsonRpcError::invalid_json(err)),
    };
    let id = rpc_request.id.clone();

    let signer = match signature_header {
        None => {
            if endpoint == Endpoint::System {
                return rpc_error(id, JsonRpcError::signature_not_set());
            }
            Address::ZERO
        }
        Some(header) => match signature::verify(&header, &body) {
            Ok(signer) => signer,
            Err(err) => return rpc_error(id, JsonRpcError::signature_not_correct(err)),
        },
    };

    let origin = match endpoint {
        Endpoint::User => Origin::User,
        Endpoint::System => match classify_system_signer(
            signer,
            proxy.flashbots_signer,
            &proxy.peers.read(),
        ) {
            Some(origin) => origin,
            None => return rpc_error(id, JsonRpcError::unknown_peer()),
        },
    };

    let Some(method) = OrderflowMethod::from_method_name(&rpc_request.method) else {
        return rpc_error(id, JsonRpcError::method_not_found());
    };

    let parsed = match parse_request(method, rpc_request.params, signer, origin) {
        Ok(parsed) => parsed,
        Err(DecodeError::SignerRequired(_)) => {
            return rpc_error(id, JsonRpcError::signature_not_set());
        }
        Err(err) => return rpc_error(id, JsonRpcError::invalid_params(err)),
    };

    if endpoint == Endpoint::User {
        if let Some(limiter) = &proxy.user_rate_limiter {
            if !limiter.admit(parsed.signer, parsed.unique_key) {
                counter!("orderflow_proxy_rate_limited_total").increment(1);
                return rpc_error(id, JsonRpcError::too_many_requests());
            }
        }
    }

    if !proxy.dedup.insert(parsed.unique_key) {
        counter!("orderflow_proxy_duplicates_total").increment(1);
        debug!(uuid = %parsed.uuid, "Dropping duplicate request");
        return rpc_success(id);
    }
    if let Some(nonce) = parsed.replacement_nonce {
        if !proxy
            .replacement_nonces
            .observe(parsed.uuid, parsed.signer, nonce)
        {
            counter!("orderflow_proxy_stale_replacements_total").increment(1);
            debug!(uuid = %parsed.uuid, nonce, "Dropping stale replacement");
            return rpc_success(id);
        }
    }

    enqueue(&proxy, parsed).await;
    rpc_success(id)
}

/// Hands an accepted request to the share queue and, for user orderflow,
/// to the archive queue. Both paths are best-effort past this point.
async fn enqueue(proxy: &OrderflowProxy, request: ParsedRequest) {
    if request.origin == Origin::User {
        match proxy.archive_sender() {
            Some(sender) if sender.try_send(request.clone()).is_ok() => {}
            _ => {
                counter!("orderflow_proxy_archive_queue_full_total").increment(1);
                debug!(uuid = %request.uuid, "Archive queue is full, dropping from archive");
            }
        }
    }

    match proxy.share_sender() {
        Some(sender) if sender.try_send(request.clone()).is_ok() => {}
        _ => {
            // Peers miss out, but the local builder still gets the request.
            counter!("share_queue_full").increment(1);
            warn!(uuid = %request.uuid, "Share queue is full, posting to local builder only");
            if let Err(err) = proxy
                .local_builder
                .call(
                    request.method.as_str(),
                    &request.params,
                    LOCAL_FALLBACK_TIMEOUT,
                )
                .await
            {
                warn!(?err, uuid = %request.uuid, "Local builder fallback delivery failed");
            }
        }
    }
}

fn is_json_content_type(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|value| {
            value
                .split(';')
                .next()
                .unwrap_or_default()
                .trim()
                .eq_ignore_ascii_case("application/json")
        })
        .unwrap_or(false)
}

/// System-endpoint authorization: the signer must be the configured
/// Flashbots address or a member of the current peer set.
fn classify_system_signer(
    signer: Address,
    flashbots_signer: Address,
    peers: &[crate::confighub::ConfighubBuilder],
) -> Option<Origin> {
    if signer == flashbots_signer {
        return Some(Origin::Flashbots);
    }
    if peers
        .iter()
        .any(|peer| peer.orderflow_proxy.ecdsa_pubkey_address == signer)
    {
        return Some(Origin::SystemPeer);
    }
    None
}

fn rpc_success(id: Option<Value>) -> Response {
    Json(JsonRpcResponse::success(id)).into_response()
}

fn rpc_error(id: Option<Value>, error: JsonRpcError) -> Response {
    Json(JsonRpcResponse::error(id, error)).into_response()
}
