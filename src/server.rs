use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::{any, get};
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use eyre::eyre::{eyre, WrapErr};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::identity::Identity;
use crate::proxy::handler::{serve_system_request, serve_user_request};
use crate::proxy::OrderflowProxy;

const LISTENER_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// The listener trio plus the metrics endpoint. User and system listeners
/// terminate TLS with the generated certificate; the cert and metrics
/// listeners are plaintext.
pub struct ProxyServers {
    handles: Vec<Handle>,
    tasks: JoinSet<()>,
}

pub async fn start_servers(
    config: &Config,
    identity: &Identity,
    proxy: Arc<OrderflowProxy>,
) -> eyre::Result<ProxyServers> {
    let tls_config = RustlsConfig::from_pem(
        identity.cert_pem().as_bytes().to_vec(),
        identity.key_pem().as_bytes().to_vec(),
    )
    .await
    .wrap_err("generated certificate was rejected by rustls")?;

    let mut servers = ProxyServers {
        handles: Vec::new(),
        tasks: JoinSet::new(),
    };

    servers.spawn_tls(
        "user",
        config.user_listen_addr,
        tls_config.clone(),
        user_router(proxy.clone()),
    );
    servers.spawn_tls(
        "system",
        config.system_listen_addr,
        tls_config,
        system_router(proxy.clone()),
    );
    servers.spawn_plain("cert", config.cert_listen_addr, cert_router(proxy));
    servers.spawn_plain("metrics", config.metrics_addr, metrics_router());

    for handle in &servers.handles {
        if handle.listening().await.is_none() {
            return Err(eyre!("a listener failed to bind"));
        }
    }
    info!(
        user = %config.user_listen_addr,
        system = %config.system_listen_addr,
        cert = %config.cert_listen_addr,
        "Started orderflow proxy listeners"
    );
    Ok(servers)
}

impl ProxyServers {
    fn spawn_tls(&mut self, name: &'static str, addr: SocketAddr, tls: RustlsConfig, router: Router) {
        let handle = Handle::new();
        self.handles.push(handle.clone());
        self.tasks.spawn(async move {
            if let Err(err) = axum_server::bind_rustls(addr, tls)
                .handle(handle)
                .serve(router.into_make_service())
                .await
            {
                error!(listener = name, %addr, ?err, "Listener failed");
            }
        });
    }

    fn spawn_plain(&mut self, name: &'static str, addr: SocketAddr, router: Router) {
        let handle = Handle::new();
        self.handles.push(handle.clone());
        self.tasks.spawn(async move {
            if let Err(err) = axum_server::bind(addr)
                .handle(handle)
                .serve(router.into_make_service())
                .await
            {
                error!(listener = name, %addr, ?err, "Listener failed");
            }
        });
    }

    /// Stops accepting connections and waits for in-flight requests.
    pub async fn shutdown(mut self) {
        for handle in &self.handles {
            handle.graceful_shutdown(Some(LISTENER_SHUTDOWN_GRACE));
        }
        while let Some(result) = self.tasks.join_next().await {
            if let Err(err) = result {
                warn!(?err, "Listener task panicked");
            }
        }
    }
}

fn user_router(proxy: Arc<OrderflowProxy>) -> Router {
    Router::new()
        .route("/", any(serve_user_request))
        .with_state(proxy)
}

fn system_router(proxy: Arc<OrderflowProxy>) -> Router {
    Router::new()
        .route("/", any(serve_system_request))
        .with_state(proxy)
}

fn cert_router(proxy: Arc<OrderflowProxy>) -> Router {
    Router::new()
        .route("/cert", get(serve_cert))
        .with_state(proxy)
}

async fn serve_cert(State(proxy): State<Arc<OrderflowProxy>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "application/octet-stream")],
        proxy.cert_pem.clone(),
    )
}

fn metrics_router() -> Router {
    match PrometheusBuilder::new().install_recorder() {
        Ok(prometheus) => Router::new().route(
            "/metrics",
            get(move || {
                let prometheus = prometheus.clone();
                async move { prometheus.render() }
            }),
        ),
        Err(err) => {
            warn!(?err, "Failed to install metrics recorder");
            Router::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use alloy::primitives::Address;
    use alloy::signers::local::PrivateKeySigner;
    use axum::body::Body;
    use axum::http::{header, Method, Request, StatusCode};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use super::*;
    use crate::confighub::{ConfighubBuilder, ConfighubOrderflowProxyCredentials};
    use crate::proxy::request::{Origin, ParsedRequest};
    use crate::proxy::test_support::{test_proxy, test_proxy_with_flashbots};
    use crate::signature::{self, SIGNATURE_HEADER};

    const MAX_BODY: usize = 1024 * 1024;

    fn peer_entry(name: &str, address: Address) -> ConfighubBuilder {
        ConfighubBuilder {
            name: name.to_string(),
            ip_address: "192.0.2.1".to_string(),
            orderflow_proxy: ConfighubOrderflowProxyCredentials {
                tls_cert: "cert".to_string(),
                ecdsa_pubkey_address: address,
            },
        }
    }

    fn post(body: &str, signature_header: Option<String>) -> Request<Body> {
        let mut request = Request::builder()
            .method(Method::POST)
            .uri("/")
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(value) = signature_header {
            request = request.header(SIGNATURE_HEADER, value);
        }
        request.body(Body::from(body.to_string())).unwrap()
    }

    async fn response_json(response: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn bundle_body(uuid: &str) -> String {
        json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "eth_sendBundle",
            "params": [{"txs": ["0x02ff"], "blockNumber": "0x64", "replacementUuid": uuid}],
        })
        .to_string()
    }

    #[tokio::test]
    async fn user_bundle_happy_path() {
        let (proxy, mut share_rx, mut archive_rx) = test_proxy(Vec::new(), 0, MAX_BODY);
        let router = user_router(proxy);

        let body = bundle_body("1f5704ef-fef4-4b6e-9ba5-6f2e0fbd0c7b");
        let response = router.oneshot(post(&body, None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let reply = response_json(response).await;
        assert_eq!(reply, json!({"jsonrpc": "2.0", "id": 1, "result": null}));

        let shared: ParsedRequest = share_rx.try_recv().unwrap();
        assert_eq!(shared.origin, Origin::User);
        assert_eq!(shared.signer, Address::ZERO);
        assert_eq!(shared.block_number_hint, Some(100));

        let archived = archive_rx.try_recv().unwrap();
        assert_eq!(archived.uuid, shared.uuid);
    }

    #[tokio::test]
    async fn duplicate_submission_dispatches_once() {
        let (proxy, mut share_rx, _archive_rx) = test_proxy(Vec::new(), 0, MAX_BODY);
        let router = user_router(proxy);

        let body = bundle_body("2a5704ef-fef4-4b6e-9ba5-6f2e0fbd0c7b");
        for _ in 0..2 {
            let response = router.clone().oneshot(post(&body, None)).await.unwrap();
            let reply = response_json(response).await;
            assert_eq!(reply["result"], Value::Null);
            assert!(reply.get("error").is_none());
        }

        assert!(share_rx.try_recv().is_ok());
        assert!(share_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn stale_replacement_nonce_is_silently_dropped() {
        let (proxy, mut share_rx, _archive_rx) = test_proxy(Vec::new(), 0, MAX_BODY);
        let router = user_router(proxy);

        let signer = PrivateKeySigner::random();
        for nonce in [1u64, 3, 2] {
            let body = json!({
                "jsonrpc": "2.0",
                "id": 1,
                "method": "mev_sendBundle",
                "params": [{
                    "version": "v0.1",
                    "inclusion": {"block": "0x64"},
                    "body": [],
                    "replacementUuid": "3b5704ef-fef4-4b6e-9ba5-6f2e0fbd0c7b",
                    "replacementNonce": nonce,
                }],
            })
            .to_string();
            let header = signature::sign(&signer, body.as_bytes()).unwrap();
            let response = router
                .clone()
                .oneshot(post(&body, Some(header)))
                .await
                .unwrap();
            let reply = response_json(response).await;
            assert!(reply.get("error").is_none());
        }

        let first = share_rx.try_recv().unwrap();
        assert_eq!(first.replacement_nonce, Some(1));
        let second = share_rx.try_recv().unwrap();
        assert_eq!(second.replacement_nonce, Some(3));
        assert!(share_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn oversize_body_is_rejected() {
        let (proxy, mut share_rx, _archive_rx) = test_proxy(Vec::new(), 0, 200);
        let router = user_router(proxy);

        let padding = "f".repeat(400);
        let body = format!(
            r#"{{"jsonrpc":"2.0","id":1,"method":"eth_sendBundle","params":[{{"txs":["0x{padding}"]}}]}}"#
        );
        let response = router.oneshot(post(&body, None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let reply = response_json(response).await;
        assert_eq!(reply["error"]["code"], json!(-32602));
        assert_eq!(
            reply["error"]["message"],
            json!("Request body too large, max body size 200")
        );
        assert!(share_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn transport_level_rejections() {
        let (proxy, _share_rx, _archive_rx) = test_proxy(Vec::new(), 0, MAX_BODY);
        let router = user_router(proxy);

        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .method(Method::GET)
                    .uri("/")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);

        let response = router
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/")
                    .header(header::CONTENT_TYPE, "text/plain")
                    .body(Body::from("hello"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
    }

    #[tokio::test]
    async fn unknown_method_is_rejected() {
        let (proxy, _share_rx, _archive_rx) = test_proxy(Vec::new(), 0, MAX_BODY);
        let router = user_router(proxy);

        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "eth_getBalance",
            "params": [],
        })
        .to_string();
        let response = router.oneshot(post(&body, None)).await.unwrap();
        let reply = response_json(response).await;
        assert_eq!(reply["error"]["message"], json!("Method not found"));
    }

    #[tokio::test]
    async fn system_endpoint_requires_known_signer() {
        let peer_signer = PrivateKeySigner::random();
        let stranger = PrivateKeySigner::random();
        let (proxy, mut share_rx, mut archive_rx) = test_proxy(
            vec![peer_entry("peer-a", peer_signer.address())],
            0,
            MAX_BODY,
        );
        let router = system_router(proxy);

        let body = bundle_body("4c5704ef-fef4-4b6e-9ba5-6f2e0fbd0c7b");

        // Unsigned request is turned away before classification.
        let response = router.clone().oneshot(post(&body, None)).await.unwrap();
        let reply = response_json(response).await;
        assert!(reply["error"]["message"]
            .as_str()
            .unwrap()
            .starts_with("Signature header not set"));

        // Signed, but not by anyone on the roster.
        let header = signature::sign(&stranger, body.as_bytes()).unwrap();
        let response = router
            .clone()
            .oneshot(post(&body, Some(header)))
            .await
            .unwrap();
        let reply = response_json(response).await;
        assert_eq!(reply["error"]["message"], json!("Unknown peer"));
        assert!(share_rx.try_recv().is_err());

        // Signed by a roster member: accepted, shared, never archived.
        let header = signature::sign(&peer_signer, body.as_bytes()).unwrap();
        let response = router.oneshot(post(&body, Some(header))).await.unwrap();
        let reply = response_json(response).await;
        assert!(reply.get("error").is_none());
        let shared = share_rx.try_recv().unwrap();
        assert_eq!(shared.origin, Origin::SystemPeer);
        assert_eq!(shared.signer, peer_signer.address());
        assert!(archive_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn flashbots_signer_is_accepted_without_roster_entry() {
        let signer = PrivateKeySigner::random();
        let (proxy, mut share_rx, mut archive_rx) =
            test_proxy_with_flashbots(signer.address(), Vec::new(), 0, MAX_BODY);
        let router = system_router(proxy);

        let body = bundle_body("5d5704ef-fef4-4b6e-9ba5-6f2e0fbd0c7b");
        let header = signature::sign(&signer, body.as_bytes()).unwrap();
        let response = router.oneshot(post(&body, Some(header))).await.unwrap();
        let reply = response_json(response).await;
        assert!(reply.get("error").is_none());

        let shared = share_rx.try_recv().unwrap();
        assert_eq!(shared.origin, Origin::Flashbots);
        // Flashbots orderflow is system traffic; it is not archived.
        assert!(archive_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn bad_signature_is_rejected() {
        let (proxy, _share_rx, _archive_rx) = test_proxy(Vec::new(), 0, MAX_BODY);
        let router = user_router(proxy);

        let signer = PrivateKeySigner::random();
        let body = bundle_body("6e5704ef-fef4-4b6e-9ba5-6f2e0fbd0c7b");
        let header = signature::sign(&signer, b"different body").unwrap();
        let response = router.oneshot(post(&body, Some(header))).await.unwrap();
        let reply = response_json(response).await;
        assert_eq!(
            reply["error"]["message"],
            json!("Request signature is not correct")
        );
    }

    #[tokio::test]
    async fn user_rate_limit_applies_to_unique_requests() {
        let (proxy, mut share_rx, _archive_rx) = test_proxy(Vec::new(), 1, MAX_BODY);
        let router = user_router(proxy);

        let first = bundle_body("7f5704ef-fef4-4b6e-9ba5-6f2e0fbd0c7b");
        let response = router.clone().oneshot(post(&first, None)).await.unwrap();
        assert!(response_json(response).await.get("error").is_none());

        // A second unique request in the same second exceeds the rate.
        let second = bundle_body("8a5704ef-fef4-4b6e-9ba5-6f2e0fbd0c7b");
        let response = router.clone().oneshot(post(&second, None)).await.unwrap();
        let reply = response_json(response).await;
        assert_eq!(reply["error"]["code"], json!(-32005));
        assert_eq!(reply["error"]["message"], json!("Too many requests"));

        // Re-submitting the admitted request is not counted again; the
        // dedup filter answers it with silent success.
        let response = router.oneshot(post(&first, None)).await.unwrap();
        assert!(response_json(response).await.get("error").is_none());

        assert!(share_rx.try_recv().is_ok());
        assert!(share_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn cert_endpoint_serves_exact_pem() {
        let (proxy, _share_rx, _archive_rx) = test_proxy(Vec::new(), 0, MAX_BODY);
        let expected = proxy.cert_pem.clone();
        let router = cert_router(proxy);

        let response = router
            .oneshot(
                Request::builder()
                    .method(Method::GET)
                    .uri("/cert")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/octet-stream"
        );
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(bytes, expected.as_bytes());
    }

    #[tokio::test]
    async fn closed_queues_still_answer_success() {
        // Once a request is accepted the client sees success even if the
        // queues are gone; delivery is best-effort from that point on.
        let (proxy, share_rx, archive_rx) = test_proxy(Vec::new(), 0, MAX_BODY);
        drop(share_rx);
        drop(archive_rx);
        let router = user_router(proxy);

        let body = bundle_body("9b5704ef-fef4-4b6e-9ba5-6f2e0fbd0c7b");
        let response = router.oneshot(post(&body, None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let reply = response_json(response).await;
        assert!(reply.get("error").is_none());
    }
}
