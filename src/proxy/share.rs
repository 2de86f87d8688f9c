use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use alloy::signers::local::PrivateKeySigner;
use metrics::{counter, gauge};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::confighub::ConfighubBuilder;
use crate::jsonrpc::RpcClient;
use crate::proxy::request::{Origin, ParsedRequest};

/// Queue depth per sink; the ingress channel in front of the whole share
/// queue is sized the same.
pub const SINK_QUEUE_CAPACITY: usize = 1024;

const DISPATCH_TIMEOUT: Duration = Duration::from_secs(2);
const DISPATCH_BACKOFF: [Duration; 3] = [
    Duration::from_millis(100),
    Duration::from_millis(400),
    Duration::from_secs(1),
];

/// Fans accepted orderflow out to the local builder and every current peer.
///
/// Each sink owns a bounded queue drained by a ring of workers, so a slow
/// peer backs up only its own queue. Peer-originated requests are only
/// delivered locally, never re-broadcast.
pub struct ShareQueue {
    pub queue: mpsc::Receiver<ParsedRequest>,
    pub update_peers: watch::Receiver<Vec<ConfighubBuilder>>,
    pub local_builder: RpcClient,
    pub signer: Arc<PrivateKeySigner>,
    pub workers_per_peer: usize,
}

struct PeerSink {
    builder: ConfighubBuilder,
    sender: async_channel::Sender<ParsedRequest>,
}

impl ShareQueue {
    pub async fn run(mut self) {
        let mut workers = tokio::task::JoinSet::new();
        let local_sender = spawn_sink(
            "local-builder".to_string(),
            self.local_builder.clone(),
            self.workers_per_peer,
            &mut workers,
        );

        let mut peers: HashMap<String, PeerSink> = HashMap::new();
        let roster = self.update_peers.borrow_and_update().clone();
        reconcile(
            &mut peers,
            roster,
            &self.signer,
            self.workers_per_peer,
            &mut workers,
        );

        let mut peers_watch_open = true;
        loop {
            tokio::select! {
                request = self.queue.recv() => {
                    let Some(request) = request else { break };
                    dispatch(&local_sender, &peers, request);
                }
                changed = self.update_peers.changed(), if peers_watch_open => {
                    if changed.is_err() {
                        peers_watch_open = false;
                        continue;
                    }
                    let roster = self.update_peers.borrow_and_update().clone();
                    reconcile(
                        &mut peers,
                        roster,
                        &self.signer,
                        self.workers_per_peer,
                        &mut workers,
                    );
                }
            }
        }
        // Dropping the senders lets workers drain their queues and exit.
        drop(local_sender);
        peers.clear();
        while workers.join_next().await.is_some() {}
        info!("Share queue closed");
    }
}

fn dispatch(
    local_sender: &async_channel::Sender<ParsedRequest>,
    peers: &HashMap<String, PeerSink>,
    request: ParsedRequest,
) {
    if let Err(err) = local_sender.try_send(request.clone()) {
        counter!("orderflow_proxy_sink_overflow_total", "sink" => "local-builder").increment(1);
        warn!(?err, "Local builder queue is full, dropping request");
    }

    // Requests that came from a peer were already fanned out by the
    // originating proxy.
    if request.origin == Origin::SystemPeer {
        return;
    }
    for (name, sink) in peers {
        if sink.sender.try_send(request.clone()).is_err() {
            counter!("orderflow_proxy_sink_overflow_total", "sink" => name.clone()).increment(1);
            debug!(peer = %name, "Peer queue is full, dropping request");
        }
    }
}

/// A peer sink survives a roster refresh untouched only if nothing the
/// workers depend on changed.
fn sink_changed(current: &ConfighubBuilder, next: &ConfighubBuilder) -> bool {
    current.ip_address != next.ip_address
        || current.orderflow_proxy.tls_cert != next.orderflow_proxy.tls_cert
        || current.orderflow_proxy.ecdsa_pubkey_address != next.orderflow_proxy.ecdsa_pubkey_address
}

fn reconcile(
    peers: &mut HashMap<String, PeerSink>,
    roster: Vec<ConfighubBuilder>,
    signer: &Arc<PrivateKeySigner>,
    workers_per_peer: usize,
    workers: &mut tokio::task::JoinSet<()>,
) {
    let mut next: HashMap<String, PeerSink> = HashMap::new();
    for builder in roster {
        if let Some(existing) = peers.remove(&builder.name) {
            if !sink_changed(&existing.builder, &builder) {
                next.insert(builder.name.clone(), existing);
                continue;
            }
            info!(peer = %builder.name, "Peer changed, rebuilding sink");
        } else {
            info!(peer = %builder.name, "New peer, starting sink");
        }

        match peer_client(&builder, signer) {
            Ok(client) => {
                let sender = spawn_sink(builder.name.clone(), client, workers_per_peer, workers);
                next.insert(builder.name.clone(), PeerSink { builder, sender });
            }
            Err(err) => {
                warn!(peer = %builder.name, ?err, "Failed to build peer client, skipping peer");
            }
        }
    }

    for (name, _) in peers.drain() {
        info!(peer = %name, "Peer removed, draining sink");
    }
    *peers = next;
    gauge!("orderflow_proxy_peers").set(peers.len() as f64);
}

#[derive(Debug, thiserror::Error)]
enum PeerClientError {
    #[error("invalid orderflow url: {0}")]
    Url(#[from] url::ParseError),
    #[error("invalid pinned certificate: {0}")]
    Certificate(reqwest::Error),
    #[error("client build failed: {0}")]
    Build(reqwest::Error),
}

/// HTTP client trusting exactly the peer's published certificate. A peer
/// presenting any other chain fails the handshake.
fn peer_client(
    builder: &ConfighubBuilder,
    signer: &Arc<PrivateKeySigner>,
) -> Result<RpcClient, PeerClientError> {
    let url = builder.orderflow_url()?;
    let pinned = reqwest::Certificate::from_pem(builder.orderflow_proxy.tls_cert.as_bytes())
        .map_err(PeerClientError::Certificate)?;
    let client = reqwest::Client::builder()
        .use_rustls_tls()
        .tls_built_in_root_certs(false)
        .add_root_certificate(pinned)
        .build()
        .map_err(PeerClientError::Build)?;
    Ok(RpcClient::new(url, client).with_signer(signer.clone()))
}

fn spawn_sink(
    name: String,
    client: RpcClient,
    worker_count: usize,
    workers: &mut tokio::task::JoinSet<()>,
) -> async_channel::Sender<ParsedRequest> {
    let (sender, receiver) = async_channel::bounded(SINK_QUEUE_CAPACITY);
    for _ in 0..worker_count {
        workers.spawn(run_worker(name.clone(), client.clone(), receiver.clone()));
    }
    sender
}

async fn run_worker(
    name: String,
    client: RpcClient,
    receiver: async_channel::Receiver<ParsedRequest>,
) {
    while let Ok(request) = receiver.recv().await {
        send_with_retries(&name, &client, &request).await;
    }
}

async fn send_with_retries(name: &str, client: &RpcClient, request: &ParsedRequest) {
    for backoff in DISPATCH_BACKOFF {
        match client
            .call(request.method.as_str(), &request.params, DISPATCH_TIMEOUT)
            .await
        {
            Ok(()) => {
                counter!("orderflow_proxy_requests_shared_total", "sink" => name.to_string())
                    .increment(1);
                return;
            }
            Err(err) => {
                debug!(sink = %name, ?err, "Dispatch attempt failed");
                tokio::time::sleep(backoff).await;
            }
        }
    }
    if let Err(err) = client
        .call(request.method.as_str(), &request.params, DISPATCH_TIMEOUT)
        .await
    {
        counter!("orderflow_proxy_dispatch_failures_total", "sink" => name.to_string())
            .increment(1);
        warn!(sink = %name, ?err, uuid = %request.uuid, "Dropping request after retries");
    } else {
        counter!("orderflow_proxy_requests_shared_total", "sink" => name.to_string()).increment(1);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;
    use crate::confighub::ConfighubOrderflowProxyCredentials;
    use crate::proxy::request::OrderflowMethod;

    use alloy::primitives::Address;
    use serde_json::value::RawValue;
    use uuid::Uuid;

    fn builder(name: &str, ip_address: &str, cert: &str) -> ConfighubBuilder {
        ConfighubBuilder {
            name: name.to_string(),
            ip_address: ip_address.to_string(),
            orderflow_proxy: ConfighubOrderflowProxyCredentials {
                tls_cert: cert.to_string(),
                ecdsa_pubkey_address: Address::repeat_byte(0x42),
            },
        }
    }

    fn request(origin: Origin) -> ParsedRequest {
        let params: Box<RawValue> = RawValue::from_string("[{}]".to_string()).unwrap();
        ParsedRequest {
            method: OrderflowMethod::EthSendBundle,
            params: params.into(),
            signer: Address::ZERO,
            origin,
            received_at: Instant::now(),
            unique_key: Uuid::new_v4(),
            uuid: Uuid::new_v4(),
            replacement_nonce: None,
            block_number_hint: None,
        }
    }

    #[test]
    fn unchanged_peer_keeps_its_sink() {
        let a = builder("a", "192.0.2.1", "cert-a");
        assert!(!sink_changed(&a, &a.clone()));
    }

    #[test]
    fn address_or_cert_change_rebuilds_sink() {
        let a = builder("a", "192.0.2.1", "cert-a");
        assert!(sink_changed(&a, &builder("a", "192.0.2.9", "cert-a")));
        assert!(sink_changed(&a, &builder("a", "192.0.2.1", "cert-b")));
    }

    #[test]
    fn peer_requests_are_delivered_locally_but_not_rebroadcast() {
        let (local_sender, local_receiver) = async_channel::bounded(8);
        let (peer_sender, peer_receiver) = async_channel::bounded(8);
        let mut peers = HashMap::new();
        peers.insert(
            "peer-a".to_string(),
            PeerSink {
                builder: builder("peer-a", "192.0.2.1", "cert-a"),
                sender: peer_sender,
            },
        );

        dispatch(&local_sender, &peers, request(Origin::SystemPeer));
        assert!(local_receiver.try_recv().is_ok());
        assert!(peer_receiver.try_recv().is_err());

        dispatch(&local_sender, &peers, request(Origin::User));
        assert!(local_receiver.try_recv().is_ok());
        assert!(peer_receiver.try_recv().is_ok());

        dispatch(&local_sender, &peers, request(Origin::Flashbots));
        assert!(local_receiver.try_recv().is_ok());
        assert!(peer_receiver.try_recv().is_ok());
    }
}
