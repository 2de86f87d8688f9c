pub mod archive;
pub mod handler;
pub mod request;
pub mod share;

use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::Address;
use eyre::eyre::WrapErr;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::block_number::BlockNumberSource;
use crate::cache::{DedupCache, ReplacementNonceCache};
use crate::config::Config;
use crate::confighub::{BuilderConfigHub, ConfighubBuilder, ConfighubOrderflowProxyCredentials};
use crate::identity::Identity;
use crate::jsonrpc::RpcClient;
use crate::proxy::archive::ArchiveQueue;
use crate::proxy::handler::UserRateLimiter;
use crate::proxy::request::ParsedRequest;
use crate::proxy::share::ShareQueue;

pub const PEER_UPDATE_INTERVAL: Duration = Duration::from_secs(5 * 60);

const SHARE_INGRESS_CAPACITY: usize = 1024;
const ARCHIVE_INGRESS_CAPACITY: usize = 1024;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// State shared with the request handlers. Constructed once by the
/// supervisor; handlers only ever see it behind an `Arc`.
pub struct OrderflowProxy {
    pub flashbots_signer: Address,
    pub max_request_body_size_bytes: usize,
    pub cert_pem: String,
    pub local_builder: RpcClient,
    pub dedup: DedupCache,
    pub replacement_nonces: ReplacementNonceCache,
    pub peers: RwLock<Vec<ConfighubBuilder>>,
    pub user_rate_limiter: Option<UserRateLimiter>,
    share_sender: Mutex<Option<mpsc::Sender<ParsedRequest>>>,
    archive_sender: Mutex<Option<mpsc::Sender<ParsedRequest>>>,
}

impl OrderflowProxy {
    pub(crate) fn share_sender(&self) -> Option<mpsc::Sender<ParsedRequest>> {
        self.share_sender.lock().clone()
    }

    pub(crate) fn archive_sender(&self) -> Option<mpsc::Sender<ParsedRequest>> {
        self.archive_sender.lock().clone()
    }

    /// After this no new work reaches the queues; they drain and exit.
    fn close_ingress(&self) {
        self.share_sender.lock().take();
        self.archive_sender.lock().take();
    }
}

/// Owns the queues, the peer-refresh loop, and every inter-component
/// channel. Sub-components receive only the endpoint they need.
pub struct Supervisor {
    pub proxy: Arc<OrderflowProxy>,
    cancel: CancellationToken,
    flush_sender: mpsc::Sender<()>,
    tasks: JoinSet<()>,
}

impl Supervisor {
    pub async fn start(
        config: &Config,
        identity: &Identity,
        cancel: CancellationToken,
    ) -> eyre::Result<Self> {
        let confighub = Arc::new(
            BuilderConfigHub::new(config.builder_confighub_endpoint.clone())
                .wrap_err("invalid config hub endpoint")?,
        );

        confighub
            .register_credentials(
                &cancel,
                ConfighubOrderflowProxyCredentials {
                    tls_cert: identity.cert_pem().to_string(),
                    ecdsa_pubkey_address: identity.address(),
                },
            )
            .await
            .wrap_err("failed to register credentials on config hub")?;

        let roster = match confighub.builders(false).await {
            Ok(roster) => roster,
            Err(err) => {
                warn!(?err, "Initial peer fetch failed, starting without peers");
                Vec::new()
            }
        };
        info!(peers = roster.len(), "Fetched initial peer set");

        let (share_sender, share_receiver) = mpsc::channel(SHARE_INGRESS_CAPACITY);
        let (archive_sender, archive_receiver) = mpsc::channel(ARCHIVE_INGRESS_CAPACITY);
        let (flush_sender, flush_receiver) = mpsc::channel(1);
        let (peers_watch_sender, peers_watch_receiver) = watch::channel(roster.clone());

        let local_builder = RpcClient::new(
            config.builder_endpoint.clone(),
            reqwest::Client::new(),
        )
        .with_signer(identity.signer());
        let archive_client = RpcClient::new(
            config.orderflow_archive_endpoint.clone(),
            reqwest::Client::new(),
        )
        .with_signer(identity.signer());

        let proxy = Arc::new(OrderflowProxy {
            flashbots_signer: config.flashbots_orderflow_signer_address,
            max_request_body_size_bytes: config.max_request_body_size_bytes,
            cert_pem: identity.cert_pem().to_string(),
            local_builder,
            dedup: DedupCache::new(),
            replacement_nonces: ReplacementNonceCache::new(),
            peers: RwLock::new(roster),
            user_rate_limiter: UserRateLimiter::new(config.max_user_rps),
            share_sender: Mutex::new(Some(share_sender)),
            archive_sender: Mutex::new(Some(archive_sender)),
        });

        let mut tasks = JoinSet::new();
        tasks.spawn(
            ShareQueue {
                queue: share_receiver,
                update_peers: peers_watch_receiver,
                local_builder: proxy.local_builder.clone(),
                signer: identity.signer(),
                workers_per_peer: config.connections_per_peer,
            }
            .run(),
        );
        tasks.spawn(
            ArchiveQueue {
                queue: archive_receiver,
                flush_queue: flush_receiver,
                archive_client,
                block_numbers: Arc::new(BlockNumberSource::new(config.rpc_endpoint.clone())),
                worker_count: config.archive_worker_count,
            }
            .run(),
        );
        tasks.spawn(run_peer_refresh(
            proxy.clone(),
            confighub,
            peers_watch_sender,
            cancel.clone(),
        ));

        Ok(Self {
            proxy,
            cancel,
            flush_sender,
            tasks,
        })
    }

    /// Forces the archive queue to close and upload the open batch.
    pub fn flush_archive(&self) {
        // Single-slot channel; a pending flush already covers this one.
        let _ = self.flush_sender.try_send(());
    }

    /// Stops background tasks and drains the queues within a bounded grace
    /// period. Listeners must already have stopped accepting requests.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        self.proxy.close_ingress();
        drop(self.flush_sender);

        let drain = async {
            while self.tasks.join_next().await.is_some() {}
        };
        if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
            warn!("Queues did not drain in time, aborting remaining tasks");
        }
    }
}

/// Periodically re-fetches the roster; the share queue picks the update up
/// through the watch channel, request handlers through the shared lock.
/// Fetch failures keep the previous roster.
async fn run_peer_refresh(
    proxy: Arc<OrderflowProxy>,
    confighub: Arc<BuilderConfigHub>,
    update_peers: watch::Sender<Vec<ConfighubBuilder>>,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(PEER_UPDATE_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The supervisor already fetched the initial roster.
    interval.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                match confighub.builders(false).await {
                    Ok(roster) => {
                        *proxy.peers.write() = roster.clone();
                        let _ = update_peers.send(roster);
                    }
                    Err(err) => warn!(?err, "Failed to update peers"),
                }
            }
        }
    }
}
