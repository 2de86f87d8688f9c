use std::time::{Duration, Instant};

use alloy::providers::{Provider, RootProvider};
use alloy::transports::http::Http;
use parking_lot::Mutex;
use tracing::warn;
use url::Url;

const BLOCK_NUMBER_TTL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, Default)]
struct CachedBlock {
    number: u64,
    fetched_at: Option<Instant>,
    stale: bool,
}

/// Caching view over `eth_blockNumber`. The block number is only a batching
/// hint, so fetch failures fall back to the last known value instead of
/// propagating.
pub struct BlockNumberSource {
    provider: RootProvider<Http<reqwest::Client>>,
    cached: Mutex<CachedBlock>,
}

impl BlockNumberSource {
    pub fn new(rpc_endpoint: Url) -> Self {
        Self {
            provider: RootProvider::new_http(rpc_endpoint),
            cached: Mutex::new(CachedBlock::default()),
        }
    }

    pub async fn current_block(&self) -> u64 {
        {
            let cached = self.cached.lock();
            if let Some(fetched_at) = cached.fetched_at {
                if fetched_at.elapsed() < BLOCK_NUMBER_TTL {
                    return cached.number;
                }
            }
        }

        match self.provider.get_block_number().await {
            Ok(number) => {
                let mut cached = self.cached.lock();
                *cached = CachedBlock {
                    number,
                    fetched_at: Some(Instant::now()),
                    stale: false,
                };
                number
            }
            Err(err) => {
                let mut cached = self.cached.lock();
                if !cached.stale {
                    warn!(?err, "Failed to fetch block number, serving cached value");
                }
                cached.stale = true;
                // Refresh the timestamp so a flapping node is not hammered.
                cached.fetched_at = Some(Instant::now());
                cached.number
            }
        }
    }
}
