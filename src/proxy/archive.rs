use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use alloy::primitives::Address;
use metrics::counter;
use serde::Serialize;
use serde_json::value::RawValue;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::block_number::BlockNumberSource;
use crate::jsonrpc::RpcClient;
use crate::proxy::request::ParsedRequest;

pub const ARCHIVE_METHOD: &str = "flashbots_newOrderflowEvents";

/// A batch with pending requests is closed after this long without new
/// arrivals, so orderflow is not held hostage by a quiet network.
pub const ARCHIVE_BATCH_IDLE: Duration = Duration::from_millis(500);

const CLOSED_BATCH_CAPACITY: usize = 16;
const ARCHIVE_CALL_TIMEOUT: Duration = Duration::from_secs(10);
const ARCHIVE_BACKOFF: [Duration; 5] = [
    Duration::from_millis(200),
    Duration::from_millis(400),
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(5),
];

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchivedEvent {
    method: &'static str,
    params: Box<RawValue>,
    signer: Address,
    received_at_ms: u64,
}

impl From<&ParsedRequest> for ArchivedEvent {
    fn from(request: &ParsedRequest) -> Self {
        let received_at_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis() as u64)
            .unwrap_or_default();
        Self {
            method: request.method.as_str(),
            params: RawValue::from_string(request.params.get().to_string())
                .expect("params round-trip through RawValue"),
            signer: request.signer,
            received_at_ms,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveBatch {
    block_number: u64,
    orderflow: Vec<ArchivedEvent>,
}

/// Groups requests by the block they were observed under. A batch closes
/// when the chain advances past its block, on explicit flush, or after the
/// idle window.
#[derive(Default)]
struct Batcher {
    open: Option<ArchiveBatch>,
}

impl Batcher {
    /// Appends an event observed at `block`. Returns the previous batch when
    /// the block number advanced past it.
    fn append(&mut self, block: u64, event: ArchivedEvent) -> Option<ArchiveBatch> {
        let closed = match &self.open {
            Some(batch) if block > batch.block_number => self.open.take(),
            _ => None,
        };
        self.open
            .get_or_insert_with(|| ArchiveBatch {
                block_number: block,
                orderflow: Vec::new(),
            })
            .orderflow
            .push(event);
        closed
    }

    fn take(&mut self) -> Option<ArchiveBatch> {
        self.open.take()
    }

    fn is_open(&self) -> bool {
        self.open.is_some()
    }
}

pub struct ArchiveQueue {
    pub queue: mpsc::Receiver<ParsedRequest>,
    pub flush_queue: mpsc::Receiver<()>,
    pub archive_client: RpcClient,
    pub block_numbers: Arc<BlockNumberSource>,
    pub worker_count: usize,
}

impl ArchiveQueue {
    pub async fn run(mut self) {
        let (batch_sender, batch_receiver) = async_channel::bounded(CLOSED_BATCH_CAPACITY);
        let mut uploaders = tokio::task::JoinSet::new();
        for _ in 0..self.worker_count {
            uploaders.spawn(run_uploader(
                self.archive_client.clone(),
                batch_receiver.clone(),
            ));
        }

        let mut batcher = Batcher::default();
        let mut flush_open = true;
        let mut idle_deadline = tokio::time::Instant::now();
        loop {
            tokio::select! {
                request = self.queue.recv() => {
                    let Some(request) = request else { break };
                    let block = self.block_numbers.current_block().await;
                    if let Some(closed) = batcher.append(block, ArchivedEvent::from(&request)) {
                        enqueue_batch(&batch_sender, closed).await;
                    }
                    idle_deadline = tokio::time::Instant::now() + ARCHIVE_BATCH_IDLE;
                }
                flush = self.flush_queue.recv(), if flush_open => {
                    if flush.is_none() {
                        flush_open = false;
                        continue;
                    }
                    if let Some(closed) = batcher.take() {
                        enqueue_batch(&batch_sender, closed).await;
                    }
                }
                _ = tokio::time::sleep_until(idle_deadline), if batcher.is_open() => {
                    if let Some(closed) = batcher.take() {
                        debug!(block = closed.block_number, "Closing idle archive batch");
                        enqueue_batch(&batch_sender, closed).await;
                    }
                }
            }
        }

        if let Some(closed) = batcher.take() {
            enqueue_batch(&batch_sender, closed).await;
        }
        drop(batch_sender);
        while uploaders.join_next().await.is_some() {}
        info!("Archive queue closed");
    }
}

async fn enqueue_batch(sender: &async_channel::Sender<ArchiveBatch>, batch: ArchiveBatch) {
    counter!("orderflow_proxy_archive_batches_total").increment(1);
    if sender.send(batch).await.is_err() {
        warn!("Archive upload workers are gone, dropping batch");
    }
}

async fn run_uploader(client: RpcClient, receiver: async_channel::Receiver<ArchiveBatch>) {
    while let Ok(batch) = receiver.recv().await {
        upload_with_retries(&client, batch).await;
    }
}

async fn upload_with_retries(client: &RpcClient, batch: ArchiveBatch) {
    let params = match serde_json::value::to_raw_value(&[&batch]) {
        Ok(params) => params,
        Err(err) => {
            warn!(?err, "Failed to serialize archive batch");
            return;
        }
    };

    for backoff in ARCHIVE_BACKOFF {
        match client.call(ARCHIVE_METHOD, &params, ARCHIVE_CALL_TIMEOUT).await {
            Ok(()) => return,
            Err(err) => {
                debug!(?err, block = batch.block_number, "Archive upload attempt failed");
                tokio::time::sleep(backoff).await;
            }
        }
    }
    if let Err(err) = client.call(ARCHIVE_METHOD, &params, ARCHIVE_CALL_TIMEOUT).await {
        counter!("orderflow_proxy_archive_failures_total").increment(1);
        warn!(
            ?err,
            block = batch.block_number,
            "Dropping archive batch after retries"
        );
    }
}
