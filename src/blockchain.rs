use anyhow::{anyhow, Result};
use async_trait::async_trait;
use ethers::{
    providers::{Http, Middleware, Provider, Ws},
    types::{Address, BlockNumber, U256},
};
use futures::StreamExt;
use serde_json::json;
use std::{future::Future, time::Duration};
use tokio::{sync::mpsc, time::timeout};
use tracing::{debug, info, warn};

use crate::{
    config::{FeedConfig, RelayConfig},
    error::WorkerError,
    external::traits::{EventFeed, FeedEvent, FeedStream, NonceSource},
    types::{PartitionKey, SignalKind},
};

const FEED_BUFFER: usize = 256;

struct RpcEndpoint {
    url: String,
    provider: Provider<Http>,
}

/// HTTP chain client used by the controller to fetch nonce baselines.
///
/// Every call walks the RPC pool in order and returns the first answer that
/// arrives within the stall timeout.
pub struct BlockchainClient {
    endpoints: Vec<RpcEndpoint>,
    stall_timeout: Duration,
    chain_id: u64,
    account: Address,
}

impl BlockchainClient {
    pub async fn new(relay: &RelayConfig, feed: &FeedConfig) -> Result<Self> {
        let account = feed
            .account_address
            .as_deref()
            .ok_or_else(|| anyhow!("feed.account_address is not configured"))
            .and_then(parse_address)?;

        Self::connect(&relay.rpc_pool, account, relay.stall_timeout()).await
    }

    pub async fn connect(urls: &[String], account: Address, stall_timeout: Duration) -> Result<Self> {
        if urls.is_empty() {
            return Err(anyhow!("Relay RPC pool is empty"));
        }

        let endpoints = urls
            .iter()
            .map(|url| {
                Provider::<Http>::try_from(url.as_str())
                    .map(|provider| RpcEndpoint {
                        url: url.clone(),
                        provider,
                    })
                    .map_err(|e| anyhow!("Failed to create provider for {}: {}", url, e))
            })
            .collect::<Result<Vec<_>>>()?;

        info!("Connecting to chain RPC pool of {} endpoints", endpoints.len());

        let chain_id = first_responding(&endpoints, stall_timeout, |provider| provider.get_chainid())
            .await
            .map_err(|e| anyhow!("Failed to get chain ID: {}", e))?;

        info!("Connected to chain {} for nonce baselines", chain_id);

        Ok(Self {
            endpoints,
            stall_timeout,
            chain_id: chain_id.as_u64(),
            account,
        })
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }
}

#[async_trait]
impl NonceSource for BlockchainClient {
    async fn baseline(&self, partition: &PartitionKey) -> Result<u64> {
        if partition.as_str() != self.chain_id.to_string() {
            return Err(anyhow!(
                "Partition {} does not match chain ID {}",
                partition,
                self.chain_id
            ));
        }

        let account = self.account;
        let count = first_responding(&self.endpoints, self.stall_timeout, |provider| {
            provider.get_transaction_count(account, Some(BlockNumber::Pending.into()))
        })
        .await
        .map_err(|e| anyhow!("Failed to get transaction count: {}", e))?;

        debug!("Pending transaction count for {:?}: {}", self.account, count);
        Ok(count.as_u64())
    }
}

async fn first_responding<'a, T, E, F, Fut>(
    endpoints: &'a [RpcEndpoint],
    stall_timeout: Duration,
    call: F,
) -> Result<T>
where
    F: Fn(&'a Provider<Http>) -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: std::fmt::Display,
{
    let mut failures = Vec::with_capacity(endpoints.len());
    for endpoint in endpoints {
        match timeout(stall_timeout, call(&endpoint.provider)).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) => {
                warn!("RPC {} failed: {}", endpoint.url, e);
                failures.push(format!("{}: {}", endpoint.url, e));
            }
            Err(_) => {
                warn!("RPC {} stalled for {:?}", endpoint.url, stall_timeout);
                failures.push(format!("{}: stalled", endpoint.url));
            }
        }
    }

    Err(anyhow!("no RPC endpoint answered ({})", failures.join("; ")))
}

/// Websocket feed of new blocks and pending transactions above a value threshold.
pub struct ChainFeed {
    ws_url: String,
    min_activity_value: U256,
}

impl ChainFeed {
    pub fn new(config: &FeedConfig) -> Result<Self> {
        let min_activity_value = U256::from_dec_str(&config.min_activity_value_wei)
            .map_err(|e| anyhow!("Invalid min_activity_value_wei: {}", e))?;

        Ok(Self {
            ws_url: config.ws_url.clone(),
            min_activity_value,
        })
    }
}

#[async_trait]
impl EventFeed for ChainFeed {
    async fn connect(&self, partition: &PartitionKey) -> std::result::Result<FeedStream, WorkerError> {
        if self.ws_url.trim().is_empty() {
            return Err(WorkerError::FatalConfig("feed.ws_url is empty".to_string()));
        }

        let provider = Provider::<Ws>::connect(self.ws_url.as_str())
            .await
            .map_err(|e| WorkerError::classify(&anyhow!("Failed to connect feed: {}", e)))?;

        let chain_id = provider
            .get_chainid()
            .await
            .map_err(|e| WorkerError::classify(&anyhow!("Failed to get chain ID: {}", e)))?;

        if partition.as_str() != chain_id.to_string() {
            return Err(WorkerError::FatalConfig(format!(
                "Chain ID mismatch: partition {}, feed reports {}",
                partition, chain_id
            )));
        }

        let (tx, rx) = mpsc::channel(FEED_BUFFER);
        tokio::spawn(forward_events(
            provider,
            partition.clone(),
            self.min_activity_value,
            tx,
        ));

        Ok(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed())
    }
}

async fn forward_events(
    provider: Provider<Ws>,
    partition: PartitionKey,
    min_activity_value: U256,
    tx: mpsc::Sender<std::result::Result<FeedEvent, WorkerError>>,
) {
    let mut blocks = match provider.subscribe_blocks().await {
        Ok(stream) => stream,
        Err(e) => {
            let _ = tx
                .send(Err(WorkerError::classify(&anyhow!("Block subscription failed: {}", e))))
                .await;
            return;
        }
    };

    let mut pending = match provider.subscribe_pending_txs().await {
        Ok(stream) => stream,
        Err(e) => {
            let _ = tx
                .send(Err(WorkerError::classify(&anyhow!("Pending subscription failed: {}", e))))
                .await;
            return;
        }
    };

    loop {
        let event = tokio::select! {
            _ = tx.closed() => break,
            block = blocks.next() => match block {
                Some(block) => FeedEvent {
                    kind: SignalKind::NewBlock,
                    partition_key: partition.clone(),
                    payload: json!({ "block_number": block.number.map(|n| n.as_u64()) }),
                },
                None => {
                    let _ = tx
                        .send(Err(WorkerError::TransientNetwork("block subscription closed".into())))
                        .await;
                    break;
                }
            },
            hash = pending.next() => match hash {
                Some(hash) => match provider.get_transaction(hash).await {
                    Ok(Some(transaction)) if transaction.value >= min_activity_value => FeedEvent {
                        kind: SignalKind::Activity,
                        partition_key: partition.clone(),
                        payload: json!({
                            "tx_hash": format!("{:?}", hash),
                            "value_wei": transaction.value.to_string(),
                        }),
                    },
                    Ok(_) => continue,
                    Err(e) => {
                        debug!("Skipping pending transaction {:?}: {}", hash, e);
                        continue;
                    }
                },
                None => {
                    let _ = tx
                        .send(Err(WorkerError::TransientNetwork("pending subscription closed".into())))
                        .await;
                    break;
                }
            },
        };

        if tx.send(Ok(event)).await.is_err() {
            break;
        }
    }

    warn!("Feed forwarder for partition {} stopped", partition);
}

pub fn parse_address(address_str: &str) -> Result<Address> {
    address_str
        .parse::<Address>()
        .map_err(|e| anyhow!("Invalid address format '{}': {}", address_str, e))
}
