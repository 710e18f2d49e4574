use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::{
    config::RelayConfig,
    external::traits::{ActionExecutor, ActionOutcome, PayloadBuilder},
    types::{ReservationGrant, SignalMessage},
};

/// Broadcasts a prebuilt payload as `eth_sendRawTransaction` to every RPC in
/// the pool. Succeeds if at least one endpoint accepted it.
pub struct RelayExecutor<B: PayloadBuilder> {
    client: reqwest::Client,
    rpc_pool: Vec<String>,
    builder: Arc<B>,
}

impl<B: PayloadBuilder> RelayExecutor<B> {
    pub fn new(config: &RelayConfig, builder: Arc<B>) -> Result<Self> {
        if config.rpc_pool.is_empty() {
            return Err(anyhow!("Relay RPC pool is empty"));
        }

        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| anyhow!("Failed to create HTTP client: {}", e))?;

        Ok(Self {
            client,
            rpc_pool: config.rpc_pool.clone(),
            builder,
        })
    }

    async fn broadcast(&self, body: &Value) -> Vec<Result<String>> {
        let sends = self.rpc_pool.iter().map(|url| async move {
            let response = self
                .client
                .post(url)
                .json(body)
                .send()
                .await
                .map_err(|e| anyhow!("Relay {} failed: {}", url, e))?;

            if !response.status().is_success() {
                return Err(anyhow!("Relay {} answered {}", url, response.status()));
            }

            let reply: Value = response
                .json()
                .await
                .map_err(|e| anyhow!("Relay {} sent malformed reply: {}", url, e))?;
            parse_send_raw_reply(&reply)
        });

        futures::future::join_all(sends).await
    }
}

#[async_trait]
impl<B: PayloadBuilder> ActionExecutor for RelayExecutor<B> {
    async fn execute(&self, grant: &ReservationGrant, signal: &SignalMessage) -> Result<ActionOutcome> {
        let payload = match self.builder.build(grant, signal).await? {
            Some(payload) => payload,
            None => {
                return Ok(ActionOutcome::Skipped {
                    reason: "payload builder declined".to_string(),
                })
            }
        };

        let body = send_raw_request(&payload);
        let results = self.broadcast(&body).await;

        let mut accepted = None;
        for result in results {
            match result {
                Ok(hash) => {
                    debug!("Relay accepted payload for nonce {}: {}", grant.nonce, hash);
                    accepted.get_or_insert(hash);
                }
                Err(e) => warn!("{}", e),
            }
        }

        match accepted {
            Some(reference) => {
                info!(
                    "Submitted action for partition {} with nonce {}",
                    grant.partition_key, grant.nonce
                );
                Ok(ActionOutcome::Submitted { reference })
            }
            None => Err(anyhow!(
                "No relay accepted the payload for nonce {}",
                grant.nonce
            )),
        }
    }
}

pub fn send_raw_request(payload: &[u8]) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": "eth_sendRawTransaction",
        "params": [format!("0x{}", hex::encode(payload))],
    })
}

fn parse_send_raw_reply(reply: &Value) -> Result<String> {
    if let Some(error) = reply.get("error") {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error");
        return Err(anyhow!("Relay rejected payload: {}", message));
    }

    reply
        .get("result")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| anyhow!("Relay reply has no result"))
}
