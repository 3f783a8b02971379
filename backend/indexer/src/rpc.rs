//! EVM JSON-RPC log source: `eth_getLogs` over HTTP for backfill and
//! `eth_subscribe("logs")` over WebSocket for live watching.
//!
//! ## Resilience
//!
//! * Rate-limit responses, server errors, transport failures and soft
//!   JSON-RPC errors are retried with exponential back-off, up to the
//!   configured attempt budget; after that the call fails with
//!   [`IndexerError::TransientSource`].
//! * Subscriptions are not reconnected here; the watcher re-subscribes.

use std::time::Duration;

use alloy_primitives::{Address, Bytes, B256};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{channel::mpsc, Sink, SinkExt, Stream, StreamExt};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use serde_json::{json, Value};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::abi::EventSchema;
use crate::chunker::BlockRange;
use crate::errors::{IndexerError, Result};

pub(crate) const MAX_BACKOFF_SECS: u64 = 60;
pub(crate) const INITIAL_BACKOFF_SECS: u64 = 2;

/// Upper bound on logs grouped into one delivered batch.
const MAX_BATCH: usize = 256;

// ─────────────────────────────────────────────────────────
// Log shape
// ─────────────────────────────────────────────────────────

/// A raw EVM log as returned by `eth_getLogs` and `eth_subscription`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawLog {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
    #[serde(deserialize_with = "quantity")]
    pub block_number: u64,
    #[serde(deserialize_with = "quantity")]
    pub log_index: u64,
    #[serde(default)]
    pub transaction_hash: Option<B256>,
    /// Set when a reorg dropped the log after delivery.
    #[serde(default)]
    pub removed: bool,
}

fn quantity<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<u64, D::Error> {
    let raw = String::deserialize(deserializer)?;
    parse_quantity(&raw).map_err(serde::de::Error::custom)
}

fn parse_quantity(raw: &str) -> std::result::Result<u64, String> {
    let digits = raw
        .strip_prefix("0x")
        .ok_or_else(|| format!("quantity {raw:?} is not 0x-prefixed"))?;
    u64::from_str_radix(digits, 16).map_err(|e| format!("quantity {raw:?}: {e}"))
}

// ─────────────────────────────────────────────────────────
// Capability
// ─────────────────────────────────────────────────────────

/// Batches of logs in arrival order, as delivered by a subscription.
pub type LogBatchStream = BoxStream<'static, Result<Vec<RawLog>>>;

/// Where logs come from. Everything else in the indexer only talks to this.
#[async_trait]
pub trait LogSource: Send + Sync {
    /// Latest block number known to the source.
    async fn current_head(&self) -> Result<u64>;

    /// Logs of `schema` emitted by `address` within `range`.
    async fn fetch_logs(
        &self,
        address: Address,
        schema: &EventSchema,
        range: BlockRange,
    ) -> Result<Vec<RawLog>>;

    /// Long-lived subscription to new logs of `schema` emitted by `address`.
    async fn subscribe(&self, address: Address, schema: &EventSchema) -> Result<LogBatchStream>;
}

// ─────────────────────────────────────────────────────────
// JSON-RPC response shapes
// ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

impl RpcError {
    /// Invalid request / method not found will not succeed on retry.
    fn is_hard(&self) -> bool {
        self.code == -32600 || self.code == -32601
    }
}

// ─────────────────────────────────────────────────────────
// JSON-RPC source
// ─────────────────────────────────────────────────────────

pub struct JsonRpcSource {
    client: Client,
    http_url: String,
    ws_url: String,
    max_retries: u32,
    initial_backoff: Duration,
}

impl JsonRpcSource {
    /// `client` should carry the request timeout.
    pub fn new(
        client: Client,
        http_url: impl Into<String>,
        ws_url: impl Into<String>,
        max_retries: u32,
    ) -> Self {
        Self {
            client,
            http_url: http_url.into(),
            ws_url: ws_url.into(),
            max_retries,
            initial_backoff: Duration::from_secs(INITIAL_BACKOFF_SECS),
        }
    }

    /// First retry delay; doubles per attempt up to [`MAX_BACKOFF_SECS`].
    pub fn with_initial_backoff(mut self, delay: Duration) -> Self {
        self.initial_backoff = delay;
        self
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T> {
        let max_backoff = Duration::from_secs(MAX_BACKOFF_SECS);
        let mut backoff = self.initial_backoff;
        let mut attempt = 0u32;

        loop {
            let response = self
                .client
                .post(&self.http_url)
                .json(&json!({
                    "jsonrpc": "2.0",
                    "id": 1,
                    "method": method,
                    "params": params,
                }))
                .send()
                .await;

            let failure = match response {
                Err(e) => format!("request failed: {e}"),
                Ok(resp) => {
                    let status = resp.status();
                    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                        "rate-limited".to_string()
                    } else if status.is_server_error() {
                        format!("server error {status}")
                    } else {
                        let body: RpcResponse<T> = resp.error_for_status()?.json().await?;
                        match (body.result, body.error) {
                            (_, Some(err)) if err.is_hard() => {
                                return Err(IndexerError::TransientSource(format!(
                                    "{method} hard error {}: {}",
                                    err.code, err.message
                                )));
                            }
                            (_, Some(err)) => format!("soft error {} {}", err.code, err.message),
                            (Some(result), None) => return Ok(result),
                            (None, None) => {
                                return Err(IndexerError::TransientSource(format!(
                                    "empty result from {method}"
                                )));
                            }
                        }
                    }
                }
            };

            if attempt >= self.max_retries {
                return Err(IndexerError::TransientSource(format!(
                    "{method} gave up after {} attempts: {failure}",
                    attempt + 1
                )));
            }
            attempt += 1;
            warn!(method, attempt, "RPC {failure} (will retry in {backoff:?})");
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(max_backoff);
        }
    }
}

#[async_trait]
impl LogSource for JsonRpcSource {
    async fn current_head(&self) -> Result<u64> {
        let head: String = self.call("eth_blockNumber", json!([])).await?;
        parse_quantity(&head).map_err(IndexerError::TransientSource)
    }

    async fn fetch_logs(
        &self,
        address: Address,
        schema: &EventSchema,
        range: BlockRange,
    ) -> Result<Vec<RawLog>> {
        let mut filter = log_filter(address, schema);
        filter["fromBlock"] = json!(format!("{:#x}", range.from));
        filter["toBlock"] = json!(format!("{:#x}", range.to));

        let logs: Vec<RawLog> = self.call("eth_getLogs", json!([filter])).await?;
        debug!(event = schema.name, %range, count = logs.len(), "Fetched logs");
        Ok(logs)
    }

    async fn subscribe(&self, address: Address, schema: &EventSchema) -> Result<LogBatchStream> {
        let (ws_stream, _) = connect_async(self.ws_url.as_str()).await?;
        let (mut write, read) = ws_stream.split();

        let sub_msg = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "eth_subscribe",
            "params": ["logs", log_filter(address, schema)],
        });
        write.send(Message::Text(sub_msg.to_string())).await?;
        info!(event = schema.name, %address, "eth_subscribe sent");

        let (tx, rx) = mpsc::channel::<Result<RawLog>>(MAX_BATCH);
        let stop = CancellationToken::new();
        // Dropping the returned stream stops the reader and closes the socket.
        let guard = stop.clone().drop_guard();
        tokio::spawn(forward_frames(read, write, tx, stop, schema.name));

        Ok(rx
            .ready_chunks(MAX_BATCH)
            .flat_map(move |items| {
                let _ = &guard;
                futures::stream::iter(into_batches(items))
            })
            .boxed())
    }
}

/// Pump subscription frames into `tx` until the socket closes, a terminal
/// error is forwarded, or `stop` fires.
///
/// A frame whose log cannot be decoded is skipped; only transport errors and
/// a rejected subscription end the loop.
async fn forward_frames<R, W>(
    mut read: R,
    mut write: W,
    mut tx: mpsc::Sender<Result<RawLog>>,
    stop: CancellationToken,
    event: &'static str,
) where
    R: Stream<Item = std::result::Result<Message, WsError>> + Unpin,
    W: Sink<Message> + Unpin,
{
    loop {
        let msg = tokio::select! {
            _ = stop.cancelled() => {
                debug!(event, "Subscription dropped by consumer");
                break;
            }
            msg = read.next() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };
        let item = match msg {
            Err(e) => Err(IndexerError::from(e)),
            Ok(Message::Text(text)) => match parse_subscription_message(&text) {
                Some(item) => item,
                None => continue,
            },
            Ok(Message::Ping(data)) => {
                let _ = write.send(Message::Pong(data)).await;
                continue;
            }
            Ok(Message::Close(_)) => {
                info!(event, "WebSocket closed by server");
                break;
            }
            Ok(_) => continue,
        };
        match item {
            Err(e) if e.is_event_scoped() => {
                warn!(event, "Skipping subscription frame: {e}");
            }
            item => {
                let terminal = item.is_err();
                if tx.send(item).await.is_err() || terminal {
                    break;
                }
            }
        }
    }
    let _ = write.close().await;
    debug!(event, "Subscription loop ended");
}

fn log_filter(address: Address, schema: &EventSchema) -> Value {
    json!({
        "address": address,
        "topics": [schema.topic0()],
    })
}

const SUBSCRIPTION_FRAME: &str = "eth_subscription";

/// Interpret one WebSocket text frame.
///
/// Returns `None` for frames that carry no log (e.g. the subscription id
/// confirmation).
fn parse_subscription_message(text: &str) -> Option<Result<RawLog>> {
    let v: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => return Some(Err(IndexerError::malformed(SUBSCRIPTION_FRAME, e.to_string()))),
    };

    if let Some(err) = v.get("error") {
        return Some(Err(IndexerError::TransientSource(format!(
            "subscription rejected: {err}"
        ))));
    }
    if v.get("method").and_then(Value::as_str) != Some("eth_subscription") {
        return None;
    }

    let result = v.get("params")?.get("result")?.clone();
    Some(
        serde_json::from_value(result)
            .map_err(|e| IndexerError::malformed(SUBSCRIPTION_FRAME, e.to_string())),
    )
}

/// Group logs that arrived together into batches, keeping any error in its
/// arrival position.
fn into_batches(items: Vec<Result<RawLog>>) -> Vec<Result<Vec<RawLog>>> {
    let mut batches = Vec::new();
    let mut current = Vec::new();
    for item in items {
        match item {
            Ok(log) => current.push(log),
            Err(e) => {
                if !current.is_empty() {
                    batches.push(Ok(std::mem::take(&mut current)));
                }
                batches.push(Err(e));
            }
        }
    }
    if !current.is_empty() {
        batches.push(Ok(current));
    }
    batches
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────
