use async_trait::async_trait;
use eventsource_stream::{Event, EventStreamError, Eventsource};
use futures::StreamExt;
use reqwest::header::ACCEPT;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const RECONNECT_DELAY: Duration = Duration::from_secs(3);
const NOTIFICATION_BUFFER: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} answered with status {status}")]
    Status { url: String, status: StatusCode },

    #[error("malformed block response: {0}")]
    Malformed(String),

    #[error("bad event stream from {url}: {message}")]
    EventStream { url: String, message: String },
}

impl TransportError {
    fn malformed(msg: impl Into<String>) -> Self {
        Self::Malformed(msg.into())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockId {
    Head,
    Slot(u64),
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockId::Head => f.write_str("head"),
            BlockId::Slot(slot) => write!(f, "{slot}"),
        }
    }
}

/// The two things we need out of a block: its slot and raw graffiti hex.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockRecord {
    pub slot: u64,
    pub graffiti: String,
}

/// Something we can pull blocks from.
#[async_trait]
pub trait BlockSource: Send + Sync {
    async fn fetch_block(&self, id: BlockId) -> Result<BlockRecord, TransportError>;

    async fn head_slot(&self) -> Result<u64, TransportError> {
        Ok(self.fetch_block(BlockId::Head).await?.slot)
    }
}

/// Delivered by the block event stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notification {
    /// The stream (re)connected.
    Opened,
    /// A new block was announced. The slot is informational only.
    Block { slot: Option<u64> },
}

#[derive(Debug, Deserialize)]
struct BlockResponse {
    data: Option<SignedBlock>,
}

#[derive(Debug, Deserialize)]
struct SignedBlock {
    message: Option<BlockMessage>,
}

#[derive(Debug, Deserialize)]
struct BlockMessage {
    slot: Value,
    body: BlockBody,
}

#[derive(Debug, Deserialize)]
struct BlockBody {
    graffiti: String,
}

/// Slots come as decimal strings from the beacon API, but accept numbers too.
fn slot_from_value(value: &Value) -> Option<u64> {
    match value {
        Value::String(raw) => raw.parse().ok(),
        Value::Number(num) => num.as_u64(),
        _ => None,
    }
}

pub fn parse_block_response(raw: &[u8]) -> Result<BlockRecord, TransportError> {
    let response: BlockResponse = serde_json::from_slice(raw)
        .map_err(|err| TransportError::malformed(err.to_string()))?;
    let message = response
        .data
        .and_then(|data| data.message)
        .ok_or_else(|| TransportError::malformed("missing data.message"))?;
    let slot = slot_from_value(&message.slot)
        .ok_or_else(|| TransportError::malformed(format!("bad slot: {}", message.slot)))?;
    Ok(BlockRecord {
        slot,
        graffiti: message.body.graffiti,
    })
}

/// Beacon node REST client.
#[derive(Debug, Clone)]
pub struct BeaconClient {
    http: reqwest::Client,
    base_url: String,
}

impl BeaconClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn block_url(&self, id: BlockId) -> String {
        format!("{}/eth/v2/beacon/blocks/{id}", self.base_url)
    }

    fn events_url(&self) -> String {
        format!("{}/eth/v1/events?topics=block", self.base_url)
    }

    /// Follows the block event stream on a background task, reconnecting
    /// whenever it drops. The task ends once the receiver is dropped.
    pub fn subscribe(&self) -> mpsc::Receiver<Notification> {
        let (tx, rx) = mpsc::channel(NOTIFICATION_BUFFER);
        let client = self.clone();
        tokio::spawn(async move {
            loop {
                match client.stream_events(&tx).await {
                    Ok(()) => debug!("block event stream ended"),
                    Err(err) => warn!(error = %err, "block event stream failed"),
                }
                if tx.is_closed() {
                    break;
                }
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        });
        rx
    }

    async fn stream_events(&self, tx: &mpsc::Sender<Notification>) -> Result<(), TransportError> {
        let url = self.events_url();
        let response = self
            .http
            .get(&url)
            .header(ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|source| TransportError::Http {
                url: url.clone(),
                source,
            })?;
        if !response.status().is_success() {
            return Err(TransportError::Status {
                url,
                status: response.status(),
            });
        }

        info!(url = %url, "block event stream open");
        if tx.send(Notification::Opened).await.is_err() {
            return Ok(());
        }

        let mut events = response.bytes_stream().eventsource();
        while let Some(event) = events.next().await {
            let event = event.map_err(|err| match err {
                EventStreamError::Transport(source) => TransportError::Http {
                    url: url.clone(),
                    source,
                },
                other => TransportError::EventStream {
                    url: url.clone(),
                    message: other.to_string(),
                },
            })?;
            let Some(notification) = Notification::from_event(&event) else {
                continue;
            };
            if tx.send(notification).await.is_err() {
                return Ok(());
            }
        }
        Ok(())
    }
}

#[async_trait]
impl BlockSource for BeaconClient {
    async fn fetch_block(&self, id: BlockId) -> Result<BlockRecord, TransportError> {
        let url = self.block_url(id);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|source| TransportError::Http {
                url: url.clone(),
                source,
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status { url, status });
        }
        let body = response
            .bytes()
            .await
            .map_err(|source| TransportError::Http { url, source })?;
        parse_block_response(&body)
    }
}

impl Notification {
    fn from_event(event: &Event) -> Option<Self> {
        if event.event != "block" {
            return None;
        }
        let slot = serde_json::from_str::<Value>(&event.data)
            .ok()
            .and_then(|payload| payload.get("slot").and_then(slot_from_value));
        Some(Notification::Block { slot })
    }
}
