use anyhow::Context;
use hex::DisplayHex;
use log::{debug, warn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::timeout;

use crate::config::Config;
use crate::fees::FeeParameters;
use crate::state::{Channel, NodeInfo};

/// Trait abstracting the node API surface used by the fee engine.
///
/// This enables mock-based testing without a live node.
#[async_trait::async_trait]
pub trait NodeClient: Send + Sync {
    async fn get_node_info(&self) -> anyhow::Result<NodeInfo>;
    async fn list_channels(&self) -> anyhow::Result<Vec<Channel>>;
    /// Set our forwarding policy on one channel. Single attempt; callers own
    /// retries.
    async fn update_channel_policy(
        &self,
        channel: &Channel,
        fees: &FeeParameters,
    ) -> anyhow::Result<()>;
}

/// The node refused a request outright. Repeating it cannot succeed.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct Rejected(pub String);

/// Rate-limited client for LND's REST gateway.
#[derive(Clone)]
pub struct LndRestClient {
    http: reqwest::Client,
    base_url: String,
    macaroon_hex: String,
    /// Bounds the number of concurrent requests against the node
    rate_limiter: Arc<Semaphore>,
    /// Bound on one graph edge lookup
    edge_timeout: Duration,
}

impl LndRestClient {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let macaroon = std::fs::read(&config.server.macaroon_path).with_context(|| {
            format!(
                "Failed to read macaroon at {}",
                config.server.macaroon_path.display()
            )
        })?;

        let mut builder = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.server.request_timeout_secs));

        if let Some(cert_path) = &config.server.tls_cert_path {
            let cert_pem = std::fs::read(cert_path).with_context(|| {
                format!("Failed to read TLS cert at {}", cert_path.display())
            })?;
            let cert = reqwest::Certificate::from_pem(&cert_pem)
                .with_context(|| format!("Invalid TLS cert at {}", cert_path.display()))?;
            builder = builder.add_root_certificate(cert);
        }
        if config.server.accept_invalid_certs {
            warn!("TLS certificate verification is disabled for the LND connection");
            builder = builder.danger_accept_invalid_certs(true);
        }

        let http = builder.build().context("Failed to build HTTP client")?;

        Ok(Self {
            http,
            base_url: config.server.base_url.trim_end_matches('/').to_string(),
            macaroon_hex: macaroon.as_slice().to_lower_hex_string(),
            rate_limiter: Arc::new(Semaphore::new(config.server.max_in_flight.max(1))),
            edge_timeout: Duration::from_secs(config.server.edge_timeout_secs),
        })
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> anyhow::Result<T> {
        let _permit = self
            .rate_limiter
            .acquire()
            .await
            .map_err(|_| anyhow::anyhow!("Rate limiter semaphore closed"))?;

        let resp = self
            .http
            .get(format!("{}{}", self.base_url, path))
            .header("Grpc-Metadata-macaroon", &self.macaroon_hex)
            .send()
            .await
            .with_context(|| format!("GET {} failed", path))?;
        decode(path, resp).await
    }

    async fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> anyhow::Result<T> {
        let _permit = self
            .rate_limiter
            .acquire()
            .await
            .map_err(|_| anyhow::anyhow!("Rate limiter semaphore closed"))?;

        let resp = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .header("Grpc-Metadata-macaroon", &self.macaroon_hex)
            .json(body)
            .send()
            .await
            .with_context(|| format!("POST {} failed", path))?;
        decode(path, resp).await
    }
}

async fn decode<T: DeserializeOwned>(path: &str, resp: reqwest::Response) -> anyhow::Result<T> {
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(status_error(path, status, body.trim()));
    }
    let parsed = resp
        .json::<T>()
        .await
        .with_context(|| format!("{}: unexpected response body", path))?;
    debug!("{}: success", path);
    Ok(parsed)
}

/// Client errors are final, except timeouts and rate limiting.
fn status_error(path: &str, status: reqwest::StatusCode, body: &str) -> anyhow::Error {
    let message = format!("{}: HTTP {}: {}", path, status, body);
    let transient = status == reqwest::StatusCode::REQUEST_TIMEOUT
        || status == reqwest::StatusCode::TOO_MANY_REQUESTS;
    if status.is_client_error() && !transient {
        Rejected(message).into()
    } else {
        anyhow::anyhow!(message)
    }
}

/// Run one lookup per id concurrently, each bounded by `per_lookup`.
/// A lookup that fails or runs late yields `None` for its id only; results
/// keep the order of `ids`.
async fn lookup_concurrently<T, F, Fut>(
    ids: &[String],
    per_lookup: Duration,
    lookup: F,
) -> Vec<Option<T>>
where
    T: Send + 'static,
    F: Fn(String) -> Fut,
    Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
{
    let mut tasks = JoinSet::new();
    for (idx, id) in ids.iter().enumerate() {
        let fut = lookup(id.clone());
        tasks.spawn(async move { (idx, timeout(per_lookup, fut).await) });
    }

    let mut found: Vec<Option<T>> = ids.iter().map(|_| None).collect();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((idx, Ok(Ok(value)))) => found[idx] = Some(value),
            Ok((idx, Ok(Err(e)))) => warn!("LND: no policy for channel {}: {:#}", ids[idx], e),
            Ok((idx, Err(_))) => warn!(
                "LND: policy lookup for channel {} exceeded {}s",
                ids[idx],
                per_lookup.as_secs_f64()
            ),
            Err(e) => warn!("LND: policy lookup task failed: {}", e),
        }
    }
    found
}

#[async_trait::async_trait]
impl NodeClient for LndRestClient {
    async fn get_node_info(&self) -> anyhow::Result<NodeInfo> {
        let info: LndInfo = self.get("/v1/getinfo").await?;
        Ok(info.into())
    }

    async fn list_channels(&self) -> anyhow::Result<Vec<Channel>> {
        let info: LndInfo = self.get("/v1/getinfo").await?;
        let listed: LndChannels = self.get("/v1/channels").await?;

        // Both policies live on the graph edge, not the channel.
        let ids: Vec<String> = listed.channels.iter().map(|c| c.chan_id.clone()).collect();
        let edges = lookup_concurrently(&ids, self.edge_timeout, |id| {
            let client = self.clone();
            async move {
                client
                    .get::<LndChannelEdge>(&format!("/v1/graph/edge/{}", id))
                    .await
            }
        })
        .await;

        let channels = listed
            .channels
            .into_iter()
            .zip(edges)
            .map(|(raw, edge)| {
                let (fees, peer_fees) = edge
                    .map(|e| e.policies_for(&info.identity_pubkey))
                    .unwrap_or((None, None));
                raw.into_channel(fees, peer_fees)
            })
            .collect();
        Ok(channels)
    }

    async fn update_channel_policy(
        &self,
        channel: &Channel,
        fees: &FeeParameters,
    ) -> anyhow::Result<()> {
        let (txid, index) = parse_channel_point(&channel.channel_point)?;
        let request = LndPolicyUpdate {
            chan_point: LndChanPoint {
                funding_txid_str: txid.to_string(),
                output_index: index,
            },
            base_fee_msat: fees.base_fee_msat.to_string(),
            fee_rate_ppm: fees.fee_rate,
            time_lock_delta: fees.time_lock_delta,
        };

        let resp: LndPolicyUpdateResponse = self.post("/v1/chanpolicy", &request).await?;
        if let Some(failed) = resp.failed_updates.first() {
            return Err(Rejected(format!(
                "channel {}: {}",
                channel.channel_id,
                if failed.update_error.is_empty() {
                    "update rejected"
                } else {
                    failed.update_error.as_str()
                }
            ))
            .into());
        }
        Ok(())
    }
}

fn parse_channel_point(point: &str) -> anyhow::Result<(&str, u32)> {
    let (txid, index) = point
        .split_once(':')
        .ok_or_else(|| anyhow::anyhow!("malformed channel point '{}'", point))?;
    let index = index
        .parse::<u32>()
        .with_context(|| format!("malformed output index in channel point '{}'", point))?;
    Ok((txid, index))
}

// ---------------------------------------------------------------------------
// LND REST wire types. The gateway encodes 64-bit integers as strings.
// ---------------------------------------------------------------------------

fn de_u64<'de, D: Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Num(u64),
        Text(String),
    }
    match Raw::deserialize(d)? {
        Raw::Num(n) => Ok(n),
        Raw::Text(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

fn de_id<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Num(u64),
        Text(String),
    }
    Ok(match Raw::deserialize(d)? {
        Raw::Num(n) => n.to_string(),
        Raw::Text(s) => s,
    })
}

#[derive(Deserialize)]
struct LndInfo {
    #[serde(default)]
    alias: String,
    #[serde(default)]
    identity_pubkey: String,
    #[serde(default)]
    num_active_channels: u32,
    #[serde(default)]
    num_pending_channels: u32,
    #[serde(default)]
    block_height: u32,
}

impl From<LndInfo> for NodeInfo {
    fn from(info: LndInfo) -> Self {
        NodeInfo {
            alias: info.alias,
            pubkey: info.identity_pubkey,
            num_active_channels: info.num_active_channels,
            num_pending_channels: info.num_pending_channels,
            block_height: info.block_height,
        }
    }
}

#[derive(Deserialize)]
struct LndChannels {
    #[serde(default)]
    channels: Vec<LndChannel>,
}

#[derive(Deserialize)]
struct LndChannel {
    #[serde(default)]
    active: bool,
    #[serde(default)]
    remote_pubkey: String,
    #[serde(default)]
    channel_point: String,
    #[serde(deserialize_with = "de_id")]
    chan_id: String,
    #[serde(default, deserialize_with = "de_u64")]
    capacity: u64,
    #[serde(default, deserialize_with = "de_u64")]
    local_balance: u64,
    #[serde(default, deserialize_with = "de_u64")]
    remote_balance: u64,
    #[serde(default, deserialize_with = "de_u64")]
    total_satoshis_sent: u64,
    #[serde(default, deserialize_with = "de_u64")]
    total_satoshis_received: u64,
    /// Seconds the peer was online while we monitored the channel
    #[serde(default, deserialize_with = "de_u64")]
    uptime: u64,
    /// Seconds the channel has been monitored
    #[serde(default, deserialize_with = "de_u64")]
    lifetime: u64,
}

impl LndChannel {
    fn into_channel(
        self,
        fees: Option<FeeParameters>,
        peer_fees: Option<FeeParameters>,
    ) -> Channel {
        let flow_score = (self.capacity > 0).then(|| {
            let moved = self.total_satoshis_sent.saturating_add(self.total_satoshis_received);
            (moved as f64 / self.capacity as f64).min(1.0)
        });
        let peer_score =
            (self.lifetime > 0).then(|| (self.uptime as f64 / self.lifetime as f64).min(1.0));

        Channel {
            channel_id: self.chan_id,
            peer_pubkey: self.remote_pubkey,
            channel_point: self.channel_point,
            capacity_sat: self.capacity,
            local_balance_sat: self.local_balance,
            remote_balance_sat: self.remote_balance,
            active: self.active,
            fees,
            peer_fees,
            flow_score,
            peer_score,
        }
    }
}

#[derive(Deserialize)]
struct LndChannelEdge {
    #[serde(default)]
    node1_pub: String,
    #[serde(default)]
    node2_pub: String,
    #[serde(default)]
    node1_policy: Option<LndRoutingPolicy>,
    #[serde(default)]
    node2_policy: Option<LndRoutingPolicy>,
}

impl LndChannelEdge {
    /// Split the edge into our policy and the peer's.
    fn policies_for(self, our_pubkey: &str) -> (Option<FeeParameters>, Option<FeeParameters>) {
        let (ours, theirs) = if self.node1_pub == our_pubkey {
            (self.node1_policy, self.node2_policy)
        } else if self.node2_pub == our_pubkey {
            (self.node2_policy, self.node1_policy)
        } else {
            return (None, None);
        };
        (ours.map(FeeParameters::from), theirs.map(FeeParameters::from))
    }
}

impl From<LndRoutingPolicy> for FeeParameters {
    fn from(policy: LndRoutingPolicy) -> Self {
        FeeParameters {
            base_fee_msat: policy.fee_base_msat,
            fee_rate: u32::try_from(policy.fee_rate_milli_msat).unwrap_or(u32::MAX),
            time_lock_delta: policy.time_lock_delta,
        }
    }
}

#[derive(Deserialize)]
struct LndRoutingPolicy {
    #[serde(default)]
    time_lock_delta: u32,
    #[serde(default, deserialize_with = "de_u64")]
    fee_base_msat: u64,
    /// Proportional fee in millionths, despite the name
    #[serde(default, deserialize_with = "de_u64")]
    fee_rate_milli_msat: u64,
}

#[derive(Serialize)]
struct LndChanPoint {
    funding_txid_str: String,
    output_index: u32,
}

#[derive(Serialize)]
struct LndPolicyUpdate {
    chan_point: LndChanPoint,
    base_fee_msat: String,
    fee_rate_ppm: u32,
    time_lock_delta: u32,
}

#[derive(Deserialize)]
struct LndPolicyUpdateResponse {
    #[serde(default)]
    failed_updates: Vec<LndFailedUpdate>,
}

#[derive(Deserialize)]
struct LndFailedUpdate {
    #[serde(default)]
    update_error: String,
}

// ---------------------------------------------------------------------------
// Mock client for integration testing
// ---------------------------------------------------------------------------
