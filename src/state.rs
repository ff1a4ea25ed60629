use crate::client::NodeClient;
use crate::error::ControlError;
use crate::fees::FeeParameters;
use log::debug;
use serde::Serialize;
use std::time::Duration;

/// One payment channel as reported by the node.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Channel {
    pub channel_id: String,
    pub peer_pubkey: String,
    /// Funding outpoint, `txid:index`.
    pub channel_point: String,
    pub capacity_sat: u64,
    pub local_balance_sat: u64,
    pub remote_balance_sat: u64,
    pub active: bool,
    /// Our current policy; `None` when the node could not report it.
    pub fees: Option<FeeParameters>,
    /// The counterparty's policy toward us, when announced.
    pub peer_fees: Option<FeeParameters>,
    /// Forwarding activity, normalized by the provider.
    pub flow_score: Option<f64>,
    /// Counterparty reliability, normalized by the provider.
    pub peer_score: Option<f64>,
}

/// Node identity summary.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NodeInfo {
    pub alias: String,
    pub pubkey: String,
    pub num_active_channels: u32,
    pub num_pending_channels: u32,
    pub block_height: u32,
}

/// Channel snapshot taken at the start of a pass.
pub struct NodeState {
    pub channels: Vec<Channel>,
    pub collected_at: i64,
}

impl NodeState {
    /// Fetch a fresh channel list, bounded by `timeout`.
    pub async fn collect(client: &dyn NodeClient, timeout: Duration) -> Result<Self, ControlError> {
        let channels = match tokio::time::timeout(timeout, client.list_channels()).await {
            Ok(Ok(channels)) => channels,
            Ok(Err(e)) => return Err(ControlError::ProviderUnavailable(format!("{:#}", e))),
            Err(_) => {
                return Err(ControlError::ProviderUnavailable(format!(
                    "no channel list within {}s",
                    timeout.as_secs_f64()
                )))
            }
        };

        debug!(
            "Collected state: {} channels ({} active), {} sat total capacity",
            channels.len(),
            channels.iter().filter(|c| c.active).count(),
            channels.iter().map(|c| c.capacity_sat).sum::<u64>(),
        );

        Ok(Self {
            channels,
            collected_at: chrono::Utc::now().timestamp(),
        })
    }

    pub fn find(&self, channel_id: &str) -> Option<&Channel> {
        self.channels.iter().find(|c| c.channel_id == channel_id)
    }
}

#[cfg(test)]
pub fn test_channel(id: &str, capacity_sat: u64, local_balance_sat: u64) -> Channel {
    Channel {
        channel_id: id.to_string(),
        peer_pubkey: format!("peer_{}", id),
        channel_point: format!("{:0>64}:0", id),
        capacity_sat,
        local_balance_sat,
        remote_balance_sat: capacity_sat.saturating_sub(local_balance_sat),
        active: true,
        fees: Some(FeeParameters {
            base_fee_msat: 1000,
            fee_rate: 1,
            time_lock_delta: 40,
        }),
        peer_fees: None,
        flow_score: None,
        peer_score: None,
    }
}
