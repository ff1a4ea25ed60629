pub mod metrics;
pub mod policy;
pub mod setter;

use crate::automation::config::AutomationConfig;
use crate::state::Channel;
use metrics::ChannelMetrics;
use serde::{Deserialize, Serialize};
use setter::{ApplyOutcome, Applier};
use std::fmt;
use std::str::FromStr;

/// Hard upper limit on the proportional fee rate (ppm) any config may allow.
pub const ABS_MAX_FEE_RATE: u32 = 50_000;

/// Routing fee parameters of one channel direction.
///
/// `fee_rate` is in parts-per-million, the unit the node stores, so two
/// parameter sets compare exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FeeParameters {
    pub base_fee_msat: u64,
    pub fee_rate: u32,
    pub time_lock_delta: u32,
}

/// Named fee policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// Keep rates near the middle of the range, steered by liquidity.
    #[default]
    Balanced,
    /// Lower half of the range: attract flow.
    Competitive,
    /// Upper half of the range: earn per forward.
    Profitable,
}

impl Strategy {
    pub const ALL: [Strategy; 3] = [
        Strategy::Balanced,
        Strategy::Competitive,
        Strategy::Profitable,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Balanced => "balanced",
            Strategy::Competitive => "competitive",
            Strategy::Profitable => "profitable",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Strategy::ALL
            .into_iter()
            .find(|strategy| strategy.as_str() == s)
            .ok_or_else(|| {
                format!(
                    "unknown strategy '{}' (expected balanced, competitive or profitable)",
                    s
                )
            })
    }
}

/// What happened to one channel during a pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelOutcome {
    pub channel_id: String,
    pub metrics: ChannelMetrics,
    pub proposed: FeeParameters,
    pub outcome: ApplyOutcome,
}

/// Score, propose and apply fees for a single channel.
pub async fn process_channel(
    applier: &Applier,
    channel: &Channel,
    config: &AutomationConfig,
) -> ChannelOutcome {
    let metrics = metrics::compute(channel);
    let proposed = policy::propose(channel, &metrics, config);
    let outcome = applier.apply(channel, proposed, config).await;

    ChannelOutcome {
        channel_id: channel.channel_id.clone(),
        metrics,
        proposed,
        outcome,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_parse() {
        assert_eq!("balanced".parse::<Strategy>().unwrap(), Strategy::Balanced);
        assert_eq!(
            "competitive".parse::<Strategy>().unwrap(),
            Strategy::Competitive
        );
        assert_eq!(
            "profitable".parse::<Strategy>().unwrap(),
            Strategy::Profitable
        );
        assert!("Balanced".parse::<Strategy>().is_err());
        assert!("greedy".parse::<Strategy>().is_err());
    }

    #[test]
    fn test_fee_parameters_json_shape() {
        let params: FeeParameters = serde_json::from_str(
            r#"{"base_fee_msat": 1500, "fee_rate": 250, "time_lock_delta": 40}"#,
        )
        .unwrap();
        assert_eq!(
            params,
            FeeParameters {
                base_fee_msat: 1500,
                fee_rate: 250,
                time_lock_delta: 40
            }
        );

        let missing = serde_json::from_str::<FeeParameters>(r#"{"base_fee_msat": 1500}"#);
        assert!(missing.is_err());
    }
}
