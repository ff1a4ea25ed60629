//! Fee policy engine.
//!
//! Maps a channel's metrics and the active strategy to a target fee set:
//!
//! 1. `composite = flow_score * flow_weight + peer_score * peer_weight`
//! 2. The balance ratio places the channel in a liquidity band:
//!    local-heavy above `high_flow_threshold`, remote-heavy below
//!    `low_flow_threshold`, balanced otherwise.
//! 3. The strategy turns band and composite into a bias fraction `f`:
//!    - balanced:    `0.5 ± 0.25 (band) + (composite - 0.5) * 0.2`
//!    - competitive: `0.5 * composite`        (lower half of the range)
//!    - profitable:  `0.5 + 0.5 * composite`  (upper half of the range)
//! 4. Base fee and rate are `min + f * (max - min)`, rounded, then clamped
//!    to `[min, max]`.
//!
//! For any channel, profitable never proposes less than competitive, and
//! under the balanced strategy a local-heavy channel never gets a lower rate
//! than a remote-heavy one.

use crate::automation::config::{AutomationConfig, MIN_TIME_LOCK_DELTA};
use crate::fees::metrics::ChannelMetrics;
use crate::fees::{FeeParameters, Strategy};
use crate::state::Channel;
use log::debug;
use serde::Serialize;

/// How far the balanced strategy moves away from the midpoint per band.
const BAND_NUDGE: f64 = 0.25;
/// How much the composite score moves the balanced strategy.
const BALANCED_COMPOSITE_SPAN: f64 = 0.2;
/// Width of the half-range used by competitive and profitable.
const HALF_RANGE: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LiquidityBand {
    LocalHeavy,
    Balanced,
    RemoteHeavy,
}

impl LiquidityBand {
    fn nudge(self) -> f64 {
        match self {
            LiquidityBand::LocalHeavy => BAND_NUDGE,
            LiquidityBand::Balanced => 0.0,
            LiquidityBand::RemoteHeavy => -BAND_NUDGE,
        }
    }
}

pub fn classify(balance_ratio: f64, config: &AutomationConfig) -> LiquidityBand {
    if balance_ratio > config.high_flow_threshold {
        LiquidityBand::LocalHeavy
    } else if balance_ratio < config.low_flow_threshold {
        LiquidityBand::RemoteHeavy
    } else {
        LiquidityBand::Balanced
    }
}

pub fn composite(metrics: &ChannelMetrics, config: &AutomationConfig) -> f64 {
    (metrics.flow_score * config.flow_weight + metrics.peer_score * config.peer_weight)
        .clamp(0.0, 1.0)
}

/// Position inside the configured `[min, max]` ranges, 0.0 to 1.0.
pub fn bias(strategy: Strategy, band: LiquidityBand, composite: f64) -> f64 {
    let fraction = match strategy {
        Strategy::Balanced => {
            0.5 + band.nudge() + (composite - 0.5) * BALANCED_COMPOSITE_SPAN
        }
        Strategy::Competitive => HALF_RANGE * composite,
        Strategy::Profitable => HALF_RANGE + HALF_RANGE * composite,
    };
    fraction.clamp(0.0, 1.0)
}

/// Compute the target fee parameters for one channel.
pub fn propose(
    channel: &Channel,
    metrics: &ChannelMetrics,
    config: &AutomationConfig,
) -> FeeParameters {
    let band = classify(metrics.balance_ratio, config);
    let score = composite(metrics, config);
    let fraction = bias(config.strategy, band, score);

    let proposed = clamp_to_bounds(
        FeeParameters {
            base_fee_msat: interpolate(config.min_base_fee_msat, config.max_base_fee_msat, fraction),
            fee_rate: interpolate(
                u64::from(config.min_fee_rate),
                u64::from(config.max_fee_rate),
                fraction,
            )
            .min(u64::from(u32::MAX)) as u32,
            time_lock_delta: config.time_lock_delta,
        },
        config,
    );

    debug!(
        "Fee policy: channel {} ratio={:.3} band={:?} composite={:.3} {} -> f={:.3} base={}msat ppm={}",
        channel.channel_id,
        metrics.balance_ratio,
        band,
        score,
        config.strategy,
        fraction,
        proposed.base_fee_msat,
        proposed.fee_rate,
    );

    proposed
}

/// Force base fee and rate into the configured bounds and raise the
/// time-lock delta to the protocol floor. A larger delta is left as given.
pub fn clamp_to_bounds(params: FeeParameters, config: &AutomationConfig) -> FeeParameters {
    FeeParameters {
        base_fee_msat: params
            .base_fee_msat
            .max(config.min_base_fee_msat)
            .min(config.max_base_fee_msat),
        fee_rate: params
            .fee_rate
            .max(config.min_fee_rate)
            .min(config.max_fee_rate),
        time_lock_delta: params.time_lock_delta.max(MIN_TIME_LOCK_DELTA),
    }
}

fn interpolate(min: u64, max: u64, fraction: f64) -> u64 {
    if max <= min {
        return min;
    }
    let span = (max - min) as f64;
    min + (fraction.clamp(0.0, 1.0) * span).round() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fees::metrics;
    use crate::state::test_channel;

    fn config_with(strategy: Strategy) -> AutomationConfig {
        AutomationConfig {
            strategy,
            ..AutomationConfig::default()
        }
    }

    fn propose_for(ch: &Channel, config: &AutomationConfig) -> FeeParameters {
        propose(ch, &metrics::compute(ch), config)
    }

    #[test]
    fn test_classify_bands() {
        let config = AutomationConfig::default(); // 0.2 / 0.8
        assert_eq!(classify(0.9, &config), LiquidityBand::LocalHeavy);
        assert_eq!(classify(0.1, &config), LiquidityBand::RemoteHeavy);
        assert_eq!(classify(0.5, &config), LiquidityBand::Balanced);
        // Thresholds themselves are balanced
        assert_eq!(classify(0.8, &config), LiquidityBand::Balanced);
        assert_eq!(classify(0.2, &config), LiquidityBand::Balanced);
    }

    #[test]
    fn test_always_within_bounds() {
        let mut config = AutomationConfig::default();
        config.min_base_fee_msat = 200;
        config.max_base_fee_msat = 900;
        config.min_fee_rate = 10;
        config.max_fee_rate = 20;

        let scores = [None, Some(0.0), Some(0.3), Some(1.0), Some(7.0)];
        for strategy in Strategy::ALL {
            config.strategy = strategy;
            for local in [0, 100_000, 500_000, 900_000, 1_000_000] {
                for flow in scores {
                    for peer in scores {
                        let mut ch = test_channel("c", 1_000_000, local);
                        ch.flow_score = flow;
                        ch.peer_score = peer;
                        let p = propose_for(&ch, &config);
                        assert!(
                            (200..=900).contains(&p.base_fee_msat),
                            "{:?} base {} out of bounds",
                            strategy,
                            p.base_fee_msat
                        );
                        assert!(
                            (10..=20).contains(&p.fee_rate),
                            "{:?} rate {} out of bounds",
                            strategy,
                            p.fee_rate
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn test_degenerate_range_pins_to_bound() {
        let mut config = AutomationConfig::default();
        config.min_fee_rate = 300;
        config.max_fee_rate = 300;
        config.min_base_fee_msat = 0;
        config.max_base_fee_msat = 0;
        let ch = test_channel("c", 1_000_000, 950_000);
        for strategy in Strategy::ALL {
            config.strategy = strategy;
            let p = propose_for(&ch, &config);
            assert_eq!(p.fee_rate, 300);
            assert_eq!(p.base_fee_msat, 0);
        }
    }

    #[test]
    fn test_local_heavy_profitable_closer_to_max_than_competitive() {
        let ch = test_channel("c", 1_000_000, 900_000);
        let config = config_with(Strategy::Profitable);
        assert_eq!(
            classify(metrics::compute(&ch).balance_ratio, &config),
            LiquidityBand::LocalHeavy
        );

        let profitable = propose_for(&ch, &config);
        let competitive = propose_for(&ch, &config_with(Strategy::Competitive));

        let max = config.max_fee_rate;
        assert!(
            max - profitable.fee_rate < max - competitive.fee_rate,
            "profitable {} should be closer to {} than competitive {}",
            profitable.fee_rate,
            max,
            competitive.fee_rate
        );
    }

    #[test]
    fn test_balanced_nudges_by_band() {
        let config = config_with(Strategy::Balanced);
        let local_heavy = propose_for(&test_channel("a", 1_000_000, 950_000), &config);
        let balanced = propose_for(&test_channel("b", 1_000_000, 500_000), &config);
        let remote_heavy = propose_for(&test_channel("c", 1_000_000, 50_000), &config);

        assert!(local_heavy.fee_rate > balanced.fee_rate);
        assert!(balanced.fee_rate > remote_heavy.fee_rate);
        assert!(local_heavy.base_fee_msat > balanced.base_fee_msat);
        assert!(balanced.base_fee_msat > remote_heavy.base_fee_msat);
    }

    #[test]
    fn test_balanced_neutral_channel_sits_at_midpoint() {
        let config = config_with(Strategy::Balanced);
        let p = propose_for(&test_channel("b", 1_000_000, 500_000), &config);
        // Neutral scores: composite 0.5, no band nudge -> the middle
        assert_eq!(p.base_fee_msat, 3000);
        assert!((500..=501).contains(&p.fee_rate), "got {}", p.fee_rate);
    }

    #[test]
    fn test_composite_moves_competitive_and_profitable() {
        let mut busy = test_channel("busy", 1_000_000, 500_000);
        busy.flow_score = Some(1.0);
        busy.peer_score = Some(1.0);
        let mut idle = test_channel("idle", 1_000_000, 500_000);
        idle.flow_score = Some(0.0);
        idle.peer_score = Some(0.0);

        for strategy in [Strategy::Competitive, Strategy::Profitable] {
            let config = config_with(strategy);
            let hi = propose_for(&busy, &config);
            let lo = propose_for(&idle, &config);
            assert!(hi.fee_rate > lo.fee_rate, "{:?}", strategy);
        }

        // Idle under competitive hits the floor, busy under profitable the ceiling
        let c = propose_for(&idle, &config_with(Strategy::Competitive));
        assert_eq!(c.fee_rate, 1);
        let p = propose_for(&busy, &config_with(Strategy::Profitable));
        assert_eq!(p.fee_rate, 1000);
    }

    #[test]
    fn test_time_lock_delta_from_config() {
        let mut config = config_with(Strategy::Competitive);
        config.time_lock_delta = 144;
        let p = propose_for(&test_channel("c", 1_000_000, 10_000), &config);
        assert_eq!(p.time_lock_delta, 144);
    }

    #[test]
    fn test_clamp_to_bounds_keeps_time_lock() {
        let config = AutomationConfig::default();
        let clamped = clamp_to_bounds(
            FeeParameters {
                base_fee_msat: 10,
                fee_rate: 90_000,
                time_lock_delta: 80,
            },
            &config,
        );
        assert_eq!(clamped.base_fee_msat, config.min_base_fee_msat);
        assert_eq!(clamped.fee_rate, config.max_fee_rate);
        assert_eq!(clamped.time_lock_delta, 80);
    }

    #[test]
    fn test_clamp_to_bounds_raises_time_lock_to_floor() {
        let clamped = clamp_to_bounds(
            FeeParameters {
                base_fee_msat: 1000,
                fee_rate: 100,
                time_lock_delta: 5,
            },
            &AutomationConfig::default(),
        );
        assert_eq!(clamped.time_lock_delta, MIN_TIME_LOCK_DELTA);
    }
}
