//! Per-channel flow signals.
//!
//! Everything here is derived from the snapshot alone: the same channel
//! always yields the same metrics.

use crate::state::Channel;
use serde::Serialize;

/// Value used whenever a signal is missing or meaningless.
pub const NEUTRAL: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ChannelMetrics {
    /// Share of capacity on our side (0.0 = all remote, 1.0 = all local).
    pub balance_ratio: f64,
    /// Normalized forwarding activity.
    pub flow_score: f64,
    /// Normalized counterparty desirability.
    pub peer_score: f64,
}

pub fn compute(channel: &Channel) -> ChannelMetrics {
    let balance_ratio = if channel.capacity_sat > 0 {
        (channel.local_balance_sat as f64 / channel.capacity_sat as f64).clamp(0.0, 1.0)
    } else {
        NEUTRAL
    };

    ChannelMetrics {
        balance_ratio,
        flow_score: normalized(channel.flow_score),
        peer_score: normalized(channel.peer_score),
    }
}

fn normalized(signal: Option<f64>) -> f64 {
    match signal {
        Some(v) if v.is_finite() => v.clamp(0.0, 1.0),
        _ => NEUTRAL,
    }
}
