use crate::automation::config::AutomationConfig;
use crate::automation::history::{FeeUpdateRecord, HistoryLog};
use crate::client::{NodeClient, Rejected};
use crate::config::Config;
use crate::error::FailureReason;
use crate::fees::FeeParameters;
use crate::state::Channel;
use log::{debug, error, info, warn};
use rand::Rng;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum ApplyOutcome {
    Applied,
    Skipped(SkipReason),
    Failed(FailureReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Listed in `excluded_channels`
    Excluded,
    /// Selective mode and not listed in `enabled_channels`
    NotEnabled,
    /// Proposal equals the current policy
    Unchanged,
    DryRun,
}

/// Retry and timeout policy for fee updates.
#[derive(Debug, Clone)]
pub struct ApplySettings {
    pub dry_run: bool,
    pub max_attempts: u32,
    pub retry_base: Duration,
    /// Bound on a single node call
    pub call_timeout: Duration,
    /// Bound on all attempts for one channel, backoff included
    pub channel_timeout: Duration,
}

impl ApplySettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            dry_run: config.general.dry_run,
            max_attempts: config.engine.max_attempts,
            retry_base: Duration::from_millis(config.engine.retry_base_ms),
            call_timeout: Duration::from_secs(config.engine.update_timeout_secs),
            channel_timeout: Duration::from_secs(config.engine.channel_timeout_secs),
        }
    }
}

/// Pushes fee parameters to the node, once per real change.
#[derive(Clone)]
pub struct Applier {
    client: Arc<dyn NodeClient>,
    history: HistoryLog,
    settings: ApplySettings,
}

/// Whether the channel is managed at all under `config`.
pub fn check_selection(config: &AutomationConfig, channel_id: &str) -> Option<SkipReason> {
    if config.is_excluded(channel_id) {
        Some(SkipReason::Excluded)
    } else if !config.is_enabled(channel_id) {
        Some(SkipReason::NotEnabled)
    } else {
        None
    }
}

impl Applier {
    pub fn new(client: Arc<dyn NodeClient>, history: HistoryLog, settings: ApplySettings) -> Self {
        Self {
            client,
            history,
            settings,
        }
    }

    /// Apply `proposed` to `channel` unless it is excluded or already set.
    pub async fn apply(
        &self,
        channel: &Channel,
        proposed: FeeParameters,
        config: &AutomationConfig,
    ) -> ApplyOutcome {
        if let Some(reason) = check_selection(config, &channel.channel_id) {
            debug!(
                "Fee setter: channel {} not managed ({:?})",
                channel.channel_id, reason
            );
            return ApplyOutcome::Skipped(reason);
        }

        if channel.fees == Some(proposed) {
            debug!(
                "Fee setter: channel {} unchanged (base={}msat, ppm={}, delta={})",
                channel.channel_id, proposed.base_fee_msat, proposed.fee_rate, proposed.time_lock_delta
            );
            return ApplyOutcome::Skipped(SkipReason::Unchanged);
        }

        let current_base = channel.fees.map(|f| f.base_fee_msat).unwrap_or(0);
        let current_ppm = channel.fees.map(|f| f.fee_rate).unwrap_or(0);

        info!(
            "Fee setter: channel {} with {} -- base: {}->{}msat, ppm: {}->{}",
            channel.channel_id,
            channel.peer_pubkey,
            current_base,
            proposed.base_fee_msat,
            current_ppm,
            proposed.fee_rate,
        );

        if self.settings.dry_run {
            info!("  (dry-run: not applying)");
            return ApplyOutcome::Skipped(SkipReason::DryRun);
        }

        let pushed = match timeout(self.settings.channel_timeout, self.push(channel, &proposed)).await {
            Ok(result) => result,
            Err(_) => Err(FailureReason::Timeout),
        };

        match pushed {
            Ok(()) => {
                let record = FeeUpdateRecord {
                    timestamp: chrono::Utc::now().timestamp(),
                    channel_id: channel.channel_id.clone(),
                    old_base_fee_msat: current_base,
                    new_base_fee_msat: proposed.base_fee_msat,
                    old_fee_rate: current_ppm,
                    new_fee_rate: proposed.fee_rate,
                };
                // The node already has the new policy; a lost record is not a failed update.
                if let Err(e) = self.history.append(&record) {
                    error!(
                        "Fee setter: failed to record update for channel {}: {:#}",
                        channel.channel_id, e
                    );
                }
                ApplyOutcome::Applied
            }
            Err(reason) => {
                error!(
                    "Fee setter: giving up on channel {}: {}",
                    channel.channel_id, reason
                );
                ApplyOutcome::Failed(reason)
            }
        }
    }

    /// Send the update, retrying transient failures with exponential backoff.
    /// A rejection by the node ends the attempts at once.
    async fn push(&self, channel: &Channel, proposed: &FeeParameters) -> Result<(), FailureReason> {
        let attempts = self.settings.max_attempts.max(1);
        let mut last = FailureReason::Timeout;

        for attempt in 0..attempts {
            last = match timeout(
                self.settings.call_timeout,
                self.client.update_channel_policy(channel, proposed),
            )
            .await
            {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(e)) if e.downcast_ref::<Rejected>().is_some() => {
                    warn!(
                        "Fee setter: channel {} update rejected, not retrying: {:#}",
                        channel.channel_id, e
                    );
                    return Err(FailureReason::Node(format!("{:#}", e)));
                }
                Ok(Err(e)) => FailureReason::Node(format!("{:#}", e)),
                Err(_) => FailureReason::Timeout,
            };

            if attempt + 1 < attempts {
                let delay = self.backoff(attempt);
                warn!(
                    "Fee setter: channel {} attempt {} failed ({}), retrying in {}ms",
                    channel.channel_id,
                    attempt + 1,
                    last,
                    delay.as_millis()
                );
                sleep(delay).await;
            }
        }

        Err(last)
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let base = self.settings.retry_base * 2u32.saturating_pow(attempt);
        let jitter_ms = (base.as_millis() as u64) / 4;
        if jitter_ms == 0 {
            return base;
        }
        base + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }
}
