use crate::db::Database;
use crate::error::{ControlError, FieldError, ValidationErrors};
use crate::fees::{Strategy, ABS_MAX_FEE_RATE};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::{Arc, RwLock};

/// Shortest allowed automation interval.
pub const MIN_INTERVAL_SECS: u64 = 60;
/// LND refuses CLTV deltas below this.
pub const MIN_TIME_LOCK_DELTA: u32 = 18;

const STATE_KEY: &str = "automation_config";

/// Validated automation settings. Outside of `Default`, only
/// [`ConfigDraft::validate`] produces one.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AutomationConfig {
    pub update_interval_secs: u64,
    pub strategy: Strategy,
    pub min_base_fee_msat: u64,
    pub max_base_fee_msat: u64,
    /// Proportional rate bounds, ppm
    pub min_fee_rate: u32,
    pub max_fee_rate: u32,
    pub time_lock_delta: u32,
    pub flow_weight: f64,
    pub peer_weight: f64,
    pub low_flow_threshold: f64,
    pub high_flow_threshold: f64,
    /// Empty means every channel is managed
    pub enabled_channels: BTreeSet<String>,
    /// Always wins over `enabled_channels`
    pub excluded_channels: BTreeSet<String>,
}

impl Default for AutomationConfig {
    fn default() -> Self {
        Self {
            update_interval_secs: 3600,
            strategy: Strategy::Balanced,
            min_base_fee_msat: 1000,
            max_base_fee_msat: 5000,
            min_fee_rate: 1,
            max_fee_rate: 1000,
            time_lock_delta: 40,
            flow_weight: 0.7,
            peer_weight: 0.3,
            low_flow_threshold: 0.2,
            high_flow_threshold: 0.8,
            enabled_channels: BTreeSet::new(),
            excluded_channels: BTreeSet::new(),
        }
    }
}

impl AutomationConfig {
    /// Selective mode: only `enabled_channels` are managed.
    pub fn is_selective(&self) -> bool {
        !self.enabled_channels.is_empty()
    }

    pub fn is_excluded(&self, channel_id: &str) -> bool {
        self.excluded_channels.contains(channel_id)
    }

    pub fn is_enabled(&self, channel_id: &str) -> bool {
        !self.is_selective() || self.enabled_channels.contains(channel_id)
    }
}

/// Unvalidated candidate config, as received from the API or the config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigDraft {
    pub update_interval_secs: u64,
    pub strategy: String,
    pub min_base_fee_msat: u64,
    pub max_base_fee_msat: u64,
    pub min_fee_rate: u32,
    pub max_fee_rate: u32,
    pub time_lock_delta: u32,
    pub flow_weight: f64,
    pub peer_weight: f64,
    pub low_flow_threshold: f64,
    pub high_flow_threshold: f64,
    pub enabled_channels: BTreeSet<String>,
    pub excluded_channels: BTreeSet<String>,
}

impl Default for ConfigDraft {
    fn default() -> Self {
        ConfigDraft::from(&AutomationConfig::default())
    }
}

impl From<&AutomationConfig> for ConfigDraft {
    fn from(config: &AutomationConfig) -> Self {
        Self {
            update_interval_secs: config.update_interval_secs,
            strategy: config.strategy.to_string(),
            min_base_fee_msat: config.min_base_fee_msat,
            max_base_fee_msat: config.max_base_fee_msat,
            min_fee_rate: config.min_fee_rate,
            max_fee_rate: config.max_fee_rate,
            time_lock_delta: config.time_lock_delta,
            flow_weight: config.flow_weight,
            peer_weight: config.peer_weight,
            low_flow_threshold: config.low_flow_threshold,
            high_flow_threshold: config.high_flow_threshold,
            enabled_channels: config.enabled_channels.clone(),
            excluded_channels: config.excluded_channels.clone(),
        }
    }
}

impl ConfigDraft {
    /// Check every rule and report all violations at once.
    pub fn validate(self) -> Result<AutomationConfig, ValidationErrors> {
        let mut errors = Vec::new();

        if self.update_interval_secs < MIN_INTERVAL_SECS {
            errors.push(FieldError::new(
                "update_interval_secs",
                format!(
                    "must be at least {} seconds (got {})",
                    MIN_INTERVAL_SECS, self.update_interval_secs
                ),
            ));
        }

        let strategy = match self.strategy.parse::<Strategy>() {
            Ok(strategy) => Some(strategy),
            Err(msg) => {
                errors.push(FieldError::new("strategy", msg));
                None
            }
        };

        if self.min_base_fee_msat > self.max_base_fee_msat {
            errors.push(FieldError::new(
                "min_base_fee_msat",
                format!(
                    "min_base_fee_msat ({}) > max_base_fee_msat ({})",
                    self.min_base_fee_msat, self.max_base_fee_msat
                ),
            ));
        }
        if self.min_fee_rate > self.max_fee_rate {
            errors.push(FieldError::new(
                "min_fee_rate",
                format!(
                    "min_fee_rate ({}) > max_fee_rate ({})",
                    self.min_fee_rate, self.max_fee_rate
                ),
            ));
        }
        if self.max_fee_rate > ABS_MAX_FEE_RATE {
            errors.push(FieldError::new(
                "max_fee_rate",
                format!(
                    "max_fee_rate ({}) above absolute maximum ({})",
                    self.max_fee_rate, ABS_MAX_FEE_RATE
                ),
            ));
        }

        if self.time_lock_delta < MIN_TIME_LOCK_DELTA {
            errors.push(FieldError::new(
                "time_lock_delta",
                format!(
                    "must be at least {} (got {})",
                    MIN_TIME_LOCK_DELTA, self.time_lock_delta
                ),
            ));
        }

        for (field, weight) in [("flow_weight", self.flow_weight), ("peer_weight", self.peer_weight)] {
            if !(0.0..=1.0).contains(&weight) {
                errors.push(FieldError::new(
                    field,
                    format!("must be between 0.0 and 1.0 (got {})", weight),
                ));
            }
        }
        // No tolerance here.
        if self.flow_weight + self.peer_weight != 1.0 {
            errors.push(FieldError::new(
                "flow_weight",
                format!(
                    "flow_weight + peer_weight must equal 1.0 (got {})",
                    self.flow_weight + self.peer_weight
                ),
            ));
        }

        for (field, threshold) in [
            ("low_flow_threshold", self.low_flow_threshold),
            ("high_flow_threshold", self.high_flow_threshold),
        ] {
            if !(0.0..=1.0).contains(&threshold) {
                errors.push(FieldError::new(
                    field,
                    format!("must be between 0.0 and 1.0 (got {})", threshold),
                ));
            }
        }
        if !(self.low_flow_threshold < self.high_flow_threshold) {
            errors.push(FieldError::new(
                "low_flow_threshold",
                format!(
                    "low_flow_threshold ({}) must be below high_flow_threshold ({})",
                    self.low_flow_threshold, self.high_flow_threshold
                ),
            ));
        }

        match strategy {
            Some(strategy) if errors.is_empty() => Ok(AutomationConfig {
                update_interval_secs: self.update_interval_secs,
                strategy,
                min_base_fee_msat: self.min_base_fee_msat,
                max_base_fee_msat: self.max_base_fee_msat,
                min_fee_rate: self.min_fee_rate,
                max_fee_rate: self.max_fee_rate,
                time_lock_delta: self.time_lock_delta,
                flow_weight: self.flow_weight,
                peer_weight: self.peer_weight,
                low_flow_threshold: self.low_flow_threshold,
                high_flow_threshold: self.high_flow_threshold,
                enabled_channels: self.enabled_channels,
                excluded_channels: self.excluded_channels,
            }),
            _ => Err(ValidationErrors(errors)),
        }
    }
}

/// Holder of the active automation config.
///
/// Readers get an `Arc` snapshot; `set` swaps the whole value under the
/// write lock, so nobody ever sees a mix of old and new fields.
pub struct ConfigStore {
    current: RwLock<Arc<AutomationConfig>>,
    db: Option<Arc<Database>>,
}

impl ConfigStore {
    pub fn new(initial: AutomationConfig) -> Self {
        Self {
            current: RwLock::new(Arc::new(initial)),
            db: None,
        }
    }

    /// Store backed by the database. A previously persisted config wins over
    /// `fallback` as long as it still validates.
    pub fn persistent(db: Arc<Database>, fallback: AutomationConfig) -> Self {
        let initial = match load_persisted(&db) {
            Ok(Some(config)) => {
                info!("Config store: restored persisted automation config");
                config
            }
            Ok(None) => fallback,
            Err(e) => {
                warn!(
                    "Config store: ignoring persisted config ({:#}), using file defaults",
                    e
                );
                fallback
            }
        };
        Self {
            db: Some(db),
            ..Self::new(initial)
        }
    }

    pub fn get(&self) -> Arc<AutomationConfig> {
        let guard = self.current.read().unwrap_or_else(|p| p.into_inner());
        Arc::clone(&guard)
    }

    /// Validate `draft`, persist it, and make it the active config. A config
    /// that cannot be persisted is not activated either.
    pub fn set(&self, draft: ConfigDraft) -> Result<Arc<AutomationConfig>, ControlError> {
        let config = Arc::new(draft.validate()?);

        let mut guard = self.current.write().unwrap_or_else(|p| p.into_inner());
        if let Some(db) = &self.db {
            if let Err(e) = persist(db, &config) {
                error!("Config store: failed to persist automation config: {:#}", e);
                return Err(e.into());
            }
        }
        *guard = Arc::clone(&config);
        drop(guard);

        info!(
            "Config store: accepted new config (strategy={}, interval={}s)",
            config.strategy, config.update_interval_secs
        );
        Ok(config)
    }
}

fn load_persisted(db: &Database) -> anyhow::Result<Option<AutomationConfig>> {
    let Some(raw) = db.get_state(STATE_KEY)? else {
        return Ok(None);
    };
    let draft: ConfigDraft = serde_json::from_str(&raw)?;
    Ok(Some(draft.validate()?))
}

fn persist(db: &Database, config: &AutomationConfig) -> anyhow::Result<()> {
    let raw = serde_json::to_string(&ConfigDraft::from(config))?;
    db.put_state(STATE_KEY, &raw)
}
