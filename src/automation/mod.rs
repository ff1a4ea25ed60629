pub mod config;
pub mod history;

use crate::client::NodeClient;
use crate::config::Config;
use crate::db::Database;
use crate::error::ControlError;
use crate::fees::metrics::{self, ChannelMetrics};
use crate::fees::setter::{ApplyOutcome, ApplySettings, Applier};
use crate::fees::{self, policy, ChannelOutcome, FeeParameters, Strategy};
use crate::scheduler::{self, FirstPass};
use crate::state::{Channel, NodeInfo, NodeState};
use crate::tracker::{self, channels::ChannelSample};
use config::{AutomationConfig, ConfigDraft, ConfigStore};
use history::{FeeUpdateRecord, HistoryLog};
use log::{error, info, warn};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;

/// Samples returned with a channel detail: two days of hourly passes.
const DETAIL_SAMPLES: usize = 48;

/// Outcome of one full automation pass.
#[derive(Debug, Clone, Serialize)]
pub struct PassResult {
    pub started_at: i64,
    pub finished_at: i64,
    pub applied: usize,
    pub skipped: usize,
    pub failed: usize,
    pub outcomes: Vec<ChannelOutcome>,
}

impl PassResult {
    fn new(started_at: i64, outcomes: Vec<ChannelOutcome>) -> Self {
        let mut result = Self {
            started_at,
            finished_at: chrono::Utc::now().timestamp(),
            applied: 0,
            skipped: 0,
            failed: 0,
            outcomes,
        };
        for o in &result.outcomes {
            match o.outcome {
                ApplyOutcome::Applied => result.applied += 1,
                ApplyOutcome::Skipped(_) => result.skipped += 1,
                ApplyOutcome::Failed(_) => result.failed += 1,
            }
        }
        result
    }
}

/// What the status endpoint reports about the most recent pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PassSummary {
    Completed {
        finished_at: i64,
        applied: usize,
        skipped: usize,
        failed: usize,
    },
    Aborted {
        at: i64,
        error: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ManagerStatus {
    pub running: bool,
    pub strategy: Strategy,
    pub last_update: Option<i64>,
    pub next_update: Option<i64>,
    pub last_pass: Option<PassSummary>,
}

/// A channel together with what the engine thinks of it right now.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelDetail {
    pub channel: Channel,
    pub metrics: ChannelMetrics,
    pub proposed: FeeParameters,
    /// Newest minus oldest balance ratio over `samples`
    pub balance_change: Option<f64>,
    pub samples: Vec<ChannelSample>,
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub provider_timeout: Duration,
    pub max_concurrent_updates: usize,
    pub first_pass: FirstPass,
}

impl EngineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            provider_timeout: Duration::from_secs(config.engine.provider_timeout_secs),
            max_concurrent_updates: config.engine.max_concurrent_updates,
            first_pass: config.engine.first_pass,
        }
    }
}

#[derive(Default)]
struct RunState {
    running: bool,
    /// Bumped on every start; a scheduler only touches `next_update` while
    /// its generation is current.
    generation: u64,
    last_update: Option<i64>,
    next_update: Option<i64>,
    last_pass: Option<PassSummary>,
    shutdown: Option<watch::Sender<bool>>,
}

struct Inner {
    client: Arc<dyn NodeClient>,
    config: ConfigStore,
    applier: Applier,
    db: Arc<Database>,
    history: HistoryLog,
    settings: EngineSettings,
    run: Mutex<RunState>,
    pass_lock: tokio::sync::Mutex<()>,
}

/// Owns the Stopped/Running state machine and executes passes.
///
/// Cheap to clone; every clone drives the same automation.
#[derive(Clone)]
pub struct Controller {
    inner: Arc<Inner>,
}

impl Controller {
    pub fn new(
        client: Arc<dyn NodeClient>,
        config: ConfigStore,
        db: Arc<Database>,
        apply: ApplySettings,
        settings: EngineSettings,
    ) -> Self {
        let history = HistoryLog::new(Arc::clone(&db));
        let applier = Applier::new(Arc::clone(&client), history.clone(), apply);
        Self {
            inner: Arc::new(Inner {
                client,
                config,
                applier,
                db,
                history,
                settings,
                run: Mutex::new(RunState::default()),
                pass_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    fn run_state(&self) -> MutexGuard<'_, RunState> {
        self.inner.run.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Stopped -> Running. Spawns the scheduler task; must be called from
    /// within a tokio runtime.
    pub fn start(&self) -> Result<(), ControlError> {
        let mut run = self.run_state();
        if run.running {
            return Err(ControlError::AlreadyRunning);
        }
        let (tx, rx) = watch::channel(false);
        run.running = true;
        run.generation += 1;
        run.shutdown = Some(tx);
        let generation = run.generation;
        drop(run);

        tokio::spawn(scheduler::run(self.clone(), generation, rx));
        info!(
            "Automation: started (strategy={}, interval={}s)",
            self.inner.config.get().strategy,
            self.inner.config.get().update_interval_secs
        );
        Ok(())
    }

    /// Running -> Stopped. A pass already in flight finishes; no new one
    /// starts.
    pub fn stop(&self) -> Result<(), ControlError> {
        let mut run = self.run_state();
        if !run.running {
            return Err(ControlError::NotRunning);
        }
        run.running = false;
        run.next_update = None;
        if let Some(tx) = run.shutdown.take() {
            let _ = tx.send(true);
        }
        drop(run);

        info!("Automation: stopped");
        Ok(())
    }

    pub fn status(&self) -> ManagerStatus {
        let strategy = self.inner.config.get().strategy;
        let run = self.run_state();
        ManagerStatus {
            running: run.running,
            strategy,
            last_update: run.last_update,
            next_update: run.next_update,
            last_pass: run.last_pass.clone(),
        }
    }

    pub fn config(&self) -> Arc<AutomationConfig> {
        self.inner.config.get()
    }

    pub fn set_config(&self, draft: ConfigDraft) -> Result<Arc<AutomationConfig>, ControlError> {
        self.inner.config.set(draft)
    }

    /// Resolves once no pass holds the pass lock.
    pub(crate) async fn wait_until_idle(&self) {
        drop(self.inner.pass_lock.lock().await);
    }

    pub(crate) fn first_pass(&self) -> FirstPass {
        self.inner.settings.first_pass
    }

    /// Record when generation `generation` will run next.
    pub(crate) fn schedule_next(&self, generation: u64, delay: Duration) {
        let mut run = self.run_state();
        if run.running && run.generation == generation {
            run.next_update = Some(chrono::Utc::now().timestamp() + delay.as_secs() as i64);
        }
    }

    /// Run one full pass now. Never queues behind a running pass.
    pub async fn run_once(&self) -> Result<PassResult, ControlError> {
        let _guard = self
            .inner
            .pass_lock
            .try_lock()
            .map_err(|_| ControlError::PassInProgress)?;

        let started_at = chrono::Utc::now().timestamp();
        let config = self.inner.config.get();
        info!("Automation: pass started (strategy={})", config.strategy);

        let state = match NodeState::collect(&*self.inner.client, self.inner.settings.provider_timeout).await {
            Ok(state) => state,
            Err(e) => {
                error!("Automation: pass aborted: {}", e);
                self.run_state().last_pass = Some(PassSummary::Aborted {
                    at: chrono::Utc::now().timestamp(),
                    error: e.to_string(),
                });
                return Err(e);
            }
        };

        if let Err(e) = tracker::update(&self.inner.db, &state) {
            warn!("Automation: failed to record channel samples: {:#}", e);
        }

        let outcomes = self.process_channels(state.channels, config).await;
        let result = PassResult::new(started_at, outcomes);

        info!(
            "Automation: pass finished -- {} applied, {} skipped, {} failed",
            result.applied, result.skipped, result.failed
        );

        let mut run = self.run_state();
        run.last_update = Some(result.finished_at);
        run.last_pass = Some(PassSummary::Completed {
            finished_at: result.finished_at,
            applied: result.applied,
            skipped: result.skipped,
            failed: result.failed,
        });
        drop(run);

        Ok(result)
    }

    async fn process_channels(
        &self,
        channels: Vec<Channel>,
        config: Arc<AutomationConfig>,
    ) -> Vec<ChannelOutcome> {
        let limiter = Arc::new(Semaphore::new(self.inner.settings.max_concurrent_updates.max(1)));
        let mut tasks = JoinSet::new();

        for channel in channels {
            let applier = self.inner.applier.clone();
            let config = Arc::clone(&config);
            let limiter = Arc::clone(&limiter);
            tasks.spawn(async move {
                let _permit = limiter.acquire_owned().await.ok();
                fees::process_channel(&applier, &channel, &config).await
            });
        }

        let mut outcomes = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => error!("Automation: channel task failed: {}", e),
            }
        }
        outcomes.sort_by(|a, b| a.channel_id.cmp(&b.channel_id));
        outcomes
    }

    /// Apply operator-chosen fees to one channel. Values are clamped to the
    /// configured bounds and the time-lock floor; exclusion and idempotence
    /// still apply.
    pub async fn update_channel_fees(
        &self,
        channel_id: &str,
        params: FeeParameters,
    ) -> Result<ApplyOutcome, ControlError> {
        let config = self.inner.config.get();
        let state = NodeState::collect(&*self.inner.client, self.inner.settings.provider_timeout).await?;
        let channel = state
            .find(channel_id)
            .ok_or_else(|| ControlError::ChannelNotFound(channel_id.to_string()))?;

        let clamped = policy::clamp_to_bounds(params, &config);
        if clamped != params {
            info!(
                "Automation: manual fees for channel {} clamped to base={}msat, ppm={}, cltv_delta={}",
                channel_id, clamped.base_fee_msat, clamped.fee_rate, clamped.time_lock_delta
            );
        }
        Ok(self.inner.applier.apply(channel, clamped, &config).await)
    }

    pub fn history(&self, limit: usize) -> Result<Vec<FeeUpdateRecord>, ControlError> {
        Ok(self.inner.history.recent(limit)?)
    }

    pub async fn channel_detail(&self, channel_id: &str) -> Result<ChannelDetail, ControlError> {
        let config = self.inner.config.get();
        let state = NodeState::collect(&*self.inner.client, self.inner.settings.provider_timeout).await?;
        let channel = state
            .find(channel_id)
            .cloned()
            .ok_or_else(|| ControlError::ChannelNotFound(channel_id.to_string()))?;

        let metrics = metrics::compute(&channel);
        let proposed = policy::propose(&channel, &metrics, &config);
        let samples =
            tracker::channels::recent_samples(&self.inner.db, channel_id, DETAIL_SAMPLES)?;

        let balance_change = match (samples.first(), samples.last()) {
            (Some(newest), Some(oldest)) if samples.len() > 1 => {
                Some(newest.balance_ratio() - oldest.balance_ratio())
            }
            _ => None,
        };

        Ok(ChannelDetail {
            channel,
            metrics,
            proposed,
            balance_change,
            samples,
        })
    }

    pub async fn node_info(&self) -> Result<NodeInfo, ControlError> {
        let timeout = self.inner.settings.provider_timeout;
        match tokio::time::timeout(timeout, self.inner.client.get_node_info()).await {
            Ok(Ok(info)) => Ok(info),
            Ok(Err(e)) => Err(ControlError::ProviderUnavailable(format!("{:#}", e))),
            Err(_) => Err(ControlError::ProviderUnavailable(format!(
                "no node info within {}s",
                timeout.as_secs_f64()
            ))),
        }
    }

    pub async fn channels(&self) -> Result<Vec<Channel>, ControlError> {
        let state = NodeState::collect(&*self.inner.client, self.inner.settings.provider_timeout).await?;
        Ok(state.channels)
    }
}

#[cfg(test)]
pub mod test_support {
    use super::*;
    use crate::client::mock::MockNodeClient;

    pub fn apply_settings() -> ApplySettings {
        ApplySettings {
            dry_run: false,
            max_attempts: 3,
            retry_base: Duration::from_millis(1),
            call_timeout: Duration::from_secs(2),
            channel_timeout: Duration::from_secs(5),
        }
    }

    pub fn engine_settings() -> EngineSettings {
        EngineSettings {
            provider_timeout: Duration::from_secs(2),
            max_concurrent_updates: 4,
            first_pass: FirstPass::Immediate,
        }
    }

    pub fn controller_with(
        mock: &Arc<MockNodeClient>,
        config: AutomationConfig,
        apply: ApplySettings,
    ) -> Controller {
        let client: Arc<dyn NodeClient> = mock.clone();
        let db = Arc::new(Database::open_in_memory().unwrap());
        Controller::new(client, ConfigStore::new(config), db, apply, engine_settings())
    }

    pub fn controller(mock: &Arc<MockNodeClient>) -> Controller {
        controller_with(mock, AutomationConfig::default(), apply_settings())
    }

    /// Poll `cond` until it holds or two seconds pass.
    pub async fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if cond() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cond()
    }
}
