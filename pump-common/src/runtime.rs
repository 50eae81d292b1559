//! # Runtime
//!
//! `PumpRuntime` ties one configured pump to its validation scheduler and runs its cycles, either on
//! demand or on a timer. A cycle only runs while the pump is active and every section is valid.
use std::collections::BTreeMap;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigState, PumpConfig};
use crate::error::PumpError;
use crate::events::{EventSink, PumpLogger};
use crate::health::HealthHandle;
use crate::pipeline::CycleOutcome;
use crate::registry::PumpType;
use crate::validation::{SectionStatus, ValidationEvent, ValidationScheduler};

/// Liveness deadline on top of the pump interval.
const HEALTH_GRACE: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// How long `stop` waits for an in-flight cycle to wind down.
    pub join_timeout: Duration,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            join_timeout: Duration::from_secs(10),
        }
    }
}

pub struct PumpRuntime {
    name: String,
    pump_type: Arc<dyn PumpType>,
    config: Arc<RwLock<PumpConfig>>,
    scheduler: ValidationScheduler,
    sink: Arc<dyn EventSink>,
    options: RuntimeOptions,
    health: Option<HealthHandle>,
    /// Held for the duration of a cycle.
    cycle: tokio::sync::Mutex<()>,
    running: AtomicBool,
    /// Cancelled on terminate, parent of every other token.
    terminate: CancellationToken,
    /// Cancelled on stop, then replaced so the pump can be started again.
    stop: Mutex<CancellationToken>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl PumpRuntime {
    /// Build the configuration of a pump named `name`, merge `saved` over its defaults and schedule a
    /// full validation.
    pub async fn new(
        pump_type: Arc<dyn PumpType>,
        name: &str,
        saved: Option<&ConfigState>,
        sink: Arc<dyn EventSink>,
        options: RuntimeOptions,
    ) -> Result<Self, PumpError> {
        let mut config = PumpConfig::new(pump_type.name(), name, pump_type.sections());
        if let Some(saved) = saved {
            config.merge_saved(saved);
        }
        let config = Arc::new(RwLock::new(config));

        let terminate = CancellationToken::new();
        let scheduler =
            ValidationScheduler::start(name, config.clone(), terminate.child_token()).await?;
        scheduler.schedule_full();

        Ok(Self {
            name: name.to_owned(),
            pump_type,
            config,
            scheduler,
            sink,
            options,
            health: None,
            cycle: tokio::sync::Mutex::new(()),
            running: AtomicBool::new(false),
            stop: Mutex::new(terminate.child_token()),
            terminate,
            timer: Mutex::new(None),
        })
    }

    pub fn with_health(mut self, health: HealthHandle) -> Self {
        self.health = Some(health);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pump_type(&self) -> &str {
        self.pump_type.name()
    }

    /// Edit one field. A changed value schedules revalidation of its section and dependents.
    pub async fn apply_edit(
        &self,
        section: &str,
        index: usize,
        field: &str,
        value: Value,
    ) -> Result<bool, PumpError> {
        // The write lock stays held while scheduling so edits and their waves are ordered.
        let mut config = self.config.write().await;
        let changed = config.apply_edit(section, index, field, value)?;
        if changed {
            self.scheduler.schedule_subset(section)?;
        }
        Ok(changed)
    }

    pub async fn add_subsection(&self, section: &str) -> Result<usize, PumpError> {
        let mut config = self.config.write().await;
        let index = config.add_subsection(section)?;
        self.scheduler.schedule_subset(section)?;
        Ok(index)
    }

    pub async fn remove_subsection(&self, section: &str, index: usize) -> Result<(), PumpError> {
        let mut config = self.config.write().await;
        config.remove_subsection(section, index)?;
        self.scheduler.schedule_subset(section)?;
        Ok(())
    }

    pub fn schedule_full(&self) {
        self.scheduler.schedule_full();
    }

    /// Snapshot of the configuration values, in the persisted shape.
    pub async fn state(&self) -> ConfigState {
        self.config.read().await.state().clone()
    }

    pub async fn config(&self) -> PumpConfig {
        self.config.read().await.clone()
    }

    pub fn statuses(&self) -> BTreeMap<String, SectionStatus> {
        self.scheduler.statuses()
    }

    pub fn is_valid(&self) -> bool {
        self.scheduler.is_valid()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ValidationEvent> {
        self.scheduler.subscribe()
    }

    /// Wait for every validation scheduled so far.
    pub async fn settled(&self) {
        self.scheduler.settled().await
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn lock_stop(&self) -> MutexGuard<'_, CancellationToken> {
        self.stop.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_timer(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.timer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run a single cycle now.
    pub async fn run_once(&self) -> Result<CycleOutcome, PumpError> {
        let cancel = self.lock_stop().clone();
        self.run_cycle(&cancel).await
    }

    async fn run_cycle(&self, cancel: &CancellationToken) -> Result<CycleOutcome, PumpError> {
        if self.terminate.is_cancelled() {
            return Err(PumpError::Terminated(self.name.clone()));
        }
        let Ok(_cycle) = self.cycle.try_lock() else {
            return Err(PumpError::AlreadyRunning(self.name.clone()));
        };

        let (cycle, logger) = {
            let config = self.config.read().await;
            if !config.active() {
                return Err(PumpError::Inactive(self.name.clone()));
            }
            if !self.scheduler.is_valid() {
                return Err(PumpError::Invalid {
                    pump: self.name.clone(),
                    sections: self.scheduler.invalid_sections(),
                });
            }

            let logger = PumpLogger::new(&self.name, config.log_level(), self.sink.clone());
            (self.pump_type.build_cycle(&config, logger.clone())?, logger)
        };

        self.running.store(true, Ordering::SeqCst);
        logger.info("Starting pump cycle");
        let outcome = cycle.run(cancel).await;
        logger.info(outcome.summary.clone());
        self.running.store(false, Ordering::SeqCst);

        Ok(outcome)
    }

    /// Wait for validation to settle, then run a cycle now and every `interval (s)` after that until
    /// stopped.
    pub fn start(self: &Arc<Self>) -> Result<(), PumpError> {
        if self.terminate.is_cancelled() {
            return Err(PumpError::Terminated(self.name.clone()));
        }

        let mut timer = self.lock_timer();
        if timer.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return Err(PumpError::AlreadyRunning(self.name.clone()));
        }

        let cancel = self.lock_stop().clone();
        let runtime = self.clone();
        *timer = Some(tokio::spawn(async move { runtime.run_timer(cancel).await }));
        info!(pump = self.name, "pump started");
        Ok(())
    }

    async fn run_timer(&self, cancel: CancellationToken) {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = self.scheduler.settled() => {}
        }

        loop {
            let interval = self.config.read().await.interval();
            if let Some(health) = &self.health {
                health.report_healthy_for(interval + HEALTH_GRACE);
            }

            match self.run_cycle(&cancel).await {
                Ok(outcome) => debug!(pump = self.name, "cycle complete: {}", outcome.summary),
                Err(PumpError::Inactive(_)) => debug!(pump = self.name, "pump inactive, skipping"),
                Err(e) => warn!(pump = self.name, "cycle not run: {}", e),
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    /// Stop the timer and cancel the in-flight cycle, waiting up to the join timeout for it to end.
    pub async fn stop(&self) {
        let previous = mem::replace(&mut *self.lock_stop(), self.terminate.child_token());
        previous.cancel();

        let handle = self.lock_timer().take();
        let Some(handle) = handle else {
            return;
        };

        match tokio::time::timeout(self.options.join_timeout, handle).await {
            Ok(Ok(())) => info!(pump = self.name, "pump stopped"),
            Ok(Err(e)) => error!(pump = self.name, "pump timer failed: {}", e),
            Err(_) => warn!(
                pump = self.name,
                "pump did not stop within {:?}", self.options.join_timeout
            ),
        }
    }

    /// Stop the pump for good, including its validation worker.
    pub async fn terminate(&self) {
        self.terminate.cancel();
        self.stop().await;
        self.scheduler.terminate().await;
    }
}
