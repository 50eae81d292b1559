//! # Validation
//!
//! `ValidationScheduler` keeps the validity status of every configuration section of a pump current.
//! Validation is scheduled in waves: a full wave covers every dependency level, a subset wave only
//! the sections affected by an edit. A single worker task drains waves in FIFO order, validating the
//! sections of one level concurrently and waiting for the whole level before moving to the next.
//! Before its validator, every section gets its dynamic choices refreshed and its required fields
//! checked.
//!
//! Every wave is identified by a fresh group id. Scheduling a wave records its id as the most recent
//! group of each section it covers, and a result is only applied if its wave is still the most recent
//! one for that section. Results of superseded waves are dropped, and a wave none of whose remaining
//! sections is current any more is abandoned without waiting for its validators.
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::{broadcast, mpsc, watch, RwLock};
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::config::{ChoiceProvider, FieldValues, PumpConfig};
use crate::dependencies::{DependencyGraph, Level};
use crate::error::ConfigError;

/// Message of the result recorded for a validator that panicked.
pub const INVALID_VALIDATOR_MESSAGE: &str = "Invalid Validator Implementation";
pub const VALIDATING_MESSAGE: &str = "Currently validating...";
pub const NOT_VALIDATED_MESSAGE: &str = "Not validated yet";

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Outcome of validating one section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Validation {
    pub valid: bool,
    pub message: String,
}

impl Validation {
    pub fn ok() -> Self {
        Self::valid("OK")
    }

    pub fn valid(message: impl Into<String>) -> Self {
        Self {
            valid: true,
            message: message.into(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self {
            valid: false,
            message: message.into(),
        }
    }
}

/// Check run against the values of every subsection of one section.
#[async_trait]
pub trait SectionValidator: Send + Sync {
    async fn validate(&self, values: Vec<FieldValues>) -> Validation;
}

/// Synchronous check run on the blocking thread pool, so it may touch the filesystem or block on
/// other I/O.
pub struct BlockingValidator<F>(Arc<F>);

impl<F> BlockingValidator<F> {
    pub fn new(check: F) -> Self {
        Self(Arc::new(check))
    }
}

#[async_trait]
impl<F> SectionValidator for BlockingValidator<F>
where
    F: Fn(&[FieldValues]) -> Validation + Send + Sync + 'static,
{
    async fn validate(&self, values: Vec<FieldValues>) -> Validation {
        let check = self.0.clone();
        match tokio::task::spawn_blocking(move || check(&values)).await {
            Ok(validation) => validation,
            // Surfaces in the validation task like a panic of an async validator.
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(e) => Validation::invalid(e.to_string()),
        }
    }
}

/// Validity of a section as last reported. `valid` is `None` while the section is waiting for or
/// running its validator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionStatus {
    pub valid: Option<bool>,
    pub message: String,
}

impl SectionStatus {
    fn pending(message: &str) -> Self {
        Self {
            valid: None,
            message: message.to_owned(),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.valid == Some(true)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationEvent {
    Validated {
        section: String,
        valid: bool,
        message: String,
    },
    /// Sent for each dependent of a section whose result was just applied.
    DependenciesChanged {
        section: String,
        incomplete: Vec<String>,
    },
}

#[derive(Debug)]
struct Wave {
    group: Uuid,
    levels: Vec<Level>,
}

#[derive(Debug, Default)]
struct SchedulerState {
    latest_group: HashMap<String, Uuid>,
    statuses: BTreeMap<String, SectionStatus>,
}

impl SchedulerState {
    fn is_current(&self, section: &str, group: Uuid) -> bool {
        self.latest_group.get(section) == Some(&group)
    }

    fn any_current<'a>(&self, mut sections: impl Iterator<Item = &'a String>, group: Uuid) -> bool {
        sections.any(|section| self.is_current(section, group))
    }

    fn incomplete_dependencies(&self, graph: &DependencyGraph, section: &str) -> Vec<String> {
        graph
            .dependencies_of(section)
            .map(|deps| {
                deps.iter()
                    .filter(|dep| !self.statuses.get(*dep).is_some_and(SectionStatus::is_valid))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Everything the worker task shares with the scheduler handle.
struct Shared {
    pump: String,
    graph: DependencyGraph,
    dependents: BTreeMap<String, BTreeSet<String>>,
    config: Arc<RwLock<PumpConfig>>,
    state: Mutex<SchedulerState>,
    events: broadcast::Sender<ValidationEvent>,
    /// Bumped every time a wave is scheduled.
    generation: watch::Sender<u64>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        // Critical sections never panic, the state is consistent even if a holder did.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: ValidationEvent) {
        // No receivers is fine, statuses remain queryable.
        self.events.send(event).ok();
    }
}

pub struct ValidationScheduler {
    shared: Arc<Shared>,
    queue: mpsc::UnboundedSender<Wave>,
    scheduled: AtomicU64,
    completed: watch::Receiver<u64>,
    cancel: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ValidationScheduler {
    /// Build the dependency graph of `config` and spawn the worker draining validation waves. Nothing
    /// is validated until a wave is scheduled.
    pub async fn start(
        pump: &str,
        config: Arc<RwLock<PumpConfig>>,
        cancel: CancellationToken,
    ) -> Result<Self, ConfigError> {
        let (graph, statuses) = {
            let config = config.read().await;
            let graph = DependencyGraph::new(config.dependency_map())?;
            let statuses = config
                .sections()
                .iter()
                .map(|s| (s.name.clone(), SectionStatus::pending(NOT_VALIDATED_MESSAGE)))
                .collect();
            (graph, statuses)
        };

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let shared = Arc::new(Shared {
            pump: pump.to_owned(),
            dependents: graph.dependents(),
            graph,
            config,
            state: Mutex::new(SchedulerState {
                latest_group: HashMap::new(),
                statuses,
            }),
            events,
            generation: watch::channel(0).0,
        });

        let (queue, waves) = mpsc::unbounded_channel();
        let (completed_tx, completed) = watch::channel(0);
        let worker = tokio::spawn(drain_waves(
            shared.clone(),
            waves,
            completed_tx,
            cancel.clone(),
        ));

        Ok(Self {
            shared,
            queue,
            scheduled: AtomicU64::new(0),
            completed,
            cancel,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Revalidate every section, level by level.
    pub fn schedule_full(&self) -> Uuid {
        self.enqueue(self.shared.graph.levels().to_vec())
    }

    /// Revalidate `section` and every section that transitively depends on it.
    pub fn schedule_subset(&self, section: &str) -> Result<Uuid, ConfigError> {
        let levels = self.shared.graph.level_subset(section);
        if levels.is_empty() {
            return Err(ConfigError::UnknownSection(section.to_owned()));
        }
        Ok(self.enqueue(levels))
    }

    fn enqueue(&self, levels: Vec<Level>) -> Uuid {
        let group = Uuid::now_v7();

        {
            let mut state = self.shared.lock();
            for section in levels.iter().flatten() {
                state.latest_group.insert(section.clone(), group);
            }
        }

        self.scheduled.fetch_add(1, Ordering::SeqCst);
        self.shared.generation.send_modify(|generation| *generation += 1);
        if self.queue.send(Wave { group, levels }).is_err() {
            warn!(
                pump = self.shared.pump,
                "validation worker has stopped, wave {group} will not run"
            );
        }
        group
    }

    pub fn status(&self, section: &str) -> Option<SectionStatus> {
        self.shared.lock().statuses.get(section).cloned()
    }

    pub fn statuses(&self) -> BTreeMap<String, SectionStatus> {
        self.shared.lock().statuses.clone()
    }

    /// Whether every section is currently valid.
    pub fn is_valid(&self) -> bool {
        self.shared
            .lock()
            .statuses
            .values()
            .all(SectionStatus::is_valid)
    }

    pub fn invalid_sections(&self) -> Vec<String> {
        self.shared
            .lock()
            .statuses
            .iter()
            .filter(|(_, status)| !status.is_valid())
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Dependencies of `section` that are not currently valid. A section with incomplete
    /// dependencies is still validated when scheduled; its validator decides what that means.
    pub fn incomplete_dependencies(&self, section: &str) -> Vec<String> {
        self.shared
            .lock()
            .incomplete_dependencies(&self.shared.graph, section)
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.shared.graph
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ValidationEvent> {
        self.shared.events.subscribe()
    }

    /// Wait until every wave scheduled so far has been drained, or the scheduler is terminated.
    pub async fn settled(&self) {
        let target = self.scheduled.load(Ordering::SeqCst);
        let mut completed = self.completed.clone();

        while *completed.borrow_and_update() < target {
            tokio::select! {
                changed = completed.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                _ = self.cancel.cancelled() => return,
            }
        }
    }

    /// Stop the worker. Validators already running are left to finish but their results are dropped.
    pub async fn terminate(&self) {
        self.cancel.cancel();

        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                error!(pump = self.shared.pump, "validation worker failed: {}", e);
            }
        }
    }
}

async fn drain_waves(
    shared: Arc<Shared>,
    mut waves: mpsc::UnboundedReceiver<Wave>,
    completed: watch::Sender<u64>,
    cancel: CancellationToken,
) {
    loop {
        let wave = tokio::select! {
            _ = cancel.cancelled() => break,
            wave = waves.recv() => match wave {
                Some(wave) => wave,
                None => break,
            },
        };

        debug!(
            pump = shared.pump,
            group = %wave.group,
            levels = wave.levels.len(),
            "running validation wave"
        );
        for (idx, level) in wave.levels.iter().enumerate() {
            let later = &wave.levels[idx + 1..];
            let finished = tokio::select! {
                _ = cancel.cancelled() => return,
                finished = run_level(&shared, wave.group, level, later) => finished,
            };
            if !finished {
                break;
            }
        }

        completed.send_modify(|done| *done += 1);
    }
}

/// Validate every section of `level` concurrently, applying each result as it arrives.
///
/// Returns `false` once no section this wave still waits on, in this level or a later one, is current
/// for `group`. The wave is then abandoned so the waves superseding it run right away; its validators
/// keep running detached and their results are never applied.
async fn run_level(shared: &Arc<Shared>, group: Uuid, level: &Level, later: &[Level]) -> bool {
    let mut generation = shared.generation.subscribe();
    {
        let mut state = shared.lock();
        if !state.any_current(level.iter().chain(later.iter().flatten()), group) {
            return false;
        }
        for section in level {
            if state.is_current(section, group) {
                state
                    .statuses
                    .insert(section.clone(), SectionStatus::pending(VALIDATING_MESSAGE));
            }
        }
    }

    let mut running: FuturesUnordered<_> = level
        .iter()
        .map(|section| {
            let handle = tokio::spawn(validate_section(shared.clone(), section.clone()));
            let section = section.clone();
            async move { (section, handle.await) }
        })
        .collect();
    let mut waiting: BTreeSet<String> = level.iter().cloned().collect();

    while !running.is_empty() {
        tokio::select! {
            Some((section, result)) = running.next() => {
                waiting.remove(&section);
                let validation =
                    result.unwrap_or_else(|e| validator_failure(&shared.pump, &section, e));
                apply_result(shared, group, &section, validation);
            }
            Ok(()) = generation.changed() => {
                let current = shared
                    .lock()
                    .any_current(waiting.iter().chain(later.iter().flatten()), group);
                if !current {
                    debug!(
                        pump = shared.pump,
                        group = %group,
                        "abandoning superseded validation wave"
                    );
                    return false;
                }
            }
        }
    }
    true
}

/// Refresh dynamic choices, run the field checks, then the section validator.
async fn validate_section(shared: Arc<Shared>, section: String) -> Validation {
    refresh_choices(&shared, &section).await;

    let (validator, values) = {
        let config = shared.config.read().await;
        if let Err(message) = config.check_section(&section) {
            return Validation::invalid(message);
        }
        (
            config.section(&section).and_then(|s| s.validator.clone()),
            config.values(&section),
        )
    };

    match validator {
        Some(validator) => validator.validate(values).await,
        None => Validation::ok(),
    }
}

/// List the choices of every dynamic choice field of `section`, once all its dependencies are valid.
/// A failed listing keeps the previous choices.
async fn refresh_choices(shared: &Shared, section: &str) {
    let incomplete = shared.lock().incomplete_dependencies(&shared.graph, section);
    if !incomplete.is_empty() {
        return;
    }

    let (providers, state) = {
        let config = shared.config.read().await;
        let providers: Vec<(String, Arc<dyn ChoiceProvider>)> = config
            .section(section)
            .map(|def| {
                def.fields
                    .iter()
                    .filter_map(|f| Some((f.name.clone(), f.dynamic_choices.as_ref()?.0.clone())))
                    .collect()
            })
            .unwrap_or_default();
        (providers, config.state().clone())
    };

    for (field, provider) in providers {
        match provider.choices(state.clone()).await {
            Ok(choices) => {
                debug!(pump = shared.pump, section, field, "listed {} choices", choices.len());
                if let Err(e) = shared.config.write().await.set_choices(section, &field, choices) {
                    warn!(pump = shared.pump, section, field, "failed to set choices: {}", e);
                }
            }
            Err(e) => warn!(pump = shared.pump, section, field, "failed to list choices: {}", e),
        }
    }
}

fn validator_failure(pump: &str, section: &str, e: JoinError) -> Validation {
    if e.is_panic() {
        let payload = e.into_panic();
        let detail = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_owned())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic payload".to_owned());
        error!(pump, section, "validator panicked: {}", detail);
    } else {
        error!(pump, section, "validator task failed: {}", e);
    }
    Validation::invalid(INVALID_VALIDATOR_MESSAGE)
}

fn apply_result(shared: &Shared, group: Uuid, section: &str, validation: Validation) {
    let labels = [("pump", shared.pump.clone())];
    metrics::counter!("pump_validations_total", &labels).increment(1);

    let dependents = {
        let mut state = shared.lock();
        if !state.is_current(section, group) {
            debug!(
                pump = shared.pump,
                section,
                group = %group,
                "discarding result of superseded validation wave"
            );
            metrics::counter!("pump_validations_stale", &labels).increment(1);
            return;
        }

        state.statuses.insert(
            section.to_owned(),
            SectionStatus {
                valid: Some(validation.valid),
                message: validation.message.clone(),
            },
        );

        shared
            .dependents
            .get(section)
            .into_iter()
            .flatten()
            .map(|dependent| {
                let incomplete = state.incomplete_dependencies(&shared.graph, dependent);
                (dependent.clone(), incomplete)
            })
            .collect::<Vec<_>>()
    };

    debug!(
        pump = shared.pump,
        section,
        valid = validation.valid,
        "{}",
        validation.message
    );
    shared.emit(ValidationEvent::Validated {
        section: section.to_owned(),
        valid: validation.valid,
        message: validation.message,
    });
    for (dependent, incomplete) in dependents {
        shared.emit(ValidationEvent::DependenciesChanged {
            section: dependent,
            incomplete,
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use serde_json::json;
    use tokio::sync::Notify;

    use super::*;
    use crate::config::{ConfigState, FieldDef, FieldKind, FieldValuesExt, SectionDef};

    fn host_is_set(values: &[FieldValues]) -> Validation {
        if values.iter().all(|v| !v.str_field("host").is_empty()) {
            Validation::valid("Connected")
        } else {
            Validation::invalid("No host")
        }
    }

    fn config(sections: Vec<SectionDef>) -> Arc<RwLock<PumpConfig>> {
        Arc::new(RwLock::new(PumpConfig::new("Test", "test pump", sections)))
    }

    fn database() -> SectionDef {
        SectionDef::new("Database")
            .field(FieldDef::new("host", FieldKind::String))
            .blocking_validator(host_is_set)
    }

    async fn scheduler(config: Arc<RwLock<PumpConfig>>) -> ValidationScheduler {
        ValidationScheduler::start("test pump", config, CancellationToken::new())
            .await
            .expect("sections form an acyclic graph")
    }

    #[tokio::test]
    async fn test_full_wave_validates_every_section() {
        let config = config(vec![
            database(),
            SectionDef::new("Units").depends_on("Database"),
        ]);
        let scheduler = scheduler(config.clone()).await;

        assert_eq!(
            scheduler.status("Database").unwrap().message,
            NOT_VALIDATED_MESSAGE
        );

        scheduler.schedule_full();
        scheduler.settled().await;

        assert!(!scheduler.is_valid());
        assert_eq!(scheduler.invalid_sections(), vec!["Database".to_owned()]);
        assert_eq!(
            scheduler.status("Units").unwrap(),
            SectionStatus {
                valid: Some(true),
                message: "OK".to_owned()
            }
        );
        assert_eq!(scheduler.incomplete_dependencies("Units"), vec!["Database"]);

        config
            .write()
            .await
            .apply_edit("Database", 0, "host", json!("localhost"))
            .unwrap();
        scheduler.schedule_subset("Database").unwrap();
        scheduler.settled().await;

        assert!(scheduler.is_valid());
        assert_eq!(scheduler.status("Database").unwrap().message, "Connected");
        assert!(scheduler.incomplete_dependencies("Units").is_empty());
    }

    #[tokio::test]
    async fn test_levels_run_in_dependency_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let recorder = |name: &'static str| {
            let order = order.clone();
            move |_: &[FieldValues]| {
                order.lock().unwrap().push(name);
                Validation::ok()
            }
        };

        let config = config(vec![
            SectionDef::new("a").blocking_validator(recorder("a")),
            SectionDef::new("b").depends_on("a").blocking_validator(recorder("b")),
            SectionDef::new("c").blocking_validator(recorder("c")),
            SectionDef::new("d")
                .depends_on("b")
                .depends_on("c")
                .blocking_validator(recorder("d")),
        ]);
        let scheduler = scheduler(config).await;

        scheduler.schedule_full();
        scheduler.settled().await;

        let order = order.lock().unwrap().clone();
        let position = |name| order.iter().position(|s| *s == name).unwrap();
        assert_eq!(order.len(), 4);
        assert!(position("a") < position("b"));
        assert!(position("c") < position("b"));
        assert_eq!(position("d"), 3);
        assert!(scheduler.is_valid());
    }

    #[tokio::test]
    async fn test_subset_wave_skips_unrelated_sections() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = {
            let calls = calls.clone();
            move |_: &[FieldValues]| {
                calls.fetch_add(1, Ordering::SeqCst);
                Validation::ok()
            }
        };
        let config = config(vec![
            SectionDef::new("a"),
            SectionDef::new("b").depends_on("a"),
            SectionDef::new("unrelated").blocking_validator(counted),
        ]);
        let scheduler = scheduler(config).await;

        scheduler.schedule_full();
        scheduler.settled().await;
        scheduler.schedule_subset("a").unwrap();
        scheduler.settled().await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            scheduler.schedule_subset("nope"),
            Err(ConfigError::UnknownSection("nope".to_owned()))
        );
    }

    #[tokio::test]
    async fn test_panicking_validator_is_reported_invalid() {
        let config = config(vec![
            SectionDef::new("broken").blocking_validator(|_: &[FieldValues]| -> Validation {
                panic!("validator bug")
            }),
            SectionDef::new("fine"),
        ]);
        let scheduler = scheduler(config).await;

        scheduler.schedule_full();
        scheduler.settled().await;

        assert_eq!(
            scheduler.status("broken").unwrap(),
            SectionStatus {
                valid: Some(false),
                message: INVALID_VALIDATOR_MESSAGE.to_owned()
            }
        );
        assert!(scheduler.status("fine").unwrap().is_valid());
    }

    /// Validator blocking until released, reporting the value it saw.
    struct Gated {
        release: Arc<Notify>,
        entered: Arc<Notify>,
    }

    #[async_trait]
    impl SectionValidator for Gated {
        async fn validate(&self, values: Vec<FieldValues>) -> Validation {
            let host = values[0].str_field("host").to_owned();
            self.entered.notify_one();
            if host == "old" {
                self.release.notified().await;
            }
            Validation::valid(host)
        }
    }

    #[tokio::test]
    async fn test_superseded_wave_results_are_discarded() {
        let release = Arc::new(Notify::new());
        let entered = Arc::new(Notify::new());
        let config = config(vec![SectionDef::new("Database")
            .field(FieldDef::new("host", FieldKind::String).default("old"))
            .validator(Gated {
                release: release.clone(),
                entered: entered.clone(),
            })]);
        let scheduler = scheduler(config.clone()).await;
        let mut events = scheduler.subscribe();

        // Wave A is stuck validating "old" when the edit schedules wave B.
        scheduler.schedule_subset("Database").unwrap();
        entered.notified().await;
        config
            .write()
            .await
            .apply_edit("Database", 0, "host", json!("new"))
            .unwrap();
        scheduler.schedule_subset("Database").unwrap();
        release.notify_one();

        tokio::time::timeout(Duration::from_secs(5), scheduler.settled())
            .await
            .expect("both waves drain");

        assert_eq!(scheduler.status("Database").unwrap().message, "new");

        let mut validated = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let ValidationEvent::Validated {
                section, message, ..
            } = event
            {
                if section == "Database" {
                    validated.push(message);
                }
            }
        }
        assert_eq!(validated, vec!["new".to_owned()]);
    }

    /// Validator that never returns for "old".
    struct Stalled {
        entered: Arc<Notify>,
    }

    #[async_trait]
    impl SectionValidator for Stalled {
        async fn validate(&self, values: Vec<FieldValues>) -> Validation {
            let host = values[0].str_field("host").to_owned();
            self.entered.notify_one();
            if host == "old" {
                std::future::pending::<()>().await;
            }
            Validation::valid(host)
        }
    }

    #[tokio::test]
    async fn test_stalled_wave_does_not_block_newer_waves() {
        let entered = Arc::new(Notify::new());
        let config = config(vec![
            SectionDef::new("Database")
                .field(FieldDef::new("host", FieldKind::String).default("old"))
                .validator(Stalled {
                    entered: entered.clone(),
                }),
            SectionDef::new("Units").depends_on("Database"),
        ]);
        let scheduler = scheduler(config.clone()).await;

        scheduler.schedule_subset("Database").unwrap();
        entered.notified().await;
        config
            .write()
            .await
            .apply_edit("Database", 0, "host", json!("new"))
            .unwrap();
        scheduler.schedule_subset("Database").unwrap();

        tokio::time::timeout(Duration::from_secs(5), scheduler.settled())
            .await
            .expect("the stalled wave is abandoned");

        assert_eq!(scheduler.status("Database").unwrap().message, "new");
        assert!(scheduler.status("Units").unwrap().is_valid());
    }

    #[tokio::test]
    async fn test_missing_required_field_skips_validator() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = {
            let calls = calls.clone();
            move |_: &[FieldValues]| {
                calls.fetch_add(1, Ordering::SeqCst);
                Validation::ok()
            }
        };
        let config = config(vec![SectionDef::new("Database")
            .field(FieldDef::new("host", FieldKind::String).required())
            .blocking_validator(counted)]);
        let scheduler = scheduler(config.clone()).await;

        scheduler.schedule_full();
        scheduler.settled().await;

        assert_eq!(
            scheduler.status("Database").unwrap(),
            SectionStatus {
                valid: Some(false),
                message: "You must set a host".to_owned()
            }
        );
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        config
            .write()
            .await
            .apply_edit("Database", 0, "host", json!("localhost"))
            .unwrap();
        scheduler.schedule_subset("Database").unwrap();
        scheduler.settled().await;

        assert!(scheduler.status("Database").unwrap().is_valid());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    /// Lists units once a host is configured.
    struct UnitList;

    #[async_trait]
    impl ChoiceProvider for UnitList {
        async fn choices(&self, state: ConfigState) -> Result<Vec<String>, String> {
            let host = state["Database"][0].str_field("host");
            if host.is_empty() {
                return Err("no host".to_owned());
            }
            Ok(vec!["TB1".to_owned(), "TB2".to_owned()])
        }
    }

    #[tokio::test]
    async fn test_choices_are_listed_once_dependencies_are_valid() {
        let config = config(vec![
            database(),
            SectionDef::new("Units").depends_on("Database").field(
                FieldDef::new("unit", FieldKind::Choice)
                    .default("TB3")
                    .choices_from(UnitList),
            ),
        ]);
        let scheduler = scheduler(config.clone()).await;

        // Nothing listed yet, any unit goes.
        scheduler.schedule_full();
        scheduler.settled().await;
        assert!(scheduler.status("Units").unwrap().is_valid());

        config
            .write()
            .await
            .apply_edit("Database", 0, "host", json!("localhost"))
            .unwrap();
        scheduler.schedule_subset("Database").unwrap();
        scheduler.settled().await;

        assert_eq!(
            scheduler.status("Units").unwrap(),
            SectionStatus {
                valid: Some(false),
                message: "TB3 is not a valid unit".to_owned()
            }
        );
        assert!(config
            .write()
            .await
            .apply_edit("Units", 0, "unit", json!("TB9"))
            .is_err());

        config
            .write()
            .await
            .apply_edit("Units", 0, "unit", json!("TB2"))
            .unwrap();
        scheduler.schedule_subset("Units").unwrap();
        scheduler.settled().await;
        assert!(scheduler.status("Units").unwrap().is_valid());
    }

    #[tokio::test]
    async fn test_dependents_are_notified() {
        let config = config(vec![database(), SectionDef::new("Units").depends_on("Database")]);
        let scheduler = scheduler(config).await;
        let mut events = scheduler.subscribe();

        scheduler.schedule_subset("Database").unwrap();
        scheduler.settled().await;

        let mut received = Vec::new();
        while let Ok(event) = events.try_recv() {
            received.push(event);
        }
        assert!(received.contains(&ValidationEvent::DependenciesChanged {
            section: "Units".to_owned(),
            incomplete: vec!["Database".to_owned()],
        }));
    }

    #[tokio::test]
    async fn test_terminate_releases_settled() {
        let release = Arc::new(Notify::new());
        let entered = Arc::new(Notify::new());
        let config = config(vec![SectionDef::new("Database")
            .field(FieldDef::new("host", FieldKind::String).default("old"))
            .validator(Gated {
                release,
                entered: entered.clone(),
            })]);
        let scheduler = scheduler(config).await;

        scheduler.schedule_full();
        entered.notified().await;

        scheduler.cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), scheduler.settled())
            .await
            .expect("settled returns once cancelled");
    }
}
