use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::{PumpConfig, SectionDef};
use crate::error::PumpError;
use crate::events::PumpLogger;
use crate::pipeline::{CycleOutcome, RecordPipeline};

/// One runnable pump cycle, built from a snapshot of the pump configuration.
#[async_trait]
pub trait PumpCycle: Send + Sync {
    async fn run(&self, cancel: &CancellationToken) -> CycleOutcome;
}

#[async_trait]
impl<R: Send + Sync + 'static> PumpCycle for RecordPipeline<R> {
    async fn run(&self, cancel: &CancellationToken) -> CycleOutcome {
        RecordPipeline::run(self, cancel).await
    }
}

/// A kind of pump: the configuration sections it declares and how to build a cycle from them.
pub trait PumpType: Send + Sync {
    fn name(&self) -> &str;

    /// Sections of the pump type, without the `Pump` section every pump has.
    fn sections(&self) -> Vec<SectionDef>;

    fn build_cycle(
        &self,
        config: &PumpConfig,
        logger: PumpLogger,
    ) -> Result<Box<dyn PumpCycle>, PumpError>;
}

/// Pump types available to a worker, populated explicitly at startup.
#[derive(Default, Clone)]
pub struct PumpTypeRegistry {
    types: BTreeMap<String, Arc<dyn PumpType>>,
}

impl PumpTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, pump_type: impl PumpType + 'static) -> Result<(), PumpError> {
        let name = pump_type.name().to_owned();
        if self.types.contains_key(&name) {
            return Err(PumpError::DuplicatePumpType(name));
        }
        self.types.insert(name, Arc::new(pump_type));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn PumpType>, PumpError> {
        self.types
            .get(name)
            .cloned()
            .ok_or_else(|| PumpError::UnknownPumpType(name.to_owned()))
    }

    pub fn names(&self) -> Vec<&str> {
        self.types.keys().map(String::as_str).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::CycleStats;

    struct Noop;

    #[async_trait]
    impl PumpCycle for Noop {
        async fn run(&self, _cancel: &CancellationToken) -> CycleOutcome {
            CycleOutcome {
                summary: "nothing".to_owned(),
                stats: CycleStats::default(),
            }
        }
    }

    struct Named(&'static str);

    impl PumpType for Named {
        fn name(&self) -> &str {
            self.0
        }

        fn sections(&self) -> Vec<SectionDef> {
            vec![SectionDef::new("Source")]
        }

        fn build_cycle(
            &self,
            _config: &PumpConfig,
            _logger: PumpLogger,
        ) -> Result<Box<dyn PumpCycle>, PumpError> {
            Ok(Box::new(Noop))
        }
    }

    #[test]
    fn test_register_and_get() {
        let mut registry = PumpTypeRegistry::new();

        registry.register(Named("File Upload")).unwrap();
        registry.register(Named("DQA3")).unwrap();

        assert_eq!(registry.names(), vec!["DQA3", "File Upload"]);
        assert_eq!(registry.get("DQA3").unwrap().name(), "DQA3");
        assert!(matches!(
            registry.get("Nope"),
            Err(PumpError::UnknownPumpType(name)) if name == "Nope"
        ));
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let mut registry = PumpTypeRegistry::new();
        registry.register(Named("DQA3")).unwrap();

        assert!(matches!(
            registry.register(Named("DQA3")),
            Err(PumpError::DuplicatePumpType(_))
        ));
    }
}
