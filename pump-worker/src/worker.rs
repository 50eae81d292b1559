use std::sync::Arc;
use std::time::Duration;

use pump_common::events::EventSink;
use pump_common::health::HealthRegistry;
use pump_common::registry::PumpTypeRegistry;
use pump_common::runtime::{PumpRuntime, RuntimeOptions};
use tracing::{error, info};

use crate::state::{SavedPump, SavedPumps};

/// Liveness deadline of a pump until its first timer tick reports.
const STARTUP_DEADLINE: Duration = Duration::from_secs(300);

/// The pump runtimes of one worker process.
pub struct PumpWorker {
    runtimes: Vec<Arc<PumpRuntime>>,
}

impl PumpWorker {
    /// Create a runtime for every saved pump and start its timer. Pumps of an unknown type are
    /// logged and left out.
    pub async fn start(
        registry: &PumpTypeRegistry,
        saved: &SavedPumps,
        sink: Arc<dyn EventSink>,
        options: RuntimeOptions,
        liveness: &HealthRegistry,
    ) -> Self {
        let mut runtimes = Vec::with_capacity(saved.len());

        for (name, pump) in saved {
            let pump_type = match registry.get(&pump.pump_type) {
                Ok(pump_type) => pump_type,
                Err(e) => {
                    error!("skipping pump {}: {}", name, e);
                    continue;
                }
            };

            let runtime = match PumpRuntime::new(
                pump_type,
                name,
                Some(&pump.state),
                sink.clone(),
                options.clone(),
            )
            .await
            {
                Ok(runtime) => runtime,
                Err(e) => {
                    error!("failed to create pump {}: {}", name, e);
                    continue;
                }
            };

            let runtime = Arc::new(runtime.with_health(liveness.register(name, STARTUP_DEADLINE)));
            if let Err(e) = runtime.start() {
                error!("failed to start pump {}: {}", name, e);
            }
            runtimes.push(runtime);
        }

        info!("started {} pumps", runtimes.len());
        Self { runtimes }
    }

    pub fn runtimes(&self) -> &[Arc<PumpRuntime>] {
        &self.runtimes
    }

    /// Current state of every pump, in the saved file format.
    pub async fn saved(&self) -> SavedPumps {
        let mut saved = SavedPumps::new();
        for runtime in &self.runtimes {
            saved.insert(
                runtime.name().to_owned(),
                SavedPump {
                    pump_type: runtime.pump_type().to_owned(),
                    state: runtime.state().await,
                },
            );
        }
        saved
    }

    /// Terminate every pump and return their final state.
    pub async fn shutdown(self) -> SavedPumps {
        for runtime in &self.runtimes {
            runtime.terminate().await;
        }
        self.saved().await
    }
}
