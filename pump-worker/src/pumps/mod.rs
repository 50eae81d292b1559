use std::time::Duration;

use pump_common::error::PumpError;
use pump_common::pipeline::MissingDataRule;
use pump_common::registry::PumpTypeRegistry;

pub mod file_upload;
pub mod mpc;

/// Registry of the pump types this worker ships with.
pub fn registry(
    timeout: Duration,
    missing_data: MissingDataRule,
) -> Result<PumpTypeRegistry, PumpError> {
    let mut registry = PumpTypeRegistry::new();
    registry.register(file_upload::FileUpload::new(timeout, missing_data.clone()))?;
    registry.register(file_upload::FileUpload::binary(timeout, missing_data.clone()))?;
    registry.register(mpc::Mpc::new(timeout, missing_data))?;
    Ok(registry)
}
