// Sanitization backends
//
// - command.rs: real device commands (nvme-cli, hdparm, blkdiscard) and their output parsers
// - overwrite.rs: in-process zero fill
// - simulated.rs: deterministic backend for demos and tests

pub mod command;
pub mod overwrite;
pub mod simulated;

#[cfg(test)]
mod command_tests;

pub use command::CommandBackend;
pub use simulated::{FaultPlan, SimulatedBackend};

use crate::{Device, Method, WipeResult};
use serde::{Deserialize, Serialize};

/// Device-side completion report collected after invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelfReport {
    pub completed: bool,
    pub summary: String,
}

/// Authoritative completion status reported by the device itself
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attestation {
    pub passed: bool,
    pub detail: String,
}

/// Executes sanitization methods against devices.
///
/// All calls block; the executor runs them on a worker thread.
pub trait SanitizeBackend: Send + Sync {
    /// Confirm the device can take `method` right now
    fn pre_check(&self, device: &Device, method: Method) -> WipeResult<()>;

    /// Run the method, reporting invocation progress in 0-100
    fn invoke(
        &self,
        device: &Device,
        method: Method,
        progress: &mut dyn FnMut(u8),
    ) -> WipeResult<()>;

    fn self_report(&self, device: &Device, method: Method) -> WipeResult<SelfReport>;

    /// Device self-attestation, for methods that have one
    fn attestation(&self, _device: &Device, _method: Method) -> WipeResult<Option<Attestation>> {
        Ok(None)
    }
}
