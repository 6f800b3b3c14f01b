use super::{Attestation, SanitizeBackend, SelfReport};
use crate::verification::MediaReader;
use crate::{Device, Method, WipeError, WipeResult};
use std::collections::HashMap;
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

/// Leftover content served from region 0 of a device that still holds data
const RESIDUAL_CONTENT: &[u8] = b"%PDF-1.7\n%\xe2\xe3\xcf\xd3\n1 0 obj\n<< /Type /Catalog >>\nendobj\n";

/// Faults to inject for one device
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FaultPlan {
    /// Number of leading pre-check attempts that fail
    pub pre_check_failures: u32,
    /// Invocation errors out part way
    pub fail_invocation: bool,
    /// Data is still readable after the wipe
    pub residual_after_wipe: bool,
    /// Device self-report says the operation did not finish
    pub incomplete_self_report: bool,
}

#[derive(Debug, Default)]
struct DeviceState {
    pre_check_attempts: u32,
    wiped: bool,
    invocations: Vec<(Instant, Instant)>,
}

/// Backend with staged timings and injectable faults, no hardware access
pub struct SimulatedBackend {
    step_delay: Duration,
    faults: HashMap<String, FaultPlan>,
    state: Mutex<HashMap<String, DeviceState>>,
}

impl SimulatedBackend {
    /// `step_delay` is slept between each 10% of invocation progress
    pub fn new(step_delay: Duration) -> Self {
        Self {
            step_delay,
            faults: HashMap::new(),
            state: Mutex::new(HashMap::new()),
        }
    }

    pub fn instant() -> Self {
        Self::new(Duration::ZERO)
    }

    pub fn with_fault(mut self, device_id: impl Into<String>, plan: FaultPlan) -> Self {
        self.faults.insert(device_id.into(), plan);
        self
    }

    fn fault(&self, device: &Device) -> FaultPlan {
        self.faults.get(device.id()).cloned().unwrap_or_default()
    }

    fn with_state<T>(&self, device: &Device, f: impl FnOnce(&mut DeviceState) -> T) -> WipeResult<T> {
        let mut states = self
            .state
            .lock()
            .map_err(|_| WipeError::Execution("simulator state poisoned".to_string()))?;
        Ok(f(states.entry(device.id().to_string()).or_default()))
    }

    /// Pre-check attempts seen so far for a device
    pub fn pre_check_attempts(&self, device_id: &str) -> u32 {
        self.state
            .lock()
            .ok()
            .and_then(|s| s.get(device_id).map(|d| d.pre_check_attempts))
            .unwrap_or(0)
    }

    /// Start and end instants of every invocation on a device
    pub fn invocations(&self, device_id: &str) -> Vec<(Instant, Instant)> {
        self.state
            .lock()
            .ok()
            .and_then(|s| s.get(device_id).map(|d| d.invocations.clone()))
            .unwrap_or_default()
    }
}

impl SanitizeBackend for SimulatedBackend {
    fn pre_check(&self, device: &Device, method: Method) -> WipeResult<()> {
        let fault = self.fault(device);
        let attempt = self.with_state(device, |s| {
            s.pre_check_attempts += 1;
            s.pre_check_attempts
        })?;

        if attempt <= fault.pre_check_failures {
            tracing::debug!(device = device.id(), attempt, "Simulated pre-check failure");
            return Err(WipeError::Io(format!(
                "{} busy (simulated, attempt {})",
                device.id(),
                attempt
            )));
        }
        tracing::debug!(device = device.id(), %method, "Simulated pre-check passed");
        Ok(())
    }

    fn invoke(
        &self,
        device: &Device,
        method: Method,
        progress: &mut dyn FnMut(u8),
    ) -> WipeResult<()> {
        let fault = self.fault(device);
        let started = Instant::now();
        let mut outcome = Ok(());

        for step in 0..=10u8 {
            if step > 0 {
                thread::sleep(self.step_delay);
            }
            if fault.fail_invocation && step == 4 {
                outcome = Err(WipeError::Execution(format!(
                    "{} failed on {} (simulated)",
                    method.label(),
                    device.id()
                )));
                break;
            }
            progress(step * 10);
        }

        let finished = Instant::now();
        let succeeded = outcome.is_ok();
        self.with_state(device, |s| {
            s.invocations.push((started, finished));
            s.wiped = s.wiped || succeeded;
        })?;
        outcome
    }

    fn self_report(&self, device: &Device, method: Method) -> WipeResult<SelfReport> {
        let fault = self.fault(device);
        Ok(SelfReport {
            completed: !fault.incomplete_self_report,
            summary: if fault.incomplete_self_report {
                format!("{} reported incomplete (simulated)", method.label())
            } else {
                format!("{} reported complete (simulated)", method.label())
            },
        })
    }

    fn attestation(&self, device: &Device, method: Method) -> WipeResult<Option<Attestation>> {
        if !method.supports_self_attestation() {
            return Ok(None);
        }
        let wiped = self.with_state(device, |s| s.wiped)?;
        let passed = wiped && !self.fault(device).residual_after_wipe;
        Ok(Some(Attestation {
            passed,
            detail: format!(
                "sanitize status {} (simulated)",
                if passed { "completed" } else { "failed" }
            ),
        }))
    }
}

impl MediaReader for SimulatedBackend {
    fn read_region(&self, device: &Device, offset: u64, len: usize) -> WipeResult<Vec<u8>> {
        let wiped = self.with_state(device, |s| s.wiped)?;
        let residual = !wiped || self.fault(device).residual_after_wipe;

        let mut region = vec![0u8; len];
        if residual && offset == 0 {
            let n = RESIDUAL_CONTENT.len().min(len);
            region[..n].copy_from_slice(&RESIDUAL_CONTENT[..n]);
        }
        Ok(region)
    }
}
