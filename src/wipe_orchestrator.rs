// Wipe Orchestrator - runs each selected device through the sanitization pipeline
//
// Every job is an independent task: select method -> execute (pre-check,
// invocation, self-report) -> verify -> certify. Jobs for distinct devices run
// concurrently up to `execution.max_parallel_jobs`; the device lock table keeps
// jobs for the same device strictly sequential. A job's failure stays in its
// own log and report and never stops its siblings.

pub mod events;
pub mod executor;
pub mod job;
pub mod lock;

pub use events::EventBus;
pub use executor::{CancelHandle, ExecutionContext, ExecutionStream, Executor};
pub use job::{EventKind, JobState, ProgressEvent, Stage, WipeJob};
pub use lock::{DeviceLease, DeviceLockTable};

use crate::audit::{AuditSink, JsonLinesAuditSink, NullAuditSink};
use crate::crypto::{Certificate, CertificateIssuer, FileSecretStore, SecretStore};
use crate::drives::{
    select_with_reason, CommandBackend, DeviceInventory, InventorySnapshot, InventorySource,
    SanitizeBackend, Selection, SelectionReason, SimulatedBackend, SysfsInventory,
};
use crate::error::{ExponentialBackoff, RetryStrategy};
use crate::verification::{BlockDeviceReader, MediaReader, VerificationResult, Verifier};
use crate::{Device, Method, Transport, WipeConfig, WipeError, WipeResult};
use futures::StreamExt;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::Instrument;
use uuid::Uuid;

/// Share of job progress given to execution; verification fills the rest up to 99
const EXECUTION_SHARE: u8 = 90;

/// Outcome of certificate issuance for a job
#[derive(Debug, Clone)]
pub enum CertificationStatus {
    Issued(Certificate),
    /// Certificates disabled; the job makes no compliance claim
    Skipped,
    /// Job is done but signing failed; `reissue` can try again
    Failed(WipeError),
    /// Job did not reach `done`
    NotApplicable,
}

#[derive(Debug, Clone)]
pub struct JobReport {
    pub job: WipeJob,
    pub verification: Option<VerificationResult>,
    pub certification: CertificationStatus,
}

impl JobReport {
    pub fn certificate(&self) -> Option<&Certificate> {
        match &self.certification {
            CertificationStatus::Issued(certificate) => Some(certificate),
            _ => None,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.job.state() == JobState::Done
    }
}

/// What `plan` would do for one device
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannedJob {
    pub device_id: String,
    pub display_name: String,
    pub transport: Transport,
    pub method: Method,
    pub standard: String,
    pub reason: SelectionReason,
    pub note: Option<String>,
}

impl PlannedJob {
    fn new(device: &Device, selection: &Selection) -> Self {
        Self {
            device_id: device.id().to_string(),
            display_name: device.display_name().to_string(),
            transport: device.transport().clone(),
            method: selection.method,
            standard: selection.method.standard().to_string(),
            reason: selection.reason,
            note: selection.mismatch.as_ref().map(|e| e.to_string()),
        }
    }
}

/// Handle to a submitted job
pub struct JobHandle {
    job_id: Uuid,
    device_id: String,
    cancel: CancelHandle,
    task: JoinHandle<JobReport>,
}

impl JobHandle {
    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Cancel the job. Fails with `NotAbortable` once invocation has started.
    pub fn cancel(&self) -> WipeResult<()> {
        self.cancel.cancel()
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub async fn wait(self) -> WipeResult<JobReport> {
        self.task
            .await
            .map_err(|e| WipeError::Execution(format!("job task for {} aborted: {}", self.device_id, e)))
    }
}

pub struct OrchestratorBuilder {
    config: WipeConfig,
    inventory: Option<Arc<dyn InventorySource>>,
    backend: Option<Arc<dyn SanitizeBackend>>,
    reader: Option<Arc<dyn MediaReader>>,
    secret_store: Option<Arc<dyn SecretStore>>,
    audit: Option<Arc<dyn AuditSink>>,
    retry: Option<Arc<dyn RetryStrategy>>,
}

impl OrchestratorBuilder {
    pub fn inventory(mut self, inventory: Arc<dyn InventorySource>) -> Self {
        self.inventory = Some(inventory);
        self
    }

    pub fn backend(mut self, backend: Arc<dyn SanitizeBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn reader(mut self, reader: Arc<dyn MediaReader>) -> Self {
        self.reader = Some(reader);
        self
    }

    /// Use one simulator as both sanitization backend and media reader
    pub fn simulated(self, simulator: Arc<SimulatedBackend>) -> Self {
        self.backend(simulator.clone()).reader(simulator)
    }

    pub fn secret_store(mut self, store: Arc<dyn SecretStore>) -> Self {
        self.secret_store = Some(store);
        self
    }

    pub fn audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn retry(mut self, retry: Arc<dyn RetryStrategy>) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn build(self) -> WipeResult<WipeOrchestrator> {
        let config = self.config;
        config.validate()?;

        let inventory = self
            .inventory
            .unwrap_or_else(|| Arc::new(SysfsInventory::new(&config.inventory)));
        let backend = self.backend.unwrap_or_else(|| {
            Arc::new(CommandBackend::new(
                config.execution.clone(),
                &config.inventory.sysfs_root,
            ))
        });
        let reader = self.reader.unwrap_or_else(|| Arc::new(BlockDeviceReader));
        let secret_store = self.secret_store.unwrap_or_else(|| {
            Arc::new(FileSecretStore::new(
                config.certificate.key_dir.clone(),
                config.certificate.signature_algorithm,
            ))
        });
        let audit: Arc<dyn AuditSink> = match (self.audit, &config.audit.path) {
            (Some(audit), _) => audit,
            (None, Some(path)) => Arc::new(JsonLinesAuditSink::open(path)?),
            (None, None) => Arc::new(NullAuditSink),
        };
        let retry = self.retry.unwrap_or_else(|| {
            Arc::new(ExponentialBackoff::new(
                Duration::from_millis(config.execution.precheck_base_delay_ms),
                Duration::from_millis(config.execution.precheck_max_delay_ms),
                config.execution.precheck_max_attempts,
            ))
        });

        let shared = Shared {
            inventory: DeviceInventory::new(inventory, &config.inventory.exclude),
            executor: Executor::new(Arc::clone(&backend), retry),
            verifier: Verifier::new(backend, reader, config.verification.clone()),
            issuer: CertificateIssuer::new(secret_store, &config.certificate),
            audit,
            locks: DeviceLockTable::new(),
            bus: EventBus::new(config.execution.event_buffer),
            slots: Arc::new(Semaphore::new(config.execution.max_parallel_jobs)),
            config,
        };
        Ok(WipeOrchestrator {
            shared: Arc::new(shared),
        })
    }
}

struct Shared {
    config: WipeConfig,
    inventory: DeviceInventory,
    executor: Executor,
    verifier: Verifier,
    issuer: CertificateIssuer,
    audit: Arc<dyn AuditSink>,
    locks: Arc<DeviceLockTable>,
    bus: EventBus,
    slots: Arc<Semaphore>,
}

impl Shared {
    /// Fan an event out to observers and the audit trail
    fn publish(&self, event: ProgressEvent) {
        if let Err(e) = self.audit.record_event(&event) {
            tracing::warn!(job_id = %event.job_id, error = %e, "Audit sink rejected event");
        }
        self.bus.publish(event);
    }
}

/// Main sanitization orchestrator
#[derive(Clone)]
pub struct WipeOrchestrator {
    shared: Arc<Shared>,
}

impl WipeOrchestrator {
    pub fn builder(config: WipeConfig) -> OrchestratorBuilder {
        OrchestratorBuilder {
            config,
            inventory: None,
            backend: None,
            reader: None,
            secret_store: None,
            audit: None,
            retry: None,
        }
    }

    pub fn config(&self) -> &WipeConfig {
        &self.shared.config
    }

    pub fn locks(&self) -> &Arc<DeviceLockTable> {
        &self.shared.locks
    }

    pub fn enumerate(&self) -> WipeResult<InventorySnapshot> {
        self.shared.inventory.enumerate()
    }

    pub fn plan(&self, snapshot: &InventorySnapshot) -> Vec<PlannedJob> {
        snapshot
            .devices()
            .iter()
            .map(|device| PlannedJob::new(device, &select_with_reason(device)))
            .collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.shared.bus.subscribe()
    }

    /// Start a job for `device`. Must be called within a Tokio runtime.
    pub fn submit(&self, device: &Arc<Device>) -> JobHandle {
        let selection = select_with_reason(device);
        let job = WipeJob::new(device, selection.method);
        let job_id = job.id();
        let cancel = CancelHandle::new();

        tracing::info!(job_id = %job_id, device = device.id(), method = %selection.method, "Job submitted");

        let span = tracing::info_span!("job", job_id = %job_id, device = device.id());
        let run = JobRun {
            shared: Arc::clone(&self.shared),
            device: Arc::clone(device),
            job,
            verification: None,
        };
        let task = tokio::spawn(run.execute(selection, cancel.clone()).instrument(span));

        JobHandle {
            job_id,
            device_id: device.id().to_string(),
            cancel,
            task,
        }
    }

    /// Submit every device and wait for all reports
    pub async fn run_all(&self, devices: &[Arc<Device>]) -> Vec<WipeResult<JobReport>> {
        let handles: Vec<JobHandle> = devices.iter().map(|d| self.submit(d)).collect();
        futures::future::join_all(handles.into_iter().map(JobHandle::wait)).await
    }

    /// Issue a certificate again for a job that is already done
    pub fn reissue(&self, job: &WipeJob) -> WipeResult<Certificate> {
        let certificate = self.shared.issuer.issue(job)?;
        if let Err(e) = self.shared.audit.record_certificate(&certificate) {
            tracing::warn!(certificate_id = certificate.id(), error = %e, "Audit sink rejected certificate");
        }
        Ok(certificate)
    }
}

/// One job's trip through the pipeline
struct JobRun {
    shared: Arc<Shared>,
    device: Arc<Device>,
    job: WipeJob,
    verification: Option<VerificationResult>,
}

impl JobRun {
    fn record(&mut self, stage: Stage, percent: u8, kind: EventKind) {
        if let Some(event) = self.job.record(stage, percent, kind) {
            self.shared.publish(event);
        }
    }

    fn note(&mut self, stage: Stage, percent: u8, message: String) {
        self.record(stage, percent, EventKind::Note { message });
    }

    fn fail(&mut self, stage: Stage, error: &WipeError) {
        tracing::warn!(error = %error, kind = %error.kind(), "Job failed");
        match self.job.fail(stage, error) {
            Ok(event) => self.shared.publish(event),
            Err(e) => tracing::error!(error = %e, "Could not record job failure"),
        }
    }

    fn report(self, certification: CertificationStatus) -> JobReport {
        JobReport {
            job: self.job,
            verification: self.verification,
            certification,
        }
    }

    async fn execute(mut self, selection: Selection, cancel: CancelHandle) -> JobReport {
        let device = Arc::clone(&self.device);
        let method = selection.method;

        self.note(
            Stage::Inventory,
            0,
            format!(
                "Detecting storage devices: {} ({}, {} GB)",
                device.display_name(),
                device.transport(),
                device.capacity_bytes() / 1_000_000_000
            ),
        );
        self.note(
            Stage::Selection,
            0,
            format!(
                "Selected best method: {} ({}), {}",
                method.label(),
                method.standard(),
                selection.reason
            ),
        );
        if let Some(mismatch) = &selection.mismatch {
            self.note(Stage::Selection, 0, mismatch.to_string());
        }

        let _slot = match Arc::clone(&self.shared.slots).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                self.fail(
                    Stage::PreCheck,
                    &WipeError::Execution("job scheduler shut down".to_string()),
                );
                return self.report(CertificationStatus::NotApplicable);
            }
        };
        let lease = self.shared.locks.acquire(device.id()).await;

        if cancel.is_cancelled() {
            self.fail(Stage::PreCheck, &WipeError::Cancelled);
            return self.report(CertificationStatus::NotApplicable);
        }
        if let Err(e) = self.job.transition(JobState::Running) {
            self.fail(Stage::PreCheck, &e);
            return self.report(CertificationStatus::NotApplicable);
        }

        if !self.run_execution(method, cancel).await || !self.run_verification(method).await {
            drop(lease);
            return self.report(CertificationStatus::NotApplicable);
        }

        self.record(
            Stage::Finalization,
            99,
            EventKind::StageStarted {
                description: "Finalizing logs and generating certificate".to_string(),
            },
        );
        match self.job.complete() {
            Ok(event) => self.shared.publish(event),
            Err(e) => {
                self.fail(Stage::Finalization, &e);
                drop(lease);
                return self.report(CertificationStatus::NotApplicable);
            }
        }
        drop(lease);
        tracing::info!("Job done");

        let certification = self.certify();
        self.report(certification)
    }

    /// Drive the executor stream into the job log. False if the job failed.
    async fn run_execution(&mut self, method: Method, cancel: CancelHandle) -> bool {
        let context = ExecutionContext {
            job_id: self.job.id(),
            cancel,
        };
        let mut stream = self
            .shared
            .executor
            .execute(Arc::clone(&self.device), method, context);

        while let Some(event) = stream.next().await {
            let percent = (u16::from(event.percent) * u16::from(EXECUTION_SHARE) / 100) as u8;
            match event.kind {
                EventKind::Completed => return true,
                EventKind::Failed { error, message } => {
                    tracing::warn!(stage = %event.stage, kind = %error, "Execution failed");
                    match self.job.fail_with(event.stage, error, message) {
                        Ok(event) => self.shared.publish(event),
                        Err(e) => tracing::error!(error = %e, "Could not record job failure"),
                    }
                    return false;
                }
                kind => self.record(event.stage, percent, kind),
            }
        }

        self.fail(
            Stage::Invocation,
            &WipeError::Execution("executor stopped without reporting an outcome".to_string()),
        );
        false
    }

    /// Run verification off the async runtime. False if the job failed.
    async fn run_verification(&mut self, method: Method) -> bool {
        if let Err(e) = self.job.transition(JobState::Verifying) {
            self.fail(Stage::Verification, &e);
            return false;
        }
        self.record(
            Stage::Verification,
            EXECUTION_SHARE,
            EventKind::StageStarted {
                description: "Post-wipe validation: device self-report + random verify".to_string(),
            },
        );

        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel::<(u32, u32)>();
        let shared = Arc::clone(&self.shared);
        let device = Arc::clone(&self.device);
        let task = tokio::task::spawn_blocking(move || {
            shared
                .verifier
                .verify_observed(&device, method, &mut |done, total| {
                    let _ = progress_tx.send((done, total));
                })
        });

        while let Some((done, total)) = progress_rx.recv().await {
            let span = u32::from(99 - EXECUTION_SHARE);
            let percent = EXECUTION_SHARE as u32 + done * span / total.max(1);
            self.record(Stage::Verification, percent as u8, EventKind::Progress);
        }

        let outcome = match task.await {
            Ok(outcome) => outcome,
            Err(e) => Err(WipeError::Verification(format!("verification task aborted: {}", e))),
        };
        match outcome {
            Ok(result) => {
                let error = result.to_error();
                let summary = match (&error, result.sampled_regions) {
                    (None, 0) => "Verification passed: device self-attestation".to_string(),
                    (None, n) => format!("Verification passed: {} regions sampled", n),
                    (Some(_), _) => String::new(),
                };
                self.verification = Some(result);
                match error {
                    None => {
                        self.note(Stage::Verification, 99, summary);
                        true
                    }
                    Some(error) => {
                        self.fail(Stage::Verification, &error);
                        false
                    }
                }
            }
            Err(error) => {
                let error = match error {
                    WipeError::Verification(_) => error,
                    other => WipeError::Verification(other.to_string()),
                };
                self.fail(Stage::Verification, &error);
                false
            }
        }
    }

    fn certify(&self) -> CertificationStatus {
        if !self.shared.config.certificate.enabled {
            tracing::info!("Continuing without certificate");
            return CertificationStatus::Skipped;
        }

        match self.shared.issuer.issue(&self.job) {
            Ok(certificate) => {
                if let Err(e) = self.shared.audit.record_certificate(&certificate) {
                    tracing::warn!(certificate_id = certificate.id(), error = %e, "Audit sink rejected certificate");
                }
                CertificationStatus::Issued(certificate)
            }
            Err(e) => {
                tracing::error!(error = %e, "Certificate issuance failed; job remains done but uncertified");
                CertificationStatus::Failed(e)
            }
        }
    }
}
