// Wipe job state machine and progress events

use crate::{Device, ErrorKind, Method, WipeError, WipeResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Weak};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Running,
    Verifying,
    Done,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Done | JobState::Failed)
    }

    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Failed)
                | (Running, Verifying)
                | (Running, Failed)
                | (Verifying, Done)
                | (Verifying, Failed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Verifying => "verifying",
            JobState::Done => "done",
            JobState::Failed => "failed",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pipeline stage an event belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Inventory,
    Selection,
    PreCheck,
    Invocation,
    SelfReport,
    Verification,
    Finalization,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Inventory => "inventory",
            Stage::Selection => "selection",
            Stage::PreCheck => "pre_check",
            Stage::Invocation => "invocation",
            Stage::SelfReport => "self_report",
            Stage::Verification => "verification",
            Stage::Finalization => "finalization",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    StageStarted {
        description: String,
    },
    Progress,
    Note {
        message: String,
    },
    Retrying {
        attempt: u32,
        max_attempts: u32,
        reason: String,
    },
    Completed,
    Failed {
        error: ErrorKind,
        message: String,
    },
}

impl EventKind {
    pub fn is_terminal(&self) -> bool {
        matches!(self, EventKind::Completed | EventKind::Failed { .. })
    }

    pub fn failed(error: &WipeError) -> Self {
        EventKind::Failed {
            error: error.kind(),
            message: error.to_string(),
        }
    }
}

/// One entry of a job's ordered log, also the unit observers receive
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub job_id: Uuid,
    pub device_id: String,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub stage: Stage,
    pub percent: u8,
    pub kind: EventKind,
}

impl ProgressEvent {
    pub fn is_terminal(&self) -> bool {
        self.kind.is_terminal()
    }

    /// Human-readable line for operators
    pub fn describe(&self) -> String {
        match &self.kind {
            EventKind::StageStarted { description } => description.clone(),
            EventKind::Progress => format!("{}: {}%", self.stage, self.percent),
            EventKind::Note { message } => message.clone(),
            EventKind::Retrying {
                attempt,
                max_attempts,
                reason,
            } => format!(
                "Retrying {} (attempt {}/{}): {}",
                self.stage,
                attempt + 1,
                max_attempts,
                reason
            ),
            EventKind::Completed => "Completed successfully.".to_string(),
            EventKind::Failed { error, message } => format!("{}: {}", error, message),
        }
    }
}

/// A single device's sanitization job.
///
/// Holds only a weak reference to the device snapshot; the job never keeps a
/// device alive. Progress is monotonic, reaches 100 only through
/// [`WipeJob::complete`], and the log is sealed by the terminal event.
#[derive(Debug, Clone)]
pub struct WipeJob {
    id: Uuid,
    device: Weak<Device>,
    device_id: String,
    device_display_name: String,
    method: Method,
    state: JobState,
    progress: u8,
    log: Vec<ProgressEvent>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

impl WipeJob {
    pub fn new(device: &Arc<Device>, method: Method) -> Self {
        Self {
            id: Uuid::new_v4(),
            device: Arc::downgrade(device),
            device_id: device.id().to_string(),
            device_display_name: device.display_name().to_string(),
            method,
            state: JobState::Pending,
            progress: 0,
            log: Vec::new(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Device snapshot, if it is still held by the inventory owner
    pub fn device(&self) -> Option<Arc<Device>> {
        self.device.upgrade()
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn device_display_name(&self) -> &str {
        &self.device_display_name
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn progress(&self) -> u8 {
        self.progress
    }

    pub fn log(&self) -> &[ProgressEvent] {
        &self.log
    }

    /// Set when the job enters `running`
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    /// Set when the job reaches a terminal state
    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    pub fn is_sealed(&self) -> bool {
        self.log.last().map(|e| e.is_terminal()).unwrap_or(false)
    }

    /// Whether any log entry failed with `kind`
    pub fn has_error(&self, kind: ErrorKind) -> bool {
        self.log
            .iter()
            .any(|e| matches!(&e.kind, EventKind::Failed { error, .. } if *error == kind))
    }

    /// Error that ended the job, if it failed
    pub fn failure(&self) -> Option<(ErrorKind, &str)> {
        match self.log.last().map(|e| &e.kind) {
            Some(EventKind::Failed { error, message }) => Some((*error, message.as_str())),
            _ => None,
        }
    }

    /// Append a non-terminal event. Percent is clamped to stay monotonic and
    /// below 100. Returns `None` once the log is sealed.
    pub(crate) fn record(
        &mut self,
        stage: Stage,
        percent: u8,
        kind: EventKind,
    ) -> Option<ProgressEvent> {
        if self.is_sealed() || kind.is_terminal() {
            return None;
        }
        let percent = percent.min(99).max(self.progress);
        Some(self.push(stage, percent, kind))
    }

    pub(crate) fn transition(&mut self, next: JobState) -> WipeResult<()> {
        if !self.state.can_transition_to(next) {
            return Err(WipeError::Execution(format!(
                "invalid job transition {} -> {}",
                self.state, next
            )));
        }
        if next == JobState::Done && self.progress < 100 {
            return Err(WipeError::Execution(
                "job cannot be done before progress reaches 100".to_string(),
            ));
        }

        let now = Utc::now();
        if next == JobState::Running {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.finished_at = Some(now);
        }
        tracing::debug!(job_id = %self.id, from = %self.state, to = %next, "Job state transition");
        self.state = next;
        Ok(())
    }

    /// Record the terminal success event at 100% and move to `done`
    pub(crate) fn complete(&mut self) -> WipeResult<ProgressEvent> {
        if self.state != JobState::Verifying || self.is_sealed() {
            return Err(WipeError::Execution(format!(
                "job in state {} cannot complete",
                self.state
            )));
        }
        let event = self.push(Stage::Finalization, 100, EventKind::Completed);
        self.transition(JobState::Done)?;
        Ok(event)
    }

    /// Record the terminal failure event and move to `failed`
    pub(crate) fn fail(&mut self, stage: Stage, error: &WipeError) -> WipeResult<ProgressEvent> {
        self.fail_with(stage, error.kind(), error.to_string())
    }

    /// Like [`WipeJob::fail`], for failures that arrive already classified
    pub(crate) fn fail_with(
        &mut self,
        stage: Stage,
        error: ErrorKind,
        message: String,
    ) -> WipeResult<ProgressEvent> {
        if self.state.is_terminal() || self.is_sealed() {
            return Err(WipeError::Execution(format!(
                "job in state {} cannot fail",
                self.state
            )));
        }
        let event = self.push(
            stage,
            self.progress.min(99),
            EventKind::Failed { error, message },
        );
        self.transition(JobState::Failed)?;
        Ok(event)
    }

    fn push(&mut self, stage: Stage, percent: u8, kind: EventKind) -> ProgressEvent {
        self.progress = percent;
        let event = ProgressEvent {
            job_id: self.id,
            device_id: self.device_id.clone(),
            sequence: self.log.len() as u64,
            timestamp: Utc::now(),
            stage,
            percent,
            kind,
        };
        self.log.push(event.clone());
        event
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CapabilityFlags, Transport};

    fn device() -> Arc<Device> {
        Arc::new(Device::new(
            "sda",
            "Test SSD",
            "/dev/sda",
            Transport::SATA,
            CapabilityFlags::default(),
            1024,
        ))
    }

    fn note(message: &str) -> EventKind {
        EventKind::Note {
            message: message.to_string(),
        }
    }

    #[test]
    fn test_new_job_is_pending() {
        let device = device();
        let job = WipeJob::new(&device, Method::SinglePassOverwrite);

        assert_eq!(job.state(), JobState::Pending);
        assert_eq!(job.progress(), 0);
        assert_eq!(job.device_id(), "sda");
        assert!(job.log().is_empty());
        assert!(job.started_at().is_none());
    }

    #[test]
    fn test_job_holds_weak_device_reference() {
        let device = device();
        let job = WipeJob::new(&device, Method::SinglePassOverwrite);
        assert!(job.device().is_some());

        drop(device);
        assert!(job.device().is_none());
        assert_eq!(job.device_display_name(), "Test SSD");
    }

    #[test]
    fn test_record_keeps_progress_monotonic_and_below_100() {
        let device = device();
        let mut job = WipeJob::new(&device, Method::SinglePassOverwrite);

        job.record(Stage::Invocation, 40, EventKind::Progress).unwrap();
        let lower = job.record(Stage::Invocation, 10, EventKind::Progress).unwrap();
        assert_eq!(lower.percent, 40);

        let capped = job.record(Stage::Invocation, 100, EventKind::Progress).unwrap();
        assert_eq!(capped.percent, 99);
    }

    #[test]
    fn test_record_rejects_terminal_kinds() {
        let device = device();
        let mut job = WipeJob::new(&device, Method::SinglePassOverwrite);
        assert!(job.record(Stage::Finalization, 100, EventKind::Completed).is_none());
    }

    #[test]
    fn test_sequences_are_ordered() {
        let device = device();
        let mut job = WipeJob::new(&device, Method::SinglePassOverwrite);
        job.record(Stage::Selection, 0, note("a"));
        job.record(Stage::PreCheck, 1, note("b"));

        let sequences: Vec<u64> = job.log().iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, vec![0, 1]);
    }

    #[test]
    fn test_complete_requires_verifying() {
        let device = device();
        let mut job = WipeJob::new(&device, Method::SinglePassOverwrite);
        job.transition(JobState::Running).unwrap();
        assert!(job.complete().is_err());

        job.transition(JobState::Verifying).unwrap();
        let event = job.complete().unwrap();

        assert_eq!(event.percent, 100);
        assert_eq!(job.state(), JobState::Done);
        assert_eq!(job.progress(), 100);
        assert!(job.finished_at().is_some());
    }

    #[test]
    fn test_done_transition_requires_full_progress() {
        let device = device();
        let mut job = WipeJob::new(&device, Method::SinglePassOverwrite);
        job.transition(JobState::Running).unwrap();
        job.transition(JobState::Verifying).unwrap();
        assert!(job.transition(JobState::Done).is_err());
    }

    #[test]
    fn test_log_sealed_after_failure() {
        let device = device();
        let mut job = WipeJob::new(&device, Method::SinglePassOverwrite);
        job.transition(JobState::Running).unwrap();
        job.record(Stage::Invocation, 30, EventKind::Progress);

        let event = job
            .fail(Stage::Invocation, &WipeError::Execution("write error".into()))
            .unwrap();

        assert_eq!(event.percent, 30);
        assert_eq!(job.state(), JobState::Failed);
        assert!(job.is_sealed());
        assert!(job.record(Stage::Invocation, 50, EventKind::Progress).is_none());
        assert!(job.has_error(ErrorKind::ExecutionFailure));
        assert_eq!(job.failure().unwrap().0, ErrorKind::ExecutionFailure);
    }

    #[test]
    fn test_pending_job_can_fail_directly() {
        let device = device();
        let mut job = WipeJob::new(&device, Method::SinglePassOverwrite);
        job.fail(Stage::PreCheck, &WipeError::Cancelled).unwrap();
        assert_eq!(job.state(), JobState::Failed);
        assert!(job.started_at().is_none());
    }

    #[test]
    fn test_invalid_transitions() {
        assert!(!JobState::Pending.can_transition_to(JobState::Done));
        assert!(!JobState::Done.can_transition_to(JobState::Failed));
        assert!(!JobState::Failed.can_transition_to(JobState::Running));
        assert!(JobState::Verifying.can_transition_to(JobState::Failed));
    }

    #[test]
    fn test_event_describe() {
        let event = ProgressEvent {
            job_id: Uuid::nil(),
            device_id: "sda".into(),
            sequence: 0,
            timestamp: Utc::now(),
            stage: Stage::PreCheck,
            percent: 0,
            kind: EventKind::Retrying {
                attempt: 1,
                max_attempts: 3,
                reason: "drive busy".into(),
            },
        };
        assert_eq!(
            event.describe(),
            "Retrying pre_check (attempt 2/3): drive busy"
        );
    }
}
