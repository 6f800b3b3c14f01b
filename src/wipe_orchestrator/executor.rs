// Sanitization executor
//
// Runs pre-check, invocation and self-report for one device on a dedicated
// worker thread and exposes the progress as a lazy stream. Percentages are on
// the execution scale:
//   pre-check done   5
//   invocation       5..=90
//   self-report      95
//   completed        100

use super::job::{EventKind, ProgressEvent, Stage};
use crate::drives::SanitizeBackend;
use crate::error::retry::{retry_blocking, RetryStrategy};
use crate::{Device, Method, WipeError};
use chrono::Utc;
use futures::channel::mpsc::{self, UnboundedReceiver, UnboundedSender};
use futures::{Stream, StreamExt};
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::thread;
use uuid::Uuid;

pub const PRE_CHECK_DONE: u8 = 5;
pub const INVOCATION_DONE: u8 = 90;
pub const SELF_REPORT_DONE: u8 = 95;

const ARMED: u8 = 0;
const CANCELLED: u8 = 1;
const COMMITTED: u8 = 2;

/// Cancels a job until it commits to the destructive invocation
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    state: Arc<AtomicU8>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Fails with `NotAbortable` once invocation has started.
    pub fn cancel(&self) -> Result<(), WipeError> {
        match self
            .state
            .compare_exchange(ARMED, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) | Err(CANCELLED) => Ok(()),
            Err(_) => Err(WipeError::NotAbortable),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::Acquire) == CANCELLED
    }

    pub fn is_committed(&self) -> bool {
        self.state.load(Ordering::Acquire) == COMMITTED
    }

    /// Point of no return. False when cancellation won the race.
    pub(crate) fn commit(&self) -> bool {
        match self
            .state
            .compare_exchange(ARMED, COMMITTED, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) | Err(COMMITTED) => true,
            Err(_) => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub job_id: Uuid,
    pub cancel: CancelHandle,
}

impl ExecutionContext {
    pub fn new(job_id: Uuid) -> Self {
        Self {
            job_id,
            cancel: CancelHandle::new(),
        }
    }
}

pub struct Executor {
    backend: Arc<dyn SanitizeBackend>,
    retry: Arc<dyn RetryStrategy>,
}

impl Executor {
    pub fn new(backend: Arc<dyn SanitizeBackend>, retry: Arc<dyn RetryStrategy>) -> Self {
        Self { backend, retry }
    }

    /// Nothing runs until the returned stream is first polled
    pub fn execute(&self, device: Arc<Device>, method: Method, context: ExecutionContext) -> ExecutionStream {
        ExecutionStream {
            pending: Some(Worker {
                backend: Arc::clone(&self.backend),
                retry: Arc::clone(&self.retry),
                device,
                method,
                context,
            }),
            receiver: None,
        }
    }
}

/// Progress of one execution. Ends after a `Completed` or `Failed` event.
pub struct ExecutionStream {
    pending: Option<Worker>,
    receiver: Option<UnboundedReceiver<ProgressEvent>>,
}

impl Stream for ExecutionStream {
    type Item = ProgressEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        if let Some(worker) = this.pending.take() {
            let (sender, receiver) = mpsc::unbounded();
            this.receiver = Some(receiver);
            worker.spawn(sender);
        }

        match this.receiver.as_mut() {
            Some(receiver) => receiver.poll_next_unpin(cx),
            None => Poll::Ready(None),
        }
    }
}

struct Worker {
    backend: Arc<dyn SanitizeBackend>,
    retry: Arc<dyn RetryStrategy>,
    device: Arc<Device>,
    method: Method,
    context: ExecutionContext,
}

struct Emitter {
    sender: UnboundedSender<ProgressEvent>,
    job_id: Uuid,
    device_id: String,
    sequence: u64,
    percent: u8,
}

impl Emitter {
    fn emit(&mut self, stage: Stage, percent: u8, kind: EventKind) {
        self.percent = self.percent.max(percent);
        let event = ProgressEvent {
            job_id: self.job_id,
            device_id: self.device_id.clone(),
            sequence: self.sequence,
            timestamp: Utc::now(),
            stage,
            percent: self.percent,
            kind,
        };
        self.sequence += 1;
        // The consumer may be gone; the work carries on regardless
        let _ = self.sender.unbounded_send(event);
    }

    fn fail(&mut self, stage: Stage, error: &WipeError) {
        let percent = self.percent;
        self.emit(stage, percent, EventKind::failed(error));
    }

    fn consumer_gone(&self) -> bool {
        self.sender.is_closed()
    }
}

impl Worker {
    fn spawn(self, sender: UnboundedSender<ProgressEvent>) {
        let name = format!("wipe-{}", self.device.id());
        let job_id = self.context.job_id;
        if let Err(e) = thread::Builder::new()
            .name(name)
            .spawn(move || self.run(sender))
        {
            // The sender went down with the closure, so the stream ends empty
            tracing::error!(job_id = %job_id, error = %e, "Failed to spawn executor thread");
        }
    }

    fn run(self, sender: UnboundedSender<ProgressEvent>) {
        let device = self.device.as_ref();
        let method = self.method;
        let cancel = &self.context.cancel;
        let mut emitter = Emitter {
            sender,
            job_id: self.context.job_id,
            device_id: device.id().to_string(),
            sequence: 0,
            percent: 0,
        };
        let span = tracing::info_span!("execute", job_id = %self.context.job_id, device = device.id(), %method);
        let _entered = span.enter();

        if cancel.is_cancelled() {
            emitter.fail(Stage::PreCheck, &WipeError::Cancelled);
            return;
        }

        // Pre-checks, retried with backoff
        emitter.emit(
            Stage::PreCheck,
            0,
            EventKind::StageStarted {
                description: "Pre-wipe checks: power safety, mount state, capabilities".to_string(),
            },
        );
        let max_attempts = self.retry.max_attempts();
        let pre_check = retry_blocking(
            self.retry.as_ref(),
            |attempt, _delay, error| {
                emitter.emit(
                    Stage::PreCheck,
                    0,
                    EventKind::Retrying {
                        attempt,
                        max_attempts,
                        reason: error.to_string(),
                    },
                )
            },
            |_attempt| {
                if cancel.is_cancelled() {
                    return Err(WipeError::Cancelled);
                }
                self.backend.pre_check(device, method)
            },
        );
        if let Err((attempts, error)) = pre_check {
            let error = match error {
                WipeError::Cancelled => WipeError::Cancelled,
                other => WipeError::PreCheck {
                    attempts,
                    reason: other.to_string(),
                },
            };
            emitter.fail(Stage::PreCheck, &error);
            return;
        }
        emitter.emit(
            Stage::PreCheck,
            PRE_CHECK_DONE,
            EventKind::Note {
                message: "Pre-wipe checks passed".to_string(),
            },
        );

        // Point of no return
        if emitter.consumer_gone() {
            let _ = cancel.cancel();
        }
        if !cancel.commit() {
            tracing::info!("Cancelled before invocation");
            emitter.fail(Stage::PreCheck, &WipeError::Cancelled);
            return;
        }

        emitter.emit(
            Stage::Invocation,
            PRE_CHECK_DONE,
            EventKind::StageStarted {
                description: format!("Executing secure erase routine: {}", method.label()),
            },
        );
        tracing::info!("Invoking sanitization method");
        let invocation = self.backend.invoke(device, method, &mut |percent| {
            let span = u16::from(INVOCATION_DONE - PRE_CHECK_DONE);
            let mapped = PRE_CHECK_DONE as u16 + u16::from(percent.min(100)) * span / 100;
            if mapped as u8 > emitter.percent {
                emitter.emit(Stage::Invocation, mapped as u8, EventKind::Progress);
            }
        });
        if let Err(error) = invocation {
            let error = match error {
                WipeError::Execution(_) => error,
                other => WipeError::Execution(other.to_string()),
            };
            tracing::error!(error = %error, "Sanitization failed");
            emitter.fail(Stage::Invocation, &error);
            return;
        }

        emitter.emit(
            Stage::SelfReport,
            INVOCATION_DONE,
            EventKind::StageStarted {
                description: "Collecting device self-report".to_string(),
            },
        );
        match self.backend.self_report(device, method) {
            Ok(report) if report.completed => emitter.emit(
                Stage::SelfReport,
                SELF_REPORT_DONE,
                EventKind::Note {
                    message: report.summary,
                },
            ),
            Ok(report) => {
                emitter.fail(
                    Stage::SelfReport,
                    &WipeError::Execution(format!(
                        "device reports the operation incomplete: {}",
                        report.summary
                    )),
                );
                return;
            }
            Err(error) => {
                emitter.fail(
                    Stage::SelfReport,
                    &WipeError::Execution(format!("self-report unavailable: {}", error)),
                );
                return;
            }
        }

        emitter.emit(Stage::SelfReport, 100, EventKind::Completed);
    }
}
