use crate::wipe_orchestrator::{
    CertificationStatus, EventKind, JobReport, JobState, PlannedJob, ProgressEvent,
};
use crate::Device;
use chrono::Local;
use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use uuid::Uuid;

const BAR_TEMPLATE: &str = "{prefix:>12.bold} [{bar:40.green/240}] {pos:>3}% {wide_msg}";

/// Separator between the timestamp and the message of a log line
const LOG_SEPARATOR: &str = "•";

/// Live per-job progress bars fed by the orchestrator's event bus
pub struct ProgressView {
    multi: MultiProgress,
    style: ProgressStyle,
    bars: HashMap<Uuid, ProgressBar>,
    finished: usize,
    lagged: u64,
}

impl ProgressView {
    pub fn new() -> Self {
        Self::with_target(ProgressDrawTarget::stderr())
    }

    /// A view that tracks state but draws nothing
    pub fn hidden() -> Self {
        Self::with_target(ProgressDrawTarget::hidden())
    }

    fn with_target(target: ProgressDrawTarget) -> Self {
        let style = ProgressStyle::with_template(BAR_TEMPLATE)
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▓░");

        Self {
            multi: MultiProgress::with_draw_target(target),
            style,
            bars: HashMap::new(),
            finished: 0,
            lagged: 0,
        }
    }

    /// Number of jobs whose terminal event has been seen
    pub fn finished_jobs(&self) -> usize {
        self.finished
    }

    /// Events dropped because the view fell behind the bus
    pub fn lagged_events(&self) -> u64 {
        self.lagged
    }

    pub fn position(&self, job_id: Uuid) -> Option<u64> {
        self.bars.get(&job_id).map(|bar| bar.position())
    }

    fn bar(&mut self, event: &ProgressEvent) -> ProgressBar {
        let multi = &self.multi;
        let style = &self.style;
        self.bars
            .entry(event.job_id)
            .or_insert_with(|| {
                let bar = multi.add(ProgressBar::new(100));
                bar.set_style(style.clone());
                bar.set_prefix(event.device_id.clone());
                bar
            })
            .clone()
    }

    pub fn handle(&mut self, event: &ProgressEvent) {
        let bar = self.bar(event);
        if bar.is_finished() {
            return;
        }
        bar.set_position(u64::from(event.percent));

        match &event.kind {
            EventKind::Progress => {}
            EventKind::Completed => {
                bar.finish_with_message(style("done").green().bold().to_string());
                self.finished += 1;
            }
            EventKind::Failed { .. } => {
                bar.abandon_with_message(style(event.describe()).red().to_string());
                self.finished += 1;
            }
            _ => {
                bar.set_message(event.describe());
            }
        }

        if !matches!(event.kind, EventKind::Progress) {
            // println only fails when the terminal is gone
            let _ = self.multi.println(format_log_line(event));
        }
    }

    /// Consume bus events until `jobs` jobs have finished or the bus closes
    pub async fn follow(&mut self, mut events: broadcast::Receiver<ProgressEvent>, jobs: usize) {
        while self.finished < jobs {
            match events.recv().await {
                Ok(event) => self.handle(&event),
                Err(RecvError::Lagged(skipped)) => {
                    self.lagged += skipped;
                    tracing::warn!(skipped, "Progress view fell behind the event bus");
                }
                Err(RecvError::Closed) => break,
            }
        }
    }
}

impl Default for ProgressView {
    fn default() -> Self {
        Self::new()
    }
}

/// `HH:MM:SS • <device>: <message>` in local time
pub fn format_log_line(event: &ProgressEvent) -> String {
    format!(
        "{} {} {}: {}",
        event.timestamp.with_timezone(&Local).format("%H:%M:%S"),
        LOG_SEPARATOR,
        event.device_id,
        event.describe()
    )
}

fn format_capacity(bytes: u64) -> String {
    const GB: f64 = 1_000_000_000.0;
    if bytes as f64 >= GB {
        format!("{:.1} GB", bytes as f64 / GB)
    } else {
        format!("{:.1} MB", bytes as f64 / 1_000_000.0)
    }
}

pub fn render_devices(devices: &[Arc<Device>]) -> String {
    if devices.is_empty() {
        return "No eligible storage devices found.".to_string();
    }

    let mut out = format!(
        "{:<12} {:<32} {:<10} {:>10}  {}\n",
        "ID", "MODEL", "TRANSPORT", "CAPACITY", "NODE"
    );
    for device in devices {
        out.push_str(&format!(
            "{:<12} {:<32} {:<10} {:>10}  {}\n",
            device.id(),
            device.display_name(),
            device.transport().to_string(),
            format_capacity(device.capacity_bytes()),
            device.node().display()
        ));
    }
    out
}

pub fn render_plan(plan: &[PlannedJob]) -> String {
    let mut out = String::new();
    for job in plan {
        out.push_str(&format!(
            "{} {} ({}): {} [{}], {}\n",
            style("→").cyan(),
            job.device_id,
            job.display_name,
            style(job.method.label()).bold(),
            job.standard,
            job.reason
        ));
        if let Some(note) = &job.note {
            out.push_str(&format!("    {} {}\n", style("note:").yellow(), note));
        }
    }
    out
}

fn elapsed(report: &JobReport) -> Option<String> {
    let started = report.job.started_at()?;
    let finished = report.job.finished_at()?;
    let secs = (finished - started).num_seconds().max(0) as u64;
    Some(humantime::format_duration(Duration::from_secs(secs)).to_string())
}

/// One line per job with outcome, duration and certificate status
pub fn render_summary(reports: &[JobReport]) -> String {
    let mut out = String::new();
    for report in reports {
        let outcome = match report.job.state() {
            JobState::Done => style("done").green().bold(),
            _ => style("failed").red().bold(),
        };
        let certificate = match &report.certification {
            CertificationStatus::Issued(cert) => format!("certificate {}", cert.id()),
            CertificationStatus::Skipped => "no certificate (disabled)".to_string(),
            CertificationStatus::Failed(e) => format!("certificate not issued: {}", e),
            CertificationStatus::NotApplicable => match report.job.failure() {
                Some((kind, message)) => format!("{}: {}", kind, message),
                None => "not certified".to_string(),
            },
        };
        out.push_str(&format!(
            "{:<12} {:<7} {:<24} {:>8}  {}\n",
            report.job.device_id(),
            outcome,
            report.job.method().label(),
            elapsed(report).unwrap_or_else(|| "-".to_string()),
            certificate
        ));
    }
    out
}
