use std::sync::{Arc, Mutex};

use horde_contracts::events::{EventWriter, JobEvent};
use serde_json::{json, Value};
use tracing::warn;

/// Host-side sink for job progress. Calls arrive from the job's thread.
pub trait ProgressReporter: Send + Sync {
    /// The service accepted the job.
    fn job_started(&self, _job_id: &str) {}

    fn update_status(&self, text: &str, percent: u8);

    fn report_warning(&self, text: &str);

    fn report_fatal(&self, text: &str, help_url: Option<&str>);

    fn finished(&self);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NullReporter;

impl ProgressReporter for NullReporter {
    fn update_status(&self, _text: &str, _percent: u8) {}

    fn report_warning(&self, _text: &str) {}

    fn report_fatal(&self, _text: &str, _help_url: Option<&str>) {}

    fn finished(&self) {}
}

/// Mirrors progress into the event log, tagged with the job once it is
/// known. Status lines are written only when their text changes, so
/// per-tick percent updates stay out of the log.
#[derive(Debug)]
pub struct EventReporter {
    events: EventWriter,
    job_id: Mutex<Option<String>>,
    last_status: Mutex<Option<String>>,
}

impl EventReporter {
    pub fn new(events: EventWriter) -> Self {
        Self {
            events,
            job_id: Mutex::new(None),
            last_status: Mutex::new(None),
        }
    }

    fn emit(&self, event: JobEvent, fields: Value) {
        let job_id = self.job_id.lock().ok().and_then(|job| job.clone());
        if let Err(err) = self.events.emit(event, job_id.as_deref(), fields) {
            warn!(event = event.as_str(), error = %err, "failed to write progress event");
        }
    }
}

impl ProgressReporter for EventReporter {
    fn job_started(&self, job_id: &str) {
        if let Ok(mut current) = self.job_id.lock() {
            *current = Some(job_id.to_string());
        }
    }

    fn update_status(&self, text: &str, percent: u8) {
        if let Ok(mut last) = self.last_status.lock() {
            if last.as_deref() == Some(text) {
                return;
            }
            *last = Some(text.to_string());
        }
        self.emit(JobEvent::Status, json!({"text": text, "percent": percent}));
    }

    fn report_warning(&self, text: &str) {
        self.emit(JobEvent::Warning, json!({"message": text}));
    }

    fn report_fatal(&self, text: &str, help_url: Option<&str>) {
        self.emit(JobEvent::Failed, json!({"message": text, "help_url": help_url}));
    }

    fn finished(&self) {}
}

/// Fans every call out to several reporters in order.
#[derive(Default)]
pub struct MultiReporter {
    reporters: Vec<Arc<dyn ProgressReporter>>,
}

impl MultiReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, reporter: Arc<dyn ProgressReporter>) -> Self {
        self.reporters.push(reporter);
        self
    }
}

impl ProgressReporter for MultiReporter {
    fn job_started(&self, job_id: &str) {
        for reporter in &self.reporters {
            reporter.job_started(job_id);
        }
    }

    fn update_status(&self, text: &str, percent: u8) {
        for reporter in &self.reporters {
            reporter.update_status(text, percent);
        }
    }

    fn report_warning(&self, text: &str) {
        for reporter in &self.reporters {
            reporter.report_warning(text);
        }
    }

    fn report_fatal(&self, text: &str, help_url: Option<&str>) {
        for reporter in &self.reporters {
            reporter.report_fatal(text, help_url);
        }
    }

    fn finished(&self) {
        for reporter in &self.reporters {
            reporter.finished();
        }
    }
}

/// Calls `finished()` when dropped.
pub struct ProgressGuard<'a> {
    reporter: &'a dyn ProgressReporter,
}

impl<'a> ProgressGuard<'a> {
    pub fn new(reporter: &'a dyn ProgressReporter) -> Self {
        Self { reporter }
    }
}

impl Drop for ProgressGuard<'_> {
    fn drop(&mut self) {
        self.reporter.finished();
    }
}
