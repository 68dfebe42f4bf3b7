use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use horde_contracts::request::GenerationRequest;

use crate::client::{GenerationOutcome, HordeClient};
use crate::error::{HordeError, Result};
use crate::progress::ProgressReporter;

/// Shared flag the host flips to abandon a running job.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A generation running on its own thread.
pub struct JobThread {
    cancel: CancelToken,
    handle: thread::JoinHandle<Result<GenerationOutcome>>,
}

impl JobThread {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub fn join(self) -> Result<GenerationOutcome> {
        match self.handle.join() {
            Ok(result) => result,
            Err(_) => Err(HordeError::Io(std::io::Error::other(
                "generation thread panicked",
            ))),
        }
    }
}

pub fn spawn_generation(
    client: Arc<HordeClient>,
    request: GenerationRequest,
    out_dir: PathBuf,
    reporter: Arc<dyn ProgressReporter>,
) -> Result<JobThread> {
    let cancel = CancelToken::new();
    let token = cancel.clone();
    let handle = thread::Builder::new()
        .name("horde-job".to_string())
        .spawn(move || client.generate(&request, &out_dir, reporter.as_ref(), &token))?;
    Ok(JobThread { cancel, handle })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::config::HordeConfig;
    use crate::testing::{RecordingReporter, ScriptedTransport, VirtualClock};
    use crate::transport::HttpReply;

    fn client(transport: Arc<ScriptedTransport>, clock: Arc<VirtualClock>) -> HordeClient {
        let config = HordeConfig::default().with_api_base("https://horde.test/api/v2");
        HordeClient::with_transport(config, transport, clock)
    }

    #[test]
    fn background_job_delivers_images() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let transport = Arc::new(ScriptedTransport::new());
        transport
            .on_post("generate/async", HttpReply::json(202, &json!({"id": "job-1"})))
            .on_get(
                "generate/check/job-1",
                HttpReply::json(200, &json!({"done": true, "finished": 1})),
            )
            .on_get(
                "generate/status/job-1",
                HttpReply::json(200, &json!({"generations": [{"img": "aGVsbG8=", "seed": "1"}]})),
            );
        let clock = Arc::new(VirtualClock::default());
        let reporter = Arc::new(RecordingReporter::default());
        let job = spawn_generation(
            Arc::new(client(transport, clock)),
            GenerationRequest::new("a fox"),
            temp.path().to_path_buf(),
            reporter.clone(),
        )?;
        let outcome = job.join()?;
        assert_eq!(outcome.images.len(), 1);
        assert_eq!(std::fs::read(&outcome.images[0].path)?, b"hello");
        assert_eq!(reporter.finished_count(), 1);
        Ok(())
    }

    #[test]
    fn cancelled_job_is_abandoned_with_status_url() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let transport = Arc::new(ScriptedTransport::new());
        transport
            .on_post("generate/async", HttpReply::json(202, &json!({"id": "job-2"})))
            .on_get(
                "generate/check/job-2",
                HttpReply::json(200, &json!({"done": false, "wait_time": 60, "queue_position": 9})),
            );
        let clock = Arc::new(VirtualClock::default());
        let reporter = Arc::new(RecordingReporter::default());
        let shared = Arc::new(client(transport.clone(), clock.clone()));
        let request = GenerationRequest::new("a fox");

        let token = CancelToken::new();
        clock.cancel_at(Duration::from_secs(20), token.clone());
        let result = shared.generate(&request, temp.path(), reporter.as_ref(), &token);
        match result {
            Err(HordeError::Abandoned { status_url }) => {
                assert_eq!(status_url, "https://horde.test/api/v2/generate/status/job-2");
            }
            other => panic!("expected abandoned, got {other:?}"),
        }
        assert!(clock.elapsed() < Duration::from_secs(21));
        assert_eq!(transport.count("GET", "generate/status/"), 0);
        assert_eq!(reporter.finished_count(), 1);
        Ok(())
    }

    #[test]
    fn cancel_token_is_shared_between_clones() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }
}
