use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use horde_contracts::artifacts::{build_artifact_metadata, metadata_path_for, write_artifact_metadata};
use horde_contracts::events::{EventWriter, JobEvent};
use horde_contracts::models::{ModelCatalog, ModelSelector};
use horde_contracts::request::{Credential, GenerationMode, GenerationRequest, ResolvedRequest};
use horde_contracts::status::{DownloadedImage, GeneratedImage, ImagePayload, JobStatus, UserInfo};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::config::{HordeConfig, REGISTER_URL};
use crate::error::{HordeError, Result};
use crate::jobs::CancelToken;
use crate::progress::{ProgressGuard, ProgressReporter};
use crate::transport::{Clock, HttpReply, ReqwestTransport, SystemClock, Transport};
use crate::{push_unique_warning, truncate_text};

/// A job accepted by the service. Only `HordeClient` creates these.
#[derive(Debug)]
pub struct JobHandle {
    id: String,
    credential: Credential,
    warnings: Vec<String>,
    kudos: Option<f64>,
}

impl JobHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn kudos(&self) -> Option<f64> {
        self.kudos
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PreparedSubmission {
    pub resolved: ResolvedRequest,
    pub payload: Value,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchOutcome {
    pub images: Vec<DownloadedImage>,
    pub warnings: Vec<String>,
    pub censored: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationOutcome {
    pub job_id: String,
    pub status_url: String,
    pub resolved: ResolvedRequest,
    pub status: JobStatus,
    pub images: Vec<DownloadedImage>,
    pub warnings: Vec<String>,
}

pub struct HordeClient {
    config: HordeConfig,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    selector: ModelSelector,
    events: Option<EventWriter>,
}

impl HordeClient {
    pub fn new(config: HordeConfig) -> Result<Self> {
        let transport = Arc::new(ReqwestTransport::new(&config)?);
        Ok(Self::with_transport(config, transport, Arc::new(SystemClock)))
    }

    pub fn with_transport(
        config: HordeConfig,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            transport,
            clock,
            selector: ModelSelector::new(None),
            events: None,
        }
    }

    pub fn with_catalog(mut self, catalog: ModelCatalog) -> Self {
        self.selector = ModelSelector::new(Some(catalog));
        self
    }

    pub fn with_events(mut self, events: EventWriter) -> Self {
        self.events = Some(events);
        self
    }

    pub fn config(&self) -> &HordeConfig {
        &self.config
    }

    pub fn catalog(&self) -> &ModelCatalog {
        &self.selector.catalog
    }

    pub(crate) fn transport(&self) -> Arc<dyn Transport> {
        Arc::clone(&self.transport)
    }

    /// Validates `request`, picks the model and fits the size. No network.
    pub fn prepare(&self, request: &GenerationRequest) -> Result<PreparedSubmission> {
        request.validate().map_err(HordeError::InvalidRequest)?;
        let selection = self
            .selector
            .select(request.model.as_deref(), request.mode)
            .map_err(HordeError::InvalidRequest)?;

        let mut warnings = Vec::new();
        if selection.requested.is_some() {
            if let Some(reason) = &selection.fallback_reason {
                push_unique_warning(&mut warnings, reason.clone());
            }
        }
        let params = &request.params;
        let (width, height) = self.config.dimensions.fit(params.width, params.height);
        if (width, height) != (params.width, params.height) {
            push_unique_warning(
                &mut warnings,
                format!(
                    "Requested size {}x{} adjusted to {width}x{height}.",
                    params.width, params.height
                ),
            );
        }

        let resolved = ResolvedRequest {
            model: selection.model.name,
            width,
            height,
            fallback_reason: selection.fallback_reason,
            warnings,
        };
        let payload = build_submit_payload(request, &resolved);
        Ok(PreparedSubmission { resolved, payload })
    }

    pub fn submit(&self, request: &GenerationRequest) -> Result<JobHandle> {
        let prepared = self.prepare(request)?;
        self.submit_prepared(&prepared, &request.credential)
    }

    pub fn submit_prepared(
        &self,
        prepared: &PreparedSubmission,
        credential: &Credential,
    ) -> Result<JobHandle> {
        let url = self.config.endpoint("generate/async");
        let reply = self
            .transport
            .post_json(&url, &self.headers(credential), &prepared.payload)?;
        if !reply.is_success() {
            return Err(service_rejection(&reply, credential));
        }
        let body = parse_body(&reply, "submission")?;
        let Some(id) = body
            .get("id")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
        else {
            return Err(HordeError::Decode(format!(
                "submission response has no job id: {}",
                truncate_text(&reply.text(), 200)
            )));
        };

        let mut warnings = Vec::new();
        if let Some(rows) = body.get("warnings").and_then(Value::as_array) {
            for row in rows {
                let message = row
                    .get("message")
                    .and_then(Value::as_str)
                    .or_else(|| row.as_str())
                    .unwrap_or_default();
                push_unique_warning(&mut warnings, message.trim().to_string());
            }
        }
        if let Some(message) = body
            .get("message")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
        {
            push_unique_warning(&mut warnings, message.to_string());
        }

        let handle = JobHandle {
            id: id.to_string(),
            credential: credential.clone(),
            warnings,
            kudos: body.get("kudos").and_then(Value::as_f64),
        };
        info!(
            job_id = %handle.id,
            model = %prepared.resolved.model,
            width = prepared.resolved.width,
            height = prepared.resolved.height,
            "job submitted"
        );
        self.emit(
            JobEvent::Submitted,
            Some(&handle.id),
            json!({
                "model": prepared.resolved.model,
                "width": prepared.resolved.width,
                "height": prepared.resolved.height,
                "kudos": handle.kudos,
                "warnings": handle.warnings,
            }),
        );
        Ok(handle)
    }

    /// Handle for a job submitted earlier, e.g. by another process.
    pub fn resume(&self, job_id: &str, credential: Credential) -> Result<JobHandle> {
        let id = job_id.trim();
        if id.is_empty()
            || !id
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_')
        {
            return Err(HordeError::InvalidRequest(format!(
                "'{job_id}' is not a valid job id."
            )));
        }
        Ok(JobHandle {
            id: id.to_string(),
            credential,
            warnings: Vec::new(),
            kudos: None,
        })
    }

    pub fn status_url(&self, handle: &JobHandle) -> String {
        self.config.status_url(&handle.id)
    }

    /// Gives up on a job and returns the address its results stay reachable at.
    pub fn into_status_url(&self, handle: JobHandle) -> String {
        self.config.status_url(&handle.id)
    }

    pub fn poll(&self, handle: &JobHandle) -> Result<JobStatus> {
        let url = self.config.endpoint(&format!("generate/check/{}", handle.id));
        let reply = self.transport.get(&url, &self.headers(&handle.credential))?;
        if !reply.is_success() {
            return Err(service_rejection(&reply, &handle.credential));
        }
        let body = parse_body(&reply, "status check")?;
        JobStatus::from_check_payload(&body).map_err(HordeError::Decode)
    }

    /// Polls until the job finishes, becomes impossible, faults, runs past
    /// `budget` or `cancel` trips. Each check is followed by a pause of
    /// [`poll_interval`] spent in `tick`-sized slices.
    pub fn await_completion(
        &self,
        handle: &JobHandle,
        budget: Duration,
        reporter: &dyn ProgressReporter,
        cancel: &CancelToken,
    ) -> Result<JobStatus> {
        let started = self.clock.now();
        let mut checks = 0u32;
        let mut reported: Vec<String> = Vec::new();
        loop {
            if cancel.is_cancelled() {
                return Err(HordeError::Abandoned {
                    status_url: self.status_url(handle),
                });
            }

            let status = self.poll(handle)?;
            checks += 1;
            let checked_at = self.clock.now();
            let elapsed = checked_at.saturating_duration_since(started);
            debug!(
                job_id = %handle.id,
                checks,
                finished = status.finished,
                queue_position = status.queue_position,
                wait_time = status.wait_time_secs,
                "job status"
            );
            for warning in &status.warnings {
                if !reported.contains(warning) {
                    reporter.report_warning(warning);
                    reported.push(warning.clone());
                }
            }

            if status.finished {
                reporter.update_status(&status.describe(), 100);
                return Ok(status);
            }
            if status.faulted {
                return Err(HordeError::ServiceRejected {
                    status: 200,
                    message: "The job faulted on the worker and produced no images.".to_string(),
                    rc: Some("JobFaulted".to_string()),
                    help_url: None,
                });
            }
            if !status.possible {
                return Err(HordeError::NoWorkerAvailable {
                    status: Box::new(status),
                });
            }
            if elapsed >= budget {
                return Err(HordeError::Timeout {
                    budget,
                    status: Box::new(status),
                    status_url: self.status_url(handle),
                });
            }

            reporter.update_status(
                &status.describe(),
                status.progress_percent(elapsed, Duration::ZERO),
            );
            let delay = poll_interval(&status, &self.config);
            self.wait_with_ticks(delay, &status, started, checked_at, reporter, cancel);
        }
    }

    fn wait_with_ticks(
        &self,
        delay: Duration,
        status: &JobStatus,
        started: Instant,
        checked_at: Instant,
        reporter: &dyn ProgressReporter,
        cancel: &CancelToken,
    ) {
        let deadline = checked_at + delay;
        loop {
            let now = self.clock.now();
            if now >= deadline || cancel.is_cancelled() {
                return;
            }
            self.clock.sleep((deadline - now).min(self.config.tick));
            let now = self.clock.now();
            reporter.update_status(
                &status.describe(),
                status.progress_percent(
                    now.saturating_duration_since(started),
                    now.saturating_duration_since(checked_at),
                ),
            );
        }
    }

    /// Downloads every uncensored generation into `out_dir`.
    pub fn fetch_results(
        &self,
        handle: &JobHandle,
        out_dir: &Path,
        reporter: &dyn ProgressReporter,
    ) -> Result<FetchOutcome> {
        let url = self.status_url(handle);
        let reply = self.transport.get(&url, &self.headers(&handle.credential))?;
        if !reply.is_success() {
            return Err(service_rejection(&reply, &handle.credential));
        }
        let body = parse_body(&reply, "status")?;
        let generations =
            GeneratedImage::list_from_status_payload(&body).map_err(HordeError::Decode)?;
        fs::create_dir_all(out_dir)?;

        let mut outcome = FetchOutcome::default();
        let downloaded =
            self.download_generations(handle, &generations, out_dir, reporter, &mut outcome);
        if let Err(err) = downloaded {
            // Partial downloads would have no sidecars; drop them.
            discard_images(&outcome.images);
            return Err(err);
        }
        Ok(outcome)
    }

    fn download_generations(
        &self,
        handle: &JobHandle,
        generations: &[GeneratedImage],
        out_dir: &Path,
        reporter: &dyn ProgressReporter,
        outcome: &mut FetchOutcome,
    ) -> Result<()> {
        for (idx, generation) in generations.iter().enumerate() {
            if generation.censored {
                let message = format!(
                    "Image {} of {} was censored by the service and skipped.",
                    idx + 1,
                    generations.len()
                );
                warn!(job_id = %handle.id, index = idx + 1, "censored image skipped");
                reporter.report_warning(&message);
                outcome.warnings.push(message);
                outcome.censored += 1;
                continue;
            }

            reporter.update_status(
                &format!("Downloading image {} of {}...", idx + 1, generations.len()),
                100,
            );
            let (bytes, content_type) = self.image_bytes(&generation.payload)?;
            let image = write_image(out_dir, &handle.id, idx, &bytes, content_type.as_deref())?;
            let image = DownloadedImage {
                seed: generation.seed.clone(),
                model: generation.model.clone(),
                worker_name: generation.worker_name.clone(),
                ..image
            };
            debug!(job_id = %handle.id, path = %image.path.display(), bytes = image.bytes, "image written");
            self.emit(
                JobEvent::ArtifactWritten,
                Some(&handle.id),
                json!({
                    "image_path": image.path.to_string_lossy(),
                    "bytes": image.bytes,
                    "sha256": image.sha256,
                    "seed": image.seed,
                }),
            );
            outcome.images.push(image);
        }
        Ok(())
    }

    /// Submit, wait and download in one call. `reporter.finished()` runs on
    /// every exit path.
    pub fn generate(
        &self,
        request: &GenerationRequest,
        out_dir: &Path,
        reporter: &dyn ProgressReporter,
        cancel: &CancelToken,
    ) -> Result<GenerationOutcome> {
        let _guard = ProgressGuard::new(reporter);
        let result = self.run_generation(request, out_dir, reporter, cancel);
        if let Err(err) = &result {
            warn!(kind = err.kind(), error = %err, "generation failed");
            match err {
                HordeError::Abandoned { .. } => reporter.report_warning(&err.to_string()),
                _ => reporter.report_fatal(&err.to_string(), err.help_url()),
            }
        }
        result
    }

    fn run_generation(
        &self,
        request: &GenerationRequest,
        out_dir: &Path,
        reporter: &dyn ProgressReporter,
        cancel: &CancelToken,
    ) -> Result<GenerationOutcome> {
        reporter.update_status("Submitting job...", 0);
        let prepared = self.prepare(request)?;
        for warning in &prepared.resolved.warnings {
            reporter.report_warning(warning);
        }
        let handle = self.submit_prepared(&prepared, &request.credential)?;
        reporter.job_started(handle.id());
        for warning in handle.warnings() {
            reporter.report_warning(warning);
        }

        let status = self.await_completion(&handle, request.wait_budget(), reporter, cancel)?;
        let fetched = self.fetch_results(&handle, out_dir, reporter)?;

        let mut warnings = Vec::new();
        for warning in prepared
            .resolved
            .warnings
            .iter()
            .chain(handle.warnings())
            .chain(fetched.warnings.iter())
        {
            push_unique_warning(&mut warnings, warning.clone());
        }

        let mut images = fetched.images;
        for image in &mut images {
            let path = metadata_path_for(&image.path);
            let payload =
                build_artifact_metadata(request, &prepared.resolved, &handle.id, image, &warnings);
            write_artifact_metadata(&path, &payload).map_err(HordeError::storage)?;
            image.metadata_path = Some(path);
        }

        info!(job_id = %handle.id, images = images.len(), censored = fetched.censored, "job finished");
        self.emit(
            JobEvent::Finished,
            Some(&handle.id),
            json!({
                "images": images.len(),
                "censored": fetched.censored,
                "kudos": status.kudos,
            }),
        );
        Ok(GenerationOutcome {
            job_id: handle.id.clone(),
            status_url: self.status_url(&handle),
            resolved: prepared.resolved,
            status,
            images,
            warnings,
        })
    }

    pub fn find_user(&self, credential: &Credential) -> Result<UserInfo> {
        let url = self.config.endpoint("find_user");
        let reply = self.transport.get(&url, &self.headers(credential))?;
        if !reply.is_success() {
            return Err(service_rejection(&reply, credential));
        }
        let body = parse_body(&reply, "user lookup")?;
        UserInfo::from_payload(&body).map_err(HordeError::Decode)
    }

    pub(crate) fn headers<'a>(&'a self, credential: &'a Credential) -> [(&'static str, &'a str); 2] {
        [
            ("apikey", credential.header_value()),
            ("Client-Agent", self.config.client_agent.as_str()),
        ]
    }

    fn image_bytes(&self, payload: &ImagePayload) -> Result<(Vec<u8>, Option<String>)> {
        match payload {
            ImagePayload::Remote(url) => {
                let reply = self.transport.get(url, &[])?;
                if !reply.is_success() {
                    return Err(HordeError::Transport {
                        url: url.clone(),
                        message: format!(
                            "image download failed ({}): {}",
                            reply.status,
                            truncate_text(&reply.text(), 200)
                        ),
                    });
                }
                Ok((reply.body, reply.content_type))
            }
            ImagePayload::Inline(data) => {
                let (mime, data) = split_data_url(data);
                let bytes = BASE64
                    .decode(data.as_bytes())
                    .map_err(|err| HordeError::Decode(format!("invalid base64 image: {err}")))?;
                Ok((bytes, mime))
            }
        }
    }

    fn emit(&self, event: JobEvent, job_id: Option<&str>, fields: Value) {
        let Some(events) = &self.events else {
            return;
        };
        if let Err(err) = events.emit(event, job_id, fields) {
            warn!(event = event.as_str(), error = %err, "failed to write event");
        }
    }
}

/// Pause before the next check: half the estimated wait, kept within
/// `[check_wait, max_time_refresh]`.
pub fn poll_interval(status: &JobStatus, config: &HordeConfig) -> Duration {
    let half_wait = Duration::from_secs(status.wait_time_secs) / 2;
    half_wait.clamp(config.check_wait, config.max_time_refresh.max(config.check_wait))
}

fn build_submit_payload(request: &GenerationRequest, resolved: &ResolvedRequest) -> Value {
    let params = &request.params;
    let mut wire_params = json!({
        "cfg_scale": params.cfg_scale,
        "steps": params.steps,
        "width": resolved.width,
        "height": resolved.height,
        "sampler_name": params.sampler_name,
        "n": params.n,
        "karras": params.karras,
    });
    if let Some(seed) = params
        .seed
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
    {
        wire_params["seed"] = json!(seed);
    }
    if request.mode == GenerationMode::ImageToImage {
        let strength = ((1.0 - params.init_strength) * 100.0).round() / 100.0;
        wire_params["denoising_strength"] = json!(strength);
    }

    let mut payload = json!({
        "prompt": request.full_prompt(),
        "params": wire_params,
        "nsfw": request.nsfw,
        "censor_nsfw": request.censor_nsfw,
        "models": [resolved.model],
        "r2": true,
    });
    if let (Some(processing), Some(source)) =
        (request.mode.source_processing(), request.source_image.as_ref())
    {
        payload["source_image"] = json!(source.data);
        payload["source_processing"] = json!(processing);
    }
    payload
}

fn service_rejection(reply: &HttpReply, credential: &Credential) -> HordeError {
    let body = reply.parse_json();
    let mut message = body
        .as_ref()
        .and_then(|value| value.get("message"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| {
            let text = truncate_text(reply.text().trim(), 512);
            if text.is_empty() {
                format!("HTTP {}", reply.status)
            } else {
                text
            }
        });
    if let Some(errors) = body
        .as_ref()
        .and_then(|value| value.get("errors"))
        .and_then(Value::as_object)
    {
        let details: Vec<String> = errors
            .iter()
            .map(|(field, detail)| match detail {
                Value::String(text) => format!("{field}: {text}"),
                other => format!("{field}: {other}"),
            })
            .collect();
        if !details.is_empty() {
            message = format!("{message} ({})", details.join("; "));
        }
    }
    let rc = body
        .as_ref()
        .and_then(|value| value.get("rc"))
        .and_then(Value::as_str)
        .map(str::to_string);

    let help_url = if rc.as_deref() == Some("KudosUpfront") && credential.is_anonymous() {
        message = format!("{message} Register for a free API key at {REGISTER_URL}");
        Some(REGISTER_URL.to_string())
    } else {
        None
    };
    HordeError::ServiceRejected {
        status: reply.status,
        message,
        rc,
        help_url,
    }
}

fn parse_body(reply: &HttpReply, what: &str) -> Result<Value> {
    reply.parse_json().ok_or_else(|| {
        HordeError::Decode(format!(
            "{what} response is not JSON: {}",
            truncate_text(&reply.text(), 200)
        ))
    })
}

fn split_data_url(raw: &str) -> (Option<String>, &str) {
    let trimmed = raw.trim();
    if let Some(rest) = trimmed.strip_prefix("data:") {
        if let Some((header, data)) = rest.split_once(',') {
            let mime = header.split(';').next().map(str::to_string);
            return (mime, data);
        }
    }
    (None, trimmed)
}

fn image_extension(bytes: &[u8], content_type: Option<&str>) -> &'static str {
    if bytes.len() >= 12 && &bytes[..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        return "webp";
    }
    if bytes.starts_with(b"\x89PNG\r\n\x1a\n") {
        return "png";
    }
    if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        return "jpg";
    }
    if let Some(content_type) = content_type {
        let lowered = content_type.to_ascii_lowercase();
        if lowered.contains("png") {
            return "png";
        }
        if lowered.contains("jpeg") || lowered.contains("jpg") {
            return "jpg";
        }
    }
    "webp"
}

fn write_image(
    out_dir: &Path,
    job_id: &str,
    idx: usize,
    bytes: &[u8],
    content_type: Option<&str>,
) -> Result<DownloadedImage> {
    let short: String = job_id
        .chars()
        .filter(|ch| ch.is_ascii_alphanumeric())
        .take(8)
        .collect();
    let prefix = format!("horde-{short}-{:02}-", idx + 1);
    let suffix = format!(".{}", image_extension(bytes, content_type));
    let mut file = tempfile::Builder::new()
        .prefix(&prefix)
        .suffix(&suffix)
        .tempfile_in(out_dir)?;
    file.write_all(bytes)?;
    file.flush()?;
    let (_, path): (fs::File, PathBuf) = file.keep().map_err(|err| HordeError::Io(err.error))?;
    Ok(DownloadedImage {
        path,
        bytes: bytes.len() as u64,
        sha256: hex::encode(Sha256::digest(bytes)),
        seed: None,
        model: None,
        worker_name: None,
        metadata_path: None,
    })
}

fn discard_images(images: &[DownloadedImage]) {
    for image in images {
        if let Err(err) = fs::remove_file(&image.path) {
            warn!(path = %image.path.display(), error = %err, "failed to remove partial download");
        }
    }
}

#[cfg(test)]
mod tests {
    use horde_contracts::request::{SourceImage, ANONYMOUS_API_KEY};

    use super::*;
    use crate::testing::{RecordingReporter, ScriptedTransport, VirtualClock};

    const BASE: &str = "https://horde.test/api/v2";

    fn client(transport: &Arc<ScriptedTransport>, clock: &Arc<VirtualClock>) -> HordeClient {
        let config = HordeConfig::default().with_api_base(BASE);
        HordeClient::with_transport(config, transport.clone(), clock.clone())
    }

    fn accepted(id: &str) -> HttpReply {
        HttpReply::json(202, &json!({"id": id, "kudos": 10.0}))
    }

    fn check(done: bool, wait_time: u64) -> HttpReply {
        HttpReply::json(
            200,
            &json!({
                "done": done,
                "finished": if done { 1 } else { 0 },
                "processing": 0,
                "waiting": if done { 0 } else { 1 },
                "queue_position": if done { 0 } else { 4 },
                "wait_time": wait_time,
                "is_possible": true,
                "faulted": false,
            }),
        )
    }

    #[test]
    fn submit_sends_wire_payload_and_headers() -> anyhow::Result<()> {
        let transport = Arc::new(ScriptedTransport::new());
        transport.on_post(
            "generate/async",
            HttpReply::json(
                202,
                &json!({"id": "job-1", "kudos": 12.0, "warnings": [{"code": "NoAvailableWorker", "message": "slow queue"}]}),
            ),
        );
        let clock = Arc::new(VirtualClock::default());
        let client = client(&transport, &clock);

        let mut request = GenerationRequest::new("a lighthouse");
        request.negative_prompt = Some("fog".to_string());
        request.model = Some("Deliberate".to_string());
        request.params.seed = Some("1234".to_string());
        request.params.width = 500;
        request.params.height = 512;
        let handle = client.submit(&request)?;
        assert_eq!(handle.id(), "job-1");
        assert_eq!(handle.kudos(), Some(12.0));
        assert_eq!(handle.warnings(), ["slow queue".to_string()]);

        let calls = transport.calls();
        assert_eq!(calls.len(), 1);
        let call = &calls[0];
        assert_eq!(call.url, format!("{BASE}/generate/async"));
        assert_eq!(call.header("apikey"), Some(ANONYMOUS_API_KEY));
        assert!(call
            .header("Client-Agent")
            .is_some_and(|agent| agent.starts_with("horde-rs:")));
        let body = call.body.clone().unwrap_or_default();
        assert_eq!(body["prompt"], "a lighthouse ### fog");
        assert_eq!(body["models"], json!(["Deliberate"]));
        assert_eq!(body["r2"], true);
        assert_eq!(body["params"]["width"], 448);
        assert_eq!(body["params"]["height"], 512);
        assert_eq!(body["params"]["seed"], "1234");
        assert_eq!(body["params"]["sampler_name"], "k_euler");
        assert!(body.get("source_image").is_none());
        assert!(body["params"].get("denoising_strength").is_none());
        Ok(())
    }

    #[test]
    fn img2img_payload_carries_source_and_denoising() -> anyhow::Result<()> {
        let transport = Arc::new(ScriptedTransport::new());
        let clock = Arc::new(VirtualClock::default());
        let client = client(&transport, &clock);
        let mut request = GenerationRequest::new("a lighthouse");
        request.mode = GenerationMode::ImageToImage;
        request.params.init_strength = 0.3;
        request.source_image = Some(SourceImage {
            data: "aGVsbG8=".to_string(),
            width: 512,
            height: 512,
            has_alpha: false,
        });
        let prepared = client.prepare(&request)?;
        assert_eq!(prepared.payload["source_image"], "aGVsbG8=");
        assert_eq!(prepared.payload["source_processing"], "img2img");
        assert_eq!(prepared.payload["params"]["denoising_strength"], 0.7);
        assert_eq!(prepared.resolved.model, "stable_diffusion");
        assert!(transport.calls().is_empty());
        Ok(())
    }

    #[test]
    fn kudos_upfront_for_anonymous_points_at_registration() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.on_post(
            "generate/async",
            HttpReply::json(400, &json!({"message": "m", "rc": "KudosUpfront"})),
        );
        let clock = Arc::new(VirtualClock::default());
        let client = client(&transport, &clock);
        match client.submit(&GenerationRequest::new("a cat")) {
            Err(HordeError::ServiceRejected {
                status,
                message,
                rc,
                help_url,
            }) => {
                assert_eq!(status, 400);
                assert!(message.starts_with('m'));
                assert!(message.contains(REGISTER_URL));
                assert_eq!(rc.as_deref(), Some("KudosUpfront"));
                assert_eq!(help_url.as_deref(), Some(REGISTER_URL));
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[test]
    fn kudos_upfront_with_key_has_no_registration_link() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.on_post(
            "generate/async",
            HttpReply::json(403, &json!({"message": "Not enough kudos", "rc": "KudosUpfront"})),
        );
        let clock = Arc::new(VirtualClock::default());
        let client = client(&transport, &clock);
        let mut request = GenerationRequest::new("a cat");
        request.credential = Credential::ApiKey("key-1".to_string());
        let err = client.submit(&request).err();
        assert!(matches!(
            err,
            Some(HordeError::ServiceRejected { help_url: None, status: 403, .. })
        ));
        assert_eq!(transport.calls()[0].header("apikey"), Some("key-1"));
    }

    #[test]
    fn validation_errors_never_touch_the_network() {
        let transport = Arc::new(ScriptedTransport::new());
        let clock = Arc::new(VirtualClock::default());
        let client = client(&transport, &clock);
        let err = client.submit(&GenerationRequest::new("  ")).err();
        assert!(matches!(err, Some(HordeError::InvalidRequest(_))));
        assert!(transport.calls().is_empty());
    }

    #[test]
    fn status_is_fetched_once_after_third_check() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let transport = Arc::new(ScriptedTransport::new());
        transport
            .on_post("generate/async", accepted("job-3"))
            .on_get("generate/check/job-3", check(false, 20))
            .on_get("generate/check/job-3", check(false, 4))
            .on_get("generate/check/job-3", check(true, 0))
            .on_get(
                "generate/status/job-3",
                HttpReply::json(
                    200,
                    &json!({"generations": [{"img": "aGVsbG8=", "seed": "99", "model": "stable_diffusion", "worker_name": "w"}]}),
                ),
            );
        let clock = Arc::new(VirtualClock::default());
        let events_path = temp.path().join("log").join("events.jsonl");
        let client =
            client(&transport, &clock).with_events(EventWriter::new(&events_path, "s-1"));
        let reporter = RecordingReporter::default();

        let outcome = client.generate(
            &GenerationRequest::new("a fox"),
            temp.path(),
            &reporter,
            &CancelToken::new(),
        )?;

        assert_eq!(transport.count("GET", "generate/check/"), 3);
        assert_eq!(transport.count("GET", "generate/status/"), 1);
        let calls = transport.calls();
        let status_idx = calls
            .iter()
            .position(|call| call.url.contains("generate/status/"))
            .unwrap_or_default();
        assert_eq!(
            calls
                .iter()
                .take(status_idx)
                .filter(|call| call.url.contains("generate/check/"))
                .count(),
            3
        );

        // 10s after the first check, then the 5s floor.
        assert_eq!(clock.elapsed(), Duration::from_secs(15));
        let sleeps = clock.sleeps();
        assert_eq!(sleeps.len(), 30);
        assert!(sleeps.iter().all(|sleep| *sleep <= Duration::from_millis(500)));
        assert_eq!(outcome.job_id, "job-3");
        assert_eq!(outcome.status_url, format!("{BASE}/generate/status/job-3"));
        assert_eq!(outcome.images.len(), 1);
        let image = &outcome.images[0];
        assert_eq!(fs::read(&image.path)?, b"hello");
        assert_eq!(image.sha256, hex::encode(Sha256::digest(b"hello")));
        assert_eq!(image.seed.as_deref(), Some("99"));
        let metadata_path = image.metadata_path.clone().unwrap_or_default();
        let metadata: Value = serde_json::from_str(&fs::read_to_string(metadata_path)?)?;
        assert_eq!(metadata["job_id"], "job-3");
        assert_eq!(metadata["result"]["sha256"], image.sha256.as_str());

        assert_eq!(reporter.finished_count(), 1);
        assert!(reporter.fatals().is_empty());
        assert_eq!(reporter.job_ids(), vec!["job-3".to_string()]);
        let logged: Vec<Value> = fs::read_to_string(&events_path)?
            .lines()
            .map(serde_json::from_str)
            .collect::<std::result::Result<_, _>>()?;
        let kinds: Vec<&str> = logged
            .iter()
            .filter_map(|line| line["type"].as_str())
            .collect();
        assert_eq!(kinds, ["job_submitted", "artifact_written", "job_finished"]);
        assert!(logged.iter().all(|line| line["job_id"] == "job-3"));
        let statuses = reporter.statuses();
        assert!(statuses.iter().any(|(text, _)| text == "Done"));
        assert!(statuses.iter().all(|(_, percent)| *percent <= 100));
        Ok(())
    }

    #[test]
    fn await_times_out_within_one_interval_of_budget() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.on_get("generate/check/job-4", check(false, 1000));
        let clock = Arc::new(VirtualClock::default());
        let client = client(&transport, &clock);
        let handle = client
            .resume("job-4", Credential::Anonymous)
            .unwrap_or_else(|err| panic!("{err}"));
        let budget = Duration::from_secs(60);

        let result = client.await_completion(
            &handle,
            budget,
            &RecordingReporter::default(),
            &CancelToken::new(),
        );
        match result {
            Err(HordeError::Timeout {
                budget: reported,
                status,
                status_url,
            }) => {
                assert_eq!(reported, budget);
                assert_eq!(status.wait_time_secs, 1000);
                assert_eq!(status_url, format!("{BASE}/generate/status/job-4"));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
        assert!(clock.elapsed() >= budget);
        assert!(clock.elapsed() <= budget + client.config().max_time_refresh);
        assert_eq!(transport.count("GET", "generate/check/"), 5);
    }

    #[test]
    fn impossible_job_reports_no_worker() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.on_get(
            "generate/check/job-5",
            HttpReply::json(200, &json!({"done": false, "is_possible": false, "wait_time": 0})),
        );
        let clock = Arc::new(VirtualClock::default());
        let client = client(&transport, &clock);
        let handle = client
            .resume("job-5", Credential::Anonymous)
            .unwrap_or_else(|err| panic!("{err}"));
        let result = client.await_completion(
            &handle,
            Duration::from_secs(600),
            &RecordingReporter::default(),
            &CancelToken::new(),
        );
        assert!(matches!(result, Err(HordeError::NoWorkerAvailable { .. })));
        assert_eq!(clock.elapsed(), Duration::ZERO);
    }

    #[test]
    fn faulted_job_is_a_rejection() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.on_get(
            "generate/check/job-6",
            HttpReply::json(200, &json!({"done": false, "faulted": true})),
        );
        let clock = Arc::new(VirtualClock::default());
        let client = client(&transport, &clock);
        let handle = client
            .resume("job-6", Credential::Anonymous)
            .unwrap_or_else(|err| panic!("{err}"));
        let result = client.await_completion(
            &handle,
            Duration::from_secs(600),
            &RecordingReporter::default(),
            &CancelToken::new(),
        );
        assert!(matches!(
            result,
            Err(HordeError::ServiceRejected { ref rc, .. }) if rc.as_deref() == Some("JobFaulted")
        ));
    }

    #[test]
    fn poll_interval_stays_within_bounds() {
        let config = HordeConfig::default();
        for wait_time in [0, 1, 5, 9, 10, 11, 20, 29, 30, 31, 60, 3600, u64::from(u32::MAX)] {
            let status = JobStatus {
                wait_time_secs: wait_time,
                ..JobStatus::default()
            };
            let interval = poll_interval(&status, &config);
            assert!(interval >= config.check_wait, "{wait_time}: {interval:?}");
            assert!(interval <= config.max_time_refresh, "{wait_time}: {interval:?}");
        }
        let status = JobStatus {
            wait_time_secs: 20,
            ..JobStatus::default()
        };
        assert_eq!(poll_interval(&status, &config), Duration::from_secs(10));
    }

    #[test]
    fn failed_download_removes_images_already_written() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let transport = Arc::new(ScriptedTransport::new());
        transport.on_get(
            "generate/status/job-6",
            HttpReply::json(
                200,
                &json!({"generations": [{"img": "aGVsbG8="}, {"img": "%%not-base64%%"}]}),
            ),
        );
        let clock = Arc::new(VirtualClock::default());
        let client = client(&transport, &clock);
        let handle = client.resume("job-6", Credential::Anonymous)?;

        let result = client.fetch_results(&handle, temp.path(), &RecordingReporter::default());
        assert!(matches!(result, Err(HordeError::Decode(_))), "{result:?}");
        assert_eq!(fs::read_dir(temp.path())?.count(), 0);
        Ok(())
    }

    #[test]
    fn censored_images_are_skipped_with_one_warning_each() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let transport = Arc::new(ScriptedTransport::new());
        transport
            .on_get(
                "generate/status/job-7",
                HttpReply::json(
                    200,
                    &json!({"generations": [
                        {"img": "https://r2.test/one.webp", "seed": "1"},
                        {"img": "aGVsbG8=", "censored": true},
                        {"img": "d29ybGQ=", "seed": "3"},
                        {"img": "https://r2.test/four.webp", "censored": true},
                    ]}),
                ),
            )
            .on_get(
                "r2.test/one.webp",
                HttpReply::bytes(200, b"RIFF\0\0\0\0WEBPVP8 ".to_vec(), Some("image/webp")),
            );
        let clock = Arc::new(VirtualClock::default());
        let client = client(&transport, &clock);
        let handle = client.resume("job-7", Credential::Anonymous)?;
        let reporter = RecordingReporter::default();

        let outcome = client.fetch_results(&handle, temp.path(), &reporter)?;
        assert_eq!(outcome.images.len(), 2);
        assert_eq!(outcome.censored, 2);
        assert_eq!(outcome.warnings.len(), 2);
        assert_eq!(reporter.warnings(), outcome.warnings);
        assert_eq!(transport.count("GET", "r2.test/four.webp"), 0);

        let first = &outcome.images[0];
        assert_eq!(
            first.path.extension().and_then(|ext| ext.to_str()),
            Some("webp")
        );
        assert_eq!(first.seed.as_deref(), Some("1"));
        assert!(first.path.starts_with(temp.path()));
        assert_eq!(fs::read(&outcome.images[1].path)?, b"world");
        assert_ne!(first.path, outcome.images[1].path);
        Ok(())
    }

    #[test]
    fn transport_failure_reports_fatal_and_finishes() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let transport = Arc::new(ScriptedTransport::new());
        transport
            .on_post("generate/async", accepted("job-8"))
            .fail_get("generate/check/job-8", "connection reset");
        let clock = Arc::new(VirtualClock::default());
        let client = client(&transport, &clock);
        let reporter = RecordingReporter::default();

        let result = client.generate(
            &GenerationRequest::new("a fox"),
            temp.path(),
            &reporter,
            &CancelToken::new(),
        );
        assert!(matches!(result, Err(HordeError::Transport { .. })));
        assert_eq!(reporter.fatals().len(), 1);
        assert_eq!(reporter.finished_count(), 1);
        Ok(())
    }

    #[test]
    fn find_user_reads_kudos() -> anyhow::Result<()> {
        let transport = Arc::new(ScriptedTransport::new());
        transport.on_get(
            "find_user",
            HttpReply::json(200, &json!({"username": "painter#42", "kudos": 1500.0, "id": 42})),
        );
        let clock = Arc::new(VirtualClock::default());
        let client = client(&transport, &clock);
        let user = client.find_user(&Credential::ApiKey("key".to_string()))?;
        assert_eq!(user.username, "painter#42");
        assert_eq!(user.kudos, 1500.0);
        assert_eq!(user.id, Some(42));
        Ok(())
    }

    #[test]
    fn resume_rejects_unsafe_ids() {
        let transport = Arc::new(ScriptedTransport::new());
        let clock = Arc::new(VirtualClock::default());
        let client = client(&transport, &clock);
        assert!(client.resume("../etc", Credential::Anonymous).is_err());
        assert!(client.resume("", Credential::Anonymous).is_err());
        assert!(client.resume("a1b2-c3", Credential::Anonymous).is_ok());
    }

    #[test]
    fn into_status_url_points_at_status_endpoint() -> Result<()> {
        let transport = Arc::new(ScriptedTransport::new());
        let clock = Arc::new(VirtualClock::default());
        let client = client(&transport, &clock);
        let handle = client.resume("job-9", Credential::Anonymous)?;
        let url = client.into_status_url(handle);
        assert!(url.ends_with("generate/status/job-9"), "{url}");
        assert!(transport.calls().is_empty());
        Ok(())
    }
}
