use std::io::{self, Cursor, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use clap::{Parser, Subcommand};
use horde_contracts::events::EventWriter;
use horde_contracts::request::{
    Credential, GenerationMode, GenerationParams, GenerationRequest, SourceImage,
};
use horde_contracts::settings::SettingsStore;
use horde_engine::catalog::DEFAULT_MAX_AGE_DAYS;
use horde_engine::{
    spawn_generation, EventReporter, FetchOutcome, HordeClient, HordeConfig, JobHandle,
    ModelCatalogCache, MultiReporter, ProgressGuard, ProgressReporter,
};
use image::ImageFormat;
use serde_json::{json, Value};
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "horde-rs", version, about = "Stable Horde image generation client")]
struct Cli {
    /// Settings file (defaults to the user config directory).
    #[arg(long, global = true)]
    settings: Option<PathBuf>,
    /// Append job events to this JSONL file.
    #[arg(long, global = true)]
    events: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Generate(GenerateArgs),
    Check(CheckArgs),
    Fetch(FetchArgs),
    Models(ModelsArgs),
    User(UserArgs),
    Configure(ConfigureArgs),
}

#[derive(Debug, Parser)]
struct GenerateArgs {
    #[arg(long)]
    prompt: String,
    #[arg(long)]
    negative: Option<String>,
    #[arg(long, default_value = "text2img")]
    mode: String,
    #[arg(long)]
    model: Option<String>,
    /// Source image for img2img and inpainting (transparent pixels are repainted).
    #[arg(long)]
    image: Option<PathBuf>,
    #[arg(long, default_value_t = 8.0)]
    cfg_scale: f64,
    #[arg(long, default_value_t = 25)]
    steps: u32,
    #[arg(long)]
    width: Option<u32>,
    #[arg(long)]
    height: Option<u32>,
    #[arg(long)]
    seed: Option<String>,
    #[arg(long, default_value_t = 1)]
    n: u32,
    #[arg(long, default_value_t = 0.3)]
    init_strength: f64,
    #[arg(long, default_value = "k_euler")]
    sampler: String,
    #[arg(long)]
    karras: bool,
    #[arg(long)]
    nsfw: bool,
    #[arg(long)]
    censor_nsfw: bool,
    #[arg(long)]
    api_key: Option<String>,
    /// Minutes to wait before giving up on the job.
    #[arg(long)]
    max_wait: Option<u32>,
    /// Seconds after which the job is abandoned; it keeps running remotely.
    #[arg(long)]
    detach_after: Option<f64>,
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    no_refresh: bool,
    /// Print the submission payload instead of submitting it.
    #[arg(long)]
    dry_run: bool,
}

#[derive(Debug, Parser)]
struct CheckArgs {
    #[arg(long)]
    id: String,
    #[arg(long)]
    api_key: Option<String>,
}

#[derive(Debug, Parser)]
struct FetchArgs {
    #[arg(long)]
    id: String,
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    api_key: Option<String>,
}

#[derive(Debug, Parser)]
struct ModelsArgs {
    #[arg(long, default_value = "text2img")]
    mode: String,
    /// Refresh from usage statistics even if the cached list is recent.
    #[arg(long)]
    refresh: bool,
}

#[derive(Debug, Parser)]
struct UserArgs {
    #[arg(long)]
    api_key: Option<String>,
}

#[derive(Debug, Parser)]
struct ConfigureArgs {
    #[arg(long)]
    api_key: Option<String>,
    #[arg(long)]
    clear_api_key: bool,
    #[arg(long)]
    max_wait: Option<u32>,
}

const DEFAULT_SIZE: u32 = 512;
const DEFAULT_MAX_WAIT_MINUTES: u32 = 10;
const DETACH_POLL: Duration = Duration::from_millis(200);

fn main() {
    init_tracing();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("horde-rs error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("HORDE_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .try_init();
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let settings = SettingsStore::new(settings_path(cli.settings.clone())?);
    let events = cli.events.clone().map(EventWriter::new_session);
    match cli.command {
        Command::Generate(args) => run_generate(args, settings, events),
        Command::Check(args) => run_check(args, settings),
        Command::Fetch(args) => run_fetch(args, settings, events),
        Command::Models(args) => run_models(args, settings, events),
        Command::User(args) => run_user(args, settings),
        Command::Configure(args) => run_configure(args, settings),
    }
}

fn run_generate(
    args: GenerateArgs,
    mut settings: SettingsStore,
    events: Option<EventWriter>,
) -> Result<i32> {
    let credential = resolve_credential(args.api_key.as_deref(), &mut settings);
    let max_wait = args
        .max_wait
        .or_else(|| settings.max_wait_minutes())
        .unwrap_or(DEFAULT_MAX_WAIT_MINUTES);
    let source = match &args.image {
        Some(path) => Some(load_source_image(path)?),
        None => None,
    };
    let mut request = build_request(&args, source, credential, max_wait)?;

    let client = HordeClient::new(HordeConfig::from_env())?;
    let mut cache = ModelCatalogCache::new(&client, settings);
    if let Some(events) = &events {
        cache = cache.with_events(events.clone());
    }
    if !args.no_refresh && !args.dry_run {
        let today = chrono::Local::now().date_naive();
        match cache.refresh_if_stale(DEFAULT_MAX_AGE_DAYS, today) {
            Ok(outcome) if !outcome.new_models.is_empty() => {
                eprintln!("New models available: {}", outcome.new_models.join(", "));
            }
            Ok(_) => {}
            Err(err) => eprintln!("warning: model list refresh failed: {err}"),
        }
    }
    for note in cache.normalize(&mut request) {
        eprintln!("note: {note}");
    }
    let (catalog, _) = cache.into_parts();
    let mut client = client.with_catalog(catalog);

    if args.dry_run {
        let prepared = client.prepare(&request)?;
        let preview = json!({
            "resolved": prepared.resolved,
            "payload": redact_source(prepared.payload),
        });
        println!("{}", serde_json::to_string_pretty(&preview)?);
        return Ok(0);
    }

    let mut reporter = MultiReporter::new().with(Arc::new(ConsoleReporter::default()));
    if let Some(events) = events {
        reporter = reporter.with(Arc::new(EventReporter::new(events.clone())));
        client = client.with_events(events);
    }

    let job = spawn_generation(
        Arc::new(client),
        request,
        args.out.clone(),
        Arc::new(reporter),
    )?;
    if let Some(seconds) = args.detach_after.filter(|value| value.is_finite() && *value > 0.0) {
        let deadline = Instant::now() + Duration::from_secs_f64(seconds);
        while !job.is_finished() {
            if Instant::now() >= deadline {
                debug!("detaching from job");
                job.cancel();
                break;
            }
            thread::sleep(DETACH_POLL);
        }
    }

    match job.join() {
        Ok(outcome) => {
            for image in &outcome.images {
                println!("{}", image.path.display());
            }
            if outcome.images.is_empty() {
                eprintln!("No images were returned for job {}.", outcome.job_id);
                return Ok(2);
            }
            Ok(0)
        }
        Err(err) => {
            if let Some(url) = err.status_url() {
                eprintln!("Results may still be retrieved from {url}");
            }
            Err(err.into())
        }
    }
}

fn run_check(args: CheckArgs, mut settings: SettingsStore) -> Result<i32> {
    let credential = resolve_credential(args.api_key.as_deref(), &mut settings);
    let client = HordeClient::new(HordeConfig::from_env())?;
    let handle = client.resume(&args.id, credential)?;
    let status = client.poll(&handle)?;
    println!("{}", status.describe());
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(if status.finished { 0 } else { 3 })
}

fn run_fetch(
    args: FetchArgs,
    mut settings: SettingsStore,
    events: Option<EventWriter>,
) -> Result<i32> {
    let credential = resolve_credential(args.api_key.as_deref(), &mut settings);
    let mut client = HordeClient::new(HordeConfig::from_env())?;
    if let Some(events) = events {
        client = client.with_events(events);
    }
    let handle = client.resume(&args.id, credential)?;
    let reporter = ConsoleReporter::default();
    let Some(outcome) = fetch_finished_job(&client, &handle, &args.out, &reporter)? else {
        return Ok(3);
    };
    for image in &outcome.images {
        println!("{}", image.path.display());
    }
    Ok(if outcome.images.is_empty() { 2 } else { 0 })
}

/// Downloads a finished job's images; `None` while it is still running.
fn fetch_finished_job(
    client: &HordeClient,
    handle: &JobHandle,
    out_dir: &Path,
    reporter: &dyn ProgressReporter,
) -> Result<Option<FetchOutcome>> {
    let _guard = ProgressGuard::new(reporter);
    let status = client.poll(handle)?;
    if !status.finished {
        eprintln!("Job {} is not finished yet: {}", handle.id(), status.describe());
        return Ok(None);
    }
    Ok(Some(client.fetch_results(handle, out_dir, reporter)?))
}

fn run_models(
    args: ModelsArgs,
    settings: SettingsStore,
    events: Option<EventWriter>,
) -> Result<i32> {
    let mode = parse_mode(&args.mode)?;
    let client = HordeClient::new(HordeConfig::from_env())?;
    let mut cache = ModelCatalogCache::new(&client, settings);
    if let Some(events) = events {
        cache = cache.with_events(events);
    }
    let today = chrono::Local::now().date_naive();
    let outcome = if args.refresh {
        cache.refresh(today)?
    } else {
        cache.refresh_if_stale(DEFAULT_MAX_AGE_DAYS, today)?
    };
    for entry in cache.catalog().by_mode(mode) {
        let marker = if outcome.new_models.contains(&entry.name) {
            " (new)"
        } else {
            ""
        };
        println!("{}\t{}{marker}", entry.name, entry.popularity);
    }
    Ok(0)
}

fn run_user(args: UserArgs, mut settings: SettingsStore) -> Result<i32> {
    let credential = resolve_credential(args.api_key.as_deref(), &mut settings);
    if credential.is_anonymous() {
        eprintln!("No API key configured; showing the anonymous account.");
    }
    let client = HordeClient::new(HordeConfig::from_env())?;
    let user = client.find_user(&credential)?;
    println!("{} (kudos: {:.0})", user.username, user.kudos);
    Ok(0)
}

fn run_configure(args: ConfigureArgs, mut settings: SettingsStore) -> Result<i32> {
    if args.clear_api_key {
        settings.set_api_key(None)?;
    } else if let Some(key) = args.api_key.as_deref() {
        settings.set_api_key(Some(key))?;
    }
    if let Some(minutes) = args.max_wait {
        settings.set_max_wait_minutes(minutes)?;
    }
    let key_state = if settings.credential().is_anonymous() {
        "anonymous"
    } else {
        "set"
    };
    println!("settings: {}", settings.path().display());
    println!("api key: {key_state}");
    println!(
        "max wait: {} min",
        settings
            .max_wait_minutes()
            .unwrap_or(DEFAULT_MAX_WAIT_MINUTES)
    );
    Ok(0)
}

fn settings_path(explicit: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path);
    }
    dirs::config_dir()
        .map(|dir| dir.join("horde-rs").join("settings.json"))
        .context("could not determine a config directory; pass --settings")
}

/// Flag wins over the stored key; neither means anonymous.
fn resolve_credential(flag: Option<&str>, settings: &mut SettingsStore) -> Credential {
    match Credential::from_optional(flag) {
        Credential::Anonymous => settings.credential(),
        key => key,
    }
}

fn parse_mode(raw: &str) -> Result<GenerationMode> {
    GenerationMode::parse(raw)
        .ok_or_else(|| anyhow!("unknown mode '{raw}' (expected text2img, img2img or inpainting)"))
}

fn build_request(
    args: &GenerateArgs,
    source: Option<SourceImage>,
    credential: Credential,
    max_wait_minutes: u32,
) -> Result<GenerationRequest> {
    let mode = parse_mode(&args.mode)?;
    let (default_width, default_height) = source
        .as_ref()
        .map(|image| (image.width, image.height))
        .unwrap_or((DEFAULT_SIZE, DEFAULT_SIZE));
    let mut request = GenerationRequest::new(args.prompt.clone());
    request.negative_prompt = args.negative.clone();
    request.mode = mode;
    request.model = args.model.clone();
    request.params = GenerationParams {
        cfg_scale: args.cfg_scale,
        steps: args.steps,
        width: args.width.unwrap_or(default_width),
        height: args.height.unwrap_or(default_height),
        sampler_name: args.sampler.trim().to_string(),
        init_strength: args.init_strength,
        seed: args.seed.clone(),
        n: args.n,
        karras: args.karras,
    };
    request.source_image = if mode.needs_source() { source } else { None };
    request.nsfw = args.nsfw;
    request.censor_nsfw = args.censor_nsfw;
    request.credential = credential;
    request.max_wait_minutes = max_wait_minutes;
    Ok(request)
}

/// Reads an image, re-encodes it as PNG and records whether it carries alpha.
fn load_source_image(path: &Path) -> Result<SourceImage> {
    let image =
        image::open(path).with_context(|| format!("failed to open image {}", path.display()))?;
    let has_alpha = image.color().has_alpha();
    let mut encoded = Cursor::new(Vec::new());
    image
        .write_to(&mut encoded, ImageFormat::Png)
        .with_context(|| format!("failed to encode {}", path.display()))?;
    Ok(SourceImage {
        data: BASE64.encode(encoded.into_inner()),
        width: image.width(),
        height: image.height(),
        has_alpha,
    })
}

fn redact_source(mut payload: Value) -> Value {
    if let Some(source) = payload.get_mut("source_image") {
        let len = source.as_str().map(str::len).unwrap_or(0);
        *source = Value::String(format!("<omitted {len} base64 chars>"));
    }
    payload
}

/// Single updating status line on stderr.
#[derive(Debug, Default)]
struct ConsoleReporter {
    line_width: Mutex<usize>,
}

impl ConsoleReporter {
    fn clear_line(&self, stderr: &mut impl Write) {
        if let Ok(mut width) = self.line_width.lock() {
            if *width > 0 {
                let _ = write!(stderr, "\r{}\r", " ".repeat(*width));
                *width = 0;
            }
        }
    }
}

impl ProgressReporter for ConsoleReporter {
    fn update_status(&self, text: &str, percent: u8) {
        let line = format_status_line(text, percent);
        let mut stderr = io::stderr().lock();
        self.clear_line(&mut stderr);
        let _ = write!(stderr, "{line}");
        let _ = stderr.flush();
        if let Ok(mut width) = self.line_width.lock() {
            *width = line.chars().count();
        }
    }

    fn report_warning(&self, text: &str) {
        let mut stderr = io::stderr().lock();
        self.clear_line(&mut stderr);
        let _ = writeln!(stderr, "warning: {text}");
    }

    fn report_fatal(&self, text: &str, help_url: Option<&str>) {
        let mut stderr = io::stderr().lock();
        self.clear_line(&mut stderr);
        let _ = writeln!(stderr, "error: {text}");
        if let Some(url) = help_url {
            let _ = writeln!(stderr, "see: {url}");
        }
    }

    fn finished(&self) {
        let mut stderr = io::stderr().lock();
        if let Ok(width) = self.line_width.lock() {
            if *width > 0 {
                let _ = writeln!(stderr);
            }
        }
    }
}

fn format_status_line(text: &str, percent: u8) -> String {
    format!("[{:>3}%] {text}", percent.min(100))
}
