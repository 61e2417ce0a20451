//! Input Sentinel CLI
//!
//! Scripted-activity detector with resilient evidence upload.

use anyhow::Context;
use clap::{Parser, Subcommand};
use input_sentinel::{
    capture::capture_from_settings,
    collector::{check_permission, Collector, CollectorConfig},
    remote::{EnvCredentials, HttpObjectStore, RemoteConfig, BUCKET_ENV, ENDPOINT_ENV},
    transparency::{create_shared_log_with_persistence, TransparencyLog},
    Agent, AgentError, AgentParts, Clock, FileSettingsProvider, LocalStore, Settings,
    SettingsOverrides, SettingsProvider,
    MONITORING_NOTICE, VERSION,
};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

const TRANSPARENCY_FILE: &str = "transparency.json";

#[derive(Parser)]
#[command(name = "input-sentinel")]
#[command(version = VERSION)]
#[command(about = "Detects scripted input and ships evidence to object storage", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start monitoring and uploading
    Start {
        /// Number of upload workers (overrides the settings file)
        #[arg(long)]
        workers: Option<usize>,

        /// Log level or filter directive, e.g. `debug` or `input_sentinel=trace`
        #[arg(long)]
        log_level: Option<String>,
    },

    /// Pause capture and classification
    Pause,

    /// Resume capture and classification
    Resume,

    /// Show current status and cumulative statistics
    Status,

    /// Display the monitoring notice
    Notice,

    /// Show configuration
    Config {
        /// Print only this setting
        key: Option<String>,
    },

    /// List artifacts staged locally and not yet confirmed uploaded
    Pending,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start { workers, log_level } => cmd_start(workers, log_level),
        Commands::Pause => cmd_set_paused(true),
        Commands::Resume => cmd_set_paused(false),
        Commands::Status => cmd_status(),
        Commands::Notice => {
            println!("{MONITORING_NOTICE}");
            Ok(())
        }
        Commands::Config { key } => cmd_config(key.as_deref()),
        Commands::Pending => cmd_pending(),
    }
}

fn init_logging(log_level: Option<&str>) {
    let filter = match log_level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn cmd_start(workers: Option<usize>, log_level: Option<String>) -> anyhow::Result<()> {
    init_logging(log_level.as_deref());

    println!("Input Sentinel v{VERSION}");
    println!("{MONITORING_NOTICE}");

    if !check_permission() {
        eprintln!("Error: Input Monitoring permission not granted.");
        eprintln!();
        eprintln!("To grant permission:");
        eprintln!("1. Open System Settings > Privacy & Security");
        eprintln!("2. Select 'Input Monitoring'");
        eprintln!("3. Add this application to the allowed list");
        eprintln!("4. Restart the application");
        std::process::exit(1);
    }

    let (file, mut settings) = load_settings()?;
    let overrides = SettingsOverrides { workers };
    overrides.apply(&mut settings);
    let provider = overrides.wrap(file);

    let remote_config = RemoteConfig::from_env()
        .ok_or_else(|| AgentError::RemoteUnconfigured(format!("{ENDPOINT_ENV} and {BUCKET_ENV}")))?;
    let remote = HttpObjectStore::new(remote_config.clone(), Arc::new(EnvCredentials))?;

    println!("Starting...");
    println!("  Remote store: {}", remote_config.bucket_url());
    println!("  Screenshot interval: {}s", settings.screenshot_interval.as_secs());
    println!("  Upload workers: {}", settings.workers);
    println!("  Staging: {:?}", settings.staging_path);
    if settings.paused {
        println!("  Collection is paused. Run `input-sentinel resume` to start.");
    }
    println!();
    println!("Press Ctrl+C to stop");
    println!();

    let clock = Arc::new(Clock::system());
    let mut collector = Collector::new(CollectorConfig::default(), clock.clone());
    collector.start().context("starting input collector")?;
    let events = collector.receiver().clone();

    let transparency =
        create_shared_log_with_persistence(settings.data_path.join(TRANSPARENCY_FILE));
    let capture = capture_from_settings(&settings);

    let agent = Agent::new(AgentParts {
        settings,
        provider: Arc::new(provider),
        clock,
        remote: Arc::new(remote),
        capture,
        transparency: transparency.clone(),
    })?;

    let trigger = agent.shutdown_trigger();
    ctrlc::set_handler(move || trigger.trigger()).context("installing Ctrl+C handler")?;

    let runtime = tokio::runtime::Runtime::new().context("creating async runtime")?;
    let summary = runtime.block_on(agent.run(events))?;

    println!();
    println!("Stopping...");
    collector.stop();

    println!(
        "Uploaded {} artifact(s), {} failed, {} left staged for next start.",
        summary.queue.uploaded, summary.queue.failed, summary.left_pending
    );
    println!();
    println!("{}", transparency.summary());
    Ok(())
}

fn load_settings() -> anyhow::Result<(FileSettingsProvider, Settings)> {
    let provider = FileSettingsProvider::default_location();
    let settings = provider
        .load_or_init()
        .with_context(|| format!("loading settings from {:?}", provider.path()))?;
    Ok((provider, settings))
}

fn cmd_set_paused(paused: bool) -> anyhow::Result<()> {
    let (provider, mut settings) = load_settings()?;
    settings.paused = paused;
    settings
        .save_to(provider.path())
        .context("saving settings")?;

    if paused {
        println!("Collection paused. Use 'input-sentinel resume' to continue.");
        println!("Artifacts already staged will still be uploaded.");
    } else {
        println!("Collection resumed.");
    }
    Ok(())
}

fn cmd_status() -> anyhow::Result<()> {
    let (_, settings) = load_settings()?;

    println!("Input Sentinel Status");
    println!("=====================");
    println!();

    println!(
        "Input Monitoring Permission: {}",
        if check_permission() {
            "Granted ✓"
        } else {
            "Not Granted ✗"
        }
    );
    println!(
        "Remote store: {}",
        RemoteConfig::from_env()
            .map(|c| c.bucket_url())
            .unwrap_or_else(|| format!("not configured (set {ENDPOINT_ENV}, {BUCKET_ENV})"))
    );
    println!();

    println!("Configuration:");
    println!("  Screenshots: {}", enabled(settings.capture_screenshots));
    println!("  Blur: {}", enabled(settings.blur_screenshots));
    println!("  Screenshot interval: {}s", settings.screenshot_interval.as_secs());
    println!("  Pointer speed threshold: {} px/s", settings.pointer_speed_threshold);
    println!("  Key timing spread threshold: {}s", settings.key_dispersion_threshold);
    println!("  Paused: {}", settings.paused);
    println!();

    match LocalStore::open(&settings.staging_path).and_then(|s| s.pending()) {
        Ok(pending) => println!("Staged artifacts awaiting upload: {}", pending.len()),
        Err(e) => println!("Staging directory unreadable: {e}"),
    }
    println!();

    let stats_path = settings.data_path.join(TRANSPARENCY_FILE);
    match TransparencyLog::read_persisted(&stats_path) {
        Ok(stats) => {
            println!("Cumulative Statistics:");
            println!("  Pointer events: {}", stats.pointer_events);
            println!("  Key presses: {}", stats.key_presses);
            println!("  Suspicious verdicts: {}", stats.suspicious_verdicts);
            println!("  Screenshots captured: {}", stats.screenshots_captured);
            println!("  Artifacts uploaded: {}", stats.artifacts_uploaded);
            println!("  Artifacts failed: {}", stats.artifacts_failed);
            println!("  Last updated: {}", stats.last_updated);
        }
        Err(_) => println!("No previous session data found."),
    }
    Ok(())
}

fn cmd_config(key: Option<&str>) -> anyhow::Result<()> {
    if let Some(key) = key {
        let (provider, _) = load_settings()?;
        match provider.get(key)? {
            Some(value) => println!("{value}"),
            None => anyhow::bail!("unknown setting: {key}"),
        }
        return Ok(());
    }

    let (provider, settings) = load_settings()?;
    println!("Settings file: {:?}", provider.path());
    println!();
    println!("{}", serde_json::to_string_pretty(&settings)?);
    Ok(())
}

fn cmd_pending() -> anyhow::Result<()> {
    let (_, settings) = load_settings()?;
    let store = LocalStore::open(&settings.staging_path)?;
    let pending = store.pending()?;

    if pending.is_empty() {
        println!("No artifacts pending in {:?}", store.root());
        return Ok(());
    }
    println!("{} artifact(s) pending in {:?}:", pending.len(), store.root());
    for item in pending {
        println!(
            "  {}  {:>9} bytes  attempts: {}",
            item.file_name, item.size_bytes, item.attempts
        );
    }
    Ok(())
}

fn enabled(flag: bool) -> &'static str {
    if flag {
        "enabled"
    } else {
        "disabled"
    }
}
