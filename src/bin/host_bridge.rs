//! Headless host bridge binary for stdin/stdout JSON communication.
//!
//! This binary reads `CommandEnvelope` messages as newline-delimited JSON
//! from stdin, drives the avatar engine, and writes `ResponseEnvelope` and
//! `EventEnvelope` messages to stdout.
//!
//! Speech audio plays on the configured output device (`[audio]`). With
//! `output = "timed"`, or without a local synthesizer, nothing is played and
//! the host is expected to voice the `caption` events itself.
//!
//! All tracing/diagnostic output goes to stderr so that stdout remains a
//! clean JSON protocol channel. Setting `KUCHIPAKU_LOG_DIR` additionally
//! writes a daily rolling log file there.
//!
//! Usage: `kuchipaku-host [--config <path>]`

use kuchipaku::app_dirs;
use kuchipaku::audio;
use kuchipaku::conductor::SpeechConductor;
use kuchipaku::config::SyncConfig;
use kuchipaku::host::HostHandler;
use kuchipaku::host::stdio::run_stdio_bridge;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let _log_guard = init_tracing();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "kuchipaku-host starting");

    let config = load_config()?;
    let sink = audio::sink_from_config(&config.audio);
    let conductor = SpeechConductor::from_config(&config, sink)
        .map_err(|e| anyhow::anyhow!("invalid configuration: {e}"))?;
    let handler = HostHandler::new(conductor, &config.host);

    run_stdio_bridge(handler).await.map_err(|e| {
        tracing::error!(error = %e, "kuchipaku-host exited with error");
        anyhow::anyhow!("kuchipaku-host failed: {e}")
    })?;

    tracing::info!("kuchipaku-host shut down cleanly");
    Ok(())
}

/// Initialise tracing to stderr (stdout is reserved for the JSON protocol),
/// plus a rolling file when `KUCHIPAKU_LOG_DIR` is set.
fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    let (file_layer, guard) = if std::env::var_os("KUCHIPAKU_LOG_DIR").is_some() {
        let appender = tracing_appender::rolling::daily(app_dirs::logs_dir(), "kuchipaku-host.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let layer = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(writer);
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();
    guard
}

/// Config from `--config <path>`, else the default path when it exists,
/// else built-in defaults.
fn load_config() -> anyhow::Result<SyncConfig> {
    let mut args = std::env::args().skip(1);
    let mut explicit: Option<PathBuf> = None;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => {
                let path = args
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("--config requires a path"))?;
                explicit = Some(PathBuf::from(path));
            }
            other => anyhow::bail!("unknown argument `{other}`"),
        }
    }

    if let Some(path) = explicit.as_deref()
        && !path.exists()
    {
        anyhow::bail!("config file {} does not exist", path.display());
    }
    let path = explicit.unwrap_or_else(SyncConfig::default_config_path);
    if !path.exists() {
        tracing::info!(path = %path.display(), "no config file; using defaults");
        return Ok(SyncConfig::default());
    }
    let config = SyncConfig::from_file(&path)
        .map_err(|e| anyhow::anyhow!("failed to load {}: {e}", path.display()))?;
    tracing::info!(path = %path.display(), "config loaded");
    Ok(config)
}
