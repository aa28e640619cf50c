use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use alarmd::api::{ApiServer, ApiServerConfig, DEFAULT_EVENT_HISTORY};
use alarmd::clock::{Clock, SystemClock, Zone};
use alarmd::diagnostics;
use alarmd::engine::AlarmEngine;
use alarmd::notify::{ChannelNotifier, FanoutNotifier, LogNotifier};
use alarmd::service::AlarmService;
use alarmd::store::JsonFileStore;
use alarmd::wake::SoftwareWakeTimer;

#[derive(Parser, Debug)]
#[command(
    name = "alarmd",
    version,
    about = "Alarm clock scheduling daemon with a local control API"
)]
struct Cli {
    #[arg(long, default_value = "alarms.json")]
    alarms: PathBuf,

    /// IANA zone name, or "local" for the host zone.
    #[arg(long, default_value = "local")]
    timezone: String,

    #[arg(long, default_value = "127.0.0.1")]
    api_bind: String,

    #[arg(long, default_value_t = 8099)]
    api_port: u16,

    /// Print the computed schedule and exit without writing anything.
    #[arg(long)]
    check: bool,

    #[arg(long, default_value_t = DEFAULT_EVENT_HISTORY)]
    notify_buffer: usize,
}

fn main() {
    init_tracing();
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let zone = Zone::parse(&cli.timezone)?;

    if cli.check {
        return diagnostics::run_check(&cli.alarms, zone);
    }
    if cli.notify_buffer == 0 {
        bail!("--notify-buffer must be greater than zero");
    }

    let store = JsonFileStore::open(&cli.alarms)?;
    let settings = store.settings();
    info!(path = %store.path().display(), zone = %zone, "starting alarmd");

    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new(zone));
    let (channel_notifier, events) = ChannelNotifier::bounded(cli.notify_buffer);
    let service = AlarmService::start(|on_wake| {
        Ok(AlarmEngine::new(
            Arc::clone(&clock),
            settings,
            Box::new(store),
            Box::new(SoftwareWakeTimer::new(Arc::clone(&clock), on_wake)),
            Box::new(FanoutNotifier::new(vec![
                Box::new(LogNotifier),
                Box::new(channel_notifier),
            ])),
        ))
    })?;

    let api_server = ApiServer::start(
        ApiServerConfig {
            bind_addr: cli.api_bind.clone(),
            port: cli.api_port,
            event_history: cli.notify_buffer,
        },
        service.handle(),
        events,
    )
    .with_context(|| {
        format!(
            "failed to start local API at {}:{}",
            cli.api_bind, cli.api_port
        )
    })?;

    service.wait();
    drop(api_server);
    info!("alarmd stopped");
    Ok(())
}
