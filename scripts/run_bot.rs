use clap::Parser;
use songbird::Songbird;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use yomiage_adaptor_discord::{start_discord, DiscordConfig, SongbirdConnector};
use yomiage_core::{
    create_event_channel, init_logging, load_env, GuildSessionManager, MessageRouter,
    ReadoutConfig, ReadoutError, ReadoutMetrics, RouterSettings, SpeakerRoster,
    DEFAULT_CONFIG_PATH,
};
use yomiage_provider_voice::{log_settings, synthesizer_from_config, transcoder_from_config};

/// Gateway events buffered ahead of the router
const EVENT_BUFFER: usize = 256;

const METRICS_INTERVAL: Duration = Duration::from_secs(300);

#[derive(Parser, Debug)]
#[command(name = "run-bot", about = "Read Discord text chat aloud in voice channels")]
struct Cli {
    /// YAML configuration file
    #[arg(long, env = "YOMIAGE_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log level or filter directive; RUST_LOG wins when set
    #[arg(long, env = "YOMIAGE_LOG_LEVEL")]
    log_level: Option<String>,
}

fn log_metrics(metrics: &ReadoutMetrics, label: &str) {
    match serde_json::to_string(&metrics.snapshot()) {
        Ok(snapshot) => info!(metrics = %snapshot, "{}", label),
        Err(e) => warn!(error = %e, "Could not serialize metrics"),
    }
}

async fn report_metrics(metrics: Arc<ReadoutMetrics>, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(METRICS_INTERVAL);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => log_metrics(&metrics, "Metrics"),
        }
    }
}

#[tokio::main]
async fn main() -> yomiage_core::Result<()> {
    // .env may carry YOMIAGE_LOG_LEVEL, so load it before clap reads the environment
    let env_loaded = load_env();
    let cli = Cli::parse();
    init_logging(cli.log_level.as_deref());
    env_loaded?;

    let config = ReadoutConfig::load(&cli.config)?;
    config.require_token()?;
    info!(config = %cli.config.display(), "Configuration loaded");
    log_settings(&config.synthesis, &config.transcoder);

    let synth = Arc::new(synthesizer_from_config(&config.synthesis)?);
    if !synth.ping().await {
        warn!(
            endpoints = ?synth.endpoints(),
            "No synthesis engine answering yet; readouts fail until one is up"
        );
    }
    let transcoder = transcoder_from_config(&config.transcoder);

    let songbird = Songbird::serenity();
    let pipe_frames = (config.playback.prebuffer_frames as usize).max(1) * 2;
    let connector = SongbirdConnector::new(
        songbird.clone(),
        pipe_frames,
        Duration::from_millis(config.playback.send_timeout_ms),
    );

    let metrics = Arc::new(ReadoutMetrics::new());
    let manager = GuildSessionManager::new(
        Arc::new(connector),
        synth,
        transcoder,
        metrics.clone(),
        config.session_settings(),
    );

    let catalog = config.voices.catalog.clone();
    let fallback = config.synthesis.default_speaker;
    let roster = Arc::new(match &config.voices.mapping_file {
        Some(path) => SpeakerRoster::with_mapping_file(catalog, fallback, path)?,
        None => SpeakerRoster::new(catalog, fallback),
    });
    let router = Arc::new(MessageRouter::new(
        RouterSettings::from_config(&config),
        manager.clone(),
        roster.clone(),
    )?);

    let (events_tx, events_rx) = create_event_channel(EVENT_BUFFER);
    let shutdown = CancellationToken::new();
    let router_task = tokio::spawn(router.clone().run(events_rx, shutdown.clone()));
    let metrics_task = tokio::spawn(report_metrics(metrics.clone(), shutdown.clone()));

    let discord = start_discord(
        DiscordConfig::from(&config.discord),
        router,
        events_tx,
        songbird,
    )
    .await?;

    let signal = tokio::signal::ctrl_c().await;
    info!("Shutting down");
    shutdown.cancel();
    manager.leave_all().await;
    discord.shutdown().await;
    for task in [router_task, metrics_task] {
        if let Err(e) = task.await {
            warn!(error = %e, "Background task ended abnormally");
        }
    }
    roster.flush().await;
    log_metrics(&metrics, "Final metrics");

    signal.map_err(ReadoutError::Io)
}
