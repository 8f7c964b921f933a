//! # SARA Playout (sara-playout)
//!
//! Diagnostic CLI over the playout core: list output devices or audition
//! a file with its resolved mix plan on the default device.

use anyhow::Result;
use clap::Parser;
use sara_common::config::PlayoutConfig;
use sara_common::human_time::format_seconds;
use sara_playout::announce::LogSink;
use sara_playout::automix::AutoMixRuntime;
use sara_playout::backend::device::DeviceManager;
use sara_playout::backend::direct::DirectBackend;
use sara_playout::backend::DeviceId;
use sara_playout::controller::PlaybackController;
use sara_playout::model::{PlaylistItem, PlaylistKind, PlaylistModel};
use sara_playout::plan::MixPlanner;
use sara_playout::settings::StaticSettings;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "sara-playout")]
#[command(about = "SARA playout core - playback and mix-trigger runtime")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "sara-playout.toml")]
    config: PathBuf,

    /// List output devices and exit
    #[arg(short, long)]
    list_devices: bool,

    /// Audio file to audition
    #[arg(short, long)]
    play: Option<PathBuf>,

    /// Segue point in seconds for the audition
    #[arg(short, long)]
    segue: Option<f64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sara_playout=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();

    let args = Args::parse();
    let config = PlayoutConfig::load(&args.config)?;
    info!(
        "Loaded configuration: fade={}s pfl={:?}",
        config.fade_seconds, config.pfl_device
    );

    let devices = DeviceManager::new();

    if args.list_devices {
        for device in devices.devices() {
            let marker = if device.is_default { " (default)" } else { "" };
            println!("{}{}", device.name, marker);
        }
        return Ok(());
    }

    let path = match args.play {
        Some(path) => path,
        None => {
            println!("Nothing to do; try --list-devices or --play <file>");
            return Ok(());
        }
    };

    let settings = Arc::new(StaticSettings::new());
    settings.set_fade_seconds(config.fade_seconds);
    settings.set_pfl_device(config.pfl_device.clone().map(DeviceId::from));

    let backend = DirectBackend::new(Arc::clone(&devices), config.transcode_extensions.clone());
    let controller = PlaybackController::new(
        backend,
        devices,
        settings.clone(),
        Arc::new(LogSink),
    );
    let runtime = AutoMixRuntime::new(Arc::clone(&controller), settings);
    runtime.spawn();

    let mut item = PlaylistItem::new(
        path.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "audition".into()),
        path.clone(),
        0.0,
    );
    item.segue_seconds = args.segue;
    let item_id = item.id;

    let plan = MixPlanner::resolve(&item, config.fade_seconds, None);
    info!(
        "Mix plan: mix_at={} fade={} effective={}",
        plan.mix_at
            .map(format_seconds)
            .unwrap_or_else(|| "none".into()),
        format_seconds(plan.fade_seconds),
        format_seconds(plan.effective_duration)
    );

    let mut playlist = PlaylistModel::new("audition", PlaylistKind::Music);
    playlist.items.push(item);
    let playlist_id = playlist.id;
    let shared = Arc::new(RwLock::new(playlist));
    runtime.register_playlist(Arc::clone(&shared)).await;

    if !runtime.start_playback(playlist_id, item_id, false).await {
        anyhow::bail!("failed to start {}", path.display());
    }
    info!("Playing {}; ctrl-c to stop", path.display());

    tokio::signal::ctrl_c().await?;
    runtime.stop_playlist(playlist_id, 0.0).await;
    info!("Stopped");
    Ok(())
}
