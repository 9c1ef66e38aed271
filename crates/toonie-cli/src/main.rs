//! `toonie`: headless front-end for the playback core.
//!
//! - `list`: scan a directory and print the Videos and Music tabs
//! - `play`: open a file on a player surface backed by the simulated media
//!   layer and print progress until the media ends, fails, times out or
//!   Ctrl-C is pressed

mod cli;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use toonie_player::catalog::{
    asset_for_path, DirectoryCatalog, MediaLibrary, MediaTabs, PermissionStatus, StaticPermission,
};
use toonie_player::sim::SimulatedBackend;
use toonie_player::{NowPlayingBar, PlayerConfig, PlayerContext, SessionEvent, SessionHost, Surface};
use toonie_types::{MediaAsset, MediaKind, PlaybackState};
use tracing_subscriber::EnvFilter;

const CONFIG_FILE_NAME: &str = "toonie.toml";

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = cli::Args::parse();
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,toonie=info")),
        )
        .init();

    let config = load_config(args.config.as_deref())?;
    match args.cmd {
        cli::Command::List { dir, kind, json } => list(&dir, kind.map(Into::into), json).await,
        cli::Command::Play {
            path,
            duration_ms,
            no_autoplay,
            seek_ms,
            volume,
            mute,
            rate,
            repeat,
            max_secs,
            json,
        } => {
            let mut config = config;
            if no_autoplay {
                config.autoplay = false;
            }
            let options = PlayOptions {
                duration_ms,
                seek_ms,
                volume,
                mute,
                rate,
                repeat,
                max_secs,
                json,
            };
            play(&path, config, options).await
        }
    }
}

/// `--config`, then `toonie.toml` next to the executable, then defaults.
fn load_config(explicit: Option<&Path>) -> Result<PlayerConfig> {
    if let Some(path) = explicit {
        return PlayerConfig::load(path);
    }
    let beside_exe: Option<PathBuf> = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(CONFIG_FILE_NAME)));
    match beside_exe {
        Some(path) if path.is_file() => {
            tracing::info!(path = %path.display(), "using config next to executable");
            PlayerConfig::load(&path)
        }
        _ => Ok(PlayerConfig::default()),
    }
}

async fn list(dir: &Path, kind: Option<MediaKind>, json: bool) -> Result<()> {
    let library = MediaLibrary::new(
        DirectoryCatalog::new(dir),
        StaticPermission(PermissionStatus::Granted),
    );
    let tabs = match kind {
        Some(MediaKind::Video) => MediaTabs {
            videos: library.list(MediaKind::Video).await?,
            audios: Vec::new(),
        },
        Some(MediaKind::Audio) => MediaTabs {
            videos: Vec::new(),
            audios: library.list(MediaKind::Audio).await?,
        },
        None => library.load_tabs().await?,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&tabs)?);
        return Ok(());
    }
    if kind != Some(MediaKind::Audio) {
        print_tab("Videos", &tabs.videos);
    }
    if kind != Some(MediaKind::Video) {
        print_tab("Music", &tabs.audios);
    }
    Ok(())
}

fn print_tab(title: &str, assets: &[MediaAsset]) {
    println!("{title} ({})", assets.len());
    if assets.is_empty() {
        println!("  (no media found)");
    }
    for asset in assets {
        println!("  {:<40} {}", asset.display_name, asset.uri);
    }
}

struct PlayOptions {
    duration_ms: u64,
    seek_ms: Option<i64>,
    volume: Option<f32>,
    mute: bool,
    rate: Option<f32>,
    repeat: bool,
    max_secs: Option<u64>,
    json: bool,
}

async fn play(path: &Path, config: PlayerConfig, options: PlayOptions) -> Result<()> {
    anyhow::ensure!(path.is_file(), "not a file: {}", path.display());
    let asset = asset_for_path(path)
        .with_context(|| format!("unsupported media file {}", path.display()))?;
    let surface = match asset.kind {
        MediaKind::Audio => Surface::AudioPlayer,
        MediaKind::Video => Surface::VideoPlayer,
    };

    let backend = SimulatedBackend::new(options.duration_ms);
    let context = PlayerContext::new(Arc::new(backend), config);
    let mut host = SessionHost::new(&context, surface);
    let bar = NowPlayingBar::new(&context);

    let stop = CancellationToken::new();
    let stop_on_signal = stop.clone();
    ctrlc::set_handler(move || stop_on_signal.cancel()).context("install Ctrl-C handler")?;

    host.open(Arc::new(asset)).await.context("open media")?;
    if let Some(volume) = options.volume {
        host.set_volume(volume).await.context("set volume")?;
    }
    if options.mute {
        host.set_muted(true).await.context("mute")?;
    }
    if let Some(rate) = options.rate {
        host.set_rate(rate).await.context("set rate")?;
    }
    if options.repeat {
        host.set_repeat(true).context("enable repeat")?;
    }
    if let Some(target) = options.seek_ms {
        // autoplay can also be disabled from the config file
        if host.view().state == PlaybackState::Ready {
            tracing::warn!(target_ms = target, "not playing; seek skipped");
        } else {
            host.seek(target).await.context("seek")?;
        }
    }

    let mut events = host
        .session()
        .map(|session| session.subscribe())
        .context("no session bound")?;
    let mut progress = host.progress();
    let limit = async {
        match options.max_secs {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(limit);

    eprintln!("now playing: {}", bar.view().title);
    print_status(&host, options.json)?;
    loop {
        tokio::select! {
            _ = stop.cancelled() => {
                tracing::info!("interrupted");
                break;
            }
            _ = &mut limit => {
                tracing::info!(max_secs = options.max_secs, "time limit reached");
                break;
            }
            changed = progress.changed() => {
                if changed.is_err() {
                    break;
                }
                print_status(&host, options.json)?;
            }
            event = events.recv() => match event {
                Ok(SessionEvent::Failed { error, .. }) => eprintln!("error: {error}"),
                Ok(SessionEvent::StateChanged { .. }) => print_status(&host, options.json)?,
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "status output lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
        if matches!(
            host.view().state,
            PlaybackState::Ended | PlaybackState::Error | PlaybackState::Unloaded
        ) {
            break;
        }
    }

    let view = host.view();
    drop(host);
    context.shutdown();
    if view.state == PlaybackState::Error {
        anyhow::bail!(
            "playback failed: {}",
            view.error.unwrap_or_else(|| "unknown error".to_string())
        );
    }
    Ok(())
}

fn print_status(host: &SessionHost, json: bool) -> Result<()> {
    if json {
        if let Some(session) = host.session() {
            println!("{}", serde_json::to_string(&session.status())?);
        }
    } else {
        println!("{}", host.view().status_line());
    }
    Ok(())
}
