use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use toonie_types::MediaKind;

const VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("GIT_SHA"),
    ", ",
    env!("BUILD_DATE"),
    ")"
);

#[derive(Parser, Debug)]
#[command(name = "toonie", version = VERSION)]
pub struct Args {
    #[command(subcommand)]
    pub cmd: Command,

    /// Player config file (TOML). Defaults to `toonie.toml` next to the executable.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum KindArg {
    Audio,
    Video,
}

impl From<KindArg> for MediaKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Audio => MediaKind::Audio,
            KindArg::Video => MediaKind::Video,
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List media in a directory as the Videos and Music tabs
    List {
        /// Directory to scan (recursively)
        dir: PathBuf,

        /// Only list one tab
        #[arg(long, value_enum)]
        kind: Option<KindArg>,

        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Play a file against the simulated backend, printing progress
    Play {
        /// Path to a media file
        path: PathBuf,

        /// Length of the simulated media in milliseconds
        #[arg(long, default_value_t = 180_000)]
        duration_ms: u64,

        /// Load without starting playback
        #[arg(long)]
        no_autoplay: bool,

        /// Seek to this position once playing
        #[arg(long, conflicts_with = "no_autoplay")]
        seek_ms: Option<i64>,

        /// Output volume in [0, 1]
        #[arg(long)]
        volume: Option<f32>,

        /// Start muted
        #[arg(long)]
        mute: bool,

        /// Playback speed multiplier
        #[arg(long)]
        rate: Option<f32>,

        /// Restart when the end is reached
        #[arg(long)]
        repeat: bool,

        /// Stop after this many seconds
        #[arg(long)]
        max_secs: Option<u64>,

        /// Print one JSON status per update instead of a status line
        #[arg(long)]
        json: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn play_accepts_seek_with_autoplay() {
        let args = Args::try_parse_from(["toonie", "play", "song.mp3", "--seek-ms", "1000"]).unwrap();
        match args.cmd {
            Command::Play { seek_ms, no_autoplay, .. } => {
                assert_eq!(seek_ms, Some(1_000));
                assert!(!no_autoplay);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn play_rejects_seek_without_autoplay() {
        let err = Args::try_parse_from([
            "toonie",
            "play",
            "song.mp3",
            "--no-autoplay",
            "--seek-ms",
            "1000",
        ])
        .unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ArgumentConflict);
    }
}
