//! Lifeline Agent - replays a recorded track in real time
//!
//! Loads a JSON array of location samples, feeds it through a
//! `TrackingSession` on the production `TokioContext` and prints every
//! fused sample as one JSON line on stdout. Logs go to stderr.
//!
//! ```text
//! lifeline-agent track.json --config lifeline.json --speed 4
//! ```

use anyhow::{bail, Context, Result};
use clap::Parser;
use lifeline_core::{LifelineConfig, LocationSample, TrackingSession};
use lifeline_env::{LifelineContext, TokioContext};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Lifeline track replay agent
#[derive(Parser, Debug)]
#[command(name = "lifeline-agent")]
#[command(about = "Replay a recorded track through the Lifeline fusion engine", long_about = None)]
struct Args {
    /// Recorded track (JSON array of samples)
    track: PathBuf,

    /// Configuration file (JSON); defaults apply when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Playback speed multiplier (overrides the config)
    #[arg(short, long)]
    speed: Option<f64>,
}

fn load_track(path: &Path) -> Result<Vec<LocationSample>> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading track {}", path.display()))?;
    parse_track(&text).with_context(|| format!("parsing track {}", path.display()))
}

fn parse_track(text: &str) -> Result<Vec<LocationSample>> {
    let samples: Vec<LocationSample> = serde_json::from_str(text)?;
    if samples.is_empty() {
        bail!("track contains no samples");
    }
    Ok(samples)
}

fn load_config(path: Option<&Path>) -> Result<LifelineConfig> {
    let config = match path {
        Some(path) => LifelineConfig::from_file(path).with_context(|| format!("loading {}", path.display()))?,
        None => LifelineConfig::default(),
    };
    Ok(config.with_env_overrides()?)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let mut config = load_config(args.config.as_deref())?;
    if let Some(speed) = args.speed {
        config.replay.speed = speed;
    }
    let track = load_track(&args.track)?;
    info!(frames = track.len(), speed = config.replay.speed, "loaded track");

    let context = TokioContext::shared();
    let mut session = TrackingSession::new(context.clone(), config.fusion, config.replay, |fused| {
        match serde_json::to_string(fused) {
            Ok(line) => {
                let mut stdout = std::io::stdout().lock();
                let _ = writeln!(stdout, "{line}");
            }
            Err(e) => warn!(error = %e, "failed to encode fused sample"),
        }
    });

    session.start_replay(track);

    loop {
        let Some(deadline) = session.next_deadline() else {
            break;
        };
        let wait = deadline.saturating_sub(context.now());

        tokio::select! {
            _ = tokio::time::sleep(wait.max(Duration::from_millis(1))) => {
                session.poll();
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
        }
    }

    let stats = session.stats();
    let progress = session.replay_progress();
    session.teardown();
    info!(
        accepted = stats.accepted,
        rejected = stats.rejected,
        played = progress.cursor,
        total = progress.total,
        "replay finished"
    );
    Ok(())
}
