// Copyright Timewarp Contributors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Timewarp controller
//!
//! Publishes a speed factor to the channel a preloaded shim polls, steering
//! the apparent passage of time inside the target process:
//!
//! ```sh
//! LD_PRELOAD=./libtimewarp.so TIME_CHANNEL=7 my_process &
//! timewarp-ctl --channel 7 4.0
//! ```

use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::Parser;
use tracing::{info, Level};

use timewarp_core::{SpeedupWriter, CHANNEL_PATH_PREFIX};

#[derive(Parser, Debug)]
#[command(author, name = "timewarp-ctl", version, about, long_about = None)]
struct Cli {
    /// Speed factor to publish. Virtual time in the target advances this
    /// many seconds per real second; must be positive and finite.
    speedup: f32,

    /// Channel suffix appended to the fixed prefix, mirroring the
    /// TIME_CHANNEL variable of the target process.
    #[arg(short, long)]
    channel: Option<String>,

    /// Full channel path, overriding the prefix + suffix convention.
    #[arg(short, long, conflicts_with = "channel")]
    path: Option<PathBuf>,

    /// Emit structured log messages. Default to human readable.
    #[arg(short, long)]
    json_output: bool,
}

fn channel_path(args: &Cli) -> PathBuf {
    if let Some(path) = &args.path {
        return path.clone();
    }
    let mut path = String::from(CHANNEL_PATH_PREFIX);
    if let Some(suffix) = &args.channel {
        path.push_str(suffix);
    }
    PathBuf::from(path)
}

fn main() -> anyhow::Result<()> {
    let args = Cli::parse();

    // Configure the fields emitted in log messages
    let format = tracing_subscriber::fmt::format()
        .with_level(true)
        .with_target(false);

    let builder = tracing_subscriber::fmt().with_max_level(Level::DEBUG);
    if args.json_output {
        builder
            .event_format(format.json().flatten_event(true))
            .init();
    } else {
        builder.event_format(format).init();
    };

    if !args.speedup.is_finite() || args.speedup <= 0.0 {
        bail!(
            "speed factor must be positive and finite, got {}",
            args.speedup
        );
    }

    let path = channel_path(&args);
    let mut writer = SpeedupWriter::create(&path)
        .with_context(|| format!("failed to open speed channel {}", path.display()))?;
    writer
        .set_speedup(args.speedup)
        .with_context(|| format!("failed to publish to speed channel {}", path.display()))?;

    info!(
        speedup = args.speedup,
        path = %path.display(),
        "published speed factor"
    );
    Ok(())
}
