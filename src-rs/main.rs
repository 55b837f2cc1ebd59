mod beacon;
mod canvas;
mod diff;
mod instructions;
mod reconcile;
mod state;
mod sync;
mod tag;

use anyhow::{bail, Context, Result};
use clap::Parser;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::beacon::BeaconClient;
use crate::canvas::{Position, TargetImage, COMPACT_COORD_MAX};
use crate::instructions::InstructionFile;
use crate::reconcile::Reconciler;
use crate::state::JsonStateFile;
use crate::sync::SyncDriver;

#[derive(Parser, Debug)]
#[command(
    name = "graffiti-daemon",
    version,
    about = "A simple daemon that updates a graffiti file to draw a specific image to the graffitiwall."
)]
struct Cli {
    /// The input image to process (PNG format)
    #[arg(short, long, value_name = "image.png")]
    image: PathBuf,
    /// Target x-position to draw the image on the graffitiwall
    #[arg(short = 'x', long, default_value_t = 0)]
    xpos: u32,
    /// Target y-position to draw the image on the graffitiwall
    #[arg(short = 'y', long, default_value_t = 0)]
    ypos: u32,
    /// The CL RPC host to receive blocks from
    #[arg(short, long, default_value = "http://127.0.0.1:5052")]
    rpchost: String,
    /// The graffiti file to update
    #[arg(short, long, default_value = "graffiti.txt")]
    file: PathBuf,
    /// The graffiti template with <gw> as placeholder for the pixel data
    #[arg(short, long, default_value = "<gw>")]
    template: String,
    /// The path to the state json
    #[arg(short, long, default_value = "graffiti-state.json")]
    state: PathBuf,
    /// File with validator pubkeys, one per line
    #[arg(short, long)]
    validators: Option<PathBuf>,
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
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    info!("Parse image: {}", cli.image.display());
    let target = TargetImage::load(&cli.image, Position::new(cli.xpos, cli.ypos))?;
    info!(
        "Target Pixels:  {}, Size: ({},{}), Offset: ({},{})",
        target.pixel_count(),
        target.width(),
        target.height(),
        target.offset().x,
        target.offset().y
    );
    check_placement(&target)?;

    ensure_parent_dir(&cli.state)?;
    ensure_parent_dir(&cli.file)?;

    let reconciler = Reconciler::open(target, JsonStateFile::new(&cli.state))?;
    if reconciler.wall().is_empty() {
        info!("No wall state yet, last slot {}", reconciler.watermark());
    } else {
        info!(
            "Loaded state: {} wall pixels, last slot {}",
            reconciler.wall().len(),
            reconciler.watermark()
        );
    }
    let output = InstructionFile::new(&cli.file, cli.template, cli.validators);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;

    runtime.block_on(async {
        let client = BeaconClient::new(&cli.rpchost);
        let mut driver = SyncDriver::new(client.clone(), reconciler, output, StdRng::from_entropy());
        driver.start().await;
        driver.run(client.subscribe()).await;
    });
    Ok(())
}

/// Compact tags carry three digits per coordinate, so the whole placement
/// has to stay within `0..=999` on both axes.
fn check_placement(target: &TargetImage) -> Result<()> {
    if !target.fits_compact_tag() {
        bail!(
            "image at ({},{}) with size {}x{} extends past {COMPACT_COORD_MAX} on the wall",
            target.offset().x,
            target.offset().y,
            target.width(),
            target.height()
        );
    }
    Ok(())
}

fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create parent directory: {}", parent.display())
            })?;
        }
    }
    Ok(())
}
