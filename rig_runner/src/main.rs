// Command-line driver for the stage_traverse rig: offline planning from recorded
// detector output, frame tiling, and dry runs against a simulated stage.

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;

use stage_traverse::core_modules::tiling::split_into_tiles;
use stage_traverse::{
    BoxRect, Jog, JogSpeed, Point2, Position, RigConfig, RigSession, SimulatedStage, TileTensor,
    TraversalEvent,
};

#[derive(Parser)]
#[command(name = "rig_runner")]
#[command(about = "Plan and dry-run stage traversals over tiled detections")]
#[command(version)]
struct Cli {
    /// JSON rig config; built-in defaults are used when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Turn recorded per-tile tensors into an ordered detection path.
    Plan {
        #[command(flatten)]
        input: TensorInput,

        /// Where to write the plan (JSON). Printed to stdout when omitted.
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Cut an image into tiles and save them as PNGs.
    Tiles {
        #[arg(long)]
        image: PathBuf,

        #[arg(long)]
        out_dir: PathBuf,

        /// Overrides the configured tile factor.
        #[arg(long)]
        factor: Option<u32>,
    },

    /// Walk a planned path, pausing at each waypoint for the operator.
    Traverse {
        #[command(flatten)]
        input: TensorInput,

        /// Drive an in-memory stage instead of hardware.
        #[arg(long)]
        simulate: bool,
    },

    /// Move the simulated stage to an absolute position.
    Goto {
        #[arg(long, allow_hyphen_values = true)]
        x: f64,
        #[arg(long, allow_hyphen_values = true)]
        y: f64,
        #[arg(long, allow_hyphen_values = true)]
        z: f64,
    },

    /// Jog the simulated stage (left, right, up, down, z-up, z-down, up-left, ...).
    Jog {
        direction: Jog,

        /// Step size in real-world units.
        #[arg(long, default_value = "100.0")]
        step: f64,

        /// Ten steps instead of one.
        #[arg(long)]
        coarse: bool,
    },

    /// Print the effective config as JSON.
    PrintConfig,
}

#[derive(Debug, Clone, Args)]
struct TensorInput {
    /// JSON array of per-tile tensors, row-major tile order.
    #[arg(long)]
    tensors: PathBuf,

    /// Width of the (cropped) source image in pixels.
    #[arg(long)]
    width: u32,

    /// Height of the (cropped) source image in pixels.
    #[arg(long)]
    height: u32,
}

#[derive(Serialize)]
struct PlannedDetection {
    class: String,
    confidence: f32,
    tile: usize,
    rect: BoxRect,
    centroid: Point2,
}

#[derive(Serialize)]
struct PlanReport {
    detections: Vec<PlannedDetection>,
    /// Absent when the session has no valid calibration.
    waypoints: Option<Vec<Point2>>,
}

fn load_config(path: Option<&Path>) -> Result<RigConfig> {
    match path {
        Some(p) => RigConfig::from_json_file(p).with_context(|| format!("loading {}", p.display())),
        None => Ok(RigConfig::default()),
    }
}

fn load_tensors(path: &Path) -> Result<Vec<TileTensor>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading tensors from {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing tensors in {}", path.display()))
}

fn simulated_session(config: RigConfig) -> Result<RigSession> {
    Ok(RigSession::new(config, SimulatedStage::new())?)
}

fn print_position(label: &str, p: Position) {
    println!("{label}: x={:.1} y={:.1} z={:.1}", p.x, p.y, p.z);
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Plan { input, out } => run_plan(config, &input, out.as_deref()),
        Commands::Tiles {
            image,
            out_dir,
            factor,
        } => run_tiles(&config, &image, &out_dir, factor),
        Commands::Traverse { input, simulate } => run_traverse(config, &input, simulate).await,
        Commands::Goto { x, y, z } => run_goto(config, Position::new(x, y, z)).await,
        Commands::Jog {
            direction,
            step,
            coarse,
        } => {
            let speed = if coarse { JogSpeed::Coarse } else { JogSpeed::Fine };
            run_jog(config, direction, step, speed).await
        }
        Commands::PrintConfig => {
            println!("{}", config.to_json_pretty()?);
            Ok(())
        }
    }
}

fn run_plan(config: RigConfig, input: &TensorInput, out: Option<&Path>) -> Result<()> {
    let tensors = load_tensors(&input.tensors)?;
    let mut session = simulated_session(config)?;
    session.plan_from_tensors(&tensors, input.width, input.height)?;

    let detections = session
        .path()
        .iter()
        .map(|d| PlannedDetection {
            class: session.pipeline().class_name(d.class_id).to_string(),
            confidence: d.confidence,
            tile: d.tile_index,
            rect: d.rect,
            centroid: d.centroid(),
        })
        .collect();
    let waypoints = match session.waypoints() {
        Ok(w) => Some(w),
        Err(e) => {
            tracing::warn!("waypoints omitted: {e}");
            None
        }
    };
    let json = serde_json::to_string_pretty(&PlanReport {
        detections,
        waypoints,
    })?;
    session.shutdown();

    match out {
        Some(path) => {
            std::fs::write(path, json).with_context(|| format!("writing {}", path.display()))?;
            tracing::info!(path = %path.display(), "plan written");
        }
        None => println!("{json}"),
    }
    Ok(())
}

fn run_tiles(config: &RigConfig, image: &Path, out_dir: &Path, factor: Option<u32>) -> Result<()> {
    let frame = image::open(image)
        .with_context(|| format!("opening {}", image.display()))?
        .to_rgb8();
    let factor = factor.unwrap_or(config.detection.tile_factor);
    let tiles = split_into_tiles(&frame, factor)?;
    let paths = tiles.save(out_dir)?;
    println!(
        "wrote {} tiles of {}x{} to {}",
        paths.len(),
        tiles.tile_width,
        tiles.tile_height,
        out_dir.display()
    );
    Ok(())
}

async fn run_traverse(config: RigConfig, input: &TensorInput, simulate: bool) -> Result<()> {
    if !simulate {
        bail!("this build has no hardware transport; rerun with --simulate");
    }
    let tensors = load_tensors(&input.tensors)?;
    let mut session = simulated_session(config)?;
    let planned = session
        .plan_from_tensors(&tensors, input.width, input.height)?
        .len();
    println!("planned {planned} detections");

    let mut events = session.subscribe_traversal();
    let handle = session.start_traversal()?;
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    loop {
        match events.recv().await {
            Ok(TraversalEvent::WaitingForUser { index }) => {
                print_position(&format!("waypoint {index}"), session.current_position());
                println!("Enter to continue, 'a' to abort");
                match stdin.next_line().await? {
                    Some(line) if line.trim().eq_ignore_ascii_case("a") => handle.abort(),
                    Some(_) => handle.confirm(),
                    None => handle.abort(),
                }
            }
            Ok(TraversalEvent::Finished(_)) | Err(RecvError::Closed) => break,
            Ok(event) => tracing::info!(?event, "traversal"),
            Err(RecvError::Lagged(missed)) => tracing::warn!(missed, "traversal events dropped"),
        }
    }

    let outcome = handle.wait().await?;
    println!("traversal finished: {outcome:?}");
    session.shutdown();
    Ok(())
}

async fn run_goto(config: RigConfig, target: Position) -> Result<()> {
    let mut session = simulated_session(config)?;
    let outcome = session.go_to(target).await?;
    tracing::info!(?outcome, "go-to finished");
    print_position("position", session.current_position());
    session.shutdown();
    Ok(())
}

async fn run_jog(config: RigConfig, direction: Jog, step: f64, speed: JogSpeed) -> Result<()> {
    let mut session = simulated_session(config)?;
    session.jog(direction, step, speed)?;
    session.stage().refresh_position().await?;
    print_position("position", session.current_position());
    session.shutdown();
    Ok(())
}
