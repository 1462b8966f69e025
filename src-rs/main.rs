mod annotations;
mod catalog;
mod client;
mod config;
mod dispatch;
mod error;
mod geometry;
mod hierarchy;
mod pipeline;
mod region;
mod stager;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{ArgAction, Args, Parser, Subcommand};
use serde_json::{json, Value};
use std::fs;
use std::io::{self, IsTerminal, Write};
use std::path::{Path, PathBuf};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::annotations::build_document;
use crate::catalog::{segmentation_models, ModelChooser, PresetChooser, PromptChooser};
use crate::client::{HttpLabelService, InferenceResult, LabelService};
use crate::geometry::Shape;
use crate::hierarchy::{load_objects, load_shape, LabeledObject};
use crate::pipeline::{run_segmentation, Outcome, SegmentJob};
use crate::region::{resolve_region, Region};
use crate::stager::{ImagePatchSource, PatchSource, PlaceholderPatchSource};

#[derive(Parser, Debug)]
#[command(
    name = "patch-infer",
    version,
    about = "Stage pathology image regions with a MONAI Label server and run segmentation on them"
)]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace); RUST_LOG is used otherwise
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print supported commands in JSON
    Commands,
    /// Show the server's model catalog and which models can segment
    Info(InfoArgs),
    /// Write the ASAP annotation document for a region without contacting a server
    Export(ExportArgs),
    /// Stage the selected region and run segmentation inference on it
    Segment(SegmentArgs),
}

#[derive(Args, Debug)]
struct ServerArgs {
    /// Label server URL (default: $PATCH_INFER_SERVER or http://127.0.0.1:8000)
    #[arg(long)]
    server: Option<String>,
    /// Request timeout in seconds (default: $PATCH_INFER_TIMEOUT_SECS or 600)
    #[arg(long)]
    timeout_secs: Option<u64>,
}

#[derive(Args, Debug)]
struct SelectionArgs {
    /// Selected rectangle as x,y,w,h in image pixels
    #[arg(long, allow_hyphen_values = true, conflicts_with = "selection")]
    roi: Option<Region>,
    /// Selection shape JSON file (or - for stdin)
    #[arg(long)]
    selection: Option<String>,
}

impl SelectionArgs {
    fn load(&self) -> Result<Option<Shape>> {
        if let Some(region) = self.roi {
            return Ok(Some(Shape::rectangle(
                f64::from(region.x),
                f64::from(region.y),
                f64::from(region.width),
                f64::from(region.height),
            )));
        }
        self.selection.as_deref().map(load_shape).transpose()
    }
}

#[derive(Args, Debug)]
struct InfoArgs {
    #[command(flatten)]
    server: ServerArgs,
}

#[derive(Args, Debug)]
struct ExportArgs {
    /// Object hierarchy export JSON (or - for stdin)
    #[arg(long)]
    objects: String,
    #[command(flatten)]
    selection: SelectionArgs,
    /// Output XML path (default: a kept temp file named after a generated export name)
    #[arg(long)]
    out: Option<PathBuf>,
    /// Directory for temp files (default: $PATCH_INFER_TMP_DIR or the OS temp dir)
    #[arg(long)]
    tmp_dir: Option<PathBuf>,
    /// Print a JSON summary instead of the output path
    #[arg(long, action = ArgAction::SetTrue)]
    json: bool,
}

#[derive(Args, Debug)]
struct SegmentArgs {
    /// Source image: a whole-slide file, or a png/jpg image
    image: PathBuf,
    /// Object hierarchy export JSON (or - for stdin); staged as the patch label
    #[arg(long)]
    objects: Option<String>,
    #[command(flatten)]
    selection: SelectionArgs,
    #[command(flatten)]
    server: ServerArgs,
    /// Model to use when the server offers several segmentation models
    #[arg(long)]
    model: Option<String>,
    /// Tile size for whole-slide inference (default: 1024)
    #[arg(long)]
    tile_size: Option<u32>,
    /// Treat the source as a whole-slide image regardless of its extension
    #[arg(long, action = ArgAction::SetTrue, conflicts_with = "simple")]
    wsi: bool,
    /// Treat the source as a simple single-frame image
    #[arg(long, action = ArgAction::SetTrue)]
    simple: bool,
    /// Raster to crop the staged patch from (default: the source when it is a png/jpg, else an empty placeholder)
    #[arg(long)]
    patch_image: Option<PathBuf>,
    /// Write the inference result here instead of stdout
    #[arg(long)]
    out: Option<PathBuf>,
    /// Directory for temp files (default: $PATCH_INFER_TMP_DIR or the OS temp dir)
    #[arg(long)]
    tmp_dir: Option<PathBuf>,
    /// Keep the staged patch and label files after the run
    #[arg(long, action = ArgAction::SetTrue)]
    keep_temp: bool,
    /// Never prompt for a model; cancel when the choice is ambiguous
    #[arg(long, action = ArgAction::SetTrue)]
    no_prompt: bool,
    /// Print a JSON summary to stdout
    #[arg(long, action = ArgAction::SetTrue)]
    json: bool,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    if let Err(err) = run(cli) {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn init_logging(verbose: u8) {
    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        1 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Commands => print_commands(),
        Commands::Info(args) => command_info(args),
        Commands::Export(args) => command_export(args),
        Commands::Segment(args) => command_segment(args),
    }
}

fn print_commands() -> Result<()> {
    let rows = vec![
        json!({
            "name": "info",
            "description": "List the server's models and the segmentation-capable ones.",
        }),
        json!({
            "name": "export",
            "description": "Encode annotations inside a region as ASAP XML.",
        }),
        json!({
            "name": "segment",
            "description": "Stage a region's patch and label, then run segmentation inference.",
        }),
    ];

    println!(
        "{}",
        serde_json::to_string_pretty(&json!({ "commands": rows }))?
    );
    Ok(())
}

fn connect(args: &ServerArgs) -> Result<HttpLabelService> {
    let url = config::server_url(args.server.as_deref());
    HttpLabelService::new(&url, config::timeout(args.timeout_secs))
        .with_context(|| format!("cannot use label server {url}"))
}

fn command_info(args: InfoArgs) -> Result<()> {
    let service = connect(&args.server)?;
    let catalog = service.catalog().context("failed to fetch model catalog")?;

    let models: Vec<Value> = catalog
        .models
        .iter()
        .map(|(name, model)| json!({"name": name, "type": model.model_type}))
        .collect();
    let eligible: Vec<Value> = segmentation_models(&catalog)
        .into_iter()
        .map(|m| json!({"name": m.name, "type": m.model_type}))
        .collect();

    let payload = json!({
        "server": config::server_url(args.server.server.as_deref()),
        "models": models,
        "segmentation": eligible,
        "catalog": catalog.raw,
    });
    println!("{}", serde_json::to_string_pretty(&payload)?);
    Ok(())
}

fn command_export(args: ExportArgs) -> Result<()> {
    let objects = load_objects(&args.objects)?;
    let region = match args.selection.load()? {
        Some(shape) => match resolve_region(Some(&shape)) {
            Some(region) => region,
            None => {
                info!("selection is not a non-empty rectangle; nothing to export");
                return print_skipped("no rectangular region selected", args.json);
            }
        },
        None => Region::new(0, 0, 0, 0),
    };

    let Some(doc) = build_document(&objects, region) else {
        info!("no annotations inside region {region}");
        return print_skipped("no annotations inside region", args.json);
    };

    let path = match &args.out {
        Some(out) => {
            ensure_parent_dir(out)?;
            doc.save(out)
                .with_context(|| format!("failed to write annotations: {}", out.display()))?;
            out.clone()
        }
        None => {
            let dir = config::tmp_dir(args.tmp_dir.as_deref());
            doc.write_temp(&dir, &config::generate_name())
                .context("failed to write annotation document")?
                .keep()
                .map_err(|e| e.error)
                .context("failed to keep annotation document")?
        }
    };

    if args.json {
        let groups: Vec<Value> = doc
            .groups
            .iter()
            .map(|(name, color)| json!({"name": name, "color": color}))
            .collect();
        let payload = json!({
            "status": "written",
            "path": abs_path(&path).display().to_string(),
            "region": region,
            "annotations": doc.annotations.len(),
            "groups": groups,
            "generated_at": timestamp_iso(),
        });
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else {
        println!("{}", abs_path(&path).display());
    }
    Ok(())
}

fn command_segment(args: SegmentArgs) -> Result<()> {
    let objects: Vec<LabeledObject> = match &args.objects {
        Some(path) => load_objects(path)?,
        None => Vec::new(),
    };
    let selection = args.selection.load()?;

    let whole_slide = if args.wsi {
        true
    } else if args.simple {
        false
    } else {
        config::is_whole_slide(&args.image)
    };
    if !whole_slide && !args.image.exists() {
        anyhow::bail!("image not found: {}", args.image.display());
    }
    info!(
        whole_slide,
        file = %config::file_name(&args.image),
        "segmentation requested"
    );

    let service = connect(&args.server)?;
    let patches: Box<dyn PatchSource> = match &args.patch_image {
        Some(path) => Box::new(ImagePatchSource::new(path)),
        None if !config::is_whole_slide(&args.image) => {
            Box::new(ImagePatchSource::new(&args.image))
        }
        None => Box::new(PlaceholderPatchSource),
    };
    let mut chooser = chooser_for(&args);

    let export_name = config::generate_name();
    let tmp_dir = config::tmp_dir(args.tmp_dir.as_deref());
    let job = SegmentJob {
        source: &args.image,
        selection: selection.as_ref(),
        objects: &objects,
        whole_slide,
        export_name: export_name.clone(),
        tile_size: args.tile_size.unwrap_or(config::DEFAULT_TILE_SIZE),
        tmp_dir,
    };

    let outcome = match run_segmentation(&service, patches.as_ref(), chooser.as_mut(), &job) {
        Ok(outcome) => outcome,
        Err(err) => {
            error!(step = err.step(), "segmentation failed: {err}");
            return Err(err.into());
        }
    };

    let mut done = match outcome {
        Outcome::Skipped(reason) => return print_skipped(reason.as_str(), args.json),
        Outcome::Completed(done) => done,
    };

    let kept: Vec<PathBuf> = if args.keep_temp {
        done.keep_temp_files().context("failed to keep temp files")?
    } else {
        Vec::new()
    };

    let result_path = match &args.out {
        Some(out) => {
            write_result(out, &done.result)?;
            Some(abs_path(out).display().to_string())
        }
        None => None,
    };

    if args.json {
        let mut payload = json!({
            "status": "completed",
            "model": done.model,
            "region": done.region,
            "tile_size": done.tile_size,
            "whole_slide": whole_slide,
            "image": done.image,
            "staged": done.staged,
            "annotations": done.annotations,
            "export_name": export_name,
            "content_type": done.result.content_type,
            "result_path": result_path,
            "kept_files": kept.iter().map(|p| p.display().to_string()).collect::<Vec<_>>(),
            "generated_at": timestamp_iso(),
        });
        if result_path.is_none() {
            payload["result"] = json!(String::from_utf8_lossy(&done.result.body));
        }
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else if result_path.is_none() {
        let mut stdout = io::stdout().lock();
        stdout.write_all(&done.result.body)?;
        stdout.flush()?;
    } else if let Some(path) = result_path {
        println!("{path}");
    }
    Ok(())
}

fn chooser_for(args: &SegmentArgs) -> Box<dyn ModelChooser> {
    if args.model.is_some() || args.no_prompt || !io::stdin().is_terminal() {
        Box::new(PresetChooser {
            model: args.model.clone(),
            tile_size: args.tile_size,
        })
    } else {
        Box::new(PromptChooser::new(io::stdin().lock(), io::stderr()))
    }
}

fn print_skipped(reason: &str, as_json: bool) -> Result<()> {
    if as_json {
        println!(
            "{}",
            serde_json::to_string(&json!({"status": "skipped", "reason": reason}))?
        );
    }
    Ok(())
}

fn write_result(path: &Path, result: &InferenceResult) -> Result<()> {
    ensure_parent_dir(path)?;
    fs::write(path, &result.body)
        .with_context(|| format!("failed to write inference result: {}", path.display()))
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

fn abs_path(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    std::env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join(path)
}

fn timestamp_iso() -> String {
    Utc::now().to_rfc3339()
}
