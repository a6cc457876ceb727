use crate::{
    chunk_plan::{ChunkPlan, should_chunk},
    config::Config,
    engine::CompressionMode,
    pipeline::{CompressionJob, Pipeline},
    probe,
    telemetry::{NullSink, sink_from_config},
    util::{derive_job_id, ensure_dir},
};
use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "docshrink")]
#[command(about = "Tiered PDF compression orchestrator (external engines + chunking + regression guard)")]
pub struct Args {
    #[command(subcommand)]
    pub cmd: Command,

    /// Path to config TOML. If omitted, uses ./docshrink.toml if present, else built-in defaults.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Override log level (trace/debug/info/warn/error).
    #[arg(long)]
    pub log_level: Option<String>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ModeArg {
    Resize,
    Simple,
}

impl From<ModeArg> for CompressionMode {
    fn from(m: ModeArg) -> Self {
        match m {
            ModeArg::Resize => CompressionMode::Resize,
            ModeArg::Simple => CompressionMode::Simple,
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Report which compression engines are installed.
    Doctor {},
    /// Print the chunk plan for an input or a page count.
    Plan {
        #[arg(long, conflicts_with = "pages")]
        input: Option<PathBuf>,
        #[arg(long)]
        pages: Option<u32>,
    },
    /// Compress one or more files as a single job.
    Run {
        #[arg(long, required = true, num_args = 1..)]
        input: Vec<PathBuf>,
        #[arg(long, default_value_t = 60, value_parser = clap::value_parser!(u8).range(0..=100))]
        quality: u8,
        #[arg(long, value_enum, default_value_t = ModeArg::Resize)]
        mode: ModeArg,
        #[arg(long)]
        out_dir: Option<PathBuf>,
        #[arg(long)]
        job_id: Option<String>,
    },
}

pub fn dispatch(args: Args) -> Result<()> {
    let cfg = match resolve_config_path(args.config.as_deref()) {
        Some(path) => Config::load(&path)?,
        None => Config::default(),
    };
    let _guard = init_logging(&args, &cfg, resolve_log_path(&cfg).as_deref())?;

    match &args.cmd {
        Command::Doctor {} => doctor(&cfg),
        Command::Plan { input, pages } => plan(&cfg, input.as_deref(), *pages),
        Command::Run {
            input,
            quality,
            mode,
            out_dir,
            job_id,
        } => run(&cfg, input, *quality, (*mode).into(), out_dir.as_deref(), job_id.as_deref()),
    }
}

fn resolve_config_path(user: Option<&Path>) -> Option<PathBuf> {
    if let Some(p) = user {
        return Some(p.to_path_buf());
    }
    let default = PathBuf::from("docshrink.toml");
    default.exists().then_some(default)
}

fn init_logging(args: &Args, cfg: &Config, file_path: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let level = args
        .log_level
        .as_deref()
        .unwrap_or(cfg.logging.level.as_str());

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // stdout carries the JSON result; logs go to stderr.
    let stderr_layer = if cfg.logging.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_target(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .boxed()
    };

    let (file_layer, guard) = if let Some(path) = file_path {
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        ensure_dir(parent)?;
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open log file: {}", path.display()))?;
        let (non_blocking, guard) = tracing_appender::non_blocking(file);
        let layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false)
            .with_target(true)
            .boxed();
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| anyhow!("failed to init logging: {e}"))?;

    Ok(guard)
}

fn doctor(cfg: &Config) -> Result<()> {
    let pipeline = Pipeline::from_config(cfg, Arc::new(NullSink));
    let records: Vec<_> = pipeline
        .engines()
        .iter()
        .map(|engine| {
            let rec = pipeline.availability().get(engine.tool());
            serde_json::json!({
                "engine": engine.name(),
                "tool": rec.tool,
                "available": rec.available,
                "version": rec.version,
            })
        })
        .collect();
    println!("{}", serde_json::to_string_pretty(&records)?);
    Ok(())
}

fn plan(cfg: &Config, input: Option<&Path>, pages: Option<u32>) -> Result<()> {
    let page_count = match (input, pages) {
        (_, Some(n)) => n,
        (Some(path), None) => {
            let probe = probe::probe_input(path, cfg.timeouts.probe())
                .with_context(|| format!("probing input: {}", path.display()))?;
            if probe.page_count == 0 {
                warn!("page count of {} is unknown", path.display());
            }
            probe.page_count
        }
        (None, None) => return Err(anyhow!("either --input or --pages is required")),
    };
    let plan = ChunkPlan::from_config(cfg, page_count, Path::new(&cfg.paths.work_dir));
    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "page_count": page_count,
            "chunked": should_chunk(cfg, page_count),
            "plan": plan,
        }))?
    );
    Ok(())
}

fn run(
    cfg: &Config,
    inputs: &[PathBuf],
    quality: u8,
    mode: CompressionMode,
    out_override: Option<&Path>,
    job_id: Option<&str>,
) -> Result<()> {
    for input in inputs {
        validate_input(input)?;
    }

    let job_id = job_id
        .map(str::to_string)
        .unwrap_or_else(|| derive_job_id(inputs, quality));
    let out_dir = out_override
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(&cfg.paths.out_dir));

    let job = CompressionJob::new(&job_id, inputs.to_vec(), quality, &out_dir).with_mode(mode);
    info!("job_id={job_id} out={}", out_dir.display());

    let pipeline = Pipeline::from_config(cfg, sink_from_config(cfg));
    let outcome = pipeline
        .compress(&job)
        .with_context(|| format!("job {job_id} rejected"))?;

    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(())
}

fn validate_input(input: &Path) -> Result<()> {
    if looks_like_url(&input.display().to_string()) {
        return Err(anyhow!("URL inputs are not supported: {}", input.display()));
    }

    match input.extension().and_then(|s| s.to_str()) {
        Some(ext) if !ext.eq_ignore_ascii_case("pdf") => {
            warn!("input does not have a .pdf extension: {}", input.display());
        }
        None => warn!("input has no extension; assuming PDF: {}", input.display()),
        _ => {}
    }

    Ok(())
}

fn looks_like_url(s: &str) -> bool {
    let s = s.to_ascii_lowercase();
    s.starts_with("http://") || s.starts_with("https://") || s.starts_with("file://")
}

fn resolve_log_path(cfg: &Config) -> Option<PathBuf> {
    if !cfg.logging.write_to_file {
        return None;
    }

    if !cfg.logging.file_path.is_empty() {
        return Some(PathBuf::from(&cfg.logging.file_path));
    }

    Some(PathBuf::from(&cfg.paths.out_dir).join("docshrink.log"))
}
