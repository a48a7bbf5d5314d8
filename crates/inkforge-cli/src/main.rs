use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use inkforge_contracts::config::install_dir;
use inkforge_contracts::history::HISTORY_FILENAME;
use inkforge_contracts::{
    ConfigStore, CustomShape, HistoryLog, Mode, Rect, RequestForm, SourceImage,
};
use inkforge_engine::{CancelToken, CanvasInserter, Dispatcher, DocumentContext, ReplaceTarget};
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

const LOG_ENV: &str = "INKFORGE_LOG";
const DEFAULT_VIEWPORT: (f64, f64) = (1024.0, 1024.0);
const CANCEL_POLL: Duration = Duration::from_millis(250);

#[derive(Debug, Parser)]
#[command(name = "inkforge", version, about = "AI image generation for vector editors")]
struct Cli {
    /// Config file; defaults to config.json next to the executable.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Generate images from a host form and print where to place them.
    Run(RunArgs),
    /// List recorded generations.
    History(HistoryArgs),
    /// Show the effective configuration with secrets redacted.
    Config,
}

#[derive(Debug, Parser)]
struct RunArgs {
    /// Dialog form values as JSON.
    #[arg(long)]
    form: PathBuf,
    /// Selected image: path, file:// URI or data: URI.
    #[arg(long)]
    source: Option<String>,
    /// Document viewport as WxH.
    #[arg(long, value_parser = parse_viewport)]
    viewport: Option<(f64, f64)>,
    /// Selection bounding box as x,y,w,h.
    #[arg(long, value_parser = parse_selection)]
    selection: Option<Rect>,
    /// Host id of the selected image; edit results replace it in place.
    #[arg(long)]
    source_id: Option<String>,
    /// Document bounds of the selected image as x,y,w,h.
    #[arg(long, value_parser = parse_selection)]
    source_bounds: Option<Rect>,
    /// The request is cancelled as soon as this file exists.
    #[arg(long)]
    cancel_file: Option<PathBuf>,
    /// Selected shape bounds as l,t,r,b; repeatable.
    #[arg(long = "shape")]
    shapes: Vec<Rect>,
    /// Placements JSON destination; stdout when absent.
    #[arg(long)]
    out: Option<PathBuf>,
    #[arg(long)]
    history: Option<PathBuf>,
}

#[derive(Debug, Parser)]
struct HistoryArgs {
    #[arg(long)]
    history: Option<PathBuf>,
    /// Most recent entries to show.
    #[arg(long, default_value_t = 20)]
    limit: usize,
}

fn main() {
    init_tracing();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("inkforge error: {err:#}");
            std::process::exit(1);
        }
    }
}

/// Logs go to stderr so stdout stays machine-readable for the host.
fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let store = cli
        .config
        .clone()
        .map(ConfigStore::new)
        .unwrap_or_else(ConfigStore::beside_executable);
    match cli.command {
        Command::Run(args) => run_generate(&store, args),
        Command::History(args) => {
            let log = HistoryLog::new(history_path(args.history));
            show_history(&log, args.limit, &mut io::stdout().lock())?;
            Ok(0)
        }
        Command::Config => {
            show_config(&store, &mut io::stdout().lock())?;
            Ok(0)
        }
    }
}

fn run_generate(store: &ConfigStore, args: RunArgs) -> Result<i32> {
    let config = store.load();
    let form = read_form(&args.form)?;
    let mut request = form
        .to_request(&config)
        .map_err(anyhow::Error::msg)
        .context("invalid form")?;

    if let Some(source) = args.source.as_deref().map(str::trim) {
        if !source.is_empty() {
            request.source_image = Some(SourceImage::Reference(source.to_string()));
        }
    }
    let mut document = document_context(args.viewport, args.selection);
    if request.mode == Mode::Edit {
        document.replace =
            replace_target(args.source_id.clone(), args.source_bounds, args.selection);
    }
    if form.use_selection_as_mask {
        request.mask_shape = mask_shape(&args.shapes, &document);
        if request.mask_shape.is_none() {
            tracing::warn!("selection mask requested but no shapes were passed; using mask mode");
        }
    }
    let placement = form.placement(&config);
    let keys = form.key_input();

    let mut dispatcher = Dispatcher::new(config).context("failed to set up provider clients")?;
    if form.records_history() {
        dispatcher = dispatcher.with_history(HistoryLog::new(history_path(args.history)));
    }
    let cancel = CancelToken::new();
    let _watch = args
        .cancel_file
        .clone()
        .map(|path| CancelWatch::spawn(path, cancel.clone()));
    let result = dispatcher.dispatch(request, &keys, &cancel)?;
    let placed = CanvasInserter::place(&result, &placement, &document)?;

    let report = json!({
        "provider": result.provider,
        "model": result.model_used,
        "seed": result.seed_used,
        "images": placed,
    });
    write_report(args.out.as_deref(), &report)?;
    Ok(0)
}

fn read_form(path: &Path) -> Result<RequestForm> {
    let raw =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("failed to parse {}", path.display()))
}

fn history_path(explicit: Option<PathBuf>) -> PathBuf {
    explicit.unwrap_or_else(|| install_dir().join(HISTORY_FILENAME))
}

fn document_context(viewport: Option<(f64, f64)>, selection: Option<Rect>) -> DocumentContext {
    let (width, height) = viewport.unwrap_or(DEFAULT_VIEWPORT);
    DocumentContext {
        selection,
        ..DocumentContext::new(width, height)
    }
}

/// Edit results go back into the selected image when the host names it.
fn replace_target(
    id: Option<String>,
    bounds: Option<Rect>,
    selection: Option<Rect>,
) -> Option<ReplaceTarget> {
    let id = id.map(|id| id.trim().to_string()).filter(|id| !id.is_empty());
    let Some(id) = id else {
        tracing::warn!("no --source-id for edit; result will be added as a new image");
        return None;
    };
    match bounds.or(selection) {
        Some(bounds) => Some(ReplaceTarget { id, bounds }),
        None => {
            tracing::warn!(
                id = %id,
                "no bounds for source image; result will be added as a new image"
            );
            None
        }
    }
}

/// Background poll for the host's cancel file. Stops when dropped.
struct CancelWatch {
    done: Arc<AtomicBool>,
}

impl CancelWatch {
    fn spawn(path: PathBuf, token: CancelToken) -> Self {
        let done = Arc::new(AtomicBool::new(false));
        let finished = done.clone();
        thread::spawn(move || {
            while !finished.load(Ordering::SeqCst) {
                if path.exists() {
                    tracing::info!(path = %path.display(), "cancel requested");
                    token.cancel();
                    return;
                }
                thread::sleep(CANCEL_POLL);
            }
        });
        Self { done }
    }
}

impl Drop for CancelWatch {
    fn drop(&mut self) {
        self.done.store(true, Ordering::SeqCst);
    }
}

fn mask_shape(shapes: &[Rect], document: &DocumentContext) -> Option<CustomShape> {
    if shapes.is_empty() {
        return None;
    }
    Some(CustomShape {
        regions: shapes.to_vec(),
        viewport_width: document.viewport_width,
        viewport_height: document.viewport_height,
    })
}

fn write_report(out: Option<&Path>, report: &Value) -> Result<()> {
    let text = serde_json::to_string_pretty(report)?;
    match out {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
                fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
            fs::write(path, text + "\n")
                .with_context(|| format!("failed to write {}", path.display()))?;
        }
        None => {
            let mut stdout = io::stdout().lock();
            writeln!(stdout, "{text}")?;
        }
    }
    Ok(())
}

fn show_history(log: &HistoryLog, limit: usize, out: &mut impl Write) -> Result<()> {
    let entries = log.entries()?;
    if entries.is_empty() {
        writeln!(out, "No history at {}", log.path().display())?;
        return Ok(());
    }
    let skip = entries.len().saturating_sub(limit);
    for entry in entries.iter().skip(skip) {
        let status = if entry.success {
            format!("ok x{}", entry.image_count)
        } else {
            format!("failed ({})", entry.error_kind.as_deref().unwrap_or("unknown"))
        };
        writeln!(
            out,
            "{}  {:<9} {:<9} {:<16} {}",
            entry.timestamp,
            entry.provider.to_string(),
            entry.mode.to_string(),
            status,
            entry.prompt
        )?;
    }
    Ok(())
}

fn show_config(store: &ConfigStore, out: &mut impl Write) -> Result<()> {
    let config = store.try_load().unwrap_or_else(|err| {
        tracing::warn!(error = %err, "failed to load config; showing defaults");
        Default::default()
    });
    writeln!(out, "# {}", store.path().display())?;
    writeln!(out, "{}", serde_json::to_string_pretty(&config.redacted())?)?;
    Ok(())
}

fn parse_viewport(raw: &str) -> Result<(f64, f64)> {
    let Some((width, height)) = raw.trim().split_once(['x', 'X']) else {
        bail!("expected WxH, got '{raw}'");
    };
    let width: f64 = width.trim().parse().context("invalid viewport width")?;
    let height: f64 = height.trim().parse().context("invalid viewport height")?;
    if width <= 0.0 || height <= 0.0 {
        bail!("viewport must be positive, got {width}x{height}");
    }
    Ok((width, height))
}

fn parse_selection(raw: &str) -> Result<Rect> {
    let values = raw
        .split(',')
        .map(|part| part.trim().parse::<f64>())
        .collect::<std::result::Result<Vec<_>, _>>()
        .with_context(|| format!("invalid selection '{raw}'"))?;
    match values.as_slice() {
        [x, y, w, h] if *w >= 0.0 && *h >= 0.0 => Ok(Rect::new(*x, *y, x + w, y + h)),
        _ => bail!("expected x,y,w,h with non-negative size, got '{raw}'"),
    }
}
