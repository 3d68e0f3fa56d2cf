use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use curator_contracts::catalog::{AssetCategory, AssetDescriptor, Catalog, CatalogFilter, Priority};
use curator_engine::pricing::PricingTables;
use curator_engine::refine::RefinementSession;
use curator_engine::runner::ModelChoice;
use curator_engine::{
    segment, BackgroundKind, BudgetPolicy, CurationEngine, Quality, RunConfig, RunPlan,
    SegmentationOptions,
};

const DRYRUN_IMAGE_MODEL: &str = "dryrun-image-1";
const DRYRUN_VISION_MODEL: &str = "dryrun-vision-1";
const EXIT_BUDGET_HALTED: i32 = 2;

#[derive(Debug, Parser)]
#[command(
    name = "curator-rs",
    version,
    about = "Generate, segment and review catalog art assets"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Refine every selected catalog asset until approved or out of budget.
    Run(RunArgs),
    /// Show sizes, segmentation and worst-case cost without calling any service.
    Plan(PlanArgs),
    /// Remove a flat background from existing PNGs.
    Segment(SegmentArgs),
}

#[derive(Debug, Args)]
struct SelectionArgs {
    #[arg(long)]
    catalog: PathBuf,
    /// Asset id to include (repeatable).
    #[arg(long = "id")]
    ids: Vec<String>,
    #[arg(long = "category")]
    categories: Vec<String>,
    #[arg(long = "priority")]
    priorities: Vec<String>,
}

#[derive(Debug, Args)]
struct BudgetArgs {
    #[arg(long, default_value_t = curator_engine::config::DEFAULT_MAX_ITERATIONS)]
    max_iterations: u32,
    /// Spend ceiling in USD for the whole run.
    #[arg(long, default_value_t = curator_engine::config::DEFAULT_BUDGET_LIMIT_USD)]
    budget: f64,
    #[arg(long, default_value = "medium")]
    quality: String,
    #[arg(long)]
    image_model: Option<String>,
    #[arg(long)]
    vision_model: Option<String>,
    /// Use the offline dry-run generator and reviewer.
    #[arg(long)]
    dry_run: bool,
    /// Override the per-image generation price in USD.
    #[arg(long)]
    generation_cost: Option<f64>,
    /// Override the per-call review price in USD.
    #[arg(long)]
    review_cost: Option<f64>,
}

#[derive(Debug, Args)]
struct SegmentFlags {
    #[arg(long)]
    tolerance: Option<u8>,
    /// Segment even when the background is neither white nor black.
    #[arg(long)]
    force: bool,
    #[arg(long, default_value_t = 1)]
    seed_stride: u32,
    /// Keep the full canvas instead of trimming to content.
    #[arg(long)]
    no_trim: bool,
    #[arg(long, default_value_t = 0)]
    margin: u32,
    /// Background hint: white, black or auto.
    #[arg(long, default_value = "auto")]
    background: String,
}

#[derive(Debug, Parser)]
struct RunArgs {
    #[command(flatten)]
    selection: SelectionArgs,
    #[command(flatten)]
    budget: BudgetArgs,
    #[command(flatten)]
    segmentation: SegmentFlags,
    #[arg(long)]
    out: PathBuf,
    /// Seconds between consecutive calls of the same kind.
    #[arg(long, default_value_t = 2.0)]
    call_delay: f64,
    /// HTTP timeout in seconds.
    #[arg(long, default_value_t = 120)]
    timeout: u64,
    #[arg(long, default_value_t = 1)]
    workers: usize,
    /// `run` stops scheduling assets once the budget is hit; `session` only
    /// ends the session that hit it.
    #[arg(long, default_value = "run")]
    budget_policy: String,
}

#[derive(Debug, Parser)]
struct PlanArgs {
    #[command(flatten)]
    selection: SelectionArgs,
    #[command(flatten)]
    budget: BudgetArgs,
    /// Print the plan as JSON.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Parser)]
struct SegmentArgs {
    /// Input PNG, or the directory to process with --batch.
    input: PathBuf,
    /// Output path; defaults to overwriting the input.
    output: Option<PathBuf>,
    /// Process every PNG in the input directory in place.
    #[arg(long)]
    batch: bool,
    #[command(flatten)]
    flags: SegmentFlags,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("curator-rs error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => run_batch(args),
        Command::Plan(args) => run_plan(args),
        Command::Segment(args) => run_segment(args),
    }
}

fn run_batch(args: RunArgs) -> Result<i32> {
    let (catalog, assets) = load_selection(&args.selection)?;
    let config = run_config(&args)?;
    let choice = ModelChoice::resolve(&config, &PricingTables::load())?;
    let mut engine = CurationEngine::new(config, choice, &catalog)?;

    println!(
        "Run {}: {} asset(s), limit ${:.2}",
        engine.run_id(),
        assets.len(),
        engine.ledger().limit_usd()
    );
    let sessions = engine.run(&assets);
    for session in &sessions {
        println!("{}", session_line(session));
    }
    let summary = engine.finish()?;
    println!("{}", summary.headline());
    println!("Summary: {}", engine.store().summary_path().display());

    if summary.budget_exceeded {
        eprintln!("Budget limit reached; remaining work was not attempted.");
        return Ok(EXIT_BUDGET_HALTED);
    }
    Ok(0)
}

fn run_plan(args: PlanArgs) -> Result<i32> {
    let (_, assets) = load_selection(&args.selection)?;
    let mut config = RunConfig::new(PathBuf::new());
    apply_budget_args(&mut config, &args.budget)?;
    config.validate()?;
    let choice = ModelChoice::resolve(&config, &PricingTables::load())?;
    let plan = choice.plan(&config, &assets);

    if args.json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
    } else {
        print!("{}", render_plan(&plan));
    }
    Ok(0)
}

fn run_segment(args: SegmentArgs) -> Result<i32> {
    let options = segmentation_options(&args.flags)?;
    if args.batch {
        let (success, failed) = segment_directory(&args.input, &options)?;
        println!("\nCompleted: {success} success, {failed} failed");
        return Ok(if failed > 0 { 1 } else { 0 });
    }
    if !args.input.is_file() {
        bail!("file not found: {}", args.input.display());
    }
    let output = args.output.unwrap_or_else(|| args.input.clone());
    segment_file(&args.input, &output, &options)?;
    Ok(0)
}

fn load_selection(args: &SelectionArgs) -> Result<(Catalog, Vec<AssetDescriptor>)> {
    let catalog = Catalog::load(&args.catalog)
        .with_context(|| format!("failed to load catalog {}", args.catalog.display()))?;
    let filter = CatalogFilter {
        ids: args
            .ids
            .iter()
            .flat_map(|value| value.split(','))
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
            .collect(),
        categories: args
            .categories
            .iter()
            .map(|value| {
                AssetCategory::parse(value)
                    .with_context(|| format!("unknown category '{value}'"))
            })
            .collect::<Result<Vec<_>>>()?,
        priorities: args
            .priorities
            .iter()
            .map(|value| {
                Priority::parse(value).with_context(|| format!("unknown priority '{value}'"))
            })
            .collect::<Result<Vec<_>>>()?,
    };
    let assets = catalog.select(&filter)?;
    if assets.is_empty() {
        bail!("no catalog assets match the selection");
    }
    Ok((catalog, assets))
}

fn apply_budget_args(config: &mut RunConfig, args: &BudgetArgs) -> Result<()> {
    config.max_iterations = args.max_iterations;
    config.budget_limit_usd = args.budget;
    config.quality = Quality::parse(&args.quality)
        .with_context(|| format!("unknown quality '{}'", args.quality))?;
    config.generation_cost_usd = args.generation_cost;
    config.review_cost_usd = args.review_cost;
    if args.dry_run {
        config.image_model = Some(
            args.image_model
                .clone()
                .unwrap_or_else(|| DRYRUN_IMAGE_MODEL.to_string()),
        );
        config.vision_model = Some(
            args.vision_model
                .clone()
                .unwrap_or_else(|| DRYRUN_VISION_MODEL.to_string()),
        );
    } else {
        config.image_model = args.image_model.clone();
        config.vision_model = args.vision_model.clone();
    }
    Ok(())
}

fn run_config(args: &RunArgs) -> Result<RunConfig> {
    let mut config = RunConfig::new(&args.out);
    apply_budget_args(&mut config, &args.budget)?;
    if !args.call_delay.is_finite() || args.call_delay < 0.0 {
        bail!("call delay must be a non-negative number of seconds");
    }
    config.call_delay = Duration::from_secs_f64(args.call_delay);
    config.request_timeout = Duration::from_secs(args.timeout);
    config.workers = args.workers;
    config.budget_policy = BudgetPolicy::parse(&args.budget_policy)
        .with_context(|| format!("unknown budget policy '{}'", args.budget_policy))?;
    config.segmentation = segmentation_options(&args.segmentation)?;
    config.validate()?;
    Ok(config)
}

fn segmentation_options(flags: &SegmentFlags) -> Result<SegmentationOptions> {
    let hint = match BackgroundKind::parse(&flags.background) {
        Some(BackgroundKind::Indeterminate) => None,
        Some(kind) => Some(kind),
        None => bail!(
            "unknown background '{}'; expected white, black or auto",
            flags.background
        ),
    };
    if flags.seed_stride == 0 {
        bail!("seed stride must be at least 1");
    }
    Ok(SegmentationOptions {
        tolerance: flags.tolerance,
        force: flags.force,
        seed_stride: flags.seed_stride,
        trim: !flags.no_trim,
        margin: flags.margin,
        hint,
    })
}

fn segment_file(input: &Path, output: &Path, options: &SegmentationOptions) -> Result<()> {
    println!(
        "Processing: {}",
        input
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default()
    );
    let source = image::open(input)
        .with_context(|| format!("failed to open {}", input.display()))?
        .to_rgba8();
    let result = segment(&source, options)?;
    println!(
        "  Background: {} (tolerance {}), removed {:.1}%",
        result.background_kind.as_str(),
        result.tolerance,
        result.removed_fraction * 100.0
    );
    if options.trim {
        println!(
            "  Trimmed: {}x{} -> {}x{}",
            result.source_width,
            result.source_height,
            result.image.width(),
            result.image.height()
        );
    }
    if let Some(parent) = output.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    result
        .image
        .save_with_format(output, image::ImageFormat::Png)
        .with_context(|| format!("failed to save {}", output.display()))?;
    println!("  Saved: {}", output.display());
    Ok(())
}

/// Segments every `*.png` in `directory` in place, continuing past failures.
fn segment_directory(directory: &Path, options: &SegmentationOptions) -> Result<(usize, usize)> {
    let mut files: Vec<PathBuf> = fs::read_dir(directory)
        .with_context(|| format!("failed to read {}", directory.display()))?
        .filter_map(|entry| entry.ok().map(|entry| entry.path()))
        .filter(|path| {
            path.is_file()
                && path
                    .extension()
                    .map(|ext| ext.eq_ignore_ascii_case("png"))
                    .unwrap_or(false)
        })
        .collect();
    files.sort();
    println!("Found {} PNG files in {}\n", files.len(), directory.display());

    let mut success = 0;
    let mut failed = 0;
    for path in files {
        match segment_file(&path, &path, options) {
            Ok(()) => success += 1,
            Err(err) => {
                println!("  Error: {err:#}");
                failed += 1;
            }
        }
        println!();
    }
    Ok((success, failed))
}

fn session_line(session: &RefinementSession) -> String {
    let mut line = format!(
        "{:<24} {:<9} iterations {}/{}  ${:.3}",
        session.asset.id,
        session.state.as_str(),
        session.iteration,
        session.max_iterations,
        session.spent_usd
    );
    if let Some(review) = session.last_review() {
        line.push_str(&format!("  score {}", review.overall_score));
    }
    if let Some(reason) = session.terminal_reason.as_deref() {
        line.push_str(&format!("  ({reason})"));
    }
    line
}

fn render_plan(plan: &RunPlan) -> String {
    let mut out = format!(
        "Models: {} / {} (quality {}), up to {} iteration(s) per asset\n",
        plan.image_model, plan.vision_model, plan.quality, plan.max_iterations
    );
    out.push_str(&format!(
        "Unit costs: generation ${:.4}, review ${:.4}\n\n",
        plan.generation_cost_usd, plan.review_cost_usd
    ));
    for asset in &plan.assets {
        out.push_str(&format!(
            "{:<24} {:<16} {:<6} {:<10} {:<11} ${:.4}\n",
            asset.id,
            asset.category,
            asset.priority,
            asset.size,
            if asset.segmented { "segmented" } else { "opaque" },
            asset.worst_case_usd
        ));
    }
    out.push_str(&format!(
        "\nWorst case ${:.4} against a ${:.2} limit: {}\n",
        plan.total_worst_case_usd,
        plan.limit_usd,
        if plan.fits_limit { "fits" } else { "may stop early" }
    ));
    out
}
