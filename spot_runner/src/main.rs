use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use spot_counter::core_modules::discovery::{
    FilenamePattern, sample_directories, survey_image_counts,
};
use spot_counter::core_modules::palette_seed::{DEFAULT_ITERATIONS, kmeans_palette};
use spot_counter::pipeline::decode;
use spot_counter::preprocess::{
    TreeReport, band_pass, subtract_reference, transform_tree, unused_destination,
};
use spot_counter::{BatchEngine, BatchSettings, SpotConfig, SpotCounter};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "spot-counter", version, about = "Counts coloured spots in sample photographs")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Count every photograph that has no result yet and update the progress file.
    Detect(DetectArgs),
    /// Print the per-category counts of one photograph.
    Count {
        config: PathBuf,
        image: PathBuf,
        /// Print a JSON object instead of one line per category.
        #[arg(long)]
        json: bool,
    },
    /// Write every intermediate image of one photograph as PNG.
    Inspect {
        config: PathBuf,
        image: PathBuf,
        #[arg(long, default_value = "inspection")]
        out: PathBuf,
    },
    /// Write a starting profile.
    InitConfig(InitArgs),
    /// Band-pass every photograph of a sample tree into a new tree.
    FilterBackground {
        inner_sigma: f32,
        outer_sigma: f32,
        #[arg(long, default_value = ".")]
        source: PathBuf,
        /// Defaults to the first free `filtered` folder inside the source.
        #[arg(long)]
        dest: Option<PathBuf>,
    },
    /// Subtract a dark reference frame from every photograph of a sample tree.
    RemoveHotPixels {
        reference: PathBuf,
        source: PathBuf,
        #[arg(long, conflicts_with = "name")]
        dest: Option<PathBuf>,
        /// Name of the new folder inside the source.
        #[arg(long)]
        name: Option<String>,
    },
    /// Report sample folders whose image count differs from the depth count.
    Survey(RunLocation),
}

/// Where the photographs are. Omitted values come from the profile's defaults.
#[derive(Args)]
struct RunLocation {
    config: PathBuf,
    #[arg(long)]
    image_dir: Option<PathBuf>,
    /// Depth values, in column order. Repeat the flag for each depth.
    #[arg(long = "depth")]
    depths: Vec<String>,
}

#[derive(Args)]
struct InitArgs {
    path: PathBuf,
    /// Category names, in order.
    #[arg(long = "name", required_unless_present = "from_image")]
    names: Vec<String>,
    /// Cluster this photograph into the starting palette.
    #[arg(long)]
    from_image: Option<PathBuf>,
    /// Number of shades to cluster, background included.
    #[arg(long, default_value_t = 4)]
    k: usize,
    #[arg(long)]
    force: bool,
}

#[derive(Args)]
struct DetectArgs {
    #[command(flatten)]
    location: RunLocation,
    #[arg(long)]
    csv: Option<PathBuf>,
    /// Filename template; `$value` stands for the depth.
    #[arg(long)]
    pattern: Option<String>,
    #[arg(long)]
    workers: Option<usize>,
    /// Pause between worker starts, in milliseconds.
    #[arg(long, default_value_t = 2500)]
    stagger_ms: u64,
    #[arg(long, default_value_t = 1000)]
    poll_ms: u64,
}

fn main() -> Result<()> {
    // --- 1. Logging ---
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // --- 2. Dispatch ---
    match Cli::parse().command {
        Command::Detect(args) => detect(args),
        Command::Count { config, image, json } => count(&config, &image, json),
        Command::Inspect { config, image, out } => inspect(&config, &image, &out),
        Command::InitConfig(args) => init_config(args),
        Command::Survey(location) => survey(location),
        Command::FilterBackground {
            inner_sigma,
            outer_sigma,
            source,
            dest,
        } => filter_background(inner_sigma, outer_sigma, &source, dest),
        Command::RemoveHotPixels {
            reference,
            source,
            dest,
            name,
        } => remove_hot_pixels(&reference, &source, dest, name),
    }
}

fn load_config(path: &Path) -> Result<SpotConfig> {
    SpotConfig::from_path(path).with_context(|| format!("loading profile {}", path.display()))
}

/// Image root and depths, falling back to the profile's defaults.
fn resolve_location(
    location: &RunLocation,
    config: &SpotConfig,
) -> Result<(PathBuf, Vec<String>)> {
    let image_dir = location
        .image_dir
        .clone()
        .or_else(|| config.defaults.image_dir.clone())
        .context("no image directory given and none in the profile defaults")?;
    let depths = if location.depths.is_empty() {
        config.defaults.depths.clone()
    } else {
        location.depths.clone()
    };
    if depths.is_empty() {
        bail!("no depths given and none in the profile defaults");
    }
    Ok((image_dir, depths))
}

fn detect(args: DetectArgs) -> Result<()> {
    let config = load_config(&args.location.config)?;
    let profile = config.validate().context("invalid profile")?;
    let (image_dir, depths) = resolve_location(&args.location, &config)?;

    let template = args
        .pattern
        .or_else(|| config.defaults.regex.clone())
        .context("no filename pattern given and none in the profile defaults")?;
    let pattern = FilenamePattern::new(template)?;

    let mut settings = BatchSettings::new(&image_dir, depths, pattern)
        .with_stagger(Duration::from_millis(args.stagger_ms))
        .with_poll_interval(Duration::from_millis(args.poll_ms));
    if let Some(csv) = args.csv.or_else(|| config.defaults.csv_path.clone()) {
        settings = settings.with_progress_path(csv);
    }
    if let Some(workers) = args.workers {
        settings = settings.with_workers(workers);
    }

    info!(
        root = %image_dir.display(),
        progress = %settings.progress_path.display(),
        categories = profile.category_count(),
        "starting detection"
    );
    let report = BatchEngine::new(profile, settings)
        .run()
        .with_context(|| format!("batch over {}", image_dir.display()))?;

    // --- 3. Summary ---
    println!(
        "{}: {} recorded, {} already done, {} failed, {} lost",
        report.progress_path.display(),
        report.recorded,
        report.already_done,
        report.failed.len(),
        report.lost()
    );
    for issue in &report.issues {
        println!("  {issue}");
    }
    for (element, reason) in &report.failed {
        println!("  failed {}: {reason}", element.path.display());
    }
    Ok(())
}

fn count(config: &Path, image: &Path, json: bool) -> Result<()> {
    let profile = load_config(config)?.validate().context("invalid profile")?;
    let photo = decode(image)?;
    let counter = SpotCounter::new(profile);
    let counts = counter.count(&photo);

    let names = &counter.profile().names;
    if json {
        let map: BTreeMap<&str, u64> = names.iter().map(String::as_str).zip(counts).collect();
        println!("{}", serde_json::to_string_pretty(&map)?);
    } else {
        for (name, count) in names.iter().zip(counts) {
            println!("{name}\t{count}");
        }
    }
    Ok(())
}

fn inspect(config: &Path, image: &Path, out: &Path) -> Result<()> {
    let profile = load_config(config)?.validate().context("invalid profile")?;
    let photo = decode(image)?;
    std::fs::create_dir_all(out).with_context(|| format!("creating {}", out.display()))?;

    let counter = SpotCounter::new(profile);
    let inspection = counter.inspect(&photo);
    for path in inspection.save_to(out, counter.profile())? {
        println!("wrote {}", path.display());
    }
    for (name, count) in counter.profile().names.iter().zip(&inspection.counts) {
        println!("{name}\t{count}");
    }
    Ok(())
}

fn init_config(args: InitArgs) -> Result<()> {
    let path = &args.path;
    if path.exists() && !args.force {
        bail!("{} already exists, pass --force to overwrite it", path.display());
    }
    let config = match &args.from_image {
        Some(image) => {
            let photo = decode(image)?;
            info!(image = %image.display(), k = args.k, "clustering reference photograph");
            let palette = kmeans_palette(&photo, args.k, DEFAULT_ITERATIONS);
            let mut config = SpotConfig::from_palette(&args.names, &palette)
                .with_context(|| format!("clustering {}", image.display()))?;
            config.reference_image = Some(image.clone());
            config
        }
        None => SpotConfig::prepopulated(&args.names),
    };
    config.write_to(path)?;
    println!("wrote {}", path.display());
    for row in &config.color_data.table {
        println!("  shade {:?} -> category {}", &row[..3], row[3]);
    }
    Ok(())
}

fn print_tree_report(report: &TreeReport) {
    println!(
        "{}: {} written, {} skipped",
        report.destination.display(),
        report.written.len(),
        report.failed.len()
    );
    for (path, reason) in &report.failed {
        println!("  skipped {}: {reason}", path.display());
    }
}

fn filter_background(
    inner_sigma: f32,
    outer_sigma: f32,
    source: &Path,
    dest: Option<PathBuf>,
) -> Result<()> {
    if !(0.0 <= inner_sigma && inner_sigma < outer_sigma) {
        bail!("sigmas must satisfy 0 <= inner < outer, got {inner_sigma} and {outer_sigma}");
    }
    let destination = match dest {
        Some(dest) => dest,
        None => unused_destination(source, "filtered")?,
    };
    let report = transform_tree(source, &destination, |image| {
        Ok(band_pass(image, inner_sigma, outer_sigma))
    })?;
    print_tree_report(&report);
    Ok(())
}

fn remove_hot_pixels(
    reference: &Path,
    source: &Path,
    dest: Option<PathBuf>,
    name: Option<String>,
) -> Result<()> {
    let dark = decode(reference).context("reading the reference frame")?;
    let destination = match (dest, name) {
        (Some(dest), _) => dest,
        (None, Some(name)) => {
            let valid = name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
            if name.is_empty() || !valid {
                bail!("folder name must be non-empty letters, digits, `-` or `_`, got `{name}`");
            }
            source.join(name)
        }
        (None, None) => unused_destination(source, "modified")?,
    };
    let report = transform_tree(source, &destination, |image| subtract_reference(image, &dark))?;
    print_tree_report(&report);
    Ok(())
}

fn survey(location: RunLocation) -> Result<()> {
    let config = load_config(&location.config)?;
    let (image_dir, depths) = resolve_location(&location, &config)?;
    let folders = sample_directories(&image_dir)?;
    let mismatched = survey_image_counts(&folders, depths.len());

    println!("{} sample folders, {} depths", folders.len(), depths.len());
    for (sample, count) in &mismatched {
        println!("  {sample}: {count} images");
    }
    if mismatched.is_empty() {
        println!("every folder has one image per depth");
    }
    Ok(())
}
