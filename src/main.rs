use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use negctl::index::{self, DatasetIndex, INDEX_FILENAME};
use negctl::negative_control::NegativeControl;
use negctl::nifti_io::NiftiLoader;
use negctl::pairing;
use negctl::pipeline::RunConfig;
use negctl::progress::BarProgress;
use negctl::template::FilenameTemplate;
use negctl::writer::{DEFAULT_FILENAME_FORMAT, ExistingFileMode};

#[derive(Parser)]
#[command(name = "negctl")]
#[command(about = "Radiomics negative-control generator for CT/RTSTRUCT cohorts")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output (debug logging)
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Convert a DICOM cohort to NIfTI and generate negative controls
    Run(RunArgs),
    /// Rebuild the dataset index of an existing output directory
    Index(IndexArgs),
    /// List the image/mask pairs of an indexed output directory
    Pairs(PairsArgs),
}

#[derive(Args)]
struct RunArgs {
    /// Input path: DICOM directory or ZIP archive
    #[arg(value_name = "INPUT")]
    input: PathBuf,

    /// Output directory for NIfTI files and the index
    #[arg(short, long)]
    output: PathBuf,

    /// Modalities every patient must have
    #[arg(short, long, value_delimiter = ',', default_value = "CT,RTSTRUCT")]
    modalities: Vec<String>,

    /// ROI to extract, as NAME=PATTERN[,PATTERN...]
    #[arg(short, long)]
    roi: String,

    /// Negative controls to generate (defaults to all of them)
    #[arg(short = 'n', long, value_delimiter = ',')]
    negative_controls: Vec<String>,

    /// Seed for every randomized negative control
    #[arg(short, long, default_value = "10")]
    seed: u64,

    /// Output path template, relative to the output directory
    #[arg(short, long, default_value = DEFAULT_FILENAME_FORMAT)]
    template: String,

    /// Replace files that already exist
    #[arg(long, conflicts_with = "skip_existing")]
    overwrite: bool,

    /// Keep files that already exist
    #[arg(long)]
    skip_existing: bool,

    /// Rescan the input even if a cached discovery exists
    #[arg(long)]
    update: bool,

    /// Worker threads for scanning (defaults to CPU count)
    #[arg(short, long)]
    jobs: Option<usize>,

    /// Maximum recursion depth for directory scanning
    #[arg(long, default_value = "10")]
    max_depth: usize,

    /// Use field values in paths as-is
    #[arg(long)]
    no_sanitize: bool,
}

#[derive(Args)]
struct IndexArgs {
    /// Output directory of a previous run
    #[arg(value_name = "DIR")]
    dir: PathBuf,

    /// Template the directory was written with
    #[arg(short, long, default_value = DEFAULT_FILENAME_FORMAT)]
    template: String,
}

#[derive(Args)]
struct PairsArgs {
    /// Output directory of a previous run
    #[arg(value_name = "DIR")]
    dir: PathBuf,

    /// Index file inside DIR
    #[arg(long, default_value = INDEX_FILENAME)]
    index: String,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with_target(false)
        .init();

    match cli.command {
        Command::Run(args) => run(args),
        Command::Index(args) => rebuild_index(&args),
        Command::Pairs(args) => list_pairs(&args),
    }
}

fn run(args: RunArgs) -> Result<()> {
    let existing_file_mode = if args.overwrite {
        ExistingFileMode::Overwrite
    } else if args.skip_existing {
        ExistingFileMode::Skip
    } else {
        ExistingFileMode::Fail
    };
    let negative_controls = if args.negative_controls.is_empty() {
        NegativeControl::ALL.iter().map(ToString::to_string).collect()
    } else {
        args.negative_controls
    };
    let n_jobs = args
        .jobs
        .unwrap_or_else(|| std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1));

    let config = RunConfig {
        input_dir: args.input,
        output_dir: args.output,
        modalities: args.modalities,
        roi: args.roi,
        negative_controls,
        random_seed: args.seed,
        filename_format: args.template,
        existing_file_mode,
        update_index: args.update,
        n_jobs,
        max_depth: args.max_depth,
        sanitize_filenames: !args.no_sanitize,
    };
    debug!(config = %serde_json::to_string(&config)?, "run configuration");

    if !config.input_dir.exists() {
        bail!("Input path {} does not exist", config.input_dir.display());
    }

    let csv_path = config
        .execute()
        .with_context(|| format!("Negative-control run over {} failed", config.input_dir.display()))?;
    let dataset = DatasetIndex::read_csv(&csv_path).context("Failed to re-read the dataset index")?;
    print_summary(&dataset, &csv_path);
    Ok(())
}

fn rebuild_index(args: &IndexArgs) -> Result<()> {
    let template = FilenameTemplate::parse(&args.template)?;
    let csv_path = index::rebuild_index_csv(&args.dir, &template)
        .with_context(|| format!("Failed to index {}", args.dir.display()))?;
    let dataset = DatasetIndex::read_csv(&csv_path)?;
    print_summary(&dataset, &csv_path);
    Ok(())
}

fn list_pairs(args: &PairsArgs) -> Result<()> {
    let loader = NiftiLoader;
    let mut progress = BarProgress::new();
    let pairs = pairing::generate_image_mask_pairs(&args.dir, &args.index, &loader, &mut progress)
        .with_context(|| format!("Failed to open {}", args.dir.join(&args.index).display()))?;

    let total = pairs.len();
    let mut rows = Vec::with_capacity(total);
    for subject in pairs {
        let subject = subject?;
        rows.push(format!(
            "{}\t{}\t{}\t{:?}",
            subject.patient_id,
            subject.image_id,
            subject.mask_id,
            subject.image.shape()
        ));
    }
    info!(pairs = total, "pairing complete");
    for row in rows {
        println!("{row}");
    }
    Ok(())
}

fn print_summary(dataset: &DatasetIndex, csv_path: &Path) {
    let mut patients = BTreeMap::<&str, usize>::new();
    let mut modalities = BTreeMap::<&str, usize>::new();
    for record in &dataset.records {
        *patients.entry(record.patient_id()).or_default() += 1;
        *modalities.entry(record.modality()).or_default() += 1;
    }

    println!("\nProcessing Summary:");
    println!("   Index: {}", csv_path.display());
    println!("   Total images: {}", dataset.len());
    println!("   Patients: {}", patients.len());
    println!("   Unique modalities: {}", modalities.len());
    for (modality, count) in &modalities {
        println!("     - {modality}: {count}");
    }
}
