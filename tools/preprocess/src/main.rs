//! Dataset preparation tool for plant disease images.
//!
//! Subcommands:
//! - `split`: partition a class-per-directory dataset and copy it into a
//!   `train/valid/test` layout the training driver can load with `--prepared`
//! - `analyze`: class distribution and image size statistics

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use plant_core::{setup_cli_logging, SplitKind, SplitRatios};
use plant_dataset::{
    compute_statistics, count_images, index_dataset, materialize_splits, partition,
    partition_stratified, DatasetStatistics, SplitCounts,
};
use serde_json::json;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "preprocess")]
#[command(about = "Dataset preparation tool for plant disease images", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Number of parallel workers (default: num_cpus)
    #[arg(short, long, global = true)]
    workers: Option<usize>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Split dataset into train/valid/test directories
    Split {
        /// Data directory containing class folders
        #[arg(short, long)]
        data_dir: PathBuf,

        /// Output directory for splits
        #[arg(short, long)]
        output_dir: PathBuf,

        /// Test set ratio of the whole dataset
        #[arg(long, default_value_t = SplitRatios::default().test)]
        test_ratio: f64,

        /// Validation set ratio of the whole dataset
        #[arg(long, default_value_t = SplitRatios::default().valid)]
        valid_ratio: f64,

        /// Random seed for reproducibility
        #[arg(long, default_value = "42")]
        seed: u64,

        /// Partition the whole pool instead of each class separately
        #[arg(long)]
        no_stratify: bool,
    },

    /// Analyze dataset and generate statistics
    Analyze {
        /// Data directory to analyze
        #[arg(short, long)]
        data_dir: PathBuf,

        /// Treat the directory as a prepared train/valid/test layout
        #[arg(long)]
        prepared: bool,

        /// Output file for statistics (JSON)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_cli_logging(cli.verbose)?;

    if let Some(n) = cli.workers {
        rayon::ThreadPoolBuilder::new()
            .num_threads(n)
            .build_global()
            .context("Failed to set thread pool size")?;
    }

    match cli.command {
        Commands::Split {
            data_dir,
            output_dir,
            test_ratio,
            valid_ratio,
            seed,
            no_stratify,
        } => {
            split_dataset(
                &data_dir,
                &output_dir,
                SplitRatios::new(test_ratio, valid_ratio),
                seed,
                !no_stratify,
            )?;
        }

        Commands::Analyze {
            data_dir,
            prepared,
            output,
        } => {
            if prepared {
                analyze_prepared(&data_dir, output.as_deref())?;
            } else {
                analyze_dataset(&data_dir, output.as_deref())?;
            }
        }
    }

    Ok(())
}

fn spinner(message: &str) -> Result<ProgressBar> {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} [{elapsed_precise}] {msg}")
            .context("Invalid progress template")?,
    );
    pb.set_message(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(120));
    Ok(pb)
}

/// Split dataset into train/valid/test directories
fn split_dataset(
    data_dir: &Path,
    output_dir: &Path,
    ratios: SplitRatios,
    seed: u64,
    stratified: bool,
) -> Result<SplitCounts> {
    ratios.validate().context("Invalid split ratios")?;
    info!("Splitting dataset from {:?} to {:?}", data_dir, output_dir);
    info!(
        "Ratios: train={:.2}, valid={:.2}, test={:.2} (stratified: {})",
        ratios.train(),
        ratios.valid,
        ratios.test,
        stratified
    );

    let dataset = index_dataset(data_dir)
        .with_context(|| format!("Failed to index {}", data_dir.display()))?;
    info!(
        "Found {} images in {} classes",
        dataset.len(),
        dataset.catalog.len()
    );

    let splits = if stratified {
        partition_stratified(
            &dataset.samples,
            dataset.catalog.len(),
            ratios.test,
            ratios.valid,
            seed,
        )?
    } else {
        partition(&dataset.samples, ratios.test, ratios.valid, seed)?
    };

    let pb = spinner(&format!("Copying {} images", splits.total()))?;
    let counts = materialize_splits(&dataset, &splits, output_dir)
        .with_context(|| format!("Failed to write splits to {}", output_dir.display()))?;
    pb.finish_with_message("Splits written");

    for (kind, per_class) in &counts {
        let total: usize = per_class.values().sum();
        info!("  {:<6} {:>7} images", kind.to_string(), total);
    }

    let summary_path = output_dir.join("split_info.json");
    let summary = json!({
        "source": data_dir,
        "seed": seed,
        "stratified": stratified,
        "test_ratio": ratios.test,
        "valid_ratio": ratios.valid,
        "classes": dataset.catalog.names(),
        "counts": counts_by_name(&counts),
    });
    fs::write(&summary_path, serde_json::to_string_pretty(&summary)?)
        .with_context(|| format!("Failed to write {}", summary_path.display()))?;
    info!("Split info saved to {:?}", summary_path);

    Ok(counts)
}

fn counts_by_name(counts: &SplitCounts) -> BTreeMap<String, &BTreeMap<String, usize>> {
    counts
        .iter()
        .map(|(kind, per_class)| (kind.to_string(), per_class))
        .collect()
}

/// Analyze a class-per-directory dataset
fn analyze_dataset(data_dir: &Path, output: Option<&Path>) -> Result<DatasetStatistics> {
    info!("Analyzing dataset at {:?}", data_dir);

    let dataset = index_dataset(data_dir)
        .with_context(|| format!("Failed to index {}", data_dir.display()))?;

    let pb = spinner(&format!("Reading {} image headers", dataset.len()))?;
    let stats = compute_statistics(&dataset)?;
    pb.finish_and_clear();

    info!("");
    info!("Dataset Statistics:");
    info!("  Total images: {}", stats.num_samples);
    info!("  Classes: {}", stats.num_classes);
    info!(
        "  Image size: mean {}x{}, min {}x{}, max {}x{}",
        stats.mean_image_size.0,
        stats.mean_image_size.1,
        stats.min_image_size.0,
        stats.min_image_size.1,
        stats.max_image_size.0,
        stats.max_image_size.1
    );
    if let Some(ratio) = stats.imbalance_ratio() {
        info!("  Imbalance ratio: {:.2}", ratio);
    }
    if stats.unreadable > 0 {
        warn!("  Unreadable images: {}", stats.unreadable);
    }
    info!("");
    info!("Class Distribution:");
    for (class, count) in &stats.class_distribution {
        let pct = 100.0 * *count as f64 / stats.num_samples.max(1) as f64;
        info!("  {:<45} {:>6} ({:>5.1}%)", class, count, pct);
    }

    if let Some(path) = output {
        fs::write(path, serde_json::to_string_pretty(&stats)?)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        info!("Statistics saved to {:?}", path);
    }

    Ok(stats)
}

/// Per-split class counts of a prepared layout
fn analyze_prepared(prepared_dir: &Path, output: Option<&Path>) -> Result<SplitCounts> {
    info!("Analyzing prepared splits at {:?}", prepared_dir);

    let mut counts = SplitCounts::new();
    for kind in SplitKind::ALL {
        let split_dir = prepared_dir.join(kind.to_string());
        if !split_dir.is_dir() {
            warn!("No {} directory", kind);
            continue;
        }
        let per_class = count_images(&split_dir)?;
        let total: usize = per_class.values().sum();
        info!("  {:<6} {:>7} images in {} classes", kind.to_string(), total, per_class.len());
        counts.insert(kind, per_class);
    }

    if let Some(path) = output {
        fs::write(path, serde_json::to_string_pretty(&counts_by_name(&counts))?)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        info!("Counts saved to {:?}", path);
    }

    Ok(counts)
}
