//! Training driver for the plant disease classifier.
//!
//! Indexes a class-per-directory dataset (or a prepared train/valid/test
//! layout), partitions it, trains the CNN with plateau scheduling and early
//! stopping, and finally evaluates the best checkpoint on the test split.
//!
//! Usage:
//!   train --data-dir data/plantvillage --save-dir models --epochs 30
//!   train --config train.toml --resume

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use plant_core::{
    load_toml_config, setup_cli_logging, ClassCatalog, DatasetSplit, DeviceType, Error,
    ImageDimensions, TrainingConfig, TrainingHistory,
};
use plant_dataset::{
    index_dataset, load_prepared_splits, partition, partition_stratified, BatchSource,
    LazyImageLoader, LoaderConfig, SplitSet,
};
use plant_training::model::select_device;
use plant_training::{
    build_classifier, CheckpointStore, CheckpointTag, ClassifierConfig, EpochOutcome, TrainBackend,
    Trainer, TrainerConfig, TrainingReport, MIN_INPUT_SIZE,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Copy of the effective configuration written next to the checkpoints
const CONFIG_SNAPSHOT: &str = "training_config.toml";

#[derive(Parser, Debug)]
#[command(name = "train")]
#[command(about = "Train a plant disease classifier", long_about = None)]
struct Args {
    /// TOML configuration file; flags below override its values
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Dataset root with one subdirectory per class
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Treat --data-dir as a prepared train/valid/test layout
    #[arg(long)]
    prepared: bool,

    /// Directory receiving checkpoints, history and the class mapping
    #[arg(short, long)]
    save_dir: Option<PathBuf>,

    /// Number of epochs
    #[arg(short, long)]
    epochs: Option<usize>,

    /// Batch size
    #[arg(short, long)]
    batch_size: Option<usize>,

    /// Initial learning rate
    #[arg(long)]
    learning_rate: Option<f64>,

    /// Decode threads for the prefetching loader (0 = synchronous)
    #[arg(long)]
    num_workers: Option<usize>,

    /// Early stopping patience in epochs
    #[arg(long)]
    patience: Option<usize>,

    /// Square input size in pixels
    #[arg(long)]
    image_size: Option<u32>,

    /// Device: cpu, cuda or auto
    #[arg(long)]
    device: Option<DeviceType>,

    /// Seed for splitting, shuffling and augmentation
    #[arg(long)]
    seed: Option<u64>,

    /// Disable training-split augmentation
    #[arg(long)]
    no_augmentation: bool,

    /// Continue from the latest checkpoint in the save directory
    #[arg(long)]
    resume: bool,

    /// Print the configuration and exit
    #[arg(long)]
    dry_run: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();

    if let Err(e) = setup_cli_logging(args.verbose) {
        eprintln!("{e}");
        return ExitCode::FAILURE;
    }

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{}: {:#}", error_kind(&err), err);
            ExitCode::FAILURE
        }
    }
}

/// Kind of the innermost library error, if the chain carries one
fn error_kind(err: &anyhow::Error) -> &'static str {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<Error>())
        .map_or("Error", Error::kind)
}

fn run(args: &Args) -> Result<()> {
    info!("Plant disease classifier training");

    let mut config = match &args.config {
        Some(path) => {
            info!("Loading configuration from {}", path.display());
            load_toml_config::<TrainingConfig>(path)?
        }
        None => TrainingConfig::default(),
    };
    apply_overrides(&mut config, args);
    validate_config(&config)?;
    print_config_summary(&config, args);

    if args.dry_run {
        info!("Dry run, exiting");
        return Ok(());
    }

    let (catalog, splits) = build_splits(&config, args.prepared)?;
    let store = CheckpointStore::new(&config.output.save_dir);
    check_class_mapping(&store, &catalog, args.resume)?;
    if args.resume {
        check_resume_config(&config, args.prepared)?;
    }
    store
        .save_class_mapping(&catalog)
        .context("Failed to save class mapping")?;
    save_config_snapshot(&config)?;

    let train_loader = build_loader(&config, splits.train, config.data.shuffle)?;
    let valid_loader = if splits.valid.is_empty() {
        warn!("Validation split is empty");
        None
    } else {
        Some(build_loader(&config, splits.valid, false)?)
    };
    let test_split = splits.test;

    let device = select_device(config.device);
    let classifier_config = ClassifierConfig::new(catalog.len());
    let model = build_classifier::<TrainBackend>(
        &classifier_config,
        config.training.weight_decay,
        device,
    );

    let trainer_config = TrainerConfig::from(&config);
    let trainer = if args.resume {
        Trainer::resume(model, trainer_config, CheckpointTag::Latest)
            .context("Failed to resume from the latest checkpoint")?
    } else {
        Trainer::new(model, trainer_config)?
    };

    let stop = Arc::new(AtomicBool::new(false));
    let handler_flag = Arc::clone(&stop);
    ctrlc::set_handler(move || {
        warn!("Interrupt received, stopping after the current epoch");
        handler_flag.store(true, Ordering::SeqCst);
    })
    .context("Failed to install Ctrl-C handler")?;
    let mut trainer = trainer.with_stop_flag(stop);

    let report = run_training(&mut trainer, &train_loader, valid_loader.as_ref())?;
    print_report(&report, &trainer.state().history, &config);

    if report.outcome == EpochOutcome::Interrupted {
        info!("Run interrupted; continue it with --resume");
        return Ok(());
    }

    if test_split.is_empty() {
        warn!("Test split is empty, skipping evaluation");
        return Ok(());
    }

    if store.exists(CheckpointTag::Best) {
        trainer
            .restore_parameters(CheckpointTag::Best)
            .context("Failed to load the best checkpoint")?;
    }
    let test_loader = build_loader(&config, test_split, false)?;
    evaluate_test_split(&mut trainer, &test_loader, &catalog)?;

    Ok(())
}

fn apply_overrides(config: &mut TrainingConfig, args: &Args) {
    if let Some(ref data_dir) = args.data_dir {
        config.data.data_dir = data_dir.clone();
    }
    if let Some(ref save_dir) = args.save_dir {
        config.output.save_dir = save_dir.clone();
    }
    if let Some(epochs) = args.epochs {
        config.training.num_epochs = epochs;
    }
    if let Some(batch_size) = args.batch_size {
        config.training.batch_size = batch_size;
    }
    if let Some(lr) = args.learning_rate {
        config.training.learning_rate = lr;
    }
    if let Some(workers) = args.num_workers {
        config.data.num_workers = workers;
    }
    if let Some(patience) = args.patience {
        config.training.early_stopping_patience = patience;
    }
    if let Some(size) = args.image_size {
        config.data.image_size = ImageDimensions::new(size, size);
    }
    if let Some(device) = args.device {
        config.device = device;
    }
    if let Some(seed) = args.seed {
        config.seed = seed;
    }
    if args.no_augmentation {
        config.augmentation.enabled = false;
    }
}

fn validate_config(config: &TrainingConfig) -> Result<()> {
    config.validate().context("Invalid configuration")?;

    let size = config.data.image_size;
    if size.width < MIN_INPUT_SIZE || size.height < MIN_INPUT_SIZE {
        return Err(Error::InvalidArgument(format!(
            "Image size {}x{} is below the model minimum of {MIN_INPUT_SIZE}",
            size.width, size.height
        ))
        .into());
    }

    if !config.data.data_dir.is_dir() {
        return Err(Error::NotFound(format!(
            "Dataset directory {}",
            config.data.data_dir.display()
        ))
        .into());
    }

    Ok(())
}

fn print_config_summary(config: &TrainingConfig, args: &Args) {
    info!("");
    info!("Configuration Summary:");
    info!("  Data dir: {}", config.data.data_dir.display());
    info!("  Prepared layout: {}", args.prepared);
    info!("  Save dir: {}", config.output.save_dir.display());
    info!(
        "  Image size: {}x{}",
        config.data.image_size.width, config.data.image_size.height
    );
    info!(
        "  Split: test={}, valid={}, stratified={}",
        config.data.split.test, config.data.split.valid, config.data.stratified
    );
    info!("  Epochs: {}", config.training.num_epochs);
    info!("  Batch size: {}", config.training.batch_size);
    info!("  Learning rate: {}", config.training.learning_rate);
    info!("  Weight decay: {}", config.training.weight_decay);
    info!("  Early stopping patience: {}", config.training.early_stopping_patience);
    info!(
        "  Plateau scheduler: factor={}, patience={}, min_lr={}",
        config.scheduler.factor, config.scheduler.patience, config.scheduler.min_lr
    );
    info!("  Augmentation: {}", config.augmentation.enabled);
    info!(
        "  Workers: {} (prefetch {})",
        config.data.num_workers, config.data.prefetch_batches
    );
    info!("  Device: {}", config.device);
    info!("  Seed: {}", config.seed);
    info!("  Resume: {}", args.resume);
    info!("");
}

fn build_splits(config: &TrainingConfig, prepared: bool) -> Result<(ClassCatalog, SplitSet)> {
    let data_dir = &config.data.data_dir;

    if prepared {
        info!("Loading prepared splits from {}", data_dir.display());
        return load_prepared_splits(data_dir)
            .with_context(|| format!("Failed to load prepared splits from {}", data_dir.display()));
    }

    info!("Indexing dataset at {}", data_dir.display());
    let dataset = index_dataset(data_dir)
        .with_context(|| format!("Failed to index dataset at {}", data_dir.display()))?;
    info!(
        "Found {} images in {} classes",
        dataset.len(),
        dataset.catalog.len()
    );

    let ratios = config.data.split;
    let splits = if config.data.stratified {
        partition_stratified(
            &dataset.samples,
            dataset.catalog.len(),
            ratios.test,
            ratios.valid,
            config.seed,
        )?
    } else {
        partition(&dataset.samples, ratios.test, ratios.valid, config.seed)?
    };

    Ok((dataset.catalog, splits))
}

/// A resumed run must see the same classes in the same order.
fn check_class_mapping(store: &CheckpointStore, catalog: &ClassCatalog, resume: bool) -> Result<()> {
    if !resume {
        return Ok(());
    }
    let stored = store
        .load_class_mapping()
        .context("Cannot resume without the class mapping of the previous run")?;
    if stored.names() != catalog.names() {
        return Err(Error::InvalidArgument(format!(
            "Dataset classes changed since the previous run ({} stored, {} found)",
            stored.len(),
            catalog.len()
        ))
        .into());
    }
    Ok(())
}

/// Settings that decide which sample lands in which split must not change
/// between a run and its resumption.
fn check_resume_config(config: &TrainingConfig, prepared: bool) -> Result<()> {
    let path = config.output.save_dir.join(CONFIG_SNAPSHOT);
    let previous = match load_toml_config::<TrainingConfig>(&path) {
        Ok(previous) => previous,
        Err(Error::NotFound(_)) => {
            warn!("No {} in the save directory, cannot compare split settings", CONFIG_SNAPSHOT);
            return Ok(());
        }
        Err(e) => return Err(e).context("Failed to read the previous configuration"),
    };

    let mut changed = Vec::new();
    if previous.seed != config.seed {
        changed.push(format!("seed {} -> {}", previous.seed, config.seed));
    }
    if previous.data.image_size != config.data.image_size {
        changed.push("image size".to_string());
    }
    if !prepared {
        if previous.data.split != config.data.split {
            changed.push("split ratios".to_string());
        }
        if previous.data.stratified != config.data.stratified {
            changed.push("stratified".to_string());
        }
    }

    if !changed.is_empty() {
        return Err(Error::InvalidArgument(format!(
            "Cannot resume with different data settings: {}",
            changed.join(", ")
        ))
        .into());
    }
    Ok(())
}

fn save_config_snapshot(config: &TrainingConfig) -> Result<()> {
    let path = config.output.save_dir.join(CONFIG_SNAPSHOT);
    let content = toml::to_string_pretty(config).context("Failed to serialize configuration")?;
    std::fs::write(&path, content)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

fn build_loader(
    config: &TrainingConfig,
    split: DatasetSplit,
    shuffle: bool,
) -> Result<LazyImageLoader> {
    let kind = split.kind;
    let loader_config = LoaderConfig::new(config.data.image_size, config.training.batch_size)
        .with_shuffle(shuffle, config.seed)
        .with_workers(config.data.num_workers, config.data.prefetch_batches)
        .with_augmentation(config.augmentation.clone());

    let loader = LazyImageLoader::new(split, loader_config)
        .with_context(|| format!("Failed to create {kind} loader"))?;
    info!(
        "{} loader: {} samples, {} batches, augmented={}",
        kind,
        loader.len(),
        loader.num_batches(),
        loader.is_augmented()
    );
    Ok(loader)
}

fn run_training<M: plant_training::TrainableModel>(
    trainer: &mut Trainer<M>,
    train_loader: &LazyImageLoader,
    valid_loader: Option<&LazyImageLoader>,
) -> Result<TrainingReport> {
    let num_epochs = trainer.config().num_epochs as u64;
    let progress = ProgressBar::new(num_epochs);
    progress.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} epochs ({eta}) {msg}")
            .context("Invalid progress bar template")?
            .progress_chars("=>-"),
    );
    progress.set_position(trainer.state().epoch as u64);

    let valid = valid_loader.map(|loader| loader as &dyn BatchSource);
    let report = trainer
        .fit_with(train_loader, valid, |epoch| {
            progress.set_position(epoch.epoch as u64);
            let valid_acc = epoch
                .valid
                .map_or_else(|| "n/a".to_string(), |m| format!("{:.2}%", m.accuracy * 100.0));
            progress.set_message(format!(
                "loss {:.4}, valid acc {}, lr {:.2e}",
                epoch.train.loss, valid_acc, epoch.learning_rate
            ));
        })
        .context("Training failed")?;

    progress.finish_with_message(format!("{:?}", report.outcome));
    Ok(report)
}

fn print_report(report: &TrainingReport, history: &TrainingHistory, config: &TrainingConfig) {
    info!("");
    info!("Training finished: {:?}", report.outcome);
    info!("  Epochs run: {} ({} in total)", report.epochs.len(), history.epochs());
    match (history.best_valid_acc(), history.best_epoch()) {
        (Some(acc), Some(epoch)) => {
            info!("  Best validation accuracy: {:.2}% (epoch {})", acc * 100.0, epoch)
        }
        _ => info!("  Best validation accuracy: n/a"),
    }
    if !report.best_epochs.is_empty() {
        info!("  New best at epochs: {:?}", report.best_epochs);
    }
    let skipped = report.skipped_samples();
    if skipped > 0 {
        warn!("  Skipped {} unreadable training samples", skipped);
    }
    info!("  Artifacts in {}", config.output.save_dir.display());
}

fn evaluate_test_split<M: plant_training::TrainableModel>(
    trainer: &mut Trainer<M>,
    test_loader: &LazyImageLoader,
    catalog: &ClassCatalog,
) -> Result<()> {
    info!("Evaluating on {} test samples", test_loader.len());
    let metrics = trainer
        .evaluate(test_loader, catalog.len())
        .context("Test evaluation failed")?;

    info!(
        "Test accuracy: {:.2}% (loss {:.4}, {} samples)",
        metrics.accuracy * 100.0,
        metrics.loss,
        metrics.num_samples
    );
    for (idx, acc) in metrics.per_class_accuracy().into_iter().enumerate() {
        if let (Some(acc), Some(name)) = (acc, catalog.name(idx)) {
            info!("  {:<40} {:.2}%", name, acc * 100.0);
        }
    }
    Ok(())
}
