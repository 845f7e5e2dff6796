//! Deterministic train/valid/test partitioning.
//!
//! The samples are shuffled with a `ChaCha8Rng` seeded from the caller's
//! seed, then carved in order: test first, validation from what remains,
//! the rest is train. Each carve takes `round(fraction * pool)` samples
//! (half away from zero), so identical inputs always give identical splits.

use plant_core::{DatasetSplit, Result, SampleRecord, SplitKind, SplitRatios};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::info;

/// The three disjoint partitions of one dataset
#[derive(Debug, Clone, PartialEq)]
pub struct SplitSet {
    pub train: DatasetSplit,
    pub valid: DatasetSplit,
    pub test: DatasetSplit,
}

impl SplitSet {
    pub fn get(&self, kind: SplitKind) -> &DatasetSplit {
        match kind {
            SplitKind::Train => &self.train,
            SplitKind::Valid => &self.valid,
            SplitKind::Test => &self.test,
        }
    }

    pub fn total(&self) -> usize {
        self.train.len() + self.valid.len() + self.test.len()
    }
}

/// Number of samples a `fraction` of `pool` maps to.
pub fn carve_count(fraction: f64, pool: usize) -> usize {
    ((fraction * pool as f64).round() as usize).min(pool)
}

/// Partitions `samples` into train/valid/test.
///
/// `valid_ratio` is relative to the whole dataset; it is carved from the
/// pool left after the test split as `valid_ratio / (1 - test_ratio)`.
/// Fails with `InvalidArgument` unless `0 < test_ratio < 1`,
/// `0 < valid_ratio < 1` and `test_ratio + valid_ratio < 1`.
pub fn partition(
    samples: &[SampleRecord],
    test_ratio: f64,
    valid_ratio: f64,
    seed: u64,
) -> Result<SplitSet> {
    let ratios = SplitRatios::new(test_ratio, valid_ratio);
    ratios.validate()?;

    let (train, valid, test) = partition_pool(samples.to_vec(), ratios, seed);
    let set = assemble(train, valid, test, ratios);

    info!(
        "Partitioned {} samples (seed {}): train={}, valid={}, test={}",
        samples.len(),
        seed,
        set.train.len(),
        set.valid.len(),
        set.test.len()
    );
    Ok(set)
}

/// Same carve as [`partition`], applied independently to each class.
///
/// Class `c` is shuffled with `seed + c`; per-class results are
/// concatenated in class-index order.
pub fn partition_stratified(
    samples: &[SampleRecord],
    num_classes: usize,
    test_ratio: f64,
    valid_ratio: f64,
    seed: u64,
) -> Result<SplitSet> {
    let ratios = SplitRatios::new(test_ratio, valid_ratio);
    ratios.validate()?;

    let mut by_class: Vec<Vec<SampleRecord>> = vec![Vec::new(); num_classes];
    for sample in samples {
        if sample.label >= num_classes {
            return Err(plant_core::Error::InvalidArgument(format!(
                "Sample {} has label {} but only {} classes exist",
                sample.path.display(),
                sample.label,
                num_classes
            )));
        }
        by_class[sample.label].push(sample.clone());
    }

    let (mut train, mut valid, mut test) = (Vec::new(), Vec::new(), Vec::new());
    for (class, pool) in by_class.into_iter().enumerate() {
        let (tr, va, te) = partition_pool(pool, ratios, seed.wrapping_add(class as u64));
        train.extend(tr);
        valid.extend(va);
        test.extend(te);
    }

    let set = assemble(train, valid, test, ratios);
    info!(
        "Stratified partition of {} samples over {} classes (seed {}): train={}, valid={}, test={}",
        samples.len(),
        num_classes,
        seed,
        set.train.len(),
        set.valid.len(),
        set.test.len()
    );
    Ok(set)
}

fn partition_pool(
    mut pool: Vec<SampleRecord>,
    ratios: SplitRatios,
    seed: u64,
) -> (Vec<SampleRecord>, Vec<SampleRecord>, Vec<SampleRecord>) {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    pool.shuffle(&mut rng);

    let n_test = carve_count(ratios.test, pool.len());
    let mut remaining = pool.split_off(n_test);
    let test = pool;

    let n_valid = carve_count(ratios.valid / (1.0 - ratios.test), remaining.len());
    let train = remaining.split_off(n_valid);
    let valid = remaining;

    (train, valid, test)
}

fn assemble(
    train: Vec<SampleRecord>,
    valid: Vec<SampleRecord>,
    test: Vec<SampleRecord>,
    ratios: SplitRatios,
) -> SplitSet {
    SplitSet {
        train: DatasetSplit::new(SplitKind::Train, train, ratios.train()),
        valid: DatasetSplit::new(SplitKind::Valid, valid, ratios.valid),
        test: DatasetSplit::new(SplitKind::Test, test, ratios.test),
    }
}
