//! On-disk split materialization.
//!
//! Copies a partitioned dataset into `{out}/{train,valid,test}/{class}/` and
//! reads such a layout back. Prepared layouts are handy for inspecting a
//! split and for reusing it across runs without re-partitioning.

use crate::catalog::{index_dataset, list_images, IndexedDataset};
use crate::split::SplitSet;
use plant_core::{ClassCatalog, DatasetSplit, Error, Result, SampleRecord, SplitKind};
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::{info, warn};

/// Per-split, per-class image counts
pub type SplitCounts = BTreeMap<SplitKind, BTreeMap<String, usize>>;

/// Copies every split into `out_dir/{split}/{class}/`.
///
/// A directory is created for every class in every split, even when the
/// split holds no image of that class. Returns the per-class counts that
/// were written.
pub fn materialize_splits(
    dataset: &IndexedDataset,
    splits: &SplitSet,
    out_dir: &Path,
) -> Result<SplitCounts> {
    let mut counts = SplitCounts::new();

    for kind in SplitKind::ALL {
        let split_dir = out_dir.join(kind.to_string());
        for (_, class_name) in dataset.catalog.iter() {
            fs::create_dir_all(split_dir.join(class_name))?;
        }

        let split = splits.get(kind);
        split.samples.par_iter().try_for_each(|sample| -> Result<()> {
            let class_name = dataset.catalog.name(sample.label).ok_or_else(|| {
                Error::InvalidArgument(format!("Unknown class index {}", sample.label))
            })?;
            let file_name = sample.path.file_name().ok_or_else(|| {
                Error::InvalidArgument(format!("Sample path has no file name: {}", sample.path.display()))
            })?;
            fs::copy(&sample.path, split_dir.join(class_name).join(file_name))?;
            Ok(())
        })?;

        let per_class = split
            .class_counts(dataset.catalog.len())
            .into_iter()
            .enumerate()
            .filter_map(|(idx, count)| dataset.catalog.name(idx).map(|n| (n.to_string(), count)))
            .collect();
        info!("Wrote {} {} images to {}", split.len(), kind, split_dir.display());
        counts.insert(kind, per_class);
    }

    Ok(counts)
}

/// Image count per class directory of one split directory.
pub fn count_images(split_dir: &Path) -> Result<BTreeMap<String, usize>> {
    if !split_dir.is_dir() {
        return Err(Error::NotFound(format!(
            "Split directory {} does not exist",
            split_dir.display()
        )));
    }

    let mut counts = BTreeMap::new();
    for entry in fs::read_dir(split_dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            let name = entry.file_name().to_string_lossy().to_string();
            counts.insert(name, list_images(&entry.path())?.len());
        }
    }
    Ok(counts)
}

/// Reads a prepared `{train,valid,test}` layout back.
///
/// The class catalog comes from the train directory. Valid and test labels
/// are remapped by class name; a class that only exists outside the train
/// split is an `InvalidArgument`.
pub fn load_prepared_splits(prepared_dir: &Path) -> Result<(ClassCatalog, SplitSet)> {
    let train = index_dataset(&prepared_dir.join(SplitKind::Train.to_string()))?;
    let catalog = train.catalog.clone();

    let valid = load_split_with_catalog(prepared_dir, SplitKind::Valid, &catalog)?;
    let test = load_split_with_catalog(prepared_dir, SplitKind::Test, &catalog)?;

    let total = (train.len() + valid.len() + test.len()).max(1) as f64;
    let (train_ratio, valid_ratio, test_ratio) = (
        train.len() as f64 / total,
        valid.len() as f64 / total,
        test.len() as f64 / total,
    );
    let set = SplitSet {
        train: DatasetSplit::new(SplitKind::Train, train.samples, train_ratio),
        valid: DatasetSplit::new(SplitKind::Valid, valid, valid_ratio),
        test: DatasetSplit::new(SplitKind::Test, test, test_ratio),
    };
    Ok((catalog, set))
}

fn load_split_with_catalog(
    prepared_dir: &Path,
    kind: SplitKind,
    catalog: &ClassCatalog,
) -> Result<Vec<SampleRecord>> {
    let dir = prepared_dir.join(kind.to_string());
    if !dir.is_dir() {
        warn!("Prepared layout has no {} directory", kind);
        return Ok(Vec::new());
    }

    let indexed = match index_dataset(&dir) {
        Ok(indexed) => indexed,
        Err(Error::NotFound(_)) => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    indexed
        .samples
        .into_iter()
        .map(|sample| {
            let name = indexed.catalog.name(sample.label).unwrap_or_default();
            let label = catalog.index_of(name).ok_or_else(|| {
                Error::InvalidArgument(format!(
                    "Class {name} appears in the {kind} split but not in train"
                ))
            })?;
            Ok(SampleRecord::new(sample.path, label))
        })
        .collect()
}
