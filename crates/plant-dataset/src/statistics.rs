//! Dataset statistics computation.

use crate::catalog::IndexedDataset;
use plant_core::Result;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::warn;

/// Dataset statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetStatistics {
    pub num_samples: usize,
    pub num_classes: usize,
    /// Image count per class name
    pub class_distribution: BTreeMap<String, usize>,
    /// Mean `(width, height)` over readable images
    pub mean_image_size: (u32, u32),
    pub min_image_size: (u32, u32),
    pub max_image_size: (u32, u32),
    /// Files whose header could not be read
    pub unreadable: usize,
}

impl DatasetStatistics {
    /// Largest over smallest class count; `None` for an empty dataset.
    pub fn imbalance_ratio(&self) -> Option<f64> {
        let max = self.class_distribution.values().copied().max()?;
        let min = self.class_distribution.values().copied().min()?;
        (min > 0).then(|| max as f64 / min as f64)
    }
}

/// Collects class counts and image sizes.
///
/// Only image headers are read, in parallel. Unreadable files are counted
/// and otherwise ignored.
pub fn compute_statistics(dataset: &IndexedDataset) -> Result<DatasetStatistics> {
    let class_distribution = dataset
        .class_counts()
        .into_iter()
        .enumerate()
        .filter_map(|(idx, count)| dataset.catalog.name(idx).map(|n| (n.to_string(), count)))
        .collect();

    let sizes: Vec<Option<(u32, u32)>> = dataset
        .samples
        .par_iter()
        .map(|sample| match image::image_dimensions(&sample.path) {
            Ok(dims) => Some(dims),
            Err(e) => {
                warn!("Cannot read {}: {e}", sample.path.display());
                None
            }
        })
        .collect();

    let readable: Vec<(u32, u32)> = sizes.iter().flatten().copied().collect();
    let unreadable = sizes.len() - readable.len();

    let (mean_image_size, min_image_size, max_image_size) = if readable.is_empty() {
        ((0, 0), (0, 0), (0, 0))
    } else {
        let n = readable.len() as u64;
        let sum_w: u64 = readable.iter().map(|(w, _)| *w as u64).sum();
        let sum_h: u64 = readable.iter().map(|(_, h)| *h as u64).sum();
        let min = readable
            .iter()
            .fold((u32::MAX, u32::MAX), |acc, (w, h)| (acc.0.min(*w), acc.1.min(*h)));
        let max = readable
            .iter()
            .fold((0, 0), |acc, (w, h)| (acc.0.max(*w), acc.1.max(*h)));
        (((sum_w / n) as u32, (sum_h / n) as u32), min, max)
    };

    Ok(DatasetStatistics {
        num_samples: dataset.len(),
        num_classes: dataset.catalog.len(),
        class_distribution,
        mean_image_size,
        min_image_size,
        max_image_size,
        unreadable,
    })
}
