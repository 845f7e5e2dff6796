//! Dataset indexing: class discovery and image enumeration.
//!
//! Expected layout is one subdirectory per class under the dataset root:
//!
//! ```text
//! root/
//!   Apple___scab/
//!     0001.jpg
//!   Tomato___healthy/
//!     0001.png
//! ```
//!
//! Class directories and the files inside them are visited in sorted
//! file-name order, so indexing the same tree twice yields the same catalog
//! and the same sample sequence.

use plant_core::{ClassCatalog, Error, Result, SampleRecord};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Recognized image extensions (compared case-insensitively)
pub const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

pub fn is_image_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext = ext.to_ascii_lowercase();
            IMAGE_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}

/// Result of indexing a dataset root
#[derive(Debug, Clone)]
pub struct IndexedDataset {
    pub root: PathBuf,
    pub catalog: ClassCatalog,
    pub samples: Vec<SampleRecord>,
}

impl IndexedDataset {
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Number of images per class index.
    pub fn class_counts(&self) -> Vec<usize> {
        let mut counts = vec![0; self.catalog.len()];
        for sample in &self.samples {
            counts[sample.label] += 1;
        }
        counts
    }
}

/// Sorted image files directly inside `dir`.
pub fn list_images(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut images = Vec::new();
    for entry in WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
    {
        let entry = entry.map_err(|e| Error::Io(e.into()))?;
        if entry.file_type().is_file() && is_image_file(entry.path()) {
            images.push(entry.into_path());
        }
    }
    Ok(images)
}

/// Sorted class directories directly inside `root`, hidden ones excluded.
fn list_class_dirs(root: &Path) -> Result<Vec<(String, PathBuf)>> {
    let mut dirs = Vec::new();
    for entry in WalkDir::new(root)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
    {
        let entry = entry.map_err(|e| Error::Io(e.into()))?;
        if !entry.file_type().is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with('.') {
            continue;
        }
        dirs.push((name, entry.into_path()));
    }
    Ok(dirs)
}

/// Discovers classes under `root` and enumerates their images.
///
/// Subdirectories without a recognized image are skipped and get no class
/// index. Fails with `NotFound` if `root` does not exist or no subdirectory
/// holds an image.
pub fn index_dataset(root: &Path) -> Result<IndexedDataset> {
    if !root.is_dir() {
        return Err(Error::NotFound(format!(
            "Dataset root {} does not exist or is not a directory",
            root.display()
        )));
    }

    let mut classes = Vec::new();
    for (name, dir) in list_class_dirs(root)? {
        let images = list_images(&dir)?;
        if images.is_empty() {
            warn!("Skipping class directory without images: {}", dir.display());
            continue;
        }
        debug!("Class {}: {} images", name, images.len());
        classes.push((name, images));
    }

    if classes.is_empty() {
        return Err(Error::NotFound(format!(
            "No class directory with images ({}) under {}",
            IMAGE_EXTENSIONS.join("/"),
            root.display()
        )));
    }

    let catalog = ClassCatalog::new(classes.iter().map(|(name, _)| name.clone()))?;

    let mut samples = Vec::new();
    for (name, images) in classes {
        let label = catalog
            .index_of(&name)
            .ok_or_else(|| Error::NotFound(format!("Class {name} missing from catalog")))?;
        samples.extend(images.into_iter().map(|path| SampleRecord::new(path, label)));
    }
    samples.sort_by_key(|s| s.label);

    info!(
        "Indexed {} images in {} classes under {}",
        samples.len(),
        catalog.len(),
        root.display()
    );

    Ok(IndexedDataset {
        root: root.to_path_buf(),
        catalog,
        samples,
    })
}
