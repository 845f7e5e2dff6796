//! Plant dataset indexing, splitting and loading library.
//!
//! This crate discovers class directories, partitions the samples into
//! train/valid/test, and serves lazily decoded (optionally augmented)
//! batches to the trainer.

pub mod augmentation;
pub mod catalog;
pub mod loader;
pub mod prepare;
pub mod preprocess;
pub mod split;
pub mod statistics;

pub use augmentation::AugmentationPipeline;
pub use catalog::{index_dataset, is_image_file, IndexedDataset, IMAGE_EXTENSIONS};
pub use loader::{Batch, BatchSource, EpochBatches, LazyImageLoader, LoaderConfig};
pub use prepare::{count_images, load_prepared_splits, materialize_splits, SplitCounts};
pub use preprocess::{ImagePreprocessor, ImageTensor, IMAGENET_MEAN, IMAGENET_STD};
pub use split::{partition, partition_stratified, SplitSet};
pub use statistics::{compute_statistics, DatasetStatistics};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::catalog::*;
    pub use crate::loader::*;
    pub use crate::preprocess::*;
    pub use crate::split::*;
}
