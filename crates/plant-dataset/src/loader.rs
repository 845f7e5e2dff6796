//! Lazy, restartable batch loading.
//!
//! A [`LazyImageLoader`] owns one split and hands out one finite batch
//! sequence per epoch. Nothing is decoded until a batch is pulled.
//!
//! Randomness is derived from `(seed, epoch)` for the shuffle order and from
//! `(seed, epoch, sample position)` for augmentation, so a traversal yields
//! the same batches whether it runs synchronously or through the prefetch
//! pool.
//!
//! A sample that fails to decode is logged, counted in [`Batch::skipped`]
//! and left out of its batch. It never ends the traversal.

use crate::augmentation::AugmentationPipeline;
use crate::preprocess::{ImagePreprocessor, ImageTensor};
use crossbeam_channel::{bounded, Receiver};
use plant_core::{
    AugmentationConfig, DatasetSplit, Error, ImageDimensions, Result, SampleRecord, SplitKind,
};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use rayon::ThreadPool;
use std::panic;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

/// Stream id reserved for the per-epoch shuffle.
const SHUFFLE_STREAM: u64 = u64::MAX;

/// Ordered `(image, label)` pairs.
///
/// Shorter than the batch size for the final batch of an epoch, or when
/// corrupt samples were dropped. A batch whose samples all failed to decode
/// is still yielded (empty) so its skips are not lost.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub images: Vec<ImageTensor>,
    pub labels: Vec<usize>,
    /// Samples dropped from this batch because they failed to decode
    pub skipped: usize,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// Anything the trainer can pull epoch batches from.
pub trait BatchSource {
    /// Fresh traversal for `epoch`. Calling it twice with the same epoch
    /// yields the same batches.
    fn batches(&self, epoch: usize) -> Box<dyn Iterator<Item = Batch> + '_>;

    fn num_samples(&self) -> usize;

    fn batch_size(&self) -> usize;

    fn num_batches(&self) -> usize {
        self.num_samples().div_ceil(self.batch_size().max(1))
    }
}

/// Loader settings
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    pub image_size: ImageDimensions,
    pub batch_size: usize,
    /// Reshuffle the sample order every epoch
    pub shuffle: bool,
    pub seed: u64,
    /// Decode threads; 0 decodes on the calling thread
    pub num_workers: usize,
    /// Decoded batches buffered ahead of the consumer
    pub prefetch_batches: usize,
    /// Only honoured for the training split
    pub augmentation: AugmentationConfig,
}

impl LoaderConfig {
    pub fn new(image_size: ImageDimensions, batch_size: usize) -> Self {
        Self {
            image_size,
            batch_size,
            shuffle: false,
            seed: 42,
            num_workers: 0,
            prefetch_batches: 2,
            augmentation: AugmentationConfig::disabled(),
        }
    }

    pub fn with_shuffle(mut self, shuffle: bool, seed: u64) -> Self {
        self.shuffle = shuffle;
        self.seed = seed;
        self
    }

    pub fn with_workers(mut self, num_workers: usize, prefetch_batches: usize) -> Self {
        self.num_workers = num_workers;
        self.prefetch_batches = prefetch_batches;
        self
    }

    pub fn with_augmentation(mut self, augmentation: AugmentationConfig) -> Self {
        self.augmentation = augmentation;
        self
    }
}

/// Mixes a seed with a stream id and an index (splitmix64 finalizer).
pub fn derive_seed(seed: u64, stream: u64, index: u64) -> u64 {
    let mut z = seed
        ^ stream.wrapping_mul(0x9E37_79B9_7F4A_7C15)
        ^ index.wrapping_mul(0xC2B2_AE3D_27D4_EB4F);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Everything a decode worker needs, shared with the prefetch thread.
struct LoadContext {
    samples: Vec<SampleRecord>,
    preprocessor: ImagePreprocessor,
    augmentation: Option<AugmentationPipeline>,
    seed: u64,
}

impl LoadContext {
    fn load_one(&self, position: usize, epoch: usize) -> Result<ImageTensor> {
        let sample = &self.samples[position];
        let image = self.preprocessor.load(&sample.path)?;

        let image = match &self.augmentation {
            Some(pipeline) => {
                let mut rng =
                    ChaCha8Rng::seed_from_u64(derive_seed(self.seed, epoch as u64, position as u64));
                pipeline.augment(image, &mut rng)
            }
            None => image,
        };

        Ok(ImageTensor::from_rgb(&image))
    }

    fn assemble(&self, positions: &[usize], results: Vec<Result<ImageTensor>>) -> Batch {
        let mut images = Vec::with_capacity(positions.len());
        let mut labels = Vec::with_capacity(positions.len());
        let mut skipped = 0;

        for (&position, result) in positions.iter().zip(results) {
            match result {
                Ok(image) => {
                    images.push(image);
                    labels.push(self.samples[position].label);
                }
                Err(e) => {
                    warn!("Skipping sample: {e}");
                    skipped += 1;
                }
            }
        }

        Batch {
            images,
            labels,
            skipped,
        }
    }
}

/// Lazily decoded, batched view of one split
pub struct LazyImageLoader {
    kind: SplitKind,
    ctx: Arc<LoadContext>,
    batch_size: usize,
    shuffle: bool,
    seed: u64,
    pool: Option<Arc<ThreadPool>>,
    prefetch_batches: usize,
}

impl LazyImageLoader {
    pub fn new(split: DatasetSplit, config: LoaderConfig) -> Result<Self> {
        if config.batch_size == 0 {
            return Err(Error::InvalidArgument("Batch size must be at least 1".into()));
        }
        config.augmentation.validate()?;

        let augmentation = if split.kind.is_augmented() && config.augmentation.enabled {
            Some(AugmentationPipeline::new(config.augmentation.clone()))
        } else {
            if config.augmentation.enabled {
                debug!("Augmentation ignored for the {} split", split.kind);
            }
            None
        };

        let pool = if config.num_workers > 0 {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(config.num_workers)
                .thread_name(|i| format!("plant-decode-{i}"))
                .build()
                .map_err(|e| Error::Config(format!("Failed to build decode pool: {e}")))?;
            Some(Arc::new(pool))
        } else {
            None
        };

        debug!(
            "Loader for {} split: {} samples, batch size {}, shuffle {}, workers {}",
            split.kind,
            split.len(),
            config.batch_size,
            config.shuffle,
            config.num_workers
        );

        Ok(Self {
            kind: split.kind,
            ctx: Arc::new(LoadContext {
                samples: split.samples,
                preprocessor: ImagePreprocessor::new(config.image_size),
                augmentation,
                seed: config.seed,
            }),
            batch_size: config.batch_size,
            shuffle: config.shuffle,
            seed: config.seed,
            pool,
            prefetch_batches: config.prefetch_batches.max(1),
        })
    }

    pub fn kind(&self) -> SplitKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.ctx.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ctx.samples.is_empty()
    }

    pub fn is_augmented(&self) -> bool {
        self.ctx.augmentation.is_some()
    }

    /// Sample positions in the order they are visited during `epoch`.
    pub fn epoch_order(&self, epoch: usize) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.len()).collect();
        if self.shuffle {
            let mut rng = ChaCha8Rng::seed_from_u64(derive_seed(self.seed, SHUFFLE_STREAM, epoch as u64));
            order.shuffle(&mut rng);
        }
        order
    }

    /// Starts a traversal for `epoch`.
    pub fn epoch(&self, epoch: usize) -> EpochBatches<'_> {
        let order = self.epoch_order(epoch);

        if let Some(pool) = &self.pool {
            match self.spawn_prefetch(Arc::clone(pool), order.clone(), epoch) {
                Ok((rx, producer)) => {
                    return EpochBatches {
                        inner: EpochInner::Prefetch {
                            rx,
                            producer: Some(producer),
                        },
                    }
                }
                Err(e) => warn!("Prefetch thread unavailable, decoding synchronously: {e}"),
            }
        }

        EpochBatches {
            inner: EpochInner::Sync {
                ctx: &self.ctx,
                order,
                batch_size: self.batch_size,
                epoch,
                cursor: 0,
            },
        }
    }

    fn spawn_prefetch(
        &self,
        pool: Arc<ThreadPool>,
        order: Vec<usize>,
        epoch: usize,
    ) -> std::io::Result<(Receiver<Batch>, JoinHandle<()>)> {
        let (tx, rx) = bounded(self.prefetch_batches);
        let ctx = Arc::clone(&self.ctx);
        let batch_size = self.batch_size;

        let producer = thread::Builder::new()
            .name(format!("plant-prefetch-{}", self.kind))
            .spawn(move || {
                for positions in order.chunks(batch_size) {
                    let results: Vec<Result<ImageTensor>> = pool.install(|| {
                        positions
                            .par_iter()
                            .map(|&position| ctx.load_one(position, epoch))
                            .collect()
                    });
                    let batch = ctx.assemble(positions, results);
                    if tx.send(batch).is_err() {
                        debug!("Batch consumer went away, stopping prefetch");
                        break;
                    }
                }
            })?;

        Ok((rx, producer))
    }
}

impl BatchSource for LazyImageLoader {
    fn batches(&self, epoch: usize) -> Box<dyn Iterator<Item = Batch> + '_> {
        Box::new(self.epoch(epoch))
    }

    fn num_samples(&self) -> usize {
        self.len()
    }

    fn batch_size(&self) -> usize {
        self.batch_size
    }
}

/// One traversal of a split
pub struct EpochBatches<'a> {
    inner: EpochInner<'a>,
}

enum EpochInner<'a> {
    Sync {
        ctx: &'a LoadContext,
        order: Vec<usize>,
        batch_size: usize,
        epoch: usize,
        cursor: usize,
    },
    Prefetch {
        rx: Receiver<Batch>,
        /// Joined once the channel closes, so a worker panic reaches the consumer
        producer: Option<JoinHandle<()>>,
    },
}

impl Iterator for EpochBatches<'_> {
    type Item = Batch;

    fn next(&mut self) -> Option<Batch> {
        match &mut self.inner {
            EpochInner::Sync {
                ctx,
                order,
                batch_size,
                epoch,
                cursor,
            } => {
                if *cursor >= order.len() {
                    return None;
                }
                let end = (*cursor + *batch_size).min(order.len());
                let positions = &order[*cursor..end];
                let results = positions
                    .iter()
                    .map(|&position| ctx.load_one(position, *epoch))
                    .collect();
                *cursor = end;
                Some(ctx.assemble(positions, results))
            }
            EpochInner::Prefetch { rx, producer } => match rx.recv() {
                Ok(batch) => Some(batch),
                Err(_) => {
                    if let Some(handle) = producer.take() {
                        if let Err(payload) = handle.join() {
                            panic::resume_unwind(payload);
                        }
                    }
                    None
                }
            },
        }
    }
}
