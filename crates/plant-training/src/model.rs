//! Trainable model seam and the shipped burn CNN.
//!
//! The orchestrator only sees [`TrainableModel`]: one optimization step per
//! batch, a gradient-free step for evaluation, and opaque byte blobs for the
//! parameters and optimizer state. [`BurnClassifier`] implements it with a
//! small convolutional network trained by AdamW on cross-entropy loss.

use burn::{
    backend::{Autodiff, NdArray},
    config::Config,
    module::{AutodiffModule, Module},
    nn::{
        conv::{Conv2d, Conv2dConfig},
        loss::CrossEntropyLossConfig,
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig, MaxPool2d, MaxPool2dConfig},
        BatchNorm, BatchNormConfig, Dropout, DropoutConfig, Linear, LinearConfig, PaddingConfig2d,
        Relu,
    },
    optim::{AdamWConfig, GradientsParams, Optimizer},
    record::{BinBytesRecorder, FullPrecisionSettings, Recorder},
    tensor::{
        backend::{AutodiffBackend, Backend},
        Int, Tensor, TensorData,
    },
};
use burn::tensor::ElementConversion;
use plant_core::{DeviceType, Error, Result as CoreResult};
use plant_dataset::{Batch, IMAGENET_MEAN, IMAGENET_STD};
use tracing::warn;

/// Backend used for training
pub type TrainBackend = Autodiff<NdArray<f32>>;
/// Backend used for evaluation and inference
pub type InferenceBackend = NdArray<f32>;

type ParamRecorder = BinBytesRecorder<FullPrecisionSettings>;

/// Smallest input side [`PlantClassifier`] accepts (four 2x2 poolings)
pub const MIN_INPUT_SIZE: u32 = 16;

/// Serialized model weights. Equality is byte equality.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModelParameters(pub Vec<u8>);

impl ModelParameters {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// What one step over a batch produced
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutput {
    /// Mean loss over the batch
    pub loss: f64,
    /// Predicted class per sample, in batch order
    pub predictions: Vec<usize>,
}

impl StepOutput {
    /// Fraction of predictions matching `labels`.
    pub fn accuracy(&self, labels: &[usize]) -> f64 {
        if labels.is_empty() {
            return 0.0;
        }
        let correct = self
            .predictions
            .iter()
            .zip(labels)
            .filter(|(p, l)| p == l)
            .count();
        correct as f64 / labels.len() as f64
    }
}

/// A differentiable classifier the orchestrator can drive.
pub trait TrainableModel {
    /// Forward, loss, backward and one optimizer update at `learning_rate`.
    ///
    /// When the loss is not finite the update is skipped and the loss is
    /// returned as-is so the caller can abort.
    fn train_step(&mut self, batch: &Batch, learning_rate: f64) -> CoreResult<StepOutput>;

    /// Forward and loss only.
    fn eval_step(&mut self, batch: &Batch) -> CoreResult<StepOutput>;

    fn parameters(&self) -> CoreResult<ModelParameters>;

    fn load_parameters(&mut self, parameters: &ModelParameters) -> CoreResult<()>;

    fn optimizer_state(&self) -> CoreResult<Vec<u8>>;

    fn load_optimizer_state(&mut self, state: &[u8]) -> CoreResult<()>;
}

/// Configuration for the [`PlantClassifier`] CNN
#[derive(Config, Debug)]
pub struct ClassifierConfig {
    pub num_classes: usize,

    /// Dropout rate before the output layer
    #[config(default = "0.3")]
    pub dropout_rate: f64,

    /// Filters of the first block; doubled by each following block
    #[config(default = "32")]
    pub base_filters: usize,

    #[config(default = "256")]
    pub hidden_size: usize,
}

/// Conv2d, BatchNorm, ReLU, then 2x2 max pooling
#[derive(Module, Debug)]
pub struct ConvBlock<B: Backend> {
    conv: Conv2d<B>,
    bn: BatchNorm<B, 2>,
    relu: Relu,
    pool: MaxPool2d,
}

impl<B: Backend> ConvBlock<B> {
    pub fn new(in_channels: usize, out_channels: usize, device: &B::Device) -> Self {
        Self {
            conv: Conv2dConfig::new([in_channels, out_channels], [3, 3])
                .with_padding(PaddingConfig2d::Same)
                .init(device),
            bn: BatchNormConfig::new(out_channels).init(device),
            relu: Relu::new(),
            pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv.forward(x);
        let x = self.bn.forward(x);
        let x = self.relu.forward(x);
        self.pool.forward(x)
    }
}

/// Plant disease classifier CNN
///
/// Architecture:
/// - 4 convolutional blocks (32 -> 64 -> 128 -> 256 filters by default)
/// - Global average pooling
/// - Fully connected head with dropout
///
/// Inputs must be at least [`MIN_INPUT_SIZE`] on each side.
#[derive(Module, Debug)]
pub struct PlantClassifier<B: Backend> {
    conv1: ConvBlock<B>,
    conv2: ConvBlock<B>,
    conv3: ConvBlock<B>,
    conv4: ConvBlock<B>,
    global_pool: AdaptiveAvgPool2d,
    fc1: Linear<B>,
    relu: Relu,
    dropout: Dropout,
    fc2: Linear<B>,
}

impl<B: Backend> PlantClassifier<B> {
    pub fn new(config: &ClassifierConfig, device: &B::Device) -> Self {
        let base = config.base_filters;

        Self {
            conv1: ConvBlock::new(3, base, device),
            conv2: ConvBlock::new(base, base * 2, device),
            conv3: ConvBlock::new(base * 2, base * 4, device),
            conv4: ConvBlock::new(base * 4, base * 8, device),
            global_pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            fc1: LinearConfig::new(base * 8, config.hidden_size).init(device),
            relu: Relu::new(),
            dropout: DropoutConfig::new(config.dropout_rate).init(),
            fc2: LinearConfig::new(config.hidden_size, config.num_classes).init(device),
        }
    }

    /// `[batch, 3, H, W]` normalized images to `[batch, num_classes]` logits
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = self.conv1.forward(x);
        let x = self.conv2.forward(x);
        let x = self.conv3.forward(x);
        let x = self.conv4.forward(x);

        let x = self.global_pool.forward(x);
        let [batch_size, channels, _, _] = x.dims();
        let x = x.reshape([batch_size, channels]);

        let x = self.fc1.forward(x);
        let x = self.relu.forward(x);
        let x = self.dropout.forward(x);
        self.fc2.forward(x)
    }

    /// Class probabilities
    pub fn forward_softmax(&self, x: Tensor<B, 4>) -> Tensor<B, 2> {
        burn::tensor::activation::softmax(self.forward(x), 1)
    }
}

/// Maps the device selector onto the ndarray backend.
///
/// Only the CPU backend is compiled in; other selectors fall back to it.
pub fn select_device(device: DeviceType) -> <InferenceBackend as Backend>::Device {
    if device != DeviceType::Cpu {
        warn!("Device '{device}' is not available in this build, using cpu");
    }
    Default::default()
}

/// Stacks a batch into a normalized `[n, 3, H, W]` tensor and its targets.
pub fn batch_tensors<B: Backend>(
    batch: &Batch,
    device: &B::Device,
) -> CoreResult<(Tensor<B, 4>, Tensor<B, 1, Int>)> {
    let first = batch
        .images
        .first()
        .ok_or_else(|| Error::Model("Cannot build tensors from an empty batch".into()))?;
    let (height, width) = (first.height as usize, first.width as usize);
    let batch_size = batch.images.len();

    let mut values = Vec::with_capacity(batch_size * 3 * height * width);
    for image in &batch.images {
        if image.shape() != first.shape() {
            return Err(Error::Model(format!(
                "Mixed image sizes in one batch: {:?} vs {:?}",
                image.shape(),
                first.shape()
            )));
        }
        values.extend(image.to_chw());
    }

    let images = Tensor::<B, 4>::from_floats(
        TensorData::new(values, [batch_size, 3, height, width]),
        device,
    );
    let mean = Tensor::<B, 4>::from_floats(TensorData::new(IMAGENET_MEAN.to_vec(), [1, 3, 1, 1]), device);
    let std = Tensor::<B, 4>::from_floats(TensorData::new(IMAGENET_STD.to_vec(), [1, 3, 1, 1]), device);
    let images = (images - mean) / std;

    let targets_data: Vec<i64> = batch.labels.iter().map(|&l| l as i64).collect();
    let targets = Tensor::<B, 1, Int>::from_data(TensorData::new(targets_data, [batch_size]), device);

    Ok((images, targets))
}

fn argmax_classes<B: Backend>(logits: Tensor<B, 2>) -> Vec<usize> {
    logits
        .argmax(1)
        .into_data()
        .iter::<i64>()
        .map(|class| class as usize)
        .collect()
}

/// [`PlantClassifier`] plus its optimizer, trained on an autodiff backend
pub struct BurnClassifier<B: AutodiffBackend, O> {
    model: PlantClassifier<B>,
    optim: Option<O>,
    /// Gradient-free copy for evaluation, dropped whenever the weights change
    eval_model: Option<PlantClassifier<B::InnerBackend>>,
    device: B::Device,
}

/// Fresh [`PlantClassifier`] with an AdamW optimizer.
pub fn build_classifier<B: AutodiffBackend>(
    config: &ClassifierConfig,
    weight_decay: f64,
    device: B::Device,
) -> BurnClassifier<B, impl Optimizer<PlantClassifier<B>, B>> {
    let model = PlantClassifier::new(config, &device);
    let optim = AdamWConfig::new()
        .with_weight_decay(weight_decay as f32)
        .init::<B, PlantClassifier<B>>();

    BurnClassifier {
        model,
        optim: Some(optim),
        eval_model: None,
        device,
    }
}

impl<B, O> BurnClassifier<B, O>
where
    B: AutodiffBackend,
    O: Optimizer<PlantClassifier<B>, B>,
{
    fn set_model(&mut self, model: PlantClassifier<B>) {
        self.model = model;
        self.eval_model = None;
    }

    fn take_optim(&mut self) -> CoreResult<O> {
        self.optim
            .take()
            .ok_or_else(|| Error::Model("Optimizer lost after a failed update".into()))
    }
}

impl<B, O> TrainableModel for BurnClassifier<B, O>
where
    B: AutodiffBackend,
    O: Optimizer<PlantClassifier<B>, B>,
{
    fn train_step(&mut self, batch: &Batch, learning_rate: f64) -> CoreResult<StepOutput> {
        let (images, targets) = batch_tensors::<B>(batch, &self.device)?;

        let logits = self.model.forward(images);
        let loss = CrossEntropyLossConfig::new()
            .init(&self.device)
            .forward(logits.clone(), targets);
        let loss_value: f64 = loss.clone().into_scalar().elem();
        let predictions = argmax_classes(logits);

        if !loss_value.is_finite() {
            return Ok(StepOutput {
                loss: loss_value,
                predictions,
            });
        }

        let grads = GradientsParams::from_grads(loss.backward(), &self.model);
        let mut optim = self.take_optim()?;
        let updated = optim.step(learning_rate, self.model.clone(), grads);
        self.set_model(updated);
        self.optim = Some(optim);

        Ok(StepOutput {
            loss: loss_value,
            predictions,
        })
    }

    fn eval_step(&mut self, batch: &Batch) -> CoreResult<StepOutput> {
        let (images, targets) = batch_tensors::<B::InnerBackend>(batch, &self.device)?;
        let model = self.eval_model.get_or_insert_with(|| self.model.valid());

        let logits = model.forward(images);
        let loss = CrossEntropyLossConfig::new()
            .init(&self.device)
            .forward(logits.clone(), targets);
        let loss_value: f64 = loss.into_scalar().elem();

        Ok(StepOutput {
            loss: loss_value,
            predictions: argmax_classes(logits),
        })
    }

    fn parameters(&self) -> CoreResult<ModelParameters> {
        let bytes = <ParamRecorder as Recorder<B>>::record(
            &ParamRecorder::default(),
            self.model.clone().into_record(),
            (),
        )
        .map_err(|e| Error::Model(format!("Failed to serialize parameters: {e}")))?;
        Ok(ModelParameters(bytes))
    }

    fn load_parameters(&mut self, parameters: &ModelParameters) -> CoreResult<()> {
        let record = <ParamRecorder as Recorder<B>>::load::<<PlantClassifier<B> as Module<B>>::Record>(
            &ParamRecorder::default(),
            parameters.0.clone(),
            &self.device,
        )
        .map_err(|e| Error::Model(format!("Failed to load parameters: {e}")))?;
        let loaded = self.model.clone().load_record(record);
        self.set_model(loaded);
        Ok(())
    }

    fn optimizer_state(&self) -> CoreResult<Vec<u8>> {
        let optim = self
            .optim
            .as_ref()
            .ok_or_else(|| Error::Model("Optimizer lost after a failed update".into()))?;
        <ParamRecorder as Recorder<B>>::record(&ParamRecorder::default(), optim.to_record(), ())
            .map_err(|e| Error::Model(format!("Failed to serialize optimizer state: {e}")))
    }

    fn load_optimizer_state(&mut self, state: &[u8]) -> CoreResult<()> {
        let record = <ParamRecorder as Recorder<B>>::load::<O::Record>(
            &ParamRecorder::default(),
            state.to_vec(),
            &self.device,
        )
        .map_err(|e| Error::Model(format!("Failed to load optimizer state: {e}")))?;
        let optim = self.take_optim()?;
        self.optim = Some(optim.load_record(record));
        Ok(())
    }
}

/// Builds an inference model from serialized parameters.
pub fn load_inference_model(
    config: &ClassifierConfig,
    parameters: &ModelParameters,
    device: &<InferenceBackend as Backend>::Device,
) -> CoreResult<PlantClassifier<InferenceBackend>> {
    let record = <ParamRecorder as Recorder<InferenceBackend>>::load::<
        <PlantClassifier<InferenceBackend> as Module<InferenceBackend>>::Record,
    >(&ParamRecorder::default(), parameters.0.clone(), device)
    .map_err(|e| Error::Model(format!("Failed to load parameters: {e}")))?;
    Ok(PlantClassifier::new(config, device).load_record(record))
}

#[cfg(test)]
mod tests {
    use super::*;
    use plant_dataset::ImageTensor;

    fn tiny_config() -> ClassifierConfig {
        ClassifierConfig::new(3).with_base_filters(4).with_hidden_size(8)
    }

    fn batch(labels: Vec<usize>) -> Batch {
        let images = labels
            .iter()
            .map(|&l| ImageTensor {
                height: 16,
                width: 16,
                data: vec![l as f32 / 3.0; 16 * 16 * 3],
            })
            .collect();
        Batch {
            images,
            labels,
            skipped: 0,
        }
    }

    #[test]
    fn test_forward_shape() {
        let device = Default::default();
        let model = PlantClassifier::<InferenceBackend>::new(&tiny_config(), &device);
        let (images, _) = batch_tensors::<InferenceBackend>(&batch(vec![0, 1]), &device).unwrap();

        assert_eq!(model.forward(images).dims(), [2, 3]);
    }

    #[test]
    fn test_batch_tensors_rejects_mixed_sizes() {
        let mut mixed = batch(vec![0, 1]);
        mixed.images[1] = ImageTensor {
            height: 4,
            width: 4,
            data: vec![0.0; 48],
        };
        let result = batch_tensors::<InferenceBackend>(&mixed, &Default::default());
        assert!(matches!(result, Err(Error::Model(_))));
    }

    #[test]
    fn test_train_step_and_parameter_roundtrip() {
        let device = Default::default();
        let mut model = build_classifier::<TrainBackend>(&tiny_config(), 0.01, device);
        let data = batch(vec![0, 1, 2, 0]);

        let before = model.parameters().unwrap();
        let step = model.train_step(&data, 1e-3).unwrap();
        assert!(step.loss.is_finite());
        assert_eq!(step.predictions.len(), 4);
        let after = model.parameters().unwrap();
        assert_ne!(before, after);

        let optimizer = model.optimizer_state().unwrap();
        let mut restored = build_classifier::<TrainBackend>(&tiny_config(), 0.01, device);
        restored.load_parameters(&after).unwrap();
        restored.load_optimizer_state(&optimizer).unwrap();
        assert_eq!(restored.parameters().unwrap(), after);

        let a = model.eval_step(&data).unwrap();
        let b = restored.eval_step(&data).unwrap();
        assert_eq!(a.predictions, b.predictions);
        assert!((a.loss - b.loss).abs() < 1e-5);
    }

    #[test]
    fn test_eval_copy_follows_weight_updates() {
        let device = Default::default();
        let mut model = build_classifier::<TrainBackend>(&tiny_config(), 0.01, device);
        let data = batch(vec![0, 1, 2]);

        assert!(model.eval_model.is_none());
        let first = model.eval_step(&data).unwrap();
        assert!(model.eval_model.is_some());
        assert_eq!(model.eval_step(&data).unwrap(), first);

        model.train_step(&data, 1e-2).unwrap();
        assert!(model.eval_model.is_none());
        let trained = model.eval_step(&data).unwrap();
        assert!(model.eval_model.is_some());

        let fresh = build_classifier::<TrainBackend>(&tiny_config(), 0.01, device)
            .parameters()
            .unwrap();
        model.load_parameters(&fresh).unwrap();
        assert!(model.eval_model.is_none());
        assert_ne!(model.eval_step(&data).unwrap().loss, trained.loss);
    }

    #[test]
    fn test_step_output_accuracy() {
        let output = StepOutput {
            loss: 0.3,
            predictions: vec![0, 1, 1, 2],
        };
        assert_eq!(output.accuracy(&[0, 1, 2, 2]), 0.75);
        assert_eq!(output.accuracy(&[]), 0.0);
    }
}
