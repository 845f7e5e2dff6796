//! Single-image inference from a save directory.

use crate::checkpoint::{load_best_model, CheckpointStore};
use crate::model::{
    batch_tensors, load_inference_model, select_device, ClassifierConfig, InferenceBackend,
    PlantClassifier,
};
use burn::tensor::backend::Backend;
use image::RgbImage;
use plant_core::{ClassCatalog, DeviceType, Error, ImageDimensions, PredictionResult, Result};
use plant_dataset::{Batch, ImagePreprocessor, ImageTensor};
use std::path::Path;
use tracing::info;

/// Best model of a finished run plus its class mapping
pub struct Predictor {
    model: PlantClassifier<InferenceBackend>,
    catalog: ClassCatalog,
    preprocessor: ImagePreprocessor,
    device: <InferenceBackend as Backend>::Device,
}

impl Predictor {
    /// Loads `best_model.ckpt` and `class_mapping.json` from `save_dir`.
    pub fn from_save_dir(
        save_dir: &Path,
        image_size: ImageDimensions,
        device: DeviceType,
    ) -> Result<Self> {
        let catalog = CheckpointStore::new(save_dir).load_class_mapping()?;
        let parameters = load_best_model(save_dir)?;
        let device = select_device(device);
        let model = load_inference_model(&ClassifierConfig::new(catalog.len()), &parameters, &device)?;

        info!(
            "Loaded predictor for {} classes from {}",
            catalog.len(),
            save_dir.display()
        );

        Ok(Self {
            model,
            catalog,
            preprocessor: ImagePreprocessor::new(image_size),
            device,
        })
    }

    pub fn catalog(&self) -> &ClassCatalog {
        &self.catalog
    }

    /// Decodes, resizes and classifies one image file.
    pub fn predict_path(&self, path: &Path, top_k: usize) -> Result<PredictionResult> {
        let image = self.preprocessor.load(path)?;
        self.predict_resized(&image, top_k)
    }

    /// Classifies an already decoded image of any size.
    pub fn predict_image(&self, image: &RgbImage, top_k: usize) -> Result<PredictionResult> {
        let resized = self.preprocessor.resize(image);
        self.predict_resized(&resized, top_k)
    }

    fn predict_resized(&self, image: &RgbImage, top_k: usize) -> Result<PredictionResult> {
        let batch = Batch {
            images: vec![ImageTensor::from_rgb(image)],
            labels: vec![0],
            skipped: 0,
        };
        let (input, _) = batch_tensors::<InferenceBackend>(&batch, &self.device)?;
        let probabilities: Vec<f32> = self
            .model
            .forward_softmax(input)
            .into_data()
            .iter::<f32>()
            .collect();

        let mut ranked: Vec<(usize, f32)> = probabilities.into_iter().enumerate().collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1));

        let (class_id, confidence) = *ranked
            .first()
            .ok_or_else(|| Error::Model("Model produced no class scores".into()))?;
        let class_name = self.class_name(class_id)?;

        let top_k = ranked
            .iter()
            .take(top_k.max(1))
            .map(|&(idx, p)| Ok((self.class_name(idx)?, p as f64)))
            .collect::<Result<Vec<_>>>()?;

        Ok(PredictionResult {
            class_id,
            class_name,
            confidence: confidence as f64,
            top_k,
        })
    }

    fn class_name(&self, index: usize) -> Result<String> {
        self.catalog
            .name(index)
            .map(String::from)
            .ok_or_else(|| Error::Model(format!("Class index {index} not in the class mapping")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::CheckpointTag;
    use crate::model::{build_classifier, TrainBackend, TrainableModel};
    use crate::trainer::TrainingState;
    use tempfile::TempDir;

    #[test]
    fn test_predict_from_save_dir() {
        let dir = TempDir::new().unwrap();
        let catalog = ClassCatalog::new(["Apple___scab", "Grape___healthy", "Tomato___healthy"]).unwrap();
        let model = build_classifier::<TrainBackend>(
            &ClassifierConfig::new(catalog.len()),
            0.01,
            Default::default(),
        );

        let store = CheckpointStore::new(dir.path());
        store
            .save(CheckpointTag::Best, &TrainingState::new(0.001), &model.parameters().unwrap())
            .unwrap();
        store.save_class_mapping(&catalog).unwrap();

        let image_path = dir.path().join("leaf.png");
        RgbImage::from_pixel(40, 30, image::Rgb([30, 160, 40]))
            .save(&image_path)
            .unwrap();

        let predictor =
            Predictor::from_save_dir(dir.path(), ImageDimensions::new(16, 16), DeviceType::Cpu)
                .unwrap();
        let result = predictor.predict_path(&image_path, 2).unwrap();

        assert_eq!(result.top_k.len(), 2);
        assert_eq!(result.top_k[0].0, result.class_name);
        assert!(result.top_k[0].1 >= result.top_k[1].1);
        assert!(catalog.index_of(&result.class_name).is_some());
        assert!(result.confidence > 0.0 && result.confidence <= 1.0);

        let all = predictor.predict_image(&RgbImage::new(20, 20), 10).unwrap();
        let total: f64 = all.top_k.iter().map(|(_, p)| p).sum();
        assert_eq!(all.top_k.len(), 3);
        assert!((total - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_missing_save_dir() {
        let result = Predictor::from_save_dir(
            Path::new("/nonexistent/models"),
            ImageDimensions::new(16, 16),
            DeviceType::Cpu,
        );
        assert!(matches!(result, Err(Error::NotFound(_))));
    }
}
