//! Core type definitions shared by the dataset and training crates.

use serde::de::Error as _;
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::str::FromStr;

use crate::{Error, Result};

/// Ordered set of class names with a bijective name <-> index mapping.
///
/// Names are kept in lexicographic order, so index `i` is always the
/// `i`-th name when sorted. Indices are contiguous in `[0, len)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassCatalog {
    names: Vec<String>,
    index: HashMap<String, usize>,
}

impl ClassCatalog {
    /// Builds a catalog from class names in any order.
    pub fn new<I, S>(names: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut names: Vec<String> = names.into_iter().map(Into::into).collect();
        names.sort();

        let mut index = HashMap::with_capacity(names.len());
        for (idx, name) in names.iter().enumerate() {
            if index.insert(name.clone(), idx).is_some() {
                return Err(Error::InvalidArgument(format!(
                    "Duplicate class name in catalog: {name}"
                )));
            }
        }

        Ok(Self { names, index })
    }

    /// Rebuilds a catalog from an `{index: name}` mapping as persisted in
    /// `class_mapping.json`.
    pub fn from_index_map(map: &BTreeMap<usize, String>) -> Result<Self> {
        for (expected, idx) in map.keys().enumerate() {
            if *idx != expected {
                return Err(Error::InvalidArgument(format!(
                    "Class indices must be contiguous from 0, missing index {expected}"
                )));
            }
        }

        let catalog = Self::new(map.values().cloned())?;
        for (idx, name) in map {
            if catalog.names[*idx] != *name {
                return Err(Error::InvalidArgument(format!(
                    "Class mapping is not in sorted order at index {idx} ({name})"
                )));
            }
        }

        Ok(catalog)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Class name for an index, if in range.
    pub fn name(&self, index: usize) -> Option<&str> {
        self.names.get(index).map(String::as_str)
    }

    /// Index for a class name, if known.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &str)> {
        self.names.iter().enumerate().map(|(i, n)| (i, n.as_str()))
    }
}

impl Serialize for ClassCatalog {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.names.len()))?;
        for (idx, name) in self.iter() {
            map.serialize_entry(&idx.to_string(), name)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for ClassCatalog {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = HashMap::<String, String>::deserialize(deserializer)?;

        let mut by_index = BTreeMap::new();
        for (key, name) in raw {
            let idx: usize = key
                .parse()
                .map_err(|_| D::Error::custom(format!("class index is not an integer: {key}")))?;
            by_index.insert(idx, name);
        }

        ClassCatalog::from_index_map(&by_index).map_err(D::Error::custom)
    }
}

/// A single image file and its class index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SampleRecord {
    /// Path to the image file
    pub path: PathBuf,
    /// Class label (index into the catalog)
    pub label: usize,
}

impl SampleRecord {
    pub fn new(path: impl Into<PathBuf>, label: usize) -> Self {
        Self {
            path: path.into(),
            label,
        }
    }
}

/// Which partition a split is
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SplitKind {
    Train,
    Valid,
    Test,
}

impl SplitKind {
    pub const ALL: [SplitKind; 3] = [SplitKind::Train, SplitKind::Valid, SplitKind::Test];

    /// Only the training split ever receives stochastic augmentation.
    pub fn is_augmented(&self) -> bool {
        matches!(self, SplitKind::Train)
    }
}

impl std::fmt::Display for SplitKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SplitKind::Train => write!(f, "train"),
            SplitKind::Valid => write!(f, "valid"),
            SplitKind::Test => write!(f, "test"),
        }
    }
}

/// Named subset of an indexed dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetSplit {
    pub kind: SplitKind,
    pub samples: Vec<SampleRecord>,
    /// Fraction of the full dataset this split was carved with
    pub ratio: f64,
}

impl DatasetSplit {
    pub fn new(kind: SplitKind, samples: Vec<SampleRecord>, ratio: f64) -> Self {
        Self {
            kind,
            samples,
            ratio,
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Number of samples per class index.
    pub fn class_counts(&self, num_classes: usize) -> Vec<usize> {
        let mut counts = vec![0; num_classes];
        for sample in &self.samples {
            if let Some(count) = counts.get_mut(sample.label) {
                *count += 1;
            }
        }
        counts
    }
}

/// Device selector passed through from the driver
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    /// CPU backend
    #[default]
    Cpu,
    /// CUDA/GPU backend
    Cuda,
    /// Pick whatever is available
    Auto,
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceType::Cpu => write!(f, "cpu"),
            DeviceType::Cuda => write!(f, "cuda"),
            DeviceType::Auto => write!(f, "auto"),
        }
    }
}

impl FromStr for DeviceType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "cpu" => Ok(DeviceType::Cpu),
            "cuda" | "gpu" => Ok(DeviceType::Cuda),
            "auto" => Ok(DeviceType::Auto),
            other => Err(Error::InvalidArgument(format!("Unknown device: {other}"))),
        }
    }
}

/// Target image size fed to the model
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageDimensions {
    /// Image width in pixels
    pub width: u32,
    /// Image height in pixels
    pub height: u32,
}

impl ImageDimensions {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Standard ImageNet dimensions (224x224)
    pub fn imagenet() -> Self {
        Self::new(224, 224)
    }

    /// Number of f32 values in one `(H, W, 3)` tensor
    pub fn num_values(&self) -> usize {
        self.width as usize * self.height as usize * 3
    }
}

impl Default for ImageDimensions {
    fn default() -> Self {
        Self::imagenet()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_sorted_and_bijective() {
        let catalog =
            ClassCatalog::new(["Tomato___healthy", "Apple___scab", "Corn___rust"]).unwrap();

        assert_eq!(catalog.len(), 3);
        assert_eq!(catalog.name(0), Some("Apple___scab"));
        assert_eq!(catalog.name(2), Some("Tomato___healthy"));
        for (idx, name) in catalog.iter() {
            assert_eq!(catalog.index_of(name), Some(idx));
        }
        assert_eq!(catalog.name(3), None);
    }

    #[test]
    fn test_catalog_rejects_duplicates() {
        let result = ClassCatalog::new(["a", "b", "a"]);
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_catalog_json_mapping() {
        let names: Vec<String> = (0..12).map(|i| format!("class_{i:02}")).collect();
        let catalog = ClassCatalog::new(names).unwrap();

        let json = serde_json::to_string(&catalog).unwrap();
        assert!(json.starts_with("{\"0\":\"class_00\""));

        let restored: ClassCatalog = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, catalog);
    }

    #[test]
    fn test_catalog_mapping_with_gap_is_rejected() {
        let result = serde_json::from_str::<ClassCatalog>(r#"{"0": "a", "2": "c"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_split_kind_display() {
        assert_eq!(SplitKind::Train.to_string(), "train");
        assert_eq!(SplitKind::Valid.to_string(), "valid");
        assert_eq!(SplitKind::Test.to_string(), "test");
        assert!(SplitKind::Train.is_augmented());
        assert!(!SplitKind::Valid.is_augmented());
    }

    #[test]
    fn test_split_class_counts() {
        let split = DatasetSplit::new(
            SplitKind::Train,
            vec![
                SampleRecord::new("a.jpg", 0),
                SampleRecord::new("b.jpg", 1),
                SampleRecord::new("c.jpg", 1),
            ],
            0.7,
        );
        assert_eq!(split.class_counts(2), vec![1, 2]);
    }

    #[test]
    fn test_device_from_str() {
        assert_eq!("CPU".parse::<DeviceType>().unwrap(), DeviceType::Cpu);
        assert_eq!("cuda".parse::<DeviceType>().unwrap(), DeviceType::Cuda);
        assert!("tpu".parse::<DeviceType>().is_err());
    }

    #[test]
    fn test_image_dimensions() {
        let dims = ImageDimensions::imagenet();
        assert_eq!(dims.width, 224);
        assert_eq!(dims.height, 224);
        assert_eq!(dims.num_values(), 224 * 224 * 3);
    }
}
