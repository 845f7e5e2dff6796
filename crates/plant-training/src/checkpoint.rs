//! Checkpoint persistence.
//!
//! A save directory holds:
//!
//! ```text
//! best_model.ckpt         best validation accuracy so far
//! latest_model.ckpt       end-of-run snapshot
//! training_history.json   per-epoch metric arrays
//! class_mapping.json      {"0": "Apple___scab", ...}
//! ```
//!
//! Checkpoint layout, little-endian:
//!
//! ```text
//! b"PLNTCKPT" | version: u32 | header_len: u64 | header (JSON) | parameters | optimizer
//! ```
//!
//! The header carries the training state, section lengths and their SHA-256
//! digests. Every file is written to a temporary file in the save directory,
//! synced and renamed over the target, so readers never observe a partial
//! artifact.

use crate::model::ModelParameters;
use crate::trainer::TrainingState;
use chrono::Utc;
use plant_core::{ClassCatalog, Error, Result, TrainingHistory};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info};

pub const CHECKPOINT_MAGIC: &[u8; 8] = b"PLNTCKPT";
pub const CHECKPOINT_VERSION: u32 = 1;
pub const HISTORY_FILE: &str = "training_history.json";
pub const CLASS_MAPPING_FILE: &str = "class_mapping.json";

const PREFIX_LEN: usize = 8 + 4 + 8;

/// Which checkpoint slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointTag {
    Best,
    Latest,
}

impl CheckpointTag {
    pub fn file_name(&self) -> &'static str {
        match self {
            CheckpointTag::Best => "best_model.ckpt",
            CheckpointTag::Latest => "latest_model.ckpt",
        }
    }
}

impl std::fmt::Display for CheckpointTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CheckpointTag::Best => write!(f, "best"),
            CheckpointTag::Latest => write!(f, "latest"),
        }
    }
}

/// JSON header of a checkpoint file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointHeader {
    pub tag: CheckpointTag,
    /// RFC 3339 write time
    pub created_at: String,
    /// Training state; its optimizer bytes live in their own section
    pub state: TrainingState,
    pub parameters_len: u64,
    pub parameters_sha256: String,
    pub optimizer_len: u64,
    pub optimizer_sha256: String,
}

/// A fully decoded checkpoint
#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub tag: CheckpointTag,
    pub created_at: String,
    pub state: TrainingState,
    pub parameters: ModelParameters,
}

fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[..4]);
    u32::from_le_bytes(buf)
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(buf)
}

/// Serializes a checkpoint into its on-disk byte layout.
pub fn encode_checkpoint(
    tag: CheckpointTag,
    state: &TrainingState,
    parameters: &ModelParameters,
) -> Result<Vec<u8>> {
    let optimizer = &state.optimizer_state;
    let header = CheckpointHeader {
        tag,
        created_at: Utc::now().to_rfc3339(),
        state: state.clone(),
        parameters_len: parameters.len() as u64,
        parameters_sha256: sha256_hex(parameters.as_bytes()),
        optimizer_len: optimizer.len() as u64,
        optimizer_sha256: sha256_hex(optimizer),
    };
    let header_bytes = serde_json::to_vec(&header)?;

    let mut bytes =
        Vec::with_capacity(PREFIX_LEN + header_bytes.len() + parameters.len() + optimizer.len());
    bytes.extend_from_slice(CHECKPOINT_MAGIC);
    bytes.extend_from_slice(&CHECKPOINT_VERSION.to_le_bytes());
    bytes.extend_from_slice(&(header_bytes.len() as u64).to_le_bytes());
    bytes.extend_from_slice(&header_bytes);
    bytes.extend_from_slice(parameters.as_bytes());
    bytes.extend_from_slice(optimizer);
    Ok(bytes)
}

/// Parses and verifies checkpoint bytes read from `path`.
///
/// Any structural problem, length mismatch or digest mismatch is a
/// `CorruptArtifact`.
pub fn decode_checkpoint(path: &Path, bytes: &[u8]) -> Result<Checkpoint> {
    let corrupt = |reason: String| Error::corrupt_artifact(path, reason);

    if bytes.len() < PREFIX_LEN {
        return Err(corrupt(format!("file is only {} bytes", bytes.len())));
    }
    if &bytes[..8] != CHECKPOINT_MAGIC {
        return Err(corrupt("not a checkpoint file".into()));
    }
    let version = read_u32(&bytes[8..12]);
    if version != CHECKPOINT_VERSION {
        return Err(corrupt(format!("unsupported format version {version}")));
    }

    let header_len = read_u64(&bytes[12..20]);
    let header_end = usize::try_from(header_len)
        .ok()
        .and_then(|len| PREFIX_LEN.checked_add(len))
        .filter(|&end| end <= bytes.len())
        .ok_or_else(|| corrupt(format!("header length {header_len} exceeds file")))?;

    let header: CheckpointHeader = serde_json::from_slice(&bytes[PREFIX_LEN..header_end])
        .map_err(|e| corrupt(format!("unreadable header: {e}")))?;

    let body = &bytes[header_end..];
    let expected = header
        .parameters_len
        .checked_add(header.optimizer_len)
        .ok_or_else(|| corrupt("section lengths overflow".into()))?;
    if body.len() as u64 != expected {
        return Err(corrupt(format!(
            "expected {expected} section bytes, found {}",
            body.len()
        )));
    }

    let (parameters, optimizer) = body.split_at(header.parameters_len as usize);
    if sha256_hex(parameters) != header.parameters_sha256 {
        return Err(corrupt("parameter digest mismatch".into()));
    }
    if sha256_hex(optimizer) != header.optimizer_sha256 {
        return Err(corrupt("optimizer digest mismatch".into()));
    }

    let mut state = header.state;
    state.optimizer_state = optimizer.to_vec();

    Ok(Checkpoint {
        tag: header.tag,
        created_at: header.created_at,
        state,
        parameters: ModelParameters(parameters.to_vec()),
    })
}

/// Checkpoint store rooted at one save directory.
///
/// Single writer per directory.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    /// The directory is created on the first write.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, tag: CheckpointTag) -> PathBuf {
        self.dir.join(tag.file_name())
    }

    pub fn exists(&self, tag: CheckpointTag) -> bool {
        self.path(tag).is_file()
    }

    pub fn save(
        &self,
        tag: CheckpointTag,
        state: &TrainingState,
        parameters: &ModelParameters,
    ) -> Result<PathBuf> {
        let bytes = encode_checkpoint(tag, state, parameters)?;
        let path = self.write_atomic(tag.file_name(), &bytes)?;
        info!(
            "Saved {} checkpoint (epoch {}) to {}",
            tag,
            state.epoch,
            path.display()
        );
        Ok(path)
    }

    pub fn load(&self, tag: CheckpointTag) -> Result<(TrainingState, ModelParameters)> {
        let checkpoint = self.load_checkpoint(tag)?;
        Ok((checkpoint.state, checkpoint.parameters))
    }

    pub fn load_checkpoint(&self, tag: CheckpointTag) -> Result<Checkpoint> {
        let path = self.path(tag);
        let bytes = read_artifact(&path)?;
        let checkpoint = decode_checkpoint(&path, &bytes)?;
        if checkpoint.tag != tag {
            return Err(Error::corrupt_artifact(
                &path,
                format!("holds a {} checkpoint", checkpoint.tag),
            ));
        }
        debug!(
            "Loaded {} checkpoint from {} (written {})",
            tag,
            path.display(),
            checkpoint.created_at
        );
        Ok(checkpoint)
    }

    pub fn save_history(&self, history: &TrainingHistory) -> Result<PathBuf> {
        let json = serde_json::to_vec_pretty(history)?;
        self.write_atomic(HISTORY_FILE, &json)
    }

    pub fn load_history(&self) -> Result<TrainingHistory> {
        self.load_json(HISTORY_FILE)
    }

    pub fn save_class_mapping(&self, catalog: &ClassCatalog) -> Result<PathBuf> {
        let json = serde_json::to_vec_pretty(catalog)?;
        let path = self.write_atomic(CLASS_MAPPING_FILE, &json)?;
        info!("Saved {} class names to {}", catalog.len(), path.display());
        Ok(path)
    }

    pub fn load_class_mapping(&self) -> Result<ClassCatalog> {
        self.load_json(CLASS_MAPPING_FILE)
    }

    fn load_json<T: serde::de::DeserializeOwned>(&self, file_name: &str) -> Result<T> {
        let path = self.dir.join(file_name);
        let bytes = read_artifact(&path)?;
        serde_json::from_slice(&bytes).map_err(|e| Error::corrupt_artifact(&path, e))
    }

    /// Temp file in the target directory, fsync, rename.
    fn write_atomic(&self, file_name: &str, bytes: &[u8]) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(file_name);

        let mut file = NamedTempFile::new_in(&self.dir)?;
        file.write_all(bytes)?;
        file.as_file().sync_all()?;
        file.persist(&path).map_err(|e| Error::Io(e.error))?;

        debug!("Wrote {} bytes to {}", bytes.len(), path.display());
        Ok(path)
    }
}

fn read_artifact(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).map_err(|e| match e.kind() {
        ErrorKind::NotFound => Error::NotFound(format!("{} does not exist", path.display())),
        _ => Error::Io(e),
    })
}

/// Parameters of the best checkpoint in `save_dir`, for inference.
pub fn load_best_model(save_dir: &Path) -> Result<ModelParameters> {
    let (_, parameters) = CheckpointStore::new(save_dir).load(CheckpointTag::Best)?;
    Ok(parameters)
}

#[cfg(test)]
mod tests {
    use super::*;
    use plant_core::EpochMetrics;
    use std::collections::BTreeSet;
    use tempfile::TempDir;

    fn sample_state() -> TrainingState {
        let mut state = TrainingState::new(0.001);
        state.epoch = 3;
        for (loss, acc) in [(1.2, 0.4), (0.9, 0.55), (0.7, 0.61)] {
            state.history.push_train(EpochMetrics { loss, accuracy: acc });
            state.history.push_valid(EpochMetrics {
                loss: loss + 0.1,
                accuracy: acc - 0.05,
            });
        }
        state.best_valid_acc = Some(0.56);
        state.patience_counter = 1;
        state.scheduler_state.best = Some(0.56);
        state.optimizer_state = vec![9, 8, 7, 6];
        state
    }

    fn params() -> ModelParameters {
        ModelParameters((0..=255u8).cycle().take(1000).collect())
    }

    fn file_names(dir: &Path) -> BTreeSet<String> {
        fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect()
    }

    #[test]
    fn test_save_load_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(temp_dir.path().join("models"));
        let state = sample_state();

        assert!(!store.exists(CheckpointTag::Latest));
        store.save(CheckpointTag::Latest, &state, &params()).unwrap();
        assert!(store.exists(CheckpointTag::Latest));

        let (loaded, loaded_params) = store.load(CheckpointTag::Latest).unwrap();
        assert_eq!(loaded, state);
        assert_eq!(loaded.optimizer_state, vec![9, 8, 7, 6]);
        assert_eq!(loaded_params, params());
    }

    #[test]
    fn test_missing_checkpoint_is_not_found() {
        let temp_dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(temp_dir.path());

        assert!(matches!(store.load(CheckpointTag::Best), Err(Error::NotFound(_))));
        assert!(matches!(load_best_model(temp_dir.path()), Err(Error::NotFound(_))));
        assert!(matches!(store.load_history(), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_corruption_is_detected() {
        let state = sample_state();
        let bytes = encode_checkpoint(CheckpointTag::Best, &state, &params()).unwrap();
        let path = Path::new("best_model.ckpt");
        assert!(decode_checkpoint(path, &bytes).is_ok());

        let mut flipped = bytes.clone();
        let last = flipped.len() - 10;
        flipped[last] ^= 0xFF;
        let truncated = &bytes[..bytes.len() - 1];
        let mut bad_magic = bytes.clone();
        bad_magic[0] = b'X';
        let mut bad_version = bytes.clone();
        bad_version[8] = 99;

        for broken in [&flipped[..], truncated, &bad_magic[..], &bad_version[..], &bytes[..5]] {
            let err = decode_checkpoint(path, broken).unwrap_err();
            assert!(matches!(err, Error::CorruptArtifact { .. }), "{err}");
        }
    }

    #[test]
    fn test_corrupt_file_on_disk() {
        let temp_dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(temp_dir.path());
        fs::write(store.path(CheckpointTag::Best), b"PLNTCKPT garbage").unwrap();

        let err = store.load(CheckpointTag::Best).unwrap_err();
        assert_eq!(err.kind(), "CorruptArtifact");
    }

    #[test]
    fn test_tag_mismatch_is_corrupt() {
        let temp_dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(temp_dir.path());
        store.save(CheckpointTag::Latest, &sample_state(), &params()).unwrap();
        fs::copy(store.path(CheckpointTag::Latest), store.path(CheckpointTag::Best)).unwrap();

        assert!(matches!(
            store.load(CheckpointTag::Best),
            Err(Error::CorruptArtifact { .. })
        ));
    }

    #[test]
    fn test_atomic_writes_leave_no_temp_files() {
        let temp_dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(temp_dir.path());
        let catalog = ClassCatalog::new(["b", "a"]).unwrap();

        let mut state = sample_state();
        for epoch in 0..3 {
            state.epoch = epoch;
            store.save(CheckpointTag::Best, &state, &params()).unwrap();
        }
        store.save(CheckpointTag::Latest, &state, &params()).unwrap();
        store.save_history(&state.history).unwrap();
        store.save_class_mapping(&catalog).unwrap();

        let expected: BTreeSet<String> = [
            "best_model.ckpt",
            "latest_model.ckpt",
            HISTORY_FILE,
            CLASS_MAPPING_FILE,
        ]
        .into_iter()
        .map(String::from)
        .collect();
        assert_eq!(file_names(temp_dir.path()), expected);

        let (best, _) = store.load(CheckpointTag::Best).unwrap();
        assert_eq!(best.epoch, 2);
    }

    #[test]
    fn test_history_and_class_mapping_files() {
        let temp_dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(temp_dir.path());
        let state = sample_state();
        let catalog = ClassCatalog::new(["Tomato___healthy", "Apple___scab"]).unwrap();

        store.save_history(&state.history).unwrap();
        store.save_class_mapping(&catalog).unwrap();

        let raw: serde_json::Value =
            serde_json::from_slice(&fs::read(temp_dir.path().join(HISTORY_FILE)).unwrap()).unwrap();
        for key in ["train_loss", "train_acc", "valid_loss", "valid_acc"] {
            assert_eq!(raw[key].as_array().unwrap().len(), 3, "{key}");
        }
        assert_eq!(store.load_history().unwrap(), state.history);

        let mapping: serde_json::Value = serde_json::from_slice(
            &fs::read(temp_dir.path().join(CLASS_MAPPING_FILE)).unwrap(),
        )
        .unwrap();
        assert_eq!(mapping["0"], "Apple___scab");
        assert_eq!(store.load_class_mapping().unwrap(), catalog);
    }

    #[test]
    fn test_load_best_model() {
        let temp_dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(temp_dir.path());
        store.save(CheckpointTag::Best, &sample_state(), &params()).unwrap();

        assert_eq!(load_best_model(temp_dir.path()).unwrap(), params());
    }
}
