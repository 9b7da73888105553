//! Versioned model checkpoints on disk and the active model shared with the
//! move policy.

use crate::record::{EvalSource, EvaluationResult};
use arc_swap::ArcSwap;
use nn::feature_set::build::build_feature_set;
use nn::feature_set::EncodedFeatures;
use nn::model::{CheckpointError, ModelMeta, ValueModel};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const ACTIVE_FILE: &str = "ACTIVE";
const FEATURE_SET: &str = "basic";

pub trait Predict {
    fn predict(&self, features: &EncodedFeatures) -> EvaluationResult;
}

impl Predict for ValueModel {
    fn predict(&self, features: &EncodedFeatures) -> EvaluationResult {
        EvaluationResult {
            score_cp: self.evaluate(features),
            principal_variation: Vec::new(),
            depth_reached: 0,
            source: EvalSource::Model,
            model_version: Some(self.version()),
        }
    }
}

/// Shared pointer to the active model.
///
/// Readers take a snapshot once and keep using it even if a new model is
/// published meanwhile.
#[derive(Clone)]
pub struct ModelHandle {
    active: Arc<ArcSwap<ValueModel>>,
}

impl ModelHandle {
    pub fn new(model: ValueModel) -> Self {
        ModelHandle {
            active: Arc::new(ArcSwap::from_pointee(model)),
        }
    }

    pub fn snapshot(&self) -> Arc<ValueModel> {
        self.active.load_full()
    }

    pub fn version(&self) -> u64 {
        self.active.load().version()
    }

    /// Makes `model` the active model, returning the previous one
    pub fn publish(&self, model: ValueModel) -> Arc<ValueModel> {
        let version = model.version();
        let previous = self.active.swap(Arc::new(model));
        tracing::info!(
            old_version = previous.version(),
            new_version = version,
            "active model swapped"
        );
        previous
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error("model registry io error: {0}")]
    Io(#[from] io::Error),

    #[error("bad ACTIVE pointer: {0:?}")]
    BadPointer(String),

    #[error("unknown feature set: {0}")]
    UnknownFeatureSet(String),
}

/// Directory of `model-v{N}.bin` checkpoints plus an `ACTIVE` file naming the
/// active version
pub struct ModelRegistry {
    dir: PathBuf,
}

impl ModelRegistry {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, RegistryError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(ModelRegistry { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, version: u64) -> PathBuf {
        self.dir.join(format!("model-v{}.bin", version))
    }

    pub fn active_version(&self) -> Result<Option<u64>, RegistryError> {
        match fs::read_to_string(self.dir.join(ACTIVE_FILE)) {
            Ok(text) => text
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| RegistryError::BadPointer(text)),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(error) => Err(error.into()),
        }
    }

    /// Every version with a checkpoint on disk, ascending
    pub fn versions(&self) -> Result<Vec<u64>, RegistryError> {
        let mut versions = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let name = entry?.file_name();
            let name = name.to_string_lossy();
            if let Some(version) = name
                .strip_prefix("model-v")
                .and_then(|rest| rest.strip_suffix(".bin"))
                .and_then(|v| v.parse().ok())
            {
                versions.push(version);
            }
        }
        versions.sort_unstable();
        Ok(versions)
    }

    /// Version number for the next trained model
    pub fn next_version(&self) -> Result<u64, RegistryError> {
        let latest = self.versions()?.last().copied();
        let active = self.active_version()?;
        Ok(latest.max(active).map_or(1, |v| v + 1))
    }

    pub fn load(&self, version: u64) -> Result<ValueModel, RegistryError> {
        Ok(ValueModel::load(self.path_for(version))?)
    }

    pub fn load_active(&self) -> Result<Option<ValueModel>, RegistryError> {
        match self.active_version()? {
            Some(version) => Ok(Some(self.load(version)?)),
            None => Ok(None),
        }
    }

    /// Writes the checkpoint, then moves the `ACTIVE` pointer to it
    pub fn install(&self, model: &ValueModel) -> Result<(), RegistryError> {
        model.save(self.path_for(model.version()))?;

        let tmp_path = self.dir.join("ACTIVE.tmp");
        {
            let mut file = File::create(&tmp_path)?;
            writeln!(file, "{}", model.version())?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, self.dir.join(ACTIVE_FILE))?;

        tracing::info!(version = model.version(), dir = %self.dir.display(), "model installed");
        Ok(())
    }

    /// Freshly initialized version-0 model
    pub fn initial_model(hidden_size: usize, seed: u64) -> Result<ValueModel, RegistryError> {
        let feature_set = build_feature_set(FEATURE_SET)
            .ok_or_else(|| RegistryError::UnknownFeatureSet(FEATURE_SET.to_string()))?;
        let meta = ModelMeta {
            version: 0,
            trained_at: chrono::Utc::now().timestamp(),
            training_game_count: 0,
        };
        let mut rng = StdRng::seed_from_u64(seed);
        Ok(ValueModel::new(meta, feature_set, hidden_size, &mut rng))
    }

    /// Loads the active model, installing a version-0 model first if the
    /// registry is empty
    pub fn load_or_init(&self, hidden_size: usize, seed: u64) -> Result<ValueModel, RegistryError> {
        if let Some(model) = self.load_active()? {
            tracing::info!(version = model.version(), "loaded active model");
            return Ok(model);
        }

        let model = Self::initial_model(hidden_size, seed)?;
        self.install(&model)?;
        tracing::info!(hidden_size, "created initial model");
        Ok(model)
    }
}
