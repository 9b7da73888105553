pub mod checkpoint;
mod crelu;
mod grad;
mod linear;

pub use checkpoint::CheckpointError;
pub use grad::Gradients;
pub use linear::LinearLayer;

use crate::feature_set::{encode, EncodedFeatures, EncodingError, FeatureSet};
use crelu::crelu;
use linear::{linear, linear_sparse};
use rand::Rng;
use shakmaty::Setup;
use std::fmt;
use std::sync::Arc;

/// Centipawns represented by one unit of the network output
pub const OUTPUT_SCALE: f32 = 100.0;

/// Largest evaluation the model reports, in centipawns
pub const MAX_EVAL: i32 = 9_000;

/// Scale used to map centipawns to a win probability
pub const WDL_SCALE: f32 = 400.0;

/// Expected score of the side to move for an evaluation in centipawns
pub fn win_probability(cp: f32) -> f32 {
    1.0 / (1.0 + (-cp / WDL_SCALE).exp())
}

/// Metadata stored alongside the weights
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModelMeta {
    /// Monotonic model version, 0 is the untrained initial model
    pub version: u64,
    /// Unix timestamp (seconds) of the end of training
    pub trained_at: i64,
    /// Number of stored games when the model was trained
    pub training_game_count: u64,
}

/// Intermediate values of a forward pass, kept for backpropagation
pub struct Activations {
    pub hidden_pre: Vec<f32>,
    pub hidden: Vec<f32>,
    pub output: f32,
}

/// Small value network: sparse features -> clipped ReLU hidden layer -> scalar.
/// The output is the evaluation of the position from the side to move's
/// perspective, in pawns.
#[derive(Clone)]
pub struct ValueModel {
    meta: ModelMeta,
    feature_set: Arc<dyn FeatureSet>,

    hidden: LinearLayer,
    output: LinearLayer,
}

impl ValueModel {
    /// Creates a randomly initialized model
    pub fn new<R: Rng>(
        meta: ModelMeta,
        feature_set: Arc<dyn FeatureSet>,
        hidden_size: usize,
        rng: &mut R,
    ) -> Self {
        let num_features = feature_set.num_features();

        let mut hidden = LinearLayer::zeros(num_features, hidden_size);
        for w in hidden.weight.iter_mut() {
            *w = rng.gen_range(-0.05..0.05);
        }
        hidden.bias.fill(0.25);

        // start close to a zero evaluation
        let mut output = LinearLayer::zeros(hidden_size, 1);
        let bound = 0.1 / (hidden_size as f32).sqrt();
        for w in output.weight.iter_mut() {
            *w = rng.gen_range(-bound..bound);
        }

        ValueModel {
            meta,
            feature_set,
            hidden,
            output,
        }
    }

    pub(crate) fn from_layers(
        meta: ModelMeta,
        feature_set: Arc<dyn FeatureSet>,
        hidden: LinearLayer,
        output: LinearLayer,
    ) -> Self {
        assert_eq!(hidden.num_inputs, feature_set.num_features());
        assert_eq!(hidden.num_outputs, output.num_inputs);
        assert_eq!(output.num_outputs, 1);

        ValueModel {
            meta,
            feature_set,
            hidden,
            output,
        }
    }

    pub fn meta(&self) -> &ModelMeta {
        &self.meta
    }

    pub fn version(&self) -> u64 {
        self.meta.version
    }

    /// Returns a copy of the weights under new metadata
    pub fn with_meta(&self, meta: ModelMeta) -> Self {
        ValueModel {
            meta,
            ..self.clone()
        }
    }

    pub fn feature_set(&self) -> &dyn FeatureSet {
        self.feature_set.as_ref()
    }

    pub fn hidden_size(&self) -> usize {
        self.hidden.num_outputs
    }

    /// Number of trainable parameters
    pub fn params(&self) -> usize {
        self.hidden.weight.len()
            + self.hidden.bias.len()
            + self.output.weight.len()
            + self.output.bias.len()
    }

    /// Encodes a position with this model's feature set
    pub fn encode(&self, setup: &Setup) -> Result<EncodedFeatures, EncodingError> {
        encode(self.feature_set.as_ref(), setup)
    }

    pub fn forward(&self, features: &EncodedFeatures) -> Activations {
        debug_assert_eq!(features.len(), self.hidden.num_inputs);

        let mut hidden_pre = vec![0.0; self.hidden.num_outputs];
        linear_sparse(&self.hidden, features.active(), &mut hidden_pre);

        let mut hidden = vec![0.0; self.hidden.num_outputs];
        crelu(&hidden_pre, &mut hidden);

        let mut output = [0.0];
        linear(&self.output, &hidden, &mut output);

        Activations {
            hidden_pre,
            hidden,
            output: output[0],
        }
    }

    /// Evaluation in centipawns from the side to move's perspective
    pub fn evaluate(&self, features: &EncodedFeatures) -> i32 {
        let output = self.forward(features).output;
        ((output * OUTPUT_SCALE).round() as i32).clamp(-MAX_EVAL, MAX_EVAL)
    }

    /// Model whose every evaluation is `cp`, regardless of the position
    #[doc(hidden)]
    pub fn constant(meta: ModelMeta, feature_set: Arc<dyn FeatureSet>, cp: i32) -> Self {
        let hidden = LinearLayer::zeros(feature_set.num_features(), 1);
        let mut output = LinearLayer::zeros(1, 1);
        output.bias[0] = cp as f32 / OUTPUT_SCALE;
        ValueModel::from_layers(meta, feature_set, hidden, output)
    }
}

impl fmt::Debug for ValueModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValueModel")
            .field("meta", &self.meta)
            .field("feature_set", &self.feature_set.name())
            .field("hidden", &self.hidden.num_outputs)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feature_set::basic::Basic;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn meta(version: u64) -> ModelMeta {
        ModelMeta {
            version,
            trained_at: 0,
            training_game_count: 0,
        }
    }

    #[test]
    fn constant_model_ignores_position() {
        let model = ValueModel::constant(meta(3), Arc::new(Basic::new()), 125);
        let features = model.encode(&Setup::initial()).unwrap();

        assert_eq!(model.evaluate(&features), 125);
        assert_eq!(model.version(), 3);
    }

    #[test]
    fn new_model_starts_near_zero() {
        let mut rng = StdRng::seed_from_u64(1);
        let model = ValueModel::new(meta(0), Arc::new(Basic::new()), 32, &mut rng);
        let features = model.encode(&Setup::initial()).unwrap();

        assert!(model.evaluate(&features).abs() < 100);
        assert_eq!(model.params(), 774 * 32 + 32 + 32 + 1);
    }

    #[test]
    fn win_probability_is_symmetric() {
        assert_eq!(win_probability(0.0), 0.5);
        let p = win_probability(250.0);
        assert!((p + win_probability(-250.0) - 1.0).abs() < 1e-6);
        assert!(p > 0.5);
    }
}
