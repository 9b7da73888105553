use super::crelu::crelu_grad;
use super::{Activations, ValueModel};
use crate::feature_set::EncodedFeatures;

/// Accumulated gradients for every parameter of a `ValueModel`
pub struct Gradients {
    hidden_weight: Vec<f32>,
    hidden_bias: Vec<f32>,
    output_weight: Vec<f32>,
    output_bias: f32,

    /// Number of accumulated samples
    samples: usize,
}

impl Gradients {
    pub fn samples(&self) -> usize {
        self.samples
    }

    pub fn clear(&mut self) {
        self.hidden_weight.fill(0.0);
        self.hidden_bias.fill(0.0);
        self.output_weight.fill(0.0);
        self.output_bias = 0.0;
        self.samples = 0;
    }
}

impl ValueModel {
    pub fn zero_gradients(&self) -> Gradients {
        Gradients {
            hidden_weight: vec![0.0; self.hidden.weight.len()],
            hidden_bias: vec![0.0; self.hidden.bias.len()],
            output_weight: vec![0.0; self.output.weight.len()],
            output_bias: 0.0,
            samples: 0,
        }
    }

    /// Backpropagates `d_output` (derivative of the loss w.r.t. the raw
    /// network output) through the forward pass `act` of `features`.
    pub fn backward(
        &self,
        features: &EncodedFeatures,
        act: &Activations,
        d_output: f32,
        grads: &mut Gradients,
    ) {
        let hidden_size = self.hidden.num_outputs;

        grads.output_bias += d_output;

        let mut d_hidden_pre = vec![0.0; hidden_size];
        for j in 0..hidden_size {
            grads.output_weight[j] += d_output * act.hidden[j];
            d_hidden_pre[j] = d_output * self.output.weight[j] * crelu_grad(act.hidden_pre[j]);
        }

        for (bias, d) in grads.hidden_bias.iter_mut().zip(&d_hidden_pre) {
            *bias += d;
        }

        // only the rows of active (binary) inputs receive gradient
        for &index in features.active() {
            let row = &mut grads.hidden_weight
                [index as usize * hidden_size..(index as usize + 1) * hidden_size];
            for (w, d) in row.iter_mut().zip(&d_hidden_pre) {
                *w += d;
            }
        }

        grads.samples += 1;
    }

    /// Applies one SGD step with the mean of the accumulated gradients
    pub fn apply_gradients(&mut self, grads: &Gradients, learning_rate: f32) {
        if grads.samples == 0 {
            return;
        }

        let step = learning_rate / grads.samples as f32;

        for (w, g) in self.hidden.weight.iter_mut().zip(&grads.hidden_weight) {
            *w -= step * g;
        }
        for (b, g) in self.hidden.bias.iter_mut().zip(&grads.hidden_bias) {
            *b -= step * g;
        }
        for (w, g) in self.output.weight.iter_mut().zip(&grads.output_weight) {
            *w -= step * g;
        }
        self.output.bias[0] -= step * grads.output_bias;
    }
}

#[cfg(test)]
mod tests {
    use crate::feature_set::basic::Basic;
    use crate::model::{ModelMeta, ValueModel};
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use shakmaty::fen::Fen;
    use std::sync::Arc;

    #[test]
    fn sgd_fits_a_single_target() {
        let mut rng = StdRng::seed_from_u64(7);
        let meta = ModelMeta {
            version: 0,
            trained_at: 0,
            training_game_count: 0,
        };
        let mut model = ValueModel::new(meta, Arc::new(Basic::new()), 16, &mut rng);

        let setup = "4k3/8/8/8/8/8/3QP3/4K3 w - - 0 1"
            .parse::<Fen>()
            .unwrap()
            .into_setup();
        let features = model.encode(&setup).unwrap();
        let target = 3.0; // pawns

        let before = (model.forward(&features).output - target).abs();

        let mut grads = model.zero_gradients();
        for _ in 0..200 {
            grads.clear();
            let act = model.forward(&features);
            // d/dy of (y - t)^2 / 2
            model.backward(&features, &act, act.output - target, &mut grads);
            model.apply_gradients(&grads, 0.05);
        }

        let after = (model.forward(&features).output - target).abs();
        assert!(after < before);
        assert!(after < 0.1, "residual {}", after);
    }
}
