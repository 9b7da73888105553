/// Dense layer with weights stored row-per-input: `weight[i * num_outputs + o]`.
/// This layout makes sparse (binary) inputs cheap, since every active input
/// adds one contiguous row to the output.
#[derive(Clone, Debug, PartialEq)]
pub struct LinearLayer {
    pub num_inputs: usize,
    pub num_outputs: usize,

    pub weight: Vec<f32>,
    pub bias: Vec<f32>,
}

impl LinearLayer {
    pub fn zeros(num_inputs: usize, num_outputs: usize) -> Self {
        LinearLayer {
            num_inputs,
            num_outputs,
            weight: vec![0.0; num_inputs * num_outputs],
            bias: vec![0.0; num_outputs],
        }
    }

    /// Row of weights connecting one input to every output
    pub fn row(&self, input: usize) -> &[f32] {
        &self.weight[input * self.num_outputs..(input + 1) * self.num_outputs]
    }
}

/// Linear layer over a binary input given by its active indices
pub fn linear_sparse(layer: &LinearLayer, active: &[u16], output: &mut [f32]) {
    debug_assert_eq!(output.len(), layer.num_outputs);

    output.copy_from_slice(&layer.bias);

    for &index in active {
        for (out, w) in output.iter_mut().zip(layer.row(index as usize)) {
            *out += w;
        }
    }
}

/// Linear layer over a dense input
pub fn linear(layer: &LinearLayer, input: &[f32], output: &mut [f32]) {
    debug_assert_eq!(input.len(), layer.num_inputs);
    debug_assert_eq!(output.len(), layer.num_outputs);

    output.copy_from_slice(&layer.bias);

    for (i, &x) in input.iter().enumerate() {
        if x == 0.0 {
            continue;
        }
        for (out, w) in output.iter_mut().zip(layer.row(i)) {
            *out += w * x;
        }
    }
}
