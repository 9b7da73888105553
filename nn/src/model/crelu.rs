/// Clipped ReLU: clamps every element into [0, 1]
pub fn crelu(input: &[f32], output: &mut [f32]) {
    debug_assert_eq!(input.len(), output.len());

    for (out, &x) in output.iter_mut().zip(input) {
        *out = x.clamp(0.0, 1.0);
    }
}

/// Derivative of the clipped ReLU at the pre-activation value
#[inline]
pub fn crelu_grad(x: f32) -> f32 {
    if x > 0.0 && x < 1.0 {
        1.0
    } else {
        0.0
    }
}
