use crate::tensor::Tensor1;

pub mod parallel;
pub mod partition;
pub mod rmsnorm;
pub mod rsqrt;


pub use parallel::{DispatchMode, Dispatcher, ForkJoin, ScopedThreads, Sequential, UnitId};
#[cfg(feature = "parallel")]
pub use parallel::RayonPool;
pub use partition::{partition, UnitRange};
pub use rmsnorm::{
    aggregate, apply_scale, apply_scale_in_place, default_kernel, reduce_sum_of_squares,
    RmsNormKernel, SumOfSquaresArgs, WeightedScalingArgs,
};
pub use rsqrt::{fast_rsqrt, RsqrtPolicy};

/// Single-threaded RMSNorm with f64 accumulation: out = x * weight / sqrt(mean(x^2) + eps)
///
/// Used as the oracle the forked kernel is checked against.
/// `out`, `x` and `weight` must have the same length.
pub fn rmsnorm_reference(out: &mut [f32], x: &[f32], weight: &[f32], eps: f32) -> f32 {
    let squares: f64 = x.iter().map(|&v| (v as f64) * (v as f64)).sum();
    let scale = 1.0 / (squares / x.len() as f64 + eps as f64).sqrt();

    for ((o, &v), &w) in out.iter_mut().zip(x).zip(weight) {
        *o = (v as f64 * scale * w as f64) as f32;
    }
    scale as f32
}

/// Reference RMSNorm over ndarray vectors, returning a new vector
pub fn rmsnorm_reference_array(x: &Tensor1, weight: &Tensor1, eps: f32) -> Tensor1 {
    let x: Vec<f32> = x.iter().copied().collect();
    let weight: Vec<f32> = weight.iter().copied().collect();
    let mut out = vec![0.0f32; x.len()];
    rmsnorm_reference(&mut out, &x, &weight, eps);
    Tensor1::from_vec(out)
}
