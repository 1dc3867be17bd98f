//! Fork-join RMSNorm
//!
//! `out[i] = weight[i] * (x[i] / sqrt(mean(x^2) + eps))`, computed in two
//! forked phases with a single-threaded aggregation in between:
//!
//! ```text
//! Init -> ReducePhase -> (barrier) -> AggregatePhase -> ScalePhase -> (barrier) -> Done
//!
//!          unit 0    unit 1    ...   unit N-1
//! phase 1: ss[0]     ss[1]     ...   ss[N-1]      partial sums of squares
//!             \        |               /
//! aggregate:   scale = rsqrt(sum(ss) / size + eps)
//!             /        |               \
//! phase 2: out[r0]   out[r1]   ...   out[rN-1]    out = w * (scale * x)
//! ```
//!
//! Each unit only ever writes its own partial-sum slot and its own window of
//! the output, handed to it as exclusive `&mut` borrows, so no locking is
//! needed inside a phase. Partial sums live in a scratch vector owned by the
//! call, never in the output buffer.

use super::parallel::{Dispatcher, DispatchMode, ForkJoin, ScopedThreads, UnitId};
use super::partition::{partition, split_mut};
use super::rsqrt::RsqrtPolicy;
use crate::config::KernelConfig;
use crate::error::{KernelError, Result};
use crate::tensor::{Tensor1, TensorView1};
use log::{debug, trace, warn};
use std::sync::OnceLock;

/// Shared read-only arguments of the sum-of-squares phase.
#[derive(Debug, Clone, Copy)]
pub struct SumOfSquaresArgs<'a> {
    pub input: &'a [f32],
    pub size: usize,
}

/// Shared read-only arguments of the weighted-scaling phase.
#[derive(Debug, Clone, Copy)]
pub struct WeightedScalingArgs<'a> {
    pub input: &'a [f32],
    pub weight: &'a [f32],
    pub scale: f32,
    pub size: usize,
}

/// Phase 1 body: write this unit's sum of squares into its slot.
///
/// Empty ranges write 0.0.
#[inline]
pub fn reduce_sum_of_squares(slot: &mut f32, args: &SumOfSquaresArgs<'_>, unit: UnitId) {
    let range = partition(unit.count(), unit.index(), args.size);
    *slot = args.input[range.as_range()].iter().map(|v| v * v).sum();
}

/// Combine per-unit partial sums into the scaling factor.
///
/// `size` must be non-zero and `epsilon` positive; both are checked before
/// any unit is forked.
#[inline]
pub fn aggregate(partials: &[f32], size: usize, epsilon: f32, policy: RsqrtPolicy) -> f32 {
    let total: f32 = partials.iter().sum();
    let mean_square = total / size as f32;
    policy.rsqrt(mean_square + epsilon)
}

/// Phase 2 body: `out = weight * (scale * input)` over this unit's range.
///
/// `out` is the unit's window of the output buffer, i.e. it starts at the
/// unit's range start and has the range's length.
#[inline]
pub fn apply_scale(out: &mut [f32], args: &WeightedScalingArgs<'_>, unit: UnitId) {
    let range = partition(unit.count(), unit.index(), args.size);
    debug_assert_eq!(out.len(), range.len());

    let input = &args.input[range.as_range()];
    let weight = &args.weight[range.as_range()];
    for ((o, &x), &w) in out.iter_mut().zip(input).zip(weight) {
        *o = w * (args.scale * x);
    }
}

/// Phase 2 body for the aliased case where the output overwrites the input.
#[inline]
pub fn apply_scale_in_place(
    window: &mut [f32],
    weight: &[f32],
    scale: f32,
    size: usize,
    unit: UnitId,
) {
    let range = partition(unit.count(), unit.index(), size);
    debug_assert_eq!(window.len(), range.len());

    for (x, &w) in window.iter_mut().zip(&weight[range.as_range()]) {
        *x = w * (scale * *x);
    }
}

/// RMSNorm kernel bound to a unit count, an rsqrt policy and a dispatcher.
///
/// Holds no per-call state; one kernel can serve concurrent callers.
#[derive(Debug)]
pub struct RmsNormKernel<D: ForkJoin = Dispatcher> {
    config: KernelConfig,
    dispatcher: D,
}

impl RmsNormKernel<Dispatcher> {
    /// Validate `config` and build the dispatcher it names.
    pub fn new(config: KernelConfig) -> Result<Self> {
        config.validate()?;
        let dispatcher = Dispatcher::new(config.dispatch, config.unit_count)?;
        debug!(
            "rmsnorm kernel: {} units, {} rsqrt, {} dispatch",
            config.unit_count,
            config.rsqrt,
            dispatcher.name()
        );
        Ok(Self { config, dispatcher })
    }
}

impl<D: ForkJoin> RmsNormKernel<D> {
    /// Build a kernel around a caller-provided dispatcher.
    ///
    /// `config.dispatch` is ignored; `dispatcher` is used as is.
    pub fn with_dispatcher(config: KernelConfig, dispatcher: D) -> Result<Self> {
        config.validate()?;
        debug!(
            "rmsnorm kernel: {} units, {} rsqrt, {} dispatch",
            config.unit_count,
            config.rsqrt,
            dispatcher.name()
        );
        Ok(Self { config, dispatcher })
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn unit_count(&self) -> usize {
        self.config.unit_count
    }

    pub fn dispatcher(&self) -> &D {
        &self.dispatcher
    }

    /// Normalize `x[..size]` into `out[..size]` and return the scale used.
    ///
    /// Fails with `InvalidArgument` for `size == 0` and `BufferTooShort` if
    /// any buffer holds fewer than `size` elements. On failure nothing is
    /// forked and `out` is untouched.
    pub fn rmsnorm(&self, out: &mut [f32], x: &[f32], weight: &[f32], size: usize) -> Result<f32> {
        check_call(size, out.len(), x.len(), weight.len())?;
        let x = &x[..size];

        let scale = self.reduce_and_aggregate(x, size);

        let args = WeightedScalingArgs {
            input: x,
            weight: &weight[..size],
            scale,
            size,
        };
        let windows = split_mut(out, self.unit_count(), size);
        self.dispatcher
            .fork_join(windows, |unit, window| apply_scale(window, &args, unit));
        trace!("rmsnorm: scale phase done");

        Ok(scale)
    }

    /// Normalize `x[..size]` in place and return the scale used.
    pub fn rmsnorm_in_place(&self, x: &mut [f32], weight: &[f32], size: usize) -> Result<f32> {
        check_call(size, x.len(), x.len(), weight.len())?;

        let scale = self.reduce_and_aggregate(&x[..size], size);

        let weight = &weight[..size];
        let windows = split_mut(x, self.unit_count(), size);
        self.dispatcher.fork_join(windows, |unit, window| {
            apply_scale_in_place(window, weight, scale, size, unit)
        });
        trace!("rmsnorm: in-place scale phase done");

        Ok(scale)
    }

    /// Normalize an ndarray vector in place.
    pub fn forward(&self, x: &mut Tensor1, weight: &Tensor1) -> Result<f32> {
        let size = x.len();
        let weight = weight
            .as_slice()
            .ok_or_else(|| KernelError::invalid_argument("weight", "must be contiguous"))?;
        let x = x
            .as_slice_mut()
            .ok_or_else(|| KernelError::invalid_argument("x", "must be contiguous"))?;
        self.rmsnorm_in_place(x, weight, size)
    }

    /// Normalize an ndarray view into a newly allocated vector.
    pub fn normalize(&self, x: TensorView1<'_>, weight: TensorView1<'_>) -> Result<Tensor1> {
        let size = x.len();
        let x = x
            .as_slice()
            .ok_or_else(|| KernelError::invalid_argument("x", "must be contiguous"))?;
        let weight = weight
            .as_slice()
            .ok_or_else(|| KernelError::invalid_argument("weight", "must be contiguous"))?;

        let mut out = vec![0.0f32; size];
        self.rmsnorm(&mut out, x, weight, size)?;
        Ok(Tensor1::from_vec(out))
    }

    /// Phase 1, barrier, then the single-threaded aggregation.
    fn reduce_and_aggregate(&self, x: &[f32], size: usize) -> f32 {
        let units = self.unit_count();
        if units > size {
            trace!(
                "rmsnorm: {} units for {} elements, {} units idle",
                units,
                size,
                units - size
            );
        }

        let mut partials = vec![0.0f32; units];
        let args = SumOfSquaresArgs { input: x, size };
        self.dispatcher.fork_join(partials.iter_mut().collect(), |unit, slot| {
            reduce_sum_of_squares(slot, &args, unit)
        });
        trace!("rmsnorm: reduce phase done, partials = {:?}", partials);

        let scale = aggregate(&partials, size, self.config.epsilon, self.config.rsqrt);
        trace!("rmsnorm: size = {}, scale = {}", size, scale);
        scale
    }
}

/// Caller-contract checks, run before any unit is forked.
fn check_call(size: usize, out_len: usize, x_len: usize, weight_len: usize) -> Result<()> {
    if size == 0 {
        return Err(KernelError::invalid_argument("size", "must be greater than 0"));
    }
    KernelError::check_len("out", out_len, size)?;
    KernelError::check_len("x", x_len, size)?;
    KernelError::check_len("weight", weight_len, size)?;
    Ok(())
}

/// Process-wide kernel configured from `FORKNORM_*` environment variables.
///
/// Falls back to defaults if the environment is invalid, and to scoped
/// threads if the rayon pool cannot be built.
pub fn default_kernel() -> &'static RmsNormKernel {
    static KERNEL: OnceLock<RmsNormKernel> = OnceLock::new();
    KERNEL.get_or_init(|| {
        let config = KernelConfig::from_env().unwrap_or_else(|e| {
            warn!("ignoring FORKNORM_* environment: {}", e);
            KernelConfig::default()
        });
        RmsNormKernel::new(config.clone()).unwrap_or_else(|e| {
            warn!("falling back to scoped threads: {}", e);
            RmsNormKernel {
                config: config.dispatch(DispatchMode::Threads),
                dispatcher: Dispatcher::ScopedThreads(ScopedThreads),
            }
        })
    })
}

/// Normalize `x[..size]` into `out[..size]` with the process-wide kernel.
pub fn rmsnorm(out: &mut [f32], x: &[f32], weight: &[f32], size: usize) -> Result<f32> {
    default_kernel().rmsnorm(out, x, weight, size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels::parallel::Sequential;

    fn unit(index: usize, count: usize) -> UnitId {
        UnitId::new(index, count)
    }

    #[test]
    fn test_reduce_writes_only_own_range() {
        let x = [1.0, 2.0, 3.0, 4.0, 5.0];
        let args = SumOfSquaresArgs { input: &x, size: 5 };

        // block = 2: unit 1 owns [2, 4)
        let mut slot = f32::NAN;
        reduce_sum_of_squares(&mut slot, &args, unit(1, 3));
        assert_eq!(slot, 9.0 + 16.0);

        // unit 2 owns [4, 5)
        reduce_sum_of_squares(&mut slot, &args, unit(2, 3));
        assert_eq!(slot, 25.0);
    }

    #[test]
    fn test_reduce_empty_range_writes_zero() {
        let x = [3.0];
        let args = SumOfSquaresArgs { input: &x, size: 1 };
        let mut slot = f32::NAN;
        reduce_sum_of_squares(&mut slot, &args, unit(3, 4));
        assert_eq!(slot, 0.0);
    }

    #[test]
    fn test_aggregate() {
        let scale = aggregate(&[5.0, 25.0], 4, 1e-5, RsqrtPolicy::Exact);
        let expected = 1.0 / (7.5f32 + 1e-5).sqrt();
        assert!((scale - expected).abs() / expected < 1e-6);
    }

    #[test]
    fn test_aggregate_all_zero_input_is_finite() {
        let scale = aggregate(&[0.0, 0.0, 0.0], 3, 1e-5, RsqrtPolicy::Exact);
        assert!(scale.is_finite());
        assert!((scale - 1.0 / 1e-5f32.sqrt()).abs() < 1.0);
    }

    #[test]
    fn test_apply_scale_window() {
        let x = [1.0, 2.0, 3.0, 4.0];
        let w = [1.0, 2.0, 3.0, 4.0];
        let args = WeightedScalingArgs {
            input: &x,
            weight: &w,
            scale: 0.5,
            size: 4,
        };

        // unit 1 of 2 owns [2, 4)
        let mut window = [0.0f32; 2];
        apply_scale(&mut window, &args, unit(1, 2));
        assert_eq!(window, [4.5, 8.0]);
    }

    #[test]
    fn test_apply_scale_in_place_window() {
        let w = [2.0, 2.0, 2.0];
        let mut window = [1.0f32, -1.0];
        // unit 0 of 2 owns [0, 2)
        apply_scale_in_place(&mut window, &w, 0.25, 3, unit(0, 2));
        assert_eq!(window, [0.5, -0.5]);
    }

    #[test]
    fn test_rejects_zero_size_without_touching_output() {
        let kernel = RmsNormKernel::with_dispatcher(KernelConfig::with_units(2), Sequential).unwrap();
        let mut out = [7.0f32; 2];
        let err = kernel.rmsnorm(&mut out, &[1.0, 2.0], &[1.0, 1.0], 0).unwrap_err();
        assert!(matches!(err, KernelError::InvalidArgument { arg: "size", .. }));
        assert_eq!(out, [7.0, 7.0]);
    }

    #[test]
    fn test_rejects_short_buffers() {
        let kernel = RmsNormKernel::with_dispatcher(KernelConfig::with_units(2), Sequential).unwrap();
        let mut out = [0.0f32; 4];

        let err = kernel.rmsnorm(&mut out, &[1.0; 3], &[1.0; 4], 4).unwrap_err();
        assert!(matches!(
            err,
            KernelError::BufferTooShort { buffer: "x", required: 4, actual: 3 }
        ));

        let err = kernel.rmsnorm(&mut out[..2], &[1.0; 4], &[1.0; 4], 4).unwrap_err();
        assert!(matches!(err, KernelError::BufferTooShort { buffer: "out", .. }));

        let err = kernel.rmsnorm(&mut out, &[1.0; 4], &[1.0; 1], 4).unwrap_err();
        assert!(matches!(err, KernelError::BufferTooShort { buffer: "weight", .. }));
    }

    #[test]
    fn test_size_smaller_than_buffers_leaves_tail() {
        let kernel = RmsNormKernel::with_dispatcher(KernelConfig::with_units(3), Sequential).unwrap();
        let mut out = [9.0f32; 5];
        kernel
            .rmsnorm(&mut out, &[2.0, 2.0, 2.0, 2.0, 2.0], &[1.0; 5], 3)
            .unwrap();
        for v in &out[..3] {
            assert!((v - 1.0).abs() < 1e-5);
        }
        assert_eq!(&out[3..], &[9.0, 9.0]);
    }

    #[test]
    fn test_fast_policy_on_overflowing_input() {
        let mut results = Vec::new();
        for policy in [RsqrtPolicy::Exact, RsqrtPolicy::Fast] {
            let config = KernelConfig::with_units(4).rsqrt(policy);
            let kernel = RmsNormKernel::with_dispatcher(config, Sequential).unwrap();
            let mut out = [1.0f32; 2];
            // 2e19^2 overflows f32, so the mean square is +inf
            let scale = kernel.rmsnorm(&mut out, &[2e19, 0.0], &[1.0, 1.0], 2).unwrap();
            results.push((scale, out));
        }
        assert_eq!(results[0], (0.0, [0.0, 0.0]));
        assert_eq!(results[1], results[0]);
    }

    #[test]
    fn test_fast_policy_with_subnormal_epsilon() {
        let epsilon = f32::MIN_POSITIVE / 16.0;
        let exact = KernelConfig::with_units(2).epsilon(epsilon);
        let fast = exact.clone().rsqrt(RsqrtPolicy::Fast);
        let exact = RmsNormKernel::with_dispatcher(exact, Sequential).unwrap();
        let fast = RmsNormKernel::with_dispatcher(fast, Sequential).unwrap();

        let mut out = [0.0f32; 3];
        let expected = exact.rmsnorm(&mut out, &[0.0; 3], &[1.0; 3], 3).unwrap();
        let scale = fast.rmsnorm(&mut out, &[0.0; 3], &[1.0; 3], 3).unwrap();
        assert!(expected.is_finite() && expected > 0.0);
        assert_eq!(scale, expected);
        assert_eq!(out, [0.0; 3]);
    }

    #[test]
    fn test_with_dispatcher_validates_config() {
        let bad = KernelConfig::with_units(2).epsilon(0.0);
        assert!(RmsNormKernel::with_dispatcher(bad, Sequential).is_err());
    }

    #[test]
    fn test_default_kernel_runs() {
        let mut out = [0.0f32; 3];
        let scale = rmsnorm(&mut out, &[3.0, 4.0, 0.0], &[1.0, 1.0, 1.0], 3).unwrap();
        let expected = 1.0 / ((25.0f32 / 3.0) + 1e-5).sqrt();
        assert!((scale - expected).abs() < 1e-3);
    }
}
