use crate::error::{KernelError, Result};
use crate::kernels::parallel::{num_cpus, DispatchMode};
use crate::kernels::rsqrt::RsqrtPolicy;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Default numeric-stability constant added to the mean square.
pub const DEFAULT_EPSILON: f32 = 1e-5;

/// Environment variables read by [`KernelConfig::from_env`].
pub const ENV_UNITS: &str = "FORKNORM_UNITS";
pub const ENV_EPSILON: &str = "FORKNORM_EPSILON";
pub const ENV_RSQRT: &str = "FORKNORM_RSQRT";
pub const ENV_DISPATCH: &str = "FORKNORM_DISPATCH";

/// Configuration for an [`RmsNormKernel`](crate::kernels::RmsNormKernel).
///
/// Missing JSON fields fall back to [`KernelConfig::default`].
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Number of compute units every phase is forked across
    pub unit_count: usize,
    /// Added to the mean square before the reciprocal square root
    pub epsilon: f32,
    /// Exact or approximate reciprocal square root
    pub rsqrt: RsqrtPolicy,
    /// Which fork-join dispatcher runs the units
    pub dispatch: DispatchMode,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            unit_count: num_cpus().max(1),
            epsilon: DEFAULT_EPSILON,
            rsqrt: RsqrtPolicy::default(),
            dispatch: DispatchMode::default(),
        }
    }
}

impl KernelConfig {
    /// Create a configuration with an explicit unit count and defaults otherwise
    pub fn with_units(unit_count: usize) -> Self {
        Self {
            unit_count,
            ..Default::default()
        }
    }

    /// Single-unit, single-threaded configuration (useful as a test oracle)
    pub fn sequential() -> Self {
        Self {
            unit_count: 1,
            dispatch: DispatchMode::Sequential,
            ..Default::default()
        }
    }

    pub fn unit_count(mut self, unit_count: usize) -> Self {
        self.unit_count = unit_count;
        self
    }

    pub fn epsilon(mut self, epsilon: f32) -> Self {
        self.epsilon = epsilon;
        self
    }

    pub fn rsqrt(mut self, rsqrt: RsqrtPolicy) -> Self {
        self.rsqrt = rsqrt;
        self
    }

    pub fn dispatch(mut self, dispatch: DispatchMode) -> Self {
        self.dispatch = dispatch;
        self
    }

    /// Check the invariants the kernel relies on.
    ///
    /// `epsilon` must be finite and strictly positive so that
    /// `mean_square + epsilon > 0` for every input.
    pub fn validate(&self) -> Result<()> {
        if self.unit_count == 0 {
            return Err(KernelError::invalid_config(
                "unit_count",
                "must be at least 1",
            ));
        }
        if !(self.epsilon.is_finite() && self.epsilon > 0.0) {
            return Err(KernelError::invalid_config(
                "epsilon",
                format!("must be finite and > 0, got {}", self.epsilon),
            ));
        }
        Ok(())
    }

    /// Parse and validate a JSON configuration
    pub fn from_json(json: &str) -> Result<Self> {
        let config: KernelConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by `FORKNORM_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each `FORKNORM_*` key
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = lookup(ENV_UNITS) {
            config.unit_count = v.trim().parse().map_err(|e| {
                KernelError::invalid_config("unit_count", format!("{}: '{}'", e, v))
            })?;
        }
        if let Some(v) = lookup(ENV_EPSILON) {
            config.epsilon = v.trim().parse().map_err(|e| {
                KernelError::invalid_config("epsilon", format!("{}: '{}'", e, v))
            })?;
        }
        if let Some(v) = lookup(ENV_RSQRT) {
            config.rsqrt = RsqrtPolicy::from_str(&v)?;
        }
        if let Some(v) = lookup(ENV_DISPATCH) {
            config.dispatch = DispatchMode::from_str(&v)?;
        }

        config.validate()?;
        Ok(config)
    }
}
