//! Reciprocal square root strategies
//!
//! - `Exact`: `1.0 / sqrt(x)` using the hardware divide and sqrt
//! - `Fast`: bit-level initial guess refined by one Newton-Raphson step.
//!   Relative error stays below ~0.18% for positive normal inputs. Zero,
//!   subnormal, infinite and NaN inputs take the exact path.

use crate::error::KernelError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Magic constant for the initial `1/sqrt(x)` estimate.
const RSQRT_MAGIC: u32 = 0x5f37_59df;

/// How the aggregator turns the stabilized mean square into a scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RsqrtPolicy {
    #[default]
    Exact,
    Fast,
}

impl RsqrtPolicy {
    /// Compute `1 / sqrt(x)` for `x > 0`.
    #[inline]
    pub fn rsqrt(self, x: f32) -> f32 {
        match self {
            RsqrtPolicy::Exact => 1.0 / x.sqrt(),
            RsqrtPolicy::Fast => fast_rsqrt(x),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            RsqrtPolicy::Exact => "exact",
            RsqrtPolicy::Fast => "fast",
        }
    }
}

impl fmt::Display for RsqrtPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for RsqrtPolicy {
    type Err = KernelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "exact" => Ok(RsqrtPolicy::Exact),
            "fast" | "approx" => Ok(RsqrtPolicy::Fast),
            other => Err(KernelError::invalid_config(
                "rsqrt",
                format!("unknown policy '{}' (expected exact or fast)", other),
            )),
        }
    }
}

/// Approximate `1 / sqrt(x)` without a divide or sqrt.
///
/// The bit trick only holds for positive normal floats; anything else falls
/// back to `1.0 / x.sqrt()`.
#[inline]
pub fn fast_rsqrt(x: f32) -> f32 {
    if !x.is_normal() || x.is_sign_negative() {
        return 1.0 / x.sqrt();
    }
    let half = 0.5 * x;
    let guess = f32::from_bits(RSQRT_MAGIC.wrapping_sub(x.to_bits() >> 1));
    guess * (1.5 - half * guess * guess)
}
