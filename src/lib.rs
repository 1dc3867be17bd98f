pub mod config;
pub mod error;
pub mod kernels;
pub mod tensor;

pub use config::KernelConfig;
pub use error::{KernelError, Result};
pub use kernels::rmsnorm::rmsnorm;
pub use kernels::{DispatchMode, ForkJoin, RmsNormKernel, RsqrtPolicy, UnitId};
