//! Fork-join dispatch for SPMD kernels
//!
//! A kernel phase is expressed as one task body plus one payload per compute
//! unit. The dispatcher invokes the body once per unit and returns only when
//! every unit has finished, which is the barrier between kernel phases.
//!
//! - **Sequential**: units run one after another on the calling thread
//! - **Scoped threads**: one `std::thread::scope` thread per unit
//! - **Rayon pool**: a dedicated pool with exactly one worker per unit
//!
//! # Usage
//!
//! ```ignore
//! use forknorm::kernels::parallel::{Dispatcher, DispatchMode, ForkJoin};
//!
//! let dispatcher = Dispatcher::new(DispatchMode::Threads, 4)?;
//! let mut slots = vec![0usize; 4];
//! dispatcher.fork_join(slots.iter_mut().collect(), |unit, slot| *slot = unit.index());
//! ```

use crate::error::{KernelError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identity of one compute unit inside a fork.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UnitId {
    index: usize,
    count: usize,
}

impl UnitId {
    pub fn new(index: usize, count: usize) -> Self {
        debug_assert!(index < count);
        Self { index, count }
    }

    /// Index of this unit in `[0, count)`.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Number of units taking part in the fork.
    pub fn count(&self) -> usize {
        self.count
    }
}

/// Capability to run one task body across a fixed set of compute units.
///
/// Implementations must invoke `task` exactly once per payload, with
/// `UnitId::index()` equal to the payload's position, and must not return
/// before all invocations have returned. A panic in any unit is propagated
/// to the caller once the remaining units have been joined.
pub trait ForkJoin: Send + Sync + fmt::Debug {
    /// Returns the name of this dispatcher (e.g., "sequential", "rayon").
    fn name(&self) -> &'static str;

    /// Fork `payloads.len()` units, then join them all.
    fn fork_join<T, F>(&self, payloads: Vec<T>, task: F)
    where
        T: Send,
        F: Fn(UnitId, T) + Sync;
}

/// Runs every unit on the calling thread, in index order.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sequential;

impl ForkJoin for Sequential {
    fn name(&self) -> &'static str {
        "sequential"
    }

    fn fork_join<T, F>(&self, payloads: Vec<T>, task: F)
    where
        T: Send,
        F: Fn(UnitId, T) + Sync,
    {
        let count = payloads.len();
        for (index, payload) in payloads.into_iter().enumerate() {
            task(UnitId::new(index, count), payload);
        }
    }
}

/// Spawns one scoped OS thread per unit for every fork.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScopedThreads;

impl ForkJoin for ScopedThreads {
    fn name(&self) -> &'static str {
        "threads"
    }

    fn fork_join<T, F>(&self, payloads: Vec<T>, task: F)
    where
        T: Send,
        F: Fn(UnitId, T) + Sync,
    {
        let count = payloads.len();
        let task = &task;
        std::thread::scope(|s| {
            for (index, payload) in payloads.into_iter().enumerate() {
                s.spawn(move || task(UnitId::new(index, count), payload));
            }
        });
    }
}

/// Dedicated rayon pool sized to the unit count.
///
/// Workers are named `forknorm-unit-{idx}`. Each fork is a `rayon::scope`
/// with one spawned task per unit, so the pool never runs more units
/// concurrently than it has workers.
#[cfg(feature = "parallel")]
pub struct RayonPool {
    pool: rayon::ThreadPool,
}

#[cfg(feature = "parallel")]
impl RayonPool {
    pub fn new(num_threads: usize) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .thread_name(|idx| format!("forknorm-unit-{idx}"))
            .build()
            .map_err(|e| KernelError::ThreadPool(e.to_string()))?;
        Ok(Self { pool })
    }

    pub fn num_threads(&self) -> usize {
        self.pool.current_num_threads()
    }
}

#[cfg(feature = "parallel")]
impl fmt::Debug for RayonPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RayonPool")
            .field("num_threads", &self.num_threads())
            .finish()
    }
}

#[cfg(feature = "parallel")]
impl ForkJoin for RayonPool {
    fn name(&self) -> &'static str {
        "rayon"
    }

    fn fork_join<T, F>(&self, payloads: Vec<T>, task: F)
    where
        T: Send,
        F: Fn(UnitId, T) + Sync,
    {
        let count = payloads.len();
        let task = &task;
        self.pool.scope(|s| {
            for (index, payload) in payloads.into_iter().enumerate() {
                s.spawn(move |_| task(UnitId::new(index, count), payload));
            }
        });
    }
}

/// Which dispatcher a kernel should be built with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    Sequential,
    Threads,
    Rayon,
}

impl Default for DispatchMode {
    #[cfg(feature = "parallel")]
    fn default() -> Self {
        DispatchMode::Rayon
    }

    #[cfg(not(feature = "parallel"))]
    fn default() -> Self {
        DispatchMode::Threads
    }
}

impl DispatchMode {
    pub fn name(self) -> &'static str {
        match self {
            DispatchMode::Sequential => "sequential",
            DispatchMode::Threads => "threads",
            DispatchMode::Rayon => "rayon",
        }
    }
}

impl fmt::Display for DispatchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DispatchMode {
    type Err = KernelError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "sequential" | "seq" => Ok(DispatchMode::Sequential),
            "threads" | "thread" => Ok(DispatchMode::Threads),
            "rayon" => Ok(DispatchMode::Rayon),
            other => Err(KernelError::invalid_config(
                "dispatch",
                format!(
                    "unknown dispatcher '{}' (expected sequential, threads or rayon)",
                    other
                ),
            )),
        }
    }
}

/// Concrete dispatcher selected at runtime from a [`DispatchMode`].
#[derive(Debug)]
pub enum Dispatcher {
    Sequential(Sequential),
    ScopedThreads(ScopedThreads),
    #[cfg(feature = "parallel")]
    Rayon(RayonPool),
}

impl Dispatcher {
    /// Build the dispatcher for `mode`, sized for `unit_count` units.
    pub fn new(mode: DispatchMode, unit_count: usize) -> Result<Self> {
        if unit_count == 0 {
            return Err(KernelError::invalid_argument(
                "unit_count",
                "must be at least 1",
            ));
        }

        match mode {
            DispatchMode::Sequential => Ok(Dispatcher::Sequential(Sequential)),
            DispatchMode::Threads => Ok(Dispatcher::ScopedThreads(ScopedThreads)),
            #[cfg(feature = "parallel")]
            DispatchMode::Rayon => Ok(Dispatcher::Rayon(RayonPool::new(unit_count)?)),
            #[cfg(not(feature = "parallel"))]
            DispatchMode::Rayon => Err(KernelError::invalid_config(
                "dispatch",
                "rayon dispatcher requires the `parallel` feature",
            )),
        }
    }
}

impl ForkJoin for Dispatcher {
    fn name(&self) -> &'static str {
        match self {
            Dispatcher::Sequential(d) => d.name(),
            Dispatcher::ScopedThreads(d) => d.name(),
            #[cfg(feature = "parallel")]
            Dispatcher::Rayon(d) => d.name(),
        }
    }

    fn fork_join<T, F>(&self, payloads: Vec<T>, task: F)
    where
        T: Send,
        F: Fn(UnitId, T) + Sync,
    {
        match self {
            Dispatcher::Sequential(d) => d.fork_join(payloads, task),
            Dispatcher::ScopedThreads(d) => d.fork_join(payloads, task),
            #[cfg(feature = "parallel")]
            Dispatcher::Rayon(d) => d.fork_join(payloads, task),
        }
    }
}

/// Get the number of CPUs available for parallel work
#[cfg(feature = "parallel")]
pub fn num_cpus() -> usize {
    rayon::current_num_threads()
}

#[cfg(not(feature = "parallel"))]
pub fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(1)
}
