//! Crate root: public surface, core aliases, and sweep-wide invariants
//!
//! This module is the **single canonical entry-point** for downstream users of
//! the library. It centralizes the floating-point alias, the octant constant,
//! the sweep configuration, shared error categories, and re-exports the main
//! submodules that implement the KBA wavefront sweep.
//!
//! ## Invariants
//!
//! - **Grid & decomposition.** The global grid `nx_g × ny_g × nz` is split
//!   across a `P_x × P_y × 1` process grid; each process block is further
//!   pipelined into `nblock_z` z-sub-blocks of equal depth (`nz % nblock_z
//!   == 0` is enforced at construction).
//!
//! - **Schedule determinism.** `StepScheduler::step_info` is a pure function
//!   of its arguments and the constructed scheduler. All processes derive the
//!   same pipeline with no runtime negotiation, which is what makes the face
//!   exchange deadlock-free.
//!
//! - **Face discipline.** In asynchronous mode the xz/yz faces are triple
//!   buffered: at step `s`, buffer `s mod 3` is computed, `(s−1) mod 3` is
//!   being sent, `(s+1) mod 3` is being received. The xy face is a single
//!   buffer carrying the z recursion across z-blocks within a process.
//!
//! - **Write disjointness.** With `nsemiblock >= nthread_octant`, concurrent
//!   octant threads update disjoint semiblock subregions of the output state
//!   in every sub-step; with fewer semiblocks the guarded-update mode must be
//!   enabled explicitly.
//!
//! If any invariant is violated at runtime, the failure mode is a **precise
//! error** (never UB); communication failures abort the sweep.

#![forbid(unsafe_code)]
#![deny(missing_docs, rust_2018_idioms)]

/// Problem dimensions and flat-index accessors for the 6-D arrays.
pub mod dims;
/// Octant direction encoding (three direction bits, upstream/downstream).
pub mod octant;
/// KBA step scheduler: (step, octant-in-block, proc) → step info.
pub mod sched;
/// Face buffers (triple-buffered xz/yz, single xy) and worker chunking.
pub mod faces;
/// Process environment: grid coordinates, message tags, mailbox transport.
pub mod env;
/// Face communicator (synchronous red/black and asynchronous double-buffered).
pub mod comm;
/// Problem quantities: face inlet values, cell solve, moment/angle transforms.
pub mod quantities;
/// The sweeper: semiblock kernel, block driver, and the step orchestrator.
pub mod sweeper;

use serde::{Deserialize, Serialize};

// ============================================================================
// Canonical aliases and compile-time constants
// ============================================================================

/// Floating type used for all state and face values.
pub type P = f64;

/// Number of octants (direction combinations `(±x, ±y, ±z)`).
pub const NOCTANT: usize = 8;

/// Centralized re-exports so downstream code imports from the crate root.
pub use crate::dims::Dimensions;
pub use crate::env::{Cluster, CommError, Env};
pub use crate::quantities::{GlobalGeom, Quantities, ScaledQuantities, Transforms};
pub use crate::sched::{StepInfo, StepScheduler};
pub use crate::sweeper::Sweeper;

// ============================================================================
// Sweep configuration
// ============================================================================

/// Configuration consumed by [`Sweeper::new`].
///
/// The thread counts compose the intra-process parallelism lattice:
/// `nthread_octant × nthread_e` worker threads per pipeline step, plus the
/// serial semiblock loop acting as a barrier between sub-steps.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct SweepConfig {
    /// Number of z-sub-blocks of the per-process block; must divide `nz`.
    pub nblock_z: usize,
    /// Octant threads per block: a power of two in `{1, 2, 4, 8}`.
    pub nthread_octant: usize,
    /// Semiblock sub-steps: a power of two in `{1, 2, 4, 8}`.
    ///
    /// Must be `>= nthread_octant` unless [`SweepConfig::guarded_update`] is
    /// enabled.
    pub nsemiblock: usize,
    /// Energy-group threads per block: any positive integer.
    pub nthread_e: usize,
    /// Permit `nsemiblock < nthread_octant` by serializing overlapping
    /// output-state updates instead of relying on semiblock disjointness.
    pub guarded_update: bool,
    /// Use the asynchronous double-buffered face exchange; otherwise the
    /// synchronous red/black protocol runs at the end of every step.
    pub async_comm: bool,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            nblock_z: 1,
            nthread_octant: 1,
            nsemiblock: 1,
            nthread_e: 1,
            guarded_update: false,
            async_comm: true,
        }
    }
}

/// Configuration errors detected during sweeper construction.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// `--nblock_z` must be positive.
    #[error("invalid z blocking factor supplied (got {0})")]
    BadBlockZ(usize),
    /// All z-blocks must have the same depth.
    #[error("z blocking factor {nblock_z} does not divide nz={nz}")]
    UnevenBlockZ {
        /// Local z extent.
        nz: usize,
        /// Requested number of z-blocks.
        nblock_z: usize,
    },
    /// `--nthread_octant` must be a power of two in `{1, 2, 4, 8}`.
    #[error("invalid octant thread count supplied (got {0})")]
    BadOctantThreads(usize),
    /// `--nsemiblock` must be a power of two in `{1, 2, 4, 8}`.
    #[error("invalid semiblock count supplied (got {0})")]
    BadSemiblock(usize),
    /// An incomplete set of semiblock steps requires the guarded update mode.
    #[error(
        "nsemiblock={nsemiblock} < nthread_octant={nthread_octant} requires guarded vo update"
    )]
    SemiblockNeedsGuardedUpdate {
        /// Requested semiblock count.
        nsemiblock: usize,
        /// Requested octant thread count.
        nthread_octant: usize,
    },
    /// `--nthread_e` must be positive.
    #[error("invalid energy thread count supplied (got {0})")]
    BadEnergyThreads(usize),
}

impl SweepConfig {
    /// Validate the configuration against the local block dimensions.
    pub fn validate(&self, dims: &Dimensions) -> Result<(), ConfigError> {
        if self.nblock_z == 0 {
            return Err(ConfigError::BadBlockZ(self.nblock_z));
        }
        if dims.nz % self.nblock_z != 0 {
            return Err(ConfigError::UnevenBlockZ { nz: dims.nz, nblock_z: self.nblock_z });
        }
        let pow2_le8 = |n: usize| n > 0 && n <= NOCTANT && n & (n - 1) == 0;
        if !pow2_le8(self.nthread_octant) {
            return Err(ConfigError::BadOctantThreads(self.nthread_octant));
        }
        if !pow2_le8(self.nsemiblock) {
            return Err(ConfigError::BadSemiblock(self.nsemiblock));
        }
        if self.nsemiblock < self.nthread_octant && !self.guarded_update {
            return Err(ConfigError::SemiblockNeedsGuardedUpdate {
                nsemiblock: self.nsemiblock,
                nthread_octant: self.nthread_octant,
            });
        }
        if self.nthread_e == 0 {
            return Err(ConfigError::BadEnergyThreads(self.nthread_e));
        }
        Ok(())
    }
}

// ============================================================================
// Shared error category
// ============================================================================

/// Errors surfaced by a sweep. No error is recovered inside the sweep; the
/// sweep either completes or aborts with one of these.
#[derive(Debug, thiserror::Error)]
pub enum SweepError {
    /// Invalid configuration detected at construction.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Shape invariant violation at construction or first exchange.
    #[error(transparent)]
    Dims(#[from] dims::DimsError),
    /// Communication failure surfaced by the environment.
    #[error(transparent)]
    Comm(#[from] CommError),
    /// State vectors do not match the constructed dimensions.
    #[error("state vector length {got} does not match dimensions (expected {expected})")]
    BadStateLen {
        /// Expected element count.
        expected: usize,
        /// Provided element count.
        got: usize,
    },
}
