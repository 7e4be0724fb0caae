//! KBA step scheduler
//!
//! Deterministically assigns `(step, octant-in-block, proc) → StepInfo`,
//! coordinating all processes into a deadlock-free pipeline with no runtime
//! negotiation.
//!
//! ## Schedule shape
//!
//! Octants are grouped into `nblock_octant` blocks of `noctant_per_block`
//! octants each. Within a block, octant-in-block `k` carries `base ^ k`: each
//! set bit of `k` mirrors the corresponding direction, and the schedule of
//! lane `k` is lane 0's schedule with the process grid reflected along the
//! mirrored axes (the *fold*). Octant blocks run back to back; a block whose
//! wavefront enters at a different corner of the process grid than its
//! predecessor is delayed by the pipeline-fill gap (`nproc − 1` per flipped
//! axis) so that no process is ever double-booked within a lane.
//!
//! For one octant block, a process at folded distance `d = fx + fy` from the
//! entry corner is active during steps `[start + d, start + d + nblock_z)`,
//! working one z-block per step — upward in z for `dir_z = Up`, downward for
//! `dir_z = Dn`.
//!
//! `nstep` is **derived** from this construction (last start + drain), never
//! hard-coded; [`StepScheduler::verify_coverage`] performs the finite search
//! establishing that every (octant, z-block, process) triple is active
//! exactly once per lane.

use crate::octant::{dir_x, dir_y, dir_z, Dir};
use crate::NOCTANT;

/// What one process does at one pipeline step for one octant-in-block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepInfo {
    /// Whether the process performs work at this step.
    pub is_active: bool,
    /// Octant carried (meaningful only when active).
    pub octant: usize,
    /// z-block operated on (meaningful only when active).
    pub block_z: usize,
}

impl StepInfo {
    const INACTIVE: Self = Self { is_active: false, octant: 0, block_z: 0 };
}

/// The constructed schedule. See the module docs for the shape.
#[derive(Debug, Clone)]
pub struct StepScheduler {
    nblock_z: usize,
    nblock_octant: usize,
    noctant_per_block: usize,
    nproc_x: usize,
    nproc_y: usize,
    base_octants: &'static [usize],
    starts: Vec<usize>,
    nstep: usize,
}

/// Base-octant sequence per octant-block count, ordered so that consecutive
/// blocks share the wavefront entry corner where possible (z flips are free;
/// x/y flips cost a pipeline-fill gap).
fn base_octants(nblock_octant: usize) -> &'static [usize] {
    match nblock_octant {
        8 => &[0, 4, 1, 5, 3, 7, 2, 6],
        4 => &[0, 4, 2, 6],
        2 => &[0, 4],
        1 => &[0],
        _ => unreachable!("octant block count must be a power of two <= 8"),
    }
}

impl StepScheduler {
    /// Construct a schedule for `nblock_z` z-blocks, `nblock_octant` octant
    /// blocks and a `nproc_x × nproc_y` process grid.
    pub fn new(nblock_z: usize, nblock_octant: usize, nproc_x: usize, nproc_y: usize) -> Self {
        assert!(nblock_z > 0, "z block count must be positive");
        assert!(
            matches!(nblock_octant, 1 | 2 | 4 | 8),
            "octant block count must be a power of two <= 8"
        );
        assert!(nproc_x > 0 && nproc_y > 0, "process grid must be nonempty");

        let bases = base_octants(nblock_octant);
        let mut starts = Vec::with_capacity(bases.len());
        let mut start = 0usize;
        for (ob, &base) in bases.iter().enumerate() {
            if ob > 0 {
                let prev = bases[ob - 1];
                start += nblock_z;
                if dir_x(prev) != dir_x(base) {
                    start += nproc_x - 1;
                }
                if dir_y(prev) != dir_y(base) {
                    start += nproc_y - 1;
                }
            }
            starts.push(start);
        }
        let nstep = start + nblock_z + (nproc_x - 1) + (nproc_y - 1);

        Self {
            nblock_z,
            nblock_octant,
            noctant_per_block: NOCTANT / nblock_octant,
            nproc_x,
            nproc_y,
            base_octants: bases,
            starts,
            nstep,
        }
    }

    /// Total number of pipeline steps.
    #[inline]
    pub fn nstep(&self) -> usize {
        self.nstep
    }

    /// Octants carried concurrently per block.
    #[inline]
    pub fn noctant_per_block(&self) -> usize {
        self.noctant_per_block
    }

    /// Folded distance of a process from an octant's wavefront entry corner.
    #[inline]
    fn fold(&self, octant: usize, proc_x: usize, proc_y: usize) -> usize {
        let fx = match dir_x(octant) {
            Dir::Up => proc_x,
            Dir::Dn => self.nproc_x - 1 - proc_x,
        };
        let fy = match dir_y(octant) {
            Dir::Up => proc_y,
            Dir::Dn => self.nproc_y - 1 - proc_y,
        };
        fx + fy
    }

    /// Pure schedule lookup.
    ///
    /// Process coordinates outside the grid are reported inactive, so the
    /// communicator can probe a neighbor of an edge process without special
    /// casing.
    pub fn step_info(
        &self,
        step: usize,
        octant_in_block: usize,
        proc_x: i64,
        proc_y: i64,
    ) -> StepInfo {
        debug_assert!(octant_in_block < self.noctant_per_block);
        if proc_x < 0
            || proc_y < 0
            || proc_x >= self.nproc_x as i64
            || proc_y >= self.nproc_y as i64
        {
            return StepInfo::INACTIVE;
        }
        let (px, py) = (proc_x as usize, proc_y as usize);

        for (ob, &base) in self.base_octants.iter().enumerate() {
            let octant = base ^ octant_in_block;
            let first = self.starts[ob] + self.fold(octant, px, py);
            if step >= first && step < first + self.nblock_z {
                let wave = step - first;
                let block_z = match dir_z(octant) {
                    Dir::Up => wave,
                    Dir::Dn => self.nblock_z - 1 - wave,
                };
                return StepInfo { is_active: true, octant, block_z };
            }
        }
        StepInfo::INACTIVE
    }

    /// Finite search establishing the schedule invariants: within every lane,
    /// every process is active for every (octant, z-block) pair exactly once,
    /// is never double-booked at a step, and finishes before `nstep`.
    pub fn verify_coverage(&self) -> bool {
        for k in 0..self.noctant_per_block {
            for py in 0..self.nproc_y {
                for px in 0..self.nproc_x {
                    let mut steps_active = std::collections::HashSet::new();
                    let mut work_seen = std::collections::HashSet::new();
                    for (ob, &base) in self.base_octants.iter().enumerate() {
                        let octant = base ^ k;
                        let first = self.starts[ob] + self.fold(octant, px, py);
                        for wave in 0..self.nblock_z {
                            let step = first + wave;
                            if step >= self.nstep {
                                return false;
                            }
                            if !steps_active.insert(step) {
                                return false;
                            }
                            let info = self.step_info(step, k, px as i64, py as i64);
                            if !info.is_active || info.octant != octant {
                                return false;
                            }
                            if !work_seen.insert((info.octant, info.block_z)) {
                                return false;
                            }
                        }
                    }
                    if work_seen.len() != self.nblock_octant * self.nblock_z {
                        return false;
                    }
                }
            }
        }
        true
    }
}

// ============================================================================
// Tests
// ============================================================================
