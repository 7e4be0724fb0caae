//! The KBA sweeper
//!
//! Composes the scheduler, faces, communicator and quantities into the
//! three-level parallel sweep: pipelined z-blocks across steps, octant
//! threads over disjoint semiblock subregions, and energy threads over
//! group ranges.
//!
//! ## Why semiblocks
//!
//! Threading octants means two octants may target the same output cell in
//! the same step. Rather than making every output update atomic, the step is
//! broken into `nsemiblock` sub-steps and the block into subregions: along
//! each octant-threaded axis the block is halved, and at any sub-step the
//! octants assigned to concurrent threads address opposite halves (the
//! direction bit of the octant picks the half, so octants that differ in a
//! threaded axis's direction can never collide). The sub-steps are visited
//! forward, with the half-order per octant arranged so cells are still
//! reached only after their upstream neighbors — the sweep recursion is
//! preserved across semiblock seams by the face arrays.
//!
//! Worker threads accumulate each semiblock's output contributions into a
//! private scratch run and apply it under a short lock; when `nsemiblock >=
//! nthread_octant` the applied regions are disjoint and the lock is
//! contention only. A barrier separates sub-steps.

#![allow(clippy::too_many_arguments)]

use std::sync::{Barrier, Mutex};

use tracing::{debug, info};

use crate::comm::FaceComm;
use crate::dims::Dimensions;
use crate::env::Env;
use crate::faces::{FaceSet, LaneFaces};
use crate::octant::{dir_x, dir_y, dir_z, ordered, Dir};
use crate::quantities::{CellCtx, GlobalGeom, Quantities, Transforms};
use crate::sched::{StepInfo, StepScheduler};
use crate::{SweepConfig, SweepError, P};

/// The sweep engine owned by one rank. Owns the scheduler, the face buffers
/// and the angle scratch for its lifetime; borrows the state vectors, the
/// quantities and the environment per sweep.
pub struct Sweeper {
    cfg: SweepConfig,
    dims: Dimensions,
    dims_b: Dimensions,
    dims_g: Dimensions,
    geom: GlobalGeom,
    noctant_per_block: usize,
    sched: StepScheduler,
    faces: FaceSet,
    comm: FaceComm,
    v_local: Vec<P>,
    e_bounds: Vec<usize>,
}

#[derive(Debug, Clone, Copy)]
struct EdgeFlags {
    x_min: bool,
    x_max: bool,
    y_min: bool,
    y_max: bool,
}

impl Sweeper {
    /// Validate the configuration and allocate the sweep resources.
    pub fn new(
        dims: Dimensions,
        geom: GlobalGeom,
        env: &Env,
        cfg: SweepConfig,
    ) -> Result<Self, SweepError> {
        cfg.validate(&dims)?;
        let noctant_per_block = cfg.nthread_octant;
        let nblock_octant = crate::NOCTANT / noctant_per_block;
        let sched =
            StepScheduler::new(cfg.nblock_z, nblock_octant, env.nproc_x(), env.nproc_y());
        let dims_b = dims.with_nz(dims.nz / cfg.nblock_z);
        let dims_g = Dimensions { nx: geom.nx_g, ny: geom.ny_g, ..dims };
        let faces = FaceSet::new(dims_b, noctant_per_block, cfg.async_comm);
        let comm = FaceComm::new(noctant_per_block);
        let v_local = vec![0.0; noctant_per_block * cfg.nthread_e * dims.slot()];
        let e_bounds: Vec<usize> =
            (0..=cfg.nthread_e).map(|t| dims.ne * t / cfg.nthread_e).collect();

        Ok(Self {
            cfg,
            dims,
            dims_b,
            dims_g,
            geom,
            noctant_per_block,
            sched,
            faces,
            comm,
            v_local,
            e_bounds,
        })
    }

    /// Total pipeline steps this sweep executes.
    #[inline]
    pub fn nstep(&self) -> usize {
        self.sched.nstep()
    }

    /// Perform one full sweep: `vo` is zeroed, then accumulates every
    /// octant's contribution for every cell.
    pub fn sweep(
        &mut self,
        vo: &mut [P],
        vi: &[P],
        quan: &dyn Quantities,
        xf: &Transforms,
        env: &mut Env,
    ) -> Result<(), SweepError> {
        let expected = self.dims.size_state();
        for len in [vo.len(), vi.len()] {
            if len != expected {
                return Err(SweepError::BadStateLen { expected, got: len });
            }
        }

        vo.fill(0.0);
        let nstep = self.sched.nstep();

        for step in 0..nstep {
            debug!(step, "sweep step");

            if self.cfg.async_comm {
                if step > 0 {
                    self.comm.recv_end(env, &mut self.faces, step - 1)?;
                }
                self.comm.recv_start(&self.sched, env, step)?;
            }

            self.sweep_block(vo, vi, step, quan, xf, env);

            if self.cfg.async_comm {
                if step > 0 {
                    self.comm.send_end(step - 1);
                }
                self.comm.send_start(&self.sched, env, &self.faces, step)?;
            } else {
                self.comm.exchange_sync(&self.sched, env, &mut self.faces, step)?;
            }
        }

        env.increment_tag(self.noctant_per_block as u32);
        info!(nstep, tag = env.tag(), "sweep complete");
        Ok(())
    }

    /// One pipeline step of block work: all octant-in-block lanes, all
    /// semiblock sub-steps, all energy ranges.
    fn sweep_block(
        &mut self,
        vo: &mut [P],
        vi: &[P],
        step: usize,
        quan: &dyn Quantities,
        xf: &Transforms,
        env: &Env,
    ) {
        let px = env.proc_x_this() as i64;
        let py = env.proc_y_this() as i64;
        let infos: Vec<StepInfo> = (0..self.noctant_per_block)
            .map(|k| self.sched.step_info(step, k, px, py))
            .collect();
        if infos.iter().all(|i| !i.is_active) {
            return;
        }
        let edges = EdgeFlags {
            x_min: env.proc_x_this() == 0,
            x_max: env.proc_x_this() == env.nproc_x() - 1,
            y_min: env.proc_y_this() == 0,
            y_max: env.proc_y_this() == env.nproc_y() - 1,
        };

        let nthread_e = self.cfg.nthread_e;
        let nworkers = self.noctant_per_block * nthread_e;
        let slot = self.dims.slot();
        let vo_shared: Mutex<&mut [P]> = Mutex::new(vo);
        let barrier = Barrier::new(nworkers);

        let face_chunks = self.faces.worker_chunks(step, &self.e_bounds);
        let vlocal_chunks = self.v_local.chunks_mut(slot);

        let mut workers: Vec<BlockWorker<'_>> = face_chunks
            .into_iter()
            .zip(vlocal_chunks)
            .enumerate()
            .map(|(w, (faces, v_local))| {
                let lane = w / nthread_e;
                let te = w % nthread_e;
                BlockWorker {
                    info: infos[lane],
                    e0: self.e_bounds[te],
                    e1: self.e_bounds[te + 1],
                    faces,
                    v_local,
                    vi,
                    vo: &vo_shared,
                    barrier: &barrier,
                    dims: &self.dims,
                    dims_b: &self.dims_b,
                    dims_g: &self.dims_g,
                    geom: self.geom,
                    nblock_z: self.cfg.nblock_z,
                    nsemiblock: self.cfg.nsemiblock,
                    edges,
                    quan,
                    xf,
                    scratch: Vec::new(),
                }
            })
            .collect();

        if nworkers == 1 {
            if let Some(w) = workers.pop() {
                w.run();
            }
        } else {
            std::thread::scope(|s| {
                for w in workers {
                    s.spawn(move || w.run());
                }
            });
        }
    }
}

// ============================================================================
// Per-worker block computation
// ============================================================================

/// One worker's share of a block step: a single octant-in-block lane
/// restricted to one energy range.
struct BlockWorker<'a> {
    info: StepInfo,
    e0: usize,
    e1: usize,
    faces: LaneFaces<'a>,
    v_local: &'a mut [P],
    vi: &'a [P],
    vo: &'a Mutex<&'a mut [P]>,
    barrier: &'a Barrier,
    dims: &'a Dimensions,
    dims_b: &'a Dimensions,
    dims_g: &'a Dimensions,
    geom: GlobalGeom,
    nblock_z: usize,
    nsemiblock: usize,
    edges: EdgeFlags,
    quan: &'a dyn Quantities,
    xf: &'a Transforms,
    scratch: Vec<P>,
}

/// Inclusive cell bounds of one axis of a semiblock, plus whether the
/// semiblock contains the block's low/high end of that axis. `None` when the
/// subregion is empty (an axis of extent 1 split in half).
fn semiblock_bounds(
    semiblock: usize,
    axis: usize,
    nsemiblock: usize,
    n: usize,
    dir: Dir,
) -> Option<(usize, usize, bool, bool)> {
    let is_semiblocked = nsemiblock > (1 << axis);
    let is_lo = ((semiblock >> axis) & 1 == 0) == (dir == Dir::Up);
    let has_lo = is_lo || !is_semiblocked;
    let has_hi = !is_lo || !is_semiblocked;
    let min = if has_lo { 0 } else { (n / 2) as isize };
    let max = if has_hi { n as isize - 1 } else { (n / 2) as isize - 1 };
    if min > max {
        return None;
    }
    Some((min as usize, max as usize, has_lo, has_hi))
}

impl BlockWorker<'_> {
    fn run(mut self) {
        for semiblock in 0..self.nsemiblock {
            if self.info.is_active {
                self.do_semiblock(semiblock);
            }
            self.barrier.wait();
        }
    }

    fn do_semiblock(&mut self, semiblock: usize) {
        let octant = self.info.octant;
        let block_z = self.info.block_z;
        let (dx, dy, dz) = (dir_x(octant), dir_y(octant), dir_z(octant));
        let ns = self.nsemiblock;

        let Some((ixmin, ixmax, has_x_lo, has_x_hi)) =
            semiblock_bounds(semiblock, 0, ns, self.dims_b.nx, dx)
        else {
            return;
        };
        let Some((iymin, iymax, has_y_lo, has_y_hi)) =
            semiblock_bounds(semiblock, 1, ns, self.dims_b.ny, dy)
        else {
            return;
        };
        let Some((izmin, izmax, has_z_lo, has_z_hi)) =
            semiblock_bounds(semiblock, 2, ns, self.dims_b.nz, dz)
        else {
            return;
        };

        // Physical boundary conditions, where this semiblock touches an
        // inlet face of the global domain.
        if (dz == Dir::Up && block_z == 0 && has_z_lo)
            || (dz == Dir::Dn && block_z == self.nblock_z - 1 && has_z_hi)
        {
            self.set_boundary_xy(octant, ixmin, ixmax, iymin, iymax);
        }
        if (dy == Dir::Up && self.edges.y_min && has_y_lo)
            || (dy == Dir::Dn && self.edges.y_max && has_y_hi)
        {
            self.set_boundary_xz(octant, block_z, ixmin, ixmax, izmin, izmax);
        }
        if (dx == Dir::Up && self.edges.x_min && has_x_lo)
            || (dx == Dir::Dn && self.edges.x_max && has_x_hi)
        {
            self.set_boundary_yz(octant, block_z, iymin, iymax, izmin, izmax);
        }

        self.sweep_semiblock(octant, block_z, ixmin, ixmax, iymin, iymax, izmin, izmax);
    }

    fn set_boundary_xy(&mut self, octant: usize, ixmin: usize, ixmax: usize, iymin: usize, iymax: usize) {
        let dz = dir_z(octant);
        let iz_g = if dz == Dir::Up { -1 } else { self.dims_g.nz as i64 };
        let (na, nu) = (self.dims_b.na, self.dims_b.nu);
        for ie in self.e0..self.e1 {
            for iu in 0..nu {
                for iy in iymin..=iymax {
                    let iy_g = (iy + self.geom.iy_base) as i64;
                    for ix in ixmin..=ixmax {
                        let ix_g = (ix + self.geom.ix_base) as i64;
                        let slotv = self.faces.slot_xy_mut(ix, iy, ie);
                        for ia in 0..na {
                            slotv[iu * na + ia] = self.quan.init_facexy(
                                ix_g, iy_g, iz_g, ie, ia, iu, octant, self.dims_g,
                            );
                        }
                    }
                }
            }
        }
    }

    fn set_boundary_xz(
        &mut self,
        octant: usize,
        block_z: usize,
        ixmin: usize,
        ixmax: usize,
        izmin: usize,
        izmax: usize,
    ) {
        let dy = dir_y(octant);
        let iy_g = if dy == Dir::Up { -1 } else { self.dims_g.ny as i64 };
        let iz_base = block_z * self.dims_b.nz;
        let (na, nu) = (self.dims_b.na, self.dims_b.nu);
        for ie in self.e0..self.e1 {
            for iu in 0..nu {
                for iz in izmin..=izmax {
                    let iz_g = (iz + iz_base) as i64;
                    for ix in ixmin..=ixmax {
                        let ix_g = (ix + self.geom.ix_base) as i64;
                        let slotv = self.faces.slot_xz_mut(ix, iz, ie);
                        for ia in 0..na {
                            slotv[iu * na + ia] = self.quan.init_facexz(
                                ix_g, iy_g, iz_g, ie, ia, iu, octant, self.dims_g,
                            );
                        }
                    }
                }
            }
        }
    }

    fn set_boundary_yz(
        &mut self,
        octant: usize,
        block_z: usize,
        iymin: usize,
        iymax: usize,
        izmin: usize,
        izmax: usize,
    ) {
        let dx = dir_x(octant);
        let ix_g = if dx == Dir::Up { -1 } else { self.dims_g.nx as i64 };
        let iz_base = block_z * self.dims_b.nz;
        let (na, nu) = (self.dims_b.na, self.dims_b.nu);
        for ie in self.e0..self.e1 {
            for iu in 0..nu {
                for iz in izmin..=izmax {
                    let iz_g = (iz + iz_base) as i64;
                    for iy in iymin..=iymax {
                        let iy_g = (iy + self.geom.iy_base) as i64;
                        let slotv = self.faces.slot_yz_mut(iy, iz, ie);
                        for ia in 0..na {
                            slotv[iu * na + ia] = self.quan.init_faceyz(
                                ix_g, iy_g, iz_g, ie, ia, iu, octant, self.dims_g,
                            );
                        }
                    }
                }
            }
        }
    }

    /// Cell-by-cell recursion over one semiblock, in octant direction order.
    fn sweep_semiblock(
        &mut self,
        octant: usize,
        block_z: usize,
        ixmin: usize,
        ixmax: usize,
        iymin: usize,
        iymax: usize,
        izmin: usize,
        izmax: usize,
    ) {
        let d = self.dims_b;
        let (na, nm, nu) = (d.na, d.nm, d.nu);
        let iz_base = block_z * d.nz;
        let zplane = self.dims.size_state_zplane();
        let vi_b = &self.vi[iz_base * zplane..iz_base * zplane + d.size_state()];

        let xs: Vec<usize> = ordered(ixmin, ixmax, dir_x(octant)).collect();
        let ys: Vec<usize> = ordered(iymin, iymax, dir_y(octant)).collect();
        let zs: Vec<usize> = ordered(izmin, izmax, dir_z(octant)).collect();

        self.scratch.clear();

        for &iz in &zs {
            let iz_g = (iz + iz_base) as i64;
            for &iy in &ys {
                let iy_g = (iy + self.geom.iy_base) as i64;
                for &ix in &xs {
                    let ix_g = (ix + self.geom.ix_base) as i64;
                    for ie in self.e0..self.e1 {
                        // Moments → angles.
                        for iu in 0..nu {
                            for ia in 0..na {
                                let mut r = 0.0;
                                for im in 0..nm {
                                    r += self.xf.a_from_m[d.ind_a_from_m(im, ia, octant)]
                                        * vi_b[d.ind_state(ix, iy, iz, ie, im, iu)];
                                }
                                self.v_local[iu * na + ia] = r;
                            }
                        }

                        // Cell solve: reads the three upstream face slots,
                        // leaves the downstream values in them.
                        let (fxy, fxz, fyz) = self.faces.cell_slots(ix, iy, iz, ie);
                        let ctx = CellCtx {
                            ix,
                            iy,
                            iz,
                            ix_g,
                            iy_g,
                            iz_g,
                            ie,
                            octant,
                            dims_b: self.dims_b,
                            dims_g: self.dims_g,
                        };
                        self.quan.solve(self.v_local, fxy, fxz, fyz, &ctx);

                        // Angles → moments, staged into the scratch run.
                        for im in 0..nm {
                            for iu in 0..nu {
                                let mut r = 0.0;
                                for ia in 0..na {
                                    r += self.xf.m_from_a[d.ind_m_from_a(im, ia, octant)]
                                        * self.v_local[iu * na + ia];
                                }
                                self.scratch.push(r);
                            }
                        }
                    }
                }
            }
        }

        self.apply_scratch(iz_base, zplane, &xs, &ys, &zs);
    }

    /// Add the staged contributions to the shared output under the lock.
    /// The staging order is replayed exactly, so each cell's `(ie, im, iu)`
    /// run lands contiguously.
    fn apply_scratch(&mut self, iz_base: usize, zplane: usize, xs: &[usize], ys: &[usize], zs: &[usize]) {
        let d = self.dims_b;
        let run = (self.e1 - self.e0) * d.nm * d.nu;
        let mut guard = self.vo.lock().unwrap_or_else(|e| e.into_inner());
        let vo_b = &mut (**guard)[iz_base * zplane..iz_base * zplane + d.size_state()];
        let mut cursor = 0;
        for &iz in zs {
            for &iy in ys {
                for &ix in xs {
                    let base = d.ind_state(ix, iy, iz, self.e0, 0, 0);
                    for j in 0..run {
                        vo_b[base + j] += self.scratch[cursor + j];
                    }
                    cursor += run;
                }
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::Cluster;
    use crate::quantities::{split_extent, ScaledQuantities};
    use crate::ConfigError;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    /// Scenario stub: each cell's outgoing value is the average of the three
    /// upstream faces and the incoming cell value; inlets are zero.
    #[derive(Clone, Copy)]
    struct AveragingStub;

    impl Quantities for AveragingStub {
        fn init_facexy(
            &self,
            _ix_g: i64,
            _iy_g: i64,
            _iz_g: i64,
            _ie: usize,
            _ia: usize,
            _iu: usize,
            _octant: usize,
            _dims_g: &Dimensions,
        ) -> P {
            0.0
        }
        fn init_facexz(
            &self,
            _ix_g: i64,
            _iy_g: i64,
            _iz_g: i64,
            _ie: usize,
            _ia: usize,
            _iu: usize,
            _octant: usize,
            _dims_g: &Dimensions,
        ) -> P {
            0.0
        }
        fn init_faceyz(
            &self,
            _ix_g: i64,
            _iy_g: i64,
            _iz_g: i64,
            _ie: usize,
            _ia: usize,
            _iu: usize,
            _octant: usize,
            _dims_g: &Dimensions,
        ) -> P {
            0.0
        }
        fn solve(
            &self,
            v_local: &mut [P],
            facexy: &mut [P],
            facexz: &mut [P],
            faceyz: &mut [P],
            _ctx: &CellCtx<'_>,
        ) {
            for i in 0..v_local.len() {
                let r = (facexy[i] + facexz[i] + faceyz[i] + v_local[i]) / 2.0;
                v_local[i] = r;
                facexy[i] = r;
                facexz[i] = r;
                faceyz[i] = r;
            }
        }
    }

    fn cube(nx: usize, ny: usize, nz: usize) -> Dimensions {
        Dimensions::new(nx, ny, nz, 1, 1, 1, 1).unwrap()
    }

    fn run_single(dims: Dimensions, cfg: SweepConfig, quan: &dyn Quantities) -> Vec<P> {
        let mut env = Env::single();
        let geom = GlobalGeom { nx_g: dims.nx, ny_g: dims.ny, ix_base: 0, iy_base: 0 };
        let mut sweeper = Sweeper::new(dims, geom, &env, cfg).unwrap();
        let xf = Transforms::identity(&dims);
        let vi = vec![1.0; dims.size_state()];
        let mut vo = vec![0.0; dims.size_state()];
        sweeper.sweep(&mut vo, &vi, quan, &xf, &mut env).unwrap();
        assert!(sweeper.comm.is_drained());
        vo
    }

    /// Run on an in-process grid and assemble the global output.
    fn run_grid(
        nproc_x: usize,
        nproc_y: usize,
        dims_g: Dimensions,
        cfg: SweepConfig,
        quan: &dyn Quantities,
    ) -> Vec<P> {
        let results = Cluster::run(nproc_x, nproc_y, |mut env| {
            let (ix_base, nx) = split_extent(dims_g.nx, nproc_x, env.proc_x_this());
            let (iy_base, ny) = split_extent(dims_g.ny, nproc_y, env.proc_y_this());
            let dims = Dimensions { nx, ny, ..dims_g };
            let geom = GlobalGeom { nx_g: dims_g.nx, ny_g: dims_g.ny, ix_base, iy_base };
            let mut sweeper = Sweeper::new(dims, geom, &env, cfg).unwrap();
            let xf = Transforms::identity(&dims);
            let vi = vec![1.0; dims.size_state()];
            let mut vo = vec![0.0; dims.size_state()];
            sweeper.sweep(&mut vo, &vi, quan, &xf, &mut env).unwrap();
            assert!(sweeper.comm.is_drained());
            (dims, geom, vo)
        });

        let mut global = vec![0.0; dims_g.size_state()];
        for (dims, geom, vo) in results {
            for iz in 0..dims.nz {
                for iy in 0..dims.ny {
                    for ix in 0..dims.nx {
                        for ie in 0..dims.ne {
                            for im in 0..dims.nm {
                                for iu in 0..dims.nu {
                                    let g = dims_g.ind_state(
                                        ix + geom.ix_base,
                                        iy + geom.iy_base,
                                        iz,
                                        ie,
                                        im,
                                        iu,
                                    );
                                    global[g] = vo[dims.ind_state(ix, iy, iz, ie, im, iu)];
                                }
                            }
                        }
                    }
                }
            }
        }
        global
    }

    // ------------------------- scenarios -------------------------

    /// 2×2×2 toy lattice, serial, no decomposition: each cell collects the
    /// eight distance-class values ½, 3×¾, 3×5/4, 19/8 = 71/8.
    #[test]
    fn s1_eight_cell_lattice_is_pinned() {
        let vo = run_single(cube(2, 2, 2), SweepConfig::default(), &AveragingStub);
        for &v in &vo {
            assert_eq!(v, 8.875);
        }
    }

    /// Two z-blocks pipeline 16 steps and reproduce the unblocked answer.
    #[test]
    fn s2_z_blocking_pins_nstep_and_output() {
        let dims = cube(4, 4, 4);
        let env = Env::single();
        let geom = GlobalGeom { nx_g: 4, ny_g: 4, ix_base: 0, iy_base: 0 };
        let cfg = SweepConfig { nblock_z: 2, ..Default::default() };
        let sweeper = Sweeper::new(dims, geom, &env, cfg).unwrap();
        assert_eq!(sweeper.nstep(), 16);

        let reference = run_single(dims, SweepConfig::default(), &AveragingStub);
        let blocked = run_single(dims, cfg, &AveragingStub);
        assert_eq!(reference, blocked);
    }

    /// 2×2 process grid, global 8×8×4: bitwise equal to the serial sweep.
    #[test]
    fn s3_process_grid_matches_serial() {
        let dims_g = cube(8, 8, 4);
        let serial = run_single(dims_g, SweepConfig::default(), &AveragingStub);
        let grid = run_grid(2, 2, dims_g, SweepConfig::default(), &AveragingStub);
        assert_eq!(serial, grid);
    }

    /// Octant threading with matching semiblock count reproduces the serial
    /// answer exactly.
    #[test]
    fn s4_octant_threads_match_serial() {
        let dims = cube(4, 4, 4);
        let reference = run_single(dims, SweepConfig::default(), &AveragingStub);
        for (nthread_octant, nsemiblock) in [(2, 2), (2, 4), (4, 4)] {
            let cfg = SweepConfig { nthread_octant, nsemiblock, ..Default::default() };
            assert_eq!(reference, run_single(dims, cfg, &AveragingStub));
        }
    }

    /// Full octant threading: 8 sub-steps, each touching one octet.
    #[test]
    fn b3_eight_octant_threads_eight_semiblocks() {
        let dims = cube(4, 4, 4);
        let reference = run_single(dims, SweepConfig::default(), &AveragingStub);
        let cfg = SweepConfig { nthread_octant: 8, nsemiblock: 8, ..Default::default() };
        assert_eq!(reference, run_single(dims, cfg, &AveragingStub));
    }

    /// Guarded-update mode (fewer semiblocks than octant threads) agrees to
    /// within accumulation-order tolerance.
    #[test]
    fn s5_guarded_update_matches_within_tolerance() {
        let dims = cube(4, 4, 4);
        let reference = run_single(dims, SweepConfig::default(), &AveragingStub);
        let cfg = SweepConfig {
            nthread_octant: 4,
            nsemiblock: 2,
            guarded_update: true,
            ..Default::default()
        };
        let got = run_single(dims, cfg, &AveragingStub);
        for (r, g) in reference.iter().zip(&got) {
            assert!((r - g).abs() <= 1e-12 * r.abs());
        }
    }

    /// Asynchronous and synchronous communicators agree bit for bit.
    #[test]
    fn s6_async_and_sync_comm_agree() {
        let dims_g = cube(8, 8, 4);
        let async_cfg = SweepConfig::default();
        let sync_cfg = SweepConfig { async_comm: false, ..Default::default() };
        let a = run_grid(2, 2, dims_g, async_cfg, &AveragingStub);
        let b = run_grid(2, 2, dims_g, sync_cfg, &AveragingStub);
        assert_eq!(a, b);
    }

    // ------------------------- properties -------------------------

    /// The sweep is a pure function of (vi, quantities, config): repeating
    /// it reproduces the output bitwise, including across the tag advance.
    #[test]
    fn r1_sweep_is_deterministic_and_repeatable() {
        let dims = Dimensions::new(3, 2, 4, 2, 2, 3, 4).unwrap();
        let mut env = Env::single();
        let geom = GlobalGeom { nx_g: 3, ny_g: 2, ix_base: 0, iy_base: 0 };
        let cfg = SweepConfig { nblock_z: 2, ..Default::default() };
        let mut sweeper = Sweeper::new(dims, geom, &env, cfg).unwrap();
        let xf = Transforms::identity(&dims);
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let vi: Vec<P> =
            (0..dims.size_state()).map(|_| rng.gen_range(0.25..4.0)).collect();
        let mut vo1 = vec![0.0; dims.size_state()];
        let mut vo2 = vec![7.0; dims.size_state()]; // stale garbage is zeroed
        sweeper.sweep(&mut vo1, &vi, &ScaledQuantities, &xf, &mut env).unwrap();
        sweeper.sweep(&mut vo2, &vi, &ScaledQuantities, &xf, &mut env).unwrap();
        assert_eq!(vo1, vo2);
        assert_eq!(env.tag(), 2);
    }

    /// The scaled model also decomposes exactly across the process grid and
    /// across threading, with multi-group, multi-moment state.
    #[test]
    fn scaled_model_is_invariant_under_decomposition() {
        let dims_g = Dimensions::new(4, 4, 2, 2, 2, 2, 4).unwrap();
        let serial = run_single(dims_g, SweepConfig::default(), &ScaledQuantities);

        let grid = run_grid(2, 2, dims_g, SweepConfig::default(), &ScaledQuantities);
        assert_eq!(serial, grid);

        // Octant threading reorders each cell's eight accumulations; the
        // octant factors 3, 5, 6, 7 are not dyadic, so compare to
        // associativity tolerance rather than bitwise.
        let threaded_cfg = SweepConfig {
            nthread_octant: 2,
            nsemiblock: 2,
            nthread_e: 2,
            ..Default::default()
        };
        let threaded = run_single(dims_g, threaded_cfg, &ScaledQuantities);
        for (s, t) in serial.iter().zip(&threaded) {
            assert!((s - t).abs() <= 1e-12 * s.abs());
        }
    }

    /// Uneven process splits still agree with the serial reference.
    #[test]
    fn uneven_grid_split_matches_serial() {
        let dims_g = cube(5, 4, 2);
        let serial = run_single(dims_g, SweepConfig::default(), &AveragingStub);
        let grid = run_grid(2, 1, dims_g, SweepConfig::default(), &AveragingStub);
        assert_eq!(serial, grid);
    }

    /// Energy threading with more threads than groups degenerates cleanly.
    #[test]
    fn surplus_energy_threads_are_harmless() {
        let dims = Dimensions::new(3, 3, 2, 1, 1, 1, 2).unwrap();
        let reference = run_single(dims, SweepConfig::default(), &AveragingStub);
        let cfg = SweepConfig { nthread_e: 3, ..Default::default() };
        assert_eq!(reference, run_single(dims, cfg, &AveragingStub));
    }

    // ------------------------- construction errors -------------------------

    #[test]
    fn construction_rejects_bad_configurations() {
        let dims = cube(2, 2, 3);
        let env = Env::single();
        let geom = GlobalGeom { nx_g: 2, ny_g: 2, ix_base: 0, iy_base: 0 };

        let bad = SweepConfig { nblock_z: 2, ..Default::default() };
        assert!(matches!(
            Sweeper::new(dims, geom, &env, bad),
            Err(SweepError::Config(ConfigError::UnevenBlockZ { .. }))
        ));

        let bad = SweepConfig { nthread_octant: 3, ..Default::default() };
        assert!(matches!(
            Sweeper::new(dims, geom, &env, bad),
            Err(SweepError::Config(ConfigError::BadOctantThreads(3)))
        ));

        let bad = SweepConfig { nthread_octant: 4, nsemiblock: 2, ..Default::default() };
        assert!(matches!(
            Sweeper::new(dims, geom, &env, bad),
            Err(SweepError::Config(ConfigError::SemiblockNeedsGuardedUpdate { .. }))
        ));

        let bad = SweepConfig { nsemiblock: 16, ..Default::default() };
        assert!(matches!(
            Sweeper::new(dims, geom, &env, bad),
            Err(SweepError::Config(ConfigError::BadSemiblock(16)))
        ));

        let bad = SweepConfig { nthread_e: 0, ..Default::default() };
        assert!(matches!(
            Sweeper::new(dims, geom, &env, bad),
            Err(SweepError::Config(ConfigError::BadEnergyThreads(0)))
        ));
    }

    #[test]
    fn sweep_rejects_mismatched_state_vectors() {
        let dims = cube(2, 2, 2);
        let mut env = Env::single();
        let geom = GlobalGeom { nx_g: 2, ny_g: 2, ix_base: 0, iy_base: 0 };
        let mut sweeper = Sweeper::new(dims, geom, &env, SweepConfig::default()).unwrap();
        let xf = Transforms::identity(&dims);
        let vi = vec![1.0; dims.size_state()];
        let mut vo = vec![0.0; dims.size_state() - 1];
        assert!(matches!(
            sweeper.sweep(&mut vo, &vi, &AveragingStub, &xf, &mut env),
            Err(SweepError::BadStateLen { .. })
        ));
    }
}
