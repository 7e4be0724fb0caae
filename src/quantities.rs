//! Problem quantities
//!
//! The sweep kernel is generic over the physics: everything cell-local comes
//! through the [`Quantities`] trait — inlet face values at the domain
//! boundary and the per-cell solve — while the moment↔angle transform
//! tensors travel alongside in [`Transforms`]. The kernel owns all index
//! arithmetic; a model only ever sees the `(iu, ia)` runs of one cell.
//!
//! [`ScaledQuantities`] is the self-verifying model: every factor is a power
//! of two (or a small integer), so all sweep arithmetic is exact in `f64` and
//! the output is reproducible bit for bit across process counts and thread
//! counts. The solve removes the spatial scaling from its inputs, combines
//! them with weights that sum to a telescoping constant, and re-applies the
//! scaling on the way out; the outgoing faces additionally carry the octant
//! factor, which the downstream cell divides back out.

use crate::dims::Dimensions;
use crate::env::Env;
use crate::octant::{dir_x, dir_y, dir_z};
use crate::P;

/// Placement of one process block inside the global grid.
#[derive(Debug, Clone, Copy)]
pub struct GlobalGeom {
    /// Global x extent.
    pub nx_g: usize,
    /// Global y extent.
    pub ny_g: usize,
    /// Global x index of this block's first cell.
    pub ix_base: usize,
    /// Global y index of this block's first cell.
    pub iy_base: usize,
}

/// Split `n_g` cells over `nproc` processes: `(base, extent)` of process `p`.
///
/// Uneven splits are allowed; neighbor face slabs still agree in size
/// because a slab varies only along axes the neighbor pair shares.
#[inline]
pub fn split_extent(n_g: usize, nproc: usize, p: usize) -> (usize, usize) {
    let base = p * n_g / nproc;
    let end = (p + 1) * n_g / nproc;
    (base, end - base)
}

impl GlobalGeom {
    /// Geometry of this rank's block.
    pub fn for_rank(env: &Env, nx_g: usize, ny_g: usize) -> Self {
        let (ix_base, _) = split_extent(nx_g, env.nproc_x(), env.proc_x_this());
        let (iy_base, _) = split_extent(ny_g, env.nproc_y(), env.proc_y_this());
        Self { nx_g, ny_g, ix_base, iy_base }
    }
}

/// Moment↔angle transform tensors, read-only during a sweep.
#[derive(Debug, Clone)]
pub struct Transforms {
    /// `(octant, ia, im)` tensor taking moments to angles.
    pub a_from_m: Vec<P>,
    /// `(octant, im, ia)` tensor taking angles to moments.
    pub m_from_a: Vec<P>,
}

impl Transforms {
    /// Identity pair: moment `i` maps to angle `i` and back, per octant.
    pub fn identity(dims: &Dimensions) -> Self {
        let mut a_from_m = vec![0.0; dims.size_transform()];
        let mut m_from_a = vec![0.0; dims.size_transform()];
        for octant in 0..crate::NOCTANT {
            for i in 0..dims.na.min(dims.nm) {
                a_from_m[dims.ind_a_from_m(i, i, octant)] = 1.0;
                m_from_a[dims.ind_m_from_a(i, i, octant)] = 1.0;
            }
        }
        Self { a_from_m, m_from_a }
    }
}

/// Coordinates and shape context of one cell solve.
#[derive(Debug)]
pub struct CellCtx<'a> {
    /// Block-local x index.
    pub ix: usize,
    /// Block-local y index.
    pub iy: usize,
    /// z index local to the current z-block.
    pub iz: usize,
    /// Global x index.
    pub ix_g: i64,
    /// Global y index.
    pub iy_g: i64,
    /// Global z index.
    pub iz_g: i64,
    /// Energy group.
    pub ie: usize,
    /// Octant being swept.
    pub octant: usize,
    /// z-block dimensions.
    pub dims_b: &'a Dimensions,
    /// Global dimensions.
    pub dims_g: &'a Dimensions,
}

/// The external physics of the sweep. All methods must be pure with respect
/// to the model (same inputs, same outputs) — the schedule replays them in
/// different orders across configurations.
pub trait Quantities: Sync {
    /// Inlet value for the xy face at a global ghost cell (`iz_g` is −1 or
    /// the global z extent).
    fn init_facexy(
        &self,
        ix_g: i64,
        iy_g: i64,
        iz_g: i64,
        ie: usize,
        ia: usize,
        iu: usize,
        octant: usize,
        dims_g: &Dimensions,
    ) -> P;

    /// Inlet value for the xz face (`iy_g` is −1 or the global y extent).
    fn init_facexz(
        &self,
        ix_g: i64,
        iy_g: i64,
        iz_g: i64,
        ie: usize,
        ia: usize,
        iu: usize,
        octant: usize,
        dims_g: &Dimensions,
    ) -> P;

    /// Inlet value for the yz face (`ix_g` is −1 or the global x extent).
    fn init_faceyz(
        &self,
        ix_g: i64,
        iy_g: i64,
        iz_g: i64,
        ie: usize,
        ia: usize,
        iu: usize,
        octant: usize,
        dims_g: &Dimensions,
    ) -> P;

    /// The cell solve. `v_local` holds the cell's angle-space unknowns; the
    /// three face slots hold the upstream values on entry and must hold the
    /// outgoing (downstream) values on exit. All four run `(iu, ia)` with
    /// `ia` fastest.
    fn solve(
        &self,
        v_local: &mut [P],
        facexy: &mut [P],
        facexz: &mut [P],
        faceyz: &mut [P],
        ctx: &CellCtx<'_>,
    );
}

// ============================================================================
// The scaled verification model
// ============================================================================

/// Self-verifying quantities with exact power-of-two arithmetic.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScaledQuantities;

#[inline]
fn affine(i: usize) -> P {
    (1 + i) as P
}

#[inline]
fn sf_space(ix_g: i64, iy_g: i64, iz_g: i64) -> P {
    (1i64 << ((ix_g + 3 * iy_g + 7 * iz_g + 2) & 3)) as P
}

#[inline]
fn sf_angle(ia: usize) -> P {
    (1u64 << (ia & 7)) as P
}

#[inline]
fn sf_energy(ie: usize) -> P {
    (1u64 << (((ie * 1366 + 150889) % 714025) & 3)) as P
}

#[inline]
fn sf_unknown(iu: usize) -> P {
    (1u64 << (((iu * 741 + 60037) % 312500) & 3)) as P
}

#[inline]
fn sf_octant(octant: usize) -> P {
    (1 + octant) as P
}

impl ScaledQuantities {
    fn init_face(
        ix_g: i64,
        iy_g: i64,
        iz_g: i64,
        ie: usize,
        ia: usize,
        iu: usize,
        octant: usize,
    ) -> P {
        affine(ia)
            * sf_angle(ia)
            * sf_space(ix_g, iy_g, iz_g)
            * sf_energy(ie)
            * sf_unknown(iu)
            * sf_octant(octant)
    }
}

impl Quantities for ScaledQuantities {
    fn init_facexy(
        &self,
        ix_g: i64,
        iy_g: i64,
        iz_g: i64,
        ie: usize,
        ia: usize,
        iu: usize,
        octant: usize,
        _dims_g: &Dimensions,
    ) -> P {
        Self::init_face(ix_g, iy_g, iz_g, ie, ia, iu, octant)
    }

    fn init_facexz(
        &self,
        ix_g: i64,
        iy_g: i64,
        iz_g: i64,
        ie: usize,
        ia: usize,
        iu: usize,
        octant: usize,
        _dims_g: &Dimensions,
    ) -> P {
        Self::init_face(ix_g, iy_g, iz_g, ie, ia, iu, octant)
    }

    fn init_faceyz(
        &self,
        ix_g: i64,
        iy_g: i64,
        iz_g: i64,
        ie: usize,
        ia: usize,
        iu: usize,
        octant: usize,
        _dims_g: &Dimensions,
    ) -> P {
        Self::init_face(ix_g, iy_g, iz_g, ie, ia, iu, octant)
    }

    fn solve(
        &self,
        v_local: &mut [P],
        facexy: &mut [P],
        facexz: &mut [P],
        faceyz: &mut [P],
        ctx: &CellCtx<'_>,
    ) {
        let d = ctx.dims_b;
        debug_assert_eq!(v_local.len(), d.slot());

        // The state value and the incoming faces are first normalized by
        // removing the spatial scaling, combined with a weighted average
        // chosen to give an exactly representable result, then re-scaled.
        let so = sf_octant(ctx.octant);
        let so_r = 1.0 / so;
        let ss = sf_space(ctx.ix_g, ctx.iy_g, ctx.iz_g);
        let ss_r = 1.0 / ss;
        let inc_x = dir_x(ctx.octant).inc();
        let inc_y = dir_y(ctx.octant).inc();
        let inc_z = dir_z(ctx.octant).inc();
        let ss_x_r = 1.0 / sf_space(ctx.ix_g - inc_x, ctx.iy_g, ctx.iz_g);
        let ss_y_r = 1.0 / sf_space(ctx.ix_g, ctx.iy_g - inc_y, ctx.iz_g);
        let ss_z_r = 1.0 / sf_space(ctx.ix_g, ctx.iy_g, ctx.iz_g - inc_z);

        for iu in 0..d.nu {
            for ia in 0..d.na {
                let i = iu * d.na + ia;
                let w_yz = 0.25 - 1.0 / ((1u64 << (ia & 7)) as P);
                let result = (v_local[i] * ss_r
                    + (facexy[i] * 0.5 * ss_z_r
                        + facexz[i] * 0.25 * ss_y_r
                        + faceyz[i] * w_yz * ss_x_r)
                        * so_r)
                    * ss;
                v_local[i] = result;
                let scaled = result * so;
                facexy[i] = scaled;
                facexz[i] = scaled;
                faceyz[i] = scaled;
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
