//! Problem dimensions & flat indexing
//!
//! One [`Dimensions`] value describes a grid at some granularity — the local
//! process block, one z-sub-block of it (`nz` divided by the blocking
//! factor), or the global grid. The flat-index helpers below are the single
//! definition site for the memory layouts of every multi-dimensional array in
//! the crate.
//!
//! ## Layouts (slowest → fastest axis)
//!
//! - state `vi`/`vo`: `(iz, iy, ix, ie, im, iu)`. The z axis is slowest so a
//!   z-sub-block is one contiguous sub-slice, and the per-cell `(ie, im, iu)`
//!   run is contiguous.
//! - `facexy`: `(octant_in_block, ie, iy, ix, iu, ia)`
//! - `facexz`: `(octant_in_block, ie, iz, ix, iu, ia)`
//! - `faceyz`: `(octant_in_block, ie, iz, iy, iu, ia)`
//!
//!   Faces put the octant-in-block axis outermost so each octant thread's
//!   slab is one contiguous chunk — both the unit of one neighbor message
//!   and the unit of `&mut` hand-off to a worker — and the energy axis next
//!   so an energy thread's share of a slab is contiguous too.
//! - `v_local` scratch: `(iu, ia)`, `ia` fastest; one `(na·nu)` slot per
//!   worker, matching the per-cell face slot layout.
//! - `a_from_m`: `(octant, ia, im)`; `m_from_a`: `(octant, im, ia)`.

use serde::{Deserialize, Serialize};

/// Errors produced by dimension checks.
#[derive(Debug, thiserror::Error)]
pub enum DimsError {
    /// Every axis extent must be positive.
    #[error("dimension {0} must be positive")]
    EmptyAxis(&'static str),
}

/// Problem dimensions at one granularity (global, block, or z-sub-block).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    /// Grid cells along x.
    pub nx: usize,
    /// Grid cells along y.
    pub ny: usize,
    /// Grid cells along z.
    pub nz: usize,
    /// Number of energy groups.
    pub ne: usize,
    /// Number of spherical-harmonic moments.
    pub nm: usize,
    /// Number of angles.
    pub na: usize,
    /// Number of unknowns per gridcell.
    pub nu: usize,
}

impl Dimensions {
    /// Construct a checked set of dimensions.
    pub fn new(
        nx: usize,
        ny: usize,
        nz: usize,
        ne: usize,
        nm: usize,
        na: usize,
        nu: usize,
    ) -> Result<Self, DimsError> {
        let d = Self { nx, ny, nz, ne, nm, na, nu };
        d.validate()?;
        Ok(d)
    }

    fn validate(&self) -> Result<(), DimsError> {
        for (n, name) in [
            (self.nx, "nx"),
            (self.ny, "ny"),
            (self.nz, "nz"),
            (self.ne, "ne"),
            (self.nm, "nm"),
            (self.na, "na"),
            (self.nu, "nu"),
        ] {
            if n == 0 {
                return Err(DimsError::EmptyAxis(name));
            }
        }
        Ok(())
    }

    /// Same dimensions with the z extent replaced (used for z-sub-blocks).
    #[inline]
    pub fn with_nz(&self, nz: usize) -> Self {
        Self { nz, ..*self }
    }

    // ------------------------- state -------------------------

    /// Total element count of a state vector.
    #[inline]
    pub fn size_state(&self) -> usize {
        self.nx * self.ny * self.nz * self.ne * self.nm * self.nu
    }

    /// Element count of one z-plane of state (used to slice z-sub-blocks).
    #[inline]
    pub fn size_state_zplane(&self) -> usize {
        self.nx * self.ny * self.ne * self.nm * self.nu
    }

    /// Flat index into a state vector.
    #[inline]
    pub fn ind_state(
        &self,
        ix: usize,
        iy: usize,
        iz: usize,
        ie: usize,
        im: usize,
        iu: usize,
    ) -> usize {
        debug_assert!(ix < self.nx && iy < self.ny && iz < self.nz);
        debug_assert!(ie < self.ne && im < self.nm && iu < self.nu);
        iu + self.nu * (im + self.nm * (ie + self.ne * (ix + self.nx * (iy + self.ny * iz))))
    }

    /// Length of the contiguous per-cell `(ie, im, iu)` run.
    #[inline]
    pub fn cell_run(&self) -> usize {
        self.ne * self.nm * self.nu
    }

    // ------------------------- faces -------------------------

    /// Length of one per-cell `(iu, ia)` face slot.
    #[inline]
    pub fn slot(&self) -> usize {
        self.nu * self.na
    }

    /// Total element count of the xy face for `noctant_per_block` octants.
    #[inline]
    pub fn size_facexy(&self, noctant_per_block: usize) -> usize {
        noctant_per_block * self.ne * self.ny * self.nx * self.slot()
    }

    /// Total element count of the xz face for `noctant_per_block` octants.
    #[inline]
    pub fn size_facexz(&self, noctant_per_block: usize) -> usize {
        noctant_per_block * self.ne * self.nz * self.nx * self.slot()
    }

    /// Total element count of the yz face for `noctant_per_block` octants.
    #[inline]
    pub fn size_faceyz(&self, noctant_per_block: usize) -> usize {
        noctant_per_block * self.ne * self.nz * self.ny * self.slot()
    }

    /// Offset of one `(iu, ia)` slot within a single-octant, single-energy
    /// xy plane.
    #[inline]
    pub fn slot_xy(&self, ix: usize, iy: usize) -> usize {
        debug_assert!(ix < self.nx && iy < self.ny);
        (iy * self.nx + ix) * self.slot()
    }

    /// Slot offset within a single-octant, single-energy xz plane.
    #[inline]
    pub fn slot_xz(&self, ix: usize, iz: usize) -> usize {
        debug_assert!(ix < self.nx && iz < self.nz);
        (iz * self.nx + ix) * self.slot()
    }

    /// Slot offset within a single-octant, single-energy yz plane.
    #[inline]
    pub fn slot_yz(&self, iy: usize, iz: usize) -> usize {
        debug_assert!(iy < self.ny && iz < self.nz);
        (iz * self.ny + iy) * self.slot()
    }

    /// Elements of one energy group's xy plane (stride of the `ie` axis).
    #[inline]
    pub fn plane_xy(&self) -> usize {
        self.ny * self.nx * self.slot()
    }

    /// Elements of one energy group's xz plane.
    #[inline]
    pub fn plane_xz(&self) -> usize {
        self.nz * self.nx * self.slot()
    }

    /// Elements of one energy group's yz plane.
    #[inline]
    pub fn plane_yz(&self) -> usize {
        self.nz * self.ny * self.slot()
    }

    // ------------------------- transforms -------------------------

    /// Element count of either transform tensor.
    #[inline]
    pub fn size_transform(&self) -> usize {
        crate::NOCTANT * self.na * self.nm
    }

    /// Flat index into `a_from_m` (angles from moments).
    #[inline]
    pub fn ind_a_from_m(&self, im: usize, ia: usize, octant: usize) -> usize {
        debug_assert!(im < self.nm && ia < self.na && octant < crate::NOCTANT);
        im + self.nm * (ia + self.na * octant)
    }

    /// Flat index into `m_from_a` (moments from angles).
    #[inline]
    pub fn ind_m_from_a(&self, im: usize, ia: usize, octant: usize) -> usize {
        debug_assert!(im < self.nm && ia < self.na && octant < crate::NOCTANT);
        ia + self.na * (im + self.nm * octant)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn dims() -> Dimensions {
        Dimensions::new(3, 2, 4, 2, 3, 2, 2).unwrap()
    }

    #[test]
    fn rejects_empty_axes() {
        assert!(Dimensions::new(0, 1, 1, 1, 1, 1, 1).is_err());
        assert!(Dimensions::new(2, 2, 2, 2, 2, 2, 0).is_err());
    }

    #[test]
    fn state_indexing_is_dense_and_unique() {
        let d = dims();
        let mut seen = vec![false; d.size_state()];
        for iz in 0..d.nz {
            for iy in 0..d.ny {
                for ix in 0..d.nx {
                    for ie in 0..d.ne {
                        for im in 0..d.nm {
                            for iu in 0..d.nu {
                                let i = d.ind_state(ix, iy, iz, ie, im, iu);
                                assert!(!seen[i], "index {i} hit twice");
                                seen[i] = true;
                            }
                        }
                    }
                }
            }
        }
        assert!(seen.iter().all(|&b| b));
    }

    #[test]
    fn z_is_the_slowest_state_axis() {
        let d = dims();
        // One z-plane apart differs by exactly the z-plane size.
        let lo = d.ind_state(0, 0, 0, 0, 0, 0);
        let hi = d.ind_state(0, 0, 1, 0, 0, 0);
        assert_eq!(hi - lo, d.size_state_zplane());
        // The per-cell (ie, im, iu) run is contiguous.
        assert_eq!(d.ind_state(0, 0, 0, 0, 0, 1) - lo, 1);
        assert_eq!(d.cell_run(), d.ne * d.nm * d.nu);
    }

    #[test]
    fn face_sizes_are_consistent_with_plane_strides() {
        let d = dims();
        for noct in [1, 2, 4, 8] {
            assert_eq!(d.size_facexy(noct), noct * d.ne * d.plane_xy());
            assert_eq!(d.size_facexz(noct), noct * d.ne * d.plane_xz());
            assert_eq!(d.size_faceyz(noct), noct * d.ne * d.plane_yz());
        }
    }

    #[test]
    fn face_slots_tile_one_plane() {
        let d = dims();
        let mut seen = vec![false; d.plane_xy()];
        for iy in 0..d.ny {
            for ix in 0..d.nx {
                let base = d.slot_xy(ix, iy);
                for j in 0..d.slot() {
                    assert!(!seen[base + j]);
                    seen[base + j] = true;
                }
            }
        }
        assert!(seen.iter().all(|&b| b));
    }

    #[test]
    fn transform_tensors_index_all_octants() {
        let d = dims();
        let last = d.ind_a_from_m(d.nm - 1, d.na - 1, crate::NOCTANT - 1);
        assert_eq!(last + 1, d.size_transform());
        let last = d.ind_m_from_a(d.nm - 1, d.na - 1, crate::NOCTANT - 1);
        assert_eq!(last + 1, d.size_transform());
    }
}
