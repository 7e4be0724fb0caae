//! Face buffers & worker chunking
//!
//! The xy face is a single buffer: it carries the z-direction dependence
//! across z-blocks *within* a process, so it is produced and consumed by the
//! same rank on consecutive steps. The xz and yz faces cross process
//! boundaries; under the asynchronous communicator they are **triple
//! buffered** so that at step `s` buffer `s % 3` is being computed,
//! `(s−1) % 3` is being sent, and `(s+1) % 3` is being received. The
//! synchronous communicator exchanges in place and needs a single buffer.
//!
//! Within each buffer the octant-in-block axis is outermost, so one octant
//! thread's slab is one contiguous chunk — the exact payload of one neighbor
//! message — and the energy axis comes next, so an energy thread's share is
//! contiguous too. [`FaceSet::worker_chunks`] splits all three face arrays
//! into disjoint `&mut` pieces along those two axes, which is what lets the
//! block driver hand faces to worker threads without any locking.

use crate::dims::Dimensions;
use crate::P;

/// The face storage owned by one sweeper.
#[derive(Debug)]
pub struct FaceSet {
    dims_b: Dimensions,
    noctant_per_block: usize,
    nbuf: usize,
    facexy: Vec<P>,
    facexz: Vec<Vec<P>>,
    faceyz: Vec<Vec<P>>,
}

/// One worker's disjoint view of the three faces: a single octant-in-block
/// slab restricted to the worker's energy range.
pub struct LaneFaces<'a> {
    xy: &'a mut [P],
    xz: &'a mut [P],
    yz: &'a mut [P],
    dims_b: Dimensions,
    e0: usize,
}

impl FaceSet {
    /// Allocate faces for one z-block's dimensions. Asynchronous mode
    /// allocates the full triple buffer; synchronous mode a single buffer.
    pub fn new(dims_b: Dimensions, noctant_per_block: usize, async_comm: bool) -> Self {
        let nbuf = if async_comm { 3 } else { 1 };
        Self {
            dims_b,
            noctant_per_block,
            nbuf,
            facexy: vec![0.0; dims_b.size_facexy(noctant_per_block)],
            facexz: (0..nbuf)
                .map(|_| vec![0.0; dims_b.size_facexz(noctant_per_block)])
                .collect(),
            faceyz: (0..nbuf)
                .map(|_| vec![0.0; dims_b.size_faceyz(noctant_per_block)])
                .collect(),
        }
    }

    /// Which xz/yz buffer a step computes into (or, called with `step + 1`,
    /// receives into; with `step − 1`, sends from).
    #[inline]
    pub fn buf_index(&self, step: usize) -> usize {
        if self.nbuf == 1 {
            0
        } else {
            step % 3
        }
    }

    /// Element count of one octant's xz slab (the neighbor message payload).
    #[inline]
    pub fn slab_len_xz(&self) -> usize {
        self.dims_b.ne * self.dims_b.plane_xz()
    }

    /// Element count of one octant's yz slab.
    #[inline]
    pub fn slab_len_yz(&self) -> usize {
        self.dims_b.ne * self.dims_b.plane_yz()
    }

    /// One octant's xz slab in the buffer for `step`.
    pub fn slab_xz(&self, step: usize, lane: usize) -> &[P] {
        let len = self.slab_len_xz();
        &self.facexz[self.buf_index(step)][lane * len..(lane + 1) * len]
    }

    /// Mutable variant of [`FaceSet::slab_xz`].
    pub fn slab_xz_mut(&mut self, step: usize, lane: usize) -> &mut [P] {
        let len = self.slab_len_xz();
        let i = self.buf_index(step);
        &mut self.facexz[i][lane * len..(lane + 1) * len]
    }

    /// One octant's yz slab in the buffer for `step`.
    pub fn slab_yz(&self, step: usize, lane: usize) -> &[P] {
        let len = self.slab_len_yz();
        &self.faceyz[self.buf_index(step)][lane * len..(lane + 1) * len]
    }

    /// Mutable variant of [`FaceSet::slab_yz`].
    pub fn slab_yz_mut(&mut self, step: usize, lane: usize) -> &mut [P] {
        let len = self.slab_len_yz();
        let i = self.buf_index(step);
        &mut self.faceyz[i][lane * len..(lane + 1) * len]
    }

    /// Split all three faces for `step` into per-(octant-thread,
    /// energy-thread) disjoint views. `e_bounds` holds the `nthread_e + 1`
    /// energy range boundaries; the result is lane-major, energy-minor.
    pub fn worker_chunks(&mut self, step: usize, e_bounds: &[usize]) -> Vec<LaneFaces<'_>> {
        let i = if self.nbuf == 1 { 0 } else { step % 3 };
        let dims_b = self.dims_b;
        let lanes = self.noctant_per_block;
        let Self { facexy, facexz, faceyz, .. } = self;

        let xys = split_lanes_energy(&mut facexy[..], dims_b.plane_xy(), dims_b.ne, lanes, e_bounds);
        let xzs =
            split_lanes_energy(&mut facexz[i][..], dims_b.plane_xz(), dims_b.ne, lanes, e_bounds);
        let yzs =
            split_lanes_energy(&mut faceyz[i][..], dims_b.plane_yz(), dims_b.ne, lanes, e_bounds);

        let nthread_e = e_bounds.len() - 1;
        xys.into_iter()
            .zip(xzs)
            .zip(yzs)
            .enumerate()
            .map(|(w, ((xy, xz), yz))| LaneFaces {
                xy,
                xz,
                yz,
                dims_b,
                e0: e_bounds[w % nthread_e],
            })
            .collect()
    }
}

/// Split `buf` — laid out `(lane, ie, ...plane...)` with `plane` elements per
/// energy group — into `lanes × (e_bounds.len()−1)` contiguous pieces.
fn split_lanes_energy<'a>(
    mut buf: &'a mut [P],
    plane: usize,
    ne: usize,
    lanes: usize,
    e_bounds: &[usize],
) -> Vec<&'a mut [P]> {
    debug_assert_eq!(buf.len(), lanes * ne * plane);
    debug_assert_eq!(*e_bounds.last().unwrap(), ne);
    let mut out = Vec::with_capacity(lanes * (e_bounds.len() - 1));
    for _ in 0..lanes {
        let (lane_chunk, rest) = buf.split_at_mut(ne * plane);
        buf = rest;
        let mut lane_chunk = lane_chunk;
        for w in e_bounds.windows(2) {
            let (piece, rest) = lane_chunk.split_at_mut((w[1] - w[0]) * plane);
            lane_chunk = rest;
            out.push(piece);
        }
    }
    out
}

impl LaneFaces<'_> {
    /// The xy slot of one cell: the `(iu, ia)` run at `(ix, iy)` for group
    /// `ie` (which must lie inside this worker's energy range).
    #[inline]
    pub fn slot_xy_mut(&mut self, ix: usize, iy: usize, ie: usize) -> &mut [P] {
        let d = &self.dims_b;
        let base = (ie - self.e0) * d.plane_xy() + d.slot_xy(ix, iy);
        &mut self.xy[base..base + d.slot()]
    }

    /// The xz slot of one cell.
    #[inline]
    pub fn slot_xz_mut(&mut self, ix: usize, iz: usize, ie: usize) -> &mut [P] {
        let d = &self.dims_b;
        let base = (ie - self.e0) * d.plane_xz() + d.slot_xz(ix, iz);
        &mut self.xz[base..base + d.slot()]
    }

    /// The yz slot of one cell.
    #[inline]
    pub fn slot_yz_mut(&mut self, iy: usize, iz: usize, ie: usize) -> &mut [P] {
        let d = &self.dims_b;
        let base = (ie - self.e0) * d.plane_yz() + d.slot_yz(iy, iz);
        &mut self.yz[base..base + d.slot()]
    }

    /// All three slots of one cell at once, for the cell solve.
    #[inline]
    pub fn cell_slots(
        &mut self,
        ix: usize,
        iy: usize,
        iz: usize,
        ie: usize,
    ) -> (&mut [P], &mut [P], &mut [P]) {
        let d = &self.dims_b;
        let slot = d.slot();
        let e = ie - self.e0;
        let bxy = e * d.plane_xy() + d.slot_xy(ix, iy);
        let bxz = e * d.plane_xz() + d.slot_xz(ix, iz);
        let byz = e * d.plane_yz() + d.slot_yz(iy, iz);
        (
            &mut self.xy[bxy..bxy + slot],
            &mut self.xz[bxz..bxz + slot],
            &mut self.yz[byz..byz + slot],
        )
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn dims_b() -> Dimensions {
        Dimensions::new(3, 2, 2, 4, 1, 2, 2).unwrap()
    }

    #[test]
    fn triple_buffer_roles_are_distinct_each_step() {
        let f = FaceSet::new(dims_b(), 2, true);
        for step in 1..20usize {
            let compute = f.buf_index(step);
            let send = f.buf_index(step - 1);
            let recv = f.buf_index(step + 1);
            assert_ne!(compute, send);
            assert_ne!(compute, recv);
            assert_ne!(send, recv);
        }
        // The cycle returns to its starting point every three steps.
        assert_eq!(f.buf_index(0), f.buf_index(3));
    }

    #[test]
    fn sync_mode_collapses_to_one_buffer() {
        let f = FaceSet::new(dims_b(), 2, false);
        for step in 0..10usize {
            assert_eq!(f.buf_index(step), 0);
        }
    }

    #[test]
    fn slabs_partition_each_buffer() {
        let d = dims_b();
        let lanes = 4;
        let f = FaceSet::new(d, lanes, true);
        assert_eq!(f.slab_len_xz() * lanes, d.size_facexz(lanes));
        assert_eq!(f.slab_len_yz() * lanes, d.size_faceyz(lanes));
    }

    #[test]
    fn worker_chunks_cover_everything_once() {
        let d = dims_b();
        let lanes = 2;
        let e_bounds = [0usize, 1, 4]; // uneven split of ne = 4
        let mut f = FaceSet::new(d, lanes, true);
        let chunks = f.worker_chunks(0, &e_bounds);
        assert_eq!(chunks.len(), lanes * 2);
        let total_xy: usize = chunks.iter().map(|c| c.xy.len()).sum();
        let total_xz: usize = chunks.iter().map(|c| c.xz.len()).sum();
        let total_yz: usize = chunks.iter().map(|c| c.yz.len()).sum();
        assert_eq!(total_xy, d.size_facexy(lanes));
        assert_eq!(total_xz, d.size_facexz(lanes));
        assert_eq!(total_yz, d.size_faceyz(lanes));
    }

    #[test]
    fn chunk_writes_land_in_the_right_lane_slab() {
        let d = dims_b();
        let lanes = 2;
        let e_bounds = [0usize, 2, 4];
        let mut f = FaceSet::new(d, lanes, true);
        {
            let mut chunks = f.worker_chunks(0, &e_bounds);
            // Worker 3 = lane 1, energy range [2, 4). Mark one yz slot.
            let c = &mut chunks[3];
            c.slot_yz_mut(1, 1, 3).fill(7.5);
        }
        let slab = f.slab_yz(0, 1);
        let base = 3 * d.plane_yz() + d.slot_yz(1, 1);
        for (i, &v) in slab.iter().enumerate() {
            let expect = if (base..base + d.slot()).contains(&i) { 7.5 } else { 0.0 };
            assert_eq!(v, expect);
        }
        // Lane 0 untouched.
        assert!(f.slab_yz(0, 0).iter().all(|&v| v == 0.0));
    }

    #[test]
    fn cell_slots_agree_with_single_slot_lookups() {
        let d = dims_b();
        let mut f = FaceSet::new(d, 1, false);
        let e_bounds = [0usize, d.ne];
        let mut chunks = f.worker_chunks(0, &e_bounds);
        let c = &mut chunks[0];
        c.slot_xy_mut(2, 1, 1).fill(1.0);
        c.slot_xz_mut(2, 0, 1).fill(2.0);
        c.slot_yz_mut(1, 0, 1).fill(3.0);
        let (xy, xz, yz) = c.cell_slots(2, 1, 0, 1);
        assert!(xy.iter().all(|&v| v == 1.0));
        assert!(xz.iter().all(|&v| v == 2.0));
        assert!(yz.iter().all(|&v| v == 3.0));
    }
}
