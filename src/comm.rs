//! Face communicator
//!
//! Exchanges xz- and yz-face slabs with the four Cartesian neighbors so that
//! a face computed during step `s` is available to the neighbor at step
//! `s + 1`. Whether a pair communicates is decided entirely by the step
//! scheduler: both sides evaluate the same pure predicate, so no negotiation
//! happens on the wire.
//!
//! Two protocols are provided:
//!
//! - **Synchronous red/black.** For each (octant-in-block, axis, direction),
//!   two color phases run: in color 0 even-parity processes along the axis
//!   send and odd-parity processes receive — after first saving the receive
//!   slot to a scratch buffer, since the color-1 send goes out of the same
//!   slot. In color 1 the roles swap and a process that stashed sends from
//!   scratch. Every rank either sends or receives (never both) in each
//!   color, which is what makes the protocol deadlock-free.
//!
//! - **Asynchronous double-buffered.** `recv_start`/`recv_end` and
//!   `send_start`/`send_end` pair every transfer with a wait, against the
//!   triple-buffered faces: receives posted at step `s` land in buffer
//!   `(s+1) % 3` and are completed before the step `s + 1` compute; sends
//!   started at step `s` leave from buffer `s % 3` and are retired at step
//!   `s + 1`. The mailbox transport completes receives at wait time rather
//!   than at post time; the call structure is unchanged.
//!
//! Message tag is `env.tag + octant_in_block`.

#![allow(clippy::too_many_arguments)]

use crate::env::{CommError, Env, Rank, SendRequest};
use crate::faces::FaceSet;
use crate::octant::{dir_axis, Dir};
use crate::sched::StepScheduler;
use crate::P;

/// Communication axis. Along x the yz face is exchanged; along y the xz face.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommAxis {
    /// x neighbors.
    X,
    /// y neighbors.
    Y,
}

impl CommAxis {
    #[inline]
    fn index(self) -> usize {
        match self {
            CommAxis::X => 0,
            CommAxis::Y => 1,
        }
    }

    /// Unit process-grid offset for a transfer along this axis and direction.
    #[inline]
    fn delta(self, dir: Dir) -> (i64, i64) {
        match self {
            CommAxis::X => (dir.inc(), 0),
            CommAxis::Y => (0, dir.inc()),
        }
    }
}

/// Whether the process at `(px, py)` must send the face it computes at
/// `step` to its `(axis, dir)` neighbor for use at `step + 1`.
pub fn must_send(
    sched: &StepScheduler,
    px: i64,
    py: i64,
    step: usize,
    axis: CommAxis,
    dir: Dir,
    lane: usize,
) -> bool {
    let (ix, iy) = axis.delta(dir);
    let source = sched.step_info(step, lane, px, py);
    let target = sched.step_info(step + 1, lane, px + ix, py + iy);
    source.is_active
        && target.is_active
        && source.octant == target.octant
        && source.block_z == target.block_z
        && dir_axis(target.octant, axis.index()) == dir
}

/// Whether the process at `(px, py)` must receive a face computed at `step`
/// by its upstream `(axis, dir)` neighbor, for use at `step + 1`.
pub fn must_recv(
    sched: &StepScheduler,
    px: i64,
    py: i64,
    step: usize,
    axis: CommAxis,
    dir: Dir,
    lane: usize,
) -> bool {
    let (ix, iy) = axis.delta(dir);
    let source = sched.step_info(step, lane, px - ix, py - iy);
    let target = sched.step_info(step + 1, lane, px, py);
    source.is_active
        && target.is_active
        && source.octant == target.octant
        && source.block_z == target.block_z
        && dir_axis(target.octant, axis.index()) == dir
}

#[derive(Debug)]
struct PendingRecv {
    step: usize,
    axis: CommAxis,
    lane: usize,
    from: Rank,
}

/// Request bookkeeping for the asynchronous protocol.
#[derive(Debug)]
pub struct FaceComm {
    noctant_per_block: usize,
    pending_sends: Vec<(usize, SendRequest)>,
    pending_recvs: Vec<PendingRecv>,
}

impl FaceComm {
    /// Communicator for `noctant_per_block` concurrent octants.
    pub fn new(noctant_per_block: usize) -> Self {
        Self { noctant_per_block, pending_sends: Vec::new(), pending_recvs: Vec::new() }
    }

    /// No requests outstanding (holds after every completed sweep).
    pub fn is_drained(&self) -> bool {
        self.pending_sends.is_empty() && self.pending_recvs.is_empty()
    }

    // ------------------------- synchronous protocol -------------------------

    /// Exchange the faces computed at `step` with all four neighbors using
    /// red/black coloring, in place.
    pub fn exchange_sync(
        &self,
        sched: &StepScheduler,
        env: &mut Env,
        faces: &mut FaceSet,
        step: usize,
    ) -> Result<(), CommError> {
        let px = env.proc_x_this() as i64;
        let py = env.proc_y_this() as i64;
        let mut scratch_yz = vec![0.0; faces.slab_len_yz()];
        let mut scratch_xz = vec![0.0; faces.slab_len_xz()];

        for lane in 0..self.noctant_per_block {
            let tag = env.tag() + lane as u32;
            for axis in [CommAxis::X, CommAxis::Y] {
                let proc_axis = match axis {
                    CommAxis::X => env.proc_x_this(),
                    CommAxis::Y => env.proc_y_this(),
                };
                for dir in [Dir::Up, Dir::Dn] {
                    let do_send = must_send(sched, px, py, step, axis, dir, lane);
                    let do_recv = must_recv(sched, px, py, step, axis, dir, lane);
                    if !do_send && !do_recv {
                        continue;
                    }
                    let (ix, iy) = axis.delta(dir);
                    let (slab, scratch) = match axis {
                        CommAxis::X => (faces.slab_yz_mut(step, lane), &mut scratch_yz),
                        CommAxis::Y => (faces.slab_xz_mut(step, lane), &mut scratch_xz),
                    };
                    exchange_colored(
                        env, slab, scratch, proc_axis, do_send, do_recv, px, py, ix, iy, tag,
                    )?;
                }
            }
        }
        Ok(())
    }

    // ------------------------ asynchronous protocol ------------------------

    /// Start sending the faces computed at `step` (from buffer `step % 3`).
    pub fn send_start(
        &mut self,
        sched: &StepScheduler,
        env: &Env,
        faces: &FaceSet,
        step: usize,
    ) -> Result<(), CommError> {
        let px = env.proc_x_this() as i64;
        let py = env.proc_y_this() as i64;
        for lane in 0..self.noctant_per_block {
            let tag = env.tag() + lane as u32;
            for axis in [CommAxis::X, CommAxis::Y] {
                for dir in [Dir::Up, Dir::Dn] {
                    if !must_send(sched, px, py, step, axis, dir, lane) {
                        continue;
                    }
                    let (ix, iy) = axis.delta(dir);
                    let to = env.proc(px + ix, py + iy)?;
                    let slab = match axis {
                        CommAxis::X => faces.slab_yz(step, lane),
                        CommAxis::Y => faces.slab_xz(step, lane),
                    };
                    let req = env.asend_p(slab, to, tag)?;
                    self.pending_sends.push((step, req));
                }
            }
        }
        Ok(())
    }

    /// Retire the sends started at `step`.
    pub fn send_end(&mut self, step: usize) {
        let mut i = 0;
        while i < self.pending_sends.len() {
            if self.pending_sends[i].0 == step {
                let (_, req) = self.pending_sends.swap_remove(i);
                req.wait();
            } else {
                i += 1;
            }
        }
    }

    /// Post the receives for faces computed by neighbors at `step`, to be
    /// used here at `step + 1` (into buffer `(step + 1) % 3`).
    pub fn recv_start(
        &mut self,
        sched: &StepScheduler,
        env: &Env,
        step: usize,
    ) -> Result<(), CommError> {
        let px = env.proc_x_this() as i64;
        let py = env.proc_y_this() as i64;
        for lane in 0..self.noctant_per_block {
            for axis in [CommAxis::X, CommAxis::Y] {
                for dir in [Dir::Up, Dir::Dn] {
                    if !must_recv(sched, px, py, step, axis, dir, lane) {
                        continue;
                    }
                    let (ix, iy) = axis.delta(dir);
                    let from = env.proc(px - ix, py - iy)?;
                    self.pending_recvs.push(PendingRecv { step, axis, lane, from });
                }
            }
        }
        Ok(())
    }

    /// Complete the receives posted at `step`, filling buffer `(step+1) % 3`.
    pub fn recv_end(
        &mut self,
        env: &mut Env,
        faces: &mut FaceSet,
        step: usize,
    ) -> Result<(), CommError> {
        let mut i = 0;
        while i < self.pending_recvs.len() {
            if self.pending_recvs[i].step != step {
                i += 1;
                continue;
            }
            let op = self.pending_recvs.swap_remove(i);
            let tag = env.tag() + op.lane as u32;
            let slab = match op.axis {
                CommAxis::X => faces.slab_yz_mut(step + 1, op.lane),
                CommAxis::Y => faces.slab_xz_mut(step + 1, op.lane),
            };
            env.recv_p(slab, op.from, tag)?;
        }
        Ok(())
    }
}

/// One (axis, dir, lane) transfer of the synchronous protocol, both colors.
fn exchange_colored(
    env: &mut Env,
    slab: &mut [P],
    scratch: &mut [P],
    proc_axis: usize,
    do_send: bool,
    do_recv: bool,
    px: i64,
    py: i64,
    ix: i64,
    iy: i64,
    tag: u32,
) -> Result<(), CommError> {
    let mut use_scratch = false;
    for color in 0..2 {
        if color == 0 {
            if proc_axis % 2 == 0 {
                if do_send {
                    let to = env.proc(px + ix, py + iy)?;
                    env.send_p(slab, to, tag)?;
                }
            } else if do_recv {
                let from = env.proc(px - ix, py - iy)?;
                // Save a copy: this receive lands in the slot the color-1
                // send still has to go out of.
                scratch.copy_from_slice(slab);
                use_scratch = true;
                env.recv_p(slab, from, tag)?;
            }
        } else if proc_axis % 2 == 0 {
            if do_recv {
                let from = env.proc(px - ix, py - iy)?;
                env.recv_p(slab, from, tag)?;
            }
        } else if do_send {
            let to = env.proc(px + ix, py + iy)?;
            if use_scratch {
                env.send_p(scratch, to, tag)?;
            } else {
                env.send_p(slab, to, tag)?;
            }
        }
    }
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================
