//! Process environment & transport
//!
//! The sweep is SPMD over a 2-D process grid. [`Env`] is the explicit context
//! each rank carries: its grid coordinates, the sweep's message tag, and the
//! transport fabric. Ranks are row-major in the grid
//! (`rank = proc_x + nproc_x · proc_y`).
//!
//! The fabric is an in-process mailbox mesh: one unbounded channel per rank,
//! with every rank holding a sender clone for every peer. Receives match on
//! `(source rank, tag)`; messages that arrive ahead of their matching receive
//! are stashed and matched later, so delivery order between distinct tags
//! does not matter (MPI-style tag matching). Sends are buffered and complete
//! immediately; the request token returned by [`Env::asend_p`] exists so the
//! communicator can pair every asynchronous send with a wait.
//!
//! A size mismatch between a received payload and the posted buffer means
//! the two neighbors disagree about the face shape — that is fatal, as is a
//! disconnected peer. There are no retries and no timeouts.

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::P;

/// Linear process rank.
pub type Rank = usize;

/// Transport-level failures. All of them abort the sweep.
#[derive(Debug, thiserror::Error)]
pub enum CommError {
    /// Transport used in a single-process environment.
    #[error("no transport fabric attached (single-process environment)")]
    NoFabric,
    /// Process coordinates outside the grid where a rank was required.
    #[error("process coordinates ({px},{py}) outside the {nproc_x}x{nproc_y} grid")]
    BadProc {
        /// Requested x coordinate.
        px: i64,
        /// Requested y coordinate.
        py: i64,
        /// Grid extent along x.
        nproc_x: usize,
        /// Grid extent along y.
        nproc_y: usize,
    },
    /// Neighbor sent a payload of the wrong size (inconsistent dimensions).
    #[error(
        "face size mismatch from rank {from} tag {tag}: expected {expected} elements, got {got}"
    )]
    SizeMismatch {
        /// Sending rank.
        from: Rank,
        /// Message tag.
        tag: u32,
        /// Elements expected by the posted receive.
        expected: usize,
        /// Elements actually received.
        got: usize,
    },
    /// A peer went away while a receive was outstanding.
    #[error("peer disconnected while waiting for rank {from} tag {tag}")]
    Disconnected {
        /// Expected source rank.
        from: Rank,
        /// Expected tag.
        tag: u32,
    },
}

#[derive(Debug)]
struct Message {
    from: Rank,
    tag: u32,
    payload: Vec<P>,
}

#[derive(Debug)]
struct Mailbox {
    rx: Receiver<Message>,
    txs: Vec<Sender<Message>>,
    stash: Vec<Message>,
}

/// Token pairing an asynchronous send with its completion wait.
#[must_use = "every asynchronous send must be waited on"]
#[derive(Debug)]
pub struct SendRequest {
    to: Rank,
    tag: u32,
}

impl SendRequest {
    /// Complete the send. The buffered transport finishes sends eagerly, so
    /// this only retires the token.
    pub fn wait(self) {
        let _ = (self.to, self.tag);
    }
}

/// Explicit per-rank context: grid placement, message tag, transport.
#[derive(Debug)]
pub struct Env {
    rank: Rank,
    nproc_x: usize,
    nproc_y: usize,
    tag: u32,
    fabric: Option<Mailbox>,
}

impl Env {
    /// A single-process environment with no transport.
    pub fn single() -> Self {
        Self { rank: 0, nproc_x: 1, nproc_y: 1, tag: 0, fabric: None }
    }

    /// This rank.
    #[inline]
    pub fn rank(&self) -> Rank {
        self.rank
    }

    /// Process-grid extent along x.
    #[inline]
    pub fn nproc_x(&self) -> usize {
        self.nproc_x
    }

    /// Process-grid extent along y.
    #[inline]
    pub fn nproc_y(&self) -> usize {
        self.nproc_y
    }

    /// This rank's x coordinate.
    #[inline]
    pub fn proc_x_this(&self) -> usize {
        self.rank % self.nproc_x
    }

    /// This rank's y coordinate.
    #[inline]
    pub fn proc_y_this(&self) -> usize {
        self.rank / self.nproc_x
    }

    /// Rank of grid coordinates, if they lie inside the grid.
    pub fn proc(&self, px: i64, py: i64) -> Result<Rank, CommError> {
        if px < 0 || py < 0 || px >= self.nproc_x as i64 || py >= self.nproc_y as i64 {
            return Err(CommError::BadProc {
                px,
                py,
                nproc_x: self.nproc_x,
                nproc_y: self.nproc_y,
            });
        }
        Ok(px as usize + self.nproc_x * py as usize)
    }

    /// Base message tag for the current sweep.
    #[inline]
    pub fn tag(&self) -> u32 {
        self.tag
    }

    /// Advance the tag past the range a finished sweep used, so messages of
    /// consecutive sweeps can never collide.
    pub fn increment_tag(&mut self, n: u32) {
        self.tag += n;
    }

    /// Blocking send of a face payload.
    pub fn send_p(&self, buf: &[P], to: Rank, tag: u32) -> Result<(), CommError> {
        let fab = self.fabric.as_ref().ok_or(CommError::NoFabric)?;
        fab.txs[to]
            .send(Message { from: self.rank, tag, payload: buf.to_vec() })
            .map_err(|_| CommError::Disconnected { from: to, tag })
    }

    /// Start an asynchronous send. Completion is via [`SendRequest::wait`].
    pub fn asend_p(&self, buf: &[P], to: Rank, tag: u32) -> Result<SendRequest, CommError> {
        self.send_p(buf, to, tag)?;
        Ok(SendRequest { to, tag })
    }

    /// Blocking receive of a face payload from `(from, tag)` into `buf`.
    pub fn recv_p(&mut self, buf: &mut [P], from: Rank, tag: u32) -> Result<(), CommError> {
        let fab = self.fabric.as_mut().ok_or(CommError::NoFabric)?;
        let msg = if let Some(pos) =
            fab.stash.iter().position(|m| m.from == from && m.tag == tag)
        {
            fab.stash.swap_remove(pos)
        } else {
            loop {
                match fab.rx.recv() {
                    Ok(m) if m.from == from && m.tag == tag => break m,
                    Ok(m) => fab.stash.push(m),
                    Err(_) => return Err(CommError::Disconnected { from, tag }),
                }
            }
        };
        if msg.payload.len() != buf.len() {
            return Err(CommError::SizeMismatch {
                from,
                tag,
                expected: buf.len(),
                got: msg.payload.len(),
            });
        }
        buf.copy_from_slice(&msg.payload);
        Ok(())
    }
}

// ============================================================================
// SPMD cluster harness
// ============================================================================

/// Runs one closure per rank of an in-process cluster, with fully wired
/// environments, and collects the per-rank results in rank order.
pub struct Cluster;

impl Cluster {
    /// Spawn `nproc_x × nproc_y` rank threads running `f`.
    pub fn run<T, F>(nproc_x: usize, nproc_y: usize, f: F) -> Vec<T>
    where
        T: Send,
        F: Fn(Env) -> T + Sync,
    {
        assert!(nproc_x > 0 && nproc_y > 0, "process grid must be nonempty");
        let nproc = nproc_x * nproc_y;
        let (txs, rxs): (Vec<_>, Vec<_>) = (0..nproc).map(|_| unbounded()).unzip();
        let envs: Vec<Env> = rxs
            .into_iter()
            .enumerate()
            .map(|(rank, rx)| Env {
                rank,
                nproc_x,
                nproc_y,
                tag: 0,
                fabric: Some(Mailbox { rx, txs: txs.clone(), stash: Vec::new() }),
            })
            .collect();
        drop(txs);

        let f = &f;
        std::thread::scope(|s| {
            let handles: Vec<_> =
                envs.into_iter().map(|env| s.spawn(move || f(env))).collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap_or_else(|e| std::panic::resume_unwind(e)))
                .collect()
        })
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grid_coordinates_are_row_major() {
        let results = Cluster::run(3, 2, |env| {
            (env.rank(), env.proc_x_this(), env.proc_y_this())
        });
        assert_eq!(results.len(), 6);
        for (rank, px, py) in results {
            assert_eq!(rank, px + 3 * py);
        }
        let env = Env::single();
        assert_eq!(env.proc(0, 0).unwrap(), 0);
        assert!(env.proc(1, 0).is_err());
    }

    #[test]
    fn receives_match_on_source_and_tag() {
        let results = Cluster::run(2, 1, |mut env| {
            if env.rank() == 0 {
                // Send two tagged payloads in the "wrong" order.
                env.send_p(&[1.0, 1.0], 1, 7).unwrap();
                env.send_p(&[2.0, 2.0], 1, 5).unwrap();
                Vec::new()
            } else {
                let mut a = [0.0; 2];
                let mut b = [0.0; 2];
                env.recv_p(&mut a, 0, 5).unwrap();
                env.recv_p(&mut b, 0, 7).unwrap();
                vec![a[0], b[0]]
            }
        });
        assert_eq!(results[1], vec![2.0, 1.0]);
    }

    #[test]
    fn size_mismatch_is_fatal() {
        let results = Cluster::run(2, 1, |mut env| {
            if env.rank() == 0 {
                env.send_p(&[1.0, 2.0, 3.0], 1, 0).unwrap();
                Ok(())
            } else {
                let mut buf = [0.0; 2];
                env.recv_p(&mut buf, 0, 0)
            }
        });
        assert!(matches!(
            &results[1],
            Err(CommError::SizeMismatch { expected: 2, got: 3, .. })
        ));
    }

    #[test]
    fn single_process_has_no_fabric() {
        let mut env = Env::single();
        assert!(matches!(env.send_p(&[0.0], 0, 0), Err(CommError::NoFabric)));
        let mut buf = [0.0];
        assert!(matches!(env.recv_p(&mut buf, 0, 0), Err(CommError::NoFabric)));
    }

    #[test]
    fn tag_advances_between_sweeps() {
        let mut env = Env::single();
        assert_eq!(env.tag(), 0);
        env.increment_tag(4);
        env.increment_tag(4);
        assert_eq!(env.tag(), 8);
    }
}
