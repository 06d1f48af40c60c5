use super::backend::CollectiveBackend;
use crate::error::{DataSetError, Result};
use crossbeam::channel::{Receiver, Sender, unbounded};

/// An in-process collective backend: one worker per thread.
///
/// Every ordered pair of ranks gets its own `crossbeam` channel, so messages from one
/// rank to another are delivered in order regardless of traffic between other pairs.
#[derive(Debug)]
pub struct CpuBackend {
    rank: usize,
    world_size: usize,
    to: Vec<Sender<Vec<u8>>>,     // to[dst]: rank -> dst
    from: Vec<Receiver<Vec<u8>>>, // from[src]: src -> rank
}

impl CpuBackend {
    /// Builds a fully connected set of `world_size` backends, indexed by rank.
    pub fn mesh(world_size: usize) -> Vec<CpuBackend> {
        let mut senders: Vec<Vec<Sender<Vec<u8>>>> = vec![Vec::new(); world_size];
        let mut receivers: Vec<Vec<Receiver<Vec<u8>>>> = vec![Vec::new(); world_size];
        for src in 0..world_size {
            for dst in 0..world_size {
                let (tx, rx) = unbounded();
                senders[src].push(tx);
                receivers[dst].push(rx);
            }
        }
        senders
            .into_iter()
            .zip(receivers)
            .enumerate()
            .map(|(rank, (to, from))| CpuBackend {
                rank,
                world_size,
                to,
                from,
            })
            .collect()
    }

    /// A single-worker backend.
    pub fn solo() -> CpuBackend {
        Self::mesh(1).remove(0)
    }

    fn check_peer(&self, peer: usize) -> Result<()> {
        if peer >= self.world_size {
            return Err(DataSetError::Communication(format!(
                "rank {} does not exist (world size {})",
                peer, self.world_size
            )));
        }
        Ok(())
    }
}

impl CollectiveBackend for CpuBackend {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn send_bytes(&self, dst: usize, bytes: Vec<u8>) -> Result<()> {
        self.check_peer(dst)?;
        self.to[dst].send(bytes).map_err(|_| {
            DataSetError::Communication(format!("rank {} hung up on rank {}", dst, self.rank))
        })
    }

    fn recv_bytes(&self, src: usize) -> Result<Vec<u8>> {
        self.check_peer(src)?;
        self.from[src].recv().map_err(|_| {
            DataSetError::Communication(format!("rank {} hung up on rank {}", src, self.rank))
        })
    }
}
