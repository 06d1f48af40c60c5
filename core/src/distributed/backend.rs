use crate::device::DataElem;
use crate::error::{DataSetError, Result};

/// Rank that performs all file I/O and roots every collective.
pub const COORDINATOR: usize = 0;

/// Abstraction for the message-passing layer connecting the workers of one job.
///
/// Implementations provide ordered, blocking point-to-point byte transfer; the
/// collectives are built on top of it and rooted at a single rank. Every worker must
/// enter the same collectives in the same order.
pub trait CollectiveBackend: Send + Sync {
    /// Returns the rank of the current worker.
    fn rank(&self) -> usize;

    /// Returns the total number of workers.
    fn world_size(&self) -> usize;

    /// Sends a message to `dst`. Messages between one pair of ranks arrive in order.
    fn send_bytes(&self, dst: usize, bytes: Vec<u8>) -> Result<()>;

    /// Blocks until the next message from `src` arrives.
    fn recv_bytes(&self, src: usize) -> Result<Vec<u8>>;

    /// Sends `bytes` from `root` to every other rank; every rank returns the root's bytes.
    fn broadcast_bytes(&self, root: usize, bytes: Vec<u8>) -> Result<Vec<u8>> {
        if self.rank() == root {
            for dst in (0..self.world_size()).filter(|&r| r != root) {
                self.send_bytes(dst, bytes.clone())?;
            }
            Ok(bytes)
        } else {
            self.recv_bytes(root)
        }
    }

    fn broadcast_flag(&self, root: usize, flag: bool) -> Result<bool> {
        let bytes = self.broadcast_bytes(root, vec![flag as u8])?;
        match bytes.as_slice() {
            [b] => Ok(*b != 0),
            other => Err(DataSetError::Communication(format!(
                "expected a 1-byte flag, got {} bytes",
                other.len()
            ))),
        }
    }

    fn broadcast_u64(&self, root: usize, value: u64) -> Result<u64> {
        let bytes = self.broadcast_bytes(root, u64::encode_slice(&[value]))?;
        single(u64::decode_slice(&bytes)?)
    }

    fn send_slice<T: DataElem>(&self, dst: usize, values: &[T]) -> Result<()>
    where
        Self: Sized,
    {
        self.send_bytes(dst, T::encode_slice(values))
    }

    fn recv_vec<T: DataElem>(&self, src: usize) -> Result<Vec<T>>
    where
        Self: Sized,
    {
        T::decode_slice(&self.recv_bytes(src)?)
    }

    /// Collects one value per rank, in rank order, on every rank.
    fn all_gather_u64(&self, value: u64) -> Result<Vec<u64>> {
        let root = COORDINATOR;
        let gathered = if self.rank() == root {
            let mut values = Vec::with_capacity(self.world_size());
            for src in 0..self.world_size() {
                if src == root {
                    values.push(value);
                } else {
                    values.push(single(u64::decode_slice(&self.recv_bytes(src)?)?)?);
                }
            }
            u64::encode_slice(&values)
        } else {
            self.send_bytes(root, u64::encode_slice(&[value]))?;
            Vec::new()
        };
        let values = u64::decode_slice(&self.broadcast_bytes(root, gathered)?)?;
        if values.len() != self.world_size() {
            return Err(DataSetError::Communication(format!(
                "all-gather returned {} values for {} ranks",
                values.len(),
                self.world_size()
            )));
        }
        Ok(values)
    }

    fn all_reduce_max_u64(&self, value: u64) -> Result<u64> {
        Ok(self
            .all_gather_u64(value)?
            .into_iter()
            .max()
            .unwrap_or(value))
    }

    fn all_reduce_sum_u64(&self, value: u64) -> Result<u64> {
        Ok(self.all_gather_u64(value)?.into_iter().sum())
    }

    /// Element-wise sum of equally long vectors, returned on every rank.
    fn all_reduce_sum_u64s(&self, values: &[u64]) -> Result<Vec<u64>>
    where
        Self: Sized,
    {
        let root = COORDINATOR;
        let summed = if self.rank() == root {
            let mut acc = values.to_vec();
            for src in (0..self.world_size()).filter(|&r| r != root) {
                let part: Vec<u64> = self.recv_vec(src)?;
                if part.len() != acc.len() {
                    return Err(DataSetError::Communication(format!(
                        "all-reduce expected {} values from rank {src}, got {}",
                        acc.len(),
                        part.len()
                    )));
                }
                acc.iter_mut().zip(part).for_each(|(a, p)| *a += p);
            }
            u64::encode_slice(&acc)
        } else {
            self.send_slice(root, values)?;
            Vec::new()
        };
        u64::decode_slice(&self.broadcast_bytes(root, summed)?)
    }

    /// Returns once every rank has entered the barrier.
    fn barrier(&self) -> Result<()> {
        self.all_gather_u64(0).map(|_| ())
    }
}

fn single(values: Vec<u64>) -> Result<u64> {
    match values.as_slice() {
        [v] => Ok(*v),
        other => Err(DataSetError::Communication(format!(
            "expected one value, got {}",
            other.len()
        ))),
    }
}
