//! Reversible repartitioning of a dataset across workers.
//!
//! *   **Data**: worker `i` holds examples `i, i + P, i + 2P, ...`, re-indexed from 0.
//! *   **Model**: worker `i` holds the columns `[W * i / P, W * (i + 1) / P)` of every
//!     example, with sparse feature ids re-based at the slice origin.
//!
//! The coordinator owns the unsharded arrays. Sharding sends each worker its fragment;
//! unsharding gathers the fragments back and reassembles them in worker order.

use super::{DataSet, DeviceArrays, SparseTransposed};
use crate::context::ComputeContext;
use crate::device::{DataElem, Device};
use crate::distributed::{COORDINATOR, CollectiveBackend};
use crate::error::{DataSetError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash, Serialize, Deserialize)]
pub enum Sharding {
    #[default]
    None,
    Data,
    Model,
}

impl fmt::Display for Sharding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Sharding::None => "None",
            Sharding::Data => "Data",
            Sharding::Model => "Model",
        };
        f.write_str(name)
    }
}

/// Column range `[min_x, max_x)` owned by `rank` under Model sharding.
pub fn model_slice(width: usize, rank: usize, world_size: usize) -> (usize, usize) {
    (width * rank / world_size, width * (rank + 1) / world_size)
}

/// Number of examples held by `rank` under Data sharding.
pub fn data_examples(examples: usize, rank: usize, world_size: usize) -> usize {
    examples / world_size + usize::from(rank < examples % world_size)
}

/// The arrays one worker holds, as moved between workers.
#[derive(Debug)]
struct Fragment<T> {
    start: Vec<u64>,
    end: Vec<u64>,
    index: Vec<u32>,
    values: Vec<T>,
    data: Vec<T>,
}

impl<T> Default for Fragment<T> {
    fn default() -> Self {
        Self {
            start: Vec::new(),
            end: Vec::new(),
            index: Vec::new(),
            values: Vec::new(),
            data: Vec::new(),
        }
    }
}

impl<T: DataElem> Fragment<T> {
    fn take<D: Device>(ds: &mut DataSet<T, D>) -> Self {
        Self {
            start: std::mem::take(&mut ds.sparse_start),
            end: std::mem::take(&mut ds.sparse_end),
            index: std::mem::take(&mut ds.sparse_index),
            values: std::mem::take(&mut ds.sparse_data),
            data: std::mem::take(&mut ds.data),
        }
    }

    fn install<D: Device>(self, ds: &mut DataSet<T, D>) {
        ds.sparse_start = self.start;
        ds.sparse_end = self.end;
        ds.sparse_index = self.index;
        ds.sparse_data = self.values;
        ds.data = self.data;
    }

    /// Appends example `n` of `src`, keeping the entries whose feature id passes `map`.
    fn push_sparse(&mut self, src: &Self, n: usize, map: impl Fn(u32) -> Option<u32>) {
        self.start.push(self.index.len() as u64);
        self.append_entries(src, n, map);
        self.end.push(self.index.len() as u64);
    }

    fn append_entries(&mut self, src: &Self, n: usize, map: impl Fn(u32) -> Option<u32>) {
        for k in src.start[n] as usize..src.end[n] as usize {
            if let Some(x) = map(src.index[k]) {
                self.index.push(x);
                if let Some(&v) = src.values.get(k) {
                    self.values.push(v);
                }
            }
        }
    }

    fn send<B: CollectiveBackend>(&self, backend: &B, dst: usize, sparse: bool) -> Result<()> {
        if sparse {
            backend.send_slice(dst, &self.start)?;
            backend.send_slice(dst, &self.end)?;
            backend.send_slice(dst, &self.index)?;
            backend.send_slice(dst, &self.values)
        } else {
            backend.send_slice(dst, &self.data)
        }
    }

    fn recv<B: CollectiveBackend>(backend: &B, src: usize, sparse: bool) -> Result<Self> {
        if sparse {
            let start = backend.recv_vec(src)?;
            let end = backend.recv_vec(src)?;
            let index = backend.recv_vec(src)?;
            let values = backend.recv_vec(src)?;
            let fragment = Self {
                start,
                end,
                index,
                values,
                data: Vec::new(),
            };
            fragment.check(src)?;
            Ok(fragment)
        } else {
            Ok(Self {
                data: backend.recv_vec(src)?,
                ..Self::default()
            })
        }
    }

    fn check(&self, src: usize) -> Result<()> {
        let entries = self.index.len() as u64;
        let well_formed = self.start.len() == self.end.len()
            && self.start.iter().zip(&self.end).all(|(&s, &e)| s <= e && e <= entries)
            && (self.values.is_empty() || self.values.len() == self.index.len());
        if well_formed {
            Ok(())
        } else {
            Err(DataSetError::Communication(format!(
                "malformed sparse fragment from rank {src}"
            )))
        }
    }
}

impl<T: DataElem, D: Device> DataSet<T, D> {
    /// Repartitions the dataset. Collective: every worker must call it with the same target.
    ///
    /// A no-op when the dataset is already sharded that way; otherwise the current
    /// sharding is undone first.
    pub fn shard<B: CollectiveBackend>(
        &mut self,
        target: Sharding,
        ctx: &ComputeContext<B, D>,
    ) -> Result<()> {
        if target == self.sharding {
            return Ok(());
        }
        self.unshard(ctx)?;
        match target {
            Sharding::None => return Ok(()),
            Sharding::Data => self.shard_data(ctx)?,
            Sharding::Model => self.shard_model(ctx)?,
        }
        self.sharding = target;
        if ctx.is_coordinator() {
            info!(
                name = %self.name,
                sharding = %target,
                workers = ctx.world_size(),
                "sharded dataset"
            );
        }
        self.after_layout_change(ctx)
    }

    /// Gathers every fragment back onto the coordinator. Collective.
    pub fn unshard<B: CollectiveBackend>(&mut self, ctx: &ComputeContext<B, D>) -> Result<()> {
        match self.sharding {
            Sharding::None => return Ok(()),
            Sharding::Data => self.unshard_data(ctx)?,
            Sharding::Model => self.unshard_model(ctx)?,
        }
        let previous = self.sharding;
        self.sharding = Sharding::None;
        self.min_x = 0;
        self.max_x = self.geometry.width;
        if ctx.is_coordinator() {
            info!(name = %self.name, from = %previous, "unsharded dataset");
        }
        self.after_layout_change(ctx)
    }

    fn shard_data<B: CollectiveBackend>(&mut self, ctx: &ComputeContext<B, D>) -> Result<()> {
        let (rank, world) = (ctx.rank(), ctx.world_size());
        let sparse = self.is_sparse();
        let stride = self.geometry.stride();
        if rank == COORDINATOR {
            let full = Fragment::take(self);
            let mut own = Fragment::default();
            for r in 0..world {
                let mut part = Fragment::default();
                for n in (r..self.examples).step_by(world) {
                    if sparse {
                        part.push_sparse(&full, n, Some);
                    } else {
                        part.data.extend_from_slice(&full.data[n * stride..(n + 1) * stride]);
                    }
                }
                if r == COORDINATOR {
                    own = part;
                } else {
                    part.send(ctx.backend(), r, sparse)?;
                }
            }
            own.install(self);
        } else {
            Fragment::recv(ctx.backend(), COORDINATOR, sparse)?.install(self);
        }
        self.local_examples = data_examples(self.examples, rank, world);
        Ok(())
    }

    fn shard_model<B: CollectiveBackend>(&mut self, ctx: &ComputeContext<B, D>) -> Result<()> {
        let (rank, world) = (ctx.rank(), ctx.world_size());
        let sparse = self.is_sparse();
        let width = self.geometry.width;
        if rank == COORDINATOR {
            let full = Fragment::take(self);
            let mut own = Fragment::default();
            for r in 0..world {
                let (lo, hi) = model_slice(width, r, world);
                let mut part = Fragment::default();
                if sparse {
                    let keep = |x: u32| (lo..hi).contains(&(x as usize)).then(|| x - lo as u32);
                    for n in 0..self.examples {
                        part.push_sparse(&full, n, keep);
                    }
                } else {
                    for row in full.data.chunks_exact(width) {
                        part.data.extend_from_slice(&row[lo..hi]);
                    }
                }
                if r == COORDINATOR {
                    own = part;
                } else {
                    part.send(ctx.backend(), r, sparse)?;
                }
            }
            own.install(self);
        } else {
            Fragment::recv(ctx.backend(), COORDINATOR, sparse)?.install(self);
        }
        (self.min_x, self.max_x) = model_slice(width, rank, world);
        self.local_examples = self.examples;
        Ok(())
    }

    /// Receives the fragment of every worker on the coordinator, in rank order.
    fn gather_fragments<B: CollectiveBackend>(
        &mut self,
        ctx: &ComputeContext<B, D>,
    ) -> Result<Option<Vec<Fragment<T>>>> {
        let sparse = self.is_sparse();
        let own = Fragment::take(self);
        self.local_examples = 0;
        if !ctx.is_coordinator() {
            own.send(ctx.backend(), COORDINATOR, sparse)?;
            return Ok(None);
        }
        let mut fragments = Vec::with_capacity(ctx.world_size());
        fragments.push(own);
        for src in 1..ctx.world_size() {
            fragments.push(Fragment::recv(ctx.backend(), src, sparse)?);
        }
        Ok(Some(fragments))
    }

    fn unshard_data<B: CollectiveBackend>(&mut self, ctx: &ComputeContext<B, D>) -> Result<()> {
        let Some(fragments) = self.gather_fragments(ctx)? else {
            return Ok(());
        };
        let world = fragments.len();
        let stride = self.geometry.stride();
        let mut full = Fragment::default();
        for n in 0..self.examples {
            let (part, local) = (&fragments[n % world], n / world);
            if self.is_sparse() {
                if local >= part.start.len() {
                    return Err(missing_row(n, n % world));
                }
                full.push_sparse(part, local, Some);
            } else {
                let row = part
                    .data
                    .get(local * stride..(local + 1) * stride)
                    .ok_or_else(|| missing_row(n, n % world))?;
                full.data.extend_from_slice(row);
            }
        }
        full.install(self);
        self.local_examples = self.examples;
        Ok(())
    }

    fn unshard_model<B: CollectiveBackend>(&mut self, ctx: &ComputeContext<B, D>) -> Result<()> {
        let Some(fragments) = self.gather_fragments(ctx)? else {
            return Ok(());
        };
        let world = fragments.len();
        let width = self.geometry.width;
        let mut full = Fragment::default();
        if self.is_sparse() {
            if let Some(r) = fragments.iter().position(|f| f.start.len() != self.examples) {
                return Err(missing_row(self.examples.saturating_sub(1), r));
            }
            for n in 0..self.examples {
                full.start.push(full.index.len() as u64);
                for (r, part) in fragments.iter().enumerate() {
                    let lo = model_slice(width, r, world).0 as u32;
                    full.append_entries(part, n, |x| Some(x + lo));
                }
                full.end.push(full.index.len() as u64);
            }
        } else {
            let rows = self.examples * self.geometry.height * self.geometry.length;
            for row in 0..rows {
                for (r, part) in fragments.iter().enumerate() {
                    let (lo, hi) = model_slice(width, r, world);
                    let slice = part
                        .data
                        .get(row * (hi - lo)..(row + 1) * (hi - lo))
                        .ok_or_else(|| missing_row(row, r))?;
                    full.data.extend_from_slice(slice);
                }
            }
        }
        full.install(self);
        self.local_examples = self.examples;
        Ok(())
    }

    /// Rebuilds everything derived from the host arrays after they moved.
    fn after_layout_change<B: CollectiveBackend>(
        &mut self,
        ctx: &ComputeContext<B, D>,
    ) -> Result<()> {
        self.buffers = DeviceArrays::default();
        self.transposed = SparseTransposed::default();
        if self.local_examples > 0 {
            self.upload(ctx)?;
        }
        if self.is_sparse() {
            self.calculate_sparse_datapoint_counts(ctx)?;
        }
        if self.denoising_random.is_some() {
            self.denoising_random = Some(ctx.device().allocate(self.local_nonzeros())?);
        }
        Ok(())
    }
}

fn missing_row(n: usize, rank: usize) -> DataSetError {
    DataSetError::Communication(format!("rank {rank} did not return row {n}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::dataset::Geometry;
    use crate::distributed::CpuBackend;

    #[test]
    fn test_model_slice_partitions_width() {
        for world in 1..6 {
            let mut next = 0;
            for rank in 0..world {
                let (lo, hi) = model_slice(10, rank, world);
                assert_eq!(lo, next);
                assert!(hi >= lo);
                next = hi;
            }
            assert_eq!(next, 10);
        }
        assert_eq!(model_slice(10, 1, 3), (3, 6));
    }

    #[test]
    fn test_data_examples_round_robin() {
        assert_eq!(
            (0..3).map(|r| data_examples(10, r, 3)).collect::<Vec<_>>(),
            vec![4, 3, 3]
        );
        assert_eq!(data_examples(2, 2, 3), 0);
    }

    #[test]
    fn test_single_worker_round_trip() {
        let ctx = ComputeContext::cpu(CpuBackend::solo(), EngineConfig::default());
        let mut ds = DataSet::<f32>::dense(
            "d",
            Geometry::d2(3, 2),
            (0..12).map(|v| v as f32).collect(),
        )
        .unwrap();
        let original = ds.dense_data().to_vec();
        ds.shard(Sharding::Model, &ctx).unwrap();
        assert_eq!(ds.sharding(), Sharding::Model);
        assert_eq!(ds.local_x_range(), (0, 3));
        assert_eq!(ds.get_data_point(1, 2, 1, 0).unwrap(), 11.0);
        ds.shard(Sharding::Data, &ctx).unwrap();
        assert_eq!(ds.local_examples(), 2);
        ds.unshard(&ctx).unwrap();
        assert_eq!(ds.sharding(), Sharding::None);
        assert_eq!(ds.dense_data(), &original[..]);
        assert!(ds.buffers.data.is_some());
    }
}
