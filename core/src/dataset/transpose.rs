//! Column-grouped view of a sparse batch, used by the weight-gradient pass.
//!
//! Every feature column gets a bucket large enough for the entries one batch can put in
//! it, `min(batch, count)`, with bucket starts aligned to [`WARP`].

use super::compute::sparse_buffers;
use super::{Attributes, DataSet};
use crate::context::ComputeContext;
use crate::device::{DataElem, Device, DeviceBuffer};
use crate::distributed::CollectiveBackend;
use crate::error::{DataSetError, Result};
use crate::kernels::{KernelLibrary, TransposedBuffers, TransposedView};
use crate::loss::{KernelFlags, SparseOp, select_sparse_kernel};
use tracing::debug;

/// Bucket alignment in entries.
pub const WARP: u64 = 32;

/// Start offset of every column's bucket and the total entries needed.
///
/// Columns past the end of `counts` are empty and start at the final offset.
pub fn bucket_offsets(counts: &[u64], batch: u64, columns: usize) -> (Vec<u64>, u64) {
    let mut starts = Vec::with_capacity(columns);
    let mut offset = 0u64;
    for column in 0..columns {
        starts.push(offset);
        if let Some(&count) = counts.get(column) {
            offset += count.min(batch);
            offset = offset.div_ceil(WARP) * WARP;
        }
    }
    (starts, offset)
}

/// Device buffers of the transposed view and the batch size they were laid out for.
#[derive(Debug)]
pub struct SparseTransposed<D: Device> {
    pub(crate) batch: usize,
    pub(crate) start_host: Vec<u64>,
    pub(crate) start: Option<D::Buffer<u64>>,
    pub(crate) end: Option<D::Buffer<u64>>,
    pub(crate) index: Option<D::Buffer<u32>>,
    pub(crate) data: Option<D::Buffer<f32>>,
    pub(crate) capacity: usize,
}

impl<D: Device> Default for SparseTransposed<D> {
    fn default() -> Self {
        Self {
            batch: 0,
            start_host: Vec::new(),
            start: None,
            end: None,
            index: None,
            data: None,
            capacity: 0,
        }
    }
}

impl<D: Device> SparseTransposed<D> {
    /// Batch size of the current layout, 0 before the first build.
    pub fn batch(&self) -> usize {
        self.batch
    }

    /// Bucket starts as uploaded.
    pub fn starts(&self) -> &[u64] {
        &self.start_host
    }

    /// Entries the index buffer can hold.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn end_buffer(&self) -> Option<&D::Buffer<u64>> {
        self.end.as_ref()
    }

    pub fn index_buffer(&self) -> Option<&D::Buffer<u32>> {
        self.index.as_ref()
    }

    pub fn data_buffer(&self) -> Option<&D::Buffer<f32>> {
        self.data.as_ref()
    }

    pub(crate) fn bytes(&self) -> u64 {
        let len = |n: Option<usize>, size: u64| n.unwrap_or(0) as u64 * size;
        len(self.start.as_ref().map(|b| b.len()), 8)
            + len(self.end.as_ref().map(|b| b.len()), 8)
            + len(self.index.as_ref().map(|b| b.len()), 4)
            + len(self.data.as_ref().map(|b| b.len()), 4)
    }
}

impl<T: DataElem, D: Device> DataSet<T, D> {
    pub fn sparse_transposed(&self) -> &SparseTransposed<D> {
        &self.transposed
    }

    /// Lays out the transposed buckets for `batch` examples over
    /// `max(stride, layer_units)` columns.
    ///
    /// Index and value buffers grow to the needed capacity and never shrink.
    pub fn generate_sparse_transposed_matrix<B: CollectiveBackend>(
        &mut self,
        batch: usize,
        layer_units: usize,
        ctx: &ComputeContext<B, D>,
    ) -> Result<()> {
        self.require_sparse("generate_sparse_transposed_matrix")?;
        if self.dirty {
            self.count_local_datapoints();
        }
        let columns = self.geometry.stride().max(layer_units);
        let (starts, offset) =
            bucket_offsets(&self.sparse_datapoint_count, batch as u64, columns);
        let offset = offset as usize;
        let device = ctx.device();
        let boolean = self.attributes.contains(Attributes::BOOLEAN);
        let t = &mut self.transposed;

        match t.start.as_mut() {
            Some(buffer) if buffer.len() == columns => buffer.upload(&starts)?,
            _ => {
                let mut buffer = device.allocate::<u64>(columns)?;
                buffer.upload(&starts)?;
                t.start = Some(buffer);
                t.end = Some(device.allocate::<u64>(columns)?);
            }
        }
        if offset > t.capacity || t.index.is_none() {
            debug!(
                name = %self.name,
                from = t.capacity,
                to = offset,
                "growing sparse transposed buffers"
            );
            let capacity = offset.max(t.capacity);
            t.index = Some(device.allocate::<u32>(capacity)?);
            t.data = if boolean {
                None
            } else {
                Some(device.allocate::<f32>(capacity)?)
            };
            t.capacity = capacity;
        }
        t.start_host = starts;
        t.batch = batch;
        debug!(
            name = %self.name,
            batch,
            columns,
            entries = offset,
            "built sparse transposed layout"
        );
        Ok(())
    }

    /// Scatters examples `position..position + batch` into the transposed buckets,
    /// rebuilding the layout first if the batch size changed or indices were edited.
    ///
    /// Uses the denoised kernel while a denoising mask is enabled.
    pub fn calculate_sparse_transposed_matrix<B, K>(
        &mut self,
        position: usize,
        batch: usize,
        layer_units: usize,
        ctx: &ComputeContext<B, D>,
        kernels: &K,
    ) -> Result<()>
    where
        B: CollectiveBackend,
        K: KernelLibrary<D>,
    {
        self.require_sparse("calculate_sparse_transposed_matrix")?;
        if self.dirty || self.transposed.batch != batch || self.transposed.start.is_none() {
            self.generate_sparse_transposed_matrix(batch, layer_units, ctx)?;
        }
        let kernel = select_sparse_kernel(SparseOp::TransposedMatrix, self.kernel_flags())?;
        let random = if kernel.is_denoised() {
            Some(
                self.denoising_random
                    .as_ref()
                    .ok_or(DataSetError::DenoisingDisabled)?,
            )
        } else {
            None
        };
        let boolean = self.attributes.contains(Attributes::BOOLEAN);
        let source = sparse_buffers(&self.buffers, random, boolean)?;
        let t = &mut self.transposed;
        let (Some(start), Some(end), Some(index)) =
            (t.start.as_ref(), t.end.as_mut(), t.index.as_mut())
        else {
            return Err(DataSetError::MissingBuffer("sparse transposed"));
        };
        end.copy_from(start)?;
        let out = TransposedBuffers {
            start,
            end,
            index,
            data: t.data.as_mut(),
        };
        kernels.sparse_transposed_matrix(kernel, position, batch, source, out)
    }

    /// Same as [`Self::calculate_sparse_transposed_matrix`], but fails unless a
    /// denoising mask is enabled.
    pub fn calculate_sparse_transposed_denoised_matrix<B, K>(
        &mut self,
        position: usize,
        batch: usize,
        layer_units: usize,
        ctx: &ComputeContext<B, D>,
        kernels: &K,
    ) -> Result<()>
    where
        B: CollectiveBackend,
        K: KernelLibrary<D>,
    {
        if !self.attributes.contains(Attributes::DENOISING) {
            return Err(DataSetError::DenoisingDisabled);
        }
        self.calculate_sparse_transposed_matrix(position, batch, layer_units, ctx, kernels)
    }

    /// `weight_gradient = beta * weight_gradient + alpha * Xᵀ * delta` over the
    /// transposed view of the last scattered batch.
    ///
    /// # Arguments
    ///
    /// * `m` - feature rows of the gradient.
    /// * `n` - units per row; `delta` holds `n` values per batch example.
    #[allow(clippy::too_many_arguments)]
    pub fn calculate_sparse_transposed_weight_gradient<K: KernelLibrary<D>>(
        &self,
        alpha: f32,
        beta: f32,
        m: usize,
        n: usize,
        delta: &D::Buffer<f32>,
        weight_gradient: &mut D::Buffer<f32>,
        kernels: &K,
    ) -> Result<()> {
        self.require_sparse("calculate_sparse_transposed_weight_gradient")?;
        let kernel = select_sparse_kernel(SparseOp::TransposedWeightGradient, self.kernel_flags())?;
        let t = &self.transposed;
        let (Some(start), Some(end), Some(index)) =
            (t.start.as_ref(), t.end.as_ref(), t.index.as_ref())
        else {
            return Err(DataSetError::MissingBuffer("sparse transposed"));
        };
        let view = TransposedView {
            start,
            end,
            index,
            data: t.data.as_ref(),
        };
        kernels.sparse_transposed_weight_gradient(
            kernel,
            alpha,
            beta,
            m,
            n,
            view,
            delta,
            weight_gradient,
        )
    }

    pub(crate) fn kernel_flags(&self) -> KernelFlags {
        self.attributes.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::dataset::Geometry;
    use crate::distributed::CpuBackend;
    use crate::kernels::CpuKernels;

    #[test]
    fn test_bucket_offsets_align_to_warp() {
        let (starts, total) = bucket_offsets(&[40, 0, 3, 100], 64, 6);
        assert_eq!(starts, vec![0, 64, 64, 96, 160, 160]);
        assert_eq!(total, 160);
        assert!(starts.iter().all(|s| s % WARP == 0));
    }

    fn dataset() -> DataSet<f32> {
        // Three examples over four features.
        DataSet::sparse(
            "s",
            Geometry::d1(4),
            vec![0, 2, 3],
            vec![2, 3, 5],
            vec![1, 3, 1, 0, 1],
            vec![1.0, 2.0, 3.0, 4.0, 5.0],
        )
        .unwrap()
    }

    #[test]
    fn test_generate_grows_but_never_shrinks() {
        let ctx = ComputeContext::cpu(CpuBackend::solo(), EngineConfig::default());
        let mut ds = dataset();
        ds.generate_sparse_transposed_matrix(2, 6, &ctx).unwrap();
        let t = ds.sparse_transposed();
        assert_eq!(t.batch(), 2);
        assert_eq!(t.starts(), &[0, 32, 64, 64, 96, 96]);
        assert_eq!(t.capacity(), 96);
        assert!(t.data_buffer().is_some());

        ds.generate_sparse_transposed_matrix(1, 0, &ctx).unwrap();
        assert_eq!(ds.sparse_transposed().starts(), &[0, 32, 64, 64]);
        assert_eq!(ds.sparse_transposed().capacity(), 96);
    }

    #[test]
    fn test_calculate_scatters_batch() {
        let ctx = ComputeContext::cpu(CpuBackend::solo(), EngineConfig::default());
        let kernels = CpuKernels::from_config(ctx.config());
        let mut ds = dataset();
        ds.upload(&ctx).unwrap();
        ds.calculate_sparse_transposed_matrix(1, 2, 4, &ctx, &kernels)
            .unwrap();
        let t = ds.sparse_transposed();
        assert_eq!(t.starts(), &[0, 32, 64, 64]);
        let end = t.end_buffer().unwrap().as_slice();
        assert_eq!(end, &[1, 34, 64, 64]);
        let index = t.index_buffer().unwrap().as_slice();
        let data = t.data_buffer().unwrap().as_slice();
        assert_eq!(index[0], 1);
        assert_eq!(&index[32..34], &[0, 1]);
        assert_eq!(&data[32..34], &[3.0, 5.0]);
        assert_eq!(data[0], 4.0);
    }

    #[test]
    fn test_denoised_matrix_requires_mask() {
        let ctx = ComputeContext::cpu(CpuBackend::solo(), EngineConfig::default());
        let kernels = CpuKernels::default();
        let mut ds = dataset();
        let err = ds
            .calculate_sparse_transposed_denoised_matrix(0, 1, 4, &ctx, &kernels)
            .unwrap_err();
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_dense_is_rejected() {
        let ctx = ComputeContext::cpu(CpuBackend::solo(), EngineConfig::default());
        let mut ds = DataSet::<f32>::dense("d", Geometry::d1(2), vec![1.0, 0.0]).unwrap();
        assert!(matches!(
            ds.generate_sparse_transposed_matrix(1, 2, &ctx),
            Err(DataSetError::WrongKind { .. })
        ));
    }
}
