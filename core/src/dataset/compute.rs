//! Batch operations that hand the dataset's device buffers to a [`KernelLibrary`].

use super::{DataSet, DeviceArrays};
use crate::device::{DataElem, Device};
use crate::error::{DataSetError, Result};
use crate::kernels::{KernelLibrary, SparseBuffers, TargetBuffers};
use crate::loss::{
    CostFunction, SparseOp, select_delta_kernel, select_error_kernel, select_sparse_kernel,
};
use nndataset_kernels::{Activation, BatchShape};

/// Borrows the sparse mirrors of `buffers`; `random` is passed through to denoised kernels.
pub(crate) fn sparse_buffers<'a, T: DataElem, D: Device>(
    buffers: &'a DeviceArrays<T, D>,
    random: Option<&'a D::Buffer<f32>>,
    boolean: bool,
) -> Result<SparseBuffers<'a, T, D>> {
    let (Some(start), Some(end), Some(index)) = (
        buffers.start.as_ref(),
        buffers.end.as_ref(),
        buffers.index.as_ref(),
    ) else {
        return Err(DataSetError::MissingBuffer("sparse start/end/index"));
    };
    let data = if boolean {
        None
    } else {
        Some(
            buffers
                .values
                .as_ref()
                .ok_or(DataSetError::MissingBuffer("sparse data"))?,
        )
    };
    Ok(SparseBuffers {
        start,
        end,
        index,
        data,
        random,
    })
}

impl<T: DataElem, D: Device> DataSet<T, D> {
    pub(crate) fn sparse_buffers(&self, denoised: bool) -> Result<SparseBuffers<'_, T, D>> {
        let random = if denoised {
            Some(
                self.denoising_random
                    .as_ref()
                    .ok_or(DataSetError::DenoisingDisabled)?,
            )
        } else {
            None
        };
        sparse_buffers(&self.buffers, random, self.is_boolean())
    }

    fn target_buffers(&self, denoised: bool) -> Result<TargetBuffers<'_, T, D>> {
        if self.is_sparse() {
            Ok(TargetBuffers::Sparse(self.sparse_buffers(denoised)?))
        } else {
            let data = self
                .buffers
                .data
                .as_ref()
                .ok_or(DataSetError::MissingBuffer("data"))?;
            Ok(TargetBuffers::Dense(data))
        }
    }

    /// Loads examples `position..position + batch` into `unit`, `stride` values each.
    ///
    /// Sparse data is expanded; while a denoising mask is enabled entries are dropped
    /// and rescaled by it.
    pub fn load_input_unit<K: KernelLibrary<D>>(
        &self,
        position: usize,
        batch: usize,
        stride: usize,
        unit: &mut D::Buffer<f32>,
        kernels: &K,
    ) -> Result<()> {
        let kernel = select_sparse_kernel(SparseOp::LoadInput, self.kernel_flags())?;
        let source = self.target_buffers(kernel.is_denoised())?;
        kernels.load_input_unit(kernel, &BatchShape::new(position, batch, stride), unit, source)
    }

    /// Like [`Self::load_input_unit`], but fails unless a denoising mask is enabled.
    pub fn load_sparse_denoised_input_unit<K: KernelLibrary<D>>(
        &self,
        position: usize,
        batch: usize,
        stride: usize,
        unit: &mut D::Buffer<f32>,
        kernels: &K,
    ) -> Result<()> {
        if !self.is_sparse() {
            return Err(DataSetError::NotSparse);
        }
        if self.denoising_random.is_none() {
            return Err(DataSetError::DenoisingDisabled);
        }
        self.load_input_unit(position, batch, stride, unit, kernels)
    }

    /// `unit = beta * unit + X * weight` for the batch's sparse inputs.
    #[allow(clippy::too_many_arguments)]
    pub fn calculate_sparse_z<K: KernelLibrary<D>>(
        &self,
        position: usize,
        batch: usize,
        stride: usize,
        weight: &D::Buffer<f32>,
        unit: &mut D::Buffer<f32>,
        beta: f32,
        kernels: &K,
    ) -> Result<()> {
        let kernel = select_sparse_kernel(SparseOp::Z, self.kernel_flags())?;
        let source = self.sparse_buffers(kernel.is_denoised())?;
        kernels.sparse_z(
            kernel,
            &BatchShape::new(position, batch, stride),
            weight,
            unit,
            source,
            beta,
        )
    }

    /// Like [`Self::calculate_sparse_z`], but fails unless a denoising mask is enabled.
    #[allow(clippy::too_many_arguments)]
    pub fn calculate_sparse_denoised_z<K: KernelLibrary<D>>(
        &self,
        position: usize,
        batch: usize,
        stride: usize,
        weight: &D::Buffer<f32>,
        unit: &mut D::Buffer<f32>,
        beta: f32,
        kernels: &K,
    ) -> Result<()> {
        if self.denoising_random.is_none() {
            return Err(DataSetError::DenoisingDisabled);
        }
        self.calculate_sparse_z(position, batch, stride, weight, unit, beta, kernels)
    }

    /// Batch error of `unit` under `cost`.
    pub fn calculate_error<K: KernelLibrary<D>>(
        &self,
        cost: CostFunction,
        position: usize,
        batch: usize,
        stride: usize,
        unit: &D::Buffer<f32>,
        kernels: &K,
    ) -> Result<f32> {
        let kernel = select_error_kernel(cost, self.kernel_flags())?;
        let target = self.target_buffers(false)?;
        kernels.error(kernel, &BatchShape::new(position, batch, stride), unit, target)
    }

    /// Output-layer delta of `unit` under `cost` for an output layer using `activation`.
    #[allow(clippy::too_many_arguments)]
    pub fn calculate_output_delta<K: KernelLibrary<D>>(
        &self,
        activation: Activation,
        cost: CostFunction,
        position: usize,
        batch: usize,
        stride: usize,
        unit: &D::Buffer<f32>,
        delta: &mut D::Buffer<f32>,
        kernels: &K,
    ) -> Result<()> {
        let kernel = select_delta_kernel(cost, activation, self.kernel_flags())?;
        let target = self.target_buffers(false)?;
        kernels.output_delta(
            kernel,
            activation,
            &BatchShape::new(position, batch, stride),
            unit,
            delta,
            target,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::context::ComputeContext;
    use crate::dataset::Geometry;
    use crate::device::{Cpu, DeviceBuffer, HostBuffer};
    use crate::distributed::CpuBackend;
    use crate::kernels::CpuKernels;
    use approx::assert_relative_eq;

    fn host(values: &[f32]) -> HostBuffer<f32> {
        let mut buffer = Cpu.allocate::<f32>(values.len()).unwrap();
        buffer.upload(values).unwrap();
        buffer
    }

    fn setup() -> (ComputeContext<CpuBackend>, CpuKernels, DataSet<f32>) {
        let ctx = ComputeContext::cpu(CpuBackend::solo(), EngineConfig::default());
        let kernels = CpuKernels::from_config(ctx.config());
        // Example 0 = {1: 2.0}, example 1 = {0: 1.0, 2: 0.5}.
        let mut ds = DataSet::sparse(
            "s",
            Geometry::d1(3),
            vec![0, 1],
            vec![1, 3],
            vec![1, 0, 2],
            vec![2.0, 1.0, 0.5],
        )
        .unwrap();
        ds.upload(&ctx).unwrap();
        (ctx, kernels, ds)
    }

    #[test]
    fn test_requires_upload() {
        let kernels = CpuKernels::default();
        let ds = DataSet::<f32>::dense("d", Geometry::d1(1), vec![1.0]).unwrap();
        let mut unit = host(&[0.0]);
        assert!(matches!(
            ds.load_input_unit(0, 1, 1, &mut unit, &kernels),
            Err(DataSetError::MissingBuffer("data"))
        ));
    }

    #[test]
    fn test_load_input_and_z() {
        let (_ctx, kernels, ds) = setup();
        let mut unit = host(&[9.0; 6]);
        ds.load_input_unit(0, 2, 3, &mut unit, &kernels).unwrap();
        assert_eq!(unit.as_slice(), &[0.0, 2.0, 0.0, 1.0, 0.0, 0.5]);

        // Weight row f is [f + 1].
        let weight = host(&[1.0, 2.0, 3.0]);
        let mut z = host(&[0.0; 2]);
        ds.calculate_sparse_z(0, 2, 1, &weight, &mut z, 0.0, &kernels)
            .unwrap();
        assert_eq!(z.as_slice(), &[4.0, 2.5]);
    }

    #[test]
    fn test_error_and_delta() {
        let (_ctx, kernels, ds) = setup();
        let unit = host(&[0.0, 1.0, 0.0, 1.0, 0.0, 1.0]);
        let error = ds
            .calculate_error(CostFunction::L1, 0, 2, 3, &unit, &kernels)
            .unwrap();
        // |1 - 2| + |0 - 0| + |1 - 0.5| with zeros elsewhere.
        assert_relative_eq!(error, 1.5);

        let mut delta = host(&[0.0; 6]);
        ds.calculate_output_delta(
            Activation::Linear,
            CostFunction::L2,
            0,
            2,
            3,
            &unit,
            &mut delta,
            &kernels,
        )
        .unwrap();
        assert_eq!(delta.as_slice(), &[0.0, -1.0, 0.0, 0.0, 0.0, 0.5]);
    }

    #[test]
    fn test_zero_stride_is_an_error() {
        let (ctx, kernels, ds) = setup();
        let unit = host(&[0.0; 3]);
        let err = ds
            .calculate_error(CostFunction::L2, 0, 1, 0, &unit, &kernels)
            .unwrap_err();
        assert!(matches!(err, DataSetError::Kernel(_)));
        assert!(err.is_fatal());

        let mut dense = DataSet::<f32>::dense("d", Geometry::d1(3), vec![1.0, 0.0, 0.0]).unwrap();
        dense.upload(&ctx).unwrap();
        let mut delta = host(&[0.0; 3]);
        assert!(dense
            .calculate_output_delta(
                Activation::Linear,
                CostFunction::L2,
                0,
                1,
                0,
                &unit,
                &mut delta,
                &kernels,
            )
            .is_err());
    }

    #[test]
    fn test_denoised_z_requires_mask() {
        let (_ctx, kernels, ds) = setup();
        let weight = host(&[1.0, 2.0, 3.0]);
        let mut z = host(&[0.0; 2]);
        let err = ds
            .calculate_sparse_denoised_z(0, 2, 1, &weight, &mut z, 0.0, &kernels)
            .unwrap_err();
        assert!(matches!(err, DataSetError::DenoisingDisabled));
    }

    #[test]
    fn test_denoised_input_with_mask() {
        let (mut ctx, _, mut ds) = setup();
        let mut config = EngineConfig::default();
        config.kernel.denoising_p = 0.5;
        let kernels = CpuKernels::from_config(&config);
        ds.set_denoising(true, &ctx).unwrap();
        ds.generate_denoising_data(&mut ctx).unwrap();
        let mut unit = host(&[0.0; 6]);
        ds.load_sparse_denoised_input_unit(0, 2, 3, &mut unit, &kernels)
            .unwrap();
        // Surviving entries are doubled, dropped ones are zero.
        let expected = [(1, 2.0), (3, 1.0), (5, 0.5)];
        for (position, value) in expected {
            let got = unit.as_slice()[position];
            assert!(got == 0.0 || got == 2.0 * value);
        }
    }
}
