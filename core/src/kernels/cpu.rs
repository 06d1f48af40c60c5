use super::{KernelLibrary, SparseBuffers, TargetBuffers, TransposedBuffers, TransposedView};
use crate::config::EngineConfig;
use crate::device::{Cpu, DataElem, HostBuffer};
use crate::error::{DataSetError, Result};
use crate::loss::{DeltaKernel, ErrorKernel, Selected, SparseKernel, SparseOp};
use nndataset_kernels::{
    Activation, BatchShape, KernelParams, SparseTarget, TransposedBuckets, cpu_dense_delta,
    cpu_dense_error, cpu_load_dense_input, cpu_load_sparse_input, cpu_sparse_delta,
    cpu_sparse_error, cpu_sparse_transposed_matrix, cpu_sparse_transposed_weight_gradient,
    cpu_sparse_z,
};

/// Host implementation of every kernel, backed by `nndataset-kernels`.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CpuKernels {
    params: KernelParams,
}

impl CpuKernels {
    pub fn new(params: KernelParams) -> Self {
        Self { params }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.kernel)
    }

    pub fn params(&self) -> &KernelParams {
        &self.params
    }
}

fn wrong_target(what: &'static str, sparse_kernel: bool) -> DataSetError {
    DataSetError::WrongKind {
        op: what,
        expected: if sparse_kernel { "sparse" } else { "dense" },
    }
}

/// Unpacks sparse buffers for `kernel`, keeping only the arrays it reads.
fn sparse_inputs<'a, T: DataElem>(
    kernel: SparseKernel,
    op: SparseOp,
    src: SparseBuffers<'a, T, Cpu>,
) -> Result<(SparseTarget<'a, T>, Option<&'a [f32]>)> {
    if kernel.op() != op || kernel == SparseKernel::LoadInput {
        return Err(DataSetError::invalid(
            "kernel",
            format!("{kernel:?} cannot run as {op:?}"),
        ));
    }
    let data = match (kernel.is_analog(), src.data) {
        (false, _) => None,
        (true, Some(d)) => Some(d.as_slice()),
        (true, None) => return Err(DataSetError::MissingBuffer("sparse data")),
    };
    let random = match (kernel.is_denoised(), src.random) {
        (false, _) => None,
        (true, Some(r)) => Some(r.as_slice()),
        (true, None) => return Err(DataSetError::MissingBuffer("denoising random")),
    };
    let target = SparseTarget::new(
        src.start.as_slice(),
        src.end.as_slice(),
        src.index.as_slice(),
        data,
    );
    Ok((target, random))
}

/// Targets as the loss kernels read them; Boolean data has no value array.
fn sparse_target<'a, T: DataElem>(src: &SparseBuffers<'a, T, Cpu>) -> SparseTarget<'a, T> {
    let data: Option<&'a HostBuffer<T>> = src.data;
    SparseTarget::new(
        src.start.as_slice(),
        src.end.as_slice(),
        src.index.as_slice(),
        data.map(|d| d.as_slice()),
    )
}

impl KernelLibrary<Cpu> for CpuKernels {
    fn error<T: DataElem>(
        &self,
        kernel: Selected<ErrorKernel>,
        shape: &BatchShape,
        unit: &HostBuffer<f32>,
        target: TargetBuffers<'_, T, Cpu>,
    ) -> Result<f32> {
        let formula = kernel.kernel.formula();
        match (kernel.kernel.is_sparse(), target) {
            (false, TargetBuffers::Dense(data)) => Ok(cpu_dense_error(
                formula,
                &self.params,
                shape,
                unit.as_slice(),
                data.as_slice(),
            )?),
            (true, TargetBuffers::Sparse(src)) => Ok(cpu_sparse_error(
                formula,
                &self.params,
                shape,
                unit.as_slice(),
                &sparse_target(&src),
                kernel.ignore_zero,
            )?),
            (sparse, _) => Err(wrong_target("error kernel", sparse)),
        }
    }

    fn output_delta<T: DataElem>(
        &self,
        kernel: Selected<DeltaKernel>,
        activation: Activation,
        shape: &BatchShape,
        unit: &HostBuffer<f32>,
        delta: &mut HostBuffer<f32>,
        target: TargetBuffers<'_, T, Cpu>,
    ) -> Result<()> {
        let formula = kernel.kernel.formula();
        match (kernel.kernel.is_sparse(), target) {
            (false, TargetBuffers::Dense(data)) => cpu_dense_delta(
                formula,
                activation,
                &self.params,
                shape,
                unit.as_slice(),
                delta.as_mut_slice(),
                data.as_slice(),
            )?,
            (true, TargetBuffers::Sparse(src)) => cpu_sparse_delta(
                formula,
                activation,
                &self.params,
                shape,
                unit.as_slice(),
                delta.as_mut_slice(),
                &sparse_target(&src),
                kernel.ignore_zero,
            )?,
            (sparse, _) => return Err(wrong_target("output delta kernel", sparse)),
        }
        Ok(())
    }

    fn load_input_unit<T: DataElem>(
        &self,
        kernel: SparseKernel,
        shape: &BatchShape,
        unit: &mut HostBuffer<f32>,
        source: TargetBuffers<'_, T, Cpu>,
    ) -> Result<()> {
        match (kernel, source) {
            (SparseKernel::LoadInput, TargetBuffers::Dense(data)) => {
                cpu_load_dense_input(shape, unit.as_mut_slice(), data.as_slice())?
            }
            (SparseKernel::LoadInput, TargetBuffers::Sparse(_)) => {
                return Err(wrong_target("input kernel", false));
            }
            (kernel, TargetBuffers::Sparse(src)) => {
                let (target, random) = sparse_inputs(kernel, SparseOp::LoadInput, src)?;
                cpu_load_sparse_input(&self.params, shape, unit.as_mut_slice(), &target, random)?
            }
            (_, TargetBuffers::Dense(_)) => return Err(wrong_target("input kernel", true)),
        }
        Ok(())
    }

    fn sparse_z<T: DataElem>(
        &self,
        kernel: SparseKernel,
        shape: &BatchShape,
        weight: &HostBuffer<f32>,
        unit: &mut HostBuffer<f32>,
        source: SparseBuffers<'_, T, Cpu>,
        beta: f32,
    ) -> Result<()> {
        let (target, random) = sparse_inputs(kernel, SparseOp::Z, source)?;
        cpu_sparse_z(
            &self.params,
            shape,
            weight.as_slice(),
            unit.as_mut_slice(),
            &target,
            random,
            beta,
        )?;
        Ok(())
    }

    fn sparse_transposed_matrix<T: DataElem>(
        &self,
        kernel: SparseKernel,
        position: usize,
        batch: usize,
        source: SparseBuffers<'_, T, Cpu>,
        out: TransposedBuffers<'_, Cpu>,
    ) -> Result<()> {
        let (target, random) = sparse_inputs(kernel, SparseOp::TransposedMatrix, source)?;
        let data = match (kernel.is_analog(), out.data) {
            (false, _) => None,
            (true, Some(d)) => Some(d.as_mut_slice()),
            (true, None) => return Err(DataSetError::MissingBuffer("sparse transposed data")),
        };
        let mut buckets = TransposedBuckets {
            start: out.start.as_slice(),
            end: out.end.as_mut_slice(),
            index: out.index.as_mut_slice(),
            data,
        };
        cpu_sparse_transposed_matrix(&self.params, position, batch, &target, random, &mut buckets)?;
        Ok(())
    }

    fn sparse_transposed_weight_gradient(
        &self,
        kernel: SparseKernel,
        alpha: f32,
        beta: f32,
        m: usize,
        n: usize,
        view: TransposedView<'_, Cpu>,
        delta: &HostBuffer<f32>,
        gradient: &mut HostBuffer<f32>,
    ) -> Result<()> {
        if kernel.op() != SparseOp::TransposedWeightGradient {
            return Err(DataSetError::invalid(
                "kernel",
                format!("{kernel:?} is not a weight-gradient kernel"),
            ));
        }
        let data = match (kernel.is_analog(), view.data) {
            (false, _) => None,
            (true, Some(d)) => Some(d.as_slice()),
            (true, None) => return Err(DataSetError::MissingBuffer("sparse transposed data")),
        };
        cpu_sparse_transposed_weight_gradient(
            alpha,
            beta,
            m,
            n,
            view.start.as_slice(),
            view.end.as_slice(),
            view.index.as_slice(),
            data,
            delta.as_slice(),
            gradient.as_mut_slice(),
        )?;
        Ok(())
    }
}
