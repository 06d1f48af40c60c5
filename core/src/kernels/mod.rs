//! The boundary between datasets and the numeric kernels.
//!
//! A [`KernelLibrary`] receives the kernel picked by [`crate::loss`], the batch slice
//! and borrowed device buffers. Datasets never touch device memory themselves beyond
//! upload and download; everything numeric goes through this trait.

pub mod cpu;

pub use cpu::CpuKernels;

use crate::device::{DataElem, Device};
use crate::error::Result;
use crate::loss::{DeltaKernel, ErrorKernel, Selected, SparseKernel};
use nndataset_kernels::{Activation, BatchShape};

/// Device buffers of a sparse dataset, as read by a kernel.
pub struct SparseBuffers<'a, T: DataElem, D: Device> {
    pub start: &'a D::Buffer<u64>,
    pub end: &'a D::Buffer<u64>,
    pub index: &'a D::Buffer<u32>,
    /// Values, absent for Boolean data.
    pub data: Option<&'a D::Buffer<T>>,
    /// Denoising draws, one per entry, present only for denoised kernels.
    pub random: Option<&'a D::Buffer<f32>>,
}

/// Where a kernel reads targets or inputs from.
pub enum TargetBuffers<'a, T: DataElem, D: Device> {
    Dense(&'a D::Buffer<T>),
    Sparse(SparseBuffers<'a, T, D>),
}

/// Destination of the transposed scatter. `end` starts out equal to `start`.
pub struct TransposedBuffers<'a, D: Device> {
    pub start: &'a D::Buffer<u64>,
    pub end: &'a mut D::Buffer<u64>,
    pub index: &'a mut D::Buffer<u32>,
    pub data: Option<&'a mut D::Buffer<f32>>,
}

/// A built transposed view, as read by the weight-gradient kernel.
pub struct TransposedView<'a, D: Device> {
    pub start: &'a D::Buffer<u64>,
    pub end: &'a D::Buffer<u64>,
    pub index: &'a D::Buffer<u32>,
    pub data: Option<&'a D::Buffer<f32>>,
}

pub trait KernelLibrary<D: Device> {
    /// Batch error of `unit` against the targets.
    fn error<T: DataElem>(
        &self,
        kernel: Selected<ErrorKernel>,
        shape: &BatchShape,
        unit: &D::Buffer<f32>,
        target: TargetBuffers<'_, T, D>,
    ) -> Result<f32>;

    /// Writes the output-layer delta of `unit` against the targets into `delta`.
    #[allow(clippy::too_many_arguments)]
    fn output_delta<T: DataElem>(
        &self,
        kernel: Selected<DeltaKernel>,
        activation: Activation,
        shape: &BatchShape,
        unit: &D::Buffer<f32>,
        delta: &mut D::Buffer<f32>,
        target: TargetBuffers<'_, T, D>,
    ) -> Result<()>;

    /// Expands a batch of inputs into `unit`.
    fn load_input_unit<T: DataElem>(
        &self,
        kernel: SparseKernel,
        shape: &BatchShape,
        unit: &mut D::Buffer<f32>,
        source: TargetBuffers<'_, T, D>,
    ) -> Result<()>;

    /// `unit = beta * unit + sparse inputs * weight`.
    fn sparse_z<T: DataElem>(
        &self,
        kernel: SparseKernel,
        shape: &BatchShape,
        weight: &D::Buffer<f32>,
        unit: &mut D::Buffer<f32>,
        source: SparseBuffers<'_, T, D>,
        beta: f32,
    ) -> Result<()>;

    /// Scatters the batch's entries into the transposed buckets.
    fn sparse_transposed_matrix<T: DataElem>(
        &self,
        kernel: SparseKernel,
        position: usize,
        batch: usize,
        source: SparseBuffers<'_, T, D>,
        out: TransposedBuffers<'_, D>,
    ) -> Result<()>;

    /// `gradient = beta * gradient + alpha * transposed inputs * delta`.
    #[allow(clippy::too_many_arguments)]
    fn sparse_transposed_weight_gradient(
        &self,
        kernel: SparseKernel,
        alpha: f32,
        beta: f32,
        m: usize,
        n: usize,
        view: TransposedView<'_, D>,
        delta: &D::Buffer<f32>,
        gradient: &mut D::Buffer<f32>,
    ) -> Result<()>;
}
