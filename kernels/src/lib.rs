//! CPU reference kernels for the dataset engine.
//!
//! Every kernel operates on one batch slice of a dataset: `batch` examples starting at
//! `position`, each projected onto `stride` output units. Units, deltas and weights are
//! `f32`; targets are read from dense rows or from the CSR-style sparse layout described
//! by [`SparseTarget`].

use num_traits::{FromPrimitive, Num, NumAssign, ToPrimitive};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::ops::Range;
use thiserror::Error;

pub mod cpu_delta;
pub mod cpu_loss;
pub mod cpu_sparse;

pub use cpu_delta::{DeltaFormula, cpu_dense_delta, cpu_sparse_delta};
pub use cpu_loss::{ErrorFormula, MIN_ERROR, cpu_dense_error, cpu_sparse_error};
pub use cpu_sparse::{
    TransposedBuckets, cpu_load_dense_input, cpu_load_sparse_input, cpu_sparse_transposed_matrix,
    cpu_sparse_transposed_weight_gradient, cpu_sparse_z,
};

#[derive(Error, Debug)]
pub enum KernelError {
    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },
    #[error("{what} index {index} out of range (bound {bound})")]
    IndexOutOfRange {
        what: &'static str,
        index: usize,
        bound: usize,
    },
    #[error("{kernel} is not defined for activation {activation:?}")]
    UnsupportedActivation {
        kernel: &'static str,
        activation: Activation,
    },
    #[error("Missing buffer: {0}")]
    MissingBuffer(&'static str),
    #[error("Transposed bucket for column {column} overflows its capacity")]
    BucketOverflow { column: usize },
}

pub type Result<T> = std::result::Result<T, KernelError>;

/// Trait bound for dataset elements the kernels read targets from.
/// This mirrors `DataElem` in the main crate to avoid circular dependencies.
pub trait KernelElem:
    Num + NumAssign + Copy + Clone + Debug + Send + Sync + FromPrimitive + ToPrimitive + PartialOrd
{
}

impl<T> KernelElem for T where
    T: Num
        + NumAssign
        + Copy
        + Clone
        + Debug
        + Send
        + Sync
        + FromPrimitive
        + ToPrimitive
        + PartialOrd
{
}

#[inline]
pub(crate) fn to_f32<T: KernelElem>(v: T) -> f32 {
    v.to_f32().unwrap_or(f32::NAN)
}

/// Output-layer activation, used to pick the derivative applied by delta kernels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Activation {
    Sigmoid,
    Tanh,
    RectifiedLinear,
    Linear,
    LeakyRectifiedLinear,
    ExponentialLinear,
    ScaledExponentialLinear,
    SoftMax,
}

/// Scalar constants shared by every kernel invocation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelParams {
    /// Scaled-marginal cross entropy: positive targets stop contributing above this value.
    pub one_target: f32,
    /// Scaled-marginal cross entropy: zero targets stop contributing below this value.
    pub zero_target: f32,
    pub one_scale: f32,
    pub zero_scale: f32,
    /// Probability that a denoised input entry is dropped.
    pub denoising_p: f32,
    pub relu_slope: f32,
    pub elu_alpha: f32,
    pub selu_lambda: f32,
}

impl Default for KernelParams {
    fn default() -> Self {
        Self {
            one_target: 0.9,
            zero_target: 0.1,
            one_scale: 1.0,
            zero_scale: 1.0,
            denoising_p: 0.0,
            relu_slope: 0.01,
            elu_alpha: 1.0,
            selu_lambda: 1.050_701,
        }
    }
}

impl KernelParams {
    /// Rescale factor applied to surviving denoised entries.
    pub fn denoising_q(&self) -> f32 {
        1.0 / (1.0 - self.denoising_p)
    }

    /// Whether a denoised entry with random draw `r` survives.
    #[inline]
    pub fn keeps(&self, r: f32) -> bool {
        r >= self.denoising_p
    }
}

/// The batch slice a kernel operates on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchShape {
    pub position: usize,
    pub batch: usize,
    pub stride: usize,
}

impl BatchShape {
    pub fn new(position: usize, batch: usize, stride: usize) -> Self {
        Self {
            position,
            batch,
            stride,
        }
    }

    /// Number of unit values covered by the batch.
    pub fn units(&self) -> usize {
        self.batch * self.stride
    }

    /// Checks that a unit/delta buffer holds the whole batch.
    ///
    /// A zero stride is rejected: every row-parallel kernel splits the buffer by it.
    pub fn check_units(&self, len: usize) -> Result<()> {
        if self.stride == 0 || len < self.units() {
            return Err(KernelError::ShapeMismatch {
                expected: vec![self.batch, self.stride],
                got: vec![len],
            });
        }
        Ok(())
    }

    /// Checks that the batch lies inside `examples` rows.
    pub fn check_examples(&self, examples: usize) -> Result<()> {
        let last = self.position + self.batch;
        if last > examples {
            return Err(KernelError::IndexOutOfRange {
                what: "example",
                index: last.saturating_sub(1),
                bound: examples,
            });
        }
        Ok(())
    }
}

/// Borrowed view of a CSR-style sparse dataset.
///
/// `start[n]..end[n]` addresses the entries of example `n` in `index` (and `data`
/// unless the dataset is Boolean, in which case every entry has value 1).
#[derive(Debug, Clone, Copy)]
pub struct SparseTarget<'a, T> {
    pub start: &'a [u64],
    pub end: &'a [u64],
    pub index: &'a [u32],
    pub data: Option<&'a [T]>,
}

impl<'a, T: KernelElem> SparseTarget<'a, T> {
    pub fn new(start: &'a [u64], end: &'a [u64], index: &'a [u32], data: Option<&'a [T]>) -> Self {
        Self {
            start,
            end,
            index,
            data,
        }
    }

    pub fn examples(&self) -> usize {
        self.start.len()
    }

    /// Entry range of example `n`.
    #[inline]
    pub fn entries(&self, n: usize) -> Range<usize> {
        self.start[n] as usize..self.end[n] as usize
    }

    /// Value of entry `k`, 1 for Boolean data.
    #[inline]
    pub fn value(&self, k: usize) -> f32 {
        match self.data {
            Some(data) => to_f32(data[k]),
            None => 1.0,
        }
    }

    pub fn is_boolean(&self) -> bool {
        self.data.is_none()
    }

    /// Validates the layout for the batch: every example row is well formed and every
    /// feature id addressed by the batch is `< columns`.
    pub fn check(&self, shape: &BatchShape, columns: usize) -> Result<()> {
        if self.end.len() != self.start.len() {
            return Err(KernelError::ShapeMismatch {
                expected: vec![self.start.len()],
                got: vec![self.end.len()],
            });
        }
        if let Some(data) = self.data
            && data.len() < self.index.len()
        {
            return Err(KernelError::ShapeMismatch {
                expected: vec![self.index.len()],
                got: vec![data.len()],
            });
        }
        shape.check_examples(self.examples())?;
        for n in shape.position..shape.position + shape.batch {
            let (s, e) = (self.start[n] as usize, self.end[n] as usize);
            if s > e || e > self.index.len() {
                return Err(KernelError::IndexOutOfRange {
                    what: "sparse end",
                    index: e,
                    bound: self.index.len(),
                });
            }
            if let Some(&bad) = self.index[s..e].iter().find(|&&i| i as usize >= columns) {
                return Err(KernelError::IndexOutOfRange {
                    what: "feature",
                    index: bad as usize,
                    bound: columns,
                });
            }
        }
        Ok(())
    }

    /// Expands example `n` into a dense target row of `stride` values and a mask of the
    /// positions holding a sparse entry.
    pub(crate) fn expand(&self, n: usize, stride: usize) -> (Vec<f32>, Vec<bool>) {
        let mut target = vec![0.0f32; stride];
        let mut present = vec![false; stride];
        for k in self.entries(n) {
            let i = self.index[k] as usize;
            target[i] = self.value(k);
            present[i] = true;
        }
        (target, present)
    }
}
