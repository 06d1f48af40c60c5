//! Kernel selection.
//!
//! Maps a dataset's attribute flags, the output activation and the cost function onto
//! the named kernel that evaluates it. The tables are plain `match`es so every
//! unsupported combination is an explicit error rather than a silent fallback.

use crate::dataset::Attributes;
use crate::error::{DataSetError, Result};
use nndataset_kernels::{Activation, DeltaFormula, ErrorFormula};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CostFunction {
    L1,
    L2,
    CrossEntropy,
    ScaledMarginalCrossEntropy,
    MultinomialCrossEntropy,
    MultinomialScaledMarginalCrossEntropy,
    DataScaledMarginalCrossEntropy,
}

impl CostFunction {
    fn is_multinomial(self) -> bool {
        matches!(
            self,
            CostFunction::MultinomialCrossEntropy
                | CostFunction::MultinomialScaledMarginalCrossEntropy
        )
    }

    /// Cost functions whose delta assumes a sigmoid or softmax output.
    fn is_cross_entropy(self) -> bool {
        !matches!(self, CostFunction::L1 | CostFunction::L2)
    }
}

/// How a dataset supplies targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetKind {
    Dense,
    SparseBoolean,
    SparseAnalog,
}

/// The attribute bits kernel selection depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KernelFlags {
    pub sparse: bool,
    pub boolean: bool,
    pub sparse_ignore_zero: bool,
    pub denoising: bool,
}

impl From<Attributes> for KernelFlags {
    fn from(attributes: Attributes) -> Self {
        Self {
            sparse: attributes.contains(Attributes::SPARSE),
            boolean: attributes.contains(Attributes::BOOLEAN),
            sparse_ignore_zero: attributes.contains(Attributes::SPARSE_IGNORE_ZERO),
            denoising: attributes.contains(Attributes::DENOISING),
        }
    }
}

impl KernelFlags {
    pub fn target_kind(&self) -> TargetKind {
        match (self.sparse, self.boolean) {
            (false, _) => TargetKind::Dense,
            (true, true) => TargetKind::SparseBoolean,
            (true, false) => TargetKind::SparseAnalog,
        }
    }
}

/// A selected kernel plus whether it skips positions without a sparse entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Selected<K> {
    pub kernel: K,
    pub ignore_zero: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKernel {
    L1,
    SparseL1,
    SparseAnalogL1,
    L2,
    SparseL2,
    SparseAnalogL2,
    CrossEntropy,
    SparseCrossEntropy,
    ScaledMarginalCrossEntropy,
    SparseScaledMarginalCrossEntropy,
    MultinomialCrossEntropy,
    SparseMultinomialCrossEntropy,
    SparseAnalogMultinomialCrossEntropy,
    MultinomialScaledMarginalCrossEntropy,
    SparseMultinomialScaledMarginalCrossEntropy,
    SparseAnalogMultinomialScaledMarginalCrossEntropy,
    SparseDataScaledMarginalCrossEntropy,
}

impl ErrorKernel {
    pub fn formula(self) -> ErrorFormula {
        use ErrorKernel::*;
        match self {
            L1 | SparseL1 | SparseAnalogL1 => ErrorFormula::L1,
            L2 | SparseL2 | SparseAnalogL2 => ErrorFormula::L2,
            CrossEntropy | SparseCrossEntropy => ErrorFormula::CrossEntropy,
            ScaledMarginalCrossEntropy | SparseScaledMarginalCrossEntropy => {
                ErrorFormula::ScaledMarginalCrossEntropy
            }
            MultinomialCrossEntropy
            | SparseMultinomialCrossEntropy
            | SparseAnalogMultinomialCrossEntropy => ErrorFormula::MultinomialCrossEntropy,
            MultinomialScaledMarginalCrossEntropy
            | SparseMultinomialScaledMarginalCrossEntropy
            | SparseAnalogMultinomialScaledMarginalCrossEntropy => {
                ErrorFormula::MultinomialScaledMarginalCrossEntropy
            }
            SparseDataScaledMarginalCrossEntropy => ErrorFormula::DataScaledMarginalCrossEntropy,
        }
    }

    pub fn is_sparse(self) -> bool {
        !matches!(
            self,
            ErrorKernel::L1
                | ErrorKernel::L2
                | ErrorKernel::CrossEntropy
                | ErrorKernel::ScaledMarginalCrossEntropy
                | ErrorKernel::MultinomialCrossEntropy
                | ErrorKernel::MultinomialScaledMarginalCrossEntropy
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeltaKernel {
    OutputDelta,
    SparseOutputDelta,
    SparseAnalogOutputDelta,
    L1OutputDelta,
    SparseL1OutputDelta,
    CrossEntropyOutputDelta,
    SparseCrossEntropyOutputDelta,
    ScaledMarginalCrossEntropyOutputDelta,
    SparseScaledMarginalCrossEntropyOutputDelta,
    SparseDataScaledMarginalCrossEntropyOutputDelta,
}

impl DeltaKernel {
    pub fn formula(self) -> DeltaFormula {
        use DeltaKernel::*;
        match self {
            OutputDelta | SparseOutputDelta | SparseAnalogOutputDelta => DeltaFormula::Output,
            L1OutputDelta | SparseL1OutputDelta => DeltaFormula::L1,
            CrossEntropyOutputDelta | SparseCrossEntropyOutputDelta => DeltaFormula::CrossEntropy,
            ScaledMarginalCrossEntropyOutputDelta | SparseScaledMarginalCrossEntropyOutputDelta => {
                DeltaFormula::ScaledMarginalCrossEntropy
            }
            SparseDataScaledMarginalCrossEntropyOutputDelta => {
                DeltaFormula::DataScaledMarginalCrossEntropy
            }
        }
    }

    pub fn is_sparse(self) -> bool {
        !matches!(
            self,
            DeltaKernel::OutputDelta
                | DeltaKernel::L1OutputDelta
                | DeltaKernel::CrossEntropyOutputDelta
                | DeltaKernel::ScaledMarginalCrossEntropyOutputDelta
        )
    }
}

/// Forward and backward operations that read a dataset's inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SparseOp {
    LoadInput,
    Z,
    TransposedMatrix,
    TransposedWeightGradient,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SparseKernel {
    LoadInput,
    LoadSparseInput,
    LoadSparseAnalogInput,
    LoadSparseDenoisedInput,
    LoadSparseAnalogDenoisedInput,
    SparseZ,
    SparseAnalogZ,
    SparseDenoisedZ,
    SparseAnalogDenoisedZ,
    SparseTransposedMatrix,
    SparseTransposedAnalogMatrix,
    SparseTransposedDenoisedMatrix,
    SparseTransposedAnalogDenoisedMatrix,
    SparseTransposedWeightGradient,
    SparseTransposedAnalogWeightGradient,
}

impl SparseKernel {
    pub fn op(self) -> SparseOp {
        use SparseKernel::*;
        match self {
            LoadInput
            | LoadSparseInput
            | LoadSparseAnalogInput
            | LoadSparseDenoisedInput
            | LoadSparseAnalogDenoisedInput => SparseOp::LoadInput,
            SparseZ | SparseAnalogZ | SparseDenoisedZ | SparseAnalogDenoisedZ => SparseOp::Z,
            SparseTransposedMatrix
            | SparseTransposedAnalogMatrix
            | SparseTransposedDenoisedMatrix
            | SparseTransposedAnalogDenoisedMatrix => SparseOp::TransposedMatrix,
            SparseTransposedWeightGradient | SparseTransposedAnalogWeightGradient => {
                SparseOp::TransposedWeightGradient
            }
        }
    }

    /// Whether the kernel reads a value array.
    pub fn is_analog(self) -> bool {
        use SparseKernel::*;
        matches!(
            self,
            LoadSparseAnalogInput
                | LoadSparseAnalogDenoisedInput
                | SparseAnalogZ
                | SparseAnalogDenoisedZ
                | SparseTransposedAnalogMatrix
                | SparseTransposedAnalogDenoisedMatrix
                | SparseTransposedAnalogWeightGradient
        )
    }

    /// Whether the kernel reads the denoising mask.
    pub fn is_denoised(self) -> bool {
        use SparseKernel::*;
        matches!(
            self,
            LoadSparseDenoisedInput
                | LoadSparseAnalogDenoisedInput
                | SparseDenoisedZ
                | SparseAnalogDenoisedZ
                | SparseTransposedDenoisedMatrix
                | SparseTransposedAnalogDenoisedMatrix
        )
    }
}

/// Picks the error kernel for `cost` against targets described by `flags`.
///
/// # Errors
///
/// Data-scaled marginal cross entropy needs analog sparse targets.
pub fn select_error_kernel(
    cost: CostFunction,
    flags: KernelFlags,
) -> Result<Selected<ErrorKernel>> {
    use ErrorKernel as K;
    use TargetKind::*;
    let kind = flags.target_kind();
    let kernel = match (cost, kind) {
        (CostFunction::L1, Dense) => K::L1,
        (CostFunction::L1, SparseBoolean) => K::SparseL1,
        (CostFunction::L1, SparseAnalog) => K::SparseAnalogL1,
        (CostFunction::L2, Dense) => K::L2,
        (CostFunction::L2, SparseBoolean) => K::SparseL2,
        (CostFunction::L2, SparseAnalog) => K::SparseAnalogL2,
        (CostFunction::CrossEntropy, Dense) => K::CrossEntropy,
        (CostFunction::CrossEntropy, _) => K::SparseCrossEntropy,
        (CostFunction::ScaledMarginalCrossEntropy, Dense) => K::ScaledMarginalCrossEntropy,
        (CostFunction::ScaledMarginalCrossEntropy, _) => K::SparseScaledMarginalCrossEntropy,
        (CostFunction::MultinomialCrossEntropy, Dense) => K::MultinomialCrossEntropy,
        (CostFunction::MultinomialCrossEntropy, SparseBoolean) => K::SparseMultinomialCrossEntropy,
        (CostFunction::MultinomialCrossEntropy, SparseAnalog) => {
            K::SparseAnalogMultinomialCrossEntropy
        }
        (CostFunction::MultinomialScaledMarginalCrossEntropy, Dense) => {
            K::MultinomialScaledMarginalCrossEntropy
        }
        (CostFunction::MultinomialScaledMarginalCrossEntropy, SparseBoolean) => {
            K::SparseMultinomialScaledMarginalCrossEntropy
        }
        (CostFunction::MultinomialScaledMarginalCrossEntropy, SparseAnalog) => {
            K::SparseAnalogMultinomialScaledMarginalCrossEntropy
        }
        (CostFunction::DataScaledMarginalCrossEntropy, SparseAnalog) => {
            K::SparseDataScaledMarginalCrossEntropy
        }
        (CostFunction::DataScaledMarginalCrossEntropy, _) => {
            return Err(DataSetError::UnsupportedCost { cost, kind });
        }
    };
    Ok(Selected {
        kernel,
        ignore_zero: kernel.is_sparse() && flags.sparse_ignore_zero && !cost.is_multinomial(),
    })
}

/// Picks the output-delta kernel for `cost` and the output layer's `activation`.
///
/// # Errors
///
/// Cross-entropy family costs need a sigmoid or softmax output; data-scaled marginal
/// cross entropy needs analog sparse targets.
pub fn select_delta_kernel(
    cost: CostFunction,
    activation: Activation,
    flags: KernelFlags,
) -> Result<Selected<DeltaKernel>> {
    use DeltaKernel as K;
    use TargetKind::*;
    let kind = flags.target_kind();
    if cost.is_cross_entropy() && !matches!(activation, Activation::Sigmoid | Activation::SoftMax)
    {
        return Err(DataSetError::UnsupportedActivation { cost, activation });
    }
    let kernel = match (cost, kind) {
        (CostFunction::L2, Dense) => K::OutputDelta,
        (CostFunction::L2, SparseBoolean) => K::SparseOutputDelta,
        (CostFunction::L2, SparseAnalog) => K::SparseAnalogOutputDelta,
        (CostFunction::L1, Dense) => K::L1OutputDelta,
        (CostFunction::L1, _) => K::SparseL1OutputDelta,
        (CostFunction::CrossEntropy | CostFunction::MultinomialCrossEntropy, Dense) => {
            K::CrossEntropyOutputDelta
        }
        (CostFunction::CrossEntropy | CostFunction::MultinomialCrossEntropy, _) => {
            K::SparseCrossEntropyOutputDelta
        }
        (
            CostFunction::ScaledMarginalCrossEntropy
            | CostFunction::MultinomialScaledMarginalCrossEntropy,
            Dense,
        ) => K::ScaledMarginalCrossEntropyOutputDelta,
        (
            CostFunction::ScaledMarginalCrossEntropy
            | CostFunction::MultinomialScaledMarginalCrossEntropy,
            _,
        ) => K::SparseScaledMarginalCrossEntropyOutputDelta,
        (CostFunction::DataScaledMarginalCrossEntropy, SparseAnalog) => {
            K::SparseDataScaledMarginalCrossEntropyOutputDelta
        }
        (CostFunction::DataScaledMarginalCrossEntropy, _) => {
            return Err(DataSetError::UnsupportedCost { cost, kind });
        }
    };
    Ok(Selected {
        kernel,
        ignore_zero: kernel.is_sparse() && flags.sparse_ignore_zero && !cost.is_multinomial(),
    })
}

/// Picks the input kernel for `op`. The denoised variants are chosen while a denoising
/// mask is enabled.
///
/// # Errors
///
/// Only input loading is defined for dense datasets.
pub fn select_sparse_kernel(op: SparseOp, flags: KernelFlags) -> Result<SparseKernel> {
    use SparseKernel as K;
    if !flags.sparse {
        return match op {
            SparseOp::LoadInput => Ok(K::LoadInput),
            _ => Err(DataSetError::WrongKind {
                op: "sparse kernel selection",
                expected: "sparse",
            }),
        };
    }
    let analog = !flags.boolean;
    let kernel = match (op, analog, flags.denoising) {
        (SparseOp::LoadInput, false, false) => K::LoadSparseInput,
        (SparseOp::LoadInput, true, false) => K::LoadSparseAnalogInput,
        (SparseOp::LoadInput, false, true) => K::LoadSparseDenoisedInput,
        (SparseOp::LoadInput, true, true) => K::LoadSparseAnalogDenoisedInput,
        (SparseOp::Z, false, false) => K::SparseZ,
        (SparseOp::Z, true, false) => K::SparseAnalogZ,
        (SparseOp::Z, false, true) => K::SparseDenoisedZ,
        (SparseOp::Z, true, true) => K::SparseAnalogDenoisedZ,
        (SparseOp::TransposedMatrix, false, false) => K::SparseTransposedMatrix,
        (SparseOp::TransposedMatrix, true, false) => K::SparseTransposedAnalogMatrix,
        (SparseOp::TransposedMatrix, false, true) => K::SparseTransposedDenoisedMatrix,
        (SparseOp::TransposedMatrix, true, true) => K::SparseTransposedAnalogDenoisedMatrix,
        (SparseOp::TransposedWeightGradient, false, _) => K::SparseTransposedWeightGradient,
        (SparseOp::TransposedWeightGradient, true, _) => K::SparseTransposedAnalogWeightGradient,
    };
    Ok(kernel)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DENSE: KernelFlags = KernelFlags {
        sparse: false,
        boolean: false,
        sparse_ignore_zero: false,
        denoising: false,
    };
    const BOOLEAN: KernelFlags = KernelFlags {
        sparse: true,
        boolean: true,
        sparse_ignore_zero: false,
        denoising: false,
    };
    const ANALOG: KernelFlags = KernelFlags {
        sparse: true,
        boolean: false,
        sparse_ignore_zero: false,
        denoising: false,
    };

    #[test]
    fn test_flags_from_attributes() {
        let flags = KernelFlags::from(
            Attributes::SPARSE | Attributes::SPARSE_IGNORE_ZERO | Attributes::DENOISING,
        );
        assert_eq!(flags.target_kind(), TargetKind::SparseAnalog);
        assert!(flags.sparse_ignore_zero && flags.denoising && !flags.boolean);
        assert_eq!(
            KernelFlags::from(Attributes::BOOLEAN).target_kind(),
            TargetKind::Dense
        );
    }

    #[test]
    fn test_error_table() {
        let cases = [
            (
                CostFunction::L1,
                [ErrorKernel::L1, ErrorKernel::SparseL1, ErrorKernel::SparseAnalogL1],
            ),
            (
                CostFunction::L2,
                [ErrorKernel::L2, ErrorKernel::SparseL2, ErrorKernel::SparseAnalogL2],
            ),
            (
                CostFunction::CrossEntropy,
                [
                    ErrorKernel::CrossEntropy,
                    ErrorKernel::SparseCrossEntropy,
                    ErrorKernel::SparseCrossEntropy,
                ],
            ),
            (
                CostFunction::MultinomialScaledMarginalCrossEntropy,
                [
                    ErrorKernel::MultinomialScaledMarginalCrossEntropy,
                    ErrorKernel::SparseMultinomialScaledMarginalCrossEntropy,
                    ErrorKernel::SparseAnalogMultinomialScaledMarginalCrossEntropy,
                ],
            ),
        ];
        for (cost, expected) in cases {
            for (flags, kernel) in [DENSE, BOOLEAN, ANALOG].into_iter().zip(expected) {
                assert_eq!(select_error_kernel(cost, flags).unwrap().kernel, kernel);
            }
        }
    }

    #[test]
    fn test_data_scaled_needs_analog() {
        let cost = CostFunction::DataScaledMarginalCrossEntropy;
        assert!(matches!(
            select_error_kernel(cost, BOOLEAN),
            Err(DataSetError::UnsupportedCost {
                kind: TargetKind::SparseBoolean,
                ..
            })
        ));
        assert!(select_error_kernel(cost, DENSE).is_err());
        assert_eq!(
            select_error_kernel(cost, ANALOG).unwrap().kernel,
            ErrorKernel::SparseDataScaledMarginalCrossEntropy
        );
        assert!(select_delta_kernel(cost, Activation::Sigmoid, DENSE).is_err());
        assert_eq!(
            select_delta_kernel(cost, Activation::Sigmoid, ANALOG)
                .unwrap()
                .kernel,
            DeltaKernel::SparseDataScaledMarginalCrossEntropyOutputDelta
        );
    }

    #[test]
    fn test_ignore_zero_skips_multinomial() {
        let flags = KernelFlags {
            sparse_ignore_zero: true,
            ..BOOLEAN
        };
        assert!(select_error_kernel(CostFunction::L2, flags).unwrap().ignore_zero);
        assert!(
            !select_error_kernel(CostFunction::MultinomialCrossEntropy, flags)
                .unwrap()
                .ignore_zero
        );
        let dense = KernelFlags {
            sparse_ignore_zero: true,
            ..DENSE
        };
        assert!(!select_error_kernel(CostFunction::L2, dense).unwrap().ignore_zero);
    }

    #[test]
    fn test_delta_table() {
        let pick = |cost, flags| {
            select_delta_kernel(cost, Activation::Sigmoid, flags)
                .unwrap()
                .kernel
        };
        assert_eq!(pick(CostFunction::L2, ANALOG), DeltaKernel::SparseAnalogOutputDelta);
        assert_eq!(pick(CostFunction::L1, ANALOG), DeltaKernel::SparseL1OutputDelta);
        assert_eq!(
            pick(CostFunction::MultinomialCrossEntropy, DENSE),
            DeltaKernel::CrossEntropyOutputDelta
        );
        assert_eq!(
            pick(CostFunction::MultinomialScaledMarginalCrossEntropy, BOOLEAN),
            DeltaKernel::SparseScaledMarginalCrossEntropyOutputDelta
        );
    }

    #[test]
    fn test_cross_entropy_delta_needs_sigmoid_or_softmax() {
        assert!(matches!(
            select_delta_kernel(CostFunction::CrossEntropy, Activation::Tanh, DENSE),
            Err(DataSetError::UnsupportedActivation { .. })
        ));
        assert!(
            select_delta_kernel(CostFunction::CrossEntropy, Activation::SoftMax, DENSE).is_ok()
        );
        assert!(select_delta_kernel(CostFunction::L2, Activation::Tanh, DENSE).is_ok());
    }

    #[test]
    fn test_sparse_kernel_table() {
        assert_eq!(
            select_sparse_kernel(SparseOp::LoadInput, DENSE).unwrap(),
            SparseKernel::LoadInput
        );
        assert!(select_sparse_kernel(SparseOp::Z, DENSE).is_err());
        let denoised = KernelFlags {
            denoising: true,
            ..ANALOG
        };
        let kernel = select_sparse_kernel(SparseOp::TransposedMatrix, denoised).unwrap();
        assert_eq!(kernel, SparseKernel::SparseTransposedAnalogDenoisedMatrix);
        assert!(kernel.is_analog() && kernel.is_denoised());
        assert_eq!(kernel.op(), SparseOp::TransposedMatrix);
        assert_eq!(
            select_sparse_kernel(SparseOp::TransposedWeightGradient, BOOLEAN).unwrap(),
            SparseKernel::SparseTransposedWeightGradient
        );
    }
}
