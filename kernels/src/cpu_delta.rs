use crate::{
    Activation, BatchShape, KernelElem, KernelError, KernelParams, Result, SparseTarget, to_f32,
};
use rayon::prelude::*;

/// Output-delta formulas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeltaFormula {
    /// `(a - t) * f'(a)`
    Output,
    /// `sign(a - t) * f'(a)`
    L1,
    /// `a - t`
    CrossEntropy,
    ScaledMarginalCrossEntropy,
    DataScaledMarginalCrossEntropy,
}

impl DeltaFormula {
    fn name(self) -> &'static str {
        match self {
            DeltaFormula::Output => "OutputDelta",
            DeltaFormula::L1 => "L1OutputDelta",
            DeltaFormula::CrossEntropy => "CrossEntropyOutputDelta",
            DeltaFormula::ScaledMarginalCrossEntropy => "ScaledMarginalCrossEntropyOutputDelta",
            DeltaFormula::DataScaledMarginalCrossEntropy => {
                "DataScaledMarginalCrossEntropyOutputDelta"
            }
        }
    }

    /// Cross-entropy deltas assume the activation derivative cancels.
    fn check_activation(self, activation: Activation) -> Result<()> {
        let cross_entropy = matches!(
            self,
            DeltaFormula::CrossEntropy
                | DeltaFormula::ScaledMarginalCrossEntropy
                | DeltaFormula::DataScaledMarginalCrossEntropy
        );
        if cross_entropy && !matches!(activation, Activation::Sigmoid | Activation::SoftMax) {
            return Err(KernelError::UnsupportedActivation {
                kernel: self.name(),
                activation,
            });
        }
        Ok(())
    }
}

/// Derivative of `activation` expressed in terms of its output `a`.
pub fn activation_derivative(activation: Activation, params: &KernelParams, a: f32) -> f32 {
    match activation {
        Activation::Sigmoid => a * (1.0 - a),
        Activation::Tanh => 1.0 - a * a,
        Activation::Linear | Activation::SoftMax => 1.0,
        Activation::RectifiedLinear => {
            if a > 0.0 {
                1.0
            } else {
                0.0
            }
        }
        Activation::LeakyRectifiedLinear => {
            if a > 0.0 {
                1.0
            } else {
                params.relu_slope
            }
        }
        Activation::ExponentialLinear => {
            if a >= 0.0 {
                1.0
            } else {
                a + params.elu_alpha
            }
        }
        Activation::ScaledExponentialLinear => {
            if a >= 0.0 {
                params.selu_lambda
            } else {
                a + params.elu_alpha * params.selu_lambda
            }
        }
    }
}

#[inline]
fn unit_delta(
    formula: DeltaFormula,
    activation: Activation,
    params: &KernelParams,
    a: f32,
    t: f32,
) -> f32 {
    let marginal = |weight: f32| {
        if t > 0.0 {
            if a < params.one_target {
                params.one_scale * weight * (a - 1.0)
            } else {
                0.0
            }
        } else if a > params.zero_target {
            params.zero_scale * a
        } else {
            0.0
        }
    };
    match formula {
        DeltaFormula::Output => (a - t) * activation_derivative(activation, params, a),
        DeltaFormula::L1 => {
            let diff = a - t;
            let sign = if diff > 0.0 {
                1.0
            } else if diff < 0.0 {
                -1.0
            } else {
                0.0
            };
            sign * activation_derivative(activation, params, a)
        }
        DeltaFormula::CrossEntropy => a - t,
        DeltaFormula::ScaledMarginalCrossEntropy => marginal(1.0),
        DeltaFormula::DataScaledMarginalCrossEntropy => marginal(t),
    }
}

/// Writes `batch * stride` deltas computed against dense targets.
///
/// # Errors
///
/// Returns [`KernelError::UnsupportedActivation`] for a cross-entropy formula paired with
/// anything but Sigmoid or SoftMax, and [`KernelError::ShapeMismatch`] for short buffers.
pub fn cpu_dense_delta<T: KernelElem>(
    formula: DeltaFormula,
    activation: Activation,
    params: &KernelParams,
    shape: &BatchShape,
    unit: &[f32],
    delta: &mut [f32],
    data: &[T],
) -> Result<()> {
    formula.check_activation(activation)?;
    shape.check_units(unit.len())?;
    shape.check_units(delta.len())?;
    if data.len() < (shape.position + shape.batch) * shape.stride {
        return Err(KernelError::ShapeMismatch {
            expected: vec![shape.position + shape.batch, shape.stride],
            got: vec![data.len()],
        });
    }
    if formula == DeltaFormula::DataScaledMarginalCrossEntropy {
        return Err(KernelError::MissingBuffer("sparse data"));
    }
    let units = shape.units();
    delta[..units]
        .par_chunks_mut(shape.stride)
        .zip(unit[..units].par_chunks(shape.stride))
        .enumerate()
        .for_each(|(i, (out, row))| {
            let base = (shape.position + i) * shape.stride;
            for (j, (d, &a)) in out.iter_mut().zip(row.iter()).enumerate() {
                *d = unit_delta(formula, activation, params, a, to_f32(data[base + j]));
            }
        });
    Ok(())
}

/// Writes `batch * stride` deltas computed against sparse targets.
///
/// With `ignore_zero` set, positions without a sparse entry receive a zero delta.
#[allow(clippy::too_many_arguments)]
pub fn cpu_sparse_delta<T: KernelElem>(
    formula: DeltaFormula,
    activation: Activation,
    params: &KernelParams,
    shape: &BatchShape,
    unit: &[f32],
    delta: &mut [f32],
    target: &SparseTarget<'_, T>,
    ignore_zero: bool,
) -> Result<()> {
    formula.check_activation(activation)?;
    shape.check_units(unit.len())?;
    shape.check_units(delta.len())?;
    target.check(shape, shape.stride)?;
    if formula == DeltaFormula::DataScaledMarginalCrossEntropy && target.is_boolean() {
        return Err(KernelError::MissingBuffer("sparse data"));
    }
    let units = shape.units();
    delta[..units]
        .par_chunks_mut(shape.stride)
        .zip(unit[..units].par_chunks(shape.stride))
        .enumerate()
        .for_each(|(i, (out, row))| {
            let (t, present) = target.expand(shape.position + i, shape.stride);
            for (j, (d, &a)) in out.iter_mut().zip(row.iter()).enumerate() {
                *d = if ignore_zero && !present[j] {
                    0.0
                } else {
                    unit_delta(formula, activation, params, a, t[j])
                };
            }
        });
    Ok(())
}
