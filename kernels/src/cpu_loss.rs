use crate::{BatchShape, KernelElem, KernelError, KernelParams, Result, SparseTarget, to_f32};
use rayon::prelude::*;

/// Floor applied inside every logarithm.
pub const MIN_ERROR: f32 = 1.0e-7;

/// Scalar error formulas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorFormula {
    L1,
    L2,
    CrossEntropy,
    ScaledMarginalCrossEntropy,
    MultinomialCrossEntropy,
    MultinomialScaledMarginalCrossEntropy,
    DataScaledMarginalCrossEntropy,
}

impl ErrorFormula {
    fn is_multinomial(self) -> bool {
        matches!(
            self,
            ErrorFormula::MultinomialCrossEntropy
                | ErrorFormula::MultinomialScaledMarginalCrossEntropy
        )
    }
}

#[inline]
fn ln_floor(x: f32) -> f32 {
    x.max(MIN_ERROR).ln()
}

/// Error contributed by one unit `a` against target `t`.
#[inline]
fn unit_error(formula: ErrorFormula, params: &KernelParams, a: f32, t: f32) -> f32 {
    match formula {
        ErrorFormula::L1 => (a - t).abs(),
        ErrorFormula::L2 => 0.5 * (a - t) * (a - t),
        ErrorFormula::CrossEntropy => -t * ln_floor(a) - (1.0 - t) * ln_floor(1.0 - a),
        ErrorFormula::ScaledMarginalCrossEntropy | ErrorFormula::DataScaledMarginalCrossEntropy => {
            let weight = match formula {
                ErrorFormula::DataScaledMarginalCrossEntropy => t,
                _ => 1.0,
            };
            if t > 0.0 {
                if a < params.one_target {
                    -params.one_scale * weight * ln_floor(a)
                } else {
                    0.0
                }
            } else if a > params.zero_target {
                -params.zero_scale * ln_floor(1.0 - a)
            } else {
                0.0
            }
        }
        ErrorFormula::MultinomialCrossEntropy => -t * ln_floor(a),
        ErrorFormula::MultinomialScaledMarginalCrossEntropy => {
            if t != 0.0 && a < params.one_target {
                -params.one_scale * t * ln_floor(a)
            } else {
                0.0
            }
        }
    }
}

/// Batch error against dense targets.
///
/// # Arguments
///
/// * `unit` - `batch * stride` predicted values.
/// * `data` - the dataset's dense rows, `stride` values per example.
pub fn cpu_dense_error<T: KernelElem>(
    formula: ErrorFormula,
    params: &KernelParams,
    shape: &BatchShape,
    unit: &[f32],
    data: &[T],
) -> Result<f32> {
    shape.check_units(unit.len())?;
    if data.len() < (shape.position + shape.batch) * shape.stride {
        return Err(KernelError::ShapeMismatch {
            expected: vec![shape.position + shape.batch, shape.stride],
            got: vec![data.len()],
        });
    }
    if formula == ErrorFormula::DataScaledMarginalCrossEntropy {
        return Err(KernelError::MissingBuffer("sparse data"));
    }
    let sum: f64 = unit[..shape.units()]
        .par_chunks(shape.stride)
        .enumerate()
        .map(|(i, row)| {
            let base = (shape.position + i) * shape.stride;
            row.iter()
                .enumerate()
                .map(|(j, &a)| {
                    let t = to_f32(data[base + j]);
                    unit_error(formula, params, a, t) as f64
                })
                .sum::<f64>()
        })
        .sum();
    Ok(sum as f32)
}

/// Batch error against sparse targets.
///
/// Positions without a sparse entry count as zero targets, or are skipped entirely when
/// `ignore_zero` is set. Multinomial formulas only ever visit the entries; for Boolean
/// data each entry of example `n` carries `1 / count(n)`.
pub fn cpu_sparse_error<T: KernelElem>(
    formula: ErrorFormula,
    params: &KernelParams,
    shape: &BatchShape,
    unit: &[f32],
    target: &SparseTarget<'_, T>,
    ignore_zero: bool,
) -> Result<f32> {
    shape.check_units(unit.len())?;
    target.check(shape, shape.stride)?;
    if formula == ErrorFormula::DataScaledMarginalCrossEntropy && target.is_boolean() {
        return Err(KernelError::MissingBuffer("sparse data"));
    }
    let multinomial = formula.is_multinomial();
    let sum: f64 = unit[..shape.units()]
        .par_chunks(shape.stride)
        .enumerate()
        .map(|(i, row)| {
            let n = shape.position + i;
            if multinomial {
                let entries = target.entries(n);
                let scale = if target.is_boolean() && !entries.is_empty() {
                    1.0 / entries.len() as f32
                } else {
                    1.0
                };
                return entries
                    .map(|k| {
                        let t = target.value(k) * scale;
                        unit_error(formula, params, row[target.index[k] as usize], t) as f64
                    })
                    .sum::<f64>();
            }
            let (t, present) = target.expand(n, shape.stride);
            row.iter()
                .zip(t.iter().zip(present.iter()))
                .filter(|(_, (_, p))| !ignore_zero || **p)
                .map(|(&a, (&t, _))| unit_error(formula, params, a, t) as f64)
                .sum::<f64>()
        })
        .sum();
    Ok(sum as f32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn params() -> KernelParams {
        KernelParams::default()
    }

    #[test]
    fn test_dense_l2() {
        let shape = BatchShape::new(0, 2, 2);
        let unit = [0.5f32, 0.0, 1.0, 1.0];
        let data = [1.0f32, 0.0, 0.0, 1.0];
        let err = cpu_dense_error(ErrorFormula::L2, &params(), &shape, &unit, &data).unwrap();
        assert_relative_eq!(err, 0.5 * 0.25 + 0.5, epsilon = 1e-6);
    }

    #[test]
    fn test_dense_l1_uses_position() {
        let shape = BatchShape::new(1, 1, 2);
        let unit = [0.0f32, 0.0];
        let data = [9u8, 9, 1, 2];
        let err = cpu_dense_error(ErrorFormula::L1, &params(), &shape, &unit, &data).unwrap();
        assert_relative_eq!(err, 3.0);
    }

    #[test]
    fn test_cross_entropy_floor() {
        let shape = BatchShape::new(0, 1, 1);
        let err =
            cpu_dense_error(ErrorFormula::CrossEntropy, &params(), &shape, &[0.0], &[1.0f32])
                .unwrap();
        assert_relative_eq!(err, -MIN_ERROR.ln(), epsilon = 1e-4);
    }

    #[test]
    fn test_sparse_boolean_l2_matches_dense() {
        // Example 0 has features {1, 3}, example 1 has {0}.
        let start = [0u64, 2];
        let end = [2u64, 3];
        let index = [1u32, 3, 0];
        let target = SparseTarget::<f32>::new(&start, &end, &index, None);
        let shape = BatchShape::new(0, 2, 4);
        let unit = [0.2f32, 0.7, 0.1, 0.9, 0.6, 0.3, 0.0, 0.0];
        let dense = [0.0f32, 1.0, 0.0, 1.0, 1.0, 0.0, 0.0, 0.0];

        let sparse =
            cpu_sparse_error(ErrorFormula::L2, &params(), &shape, &unit, &target, false).unwrap();
        let expected =
            cpu_dense_error(ErrorFormula::L2, &params(), &shape, &unit, &dense).unwrap();
        assert_relative_eq!(sparse, expected, epsilon = 1e-6);
    }

    #[test]
    fn test_sparse_ignore_zero_skips_empty_positions() {
        let start = [0u64];
        let end = [1u64];
        let index = [2u32];
        let data = [0.5f32];
        let target = SparseTarget::new(&start, &end, &index, Some(&data[..]));
        let shape = BatchShape::new(0, 1, 4);
        let unit = [1.0f32, 1.0, 1.0, 1.0];

        let all =
            cpu_sparse_error(ErrorFormula::L1, &params(), &shape, &unit, &target, false).unwrap();
        let ignored =
            cpu_sparse_error(ErrorFormula::L1, &params(), &shape, &unit, &target, true).unwrap();
        assert_relative_eq!(all, 3.5);
        assert_relative_eq!(ignored, 0.5);
    }

    #[test]
    fn test_multinomial_boolean_splits_target() {
        let start = [0u64];
        let end = [2u64];
        let index = [0u32, 1];
        let target = SparseTarget::<f32>::new(&start, &end, &index, None);
        let shape = BatchShape::new(0, 1, 3);
        let unit = [0.5f32, 0.25, 0.25];
        let err = cpu_sparse_error(
            ErrorFormula::MultinomialCrossEntropy,
            &params(),
            &shape,
            &unit,
            &target,
            false,
        )
        .unwrap();
        let expected = -0.5 * 0.5f32.ln() - 0.5 * 0.25f32.ln();
        assert_relative_eq!(err, expected, epsilon = 1e-6);
    }

    #[test]
    fn test_scaled_marginal_gates() {
        let start = [0u64];
        let end = [1u64];
        let index = [0u32];
        let target = SparseTarget::<f32>::new(&start, &end, &index, None);
        let shape = BatchShape::new(0, 1, 3);
        // Positive above one_target and zeros below zero_target contribute nothing.
        let unit = [0.95f32, 0.05, 0.5];
        let err = cpu_sparse_error(
            ErrorFormula::ScaledMarginalCrossEntropy,
            &params(),
            &shape,
            &unit,
            &target,
            false,
        )
        .unwrap();
        assert_relative_eq!(err, -(0.5f32.ln()), epsilon = 1e-6);
    }

    #[test]
    fn test_data_scaled_requires_values() {
        let start = [0u64];
        let end = [1u64];
        let index = [0u32];
        let target = SparseTarget::<f32>::new(&start, &end, &index, None);
        let shape = BatchShape::new(0, 1, 1);
        let err = cpu_sparse_error(
            ErrorFormula::DataScaledMarginalCrossEntropy,
            &params(),
            &shape,
            &[0.5],
            &target,
            false,
        );
        assert!(matches!(err, Err(KernelError::MissingBuffer(_))));
    }

    #[test]
    fn test_data_scaled_weights_by_value() {
        let start = [0u64];
        let end = [1u64];
        let index = [0u32];
        let data = [2.0f32];
        let target = SparseTarget::new(&start, &end, &index, Some(&data[..]));
        let shape = BatchShape::new(0, 1, 2);
        let unit = [0.5f32, 0.5];
        let err = cpu_sparse_error(
            ErrorFormula::DataScaledMarginalCrossEntropy,
            &params(),
            &shape,
            &unit,
            &target,
            false,
        )
        .unwrap();
        let expected = -2.0 * 0.5f32.ln() - 0.5f32.ln();
        assert_relative_eq!(err, expected, epsilon = 1e-6);
    }
}
