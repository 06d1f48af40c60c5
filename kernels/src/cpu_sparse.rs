use crate::{BatchShape, KernelElem, KernelError, KernelParams, Result, SparseTarget, to_f32};
use rayon::prelude::*;

/// Value fed forward for sparse entry `k`, or `None` when denoising drops it.
#[inline]
fn input_value<T: KernelElem>(
    params: &KernelParams,
    target: &SparseTarget<'_, T>,
    random: Option<&[f32]>,
    k: usize,
) -> Option<f32> {
    match random {
        None => Some(target.value(k)),
        Some(r) if params.keeps(r[k]) => Some(target.value(k) * params.denoising_q()),
        Some(_) => None,
    }
}

fn check_random(random: Option<&[f32]>, entries: usize) -> Result<()> {
    match random {
        Some(r) if r.len() < entries => Err(KernelError::ShapeMismatch {
            expected: vec![entries],
            got: vec![r.len()],
        }),
        _ => Ok(()),
    }
}

/// Copies dense rows `position..position + batch` into the unit buffer.
pub fn cpu_load_dense_input<T: KernelElem>(
    shape: &BatchShape,
    unit: &mut [f32],
    data: &[T],
) -> Result<()> {
    shape.check_units(unit.len())?;
    let begin = shape.position * shape.stride;
    let Some(rows) = data.get(begin..begin + shape.units()) else {
        return Err(KernelError::ShapeMismatch {
            expected: vec![shape.position + shape.batch, shape.stride],
            got: vec![data.len()],
        });
    };
    unit[..shape.units()]
        .par_iter_mut()
        .zip(rows.par_iter())
        .for_each(|(u, &d)| *u = to_f32(d));
    Ok(())
}

/// Expands sparse examples into unit rows: zero everywhere, the entry value (1 for
/// Boolean data) at each feature id.
///
/// With `random`, entry `k` survives when `random[k] >= denoising_p` and is rescaled by
/// `1 / (1 - denoising_p)`.
pub fn cpu_load_sparse_input<T: KernelElem>(
    params: &KernelParams,
    shape: &BatchShape,
    unit: &mut [f32],
    target: &SparseTarget<'_, T>,
    random: Option<&[f32]>,
) -> Result<()> {
    shape.check_units(unit.len())?;
    target.check(shape, shape.stride)?;
    check_random(random, target.index.len())?;
    unit[..shape.units()]
        .par_chunks_mut(shape.stride)
        .enumerate()
        .for_each(|(i, row)| {
            row.fill(0.0);
            for k in target.entries(shape.position + i) {
                if let Some(v) = input_value(params, target, random, k) {
                    row[target.index[k] as usize] = v;
                }
            }
        });
    Ok(())
}

/// Sparse matrix product into the unit buffer:
/// `unit[i][j] = beta * unit[i][j] + Σ weight[index][j] * value`.
///
/// `weight` is laid out feature-major, `stride` values per feature.
#[allow(clippy::too_many_arguments)]
pub fn cpu_sparse_z<T: KernelElem>(
    params: &KernelParams,
    shape: &BatchShape,
    weight: &[f32],
    unit: &mut [f32],
    target: &SparseTarget<'_, T>,
    random: Option<&[f32]>,
    beta: f32,
) -> Result<()> {
    shape.check_units(unit.len())?;
    target.check(shape, weight.len() / shape.stride)?;
    check_random(random, target.index.len())?;
    unit[..shape.units()]
        .par_chunks_mut(shape.stride)
        .enumerate()
        .for_each(|(i, row)| {
            row.iter_mut().for_each(|u| *u *= beta);
            for k in target.entries(shape.position + i) {
                let Some(v) = input_value(params, target, random, k) else {
                    continue;
                };
                let w = &weight[target.index[k] as usize * shape.stride..][..shape.stride];
                for (u, &w) in row.iter_mut().zip(w) {
                    *u += w * v;
                }
            }
        });
    Ok(())
}

/// Column-grouped destination of [`cpu_sparse_transposed_matrix`].
///
/// `end` must start out equal to `start`; each scattered entry advances the end of its
/// column by one.
#[derive(Debug)]
pub struct TransposedBuckets<'a> {
    pub start: &'a [u64],
    pub end: &'a mut [u64],
    pub index: &'a mut [u32],
    pub data: Option<&'a mut [f32]>,
}

impl TransposedBuckets<'_> {
    /// Exclusive end of the bucket reserved for `column`.
    fn limit(&self, column: usize) -> usize {
        self.start
            .get(column + 1)
            .map_or(self.index.len(), |&s| s as usize)
    }
}

/// Scatters the batch's sparse entries into per-feature buckets, recording the
/// batch-relative example number (and value for analog data).
///
/// Entries are visited in example order, so every bucket lists its examples ascending.
pub fn cpu_sparse_transposed_matrix<T: KernelElem>(
    params: &KernelParams,
    position: usize,
    batch: usize,
    target: &SparseTarget<'_, T>,
    random: Option<&[f32]>,
    buckets: &mut TransposedBuckets<'_>,
) -> Result<()> {
    let shape = BatchShape::new(position, batch, 0);
    target.check(&shape, buckets.start.len())?;
    check_random(random, target.index.len())?;
    if buckets.end.len() < buckets.start.len() {
        return Err(KernelError::ShapeMismatch {
            expected: vec![buckets.start.len()],
            got: vec![buckets.end.len()],
        });
    }
    let analog = !target.is_boolean();
    if analog && buckets.data.is_none() {
        return Err(KernelError::MissingBuffer("sparse transposed data"));
    }
    for i in 0..batch {
        for k in target.entries(position + i) {
            let value = match random {
                None => target.value(k),
                Some(r) if params.keeps(r[k]) => target.value(k) * params.denoising_q(),
                Some(_) => continue,
            };
            let column = target.index[k] as usize;
            let slot = buckets.end[column] as usize;
            if slot >= buckets.limit(column) {
                return Err(KernelError::BucketOverflow { column });
            }
            buckets.index[slot] = i as u32;
            if analog && let Some(data) = buckets.data.as_deref_mut() {
                data[slot] = value;
            }
            buckets.end[column] += 1;
        }
    }
    Ok(())
}

/// Accumulates the weight gradient from the transposed view:
/// `gradient[i][j] = beta * gradient[i][j] + alpha * Σ delta[example][j] * value` over the
/// entries of column `i`.
///
/// # Arguments
///
/// * `m` - feature rows of the gradient.
/// * `n` - units per row; `delta` holds `n` values per batch example.
#[allow(clippy::too_many_arguments)]
pub fn cpu_sparse_transposed_weight_gradient(
    alpha: f32,
    beta: f32,
    m: usize,
    n: usize,
    start: &[u64],
    end: &[u64],
    index: &[u32],
    data: Option<&[f32]>,
    delta: &[f32],
    gradient: &mut [f32],
) -> Result<()> {
    if gradient.len() < m * n {
        return Err(KernelError::ShapeMismatch {
            expected: vec![m, n],
            got: vec![gradient.len()],
        });
    }
    if start.len() < m || end.len() < m {
        return Err(KernelError::ShapeMismatch {
            expected: vec![m],
            got: vec![start.len().min(end.len())],
        });
    }
    if n == 0 {
        return Ok(());
    }
    for column in 0..m {
        let (s, e) = (start[column] as usize, end[column] as usize);
        if s > e || e > index.len() {
            return Err(KernelError::IndexOutOfRange {
                what: "sparse transposed end",
                index: e,
                bound: index.len(),
            });
        }
        if let Some(&bad) = index[s..e].iter().find(|&&x| (x as usize + 1) * n > delta.len()) {
            return Err(KernelError::IndexOutOfRange {
                what: "delta row",
                index: bad as usize,
                bound: delta.len() / n,
            });
        }
    }
    gradient[..m * n]
        .par_chunks_mut(n)
        .enumerate()
        .for_each(|(column, row)| {
            let mut acc = vec![0.0f32; n];
            for k in start[column] as usize..end[column] as usize {
                let v = data.map_or(1.0, |d| d[k]);
                let d = &delta[index[k] as usize * n..][..n];
                for (a, &d) in acc.iter_mut().zip(d) {
                    *a += d * v;
                }
            }
            for (g, a) in row.iter_mut().zip(acc) {
                *g = beta * *g + alpha * a;
            }
        });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    // Two examples over four features: {0, 2} and {2, 3} with values 1..4.
    const START: [u64; 2] = [0, 2];
    const END: [u64; 2] = [2, 4];
    const INDEX: [u32; 4] = [0, 2, 2, 3];
    const DATA: [f32; 4] = [1.0, 2.0, 3.0, 4.0];

    #[test]
    fn test_load_dense_input() {
        let shape = BatchShape::new(1, 1, 3);
        let data = [1i32, 2, 3, 4, 5, 6];
        let mut unit = [0.0f32; 3];
        cpu_load_dense_input(&shape, &mut unit, &data).unwrap();
        assert_eq!(unit, [4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_load_sparse_input_boolean() {
        let target = SparseTarget::<f32>::new(&START, &END, &INDEX, None);
        let shape = BatchShape::new(0, 2, 4);
        let mut unit = [7.0f32; 8];
        cpu_load_sparse_input(&KernelParams::default(), &shape, &mut unit, &target, None)
            .unwrap();
        assert_eq!(unit, [1.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0, 1.0]);
    }

    #[test]
    fn test_load_sparse_input_denoised() {
        let params = KernelParams {
            denoising_p: 0.5,
            ..Default::default()
        };
        let target = SparseTarget::new(&START, &END, &INDEX, Some(&DATA[..]));
        let shape = BatchShape::new(0, 2, 4);
        let random = [0.9f32, 0.1, 0.5, 0.2];
        let mut unit = [0.0f32; 8];
        cpu_load_sparse_input(&params, &shape, &mut unit, &target, Some(&random[..])).unwrap();
        assert_eq!(unit, [2.0, 0.0, 0.0, 0.0, 0.0, 0.0, 6.0, 0.0]);
    }

    #[test]
    fn test_sparse_z() {
        let target = SparseTarget::new(&START, &END, &INDEX, Some(&DATA[..]));
        let shape = BatchShape::new(0, 2, 2);
        // Feature f has weights [f, 10f].
        let weight: Vec<f32> = (0..4).flat_map(|f| [f as f32, 10.0 * f as f32]).collect();
        let mut unit = [1.0f32; 4];
        cpu_sparse_z(
            &KernelParams::default(),
            &shape,
            &weight,
            &mut unit,
            &target,
            None,
            0.5,
        )
        .unwrap();
        // Example 0: 0*1 + 2*2 = 4; example 1: 2*3 + 3*4 = 18.
        assert_relative_eq!(unit[0], 4.5);
        assert_relative_eq!(unit[1], 40.5);
        assert_relative_eq!(unit[2], 18.5);
        assert_relative_eq!(unit[3], 180.5);
    }

    #[test]
    fn test_transposed_matrix_and_gradient() {
        let target = SparseTarget::new(&START, &END, &INDEX, Some(&DATA[..]));
        // Buckets: column 0 at 0, column 1 empty at 32, column 2 at 32, column 3 at 64.
        let start = [0u64, 32, 32, 64];
        let mut end = start;
        let mut index = vec![0u32; 96];
        let mut data = vec![0.0f32; 96];
        let mut buckets = TransposedBuckets {
            start: &start,
            end: &mut end,
            index: &mut index,
            data: Some(&mut data[..]),
        };
        cpu_sparse_transposed_matrix(&KernelParams::default(), 0, 2, &target, None, &mut buckets)
            .unwrap();
        assert_eq!(end, [1, 32, 34, 65]);
        assert_eq!(&index[32..34], &[0, 1]);
        assert_eq!(&data[32..34], &[2.0, 3.0]);
        assert_eq!(index[64], 1);

        let delta = [1.0f32, -1.0, 0.5, 2.0];
        let mut gradient = [1.0f32; 8];
        cpu_sparse_transposed_weight_gradient(
            1.0,
            0.0,
            4,
            2,
            &start,
            &end,
            &index,
            Some(&data[..]),
            &delta,
            &mut gradient,
        )
        .unwrap();
        assert_eq!(gradient, [1.0, -1.0, 0.0, 0.0, 3.5, 4.0, 2.0, 8.0]);
    }

    #[test]
    fn test_transposed_matrix_overflow() {
        let target = SparseTarget::<f32>::new(&START, &END, &INDEX, None);
        let start = [0u64, 1, 1, 2];
        let mut end = start;
        let mut index = vec![0u32; 3];
        let mut buckets = TransposedBuckets {
            start: &start,
            end: &mut end,
            index: &mut index,
            data: None,
        };
        let params = KernelParams::default();
        let err = cpu_sparse_transposed_matrix(&params, 0, 2, &target, None, &mut buckets);
        assert!(matches!(err, Err(KernelError::BucketOverflow { column: 2 })));
    }
}
