use super::{Attributes, DataSet, Sharding};
use crate::context::ComputeContext;
use crate::device::{DataElem, Device};
use crate::distributed::CollectiveBackend;
use crate::error::{DataSetError, Result};
use tracing::warn;

type SparseArrays<T> = (Vec<u64>, Vec<u64>, Vec<u32>, Option<Vec<T>>);

/// Packs examples back to back and orders each example's entries by feature id.
///
/// The sort is stable, so duplicate ids keep their relative order.
pub(crate) fn canonicalize<T: DataElem>(
    start: Vec<u64>,
    end: Vec<u64>,
    index: Vec<u32>,
    data: Option<Vec<T>>,
) -> Result<SparseArrays<T>> {
    if start.len() != end.len() {
        return Err(DataSetError::ShapeMismatch {
            what: "sparse end".into(),
            expected: vec![start.len()],
            got: vec![end.len()],
        });
    }
    if let Some(values) = &data
        && values.len() != index.len()
    {
        return Err(DataSetError::ShapeMismatch {
            what: "sparse data".into(),
            expected: vec![index.len()],
            got: vec![values.len()],
        });
    }
    let mut packed_start = Vec::with_capacity(start.len());
    let mut packed_end = Vec::with_capacity(end.len());
    let mut packed_index = Vec::with_capacity(index.len());
    let mut packed_data = data.as_ref().map(|_| Vec::with_capacity(index.len()));
    let mut order = Vec::new();
    for (n, (&s, &e)) in start.iter().zip(&end).enumerate() {
        if s > e || e > index.len() as u64 {
            return Err(DataSetError::invalid(
                "sparseEnd",
                format!(
                    "example {n} spans [{s}, {e}) outside {} entries",
                    index.len()
                ),
            ));
        }
        order.clear();
        order.extend(s as usize..e as usize);
        order.sort_by_key(|&k| index[k]);
        packed_start.push(packed_index.len() as u64);
        packed_index.extend(order.iter().map(|&k| index[k]));
        if let (Some(out), Some(values)) = (packed_data.as_mut(), data.as_ref()) {
            out.extend(order.iter().map(|&k| values[k]));
        }
        packed_end.push(packed_index.len() as u64);
    }
    Ok((packed_start, packed_end, packed_index, packed_data))
}

impl<T: DataElem, D: Device> DataSet<T, D> {
    /// Recomputes the per-feature nonzero counts and the derived statistics.
    ///
    /// Collective: every worker must call it. Returns `Ok(false)` on a dense dataset.
    ///
    /// # Errors
    ///
    /// A feature id at or beyond the width on any worker fails every worker.
    pub fn calculate_sparse_datapoint_counts<B: CollectiveBackend>(
        &mut self,
        ctx: &ComputeContext<B, D>,
    ) -> Result<bool> {
        if !self.is_sparse() {
            warn!(name = %self.name, "sparse datapoint counts requested for a dense dataset");
            return Ok(false);
        }
        let backend = ctx.backend();
        let width = self.geometry.width;
        let bad = self
            .sparse_index
            .iter()
            .find(|&&x| x as usize >= width)
            .map_or(0, |&x| x as u64 + 1);
        let bad = backend.all_reduce_max_u64(bad)?;
        if bad > 0 {
            return Err(DataSetError::IndexOutOfRange {
                what: "sparse feature",
                index: (bad - 1) as usize,
                bound: width,
            });
        }

        self.count_local_datapoints();

        let local_counts: Vec<u64> = self
            .sparse_start
            .iter()
            .zip(&self.sparse_end)
            .map(|(&s, &e)| e - s)
            .collect();
        // Model shards split every example, so per-example counts are summed first.
        self.max_sparse_datapoints = if self.sharding == Sharding::Model {
            backend
                .all_reduce_sum_u64s(&local_counts)?
                .into_iter()
                .max()
                .unwrap_or(0)
        } else {
            let local_max = local_counts.iter().copied().max().unwrap_or(0);
            backend.all_reduce_max_u64(local_max)?
        };

        let limit = ctx.config().sparse_limit(self.is_boolean());
        if self.max_sparse_datapoints > limit as u64 {
            warn!(
                name = %self.name,
                max_sparse_datapoints = self.max_sparse_datapoints,
                limit,
                "examples exceed the fast sparse kernel limit"
            );
        }

        let positions = self.examples as f64 * self.geometry.stride() as f64;
        self.sparse_density = if positions > 0.0 {
            self.sparse_data_size as f64 / positions
        } else {
            0.0
        };
        Ok(true)
    }

    /// Per-feature counts over this worker's rows; clears `dirty`.
    ///
    /// Local only, used before a transposed rebuild once indices have already been
    /// validated at load or shard time.
    pub(crate) fn count_local_datapoints(&mut self) {
        let mut counts = vec![0u64; self.geometry.stride()];
        for &x in &self.sparse_index {
            if let Some(c) = counts.get_mut(x as usize) {
                *c += 1;
            }
        }
        self.sparse_datapoint_count = counts;
        self.dirty = false;
    }

    /// Restores feature-id order within example `n`, moving values with their ids.
    pub(crate) fn sort_example(&mut self, n: usize) {
        let (s, e) = (self.sparse_start[n] as usize, self.sparse_end[n] as usize);
        let index = &mut self.sparse_index[s..e];
        if index.is_sorted() {
            return;
        }
        let mut order: Vec<usize> = (0..index.len()).collect();
        order.sort_by_key(|&k| index[k]);
        let ids: Vec<u32> = order.iter().map(|&k| index[k]).collect();
        index.copy_from_slice(&ids);
        if !self.attributes.contains(Attributes::BOOLEAN) {
            let values = &mut self.sparse_data[s..e];
            let sorted: Vec<T> = order.iter().map(|&k| values[k]).collect();
            values.copy_from_slice(&sorted);
        }
    }

    /// Local nonzero count, the length of the denoising mask.
    pub(crate) fn local_nonzeros(&self) -> usize {
        if self.attributes.contains(Attributes::SPARSE) {
            self.sparse_index.len()
        } else {
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::dataset::Geometry;
    use crate::distributed::CpuBackend;

    #[test]
    fn test_canonicalize_packs_and_sorts() {
        // Example 0 lives after example 1 and has a gap before it.
        let start = vec![3, 0];
        let end = vec![6, 2];
        let index = vec![4, 1, 9, 7, 2, 5];
        let data = Some(vec![40.0f32, 10.0, 99.0, 70.0, 20.0, 50.0]);
        let (s, e, i, d) = canonicalize(start, end, index, data).unwrap();
        assert_eq!(s, vec![0, 3]);
        assert_eq!(e, vec![3, 5]);
        assert_eq!(i, vec![2, 5, 7, 1, 4]);
        assert_eq!(d.unwrap(), vec![20.0, 50.0, 70.0, 10.0, 40.0]);
    }

    #[test]
    fn test_canonicalize_rejects_bad_ranges() {
        assert!(canonicalize::<f32>(vec![0], vec![3], vec![0, 1], None).is_err());
        assert!(canonicalize::<f32>(vec![2], vec![1], vec![0, 1], None).is_err());
        assert!(canonicalize::<f32>(vec![0], vec![1, 2], vec![0, 1], None).is_err());
        assert!(canonicalize(vec![0], vec![1], vec![0, 1], Some(vec![1.0f32])).is_err());
    }

    #[test]
    fn test_counts_and_density() {
        let ctx = ComputeContext::cpu(CpuBackend::solo(), EngineConfig::default());
        let mut ds = DataSet::<f32>::sparse_boolean(
            "b",
            Geometry::d1(5),
            vec![0, 2, 2, 5],
            vec![2, 2, 5, 6],
            vec![0, 3, 0, 1, 3, 4],
        )
        .unwrap();
        assert!(ds.is_dirty());
        assert!(ds.calculate_sparse_datapoint_counts(&ctx).unwrap());
        assert!(!ds.is_dirty());
        assert_eq!(ds.sparse_datapoint_counts(), &[2, 1, 0, 2, 1]);
        assert_eq!(ds.max_sparse_datapoints(), 3);
        approx::assert_relative_eq!(ds.sparse_density(), 6.0 / 20.0);
    }

    #[test]
    fn test_counts_reject_wide_index() {
        let ctx = ComputeContext::cpu(CpuBackend::solo(), EngineConfig::default());
        let mut ds =
            DataSet::<f32>::sparse_boolean("b", Geometry::d1(3), vec![0], vec![1], vec![3])
                .unwrap();
        let err = ds.calculate_sparse_datapoint_counts(&ctx).unwrap_err();
        assert!(matches!(
            err,
            DataSetError::IndexOutOfRange { index: 3, bound: 3, .. }
        ));
    }

    #[test]
    fn test_counts_on_dense_is_soft() {
        let ctx = ComputeContext::cpu(CpuBackend::solo(), EngineConfig::default());
        let mut ds = DataSet::<f32>::dense("d", Geometry::d1(2), vec![1.0, 0.0]).unwrap();
        assert!(!ds.calculate_sparse_datapoint_counts(&ctx).unwrap());
    }
}
