use criterion::{Criterion, criterion_group, criterion_main};
use nndataset_kernels::{
    BatchShape, ErrorFormula, KernelParams, SparseTarget, cpu_load_sparse_input, cpu_sparse_error,
};
use std::hint::black_box;

/// Boolean sparse batch with `nnz` features per example spread across `stride` columns.
fn sparse_batch(batch: usize, stride: usize, nnz: usize) -> (Vec<u64>, Vec<u64>, Vec<u32>) {
    let mut start = Vec::with_capacity(batch);
    let mut end = Vec::with_capacity(batch);
    let mut index = Vec::with_capacity(batch * nnz);
    for n in 0..batch {
        start.push(index.len() as u64);
        for k in 0..nnz {
            index.push(((n * 7 + k * (stride / nnz)) % stride) as u32);
        }
        index[start[n] as usize..].sort_unstable();
        end.push(index.len() as u64);
    }
    (start, end, index)
}

fn benchmark_sparse_error(c: &mut Criterion) {
    let mut group = c.benchmark_group("sparse_error");
    let params = KernelParams::default();
    let strides = [256, 1024, 4096];

    for &stride in &strides {
        let batch = 128;
        let (start, end, index) = sparse_batch(batch, stride, 32);
        let target = SparseTarget::<f32>::new(&start, &end, &index, None);
        let shape = BatchShape::new(0, batch, stride);
        let unit = vec![0.5f32; batch * stride];

        group.bench_function(format!("{}x{}", batch, stride), |b| {
            b.iter(|| {
                cpu_sparse_error(
                    ErrorFormula::CrossEntropy,
                    &params,
                    black_box(&shape),
                    black_box(&unit),
                    black_box(&target),
                    false,
                )
                .unwrap()
            })
        });
    }
    group.finish();
}

fn benchmark_load_sparse_input(c: &mut Criterion) {
    let mut group = c.benchmark_group("load_sparse_input");
    let params = KernelParams::default();
    let strides = [1024, 4096, 16384];

    for &stride in &strides {
        let batch = 256;
        let (start, end, index) = sparse_batch(batch, stride, 64);
        let target = SparseTarget::<f32>::new(&start, &end, &index, None);
        let shape = BatchShape::new(0, batch, stride);
        let mut unit = vec![0.0f32; batch * stride];

        group.bench_function(format!("{}x{}", batch, stride), |b| {
            b.iter(|| {
                cpu_load_sparse_input(&params, black_box(&shape), &mut unit, &target, None).unwrap()
            })
        });
    }
    group.finish();
}

criterion_group!(benches, benchmark_sparse_error, benchmark_load_sparse_input);
criterion_main!(benches);
