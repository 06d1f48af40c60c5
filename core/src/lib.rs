//! # nndataset
//!
//! `nndataset` is the dataset engine of a distributed neural-network trainer. It stores
//! dense and sparse training examples, partitions them across the workers of a job for
//! data-parallel or model-parallel training, and feeds batches to the numeric kernels.
//!
//! ## Modules
//!
//! - [`dataset`]: the [`DataSet`] container, sharding, the transposed sparse view and
//!   denoising masks.
//! - [`schema`]: reading and writing dataset files.
//! - [`loss`]: selection of the error, delta and input kernels for a dataset.
//! - [`kernels`]: the kernel boundary and its CPU implementation.
//! - [`distributed`]: collectives between workers.
//! - [`device`]: device buffers and element types.
//!
//! ## Example
//!
//! ```rust
//! use nndataset::{ComputeContext, CpuBackend, DataSet, EngineConfig, Geometry, Sharding};
//!
//! let ctx = ComputeContext::cpu(CpuBackend::solo(), EngineConfig::default());
//! let ds = DataSet::<f32>::sparse_boolean(
//!     "clicks",
//!     Geometry::d1(8),
//!     vec![0, 2],
//!     vec![2, 3],
//!     vec![5, 1, 7],
//! )
//! .unwrap();
//! let mut ds = DataSet::from_coordinator(Some(Ok(ds)), &ctx).unwrap();
//! ds.shard(Sharding::Data, &ctx).unwrap();
//! assert_eq!(ds.max_sparse_datapoints(), 2);
//! ```

pub mod config;
pub mod context;
pub mod dataset;
pub mod device;
pub mod distributed;
pub mod error;
pub mod kernels;
pub mod loss;
pub mod schema;

pub use config::EngineConfig;
pub use context::ComputeContext;
pub use dataset::{AnyDataSet, Attributes, DataSet, Geometry, Sharding};
pub use device::{Cpu, DataElem, DataType, Device, DeviceBuffer, HostBuffer};
pub use distributed::{COORDINATOR, CollectiveBackend, CpuBackend};
pub use error::{DataSetError, Result, Severity};
pub use kernels::{CpuKernels, KernelLibrary};
pub use loss::{CostFunction, KernelFlags, TargetKind};
pub use nndataset_kernels::{Activation, BatchShape, KernelParams};
pub use schema::{load_datasets, save_datasets};
