//! Communication between the workers of one job.
//!
//! *   [`CollectiveBackend`](backend::CollectiveBackend): blocking point-to-point transfer
//!     plus the rooted collectives (broadcast, gather, all-reduce, barrier) the dataset
//!     engine uses to keep workers in lockstep.
//! *   [`CpuBackend`](cpu_backend::CpuBackend): an in-process implementation, one thread
//!     per worker, used by tests and single-machine jobs.

pub mod backend;
pub mod cpu_backend;

pub use backend::{COORDINATOR, CollectiveBackend};
pub use cpu_backend::CpuBackend;
