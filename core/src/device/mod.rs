//! Device abstraction for dataset storage.
//!
//! This module defines the `Device` trait and the host-memory `Cpu` device. A device
//! hands out owned [`DeviceBuffer`]s; the dataset keeps one buffer per host array and
//! moves data across only when asked to.

pub mod buffer;
pub mod elem;

pub use buffer::{DeviceBuffer, HostBuffer};
pub use elem::{DataElem, DataType};

use crate::error::Result;
use std::fmt::Debug;

/// A trait representing the memory that dataset arrays are mirrored into.
///
/// The `Buffer` associated type allows each device to define its own container
/// (e.g. `HostBuffer<T>` for `Cpu`, a driver allocation for an accelerator).
pub trait Device: Clone + Debug + PartialEq + Default + Send + Sync {
    /// The type of buffer allocated by this device.
    type Buffer<T>: DeviceBuffer<T>
    where
        T: DataElem;

    /// Returns the name of the device.
    fn name(&self) -> &'static str;

    /// Allocates a zero-filled buffer of `len` elements.
    fn allocate<T: DataElem>(&self, len: usize) -> Result<Self::Buffer<T>>;
}

/// A CPU Device.
///
/// Buffers live in system RAM; kernels run through `rayon` on the host.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Cpu;

impl Device for Cpu {
    type Buffer<T>
        = HostBuffer<T>
    where
        T: DataElem;

    fn name(&self) -> &'static str {
        "CPU"
    }

    fn allocate<T: DataElem>(&self, len: usize) -> Result<Self::Buffer<T>> {
        Ok(HostBuffer::zeroed(len))
    }
}

/// Allocates a buffer holding a copy of `src`.
pub(crate) fn upload_new<T: DataElem, D: Device>(device: &D, src: &[T]) -> Result<D::Buffer<T>> {
    let mut buffer = device.allocate::<T>(src.len())?;
    buffer.upload(src)?;
    Ok(buffer)
}
