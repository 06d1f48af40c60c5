//! Owned device buffers.
//!
//! A buffer is owned by exactly one dataset field and released when that field is
//! dropped or replaced. Host and device copies are only synchronised by explicit
//! [`DeviceBuffer::upload`] and [`DeviceBuffer::download`] calls.

use crate::device::DataElem;
use crate::error::{DataSetError, Result};
use std::fmt::Debug;

/// A fixed-length array resident on a device.
pub trait DeviceBuffer<T>: Debug + Send + Sync {
    /// Returns the number of elements in the buffer.
    fn len(&self) -> usize;

    /// Returns `true` if the buffer contains no elements.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copies `src` into the front of the buffer.
    ///
    /// # Errors
    ///
    /// Returns [`DataSetError::ShapeMismatch`] if `src` is longer than the buffer.
    fn upload(&mut self, src: &[T]) -> Result<()>;

    /// Copies the front of the buffer into `dst`.
    fn download(&self, dst: &mut [T]) -> Result<()>;

    /// Device-to-device copy of `other` into the front of this buffer.
    fn copy_from(&mut self, other: &Self) -> Result<()>
    where
        Self: Sized;

    fn as_ptr(&self) -> *const T;

    fn as_mut_ptr(&mut self) -> *mut T;
}

/// Host-memory buffer backing the [`Cpu`](crate::device::Cpu) device.
#[derive(Debug, Clone, PartialEq)]
pub struct HostBuffer<T> {
    data: Vec<T>,
}

impl<T: DataElem> HostBuffer<T> {
    pub fn zeroed(len: usize) -> Self {
        Self {
            data: vec![T::zero(); len],
        }
    }

    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.data
    }
}

fn check_fits(what: &str, len: usize, capacity: usize) -> Result<()> {
    if len > capacity {
        return Err(DataSetError::ShapeMismatch {
            what: what.to_string(),
            expected: vec![capacity],
            got: vec![len],
        });
    }
    Ok(())
}

impl<T: DataElem> DeviceBuffer<T> for HostBuffer<T> {
    fn len(&self) -> usize {
        self.data.len()
    }

    fn upload(&mut self, src: &[T]) -> Result<()> {
        check_fits("upload", src.len(), self.data.len())?;
        self.data[..src.len()].copy_from_slice(src);
        Ok(())
    }

    fn download(&self, dst: &mut [T]) -> Result<()> {
        check_fits("download", dst.len(), self.data.len())?;
        dst.copy_from_slice(&self.data[..dst.len()]);
        Ok(())
    }

    fn copy_from(&mut self, other: &Self) -> Result<()> {
        self.upload(&other.data)
    }

    fn as_ptr(&self) -> *const T {
        self.data.as_ptr()
    }

    fn as_mut_ptr(&mut self) -> *mut T {
        self.data.as_mut_ptr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_buffer_transfers() {
        let mut buffer = HostBuffer::<u32>::zeroed(4);
        assert_eq!(buffer.len(), 4);
        assert!(!buffer.is_empty());

        buffer.upload(&[1, 2, 3]).unwrap();
        assert_eq!(buffer.as_slice(), &[1, 2, 3, 0]);

        let mut out = [0u32; 2];
        buffer.download(&mut out).unwrap();
        assert_eq!(out, [1, 2]);

        let mut other = HostBuffer::<u32>::zeroed(5);
        other.copy_from(&buffer).unwrap();
        assert_eq!(other.as_slice(), &[1, 2, 3, 0, 0]);
    }

    #[test]
    fn test_host_buffer_overflow() {
        let mut buffer = HostBuffer::<f32>::zeroed(1);
        assert!(matches!(
            buffer.upload(&[1.0, 2.0]),
            Err(DataSetError::ShapeMismatch { .. })
        ));
        let mut out = [0.0f32; 2];
        assert!(buffer.download(&mut out).is_err());
        let big = HostBuffer::<f32>::zeroed(3);
        assert!(buffer.copy_from(&big).is_err());
    }
}
