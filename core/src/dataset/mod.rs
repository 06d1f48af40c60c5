//! Dense and sparse training datasets.
//!
//! A [`DataSet`] holds one set of training examples either as a dense array
//! (`stride = width * height * length` values per example) or in a CSR-style sparse
//! layout: per-example `start`/`end` offsets into a shared array of feature ids and,
//! unless the dataset is Boolean, a parallel array of values.
//!
//! Host arrays are authoritative. Each one has an owned device mirror which is
//! (re)allocated whenever the layout changes and otherwise refreshed only by
//! [`DataSet::upload`].
//!
//! Datasets built in memory or read from a file are canonical: examples are packed
//! back to back and the entries of each example are ordered by feature id.

mod any;
mod attributes;
mod compute;
mod denoise;
mod shard;
mod sparse;
mod transpose;

pub use any::AnyDataSet;
pub(crate) use any::dispatch;
pub use attributes::Attributes;
pub use shard::{Sharding, data_examples, model_slice};
pub use transpose::{SparseTransposed, WARP, bucket_offsets};

use crate::context::ComputeContext;
use crate::device::{Cpu, DataElem, DataType, Device, DeviceBuffer, upload_new};
use crate::distributed::{COORDINATOR, CollectiveBackend};
use crate::error::{DataSetError, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Shape of one example.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub dimensions: u32,
    pub width: usize,
    pub height: usize,
    pub length: usize,
}

impl Geometry {
    pub fn d1(width: usize) -> Self {
        Self {
            dimensions: 1,
            width,
            height: 1,
            length: 1,
        }
    }

    pub fn d2(width: usize, height: usize) -> Self {
        Self {
            dimensions: 2,
            width,
            height,
            length: 1,
        }
    }

    pub fn d3(width: usize, height: usize, length: usize) -> Self {
        Self {
            dimensions: 3,
            width,
            height,
            length,
        }
    }

    pub fn stride(&self) -> usize {
        self.width * self.height * self.length
    }

    pub fn validate(&self) -> Result<()> {
        if !(1..=3).contains(&self.dimensions) {
            return Err(DataSetError::invalid(
                "dimensions",
                format!("{} is outside [1, 3]", self.dimensions),
            ));
        }
        if self.width == 0 || self.height == 0 || self.length == 0 {
            return Err(DataSetError::invalid(
                "extent",
                format!(
                    "({}, {}, {}) has a zero extent",
                    self.width, self.height, self.length
                ),
            ));
        }
        if self.dimensions < 2 && self.height != 1 || self.dimensions < 3 && self.length != 1 {
            return Err(DataSetError::invalid(
                "extent",
                format!(
                    "{}-dimensional data cannot have extent ({}, {}, {})",
                    self.dimensions, self.width, self.height, self.length
                ),
            ));
        }
        Ok(())
    }
}

/// Scalar fields every worker learns about a dataset, whether or not it holds rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct Header {
    pub name: String,
    pub data_type: u32,
    pub attributes: u32,
    pub examples: usize,
    pub dimensions: u32,
    pub width: usize,
    pub height: usize,
    pub length: usize,
    pub sparse_data_size: u64,
}

/// Device mirrors of the host arrays.
#[derive(Debug)]
pub(crate) struct DeviceArrays<T: DataElem, D: Device> {
    pub data: Option<D::Buffer<T>>,
    pub start: Option<D::Buffer<u64>>,
    pub end: Option<D::Buffer<u64>>,
    pub index: Option<D::Buffer<u32>>,
    pub values: Option<D::Buffer<T>>,
}

impl<T: DataElem, D: Device> Default for DeviceArrays<T, D> {
    fn default() -> Self {
        Self {
            data: None,
            start: None,
            end: None,
            index: None,
            values: None,
        }
    }
}

impl<T: DataElem, D: Device> DeviceArrays<T, D> {
    pub fn bytes(&self) -> u64 {
        let len = |n: usize, size: usize| (n * size) as u64;
        self.data.as_ref().map_or(0, |b| len(b.len(), T::DATA_TYPE.size()))
            + self.start.as_ref().map_or(0, |b| len(b.len(), 8))
            + self.end.as_ref().map_or(0, |b| len(b.len(), 8))
            + self.index.as_ref().map_or(0, |b| len(b.len(), 4))
            + self.values.as_ref().map_or(0, |b| len(b.len(), T::DATA_TYPE.size()))
    }
}

/// One dataset, generic over its element type and the device its mirrors live on.
#[derive(Debug)]
pub struct DataSet<T: DataElem, D: Device = Cpu> {
    pub(crate) name: String,
    pub(crate) attributes: Attributes,
    pub(crate) sharding: Sharding,
    pub(crate) geometry: Geometry,
    pub(crate) examples: usize,
    pub(crate) local_examples: usize,
    pub(crate) min_x: usize,
    pub(crate) max_x: usize,
    pub(crate) sparse_data_size: u64,

    pub(crate) data: Vec<T>,
    pub(crate) sparse_start: Vec<u64>,
    pub(crate) sparse_end: Vec<u64>,
    pub(crate) sparse_index: Vec<u32>,
    pub(crate) sparse_data: Vec<T>,

    pub(crate) buffers: DeviceArrays<T, D>,
    pub(crate) denoising_random: Option<D::Buffer<f32>>,

    pub(crate) dirty: bool,
    pub(crate) sparse_datapoint_count: Vec<u64>,
    pub(crate) max_sparse_datapoints: u64,
    pub(crate) sparse_density: f64,
    pub(crate) transposed: SparseTransposed<D>,
}

impl<T: DataElem, D: Device> DataSet<T, D> {
    fn empty(name: String, attributes: Attributes, geometry: Geometry, examples: usize) -> Self {
        Self {
            name,
            attributes,
            sharding: Sharding::None,
            geometry,
            examples,
            local_examples: 0,
            min_x: 0,
            max_x: geometry.width,
            sparse_data_size: 0,
            data: Vec::new(),
            sparse_start: Vec::new(),
            sparse_end: Vec::new(),
            sparse_index: Vec::new(),
            sparse_data: Vec::new(),
            buffers: DeviceArrays::default(),
            denoising_random: None,
            dirty: false,
            sparse_datapoint_count: Vec::new(),
            max_sparse_datapoints: 0,
            sparse_density: 0.0,
            transposed: SparseTransposed::default(),
        }
    }

    /// A dense dataset holding `data.len() / stride` examples.
    ///
    /// # Errors
    ///
    /// Fails if the geometry is invalid or `data` is empty or not a whole number of rows.
    pub fn dense(name: impl Into<String>, geometry: Geometry, data: Vec<T>) -> Result<Self> {
        geometry.validate()?;
        let stride = geometry.stride();
        if data.is_empty() || data.len() % stride != 0 {
            return Err(DataSetError::ShapeMismatch {
                what: "dense data".into(),
                expected: vec![data.len() / stride.max(1), stride],
                got: vec![data.len()],
            });
        }
        let examples = data.len() / stride;
        let mut ds = Self::empty(name.into(), Attributes::NONE, geometry, examples);
        ds.local_examples = examples;
        ds.data = data;
        Ok(ds)
    }

    /// A sparse dataset with one value per entry.
    pub fn sparse(
        name: impl Into<String>,
        geometry: Geometry,
        start: Vec<u64>,
        end: Vec<u64>,
        index: Vec<u32>,
        data: Vec<T>,
    ) -> Result<Self> {
        Self::sparse_with(name.into(), geometry, start, end, index, Some(data))
    }

    /// A sparse Boolean dataset: every listed feature has value 1.
    pub fn sparse_boolean(
        name: impl Into<String>,
        geometry: Geometry,
        start: Vec<u64>,
        end: Vec<u64>,
        index: Vec<u32>,
    ) -> Result<Self> {
        Self::sparse_with(name.into(), geometry, start, end, index, None)
    }

    pub(crate) fn sparse_with(
        name: String,
        geometry: Geometry,
        start: Vec<u64>,
        end: Vec<u64>,
        index: Vec<u32>,
        data: Option<Vec<T>>,
    ) -> Result<Self> {
        geometry.validate()?;
        let examples = start.len();
        if examples == 0 {
            return Err(DataSetError::invalid("examples", "a dataset needs at least one example"));
        }
        if index.is_empty() {
            return Err(DataSetError::invalid("sparseDataDim", "a sparse dataset needs entries"));
        }
        let mut attributes = Attributes::SPARSE;
        if data.is_none() {
            attributes.insert(Attributes::BOOLEAN);
        }
        let (start, end, index, values) = sparse::canonicalize(start, end, index, data)?;
        let mut ds = Self::empty(name, attributes, geometry, examples);
        ds.local_examples = examples;
        ds.sparse_data_size = index.len() as u64;
        ds.sparse_start = start;
        ds.sparse_end = end;
        ds.sparse_index = index;
        ds.sparse_data = values.unwrap_or_default();
        ds.dirty = true;
        Ok(ds)
    }

    /// Adds file-level flags that do not change the layout.
    ///
    /// # Errors
    ///
    /// `SPARSE` cannot be added, and `BOOLEAN` only to dense datasets.
    pub fn with_attributes(mut self, attributes: Attributes) -> Result<Self> {
        if attributes.contains(Attributes::SPARSE)
            || attributes.contains(Attributes::DENOISING)
            || attributes.contains(Attributes::BOOLEAN) && self.is_sparse()
        {
            return Err(DataSetError::invalid(
                "attributes",
                format!("{attributes} cannot be added to an existing dataset"),
            ));
        }
        self.attributes |= attributes;
        Ok(self)
    }

    pub(crate) fn header(&self) -> Header {
        Header {
            name: self.name.clone(),
            data_type: T::DATA_TYPE.tag(),
            attributes: self.attributes.persistent().bits(),
            examples: self.examples,
            dimensions: self.geometry.dimensions,
            width: self.geometry.width,
            height: self.geometry.height,
            length: self.geometry.length,
            sparse_data_size: self.sparse_data_size,
        }
    }

    /// An unsharded dataset that holds no rows, as seen by a non-coordinator worker.
    pub(crate) fn from_header(header: &Header) -> Result<Self> {
        let data_type = DataType::from_tag(header.data_type)?;
        if data_type != T::DATA_TYPE {
            return Err(DataSetError::TypeMismatch {
                expected: T::DATA_TYPE,
                found: data_type,
            });
        }
        let geometry = Geometry {
            dimensions: header.dimensions,
            width: header.width,
            height: header.height,
            length: header.length,
        };
        geometry.validate()?;
        let mut ds = Self::empty(
            header.name.clone(),
            Attributes::from_bits(header.attributes).persistent(),
            geometry,
            header.examples,
        );
        ds.sparse_data_size = header.sparse_data_size;
        Ok(ds)
    }

    /// Makes a dataset built on the coordinator known to every worker.
    ///
    /// The coordinator passes `Some(outcome)` and every other worker `None`. A failed
    /// outcome aborts every worker; otherwise the header is broadcast, workers receive an
    /// empty unsharded copy and sparse statistics are computed collectively.
    pub fn from_coordinator<B: CollectiveBackend>(
        outcome: Option<Result<Self>>,
        ctx: &ComputeContext<B, D>,
    ) -> Result<Self> {
        let local = ctx.broadcast_status("dataset construction", outcome)?;
        let mut ds = Self::receive_header(local, ctx)?;
        if ds.is_sparse() {
            ds.calculate_sparse_datapoint_counts(ctx)?;
        }
        Ok(ds)
    }

    /// Broadcasts the coordinator's header; other workers build an empty copy from it.
    pub(crate) fn receive_header<B: CollectiveBackend>(
        local: Option<Self>,
        ctx: &ComputeContext<B, D>,
    ) -> Result<Self> {
        let bytes = match &local {
            Some(ds) => serde_json::to_vec(&ds.header())?,
            None => Vec::new(),
        };
        let bytes = ctx.backend().broadcast_bytes(COORDINATOR, bytes)?;
        match local {
            Some(ds) => {
                info!(
                    name = %ds.name,
                    attributes = %ds.attributes,
                    dimensions = ds.geometry.dimensions,
                    width = ds.geometry.width,
                    height = ds.geometry.height,
                    length = ds.geometry.length,
                    examples = ds.examples,
                    datapoints = ds.sparse_data_size,
                    "loaded dataset"
                );
                Ok(ds)
            }
            None => Self::from_header(&serde_json::from_slice(&bytes)?),
        }
    }

    pub fn rename(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn attributes(&self) -> Attributes {
        self.attributes
    }

    pub fn data_type(&self) -> DataType {
        T::DATA_TYPE
    }

    pub fn sharding(&self) -> Sharding {
        self.sharding
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    pub fn dimensions(&self) -> u32 {
        self.geometry.dimensions
    }

    pub fn width(&self) -> usize {
        self.geometry.width
    }

    pub fn height(&self) -> usize {
        self.geometry.height
    }

    pub fn length(&self) -> usize {
        self.geometry.length
    }

    /// `width * height * length` of the full (unsharded) example.
    pub fn stride(&self) -> usize {
        self.geometry.stride()
    }

    /// Global example count.
    pub fn examples(&self) -> usize {
        self.examples
    }

    /// Examples resident on this worker.
    pub fn local_examples(&self) -> usize {
        self.local_examples
    }

    /// The `[min_x, max_x)` slice of the width owned by this worker.
    pub fn local_x_range(&self) -> (usize, usize) {
        (self.min_x, self.max_x)
    }

    pub fn local_width(&self) -> usize {
        self.max_x - self.min_x
    }

    /// Values per example resident on this worker.
    pub fn local_stride(&self) -> usize {
        self.local_width() * self.geometry.height * self.geometry.length
    }

    pub fn is_sparse(&self) -> bool {
        self.attributes.contains(Attributes::SPARSE)
    }

    pub fn is_boolean(&self) -> bool {
        self.attributes.contains(Attributes::BOOLEAN)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Global nonzero count of a sparse dataset.
    pub fn sparse_data_size(&self) -> u64 {
        self.sparse_data_size
    }

    pub fn max_sparse_datapoints(&self) -> u64 {
        self.max_sparse_datapoints
    }

    pub fn sparse_density(&self) -> f64 {
        self.sparse_density
    }

    /// Per-feature nonzero counts over this worker's rows.
    pub fn sparse_datapoint_counts(&self) -> &[u64] {
        &self.sparse_datapoint_count
    }

    /// Host arrays, for inspection.
    pub fn dense_data(&self) -> &[T] {
        &self.data
    }

    pub fn sparse_start(&self) -> &[u64] {
        &self.sparse_start
    }

    pub fn sparse_end(&self) -> &[u64] {
        &self.sparse_end
    }

    pub fn sparse_index(&self) -> &[u32] {
        &self.sparse_index
    }

    pub fn sparse_values(&self) -> &[T] {
        &self.sparse_data
    }

    fn require_dense(&self, op: &'static str) -> Result<()> {
        if self.is_sparse() {
            return Err(DataSetError::WrongKind {
                op,
                expected: "dense",
            });
        }
        Ok(())
    }

    fn require_sparse(&self, op: &'static str) -> Result<()> {
        if !self.is_sparse() {
            return Err(DataSetError::WrongKind {
                op,
                expected: "sparse",
            });
        }
        Ok(())
    }

    fn check_example(&self, n: usize) -> Result<()> {
        if n >= self.local_examples {
            return Err(DataSetError::IndexOutOfRange {
                what: "example",
                index: n,
                bound: self.local_examples,
            });
        }
        Ok(())
    }

    fn dense_offset(&self, n: usize, x: usize, y: usize, z: usize) -> Result<usize> {
        self.check_example(n)?;
        let width = self.local_width();
        for (what, v, bound) in [
            ("x", x, width),
            ("y", y, self.geometry.height),
            ("z", z, self.geometry.length),
        ] {
            if v >= bound {
                return Err(DataSetError::IndexOutOfRange {
                    what,
                    index: v,
                    bound,
                });
            }
        }
        Ok(n * self.local_stride() + x + width * (y + z * self.geometry.height))
    }

    /// Position of local entry `i` of example `n` in the shared sparse arrays.
    fn sparse_offset(&self, n: usize, i: usize) -> Result<usize> {
        self.check_example(n)?;
        let count = (self.sparse_end[n] - self.sparse_start[n]) as usize;
        if i >= count {
            return Err(DataSetError::IndexOutOfRange {
                what: "sparse entry",
                index: i,
                bound: count,
            });
        }
        Ok(self.sparse_start[n] as usize + i)
    }

    pub fn get_data_point(&self, n: usize, x: usize, y: usize, z: usize) -> Result<T> {
        self.require_dense("get_data_point")?;
        Ok(self.data[self.dense_offset(n, x, y, z)?])
    }

    pub fn set_data_point(&mut self, v: T, n: usize, x: usize, y: usize, z: usize) -> Result<()> {
        self.require_dense("set_data_point")?;
        let offset = self.dense_offset(n, x, y, z)?;
        self.data[offset] = v;
        Ok(())
    }

    /// Number of entries of example `n`.
    pub fn get_sparse_data_points(&self, n: usize) -> Result<u64> {
        self.require_sparse("get_sparse_data_points")?;
        self.check_example(n)?;
        Ok(self.sparse_end[n] - self.sparse_start[n])
    }

    pub fn get_sparse_index(&self, n: usize, i: usize) -> Result<u32> {
        self.require_sparse("get_sparse_index")?;
        Ok(self.sparse_index[self.sparse_offset(n, i)?])
    }

    /// Replaces the feature id of entry `i` of example `n`.
    ///
    /// The id must fit the local width. The entries of example `n` are re-sorted by
    /// feature id afterwards, so entry positions within that example may change. Marks
    /// the dataset dirty.
    pub fn set_sparse_index(&mut self, n: usize, i: usize, v: u32) -> Result<()> {
        self.require_sparse("set_sparse_index")?;
        let offset = self.sparse_offset(n, i)?;
        if v as usize >= self.local_width() {
            return Err(DataSetError::IndexOutOfRange {
                what: "feature",
                index: v as usize,
                bound: self.local_width(),
            });
        }
        self.sparse_index[offset] = v;
        self.sort_example(n);
        self.dirty = true;
        Ok(())
    }

    pub fn get_sparse_data_point(&self, n: usize, i: usize) -> Result<T> {
        self.require_sparse("get_sparse_data_point")?;
        if self.is_boolean() {
            return Err(DataSetError::WrongKind {
                op: "get_sparse_data_point",
                expected: "non-Boolean sparse",
            });
        }
        Ok(self.sparse_data[self.sparse_offset(n, i)?])
    }

    /// Replaces the value of entry `i` of example `n`. Marks the dataset dirty.
    pub fn set_sparse_data_point(&mut self, n: usize, i: usize, v: T) -> Result<()> {
        self.require_sparse("set_sparse_data_point")?;
        if self.is_boolean() {
            return Err(DataSetError::WrongKind {
                op: "set_sparse_data_point",
                expected: "non-Boolean sparse",
            });
        }
        let offset = self.sparse_offset(n, i)?;
        self.sparse_data[offset] = v;
        self.dirty = true;
        Ok(())
    }

    /// Copies every host array into its device mirror, allocating mirrors whose size no
    /// longer matches.
    pub fn upload<B: CollectiveBackend>(&mut self, ctx: &ComputeContext<B, D>) -> Result<()> {
        let device = ctx.device();
        let arrays = &mut self.buffers;
        if self.attributes.contains(Attributes::SPARSE) {
            refresh(device, &mut arrays.start, &self.sparse_start)?;
            refresh(device, &mut arrays.end, &self.sparse_end)?;
            refresh(device, &mut arrays.index, &self.sparse_index)?;
            if self.attributes.contains(Attributes::BOOLEAN) {
                arrays.values = None;
            } else {
                refresh(device, &mut arrays.values, &self.sparse_data)?;
            }
        } else {
            refresh(device, &mut arrays.data, &self.data)?;
        }
        Ok(())
    }

    /// Host bytes held by this worker's arrays.
    pub fn host_bytes(&self) -> u64 {
        if self.is_sparse() {
            let mut bytes = (self.sparse_start.len() + self.sparse_end.len()) as u64 * 8
                + self.sparse_index.len() as u64 * 4;
            if !self.is_boolean() {
                bytes += (self.sparse_data.len() * T::DATA_TYPE.size()) as u64;
            }
            bytes
        } else {
            (self.data.len() * T::DATA_TYPE.size()) as u64
        }
    }

    /// Device bytes held by this worker's mirrors, transposed view and denoising mask.
    pub fn device_bytes(&self) -> u64 {
        self.buffers.bytes()
            + self.transposed.bytes()
            + self
                .denoising_random
                .as_ref()
                .map_or(0, |b| b.len() as u64 * 4)
    }

    /// `(host bytes, device bytes)` of every worker, in rank order.
    pub fn memory_usage<B: CollectiveBackend>(
        &self,
        ctx: &ComputeContext<B, D>,
    ) -> Result<Vec<(u64, u64)>> {
        let host = ctx.backend().all_gather_u64(self.host_bytes())?;
        let device = ctx.backend().all_gather_u64(self.device_bytes())?;
        Ok(host.into_iter().zip(device).collect())
    }
}

fn refresh<T: DataElem, D: Device>(
    device: &D,
    slot: &mut Option<D::Buffer<T>>,
    host: &[T],
) -> Result<()> {
    match slot {
        Some(buffer) if buffer.len() == host.len() => buffer.upload(host),
        _ => {
            *slot = Some(upload_new(device, host)?);
            Ok(())
        }
    }
}
