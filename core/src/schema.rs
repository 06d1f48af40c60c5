//! Dataset files.
//!
//! A dataset file is a safetensors container. Scalar header fields are string metadata
//! entries suffixed with the dataset number, bulk arrays are tensors:
//!
//! | key | content |
//! |---|---|
//! | `datasets` | number of datasets in the file |
//! | `name{n}`, `dataType{n}`, `attributes{n}`, `kind{n}` | header |
//! | `dimensions{n}`, `width{n}`, `height{n}`, `length{n}` | shape; `height`/`length` only when used |
//! | `examplesDim{n}` | example count |
//! | `sparseDataDim{n}` + tensors `sparseStart{n}`, `sparseEnd{n}`, `sparseIndex{n}`, `sparseData{n}` | sparse arrays |
//! | `dataDim{n}` + tensor `data{n}` | dense array |
//!
//! Dense Boolean data is stored compactly as one hot position per example.
//!
//! Only the coordinator touches the file. Loading broadcasts the outcome and then the
//! header; bulk arrays stay on the coordinator until the dataset is sharded.

use crate::context::ComputeContext;
use crate::dataset::{AnyDataSet, Attributes, DataSet, Geometry, dispatch};
use crate::device::{DataElem, DataType, Device};
use crate::distributed::{COORDINATOR, CollectiveBackend};
use crate::error::{DataSetError, Result};
use num_traits::{FromPrimitive, One, ToPrimitive, Zero};
use safetensors::tensor::TensorView;
use safetensors::{Dtype, SafeTensors};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use tracing::info;

const DATASETS: &str = "datasets";

fn key(field: &str, n: usize) -> String {
    format!("{field}{n}")
}

fn format_error(path: &Path, e: impl std::fmt::Debug) -> DataSetError {
    DataSetError::Format(format!("{}: {e:?}", path.display()))
}

/// Parsed view of a dataset file held in memory.
struct Reader<'a> {
    path: &'a Path,
    metadata: HashMap<String, String>,
    tensors: SafeTensors<'a>,
}

impl<'a> Reader<'a> {
    fn open(path: &'a Path, bytes: &'a [u8]) -> Result<Self> {
        let (_, header) = SafeTensors::read_metadata(bytes).map_err(|e| format_error(path, e))?;
        let metadata = header.metadata().clone().unwrap_or_default();
        let tensors = SafeTensors::deserialize(bytes).map_err(|e| format_error(path, e))?;
        Ok(Self {
            path,
            metadata,
            tensors,
        })
    }

    fn field(&self, key: &str) -> Result<&str> {
        self.metadata
            .get(key)
            .map(String::as_str)
            .ok_or_else(|| DataSetError::MissingField(key.to_string()))
    }

    fn parse<V: FromStr>(&self, key: &str) -> Result<V> {
        let raw = self.field(key)?;
        raw.trim()
            .parse()
            .map_err(|_| DataSetError::invalid(key, format!("cannot parse {raw:?}")))
    }

    fn count(&self) -> Result<usize> {
        self.parse(DATASETS)
    }

    fn tensor(&self, key: &str, len: usize, dtypes: &[Dtype]) -> Result<TensorView<'a>> {
        let view = self
            .tensors
            .tensor(key)
            .map_err(|_| DataSetError::MissingField(key.to_string()))?;
        if !dtypes.contains(&view.dtype()) {
            return Err(DataSetError::Format(format!(
                "{}: {key} has dtype {:?}, expected one of {dtypes:?}",
                self.path.display(),
                view.dtype()
            )));
        }
        if view.shape() != [len] {
            return Err(DataSetError::ShapeMismatch {
                what: key.to_string(),
                expected: vec![len],
                got: view.shape().to_vec(),
            });
        }
        Ok(view)
    }

    fn array<T: DataElem>(&self, key: &str, len: usize) -> Result<Vec<T>> {
        let view = self.tensor(key, len, &[T::DATA_TYPE.dtype()])?;
        T::decode_slice(view.data())
    }

    /// Sparse offsets, stored as either `u32` or `u64`.
    fn offsets(&self, key: &str, len: usize) -> Result<Vec<u64>> {
        let view = self.tensor(key, len, &[Dtype::U64, Dtype::U32])?;
        if view.dtype() == Dtype::U32 {
            Ok(u32::decode_slice(view.data())?
                .into_iter()
                .map(u64::from)
                .collect())
        } else {
            u64::decode_slice(view.data())
        }
    }

    fn check_index(&self, n: usize) -> Result<()> {
        let count = self.count()?;
        if n >= count {
            return Err(DataSetError::IndexOutOfRange {
                what: "dataset",
                index: n,
                bound: count,
            });
        }
        Ok(())
    }

    fn dataset<T: DataElem, D: Device>(&self, n: usize) -> Result<DataSet<T, D>> {
        let name: String = self.field(&key("name", n))?.to_string();
        let tag: u32 = self.parse(&key("dataType", n))?;
        let data_type = DataType::from_tag(tag)?;
        if data_type != T::DATA_TYPE {
            return Err(DataSetError::TypeMismatch {
                expected: T::DATA_TYPE,
                found: data_type,
            });
        }
        let attributes = Attributes::from_bits(self.parse(&key("attributes", n))?).persistent();
        let kind: u32 = self.parse(&key("kind", n))?;
        if kind != 0 {
            return Err(DataSetError::invalid(key("kind", n), format!("unknown kind {kind}")));
        }

        let dimensions: u32 = self.parse(&key("dimensions", n))?;
        let geometry = Geometry {
            dimensions,
            width: self.parse(&key("width", n))?,
            height: if dimensions > 1 {
                self.parse(&key("height", n))?
            } else {
                1
            },
            length: if dimensions > 2 {
                self.parse(&key("length", n))?
            } else {
                1
            },
        };
        geometry.validate()?;
        let examples: usize = self.parse(&key("examplesDim", n))?;
        if examples == 0 {
            return Err(DataSetError::invalid(key("examplesDim", n), "no examples"));
        }

        let mut ds = if attributes.contains(Attributes::SPARSE) {
            let entries: usize = self.parse(&key("sparseDataDim", n))?;
            if entries == 0 {
                return Err(DataSetError::invalid(key("sparseDataDim", n), "no sparse entries"));
            }
            let start = self.offsets(&key("sparseStart", n), examples)?;
            let end = self.offsets(&key("sparseEnd", n), examples)?;
            let index = self.array::<u32>(&key("sparseIndex", n), entries)?;
            let data = if attributes.contains(Attributes::BOOLEAN) {
                None
            } else {
                Some(self.array::<T>(&key("sparseData", n), entries)?)
            };
            DataSet::sparse_with(name, geometry, start, end, index, data)?
        } else {
            let stride = geometry.stride();
            let boolean = attributes.contains(Attributes::BOOLEAN);
            let expected = if boolean { examples } else { examples * stride };
            let len: usize = self.parse(&key("dataDim", n))?;
            if len != expected {
                return Err(DataSetError::ShapeMismatch {
                    what: key("dataDim", n),
                    expected: vec![expected],
                    got: vec![len],
                });
            }
            let raw = self.array::<T>(&key("data", n), len)?;
            let data = if boolean {
                expand_one_hot(&raw, stride)?
            } else {
                raw
            };
            DataSet::dense(name, geometry, data)?
        };
        ds.attributes = attributes;
        Ok(ds)
    }

    fn any_dataset<D: Device>(&self, n: usize) -> Result<AnyDataSet<D>> {
        let tag: u32 = self.parse(&key("dataType", n))?;
        Ok(match DataType::from_tag(tag)? {
            DataType::UChar => AnyDataSet::U8(self.dataset(n)?),
            DataType::Char => AnyDataSet::I8(self.dataset(n)?),
            DataType::UInt => AnyDataSet::U32(self.dataset(n)?),
            DataType::Int => AnyDataSet::I32(self.dataset(n)?),
            DataType::ULLInt => AnyDataSet::U64(self.dataset(n)?),
            DataType::LLInt => AnyDataSet::I64(self.dataset(n)?),
            DataType::Float => AnyDataSet::F32(self.dataset(n)?),
            DataType::Double => AnyDataSet::F64(self.dataset(n)?),
        })
    }
}

/// Expands one hot position per example into full rows.
fn expand_one_hot<T: DataElem>(positions: &[T], stride: usize) -> Result<Vec<T>> {
    let mut data = vec![T::zero(); positions.len() * stride];
    for (n, &p) in positions.iter().enumerate() {
        let x = p
            .to_usize()
            .filter(|&x| x < stride)
            .ok_or_else(|| DataSetError::IndexOutOfRange {
                what: "one-hot position",
                index: p.to_usize().unwrap_or(usize::MAX),
                bound: stride,
            })?;
        data[n * stride + x] = T::one();
    }
    Ok(data)
}

/// Inverse of [`expand_one_hot`]; every row must hold exactly one 1.
fn compact_one_hot<T: DataElem>(data: &[T], stride: usize) -> Result<Vec<T>> {
    data.chunks_exact(stride)
        .enumerate()
        .map(|(n, row)| {
            let mut hot = row.iter().enumerate().filter(|(_, v)| !v.is_zero());
            match (hot.next(), hot.next()) {
                (Some((x, v)), None) if v.is_one() => T::from_usize(x).ok_or_else(|| {
                    DataSetError::invalid(
                        "data",
                        format!("position {x} does not fit the element type"),
                    )
                }),
                _ => Err(DataSetError::invalid(
                    "data",
                    format!("Boolean example {n} is not one-hot"),
                )),
            }
        })
        .collect()
}

/// Header fields and tensors of the datasets being written.
#[derive(Default)]
struct Encoded {
    metadata: HashMap<String, String>,
    tensors: Vec<(String, Dtype, Vec<usize>, Vec<u8>)>,
}

impl Encoded {
    fn meta(&mut self, field: &str, n: usize, value: impl ToString) {
        self.metadata.insert(key(field, n), value.to_string());
    }

    fn tensor<T: DataElem>(&mut self, field: &str, n: usize, values: &[T]) {
        self.tensors.push((
            key(field, n),
            T::DATA_TYPE.dtype(),
            vec![values.len()],
            T::encode_slice(values),
        ));
    }

    fn push<T: DataElem, D: Device>(&mut self, n: usize, ds: &DataSet<T, D>) -> Result<()> {
        let geometry = ds.geometry();
        self.meta("name", n, ds.name());
        self.meta("dataType", n, T::DATA_TYPE.tag());
        self.meta("attributes", n, ds.attributes().persistent().bits());
        self.meta("kind", n, 0);
        self.meta("dimensions", n, geometry.dimensions);
        self.meta("width", n, geometry.width);
        if geometry.dimensions > 1 {
            self.meta("height", n, geometry.height);
        }
        if geometry.dimensions > 2 {
            self.meta("length", n, geometry.length);
        }
        self.meta("examplesDim", n, ds.examples());
        if ds.is_sparse() {
            self.meta("sparseDataDim", n, ds.sparse_index().len());
            self.tensor("sparseStart", n, ds.sparse_start());
            self.tensor("sparseEnd", n, ds.sparse_end());
            self.tensor("sparseIndex", n, ds.sparse_index());
            if !ds.is_boolean() {
                self.tensor("sparseData", n, ds.sparse_values());
            }
        } else {
            let data = if ds.is_boolean() {
                compact_one_hot(ds.dense_data(), geometry.stride())?
            } else {
                ds.dense_data().to_vec()
            };
            self.meta("dataDim", n, data.len());
            self.tensor("data", n, &data);
        }
        Ok(())
    }

    fn write(mut self, path: &Path, count: usize) -> Result<()> {
        self.metadata.insert(DATASETS.to_string(), count.to_string());
        let views = self
            .tensors
            .iter()
            .map(|(name, dtype, shape, bytes)| {
                TensorView::new(*dtype, shape.clone(), bytes)
                    .map(|view| (name.clone(), view))
                    .map_err(|e| format_error(path, e))
            })
            .collect::<Result<Vec<_>>>()?;
        safetensors::serialize_to_file(views, Some(self.metadata), path)
            .map_err(|e| format_error(path, e))
    }
}

fn read_file(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).map_err(|e| DataSetError::io(path, e))
}

impl<T: DataElem, D: Device> DataSet<T, D> {
    /// Loads dataset `n` of a file. Collective: the coordinator reads the file, every
    /// worker returns the dataset (workers without rows until it is sharded).
    pub fn load<B: CollectiveBackend, P: AsRef<Path>>(
        path: P,
        n: usize,
        ctx: &ComputeContext<B, D>,
    ) -> Result<Self> {
        let path = path.as_ref();
        let outcome = ctx.is_coordinator().then(|| {
            let bytes = read_file(path)?;
            let reader = Reader::open(path, &bytes)?;
            reader.check_index(n)?;
            reader.dataset::<T, D>(n)
        });
        Self::from_coordinator(outcome, ctx)
    }

    /// Writes this dataset as the only dataset of a file. Collective.
    ///
    /// The dataset is unsharded for the write and sharded back afterwards.
    pub fn save<B: CollectiveBackend, P: AsRef<Path>>(
        &mut self,
        path: P,
        ctx: &ComputeContext<B, D>,
    ) -> Result<()> {
        let path = path.as_ref();
        let previous = self.sharding();
        self.unshard(ctx)?;
        let outcome = ctx.is_coordinator().then(|| {
            let mut encoded = Encoded::default();
            encoded.push(0, self)?;
            encoded.write(path, 1)
        });
        ctx.broadcast_status("save dataset", outcome)?;
        if ctx.is_coordinator() {
            info!(name = %self.name(), path = %path.display(), "saved dataset");
        }
        self.shard(previous, ctx)
    }
}

/// Loads every dataset of a file. Collective.
pub fn load_datasets<B, D, P>(path: P, ctx: &ComputeContext<B, D>) -> Result<Vec<AnyDataSet<D>>>
where
    B: CollectiveBackend,
    D: Device,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let outcome = ctx.is_coordinator().then(|| {
        let bytes = read_file(path)?;
        let reader = Reader::open(path, &bytes)?;
        (0..reader.count()?)
            .map(|n| reader.any_dataset::<D>(n))
            .collect::<Result<Vec<_>>>()
    });
    let local = ctx.broadcast_status("load datasets", outcome)?;
    let count = ctx
        .backend()
        .broadcast_u64(COORDINATOR, local.as_ref().map_or(0, |v| v.len() as u64))?;

    let mut local = local.map(Vec::into_iter);
    let mut sets = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let mut any = match local.as_mut().and_then(Iterator::next) {
            Some(any) => {
                dispatch!(any, ds => AnyDataSet::from(DataSet::receive_header(Some(ds), ctx)?))
            }
            None => {
                let bytes = ctx.backend().broadcast_bytes(COORDINATOR, Vec::new())?;
                AnyDataSet::from_header(&serde_json::from_slice(&bytes)?)?
            }
        };
        if any.is_sparse() {
            dispatch!(&mut any, ds => ds.calculate_sparse_datapoint_counts(ctx))?;
        }
        sets.push(any);
    }
    Ok(sets)
}

/// Writes several datasets into one file, in order. Collective.
pub fn save_datasets<B, D, P>(
    path: P,
    sets: &mut [AnyDataSet<D>],
    ctx: &ComputeContext<B, D>,
) -> Result<()>
where
    B: CollectiveBackend,
    D: Device,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let previous: Vec<_> = sets.iter().map(AnyDataSet::sharding).collect();
    for any in sets.iter_mut() {
        any.unshard(ctx)?;
    }
    let outcome = ctx.is_coordinator().then(|| {
        let mut encoded = Encoded::default();
        for (n, any) in sets.iter().enumerate() {
            dispatch!(any, ds => encoded.push(n, ds))?;
        }
        encoded.write(path, sets.len())
    });
    ctx.broadcast_status("save datasets", outcome)?;
    if ctx.is_coordinator() {
        info!(count = sets.len(), path = %path.display(), "saved datasets");
    }
    for (any, sharding) in sets.iter_mut().zip(previous) {
        any.shard(sharding, ctx)?;
    }
    Ok(())
}
