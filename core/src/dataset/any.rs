use super::{Attributes, DataSet, Header, Sharding};
use crate::context::ComputeContext;
use crate::device::{Cpu, DataElem, DataType, Device};
use crate::distributed::CollectiveBackend;
use crate::error::{DataSetError, Result};

/// A dataset of any supported element type.
///
/// A file may hold datasets of different element types; loading all of them yields one
/// `AnyDataSet` per dataset.
#[derive(Debug)]
pub enum AnyDataSet<D: Device = Cpu> {
    U8(DataSet<u8, D>),
    I8(DataSet<i8, D>),
    U32(DataSet<u32, D>),
    I32(DataSet<i32, D>),
    U64(DataSet<u64, D>),
    I64(DataSet<i64, D>),
    F32(DataSet<f32, D>),
    F64(DataSet<f64, D>),
}

macro_rules! dispatch {
    ($self:expr, $ds:ident => $body:expr) => {
        match $self {
            AnyDataSet::U8($ds) => $body,
            AnyDataSet::I8($ds) => $body,
            AnyDataSet::U32($ds) => $body,
            AnyDataSet::I32($ds) => $body,
            AnyDataSet::U64($ds) => $body,
            AnyDataSet::I64($ds) => $body,
            AnyDataSet::F32($ds) => $body,
            AnyDataSet::F64($ds) => $body,
        }
    };
}

pub(crate) use dispatch;

macro_rules! impl_conversions {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl<D: Device> From<DataSet<$ty, D>> for AnyDataSet<D> {
                fn from(ds: DataSet<$ty, D>) -> Self {
                    AnyDataSet::$variant(ds)
                }
            }

            impl<D: Device> TryFrom<AnyDataSet<D>> for DataSet<$ty, D> {
                type Error = DataSetError;

                fn try_from(any: AnyDataSet<D>) -> Result<Self> {
                    match any {
                        AnyDataSet::$variant(ds) => Ok(ds),
                        other => Err(DataSetError::TypeMismatch {
                            expected: <$ty as DataElem>::DATA_TYPE,
                            found: other.data_type(),
                        }),
                    }
                }
            }
        )*
    };
}

impl_conversions! {
    u8 => U8,
    i8 => I8,
    u32 => U32,
    i32 => I32,
    u64 => U64,
    i64 => I64,
    f32 => F32,
    f64 => F64,
}

impl<D: Device> AnyDataSet<D> {
    /// An empty unsharded dataset of the header's element type.
    pub(crate) fn from_header(header: &Header) -> Result<Self> {
        Ok(match DataType::from_tag(header.data_type)? {
            DataType::UChar => AnyDataSet::U8(DataSet::from_header(header)?),
            DataType::Char => AnyDataSet::I8(DataSet::from_header(header)?),
            DataType::UInt => AnyDataSet::U32(DataSet::from_header(header)?),
            DataType::Int => AnyDataSet::I32(DataSet::from_header(header)?),
            DataType::ULLInt => AnyDataSet::U64(DataSet::from_header(header)?),
            DataType::LLInt => AnyDataSet::I64(DataSet::from_header(header)?),
            DataType::Float => AnyDataSet::F32(DataSet::from_header(header)?),
            DataType::Double => AnyDataSet::F64(DataSet::from_header(header)?),
        })
    }

    pub fn name(&self) -> &str {
        dispatch!(self, ds => ds.name())
    }

    pub fn data_type(&self) -> DataType {
        dispatch!(self, ds => ds.data_type())
    }

    pub fn attributes(&self) -> Attributes {
        dispatch!(self, ds => ds.attributes())
    }

    pub fn examples(&self) -> usize {
        dispatch!(self, ds => ds.examples())
    }

    pub fn local_examples(&self) -> usize {
        dispatch!(self, ds => ds.local_examples())
    }

    pub fn sharding(&self) -> Sharding {
        dispatch!(self, ds => ds.sharding())
    }

    pub fn is_sparse(&self) -> bool {
        dispatch!(self, ds => ds.is_sparse())
    }

    pub fn shard<B: CollectiveBackend>(
        &mut self,
        target: Sharding,
        ctx: &ComputeContext<B, D>,
    ) -> Result<()> {
        dispatch!(self, ds => ds.shard(target, ctx))
    }

    pub fn unshard<B: CollectiveBackend>(&mut self, ctx: &ComputeContext<B, D>) -> Result<()> {
        dispatch!(self, ds => ds.unshard(ctx))
    }

    pub fn memory_usage<B: CollectiveBackend>(
        &self,
        ctx: &ComputeContext<B, D>,
    ) -> Result<Vec<(u64, u64)>> {
        dispatch!(self, ds => ds.memory_usage(ctx))
    }
}
