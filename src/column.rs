//! Delayed column reads from a remote granule archive.
//!
//! The HDF5-over-object-storage driver sits behind the [Archive] and
//! [GranuleSource] traits. A [LazyColumn] wraps one in-flight dataset
//! read: `issue` starts it on the runtime, `join` awaits it under the
//! request's read timeout, and afterwards the column is indexable like a
//! materialized array. [LazyAnyColumn] is the runtime-typed variant used
//! for caller-requested ancillary fields, which are serialized into
//! records without a compile-time element type.

use crate::error::SubsetError;

use async_trait::async_trait;
use ndarray::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use url::Url;

/// Error raised by the archive driver for a single dataset read.
#[derive(Debug, Error)]
pub enum ReadFault {
    /// The dataset does not exist in the granule
    #[error("no such dataset")]
    MissingDataset,

    /// The driver failed to fetch or decode the dataset
    #[error("{0}")]
    Driver(String),
}

/// Identifies an archive holding granules.
#[derive(Clone, Debug)]
pub struct Asset {
    /// Short name of the asset, used in logs.
    pub name: String,
    /// Object storage API URL.
    pub endpoint: Url,
}

impl Asset {
    pub fn new(name: &str, endpoint: Url) -> Self {
        Asset {
            name: name.to_string(),
            endpoint,
        }
    }
}

/// Element selection within a 1-D or 2-D dataset.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ColumnSlice {
    /// Every row.
    Full,
    /// A row range of a 1-D dataset; `count` of `None` reads to the end.
    Rows { first: usize, count: Option<usize> },
    /// One column of a 2-D dataset, restricted to a row range.
    Cell {
        col: usize,
        first: usize,
        count: Option<usize>,
    },
    /// All columns of a 2-D dataset over a row range, flattened row-major.
    AllColumns { first: usize, count: Option<usize> },
}

impl ColumnSlice {
    pub fn rows(first: usize, count: Option<usize>) -> Self {
        ColumnSlice::Rows { first, count }
    }
}

/// Factory for per-granule sources.
///
/// Implemented by the archive driver. `open` is cheap; actual I/O is
/// deferred until columns are read.
pub trait Archive: Send + Sync + 'static {
    fn open(&self, asset: &Asset, resource: &str) -> Arc<dyn GranuleSource>;
}

/// A handle onto one open granule.
///
/// The handle doubles as the driver's per-granule context: dataset
/// metadata fetched for one column may be shared with every other column
/// of the same granule.
#[async_trait]
pub trait GranuleSource: Send + Sync + 'static {
    async fn read(&self, dataset: &str, slice: ColumnSlice) -> Result<ColumnData, ReadFault>;
}

/// Scalar type of a materialized column, as delivered by the driver.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DataType {
    Int8,
    UInt8,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Float32,
    Float64,
}

impl DataType {
    /// Size of one element in bytes.
    pub fn size(&self) -> usize {
        match self {
            DataType::Int8 | DataType::UInt8 => 1,
            DataType::Int16 | DataType::UInt16 => 2,
            DataType::Int32 | DataType::UInt32 | DataType::Float32 => 4,
            DataType::Int64 | DataType::UInt64 | DataType::Float64 => 8,
        }
    }

    /// Wire code used in ancillary records.
    pub fn code(&self) -> u8 {
        match self {
            DataType::Int8 => 0,
            DataType::UInt8 => 1,
            DataType::Int16 => 2,
            DataType::UInt16 => 3,
            DataType::Int32 => 4,
            DataType::UInt32 => 5,
            DataType::Int64 => 6,
            DataType::UInt64 => 7,
            DataType::Float32 => 8,
            DataType::Float64 => 9,
        }
    }
}

/// A materialized column of runtime-typed elements.
#[derive(Clone, Debug, PartialEq)]
pub enum ColumnData {
    Int8(Vec<i8>),
    UInt8(Vec<u8>),
    Int16(Vec<i16>),
    UInt16(Vec<u16>),
    Int32(Vec<i32>),
    UInt32(Vec<u32>),
    Int64(Vec<i64>),
    UInt64(Vec<u64>),
    Float32(Vec<f32>),
    Float64(Vec<f64>),
}

macro_rules! for_each_column_variant {
    ($data:expr, $v:ident => $body:expr) => {
        match $data {
            ColumnData::Int8($v) => $body,
            ColumnData::UInt8($v) => $body,
            ColumnData::Int16($v) => $body,
            ColumnData::UInt16($v) => $body,
            ColumnData::Int32($v) => $body,
            ColumnData::UInt32($v) => $body,
            ColumnData::Int64($v) => $body,
            ColumnData::UInt64($v) => $body,
            ColumnData::Float32($v) => $body,
            ColumnData::Float64($v) => $body,
        }
    };
}

impl ColumnData {
    /// Number of elements.
    pub fn len(&self) -> usize {
        for_each_column_variant!(self, v => v.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Scalar type of the elements.
    pub fn dtype(&self) -> DataType {
        match self {
            ColumnData::Int8(_) => DataType::Int8,
            ColumnData::UInt8(_) => DataType::UInt8,
            ColumnData::Int16(_) => DataType::Int16,
            ColumnData::UInt16(_) => DataType::UInt16,
            ColumnData::Int32(_) => DataType::Int32,
            ColumnData::UInt32(_) => DataType::UInt32,
            ColumnData::Int64(_) => DataType::Int64,
            ColumnData::UInt64(_) => DataType::UInt64,
            ColumnData::Float32(_) => DataType::Float32,
            ColumnData::Float64(_) => DataType::Float64,
        }
    }

    /// Element `index` widened to f64.
    pub fn value_f64(&self, index: usize) -> f64 {
        for_each_column_variant!(self, v => v[index] as f64)
    }

    /// Append the little-endian bytes of element `index` to `out`.
    pub fn extend_element_bytes(&self, index: usize, out: &mut Vec<u8>) {
        for_each_column_variant!(self, v => out.extend_from_slice(&v[index].to_le_bytes()))
    }
}

/// Numeric element types a typed column can be materialized as.
///
/// The driver delivers whatever scalar type the dataset holds; this trait
/// performs the numeric conversion to the type the pipeline wants, the
/// way the archive layer converts on read.
pub trait ColumnElem: Copy + Send + Sync + 'static {
    fn cast_from(data: ColumnData) -> Vec<Self>;
}

macro_rules! impl_column_elem {
    ($($t:ty),*) => {
        $(
            impl ColumnElem for $t {
                fn cast_from(data: ColumnData) -> Vec<Self> {
                    for_each_column_variant!(data, v => v.into_iter().map(|x| x as $t).collect())
                }
            }
        )*
    };
}

impl_column_elem!(i8, u8, i16, u16, i32, u32, i64, u64, f32, f64);

/// A delayed read of a typed column slice.
pub struct LazyColumn<T: ColumnElem> {
    dataset: String,
    handle: Option<JoinHandle<Result<ColumnData, ReadFault>>>,
    values: Option<Array1<T>>,
}

impl<T: ColumnElem> LazyColumn<T> {
    /// Begin a delayed read of `dataset` on the runtime.
    pub fn issue(source: &Arc<dyn GranuleSource>, dataset: &str, slice: ColumnSlice) -> Self {
        let src = Arc::clone(source);
        let name = dataset.to_string();
        let handle = tokio::spawn(async move { src.read(&name, slice).await });
        LazyColumn {
            dataset: dataset.to_string(),
            handle: Some(handle),
            values: None,
        }
    }

    /// Block until the read completes, or `timeout` elapses.
    ///
    /// Idempotent once joined.
    pub async fn join(&mut self, timeout: Duration) -> Result<(), SubsetError> {
        if self.values.is_some() {
            return Ok(());
        }
        let handle = self.handle.take().ok_or_else(|| SubsetError::ReadError {
            dataset: self.dataset.clone(),
            reason: "read was not issued".to_string(),
        })?;
        let data = join_read(&self.dataset, handle, timeout).await?;
        self.values = Some(Array1::from_vec(T::cast_from(data)));
        Ok(())
    }

    /// Discard the first `offset` elements.
    pub fn trim(&mut self, offset: usize) {
        if offset == 0 {
            return;
        }
        let values = self.values.take().expect("column trimmed before join");
        self.values = Some(values.slice_move(s![offset as isize..]));
    }

    pub fn len(&self) -> usize {
        self.values.as_ref().map_or(0, |values| values.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn values(&self) -> &Array1<T> {
        self.values.as_ref().expect("column indexed before join")
    }
}

impl<T: ColumnElem> std::ops::Index<usize> for LazyColumn<T> {
    type Output = T;

    fn index(&self, index: usize) -> &T {
        &self.values()[index]
    }
}

/// A delayed read of a runtime-typed column slice.
pub struct LazyAnyColumn {
    dataset: String,
    handle: Option<JoinHandle<Result<ColumnData, ReadFault>>>,
    data: Option<ColumnData>,
}

impl LazyAnyColumn {
    /// Begin a delayed read of `dataset` on the runtime.
    pub fn issue(source: &Arc<dyn GranuleSource>, dataset: &str, slice: ColumnSlice) -> Self {
        let src = Arc::clone(source);
        let name = dataset.to_string();
        let handle = tokio::spawn(async move { src.read(&name, slice).await });
        LazyAnyColumn {
            dataset: dataset.to_string(),
            handle: Some(handle),
            data: None,
        }
    }

    /// Block until the read completes, or `timeout` elapses.
    pub async fn join(&mut self, timeout: Duration) -> Result<(), SubsetError> {
        if self.data.is_some() {
            return Ok(());
        }
        let handle = self.handle.take().ok_or_else(|| SubsetError::ReadError {
            dataset: self.dataset.clone(),
            reason: "read was not issued".to_string(),
        })?;
        self.data = Some(join_read(&self.dataset, handle, timeout).await?);
        Ok(())
    }

    pub fn data(&self) -> &ColumnData {
        self.data.as_ref().expect("column accessed before join")
    }
}

async fn join_read(
    dataset: &str,
    handle: JoinHandle<Result<ColumnData, ReadFault>>,
    timeout: Duration,
) -> Result<ColumnData, SubsetError> {
    let mut handle = handle;
    let outcome = tokio::time::timeout(timeout, &mut handle).await;
    match outcome {
        Err(_) => {
            // The driver task keeps running; cancellation latency for the
            // beam is bounded by this timeout, not by the read itself.
            handle.abort();
            Err(SubsetError::Timeout {
                dataset: dataset.to_string(),
            })
        }
        Ok(Err(join_error)) => Err(SubsetError::ReadError {
            dataset: dataset.to_string(),
            reason: format!("read task failed: {join_error}"),
        }),
        Ok(Ok(Err(fault))) => Err(SubsetError::ReadError {
            dataset: dataset.to_string(),
            reason: fault.to_string(),
        }),
        Ok(Ok(Ok(data))) => Ok(data),
    }
}
