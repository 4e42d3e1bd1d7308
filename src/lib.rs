//! Icepick is a subsetting and feature-extraction core for ICESat-2
//! laser-altimetry granules stored in a remote archive. For each of the
//! up to six ground-track beams of a granule it lazily fetches the
//! required columnar slices, aligns the companion ATL08 classification
//! granule against the primary photon stream, optionally computes a
//! per-photon YAPC density score, walks the photons with an along-track
//! sliding window, and streams fixed-schema extent records onto a
//! bounded output queue under backpressure and cancellation.
//!
//! The crate is the core of a larger service: the endpoint layer that
//! authenticates requests and owns the queue consumer, the
//! HDF5-over-object-storage driver behind [column::Archive], and the
//! raster region oracle behind [geo::InclusionOracle] are external
//! collaborators.
//!
//! Icepick is built on top of a number of open source components:
//!
//! * [Tokio](tokio), which runs the per-beam tasks and the delayed
//!   column reads.
//! * [Serde](serde) and [validator], which deserialise and validate the
//!   JSON request parameters.
//! * [zerocopy], which serialises the fixed-layout record structs.
//! * [Prometheus](prometheus) metrics mirroring the reader statistics.
//!
//! ## Typical use
//!
//! The endpoint layer deserialises a [models::SubsetParms], opens a
//! bounded [queue::Publisher], and calls [reader::GranuleReader::start]
//! with an archive driver. Extents, ancillary records and exception
//! records stream onto the queue, terminated by an empty frame.

pub mod atl03;
pub mod atl08;
pub mod column;
pub mod emit;
pub mod error;
pub mod extent;
pub mod geo;
pub mod metrics;
pub mod models;
pub mod queue;
pub mod reader;
pub mod records;
pub mod region;
pub mod resource;
#[cfg(test)]
pub mod test_utils;
pub mod tracing;
pub mod yapc;
