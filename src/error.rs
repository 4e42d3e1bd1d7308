//! Error handling.

use thiserror::Error;

/// Granule subsetter error type.
///
/// This type encapsulates the various errors that may occur while
/// subsetting a granule. Beam-local errors are caught at the beam
/// boundary and converted into an exception record with the variant's
/// status code and severity; a failure in one beam never aborts the
/// others.
#[derive(Debug, Error)]
pub enum SubsetError {
    /// Failed to extract granule identifiers from a resource name
    #[error("failed to parse {what} from resource {resource}")]
    ParseError { resource: String, what: &'static str },

    /// A delayed column read did not complete within the read timeout
    #[error("read of {dataset} timed out")]
    Timeout { dataset: String },

    /// The archive driver failed to materialize a column
    #[error("failed to read {dataset}: {reason}")]
    ReadError { dataset: String, reason: String },

    /// The region of interest matched no photons; the beam exits cleanly
    #[error("empty spatial region")]
    EmptySubset,

    /// Out-of-range signal confidence value in the photon data
    #[error("invalid atl03 signal confidence: {0}")]
    InvalidConf(i8),

    /// Out-of-range photon quality value in the photon data
    #[error("invalid atl03 photon quality: {0}")]
    InvalidQuality(i8),

    /// Out-of-range ATL08 classification value in the photon data
    #[error("invalid atl08 classification: {0}")]
    InvalidClass(u8),

    /// Unsupported YAPC algorithm version
    #[error("invalid YAPC version specified: {0}")]
    InvalidVersion(u8),

    /// The output queue rejected a record with a hard failure
    #[error("failed to post {record_type} record to output queue")]
    PostError { record_type: &'static str },
}

/// Severity attached to exception records and used to pick a log level.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Severity {
    Debug,
    Error,
    Critical,
}

impl SubsetError {
    /// Status code carried by the exception record for this error.
    pub fn code(&self) -> i32 {
        match self {
            SubsetError::ParseError { .. } => -1,
            SubsetError::Timeout { .. } => -2,
            SubsetError::ReadError { .. } => -3,
            SubsetError::EmptySubset => -4,
            SubsetError::InvalidConf(_)
            | SubsetError::InvalidQuality(_)
            | SubsetError::InvalidClass(_) => -5,
            SubsetError::InvalidVersion(_) => -6,
            SubsetError::PostError { .. } => -7,
        }
    }

    /// Severity of the error.
    ///
    /// `EmptySubset` is an expected outcome of spatial subsetting and is
    /// reported at debug severity; data faults and configuration errors
    /// are critical.
    pub fn severity(&self) -> Severity {
        match self {
            SubsetError::EmptySubset => Severity::Debug,
            SubsetError::Timeout { .. } | SubsetError::PostError { .. } => Severity::Error,
            SubsetError::ParseError { .. }
            | SubsetError::ReadError { .. }
            | SubsetError::InvalidConf(_)
            | SubsetError::InvalidQuality(_)
            | SubsetError::InvalidClass(_)
            | SubsetError::InvalidVersion(_) => Severity::Critical,
        }
    }
}
