//! Prometheus metrics and reader statistics.

use lazy_static::lazy_static;
use prometheus::{self, Encoder, IntCounter, IntCounterVec, Opts};

lazy_static! {
    /// Extent records by outcome: sent, dropped, retried, filtered.
    pub static ref EXTENT_OUTCOMES: IntCounterVec = IntCounterVec::new(
        Opts::new("icepick_extents", "The number of extent records by outcome"),
        &["outcome"]
    ).expect("Prometheus metric options should be valid");
    /// Geolocation segments read across all beams.
    pub static ref SEGMENTS_READ: IntCounter = IntCounter::new(
        "icepick_segments_read",
        "The number of geolocation segments read"
    ).expect("Prometheus metric options should be valid");
}

/// Registers the metrics with the global registry.
pub fn register_metrics() {
    let registry = prometheus::default_registry();
    registry
        .register(Box::new(EXTENT_OUTCOMES.clone()))
        .expect("Prometheus metrics registration should not fail during initialization");
    registry
        .register(Box::new(SEGMENTS_READ.clone()))
        .expect("Prometheus metrics registration should not fail during initialization");
}

/// Returns currently gathered prometheus metrics.
pub fn metrics_handler() -> String {
    let encoder = prometheus::TextEncoder::new();
    let mut buffer = Vec::new();

    encoder
        .encode(&prometheus::gather(), &mut buffer)
        .expect("could not encode gathered metrics into temporary buffer");

    String::from_utf8(buffer).expect("could not convert metrics buffer into string")
}

/// Per-granule subsetting statistics.
///
/// Each beam accumulates a local copy and merges it into the reader's
/// shared copy under the beam-set mutex when it finishes.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ReaderStats {
    pub segments_read: u64,
    pub extents_filtered: u64,
    pub extents_sent: u64,
    pub extents_dropped: u64,
    pub extents_retried: u64,
}

impl ReaderStats {
    /// Fold another stats set into this one and bump the global counters.
    pub fn merge(&mut self, other: &ReaderStats) {
        self.segments_read += other.segments_read;
        self.extents_filtered += other.extents_filtered;
        self.extents_sent += other.extents_sent;
        self.extents_dropped += other.extents_dropped;
        self.extents_retried += other.extents_retried;

        SEGMENTS_READ.inc_by(other.segments_read);
        EXTENT_OUTCOMES
            .with_label_values(&["filtered"])
            .inc_by(other.extents_filtered);
        EXTENT_OUTCOMES
            .with_label_values(&["sent"])
            .inc_by(other.extents_sent);
        EXTENT_OUTCOMES
            .with_label_values(&["dropped"])
            .inc_by(other.extents_dropped);
        EXTENT_OUTCOMES
            .with_label_values(&["retried"])
            .inc_by(other.extents_retried);
    }
}
