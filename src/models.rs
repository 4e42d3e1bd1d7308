//! Request parameter model.
//!
//! A subsetting request arrives from the endpoint layer as JSON and is
//! deserialised into [SubsetParms]. Field defaults match the service
//! defaults; cross-field and range rules are enforced with [validator].

use crate::geo::{InclusionOracle, Point2D, Projection};

use serde::Deserialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use strum_macros::Display;
use validator::{Validate, ValidationError};

/// Along-track length of one ATL03 geolocation segment in meters.
pub const SEGMENT_LENGTH: f64 = 20.0;

/// Number of ATL03 segments spanned by one ATL08 land segment.
pub const NUM_ATL03_SEGS_IN_ATL08_SEG: u32 = 5;

/// Signal confidence range and bitset size.
pub const CNF_POSSIBLE_TEP: i8 = -2;
pub const CNF_SURFACE_HIGH: i8 = 4;
pub const SIGNAL_CONF_OFFSET: i8 = 2;
pub const NUM_SIGNAL_CONF: usize = 7;

/// Photon quality range and bitset size.
pub const QUALITY_NOMINAL: i8 = 0;
pub const QUALITY_POSSIBLE_TEP: i8 = 3;
pub const NUM_QUALITY: usize = 4;

/// ATL08 photon classes.
pub const ATL08_NOISE: u8 = 0;
pub const ATL08_GROUND: u8 = 1;
pub const ATL08_CANOPY: u8 = 2;
pub const ATL08_TOP_OF_CANOPY: u8 = 3;
pub const ATL08_UNCLASSIFIED: u8 = 4;
pub const NUM_ATL08_CLASSES: usize = 5;

/// Sentinel for per-photon flags with no classification match.
pub const INVALID_FLAG: u8 = 0xFF;

/// Sentinel for ancillary indices with no classification match.
pub const INVALID_INDEX: i32 = -1;

/// Surface type selecting the `signal_conf_ph` column.
#[derive(Clone, Copy, Debug, Default, Deserialize, Display, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum SurfaceType {
    #[default]
    Land,
    Ocean,
    SeaIce,
    LandIce,
    InlandWater,
}

impl SurfaceType {
    /// Column of the 2-D `signal_conf_ph` dataset for this surface.
    pub fn column(&self) -> usize {
        *self as usize
    }
}

/// Optional processing stages.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Stages {
    #[serde(default)]
    pub atl08: bool,
    #[serde(default)]
    pub yapc: bool,
    #[serde(default)]
    pub phoreal: bool,
}

/// YAPC density scorer configuration.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Validate)]
#[serde(deny_unknown_fields)]
pub struct YapcConfig {
    /// Algorithm version; 1 and 2 share the windowed implementation.
    #[serde(default = "default_yapc_version")]
    #[validate(range(min = 1, max = 3, message = "yapc version must be 1, 2 or 3"))]
    pub version: u8,
    /// Minimum score a photon must reach to pass the filter.
    #[serde(default)]
    pub score: u8,
    /// Neighbor count; 0 selects a data-driven count.
    #[serde(default)]
    pub knn: usize,
    /// Lower bound on the dynamic neighbor count (V3).
    #[serde(default = "default_min_knn")]
    #[validate(range(min = 1, message = "min_knn must be greater than 0"))]
    pub min_knn: usize,
    /// Height window in meters; 0 derives the window from the data (V2).
    #[serde(default = "default_win_h")]
    pub win_h: f64,
    /// Along-track window in meters.
    #[serde(default = "default_win_x")]
    pub win_x: f64,
}

impl Default for YapcConfig {
    fn default() -> Self {
        YapcConfig {
            version: default_yapc_version(),
            score: 0,
            knn: 0,
            min_knn: default_min_knn(),
            win_h: default_win_h(),
            win_x: default_win_x(),
        }
    }
}

/// PhoREAL options.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct PhorealConfig {
    /// Reassign night-time strong-beam high-confidence photons with low
    /// relief to top-of-canopy.
    #[serde(default)]
    pub above_classifier: bool,
    /// Report absolute height instead of relief in the photon record.
    #[serde(default)]
    pub use_abs_h: bool,
}

/// A raster region of interest, answered by an external oracle.
#[derive(Clone)]
pub struct RasterRegion(Arc<dyn InclusionOracle>);

impl RasterRegion {
    pub fn new(oracle: Arc<dyn InclusionOracle>) -> Self {
        RasterRegion(oracle)
    }

    pub fn includes(&self, lon: f64, lat: f64) -> bool {
        self.0.includes(lon, lat)
    }
}

impl fmt::Debug for RasterRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RasterRegion")
    }
}

/// Parameters of one granule subsetting request.
#[derive(Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
#[validate(schema(function = "validate_parms"))]
pub struct SubsetParms {
    #[serde(default)]
    pub surface_type: SurfaceType,
    /// Ground track to process; 0 selects all tracks.
    #[serde(default)]
    #[validate(range(max = 3, message = "track must be 0 (all), 1, 2 or 3"))]
    pub track: u8,
    /// Accepted signal confidences, indexed by confidence + 2.
    #[serde(default = "default_atl03_cnf")]
    pub atl03_cnf: [bool; NUM_SIGNAL_CONF],
    /// Accepted photon quality levels.
    #[serde(default = "default_quality_ph")]
    pub quality_ph: [bool; NUM_QUALITY],
    /// Accepted ATL08 classes, when the ATL08 stage is enabled.
    #[serde(default = "default_atl08_class")]
    pub atl08_class: [bool; NUM_ATL08_CLASSES],
    #[serde(default)]
    pub stages: Stages,
    #[serde(default)]
    #[validate]
    pub yapc: YapcConfig,
    #[serde(default)]
    pub phoreal: PhorealConfig,
    /// Extent length in meters, or in segments when `dist_in_seg` is set.
    #[serde(default = "default_extent_length")]
    #[validate(range(min = 0.000001, message = "extent_length must be greater than 0"))]
    pub extent_length: f64,
    /// Extent step in meters, or in segments when `dist_in_seg` is set.
    #[serde(default = "default_extent_step")]
    #[validate(range(min = 0.000001, message = "extent_step must be greater than 0"))]
    pub extent_step: f64,
    #[serde(default = "default_minimum_photon_count")]
    pub minimum_photon_count: usize,
    /// Minimum along-track spread of an extent's photons in meters.
    #[serde(default = "default_along_track_spread")]
    pub along_track_spread: f64,
    /// Interpret extent length and step as whole segments.
    #[serde(default)]
    pub dist_in_seg: bool,
    /// Emit extents that fail the validity gates.
    #[serde(default)]
    pub pass_invalid: bool,
    /// Budget for each delayed column read, in milliseconds.
    #[serde(default = "default_read_timeout")]
    #[validate(range(min = 1, message = "read_timeout must be greater than 0"))]
    pub read_timeout: u64,
    /// Region-of-interest polygon, already projected; closed ring.
    #[serde(default)]
    pub projected_poly: Vec<Point2D>,
    /// Projection the polygon was supplied in.
    #[serde(default)]
    pub projection: Projection,
    /// Raster region of interest; takes precedence over the polygon.
    #[serde(skip)]
    pub raster: Option<RasterRegion>,
    /// Extra per-segment geolocation fields to stream alongside extents.
    #[serde(default)]
    pub atl03_geo_fields: Vec<String>,
    /// Extra per-photon fields to stream alongside extents.
    #[serde(default)]
    pub atl03_ph_fields: Vec<String>,
    /// Extra ATL08 land-segment fields to stream alongside extents.
    #[serde(default)]
    pub atl08_fields: Vec<String>,
}

impl Default for SubsetParms {
    fn default() -> Self {
        SubsetParms {
            surface_type: SurfaceType::Land,
            track: 0,
            atl03_cnf: default_atl03_cnf(),
            quality_ph: default_quality_ph(),
            atl08_class: default_atl08_class(),
            stages: Stages::default(),
            yapc: YapcConfig::default(),
            phoreal: PhorealConfig::default(),
            extent_length: default_extent_length(),
            extent_step: default_extent_step(),
            minimum_photon_count: default_minimum_photon_count(),
            along_track_spread: default_along_track_spread(),
            dist_in_seg: false,
            pass_invalid: false,
            read_timeout: default_read_timeout(),
            projected_poly: Vec::new(),
            projection: Projection::default(),
            raster: None,
            atl03_geo_fields: Vec::new(),
            atl03_ph_fields: Vec::new(),
            atl08_fields: Vec::new(),
        }
    }
}

impl SubsetParms {
    /// Read timeout as a [Duration].
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout)
    }

    /// Whether the request carries a polygon region of interest.
    pub fn has_polygon(&self) -> bool {
        !self.projected_poly.is_empty()
    }

    /// Whether the caller accepts the given signal confidence.
    ///
    /// The confidence must already have been range checked.
    pub fn accepts_cnf(&self, cnf: i8) -> bool {
        self.atl03_cnf[(cnf + SIGNAL_CONF_OFFSET) as usize]
    }

    /// Whether the caller accepts the given photon quality.
    pub fn accepts_quality(&self, quality: i8) -> bool {
        self.quality_ph[quality as usize]
    }

    /// Whether the caller accepts the given ATL08 class.
    pub fn accepts_class(&self, class: u8) -> bool {
        self.atl08_class[class as usize]
    }

    /// Whether the given ground track is selected by the request.
    pub fn wants_track(&self, track: u8) -> bool {
        self.track == 0 || self.track == track
    }

    /// Whether the ATL08 companion granule is needed at all.
    ///
    /// PhoREAL implies the ATL08 stage.
    pub fn atl08_enabled(&self) -> bool {
        self.stages.atl08 || self.stages.phoreal
    }
}

fn validate_parms(parms: &SubsetParms) -> Result<(), ValidationError> {
    if !parms.projected_poly.is_empty()
        && (parms.projected_poly.len() < 4
            || parms.projected_poly.first() != parms.projected_poly.last())
    {
        return Err(ValidationError::new("projected_poly must be a closed ring"));
    }
    if parms.dist_in_seg
        && (parms.extent_length.fract() != 0.0 || parms.extent_step.fract() != 0.0)
    {
        return Err(ValidationError::new(
            "extent_length and extent_step must be whole segment counts",
        ));
    }
    Ok(())
}

fn default_yapc_version() -> u8 {
    3
}

fn default_min_knn() -> usize {
    5
}

fn default_win_h() -> f64 {
    6.0
}

fn default_win_x() -> f64 {
    15.0
}

/// Default confidence mask: surface returns of low confidence and above.
fn default_atl03_cnf() -> [bool; NUM_SIGNAL_CONF] {
    let mut mask = [false; NUM_SIGNAL_CONF];
    for cnf in 2..=CNF_SURFACE_HIGH {
        mask[(cnf + SIGNAL_CONF_OFFSET) as usize] = true;
    }
    mask
}

/// Default quality mask: nominal photons only.
fn default_quality_ph() -> [bool; NUM_QUALITY] {
    let mut mask = [false; NUM_QUALITY];
    mask[QUALITY_NOMINAL as usize] = true;
    mask
}

/// Default class mask: every class accepted.
fn default_atl08_class() -> [bool; NUM_ATL08_CLASSES] {
    [true; NUM_ATL08_CLASSES]
}

fn default_extent_length() -> f64 {
    40.0
}

fn default_extent_step() -> f64 {
    20.0
}

fn default_minimum_photon_count() -> usize {
    10
}

fn default_along_track_spread() -> f64 {
    20.0
}

fn default_read_timeout() -> u64 {
    600_000
}
