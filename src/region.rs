//! Spatial subsetting of a beam to the region of interest.
//!
//! The region walk consumes the three per-segment geolocation columns
//! and produces the segment and photon windows every later read is
//! scoped to. Polygon regions yield one contiguous window; raster
//! regions additionally retain a per-segment inclusion mask that is
//! consulted per photon during windowing.

use crate::column::{ColumnSlice, GranuleSource, LazyColumn};
use crate::error::SubsetError;
use crate::geo;
use crate::models::SubsetParms;

use std::sync::Arc;

/// Segment and photon windows of one beam, plus the geolocation columns
/// they were computed from.
pub struct Region {
    pub first_segment: usize,
    /// Segment count of the window; `None` reads the whole beam.
    pub num_segments: Option<usize>,
    pub first_photon: usize,
    /// Photon count of the window; `None` reads the whole beam.
    pub num_photons: Option<usize>,
    /// Per-segment inclusion, offset to `first_segment`; raster mode only.
    pub inclusion_mask: Option<Vec<bool>>,
    pub segment_lat: LazyColumn<f64>,
    pub segment_lon: LazyColumn<f64>,
    pub segment_ph_cnt: LazyColumn<u32>,
}

impl Region {
    /// Read the geolocation columns and compute the spatial window.
    ///
    /// # Arguments
    ///
    /// * `source`: Open primary granule
    /// * `prefix`: Beam group prefix, e.g. `/gt1l`
    /// * `parms`: Request parameters
    pub async fn new(
        source: &Arc<dyn GranuleSource>,
        prefix: &str,
        parms: &SubsetParms,
    ) -> Result<Self, SubsetError> {
        let mut segment_lat = LazyColumn::issue(
            source,
            &format!("{prefix}/geolocation/reference_photon_lat"),
            ColumnSlice::Full,
        );
        let mut segment_lon = LazyColumn::issue(
            source,
            &format!("{prefix}/geolocation/reference_photon_lon"),
            ColumnSlice::Full,
        );
        let mut segment_ph_cnt = LazyColumn::issue(
            source,
            &format!("{prefix}/geolocation/segment_ph_cnt"),
            ColumnSlice::Full,
        );

        let timeout = parms.timeout();
        segment_lat.join(timeout).await?;
        segment_lon.join(timeout).await?;
        segment_ph_cnt.join(timeout).await?;

        let mut region = Region {
            first_segment: 0,
            num_segments: None,
            first_photon: 0,
            num_photons: None,
            inclusion_mask: None,
            segment_lat,
            segment_lon,
            segment_ph_cnt,
        };

        if parms.raster.is_some() {
            region.raster_region(parms);
        } else if parms.has_polygon() {
            region.poly_region(parms);
        } else {
            return Ok(region); // no subsetting required
        }

        if region.num_photons.unwrap_or(0) == 0 {
            return Err(SubsetError::EmptySubset);
        }

        // Re-base the geolocation columns onto the window so later
        // indexing starts at zero.
        let first_segment = region.first_segment;
        region.segment_lat.trim(first_segment);
        region.segment_lon.trim(first_segment);
        region.segment_ph_cnt.trim(first_segment);

        Ok(region)
    }

    /// Contiguous window of segments whose reference photon falls inside
    /// the polygon.
    ///
    /// The window opens at the first included segment with photons and
    /// closes at the first excluded segment with photons after it;
    /// empty segments never open or close the window.
    fn poly_region(&mut self, parms: &SubsetParms) {
        let mut first_segment_found = false;
        let mut first_photon = 0usize;
        let mut num_photons = 0usize;
        let mut segment = 0usize;

        while segment < self.segment_ph_cnt.len() {
            let point = geo::project(
                self.segment_lon[segment],
                self.segment_lat[segment],
                parms.projection,
            );
            let inclusion = geo::point_in_polygon(&parms.projected_poly, point);
            let count = self.segment_ph_cnt[segment] as usize;

            if !first_segment_found {
                if inclusion && count != 0 {
                    first_segment_found = true;
                    self.first_segment = segment;
                    num_photons = count;
                } else {
                    first_photon += count;
                }
            } else {
                if !inclusion && count != 0 {
                    break; // full extent found
                }
                num_photons += count;
            }

            segment += 1;
        }

        if first_segment_found {
            self.num_segments = Some(segment - self.first_segment);
        }
        self.first_photon = first_photon;
        self.num_photons = Some(num_photons);
    }

    /// Inclusion-masked window of segments inside the raster region.
    ///
    /// The window spans from the first to the last included segment; the
    /// mask records per-segment inclusion for the per-photon check during
    /// windowing.
    fn raster_region(&mut self, parms: &SubsetParms) {
        let raster = parms.raster.as_ref().expect("raster region without oracle");
        let num_segments_full = self.segment_ph_cnt.len();
        if num_segments_full == 0 {
            self.num_photons = Some(0);
            return;
        }

        let mut mask = vec![false; num_segments_full];
        let mut first_segment_found = false;
        let mut first_photon = 0usize;
        let mut num_photons = 0usize;
        let mut curr_num_photons = 0usize;
        let mut last_segment = 0usize;

        for segment in 0..num_segments_full {
            let count = self.segment_ph_cnt[segment] as usize;
            if count == 0 {
                continue;
            }
            let inclusion =
                raster.includes(self.segment_lon[segment], self.segment_lat[segment]);
            mask[segment] = inclusion;

            if !first_segment_found {
                if inclusion {
                    first_segment_found = true;
                    self.first_segment = segment;
                    last_segment = segment;
                    curr_num_photons = count;
                    num_photons = curr_num_photons;
                } else {
                    first_photon += count;
                }
            } else {
                curr_num_photons += count;
                if inclusion {
                    num_photons = curr_num_photons;
                    last_segment = segment;
                }
            }
        }

        if first_segment_found {
            self.num_segments = Some(last_segment - self.first_segment + 1);
            mask.drain(..self.first_segment);
            self.inclusion_mask = Some(mask);
        }
        self.first_photon = first_photon;
        self.num_photons = Some(num_photons);
    }

    /// Row slice selecting the window's segments.
    pub fn segment_rows(&self) -> ColumnSlice {
        ColumnSlice::rows(self.first_segment, self.num_segments)
    }

    /// Row slice selecting the window's photons.
    pub fn photon_rows(&self) -> ColumnSlice {
        ColumnSlice::rows(self.first_photon, self.num_photons)
    }
}
