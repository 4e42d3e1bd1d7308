//! Primary granule columns.
//!
//! Issues the fixed set of ATL03 reads scoped to the region window, plus
//! the caller-requested ancillary columns, then joins them all under the
//! read timeout. A single failed join fails the beam.

use crate::column::{ColumnSlice, GranuleSource, LazyAnyColumn, LazyColumn};
use crate::error::SubsetError;
use crate::models::SubsetParms;
use crate::region::Region;

use hashbrown::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Geolocation fields that live in the `geophys_corr` group rather than
/// `geolocation`.
const GEOPHYS_CORR_PREFIXES: [&str; 4] = ["tid", "geo", "dem", "dac"];

/// The primary granule's columns for one beam, scoped to the region
/// window.
pub struct Atl03Data {
    pub sc_orient: LazyColumn<u8>,
    /// Spacecraft velocity components, flattened `[vx, vy, vz]` per
    /// segment.
    pub velocity_sc: LazyColumn<f32>,
    pub segment_delta_time: LazyColumn<f64>,
    pub segment_id: LazyColumn<u32>,
    pub segment_dist_x: LazyColumn<f64>,
    pub solar_elevation: LazyColumn<f32>,
    pub dist_ph_along: LazyColumn<f32>,
    pub dist_ph_across: LazyColumn<f32>,
    pub h_ph: LazyColumn<f32>,
    pub signal_conf_ph: LazyColumn<i8>,
    pub quality_ph: LazyColumn<i8>,
    pub lat_ph: LazyColumn<f64>,
    pub lon_ph: LazyColumn<f64>,
    pub delta_time: LazyColumn<f64>,
    pub bckgrd_delta_time: LazyColumn<f64>,
    pub bckgrd_rate: LazyColumn<f64>,
    /// Caller-requested per-segment columns, keyed by field name.
    pub anc_geo_data: Option<HashMap<String, LazyAnyColumn>>,
    /// Caller-requested per-photon columns, keyed by field name.
    pub anc_ph_data: Option<HashMap<String, LazyAnyColumn>>,
}

impl Atl03Data {
    /// Issue and join every primary column read.
    ///
    /// # Arguments
    ///
    /// * `source`: Open primary granule
    /// * `prefix`: Beam group prefix, e.g. `/gt1l`
    /// * `region`: Spatial window computed by [Region]
    /// * `parms`: Request parameters
    pub async fn new(
        source: &Arc<dyn GranuleSource>,
        prefix: &str,
        region: &Region,
        parms: &SubsetParms,
    ) -> Result<Self, SubsetError> {
        let segments = region.segment_rows();
        let photons = region.photon_rows();

        let mut data = Atl03Data {
            sc_orient: LazyColumn::issue(source, "/orbit_info/sc_orient", ColumnSlice::Full),
            velocity_sc: LazyColumn::issue(
                source,
                &format!("{prefix}/geolocation/velocity_sc"),
                match segments {
                    ColumnSlice::Rows { first, count } => ColumnSlice::AllColumns { first, count },
                    other => other,
                },
            ),
            segment_delta_time: LazyColumn::issue(
                source,
                &format!("{prefix}/geolocation/delta_time"),
                segments,
            ),
            segment_id: LazyColumn::issue(
                source,
                &format!("{prefix}/geolocation/segment_id"),
                segments,
            ),
            segment_dist_x: LazyColumn::issue(
                source,
                &format!("{prefix}/geolocation/segment_dist_x"),
                segments,
            ),
            solar_elevation: LazyColumn::issue(
                source,
                &format!("{prefix}/geolocation/solar_elevation"),
                segments,
            ),
            dist_ph_along: LazyColumn::issue(
                source,
                &format!("{prefix}/heights/dist_ph_along"),
                photons,
            ),
            dist_ph_across: LazyColumn::issue(
                source,
                &format!("{prefix}/heights/dist_ph_across"),
                photons,
            ),
            h_ph: LazyColumn::issue(source, &format!("{prefix}/heights/h_ph"), photons),
            signal_conf_ph: LazyColumn::issue(
                source,
                &format!("{prefix}/heights/signal_conf_ph"),
                match photons {
                    ColumnSlice::Rows { first, count } => ColumnSlice::Cell {
                        col: parms.surface_type.column(),
                        first,
                        count,
                    },
                    other => other,
                },
            ),
            quality_ph: LazyColumn::issue(
                source,
                &format!("{prefix}/heights/quality_ph"),
                photons,
            ),
            lat_ph: LazyColumn::issue(source, &format!("{prefix}/heights/lat_ph"), photons),
            lon_ph: LazyColumn::issue(source, &format!("{prefix}/heights/lon_ph"), photons),
            delta_time: LazyColumn::issue(
                source,
                &format!("{prefix}/heights/delta_time"),
                photons,
            ),
            bckgrd_delta_time: LazyColumn::issue(
                source,
                &format!("{prefix}/bckgrd_atlas/delta_time"),
                ColumnSlice::Full,
            ),
            bckgrd_rate: LazyColumn::issue(
                source,
                &format!("{prefix}/bckgrd_atlas/bckgrd_rate"),
                ColumnSlice::Full,
            ),
            anc_geo_data: issue_ancillary(source, &parms.atl03_geo_fields, |field| {
                let group = if GEOPHYS_CORR_PREFIXES
                    .iter()
                    .any(|prefix| field.starts_with(prefix))
                {
                    "geophys_corr"
                } else {
                    "geolocation"
                };
                (format!("{prefix}/{group}/{field}"), segments)
            }),
            anc_ph_data: issue_ancillary(source, &parms.atl03_ph_fields, |field| {
                (format!("{prefix}/heights/{field}"), photons)
            }),
        };

        data.join_all(parms.timeout()).await?;
        Ok(data)
    }

    async fn join_all(&mut self, timeout: Duration) -> Result<(), SubsetError> {
        self.sc_orient.join(timeout).await?;
        self.velocity_sc.join(timeout).await?;
        self.segment_delta_time.join(timeout).await?;
        self.segment_id.join(timeout).await?;
        self.segment_dist_x.join(timeout).await?;
        self.solar_elevation.join(timeout).await?;
        self.dist_ph_along.join(timeout).await?;
        self.dist_ph_across.join(timeout).await?;
        self.h_ph.join(timeout).await?;
        self.signal_conf_ph.join(timeout).await?;
        self.quality_ph.join(timeout).await?;
        self.lat_ph.join(timeout).await?;
        self.lon_ph.join(timeout).await?;
        self.delta_time.join(timeout).await?;
        self.bckgrd_delta_time.join(timeout).await?;
        self.bckgrd_rate.join(timeout).await?;
        for dict in [&mut self.anc_geo_data, &mut self.anc_ph_data]
            .into_iter()
            .flatten()
        {
            for column in dict.values_mut() {
                column.join(timeout).await?;
            }
        }
        Ok(())
    }

    /// Magnitude of the spacecraft velocity at the given segment.
    pub fn spacecraft_velocity(&self, segment: usize) -> f64 {
        let at = segment * 3;
        let v1 = self.velocity_sc[at] as f64;
        let v2 = self.velocity_sc[at + 1] as f64;
        let v3 = self.velocity_sc[at + 2] as f64;
        (v1 * v1 + v2 * v2 + v3 * v3).sqrt()
    }
}

fn issue_ancillary(
    source: &Arc<dyn GranuleSource>,
    fields: &[String],
    locate: impl Fn(&str) -> (String, ColumnSlice),
) -> Option<HashMap<String, LazyAnyColumn>> {
    if fields.is_empty() {
        return None;
    }
    let mut dict = HashMap::with_capacity(fields.len());
    for field in fields {
        let (dataset, slice) = locate(field);
        dict.insert(field.clone(), LazyAnyColumn::issue(source, &dataset, slice));
    }
    Some(dict)
}
