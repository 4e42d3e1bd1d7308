//! Companion classification granule alignment.
//!
//! The ATL08 granule enumerates only classified photons, keyed by
//! `(segment id, 1-based photon index within the segment)`. Both photon
//! streams are sorted on that key, so producing a dense per-primary-photon
//! classification array is a cursor merge join: walk the primary photons
//! in order and advance the classification cursor past everything that
//! sorts below the current key.

use crate::atl03::Atl03Data;
use crate::column::{ColumnSlice, GranuleSource, LazyAnyColumn, LazyColumn};
use crate::error::SubsetError;
use crate::models::{
    self, SubsetParms, ATL08_TOP_OF_CANOPY, ATL08_UNCLASSIFIED, CNF_SURFACE_HIGH, INVALID_FLAG,
    INVALID_INDEX, NUM_ATL03_SEGS_IN_ATL08_SEG,
};
use crate::region::Region;
use crate::resource::Beam;

use hashbrown::HashMap;
use std::sync::Arc;

/// Classification columns of the companion granule and the dense
/// per-photon arrays derived from them.
pub struct Atl08Data {
    phoreal: bool,
    ancillary: bool,
    atl08_segment_id: LazyColumn<u32>,
    atl08_pc_indx: LazyColumn<u32>,
    atl08_pc_flag: LazyColumn<u8>,
    atl08_ph_h: Option<LazyColumn<f32>>,
    segment_id_beg: Option<LazyColumn<u32>>,
    segment_landcover: Option<LazyColumn<u8>>,
    segment_snowcover: Option<LazyColumn<u8>>,
    /// Caller-requested land-segment columns, keyed by field name.
    pub anc_seg_data: Option<HashMap<String, LazyAnyColumn>>,
    /// Dense per-primary-photon classification.
    pub classification: Vec<u8>,
    /// PhoREAL relief per photon.
    pub relief: Option<Vec<f32>>,
    /// PhoREAL landcover flag per photon.
    pub landcover: Option<Vec<u8>>,
    /// PhoREAL snowcover flag per photon.
    pub snowcover: Option<Vec<u8>>,
    /// Land-segment index per photon, for the ancillary join.
    pub anc_seg_indices: Option<Vec<i32>>,
}

impl Atl08Data {
    /// Begin the classification-granule reads.
    ///
    /// The ancillary land-segment columns are joined here; the photon
    /// index columns are joined by [classify](Self::classify) so they can
    /// overlap the primary granule reads.
    pub async fn new(
        source: &Arc<dyn GranuleSource>,
        prefix: &str,
        parms: &SubsetParms,
    ) -> Result<Self, SubsetError> {
        let phoreal = parms.stages.phoreal;
        let ancillary = !parms.atl08_fields.is_empty();

        let mut data = Atl08Data {
            phoreal,
            ancillary,
            atl08_segment_id: LazyColumn::issue(
                source,
                &format!("{prefix}/signal_photons/ph_segment_id"),
                ColumnSlice::Full,
            ),
            atl08_pc_indx: LazyColumn::issue(
                source,
                &format!("{prefix}/signal_photons/classed_pc_indx"),
                ColumnSlice::Full,
            ),
            atl08_pc_flag: LazyColumn::issue(
                source,
                &format!("{prefix}/signal_photons/classed_pc_flag"),
                ColumnSlice::Full,
            ),
            atl08_ph_h: phoreal.then(|| {
                LazyColumn::issue(
                    source,
                    &format!("{prefix}/signal_photons/ph_h"),
                    ColumnSlice::Full,
                )
            }),
            segment_id_beg: (phoreal || ancillary).then(|| {
                LazyColumn::issue(
                    source,
                    &format!("{prefix}/land_segments/segment_id_beg"),
                    ColumnSlice::Full,
                )
            }),
            segment_landcover: phoreal.then(|| {
                LazyColumn::issue(
                    source,
                    &format!("{prefix}/land_segments/segment_landcover"),
                    ColumnSlice::Full,
                )
            }),
            segment_snowcover: phoreal.then(|| {
                LazyColumn::issue(
                    source,
                    &format!("{prefix}/land_segments/segment_snowcover"),
                    ColumnSlice::Full,
                )
            }),
            anc_seg_data: None,
            classification: Vec::new(),
            relief: None,
            landcover: None,
            snowcover: None,
            anc_seg_indices: None,
        };

        if ancillary {
            let mut dict = HashMap::with_capacity(parms.atl08_fields.len());
            for field in &parms.atl08_fields {
                let dataset = format!("{prefix}/land_segments/{field}");
                dict.insert(
                    field.clone(),
                    LazyAnyColumn::issue(source, &dataset, ColumnSlice::Full),
                );
            }
            for column in dict.values_mut() {
                column.join(parms.timeout()).await?;
            }
            data.anc_seg_data = Some(dict);
        }

        Ok(data)
    }

    /// Join the photon index columns and materialize the dense per-photon
    /// arrays by merge-joining the two photon streams.
    pub async fn classify(
        &mut self,
        region: &Region,
        atl03: &Atl03Data,
        parms: &SubsetParms,
        beam: Beam,
    ) -> Result<(), SubsetError> {
        let timeout = parms.timeout();
        self.atl08_segment_id.join(timeout).await?;
        self.atl08_pc_indx.join(timeout).await?;
        self.atl08_pc_flag.join(timeout).await?;
        if let Some(column) = self.segment_id_beg.as_mut() {
            column.join(timeout).await?;
        }
        if let Some(column) = self.atl08_ph_h.as_mut() {
            column.join(timeout).await?;
        }
        if let Some(column) = self.segment_landcover.as_mut() {
            column.join(timeout).await?;
        }
        if let Some(column) = self.segment_snowcover.as_mut() {
            column.join(timeout).await?;
        }

        let num_photons = atl03.dist_ph_along.len();
        self.classification = vec![ATL08_UNCLASSIFIED; num_photons];
        if self.phoreal {
            self.relief = Some(vec![0.0; num_photons]);
            self.landcover = Some(vec![INVALID_FLAG; num_photons]);
            self.snowcover = Some(vec![INVALID_FLAG; num_photons]);
        }
        if self.ancillary {
            self.anc_seg_indices = Some(vec![INVALID_INDEX; num_photons]);
        }

        let num_classed = self.atl08_segment_id.len();
        let mut atl03_photon = 0usize;
        let mut atl08_photon = 0usize;
        let mut atl08_segment_index = 0usize;

        for segment_index in 0..atl03.segment_id.len() {
            let atl03_segment = atl03.segment_id[segment_index];

            // Track the land segment spanning the current ATL03 segment.
            if let Some(segment_id_beg) = self.segment_id_beg.as_ref() {
                while atl08_segment_index < segment_id_beg.len()
                    && segment_id_beg[atl08_segment_index] + NUM_ATL03_SEGS_IN_ATL08_SEG
                        <= atl03_segment
                {
                    atl08_segment_index += 1;
                }
            }

            let segment_count = region.segment_ph_cnt[segment_index];
            for atl03_count in 1..=segment_count {
                while atl08_photon < num_classed
                    && self.atl08_segment_id[atl08_photon] < atl03_segment
                {
                    atl08_photon += 1;
                }
                while atl08_photon < num_classed
                    && self.atl08_segment_id[atl08_photon] == atl03_segment
                    && self.atl08_pc_indx[atl08_photon] < atl03_count
                {
                    atl08_photon += 1;
                }

                let matched = atl08_photon < num_classed
                    && self.atl08_segment_id[atl08_photon] == atl03_segment
                    && self.atl08_pc_indx[atl08_photon] == atl03_count;

                if matched {
                    self.classification[atl03_photon] = self.atl08_pc_flag[atl08_photon];

                    if self.phoreal {
                        self.populate_phoreal(
                            atl03_photon,
                            atl08_photon,
                            atl08_segment_index,
                            segment_index,
                            atl03,
                            parms,
                            beam,
                        );
                    }

                    if let Some(indices) = self.anc_seg_indices.as_mut() {
                        indices[atl03_photon] = atl08_segment_index as i32;
                    }

                    atl08_photon += 1;
                }

                atl03_photon += 1;
            }
        }

        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn populate_phoreal(
        &mut self,
        atl03_photon: usize,
        atl08_photon: usize,
        atl08_segment_index: usize,
        segment_index: usize,
        atl03: &Atl03Data,
        parms: &SubsetParms,
        beam: Beam,
    ) {
        let relief = self.atl08_ph_h.as_ref().expect("phoreal without ph_h")[atl08_photon];
        let (landcover, snowcover) = {
            let landcover_col = self
                .segment_landcover
                .as_ref()
                .expect("phoreal without landcover");
            let snowcover_col = self
                .segment_snowcover
                .as_ref()
                .expect("phoreal without snowcover");
            if atl08_segment_index < landcover_col.len() {
                (
                    landcover_col[atl08_segment_index],
                    snowcover_col[atl08_segment_index],
                )
            } else {
                (INVALID_FLAG, INVALID_FLAG)
            }
        };
        self.relief.as_mut().expect("phoreal relief")[atl03_photon] = relief;
        self.landcover.as_mut().expect("phoreal landcover")[atl03_photon] = landcover;
        self.snowcover.as_mut().expect("phoreal snowcover")[atl03_photon] = snowcover;

        // ABoVE reassignment: night-time strong-spot high-confidence
        // returns with low relief count as top of canopy.
        if parms.phoreal.above_classifier
            && self.classification[atl03_photon] != ATL08_TOP_OF_CANOPY
        {
            let spot = beam.spot(atl03.sc_orient[0]);
            if atl03.solar_elevation[segment_index] <= 5.0
                && (spot == 1 || spot == 3 || spot == 5)
                && atl03.signal_conf_ph[atl03_photon] == CNF_SURFACE_HIGH
                && (0.0..35.0).contains(&relief)
            {
                self.classification[atl03_photon] = ATL08_TOP_OF_CANOPY;
            }
        }
    }

    /// Classification of the given primary photon.
    pub fn class_of(&self, photon: usize) -> u8 {
        self.classification[photon]
    }

    /// Whether PhoREAL per-photon fields were produced.
    pub fn has_phoreal(&self) -> bool {
        self.phoreal
    }

    /// Relief of the given photon, honoring `use_abs_h`.
    pub fn relief_of(&self, photon: usize, atl03: &Atl03Data, parms: &SubsetParms) -> f32 {
        if !self.phoreal {
            return 0.0;
        }
        if parms.phoreal.use_abs_h {
            atl03.h_ph[photon]
        } else {
            self.relief.as_ref().expect("phoreal relief")[photon]
        }
    }

    /// Landcover flag of the given photon.
    pub fn landcover_of(&self, photon: usize) -> u8 {
        self.landcover
            .as_ref()
            .map_or(INVALID_FLAG, |flags| flags[photon])
    }

    /// Snowcover flag of the given photon.
    pub fn snowcover_of(&self, photon: usize) -> u8 {
        self.snowcover
            .as_ref()
            .map_or(INVALID_FLAG, |flags| flags[photon])
    }

    /// Land-segment index of the given photon for the ancillary join.
    pub fn anc_index_of(&self, photon: usize) -> i32 {
        self.anc_seg_indices
            .as_ref()
            .map_or(models::INVALID_INDEX, |indices| indices[photon])
    }
}
