//! Along-track sliding-window walk.
//!
//! The windower advances a cursor set over the beam's photons, applying
//! the per-photon filter chain and collecting accepted photons into the
//! current extent. Length and step are independent policies, each in
//! meters or whole segments; an extent closes once the photon stream
//! passes both the extent length and the next extent's step.

use crate::atl03::Atl03Data;
use crate::atl08::Atl08Data;
use crate::error::SubsetError;
use crate::models::{
    SubsetParms, CNF_POSSIBLE_TEP, CNF_SURFACE_HIGH, INVALID_FLAG, NUM_ATL08_CLASSES,
    QUALITY_NOMINAL, QUALITY_POSSIBLE_TEP, SEGMENT_LENGTH,
};
use crate::records::PhotonRecord;
use crate::region::Region;
use crate::yapc::YapcScore;

/// Unix timestamp of the ATLAS SDP epoch (2018-01-01T00:00:00Z).
const ATLAS_SDP_EPOCH_UNIX_S: f64 = 1_514_764_800.0;

/// Convert an ATLAS delta time in seconds to a Unix nanosecond
/// timestamp.
pub fn delta_time_to_unix_ns(delta_time: f64) -> i64 {
    ((ATLAS_SDP_EPOCH_UNIX_S + delta_time) * 1e9) as i64
}

/// Cursor set of one beam's walk.
pub struct TrackState {
    /// First photon of the next extent.
    pub ph_in: usize,
    /// Segment of the next extent's first photon.
    pub seg_in: usize,
    /// Photons of `seg_in` already consumed before `ph_in`.
    pub seg_ph: u32,
    /// Segment the running start distance is anchored to.
    pub start_segment: usize,
    /// Along-track distance of the current extent's start.
    pub start_distance: f64,
    /// Along-track distance of the current extent's center.
    pub seg_distance: f64,
    /// Fraction of the first segment ahead of the extent's first photon.
    pub start_seg_portion: f64,
    /// First segment of the current extent.
    pub extent_segment: usize,
    pub extent_valid: bool,
    /// Extent length in meters, whatever units the request used.
    pub extent_length: f64,
    pub track_complete: bool,
    /// Cursor into the background-rate table.
    pub bckgrd_in: usize,
    pub extent_photons: Vec<PhotonRecord>,
    /// Segment index per accepted photon, for ancillary extent fields.
    pub segment_indices: Option<Vec<usize>>,
    /// Photon index per accepted photon, for ancillary photon fields.
    pub photon_indices: Option<Vec<usize>>,
    /// Land-segment index per accepted photon, for ancillary ATL08
    /// fields.
    pub atl08_indices: Option<Vec<i32>>,
}

impl TrackState {
    pub fn new(atl03: &Atl03Data, atl08: Option<&Atl08Data>, parms: &SubsetParms) -> Self {
        let mut extent_length = parms.extent_length;
        if parms.dist_in_seg {
            extent_length *= SEGMENT_LENGTH;
        }
        TrackState {
            ph_in: 0,
            seg_in: 0,
            seg_ph: 0,
            start_segment: 0,
            start_distance: atl03.segment_dist_x[0],
            seg_distance: 0.0,
            start_seg_portion: 0.0,
            extent_segment: 0,
            extent_valid: true,
            extent_length,
            track_complete: false,
            bckgrd_in: 0,
            extent_photons: Vec::new(),
            segment_indices: atl03.anc_geo_data.is_some().then(Vec::new),
            photon_indices: atl03.anc_ph_data.is_some().then(Vec::new),
            atl08_indices: atl08
                .map_or(false, |atl08| atl08.anc_seg_data.is_some())
                .then(Vec::new),
        }
    }
}

/// The sliding-window state machine of one beam.
pub struct Windower<'a> {
    pub parms: &'a SubsetParms,
    pub region: &'a Region,
    pub atl03: &'a Atl03Data,
    pub atl08: Option<&'a Atl08Data>,
    pub yapc: &'a YapcScore,
}

impl<'a> Windower<'a> {
    /// Collect the next extent into `state`.
    ///
    /// On return either `state.extent_photons` holds the extent's
    /// accepted photons and the cursors point at the next extent, or
    /// `state.track_complete` is set and the current extent is the last.
    pub fn next_extent(&self, state: &mut TrackState) -> Result<(), SubsetError> {
        let atl03 = self.atl03;
        let num_photons = atl03.dist_ph_along.len();
        let mut current_photon = state.ph_in;
        let mut current_segment = state.seg_in;
        let mut current_count = state.seg_ph;
        let mut extent_complete = false;
        let mut step_complete = false;

        state.start_seg_portion = atl03.dist_ph_along[state.ph_in] as f64 / SEGMENT_LENGTH;
        state.extent_segment = state.seg_in;
        state.extent_valid = true;
        state.extent_photons.clear();
        if let Some(indices) = state.segment_indices.as_mut() {
            indices.clear();
        }
        if let Some(indices) = state.photon_indices.as_mut() {
            indices.clear();
        }
        if let Some(indices) = state.atl08_indices.as_mut() {
            indices.clear();
        }

        while !extent_complete || !step_complete {
            // Advance to the photon's segment.
            current_count += 1;
            while current_segment < self.region.segment_ph_cnt.len()
                && current_count > self.region.segment_ph_cnt[current_segment]
            {
                current_count = 1;
                current_segment += 1;
            }

            if current_segment >= atl03.segment_dist_x.len() {
                tracing::error!(
                    segment = current_segment,
                    segments = atl03.segment_dist_x.len(),
                    "photons with no segment detected"
                );
                state.track_complete = true;
                break;
            }

            let delta_distance = atl03.segment_dist_x[current_segment] - state.start_distance;
            let x_atc = delta_distance + atl03.dist_ph_along[current_photon] as f64;
            let along_track_segments = (current_segment - state.extent_segment) as f64;

            // The first photon at or past the step opens the next extent.
            if !step_complete
                && ((!self.parms.dist_in_seg && x_atc >= self.parms.extent_step)
                    || (self.parms.dist_in_seg && along_track_segments >= self.parms.extent_step))
            {
                state.ph_in = current_photon;
                state.seg_in = current_segment;
                state.seg_ph = current_count - 1;
                step_complete = true;
            }

            if (!self.parms.dist_in_seg && x_atc < self.parms.extent_length)
                || (self.parms.dist_in_seg && along_track_segments < self.parms.extent_length)
            {
                if let Some(photon) =
                    self.screen_photon(current_photon, current_segment, x_atc, state.extent_length)?
                {
                    state.extent_photons.push(photon);
                    if let Some(indices) = state.segment_indices.as_mut() {
                        indices.push(current_segment);
                    }
                    if let Some(indices) = state.photon_indices.as_mut() {
                        indices.push(current_photon);
                    }
                    if let Some(indices) = state.atl08_indices.as_mut() {
                        indices.push(
                            self.atl08
                                .expect("atl08 ancillary without atl08 stage")
                                .anc_index_of(current_photon),
                        );
                    }
                }
            } else {
                extent_complete = true;
            }

            current_photon += 1;
            if current_photon >= num_photons {
                // End of the photon stream. If a step start was already
                // recorded the walk resumes there for one more extent;
                // otherwise the track is done.
                if !step_complete {
                    state.track_complete = true;
                }
                break;
            }
        }

        // Center of this extent, reported in the record.
        state.seg_distance = state.start_distance + state.extent_length / 2.0;

        self.advance_start(state);
        self.apply_validity_gates(state);
        Ok(())
    }

    /// Step the start distance forward for the next extent.
    fn advance_start(&self, state: &mut TrackState) {
        let atl03 = self.atl03;
        if !self.parms.dist_in_seg {
            state.start_distance += self.parms.extent_step;

            // Walk the anchor segment forward, correcting for gaps
            // between consecutive segments longer than the nominal 20 m.
            while state.start_segment + 1 < atl03.segment_dist_x.len()
                && state.start_distance >= atl03.segment_dist_x[state.start_segment + 1]
            {
                state.start_distance += atl03.segment_dist_x[state.start_segment + 1]
                    - atl03.segment_dist_x[state.start_segment];
                state.start_distance -= SEGMENT_LENGTH;
                state.start_segment += 1;
            }
        } else {
            let next_segment = state.extent_segment + self.parms.extent_step as usize;
            if next_segment < atl03.segment_dist_x.len() {
                state.start_distance = atl03.segment_dist_x[next_segment];
            }
        }
    }

    /// Photon-count and spread gates; `pass_invalid` emission is decided
    /// by the caller.
    fn apply_validity_gates(&self, state: &mut TrackState) {
        if state.extent_photons.len() < self.parms.minimum_photon_count {
            state.extent_valid = false;
        }
        if state.extent_photons.len() > 1 {
            let last = state.extent_photons.len() - 1;
            let spread =
                (state.extent_photons[last].x_atc - state.extent_photons[0].x_atc) as f64;
            if spread < self.parms.along_track_spread {
                state.extent_valid = false;
            }
        }
    }

    /// Ordered per-photon filter chain.
    ///
    /// Returns the photon record when every predicate accepts, `None`
    /// when any predicate rejects, and an error for out-of-range data.
    /// The data-validity checks are position dependent; the acceptance
    /// predicates are independent of each other.
    fn screen_photon(
        &self,
        photon: usize,
        segment: usize,
        x_atc: f64,
        extent_length: f64,
    ) -> Result<Option<PhotonRecord>, SubsetError> {
        let atl03 = self.atl03;

        let atl03_cnf = atl03.signal_conf_ph[photon];
        if !(CNF_POSSIBLE_TEP..=CNF_SURFACE_HIGH).contains(&atl03_cnf) {
            return Err(SubsetError::InvalidConf(atl03_cnf));
        }
        if !self.parms.accepts_cnf(atl03_cnf) {
            return Ok(None);
        }

        let quality_ph = atl03.quality_ph[photon];
        if !(QUALITY_NOMINAL..=QUALITY_POSSIBLE_TEP).contains(&quality_ph) {
            return Err(SubsetError::InvalidQuality(quality_ph));
        }
        if !self.parms.accepts_quality(quality_ph) {
            return Ok(None);
        }

        let mut atl08_class = crate::models::ATL08_UNCLASSIFIED;
        if let Some(atl08) = self.atl08 {
            atl08_class = atl08.class_of(photon);
            if atl08_class >= NUM_ATL08_CLASSES as u8 {
                return Err(SubsetError::InvalidClass(atl08_class));
            }
            if !self.parms.accepts_class(atl08_class) {
                return Ok(None);
            }
        }

        let mut yapc_score = 0u8;
        if self.yapc.enabled() {
            yapc_score = self.yapc.of(photon);
            if yapc_score < self.parms.yapc.score {
                return Ok(None);
            }
        }

        if let Some(mask) = self.region.inclusion_mask.as_ref() {
            if !mask[segment] {
                return Ok(None);
            }
        }

        let (relief, landcover, snowcover) = match self.atl08 {
            Some(atl08) if atl08.has_phoreal() => (
                atl08.relief_of(photon, atl03, self.parms),
                atl08.landcover_of(photon),
                atl08.snowcover_of(photon),
            ),
            _ => (0.0, INVALID_FLAG, INVALID_FLAG),
        };

        Ok(Some(PhotonRecord {
            time_ns: delta_time_to_unix_ns(atl03.delta_time[photon]),
            latitude: atl03.lat_ph[photon],
            longitude: atl03.lon_ph[photon],
            x_atc: (x_atc - extent_length / 2.0) as f32,
            y_atc: atl03.dist_ph_across[photon],
            height: atl03.h_ph[photon],
            relief,
            landcover,
            snowcover,
            atl08_class,
            atl03_cnf,
            quality_ph,
            yapc_score,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{atl03_granule, PhotonSpec, SegmentSpec};

    const PREFIX: &str = "/gt1l";

    struct Fixture {
        region: Region,
        atl03: Atl03Data,
        yapc: YapcScore,
    }

    impl Fixture {
        async fn new(segments: &[SegmentSpec], parms: &SubsetParms) -> Self {
            let source = atl03_granule(PREFIX, segments).build();
            let region = Region::new(&source, PREFIX, parms).await.unwrap();
            let atl03 = Atl03Data::new(&source, PREFIX, &region, parms)
                .await
                .unwrap();
            let yapc = YapcScore::new(parms, &region, &atl03).unwrap();
            Fixture {
                region,
                atl03,
                yapc,
            }
        }

        fn windower<'a>(&'a self, parms: &'a SubsetParms) -> Windower<'a> {
            Windower {
                parms,
                region: &self.region,
                atl03: &self.atl03,
                atl08: None,
                yapc: &self.yapc,
            }
        }

        fn collect(&self, parms: &SubsetParms) -> Vec<(Vec<f32>, f64, bool)> {
            let windower = self.windower(parms);
            let mut state = TrackState::new(&self.atl03, None, parms);
            let mut extents = Vec::new();
            while !state.track_complete {
                windower.next_extent(&mut state).unwrap();
                extents.push((
                    state.extent_photons.iter().map(|p| p.x_atc).collect(),
                    state.seg_distance,
                    state.extent_valid,
                ));
            }
            extents
        }
    }

    fn loose(parms: SubsetParms) -> SubsetParms {
        SubsetParms {
            minimum_photon_count: 1,
            along_track_spread: 0.0,
            ..parms
        }
    }

    fn four_photon_segment() -> Vec<SegmentSpec> {
        vec![SegmentSpec::new(100, 1000.0).photons(vec![
            PhotonSpec::at(5.0, 0.0),
            PhotonSpec::at(10.0, 0.0),
            PhotonSpec::at(15.0, 0.0),
            PhotonSpec::at(18.0, 0.0),
        ])]
    }

    #[tokio::test]
    async fn one_full_extent() {
        let parms = loose(SubsetParms {
            extent_length: 20.0,
            extent_step: 20.0,
            ..SubsetParms::default()
        });
        let fixture = Fixture::new(&four_photon_segment(), &parms).await;
        let extents = fixture.collect(&parms);
        assert_eq!(1, extents.len());
        assert_eq!(vec![-5.0, 0.0, 5.0, 8.0], extents[0].0);
        assert_eq!(1010.0, extents[0].1);
        assert!(extents[0].2);
    }

    #[tokio::test]
    async fn overlapping_extents_when_step_below_length() {
        let parms = loose(SubsetParms {
            extent_length: 20.0,
            extent_step: 10.0,
            ..SubsetParms::default()
        });
        let fixture = Fixture::new(&four_photon_segment(), &parms).await;
        let extents = fixture.collect(&parms);
        assert_eq!(2, extents.len());
        // First extent spans [0, 20) and is centered at 10 m.
        assert_eq!(vec![-5.0, 0.0, 5.0, 8.0], extents[0].0);
        assert_eq!(1010.0, extents[0].1);
        // Second spans [10, 30); the photon landing exactly on the step
        // boundary opens it.
        assert_eq!(vec![-10.0, -5.0, -2.0], extents[1].0);
        assert_eq!(1020.0, extents[1].1);
    }

    #[tokio::test]
    async fn confidence_filter_drops_photons() {
        let segments = vec![SegmentSpec::new(100, 0.0).photons(vec![
            PhotonSpec::at(1.0, 0.0).cnf(0),
            PhotonSpec::at(2.0, 0.0),
            PhotonSpec::at(3.0, 0.0),
        ])];
        let parms = loose(SubsetParms {
            extent_length: 20.0,
            extent_step: 20.0,
            ..SubsetParms::default()
        });
        let fixture = Fixture::new(&segments, &parms).await;
        let extents = fixture.collect(&parms);
        assert_eq!(1, extents.len());
        assert_eq!(2, extents[0].0.len());
    }

    #[tokio::test]
    async fn quality_filter_drops_photons() {
        let segments = vec![SegmentSpec::new(100, 0.0).photons(vec![
            PhotonSpec::at(1.0, 0.0).quality(2),
            PhotonSpec::at(2.0, 0.0),
        ])];
        let parms = loose(SubsetParms {
            extent_length: 20.0,
            extent_step: 20.0,
            ..SubsetParms::default()
        });
        let fixture = Fixture::new(&segments, &parms).await;
        let extents = fixture.collect(&parms);
        assert_eq!(1, extents[0].0.len());
    }

    #[tokio::test]
    async fn out_of_range_confidence_is_an_error() {
        let segments = vec![SegmentSpec::new(100, 0.0).photons(vec![
            PhotonSpec::at(1.0, 0.0).cnf(9),
        ])];
        let parms = loose(SubsetParms::default());
        let fixture = Fixture::new(&segments, &parms).await;
        let windower = fixture.windower(&parms);
        let mut state = TrackState::new(&fixture.atl03, None, &parms);
        let result = windower.next_extent(&mut state);
        assert!(matches!(result, Err(SubsetError::InvalidConf(9))));
    }

    #[tokio::test]
    async fn photon_count_gate_marks_invalid() {
        let parms = SubsetParms {
            extent_length: 20.0,
            extent_step: 20.0,
            minimum_photon_count: 5,
            along_track_spread: 0.0,
            ..SubsetParms::default()
        };
        let fixture = Fixture::new(&four_photon_segment(), &parms).await;
        let extents = fixture.collect(&parms);
        assert_eq!(1, extents.len());
        assert!(!extents[0].2);
    }

    #[tokio::test]
    async fn spread_gate_marks_invalid() {
        let segments = vec![SegmentSpec::new(100, 0.0).photons(vec![
            PhotonSpec::at(5.0, 0.0),
            PhotonSpec::at(6.0, 0.0),
        ])];
        let parms = SubsetParms {
            extent_length: 20.0,
            extent_step: 20.0,
            minimum_photon_count: 1,
            along_track_spread: 10.0,
            ..SubsetParms::default()
        };
        let fixture = Fixture::new(&segments, &parms).await;
        let extents = fixture.collect(&parms);
        assert!(!extents[0].2);
    }

    #[tokio::test]
    async fn segment_mode_windows_whole_segments() {
        let segments = vec![
            SegmentSpec::new(100, 0.0)
                .photons(vec![PhotonSpec::at(1.0, 0.0), PhotonSpec::at(2.0, 0.0)]),
            SegmentSpec::new(101, 20.0).photons(vec![PhotonSpec::at(3.0, 0.0)]),
        ];
        let parms = loose(SubsetParms {
            extent_length: 1.0,
            extent_step: 1.0,
            dist_in_seg: true,
            ..SubsetParms::default()
        });
        let fixture = Fixture::new(&segments, &parms).await;
        let extents = fixture.collect(&parms);
        assert_eq!(2, extents.len());
        // One segment per extent, photons centered on the 20 m window.
        assert_eq!(vec![-9.0, -8.0], extents[0].0);
        assert_eq!(vec![-7.0], extents[1].0);
    }

    #[tokio::test]
    async fn walk_crosses_segment_boundaries() {
        let segments = vec![
            SegmentSpec::new(100, 0.0).photons(vec![PhotonSpec::at(5.0, 0.0)]),
            SegmentSpec::new(101, 20.0).photons(vec![PhotonSpec::at(10.0, 0.0)]),
        ];
        let parms = loose(SubsetParms {
            extent_length: 40.0,
            extent_step: 40.0,
            ..SubsetParms::default()
        });
        let fixture = Fixture::new(&segments, &parms).await;
        let extents = fixture.collect(&parms);
        assert_eq!(1, extents.len());
        // Second photon sits at 30 m along track, 10 m right of center.
        assert_eq!(vec![-15.0, 10.0], extents[0].0);
    }

    #[tokio::test]
    async fn photon_totals_bounded_by_input() {
        let parms = loose(SubsetParms {
            extent_length: 20.0,
            extent_step: 10.0,
            ..SubsetParms::default()
        });
        let fixture = Fixture::new(&four_photon_segment(), &parms).await;
        let extents = fixture.collect(&parms);
        let emitted: usize = extents.iter().map(|e| e.0.len()).sum();
        // Overlapping extents may duplicate photons, but each extent
        // holds at most the input photon count.
        for extent in &extents {
            assert!(extent.0.len() <= 4);
        }
        assert!(emitted >= 4);
    }

    #[tokio::test]
    async fn filter_predicates_commute_on_valid_data() {
        // The acceptance predicates are independent; applying them in any
        // order must select the same photon set as the chain.
        let segments = vec![SegmentSpec::new(100, 0.0).photons(vec![
            PhotonSpec::at(1.0, 0.0).cnf(0),
            PhotonSpec::at(2.0, 0.0).quality(3),
            PhotonSpec::at(3.0, 0.0),
            PhotonSpec::at(4.0, 0.0).cnf(3).quality(1),
            PhotonSpec::at(5.0, 0.0).cnf(-1),
        ])];
        let mut parms = loose(SubsetParms {
            extent_length: 20.0,
            extent_step: 20.0,
            ..SubsetParms::default()
        });
        parms.atl03_cnf = [false, false, false, false, false, true, true];
        parms.quality_ph = [true, true, false, false];

        let fixture = Fixture::new(&segments, &parms).await;
        let extents = fixture.collect(&parms);
        let chain_accepted: Vec<f32> = extents[0].0.clone();

        // Conjunction of the predicates, evaluated without ordering.
        let mut expected = Vec::new();
        for (index, spec) in [(0usize, (0i8, 0i8)), (1, (4, 3)), (2, (4, 0)), (3, (3, 1)), (4, (-1, 0))]
        {
            let (cnf, quality) = spec;
            let accepted = [
                parms.accepts_cnf(cnf),
                parms.accepts_quality(quality),
            ]
            .iter()
            .all(|ok| *ok);
            if accepted {
                expected.push(fixture.atl03.dist_ph_along[index] - 10.0);
            }
        }
        assert_eq!(expected, chain_accepted);
    }
}
