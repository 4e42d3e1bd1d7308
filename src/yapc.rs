//! YAPC photon density scoring.
//!
//! Both variants assign each photon a density score in 0..=255 from its
//! nearest neighbors inside an along-track by height window. V3 walks
//! the distance-sorted photon stream outward from each photon with a
//! dynamic neighbor count; V2 works segment by segment with a bounded
//! top-k set over a window buffer of the neighboring segments.
//!
//! The V2 arithmetic is numerically delicate; the order of operations is
//! kept exactly as the reference algorithm performs them.

use crate::atl03::Atl03Data;
use crate::error::SubsetError;
use crate::models::{SubsetParms, YapcConfig};
use crate::region::Region;

/// V2 guard against degenerate height spreads, in meters.
const MAXIMUM_HSPREAD: f64 = 15000.0;
/// V2 height bin size, in meters.
const HSPREAD_BINSIZE: f64 = 1.0;
/// V2 upper bound on the neighbor count.
const MAX_KNN: usize = 25;

/// Per-photon density scores, present when the YAPC stage is enabled.
pub struct YapcScore {
    score: Option<Vec<u8>>,
}

impl YapcScore {
    /// Run the configured scorer over the beam's photons.
    pub fn new(
        parms: &SubsetParms,
        region: &Region,
        atl03: &Atl03Data,
    ) -> Result<Self, SubsetError> {
        if !parms.stages.yapc {
            return Ok(YapcScore { score: None });
        }
        let score = match parms.yapc.version {
            3 => score_v3(&parms.yapc, region, atl03),
            1 | 2 => score_v2(parms, region, atl03),
            version => return Err(SubsetError::InvalidVersion(version)),
        };
        Ok(YapcScore { score: Some(score) })
    }

    pub fn enabled(&self) -> bool {
        self.score.is_some()
    }

    /// Score of the given photon; 0 when the stage is disabled.
    pub fn of(&self, photon: usize) -> u8 {
        self.score.as_ref().map_or(0, |scores| scores[photon])
    }
}

/// V3: linear-scan kNN over the distance-sorted photon stream.
fn score_v3(yapc: &YapcConfig, region: &Region, atl03: &Atl03Data) -> Vec<u8> {
    let h_wx = yapc.win_x / 2.0;
    let h_wz = yapc.win_h / 2.0;
    let num_segments = atl03.segment_id.len();
    let num_photons = atl03.dist_ph_along.len();
    let mut score = vec![0u8; num_photons];

    // Along-track distance of every photon from the window origin.
    let mut ph_dist = vec![0.0f64; num_photons];
    let mut ph_index = 0usize;
    for segment_index in 0..num_segments {
        for _ in 0..region.segment_ph_cnt[segment_index] {
            ph_dist[ph_index] =
                atl03.segment_dist_x[segment_index] + atl03.dist_ph_along[ph_index] as f64;
            ph_index += 1;
        }
    }

    ph_index = 0;
    for segment_index in 0..num_segments {
        let count = region.segment_ph_cnt[segment_index] as usize;
        let mut weights = vec![0.0f64; count];
        let mut max_knn = yapc.min_knn;
        let start_ph_index = ph_index;

        for weight in weights.iter_mut() {
            let mut proximities: Vec<f64> = Vec::new();

            // Nearest neighbors to the left. A photon stays a candidate
            // for one extra meter past the window so ties on the boundary
            // are not order dependent.
            let mut neighbor = ph_index;
            while neighbor > 0 {
                neighbor -= 1;
                let x_dist = ph_dist[ph_index] - ph_dist[neighbor];
                if x_dist <= h_wx {
                    let proximity =
                        (atl03.h_ph[ph_index] as f64 - atl03.h_ph[neighbor] as f64).abs();
                    if proximity <= h_wz {
                        proximities.push(proximity);
                    }
                }
                if x_dist >= h_wx + 1.0 {
                    break;
                }
            }

            // Nearest neighbors to the right.
            let mut neighbor = ph_index + 1;
            while neighbor < num_photons {
                let x_dist = ph_dist[neighbor] - ph_dist[ph_index];
                if x_dist <= h_wx {
                    let proximity =
                        (atl03.h_ph[ph_index] as f64 - atl03.h_ph[neighbor] as f64).abs();
                    if proximity <= h_wz {
                        proximities.push(proximity);
                    }
                }
                if x_dist >= h_wx + 1.0 {
                    break;
                }
                neighbor += 1;
            }

            proximities.sort_by(|a, b| a.total_cmp(b));

            let knn = ((proximities.len() as f64).sqrt() as usize).max(yapc.min_knn);
            if knn > max_knn {
                max_knn = knn;
            }

            let num_nearest = knn.min(proximities.len());
            *weight = proximities[..num_nearest]
                .iter()
                .map(|proximity| h_wz - proximity)
                .sum();
            ph_index += 1;
        }

        // Normalize against the largest neighbor count seen in the
        // segment, so a lone dense cluster does not saturate everything.
        for (offset, weight) in weights.iter().enumerate() {
            let normalized = weight / (h_wz * max_knn as f64);
            score[start_ph_index + offset] = (normalized * 255.0).min(255.0) as u8;
        }
    }

    score
}

/// V2: per-segment windowed kNN with a bin-derived height span.
fn score_v2(parms: &SubsetParms, region: &Region, atl03: &Atl03Data) -> Vec<u8> {
    let settings = &parms.yapc;
    let num_segments = atl03.segment_id.len();
    let num_photons = atl03.dist_ph_along.len();
    let mut score = vec![0u8; num_photons];
    let mut nearest_neighbors = [0.0f64; MAX_KNN];

    let mut ph_b0 = 0usize; // buffer start: first photon of the previous segment
    let mut ph_c0 = 0usize; // center start
    let mut ph_c1 = 0usize; // center end

    for segment_index in 0..num_segments {
        ph_b0 += if segment_index > 1 {
            region.segment_ph_cnt[segment_index - 2] as usize
        } else {
            0
        };
        ph_c0 += if segment_index > 0 {
            region.segment_ph_cnt[segment_index - 1] as usize
        } else {
            0
        };
        ph_c1 += region.segment_ph_cnt[segment_index] as usize;
        // Buffer end: last photon of the following segment.
        let ph_b1 = ph_c1
            + if segment_index < num_segments - 1 {
                region.segment_ph_cnt[segment_index + 1] as usize
            } else {
                0
            };

        let count = region.segment_ph_cnt[segment_index] as usize;
        let knn = if settings.knn != 0 {
            settings.knn
        } else {
            (((count as f64).sqrt() + 0.5) / 2.0).max(1.0) as usize
        };
        let knn = knn.min(MAX_KNN);

        if count <= knn || count < parms.minimum_photon_count {
            continue;
        }

        // Height and distance spread over the center segment.
        let mut min_h = atl03.h_ph[ph_c0] as f64;
        let mut max_h = min_h;
        let mut min_x = atl03.dist_ph_along[ph_c0] as f64;
        let mut max_x = min_x;
        for photon in ph_c0 + 1..ph_c1 {
            let h = atl03.h_ph[photon] as f64;
            let x = atl03.dist_ph_along[photon] as f64;
            min_h = min_h.min(h);
            max_h = max_h.max(h);
            min_x = min_x.min(x);
            max_x = max_x.max(x);
        }
        let hspread = max_h - min_h;
        let xspread = max_x - min_x;

        if hspread <= 0.0 || hspread > MAXIMUM_HSPREAD || xspread <= 0.0 {
            tracing::error!(
                hspread,
                xspread,
                "unable to perform YAPC selection due to invalid photon spread"
            );
            continue;
        }

        // Bin heights to find the occupied span, discounting telemetry
        // gaps.
        let num_bins = (hspread / HSPREAD_BINSIZE) as usize + 1;
        let mut bins = vec![false; num_bins];
        for photon in ph_c0..ph_c1 {
            let bin = ((atl03.h_ph[photon] as f64 - min_h) / HSPREAD_BINSIZE) as usize;
            bins[bin.min(num_bins - 1)] = true;
        }
        let nonzero_bins = bins.iter().filter(|bin| **bin).count();

        let h_span = (nonzero_bins as f64 * HSPREAD_BINSIZE) / count as f64 * knn as f64;
        let half_win_x = settings.win_x / 2.0;
        let half_win_h = if settings.win_h != 0.0 {
            settings.win_h / 2.0
        } else {
            h_span / 2.0
        };

        for center in ph_c0..ph_c1 {
            let mut smallest_nearest_neighbor = f64::MAX;
            let mut smallest_nearest_neighbor_index = 0usize;
            let mut num_nearest_neighbors = 0usize;

            for neighbor in ph_b0..ph_b1 {
                if neighbor == center {
                    continue;
                }
                let delta_x =
                    (atl03.dist_ph_along[neighbor] as f64 - atl03.dist_ph_along[center] as f64)
                        .abs();
                if delta_x > half_win_x {
                    continue;
                }

                let delta_h =
                    (atl03.h_ph[neighbor] as f64 - atl03.h_ph[center] as f64).abs();
                let proximity = half_win_h - delta_h;

                if num_nearest_neighbors < knn {
                    if proximity < smallest_nearest_neighbor {
                        smallest_nearest_neighbor = proximity;
                        smallest_nearest_neighbor_index = num_nearest_neighbors;
                    }
                    nearest_neighbors[num_nearest_neighbors] = proximity;
                    num_nearest_neighbors += 1;
                } else if proximity > smallest_nearest_neighbor {
                    // Replace the current smallest and rescan for the new
                    // smallest.
                    nearest_neighbors[smallest_nearest_neighbor_index] = proximity;
                    smallest_nearest_neighbor = proximity;
                    for k in 0..knn {
                        if nearest_neighbors[k] < smallest_nearest_neighbor {
                            smallest_nearest_neighbor = nearest_neighbors[k];
                            smallest_nearest_neighbor_index = k;
                        }
                    }
                }
            }

            for slot in nearest_neighbors.iter_mut().take(knn).skip(num_nearest_neighbors) {
                *slot = 0.0;
            }

            let mut nearest_neighbor_sum = 0.0f64;
            for &proximity in nearest_neighbors.iter().take(knn) {
                if proximity > 0.0 {
                    nearest_neighbor_sum += proximity;
                }
            }
            nearest_neighbor_sum /= knn as f64;

            score[center] = ((nearest_neighbor_sum / half_win_h) * 255.0).min(255.0) as u8;
        }
    }

    score
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Stages;
    use crate::test_utils::{atl03_granule, PhotonSpec, SegmentSpec};

    const PREFIX: &str = "/gt1l";

    fn yapc_parms(version: u8) -> SubsetParms {
        SubsetParms {
            stages: Stages {
                yapc: true,
                ..Stages::default()
            },
            yapc: YapcConfig {
                version,
                min_knn: 1,
                ..YapcConfig::default()
            },
            minimum_photon_count: 0,
            ..SubsetParms::default()
        }
    }

    async fn score(segments: &[SegmentSpec], parms: &SubsetParms) -> YapcScore {
        let source = atl03_granule(PREFIX, segments).build();
        let region = Region::new(&source, PREFIX, parms).await.unwrap();
        let atl03 = Atl03Data::new(&source, PREFIX, &region, parms)
            .await
            .unwrap();
        YapcScore::new(parms, &region, &atl03).unwrap()
    }

    #[tokio::test]
    async fn disabled_stage_scores_nothing() {
        let segments = vec![SegmentSpec::new(1, 0.0).photons(vec![PhotonSpec::at(0.0, 0.0)])];
        let yapc = score(&segments, &SubsetParms::default()).await;
        assert!(!yapc.enabled());
        assert_eq!(0, yapc.of(0));
    }

    #[tokio::test]
    async fn invalid_version_is_rejected() {
        let mut parms = yapc_parms(3);
        parms.yapc.version = 4;
        let segments = vec![SegmentSpec::new(1, 0.0).photons(vec![PhotonSpec::at(0.0, 0.0)])];
        let source = atl03_granule(PREFIX, &segments).build();
        let region = Region::new(&source, PREFIX, &parms).await.unwrap();
        let atl03 = Atl03Data::new(&source, PREFIX, &region, &parms)
            .await
            .unwrap();
        let result = YapcScore::new(&parms, &region, &atl03);
        assert!(matches!(result, Err(SubsetError::InvalidVersion(4))));
    }

    #[tokio::test]
    async fn v3_close_pair_scores_positive() {
        let segments = vec![SegmentSpec::new(1, 0.0).photons(vec![
            PhotonSpec::at(0.0, 0.0),
            PhotonSpec::at(0.5, 0.1),
        ])];
        let yapc = score(&segments, &yapc_parms(3)).await;
        assert!(yapc.enabled());
        assert!(yapc.of(0) > 0);
        assert!(yapc.of(1) > 0);
    }

    #[tokio::test]
    async fn v3_identical_photons_score_identically() {
        let photons: Vec<PhotonSpec> = (0..10).map(|_| PhotonSpec::at(1.0, 5.0)).collect();
        let segments = vec![SegmentSpec::new(1, 0.0).photons(photons)];
        let yapc = score(&segments, &yapc_parms(3)).await;
        let first = yapc.of(0);
        assert!(first > 0);
        for photon in 1..10 {
            assert!((yapc.of(photon) as i16 - first as i16).abs() <= 1);
        }
    }

    #[tokio::test]
    async fn v3_isolated_photon_scores_zero() {
        let segments = vec![SegmentSpec::new(1, 0.0).photons(vec![
            PhotonSpec::at(0.0, 0.0),
            PhotonSpec::at(10.0, 2000.0),
        ])];
        let yapc = score(&segments, &yapc_parms(3)).await;
        // No neighbor inside the height window: weight stays zero.
        assert_eq!(0, yapc.of(1));
    }

    #[tokio::test]
    async fn v3_dense_cluster_outscores_outlier() {
        let mut photons: Vec<PhotonSpec> =
            (0..8).map(|i| PhotonSpec::at(i as f32 * 0.2, 10.0)).collect();
        photons.push(PhotonSpec::at(3.0, 12.9));
        let segments = vec![SegmentSpec::new(1, 0.0).photons(photons)];
        let yapc = score(&segments, &yapc_parms(3)).await;
        assert!(yapc.of(0) > yapc.of(8));
    }

    #[tokio::test]
    async fn v2_cluster_outscores_outlier() {
        // A tight cluster at 10 m and one photon far above it; spread in
        // both axes keeps the segment valid.
        let mut photons: Vec<PhotonSpec> = (0..9)
            .map(|i| PhotonSpec::at(i as f32, 10.0 + 0.1 * (i % 3) as f32))
            .collect();
        photons.push(PhotonSpec::at(4.5, 40.0));
        let segments = vec![SegmentSpec::new(1, 0.0).photons(photons)];
        let mut parms = yapc_parms(2);
        parms.yapc.knn = 3;
        parms.yapc.win_h = 6.0;
        let yapc = score(&segments, &parms).await;
        assert!(yapc.of(0) > yapc.of(9));
        assert_eq!(0, yapc.of(9));
    }

    #[tokio::test]
    async fn v2_flat_segment_is_skipped() {
        // Zero height spread: the scorer logs and leaves the segment
        // unscored.
        let photons: Vec<PhotonSpec> = (0..6).map(|i| PhotonSpec::at(i as f32, 7.0)).collect();
        let segments = vec![SegmentSpec::new(1, 0.0).photons(photons)];
        let yapc = score(&segments, &yapc_parms(2)).await;
        for photon in 0..6 {
            assert_eq!(0, yapc.of(photon));
        }
    }

    #[tokio::test]
    async fn v2_uses_neighbor_segments_as_buffer() {
        // The lone center photon has all its neighbors in the adjacent
        // segments.
        let segments = vec![
            SegmentSpec::new(1, 0.0).photons(vec![
                PhotonSpec::at(18.0, 10.0),
                PhotonSpec::at(19.0, 10.1),
            ]),
            SegmentSpec::new(2, 20.0).photons(vec![
                PhotonSpec::at(0.5, 10.0),
                PhotonSpec::at(1.0, 10.2),
                PhotonSpec::at(2.0, 10.4),
            ]),
            SegmentSpec::new(3, 40.0).photons(vec![PhotonSpec::at(1.0, 10.3)]),
        ];
        let mut parms = yapc_parms(2);
        parms.yapc.knn = 2;
        parms.yapc.win_h = 6.0;
        parms.yapc.win_x = 50.0;
        let yapc = score(&segments, &parms).await;
        assert!(yapc.of(2) > 0);
        assert!(yapc.of(3) > 0);
    }

    #[tokio::test]
    async fn scores_stay_in_range() {
        let photons: Vec<PhotonSpec> = (0..20)
            .map(|i| PhotonSpec::at((i % 5) as f32, (i % 4) as f32 * 0.5))
            .collect();
        let segments = vec![SegmentSpec::new(1, 0.0).photons(photons)];
        for version in [2, 3] {
            let yapc = score(&segments, &yapc_parms(version)).await;
            for photon in 0..20 {
                // u8 already bounds the score; spot-check the weights did
                // not wrap.
                assert!(yapc.of(photon) <= 255);
            }
        }
    }
}
