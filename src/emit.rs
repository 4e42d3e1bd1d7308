//! Extent record materialization and posting.
//!
//! The emitter turns a collected extent into an extent record plus up to
//! three ancillary element-array records, wraps multiples in a container
//! record, and posts the result with retry-on-full while the request is
//! active.

use crate::atl03::Atl03Data;
use crate::atl08::Atl08Data;
use crate::column::LazyAnyColumn;
use crate::extent::TrackState;
use crate::metrics::ReaderStats;
use crate::models::{SubsetParms, SEGMENT_LENGTH};
use crate::queue::{PostStatus, Publisher, SYS_TIMEOUT};
use crate::records::{
    self, AncElementHeader, ExtentHeader, Record, ANC_TYPE_ATL08, ANC_TYPE_EXTENT,
    ANC_TYPE_PHOTON,
};
use crate::resource::{Beam, ResourceDescriptor};

use bytes::{BufMut, BytesMut};
use hashbrown::HashMap;
use std::mem::size_of;
use std::sync::atomic::{AtomicBool, Ordering};
use zerocopy::AsBytes;

/// Builds and posts the records of one beam's extents.
pub struct ExtentEmitter<'a> {
    pub parms: &'a SubsetParms,
    pub descriptor: &'a ResourceDescriptor,
    pub beam: Beam,
    pub queue: &'a Publisher,
    pub active: &'a AtomicBool,
}

impl ExtentEmitter<'_> {
    /// Materialize the current extent and post it.
    pub async fn emit(
        &self,
        state: &mut TrackState,
        atl03: &Atl03Data,
        atl08: Option<&Atl08Data>,
        extent_counter: u32,
        stats: &mut ReaderStats,
    ) {
        let extent_id = self.descriptor.extent_id(self.beam, extent_counter);

        let header = ExtentHeader {
            extent_id,
            rgt: self.descriptor.rgt,
            cycle: self.descriptor.cycle,
            segment_id: self.segment_id(state, atl03),
            segment_distance: state.seg_distance,
            extent_length: state.extent_length,
            background_rate: background_rate(state, atl03),
            solar_elevation: atl03.solar_elevation[state.extent_segment],
            spacecraft_velocity: atl03.spacecraft_velocity(state.extent_segment) as f32,
            track: self.beam.track,
            pair: self.beam.pair,
            sc_orient: atl03.sc_orient[0],
            valid: state.extent_valid as u8,
            photon_count: state.extent_photons.len() as u32,
        };

        let mut rec_list = vec![records::extent_record(&header, &state.extent_photons)];

        if let (Some(indices), Some(dict)) =
            (state.photon_indices.as_ref(), atl03.anc_ph_data.as_ref())
        {
            let indices: Vec<i64> = indices.iter().map(|&index| index as i64).collect();
            ancillary_records(
                extent_id,
                &self.parms.atl03_ph_fields,
                dict,
                ANC_TYPE_PHOTON,
                &indices,
                &mut rec_list,
            );
        }
        if let (Some(indices), Some(dict)) =
            (state.segment_indices.as_ref(), atl03.anc_geo_data.as_ref())
        {
            let indices: Vec<i64> = indices.iter().map(|&index| index as i64).collect();
            ancillary_records(
                extent_id,
                &self.parms.atl03_geo_fields,
                dict,
                ANC_TYPE_EXTENT,
                &indices,
                &mut rec_list,
            );
        }
        if let (Some(indices), Some(dict)) = (
            state.atl08_indices.as_ref(),
            atl08.and_then(|atl08| atl08.anc_seg_data.as_ref()),
        ) {
            let indices: Vec<i64> = indices.iter().map(|&index| index as i64).collect();
            ancillary_records(
                extent_id,
                &self.parms.atl08_fields,
                dict,
                ANC_TYPE_ATL08,
                &indices,
                &mut rec_list,
            );
        }

        if rec_list.len() == 1 {
            self.post_record(&rec_list[0], stats).await;
        } else {
            let container = records::container_record(&rec_list);
            self.post_record(&container, stats).await;
        }
    }

    /// Post one record, retrying on a full queue while the request is
    /// active.
    ///
    /// A cancelled request never posts: the active flag gates every
    /// attempt, so the record falls straight through to the dropped
    /// count.
    pub async fn post_record(&self, record: &Record, stats: &mut ReaderStats) {
        let frame = record.frame();
        let mut status = PostStatus::Timeout;
        while self.active.load(Ordering::Relaxed) {
            status = self.queue.post(frame.clone(), SYS_TIMEOUT).await;
            if status != PostStatus::Timeout {
                break;
            }
            stats.extents_retried += 1;
        }

        if status == PostStatus::Ok {
            stats.extents_sent += 1;
        } else {
            tracing::error!(
                rec_type = record.rec_type,
                ?status,
                "failed to post record to output queue"
            );
            stats.extents_dropped += 1;
        }
    }

    /// Closest ATL06-style segment id represented by the extent.
    fn segment_id(&self, state: &TrackState, atl03: &Atl03Data) -> u32 {
        let mut segment_id = atl03.segment_id[state.extent_segment] as f64;
        if !self.parms.dist_in_seg {
            // Portion of the first segment ahead of the first photon plus
            // half the extent length, truncated to whole segments.
            segment_id += state.start_seg_portion;
            segment_id += ((self.parms.extent_length / SEGMENT_LENGTH) / 2.0).trunc();
        } else {
            segment_id += (self.parms.extent_length / 2.0).trunc();
        }
        // Round half up.
        (segment_id + 0.5) as u32
    }
}

/// Piecewise-linear background rate at the extent's segment time.
///
/// The table cursor only moves forward; outside the table the nearest
/// endpoint is used.
fn background_rate(state: &mut TrackState, atl03: &Atl03Data) -> f64 {
    if atl03.bckgrd_rate.is_empty() {
        return 0.0;
    }
    let mut background_rate = atl03.bckgrd_rate[atl03.bckgrd_rate.len() - 1];
    while state.bckgrd_in < atl03.bckgrd_rate.len() {
        let curr_bckgrd_time = atl03.bckgrd_delta_time[state.bckgrd_in];
        let segment_time = atl03.segment_delta_time[state.extent_segment];
        if curr_bckgrd_time >= segment_time {
            if state.bckgrd_in > 0 {
                let prev_bckgrd_time = atl03.bckgrd_delta_time[state.bckgrd_in - 1];
                let prev_bckgrd_rate = atl03.bckgrd_rate[state.bckgrd_in - 1];
                let curr_bckgrd_rate = atl03.bckgrd_rate[state.bckgrd_in];

                let run = curr_bckgrd_time - prev_bckgrd_time;
                let rise = curr_bckgrd_rate - prev_bckgrd_rate;
                let delta = segment_time - prev_bckgrd_time;
                background_rate = (rise / run) * delta + prev_bckgrd_rate;
            } else {
                background_rate = atl03.bckgrd_rate[0];
            }
            break;
        }
        state.bckgrd_in += 1;
    }
    background_rate
}

/// Append one ancillary element-array record per requested field.
///
/// Negative indices mark photons with no source row; their elements are
/// filled with 0xFF bytes of the element width.
fn ancillary_records(
    extent_id: u64,
    fields: &[String],
    dict: &HashMap<String, LazyAnyColumn>,
    anc_type: u8,
    indices: &[i64],
    rec_list: &mut Vec<Record>,
) {
    for (field_index, field) in fields.iter().enumerate() {
        let Some(column) = dict.get(field) else {
            continue;
        };
        let data = column.data();
        let element_size = data.dtype().size();

        let header = AncElementHeader {
            extent_id,
            num_elements: indices.len() as u32,
            anc_type,
            field_index: field_index as u8,
            data_type: data.dtype().code(),
        };
        let mut payload =
            BytesMut::with_capacity(size_of::<AncElementHeader>() + element_size * indices.len());
        payload.put_slice(header.as_bytes());
        let mut raw = Vec::with_capacity(element_size * indices.len());
        for &index in indices {
            if index >= 0 {
                data.extend_element_bytes(index as usize, &mut raw);
            } else {
                raw.extend(std::iter::repeat(0xFF).take(element_size));
            }
        }
        payload.put_slice(&raw);
        rec_list.push(Record::new(records::ANC_ELEMENT_REC_TYPE, payload.freeze()));
    }
}
