//! Granule subsetting orchestration.
//!
//! A [GranuleReader] owns one subsetting request: it parses the granule
//! identity, opens the primary and (when needed) classification
//! granules, and runs one task per selected beam through the pipeline
//! Region -> Atl03Data -> (Atl08Data, YapcScore) -> Windower ->
//! ExtentEmitter. Beam failures are converted to exception records and
//! never abort the other beams; when the last beam finishes, the
//! end-of-stream terminator is posted.

use crate::atl03::Atl03Data;
use crate::atl08::Atl08Data;
use crate::column::{Archive, Asset, GranuleSource};
use crate::emit::ExtentEmitter;
use crate::error::{Severity, SubsetError};
use crate::extent::{TrackState, Windower};
use crate::metrics::ReaderStats;
use crate::models::SubsetParms;
use crate::queue::{PostStatus, Publisher, SYS_TIMEOUT};
use crate::records;
use crate::region::Region;
use crate::resource::{Beam, ResourceDescriptor};
use crate::yapc::YapcScore;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::Instrument;

/// One in-flight granule subsetting request.
pub struct GranuleReader {
    descriptor: ResourceDescriptor,
    parms: Arc<SubsetParms>,
    active: Arc<AtomicBool>,
    stats: Arc<Mutex<ReaderStats>>,
    supervisor: Option<JoinHandle<()>>,
}

/// Everything one beam task needs, cloned per beam.
struct BeamContext {
    beam: Beam,
    descriptor: ResourceDescriptor,
    parms: Arc<SubsetParms>,
    primary: Arc<dyn GranuleSource>,
    atl08_source: Option<Arc<dyn GranuleSource>>,
    queue: Publisher,
    active: Arc<AtomicBool>,
    stats: Arc<Mutex<ReaderStats>>,
}

impl GranuleReader {
    /// Start subsetting a granule.
    ///
    /// Returns once the beam tasks are launched; results stream onto
    /// `queue`. A resource name that fails to parse aborts the whole
    /// request: the error is reported on the queue and returned.
    ///
    /// # Arguments
    ///
    /// * `archive`: Archive driver
    /// * `asset`: Archive holding the granule
    /// * `resource`: Primary granule resource name
    /// * `parms`: Request parameters
    /// * `queue`: Output queue shared with the consumer
    /// * `send_terminator`: Whether to post the end-of-stream terminator
    pub async fn start(
        archive: Arc<dyn Archive>,
        asset: Asset,
        resource: &str,
        parms: Arc<SubsetParms>,
        queue: Publisher,
        send_terminator: bool,
    ) -> Result<GranuleReader, SubsetError> {
        let descriptor = match ResourceDescriptor::parse(resource) {
            Ok(descriptor) => descriptor,
            Err(error) => {
                tracing::error!(resource, %error, "failed to read global information");
                post_exception(&queue, &error, resource).await;
                if send_terminator {
                    queue.post_terminator(SYS_TIMEOUT).await;
                }
                return Err(error);
            }
        };

        let active = Arc::new(AtomicBool::new(true));
        let stats = Arc::new(Mutex::new(ReaderStats::default()));
        let primary = archive.open(&asset, resource);
        let atl08_source = parms
            .atl08_enabled()
            .then(|| archive.open(&asset, &descriptor.atl08_companion()));

        let mut handles = Vec::new();
        for beam in Beam::all().filter(|beam| parms.wants_track(beam.track)) {
            let context = BeamContext {
                beam,
                descriptor: descriptor.clone(),
                parms: Arc::clone(&parms),
                primary: Arc::clone(&primary),
                atl08_source: atl08_source.clone(),
                queue: queue.clone(),
                active: Arc::clone(&active),
                stats: Arc::clone(&stats),
            };
            handles.push(tokio::spawn(run_beam(context)));
        }

        let resource_name = resource.to_string();
        let supervisor = tokio::spawn(async move {
            for handle in handles {
                let _ = handle.await;
            }
            tracing::info!(resource = %resource_name, "completed processing resource");
            if send_terminator && queue.post_terminator(SYS_TIMEOUT).await != PostStatus::Ok {
                tracing::warn!(resource = %resource_name, "failed to post terminator");
            }
        });

        Ok(GranuleReader {
            descriptor,
            parms,
            active,
            stats,
            supervisor: Some(supervisor),
        })
    }

    /// Request cancellation. Beams finish their current windower
    /// iteration and exit; in-flight reads are bounded by the read
    /// timeout.
    pub fn stop(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    /// Wait for every beam to finish and the terminator to be posted.
    pub async fn join(&mut self) {
        if let Some(supervisor) = self.supervisor.take() {
            let _ = supervisor.await;
        }
    }

    /// Snapshot of the merged statistics.
    pub fn stats(&self) -> ReaderStats {
        *self.stats.lock().expect("stats mutex poisoned")
    }

    /// Return the merged statistics and reset them.
    pub fn take_stats(&self) -> ReaderStats {
        std::mem::take(&mut *self.stats.lock().expect("stats mutex poisoned"))
    }

    /// The parameters this request runs with.
    pub fn parms(&self) -> &SubsetParms {
        &self.parms
    }

    /// The parsed granule identity.
    pub fn descriptor(&self) -> &ResourceDescriptor {
        &self.descriptor
    }
}

impl Drop for GranuleReader {
    fn drop(&mut self) {
        self.active.store(false, Ordering::SeqCst);
    }
}

/// Run one beam to completion, converting failures to exception records.
async fn run_beam(context: BeamContext) {
    let span = tracing::info_span!(
        "beam",
        resource = %context.descriptor.name(),
        track = context.beam.track,
        pair = context.beam.pair,
    );
    async {
        let mut local_stats = ReaderStats::default();
        if let Err(error) = subset_beam(&context, &mut local_stats).await {
            match error.severity() {
                Severity::Debug => tracing::debug!(%error, "beam exited"),
                _ => tracing::error!(%error, "failure during processing"),
            }
            post_exception(&context.queue, &error, context.descriptor.name()).await;
        }
        context
            .stats
            .lock()
            .expect("stats mutex poisoned")
            .merge(&local_stats);
    }
    .instrument(span)
    .await
}

/// The beam pipeline proper.
async fn subset_beam(context: &BeamContext, stats: &mut ReaderStats) -> Result<(), SubsetError> {
    let prefix = context.beam.prefix();
    let parms = context.parms.as_ref();

    // Start the classification reads first so they overlap the region
    // and primary reads.
    let mut atl08 = match &context.atl08_source {
        Some(source) => Some(Atl08Data::new(source, &prefix, parms).await?),
        None => None,
    };

    let region = Region::new(&context.primary, &prefix, parms).await?;
    let atl03 = Atl03Data::new(&context.primary, &prefix, &region, parms).await?;
    if atl03.dist_ph_along.is_empty() || atl03.segment_dist_x.is_empty() {
        return Err(SubsetError::EmptySubset);
    }

    let yapc = YapcScore::new(parms, &region, &atl03)?;
    if let Some(atl08) = atl08.as_mut() {
        atl08.classify(&region, &atl03, parms, context.beam).await?;
    }

    stats.segments_read = region.segment_ph_cnt.len() as u64;

    let windower = Windower {
        parms,
        region: &region,
        atl03: &atl03,
        atl08: atl08.as_ref(),
        yapc: &yapc,
    };
    let emitter = ExtentEmitter {
        parms,
        descriptor: &context.descriptor,
        beam: context.beam,
        queue: &context.queue,
        active: &context.active,
    };

    let mut state = TrackState::new(&atl03, atl08.as_ref(), parms);
    let mut extent_counter = 0u32;
    while context.active.load(Ordering::Relaxed) && !state.track_complete {
        windower.next_extent(&mut state)?;
        if state.extent_valid || parms.pass_invalid {
            emitter
                .emit(&mut state, &atl03, atl08.as_ref(), extent_counter, stats)
                .await;
        } else {
            stats.extents_filtered += 1;
        }
        extent_counter += 1;
    }

    Ok(())
}

/// Post an exception record describing `error`.
async fn post_exception(queue: &Publisher, error: &SubsetError, resource: &str) {
    let message = format!("{error}: ({resource})");
    let record = records::exception_record(error.code(), error.severity(), &message);
    if queue.post(record.frame(), SYS_TIMEOUT).await != PostStatus::Ok {
        tracing::warn!(resource, %error, "failed to post exception record");
    }
}
