//! Shared test fixtures: an in-memory archive and synthetic granules.

use crate::column::{Archive, Asset, ColumnData, ColumnSlice, GranuleSource, ReadFault};

use async_trait::async_trait;
use hashbrown::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// Well-formed resource name used across the tests.
pub(crate) const TEST_RESOURCE: &str = "ATL03_20200304065221_10470605_005_01.h5";

pub(crate) fn test_asset() -> Asset {
    Asset::new(
        "icesat2",
        Url::parse("https://archive.example.com").unwrap(),
    )
}

macro_rules! map_column {
    ($data:expr, $v:ident => $body:expr) => {
        match $data {
            ColumnData::Int8($v) => ColumnData::Int8($body),
            ColumnData::UInt8($v) => ColumnData::UInt8($body),
            ColumnData::Int16($v) => ColumnData::Int16($body),
            ColumnData::UInt16($v) => ColumnData::UInt16($body),
            ColumnData::Int32($v) => ColumnData::Int32($body),
            ColumnData::UInt32($v) => ColumnData::UInt32($body),
            ColumnData::Int64($v) => ColumnData::Int64($body),
            ColumnData::UInt64($v) => ColumnData::UInt64($body),
            ColumnData::Float32($v) => ColumnData::Float32($body),
            ColumnData::Float64($v) => ColumnData::Float64($body),
        }
    };
}

struct Dataset {
    data: ColumnData,
    ncols: usize,
}

/// Builder for an in-memory granule.
pub(crate) struct TestGranuleBuilder {
    datasets: HashMap<String, Dataset>,
    delay: Option<Duration>,
    failing: HashSet<String>,
}

pub(crate) fn granule_builder() -> TestGranuleBuilder {
    TestGranuleBuilder {
        datasets: HashMap::new(),
        delay: None,
        failing: HashSet::new(),
    }
}

impl TestGranuleBuilder {
    pub fn dataset(mut self, name: &str, data: ColumnData) -> Self {
        self.datasets.insert(name.to_string(), Dataset { data, ncols: 1 });
        self
    }

    pub fn dataset_2d(mut self, name: &str, data: ColumnData, ncols: usize) -> Self {
        self.datasets
            .insert(name.to_string(), Dataset { data, ncols });
        self
    }

    pub fn f64s(self, name: &str, values: &[f64]) -> Self {
        self.dataset(name, ColumnData::Float64(values.to_vec()))
    }

    pub fn f32s(self, name: &str, values: &[f32]) -> Self {
        self.dataset(name, ColumnData::Float32(values.to_vec()))
    }

    pub fn u32s(self, name: &str, values: &[u32]) -> Self {
        self.dataset(name, ColumnData::UInt32(values.to_vec()))
    }

    pub fn u8s(self, name: &str, values: &[u8]) -> Self {
        self.dataset(name, ColumnData::UInt8(values.to_vec()))
    }

    pub fn i8s(self, name: &str, values: &[i8]) -> Self {
        self.dataset(name, ColumnData::Int8(values.to_vec()))
    }

    /// Delay every read by the given duration.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Make reads of the named dataset fail.
    pub fn fail(mut self, name: &str) -> Self {
        self.failing.insert(name.to_string());
        self
    }

    /// Tear the builder apart so its datasets can be folded into another
    /// builder.
    pub fn into_datasets(self) -> Vec<(String, ColumnData, usize)> {
        self.datasets
            .into_iter()
            .map(|(name, dataset)| (name, dataset.data, dataset.ncols))
            .collect()
    }

    pub fn build(self) -> Arc<dyn GranuleSource> {
        Arc::new(TestGranule {
            datasets: self.datasets,
            delay: self.delay,
            failing: self.failing,
        })
    }
}

/// An in-memory granule serving column slices from owned arrays.
struct TestGranule {
    datasets: HashMap<String, Dataset>,
    delay: Option<Duration>,
    failing: HashSet<String>,
}

#[async_trait]
impl GranuleSource for TestGranule {
    async fn read(&self, dataset: &str, slice: ColumnSlice) -> Result<ColumnData, ReadFault> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.contains(dataset) {
            return Err(ReadFault::Driver("injected failure".to_string()));
        }
        let entry = self
            .datasets
            .get(dataset)
            .ok_or(ReadFault::MissingDataset)?;
        Ok(match slice {
            ColumnSlice::Full => slice_rows(&entry.data, 0, None, entry.ncols),
            ColumnSlice::Rows { first, count } | ColumnSlice::AllColumns { first, count } => {
                slice_rows(&entry.data, first, count, entry.ncols)
            }
            ColumnSlice::Cell { col, first, count } => {
                slice_cell(&entry.data, col, first, count, entry.ncols)
            }
        })
    }
}

fn slice_rows(data: &ColumnData, first: usize, count: Option<usize>, ncols: usize) -> ColumnData {
    map_column!(data, v => {
        let start = (first * ncols).min(v.len());
        let end = count
            .map(|c| start + c * ncols)
            .unwrap_or(v.len())
            .min(v.len());
        v[start..end].to_vec()
    })
}

fn slice_cell(
    data: &ColumnData,
    col: usize,
    first: usize,
    count: Option<usize>,
    ncols: usize,
) -> ColumnData {
    map_column!(data, v => {
        let rows = v.len() / ncols;
        let end = count.map(|c| (first + c).min(rows)).unwrap_or(rows);
        (first.min(end)..end).map(|r| v[r * ncols + col]).collect()
    })
}

/// An archive resolving resource names to in-memory granules.
pub(crate) struct TestArchive {
    granules: HashMap<String, Arc<dyn GranuleSource>>,
}

impl TestArchive {
    pub fn new(granules: Vec<(String, Arc<dyn GranuleSource>)>) -> Arc<Self> {
        Arc::new(TestArchive {
            granules: granules.into_iter().collect(),
        })
    }
}

impl Archive for TestArchive {
    fn open(&self, _asset: &Asset, resource: &str) -> Arc<dyn GranuleSource> {
        match self.granules.get(resource) {
            Some(source) => Arc::clone(source),
            // Opening is cheap and infallible; a granule the archive does
            // not hold fails at read time, like the real driver.
            None => granule_builder().build(),
        }
    }
}

/// One synthetic geolocation segment and its photons.
#[derive(Clone, Debug)]
pub(crate) struct SegmentSpec {
    pub id: u32,
    pub dist_x: f64,
    pub lat: f64,
    pub lon: f64,
    pub delta_time: f64,
    pub solar_elevation: f32,
    pub photons: Vec<PhotonSpec>,
}

impl SegmentSpec {
    pub fn new(id: u32, dist_x: f64) -> Self {
        SegmentSpec {
            id,
            dist_x,
            lat: 0.0,
            lon: 0.0,
            delta_time: id as f64,
            solar_elevation: -10.0,
            photons: Vec::new(),
        }
    }

    pub fn photons(mut self, photons: Vec<PhotonSpec>) -> Self {
        self.photons = photons;
        self
    }
}

/// One synthetic photon.
#[derive(Clone, Copy, Debug)]
pub(crate) struct PhotonSpec {
    pub dist_along: f32,
    pub height: f32,
    pub cnf: i8,
    pub quality: i8,
}

impl PhotonSpec {
    pub fn at(dist_along: f32, height: f32) -> Self {
        PhotonSpec {
            dist_along,
            height,
            cnf: 4,
            quality: 0,
        }
    }

    pub fn cnf(mut self, cnf: i8) -> Self {
        self.cnf = cnf;
        self
    }

    pub fn quality(mut self, quality: i8) -> Self {
        self.quality = quality;
        self
    }
}

/// Assemble a complete synthetic ATL03 beam under `prefix`.
pub(crate) fn atl03_granule(prefix: &str, segments: &[SegmentSpec]) -> TestGranuleBuilder {
    let mut builder = granule_builder().u8s("/orbit_info/sc_orient", &[0]);

    let lat: Vec<f64> = segments.iter().map(|s| s.lat).collect();
    let lon: Vec<f64> = segments.iter().map(|s| s.lon).collect();
    let cnt: Vec<u32> = segments.iter().map(|s| s.photons.len() as u32).collect();
    let ids: Vec<u32> = segments.iter().map(|s| s.id).collect();
    let dist_x: Vec<f64> = segments.iter().map(|s| s.dist_x).collect();
    let delta: Vec<f64> = segments.iter().map(|s| s.delta_time).collect();
    let solar: Vec<f32> = segments.iter().map(|s| s.solar_elevation).collect();
    let velocity: Vec<f32> = segments.iter().flat_map(|_| [7000.0, 0.0, 0.0]).collect();

    builder = builder
        .f64s(&format!("{prefix}/geolocation/reference_photon_lat"), &lat)
        .f64s(&format!("{prefix}/geolocation/reference_photon_lon"), &lon)
        .u32s(&format!("{prefix}/geolocation/segment_ph_cnt"), &cnt)
        .u32s(&format!("{prefix}/geolocation/segment_id"), &ids)
        .f64s(&format!("{prefix}/geolocation/segment_dist_x"), &dist_x)
        .f64s(&format!("{prefix}/geolocation/delta_time"), &delta)
        .f32s(&format!("{prefix}/geolocation/solar_elevation"), &solar)
        .dataset_2d(
            &format!("{prefix}/geolocation/velocity_sc"),
            ColumnData::Float32(velocity),
            3,
        );

    let photons: Vec<PhotonSpec> = segments.iter().flat_map(|s| s.photons.clone()).collect();
    let dist_along: Vec<f32> = photons.iter().map(|p| p.dist_along).collect();
    let heights: Vec<f32> = photons.iter().map(|p| p.height).collect();
    let quality: Vec<i8> = photons.iter().map(|p| p.quality).collect();
    // Same confidence in all five surface-type columns.
    let conf: Vec<i8> = photons.iter().flat_map(|p| [p.cnf; 5]).collect();
    let ph_lat: Vec<f64> = segments
        .iter()
        .flat_map(|s| s.photons.iter().map(|_| s.lat).collect::<Vec<f64>>())
        .collect();
    let ph_lon: Vec<f64> = segments
        .iter()
        .flat_map(|s| s.photons.iter().map(|_| s.lon).collect::<Vec<f64>>())
        .collect();
    let ph_delta: Vec<f64> = segments
        .iter()
        .flat_map(|s| s.photons.iter().map(|_| s.delta_time).collect::<Vec<f64>>())
        .collect();

    builder
        .f32s(&format!("{prefix}/heights/dist_ph_along"), &dist_along)
        .f32s(
            &format!("{prefix}/heights/dist_ph_across"),
            &vec![0.0; photons.len()],
        )
        .f32s(&format!("{prefix}/heights/h_ph"), &heights)
        .dataset_2d(
            &format!("{prefix}/heights/signal_conf_ph"),
            ColumnData::Int8(conf),
            5,
        )
        .i8s(&format!("{prefix}/heights/quality_ph"), &quality)
        .f64s(&format!("{prefix}/heights/lat_ph"), &ph_lat)
        .f64s(&format!("{prefix}/heights/lon_ph"), &ph_lon)
        .f64s(&format!("{prefix}/heights/delta_time"), &ph_delta)
        .f64s(&format!("{prefix}/bckgrd_atlas/delta_time"), &[0.0])
        .f64s(&format!("{prefix}/bckgrd_atlas/bckgrd_rate"), &[0.0])
}

/// One classified photon of a synthetic ATL08 granule.
#[derive(Clone, Copy, Debug)]
pub(crate) struct ClassedPhoton {
    pub segment_id: u32,
    pub index: u32,
    pub flag: u8,
    pub ph_h: f32,
}

impl ClassedPhoton {
    pub fn new(segment_id: u32, index: u32, flag: u8) -> Self {
        ClassedPhoton {
            segment_id,
            index,
            flag,
            ph_h: 0.0,
        }
    }

    pub fn ph_h(mut self, ph_h: f32) -> Self {
        self.ph_h = ph_h;
        self
    }
}

/// Assemble a synthetic ATL08 beam under `prefix`.
///
/// `land_segments` entries are `(segment_id_beg, landcover, snowcover)`.
pub(crate) fn atl08_granule(
    prefix: &str,
    classed: &[ClassedPhoton],
    land_segments: &[(u32, u8, u8)],
) -> TestGranuleBuilder {
    let seg_ids: Vec<u32> = classed.iter().map(|c| c.segment_id).collect();
    let indices: Vec<u32> = classed.iter().map(|c| c.index).collect();
    let flags: Vec<u8> = classed.iter().map(|c| c.flag).collect();
    let ph_h: Vec<f32> = classed.iter().map(|c| c.ph_h).collect();
    let beg: Vec<u32> = land_segments.iter().map(|l| l.0).collect();
    let landcover: Vec<u8> = land_segments.iter().map(|l| l.1).collect();
    let snowcover: Vec<u8> = land_segments.iter().map(|l| l.2).collect();

    granule_builder()
        .u32s(&format!("{prefix}/signal_photons/ph_segment_id"), &seg_ids)
        .u32s(&format!("{prefix}/signal_photons/classed_pc_indx"), &indices)
        .u8s(&format!("{prefix}/signal_photons/classed_pc_flag"), &flags)
        .f32s(&format!("{prefix}/signal_photons/ph_h"), &ph_h)
        .u32s(&format!("{prefix}/land_segments/segment_id_beg"), &beg)
        .u8s(&format!("{prefix}/land_segments/segment_landcover"), &landcover)
        .u8s(&format!("{prefix}/land_segments/segment_snowcover"), &snowcover)
}
