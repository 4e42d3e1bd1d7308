//! Granule resource names and beam descriptors.
//!
//! ATL03 granule names follow the fixed layout
//! `ATL03_YYYYMMDDHHMMSS_ttttccrr_vvv_ee.h5` where `tttt` is the
//! reference ground track, `cc` the cycle and `rr` the region. The
//! companion ATL08 classification granule shares the name with the
//! product digit swapped.

use crate::error::SubsetError;

/// Offset of the RGT digits in a granule name.
const RGT_RANGE: std::ops::Range<usize> = 21..25;
/// Offset of the cycle digits in a granule name.
const CYCLE_RANGE: std::ops::Range<usize> = 25..27;
/// Offset of the region digits in a granule name.
const REGION_RANGE: std::ops::Range<usize> = 27..29;
/// Offset of the product digit swapped to derive the ATL08 name.
const PRODUCT_OFFSET: usize = 4;

/// Identity of a granule, parsed from its resource name.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ResourceDescriptor {
    name: String,
    pub rgt: u16,
    pub cycle: u16,
    pub region: u8,
}

impl ResourceDescriptor {
    /// Parse a granule resource name.
    ///
    /// # Arguments
    ///
    /// * `name`: The granule file name, at least 29 characters long.
    pub fn parse(name: &str) -> Result<Self, SubsetError> {
        if name.len() < REGION_RANGE.end || !name.is_char_boundary(REGION_RANGE.end) {
            return Err(SubsetError::ParseError {
                resource: name.to_string(),
                what: "identifiers",
            });
        }
        let rgt = parse_field(name, RGT_RANGE, "RGT")?;
        let cycle = parse_field(name, CYCLE_RANGE, "cycle")?;
        let region = parse_field(name, REGION_RANGE, "region")?;
        Ok(Self {
            name: name.to_string(),
            rgt,
            cycle,
            region,
        })
    }

    /// The resource name this descriptor was parsed from, with the
    /// identifier digits re-rendered.
    pub fn format(&self) -> String {
        let mut name = self.name.clone();
        name.replace_range(
            RGT_RANGE.start..REGION_RANGE.end,
            &format!("{:04}{:02}{:02}", self.rgt, self.cycle, self.region),
        );
        name
    }

    /// The raw resource name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Resource name of the companion ATL08 classification granule.
    pub fn atl08_companion(&self) -> String {
        let mut name = self.name.clone();
        name.replace_range(PRODUCT_OFFSET..PRODUCT_OFFSET + 1, "8");
        name
    }

    /// Pack the composite 64-bit extent identifier.
    ///
    /// Layout, high to low: rgt:16 | cycle:8 | region:8 | track:2 |
    /// pair:1 | counter:29.
    pub fn extent_id(&self, beam: Beam, counter: u32) -> u64 {
        ((self.rgt as u64) << 48)
            | (((self.cycle & 0xFF) as u64) << 40)
            | ((self.region as u64) << 32)
            | (((beam.track & 0x3) as u64) << 30)
            | (((beam.pair & 0x1) as u64) << 29)
            | ((counter & 0x1FFF_FFFF) as u64)
    }
}

fn parse_field<T: std::str::FromStr>(
    name: &str,
    range: std::ops::Range<usize>,
    what: &'static str,
) -> Result<T, SubsetError> {
    name[range].parse().map_err(|_| SubsetError::ParseError {
        resource: name.to_string(),
        what,
    })
}

/// Spacecraft orientation, from `/orbit_info/sc_orient`.
pub const SC_BACKWARD: u8 = 0;
pub const SC_FORWARD: u8 = 1;

/// One of the six beams: a ground-track pair number and a left/right
/// pair element.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Beam {
    /// Track number, 1..=3.
    pub track: u8,
    /// Pair element: 0 for left, 1 for right.
    pub pair: u8,
}

impl Beam {
    /// All six beams in track-major order.
    pub fn all() -> impl Iterator<Item = Beam> {
        (1..=3).flat_map(|track| (0..2).map(move |pair| Beam { track, pair }))
    }

    /// HDF5 group prefix of this beam, e.g. `/gt2r`.
    pub fn prefix(&self) -> String {
        format!("/gt{}{}", self.track, if self.pair == 0 { 'l' } else { 'r' })
    }

    /// Laser spot number for this beam under the given spacecraft
    /// orientation. Returns 0 for a transitional orientation.
    pub fn spot(&self, sc_orient: u8) -> u8 {
        match (sc_orient, self.track, self.pair) {
            (SC_BACKWARD, 1, 0) => 1,
            (SC_BACKWARD, 1, 1) => 2,
            (SC_BACKWARD, 2, 0) => 3,
            (SC_BACKWARD, 2, 1) => 4,
            (SC_BACKWARD, 3, 0) => 5,
            (SC_BACKWARD, 3, 1) => 6,
            (SC_FORWARD, 1, 0) => 6,
            (SC_FORWARD, 1, 1) => 5,
            (SC_FORWARD, 2, 0) => 4,
            (SC_FORWARD, 2, 1) => 3,
            (SC_FORWARD, 3, 0) => 2,
            (SC_FORWARD, 3, 1) => 1,
            _ => 0,
        }
    }
}
