//! Geographic predicates used by region subsetting.
//!
//! Polygon regions arrive from the caller already projected; the crate
//! only needs the matching point projection and a crossing-number
//! inclusion test. Raster regions are answered by an external oracle
//! behind the [InclusionOracle] trait.

use serde::Deserialize;

/// A projected 2-D point.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq)]
pub struct Point2D {
    pub x: f64,
    pub y: f64,
}

/// Projection used to place geographic coordinates onto the plane the
/// polygon was supplied in.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Projection {
    #[default]
    PlateCarree,
    NorthPolarStereo,
    SouthPolarStereo,
}

/// Mean earth radius in meters, used by the stereographic projections.
const EARTH_RADIUS: f64 = 6371007.181;

/// Project a geographic coordinate (degrees) onto the plane.
pub fn project(lon: f64, lat: f64, projection: Projection) -> Point2D {
    match projection {
        Projection::PlateCarree => Point2D { x: lon, y: lat },
        Projection::NorthPolarStereo => polar_stereo(lon, lat, 1.0),
        Projection::SouthPolarStereo => polar_stereo(lon, lat, -1.0),
    }
}

/// Spherical polar stereographic projection about the given pole.
fn polar_stereo(lon: f64, lat: f64, pole: f64) -> Point2D {
    let lambda = lon.to_radians();
    let phi = (lat * pole).to_radians();
    let r = 2.0 * EARTH_RADIUS * (std::f64::consts::FRAC_PI_4 - phi / 2.0).tan();
    Point2D {
        x: r * lambda.sin(),
        y: -pole * r * lambda.cos(),
    }
}

/// Crossing-number test for a closed polygon.
///
/// The polygon must be closed: its last vertex repeats the first. Points
/// exactly on an edge are resolved by the half-open edge rule.
pub fn point_in_polygon(points: &[Point2D], p: Point2D) -> bool {
    let mut inside = false;
    for edge in points.windows(2) {
        let (a, b) = (edge[0], edge[1]);
        if (a.y > p.y) != (b.y > p.y) {
            let x_cross = a.x + (p.y - a.y) / (b.y - a.y) * (b.x - a.x);
            if p.x < x_cross {
                inside = !inside;
            }
        }
    }
    inside
}

/// Oracle answering whether a geographic coordinate falls inside a
/// raster region. Supplied by the caller; typically backed by a
/// geospatial raster sampler.
pub trait InclusionOracle: Send + Sync {
    fn includes(&self, lon: f64, lat: f64) -> bool;
}
