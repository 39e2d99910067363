//! Coordinate reference handling. Everything downstream works in
//! longitude/latitude degrees.

use geo::{Coord, MapCoords, MultiPolygon};
use std::f64::consts::PI;

const EARTH_RADIUS: f64 = 6_378_137.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Crs {
    /// WGS84 / NAD83 geographic degrees. The datum shift is well under the
    /// simplification tolerance, so both pass through unchanged.
    Geographic,
    /// Spherical Web Mercator metres (EPSG:3857, ESRI 102100).
    WebMercator,
}

impl Crs {
    /// Reads a `.prj` WKT string.
    pub fn from_wkt(wkt: &str) -> Option<Crs> {
        let upper = wkt.to_ascii_uppercase();
        if upper.starts_with("PROJCS") {
            if upper.contains("MERCATOR") && (upper.contains("AUXILIARY_SPHERE") || upper.contains("PSEUDO")) {
                return Some(Crs::WebMercator);
            }
            return None;
        }
        if upper.starts_with("GEOGCS") || upper.starts_with("GEOGCRS") {
            return Some(Crs::Geographic);
        }
        None
    }

    /// Reads an EPSG / ESRI well-known id.
    pub fn from_wkid(wkid: u32) -> Option<Crs> {
        match wkid {
            4326 | 4269 | 4019 | 4152 => Some(Crs::Geographic),
            3857 | 102100 | 102113 | 900913 => Some(Crs::WebMercator),
            _ => None,
        }
    }

    /// Reads a legacy GeoJSON `crs` name such as `EPSG:3857` or
    /// `urn:ogc:def:crs:OGC:1.3:CRS84`.
    pub fn from_crs_name(name: &str) -> Option<Crs> {
        if name.ends_with("CRS84") {
            return Some(Crs::Geographic);
        }
        let digits = name.rsplit(':').next()?;
        Crs::from_wkid(digits.parse().ok()?)
    }

    pub fn to_lon_lat(&self, geometry: MultiPolygon<f64>) -> MultiPolygon<f64> {
        match self {
            Crs::Geographic => geometry,
            Crs::WebMercator => geometry.map_coords(mercator_to_lon_lat),
        }
    }
}

fn mercator_to_lon_lat(c: Coord<f64>) -> Coord<f64> {
    let lon = (c.x / EARTH_RADIUS).to_degrees();
    let lat = (2.0 * (c.y / EARTH_RADIUS).exp().atan() - PI / 2.0).to_degrees();
    Coord { x: lon, y: lat }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::polygon;

    #[test]
    fn detects_prj_flavours() {
        let nad83 = r#"GEOGCS["GCS_North_American_1983",DATUM["D_North_American_1983"]]"#;
        let mercator = r#"PROJCS["WGS_1984_Web_Mercator_Auxiliary_Sphere",PROJECTION["Mercator_Auxiliary_Sphere"]]"#;
        let albers = r#"PROJCS["USA_Contiguous_Albers_Equal_Area_Conic"]"#;
        assert_eq!(Crs::from_wkt(nad83), Some(Crs::Geographic));
        assert_eq!(Crs::from_wkt(mercator), Some(Crs::WebMercator));
        assert_eq!(Crs::from_wkt(albers), None);
        assert_eq!(Crs::from_wkid(102100), Some(Crs::WebMercator));
        assert_eq!(Crs::from_crs_name("urn:ogc:def:crs:EPSG::3857"), Some(Crs::WebMercator));
        assert_eq!(Crs::from_crs_name("urn:ogc:def:crs:OGC:1.3:CRS84"), Some(Crs::Geographic));
        assert_eq!(Crs::from_crs_name("EPSG:5070"), None);
    }

    #[test]
    fn inverse_mercator_round_numbers() {
        let square = MultiPolygon::new(vec![polygon![
            (x: 0.0, y: 0.0),
            (x: EARTH_RADIUS * PI, y: 0.0),
            (x: EARTH_RADIUS * PI, y: 0.0),
            (x: 0.0, y: 0.0),
        ]]);
        let out = Crs::WebMercator.to_lon_lat(square);
        let first = out.0[0].exterior().0[1];
        assert!((first.x - 180.0).abs() < 1e-9);
        assert!(first.y.abs() < 1e-9);
    }
}
