//! Feature records and the per-tile store that holds them.
//!
//! Tile payloads arrive as GeoJSON (a `FeatureCollection`, a single `Feature`
//! or a bare geometry). They are parsed and validated up front so a malformed
//! payload can be rejected before any tile state is touched.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::DataFormatError;
use crate::filter::FeatureFilter;

/// A GeoJSON position: longitude, latitude and an optional altitude.
pub type Position = Vec<f64>;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "coordinates")]
pub enum Geometry {
    Point(Position),
    MultiPoint(Vec<Position>),
    LineString(Vec<Position>),
    MultiLineString(Vec<Vec<Position>>),
    Polygon(Vec<Vec<Position>>),
    MultiPolygon(Vec<Vec<Vec<Position>>>),
}

/// Geometry kinds as seen by filters; multi-geometries fold onto their base kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GeometryType {
    Point,
    LineString,
    Polygon,
}

impl Geometry {
    pub fn point(lng: f64, lat: f64) -> Self {
        Geometry::Point(vec![lng, lat])
    }

    pub fn geometry_type(&self) -> GeometryType {
        match self {
            Geometry::Point(_) | Geometry::MultiPoint(_) => GeometryType::Point,
            Geometry::LineString(_) | Geometry::MultiLineString(_) => GeometryType::LineString,
            Geometry::Polygon(_) | Geometry::MultiPolygon(_) => GeometryType::Polygon,
        }
    }

    fn validate(&self) -> Result<(), String> {
        match self {
            Geometry::Point(p) => validate_position(p),
            Geometry::MultiPoint(points) => points.iter().try_for_each(|p| validate_position(p)),
            Geometry::LineString(line) => validate_line(line),
            Geometry::MultiLineString(lines) => lines.iter().try_for_each(|l| validate_line(l)),
            Geometry::Polygon(rings) => validate_polygon(rings),
            Geometry::MultiPolygon(polygons) => {
                polygons.iter().try_for_each(|p| validate_polygon(p))
            }
        }
    }
}

fn validate_position(position: &[f64]) -> Result<(), String> {
    if !(2..=3).contains(&position.len()) {
        return Err(format!(
            "position must have 2 or 3 values, found {}",
            position.len()
        ));
    }
    if position.iter().any(|v| !v.is_finite()) {
        return Err("position contains a non-finite value".to_string());
    }
    Ok(())
}

fn validate_line(line: &[Position]) -> Result<(), String> {
    if line.len() < 2 {
        return Err(format!(
            "line string needs at least 2 positions, found {}",
            line.len()
        ));
    }
    line.iter().try_for_each(|p| validate_position(p))
}

fn validate_polygon(rings: &[Vec<Position>]) -> Result<(), String> {
    for ring in rings {
        if ring.len() < 4 {
            return Err(format!(
                "polygon ring needs at least 4 positions, found {}",
                ring.len()
            ));
        }
        ring.iter().try_for_each(|p| validate_position(p))?;
        if ring.first() != ring.last() {
            return Err("polygon ring is not closed".to_string());
        }
    }
    Ok(())
}

/// One geometry plus its property map.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    pub geometry: Geometry,
    #[serde(default)]
    pub properties: Map<String, Value>,
}

impl Feature {
    pub fn new(geometry: Geometry) -> Self {
        Feature {
            id: None,
            geometry,
            properties: Map::new(),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn property(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }
}

/// Parses a GeoJSON payload into feature records.
///
/// Either every feature is accepted or the whole payload is rejected.
pub fn parse_features(payload: &Value) -> Result<Vec<Feature>, DataFormatError> {
    let kind = payload.get("type").and_then(Value::as_str).unwrap_or("");

    let features = match kind {
        "FeatureCollection" => {
            let members = payload
                .get("features")
                .and_then(Value::as_array)
                .ok_or_else(|| DataFormatError::Geometry {
                    index: 0,
                    reason: "feature collection has no \"features\" array".to_string(),
                })?;
            members
                .iter()
                .enumerate()
                .map(|(index, member)| parse_feature(index, member))
                .collect::<Result<Vec<_>, _>>()?
        }
        "Feature" => vec![parse_feature(0, payload)?],
        "Point" | "MultiPoint" | "LineString" | "MultiLineString" | "Polygon"
        | "MultiPolygon" => vec![Feature::new(Geometry::deserialize(payload)?)],
        other => return Err(DataFormatError::UnsupportedType(other.to_string())),
    };

    validate_features(&features)?;
    Ok(features)
}

fn parse_feature(index: usize, value: &Value) -> Result<Feature, DataFormatError> {
    if value.get("type").and_then(Value::as_str) != Some("Feature") {
        return Err(DataFormatError::Geometry {
            index,
            reason: "collection member is not a Feature".to_string(),
        });
    }

    let geometry = match value.get("geometry") {
        None | Some(Value::Null) => return Err(DataFormatError::MissingGeometry(index)),
        Some(geometry) => Geometry::deserialize(geometry)?,
    };

    let properties = match value.get("properties") {
        None | Some(Value::Null) => Map::new(),
        Some(Value::Object(properties)) => properties.clone(),
        Some(_) => {
            return Err(DataFormatError::Geometry {
                index,
                reason: "properties must be an object".to_string(),
            })
        }
    };

    Ok(Feature {
        id: value.get("id").cloned(),
        geometry,
        properties,
    })
}

/// Checks geometry rules for features that did not come through [`parse_features`].
pub fn validate_features(features: &[Feature]) -> Result<(), DataFormatError> {
    for (index, feature) in features.iter().enumerate() {
        feature
            .geometry
            .validate()
            .map_err(|reason| DataFormatError::Geometry { index, reason })?;
    }
    Ok(())
}

/// One tile's worth of features.
///
/// Cloning is cheap: the records are shared, and [`FeatureStore::replace`]
/// swaps in a new set rather than mutating the old one, so a clone taken
/// before a replace keeps seeing the old data.
#[derive(Clone, Debug)]
pub struct FeatureStore {
    features: Arc<[Feature]>,
}

impl FeatureStore {
    pub fn new(features: Vec<Feature>) -> Self {
        FeatureStore {
            features: features.into(),
        }
    }

    pub fn replace(&mut self, features: Vec<Feature>) {
        self.features = features.into();
    }

    /// Lazily yields matching records in insertion order. Each call starts
    /// over from the records currently held.
    pub fn query<'a, F>(&'a self, filter: &'a F) -> impl Iterator<Item = &'a Feature> + 'a
    where
        F: FeatureFilter + ?Sized,
    {
        self.features.iter().filter(move |f| filter.matches(f))
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_parse_feature_collection() {
        let payload = json!({
            "type": "FeatureCollection",
            "features": [
                {
                    "type": "Feature",
                    "id": 7,
                    "geometry": { "type": "Point", "coordinates": [0.0, 0.0] },
                    "properties": { "name": "a" }
                },
                {
                    "type": "Feature",
                    "geometry": {
                        "type": "LineString",
                        "coordinates": [[0.0, 0.0], [1.0, 1.0, 12.5]]
                    }
                }
            ]
        });

        let features = parse_features(&payload).unwrap();
        assert_eq!(2, features.len());
        assert_eq!(Some(&json!(7)), features[0].id.as_ref());
        assert_eq!(Some(&json!("a")), features[0].property("name"));
        assert_eq!(Geometry::point(0.0, 0.0), features[0].geometry);
        assert!(features[1].properties.is_empty());
        assert_eq!(GeometryType::LineString, features[1].geometry.geometry_type());
    }

    #[test]
    fn test_parse_single_feature_and_bare_geometry() {
        let feature = json!({
            "type": "Feature",
            "geometry": { "type": "MultiPoint", "coordinates": [[1.0, 2.0], [3.0, 4.0]] },
            "properties": null
        });
        assert_eq!(1, parse_features(&feature).unwrap().len());

        let polygon = json!({
            "type": "Polygon",
            "coordinates": [[[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 0.0]]]
        });
        let features = parse_features(&polygon).unwrap();
        assert_eq!(GeometryType::Polygon, features[0].geometry.geometry_type());
    }

    #[test]
    fn test_reject_malformed_payloads() {
        let unclosed = json!({
            "type": "Polygon",
            "coordinates": [[[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 1.0]]]
        });
        assert!(matches!(
            parse_features(&unclosed),
            Err(DataFormatError::Geometry { index: 0, .. })
        ));

        let short_line = json!({ "type": "LineString", "coordinates": [[0.0, 0.0]] });
        assert!(parse_features(&short_line).is_err());

        let bad_position = json!({ "type": "Point", "coordinates": [1.0] });
        assert!(parse_features(&bad_position).is_err());

        let not_numbers = json!({ "type": "Point", "coordinates": ["a", "b"] });
        assert!(matches!(
            parse_features(&not_numbers),
            Err(DataFormatError::Json(_))
        ));

        let null_geometry = json!({
            "type": "FeatureCollection",
            "features": [
                { "type": "Feature", "geometry": { "type": "Point", "coordinates": [0, 0] } },
                { "type": "Feature", "geometry": null }
            ]
        });
        assert!(matches!(
            parse_features(&null_geometry),
            Err(DataFormatError::MissingGeometry(1))
        ));

        assert!(matches!(
            parse_features(&json!({ "type": "GeometryCollection", "geometries": [] })),
            Err(DataFormatError::UnsupportedType(_))
        ));
        assert!(parse_features(&json!([1, 2, 3])).is_err());
    }

    #[test]
    fn test_store_query_preserves_order_and_restarts() {
        let mut store = FeatureStore::new(vec![
            Feature::new(Geometry::point(0.0, 0.0)).with_property("rank", 1),
            Feature::new(Geometry::point(1.0, 0.0)).with_property("rank", 2),
            Feature::new(Geometry::point(2.0, 0.0)).with_property("rank", 3),
        ]);

        let odd = |f: &Feature| f.property("rank").and_then(Value::as_i64).unwrap_or(0) % 2 == 1;
        let ranks: Vec<_> = store.query(&odd).map(|f| f.property("rank").cloned()).collect();
        assert_eq!(vec![Some(json!(1)), Some(json!(3))], ranks);

        let snapshot = store.clone();
        store.replace(vec![Feature::new(Geometry::point(5.0, 5.0)).with_property("rank", 5)]);

        assert_eq!(1, store.query(&odd).count());
        assert_eq!(2, snapshot.query(&odd).count());
        assert_eq!(3, snapshot.len());
    }
}
