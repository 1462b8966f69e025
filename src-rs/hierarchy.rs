use anyhow::{bail, Context, Result};
use serde::Deserialize;
use serde_json::Value;
use std::fs;
use std::io::{self, Read};

use crate::geometry::Shape;

/// Where an object keeps the shape that represents it.
#[derive(Debug, Clone, PartialEq)]
pub enum Geometry {
    /// Detected cell: the nucleus outline stands in for the whole cell.
    Cell { nucleus: Option<Shape> },
    Generic {
        shape: Option<Shape>,
    },
}

impl Geometry {
    pub fn representative_shape(&self) -> Option<&Shape> {
        match self {
            Geometry::Cell { nucleus } => nucleus.as_ref(),
            Geometry::Generic { shape } => shape.as_ref(),
        }
    }
}

/// Classified object exported from the viewer's object hierarchy.
#[derive(Debug, Clone, PartialEq)]
pub struct LabeledObject {
    pub class_name: Option<String>,
    /// Packed RGB, possibly with alpha in the high byte.
    pub color: i64,
    pub geometry: Geometry,
}

#[cfg(test)]
impl LabeledObject {
    pub fn generic(class_name: &str, color: i64, shape: Shape) -> Self {
        Self {
            class_name: Some(class_name.to_string()),
            color,
            geometry: Geometry::Generic { shape: Some(shape) },
        }
    }

    pub fn cell(class_name: &str, color: i64, nucleus: Option<Shape>) -> Self {
        Self {
            class_name: Some(class_name.to_string()),
            color,
            geometry: Geometry::Cell { nucleus },
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawObject {
    #[serde(default)]
    kind: Option<String>,
    #[serde(default, alias = "class_name", alias = "classification")]
    class: Option<String>,
    #[serde(default)]
    color: Option<i64>,
    #[serde(default)]
    roi: Option<Shape>,
    #[serde(default)]
    nucleus: Option<Shape>,
    #[serde(default)]
    children: Vec<RawObject>,
}

impl RawObject {
    fn flatten_into(self, out: &mut Vec<LabeledObject>) {
        let is_cell = self
            .kind
            .as_deref()
            .map(|k| k.eq_ignore_ascii_case("cell"))
            .unwrap_or(false);
        let geometry = if is_cell {
            Geometry::Cell {
                nucleus: self.nucleus,
            }
        } else {
            Geometry::Generic { shape: self.roi }
        };
        out.push(LabeledObject {
            class_name: self.class,
            color: self.color.unwrap_or(0),
            geometry,
        });
        for child in self.children {
            child.flatten_into(out);
        }
    }
}

/// Depth-first flattening of an exported hierarchy: parents precede their
/// children.
pub fn parse_objects(value: Value) -> Result<Vec<LabeledObject>> {
    let items = match value {
        Value::Array(items) => items,
        Value::Object(mut obj) => match obj.remove("objects") {
            Some(Value::Array(items)) => items,
            _ => bail!("object export must be a list or an object with 'objects'"),
        },
        _ => bail!("object export must be a list or an object with 'objects'"),
    };

    let mut out = Vec::with_capacity(items.len());
    for (idx, item) in items.into_iter().enumerate() {
        let raw: RawObject = serde_json::from_value(item)
            .with_context(|| format!("invalid object at index {idx}"))?;
        raw.flatten_into(&mut out);
    }
    Ok(out)
}

/// Read an object export from a file, or stdin when `path` is `-`.
pub fn load_objects(path: &str) -> Result<Vec<LabeledObject>> {
    let raw = read_json_source(path, "objects")?;
    let value: Value = serde_json::from_str(&raw).context("invalid objects JSON")?;
    parse_objects(value)
}

pub fn load_shape(path: &str) -> Result<Shape> {
    let raw = read_json_source(path, "selection")?;
    serde_json::from_str(&raw).context("invalid selection JSON")
}

fn read_json_source(path: &str, what: &str) -> Result<String> {
    if path == "-" {
        let mut buf = String::new();
        io::stdin()
            .read_to_string(&mut buf)
            .with_context(|| format!("failed to read {what} from stdin"))?;
        Ok(buf)
    } else {
        fs::read_to_string(path).with_context(|| format!("failed to read {what} file: {path}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{Point, ShapeKind};
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn cells_use_their_nucleus() {
        let objects = parse_objects(json!([
            {
                "kind": "cell",
                "class": "lymphocyte",
                "color": 255,
                "roi": {"type": "Polygon", "points": [[0, 0], [20, 0], [20, 20]]},
                "nucleus": {"type": "Ellipse", "points": [[5, 5], [9, 5], [9, 9], [5, 9]]}
            }
        ]))
        .unwrap();
        assert_eq!(objects.len(), 1);
        let shape = objects[0].geometry.representative_shape().unwrap();
        assert_eq!(shape.kind, ShapeKind::Ellipse);
        assert_eq!(shape.centroid(), Some(Point(7.0, 7.0)));
    }

    #[test]
    fn cell_without_nucleus_has_no_representative_shape() {
        let cell = LabeledObject::cell("tumor", 0, None);
        assert!(cell.geometry.representative_shape().is_none());
    }

    #[test]
    fn cell_outline_is_not_a_fallback_for_the_nucleus() {
        let objects = parse_objects(json!([
            {
                "kind": "Cell",
                "class": "tumor",
                "roi": {"type": "Polygon", "points": [[0, 0], [20, 0], [20, 20]]}
            }
        ]))
        .unwrap();
        assert_eq!(objects[0].geometry, Geometry::Cell { nucleus: None });
        assert!(objects[0].geometry.representative_shape().is_none());
    }

    #[test]
    fn nested_children_are_flattened_depth_first() {
        let objects = parse_objects(json!({
            "objects": [
                {
                    "class": "region",
                    "roi": {"type": "Rectangle", "points": [[0, 0], [100, 0], [100, 100], [0, 100]]},
                    "children": [
                        {"class": "tumor", "roi": {"type": "Polygon", "points": [[1, 1], [2, 1], [2, 2]]}},
                        {"class": null}
                    ]
                },
                {"class": "stroma"}
            ]
        }))
        .unwrap();
        let names: Vec<Option<&str>> = objects.iter().map(|o| o.class_name.as_deref()).collect();
        assert_eq!(
            names,
            vec![Some("region"), Some("tumor"), None, Some("stroma")]
        );
        assert!(objects[3].geometry.representative_shape().is_none());
    }

    #[test]
    fn rejects_unknown_layouts() {
        assert!(parse_objects(json!({"items": []})).is_err());
        assert!(parse_objects(json!(42)).is_err());
    }

    #[test]
    fn loads_objects_and_selection_from_files() {
        let dir = tempdir().unwrap();
        let objects_path = dir.path().join("objects.json");
        fs::write(
            &objects_path,
            r#"[{"class": "tumor", "color": -65536, "roi": {"type": "Polygon", "points": [[0,0],[4,0],[4,4]]}}]"#,
        )
        .unwrap();
        let objects = load_objects(objects_path.to_str().unwrap()).unwrap();
        assert_eq!(objects[0].color, -65536);

        let selection_path = dir.path().join("selection.json");
        fs::write(
            &selection_path,
            r#"{"type": "Rectangle", "points": [[10,10],[30,10],[30,40],[10,40]]}"#,
        )
        .unwrap();
        let shape = load_shape(selection_path.to_str().unwrap()).unwrap();
        assert_eq!(shape.bounds(), Some((10.0, 10.0, 20.0, 30.0)));
    }
}
