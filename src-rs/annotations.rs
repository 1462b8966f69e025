// ASAP annotation export: objects whose centroid falls inside a region,
// re-based onto the region's origin and grouped by class.

use std::fs;
use std::io::{self, Write};
use std::path::Path;

use tempfile::{Builder, TempPath};
use tracing::{debug, info};

use crate::hierarchy::LabeledObject;
use crate::region::Region;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Annotation {
    pub name: String,
    pub shape_type: String,
    pub group: String,
    pub color: String,
    /// Region-local vertices, in boundary order.
    pub coordinates: Vec<(i32, i32)>,
}

/// Class name to color, in order of first sighting. A later sighting of the
/// same class overwrites the color.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupTable {
    entries: Vec<(String, String)>,
}

impl GroupTable {
    pub fn insert(&mut self, name: &str, color: &str) {
        match self.entries.iter_mut().find(|(n, _)| n == name) {
            Some(entry) => entry.1 = color.to_string(),
            None => self.entries.push((name.to_string(), color.to_string())),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, c)| (n.as_str(), c.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnotationDocument {
    pub region: Region,
    pub annotations: Vec<Annotation>,
    pub groups: GroupTable,
}

/// `#rrggbb` from the low 24 bits of a packed color.
pub fn color_hex(color: i64) -> String {
    format!("#{:06x}", color & 0xFF_FFFF)
}

/// Filter and re-base `objects` onto `region`. A degenerate region keeps
/// every eligible object. `None` when nothing survives.
pub fn build_document(objects: &[LabeledObject], region: Region) -> Option<AnnotationDocument> {
    let filter = if region.is_degenerate() {
        None
    } else {
        Some(region)
    };

    let mut annotations = Vec::new();
    let mut groups = GroupTable::default();

    for obj in objects {
        let name = match obj.class_name.as_deref() {
            Some(name) if !name.is_empty() => name,
            _ => continue,
        };

        let shape = match obj.geometry.representative_shape() {
            Some(shape) if !shape.kind.is_point() && !shape.points.is_empty() => shape,
            _ => continue,
        };

        if let Some(patch) = filter {
            match shape.centroid() {
                Some(c) if patch.contains(c) => {}
                _ => continue,
            }
        }

        let color = color_hex(obj.color);
        groups.insert(name, &color);

        let coordinates = shape
            .points
            .iter()
            .map(|p| {
                (
                    (p.0 as i32).wrapping_sub(region.x),
                    (p.1 as i32).wrapping_sub(region.y),
                )
            })
            .collect();

        annotations.push(Annotation {
            name: name.to_string(),
            shape_type: shape.kind.roi_name().to_string(),
            group: name.to_string(),
            color,
            coordinates,
        });
    }

    info!(
        saved = annotations.len(),
        groups = groups.len(),
        "collected annotations for region {region}"
    );
    if annotations.is_empty() {
        return None;
    }

    Some(AnnotationDocument {
        region,
        annotations,
        groups,
    })
}

impl AnnotationDocument {
    pub fn to_xml(&self) -> String {
        let r = &self.region;
        let mut xml =
            String::from("<?xml version=\"1.0\" encoding=\"UTF-8\" standalone=\"no\"?>\n");
        xml.push_str("<ASAP_Annotations>\n");
        xml.push_str(&format!(
            "  <Annotations Description=\"\" H=\"{}\" Name=\"\" W=\"{}\" X=\"{}\" Y=\"{}\">\n",
            r.height, r.width, r.x, r.y
        ));

        for ann in &self.annotations {
            xml.push_str(&format!(
                "    <Annotation Color=\"{}\" Name=\"{}\" PartOfGroup=\"{}\" Type=\"{}\">\n",
                escape_attr(&ann.color),
                escape_attr(&ann.name),
                escape_attr(&ann.group),
                escape_attr(&ann.shape_type)
            ));
            xml.push_str("      <Coordinates>\n");
            for (order, (x, y)) in ann.coordinates.iter().enumerate() {
                xml.push_str(&format!(
                    "        <Coordinate Order=\"{order}\" X=\"{x}\" Y=\"{y}\"/>\n"
                ));
            }
            xml.push_str("      </Coordinates>\n");
            xml.push_str("    </Annotation>\n");
        }

        xml.push_str("  </Annotations>\n");
        xml.push_str("  <AnnotationGroups>\n");
        for (name, color) in self.groups.iter() {
            xml.push_str(&format!(
                "    <Group Color=\"{}\" Name=\"{}\" PartOfGroup=\"None\"/>\n",
                escape_attr(color),
                escape_attr(name)
            ));
        }
        xml.push_str("  </AnnotationGroups>\n");
        xml.push_str("</ASAP_Annotations>\n");
        xml
    }

    pub fn save(&self, path: &Path) -> io::Result<()> {
        fs::write(path, self.to_xml())
    }

    /// Write to a fresh `{base}*.xml` file in `dir`. The file is removed when
    /// the returned path is dropped.
    pub fn write_temp(&self, dir: &Path, base: &str) -> io::Result<TempPath> {
        let mut file = Builder::new().prefix(base).suffix(".xml").tempfile_in(dir)?;
        file.write_all(self.to_xml().as_bytes())?;
        file.flush()?;
        let path = file.into_temp_path();
        debug!(path = %path.display(), "wrote annotation document");
        Ok(path)
    }
}

/// Build and write the annotation document for `region`. `Ok(None)` when no
/// object survives filtering; no file is created in that case.
pub fn write_annotations_xml(
    objects: &[LabeledObject],
    region: Region,
    dir: &Path,
    base: &str,
) -> io::Result<Option<(AnnotationDocument, TempPath)>> {
    match build_document(objects, region) {
        Some(doc) => {
            let path = doc.write_temp(dir, base)?;
            Ok(Some((doc, path)))
        }
        None => Ok(None),
    }
}

fn escape_attr(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            '\n' => out.push_str("&#10;"),
            '\r' => out.push_str("&#13;"),
            '\t' => out.push_str("&#9;"),
            _ => out.push(ch),
        }
    }
    out
}
