use serde::{Deserialize, Serialize};

/// Image-space vertex, serialized as `[x, y]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point(pub f64, pub f64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShapeKind {
    #[serde(alias = "rectangle", alias = "rect")]
    Rectangle,
    #[serde(alias = "ellipse")]
    Ellipse,
    #[serde(alias = "polygon")]
    Polygon,
    #[serde(alias = "polyline")]
    Polyline,
    #[serde(alias = "line")]
    Line,
    #[serde(alias = "points", alias = "point")]
    Points,
    #[serde(alias = "area")]
    Area,
    #[serde(alias = "geometry")]
    Geometry,
}

impl ShapeKind {
    /// Name written to the `Type` attribute of an annotation.
    pub fn roi_name(self) -> &'static str {
        match self {
            ShapeKind::Rectangle => "Rectangle",
            ShapeKind::Ellipse => "Ellipse",
            ShapeKind::Polygon => "Polygon",
            ShapeKind::Polyline => "Polyline",
            ShapeKind::Line => "Line",
            ShapeKind::Points => "Points",
            ShapeKind::Area => "Area",
            ShapeKind::Geometry => "Geometry",
        }
    }

    pub fn is_point(self) -> bool {
        matches!(self, ShapeKind::Points)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shape {
    #[serde(rename = "type")]
    pub kind: ShapeKind,
    #[serde(default)]
    pub points: Vec<Point>,
}

impl Shape {
    pub fn new(kind: ShapeKind, points: Vec<Point>) -> Self {
        Self { kind, points }
    }

    /// Axis-aligned rectangle with its four corners in clockwise order.
    pub fn rectangle(x: f64, y: f64, w: f64, h: f64) -> Self {
        Self::new(
            ShapeKind::Rectangle,
            vec![
                Point(x, y),
                Point(x + w, y),
                Point(x + w, y + h),
                Point(x, y + h),
            ],
        )
    }

    pub fn polygon(points: Vec<Point>) -> Self {
        Self::new(ShapeKind::Polygon, points)
    }

    /// Bounds as `(min_x, min_y, width, height)`.
    pub fn bounds(&self) -> Option<(f64, f64, f64, f64)> {
        let first = self.points.first()?;
        let (mut min_x, mut min_y, mut max_x, mut max_y) = (first.0, first.1, first.0, first.1);
        for p in &self.points[1..] {
            min_x = min_x.min(p.0);
            min_y = min_y.min(p.1);
            max_x = max_x.max(p.0);
            max_y = max_y.max(p.1);
        }
        Some((min_x, min_y, max_x - min_x, max_y - min_y))
    }

    pub fn is_empty(&self) -> bool {
        match self.bounds() {
            Some((_, _, w, h)) => w <= 0.0 || h <= 0.0,
            None => true,
        }
    }

    /// Representative point used for region containment.
    pub fn centroid(&self) -> Option<Point> {
        match self.kind {
            ShapeKind::Rectangle | ShapeKind::Ellipse => {
                let (x, y, w, h) = self.bounds()?;
                Some(Point(x + w / 2.0, y + h / 2.0))
            }
            ShapeKind::Polygon | ShapeKind::Area | ShapeKind::Geometry => {
                polygon_centroid(&self.points).or_else(|| vertex_mean(&self.points))
            }
            ShapeKind::Polyline | ShapeKind::Line | ShapeKind::Points => vertex_mean(&self.points),
        }
    }
}

fn vertex_mean(points: &[Point]) -> Option<Point> {
    if points.is_empty() {
        return None;
    }
    let n = points.len() as f64;
    let (sx, sy) = points
        .iter()
        .fold((0.0, 0.0), |(sx, sy), p| (sx + p.0, sy + p.1));
    Some(Point(sx / n, sy / n))
}

fn polygon_centroid(points: &[Point]) -> Option<Point> {
    if points.len() < 3 {
        return None;
    }
    let mut twice_area = 0.0;
    let mut cx = 0.0;
    let mut cy = 0.0;
    for (i, a) in points.iter().enumerate() {
        let b = points[(i + 1) % points.len()];
        let cross = a.0 * b.1 - b.0 * a.1;
        twice_area += cross;
        cx += (a.0 + b.0) * cross;
        cy += (a.1 + b.1) * cross;
    }
    if twice_area.abs() < f64::EPSILON {
        return None;
    }
    Some(Point(cx / (3.0 * twice_area), cy / (3.0 * twice_area)))
}
