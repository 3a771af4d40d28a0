//! Box, region and coordinate-frame helpers shared by the localizer and the resolver.

use serde::{Deserialize, Serialize};

/// A pixel (or normalized) coordinate. Serialized as `[x, y]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f64; 2]", into = "[f64; 2]")]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

impl From<[f64; 2]> for Point {
    fn from(v: [f64; 2]) -> Self {
        Self::new(v[0], v[1])
    }
}

impl From<Point> for [f64; 2] {
    fn from(p: Point) -> Self {
        [p.x, p.y]
    }
}

/// Translates a point expressed in a crop's local frame back into the frame the crop
/// was cut from.
pub fn remap(crop_origin: Point, local: Point) -> Point {
    Point::new(crop_origin.x + local.x, crop_origin.y + local.y)
}

/// Center/size box as returned by the detector.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoxGeometry {
    pub cx: f64,
    pub cy: f64,
    pub w: f64,
    pub h: f64,
}

impl BoxGeometry {
    pub fn new(cx: f64, cy: f64, w: f64, h: f64) -> Self {
        Self { cx, cy, w, h }
    }

    pub fn center(&self) -> Point {
        Point::new(self.cx, self.cy)
    }

    pub fn rect(&self) -> Rect {
        Rect {
            x1: self.cx - self.w / 2.0,
            y1: self.cy - self.h / 2.0,
            x2: self.cx + self.w / 2.0,
            y2: self.cy + self.h / 2.0,
        }
    }

    pub fn scaled(&self, width: f64, height: f64) -> Self {
        Self::new(self.cx * width, self.cy * height, self.w * width, self.h * height)
    }

    pub fn strictly_contains(&self, point: Point) -> bool {
        self.rect().strictly_contains(point)
    }
}

/// Axis-aligned rectangle given by its top-left and bottom-right corners.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
}

impl Rect {
    pub fn width(&self) -> f64 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f64 {
        self.y2 - self.y1
    }

    /// Open-interval containment: points on the border are outside.
    pub fn strictly_contains(&self, p: Point) -> bool {
        self.x1 < p.x && p.x < self.x2 && self.y1 < p.y && p.y < self.y2
    }

    /// Integer pixel window of this rectangle inside a `width` x `height` image.
    /// Returns `None` when nothing of the rectangle lies inside the image.
    pub fn pixel_window(&self, width: u32, height: u32) -> Option<PixelWindow> {
        let x0 = self.x1.max(0.0).floor();
        let y0 = self.y1.max(0.0).floor();
        let x1 = self.x2.min(f64::from(width)).ceil();
        let y1 = self.y2.min(f64::from(height)).ceil();
        if !(x1 > x0 && y1 > y0) {
            return None;
        }
        Some(PixelWindow {
            x: x0 as u32,
            y: y0 as u32,
            w: (x1 - x0) as u32,
            h: (y1 - y0) as u32,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PixelWindow {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

impl PixelWindow {
    pub fn origin(&self) -> Point {
        Point::new(f64::from(self.x), f64::from(self.y))
    }
}

/// Minimal rectangle enclosing every box, or `None` for an empty slice.
pub fn union_region<'a, I>(boxes: I) -> Option<Rect>
where
    I: IntoIterator<Item = &'a BoxGeometry>,
{
    boxes.into_iter().map(BoxGeometry::rect).reduce(|acc, r| Rect {
        x1: acc.x1.min(r.x1),
        y1: acc.y1.min(r.y1),
        x2: acc.x2.max(r.x2),
        y2: acc.y2.max(r.y2),
    })
}

/// Maps a point from camera-image pixels into display pixels.
///
/// The display frame may have a different resolution than the capture and puts its
/// origin at the bottom-left, so the y axis is flipped.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewTransform {
    pub image_width: f64,
    pub image_height: f64,
    pub view_width: f64,
    pub view_height: f64,
}

impl ViewTransform {
    pub fn to_view(&self, p: Point) -> Point {
        let sx = self.view_width / self.image_width;
        let sy = self.view_height / self.image_height;
        Point::new(p.x * sx, self.view_height - p.y * sy)
    }
}
