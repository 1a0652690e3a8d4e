// ============================================================================
// SHAPES — anti-aliased line, rectangle and ellipse rasterization via SDFs
// ============================================================================

use rayon::prelude::*;

use crate::blend::{BlendMode, blend};
use crate::pixel::{PixelBuffer, Rect, Rgba};

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Shape {
    Line { x0: f32, y0: f32, x1: f32, y1: f32 },
    /// Corners in canvas coordinates, any order.
    Rectangle { x0: f32, y0: f32, x1: f32, y1: f32 },
    Ellipse { cx: f32, cy: f32, rx: f32, ry: f32 },
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ShapeStyle {
    /// Straight-alpha outline colour.
    pub stroke: Rgba,
    pub stroke_width: f32,
    /// Interior colour. Lines ignore it.
    pub fill: Option<Rgba>,
    pub anti_alias: bool,
}

impl Default for ShapeStyle {
    fn default() -> Self {
        Self {
            stroke: Rgba::BLACK,
            stroke_width: 1.0,
            fill: None,
            anti_alias: true,
        }
    }
}

// ============================================================================
// SDF functions — return signed distance (negative = inside)
// ============================================================================

/// SDF for a box centred at origin with half-extents (hx, hy).
#[inline]
fn sdf_box(px: f32, py: f32, hx: f32, hy: f32) -> f32 {
    let dx = px.abs() - hx;
    let dy = py.abs() - hy;
    let outside = (dx.max(0.0) * dx.max(0.0) + dy.max(0.0) * dy.max(0.0)).sqrt();
    let inside = dx.max(dy).min(0.0);
    outside + inside
}

/// SDF for an ellipse (approximation).
#[inline]
fn sdf_ellipse(px: f32, py: f32, rx: f32, ry: f32) -> f32 {
    let nx = px / rx;
    let ny = py / ry;
    let len = (nx * nx + ny * ny).sqrt();
    if len < 1e-8 {
        return -rx.min(ry);
    }
    let scale = (rx * rx * ny * ny + ry * ry * nx * nx).sqrt() / (rx * ry * len);
    (len - 1.0) / scale
}

/// Unsigned distance to a line segment.
#[inline]
fn dist_segment(px: f32, py: f32, ax: f32, ay: f32, bx: f32, by: f32) -> f32 {
    let dx = bx - ax;
    let dy = by - ay;
    let len_sq = dx * dx + dy * dy;
    let t = if len_sq > 0.0 {
        (((px - ax) * dx + (py - ay) * dy) / len_sq).clamp(0.0, 1.0)
    } else {
        0.0
    };
    let cx = ax + t * dx;
    let cy = ay + t * dy;
    ((px - cx) * (px - cx) + (py - cy) * (py - cy)).sqrt()
}

#[inline]
fn smoothstep(edge0: f32, edge1: f32, x: f32) -> f32 {
    let t = ((x - edge0) / (edge1 - edge0)).clamp(0.0, 1.0);
    t * t * (3.0 - 2.0 * t)
}

#[inline]
fn coverage(d: f32, anti_alias: bool) -> f32 {
    if anti_alias {
        smoothstep(0.5, -0.5, d)
    } else if d < 0.0 {
        1.0
    } else {
        0.0
    }
}

impl Shape {
    /// Signed distance from a point to the shape's boundary region.
    /// For lines the "inside" is the segment itself.
    fn sdf(&self, px: f32, py: f32) -> f32 {
        match *self {
            Shape::Line { x0, y0, x1, y1 } => dist_segment(px, py, x0, y0, x1, y1),
            Shape::Rectangle { x0, y0, x1, y1 } => {
                let (cx, cy) = ((x0 + x1) * 0.5, (y0 + y1) * 0.5);
                sdf_box(px - cx, py - cy, (x1 - x0).abs() * 0.5, (y1 - y0).abs() * 0.5)
            }
            Shape::Ellipse { cx, cy, rx, ry } => {
                if rx <= 0.0 || ry <= 0.0 {
                    return f32::MAX;
                }
                sdf_ellipse(px - cx, py - cy, rx, ry)
            }
        }
    }

    fn extent(&self) -> (f32, f32, f32, f32) {
        match *self {
            Shape::Line { x0, y0, x1, y1 } | Shape::Rectangle { x0, y0, x1, y1 } => {
                (x0.min(x1), y0.min(y1), x0.max(x1), y0.max(y1))
            }
            Shape::Ellipse { cx, cy, rx, ry } => (cx - rx, cy - ry, cx + rx, cy + ry),
        }
    }

    /// Canvas pixels the shape may touch with `style`, clipped to
    /// `width`×`height`.
    pub fn bounds(&self, style: &ShapeStyle, width: u32, height: u32) -> Option<Rect> {
        let (min_x, min_y, max_x, max_y) = self.extent();
        let pad = style.stroke_width.max(0.0) + 2.0;
        let x0 = (min_x - pad).floor() as i32;
        let y0 = (min_y - pad).floor() as i32;
        let x1 = (max_x + pad).ceil() as i32;
        let y1 = (max_y + pad).ceil() as i32;
        Rect::from_points(x0, y0, x1, y1).intersect(&Rect::from_size(width, height))
    }
}

/// Composite `shape` onto `buffer` and return the touched rect.
pub fn draw_shape(buffer: &mut PixelBuffer, shape: &Shape, style: &ShapeStyle) -> Option<Rect> {
    let area = shape.bounds(style, buffer.width(), buffer.height())?;
    let half = style.stroke_width.max(0.0) * 0.5;
    let is_line = matches!(shape, Shape::Line { .. });
    let fill = if is_line { None } else { style.fill.map(Rgba::premultiply) };
    let stroke = style.stroke.premultiply();
    let aa = style.anti_alias;

    let stride = buffer.stride();
    let (x0, x1) = (area.x as usize, area.right() as usize);
    let (y0, y1) = (area.y as usize, area.bottom() as usize);
    buffer.pixels_mut()[y0 * stride..y1 * stride]
        .par_chunks_mut(stride)
        .enumerate()
        .for_each(|(row, row_buf)| {
            let py = (y0 + row) as f32 + 0.5;
            for x in x0..x1 {
                let px = x as f32 + 0.5;
                let d = shape.sdf(px, py);
                let idx = x * 4;
                let mut out = Rgba([row_buf[idx], row_buf[idx + 1], row_buf[idx + 2], row_buf[idx + 3]]);
                if let Some(fill) = fill {
                    let cov = coverage(d, aa);
                    if cov > 0.001 {
                        out = blend(out, fill, BlendMode::Normal, cov);
                    }
                }
                if half > 0.0 {
                    let band = if is_line { d - half } else { d.abs() - half };
                    let cov = coverage(band, aa);
                    if cov > 0.001 {
                        out = blend(out, stroke, BlendMode::Normal, cov);
                    }
                }
                row_buf[idx..idx + 4].copy_from_slice(&out.0);
            }
        });
    Some(area)
}
