//! Layer styles: shadows, glows and strokes rendered from a layer's alpha.
//!
//! Each effect is drawn from the rendered layer pixels. Drop shadow, outer
//! glow and outside strokes sit behind the content; inner shadow, inner glow
//! and inside strokes are clipped to it and drawn on top.

use serde::{Deserialize, Serialize};

use crate::blend::{BlendMode, blend};
use crate::pixel::{PixelBuffer, Rgba, box_blur_plane};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DropShadow {
    pub enabled: bool,
    pub color: Rgba,
    pub opacity: f32,
    /// Light angle in degrees. The shadow falls on the opposite side.
    pub angle: f32,
    pub distance: f32,
    /// 0..1, hardens the shadow edge before blurring.
    pub spread: f32,
    pub size: f32,
}

impl Default for DropShadow {
    fn default() -> Self {
        Self {
            enabled: false,
            color: Rgba::BLACK,
            opacity: 0.75,
            angle: 120.0,
            distance: 5.0,
            spread: 0.0,
            size: 5.0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InnerShadow {
    pub enabled: bool,
    pub color: Rgba,
    pub opacity: f32,
    pub angle: f32,
    pub distance: f32,
    pub choke: f32,
    pub size: f32,
}

impl Default for InnerShadow {
    fn default() -> Self {
        Self {
            enabled: false,
            color: Rgba::BLACK,
            opacity: 0.75,
            angle: 120.0,
            distance: 5.0,
            choke: 0.0,
            size: 5.0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OuterGlow {
    pub enabled: bool,
    pub color: Rgba,
    pub opacity: f32,
    pub spread: f32,
    pub size: f32,
}

impl Default for OuterGlow {
    fn default() -> Self {
        Self {
            enabled: false,
            color: Rgba::new(255, 255, 0, 255),
            opacity: 0.75,
            spread: 0.0,
            size: 5.0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InnerGlow {
    pub enabled: bool,
    pub color: Rgba,
    pub opacity: f32,
    pub choke: f32,
    pub size: f32,
}

impl Default for InnerGlow {
    fn default() -> Self {
        Self {
            enabled: false,
            color: Rgba::new(255, 255, 0, 255),
            opacity: 0.75,
            choke: 0.0,
            size: 5.0,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum StrokePosition {
    #[default]
    Outside,
    Inside,
    Center,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Stroke {
    pub enabled: bool,
    pub color: Rgba,
    pub size: f32,
    pub position: StrokePosition,
}

impl Default for Stroke {
    fn default() -> Self {
        Self {
            enabled: false,
            color: Rgba::BLACK,
            size: 1.0,
            position: StrokePosition::Outside,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LayerEffects {
    pub drop_shadow: DropShadow,
    pub inner_shadow: InnerShadow,
    pub outer_glow: OuterGlow,
    pub inner_glow: InnerGlow,
    pub stroke: Stroke,
}

impl LayerEffects {
    pub fn any_enabled(&self) -> bool {
        self.drop_shadow.enabled
            || self.inner_shadow.enabled
            || self.outer_glow.enabled
            || self.inner_glow.enabled
            || self.stroke.enabled
    }

    /// Return `content` with every enabled effect applied.
    pub fn apply(&self, content: &PixelBuffer) -> PixelBuffer {
        if !self.any_enabled() || content.is_empty() {
            return content.clone();
        }
        let (w, h) = (content.width() as usize, content.height() as usize);
        let alpha = content.alpha_plane();

        let mut out = PixelBuffer::new(content.width(), content.height());

        // Behind the content
        if self.drop_shadow.enabled {
            let s = &self.drop_shadow;
            let (dx, dy) = light_offset(s.angle, s.distance);
            let mut plane = shift_plane(&alpha, w, h, dx, dy);
            spread_plane(&mut plane, s.spread);
            blur(&mut plane, w, h, s.size);
            paint_plane(&mut out, &plane, s.color, s.opacity);
        }
        if self.outer_glow.enabled {
            let g = &self.outer_glow;
            let mut plane = alpha.clone();
            spread_plane(&mut plane, g.spread);
            blur(&mut plane, w, h, g.size);
            paint_plane(&mut out, &plane, g.color, g.opacity);
        }
        let stroke = &self.stroke;
        if stroke.enabled && stroke.position != StrokePosition::Inside {
            let reach = match stroke.position {
                StrokePosition::Center => stroke.size * 0.5,
                _ => stroke.size,
            };
            let grown = dilate(&alpha, w, h, reach.round() as usize);
            let ring: Vec<f32> = grown.iter().zip(&alpha).map(|(g, a)| (g - a).max(0.0)).collect();
            paint_plane(&mut out, &ring, stroke.color, 1.0);
        }

        composite_over(&mut out, content);

        // Clipped to the content
        if self.inner_shadow.enabled {
            let s = &self.inner_shadow;
            let (dx, dy) = light_offset(s.angle, s.distance);
            let inverse: Vec<f32> = alpha.iter().map(|a| 1.0 - a).collect();
            let mut plane = shift_plane_filled(&inverse, w, h, dx, dy, 1.0);
            spread_plane(&mut plane, s.choke);
            blur(&mut plane, w, h, s.size);
            clip(&mut plane, &alpha);
            paint_plane(&mut out, &plane, s.color, s.opacity);
        }
        if self.inner_glow.enabled {
            let g = &self.inner_glow;
            let mut plane: Vec<f32> = alpha.iter().map(|a| 1.0 - a).collect();
            spread_plane(&mut plane, g.choke);
            blur_with_edge(&mut plane, w, h, g.size);
            clip(&mut plane, &alpha);
            paint_plane(&mut out, &plane, g.color, g.opacity);
        }
        if stroke.enabled && stroke.position != StrokePosition::Outside {
            let reach = match stroke.position {
                StrokePosition::Center => stroke.size * 0.5,
                _ => stroke.size,
            };
            let inverse: Vec<f32> = alpha.iter().map(|a| 1.0 - a).collect();
            let grown = dilate(&inverse, w, h, reach.round() as usize);
            let mut ring: Vec<f32> = grown.iter().zip(&inverse).map(|(g, a)| (g - a).max(0.0)).collect();
            clip(&mut ring, &alpha);
            paint_plane(&mut out, &ring, stroke.color, 1.0);
        }
        out
    }
}

/// Offset of a shadow cast by light coming from `angle` degrees.
fn light_offset(angle: f32, distance: f32) -> (i32, i32) {
    let rad = angle.to_radians();
    (
        (-rad.cos() * distance).round() as i32,
        (rad.sin() * distance).round() as i32,
    )
}

fn shift_plane(plane: &[f32], w: usize, h: usize, dx: i32, dy: i32) -> Vec<f32> {
    shift_plane_filled(plane, w, h, dx, dy, 0.0)
}

fn shift_plane_filled(plane: &[f32], w: usize, h: usize, dx: i32, dy: i32, fill: f32) -> Vec<f32> {
    let mut out = vec![fill; plane.len()];
    for y in 0..h as i32 {
        let sy = y - dy;
        if sy < 0 || sy >= h as i32 {
            continue;
        }
        for x in 0..w as i32 {
            let sx = x - dx;
            if sx < 0 || sx >= w as i32 {
                continue;
            }
            out[y as usize * w + x as usize] = plane[sy as usize * w + sx as usize];
        }
    }
    out
}

fn spread_plane(plane: &mut [f32], spread: f32) {
    let spread = spread.clamp(0.0, 0.99);
    if spread <= 0.0 {
        return;
    }
    for v in plane.iter_mut() {
        *v = (*v / (1.0 - spread)).min(1.0);
    }
}

fn blur(plane: &mut [f32], w: usize, h: usize, size: f32) {
    let radius = (size.max(0.0) / 2.0).round() as usize;
    box_blur_plane(plane, w, h, radius, 3);
}

/// Blur treating everything outside the buffer as fully covered, so the
/// canvas border does not glow.
fn blur_with_edge(plane: &mut [f32], w: usize, h: usize, size: f32) {
    let radius = (size.max(0.0) / 2.0).round() as usize;
    if radius == 0 {
        return;
    }
    let pad = radius * 3;
    let (pw, ph) = (w + pad * 2, h + pad * 2);
    let mut padded = vec![1.0f32; pw * ph];
    for y in 0..h {
        padded[(y + pad) * pw + pad..(y + pad) * pw + pad + w].copy_from_slice(&plane[y * w..(y + 1) * w]);
    }
    box_blur_plane(&mut padded, pw, ph, radius, 3);
    for y in 0..h {
        plane[y * w..(y + 1) * w].copy_from_slice(&padded[(y + pad) * pw + pad..(y + pad) * pw + pad + w]);
    }
}

/// Square max filter, separable.
fn dilate(plane: &[f32], w: usize, h: usize, radius: usize) -> Vec<f32> {
    if radius == 0 {
        return plane.to_vec();
    }
    let mut tmp = vec![0.0f32; plane.len()];
    for y in 0..h {
        for x in 0..w {
            let lo = x.saturating_sub(radius);
            let hi = (x + radius).min(w - 1);
            tmp[y * w + x] = plane[y * w + lo..=y * w + hi].iter().copied().fold(0.0, f32::max);
        }
    }
    let mut out = vec![0.0f32; plane.len()];
    for x in 0..w {
        for y in 0..h {
            let lo = y.saturating_sub(radius);
            let hi = (y + radius).min(h - 1);
            out[y * w + x] = (lo..=hi).map(|yy| tmp[yy * w + x]).fold(0.0, f32::max);
        }
    }
    out
}

fn clip(plane: &mut [f32], alpha: &[f32]) {
    for (v, a) in plane.iter_mut().zip(alpha) {
        *v *= a;
    }
}

/// Composite a flat colour through a coverage plane onto `dst`.
fn paint_plane(dst: &mut PixelBuffer, plane: &[f32], color: Rgba, opacity: f32) {
    let src = color.premultiply();
    for (px, &cov) in dst.pixels_mut().chunks_exact_mut(4).zip(plane) {
        let k = cov.clamp(0.0, 1.0) * opacity.clamp(0.0, 1.0);
        if k <= 0.0 {
            continue;
        }
        let out = blend(Rgba([px[0], px[1], px[2], px[3]]), src, BlendMode::Normal, k);
        px.copy_from_slice(&out.0);
    }
}

fn composite_over(dst: &mut PixelBuffer, src: &PixelBuffer) {
    for (d, s) in dst.pixels_mut().chunks_exact_mut(4).zip(src.pixels().chunks_exact(4)) {
        if s[3] == 0 {
            continue;
        }
        let out = blend(Rgba([d[0], d[1], d[2], d[3]]), Rgba([s[0], s[1], s[2], s[3]]), BlendMode::Normal, 1.0);
        d.copy_from_slice(&out.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pixel::Rect;

    fn square() -> PixelBuffer {
        let mut buf = PixelBuffer::new(20, 20);
        buf.fill_rect(Rect::new(5, 5, 10, 10), Rgba::WHITE);
        buf
    }

    #[test]
    fn disabled_effects_return_content_unchanged() {
        let content = square();
        assert_eq!(LayerEffects::default().apply(&content), content);
    }

    #[test]
    fn drop_shadow_appears_down_right_of_content() {
        let mut fx = LayerEffects::default();
        fx.drop_shadow.enabled = true;
        fx.drop_shadow.size = 0.0;
        fx.drop_shadow.angle = 135.0;
        fx.drop_shadow.distance = 3.0;
        let out = fx.apply(&square());
        // Shadow lands outside the square on the lower right
        let p = out.get(16, 16).unwrap_or(Rgba::TRANSPARENT);
        assert!(p.a() > 0);
        assert_eq!((p.r(), p.g(), p.b()), (0, 0, 0));
        // Content itself is still on top
        assert_eq!(out.get(10, 10), Some(Rgba::WHITE));
        // Upper left stays empty
        assert_eq!(out.get(3, 3), Some(Rgba::TRANSPARENT));
    }

    #[test]
    fn outside_stroke_rings_the_shape() {
        let mut fx = LayerEffects::default();
        fx.stroke.enabled = true;
        fx.stroke.size = 2.0;
        fx.stroke.color = Rgba::new(255, 0, 0, 255);
        let out = fx.apply(&square());
        assert_eq!(out.get(4, 10), Some(Rgba::new(255, 0, 0, 255)));
        assert_eq!(out.get(3, 10), Some(Rgba::new(255, 0, 0, 255)));
        assert_eq!(out.get(2, 10), Some(Rgba::TRANSPARENT));
        assert_eq!(out.get(10, 10), Some(Rgba::WHITE));
    }

    #[test]
    fn inside_stroke_stays_within_content() {
        let mut fx = LayerEffects::default();
        fx.stroke.enabled = true;
        fx.stroke.size = 1.0;
        fx.stroke.position = StrokePosition::Inside;
        let out = fx.apply(&square());
        assert_eq!(out.get(5, 10), Some(Rgba::BLACK));
        assert_eq!(out.get(4, 10), Some(Rgba::TRANSPARENT));
        assert_eq!(out.get(10, 10), Some(Rgba::WHITE));
    }

    #[test]
    fn light_angle_offsets() {
        assert_eq!(light_offset(180.0, 4.0), (4, 0));
        assert_eq!(light_offset(90.0, 4.0), (0, 4));
    }
}
