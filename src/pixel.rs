// ============================================================================
// PIXEL BUFFER — premultiplied RGBA8 raster
// ============================================================================

use serde::{Deserialize, Serialize};

use crate::error::PixelError;

/// A single RGBA8 pixel. Inside a [`PixelBuffer`] the colour channels are
/// premultiplied by alpha.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Rgba(pub [u8; 4]);

impl Rgba {
    pub const TRANSPARENT: Rgba = Rgba([0, 0, 0, 0]);
    pub const BLACK: Rgba = Rgba([0, 0, 0, 255]);
    pub const WHITE: Rgba = Rgba([255, 255, 255, 255]);

    pub const fn new(r: u8, g: u8, b: u8, a: u8) -> Self {
        Rgba([r, g, b, a])
    }

    #[inline]
    pub fn r(self) -> u8 {
        self.0[0]
    }
    #[inline]
    pub fn g(self) -> u8 {
        self.0[1]
    }
    #[inline]
    pub fn b(self) -> u8 {
        self.0[2]
    }
    #[inline]
    pub fn a(self) -> u8 {
        self.0[3]
    }

    /// Convert a straight-alpha colour into premultiplied form.
    pub fn premultiply(self) -> Self {
        let a = self.a() as u32;
        if a == 255 {
            return self;
        }
        let m = |c: u8| ((c as u32 * a + 127) / 255) as u8;
        Rgba([m(self.r()), m(self.g()), m(self.b()), self.a()])
    }

    /// Convert a premultiplied colour back to straight alpha.
    pub fn unpremultiply(self) -> Self {
        let a = self.a() as u32;
        match a {
            0 => Rgba::TRANSPARENT,
            255 => self,
            _ => {
                let u = |c: u8| ((c as u32 * 255 + a / 2) / a).min(255) as u8;
                Rgba([u(self.r()), u(self.g()), u(self.b()), self.a()])
            }
        }
    }

    /// Same colour with alpha scaled by `factor` (premultiplied channels
    /// scale with it).
    pub fn scale_alpha(self, factor: f32) -> Self {
        let f = factor.clamp(0.0, 1.0);
        let s = |c: u8| (c as f32 * f).round() as u8;
        Rgba([s(self.r()), s(self.g()), s(self.b()), s(self.a())])
    }
}

impl From<[u8; 4]> for Rgba {
    fn from(v: [u8; 4]) -> Self {
        Rgba(v)
    }
}

/// Axis-aligned integer rectangle. `x`/`y` may be negative so that regions
/// partially outside a buffer can be described and clipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub const fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub const fn from_size(width: u32, height: u32) -> Self {
        Self::new(0, 0, width, height)
    }

    /// Smallest rect containing both corner points (inclusive).
    pub fn from_points(x0: i32, y0: i32, x1: i32, y1: i32) -> Self {
        let (lx, hx) = (x0.min(x1), x0.max(x1));
        let (ly, hy) = (y0.min(y1), y0.max(y1));
        Self::new(lx, ly, (hx - lx + 1) as u32, (hy - ly + 1) as u32)
    }

    #[inline]
    pub fn right(&self) -> i64 {
        self.x as i64 + self.width as i64
    }

    #[inline]
    pub fn bottom(&self) -> i64 {
        self.y as i64 + self.height as i64
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn contains(&self, x: i32, y: i32) -> bool {
        (x as i64) >= self.x as i64
            && (x as i64) < self.right()
            && (y as i64) >= self.y as i64
            && (y as i64) < self.bottom()
    }

    /// True when `other` lies completely inside `self`.
    pub fn contains_rect(&self, other: &Rect) -> bool {
        other.x >= self.x
            && other.y >= self.y
            && other.right() <= self.right()
            && other.bottom() <= self.bottom()
    }

    /// Overlap of two rects, `None` when they are disjoint.
    pub fn intersect(&self, other: &Rect) -> Option<Rect> {
        let x0 = (self.x as i64).max(other.x as i64);
        let y0 = (self.y as i64).max(other.y as i64);
        let x1 = self.right().min(other.right());
        let y1 = self.bottom().min(other.bottom());
        if x1 <= x0 || y1 <= y0 {
            return None;
        }
        Some(Rect::new(
            x0 as i32,
            y0 as i32,
            (x1 - x0) as u32,
            (y1 - y0) as u32,
        ))
    }

    /// Bounding box of both rects.
    pub fn union(&self, other: &Rect) -> Rect {
        if self.is_empty() {
            return *other;
        }
        if other.is_empty() {
            return *self;
        }
        let x0 = self.x.min(other.x);
        let y0 = self.y.min(other.y);
        let x1 = self.right().max(other.right());
        let y1 = self.bottom().max(other.bottom());
        Rect::new(x0, y0, (x1 - x0 as i64) as u32, (y1 - y0 as i64) as u32)
    }

    /// Grow the rect by `amount` pixels on every side.
    pub fn inflate(&self, amount: u32) -> Rect {
        Rect::new(
            self.x - amount as i32,
            self.y - amount as i32,
            self.width + amount * 2,
            self.height + amount * 2,
        )
    }
}

/// Owned width×height RGBA8 raster, premultiplied alpha, row-major.
///
/// `data.len() == width * height * 4` always holds. Coordinates outside the
/// buffer are rejected rather than wrapped or clamped.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct PixelBuffer {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl std::fmt::Debug for PixelBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PixelBuffer")
            .field("width", &self.width)
            .field("height", &self.height)
            .finish_non_exhaustive()
    }
}

impl PixelBuffer {
    /// Fully transparent buffer.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            data: vec![0; width as usize * height as usize * 4],
        }
    }

    /// Buffer with every pixel set to `color`.
    pub fn filled(width: u32, height: u32, color: Rgba) -> Self {
        let mut buf = Self::new(width, height);
        buf.fill(color);
        buf
    }

    /// Wrap existing premultiplied RGBA8 bytes.
    pub fn from_raw(width: u32, height: u32, data: Vec<u8>) -> Result<Self, PixelError> {
        let expected = width as usize * height as usize * 4;
        if data.len() != expected {
            return Err(PixelError::SizeMismatch {
                width,
                height,
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    #[inline]
    pub fn width(&self) -> u32 {
        self.width
    }

    #[inline]
    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn bounds(&self) -> Rect {
        Rect::from_size(self.width, self.height)
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn pixels(&self) -> &[u8] {
        &self.data
    }

    pub fn pixels_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn into_raw(self) -> Vec<u8> {
        self.data
    }

    /// Bytes per row.
    #[inline]
    pub fn stride(&self) -> usize {
        self.width as usize * 4
    }

    #[inline]
    fn offset(&self, x: i64, y: i64) -> Option<usize> {
        if x < 0 || y < 0 || x >= self.width as i64 || y >= self.height as i64 {
            return None;
        }
        Some((y as usize * self.width as usize + x as usize) * 4)
    }

    /// Pixel at (x, y), or `None` when outside the buffer.
    #[inline]
    pub fn get(&self, x: i32, y: i32) -> Option<Rgba> {
        let i = self.offset(x as i64, y as i64)?;
        Some(Rgba([
            self.data[i],
            self.data[i + 1],
            self.data[i + 2],
            self.data[i + 3],
        ]))
    }

    /// Write a pixel. Out-of-range coordinates leave the buffer untouched.
    #[inline]
    pub fn set(&mut self, x: i32, y: i32, color: Rgba) -> Result<(), PixelError> {
        match self.offset(x as i64, y as i64) {
            Some(i) => {
                self.data[i..i + 4].copy_from_slice(&color.0);
                Ok(())
            }
            None => Err(PixelError::OutOfBounds {
                x: x as i64,
                y: y as i64,
                width: self.width,
                height: self.height,
            }),
        }
    }

    /// Mutable view of one pixel's four bytes.
    #[inline]
    pub fn pixel_mut(&mut self, x: i32, y: i32) -> Option<&mut [u8]> {
        let i = self.offset(x as i64, y as i64)?;
        Some(&mut self.data[i..i + 4])
    }

    pub fn fill(&mut self, color: Rgba) {
        for px in self.data.chunks_exact_mut(4) {
            px.copy_from_slice(&color.0);
        }
    }

    /// Fill only the part of `rect` inside the buffer.
    pub fn fill_rect(&mut self, rect: Rect, color: Rgba) {
        let Some(r) = rect.intersect(&self.bounds()) else {
            return;
        };
        let stride = self.stride();
        for y in r.y as usize..r.bottom() as usize {
            let row = &mut self.data[y * stride..(y + 1) * stride];
            for px in row[r.x as usize * 4..r.right() as usize * 4].chunks_exact_mut(4) {
                px.copy_from_slice(&color.0);
            }
        }
    }

    /// Copy of the pixels under `rect`, clipped to the buffer. A rect that
    /// misses the buffer yields an empty 0×0 buffer.
    pub fn copy_region(&self, rect: Rect) -> PixelBuffer {
        let Some(r) = rect.intersect(&self.bounds()) else {
            return PixelBuffer::new(0, 0);
        };
        let mut out = PixelBuffer::new(r.width, r.height);
        let src_stride = self.stride();
        let dst_stride = out.stride();
        for row in 0..r.height as usize {
            let sy = r.y as usize + row;
            let s = sy * src_stride + r.x as usize * 4;
            out.data[row * dst_stride..(row + 1) * dst_stride]
                .copy_from_slice(&self.data[s..s + dst_stride]);
        }
        out
    }

    /// Replace the pixels at `(x, y)` with `src`, clipping whatever falls
    /// outside. Returns the rect that was actually written.
    pub fn paste(&mut self, src: &PixelBuffer, x: i32, y: i32) -> Option<Rect> {
        let target = Rect::new(x, y, src.width, src.height);
        let r = target.intersect(&self.bounds())?;
        let sx0 = (r.x - x) as usize;
        let sy0 = (r.y - y) as usize;
        let len = r.width as usize * 4;
        let dst_stride = self.stride();
        let src_stride = src.stride();
        for row in 0..r.height as usize {
            let d = (r.y as usize + row) * dst_stride + r.x as usize * 4;
            let s = (sy0 + row) * src_stride + sx0 * 4;
            self.data[d..d + len].copy_from_slice(&src.data[s..s + len]);
        }
        Some(r)
    }

    pub fn flip_horizontal(&mut self) {
        let w = self.width as usize;
        let stride = self.stride();
        for row in self.data.chunks_exact_mut(stride.max(1)) {
            for x in 0..w / 2 {
                let (a, b) = (x * 4, (w - 1 - x) * 4);
                for c in 0..4 {
                    row.swap(a + c, b + c);
                }
            }
        }
    }

    pub fn flip_vertical(&mut self) {
        let h = self.height as usize;
        let stride = self.stride();
        for y in 0..h / 2 {
            let (top, bottom) = self.data.split_at_mut((h - 1 - y) * stride);
            top[y * stride..(y + 1) * stride].swap_with_slice(&mut bottom[..stride]);
        }
    }

    /// Alpha channel as a float plane in [0, 1].
    pub fn alpha_plane(&self) -> Vec<f32> {
        self.data
            .chunks_exact(4)
            .map(|p| p[3] as f32 / 255.0)
            .collect()
    }

    /// Tight bounding rect of pixels with non-zero alpha.
    pub fn opaque_bounds(&self) -> Option<Rect> {
        let (w, h) = (self.width as i32, self.height as i32);
        let (mut x0, mut y0, mut x1, mut y1) = (w, h, -1, -1);
        for y in 0..h {
            for x in 0..w {
                let i = (y as usize * w as usize + x as usize) * 4 + 3;
                if self.data[i] != 0 {
                    x0 = x0.min(x);
                    y0 = y0.min(y);
                    x1 = x1.max(x);
                    y1 = y1.max(y);
                }
            }
        }
        (x1 >= 0).then(|| Rect::from_points(x0, y0, x1, y1))
    }

    /// Nearest-neighbour downscale to fit inside `max_side`, keeping aspect.
    pub fn thumbnail(&self, max_side: u32) -> PixelBuffer {
        if self.is_empty() || max_side == 0 {
            return PixelBuffer::new(0, 0);
        }
        let scale = (max_side as f32 / self.width.max(self.height) as f32).min(1.0);
        let tw = ((self.width as f32 * scale).round() as u32).max(1);
        let th = ((self.height as f32 * scale).round() as u32).max(1);
        let mut out = PixelBuffer::new(tw, th);
        for y in 0..th {
            let sy = ((y as f32 + 0.5) / scale) as u32;
            for x in 0..tw {
                let sx = ((x as f32 + 0.5) / scale) as u32;
                let i = (sy.min(self.height - 1) as usize * self.width as usize
                    + sx.min(self.width - 1) as usize)
                    * 4;
                let o = (y as usize * tw as usize + x as usize) * 4;
                out.data[o..o + 4].copy_from_slice(&self.data[i..i + 4]);
            }
        }
        out
    }
}

/// Separable box blur over a single float plane, repeated `passes` times.
/// Three passes approximate a gaussian of sigma ≈ radius.
pub fn box_blur_plane(plane: &mut [f32], width: usize, height: usize, radius: usize, passes: usize) {
    if radius == 0 || width == 0 || height == 0 {
        return;
    }
    let mut tmp = vec![0.0f32; plane.len()];
    for _ in 0..passes {
        // Horizontal
        for y in 0..height {
            let row = &plane[y * width..(y + 1) * width];
            let out = &mut tmp[y * width..(y + 1) * width];
            let mut acc = 0.0f32;
            for i in 0..=radius {
                acc += row[i.min(width - 1)];
            }
            acc += row[0] * radius as f32;
            let win = (radius * 2 + 1) as f32;
            for (x, o) in out.iter_mut().enumerate() {
                *o = acc / win;
                let add = row[(x + radius + 1).min(width - 1)];
                let sub = row[x.saturating_sub(radius)];
                acc += add - sub;
            }
        }
        // Vertical
        for x in 0..width {
            let mut acc = 0.0f32;
            for i in 0..=radius {
                acc += tmp[i.min(height - 1) * width + x];
            }
            acc += tmp[x] * radius as f32;
            let win = (radius * 2 + 1) as f32;
            for y in 0..height {
                plane[y * width + x] = acc / win;
                let add = tmp[(y + radius + 1).min(height - 1) * width + x];
                let sub = tmp[y.saturating_sub(radius) * width + x];
                acc += add - sub;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_buffer_has_exact_length() {
        let buf = PixelBuffer::new(7, 3);
        assert_eq!(buf.pixels().len(), 7 * 3 * 4);
        assert!(buf.pixels().iter().all(|&b| b == 0));
    }

    #[test]
    fn from_raw_rejects_wrong_length() {
        let err = PixelBuffer::from_raw(2, 2, vec![0; 15]).unwrap_err();
        assert!(matches!(err, PixelError::SizeMismatch { expected: 16, actual: 15, .. }));
    }

    #[test]
    fn out_of_range_access_is_rejected_not_wrapped() {
        let mut buf = PixelBuffer::new(4, 4);
        assert!(buf.get(4, 0).is_none());
        assert!(buf.get(-1, 0).is_none());
        assert!(buf.set(0, 4, Rgba::WHITE).is_err());
        assert!(buf.set(-1, -1, Rgba::WHITE).is_err());
        assert!(buf.pixels().iter().all(|&b| b == 0));
        buf.set(3, 3, Rgba::WHITE).unwrap();
        assert_eq!(buf.get(3, 3), Some(Rgba::WHITE));
        assert_eq!(buf.get(0, 0), Some(Rgba::TRANSPARENT));
    }

    #[test]
    fn copy_region_clips_to_buffer() {
        let mut buf = PixelBuffer::new(4, 4);
        buf.set(3, 3, Rgba::BLACK).unwrap();
        let region = buf.copy_region(Rect::new(2, 2, 10, 10));
        assert_eq!((region.width(), region.height()), (2, 2));
        assert_eq!(region.get(1, 1), Some(Rgba::BLACK));
        assert!(buf.copy_region(Rect::new(10, 10, 2, 2)).is_empty());
    }

    #[test]
    fn paste_clips_and_reports_written_rect() {
        let mut dst = PixelBuffer::new(4, 4);
        let src = PixelBuffer::filled(3, 3, Rgba::WHITE);
        let written = dst.paste(&src, -1, 2).unwrap();
        assert_eq!(written, Rect::new(0, 2, 2, 2));
        assert_eq!(dst.get(0, 2), Some(Rgba::WHITE));
        assert_eq!(dst.get(1, 3), Some(Rgba::WHITE));
        assert_eq!(dst.get(2, 2), Some(Rgba::TRANSPARENT));
        assert!(dst.paste(&src, 10, 10).is_none());
    }

    #[test]
    fn flips_mirror_pixels() {
        let mut buf = PixelBuffer::new(3, 2);
        buf.set(0, 0, Rgba::WHITE).unwrap();
        buf.flip_horizontal();
        assert_eq!(buf.get(2, 0), Some(Rgba::WHITE));
        buf.flip_vertical();
        assert_eq!(buf.get(2, 1), Some(Rgba::WHITE));
        assert_eq!(buf.get(2, 0), Some(Rgba::TRANSPARENT));
    }

    #[test]
    fn premultiply_roundtrip_is_close() {
        let c = Rgba::new(200, 100, 50, 128);
        let p = c.premultiply();
        assert_eq!(p, Rgba::new(100, 50, 25, 128));
        let u = p.unpremultiply();
        for (a, b) in u.0.iter().zip(c.0.iter()) {
            assert!((*a as i32 - *b as i32).abs() <= 1);
        }
    }

    #[test]
    fn rect_intersection_and_union() {
        let a = Rect::new(0, 0, 10, 10);
        let b = Rect::new(5, -5, 10, 10);
        assert_eq!(a.intersect(&b), Some(Rect::new(5, 0, 5, 5)));
        assert_eq!(a.union(&b), Rect::new(0, -5, 15, 15));
        assert!(a.intersect(&Rect::new(10, 0, 2, 2)).is_none());
        assert_eq!(Rect::from_points(4, 4, 1, 2), Rect::new(1, 2, 4, 3));
    }

    #[test]
    fn opaque_bounds_and_thumbnail() {
        let mut buf = PixelBuffer::new(8, 4);
        assert!(buf.opaque_bounds().is_none());
        buf.fill_rect(Rect::new(2, 1, 3, 2), Rgba::BLACK);
        assert_eq!(buf.opaque_bounds(), Some(Rect::new(2, 1, 3, 2)));
        let thumb = buf.thumbnail(4);
        assert_eq!((thumb.width(), thumb.height()), (4, 2));
    }

    #[test]
    fn box_blur_spreads_energy() {
        let mut plane = vec![0.0f32; 9];
        plane[4] = 1.0;
        box_blur_plane(&mut plane, 3, 3, 1, 1);
        assert!(plane[0] > 0.0);
        assert!(plane[4] < 1.0);
    }
}
