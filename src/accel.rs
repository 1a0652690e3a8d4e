// ============================================================================
// ACCELERATOR BOUNDARY — optional offscreen compositing with CPU fallback
// ============================================================================

use rayon::prelude::*;
use tracing::{debug, warn};

use crate::blend::{BlendMode, blend};
use crate::pixel::{PixelBuffer, Rect, Rgba};

/// An offscreen compositing device. Every method may refuse; the caller
/// then does the same work on the CPU.
pub trait Accelerator: Send {
    fn name(&self) -> &str;

    /// Replace the device surface with `surface`.
    fn upload(&mut self, surface: &PixelBuffer) -> bool;

    /// Composite `source` with its top-left at `dest` (clipped to `dest`'s
    /// size) using Normal blending at `opacity`.
    fn submit(&mut self, source: &PixelBuffer, dest: Rect, opacity: f32) -> bool;

    /// Copy the device surface into `target`. Must leave `target` untouched
    /// when it returns false.
    fn read_back(&mut self, target: &mut PixelBuffer) -> bool;
}

/// Which path handled a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompositePath {
    Accelerated,
    Cpu,
}

/// CPU reference: blend `source` onto `target` with its origin at `dest`.
/// Returns the rect actually written.
pub fn composite_region(target: &mut PixelBuffer, source: &PixelBuffer, dest: Rect, opacity: f32) -> Option<Rect> {
    let opacity = if opacity.is_nan() { 0.0 } else { opacity.clamp(0.0, 1.0) };
    if opacity <= 0.0 {
        return None;
    }
    let placed = Rect::new(dest.x, dest.y, dest.width.min(source.width()), dest.height.min(source.height()));
    let area = placed.intersect(&target.bounds())?;

    let stride = target.stride();
    let src_w = source.width() as usize;
    let src = source.pixels();
    let (x0, x1) = (area.x as usize, area.right() as usize);
    let (y0, y1) = (area.y as usize, area.bottom() as usize);
    let (ox, oy) = (dest.x as i64, dest.y as i64);

    target.pixels_mut()[y0 * stride..y1 * stride]
        .par_chunks_mut(stride)
        .enumerate()
        .for_each(|(row, dst_row)| {
            let sy = ((y0 + row) as i64 - oy) as usize;
            for x in x0..x1 {
                let sx = (x as i64 - ox) as usize;
                let s = (sy * src_w + sx) * 4;
                if src[s + 3] == 0 {
                    continue;
                }
                let d = x * 4;
                let out = blend(
                    Rgba([dst_row[d], dst_row[d + 1], dst_row[d + 2], dst_row[d + 3]]),
                    Rgba([src[s], src[s + 1], src[s + 2], src[s + 3]]),
                    BlendMode::Normal,
                    opacity,
                );
                dst_row[d..d + 4].copy_from_slice(&out.0);
            }
        });
    Some(area)
}

/// In-process accelerator that runs the CPU reference on its own surface.
/// Surfaces larger than `max_dimension` on either side are refused, the way
/// a device refuses textures past its limit.
#[derive(Debug, Clone)]
pub struct SoftwareAccelerator {
    surface: Option<PixelBuffer>,
    max_dimension: u32,
}

impl SoftwareAccelerator {
    pub fn new(max_dimension: u32) -> Self {
        Self {
            surface: None,
            max_dimension,
        }
    }

    pub fn supports_size(&self, width: u32, height: u32) -> bool {
        width <= self.max_dimension && height <= self.max_dimension
    }
}

impl Default for SoftwareAccelerator {
    fn default() -> Self {
        Self::new(8192)
    }
}

impl Accelerator for SoftwareAccelerator {
    fn name(&self) -> &str {
        "software"
    }

    fn upload(&mut self, surface: &PixelBuffer) -> bool {
        if !self.supports_size(surface.width(), surface.height()) {
            self.surface = None;
            return false;
        }
        self.surface = Some(surface.clone());
        true
    }

    fn submit(&mut self, source: &PixelBuffer, dest: Rect, opacity: f32) -> bool {
        if !self.supports_size(source.width(), source.height()) {
            return false;
        }
        match self.surface.as_mut() {
            Some(surface) => {
                composite_region(surface, source, dest, opacity);
                true
            }
            None => false,
        }
    }

    fn read_back(&mut self, target: &mut PixelBuffer) -> bool {
        match &self.surface {
            Some(surface) if surface.width() == target.width() && surface.height() == target.height() => {
                target.pixels_mut().copy_from_slice(surface.pixels());
                true
            }
            _ => false,
        }
    }
}

struct Submission {
    source: PixelBuffer,
    dest: Rect,
    opacity: f32,
}

/// A destination surface that routes submissions through an optional
/// accelerator. The CPU copy is brought up to date lazily; when the device
/// cannot hand its result back, accepted submissions are replayed on the CPU
/// so the output never depends on the accelerator.
pub struct CompositeTarget {
    surface: PixelBuffer,
    accelerator: Option<Box<dyn Accelerator>>,
    /// Accepted by the device but not yet in `surface`.
    pending: Vec<Submission>,
    uploaded: bool,
}

impl std::fmt::Debug for CompositeTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeTarget")
            .field("width", &self.surface.width())
            .field("height", &self.surface.height())
            .field("accelerator", &self.accelerator.as_ref().map(|a| a.name().to_string()))
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl CompositeTarget {
    pub fn new(surface: PixelBuffer) -> Self {
        Self {
            surface,
            accelerator: None,
            pending: Vec::new(),
            uploaded: false,
        }
    }

    pub fn with_accelerator(surface: PixelBuffer, accelerator: Box<dyn Accelerator>) -> Self {
        Self {
            accelerator: Some(accelerator),
            ..Self::new(surface)
        }
    }

    pub fn accelerator_name(&self) -> Option<&str> {
        self.accelerator.as_deref().map(|a| a.name())
    }

    pub fn composite(&mut self, source: &PixelBuffer, dest: Rect, opacity: f32) -> CompositePath {
        if let Some(acc) = self.accelerator.as_mut() {
            if !self.uploaded {
                self.uploaded = self.pending.is_empty() && acc.upload(&self.surface);
            }
            if self.uploaded && acc.submit(source, dest, opacity) {
                self.pending.push(Submission {
                    source: source.clone(),
                    dest,
                    opacity,
                });
                return CompositePath::Accelerated;
            }
            debug!(accelerator = acc.name(), "submission refused, compositing on CPU");
        }
        self.sync();
        composite_region(&mut self.surface, source, dest, opacity);
        // The device copy no longer matches
        self.uploaded = false;
        CompositePath::Cpu
    }

    fn sync(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let read = self
            .accelerator
            .as_mut()
            .is_some_and(|acc| acc.read_back(&mut self.surface));
        if !read {
            warn!(count = self.pending.len(), "accelerator read-back failed, replaying on CPU");
            for s in &self.pending {
                composite_region(&mut self.surface, &s.source, s.dest, s.opacity);
            }
        }
        self.pending.clear();
    }

    /// The composited result with every submission applied.
    pub fn surface(&mut self) -> &PixelBuffer {
        self.sync();
        &self.surface
    }

    pub fn into_surface(mut self) -> PixelBuffer {
        self.sync();
        self.surface
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sprite() -> PixelBuffer {
        let mut buf = PixelBuffer::new(4, 3);
        for y in 0..3 {
            for x in 0..4 {
                let v = (x * 60 + y * 20) as u8;
                buf.set(x, y, Rgba::new(v, 255 - v, 40, 200).premultiply()).unwrap();
            }
        }
        buf
    }

    fn run(target: &mut CompositeTarget) -> Vec<CompositePath> {
        let s = sprite();
        vec![
            target.composite(&s, Rect::new(1, 1, 4, 3), 1.0),
            target.composite(&s, Rect::new(-2, 3, 4, 3), 0.5),
            target.composite(&s, Rect::new(5, 0, 2, 2), 0.8),
        ]
    }

    /// Accepts uploads and submissions but never reads back.
    struct Blind;

    impl Accelerator for Blind {
        fn name(&self) -> &str {
            "blind"
        }
        fn upload(&mut self, _: &PixelBuffer) -> bool {
            true
        }
        fn submit(&mut self, _: &PixelBuffer, _: Rect, _: f32) -> bool {
            true
        }
        fn read_back(&mut self, _: &mut PixelBuffer) -> bool {
            false
        }
    }

    #[test]
    fn accelerated_output_matches_cpu() {
        let base = PixelBuffer::filled(8, 8, Rgba::new(10, 20, 30, 255));
        let mut cpu = CompositeTarget::new(base.clone());
        let mut acc = CompositeTarget::with_accelerator(base, Box::new(SoftwareAccelerator::default()));
        assert!(run(&mut cpu).iter().all(|p| *p == CompositePath::Cpu));
        assert!(run(&mut acc).iter().all(|p| *p == CompositePath::Accelerated));
        assert_eq!(acc.into_surface(), cpu.into_surface());
    }

    #[test]
    fn refused_submissions_fall_back() {
        let base = PixelBuffer::filled(8, 8, Rgba::WHITE);
        let mut cpu = CompositeTarget::new(base.clone());
        let mut small = CompositeTarget::with_accelerator(base, Box::new(SoftwareAccelerator::new(4)));
        run(&mut cpu);
        assert!(run(&mut small).iter().all(|p| *p == CompositePath::Cpu));
        assert_eq!(small.surface(), cpu.surface());
    }

    #[test]
    fn failed_read_back_replays_on_cpu() {
        let base = PixelBuffer::new(8, 8);
        let mut cpu = CompositeTarget::new(base.clone());
        let mut blind = CompositeTarget::with_accelerator(base, Box::new(Blind));
        run(&mut cpu);
        run(&mut blind);
        assert_eq!(blind.accelerator_name(), Some("blind"));
        assert_eq!(blind.into_surface(), cpu.into_surface());
    }

    #[test]
    fn region_is_clipped() {
        let mut target = PixelBuffer::new(3, 3);
        let written = composite_region(&mut target, &PixelBuffer::filled(4, 4, Rgba::BLACK), Rect::new(2, 2, 4, 4), 1.0);
        assert_eq!(written, Some(Rect::new(2, 2, 1, 1)));
        assert_eq!(target.get(2, 2), Some(Rgba::BLACK));
        assert_eq!(target.get(1, 1), Some(Rgba::TRANSPARENT));
        assert_eq!(composite_region(&mut target, &PixelBuffer::new(1, 1), Rect::new(9, 9, 1, 1), 1.0), None);
    }
}
