//! Bottom→top layer compositing.
//!
//! Each visible layer contributes a document-sized source buffer: its own
//! pixels with children and effects applied, or for adjustment layers the
//! accumulator-so-far run through the adjustment. The source is blended onto
//! the accumulator row by row, in parallel when enabled.

use rayon::prelude::*;

use crate::blend::{BlendMode, blend_at};
use crate::layer::{Layer, LayerContent, LayerRender};
use crate::pixel::{PixelBuffer, Rgba};

/// Composite `layers` (bottom→top) into a fresh transparent buffer.
pub fn composite_layers(layers: &[Layer], width: u32, height: u32, parallel: bool) -> PixelBuffer {
    let mut acc = PixelBuffer::new(width, height);
    composite_into(&mut acc, layers, parallel);
    acc
}

/// Composite `layers` on top of whatever `acc` already holds.
pub fn composite_into(acc: &mut PixelBuffer, layers: &[Layer], parallel: bool) {
    for layer in layers {
        composite_layer_onto(acc, layer, parallel);
    }
}

/// Blend a single layer onto `acc` with its mode, opacity, mask and effects.
/// Hidden and fully transparent layers leave `acc` untouched.
pub fn composite_layer_onto(acc: &mut PixelBuffer, layer: &Layer, parallel: bool) {
    if !layer.is_visible() || layer.opacity() <= 0.0 || acc.is_empty() {
        return;
    }
    let (w, h) = (acc.width(), acc.height());
    let mask = layer
        .mask()
        .filter(|m| m.enabled)
        .map(|m| m.factor_plane(layer.position(), w, h));

    match layer.content() {
        LayerContent::Adjustment(adj) => {
            let adjusted = adj.apply_adjustment(acc);
            mix_adjusted(acc, &adjusted, layer.blend_mode(), layer.opacity(), mask.as_deref(), parallel);
        }
        _ => {
            let source = layer_source(layer, w, h, parallel);
            blend_buffers(acc, &source, layer.blend_mode(), layer.opacity(), mask.as_deref(), parallel);
        }
    }
}

/// A layer's pixels with its child layers composited over them and its
/// effects applied. Opacity, mask and blend mode are not applied.
pub fn layer_source(layer: &Layer, width: u32, height: u32, parallel: bool) -> PixelBuffer {
    let mut own = layer.render(width, height);
    if !layer.children().is_empty() {
        composite_into(&mut own, layer.children(), parallel);
    }
    if layer.effects().any_enabled() {
        own = layer.effects().apply(&own);
    }
    own
}

/// Blend `src` onto `dst` pixel by pixel. `mask`, when given, holds one
/// opacity factor per pixel and multiplies `opacity`.
pub fn blend_buffers(
    dst: &mut PixelBuffer,
    src: &PixelBuffer,
    mode: BlendMode,
    opacity: f32,
    mask: Option<&[f32]>,
    parallel: bool,
) {
    if dst.width() != src.width() || dst.height() != src.height() {
        return;
    }
    let width = dst.width() as usize;
    let src_px = src.pixels();
    for_each_row(dst, parallel, |y, row| {
        let src_row = &src_px[y * width * 4..(y + 1) * width * 4];
        for x in 0..width {
            let s = &src_row[x * 4..x * 4 + 4];
            if s[3] == 0 && !matches!(mode, BlendMode::Clear) {
                continue;
            }
            let k = match mask {
                Some(m) => opacity * m[y * width + x],
                None => opacity,
            };
            let d = &mut row[x * 4..x * 4 + 4];
            let out = blend_at(
                x as u32,
                y as u32,
                Rgba([d[0], d[1], d[2], d[3]]),
                Rgba([s[0], s[1], s[2], s[3]]),
                mode,
                k,
            );
            d.copy_from_slice(&out.0);
        }
    });
}

/// Mix an adjusted copy of the accumulator back into it. Normal mode is a
/// straight interpolation so that partially transparent areas keep their
/// alpha; other modes blend the adjusted pixels over the original.
fn mix_adjusted(
    acc: &mut PixelBuffer,
    adjusted: &PixelBuffer,
    mode: BlendMode,
    opacity: f32,
    mask: Option<&[f32]>,
    parallel: bool,
) {
    if mode != BlendMode::Normal {
        blend_buffers(acc, adjusted, mode, opacity, mask, parallel);
        return;
    }
    let width = acc.width() as usize;
    let adj_px = adjusted.pixels();
    for_each_row(acc, parallel, |y, row| {
        let adj_row = &adj_px[y * width * 4..(y + 1) * width * 4];
        for x in 0..width {
            let k = match mask {
                Some(m) => opacity * m[y * width + x],
                None => opacity,
            }
            .clamp(0.0, 1.0);
            if k <= 0.0 {
                continue;
            }
            for c in 0..4 {
                let i = x * 4 + c;
                let v = row[i] as f32 + (adj_row[i] as f32 - row[i] as f32) * k;
                row[i] = v.round().clamp(0.0, 255.0) as u8;
            }
        }
    });
}

/// Run `f(y, row)` over every row of `buf`, on the rayon pool when
/// `parallel` is set. The result does not depend on the choice.
fn for_each_row<F>(buf: &mut PixelBuffer, parallel: bool, f: F)
where
    F: Fn(usize, &mut [u8]) + Sync + Send,
{
    if buf.is_empty() {
        return;
    }
    let stride = buf.stride();
    if parallel {
        buf.pixels_mut()
            .par_chunks_mut(stride)
            .enumerate()
            .for_each(|(y, row)| f(y, row));
    } else {
        buf.pixels_mut()
            .chunks_mut(stride)
            .enumerate()
            .for_each(|(y, row)| f(y, row));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::{AdjustmentKind, LayerMask};
    use crate::pixel::Rect;

    fn checker(w: u32, h: u32) -> PixelBuffer {
        let mut buf = PixelBuffer::new(w, h);
        for y in 0..h as i32 {
            for x in 0..w as i32 {
                let v = ((x * 37 + y * 11) % 256) as u8;
                buf.set(x, y, Rgba::new(v, 255 - v, v / 2, 255)).unwrap();
            }
        }
        buf
    }

    #[test]
    fn single_opaque_layer_is_identity() {
        let img = checker(7, 5);
        let layers = vec![Layer::from_image("L", img.clone())];
        assert_eq!(composite_layers(&layers, 7, 5, true), img);
        assert_eq!(composite_layers(&layers, 7, 5, false), img);
    }

    #[test]
    fn parallel_matches_sequential() {
        let mut top = Layer::from_image("Top", checker(9, 6));
        top.set_blend_mode(BlendMode::Overlay);
        top.set_opacity(0.6);
        let mut dissolve = Layer::from_image("D", PixelBuffer::filled(9, 6, Rgba::new(200, 10, 10, 255)));
        dissolve.set_blend_mode(BlendMode::Dissolve);
        dissolve.set_opacity(0.5);
        let layers = vec![
            Layer::from_image("Bottom", PixelBuffer::filled(9, 6, Rgba::WHITE)),
            top,
            dissolve,
        ];
        assert_eq!(composite_layers(&layers, 9, 6, true), composite_layers(&layers, 9, 6, false));
    }

    #[test]
    fn hidden_layers_are_skipped() {
        let mut top = Layer::from_image("Top", PixelBuffer::filled(2, 2, Rgba::BLACK));
        top.set_visible(false);
        let layers = vec![Layer::from_image("Bottom", PixelBuffer::filled(2, 2, Rgba::WHITE)), top];
        assert_eq!(composite_layers(&layers, 2, 2, false).get(0, 0), Some(Rgba::WHITE));
    }

    #[test]
    fn adjustment_runs_against_accumulator() {
        let layers = vec![
            Layer::from_image("Bottom", PixelBuffer::filled(2, 1, Rgba::new(10, 20, 30, 255))),
            Layer::new_adjustment("Invert", AdjustmentKind::Invert),
        ];
        let out = composite_layers(&layers, 2, 1, false);
        assert_eq!(out.get(1, 0), Some(Rgba::new(245, 235, 225, 255)));
    }

    #[test]
    fn adjustment_does_not_touch_transparent_pixels() {
        let layers = vec![Layer::new_adjustment("Invert", AdjustmentKind::Invert)];
        let out = composite_layers(&layers, 2, 2, false);
        assert!(out.pixels().iter().all(|&b| b == 0));
    }

    #[test]
    fn half_opacity_adjustment_interpolates() {
        let mut adj = Layer::new_adjustment("Invert", AdjustmentKind::Invert);
        adj.set_opacity(0.5);
        let layers = vec![Layer::from_image("Bottom", PixelBuffer::filled(1, 1, Rgba::new(0, 0, 0, 255))), adj];
        let out = composite_layers(&layers, 1, 1, false);
        // 0 → 255 halfway
        assert_eq!(out.get(0, 0), Some(Rgba::new(128, 128, 128, 255)));
    }

    #[test]
    fn mask_hides_layer_where_black() {
        let mut top = Layer::from_image("Top", PixelBuffer::filled(2, 1, Rgba::BLACK));
        let mut mask = LayerMask::new(2, 1);
        mask.set(0, 0, 0);
        top.set_mask(Some(mask));
        let layers = vec![Layer::from_image("Bottom", PixelBuffer::filled(2, 1, Rgba::WHITE)), top];
        let out = composite_layers(&layers, 2, 1, false);
        assert_eq!(out.get(0, 0), Some(Rgba::WHITE));
        assert_eq!(out.get(1, 0), Some(Rgba::BLACK));
    }

    #[test]
    fn disabled_mask_is_ignored() {
        let mut top = Layer::from_image("Top", PixelBuffer::filled(1, 1, Rgba::BLACK));
        top.set_mask(Some(LayerMask::filled(1, 1, 0)));
        top.set_mask_enabled(false);
        let out = composite_layers(&[top], 1, 1, false);
        assert_eq!(out.get(0, 0), Some(Rgba::BLACK));
    }

    #[test]
    fn group_children_composite_inside_parent() {
        let mut group = Layer::from_image("Group", PixelBuffer::new(2, 1));
        let mut child = Layer::from_image("Child", PixelBuffer::new(2, 1));
        child.raster_mut().unwrap().image_mut().fill_rect(Rect::new(1, 0, 1, 1), Rgba::BLACK);
        group.add_child(child);
        group.set_opacity(0.0);
        let layers = vec![Layer::from_image("Bottom", PixelBuffer::filled(2, 1, Rgba::WHITE)), group.clone()];
        // Group opacity hides its children too
        assert_eq!(composite_layers(&layers, 2, 1, false).get(1, 0), Some(Rgba::WHITE));
        group.set_opacity(1.0);
        let layers = vec![Layer::from_image("Bottom", PixelBuffer::filled(2, 1, Rgba::WHITE)), group];
        let out = composite_layers(&layers, 2, 1, false);
        assert_eq!(out.get(1, 0), Some(Rgba::BLACK));
        assert_eq!(out.get(0, 0), Some(Rgba::WHITE));
    }

    #[test]
    fn blend_buffers_ignores_size_mismatch() {
        let mut dst = PixelBuffer::filled(2, 2, Rgba::WHITE);
        let src = PixelBuffer::filled(1, 1, Rgba::BLACK);
        blend_buffers(&mut dst, &src, BlendMode::Normal, 1.0, None, false);
        assert_eq!(dst.get(0, 0), Some(Rgba::WHITE));
    }
}
