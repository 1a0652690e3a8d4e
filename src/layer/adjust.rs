// ============================================================================
// ADJUSTMENTS — non-destructive colour transforms for adjustment layers
// ============================================================================
//
// An adjustment never owns pixels. The compositor hands it the composite of
// everything below it and blends the transformed result back with the
// layer's own opacity, mask and blend mode.
//
// Buffers are premultiplied; each transform sees straight colour in 0..255
// and alpha is left untouched. Rows are processed in parallel via rayon.
// ============================================================================

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::params::ParamMap;
use crate::pixel::{PixelBuffer, Rgba};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AdjustmentKind {
    BrightnessContrast,
    HueSaturation,
    ColorBalance,
    Curves,
    Levels,
    PhotoFilter,
    ChannelMixer,
    GradientMap,
    Invert,
    Threshold,
    Posterize,
    SelectiveColor,
    Exposure,
    Vibrance,
    BlackWhite,
}

impl AdjustmentKind {
    pub fn all() -> &'static [AdjustmentKind] {
        &[
            AdjustmentKind::BrightnessContrast,
            AdjustmentKind::HueSaturation,
            AdjustmentKind::ColorBalance,
            AdjustmentKind::Curves,
            AdjustmentKind::Levels,
            AdjustmentKind::PhotoFilter,
            AdjustmentKind::ChannelMixer,
            AdjustmentKind::GradientMap,
            AdjustmentKind::Invert,
            AdjustmentKind::Threshold,
            AdjustmentKind::Posterize,
            AdjustmentKind::SelectiveColor,
            AdjustmentKind::Exposure,
            AdjustmentKind::Vibrance,
            AdjustmentKind::BlackWhite,
        ]
    }

    pub fn name(&self) -> &'static str {
        match self {
            AdjustmentKind::BrightnessContrast => "Brightness/Contrast",
            AdjustmentKind::HueSaturation => "Hue/Saturation",
            AdjustmentKind::ColorBalance => "Color Balance",
            AdjustmentKind::Curves => "Curves",
            AdjustmentKind::Levels => "Levels",
            AdjustmentKind::PhotoFilter => "Photo Filter",
            AdjustmentKind::ChannelMixer => "Channel Mixer",
            AdjustmentKind::GradientMap => "Gradient Map",
            AdjustmentKind::Invert => "Invert",
            AdjustmentKind::Threshold => "Threshold",
            AdjustmentKind::Posterize => "Posterize",
            AdjustmentKind::SelectiveColor => "Selective Color",
            AdjustmentKind::Exposure => "Exposure",
            AdjustmentKind::Vibrance => "Vibrance",
            AdjustmentKind::BlackWhite => "Black & White",
        }
    }

    /// Parameters that leave the image unchanged (or, for one-shot kinds
    /// like Invert and Threshold, their usual starting point).
    pub fn default_params(&self) -> ParamMap {
        match self {
            AdjustmentKind::BrightnessContrast => {
                ParamMap::new().with("brightness", 0.0f32).with("contrast", 0.0f32)
            }
            AdjustmentKind::HueSaturation => ParamMap::new()
                .with("hue", 0.0f32)
                .with("saturation", 0.0f32)
                .with("lightness", 0.0f32),
            AdjustmentKind::ColorBalance => {
                let mut p = ParamMap::new();
                for range in ["shadows", "midtones", "highlights"] {
                    for ch in ["r", "g", "b"] {
                        p.set(&format!("{range}_{ch}"), 0.0f32);
                    }
                }
                p
            }
            AdjustmentKind::Curves => {
                ParamMap::new().with("points", vec![(0.0f32, 0.0f32), (255.0, 255.0)])
            }
            AdjustmentKind::Levels => ParamMap::new()
                .with("in_black", 0.0f32)
                .with("in_white", 255.0f32)
                .with("gamma", 1.0f32)
                .with("out_black", 0.0f32)
                .with("out_white", 255.0f32),
            AdjustmentKind::PhotoFilter => ParamMap::new()
                .with("color", Rgba::new(236, 138, 0, 255))
                .with("density", 25.0f32)
                .with("preserve_luminosity", true),
            AdjustmentKind::ChannelMixer => ParamMap::new()
                .with("red_r", 100.0f32)
                .with("red_g", 0.0f32)
                .with("red_b", 0.0f32)
                .with("green_r", 0.0f32)
                .with("green_g", 100.0f32)
                .with("green_b", 0.0f32)
                .with("blue_r", 0.0f32)
                .with("blue_g", 0.0f32)
                .with("blue_b", 100.0f32)
                .with("monochrome", false),
            AdjustmentKind::GradientMap => ParamMap::new()
                .with("from", Rgba::BLACK)
                .with("to", Rgba::WHITE),
            AdjustmentKind::Invert => ParamMap::new(),
            AdjustmentKind::Threshold => ParamMap::new().with("level", 128.0f32),
            AdjustmentKind::Posterize => ParamMap::new().with("levels", 4i64),
            AdjustmentKind::SelectiveColor => ParamMap::new()
                .with("range", "reds")
                .with("cyan", 0.0f32)
                .with("magenta", 0.0f32)
                .with("yellow", 0.0f32)
                .with("black", 0.0f32),
            AdjustmentKind::Exposure => {
                ParamMap::new().with("exposure", 0.0f32).with("offset", 0.0f32)
            }
            AdjustmentKind::Vibrance => {
                ParamMap::new().with("vibrance", 0.0f32).with("saturation", 0.0f32)
            }
            AdjustmentKind::BlackWhite => ParamMap::new()
                .with("red", 30.0f32)
                .with("green", 59.0f32)
                .with("blue", 11.0f32),
        }
    }
}

// ============================================================================
// HELPER: per-pixel transform on a premultiplied buffer
// ============================================================================

/// Apply `transform` to every non-transparent pixel. The closure receives
/// straight (r, g, b) in 0..255 and returns the new straight colour.
pub fn apply_pixel_transform<F>(buffer: &mut PixelBuffer, transform: F)
where
    F: Fn(f32, f32, f32) -> (f32, f32, f32) + Sync,
{
    let stride = buffer.stride();
    if stride == 0 {
        return;
    }
    buffer.pixels_mut().par_chunks_mut(stride).for_each(|row| {
        for px in row.chunks_exact_mut(4) {
            let a = px[3];
            if a == 0 {
                continue;
            }
            let straight = Rgba([px[0], px[1], px[2], a]).unpremultiply();
            let (nr, ng, nb) = transform(
                straight.r() as f32,
                straight.g() as f32,
                straight.b() as f32,
            );
            let out = Rgba([
                nr.round().clamp(0.0, 255.0) as u8,
                ng.round().clamp(0.0, 255.0) as u8,
                nb.round().clamp(0.0, 255.0) as u8,
                a,
            ])
            .premultiply();
            px.copy_from_slice(&out.0);
        }
    });
}

/// Transform `input` and return the adjusted copy.
pub fn apply_adjustment(kind: AdjustmentKind, params: &ParamMap, input: &PixelBuffer) -> PixelBuffer {
    let mut out = input.clone();
    apply_adjustment_in_place(kind, params, &mut out);
    out
}

pub fn apply_adjustment_in_place(kind: AdjustmentKind, params: &ParamMap, buffer: &mut PixelBuffer) {
    match kind {
        AdjustmentKind::BrightnessContrast => {
            let brightness = params.f32_or("brightness", 0.0).clamp(-255.0, 255.0);
            let contrast = params.f32_or("contrast", 0.0).clamp(-254.0, 254.0);
            let factor = (259.0 * (contrast + 255.0)) / (255.0 * (259.0 - contrast));
            apply_pixel_transform(buffer, move |r, g, b| {
                (
                    factor * (r + brightness - 128.0) + 128.0,
                    factor * (g + brightness - 128.0) + 128.0,
                    factor * (b + brightness - 128.0) + 128.0,
                )
            });
        }
        AdjustmentKind::HueSaturation => {
            let hue_shift = params.f32_or("hue", 0.0);
            let sat_factor = 1.0 + params.f32_or("saturation", 0.0) / 100.0;
            let light_offset = params.f32_or("lightness", 0.0) * 255.0 / 100.0;
            apply_pixel_transform(buffer, move |r, g, b| {
                let (h, s, l) = rgb_to_hsl(r / 255.0, g / 255.0, b / 255.0);
                let nh = ((h + hue_shift / 360.0) % 1.0 + 1.0) % 1.0;
                let ns = (s * sat_factor).clamp(0.0, 1.0);
                let (nr, ng, nb) = hsl_to_rgb(nh, ns, l);
                (
                    nr * 255.0 + light_offset,
                    ng * 255.0 + light_offset,
                    nb * 255.0 + light_offset,
                )
            });
        }
        AdjustmentKind::ColorBalance => {
            let read = |range: &str| {
                [
                    params.f32_or(&format!("{range}_r"), 0.0),
                    params.f32_or(&format!("{range}_g"), 0.0),
                    params.f32_or(&format!("{range}_b"), 0.0),
                ]
            };
            let (shadows, midtones, highlights) = (read("shadows"), read("midtones"), read("highlights"));
            apply_pixel_transform(buffer, move |r, g, b| {
                color_balance_pixel(r, g, b, shadows, midtones, highlights)
            });
        }
        AdjustmentKind::Curves => {
            let master = params
                .points("points")
                .map(build_curves_lut)
                .unwrap_or_else(identity_lut);
            let channel = |key: &str| params.points(key).map(build_curves_lut).unwrap_or_else(identity_lut);
            let (lr, lg, lb) = (channel("red"), channel("green"), channel("blue"));
            apply_pixel_transform(buffer, move |r, g, b| {
                (
                    lr[master[r as usize] as usize] as f32,
                    lg[master[g as usize] as usize] as f32,
                    lb[master[b as usize] as usize] as f32,
                )
            });
        }
        AdjustmentKind::Levels => {
            let lut = build_levels_lut(
                params.f32_or("in_black", 0.0),
                params.f32_or("in_white", 255.0),
                params.f32_or("gamma", 1.0),
                params.f32_or("out_black", 0.0),
                params.f32_or("out_white", 255.0),
            );
            apply_pixel_transform(buffer, move |r, g, b| {
                (lut[r as usize] as f32, lut[g as usize] as f32, lut[b as usize] as f32)
            });
        }
        AdjustmentKind::PhotoFilter => {
            let color = params.color_or("color", Rgba::new(236, 138, 0, 255));
            let density = (params.f32_or("density", 25.0) / 100.0).clamp(0.0, 1.0);
            let preserve = params.bool_or("preserve_luminosity", true);
            let filter = [color.r() as f32, color.g() as f32, color.b() as f32];
            apply_pixel_transform(buffer, move |r, g, b| {
                let mix = |c: f32, f: f32| c * (1.0 - density) + (c * f / 255.0) * density + f * density * 0.25;
                let (mut nr, mut ng, mut nb) = (mix(r, filter[0]), mix(g, filter[1]), mix(b, filter[2]));
                if preserve {
                    let before = luminance(r, g, b);
                    let after = luminance(nr, ng, nb);
                    if after > 0.0 {
                        let k = before / after;
                        nr *= k;
                        ng *= k;
                        nb *= k;
                    }
                }
                (nr, ng, nb)
            });
        }
        AdjustmentKind::ChannelMixer => {
            let row = |out: &str| {
                [
                    params.f32_or(&format!("{out}_r"), 0.0) / 100.0,
                    params.f32_or(&format!("{out}_g"), 0.0) / 100.0,
                    params.f32_or(&format!("{out}_b"), 0.0) / 100.0,
                ]
            };
            let (mr, mg, mb) = (row("red"), row("green"), row("blue"));
            let mono = params.bool_or("monochrome", false);
            apply_pixel_transform(buffer, move |r, g, b| {
                let nr = mr[0] * r + mr[1] * g + mr[2] * b;
                if mono {
                    return (nr, nr, nr);
                }
                (
                    nr,
                    mg[0] * r + mg[1] * g + mg[2] * b,
                    mb[0] * r + mb[1] * g + mb[2] * b,
                )
            });
        }
        AdjustmentKind::GradientMap => {
            let from = params.color_or("from", Rgba::BLACK);
            let to = params.color_or("to", Rgba::WHITE);
            let lut = build_gradient_lut(from, to);
            apply_pixel_transform(buffer, move |r, g, b| {
                let l = (luminance(r, g, b) as usize).min(255);
                let c = lut[l];
                (c[0] as f32, c[1] as f32, c[2] as f32)
            });
        }
        AdjustmentKind::Invert => {
            apply_pixel_transform(buffer, |r, g, b| (255.0 - r, 255.0 - g, 255.0 - b));
        }
        AdjustmentKind::Threshold => {
            let level = params.f32_or("level", 128.0);
            apply_pixel_transform(buffer, move |r, g, b| {
                let v = if luminance(r, g, b) >= level { 255.0 } else { 0.0 };
                (v, v, v)
            });
        }
        AdjustmentKind::Posterize => {
            let factor = params.i64_or("levels", 4).clamp(2, 255) as f32;
            apply_pixel_transform(buffer, move |r, g, b| {
                let p = |v: f32| (v / 255.0 * (factor - 1.0)).round() / (factor - 1.0) * 255.0;
                (p(r), p(g), p(b))
            });
        }
        AdjustmentKind::SelectiveColor => {
            let range = ColorRange::from_name(params.text("range").unwrap_or("reds"));
            let cmyk = [
                params.f32_or("cyan", 0.0) / 100.0,
                params.f32_or("magenta", 0.0) / 100.0,
                params.f32_or("yellow", 0.0) / 100.0,
                params.f32_or("black", 0.0) / 100.0,
            ];
            apply_pixel_transform(buffer, move |r, g, b| selective_color_pixel(r, g, b, range, cmyk));
        }
        AdjustmentKind::Exposure => {
            let gain = 2.0f32.powf(params.f32_or("exposure", 0.0));
            let offset = params.f32_or("offset", 0.0) * 255.0;
            apply_pixel_transform(buffer, move |r, g, b| {
                (r * gain + offset, g * gain + offset, b * gain + offset)
            });
        }
        AdjustmentKind::Vibrance => {
            let v = params.f32_or("vibrance", 0.0) / 100.0;
            let sat_factor = 1.0 + params.f32_or("saturation", 0.0) / 100.0;
            apply_pixel_transform(buffer, move |r, g, b| vibrance_pixel(r, g, b, v, sat_factor));
        }
        AdjustmentKind::BlackWhite => {
            let (rw, gw, bw) = (
                params.f32_or("red", 30.0),
                params.f32_or("green", 59.0),
                params.f32_or("blue", 11.0),
            );
            apply_pixel_transform(buffer, move |r, g, b| {
                let v = ((r * rw + g * gw + b * bw) / 100.0).clamp(0.0, 255.0);
                (v, v, v)
            });
        }
    }
}

#[inline]
fn luminance(r: f32, g: f32, b: f32) -> f32 {
    0.2126 * r + 0.7152 * g + 0.0722 * b
}

fn identity_lut() -> [u8; 256] {
    let mut lut = [0u8; 256];
    for (i, v) in lut.iter_mut().enumerate() {
        *v = i as u8;
    }
    lut
}

#[inline]
fn color_balance_pixel(r: f32, g: f32, b: f32, shadows: [f32; 3], midtones: [f32; 3], highlights: [f32; 3]) -> (f32, f32, f32) {
    let lum = luminance(r, g, b) / 255.0;
    let sw = (1.0 - lum * 2.0).max(0.0).powi(2);
    let hw = (lum * 2.0 - 1.0).max(0.0).powi(2);
    let mw = (1.0 - sw - hw).max(0.0);
    let adj = |c: usize| sw * shadows[c] + mw * midtones[c] + hw * highlights[c];
    (r + adj(0) * 1.28, g + adj(1) * 1.28, b + adj(2) * 1.28)
}

#[inline]
fn vibrance_pixel(r: f32, g: f32, b: f32, v: f32, sat_factor: f32) -> (f32, f32, f32) {
    let (h, s, l) = rgb_to_hsl(r / 255.0, g / 255.0, b / 255.0);
    let boost = if v >= 0.0 { v * (1.0 - s).powi(2) } else { v * s.powi(2) };
    let ns = ((s + boost) * sat_factor).clamp(0.0, 1.0);
    let (nr, ng, nb) = hsl_to_rgb(h, ns, l);
    (nr * 255.0, ng * 255.0, nb * 255.0)
}

pub fn build_levels_lut(in_black: f32, in_white: f32, gamma: f32, out_black: f32, out_white: f32) -> [u8; 256] {
    let mut lut = [0u8; 256];
    let in_range = (in_white - in_black).max(1.0);
    let out_range = out_white - out_black;
    let inv_gamma = 1.0 / gamma.max(0.01);

    for (i, slot) in lut.iter_mut().enumerate() {
        let normalized = ((i as f32 - in_black) / in_range).clamp(0.0, 1.0);
        let output = out_black + normalized.powf(inv_gamma) * out_range;
        *slot = output.round().clamp(0.0, 255.0) as u8;
    }
    lut
}

/// 256-entry lookup table from curve control points using monotone cubic
/// (Fritsch-Carlson) interpolation. Points are sorted by input first.
pub fn build_curves_lut(points: &[(f32, f32)]) -> [u8; 256] {
    let mut pts: Vec<(f32, f32)> = points.iter().copied().filter(|p| p.0.is_finite() && p.1.is_finite()).collect();
    pts.sort_by(|a, b| a.0.total_cmp(&b.0));
    pts.dedup_by(|a, b| (a.0 - b.0).abs() < 1e-6);
    if pts.len() < 2 {
        return identity_lut();
    }

    let n = pts.len();
    let delta: Vec<f32> = pts
        .windows(2)
        .map(|w| (w[1].1 - w[0].1) / (w[1].0 - w[0].0))
        .collect();

    let mut m = vec![0.0f32; n];
    m[0] = delta[0];
    m[n - 1] = delta[n - 2];
    for i in 1..n - 1 {
        m[i] = if delta[i - 1] * delta[i] <= 0.0 {
            0.0
        } else {
            (delta[i - 1] + delta[i]) / 2.0
        };
    }

    for i in 0..n - 1 {
        if delta[i].abs() < 1e-6 {
            m[i] = 0.0;
            m[i + 1] = 0.0;
        } else {
            let alpha = m[i] / delta[i];
            let beta = m[i + 1] / delta[i];
            let s = alpha * alpha + beta * beta;
            if s > 9.0 {
                let tau = 3.0 / s.sqrt();
                m[i] = tau * alpha * delta[i];
                m[i + 1] = tau * beta * delta[i];
            }
        }
    }

    let mut lut = [0u8; 256];
    for (i, slot) in lut.iter_mut().enumerate() {
        let x = i as f32;
        let val = if x <= pts[0].0 {
            pts[0].1
        } else if x >= pts[n - 1].0 {
            pts[n - 1].1
        } else {
            let seg = pts.windows(2).position(|w| x >= w[0].0 && x < w[1].0).unwrap_or(n - 2);
            let (x0, y0) = pts[seg];
            let (x1, y1) = pts[seg + 1];
            let h = x1 - x0;
            let t = (x - x0) / h;
            let t2 = t * t;
            let t3 = t2 * t;
            let h00 = 2.0 * t3 - 3.0 * t2 + 1.0;
            let h10 = t3 - 2.0 * t2 + t;
            let h01 = -2.0 * t3 + 3.0 * t2;
            let h11 = t3 - t2;
            h00 * y0 + h10 * h * m[seg] + h01 * y1 + h11 * h * m[seg + 1]
        };
        *slot = val.round().clamp(0.0, 255.0) as u8;
    }
    lut
}

fn build_gradient_lut(from: Rgba, to: Rgba) -> [[u8; 3]; 256] {
    let mut lut = [[0u8; 3]; 256];
    for (i, slot) in lut.iter_mut().enumerate() {
        let t = i as f32 / 255.0;
        for c in 0..3 {
            let v = from.0[c] as f32 * (1.0 - t) + to.0[c] as f32 * t;
            slot[c] = v.round().clamp(0.0, 255.0) as u8;
        }
    }
    lut
}

// ============================================================================
// SELECTIVE COLOR
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorRange {
    Reds,
    Yellows,
    Greens,
    Cyans,
    Blues,
    Magentas,
    Whites,
    Neutrals,
    Blacks,
}

impl ColorRange {
    pub fn from_name(name: &str) -> ColorRange {
        match name.to_ascii_lowercase().as_str() {
            "yellows" => ColorRange::Yellows,
            "greens" => ColorRange::Greens,
            "cyans" => ColorRange::Cyans,
            "blues" => ColorRange::Blues,
            "magentas" => ColorRange::Magentas,
            "whites" => ColorRange::Whites,
            "neutrals" => ColorRange::Neutrals,
            "blacks" => ColorRange::Blacks,
            _ => ColorRange::Reds,
        }
    }

    /// How strongly a colour with the given HSL belongs to this range.
    fn weight(&self, h_deg: f32, s: f32, l: f32) -> f32 {
        let hue_band = |center: f32| band_weight(h_deg, center) * s;
        match self {
            ColorRange::Reds => hue_band(0.0),
            ColorRange::Yellows => hue_band(60.0),
            ColorRange::Greens => hue_band(120.0),
            ColorRange::Cyans => hue_band(180.0),
            ColorRange::Blues => hue_band(240.0),
            ColorRange::Magentas => hue_band(300.0),
            ColorRange::Whites => ((l - 0.5) * 2.0).max(0.0),
            ColorRange::Blacks => ((0.5 - l) * 2.0).max(0.0),
            ColorRange::Neutrals => 1.0 - s,
        }
    }
}

/// Full weight within ±30° of the band centre, fading to zero at ±45°.
fn band_weight(pixel_hue_deg: f32, band_center_deg: f32) -> f32 {
    let mut dist = (pixel_hue_deg - band_center_deg).abs() % 360.0;
    if dist > 180.0 {
        dist = 360.0 - dist;
    }
    if dist <= 30.0 {
        1.0
    } else if dist < 45.0 {
        1.0 - (dist - 30.0) / 15.0
    } else {
        0.0
    }
}

/// Relative CMYK shift: adding cyan removes red in proportion to how much
/// red is present, and so on; black darkens all three.
fn selective_color_pixel(r: f32, g: f32, b: f32, range: ColorRange, cmyk: [f32; 4]) -> (f32, f32, f32) {
    let (h, s, l) = rgb_to_hsl(r / 255.0, g / 255.0, b / 255.0);
    let w = range.weight(h * 360.0, s, l);
    if w <= 0.0 {
        return (r, g, b);
    }
    let shift = |c: f32, amount: f32| c - (c * (amount + cmyk[3])) * w;
    (shift(r, cmyk[0]), shift(g, cmyk[1]), shift(b, cmyk[2]))
}

// ============================================================================
// COLOUR SPACE HELPERS
// ============================================================================

/// RGB (0..1) → HSL (H: 0..1, S: 0..1, L: 0..1)
pub fn rgb_to_hsl(r: f32, g: f32, b: f32) -> (f32, f32, f32) {
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let l = (max + min) / 2.0;

    if (max - min).abs() < 1e-6 {
        return (0.0, 0.0, l);
    }

    let d = max - min;
    let s = if l > 0.5 { d / (2.0 - max - min) } else { d / (max + min) };

    let h = if (max - r).abs() < 1e-6 {
        let mut h = (g - b) / d;
        if h < 0.0 {
            h += 6.0;
        }
        h / 6.0
    } else if (max - g).abs() < 1e-6 {
        ((b - r) / d + 2.0) / 6.0
    } else {
        ((r - g) / d + 4.0) / 6.0
    };

    (h, s, l)
}

/// HSL (H: 0..1, S: 0..1, L: 0..1) → RGB (0..1)
pub fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s.abs() < 1e-6 {
        return (l, l, l);
    }
    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;
    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid(c: Rgba) -> PixelBuffer {
        PixelBuffer::filled(4, 2, c)
    }

    #[test]
    fn default_params_are_identity_for_tonal_kinds() {
        let src = solid(Rgba::new(90, 140, 200, 255));
        for kind in [
            AdjustmentKind::BrightnessContrast,
            AdjustmentKind::HueSaturation,
            AdjustmentKind::ColorBalance,
            AdjustmentKind::Curves,
            AdjustmentKind::Levels,
            AdjustmentKind::ChannelMixer,
            AdjustmentKind::Exposure,
            AdjustmentKind::Vibrance,
        ] {
            let out = apply_adjustment(kind, &kind.default_params(), &src);
            for (a, b) in out.pixels().iter().zip(src.pixels()) {
                assert!((*a as i32 - *b as i32).abs() <= 1, "{}", kind.name());
            }
        }
    }

    #[test]
    fn invert_preserves_alpha() {
        let src = solid(Rgba::new(10, 20, 30, 255));
        let out = apply_adjustment(AdjustmentKind::Invert, &ParamMap::new(), &src);
        assert_eq!(out.get(0, 0), Some(Rgba::new(245, 235, 225, 255)));
    }

    #[test]
    fn transparent_pixels_are_untouched() {
        let src = PixelBuffer::new(3, 3);
        let out = apply_adjustment(AdjustmentKind::Invert, &ParamMap::new(), &src);
        assert_eq!(out, src);
    }

    #[test]
    fn brightness_shifts_channels() {
        let src = solid(Rgba::new(100, 100, 100, 255));
        let params = ParamMap::new().with("brightness", 50.0f32).with("contrast", 0.0f32);
        let out = apply_adjustment(AdjustmentKind::BrightnessContrast, &params, &src);
        assert_eq!(out.get(0, 0), Some(Rgba::new(150, 150, 150, 255)));
    }

    #[test]
    fn threshold_is_binary() {
        let mut src = PixelBuffer::new(2, 1);
        src.set(0, 0, Rgba::new(30, 30, 30, 255)).unwrap();
        src.set(1, 0, Rgba::new(220, 220, 220, 255)).unwrap();
        let out = apply_adjustment(AdjustmentKind::Threshold, &AdjustmentKind::Threshold.default_params(), &src);
        assert_eq!(out.get(0, 0), Some(Rgba::BLACK));
        assert_eq!(out.get(1, 0), Some(Rgba::WHITE));
    }

    #[test]
    fn hue_rotation_moves_red_to_green() {
        let src = solid(Rgba::new(255, 0, 0, 255));
        let params = ParamMap::new().with("hue", 120.0f32);
        let out = apply_adjustment(AdjustmentKind::HueSaturation, &params, &src);
        assert_eq!(out.get(0, 0), Some(Rgba::new(0, 255, 0, 255)));
    }

    #[test]
    fn curves_lut_is_monotone_and_hits_points() {
        let lut = build_curves_lut(&[(0.0, 0.0), (128.0, 180.0), (255.0, 255.0)]);
        assert_eq!(lut[0], 0);
        assert_eq!(lut[128], 180);
        assert_eq!(lut[255], 255);
        assert!(lut.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn levels_remaps_input_range() {
        let lut = build_levels_lut(50.0, 200.0, 1.0, 0.0, 255.0);
        assert_eq!(lut[50], 0);
        assert_eq!(lut[200], 255);
        assert_eq!(lut[10], 0);
    }

    #[test]
    fn posterize_two_levels() {
        let src = solid(Rgba::new(100, 200, 10, 255));
        let params = ParamMap::new().with("levels", 2i64);
        let out = apply_adjustment(AdjustmentKind::Posterize, &params, &src);
        assert_eq!(out.get(0, 0), Some(Rgba::new(0, 255, 0, 255)));
    }

    #[test]
    fn selective_color_only_touches_its_range() {
        let mut src = PixelBuffer::new(2, 1);
        src.set(0, 0, Rgba::new(255, 0, 0, 255)).unwrap();
        src.set(1, 0, Rgba::new(0, 0, 255, 255)).unwrap();
        let params = AdjustmentKind::SelectiveColor.default_params().with("cyan", 50.0f32);
        let out = apply_adjustment(AdjustmentKind::SelectiveColor, &params, &src);
        assert!(out.get(0, 0).unwrap().r() < 200);
        assert_eq!(out.get(1, 0), Some(Rgba::new(0, 0, 255, 255)));
    }

    #[test]
    fn gradient_map_black_to_white_is_grayscale() {
        let src = solid(Rgba::new(255, 0, 0, 255));
        let out = apply_adjustment(AdjustmentKind::GradientMap, &AdjustmentKind::GradientMap.default_params(), &src);
        let px = out.get(0, 0).unwrap();
        assert_eq!(px.r(), px.g());
        assert_eq!(px.g(), px.b());
    }
}
