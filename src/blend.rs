// ============================================================================
// BLEND MATH — per-pixel blend formulas and premultiplied compositing
// ============================================================================
//
// Every function here is pure. Inputs and outputs are premultiplied RGBA8;
// the mode formulas themselves work on straight colour in [0, 1] and the
// result is re-composited with
//
//   co = cs·(1 - ab) + cb·(1 - as) + as·ab·B(Cb, Cs)
//   ao = as + ab·(1 - as)
//
// where `cs`/`cb` are premultiplied and `Cs`/`Cb` straight.

use serde::{Deserialize, Serialize};

use crate::pixel::Rgba;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum BlendMode {
    #[default]
    Normal,
    Dissolve,
    Behind,
    Clear,
    Darken,
    Multiply,
    ColorBurn,
    LinearBurn,
    DarkerColor,
    Lighten,
    Screen,
    ColorDodge,
    /// Also known as Linear Dodge.
    Add,
    LighterColor,
    Overlay,
    SoftLight,
    HardLight,
    VividLight,
    LinearLight,
    PinLight,
    HardMix,
    Difference,
    Exclusion,
    Subtract,
    Divide,
    Negation,
    Reflect,
    Glow,
    Hue,
    Saturation,
    Color,
    Luminosity,
}

impl BlendMode {
    /// Returns all blend modes in menu order
    pub fn all() -> &'static [BlendMode] {
        &[
            BlendMode::Normal,
            BlendMode::Dissolve,
            BlendMode::Behind,
            BlendMode::Clear,
            BlendMode::Darken,
            BlendMode::Multiply,
            BlendMode::ColorBurn,
            BlendMode::LinearBurn,
            BlendMode::DarkerColor,
            BlendMode::Lighten,
            BlendMode::Screen,
            BlendMode::ColorDodge,
            BlendMode::Add,
            BlendMode::LighterColor,
            BlendMode::Overlay,
            BlendMode::SoftLight,
            BlendMode::HardLight,
            BlendMode::VividLight,
            BlendMode::LinearLight,
            BlendMode::PinLight,
            BlendMode::HardMix,
            BlendMode::Difference,
            BlendMode::Exclusion,
            BlendMode::Subtract,
            BlendMode::Divide,
            BlendMode::Negation,
            BlendMode::Reflect,
            BlendMode::Glow,
            BlendMode::Hue,
            BlendMode::Saturation,
            BlendMode::Color,
            BlendMode::Luminosity,
        ]
    }

    pub fn name(&self) -> &'static str {
        match self {
            BlendMode::Normal => "Normal",
            BlendMode::Dissolve => "Dissolve",
            BlendMode::Behind => "Behind",
            BlendMode::Clear => "Clear",
            BlendMode::Darken => "Darken",
            BlendMode::Multiply => "Multiply",
            BlendMode::ColorBurn => "Color Burn",
            BlendMode::LinearBurn => "Linear Burn",
            BlendMode::DarkerColor => "Darker Color",
            BlendMode::Lighten => "Lighten",
            BlendMode::Screen => "Screen",
            BlendMode::ColorDodge => "Color Dodge",
            BlendMode::Add => "Add",
            BlendMode::LighterColor => "Lighter Color",
            BlendMode::Overlay => "Overlay",
            BlendMode::SoftLight => "Soft Light",
            BlendMode::HardLight => "Hard Light",
            BlendMode::VividLight => "Vivid Light",
            BlendMode::LinearLight => "Linear Light",
            BlendMode::PinLight => "Pin Light",
            BlendMode::HardMix => "Hard Mix",
            BlendMode::Difference => "Difference",
            BlendMode::Exclusion => "Exclusion",
            BlendMode::Subtract => "Subtract",
            BlendMode::Divide => "Divide",
            BlendMode::Negation => "Negation",
            BlendMode::Reflect => "Reflect",
            BlendMode::Glow => "Glow",
            BlendMode::Hue => "Hue",
            BlendMode::Saturation => "Saturation",
            BlendMode::Color => "Color",
            BlendMode::Luminosity => "Luminosity",
        }
    }

    /// Parse a display or identifier name ("Soft Light", "soft_light",
    /// "softlight"). "Linear Dodge" is accepted for [`BlendMode::Add`].
    pub fn from_name(name: &str) -> Option<BlendMode> {
        let key: String = name
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .map(|c| c.to_ascii_lowercase())
            .collect();
        if key == "lineardodge" {
            return Some(BlendMode::Add);
        }
        BlendMode::all().iter().copied().find(|m| {
            m.name()
                .chars()
                .filter(|c| c.is_ascii_alphanumeric())
                .map(|c| c.to_ascii_lowercase())
                .eq(key.chars())
        })
    }

    /// Non-separable modes mix the three channels together.
    pub fn is_separable(&self) -> bool {
        !matches!(
            self,
            BlendMode::Hue
                | BlendMode::Saturation
                | BlendMode::Color
                | BlendMode::Luminosity
                | BlendMode::DarkerColor
                | BlendMode::LighterColor
        )
    }
}

impl std::fmt::Display for BlendMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// Compositing entry points
// ============================================================================

#[inline]
fn to_u8(v: f32) -> u8 {
    (v * 255.0).round().clamp(0.0, 255.0) as u8
}

/// Composite `overlay` onto `base` with `mode`.
///
/// `overlay_alpha` is the layer opacity times the mask factor at this pixel;
/// the overlay's own alpha is multiplied in here.
pub fn blend(base: Rgba, overlay: Rgba, mode: BlendMode, overlay_alpha: f32) -> Rgba {
    let k = overlay_alpha.clamp(0.0, 1.0);
    if overlay.a() == 0 || k <= 0.0 {
        return base;
    }

    let ab = base.a() as f32 / 255.0;
    let a_s = overlay.a() as f32 / 255.0 * k;

    // Premultiplied source scaled by the extra coverage.
    let cs = [
        overlay.r() as f32 / 255.0 * k,
        overlay.g() as f32 / 255.0 * k,
        overlay.b() as f32 / 255.0 * k,
    ];
    let cb = [
        base.r() as f32 / 255.0,
        base.g() as f32 / 255.0,
        base.b() as f32 / 255.0,
    ];

    match mode {
        BlendMode::Normal | BlendMode::Dissolve => {
            if k >= 1.0 && overlay.a() == 255 {
                return overlay;
            }
            let inv = 1.0 - a_s;
            return finish(
                [cs[0] + cb[0] * inv, cs[1] + cb[1] * inv, cs[2] + cb[2] * inv],
                a_s + ab * inv,
            );
        }
        BlendMode::Behind => {
            let inv = 1.0 - ab;
            return finish(
                [cb[0] + cs[0] * inv, cb[1] + cs[1] * inv, cb[2] + cs[2] * inv],
                ab + a_s * inv,
            );
        }
        BlendMode::Clear => {
            let inv = 1.0 - a_s;
            return finish([cb[0] * inv, cb[1] * inv, cb[2] * inv], ab * inv);
        }
        _ => {}
    }

    let straight_s = [cs[0] / a_s, cs[1] / a_s, cs[2] / a_s];
    let straight_b = if ab > 0.0 {
        [cb[0] / ab, cb[1] / ab, cb[2] / ab]
    } else {
        [0.0; 3]
    };
    let mixed = blend_color(straight_b, straight_s, mode);

    let both = a_s * ab;
    let only_s = 1.0 - ab;
    let only_b = 1.0 - a_s;
    let mut out = [0.0f32; 3];
    for c in 0..3 {
        out[c] = cs[c] * only_s + cb[c] * only_b + both * mixed[c].clamp(0.0, 1.0);
    }
    finish(out, a_s + ab * (1.0 - a_s))
}

#[inline]
fn finish(rgb: [f32; 3], alpha: f32) -> Rgba {
    let a = to_u8(alpha);
    Rgba([
        to_u8(rgb[0]).min(a),
        to_u8(rgb[1]).min(a),
        to_u8(rgb[2]).min(a),
        a,
    ])
}

/// Position-aware blend. Identical to [`blend`] except for
/// [`BlendMode::Dissolve`], which turns partial coverage into a per-pixel
/// all-or-nothing choice using a stable hash of `(x, y)`.
pub fn blend_at(x: u32, y: u32, base: Rgba, overlay: Rgba, mode: BlendMode, overlay_alpha: f32) -> Rgba {
    if mode != BlendMode::Dissolve {
        return blend(base, overlay, mode, overlay_alpha);
    }
    let coverage = overlay.a() as f32 / 255.0 * overlay_alpha.clamp(0.0, 1.0);
    if coverage <= 0.0 || dissolve_threshold(x, y) >= coverage {
        return base;
    }
    let mut solid = overlay.unpremultiply();
    solid.0[3] = 255;
    solid
}

/// Deterministic pseudo-random value in [0, 1) for a pixel position.
pub fn dissolve_threshold(x: u32, y: u32) -> f32 {
    let mut h = x.wrapping_mul(0x9E37_79B1) ^ y.wrapping_mul(0x85EB_CA77);
    h ^= h >> 15;
    h = h.wrapping_mul(0x2C1B_3C6D);
    h ^= h >> 12;
    h = h.wrapping_mul(0x297A_2D39);
    h ^= h >> 15;
    (h >> 8) as f32 / (1u32 << 24) as f32
}

// ============================================================================
// Mode formulas on straight colour
// ============================================================================

/// Apply `mode` to straight-alpha colours `cb` (base) and `cs` (overlay).
pub fn blend_color(cb: [f32; 3], cs: [f32; 3], mode: BlendMode) -> [f32; 3] {
    match mode {
        BlendMode::Hue => set_lum(set_sat(cs, sat(cb)), lum(cb)),
        BlendMode::Saturation => set_lum(set_sat(cb, sat(cs)), lum(cb)),
        BlendMode::Color => set_lum(cs, lum(cb)),
        BlendMode::Luminosity => set_lum(cb, lum(cs)),
        BlendMode::DarkerColor => {
            if lum(cs) < lum(cb) {
                cs
            } else {
                cb
            }
        }
        BlendMode::LighterColor => {
            if lum(cs) > lum(cb) {
                cs
            } else {
                cb
            }
        }
        _ => [
            blend_channel(cb[0], cs[0], mode),
            blend_channel(cb[1], cs[1], mode),
            blend_channel(cb[2], cs[2], mode),
        ],
    }
}

/// Separable mode formula for one channel.
pub fn blend_channel(b: f32, s: f32, mode: BlendMode) -> f32 {
    match mode {
        BlendMode::Normal | BlendMode::Dissolve | BlendMode::Behind | BlendMode::Clear => s,
        BlendMode::Multiply => b * s,
        BlendMode::Screen => 1.0 - (1.0 - b) * (1.0 - s),
        BlendMode::Overlay => overlay_channel(b, s),
        BlendMode::HardLight => overlay_channel(s, b),
        BlendMode::SoftLight => soft_light_channel(b, s),
        BlendMode::ColorDodge => color_dodge_channel(b, s),
        BlendMode::ColorBurn => color_burn_channel(b, s),
        BlendMode::Darken => b.min(s),
        BlendMode::Lighten => b.max(s),
        BlendMode::Difference => (b - s).abs(),
        BlendMode::Exclusion => b + s - 2.0 * b * s,
        BlendMode::Add => (b + s).min(1.0),
        BlendMode::Subtract => (b - s).max(0.0),
        BlendMode::Divide => divide_channel(b, s),
        BlendMode::LinearBurn => (b + s - 1.0).max(0.0),
        BlendMode::VividLight => vivid_light_channel(b, s),
        BlendMode::LinearLight => (b + 2.0 * s - 1.0).clamp(0.0, 1.0),
        BlendMode::PinLight => pin_light_channel(b, s),
        BlendMode::HardMix => {
            if b + s >= 1.0 {
                1.0
            } else {
                0.0
            }
        }
        BlendMode::Negation => 1.0 - (1.0 - b - s).abs(),
        BlendMode::Reflect => reflect_channel(b, s),
        BlendMode::Glow => reflect_channel(s, b),
        // Non-separable modes never reach the per-channel path.
        BlendMode::Hue
        | BlendMode::Saturation
        | BlendMode::Color
        | BlendMode::Luminosity
        | BlendMode::DarkerColor
        | BlendMode::LighterColor => s,
    }
}

/// Piecewise on the overlay value: multiply below 0.5, screen above.
fn overlay_channel(base: f32, top: f32) -> f32 {
    if top < 0.5 {
        2.0 * base * top
    } else {
        1.0 - 2.0 * (1.0 - base) * (1.0 - top)
    }
}

fn color_burn_channel(base: f32, top: f32) -> f32 {
    if base >= 1.0 {
        1.0
    } else if top <= 0.0 {
        0.0
    } else {
        (1.0 - (1.0 - base) / top).max(0.0)
    }
}

fn color_dodge_channel(base: f32, top: f32) -> f32 {
    if base <= 0.0 {
        0.0
    } else if top >= 1.0 {
        1.0
    } else {
        (base / (1.0 - top)).min(1.0)
    }
}

fn reflect_channel(base: f32, top: f32) -> f32 {
    if top >= 1.0 {
        1.0
    } else {
        (base * base / (1.0 - top)).min(1.0)
    }
}

fn soft_light_channel(base: f32, top: f32) -> f32 {
    if top <= 0.5 {
        base - (1.0 - 2.0 * top) * base * (1.0 - base)
    } else {
        let d = if base <= 0.25 {
            ((16.0 * base - 12.0) * base + 4.0) * base
        } else {
            base.sqrt()
        };
        base + (2.0 * top - 1.0) * (d - base)
    }
}

fn divide_channel(base: f32, top: f32) -> f32 {
    if top <= 0.0 { 1.0 } else { (base / top).min(1.0) }
}

fn vivid_light_channel(base: f32, top: f32) -> f32 {
    if top <= 0.5 {
        color_burn_channel(base, 2.0 * top)
    } else {
        color_dodge_channel(base, 2.0 * (top - 0.5))
    }
}

fn pin_light_channel(base: f32, top: f32) -> f32 {
    if top <= 0.5 {
        base.min(2.0 * top)
    } else {
        base.max(2.0 * (top - 0.5))
    }
}

// Non-separable helpers (W3C compositing level 1)

#[inline]
pub fn lum(c: [f32; 3]) -> f32 {
    0.3 * c[0] + 0.59 * c[1] + 0.11 * c[2]
}

fn clip_color(c: [f32; 3]) -> [f32; 3] {
    let l = lum(c);
    let n = c[0].min(c[1]).min(c[2]);
    let x = c[0].max(c[1]).max(c[2]);
    let mut out = c;
    if n < 0.0 {
        let d = l - n;
        for v in &mut out {
            *v = if d > 0.0 { l + (*v - l) * l / d } else { l };
        }
    }
    if x > 1.0 {
        let d = x - l;
        for v in &mut out {
            *v = if d > 0.0 { l + (*v - l) * (1.0 - l) / d } else { l };
        }
    }
    out
}

fn set_lum(c: [f32; 3], l: f32) -> [f32; 3] {
    let d = l - lum(c);
    clip_color([c[0] + d, c[1] + d, c[2] + d])
}

#[inline]
fn sat(c: [f32; 3]) -> f32 {
    c[0].max(c[1]).max(c[2]) - c[0].min(c[1]).min(c[2])
}

fn set_sat(c: [f32; 3], s: f32) -> [f32; 3] {
    let max = c[0].max(c[1]).max(c[2]);
    let min = c[0].min(c[1]).min(c[2]);
    let range = max - min;
    let mut out = [0.0; 3];
    if range > 0.0 {
        for i in 0..3 {
            out[i] = (c[i] - min) * s / range;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: Rgba, b: Rgba, tol: i32) -> bool {
        a.0.iter().zip(b.0.iter()).all(|(x, y)| (*x as i32 - *y as i32).abs() <= tol)
    }

    #[test]
    fn normal_opaque_replaces_base() {
        let base = Rgba::new(10, 20, 30, 255);
        let top = Rgba::new(200, 100, 50, 255);
        assert_eq!(blend(base, top, BlendMode::Normal, 1.0), top);
    }

    #[test]
    fn normal_onto_transparent_is_identity_for_partial_alpha() {
        let top = Rgba::new(60, 30, 10, 128);
        assert_eq!(blend(Rgba::TRANSPARENT, top, BlendMode::Normal, 1.0), top);
    }

    #[test]
    fn zero_alpha_returns_base() {
        let base = Rgba::new(1, 2, 3, 255);
        for &mode in BlendMode::all() {
            assert_eq!(blend(base, Rgba::WHITE, mode, 0.0), base, "{mode}");
            assert_eq!(blend(base, Rgba::TRANSPARENT, mode, 1.0), base, "{mode}");
        }
    }

    #[test]
    fn half_opacity_normal_mixes() {
        let out = blend(Rgba::BLACK, Rgba::WHITE, BlendMode::Normal, 0.5);
        assert!(close(out, Rgba::new(128, 128, 128, 255), 1));
    }

    #[test]
    fn multiply_and_screen_formulas() {
        let base = Rgba::new(128, 255, 0, 255);
        let top = Rgba::new(128, 128, 128, 255);
        let m = blend(base, top, BlendMode::Multiply, 1.0);
        assert!(close(m, Rgba::new(64, 128, 0, 255), 1));
        let s = blend(base, top, BlendMode::Screen, 1.0);
        assert!(close(s, Rgba::new(192, 255, 128, 255), 1));
    }

    #[test]
    fn overlay_branches_on_overlay_value() {
        // overlay < 0.5: 2·b·s
        assert!((blend_channel(0.8, 0.25, BlendMode::Overlay) - 0.4).abs() < 1e-6);
        // overlay >= 0.5: screen form
        assert!((blend_channel(0.2, 0.75, BlendMode::Overlay) - 0.6).abs() < 1e-6);
        // hard light swaps the operands
        assert!((blend_channel(0.25, 0.8, BlendMode::HardLight) - 0.4).abs() < 1e-6);
    }

    #[test]
    fn dodge_and_burn_saturate_on_division_by_zero() {
        assert_eq!(blend_channel(0.5, 1.0, BlendMode::ColorDodge), 1.0);
        assert_eq!(blend_channel(0.0, 1.0, BlendMode::ColorDodge), 0.0);
        assert_eq!(blend_channel(0.5, 0.0, BlendMode::ColorBurn), 0.0);
        assert_eq!(blend_channel(1.0, 0.0, BlendMode::ColorBurn), 1.0);
        assert_eq!(blend_channel(0.5, 0.0, BlendMode::Divide), 1.0);
    }

    #[test]
    fn luminosity_keeps_base_hue() {
        let out = blend_color([1.0, 0.0, 0.0], [0.5, 0.5, 0.5], BlendMode::Luminosity);
        assert!((lum(out) - 0.5).abs() < 1e-4);
        assert!(out[0] > out[1] && out[0] > out[2]);
    }

    #[test]
    fn color_mode_takes_overlay_hue() {
        let out = blend_color([0.5, 0.5, 0.5], [0.0, 0.0, 1.0], BlendMode::Color);
        assert!((lum(out) - 0.5).abs() < 1e-4);
        assert!(out[2] > out[0]);
    }

    #[test]
    fn behind_and_clear() {
        let base = Rgba::new(255, 0, 0, 255);
        assert_eq!(blend(base, Rgba::WHITE, BlendMode::Behind, 1.0), base);
        assert_eq!(
            blend(Rgba::TRANSPARENT, Rgba::WHITE, BlendMode::Behind, 1.0),
            Rgba::WHITE
        );
        assert_eq!(blend(base, Rgba::WHITE, BlendMode::Clear, 1.0), Rgba::TRANSPARENT);
    }

    #[test]
    fn dissolve_is_all_or_nothing() {
        let base = Rgba::BLACK;
        let top = Rgba::WHITE;
        let mut hits = 0;
        for y in 0..32 {
            for x in 0..32 {
                let px = blend_at(x, y, base, top, BlendMode::Dissolve, 0.5);
                assert!(px == base || px == top);
                if px == top {
                    hits += 1;
                }
            }
        }
        assert!(hits > 300 && hits < 724, "hits = {hits}");
    }

    #[test]
    fn names_parse_back() {
        for &mode in BlendMode::all() {
            assert_eq!(BlendMode::from_name(mode.name()), Some(mode));
        }
        assert_eq!(BlendMode::from_name("linear_dodge"), Some(BlendMode::Add));
        assert_eq!(BlendMode::from_name("SOFT-LIGHT"), Some(BlendMode::SoftLight));
        assert_eq!(BlendMode::from_name("bogus"), None);
    }

    #[test]
    fn premultiplied_output_never_exceeds_alpha() {
        let base = Rgba::new(100, 100, 100, 128);
        let top = Rgba::new(120, 60, 30, 130);
        for &mode in BlendMode::all() {
            let out = blend(base, top, mode, 0.7);
            assert!(out.r() <= out.a() && out.g() <= out.a() && out.b() <= out.a(), "{mode}");
        }
    }
}
