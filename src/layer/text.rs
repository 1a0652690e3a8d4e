// ============================================================================
// TEXT LAYERS — glyph layout and rasterization
// ============================================================================

use std::path::Path;
use std::sync::OnceLock;

use ab_glyph::{point, Font, FontArc, GlyphId, ScaleFont};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::pixel::{PixelBuffer, Rgba};

/// Text alignment options.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TextAlignment {
    #[default]
    Left,
    Center,
    Right,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FontDescriptor {
    pub family: String,
    /// Pixel height of one em.
    pub size: f32,
    pub bold: bool,
    pub italic: bool,
}

impl Default for FontDescriptor {
    fn default() -> Self {
        Self {
            family: "Arial".to_string(),
            size: 12.0,
            bold: false,
            italic: false,
        }
    }
}

impl FontDescriptor {
    pub fn weight(&self) -> u16 {
        if self.bold { 700 } else { 400 }
    }
}

/// Text content of a layer. The rasterized pixels are cached until any
/// property changes.
#[derive(Clone)]
pub struct TextContent {
    text: String,
    font: FontDescriptor,
    color: Rgba,
    alignment: TextAlignment,
    line_spacing: f32,
    font_data: Option<FontArc>,
    cache: OnceLock<PixelBuffer>,
}

impl std::fmt::Debug for TextContent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TextContent")
            .field("text", &self.text)
            .field("font", &self.font)
            .field("color", &self.color)
            .field("alignment", &self.alignment)
            .field("line_spacing", &self.line_spacing)
            .field("has_font_data", &self.font_data.is_some())
            .finish()
    }
}

impl Default for TextContent {
    fn default() -> Self {
        Self::new("")
    }
}

impl TextContent {
    pub fn new(text: &str) -> Self {
        Self {
            text: text.to_string(),
            font: FontDescriptor::default(),
            color: Rgba::BLACK,
            alignment: TextAlignment::Left,
            line_spacing: 1.0,
            font_data: None,
            cache: OnceLock::new(),
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }
    pub fn font(&self) -> &FontDescriptor {
        &self.font
    }
    /// Straight-alpha text colour.
    pub fn color(&self) -> Rgba {
        self.color
    }
    pub fn alignment(&self) -> TextAlignment {
        self.alignment
    }
    pub fn line_spacing(&self) -> f32 {
        self.line_spacing
    }
    pub fn has_font(&self) -> bool {
        self.font_data.is_some()
    }

    pub(crate) fn set_text(&mut self, text: &str) -> bool {
        if self.text == text {
            return false;
        }
        self.text = text.to_string();
        self.invalidate();
        true
    }

    pub(crate) fn set_font(&mut self, font: FontDescriptor) -> bool {
        if self.font == font {
            return false;
        }
        self.font = font;
        // A different family or style needs a different face.
        self.font_data = None;
        self.invalidate();
        true
    }

    pub(crate) fn set_color(&mut self, color: Rgba) -> bool {
        if self.color == color {
            return false;
        }
        self.color = color;
        self.invalidate();
        true
    }

    pub(crate) fn set_alignment(&mut self, alignment: TextAlignment) -> bool {
        if self.alignment == alignment {
            return false;
        }
        self.alignment = alignment;
        self.invalidate();
        true
    }

    pub(crate) fn set_line_spacing(&mut self, spacing: f32) -> bool {
        let spacing = if spacing.is_finite() { spacing.max(0.1) } else { 1.0 };
        if self.line_spacing == spacing {
            return false;
        }
        self.line_spacing = spacing;
        self.invalidate();
        true
    }

    /// Use an already loaded face instead of resolving `font.family`.
    pub(crate) fn set_font_data(&mut self, font: FontArc) {
        self.font_data = Some(font);
        self.invalidate();
    }

    pub(crate) fn invalidate(&mut self) {
        self.cache = OnceLock::new();
    }

    fn resolve_font(&self) -> Option<FontArc> {
        if let Some(font) = &self.font_data {
            return Some(font.clone());
        }
        load_system_font(&self.font.family, self.font.weight(), self.font.italic)
    }

    /// Rasterize into a `width`×`height` transparent buffer with the text
    /// block's top-left corner at `(origin_x, origin_y)`. The result for a
    /// given size is cached.
    pub fn render(&self, width: u32, height: u32, origin_x: f32, origin_y: f32) -> PixelBuffer {
        if let Some(cached) = self.cache.get()
            && cached.width() == width
            && cached.height() == height
        {
            return cached.clone();
        }
        let buf = match self.resolve_font() {
            Some(font) => rasterize_text(
                &font,
                &self.text,
                self.font.size,
                self.alignment,
                self.line_spacing,
                self.color,
                self.font.bold && self.font_data.is_some(),
                origin_x,
                origin_y,
                width,
                height,
            ),
            None => {
                if !self.text.is_empty() {
                    warn!(family = %self.font.family, "no font available, text renders empty");
                }
                PixelBuffer::new(width, height)
            }
        };
        let _ = self.cache.set(buf.clone());
        buf
    }
}

/// Load a font file from disk.
pub fn load_font_file(path: &Path) -> std::io::Result<FontArc> {
    let bytes = std::fs::read(path)?;
    FontArc::try_from_vec(bytes).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

/// Lay out a single line of text left-aligned at x = 0.
/// Returns `(glyphs, total_width)`.
pub fn layout_line(font: &FontArc, text: &str, font_size: f32) -> (Vec<(GlyphId, f32)>, f32) {
    let scaled = font.as_scaled(font_size);
    let mut glyphs = Vec::new();
    let mut cursor_x = 0.0f32;
    let mut last_glyph: Option<GlyphId> = None;

    for ch in text.chars() {
        let glyph_id = font.glyph_id(ch);
        if let Some(prev) = last_glyph {
            cursor_x += scaled.kern(prev, glyph_id);
        }
        glyphs.push((glyph_id, cursor_x));
        cursor_x += scaled.h_advance(glyph_id);
        last_glyph = Some(glyph_id);
    }
    (glyphs, cursor_x)
}

/// Rasterize multi-line text into a premultiplied buffer. Lines are aligned
/// within the width of the longest line; `line_spacing` scales the font's
/// natural line height.
#[allow(clippy::too_many_arguments)]
pub fn rasterize_text(
    font: &FontArc,
    text: &str,
    font_size: f32,
    alignment: TextAlignment,
    line_spacing: f32,
    color: Rgba,
    fake_bold: bool,
    origin_x: f32,
    origin_y: f32,
    width: u32,
    height: u32,
) -> PixelBuffer {
    let mut out = PixelBuffer::new(width, height);
    if text.is_empty() || font_size <= 0.0 {
        return out;
    }
    let scaled = font.as_scaled(font_size);
    let ascent = scaled.ascent();
    let line_height = scaled.height() * line_spacing;

    let lines: Vec<(Vec<(GlyphId, f32)>, f32)> = text
        .split('\n')
        .map(|line| layout_line(font, line, font_size))
        .collect();
    let block_width = lines.iter().map(|(_, w)| *w).fold(0.0f32, f32::max);

    let passes: &[f32] = if fake_bold { &[0.0, font_size / 24.0] } else { &[0.0] };
    for (line_idx, (glyphs, line_width)) in lines.iter().enumerate() {
        let align_offset = match alignment {
            TextAlignment::Left => 0.0,
            TextAlignment::Center => (block_width - line_width) * 0.5,
            TextAlignment::Right => block_width - line_width,
        };
        let baseline = origin_y + ascent + line_idx as f32 * line_height;
        for &(glyph_id, gx) in glyphs {
            for &dx in passes {
                let glyph = glyph_id
                    .with_scale_and_position(font_size, point(origin_x + align_offset + gx + dx, baseline));
                let Some(outlined) = font.outline_glyph(glyph) else {
                    continue;
                };
                let bounds = outlined.px_bounds();
                outlined.draw(|x, y, coverage| {
                    let px = bounds.min.x as i32 + x as i32;
                    let py = bounds.min.y as i32 + y as i32;
                    let alpha = coverage.clamp(0.0, 1.0) * color.a() as f32 / 255.0;
                    if alpha <= 0.0 {
                        return;
                    }
                    if let Some(dst) = out.pixel_mut(px, py) {
                        let src = [color.r() as f32, color.g() as f32, color.b() as f32, 255.0];
                        for c in 0..4 {
                            let v = src[c] * alpha + dst[c] as f32 * (1.0 - alpha);
                            dst[c] = v.round().clamp(0.0, 255.0) as u8;
                        }
                    }
                });
            }
        }
    }
    out
}

/// Load a font by family name, weight and style from the system.
/// `weight` is a CSS-style weight value (400 = Regular, 700 = Bold).
#[cfg(feature = "system-fonts")]
pub fn load_system_font(family: &str, weight: u16, italic: bool) -> Option<FontArc> {
    use font_kit::family_name::FamilyName;
    use font_kit::properties::{Properties, Style, Weight};
    use font_kit::source::SystemSource;

    let mut props = Properties::new();
    props.weight = Weight(weight as f32);
    if italic {
        props.style = Style::Italic;
    }

    let handle = SystemSource::new()
        .select_best_match(
            &[FamilyName::Title(family.to_string()), FamilyName::SansSerif],
            &props,
        )
        .ok()?;
    let font_data = handle.load().ok()?;
    let bytes: Vec<u8> = (*font_data.copy_font_data()?).clone();
    FontArc::try_from_vec(bytes).ok()
}

/// Without system font lookup only explicitly loaded faces can render.
#[cfg(not(feature = "system-fonts"))]
pub fn load_system_font(_family: &str, _weight: u16, _italic: bool) -> Option<FontArc> {
    None
}

/// Sorted, deduplicated list of installed font families.
#[cfg(feature = "system-fonts")]
pub fn enumerate_system_fonts() -> Vec<String> {
    match font_kit::source::SystemSource::new().all_families() {
        Ok(mut families) => {
            families.sort();
            families.dedup();
            families
        }
        Err(_) => Vec::new(),
    }
}
