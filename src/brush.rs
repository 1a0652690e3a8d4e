// ============================================================================
// BRUSH ENGINE — stroke sampling, brush masks, stamping
// ============================================================================
//
// A stroke is recorded as raw input samples between `begin_stroke` and
// `end_stroke`. Painting walks consecutive sample pairs, fills gaps wider than
// `spacing * size` with interpolated stamps, and composites a radial mask at
// every stamp with plain "over" blending.

use std::collections::HashMap;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::pixel::{PixelBuffer, Rect, Rgba};

// ============================================================================
// Settings & presets
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BrushSettings {
    size: f32,
    hardness: f32,
    opacity: f32,
    flow: f32,
    spacing: f32,
    pub pressure_sensitive: bool,
    pub tilt_sensitive: bool,
}

impl Default for BrushSettings {
    fn default() -> Self {
        Self {
            size: 10.0,
            hardness: 0.8,
            opacity: 1.0,
            flow: 1.0,
            spacing: 0.25,
            pressure_sensitive: true,
            tilt_sensitive: false,
        }
    }
}

pub const MIN_SPACING: f32 = 0.01;
pub const MAX_SPACING: f32 = 2.0;

impl BrushSettings {
    pub fn size(&self) -> f32 {
        self.size
    }
    pub fn hardness(&self) -> f32 {
        self.hardness
    }
    pub fn opacity(&self) -> f32 {
        self.opacity
    }
    pub fn flow(&self) -> f32 {
        self.flow
    }
    pub fn spacing(&self) -> f32 {
        self.spacing
    }

    /// Radius in pixels at full pressure. Values below one pixel are raised
    /// to one.
    pub fn set_size(&mut self, size: f32) {
        self.size = if size.is_finite() { size.max(1.0) } else { 1.0 };
    }
    pub fn set_hardness(&mut self, hardness: f32) {
        self.hardness = clamp_unit(hardness);
    }
    pub fn set_opacity(&mut self, opacity: f32) {
        self.opacity = clamp_unit(opacity);
    }
    pub fn set_flow(&mut self, flow: f32) {
        self.flow = clamp_unit(flow);
    }
    pub fn set_spacing(&mut self, spacing: f32) {
        self.spacing = if spacing.is_finite() {
            spacing.clamp(MIN_SPACING, MAX_SPACING)
        } else {
            BrushSettings::default().spacing
        };
    }

    pub fn with_size(mut self, size: f32) -> Self {
        self.set_size(size);
        self
    }
    pub fn with_hardness(mut self, hardness: f32) -> Self {
        self.set_hardness(hardness);
        self
    }
    pub fn with_opacity(mut self, opacity: f32) -> Self {
        self.set_opacity(opacity);
        self
    }
    pub fn with_flow(mut self, flow: f32) -> Self {
        self.set_flow(flow);
        self
    }
    pub fn with_spacing(mut self, spacing: f32) -> Self {
        self.set_spacing(spacing);
        self
    }

    /// Distance between stamps in pixels.
    pub fn step_distance(&self) -> f32 {
        self.spacing * self.size
    }
}

fn clamp_unit(v: f32) -> f32 {
    if v.is_nan() { 0.0 } else { v.clamp(0.0, 1.0) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BrushPreset {
    Default,
    Soft,
    Hard,
    Airbrush,
}

impl BrushPreset {
    pub fn all() -> &'static [BrushPreset] {
        &[
            BrushPreset::Default,
            BrushPreset::Soft,
            BrushPreset::Hard,
            BrushPreset::Airbrush,
        ]
    }

    pub fn name(&self) -> &'static str {
        match self {
            BrushPreset::Default => "Default",
            BrushPreset::Soft => "Soft",
            BrushPreset::Hard => "Hard",
            BrushPreset::Airbrush => "Airbrush",
        }
    }

    pub fn settings(&self) -> BrushSettings {
        let base = BrushSettings::default();
        match self {
            BrushPreset::Default => base,
            BrushPreset::Soft => base.with_hardness(0.2),
            BrushPreset::Hard => base.with_hardness(1.0),
            BrushPreset::Airbrush => base
                .with_size(30.0)
                .with_hardness(0.0)
                .with_opacity(0.5)
                .with_flow(0.1),
        }
    }
}

/// User-saved preset collection, stored as bincode bytes by the tool layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PresetLibrary {
    presets: Vec<(String, BrushSettings)>,
}

impl PresetLibrary {
    pub fn insert(&mut self, name: &str, settings: BrushSettings) {
        match self.presets.iter_mut().find(|(n, _)| n == name) {
            Some(entry) => entry.1 = settings,
            None => self.presets.push((name.to_string(), settings)),
        }
    }

    pub fn get(&self, name: &str) -> Option<BrushSettings> {
        self.presets
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, s)| *s)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.presets.iter().map(|(n, _)| n.as_str())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

// ============================================================================
// Samples, stamps, masks
// ============================================================================

/// One raw input sample. `tilt` is the pen tilt in degrees from vertical.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BrushSample {
    pub x: f32,
    pub y: f32,
    pub pressure: f32,
    pub tilt: f32,
    /// Milliseconds since the stroke began.
    pub timestamp: u64,
}

impl BrushSample {
    pub fn new(x: f32, y: f32, pressure: f32, tilt: f32) -> Self {
        Self {
            x,
            y,
            pressure: clamp_unit(pressure),
            tilt,
            timestamp: 0,
        }
    }
}

/// Where a stamp lands after interpolation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StampPoint {
    pub x: f32,
    pub y: f32,
    pub pressure: f32,
    pub tilt: f32,
}

/// Square alpha mask of side `2 * radius + 1`.
#[derive(Debug, Clone, PartialEq)]
pub struct BrushMask {
    radius: u32,
    data: Vec<f32>,
}

impl BrushMask {
    pub fn radius(&self) -> u32 {
        self.radius
    }

    pub fn side(&self) -> u32 {
        self.radius * 2 + 1
    }

    /// Mask value at offset `(dx, dy)` from the centre.
    pub fn at(&self, dx: i32, dy: i32) -> f32 {
        let r = self.radius as i32;
        if dx.abs() > r || dy.abs() > r {
            return 0.0;
        }
        let side = self.side() as usize;
        self.data[(dy + r) as usize * side + (dx + r) as usize]
    }

    pub fn values(&self) -> &[f32] {
        &self.data
    }
}

/// Build a radial mask with linear falloff `1 - d/r`.
///
/// With `hardness == 1` every cell inside the radius is fully on. Below
/// that, cells past the hardness radius are attenuated again by
/// `(1 - d) / (1 - hardness)`, so `hardness == 0` fades across the whole
/// radius.
pub fn create_brush_mask(radius: u32, hardness: f32) -> BrushMask {
    let hardness = clamp_unit(hardness);
    let side = (radius * 2 + 1) as usize;
    let mut data = vec![0.0f32; side * side];
    if radius == 0 {
        data[0] = 1.0;
        return BrushMask { radius, data };
    }
    let r = radius as f32;
    for y in 0..side {
        for x in 0..side {
            let dx = (x as f32 - r) / r;
            let dy = (y as f32 - r) / r;
            let d = (dx * dx + dy * dy).sqrt();
            if d > 1.0 {
                continue;
            }
            let alpha = if hardness >= 1.0 {
                1.0
            } else {
                let mut a = 1.0 - d;
                if d > hardness {
                    a *= (1.0 - d) / (1.0 - hardness);
                }
                a
            };
            data[y * side + x] = alpha.clamp(0.0, 1.0);
        }
    }
    BrushMask { radius, data }
}

/// How a stamp affects the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StampMode {
    #[default]
    Paint,
    Erase,
}

/// Expand raw samples into stamp positions: every sample, plus
/// `ceil(distance / step) - 1` evenly spaced points between any two samples
/// further apart than one step.
pub fn interpolate_stamps(settings: &BrushSettings, samples: &[BrushSample]) -> Vec<StampPoint> {
    let step = settings.step_distance();
    let mut out = Vec::with_capacity(samples.len());
    for (i, cur) in samples.iter().enumerate() {
        if i > 0 {
            let prev = &samples[i - 1];
            let dx = cur.x - prev.x;
            let dy = cur.y - prev.y;
            let distance = (dx * dx + dy * dy).sqrt();
            if step > 0.0 && distance > step {
                let steps = (distance / step).ceil() as u32;
                for j in 1..steps {
                    let t = j as f32 / steps as f32;
                    out.push(StampPoint {
                        x: prev.x + dx * t,
                        y: prev.y + dy * t,
                        pressure: prev.pressure + (cur.pressure - prev.pressure) * t,
                        tilt: prev.tilt + (cur.tilt - prev.tilt) * t,
                    });
                }
            }
        }
        out.push(StampPoint {
            x: cur.x,
            y: cur.y,
            pressure: cur.pressure,
            tilt: cur.tilt,
        });
    }
    out
}

/// Radius of a stamp in whole pixels. Zero means the stamp is skipped.
pub fn stamp_radius(settings: &BrushSettings, pressure: f32, tilt: f32) -> u32 {
    let p = if settings.pressure_sensitive { clamp_unit(pressure) } else { 1.0 };
    let mut size = settings.size * p;
    if settings.tilt_sensitive {
        // A pen laid flat paints a wider mark.
        size *= 1.0 + tilt.abs().min(90.0) / 90.0;
    }
    if size.is_finite() && size > 0.0 { size as u32 } else { 0 }
}

/// Bounding rect touched by the given stamps.
pub fn stamps_bounds(settings: &BrushSettings, stamps: &[StampPoint]) -> Option<Rect> {
    let mut bounds: Option<Rect> = None;
    for s in stamps {
        let r = stamp_radius(settings, s.pressure, s.tilt);
        if r == 0 {
            continue;
        }
        let rect = Rect::new(
            s.x.floor() as i32 - r as i32,
            s.y.floor() as i32 - r as i32,
            r * 2 + 1,
            r * 2 + 1,
        );
        bounds = Some(match bounds {
            Some(b) => b.union(&rect),
            None => rect,
        });
    }
    bounds
}

/// Composite one mask stamp into `buffer`. `color` is straight alpha.
/// Returns the clipped rect that was touched, or `None` when the stamp had
/// no effect.
pub fn draw_brush_point(
    buffer: &mut PixelBuffer,
    settings: &BrushSettings,
    mask: &BrushMask,
    cx: i32,
    cy: i32,
    color: Rgba,
    mode: StampMode,
) -> Option<Rect> {
    let r = mask.radius() as i32;
    let color_alpha = color.a() as f32 / 255.0;
    let strength = settings.opacity * settings.flow * color_alpha;
    if strength <= 0.0 {
        return None;
    }
    let stamp = Rect::new(cx - r, cy - r, mask.side(), mask.side());
    let clipped = stamp.intersect(&buffer.bounds())?;
    let src = [color.r() as f32, color.g() as f32, color.b() as f32, 255.0];

    for y in clipped.y..clipped.bottom() as i32 {
        for x in clipped.x..clipped.right() as i32 {
            let m = mask.at(x - cx, y - cy);
            if m <= 0.0 {
                continue;
            }
            let alpha = m * strength;
            let inv = 1.0 - alpha;
            let Some(px) = buffer.pixel_mut(x, y) else {
                continue;
            };
            match mode {
                StampMode::Paint => {
                    for c in 0..4 {
                        let v = src[c] * alpha + px[c] as f32 * inv;
                        px[c] = v.round().clamp(0.0, 255.0) as u8;
                    }
                }
                StampMode::Erase => {
                    for c in px.iter_mut() {
                        *c = (*c as f32 * inv).round().clamp(0.0, 255.0) as u8;
                    }
                }
            }
        }
    }
    Some(clipped)
}

/// Paint a full sample list onto `buffer`. Returns the dirty rect.
pub fn paint_stroke(
    buffer: &mut PixelBuffer,
    settings: &BrushSettings,
    samples: &[BrushSample],
    color: Rgba,
    mode: StampMode,
) -> Option<Rect> {
    let stamps = interpolate_stamps(settings, samples);
    let mut masks: HashMap<u32, BrushMask> = HashMap::new();
    let mut dirty: Option<Rect> = None;
    for s in &stamps {
        let radius = stamp_radius(settings, s.pressure, s.tilt);
        if radius == 0 {
            continue;
        }
        let mask = masks
            .entry(radius)
            .or_insert_with(|| create_brush_mask(radius, settings.hardness));
        let touched = draw_brush_point(
            buffer,
            settings,
            mask,
            s.x.floor() as i32,
            s.y.floor() as i32,
            color,
            mode,
        );
        if let Some(t) = touched {
            dirty = Some(match dirty {
                Some(d) => d.union(&t),
                None => t,
            });
        }
    }
    dirty
}

// ============================================================================
// Engine state machine
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BrushState {
    #[default]
    Idle,
    Stroking,
}

#[derive(Debug, Default)]
pub struct BrushEngine {
    settings: BrushSettings,
    state: BrushState,
    stroke: Vec<BrushSample>,
    started: Option<Instant>,
    mode: StampMode,
    library: PresetLibrary,
}

impl BrushEngine {
    pub fn new(settings: BrushSettings) -> Self {
        Self {
            settings,
            ..Default::default()
        }
    }

    pub fn settings(&self) -> &BrushSettings {
        &self.settings
    }

    pub fn settings_mut(&mut self) -> &mut BrushSettings {
        &mut self.settings
    }

    pub fn set_settings(&mut self, settings: BrushSettings) {
        self.settings = settings;
    }

    pub fn state(&self) -> BrushState {
        self.state
    }

    pub fn is_stroking(&self) -> bool {
        self.state == BrushState::Stroking
    }

    pub fn samples(&self) -> &[BrushSample] {
        &self.stroke
    }

    pub fn set_erase(&mut self, erase: bool) {
        self.mode = if erase { StampMode::Erase } else { StampMode::Paint };
    }

    pub fn mode(&self) -> StampMode {
        self.mode
    }

    fn elapsed_ms(&self) -> u64 {
        self.started
            .map(|t| t.elapsed().as_millis() as u64)
            .unwrap_or(0)
    }

    /// Start a new stroke at the given point, discarding any previous one.
    pub fn begin_stroke(&mut self, x: f32, y: f32, pressure: f32, tilt: f32) {
        self.stroke.clear();
        self.state = BrushState::Stroking;
        self.started = Some(Instant::now());
        self.stroke.push(BrushSample::new(x, y, pressure, tilt));
        debug!(x, y, pressure, "brush stroke began");
    }

    /// Append a sample. Ignored unless a stroke is in progress.
    pub fn add_point(&mut self, x: f32, y: f32, pressure: f32, tilt: f32) -> bool {
        if self.state != BrushState::Stroking {
            return false;
        }
        let mut sample = BrushSample::new(x, y, pressure, tilt);
        sample.timestamp = self.elapsed_ms();
        self.stroke.push(sample);
        true
    }

    /// Finish the stroke and return to idle. A second call does nothing.
    pub fn end_stroke(&mut self) {
        if self.state == BrushState::Idle && self.stroke.is_empty() {
            return;
        }
        debug!(samples = self.stroke.len(), "brush stroke ended");
        self.stroke.clear();
        self.started = None;
        self.state = BrushState::Idle;
    }

    /// Stamp positions the current stroke would paint.
    pub fn stamp_positions(&self) -> Vec<StampPoint> {
        interpolate_stamps(&self.settings, &self.stroke)
    }

    /// Paint the recorded stroke into `buffer`. `color` is straight alpha.
    pub fn paint_on_buffer(&self, buffer: &mut PixelBuffer, color: Rgba) -> Option<Rect> {
        paint_stroke(buffer, &self.settings, &self.stroke, color, self.mode)
    }

    pub fn available_presets(&self) -> Vec<String> {
        BrushPreset::all()
            .iter()
            .map(|p| p.name().to_string())
            .chain(self.library.names().map(str::to_string))
            .collect()
    }

    /// Load a built-in or saved preset by name. Unknown names are ignored.
    pub fn load_preset(&mut self, name: &str) -> bool {
        if let Some(preset) = BrushPreset::all().iter().find(|p| p.name() == name) {
            self.settings = preset.settings();
            return true;
        }
        match self.library.get(name) {
            Some(settings) => {
                self.settings = settings;
                true
            }
            None => false,
        }
    }

    /// Store the current settings under `name`.
    pub fn save_preset(&mut self, name: &str) {
        self.library.insert(name, self.settings);
    }

    pub fn presets(&self) -> &PresetLibrary {
        &self.library
    }

    pub fn set_presets(&mut self, library: PresetLibrary) {
        self.library = library;
    }
}
