//! Layers: shared properties plus variant content (raster pixels, an
//! adjustment applied in context, or text rasterized on demand).

pub mod adjust;
pub mod effects;
pub mod text;

use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::blend::BlendMode;
use crate::params::ParamMap;
use crate::pixel::{PixelBuffer, Rect, Rgba, box_blur_plane};

pub use adjust::AdjustmentKind;
pub use effects::LayerEffects;
pub use text::{FontDescriptor, TextAlignment, TextContent};

pub type LayerId = Uuid;

// ============================================================================
// TRANSFORM
// ============================================================================

/// 2D affine transform: `x' = a·x + c·y + tx`, `y' = b·x + d·y + ty`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Transform2D {
    pub a: f32,
    pub b: f32,
    pub c: f32,
    pub d: f32,
    pub tx: f32,
    pub ty: f32,
}

impl Default for Transform2D {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Transform2D {
    pub const IDENTITY: Transform2D = Transform2D {
        a: 1.0,
        b: 0.0,
        c: 0.0,
        d: 1.0,
        tx: 0.0,
        ty: 0.0,
    };

    pub fn translate(tx: f32, ty: f32) -> Self {
        Self { tx, ty, ..Self::IDENTITY }
    }

    pub fn scale(sx: f32, sy: f32) -> Self {
        Self {
            a: sx,
            d: sy,
            ..Self::IDENTITY
        }
    }

    /// Rotation by `degrees` around `(cx, cy)`.
    pub fn rotate_about(degrees: f32, cx: f32, cy: f32) -> Self {
        let (s, c) = degrees.to_radians().sin_cos();
        let rot = Self {
            a: c,
            b: s,
            c: -s,
            d: c,
            tx: 0.0,
            ty: 0.0,
        };
        Self::translate(-cx, -cy).then(&rot).then(&Self::translate(cx, cy))
    }

    /// `self` followed by `next`.
    pub fn then(&self, next: &Transform2D) -> Transform2D {
        Transform2D {
            a: next.a * self.a + next.c * self.b,
            b: next.b * self.a + next.d * self.b,
            c: next.a * self.c + next.c * self.d,
            d: next.b * self.c + next.d * self.d,
            tx: next.a * self.tx + next.c * self.ty + next.tx,
            ty: next.b * self.tx + next.d * self.ty + next.ty,
        }
    }

    pub fn apply(&self, x: f32, y: f32) -> (f32, f32) {
        (self.a * x + self.c * y + self.tx, self.b * x + self.d * y + self.ty)
    }

    pub fn inverse(&self) -> Option<Transform2D> {
        let det = self.a * self.d - self.b * self.c;
        if det.abs() < 1e-8 || !det.is_finite() {
            return None;
        }
        let inv = 1.0 / det;
        let a = self.d * inv;
        let b = -self.b * inv;
        let c = -self.c * inv;
        let d = self.a * inv;
        Some(Transform2D {
            a,
            b,
            c,
            d,
            tx: -(a * self.tx + c * self.ty),
            ty: -(b * self.tx + d * self.ty),
        })
    }

    pub fn is_identity(&self) -> bool {
        *self == Self::IDENTITY
    }
}

/// Bilinear sample of a premultiplied buffer at a continuous position.
/// Samples outside the buffer read as transparent.
fn sample_bilinear(src: &PixelBuffer, x: f32, y: f32) -> Rgba {
    let fx = x - 0.5;
    let fy = y - 0.5;
    let x0 = fx.floor() as i32;
    let y0 = fy.floor() as i32;
    let tx = fx - x0 as f32;
    let ty = fy - y0 as f32;
    let px = |xx: i32, yy: i32| src.get(xx, yy).unwrap_or(Rgba::TRANSPARENT).0;
    let (p00, p10, p01, p11) = (px(x0, y0), px(x0 + 1, y0), px(x0, y0 + 1), px(x0 + 1, y0 + 1));
    let mut out = [0u8; 4];
    for c in 0..4 {
        let top = p00[c] as f32 * (1.0 - tx) + p10[c] as f32 * tx;
        let bottom = p01[c] as f32 * (1.0 - tx) + p11[c] as f32 * tx;
        out[c] = (top * (1.0 - ty) + bottom * ty).round().clamp(0.0, 255.0) as u8;
    }
    Rgba(out)
}

/// Place `image` into a `width`×`height` canvas at `position`, then apply
/// `transform` in canvas space.
fn place_image(
    image: &PixelBuffer,
    position: (i32, i32),
    transform: Option<&Transform2D>,
    width: u32,
    height: u32,
) -> PixelBuffer {
    let transform = transform.filter(|t| !t.is_identity());
    let Some(t) = transform else {
        if position == (0, 0) && image.width() == width && image.height() == height {
            return image.clone();
        }
        let mut out = PixelBuffer::new(width, height);
        out.paste(image, position.0, position.1);
        return out;
    };
    let mut out = PixelBuffer::new(width, height);
    let Some(inv) = t.inverse() else {
        return out;
    };
    for y in 0..height {
        for x in 0..width {
            let (sx, sy) = inv.apply(x as f32 + 0.5, y as f32 + 0.5);
            let p = sample_bilinear(image, sx - position.0 as f32, sy - position.1 as f32);
            if p.a() != 0 {
                let _ = out.set(x as i32, y as i32, p);
            }
        }
    }
    out
}

// ============================================================================
// MASK
// ============================================================================

/// Grayscale mask; 255 reveals the layer, 0 hides it.
#[derive(Clone, Debug, PartialEq)]
pub struct LayerMask {
    width: u32,
    height: u32,
    data: Vec<u8>,
    pub enabled: bool,
    /// Linked masks move with the layer position.
    pub linked: bool,
    pub inverted: bool,
    pub offset: (i32, i32),
    density: f32,
    feather: f32,
}

impl LayerMask {
    /// A mask that reveals everything.
    pub fn new(width: u32, height: u32) -> Self {
        Self::filled(width, height, 255)
    }

    pub fn filled(width: u32, height: u32, value: u8) -> Self {
        Self {
            width,
            height,
            data: vec![value; width as usize * height as usize],
            enabled: true,
            linked: true,
            inverted: false,
            offset: (0, 0),
            density: 1.0,
            feather: 0.0,
        }
    }

    /// Mask from a buffer's alpha channel.
    pub fn from_alpha(buffer: &PixelBuffer) -> Self {
        let mut mask = Self::filled(buffer.width(), buffer.height(), 0);
        for (m, px) in mask.data.iter_mut().zip(buffer.pixels().chunks_exact(4)) {
            *m = px[3];
        }
        mask
    }

    pub fn width(&self) -> u32 {
        self.width
    }
    pub fn height(&self) -> u32 {
        self.height
    }
    pub fn data(&self) -> &[u8] {
        &self.data
    }
    pub fn density(&self) -> f32 {
        self.density
    }
    pub fn feather(&self) -> f32 {
        self.feather
    }

    pub fn set_density(&mut self, density: f32) {
        self.density = if density.is_finite() { density.clamp(0.0, 1.0) } else { 1.0 };
    }

    pub fn set_feather(&mut self, feather: f32) {
        self.feather = if feather.is_finite() { feather.max(0.0) } else { 0.0 };
    }

    pub fn get(&self, x: i32, y: i32) -> Option<u8> {
        if x < 0 || y < 0 || x as u32 >= self.width || y as u32 >= self.height {
            return None;
        }
        Some(self.data[y as usize * self.width as usize + x as usize])
    }

    pub fn set(&mut self, x: i32, y: i32, value: u8) -> bool {
        if x < 0 || y < 0 || x as u32 >= self.width || y as u32 >= self.height {
            return false;
        }
        self.data[y as usize * self.width as usize + x as usize] = value;
        true
    }

    pub fn fill_rect(&mut self, rect: Rect, value: u8) {
        let Some(r) = rect.intersect(&Rect::from_size(self.width, self.height)) else {
            return;
        };
        for y in r.y as usize..r.bottom() as usize {
            let row = y * self.width as usize;
            self.data[row + r.x as usize..row + r.right() as usize].fill(value);
        }
    }

    pub fn invert(&mut self) {
        for v in &mut self.data {
            *v = 255 - *v;
        }
    }

    pub fn flip_horizontal(&mut self) {
        let w = self.width as usize;
        if w == 0 {
            return;
        }
        for row in self.data.chunks_exact_mut(w) {
            row.reverse();
        }
    }

    pub fn flip_vertical(&mut self) {
        let w = self.width as usize;
        if w == 0 {
            return;
        }
        let rows: Vec<Vec<u8>> = self.data.chunks_exact(w).rev().map(<[u8]>::to_vec).collect();
        self.data = rows.concat();
    }

    /// Per-pixel opacity factor over a `width`×`height` canvas.
    ///
    /// The factor is `1 - density·(1 - m)` where `m` is the (feathered) mask
    /// value. Canvas pixels the mask does not cover keep factor 1.
    pub fn factor_plane(&self, layer_position: (i32, i32), width: u32, height: u32) -> Vec<f32> {
        let (w, h) = (width as usize, height as usize);
        let mut plane = vec![1.0f32; w * h];
        let origin = if self.linked {
            (layer_position.0 + self.offset.0, layer_position.1 + self.offset.1)
        } else {
            self.offset
        };
        for y in 0..h {
            let my = y as i32 - origin.1;
            for x in 0..w {
                let mx = x as i32 - origin.0;
                if let Some(m) = self.get(mx, my) {
                    let mut v = m as f32 / 255.0;
                    if self.inverted {
                        v = 1.0 - v;
                    }
                    plane[y * w + x] = v;
                }
            }
        }
        if self.feather > 0.0 {
            box_blur_plane(&mut plane, w, h, self.feather.round() as usize, 3);
        }
        for v in &mut plane {
            *v = 1.0 - self.density * (1.0 - v.clamp(0.0, 1.0));
        }
        plane
    }
}

// ============================================================================
// CONTENT
// ============================================================================

/// Pixel content with a per-layer selection and clipboard.
#[derive(Clone, Debug, PartialEq)]
pub struct RasterContent {
    image: PixelBuffer,
    original: Option<PixelBuffer>,
    selection: Option<Rect>,
    clipboard: Option<PixelBuffer>,
}

impl RasterContent {
    pub fn new(image: PixelBuffer) -> Self {
        Self {
            image,
            original: None,
            selection: None,
            clipboard: None,
        }
    }

    pub fn image(&self) -> &PixelBuffer {
        &self.image
    }

    pub fn image_mut(&mut self) -> &mut PixelBuffer {
        &mut self.image
    }

    /// Swap in a new image, returning the old one.
    pub fn replace_image(&mut self, image: PixelBuffer) -> PixelBuffer {
        std::mem::replace(&mut self.image, image)
    }

    /// Snapshot the image before an interactive edit.
    pub fn begin_edit(&mut self) {
        self.original = Some(self.image.clone());
    }

    pub fn original_image(&self) -> Option<&PixelBuffer> {
        self.original.as_ref()
    }

    /// Drop the snapshot, returning it.
    pub fn commit_edit(&mut self) -> Option<PixelBuffer> {
        self.original.take()
    }

    /// Restore the snapshot taken by [`begin_edit`](Self::begin_edit).
    pub fn revert_edit(&mut self) -> bool {
        match self.original.take() {
            Some(original) => {
                self.image = original;
                true
            }
            None => false,
        }
    }

    pub fn selection(&self) -> Option<Rect> {
        self.selection
    }

    /// Selections are clipped to the image; a disjoint rect clears it.
    pub fn set_selection(&mut self, selection: Option<Rect>) {
        self.selection = selection.and_then(|r| r.intersect(&self.image.bounds()));
    }

    pub fn select_all(&mut self) {
        self.set_selection(Some(self.image.bounds()));
    }

    fn target_rect(&self) -> Rect {
        self.selection.unwrap_or_else(|| self.image.bounds())
    }

    pub fn clipboard(&self) -> Option<&PixelBuffer> {
        self.clipboard.as_ref()
    }

    /// Copy the selection (or the whole image) into the clipboard.
    pub fn copy(&mut self) -> bool {
        let region = self.image.copy_region(self.target_rect());
        if region.is_empty() {
            return false;
        }
        self.clipboard = Some(region);
        true
    }

    pub fn cut(&mut self) -> bool {
        if !self.copy() {
            return false;
        }
        self.clear();
        true
    }

    /// Paste the clipboard with its top-left at `(x, y)`.
    pub fn paste(&mut self, x: i32, y: i32) -> Option<Rect> {
        let clip = self.clipboard.as_ref()?;
        self.image.paste(clip, x, y)
    }

    /// Make the selection (or the whole image) transparent.
    pub fn clear(&mut self) {
        let rect = self.target_rect();
        self.image.fill_rect(rect, Rgba::TRANSPARENT);
    }

    pub fn flip_horizontal(&mut self) {
        match self.selection {
            Some(rect) => {
                let mut region = self.image.copy_region(rect);
                region.flip_horizontal();
                self.image.paste(&region, rect.x, rect.y);
            }
            None => self.image.flip_horizontal(),
        }
    }

    pub fn flip_vertical(&mut self) {
        match self.selection {
            Some(rect) => {
                let mut region = self.image.copy_region(rect);
                region.flip_vertical();
                self.image.paste(&region, rect.x, rect.y);
            }
            None => self.image.flip_vertical(),
        }
    }
}

/// Adjustment type plus its parameters. Produces no pixels of its own.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AdjustmentContent {
    pub kind: AdjustmentKind,
    pub params: ParamMap,
}

impl AdjustmentContent {
    pub fn new(kind: AdjustmentKind) -> Self {
        Self {
            kind,
            params: kind.default_params(),
        }
    }

    pub fn with_params(kind: AdjustmentKind, params: ParamMap) -> Self {
        Self { kind, params }
    }

    /// Transform an already composited buffer.
    pub fn apply_adjustment(&self, input: &PixelBuffer) -> PixelBuffer {
        adjust::apply_adjustment(self.kind, &self.params, input)
    }
}

#[derive(Clone, Debug)]
pub enum LayerContent {
    Raster(RasterContent),
    Adjustment(AdjustmentContent),
    Text(TextContent),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlipAxis {
    Horizontal,
    Vertical,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LayerKind {
    Raster,
    Adjustment,
    Text,
}

impl LayerContent {
    pub fn kind(&self) -> LayerKind {
        match self {
            LayerContent::Raster(_) => LayerKind::Raster,
            LayerContent::Adjustment(_) => LayerKind::Adjustment,
            LayerContent::Text(_) => LayerKind::Text,
        }
    }
}

// ============================================================================
// LAYER
// ============================================================================

/// A change recorded by [`Layer::on_property_changed`], waiting to be
/// drained by the owning document.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LayerChange {
    pub layer: LayerId,
    pub parent: Option<LayerId>,
}

#[derive(Clone, Debug)]
pub struct Layer {
    id: LayerId,
    name: String,
    visible: bool,
    locked: bool,
    opacity: f32,
    blend_mode: BlendMode,
    position: (i32, i32),
    transform: Option<Transform2D>,
    mask: Option<LayerMask>,
    effects: LayerEffects,
    children: Vec<Layer>,
    parent: Option<LayerId>,
    created: SystemTime,
    modified: SystemTime,
    pending_change: bool,
    content: LayerContent,
}

impl Layer {
    fn with_content(name: &str, content: LayerContent) -> Self {
        let now = SystemTime::now();
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            visible: true,
            locked: false,
            opacity: 1.0,
            blend_mode: BlendMode::Normal,
            position: (0, 0),
            transform: None,
            mask: None,
            effects: LayerEffects::default(),
            children: Vec::new(),
            parent: None,
            created: now,
            modified: now,
            pending_change: false,
            content,
        }
    }

    /// Transparent raster layer.
    pub fn new_raster(name: &str, width: u32, height: u32) -> Self {
        Self::from_image(name, PixelBuffer::new(width, height))
    }

    pub fn from_image(name: &str, image: PixelBuffer) -> Self {
        Self::with_content(name, LayerContent::Raster(RasterContent::new(image)))
    }

    pub fn new_adjustment(name: &str, kind: AdjustmentKind) -> Self {
        Self::with_content(name, LayerContent::Adjustment(AdjustmentContent::new(kind)))
    }

    pub fn new_text(name: &str, text: &str) -> Self {
        Self::with_content(name, LayerContent::Text(TextContent::new(text)))
    }

    pub fn id(&self) -> LayerId {
        self.id
    }
    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn is_visible(&self) -> bool {
        self.visible
    }
    pub fn is_locked(&self) -> bool {
        self.locked
    }
    pub fn opacity(&self) -> f32 {
        self.opacity
    }
    pub fn blend_mode(&self) -> BlendMode {
        self.blend_mode
    }
    pub fn position(&self) -> (i32, i32) {
        self.position
    }
    pub fn transform(&self) -> Option<&Transform2D> {
        self.transform.as_ref()
    }
    pub fn mask(&self) -> Option<&LayerMask> {
        self.mask.as_ref()
    }
    pub fn effects(&self) -> &LayerEffects {
        &self.effects
    }
    pub fn children(&self) -> &[Layer] {
        &self.children
    }
    pub fn parent(&self) -> Option<LayerId> {
        self.parent
    }
    pub fn created(&self) -> SystemTime {
        self.created
    }
    pub fn modified(&self) -> SystemTime {
        self.modified
    }
    pub fn content(&self) -> &LayerContent {
        &self.content
    }
    pub fn kind(&self) -> LayerKind {
        self.content.kind()
    }

    pub fn raster(&self) -> Option<&RasterContent> {
        match &self.content {
            LayerContent::Raster(r) => Some(r),
            _ => None,
        }
    }

    pub fn adjustment(&self) -> Option<&AdjustmentContent> {
        match &self.content {
            LayerContent::Adjustment(a) => Some(a),
            _ => None,
        }
    }

    pub fn text(&self) -> Option<&TextContent> {
        match &self.content {
            LayerContent::Text(t) => Some(t),
            _ => None,
        }
    }

    /// Mutable raster content. Counts as a property change.
    pub fn raster_mut(&mut self) -> Option<&mut RasterContent> {
        if !matches!(self.content, LayerContent::Raster(_)) {
            return None;
        }
        self.on_property_changed();
        match &mut self.content {
            LayerContent::Raster(r) => Some(r),
            _ => None,
        }
    }

    pub fn adjustment_mut(&mut self) -> Option<&mut AdjustmentContent> {
        if !matches!(self.content, LayerContent::Adjustment(_)) {
            return None;
        }
        self.on_property_changed();
        match &mut self.content {
            LayerContent::Adjustment(a) => Some(a),
            _ => None,
        }
    }

    /// Stamp the modification time and queue a change notification for the
    /// owner. Every mutator funnels through here.
    pub fn on_property_changed(&mut self) {
        self.modified = SystemTime::now();
        self.pending_change = true;
    }

    /// Drain pending changes for this layer and its descendants. A changed
    /// child also marks its parent modified.
    pub fn take_changes(&mut self) -> Vec<LayerChange> {
        let mut changes = Vec::new();
        for child in &mut self.children {
            changes.extend(child.take_changes());
        }
        if changes.iter().any(|c| c.parent == Some(self.id)) {
            self.modified = SystemTime::now();
            self.pending_change = true;
        }
        if std::mem::take(&mut self.pending_change) {
            changes.push(LayerChange {
                layer: self.id,
                parent: self.parent,
            });
        }
        changes
    }

    pub fn has_pending_change(&self) -> bool {
        self.pending_change || self.children.iter().any(Layer::has_pending_change)
    }

    pub fn set_name(&mut self, name: &str) {
        if self.name != name {
            self.name = name.to_string();
            self.on_property_changed();
        }
    }

    pub fn set_visible(&mut self, visible: bool) {
        if self.visible != visible {
            self.visible = visible;
            self.on_property_changed();
        }
    }

    pub fn set_locked(&mut self, locked: bool) {
        if self.locked != locked {
            self.locked = locked;
            self.on_property_changed();
        }
    }

    /// Clamped to [0, 1]; NaN is ignored.
    pub fn set_opacity(&mut self, opacity: f32) {
        if opacity.is_nan() {
            return;
        }
        let opacity = opacity.clamp(0.0, 1.0);
        if self.opacity != opacity {
            self.opacity = opacity;
            self.on_property_changed();
        }
    }

    pub fn set_blend_mode(&mut self, mode: BlendMode) {
        if self.blend_mode != mode {
            self.blend_mode = mode;
            self.on_property_changed();
        }
    }

    pub fn set_position(&mut self, x: i32, y: i32) {
        if self.position != (x, y) {
            self.position = (x, y);
            if let LayerContent::Text(t) = &mut self.content {
                t.invalidate();
            }
            self.on_property_changed();
        }
    }

    pub fn set_transform(&mut self, transform: Option<Transform2D>) {
        if self.transform != transform {
            self.transform = transform;
            self.on_property_changed();
        }
    }

    pub fn set_mask(&mut self, mask: Option<LayerMask>) {
        self.mask = mask;
        self.on_property_changed();
    }

    pub fn mask_mut(&mut self) -> Option<&mut LayerMask> {
        self.mask.as_ref()?;
        self.on_property_changed();
        self.mask.as_mut()
    }

    pub fn set_mask_enabled(&mut self, enabled: bool) {
        if let Some(mask) = &mut self.mask
            && mask.enabled != enabled
        {
            mask.enabled = enabled;
            self.on_property_changed();
        }
    }

    pub fn set_effects(&mut self, effects: LayerEffects) {
        if self.effects != effects {
            self.effects = effects;
            self.on_property_changed();
        }
    }

    /// Edit text properties. The closure returns whether anything changed.
    pub fn edit_text<F>(&mut self, edit: F) -> bool
    where
        F: FnOnce(&mut TextContent) -> bool,
    {
        let LayerContent::Text(t) = &mut self.content else {
            return false;
        };
        let changed = edit(t);
        if changed {
            self.on_property_changed();
        }
        changed
    }

    pub fn set_text(&mut self, text: &str) -> bool {
        self.edit_text(|t| t.set_text(text))
    }

    pub fn set_font(&mut self, font: FontDescriptor) -> bool {
        self.edit_text(|t| t.set_font(font))
    }

    pub fn set_text_color(&mut self, color: Rgba) -> bool {
        self.edit_text(|t| t.set_color(color))
    }

    pub fn set_text_alignment(&mut self, alignment: TextAlignment) -> bool {
        self.edit_text(|t| t.set_alignment(alignment))
    }

    pub fn set_line_spacing(&mut self, spacing: f32) -> bool {
        self.edit_text(|t| t.set_line_spacing(spacing))
    }

    pub fn set_font_data(&mut self, font: ab_glyph::FontArc) -> bool {
        self.edit_text(|t| {
            t.set_font_data(font);
            true
        })
    }

    pub fn add_child(&mut self, mut child: Layer) {
        child.parent = Some(self.id);
        self.children.push(child);
        self.on_property_changed();
    }

    pub fn remove_child(&mut self, index: usize) -> Option<Layer> {
        if index >= self.children.len() {
            return None;
        }
        let mut child = self.children.remove(index);
        child.parent = None;
        self.on_property_changed();
        Some(child)
    }

    /// Mutable child access. Changes made through it reach this layer on
    /// the next [`take_changes`](Self::take_changes).
    pub fn child_mut(&mut self, index: usize) -> Option<&mut Layer> {
        self.children.get_mut(index)
    }

    /// Mirror this layer across the centre of a `width`×`height` canvas.
    /// Untransformed raster pixels are flipped in place; text and
    /// transformed layers get a mirroring transform instead.
    pub fn flip_in_canvas(&mut self, axis: FlipAxis, width: u32, height: u32) {
        let (cw, ch) = (width as i32, height as i32);
        let old_position = self.position;
        let untransformed = self.transform.is_none_or(|t| t.is_identity());
        match &mut self.content {
            LayerContent::Raster(r) if untransformed => {
                r.selection = None;
                let (iw, ih) = (r.image.width() as i32, r.image.height() as i32);
                match axis {
                    FlipAxis::Horizontal => {
                        r.image.flip_horizontal();
                        self.position.0 = cw - (self.position.0 + iw);
                    }
                    FlipAxis::Vertical => {
                        r.image.flip_vertical();
                        self.position.1 = ch - (self.position.1 + ih);
                    }
                }
            }
            LayerContent::Raster(_) | LayerContent::Text(_) => {
                let mirror = match axis {
                    FlipAxis::Horizontal => Transform2D {
                        a: -1.0,
                        tx: cw as f32,
                        ..Transform2D::IDENTITY
                    },
                    FlipAxis::Vertical => Transform2D {
                        d: -1.0,
                        ty: ch as f32,
                        ..Transform2D::IDENTITY
                    },
                };
                self.transform = Some(self.transform.unwrap_or_default().then(&mirror));
            }
            LayerContent::Adjustment(_) => {}
        }
        if let Some(mask) = &mut self.mask {
            let base = if mask.linked { old_position } else { (0, 0) };
            let (ox, oy) = (base.0 + mask.offset.0, base.1 + mask.offset.1);
            let new_base = if mask.linked { self.position } else { (0, 0) };
            match axis {
                FlipAxis::Horizontal => {
                    mask.flip_horizontal();
                    mask.offset.0 = cw - (ox + mask.width as i32) - new_base.0;
                }
                FlipAxis::Vertical => {
                    mask.flip_vertical();
                    mask.offset.1 = ch - (oy + mask.height as i32) - new_base.1;
                }
            }
        }
        for child in &mut self.children {
            child.flip_in_canvas(axis, width, height);
        }
        if let LayerContent::Text(t) = &mut self.content {
            t.invalidate();
        }
        self.on_property_changed();
    }

    /// Turn this layer into plain raster `pixels` covering the canvas from
    /// the origin. Children and effects are assumed to be baked into
    /// `pixels` and are dropped; a linked mask keeps its canvas placement.
    pub fn bake_pixels(&mut self, pixels: PixelBuffer) -> LayerContent {
        if let Some(mask) = &mut self.mask
            && mask.linked
        {
            mask.offset.0 += self.position.0;
            mask.offset.1 += self.position.1;
        }
        self.position = (0, 0);
        self.transform = None;
        self.children.clear();
        self.effects = LayerEffects::default();
        let old = std::mem::replace(&mut self.content, LayerContent::Raster(RasterContent::new(pixels)));
        self.on_property_changed();
        old
    }

    /// Grow or crop raster pixels and masks to a new canvas size, keeping
    /// content anchored at the top-left.
    pub fn resize_canvas(&mut self, width: u32, height: u32) {
        if let LayerContent::Raster(r) = &mut self.content {
            let mut resized = PixelBuffer::new(width, height);
            resized.paste(&r.image, 0, 0);
            r.image = resized;
            r.original = None;
            r.selection = r.selection.and_then(|s| s.intersect(&Rect::from_size(width, height)));
        }
        if let LayerContent::Text(t) = &mut self.content {
            t.invalidate();
        }
        if let Some(mask) = &mut self.mask {
            let mut data = vec![255u8; width as usize * height as usize];
            for y in 0..height.min(mask.height) as usize {
                let src = &mask.data[y * mask.width as usize..][..width.min(mask.width) as usize];
                data[y * width as usize..][..src.len()].copy_from_slice(src);
            }
            mask.data = data;
            mask.width = width;
            mask.height = height;
        }
        for child in &mut self.children {
            child.resize_canvas(width, height);
        }
        self.on_property_changed();
    }

    fn with_fresh_ids(&self, parent: Option<LayerId>) -> Layer {
        let mut copy = self.clone();
        copy.id = Uuid::new_v4();
        copy.parent = parent;
        let now = SystemTime::now();
        copy.created = now;
        copy.modified = now;
        copy.pending_change = false;
        copy.children = self.children.iter().map(|c| c.with_fresh_ids(Some(copy.id))).collect();
        copy
    }

    /// Copy the shared properties onto a layer with different content.
    fn with_same_properties(&self, content: LayerContent) -> Layer {
        Layer {
            content,
            pending_change: false,
            ..self.clone()
        }
    }
}

// ============================================================================
// RENDER DISPATCH
// ============================================================================

pub trait LayerRender {
    /// This layer's own pixels on a `width`×`height` canvas, with position
    /// and transform applied. Opacity, mask and blend mode are left to the
    /// compositor.
    fn render(&self, width: u32, height: u32) -> PixelBuffer;

    /// Composite this layer onto `target` inside `bounds`, exactly as the
    /// document compositor would: mask, effects, children, blend mode and
    /// opacity included. Pixels outside `bounds` are left alone.
    fn render_into(&self, target: &mut PixelBuffer, bounds: Rect);

    /// Independent copy with fresh ids. Pixel data is deep-copied.
    fn duplicate(&self) -> Layer;

    /// An equivalent raster layer, or `None` when this layer has no pixels
    /// of its own to bake.
    fn rasterize(&self, width: u32, height: u32) -> Option<Layer>;
}

impl LayerRender for Layer {
    fn render(&self, width: u32, height: u32) -> PixelBuffer {
        match &self.content {
            LayerContent::Raster(r) => place_image(&r.image, self.position, self.transform.as_ref(), width, height),
            LayerContent::Adjustment(_) => PixelBuffer::new(width, height),
            LayerContent::Text(t) => {
                let (x, y) = self.position;
                let text = t.render(width, height, x as f32, y as f32);
                place_image(&text, (0, 0), self.transform.as_ref(), width, height)
            }
        }
    }

    fn render_into(&self, target: &mut PixelBuffer, bounds: Rect) {
        let Some(area) = bounds.intersect(&target.bounds()) else {
            return;
        };
        let mut composed = target.clone();
        crate::compositor::composite_layer_onto(&mut composed, self, false);
        target.paste(&composed.copy_region(area), area.x, area.y);
    }

    fn duplicate(&self) -> Layer {
        self.with_fresh_ids(self.parent)
    }

    fn rasterize(&self, width: u32, height: u32) -> Option<Layer> {
        match &self.content {
            LayerContent::Text(_) => {
                let pixels = self.render(width, height);
                let mut layer = self.with_same_properties(LayerContent::Raster(RasterContent::new(pixels)));
                layer.position = (0, 0);
                layer.transform = None;
                Some(layer)
            }
            LayerContent::Raster(_) if self.transform.is_some_and(|t| !t.is_identity()) => {
                let pixels = self.render(width, height);
                let mut layer = self.with_same_properties(LayerContent::Raster(RasterContent::new(pixels)));
                layer.position = (0, 0);
                layer.transform = None;
                Some(layer)
            }
            _ => None,
        }
    }
}
