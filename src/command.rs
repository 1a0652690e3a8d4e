//! Undoable edits.
//!
//! Every mutation that should appear in history is a [`Command`]. Commands
//! own whatever they need to reverse themselves: pixel patches for draw
//! commands, removed layers for structural ones. [`CommandManager`] keeps the
//! undo and redo stacks and enforces the step and memory limits.

use std::any::Any;
use std::collections::VecDeque;

use tracing::{debug, warn};

use crate::blend::BlendMode;
use crate::brush::{BrushSample, BrushSettings, StampMode, interpolate_stamps, paint_stroke, stamps_bounds};
use crate::document::Document;
use crate::error::{EditError, EditResult};
use crate::layer::{AdjustmentKind, Layer, LayerContent};
use crate::pixel::{PixelBuffer, Rect, Rgba};
use crate::shapes::{Shape, ShapeStyle, draw_shape};

// ============================================================================
// COMMAND TRAIT
// ============================================================================

pub trait Command: Send {
    fn execute(&mut self, doc: &mut Document) -> EditResult<()>;

    fn undo(&mut self, doc: &mut Document) -> EditResult<()>;

    fn redo(&mut self, doc: &mut Document) -> EditResult<()> {
        self.execute(doc)
    }

    fn description(&self) -> String;

    /// Bytes of history this command holds on to.
    fn memory_size(&self) -> usize {
        0
    }

    fn can_merge_with(&self, _other: &dyn Command) -> bool {
        false
    }

    /// Absorb `other`, which has already been executed. Hands it back when
    /// the merge is refused.
    fn merge_with(&mut self, other: Box<dyn Command>) -> Result<(), Box<dyn Command>> {
        Err(other)
    }

    fn as_any(&self) -> &dyn Any;
}

fn restore_active(doc: &mut Document, active: Option<usize>) -> EditResult<()> {
    match active {
        Some(index) => doc.set_active_layer(index as isize),
        None => Ok(()),
    }
}

fn layer_bytes(layer: &Layer) -> usize {
    let own = match layer.content() {
        LayerContent::Raster(r) => r.image().pixels().len(),
        _ => 0,
    };
    own + layer.children().iter().map(layer_bytes).sum::<usize>()
}

// ============================================================================
// PIXEL PATCH — rectangular region of a raster layer for undo/redo
// ============================================================================

/// A rectangular copy of a raster layer's pixels, in image coordinates.
#[derive(Clone, Debug)]
pub struct PixelPatch {
    pub layer_index: usize,
    pub rect: Rect,
    pub pixels: PixelBuffer,
}

impl PixelPatch {
    pub fn capture(image: &PixelBuffer, layer_index: usize, rect: Rect) -> Self {
        let pixels = image.copy_region(rect);
        let rect = rect.intersect(&image.bounds()).unwrap_or(Rect::new(rect.x, rect.y, 0, 0));
        Self {
            layer_index,
            rect,
            pixels,
        }
    }

    pub fn apply(&self, doc: &mut Document) -> EditResult<()> {
        doc.edit_raster(self.layer_index, |r| {
            r.image_mut().paste(&self.pixels, self.rect.x, self.rect.y);
        })
    }

    pub fn memory_size(&self) -> usize {
        self.pixels.pixels().len()
    }
}

fn layer_geometry(doc: &Document, layer: usize) -> EditResult<((i32, i32), (u32, u32))> {
    let l = doc.layer(layer).ok_or(EditError::InvalidIndex {
        index: layer as isize,
        count: doc.layer_count(),
    })?;
    let size = l.raster().map_or((0, 0), |r| (r.image().width(), r.image().height()));
    Ok((l.position(), size))
}

/// Run `draw` on the raster pixels of `layer` and return before/after
/// patches of `area`, or `None` when nothing changed. `area` must cover
/// every pixel `draw` can touch.
fn draw_with_patches<F>(
    doc: &mut Document,
    layer: usize,
    area: Option<Rect>,
    draw: F,
) -> EditResult<Option<(PixelPatch, PixelPatch)>>
where
    F: FnOnce(&mut PixelBuffer) -> Option<Rect>,
{
    doc.edit_raster(layer, |r| {
        let area = area?;
        let before = PixelPatch::capture(r.image(), layer, area);
        draw(r.image_mut())?;
        Some((before, PixelPatch::capture(r.image(), layer, area)))
    })
}

/// Before/after patch lists. Undo applies `before` newest-first, redo
/// applies `after` oldest-first, so merged commands restore exactly.
#[derive(Clone, Debug, Default)]
struct PatchHistory {
    before: Vec<PixelPatch>,
    after: Vec<PixelPatch>,
}

impl PatchHistory {
    fn push(&mut self, patches: Option<(PixelPatch, PixelPatch)>) {
        if let Some((before, after)) = patches {
            self.before.push(before);
            self.after.push(after);
        }
    }

    fn undo(&self, doc: &mut Document) -> EditResult<()> {
        for patch in self.before.iter().rev() {
            patch.apply(doc)?;
        }
        Ok(())
    }

    fn redo(&self, doc: &mut Document) -> EditResult<()> {
        for patch in &self.after {
            patch.apply(doc)?;
        }
        Ok(())
    }

    fn extend(&mut self, other: &PatchHistory) {
        self.before.extend(other.before.iter().cloned());
        self.after.extend(other.after.iter().cloned());
    }

    fn memory_size(&self) -> usize {
        self.before.iter().chain(&self.after).map(PixelPatch::memory_size).sum()
    }

    fn is_recorded(&self) -> bool {
        !self.before.is_empty()
    }
}

// ============================================================================
// DRAW COMMANDS
// ============================================================================

/// A brush stroke painted onto a raster layer. Sample coordinates are in
/// document space.
#[derive(Clone, Debug)]
pub struct BrushStrokeCommand {
    layer: usize,
    settings: BrushSettings,
    color: Rgba,
    samples: Vec<BrushSample>,
    mode: StampMode,
    patches: PatchHistory,
    executed: bool,
}

impl BrushStrokeCommand {
    pub fn new(layer: usize, settings: BrushSettings, color: Rgba, samples: Vec<BrushSample>) -> Self {
        Self {
            layer,
            settings,
            color,
            samples,
            mode: StampMode::Paint,
            patches: PatchHistory::default(),
            executed: false,
        }
    }

    pub fn layer(&self) -> usize {
        self.layer
    }

    pub fn samples(&self) -> &[BrushSample] {
        &self.samples
    }

    pub fn mode(&self) -> StampMode {
        self.mode
    }
}

impl Command for BrushStrokeCommand {
    fn execute(&mut self, doc: &mut Document) -> EditResult<()> {
        if self.executed {
            return self.redo(doc);
        }
        let (settings, color, mode) = (self.settings, self.color, self.mode);
        let ((px, py), _) = layer_geometry(doc, self.layer)?;
        let local: Vec<BrushSample> = self
            .samples
            .iter()
            .map(|s| BrushSample {
                x: s.x - px as f32,
                y: s.y - py as f32,
                ..*s
            })
            .collect();
        let area = stamps_bounds(&settings, &interpolate_stamps(&settings, &local));
        let patches = draw_with_patches(doc, self.layer, area, |image| {
            paint_stroke(image, &settings, &local, color, mode)
        })?;
        self.patches.push(patches);
        self.executed = true;
        debug!(layer = self.layer, samples = self.samples.len(), "stroke painted");
        Ok(())
    }

    fn undo(&mut self, doc: &mut Document) -> EditResult<()> {
        self.patches.undo(doc)
    }

    fn redo(&mut self, doc: &mut Document) -> EditResult<()> {
        if !self.patches.is_recorded() {
            // Nothing was touched; still validate the target.
            return doc.edit_raster(self.layer, |_| ());
        }
        self.patches.redo(doc)
    }

    fn description(&self) -> String {
        match self.mode {
            StampMode::Paint => "Brush Stroke".to_string(),
            StampMode::Erase => "Erase".to_string(),
        }
    }

    fn memory_size(&self) -> usize {
        self.patches.memory_size() + self.samples.len() * std::mem::size_of::<BrushSample>()
    }

    fn can_merge_with(&self, other: &dyn Command) -> bool {
        other
            .as_any()
            .downcast_ref::<BrushStrokeCommand>()
            .is_some_and(|o| o.layer == self.layer && o.mode == self.mode)
    }

    fn merge_with(&mut self, other: Box<dyn Command>) -> Result<(), Box<dyn Command>> {
        let Some(stroke) = other.as_any().downcast_ref::<BrushStrokeCommand>() else {
            return Err(other);
        };
        if stroke.layer != self.layer || stroke.mode != self.mode {
            return Err(other);
        }
        self.samples.extend_from_slice(&stroke.samples);
        self.patches.extend(&stroke.patches);
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Brush stroke in erase mode: removes coverage instead of painting.
#[derive(Clone, Debug)]
pub struct EraseCommand(BrushStrokeCommand);

impl EraseCommand {
    pub fn new(layer: usize, settings: BrushSettings, samples: Vec<BrushSample>) -> Self {
        let mut inner = BrushStrokeCommand::new(layer, settings, Rgba::BLACK, samples);
        inner.mode = StampMode::Erase;
        Self(inner)
    }
}

impl Command for EraseCommand {
    fn execute(&mut self, doc: &mut Document) -> EditResult<()> {
        self.0.execute(doc)
    }

    fn undo(&mut self, doc: &mut Document) -> EditResult<()> {
        self.0.undo(doc)
    }

    fn redo(&mut self, doc: &mut Document) -> EditResult<()> {
        self.0.redo(doc)
    }

    fn description(&self) -> String {
        self.0.description()
    }

    fn memory_size(&self) -> usize {
        self.0.memory_size()
    }

    fn can_merge_with(&self, other: &dyn Command) -> bool {
        other
            .as_any()
            .downcast_ref::<EraseCommand>()
            .is_some_and(|o| self.0.can_merge_with(&o.0))
    }

    fn merge_with(&mut self, other: Box<dyn Command>) -> Result<(), Box<dyn Command>> {
        let Some(erase) = other.as_any().downcast_ref::<EraseCommand>() else {
            return Err(other);
        };
        if !self.0.can_merge_with(&erase.0) {
            return Err(other);
        }
        self.0.samples.extend_from_slice(&erase.0.samples);
        self.0.patches.extend(&erase.0.patches);
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Line, rectangle or ellipse drawn onto a raster layer in document space.
#[derive(Clone, Debug)]
pub struct DrawShapeCommand {
    layer: usize,
    shape: Shape,
    style: ShapeStyle,
    patches: PatchHistory,
    executed: bool,
}

impl DrawShapeCommand {
    pub fn new(layer: usize, shape: Shape, style: ShapeStyle) -> Self {
        Self {
            layer,
            shape,
            style,
            patches: PatchHistory::default(),
            executed: false,
        }
    }

    pub fn line(layer: usize, from: (f32, f32), to: (f32, f32), style: ShapeStyle) -> Self {
        Self::new(
            layer,
            Shape::Line {
                x0: from.0,
                y0: from.1,
                x1: to.0,
                y1: to.1,
            },
            style,
        )
    }

    pub fn rectangle(layer: usize, rect: Rect, style: ShapeStyle) -> Self {
        Self::new(
            layer,
            Shape::Rectangle {
                x0: rect.x as f32,
                y0: rect.y as f32,
                x1: rect.right() as f32,
                y1: rect.bottom() as f32,
            },
            style,
        )
    }

    pub fn ellipse(layer: usize, center: (f32, f32), radii: (f32, f32), style: ShapeStyle) -> Self {
        Self::new(
            layer,
            Shape::Ellipse {
                cx: center.0,
                cy: center.1,
                rx: radii.0,
                ry: radii.1,
            },
            style,
        )
    }

    /// The shape moved into a layer's image coordinates.
    fn local_shape(&self, (px, py): (i32, i32)) -> Shape {
        let (dx, dy) = (px as f32, py as f32);
        match self.shape {
            Shape::Line { x0, y0, x1, y1 } => Shape::Line {
                x0: x0 - dx,
                y0: y0 - dy,
                x1: x1 - dx,
                y1: y1 - dy,
            },
            Shape::Rectangle { x0, y0, x1, y1 } => Shape::Rectangle {
                x0: x0 - dx,
                y0: y0 - dy,
                x1: x1 - dx,
                y1: y1 - dy,
            },
            Shape::Ellipse { cx, cy, rx, ry } => Shape::Ellipse {
                cx: cx - dx,
                cy: cy - dy,
                rx,
                ry,
            },
        }
    }
}

impl Command for DrawShapeCommand {
    fn execute(&mut self, doc: &mut Document) -> EditResult<()> {
        if self.executed {
            return self.redo(doc);
        }
        let style = self.style;
        let (position, (width, height)) = layer_geometry(doc, self.layer)?;
        let shape = self.local_shape(position);
        let area = shape.bounds(&style, width, height);
        let patches = draw_with_patches(doc, self.layer, area, |image| draw_shape(image, &shape, &style))?;
        self.patches.push(patches);
        self.executed = true;
        Ok(())
    }

    fn undo(&mut self, doc: &mut Document) -> EditResult<()> {
        self.patches.undo(doc)
    }

    fn redo(&mut self, doc: &mut Document) -> EditResult<()> {
        if !self.patches.is_recorded() {
            return doc.edit_raster(self.layer, |_| ());
        }
        self.patches.redo(doc)
    }

    fn description(&self) -> String {
        match self.shape {
            Shape::Line { .. } => "Draw Line",
            Shape::Rectangle { .. } => "Draw Rectangle",
            Shape::Ellipse { .. } => "Draw Ellipse",
        }
        .to_string()
    }

    fn memory_size(&self) -> usize {
        self.patches.memory_size()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ============================================================================
// STRUCTURAL COMMANDS
// ============================================================================

/// What kind of layer [`AddLayerCommand`] creates.
#[derive(Clone, Debug, PartialEq)]
pub enum NewLayer {
    Raster,
    Adjustment(AdjustmentKind),
    Text(String),
}

/// Add a new layer and make it active.
#[derive(Debug)]
pub struct AddLayerCommand {
    name: String,
    index: isize,
    kind: NewLayer,
    /// Kept after undo so redo restores the same layer.
    layer: Option<Layer>,
    inserted_at: Option<usize>,
    previous_active: Option<usize>,
}

impl AddLayerCommand {
    /// `index` of -1 appends on top.
    pub fn new(name: &str, index: isize, kind: NewLayer) -> Self {
        Self {
            name: name.to_string(),
            index,
            kind,
            layer: None,
            inserted_at: None,
            previous_active: None,
        }
    }

    pub fn raster(name: &str) -> Self {
        Self::new(name, -1, NewLayer::Raster)
    }

    /// Wrap an already built layer.
    pub fn with_layer(layer: Layer, index: isize) -> Self {
        Self {
            name: layer.name().to_string(),
            index,
            kind: NewLayer::Raster,
            layer: Some(layer),
            inserted_at: None,
            previous_active: None,
        }
    }

    pub fn inserted_at(&self) -> Option<usize> {
        self.inserted_at
    }
}

impl Command for AddLayerCommand {
    fn execute(&mut self, doc: &mut Document) -> EditResult<()> {
        let layer = match self.layer.take() {
            Some(layer) => layer,
            None => match &self.kind {
                NewLayer::Raster => Layer::new_raster(&self.name, doc.width(), doc.height()),
                NewLayer::Adjustment(kind) => Layer::new_adjustment(&self.name, *kind),
                NewLayer::Text(text) => Layer::new_text(&self.name, text),
            },
        };
        self.previous_active = doc.active_index();
        let index = doc.add_layer(layer, self.index);
        doc.set_active_layer(index as isize)?;
        self.inserted_at = Some(index);
        Ok(())
    }

    fn undo(&mut self, doc: &mut Document) -> EditResult<()> {
        let index = self.inserted_at.ok_or_else(|| EditError::CommandFailed("layer was never added".into()))?;
        let layer = doc.remove_layer(index)?;
        self.layer = Some(layer);
        restore_active(doc, self.previous_active)
    }

    fn description(&self) -> String {
        format!("Add Layer \"{}\"", self.name)
    }

    fn memory_size(&self) -> usize {
        self.layer.as_ref().map_or(0, layer_bytes)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Remove a layer, keeping it for undo.
#[derive(Debug)]
pub struct RemoveLayerCommand {
    index: usize,
    removed: Option<Layer>,
    previous_active: Option<usize>,
}

impl RemoveLayerCommand {
    pub fn new(index: usize) -> Self {
        Self {
            index,
            removed: None,
            previous_active: None,
        }
    }
}

impl Command for RemoveLayerCommand {
    fn execute(&mut self, doc: &mut Document) -> EditResult<()> {
        let previous_active = doc.active_index();
        let layer = doc.remove_layer(self.index)?;
        self.previous_active = previous_active;
        self.removed = Some(layer);
        Ok(())
    }

    fn undo(&mut self, doc: &mut Document) -> EditResult<()> {
        let layer = self
            .removed
            .take()
            .ok_or_else(|| EditError::CommandFailed("no removed layer to restore".into()))?;
        doc.add_layer(layer, self.index as isize);
        restore_active(doc, self.previous_active)
    }

    fn description(&self) -> String {
        match &self.removed {
            Some(layer) => format!("Delete Layer \"{}\"", layer.name()),
            None => "Delete Layer".to_string(),
        }
    }

    fn memory_size(&self) -> usize {
        self.removed.as_ref().map_or(0, layer_bytes)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug)]
pub struct MoveLayerCommand {
    from: usize,
    to: usize,
}

impl MoveLayerCommand {
    pub fn new(from: usize, to: usize) -> Self {
        Self { from, to }
    }
}

impl Command for MoveLayerCommand {
    fn execute(&mut self, doc: &mut Document) -> EditResult<()> {
        doc.move_layer(self.from, self.to)
    }

    fn undo(&mut self, doc: &mut Document) -> EditResult<()> {
        doc.move_layer(self.to, self.from)
    }

    fn description(&self) -> String {
        "Move Layer".to_string()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A single layer property value.
#[derive(Clone, Debug, PartialEq)]
pub enum LayerProperty {
    Visibility(bool),
    Opacity(f32),
    BlendMode(BlendMode),
    Name(String),
    Locked(bool),
}

impl LayerProperty {
    fn read(&self, layer: &Layer) -> LayerProperty {
        match self {
            LayerProperty::Visibility(_) => LayerProperty::Visibility(layer.is_visible()),
            LayerProperty::Opacity(_) => LayerProperty::Opacity(layer.opacity()),
            LayerProperty::BlendMode(_) => LayerProperty::BlendMode(layer.blend_mode()),
            LayerProperty::Name(_) => LayerProperty::Name(layer.name().to_string()),
            LayerProperty::Locked(_) => LayerProperty::Locked(layer.is_locked()),
        }
    }

    fn write(&self, doc: &mut Document, index: usize) -> EditResult<()> {
        match self {
            LayerProperty::Visibility(v) => doc.set_layer_visible(index, *v),
            LayerProperty::Opacity(o) => doc.set_layer_opacity(index, *o),
            LayerProperty::BlendMode(m) => doc.set_layer_blend_mode(index, *m),
            LayerProperty::Name(n) => doc.rename_layer(index, n),
            LayerProperty::Locked(l) => doc.set_layer_locked(index, *l),
        }
    }

    fn label(&self) -> &'static str {
        match self {
            LayerProperty::Visibility(_) => "Visibility",
            LayerProperty::Opacity(_) => "Opacity",
            LayerProperty::BlendMode(_) => "Blend Mode",
            LayerProperty::Name(_) => "Rename",
            LayerProperty::Locked(_) => "Lock",
        }
    }
}

#[derive(Debug)]
pub struct LayerPropertyCommand {
    index: usize,
    value: LayerProperty,
    previous: Option<LayerProperty>,
}

impl LayerPropertyCommand {
    pub fn new(index: usize, value: LayerProperty) -> Self {
        Self {
            index,
            value,
            previous: None,
        }
    }
}

impl Command for LayerPropertyCommand {
    fn execute(&mut self, doc: &mut Document) -> EditResult<()> {
        let layer = doc.layer(self.index).ok_or(EditError::InvalidIndex {
            index: self.index as isize,
            count: doc.layer_count(),
        })?;
        let previous = self.value.read(layer);
        self.value.write(doc, self.index)?;
        self.previous = Some(previous);
        Ok(())
    }

    fn undo(&mut self, doc: &mut Document) -> EditResult<()> {
        match &self.previous {
            Some(previous) => previous.write(doc, self.index),
            None => Err(EditError::CommandFailed("property was never changed".into())),
        }
    }

    fn description(&self) -> String {
        format!("Layer {}", self.value.label())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug)]
pub struct MergeDownCommand {
    index: usize,
    saved: Option<MergeSnapshot>,
}

#[derive(Debug)]
struct MergeSnapshot {
    top: Layer,
    below: Layer,
    active: Option<usize>,
}

impl MergeDownCommand {
    pub fn new(index: usize) -> Self {
        Self { index, saved: None }
    }
}

impl Command for MergeDownCommand {
    fn execute(&mut self, doc: &mut Document) -> EditResult<()> {
        let below = self
            .index
            .checked_sub(1)
            .and_then(|i| doc.layer(i))
            .cloned()
            .ok_or(EditError::InvalidIndex {
                index: self.index as isize,
                count: doc.layer_count(),
            })?;
        let active = doc.active_index();
        let top = doc.merge_down(self.index)?;
        self.saved = Some(MergeSnapshot { top, below, active });
        Ok(())
    }

    fn undo(&mut self, doc: &mut Document) -> EditResult<()> {
        let saved = self
            .saved
            .take()
            .ok_or_else(|| EditError::CommandFailed("merge was never executed".into()))?;
        if self.index - 1 >= doc.layer_count() {
            let count = doc.layer_count();
            self.saved = Some(saved);
            return Err(EditError::InvalidIndex {
                index: self.index as isize - 1,
                count,
            });
        }
        doc.replace_layer(self.index - 1, saved.below);
        doc.add_layer(saved.top, self.index as isize);
        restore_active(doc, saved.active)
    }

    fn description(&self) -> String {
        "Merge Down".to_string()
    }

    fn memory_size(&self) -> usize {
        self.saved
            .as_ref()
            .map_or(0, |s| layer_bytes(&s.top) + layer_bytes(&s.below))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug)]
pub struct DuplicateLayerCommand {
    index: usize,
    created: Option<usize>,
    copy: Option<Layer>,
}

impl DuplicateLayerCommand {
    pub fn new(index: usize) -> Self {
        Self {
            index,
            created: None,
            copy: None,
        }
    }
}

impl Command for DuplicateLayerCommand {
    fn execute(&mut self, doc: &mut Document) -> EditResult<()> {
        let created = match self.copy.take() {
            Some(copy) => doc.add_layer(copy, self.index as isize + 1),
            None => doc.duplicate_layer(self.index)?,
        };
        self.created = Some(created);
        Ok(())
    }

    fn undo(&mut self, doc: &mut Document) -> EditResult<()> {
        let created = self
            .created
            .ok_or_else(|| EditError::CommandFailed("layer was never duplicated".into()))?;
        self.copy = Some(doc.remove_layer(created)?);
        Ok(())
    }

    fn description(&self) -> String {
        "Duplicate Layer".to_string()
    }

    fn memory_size(&self) -> usize {
        self.copy.as_ref().map_or(0, layer_bytes)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug)]
pub struct RasterizeLayerCommand {
    index: usize,
    original: Option<Layer>,
}

impl RasterizeLayerCommand {
    pub fn new(index: usize) -> Self {
        Self { index, original: None }
    }
}

impl Command for RasterizeLayerCommand {
    fn execute(&mut self, doc: &mut Document) -> EditResult<()> {
        self.original = Some(doc.rasterize_layer(self.index)?);
        Ok(())
    }

    fn undo(&mut self, doc: &mut Document) -> EditResult<()> {
        if self.index >= doc.layer_count() {
            return Err(EditError::InvalidIndex {
                index: self.index as isize,
                count: doc.layer_count(),
            });
        }
        let original = self
            .original
            .take()
            .ok_or_else(|| EditError::CommandFailed("layer was never rasterized".into()))?;
        doc.replace_layer(self.index, original);
        Ok(())
    }

    fn description(&self) -> String {
        "Rasterize Layer".to_string()
    }

    fn memory_size(&self) -> usize {
        self.original.as_ref().map_or(0, layer_bytes)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug, Default)]
pub struct FlattenCommand {
    previous: Option<(Vec<Layer>, Option<usize>)>,
}

impl FlattenCommand {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Command for FlattenCommand {
    fn execute(&mut self, doc: &mut Document) -> EditResult<()> {
        let active = doc.active_index();
        let layers = doc.flatten()?;
        self.previous = Some((layers, active));
        Ok(())
    }

    fn undo(&mut self, doc: &mut Document) -> EditResult<()> {
        let (layers, active) = self
            .previous
            .take()
            .ok_or_else(|| EditError::CommandFailed("document was never flattened".into()))?;
        doc.restore_layers(layers, active);
        Ok(())
    }

    fn description(&self) -> String {
        "Flatten Image".to_string()
    }

    fn memory_size(&self) -> usize {
        self.previous
            .as_ref()
            .map_or(0, |(layers, _)| layers.iter().map(layer_bytes).sum())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ============================================================================
// COMMAND GROUP — several commands as one undo step
// ============================================================================

pub struct CommandGroup {
    name: String,
    commands: Vec<Box<dyn Command>>,
}

impl std::fmt::Debug for CommandGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandGroup")
            .field("name", &self.name)
            .field("commands", &self.commands.len())
            .finish()
    }
}

impl CommandGroup {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            commands: Vec::new(),
        }
    }

    /// Add an already executed command.
    pub fn push(&mut self, command: Box<dyn Command>) {
        self.commands.push(command);
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

impl Command for CommandGroup {
    /// Runs children in order; on failure the ones already run are undone.
    fn execute(&mut self, doc: &mut Document) -> EditResult<()> {
        for i in 0..self.commands.len() {
            if let Err(err) = self.commands[i].execute(doc) {
                for done in self.commands[..i].iter_mut().rev() {
                    if let Err(e) = done.undo(doc) {
                        warn!(group = %self.name, command = %done.description(), error = %e, "rollback undo failed");
                    }
                }
                return Err(err);
            }
        }
        Ok(())
    }

    fn undo(&mut self, doc: &mut Document) -> EditResult<()> {
        for i in (0..self.commands.len()).rev() {
            if let Err(err) = self.commands[i].undo(doc) {
                for done in self.commands[i + 1..].iter_mut() {
                    if let Err(e) = done.redo(doc) {
                        warn!(group = %self.name, command = %done.description(), error = %e, "rollback redo failed");
                    }
                }
                return Err(err);
            }
        }
        Ok(())
    }

    fn redo(&mut self, doc: &mut Document) -> EditResult<()> {
        for i in 0..self.commands.len() {
            if let Err(err) = self.commands[i].redo(doc) {
                for done in self.commands[..i].iter_mut().rev() {
                    if let Err(e) = done.undo(doc) {
                        warn!(group = %self.name, command = %done.description(), error = %e, "rollback undo failed");
                    }
                }
                return Err(err);
            }
        }
        Ok(())
    }

    fn description(&self) -> String {
        self.name.clone()
    }

    fn memory_size(&self) -> usize {
        self.commands.iter().map(|c| c.memory_size()).sum()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ============================================================================
// COMMAND MANAGER — undo/redo stacks with step and memory limits
// ============================================================================

pub const DEFAULT_MAX_UNDO_STEPS: usize = 50;
pub const DEFAULT_MAX_UNDO_MEMORY: usize = 100 * 1024 * 1024;

pub struct CommandManager {
    undo_stack: VecDeque<Box<dyn Command>>,
    redo_stack: VecDeque<Box<dyn Command>>,
    max_undo_steps: usize,
    /// Optional memory cap in bytes.
    max_memory_bytes: Option<usize>,
    /// Running memory total across both stacks.
    total_memory: usize,
    merge_strokes: bool,
    group: Option<CommandGroup>,
    group_depth: usize,
}

impl std::fmt::Debug for CommandManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandManager")
            .field("undo", &self.undo_stack.len())
            .field("redo", &self.redo_stack.len())
            .field("total_memory", &self.total_memory)
            .finish_non_exhaustive()
    }
}

impl Default for CommandManager {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_UNDO_STEPS)
    }
}

impl CommandManager {
    pub fn new(max_undo_steps: usize) -> Self {
        Self {
            undo_stack: VecDeque::new(),
            redo_stack: VecDeque::new(),
            max_undo_steps,
            max_memory_bytes: Some(DEFAULT_MAX_UNDO_MEMORY),
            total_memory: 0,
            merge_strokes: false,
            group: None,
            group_depth: 0,
        }
    }

    pub fn set_limits(&mut self, max_undo_steps: usize, max_memory_bytes: Option<usize>) {
        self.max_undo_steps = max_undo_steps;
        self.max_memory_bytes = max_memory_bytes;
        self.prune();
    }

    /// Coalesce consecutive strokes on the same layer into one undo step.
    pub fn set_merge_strokes(&mut self, merge: bool) {
        self.merge_strokes = merge;
    }

    /// Execute `command` and record it. A failed command is dropped and the
    /// history is left as it was.
    pub fn execute(&mut self, mut command: Box<dyn Command>, doc: &mut Document) -> EditResult<()> {
        if let Err(err) = command.execute(doc) {
            warn!(command = %command.description(), error = %err, "command failed");
            return Err(err);
        }
        debug!(command = %command.description(), undo_depth = self.undo_stack.len() + 1, "executed");
        match &mut self.group {
            Some(group) => group.push(command),
            None => self.push_executed(command),
        }
        Ok(())
    }

    fn push_executed(&mut self, command: Box<dyn Command>) {
        for cmd in self.redo_stack.drain(..) {
            self.total_memory = self.total_memory.saturating_sub(cmd.memory_size());
        }

        let command = match self.undo_stack.back_mut() {
            Some(top) if self.merge_strokes && top.can_merge_with(command.as_ref()) => {
                let before = top.memory_size();
                match top.merge_with(command) {
                    Ok(()) => {
                        self.total_memory = self.total_memory.saturating_sub(before) + top.memory_size();
                        None
                    }
                    Err(command) => Some(command),
                }
            }
            _ => Some(command),
        };
        if let Some(command) = command {
            self.total_memory += command.memory_size();
            self.undo_stack.push_back(command);
        }
        self.prune();
    }

    /// Undo the newest command and return its description. If the command's
    /// undo fails it goes back on the undo stack.
    pub fn undo(&mut self, doc: &mut Document) -> EditResult<String> {
        self.close_all_groups();
        let Some(mut command) = self.undo_stack.pop_back() else {
            return Err(EditError::NothingToUndo);
        };
        let description = command.description();
        let before = command.memory_size();
        let result = command.undo(doc);
        self.total_memory = self.total_memory.saturating_sub(before) + command.memory_size();
        if let Err(err) = result {
            warn!(command = %description, error = %err, "undo failed");
            self.undo_stack.push_back(command);
            return Err(err);
        }
        debug!(command = %description, undo_depth = self.undo_stack.len(), "undone");
        self.redo_stack.push_back(command);
        Ok(description)
    }

    pub fn redo(&mut self, doc: &mut Document) -> EditResult<String> {
        self.close_all_groups();
        let Some(mut command) = self.redo_stack.pop_back() else {
            return Err(EditError::NothingToRedo);
        };
        let description = command.description();
        let before = command.memory_size();
        let result = command.redo(doc);
        self.total_memory = self.total_memory.saturating_sub(before) + command.memory_size();
        if let Err(err) = result {
            warn!(command = %description, error = %err, "redo failed");
            self.redo_stack.push_back(command);
            return Err(err);
        }
        debug!(command = %description, undo_depth = self.undo_stack.len() + 1, "redone");
        self.undo_stack.push_back(command);
        self.prune();
        Ok(description)
    }

    /// Start collecting executed commands into one undo step. Groups nest;
    /// only the outermost [`end_group`](Self::end_group) records the step.
    pub fn begin_group(&mut self, name: &str) {
        if self.group.is_some() {
            self.group_depth += 1;
        } else {
            self.group = Some(CommandGroup::new(name));
        }
    }

    pub fn end_group(&mut self) -> EditResult<()> {
        if self.group.is_none() {
            return Err(EditError::GroupNotOpen);
        }
        if self.group_depth > 0 {
            self.group_depth -= 1;
            return Ok(());
        }
        if let Some(group) = self.group.take()
            && !group.is_empty()
        {
            self.push_executed(Box::new(group));
        }
        Ok(())
    }

    pub fn is_grouping(&self) -> bool {
        self.group.is_some()
    }

    fn close_all_groups(&mut self) {
        self.group_depth = 0;
        if self.group.is_some() {
            let _ = self.end_group();
        }
    }

    pub fn can_undo(&self) -> bool {
        !self.undo_stack.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo_stack.is_empty()
    }

    pub fn undo_description(&self) -> Option<String> {
        self.undo_stack.back().map(|c| c.description())
    }

    pub fn redo_description(&self) -> Option<String> {
        self.redo_stack.back().map(|c| c.description())
    }

    /// All undo descriptions, most recent first.
    pub fn undo_descriptions(&self) -> Vec<String> {
        self.undo_stack.iter().rev().map(|c| c.description()).collect()
    }

    pub fn redo_descriptions(&self) -> Vec<String> {
        self.redo_stack.iter().rev().map(|c| c.description()).collect()
    }

    pub fn undo_count(&self) -> usize {
        self.undo_stack.len()
    }

    pub fn redo_count(&self) -> usize {
        self.redo_stack.len()
    }

    pub fn memory_usage(&self) -> usize {
        self.total_memory
    }

    fn prune(&mut self) {
        while self.undo_stack.len() > self.max_undo_steps {
            if let Some(removed) = self.undo_stack.pop_front() {
                self.total_memory = self.total_memory.saturating_sub(removed.memory_size());
            }
        }
        if let Some(max_bytes) = self.max_memory_bytes {
            while self.total_memory > max_bytes && self.undo_stack.len() > 1 {
                if let Some(removed) = self.undo_stack.pop_front() {
                    self.total_memory = self.total_memory.saturating_sub(removed.memory_size());
                }
            }
        }
    }

    pub fn clear(&mut self) {
        self.undo_stack.clear();
        self.redo_stack.clear();
        self.group = None;
        self.group_depth = 0;
        self.total_memory = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::LayerKind;

    /// Everything a command could change, in comparable form.
    #[derive(Debug, PartialEq)]
    struct Snapshot {
        active: isize,
        layers: Vec<(String, bool, bool, u32, BlendMode, LayerKind, Option<Vec<u8>>)>,
    }

    fn snapshot(doc: &Document) -> Snapshot {
        Snapshot {
            active: doc.active_layer_index(),
            layers: doc
                .layers()
                .iter()
                .map(|l| {
                    (
                        l.name().to_string(),
                        l.is_visible(),
                        l.is_locked(),
                        l.opacity().to_bits(),
                        l.blend_mode(),
                        l.kind(),
                        l.raster().map(|r| r.image().pixels().to_vec()),
                    )
                })
                .collect(),
        }
    }

    fn doc_with_paint_layer() -> Document {
        let mut doc = Document::new(32, 32);
        doc.add_layer(Layer::new_raster("Paint", 32, 32), -1);
        doc.set_active_layer(1).unwrap();
        doc
    }

    fn stroke(layer: usize) -> BrushStrokeCommand {
        BrushStrokeCommand::new(
            layer,
            BrushSettings::default().with_size(6.0),
            Rgba::new(200, 30, 30, 255),
            vec![BrushSample::new(4.0, 4.0, 1.0, 0.0), BrushSample::new(20.0, 12.0, 0.8, 0.0)],
        )
    }

    fn assert_round_trip(doc: &mut Document, command: Box<dyn Command>) {
        let mut manager = CommandManager::default();
        let before = snapshot(doc);
        manager.execute(command, doc).unwrap();
        let after = snapshot(doc);
        assert_ne!(before, after, "command should change the document");
        manager.undo(doc).unwrap();
        assert_eq!(snapshot(doc), before);
        manager.redo(doc).unwrap();
        assert_eq!(snapshot(doc), after);
        manager.undo(doc).unwrap();
        assert_eq!(snapshot(doc), before);
    }

    #[test]
    fn brush_stroke_round_trips() {
        let mut doc = doc_with_paint_layer();
        assert_round_trip(&mut doc, Box::new(stroke(1)));
    }

    #[test]
    fn erase_round_trips() {
        let mut doc = Document::new(32, 32);
        let settings = BrushSettings::default().with_size(5.0).with_hardness(1.0);
        let samples = vec![BrushSample::new(10.0, 10.0, 1.0, 0.0), BrushSample::new(16.0, 10.0, 1.0, 0.0)];
        assert_round_trip(&mut doc, Box::new(EraseCommand::new(0, settings, samples)));
    }

    #[test]
    fn shapes_round_trip() {
        let style = ShapeStyle {
            stroke: Rgba::new(0, 0, 255, 255),
            stroke_width: 2.0,
            fill: Some(Rgba::new(0, 255, 0, 128)),
            anti_alias: true,
        };
        let mut doc = doc_with_paint_layer();
        assert_round_trip(&mut doc, Box::new(DrawShapeCommand::line(1, (2.0, 2.0), (30.0, 20.0), style)));
        assert_round_trip(&mut doc, Box::new(DrawShapeCommand::rectangle(1, Rect::new(4, 4, 12, 8), style)));
        assert_round_trip(&mut doc, Box::new(DrawShapeCommand::ellipse(1, (16.0, 16.0), (8.0, 5.0), style)));
    }

    #[test]
    fn shapes_follow_layer_position() {
        let mut doc = Document::empty(20, 20);
        let mut layer = Layer::new_raster("L", 10, 10);
        layer.set_position(10, 10);
        doc.add_layer(layer, -1);
        let style = ShapeStyle {
            fill: Some(Rgba::WHITE),
            anti_alias: false,
            ..ShapeStyle::default()
        };
        let mut manager = CommandManager::default();
        manager
            .execute(Box::new(DrawShapeCommand::rectangle(0, Rect::new(12, 12, 4, 4), style)), &mut doc)
            .unwrap();
        assert_eq!(doc.layers()[0].raster().unwrap().image().get(3, 3), Some(Rgba::WHITE));
        assert_eq!(doc.render(None).get(13, 13), Some(Rgba::WHITE));
    }

    #[test]
    fn structural_commands_round_trip() {
        let mut doc = doc_with_paint_layer();
        assert_round_trip(&mut doc, Box::new(AddLayerCommand::raster("Layer 2")));
        assert_round_trip(
            &mut doc,
            Box::new(AddLayerCommand::new("Levels", 0, NewLayer::Adjustment(AdjustmentKind::Levels))),
        );
        assert_round_trip(&mut doc, Box::new(RemoveLayerCommand::new(1)));
        assert_round_trip(&mut doc, Box::new(RemoveLayerCommand::new(0)));
        assert_round_trip(&mut doc, Box::new(MoveLayerCommand::new(0, 1)));
        assert_round_trip(&mut doc, Box::new(DuplicateLayerCommand::new(0)));
    }

    #[test]
    fn property_commands_round_trip() {
        let mut doc = doc_with_paint_layer();
        for value in [
            LayerProperty::Visibility(false),
            LayerProperty::Opacity(0.25),
            LayerProperty::BlendMode(BlendMode::Multiply),
            LayerProperty::Name("Ink".to_string()),
            LayerProperty::Locked(true),
        ] {
            assert_round_trip(&mut doc, Box::new(LayerPropertyCommand::new(1, value)));
        }
    }

    #[test]
    fn merge_flatten_rasterize_round_trip() {
        let mut doc = doc_with_paint_layer();
        let mut manager = CommandManager::default();
        manager.execute(Box::new(stroke(1)), &mut doc).unwrap();
        assert_round_trip(&mut doc, Box::new(MergeDownCommand::new(1)));
        assert_round_trip(&mut doc, Box::new(FlattenCommand::new()));
        doc.add_layer(Layer::new_text("Caption", ""), -1);
        assert_round_trip(&mut doc, Box::new(RasterizeLayerCommand::new(2)));
    }

    #[test]
    fn add_layer_scenario() {
        let mut doc = Document::default();
        let mut manager = CommandManager::default();
        manager.execute(Box::new(AddLayerCommand::raster("Layer 1")), &mut doc).unwrap();
        assert_eq!(doc.layer_count(), 2);
        assert_eq!(doc.active_layer_index(), 1);
        assert_eq!(doc.layers()[1].name(), "Layer 1");
        manager.undo(&mut doc).unwrap();
        assert_eq!(doc.active_layer_index(), 0);
        manager.redo(&mut doc).unwrap();
        assert_eq!(doc.active_layer_index(), 1);
    }

    #[test]
    fn draw_on_locked_or_non_raster_fails_cleanly() {
        let mut doc = doc_with_paint_layer();
        doc.set_layer_locked(1, true).unwrap();
        let before = snapshot(&doc);
        let mut manager = CommandManager::default();
        assert!(matches!(
            manager.execute(Box::new(stroke(1)), &mut doc),
            Err(EditError::LayerLocked(_))
        ));
        assert_eq!(snapshot(&doc), before);
        assert!(!manager.can_undo());

        doc.add_layer(Layer::new_adjustment("Invert", AdjustmentKind::Invert), -1);
        assert!(matches!(
            manager.execute(Box::new(stroke(2)), &mut doc),
            Err(EditError::NotRaster(_))
        ));
        assert!(matches!(
            manager.execute(Box::new(stroke(9)), &mut doc),
            Err(EditError::InvalidIndex { .. })
        ));
    }

    #[test]
    fn empty_stacks_fail_without_change() {
        let mut doc = Document::new(4, 4);
        let mut manager = CommandManager::default();
        let before = snapshot(&doc);
        assert_eq!(manager.undo(&mut doc), Err(EditError::NothingToUndo));
        assert_eq!(manager.redo(&mut doc), Err(EditError::NothingToRedo));
        assert_eq!(snapshot(&doc), before);
    }

    #[test]
    fn new_command_clears_redo() {
        let mut doc = doc_with_paint_layer();
        let mut manager = CommandManager::default();
        manager.execute(Box::new(stroke(1)), &mut doc).unwrap();
        manager.undo(&mut doc).unwrap();
        assert!(manager.can_redo());
        manager
            .execute(Box::new(LayerPropertyCommand::new(1, LayerProperty::Opacity(0.5))), &mut doc)
            .unwrap();
        assert!(!manager.can_redo());
        assert_eq!(manager.undo_descriptions(), vec!["Layer Opacity".to_string()]);
    }

    #[test]
    fn failed_undo_goes_back_on_the_stack() {
        let mut doc = doc_with_paint_layer();
        let mut manager = CommandManager::default();
        manager.execute(Box::new(stroke(1)), &mut doc).unwrap();
        // Lock outside of history so the stroke cannot be reverted
        doc.set_layer_locked(1, true).unwrap();
        assert!(matches!(manager.undo(&mut doc), Err(EditError::LayerLocked(_))));
        assert_eq!(manager.undo_count(), 1);
        assert_eq!(manager.redo_count(), 0);
        doc.set_layer_locked(1, false).unwrap();
        assert_eq!(manager.undo(&mut doc).unwrap(), "Brush Stroke");
    }

    #[test]
    fn strokes_merge_only_when_enabled() {
        let mut doc = doc_with_paint_layer();
        let before = snapshot(&doc);
        let mut manager = CommandManager::default();
        manager.execute(Box::new(stroke(1)), &mut doc).unwrap();
        manager.execute(Box::new(stroke(1)), &mut doc).unwrap();
        assert_eq!(manager.undo_count(), 2);

        manager.clear();
        manager.set_merge_strokes(true);
        manager.execute(Box::new(stroke(1)), &mut doc).unwrap();
        manager.execute(Box::new(stroke(1)), &mut doc).unwrap();
        assert_eq!(manager.undo_count(), 1);
        manager.undo(&mut doc).unwrap();
        manager.undo(&mut doc).unwrap_err();
        // Two unmerged strokes were dropped by clear(); reverting the merged
        // pair restores the state after them.
        assert_ne!(snapshot(&doc), before);
    }

    #[test]
    fn merged_strokes_undo_byte_for_byte() {
        let mut doc = doc_with_paint_layer();
        let before = snapshot(&doc);
        let mut manager = CommandManager::default();
        manager.set_merge_strokes(true);
        manager.execute(Box::new(stroke(1)), &mut doc).unwrap();
        let second = BrushStrokeCommand::new(
            1,
            BrushSettings::default().with_size(4.0),
            Rgba::new(0, 0, 0, 255),
            vec![BrushSample::new(25.0, 25.0, 1.0, 0.0)],
        );
        manager.execute(Box::new(second), &mut doc).unwrap();
        assert_eq!(manager.undo_count(), 1);
        manager.undo(&mut doc).unwrap();
        assert_eq!(snapshot(&doc), before);
    }

    #[test]
    fn groups_undo_as_one_step() {
        let mut doc = doc_with_paint_layer();
        let before = snapshot(&doc);
        let mut manager = CommandManager::default();
        manager.begin_group("Decorate");
        manager.execute(Box::new(stroke(1)), &mut doc).unwrap();
        manager.begin_group("Inner");
        manager.execute(Box::new(AddLayerCommand::raster("Extra")), &mut doc).unwrap();
        manager.end_group().unwrap();
        assert!(manager.is_grouping());
        manager.end_group().unwrap();
        assert_eq!(manager.undo_count(), 1);
        assert_eq!(manager.undo_description().as_deref(), Some("Decorate"));
        assert_eq!(manager.end_group(), Err(EditError::GroupNotOpen));

        manager.undo(&mut doc).unwrap();
        assert_eq!(snapshot(&doc), before);
        manager.redo(&mut doc).unwrap();
        assert_eq!(doc.layer_count(), 3);
    }

    #[test]
    fn step_limit_prunes_oldest() {
        let mut doc = doc_with_paint_layer();
        let mut manager = CommandManager::new(3);
        for i in 0..5 {
            let value = LayerProperty::Opacity(i as f32 / 10.0);
            manager.execute(Box::new(LayerPropertyCommand::new(1, value)), &mut doc).unwrap();
        }
        assert_eq!(manager.undo_count(), 3);
    }

    #[test]
    fn memory_limit_keeps_newest() {
        let mut doc = doc_with_paint_layer();
        let mut manager = CommandManager::default();
        manager.set_limits(50, Some(1));
        manager.execute(Box::new(stroke(1)), &mut doc).unwrap();
        manager.execute(Box::new(stroke(1)), &mut doc).unwrap();
        assert_eq!(manager.undo_count(), 1);
        assert!(manager.memory_usage() > 0);
    }

    fn held_memory(manager: &CommandManager) -> usize {
        manager
            .undo_stack
            .iter()
            .chain(&manager.redo_stack)
            .map(|c| c.memory_size())
            .sum()
    }

    #[test]
    fn undone_removal_frees_history_memory() {
        let mut doc = doc_with_paint_layer();
        let mut manager = CommandManager::default();
        manager.set_limits(50, Some(5000));
        for _ in 0..3 {
            manager.execute(Box::new(RemoveLayerCommand::new(1)), &mut doc).unwrap();
            manager.undo(&mut doc).unwrap();
            manager
                .execute(Box::new(LayerPropertyCommand::new(0, LayerProperty::Visibility(false))), &mut doc)
                .unwrap();
            assert_eq!(manager.memory_usage(), held_memory(&manager));
        }
        assert_eq!(manager.memory_usage(), 0);
        assert_eq!(manager.undo_count(), 3);
    }

    #[test]
    fn memory_tracks_structural_undo_redo() {
        let mut doc = doc_with_paint_layer();
        let mut manager = CommandManager::default();
        let commands: Vec<Box<dyn Command>> = vec![
            Box::new(AddLayerCommand::raster("Extra")),
            Box::new(DuplicateLayerCommand::new(1)),
            Box::new(RemoveLayerCommand::new(3)),
            Box::new(MergeDownCommand::new(2)),
            Box::new(FlattenCommand::new()),
        ];
        for command in commands {
            manager.execute(command, &mut doc).unwrap();
            assert_eq!(manager.memory_usage(), held_memory(&manager));
            manager.undo(&mut doc).unwrap();
            assert_eq!(manager.memory_usage(), held_memory(&manager));
            manager.redo(&mut doc).unwrap();
            assert_eq!(manager.memory_usage(), held_memory(&manager));
        }
        assert_eq!(doc.layer_count(), 1);

        while manager.can_undo() {
            manager.undo(&mut doc).unwrap();
            assert_eq!(manager.memory_usage(), held_memory(&manager));
        }
        assert_eq!(doc.layer_count(), 2);
        // The undone add still holds its layer for redo
        assert!(manager.memory_usage() >= 32 * 32 * 4);

        while manager.can_redo() {
            manager.redo(&mut doc).unwrap();
            assert_eq!(manager.memory_usage(), held_memory(&manager));
        }
        manager
            .execute(Box::new(LayerPropertyCommand::new(0, LayerProperty::Opacity(0.5))), &mut doc)
            .unwrap();
        assert_eq!(manager.memory_usage(), held_memory(&manager));
    }

    #[test]
    fn draw_patches_cover_only_the_stroke() {
        let mut doc = doc_with_paint_layer();
        let mut manager = CommandManager::default();
        manager.execute(Box::new(stroke(1)), &mut doc).unwrap();
        let full = 32 * 32 * 4;
        assert!(manager.memory_usage() > 0);
        assert!(manager.memory_usage() < 2 * full);
    }

    struct StubbornUndo;

    impl Command for StubbornUndo {
        fn execute(&mut self, _doc: &mut Document) -> EditResult<()> {
            Ok(())
        }
        fn undo(&mut self, _doc: &mut Document) -> EditResult<()> {
            Err(EditError::CommandFailed("cannot undo".into()))
        }
        fn description(&self) -> String {
            "Stubborn".to_string()
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[test]
    fn group_rollback_failure_keeps_first_error() {
        let mut doc = doc_with_paint_layer();
        let mut group = CommandGroup::new("Batch");
        group.push(Box::new(StubbornUndo));
        group.push(Box::new(RemoveLayerCommand::new(9)));
        let err = group.execute(&mut doc).unwrap_err();
        assert!(matches!(err, EditError::InvalidIndex { .. }));
        assert_eq!(doc.layer_count(), 2);
    }
}
