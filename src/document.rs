//! Document: the layer stack, active layer, selection and render cache.
//!
//! Layers are stored bottom→top; index 0 is the bottom. The active index is
//! `None` exactly when the stack is empty. Every mutation invalidates the
//! render cache and notifies listeners synchronously, in registration order,
//! once the mutation is complete.

use std::sync::{Mutex, MutexGuard};
use std::time::SystemTime;

use tracing::{debug, warn};

use crate::blend::BlendMode;
use crate::compositor;
use crate::error::{EditError, EditResult};
use crate::layer::{FlipAxis, Layer, LayerContent, LayerRender, RasterContent};
use crate::pixel::{PixelBuffer, Rect, Rgba};

pub const DEFAULT_WIDTH: u32 = 800;
pub const DEFAULT_HEIGHT: u32 = 600;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ColorMode {
    #[default]
    Rgb,
    /// Composites are reduced to luminance on output.
    Grayscale,
}

/// Document-level selection region.
#[derive(Clone, Debug, PartialEq)]
pub enum Selection {
    Rect(Rect),
    Ellipse { cx: f32, cy: f32, rx: f32, ry: f32 },
    /// Closed polygon path, even-odd fill.
    Polygon(Vec<(f32, f32)>),
}

impl Selection {
    /// Whether the centre of pixel `(x, y)` lies inside the region.
    pub fn contains(&self, x: i32, y: i32) -> bool {
        match self {
            Selection::Rect(r) => r.contains(x, y),
            Selection::Ellipse { cx, cy, rx, ry } => {
                if *rx <= 0.0 || *ry <= 0.0 {
                    return false;
                }
                let dx = (x as f32 + 0.5 - cx) / rx;
                let dy = (y as f32 + 0.5 - cy) / ry;
                dx * dx + dy * dy <= 1.0
            }
            Selection::Polygon(points) => {
                if points.len() < 3 {
                    return false;
                }
                let (px, py) = (x as f32 + 0.5, y as f32 + 0.5);
                let mut inside = false;
                let mut j = points.len() - 1;
                for i in 0..points.len() {
                    let (xi, yi) = points[i];
                    let (xj, yj) = points[j];
                    if (yi > py) != (yj > py) && px < (xj - xi) * (py - yi) / (yj - yi) + xi {
                        inside = !inside;
                    }
                    j = i;
                }
                inside
            }
        }
    }

    /// Bounding box clipped to a `width`×`height` canvas.
    pub fn bounds(&self, width: u32, height: u32) -> Option<Rect> {
        let raw = match self {
            Selection::Rect(r) => *r,
            Selection::Ellipse { cx, cy, rx, ry } => Rect::from_points(
                (cx - rx).floor() as i32,
                (cy - ry).floor() as i32,
                (cx + rx).ceil() as i32,
                (cy + ry).ceil() as i32,
            ),
            Selection::Polygon(points) => {
                let first = points.first()?;
                let (mut x0, mut y0, mut x1, mut y1) = (first.0, first.1, first.0, first.1);
                for &(x, y) in points {
                    x0 = x0.min(x);
                    y0 = y0.min(y);
                    x1 = x1.max(x);
                    y1 = y1.max(y);
                }
                Rect::from_points(x0.floor() as i32, y0.floor() as i32, x1.ceil() as i32, y1.ceil() as i32)
            }
        };
        raw.intersect(&Rect::from_size(width, height))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DocumentEvent {
    LayerAdded(usize),
    LayerRemoved(usize),
    LayerMoved { from: usize, to: usize },
    LayerChanged(usize),
    ActiveLayerChanged(Option<usize>),
    DocumentModified,
    DocumentResized { width: u32, height: u32 },
    SelectionChanged,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener = Box<dyn FnMut(&DocumentEvent) + Send>;

#[derive(Default)]
struct RenderCache {
    valid: bool,
    buffer: PixelBuffer,
}

pub struct Document {
    name: String,
    width: u32,
    height: u32,
    color_mode: ColorMode,
    layers: Vec<Layer>,
    active: Option<usize>,
    selection: Option<Selection>,
    created: SystemTime,
    modified: SystemTime,
    parallel: bool,
    listeners: Vec<(ListenerId, Listener)>,
    next_listener: u64,
    render_cache: Mutex<RenderCache>,
}

impl std::fmt::Debug for Document {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Document")
            .field("name", &self.name)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("layers", &self.layers.len())
            .field("active", &self.active)
            .finish_non_exhaustive()
    }
}

impl Default for Document {
    fn default() -> Self {
        Self::new(DEFAULT_WIDTH, DEFAULT_HEIGHT)
    }
}

impl Document {
    /// New document with an opaque white "Background" layer, active.
    pub fn new(width: u32, height: u32) -> Self {
        let mut doc = Self::empty(width, height);
        doc.layers.push(Layer::from_image("Background", PixelBuffer::filled(width, height, Rgba::WHITE)));
        doc.active = Some(0);
        doc
    }

    /// New document with no layers.
    pub fn empty(width: u32, height: u32) -> Self {
        let now = SystemTime::now();
        Self {
            name: "Untitled".to_string(),
            width,
            height,
            color_mode: ColorMode::Rgb,
            layers: Vec::new(),
            active: None,
            selection: None,
            created: now,
            modified: now,
            parallel: true,
            listeners: Vec::new(),
            next_listener: 0,
            render_cache: Mutex::new(RenderCache::default()),
        }
    }

    // ------------------------------------------------------------------
    // Properties
    // ------------------------------------------------------------------

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: &str) {
        if self.name != name {
            self.name = name.to_string();
            self.touch();
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn bounds(&self) -> Rect {
        Rect::from_size(self.width, self.height)
    }

    pub fn color_mode(&self) -> ColorMode {
        self.color_mode
    }

    pub fn set_color_mode(&mut self, mode: ColorMode) {
        if self.color_mode != mode {
            self.color_mode = mode;
            self.invalidate_cache();
            self.touch();
        }
    }

    pub fn created(&self) -> SystemTime {
        self.created
    }

    pub fn modified(&self) -> SystemTime {
        self.modified
    }

    /// Row-parallel compositing on the rayon pool. Output is identical
    /// either way.
    pub fn set_parallel_compositing(&mut self, parallel: bool) {
        self.parallel = parallel;
    }

    // ------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------

    pub fn subscribe<F>(&mut self, listener: F) -> ListenerId
    where
        F: FnMut(&DocumentEvent) + Send + 'static,
    {
        let id = ListenerId(self.next_listener);
        self.next_listener += 1;
        self.listeners.push((id, Box::new(listener)));
        id
    }

    pub fn unsubscribe(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(lid, _)| *lid != id);
        self.listeners.len() != before
    }

    fn emit(&mut self, event: DocumentEvent) {
        for (_, listener) in &mut self.listeners {
            listener(&event);
        }
    }

    /// Stamp the modification time and notify `DocumentModified`.
    fn touch(&mut self) {
        self.modified = SystemTime::now();
        self.emit(DocumentEvent::DocumentModified);
    }

    fn set_active_internal(&mut self, active: Option<usize>) {
        if self.active != active {
            self.active = active;
            self.emit(DocumentEvent::ActiveLayerChanged(active));
        }
    }

    // ------------------------------------------------------------------
    // Layer access
    // ------------------------------------------------------------------

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }

    pub fn layer(&self, index: usize) -> Option<&Layer> {
        self.layers.get(index)
    }

    /// Mutable access for edits not covered by a document method. The render
    /// cache is dropped; call [`flush_layer_changes`](Self::flush_layer_changes)
    /// afterwards to notify listeners.
    pub fn layer_mut(&mut self, index: usize) -> Option<&mut Layer> {
        if index >= self.layers.len() {
            return None;
        }
        self.invalidate_cache();
        self.layers.get_mut(index)
    }

    pub fn index_of(&self, id: crate::layer::LayerId) -> Option<usize> {
        self.layers.iter().position(|l| l.id() == id)
    }

    /// `-1` when the stack is empty.
    pub fn active_layer_index(&self) -> isize {
        self.active.map_or(-1, |i| i as isize)
    }

    pub fn active_index(&self) -> Option<usize> {
        self.active
    }

    pub fn active_layer(&self) -> Option<&Layer> {
        self.active.and_then(|i| self.layers.get(i))
    }

    pub fn active_layer_mut(&mut self) -> Option<&mut Layer> {
        let index = self.active?;
        self.layer_mut(index)
    }

    /// Select the active layer. `-1` is only accepted on an empty stack.
    pub fn set_active_layer(&mut self, index: isize) -> EditResult<()> {
        let count = self.layers.len();
        if index == -1 && count == 0 {
            return Ok(());
        }
        if index < 0 || index as usize >= count {
            return Err(EditError::InvalidIndex { index, count });
        }
        self.set_active_internal(Some(index as usize));
        Ok(())
    }

    fn check_index(&self, index: usize) -> EditResult<()> {
        if index >= self.layers.len() {
            return Err(EditError::InvalidIndex {
                index: index as isize,
                count: self.layers.len(),
            });
        }
        Ok(())
    }

    /// Emit `LayerChanged` for every top-level layer with pending property
    /// changes (including changes inside its children).
    pub fn flush_layer_changes(&mut self) {
        let changed: Vec<usize> = self
            .layers
            .iter_mut()
            .enumerate()
            .filter_map(|(i, l)| (!l.take_changes().is_empty()).then_some(i))
            .collect();
        if changed.is_empty() {
            return;
        }
        self.invalidate_cache();
        for index in changed {
            self.emit(DocumentEvent::LayerChanged(index));
        }
        self.touch();
    }

    // ------------------------------------------------------------------
    // Structure
    // ------------------------------------------------------------------

    /// Insert `layer` at `index`; `-1` or any out-of-range index appends.
    /// Returns the index it landed at. The first layer added to an empty
    /// stack becomes active.
    pub fn add_layer(&mut self, mut layer: Layer, index: isize) -> usize {
        let count = self.layers.len();
        let index = if index < 0 || index as usize > count { count } else { index as usize };
        layer.take_changes();
        self.layers.insert(index, layer);
        let active = match self.active {
            None => Some(index),
            Some(a) if a >= index => Some(a + 1),
            other => other,
        };
        self.invalidate_cache();
        self.set_active_internal(active);
        debug!(layer = index, count = self.layers.len(), "layer added");
        self.emit(DocumentEvent::LayerAdded(index));
        self.touch();
        index
    }

    /// Remove and return the layer at `index`.
    ///
    /// Removing the active layer keeps the same index clamped to the new
    /// top, or clears it when the stack becomes empty. An active index
    /// above the removed one shifts down.
    pub fn remove_layer(&mut self, index: usize) -> EditResult<Layer> {
        self.check_index(index)?;
        let layer = self.layers.remove(index);
        let active = match self.active {
            _ if self.layers.is_empty() => None,
            Some(a) if a == index => Some(a.min(self.layers.len() - 1)),
            Some(a) if a > index => Some(a - 1),
            other => other,
        };
        self.invalidate_cache();
        self.set_active_internal(active);
        debug!(layer = index, count = self.layers.len(), "layer removed");
        self.emit(DocumentEvent::LayerRemoved(index));
        self.touch();
        Ok(layer)
    }

    /// Move a layer from `from` to `to` (both indexes in the current stack).
    pub fn move_layer(&mut self, from: usize, to: usize) -> EditResult<()> {
        self.check_index(from)?;
        self.check_index(to)?;
        if from == to {
            return Ok(());
        }
        let layer = self.layers.remove(from);
        self.layers.insert(to, layer);
        let active = match self.active {
            Some(a) if a == from => Some(to),
            Some(a) if from < a && a <= to => Some(a - 1),
            Some(a) if to <= a && a < from => Some(a + 1),
            other => other,
        };
        self.invalidate_cache();
        self.set_active_internal(active);
        debug!(from, to, "layer moved");
        self.emit(DocumentEvent::LayerMoved { from, to });
        self.touch();
        Ok(())
    }

    /// Insert a copy of layer `index` directly above it, named "<name> copy".
    pub fn duplicate_layer(&mut self, index: usize) -> EditResult<usize> {
        self.check_index(index)?;
        let original = &self.layers[index];
        let mut copy = original.duplicate();
        copy.set_name(&format!("{} copy", original.name()));
        Ok(self.add_layer(copy, index as isize + 1))
    }

    /// Composite layer `index` onto the layer below it and remove it.
    /// Returns the removed top layer.
    ///
    /// Text below is rasterized first; an adjustment layer below cannot take
    /// pixels and fails with `NotRaster`.
    pub fn merge_down(&mut self, index: usize) -> EditResult<Layer> {
        self.check_index(index)?;
        if index == 0 {
            return Err(EditError::InvalidIndex {
                index: 0,
                count: self.layers.len(),
            });
        }
        let (w, h) = (self.width, self.height);
        let below = &self.layers[index - 1];
        if below.is_locked() {
            return Err(EditError::LayerLocked(below.name().to_string()));
        }
        if matches!(below.content(), LayerContent::Adjustment(_)) {
            return Err(EditError::NotRaster(below.name().to_string()));
        }

        let mut merged = compositor::layer_source(below, w, h, self.parallel);
        compositor::composite_layer_onto(&mut merged, &self.layers[index], self.parallel);

        let top = self.layers.remove(index);
        let below = &mut self.layers[index - 1];
        below.bake_pixels(merged);
        below.take_changes();

        let active = match self.active {
            Some(a) if a >= index => Some(a - 1),
            other => other,
        };
        self.invalidate_cache();
        self.set_active_internal(active);
        debug!(layer = index, "merged down");
        self.emit(DocumentEvent::LayerRemoved(index));
        self.emit(DocumentEvent::LayerChanged(index - 1));
        self.touch();
        Ok(top)
    }

    /// Replace layer `index` by its raster equivalent. Returns the layer that
    /// was replaced.
    pub fn rasterize_layer(&mut self, index: usize) -> EditResult<Layer> {
        self.check_index(index)?;
        let layer = &self.layers[index];
        let Some(raster) = layer.rasterize(self.width, self.height) else {
            return Err(EditError::CommandFailed(format!("'{}' has nothing to rasterize", layer.name())));
        };
        Ok(self.replace_layer(index, raster))
    }

    /// Swap the layer at `index` for another one, returning the old one.
    /// `index` must already be checked.
    pub(crate) fn replace_layer(&mut self, index: usize, layer: Layer) -> Layer {
        let old = std::mem::replace(&mut self.layers[index], layer);
        self.invalidate_cache();
        self.emit(DocumentEvent::LayerChanged(index));
        self.touch();
        old
    }

    /// Replace the whole stack and active index. Used to restore snapshots.
    pub(crate) fn restore_layers(&mut self, layers: Vec<Layer>, active: Option<usize>) -> Vec<Layer> {
        let old = std::mem::replace(&mut self.layers, layers);
        let active = active.filter(|a| *a < self.layers.len()).or(if self.layers.is_empty() { None } else { Some(0) });
        self.active = active;
        self.invalidate_cache();
        self.emit(DocumentEvent::ActiveLayerChanged(active));
        self.touch();
        old
    }

    /// Composite every visible layer into a single "Background" raster layer.
    /// Returns the previous stack.
    pub fn flatten(&mut self) -> EditResult<Vec<Layer>> {
        if self.layers.is_empty() {
            return Err(EditError::NoActiveLayer);
        }
        let flat = compositor::composite_layers(&self.layers, self.width, self.height, self.parallel);
        let previous = self.restore_layers(vec![Layer::from_image("Background", flat)], Some(0));
        debug!(merged = previous.len(), "flattened");
        Ok(previous)
    }

    // ------------------------------------------------------------------
    // Per-layer setters
    // ------------------------------------------------------------------

    fn update_layer<F>(&mut self, index: usize, f: F) -> EditResult<()>
    where
        F: FnOnce(&mut Layer),
    {
        self.check_index(index)?;
        f(&mut self.layers[index]);
        self.layers[index].take_changes();
        self.invalidate_cache();
        self.emit(DocumentEvent::LayerChanged(index));
        self.touch();
        Ok(())
    }

    pub fn set_layer_visible(&mut self, index: usize, visible: bool) -> EditResult<()> {
        self.update_layer(index, |l| l.set_visible(visible))
    }

    pub fn set_layer_locked(&mut self, index: usize, locked: bool) -> EditResult<()> {
        self.update_layer(index, |l| l.set_locked(locked))
    }

    /// Opacity is clamped to [0, 1].
    pub fn set_layer_opacity(&mut self, index: usize, opacity: f32) -> EditResult<()> {
        self.update_layer(index, |l| l.set_opacity(opacity))
    }

    pub fn set_layer_blend_mode(&mut self, index: usize, mode: BlendMode) -> EditResult<()> {
        self.update_layer(index, |l| l.set_blend_mode(mode))
    }

    pub fn rename_layer(&mut self, index: usize, name: &str) -> EditResult<()> {
        self.update_layer(index, |l| l.set_name(name))
    }

    pub fn set_layer_position(&mut self, index: usize, x: i32, y: i32) -> EditResult<()> {
        self.update_layer(index, |l| l.set_position(x, y))
    }

    /// Run `edit` on the raster pixels of layer `index`. Fails on locked and
    /// non-raster layers without touching anything.
    pub fn edit_raster<F, R>(&mut self, index: usize, edit: F) -> EditResult<R>
    where
        F: FnOnce(&mut RasterContent) -> R,
    {
        self.check_index(index)?;
        let layer = &self.layers[index];
        if layer.is_locked() {
            return Err(EditError::LayerLocked(layer.name().to_string()));
        }
        if layer.raster().is_none() {
            return Err(EditError::NotRaster(layer.name().to_string()));
        }
        let mut result = None;
        self.update_layer(index, |l| {
            if let Some(r) = l.raster_mut() {
                result = Some(edit(r));
            }
        })?;
        result.ok_or_else(|| EditError::NotRaster(self.layers[index].name().to_string()))
    }

    // ------------------------------------------------------------------
    // Selection
    // ------------------------------------------------------------------

    pub fn selection(&self) -> Option<&Selection> {
        self.selection.as_ref()
    }

    pub fn set_selection(&mut self, selection: Option<Selection>) {
        if self.selection != selection {
            self.selection = selection;
            self.emit(DocumentEvent::SelectionChanged);
        }
    }

    pub fn select_all(&mut self) {
        self.set_selection(Some(Selection::Rect(self.bounds())));
    }

    pub fn clear_selection(&mut self) {
        self.set_selection(None);
    }

    // ------------------------------------------------------------------
    // Whole-document transforms
    // ------------------------------------------------------------------

    pub fn flip_horizontal(&mut self) {
        self.flip(FlipAxis::Horizontal);
    }

    pub fn flip_vertical(&mut self) {
        self.flip(FlipAxis::Vertical);
    }

    fn flip(&mut self, axis: FlipAxis) {
        let (w, h) = (self.width, self.height);
        for layer in &mut self.layers {
            layer.flip_in_canvas(axis, w, h);
        }
        self.flush_layer_changes();
    }

    /// Change the canvas size, anchoring content at the top-left.
    pub fn resize_canvas(&mut self, width: u32, height: u32) {
        if (width, height) == (self.width, self.height) {
            return;
        }
        for layer in &mut self.layers {
            layer.resize_canvas(width, height);
            layer.take_changes();
        }
        self.width = width;
        self.height = height;
        if let Some(sel) = &self.selection
            && sel.bounds(width, height).is_none()
        {
            self.selection = None;
            self.emit(DocumentEvent::SelectionChanged);
        }
        self.invalidate_cache();
        debug!(width, height, "canvas resized");
        self.emit(DocumentEvent::DocumentResized { width, height });
        self.touch();
    }

    // ------------------------------------------------------------------
    // Rendering
    // ------------------------------------------------------------------

    fn cache(&self) -> MutexGuard<'_, RenderCache> {
        self.render_cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn invalidate_cache(&self) {
        self.cache().valid = false;
    }

    pub fn is_cache_valid(&self) -> bool {
        self.cache().valid
    }

    fn composite_full(&self) -> PixelBuffer {
        let mut out = compositor::composite_layers(&self.layers, self.width, self.height, self.parallel);
        if self.color_mode == ColorMode::Grayscale {
            for px in out.pixels_mut().chunks_exact_mut(4) {
                let l = (0.299 * px[0] as f32 + 0.587 * px[1] as f32 + 0.114 * px[2] as f32).round();
                let l = l.clamp(0.0, px[3] as f32) as u8;
                px[0] = l;
                px[1] = l;
                px[2] = l;
            }
        }
        out
    }

    /// Composite the document, or the part of it inside `viewport`.
    ///
    /// A viewport inside the document is cropped from the cached full
    /// composite (built first if needed). A viewport reaching outside the
    /// document is recomposited; pixels beyond the canvas are transparent.
    pub fn render(&self, viewport: Option<Rect>) -> PixelBuffer {
        let doc_bounds = self.bounds();
        let viewport = viewport.unwrap_or(doc_bounds);
        if !doc_bounds.contains_rect(&viewport) {
            let full = self.composite_full();
            let mut out = PixelBuffer::new(viewport.width, viewport.height);
            out.paste(&full, -viewport.x, -viewport.y);
            return out;
        }

        let mut cache = self.cache();
        let sized = cache.buffer.width() == self.width && cache.buffer.height() == self.height;
        if !cache.valid || !sized {
            cache.buffer = self.composite_full();
            cache.valid = true;
            debug!(width = self.width, height = self.height, layers = self.layers.len(), "recomposited");
        }
        if viewport == doc_bounds {
            cache.buffer.clone()
        } else {
            cache.buffer.copy_region(viewport)
        }
    }

    /// Whole-document composite scaled to fit within `max_side`.
    pub fn render_thumbnail(&self, max_side: u32) -> PixelBuffer {
        self.render(None).thumbnail(max_side)
    }

    /// Composite of layer `index` alone, as it would contribute to the
    /// document (effects and children included, opacity ignored).
    pub fn render_layer(&self, index: usize) -> EditResult<PixelBuffer> {
        self.check_index(index)?;
        Ok(compositor::layer_source(&self.layers[index], self.width, self.height, self.parallel))
    }
}

/// Log and swallow an edit error at a call site that reports failure as a
/// status rather than a `Result`.
pub fn report(result: EditResult<()>, what: &str) -> bool {
    match result {
        Ok(()) => true,
        Err(err) => {
            warn!(error = %err, "{what} failed");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex as StdMutex};

    use crate::layer::AdjustmentKind;

    fn recorder(doc: &mut Document) -> Arc<StdMutex<Vec<DocumentEvent>>> {
        let events = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        doc.subscribe(move |e| sink.lock().unwrap().push(e.clone()));
        events
    }

    fn assert_active_valid(doc: &Document) {
        match doc.active_index() {
            None => assert_eq!(doc.layer_count(), 0),
            Some(a) => assert!(a < doc.layer_count()),
        }
    }

    #[test]
    fn default_document_scenario() {
        let mut doc = Document::default();
        assert_eq!((doc.width(), doc.height()), (800, 600));
        assert_eq!(doc.layer_count(), 1);
        assert_eq!(doc.layers()[0].name(), "Background");
        assert_eq!(doc.active_layer_index(), 0);
        assert_eq!(doc.render(Some(Rect::new(0, 0, 1, 1))).get(0, 0), Some(Rgba::WHITE));

        let index = doc.add_layer(Layer::new_raster("Layer 1", 800, 600), -1);
        doc.set_active_layer(index as isize).unwrap();
        assert_eq!(index, 1);
        assert_eq!(doc.active_layer_index(), 1);
        assert_eq!(doc.active_layer().unwrap().name(), "Layer 1");
    }

    #[test]
    fn active_index_invariant_over_mixed_sequence() {
        let mut doc = Document::empty(4, 4);
        assert_eq!(doc.active_layer_index(), -1);
        for i in 0..5 {
            doc.add_layer(Layer::new_raster(&format!("L{i}"), 4, 4), if i % 2 == 0 { -1 } else { 0 });
            assert_active_valid(&doc);
        }
        doc.set_active_layer(4).unwrap();
        let ops: &[(usize, usize)] = &[(4, 0), (0, 3), (2, 2), (1, 4), (3, 1)];
        for &(from, to) in ops {
            doc.move_layer(from, to).unwrap();
            assert_active_valid(&doc);
        }
        while doc.layer_count() > 0 {
            let idx = doc.layer_count() / 2;
            doc.remove_layer(idx).unwrap();
            assert_active_valid(&doc);
        }
        assert_eq!(doc.active_layer_index(), -1);
    }

    #[test]
    fn first_layer_into_empty_stack_becomes_active() {
        let mut doc = Document::empty(2, 2);
        doc.add_layer(Layer::new_raster("A", 2, 2), 5);
        assert_eq!(doc.active_layer_index(), 0);
        // Inserting below the active layer keeps it selected
        doc.add_layer(Layer::new_raster("B", 2, 2), 0);
        assert_eq!(doc.active_layer().unwrap().name(), "A");
    }

    #[test]
    fn removing_active_layer_clamps() {
        let mut doc = Document::empty(2, 2);
        for n in ["A", "B", "C"] {
            doc.add_layer(Layer::new_raster(n, 2, 2), -1);
        }
        doc.set_active_layer(2).unwrap();
        doc.remove_layer(2).unwrap();
        assert_eq!(doc.active_layer_index(), 1);
        doc.set_active_layer(0).unwrap();
        doc.remove_layer(0).unwrap();
        assert_eq!(doc.active_layer_index(), 0);
        assert_eq!(doc.active_layer().unwrap().name(), "B");
    }

    #[test]
    fn active_follows_moves() {
        let mut doc = Document::empty(1, 1);
        for n in ["A", "B", "C", "D"] {
            doc.add_layer(Layer::new_raster(n, 1, 1), -1);
        }
        doc.set_active_layer(2).unwrap();
        doc.move_layer(0, 3).unwrap();
        assert_eq!(doc.active_layer().unwrap().name(), "C");
        assert_eq!(doc.active_layer_index(), 1);
        doc.move_layer(3, 0).unwrap();
        assert_eq!(doc.active_layer_index(), 2);
        doc.move_layer(2, 0).unwrap();
        assert_eq!(doc.active_layer_index(), 0);
        assert_eq!(doc.active_layer().unwrap().name(), "C");
    }

    #[test]
    fn invalid_indexes_fail_without_mutation() {
        let mut doc = Document::new(2, 2);
        assert!(matches!(doc.remove_layer(3), Err(EditError::InvalidIndex { .. })));
        assert!(doc.move_layer(0, 1).is_err());
        assert!(doc.set_active_layer(-1).is_err());
        assert!(doc.set_active_layer(1).is_err());
        assert!(doc.merge_down(0).is_err());
        assert!(doc.set_layer_opacity(9, 0.5).is_err());
        assert_eq!(doc.layer_count(), 1);
        assert_eq!(doc.active_layer_index(), 0);
    }

    #[test]
    fn events_arrive_in_order() {
        let mut doc = Document::empty(2, 2);
        let events = recorder(&mut doc);
        doc.add_layer(Layer::new_raster("A", 2, 2), -1);
        doc.add_layer(Layer::new_raster("B", 2, 2), -1);
        doc.move_layer(1, 0).unwrap();
        doc.remove_layer(1).unwrap();
        let got = events.lock().unwrap().clone();
        assert_eq!(
            got,
            vec![
                DocumentEvent::ActiveLayerChanged(Some(0)),
                DocumentEvent::LayerAdded(0),
                DocumentEvent::DocumentModified,
                DocumentEvent::LayerAdded(1),
                DocumentEvent::DocumentModified,
                DocumentEvent::ActiveLayerChanged(Some(1)),
                DocumentEvent::LayerMoved { from: 1, to: 0 },
                DocumentEvent::DocumentModified,
                DocumentEvent::ActiveLayerChanged(Some(0)),
                DocumentEvent::LayerRemoved(1),
                DocumentEvent::DocumentModified,
            ]
        );
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let mut doc = Document::empty(1, 1);
        let events = Arc::new(StdMutex::new(0usize));
        let sink = Arc::clone(&events);
        let id = doc.subscribe(move |_| *sink.lock().unwrap() += 1);
        doc.set_name("x");
        assert!(doc.unsubscribe(id));
        doc.set_name("y");
        assert_eq!(*events.lock().unwrap(), 1);
        assert!(!doc.unsubscribe(id));
    }

    #[test]
    fn opacity_setter_clamps_and_notifies() {
        let mut doc = Document::new(1, 1);
        let events = recorder(&mut doc);
        doc.set_layer_opacity(0, -0.5).unwrap();
        assert_eq!(doc.layers()[0].opacity(), 0.0);
        doc.set_layer_opacity(0, 2.0).unwrap();
        assert_eq!(doc.layers()[0].opacity(), 1.0);
        assert!(events.lock().unwrap().contains(&DocumentEvent::LayerChanged(0)));
    }

    #[test]
    fn cache_survives_viewport_changes_but_not_edits() {
        let mut doc = Document::new(4, 4);
        assert!(!doc.is_cache_valid());
        let full = doc.render(None);
        assert!(doc.is_cache_valid());
        let crop = doc.render(Some(Rect::new(1, 1, 2, 2)));
        assert!(doc.is_cache_valid());
        assert_eq!(crop, full.copy_region(Rect::new(1, 1, 2, 2)));
        doc.set_layer_visible(0, false).unwrap();
        assert!(!doc.is_cache_valid());
        assert_eq!(doc.render(None).get(0, 0), Some(Rgba::TRANSPARENT));
    }

    #[test]
    fn viewport_outside_document_is_padded() {
        let doc = Document::new(2, 2);
        let out = doc.render(Some(Rect::new(-1, 0, 3, 2)));
        assert_eq!(out.width(), 3);
        assert_eq!(out.get(0, 0), Some(Rgba::TRANSPARENT));
        assert_eq!(out.get(1, 0), Some(Rgba::WHITE));
        assert!(!doc.is_cache_valid());
    }

    #[test]
    fn merge_down_composites_and_removes_top() {
        let mut doc = Document::new(2, 1);
        let mut top = Layer::new_raster("Top", 2, 1);
        top.raster_mut().unwrap().image_mut().set(1, 0, Rgba::BLACK).unwrap();
        doc.add_layer(top, -1);
        doc.set_active_layer(1).unwrap();
        let before = doc.render(None);
        doc.merge_down(1).unwrap();
        assert_eq!(doc.layer_count(), 1);
        assert_eq!(doc.active_layer_index(), 0);
        assert_eq!(doc.render(None), before);
    }

    #[test]
    fn merge_down_applies_adjustment_to_pixels() {
        let mut doc = Document::new(1, 1);
        doc.add_layer(Layer::new_adjustment("Invert", AdjustmentKind::Invert), -1);
        doc.merge_down(1).unwrap();
        assert_eq!(doc.layers()[0].raster().unwrap().image().get(0, 0), Some(Rgba::BLACK));
    }

    #[test]
    fn merge_onto_adjustment_fails() {
        let mut doc = Document::empty(1, 1);
        doc.add_layer(Layer::new_adjustment("Invert", AdjustmentKind::Invert), -1);
        doc.add_layer(Layer::new_raster("Top", 1, 1), -1);
        assert!(matches!(doc.merge_down(1), Err(EditError::NotRaster(_))));
        assert_eq!(doc.layer_count(), 2);
    }

    #[test]
    fn duplicate_inserts_copy_above() {
        let mut doc = Document::new(1, 1);
        let idx = doc.duplicate_layer(0).unwrap();
        assert_eq!(idx, 1);
        assert_eq!(doc.layers()[1].name(), "Background copy");
        assert_ne!(doc.layers()[0].id(), doc.layers()[1].id());
    }

    #[test]
    fn rasterize_text_splices_raster_in_place() {
        let mut doc = Document::new(4, 4);
        doc.add_layer(Layer::new_text("Title", ""), -1);
        let old = doc.rasterize_layer(1).unwrap();
        assert_eq!(old.kind(), crate::layer::LayerKind::Text);
        assert_eq!(doc.layers()[1].kind(), crate::layer::LayerKind::Raster);
        assert!(doc.rasterize_layer(0).is_err());
    }

    #[test]
    fn flatten_keeps_the_picture() {
        let mut doc = Document::new(3, 3);
        let mut top = Layer::from_image("Top", PixelBuffer::filled(3, 3, Rgba::new(255, 0, 0, 255)));
        top.set_opacity(0.5);
        doc.add_layer(top, -1);
        let before = doc.render(None);
        let old = doc.flatten().unwrap();
        assert_eq!(old.len(), 2);
        assert_eq!(doc.layer_count(), 1);
        assert_eq!(doc.active_layer_index(), 0);
        assert_eq!(doc.render(None), before);
    }

    #[test]
    fn flip_horizontal_mirrors_composite() {
        let mut doc = Document::empty(3, 1);
        let mut img = PixelBuffer::new(3, 1);
        img.set(0, 0, Rgba::BLACK).unwrap();
        doc.add_layer(Layer::from_image("L", img), -1);
        doc.flip_horizontal();
        let out = doc.render(None);
        assert_eq!(out.get(2, 0), Some(Rgba::BLACK));
        assert_eq!(out.get(0, 0), Some(Rgba::TRANSPARENT));
    }

    #[test]
    fn resize_canvas_keeps_top_left() {
        let mut doc = Document::new(2, 2);
        let events = recorder(&mut doc);
        doc.resize_canvas(3, 1);
        assert_eq!((doc.width(), doc.height()), (3, 1));
        let out = doc.render(None);
        assert_eq!(out.get(1, 0), Some(Rgba::WHITE));
        assert_eq!(out.get(2, 0), Some(Rgba::TRANSPARENT));
        assert!(events.lock().unwrap().contains(&DocumentEvent::DocumentResized { width: 3, height: 1 }));
    }

    #[test]
    fn selection_shapes() {
        let poly = Selection::Polygon(vec![(0.0, 0.0), (4.0, 0.0), (0.0, 4.0)]);
        assert!(poly.contains(0, 0));
        assert!(!poly.contains(3, 3));
        assert_eq!(poly.bounds(10, 10), Some(Rect::new(0, 0, 5, 5)));
        let ellipse = Selection::Ellipse { cx: 2.0, cy: 2.0, rx: 2.0, ry: 1.0 };
        assert!(ellipse.contains(1, 1));
        assert!(!ellipse.contains(1, 3));
        let mut doc = Document::new(4, 4);
        let events = recorder(&mut doc);
        doc.select_all();
        doc.select_all();
        assert_eq!(doc.selection(), Some(&Selection::Rect(Rect::new(0, 0, 4, 4))));
        assert_eq!(events.lock().unwrap().len(), 1);
    }

    #[test]
    fn grayscale_mode_desaturates_output() {
        let mut doc = Document::empty(1, 1);
        doc.add_layer(Layer::from_image("R", PixelBuffer::filled(1, 1, Rgba::new(255, 0, 0, 255))), -1);
        doc.set_color_mode(ColorMode::Grayscale);
        assert_eq!(doc.render(None).get(0, 0), Some(Rgba::new(76, 76, 76, 255)));
    }

    #[test]
    fn edit_raster_respects_lock() {
        let mut doc = Document::new(2, 2);
        doc.set_layer_locked(0, true).unwrap();
        let res = doc.edit_raster(0, |r| r.image_mut().fill(Rgba::BLACK));
        assert!(matches!(res, Err(EditError::LayerLocked(_))));
        assert_eq!(doc.render(None).get(0, 0), Some(Rgba::WHITE));
        assert!(!report(res, "fill"));
    }
}
