//! Top-level owner of open documents, their histories, the brush and the AI
//! client. Pointer input arrives as [`ToolInput`] and is turned into
//! commands when the gesture ends.

use std::path::Path;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::ai::{AiClient, AiClientConfig, AiService, ServiceType, TaskId};
use crate::brush::{BrushEngine, BrushSample, StampMode};
use crate::codec::{ImageCodec, ImageCrateCodec};
use crate::command::{
    AddLayerCommand, BrushStrokeCommand, Command, CommandManager, DrawShapeCommand, EraseCommand, NewLayer,
};
use crate::config::EngineSettings;
use crate::document::Document;
use crate::error::{AiError, CodecError, EditError, EditResult};
use crate::layer::{Layer, LayerContent};
use crate::params::ParamMap;
use crate::pixel::{Rect, Rgba};
use crate::shapes::ShapeStyle;

pub const BUTTON_PRIMARY: u32 = 1;
pub const BUTTON_SECONDARY: u32 = 1 << 1;

/// One pointer event in document coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ToolInput {
    pub x: f32,
    pub y: f32,
    /// 0..=1, 1 for devices without pressure.
    pub pressure: f32,
    /// Degrees from vertical.
    pub tilt: f32,
    pub buttons: u32,
}

impl ToolInput {
    pub fn at(x: f32, y: f32) -> Self {
        Self {
            x,
            y,
            pressure: 1.0,
            tilt: 0.0,
            buttons: BUTTON_PRIMARY,
        }
    }

    pub fn with_pressure(mut self, pressure: f32) -> Self {
        self.pressure = pressure;
        self
    }

    pub fn with_buttons(mut self, buttons: u32) -> Self {
        self.buttons = buttons;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Tool {
    #[default]
    Brush,
    Eraser,
    Line,
    Rectangle,
    Ellipse,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Drag {
    layer: usize,
    start: (f32, f32),
    end: (f32, f32),
    secondary: bool,
}

#[derive(Debug)]
struct OpenDocument {
    document: Document,
    history: CommandManager,
}

#[derive(Debug)]
pub struct Engine {
    settings: EngineSettings,
    documents: Vec<OpenDocument>,
    active: Option<usize>,
    brush: BrushEngine,
    tool: Tool,
    primary_color: Rgba,
    secondary_color: Rgba,
    shape_style: ShapeStyle,
    drag: Option<Drag>,
    codec: ImageCrateCodec,
    ai: AiClient,
    untitled_counter: usize,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(EngineSettings::default())
    }
}

impl Engine {
    pub fn new(settings: EngineSettings) -> Self {
        let ai = AiClient::new(AiClientConfig {
            mode: settings.ai_mode,
            max_concurrent: settings.ai_max_concurrent.max(1),
            timeout: Duration::from_secs(settings.ai_timeout_secs),
        });
        Self {
            settings,
            documents: Vec::new(),
            active: None,
            brush: BrushEngine::default(),
            tool: Tool::default(),
            primary_color: Rgba::BLACK,
            secondary_color: Rgba::WHITE,
            shape_style: ShapeStyle::default(),
            drag: None,
            codec: ImageCrateCodec::default(),
            ai,
            untitled_counter: 0,
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    fn new_history(&self) -> CommandManager {
        let mut history = CommandManager::new(self.settings.max_undo_steps);
        history.set_limits(self.settings.max_undo_steps, Some(self.settings.max_undo_memory_bytes()));
        history.set_merge_strokes(self.settings.merge_brush_strokes);
        history
    }

    /// Apply changed settings to every open document's history.
    pub fn apply_settings(&mut self, settings: EngineSettings) {
        self.settings = settings;
        for open in &mut self.documents {
            open.history
                .set_limits(self.settings.max_undo_steps, Some(self.settings.max_undo_memory_bytes()));
            open.history.set_merge_strokes(self.settings.merge_brush_strokes);
            open.document.set_parallel_compositing(self.settings.parallel_compositing);
        }
        self.ai.set_mode(self.settings.ai_mode);
        self.ai.set_max_concurrent(self.settings.ai_max_concurrent);
        self.ai.set_timeout(Duration::from_secs(self.settings.ai_timeout_secs));
    }

    // ------------------------------------------------------------------
    // Documents
    // ------------------------------------------------------------------

    /// Open a new document at the configured default size with a white
    /// background and make it active.
    pub fn create_new_document(&mut self) -> usize {
        self.create_document(self.settings.default_width, self.settings.default_height)
    }

    pub fn create_document(&mut self, width: u32, height: u32) -> usize {
        self.untitled_counter += 1;
        let mut document = Document::new(width, height);
        document.set_name(&format!("Untitled {}", self.untitled_counter));
        self.add_document(document)
    }

    /// Take ownership of `document` and make it active.
    pub fn add_document(&mut self, mut document: Document) -> usize {
        document.set_parallel_compositing(self.settings.parallel_compositing);
        info!(name = document.name(), width = document.width(), height = document.height(), "document opened");
        let history = self.new_history();
        self.documents.push(OpenDocument { document, history });
        let index = self.documents.len() - 1;
        self.active = Some(index);
        index
    }

    /// Load an image file as a single-layer document.
    pub fn open_image(&mut self, path: &Path) -> Result<usize, CodecError> {
        let pixels = self.codec.load(path)?;
        let mut document = Document::empty(pixels.width(), pixels.height());
        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
            document.set_name(stem);
        }
        document.add_layer(Layer::from_image("Background", pixels), -1);
        Ok(self.add_document(document))
    }

    /// Render the active document and save it.
    pub fn export_active(&self, path: &Path) -> Result<(), CodecError> {
        let Some(doc) = self.active_document() else {
            return Err(CodecError::Io(std::io::Error::other("no open document")));
        };
        self.codec.save(path, &doc.render(None))
    }

    pub fn close_document(&mut self, index: usize) -> EditResult<Document> {
        if index >= self.documents.len() {
            return Err(EditError::InvalidIndex {
                index: index as isize,
                count: self.documents.len(),
            });
        }
        let closed = self.documents.remove(index);
        self.active = match self.active {
            _ if self.documents.is_empty() => None,
            Some(a) if a > index => Some(a - 1),
            Some(a) => Some(a.min(self.documents.len() - 1)),
            None => None,
        };
        self.drag = None;
        self.brush.end_stroke();
        debug!(index, open = self.documents.len(), "document closed");
        Ok(closed.document)
    }

    pub fn document_count(&self) -> usize {
        self.documents.len()
    }

    pub fn active_document_index(&self) -> Option<usize> {
        self.active
    }

    pub fn set_active_document(&mut self, index: usize) -> EditResult<()> {
        if index >= self.documents.len() {
            return Err(EditError::InvalidIndex {
                index: index as isize,
                count: self.documents.len(),
            });
        }
        if self.active != Some(index) {
            // A gesture never spans documents
            self.drag = None;
            self.brush.end_stroke();
        }
        self.active = Some(index);
        Ok(())
    }

    pub fn document(&self, index: usize) -> Option<&Document> {
        self.documents.get(index).map(|d| &d.document)
    }

    pub fn active_document(&self) -> Option<&Document> {
        self.active.and_then(|i| self.document(i))
    }

    pub fn active_document_mut(&mut self) -> Option<&mut Document> {
        let index = self.active?;
        self.documents.get_mut(index).map(|d| &mut d.document)
    }

    pub fn history(&self) -> Option<&CommandManager> {
        self.active.and_then(|i| self.documents.get(i)).map(|d| &d.history)
    }

    fn active_open(&mut self) -> EditResult<&mut OpenDocument> {
        let index = self.active.ok_or(EditError::NoDocument)?;
        self.documents.get_mut(index).ok_or(EditError::NoDocument)
    }

    // ------------------------------------------------------------------
    // History
    // ------------------------------------------------------------------

    pub fn execute(&mut self, command: Box<dyn Command>) -> EditResult<()> {
        let open = self.active_open()?;
        open.history.execute(command, &mut open.document)
    }

    pub fn undo(&mut self) -> EditResult<String> {
        let open = self.active_open()?;
        open.history.undo(&mut open.document)
    }

    pub fn redo(&mut self) -> EditResult<String> {
        let open = self.active_open()?;
        open.history.redo(&mut open.document)
    }

    /// Append a document-sized raster layer through history. Returns its index.
    pub fn add_layer(&mut self, name: &str) -> EditResult<usize> {
        let open = self.active_open()?;
        open.history
            .execute(Box::new(AddLayerCommand::raster(name)), &mut open.document)?;
        open.document.active_index().ok_or(EditError::NoActiveLayer)
    }

    pub fn add_text_layer(&mut self, name: &str, text: &str) -> EditResult<usize> {
        let font = self.settings.default_font.clone();
        let open = self.active_open()?;
        open.history.execute(
            Box::new(AddLayerCommand::new(name, -1, NewLayer::Text(text.to_string()))),
            &mut open.document,
        )?;
        let index = open.document.active_index().ok_or(EditError::NoActiveLayer)?;
        if let Some(layer) = open.document.layer_mut(index)
            && let Some(text) = layer.text()
        {
            let mut descriptor = text.font().clone();
            descriptor.family = font;
            layer.set_font(descriptor);
        }
        open.document.flush_layer_changes();
        Ok(index)
    }

    // ------------------------------------------------------------------
    // Tools
    // ------------------------------------------------------------------

    pub fn tool(&self) -> Tool {
        self.tool
    }

    /// Switching tools abandons an unfinished gesture.
    pub fn set_tool(&mut self, tool: Tool) {
        if tool != self.tool {
            self.cancel_gesture();
        }
        self.tool = tool;
        self.brush.set_erase(tool == Tool::Eraser);
    }

    pub fn brush(&self) -> &BrushEngine {
        &self.brush
    }

    pub fn brush_mut(&mut self) -> &mut BrushEngine {
        &mut self.brush
    }

    pub fn primary_color(&self) -> Rgba {
        self.primary_color
    }

    pub fn secondary_color(&self) -> Rgba {
        self.secondary_color
    }

    pub fn set_primary_color(&mut self, color: Rgba) {
        self.primary_color = color;
    }

    pub fn set_secondary_color(&mut self, color: Rgba) {
        self.secondary_color = color;
    }

    pub fn shape_style(&self) -> &ShapeStyle {
        &self.shape_style
    }

    pub fn set_shape_style(&mut self, style: ShapeStyle) {
        self.shape_style = style;
    }

    pub fn is_gesture_active(&self) -> bool {
        self.brush.is_stroking() || self.drag.is_some()
    }

    pub fn cancel_gesture(&mut self) {
        self.brush.end_stroke();
        self.drag = None;
    }

    /// The active layer index if it can take pixels.
    fn paintable_layer(&self) -> EditResult<usize> {
        let doc = self.active_document().ok_or(EditError::NoDocument)?;
        let index = doc.active_index().ok_or(EditError::NoActiveLayer)?;
        let layer = doc.layer(index).ok_or(EditError::NoActiveLayer)?;
        if layer.is_locked() {
            return Err(EditError::LayerLocked(layer.name().to_string()));
        }
        if !matches!(layer.content(), LayerContent::Raster(_)) {
            return Err(EditError::NotRaster(layer.name().to_string()));
        }
        Ok(index)
    }

    /// Start a gesture with the current tool on the active layer.
    pub fn tool_press(&mut self, input: ToolInput) -> EditResult<()> {
        let layer = self.paintable_layer()?;
        match self.tool {
            Tool::Brush | Tool::Eraser => {
                self.drag = None;
                self.brush.begin_stroke(input.x, input.y, input.pressure, input.tilt);
            }
            Tool::Line | Tool::Rectangle | Tool::Ellipse => {
                self.brush.end_stroke();
                self.drag = Some(Drag {
                    layer,
                    start: (input.x, input.y),
                    end: (input.x, input.y),
                    secondary: input.buttons & BUTTON_SECONDARY != 0,
                });
            }
        }
        Ok(())
    }

    /// Extend the current gesture. Returns false when none is in progress.
    pub fn tool_move(&mut self, input: ToolInput) -> bool {
        if self.brush.is_stroking() {
            return self.brush.add_point(input.x, input.y, input.pressure, input.tilt);
        }
        match self.drag.as_mut() {
            Some(drag) => {
                drag.end = (input.x, input.y);
                true
            }
            None => false,
        }
    }

    /// Finish the gesture and record it as one undo step. Returns the
    /// description of the recorded command, or `None` when no gesture was
    /// in progress.
    pub fn tool_release(&mut self, input: ToolInput) -> EditResult<Option<String>> {
        let command: Box<dyn Command> = if self.brush.is_stroking() {
            self.brush.add_point(input.x, input.y, input.pressure, input.tilt);
            let samples: Vec<BrushSample> = self.brush.samples().to_vec();
            let mode = self.brush.mode();
            self.brush.end_stroke();
            let layer = self.paintable_layer()?;
            let settings = *self.brush.settings();
            match mode {
                StampMode::Erase => Box::new(EraseCommand::new(layer, settings, samples)),
                StampMode::Paint => {
                    let color = if input.buttons & BUTTON_SECONDARY != 0 {
                        self.secondary_color
                    } else {
                        self.primary_color
                    };
                    Box::new(BrushStrokeCommand::new(layer, settings, color, samples))
                }
            }
        } else if let Some(mut drag) = self.drag.take() {
            drag.end = (input.x, input.y);
            let mut style = self.shape_style;
            style.stroke = if drag.secondary {
                self.secondary_color
            } else {
                self.primary_color
            };
            Box::new(self.shape_command(&drag, style))
        } else {
            return Ok(None);
        };

        let description = command.description();
        if let Err(e) = self.execute(command) {
            warn!(error = %e, "tool gesture not applied");
            return Err(e);
        }
        Ok(Some(description))
    }

    fn shape_command(&self, drag: &Drag, style: ShapeStyle) -> DrawShapeCommand {
        let (x0, y0) = drag.start;
        let (x1, y1) = drag.end;
        match self.tool {
            Tool::Rectangle => {
                let rect = Rect::from_points(
                    x0.min(x1).round() as i32,
                    y0.min(y1).round() as i32,
                    x0.max(x1).round() as i32 - 1,
                    y0.max(y1).round() as i32 - 1,
                );
                DrawShapeCommand::rectangle(drag.layer, rect, style)
            }
            Tool::Ellipse => DrawShapeCommand::ellipse(
                drag.layer,
                ((x0 + x1) * 0.5, (y0 + y1) * 0.5),
                ((x1 - x0).abs() * 0.5, (y1 - y0).abs() * 0.5),
                style,
            ),
            _ => DrawShapeCommand::line(drag.layer, drag.start, drag.end, style),
        }
    }

    // ------------------------------------------------------------------
    // AI
    // ------------------------------------------------------------------

    pub fn ai(&mut self) -> &mut AiClient {
        &mut self.ai
    }

    /// Send the active layer's rendered pixels to the AI service.
    pub fn submit_ai_for_active_layer(&mut self, service: ServiceType, params: ParamMap) -> Result<TaskId, AiError> {
        let pixels = self
            .active_document()
            .and_then(|doc| doc.active_index().and_then(|i| doc.render_layer(i).ok()))
            .ok_or_else(|| AiError::Backend("no active layer to process".to_string()))?;
        self.ai.submit(service, pixels, params)
    }

    /// If task `id` has finished, add its result to the active document as a
    /// new layer through history. Returns the new layer's index.
    pub fn collect_ai_result(&mut self, id: TaskId, name: &str) -> EditResult<Option<usize>> {
        // Check before taking so the result is not lost without a document
        self.active_open()?;
        let Some(pixels) = self.ai.take_result(id) else {
            return Ok(None);
        };
        let open = self.active_open()?;
        let command = AddLayerCommand::with_layer(Layer::from_image(name, pixels), -1);
        open.history.execute(Box::new(command), &mut open.document)?;
        Ok(open.document.active_index())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::{ProcessingMode, TaskState};
    use crate::brush::BrushSettings;

    fn engine() -> Engine {
        let mut engine = Engine::default();
        engine.create_document(40, 30);
        engine
    }

    fn stroke(engine: &mut Engine, from: (f32, f32), to: (f32, f32)) -> EditResult<Option<String>> {
        engine.tool_press(ToolInput::at(from.0, from.1))?;
        engine.tool_move(ToolInput::at((from.0 + to.0) * 0.5, (from.1 + to.1) * 0.5));
        engine.tool_release(ToolInput::at(to.0, to.1))
    }

    #[test]
    fn new_document_scenario() {
        let mut engine = Engine::default();
        let index = engine.create_new_document();
        let doc = engine.active_document().unwrap();
        assert_eq!(index, 0);
        assert_eq!((doc.width(), doc.height()), (800, 600));
        assert_eq!(doc.layer_count(), 1);
        assert_eq!(doc.render(None).get(799, 599), Some(Rgba::WHITE));

        assert_eq!(engine.add_layer("Layer 1").unwrap(), 1);
        let doc = engine.active_document().unwrap();
        assert_eq!(doc.layers()[1].name(), "Layer 1");
        assert_eq!(doc.active_layer_index(), 1);
    }

    #[test]
    fn brush_gesture_is_one_undo_step() {
        let mut engine = engine();
        engine.brush_mut().set_settings(BrushSettings::default().with_size(6.0).with_hardness(1.0));
        engine.add_layer("Ink").unwrap();
        let before = engine.active_document().unwrap().render(None);

        assert_eq!(stroke(&mut engine, (5.0, 5.0), (30.0, 5.0)).unwrap().as_deref(), Some("Brush Stroke"));
        assert!(!engine.is_gesture_active());
        let after = engine.active_document().unwrap().render(None);
        assert_ne!(before, after);
        assert_eq!(after.get(18, 5), Some(Rgba::BLACK));

        engine.undo().unwrap();
        assert_eq!(engine.active_document().unwrap().render(None), before);
        engine.redo().unwrap();
        assert_eq!(engine.active_document().unwrap().render(None), after);
    }

    #[test]
    fn secondary_button_paints_secondary_color() {
        let mut engine = engine();
        engine.set_secondary_color(Rgba::new(0, 0, 255, 255));
        engine.add_layer("Ink").unwrap();
        let input = ToolInput::at(10.0, 10.0).with_buttons(BUTTON_SECONDARY);
        engine.tool_press(input).unwrap();
        engine.tool_release(input).unwrap();
        assert_eq!(
            engine.active_document().unwrap().render(None).get(10, 10),
            Some(Rgba::new(0, 0, 255, 255))
        );
    }

    #[test]
    fn eraser_clears_background() {
        let mut engine = engine();
        engine.set_tool(Tool::Eraser);
        engine.brush_mut().set_settings(BrushSettings::default().with_size(8.0).with_hardness(1.0));
        assert_eq!(stroke(&mut engine, (10.0, 10.0), (20.0, 10.0)).unwrap().as_deref(), Some("Erase"));
        let doc = engine.active_document().unwrap();
        assert_eq!(doc.render(None).get(15, 10), Some(Rgba::TRANSPARENT));
    }

    #[test]
    fn shape_tools_record_commands() {
        let mut engine = engine();
        engine.set_primary_color(Rgba::new(255, 0, 0, 255));
        engine.set_shape_style(ShapeStyle {
            fill: Some(Rgba::new(0, 255, 0, 255)),
            anti_alias: false,
            ..ShapeStyle::default()
        });
        engine.set_tool(Tool::Rectangle);
        assert_eq!(stroke(&mut engine, (4.0, 4.0), (20.0, 16.0)).unwrap().as_deref(), Some("Draw Rectangle"));
        let out = engine.active_document().unwrap().render(None);
        assert_eq!(out.get(12, 10), Some(Rgba::new(0, 255, 0, 255)));

        engine.set_tool(Tool::Ellipse);
        assert_eq!(stroke(&mut engine, (22.0, 4.0), (38.0, 26.0)).unwrap().as_deref(), Some("Draw Ellipse"));
        engine.set_tool(Tool::Line);
        assert_eq!(stroke(&mut engine, (0.0, 29.0), (39.0, 29.0)).unwrap().as_deref(), Some("Draw Line"));
        assert_eq!(engine.history().unwrap().undo_count(), 3);
    }

    #[test]
    fn locked_or_adjustment_layer_refuses_press() {
        let mut engine = engine();
        engine.active_document_mut().unwrap().set_layer_locked(0, true).unwrap();
        assert!(matches!(
            engine.tool_press(ToolInput::at(1.0, 1.0)),
            Err(EditError::LayerLocked(_))
        ));
        assert!(!engine.is_gesture_active());

        let doc = engine.active_document_mut().unwrap();
        doc.add_layer(Layer::new_adjustment("Invert", crate::layer::AdjustmentKind::Invert), -1);
        doc.set_active_layer(1).unwrap();
        assert!(matches!(engine.tool_press(ToolInput::at(1.0, 1.0)), Err(EditError::NotRaster(_))));
        assert_eq!(engine.tool_release(ToolInput::at(1.0, 1.0)), Ok(None));
    }

    #[test]
    fn no_document_means_no_gesture() {
        let mut engine = Engine::default();
        assert_eq!(engine.tool_press(ToolInput::at(0.0, 0.0)), Err(EditError::NoDocument));
        assert_eq!(engine.undo(), Err(EditError::NoDocument));
        assert!(!engine.tool_move(ToolInput::at(1.0, 1.0)));
    }

    #[test]
    fn documents_have_separate_histories() {
        let mut engine = engine();
        engine.add_layer("A").unwrap();
        let second = engine.create_document(10, 10);
        assert_eq!(engine.active_document_index(), Some(second));
        assert_eq!(engine.undo(), Err(EditError::NothingToUndo));
        engine.set_active_document(0).unwrap();
        assert_eq!(engine.undo().unwrap(), "Add Layer \"A\"");
        assert!(engine.set_active_document(5).is_err());

        let closed = engine.close_document(0).unwrap();
        assert_eq!(closed.width(), 40);
        assert_eq!(engine.document_count(), 1);
        assert_eq!(engine.active_document_index(), Some(0));
    }

    #[test]
    fn switching_tools_cancels_gesture() {
        let mut engine = engine();
        engine.tool_press(ToolInput::at(3.0, 3.0)).unwrap();
        assert!(engine.is_gesture_active());
        engine.set_tool(Tool::Line);
        assert!(!engine.is_gesture_active());
        assert_eq!(engine.tool_release(ToolInput::at(5.0, 5.0)), Ok(None));
    }

    #[test]
    fn settings_flow_into_history() {
        let settings = EngineSettings {
            max_undo_steps: 2,
            ..EngineSettings::default()
        };
        let mut engine = Engine::new(settings);
        engine.create_document(8, 8);
        for name in ["a", "b", "c"] {
            engine.add_layer(name).unwrap();
        }
        assert_eq!(engine.history().unwrap().undo_count(), 2);
    }

    #[test]
    fn ai_result_lands_as_layer() {
        let settings = EngineSettings {
            ai_mode: ProcessingMode::Local,
            ..EngineSettings::default()
        };
        let mut engine = Engine::new(settings);
        engine.create_document(6, 4);
        let id = engine
            .submit_ai_for_active_layer(ServiceType::Denoising, ParamMap::new())
            .unwrap();
        let mut collected = None;
        for _ in 0..500 {
            if let Some(index) = engine.collect_ai_result(id, "Denoised").unwrap() {
                collected = Some(index);
                break;
            }
            let state = engine.ai().poll(id).map(|s| s.state);
            assert!(!matches!(state, Some(TaskState::Failed(_))));
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(collected, Some(1));
        let doc = engine.active_document().unwrap();
        assert_eq!(doc.layers()[1].name(), "Denoised");
        assert_eq!(engine.undo().unwrap(), "Add Layer \"Denoised\"");
    }

    #[test]
    fn offline_ai_is_rejected() {
        let mut engine = engine();
        assert_eq!(
            engine.submit_ai_for_active_layer(ServiceType::Upscaling, ParamMap::new()),
            Err(AiError::Offline)
        );
    }
}
