//! Layered image composition and non-destructive editing.
//!
//! A [`document::Document`] holds an ordered layer stack (raster, adjustment,
//! text and group layers) and renders it through [`compositor`]. Edits go
//! through [`command::CommandManager`] for undo/redo, and [`engine::Engine`]
//! ties documents, tools, codecs and the AI client together.

pub mod accel;
pub mod ai;
pub mod blend;
pub mod brush;
pub mod cli;
pub mod codec;
pub mod command;
pub mod compositor;
pub mod config;
pub mod document;
pub mod engine;
pub mod error;
pub mod layer;
pub mod logger;
pub mod params;
pub mod pixel;
pub mod shapes;

pub use blend::BlendMode;
pub use document::Document;
pub use engine::Engine;
pub use error::{EditError, EditResult};
pub use layer::Layer;
pub use pixel::{PixelBuffer, Rect, Rgba};
