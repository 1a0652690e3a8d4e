//! Error types shared across the engine.
//!
//! Every mutating call on a [`Document`](crate::document::Document) or the
//! [`CommandManager`](crate::command::CommandManager) reports failure through
//! these enums instead of panicking. A failed call leaves the document as it
//! was before the call.

use thiserror::Error;

/// Pixel access and buffer-shape errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PixelError {
    #[error("pixel ({x}, {y}) outside {width}x{height} buffer")]
    OutOfBounds {
        x: i64,
        y: i64,
        width: u32,
        height: u32,
    },

    #[error("buffer length {actual} does not match {width}x{height}x4 = {expected}")]
    SizeMismatch {
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },
}

/// Errors raised by document, layer and command operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EditError {
    #[error("layer index {index} out of range (layer count {count})")]
    InvalidIndex { index: isize, count: usize },

    #[error("no active layer")]
    NoActiveLayer,

    #[error("no open document")]
    NoDocument,

    #[error("layer '{0}' is not a raster layer")]
    NotRaster(String),

    #[error("layer '{0}' is locked")]
    LayerLocked(String),

    #[error(transparent)]
    Pixel(#[from] PixelError),

    #[error("nothing to undo")]
    NothingToUndo,

    #[error("nothing to redo")]
    NothingToRedo,

    #[error("command failed: {0}")]
    CommandFailed(String),

    #[error("no command group is open")]
    GroupNotOpen,
}

pub type EditResult<T> = Result<T, EditError>;

/// Codec failures when loading or saving a pixel buffer.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("image codec error: {0}")]
    Image(#[from] image::ImageError),

    #[error("cannot save images as '.{0}'")]
    UnsupportedFormat(String),

    #[error("encoded image has an invalid size {width}x{height}")]
    InvalidSize { width: u32, height: u32 },
}

/// Errors from the asynchronous AI boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AiError {
    #[error("AI service is offline")]
    Offline,

    #[error("unknown AI task {0}")]
    UnknownTask(String),

    #[error("task {0} already has a request in flight")]
    AlreadyRunning(String),

    #[error("service {0} is not supported by this backend")]
    Unsupported(String),

    #[error("too many concurrent AI tasks (limit {0})")]
    Busy(usize),

    #[error("AI worker thread is gone")]
    WorkerGone,

    #[error("AI backend failed: {0}")]
    Backend(String),
}

/// Settings file errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no settings directory available on this platform")]
    NoConfigDir,

    #[error("line {line}: invalid value '{value}' for '{key}'")]
    Parse {
        line: usize,
        key: String,
        value: String,
    },
}
