//! Document engine boundary and the session that serializes access to it.
//!
//! [`PdfEngine`] is the non-reentrant resource: load, inspect, render,
//! edit and save documents addressed by [`DocumentHandle`]. [`PdfSession`]
//! owns one engine and only ever touches it from jobs running on its
//! dispatcher, or under its serializing lock.

use image::{ImageBuffer, Rgba};
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};

mod lopdf_engine;
mod session;

#[cfg(any(test, feature = "test-fixtures"))]
pub mod fixtures;

pub use lopdf_engine::LopdfEngine;
pub use session::{Document, DocumentRegistry, Page, PdfSession, SessionError};

pub type RgbaImage = ImageBuffer<Rgba<u8>, Vec<u8>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocumentHandle(pub(crate) u64);

impl DocumentHandle {
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for DocumentHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "doc#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PageSize {
    pub width_pt: f32,
    pub height_pt: f32,
}

impl PageSize {
    /// US Letter, used when a page carries no usable MediaBox.
    pub const LETTER: PageSize = PageSize {
        width_pt: 612.0,
        height_pt: 792.0,
    };

    /// Size as displayed once `rotation` is applied.
    pub fn rotated(self, rotation: Rotation) -> PageSize {
        if rotation.is_sideways() {
            PageSize {
                width_pt: self.height_pt,
                height_pt: self.width_pt,
            }
        } else {
            self
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClipRect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderRequest {
    pub page_index: u32,
    pub scale: f32,
    pub clip: Option<ClipRect>,
}

impl Default for RenderRequest {
    fn default() -> Self {
        Self {
            page_index: 0,
            scale: 1.0,
            clip: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThumbnailSize {
    pub width_px: u32,
    pub height_px: u32,
}

impl Default for ThumbnailSize {
    fn default() -> Self {
        Self {
            width_px: 256,
            height_px: 256,
        }
    }
}

/// Clockwise page rotation in quarter turns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Rotation {
    #[default]
    None,
    Clockwise90,
    Clockwise180,
    Clockwise270,
}

impl Rotation {
    /// `0..=3`, as stored by editing front-ends.
    pub fn from_quarter_turns(turns: u8) -> Result<Self, EngineError> {
        match turns {
            0 => Ok(Self::None),
            1 => Ok(Self::Clockwise90),
            2 => Ok(Self::Clockwise180),
            3 => Ok(Self::Clockwise270),
            other => Err(EngineError::InvalidRotation(i64::from(other))),
        }
    }

    /// Accepts any multiple of 90, negative values included, as a PDF
    /// `/Rotate` entry may hold.
    pub fn from_degrees(degrees: i64) -> Result<Self, EngineError> {
        if degrees % 90 != 0 {
            return Err(EngineError::InvalidRotation(degrees));
        }
        // rem_euclid keeps the result in 0..4
        Self::from_quarter_turns((degrees / 90).rem_euclid(4) as u8)
    }

    pub fn quarter_turns(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Clockwise90 => 1,
            Self::Clockwise180 => 2,
            Self::Clockwise270 => 3,
        }
    }

    pub fn degrees(self) -> i64 {
        i64::from(self.quarter_turns()) * 90
    }

    pub fn is_sideways(self) -> bool {
        matches!(self, Self::Clockwise90 | Self::Clockwise270)
    }
}

#[derive(Debug, Clone)]
pub enum OpenSource {
    Path(PathBuf),
    Bytes(Vec<u8>),
}

impl OpenSource {
    /// Human-readable origin, used in logs and the document registry.
    pub fn describe(&self) -> String {
        match self {
            Self::Path(path) => path.display().to_string(),
            Self::Bytes(bytes) => format!("<memory: {} bytes>", bytes.len()),
        }
    }
}

impl From<PathBuf> for OpenSource {
    fn from(value: PathBuf) -> Self {
        Self::Path(value)
    }
}

impl From<&Path> for OpenSource {
    fn from(value: &Path) -> Self {
        Self::Path(value.to_path_buf())
    }
}

impl From<Vec<u8>> for OpenSource {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(value)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("PDF parse error: {0}")]
    Parse(#[from] lopdf::Error),
    #[error("invalid handle {0}")]
    InvalidHandle(u64),
    #[error("page {page} out of range (page_count={page_count})")]
    PageOutOfRange { page: u32, page_count: u32 },
    #[error("encrypted PDFs are not supported in the default backend")]
    EncryptedUnsupported,
    #[error("invalid rotation {0}: expected a multiple of 90 degrees or 0..=3 quarter turns")]
    InvalidRotation(i64),
    #[error("backend error: {0}")]
    Backend(String),
}

/// A document engine that must not be entered concurrently.
///
/// Implementations are driven from a single thread at a time by
/// [`PdfSession`]; they need `Send` but not `Sync`.
pub trait PdfEngine {
    fn open(&mut self, source: OpenSource) -> Result<DocumentHandle, EngineError>;

    /// Creates an empty document with no pages.
    fn create(&mut self) -> Result<DocumentHandle, EngineError>;

    fn page_count(&self, handle: DocumentHandle) -> Result<u32, EngineError>;
    fn page_size(&self, handle: DocumentHandle, page_index: u32) -> Result<PageSize, EngineError>;
    fn rotation(&self, handle: DocumentHandle, page_index: u32) -> Result<Rotation, EngineError>;
    fn set_rotation(
        &mut self,
        handle: DocumentHandle,
        page_index: u32,
        rotation: Rotation,
    ) -> Result<(), EngineError>;
    fn render_page(
        &self,
        handle: DocumentHandle,
        request: RenderRequest,
    ) -> Result<RgbaImage, EngineError>;
    fn render_thumbnail(
        &self,
        handle: DocumentHandle,
        page_index: u32,
        target: ThumbnailSize,
    ) -> Result<RgbaImage, EngineError>;
    fn extract_text(&self, handle: DocumentHandle, page_index: u32) -> Result<String, EngineError>;
    fn delete_page(&mut self, handle: DocumentHandle, page_index: u32) -> Result<(), EngineError>;

    /// Serializes the document, edits included, to `target`.
    fn save_to(&mut self, handle: DocumentHandle, target: &mut dyn Write)
        -> Result<(), EngineError>;

    fn close(&mut self, handle: DocumentHandle) -> Result<(), EngineError>;
}

pub fn default_engine() -> LopdfEngine {
    LopdfEngine::new()
}
