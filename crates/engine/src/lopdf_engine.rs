use image::Rgba;
use lopdf::{dictionary, Document, Object, ObjectId};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io::Write;
use tracing::debug;

use crate::{
    DocumentHandle, EngineError, OpenSource, PageSize, PdfEngine, RenderRequest, RgbaImage,
    Rotation, ThumbnailSize,
};

/// Page tree attributes are looked up at most this many levels up.
const MAX_INHERITANCE_DEPTH: usize = 32;

const BORDER: Rgba<u8> = Rgba([220, 220, 220, 255]);

/// Pure-Rust engine on top of `lopdf`.
///
/// Geometry, rotation, text, page deletion and saving are real; rendering
/// produces a blank page of the right size with a light border.
#[derive(Default)]
pub struct LopdfEngine {
    next_handle: u64,
    docs: HashMap<DocumentHandle, Document>,
}

impl LopdfEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of documents currently open.
    pub fn open_documents(&self) -> usize {
        self.docs.len()
    }

    fn load(bytes: &[u8]) -> Result<Document, EngineError> {
        if bytes.windows("/Encrypt".len()).any(|window| window == b"/Encrypt") {
            return Err(EngineError::EncryptedUnsupported);
        }

        let document = Document::load_mem(bytes)?;
        if document.get_pages().is_empty() {
            return Err(EngineError::Backend("document has no pages".to_owned()));
        }

        Ok(document)
    }

    fn insert(&mut self, document: Document) -> DocumentHandle {
        self.next_handle += 1;
        let handle = DocumentHandle(self.next_handle);
        self.docs.insert(handle, document);
        handle
    }

    fn document(&self, handle: DocumentHandle) -> Result<&Document, EngineError> {
        self.docs.get(&handle).ok_or(EngineError::InvalidHandle(handle.raw()))
    }

    fn document_mut(&mut self, handle: DocumentHandle) -> Result<&mut Document, EngineError> {
        self.docs.get_mut(&handle).ok_or(EngineError::InvalidHandle(handle.raw()))
    }

    fn page_id(document: &Document, page_index: u32) -> Result<ObjectId, EngineError> {
        let pages = document.get_pages();
        pages.get(&(page_index + 1)).copied().ok_or(EngineError::PageOutOfRange {
            page: page_index,
            page_count: pages.len() as u32,
        })
    }

    /// Looks `key` up on the page, then on its ancestors in the page tree.
    fn inherited<'a>(document: &'a Document, page_id: ObjectId, key: &[u8]) -> Option<&'a Object> {
        let mut current = page_id;
        for _ in 0..MAX_INHERITANCE_DEPTH {
            let dict = document.get_dictionary(current).ok()?;
            if let Ok(value) = dict.get(key) {
                return Some(value);
            }
            current = dict.get(b"Parent").ok()?.as_reference().ok()?;
        }
        None
    }

    fn media_box_size(media_box: &Object) -> Option<PageSize> {
        let array = media_box.as_array().ok()?;
        if array.len() != 4 {
            return None;
        }
        let x0 = array[0].as_float().ok()?;
        let y0 = array[1].as_float().ok()?;
        let x1 = array[2].as_float().ok()?;
        let y1 = array[3].as_float().ok()?;
        Some(PageSize {
            width_pt: (x1 - x0).abs(),
            height_pt: (y1 - y0).abs(),
        })
    }
}

impl fmt::Debug for LopdfEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LopdfEngine")
            .field("next_handle", &self.next_handle)
            .field("open_documents", &self.docs.len())
            .finish()
    }
}

impl PdfEngine for LopdfEngine {
    fn open(&mut self, source: OpenSource) -> Result<DocumentHandle, EngineError> {
        let bytes = match source {
            OpenSource::Path(path) => fs::read(path)?,
            OpenSource::Bytes(bytes) => bytes,
        };

        let document = Self::load(&bytes)?;
        let handle = self.insert(document);
        debug!(%handle, "document opened");

        Ok(handle)
    }

    fn create(&mut self) -> Result<DocumentHandle, EngineError> {
        let mut document = Document::with_version("1.5");
        let pages_id = document.add_object(dictionary! {
            "Type" => "Pages",
            "Kids" => Vec::<Object>::new(),
            "Count" => 0,
        });
        let catalog_id = document.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        document.trailer.set("Root", catalog_id);

        let handle = self.insert(document);
        debug!(%handle, "document created");

        Ok(handle)
    }

    fn page_count(&self, handle: DocumentHandle) -> Result<u32, EngineError> {
        Ok(self.document(handle)?.get_pages().len() as u32)
    }

    fn page_size(&self, handle: DocumentHandle, page_index: u32) -> Result<PageSize, EngineError> {
        let document = self.document(handle)?;
        let page_id = Self::page_id(document, page_index)?;

        Ok(Self::inherited(document, page_id, b"MediaBox")
            .and_then(Self::media_box_size)
            .unwrap_or(PageSize::LETTER))
    }

    fn rotation(&self, handle: DocumentHandle, page_index: u32) -> Result<Rotation, EngineError> {
        let document = self.document(handle)?;
        let page_id = Self::page_id(document, page_index)?;

        match Self::inherited(document, page_id, b"Rotate") {
            Some(rotate) => Rotation::from_degrees(rotate.as_i64()?),
            None => Ok(Rotation::None),
        }
    }

    fn set_rotation(
        &mut self,
        handle: DocumentHandle,
        page_index: u32,
        rotation: Rotation,
    ) -> Result<(), EngineError> {
        let document = self.document_mut(handle)?;
        let page_id = Self::page_id(document, page_index)?;

        document.get_object_mut(page_id)?.as_dict_mut()?.set("Rotate", rotation.degrees());
        Ok(())
    }

    fn render_page(
        &self,
        handle: DocumentHandle,
        request: RenderRequest,
    ) -> Result<RgbaImage, EngineError> {
        let rotation = self.rotation(handle, request.page_index)?;
        let page_size = self.page_size(handle, request.page_index)?.rotated(rotation);
        let scale = if request.scale <= 0.0 {
            1.0
        } else {
            request.scale
        };

        let mut width = (page_size.width_pt * scale).round().max(1.0) as u32;
        let mut height = (page_size.height_pt * scale).round().max(1.0) as u32;

        if let Some(clip) = request.clip {
            width = (clip.width * scale).round().max(1.0) as u32;
            height = (clip.height * scale).round().max(1.0) as u32;
        }

        let mut image = RgbaImage::from_pixel(width, height, Rgba([255, 255, 255, 255]));

        if width >= 4 && height >= 4 {
            for x in 0..width {
                image.put_pixel(x, 0, BORDER);
                image.put_pixel(x, height - 1, BORDER);
            }
            for y in 0..height {
                image.put_pixel(0, y, BORDER);
                image.put_pixel(width - 1, y, BORDER);
            }
        }

        Ok(image)
    }

    fn render_thumbnail(
        &self,
        handle: DocumentHandle,
        page_index: u32,
        target: ThumbnailSize,
    ) -> Result<RgbaImage, EngineError> {
        let request = RenderRequest {
            page_index,
            scale: 0.25,
            clip: None,
        };
        let page = self.render_page(handle, request)?;

        Ok(image::imageops::thumbnail(
            &page,
            target.width_px.max(1),
            target.height_px.max(1),
        ))
    }

    fn extract_text(&self, handle: DocumentHandle, page_index: u32) -> Result<String, EngineError> {
        let document = self.document(handle)?;
        Self::page_id(document, page_index)?;

        Ok(document.extract_text(&[page_index + 1])?)
    }

    fn delete_page(&mut self, handle: DocumentHandle, page_index: u32) -> Result<(), EngineError> {
        let document = self.document_mut(handle)?;
        Self::page_id(document, page_index)?;

        document.delete_pages(&[page_index + 1]);
        debug!(%handle, page = page_index, "page deleted");
        Ok(())
    }

    fn save_to(
        &mut self,
        handle: DocumentHandle,
        mut target: &mut dyn Write,
    ) -> Result<(), EngineError> {
        self.document_mut(handle)?.save_to(&mut target)?;
        Ok(())
    }

    fn close(&mut self, handle: DocumentHandle) -> Result<(), EngineError> {
        self.docs.remove(&handle).ok_or(EngineError::InvalidHandle(handle.raw()))?;
        debug!(%handle, "document closed");
        Ok(())
    }
}
