//! Small PDFs generated on the fly for tests.

use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Document, Object, Stream};
use std::fs;
use std::path::{Path, PathBuf};

use crate::EngineError;

pub const PAGE_WIDTH: f32 = 612.0;
pub const PAGE_HEIGHT: f32 = 792.0;

/// Builds a PDF with one page per entry, each showing that entry's text.
pub fn sample_pdf(pages: &[&str]) -> Result<Vec<u8>, EngineError> {
    let mut document = Document::with_version("1.5");
    let pages_id = document.new_object_id();

    let font_id = document.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Helvetica",
        "Encoding" => "WinAnsiEncoding",
    });

    let mut kids = Vec::with_capacity(pages.len());
    for text in pages {
        let content = Content {
            operations: vec![
                Operation::new("BT", vec![]),
                Operation::new("Tf", vec!["F1".into(), 24.into()]),
                Operation::new("Td", vec![72.into(), 700.into()]),
                Operation::new("Tj", vec![Object::string_literal(*text)]),
                Operation::new("ET", vec![]),
            ],
        };
        let content_id = document.add_object(Stream::new(dictionary! {}, content.encode()?));
        let page_id = document.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
            "MediaBox" => vec![0.into(), 0.into(), PAGE_WIDTH.into(), PAGE_HEIGHT.into()],
            "Resources" => dictionary! {
                "Font" => dictionary! { "F1" => font_id },
            },
        });
        kids.push(Object::Reference(page_id));
    }

    let page_count = kids.len() as i64;
    document.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => page_count,
        }),
    );

    let catalog_id = document.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    document.trailer.set("Root", catalog_id);

    let mut bytes = Vec::new();
    document.save_to(&mut bytes)?;
    Ok(bytes)
}

/// A parseable PDF carrying an `/Encrypt` marker.
pub fn encrypted_marker_pdf() -> Result<Vec<u8>, EngineError> {
    let mut bytes = sample_pdf(&["secret"])?;
    bytes.extend_from_slice(b"\n% /Encrypt\n");
    Ok(bytes)
}

pub fn invalid_pdf() -> Vec<u8> {
    b"this is not a pdf".to_vec()
}

/// Writes [`sample_pdf`] to `dir/name` and returns the path.
pub fn write_sample(dir: &Path, name: &str, pages: &[&str]) -> Result<PathBuf, EngineError> {
    let path = dir.join(name);
    fs::write(&path, sample_pdf(pages)?)?;
    Ok(path)
}
