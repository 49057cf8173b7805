//! PDF assembly for rendered pages.
//!
//! A [`ChunkDocument`] receives rendered page JPEGs one at a time and embeds
//! each as a full-page image. [`merge_documents`] concatenates serialized
//! chunk documents in order.

use std::io::Cursor;

use image::codecs::jpeg::JpegDecoder;
use image::{ColorType, ImageDecoder};
use lopdf::{dictionary, Document, Object, ObjectId, Stream};
use tracing::debug;

use crate::error::ExportError;

const PDF_VERSION: &str = "1.7";
const PAGE_IMAGE_NAME: &str = "Im0";

/// Summary of one page of a serialized document.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PageSummary {
    pub media_box: (f32, f32),
    pub image_width: i64,
    pub image_height: i64,
}

/// Output document for a single chunk.
pub struct ChunkDocument {
    doc: Document,
    pages_id: ObjectId,
    kids: Vec<Object>,
    page_width_pt: f64,
    page_height_pt: f64,
}

impl ChunkDocument {
    pub fn new(page_size_pt: (f64, f64)) -> Self {
        let mut doc = Document::with_version(PDF_VERSION);
        let pages_id = doc.new_object_id();
        Self {
            doc,
            pages_id,
            kids: Vec::new(),
            page_width_pt: page_size_pt.0,
            page_height_pt: page_size_pt.1,
        }
    }

    pub fn page_count(&self) -> usize {
        self.kids.len()
    }

    /// Appends one page showing `jpeg` stretched over the physical page.
    ///
    /// Only 8-bit grayscale and RGB JPEGs are accepted, since the bytes are
    /// passed through to the PDF unchanged.
    pub fn embed_jpeg(&mut self, jpeg: &[u8]) -> Result<(), String> {
        let decoder = JpegDecoder::new(Cursor::new(jpeg)).map_err(|e| e.to_string())?;
        let (width, height) = decoder.dimensions();
        let color_space = match decoder.color_type() {
            ColorType::L8 => "DeviceGray",
            ColorType::Rgb8 => "DeviceRGB",
            other => return Err(format!("unsupported JPEG color type {:?}", other)),
        };

        let image = Stream::new(
            dictionary! {
                "Type" => "XObject",
                "Subtype" => "Image",
                "Width" => i64::from(width),
                "Height" => i64::from(height),
                "ColorSpace" => color_space,
                "BitsPerComponent" => 8,
                "Filter" => "DCTDecode",
            },
            jpeg.to_vec(),
        );
        let image_id = self.doc.add_object(image);

        let content = format!(
            "q {:.3} 0 0 {:.3} 0 0 cm /{} Do Q\n",
            self.page_width_pt, self.page_height_pt, PAGE_IMAGE_NAME
        );
        let content_id = self
            .doc
            .add_object(Stream::new(dictionary! {}, content.into_bytes()));

        let page_id = self.doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => self.pages_id,
            "MediaBox" => vec![
                Object::Integer(0),
                Object::Integer(0),
                Object::Real(self.page_width_pt as f32),
                Object::Real(self.page_height_pt as f32),
            ],
            "Contents" => content_id,
            "Resources" => dictionary! {
                "XObject" => dictionary! {
                    PAGE_IMAGE_NAME => image_id,
                },
            },
        });
        self.kids.push(Object::Reference(page_id));
        Ok(())
    }

    /// Serializes the document.
    pub fn finish(self) -> Result<Vec<u8>, String> {
        let Self {
            mut doc,
            pages_id,
            kids,
            ..
        } = self;
        let count = kids.len() as i64;
        serialize(&mut doc, pages_id, kids, count)
    }
}

fn serialize(
    doc: &mut Document,
    pages_id: ObjectId,
    kids: Vec<Object>,
    count: i64,
) -> Result<Vec<u8>, String> {
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => count,
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);
    // Source catalogs and page trees of merged documents are unreachable now.
    doc.prune_objects();

    let mut bytes = Vec::new();
    doc.save_to(&mut bytes).map_err(|e| e.to_string())?;
    Ok(bytes)
}

/// Concatenates serialized documents, keeping document and page order.
pub fn merge_documents(documents: &[Vec<u8>]) -> Result<Vec<u8>, ExportError> {
    if documents.is_empty() {
        return Err(ExportError::Merge("no chunk documents to merge".to_string()));
    }

    let mut merged = Document::with_version(PDF_VERSION);
    let pages_id = merged.new_object_id();
    let mut kids = Vec::new();

    for (index, bytes) in documents.iter().enumerate() {
        let mut src = Document::load_mem(bytes)
            .map_err(|e| ExportError::Merge(format!("chunk {} is not a valid PDF: {}", index, e)))?;
        src.renumber_objects_with(merged.max_id + 1);

        let page_ids: Vec<ObjectId> = src.get_pages().values().copied().collect();
        merged.max_id = merged.max_id.max(src.max_id);
        merged.objects.extend(src.objects);

        for page_id in page_ids {
            let page = merged
                .get_object_mut(page_id)
                .and_then(Object::as_dict_mut)
                .map_err(|e| ExportError::Merge(format!("chunk {} page lookup failed: {}", index, e)))?;
            page.set("Parent", pages_id);
            kids.push(Object::Reference(page_id));
        }
        debug!(chunk = index, pages_total = kids.len(), "Merged chunk document");
    }

    let count = kids.len() as i64;
    serialize(&mut merged, pages_id, kids, count).map_err(ExportError::Merge)
}

/// Lists the pages of a serialized document with their embedded page image size.
pub fn inspect_pages(bytes: &[u8]) -> Result<Vec<PageSummary>, lopdf::Error> {
    let doc = Document::load_mem(bytes)?;
    let mut pages = Vec::new();

    for page_id in doc.get_pages().into_values() {
        let page = doc.get_dictionary(page_id)?;
        let media_box = page.get(b"MediaBox")?.as_array()?;
        let (Some(width), Some(height)) = (media_box.get(2), media_box.get(3)) else {
            return Err(lopdf::Error::ObjectType {
                expected: "four-entry MediaBox",
                found: "short array",
            });
        };
        let width = number(width)?;
        let height = number(height)?;

        let resources = page.get(b"Resources")?.as_dict()?;
        let xobjects = resources.get(b"XObject")?.as_dict()?;
        let image_id = xobjects.get(PAGE_IMAGE_NAME.as_bytes())?.as_reference()?;
        let image = doc.get_object(image_id)?.as_stream()?;

        pages.push(PageSummary {
            media_box: (width, height),
            image_width: image.dict.get(b"Width")?.as_i64()?,
            image_height: image.dict.get(b"Height")?.as_i64()?,
        });
    }
    Ok(pages)
}

fn number(object: &Object) -> Result<f32, lopdf::Error> {
    match object {
        Object::Integer(value) => Ok(*value as f32),
        other => other.as_float(),
    }
}
