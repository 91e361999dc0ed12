//! Image normalization pipeline.
//!
//! Converts an input document (PDF or single raster image) into a sequence of
//! normalized raster pages, optionally enhanced before recognition.

pub mod steps;

use image::DynamicImage;
use lopdf::{Dictionary, Document, Object};

use crate::error::RecognitionError;
use crate::model::RecognitionConfig;

/// Raster mime types the pipeline accepts directly.
const RASTER_FORMATS: &[&str] = &[
    "image/png",
    "image/jpeg",
    "image/gif",
    "image/bmp",
    "image/webp",
    "image/tiff",
];

/// One normalized page, ready for recognition.
#[derive(Debug, Clone)]
pub struct Page {
    pub number: u32,
    pub image: DynamicImage,
}

/// A document reduced to ordered raster pages. When the source is a PDF with
/// an embedded text layer, that text is carried along so engines can skip
/// raster recognition entirely.
#[derive(Debug, Clone)]
pub struct NormalizedDocument {
    pub pages: Vec<Page>,
    pub embedded_text: Option<String>,
}

/// Normalizes input documents into enhanced raster pages.
pub struct ImagePipeline;

impl ImagePipeline {
    pub fn new() -> Self {
        Self
    }

    /// Convert raw document bytes into normalized pages.
    ///
    /// Fails with `UnsupportedFormat` when the mime type is neither a
    /// paginated document nor a raster image.
    pub fn normalize(
        &self,
        bytes: &[u8],
        mime: &str,
        config: &RecognitionConfig,
    ) -> Result<NormalizedDocument, RecognitionError> {
        if is_pdf(bytes, mime) {
            return self.normalize_pdf(bytes, config);
        }

        if RASTER_FORMATS.contains(&mime) || mime.starts_with("image/") {
            let image = image::load_from_memory(bytes).map_err(|e| {
                RecognitionError::Preprocessing(format!("Failed to decode image: {}", e))
            })?;
            let page = Page {
                number: 1,
                image: self.enhance(image, config),
            };
            return Ok(NormalizedDocument {
                pages: vec![page],
                embedded_text: None,
            });
        }

        Err(RecognitionError::UnsupportedFormat(mime.to_string()))
    }

    fn normalize_pdf(
        &self,
        bytes: &[u8],
        config: &RecognitionConfig,
    ) -> Result<NormalizedDocument, RecognitionError> {
        // A text layer beats re-recognizing rendered pages every time.
        let embedded_text = pdf_extract::extract_text_from_mem(bytes)
            .ok()
            .map(|t| t.trim().to_string())
            .filter(|t| t.len() > 10);

        let doc = Document::load_mem(bytes).map_err(|e| {
            RecognitionError::Preprocessing(format!("Failed to parse PDF: {}", e))
        })?;

        let mut pages = Vec::new();
        for (page_number, page_id) in doc.get_pages() {
            for image in page_images(&doc, page_id) {
                pages.push(Page {
                    number: page_number,
                    image: self.enhance(image, config),
                });
            }
        }

        // Some producers attach page images outside the page resource tree;
        // fall back to a whole-document scan before giving up.
        if pages.is_empty() {
            for (number, image) in scan_document_images(&doc).into_iter().enumerate() {
                pages.push(Page {
                    number: number as u32 + 1,
                    image: self.enhance(image, config),
                });
            }
        }

        if pages.is_empty() && embedded_text.is_none() {
            tracing::warn!("PDF contains neither page images nor a text layer");
        }

        Ok(NormalizedDocument {
            pages,
            embedded_text,
        })
    }

    /// Apply the configured enhancement steps. A failing step degrades to the
    /// unmodified page instead of aborting the pipeline.
    fn enhance(&self, image: DynamicImage, config: &RecognitionConfig) -> DynamicImage {
        let flags = config.enhancements;
        let mut img = image;

        if flags.resize {
            img = run_step("resize", img, |i| {
                steps::resize::apply(i, config.dpi, config.max_image_size)
            });
        }
        if flags.grayscale {
            img = run_step("grayscale", img, steps::grayscale::apply);
        }
        if flags.contrast {
            img = run_step("contrast", img, steps::contrast::apply);
        }
        if flags.denoise {
            img = run_step("denoise", img, steps::denoise::apply);
        }
        if flags.binarize {
            img = run_step("binarize", img, steps::binarize::apply);
        }

        img
    }
}

impl Default for ImagePipeline {
    fn default() -> Self {
        Self::new()
    }
}

fn run_step<F>(name: &str, img: DynamicImage, step_fn: F) -> DynamicImage
where
    F: FnOnce(DynamicImage) -> Result<DynamicImage, RecognitionError>,
{
    match step_fn(img.clone()) {
        Ok(out) => out,
        Err(e) => {
            tracing::warn!("Enhancement step '{}' failed, keeping page as-is: {}", name, e);
            img
        }
    }
}

/// Check whether the payload is a PDF, by mime type or magic bytes.
fn is_pdf(bytes: &[u8], mime: &str) -> bool {
    mime == "application/pdf" || bytes.starts_with(b"%PDF-")
}

/// Collect the raster images referenced by a single page's resource tree.
fn page_images(doc: &Document, page_id: lopdf::ObjectId) -> Vec<DynamicImage> {
    let mut images = Vec::new();

    let Ok(page) = doc.get_dictionary(page_id) else {
        return images;
    };
    let Some(resources) = page.get(b"Resources").ok().and_then(|o| resolve_dict(doc, o))
    else {
        return images;
    };
    let Some(xobjects) = resources.get(b"XObject").ok().and_then(|o| resolve_dict(doc, o))
    else {
        return images;
    };

    for (name, value) in xobjects.iter() {
        let stream = match value {
            Object::Reference(id) => doc.get_object(*id).ok().and_then(|o| o.as_stream().ok()),
            Object::Stream(s) => Some(s),
            _ => None,
        };
        let Some(stream) = stream else { continue };
        if !is_image_xobject(stream) {
            continue;
        }
        match decode_image_stream(doc, stream) {
            Ok(img) => images.push(img),
            Err(e) => {
                tracing::warn!(
                    "Failed to decode page image {:?}: {}",
                    String::from_utf8_lossy(name),
                    e
                );
            }
        }
    }

    images
}

/// Whole-document scan for image XObjects, ordered by object id.
fn scan_document_images(doc: &Document) -> Vec<DynamicImage> {
    let mut images = Vec::new();
    for (object_id, object) in doc.objects.iter() {
        if let Ok(stream) = object.as_stream() {
            if is_image_xobject(stream) {
                match decode_image_stream(doc, stream) {
                    Ok(img) => images.push(img),
                    Err(e) => {
                        tracing::warn!("Failed to decode image object {:?}: {}", object_id, e);
                    }
                }
            }
        }
    }
    images
}

fn is_image_xobject(stream: &lopdf::Stream) -> bool {
    stream
        .dict
        .get(b"Subtype")
        .ok()
        .and_then(|s| s.as_name().ok())
        .map(|n| n == b"Image")
        .unwrap_or(false)
}

fn resolve_dict<'a>(doc: &'a Document, obj: &'a Object) -> Option<&'a Dictionary> {
    match obj {
        Object::Reference(id) => doc.get_object(*id).ok()?.as_dict().ok(),
        Object::Dictionary(d) => Some(d),
        _ => None,
    }
}

/// Decode a PDF image stream into a `DynamicImage`.
fn decode_image_stream(
    doc: &Document,
    stream: &lopdf::Stream,
) -> Result<DynamicImage, RecognitionError> {
    // JPEG-encoded streams decode directly; the raw content is the JPEG file.
    if has_filter(stream, b"DCTDecode") {
        return image::load_from_memory(&stream.content).map_err(|e| {
            RecognitionError::Preprocessing(format!("Failed to decode embedded JPEG: {}", e))
        });
    }

    let width = dict_u32(stream, b"Width")
        .ok_or_else(|| RecognitionError::Preprocessing("Missing image width".to_string()))?;
    let height = dict_u32(stream, b"Height")
        .ok_or_else(|| RecognitionError::Preprocessing("Missing image height".to_string()))?;

    let data = stream.decompressed_content().map_err(|e| {
        RecognitionError::Preprocessing(format!("Failed to decompress image: {}", e))
    })?;

    let bits_per_component = stream
        .dict
        .get(b"BitsPerComponent")
        .ok()
        .and_then(|b| b.as_i64().ok())
        .unwrap_or(8) as u8;

    if bits_per_component != 8 {
        return Err(RecognitionError::Preprocessing(format!(
            "Unsupported bit depth: {}",
            bits_per_component
        )));
    }

    let color_space = color_space_name(doc, stream);
    match color_space.as_str() {
        "DeviceGray" => {
            if data.len() >= (width * height) as usize {
                image::GrayImage::from_raw(width, height, data)
                    .map(DynamicImage::ImageLuma8)
                    .ok_or_else(|| {
                        RecognitionError::Preprocessing("Invalid grayscale image data".to_string())
                    })
            } else {
                Err(RecognitionError::Preprocessing(format!(
                    "Grayscale data too short: {} < {}",
                    data.len(),
                    width * height
                )))
            }
        }
        "DeviceRGB" | "ICCBased" => {
            if data.len() >= (width * height * 3) as usize {
                image::RgbImage::from_raw(width, height, data)
                    .map(DynamicImage::ImageRgb8)
                    .ok_or_else(|| {
                        RecognitionError::Preprocessing("Invalid RGB image data".to_string())
                    })
            } else {
                Err(RecognitionError::Preprocessing(format!(
                    "RGB data too short: {} < {}",
                    data.len(),
                    width * height * 3
                )))
            }
        }
        "DeviceCMYK" => {
            if data.len() >= (width * height * 4) as usize {
                let rgb_data = cmyk_to_rgb(&data);
                image::RgbImage::from_raw(width, height, rgb_data)
                    .map(DynamicImage::ImageRgb8)
                    .ok_or_else(|| {
                        RecognitionError::Preprocessing("Invalid CMYK image data".to_string())
                    })
            } else {
                Err(RecognitionError::Preprocessing(format!(
                    "CMYK data too short: {} < {}",
                    data.len(),
                    width * height * 4
                )))
            }
        }
        other => Err(RecognitionError::Preprocessing(format!(
            "Unsupported color space: {}",
            other
        ))),
    }
}

fn has_filter(stream: &lopdf::Stream, filter: &[u8]) -> bool {
    match stream.dict.get(b"Filter") {
        Ok(obj) => match obj {
            Object::Name(name) => name.as_slice() == filter,
            Object::Array(filters) => filters
                .iter()
                .any(|f| f.as_name().map(|n| n == filter).unwrap_or(false)),
            _ => false,
        },
        Err(_) => false,
    }
}

fn dict_u32(stream: &lopdf::Stream, key: &[u8]) -> Option<u32> {
    stream
        .dict
        .get(key)
        .ok()
        .and_then(|v| v.as_i64().ok())
        .map(|v| v as u32)
}

fn cmyk_to_rgb(data: &[u8]) -> Vec<u8> {
    let mut rgb = Vec::with_capacity(data.len() / 4 * 3);
    for chunk in data.chunks_exact(4) {
        let c = chunk[0] as f32 / 255.0;
        let m = chunk[1] as f32 / 255.0;
        let y = chunk[2] as f32 / 255.0;
        let k = chunk[3] as f32 / 255.0;
        rgb.push(((1.0 - c) * (1.0 - k) * 255.0) as u8);
        rgb.push(((1.0 - m) * (1.0 - k) * 255.0) as u8);
        rgb.push(((1.0 - y) * (1.0 - k) * 255.0) as u8);
    }
    rgb
}

/// Resolve the color space name of an image stream, following indirect
/// references and `[/ICCBased ref]` arrays.
fn color_space_name(doc: &Document, stream: &lopdf::Stream) -> String {
    let cs_obj = match stream.dict.get(b"ColorSpace") {
        Ok(obj) => obj,
        Err(_) => return "DeviceRGB".to_string(),
    };

    fn name_of(doc: &Document, obj: &Object) -> Option<String> {
        match obj {
            Object::Name(name) => Some(String::from_utf8_lossy(name).to_string()),
            Object::Reference(id) => name_of(doc, doc.get_object(*id).ok()?),
            Object::Array(array) => name_of(doc, array.first()?),
            _ => None,
        }
    }

    name_of(doc, cs_obj).unwrap_or_else(|| "DeviceRGB".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use std::io::Cursor;

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = RgbImage::from_pixel(width, height, Rgb([200, 200, 200]));
        let mut bytes = Vec::new();
        DynamicImage::ImageRgb8(img)
            .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
            .unwrap();
        bytes
    }

    fn test_config() -> RecognitionConfig {
        let mut config = RecognitionConfig::baseline();
        // Keep the test images tiny; skip the upscaling resize.
        config.enhancements.resize = false;
        config
    }

    #[test]
    fn raster_image_yields_single_page() {
        let pipeline = ImagePipeline::new();
        let doc = pipeline
            .normalize(&png_bytes(20, 10), "image/png", &test_config())
            .unwrap();
        assert_eq!(doc.pages.len(), 1);
        assert_eq!(doc.pages[0].number, 1);
        assert!(doc.embedded_text.is_none());
    }

    #[test]
    fn grayscale_flag_converts_page() {
        let pipeline = ImagePipeline::new();
        let doc = pipeline
            .normalize(&png_bytes(20, 10), "image/png", &test_config())
            .unwrap();
        assert!(matches!(
            doc.pages[0].image,
            DynamicImage::ImageLuma8(_)
        ));
    }

    #[test]
    fn unknown_mime_is_unsupported() {
        let pipeline = ImagePipeline::new();
        let err = pipeline
            .normalize(b"hello", "text/plain", &test_config())
            .unwrap_err();
        assert!(matches!(err, RecognitionError::UnsupportedFormat(_)));
    }

    #[test]
    fn pdf_magic_overrides_mime() {
        let pipeline = ImagePipeline::new();
        // %PDF- magic but garbage body: routed to the PDF path, which then
        // fails to parse rather than being rejected as unsupported.
        let err = pipeline
            .normalize(b"%PDF-1.4 garbage", "application/octet-stream", &test_config())
            .unwrap_err();
        assert!(matches!(err, RecognitionError::Preprocessing(_)));
    }

    #[test]
    fn corrupt_image_is_preprocessing_error() {
        let pipeline = ImagePipeline::new();
        let err = pipeline
            .normalize(b"not a png", "image/png", &test_config())
            .unwrap_err();
        assert!(matches!(err, RecognitionError::Preprocessing(_)));
    }
}
