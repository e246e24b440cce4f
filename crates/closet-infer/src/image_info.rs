//! Format and dimensions of uploaded images and crops.

use std::io::Cursor;

use image::{ImageFormat, ImageReader};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageInfo {
    pub format: ImageFormat,
    pub width: u32,
    pub height: u32,
}

impl ImageInfo {
    /// Short upper-case name stored on image rows.
    pub fn format_name(&self) -> &'static str {
        match self.format {
            ImageFormat::Png => "PNG",
            ImageFormat::Jpeg => "JPEG",
            _ => "UNKNOWN",
        }
    }

    pub fn mime_type(&self) -> &'static str {
        self.format.to_mime_type()
    }
}

/// Read format and size of a PNG or JPEG from its header.
///
/// Only the header is parsed; pixel data is never decoded.
pub fn sniff_image(bytes: &[u8]) -> Option<ImageInfo> {
    let reader = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .ok()?;
    let format = reader.format()?;
    if !matches!(format, ImageFormat::Png | ImageFormat::Jpeg) {
        return None;
    }
    let (width, height) = reader.into_dimensions().ok()?;
    Some(ImageInfo {
        format,
        width,
        height,
    })
}
